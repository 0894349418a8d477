//! Anthropic Messages dialect.
//!
//! The inbound half synthesizes the full Anthropic SSE event sequence
//! (`message_start` → `content_block_*` → `message_delta` → `message_stop`)
//! from canonical deltas; the outbound half speaks `POST /v1/messages` with
//! `x-api-key` auth and tags usage as Anthropic so pricing can account for
//! cache reads and writes separately.

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Inbound, Outbound, join_base_url, parse_url, sse_event_frame};
use crate::protocol::{
    ChatRequest, ChatResponse, Choice, ContentPart, DataUrl, FinishReason, FunctionCall,
    ImageUrl, Message, MessageContent, OBJECT_CHUNK, OBJECT_COMPLETION, PromptTokensDetails, Role,
    StopSequences, StreamAssembler, ToolCall, Usage,
};
use crate::{RelayError, Result};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Deserialize)]
struct MessagesRequest {
    model: String,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    system: Option<SystemPrompt>,
    #[serde(default)]
    messages: Vec<InMessage>,
    #[serde(default)]
    tools: Vec<InTool>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    top_k: Option<u32>,
    #[serde(default)]
    stop_sequences: Vec<String>,
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SystemPrompt {
    Text(String),
    Blocks(Vec<InBlock>),
}

#[derive(Debug, Deserialize)]
struct InMessage {
    role: String,
    content: InContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InContent {
    Text(String),
    Blocks(Vec<InBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<InContent>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Deserialize)]
struct InTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Value,
}

fn content_text(content: &InContent) -> String {
    match content {
        InContent::Text(text) => text.clone(),
        InContent::Blocks(blocks) => {
            let mut out = String::new();
            for block in blocks {
                if let InBlock::Text { text } = block {
                    out.push_str(text);
                }
            }
            out
        }
    }
}

fn stop_reason(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop => "end_turn",
        FinishReason::Length => "max_tokens",
        FinishReason::ToolCalls => "tool_use",
        FinishReason::ContentFilter => "refusal",
    }
}

fn finish_reason(stop: &str) -> FinishReason {
    match stop {
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn usage_json(usage: &Usage) -> Value {
    let mut out = json!({
        "input_tokens": usage.prompt_tokens,
        "output_tokens": usage.completion_tokens,
    });
    let cached = usage.cached_tokens();
    if cached > 0 {
        out["cache_read_input_tokens"] = json!(cached);
    }
    if usage.cache_creation_input_tokens > 0 {
        out["cache_creation_input_tokens"] = json!(usage.cache_creation_input_tokens);
    }
    out
}

fn message_content_json(message: &Message) -> Result<Vec<Value>> {
    let mut blocks = Vec::new();
    if let Some(content) = &message.content {
        let text = content.as_text();
        if !text.is_empty() {
            blocks.push(json!({"type": "text", "text": text}));
        }
    }
    for call in &message.tool_calls {
        let input: Value =
            serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.function.name,
            "input": input,
        }));
    }
    Ok(blocks)
}

#[derive(Default)]
pub struct AnthropicInbound {
    assembler: StreamAssembler,
    response: Option<ChatResponse>,
    message_started: bool,
    text_block_open: bool,
    tool_block_open: bool,
    block_index: usize,
    finish_sent: bool,
}

impl AnthropicInbound {
    fn close_block(&mut self, frames: &mut Vec<u8>) {
        if self.text_block_open || self.tool_block_open {
            let stop = json!({"type": "content_block_stop", "index": self.block_index});
            frames.extend(sse_event_frame(
                "content_block_stop",
                stop.to_string().as_bytes(),
            ));
            self.block_index += 1;
            self.text_block_open = false;
            self.tool_block_open = false;
        }
    }

    fn ensure_message_start(&mut self, chunk: &ChatResponse, frames: &mut Vec<u8>) {
        if self.message_started {
            return;
        }
        self.message_started = true;
        let usage = chunk.usage.unwrap_or_default();
        let start = json!({
            "type": "message_start",
            "message": {
                "id": chunk.id.clone().unwrap_or_else(|| "msg_stream".to_string()),
                "type": "message",
                "role": "assistant",
                "model": chunk.model.clone().unwrap_or_default(),
                "content": [],
                "stop_reason": Value::Null,
                "usage": usage_json(&usage),
            }
        });
        frames.extend(sse_event_frame("message_start", start.to_string().as_bytes()));
    }
}

impl Inbound for AnthropicInbound {
    fn transform_request(&mut self, body: &[u8]) -> Result<ChatRequest> {
        let parsed: MessagesRequest = serde_json::from_slice(body)
            .map_err(|err| RelayError::InvalidInput(format!("invalid messages body: {err}")))?;

        let mut messages = Vec::new();
        if let Some(system) = &parsed.system {
            let text = match system {
                SystemPrompt::Text(text) => text.clone(),
                SystemPrompt::Blocks(blocks) => {
                    let mut out = String::new();
                    for block in blocks {
                        if let InBlock::Text { text } = block {
                            out.push_str(text);
                        }
                    }
                    out
                }
            };
            if !text.is_empty() {
                messages.push(Message::text(Role::System, text));
            }
        }

        for message in &parsed.messages {
            let role = match message.role.as_str() {
                "assistant" => Role::Assistant,
                _ => Role::User,
            };
            match &message.content {
                InContent::Text(text) => messages.push(Message::text(role, text.clone())),
                InContent::Blocks(blocks) => {
                    let mut parts = Vec::new();
                    let mut tool_calls = Vec::new();
                    for block in blocks {
                        match block {
                            InBlock::Text { text } => {
                                parts.push(ContentPart::Text { text: text.clone() })
                            }
                            InBlock::Image { source } => {
                                let url = match source {
                                    ImageSource::Base64 { media_type, data } => {
                                        format!("data:{media_type};base64,{data}")
                                    }
                                    ImageSource::Url { url } => url.clone(),
                                };
                                parts.push(ContentPart::ImageUrl {
                                    image_url: ImageUrl { url },
                                });
                            }
                            InBlock::ToolUse { id, name, input } => {
                                tool_calls.push(ToolCall {
                                    index: tool_calls.len(),
                                    id: id.clone(),
                                    kind: "function".to_string(),
                                    function: FunctionCall {
                                        name: name.clone(),
                                        arguments: input.to_string(),
                                    },
                                });
                            }
                            InBlock::ToolResult {
                                tool_use_id,
                                content,
                            } => {
                                messages.push(Message {
                                    role: Role::Tool,
                                    content: Some(MessageContent::Text(
                                        content.as_ref().map(content_text).unwrap_or_default(),
                                    )),
                                    tool_call_id: Some(tool_use_id.clone()),
                                    tool_calls: Vec::new(),
                                    reasoning_content: None,
                                });
                            }
                            InBlock::Other => {}
                        }
                    }
                    if !parts.is_empty() || !tool_calls.is_empty() {
                        messages.push(Message {
                            role,
                            content: (!parts.is_empty()).then_some(MessageContent::Parts(parts)),
                            tool_call_id: None,
                            tool_calls,
                            reasoning_content: None,
                        });
                    }
                }
            }
        }

        let tools = parsed
            .tools
            .iter()
            .map(|tool| crate::protocol::Tool {
                kind: "function".to_string(),
                function: crate::protocol::FunctionDeclaration {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect();

        let mut request = ChatRequest {
            model: parsed.model,
            messages,
            temperature: parsed.temperature,
            top_p: parsed.top_p,
            max_tokens: parsed.max_tokens,
            stop: (!parsed.stop_sequences.is_empty())
                .then_some(StopSequences::Many(parsed.stop_sequences)),
            tools,
            stream: parsed.stream,
            ..ChatRequest::default()
        };
        if let Some(top_k) = parsed.top_k {
            request.metadata.insert("top_k".to_string(), top_k.to_string());
        }
        Ok(request)
    }

    fn transform_response(&mut self, response: &ChatResponse) -> Result<Vec<u8>> {
        self.response = Some(response.clone());

        let choice = response.choices.first();
        let content = match choice.and_then(|c| c.message.as_ref()) {
            Some(message) => message_content_json(message)?,
            None => Vec::new(),
        };
        let reason = choice
            .and_then(|c| c.finish_reason)
            .map(stop_reason)
            .unwrap_or("end_turn");
        let usage = response.usage.unwrap_or_default();

        let body = json!({
            "id": response.id.clone().unwrap_or_else(|| "msg_relay".to_string()),
            "type": "message",
            "role": "assistant",
            "model": response.model.clone().unwrap_or_default(),
            "content": content,
            "stop_reason": reason,
            "stop_sequence": Value::Null,
            "usage": usage_json(&usage),
        });
        Ok(serde_json::to_vec(&body)?)
    }

    fn transform_stream(&mut self, chunk: &ChatResponse) -> Result<Option<Vec<u8>>> {
        let mut frames = Vec::new();

        if chunk.is_done() {
            self.close_block(&mut frames);
            if !self.finish_sent {
                let usage = self.assembler.usage().unwrap_or_default();
                let reason = self
                    .assembler
                    .finish_reason()
                    .map(stop_reason)
                    .unwrap_or("end_turn");
                let delta = json!({
                    "type": "message_delta",
                    "delta": {"stop_reason": reason, "stop_sequence": Value::Null},
                    "usage": {"output_tokens": usage.completion_tokens},
                });
                frames.extend(sse_event_frame("message_delta", delta.to_string().as_bytes()));
                self.finish_sent = true;
            }
            let stop = json!({"type": "message_stop"});
            frames.extend(sse_event_frame("message_stop", stop.to_string().as_bytes()));
            return Ok(Some(frames));
        }

        self.assembler.push(chunk);
        self.ensure_message_start(chunk, &mut frames);

        for choice in &chunk.choices {
            if let Some(delta) = &choice.delta {
                if let Some(content) = &delta.content {
                    let text = content.as_text();
                    if !text.is_empty() {
                        if self.tool_block_open {
                            self.close_block(&mut frames);
                        }
                        if !self.text_block_open {
                            let start = json!({
                                "type": "content_block_start",
                                "index": self.block_index,
                                "content_block": {"type": "text", "text": ""},
                            });
                            frames.extend(sse_event_frame(
                                "content_block_start",
                                start.to_string().as_bytes(),
                            ));
                            self.text_block_open = true;
                        }
                        let event = json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": {"type": "text_delta", "text": text},
                        });
                        frames.extend(sse_event_frame(
                            "content_block_delta",
                            event.to_string().as_bytes(),
                        ));
                    }
                }
                for call in &delta.tool_calls {
                    if !call.function.name.is_empty() {
                        self.close_block(&mut frames);
                        let start = json!({
                            "type": "content_block_start",
                            "index": self.block_index,
                            "content_block": {
                                "type": "tool_use",
                                "id": call.id,
                                "name": call.function.name,
                                "input": {},
                            },
                        });
                        frames.extend(sse_event_frame(
                            "content_block_start",
                            start.to_string().as_bytes(),
                        ));
                        self.tool_block_open = true;
                    }
                    if !call.function.arguments.is_empty() {
                        let event = json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": {
                                "type": "input_json_delta",
                                "partial_json": call.function.arguments,
                            },
                        });
                        frames.extend(sse_event_frame(
                            "content_block_delta",
                            event.to_string().as_bytes(),
                        ));
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.close_block(&mut frames);
                let usage = chunk
                    .usage
                    .or(self.assembler.usage())
                    .unwrap_or_default();
                let delta = json!({
                    "type": "message_delta",
                    "delta": {"stop_reason": stop_reason(reason), "stop_sequence": Value::Null},
                    "usage": {"output_tokens": usage.completion_tokens},
                });
                frames.extend(sse_event_frame("message_delta", delta.to_string().as_bytes()));
                self.finish_sent = true;
            }
        }

        if frames.is_empty() {
            return Ok(None);
        }
        Ok(Some(frames))
    }

    fn internal_response(&self) -> Option<ChatResponse> {
        self.response.clone().or_else(|| self.assembler.finish())
    }
}

#[derive(Debug, Serialize)]
struct OutTool<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    input_schema: &'a Value,
}

pub struct AnthropicOutbound;

impl AnthropicOutbound {
    fn build_body(request: &ChatRequest) -> Result<Value> {
        let mut system = String::new();
        let mut messages = Vec::new();

        for message in &request.messages {
            match message.role {
                Role::System | Role::Developer => {
                    if let Some(content) = &message.content {
                        system.push_str(&content.as_text());
                    }
                }
                Role::User | Role::Assistant => {
                    let role = if message.role == Role::Assistant {
                        "assistant"
                    } else {
                        "user"
                    };
                    let mut blocks = Vec::new();
                    match &message.content {
                        Some(MessageContent::Text(text)) => {
                            if !text.is_empty() {
                                blocks.push(json!({"type": "text", "text": text}));
                            }
                        }
                        Some(MessageContent::Parts(parts)) => {
                            for part in parts {
                                match part {
                                    ContentPart::Text { text } => {
                                        blocks.push(json!({"type": "text", "text": text}))
                                    }
                                    ContentPart::ImageUrl { image_url } => {
                                        match DataUrl::parse(&image_url.url) {
                                            Some(data_url) => blocks.push(json!({
                                                "type": "image",
                                                "source": {
                                                    "type": "base64",
                                                    "media_type": data_url.media_type,
                                                    "data": data_url.data,
                                                },
                                            })),
                                            None => blocks.push(json!({
                                                "type": "image",
                                                "source": {"type": "url", "url": image_url.url},
                                            })),
                                        }
                                    }
                                }
                            }
                        }
                        None => {}
                    }
                    for call in &message.tool_calls {
                        let input: Value = serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| json!({}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.function.name,
                            "input": input,
                        }));
                    }
                    if !blocks.is_empty() {
                        messages.push(json!({"role": role, "content": blocks}));
                    }
                }
                Role::Tool => {
                    messages.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                            "content": message
                                .content
                                .as_ref()
                                .map(|c| c.as_text())
                                .unwrap_or_default(),
                        }],
                    }));
                }
            }
        }

        let mut body = json!({
            "model": request.model,
            // Anthropic requires max_tokens on every request.
            "max_tokens": request.max_tokens.unwrap_or(4096),
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.stop {
            body["stop_sequences"] = json!(stop.to_vec());
        }
        if request.is_stream() {
            body["stream"] = json!(true);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| {
                    serde_json::to_value(OutTool {
                        name: &tool.function.name,
                        description: tool.function.description.as_deref(),
                        input_schema: &tool.function.parameters,
                    })
                })
                .collect::<std::result::Result<_, _>>()?;
            body["tools"] = Value::Array(tools);
        }
        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<OutBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    cache_creation_input_tokens: i64,
    #[serde(default)]
    cache_read_input_tokens: i64,
}

impl AnthropicUsage {
    fn into_canonical(self) -> Usage {
        Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
            prompt_tokens_details: (self.cache_read_input_tokens > 0).then_some(
                PromptTokensDetails {
                    cached_tokens: self.cache_read_input_tokens,
                },
            ),
            completion_tokens_details: None,
            anthropic_usage: true,
            cache_creation_input_tokens: self.cache_creation_input_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StreamMessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: OutBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessageStart {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

fn delta_chunk(message: Message) -> ChatResponse {
    ChatResponse {
        object: OBJECT_CHUNK.to_string(),
        choices: vec![Choice {
            index: 0,
            delta: Some(message),
            ..Choice::default()
        }],
        ..ChatResponse::default()
    }
}

#[async_trait]
impl Outbound for AnthropicOutbound {
    fn transform_request(
        &self,
        request: &ChatRequest,
        base_url: &str,
        key: &str,
    ) -> Result<reqwest::Request> {
        let url = parse_url(&join_base_url(base_url, "/v1/messages"))?;
        let body = serde_json::to_vec(&Self::build_body(request)?)?;

        let mut out = reqwest::Request::new(Method::POST, url);
        let headers = out.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let api_key = HeaderValue::from_str(key)
            .map_err(|err| RelayError::Translation(format!("invalid credential: {err}")))?;
        headers.insert(HeaderName::from_static("x-api-key"), api_key);
        headers.insert(
            HeaderName::from_static("anthropic-version"),
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        *out.body_mut() = Some(body.into());
        Ok(out)
    }

    async fn transform_response(&self, response: reqwest::Response) -> Result<ChatResponse> {
        let body = response.bytes().await?;
        let parsed: MessagesResponse = serde_json::from_slice(&body)
            .map_err(|err| RelayError::Translation(format!("invalid messages response: {err}")))?;

        let mut text = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();
        for block in &parsed.content {
            match block {
                OutBlock::Text { text: t } => text.push_str(t),
                OutBlock::Thinking { thinking } => reasoning.push_str(thinking),
                OutBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    index: tool_calls.len(),
                    id: id.clone(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                }),
                OutBlock::Other => {}
            }
        }

        let mut finish = parsed.stop_reason.as_deref().map(finish_reason);
        if finish.is_none() && !tool_calls.is_empty() {
            finish = Some(FinishReason::ToolCalls);
        }

        Ok(ChatResponse {
            object: OBJECT_COMPLETION.to_string(),
            id: parsed.id,
            model: parsed.model,
            created: None,
            choices: vec![Choice {
                index: 0,
                finish_reason: finish,
                message: Some(Message {
                    role: Role::Assistant,
                    content: (!text.is_empty()).then_some(MessageContent::Text(text)),
                    tool_call_id: None,
                    tool_calls,
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                }),
                delta: None,
            }],
            usage: parsed.usage.map(AnthropicUsage::into_canonical),
        })
    }

    fn transform_stream(&self, event: &[u8]) -> Result<Option<ChatResponse>> {
        if event.is_empty() {
            return Ok(None);
        }
        let parsed: StreamEvent = serde_json::from_slice(event)
            .map_err(|err| RelayError::Translation(format!("invalid stream event: {err}")))?;

        let chunk = match parsed {
            StreamEvent::MessageStart { message } => {
                let mut chunk = delta_chunk(Message {
                    role: Role::Assistant,
                    content: None,
                    tool_call_id: None,
                    tool_calls: Vec::new(),
                    reasoning_content: None,
                });
                chunk.id = message.id;
                chunk.model = message.model;
                chunk.usage = message.usage.map(AnthropicUsage::into_canonical);
                chunk
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                OutBlock::ToolUse { id, name, .. } => delta_chunk(Message {
                    role: Role::Assistant,
                    content: None,
                    tool_call_id: None,
                    tool_calls: vec![ToolCall {
                        index,
                        id,
                        kind: "function".to_string(),
                        function: FunctionCall {
                            name,
                            arguments: String::new(),
                        },
                    }],
                    reasoning_content: None,
                }),
                _ => return Ok(None),
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => delta_chunk(Message::text(Role::Assistant, text)),
                BlockDelta::ThinkingDelta { thinking } => delta_chunk(Message {
                    role: Role::Assistant,
                    content: None,
                    tool_call_id: None,
                    tool_calls: Vec::new(),
                    reasoning_content: Some(thinking),
                }),
                BlockDelta::InputJsonDelta { partial_json } => delta_chunk(Message {
                    role: Role::Assistant,
                    content: None,
                    tool_call_id: None,
                    tool_calls: vec![ToolCall {
                        index,
                        id: String::new(),
                        kind: "function".to_string(),
                        function: FunctionCall {
                            name: String::new(),
                            arguments: partial_json,
                        },
                    }],
                    reasoning_content: None,
                }),
                BlockDelta::Other => return Ok(None),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                let mut chunk = ChatResponse {
                    object: OBJECT_CHUNK.to_string(),
                    choices: vec![Choice {
                        index: 0,
                        finish_reason: delta.stop_reason.as_deref().map(finish_reason),
                        ..Choice::default()
                    }],
                    ..ChatResponse::default()
                };
                chunk.usage = usage.map(AnthropicUsage::into_canonical);
                chunk
            }
            StreamEvent::MessageStop => ChatResponse::done(),
            StreamEvent::ContentBlockStop { .. } | StreamEvent::Ping | StreamEvent::Other => {
                return Ok(None);
            }
        };
        Ok(Some(chunk))
    }
}
