//! Gemini generateContent dialect.
//!
//! Gemini has no `assistant` role (`model` instead), carries tool-call
//! arguments as decoded JSON objects, and expresses reasoning effort as a
//! thinking budget. Streaming uses `streamGenerateContent?alt=sse` with no
//! terminator event, so the outbound half synthesizes the `[DONE]` sentinel
//! only when the upstream sends one (OpenAI-compatible proxies do).

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Inbound, Outbound, parse_url, sse_data_frame};
use crate::protocol::{
    ChatRequest, ChatResponse, Choice, ContentPart, DataUrl, FinishReason, FunctionCall,
    ImageUrl, Message, MessageContent, OBJECT_CHUNK, OBJECT_COMPLETION, PromptTokensDetails,
    CompletionTokensDetails, ReasoningEffort, ResponseFormatType, Role, StopSequences,
    StreamAssembler, Tool, ToolCall, Usage,
};
use crate::{RelayError, Result};

/// Reasoning effort to thinking budget, in tokens. Unknown levels fall back
/// to the dynamic budget (-1).
fn thinking_budget(effort: ReasoningEffort) -> i32 {
    match effort {
        ReasoningEffort::Low => 1024,
        ReasoningEffort::Medium => 4096,
        ReasoningEffort::High => 24576,
        _ => -1,
    }
}

fn finish_reason_from_gemini(reason: &str) -> FinishReason {
    match reason {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn finish_reason_to_gemini(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop | FinishReason::ToolCalls => "STOP",
        FinishReason::Length => "MAX_TOKENS",
        FinishReason::ContentFilter => "SAFETY",
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    thought: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<GeminiBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiBlob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    #[serde(default)]
    response: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    top_k: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    response_modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: i32,
    include_thoughts: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    #[serde(default)]
    contents: Vec<GeminiContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    safety_settings: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    #[serde(default)]
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionDeclaration {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    parameters: Value,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<GeminiContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i64,
    #[serde(default)]
    candidates_token_count: i64,
    #[serde(default)]
    total_token_count: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    cached_content_token_count: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    thoughts_token_count: i64,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

fn usage_to_canonical(metadata: UsageMetadata) -> Usage {
    Usage {
        prompt_tokens: metadata.prompt_token_count,
        completion_tokens: metadata.candidates_token_count,
        total_tokens: metadata.total_token_count,
        prompt_tokens_details: (metadata.cached_content_token_count > 0).then_some(
            PromptTokensDetails {
                cached_tokens: metadata.cached_content_token_count,
            },
        ),
        completion_tokens_details: (metadata.thoughts_token_count > 0).then_some(
            CompletionTokensDetails {
                reasoning_tokens: metadata.thoughts_token_count,
            },
        ),
        anthropic_usage: false,
        cache_creation_input_tokens: 0,
    }
}

fn usage_to_metadata(usage: &Usage) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: usage.prompt_tokens,
        candidates_token_count: usage.completion_tokens,
        total_token_count: usage.total_tokens,
        cached_content_token_count: usage.cached_tokens(),
        thoughts_token_count: usage
            .completion_tokens_details
            .map(|details| details.reasoning_tokens)
            .unwrap_or(0),
    }
}

fn response_to_canonical(parsed: GenerateContentResponse, stream: bool) -> ChatResponse {
    let mut choices = Vec::new();
    for candidate in parsed.candidates {
        let mut finish = candidate
            .finish_reason
            .as_deref()
            .map(finish_reason_from_gemini);

        let mut message = None;
        if let Some(content) = candidate.content {
            let mut text = String::new();
            let mut reasoning = String::new();
            let mut tool_calls = Vec::new();
            for (idx, part) in content.parts.iter().enumerate() {
                if let Some(part_text) = &part.text {
                    if part.thought {
                        if reasoning.is_empty() {
                            reasoning.push_str(part_text);
                        }
                    } else {
                        text.push_str(part_text);
                    }
                }
                if let Some(call) = &part.function_call {
                    tool_calls.push(ToolCall {
                        index: idx,
                        id: format!("call_{}_{}", call.name, idx),
                        kind: "function".to_string(),
                        function: FunctionCall {
                            name: call.name.clone(),
                            arguments: call.args.to_string(),
                        },
                    });
                }
            }
            if finish.is_none() && !tool_calls.is_empty() {
                finish = Some(FinishReason::ToolCalls);
            }
            message = Some(Message {
                role: Role::Assistant,
                content: (!text.is_empty()).then_some(MessageContent::Text(text)),
                tool_call_id: None,
                tool_calls,
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
            });
        }

        choices.push(Choice {
            index: candidate.index,
            finish_reason: finish,
            message: if stream { None } else { message.clone() },
            delta: if stream { message } else { None },
        });
    }

    ChatResponse {
        object: if stream { OBJECT_CHUNK } else { OBJECT_COMPLETION }.to_string(),
        id: None,
        model: None,
        created: None,
        choices,
        usage: parsed.usage_metadata.map(usage_to_canonical),
    }
}

fn canonical_to_response(response: &ChatResponse) -> GenerateContentResponse {
    let mut candidates = Vec::new();
    for choice in &response.choices {
        let message = choice.message.as_ref().or(choice.delta.as_ref());
        let content = message.map(|message| {
            let mut parts = Vec::new();
            if let Some(content) = &message.content {
                let text = content.as_text();
                if !text.is_empty() {
                    parts.push(GeminiPart {
                        text: Some(text),
                        ..GeminiPart::default()
                    });
                }
            }
            for call in &message.tool_calls {
                let args: Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
                parts.push(GeminiPart {
                    function_call: Some(GeminiFunctionCall {
                        name: call.function.name.clone(),
                        args,
                    }),
                    ..GeminiPart::default()
                });
            }
            GeminiContent {
                role: Some("model".to_string()),
                parts,
            }
        });
        candidates.push(Candidate {
            index: choice.index,
            content,
            finish_reason: choice.finish_reason.map(|r| finish_reason_to_gemini(r).to_string()),
        });
    }
    GenerateContentResponse {
        candidates,
        usage_metadata: response.usage.as_ref().map(usage_to_metadata),
    }
}

fn request_to_canonical(parsed: GenerateContentRequest, model: String, stream: bool) -> ChatRequest {
    let mut messages = Vec::new();

    if let Some(system) = &parsed.system_instruction {
        let mut text = String::new();
        for part in &system.parts {
            if let Some(part_text) = &part.text {
                text.push_str(part_text);
            }
        }
        if !text.is_empty() {
            messages.push(Message::text(Role::System, text));
        }
    }

    for content in &parsed.contents {
        let role = match content.role.as_deref() {
            Some("model") => Role::Assistant,
            _ => Role::User,
        };
        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();
        for (idx, part) in content.parts.iter().enumerate() {
            if let Some(text) = &part.text {
                parts.push(ContentPart::Text { text: text.clone() });
            }
            if let Some(blob) = &part.inline_data {
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{};base64,{}", blob.mime_type, blob.data),
                    },
                });
            }
            if let Some(call) = &part.function_call {
                tool_calls.push(ToolCall {
                    index: idx,
                    id: format!("call_{}_{}", call.name, idx),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: call.name.clone(),
                        arguments: call.args.to_string(),
                    },
                });
            }
            if let Some(response) = &part.function_response {
                messages.push(Message {
                    role: Role::Tool,
                    content: Some(MessageContent::Text(response.response.to_string())),
                    tool_call_id: Some(response.name.clone()),
                    tool_calls: Vec::new(),
                    reasoning_content: None,
                });
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

    let tools = parsed
        .tools
        .iter()
        .flat_map(|tool| &tool.function_declarations)
        .map(|decl| Tool {
            kind: "function".to_string(),
            function: crate::protocol::FunctionDeclaration {
                name: decl.name.clone(),
                description: decl.description.clone(),
                parameters: decl.parameters.clone(),
            },
        })
        .collect();

    let mut request = ChatRequest {
        model,
        messages,
        tools,
        stream: Some(stream),
        ..ChatRequest::default()
    };
    if let Some(config) = parsed.generation_config {
        request.temperature = config.temperature;
        request.top_p = config.top_p;
        request.max_tokens = config.max_output_tokens;
        if !config.stop_sequences.is_empty() {
            request.stop = Some(StopSequences::Many(config.stop_sequences));
        }
        if let Some(top_k) = config.top_k {
            request
                .metadata
                .insert("gemini_top_k".to_string(), top_k.to_string());
        }
    }
    request
}

/// Inbound Gemini adapter. Constructed per request with the model and method
/// taken from the URL path (`/models/<model>:generateContent` or
/// `:streamGenerateContent`).
pub struct GeminiInbound {
    model: String,
    stream: bool,
    assembler: StreamAssembler,
    response: Option<ChatResponse>,
}

impl GeminiInbound {
    pub fn new(model: String, stream: bool) -> Self {
        Self {
            model,
            stream,
            assembler: StreamAssembler::default(),
            response: None,
        }
    }
}

impl Inbound for GeminiInbound {
    fn transform_request(&mut self, body: &[u8]) -> Result<ChatRequest> {
        let parsed: GenerateContentRequest = serde_json::from_slice(body).map_err(|err| {
            RelayError::InvalidInput(format!("invalid generateContent body: {err}"))
        })?;
        Ok(request_to_canonical(parsed, self.model.clone(), self.stream))
    }

    fn transform_response(&mut self, response: &ChatResponse) -> Result<Vec<u8>> {
        self.response = Some(response.clone());
        Ok(serde_json::to_vec(&canonical_to_response(response))?)
    }

    fn transform_stream(&mut self, chunk: &ChatResponse) -> Result<Option<Vec<u8>>> {
        if chunk.is_done() {
            // Gemini streams end with the connection; no terminator event.
            return Ok(None);
        }
        self.assembler.push(chunk);
        let body = serde_json::to_vec(&canonical_to_response(chunk))?;
        Ok(Some(sse_data_frame(&body)))
    }

    fn internal_response(&self) -> Option<ChatResponse> {
        self.response.clone().or_else(|| self.assembler.finish())
    }
}

pub struct GeminiOutbound;

impl GeminiOutbound {
    fn build_body(request: &ChatRequest) -> Result<GenerateContentRequest> {
        let mut contents = Vec::new();
        let mut system_parts = Vec::new();

        for message in &request.messages {
            match message.role {
                Role::System | Role::Developer => {
                    if let Some(content) = &message.content {
                        system_parts.push(GeminiPart {
                            text: Some(content.as_text()),
                            ..GeminiPart::default()
                        });
                    }
                }
                Role::User => {
                    let mut parts = Vec::new();
                    match &message.content {
                        Some(MessageContent::Text(text)) => parts.push(GeminiPart {
                            text: Some(text.clone()),
                            ..GeminiPart::default()
                        }),
                        Some(MessageContent::Parts(message_parts)) => {
                            for part in message_parts {
                                match part {
                                    ContentPart::Text { text } => parts.push(GeminiPart {
                                        text: Some(text.clone()),
                                        ..GeminiPart::default()
                                    }),
                                    ContentPart::ImageUrl { image_url } => {
                                        // Gemini only accepts inline data.
                                        if let Some(data_url) = DataUrl::parse(&image_url.url) {
                                            parts.push(GeminiPart {
                                                inline_data: Some(GeminiBlob {
                                                    mime_type: data_url.media_type,
                                                    data: data_url.data,
                                                }),
                                                ..GeminiPart::default()
                                            });
                                        }
                                    }
                                }
                            }
                        }
                        None => {}
                    }
                    contents.push(GeminiContent {
                        role: Some("user".to_string()),
                        parts,
                    });
                }
                Role::Assistant => {
                    let mut parts = Vec::new();
                    if let Some(content) = &message.content {
                        let text = content.as_text();
                        if !text.is_empty() {
                            parts.push(GeminiPart {
                                text: Some(text),
                                ..GeminiPart::default()
                            });
                        }
                    }
                    for call in &message.tool_calls {
                        let args: Value = serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| json!({}));
                        parts.push(GeminiPart {
                            function_call: Some(GeminiFunctionCall {
                                name: call.function.name.clone(),
                                args,
                            }),
                            ..GeminiPart::default()
                        });
                    }
                    contents.push(GeminiContent {
                        role: Some("model".to_string()),
                        parts,
                    });
                }
                Role::Tool => {
                    // Function responses come from the user role in Gemini.
                    let raw = message
                        .content
                        .as_ref()
                        .map(|c| c.as_text())
                        .unwrap_or_default();
                    let response: Value = serde_json::from_str(&raw)
                        .ok()
                        .filter(Value::is_object)
                        .unwrap_or_else(|| json!({"result": raw}));
                    contents.push(GeminiContent {
                        role: Some("user".to_string()),
                        parts: vec![GeminiPart {
                            function_response: Some(GeminiFunctionResponse {
                                name: message.tool_call_id.clone().unwrap_or_default(),
                                response,
                            }),
                            ..GeminiPart::default()
                        }],
                    });
                }
            }
        }

        let mut config = GenerationConfig::default();
        let mut has_config = false;
        if let Some(max_tokens) = request.max_tokens {
            config.max_output_tokens = Some(max_tokens);
            has_config = true;
        }
        if request.temperature.is_some() {
            config.temperature = request.temperature;
            has_config = true;
        }
        if request.top_p.is_some() {
            config.top_p = request.top_p;
            has_config = true;
        }
        if let Some(raw) = request.metadata.get("gemini_top_k") {
            if let Ok(top_k) = raw.parse::<i64>() {
                config.top_k = Some(top_k);
                has_config = true;
            }
        }
        if let Some(stop) = &request.stop {
            config.stop_sequences = stop.to_vec();
            has_config = true;
        }
        if let Some(effort) = request.reasoning_effort {
            config.thinking_config = Some(ThinkingConfig {
                thinking_budget: thinking_budget(effort),
                include_thoughts: true,
            });
            has_config = true;
        }
        if let Some(format) = &request.response_format {
            config.response_mime_type = Some(
                match format.kind {
                    ResponseFormatType::JsonObject | ResponseFormatType::JsonSchema => {
                        "application/json"
                    }
                    ResponseFormatType::Text => "text/plain",
                }
                .to_string(),
            );
            has_config = true;
        }
        if !request.modalities.is_empty() {
            config.response_modalities = request.modalities.clone();
            has_config = true;
        }

        let mut declarations = Vec::new();
        for tool in &request.tools {
            if tool.kind != "function" {
                continue;
            }
            let mut parameters = tool.function.parameters.clone();
            if let Some(obj) = parameters.as_object_mut() {
                obj.remove("$schema");
            }
            declarations.push(FunctionDeclaration {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                parameters,
            });
        }

        let safety_settings = request
            .metadata
            .get("gemini_safety_settings")
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok());

        Ok(GenerateContentRequest {
            contents,
            system_instruction: (!system_parts.is_empty()).then_some(GeminiContent {
                role: None,
                parts: system_parts,
            }),
            generation_config: has_config.then_some(config),
            tools: if declarations.is_empty() {
                Vec::new()
            } else {
                vec![GeminiTool {
                    function_declarations: declarations,
                }]
            },
            safety_settings,
        })
    }
}

#[async_trait]
impl Outbound for GeminiOutbound {
    fn transform_request(
        &self,
        request: &ChatRequest,
        base_url: &str,
        key: &str,
    ) -> Result<reqwest::Request> {
        let body = serde_json::to_vec(&Self::build_body(request)?)?;

        let stream = request.is_stream();
        let method = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let model = if request.model.contains('/') {
            request.model.clone()
        } else {
            format!("models/{}", request.model)
        };
        let mut url = parse_url(&format!(
            "{}/{model}:{method}",
            base_url.trim_end_matches('/')
        ))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("key", key);
            if stream {
                pairs.append_pair("alt", "sse");
            }
        }

        let mut out = reqwest::Request::new(Method::POST, url);
        let headers = out.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        *out.body_mut() = Some(body.into());
        Ok(out)
    }

    async fn transform_response(&self, response: reqwest::Response) -> Result<ChatResponse> {
        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(RelayError::Translation("response body is empty".to_string()));
        }
        let parsed: GenerateContentResponse = serde_json::from_slice(&body).map_err(|err| {
            RelayError::Translation(format!("invalid generateContent response: {err}"))
        })?;
        Ok(response_to_canonical(parsed, false))
    }

    fn transform_stream(&self, event: &[u8]) -> Result<Option<ChatResponse>> {
        if event.is_empty() || event.starts_with(b"[DONE]") {
            return Ok(Some(ChatResponse::done()));
        }
        let parsed: GenerateContentResponse = serde_json::from_slice(event).map_err(|err| {
            RelayError::Translation(format!("invalid generateContent chunk: {err}"))
        })?;
        Ok(Some(response_to_canonical(parsed, true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_request(effort: Option<ReasoningEffort>) -> ChatRequest {
        ChatRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            reasoning_effort: effort,
            ..ChatRequest::default()
        }
    }

    #[test]
    fn thinking_budget_table() {
        assert_eq!(thinking_budget(ReasoningEffort::Low), 1024);
        assert_eq!(thinking_budget(ReasoningEffort::Medium), 4096);
        assert_eq!(thinking_budget(ReasoningEffort::High), 24576);
        assert_eq!(thinking_budget(ReasoningEffort::Minimal), -1);
    }

    #[test]
    fn outbound_url_carries_key_and_sse_flag() {
        let mut request = user_request(None);
        request.stream = Some(true);
        let out = GeminiOutbound
            .transform_request(&request, "https://gemini.test/v1beta", "g-key")
            .expect("request");
        assert!(out.url().path().ends_with("/models/gemini-2.0-flash:streamGenerateContent"));
        let query: Vec<(String, String)> = out
            .url()
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(query.contains(&("key".to_string(), "g-key".to_string())));
        assert!(query.contains(&("alt".to_string(), "sse".to_string())));
    }

    #[test]
    fn roles_collapse_to_system_instruction_and_model() {
        let request = ChatRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![
                Message::text(Role::System, "a"),
                Message::text(Role::Developer, "b"),
                Message::text(Role::User, "hi"),
                Message::text(Role::Assistant, "hello"),
            ],
            ..ChatRequest::default()
        };
        let body = GeminiOutbound::build_body(&request).expect("body");
        let system = body.system_instruction.expect("system instruction");
        assert_eq!(system.parts.len(), 2);
        assert_eq!(body.contents[0].role.as_deref(), Some("user"));
        assert_eq!(body.contents[1].role.as_deref(), Some("model"));
    }

    #[test]
    fn tool_result_maps_to_user_function_response() {
        let request = ChatRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![Message {
                role: Role::Tool,
                content: Some(MessageContent::Text("plain output".to_string())),
                tool_call_id: Some("call_lookup_0".to_string()),
                tool_calls: Vec::new(),
                reasoning_content: None,
            }],
            ..ChatRequest::default()
        };
        let body = GeminiOutbound::build_body(&request).expect("body");
        assert_eq!(body.contents[0].role.as_deref(), Some("user"));
        let response = body.contents[0].parts[0]
            .function_response
            .as_ref()
            .expect("function response");
        assert_eq!(response.name, "call_lookup_0");
        assert_eq!(response.response["result"], json!("plain output"));
    }

    #[test]
    fn gemini_finish_reasons_map_to_canonical() {
        assert_eq!(finish_reason_from_gemini("STOP"), FinishReason::Stop);
        assert_eq!(finish_reason_from_gemini("MAX_TOKENS"), FinishReason::Length);
        assert_eq!(finish_reason_from_gemini("SAFETY"), FinishReason::ContentFilter);
        assert_eq!(finish_reason_from_gemini("RECITATION"), FinishReason::ContentFilter);
        assert_eq!(finish_reason_from_gemini("UNSPECIFIED"), FinishReason::Stop);
    }

    #[test]
    fn function_call_without_finish_reason_becomes_tool_calls() {
        let raw = json!({
            "candidates": [{
                "index": 0,
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "lookup", "args": {"q": "x"}}}
                ]}
            }]
        });
        let chunk = GeminiOutbound
            .transform_stream(raw.to_string().as_bytes())
            .expect("event")
            .expect("chunk");
        assert_eq!(chunk.choices[0].finish_reason, Some(FinishReason::ToolCalls));
        let delta = chunk.choices[0].delta.as_ref().expect("delta");
        assert_eq!(delta.tool_calls[0].id, "call_lookup_0");
        assert_eq!(delta.tool_calls[0].function.arguments, "{\"q\":\"x\"}");
    }

    #[test]
    fn inbound_round_trips_inline_data() {
        let mut inbound = GeminiInbound::new("gemini-2.0-flash".to_string(), false);
        let body = json!({
            "contents": [{"role": "user", "parts": [
                {"text": "what is this"},
                {"inlineData": {"mimeType": "image/png", "data": "aGk="}}
            ]}],
            "generationConfig": {"topK": 40, "maxOutputTokens": 100}
        });
        let request = inbound
            .transform_request(body.to_string().as_bytes())
            .expect("request");
        assert_eq!(request.model, "gemini-2.0-flash");
        assert_eq!(request.metadata.get("gemini_top_k").map(String::as_str), Some("40"));
        let Some(MessageContent::Parts(parts)) = &request.messages[0].content else {
            panic!("expected parts");
        };
        assert!(matches!(
            &parts[1],
            ContentPart::ImageUrl { image_url } if image_url.url == "data:image/png;base64,aGk="
        ));
    }
}
