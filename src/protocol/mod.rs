//! Provider-neutral request/response types.
//!
//! The canonical wire shape is the OpenAI chat dialect; every adapter
//! translates into and out of these types. Streaming responses reuse
//! [`ChatResponse`] with `object = "chat.completion.chunk"`, and the
//! `[DONE]` terminator is the sentinel produced by [`ChatResponse::done`].

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{RelayError, Result};

pub const OBJECT_COMPLETION: &str = "chat.completion";
pub const OBJECT_CHUNK: &str = "chat.completion.chunk";
pub const OBJECT_DONE: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => {
                let mut out = String::new();
                for part in parts {
                    if let ContentPart::Text { text } = part {
                        out.push_str(text);
                    }
                }
                out
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

/// A `data:<media-type>;base64,<payload>` URL split into its pieces.
pub struct DataUrl {
    pub media_type: String,
    pub data: String,
}

impl DataUrl {
    pub fn parse(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("data:")?;
        let (meta, data) = rest.split_once(',')?;
        let media_type = meta.strip_suffix(";base64")?;
        Some(Self {
            media_type: media_type.to_string(),
            data: data.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments. Dialects that carry decoded objects
    /// (Gemini) re-encode on translation.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionDeclaration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(text.into())),
            tool_call_id: None,
            tool_calls: Vec::new(),
            reasoning_content: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StopSequences::One(stop) => vec![stop.clone()],
            StopSequences::Many(stops) => stops.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    /// Only meaningful for Volcengine, which distinguishes it from `low`.
    Minimal,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormatType {
    Text,
    JsonObject,
    JsonSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: ResponseFormatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<Value>,

    /// Original URL query pairs, passed through to dialects that want them.
    /// Never serialized onto an upstream body.
    #[serde(skip)]
    pub query: BTreeMap<String, String>,
    /// Adapter side-channel (e.g. `gemini_top_k`, `gemini_safety_settings`).
    #[serde(skip)]
    pub metadata: HashMap<String, String>,
}

impl ChatRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(RelayError::InvalidInput("model is required".to_string()));
        }
        if self.messages.is_empty() {
            return Err(RelayError::InvalidInput(
                "messages must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionTokensDetails {
    #[serde(default)]
    pub reasoning_tokens: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens_details: Option<CompletionTokensDetails>,
    /// Set when the upstream was Anthropic: prompt tokens exclude the cache
    /// reads/writes, which are priced separately.
    #[serde(skip)]
    pub anthropic_usage: bool,
    #[serde(skip)]
    pub cache_creation_input_tokens: i64,
}

impl Usage {
    pub fn cached_tokens(&self) -> i64 {
        self.prompt_tokens_details
            .map(|details| details.cached_tokens)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Choice {
    #[serde(default)]
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatResponse {
    #[serde(default)]
    pub object: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// The streaming terminator sentinel.
    pub fn done() -> Self {
        Self {
            object: OBJECT_DONE.to_string(),
            ..Self::default()
        }
    }

    pub fn is_done(&self) -> bool {
        self.object == OBJECT_DONE
    }

    pub fn is_chunk(&self) -> bool {
        self.object == OBJECT_CHUNK
    }
}

#[derive(Debug, Default)]
struct AssembledChoice {
    text: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<FinishReason>,
}

/// Accumulates streaming deltas into a complete [`ChatResponse`] so metering
/// has a canonical response even when no single response body exists.
///
/// Bound into the per-request inbound adapter; never process-wide.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    id: Option<String>,
    model: Option<String>,
    created: Option<i64>,
    choices: BTreeMap<usize, AssembledChoice>,
    usage: Option<Usage>,
    saw_chunk: bool,
}

impl StreamAssembler {
    pub fn push(&mut self, chunk: &ChatResponse) {
        if chunk.is_done() {
            return;
        }
        self.saw_chunk = true;
        if self.id.is_none() {
            self.id = chunk.id.clone();
        }
        if self.model.is_none() {
            self.model = chunk.model.clone();
        }
        if self.created.is_none() {
            self.created = chunk.created;
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(merge_usage(self.usage, usage));
        }
        for choice in &chunk.choices {
            let slot = self.choices.entry(choice.index).or_default();
            if let Some(reason) = choice.finish_reason {
                slot.finish_reason = Some(reason);
            }
            let Some(delta) = &choice.delta else { continue };
            if let Some(content) = &delta.content {
                slot.text.push_str(&content.as_text());
            }
            if let Some(reasoning) = &delta.reasoning_content {
                slot.reasoning.push_str(reasoning);
            }
            for call in &delta.tool_calls {
                match slot.tool_calls.iter_mut().find(|c| c.index == call.index) {
                    Some(existing) => {
                        existing.function.arguments.push_str(&call.function.arguments);
                        if existing.id.is_empty() {
                            existing.id = call.id.clone();
                        }
                        if existing.function.name.is_empty() {
                            existing.function.name = call.function.name.clone();
                        }
                    }
                    None => slot.tool_calls.push(call.clone()),
                }
            }
        }
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choices.values().find_map(|choice| choice.finish_reason)
    }

    pub fn finish(&self) -> Option<ChatResponse> {
        if !self.saw_chunk {
            return None;
        }
        let choices = self
            .choices
            .iter()
            .map(|(index, assembled)| {
                let mut finish_reason = assembled.finish_reason;
                if finish_reason.is_none() && !assembled.tool_calls.is_empty() {
                    finish_reason = Some(FinishReason::ToolCalls);
                }
                Choice {
                    index: *index,
                    finish_reason,
                    message: Some(Message {
                        role: Role::Assistant,
                        content: (!assembled.text.is_empty())
                            .then(|| MessageContent::Text(assembled.text.clone())),
                        tool_call_id: None,
                        tool_calls: assembled.tool_calls.clone(),
                        reasoning_content: (!assembled.reasoning.is_empty())
                            .then(|| assembled.reasoning.clone()),
                    }),
                    delta: None,
                }
            })
            .collect();
        Some(ChatResponse {
            object: OBJECT_COMPLETION.to_string(),
            id: self.id.clone(),
            model: self.model.clone(),
            created: self.created,
            choices,
            usage: self.usage,
        })
    }
}

fn merge_usage(current: Option<Usage>, incoming: Usage) -> Usage {
    let Some(current) = current else {
        return incoming;
    };
    Usage {
        prompt_tokens: current.prompt_tokens.max(incoming.prompt_tokens),
        completion_tokens: current.completion_tokens.max(incoming.completion_tokens),
        total_tokens: current.total_tokens.max(incoming.total_tokens),
        prompt_tokens_details: incoming.prompt_tokens_details.or(current.prompt_tokens_details),
        completion_tokens_details: incoming
            .completion_tokens_details
            .or(current.completion_tokens_details),
        anthropic_usage: current.anthropic_usage || incoming.anthropic_usage,
        cache_creation_input_tokens: current
            .cache_creation_input_tokens
            .max(incoming.cache_creation_input_tokens),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_chunk(index: usize, text: &str) -> ChatResponse {
        ChatResponse {
            object: OBJECT_CHUNK.to_string(),
            choices: vec![Choice {
                index,
                delta: Some(Message::text(Role::Assistant, text)),
                ..Choice::default()
            }],
            ..ChatResponse::default()
        }
    }

    #[test]
    fn validate_rejects_empty_model_and_messages() {
        let request = ChatRequest::default();
        assert!(request.validate().is_err());

        let request = ChatRequest {
            model: "gpt-4o".to_string(),
            ..ChatRequest::default()
        };
        assert!(request.validate().is_err());

        let request = ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            ..ChatRequest::default()
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn data_url_splits_media_type_and_payload() {
        let url = DataUrl::parse("data:image/png;base64,aGVsbG8=").expect("data url");
        assert_eq!(url.media_type, "image/png");
        assert_eq!(url.data, "aGVsbG8=");
        assert!(DataUrl::parse("https://example.test/cat.png").is_none());
    }

    #[test]
    fn assembler_concatenates_deltas_and_keeps_finish_reason() {
        let mut assembler = StreamAssembler::default();
        assembler.push(&delta_chunk(0, "hel"));
        assembler.push(&delta_chunk(0, "lo"));
        let mut last = ChatResponse {
            object: OBJECT_CHUNK.to_string(),
            choices: vec![Choice {
                index: 0,
                finish_reason: Some(FinishReason::Stop),
                ..Choice::default()
            }],
            ..ChatResponse::default()
        };
        last.usage = Some(Usage {
            prompt_tokens: 5,
            completion_tokens: 2,
            total_tokens: 7,
            ..Usage::default()
        });
        assembler.push(&last);
        assembler.push(&ChatResponse::done());

        let response = assembler.finish().expect("assembled response");
        assert_eq!(response.object, OBJECT_COMPLETION);
        let message = response.choices[0].message.as_ref().expect("message");
        assert_eq!(message.content.as_ref().map(|c| c.as_text()).as_deref(), Some("hello"));
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(response.usage.expect("usage").prompt_tokens, 5);
    }

    #[test]
    fn assembler_merges_tool_call_argument_fragments() {
        let mut assembler = StreamAssembler::default();
        let chunk = |args: &str, id: &str| ChatResponse {
            object: OBJECT_CHUNK.to_string(),
            choices: vec![Choice {
                index: 0,
                delta: Some(Message {
                    role: Role::Assistant,
                    content: None,
                    tool_call_id: None,
                    tool_calls: vec![ToolCall {
                        index: 0,
                        id: id.to_string(),
                        kind: "function".to_string(),
                        function: FunctionCall {
                            name: if id.is_empty() { String::new() } else { "get_weather".to_string() },
                            arguments: args.to_string(),
                        },
                    }],
                    reasoning_content: None,
                }),
                ..Choice::default()
            }],
            ..ChatResponse::default()
        };
        assembler.push(&chunk("{\"city\":", "call_1"));
        assembler.push(&chunk("\"paris\"}", ""));

        let response = assembler.finish().expect("assembled");
        let message = response.choices[0].message.as_ref().expect("message");
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].function.arguments, "{\"city\":\"paris\"}");
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::ToolCalls));
    }
}
