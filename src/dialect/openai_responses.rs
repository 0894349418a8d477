//! OpenAI Responses API outbound dialect.
//!
//! Chat messages become typed input items; streamed output arrives as
//! `response.*` events rather than chat chunks, so the stream half maps the
//! delta/completed events back onto canonical chunks.

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Outbound, join_base_url, parse_url};
use crate::protocol::{
    ChatRequest, ChatResponse, Choice, FinishReason, FunctionCall, Message, MessageContent,
    OBJECT_CHUNK, OBJECT_COMPLETION, PromptTokensDetails, CompletionTokensDetails,
    ResponseFormatType, Role, ToolCall, Usage,
};
use crate::{RelayError, Result};

pub struct OpenAiResponsesOutbound;

impl OpenAiResponsesOutbound {
    pub(crate) fn build_body(request: &ChatRequest) -> Value {
        let mut input = Vec::new();
        for message in &request.messages {
            match message.role {
                Role::Tool => {
                    input.push(json!({
                        "type": "function_call_output",
                        "call_id": message.tool_call_id.clone().unwrap_or_default(),
                        "output": message
                            .content
                            .as_ref()
                            .map(|c| c.as_text())
                            .unwrap_or_default(),
                    }));
                }
                _ => {
                    let role = match message.role {
                        Role::System => "system",
                        Role::Developer => "developer",
                        Role::Assistant => "assistant",
                        _ => "user",
                    };
                    if let Some(content) = &message.content {
                        let text = content.as_text();
                        if !text.is_empty() {
                            input.push(json!({"role": role, "content": text}));
                        }
                    }
                    for call in &message.tool_calls {
                        input.push(json!({
                            "type": "function_call",
                            "call_id": call.id,
                            "name": call.function.name,
                            "arguments": call.function.arguments,
                        }));
                    }
                }
            }
        }

        let mut body = json!({
            "model": request.model,
            "input": input,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_output_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if request.is_stream() {
            body["stream"] = json!(true);
        }
        if let Some(effort) = request.reasoning_effort {
            body["reasoning"] = json!({"effort": effort.as_str()});
        }
        if let Some(format) = &request.response_format {
            body["text"] = match format.kind {
                ResponseFormatType::Text => json!({"format": {"type": "text"}}),
                ResponseFormatType::JsonObject => json!({"format": {"type": "json_object"}}),
                ResponseFormatType::JsonSchema => {
                    let mut value = json!({"format": {"type": "json_schema"}});
                    if let Some(schema) = &format.json_schema {
                        value["format"]["schema"] = schema.clone();
                    }
                    value
                }
            };
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "name": tool.function.name,
                        "description": tool.function.description,
                        "parameters": tool.function.parameters,
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
    #[serde(default)]
    incomplete_details: Option<IncompleteDetails>,
}

#[derive(Debug, Deserialize)]
struct IncompleteDetails {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    FunctionCall {
        #[serde(default)]
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    Reasoning {
        #[serde(default)]
        summary: Vec<OutputContent>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputContent {
    OutputText {
        text: String,
    },
    SummaryText {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
    #[serde(default)]
    input_tokens_details: Option<InputTokensDetails>,
    #[serde(default)]
    output_tokens_details: Option<OutputTokensDetails>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct InputTokensDetails {
    #[serde(default)]
    cached_tokens: i64,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct OutputTokensDetails {
    #[serde(default)]
    reasoning_tokens: i64,
}

impl ResponsesUsage {
    fn into_canonical(self) -> Usage {
        Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
            prompt_tokens_details: self
                .input_tokens_details
                .filter(|details| details.cached_tokens > 0)
                .map(|details| PromptTokensDetails {
                    cached_tokens: details.cached_tokens,
                }),
            completion_tokens_details: self
                .output_tokens_details
                .filter(|details| details.reasoning_tokens > 0)
                .map(|details| CompletionTokensDetails {
                    reasoning_tokens: details.reasoning_tokens,
                }),
            anthropic_usage: false,
            cache_creation_input_tokens: 0,
        }
    }
}

fn response_to_canonical(parsed: ResponsesResponse) -> ChatResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for item in &parsed.output {
        match item {
            OutputItem::Message { content } => {
                for part in content {
                    if let OutputContent::OutputText { text: t } = part {
                        text.push_str(t);
                    }
                }
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => tool_calls.push(ToolCall {
                index: tool_calls.len(),
                id: call_id.clone(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: arguments.clone(),
                },
            }),
            OutputItem::Reasoning { summary } => {
                for part in summary {
                    if let OutputContent::SummaryText { text: t } = part {
                        reasoning.push_str(t);
                    }
                }
            }
            OutputItem::Other => {}
        }
    }

    let finish = if !tool_calls.is_empty() {
        FinishReason::ToolCalls
    } else if parsed
        .incomplete_details
        .as_ref()
        .and_then(|details| details.reason.as_deref())
        == Some("max_output_tokens")
    {
        FinishReason::Length
    } else {
        FinishReason::Stop
    };

    ChatResponse {
        object: OBJECT_COMPLETION.to_string(),
        id: parsed.id,
        model: parsed.model,
        created: parsed.created_at,
        choices: vec![Choice {
            index: 0,
            finish_reason: Some(finish),
            message: Some(Message {
                role: Role::Assistant,
                content: (!text.is_empty()).then_some(MessageContent::Text(text)),
                tool_call_id: None,
                tool_calls,
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
            }),
            delta: None,
        }],
        usage: parsed.usage.map(ResponsesUsage::into_canonical),
    }
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    item: Option<Value>,
    #[serde(default)]
    response: Option<ResponsesResponse>,
}

#[async_trait]
impl Outbound for OpenAiResponsesOutbound {
    fn transform_request(
        &self,
        request: &ChatRequest,
        base_url: &str,
        key: &str,
    ) -> Result<reqwest::Request> {
        let url = parse_url(&join_base_url(base_url, "/responses"))?;
        let body = serde_json::to_vec(&Self::build_body(request))?;

        let mut out = reqwest::Request::new(Method::POST, url);
        let headers = out.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|err| RelayError::Translation(format!("invalid credential: {err}")))?;
        headers.insert(AUTHORIZATION, bearer);
        *out.body_mut() = Some(body.into());
        Ok(out)
    }

    async fn transform_response(&self, response: reqwest::Response) -> Result<ChatResponse> {
        let body = response.bytes().await?;
        let parsed: ResponsesResponse = serde_json::from_slice(&body)
            .map_err(|err| RelayError::Translation(format!("invalid responses body: {err}")))?;
        Ok(response_to_canonical(parsed))
    }

    fn transform_stream(&self, event: &[u8]) -> Result<Option<ChatResponse>> {
        if event.is_empty() || event.starts_with(b"[DONE]") {
            return Ok(Some(ChatResponse::done()));
        }
        let envelope: StreamEnvelope = serde_json::from_slice(event)
            .map_err(|err| RelayError::Translation(format!("invalid responses event: {err}")))?;

        match envelope.kind.as_str() {
            "response.output_text.delta" => {
                let text = envelope.delta.unwrap_or_default();
                Ok(Some(ChatResponse {
                    object: OBJECT_CHUNK.to_string(),
                    choices: vec![Choice {
                        index: 0,
                        delta: Some(Message::text(Role::Assistant, text)),
                        ..Choice::default()
                    }],
                    ..ChatResponse::default()
                }))
            }
            "response.reasoning_summary_text.delta" => {
                let text = envelope.delta.unwrap_or_default();
                Ok(Some(ChatResponse {
                    object: OBJECT_CHUNK.to_string(),
                    choices: vec![Choice {
                        index: 0,
                        delta: Some(Message {
                            role: Role::Assistant,
                            content: None,
                            tool_call_id: None,
                            tool_calls: Vec::new(),
                            reasoning_content: Some(text),
                        }),
                        ..Choice::default()
                    }],
                    ..ChatResponse::default()
                }))
            }
            "response.output_item.done" => {
                let Some(item) = envelope.item else {
                    return Ok(None);
                };
                if item.get("type").and_then(Value::as_str) != Some("function_call") {
                    return Ok(None);
                }
                let call = ToolCall {
                    index: 0,
                    id: item
                        .get("call_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: item
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        arguments: item
                            .get("arguments")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    },
                };
                Ok(Some(ChatResponse {
                    object: OBJECT_CHUNK.to_string(),
                    choices: vec![Choice {
                        index: 0,
                        delta: Some(Message {
                            role: Role::Assistant,
                            content: None,
                            tool_call_id: None,
                            tool_calls: vec![call],
                            reasoning_content: None,
                        }),
                        ..Choice::default()
                    }],
                    ..ChatResponse::default()
                }))
            }
            "response.completed" => {
                let Some(response) = envelope.response else {
                    return Ok(None);
                };
                let complete = response_to_canonical(response);
                Ok(Some(ChatResponse {
                    object: OBJECT_CHUNK.to_string(),
                    id: complete.id.clone(),
                    model: complete.model.clone(),
                    created: complete.created,
                    choices: vec![Choice {
                        index: 0,
                        finish_reason: complete
                            .choices
                            .first()
                            .and_then(|choice| choice.finish_reason),
                        ..Choice::default()
                    }],
                    usage: complete.usage,
                }))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReasoningEffort;

    #[test]
    fn body_maps_messages_to_input_items() {
        let request = ChatRequest {
            model: "gpt-5".to_string(),
            messages: vec![
                Message::text(Role::System, "be brief"),
                Message::text(Role::User, "hi"),
                Message {
                    role: Role::Tool,
                    content: Some(MessageContent::Text("42".to_string())),
                    tool_call_id: Some("call_1".to_string()),
                    tool_calls: Vec::new(),
                    reasoning_content: None,
                },
            ],
            reasoning_effort: Some(ReasoningEffort::High),
            ..ChatRequest::default()
        };
        let body = OpenAiResponsesOutbound::build_body(&request);
        assert_eq!(body["input"][0]["role"], json!("system"));
        assert_eq!(body["input"][2]["type"], json!("function_call_output"));
        assert_eq!(body["reasoning"]["effort"], json!("high"));
    }

    #[test]
    fn completed_event_yields_finish_and_usage() {
        let event = json!({
            "type": "response.completed",
            "response": {
                "id": "resp_1",
                "output": [],
                "usage": {"input_tokens": 10, "output_tokens": 4, "total_tokens": 14}
            }
        });
        let chunk = OpenAiResponsesOutbound
            .transform_stream(event.to_string().as_bytes())
            .expect("event")
            .expect("chunk");
        assert_eq!(chunk.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(chunk.usage.expect("usage").prompt_tokens, 10);
    }

    #[test]
    fn text_delta_event_yields_content_delta() {
        let event = json!({"type": "response.output_text.delta", "delta": "hel"});
        let chunk = OpenAiResponsesOutbound
            .transform_stream(event.to_string().as_bytes())
            .expect("event")
            .expect("chunk");
        let delta = chunk.choices[0].delta.as_ref().expect("delta");
        assert_eq!(
            delta.content,
            Some(MessageContent::Text("hel".to_string()))
        );
    }

    #[test]
    fn bookkeeping_events_are_dropped() {
        let event = json!({"type": "response.in_progress"});
        assert!(
            OpenAiResponsesOutbound
                .transform_stream(event.to_string().as_bytes())
                .expect("event")
                .is_none()
        );
    }

    #[test]
    fn incomplete_max_tokens_maps_to_length() {
        let raw = json!({
            "id": "resp_2",
            "output": [{"type": "message", "content": [{"type": "output_text", "text": "cut"}]}],
            "incomplete_details": {"reason": "max_output_tokens"}
        });
        let parsed: ResponsesResponse = serde_json::from_value(raw).expect("parse");
        let response = response_to_canonical(parsed);
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Length));
    }
}
