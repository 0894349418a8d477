//! OpenAI chat-completions dialect. The canonical representation is already
//! this wire shape, so both halves are mostly (de)serialization plus the
//! streaming sentinel handling.

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderValue};

use super::{Inbound, Outbound, join_base_url, parse_url, sse_data_frame};
use crate::protocol::{
    ChatRequest, ChatResponse, OBJECT_COMPLETION, OBJECT_DONE, StreamAssembler,
};
use crate::{RelayError, Result};

#[derive(Default)]
pub struct OpenAiChatInbound {
    assembler: StreamAssembler,
    response: Option<ChatResponse>,
}

impl Inbound for OpenAiChatInbound {
    fn transform_request(&mut self, body: &[u8]) -> Result<ChatRequest> {
        serde_json::from_slice(body)
            .map_err(|err| RelayError::InvalidInput(format!("invalid chat completion body: {err}")))
    }

    fn transform_response(&mut self, response: &ChatResponse) -> Result<Vec<u8>> {
        self.response = Some(response.clone());
        Ok(serde_json::to_vec(response)?)
    }

    fn transform_stream(&mut self, chunk: &ChatResponse) -> Result<Option<Vec<u8>>> {
        if chunk.is_done() {
            return Ok(Some(sse_data_frame(OBJECT_DONE.as_bytes())));
        }
        self.assembler.push(chunk);
        Ok(Some(sse_data_frame(&serde_json::to_vec(chunk)?)))
    }

    fn internal_response(&self) -> Option<ChatResponse> {
        self.response.clone().or_else(|| self.assembler.finish())
    }
}

pub struct OpenAiChatOutbound;

impl OpenAiChatOutbound {
    fn endpoint(request: &ChatRequest, base_url: &str) -> Result<reqwest::Url> {
        let mut url = parse_url(&join_base_url(base_url, "/chat/completions"))?;
        for (name, value) in &request.query {
            url.query_pairs_mut().append_pair(name, value);
        }
        Ok(url)
    }
}

#[async_trait]
impl Outbound for OpenAiChatOutbound {
    fn transform_request(
        &self,
        request: &ChatRequest,
        base_url: &str,
        key: &str,
    ) -> Result<reqwest::Request> {
        let url = Self::endpoint(request, base_url)?;
        let body = serde_json::to_vec(request)?;

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
        let mut parsed: ChatResponse = serde_json::from_slice(&body)
            .map_err(|err| RelayError::Translation(format!("invalid upstream response: {err}")))?;
        if parsed.object.is_empty() {
            parsed.object = OBJECT_COMPLETION.to_string();
        }
        Ok(parsed)
    }

    fn transform_stream(&self, event: &[u8]) -> Result<Option<ChatResponse>> {
        if event.is_empty() || event.starts_with(OBJECT_DONE.as_bytes()) {
            return Ok(Some(ChatResponse::done()));
        }
        let parsed: ChatResponse = serde_json::from_slice(event)
            .map_err(|err| RelayError::Translation(format!("invalid upstream chunk: {err}")))?;
        Ok(Some(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Choice, FinishReason, Message, MessageContent, OBJECT_CHUNK, Role};

    #[test]
    fn inbound_parses_chat_body() {
        let mut inbound = OpenAiChatInbound::default();
        let body = br#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}],"stream":true}"#;
        let request = inbound.transform_request(body).expect("request");
        assert_eq!(request.model, "gpt-4o");
        assert!(request.is_stream());
        assert_eq!(request.messages[0].role, Role::User);
    }

    #[test]
    fn inbound_rejects_malformed_body() {
        let mut inbound = OpenAiChatInbound::default();
        let err = inbound.transform_request(b"{not json").expect_err("bad body");
        assert!(matches!(err, RelayError::InvalidInput(_)));
    }

    #[test]
    fn outbound_targets_chat_completions_with_bearer() {
        let request = ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            ..ChatRequest::default()
        };
        let out = OpenAiChatOutbound
            .transform_request(&request, "https://api.openai.test/v1/", "sk-key")
            .expect("request");
        assert_eq!(out.url().path(), "/v1/chat/completions");
        assert_eq!(
            out.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer sk-key")
        );
    }

    #[test]
    fn stream_round_trips_done_sentinel() {
        let chunk = OpenAiChatOutbound
            .transform_stream(b"[DONE]")
            .expect("chunk")
            .expect("some");
        assert!(chunk.is_done());

        let mut inbound = OpenAiChatInbound::default();
        let bytes = inbound.transform_stream(&chunk).expect("bytes").expect("some");
        assert_eq!(bytes, b"data: [DONE]\n\n");
    }

    #[test]
    fn inbound_assembles_stream_for_metering() {
        let mut inbound = OpenAiChatInbound::default();
        for text in ["he", "llo"] {
            let chunk = ChatResponse {
                object: OBJECT_CHUNK.to_string(),
                choices: vec![Choice {
                    index: 0,
                    delta: Some(Message::text(Role::Assistant, text)),
                    ..Choice::default()
                }],
                ..ChatResponse::default()
            };
            inbound.transform_stream(&chunk).expect("chunk");
        }
        let finish = ChatResponse {
            object: OBJECT_CHUNK.to_string(),
            choices: vec![Choice {
                index: 0,
                finish_reason: Some(FinishReason::Stop),
                ..Choice::default()
            }],
            ..ChatResponse::default()
        };
        inbound.transform_stream(&finish).expect("chunk");
        inbound.transform_stream(&ChatResponse::done()).expect("done");

        let assembled = inbound.internal_response().expect("assembled");
        let message = assembled.choices[0].message.as_ref().expect("message");
        assert_eq!(
            message.content,
            Some(MessageContent::Text("hello".to_string()))
        );
        assert_eq!(assembled.choices[0].finish_reason, Some(FinishReason::Stop));
    }
}
