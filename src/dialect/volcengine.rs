//! Volcengine Responses dialect: the OpenAI Responses API plus a vendor
//! `thinking.type` field keyed to the reasoning-effort level.

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde_json::{Value, json};

use super::openai_responses::OpenAiResponsesOutbound;
use super::{Outbound, join_base_url, parse_url};
use crate::protocol::{ChatRequest, ChatResponse, ReasoningEffort};
use crate::{RelayError, Result};

/// Models that accept the `reasoning` field; for everything else it is
/// dropped from the request.
const REASONING_MODELS: &[&str] = &["doubao-seed-1-6-lite-251015", "doubao-seed-1-6-251015"];

pub struct VolcengineOutbound;

impl VolcengineOutbound {
    fn build_body(request: &ChatRequest) -> Value {
        let mut body = OpenAiResponsesOutbound::build_body(request);

        if !REASONING_MODELS.contains(&request.model.as_str()) {
            if let Some(obj) = body.as_object_mut() {
                obj.remove("reasoning");
            }
        }

        match request.reasoning_effort {
            Some(ReasoningEffort::Minimal) => {
                body["thinking"] = json!({"type": "disabled"});
            }
            Some(
                ReasoningEffort::Low | ReasoningEffort::Medium | ReasoningEffort::High,
            ) => {
                body["thinking"] = json!({"type": "enabled"});
            }
            None => {}
        }
        body
    }
}

#[async_trait]
impl Outbound for VolcengineOutbound {
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
        OpenAiResponsesOutbound.transform_response(response).await
    }

    fn transform_stream(&self, event: &[u8]) -> Result<Option<ChatResponse>> {
        OpenAiResponsesOutbound.transform_stream(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, Role};

    fn request(model: &str, effort: Option<ReasoningEffort>) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            reasoning_effort: effort,
            ..ChatRequest::default()
        }
    }

    #[test]
    fn minimal_disables_thinking() {
        let body =
            VolcengineOutbound::build_body(&request("doubao-pro", Some(ReasoningEffort::Minimal)));
        assert_eq!(body["thinking"]["type"], json!("disabled"));
    }

    #[test]
    fn low_through_high_enable_thinking() {
        for effort in [
            ReasoningEffort::Low,
            ReasoningEffort::Medium,
            ReasoningEffort::High,
        ] {
            let body = VolcengineOutbound::build_body(&request("doubao-pro", Some(effort)));
            assert_eq!(body["thinking"]["type"], json!("enabled"));
        }
    }

    #[test]
    fn absent_effort_omits_thinking() {
        let body = VolcengineOutbound::build_body(&request("doubao-pro", None));
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn reasoning_field_dropped_for_unsupported_models() {
        let body =
            VolcengineOutbound::build_body(&request("doubao-pro", Some(ReasoningEffort::High)));
        assert!(body.get("reasoning").is_none());

        let body = VolcengineOutbound::build_body(&request(
            "doubao-seed-1-6-251015",
            Some(ReasoningEffort::High),
        ));
        assert_eq!(body["reasoning"]["effort"], json!("high"));
    }

    #[test]
    fn targets_responses_endpoint_with_bearer() {
        let out = VolcengineOutbound
            .transform_request(&request("doubao-pro", None), "https://ark.test/api/v3", "vk")
            .expect("request");
        assert_eq!(out.url().path(), "/api/v3/responses");
        assert_eq!(
            out.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer vk")
        );
    }
}
