//! OpenAI-in / Anthropic-out translation through the full router: the
//! upstream sees a Messages request with `x-api-key`, the caller gets an
//! OpenAI-shape body, and usage is priced with the Anthropic accounting.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use httpmock::prelude::*;
use serde_json::json;
use tower::ServiceExt;

use switchyard::dialect::OutboundDialect;
use switchyard::server::{AppState, router};
use switchyard::store::{
    ApiKey, AutoGroupPolicy, BalanceMode, BaseUrl, Channel, ChannelKey, Group, GroupItem, LlmPrice,
    Store,
};

async fn state_with_anthropic_channel(base_url: String) -> (tempfile::TempDir, AppState) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::new(dir.path().join("relay.db"));
    store.init().await.expect("init");
    store
        .insert_api_key(ApiKey {
            id: 0,
            name: "tester".to_string(),
            key: "sw-test-key".to_string(),
            enabled: true,
            supported_models: String::new(),
        })
        .await
        .expect("api key");

    let state = AppState::build(store).await.expect("state");
    let channel = state
        .registry
        .create_channel(Channel {
            id: 0,
            name: "anthropic-upstream".to_string(),
            dialect: Some(OutboundDialect::AnthropicMessages),
            enabled: true,
            base_urls: vec![BaseUrl::new(base_url)],
            keys: vec![ChannelKey {
                id: 0,
                channel_id: 0,
                key: "sk-ant-upstream".to_string(),
                enabled: true,
            }],
            models: "claude-3-5-sonnet".to_string(),
            custom_models: String::new(),
            use_proxy: false,
            auto_sync: false,
            auto_group: AutoGroupPolicy::None,
            channel_proxy: String::new(),
        })
        .await
        .expect("channel");
    state
        .registry
        .create_group(Group {
            id: 0,
            name: "claude-group".to_string(),
            mode: BalanceMode::Priority,
            match_regex: String::new(),
            items: vec![GroupItem {
                id: 0,
                group_id: 0,
                channel_id: channel.id,
                model_name: "claude-3-5-sonnet".to_string(),
                priority: 0,
                weight: 1,
            }],
        })
        .await
        .expect("group");
    state
        .prices
        .set_local(
            "claude-3-5-sonnet".to_string(),
            LlmPrice {
                input: 2.0,
                output: 4.0,
                cache_read: 1.0,
                cache_write: 3.0,
            },
        )
        .await
        .expect("price");
    (dir, state)
}

#[tokio::test]
async fn openai_in_anthropic_out_non_stream() {
    let server = MockServer::start_async().await;
    let upstream = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/messages")
                .header("x-api-key", "sk-ant-upstream")
                .header("anthropic-version", "2023-06-01")
                .json_body_includes(r#"{"messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}]}"#);
            then.status(200).json_body(json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "model": "claude-3-5-sonnet",
                "content": [{"type": "text", "text": "hello"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 5, "output_tokens": 1}
            }));
        })
        .await;

    let (_dir, state) = state_with_anthropic_channel(server.base_url()).await;
    let response = router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("authorization", "Bearer sw-test-key")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"model":"claude-group","messages":[{"role":"user","content":"hi"}]}"#,
                ))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    upstream.assert_async().await;

    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(parsed["object"], json!("chat.completion"));
    assert_eq!(parsed["choices"][0]["message"]["content"], json!("hello"));
    assert_eq!(parsed["choices"][0]["finish_reason"], json!("stop"));
    assert_eq!(parsed["usage"]["prompt_tokens"], json!(5));
    assert_eq!(parsed["usage"]["completion_tokens"], json!(1));

    // Anthropic pricing: all 5 prompt tokens at the input rate plus the
    // output tokens at the output rate.
    let channel_stats = state.stats.channel(1);
    assert_eq!(channel_stats.request_success, 1);
    assert_eq!(channel_stats.input_tokens, 5);
    assert_eq!(channel_stats.output_tokens, 1);
    assert!((channel_stats.input_cost - 10.0e-6).abs() < 1e-12);
    assert!((channel_stats.output_cost - 4.0e-6).abs() < 1e-12);
}

#[tokio::test]
async fn inbound_credentials_never_reach_the_upstream() {
    let server = MockServer::start_async().await;
    let upstream = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/messages")
                .header("x-api-key", "sk-ant-upstream")
                .is_true(|req: &httpmock::prelude::HttpMockRequest| {
                    let has = |name: &str| {
                        req.headers()
                            .iter()
                            .any(|(header, _)| header.as_str().eq_ignore_ascii_case(name))
                    };
                    // The caller's bearer token and hop-by-hop headers must
                    // not be forwarded.
                    !has("authorization") && !has("accept-encoding")
                });
            then.status(200).json_body(json!({
                "id": "msg_2",
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": "ok"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 1, "output_tokens": 1}
            }));
        })
        .await;

    let (_dir, state) = state_with_anthropic_channel(server.base_url()).await;
    let response = router(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("authorization", "Bearer sw-test-key")
                .header("accept-encoding", "gzip")
                .header("x-request-source", "integration-test")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"model":"claude-group","messages":[{"role":"user","content":"hi"}]}"#,
                ))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    upstream.assert_async().await;
}

#[tokio::test]
async fn relay_log_records_redacted_payloads() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/messages");
            then.status(200).json_body(json!({
                "id": "msg_3",
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": "leaked sk-ABCDEFGHIJKLMNOPQRSTUVWX"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 3, "output_tokens": 8}
            }));
        })
        .await;

    let (_dir, state) = state_with_anthropic_channel(server.base_url()).await;
    let response = router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("authorization", "Bearer sw-test-key")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"model":"claude-group","messages":[{"role":"user","content":"hi"}]}"#,
                ))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    // The relay log insert is handed to the runtime; give it a moment.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let logs = state.store.load_relay_logs(10).await.expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].request_model, "claude-group");
    assert_eq!(logs[0].actual_model, "claude-3-5-sonnet");
    assert_eq!(logs[0].input_tokens, 3);
    assert_eq!(logs[0].output_tokens, 8);
    assert!(logs[0].response_content.contains("[FILTERED:API_KEY]"));
    assert!(!logs[0].response_content.contains("sk-ABCDEFGHIJKLMNOPQRSTUVWX"));
}
