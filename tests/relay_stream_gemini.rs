//! Streaming through a Gemini upstream: SSE events are translated into
//! OpenAI chunks on the fly, the first translated event stamps the
//! first-token latency, and the assembled canonical response feeds metering
//! even though no single response body ever existed.

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

async fn state_with_gemini_channel(base_url: String) -> (tempfile::TempDir, AppState) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::new(dir.path().join("stream.db"));
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
            name: "gemini-upstream".to_string(),
            dialect: Some(OutboundDialect::GeminiGenerateContent),
            enabled: true,
            base_urls: vec![BaseUrl::new(base_url)],
            keys: vec![ChannelKey {
                id: 0,
                channel_id: 0,
                key: "g-upstream-key".to_string(),
                enabled: true,
            }],
            models: "gemini-2.0-flash".to_string(),
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
            name: "flash".to_string(),
            mode: BalanceMode::Priority,
            match_regex: String::new(),
            items: vec![GroupItem {
                id: 0,
                group_id: 0,
                channel_id: channel.id,
                model_name: "gemini-2.0-flash".to_string(),
                priority: 0,
                weight: 1,
            }],
        })
        .await
        .expect("group");
    state
        .prices
        .set_local(
            "gemini-2.0-flash".to_string(),
            LlmPrice {
                input: 0.1,
                output: 0.4,
                cache_read: 0.025,
                cache_write: 0.0,
            },
        )
        .await
        .expect("price");
    (dir, state)
}

fn gemini_chunk(text: &str) -> serde_json::Value {
    json!({
        "candidates": [{
            "index": 0,
            "content": {"role": "model", "parts": [{"text": text}]}
        }]
    })
}

fn sse_body() -> String {
    let final_chunk = json!({
        "candidates": [{
            "index": 0,
            "content": {"role": "model", "parts": [{"text": "!"}]},
            "finishReason": "STOP"
        }],
        "usageMetadata": {
            "promptTokenCount": 4,
            "candidatesTokenCount": 3,
            "totalTokenCount": 7
        }
    });
    format!(
        "data: {}\n\ndata: {}\n\ndata: {}\n\n",
        gemini_chunk("hel"),
        gemini_chunk("lo"),
        final_chunk
    )
}

#[tokio::test]
async fn streaming_translates_events_and_records_first_token() {
    let server = MockServer::start_async().await;
    let upstream = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/gemini-2.0-flash:streamGenerateContent")
                .query_param("alt", "sse")
                .query_param("key", "g-upstream-key");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body());
        })
        .await;

    let (_dir, state) = state_with_gemini_channel(format!("{}/v1beta", server.base_url())).await;
    let response = router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("authorization", "Bearer sw-test-key")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"model":"flash","messages":[{"role":"user","content":"hi"}],"stream":true}"#,
                ))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(
        response
            .headers()
            .get("x-accel-buffering")
            .and_then(|v| v.to_str().ok()),
        Some("no")
    );
    upstream.assert_async().await;

    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    let rendered = String::from_utf8(body.to_vec()).expect("utf8");

    // Each upstream event became one OpenAI chunk; concatenated deltas give
    // the full message.
    let mut content = String::new();
    let mut finish = None;
    for line in rendered.lines() {
        let Some(data) = line.strip_prefix("data: ") else { continue };
        let chunk: serde_json::Value = serde_json::from_str(data).expect("chunk json");
        assert_eq!(chunk["object"], json!("chat.completion.chunk"));
        if let Some(text) = chunk["choices"][0]["delta"]["content"].as_str() {
            content.push_str(text);
        }
        if let Some(reason) = chunk["choices"][0]["finish_reason"].as_str() {
            finish = Some(reason.to_string());
        }
    }
    assert_eq!(content, "hello!");
    assert_eq!(finish.as_deref(), Some("stop"));

    // The stream guard saves after the body is fully consumed.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let total = state.stats.total();
    assert_eq!(total.request_success, 1);
    assert_eq!(total.input_tokens, 4);
    assert_eq!(total.output_tokens, 3);

    let logs = state.store.load_relay_logs(10).await.expect("logs");
    assert_eq!(logs.len(), 1);
    assert!(logs[0].first_token_ms >= 0);
    assert!(logs[0].first_token_ms <= logs[0].use_time_ms);
    assert_eq!(logs[0].input_tokens, 4);
    assert_eq!(logs[0].output_tokens, 3);
    assert!(logs[0].cost > 0.0);
}

#[tokio::test]
async fn stream_upstream_500_is_retried_before_first_byte() {
    let bad = MockServer::start_async().await;
    let good = MockServer::start_async().await;
    let bad_mock = bad
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1beta/models/gemini-2.0-flash:streamGenerateContent");
            then.status(500).body("boom");
        })
        .await;
    good.mock_async(|when, then| {
        when.method(POST)
            .path("/v1beta/models/gemini-2.0-flash:streamGenerateContent");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(sse_body());
    })
    .await;

    let (_dir, state) = state_with_gemini_channel(format!("{}/v1beta", bad.base_url())).await;
    let channel = state
        .registry
        .create_channel(Channel {
            id: 0,
            name: "gemini-fallback".to_string(),
            dialect: Some(OutboundDialect::GeminiGenerateContent),
            enabled: true,
            base_urls: vec![BaseUrl::new(format!("{}/v1beta", good.base_url()))],
            keys: vec![ChannelKey {
                id: 0,
                channel_id: 0,
                key: "g-upstream-key".to_string(),
                enabled: true,
            }],
            models: "gemini-2.0-flash".to_string(),
            custom_models: String::new(),
            use_proxy: false,
            auto_sync: false,
            auto_group: AutoGroupPolicy::None,
            channel_proxy: String::new(),
        })
        .await
        .expect("channel");
    let group = state.registry.group_by_model("flash").expect("group");
    state
        .registry
        .add_group_item(GroupItem {
            id: 0,
            group_id: group.id,
            channel_id: channel.id,
            model_name: "gemini-2.0-flash".to_string(),
            priority: 1,
            weight: 1,
        })
        .await
        .expect("item");

    let response = router(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("authorization", "Bearer sw-test-key")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"model":"flash","messages":[{"role":"user","content":"hi"}],"stream":true}"#,
                ))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(bad_mock.hits_async().await, 1);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    assert!(String::from_utf8(body.to_vec()).expect("utf8").contains("hel"));
}
