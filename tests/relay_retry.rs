//! Retry accounting: failures before the first byte advance through the
//! group (three full rounds at most), a success stops the rotation, and an
//! exhausted group answers 502 with exactly one failed record.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use httpmock::prelude::*;
use serde_json::json;
use tower::ServiceExt;

use switchyard::dialect::OutboundDialect;
use switchyard::server::{AppState, router};
use switchyard::store::{
    ApiKey, AutoGroupPolicy, BalanceMode, BaseUrl, Channel, ChannelKey, Group, GroupItem, Store,
};

async fn state_with_two_openai_channels(
    primary: String,
    secondary: String,
) -> (tempfile::TempDir, AppState) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::new(dir.path().join("retry.db"));
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
    let mut item_specs = Vec::new();
    for (index, base) in [primary, secondary].into_iter().enumerate() {
        let channel = state
            .registry
            .create_channel(Channel {
                id: 0,
                name: format!("upstream-{index}"),
                dialect: Some(OutboundDialect::OpenAiChat),
                enabled: true,
                base_urls: vec![BaseUrl::new(format!("{base}/v1"))],
                keys: vec![ChannelKey {
                    id: 0,
                    channel_id: 0,
                    key: format!("sk-up-{index}"),
                    enabled: true,
                }],
                models: "gpt-4o".to_string(),
                custom_models: String::new(),
                use_proxy: false,
                auto_sync: false,
                auto_group: AutoGroupPolicy::None,
                channel_proxy: String::new(),
            })
            .await
            .expect("channel");
        item_specs.push(GroupItem {
            id: 0,
            group_id: 0,
            channel_id: channel.id,
            model_name: "gpt-4o".to_string(),
            priority: index as i64,
            weight: 1,
        });
    }
    state
        .registry
        .create_group(Group {
            id: 0,
            name: "gpt-4o".to_string(),
            mode: BalanceMode::Priority,
            match_regex: String::new(),
            items: item_specs,
        })
        .await
        .expect("group");
    (dir, state)
}

fn chat_request() -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sw-test-key")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .expect("request")
}

#[tokio::test]
async fn all_channels_failing_yields_502_after_three_rounds() {
    let first = MockServer::start_async().await;
    let second = MockServer::start_async().await;
    let first_mock = first
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(500).body("boom");
        })
        .await;
    let second_mock = second
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(500).body("boom");
        })
        .await;

    let (_dir, state) =
        state_with_two_openai_channels(first.base_url(), second.base_url()).await;
    let response = router(state.clone())
        .oneshot(chat_request())
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("body");
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(parsed, json!({"error": "all channels failed"}));

    // maxRounds(3) × 2 items = 6 upstream attempts, 3 per channel.
    assert_eq!(first_mock.hits_async().await, 3);
    assert_eq!(second_mock.hits_async().await, 3);

    // Exactly one failed record across the whole request.
    let total = state.stats.total();
    assert_eq!(total.request_failed, 1);
    assert_eq!(total.request_success, 0);
}

#[tokio::test]
async fn success_on_second_item_stops_the_rotation() {
    let first = MockServer::start_async().await;
    let second = MockServer::start_async().await;
    let first_mock = first
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(500).body("boom");
        })
        .await;
    let second_mock = second
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(json!({
                "id": "cmpl-1",
                "object": "chat.completion",
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "finish_reason": "stop",
                    "message": {"role": "assistant", "content": "ok"}
                }],
                "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3}
            }));
        })
        .await;

    let (_dir, state) =
        state_with_two_openai_channels(first.base_url(), second.base_url()).await;
    let response = router(state.clone())
        .oneshot(chat_request())
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(first_mock.hits_async().await, 1);
    assert_eq!(second_mock.hits_async().await, 1);

    let total = state.stats.total();
    assert_eq!(total.request_success, 1);
    assert_eq!(total.request_failed, 0);

    // The failing channel keeps its failure out of the stats entirely; the
    // one success lands on the channel that answered.
    assert_eq!(state.stats.channel(2).request_success, 1);
    assert_eq!(state.stats.channel(1).request_success, 0);
}

#[tokio::test]
async fn disabled_channel_is_skipped_without_an_upstream_call() {
    let first = MockServer::start_async().await;
    let second = MockServer::start_async().await;
    let first_mock = first
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body("unreachable");
        })
        .await;
    let second_mock = second
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(json!({
                "id": "cmpl-2",
                "object": "chat.completion",
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "finish_reason": "stop",
                    "message": {"role": "assistant", "content": "ok"}
                }]
            }));
        })
        .await;

    let (_dir, state) =
        state_with_two_openai_channels(first.base_url(), second.base_url()).await;
    state
        .registry
        .set_channel_enabled(1, false)
        .await
        .expect("disable");

    let response = router(state)
        .oneshot(chat_request())
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(first_mock.hits_async().await, 0);
    assert_eq!(second_mock.hits_async().await, 1);
}

#[tokio::test]
async fn group_without_items_is_503() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::new(dir.path().join("empty.db"));
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
    state
        .registry
        .create_group(Group {
            id: 0,
            name: "gpt-4o".to_string(),
            mode: BalanceMode::Priority,
            match_regex: String::new(),
            items: Vec::new(),
        })
        .await
        .expect("group");

    let response = router(state)
        .oneshot(chat_request())
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
