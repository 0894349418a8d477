//! User-facing HTTP surface: one relay endpoint per inbound dialect, the
//! models listing, and the API-key auth layer. Admin CRUD is not mounted
//! here; the registry exposes those operations as library calls.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, RwLock};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;

use crate::balancer::BalancerRegistry;
use crate::dialect::{AnthropicInbound, GeminiInbound, OpenAiChatInbound};
use crate::httpclient::ClientPool;
use crate::pricing::PriceTable;
use crate::redact::SensitiveFilter;
use crate::registry::Registry;
use crate::relay::{self, RelayInput};
use crate::stats::StatsAggregator;
use crate::store::{ApiKey, Store};
use crate::{Result, sse};

pub struct AppInner {
    pub store: Store,
    pub registry: Registry,
    pub balancers: BalancerRegistry,
    pub stats: StatsAggregator,
    pub prices: PriceTable,
    pub filter: SensitiveFilter,
    pub clients: ClientPool,
    pub auth: AuthKeys,
    pub max_sse_event_bytes: usize,
}

#[derive(Clone)]
pub struct AppState(Arc<AppInner>);

impl Deref for AppState {
    type Target = AppInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AppState {
    pub async fn build(store: Store) -> Result<Self> {
        let registry = Registry::new(store.clone());
        registry.load().await?;

        let stats = StatsAggregator::new(store.clone());
        stats.load().await?;

        let prices = PriceTable::new(store.clone());
        prices.load_local().await?;

        let filter = SensitiveFilter::new(store.clone());
        filter.init().await?;

        let auth = AuthKeys::default();
        auth.reload(&store).await?;

        Ok(Self(Arc::new(AppInner {
            store,
            registry,
            balancers: BalancerRegistry::default(),
            stats,
            prices,
            filter,
            clients: ClientPool::new()?,
            auth,
            max_sse_event_bytes: sse::max_event_bytes(),
        })))
    }
}

/// In-memory API key set; the auth layer never touches the store.
#[derive(Default)]
pub struct AuthKeys {
    keys: RwLock<HashMap<String, ApiKey>>,
}

impl AuthKeys {
    pub async fn reload(&self, store: &Store) -> Result<()> {
        let rows = store.load_api_keys().await?;
        let mut keys = self.keys.write().expect("auth cache poisoned");
        keys.clear();
        for row in rows {
            keys.insert(row.key.clone(), row);
        }
        Ok(())
    }

    pub fn lookup(&self, token: &str) -> Option<ApiKey> {
        self.keys
            .read()
            .expect("auth cache poisoned")
            .get(token)
            .filter(|key| key.enabled)
            .cloned()
    }
}

/// Auth annotations carried into the relay and the models listing.
#[derive(Clone, Debug, Default)]
pub struct ApiKeyContext {
    pub api_key_id: i64,
    /// Comma-separated allowlist; empty allows every model.
    pub supported_models: String,
    /// Set when the caller authenticated the Anthropic way; switches the
    /// models listing shape.
    pub anthropic: bool,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

async fn auth_layer(
    State(app): State<AppState>,
    mut request: axum::extract::Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let (token, anthropic) = if let Some(token) = bearer_token(headers) {
        (Some(token.to_string()), false)
    } else if let Some(token) = headers
        .get("x-api-key")
        .or_else(|| headers.get("x-goog-api-key"))
        .and_then(|value| value.to_str().ok())
    {
        (Some(token.to_string()), true)
    } else {
        (None, false)
    };

    let Some(token) = token else {
        return error_json(StatusCode::UNAUTHORIZED, "missing api key");
    };
    let Some(key) = app.auth.lookup(&token) else {
        return error_json(StatusCode::UNAUTHORIZED, "invalid api key");
    };

    request.extensions_mut().insert(ApiKeyContext {
        api_key_id: key.id,
        supported_models: key.supported_models,
        anthropic,
    });
    next.run(request).await
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(json!({"error": message}))).into_response()
}

fn query_pairs(raw: Option<String>) -> Vec<(String, String)> {
    let Some(raw) = raw else { return Vec::new() };
    let Ok(url) = reqwest::Url::parse(&format!("http://relay.invalid/?{raw}")) else {
        return Vec::new();
    };
    url.query_pairs()
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai_chat))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1beta/models/{model_action}", post(gemini_generate))
        .route("/v1/models", get(list_models))
        .layer(middleware::from_fn_with_state(state.clone(), auth_layer))
        .with_state(state)
}

async fn openai_chat(
    State(app): State<AppState>,
    axum::Extension(auth): axum::Extension<ApiKeyContext>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    body: Bytes,
) -> Response {
    let input = RelayInput {
        query: query_pairs(raw_query),
        auth,
        headers,
        body,
    };
    relay::handle(app, Box::new(OpenAiChatInbound::default()), input).await
}

async fn anthropic_messages(
    State(app): State<AppState>,
    axum::Extension(auth): axum::Extension<ApiKeyContext>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    body: Bytes,
) -> Response {
    let input = RelayInput {
        query: query_pairs(raw_query),
        auth,
        headers,
        body,
    };
    relay::handle(app, Box::new(AnthropicInbound::default()), input).await
}

async fn gemini_generate(
    State(app): State<AppState>,
    axum::Extension(auth): axum::Extension<ApiKeyContext>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return error_json(StatusCode::BAD_REQUEST, "expected models/<model>:<action>");
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => return error_json(StatusCode::NOT_FOUND, "unknown action"),
    };

    let input = RelayInput {
        query: query_pairs(raw_query)
            .into_iter()
            // Never forward the caller's Gemini credential upstream.
            .filter(|(name, _)| name != "key" && name != "alt")
            .collect(),
        auth,
        headers,
        body,
    };
    relay::handle(
        app,
        Box::new(GeminiInbound::new(model.to_string(), stream)),
        input,
    )
    .await
}

async fn list_models(
    State(app): State<AppState>,
    axum::Extension(auth): axum::Extension<ApiKeyContext>,
) -> Response {
    let models = app.registry.model_names();

    if auth.anthropic {
        let data: Vec<_> = models
            .iter()
            .map(|name| {
                json!({
                    "id": name,
                    "created_at": "2024-01-01T00:00:00Z",
                    "display_name": name,
                    "type": "model",
                })
            })
            .collect();
        let body = json!({
            "data": data,
            "first_id": models.first(),
            "has_more": false,
            "last_id": models.last(),
        });
        return axum::Json(body).into_response();
    }

    let data: Vec<_> = models
        .iter()
        .map(|name| {
            json!({
                "id": name,
                "object": "model",
                "created": 1763395200,
                "owned_by": "switchyard",
            })
        })
        .collect();
    axum::Json(json!({"object": "list", "data": data})).into_response()
}
