//! Per-request metric record: duration, first-token latency, token counts,
//! cost, and the relay log row. Costs are computed once, when the canonical
//! response is attached. The stream guard finishes from synchronous
//! contexts (`poll_next`, `Drop`), so it hands the whole save to the
//! runtime via `save_detached`; ordering inside the save is unchanged.

use std::time::Instant;

use tracing::{info, warn};

use crate::pricing::{PriceTable, price_usage};
use crate::protocol::{ChatRequest, ChatResponse};
use crate::server::AppState;
use crate::store::{RelayLog, StatsMetrics};

pub struct RelayMetrics {
    pub api_key_id: i64,
    pub channel_id: i64,
    pub channel_name: String,
    pub request_model: String,
    pub actual_model: String,
    pub start: Instant,
    pub start_unix: i64,
    pub first_token_ms: Option<i64>,
    pub request: Option<ChatRequest>,
    pub response: Option<ChatResponse>,
    pub stats: StatsMetrics,
    saved: bool,
}

impl RelayMetrics {
    pub fn new(request_model: impl Into<String>) -> Self {
        Self {
            api_key_id: 0,
            channel_id: 0,
            channel_name: String::new(),
            request_model: request_model.into(),
            actual_model: String::new(),
            start: Instant::now(),
            start_unix: chrono::Utc::now().timestamp(),
            first_token_ms: None,
            request: None,
            response: None,
            stats: StatsMetrics::default(),
            saved: false,
        }
    }

    pub fn set_api_key(&mut self, id: i64) {
        self.api_key_id = id;
    }

    pub fn set_channel(&mut self, id: i64, name: &str, actual_model: &str) {
        self.channel_id = id;
        self.channel_name = name.to_string();
        self.actual_model = actual_model.to_string();
    }

    pub fn set_request(&mut self, request: &ChatRequest) {
        self.request = Some(request.clone());
    }

    /// First non-empty translated stream event.
    pub fn mark_first_token(&mut self) {
        if self.first_token_ms.is_none() {
            self.first_token_ms = Some(self.start.elapsed().as_millis() as i64);
        }
    }

    /// Attaches the canonical response and prices its usage.
    pub fn set_response(&mut self, response: ChatResponse, prices: &PriceTable) {
        if let Some(usage) = &response.usage {
            self.stats.input_tokens = usage.prompt_tokens;
            self.stats.output_tokens = usage.completion_tokens;
            if let Some(price) = prices.get(&self.actual_model) {
                let (input_cost, output_cost) = price_usage(usage, &price);
                self.stats.input_cost = input_cost;
                self.stats.output_cost = output_cost;
            }
        }
        self.response = Some(response);
    }

    /// Records stats and emits the relay log. Idempotent; the second call is
    /// a no-op so the stream guard's `Drop` cannot double-count.
    pub async fn save(&mut self, app: &AppState, success: bool, error: Option<String>) {
        if self.saved {
            return;
        }
        self.saved = true;

        if success {
            self.stats.request_success = 1;
        } else {
            self.stats.request_failed = 1;
        }
        self.stats.wait_time_ms = self.start.elapsed().as_millis() as i64;

        app.stats
            .record(self.channel_id, &self.actual_model, self.api_key_id, &self.stats)
            .await;

        info!(
            channel = self.channel_id,
            model = %self.actual_model,
            success,
            wait_time_ms = self.stats.wait_time_ms,
            input_tokens = self.stats.input_tokens,
            output_tokens = self.stats.output_tokens,
            cost = self.stats.input_cost + self.stats.output_cost,
            "relay finished"
        );

        let log = self.build_log(app, error);
        if let Err(err) = app.store.insert_relay_log(log).await {
            warn!(%err, "failed to save relay log");
        }
    }

    /// Runs the save on the runtime; for callers that cannot await (the
    /// streaming body's end-of-stream and drop paths).
    pub fn save_detached(mut self, app: AppState, success: bool, error: Option<String>) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                self.save(&app, success, error).await;
            });
        } else {
            warn!("no runtime available to record relay outcome");
        }
    }

    fn build_log(&self, app: &AppState, error: Option<String>) -> RelayLog {
        let mut log = RelayLog {
            time: self.start_unix,
            request_model: self.request_model.clone(),
            channel_name: self.channel_name.clone(),
            channel_id: self.channel_id,
            actual_model: self.actual_model.clone(),
            use_time_ms: self.stats.wait_time_ms,
            first_token_ms: self.first_token_ms.unwrap_or(0),
            error: error.unwrap_or_default(),
            ..RelayLog::default()
        };

        if let Some(response) = &self.response {
            if let Some(usage) = &response.usage {
                log.input_tokens = usage.prompt_tokens;
                log.output_tokens = usage.completion_tokens;
                log.cost = self.stats.input_cost + self.stats.output_cost;
            }
        }

        if let Some(request) = &self.request {
            if let Ok(raw) = serde_json::to_string(request) {
                (log.request_content, _) = app.filter.filter(&raw);
            }
        }

        if let Some(response) = &self.response {
            if let Ok(mut raw) = serde_json::to_string(response) {
                // The Anthropic cache-write count is skipped by the usage
                // serializer; splice it back into the logged payload.
                if let Some(usage) = &response.usage {
                    if usage.anthropic_usage {
                        raw = raw.replacen(
                            "\"usage\":{",
                            &format!(
                                "\"usage\":{{\"cache_creation_input_tokens\":{},",
                                usage.cache_creation_input_tokens
                            ),
                            1,
                        );
                    }
                }
                (log.response_content, _) = app.filter.filter(&raw);
            }
        }

        log
    }
}
