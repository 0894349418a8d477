//! Relay orchestration: drive one user request through parse → gate →
//! resolve → iterate → forward → dispatch → record.
//!
//! Failures before the first byte reaches the client advance to the next
//! group item (at most `MAX_ROUNDS` full passes); anything after the first
//! byte is terminal and only shows up in the metric record. To keep that
//! boundary honest for streams, the first translated event is pulled
//! eagerly before the response is committed.

mod metrics;

pub use metrics::RelayMetrics;

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::Stream;
use futures_util::stream::BoxStream;
use serde_json::json;
use tracing::{info, warn};

use crate::dialect::{Inbound, Outbound, outbound};
use crate::protocol::ChatRequest;
use crate::server::{ApiKeyContext, AppState};
use crate::sse;
use crate::store::Channel;
use crate::{RelayError, Result};

pub const MAX_ROUNDS: usize = 3;

/// Headers never forwarded upstream (credentials and hop-by-hop plumbing).
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "host",
    "accept-encoding",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|denied| denied.eq_ignore_ascii_case(name))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = json!({"error": message}).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response")
}

/// Everything the route handler hands to the relay.
pub struct RelayInput {
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Bytes,
    pub auth: ApiKeyContext,
}

pub async fn handle(app: AppState, mut inbound: Box<dyn Inbound>, input: RelayInput) -> Response {
    // Parse.
    let mut request = match inbound.transform_request(&input.body) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };
    for (name, value) in &input.query {
        request.query.insert(name.clone(), value.clone());
    }
    if let Err(err) = request.validate() {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }

    // Gate.
    if !input.auth.supported_models.is_empty()
        && !input
            .auth
            .supported_models
            .split(',')
            .map(str::trim)
            .any(|allowed| allowed == request.model)
    {
        return error_response(StatusCode::BAD_REQUEST, "model not supported");
    }

    let mut metrics = RelayMetrics::new(&request.model);
    metrics.set_api_key(input.auth.api_key_id);
    metrics.set_request(&request);

    // Resolve.
    let Some(group) = app.registry.group_by_model(&request.model) else {
        return error_response(StatusCode::NOT_FOUND, "model not found");
    };

    // Iterate.
    let items = group.items.clone();
    let item_count = items.len();
    let mut rotation = app.balancers.rotation(&group);
    let mut last_err: Option<RelayError> = None;

    for round in 0..MAX_ROUNDS {
        let Some(mut index) = rotation.select(&items) else {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "no available channel");
        };

        for attempt in 0..item_count {
            let item = &items[index];
            match prepare(&app, item.channel_id) {
                Err(err) => last_err = Some(err),
                Ok((channel, dialect, key)) => {
                    info!(
                        model = %metrics.request_model,
                        channel = %channel.name,
                        upstream_model = %item.model_name,
                        round = round + 1,
                        attempt = attempt + 1,
                        "forwarding request"
                    );

                    request.model = item.model_name.clone();
                    metrics.set_channel(channel.id, &channel.name, &item.model_name);
                    let adapter = outbound(dialect);

                    match forward(
                        &app,
                        inbound,
                        adapter,
                        &request,
                        &channel,
                        &key,
                        &input.headers,
                        metrics,
                    )
                    .await
                    {
                        ForwardResult::Done(response) => return response,
                        ForwardResult::Retry(returned_inbound, returned_metrics, err) => {
                            warn!(channel = %channel.name, %err, "channel attempt failed");
                            inbound = returned_inbound;
                            metrics = returned_metrics;
                            last_err = Some(err);
                        }
                    }
                }
            }

            match rotation.next(&items, index) {
                Some(next) => index = next,
                None => break,
            }
        }
    }

    // All channels failed.
    let message = last_err.map(|err| err.to_string());
    metrics.save(&app, false, message).await;
    error_response(StatusCode::BAD_GATEWAY, "all channels failed")
}

/// Resolves the item's channel into something routable, or the error that
/// lets the relay advance to the next item.
fn prepare(
    app: &AppState,
    channel_id: i64,
) -> Result<(Channel, crate::dialect::OutboundDialect, String)> {
    let Some(channel) = app.registry.channel(channel_id) else {
        return Err(RelayError::NoChannel);
    };
    if !channel.enabled {
        warn!(channel = %channel.name, "channel is disabled");
        return Err(RelayError::NoChannel);
    }
    let Some(dialect) = channel.dialect else {
        warn!(channel = %channel.name, "unsupported channel dialect");
        return Err(RelayError::Translation(format!(
            "unsupported channel dialect for {}",
            channel.name
        )));
    };
    let Some(key) = app.registry.next_key(&channel) else {
        warn!(channel = %channel.name, "channel has no enabled credential");
        return Err(RelayError::NoChannel);
    };
    Ok((channel, dialect, key))
}

enum ForwardResult {
    /// Response committed to the client; metrics already saved (or owned by
    /// the stream guard).
    Done(Response),
    /// Nothing written yet; the relay may advance to the next item.
    Retry(Box<dyn Inbound>, RelayMetrics, RelayError),
}

#[allow(clippy::too_many_arguments)]
async fn forward(
    app: &AppState,
    mut inbound: Box<dyn Inbound>,
    adapter: Box<dyn Outbound>,
    request: &ChatRequest,
    channel: &Channel,
    key: &str,
    headers: &HeaderMap,
    mut metrics: RelayMetrics,
) -> ForwardResult {
    match attempt(
        app,
        &mut inbound,
        adapter.as_ref(),
        request,
        channel,
        key,
        headers,
        &mut metrics,
    )
    .await
    {
        Ok(AttemptOutcome::NonStream(body)) => {
            if let Some(response) = inbound.internal_response() {
                metrics.set_response(response, &app.prices);
            }
            metrics.save(app, true, None).await;
            let response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .expect("response build");
            ForwardResult::Done(response)
        }
        Ok(AttemptOutcome::Stream { first, events }) => {
            let stream = RelayStream {
                state: Some(StreamState {
                    app: app.clone(),
                    inbound,
                    adapter,
                    events,
                    metrics,
                    pending: first.into_iter().collect(),
                }),
            };
            let response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::CONNECTION, "keep-alive")
                .header("x-accel-buffering", HeaderValue::from_static("no"))
                .body(Body::from_stream(stream))
                .expect("response build");
            ForwardResult::Done(response)
        }
        Err(err) => ForwardResult::Retry(inbound, metrics, err),
    }
}

enum AttemptOutcome {
    NonStream(Vec<u8>),
    Stream {
        /// First translated event, pulled before the response commits so
        /// pre-first-byte failures stay retriable.
        first: Option<Bytes>,
        events: BoxStream<'static, Result<String>>,
    },
}

#[allow(clippy::too_many_arguments)]
async fn attempt(
    app: &AppState,
    inbound: &mut Box<dyn Inbound>,
    adapter: &dyn Outbound,
    request: &ChatRequest,
    channel: &Channel,
    key: &str,
    headers: &HeaderMap,
    metrics: &mut RelayMetrics,
) -> Result<AttemptOutcome> {
    let base_url = channel
        .primary_base_url()
        .ok_or_else(|| RelayError::Translation(format!("channel {} has no base url", channel.name)))?;

    let mut outbound_request = adapter.transform_request(request, base_url, key)?;
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        outbound_request.headers_mut().insert(name.clone(), value.clone());
    }

    let client = app.clients.client(channel.use_proxy, &channel.channel_proxy)?;
    let response = client.execute(outbound_request).await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RelayError::Upstream {
            status: status.as_u16(),
            body,
        });
    }

    if request.is_stream() {
        let mut events = sse::event_stream_from_response(response, app.max_sse_event_bytes);
        let first = next_translated_event(&mut events, inbound, adapter).await?;
        if first.is_some() {
            metrics.mark_first_token();
        }
        Ok(AttemptOutcome::Stream { first, events })
    } else {
        let canonical = adapter.transform_response(response).await?;
        let body = inbound.transform_response(&canonical)?;
        Ok(AttemptOutcome::NonStream(body))
    }
}

async fn next_translated_event(
    events: &mut BoxStream<'static, Result<String>>,
    inbound: &mut Box<dyn Inbound>,
    adapter: &dyn Outbound,
) -> Result<Option<Bytes>> {
    use futures_util::StreamExt;
    while let Some(event) = events.next().await {
        let data = event?;
        let Some(chunk) = adapter.transform_stream(data.as_bytes())? else {
            continue;
        };
        if let Some(bytes) = inbound.transform_stream(&chunk)? {
            return Ok(Some(Bytes::from(bytes)));
        }
    }
    Ok(None)
}

struct StreamState {
    app: AppState,
    inbound: Box<dyn Inbound>,
    adapter: Box<dyn Outbound>,
    events: BoxStream<'static, Result<String>>,
    metrics: RelayMetrics,
    pending: VecDeque<Bytes>,
}

impl StreamState {
    fn collect_and_save(mut self, success: bool, error: Option<String>) {
        if let Some(response) = self.inbound.internal_response() {
            self.metrics.set_response(response, &self.app.prices);
        }
        let StreamState { app, metrics, .. } = self;
        metrics.save_detached(app, success, error);
    }
}

/// Streaming body. Mid-stream failures end the stream and record a failed
/// outcome; they are never retried because the client has already seen
/// bytes. Dropping the stream (client disconnect) records whichever side
/// completed.
struct RelayStream {
    state: Option<StreamState>,
}

impl RelayStream {
    fn finish(&mut self, success: bool, error: Option<String>) {
        if let Some(state) = self.state.take() {
            state.collect_and_save(success, error);
        }
    }
}

impl Stream for RelayStream {
    type Item = std::result::Result<Bytes, std::convert::Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        use futures_util::StreamExt;
        let this = self.get_mut();
        loop {
            let Some(state) = this.state.as_mut() else {
                return Poll::Ready(None);
            };
            if let Some(bytes) = state.pending.pop_front() {
                return Poll::Ready(Some(Ok(bytes)));
            }
            match state.events.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    info!("stream end");
                    this.finish(true, None);
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Err(err))) => {
                    warn!(%err, "failed to read stream event");
                    this.finish(false, Some(err.to_string()));
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Ok(data))) => {
                    let translated = state
                        .adapter
                        .transform_stream(data.as_bytes())
                        .and_then(|chunk| match chunk {
                            Some(chunk) => state.inbound.transform_stream(&chunk),
                            None => Ok(None),
                        });
                    match translated {
                        Ok(Some(bytes)) => return Poll::Ready(Some(Ok(Bytes::from(bytes)))),
                        Ok(None) => continue,
                        Err(err) => {
                            warn!(%err, "failed to transform stream event");
                            this.finish(false, Some(err.to_string()));
                            return Poll::Ready(None);
                        }
                    }
                }
            }
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            // Client disconnect: a partial stream ends without an error.
            // Success if the inbound adapter assembled a usable response.
            let usable = state.inbound.internal_response().is_some();
            info!("client disconnected, stopping stream");
            let error = (!usable).then(|| RelayError::Canceled.to_string());
            state.collect_and_save(usable, error);
        }
    }
}
