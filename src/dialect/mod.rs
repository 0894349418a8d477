//! Dialect adapters: bidirectional translation between vendor wire formats
//! and the canonical representation.
//!
//! The inbound half faces the caller (parse the request body, shape
//! responses and stream events back into the caller's dialect); the
//! outbound half faces the upstream (build the HTTP request, decode the
//! response or stream). Inbound adapters are per-request objects: they
//! accumulate streamed deltas so `internal_response` can hand metering a
//! complete canonical response. Outbound adapters are stateless.

use async_trait::async_trait;

use crate::Result;
use crate::protocol::{ChatRequest, ChatResponse};

mod anthropic;
mod gemini;
mod openai;
mod openai_responses;
mod volcengine;

pub use anthropic::{ANTHROPIC_VERSION, AnthropicInbound, AnthropicOutbound};
pub use gemini::{GeminiInbound, GeminiOutbound};
pub use openai::{OpenAiChatInbound, OpenAiChatOutbound};
pub use openai_responses::OpenAiResponsesOutbound;
pub use volcengine::VolcengineOutbound;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundDialect {
    OpenAiChat,
    AnthropicMessages,
    GeminiGenerateContent,
}

/// Stable integer tags; persisted in the channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundDialect {
    OpenAiChat = 0,
    OpenAiResponses = 1,
    AnthropicMessages = 2,
    GeminiGenerateContent = 3,
    VolcengineResponses = 4,
}

impl OutboundDialect {
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            0 => Some(OutboundDialect::OpenAiChat),
            1 => Some(OutboundDialect::OpenAiResponses),
            2 => Some(OutboundDialect::AnthropicMessages),
            3 => Some(OutboundDialect::GeminiGenerateContent),
            4 => Some(OutboundDialect::VolcengineResponses),
            _ => None,
        }
    }

    pub fn tag(&self) -> i64 {
        *self as i64
    }
}

pub trait Inbound: Send {
    /// Decode the raw request body into the canonical request.
    fn transform_request(&mut self, body: &[u8]) -> Result<ChatRequest>;
    /// Encode a complete canonical response into the caller's dialect.
    fn transform_response(&mut self, response: &ChatResponse) -> Result<Vec<u8>>;
    /// Encode one canonical streaming delta into caller-dialect SSE bytes.
    /// `None` means the delta produces no wire output for this dialect.
    fn transform_stream(&mut self, chunk: &ChatResponse) -> Result<Option<Vec<u8>>>;
    /// The canonical response this adapter has observed so far: the buffered
    /// response for non-streaming calls, the assembled deltas for streams.
    fn internal_response(&self) -> Option<ChatResponse>;
}

#[async_trait]
pub trait Outbound: Send + Sync {
    /// Build the upstream HTTP request from the canonical request.
    fn transform_request(
        &self,
        request: &ChatRequest,
        base_url: &str,
        key: &str,
    ) -> Result<reqwest::Request>;
    /// Decode a complete upstream response into the canonical response.
    async fn transform_response(&self, response: reqwest::Response) -> Result<ChatResponse>;
    /// Decode one upstream SSE event payload into a canonical delta.
    /// `None` means the event carries nothing for the caller (keep-alives,
    /// bookkeeping events).
    fn transform_stream(&self, event: &[u8]) -> Result<Option<ChatResponse>>;
}

pub fn inbound(dialect: InboundDialect) -> Box<dyn Inbound> {
    match dialect {
        InboundDialect::OpenAiChat => Box::new(OpenAiChatInbound::default()),
        InboundDialect::AnthropicMessages => Box::new(AnthropicInbound::default()),
        // The Gemini inbound needs the model and stream flag from the URL
        // path; routes construct it directly via `GeminiInbound::new`.
        InboundDialect::GeminiGenerateContent => Box::new(GeminiInbound::new(String::new(), false)),
    }
}

pub fn outbound(dialect: OutboundDialect) -> Box<dyn Outbound> {
    match dialect {
        OutboundDialect::OpenAiChat => Box::new(OpenAiChatOutbound),
        OutboundDialect::OpenAiResponses => Box::new(OpenAiResponsesOutbound),
        OutboundDialect::AnthropicMessages => Box::new(AnthropicOutbound),
        OutboundDialect::GeminiGenerateContent => Box::new(GeminiOutbound),
        OutboundDialect::VolcengineResponses => Box::new(VolcengineOutbound),
    }
}

pub(crate) fn sse_data_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\n\n");
    out
}

pub(crate) fn sse_event_frame(event: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + event.len() + 16);
    out.extend_from_slice(b"event: ");
    out.extend_from_slice(event.as_bytes());
    out.extend_from_slice(b"\ndata: ");
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\n\n");
    out
}

pub(crate) fn join_base_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

pub(crate) fn parse_url(raw: &str) -> Result<reqwest::Url> {
    reqwest::Url::parse(raw)
        .map_err(|err| crate::RelayError::Translation(format!("invalid upstream url {raw}: {err}")))
}
