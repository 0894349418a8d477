//! Bounded server-sent-event reader for upstream streaming responses.
//!
//! Yields the `data:` payload of each event, including the literal `[DONE]`
//! terminator: the relay forwards it downstream, so unlike a client-side
//! parser this reader must not swallow it.

use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

use crate::{RelayError, Result};

pub const DEFAULT_MAX_EVENT_BYTES: usize = 2 * 1024 * 1024;

const MAX_EVENT_SIZE_ENV: &str = "SWITCHYARD_RELAY_MAX_SSE_EVENT_SIZE";

/// Event-size bound, overridable via `SWITCHYARD_RELAY_MAX_SSE_EVENT_SIZE`.
pub fn max_event_bytes() -> usize {
    if let Ok(raw) = std::env::var(MAX_EVENT_SIZE_ENV) {
        if let Ok(value) = raw.trim().parse::<usize>() {
            if value > 0 {
                return value;
            }
        }
    }
    DEFAULT_MAX_EVENT_BYTES
}

async fn read_line_limited<R>(reader: &mut R, out: &mut Vec<u8>, max_bytes: usize) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    out.clear();

    loop {
        let buf = reader.fill_buf().await.map_err(|err| {
            RelayError::Translation(format!("failed to read SSE line: {err}"))
        })?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }

        let newline_pos = buf.iter().position(|b| *b == b'\n');
        let take_len = newline_pos.map(|pos| pos + 1).unwrap_or(buf.len());

        if out.len().saturating_add(take_len) > max_bytes {
            return Err(RelayError::Translation(format!(
                "SSE line exceeds max event size {max_bytes}"
            )));
        }

        out.extend_from_slice(&buf[..take_len]);
        reader.consume(take_len);

        if newline_pos.is_some() {
            return Ok(true);
        }
    }
}

async fn read_event_data<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    buffer: &mut String,
    max_bytes: usize,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buffer.clear();

    loop {
        let has_line = read_line_limited(reader, line, max_bytes).await?;
        if !has_line {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        let text = std::str::from_utf8(line)
            .map_err(|err| RelayError::Translation(format!("invalid SSE UTF-8: {err}")))?;
        let text = text.trim_end_matches(['\r', '\n']);

        if text.is_empty() {
            if buffer.is_empty() {
                continue;
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        if let Some(rest) = text.strip_prefix("data:") {
            let rest = rest.trim_start();
            let separator = usize::from(!buffer.is_empty());
            if buffer.len().saturating_add(separator).saturating_add(rest.len()) > max_bytes {
                return Err(RelayError::Translation(format!(
                    "SSE event exceeds max event size {max_bytes}"
                )));
            }
            if separator == 1 {
                buffer.push('\n');
            }
            buffer.push_str(rest);
        }
    }
}

pub fn event_stream_from_reader<R>(reader: R, max_bytes: usize) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        (reader, Vec::<u8>::new(), String::new(), max_bytes),
        |(mut reader, mut line, mut buffer, max_bytes)| async move {
            match read_event_data(&mut reader, &mut line, &mut buffer, max_bytes).await? {
                Some(data) => Ok(Some((data, (reader, line, buffer, max_bytes)))),
                None => Ok(None),
            }
        },
    ))
}

pub fn event_stream_from_response(
    response: reqwest::Response,
    max_bytes: usize,
) -> BoxStream<'static, Result<String>> {
    let byte_stream = response.bytes_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(byte_stream);
    event_stream_from_reader(tokio::io::BufReader::new(reader), max_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use futures_util::stream;

    async fn collect(sse: &str, max_bytes: usize) -> Result<Vec<String>> {
        let byte_stream = stream::iter([Ok::<_, std::io::Error>(Bytes::from(sse.to_owned()))]);
        let reader = StreamReader::new(byte_stream);
        let mut events = event_stream_from_reader(tokio::io::BufReader::new(reader), max_bytes);
        let mut out = Vec::new();
        while let Some(item) = events.next().await {
            out.push(item?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn parses_data_lines_and_surfaces_done() -> Result<()> {
        let sse = concat!(
            "event: message\n",
            "data: {\"hello\":1}\n\n",
            "data: line1\n",
            "data: line2\n\n",
            "data: [DONE]\n\n",
        );
        let out = collect(sse, DEFAULT_MAX_EVENT_BYTES).await?;
        assert_eq!(out, vec!["{\"hello\":1}", "line1\nline2", "[DONE]"]);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_events_over_bound() {
        let sse = format!("data: {}\n\n", "x".repeat(256));
        let err = collect(&sse, 64).await.expect_err("bound exceeded");
        assert!(err.to_string().contains("max event size"));
    }

    #[tokio::test]
    async fn accepts_event_exactly_at_bound() -> Result<()> {
        let out = collect("data: abcde\n\n", "data: abcde\n".len()).await?;
        assert_eq!(out, vec!["abcde"]);
        Ok(())
    }
}
