//! Shared SSE streaming for provider adapters.
//!
//! A provider receives a `reqwest::Response`, buffers chunks, splits on
//! `\n\n`, extracts `data:` payloads, and feeds each payload to its own
//! [`SseParser`].  Cancellation is observed between chunks.

use sb_domain::error::Result;
use sb_domain::stream::{BoxStream, StreamEvent};
use tokio_util::sync::CancellationToken;

use crate::util::from_reqwest;

/// Provider-specific SSE payload parser.
pub(crate) trait SseParser: Send + 'static {
    /// Turn one `data:` payload into zero or more stream events.
    fn parse(&mut self, data: &str) -> Vec<Result<StreamEvent>>;

    /// Closing events when the caller cancels mid-stream.  Must include a
    /// `Done` carrying the usage seen so far.
    fn on_cancel(&mut self) -> Vec<Result<StreamEvent>>;
}

/// Extract complete `data:` payloads from an SSE buffer.
///
/// The buffer is drained in-place: consumed bytes are removed and any
/// trailing partial event remains for the next call.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

enum Next<T> {
    Chunk(T),
    Cancelled,
}

/// Build a [`BoxStream`] from an SSE response and a parser.
///
/// The stream flushes the remaining buffer when the body closes and emits a
/// fallback `Done` if the parser never produced one.
pub(crate) fn sse_response_stream<P: SseParser>(
    response: reqwest::Response,
    mut parser: P,
    cancel: Option<CancellationToken>,
) -> BoxStream<'static, Result<StreamEvent>> {
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut done_emitted = false;

        loop {
            let next = match &cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => Next::Cancelled,
                    chunk = response.chunk() => Next::Chunk(chunk),
                },
                None => Next::Chunk(response.chunk().await),
            };

            match next {
                Next::Cancelled => {
                    tracing::debug!("sse stream cancelled by caller");
                    for event in parser.on_cancel() {
                        if matches!(&event, Ok(StreamEvent::Done { .. })) {
                            done_emitted = true;
                        }
                        yield event;
                    }
                    break;
                }
                Next::Chunk(Ok(Some(bytes))) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for data in drain_data_lines(&mut buffer) {
                        for event in parser.parse(&data) {
                            if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                done_emitted = true;
                            }
                            yield event;
                        }
                    }
                }
                Next::Chunk(Ok(None)) => {
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for data in drain_data_lines(&mut buffer) {
                            for event in parser.parse(&data) {
                                if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                    done_emitted = true;
                                }
                                yield event;
                            }
                        }
                    }
                    break;
                }
                Next::Chunk(Err(e)) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            }
        }

        if !done_emitted {
            yield Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            });
        }
    };

    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_multiple_events() {
        let mut buf = String::from("event: a\ndata: first\n\ndata: second\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["first", "second"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_event_stays_buffered() {
        let mut buf = String::from("data: complete\n\ndata: part");
        assert_eq!(drain_data_lines(&mut buf), vec!["complete"]);
        assert_eq!(buf, "data: part");

        buf.push_str("ial\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["partial"]);
    }

    #[test]
    fn non_data_and_empty_lines_ignored() {
        let mut buf = String::from("event: ping\nid: 4\nretry: 10\ndata: \n\ndata:  {\"k\":1}  \n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["{\"k\":1}"]);
    }
}
