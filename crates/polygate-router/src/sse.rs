use std::time::Duration;

use bytes::Bytes;
use polygate_translate::unified::{FinishReason, UnifiedDelta};
use polygate_translate::{anthropic, gemini, openai, Dialect};
use serde::Serialize;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";

/// Turns unified deltas into the client dialect's stream frames:
/// `data:`-only SSE for OpenAI (with a `[DONE]` trailer), typed SSE events
/// for Anthropic, newline-delimited JSON for Gemini.
pub(crate) struct DialectFramer {
    inner: FramerInner,
    done_sent: bool,
}

enum FramerInner {
    OpenAi(openai::StreamEncoder),
    Anthropic(anthropic::StreamEncoder),
    Gemini(gemini::StreamEncoder),
}

impl DialectFramer {
    pub(crate) fn new(dialect: Dialect, model: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let inner = match dialect {
            Dialect::OpenAi => {
                FramerInner::OpenAi(openai::StreamEncoder::new(format!("chatcmpl-{suffix}"), model))
            }
            Dialect::Anthropic => FramerInner::Anthropic(anthropic::StreamEncoder::new(
                format!("msg_{suffix}"),
                model,
            )),
            Dialect::Gemini => {
                FramerInner::Gemini(gemini::StreamEncoder::new(format!("gen-{suffix}"), model))
            }
        };
        Self {
            inner,
            done_sent: false,
        }
    }

    pub(crate) fn frame(&mut self, delta: &UnifiedDelta) -> Vec<Bytes> {
        let terminal = delta.is_terminal();
        let mut frames: Vec<Bytes> = match &mut self.inner {
            FramerInner::OpenAi(encoder) => {
                encoder.push(delta).iter().filter_map(data_frame).collect()
            }
            FramerInner::Anthropic(encoder) => encoder
                .push(delta)
                .iter()
                .filter_map(|event| named_frame(event.event_name(), event))
                .collect(),
            FramerInner::Gemini(encoder) => {
                encoder.push(delta).iter().filter_map(json_line).collect()
            }
        };
        if terminal {
            frames.extend(self.trailer());
        }
        frames
    }

    /// Upstream failure mid-stream: emit the dialect's error shape and close.
    pub(crate) fn frame_error(&mut self, message: &str) -> Vec<Bytes> {
        tracing::warn!(event = "stream_failed", error = %message);
        self.frame(&UnifiedDelta::finish(FinishReason::Error))
    }

    /// End of stream without a terminal delta.
    pub(crate) fn finish(&mut self) -> Vec<Bytes> {
        self.trailer()
    }

    fn trailer(&mut self) -> Vec<Bytes> {
        if self.done_sent {
            return Vec::new();
        }
        match self.inner {
            FramerInner::OpenAi(_) => {
                self.done_sent = true;
                vec![Bytes::from_static(b"data: [DONE]\n\n")]
            }
            _ => {
                self.done_sent = true;
                Vec::new()
            }
        }
    }
}

fn data_frame<T: Serialize>(value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(&payload);
    out.extend_from_slice(b"\n\n");
    Some(Bytes::from(out))
}

fn named_frame<T: Serialize>(name: &str, value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    let mut out = Vec::with_capacity(payload.len() + name.len() + 16);
    out.extend_from_slice(b"event: ");
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b"\ndata: ");
    out.extend_from_slice(&payload);
    out.extend_from_slice(b"\n\n");
    Some(Bytes::from(out))
}

fn json_line<T: Serialize>(value: &T) -> Option<Bytes> {
    let mut payload = serde_json::to_vec(value).ok()?;
    payload.push(b'\n');
    Some(Bytes::from(payload))
}

/// Idle client streams get SSE comment frames so intermediaries keep the
/// connection open.
pub(crate) fn wrap_with_heartbeat(
    mut upstream: tokio::sync::mpsc::Receiver<Bytes>,
) -> tokio::sync::mpsc::Receiver<Bytes> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                frame = upstream.recv() => {
                    let Some(frame) = frame else { break };
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(HEARTBEAT_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_stream_ends_with_done() {
        let mut framer = DialectFramer::new(Dialect::OpenAi, "m");
        let frames = framer.frame(&UnifiedDelta::content("hi"));
        assert!(frames[0].starts_with(b"data: "));
        let frames = framer.frame(&UnifiedDelta::finish(FinishReason::Stop));
        let last = frames.last().unwrap();
        assert_eq!(last.as_ref(), b"data: [DONE]\n\n");
        // The trailer only fires once.
        assert!(framer.finish().is_empty());
    }

    #[test]
    fn anthropic_frames_are_typed() {
        let mut framer = DialectFramer::new(Dialect::Anthropic, "m");
        let frames = framer.frame(&UnifiedDelta::content("hi"));
        let text = String::from_utf8(frames[0].to_vec()).unwrap();
        assert!(text.starts_with("event: message_start\n"));
        let finish = framer.frame(&UnifiedDelta::finish(FinishReason::Stop));
        let closing = String::from_utf8(finish.last().unwrap().to_vec()).unwrap();
        assert!(closing.starts_with("event: message_stop\n"));
    }

    #[test]
    fn gemini_frames_are_json_lines() {
        let mut framer = DialectFramer::new(Dialect::Gemini, "m");
        let frames = framer.frame(&UnifiedDelta::content("hi"));
        let text = String::from_utf8(frames[0].to_vec()).unwrap();
        assert!(text.ends_with('\n'));
        assert!(serde_json::from_str::<serde_json::Value>(text.trim()).is_ok());
    }
}
