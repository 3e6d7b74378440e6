//! Stateful reconstruction of the web-chat event stream. The backend mixes
//! answer tokens, thinking tokens, tool-call markup, media generation
//! progress, and housekeeping tags into one noisy sequence; this module turns
//! it back into a clean unified delta stream.

use polygate_translate::unified::{
    FinishReason, Role, ToolCallDelta, UnifiedDelta,
};
use serde::Deserialize;
use serde_json::Value;

const TOOL_OPEN: &str = "<tool_call>";
const TOOL_CLOSE: &str = "</tool_call>";

/// Housekeeping markup the backend leaks into token text.
const INTERNAL_TAG_PREFIXES: [&str; 5] = [
    "<xai:tool_usage_card",
    "</xai:tool_usage_card",
    "<rolloutId",
    "<responseId",
    "<isThinking",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebchatEvent {
    pub token: Option<String>,
    pub is_thinking: Option<bool>,
    pub is_done: Option<bool>,
    pub response_id: Option<String>,
    pub streaming_image_generation: Option<MediaProgress>,
    pub streaming_video_generation: Option<MediaProgress>,
    pub model_response: Option<ModelResponse>,
    pub card_attachment: Option<CardAttachment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaProgress {
    pub progress: Option<u32>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub is_complete: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResponse {
    pub message: Option<String>,
    #[serde(default)]
    pub generated_image_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardAttachment {
    pub markdown: Option<String>,
    pub title: Option<String>,
}

/// Wire frame: the interesting payload nests under `result.response`.
#[derive(Debug, Deserialize)]
struct Frame {
    result: Option<FrameResult>,
}

#[derive(Debug, Deserialize)]
struct FrameResult {
    response: Option<WebchatEvent>,
}

pub fn parse_frame(payload: &str) -> Option<WebchatEvent> {
    if let Ok(frame) = serde_json::from_str::<Frame>(payload) {
        if let Some(event) = frame.result.and_then(|result| result.response) {
            return Some(event);
        }
    }
    serde_json::from_str::<WebchatEvent>(payload).ok()
}

/// Streaming `<tool_call>` scanner. Visible text flows through; anything
/// between the markers is captured. A partial marker at a fragment boundary
/// is held back until the next fragment decides it.
#[derive(Debug, Default)]
pub struct ToolCallScanner {
    pending: String,
    capturing: bool,
    captured: String,
    completed: Vec<String>,
}

impl ToolCallScanner {
    pub fn push(&mut self, fragment: &str) -> String {
        self.pending.push_str(fragment);
        let mut visible = String::new();

        loop {
            if self.capturing {
                if let Some(position) = self.pending.find(TOOL_CLOSE) {
                    self.captured.push_str(&self.pending[..position]);
                    self.pending.drain(..position + TOOL_CLOSE.len());
                    self.completed.push(std::mem::take(&mut self.captured));
                    self.capturing = false;
                    continue;
                }
                let hold = held_suffix_len(&self.pending, TOOL_CLOSE);
                let take = self.pending.len() - hold;
                self.captured.push_str(&self.pending[..take]);
                self.pending.drain(..take);
                break;
            }

            if let Some(position) = self.pending.find(TOOL_OPEN) {
                visible.push_str(&self.pending[..position]);
                self.pending.drain(..position + TOOL_OPEN.len());
                self.capturing = true;
                continue;
            }
            let hold = held_suffix_len(&self.pending, TOOL_OPEN);
            let take = self.pending.len() - hold;
            visible.push_str(&self.pending[..take]);
            self.pending.drain(..take);
            break;
        }

        visible
    }

    /// End of stream: whatever is held back was not a marker after all.
    pub fn finish(&mut self) -> String {
        if self.capturing {
            // Unterminated capture; nothing visible to salvage.
            self.pending.clear();
            return String::new();
        }
        std::mem::take(&mut self.pending)
    }

    pub fn take_completed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.completed)
    }
}

/// Longest proper prefix of `tag` that the buffer ends with.
fn held_suffix_len(buffer: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(buffer.len());
    for len in (1..=max).rev() {
        if buffer.ends_with(&tag[..len]) {
            return len;
        }
    }
    0
}

pub fn strip_internal_tags(text: &str) -> String {
    let mut out = text.to_string();
    for prefix in INTERNAL_TAG_PREFIXES {
        while let Some(start) = out.find(prefix) {
            match out[start..].find('>') {
                Some(end) => out.replace_range(start..start + end + 1, ""),
                None => {
                    out.truncate(start);
                    break;
                }
            }
        }
    }
    out
}

/// URLs the backend emits without a scheme point into its asset store.
pub fn absolute_asset_url(url: &str, asset_base: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    format!(
        "{}/{}",
        asset_base.trim_end_matches('/'),
        url.trim_start_matches('/')
    )
}

/// Per-response reconstruction state, owned by the stream task and dropped
/// with it.
#[derive(Debug)]
pub struct ResponseReconstructor {
    asset_base: String,
    scanner: ToolCallScanner,
    role_sent: bool,
    image_active: bool,
    video_active: bool,
    finished: bool,
}

impl ResponseReconstructor {
    pub fn new(asset_base: impl Into<String>) -> Self {
        Self {
            asset_base: asset_base.into(),
            scanner: ToolCallScanner::default(),
            role_sent: false,
            image_active: false,
            video_active: false,
            finished: false,
        }
    }

    pub fn push_event(&mut self, event: WebchatEvent) -> Vec<UnifiedDelta> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();
        if !self.role_sent {
            self.role_sent = true;
            out.push(UnifiedDelta::role(Role::Assistant));
        }

        // Image progress only steers the reasoning channel; the finished
        // image reaches the client through model_response's generated urls.
        if let Some(progress) = event.streaming_image_generation {
            self.image_active = progress.is_complete != Some(true);
            let note = match progress.progress {
                Some(percent) => format!("generating image ({percent}%)\n"),
                None => "generating image\n".to_string(),
            };
            out.push(UnifiedDelta::reasoning(note));
        }

        if let Some(progress) = event.streaming_video_generation {
            if progress.is_complete == Some(true) {
                self.video_active = false;
                if let Some(url) = progress.video_url {
                    let url = absolute_asset_url(&url, &self.asset_base);
                    out.push(UnifiedDelta::content(format!("[video]({url})\n")));
                }
            } else {
                self.video_active = true;
                let note = match progress.progress {
                    Some(percent) => format!("generating video ({percent}%)\n"),
                    None => "generating video\n".to_string(),
                };
                out.push(UnifiedDelta::reasoning(note));
            }
        }

        if let Some(token) = event.token {
            let media_in_progress = self.image_active || self.video_active;
            if event.is_thinking == Some(true) || media_in_progress {
                let text = strip_internal_tags(&token);
                if !text.is_empty() {
                    out.push(UnifiedDelta::reasoning(text));
                }
            } else {
                let visible = self.scanner.push(&token);
                let text = strip_internal_tags(&visible);
                if !text.is_empty() {
                    out.push(UnifiedDelta::content(text));
                }
            }
        }

        if let Some(model_response) = event.model_response {
            if !model_response.generated_image_urls.is_empty() {
                let mut links = String::new();
                for url in &model_response.generated_image_urls {
                    let url = absolute_asset_url(url, &self.asset_base);
                    links.push_str(&format!("![image]({url})\n"));
                }
                out.push(UnifiedDelta::content(links));
            }
        }

        if let Some(card) = event.card_attachment {
            let text = card.markdown.or(card.title).unwrap_or_default();
            let text = strip_internal_tags(&text);
            if !text.is_empty() {
                out.push(UnifiedDelta::content(text));
            }
        }

        if event.is_done == Some(true) {
            out.push(self.terminal_delta());
        }
        out
    }

    /// Terminal delta: parsed tool calls if any `<tool_call>` blocks were
    /// captured, plain stop otherwise.
    pub fn terminal_delta(&mut self) -> UnifiedDelta {
        self.finished = true;
        let tail = self.scanner.finish();
        let mut delta = UnifiedDelta::default();
        let tail = strip_internal_tags(&tail);
        if !tail.is_empty() {
            delta.content = Some(tail);
        }

        let mut calls = Vec::new();
        for (position, raw) in self.scanner.take_completed().into_iter().enumerate() {
            let Some((name, arguments)) = parse_tool_call(&raw) else {
                continue;
            };
            calls.push(ToolCallDelta {
                index: position as u32,
                id: Some(format!("call_{}", uuid::Uuid::new_v4().simple())),
                name: Some(name),
                arguments,
            });
        }

        if calls.is_empty() {
            delta.finish_reason = Some(FinishReason::Stop);
        } else {
            delta.tool_calls = calls;
            delta.finish_reason = Some(FinishReason::ToolCalls);
        }
        delta
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

fn parse_tool_call(raw: &str) -> Option<(String, String)> {
    let value: Value = serde_json::from_str(raw.trim()).ok()?;
    let name = value.get("name")?.as_str()?.to_string();
    let arguments = match value.get("arguments") {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => "{}".to_string(),
    };
    Some((name, arguments))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(text: &str) -> WebchatEvent {
        WebchatEvent {
            token: Some(text.to_string()),
            ..WebchatEvent::default()
        }
    }

    #[test]
    fn tool_call_reconstruction_matches_event_sequence() {
        let mut state = ResponseReconstructor::new("https://assets.example.com");
        let mut deltas = Vec::new();
        deltas.extend(state.push_event(token("Hello ")));
        deltas.extend(state.push_event(token("<tool_call>")));
        deltas.extend(state.push_event(token(
            r#"{"name":"search","arguments":{"q":"x"}}"#,
        )));
        deltas.extend(state.push_event(token("</tool_call>")));
        deltas.extend(state.push_event(token(" done")));
        deltas.extend(state.push_event(WebchatEvent {
            is_done: Some(true),
            ..WebchatEvent::default()
        }));

        assert_eq!(deltas.len(), 4);
        assert_eq!(deltas[0].role, Some(Role::Assistant));
        assert_eq!(deltas[1].content.as_deref(), Some("Hello "));
        assert_eq!(deltas[2].content.as_deref(), Some(" done"));
        let terminal = &deltas[3];
        assert_eq!(terminal.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(terminal.tool_calls.len(), 1);
        assert_eq!(terminal.tool_calls[0].name.as_deref(), Some("search"));
        assert_eq!(terminal.tool_calls[0].arguments, r#"{"q":"x"}"#);
        assert!(terminal.tool_calls[0]
            .id
            .as_deref()
            .unwrap()
            .starts_with("call_"));
    }

    #[test]
    fn marker_split_across_fragments_is_still_captured() {
        let mut scanner = ToolCallScanner::default();
        let mut visible = String::new();
        visible.push_str(&scanner.push("before <tool"));
        visible.push_str(&scanner.push("_call>{\"name\":\"f\"}</tool_"));
        visible.push_str(&scanner.push("call> after"));
        assert_eq!(visible, "before  after");
        assert_eq!(scanner.take_completed(), vec!["{\"name\":\"f\"}"]);
    }

    #[test]
    fn lone_angle_bracket_is_not_swallowed() {
        let mut scanner = ToolCallScanner::default();
        let mut visible = String::new();
        visible.push_str(&scanner.push("a < b"));
        visible.push_str(&scanner.push(" and a <t"));
        visible.push_str(&scanner.push("ag>"));
        visible.push_str(&scanner.finish());
        assert_eq!(visible, "a < b and a <tag>");
        assert!(scanner.take_completed().is_empty());
    }

    #[test]
    fn thinking_tokens_go_to_reasoning() {
        let mut state = ResponseReconstructor::new("https://assets.example.com");
        let deltas = state.push_event(WebchatEvent {
            token: Some("pondering".to_string()),
            is_thinking: Some(true),
            ..WebchatEvent::default()
        });
        assert_eq!(deltas[1].reasoning.as_deref(), Some("pondering"));
        assert!(deltas[1].content.is_none());
    }

    #[test]
    fn internal_tags_are_stripped() {
        assert_eq!(
            strip_internal_tags("a<rolloutId value=\"r1\">b<responseId x>c"),
            "abc"
        );
        assert_eq!(
            strip_internal_tags("keep <xai:tool_usage_card id=\"1\">inner</xai:tool_usage_card> this"),
            "keep inner this"
        );
    }

    #[test]
    fn relative_media_urls_are_rewritten() {
        let mut state = ResponseReconstructor::new("https://assets.example.com");
        state.push_event(WebchatEvent::default());
        let deltas = state.push_event(WebchatEvent {
            model_response: Some(ModelResponse {
                message: None,
                generated_image_urls: vec!["users/u/gen.png".to_string()],
            }),
            ..WebchatEvent::default()
        });
        assert_eq!(
            deltas[0].content.as_deref(),
            Some("![image](https://assets.example.com/users/u/gen.png)\n")
        );
    }

    #[test]
    fn image_progress_routes_tokens_to_reasoning() {
        let mut state = ResponseReconstructor::new("https://assets.example.com");
        state.push_event(WebchatEvent {
            streaming_image_generation: Some(MediaProgress {
                progress: Some(40),
                ..MediaProgress::default()
            }),
            ..WebchatEvent::default()
        });
        // While the image is in flight, plain tokens count as progress chatter.
        let deltas = state.push_event(token("rendering..."));
        assert_eq!(deltas[0].reasoning.as_deref(), Some("rendering..."));
    }

    #[test]
    fn image_completion_emits_no_content_chunk() {
        let mut state = ResponseReconstructor::new("https://assets.example.com");
        state.push_event(WebchatEvent::default());
        let deltas = state.push_event(WebchatEvent {
            streaming_image_generation: Some(MediaProgress {
                progress: Some(100),
                is_complete: Some(true),
                image_url: Some("users/u/gen.png".to_string()),
                ..MediaProgress::default()
            }),
            ..WebchatEvent::default()
        });
        // Progress rows only ever speak on the reasoning channel; the image
        // itself arrives via model_response.
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].reasoning.as_deref(), Some("generating image (100%)\n"));
        assert!(deltas[0].content.is_none());

        // Completion also ends the media-in-progress window.
        let tokens = state.push_event(token("answer"));
        assert_eq!(tokens[0].content.as_deref(), Some("answer"));
    }

    #[test]
    fn video_completion_emits_markdown_link() {
        let mut state = ResponseReconstructor::new("https://assets.example.com");
        state.push_event(WebchatEvent::default());
        let deltas = state.push_event(WebchatEvent {
            streaming_video_generation: Some(MediaProgress {
                is_complete: Some(true),
                video_url: Some("videos/v.mp4".to_string()),
                ..MediaProgress::default()
            }),
            ..WebchatEvent::default()
        });
        assert_eq!(
            deltas[0].content.as_deref(),
            Some("[video](https://assets.example.com/videos/v.mp4)\n")
        );
    }

    #[test]
    fn frames_parse_from_nested_and_flat_shapes() {
        let nested = parse_frame(r#"{"result":{"response":{"token":"hi"}}}"#).unwrap();
        assert_eq!(nested.token.as_deref(), Some("hi"));
        let flat = parse_frame(r#"{"token":"yo","isThinking":true}"#).unwrap();
        assert_eq!(flat.is_thinking, Some(true));
    }
}
