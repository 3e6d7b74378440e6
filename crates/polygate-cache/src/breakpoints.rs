use polygate_translate::unified::{Block, BlockPart, ImageSource, UnifiedRequest};
use serde_json::{json, Value};

use crate::counter::{count_or_fallback, TokenCounter};
use crate::hasher::{canonical_json, CumulativeHasher};

/// System entries carrying this sentinel are billing plumbing, not prompt
/// content; hashing them would fracture the cache across billing header
/// rotations.
pub const BILLING_SENTINEL: &str = "x-polygate-billing";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub hash: String,
    pub cumulative_tokens: u64,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PrefixAnalysis {
    pub breakpoints: Vec<Breakpoint>,
    /// Token count of the entire request, cached suffix included.
    pub total_tokens: u64,
}

/// Walks the prompt in fixed order (tools, system, message blocks), feeding
/// the cumulative hasher and emitting a breakpoint at every cache-controlled
/// block. Blocks after the last marker are token-counted but never hashed,
/// which is what makes the cached prefix identity independent of the suffix.
pub fn analyse_prefix(request: &UnifiedRequest, counter: &dyn TokenCounter) -> PrefixAnalysis {
    let mut hasher = CumulativeHasher::new();
    let mut breakpoints = Vec::new();
    let mut hashed_tokens = 0u64;
    let mut total_tokens = 0u64;

    let mut tools: Vec<_> = request.tools.iter().collect();
    tools.sort_by(|a, b| a.name.cmp(&b.name));
    for tool in tools {
        let normalised = format!(
            "name:{}|desc:{}|schema:{}",
            tool.name,
            tool.description.as_deref().unwrap_or_default(),
            canonical_json(&tool.input_schema)
        );
        let tokens = count_or_fallback(counter, &normalised);
        hasher.update(&normalised);
        hashed_tokens += tokens;
        total_tokens += tokens;
    }

    // Hashing stops after the last marker; later blocks only contribute to
    // the total.
    let marked = last_marker_position(request);
    let mut position = 0usize;

    for block in &request.system {
        let BlockPart::Text { text } = &block.part else {
            position += 1;
            continue;
        };
        if text.contains(BILLING_SENTINEL) {
            position += 1;
            continue;
        }
        let tokens = count_or_fallback(counter, text);
        total_tokens += tokens;
        if marked.is_some_and(|last| position <= last) {
            hasher.update(text);
            hashed_tokens += tokens;
            if block.cache_control.is_some() {
                breakpoints.push(breakpoint(&hasher, hashed_tokens, block));
            }
        }
        position += 1;
    }

    for message in &request.messages {
        for block in &message.blocks {
            let serialised = canonical_json(&block_value(&block.part));
            let tokens = count_or_fallback(counter, &serialised);
            total_tokens += tokens;
            if marked.is_some_and(|last| position <= last) {
                hasher.update(&serialised);
                hashed_tokens += tokens;
                if block.cache_control.is_some() {
                    breakpoints.push(breakpoint(&hasher, hashed_tokens, block));
                }
            }
            position += 1;
        }
    }

    PrefixAnalysis {
        breakpoints,
        total_tokens,
    }
}

/// Token count of the full request, without any breakpoint bookkeeping.
pub fn count_request_tokens(request: &UnifiedRequest, counter: &dyn TokenCounter) -> u64 {
    analyse_prefix(request, counter).total_tokens
}

fn breakpoint(hasher: &CumulativeHasher, cumulative_tokens: u64, block: &Block) -> Breakpoint {
    let ttl_secs = block
        .cache_control
        .map(|ttl| ttl.seconds())
        .unwrap_or(300);
    Breakpoint {
        hash: hasher.snapshot_hex(),
        cumulative_tokens,
        ttl_secs,
    }
}

/// Flat position (system blocks, then message blocks) of the last
/// cache-controlled block, if any.
fn last_marker_position(request: &UnifiedRequest) -> Option<usize> {
    let mut position = 0usize;
    let mut last = None;
    for block in &request.system {
        if block.cache_control.is_some() {
            last = Some(position);
        }
        position += 1;
    }
    for message in &request.messages {
        for block in &message.blocks {
            if block.cache_control.is_some() {
                last = Some(position);
            }
            position += 1;
        }
    }
    last
}

/// Serialised block shape fed to the hasher. The cache_control marker itself
/// is left out so that adding or moving a marker does not change the hash of
/// the content before it.
fn block_value(part: &BlockPart) -> Value {
    match part {
        BlockPart::Text { text } => json!({"type": "text", "text": text}),
        BlockPart::Image { source } => match source {
            ImageSource::Url(url) => json!({"type": "image", "url": url}),
            ImageSource::Base64 { mime, data } => {
                json!({"type": "image", "mime": mime, "data": data})
            }
        },
        BlockPart::InputAudio { data } => json!({"type": "input_audio", "data": data}),
        BlockPart::File { data, name } => json!({"type": "file", "data": data, "name": name}),
        BlockPart::Thinking { text, signature } => {
            json!({"type": "thinking", "text": text, "signature": signature})
        }
        BlockPart::ToolUse {
            id,
            name,
            arguments,
        } => json!({"type": "tool_use", "id": id, "name": name, "arguments": arguments}),
        BlockPart::ToolResult {
            call_id,
            content,
            is_error,
        } => json!({
            "type": "tool_result",
            "call_id": call_id,
            "content": content,
            "is_error": is_error
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::HeuristicCounter;
    use polygate_translate::unified::{CacheTtl, Role, UnifiedMessage};

    fn request_with_tail(tail: &str) -> UnifiedRequest {
        let mut request = UnifiedRequest::new("m");
        request.messages.push(UnifiedMessage::new(
            Role::User,
            vec![
                Block::text("prefix").cached(CacheTtl::FiveMinutes),
                Block::text(tail),
            ],
        ));
        request
    }

    #[test]
    fn prefix_hash_is_independent_of_suffix() {
        let a = analyse_prefix(&request_with_tail("tail-A"), &HeuristicCounter);
        let b = analyse_prefix(&request_with_tail("tail-B-different"), &HeuristicCounter);

        assert_eq!(a.breakpoints.len(), 1);
        assert_eq!(b.breakpoints.len(), 1);
        assert_eq!(a.breakpoints[0].hash, b.breakpoints[0].hash);
        assert_eq!(
            a.breakpoints[0].cumulative_tokens,
            b.breakpoints[0].cumulative_tokens
        );
        // Totals differ because the suffixes do.
        assert_ne!(a.total_tokens, b.total_tokens);
    }

    #[test]
    fn marker_itself_does_not_alter_the_hash() {
        // Same content, marker on the second block instead of the first:
        // the first breakpoint hash of a two-marker prompt must equal the
        // single-marker hash over the same first block.
        let mut one = UnifiedRequest::new("m");
        one.messages.push(UnifiedMessage::new(
            Role::User,
            vec![Block::text("alpha").cached(CacheTtl::FiveMinutes)],
        ));
        let mut two = UnifiedRequest::new("m");
        two.messages.push(UnifiedMessage::new(
            Role::User,
            vec![
                Block::text("alpha").cached(CacheTtl::FiveMinutes),
                Block::text("beta").cached(CacheTtl::FiveMinutes),
            ],
        ));

        let first = analyse_prefix(&one, &HeuristicCounter);
        let second = analyse_prefix(&two, &HeuristicCounter);
        assert_eq!(first.breakpoints[0].hash, second.breakpoints[0].hash);
        assert_eq!(second.breakpoints.len(), 2);
        assert_ne!(second.breakpoints[0].hash, second.breakpoints[1].hash);
    }

    #[test]
    fn one_hour_marker_sets_long_ttl() {
        let mut request = UnifiedRequest::new("m");
        request.messages.push(UnifiedMessage::new(
            Role::User,
            vec![Block::text("prefix").cached(CacheTtl::OneHour)],
        ));
        let analysis = analyse_prefix(&request, &HeuristicCounter);
        assert_eq!(analysis.breakpoints[0].ttl_secs, 3600);
    }

    #[test]
    fn billing_sentinel_system_entry_is_skipped() {
        let mut with_sentinel = UnifiedRequest::new("m");
        with_sentinel
            .system
            .push(Block::text(format!("{BILLING_SENTINEL}: abc")));
        with_sentinel.messages.push(UnifiedMessage::new(
            Role::User,
            vec![Block::text("prompt").cached(CacheTtl::FiveMinutes)],
        ));

        let mut without = UnifiedRequest::new("m");
        without.messages.push(UnifiedMessage::new(
            Role::User,
            vec![Block::text("prompt").cached(CacheTtl::FiveMinutes)],
        ));

        assert_eq!(
            analyse_prefix(&with_sentinel, &HeuristicCounter).breakpoints[0].hash,
            analyse_prefix(&without, &HeuristicCounter).breakpoints[0].hash
        );
    }

    #[test]
    fn unmarked_request_has_no_breakpoints() {
        let mut request = UnifiedRequest::new("m");
        request
            .messages
            .push(UnifiedMessage::text(Role::User, "plain"));
        let analysis = analyse_prefix(&request, &HeuristicCounter);
        assert!(analysis.breakpoints.is_empty());
        assert!(analysis.total_tokens > 0);
    }
}
