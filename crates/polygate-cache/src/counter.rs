use std::path::Path;
use std::sync::Arc;

use tokenizers::Tokenizer;
use tracing::warn;

/// Token counting used for breakpoint accounting. Returning `None` signals
/// tokenizer failure; callers fall back to `ceil(len / 4)`.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> Option<u64>;
}

/// Character-length approximation, also the failure fallback.
#[derive(Debug, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> Option<u64> {
        Some(heuristic_count(text))
    }
}

pub fn heuristic_count(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

pub fn count_or_fallback(counter: &dyn TokenCounter, text: &str) -> u64 {
    counter.count(text).unwrap_or_else(|| heuristic_count(text))
}

/// HuggingFace tokenizer loaded from an on-disk `tokenizer.json`.
pub struct HfTokenizerCounter {
    tokenizer: Arc<Tokenizer>,
}

impl HfTokenizerCounter {
    pub fn from_file(path: impl AsRef<Path>) -> Option<Self> {
        match Tokenizer::from_file(path.as_ref()) {
            Ok(tokenizer) => Some(Self {
                tokenizer: Arc::new(tokenizer),
            }),
            Err(err) => {
                warn!(event = "tokenizer_load_failed", path = %path.as_ref().display(), error = %err);
                None
            }
        }
    }
}

impl TokenCounter for HfTokenizerCounter {
    fn count(&self, text: &str) -> Option<u64> {
        self.tokenizer
            .encode(text, false)
            .ok()
            .map(|encoding| encoding.get_ids().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_rounds_up() {
        assert_eq!(heuristic_count(""), 0);
        assert_eq!(heuristic_count("abc"), 1);
        assert_eq!(heuristic_count("abcd"), 1);
        assert_eq!(heuristic_count("abcde"), 2);
    }

    struct BrokenCounter;

    impl TokenCounter for BrokenCounter {
        fn count(&self, _text: &str) -> Option<u64> {
            None
        }
    }

    #[test]
    fn failure_falls_back_to_heuristic() {
        assert_eq!(count_or_fallback(&BrokenCounter, "12345678"), 2);
    }
}
