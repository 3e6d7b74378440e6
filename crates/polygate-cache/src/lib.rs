pub mod accountant;
pub mod breakpoints;
pub mod counter;
pub mod hasher;
pub mod session;

pub use accountant::{cache_key, CacheAccountant, CacheBreakdown, KvError, KvStore, RedisStore};
pub use breakpoints::{
    analyse_prefix, count_request_tokens, Breakpoint, PrefixAnalysis, BILLING_SENTINEL,
};
pub use counter::{HeuristicCounter, HfTokenizerCounter, TokenCounter};
pub use hasher::{canonical_json, sha256_hex, CumulativeHasher};
pub use session::derive_session_id;
