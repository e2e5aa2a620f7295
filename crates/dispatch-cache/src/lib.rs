//! # Dispatch Cache
//!
//! Avoiding redundant backend work:
//! - Deterministic request fingerprints
//! - A bounded, TTL'd LRU response cache
//! - In-flight deduplication of identical concurrent requests

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dedup;
pub mod fingerprint;
pub mod response_cache;

pub use dedup::{Admission, DedupStats, Deduplicator, LeaderGuard, SharedOutcome};
pub use fingerprint::{fingerprint, FingerprintInput};
pub use response_cache::{CacheStats, ResponseCache, ResponseCacheConfig};
