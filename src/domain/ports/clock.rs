//! Clock Port
//!
//! Source of wall-clock time in Unix epoch milliseconds.

/// Wall clock used for write stamps and TTL checks.
///
/// Injected so tests can drive expiry deterministically.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}
