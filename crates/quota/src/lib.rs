use std::time::Duration;

use async_trait::async_trait;

mod ledger;
mod memory;
mod redis_store;

pub use ledger::{
    CounterMode, DEFAULT_MARKER_TTL, DEFAULT_WINDOW, DailyUsage, QuotaLedger, QuotaPolicy,
    RecordOutcome,
};
pub use memory::MemoryKv;
pub use redis_store::RedisKv;

#[derive(Debug)]
pub enum QuotaError {
    Timeout,
    Redis(redis::RedisError),
    InvalidValue { key: String },
}

impl std::fmt::Display for QuotaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaError::Timeout => write!(f, "quota store operation timed out"),
            QuotaError::Redis(err) => write!(f, "quota store redis error: {}", err),
            QuotaError::InvalidValue { key } => {
                write!(f, "quota store key {} does not hold a number", key)
            }
        }
    }
}

impl std::error::Error for QuotaError {}

impl From<redis::RedisError> for QuotaError {
    fn from(value: redis::RedisError) -> Self {
        QuotaError::Redis(value)
    }
}

/// Remaining lifetime of a key, mirroring `PTTL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

/// The handful of key/value primitives quota accounting needs. Values are
/// stored as strings, the way Redis stores them.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_f64(&self, key: &str) -> Result<Option<f64>, QuotaError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, QuotaError>;

    /// `SET key value NX PX ttl`; true when the key was created.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, QuotaError>;

    async fn set_f64_px(&self, key: &str, value: f64, ttl: Duration) -> Result<(), QuotaError>;

    /// `INCRBYFLOAT`; a missing key is created without an expiry.
    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, QuotaError>;

    /// `INCRBYFLOAT` plus `PEXPIRE NX` in one transaction: the expiry is only
    /// set when the key has none.
    async fn incr_by_float_with_ttl(
        &self,
        key: &str,
        delta: f64,
        ttl: Duration,
    ) -> Result<f64, QuotaError>;

    async fn del(&self, key: &str) -> Result<(), QuotaError>;

    async fn ping(&self) -> Result<(), QuotaError>;
}
