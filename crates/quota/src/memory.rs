use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{KeyTtl, KvStore, QuotaError};

/// In-process store for single-instance deployments and tests. Expiry follows
/// the tokio clock so paused-time tests can fast-forward windows.
#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryEntry>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn live_entry<'a>(
        entries: &'a mut HashMap<String, MemoryEntry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut MemoryEntry> {
        if entries.get(key).is_some_and(|entry| !entry.live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn add<'a>(
        entries: &'a mut HashMap<String, MemoryEntry>,
        key: &str,
        delta: f64,
        now: Instant,
    ) -> Result<&'a mut MemoryEntry, QuotaError> {
        let current = match Self::live_entry(entries, key, now) {
            Some(entry) => entry
                .value
                .parse::<f64>()
                .map_err(|_| QuotaError::InvalidValue {
                    key: key.to_string(),
                })?,
            None => 0.0,
        };

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: String::new(),
                expires_at: None,
            });
        entry.value = (current + delta).to_string();
        Ok(entry)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get_f64(&self, key: &str) -> Result<Option<f64>, QuotaError> {
        let now = Instant::now();
        let mut entries = self.lock();
        match Self::live_entry(&mut entries, key, now) {
            None => Ok(None),
            Some(entry) => entry
                .value
                .parse::<f64>()
                .map(Some)
                .map_err(|_| QuotaError::InvalidValue {
                    key: key.to_string(),
                }),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, QuotaError> {
        let now = Instant::now();
        let mut entries = self.lock();
        Ok(match Self::live_entry(&mut entries, key, now) {
            None => KeyTtl::Missing,
            Some(MemoryEntry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(MemoryEntry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, QuotaError> {
        let now = Instant::now();
        let mut entries = self.lock();
        if Self::live_entry(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn set_f64_px(&self, key: &str, value: f64, ttl: Duration) -> Result<(), QuotaError> {
        let now = Instant::now();
        self.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(())
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, QuotaError> {
        let now = Instant::now();
        let mut entries = self.lock();
        let entry = Self::add(&mut entries, key, delta, now)?;
        entry.value.parse::<f64>().map_err(|_| QuotaError::InvalidValue {
            key: key.to_string(),
        })
    }

    async fn incr_by_float_with_ttl(
        &self,
        key: &str,
        delta: f64,
        ttl: Duration,
    ) -> Result<f64, QuotaError> {
        let now = Instant::now();
        let mut entries = self.lock();
        let entry = Self::add(&mut entries, key, delta, now)?;
        if entry.expires_at.is_none() {
            entry.expires_at = Some(now + ttl);
        }
        entry.value.parse::<f64>().map_err(|_| QuotaError::InvalidValue {
            key: key.to_string(),
        })
    }

    async fn del(&self, key: &str) -> Result<(), QuotaError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), QuotaError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_nx_px_respects_existing_live_keys() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx_px("k", "1", Duration::from_secs(5)).await.expect("set"));
        assert!(!kv.set_nx_px("k", "2", Duration::from_secs(5)).await.expect("set"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(kv.set_nx_px("k", "3", Duration::from_secs(5)).await.expect("set"));
    }

    #[tokio::test(start_paused = true)]
    async fn incr_by_float_on_missing_key_has_no_expiry() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr_by_float("c", 1.5).await.expect("incr"), 1.5);
        assert_eq!(kv.ttl("c").await.expect("ttl"), KeyTtl::Persistent);
    }

    #[tokio::test(start_paused = true)]
    async fn incr_with_ttl_only_sets_expiry_once() {
        let kv = MemoryKv::new();
        kv.incr_by_float_with_ttl("c", 1.0, Duration::from_secs(100))
            .await
            .expect("incr");
        tokio::time::advance(Duration::from_secs(40)).await;
        let total = kv
            .incr_by_float_with_ttl("c", 2.0, Duration::from_secs(100))
            .await
            .expect("incr");

        assert_eq!(total, 3.0);
        assert_eq!(
            kv.ttl("c").await.expect("ttl"),
            KeyTtl::Expires(Duration::from_secs(60))
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(kv.get_f64("c").await.expect("get"), None);
        assert_eq!(kv.ttl("c").await.expect("ttl"), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn non_numeric_values_are_rejected() {
        let kv = MemoryKv::new();
        kv.set_nx_px("c", "lock-token", Duration::from_secs(5))
            .await
            .expect("set");
        assert!(matches!(
            kv.incr_by_float("c", 1.0).await,
            Err(QuotaError::InvalidValue { .. })
        ));
    }
}
