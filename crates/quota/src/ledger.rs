use std::sync::Arc;
use std::time::Duration;

use bqproxy_contracts::bytes_to_gb;
use tokio::time::Instant;

use crate::{KeyTtl, KvStore, QuotaError};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MARKER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMode {
    /// Idempotency marker plus one atomic increment-with-expiry.
    Atomic,
    /// Spin-wait advisory lock around a check-then-increment sequence.
    LegacyLock,
}

#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    pub window: Duration,
    /// Must be at least `window`, or a finished job polled again inside the
    /// same window is charged twice.
    pub marker_ttl: Duration,
    pub lock_ttl: Duration,
    pub lock_retry_interval: Duration,
    pub key_prefix: String,
    pub mode: CounterMode,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            marker_ttl: DEFAULT_MARKER_TTL,
            lock_ttl: Duration::from_secs(3),
            lock_retry_interval: Duration::from_millis(50),
            key_prefix: "bqproxy".to_string(),
            mode: CounterMode::Atomic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyUsage {
    pub used_gb: f64,
    /// `None` when no window is open, or when the counter lost its expiry.
    pub resets_in: Option<Duration>,
}

impl DailyUsage {
    pub fn fresh() -> Self {
        Self {
            used_gb: 0.0,
            resets_in: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordOutcome {
    Recorded { total_gb: f64 },
    Duplicate,
    Empty,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Recorded { .. } => "recorded",
            RecordOutcome::Duplicate => "duplicate",
            RecordOutcome::Empty => "empty",
        }
    }
}

/// Per-client rolling usage counters kept in a shared [`KvStore`].
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn KvStore>,
    policy: QuotaPolicy,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn KvStore>, policy: QuotaPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn ping(&self) -> Result<(), QuotaError> {
        self.store.ping().await
    }

    fn usage_key(&self, client: &str) -> String {
        format!("{}:usage:{}", self.policy.key_prefix, client)
    }

    fn marker_key(&self, client: &str, job_id: &str) -> String {
        format!("{}:job:{}:{}", self.policy.key_prefix, client, job_id)
    }

    fn lock_key(&self, client: &str) -> String {
        format!("{}:lock:{}", self.policy.key_prefix, client)
    }

    pub async fn usage(&self, client: &str) -> Result<DailyUsage, QuotaError> {
        let key = self.usage_key(client);
        let Some(used_gb) = self.store.get_f64(&key).await? else {
            return Ok(DailyUsage::fresh());
        };

        let resets_in = match self.store.ttl(&key).await? {
            // expired between the two reads
            KeyTtl::Missing => return Ok(DailyUsage::fresh()),
            KeyTtl::Persistent => {
                tracing::warn!(client = %client, key = %key, "usage counter has no expiry");
                None
            }
            KeyTtl::Expires(remaining) => Some(remaining),
        };

        Ok(DailyUsage {
            used_gb: used_gb.max(0.0),
            resets_in,
        })
    }

    /// Adds a finished job's bytes to the client's counter. The same
    /// `(client, job_id)` pair is counted at most once while its marker lives,
    /// which by default spans several usage windows.
    pub async fn record_completion(
        &self,
        client: &str,
        job_id: &str,
        bytes_processed: u64,
    ) -> Result<RecordOutcome, QuotaError> {
        if bytes_processed == 0 {
            return Ok(RecordOutcome::Empty);
        }

        let marker = self.marker_key(client, job_id);
        if !self
            .store
            .set_nx_px(&marker, "1", self.policy.marker_ttl)
            .await?
        {
            return Ok(RecordOutcome::Duplicate);
        }

        let gb = bytes_to_gb(bytes_processed);
        let added = match self.policy.mode {
            CounterMode::Atomic => {
                self.store
                    .incr_by_float_with_ttl(&self.usage_key(client), gb, self.policy.window)
                    .await
            }
            CounterMode::LegacyLock => self.legacy_add(client, gb).await,
        };

        match added {
            Ok(total_gb) => Ok(RecordOutcome::Recorded { total_gb }),
            Err(err) => {
                // let a later completion report retry
                if let Err(del_err) = self.store.del(&marker).await {
                    tracing::warn!(
                        client = %client,
                        job_id = %job_id,
                        error = %del_err,
                        "failed to clear completion marker after failed update"
                    );
                }
                Err(err)
            }
        }
    }

    async fn legacy_add(&self, client: &str, gb: f64) -> Result<f64, QuotaError> {
        let lock = self.lock_key(client);
        let held = self.acquire_lock(&lock).await?;

        let result = self.legacy_increment(client, gb).await;

        // Our lock may already have expired and been taken by another writer;
        // this deletes theirs.
        if held && let Err(err) = self.store.del(&lock).await {
            tracing::warn!(client = %client, error = %err, "failed to release usage lock");
        }

        result
    }

    async fn legacy_increment(&self, client: &str, gb: f64) -> Result<f64, QuotaError> {
        let key = self.usage_key(client);
        match self.store.ttl(&key).await? {
            KeyTtl::Missing => {
                self.store.set_f64_px(&key, gb, self.policy.window).await?;
                Ok(gb)
            }
            KeyTtl::Persistent | KeyTtl::Expires(_) => {
                // If the counter expires after the check above, INCRBYFLOAT
                // recreates it without an expiry.
                let total = self.store.incr_by_float(&key, gb).await?;
                if self.store.ttl(&key).await? == KeyTtl::Persistent {
                    tracing::warn!(
                        client = %client,
                        key = %key,
                        total_gb = total,
                        "usage counter was recreated without expiry; it will not reset"
                    );
                }
                Ok(total)
            }
        }
    }

    async fn acquire_lock(&self, lock: &str) -> Result<bool, QuotaError> {
        let deadline = Instant::now() + self.policy.lock_ttl;
        loop {
            if self
                .store
                .set_nx_px(lock, "1", self.policy.lock_ttl)
                .await?
            {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                tracing::warn!(lock = %lock, "usage lock wait exceeded its ttl; updating without it");
                return Ok(false);
            }
            tokio::time::sleep(self.policy.lock_retry_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;

    const GB: u64 = 1_073_741_824;

    fn ledger(mode: CounterMode) -> (QuotaLedger, MemoryKv) {
        let kv = MemoryKv::new();
        let ledger = QuotaLedger::new(
            Arc::new(kv.clone()),
            QuotaPolicy {
                mode,
                ..QuotaPolicy::default()
            },
        );
        (ledger, kv)
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_client_has_fresh_usage() {
        let (ledger, _) = ledger(CounterMode::Atomic);
        assert_eq!(
            ledger.usage("10.0.0.1").await.expect("usage"),
            DailyUsage::fresh()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_completion_is_counted_once() {
        for mode in [CounterMode::Atomic, CounterMode::LegacyLock] {
            let (ledger, _) = ledger(mode);

            let first = ledger
                .record_completion("10.0.0.1", "job-1", 2 * GB)
                .await
                .expect("record");
            let second = ledger
                .record_completion("10.0.0.1", "job-1", 2 * GB)
                .await
                .expect("record");

            assert_eq!(first, RecordOutcome::Recorded { total_gb: 2.0 });
            assert_eq!(second, RecordOutcome::Duplicate);
            assert_eq!(ledger.usage("10.0.0.1").await.expect("usage").used_gb, 2.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_jobs_and_clients_accumulate_separately() {
        for mode in [CounterMode::Atomic, CounterMode::LegacyLock] {
            let (ledger, _) = ledger(mode);
            ledger
                .record_completion("a", "job-1", GB)
                .await
                .expect("record");
            ledger
                .record_completion("a", "job-2", GB / 2)
                .await
                .expect("record");
            ledger
                .record_completion("b", "job-1", GB)
                .await
                .expect("record");

            assert_eq!(ledger.usage("a").await.expect("usage").used_gb, 1.5);
            assert_eq!(ledger.usage("b").await.expect("usage").used_gb, 1.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn counter_resets_after_window_elapses() {
        for mode in [CounterMode::Atomic, CounterMode::LegacyLock] {
            let (ledger, _) = ledger(mode);
            ledger
                .record_completion("a", "job-1", 9 * GB + GB / 2)
                .await
                .expect("record");

            let usage = ledger.usage("a").await.expect("usage");
            assert_eq!(usage.used_gb, 9.5);
            assert_eq!(usage.resets_in, Some(Duration::from_secs(24 * 60 * 60)));

            tokio::time::advance(Duration::from_secs(24 * 60 * 60 + 1)).await;
            assert_eq!(ledger.usage("a").await.expect("usage"), DailyUsage::fresh());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn later_completions_do_not_extend_the_window() {
        for mode in [CounterMode::Atomic, CounterMode::LegacyLock] {
            let (ledger, _) = ledger(mode);
            ledger
                .record_completion("a", "job-1", GB)
                .await
                .expect("record");
            tokio::time::advance(Duration::from_secs(60 * 60)).await;
            ledger
                .record_completion("a", "job-2", GB)
                .await
                .expect("record");

            let usage = ledger.usage("a").await.expect("usage");
            assert_eq!(usage.used_gb, 2.0);
            assert_eq!(usage.resets_in, Some(Duration::from_secs(23 * 60 * 60)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_byte_completions_open_no_window() {
        let (ledger, kv) = ledger(CounterMode::Atomic);
        assert_eq!(
            ledger
                .record_completion("a", "cached", 0)
                .await
                .expect("record"),
            RecordOutcome::Empty
        );
        assert_eq!(
            kv.ttl("bqproxy:usage:a").await.expect("ttl"),
            KeyTtl::Missing
        );
        assert_eq!(
            kv.ttl("bqproxy:job:a:cached").await.expect("ttl"),
            KeyTtl::Missing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_repoll_of_finished_job_is_not_recounted() {
        for mode in [CounterMode::Atomic, CounterMode::LegacyLock] {
            let (ledger, _) = ledger(mode);
            ledger
                .record_completion("a", "job-1", GB)
                .await
                .expect("record");

            tokio::time::advance(Duration::from_secs(2 * 60 * 60)).await;
            assert_eq!(
                ledger
                    .record_completion("a", "job-1", GB)
                    .await
                    .expect("record"),
                RecordOutcome::Duplicate
            );
            assert_eq!(ledger.usage("a").await.expect("usage").used_gb, 1.0);

            // the next window does not pick the job up again either
            tokio::time::advance(DEFAULT_WINDOW).await;
            assert_eq!(
                ledger
                    .record_completion("a", "job-1", GB)
                    .await
                    .expect("record"),
                RecordOutcome::Duplicate
            );
            assert_eq!(ledger.usage("a").await.expect("usage"), DailyUsage::fresh());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_mode_waits_for_a_held_lock_then_proceeds() {
        let (ledger, kv) = ledger(CounterMode::LegacyLock);
        kv.set_nx_px("bqproxy:lock:a", "other", Duration::from_secs(60))
            .await
            .expect("seed lock");

        let started = Instant::now();
        let outcome = ledger
            .record_completion("a", "job-1", GB)
            .await
            .expect("record");

        assert_eq!(outcome, RecordOutcome::Recorded { total_gb: 1.0 });
        assert!(started.elapsed() >= Duration::from_secs(3));
        // the stalled holder's lock is not ours to release
        assert_ne!(kv.ttl("bqproxy:lock:a").await.expect("ttl"), KeyTtl::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_mode_releases_its_lock() {
        let (ledger, kv) = ledger(CounterMode::LegacyLock);
        ledger
            .record_completion("a", "job-1", GB)
            .await
            .expect("record");
        assert_eq!(
            kv.ttl("bqproxy:lock:a").await.expect("ttl"),
            KeyTtl::Missing
        );
    }
}
