use std::sync::Arc;
use std::time::Duration;

use bqproxy_quota::{
    CounterMode, KeyTtl, KvStore, QuotaLedger, QuotaPolicy, RecordOutcome, RedisKv,
};

const GB: u64 = 1_073_741_824;

/// Connects to `BQPROXY_TEST_REDIS_URL`, or returns `None` so the caller can
/// skip when no Redis is available.
async fn redis_or_skip(test: &str) -> Option<RedisKv> {
    let Ok(url) = std::env::var("BQPROXY_TEST_REDIS_URL") else {
        eprintln!("skipping {test}: BQPROXY_TEST_REDIS_URL not set");
        return None;
    };
    let kv = match RedisKv::new(&url, Duration::from_secs(2)) {
        Ok(kv) => kv,
        Err(err) => {
            eprintln!("skipping {test}: invalid redis url: {err}");
            return None;
        }
    };
    if let Err(err) = kv.ping().await {
        eprintln!("skipping {test}: redis not reachable: {err}");
        return None;
    }
    Some(kv)
}

fn unique_key(name: &str) -> String {
    format!("bqproxy-test-{}:{}", std::process::id(), name)
}

#[tokio::test]
async fn incr_with_ttl_sets_expiry_only_once() {
    let Some(kv) = redis_or_skip("incr_with_ttl_sets_expiry_only_once").await else {
        return;
    };
    let key = unique_key("usage");
    kv.del(&key).await.expect("cleanup");

    let first = kv
        .incr_by_float_with_ttl(&key, 1.5, Duration::from_secs(60))
        .await
        .expect("incr");
    let second = kv
        .incr_by_float_with_ttl(&key, 2.0, Duration::from_secs(3600))
        .await
        .expect("incr");
    assert_eq!(first, 1.5);
    assert_eq!(second, 3.5);

    match kv.ttl(&key).await.expect("ttl") {
        KeyTtl::Expires(remaining) => assert!(
            remaining <= Duration::from_secs(60) && remaining > Duration::ZERO,
            "later increments must not extend the window: {remaining:?}"
        ),
        other => panic!("expected an expiring counter, got {other:?}"),
    }
    assert_eq!(kv.get_f64(&key).await.expect("get"), Some(3.5));

    kv.del(&key).await.expect("cleanup");
}

#[tokio::test]
async fn set_nx_px_creates_only_missing_keys() {
    let Some(kv) = redis_or_skip("set_nx_px_creates_only_missing_keys").await else {
        return;
    };
    let key = unique_key("marker");
    kv.del(&key).await.expect("cleanup");

    assert!(kv.set_nx_px(&key, "1", Duration::from_secs(30)).await.expect("set"));
    assert!(!kv.set_nx_px(&key, "2", Duration::from_secs(30)).await.expect("set"));
    assert!(matches!(
        kv.ttl(&key).await.expect("ttl"),
        KeyTtl::Expires(_)
    ));

    kv.del(&key).await.expect("del");
    assert!(kv.set_nx_px(&key, "3", Duration::from_secs(30)).await.expect("set"));

    kv.del(&key).await.expect("cleanup");
}

#[tokio::test]
async fn pttl_replies_map_to_key_ttl() {
    let Some(kv) = redis_or_skip("pttl_replies_map_to_key_ttl").await else {
        return;
    };
    let key = unique_key("ttl");
    kv.del(&key).await.expect("cleanup");

    assert_eq!(kv.ttl(&key).await.expect("ttl"), KeyTtl::Missing);

    kv.incr_by_float(&key, 1.0).await.expect("incr");
    assert_eq!(kv.ttl(&key).await.expect("ttl"), KeyTtl::Persistent);

    kv.set_f64_px(&key, 2.0, Duration::from_secs(30))
        .await
        .expect("set");
    assert!(matches!(
        kv.ttl(&key).await.expect("ttl"),
        KeyTtl::Expires(remaining) if remaining <= Duration::from_secs(30)
    ));
    assert_eq!(kv.get_f64(&key).await.expect("get"), Some(2.0));

    kv.del(&key).await.expect("cleanup");
}

#[tokio::test]
async fn ledger_counts_a_completion_once_against_redis() {
    let Some(kv) = redis_or_skip("ledger_counts_a_completion_once_against_redis").await else {
        return;
    };
    let prefix = unique_key("ledger");
    let client = "203.0.113.50";
    let ledger = QuotaLedger::new(
        Arc::new(kv.clone()),
        QuotaPolicy {
            key_prefix: prefix.clone(),
            mode: CounterMode::Atomic,
            ..QuotaPolicy::default()
        },
    );

    let first = ledger
        .record_completion(client, "job-1", 2 * GB)
        .await
        .expect("record");
    let again = ledger
        .record_completion(client, "job-1", 2 * GB)
        .await
        .expect("record");
    assert_eq!(first, RecordOutcome::Recorded { total_gb: 2.0 });
    assert_eq!(again, RecordOutcome::Duplicate);

    let usage = ledger.usage(client).await.expect("usage");
    assert_eq!(usage.used_gb, 2.0);
    assert!(usage.resets_in.is_some());

    kv.del(&format!("{prefix}:usage:{client}"))
        .await
        .expect("cleanup");
    kv.del(&format!("{prefix}:job:{client}:job-1"))
        .await
        .expect("cleanup");
}
