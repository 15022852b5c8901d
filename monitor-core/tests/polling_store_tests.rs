use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use monitor_core::{PollingStore, QueryKey, QueryOptions, RequestError};
use tokio::time::timeout;

fn options(stale_time: Duration) -> QueryOptions {
    QueryOptions {
        refresh_interval: None,
        stale_time,
        retry: 0,
        retry_delay: Duration::from_millis(10),
    }
}

fn http_error(status: u16) -> RequestError {
    RequestError::Http {
        status,
        message: format!("HTTP {status}"),
        body: None,
    }
}

#[test]
fn query_keys_ignore_parameter_order() {
    let a = QueryKey::new("/api/v1/articles/", [("limit", "10"), ("source", "vnexpress")]);
    let b = QueryKey::new("/api/v1/articles/", [("source", "vnexpress"), ("limit", "10")]);
    assert_eq!(a, b);
    assert_ne!(a, QueryKey::bare("/api/v1/articles/"));
}

#[tokio::test]
async fn concurrent_queries_coalesce_into_one_fetch() {
    let store: PollingStore<u64> = PollingStore::new();
    let key = QueryKey::new("/api/v1/articles/", [("source", "vnexpress")]);
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, RequestError>(7u64)
            }
        }
    };
    let opts = options(Duration::from_secs(30));

    let (a, b, c) = tokio::join!(
        store.query(&key, &fetcher, &opts),
        store.query(&key, &fetcher, &opts),
        store.query(&key, &fetcher, &opts),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*a.expect("first caller failed"), 7);
    assert_eq!(*b.expect("second caller failed"), 7);
    assert_eq!(*c.expect("third caller failed"), 7);
}

#[tokio::test]
async fn fresh_cache_is_served_without_a_request() {
    let store: PollingStore<u64> = PollingStore::new();
    let key = QueryKey::bare("/api/v1/dashboard/overview");
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RequestError>(1u64)
            }
        }
    };
    let opts = options(Duration::from_secs(30));

    store.query(&key, &fetcher, &opts).await.expect("seed failed");
    store.query(&key, &fetcher, &opts).await.expect("cached read failed");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_staleness_window_refetches() {
    let store: PollingStore<u64> = PollingStore::new();
    let key = QueryKey::bare("/api/v1/dashboard/overview");
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RequestError>(1u64)
            }
        }
    };
    let opts = options(Duration::ZERO);

    store.query(&key, &fetcher, &opts).await.expect("first failed");
    store.query(&key, &fetcher, &opts).await.expect("second failed");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failures_are_retried_up_to_the_bound() {
    let store: PollingStore<u64> = PollingStore::new();
    let key = QueryKey::bare("/api/v1/realtime/stats");
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(http_error(500))
                } else {
                    Ok(5u64)
                }
            }
        }
    };
    let opts = QueryOptions {
        retry: 3,
        retry_delay: Duration::from_millis(10),
        ..options(Duration::ZERO)
    };

    let value = store.query(&key, &fetcher, &opts).await.expect("retries exhausted");
    assert_eq!(*value, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_error_but_keep_cached_value() {
    let store: PollingStore<u64> = PollingStore::new();
    let key = QueryKey::bare("/api/v1/realtime/stats");
    let opts = QueryOptions {
        retry: 1,
        retry_delay: Duration::from_millis(10),
        ..options(Duration::ZERO)
    };

    store
        .refresh(&key, || async { Ok::<_, RequestError>(42u64) }, &opts)
        .await
        .expect("seed failed");

    let err = store
        .refresh(&key, || async { Err::<u64, _>(http_error(502)) }, &opts)
        .await
        .expect_err("failure expected");
    assert_eq!(err.status(), 502);

    // The last-known-good value is still there, with the error beside it.
    assert_eq!(store.latest(&key).await.map(|v| *v), Some(42));
    assert!(store.last_error(&key).await.is_some());
}

#[tokio::test]
async fn older_fetch_completing_later_is_discarded() {
    let store: PollingStore<u64> = PollingStore::new();
    let key = QueryKey::bare("/api/v1/articles/");
    let opts = options(Duration::ZERO);

    let slow = {
        let store = store.clone();
        let key = key.clone();
        let opts = opts.clone();
        tokio::spawn(async move {
            store
                .refresh(
                    &key,
                    || async {
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        Ok::<_, RequestError>(1u64)
                    },
                    &opts,
                )
                .await
        })
    };
    // Let the slow fetch get its earlier issue stamp.
    tokio::time::sleep(Duration::from_millis(20)).await;

    store
        .refresh(&key, || async { Ok::<_, RequestError>(2u64) }, &opts)
        .await
        .expect("fast refresh failed");

    let _ = slow.await.expect("slow refresh panicked");

    // The earlier-issued result finished last but must not win.
    assert_eq!(store.latest(&key).await.map(|v| *v), Some(2));
}

#[tokio::test]
async fn invalidation_triggers_an_immediate_refetch() {
    let store: PollingStore<u64> = PollingStore::new();
    let key = QueryKey::bare("/api/v1/dashboard/overview");
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RequestError>(1u64)
            }
        }
    };
    let opts = QueryOptions {
        refresh_interval: Some(Duration::from_secs(60)),
        ..options(Duration::from_secs(30))
    };

    let mut updates = store.updates();
    let subscription = store.subscribe(key.clone(), fetcher, opts);

    timeout(Duration::from_secs(2), updates.recv())
        .await
        .expect("timed out waiting for the initial fill")
        .expect("store dropped");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    store.invalidate(&key).await;

    timeout(Duration::from_secs(2), updates.recv())
        .await
        .expect("timed out waiting for the invalidation refetch")
        .expect("store dropped");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    subscription.stop().await.expect("stop failed");
}

#[tokio::test]
async fn stopping_a_subscription_halts_background_refresh() {
    let store: PollingStore<u64> = PollingStore::new();
    let key = QueryKey::bare("/api/v1/realtime/recent");
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RequestError>(1u64)
            }
        }
    };
    let opts = QueryOptions {
        refresh_interval: Some(Duration::from_millis(50)),
        ..options(Duration::ZERO)
    };

    let subscription = store.subscribe(key.clone(), fetcher, opts);
    tokio::time::sleep(Duration::from_millis(180)).await;
    subscription.stop().await.expect("stop failed");

    // Allow any refresh already spawned at stop time to finish.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let after_stop = calls.load(Ordering::SeqCst);
    assert!(after_stop >= 2, "expected periodic refreshes before stop");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after_stop);
}
