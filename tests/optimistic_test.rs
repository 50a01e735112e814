use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use skjold::cache::{query_fn, QueryFn};
use skjold::key;
use skjold::transport::NoopNotifier;
use skjold::{
    run_optimistic, ApiError, MutationState, OptimisticOptions, QueryCache, QueryConfig,
    RateLimiters,
};
use skjold::query::Mutation;

fn quiet_cache() -> QueryCache {
    QueryCache::with_context(
        QueryConfig::default(),
        Arc::new(RateLimiters::default()),
        Arc::new(NoopNotifier),
    )
}

fn succeeding(delay: Duration) -> QueryFn {
    query_fn(move || async move {
        tokio::time::sleep(delay).await;
        Ok(json!({"ok": true}))
    })
}

fn failing(delay: Duration) -> QueryFn {
    query_fn(move || async move {
        tokio::time::sleep(delay).await;
        Err(ApiError::Server {
            status: 500,
            message: "write failed".into(),
        })
    })
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_the_optimistic_value_immediately() {
    let cache = quiet_cache();
    let key = key!["orders", "detail", "7"];
    cache.set_data(&key, |_| json!({"id": "7", "status": "pending"}));
    let sub = cache.subscribe(&key);

    let cache_bg = cache.clone();
    let key_bg = key.clone();
    let task = tokio::spawn(async move {
        run_optimistic(
            &cache_bg,
            &key_bg,
            succeeding(Duration::from_millis(100)),
            |old| {
                let mut v = old.unwrap_or(Value::Null);
                v["status"] = json!("shipped");
                v
            },
            &OptimisticOptions::new().invalidate_on_success(false),
        )
        .await
    });

    // While the mutation is still in flight the cache already shows the
    // predicted value.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        sub.snapshot().data,
        Some(json!({"id": "7", "status": "shipped"}))
    );

    task.await.unwrap().unwrap();
    assert_eq!(
        cache.get_data(&key),
        Some(json!({"id": "7", "status": "shipped"}))
    );
}

#[tokio::test(start_paused = true)]
async fn failure_restores_the_exact_previous_value() {
    let cache = quiet_cache();
    let key = key!["orders", "detail", "7"];
    let original = json!({
        "id": "7",
        "status": "pending",
        "items": [{"sku": "a", "qty": 2}, {"sku": "b", "qty": 1}],
        "total": 34.5,
        "note": null
    });
    cache.set_data(&key, |_| original.clone());

    let result = run_optimistic(
        &cache,
        &key,
        failing(Duration::from_millis(10)),
        |_| json!({"id": "7", "status": "shipped"}),
        &OptimisticOptions::default(),
    )
    .await;

    assert!(matches!(result, Err(ApiError::Server { status: 500, .. })));
    assert_eq!(cache.get_data(&key), Some(original));
}

#[tokio::test(start_paused = true)]
async fn failure_on_empty_entry_rolls_back_to_empty() {
    let cache = quiet_cache();
    let key = key!["orders", "detail", "9"];

    let result = run_optimistic(
        &cache,
        &key,
        failing(Duration::from_millis(10)),
        |_| json!({"id": "9"}),
        &OptimisticOptions::default(),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(cache.get_data(&key), None);
}

#[tokio::test(start_paused = true)]
async fn success_invalidates_for_reconciliation() {
    let cache = quiet_cache();
    let count = Arc::new(AtomicU32::new(0));
    let key = key!["orders", "detail", "7"];
    let config = QueryConfig::default();

    let calls = count.clone();
    let fetch_op = query_fn(move || {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({"id": "7", "rev": n}))
        }
    });

    let _sub = cache.subscribe(&key);
    cache.fetch(&key, fetch_op.clone(), &config).await.unwrap();
    assert_eq!(cache.get_data(&key), Some(json!({"id": "7", "rev": 1})));

    run_optimistic(
        &cache,
        &key,
        succeeding(Duration::ZERO),
        |_| json!({"id": "7", "rev": "optimistic"}),
        &OptimisticOptions::default(),
    )
    .await
    .unwrap();

    // Invalidation scheduled a refresh; server truth replaces the guess.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.get_data(&key), Some(json!({"id": "7", "rev": 2})));
}

#[tokio::test(start_paused = true)]
async fn stale_rollback_does_not_clobber_newer_writes() {
    let cache = quiet_cache();
    let key = key!["orders", "detail", "7"];
    cache.set_data(&key, |_| json!({"v": "original"}));

    // Mutation A applies, then fails after 100ms.
    let cache_a = cache.clone();
    let key_a = key.clone();
    let task = tokio::spawn(async move {
        run_optimistic(
            &cache_a,
            &key_a,
            failing(Duration::from_millis(100)),
            |_| json!({"v": "from-a"}),
            &OptimisticOptions::default(),
        )
        .await
    });

    // A second writer gets there while A is in flight.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.get_data(&key), Some(json!({"v": "from-a"})));
    cache.set_data(&key, |_| json!({"v": "from-b"}));

    // A's failure must not roll the entry back to "original".
    let result = task.await.unwrap();
    assert!(result.is_err());
    assert_eq!(cache.get_data(&key), Some(json!({"v": "from-b"})));
}

#[tokio::test(start_paused = true)]
async fn background_refresh_is_paused_during_mutation() {
    let cache = quiet_cache();
    let count = Arc::new(AtomicU32::new(0));
    let key = key!["orders", "list"];
    let config = QueryConfig::default().stale_time(Duration::from_millis(50));

    let calls = count.clone();
    let fetch_op = query_fn(move || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"from": "server"}))
        }
    });

    let _sub = cache.subscribe(&key);
    cache.fetch(&key, fetch_op.clone(), &config).await.unwrap();
    tokio::time::advance(Duration::from_millis(80)).await; // now stale

    let cache_bg = cache.clone();
    let key_bg = key.clone();
    let task = tokio::spawn(async move {
        run_optimistic(
            &cache_bg,
            &key_bg,
            succeeding(Duration::from_millis(100)),
            |_| json!({"from": "optimistic"}),
            &OptimisticOptions::new().invalidate_on_success(false),
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // A stale-entry fetch while the mutation is in flight serves the
    // optimistic value and must not schedule a refresh over it.
    let served = cache.fetch(&key, fetch_op.clone(), &config).await.unwrap();
    assert_eq!(served, json!({"from": "optimistic"}));

    task.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get_data(&key), Some(json!({"from": "optimistic"})));
}

#[tokio::test(start_paused = true)]
async fn mutation_handle_reports_lifecycle() {
    let cache = quiet_cache();
    let key = key!["orders", "detail", "7"];
    cache.set_data(&key, |_| json!({"status": "pending"}));

    let ok = Mutation::new(
        &cache,
        succeeding(Duration::ZERO),
        OptimisticOptions::new().invalidate_on_success(false),
    );
    assert_eq!(ok.state(), MutationState::Idle);
    ok.run(&key, |_| json!({"status": "shipped"})).await.unwrap();
    assert_eq!(ok.state(), MutationState::Settled);

    let failing = Mutation::new(&cache, failing(Duration::ZERO), OptimisticOptions::default());
    let result = failing.run(&key, |_| json!({"status": "lost"})).await;
    assert!(result.is_err());
    assert_eq!(failing.state(), MutationState::RolledBack);
    // Rolled back to the value the successful mutation left behind.
    assert_eq!(cache.get_data(&key), Some(json!({"status": "shipped"})));
}
