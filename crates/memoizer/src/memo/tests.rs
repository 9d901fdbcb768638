use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use memoizer_test::{Gate, Invocations};
use tokio::time::Instant;

use super::*;

type TestMemo = Memoizer<&'static str, u32, String>;

/// Creates a memoizer whose computation takes `latency`.
///
/// The computation returns `42` for `"slow"` and the key length for everything else. It fails
/// for keys starting with `"bad"` and panics for keys starting with `"panic"`.
fn test_memo(invocations: &Invocations<&'static str>, latency: Duration) -> TestMemo {
    let invocations = invocations.clone();
    Memoizer::new(MemoConfig::named("test"), move |key: &'static str| {
        let invocations = invocations.clone();
        async move {
            invocations.record(key);
            tokio::time::sleep(latency).await;

            if key.starts_with("bad") {
                return Err("boom".to_string());
            }
            if key.starts_with("panic") {
                panic!("computation for {key} exploded");
            }
            match key {
                "slow" => Ok(42),
                _ => Ok(key.len() as u32),
            }
        }
    })
}

/// Creates a memoizer whose computation for `"blocked"` waits on `gate`.
fn gated_memo(invocations: &Invocations<&'static str>, gate: &Gate) -> TestMemo {
    let invocations = invocations.clone();
    let gate = gate.clone();
    Memoizer::new(MemoConfig::named("gated"), move |key: &'static str| {
        let invocations = invocations.clone();
        let gate = gate.clone();
        async move {
            invocations.record(key);
            if key == "blocked" {
                gate.wait().await;
            }
            Ok(key.len() as u32)
        }
    })
}

async fn wait_for_computation(invocations: &Invocations<&'static str>, key: &'static str) {
    while invocations.count(&key) == 0 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_computation() {
    memoizer_test::setup();
    let invocations = Invocations::new();
    let memo = test_memo(&invocations, Duration::from_millis(100));

    let start = Instant::now();
    let results = join_all((0..10).map(|_| memo.get("slow"))).await;
    let elapsed = start.elapsed();

    assert_eq!(results, vec![Ok(42); 10]);
    assert_eq!(invocations.count(&"slow"), 1);
    // All callers waited on the same computation, rather than on ten of them in a row.
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(200));
}

#[tokio::test]
async fn test_sequential_calls_hit_cache() {
    memoizer_test::setup();
    let invocations = Invocations::new();
    let memo = test_memo(&invocations, Duration::ZERO);

    assert_eq!(memo.get("abc").await, Ok(3));
    assert_eq!(memo.get("abc").await, Ok(3));

    // Clones share the same cache.
    let other = memo.clone();
    assert_eq!(other.get("abc").await, Ok(3));

    assert_eq!(invocations.count(&"abc"), 1);
    assert_eq!(memo.name(), "test");
}

#[tokio::test]
async fn test_errors_are_cached() {
    memoizer_test::setup();
    let invocations = Invocations::new();
    let memo = test_memo(&invocations, Duration::ZERO);

    let boom = Err(MemoError::Computation("boom".to_string()));
    assert_eq!(memo.get("bad").await, boom);
    assert_eq!(memo.get("bad").await, boom);
    assert_eq!(invocations.count(&"bad"), 1);

    let results = join_all((0..5).map(|_| memo.get("bad-concurrent"))).await;
    assert_eq!(results, vec![boom; 5]);
    assert_eq!(invocations.count(&"bad-concurrent"), 1);
}

#[tokio::test]
async fn test_distinct_keys_are_independent() {
    memoizer_test::setup();
    let invocations = Invocations::new();
    let gate = Gate::new();
    let memo = gated_memo(&invocations, &gate);

    assert_eq!(memo.get("free").await, Ok(4));

    let blocked = tokio::spawn({
        let memo = memo.clone();
        async move { memo.get("blocked").await }
    });
    wait_for_computation(&invocations, "blocked").await;

    // Neither a cached key nor a new one waits for the blocked computation.
    assert_eq!(memo.get("free").await, Ok(4));
    assert_eq!(memo.get("other").await, Ok(5));
    assert!(!blocked.is_finished());

    gate.open();
    assert_eq!(blocked.await.unwrap(), Ok(7));
    assert_eq!(invocations.total(), 3);
}

#[tokio::test]
async fn test_get_after_close_is_rejected() {
    memoizer_test::setup();
    let invocations = Invocations::new();
    let memo = test_memo(&invocations, Duration::ZERO);

    assert_eq!(memo.get("abc").await, Ok(3));

    let other = memo.clone();
    memo.close();
    memo.close();
    assert!(memo.is_closed());
    assert!(other.is_closed());

    assert_eq!(memo.get("abc").await, Err(MemoError::Closed));
    assert_eq!(other.get("new").await, Err(MemoError::Closed));
    assert_eq!(invocations.total(), 1);
}

#[tokio::test]
async fn test_in_flight_requests_complete_after_close() {
    memoizer_test::setup();
    let invocations = Invocations::new();
    let gate = Gate::new();
    let memo = gated_memo(&invocations, &gate);

    let in_flight = tokio::spawn({
        let memo = memo.clone();
        async move { memo.get("blocked").await }
    });
    wait_for_computation(&invocations, "blocked").await;

    memo.close();
    assert_eq!(memo.get("blocked").await, Err(MemoError::Closed));

    gate.open();
    assert_eq!(in_flight.await.unwrap(), Ok(7));
    assert_eq!(invocations.count(&"blocked"), 1);
}

#[tokio::test]
async fn test_admitted_requests_are_drained_on_close() {
    memoizer_test::setup();
    let invocations = Invocations::new();
    let memo = test_memo(&invocations, Duration::ZERO);

    // Enqueue a request without giving the coordinator a chance to run.
    let mut admitted = Box::pin(memo.get("abc"));
    assert!(futures::poll!(&mut admitted).is_pending());

    memo.close();
    assert_eq!(admitted.await, Ok(3));
    assert_eq!(memo.get("abc").await, Err(MemoError::Closed));
}

#[tokio::test]
async fn test_blocked_admission_rejected_on_close() {
    memoizer_test::setup();
    let invocations = Invocations::new();
    let config = MemoConfig {
        name: "narrow".into(),
        max_queue_size: 1,
    };
    let memo = {
        let invocations = invocations.clone();
        Memoizer::new(config, move |key: &'static str| {
            let invocations = invocations.clone();
            async move {
                invocations.record(key);
                Ok::<_, String>(key.len() as u32)
            }
        })
    };

    // The first request takes the only queue slot, the second one waits for capacity.
    let mut admitted = Box::pin(memo.get("a"));
    let mut waiting = Box::pin(memo.get("b"));
    assert!(futures::poll!(&mut admitted).is_pending());
    assert!(futures::poll!(&mut waiting).is_pending());

    memo.close();
    assert_eq!(waiting.await, Err(MemoError::Closed));
    assert_eq!(admitted.await, Ok(1));
    assert_eq!(invocations.count(&"b"), 0);
}

#[tokio::test]
async fn test_dropping_all_handles_stops_coordinator() {
    memoizer_test::setup();
    let invocations = Invocations::new();
    let gate = Gate::new();

    // Owned by the memoized function, which lives as long as the coordinator.
    let marker = Arc::new(());
    let coordinator_alive = Arc::downgrade(&marker);

    let memo: TestMemo = {
        let invocations = invocations.clone();
        let gate = gate.clone();
        Memoizer::new(MemoConfig::named("dropped"), move |key: &'static str| {
            let _marker = &marker;
            let invocations = invocations.clone();
            let gate = gate.clone();
            async move {
                invocations.record(key);
                gate.wait().await;
                Ok(key.len() as u32)
            }
        })
    };

    let in_flight = tokio::spawn({
        let memo = memo.clone();
        async move { memo.get("blocked").await }
    });
    wait_for_computation(&invocations, "blocked").await;

    drop(memo);
    // The spawned caller still holds a handle.
    assert!(coordinator_alive.upgrade().is_some());

    gate.open();
    assert_eq!(in_flight.await.unwrap(), Ok(7));

    tokio::time::timeout(Duration::from_secs(5), async {
        while coordinator_alive.strong_count() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("coordinator did not stop after the last handle was dropped");

    // Other memoizers on the same runtime are unaffected.
    let other = test_memo(&Invocations::new(), Duration::ZERO);
    assert_eq!(other.get("abc").await, Ok(3));
}

#[test]
fn test_debug_output() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let memo = Memoizer::with_runtime(
        MemoConfig::named("debug"),
        runtime.handle().clone(),
        |key: u32| async move { Ok::<_, String>(key) },
    );

    let debug = format!("{memo:?}");
    assert!(debug.contains(r#"name: "debug""#), "{debug}");
    assert!(debug.contains("queue_capacity: 1024"), "{debug}");
    assert!(debug.contains("closed: false"), "{debug}");
}

#[tokio::test]
async fn test_panicking_computation_is_isolated() {
    memoizer_test::setup();
    let invocations = Invocations::new();
    let memo = test_memo(&invocations, Duration::ZERO);

    assert_eq!(memo.get("panic").await, Err(MemoError::Canceled));
    // The outcome is permanent, and it is not computed again.
    assert_eq!(memo.get("panic").await, Err(MemoError::Canceled));
    assert_eq!(invocations.count(&"panic"), 1);

    // The coordinator is still serving other keys.
    assert_eq!(memo.get("abc").await, Ok(3));
}

#[tokio::test(start_paused = true)]
async fn test_caller_going_away_does_not_affect_others() {
    memoizer_test::setup();
    let invocations = Invocations::new();
    let memo = test_memo(&invocations, Duration::from_secs(1));

    let abandoned = tokio::time::timeout(Duration::from_millis(10), memo.get("abc")).await;
    assert!(abandoned.is_err());

    assert_eq!(memo.get("abc").await, Ok(3));
    assert_eq!(invocations.count(&"abc"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_computation_wrapped_with_cancellation() {
    memoizer_test::setup();
    let token = CancellationToken::new();
    let memo = {
        let token = token.clone();
        Memoizer::new(MemoConfig::named("cancelable"), move |key: u64| {
            let token = token.clone();
            async move {
                tokio::select! {
                    _ = token.cancelled() => Err("canceled by caller".to_string()),
                    _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(key),
                }
            }
        })
    };

    let pending = tokio::spawn({
        let memo = memo.clone();
        async move { memo.get(1).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();

    // The canceled outcome is an ordinary computation error, cached like any other.
    let canceled = Err(MemoError::Computation("canceled by caller".to_string()));
    assert_eq!(pending.await.unwrap(), canceled);
    assert_eq!(memo.get(1).await, canceled);
}

#[tokio::test]
async fn test_minimal_queue() {
    memoizer_test::setup();
    let config = MemoConfig {
        name: "tiny".into(),
        max_queue_size: 0,
    };
    let memo = Memoizer::new(config, |key: u64| async move { Ok::<_, String>(key * 2) });

    let results = join_all((0..50).map(|i| memo.get(i % 5))).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result, Ok((i as u64 % 5) * 2));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_callers() {
    memoizer_test::setup();
    let invocations = Invocations::new();
    let memo = test_memo(&invocations, Duration::from_millis(20));

    let keys = ["a", "bb", "ccc", "dddd", "bad", "bad-too"];
    let tasks = (0..200).map(|i| {
        let memo = memo.clone();
        let key = keys[i % keys.len()];
        tokio::spawn(async move { (key, memo.get(key).await) })
    });

    for task in join_all(tasks).await {
        let (key, result) = task.unwrap();
        if key.starts_with("bad") {
            assert_eq!(result, Err(MemoError::Computation("boom".into())));
        } else {
            assert_eq!(result, Ok(key.len() as u32));
        }
    }

    for key in keys {
        assert_eq!(invocations.count(&key), 1, "key {key} computed more than once");
    }
    assert_eq!(invocations.distinct_keys(), keys.len());
}

#[test]
fn test_blocking_get_from_threads() {
    memoizer_test::setup();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let invocations = Invocations::new();
    let memo = {
        let invocations = invocations.clone();
        Memoizer::with_runtime(
            MemoConfig::named("blocking"),
            runtime.handle().clone(),
            move |key: &'static str| {
                let invocations = invocations.clone();
                async move {
                    invocations.record(key);
                    Ok::<_, String>(key.len() as u32)
                }
            },
        )
    };

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let memo = memo.clone();
            std::thread::spawn(move || memo.blocking_get("thread"))
        })
        .collect();
    for thread in threads {
        assert_eq!(thread.join().unwrap(), Ok(6));
    }
    assert_eq!(invocations.count(&"thread"), 1);

    memo.close();
    assert_eq!(memo.blocking_get("thread"), Err(MemoError::Closed));
}

#[test]
fn test_error_display() {
    let err = MemoError::Computation("boom".to_string());
    assert_eq!(err.to_string(), "computation failed: boom");
    assert_eq!(err.into_computation_error(), Some("boom".to_string()));

    assert_eq!(MemoError::<String>::Closed.to_string(), "memoizer is closed");
    assert_eq!(MemoError::<String>::Canceled.into_computation_error(), None);
}
