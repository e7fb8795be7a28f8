use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use batchload_rs::{
    BatchFunction, BatchResult, FetchError, KeyError, LoadError, Loader, LoaderConfig,
};
use futures::future;

#[derive(Debug, PartialEq, Eq, Clone)]
struct DummyData(String);

#[derive(Default)]
struct DummyContext {
    map: HashMap<i64, String>,
    /// Keys that the backend reports as failed rather than missing.
    broken: Vec<i64>,
    /// Fetches that include any of these keys take half a second.
    slow: Vec<i64>,
    /// While set, every fetch fails as a whole.
    unreachable: AtomicBool,
    /// Keys of every batch the loader dispatched, in call order.
    calls: Mutex<Vec<Vec<i64>>>,
}

impl DummyContext {
    fn with(entries: &[(i64, &str)]) -> Self {
        Self {
            map: entries.iter().map(|(k, v)| (*k, v.to_string())).collect(),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<Vec<i64>> {
        self.calls.lock().unwrap().clone()
    }
}

struct DummyDataLoader;

#[async_trait]
impl BatchFunction for DummyDataLoader {
    type Key = i64;
    type Value = DummyData;
    type Context = Arc<DummyContext>;

    async fn load(keys: &[i64], context: &Arc<DummyContext>) -> BatchResult<i64, DummyData> {
        context.calls.lock().unwrap().push(keys.to_vec());
        if keys.iter().any(|k| context.slow.contains(k)) {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        if context.unreachable.load(Ordering::SeqCst) {
            return Err(FetchError::new("connection refused"));
        }
        Ok(keys
            .iter()
            .filter_map(|k| {
                if context.broken.contains(k) {
                    return Some((*k, Err(KeyError::Other("corrupt row".to_owned()))));
                }
                context.map.get(k).cloned().map(|v| (*k, Ok(DummyData(v))))
            })
            .collect::<Vec<_>>())
    }
}

fn data(s: &str) -> Result<DummyData, LoadError> {
    Ok(DummyData(s.to_owned()))
}

fn not_found(key: i64) -> Result<DummyData, LoadError> {
    Err(LoadError::KeyNotFound { key: key.to_string() })
}

#[tokio::test]
async fn basic_load() {
    let context = Arc::new(DummyContext::with(&[(42, "Foo")]));

    let loader = Loader::new(DummyDataLoader {}, context.clone());
    assert_eq!(loader.load(42).await, data("Foo"));
    assert_eq!(context.calls(), vec![vec![42]]);
}

#[tokio::test]
async fn repeated_load_is_served_from_cache() {
    let context = Arc::new(DummyContext::with(&[(42, "Foo")]));

    let loader = Loader::new(DummyDataLoader {}, context.clone());
    assert_eq!(loader.load(42).await, data("Foo"));
    assert_eq!(loader.load(42).await, data("Foo"));
    assert_eq!(context.calls(), vec![vec![42]]);

    let stats = loader.stats().await.unwrap();
    assert_eq!(stats.load_requests(), 2);
    assert_eq!(stats.cache_hits(), 1);
    assert_eq!(stats.loads(), 1);
}

#[tokio::test]
async fn basic_load_many() {
    let context = Arc::new(DummyContext::with(&[
        (42, "one fish"),
        (12, "two fish"),
        (5, "red fish"),
        (8, "blue fish"),
    ]));

    let loader = Loader::new(DummyDataLoader {}, context.clone());
    assert_eq!(
        loader.load_many(vec![5, 12, 8, 12]).await,
        vec![data("red fish"), data("two fish"), data("blue fish"), data("two fish")]
    );
    assert_eq!(context.calls(), vec![vec![5, 12, 8]]);
}

#[tokio::test]
async fn load_many_empty() {
    let context = Arc::new(DummyContext::default());

    let loader = Loader::new(DummyDataLoader {}, context.clone());
    assert!(loader.load_many(vec![]).await.is_empty());
    assert!(context.calls().is_empty());
}

#[tokio::test]
async fn load_async() {
    let context = Arc::new(DummyContext::with(&[
        (42, "one fish"),
        (12, "two fish"),
        (5, "red fish"),
        (8, "blue fish"),
    ]));

    let loader = Loader::new(DummyDataLoader {}, context.clone());

    let tuple = future::join4(
        loader.load(5),
        loader.load_many(vec![5, 42]),
        loader.load(99),
        loader.load(12),
    );

    assert_eq!(
        tuple.await,
        (
            data("red fish"),
            vec![data("red fish"), data("one fish")],
            not_found(99),
            data("two fish")
        )
    );
    assert_eq!(context.calls(), vec![vec![5, 42, 99, 12]]);
}

#[tokio::test]
async fn duplicate_keys_share_one_fetch() {
    let context = Arc::new(DummyContext::with(&[(1, "home street"), (3, "main street")]));

    let loader = Loader::new(DummyDataLoader {}, context.clone());

    let (first, third, again) = future::join3(loader.load(1), loader.load(3), loader.load(1)).await;

    assert_eq!(context.calls(), vec![vec![1, 3]]);
    assert_eq!(first, data("home street"));
    assert_eq!(again, first);
    assert_eq!(third, data("main street"));
}

#[tokio::test]
async fn concurrent_distinct_keys_form_one_batch() {
    let entries = (0..50).map(|k| (k, format!("value {}", k))).collect::<Vec<_>>();
    let context = Arc::new(DummyContext {
        map: entries.iter().cloned().collect(),
        ..Default::default()
    });

    let loader = Loader::new(DummyDataLoader {}, context.clone());

    let results = future::join_all((0..50).chain(10..20).map(|k| loader.load(k))).await;

    let calls = context.calls();
    assert_eq!(calls.len(), 1);
    let mut keys = calls[0].clone();
    keys.sort();
    assert_eq!(keys, (0..50).collect::<Vec<_>>());
    for (k, result) in (0..50).chain(10..20).zip(results) {
        assert_eq!(result, Ok(DummyData(format!("value {}", k))));
    }
}

#[tokio::test]
async fn call_order_does_not_change_results() {
    let entries = [(1, "a"), (2, "b"), (3, "c"), (4, "d")];
    let forward = vec![1, 2, 3, 4, 9];
    let backward = forward.iter().rev().cloned().collect::<Vec<_>>();

    let mut outcomes = Vec::new();
    for order in [forward, backward] {
        let loader = Loader::new(DummyDataLoader {}, Arc::new(DummyContext::with(&entries)));
        let results = future::join_all(order.iter().map(|k| loader.load(*k))).await;
        let mut by_key = order.into_iter().zip(results).collect::<Vec<_>>();
        by_key.sort_by_key(|(k, _)| *k);
        outcomes.push(by_key);
    }

    assert_eq!(outcomes[0], outcomes[1]);
}

#[tokio::test]
async fn missing_key_fails_only_its_requesters() {
    let context = Arc::new(DummyContext::with(&[(1, "one"), (3, "three")]));

    let loader = Loader::new(DummyDataLoader {}, context.clone());

    let (one, two, three) = future::join3(loader.load(1), loader.load(2), loader.load(3)).await;
    assert_eq!(one, data("one"));
    assert_eq!(two, not_found(2));
    assert_eq!(three, data("three"));

    // Known-absent keys are cached for the rest of the unit of work.
    assert_eq!(loader.load(2).await, not_found(2));
    assert_eq!(context.calls(), vec![vec![1, 2, 3]]);
}

#[tokio::test]
async fn per_key_failure_is_not_cached() {
    let context = Arc::new(DummyContext {
        broken: vec![2],
        ..DummyContext::with(&[(1, "one"), (2, "two")])
    });

    let loader = Loader::new(DummyDataLoader {}, context.clone());

    assert_eq!(
        loader.load_many(vec![1, 2]).await,
        vec![
            data("one"),
            Err(LoadError::KeyFailed { key: "2".to_owned(), message: "corrupt row".to_owned() })
        ]
    );
    assert!(matches!(loader.load(2).await, Err(LoadError::KeyFailed { .. })));
    assert_eq!(context.calls(), vec![vec![1, 2], vec![2]]);
}

#[tokio::test]
async fn batch_failure_reaches_every_requester_and_is_not_cached() {
    let context = Arc::new(DummyContext::with(&[(5, "five"), (6, "six")]));
    context.unreachable.store(true, Ordering::SeqCst);

    let loader = Loader::new(DummyDataLoader {}, context.clone());

    let (five, six) = future::join(loader.load(5), loader.load(6)).await;
    let failure = Err(LoadError::BatchFetchFailure(FetchError::new("connection refused")));
    assert_eq!(five, failure);
    assert_eq!(six, failure);
    match five {
        Err(LoadError::BatchFetchFailure(error)) => {
            assert_eq!(error.message(), "connection refused")
        }
        other => panic!("unexpected result {:?}", other),
    }

    context.unreachable.store(false, Ordering::SeqCst);
    assert_eq!(loader.load(5).await, data("five"));
    assert_eq!(context.calls(), vec![vec![5, 6], vec![5]]);

    let stats = loader.stats().await.unwrap();
    assert_eq!(stats.failed_loads(), 1);
    assert_eq!(stats.loads(), 2);
}

#[tokio::test]
async fn max_batch_splits_dispatch() {
    let context = Arc::new(DummyContext::with(&[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")]));

    let loader = Loader::with_config(
        DummyDataLoader {},
        context.clone(),
        LoaderConfig::default().max_batch(2),
    );

    let results = loader.load_many(vec![1, 2, 3, 4, 5]).await;
    assert_eq!(results, vec![data("a"), data("b"), data("c"), data("d"), data("e")]);

    let mut calls = context.calls();
    calls.sort();
    assert_eq!(calls, vec![vec![1, 2], vec![3, 4], vec![5]]);
}

#[tokio::test]
async fn flush_dispatches_before_window_closes() {
    let context = Arc::new(DummyContext::with(&[(7, "seven")]));

    let loader = Loader::with_config(
        DummyDataLoader {},
        context.clone(),
        LoaderConfig::default().wait(Duration::from_secs(30)),
    );

    let (seven, ()) = tokio::time::timeout(
        Duration::from_secs(5),
        future::join(loader.load(7), async { loader.flush() }),
    )
    .await
    .expect("flush should dispatch immediately");
    assert_eq!(seven, data("seven"));
}

#[tokio::test]
async fn zero_wait_still_batches_ready_requests() {
    let context = Arc::new(DummyContext::with(&[(1, "a"), (2, "b")]));

    let loader = Loader::with_config(
        DummyDataLoader {},
        context.clone(),
        LoaderConfig::default().wait(Duration::ZERO),
    );

    let (a, b) = future::join(loader.load(1), loader.load(2)).await;
    assert_eq!((a, b), (data("a"), data("b")));
    assert_eq!(context.calls(), vec![vec![1, 2]]);
}

#[tokio::test]
async fn primed_values_skip_the_fetch() {
    let context = Arc::new(DummyContext::with(&[(1, "from backend")]));

    let loader = Loader::new(DummyDataLoader {}, context.clone());
    loader.prime(1, DummyData("primed".to_owned())).await.unwrap();
    loader.prime_many(vec![(2, DummyData("also primed".to_owned()))]).await.unwrap();

    assert_eq!(loader.load_many(vec![1, 2]).await, vec![data("primed"), data("also primed")]);
    assert!(context.calls().is_empty());
}

#[tokio::test]
async fn cancel_releases_pending_requests() {
    let context = Arc::new(DummyContext::with(&[(1, "a")]));

    let loader = Loader::with_config(
        DummyDataLoader {},
        context.clone(),
        LoaderConfig::default().wait(Duration::from_secs(30)),
    );

    let (pending, ()) = future::join(loader.load(1), async { loader.cancel() }).await;
    assert_eq!(pending, Err(LoadError::Cancelled));
    assert_eq!(loader.load(1).await, Err(LoadError::Cancelled));
    assert_eq!(
        loader.load_many(vec![1, 2]).await,
        vec![Err(LoadError::Cancelled), Err(LoadError::Cancelled)]
    );
    assert!(loader.stats().await.is_none());
    assert_eq!(loader.prime(1, DummyData("late".to_owned())).await, Err(LoadError::Cancelled));
    assert_eq!(loader.prime_many(vec![]).await, Err(LoadError::Cancelled));
    assert!(context.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawned_subtasks_join_one_batch() {
    let entries = (0..20).map(|k| (k, format!("value {}", k))).collect::<Vec<_>>();
    let context = Arc::new(DummyContext {
        map: entries.into_iter().collect(),
        ..Default::default()
    });

    let loader = Arc::new(Loader::with_config(
        DummyDataLoader {},
        context.clone(),
        LoaderConfig::default().wait(Duration::from_millis(200)),
    ));

    let handles = (0..20)
        .map(|k| {
            let loader = loader.clone();
            tokio::spawn(async move { (k, loader.load(k % 10).await) })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        let (k, result) = handle.await.unwrap();
        assert_eq!(result, Ok(DummyData(format!("value {}", k % 10))));
    }

    let calls = context.calls();
    assert_eq!(calls.len(), 1);
    let mut keys = calls[0].clone();
    keys.sort();
    assert_eq!(keys, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn cached_load_is_answered_while_a_fetch_is_in_flight() {
    let context = Arc::new(DummyContext {
        slow: vec![2],
        ..DummyContext::with(&[(1, "one"), (2, "two")])
    });

    let loader = Arc::new(Loader::new(DummyDataLoader {}, context.clone()));
    assert_eq!(loader.load(1).await, data("one"));

    let slow_load = tokio::spawn({
        let loader = loader.clone();
        async move { loader.load(2).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    assert_eq!(loader.load(1).await, data("one"));
    assert!(started.elapsed() < Duration::from_millis(200), "took {:?}", started.elapsed());

    assert_eq!(slow_load.await.unwrap(), data("two"));
    assert_eq!(context.calls(), vec![vec![1], vec![2]]);
}

#[tokio::test]
async fn key_in_flight_is_joined_while_new_keys_dispatch() {
    let context = Arc::new(DummyContext {
        slow: vec![2],
        ..DummyContext::with(&[(2, "two"), (3, "three")])
    });

    let loader = Arc::new(Loader::new(DummyDataLoader {}, context.clone()));

    let slow_load = tokio::spawn({
        let loader = loader.clone();
        async move { loader.load(2).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    assert_eq!(loader.load(3).await, data("three"));
    assert!(started.elapsed() < Duration::from_millis(200), "took {:?}", started.elapsed());

    assert_eq!(loader.load(2).await, data("two"));
    assert_eq!(slow_load.await.unwrap(), data("two"));
    assert_eq!(context.calls(), vec![vec![2], vec![3]]);
}

#[tokio::test]
async fn cancel_during_fetch_releases_waiters() {
    let context = Arc::new(DummyContext {
        slow: vec![2],
        ..DummyContext::with(&[(2, "two")])
    });

    let loader = Arc::new(Loader::new(DummyDataLoader {}, context.clone()));

    let waiter = tokio::spawn({
        let loader = loader.clone();
        async move { loader.load(2).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(context.calls(), vec![vec![2]]);

    loader.cancel();
    assert_eq!(waiter.await.unwrap(), Err(LoadError::Cancelled));
    assert_eq!(loader.prime(2, DummyData("late".to_owned())).await, Err(LoadError::Cancelled));

    // Nothing from the abandoned fetch leaks into the next unit of work.
    let fresh = Loader::new(DummyDataLoader {}, context.clone());
    assert_eq!(fresh.load(2).await, data("two"));
    assert_eq!(context.calls(), vec![vec![2], vec![2]]);
}

#[tokio::test]
async fn prime_of_staged_key_skips_its_fetch() {
    let context = Arc::new(DummyContext::with(&[(7, "from backend"), (8, "eight")]));

    let loader = Loader::with_config(
        DummyDataLoader {},
        context.clone(),
        LoaderConfig::default().wait(Duration::from_secs(30)),
    );

    let (results, ()) = tokio::time::timeout(
        Duration::from_secs(5),
        future::join(loader.load_many(vec![7, 8]), async {
            loader.prime(7, DummyData("primed".to_owned())).await.unwrap();
            loader.flush();
        }),
    )
    .await
    .expect("flush should dispatch the remaining key");

    assert_eq!(results, vec![data("primed"), data("eight")]);
    assert_eq!(context.calls(), vec![vec![8]]);
    assert_eq!(loader.load(7).await, data("primed"));
}

#[tokio::test]
async fn max_batch_dispatches_without_flush() {
    let context = Arc::new(DummyContext::with(&[(1, "a"), (2, "b")]));

    let loader = Loader::with_config(
        DummyDataLoader {},
        context.clone(),
        LoaderConfig::default().wait(Duration::from_secs(30)).max_batch(2),
    );

    let (a, b) =
        tokio::time::timeout(Duration::from_secs(5), future::join(loader.load(1), loader.load(2)))
            .await
            .expect("a full batch should dispatch immediately");
    assert_eq!((a, b), (data("a"), data("b")));
    assert_eq!(context.calls(), vec![vec![1, 2]]);
}

#[tokio::test]
async fn flush_without_staged_keys_is_ignored() {
    let context = Arc::new(DummyContext {
        slow: vec![2],
        ..DummyContext::with(&[(2, "two"), (3, "three"), (4, "four")])
    });

    let loader = Arc::new(Loader::with_config(
        DummyDataLoader {},
        context.clone(),
        LoaderConfig::default().wait(Duration::from_millis(100)),
    ));

    let slow_load = tokio::spawn({
        let loader = loader.clone();
        async move { loader.load(2).await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(context.calls(), vec![vec![2]]);

    // Arrives while the only batch is in flight, so it must not cut the next window short.
    loader.flush();
    let (three, four) = future::join(loader.load(3), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        loader.load(4).await
    })
    .await;
    assert_eq!((three, four), (data("three"), data("four")));
    assert_eq!(slow_load.await.unwrap(), data("two"));
    assert_eq!(context.calls(), vec![vec![2], vec![3, 4]]);
}
