use std::fs;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::oneshot;

use fetchcache_service::{CacheError, FetchOptions, TransportError};

use crate::{
    ScriptedTransport, Step, blob_store, coordinator_in, request, setup_coordinator,
    setup_memory_coordinator, wait_for,
};

#[tokio::test(start_paused = true)]
async fn test_concurrent_fetches_are_deduplicated() {
    let transport = ScriptedTransport::new(Step::ok("payload").delayed(Duration::from_millis(200)));
    let coordinator = setup_memory_coordinator(transport.clone(), |_| {});

    let (key, request) = request("img");
    let handles =
        (0..10).map(|_| coordinator.fetch(key.clone(), request.clone(), Default::default()));

    for result in join_all(handles).await {
        assert_eq!(result.unwrap(), "payload");
    }
    assert_eq!(transport.calls(), 1);
    assert_eq!(coordinator.stats().inflight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetches_from_many_threads_are_deduplicated() {
    let transport =
        ScriptedTransport::new(Step::ok("payload").delayed(Duration::from_millis(100)));
    let coordinator = setup_memory_coordinator(transport.clone(), |_| {});

    let (key, request) = request("img");
    let tasks = (0..8).map(|_| {
        let coordinator = coordinator.clone();
        let key = key.clone();
        let request = request.clone();
        tokio::spawn(async move { coordinator.fetch(key, request, Default::default()).await })
    });

    for result in join_all(tasks).await {
        assert_eq!(result.unwrap().unwrap(), "payload");
    }
    assert_eq!(transport.calls(), 1);
    assert_eq!(coordinator.stats().inflight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_caller_joins_running_fetch() {
    let transport = ScriptedTransport::new(Step::ok("image").delayed(Duration::from_millis(200)));
    let coordinator = setup_memory_coordinator(transport.clone(), |_| {});

    let (key, request) = request("img");
    let first = coordinator.fetch(key.clone(), request.clone(), Default::default());
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = coordinator.fetch(key, request, Default::default());

    assert_eq!(first.await.unwrap(), "image");
    assert_eq!(second.await.unwrap(), "image");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_different_keys_are_fetched_separately() {
    let transport = ScriptedTransport::new(Step::ok("payload").delayed(Duration::from_millis(100)));
    let coordinator = setup_memory_coordinator(transport.clone(), |_| {});

    let (key_a, request_a) = request("a");
    let (key_b, request_b) = request("b");
    let a = coordinator.fetch(key_a, request_a, Default::default());
    let b = coordinator.fetch(key_b, request_b, Default::default());

    a.await.unwrap();
    b.await.unwrap();
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_cached_on_success() {
    let transport = ScriptedTransport::new(Step::ok("payload"));
    let (coordinator, cache_dir) = setup_coordinator(transport.clone(), |_| {});

    let (key, request) = request("data.json");
    let first = coordinator.fetch(key.clone(), request.clone(), Default::default());
    assert_eq!(first.await.unwrap(), "payload");

    let second = coordinator.fetch(key.clone(), request, Default::default());
    assert_eq!(second.await.unwrap(), "payload");
    assert_eq!(transport.calls(), 1);

    // written through to the file-system
    let store = blob_store(cache_dir.path(), |_| {});
    assert_eq!(store.read(&key).unwrap().unwrap().payload, "payload");
}

#[tokio::test]
async fn test_promoted_from_disk() {
    let transport = ScriptedTransport::new(Step::ok("payload"));
    let (coordinator, cache_dir) = setup_coordinator(transport.clone(), |_| {});

    let (key, request) = request("data.json");
    coordinator
        .fetch(key.clone(), request.clone(), Default::default())
        .await
        .unwrap();

    coordinator.on_resource_pressure();
    let result = coordinator.fetch(key.clone(), request.clone(), Default::default());
    assert_eq!(result.await.unwrap(), "payload");
    assert_eq!(transport.calls(), 1);

    // a fresh coordinator on the same directory starts with an empty memory
    let other_transport = ScriptedTransport::new(Step::ok("other"));
    let other = coordinator_in(cache_dir.path(), other_transport.clone(), |_| {});
    let result = other.fetch(key, request, Default::default());
    assert_eq!(result.await.unwrap(), "payload");
    assert_eq!(other_transport.calls(), 0);
}

#[tokio::test]
async fn test_expired_entries_are_refetched() {
    let transport = ScriptedTransport::with_script([Step::ok("first")], Step::ok("second"));
    let (coordinator, cache_dir) = setup_coordinator(transport.clone(), |config| {
        config.caches.disk.entry_lifetime = Duration::from_millis(200);
    });

    let (key, request) = request("data.json");
    let result = coordinator.fetch(key.clone(), request.clone(), Default::default());
    assert_eq!(result.await.unwrap(), "first");

    tokio::time::sleep(Duration::from_millis(300)).await;

    let result = coordinator.fetch(key.clone(), request, Default::default());
    assert_eq!(result.await.unwrap(), "second");
    assert_eq!(transport.calls(), 2);

    let store = blob_store(cache_dir.path(), |_| {});
    assert_eq!(store.read(&key).unwrap().unwrap().payload, "second");
}

#[tokio::test]
async fn test_corrupt_cache_file_is_replaced() {
    let transport = ScriptedTransport::new(Step::ok("payload"));
    let (coordinator, cache_dir) = setup_coordinator(transport.clone(), |_| {});

    let (key, request) = request("data.json");
    let store = blob_store(cache_dir.path(), |_| {});
    let path = store.path_for(&key);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"garbage").unwrap();

    let result = coordinator.fetch(key.clone(), request, Default::default());
    assert_eq!(result.await.unwrap(), "payload");
    assert_eq!(transport.calls(), 1);

    assert_eq!(store.read(&key).unwrap().unwrap().payload, "payload");
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_are_retried_with_backoff() {
    let slow = Step::ok("late").delayed(Duration::from_secs(10));
    let transport = ScriptedTransport::with_script([slow.clone(), slow], Step::ok("OK"));
    let coordinator = setup_memory_coordinator(transport.clone(), |config| {
        config.fetch.timeout = Duration::from_secs(5);
        config.fetch.max_retry_attempts = 3;
        config.fetch.base_retry_delay = Duration::from_secs(1);
    });

    let (key, request) = request("data.json");
    let result = coordinator.fetch(key, request, Default::default());
    assert_eq!(result.await.unwrap(), "OK");

    let times = transport.call_times();
    assert_eq!(times.len(), 3);
    // each attempt runs into the 5s timeout, followed by waits of 1s and 2s
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(first_gap >= Duration::from_secs(6) && first_gap < Duration::from_millis(6100));
    assert!(second_gap >= Duration::from_secs(7) && second_gap < Duration::from_millis(7100));

    // the timed out attempts were dropped
    assert_eq!(transport.aborted(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_exhaust_attempts() {
    let transport = ScriptedTransport::new(Step::status(503));
    let coordinator = setup_memory_coordinator(transport.clone(), |_| {});

    let (key, request) = request("data.json");
    let error = coordinator
        .fetch(key.clone(), request.clone(), Default::default())
        .await
        .unwrap_err();
    assert!(
        matches!(error, CacheError::TransientFailure { attempts: 3, .. }),
        "{error:?}"
    );
    assert_eq!(transport.calls(), 3);

    // failures are not cached
    coordinator
        .fetch(key, request, Default::default())
        .await
        .unwrap_err();
    assert_eq!(transport.calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failures_are_not_retried() {
    let transport = ScriptedTransport::with_script(
        [
            Step::status(404),
            Step::error(TransportError::InvalidRequest("no scheme".into())),
        ],
        Step::ok("payload"),
    );
    let coordinator = setup_memory_coordinator(transport.clone(), |_| {});

    let (key, request) = request("data.json");
    let result = coordinator.fetch(key.clone(), request.clone(), Default::default());
    assert_eq!(result.await, Err(CacheError::InvalidResponse(404)));
    assert_eq!(transport.calls(), 1);

    let result = coordinator.fetch(key.clone(), request.clone(), Default::default());
    assert!(matches!(result.await, Err(CacheError::PermanentFailure(_))));
    assert_eq!(transport.calls(), 2);

    let result = coordinator.fetch(key, request, Default::default());
    assert_eq!(result.await.unwrap(), "payload");
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_errors_are_broadcast() {
    let transport = ScriptedTransport::new(Step::status(404).delayed(Duration::from_millis(100)));
    let coordinator = setup_memory_coordinator(transport.clone(), |_| {});

    let (key, request) = request("data.json");
    let handles =
        (0..3).map(|_| coordinator.fetch(key.clone(), request.clone(), Default::default()));

    for result in join_all(handles).await {
        assert_eq!(result, Err(CacheError::InvalidResponse(404)));
    }
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_partial_cancellation() {
    let transport = ScriptedTransport::new(Step::ok("payload").delayed(Duration::from_millis(200)));
    let coordinator = setup_memory_coordinator(transport.clone(), |_| {});

    let (key, request) = request("data.json");
    let first = coordinator.fetch(key.clone(), request.clone(), Default::default());
    let second = coordinator.fetch(key, request, Default::default());
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(first.cancel());
    assert_eq!(first.await, Err(CacheError::Cancelled));

    assert_eq!(second.await.unwrap(), "payload");
    assert_eq!(transport.calls(), 1);
    assert_eq!(transport.aborted(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_full_cancellation_aborts_fetch() {
    let transport = ScriptedTransport::new(Step::ok("payload").delayed(Duration::from_millis(200)));
    let coordinator = setup_memory_coordinator(transport.clone(), |_| {});

    let (key, request) = request("data.json");
    let first = coordinator.fetch(key.clone(), request.clone(), Default::default());
    let second = coordinator.fetch(key.clone(), request.clone(), Default::default());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.calls(), 1);

    // the most recent caller is retracted first
    assert!(coordinator.cancel(&key));
    assert_eq!(second.await, Err(CacheError::Cancelled));
    assert_eq!(transport.aborted(), 0);

    drop(first);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.aborted(), 1);
    assert_eq!(coordinator.stats().inflight, 0);
    assert!(!coordinator.cancel(&key));

    // a new caller starts a new fetch
    let result = coordinator.fetch(key, request, Default::default());
    assert_eq!(result.await.unwrap(), "payload");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_no_cache_bypasses_caches() {
    let transport = ScriptedTransport::with_script([Step::ok("first")], Step::ok("second"));
    let coordinator = setup_memory_coordinator(transport.clone(), |_| {});

    let (key, request) = request("data.json");
    let result = coordinator.fetch(key.clone(), request.clone(), Default::default());
    assert_eq!(result.await.unwrap(), "first");

    let result = coordinator.fetch(key.clone(), request.clone(), FetchOptions::no_cache());
    assert_eq!(result.await.unwrap(), "second");
    assert_eq!(transport.calls(), 2);

    // the cached entry is unaffected by the uncached fetch
    let result = coordinator.fetch(key, request, Default::default());
    assert_eq!(result.await.unwrap(), "first");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_fetch_with_callback() {
    let transport = ScriptedTransport::new(Step::ok("payload").delayed(Duration::from_millis(50)));
    let coordinator = setup_memory_coordinator(transport.clone(), |_| {});

    let (key, request) = request("data.json");
    let (sender, receiver) = oneshot::channel();
    let _handle = coordinator.fetch_with_callback(
        key.clone(),
        request.clone(),
        Default::default(),
        |result| {
            sender.send(result).ok();
        },
    );
    assert_eq!(receiver.await.unwrap().unwrap(), "payload");

    // cancelling through the handle reports the cancellation to the callback
    coordinator.on_resource_pressure();
    let (sender, receiver) = oneshot::channel();
    let handle = coordinator.fetch_with_callback(key, request, Default::default(), |result| {
        sender.send(result).ok();
    });
    assert!(handle.cancel());
    assert_eq!(receiver.await.unwrap(), Err(CacheError::Cancelled));
}

#[tokio::test]
async fn test_clear() {
    let transport = ScriptedTransport::new(Step::ok("payload"));
    let (coordinator, cache_dir) = setup_coordinator(transport.clone(), |_| {});

    let (key, request) = request("data.json");
    coordinator
        .fetch(key.clone(), request.clone(), Default::default())
        .await
        .unwrap();

    let store = blob_store(cache_dir.path(), |_| {});
    assert!(store.path_for(&key).exists());

    coordinator.clear().await.unwrap();
    assert!(!store.path_for(&key).exists());
    assert_eq!(coordinator.stats().estimated_disk_bytes, 0);

    coordinator
        .fetch(key, request, Default::default())
        .await
        .unwrap();
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit() {
    let transport = ScriptedTransport::new(Step::ok("payload").delayed(Duration::from_secs(1)));
    let coordinator = setup_memory_coordinator(transport.clone(), |config| {
        config.fetch.max_concurrent_fetches = 2;
    });

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let (key, request) = request(&format!("file-{i}"));
            coordinator.fetch(key, request, Default::default())
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.calls(), 2);

    wait_for(|| transport.calls() == 4).await;
    for result in join_all(handles).await {
        assert_eq!(result.unwrap(), "payload");
    }
}
