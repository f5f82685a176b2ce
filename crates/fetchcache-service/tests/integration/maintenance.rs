use std::time::{Duration, SystemTime};

use bytes::Bytes;

use fetchcache_service::{CacheEntry, CacheKey};

use crate::{
    ScriptedTransport, Step, blob_store, coordinator_in, request, setup_coordinator, wait_for,
};

#[tokio::test]
async fn test_startup_removes_expired_files() {
    fetchcache_test::setup();
    let cache_dir = fetchcache_test::tempdir();
    let lifetime = |config: &mut fetchcache_service::config::Config| {
        config.caches.disk.entry_lifetime = Duration::from_secs(3600);
    };

    let store = blob_store(cache_dir.path(), lifetime);
    let stale = CacheKey::new("stale");
    let fresh = CacheKey::new("fresh");
    store
        .write(
            &stale,
            &CacheEntry {
                payload: Bytes::from_static(b"stale"),
                stored_at: SystemTime::now() - Duration::from_secs(7200),
            },
        )
        .unwrap();
    store
        .write(&fresh, &CacheEntry::fresh(Bytes::from_static(b"fresh")))
        .unwrap();

    let transport = ScriptedTransport::new(Step::ok("payload"));
    let _coordinator = coordinator_in(cache_dir.path(), transport, lifetime);

    wait_for(|| !store.path_for(&stale).exists()).await;
    assert!(store.path_for(&fresh).exists());
}

#[tokio::test]
async fn test_maintenance_evicts_oldest() {
    fetchcache_test::setup();
    let cache_dir = fetchcache_test::tempdir();
    let limit = |config: &mut fetchcache_service::config::Config| {
        config.caches.disk.size_limit = 10_000;
    };

    // 20 entries of about 1kB each, the oldest first
    let store = blob_store(cache_dir.path(), limit);
    let now = SystemTime::now();
    let keys: Vec<_> = (0..20).map(|i| CacheKey::new(format!("key-{i:02}"))).collect();
    for (i, key) in keys.iter().enumerate() {
        let entry = CacheEntry {
            payload: Bytes::from(vec![b'x'; 1000]),
            stored_at: now - Duration::from_secs(100 - i as u64),
        };
        store.write(key, &entry).unwrap();
    }

    let transport = ScriptedTransport::new(Step::ok("payload"));
    let coordinator = coordinator_in(cache_dir.path(), transport, limit);

    let stats = loop {
        if let Some(stats) = coordinator.run_maintenance().await {
            break stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let total = store.total_size().unwrap();
    assert!(total <= 8_000);
    assert_eq!(stats.retained_bytes, total);
    assert_eq!(coordinator.stats().estimated_disk_bytes, total);

    for (i, key) in keys.iter().enumerate() {
        assert_eq!(store.path_for(key).exists(), i >= 13, "key {i}");
    }
}

#[tokio::test]
async fn test_writes_trigger_maintenance() {
    let transport = ScriptedTransport::new(Step::ok(vec![b'x'; 1000]));
    let (coordinator, cache_dir) = setup_coordinator(transport.clone(), |config| {
        config.caches.disk.size_limit = 3_000;
    });

    // wait for the startup pass on the empty cache to finish
    while coordinator.run_maintenance().await.is_none() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // the third entry pushes the cache beyond its limit
    for i in 0..3 {
        let (key, request) = request(&format!("file-{i}"));
        coordinator
            .fetch(key, request, Default::default())
            .await
            .unwrap();
    }
    assert_eq!(transport.calls(), 3);

    let store = blob_store(cache_dir.path(), |_| {});
    wait_for(|| store.total_size().unwrap() <= 3_000).await;
    wait_for(|| coordinator.stats().estimated_disk_bytes <= 3_000).await;

    // evicted entries are still served from memory
    let (key, request) = request("file-0");
    coordinator
        .fetch(key, request, Default::default())
        .await
        .unwrap();
    assert_eq!(transport.calls(), 3);
}
