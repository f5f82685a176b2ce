use std::sync::Arc;
use std::time::Duration;

use fetchcache_service::config::Config;
use fetchcache_service::{CacheError, FetchCoordinator, FetchRequest, HttpTransport};
use fetchcache_test as test;

use crate::setup_coordinator;

fn http_coordinator(update_config: impl FnOnce(&mut Config)) -> (FetchCoordinator, test::TempDir) {
    let mut config = Config::default();
    config.fetch.base_retry_delay = Duration::from_millis(10);
    update_config(&mut config);

    let transport = Arc::new(HttpTransport::new(&config.fetch).unwrap());
    setup_coordinator(transport, move |c| {
        c.fetch = config.fetch;
        c.caches = config.caches;
    })
}

#[tokio::test]
async fn test_http_fetch() {
    let (coordinator, _cache_dir) = http_coordinator(|_| {});
    let hitcounter = test::HitCounter::new();

    let request = FetchRequest::get(hitcounter.url("/ok/hello.txt"));
    let key = request.cache_key();

    let result = coordinator.fetch(key.clone(), request.clone(), Default::default());
    assert_eq!(result.await.unwrap(), "hello.txt");

    let result = coordinator.fetch(key, request, Default::default());
    assert_eq!(result.await.unwrap(), "hello.txt");

    assert_eq!(hitcounter.accesses(), 1);
}

#[tokio::test]
async fn test_http_deduplicated() {
    let (coordinator, _cache_dir) = http_coordinator(|_| {});
    let hitcounter = test::HitCounter::new();

    let request = FetchRequest::get(hitcounter.url("/delay/200ms/img"));
    let key = request.cache_key();

    let first = coordinator.fetch(key.clone(), request.clone(), Default::default());
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = coordinator.fetch(key, request, Default::default());

    assert_eq!(first.await.unwrap(), "img");
    assert_eq!(second.await.unwrap(), "img");
    assert_eq!(hitcounter.accesses(), 1);
}

#[tokio::test]
async fn test_http_flaky_server() {
    let (coordinator, _cache_dir) = http_coordinator(|_| {});
    let hitcounter = test::HitCounter::new();

    let request = FetchRequest::get(hitcounter.url("/flaky/2/data"));
    let key = request.cache_key();

    let result = coordinator.fetch(key, request, Default::default());
    assert_eq!(result.await.unwrap(), "data");
    assert_eq!(hitcounter.all_hits(), [("/flaky/2/data".to_owned(), 3)]);
}

#[tokio::test]
async fn test_http_server_errors_exhaust_attempts() {
    let (coordinator, _cache_dir) = http_coordinator(|_| {});
    let hitcounter = test::HitCounter::new();

    let request = FetchRequest::get(hitcounter.url("/respond_statuscode/500/data"));
    let key = request.cache_key();

    let error = coordinator
        .fetch(key, request, Default::default())
        .await
        .unwrap_err();
    insta::assert_snapshot!(
        error.to_string(),
        @"transient failure after 3 attempts: server responded with status 500"
    );
    assert_eq!(hitcounter.accesses(), 3);
}

#[tokio::test]
async fn test_http_not_found() {
    let (coordinator, _cache_dir) = http_coordinator(|_| {});
    let hitcounter = test::HitCounter::new();

    let request = FetchRequest::get(hitcounter.url("/respond_statuscode/404/data"));
    let key = request.cache_key();

    let result = coordinator.fetch(key, request, Default::default());
    assert_eq!(result.await, Err(CacheError::InvalidResponse(404)));
    assert_eq!(hitcounter.accesses(), 1);
}

#[tokio::test]
async fn test_http_timeout() {
    let (coordinator, _cache_dir) = http_coordinator(|config| {
        config.fetch.timeout = Duration::from_millis(100);
        config.fetch.max_retry_attempts = 2;
    });
    let hitcounter = test::HitCounter::new();

    let request = FetchRequest::get(hitcounter.url("/delay/1s/data"));
    let key = request.cache_key();

    let error = coordinator
        .fetch(key, request, Default::default())
        .await
        .unwrap_err();
    assert!(
        matches!(error, CacheError::TransientFailure { attempts: 2, .. }),
        "{error:?}"
    );
    assert_eq!(hitcounter.accesses(), 2);
}

#[tokio::test]
async fn test_http_connection_refused() {
    let (coordinator, _cache_dir) = http_coordinator(|config| {
        config.fetch.max_retry_attempts = 1;
    });

    // bind and immediately release a port, so that nothing listens on it
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let request = FetchRequest::get(format!("http://127.0.0.1:{port}/data").parse().unwrap());
    let key = request.cache_key();

    let error = coordinator
        .fetch(key, request, Default::default())
        .await
        .unwrap_err();
    assert!(
        matches!(error, CacheError::TransientFailure { attempts: 1, .. }),
        "{error:?}"
    );
}
