//! End-to-end crawler engine scenarios against in-memory storage.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use spinneret::{
    Configuration, CrawlError, Crawler, CrawlerOptions, MemoryStorage, Request, SessionPoolOptions,
    StorageClient,
};

fn test_configuration() -> Arc<Configuration> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(
        Configuration::default()
            .with_persist_storage(false)
            .with_purge_on_start(false),
    )
}

fn serial_options() -> CrawlerOptions {
    CrawlerOptions {
        min_concurrency: 1,
        max_concurrency: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_basic_fifo_crawl() {
    let storage: Arc<dyn StorageClient> = Arc::new(MemoryStorage::new());
    let crawler = Crawler::builder()
        .configuration(test_configuration())
        .storage(Arc::clone(&storage))
        .options(serial_options())
        .request_handler(|ctx| async move {
            ctx.push_data(vec![serde_json::json!(ctx.url())]).await?;
            Ok(())
        })
        .build()
        .await
        .expect("crawler builds");

    let requests = vec![
        Request::new("http://a/1").expect("valid request"),
        Request::new("http://a/2").expect("valid request"),
    ];
    let queue = crawler.request_queue();
    let stats = crawler.run(requests).await.expect("crawl succeeds");

    assert_eq!(stats.requests_finished, 2);
    assert_eq!(stats.requests_failed, 0);

    let items = crawler
        .dataset()
        .get_data(0, None)
        .await
        .expect("dataset readable");
    assert_eq!(
        items,
        vec![serde_json::json!("http://a/1"), serde_json::json!("http://a/2")]
    );

    let queue_stats = queue.stats().await.expect("queue stats");
    assert_eq!(queue_stats.handled_request_count, 2);
    assert_eq!(queue_stats.pending_request_count, 0);
}

#[tokio::test]
async fn test_forefront_request_overtakes_fifo() {
    let order: Arc<parking_lot::Mutex<Vec<String>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let handler_order = Arc::clone(&order);

    let crawler = Crawler::builder()
        .configuration(test_configuration())
        .storage(Arc::new(MemoryStorage::new()))
        .options(serial_options())
        .request_handler(move |ctx| {
            let order = Arc::clone(&handler_order);
            async move {
                order.lock().push(ctx.url());
                Ok(())
            }
        })
        .build()
        .await
        .expect("crawler builds");

    let queue = crawler.request_queue();
    queue
        .add_request(Request::new("http://a/1").expect("valid request"), false)
        .await
        .expect("add succeeds");
    queue
        .add_request(Request::new("http://a/2").expect("valid request"), true)
        .await
        .expect("add succeeds");

    crawler.run(Vec::new()).await.expect("crawl succeeds");

    let order = order.lock();
    assert_eq!(order[0], "http://a/2", "forefront request must run first");
    assert_eq!(order.len(), 2);
}

#[tokio::test]
async fn test_retry_then_fail_invokes_failed_handler_once() {
    let handler_calls = Arc::new(AtomicUsize::new(0));
    let failed_calls = Arc::new(AtomicUsize::new(0));
    let failed_request: Arc<parking_lot::Mutex<Option<Request>>> =
        Arc::new(parking_lot::Mutex::new(None));

    let task_calls = Arc::clone(&handler_calls);
    let observed_failed_calls = Arc::clone(&failed_calls);
    let observed_request = Arc::clone(&failed_request);

    let crawler = Crawler::builder()
        .configuration(test_configuration())
        .storage(Arc::new(MemoryStorage::new()))
        .options(CrawlerOptions {
            max_request_retries: 2,
            ..serial_options()
        })
        .request_handler(move |_ctx| {
            let calls = Arc::clone(&task_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CrawlError::Retryable(anyhow::anyhow!("boom")))
            }
        })
        .failed_request_handler(move |ctx, error| {
            let calls = Arc::clone(&observed_failed_calls);
            let slot = Arc::clone(&observed_request);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                assert!(error.to_string().contains("boom"));
                *slot.lock() = Some(ctx.request());
            }
        })
        .build()
        .await
        .expect("crawler builds");

    let stats = crawler
        .run(vec![Request::new("http://a/1").expect("valid request")])
        .await
        .expect("crawl finishes");

    assert_eq!(handler_calls.load(Ordering::SeqCst), 3, "1 attempt + 2 retries");
    assert_eq!(failed_calls.load(Ordering::SeqCst), 1);
    assert_eq!(stats.requests_failed, 1);
    assert_eq!(stats.requests_finished, 0);

    let request = failed_request.lock().clone().expect("failed request captured");
    assert_eq!(request.error_messages.len(), 3);
    assert_eq!(request.retry_count, 2);
}

#[tokio::test]
async fn test_session_error_rotates_to_a_fresh_session() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let session_ids: Arc<parking_lot::Mutex<Vec<String>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let first_session: Arc<parking_lot::Mutex<Option<Arc<spinneret::Session>>>> =
        Arc::new(parking_lot::Mutex::new(None));

    let task_attempts = Arc::clone(&attempts);
    let task_ids = Arc::clone(&session_ids);
    let task_first = Arc::clone(&first_session);

    let crawler = Crawler::builder()
        .configuration(test_configuration())
        .storage(Arc::new(MemoryStorage::new()))
        .options(CrawlerOptions {
            use_session_pool: true,
            session_pool_options: SessionPoolOptions {
                max_pool_size: 2,
                ..Default::default()
            },
            ..serial_options()
        })
        .request_handler(move |ctx| {
            let attempts = Arc::clone(&task_attempts);
            let ids = Arc::clone(&task_ids);
            let first = Arc::clone(&task_first);
            async move {
                let session = ctx.session.clone().expect("session pool is enabled");
                ids.lock().push(session.id().to_string());
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    *first.lock() = Some(session);
                    Err(CrawlError::session("blocked"))
                } else {
                    Ok(())
                }
            }
        })
        .build()
        .await
        .expect("crawler builds");

    let stats = crawler
        .run(vec![Request::new("http://a/1").expect("valid request")])
        .await
        .expect("crawl succeeds");

    assert_eq!(stats.requests_finished, 1);
    let ids = session_ids.lock();
    assert_eq!(ids.len(), 2, "one blocked attempt, one success");
    assert_ne!(ids[0], ids[1], "retry must use a different session");

    let first = first_session.lock().clone().expect("first session captured");
    assert!(first.error_score() >= 1.0);
    assert!(first.is_retired());
}

#[tokio::test]
async fn test_retry_request_error_ignores_retry_cap() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let final_retry_count = Arc::new(AtomicU32::new(u32::MAX));

    let task_attempts = Arc::clone(&attempts);
    let task_final = Arc::clone(&final_retry_count);

    let crawler = Crawler::builder()
        .configuration(test_configuration())
        .storage(Arc::new(MemoryStorage::new()))
        .options(CrawlerOptions {
            max_request_retries: 1,
            ..serial_options()
        })
        .request_handler(move |ctx| {
            let attempts = Arc::clone(&task_attempts);
            let final_count = Arc::clone(&task_final);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(CrawlError::retry_request("not ready yet"))
                } else {
                    final_count.store(ctx.request().retry_count, Ordering::SeqCst);
                    Ok(())
                }
            }
        })
        .build()
        .await
        .expect("crawler builds");

    let stats = crawler
        .run(vec![Request::new("http://a/1").expect("valid request")])
        .await
        .expect("crawl succeeds");

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(stats.requests_finished, 1);
    assert_eq!(
        final_retry_count.load(Ordering::SeqCst),
        0,
        "forced retries must not consume retry_count"
    );
}

#[tokio::test]
async fn test_duplicate_unique_keys_are_delivered_once() {
    let handler_calls = Arc::new(AtomicUsize::new(0));
    let task_calls = Arc::clone(&handler_calls);

    let crawler = Crawler::builder()
        .configuration(test_configuration())
        .storage(Arc::new(MemoryStorage::new()))
        .options(serial_options())
        .request_handler(move |_ctx| {
            let calls = Arc::clone(&task_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .await
        .expect("crawler builds");

    // same resource three times, with query/fragment noise
    let stats = crawler
        .run(vec![
            Request::new("http://a/page?x=1&y=2").expect("valid request"),
            Request::new("http://a/page?y=2&x=1").expect("valid request"),
            Request::new("http://a/page?x=1&y=2#frag").expect("valid request"),
        ])
        .await
        .expect("crawl succeeds");

    assert_eq!(handler_calls.load(Ordering::SeqCst), 1);
    assert_eq!(stats.requests_finished, 1);
}

#[tokio::test]
async fn test_empty_queue_exits_immediately() {
    let handler_calls = Arc::new(AtomicUsize::new(0));
    let task_calls = Arc::clone(&handler_calls);

    let crawler = Crawler::builder()
        .configuration(test_configuration())
        .storage(Arc::new(MemoryStorage::new()))
        .options(serial_options())
        .request_handler(move |_ctx| {
            let calls = Arc::clone(&task_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .await
        .expect("crawler builds");

    let stats = tokio::time::timeout(Duration::from_secs(10), crawler.run(Vec::new()))
        .await
        .expect("run returns promptly")
        .expect("crawl succeeds");

    assert_eq!(handler_calls.load(Ordering::SeqCst), 0);
    assert_eq!(stats.requests_finished, 0);
}

#[tokio::test]
async fn test_zero_max_requests_means_zero_handler_calls() {
    let handler_calls = Arc::new(AtomicUsize::new(0));
    let task_calls = Arc::clone(&handler_calls);

    let crawler = Crawler::builder()
        .configuration(test_configuration())
        .storage(Arc::new(MemoryStorage::new()))
        .options(CrawlerOptions {
            max_requests_per_crawl: Some(0),
            ..serial_options()
        })
        .request_handler(move |_ctx| {
            let calls = Arc::clone(&task_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .await
        .expect("crawler builds");

    crawler
        .run(vec![Request::new("http://a/1").expect("valid request")])
        .await
        .expect("crawl exits");
    assert_eq!(handler_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_zero_handler_timeout_fails_with_timeout_error() {
    let saw_timeout = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&saw_timeout);

    let crawler = Crawler::builder()
        .configuration(test_configuration())
        .storage(Arc::new(MemoryStorage::new()))
        .options(CrawlerOptions {
            request_handler_timeout: Duration::ZERO,
            max_request_retries: 0,
            ..serial_options()
        })
        .request_handler(|_ctx| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        })
        .failed_request_handler(move |_ctx, error| {
            let observed = Arc::clone(&observed);
            async move {
                if error.is_timeout() {
                    observed.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
        .build()
        .await
        .expect("crawler builds");

    let stats = crawler
        .run(vec![Request::new("http://a/1").expect("valid request")])
        .await
        .expect("crawl finishes");

    assert_eq!(stats.requests_failed, 1);
    assert_eq!(saw_timeout.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_critical_error_aborts_the_crawl() {
    let handler_calls = Arc::new(AtomicUsize::new(0));
    let task_calls = Arc::clone(&handler_calls);

    let crawler = Crawler::builder()
        .configuration(test_configuration())
        .storage(Arc::new(MemoryStorage::new()))
        .options(serial_options())
        .request_handler(move |_ctx| {
            let calls = Arc::clone(&task_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CrawlError::critical("configuration is broken"))
            }
        })
        .build()
        .await
        .expect("crawler builds");

    let stats = crawler
        .run(vec![
            Request::new("http://a/1").expect("valid request"),
            Request::new("http://a/2").expect("valid request"),
            Request::new("http://a/3").expect("valid request"),
        ])
        .await
        .expect("run returns after abort");

    // the first request fails terminally and the crawl stops draining
    assert_eq!(stats.requests_failed, 1);
    assert!(
        handler_calls.load(Ordering::SeqCst) < 3,
        "abort must prevent the remaining requests from running"
    );
}

#[tokio::test]
async fn test_error_handler_runs_before_each_retry() {
    let error_handler_calls = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&error_handler_calls);

    let attempts = Arc::new(AtomicUsize::new(0));
    let task_attempts = Arc::clone(&attempts);

    let crawler = Crawler::builder()
        .configuration(test_configuration())
        .storage(Arc::new(MemoryStorage::new()))
        .options(CrawlerOptions {
            max_request_retries: 3,
            ..serial_options()
        })
        .request_handler(move |_ctx| {
            let attempts = Arc::clone(&task_attempts);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CrawlError::Retryable(anyhow::anyhow!("flaky")))
                } else {
                    Ok(())
                }
            }
        })
        .error_handler(move |_ctx, _error| {
            let observed = Arc::clone(&observed);
            async move {
                observed.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build()
        .await
        .expect("crawler builds");

    let stats = crawler
        .run(vec![Request::new("http://a/1").expect("valid request")])
        .await
        .expect("crawl succeeds");

    assert_eq!(stats.requests_finished, 1);
    assert_eq!(error_handler_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_router_dispatches_by_label() {
    let detail_calls = Arc::new(AtomicUsize::new(0));
    let default_calls = Arc::new(AtomicUsize::new(0));

    let mut router = spinneret::Router::new();
    {
        let detail_calls = Arc::clone(&detail_calls);
        router.add_handler(
            "DETAIL",
            Arc::new(move |_ctx| {
                let calls = Arc::clone(&detail_calls);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
    }
    {
        let default_calls = Arc::clone(&default_calls);
        router.add_default_handler(Arc::new(move |_ctx| {
            let calls = Arc::clone(&default_calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));
    }

    let crawler = Crawler::builder()
        .configuration(test_configuration())
        .storage(Arc::new(MemoryStorage::new()))
        .options(serial_options())
        .router(router)
        .build()
        .await
        .expect("crawler builds");

    let stats = crawler
        .run(vec![
            Request::builder("http://a/detail")
                .label("DETAIL")
                .build()
                .expect("valid request"),
            Request::new("http://a/plain").expect("valid request"),
        ])
        .await
        .expect("crawl succeeds");

    assert_eq!(stats.requests_finished, 2);
    assert_eq!(detail_calls.load(Ordering::SeqCst), 1);
    assert_eq!(default_calls.load(Ordering::SeqCst), 1);
}
