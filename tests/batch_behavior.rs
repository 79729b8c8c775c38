//! Behavior tests for concurrent batch execution.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use meterguard_core::{BatchConfig, ConcurrentExecutor};
use meterguard_tests::*;
use tempfile::tempdir;

fn cp_request(cp_code: &str) -> HttpRequest {
    traffic_request("2024-01-01T00:00:00Z").with_query("cpcode", cp_code)
}

// =============================================================================
// Throughput and completeness
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_items_run_concurrently_wall_time_is_well_below_sequential() {
    // Given: nine services, each answered after one second
    let dir = tempdir().expect("tempdir");
    let http = ScriptedClient::slow(ok_json(r#"{"data": []}"#), Duration::from_secs(1));
    let client = client_with(http.clone(), test_config(dir.path()));
    let services = (1..=9).map(|n| format!("cp-{n}")).collect::<Vec<_>>();
    let started = tokio::time::Instant::now();

    // When: they are fetched as one batch on three workers
    let results = client
        .execute_batch(services.clone(), |cp_code, client| async move {
            client
                .call_with_resilience("traffic", cp_request(&cp_code), plain())
                .await
        })
        .await;

    // Then: every item has a result and the batch took about a third of the serial time
    assert_eq!(results.len(), services.len());
    assert_eq!(results.succeeded(), 9);
    assert_eq!(http.attempts(), 9);
    assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
}

#[tokio::test(start_paused = true)]
async fn when_one_item_fails_the_others_still_succeed() {
    let dir = tempdir().expect("tempdir");
    let http = ScriptedClient::always(ok_json(r#"{"data": [1]}"#));
    let client = client_with(http, test_config(dir.path()));

    let results = client
        .execute_batch(["cp-1", "cp-bad", "cp-3"], |cp_code, client| async move {
            if cp_code == "cp-bad" {
                return Err(ApiError::request(400, "unknown cp code"));
            }
            client
                .call_with_resilience("traffic", cp_request(cp_code), plain())
                .await
        })
        .await;

    assert_eq!(results.succeeded(), 2);
    assert_eq!(results.failed(), 1);
    let failure = results
        .get(&"cp-bad")
        .expect("present")
        .as_ref()
        .expect_err("failed");
    assert_eq!(failure.to_record()["success"], false);
    assert_eq!(failure.to_record()["code"], "api.request");
}

// =============================================================================
// Shared protection
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_the_endpoint_is_down_the_shared_breaker_stops_the_rest_of_the_batch() {
    // Given: an endpoint that is down and a single worker so items run in order
    let dir = tempdir().expect("tempdir");
    let http = ScriptedClient::always(status(502));
    let config = ResilienceConfig {
        max_workers: 1,
        ..test_config(dir.path())
    };
    let client = client_with(http.clone(), config);

    // When: five items go through the same endpoint
    let results = client
        .execute_batch(1..=5, |n, client| async move {
            client
                .call_with_resilience("traffic", cp_request(&n.to_string()), plain())
                .await
        })
        .await;

    // Then: three items exhaust their retries, the rest are rejected by the breaker
    assert_eq!(results.failed(), 5);
    let kinds = results
        .iter()
        .map(|(_, result)| match result {
            Err(BatchItemError::Api(error)) => error.kind(),
            other => panic!("unexpected {other:?}"),
        })
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            ApiErrorKind::Server,
            ApiErrorKind::Server,
            ApiErrorKind::Server,
            ApiErrorKind::CircuitOpen,
            ApiErrorKind::CircuitOpen,
        ]
    );
    assert_eq!(http.attempts(), 9);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn when_the_executor_is_shut_down_new_batches_fail_per_item() {
    let executor = ConcurrentExecutor::new(BatchConfig::default());
    executor.shutdown();

    let results = executor
        .execute_batch(["a", "b", "c"], (), |item, ()| async move { Ok::<_, ApiError>(item) })
        .await;

    assert_eq!(results.len(), 3);
    assert!(results
        .iter()
        .all(|(_, result)| matches!(result, Err(BatchItemError::Shutdown))));
}

#[tokio::test(start_paused = true)]
async fn when_the_executor_is_dropped_in_flight_items_are_aborted() {
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    {
        let executor = ConcurrentExecutor::new(BatchConfig {
            max_workers: 2,
            rate_limit_delay: Duration::from_millis(10),
            item_timeout: Duration::from_secs(600),
        });
        let batch = executor.execute_batch(
            0..4_u32,
            (Arc::clone(&started), Arc::clone(&finished)),
            |item, (started, finished)| async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(300)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ApiError>(item)
            },
        );
        let _ = tokio::time::timeout(Duration::from_secs(1), batch).await;
    }

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}
