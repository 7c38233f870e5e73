//! State machine behaviour under paused tokio time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use circuit_breaker::{
    BreakerConfig, BreakerError, BreakerRegistry, CallError, CircuitBreaker, CircuitState,
};
use tokio::sync::oneshot;

const TARGET: &str = "payment-gateway";

fn gateway_config() -> BreakerConfig {
    BreakerConfig::new(3, Duration::from_secs(30), Duration::from_secs(2)).unwrap()
}

async fn hanging_call(breaker: &CircuitBreaker) -> BreakerError {
    breaker
        .call(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, CallError>(())
        })
        .await
        .unwrap_err()
}

#[tokio::test(start_paused = true)]
async fn three_timeouts_open_then_probe_closes() {
    let breaker = CircuitBreaker::new("orders", TARGET, gateway_config());

    for _ in 0..3 {
        let err = hanging_call(&breaker).await;
        assert!(matches!(err, BreakerError::Timeout { .. }));
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.consecutive_failures(), 3);

    // t+10s: still open, the target is not invoked
    tokio::time::advance(Duration::from_secs(10)).await;
    let counter = AtomicUsize::new(0);
    let invoked = &counter;
    let err = breaker
        .call(move || async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, CallError>(())
        })
        .await
        .unwrap_err();
    assert!(err.is_open());
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    // t+31s: the next call is the probe
    tokio::time::advance(Duration::from_secs(21)).await;
    breaker
        .call(move || async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, CallError>(())
        })
        .await
        .unwrap();
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens_and_restarts_recovery_timer() {
    let breaker = CircuitBreaker::new("orders", TARGET, gateway_config());
    for _ in 0..3 {
        hanging_call(&breaker).await;
    }

    tokio::time::advance(Duration::from_secs(31)).await;
    let err = breaker
        .call(|| async { Err::<(), _>(CallError::Transient("503".into())) })
        .await
        .unwrap_err();
    assert!(matches!(err, BreakerError::Transient { .. }));
    assert_eq!(breaker.state(), CircuitState::Open);

    // The recovery timeout counts from the failed probe
    tokio::time::advance(Duration::from_secs(20)).await;
    let err = breaker
        .call(|| async { Ok::<_, CallError>(()) })
        .await
        .unwrap_err();
    assert!(err.is_open());

    tokio::time::advance(Duration::from_secs(11)).await;
    breaker.call(|| async { Ok::<_, CallError>(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn only_one_probe_at_a_time() {
    let breaker = Arc::new(CircuitBreaker::new("orders", TARGET, gateway_config()));
    for _ in 0..3 {
        hanging_call(&breaker).await;
    }
    tokio::time::advance(Duration::from_secs(31)).await;

    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let probe = tokio::spawn({
        let breaker = Arc::clone(&breaker);
        async move {
            breaker
                .call(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, CallError>("probed")
                })
                .await
        }
    });

    started_rx.await.unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert!(breaker.snapshot().probe_in_flight);

    let err = breaker
        .call(|| async { Ok::<_, CallError>("second") })
        .await
        .unwrap_err();
    assert!(err.is_open());

    release_tx.send(()).unwrap();
    assert_eq!(probe.await.unwrap().unwrap(), "probed");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn permanent_probe_result_closes_circuit() {
    let breaker = CircuitBreaker::new("orders", TARGET, gateway_config());
    for _ in 0..3 {
        hanging_call(&breaker).await;
    }
    tokio::time::advance(Duration::from_secs(31)).await;

    let err = breaker
        .call(|| async { Err::<(), _>(CallError::Permanent("invalid card".into())) })
        .await
        .unwrap_err();
    assert!(matches!(err, BreakerError::Permanent { .. }));
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn permanent_errors_never_trip() {
    let breaker = CircuitBreaker::new("orders", TARGET, gateway_config());
    for _ in 0..10 {
        let err = breaker
            .call(|| async { Err::<(), _>(CallError::Permanent("400 bad request".into())) })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn registry_timeout_override_applies_per_call() {
    let registry = BreakerRegistry::new("orders").with_target(TARGET, gateway_config());

    let err = registry
        .invoke_with_timeout(TARGET, Duration::from_millis(50), || async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, CallError>(())
        })
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BreakerError::Timeout {
            target: TARGET.into(),
            timeout: Duration::from_millis(50),
        }
    );

    // Same call fits inside the configured two seconds
    registry
        .invoke(TARGET, || async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, CallError>(())
        })
        .await
        .unwrap();

    let snapshot = &registry.snapshots()[0];
    assert_eq!(snapshot.caller, "orders");
    assert_eq!(snapshot.consecutive_failures, 0);
    assert!(snapshot.last_failure_at.is_some());
}
