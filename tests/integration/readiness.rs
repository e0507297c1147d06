use indexer_harness::readiness::{ServiceState, ServiceStatus};
use indexer_harness::test_harness::{find_available_port, HarnessEnvironment, StaticServiceStack};
use indexer_harness::HarnessSession;
use std::sync::Arc;
use std::time::Duration;

use crate::integration::WORKER_BINARY;

// ============================================================================
// Session start-up
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_session_starts_against_ready_environment() {
    let _ = env_logger::try_init();
    let mut env = HarnessEnvironment::new().await.unwrap();
    let stack = Arc::new(StaticServiceStack::running(&["gateway", "postgres"]));

    let session = HarnessSession::start_with_stack(env.settings(WORKER_BINARY), stack.clone())
        .await
        .unwrap();

    assert_eq!(stack.bring_ups(), 1);
    assert_eq!(session.settings().gateway_url, env.gateway_url);

    session.teardown().await.unwrap();
    session.teardown().await.unwrap();
    assert_eq!(stack.tear_downs(), 1);

    env.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_waits_out_restarting_service() {
    let _ = env_logger::try_init();
    let mut env = HarnessEnvironment::new().await.unwrap();
    let stack = Arc::new(StaticServiceStack::default());
    stack.set_statuses(vec![
        ServiceStatus::new("gateway", ServiceState::Restarting),
        ServiceStatus::new("postgres", ServiceState::Running),
    ]);

    let settler = {
        let stack = stack.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            stack.set_statuses(vec![
                ServiceStatus::new("gateway", ServiceState::Running),
                ServiceStatus::new("postgres", ServiceState::Running),
            ]);
        })
    };

    let session = HarnessSession::start_with_stack(env.settings(WORKER_BINARY), stack.clone())
        .await
        .unwrap();
    settler.await.unwrap();

    session.teardown().await.unwrap();
    env.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_gateway_times_out_and_tears_down() {
    let _ = env_logger::try_init();
    let mut env = HarnessEnvironment::new().await.unwrap();
    let stack = Arc::new(StaticServiceStack::running(&["gateway", "postgres"]));

    let mut settings = env.settings(WORKER_BINARY);
    settings.gateway_url = format!("http://127.0.0.1:{}", find_available_port());
    settings.backoff.max_backoff_secs = 1.5;
    settings.backoff.attempt_timeout_secs = 0.5;

    let started = std::time::Instant::now();
    let error = match HarnessSession::start_with_stack(settings, stack.clone()).await {
        Ok(_) => panic!("session should not start without a gateway"),
        Err(error) => error,
    };

    assert!(error.is_timeout(), "{error}");
    assert!(error.to_string().contains("gateway"), "{error}");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(stack.tear_downs(), 1);

    env.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exited_service_fails_fast() {
    let _ = env_logger::try_init();
    let mut env = HarnessEnvironment::new().await.unwrap();
    let stack = Arc::new(StaticServiceStack::default());
    stack.set_statuses(vec![
        ServiceStatus::new("gateway", ServiceState::Exited),
        ServiceStatus::new("postgres", ServiceState::Running),
    ]);

    let started = std::time::Instant::now();
    let error = match HarnessSession::start_with_stack(env.settings(WORKER_BINARY), stack).await {
        Ok(_) => panic!("session should not start with an exited service"),
        Err(error) => error,
    };

    assert!(error.is_fatal(), "{error}");
    assert!(error.to_string().contains("gateway=exited"), "{error}");
    assert!(started.elapsed() < Duration::from_secs(5));

    env.shutdown().await.unwrap();
}
