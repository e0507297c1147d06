use indexer_harness::test_harness::{event, HarnessEnvironment, StaticServiceStack};
use indexer_harness::worker::{RunIdentity, WorkerOptions, CHECKPOINT_ONLY, STORE_EVENTS};
use indexer_harness::{BackoffPolicy, HarnessError, HarnessSession};
use std::sync::Arc;
use std::time::Duration;

use crate::integration::{transfer_filter, TOKEN_ADDRESS, WORKER_BINARY};

fn fixed_run(id: &str) -> WorkerOptions {
    WorkerOptions {
        run_id: Some(RunIdentity::new(id)),
        ..WorkerOptions::default()
    }
}

// ============================================================================
// Indexing scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_indexes_to_block_42() {
    let _ = env_logger::try_init();
    let mut env = HarnessEnvironment::new().await.unwrap();

    env.gateway.emit_empty_blocks(41);
    let head = env.gateway.emit_block(vec![
        event("0xaa", TOKEN_ADDRESS, "Transfer", &["0x1", "0x2", "0x2a"]),
        event("0xab", TOKEN_ADDRESS, "Approval", &["0x1"]),
        event("0xac", "0xdead", "Transfer", &["0x3"]),
    ]);
    assert_eq!(head, 42);

    let worker = env
        .supervisor(WORKER_BINARY)
        .start("end_to_end::block_42", &transfer_filter(), STORE_EVENTS, fixed_run("t1"))
        .unwrap();
    let waiter = env.checkpoint_waiter();

    let observed = waiter
        .wait_until_indexed("t1", 42, &env.indexer_policy())
        .await
        .unwrap();
    assert_eq!(observed, 42);

    let single = BackoffPolicy::constant(Duration::from_millis(100), Duration::from_secs(5))
        .with_max_attempts(1);
    match waiter.wait_until_indexed("t1", 43, &single).await {
        Err(HarnessError::Timeout {
            last_observed,
            attempts,
            ..
        }) => {
            assert!(last_observed.contains("indexed_to=42"), "{last_observed}");
            assert_eq!(attempts, 1);
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    let events = env.store.list_events("t1").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].block_number, 42);
    assert_eq!(events[0].transaction_hash, "0xaa");
    assert_eq!(events[0].data, vec!["0x1", "0x2", "0x2a"]);

    worker.terminate().await.unwrap();
    env.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_follows_blocks_emitted_while_running() {
    let _ = env_logger::try_init();
    let mut env = HarnessEnvironment::new().await.unwrap();
    let worker = env
        .supervisor(WORKER_BINARY)
        .start("end_to_end::live", &transfer_filter(), STORE_EVENTS, WorkerOptions::default())
        .unwrap();
    let run_id = worker.run_id().to_string();
    let waiter = env.checkpoint_waiter();

    waiter
        .wait_until_indexed(&run_id, 0, &env.indexer_policy())
        .await
        .unwrap();

    for n in 0..3 {
        let hash = format!("0x{n:02x}");
        let block = env
            .gateway
            .emit_block(vec![event(&hash, TOKEN_ADDRESS, "Transfer", &["0x1"])]);
        waiter
            .wait_until_indexed(&run_id, block, &env.indexer_policy())
            .await
            .unwrap();
    }

    let events = env.store.list_events(&run_id).await.unwrap();
    let blocks: Vec<u64> = events.iter().map(|event| event.block_number).collect();
    assert_eq!(blocks, vec![1, 2, 3]);

    worker.terminate().await.unwrap();
    env.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_checkpoint_only_handler_stores_no_events() {
    let _ = env_logger::try_init();
    let mut env = HarnessEnvironment::new().await.unwrap();
    let head = env
        .gateway
        .emit_block(vec![event("0x01", TOKEN_ADDRESS, "Transfer", &[])]);

    let worker = env
        .supervisor(WORKER_BINARY)
        .start("end_to_end::checkpoint_only", &[], CHECKPOINT_ONLY, fixed_run("t2"))
        .unwrap();

    env.checkpoint_waiter()
        .wait_until_indexed("t2", head, &env.indexer_policy())
        .await
        .unwrap();
    assert!(env.store.list_events("t2").await.unwrap().is_empty());

    worker.terminate().await.unwrap();
    env.shutdown().await.unwrap();
}

// ============================================================================
// Gateway disruptions
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_reconnects_after_rejected_streams() {
    let _ = env_logger::try_init();
    let mut env = HarnessEnvironment::new().await.unwrap();
    let head = env.gateway.emit_empty_blocks(5);
    env.gateway.fail_next_streams(2);

    let worker = env
        .supervisor(WORKER_BINARY)
        .start("end_to_end::reconnect", &[], STORE_EVENTS, fixed_run("t3"))
        .unwrap();

    env.checkpoint_waiter()
        .wait_until_indexed("t3", head, &env.indexer_policy())
        .await
        .unwrap();

    let requests = env.gateway.stream_requests();
    assert!(requests.len() >= 3, "{} stream requests", requests.len());
    assert!(requests.iter().all(|request| request.indexer_id == "t3"));

    worker.terminate().await.unwrap();
    env.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restarted_worker_resumes_after_checkpoint() {
    let _ = env_logger::try_init();
    let mut env = HarnessEnvironment::new().await.unwrap();
    let supervisor = env.supervisor(WORKER_BINARY);
    let first_head = env.gateway.emit_empty_blocks(4);

    let first = supervisor
        .start("end_to_end::resume", &[], STORE_EVENTS, fixed_run("t4"))
        .unwrap();
    env.checkpoint_waiter()
        .wait_until_indexed("t4", first_head, &env.indexer_policy())
        .await
        .unwrap();
    first.terminate().await.unwrap();

    let second_head = env.gateway.emit_empty_blocks(3);
    let options = WorkerOptions {
        reset_state: false,
        ..fixed_run("t4")
    };
    let second = supervisor
        .start("end_to_end::resume", &[], STORE_EVENTS, options)
        .unwrap();
    env.checkpoint_waiter()
        .wait_until_indexed("t4", second_head, &env.indexer_policy())
        .await
        .unwrap();

    let last_request = env.gateway.stream_requests().pop().unwrap();
    assert_eq!(last_request.starting_block, first_head + 1);

    second.terminate().await.unwrap();
    env.shutdown().await.unwrap();
}

// ============================================================================
// Full session
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_session_drives_worker_to_target() {
    let _ = env_logger::try_init();
    let mut env = HarnessEnvironment::new().await.unwrap();
    let stack = Arc::new(StaticServiceStack::running(&["gateway", "postgres"]));
    let session = HarnessSession::start_with_stack(env.settings(WORKER_BINARY), stack.clone())
        .await
        .unwrap();

    let head = env
        .gateway
        .emit_block(vec![event("0x01", TOKEN_ADDRESS, "Transfer", &["0x7"])]);
    let worker = session
        .supervisor()
        .start(
            "end_to_end::session",
            &transfer_filter(),
            STORE_EVENTS,
            WorkerOptions::default(),
        )
        .unwrap();

    let observed = session
        .wait_until_indexed(worker.run_id().as_str(), head)
        .await
        .unwrap();
    assert!(observed >= head);

    let events = session
        .store()
        .list_events(worker.run_id().as_str())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, "Transfer");

    worker.terminate().await.unwrap();
    session.teardown().await.unwrap();
    assert_eq!(stack.tear_downs(), 1);
    env.shutdown().await.unwrap();
}
