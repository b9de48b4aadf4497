//! Lease expiry sweep: attempt-neutral requeue, lease.expired receipts, and
//! the sweep-vs-complete race resolved by compare-and-set.

mod common;

use common::*;

use asyncgate::models::{ReceiptType, TaskStatus};
use asyncgate::store::receipt_ledger::ReceiptFilters;
use asyncgate::LeaseSweeper;
use serde_json::json;

fn caps(caps: &[&str]) -> Vec<String> {
    caps.iter().map(|c| c.to_string()).collect()
}

#[tokio::test]
async fn worker_crash_requeues_without_consuming_attempt() {
    let db = TestDatabase::new().await;
    let engine = db.engine();
    let tenant = fresh_tenant();
    let owner = agent();

    let task = engine
        .create_task(tenant, &owner, echo_task(), None)
        .await
        .unwrap();
    let work = engine
        .lease_next(tenant, "w1", &caps(&["echo"]), 1, None)
        .await
        .unwrap();
    let lease = work[0].lease.clone();

    // Worker never calls back; its lease goes stale.
    db.force_expire_lease(tenant, lease.lease_id).await;

    let expired = engine.expire_leases(20).await.unwrap();
    assert_eq!(expired, 1);

    let task_after = engine.get_task(tenant, task.task_id).await.unwrap();
    assert_eq!(task_after.status, TaskStatus::Queued);
    assert_eq!(task_after.attempt, 1, "expiry must not consume an attempt");

    // One lease.expired receipt to the owner.
    let receipts = engine
        .list_receipts(
            tenant,
            &owner,
            &ReceiptFilters {
                receipt_type: Some(ReceiptType::LeaseExpired),
                task_id: Some(task.task_id),
            },
            None,
            None,
        )
        .await
        .unwrap()
        .receipts;
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].lease_id, Some(lease.lease_id));

    // lease.expired is not a discharge: task.assigned is still open.
    let open = engine
        .list_open_obligations(tenant, &owner, None, None)
        .await
        .unwrap();
    assert_eq!(open.open_obligations.len(), 1);
    assert_eq!(
        open.open_obligations[0].receipt_type,
        ReceiptType::TaskAssigned
    );
}

#[tokio::test]
async fn swept_task_is_claimable_again() {
    let db = TestDatabase::new().await;
    let engine = db.engine();
    let tenant = fresh_tenant();
    let owner = agent();

    let task = engine
        .create_task(tenant, &owner, echo_task(), None)
        .await
        .unwrap();
    let work = engine
        .lease_next(tenant, "w1", &caps(&["echo"]), 1, None)
        .await
        .unwrap();
    db.force_expire_lease(tenant, work[0].lease.lease_id).await;
    engine.expire_leases(20).await.unwrap();

    // The requeue jitter is at most a few seconds.
    db.make_task_eligible(tenant, task.task_id).await;

    let work = engine
        .lease_next(tenant, "w2", &caps(&["echo"]), 1, None)
        .await
        .unwrap();
    assert_eq!(work.len(), 1);
    assert_eq!(work[0].task.attempt, 1);
    assert_eq!(work[0].lease.renewal_count, 0, "fresh lease, fresh counters");
}

#[tokio::test]
async fn sweep_skips_terminal_tasks_but_cleans_their_leases() {
    let db = TestDatabase::new().await;
    let engine = db.engine();
    let tenant = fresh_tenant();
    let owner = agent();

    let task = engine
        .create_task(tenant, &owner, echo_task(), None)
        .await
        .unwrap();
    let work = engine
        .lease_next(tenant, "w1", &caps(&["echo"]), 1, None)
        .await
        .unwrap();
    let lease = work[0].lease.clone();

    // Simulate a crash after the terminal transition but before lease
    // cleanup: force the task terminal while its lease row lingers.
    sqlx::query(
        "UPDATE asyncgate_tasks SET status = 'canceled', result_outcome = 'canceled', completed_at = NOW() WHERE tenant_id = $1 AND task_id = $2",
    )
    .bind(tenant)
    .bind(task.task_id)
    .execute(db.pool())
    .await
    .unwrap();
    db.force_expire_lease(tenant, lease.lease_id).await;

    let expired = engine.expire_leases(20).await.unwrap();
    assert_eq!(expired, 0, "terminal tasks are not requeued");

    let task_after = engine.get_task(tenant, task.task_id).await.unwrap();
    assert_eq!(task_after.status, TaskStatus::Canceled);

    // The stale lease row was still removed.
    let remaining: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM asyncgate_leases WHERE tenant_id = $1 AND task_id = $2")
            .bind(tenant)
            .bind(task.task_id)
            .fetch_one(db.pool())
            .await
            .unwrap();
    assert_eq!(remaining.0, 0);
}

#[tokio::test]
async fn completion_after_sweep_loses_cleanly() {
    let db = TestDatabase::new().await;
    let engine = db.engine();
    let tenant = fresh_tenant();
    let owner = agent();

    let task = engine
        .create_task(tenant, &owner, echo_task(), None)
        .await
        .unwrap();
    let work = engine
        .lease_next(tenant, "w1", &caps(&["echo"]), 1, None)
        .await
        .unwrap();
    let lease = work[0].lease.clone();

    db.force_expire_lease(tenant, lease.lease_id).await;
    engine.expire_leases(20).await.unwrap();

    // The worker comes back from the dead with a result. It has lost
    // authority; exactly one of sweep/complete wins and it is the sweep.
    let err = engine
        .complete(
            tenant,
            "w1",
            task.task_id,
            lease.lease_id,
            json!({"late": true}),
            Some(json!([{"type": "mem", "key": "k"}])),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "LEASE_INVALID_OR_EXPIRED");

    let task_after = engine.get_task(tenant, task.task_id).await.unwrap();
    assert_eq!(task_after.status, TaskStatus::Queued);
}

#[tokio::test]
async fn sweep_batch_is_bounded() {
    let db = TestDatabase::new().await;
    let engine = db.engine();
    let tenant = fresh_tenant();
    let owner = agent();

    for _ in 0..5 {
        engine
            .create_task(tenant, &owner, echo_task(), None)
            .await
            .unwrap();
    }
    let work = engine
        .lease_next(tenant, "w1", &caps(&["echo"]), 5, None)
        .await
        .unwrap();
    for w in &work {
        db.force_expire_lease(tenant, w.lease.lease_id).await;
    }

    let first = engine.expire_leases(2).await.unwrap();
    assert_eq!(first, 2);
    let second = engine.expire_leases(10).await.unwrap();
    assert_eq!(second, 3);
}

#[tokio::test]
async fn sweeper_loop_runs_and_shuts_down() {
    let db = TestDatabase::new().await;
    let engine = db.engine();
    let tenant = fresh_tenant();
    let owner = agent();

    engine
        .create_task(tenant, &owner, echo_task(), None)
        .await
        .unwrap();
    let work = engine
        .lease_next(tenant, "w1", &caps(&["echo"]), 1, None)
        .await
        .unwrap();
    db.force_expire_lease(tenant, work[0].lease.lease_id).await;

    let sweeper = LeaseSweeper::new(engine.clone());
    sweeper.sweep_once().await;

    let task_after = engine
        .get_task(tenant, work[0].task.task_id)
        .await
        .unwrap();
    assert_eq!(task_after.status, TaskStatus::Queued);

    // Spawned loop shuts down on signal.
    let sweeper = LeaseSweeper::new(engine);
    let (handle, shutdown) = sweeper.spawn();
    shutdown.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("sweeper must stop promptly")
        .unwrap();
}
