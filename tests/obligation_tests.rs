//! Obligation query: termination correctness, pagination, and the permanent
//! unbucketed-output regression test.

mod common;

use common::*;

use asyncgate::models::{ReceiptType, TaskSpec};
use serde_json::json;

fn caps(caps: &[&str]) -> Vec<String> {
    caps.iter().map(|c| c.to_string()).collect()
}

#[tokio::test]
async fn open_means_no_legally_terminating_child() {
    let db = TestDatabase::new().await;
    let engine = db.engine();
    let tenant = fresh_tenant();
    let owner = agent();

    // Three obligations: one completed, one terminally failed, one untouched.
    let done = engine
        .create_task(tenant, &owner, echo_task(), None)
        .await
        .unwrap();
    let failed = engine
        .create_task(tenant, &owner, echo_task().with_max_attempts(1), None)
        .await
        .unwrap();
    let open_task = engine
        .create_task(tenant, &owner, echo_task(), None)
        .await
        .unwrap();

    let work = engine
        .lease_next(tenant, "w1", &caps(&["echo"]), 2, None)
        .await
        .unwrap();
    assert_eq!(work.len(), 2);
    for w in &work {
        if w.task.task_id == done.task_id {
            engine
                .complete(
                    tenant,
                    "w1",
                    w.task.task_id,
                    w.lease.lease_id,
                    json!({"ok": true}),
                    Some(json!([{"type": "mem", "key": "k"}])),
                    None,
                )
                .await
                .unwrap();
        } else {
            engine
                .fail(
                    tenant,
                    "w1",
                    w.task.task_id,
                    w.lease.lease_id,
                    json!({"kind": "fatal"}),
                    false,
                )
                .await
                .unwrap();
        }
    }
    let _ = failed;

    let open = engine
        .list_open_obligations(tenant, &owner, None, None)
        .await
        .unwrap();
    assert_eq!(open.open_obligations.len(), 1);
    assert_eq!(open.open_obligations[0].task_id, Some(open_task.task_id));
    assert_eq!(
        open.open_obligations[0].receipt_type,
        ReceiptType::TaskAssigned
    );
}

#[tokio::test]
async fn obligations_are_scoped_to_the_addressee() {
    let db = TestDatabase::new().await;
    let engine = db.engine();
    let tenant = fresh_tenant();
    let alice = agent();
    let bob = agent();

    engine
        .create_task(tenant, &alice, echo_task(), None)
        .await
        .unwrap();
    engine
        .create_task(tenant, &bob, echo_task(), None)
        .await
        .unwrap();

    let alice_open = engine
        .list_open_obligations(tenant, &alice, None, None)
        .await
        .unwrap();
    assert_eq!(alice_open.open_obligations.len(), 1);
    assert_eq!(alice_open.open_obligations[0].to, alice);

    let bob_open = engine
        .list_open_obligations(tenant, &bob, None, None)
        .await
        .unwrap();
    assert_eq!(bob_open.open_obligations.len(), 1);
    assert_eq!(bob_open.open_obligations[0].to, bob);
}

#[tokio::test]
async fn pagination_walks_the_backlog_in_order() {
    let db = TestDatabase::new().await;
    let engine = db.engine();
    let tenant = fresh_tenant();
    let owner = agent();

    for i in 0..5 {
        engine
            .create_task(tenant, &owner, TaskSpec::new("echo", json!({"n": i})), None)
            .await
            .unwrap();
    }

    let page1 = engine
        .list_open_obligations(tenant, &owner, None, Some(2))
        .await
        .unwrap();
    assert_eq!(page1.open_obligations.len(), 2);
    let cursor1 = page1.cursor.expect("more items remain");

    let page2 = engine
        .list_open_obligations(tenant, &owner, Some(cursor1), Some(2))
        .await
        .unwrap();
    assert_eq!(page2.open_obligations.len(), 2);
    let cursor2 = page2.cursor.expect("more items remain");

    let page3 = engine
        .list_open_obligations(tenant, &owner, Some(cursor2), Some(2))
        .await
        .unwrap();
    assert_eq!(page3.open_obligations.len(), 1);
    assert!(page3.cursor.is_none());

    // Ordered, no overlaps, no gaps.
    let mut seen = std::collections::HashSet::new();
    let mut last_created_at = None;
    for receipt in page1
        .open_obligations
        .iter()
        .chain(page2.open_obligations.iter())
        .chain(page3.open_obligations.iter())
    {
        assert!(seen.insert(receipt.receipt_id), "no duplicates across pages");
        if let Some(prev) = last_created_at {
            assert!(receipt.created_at >= prev, "ascending created_at");
        }
        last_created_at = Some(receipt.created_at);
    }
    assert_eq!(seen.len(), 5);
}

/// Permanent anti-regression test: the bootstrap output is a flat list plus
/// cursor, never a bucketed inbox shape.
#[tokio::test]
async fn bootstrap_output_shape_is_unbucketed() {
    let db = TestDatabase::new().await;
    let engine = db.engine();
    let tenant = fresh_tenant();
    let owner = agent();

    for _ in 0..3 {
        engine
            .create_task(tenant, &owner, echo_task(), None)
            .await
            .unwrap();
    }

    let page = engine
        .list_open_obligations(tenant, &owner, None, Some(2))
        .await
        .unwrap();
    let value = serde_json::to_value(&page).unwrap();
    let object = value.as_object().expect("response is an object");

    let keys: std::collections::BTreeSet<&str> =
        object.keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        ["open_obligations", "cursor"].into_iter().collect(),
        "exactly the documented fields"
    );
    assert!(value["open_obligations"].is_array());

    for forbidden in [
        "waiting_results",
        "assigned_tasks",
        "inbox",
        "inbox_receipts",
        "attention",
        "running_or_scheduled",
        "anomalies",
    ] {
        assert!(
            object.get(forbidden).is_none(),
            "bucketed field '{forbidden}' must never appear"
        );
    }

    // Exhausted backlog: the cursor key disappears rather than nulling.
    let all = engine
        .list_open_obligations(tenant, &owner, None, Some(50))
        .await
        .unwrap();
    let value = serde_json::to_value(&all).unwrap();
    let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["open_obligations"]);
}

#[tokio::test]
async fn empty_backlog_returns_empty_page() {
    let db = TestDatabase::new().await;
    let engine = db.engine();
    let tenant = fresh_tenant();
    let owner = agent();

    let page = engine
        .list_open_obligations(tenant, &owner, None, None)
        .await
        .unwrap();
    assert!(page.open_obligations.is_empty());
    assert!(page.cursor.is_none());
}

#[tokio::test]
async fn requeue_marker_closes_then_success_reaffirms() {
    let db = TestDatabase::new().await;
    let engine = db.engine();
    let tenant = fresh_tenant();
    let owner = agent();

    let task = engine
        .create_task(tenant, &owner, echo_task().with_max_attempts(3), None)
        .await
        .unwrap();
    let work = engine
        .lease_next(tenant, "w1", &caps(&["echo"]), 1, None)
        .await
        .unwrap();
    engine
        .fail(
            tenant,
            "w1",
            task.task_id,
            work[0].lease.lease_id,
            json!({"kind": "transient"}),
            true,
        )
        .await
        .unwrap();

    // The requeue marker is a terminator carrying requeued=true; agents
    // inspect the latest terminator to see the retry is still in flight.
    let assigned_id = {
        let receipts = engine
            .list_receipts(
                tenant,
                &owner,
                &asyncgate::store::receipt_ledger::ReceiptFilters {
                    receipt_type: Some(ReceiptType::TaskAssigned),
                    task_id: Some(task.task_id),
                },
                None,
                None,
            )
            .await
            .unwrap();
        receipts.receipts[0].receipt_id
    };
    let marker = engine
        .get_latest_terminator(tenant, assigned_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(marker.receipt_type, ReceiptType::TaskFailed);
    assert_eq!(marker.body["requeued"], json!(true));

    // Retry succeeds; the canonical terminator becomes the completion.
    db.make_task_eligible(tenant, task.task_id).await;
    let work = engine
        .lease_next(tenant, "w2", &caps(&["echo"]), 1, None)
        .await
        .unwrap();
    engine
        .complete(
            tenant,
            "w2",
            task.task_id,
            work[0].lease.lease_id,
            json!({"ok": true}),
            Some(json!([{"type": "mem", "key": "k"}])),
            None,
        )
        .await
        .unwrap();

    let latest = engine
        .get_latest_terminator(tenant, assigned_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.receipt_type, ReceiptType::TaskCompleted);
}
