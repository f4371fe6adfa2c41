use serde_json::json;
use sm_core::record::{ExecutionRecord, ExecutionStatus, Outcome};
use sm_core::sqlite_store::SqliteStore;
use sm_core::store::{ChangeQuery, PlanFrame, StateStore, StoreChange, StoreError};

fn record(run: &str, key: &str) -> ExecutionRecord {
    ExecutionRecord::new(run, format!("root/{key}:claude"), Some(key.into()), "claude")
}

#[tokio::test]
async fn kv_set_get_and_snapshot() {
    let db = SqliteStore::open_in_memory().await.unwrap();
    assert!(db.get("missing").await.unwrap().is_none());

    db.set("a", json!({"n": 1})).await.unwrap();
    db.set("b", json!("two")).await.unwrap();
    db.set("a", json!({"n": 2})).await.unwrap();

    assert_eq!(db.get("a").await.unwrap(), Some(json!({"n": 2})));
    let snap = db.snapshot().await.unwrap();
    assert_eq!(snap.len(), 2);
    assert_eq!(snap.get("b"), Some(&json!("two")));
}

#[tokio::test]
async fn record_roundtrip_keeps_every_field() {
    let db = SqliteStore::open_in_memory().await.unwrap();
    let mut rec = record("run-1", "a");
    db.insert_record(&rec).await.unwrap();

    rec.transition(ExecutionStatus::Running).unwrap();
    db.update_record(&rec).await.unwrap();

    rec.result = Some("done".into());
    rec.result_structured = Some(json!({"ok": true}));
    rec.usage.input_tokens = 120;
    rec.usage.output_tokens = 30;
    rec.outcome = Some(Outcome::Completed);
    rec.transition(ExecutionStatus::Completed).unwrap();
    db.update_record(&rec).await.unwrap();

    let fetched = db.get_record(&rec.id).await.unwrap().expect("record exists");
    assert_eq!(fetched, rec);
}

#[tokio::test]
async fn duplicate_insert_is_rejected() {
    let db = SqliteStore::open_in_memory().await.unwrap();
    let rec = record("run-1", "a");
    db.insert_record(&rec).await.unwrap();
    assert!(matches!(
        db.insert_record(&rec).await,
        Err(StoreError::DuplicateRecord(_))
    ));
}

#[tokio::test]
async fn status_never_moves_backwards() {
    let db = SqliteStore::open_in_memory().await.unwrap();
    let mut rec = record("run-1", "a");
    db.insert_record(&rec).await.unwrap();
    rec.transition(ExecutionStatus::Running).unwrap();
    rec.transition(ExecutionStatus::Completed).unwrap();

    // pending -> completed skips running
    assert!(matches!(
        db.update_record(&rec).await,
        Err(StoreError::Transition(_))
    ));
    let stored = db.get_record(&rec.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Pending);
}

#[tokio::test]
async fn update_of_unknown_record_fails() {
    let db = SqliteStore::open_in_memory().await.unwrap();
    let rec = record("run-1", "ghost");
    assert!(matches!(
        db.update_record(&rec).await,
        Err(StoreError::RecordNotFound(_))
    ));
}

#[tokio::test]
async fn records_are_scoped_by_run() {
    let db = SqliteStore::open_in_memory().await.unwrap();
    db.insert_record(&record("run-1", "a")).await.unwrap();
    db.insert_record(&record("run-1", "b")).await.unwrap();
    db.insert_record(&record("run-2", "c")).await.unwrap();

    let run1 = db.records_for_run("run-1").await.unwrap();
    assert_eq!(run1.len(), 2);
    assert!(run1.iter().all(|r| r.run_id == "run-1"));
}

#[tokio::test]
async fn frames_return_highest_sequence() {
    let db = SqliteStore::open_in_memory().await.unwrap();
    db.save_frame(&PlanFrame::new("r", 1, "<a />")).await.unwrap();
    db.save_frame(&PlanFrame::new("r", 3, "<c />")).await.unwrap();
    db.save_frame(&PlanFrame::new("r", 2, "<b />")).await.unwrap();
    let latest = db.latest_frame("r").await.unwrap().unwrap();
    assert_eq!(latest.sequence, 3);
    assert_eq!(latest.xml, "<c />");
}

#[tokio::test]
async fn writes_notify_subscribers() {
    let db = SqliteStore::open_in_memory().await.unwrap();
    let mut sub = db.subscribe(ChangeQuery::Records {
        run_id: "run-1".into(),
    });
    db.insert_record(&record("run-2", "x")).await.unwrap();
    let rec = record("run-1", "a");
    db.insert_record(&rec).await.unwrap();

    match sub.recv().await {
        Some(StoreChange::Record { id, status, .. }) => {
            assert_eq!(id, rec.id);
            assert_eq!(status, ExecutionStatus::Pending);
        }
        other => panic!("unexpected change: {other:?}"),
    }
}

#[tokio::test]
async fn file_backed_store_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    {
        let db = SqliteStore::open(&path).await.unwrap();
        db.set("k", json!(42)).await.unwrap();
    }
    let db = SqliteStore::open(&path).await.unwrap();
    assert_eq!(db.get("k").await.unwrap(), Some(json!(42)));
}
