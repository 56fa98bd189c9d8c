//! Durability and ordering guarantees of the SQLite-backed Message Log.

use chrono::{DateTime, Utc};
use counsel_dialogue::{
    AppendOutcome, DialogueError, MessageLog, SafetyVerdict, Session, SessionStore,
    SqliteSessionStore, TurnDraft,
};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

async fn open_log(dir: &TempDir) -> (Arc<SqliteSessionStore>, MessageLog) {
    let store = Arc::new(SqliteSessionStore::open(&dir.path().join("sessions.db")).unwrap());
    (Arc::clone(&store), MessageLog::new(store))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_are_gap_free() {
    let dir = TempDir::new().unwrap();
    let (store, log) = open_log(&dir).await;
    store.create_session(&Session::new("s1", None, ts(0))).await.unwrap();

    let handles: Vec<_> = (0..64)
        .map(|i| {
            let log = log.clone();
            tokio::spawn(async move {
                let draft = TurnDraft::user(format!("turn {i}"), ts(i), SafetyVerdict::clear());
                log.append("s1", &draft).await.unwrap()
            })
        })
        .collect();

    let mut assigned = HashSet::new();
    for handle in handles {
        assert!(assigned.insert(handle.await.unwrap()), "sequence assigned twice");
    }
    assert_eq!(assigned, (1..=64).collect::<HashSet<u64>>());

    let turns = log.read("s1", None, None).await.unwrap();
    let sequences: Vec<u64> = turns.iter().map(|t| t.sequence).collect();
    assert_eq!(sequences, (1..=64).collect::<Vec<u64>>());

    let session = store.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.turn_count, 64);
}

#[tokio::test]
async fn read_with_limit_n_returns_all_n_in_order() {
    let dir = TempDir::new().unwrap();
    let (store, log) = open_log(&dir).await;
    store.create_session(&Session::new("s1", None, ts(0))).await.unwrap();

    let mut drafts = Vec::new();
    for i in 0..10 {
        let draft = if i % 2 == 0 {
            TurnDraft::user(format!("question {i}"), ts(i), SafetyVerdict::clear())
        } else {
            TurnDraft::assistant(format!("answer {i}"), ts(i), SafetyVerdict::sensitive("distress"), 200)
        };
        log.append("s1", &draft).await.unwrap();
        drafts.push(draft);
    }

    let turns = log.read("s1", Some(10), None).await.unwrap();
    assert_eq!(turns.len(), 10);
    for (idx, (turn, draft)) in turns.iter().zip(&drafts).enumerate() {
        assert_eq!(turn.sequence, idx as u64 + 1);
        assert_eq!(turn, &draft.clone().into_turn("s1", idx as u64 + 1));
    }
}

#[tokio::test]
async fn turns_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let (store, log) = open_log(&dir).await;
        store.create_session(&Session::new("s1", Some("u1".into()), ts(0))).await.unwrap();
        log.append("s1", &TurnDraft::user("before restart", ts(1), SafetyVerdict::clear()))
            .await
            .unwrap();
    }

    let (store, log) = open_log(&dir).await;
    let session = store.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.user_id.as_deref(), Some("u1"));
    assert_eq!(session.turn_count, 1);

    let seq = log
        .append("s1", &TurnDraft::user("after restart", ts(2), SafetyVerdict::clear()))
        .await
        .unwrap();
    assert_eq!(seq, 2);
}

#[tokio::test]
async fn retry_after_reopen_is_detected_by_sequence() {
    let dir = TempDir::new().unwrap();
    let draft = TurnDraft::user("did this get saved?", ts(1), SafetyVerdict::clear());
    {
        let (store, log) = open_log(&dir).await;
        store.create_session(&Session::new("s1", None, ts(0))).await.unwrap();
        assert_eq!(log.append_at("s1", 1, &draft).await.unwrap(), AppendOutcome::Appended(1));
    }

    // The caller never saw the acknowledgment and retries.
    let (_store, log) = open_log(&dir).await;
    assert_eq!(log.append_at("s1", 1, &draft).await.unwrap(), AppendOutcome::Duplicate(1));
    assert_eq!(log.read("s1", None, None).await.unwrap().len(), 1);

    let skipped = log.append_at("s1", 5, &draft).await.unwrap_err();
    assert!(matches!(skipped, DialogueError::SequenceConflict { expected: 2, got: 5, .. }));
}

#[tokio::test]
async fn delete_removes_turns_with_session() {
    let dir = TempDir::new().unwrap();
    let (store, log) = open_log(&dir).await;
    store.create_session(&Session::new("s1", None, ts(0))).await.unwrap();
    log.append("s1", &TurnDraft::user("hello", ts(1), SafetyVerdict::clear()))
        .await
        .unwrap();

    assert!(store.delete_session("s1").await.unwrap());
    store.create_session(&Session::new("s1", None, ts(5))).await.unwrap();
    assert!(log.read("s1", None, None).await.unwrap().is_empty());
}
