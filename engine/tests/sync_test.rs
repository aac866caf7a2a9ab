//! End-to-end sync runs against a scripted remote.

mod common;

use common::*;
use serde_json::{json, Value};
use soupsync_engine::target::down::SoqlTarget;
use soupsync_engine::target::up::RestTarget;
use soupsync_engine::target::{is_dirty, mark_dirty, LAST_ERROR};
use soupsync_engine::{
    soql, Error, MergeMode, QuerySpec, RestError, RestMethod, SyncCallback, SyncDownTarget,
    SyncOptions, SyncState, SyncStatus, SyncUpTarget,
};
use std::sync::Arc;

const ACCOUNTS_QUERY: &str = "SELECT Id, Name, LastModifiedDate FROM Account";

fn soql_down() -> SyncDownTarget {
    SyncDownTarget::Soql(SoqlTarget::new(ACCOUNTS_QUERY))
}

fn three_accounts() -> Value {
    records(vec![
        account("001A", "Acme", "2024-01-01T00:00:00.000+0000"),
        account("001B", "Globex", "2024-01-02T00:00:00.000+0000"),
        account("001C", "Initech", "2024-01-03T00:00:00.000+0000"),
    ])
}

fn stored(store: &soupsync_engine::SoupStore) -> Vec<Value> {
    store
        .query_all(&QuerySpec::all(ACCOUNTS, 100))
        .unwrap()
}

// ============================================================================
// Sync down
// ============================================================================

#[tokio::test]
async fn sync_down_saves_clean_records() {
    let (store, rest, manager) = setup();
    rest.on_query("FROM Account", three_accounts());

    let sync = manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, Some("accountsDown"))
        .unwrap();
    let state = manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();

    assert_eq!(state.status, SyncStatus::Done);
    assert_eq!(state.progress, 100);
    assert_eq!(state.total_size, 3);
    assert_eq!(
        state.max_time_stamp,
        soql::from_iso("2024-01-03T00:00:00.000+0000").unwrap()
    );
    assert_eq!(local_ids(&store), vec!["001A", "001B", "001C"]);
    for doc in stored(&store) {
        assert!(!is_dirty(&doc));
        assert_eq!(doc["__sync_id__"], json!(sync.id));
    }

    let persisted = manager.get_sync_status(sync.id).unwrap().unwrap();
    assert_eq!(persisted, state);
}

#[tokio::test]
async fn resync_only_asks_for_newer_records() {
    let (store, rest, manager) = setup();
    rest.on_query("FROM Account", three_accounts());
    rest.on_query("LastModifiedDate >", records(vec![]));

    let sync = manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, Some("accountsDown"))
        .unwrap();
    manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();
    let before = stored(&store);

    let state = manager
        .re_sync_by_name("accountsDown", None)
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, SyncStatus::Done);

    let queries = rest.queries();
    assert_eq!(queries.len(), 2);
    assert!(!queries[0].contains("WHERE"));
    assert!(queries[1].contains("WHERE LastModifiedDate > 2024-01-03T00:00:00.000Z"));
    assert_eq!(stored(&store), before);
}

/// Store contents that a rewrite of identical records must not change.
fn contents(store: &soupsync_engine::SoupStore) -> Vec<Value> {
    stored(store)
        .into_iter()
        .map(|mut doc| {
            if let Some(map) = doc.as_object_mut() {
                map.remove("_soupLastModifiedDate");
            }
            doc
        })
        .collect()
}

#[tokio::test]
async fn repeated_sync_down_of_unchanged_remote_is_idempotent() {
    let (store, rest, manager) = setup();
    // The remote hands back the same records whatever the filter
    rest.on_query("FROM Account", three_accounts());

    let sync = manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, None)
        .unwrap();
    let first = manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();
    let after_first = contents(&store);

    let second = manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();

    assert_eq!(second.status, SyncStatus::Done);
    assert_eq!(second.max_time_stamp, first.max_time_stamp);
    assert_eq!(contents(&store), after_first);
    assert_eq!(after_first.len(), 3);
}

#[tokio::test]
async fn sync_down_follows_next_records_url() {
    let (store, rest, manager) = setup();
    rest.on_query(
        "FROM Account",
        json!({
            "totalSize": 4,
            "done": false,
            "nextRecordsUrl": "/services/data/v62.0/query/01g-2",
            "records": [
                account("001A", "Acme", "2024-01-01T00:00:00.000+0000"),
                account("001B", "Globex", "2024-01-02T00:00:00.000+0000"),
            ],
        }),
    );
    rest.on_path(
        RestMethod::Get,
        "/services/data/v62.0/query/01g-2",
        records(vec![
            account("001C", "Initech", "2024-01-03T00:00:00.000+0000"),
            account("001D", "Umbrella", "2024-01-04T00:00:00.000+0000"),
        ]),
    );

    let progress = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = progress.clone();
    let callback: SyncCallback = Arc::new(move |state: &SyncState| {
        seen.lock().push((state.status, state.progress));
    });

    let sync = manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, None)
        .unwrap();
    let state = manager
        .run_sync(sync.id, Some(callback))
        .unwrap()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(state.status, SyncStatus::Done);
    assert_eq!(local_ids(&store).len(), 4);
    assert_eq!(
        *progress.lock(),
        vec![
            (SyncStatus::Running, 0),
            (SyncStatus::Running, 50),
            (SyncStatus::Running, 99),
            (SyncStatus::Done, 100),
        ]
    );
}

#[tokio::test]
async fn leave_if_changed_keeps_dirty_local_copy() {
    let (store, rest, manager) = setup();
    let mut local = account("001B", "Globex (edited)", "2024-01-01T00:00:00.000+0000");
    mark_dirty(&mut local, false, true, false);
    store.upsert_entry(ACCOUNTS, local, Some("Id")).unwrap();
    rest.on_query("FROM Account", three_accounts());

    let sync = manager
        .create_sync_down(
            soql_down(),
            SyncOptions::new(MergeMode::LeaveIfChanged),
            ACCOUNTS,
            None,
        )
        .unwrap();
    manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();

    let globex = store
        .query_all(&QuerySpec::exact(ACCOUNTS, "Id", "001B", 1))
        .unwrap();
    assert_eq!(globex.len(), 1);
    assert_eq!(globex[0]["Name"], json!("Globex (edited)"));
    assert!(is_dirty(&globex[0]));
    assert_eq!(local_ids(&store), vec!["001A", "001B", "001C"]);
}

#[tokio::test]
async fn overwrite_replaces_dirty_local_copy() {
    let (store, rest, manager) = setup();
    let mut local = account("001B", "Globex (edited)", "2024-01-01T00:00:00.000+0000");
    mark_dirty(&mut local, false, true, false);
    store.upsert_entry(ACCOUNTS, local, Some("Id")).unwrap();
    rest.on_query("FROM Account", three_accounts());

    let sync = manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, None)
        .unwrap();
    manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();

    let globex = store
        .query_all(&QuerySpec::exact(ACCOUNTS, "Id", "001B", 1))
        .unwrap();
    assert_eq!(globex[0]["Name"], json!("Globex"));
    assert!(!is_dirty(&globex[0]));
}

#[tokio::test]
async fn remote_failure_marks_sync_failed() {
    let (store, rest, manager) = setup();
    rest.fail_query(
        "FROM Account",
        RestError::Status {
            status: 500,
            body: "boom".into(),
        },
    );

    let sync = manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, None)
        .unwrap();
    let state = manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();

    assert_eq!(state.status, SyncStatus::Failed);
    assert!(state.error.unwrap().contains("boom"));
    assert!(local_ids(&store).is_empty());
    assert!(!manager.is_running(sync.id));
}

// ============================================================================
// Ghosts
// ============================================================================

#[tokio::test]
async fn clean_resync_ghosts_removes_records_gone_remotely() {
    let (store, rest, manager) = setup();
    rest.on_query("FROM Account", three_accounts());

    let sync = manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, None)
        .unwrap();
    manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();

    let mut draft = json!({"Name": "Draft"});
    mark_dirty(&mut draft, true, false, false);
    store.upsert_entry(ACCOUNTS, draft, None).unwrap();

    rest.on_query(
        "SELECT Id FROM Account",
        records(vec![json!({"Id": "001A"}), json!({"Id": "001C"})]),
    );
    let removed = manager.clean_resync_ghosts(sync.id).await.unwrap();

    assert_eq!(removed, 1);
    assert_eq!(local_ids(&store), vec!["001A", "001C"]);
    assert_eq!(stored(&store).len(), 3);
}

#[tokio::test]
async fn clean_ghosts_option_runs_after_sync_down() {
    let (store, rest, manager) = setup();
    store
        .upsert_entry(
            ACCOUNTS,
            account("001Z", "Gone", "2023-01-01T00:00:00.000+0000"),
            Some("Id"),
        )
        .unwrap();
    rest.on_query("FROM Account", three_accounts());

    // Records written outside any sync only match when the sync id is not indexed
    let sync = manager
        .create_sync_down(
            soql_down(),
            SyncOptions::default().with_clean_ghosts(true),
            ACCOUNTS,
            None,
        )
        .unwrap();
    manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();

    assert_eq!(local_ids(&store), vec!["001A", "001B", "001C", "001Z"]);
    assert!(rest
        .queries()
        .iter()
        .any(|q| q.starts_with("SELECT Id FROM Account")));
}

#[tokio::test]
async fn clean_ghosts_rejects_sync_up() {
    let (_store, _rest, manager) = setup();
    let sync = manager
        .create_sync_up(SyncUpTarget::default(), SyncOptions::default(), ACCOUNTS, None)
        .unwrap();
    let err = manager.clean_resync_ghosts(sync.id).await.unwrap_err();
    assert!(matches!(err, Error::NotASyncDown(id) if id == sync.id));
}

// ============================================================================
// Sync up
// ============================================================================

#[tokio::test]
async fn sync_up_pushes_create_update_and_delete() {
    let (store, rest, manager) = setup();

    let mut created = json!({"Name": "New Co"});
    mark_dirty(&mut created, true, false, false);
    let mut updated = account("001B", "Globex 2", "2024-01-02T00:00:00.000+0000");
    mark_dirty(&mut updated, false, true, false);
    let mut deleted = account("001C", "Initech", "2024-01-03T00:00:00.000+0000");
    mark_dirty(&mut deleted, false, false, true);
    let mut draft = json!({"Name": "Never sent"});
    mark_dirty(&mut draft, true, false, true);
    store
        .upsert_entries(ACCOUNTS, vec![created, updated, deleted, draft], None)
        .unwrap();

    rest.on_path(
        RestMethod::Post,
        ACCOUNT_PATH,
        json!({"id": "001NEW", "success": true}),
    );
    rest.on_path(RestMethod::Patch, ACCOUNT_PATH, Value::Null);
    rest.on_path(RestMethod::Delete, ACCOUNT_PATH, Value::Null);

    let sync = manager
        .create_sync_up(
            SyncUpTarget::Rest(RestTarget::new("Account")),
            SyncOptions::default(),
            ACCOUNTS,
            None,
        )
        .unwrap();
    let state = manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();

    assert_eq!(state.status, SyncStatus::Done);
    assert_eq!(state.error, None);
    assert_eq!(state.total_size, 4);

    let posts: Vec<_> = rest
        .requests()
        .into_iter()
        .filter(|r| r.method == RestMethod::Post)
        .collect();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].body, Some(json!({"Name": "New Co"})));
    assert_eq!(rest.count(RestMethod::Patch, &format!("{}/001B", ACCOUNT_PATH)), 1);
    assert_eq!(rest.count(RestMethod::Delete, &format!("{}/001C", ACCOUNT_PATH)), 1);

    let docs = stored(&store);
    assert_eq!(docs.len(), 2);
    assert!(docs.iter().all(|d| !is_dirty(d)));
    assert_eq!(local_ids(&store), vec!["001B", "001NEW"]);
}

#[tokio::test]
async fn sync_up_leave_if_changed_skips_records_newer_remotely() {
    let (store, rest, manager) = setup();
    let mut stale = account("001A", "Acme local", "2024-01-01T00:00:00.000+0000");
    mark_dirty(&mut stale, false, true, false);
    let mut fresh = account("001B", "Globex local", "2024-03-01T00:00:00.000+0000");
    mark_dirty(&mut fresh, false, true, false);
    store.upsert_entries(ACCOUNTS, vec![stale, fresh], None).unwrap();

    rest.on_query(
        "WHERE Id IN",
        records(vec![
            account("001A", "Acme", "2024-02-01T00:00:00.000+0000"),
            account("001B", "Globex", "2024-02-01T00:00:00.000+0000"),
        ]),
    );
    rest.on_path(RestMethod::Patch, ACCOUNT_PATH, Value::Null);

    let sync = manager
        .create_sync_up(
            SyncUpTarget::Rest(RestTarget::new("Account")),
            SyncOptions::new(MergeMode::LeaveIfChanged),
            ACCOUNTS,
            None,
        )
        .unwrap();
    let state = manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Done);

    assert_eq!(rest.count(RestMethod::Patch, ACCOUNT_PATH), 1);
    assert_eq!(rest.count(RestMethod::Patch, &format!("{}/001B", ACCOUNT_PATH)), 1);

    let acme = store
        .query_all(&QuerySpec::exact(ACCOUNTS, "Id", "001A", 1))
        .unwrap();
    assert!(is_dirty(&acme[0]));
    assert_eq!(acme[0]["Name"], json!("Acme local"));
}

#[tokio::test]
async fn sync_up_overwrite_ignores_newer_remote() {
    let (store, rest, manager) = setup();
    let mut stale = account("001A", "Acme local", "2024-01-01T00:00:00.000+0000");
    mark_dirty(&mut stale, false, true, false);
    store.upsert_entry(ACCOUNTS, stale, None).unwrap();

    rest.on_query(
        "WHERE Id IN",
        records(vec![account("001A", "Acme", "2024-02-01T00:00:00.000+0000")]),
    );
    rest.on_path(RestMethod::Patch, ACCOUNT_PATH, Value::Null);

    let sync = manager
        .create_sync_up(
            SyncUpTarget::Rest(RestTarget::new("Account")),
            SyncOptions::new(MergeMode::Overwrite),
            ACCOUNTS,
            None,
        )
        .unwrap();
    manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();

    assert_eq!(rest.count(RestMethod::Patch, ACCOUNT_PATH), 1);
    let acme = &stored(&store)[0];
    assert!(!is_dirty(acme));
    assert_eq!(acme["Name"], json!("Acme local"));
    assert_eq!(acme["LastModifiedDate"], json!("2024-02-01T00:00:00.000Z"));
}

#[tokio::test]
async fn sync_up_failure_keeps_record_dirty_and_reports_error() {
    let (store, rest, manager) = setup();
    let mut updated = account("001B", "Globex 2", "2024-01-02T00:00:00.000+0000");
    mark_dirty(&mut updated, false, true, false);
    store.upsert_entry(ACCOUNTS, updated, None).unwrap();

    rest.fail_path(
        RestMethod::Patch,
        ACCOUNT_PATH,
        RestError::Status {
            status: 400,
            body: r#"[{"message": "Name too long", "errorCode": "STRING_TOO_LONG"}]"#.into(),
        },
    );

    let sync = manager
        .create_sync_up(
            SyncUpTarget::Rest(RestTarget::new("Account")),
            SyncOptions::default(),
            ACCOUNTS,
            None,
        )
        .unwrap();
    let state = manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();

    assert_eq!(state.status, SyncStatus::Done);
    assert_eq!(state.error.as_deref(), Some("Name too long"));
    let doc = &stored(&store)[0];
    assert!(is_dirty(doc));
    assert_eq!(doc[LAST_ERROR], json!("Name too long"));
}

// ============================================================================
// Manager lifecycle
// ============================================================================

#[tokio::test]
async fn second_run_of_same_sync_is_rejected() {
    let (_store, rest, manager) = setup();
    rest.on_query("FROM Account", three_accounts());
    let sync = manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, None)
        .unwrap();

    let first = manager.run_sync(sync.id, None).unwrap();
    let err = manager.run_sync(sync.id, None).unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning(id) if id == sync.id));

    assert_eq!(first.await.unwrap().unwrap().status, SyncStatus::Done);
    assert!(manager.run_sync(sync.id, None).is_ok());
}

#[tokio::test]
async fn stop_sync_halts_between_pages() {
    let (store, rest, manager) = setup();
    rest.on_query(
        "FROM Account",
        json!({
            "totalSize": 3,
            "done": false,
            "nextRecordsUrl": "/services/data/v62.0/query/01g-2",
            "records": [account("001A", "Acme", "2024-01-01T00:00:00.000+0000")],
        }),
    );
    rest.on_path(
        RestMethod::Get,
        "/services/data/v62.0/query/01g-2",
        records(vec![
            account("001B", "Globex", "2024-01-02T00:00:00.000+0000"),
            account("001C", "Initech", "2024-01-03T00:00:00.000+0000"),
        ]),
    );

    let sync = manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, None)
        .unwrap();
    let stopper = manager.clone();
    let sync_id = sync.id;
    let callback: SyncCallback = Arc::new(move |_state: &SyncState| {
        stopper.stop_sync(sync_id);
    });

    let state = manager
        .run_sync(sync.id, Some(callback))
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, SyncStatus::Stopped);
    assert_eq!(local_ids(&store), vec!["001A"]);
    assert_eq!(rest.count(RestMethod::Get, "/services/data/v62.0/query/01g-2"), 0);

    let state = manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Done);
    assert_eq!(local_ids(&store), vec!["001A", "001B", "001C"]);
}

#[tokio::test]
async fn stopped_manager_refuses_runs_until_restart() {
    let (_store, rest, manager) = setup();
    rest.on_query("FROM Account", three_accounts());
    let sync = manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, None)
        .unwrap();

    manager.stop();
    assert!(manager.is_stopped());
    assert!(matches!(
        manager.run_sync(sync.id, None),
        Err(Error::ManagerStopped)
    ));

    let restarted = manager.restart(false, None).unwrap();
    assert!(restarted.is_empty());
    assert!(!manager.is_stopping() && !manager.is_stopped());
    let state = manager.run_sync(sync.id, None).unwrap().await.unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Done);
}

#[tokio::test]
async fn manager_stop_during_run_refuses_new_runs() {
    let (_store, rest, manager) = setup();
    rest.on_query(
        "FROM Account",
        json!({
            "totalSize": 3,
            "done": false,
            "nextRecordsUrl": "/services/data/v62.0/query/01g-2",
            "records": [account("001A", "Acme", "2024-01-01T00:00:00.000+0000")],
        }),
    );
    let first = manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, None)
        .unwrap();
    let second = manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, None)
        .unwrap();

    let stopper = manager.clone();
    let callback: SyncCallback = Arc::new(move |_state: &SyncState| stopper.stop());
    let handle = manager.run_sync(first.id, Some(callback)).unwrap();

    let state = handle.await.unwrap().unwrap();
    assert_eq!(state.status, SyncStatus::Stopped);
    assert!(manager.is_stopped());
    assert!(matches!(
        manager.run_sync(second.id, None),
        Err(Error::ManagerStopped)
    ));
    assert!(!manager.is_running(second.id));
    let untouched = manager.get_sync_status(second.id).unwrap().unwrap();
    assert_eq!(untouched.status, SyncStatus::New);
}

#[tokio::test]
async fn sync_records_validate_on_creation() {
    let (_store, _rest, manager) = setup();

    let err = manager
        .create_sync_down(soql_down(), SyncOptions::default(), "missing", None)
        .unwrap_err();
    assert!(matches!(err, Error::SoupNotFound(_)));

    manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, Some("dup"))
        .unwrap();
    let err = manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, Some("dup"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSyncConfig(_)));

    let err = manager
        .create_sync_down(
            SyncDownTarget::Soql(SoqlTarget::new("  ")),
            SyncOptions::default(),
            ACCOUNTS,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSyncConfig(_)));
}

#[tokio::test]
async fn delete_and_mark_failed() {
    let (_store, _rest, manager) = setup();
    let sync = manager
        .create_sync_down(soql_down(), SyncOptions::default(), ACCOUNTS, Some("gone"))
        .unwrap();

    let failed = manager.mark_failed(sync.id, "abandoned").unwrap();
    assert_eq!(failed.status, SyncStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("abandoned"));

    assert!(manager.has_sync_with_name("gone").unwrap());
    manager.delete_sync_by_name("gone").unwrap();
    assert!(!manager.has_sync_with_name("gone").unwrap());
    assert!(matches!(
        manager.delete_sync(sync.id),
        Err(Error::SyncNotFound(_))
    ));
}
