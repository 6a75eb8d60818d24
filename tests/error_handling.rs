//! Error handling and edge case tests.

mod common;

use common::{init_tracing, seed_tasks, Dataset};
use livequery::{
    AllowAll, ChangeBatch, ChangeEvent, ChannelNotice, FileRegistrationStore, FileStoreConfig,
    Identity, InMemoryRegistrationStore, LiveQueryError, LiveQueryServer, QueryEvaluator, QuerySpec,
    Record, Registration, RegistrationStore, Result, SecurityContext, ServerConfig, WriteAheadLog,
};
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::sync::Arc;
use tempfile::TempDir;

fn server_with(store: Arc<dyn RegistrationStore>, evaluator: Arc<dyn QueryEvaluator>) -> LiveQueryServer {
    init_tracing();
    LiveQueryServer::new(store, evaluator, Arc::new(AllowAll), ServerConfig::default())
}

fn tasks_dataset() -> Arc<Dataset> {
    let dataset = Arc::new(Dataset::new());
    seed_tasks(&dataset);
    dataset
}

// --- Registration store ---

#[test]
fn test_open_missing_store_without_create() {
    let dir = TempDir::new().unwrap();
    let result = FileRegistrationStore::open(FileStoreConfig {
        path: dir.path().join("missing"),
        create_if_missing: false,
    });
    assert!(matches!(result, Err(LiveQueryError::NotInitialized)));
}

#[test]
fn test_registry_bad_magic() {
    let dir = TempDir::new().unwrap();
    let config = FileStoreConfig {
        path: dir.path().join("registrations"),
        create_if_missing: true,
    };
    drop(FileRegistrationStore::open(config.clone()).unwrap());

    fs::write(config.path.join("registrations.bin"), b"garbage that is long enough").unwrap();

    let result = FileRegistrationStore::open(config);
    assert!(matches!(result, Err(LiveQueryError::InvalidFormat(_))));
}

#[test]
fn test_registry_checksum_mismatch() {
    let dir = TempDir::new().unwrap();
    let config = FileStoreConfig {
        path: dir.path().join("registrations"),
        create_if_missing: true,
    };
    let store = FileRegistrationStore::open(config.clone()).unwrap();
    store
        .add(Registration::new("tasks", &QuerySpec::all(), SecurityContext::anonymous(), vec![]).unwrap())
        .unwrap();

    // Flip a payload byte; the trailing four bytes are the checksum
    let path = config.path.join("registrations.bin");
    let mut bytes = fs::read(&path).unwrap();
    let at = bytes.len() - 6;
    bytes[at] ^= 0xff;
    fs::write(&path, bytes).unwrap();

    assert!(matches!(store.list(), Err(LiveQueryError::ChecksumMismatch { .. })));
}

#[test]
fn test_malformed_registration_skipped() {
    let dataset = tasks_dataset();
    let store = Arc::new(InMemoryRegistrationStore::new());
    let server = server_with(store.clone(), dataset.clone());

    let good = server
        .fetch_live("tasks", &QuerySpec::all(), &SecurityContext::anonymous())
        .unwrap();
    let mut broken = Registration::new("tasks", &QuerySpec::all(), SecurityContext::user("x"), vec![]).unwrap();
    broken.query = "{not json".into();
    let broken_id = broken.id.clone();
    store.add(broken).unwrap();

    let report = server
        .items_changed("tasks", &[dataset.insert("tasks", json!({"id": 7}))])
        .unwrap();

    assert_eq!(report.registrations, 2);
    assert_eq!(report.published, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, broken_id);
    assert_eq!(store.identities(&good.id).unwrap().unwrap().len(), 7);
}

// --- Evaluation ---

/// Returns rows without an identity field.
struct Anonymous;

impl QueryEvaluator for Anonymous {
    fn evaluate(&self, _: &str, _: &QuerySpec, _: &SecurityContext) -> Result<Vec<Record>> {
        Ok(vec![json!({"title": "no id"})])
    }
}

#[test]
fn test_row_without_identity_rejected_at_fetch() {
    let store = Arc::new(InMemoryRegistrationStore::new());
    let server = server_with(store.clone(), Arc::new(Anonymous));

    let err = server
        .fetch_live("tasks", &QuerySpec::all(), &SecurityContext::anonymous())
        .unwrap_err();
    assert!(matches!(err, LiveQueryError::MissingIdentity(_)));
    assert!(store.is_empty());
}

#[test]
fn test_changes_for_other_entity_filtered() {
    let dataset = tasks_dataset();
    let server = server_with(Arc::new(InMemoryRegistrationStore::new()), dataset);
    server
        .fetch_live("tasks", &QuerySpec::all(), &SecurityContext::anonymous())
        .unwrap();

    let report = server
        .items_changed("tasks", &[ChangeEvent::insert("users", Identity::Int(1), json!({"id": 1}))])
        .unwrap();
    assert_eq!(report.registrations, 0);
    assert_eq!(report.messages, 0);
}

// --- Subscriptions ---

#[test]
fn test_subscribe_unknown_connection() {
    let server = server_with(Arc::new(InMemoryRegistrationStore::new()), tasks_dataset());
    let fetched = server
        .fetch_live("tasks", &QuerySpec::all(), &SecurityContext::anonymous())
        .unwrap();

    let err = server
        .subscribe(&ChannelNotice::new(fetched.id, "ghost"), &SecurityContext::anonymous())
        .unwrap_err();
    assert!(matches!(err, LiveQueryError::UnknownConnection(_)));
}

#[test]
fn test_subscribe_foreign_channel_denied() {
    let server = server_with(Arc::new(InMemoryRegistrationStore::new()), tasks_dataset());
    let fetched = server
        .fetch_live("tasks", &QuerySpec::all(), &SecurityContext::user("alice"))
        .unwrap();
    let stream = server.open_stream();

    let err = server
        .subscribe(
            &ChannelNotice::new(fetched.id.clone(), stream.client_id.clone()),
            &SecurityContext::user("mallory"),
        )
        .unwrap_err();
    assert!(matches!(err, LiveQueryError::AuthorizationDenied(_)));
    assert_eq!(server.bus().listener_count(&fetched.id), 0);
}

#[test]
fn test_unsubscribe_unknown_channel_is_harmless() {
    let server = server_with(Arc::new(InMemoryRegistrationStore::new()), tasks_dataset());
    let stream = server.open_stream();
    server.unsubscribe(&ChannelNotice::new("lq-nothing", stream.client_id.clone()));
    assert_eq!(server.bus().connection_count(), 1);
}

// --- Write-ahead log ---

#[test]
fn test_wal_bad_magic() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("changes.wal");
    fs::write(&path, b"NOPE\x02").unwrap();

    assert!(matches!(WriteAheadLog::open(&path), Err(LiveQueryError::InvalidFormat(_))));
}

#[test]
fn test_wal_torn_tail_keeps_complete_entries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("changes.wal");
    let batch = |id: i64| {
        ChangeBatch::new(
            "tasks",
            vec![ChangeEvent::insert("tasks", Identity::Int(id), json!({"id": id}))],
        )
    };

    {
        let wal = WriteAheadLog::open(&path).unwrap();
        wal.log(&batch(1)).unwrap();
        wal.log(&batch(2)).unwrap();
    }

    // Cut the second entry short
    let len = fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - 3)
        .unwrap();

    let wal = WriteAheadLog::open(&path).unwrap();
    let pending = wal.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].1, batch(1));
}
