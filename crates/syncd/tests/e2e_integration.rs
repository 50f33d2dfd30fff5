//! End-to-end integration tests for the Relay sync engine.
//!
//! These tests verify complete flows work correctly:
//! - Concurrent locked writes from independent lock owners
//! - Optimistic updates, commit and rollback
//! - Reloads racing with in-flight mutations
//! - Stale lock reclamation
//! - Rate limiting at the mutation API
//! - External change detection and self-echo suppression

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serial_test::serial;
use syncd::config::{BuildMode, Config};
use syncd::files::{lock_path_for, strip_bom, LockRecord, BOM};
use syncd::schema::{
    unix_millis, Collection, Contact, DataErrorKind, DataEvent, OnCallRow, Server, TeamPosition,
};
use syncd::{
    AtomicWriter, EnvOverride, FileManager, LockManager, ManagerState, MutationError,
    OperationClass, OperationResult, PathValidator, RateLimiter, SyncContext,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Create a test configuration rooted in `dir`.
fn test_config(dir: &Path, watch: bool) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = dir.to_path_buf();
    config.watcher.enabled = watch;
    config.watcher.debounce_ms = 100;
    config.locks.acquire_timeout_ms = 2_000;
    config.locks.retry_interval_ms = 10;
    config.runtime.mode = BuildMode::Development;
    config
}

fn manager_with(config: Config) -> Arc<FileManager> {
    let locks = LockManager::with_owner("relay-test", &config.locks);
    Arc::new(FileManager::new(SyncContext::new(config).with_locks(locks)))
}

fn create_test_manager(watch: bool) -> (Arc<FileManager>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let manager = manager_with(test_config(temp_dir.path(), watch));
    (manager, temp_dir)
}

/// A lock manager standing in for another Relay process.
fn foreign_locks(acquire_timeout: Duration) -> LockManager {
    LockManager::with_timings(
        "other-instance",
        Duration::from_secs(30),
        acquire_timeout,
        Duration::from_millis(5),
    )
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> T {
    let bytes = std::fs::read(path).unwrap();
    serde_json::from_slice(strip_bom(&bytes)).unwrap()
}

fn drain(events: &mut broadcast::Receiver<DataEvent>) -> Vec<DataEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

// =============================================================================
// Locked Write Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_locked_mutations_are_serialized() {
    let temp_dir = TempDir::new().unwrap();
    let first = AtomicWriter::new(
        temp_dir.path(),
        Arc::new(foreign_locks(Duration::from_secs(10))),
    );
    let second = AtomicWriter::new(
        temp_dir.path(),
        Arc::new(LockManager::with_timings(
            "second-instance",
            Duration::from_secs(30),
            Duration::from_secs(10),
            Duration::from_millis(5),
        )),
    );

    let spawn_writer = |writer: AtomicWriter, offset: u32| {
        tokio::spawn(async move {
            for i in 0..25 {
                writer
                    .modify_json_with_lock(
                        "counter.json",
                        |mut values: Vec<u32>| {
                            values.push(offset + i);
                            values
                        },
                        Vec::new(),
                    )
                    .await
                    .unwrap();
            }
        })
    };

    let a = spawn_writer(first, 0);
    let b = spawn_writer(second, 1_000);
    a.await.unwrap();
    b.await.unwrap();

    let mut values: Vec<u32> = read_json(&temp_dir.path().join("counter.json"));
    assert_eq!(values.len(), 50, "no update may be lost");
    values.sort_unstable();
    values.dedup();
    assert_eq!(values.len(), 50);
    assert!(!lock_path_for(&temp_dir.path().join("counter.json")).exists());
}

#[tokio::test]
async fn test_bom_marker_is_never_doubled() {
    let (manager, temp_dir) = create_test_manager(false);
    manager
        .add_contact(Contact::new("Alice", "alice@example.com"))
        .await
        .unwrap();

    manager.export_contacts_csv("exports/contacts.csv").await.unwrap();
    let receipt = manager.export_contacts_csv("exports/contacts.csv").await.unwrap();

    let bytes = std::fs::read(temp_dir.path().join("exports/contacts.csv")).unwrap();
    assert!(bytes.starts_with(BOM));
    assert!(!bytes[BOM.len()..].starts_with(BOM));
    assert_eq!(receipt.bytes, bytes.len() as u64);

    let writer = AtomicWriter::new(
        temp_dir.path(),
        Arc::new(foreign_locks(Duration::from_secs(1))),
    );
    writer
        .atomic_write_with_bom("marked.csv", &[BOM, b"name\n".as_slice()].concat())
        .await
        .unwrap();
    let bytes = std::fs::read(temp_dir.path().join("marked.csv")).unwrap();
    assert_eq!(bytes, [BOM, b"name\n".as_slice()].concat());
}

// =============================================================================
// Path Containment Tests
// =============================================================================

#[test]
fn test_path_containment() {
    let temp_dir = TempDir::new().unwrap();
    let validator = PathValidator::new(temp_dir.path());

    assert!(validator.validate("contacts.json"));
    assert!(validator.validate("exports/new/contacts.csv"));

    assert!(!validator.validate("../contacts.json"));
    assert!(!validator.validate("exports/../../contacts.json"));
    assert!(!validator.validate("/etc/passwd"));
    assert!(!validator.validate(r"\\fileserver\share\contacts.json"));
    assert!(!validator.validate("//fileserver/share/contacts.json"));
}

#[cfg(unix)]
#[test]
fn test_symlink_escaping_root_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("shared")).unwrap();

    let validator = PathValidator::new(temp_dir.path());
    assert!(!validator.validate("shared/contacts.json"));
    assert!(!validator.validate("shared"));
}

#[tokio::test]
async fn test_export_outside_root_is_refused() {
    let (manager, _temp_dir) = create_test_manager(false);

    let result = manager.export_servers_csv("../servers.csv").await;
    assert!(matches!(result, Err(MutationError::Persistence(_))));
}

// =============================================================================
// Mutation Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_mutations_persist_and_reload() {
    let (manager, temp_dir) = create_test_manager(false);
    manager.start().await.unwrap();

    manager
        .add_contact(Contact::new("Alice", "alice@example.com"))
        .await
        .unwrap();
    manager.add_server(Server::new("SRV-001")).await.unwrap();
    manager.add_group("Platform").await.unwrap();
    manager
        .add_contact_to_group("platform", "alice@example.com")
        .await
        .unwrap();

    let contacts: Vec<Contact> = read_json(&temp_dir.path().join("contacts.json"));
    assert_eq!(contacts, vec![Contact::new("Alice", "alice@example.com")]);

    // A second instance sees the same data.
    let other = manager_with(test_config(temp_dir.path(), false));
    assert!(other.read_and_emit().await);
    let snapshot = other.get_cached_data();
    assert_eq!(snapshot.contacts.len(), 1);
    assert_eq!(snapshot.servers[0].name, "SRV-001");
    assert_eq!(snapshot.groups["Platform"], vec!["alice@example.com"]);
}

#[tokio::test]
async fn test_update_of_missing_entity_is_not_found() {
    let (manager, temp_dir) = create_test_manager(false);

    let result = manager
        .update_contact("ghost@example.com", Contact::new("Ghost", "ghost@example.com"))
        .await;
    assert!(matches!(result, Err(MutationError::NotFound { kind: "contact", .. })));
    assert!(!temp_dir.path().join("contacts.json").exists());
}

#[tokio::test]
async fn test_invalid_input_is_rejected_before_io() {
    let (manager, temp_dir) = create_test_manager(false);

    let result = manager.add_contact(Contact::new("No Email", "not-an-email")).await;
    assert!(matches!(result, Err(MutationError::Validation(_))));
    assert!(!temp_dir.path().join("contacts.json").exists());
    assert!(manager.get_cached_data().contacts.is_empty());
}

#[tokio::test]
async fn test_failed_persistence_rolls_back_cache() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(temp_dir.path(), false);
    config.locks.acquire_timeout_ms = 200;
    let manager = manager_with(config);

    manager
        .add_contact(Contact::new("Alice", "alice@example.com"))
        .await
        .unwrap();
    let before = manager.get_cached_data().contacts.clone();
    let file_before = std::fs::read(temp_dir.path().join("contacts.json")).unwrap();

    // Another instance holds the file for longer than we are willing to wait.
    let foreign = foreign_locks(Duration::from_secs(1));
    let _held = foreign
        .acquire(&temp_dir.path().join("contacts.json"))
        .await
        .unwrap();

    let mut events = manager.cache().events();
    let result = manager.add_contact(Contact::new("Bob", "bob@example.com")).await;

    match &result {
        Err(MutationError::LockContention(_)) => {}
        other => panic!("expected lock contention, got {other:?}"),
    }
    assert_eq!(manager.get_cached_data().contacts, before);
    assert_eq!(
        std::fs::read(temp_dir.path().join("contacts.json")).unwrap(),
        file_before
    );

    let errors: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            DataEvent::DataError(error) => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, DataErrorKind::Persistence);
    assert_eq!(errors[0].file.as_deref(), Some("contacts.json"));

    let outcome = OperationResult::from(&result);
    assert!(!outcome.success);
    assert!(outcome.retry_after_ms.is_none());
}

#[tokio::test]
async fn test_update_racing_with_external_edit_and_reload() {
    let (manager, temp_dir) = create_test_manager(false);
    let oncall_path = temp_dir.path().join("oncall.json");

    let seeded = vec![
        OnCallRow::new("ops-1", "Ops", "Primary", "Alice"),
        OnCallRow::new("dba-1", "DBA", "Primary", "Bob"),
    ];
    std::fs::write(&oncall_path, serde_json::to_vec_pretty(&seeded).unwrap()).unwrap();
    assert!(manager.read_and_emit().await);

    // Another instance is mid-edit on the rota when our update starts.
    let foreign = foreign_locks(Duration::from_secs(1));
    let held = foreign.acquire(&oncall_path).await.unwrap();

    let update = manager.update_on_call_team(
        "Ops",
        vec![OnCallRow::new("ops-2", "Ops", "Primary", "Carol")],
    );
    let external = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let external_rows = vec![
            OnCallRow::new("ops-1", "Ops", "Primary", "Alice"),
            OnCallRow::new("ops-9", "Ops", "Secondary", "Dave"),
            OnCallRow::new("dba-1", "DBA", "Primary", "Bob"),
            OnCallRow::new("net-1", "Network", "Primary", "Erin"),
        ];
        std::fs::write(&oncall_path, serde_json::to_vec_pretty(&external_rows).unwrap()).unwrap();
        held.release().unwrap();
        // The watcher would report the edit now.
        manager.read_and_emit().await
    };

    let (update_result, reload_ok) = tokio::join!(update, external);
    update_result.unwrap();
    assert!(reload_ok);

    let on_disk: Vec<OnCallRow> = read_json(&oncall_path);
    let cached = manager.get_cached_data().on_call.clone();
    assert_eq!(cached, on_disk, "the cache must match the file after reload");

    let mut ids: Vec<&str> = cached.iter().map(|r| r.id.as_str()).collect();
    let total = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), total, "no duplicate rows");

    assert!(cached.iter().any(|r| r.team == "Network"));
    let ops: Vec<&str> = cached
        .iter()
        .filter(|r| r.team == "Ops")
        .map(|r| r.id.as_str())
        .collect();
    assert_eq!(ops, vec!["ops-2"]);
}

#[tokio::test]
async fn test_rename_on_call_team_updates_rows_and_layout() {
    let (manager, temp_dir) = create_test_manager(false);

    manager
        .update_on_call_team("Ops", vec![OnCallRow::new("", "ignored", "Primary", "Alice")])
        .await
        .unwrap();
    manager
        .update_team_layout("Ops", TeamPosition::new(10.0, 20.0))
        .await
        .unwrap();
    manager.rename_on_call_team("ops", "SRE").await.unwrap();

    let snapshot = manager.get_cached_data();
    assert_eq!(snapshot.on_call.len(), 1);
    assert_eq!(snapshot.on_call[0].team, "SRE");
    assert!(!snapshot.on_call[0].id.is_empty());
    assert!(snapshot.team_layout.contains_key("SRE"));
    assert!(!snapshot.team_layout.contains_key("Ops"));

    let rows: Vec<OnCallRow> = read_json(&temp_dir.path().join("oncall.json"));
    assert_eq!(rows, snapshot.on_call);
}

#[tokio::test]
async fn test_import_contacts_csv_upserts() {
    let (manager, temp_dir) = create_test_manager(false);
    manager
        .add_contact(Contact::new("Alice", "alice@example.com"))
        .await
        .unwrap();

    let csv_path = temp_dir.path().join("import.csv");
    std::fs::write(
        &csv_path,
        "Name,Email Address,Phone\n\
         Alice Smith,ALICE@example.com,555-0100\n\
         Bob,bob@example.com,\n\
         Broken,not-an-email,\n",
    )
    .unwrap();

    let summary = manager.import_contacts_csv(&csv_path).await.unwrap();
    assert_eq!(summary.imported, 2);
    assert_eq!(summary.skipped.len(), 1);

    let contacts = manager.get_cached_data().contacts.clone();
    assert_eq!(contacts.len(), 2);
    assert_eq!(contacts[0].name, "Alice Smith");
    assert_eq!(contacts[0].phone, "555-0100");
}

#[tokio::test]
async fn test_dummy_data_is_guarded_outside_development() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(temp_dir.path(), false);
    config.runtime.mode = BuildMode::Production;
    let manager = manager_with(config);

    let result = manager.generate_dummy_data(10).await;
    assert!(matches!(
        result,
        Err(MutationError::EnvironmentGuard {
            operation: "generate_dummy_data"
        })
    ));
    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);

    let (dev, _dev_dir) = create_test_manager(false);
    dev.generate_dummy_data(10).await.unwrap();
    assert_eq!(dev.get_cached_data().contacts.len(), 10);
}

#[tokio::test]
#[serial]
async fn test_environment_cannot_unlock_dummy_data_in_production() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(temp_dir.path(), false);
    config.runtime.mode = BuildMode::Production;

    std::env::set_var("RELAY_MODE", "development");
    let seen = config.apply_env_overrides();
    std::env::remove_var("RELAY_MODE");

    assert_eq!(config.runtime.mode, BuildMode::Production);
    assert!(seen
        .iter()
        .any(|o| matches!(o, EnvOverride::Ignored { var: "RELAY_MODE", .. })));

    let manager = manager_with(config);
    let result = manager.generate_dummy_data(5).await;
    assert!(matches!(
        result,
        Err(MutationError::EnvironmentGuard {
            operation: "generate_dummy_data"
        })
    ));
    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_destroy_without_start_is_idempotent() {
    let (manager, temp_dir) = create_test_manager(false);
    assert_eq!(manager.state(), ManagerState::Idle);

    manager.destroy();
    manager.destroy();
    assert_eq!(manager.state(), ManagerState::Destroyed);

    assert!(manager.start().await.is_err());
    assert_eq!(manager.state(), ManagerState::Destroyed);
    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
}

// =============================================================================
// Lock Staleness Tests
// =============================================================================

#[tokio::test]
async fn test_stale_lock_from_dead_process_is_reclaimed() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("servers.json");
    let lease = Duration::from_secs(10);

    let abandoned = LockRecord {
        owner: "crashed-instance".to_string(),
        nonce: "abandoned".to_string(),
        pid: 999_999,
        acquired_at_ms: unix_millis() - 20_000,
        lease_ms: 10_000,
    };
    std::fs::write(lock_path_for(&target), serde_json::to_vec(&abandoned).unwrap()).unwrap();

    let locks = LockManager::with_timings("relay-test", lease, lease, Duration::from_millis(10));
    let started = Instant::now();
    let guard = locks.acquire(&target).await.unwrap();
    assert!(started.elapsed() < lease);

    let info = locks.inspect(&target).unwrap().unwrap();
    assert_eq!(info.record.unwrap().owner, "relay-test");

    guard.release().unwrap();
    assert!(!lock_path_for(&target).exists());
}

// =============================================================================
// Rate Limiting Tests
// =============================================================================

#[test]
fn test_rate_limit_burst() {
    let limiter = RateLimiter::new(5.0, 0.1);

    for _ in 0..5 {
        assert!(limiter.try_consume(1).allowed);
    }
    let denied = limiter.try_consume(1);
    assert!(!denied.allowed);
    let retry = denied.retry_after_ms.unwrap();
    assert!((9_900..=10_000).contains(&retry), "retry after {retry} ms");
}

#[tokio::test]
async fn test_import_rate_limit_reports_retry_hint() {
    let (manager, temp_dir) = create_test_manager(false);
    let csv_path = temp_dir.path().join("servers.csv");
    std::fs::write(&csv_path, "name,os\nSRV-001,Linux\n").unwrap();

    for _ in 0..5 {
        manager.import_servers_csv(&csv_path).await.unwrap();
    }
    let err = manager.import_servers_csv(&csv_path).await.unwrap_err();

    match &err {
        MutationError::RateLimited { class, .. } => assert_eq!(*class, OperationClass::Import),
        other => panic!("expected rate limit, got {other:?}"),
    }
    let retry = err.retry_after_ms().unwrap();
    assert!((9_000..=10_000).contains(&retry), "retry after {retry} ms");

    let json = serde_json::to_value(OperationResult::from(&Err::<(), _>(err))).unwrap();
    assert_eq!(json["success"], false);
    assert!(json["retryAfterMs"].is_u64());
    assert_eq!(manager.get_cached_data().servers.len(), 1);
}

// =============================================================================
// Change Detection Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_external_edit_triggers_reload() {
    let (manager, temp_dir) = create_test_manager(true);
    manager.start().await.unwrap();

    let contacts = vec![Contact::new("Erin", "erin@example.com")];
    std::fs::write(
        temp_dir.path().join("contacts.json"),
        serde_json::to_vec_pretty(&contacts).unwrap(),
    )
    .unwrap();

    let reloaded = wait_until(Duration::from_secs(5), || {
        manager.get_cached_data().contacts == contacts
    })
    .await;
    assert!(reloaded, "external edit was not picked up");

    manager.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_own_writes_do_not_trigger_reload() {
    let (manager, _temp_dir) = create_test_manager(true);
    manager.start().await.unwrap();

    let mut events = manager.cache().events();
    manager
        .add_contact(Contact::new("Alice", "alice@example.com"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    let reloads = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, DataEvent::ReloadStarted))
        .count();
    assert_eq!(reloads, 0);
    let last_write = manager.echoes().last(Collection::Contacts);
    assert_eq!(last_write.map(|entry| entry.generation), Some(1));

    manager.destroy();
    manager.destroy();
}
