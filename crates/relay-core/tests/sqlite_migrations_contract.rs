use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use relay_core::config::CoreConfig;
use relay_core::models::CoreErrorKind;
use relay_core::persistence::{JobSpecStore, MigrationStore};
use relay_core::sqlite::{SqliteStore, current_schema_version, migration, migrations};

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("relay-{test_name}-{nanos}.sqlite3"))
}

#[test]
fn migration_table_is_contiguous_and_reversible() {
    let entries = migrations();
    let versions: Vec<i64> = entries.iter().map(|entry| entry.version).collect();
    let expected: Vec<i64> = (1..=current_schema_version()).collect();
    assert_eq!(versions, expected);

    for entry in entries {
        assert_eq!(migration(entry.version), Some(entry));
        assert!(!entry.name.is_empty());
        assert!(!entry.up_sql.trim().is_empty(), "{} has no up sql", entry.name);
        assert!(!entry.down_sql.trim().is_empty(), "{} has no down sql", entry.name);
    }
    assert!(migration(0).is_none());
    assert!(migration(current_schema_version() + 1).is_none());
}

#[test]
fn migrations_apply_up_and_down_and_up_again() {
    let path = test_db_path("migrate-roundtrip");
    let store = SqliteStore::new(&path);

    assert_eq!(store.current_version().unwrap(), 0);
    assert_eq!(store.planned_migrations(0).len(), migrations().len());

    store.migrate_to_latest().expect("migrate up");
    assert_eq!(store.current_version().unwrap(), current_schema_version());
    assert!(store.planned_migrations(current_schema_version()).is_empty());

    store.apply_migration(1).expect("migrate down to 1");
    assert_eq!(store.current_version().unwrap(), 1);

    store.apply_migration(0).expect("migrate down to 0");
    assert_eq!(store.current_version().unwrap(), 0);

    store.migrate_to_latest().expect("migrate up again");
    store.migrate_to_latest().expect("re-applying latest is a no-op");
    assert_eq!(store.current_version().unwrap(), current_schema_version());
    assert!(store.list_job_specs(true).unwrap().is_empty());

    let _ = std::fs::remove_file(path);
}

#[test]
fn out_of_range_migration_targets_are_rejected() {
    let path = test_db_path("migrate-invalid");
    let store = SqliteStore::new(&path);

    let error = store
        .apply_migration(current_schema_version() + 1)
        .expect_err("target past latest");
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);

    let error = store.apply_migration(-1).expect_err("negative target");
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);

    let _ = std::fs::remove_file(path);
}

#[test]
fn job_operations_require_an_initialized_schema() {
    let path = test_db_path("uninitialized");
    let store = SqliteStore::new(&path);

    let error = store
        .list_job_specs(true)
        .expect_err("schema is not migrated");
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);

    let _ = std::fs::remove_file(path);
}

#[test]
fn configured_store_is_migrated_on_open() {
    let path = test_db_path("from-config");
    let config = CoreConfig {
        database_path: Some(path.clone()),
        ..CoreConfig::default()
    };

    let store = SqliteStore::from_config(&config).expect("open configured store");
    assert_eq!(store.database_path(), path.as_path());
    assert_eq!(store.current_version().unwrap(), current_schema_version());

    let error = SqliteStore::from_config(&CoreConfig::default())
        .err()
        .expect("no path configured");
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);

    let _ = std::fs::remove_file(path);
}
