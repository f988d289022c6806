use pgward::core::postgres::conf::{
    primary_conninfo, remove_standby_setup, replication_slot_name, setup_standby_mode,
    standby_application_name, standby_setup_present, write_managed_settings,
};
use tempfile::TempDir;

#[test]
fn test_primary_conninfo_shape() {
    let conninfo = primary_conninfo("node-a.internal", 5432, "replicator", "pgautofailover_standby_2", "prefer");
    assert_eq!(
        conninfo,
        "host=node-a.internal port=5432 user=replicator \
         application_name=pgautofailover_standby_2 sslmode=prefer"
    );
}

#[test]
fn test_naming_conventions() {
    assert_eq!(standby_application_name(2), "pgautofailover_standby_2");
    assert_eq!(replication_slot_name(2), "pgautofailover_2");
}

#[test]
fn test_standby_mode_on_modern_postgres() {
    let dir = TempDir::new().unwrap();
    setup_standby_mode(dir.path(), 16, "host=node-a port=5432", "pgautofailover_2").unwrap();

    assert!(dir.path().join("standby.signal").is_file());
    assert!(standby_setup_present(dir.path(), 16));

    let auto_conf = std::fs::read_to_string(dir.path().join("postgresql.auto.conf")).unwrap();
    assert!(auto_conf.contains("primary_conninfo = 'host=node-a port=5432'"));
    assert!(auto_conf.contains("primary_slot_name = 'pgautofailover_2'"));
    assert!(auto_conf.contains("recovery_target_timeline = 'latest'"));
}

#[test]
fn test_standby_mode_is_idempotent() {
    let dir = TempDir::new().unwrap();
    setup_standby_mode(dir.path(), 16, "host=node-a port=5432", "pgautofailover_2").unwrap();
    let first = std::fs::read(dir.path().join("postgresql.auto.conf")).unwrap();
    setup_standby_mode(dir.path(), 16, "host=node-a port=5432", "pgautofailover_2").unwrap();
    let second = std::fs::read(dir.path().join("postgresql.auto.conf")).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_standby_mode_follows_a_new_primary() {
    let dir = TempDir::new().unwrap();
    setup_standby_mode(dir.path(), 16, "host=node-a port=5432", "pgautofailover_2").unwrap();
    setup_standby_mode(dir.path(), 16, "host=node-c port=5432", "pgautofailover_2").unwrap();

    let auto_conf = std::fs::read_to_string(dir.path().join("postgresql.auto.conf")).unwrap();
    assert!(auto_conf.contains("host=node-c"));
    assert!(!auto_conf.contains("host=node-a"));
}

#[test]
fn test_managed_block_preserves_foreign_settings() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("postgresql.auto.conf");
    std::fs::write(&path, "shared_buffers = '1GB'\n").unwrap();

    write_managed_settings(
        dir.path(),
        &[("primary_conninfo".to_string(), "host=node-a".to_string())],
    )
    .unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.starts_with("shared_buffers = '1GB'\n"));
    assert!(contents.contains("primary_conninfo = 'host=node-a'"));

    // An empty settings list removes the managed block and nothing else.
    write_managed_settings(dir.path(), &[]).unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, "shared_buffers = '1GB'\n");
}

#[test]
fn test_quotes_are_escaped() {
    let dir = TempDir::new().unwrap();
    write_managed_settings(
        dir.path(),
        &[("primary_conninfo".to_string(), "password=it's".to_string())],
    )
    .unwrap();
    let contents = std::fs::read_to_string(dir.path().join("postgresql.auto.conf")).unwrap();
    assert!(contents.contains("primary_conninfo = 'password=it''s'"));
}

#[test]
fn test_standby_mode_on_old_postgres() {
    let dir = TempDir::new().unwrap();
    setup_standby_mode(dir.path(), 11, "host=node-a port=5432", "pgautofailover_2").unwrap();

    assert!(!dir.path().join("standby.signal").exists());
    assert!(standby_setup_present(dir.path(), 11));
    let recovery = std::fs::read_to_string(dir.path().join("recovery.conf")).unwrap();
    assert!(recovery.contains("standby_mode = 'on'"));
    assert!(recovery.contains("primary_conninfo = 'host=node-a port=5432'"));
    assert!(recovery.contains("primary_slot_name = 'pgautofailover_2'"));
}

#[test]
fn test_remove_standby_setup() {
    let dir = TempDir::new().unwrap();
    setup_standby_mode(dir.path(), 16, "host=node-a port=5432", "pgautofailover_2").unwrap();
    remove_standby_setup(dir.path(), 16).unwrap();
    assert!(!standby_setup_present(dir.path(), 16));
    let auto_conf = std::fs::read_to_string(dir.path().join("postgresql.auto.conf")).unwrap();
    assert!(!auto_conf.contains("primary_conninfo"));

    // Removing twice is fine.
    remove_standby_setup(dir.path(), 16).unwrap();

    setup_standby_mode(dir.path(), 11, "host=node-a port=5432", "pgautofailover_2").unwrap();
    remove_standby_setup(dir.path(), 11).unwrap();
    assert!(!standby_setup_present(dir.path(), 11));
}
