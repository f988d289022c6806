use pgward::core::postgres::hba::{
    ConnectionType, HBA_MARKER, HbaDatabase, HbaRule, ensure_host_rule_exists,
    ensure_rules_for_peer, hba_address_for_host,
};
use tempfile::TempDir;

fn rule(address: &str) -> HbaRule {
    HbaRule {
        connection: ConnectionType::Host,
        database: HbaDatabase::Replication,
        username: "pgautofailover_replicator".to_string(),
        address: address.to_string(),
        auth_method: "trust".to_string(),
    }
}

#[test]
fn test_address_formatting() {
    assert_eq!(hba_address_for_host("10.0.0.5"), "10.0.0.5/32");
    assert_eq!(hba_address_for_host("::1"), "::1/128");
    assert_eq!(hba_address_for_host("2001:db8::7"), "2001:db8::7/128");
    assert_eq!(hba_address_for_host("node-b.internal"), "node-b.internal");
}

#[test]
fn test_rule_format() {
    let rule = rule("10.0.0.5/32");
    assert_eq!(
        rule.format(),
        "host replication \"pgautofailover_replicator\" 10.0.0.5/32 trust"
    );

    let db_rule = HbaRule {
        connection: ConnectionType::HostSsl,
        database: HbaDatabase::Named("appdb".to_string()),
        username: "app".to_string(),
        address: "node-b.internal".to_string(),
        auth_method: "scram-sha-256".to_string(),
    };
    assert_eq!(
        db_rule.format(),
        "hostssl \"appdb\" \"app\" node-b.internal scram-sha-256"
    );
}

#[test]
fn test_append_carries_the_marker() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pg_hba.conf");
    std::fs::write(&path, "local all all trust\n").unwrap();

    assert!(ensure_host_rule_exists(&path, &rule("10.0.0.5/32")).unwrap());
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.ends_with(&format!(
        "host replication \"pgautofailover_replicator\" 10.0.0.5/32 trust{HBA_MARKER}\n"
    )));
}

#[test]
fn test_second_append_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pg_hba.conf");
    std::fs::write(&path, "local all all trust\n").unwrap();

    assert!(ensure_host_rule_exists(&path, &rule("10.0.0.5/32")).unwrap());
    let first = std::fs::read(&path).unwrap();
    assert!(!ensure_host_rule_exists(&path, &rule("10.0.0.5/32")).unwrap());
    let second = std::fs::read(&path).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_hand_written_rule_counts_as_present() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pg_hba.conf");
    // The same rule, no marker, added by an operator.
    std::fs::write(
        &path,
        "host replication \"pgautofailover_replicator\" 10.0.0.5/32 trust\n",
    )
    .unwrap();

    assert!(!ensure_host_rule_exists(&path, &rule("10.0.0.5/32")).unwrap());
}

#[test]
fn test_file_without_trailing_newline() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pg_hba.conf");
    std::fs::write(&path, "local all all trust").unwrap();

    assert!(ensure_host_rule_exists(&path, &rule("::1/128")).unwrap());
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.starts_with("local all all trust\nhost replication"));
    assert!(contents.ends_with('\n'));
}

#[test]
fn test_peer_rules_cover_replication_and_database() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pg_hba.conf");
    std::fs::write(&path, "").unwrap();

    assert!(
        ensure_rules_for_peer(&path, false, "postgres", "pgautofailover_replicator", "10.0.0.6", "trust")
            .unwrap()
    );
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("host replication \"pgautofailover_replicator\" 10.0.0.6/32 trust"));
    assert!(contents.contains("host \"postgres\" \"pgautofailover_replicator\" 10.0.0.6/32 trust"));

    // Replay leaves the file untouched.
    let first = std::fs::read(&path).unwrap();
    assert!(
        !ensure_rules_for_peer(&path, false, "postgres", "pgautofailover_replicator", "10.0.0.6", "trust")
            .unwrap()
    );
    assert_eq!(first, std::fs::read(&path).unwrap());
}

#[test]
fn test_ssl_peers_get_hostssl_rules() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pg_hba.conf");
    std::fs::write(&path, "").unwrap();

    ensure_rules_for_peer(&path, true, "postgres", "replicator", "node-b", "cert").unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("hostssl replication \"replicator\" node-b cert"));
}

#[test]
fn test_missing_file_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.conf");
    assert!(ensure_host_rule_exists(&path, &rule("10.0.0.5/32")).is_err());
}
