use pgward::core::errors::KeeperError;
use pgward::core::keeper::state::{
    KeeperState, KeeperStateFile, STATE_FILE_MAGIC, STATE_FILE_VERSION,
};
use pgward::core::roles::NodeRole;
use tempfile::TempDir;

fn sample_state() -> KeeperState {
    KeeperState {
        current_node_id: 2,
        current_group: 0,
        current_role: NodeRole::Secondary,
        assigned_role: NodeRole::Secondary,
        last_monitor_contact: 1_722_000_000_123,
        last_secondary_contact: 0,
        xlog_location: (3 << 32) | 0x4028,
        pg_control_version: 1300,
        catalog_version: 202307071,
        system_identifier: 7_210_293_381_864_745_437,
        current_nodes_version: 4,
    }
}

#[test]
fn test_write_then_read_is_identity() {
    let dir = TempDir::new().unwrap();
    let file = KeeperStateFile::new(dir.path().join("pgward.state"));
    let state = sample_state();
    file.write(&state).unwrap();
    assert_eq!(file.read().unwrap(), state);
}

#[test]
fn test_rewrite_replaces_previous_record() {
    let dir = TempDir::new().unwrap();
    let file = KeeperStateFile::new(dir.path().join("pgward.state"));
    let mut state = sample_state();
    file.write(&state).unwrap();

    state.current_role = NodeRole::PreparePromotion;
    state.current_nodes_version = 5;
    file.write(&state).unwrap();
    assert_eq!(file.read().unwrap(), state);
}

#[test]
fn test_no_temp_file_left_behind() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pgward.state");
    let file = KeeperStateFile::new(&path);
    file.write(&sample_state()).unwrap();
    assert!(path.is_file());
    assert!(!path.with_extension("new").exists());
}

#[test]
fn test_truncated_file_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pgward.state");
    let file = KeeperStateFile::new(&path);
    file.write(&sample_state()).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    bytes.pop();
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(file.read(), Err(KeeperError::StateCorrupt(_))));
}

#[test]
fn test_trailing_garbage_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pgward.state");
    let file = KeeperStateFile::new(&path);
    file.write(&sample_state()).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    bytes.push(0);
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(file.read(), Err(KeeperError::StateCorrupt(_))));
}

#[test]
fn test_bad_magic_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pgward.state");
    let file = KeeperStateFile::new(&path);
    file.write(&sample_state()).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(file.read(), Err(KeeperError::StateCorrupt(_))));
}

#[test]
fn test_future_version_is_refused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pgward.state");
    let file = KeeperStateFile::new(&path);
    file.write(&sample_state()).unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    let future = (STATE_FILE_VERSION + 1).to_le_bytes();
    bytes[4..8].copy_from_slice(&future);
    std::fs::write(&path, &bytes).unwrap();

    match file.read() {
        Err(KeeperError::StateVersionUnsupported(v)) => assert_eq!(v, STATE_FILE_VERSION + 1),
        other => panic!("expected a version refusal, got {other:?}"),
    }
}

#[test]
fn test_version_one_record_is_migrated() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pgward.state");
    let state = sample_state();

    // A version-1 file: same layout without the trailing nodes version.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&STATE_FILE_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&state.current_node_id.to_le_bytes());
    bytes.extend_from_slice(&state.current_group.to_le_bytes());
    bytes.extend_from_slice(&state.current_role.binary_id().to_le_bytes());
    bytes.extend_from_slice(&state.assigned_role.binary_id().to_le_bytes());
    bytes.extend_from_slice(&state.last_monitor_contact.to_le_bytes());
    bytes.extend_from_slice(&state.last_secondary_contact.to_le_bytes());
    bytes.extend_from_slice(&state.xlog_location.to_le_bytes());
    bytes.extend_from_slice(&state.pg_control_version.to_le_bytes());
    bytes.extend_from_slice(&state.catalog_version.to_le_bytes());
    bytes.extend_from_slice(&state.system_identifier.to_le_bytes());
    std::fs::write(&path, &bytes).unwrap();

    let file = KeeperStateFile::new(&path);
    let migrated = file.read().unwrap();
    assert_eq!(migrated.current_node_id, state.current_node_id);
    assert_eq!(migrated.current_role, state.current_role);
    assert_eq!(migrated.system_identifier, state.system_identifier);
    assert_eq!(migrated.current_nodes_version, 0);

    // The next write upgrades the file to the current version.
    file.write(&migrated).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    assert_eq!(version, STATE_FILE_VERSION);
}

#[test]
fn test_unknown_role_id_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pgward.state");
    let file = KeeperStateFile::new(&path);
    file.write(&sample_state()).unwrap();

    // The current_role field sits right after the two header words and the
    // first two record fields.
    let mut bytes = std::fs::read(&path).unwrap();
    let role_offset = 8 + 8 + 4;
    bytes[role_offset..role_offset + 4].copy_from_slice(&999u32.to_le_bytes());
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(file.read(), Err(KeeperError::StateCorrupt(_))));
}

#[test]
fn test_init_refuses_to_clobber() {
    let dir = TempDir::new().unwrap();
    let file = KeeperStateFile::new(dir.path().join("pgward.state"));
    file.init(&sample_state()).unwrap();
    assert!(file.init(&sample_state()).is_err());
}

#[test]
fn test_remove_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let file = KeeperStateFile::new(dir.path().join("pgward.state"));
    file.write(&sample_state()).unwrap();
    file.remove().unwrap();
    assert!(!file.exists());
    file.remove().unwrap();
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let file = KeeperStateFile::new(dir.path().join("absent.state"));
    assert!(matches!(file.read(), Err(KeeperError::StateIo(_))));
}
