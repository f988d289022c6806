use pgward::core::roles::NodeRole;
use strum::IntoEnumIterator;

#[test]
fn test_wire_names_are_lowercase_identifiers() {
    for role in NodeRole::iter() {
        let name = role.wire_name();
        assert!(!name.is_empty());
        assert!(
            name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
            "unexpected character in wire name '{name}'"
        );
    }
}

#[test]
fn test_wire_names_round_trip() {
    for role in NodeRole::iter() {
        if role == NodeRole::Unknown {
            continue;
        }
        assert_eq!(NodeRole::from_wire(role.wire_name()), Some(role));
    }
}

#[test]
fn test_wire_names_are_stable() {
    assert_eq!(NodeRole::NoState.wire_name(), "no_state");
    assert_eq!(NodeRole::WaitPrimary.wire_name(), "wait_primary");
    assert_eq!(NodeRole::Catchingup.wire_name(), "catchingup");
    assert_eq!(NodeRole::PreparePromotion.wire_name(), "prepare_promotion");
    assert_eq!(NodeRole::StopReplication.wire_name(), "stop_replication");
    assert_eq!(NodeRole::DemoteTimeout.wire_name(), "demote_timeout");
    assert_eq!(NodeRole::ReportLsn.wire_name(), "report_lsn");
    assert_eq!(NodeRole::JoinPrimary.wire_name(), "join_primary");
    assert_eq!(NodeRole::ApplySettings.wire_name(), "apply_settings");
    assert_eq!(NodeRole::FastForward.wire_name(), "fast_forward");
    assert_eq!(NodeRole::PrepareMaintenance.wire_name(), "prepare_maintenance");
}

#[test]
fn test_lenient_parse_degrades_to_unknown() {
    assert_eq!(NodeRole::parse_lenient("secondary"), NodeRole::Secondary);
    assert_eq!(NodeRole::parse_lenient("not_a_role"), NodeRole::Unknown);
    assert_eq!(NodeRole::parse_lenient(""), NodeRole::Unknown);
    assert_eq!(NodeRole::parse_lenient("unknown"), NodeRole::Unknown);
}

#[test]
fn test_strict_parse_rejects_unknown() {
    assert_eq!(NodeRole::from_wire("not_a_role"), None);
    assert_eq!(NodeRole::from_wire("unknown"), None);
    assert_eq!(NodeRole::from_wire("PRIMARY"), None);
}

#[test]
fn test_binary_ids_round_trip() {
    for role in NodeRole::iter() {
        if role == NodeRole::Unknown {
            continue;
        }
        assert_eq!(NodeRole::from_binary_id(role.binary_id()), Some(role));
    }
}

#[test]
fn test_binary_ids_are_frozen() {
    assert_eq!(NodeRole::NoState.binary_id(), 0);
    assert_eq!(NodeRole::Single.binary_id(), 2);
    assert_eq!(NodeRole::Primary.binary_id(), 4);
    assert_eq!(NodeRole::Secondary.binary_id(), 7);
    assert_eq!(NodeRole::Dropped.binary_id(), 18);
    assert_eq!(NodeRole::PrepareMaintenance.binary_id(), 19);
    assert_eq!(NodeRole::from_binary_id(20), None);
    assert_eq!(NodeRole::from_binary_id(u32::MAX), None);
}

#[test]
fn test_role_classification() {
    assert!(NodeRole::Primary.accepts_writes());
    assert!(NodeRole::Single.accepts_writes());
    assert!(!NodeRole::Secondary.accepts_writes());
    assert!(NodeRole::Secondary.is_standby());
    assert!(NodeRole::Catchingup.is_standby());
    assert!(!NodeRole::Primary.is_standby());
}
