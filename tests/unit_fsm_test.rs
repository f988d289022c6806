mod common;

use common::{FakeMonitor, FakePostgres, addr};
use pgward::config::KeeperConfig;
use pgward::core::fsm::{Plan, TransitionAction, TransitionContext, execute, plan};
use pgward::core::fsm::actions::sync_standby_expression;
use pgward::core::keeper::state::KeeperState;
use pgward::core::roles::NodeRole;

fn sample_state() -> KeeperState {
    KeeperState {
        current_node_id: 2,
        current_group: 0,
        current_role: NodeRole::Secondary,
        assigned_role: NodeRole::Secondary,
        last_monitor_contact: 0,
        last_secondary_contact: 0,
        xlog_location: 0,
        pg_control_version: 0,
        catalog_version: 0,
        system_identifier: 0,
        current_nodes_version: 0,
    }
}

fn sample_config() -> KeeperConfig {
    let mut config = KeeperConfig::default();
    config.postgresql.pgdata = "/var/lib/postgres/node_b".into();
    config.pg_autoctl.monitor =
        "postgres://autoctl_node@monitor.internal:5432/pg_auto_failover".to_string();
    config
}

#[test]
fn test_equal_roles_plan_to_stay() {
    for role in [
        NodeRole::Single,
        NodeRole::Primary,
        NodeRole::Secondary,
        NodeRole::Maintenance,
    ] {
        assert_eq!(plan(role, role), Plan::Stay);
    }
}

#[test]
fn test_principal_edges() {
    use NodeRole::*;
    use TransitionAction as A;
    let cases = [
        (Init, Single, A::InitAsSingle),
        (Init, WaitStandby, A::ReportOnly),
        (Single, WaitPrimary, A::EnableSyncRep),
        (WaitPrimary, Primary, A::ConfirmPrimary),
        (Primary, WaitPrimary, A::RelaxSyncRep),
        (Primary, PrepareMaintenance, A::BlockWrites),
        (PrepareMaintenance, Maintenance, A::StopForMaintenance),
        (WaitStandby, Catchingup, A::InitAsStandby),
        (Catchingup, Secondary, A::ConfirmCatchup),
        (Secondary, PreparePromotion, A::PreparePromotion),
        (PreparePromotion, StopReplication, A::StopReplication),
        (StopReplication, WaitPrimary, A::PromoteToWaitPrimary),
        (Secondary, FastForward, A::FastForward),
        (FastForward, Catchingup, A::ResumeStreaming),
        (Demoted, Catchingup, A::RejoinAsStandby),
        (Primary, Maintenance, A::StopForMaintenance),
        (Secondary, Maintenance, A::StopForMaintenance),
        (Maintenance, Catchingup, A::ResumeFromMaintenance),
        (Primary, Draining, A::EnsureStoppedFast),
        (Draining, Demoted, A::EnsureStoppedFast),
        (Primary, JoinPrimary, A::PrepareForNewStandby),
        (JoinPrimary, Primary, A::ConfirmPrimary),
        (Primary, ApplySettings, A::ApplySettings),
        (ApplySettings, Primary, A::ConfirmPrimary),
        (Secondary, ReportLsn, A::ReportLsn),
        (Secondary, Dropped, A::DropNode),
        (Demoted, Single, A::BecomeSingle),
    ];
    for (current, assigned, action) in cases {
        assert_eq!(
            plan(current, assigned),
            Plan::Step(action),
            "planning {current} -> {assigned}"
        );
    }
}

#[test]
fn test_unknown_pairs_are_unsupported() {
    use NodeRole::*;
    for (current, assigned) in [
        (Single, Secondary),
        (Secondary, Primary),
        (Primary, Init),
        (Dropped, Single),
        (Dropped, Primary),
        (Single, Unknown),
    ] {
        assert_eq!(
            plan(current, assigned),
            Plan::Unsupported,
            "planning {current} -> {assigned}"
        );
    }
}

#[test]
fn test_sync_standby_expression() {
    assert_eq!(sync_standby_expression(&[]), "");
    assert_eq!(
        sync_standby_expression(&[addr(1, "node-a", 5432, true)]),
        ""
    );
    assert_eq!(
        sync_standby_expression(&[
            addr(1, "node-a", 5432, true),
            addr(2, "node-b", 5432, false),
            addr(3, "node-c", 5432, false),
        ]),
        "ANY 1 (pgautofailover_standby_2, pgautofailover_standby_3)"
    );
}

#[tokio::test]
async fn test_enable_sync_rep() {
    let pg = FakePostgres::new();
    pg.set(|p| {
        p.running = true;
        p.in_recovery = false;
    });
    let monitor = FakeMonitor::new();
    let config = sample_config();
    let mut state = sample_state();
    let mut ctx = TransitionContext {
        pg: pg.as_ref(),
        monitor: monitor.as_ref(),
        config: &config,
        state: &mut state,
    };

    execute(&mut ctx, TransitionAction::EnableSyncRep).await.unwrap();
    assert_eq!(pg.inner.lock().sync_names.as_deref(), Some("*"));
}

#[tokio::test]
async fn test_confirm_primary_requires_a_streaming_standby() {
    let pg = FakePostgres::new();
    pg.set(|p| {
        p.running = true;
        p.streaming_standbys = false;
    });
    let monitor = FakeMonitor::new();
    let config = sample_config();
    let mut state = sample_state();
    let mut ctx = TransitionContext {
        pg: pg.as_ref(),
        monitor: monitor.as_ref(),
        config: &config,
        state: &mut state,
    };

    let err = execute(&mut ctx, TransitionAction::ConfirmPrimary)
        .await
        .unwrap_err();
    assert!(err.is_transient());

    pg.set(|p| p.streaming_standbys = true);
    let mut ctx = TransitionContext {
        pg: pg.as_ref(),
        monitor: monitor.as_ref(),
        config: &config,
        state: &mut state,
    };
    execute(&mut ctx, TransitionAction::ConfirmPrimary).await.unwrap();
    assert_eq!(pg.inner.lock().read_only, Some(false));
}

#[tokio::test]
async fn test_promote_to_wait_primary() {
    let pg = FakePostgres::new();
    pg.set(|p| {
        p.running = true;
        p.in_recovery = true;
    });
    let monitor = FakeMonitor::new();
    let config = sample_config();
    let mut state = sample_state();
    let mut ctx = TransitionContext {
        pg: pg.as_ref(),
        monitor: monitor.as_ref(),
        config: &config,
        state: &mut state,
    };

    execute(&mut ctx, TransitionAction::PromoteToWaitPrimary).await.unwrap();
    let calls = pg.calls();
    assert!(calls.contains(&"promote".to_string()));
    assert_eq!(pg.inner.lock().sync_names.as_deref(), Some("*"));
    assert!(!pg.inner.lock().in_recovery);
}

#[tokio::test]
async fn test_init_as_standby_builds_from_base_backup() {
    let pg = FakePostgres::new();
    let monitor = FakeMonitor::new();
    let config = sample_config();
    let mut state = sample_state();

    {
        // FakePostgres flips to running-in-recovery once started after a
        // follow, mirroring a standby boot.
        pg.set(|p| p.in_recovery = true);
        let mut ctx = TransitionContext {
            pg: pg.as_ref(),
            monitor: monitor.as_ref(),
            config: &config,
            state: &mut state,
        };
        execute(&mut ctx, TransitionAction::InitAsStandby).await.unwrap();
    }

    assert_eq!(pg.call_count("base_backup node-a.internal:5432"), 1);
    assert_eq!(pg.call_count("follow node-a.internal:5432 slot=pgautofailover_2"), 1);
    assert_eq!(pg.call_count("ensure_running"), 1);
}

#[tokio::test]
async fn test_init_as_standby_replay_skips_the_backup() {
    let pg = FakePostgres::new();
    pg.set(|p| {
        p.running = true;
        p.in_recovery = true;
        p.following = true;
    });
    let monitor = FakeMonitor::new();
    let config = sample_config();
    let mut state = sample_state();
    let mut ctx = TransitionContext {
        pg: pg.as_ref(),
        monitor: monitor.as_ref(),
        config: &config,
        state: &mut state,
    };

    execute(&mut ctx, TransitionAction::InitAsStandby).await.unwrap();
    assert_eq!(pg.call_count("base_backup"), 0);
}

#[tokio::test]
async fn test_confirm_catchup_thresholds() {
    let monitor = FakeMonitor::new();
    let config = sample_config();

    for (lag, expect_ok) in [
        (Some(1024 * 1024), true),
        (Some(16 * 1024 * 1024), true),
        (Some(100 * 1024 * 1024), false),
        (None, false),
    ] {
        let pg = FakePostgres::new();
        pg.set(|p| {
            p.running = true;
            p.in_recovery = true;
            p.lag = lag;
        });
        let mut state = sample_state();
        let mut ctx = TransitionContext {
            pg: pg.as_ref(),
            monitor: monitor.as_ref(),
            config: &config,
            state: &mut state,
        };
        let result = execute(&mut ctx, TransitionAction::ConfirmCatchup).await;
        assert_eq!(result.is_ok(), expect_ok, "lag {lag:?}");
        if let Err(e) = result {
            assert!(e.is_transient());
        }
    }
}

#[tokio::test]
async fn test_prepare_promotion_pauses_and_records_the_lsn() {
    let pg = FakePostgres::new();
    pg.set(|p| {
        p.running = true;
        p.in_recovery = true;
        p.lsn = (7 << 32) | 0x1000;
    });
    let monitor = FakeMonitor::new();
    let config = sample_config();
    let mut state = sample_state();
    let mut ctx = TransitionContext {
        pg: pg.as_ref(),
        monitor: monitor.as_ref(),
        config: &config,
        state: &mut state,
    };

    execute(&mut ctx, TransitionAction::PreparePromotion).await.unwrap();
    assert!(pg.inner.lock().replay_paused);
    assert_eq!(state.xlog_location, (7 << 32) | 0x1000);
}

#[tokio::test]
async fn test_fast_forward_leaves_the_node_stopped() {
    let pg = FakePostgres::new();
    let monitor = FakeMonitor::new();
    let config = sample_config();
    let mut state = sample_state();
    let mut ctx = TransitionContext {
        pg: pg.as_ref(),
        monitor: monitor.as_ref(),
        config: &config,
        state: &mut state,
    };

    execute(&mut ctx, TransitionAction::FastForward).await.unwrap();
    assert_eq!(pg.call_count("rewind node-a.internal:5432"), 1);
    assert_eq!(pg.call_count("follow"), 1);
    assert_eq!(pg.call_count("ensure_running"), 0);
    assert!(!pg.inner.lock().running);
}

#[tokio::test]
async fn test_fast_forward_replay_skips_the_rewind() {
    let pg = FakePostgres::new();
    // A previous attempt completed: stopped and configured to follow.
    pg.set(|p| {
        p.running = false;
        p.following = true;
    });
    let monitor = FakeMonitor::new();
    let config = sample_config();
    let mut state = sample_state();
    let mut ctx = TransitionContext {
        pg: pg.as_ref(),
        monitor: monitor.as_ref(),
        config: &config,
        state: &mut state,
    };

    execute(&mut ctx, TransitionAction::FastForward).await.unwrap();
    assert_eq!(pg.call_count("rewind"), 0);
    assert_eq!(pg.call_count("follow"), 0);
}

#[tokio::test]
async fn test_fast_forward_still_rewinds_a_live_standby() {
    let pg = FakePostgres::new();
    pg.set(|p| {
        p.running = true;
        p.in_recovery = true;
        p.following = true;
    });
    let monitor = FakeMonitor::new();
    let config = sample_config();
    let mut state = sample_state();
    let mut ctx = TransitionContext {
        pg: pg.as_ref(),
        monitor: monitor.as_ref(),
        config: &config,
        state: &mut state,
    };

    execute(&mut ctx, TransitionAction::FastForward).await.unwrap();
    assert_eq!(pg.call_count("rewind node-a.internal:5432"), 1);
}

#[tokio::test]
async fn test_apply_settings_on_the_primary() {
    let pg = FakePostgres::new();
    pg.set(|p| p.running = true);
    let monitor = FakeMonitor::new();
    *monitor.others.lock() = vec![
        addr(2, "node-b", 5432, false),
        addr(3, "node-c", 5432, false),
    ];
    let config = sample_config();
    let mut state = sample_state();
    state.current_node_id = 1;
    let mut ctx = TransitionContext {
        pg: pg.as_ref(),
        monitor: monitor.as_ref(),
        config: &config,
        state: &mut state,
    };

    execute(&mut ctx, TransitionAction::ApplySettings).await.unwrap();
    assert_eq!(
        pg.inner.lock().sync_names.as_deref(),
        Some("ANY 1 (pgautofailover_standby_2, pgautofailover_standby_3)")
    );
    assert_eq!(pg.call_count("ensure_hba 2 peers"), 1);
}

#[tokio::test]
async fn test_prepare_for_new_standby_creates_slots() {
    let pg = FakePostgres::new();
    pg.set(|p| p.running = true);
    let monitor = FakeMonitor::new();
    *monitor.others.lock() = vec![
        addr(2, "node-b", 5432, false),
        addr(3, "node-c", 5432, false),
    ];
    let config = sample_config();
    let mut state = sample_state();
    state.current_node_id = 1;
    let mut ctx = TransitionContext {
        pg: pg.as_ref(),
        monitor: monitor.as_ref(),
        config: &config,
        state: &mut state,
    };

    execute(&mut ctx, TransitionAction::PrepareForNewStandby).await.unwrap();
    assert_eq!(
        pg.inner.lock().slots,
        vec!["pgautofailover_2".to_string(), "pgautofailover_3".to_string()]
    );
}

#[tokio::test]
async fn test_maintenance_stops_postgres_fast() {
    let pg = FakePostgres::new();
    pg.set(|p| p.running = true);
    let monitor = FakeMonitor::new();
    let config = sample_config();
    let mut state = sample_state();
    let mut ctx = TransitionContext {
        pg: pg.as_ref(),
        monitor: monitor.as_ref(),
        config: &config,
        state: &mut state,
    };

    execute(&mut ctx, TransitionAction::StopForMaintenance).await.unwrap();
    assert_eq!(pg.call_count("ensure_stopped Fast"), 1);
    assert!(!pg.inner.lock().running);
}
