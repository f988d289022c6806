//! Shared fakes for the monitor and local-Postgres seams.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use pgward::core::errors::KeeperError;
use pgward::core::monitor::{
    MonitorLink, NodeActiveReply, NodeActiveReport, NodeAddress, RegisterReply,
};
use pgward::core::postgres::{
    ControlData, LocalPostgresState, Lsn, PgError, PostgresAdmin, StopMode,
};
use pgward::core::roles::NodeRole;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Mutable innards of the fake local Postgres.
#[derive(Default)]
pub struct FakePg {
    pub running: bool,
    pub in_recovery: bool,
    pub lsn: u64,
    pub sync_state: String,
    pub lag: Option<u64>,
    pub following: bool,
    pub streaming_standbys: bool,
    pub sync_names: Option<String>,
    pub read_only: Option<bool>,
    pub replay_paused: bool,
    pub slots: Vec<String>,
    pub calls: Vec<String>,
}

/// A scripted [`PostgresAdmin`] recording every operation it is asked for.
#[derive(Default)]
pub struct FakePostgres {
    pub inner: Mutex<FakePg>,
    expected: Arc<AtomicBool>,
}

impl FakePostgres {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, f: impl FnOnce(&mut FakePg)) {
        f(&mut self.inner.lock());
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: impl Into<String>) {
        self.inner.lock().calls.push(call.into());
    }
}

#[async_trait]
impl PostgresAdmin for FakePostgres {
    async fn probe(&self) -> LocalPostgresState {
        let pg = self.inner.lock();
        if !pg.running {
            return LocalPostgresState::default();
        }
        LocalPostgresState {
            pg_is_running: true,
            is_in_recovery: pg.in_recovery,
            current_lsn: Lsn(pg.lsn),
            pgsr_sync_state: pg.sync_state.clone(),
            wal_lag_bytes: pg.lag,
        }
    }

    async fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    async fn ensure_running(&self) -> Result<(), PgError> {
        self.record("ensure_running");
        self.inner.lock().running = true;
        Ok(())
    }

    async fn ensure_stopped(&self, mode: StopMode) -> Result<(), PgError> {
        self.record(format!("ensure_stopped {mode:?}"));
        self.inner.lock().running = false;
        Ok(())
    }

    async fn reload(&self) -> Result<(), PgError> {
        self.record("reload");
        Ok(())
    }

    async fn init_if_needed(&self) -> Result<bool, PgError> {
        self.record("init_if_needed");
        Ok(false)
    }

    async fn promote(&self) -> Result<(), PgError> {
        self.record("promote");
        let mut pg = self.inner.lock();
        pg.running = true;
        pg.in_recovery = false;
        pg.following = false;
        Ok(())
    }

    async fn follow(
        &self,
        primary: &NodeAddress,
        slot_name: &str,
        application_name: &str,
        restart: bool,
    ) -> Result<(), PgError> {
        self.record(format!(
            "follow {}:{} slot={slot_name} app={application_name} restart={restart}",
            primary.host, primary.port
        ));
        self.inner.lock().following = true;
        Ok(())
    }

    async fn is_following(&self) -> Result<bool, PgError> {
        Ok(self.inner.lock().following)
    }

    async fn base_backup_from(&self, primary: &NodeAddress) -> Result<(), PgError> {
        self.record(format!("base_backup {}:{}", primary.host, primary.port));
        let mut pg = self.inner.lock();
        pg.running = false;
        pg.following = false;
        Ok(())
    }

    async fn rewind_from(&self, primary: &NodeAddress) -> Result<(), PgError> {
        self.record(format!("rewind {}:{}", primary.host, primary.port));
        self.inner.lock().running = false;
        Ok(())
    }

    async fn create_replication_slot(&self, name: &str) -> Result<(), PgError> {
        self.record(format!("create_slot {name}"));
        self.inner.lock().slots.push(name.to_string());
        Ok(())
    }

    async fn drop_replication_slot(&self, name: &str) -> Result<(), PgError> {
        self.record(format!("drop_slot {name}"));
        self.inner.lock().slots.retain(|s| s != name);
        Ok(())
    }

    async fn set_synchronous_standby_names(&self, expression: &str) -> Result<(), PgError> {
        self.record(format!("sync_names {expression}"));
        self.inner.lock().sync_names = Some(expression.to_string());
        Ok(())
    }

    async fn set_transaction_read_only(&self, read_only: bool) -> Result<(), PgError> {
        self.record(format!("read_only {read_only}"));
        self.inner.lock().read_only = Some(read_only);
        Ok(())
    }

    async fn pause_wal_replay(&self) -> Result<(), PgError> {
        self.record("pause_wal_replay");
        self.inner.lock().replay_paused = true;
        Ok(())
    }

    async fn drop_primary_conninfo(&self) -> Result<(), PgError> {
        self.record("drop_primary_conninfo");
        self.inner.lock().following = false;
        Ok(())
    }

    async fn has_streaming_standby(&self) -> Result<bool, PgError> {
        Ok(self.inner.lock().streaming_standbys)
    }

    async fn ensure_hba_rules_for(&self, peers: &[NodeAddress]) -> Result<(), PgError> {
        self.record(format!("ensure_hba {} peers", peers.len()));
        Ok(())
    }

    async fn control_data(&self) -> Result<ControlData, PgError> {
        Ok(ControlData {
            system_identifier: 7_210_293_381_864_745_437,
            pg_control_version: 1300,
            catalog_version: 202307071,
        })
    }

    fn expected_up(&self) -> Arc<AtomicBool> {
        self.expected.clone()
    }
}

/// A scripted [`MonitorLink`]: `node_active` pops pre-loaded replies.
pub struct FakeMonitor {
    pub replies: Mutex<VecDeque<Result<NodeActiveReply, KeeperError>>>,
    pub primary: Mutex<NodeAddress>,
    pub others: Mutex<Vec<NodeAddress>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            primary: Mutex::new(addr(1, "node-a.internal", 5432, true)),
            others: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn push_reply(&self, reply: Result<NodeActiveReply, KeeperError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl MonitorLink for FakeMonitor {
    async fn register_node(
        &self,
        _formation: &str,
        _group_id: Option<i32>,
        _nodename: &str,
        _host: &str,
        _port: u16,
        _system_identifier: u64,
        _wanted_initial_state: NodeRole,
    ) -> Result<RegisterReply, KeeperError> {
        self.calls.lock().push("register_node".to_string());
        Ok(RegisterReply {
            node_id: 1,
            group_id: 0,
            assigned_role: NodeRole::Single,
        })
    }

    async fn node_active(
        &self,
        report: &NodeActiveReport,
    ) -> Result<NodeActiveReply, KeeperError> {
        self.calls
            .lock()
            .push(format!("node_active {}", report.current_role));
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(KeeperError::Monitor("no scripted reply".into())))
    }

    async fn get_primary(
        &self,
        _formation: &str,
        _group_id: i32,
    ) -> Result<NodeAddress, KeeperError> {
        self.calls.lock().push("get_primary".to_string());
        Ok(self.primary.lock().clone())
    }

    async fn get_other_nodes(&self, _node_id: i64) -> Result<Vec<NodeAddress>, KeeperError> {
        self.calls.lock().push("get_other_nodes".to_string());
        Ok(self.others.lock().clone())
    }

    async fn start_maintenance(&self, _node_id: i64) -> Result<bool, KeeperError> {
        Ok(true)
    }

    async fn stop_maintenance(&self, _node_id: i64) -> Result<bool, KeeperError> {
        Ok(true)
    }

    async fn remove_node(&self, _node_id: i64) -> Result<(), KeeperError> {
        Ok(())
    }
}

pub fn addr(node_id: i64, host: &str, port: u16, is_primary: bool) -> NodeAddress {
    NodeAddress {
        node_id,
        name: format!("node_{node_id}"),
        host: host.to_string(),
        port,
        lsn: Lsn::INVALID,
        is_primary,
    }
}

pub fn reply(assigned: NodeRole, nodes_version: i32) -> NodeActiveReply {
    NodeActiveReply {
        node_id: 2,
        group_id: 0,
        assigned_role: assigned,
        candidate_priority: Some(50),
        replication_quorum: Some(true),
        nodes_version,
    }
}
