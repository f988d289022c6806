// src/core/keeper/mod.rs

//! The keeper loop: the periodic report/assign exchange with the monitor and
//! the state machine that converges the local Postgres to the assigned role.
//!
//! Each tick probes the local instance, calls `node_active`, executes at most
//! one transition, and persists the state file before the next exchange, so a
//! crash never leaves on-disk state contradicting what the monitor was told.

pub mod pidfile;
pub mod state;

use crate::config::{self, KeeperConfig};
use crate::core::errors::KeeperError;
use crate::core::fsm::{self, Plan, TransitionContext};
use crate::core::monitor::{MonitorLink, NodeActiveReport};
use crate::core::postgres::PostgresAdmin;
use crate::core::roles::NodeRole;
use crate::core::supervisor::ShutdownMode;
use state::{KeeperState, KeeperStateFile};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// After this many consecutive failed `node_active` calls the keeper logs a
/// warning. It never self-demotes; demotion is the monitor's prerogative.
pub const MONITOR_FAILURE_WARN_TICKS: u32 = 20;

/// What one tick did; used by tests and the loop itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub monitor_ok: bool,
    pub assigned: NodeRole,
    pub transitioned: bool,
}

/// The per-node agent. One keeper per data directory; the loop is the only
/// writer of the state file.
pub struct Keeper {
    config: KeeperConfig,
    config_path: PathBuf,
    state: KeeperState,
    state_file: KeeperStateFile,
    pg: Arc<dyn PostgresAdmin>,
    monitor: Arc<dyn MonitorLink>,
    monitor_failures: u32,
}

impl Keeper {
    /// Loads the persisted state; a node that was never registered has no
    /// state file and cannot run.
    pub fn new(
        config: KeeperConfig,
        pg: Arc<dyn PostgresAdmin>,
        monitor: Arc<dyn MonitorLink>,
    ) -> Result<Self, KeeperError> {
        let paths = config.paths();
        let state_file = KeeperStateFile::new(&paths.state);
        if !state_file.exists() {
            return Err(KeeperError::Config(format!(
                "no keeper state at {}; run 'pgward create postgres' first",
                state_file.path().display()
            )));
        }
        let state = state_file.read()?;
        Ok(Self {
            config,
            config_path: paths.config,
            state,
            state_file,
            pg,
            monitor,
            monitor_failures: 0,
        })
    }

    pub fn state(&self) -> &KeeperState {
        &self.state
    }

    /// The `(system_identifier, group)` pair recorded at registration must
    /// match the data directory and configuration; running against the wrong
    /// directory or group risks feeding the monitor another cluster's
    /// positions.
    pub async fn verify_system_identity(&mut self) -> Result<(), KeeperError> {
        if let Some(group) = self.config.pg_autoctl.group
            && group != self.state.current_group
        {
            return Err(KeeperError::Fatal(format!(
                "group mismatch: configuration says group {group}, state file has {}; \
                 refusing to run with the wrong group",
                self.state.current_group
            )));
        }
        if matches!(
            self.state.current_role,
            NodeRole::NoState | NodeRole::Init | NodeRole::WaitStandby
        ) {
            // No data directory is expected to exist yet.
            return Ok(());
        }
        let control = self.pg.control_data().await?;
        if self.state.system_identifier != 0
            && control.system_identifier != self.state.system_identifier
        {
            return Err(KeeperError::Fatal(format!(
                "system identifier mismatch: state file has {}, data directory has {}; \
                 refusing to run against the wrong data directory",
                self.state.system_identifier, control.system_identifier
            )));
        }
        self.state.system_identifier = control.system_identifier;
        self.state.pg_control_version = control.pg_control_version;
        self.state.catalog_version = control.catalog_version;
        Ok(())
    }

    /// One pass of the protocol: probe, report, transition, persist.
    pub async fn tick_once(&mut self) -> Result<TickOutcome, KeeperError> {
        let local = self.pg.probe().await;
        if local.current_lsn.is_valid() {
            self.state.xlog_location = local.current_lsn.0;
        }

        let report = NodeActiveReport {
            formation: self.config.pg_autoctl.formation.clone(),
            nodename: self.config.nodename().to_string(),
            port: self.config.postgresql.port,
            node_id: self.state.current_node_id,
            group_id: self.state.current_group,
            current_role: self.state.current_role,
            pg_is_running: local.pg_is_running,
            current_lsn: local.current_lsn,
            sync_state: local.pgsr_sync_state.clone(),
        };

        let mut outcome = TickOutcome {
            monitor_ok: false,
            assigned: self.state.assigned_role,
            transitioned: false,
        };

        match self.monitor.node_active(&report).await {
            Err(e) => {
                self.monitor_failures += 1;
                if self.monitor_failures == MONITOR_FAILURE_WARN_TICKS {
                    warn!(
                        "monitor unreachable for {} consecutive ticks ({e}); \
                         keeping role {} until the monitor decides otherwise",
                        self.monitor_failures, self.state.current_role
                    );
                } else {
                    debug!("node_active failed: {e}");
                }
            }
            Ok(reply) => {
                self.monitor_failures = 0;
                self.state.touch_monitor_contact();
                outcome.monitor_ok = true;

                if reply.nodes_version != self.state.current_nodes_version {
                    debug!(
                        "group membership changed (version {} -> {}); refreshing HBA",
                        self.state.current_nodes_version, reply.nodes_version
                    );
                    self.refresh_hba().await;
                    self.state.current_nodes_version = reply.nodes_version;
                }

                self.state.assigned_role = reply.assigned_role;
                outcome.assigned = reply.assigned_role;

                if reply.assigned_role != self.state.current_role {
                    outcome.transitioned = self
                        .converge(self.state.current_role, reply.assigned_role)
                        .await?;
                }
            }
        }

        self.state_file.write(&self.state)?;
        Ok(outcome)
    }

    /// Executes the planned transition; only non-retryable errors bubble.
    async fn converge(
        &mut self,
        current: NodeRole,
        assigned: NodeRole,
    ) -> Result<bool, KeeperError> {
        match fsm::plan(current, assigned) {
            Plan::Stay => Ok(false),
            Plan::Unsupported => {
                error!("no transition from {current} to {assigned}; waiting for the monitor");
                Ok(false)
            }
            Plan::Step(action) => {
                info!("transition {current} -> {assigned}: {action:?}");
                let mut ctx = TransitionContext {
                    pg: self.pg.as_ref(),
                    monitor: self.monitor.as_ref(),
                    config: &self.config,
                    state: &mut self.state,
                };
                match fsm::execute(&mut ctx, action).await {
                    Ok(()) => {
                        self.state.current_role = assigned;
                        info!("now in role {assigned}");
                        Ok(true)
                    }
                    Err(
                        e @ (KeeperError::Transient(_)
                        | KeeperError::Monitor(_)
                        | KeeperError::Protocol(_)),
                    ) => {
                        warn!("transition {current} -> {assigned} failed: {e}; will retry");
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn refresh_hba(&self) {
        match self.monitor.get_other_nodes(self.state.current_node_id).await {
            Ok(peers) => {
                if let Err(e) = self.pg.ensure_hba_rules_for(&peers).await {
                    warn!("HBA refresh failed: {e}; retrying next membership change");
                }
            }
            Err(e) => warn!("could not list peer nodes for the HBA refresh: {e}"),
        }
    }

    fn reload_config(&mut self) {
        let new = match KeeperConfig::from_file(&self.config_path) {
            Ok(new) => new,
            Err(e) => {
                error!("configuration reload failed: {e:#}; keeping the current settings");
                return;
            }
        };
        let diff = config::diff_for_reload(&self.config, &new);
        if diff.is_empty() {
            info!("configuration unchanged");
            return;
        }
        for field in &diff.needs_restart {
            warn!("change to {field} requires a restart; ignoring until then");
        }
        if !diff.safe.is_empty() {
            config::apply_reload(&mut self.config, &new);
            // The new name and port reach the monitor with the next
            // node_active report.
            info!("applied configuration changes: {}", diff.safe.join(", "));
        }
    }

    /// The service entry point: tick until told to stop. Smart shutdown lets
    /// a tick in flight finish; fast and immediate interrupt it.
    pub async fn run(
        mut self,
        mut shutdown_rx: broadcast::Receiver<ShutdownMode>,
        mut reload_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        self.verify_system_identity().await?;

        info!(
            "keeper started: node {} in formation \"{}\" group {}, role {} (assigned {})",
            self.state.current_node_id,
            self.config.pg_autoctl.formation,
            self.state.current_group,
            self.state.current_role,
            self.state.assigned_role
        );

        let mut interval = tokio::time::interval(self.config.pg_autoctl.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut stop_after_tick = false;
                    {
                        let tick = self.tick_once();
                        tokio::pin!(tick);
                        loop {
                            tokio::select! {
                                res = &mut tick => {
                                    res?;
                                    break;
                                }
                                mode = shutdown_rx.recv() => {
                                    match mode {
                                        Ok(ShutdownMode::Smart) | Err(_) => {
                                            stop_after_tick = true;
                                        }
                                        Ok(mode) => {
                                            info!("interrupting the current tick ({mode:?} shutdown)");
                                            return Ok(());
                                        }
                                    }
                                }
                            }
                        }
                    }
                    if stop_after_tick {
                        info!("keeper stopping after finishing its tick");
                        return Ok(());
                    }
                    if self.state.current_role == NodeRole::Dropped {
                        info!("node has been dropped; keeper exiting");
                        return Ok(());
                    }
                }
                mode = shutdown_rx.recv() => {
                    if let Ok(mode) = mode {
                        info!("keeper stopping ({mode:?} shutdown)");
                    }
                    return Ok(());
                }
                _ = reload_rx.recv() => {
                    self.reload_config();
                }
            }
        }
    }
}
