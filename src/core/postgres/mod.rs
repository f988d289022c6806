// src/core/postgres/mod.rs

//! The local Postgres controller: probing, lifecycle, replication plumbing.
//!
//! Everything the state machine does to the local instance goes through the
//! [`PostgresAdmin`] trait so transitions can be exercised against a fake in
//! tests. The production implementation, [`LocalPostgres`], drives the
//! instance through `pg_ctl` and friends plus a short-lived local SQL
//! connection per probe.

pub mod conf;
pub mod ctl;
pub mod hba;
pub mod lsn;

use crate::config::KeeperConfig;
use crate::core::monitor::NodeAddress;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use ctl::{ControlData, PgCtl, StopMode};
pub use lsn::Lsn;

/// Failure categories of the local controller. `Transient` is retried on the
/// next tick and never advances the state machine; `Config` needs operator
/// action; `Fatal` means the data directory cannot be trusted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PgError {
    #[error("transient postgres error: {0}")]
    Transient(String),

    #[error("postgres configuration error: {0}")]
    Config(String),

    #[error("fatal postgres error: {0}")]
    Fatal(String),
}

impl From<PgError> for crate::core::errors::KeeperError {
    fn from(e: PgError) -> Self {
        use crate::core::errors::KeeperError;
        match e {
            PgError::Transient(msg) => KeeperError::Transient(msg),
            PgError::Config(msg) => KeeperError::Config(msg),
            PgError::Fatal(msg) => KeeperError::Fatal(msg),
        }
    }
}

/// Snapshot of the local instance, refreshed every tick. When the server
/// cannot be reached the stale-value fallback is `running: false`, invalid
/// LSN, and an empty sync state; the monitor tolerates this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPostgresState {
    pub pg_is_running: bool,
    pub is_in_recovery: bool,
    pub current_lsn: Lsn,
    pub pgsr_sync_state: String,
    pub wal_lag_bytes: Option<u64>,
}

impl Default for LocalPostgresState {
    fn default() -> Self {
        Self {
            pg_is_running: false,
            is_in_recovery: false,
            current_lsn: Lsn::INVALID,
            pgsr_sync_state: String::new(),
            wal_lag_bytes: None,
        }
    }
}

/// The contract between the state machine and the local instance. Every
/// operation is idempotent where the underlying tool allows it: callers may
/// repeat a call after a crash and converge to the same outcome.
#[async_trait]
pub trait PostgresAdmin: Send + Sync {
    /// Refreshes the cached view of the local instance. Infallible by
    /// design: probe failures degrade to the default state.
    async fn probe(&self) -> LocalPostgresState;

    async fn is_running(&self) -> bool;
    async fn ensure_running(&self) -> Result<(), PgError>;
    async fn ensure_stopped(&self, mode: StopMode) -> Result<(), PgError>;
    async fn reload(&self) -> Result<(), PgError>;

    /// Runs initdb when the data directory does not exist yet. Returns true
    /// when a new directory was created.
    async fn init_if_needed(&self) -> Result<bool, PgError>;

    /// `pg_ctl promote`, then waits until the server reports a writable
    /// state.
    async fn promote(&self) -> Result<(), PgError>;

    /// Writes standby configuration pointing at the given upstream;
    /// restarts the server when asked to and it is running.
    async fn follow(
        &self,
        primary: &NodeAddress,
        slot_name: &str,
        application_name: &str,
        restart: bool,
    ) -> Result<(), PgError>;

    /// True when standby configuration is in place.
    async fn is_following(&self) -> Result<bool, PgError>;

    /// Replaces the data directory with a fresh base backup streamed from
    /// the given upstream.
    async fn base_backup_from(&self, primary: &NodeAddress) -> Result<(), PgError>;

    /// `pg_rewind` against the given upstream, falling back to a fresh base
    /// backup on any transient rewind failure.
    async fn rewind_from(&self, primary: &NodeAddress) -> Result<(), PgError>;

    async fn create_replication_slot(&self, name: &str) -> Result<(), PgError>;
    async fn drop_replication_slot(&self, name: &str) -> Result<(), PgError>;

    /// Commits the expression on the primary and reloads.
    async fn set_synchronous_standby_names(&self, expression: &str) -> Result<(), PgError>;

    /// Toggles `default_transaction_read_only`, the write-blocking gate used
    /// when staging a scheduled failover.
    async fn set_transaction_read_only(&self, read_only: bool) -> Result<(), PgError>;

    /// Pauses WAL replay so the reported LSN is final.
    async fn pause_wal_replay(&self) -> Result<(), PgError>;

    /// Clears `primary_conninfo` so the standby stops streaming.
    async fn drop_primary_conninfo(&self) -> Result<(), PgError>;

    /// True when at least one standby is streaming from this primary.
    async fn has_streaming_standby(&self) -> Result<bool, PgError>;

    /// Guarantees HBA rules for every peer; reloads when the file changed.
    async fn ensure_hba_rules_for(&self, peers: &[NodeAddress]) -> Result<(), PgError>;

    async fn control_data(&self) -> Result<ControlData, PgError>;

    /// Shared flag read by the postgres supervisor service: when set, a dead
    /// postmaster gets restarted.
    fn expected_up(&self) -> Arc<AtomicBool>;
}

/// Production controller for the data directory named in the configuration.
pub struct LocalPostgres {
    ctl: PgCtl,
    pgdata: PathBuf,
    host: String,
    port: u16,
    dbname: String,
    user: String,
    replication_user: String,
    auth_method: String,
    ssl_active: bool,
    sslmode: String,
    skip_hba: bool,
    maximum_backup_rate: Option<String>,
    expected_up: Arc<AtomicBool>,
}

impl LocalPostgres {
    pub fn from_config(config: &KeeperConfig) -> Self {
        let pg = &config.postgresql;
        Self {
            ctl: PgCtl::new(
                pg.pg_ctl.clone(),
                pg.pgdata.clone(),
                pg.port,
                pg.listen_addresses.clone(),
            ),
            pgdata: pg.pgdata.clone(),
            host: pg.host.clone(),
            port: pg.port,
            dbname: pg.dbname.clone(),
            user: pg.user.clone(),
            replication_user: config.replication.username.clone(),
            auth_method: config.pg_autoctl.auth_method.clone(),
            ssl_active: config.ssl.active,
            sslmode: config.ssl.sslmode.clone(),
            skip_hba: config.pg_autoctl.skip_pg_hba,
            maximum_backup_rate: config.replication.maximum_backup_rate.clone(),
            expected_up: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn local_client(&self) -> Result<tokio_postgres::Client, PgError> {
        let mut cfg = tokio_postgres::Config::new();
        cfg.host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname)
            .application_name("pgward")
            .connect_timeout(Duration::from_secs(2));
        let (client, connection) = cfg
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| PgError::Transient(format!("local connection: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("local postgres connection closed: {e}");
            }
        });
        Ok(client)
    }

    async fn execute_local(&self, sql: &str) -> Result<(), PgError> {
        let client = self.local_client().await?;
        client
            .batch_execute(sql)
            .await
            .map_err(|e| PgError::Transient(format!("{sql}: {e}")))
    }

    /// Conninfo used for `pg_rewind --source-server` and base backups.
    fn upstream_conninfo(&self, primary: &NodeAddress) -> String {
        format!(
            "host={} port={} user={} dbname={} sslmode={}",
            primary.host, primary.port, self.replication_user, self.dbname, self.sslmode
        )
    }

    /// Guarantees HBA access for one host; used for peers and the monitor.
    pub fn ensure_hba_for_host(
        &self,
        host: &str,
        username: &str,
        include_replication: bool,
    ) -> Result<bool, PgError> {
        if self.skip_hba {
            return Ok(false);
        }
        let path = self.pgdata.join("pg_hba.conf");
        if include_replication {
            hba::ensure_rules_for_peer(
                &path,
                self.ssl_active,
                &self.dbname,
                username,
                host,
                &self.auth_method,
            )
        } else {
            let rule = hba::HbaRule {
                connection: hba::ConnectionType::for_ssl(self.ssl_active),
                database: hba::HbaDatabase::Named(self.dbname.clone()),
                username: username.to_string(),
                address: hba::hba_address_for_host(host),
                auth_method: self.auth_method.clone(),
            };
            hba::ensure_host_rule_exists(&path, &rule)
        }
    }
}

#[async_trait]
impl PostgresAdmin for LocalPostgres {
    async fn probe(&self) -> LocalPostgresState {
        match self.ctl.status().await {
            Ok(true) => {}
            _ => return LocalPostgresState::default(),
        }

        let client = match self.local_client().await {
            Ok(c) => c,
            Err(e) => {
                debug!("probe fell back to defaults: {e}");
                return LocalPostgresState::default();
            }
        };

        let sql = "SELECT pg_is_in_recovery() AS in_recovery, \
                   (CASE WHEN pg_is_in_recovery() THEN pg_last_wal_replay_lsn() \
                         ELSE pg_current_wal_lsn() END)::text AS lsn, \
                   COALESCE((SELECT string_agg(sync_state, ',' ORDER BY application_name) \
                             FROM pg_stat_replication), '') AS sync_state, \
                   (CASE WHEN pg_is_in_recovery() \
                         THEN pg_wal_lsn_diff(pg_last_wal_receive_lsn(), \
                                              pg_last_wal_replay_lsn())::bigint \
                         ELSE NULL END) AS lag";
        match client.query_one(sql, &[]).await {
            Ok(row) => {
                let in_recovery: bool = row.get(0);
                let lsn: Option<String> = row.get(1);
                let sync_state: String = row.get(2);
                let lag: Option<i64> = row.get(3);
                LocalPostgresState {
                    pg_is_running: true,
                    is_in_recovery: in_recovery,
                    current_lsn: lsn.map(|s| Lsn::parse_lenient(&s)).unwrap_or(Lsn::INVALID),
                    pgsr_sync_state: sync_state,
                    wal_lag_bytes: lag.map(|v| v.max(0) as u64),
                }
            }
            Err(e) => {
                debug!("probe query failed: {e}");
                LocalPostgresState::default()
            }
        }
    }

    async fn is_running(&self) -> bool {
        self.ctl.status().await.unwrap_or(false)
    }

    async fn ensure_running(&self) -> Result<(), PgError> {
        self.expected_up.store(true, Ordering::SeqCst);
        self.ctl.start().await
    }

    async fn ensure_stopped(&self, mode: StopMode) -> Result<(), PgError> {
        self.expected_up.store(false, Ordering::SeqCst);
        self.ctl.stop(mode).await
    }

    async fn reload(&self) -> Result<(), PgError> {
        self.ctl.reload().await
    }

    async fn init_if_needed(&self) -> Result<bool, PgError> {
        self.ctl.init(&self.auth_method).await
    }

    async fn promote(&self) -> Result<(), PgError> {
        let state = self.probe().await;
        if state.pg_is_running && !state.is_in_recovery {
            return Ok(());
        }
        if !state.pg_is_running {
            self.ensure_running().await?;
        }

        self.ctl.promote().await?;

        // pg_ctl -w already waits, but confirm the server answers writable.
        for _ in 0..30 {
            let state = self.probe().await;
            if state.pg_is_running && !state.is_in_recovery {
                // The server dropped out of recovery on its own; clear the
                // leftover standby settings and the write block.
                conf::remove_standby_setup(&self.pgdata, self.ctl.pg_major()?)?;
                let _ = self.set_transaction_read_only(false).await;
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(PgError::Transient(
            "server did not report a writable state after promotion".into(),
        ))
    }

    async fn follow(
        &self,
        primary: &NodeAddress,
        slot_name: &str,
        application_name: &str,
        restart: bool,
    ) -> Result<(), PgError> {
        let major = self.ctl.pg_major()?;
        let conninfo = conf::primary_conninfo(
            &primary.host,
            primary.port,
            &self.replication_user,
            application_name,
            &self.sslmode,
        );
        conf::setup_standby_mode(&self.pgdata, major, &conninfo, slot_name)?;
        info!(
            "now configured to follow {}:{} (slot {})",
            primary.host, primary.port, slot_name
        );
        if restart && self.is_running().await {
            self.ctl.restart().await?;
        }
        Ok(())
    }

    async fn is_following(&self) -> Result<bool, PgError> {
        let major = self.ctl.pg_major()?;
        Ok(conf::standby_setup_present(&self.pgdata, major))
    }

    async fn base_backup_from(&self, primary: &NodeAddress) -> Result<(), PgError> {
        self.ensure_stopped(StopMode::Fast).await?;

        // Move any previous data directory aside; pg_basebackup needs an
        // absent target.
        let backup_dir = self.pgdata.with_extension("old");
        if self.pgdata.exists() {
            if backup_dir.exists() {
                std::fs::remove_dir_all(&backup_dir).map_err(|e| {
                    PgError::Transient(format!("removing {}: {e}", backup_dir.display()))
                })?;
            }
            std::fs::rename(&self.pgdata, &backup_dir).map_err(|e| {
                PgError::Transient(format!("moving {} aside: {e}", self.pgdata.display()))
            })?;
            info!("moved previous data directory to {}", backup_dir.display());
        }

        let slot = conf::replication_slot_name(primary.node_id);
        self.ctl
            .basebackup(
                &primary.host,
                primary.port,
                &self.replication_user,
                &slot,
                self.maximum_backup_rate.as_deref(),
            )
            .await?;

        if backup_dir.exists() {
            let _ = std::fs::remove_dir_all(&backup_dir);
        }
        Ok(())
    }

    async fn rewind_from(&self, primary: &NodeAddress) -> Result<(), PgError> {
        self.ensure_stopped(StopMode::Fast).await?;
        match self.ctl.rewind(&self.upstream_conninfo(primary)).await {
            Ok(()) => Ok(()),
            Err(PgError::Transient(msg)) => {
                warn!("pg_rewind failed ({msg}); falling back to a fresh base backup");
                self.base_backup_from(primary).await
            }
            Err(e) => Err(e),
        }
    }

    async fn create_replication_slot(&self, name: &str) -> Result<(), PgError> {
        let client = self.local_client().await?;
        let exists = client
            .query_opt(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&name],
            )
            .await
            .map_err(|e| PgError::Transient(format!("querying replication slots: {e}")))?;
        if exists.is_some() {
            return Ok(());
        }
        client
            .execute("SELECT pg_create_physical_replication_slot($1)", &[&name])
            .await
            .map_err(|e| PgError::Transient(format!("creating slot {name}: {e}")))?;
        info!("created replication slot {name}");
        Ok(())
    }

    async fn drop_replication_slot(&self, name: &str) -> Result<(), PgError> {
        let client = self.local_client().await?;
        let exists = client
            .query_opt(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&name],
            )
            .await
            .map_err(|e| PgError::Transient(format!("querying replication slots: {e}")))?;
        if exists.is_none() {
            return Ok(());
        }
        client
            .execute("SELECT pg_drop_replication_slot($1)", &[&name])
            .await
            .map_err(|e| PgError::Transient(format!("dropping slot {name}: {e}")))?;
        Ok(())
    }

    async fn set_synchronous_standby_names(&self, expression: &str) -> Result<(), PgError> {
        let escaped = expression.replace('\'', "''");
        self.execute_local(&format!(
            "ALTER SYSTEM SET synchronous_standby_names TO '{escaped}'"
        ))
        .await?;
        self.execute_local("SELECT pg_reload_conf()").await?;
        info!("synchronous_standby_names set to '{expression}'");
        Ok(())
    }

    async fn set_transaction_read_only(&self, read_only: bool) -> Result<(), PgError> {
        let value = if read_only { "on" } else { "off" };
        self.execute_local(&format!(
            "ALTER SYSTEM SET default_transaction_read_only TO {value}"
        ))
        .await?;
        self.execute_local("SELECT pg_reload_conf()").await
    }

    async fn pause_wal_replay(&self) -> Result<(), PgError> {
        let client = self.local_client().await?;
        let paused = client
            .query_one("SELECT pg_is_wal_replay_paused()", &[])
            .await
            .map_err(|e| PgError::Transient(format!("querying replay state: {e}")))?;
        if paused.get::<_, bool>(0) {
            return Ok(());
        }
        self.execute_local("SELECT pg_wal_replay_pause()").await
    }

    async fn drop_primary_conninfo(&self) -> Result<(), PgError> {
        self.execute_local("ALTER SYSTEM SET primary_conninfo TO ''")
            .await?;
        self.execute_local("SELECT pg_reload_conf()").await?;
        // primary_conninfo only became reloadable in Postgres 13.
        if self.ctl.pg_major()? < 13 && self.is_running().await {
            self.ctl.restart().await?;
        }
        Ok(())
    }

    async fn has_streaming_standby(&self) -> Result<bool, PgError> {
        let client = self.local_client().await?;
        let row = client
            .query_one(
                "SELECT count(*) FROM pg_stat_replication WHERE state = 'streaming'",
                &[],
            )
            .await
            .map_err(|e| PgError::Transient(format!("querying pg_stat_replication: {e}")))?;
        Ok(row.get::<_, i64>(0) > 0)
    }

    async fn ensure_hba_rules_for(&self, peers: &[NodeAddress]) -> Result<(), PgError> {
        if self.skip_hba {
            debug!("HBA editing disabled; skipping rules for {} peers", peers.len());
            return Ok(());
        }
        let mut changed = false;
        for peer in peers {
            changed |= self.ensure_hba_for_host(&peer.host, &self.replication_user, true)?;
        }
        if changed && self.is_running().await {
            self.reload().await?;
        }
        Ok(())
    }

    async fn control_data(&self) -> Result<ControlData, PgError> {
        self.ctl.controldata().await
    }

    fn expected_up(&self) -> Arc<AtomicBool> {
        self.expected_up.clone()
    }
}

/// Kills the postmaster the hard way; last resort of the immediate shutdown
/// path when `pg_ctl stop -m immediate` itself fails.
pub fn kill_postmaster(pgdata: &std::path::Path) -> bool {
    let pidfile = pgdata.join("postmaster.pid");
    let Ok(text) = std::fs::read_to_string(&pidfile) else {
        return false;
    };
    let Some(pid) = text.lines().next().and_then(|l| l.trim().parse::<i32>().ok()) else {
        return false;
    };
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) == 0 }
}
