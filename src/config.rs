// src/config.rs

//! Keeper configuration: loading, defaults, validation, and reload rules.
//!
//! The on-disk format is TOML with the `[pg_autoctl]`, `[postgresql]`,
//! `[replication]` and `[ssl]` sections. The file lives under
//! `$XDG_CONFIG_HOME`, keyed by the data directory it describes; state and
//! PID files live under `$XDG_DATA_HOME` next to each other.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Whether this keeper supervises a data node or a monitor node. On monitor
/// nodes the notification listener service runs alongside Postgres.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Keeper,
    Monitor,
}

/// The `[pg_autoctl]` section: node identity and keeper behavior.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KeeperSection {
    #[serde(default)]
    pub role: NodeKind,

    /// `postgres://` URI of the monitor.
    #[serde(default)]
    pub monitor: String,

    #[serde(default = "default_formation")]
    pub formation: String,

    /// Replication group inside the formation; assigned by the monitor when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<i32>,

    /// The node name reported to the monitor.
    #[serde(default)]
    pub name: String,

    /// The host other nodes use to reach this one.
    #[serde(default)]
    pub hostname: String,

    #[serde(default = "default_auth_method")]
    pub auth_method: String,

    /// Leave pg_hba.conf entirely to the operator.
    #[serde(default)]
    pub skip_pg_hba: bool,

    /// Keeper tick period.
    #[serde(with = "humantime_serde", default = "default_tick")]
    pub tick: Duration,

    /// How long shutdown waits for services before escalating.
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

fn default_formation() -> String {
    "default".to_string()
}
fn default_auth_method() -> String {
    "trust".to_string()
}
fn default_tick() -> Duration {
    Duration::from_secs(5)
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for KeeperSection {
    fn default() -> Self {
        Self {
            role: NodeKind::default(),
            monitor: String::new(),
            formation: default_formation(),
            group: None,
            name: String::new(),
            hostname: String::new(),
            auth_method: default_auth_method(),
            skip_pg_hba: false,
            tick: default_tick(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// The `[postgresql]` section: how to reach and drive the local instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PostgresSection {
    pub pgdata: PathBuf,

    #[serde(default = "default_pg_ctl")]
    pub pg_ctl: PathBuf,

    #[serde(default = "default_dbname")]
    pub dbname: String,

    /// Host for the keeper's own local connections.
    #[serde(default = "default_local_host")]
    pub host: String,

    #[serde(default = "default_pgport")]
    pub port: u16,

    /// Role the keeper connects as.
    #[serde(default = "default_pguser")]
    pub user: String,

    #[serde(default = "default_listen_addresses")]
    pub listen_addresses: String,
}

fn default_pg_ctl() -> PathBuf {
    PathBuf::from("pg_ctl")
}
fn default_dbname() -> String {
    "postgres".to_string()
}
fn default_local_host() -> String {
    "localhost".to_string()
}
fn default_pgport() -> u16 {
    5432
}
fn default_pguser() -> String {
    "postgres".to_string()
}
fn default_listen_addresses() -> String {
    "*".to_string()
}

impl Default for PostgresSection {
    fn default() -> Self {
        Self {
            pgdata: PathBuf::new(),
            pg_ctl: default_pg_ctl(),
            dbname: default_dbname(),
            host: default_local_host(),
            port: default_pgport(),
            user: default_pguser(),
            listen_addresses: default_listen_addresses(),
        }
    }
}

/// The `[replication]` section.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReplicationSection {
    #[serde(default = "default_replication_user")]
    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Passed through to `pg_basebackup --max-rate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_backup_rate: Option<String>,

    /// Replay lag under which a catching-up standby counts as caught up.
    #[serde(default = "default_catchup_max_lag_bytes")]
    pub catchup_max_lag_bytes: u64,
}

fn default_replication_user() -> String {
    "pgautofailover_replicator".to_string()
}
fn default_catchup_max_lag_bytes() -> u64 {
    16 * 1024 * 1024
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            username: default_replication_user(),
            password: None,
            maximum_backup_rate: None,
            catchup_max_lag_bytes: default_catchup_max_lag_bytes(),
        }
    }
}

/// The `[ssl]` section.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SslSection {
    #[serde(default)]
    pub active: bool,

    #[serde(default = "default_sslmode")]
    pub sslmode: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crl_file: Option<PathBuf>,
}

fn default_sslmode() -> String {
    "prefer".to_string()
}

impl Default for SslSection {
    fn default() -> Self {
        Self {
            active: false,
            sslmode: default_sslmode(),
            cert_file: None,
            key_file: None,
            ca_file: None,
            crl_file: None,
        }
    }
}

/// The complete, validated keeper configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct KeeperConfig {
    #[serde(default)]
    pub pg_autoctl: KeeperSection,
    pub postgresql: PostgresSection,
    #[serde(default)]
    pub replication: ReplicationSection,
    #[serde(default)]
    pub ssl: SslSection,
}

impl KeeperConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{}'", path.display()))?;
        let config: KeeperConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create '{}'", dir.display()))?;
        }
        let contents =
            toml::to_string_pretty(self).context("failed to serialize configuration")?;
        fs::write(path, contents)
            .with_context(|| format!("failed to write '{}'", path.display()))
    }

    /// Rejects logically inconsistent configurations.
    pub fn validate(&self) -> Result<()> {
        if self.postgresql.pgdata.as_os_str().is_empty() {
            return Err(anyhow!("postgresql.pgdata cannot be empty"));
        }
        if self.postgresql.port == 0 {
            return Err(anyhow!("postgresql.port cannot be 0"));
        }
        if self.pg_autoctl.formation.trim().is_empty() {
            return Err(anyhow!("pg_autoctl.formation cannot be empty"));
        }
        if self.pg_autoctl.auth_method.trim().is_empty() {
            return Err(anyhow!("pg_autoctl.auth_method cannot be empty"));
        }
        if let Some(group) = self.pg_autoctl.group
            && group < 0
        {
            return Err(anyhow!("pg_autoctl.group cannot be negative"));
        }
        if self.pg_autoctl.tick < Duration::from_secs(1) {
            return Err(anyhow!("pg_autoctl.tick must be at least 1s"));
        }
        match self.pg_autoctl.role {
            NodeKind::Keeper => {
                let uri = self.pg_autoctl.monitor.trim();
                if uri.is_empty() {
                    return Err(anyhow!("pg_autoctl.monitor is required on a keeper node"));
                }
                if !uri.starts_with("postgres://") && !uri.starts_with("postgresql://") {
                    return Err(anyhow!(
                        "pg_autoctl.monitor must be a postgres:// URI, got '{uri}'"
                    ));
                }
            }
            NodeKind::Monitor => {}
        }
        if self.ssl.active && self.ssl.cert_file.is_none() != self.ssl.key_file.is_none() {
            return Err(anyhow!(
                "ssl.cert_file and ssl.key_file must be set together"
            ));
        }
        Ok(())
    }

    /// The application_name / slot naming, HBA rules, and monitor reports
    /// all use the node name; fall back to the hostname when unset.
    pub fn nodename(&self) -> &str {
        if self.pg_autoctl.name.is_empty() {
            &self.pg_autoctl.hostname
        } else {
            &self.pg_autoctl.name
        }
    }

    pub fn paths(&self) -> FilePaths {
        FilePaths::for_pgdata(&self.postgresql.pgdata)
    }
}

/// Classification of a config reload: which changed fields apply live and
/// which are ignored until restart. Roles and the node id never come from
/// the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadDiff {
    pub safe: Vec<&'static str>,
    pub needs_restart: Vec<&'static str>,
}

impl ReloadDiff {
    pub fn is_empty(&self) -> bool {
        self.safe.is_empty() && self.needs_restart.is_empty()
    }
}

/// Compares two configurations field by field. Reload-safe: node name,
/// hostname, port, and the ssl section.
pub fn diff_for_reload(old: &KeeperConfig, new: &KeeperConfig) -> ReloadDiff {
    let mut diff = ReloadDiff::default();

    if old.pg_autoctl.name != new.pg_autoctl.name {
        diff.safe.push("pg_autoctl.name");
    }
    if old.pg_autoctl.hostname != new.pg_autoctl.hostname {
        diff.safe.push("pg_autoctl.hostname");
    }
    if old.postgresql.port != new.postgresql.port {
        diff.safe.push("postgresql.port");
    }
    if old.ssl != new.ssl {
        diff.safe.push("ssl");
    }

    if old.pg_autoctl.role != new.pg_autoctl.role {
        diff.needs_restart.push("pg_autoctl.role");
    }
    if old.pg_autoctl.monitor != new.pg_autoctl.monitor {
        diff.needs_restart.push("pg_autoctl.monitor");
    }
    if old.pg_autoctl.formation != new.pg_autoctl.formation {
        diff.needs_restart.push("pg_autoctl.formation");
    }
    if old.pg_autoctl.group != new.pg_autoctl.group {
        diff.needs_restart.push("pg_autoctl.group");
    }
    if old.pg_autoctl.tick != new.pg_autoctl.tick {
        diff.needs_restart.push("pg_autoctl.tick");
    }
    if old.postgresql.pgdata != new.postgresql.pgdata {
        diff.needs_restart.push("postgresql.pgdata");
    }
    if old.postgresql.pg_ctl != new.postgresql.pg_ctl {
        diff.needs_restart.push("postgresql.pg_ctl");
    }
    if old.replication != new.replication {
        diff.needs_restart.push("replication");
    }

    diff
}

/// Applies the reload-safe fields of `new` onto `config`.
pub fn apply_reload(config: &mut KeeperConfig, new: &KeeperConfig) {
    config.pg_autoctl.name = new.pg_autoctl.name.clone();
    config.pg_autoctl.hostname = new.pg_autoctl.hostname.clone();
    config.postgresql.port = new.postgresql.port;
    config.ssl = new.ssl.clone();
}

/// Locations of the config, state, and PID files for one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePaths {
    pub config: PathBuf,
    pub state: PathBuf,
    pub pid: PathBuf,
}

impl FilePaths {
    /// Derives the per-PGDATA file layout from the XDG base directories.
    pub fn for_pgdata(pgdata: &Path) -> FilePaths {
        let key = pgdata_key(pgdata);

        let config_home = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".config"));
        let data_home = std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".local").join("share"));

        let config_dir = config_home.join("pgward").join(&key);
        let data_dir = data_home.join("pgward").join(&key);

        FilePaths {
            config: config_dir.join("pgward.cfg"),
            state: data_dir.join("pgward.state"),
            pid: data_dir.join("pgward.pid"),
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Turns a data directory path into a single stable path component.
pub fn pgdata_key(pgdata: &Path) -> String {
    let absolute = if pgdata.is_absolute() {
        pgdata.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(pgdata)
    };
    let mut key = absolute
        .to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, "_");
    while key.starts_with('_') {
        key.remove(0);
    }
    if key.is_empty() {
        key.push_str("root");
    }
    key
}
