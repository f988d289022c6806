// src/core/monitor/mod.rs

//! The monitor client: the keeper's only channel to the cluster arbiter.
//!
//! Every call is a `SELECT * FROM pgautofailover.<fn>(...)` against the
//! monitor's Postgres; replies are ordered tuples. Calls are idempotent at
//! tick granularity and a transport failure is never a state transition:
//! the keeper keeps its role and retries on the next tick.

pub mod notifications;

use crate::core::errors::KeeperError;
use crate::core::postgres::lsn::Lsn;
use crate::core::roles::NodeRole;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error};

/// Address and standing of a peer node, as reported by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub node_id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub lsn: Lsn,
    pub is_primary: bool,
}

/// Reply tuple of `pgautofailover.register_node`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterReply {
    pub node_id: i64,
    pub group_id: i32,
    pub assigned_role: NodeRole,
}

/// Everything the keeper reports in one `node_active` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeActiveReport {
    pub formation: String,
    pub nodename: String,
    pub port: u16,
    pub node_id: i64,
    pub group_id: i32,
    pub current_role: NodeRole,
    pub pg_is_running: bool,
    pub current_lsn: Lsn,
    pub sync_state: String,
}

/// Reply tuple of `pgautofailover.node_active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeActiveReply {
    pub node_id: i64,
    pub group_id: i32,
    pub assigned_role: NodeRole,
    pub candidate_priority: Option<i32>,
    pub replication_quorum: Option<bool>,
    pub nodes_version: i32,
}

/// The monitor RPC surface. Production uses [`MonitorClient`]; tests provide
/// fakes behind the same trait.
#[async_trait]
pub trait MonitorLink: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn register_node(
        &self,
        formation: &str,
        group_id: Option<i32>,
        nodename: &str,
        host: &str,
        port: u16,
        system_identifier: u64,
        wanted_initial_state: NodeRole,
    ) -> Result<RegisterReply, KeeperError>;

    async fn node_active(&self, report: &NodeActiveReport)
    -> Result<NodeActiveReply, KeeperError>;

    async fn get_primary(&self, formation: &str, group_id: i32)
    -> Result<NodeAddress, KeeperError>;

    async fn get_other_nodes(&self, node_id: i64) -> Result<Vec<NodeAddress>, KeeperError>;

    async fn start_maintenance(&self, node_id: i64) -> Result<bool, KeeperError>;
    async fn stop_maintenance(&self, node_id: i64) -> Result<bool, KeeperError>;
    async fn remove_node(&self, node_id: i64) -> Result<(), KeeperError>;
}

/// A lazily connected client for the monitor's Postgres. The connection is
/// rebuilt transparently after any transport error.
pub struct MonitorClient {
    config: tokio_postgres::Config,
    ca_file: Option<std::path::PathBuf>,
    client: Mutex<Option<Client>>,
}

impl MonitorClient {
    /// Builds a client from a `postgres://` URI, as stored in the
    /// `[pg_autoctl] monitor` setting.
    pub fn new(uri: &str, ca_file: Option<std::path::PathBuf>) -> Result<Self, KeeperError> {
        let mut config: tokio_postgres::Config = uri
            .parse()
            .map_err(|e| KeeperError::Config(format!("invalid monitor URI '{uri}': {e}")))?;
        config.application_name("pgward");
        config.connect_timeout(Duration::from_secs(5));
        Ok(Self {
            config,
            ca_file,
            client: Mutex::new(None),
        })
    }

    async fn connect(&self) -> Result<Client, KeeperError> {
        let client = if self.config.get_ssl_mode() == SslMode::Disable {
            let (client, connection) = self
                .config
                .connect(NoTls)
                .await
                .map_err(|e| KeeperError::Monitor(format!("connecting to monitor: {e}")))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!("monitor connection closed: {e}");
                }
            });
            client
        } else {
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(rustls_client_config(
                self.ca_file.as_deref(),
            )?);
            let (client, connection) = self
                .config
                .connect(tls)
                .await
                .map_err(|e| KeeperError::Monitor(format!("connecting to monitor: {e}")))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!("monitor connection closed: {e}");
                }
            });
            client
        };
        Ok(client)
    }

    /// Runs one query against a cached connection, reconnecting once if the
    /// cached one is gone, and dropping the cache on failure so the next
    /// call starts clean.
    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Row>, KeeperError> {
        let mut guard = self.client.lock().await;
        if guard.as_ref().map(|c| c.is_closed()).unwrap_or(true) {
            *guard = Some(self.connect().await?);
        }
        let client = guard.as_ref().expect("connection was just established");
        match client.query(sql, params).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                *guard = None;
                Err(KeeperError::Monitor(format!("monitor call failed: {e}")))
            }
        }
    }

    async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Row, KeeperError> {
        let mut rows = self.query(sql, params).await?;
        if rows.len() != 1 {
            return Err(KeeperError::Protocol(format!(
                "expected one row from monitor, got {}",
                rows.len()
            )));
        }
        Ok(rows.remove(0))
    }
}

/// Client-side TLS configuration for connections to the monitor: the system
/// roots plus the operator's CA file when one is configured. Shared by the
/// RPC client and the notification listener so both channels negotiate the
/// same way.
pub(crate) fn rustls_client_config(
    ca_file: Option<&std::path::Path>,
) -> Result<rustls::ClientConfig, KeeperError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(ca_file) = ca_file {
        let pem = std::fs::read(ca_file)
            .map_err(|e| KeeperError::Config(format!("reading {}: {e}", ca_file.display())))?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| {
                KeeperError::Config(format!("parsing {}: {e}", ca_file.display()))
            })?;
            roots.add(cert).map_err(|e| {
                KeeperError::Config(format!("loading {}: {e}", ca_file.display()))
            })?;
        }
    }
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn get<'a, T: tokio_postgres::types::FromSql<'a>>(
    row: &'a Row,
    idx: usize,
) -> Result<T, KeeperError> {
    row.try_get(idx)
        .map_err(|e| KeeperError::Protocol(format!("bad monitor reply column {idx}: {e}")))
}

/// Parses a role string from a monitor reply. Unknown roles are a protocol
/// error; the keeper logs and treats the tick as failed rather than guessing.
fn role_from_reply(s: &str) -> Result<NodeRole, KeeperError> {
    NodeRole::from_wire(s).ok_or_else(|| {
        error!("monitor assigned unknown role '{s}'");
        KeeperError::Protocol(format!("monitor assigned unknown role '{s}'"))
    })
}

fn node_address_from_row(row: &Row) -> Result<NodeAddress, KeeperError> {
    Ok(NodeAddress {
        node_id: get(row, 0)?,
        name: get(row, 1)?,
        host: get(row, 2)?,
        port: get::<i32>(row, 3)? as u16,
        lsn: row
            .try_get::<_, Option<String>>(4)
            .ok()
            .flatten()
            .map(|s| Lsn::parse_lenient(&s))
            .unwrap_or(Lsn::INVALID),
        is_primary: row.try_get(5).unwrap_or(false),
    })
}

#[async_trait]
impl MonitorLink for MonitorClient {
    async fn register_node(
        &self,
        formation: &str,
        group_id: Option<i32>,
        nodename: &str,
        host: &str,
        port: u16,
        system_identifier: u64,
        wanted_initial_state: NodeRole,
    ) -> Result<RegisterReply, KeeperError> {
        let row = self
            .query_one(
                "SELECT assigned_node_id, assigned_group_id, assigned_group_state::text \
                 FROM pgautofailover.register_node($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &formation,
                    &group_id,
                    &nodename,
                    &host,
                    &(port as i32),
                    &(system_identifier as i64),
                    &wanted_initial_state.wire_name(),
                ],
            )
            .await?;
        Ok(RegisterReply {
            node_id: get(&row, 0)?,
            group_id: get(&row, 1)?,
            assigned_role: role_from_reply(&get::<String>(&row, 2)?)?,
        })
    }

    async fn node_active(
        &self,
        report: &NodeActiveReport,
    ) -> Result<NodeActiveReply, KeeperError> {
        let row = self
            .query_one(
                "SELECT assigned_node_id, assigned_group_id, assigned_group_state::text, \
                 candidate_priority, replication_quorum, nodes_version \
                 FROM pgautofailover.node_active($1, $2, $3, $4, $5, $6, $7, $8::pg_lsn, $9)",
                &[
                    &report.formation.as_str(),
                    &report.nodename.as_str(),
                    &(report.port as i32),
                    &report.node_id,
                    &report.group_id,
                    &report.current_role.wire_name(),
                    &report.pg_is_running,
                    &report.current_lsn.to_string(),
                    &report.sync_state.as_str(),
                ],
            )
            .await?;
        Ok(NodeActiveReply {
            node_id: get(&row, 0)?,
            group_id: get(&row, 1)?,
            assigned_role: role_from_reply(&get::<String>(&row, 2)?)?,
            candidate_priority: row.try_get(3).ok(),
            replication_quorum: row.try_get(4).ok(),
            nodes_version: get(&row, 5)?,
        })
    }

    async fn get_primary(
        &self,
        formation: &str,
        group_id: i32,
    ) -> Result<NodeAddress, KeeperError> {
        let row = self
            .query_one(
                "SELECT primary_node_id, primary_name, primary_host, primary_port \
                 FROM pgautofailover.get_primary($1, $2)",
                &[&formation, &group_id],
            )
            .await?;
        Ok(NodeAddress {
            node_id: get(&row, 0)?,
            name: get(&row, 1)?,
            host: get(&row, 2)?,
            port: get::<i32>(&row, 3)? as u16,
            lsn: Lsn::INVALID,
            is_primary: true,
        })
    }

    async fn get_other_nodes(&self, node_id: i64) -> Result<Vec<NodeAddress>, KeeperError> {
        let rows = self
            .query(
                "SELECT node_id, node_name, node_host, node_port, node_lsn::text, node_is_primary \
                 FROM pgautofailover.get_other_nodes($1)",
                &[&node_id],
            )
            .await?;
        rows.iter().map(node_address_from_row).collect()
    }

    async fn start_maintenance(&self, node_id: i64) -> Result<bool, KeeperError> {
        let row = self
            .query_one(
                "SELECT pgautofailover.start_maintenance($1)",
                &[&node_id],
            )
            .await?;
        get(&row, 0)
    }

    async fn stop_maintenance(&self, node_id: i64) -> Result<bool, KeeperError> {
        let row = self
            .query_one("SELECT pgautofailover.stop_maintenance($1)", &[&node_id])
            .await?;
        get(&row, 0)
    }

    async fn remove_node(&self, node_id: i64) -> Result<(), KeeperError> {
        self.query("SELECT pgautofailover.remove_node($1)", &[&node_id])
            .await?;
        Ok(())
    }
}
