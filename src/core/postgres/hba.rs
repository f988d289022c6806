// src/core/postgres/hba.rs

//! Idempotent editing of `pg_hba.conf`.
//!
//! For every peer node in the group the keeper appends two rules: one for the
//! `replication` pseudo-database and one for the monitored database. A rule
//! already present anywhere in the file (at line start or right after a
//! newline) is never appended again, so replaying an edit leaves the file
//! byte-identical.

use super::PgError;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

/// Marker appended to every rule this keeper writes.
pub const HBA_MARKER: &str = " # Auto-generated by pg_auto_failover";

/// `host` vs `hostssl` rules, depending on the SSL configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Host,
    HostSsl,
}

impl ConnectionType {
    pub fn for_ssl(ssl_active: bool) -> Self {
        if ssl_active {
            ConnectionType::HostSsl
        } else {
            ConnectionType::Host
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            ConnectionType::Host => "host",
            ConnectionType::HostSsl => "hostssl",
        }
    }
}

/// The database column of an HBA rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HbaDatabase {
    All,
    Replication,
    Named(String),
}

impl HbaDatabase {
    fn keyword(&self) -> String {
        match self {
            HbaDatabase::All => "all".to_string(),
            HbaDatabase::Replication => "replication".to_string(),
            HbaDatabase::Named(name) => format!("\"{name}\""),
        }
    }
}

/// One authentication rule to guarantee in `pg_hba.conf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbaRule {
    pub connection: ConnectionType,
    pub database: HbaDatabase,
    pub username: String,
    pub address: String,
    pub auth_method: String,
}

impl HbaRule {
    /// The rule text without the generated-by marker; this is what duplicate
    /// detection matches on, so a hand-written identical rule also counts.
    pub fn format(&self) -> String {
        format!(
            "{} {} \"{}\" {} {}",
            self.connection.keyword(),
            self.database.keyword(),
            self.username,
            self.address,
            self.auth_method
        )
    }
}

/// Formats a host for the HBA address column: `a.b.c.d/32` for IPv4
/// addresses, `x::y/128` for IPv6, the bare name for hostnames.
pub fn hba_address_for_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => format!("{ip}/32"),
        Ok(IpAddr::V6(ip)) => format!("{ip}/128"),
        Err(_) => host.to_string(),
    }
}

fn contains_rule(contents: &str, line: &str) -> bool {
    contents.starts_with(line) || contents.contains(&format!("\n{line}"))
}

/// Appends `rule` to the HBA file unless an identical rule is already there.
/// Returns true when the file was modified. The edit is write-temp-and-rename.
pub fn ensure_host_rule_exists(path: &Path, rule: &HbaRule) -> Result<bool, PgError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| PgError::Config(format!("reading {}: {e}", path.display())))?;

    let line = rule.format();
    if contains_rule(&contents, &line) {
        return Ok(false);
    }

    let mut updated = contents;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&line);
    updated.push_str(HBA_MARKER);
    updated.push('\n');

    let tmp = path.with_extension("conf.new");
    fs::write(&tmp, &updated)
        .map_err(|e| PgError::Transient(format!("writing {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| PgError::Transient(format!("renaming into {}: {e}", path.display())))?;
    Ok(true)
}

/// Guarantees the two rules for one peer: replication plus the monitored
/// database. Returns true when either rule was appended.
pub fn ensure_rules_for_peer(
    path: &Path,
    ssl_active: bool,
    dbname: &str,
    username: &str,
    host: &str,
    auth_method: &str,
) -> Result<bool, PgError> {
    let address = hba_address_for_host(host);
    let connection = ConnectionType::for_ssl(ssl_active);

    let replication_rule = HbaRule {
        connection,
        database: HbaDatabase::Replication,
        username: username.to_string(),
        address: address.clone(),
        auth_method: auth_method.to_string(),
    };
    let database_rule = HbaRule {
        connection,
        database: HbaDatabase::Named(dbname.to_string()),
        username: username.to_string(),
        address,
        auth_method: auth_method.to_string(),
    };

    let a = ensure_host_rule_exists(path, &replication_rule)?;
    let b = ensure_host_rule_exists(path, &database_rule)?;
    Ok(a || b)
}
