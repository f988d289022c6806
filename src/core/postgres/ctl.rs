// src/core/postgres/ctl.rs

//! Wrappers around the Postgres command-line tools: `pg_ctl`, `initdb` (via
//! `pg_ctl init`), `pg_basebackup`, `pg_rewind`, and `pg_controldata`.
//!
//! Failures are categorized: a tool that cannot be found or refuses its
//! arguments is a configuration error, a tool that ran and failed is
//! transient (the next tick retries), and an unreadable control file is
//! fatal.

use super::PgError;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};

/// Shutdown modes accepted by `pg_ctl stop -m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Smart,
    Fast,
    Immediate,
}

impl StopMode {
    fn as_arg(&self) -> &'static str {
        match self {
            StopMode::Smart => "smart",
            StopMode::Fast => "fast",
            StopMode::Immediate => "immediate",
        }
    }
}

/// Fields captured from `pg_controldata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlData {
    pub system_identifier: u64,
    pub pg_control_version: u32,
    pub catalog_version: u32,
}

/// Handle on one data directory and the toolchain that drives it.
#[derive(Debug, Clone)]
pub struct PgCtl {
    pgctl: PathBuf,
    pgdata: PathBuf,
    port: u16,
    listen_addresses: String,
}

impl PgCtl {
    pub fn new(pgctl: PathBuf, pgdata: PathBuf, port: u16, listen_addresses: String) -> Self {
        Self {
            pgctl,
            pgdata,
            port,
            listen_addresses,
        }
    }

    pub fn pgdata(&self) -> &Path {
        &self.pgdata
    }

    /// A sibling tool from the same installation as `pg_ctl`, falling back
    /// to `$PATH` when `pg_ctl` itself was given as a bare name.
    fn sibling(&self, tool: &str) -> PathBuf {
        match self.pgctl.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(tool),
            _ => PathBuf::from(tool),
        }
    }

    async fn run(&self, program: &Path, args: &[&str]) -> Result<Output, PgError> {
        debug!("running {} {}", program.display(), args.join(" "));
        Command::new(program)
            .args(args)
            .env("PGDATA", &self.pgdata)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PgError::Config(format!("{} not found", program.display()))
                } else {
                    PgError::Transient(format!("spawning {}: {e}", program.display()))
                }
            })
    }

    fn check(output: Output, what: &str) -> Result<(), PgError> {
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(PgError::Transient(format!(
            "{what} failed (status {:?}): {}",
            output.status.code(),
            stderr.trim()
        )))
    }

    /// True when the data directory exists and looks initialized.
    pub fn exists(&self) -> bool {
        self.pgdata.is_dir() && self.pgdata.join("PG_VERSION").is_file()
    }

    /// The server major version the data directory requires, from
    /// `PG_VERSION` ("16", or "9.6" for pre-10 layouts).
    pub fn pg_major(&self) -> Result<u32, PgError> {
        let text = std::fs::read_to_string(self.pgdata.join("PG_VERSION"))
            .map_err(|e| PgError::Fatal(format!("reading PG_VERSION: {e}")))?;
        let text = text.trim();
        let major = text.split('.').next().unwrap_or(text);
        major
            .parse()
            .map_err(|_| PgError::Fatal(format!("unparseable PG_VERSION '{text}'")))
    }

    /// `initdb` through `pg_ctl init`; no-op when the directory is already
    /// initialized.
    pub async fn init(&self, auth_method: &str) -> Result<bool, PgError> {
        if self.exists() {
            return Ok(false);
        }
        std::fs::create_dir_all(&self.pgdata)
            .map_err(|e| PgError::Transient(format!("creating {}: {e}", self.pgdata.display())))?;
        let initdb_options = format!("--encoding UTF8 --auth {auth_method}");
        let pgdata = self.pgdata.display().to_string();
        let output = self
            .run(
                &self.pgctl,
                &["init", "-s", "-D", &pgdata, "-o", &initdb_options],
            )
            .await?;
        Self::check(output, "pg_ctl init")?;
        Ok(true)
    }

    /// Probes the postmaster through `pg_ctl status`. Exit code 0 means
    /// running, 3 means stopped, 4 with a missing directory means stopped;
    /// anything else is undecidable and surfaces as an error.
    pub async fn status(&self) -> Result<bool, PgError> {
        let pgdata = self.pgdata.display().to_string();
        let output = self.run(&self.pgctl, &["status", "-D", &pgdata]).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(3) => Ok(false),
            Some(4) if !self.exists() => Ok(false),
            code => Err(PgError::Transient(format!(
                "pg_ctl status returned {code:?}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    pub async fn start(&self) -> Result<(), PgError> {
        if self.status().await.unwrap_or(false) {
            return Ok(());
        }
        let pgdata = self.pgdata.display().to_string();
        let logfile = self.pgdata.join("startup.log").display().to_string();
        let server_options = format!("-p {} -h {}", self.port, self.listen_addresses);
        let output = self
            .run(
                &self.pgctl,
                &[
                    "start", "-s", "-w", "-D", &pgdata, "-l", &logfile, "-o", &server_options,
                ],
            )
            .await?;
        Self::check(output, "pg_ctl start")
    }

    pub async fn stop(&self, mode: StopMode) -> Result<(), PgError> {
        if !self.status().await.unwrap_or(true) {
            return Ok(());
        }
        let pgdata = self.pgdata.display().to_string();
        let output = self
            .run(
                &self.pgctl,
                &["stop", "-s", "-w", "-D", &pgdata, "-m", mode.as_arg()],
            )
            .await?;
        Self::check(output, "pg_ctl stop")
    }

    pub async fn reload(&self) -> Result<(), PgError> {
        let pgdata = self.pgdata.display().to_string();
        let output = self.run(&self.pgctl, &["reload", "-s", "-D", &pgdata]).await?;
        Self::check(output, "pg_ctl reload")
    }

    pub async fn restart(&self) -> Result<(), PgError> {
        let pgdata = self.pgdata.display().to_string();
        let logfile = self.pgdata.join("startup.log").display().to_string();
        let server_options = format!("-p {} -h {}", self.port, self.listen_addresses);
        let output = self
            .run(
                &self.pgctl,
                &[
                    "restart", "-s", "-w", "-m", "fast", "-D", &pgdata, "-l", &logfile, "-o",
                    &server_options,
                ],
            )
            .await?;
        Self::check(output, "pg_ctl restart")
    }

    pub async fn promote(&self) -> Result<(), PgError> {
        let pgdata = self.pgdata.display().to_string();
        let output = self
            .run(&self.pgctl, &["promote", "-s", "-w", "-D", &pgdata])
            .await?;
        Self::check(output, "pg_ctl promote")
    }

    /// Streams a fresh base backup from the given upstream into `pgdata`.
    /// The target directory must not exist; callers move any previous data
    /// directory aside first.
    pub async fn basebackup(
        &self,
        host: &str,
        port: u16,
        username: &str,
        slot_name: &str,
        max_rate: Option<&str>,
    ) -> Result<(), PgError> {
        let tool = self.sibling("pg_basebackup");
        let pgdata = self.pgdata.display().to_string();
        let port = port.to_string();
        let mut args: Vec<&str> = vec![
            "-w",
            "-D",
            &pgdata,
            "-h",
            host,
            "-p",
            &port,
            "-U",
            username,
            "--wal-method=stream",
            "--checkpoint=fast",
            "--slot",
            slot_name,
        ];
        let rate_arg;
        if let Some(rate) = max_rate {
            rate_arg = format!("--max-rate={rate}");
            args.push(&rate_arg);
        }
        let output = self.run(&tool, &args).await?;
        Self::check(output, "pg_basebackup")
    }

    /// Rewinds the data directory against the given source server. The
    /// caller falls back to a fresh base backup when this fails transiently.
    pub async fn rewind(&self, source_conninfo: &str) -> Result<(), PgError> {
        let tool = self.sibling("pg_rewind");
        let pgdata = self.pgdata.display().to_string();
        let target = format!("--target-pgdata={pgdata}");
        let source = format!("--source-server={source_conninfo}");
        let output = self.run(&tool, &[&target, &source, "--progress"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("pg_rewind failed: {}", stderr.trim());
            return Err(PgError::Transient(format!(
                "pg_rewind failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Reads the fields the keeper records from `pg_controldata`.
    pub async fn controldata(&self) -> Result<ControlData, PgError> {
        let tool = self.sibling("pg_controldata");
        let pgdata = self.pgdata.display().to_string();
        let output = self.run(&tool, &["-D", &pgdata]).await?;
        if !output.status.success() {
            return Err(PgError::Fatal(format!(
                "pg_controldata failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout).to_string();
        parse_controldata(&text).ok_or_else(|| {
            PgError::Fatal("pg_controldata output is missing expected fields".into())
        })
    }
}

/// Pulls the identifier and version fields out of `pg_controldata` output.
pub fn parse_controldata(text: &str) -> Option<ControlData> {
    let mut data = ControlData::default();
    for line in text.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match label.trim() {
            "Database system identifier" => data.system_identifier = value.parse().ok()?,
            "pg_control version number" => data.pg_control_version = value.parse().ok()?,
            "Catalog version number" => data.catalog_version = value.parse().ok()?,
            _ => {}
        }
    }
    (data.system_identifier != 0).then_some(data)
}
