// src/core/postgres/conf.rs

//! Recovery and standby configuration files.
//!
//! Postgres 12 and later use `standby.signal` plus settings appended to
//! `postgresql.auto.conf`; older servers use a generated `recovery.conf`.
//! The keeper owns a marked block inside `postgresql.auto.conf` and rewrites
//! it wholesale, so repeated edits converge to the same bytes. All writes go
//! through a temporary file and a rename.

use super::PgError;
use std::fs;
use std::path::Path;

const BLOCK_BEGIN: &str = "# begin pgward managed settings";
const BLOCK_END: &str = "# end pgward managed settings";

/// Connection string a standby uses to reach its upstream.
pub fn primary_conninfo(
    host: &str,
    port: u16,
    user: &str,
    application_name: &str,
    sslmode: &str,
) -> String {
    format!(
        "host={host} port={port} user={user} application_name={application_name} sslmode={sslmode}"
    )
}

/// The application_name a standby announces to its primary; the monitor uses
/// the same naming when building `synchronous_standby_names`.
pub fn standby_application_name(node_id: i64) -> String {
    format!("pgautofailover_standby_{node_id}")
}

/// Replication slot reserved on the primary for a given standby.
pub fn replication_slot_name(node_id: i64) -> String {
    format!("pgautofailover_{node_id}")
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), PgError> {
    let tmp = path.with_extension("new");
    fs::write(&tmp, contents)
        .map_err(|e| PgError::Transient(format!("writing {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| PgError::Transient(format!("renaming into {}: {e}", path.display())))?;
    Ok(())
}

/// Replaces (or appends) the keeper-managed block in `postgresql.auto.conf`.
/// An empty settings slice removes the block.
pub fn write_managed_settings(pgdata: &Path, settings: &[(String, String)]) -> Result<(), PgError> {
    let path = pgdata.join("postgresql.auto.conf");
    let existing = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(PgError::Config(format!("reading {}: {e}", path.display()))),
    };

    let mut kept: Vec<&str> = Vec::new();
    let mut in_block = false;
    for line in existing.lines() {
        if line == BLOCK_BEGIN {
            in_block = true;
            continue;
        }
        if line == BLOCK_END {
            in_block = false;
            continue;
        }
        if !in_block {
            kept.push(line);
        }
    }

    let mut out = kept.join("\n");
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    if !settings.is_empty() {
        out.push_str(BLOCK_BEGIN);
        out.push('\n');
        for (name, value) in settings {
            out.push_str(&format!("{name} = '{}'\n", value.replace('\'', "''")));
        }
        out.push_str(BLOCK_END);
        out.push('\n');
    }

    write_atomic(&path, &out)
}

/// Puts the data directory into standby mode following the given upstream.
/// Idempotent: converges to the same files for the same inputs.
pub fn setup_standby_mode(
    pgdata: &Path,
    pg_major: u32,
    conninfo: &str,
    slot_name: &str,
) -> Result<(), PgError> {
    if pg_major >= 12 {
        write_managed_settings(
            pgdata,
            &[
                ("primary_conninfo".to_string(), conninfo.to_string()),
                ("primary_slot_name".to_string(), slot_name.to_string()),
                ("recovery_target_timeline".to_string(), "latest".to_string()),
            ],
        )?;
        let signal = pgdata.join("standby.signal");
        if !signal.is_file() {
            fs::write(&signal, "")
                .map_err(|e| PgError::Transient(format!("writing {}: {e}", signal.display())))?;
        }
    } else {
        let contents = format!(
            "standby_mode = 'on'\n\
             primary_conninfo = '{}'\n\
             primary_slot_name = '{}'\n\
             recovery_target_timeline = 'latest'\n",
            conninfo.replace('\'', "''"),
            slot_name
        );
        write_atomic(&pgdata.join("recovery.conf"), &contents)?;
    }
    Ok(())
}

/// Removes standby configuration so the node runs standalone. Used when a
/// promotion has to be restartable after a crash between steps.
pub fn remove_standby_setup(pgdata: &Path, pg_major: u32) -> Result<(), PgError> {
    if pg_major >= 12 {
        write_managed_settings(pgdata, &[])?;
        match fs::remove_file(pgdata.join("standby.signal")) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PgError::Transient(format!("removing standby.signal: {e}"))),
        }
    } else {
        match fs::remove_file(pgdata.join("recovery.conf")) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PgError::Transient(format!("removing recovery.conf: {e}"))),
        }
    }
}

/// True when the data directory is configured as a standby.
pub fn standby_setup_present(pgdata: &Path, pg_major: u32) -> bool {
    if pg_major >= 12 {
        pgdata.join("standby.signal").is_file()
    } else {
        pgdata.join("recovery.conf").is_file()
    }
}
