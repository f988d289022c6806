// src/core/keeper/state.rs

//! The persistent keeper state record.
//!
//! The on-disk format is a `{magic, version}` header of two little-endian
//! `u32`s followed by a fixed-width little-endian record body. Writes always
//! go through a temporary file that is fsynced and renamed into place, then
//! the containing directory is fsynced, so readers only ever observe a
//! complete record.

use crate::core::errors::KeeperError;
use crate::core::postgres::lsn::Lsn;
use crate::core::roles::NodeRole;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// `PGWD` in ASCII.
pub const STATE_FILE_MAGIC: u32 = 0x5047_5744;
/// Current on-disk layout version. Version 1 is the same record without
/// `current_nodes_version`; it is migrated on read and rewritten as the
/// current version on the next write. Later versions are refused.
pub const STATE_FILE_VERSION: u32 = 2;

/// The keeper's durable view of its own identity and progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeeperState {
    pub current_node_id: i64,
    pub current_group: i32,
    pub current_role: NodeRole,
    pub assigned_role: NodeRole,
    /// Unix milliseconds of the last successful monitor exchange; 0 = never.
    pub last_monitor_contact: i64,
    /// Unix milliseconds of the last contact from a secondary; 0 = never.
    pub last_secondary_contact: i64,
    /// Replay/flush LSN as last reported to the monitor.
    pub xlog_location: u64,
    pub pg_control_version: u32,
    pub catalog_version: u32,
    pub system_identifier: u64,
    /// Opaque-monotone counter of the monitor's view of the group; a change
    /// triggers an HBA refresh.
    pub current_nodes_version: i32,
}

impl KeeperState {
    /// The state written right after a successful registration.
    pub fn for_registration(
        node_id: i64,
        group_id: i32,
        assigned_role: NodeRole,
        system_identifier: u64,
        pg_control_version: u32,
        catalog_version: u32,
    ) -> Self {
        Self {
            current_node_id: node_id,
            current_group: group_id,
            current_role: NodeRole::Init,
            assigned_role,
            last_monitor_contact: Utc::now().timestamp_millis(),
            last_secondary_contact: 0,
            xlog_location: 0,
            pg_control_version,
            catalog_version,
            system_identifier,
            current_nodes_version: 0,
        }
    }

    pub fn last_monitor_contact_time(&self) -> Option<DateTime<Utc>> {
        (self.last_monitor_contact != 0)
            .then(|| DateTime::<Utc>::from_timestamp_millis(self.last_monitor_contact))
            .flatten()
    }

    pub fn touch_monitor_contact(&mut self) {
        self.last_monitor_contact = Utc::now().timestamp_millis();
    }

    pub fn current_lsn(&self) -> Lsn {
        Lsn(self.xlog_location)
    }
}

/// Body of the current on-disk record, in declared field order.
#[derive(Debug, Clone, Copy, bincode::Encode, bincode::Decode)]
struct StateRecordV2 {
    current_node_id: i64,
    current_group: i32,
    current_role: u32,
    assigned_role: u32,
    last_monitor_contact: i64,
    last_secondary_contact: i64,
    xlog_location: u64,
    pg_control_version: u32,
    catalog_version: u32,
    system_identifier: u64,
    current_nodes_version: i32,
}

/// Version-1 body: identical layout minus the trailing nodes version.
#[derive(Debug, Clone, Copy, bincode::Encode, bincode::Decode)]
struct StateRecordV1 {
    current_node_id: i64,
    current_group: i32,
    current_role: u32,
    assigned_role: u32,
    last_monitor_contact: i64,
    last_secondary_contact: i64,
    xlog_location: u64,
    pg_control_version: u32,
    catalog_version: u32,
    system_identifier: u64,
}

fn role_from_id(id: u32) -> Result<NodeRole, KeeperError> {
    NodeRole::from_binary_id(id)
        .ok_or_else(|| KeeperError::StateCorrupt(format!("unknown role id {id}")))
}

fn role_to_id(role: NodeRole) -> Result<u32, KeeperError> {
    if role == NodeRole::Unknown {
        return Err(KeeperError::Internal(
            "refusing to persist the unknown role sentinel".into(),
        ));
    }
    Ok(role.binary_id())
}

/// Handle on the state file location; all reads and writes go through here.
#[derive(Debug, Clone)]
pub struct KeeperStateFile {
    path: PathBuf,
}

impl KeeperStateFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Reads and validates the state record. Header mismatch is corruption;
    /// a version from a newer keeper is refused; version 1 is migrated.
    pub fn read(&self) -> Result<KeeperState, KeeperError> {
        let bytes = fs::read(&self.path)
            .map_err(|e| KeeperError::StateIo(format!("reading {}: {e}", self.path.display())))?;
        if bytes.len() < 8 {
            return Err(KeeperError::StateCorrupt(format!(
                "{} is too short ({} bytes)",
                self.path.display(),
                bytes.len()
            )));
        }

        let magic = u32::from_le_bytes(bytes[0..4].try_into().expect("sliced 4 bytes"));
        let version = u32::from_le_bytes(bytes[4..8].try_into().expect("sliced 4 bytes"));
        if magic != STATE_FILE_MAGIC {
            return Err(KeeperError::StateCorrupt(format!(
                "{} has bad magic {magic:#010x}",
                self.path.display()
            )));
        }

        let body = &bytes[8..];
        let config = bincode::config::legacy();
        match version {
            1 => {
                let (record, used): (StateRecordV1, usize) =
                    bincode::decode_from_slice(body, config).map_err(|e| {
                        KeeperError::StateCorrupt(format!("{}: {e}", self.path.display()))
                    })?;
                Self::reject_trailing(body, used, &self.path)?;
                Ok(KeeperState {
                    current_node_id: record.current_node_id,
                    current_group: record.current_group,
                    current_role: role_from_id(record.current_role)?,
                    assigned_role: role_from_id(record.assigned_role)?,
                    last_monitor_contact: record.last_monitor_contact,
                    last_secondary_contact: record.last_secondary_contact,
                    xlog_location: record.xlog_location,
                    pg_control_version: record.pg_control_version,
                    catalog_version: record.catalog_version,
                    system_identifier: record.system_identifier,
                    current_nodes_version: 0,
                })
            }
            STATE_FILE_VERSION => {
                let (record, used): (StateRecordV2, usize) =
                    bincode::decode_from_slice(body, config).map_err(|e| {
                        KeeperError::StateCorrupt(format!("{}: {e}", self.path.display()))
                    })?;
                Self::reject_trailing(body, used, &self.path)?;
                Ok(KeeperState {
                    current_node_id: record.current_node_id,
                    current_group: record.current_group,
                    current_role: role_from_id(record.current_role)?,
                    assigned_role: role_from_id(record.assigned_role)?,
                    last_monitor_contact: record.last_monitor_contact,
                    last_secondary_contact: record.last_secondary_contact,
                    xlog_location: record.xlog_location,
                    pg_control_version: record.pg_control_version,
                    catalog_version: record.catalog_version,
                    system_identifier: record.system_identifier,
                    current_nodes_version: record.current_nodes_version,
                })
            }
            other => Err(KeeperError::StateVersionUnsupported(other)),
        }
    }

    fn reject_trailing(body: &[u8], used: usize, path: &Path) -> Result<(), KeeperError> {
        if used != body.len() {
            return Err(KeeperError::StateCorrupt(format!(
                "{} has {} trailing bytes",
                path.display(),
                body.len() - used
            )));
        }
        Ok(())
    }

    /// Serializes and atomically replaces the state file.
    pub fn write(&self, state: &KeeperState) -> Result<(), KeeperError> {
        let record = StateRecordV2 {
            current_node_id: state.current_node_id,
            current_group: state.current_group,
            current_role: role_to_id(state.current_role)?,
            assigned_role: role_to_id(state.assigned_role)?,
            last_monitor_contact: state.last_monitor_contact,
            last_secondary_contact: state.last_secondary_contact,
            xlog_location: state.xlog_location,
            pg_control_version: state.pg_control_version,
            catalog_version: state.catalog_version,
            system_identifier: state.system_identifier,
            current_nodes_version: state.current_nodes_version,
        };

        let mut bytes = Vec::with_capacity(80);
        bytes.extend_from_slice(&STATE_FILE_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&STATE_FILE_VERSION.to_le_bytes());
        let body = bincode::encode_to_vec(record, bincode::config::legacy())
            .map_err(|e| KeeperError::Internal(format!("encoding state record: {e}")))?;
        bytes.extend_from_slice(&body);

        let dir = self.path.parent().ok_or_else(|| {
            KeeperError::StateIo(format!("{} has no parent directory", self.path.display()))
        })?;
        fs::create_dir_all(dir)
            .map_err(|e| KeeperError::StateIo(format!("creating {}: {e}", dir.display())))?;

        let tmp_path = self.path.with_extension("new");
        let io_err =
            |what: &str, e: std::io::Error| KeeperError::StateIo(format!("{what}: {e}"));

        let mut tmp = fs::File::create(&tmp_path)
            .map_err(|e| io_err(&format!("creating {}", tmp_path.display()), e))?;
        tmp.write_all(&bytes)
            .map_err(|e| io_err(&format!("writing {}", tmp_path.display()), e))?;
        tmp.sync_all()
            .map_err(|e| io_err(&format!("syncing {}", tmp_path.display()), e))?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)
            .map_err(|e| io_err(&format!("renaming into {}", self.path.display()), e))?;

        // Make the rename itself durable.
        fs::File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| io_err(&format!("syncing {}", dir.display()), e))?;
        Ok(())
    }

    /// Creates the initial state file; refuses to clobber an existing one.
    pub fn init(&self, state: &KeeperState) -> Result<(), KeeperError> {
        if self.exists() {
            return Err(KeeperError::StateIo(format!(
                "state file {} already exists",
                self.path.display()
            )));
        }
        self.write(state)
    }

    /// Removes the state file; used by `drop node`.
    pub fn remove(&self) -> Result<(), KeeperError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeeperError::StateIo(format!(
                "removing {}: {e}",
                self.path.display()
            ))),
        }
    }
}
