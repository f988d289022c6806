// src/core/keeper/pidfile.rs

//! The keeper PID file: liveness probe and single-instance enforcement.
//!
//! Layout: the first line is the supervisor PID, each following line is
//! `service-name pid`. The file is removed on clean supervisor exit.

use crate::core::errors::KeeperError;
use std::fs;
use std::path::{Path, PathBuf};

/// Parsed contents of a PID file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFileContents {
    pub supervisor_pid: i32,
    pub services: Vec<(String, i32)>,
}

/// True when a process with this PID exists. EPERM from `kill(pid, 0)` means
/// the process exists but belongs to someone else, which still counts.
pub fn pid_is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<PidFileContents, KeeperError> {
        let text = fs::read_to_string(&self.path)
            .map_err(|e| KeeperError::StateIo(format!("reading {}: {e}", self.path.display())))?;
        Self::parse(&text).ok_or_else(|| {
            KeeperError::StateCorrupt(format!("malformed pid file {}", self.path.display()))
        })
    }

    pub fn parse(text: &str) -> Option<PidFileContents> {
        let mut lines = text.lines();
        let supervisor_pid: i32 = lines.next()?.trim().parse().ok()?;
        let mut services = Vec::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (name, pid) = line.rsplit_once(' ')?;
            services.push((name.trim().to_string(), pid.trim().parse().ok()?));
        }
        Some(PidFileContents {
            supervisor_pid,
            services,
        })
    }

    /// Refuses to proceed when another live keeper owns this PID file. A
    /// stale file (dead PID) is cleaned up silently.
    pub fn check_single_instance(&self) -> Result<(), KeeperError> {
        if !self.path.is_file() {
            return Ok(());
        }
        match self.read() {
            Ok(contents) if pid_is_alive(contents.supervisor_pid) => Err(KeeperError::Fatal(
                format!(
                    "keeper already running with pid {} (pid file {})",
                    contents.supervisor_pid,
                    self.path.display()
                ),
            )),
            _ => {
                // Stale or unreadable leftovers from a crash.
                let _ = fs::remove_file(&self.path);
                Ok(())
            }
        }
    }

    pub fn write(&self, supervisor_pid: i32, services: &[(String, i32)]) -> Result<(), KeeperError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| KeeperError::StateIo(format!("creating {}: {e}", dir.display())))?;
        }
        let mut text = format!("{supervisor_pid}\n");
        for (name, pid) in services {
            text.push_str(&format!("{name} {pid}\n"));
        }
        fs::write(&self.path, text)
            .map_err(|e| KeeperError::StateIo(format!("writing {}: {e}", self.path.display())))
    }

    pub fn remove(&self) {
        let _ = fs::remove_file(&self.path);
    }
}
