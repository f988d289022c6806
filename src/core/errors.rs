// src/core/errors.rs

//! Defines the primary error type for the keeper and its exit-code mapping.

use thiserror::Error;

/// Exit code for a clean run.
pub const EXIT_CODE_QUIT: i32 = 0;
/// Exit code for invalid command-line arguments.
pub const EXIT_CODE_BAD_ARGS: i32 = 11;
/// Exit code for an invalid or inconsistent configuration file.
pub const EXIT_CODE_BAD_CONFIG: i32 = 12;
/// Exit code for a missing, corrupt, or unsupported state file.
pub const EXIT_CODE_BAD_STATE: i32 = 13;
/// Exit code for a `pg_ctl` (or sibling tool) failure.
pub const EXIT_CODE_PGCTL: i32 = 14;
/// Exit code for a failed query against the local Postgres.
pub const EXIT_CODE_PGSQL: i32 = 15;
/// Exit code for a monitor connection or protocol failure.
pub const EXIT_CODE_MONITOR: i32 = 16;
/// Exit code for internal errors.
pub const EXIT_CODE_INTERNAL: i32 = 17;

/// The main error enum, representing all failure kinds the keeper can surface.
///
/// Errors are always returned as values and bubble up to a single exit point
/// in `main`, which maps each kind to its process exit code. A `Transient`
/// error never terminates the keeper loop; it only abandons the current tick.
#[derive(Error, Debug)]
pub enum KeeperError {
    #[error("transient error: {0}")]
    Transient(String),

    #[error("bad arguments: {0}")]
    Usage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("state file is corrupt: {0}")]
    StateCorrupt(String),

    #[error("state file I/O error: {0}")]
    StateIo(String),

    #[error("state file version {0} is not supported by this keeper")]
    StateVersionUnsupported(u32),

    #[error("monitor protocol error: {0}")]
    Protocol(String),

    #[error("pg_ctl failure: {0}")]
    PgCtl(String),

    #[error("postgres query failure: {0}")]
    Pgsql(String),

    #[error("monitor failure: {0}")]
    Monitor(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KeeperError {
    /// Maps an error kind to the process exit code documented in the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            KeeperError::Usage(_) => EXIT_CODE_BAD_ARGS,
            KeeperError::Config(_) => EXIT_CODE_BAD_CONFIG,
            KeeperError::StateCorrupt(_)
            | KeeperError::StateIo(_)
            | KeeperError::StateVersionUnsupported(_) => EXIT_CODE_BAD_STATE,
            KeeperError::PgCtl(_) => EXIT_CODE_PGCTL,
            KeeperError::Pgsql(_) => EXIT_CODE_PGSQL,
            KeeperError::Monitor(_) | KeeperError::Protocol(_) => EXIT_CODE_MONITOR,
            KeeperError::Transient(_) | KeeperError::Fatal(_) | KeeperError::Internal(_) => {
                EXIT_CODE_INTERNAL
            }
        }
    }

    /// True when the error should be retried on the next tick instead of
    /// terminating the keeper.
    pub fn is_transient(&self) -> bool {
        matches!(self, KeeperError::Transient(_))
    }
}
