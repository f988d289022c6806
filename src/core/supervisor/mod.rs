// src/core/supervisor/mod.rs

//! The service supervisor: starts the keeper's long-running services,
//! restarts them according to policy with exponential backoff, fans signals
//! out as shutdown modes, and owns the PID file.
//!
//! SIGTERM is a smart shutdown (services finish their current work), SIGINT
//! is fast (current work is interrupted), SIGQUIT is immediate (services are
//! aborted after a short grace period).

use crate::core::errors::KeeperError;
use crate::core::keeper::pidfile::PidFile;
use crate::core::postgres::StopMode;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How a service reacts to its own exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Restart on any exit.
    Permanent,
    /// Restart only on abnormal exit.
    Transient,
    /// Never restart.
    Temporary,
}

/// Shutdown severity, selected by the signal that reached the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Smart,
    Fast,
    Immediate,
}

impl ShutdownMode {
    /// The matching `pg_ctl stop` mode for the supervised postmaster.
    pub fn stop_mode(&self) -> StopMode {
        match self {
            ShutdownMode::Smart => StopMode::Smart,
            ShutdownMode::Fast => StopMode::Fast,
            ShutdownMode::Immediate => StopMode::Immediate,
        }
    }
}

/// A child that has been up this long gets its retry counter reset.
pub const RETRY_RESET_UPTIME: Duration = Duration::from_secs(60);
/// Grace period before an immediate shutdown aborts the service tasks.
const IMMEDIATE_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// `min(2^retries, 32) × base_delay`.
pub fn restart_backoff(retries: u32, base_delay: Duration) -> Duration {
    let factor: u32 = if retries >= 5 { 32 } else { 1 << retries };
    base_delay * factor
}

/// Whether a policy restarts a service that exited the given way.
pub fn should_restart(policy: RestartPolicy, clean_exit: bool) -> bool {
    match policy {
        RestartPolicy::Permanent => true,
        RestartPolicy::Transient => !clean_exit,
        RestartPolicy::Temporary => false,
    }
}

pub type ServiceFuture = BoxFuture<'static, anyhow::Result<()>>;

/// One supervised service: a name, a restart policy, and a factory that
/// builds a fresh run future for every (re)start.
pub struct ServiceSpec {
    pub name: &'static str,
    pub policy: RestartPolicy,
    pub start: Box<dyn Fn(broadcast::Receiver<ShutdownMode>) -> ServiceFuture + Send + Sync>,
}

/// Owns the services, the signal handling, and the PID file for one keeper
/// process.
pub struct Supervisor {
    services: Vec<ServiceSpec>,
    pid_file: PidFile,
    base_delay: Duration,
    shutdown_timeout: Duration,
    shutdown_tx: broadcast::Sender<ShutdownMode>,
    reload_tx: broadcast::Sender<()>,
}

impl Supervisor {
    pub fn new(pid_path: PathBuf, shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        let (reload_tx, _) = broadcast::channel(4);
        Self {
            services: Vec::new(),
            pid_file: PidFile::new(pid_path),
            base_delay: Duration::from_secs(1),
            shutdown_timeout,
            shutdown_tx,
            reload_tx,
        }
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<ShutdownMode> {
        self.shutdown_tx.clone()
    }

    pub fn reload_sender(&self) -> broadcast::Sender<()> {
        self.reload_tx.clone()
    }

    pub fn add_service(&mut self, spec: ServiceSpec) {
        self.services.push(spec);
    }

    /// Runs until all services finish or a shutdown signal arrives. Refuses
    /// to start when another live keeper owns the PID file.
    pub async fn run(self) -> Result<(), KeeperError> {
        self.pid_file.check_single_instance()?;

        let own_pid = std::process::id() as i32;
        let service_pids: Vec<(String, i32)> = self
            .services
            .iter()
            .map(|s| (s.name.to_string(), own_pid))
            .collect();
        self.pid_file.write(own_pid, &service_pids)?;

        let shutting_down = Arc::new(AtomicBool::new(false));
        let mut tasks: JoinSet<()> = JoinSet::new();
        for spec in self.services {
            tasks.spawn(supervise(
                spec,
                self.shutdown_tx.clone(),
                shutting_down.clone(),
                self.base_delay,
            ));
        }

        let map_err =
            |e: std::io::Error| KeeperError::Internal(format!("installing signal handler: {e}"));
        let mut sigterm = signal(SignalKind::terminate()).map_err(map_err)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(map_err)?;
        let mut sigquit = signal(SignalKind::quit()).map_err(map_err)?;
        let mut sighup = signal(SignalKind::hangup()).map_err(map_err)?;

        info!("supervisor running with pid {own_pid}");

        let mode = loop {
            tokio::select! {
                _ = sigterm.recv() => break ShutdownMode::Smart,
                _ = sigint.recv() => break ShutdownMode::Fast,
                _ = sigquit.recv() => break ShutdownMode::Immediate,
                _ = sighup.recv() => {
                    info!("SIGHUP received; asking services to reload");
                    let _ = self.reload_tx.send(());
                }
                joined = tasks.join_next() => {
                    match joined {
                        None => {
                            info!("all services have finished; supervisor exiting");
                            self.pid_file.remove();
                            return Ok(());
                        }
                        Some(Err(e)) => error!("a supervised task panicked: {e}"),
                        Some(Ok(())) => {}
                    }
                }
            }
        };

        info!("shutting down ({mode:?})");
        shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(mode);

        let grace = match mode {
            ShutdownMode::Immediate => IMMEDIATE_SHUTDOWN_GRACE,
            _ => self.shutdown_timeout,
        };
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("services did not stop within {grace:?}; aborting them");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        self.pid_file.remove();
        Ok(())
    }
}

/// Per-service supervision loop: run, decide on restart, back off, repeat.
async fn supervise(
    spec: ServiceSpec,
    shutdown_tx: broadcast::Sender<ShutdownMode>,
    shutting_down: Arc<AtomicBool>,
    base_delay: Duration,
) {
    // A shutdown may be initiated by a signal (the flag) or broadcast by a
    // service itself, e.g. the keeper after its node was dropped.
    let mut shutdown_watch = shutdown_tx.subscribe();
    let mut retries: u32 = 0;
    loop {
        info!("service {} starting", spec.name);
        let started = Instant::now();
        let result = (spec.start)(shutdown_tx.subscribe()).await;
        let uptime = started.elapsed();

        let clean_exit = match result {
            Ok(()) => true,
            Err(e) => {
                error!("service {} failed after {uptime:?}: {e:#}", spec.name);
                false
            }
        };

        let shutdown_broadcast = !matches!(
            shutdown_watch.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        );
        if shutting_down.load(Ordering::SeqCst) || shutdown_broadcast {
            info!("service {} stopped", spec.name);
            return;
        }
        if uptime >= RETRY_RESET_UPTIME {
            retries = 0;
        }
        if !should_restart(spec.policy, clean_exit) {
            info!(
                "service {} exited; not restarting ({:?} policy)",
                spec.name, spec.policy
            );
            return;
        }

        let delay = restart_backoff(retries, base_delay);
        retries = retries.saturating_add(1);
        warn!(
            "restarting service {} in {:?} (attempt {})",
            spec.name, delay, retries
        );

        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.recv() => return,
        }
    }
}
