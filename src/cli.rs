// src/cli.rs

//! Command-line surface: parsing, the command table, and dispatch.
//!
//! Commands operate on the keeper for one data directory, found through
//! `--pgdata` or the `PGDATA` environment variable. Read commands offer
//! `--json`; control commands signal the running supervisor through its PID
//! file.

use crate::config::{FilePaths, KeeperConfig, NodeKind};
use crate::core::errors::KeeperError;
use crate::core::keeper::Keeper;
use crate::core::keeper::pidfile::{PidFile, pid_is_alive};
use crate::core::keeper::state::{KeeperState, KeeperStateFile};
use crate::core::monitor::{MonitorClient, MonitorLink};
use crate::core::postgres::{LocalPostgres, PostgresAdmin, kill_postmaster};
use crate::core::roles::NodeRole;
use crate::core::supervisor::{RestartPolicy, ServiceSpec, ShutdownMode, Supervisor};
use crate::core::watch::NotificationListener;
use futures::FutureExt;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{info, warn};

/// The command selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Run,
    Stop(ShutdownMode),
    Reload,
    Status,
    ShowState,
    EnableMaintenance,
    DisableMaintenance,
    DropNode { destroy: bool },
    CreatePostgres,
    CreateMonitor,
    Version,
    Help,
}

/// Parsed command line: the command plus every recognized flag.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub command: Option<Command>,
    pub pgdata: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub nodename: Option<String>,
    pub hostname: Option<String>,
    pub pgport: Option<u16>,
    pub formation: Option<String>,
    pub group: Option<i32>,
    pub monitor: Option<String>,
    pub auth: Option<String>,
    pub skip_pg_hba: bool,
    pub ssl_mode: Option<String>,
    pub ssl_ca_file: Option<PathBuf>,
    pub ssl_crl_file: Option<PathBuf>,
    pub ssl_cert_file: Option<PathBuf>,
    pub ssl_key_file: Option<PathBuf>,
    pub no_ssl: bool,
    pub json: bool,
}

pub const USAGE: &str = "\
usage: pgward <command> [options]

commands:
  run                      start the keeper and its services
  stop [--fast|--immediate] stop the running keeper
  reload                   ask the running keeper to reload its configuration
  status                   report on the keeper and its Postgres instance
  show state               print the persisted keeper state
  enable maintenance       put this node into maintenance
  disable maintenance      bring this node back from maintenance
  drop node [--destroy]    remove this node from the monitor
  create postgres          register this node and prepare its data directory
  create monitor           prepare a monitor node
  version                  print the version

options:
  --pgdata <dir>           data directory (or $PGDATA)
  --config <file>          alternate configuration file
  --nodename <name>        node name reported to the monitor
  --hostname <host>        host other nodes use to reach this one
  --pgport <port>          Postgres port
  --formation <name>       formation to join
  --group <id>             replication group id
  --monitor <uri>          postgres:// URI of the monitor
  --auth <method>          authentication method for generated HBA rules
  --skip-pg-hba            never edit pg_hba.conf
  --ssl-mode <mode>        sslmode for replication connections
  --ssl-ca-file <file>     certificate authority file
  --ssl-crl-file <file>    certificate revocation list
  --ssl-cert-file <file>   server certificate
  --ssl-key-file <file>    server key
  --no-ssl                 disable SSL
  --json                   JSON output for read commands
";

fn flag_value(args: &[String], i: &mut usize, flag: &str) -> Result<String, KeeperError> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| KeeperError::Usage(format!("{flag} requires a value")))
}

/// Parses the raw arguments (without the program name).
pub fn parse_args(args: &[String]) -> Result<CliOptions, KeeperError> {
    let mut opts = CliOptions::default();
    let mut words: Vec<String> = Vec::new();
    let mut fast = false;
    let mut immediate = false;
    let mut destroy = false;

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        if !arg.starts_with("--") {
            words.push(arg.to_string());
            i += 1;
            continue;
        }
        match arg {
            "--pgdata" => opts.pgdata = Some(PathBuf::from(flag_value(args, &mut i, arg)?)),
            "--config" => opts.config = Some(PathBuf::from(flag_value(args, &mut i, arg)?)),
            "--nodename" => opts.nodename = Some(flag_value(args, &mut i, arg)?),
            "--hostname" => opts.hostname = Some(flag_value(args, &mut i, arg)?),
            "--pgport" => {
                let value = flag_value(args, &mut i, arg)?;
                opts.pgport = Some(value.parse().map_err(|_| {
                    KeeperError::Usage(format!("invalid port '{value}'"))
                })?);
            }
            "--formation" => opts.formation = Some(flag_value(args, &mut i, arg)?),
            "--group" => {
                let value = flag_value(args, &mut i, arg)?;
                opts.group = Some(value.parse().map_err(|_| {
                    KeeperError::Usage(format!("invalid group '{value}'"))
                })?);
            }
            "--monitor" => opts.monitor = Some(flag_value(args, &mut i, arg)?),
            "--auth" => opts.auth = Some(flag_value(args, &mut i, arg)?),
            "--skip-pg-hba" => opts.skip_pg_hba = true,
            "--ssl-mode" => opts.ssl_mode = Some(flag_value(args, &mut i, arg)?),
            "--ssl-ca-file" => {
                opts.ssl_ca_file = Some(PathBuf::from(flag_value(args, &mut i, arg)?));
            }
            "--ssl-crl-file" => {
                opts.ssl_crl_file = Some(PathBuf::from(flag_value(args, &mut i, arg)?));
            }
            "--ssl-cert-file" => {
                opts.ssl_cert_file = Some(PathBuf::from(flag_value(args, &mut i, arg)?));
            }
            "--ssl-key-file" => {
                opts.ssl_key_file = Some(PathBuf::from(flag_value(args, &mut i, arg)?));
            }
            "--no-ssl" => opts.no_ssl = true,
            "--json" => opts.json = true,
            "--fast" => fast = true,
            "--immediate" => immediate = true,
            "--destroy" => destroy = true,
            "--version" => words.push("version".to_string()),
            "--help" => words.push("help".to_string()),
            other => return Err(KeeperError::Usage(format!("unknown option '{other}'"))),
        }
        i += 1;
    }

    let words: Vec<&str> = words.iter().map(|s| s.as_str()).collect();
    let command = match words.as_slice() {
        [] => return Err(KeeperError::Usage("missing command".into())),
        ["run"] => Command::Run,
        ["stop"] => {
            if fast && immediate {
                return Err(KeeperError::Usage(
                    "--fast and --immediate are mutually exclusive".into(),
                ));
            }
            Command::Stop(if immediate {
                ShutdownMode::Immediate
            } else if fast {
                ShutdownMode::Fast
            } else {
                ShutdownMode::Smart
            })
        }
        ["reload"] => Command::Reload,
        ["status"] => Command::Status,
        ["show", "state"] => Command::ShowState,
        ["enable", "maintenance"] => Command::EnableMaintenance,
        ["disable", "maintenance"] => Command::DisableMaintenance,
        ["drop", "node"] => Command::DropNode { destroy },
        ["create", "postgres"] => Command::CreatePostgres,
        ["create", "monitor"] => Command::CreateMonitor,
        ["version"] => Command::Version,
        ["help"] => Command::Help,
        other => {
            return Err(KeeperError::Usage(format!(
                "unknown command '{}'",
                other.join(" ")
            )));
        }
    };
    opts.command = Some(command);
    Ok(opts)
}

fn resolve_pgdata(opts: &CliOptions) -> Result<PathBuf, KeeperError> {
    if let Some(pgdata) = &opts.pgdata {
        return Ok(pgdata.clone());
    }
    std::env::var_os("PGDATA")
        .map(PathBuf::from)
        .ok_or_else(|| KeeperError::Usage("--pgdata is required (or set PGDATA)".into()))
}

fn config_path(opts: &CliOptions, paths: &FilePaths) -> PathBuf {
    opts.config.clone().unwrap_or_else(|| paths.config.clone())
}

fn load_config(opts: &CliOptions) -> Result<(KeeperConfig, FilePaths), KeeperError> {
    let pgdata = resolve_pgdata(opts)?;
    let paths = FilePaths::for_pgdata(&pgdata);
    let path = config_path(opts, &paths);
    let config = KeeperConfig::from_file(&path)
        .map_err(|e| KeeperError::Config(format!("{e:#}")))?;
    Ok((config, paths))
}

/// Folds the command-line flags into a configuration, for the create
/// commands.
fn config_from_options(opts: &CliOptions, pgdata: PathBuf) -> KeeperConfig {
    let mut config = KeeperConfig::default();
    config.postgresql.pgdata = pgdata;
    if let Some(monitor) = &opts.monitor {
        config.pg_autoctl.monitor = monitor.clone();
    }
    if let Some(formation) = &opts.formation {
        config.pg_autoctl.formation = formation.clone();
    }
    config.pg_autoctl.group = opts.group.or(config.pg_autoctl.group);
    if let Some(nodename) = &opts.nodename {
        config.pg_autoctl.name = nodename.clone();
    }
    config.pg_autoctl.hostname = opts
        .hostname
        .clone()
        .unwrap_or_else(default_hostname);
    if let Some(auth) = &opts.auth {
        config.pg_autoctl.auth_method = auth.clone();
    }
    config.pg_autoctl.skip_pg_hba = opts.skip_pg_hba;
    if let Some(port) = opts.pgport {
        config.postgresql.port = port;
    }
    if opts.no_ssl {
        config.ssl.active = false;
        config.ssl.sslmode = "disable".to_string();
    } else {
        if let Some(mode) = &opts.ssl_mode {
            config.ssl.sslmode = mode.clone();
        }
        config.ssl.active = opts.ssl_cert_file.is_some() || opts.ssl_mode.is_some();
        config.ssl.cert_file = opts.ssl_cert_file.clone();
        config.ssl.key_file = opts.ssl_key_file.clone();
        config.ssl.ca_file = opts.ssl_ca_file.clone();
        config.ssl.crl_file = opts.ssl_crl_file.clone();
    }
    config
}

fn default_hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let cstr = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr() as *const libc::c_char) };
        if let Ok(name) = cstr.to_str()
            && !name.is_empty()
        {
            return name.to_string();
        }
    }
    "localhost".to_string()
}

fn monitor_client(config: &KeeperConfig) -> Result<Arc<MonitorClient>, KeeperError> {
    Ok(Arc::new(MonitorClient::new(
        &config.pg_autoctl.monitor,
        config.ssl.ca_file.clone(),
    )?))
}

/// Runs the selected command to completion.
pub async fn dispatch(opts: CliOptions) -> Result<(), KeeperError> {
    match opts.command.ok_or_else(|| KeeperError::Usage("missing command".into()))? {
        Command::Version => {
            println!("pgward {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Help => {
            println!("{USAGE}");
            Ok(())
        }
        Command::Run => run_supervisor(&opts).await,
        Command::Stop(mode) => signal_supervisor(&opts, stop_signal(mode)),
        Command::Reload => signal_supervisor(&opts, libc::SIGHUP),
        Command::Status => show_status(&opts, false).await,
        Command::ShowState => show_status(&opts, true).await,
        Command::EnableMaintenance => toggle_maintenance(&opts, true).await,
        Command::DisableMaintenance => toggle_maintenance(&opts, false).await,
        Command::DropNode { destroy } => drop_node(&opts, destroy).await,
        Command::CreatePostgres => create_postgres(&opts).await,
        Command::CreateMonitor => create_monitor(&opts).await,
    }
}

fn stop_signal(mode: ShutdownMode) -> libc::c_int {
    match mode {
        ShutdownMode::Smart => libc::SIGTERM,
        ShutdownMode::Fast => libc::SIGINT,
        ShutdownMode::Immediate => libc::SIGQUIT,
    }
}

async fn run_supervisor(opts: &CliOptions) -> Result<(), KeeperError> {
    let (config, paths) = load_config(opts)?;
    let mut supervisor = Supervisor::new(paths.pid.clone(), config.pg_autoctl.shutdown_timeout);
    let pg: Arc<LocalPostgres> = Arc::new(LocalPostgres::from_config(&config));

    supervisor.add_service(postgres_service(pg.clone(), config.postgresql.pgdata.clone()));

    match config.pg_autoctl.role {
        NodeKind::Keeper => {
            // Fail fast on a missing or corrupt state file, before the PID
            // file exists and before any service starts.
            let state_file = KeeperStateFile::new(&paths.state);
            if !state_file.exists() {
                return Err(KeeperError::Config(format!(
                    "no keeper state at {}; run 'pgward create postgres' first",
                    state_file.path().display()
                )));
            }
            state_file.read()?;

            let monitor = monitor_client(&config)?;
            let reload_tx = supervisor.reload_sender();
            let shutdown_tx = supervisor.shutdown_sender();
            supervisor.add_service(keeper_service(
                config.clone(),
                pg.clone(),
                monitor,
                reload_tx,
                shutdown_tx,
            ));
        }
        NodeKind::Monitor => {
            supervisor.add_service(listener_service(
                config.pg_autoctl.monitor.clone(),
                config.ssl.ca_file.clone(),
            ));
            // A monitor node's Postgres is expected up from the start.
            pg.expected_up().store(true, Ordering::SeqCst);
        }
    }

    supervisor.run().await
}

fn keeper_service(
    config: KeeperConfig,
    pg: Arc<LocalPostgres>,
    monitor: Arc<MonitorClient>,
    reload_tx: tokio::sync::broadcast::Sender<()>,
    shutdown_tx: tokio::sync::broadcast::Sender<ShutdownMode>,
) -> ServiceSpec {
    ServiceSpec {
        name: "node-active",
        // Restart on crashes only: a clean return means shutdown or a
        // dropped node, and then the whole process is done.
        policy: RestartPolicy::Transient,
        start: Box::new(move |shutdown_rx| {
            let config = config.clone();
            let pg: Arc<dyn PostgresAdmin> = pg.clone();
            let monitor: Arc<dyn MonitorLink> = monitor.clone();
            let reload_rx = reload_tx.subscribe();
            let shutdown_tx = shutdown_tx.clone();
            async move {
                let keeper = Keeper::new(config, pg, monitor)?;
                keeper.run(shutdown_rx, reload_rx).await?;
                let _ = shutdown_tx.send(ShutdownMode::Smart);
                Ok(())
            }
            .boxed()
        }),
    }
}

/// Watches the postmaster: restarts it whenever the state machine expects it
/// up but `pg_ctl status` says otherwise, and stops it on shutdown.
fn postgres_service(pg: Arc<LocalPostgres>, pgdata: PathBuf) -> ServiceSpec {
    ServiceSpec {
        name: "postgres",
        policy: RestartPolicy::Permanent,
        start: Box::new(move |mut shutdown_rx| {
            let pg = pg.clone();
            let pgdata = pgdata.clone();
            async move {
                let expected = pg.expected_up();
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if expected.load(Ordering::SeqCst) && !pg.is_running().await {
                                warn!("postgres is expected up but not running; starting it");
                                if let Err(e) = pg.ensure_running().await {
                                    warn!("could not start postgres: {e}");
                                }
                            }
                        }
                        mode = shutdown_rx.recv() => {
                            if let Ok(mode) = mode {
                                info!("stopping postgres ({mode:?})");
                                if pg.ensure_stopped(mode.stop_mode()).await.is_err()
                                    && mode == ShutdownMode::Immediate
                                    && kill_postmaster(&pgdata)
                                {
                                    warn!("postmaster had to be killed");
                                }
                            }
                            return Ok(());
                        }
                    }
                }
            }
            .boxed()
        }),
    }
}

fn listener_service(monitor_uri: String, ca_file: Option<PathBuf>) -> ServiceSpec {
    ServiceSpec {
        name: "listener",
        policy: RestartPolicy::Permanent,
        start: Box::new(move |shutdown_rx| {
            let uri = monitor_uri.clone();
            let ca_file = ca_file.clone();
            async move {
                NotificationListener::new(uri, ca_file)
                    .run(shutdown_rx)
                    .await
            }
            .boxed()
        }),
    }
}

fn signal_supervisor(opts: &CliOptions, sig: libc::c_int) -> Result<(), KeeperError> {
    let pgdata = resolve_pgdata(opts)?;
    let paths = FilePaths::for_pgdata(&pgdata);
    let contents = PidFile::new(&paths.pid).read().map_err(|_| {
        KeeperError::StateIo(format!(
            "pgward does not seem to be running for {} (no pid file)",
            pgdata.display()
        ))
    })?;
    if !pid_is_alive(contents.supervisor_pid) {
        return Err(KeeperError::StateIo(format!(
            "stale pid file: process {} is gone",
            contents.supervisor_pid
        )));
    }
    let rc = unsafe { libc::kill(contents.supervisor_pid as libc::pid_t, sig) };
    if rc != 0 {
        return Err(KeeperError::Internal(format!(
            "could not signal pid {}: {}",
            contents.supervisor_pid,
            std::io::Error::last_os_error()
        )));
    }
    info!("signaled pid {}", contents.supervisor_pid);
    Ok(())
}

/// What `status` and `show state` print.
#[derive(Debug, Serialize)]
struct StatusReport {
    pgdata: PathBuf,
    nodename: String,
    formation: String,
    group: i32,
    node_id: i64,
    current_role: NodeRole,
    assigned_role: NodeRole,
    keeper_running: bool,
    pg_is_running: bool,
    current_lsn: String,
    last_monitor_contact: Option<String>,
    nodes_version: i32,
}

async fn show_status(opts: &CliOptions, state_only: bool) -> Result<(), KeeperError> {
    let (config, paths) = load_config(opts)?;
    let state = KeeperStateFile::new(&paths.state).read()?;

    let keeper_running = PidFile::new(&paths.pid)
        .read()
        .map(|c| pid_is_alive(c.supervisor_pid))
        .unwrap_or(false);
    let pg = LocalPostgres::from_config(&config);
    let local = pg.probe().await;

    let report = StatusReport {
        pgdata: config.postgresql.pgdata.clone(),
        nodename: config.nodename().to_string(),
        formation: config.pg_autoctl.formation.clone(),
        group: state.current_group,
        node_id: state.current_node_id,
        current_role: state.current_role,
        assigned_role: state.assigned_role,
        keeper_running,
        pg_is_running: local.pg_is_running,
        current_lsn: state.current_lsn().to_string(),
        last_monitor_contact: state
            .last_monitor_contact_time()
            .map(|t| t.to_rfc3339()),
        nodes_version: state.current_nodes_version,
    };

    if opts.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report)
                .map_err(|e| KeeperError::Internal(e.to_string()))?
        );
        return Ok(());
    }

    if state_only {
        println!("node id:          {}", report.node_id);
        println!("formation/group:  {}/{}", report.formation, report.group);
        println!("current role:     {}", report.current_role);
        println!("assigned role:    {}", report.assigned_role);
        println!("current lsn:      {}", report.current_lsn);
        println!("nodes version:    {}", report.nodes_version);
        println!(
            "monitor contact:  {}",
            report.last_monitor_contact.as_deref().unwrap_or("never")
        );
    } else {
        println!("pgdata:           {}", report.pgdata.display());
        println!("node:             {} (id {})", report.nodename, report.node_id);
        println!("formation/group:  {}/{}", report.formation, report.group);
        println!(
            "keeper:           {}",
            if report.keeper_running { "running" } else { "stopped" }
        );
        println!(
            "postgres:         {}",
            if report.pg_is_running { "running" } else { "stopped" }
        );
        println!(
            "role:             {} (assigned {})",
            report.current_role, report.assigned_role
        );
    }
    Ok(())
}

async fn toggle_maintenance(opts: &CliOptions, enable: bool) -> Result<(), KeeperError> {
    let (config, paths) = load_config(opts)?;
    let state = KeeperStateFile::new(&paths.state).read()?;
    let monitor = monitor_client(&config)?;

    let accepted = if enable {
        monitor.start_maintenance(state.current_node_id).await?
    } else {
        monitor.stop_maintenance(state.current_node_id).await?
    };
    if accepted {
        println!(
            "maintenance {} for node {}",
            if enable { "enabled" } else { "disabled" },
            state.current_node_id
        );
        Ok(())
    } else {
        Err(KeeperError::Monitor(format!(
            "the monitor refused to {} maintenance for node {}",
            if enable { "start" } else { "stop" },
            state.current_node_id
        )))
    }
}

async fn drop_node(opts: &CliOptions, destroy: bool) -> Result<(), KeeperError> {
    let (config, paths) = load_config(opts)?;
    let state_file = KeeperStateFile::new(&paths.state);
    let state = state_file.read()?;
    let monitor = monitor_client(&config)?;

    monitor.remove_node(state.current_node_id).await?;
    info!("node {} removed from the monitor", state.current_node_id);

    // Best effort: a running keeper notices the drop on its next tick, but a
    // direct stop is faster and works when the monitor path is gone.
    if let Ok(contents) = PidFile::new(&paths.pid).read()
        && pid_is_alive(contents.supervisor_pid)
    {
        unsafe { libc::kill(contents.supervisor_pid as libc::pid_t, libc::SIGTERM) };
    }

    let pg = LocalPostgres::from_config(&config);
    pg.ensure_stopped(ShutdownMode::Fast.stop_mode())
        .await
        .map_err(|e| KeeperError::PgCtl(e.to_string()))?;

    state_file.remove()?;
    if destroy {
        std::fs::remove_dir_all(&config.postgresql.pgdata).map_err(|e| {
            KeeperError::Internal(format!(
                "removing {}: {e}",
                config.postgresql.pgdata.display()
            ))
        })?;
        println!("node dropped; {} removed", config.postgresql.pgdata.display());
    } else {
        println!("node dropped; data directory left in place");
    }
    Ok(())
}

async fn create_postgres(opts: &CliOptions) -> Result<(), KeeperError> {
    let pgdata = resolve_pgdata(opts)?;
    let paths = FilePaths::for_pgdata(&pgdata);
    let state_file = KeeperStateFile::new(&paths.state);
    if state_file.exists() {
        let state = state_file.read()?;
        println!(
            "node already registered with id {} (role {})",
            state.current_node_id, state.current_role
        );
        return Ok(());
    }

    let cfg_path = config_path(opts, &paths);
    let config = if cfg_path.is_file() {
        KeeperConfig::from_file(&cfg_path).map_err(|e| KeeperError::Config(format!("{e:#}")))?
    } else {
        config_from_options(opts, pgdata.clone())
    };
    config
        .validate()
        .map_err(|e| KeeperError::Config(format!("{e:#}")))?;

    let pg = LocalPostgres::from_config(&config);
    if pg
        .init_if_needed()
        .await
        .map_err(|e| KeeperError::PgCtl(e.to_string()))?
    {
        info!("initialized {}", pgdata.display());
    }
    let control = pg
        .control_data()
        .await
        .map_err(|e| KeeperError::PgCtl(e.to_string()))?;

    // Open the door for the monitor's health checks before registering.
    if let Some(host) = monitor_host(&config.pg_autoctl.monitor) {
        pg.ensure_hba_for_host(&host, "autoctl_node", false)
            .map_err(|e| KeeperError::Config(e.to_string()))?;
    }

    let monitor = monitor_client(&config)?;
    let reply = monitor
        .register_node(
            &config.pg_autoctl.formation,
            config.pg_autoctl.group,
            config.nodename(),
            &config.pg_autoctl.hostname,
            config.postgresql.port,
            control.system_identifier,
            NodeRole::Init,
        )
        .await?;

    let state = KeeperState::for_registration(
        reply.node_id,
        reply.group_id,
        reply.assigned_role,
        control.system_identifier,
        control.pg_control_version,
        control.catalog_version,
    );
    state_file.init(&state)?;
    config
        .save_to(&config_path(opts, &paths))
        .map_err(|e| KeeperError::Config(format!("{e:#}")))?;

    println!(
        "registered as node {} in formation \"{}\" group {} (assigned {}); run 'pgward run' next",
        reply.node_id, config.pg_autoctl.formation, reply.group_id, reply.assigned_role
    );
    Ok(())
}

async fn create_monitor(opts: &CliOptions) -> Result<(), KeeperError> {
    let pgdata = resolve_pgdata(opts)?;
    let paths = FilePaths::for_pgdata(&pgdata);

    let mut config = config_from_options(opts, pgdata.clone());
    config.pg_autoctl.role = NodeKind::Monitor;
    if config.pg_autoctl.monitor.is_empty() {
        config.pg_autoctl.monitor = format!(
            "postgres://autoctl_node@{}:{}/pg_auto_failover",
            config.pg_autoctl.hostname, config.postgresql.port
        );
    }
    config
        .validate()
        .map_err(|e| KeeperError::Config(format!("{e:#}")))?;

    let pg = LocalPostgres::from_config(&config);
    if pg
        .init_if_needed()
        .await
        .map_err(|e| KeeperError::PgCtl(e.to_string()))?
    {
        info!("initialized {}", pgdata.display());
    }
    config
        .save_to(&config_path(opts, &paths))
        .map_err(|e| KeeperError::Config(format!("{e:#}")))?;

    println!(
        "monitor node prepared; install the pgautofailover extension, then run 'pgward run'"
    );
    println!("monitor URI: {}", config.pg_autoctl.monitor);
    Ok(())
}

/// First TCP host of the monitor URI, for the HBA rule that lets the monitor
/// run its health checks.
fn monitor_host(uri: &str) -> Option<String> {
    let config: tokio_postgres::Config = uri.parse().ok()?;
    config.get_hosts().iter().find_map(|host| match host {
        tokio_postgres::config::Host::Tcp(h) => Some(h.clone()),
        _ => None,
    })
}
