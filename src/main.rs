// src/main.rs

//! The pgward entry point: logging setup, command dispatch, and the single
//! place where error kinds become process exit codes.

use pgward::cli;
use std::env;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    // PG_AUTOCTL_DEBUG raises the default level; RUST_LOG wins over both.
    let default_level = if env::var_os("PG_AUTOCTL_DEBUG").is_some() {
        "debug"
    } else {
        "info"
    };
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .compact()
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .init();

    let opts = match cli::parse_args(&args) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("pgward: {e}");
            eprintln!("{}", cli::USAGE);
            std::process::exit(e.exit_code());
        }
    };

    if let Err(e) = cli::dispatch(opts).await {
        error!("{e}");
        std::process::exit(e.exit_code());
    }
}
