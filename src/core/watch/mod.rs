// src/core/watch/mod.rs

//! The notification listener, run on monitor nodes only.
//!
//! Keeps a long-lived connection with `LISTEN state; LISTEN log` and logs
//! every event at INFO. Losing notifications is harmless: the monitor's SQL
//! state is the truth and the keepers converge through `node_active`. The
//! connection is re-established with exponential backoff, and negotiates
//! TLS exactly like the RPC client does: the `sslmode` of the monitor URI
//! decides, with the configured CA file honored.

use crate::core::monitor::notifications::StateNotification;
use crate::core::monitor::rustls_client_config;
use crate::core::supervisor::ShutdownMode;
use futures::StreamExt;
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_postgres::config::SslMode;
use tokio_postgres::{AsyncMessage, Client, Connection, NoTls};
use tracing::{debug, info, warn};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// The `listener` service: subscribes to the monitor's channels and turns
/// payloads into log lines.
pub struct NotificationListener {
    uri: String,
    ca_file: Option<PathBuf>,
}

impl NotificationListener {
    pub fn new(uri: String, ca_file: Option<PathBuf>) -> Self {
        Self { uri, ca_file }
    }

    pub async fn run(
        self,
        mut shutdown_rx: broadcast::Receiver<ShutdownMode>,
    ) -> anyhow::Result<()> {
        let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

        loop {
            match self.listen_once(&mut shutdown_rx).await {
                // Ok means a shutdown was requested while draining.
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "notification connection lost: {e}; reconnecting in {:?}",
                        reconnect_delay
                    );
                }
            }

            // Jitter keeps a fleet of listeners from reconnecting in
            // lock-step after a monitor restart.
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
            tokio::select! {
                _ = tokio::time::sleep(reconnect_delay + jitter) => {}
                _ = shutdown_rx.recv() => {
                    info!("notification listener stopping");
                    return Ok(());
                }
            }
            reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
        }
    }

    /// One connection lifetime: connect per the URI's `sslmode`, subscribe,
    /// then drain messages until the stream ends. `Ok` means a shutdown was
    /// requested while draining.
    async fn listen_once(
        &self,
        shutdown_rx: &mut broadcast::Receiver<ShutdownMode>,
    ) -> anyhow::Result<()> {
        let config: tokio_postgres::Config = self.uri.parse()?;
        if config.get_ssl_mode() == SslMode::Disable {
            let (client, connection) = config.connect(NoTls).await?;
            self.drain(client, connection, shutdown_rx).await
        } else {
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(rustls_client_config(
                self.ca_file.as_deref(),
            )?);
            let (client, connection) = config.connect(tls).await?;
            self.drain(client, connection, shutdown_rx).await
        }
    }

    async fn drain<S, T>(
        &self,
        client: Client,
        mut connection: Connection<S, T>,
        shutdown_rx: &mut broadcast::Receiver<ShutdownMode>,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut messages =
            futures::stream::poll_fn(move |cx| connection.poll_message(cx));

        // The subscription has to go through the same connection we drain,
        // so run it concurrently with the first polls of the stream.
        let subscribe = client.batch_execute("LISTEN state; LISTEN log");
        tokio::pin!(subscribe);
        let mut subscribed = false;

        info!("listening for state and log notifications");

        loop {
            tokio::select! {
                result = &mut subscribe, if !subscribed => {
                    result?;
                    subscribed = true;
                    debug!("subscribed to the state and log channels");
                }
                message = messages.next() => {
                    match message {
                        Some(Ok(AsyncMessage::Notification(n))) => match n.channel() {
                            "state" => match StateNotification::parse(n.payload()) {
                                Some(event) => info!("{}", event.describe()),
                                None => debug!("unparsed state payload: {}", n.payload()),
                            },
                            "log" => info!("monitor: {}", n.payload()),
                            other => debug!("notification on unexpected channel {other}"),
                        },
                        Some(Ok(AsyncMessage::Notice(notice))) => {
                            debug!("monitor notice: {}", notice.message());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => anyhow::bail!("connection closed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("notification listener stopping");
                    return Ok(());
                }
            }
        }
    }
}
