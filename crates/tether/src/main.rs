//! # tether
//!
//! Tether binary: an echo/broadcast `WebSocket` server and an interactive
//! reconnecting client, both driven by the shared settings file.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tether_settings::TetherSettings;
use tether_ws::middleware::{logging, max_message_size};
use tether_ws::{Client, Handler, HandlerError, Message, MiddlewareChain, Server};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Tether `WebSocket` server and client.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Tether WebSocket server and client")]
struct Cli {
    /// Settings file (defaults to `$TETHER_CONFIG` or `~/.tether/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the echo server. Text frames starting with `/all ` are broadcast.
    Serve {
        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,
        /// Port to bind, 0 for auto-assign (overrides settings).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connect to a server, send stdin lines as text frames, print replies.
    Connect {
        /// Target URL (overrides settings).
        url: Option<String>,
    },
}

fn load(path: Option<&PathBuf>) -> Result<TetherSettings> {
    let path = path.cloned().unwrap_or_else(tether_settings::settings_path);
    tether_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

fn init_logging(settings: &TetherSettings) {
    if settings.logging.json {
        tether_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        tether_core::logging::init_subscriber(&settings.logging.level);
    }
}

fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Echo every data frame; fan `/all <text>` out to every connection.
fn echo_or_broadcast(server: Arc<OnceLock<Server>>) -> Handler {
    Handler::new(move |conn, message: Message| {
        let server = Arc::clone(&server);
        async move {
            if let Some(rest) = message.as_text().and_then(|t| t.strip_prefix("/all ")) {
                if let Some(server) = server.get() {
                    let report = server.broadcast(&Message::text(rest));
                    info!(
                        conn_id = %conn.id(),
                        delivered = report.delivered,
                        dropped = report.dropped,
                        "broadcast"
                    );
                    return Ok(());
                }
            }
            conn.send_async(message)?;
            Ok::<_, HandlerError>(())
        }
    })
}

async fn serve(mut settings: TetherSettings, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }
    let metrics = install_recorder()?;

    let slot = Arc::new(OnceLock::new());
    let chain = MiddlewareChain::new()
        .with(logging())
        .with(max_message_size(settings.server.max_message_size));
    let server = Server::builder(settings.server)
        .middleware(chain)
        .handler(echo_or_broadcast(Arc::clone(&slot)))
        .build()
        .context("Invalid server settings")?;
    let _ = slot.set(server.clone());

    let extra = Router::new().route("/metrics", get(move || std::future::ready(metrics.render())));
    let handle = server.start_with(extra).await.context("Failed to start server")?;
    info!(url = %handle.ws_url(), "tether server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    if !server.shutdown().await {
        warn!("some connection tasks did not finish before the shutdown deadline");
    }
    handle.join().await;
    Ok(())
}

async fn connect(mut settings: TetherSettings, url: Option<String>) -> Result<()> {
    if let Some(url) = url {
        settings.client.url = url;
    }
    let client = Client::builder(settings.client)
        .on_state_change(|from, to| info!(%from, %to, "client state"))
        .on_reconnect_attempt(|attempt, delay| info!(attempt, ?delay, "reconnecting"))
        .on_reconnect_failed(|err| warn!(error = %err, "gave up reconnecting"))
        .build()
        .context("Invalid client settings")?;
    client.connect().await.context("Failed to connect")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if !line.is_empty() => {
                    if let Err(e) = client.send_async(Message::text(line)) {
                        warn!(error = %e, "send failed");
                    }
                }
                Some(_) => {}
                None => break,
            },
            message = client.recv() => match message {
                Some(message) => match message.as_text() {
                    Some(text) => println!("{text}"),
                    None => println!("<{} bytes>", message.len()),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(cli.config.as_ref())?;
    init_logging(&settings);

    match cli.command {
        Command::Serve { host, port } => serve(settings, host, port).await,
        Command::Connect { url } => connect(settings, url).await,
    }
}
