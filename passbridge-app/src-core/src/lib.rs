pub mod auth;
pub mod clock;
pub mod commands;
pub mod error;
pub mod gateway;
pub mod security;
pub mod session;
pub mod state;
pub mod storage;
pub mod vault;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use error::AppError;
use gateway::GatewayServer;
use state::AppState;
use storage::{init_data_dir, load_settings, save_settings};

/// One line of input on stdin.
#[derive(Debug, Deserialize)]
struct CommandRequest {
    /// Echoed back so callers can match responses.
    #[serde(default)]
    id: Value,
    command: String,
    #[serde(default)]
    payload: Value,
}

pub fn run() {
    // stdout carries command responses, so logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "passbridge_app=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting Passbridge...");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run_app()) {
        error!("Passbridge exited with an error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_app() -> anyhow::Result<()> {
    let data_dir = init_data_dir().context("initializing data directory")?;
    info!("Data directory: {:?}", data_dir);

    let settings = load_settings(&data_dir);
    if !data_dir.join("settings.json").exists() {
        if let Err(e) = save_settings(&data_dir, &settings) {
            warn!("Could not write default settings: {}", e);
        }
    }
    settings.warn_if_weak();

    let state = Arc::new(AppState::open(&data_dir, settings).context("opening vault")?);

    // Migrates a legacy App ID before any companion can connect
    state
        .app_store
        .get_or_create_app_id()
        .context("loading App ID")?;

    match state.sessions.verify().await {
        Ok(user) => info!("Restored session for {} (vault locked)", user.username),
        Err(_) => debug!("No session to restore"),
    }

    let _gateway_task = if state.settings.gateway_enabled {
        match start_gateway(&state).await {
            Ok(task) => Some(task),
            Err(e) => {
                error!("Companion gateway unavailable: {:#}", e);
                None
            }
        }
    } else {
        info!("Companion gateway disabled in settings");
        None
    };

    let sweeper = spawn_sweeper(state.clone());

    tokio::select! {
        result = command_loop(&state) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    // Closing the app is a lock event
    state.sessions.lock().await;
    sweeper.abort();
    info!("Passbridge stopped");
    Ok(())
}

async fn start_gateway(state: &AppState) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let ip: IpAddr = state
        .settings
        .gateway_host
        .parse()
        .with_context(|| format!("invalid gateway host {:?}", state.settings.gateway_host))?;
    let addr = SocketAddr::new(ip, state.settings.gateway_port);
    let server = GatewayServer::bind(state.gateway.clone(), addr).await?;
    Ok(server.spawn())
}

fn spawn_sweeper(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(state.settings.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = state.sweep();
            if removed > 0 {
                debug!("Sweeper removed {} rate-limit records", removed);
            }
        }
    })
}

/// Serve newline-delimited JSON requests from stdin until EOF.
async fn command_loop(state: &AppState) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<CommandRequest>(&line) {
            Ok(request) => {
                let mut response =
                    commands::dispatch(state, &request.command, request.payload).await;
                if !request.id.is_null() {
                    response["id"] = request.id;
                }
                response
            }
            Err(e) => {
                warn!("Ignoring malformed request: {}", e);
                json!({
                    "success": false,
                    "error": AppError::InvalidInput(format!("malformed request: {}", e)),
                })
            }
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    info!("Input closed");
    Ok(())
}
