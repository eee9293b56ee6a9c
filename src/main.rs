//! pagelink - control plane for a browser extension
//!
//! **Default** (`pagelink serve`): listens for the extension on a WebSocket
//! and runs until Ctrl+C.
//!
//! **One-shot** (`pagelink state`, `pagelink action`): starts the server,
//! waits for the extension to connect, performs a single exchange, prints the
//! result as JSON and exits.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser as ClapParser, Subcommand};
use pagelink::{
    config::{self, BridgeConfig, ConfigError},
    Bridge, BridgeError,
};
use serde_json::Value;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// pagelink - control plane for a browser extension
///
/// Accepts WebSocket connections from the extension, sends it requests and
/// correlates its responses.
#[derive(ClapParser, Debug)]
#[command(name = "pagelink", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to <config dir>/pagelink/config.toml)
    #[arg(long, env = "PAGELINK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Host to listen on (overrides the config file)
    #[arg(long, env = "PAGELINK_HOST", global = true)]
    host: Option<String>,

    /// Port to listen on (overrides the config file)
    #[arg(long, env = "PAGELINK_PORT", global = true)]
    port: Option<u16>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the server until Ctrl+C
    Serve,

    /// Print the current page state as JSON
    State {
        /// Include a base64 screenshot
        #[arg(long)]
        screenshot: bool,

        /// Seconds to wait for the extension to connect
        #[arg(long, default_value_t = 30.0)]
        wait: f64,
    },

    /// Execute one action and print the extension's response as JSON
    Action {
        /// Action name, e.g. "click_element" or "go_to_url"
        name: String,

        /// Action parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        /// Seconds to wait for the extension to connect
        #[arg(long, default_value_t = 30.0)]
        wait: f64,

        /// Seconds to wait for the action to complete (defaults to config)
        #[arg(long)]
        timeout: Option<f64>,
    },
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Bridge(#[from] BridgeError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid duration: {0}")]
    Duration(#[from] std::time::TryFromFloatSecsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(&cli)?;
    let bridge = Bridge::new(config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(&bridge).await,
        Commands::State { screenshot, wait } => {
            let wait = Duration::try_from_secs_f64(wait)?;
            one_shot(&bridge, wait, |bridge| async move {
                let state = bridge.get_state(screenshot).await?;
                Ok(serde_json::to_value(&state)?)
            })
            .await
        }
        Commands::Action { name, params, wait, timeout } => {
            let wait = Duration::try_from_secs_f64(wait)?;
            let timeout = timeout.map(Duration::try_from_secs_f64).transpose()?;
            let params: Value = serde_json::from_str(&params)?;
            one_shot(&bridge, wait, |bridge| async move {
                let data = bridge.execute_action(&name, params, timeout).await?;
                Ok(serde_json::to_value(&data)?)
            })
            .await
        }
    }
}

fn load_config(cli: &Cli) -> Result<BridgeConfig, CliError> {
    let mut config = match cli.config.clone().or_else(config::default_config_path) {
        Some(path) => {
            let config = BridgeConfig::load_or_default(&path)?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            config
        }
        None => BridgeConfig::default(),
    };

    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    Ok(config)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pagelink=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_server(bridge: &Bridge) -> Result<(), CliError> {
    bridge.start().await?;
    if let Some(addr) = bridge.server().local_addr() {
        eprintln!("pagelink: waiting for the extension on ws://{}", addr);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C");

    bridge.stop().await;
    Ok(())
}

/// Start, wait for the extension, run `call`, print its output, stop.
///
/// The server is stopped whether or not the call succeeds.
async fn one_shot<'a, F, Fut>(bridge: &'a Bridge, wait: Duration, call: F) -> Result<(), CliError>
where
    F: FnOnce(&'a Bridge) -> Fut,
    Fut: std::future::Future<Output = Result<Value, CliError>>,
{
    bridge.start().await?;

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C");
            Err(CliError::Bridge(BridgeError::shutting_down()))
        }
        result = async {
            bridge.wait_for_connection(wait).await?;
            call(bridge).await
        } => result,
    };

    bridge.stop().await;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
