//! Backhaul - reach services behind NAT through agent-held WebSockets
//!
//! `backhaul serve` accepts agent control connections and exposes local TCP
//! port forwards that dial through a named agent.

use anyhow::{Context, Result};
use backhaul_mux::SessionConfig;
use backhaul_server::{Server, ServerConfig, TokenAuthorizer};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Backhaul - reach services behind NAT through agent-held WebSockets
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(version = VERSION)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept agents and forward local ports through them
    #[command(long_about = r#"
Accept agent WebSocket connections and forward local TCP ports to targets
reachable from a given agent.

EXAMPLES:
  # Accept node-1 and expose its SSH host on local port 2222
  backhaul serve --bind 0.0.0.0:8080 \
    --agent-token node-1=$NODE1_TOKEN \
    --forward node-1@127.0.0.1:2222=10.0.0.5:22

  # Start from a config file
  backhaul serve --config backhaul.yaml

ENVIRONMENT VARIABLES:
  BACKHAUL_BIND      Address for the agent upgrade endpoint
  BACKHAUL_PATH      Upgrade route path
    "#)]
    Serve {
        /// Address for the agent upgrade endpoint
        #[arg(long, env = "BACKHAUL_BIND")]
        bind: Option<SocketAddr>,

        /// Upgrade route path
        #[arg(long, env = "BACKHAUL_PATH")]
        path: Option<String>,

        /// Agent credentials as KEY=TOKEN (repeatable)
        #[arg(long = "agent-token", value_parser = parse_agent_token)]
        agent_tokens: Vec<(String, String)>,

        /// Port forward as AGENT@LISTEN=TARGET (repeatable)
        #[arg(long = "forward", value_parser = parse_forward)]
        forwards: Vec<Forward>,

        /// Connect deadline sent with every dial, in milliseconds
        #[arg(long)]
        connect_timeout_ms: Option<u64>,

        /// Configuration file (YAML)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

/// One local listener forwarding to a target through an agent
#[derive(Debug, Clone, PartialEq, Eq)]
struct Forward {
    agent: String,
    listen: SocketAddr,
    target: String,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    bind: Option<SocketAddr>,
    path: Option<String>,
    connect_timeout_ms: Option<u64>,

    /// Agent key to token
    agents: BTreeMap<String, String>,

    /// Forwards in AGENT@LISTEN=TARGET form
    forwards: Vec<String>,
}

#[derive(Debug)]
struct RelaySettings {
    bind: SocketAddr,
    path: String,
    tokens: TokenAuthorizer,
    forwards: Vec<Forward>,
    connect_timeout: Duration,
}

fn parse_agent_token(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, token)) if !key.is_empty() && !token.is_empty() => {
            Ok((key.to_string(), token.to_string()))
        }
        _ => Err(format!("expected KEY=TOKEN, got '{}'", value)),
    }
}

fn parse_forward(value: &str) -> Result<Forward, String> {
    let invalid = || format!("expected AGENT@LISTEN=TARGET, got '{}'", value);

    let (agent, rest) = value.split_once('@').ok_or_else(invalid)?;
    let (listen, target) = rest.split_once('=').ok_or_else(invalid)?;
    if agent.is_empty() || target.is_empty() {
        return Err(invalid());
    }

    let listen = listen
        .parse()
        .map_err(|e| format!("invalid listen address '{}': {}", listen, e))?;

    Ok(Forward {
        agent: agent.to_string(),
        listen,
        target: target.to_string(),
    })
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Merge CLI flags over the config file
fn build_settings(
    bind: Option<SocketAddr>,
    path: Option<String>,
    agent_tokens: Vec<(String, String)>,
    forwards: Vec<Forward>,
    connect_timeout_ms: Option<u64>,
    file: ConfigFile,
) -> Result<RelaySettings> {
    let mut tokens = TokenAuthorizer::new();
    for (key, token) in file.agents.into_iter().chain(agent_tokens) {
        tokens.insert(key, token);
    }
    if tokens.is_empty() {
        anyhow::bail!("At least one agent is required (use --agent-token or config file)");
    }

    let mut all_forwards = file
        .forwards
        .iter()
        .map(|entry| parse_forward(entry).map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()
        .context("Invalid forward in config file")?;
    all_forwards.extend(forwards);

    let bind = match bind.or(file.bind) {
        Some(bind) => bind,
        None => "0.0.0.0:8080".parse().context("Invalid default bind address")?,
    };

    Ok(RelaySettings {
        bind,
        path: path.or(file.path).unwrap_or_else(|| "/connect".to_string()),
        tokens,
        forwards: all_forwards,
        connect_timeout: Duration::from_millis(
            connect_timeout_ms.or(file.connect_timeout_ms).unwrap_or(10_000),
        ),
    })
}

/// Accept local clients and pipe each through a fresh agent connection
async fn run_forward(
    server: Server,
    forward: Forward,
    connect_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(forward.listen)
        .await
        .with_context(|| format!("Failed to bind forward listener {}", forward.listen))?;

    info!(
        agent_id = %forward.agent,
        listen = %forward.listen,
        target = %forward.target,
        "Forwarding"
    );

    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted.context("Forward listener failed")?,
        };

        let dialer = match server.get_agent_dialer(&forward.agent, connect_timeout) {
            Ok(dialer) => dialer,
            Err(e) => {
                warn!(agent_id = %forward.agent, client = %peer, error = %e, "Dropping client");
                continue;
            }
        };

        let target = forward.target.clone();
        tokio::spawn(async move {
            if let Err(e) = pipe_client(socket, dialer, &target).await {
                debug!(client = %peer, target = %target, error = %e, "Forwarded connection ended");
            }
        });
    }
}

async fn pipe_client(
    mut socket: TcpStream,
    dialer: backhaul_mux::Dialer,
    target: &str,
) -> Result<()> {
    let mut conn = dialer.dial("tcp", target).await?;
    let result = tokio::io::copy_bidirectional(&mut socket, &mut conn).await;
    conn.close().await;

    let (sent, received) = result?;
    debug!(conn_id = conn.id(), sent, received, "Forwarded connection closed");
    Ok(())
}

async fn serve(settings: RelaySettings) -> Result<()> {
    let config = ServerConfig::default()
        .with_path(settings.path.clone())
        .with_session(SessionConfig::default());
    let server = Server::new(config, Arc::new(settings.tokens)).context("Failed to create server")?;

    let shutdown = CancellationToken::new();
    let mut forwards = Vec::new();
    for forward in settings.forwards {
        forwards.push(tokio::spawn(run_forward(
            server.clone(),
            forward,
            settings.connect_timeout,
            shutdown.clone(),
        )));
    }

    let listen = backhaul_server::listen(server.clone(), settings.bind);
    tokio::pin!(listen);

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = &mut listen => result.context("Agent endpoint failed"),
    };

    shutdown.cancel();
    for agent in server.manager().agent_keys() {
        server.manager().remove_agent(&agent).await;
    }
    for forward in forwards {
        match forward.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Forward failed: {:#}", e),
            Err(e) => error!("Forward task panicked: {}", e),
        }
    }

    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    match cli.command {
        Commands::Serve {
            bind,
            path,
            agent_tokens,
            forwards,
            connect_timeout_ms,
            config,
        } => {
            info!("Backhaul {} starting...", VERSION);

            let file = match &config {
                Some(config_path) => {
                    info!("Loading configuration from: {}", config_path.display());
                    load_config_file(config_path)?
                }
                None => ConfigFile::default(),
            };
            let settings =
                build_settings(bind, path, agent_tokens, forwards, connect_timeout_ms, file)
                    .context("Failed to build configuration")?;

            info!("Agent endpoint: {}{}", settings.bind, settings.path);
            info!("Known agents: {}", settings.tokens.len());

            serve(settings).await?;
            info!("Backhaul stopped");
            Ok(())
        }
    }
}
