//! Backhaul Agent - dials out to a backhaul server and serves its connect requests
//!
//! The agent keeps one WebSocket open to the server and dials targets inside
//! its network on the server's behalf, limited by an allowlist.

use anyhow::{Context, Result};
use backhaul_agent::{
    parse_server_url, register_agent, AgentError, Allowlist, ReconnectConfig, ReconnectManager,
    RegisterOptions,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

/// Backhaul agent - lets a backhaul server reach services in this network
#[derive(Parser, Debug)]
#[command(name = "backhaul-agent")]
#[command(version)]
#[command(long_about = r#"
Backhaul Agent opens one outbound WebSocket to a backhaul server and dials
targets in the local network when the server asks for them.

EXAMPLES:
  # Allow SSH to a single subnet
  backhaul-agent --url wss://backhaul.example.com/connect \
    --agent-id node-1 --token $TOKEN \
    --allow-network 10.0.0.0/24 --allow-port 22

  # Start agent using config file
  backhaul-agent --config agent.yaml --log-level debug

ENVIRONMENT VARIABLES:
  BACKHAUL_URL       Server upgrade URL (ws:// or wss://)
  BACKHAUL_AGENT_ID  Agent identifier
  BACKHAUL_TOKEN     Bearer token presented to the server
"#)]
struct Args {
    /// Server upgrade URL (e.g., wss://backhaul.example.com/connect)
    #[arg(long, env = "BACKHAUL_URL")]
    url: Option<String>,

    /// Agent ID (auto-generated if not specified)
    #[arg(long, env = "BACKHAUL_AGENT_ID")]
    agent_id: Option<String>,

    /// Bearer token
    #[arg(long, env = "BACKHAUL_TOKEN")]
    token: Option<String>,

    /// Network the server may dial into, in CIDR notation (repeatable)
    #[arg(long = "allow-network")]
    allow_networks: Vec<String>,

    /// Port the server may dial (repeatable)
    #[arg(long = "allow-port")]
    allow_ports: Vec<u16>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Give up after this many consecutive failed attempts
    #[arg(long)]
    max_attempts: Option<usize>,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerSection,
    agent: AgentSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ServerSection {
    url: Option<String>,

    /// Environment variable holding the token
    #[serde(skip_serializing_if = "Option::is_none")]
    token_env: Option<String>,

    /// Direct token (prefer token_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct AgentSection {
    id: Option<String>,
    allow_networks: Vec<String>,
    allow_ports: Vec<u16>,
    max_attempts: Option<usize>,
}

/// Everything needed to run the agent
#[derive(Debug)]
struct AgentSettings {
    url: String,
    agent_id: String,
    token: String,
    allowlist: Allowlist,
    reconnect: ReconnectConfig,
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

/// Merge CLI args with the config file, CLI taking precedence
fn build_settings(args: Args) -> Result<AgentSettings> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let file_token = match (&file.server.token_env, file.server.token) {
        (Some(env_var), _) => Some(
            std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?,
        ),
        (None, token) => token,
    };

    let url = args
        .url
        .or(file.server.url)
        .context("Server URL is required (use --url or config file)")?;
    parse_server_url(&url)?;

    let token = args
        .token
        .or(file_token)
        .filter(|token| !token.is_empty())
        .context("Token is required (use --token, environment variable, or config file)")?;

    let agent_id = args.agent_id.or(file.agent.id).unwrap_or_else(|| {
        let id = format!("agent-{}", Uuid::new_v4());
        info!("Auto-generated agent ID: {}", id);
        id
    });

    let networks = if args.allow_networks.is_empty() {
        file.agent.allow_networks
    } else {
        args.allow_networks
    };
    let ports = if args.allow_ports.is_empty() {
        file.agent.allow_ports
    } else {
        args.allow_ports
    };
    let allowlist = Allowlist::new(networks.as_slice(), ports)?;

    let reconnect = ReconnectConfig {
        max_attempts: args.max_attempts.or(file.agent.max_attempts),
        ..Default::default()
    };

    Ok(AgentSettings {
        url,
        agent_id,
        token,
        allowlist,
        reconnect,
    })
}

/// Register, and re-register with backoff whenever the session drops
async fn run(settings: AgentSettings, shutdown: CancellationToken) -> Result<()> {
    let options = RegisterOptions::default()
        .with_agent_id(&settings.agent_id)?
        .with_bearer_token(&settings.token)?
        .with_shutdown(shutdown.clone());
    let authorizer = Arc::new(settings.allowlist);
    let mut reconnect = ReconnectManager::new(settings.reconnect);

    loop {
        let started = Instant::now();
        let result = register_agent(&settings.url, options.clone(), authorizer.clone(), None).await;

        if shutdown.is_cancelled() {
            return Ok(());
        }

        match result {
            Ok(()) => return Ok(()),
            Err(e) if !e.is_retryable() => {
                return Err(anyhow::Error::new(e).context("Registration failed permanently"));
            }
            Err(e) => {
                warn!(error = %e, "Disconnected from server");
                reconnect.session_ended(started.elapsed());
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            waited = reconnect.wait() => {
                waited.context("Giving up on the server")?;
            }
        }
        info!(attempt = reconnect.attempt(), "Reconnecting");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    info!("Backhaul Agent starting...");

    let settings = build_settings(args).context("Failed to build agent configuration")?;

    // never log the token
    info!("Agent ID: {}", settings.agent_id);
    info!("Server: {}", settings.url);

    let shutdown = CancellationToken::new();
    let mut agent_task = tokio::spawn(run(settings, shutdown.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
            match agent_task.await {
                Ok(result) => result?,
                Err(e) => return Err(e.into()),
            }
        }
        result = &mut agent_task => {
            match result {
                Ok(Ok(())) => info!("Agent stopped normally"),
                Ok(Err(e)) => {
                    error!("Agent error: {:#}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("Agent task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    info!("Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["backhaul-agent"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_cli_settings() {
        let settings = build_settings(args(&[
            "--url",
            "ws://127.0.0.1:8080/connect",
            "--agent-id",
            "node-1",
            "--token",
            "t",
            "--allow-network",
            "10.0.0.0/8",
            "--allow-port",
            "22",
            "--max-attempts",
            "3",
        ]))
        .unwrap();

        assert_eq!(settings.agent_id, "node-1");
        assert_eq!(settings.reconnect.max_attempts, Some(3));
        assert!(settings.allowlist.is_allowed("10.1.2.3:22"));
        assert!(!settings.allowlist.is_allowed("10.1.2.3:80"));
    }

    #[test]
    fn test_missing_token_is_an_error() {
        let err = build_settings(args(&["--url", "ws://127.0.0.1:8080/connect"])).unwrap_err();
        assert!(err.to_string().contains("Token is required"));
    }

    #[test]
    fn test_http_url_is_rejected() {
        let err = build_settings(args(&["--url", "http://example.com", "--token", "t"])).unwrap_err();
        assert!(err.downcast_ref::<AgentError>().is_some());
    }

    #[test]
    fn test_config_file_parses() {
        let yaml = r#"
server:
  url: wss://backhaul.example.com/connect
  token: abc
agent:
  id: node-7
  allow_networks: ["192.168.0.0/16"]
  allow_ports: [443]
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.agent.id.as_deref(), Some("node-7"));
        assert_eq!(file.agent.allow_ports, vec![443]);
        assert_eq!(file.server.token.as_deref(), Some("abc"));
    }
}
