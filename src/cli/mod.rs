//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{config_path, Config};
use crate::registry::SessionRegistry;

#[derive(Debug, Parser)]
#[command(name = "claude-relay")]
#[command(about = "Multi-machine remote terminal relay for interactive CLI agents")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the hub server (the default when no subcommand is given)
    Start,
    /// Run a session launcher owning one PTY child
    Launch {
        /// Session id; also names the registry record and local endpoint
        #[arg(long)]
        id: String,
        /// Working directory for the child (defaults to the current dir)
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Forwarded to the child untouched
        #[arg(long)]
        skip_permissions: bool,
        /// Child argv; defaults to the agent CLI
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
    /// Run a peer agent federated with a hub
    Agent {
        /// Hub agent endpoint, e.g. wss://hub.example:8443/agent
        #[arg(long)]
        hub_url: String,
        /// Stable machine id (defaults to the hostname)
        #[arg(long)]
        machine_id: Option<String>,
        /// Advertised P2P address (defaults to wss://<hostname>:<port>)
        #[arg(long)]
        p2p_address: Option<String>,
    },
    /// Print the current session registry scan as JSON
    Sessions,
    /// Query a running hub for its sessions and machines
    Status {
        /// Hub client endpoint
        #[arg(long, default_value = "wss://127.0.0.1:8443/")]
        url: String,
        /// Accept self-signed certificates
        #[arg(long)]
        insecure: bool,
    },
    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the resolved configuration (secrets redacted)
    Show,
    /// Print the config file path
    Path,
}

pub fn handle_sessions() -> Result<(), Box<dyn std::error::Error>> {
    let sessions = SessionRegistry::default().scan();
    println!("{}", serde_json::to_string_pretty(&sessions)?);
    Ok(())
}

/// Connect to a running hub as a client and print a one-shot summary.
pub async fn handle_status(
    config: &Config,
    url: &str,
    insecure: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let token = config.require_auth_token()?;
    let mut target = url::Url::parse(url)?;
    target.query_pairs_mut().append_pair("token", token);

    let mut ws = crate::agent::connect_ws(target.as_str(), insecure).await?;
    ws.send(Message::Text(r#"{"type":"list_machines"}"#.to_string()))
        .await?;

    let deadline = std::time::Duration::from_secs(10);
    loop {
        let frame = tokio::time::timeout(deadline, ws.next())
            .await?
            .ok_or("connection closed before a response arrived")??;
        let Message::Text(text) = frame else {
            continue;
        };
        let value: serde_json::Value = serde_json::from_str(&text)?;
        match value.get("type").and_then(|t| t.as_str()) {
            Some("sessions") => {
                let count = value["sessions"].as_array().map(|s| s.len()).unwrap_or(0);
                println!("sessions: {}", count);
            }
            Some("machines") => {
                let machines = value["machines"].as_array().cloned().unwrap_or_default();
                println!("machines: {}", machines.len());
                for machine in machines {
                    println!(
                        "  {} [{}] sessions={} projects={}",
                        machine["id"].as_str().unwrap_or("?"),
                        machine["status"].as_str().unwrap_or("?"),
                        machine["sessionCount"].as_u64().unwrap_or(0),
                        machine["projectCount"].as_u64().unwrap_or(0),
                    );
                }
                break;
            }
            Some("error") => {
                return Err(format!(
                    "hub error: {}",
                    value["message"].as_str().unwrap_or("unknown")
                )
                .into());
            }
            _ => {}
        }
    }
    Ok(())
}

pub fn handle_config_show(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut shown = config.clone();
    shown.auth_token = shown.auth_token.map(|_| "<set>".to_string());
    shown.agent_token = shown.agent_token.map(|_| "<set>".to_string());
    shown.agent_client_token = shown.agent_client_token.map(|_| "<set>".to_string());
    shown.webhook_secret = shown.webhook_secret.map(|_| "<set>".to_string());
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}

pub fn handle_config_path() {
    println!("{}", config_path().display());
}

pub fn handle_version() {
    println!("claude-relay {}", env!("CARGO_PKG_VERSION"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn launch_args() {
        let cli = Cli::parse_from([
            "claude-relay",
            "launch",
            "--id",
            "proj",
            "--cwd",
            "/home/u/p",
            "--skip-permissions",
            "--",
            "claude",
            "--resume",
        ]);
        match cli.command {
            Some(Command::Launch {
                id,
                cwd,
                skip_permissions,
                argv,
            }) => {
                assert_eq!(id, "proj");
                assert_eq!(cwd.unwrap(), PathBuf::from("/home/u/p"));
                assert!(skip_permissions);
                assert_eq!(argv, vec!["claude", "--resume"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn default_is_hub() {
        let cli = Cli::parse_from(["claude-relay"]);
        assert!(cli.command.is_none());
    }
}
