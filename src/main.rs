use clap::Parser;
use tracing::error;

use claude_relay::agent::{run_agent, AgentOptions};
use claude_relay::cli::{Cli, Command, ConfigCommand};
use claude_relay::config::Config;
use claude_relay::launcher::{run_launcher, LauncherOptions};
use claude_relay::logging::{init_logging, LogConfig};
use claude_relay::registry::SessionRegistry;
use claude_relay::server::run_hub;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the hub.
        None | Some(Command::Start) => {
            init_logging(LogConfig::from_env())?;
            let config = Config::load()?;
            if let Err(err) = run_hub(config).await {
                error!("fatal: {}", err);
                std::process::exit(1);
            }
            Ok(())
        }

        Some(Command::Launch {
            id,
            cwd,
            skip_permissions,
            argv,
        }) => {
            init_logging(LogConfig::from_env())?;
            let config = Config::load()?;
            let cwd = match cwd {
                Some(cwd) => cwd,
                None => std::env::current_dir()?,
            };
            let opts = LauncherOptions {
                id,
                cwd,
                argv,
                geometry: config.pty_geometry(),
                skip_permissions,
            };
            run_launcher(opts, SessionRegistry::default()).await?;
            Ok(())
        }

        Some(Command::Agent {
            hub_url,
            machine_id,
            p2p_address,
        }) => {
            init_logging(LogConfig::from_env())?;
            let config = Config::load()?;
            let opts = AgentOptions {
                hub_url,
                machine_id,
                p2p_address,
            };
            if let Err(err) = run_agent(config, opts).await {
                error!("fatal: {}", err);
                std::process::exit(1);
            }
            Ok(())
        }

        Some(Command::Sessions) => claude_relay::cli::handle_sessions(),

        Some(Command::Status { url, insecure }) => {
            let config = Config::load()?;
            claude_relay::cli::handle_status(&config, &url, insecure).await
        }

        Some(Command::Config(sub)) => {
            match sub {
                ConfigCommand::Show => {
                    let config = Config::load()?;
                    claude_relay::cli::handle_config_show(&config)?;
                }
                ConfigCommand::Path => claude_relay::cli::handle_config_path(),
            }
            Ok(())
        }

        Some(Command::Version) => {
            claude_relay::cli::handle_version();
            Ok(())
        }
    }
}
