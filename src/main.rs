use clap::Parser;
use color_eyre::Result;
use slotline::{cli, config::Config, logging, server};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use tracing::{debug, error, info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    if let Some(command) = cli.command {
        cli::handle_command(command);

        return Ok(());
    }

    let config = if let Some(config_path) = cli.config {
        Config::new_from_path(config_path)
    } else {
        Config::default()
    };

    std::fs::create_dir_all(&config.log_dir)?;
    logging::init(Level::INFO, Some((Level::INFO, config.log_dir.clone()))).await;
    debug!(mapping = ?config.mapping_path, log_dir = ?config.log_dir, "Configuration loaded");

    #[cfg(unix)]
    {
        let mut hangup = signal(SignalKind::hangup())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, quitting")
            }
            _ = hangup.recv() => {
                info!("Told to hang up, quitting")
            }
            _ = server::run_on_port(config, cli.port) => {
                error!("Server returned");
                return Err(color_eyre::eyre::eyre!("Server stopped unexpectedly"));
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, quitting")
            }
            _ = server::run_on_port(config, cli.port) => {
                error!("Server returned");
                return Err(color_eyre::eyre::eyre!("Server stopped unexpectedly"));
            }
        }
    }

    Ok(())
}
