use anyhow::Context;
use clap::Parser;
use compositor::api::xlinestore::XlineStore;
use compositor::cli::{Cli, Commands};
use compositor::commands::{apply::user_apply, delete::user_delete};
use compositor::protocol::config::load_config;
use log::{error, info};
use std::path::Path;
use tokio_util::sync::CancellationToken;

fn config_path(path: &Path) -> anyhow::Result<&str> {
    path.to_str()
        .with_context(|| format!("config path {} is not valid UTF-8", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config_path(config)?)?;
            let token = CancellationToken::new();
            let shutdown = token.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for ctrl-c: {e}");
                }
                info!("shutting down");
                shutdown.cancel();
            });
            compositor::run(cfg, token).await?;
        }
        Commands::Apply { config, file } => {
            let cfg = load_config(config_path(config)?)?;
            let xline_store = XlineStore::new(&cfg.xline_config).await?;
            user_apply(file, &xline_store).await?;
        }
        Commands::Delete { config, name } => {
            let cfg = load_config(config_path(config)?)?;
            let xline_store = XlineStore::new(&cfg.xline_config).await?;
            user_delete(name, &xline_store).await?;
        }
    }

    Ok(())
}
