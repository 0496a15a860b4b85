use anyhow::{Context, Result};
use clap::Parser;
use screenshot_archive::{setup_logging, Cli, CliRunner, Config};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting screenshot-archive v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    let runner = CliRunner::new(config);

    let cancel = CancellationToken::new();
    let _shutdown_handler = setup_shutdown_handler(cancel.clone());

    if let Err(e) = runner.run(args.command, cancel).await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("screenshot-archive stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> Result<Config> {
    let mut config = if let Some(config_path) = &args.config {
        let config_content = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        serde_json::from_str(&config_content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Override with CLI arguments
    if let Some(url) = &args.queue_url {
        config.queue.url = Some(url.clone());
    }

    if let Some(url) = &args.database_url {
        config.database.url = Some(url.clone());
    }

    if let Some(blob_dir) = &args.blob_dir {
        config.storage.blob_dir = blob_dir.clone();
    }

    if let Some(pool_size) = args.pool_size {
        config.browser.pool_size = pool_size;
    }

    if let Some(chrome_path) = &args.chrome_path {
        config.browser.chrome_path = Some(chrome_path.clone());
    }

    if let Some(timeout) = args.timeout {
        config.queue.wait_reply_timeout = Duration::from_secs(timeout);
    }

    config.validate()?;

    info!("Configuration loaded");
    info!("Queue: {}", config.queue.url.as_deref().unwrap_or("in-process"));
    info!("Wait reply timeout: {:?}", config.queue.wait_reply_timeout);
    info!("Browser pool size: {}", config.browser.pool_size);

    Ok(config)
}

fn setup_shutdown_handler(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                cancel.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    })
}
