//! NakenBot - Entry Point
//!
//! Loads configuration from the environment, installs Ctrl-C handling
//! against an owned shutdown handle, and runs the bot until it stops.

use nakenbot::{Bot, Config};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("NakenBot v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let mut bot = Bot::new(config)?;

    // Signal handling owns an explicit handle, not a global bot reference.
    let handle = bot.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl-C, shutting down");
            handle.shutdown();
        }
    });

    if let Err(e) = bot.run().await {
        error!("bot stopped with error: {e:#}");
        return Err(e);
    }

    info!("bot stopped");
    Ok(())
}
