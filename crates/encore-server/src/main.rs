mod config;

use tracing::{error, info};

use encore_db::Database;
use encore_market::Marketplace;

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "encore=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    info!(
        "Opening {} ({} writers, {} readers)",
        config.db.path, config.db.writers, config.db.readers
    );

    // Opening runs pending migrations
    let db = Database::open(&config.db)?;
    let market = Marketplace::new(db, config.trust);

    let users = market.reconcile_all().await?;
    info!("Startup reconcile done for {} users", users);

    let Some(every) = config.reconcile_every else {
        return Ok(());
    };

    info!("Reconciling every {}s, Ctrl-C to stop", every.as_secs());
    let mut ticker = tokio::time::interval(every);
    // first tick fires immediately and startup already covered it
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match market.reconcile_all().await {
                    Ok(users) => info!("Reconciled {} users", users),
                    Err(e) => error!("Reconcile pass failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}
