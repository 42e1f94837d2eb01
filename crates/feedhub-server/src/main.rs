//! # feedhub server
//!
//! Pushes live unread-feed counters to every open browser session.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (or ./feedhub.toml if present)
//! feedhub
//!
//! # Run with environment variables
//! FEEDHUB_PORT=8080 FEEDHUB_HOST=0.0.0.0 feedhub
//! ```

mod config;
mod handlers;
mod metrics;
mod session;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedhub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!(
        "Starting feedhub on {}:{} with {} configured users",
        config.host,
        config.port,
        config.users.len()
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
