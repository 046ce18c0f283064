use anyhow::Result;
use dotenvy::dotenv;
use std::sync::Arc;
use tokio::signal;

use tfwatch::core::{config, init_logger};
use tfwatch::engine::Engine;
use tfwatch::storage::create_pool;

/// Main entry point for the monitor service.
///
/// # Errors
/// Returns an error if initialization fails (logging, database, scheduler).
#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();

    // Initialize logger (console + file)
    init_logger(&config::LOG_FILE_PATH)?;

    log::info!("Starting tfwatch");

    let pool = Arc::new(create_pool(&config::DATABASE_PATH)?);

    // Startup recovery runs here: monitors interrupted mid-check by the
    // previous run are reset before scheduling resumes.
    let engine = Engine::with_defaults(pool)?;
    engine.start()?;

    signal::ctrl_c().await?;
    log::info!("Shutdown signal received, exiting");

    Ok(())
}
