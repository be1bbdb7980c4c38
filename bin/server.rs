// SCD Merge - Web Server
// Read-only JSON API over the dimension tables

use anyhow::{Context, Result};
use clap::Parser;
use scd_merge::api::{create_router, AppState};
use scd_merge::{MergeConfig, SqliteStore};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "scd-server", about = "Serve SCD2 dimensions over HTTP", version)]
struct Args {
    /// TOML config file
    #[arg(short, long, env = "SCD_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database (overrides config)
    #[arg(long, env = "SCD_DATABASE")]
    database: Option<PathBuf>,

    #[arg(long, env = "SCD_ADDR", default_value = "0.0.0.0:3000")]
    addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = MergeConfig::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(database) = args.database {
        config.database = database;
    }
    config.log.init();

    if !config.database.exists() {
        anyhow::bail!(
            "Database not found at {} (run `scd-merge init` first)",
            config.database.display()
        );
    }

    let store = SqliteStore::open(&config.database, config.busy_timeout())
        .with_context(|| format!("Failed to open {}", config.database.display()))?;
    info!(database = %config.database.display(), "database opened");

    let app = create_router(AppState::new(store, config.registry()?));

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", args.addr))?;

    println!("🚀 Server running on http://{}", args.addr);
    println!("   API: http://{}/api/dimensions", args.addr);

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}
