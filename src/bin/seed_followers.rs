//! Bulk-load synthetic followers for a creator into the SQLite follower
//! store, so repeated pipeline runs can reuse a seeded database.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use fanout_notify::config::{self, Config};
use fanout_notify::store::sqlite;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    /// Creator to seed followers for
    #[arg(long)]
    creator_id: String,
    /// Number of followers to generate
    #[arg(long, default_value_t = 10_000)]
    count: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = if args.config.exists() {
        config::load(Some(&args.config))?
    } else {
        Config::default()
    };

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/fanout.db", cfg.store.data_dir));
    let pool = sqlite::init_pool(&database_url).await?;
    sqlite::run_migrations(&pool).await?;

    let seeded = sqlite::seed_followers(&pool, &args.creator_id, args.count).await?;
    info!(creator = %args.creator_id, count = seeded, "seeded followers");
    Ok(())
}
