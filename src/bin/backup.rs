//! Snapshot and restore tool for the trip diary database and object storage.
//!
//! - `tripmap-backup backup [--out DIR]` writes a timestamped backup directory
//! - `tripmap-backup restore DIR` loads one back

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tripmap::{
    config::AppConfig,
    db::{init_pool, run_migrations},
    services::backup::BackupService,
    state::AppState,
};

#[derive(Parser)]
#[command(name = "tripmap-backup")]
#[command(about = "Back up or restore trips, photos, tags and stored objects")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new backup directory
    Backup {
        /// Parent directory for the timestamped backup
        #[arg(long, env = "BACKUP_DIR", default_value = "backups")]
        out: PathBuf,
    },
    /// Restore from a backup directory written by `backup`
    Restore { dir: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("load configuration")?;
    let db = init_pool(&config.database_url)
        .await
        .context("open database")?;
    run_migrations(&db).await.context("run migrations")?;

    let state = AppState::new(config, db);
    state.storage.ensure_structure().await?;
    let service = BackupService::new(state.db.clone(), state.storage.clone());

    match cli.command {
        Commands::Backup { out } => {
            let report = service.backup(&out).await.context("backup failed")?;
            info!("backup written to {}", report.dir.display());
        }
        Commands::Restore { dir } => {
            let report = service.restore(&dir).await.context("restore failed")?;
            info!(
                trips = report.trips,
                photos = report.photos,
                objects = report.objects,
                "restored from {}",
                report.dir.display()
            );
        }
    }

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tripmap=debug".into());

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
