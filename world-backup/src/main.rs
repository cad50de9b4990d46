//! World Backup - Main entry point
//!
//! Backs up a game server's save directory to a Discord channel.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use world_backup::config::{Config, DeliveryMode, DiscordToken};
use world_backup::daemon::{Scheduler, ShutdownCoordinator};
use world_backup::delivery::{DeliveryClient, DiscordClient};
use world_backup::{utils, BackupOrchestrator};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Filepath to the saved games
    #[arg(long, value_name = "DIR")]
    saved_game_location: Option<PathBuf>,

    /// Discord channel id
    #[arg(long, value_name = "ID")]
    discord_channel: Option<String>,

    /// Backup interval in minutes
    #[arg(long, value_name = "MINUTES")]
    backup_interval: Option<u64>,

    /// Only run the backup once and exit
    #[arg(long)]
    once: bool,

    /// Game name shown in the caption and archive name
    #[arg(long)]
    game: Option<String>,

    /// Delivery mode (archive, raw)
    #[arg(long)]
    mode: Option<DeliveryMode>,

    /// Directory the zip archives are written to
    #[arg(long, value_name = "DIR")]
    artifact_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

impl Args {
    /// Command-line values win over the config file.
    fn apply_to(self, config: &mut Config) {
        if let Some(dir) = self.saved_game_location {
            config.backup.source_dir = Some(dir);
        }
        if let Some(channel) = self.discord_channel {
            config.discord.channel_id = Some(channel);
        }
        if let Some(minutes) = self.backup_interval {
            config.backup.interval_minutes = minutes;
        }
        if self.once {
            config.backup.once = true;
        }
        if let Some(game) = self.game {
            config.backup.game = game;
        }
        if let Some(mode) = self.mode {
            config.backup.mode = mode;
        }
        if let Some(dir) = self.artifact_dir {
            config.backup.artifact_dir = dir;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    args.apply_to(&mut config);

    // Initialize logging
    utils::logger::init(&config.log.level)?;

    let schedule = Arc::new(config.resolve()?);
    tracing::info!(
        "Starting world-backup v{} ({} -> channel {}, {:?} mode)",
        env!("CARGO_PKG_VERSION"),
        schedule.source_dir.display(),
        schedule.channel_id,
        schedule.mode
    );

    // Connect once; the client is shared by every tick
    let token = DiscordToken::from_env()?;
    let client: Arc<dyn DeliveryClient> =
        Arc::new(DiscordClient::connect(token, &config.discord).await?);

    let orchestrator = BackupOrchestrator::new(schedule.clone(), client);
    let scheduler = Scheduler::new(orchestrator, schedule.interval);

    if schedule.once {
        let job = scheduler.run_once().await;
        tracing::info!(job_id = %job.id, "Single backup finished: {:?}", job.outcome);
        return Ok(());
    }

    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.listen();

    let ticks = scheduler.run(shutdown.token()).await;
    listener.abort();

    tracing::info!("Shutdown complete after {} backups", ticks);
    Ok(())
}
