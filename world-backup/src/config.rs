//! Configuration management for the backup daemon.
//!
//! Loads configuration from an optional TOML file; command-line flags
//! override file values. The Discord credential only ever comes from the
//! environment.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the Discord bot token.
pub const DISCORD_TOKEN_ENV: &str = "DISCORD_TOKEN";

/// Longest accepted backup interval (31 days).
pub const MAX_INTERVAL_MINUTES: u64 = 31 * 24 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory holding the game's save files
    #[serde(default)]
    pub source_dir: Option<PathBuf>,

    /// Game name used in the caption and artifact name
    #[serde(default = "default_game")]
    pub game: String,

    /// Whether files are zipped into one artifact or sent individually
    #[serde(default)]
    pub mode: DeliveryMode,

    /// Directory the zip artifacts are written to
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Minutes between backups
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,

    /// Run a single backup and exit
    #[serde(default)]
    pub once: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Destination channel id
    #[serde(default)]
    pub channel_id: Option<String>,

    /// REST API base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Largest attachment the channel accepts, in bytes
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,

    /// Seconds allowed to establish a connection
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Seconds allowed for a whole request, upload included
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Zip everything into a single artifact
    #[default]
    Archive,
    /// Attach every save file as-is
    Raw,
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "archive" | "zip" => Ok(DeliveryMode::Archive),
            "raw" => Ok(DeliveryMode::Raw),
            other => Err(format!("unknown delivery mode '{}' (expected archive or raw)", other)),
        }
    }
}

// Default values
fn default_game() -> String {
    "Valheim".to_string()
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_interval_minutes() -> u64 {
    60
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_max_attachment_bytes() -> u64 {
    25 * 1024 * 1024
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            source_dir: None,
            game: default_game(),
            mode: DeliveryMode::default(),
            artifact_dir: default_artifact_dir(),
            interval_minutes: default_interval_minutes(),
            once: false,
        }
    }
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            channel_id: None,
            api_base: default_api_base(),
            max_attachment_bytes: default_max_attachment_bytes(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))
    }

    /// Check the required options and freeze the schedule.
    pub fn resolve(&self) -> Result<ScheduleConfig> {
        let source_dir = self
            .backup
            .source_dir
            .clone()
            .ok_or_else(|| BackupError::Config("saved game location is required".into()))?;

        let channel_id = self
            .discord
            .channel_id
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| BackupError::Config("discord channel is required".into()))?;

        let minutes = self.backup.interval_minutes;
        if minutes == 0 || minutes > MAX_INTERVAL_MINUTES {
            return Err(BackupError::Config(format!(
                "backup interval must be between 1 and {} minutes, got {}",
                MAX_INTERVAL_MINUTES, minutes
            )));
        }
        let interval_secs = minutes
            .checked_mul(60)
            .ok_or_else(|| BackupError::Config(format!("backup interval {} is too large", minutes)))?;

        if self.backup.mode == DeliveryMode::Archive
            && is_within(&self.backup.artifact_dir, &source_dir)
        {
            return Err(BackupError::Config(format!(
                "artifact directory {} is inside the saved game location {}",
                self.backup.artifact_dir.display(),
                source_dir.display()
            )));
        }

        if self.backup.game.trim().is_empty() {
            return Err(BackupError::Config("game name must not be empty".into()));
        }

        Ok(ScheduleConfig {
            source_dir,
            channel_id,
            interval: Duration::from_secs(interval_secs),
            once: self.backup.once,
            game: self.backup.game.clone(),
            mode: self.backup.mode,
            artifact_dir: self.backup.artifact_dir.clone(),
        })
    }
}

/// Whether `path` is `root` or somewhere below it. The deepest existing
/// ancestor of each path is resolved so symlinks and `.` compare equal.
fn is_within(path: &Path, root: &Path) -> bool {
    fn normalize(p: &Path) -> PathBuf {
        let absolute = std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf());
        let mut existing = absolute.as_path();
        let mut rest = Vec::new();
        loop {
            if let Ok(resolved) = existing.canonicalize() {
                return rest.iter().rev().fold(resolved, |acc, part| acc.join(part));
            }
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    rest.push(name.to_os_string());
                    existing = parent;
                }
                _ => return absolute,
            }
        }
    }
    normalize(path).starts_with(normalize(root))
}

/// Immutable per-process backup settings handed to the scheduler and
/// orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub source_dir: PathBuf,
    pub channel_id: String,
    pub interval: Duration,
    pub once: bool,
    pub game: String,
    pub mode: DeliveryMode,
    pub artifact_dir: PathBuf,
}

impl ScheduleConfig {
    pub fn caption(&self) -> String {
        format!("Backing up all {} worlds", self.game)
    }
}

/// Discord bot token. Never printed.
#[derive(Clone)]
pub struct DiscordToken(String);

impl DiscordToken {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(BackupError::Startup(format!("{} not set", DISCORD_TOKEN_ENV)));
        }
        Ok(Self(token))
    }

    /// Read the token from `DISCORD_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let token = std::env::var(DISCORD_TOKEN_ENV)
            .map_err(|_| BackupError::Startup(format!("{} not set", DISCORD_TOKEN_ENV)))?;
        Self::new(token)
    }

    pub fn authorization(&self) -> String {
        format!("Bot {}", self.0)
    }
}

impl std::fmt::Debug for DiscordToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DiscordToken(***)")
    }
}
