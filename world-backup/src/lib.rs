//! World Backup Library
//!
//! Periodically zips a game server's save directory and posts it to a
//! Discord channel.

pub mod archive;
pub mod config;
pub mod daemon;
pub mod delivery;
pub mod executor;
pub mod fs;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, ScheduleConfig};
pub use executor::{Backup, BackupJob, BackupOrchestrator};
pub use utils::errors::{BackupError, Result};
