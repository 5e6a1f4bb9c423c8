//! Startup configuration
//!
//! The server shares its configuration file with the presentation layer.
//! Only the movement speed matters here; every other key (sprite sizes,
//! laser timings, map tiling) is ignored. The speed is read from the
//! top-level `CHARACTER_MOVE_SPEED` key, falling back to
//! `character.moveSpeed`, which is where the browser client reads it.

use clap::Parser;
use log::info;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config file {0} sets neither CHARACTER_MOVE_SPEED nor character.moveSpeed")]
    MissingMoveSpeed(PathBuf),
    #[error("movement speed must be a finite number, got {0}")]
    InvalidMoveSpeed(f32),
}

/// Command line arguments of the relay server
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = shared::DEFAULT_PORT)]
    pub port: u16,

    /// Path to the common configuration file
    #[arg(short, long, default_value = "common-config.json")]
    pub config: PathBuf,

    /// Drop a room as soon as its last member leaves
    #[arg(long)]
    pub reap_empty_rooms: bool,

    /// Seconds between status log lines
    #[arg(long, default_value_t = 30)]
    pub status_interval: u64,
}

impl Args {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Default, Deserialize)]
struct CharacterSection {
    #[serde(rename = "moveSpeed")]
    move_speed: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct CommonConfigFile {
    #[serde(rename = "CHARACTER_MOVE_SPEED")]
    character_move_speed: Option<f32>,
    #[serde(default)]
    character: CharacterSection,
}

/// The part of the common configuration the relay depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommonConfig {
    pub move_speed: f32,
}

impl CommonConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let config = Self::parse(&contents, path)?;
        info!(
            "Configuration loaded from {} (move speed {})",
            path.display(),
            config.move_speed
        );
        Ok(config)
    }

    pub fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let file: CommonConfigFile =
            serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let move_speed = file
            .character_move_speed
            .or(file.character.move_speed)
            .ok_or_else(|| ConfigError::MissingMoveSpeed(path.to_path_buf()))?;

        if !move_speed.is_finite() {
            return Err(ConfigError::InvalidMoveSpeed(move_speed));
        }

        Ok(Self { move_speed })
    }
}

/// Everything the relay loop needs once startup is done
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelaySettings {
    pub move_speed: f32,
    pub reap_empty_rooms: bool,
    pub status_interval: Duration,
}

impl RelaySettings {
    pub fn new(config: CommonConfig, args: &Args) -> Self {
        Self {
            move_speed: config.move_speed,
            reap_empty_rooms: args.reap_empty_rooms,
            status_interval: Duration::from_secs(args.status_interval.max(1)),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            move_speed: 1.0,
            reap_empty_rooms: false,
            status_interval: Duration::from_secs(30),
        }
    }
}
