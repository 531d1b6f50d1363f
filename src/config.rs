use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "message-relay")]
#[command(about = "Durable message relay with acknowledged WebSocket delivery")]
pub struct Config {
    /// Address the HTTP/WebSocket server binds to.
    #[arg(long, default_value = "0.0.0.0:8000")]
    pub bind: String,

    /// SQLite database path. Falls back to $DATABASE_PATH, then the platform
    /// data directory.
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Seconds to wait for a confirm before a delivery attempt is abandoned.
    #[arg(long, default_value_t = 30)]
    pub ack_timeout: u64,

    /// Seconds between liveness pings on a connection.
    #[arg(long, default_value_t = 30)]
    pub ping_interval: u64,

    /// Seconds to wait for a pong before the connection is presumed dead.
    #[arg(long, default_value_t = 10)]
    pub ping_timeout: u64,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Disable the text-transform collaborator; raw producer text is stored
    /// and delivered as-is.
    #[arg(long, default_value_t = false)]
    pub skip_transform: bool,

    /// Model used by the text-transform collaborator.
    #[arg(long, default_value = "gpt-4o")]
    pub transform_model: String,

    /// File containing the system prompt for the transform collaborator.
    #[arg(long)]
    pub prompt_path: Option<PathBuf>,
}

impl Config {
    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.db_path {
            return path.clone();
        }
        if let Ok(value) = std::env::var("DATABASE_PATH") {
            let value = value.trim();
            if !value.is_empty() {
                return PathBuf::from(value);
            }
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("message-relay")
            .join("messages.db")
    }

    pub fn ack_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.ack_timeout)
    }

    pub fn ping_interval_duration(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    pub fn ping_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.ping_timeout)
    }
}
