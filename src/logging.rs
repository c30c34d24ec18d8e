// Sunkfin Core - offline downloads for the Sunkfin media client
// Copyright (C) 2025 Sunkfin contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Logging setup
//!
//! Console output plus an optional plain-text log file at
//! `{log_dir}/sunkfin.log`, both with local `%Y-%m-%d %H:%M:%S` timestamps.
//! `RUST_LOG` overrides the configured level.

use crate::error::{Result, SunkfinError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_FILE_NAME: &str = "sunkfin.log";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter, e.g. "info" or "sunkfin_core=debug"
    pub level: String,

    /// Directory for the log file; no file logging when unset
    pub log_dir: Option<PathBuf>,

    /// Also write to stdout
    pub console: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            console: true,
        }
    }
}

impl LogConfig {
    pub fn log_file(&self) -> Option<PathBuf> {
        self.log_dir.as_ref().map(|dir| dir.join(LOG_FILE_NAME))
    }
}

/// Keeps the file writer alive; logging to file stops when dropped
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber
///
/// Fails with `LoggingAlreadyInitialized` if a subscriber is already set.
pub fn init(config: &LogConfig) -> Result<LogGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = config.console.then(|| {
        fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
            .with_ansi(false)
    });

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).map_err(|e| {
                SunkfinError::FileIoError(format!(
                    "Failed to create log directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| SunkfinError::LoggingAlreadyInitialized)?;

    info!(
        level = %config.level,
        file = ?config.log_file(),
        "logging initialized"
    );

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.console);
        assert!(config.log_file().is_none());
    }

    #[test]
    fn test_log_file_location() {
        let config: LogConfig = serde_json::from_str(r#"{"log_dir": "/tmp/Logs"}"#).unwrap();
        assert_eq!(config.level, "info");
        assert_eq!(config.log_file(), Some(PathBuf::from("/tmp/Logs/sunkfin.log")));
    }
}
