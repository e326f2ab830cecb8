use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be a positive integer, got {value}")]
    NonPositive { field: &'static str, value: i64 },
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// How producers finish once every producer has enqueued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProducerGate {
    /// Wait for the first successful dequeue, bounded by the abandonment timeout.
    #[default]
    Rendezvous,
    /// Finish as soon as the last producer has enqueued.
    Barrier,
}

/// The order in which the harness starts unit threads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SpawnOrder {
    #[default]
    ProducersFirst,
    ConsumersFirst,
    Shuffled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub producers: usize,
    pub consumers: usize,
    pub initial_capacity: usize,
    pub abandon_timeout_ms: u64,
    pub producer_gate: ProducerGate,
    pub spawn_order: SpawnOrder,
    // Seed for SpawnOrder::Shuffled; random when unset.
    pub shuffle_seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            producers: 10,
            consumers: 5,
            initial_capacity: 50,
            abandon_timeout_ms: 1_000,
            producer_gate: ProducerGate::default(),
            spawn_order: SpawnOrder::default(),
            shuffle_seed: None,
        }
    }
}

impl RunConfig {
    /// Loads a JSON config file. Missing keys take their default value.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn abandon_timeout(&self) -> Duration {
        Duration::from_millis(self.abandon_timeout_ms)
    }

    // Every count and the timeout must be at least 1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("producers", self.producers as u64),
            ("consumers", self.consumers as u64),
            ("initial_capacity", self.initial_capacity as u64),
            ("abandon_timeout_ms", self.abandon_timeout_ms),
        ];
        for (field, value) in fields {
            if value == 0 {
                return Err(ConfigError::NonPositive { field, value: 0 });
            }
        }
        Ok(())
    }
}

/// Converts a raw command-line value into a count, rejecting zero and negatives.
pub fn positive(field: &'static str, value: i64) -> Result<usize, ConfigError> {
    if value <= 0 {
        return Err(ConfigError::NonPositive { field, value });
    }
    usize::try_from(value).map_err(|_| ConfigError::NonPositive { field, value })
}
