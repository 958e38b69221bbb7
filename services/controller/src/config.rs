//! Configuration for the controller.
//!
//! Every setting is a command-line flag that can also come from a
//! `KUBESOLV_*` environment variable. Settings are read and validated once at
//! startup; invalid values stop the process before any worker starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use kubesolv_reconcile::BackoffPolicy;
use thiserror::Error;

use crate::controller::ControllerSettings;
use crate::executor::WritePolicy;
use crate::reconciler::ReconcilerSettings;
use crate::resources::Resource;

/// Configuration errors. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read seed manifest {path}: {source}")]
    SeedIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse seed manifest {path}: {source}")]
    SeedParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// kubesolv controller - reconciles Solver, CubeState and SolveJob resources.
#[derive(Debug, Clone, Parser)]
#[command(name = "kubesolv-controller")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Number of concurrent reconciliation workers.
    #[arg(long, env = "KUBESOLV_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Retries a failing solve job gets after its first attempt.
    #[arg(long, env = "KUBESOLV_JOB_MAX_RETRIES", default_value_t = 3)]
    pub job_max_retries: u32,

    /// Base delay before a failed job is retried, in milliseconds.
    #[arg(long, env = "KUBESOLV_JOB_BACKOFF_BASE_MS", default_value_t = 1000)]
    pub job_backoff_base_ms: u64,

    /// Upper bound on the job retry delay, in milliseconds.
    #[arg(long, env = "KUBESOLV_JOB_BACKOFF_MAX_MS", default_value_t = 60_000)]
    pub job_backoff_max_ms: u64,

    /// Attempts per store or substrate write, including the first.
    #[arg(long, env = "KUBESOLV_WRITE_MAX_ATTEMPTS", default_value_t = 5)]
    pub write_max_attempts: u32,

    /// Base delay between write attempts, in milliseconds.
    #[arg(long, env = "KUBESOLV_WRITE_BACKOFF_BASE_MS", default_value_t = 50)]
    pub write_backoff_base_ms: u64,

    /// Upper bound on the delay between write attempts, in milliseconds.
    #[arg(long, env = "KUBESOLV_WRITE_BACKOFF_MAX_MS", default_value_t = 2000)]
    pub write_backoff_max_ms: u64,

    /// Garbage collection interval, in seconds.
    #[arg(long, env = "KUBESOLV_GC_INTERVAL_SECS", default_value_t = 30)]
    pub gc_interval_secs: u64,

    /// How often a deleting solver re-checks its children, in milliseconds.
    #[arg(long, env = "KUBESOLV_DRAIN_INTERVAL_MS", default_value_t = 500)]
    pub drain_interval_ms: u64,

    /// How often running jobs poll the execution substrate, in milliseconds.
    #[arg(long, env = "KUBESOLV_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "KUBESOLV_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// JSON file with resources to load into the store at startup.
    #[arg(long, env = "KUBESOLV_SEED")]
    pub seed: Option<PathBuf>,

    /// How long to wait for workers on shutdown, in seconds.
    #[arg(long, env = "KUBESOLV_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,
}

fn positive(field: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn backoff(
    base_field: &'static str,
    base_ms: u64,
    max_field: &'static str,
    max_ms: u64,
) -> Result<BackoffPolicy, ConfigError> {
    let base = positive(base_field, base_ms)?;
    let max = positive(max_field, max_ms)?;
    if base > max {
        return Err(ConfigError::Invalid {
            field: max_field,
            reason: format!("must be at least {base_field} ({base} ms)"),
        });
    }
    Ok(BackoffPolicy::new(
        Duration::from_millis(base),
        Duration::from_millis(max),
    ))
}

impl Config {
    /// Validate the raw values and build the immutable settings.
    pub fn settings(&self) -> Result<ControllerSettings, ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.write_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "write_max_attempts",
                reason: "must be greater than zero".to_string(),
            });
        }
        let log_levels = ["trace", "debug", "info", "warn", "error"];
        if !log_levels.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Invalid {
                field: "log_level",
                reason: format!("unknown level {:?}", self.log_level),
            });
        }

        let job_backoff = backoff(
            "job_backoff_base_ms",
            self.job_backoff_base_ms,
            "job_backoff_max_ms",
            self.job_backoff_max_ms,
        )?;
        let write_backoff = backoff(
            "write_backoff_base_ms",
            self.write_backoff_base_ms,
            "write_backoff_max_ms",
            self.write_backoff_max_ms,
        )?
        .with_jitter(0.2);

        Ok(ControllerSettings {
            workers: self.workers,
            reconciler: ReconcilerSettings {
                max_job_retries: self.job_max_retries,
                job_backoff,
                drain_interval: Duration::from_millis(positive(
                    "drain_interval_ms",
                    self.drain_interval_ms,
                )?),
                poll_interval: Duration::from_millis(positive(
                    "poll_interval_ms",
                    self.poll_interval_ms,
                )?),
                ..ReconcilerSettings::default()
            },
            write_policy: WritePolicy {
                max_attempts: self.write_max_attempts,
                backoff: write_backoff,
            },
            gc_interval: Duration::from_secs(positive("gc_interval_secs", self.gc_interval_secs)?),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        })
    }
}

/// Load a seed manifest: a JSON array of resources.
pub fn read_seed(path: &Path) -> Result<Vec<Resource>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::SeedIo {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::SeedParse {
        path: path.to_path_buf(),
        source,
    })
}
