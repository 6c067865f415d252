use serde::Deserialize;
use std::time::Duration;

use crate::services::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the duplicate-check queue
    pub redis_url: String,

    /// Queue topic shared by the upload path and the worker
    #[serde(default = "default_queue_topic")]
    pub queue_topic: String,

    /// Bucket name (S3-compatible)
    pub s3_bucket: String,

    /// S3 endpoint URL
    pub s3_endpoint: String,

    /// S3 access key ID
    pub s3_access_key: String,

    /// S3 secret access key
    pub s3_secret_key: String,

    /// Public base URL the bucket is served from
    pub s3_public_url: String,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Proportional jitter applied to retry delays (0.2 = +/-20%)
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    /// Upper bound for a single duplicate check before it counts as failed
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// How long a claimed job may stay unacknowledged before it is redelivered
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Maximum Hamming distance between perceptual hashes still considered a duplicate
    #[serde(default = "default_duplicate_max_distance")]
    pub duplicate_max_distance: u32,

    #[serde(default = "default_max_upload_files")]
    pub max_upload_files: usize,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Address the worker process serves its Prometheus metrics on
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error(
        "JOB_TIMEOUT_SECS ({job_timeout_secs}) must be shorter than \
         VISIBILITY_TIMEOUT_SECS ({visibility_timeout_secs})"
    )]
    TimeoutExceedsLease {
        job_timeout_secs: u64,
        visibility_timeout_secs: u64,
    },
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_queue_topic() -> String {
    crate::services::queue::DUPLICATE_CHECK_TOPIC.to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_job_timeout_secs() -> u64 {
    30
}

fn default_visibility_timeout_secs() -> u64 {
    120
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_duplicate_max_distance() -> u32 {
    4
}

fn default_max_upload_files() -> usize {
    100
}

fn default_max_upload_bytes() -> usize {
    200 * 1024 * 1024
}

fn default_thumbnail_width() -> u32 {
    300
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9091".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// A check must give up before its lease runs out, otherwise the job is
    /// redelivered while the first attempt is still running.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_timeout_secs >= self.visibility_timeout_secs {
            return Err(ConfigError::TimeoutExceedsLease {
                job_timeout_secs: self.job_timeout_secs,
                visibility_timeout_secs: self.visibility_timeout_secs,
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            jitter: self.backoff_jitter.clamp(0.0, 1.0),
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(extra: &[(&str, &str)]) -> AppConfig {
        let vars: Vec<(String, String)> = [
            ("DATABASE_URL", "postgres://localhost/photos"),
            ("REDIS_URL", "redis://localhost"),
            ("S3_BUCKET", "photos"),
            ("S3_ENDPOINT", "http://localhost:9000"),
            ("S3_ACCESS_KEY", "key"),
            ("S3_SECRET_KEY", "secret"),
            ("S3_PUBLIC_URL", "http://localhost:9000/photos"),
        ]
        .iter()
        .chain(extra)
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        envy::from_iter(vars).expect("config parses")
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = config_from(&[]);
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_metrics_addr, "0.0.0.0:9091");
        assert!(config.job_timeout() < config.visibility_timeout());
    }

    #[test]
    fn test_job_timeout_must_be_shorter_than_lease() {
        for timeout in ["120", "300"] {
            let config = config_from(&[
                ("JOB_TIMEOUT_SECS", timeout),
                ("VISIBILITY_TIMEOUT_SECS", "120"),
            ]);
            assert!(matches!(
                config.validate(),
                Err(ConfigError::TimeoutExceedsLease { .. })
            ));
        }

        let config = config_from(&[
            ("JOB_TIMEOUT_SECS", "119"),
            ("VISIBILITY_TIMEOUT_SECS", "120"),
        ]);
        assert!(config.validate().is_ok());
    }
}
