use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Connection settings for the S3-compatible blob store.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

/// One external inference service (dish detection or nutrition estimation).
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Tuning for the analysis pipeline and its worker pool.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    pub fetch_timeout: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    pub dish_concurrency: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(15),
            workers: 4,
            queue_capacity: 256,
            dish_concurrency: 4,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub storage: StorageConfig,
    pub detector: InferenceConfig,
    pub estimator: InferenceConfig,
    pub analysis: AnalysisConfig,
    pub upload_max_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;

        let storage = StorageConfig {
            endpoint: env_or("MINIO_ENDPOINT", "http://localhost:9000"),
            bucket: env_or("MINIO_BUCKET", "mealscan"),
            access_key: env_or("MINIO_ACCESS_KEY", "minioadmin"),
            secret_key: env_or("MINIO_SECRET_KEY", "minioadmin"),
            region: env_or("MINIO_REGION", "us-east-1"),
        };

        let detector = InferenceConfig {
            url: std::env::var("DETECTOR_URL").context("DETECTOR_URL is not set")?,
            api_key: std::env::var("DETECTOR_API_KEY").ok().filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(env_parse("DETECTOR_TIMEOUT_SECS", 30)),
        };
        let estimator = InferenceConfig {
            url: std::env::var("ESTIMATOR_URL").context("ESTIMATOR_URL is not set")?,
            api_key: std::env::var("ESTIMATOR_API_KEY").ok().filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(env_parse("ESTIMATOR_TIMEOUT_SECS", 30)),
        };

        let defaults = AnalysisConfig::default();
        let analysis = AnalysisConfig {
            fetch_timeout: Duration::from_secs(env_parse(
                "ANALYSIS_FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout.as_secs(),
            )),
            workers: env_parse("ANALYSIS_WORKERS", defaults.workers),
            queue_capacity: env_parse("ANALYSIS_QUEUE_CAPACITY", defaults.queue_capacity),
            dish_concurrency: env_parse("ANALYSIS_DISH_CONCURRENCY", defaults.dish_concurrency),
            max_retries: env_parse("ANALYSIS_MAX_RETRIES", defaults.max_retries),
            retry_backoff: Duration::from_millis(env_parse(
                "ANALYSIS_RETRY_BACKOFF_MS",
                defaults.retry_backoff.as_millis() as u64,
            )),
        };

        let config = Self {
            database_url,
            storage,
            detector,
            estimator,
            analysis,
            upload_max_bytes: env_parse("UPLOAD_MAX_BYTES", 20 * 1024 * 1024),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let a = &self.analysis;
        anyhow::ensure!(a.workers > 0, "ANALYSIS_WORKERS must be > 0");
        anyhow::ensure!(a.queue_capacity > 0, "ANALYSIS_QUEUE_CAPACITY must be > 0");
        anyhow::ensure!(a.dish_concurrency > 0, "ANALYSIS_DISH_CONCURRENCY must be > 0");
        anyhow::ensure!(
            !self.detector.timeout.is_zero() && !self.estimator.timeout.is_zero(),
            "inference timeouts must be > 0"
        );
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
