use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;
use crate::extract::ExtractOptions;
use crate::jobs::DEFAULT_MAX_ATTEMPTS;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub cors_allowed_origin: Option<String>,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub converter_program: String,
    pub converter_timeout_secs: u64,
    pub conversion_scratch_dir: Option<PathBuf>,
    pub worker_name: String,
    pub worker_concurrency: usize,
    pub worker_poll_interval_ms: u64,
    pub job_max_attempts: i32,
    pub job_lease_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("SERVER_PORT must be a valid u16")?;
        let cors_allowed_origin = env::var("CORS_ALLOWED_ORIGIN").ok();
        let upload_dir = env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/uploads"));
        let max_upload_bytes = env::var("MAX_UPLOAD_BYTES")
            .unwrap_or_else(|_| DEFAULT_MAX_UPLOAD_BYTES.to_string())
            .parse()
            .context("MAX_UPLOAD_BYTES must be an integer")?;
        let converter_program =
            env::var("CONVERTER_PROGRAM").unwrap_or_else(|_| "soffice".to_string());
        let converter_timeout_secs = env::var("CONVERTER_TIMEOUT_SECS")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .context("CONVERTER_TIMEOUT_SECS must be an integer")?;
        let conversion_scratch_dir = env::var("CONVERSION_SCRATCH_DIR").ok().map(PathBuf::from);
        let worker_name = env::var("WORKER_NAME").unwrap_or_else(|_| "pipeline".to_string());
        let worker_concurrency = env::var("WORKER_CONCURRENCY")
            .unwrap_or_else(|_| "2".to_string())
            .parse::<usize>()
            .context("WORKER_CONCURRENCY must be an integer")?
            .max(1);
        let worker_poll_interval_ms = env::var("WORKER_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "2000".to_string())
            .parse()
            .context("WORKER_POLL_INTERVAL_MS must be an integer")?;
        let job_max_attempts = env::var("JOB_MAX_ATTEMPTS")
            .unwrap_or_else(|_| DEFAULT_MAX_ATTEMPTS.to_string())
            .parse::<i32>()
            .context("JOB_MAX_ATTEMPTS must be an integer")?
            .max(1);
        let job_lease_secs = env::var("JOB_LEASE_SECS")
            .unwrap_or_else(|_| "900".to_string())
            .parse()
            .context("JOB_LEASE_SECS must be an integer")?;

        Ok(Self {
            database_url,
            database_max_pool_size,
            server_host,
            server_port,
            cors_allowed_origin,
            upload_dir,
            max_upload_bytes,
            converter_program,
            converter_timeout_secs,
            conversion_scratch_dir,
            worker_name,
            worker_concurrency,
            worker_poll_interval_ms,
            job_max_attempts,
            job_lease_secs,
        })
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }

    pub fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            converter_program: self.converter_program.clone(),
            converter_timeout: Duration::from_secs(self.converter_timeout_secs),
            scratch_dir: self.conversion_scratch_dir.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn job_lease(&self) -> Duration {
        Duration::from_secs(self.job_lease_secs)
    }

    /// `processed_by` tag for one consumer loop of this worker process.
    pub fn processed_by(&self, loop_index: usize) -> String {
        let tag = format!(
            "{}@{}/{}",
            self.worker_name,
            env!("CARGO_PKG_VERSION"),
            loop_index
        );
        tag.chars().take(64).collect()
    }
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("*****"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
