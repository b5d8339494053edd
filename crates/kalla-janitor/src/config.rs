//! Janitor configuration from environment variables.

use anyhow::{bail, Context, Result};
use kalla_reaper::aggregator::{DEFAULT_CONCURRENCY, DEFAULT_PAGE_SIZE};
use kalla_reaper::reaper::DEFAULT_FETCH_LIMIT;
use kalla_reaper::report::{DEFAULT_MAX_JOBS_TO_REPORT, DEFAULT_STUCK_THRESHOLD_MS};
use kalla_reaper::window::{DEFAULT_FETCH_LOOKBACK_MS, DEFAULT_RETENTION_MS};
use kalla_reaper::RetentionWindow;
use std::str::FromStr;

/// How aggregator jobs reach a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JanitorMode {
    /// Single mode: aggregator jobs run in-process from a local channel.
    Single,
    /// Scaled mode: aggregator jobs go through NATS JetStream to any replica.
    Scaled,
}

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub worker_id: String,
    pub database_url: String,
    /// None = single mode. Some = scaled mode (NATS).
    pub nats_url: Option<String>,
    pub http_port: u16,
    pub metrics_port: u16,
    // Cron surface
    pub cron_header: String,
    pub superadmin_token: Option<String>,
    // Alerts
    pub alert_webhook_url: Option<url::Url>,
    pub admin_email: String,
    // Reaping
    pub retention_ms: i64,
    pub fetch_window_ms: i64,
    pub fetch_limit: usize,
    pub stuck_threshold_ms: i64,
    pub max_jobs_to_report: usize,
    // Aggregator
    pub aggregator_concurrency: usize,
    pub aggregator_page_size: usize,
    pub heartbeat_interval_secs: u64,
    /// Claimed jobs whose heartbeat is older than this no longer count as running.
    pub job_lease_secs: u64,
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("Invalid {}", key)),
        Err(_) => Ok(default),
    }
}

impl JanitorConfig {
    pub fn from_env() -> Result<Self> {
        let retention_ms = env_or("RETENTION_MS", DEFAULT_RETENTION_MS)?;
        let fetch_window_ms = env_or(
            "FETCH_WINDOW_MS",
            retention_ms.saturating_add(DEFAULT_FETCH_LOOKBACK_MS),
        )?;

        let alert_webhook_url = std::env::var("ALERT_WEBHOOK_URL")
            .ok()
            .map(|raw| url::Url::parse(&raw).context("Invalid ALERT_WEBHOOK_URL"))
            .transpose()?;

        let config = Self {
            worker_id: std::env::var("WORKER_ID")
                .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string()),
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            nats_url: std::env::var("NATS_URL").ok(),
            http_port: env_or("HTTP_PORT", 8080)?,
            metrics_port: env_or("METRICS_PORT", 9090)?,
            cron_header: std::env::var("CRON_HEADER")
                .unwrap_or_else(|_| "x-kalla-cron".to_string())
                .to_ascii_lowercase(),
            superadmin_token: std::env::var("SUPERADMIN_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            alert_webhook_url,
            admin_email: std::env::var("ADMIN_EMAIL")
                .unwrap_or_else(|_| "admin@localhost".to_string()),
            retention_ms,
            fetch_window_ms,
            fetch_limit: env_or("FETCH_LIMIT", DEFAULT_FETCH_LIMIT)?,
            stuck_threshold_ms: env_or("STUCK_THRESHOLD_MS", DEFAULT_STUCK_THRESHOLD_MS)?,
            max_jobs_to_report: env_or("MAX_JOBS_TO_REPORT", DEFAULT_MAX_JOBS_TO_REPORT)?,
            aggregator_concurrency: env_or("AGGREGATOR_CONCURRENCY", DEFAULT_CONCURRENCY)?,
            aggregator_page_size: env_or("AGGREGATOR_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            heartbeat_interval_secs: env_or("HEARTBEAT_INTERVAL_SECS", 30)?,
            job_lease_secs: env_or("JOB_LEASE_SECS", 300)?,
        };

        config.retention_window()?;
        Ok(config)
    }

    /// Determine janitor mode from configuration.
    pub fn mode(&self) -> JanitorMode {
        if self.nats_url.is_some() {
            JanitorMode::Scaled
        } else {
            JanitorMode::Single
        }
    }

    pub fn retention_window(&self) -> Result<RetentionWindow> {
        match RetentionWindow::new(self.retention_ms, self.fetch_window_ms) {
            Some(window) => Ok(window),
            None => bail!(
                "FETCH_WINDOW_MS ({}) must not be shorter than RETENTION_MS ({})",
                self.fetch_window_ms,
                self.retention_ms
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid races.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "WORKER_ID",
            "DATABASE_URL",
            "NATS_URL",
            "HTTP_PORT",
            "METRICS_PORT",
            "CRON_HEADER",
            "SUPERADMIN_TOKEN",
            "ALERT_WEBHOOK_URL",
            "ADMIN_EMAIL",
            "RETENTION_MS",
            "FETCH_WINDOW_MS",
            "FETCH_LIMIT",
            "STUCK_THRESHOLD_MS",
            "MAX_JOBS_TO_REPORT",
            "AGGREGATOR_CONCURRENCY",
            "AGGREGATOR_PAGE_SIZE",
            "HEARTBEAT_INTERVAL_SECS",
            "JOB_LEASE_SECS",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn from_env_single_mode_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe { std::env::set_var("DATABASE_URL", "postgres://localhost/test") };

        let config = JanitorConfig::from_env().unwrap();
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.mode(), JanitorMode::Single);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.cron_header, "x-kalla-cron");
        assert_eq!(config.superadmin_token, None);
        assert_eq!(config.alert_webhook_url, None);
        assert_eq!(config.retention_ms, DEFAULT_RETENTION_MS);
        assert_eq!(
            config.fetch_window_ms,
            DEFAULT_RETENTION_MS + DEFAULT_FETCH_LOOKBACK_MS
        );
        assert_eq!(config.fetch_limit, 1000);
        assert_eq!(config.max_jobs_to_report, 50);
        assert_eq!(config.job_lease_secs, 300);

        clear_env();
    }

    #[test]
    fn from_env_with_all_vars() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        unsafe {
            std::env::set_var("WORKER_ID", "janitor-1");
            std::env::set_var("DATABASE_URL", "postgres://localhost/test");
            std::env::set_var("NATS_URL", "nats://localhost:4222");
            std::env::set_var("HTTP_PORT", "8081");
            std::env::set_var("CRON_HEADER", "X-Appengine-Cron");
            std::env::set_var("SUPERADMIN_TOKEN", "s3cret");
            std::env::set_var("ALERT_WEBHOOK_URL", "https://alerts.example.com/hook");
            std::env::set_var("ADMIN_EMAIL", "ops@example.com");
            std::env::set_var("RETENTION_MS", "1000");
            std::env::set_var("FETCH_WINDOW_MS", "5000");
            std::env::set_var("AGGREGATOR_CONCURRENCY", "16");
        }

        let config = JanitorConfig::from_env().unwrap();
        assert_eq!(config.worker_id, "janitor-1");
        assert_eq!(config.mode(), JanitorMode::Scaled);
        assert_eq!(config.http_port, 8081);
        assert_eq!(config.cron_header, "x-appengine-cron");
        assert_eq!(config.superadmin_token.as_deref(), Some("s3cret"));
        assert_eq!(
            config.alert_webhook_url.as_ref().map(|u| u.as_str()),
            Some("https://alerts.example.com/hook")
        );
        assert_eq!(config.admin_email, "ops@example.com");
        let window = config.retention_window().unwrap();
        assert_eq!(window.min_age_ms(), 1000);
        assert_eq!(window.max_age_ms(), 5000);
        assert_eq!(config.aggregator_concurrency, 16);

        clear_env();
    }

    #[test]
    fn from_env_requires_database_url() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        assert!(JanitorConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    fn from_env_rejects_fetch_window_below_retention() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        unsafe {
            std::env::set_var("DATABASE_URL", "postgres://localhost/test");
            std::env::set_var("RETENTION_MS", "5000");
            std::env::set_var("FETCH_WINDOW_MS", "1000");
        }
        assert!(JanitorConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    fn from_env_invalid_values() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        unsafe {
            std::env::set_var("DATABASE_URL", "postgres://localhost/test");
            std::env::set_var("METRICS_PORT", "not-a-number");
        }
        assert!(JanitorConfig::from_env().is_err());

        unsafe {
            std::env::remove_var("METRICS_PORT");
            std::env::set_var("ALERT_WEBHOOK_URL", "not a url");
        }
        assert!(JanitorConfig::from_env().is_err());

        clear_env();
    }
}
