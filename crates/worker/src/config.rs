use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use formflow_core::dead_letter::DeadLetterPolicy;
use formflow_core::resilience::BreakerSettings;
use formflow_events::WebhookSettings;
use formflow_pipeline::SchedulerSettings;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var}='{value}' is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Log output format (`LOG_FORMAT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err("must be 'pretty' or 'json'".into()),
        }
    }
}

/// Worker configuration loaded from environment variables.
///
/// | Env Var                        | Default  |
/// |--------------------------------|----------|
/// | `DATABASE_URL`                 | required |
/// | `FORMFLOW_SECRET_KEY`          | required |
/// | `DB_MAX_CONNECTIONS`           | `10`     |
/// | `BREAKER_FAILURE_THRESHOLD`    | `5`      |
/// | `BREAKER_WINDOW_SECS`          | `60`     |
/// | `BREAKER_COOLDOWN_SECS`        | `30`     |
/// | `DLQ_MAX_ATTEMPTS`             | `5`      |
/// | `DLQ_BASE_DELAY_MS`            | `1000`   |
/// | `DLQ_BACKOFF_MULTIPLIER`       | `4`      |
/// | `DLQ_MAX_DELAY_SECS`           | `3600`   |
/// | `DLQ_SCAN_INTERVAL_SECS`       | `10`     |
/// | `DLQ_BATCH_SIZE`               | `50`     |
/// | `DLQ_STALE_CLAIM_SECS`         | `300`    |
/// | `DLQ_RESOLVED_RETENTION_HOURS` | `168`    |
/// | `WEBHOOK_TIMEOUT_SECS`         | `10`     |
/// | `WEBHOOK_MAX_RETRIES`          | `3`      |
/// | `LOG_FORMAT`                   | `pretty` |
#[derive(Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub secret_key: String,
    pub db_max_connections: u32,
    pub breaker: BreakerSettings,
    pub dead_letter: DeadLetterPolicy,
    pub scheduler: SchedulerSettings,
    pub webhook: WebhookSettings,
    pub log_format: LogFormat,
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("database_url", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("db_max_connections", &self.db_max_connections)
            .field("breaker", &self.breaker)
            .field("dead_letter", &self.dead_letter)
            .field("scheduler", &self.scheduler)
            .field("webhook", &self.webhook)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the config from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let breaker = BreakerSettings {
            failure_threshold: env.positive("BREAKER_FAILURE_THRESHOLD", 5)?,
            window: Duration::from_secs(env.parse("BREAKER_WINDOW_SECS", 60)?),
            cooldown: Duration::from_secs(env.parse("BREAKER_COOLDOWN_SECS", 30)?),
        };

        let dead_letter = DeadLetterPolicy {
            max_attempts: env.parse("DLQ_MAX_ATTEMPTS", 5)?,
            base_delay: Duration::from_millis(env.positive("DLQ_BASE_DELAY_MS", 1000)?),
            multiplier: env.positive("DLQ_BACKOFF_MULTIPLIER", 4)?,
            max_delay: Duration::from_secs(env.parse("DLQ_MAX_DELAY_SECS", 3600)?),
        };

        let scheduler = SchedulerSettings {
            scan_interval: Duration::from_secs(env.positive("DLQ_SCAN_INTERVAL_SECS", 10)?),
            batch_size: env.positive("DLQ_BATCH_SIZE", 50)?,
            stale_claim_after: Duration::from_secs(env.parse("DLQ_STALE_CLAIM_SECS", 300)?),
            resolved_retention: env.hours("DLQ_RESOLVED_RETENTION_HOURS", 168)?,
            ..Default::default()
        };

        let webhook = WebhookSettings {
            timeout: Duration::from_secs(env.positive("WEBHOOK_TIMEOUT_SECS", 10)?),
            default_max_retries: env.positive("WEBHOOK_MAX_RETRIES", 3)?,
            ..Default::default()
        };

        Ok(Self {
            database_url: env.required("DATABASE_URL")?,
            secret_key: env.required("FORMFLOW_SECRET_KEY")?,
            db_max_connections: env.positive("DB_MAX_CONNECTIONS", 10)?,
            breaker,
            dead_letter,
            scheduler,
            webhook,
            log_format: env.parse("LOG_FORMAT", LogFormat::Pretty)?,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.get(var).ok_or(ConfigError::Missing(var))
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn positive<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default + fmt::Display,
        T::Err: fmt::Display,
    {
        let value = self.parse(var, default)?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                var,
                value: value.to_string(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(value)
    }

    fn hours(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        let hours: u64 = self.parse(var, default)?;
        hours
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::Invalid {
                var,
                value: hours.to_string(),
                reason: "is too large".into(),
            })
    }
}
