//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmConfig, RetryPolicy};
use crate::mail::MailConfig;
use crate::pipeline::delivery::DeliveryConfig;

/// Everything the service needs at startup, built from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    pub llm: LlmConfig,
    pub mail: MailConfig,
    pub delivery: DeliveryConfig,
    /// Receives the daily failure report.
    pub report_email: String,
    /// JSON file of reply template sources.
    pub template_dataset_path: PathBuf,
    /// Directory for rolling log files. Logs go to stderr when unset.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let api_key = get("LLM_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("LLM_API_KEY".to_string()))?;

        let max_attempts: u32 = parse_or(&get, "LLM_MAX_RETRIES", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LLM_MAX_RETRIES".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let llm = LlmConfig {
            api_key: SecretString::from(api_key),
            base_url: or("LLM_BASE_URL", "https://api.groq.com/openai/v1"),
            model: or("LLM_MODEL", "openai/gpt-oss-20b"),
            timeout: Duration::from_secs(parse_or(&get, "LLM_TIMEOUT_SECS", 30)?),
            retry: RetryPolicy {
                max_attempts,
                backoff: Duration::from_secs(parse_or(&get, "LLM_BACKOFF_SECS", 5)?),
            },
        };

        let mail = MailConfig {
            api_url: or("GRAPH_API_URL", "https://graph.microsoft.com/v1.0"),
            timeout: Duration::from_secs(parse_or(&get, "MAIL_TIMEOUT_SECS", 30)?),
        };

        let delivery = DeliveryConfig {
            default_folder: or("DEFAULT_FOLDER", "Processed"),
            sent_lookback: parse_or(&get, "SENT_LOOKBACK", 10)?,
            admin_email: or("ADMIN_EMAIL", "admin@company.com"),
        };

        Ok(Self {
            db_path: PathBuf::from(or("TRIAGE_DB_PATH", "./data/mail-triage.db")),
            port: parse_or(&get, "TRIAGE_PORT", 5000)?,
            llm,
            mail,
            delivery,
            report_email: or("REPORT_EMAIL", "support@example.com"),
            template_dataset_path: PathBuf::from(or(
                "TEMPLATE_DATASET_PATH",
                "datasets_combined.json",
            )),
            log_dir: get("TRIAGE_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}
