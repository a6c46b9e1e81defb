//! Environment-driven run configuration.

use std::path::PathBuf;

use dotleads_adapters::{SocrataClient, DEFAULT_PAGE_SIZE};
use dotleads_storage::DEFAULT_CSV_PREFIX;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting is absent or blank.
    #[error("Configuration value '{field}' is required but not set")]
    Missing { field: String },

    /// A setting is present but unusable.
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run once and exit.
    Once,
    /// Stay resident and run on the cron schedule.
    Schedule,
}

#[derive(Debug, Clone)]
pub struct SocrataSettings {
    pub base_url: String,
    pub dataset_id: String,
    pub app_token: Option<String>,
    pub page_size: usize,
}

#[derive(Debug, Clone)]
pub struct SheetsSettings {
    pub credentials_path: PathBuf,
    pub spreadsheet_id: String,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub run_on_startup: bool,
    pub cron: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub socrata: SocrataSettings,
    pub sheets: SheetsSettings,
    pub smtp: SmtpSettings,
    pub schedule: ScheduleSettings,
    pub run_mode: RunMode,
    pub output_dir: PathBuf,
    pub csv_prefix: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` uses the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let domain = get_or("SOCRATA_DOMAIN", "data.transportation.gov");
        let username = get_or("SMTP_USERNAME", "");

        Ok(Self {
            socrata: SocrataSettings {
                base_url: get("SOCRATA_BASE_URL")
                    .unwrap_or_else(|| SocrataClient::base_url_for_domain(&domain)),
                dataset_id: get_or("SOCRATA_DATASET_ID", "49yn-d2k2"),
                app_token: get("SOCRATA_APP_TOKEN"),
                page_size: parse_or(&get, "FETCH_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            },
            sheets: SheetsSettings {
                credentials_path: PathBuf::from(get_or(
                    "GOOGLE_SHEETS_CREDENTIALS_PATH",
                    "service_account.json",
                )),
                spreadsheet_id: get_or("GOOGLE_SHEET_ID", ""),
            },
            smtp: SmtpSettings {
                server: get_or("SMTP_SERVER", "smtp.gmail.com"),
                port: parse_or(&get, "SMTP_PORT", 587)?,
                password: get_or("SMTP_PASSWORD", ""),
                from: get("EMAIL_FROM").unwrap_or_else(|| username.clone()),
                username,
                recipients: get("EMAIL_TO")
                    .map(|v| split_recipients(&v))
                    .unwrap_or_default(),
            },
            schedule: ScheduleSettings {
                run_on_startup: match get("RUN_ON_STARTUP") {
                    Some(v) => parse_bool("RUN_ON_STARTUP", &v)?,
                    None => true,
                },
                cron: get_or("SCHEDULE_CRON", "0 0 2 * * *"),
            },
            run_mode: match get("RUN_MODE").as_deref() {
                None | Some("once") => RunMode::Once,
                Some("schedule") => RunMode::Schedule,
                Some(other) => {
                    return Err(ConfigError::InvalidValue {
                        field: "RUN_MODE".into(),
                        reason: format!("expected 'once' or 'schedule', got '{other}'"),
                    })
                }
            },
            output_dir: PathBuf::from(get_or("OUTPUT_DIR", "output/csv")),
            csv_prefix: DEFAULT_CSV_PREFIX.to_string(),
            http_timeout_secs: parse_or(&get, "HTTP_TIMEOUT_SECS", 60)?,
        })
    }

    /// Checks that must pass before the run touches any external system.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sheets.spreadsheet_id.is_empty() {
            return Err(ConfigError::Missing {
                field: "GOOGLE_SHEET_ID".into(),
            });
        }
        if !self.sheets.credentials_path.is_file() {
            return Err(ConfigError::InvalidValue {
                field: "GOOGLE_SHEETS_CREDENTIALS_PATH".into(),
                reason: format!(
                    "service account credentials not found at {}",
                    self.sheets.credentials_path.display()
                ),
            });
        }
        if self.socrata.dataset_id.is_empty() {
            return Err(ConfigError::Missing {
                field: "SOCRATA_DATASET_ID".into(),
            });
        }
        if self.socrata.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "FETCH_PAGE_SIZE".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if !self.smtp.recipients.is_empty() && self.smtp.from.is_empty() {
            return Err(ConfigError::Missing {
                field: "EMAIL_FROM".into(),
            });
        }
        Ok(())
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::InvalidValue {
            field: key.to_string(),
            reason: err.to_string(),
        }),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: key.to_string(),
            reason: format!("expected a boolean, got '{raw}'"),
        }),
    }
}

fn split_recipients(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
