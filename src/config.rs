//! Daemon configuration.
//!
//! Loaded from environment variables (and an optional `.env` file) at
//! startup. Exam-type policy lives in the workspace settings, not here.

use crate::error::ConfigError;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_REPORT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LOG_FILTER: &str = "marksheetd=info";

#[derive(Debug, Clone)]
pub struct Config {
    /// Workspace opened before the first request, if any.
    pub workspace: Option<PathBuf>,
    /// Upper bound for one report export.
    pub report_timeout: Duration,
    /// Forces the document rows-per-page capacity instead of deriving it
    /// from the page layout.
    pub page_rows: Option<usize>,
    /// Write existing records through the version-checked update.
    pub optimistic_writes: bool,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: None,
            report_timeout: Duration::from_secs(DEFAULT_REPORT_TIMEOUT_SECS),
            page_rows: None,
            optimistic_writes: false,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        let mut cfg = Config::default();

        if let Ok(v) = env::var("MARKSHEETD_WORKSPACE") {
            if !v.trim().is_empty() {
                cfg.workspace = Some(PathBuf::from(v));
            }
        }
        if let Ok(v) = env::var("MARKSHEETD_REPORT_TIMEOUT_SECS") {
            let secs = parse_positive("MARKSHEETD_REPORT_TIMEOUT_SECS", &v)?;
            cfg.report_timeout = Duration::from_secs(secs as u64);
        }
        if let Ok(v) = env::var("MARKSHEETD_PAGE_ROWS") {
            cfg.page_rows = Some(parse_positive("MARKSHEETD_PAGE_ROWS", &v)?);
        }
        if let Ok(v) = env::var("MARKSHEETD_OPTIMISTIC_WRITES") {
            cfg.optimistic_writes = parse_bool("MARKSHEETD_OPTIMISTIC_WRITES", &v)?;
        }
        if let Ok(v) = env::var("MARKSHEETD_LOG") {
            if !v.trim().is_empty() {
                cfg.log_filter = v;
            }
        }

        Ok(cfg)
    }
}

fn parse_positive(name: &'static str, raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid {
            name,
            value: raw.to_string(),
        }),
    }
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_values_accept_common_spellings() {
        assert!(parse_bool("X", "TRUE").unwrap());
        assert!(parse_bool("X", "on").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn positive_values_reject_zero() {
        assert_eq!(parse_positive("X", " 40 ").unwrap(), 40);
        assert!(parse_positive("X", "0").is_err());
        assert!(parse_positive("X", "-3").is_err());
    }
}
