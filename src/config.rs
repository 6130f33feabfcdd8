use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{AutomationError, Result};

pub const DEFAULT_WEB_TIMEOUT_SECS: u64 = 30;
pub const POLL_INTERVAL_SECS: u64 = 2;

/// Command line options. Flags override environment variables.
#[derive(Debug, Parser)]
#[command(name = "webpilot", about = "Headless browser automation task queue")]
pub struct Cli {
    /// SQLite database file (overrides DB_PATH)
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Dashboard port; the first free port in port..port+10 is used
    #[arg(long, default_value_t = 3000)]
    pub port: u16,

    /// Run Chrome with a visible window (overrides HEADLESS_MODE)
    #[arg(long)]
    pub no_headless: bool,

    /// Drain runnable tasks once and exit instead of serving
    #[arg(long)]
    pub once: bool,
}

/// Runtime configuration resolved from CLI flags and environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    /// Bound on each web operation inside a run.
    pub web_timeout: Duration,
    pub headless: bool,
    pub port: u16,
    pub poll_interval: Duration,
    /// Failure screenshots land here, next to the database.
    pub screenshot_dir: PathBuf,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self> {
        let db_path = cli
            .db_path
            .clone()
            .or_else(|| std::env::var_os("DB_PATH").map(PathBuf::from))
            .unwrap_or_else(default_db_path);

        let web_timeout = match std::env::var("WEB_TIMEOUT") {
            Ok(raw) => Duration::from_secs(parse_timeout_secs(&raw)?),
            Err(_) => Duration::from_secs(DEFAULT_WEB_TIMEOUT_SECS),
        };

        let headless = if cli.no_headless {
            false
        } else {
            match std::env::var("HEADLESS_MODE") {
                Ok(raw) => parse_bool("HEADLESS_MODE", &raw)?,
                Err(_) => true,
            }
        };

        let screenshot_dir = db_path
            .parent()
            .map(|p| p.join("screenshots"))
            .unwrap_or_else(|| PathBuf::from("screenshots"));

        Ok(Self {
            db_path,
            web_timeout,
            headless,
            port: cli.port,
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            screenshot_dir,
        })
    }
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".webpilot")
        .join("tasks.db")
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AutomationError::Config(format!(
            "{name} must be a boolean, got `{raw}`"
        ))),
    }
}

fn parse_timeout_secs(raw: &str) -> Result<u64> {
    let secs: u64 = raw.trim().parse().map_err(|_| {
        AutomationError::Config(format!("WEB_TIMEOUT must be whole seconds, got `{raw}`"))
    })?;
    if secs == 0 {
        return Err(AutomationError::Config(
            "WEB_TIMEOUT must be at least 1 second".to_string(),
        ));
    }
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool("HEADLESS_MODE", "true").unwrap());
        assert!(parse_bool("HEADLESS_MODE", "1").unwrap());
        assert!(parse_bool("HEADLESS_MODE", " YES ").unwrap());
        assert!(!parse_bool("HEADLESS_MODE", "off").unwrap());
        assert!(parse_bool("HEADLESS_MODE", "maybe").is_err());
    }

    #[test]
    fn timeout_rejects_zero_and_garbage() {
        assert_eq!(parse_timeout_secs("45").unwrap(), 45);
        assert!(parse_timeout_secs("0").is_err());
        assert!(parse_timeout_secs("soon").is_err());
    }
}
