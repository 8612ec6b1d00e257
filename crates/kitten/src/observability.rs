use std::borrow::Cow;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::Level;

const LOG_LEVEL_ENV_NAME: &str = "KITTEN_LOG";

/// If in debug mode, default level is debug to get maximum logging
#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: &str = "debug";

/// If not in debug mode, default level is warn to get important logs
#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: &str = "warn";

const LOG_FORMAT_TEXT: &str = "text";
const LOG_FORMAT_JSON: &str = "json";

#[derive(Debug, Default)]
pub struct ObservabilityConfig {
    pub debug: bool,
    pub log_file: Option<PathBuf>,
    pub log_format: Option<String>,
}

fn detect_log_level(is_debug: bool) -> Result<Level> {
    let level: Cow<str> = if is_debug {
        "debug".into()
    } else if let Ok(level) = std::env::var(LOG_LEVEL_ENV_NAME) {
        level.into()
    } else {
        DEFAULT_LOG_LEVEL.into()
    };
    Level::from_str(level.as_ref()).context("failed to parse log level")
}

pub fn init(config: ObservabilityConfig) -> Result<()> {
    let level = detect_log_level(config.debug)?;
    let json = match config.log_format.as_deref() {
        None | Some(LOG_FORMAT_TEXT) => false,
        Some(LOG_FORMAT_JSON) => true,
        Some(unknown) => bail!("unknown log format: {unknown}"),
    };

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);

    match (config.log_file, json) {
        (Some(path), json) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context("failed opening log file")?;
            let builder = builder.with_writer(Arc::new(file)).with_ansi(false);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
        }
        (None, true) => builder.with_writer(std::io::stderr).json().init(),
        (None, false) => builder.with_writer(std::io::stderr).init(),
    }

    Ok(())
}

/// Minimal stderr logging for the re-executed child, so warnings from
/// the in-namespace setup are visible on the inherited stderr.
pub fn init_child() {
    let level = detect_log_level(false).unwrap_or(Level::WARN);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_detect_log_level_is_debug() {
        assert_eq!(detect_log_level(true).unwrap(), Level::DEBUG);
    }

    #[test]
    #[serial]
    fn test_detect_log_level_from_env() {
        std::env::set_var(LOG_LEVEL_ENV_NAME, "error");
        assert_eq!(detect_log_level(false).unwrap(), Level::ERROR);
        std::env::remove_var(LOG_LEVEL_ENV_NAME);
    }

    #[test]
    #[serial]
    fn test_detect_log_level_default() {
        std::env::remove_var(LOG_LEVEL_ENV_NAME);
        if cfg!(debug_assertions) {
            assert_eq!(detect_log_level(false).unwrap(), Level::DEBUG);
        } else {
            assert_eq!(detect_log_level(false).unwrap(), Level::WARN);
        }
    }
}
