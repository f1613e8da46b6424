//! Process-wide tracing subscriber setup.

use pd_core::BrowserError;
use pd_core::BrowserResult;
use tracing_subscriber::filter::LevelFilter;

pub const ENV_LOG_LEVEL: &str = "PIXELDUST_LOG";
pub const ENV_LOG_FORMAT: &str = "PIXELDUST_LOG_FORMAT";

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Pretty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl LogSettings {
    pub fn from_env() -> BrowserResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BrowserResult<Self> {
        Ok(Self {
            level: resolve_log_level(lookup(ENV_LOG_LEVEL).as_deref())?,
            format: resolve_log_format(lookup(ENV_LOG_FORMAT).as_deref())?,
        })
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(settings: LogSettings) -> BrowserResult<()> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(settings.level)
        .with_target(true)
        .with_writer(std::io::stderr);

    match settings.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|error| {
        BrowserError::new(
            "config.logging_init_failed",
            format!("failed to install logging subscriber: {error}"),
        )
    })
}

fn resolve_log_level(raw: Option<&str>) -> BrowserResult<LevelFilter> {
    let raw = raw.unwrap_or(DEFAULT_LOG_LEVEL);
    raw.trim().to_ascii_lowercase().parse::<LevelFilter>().map_err(|_| {
        BrowserError::new(
            "config.log_level_invalid",
            format!(
                "invalid {ENV_LOG_LEVEL} `{raw}`; expected one of trace, debug, info, warn, error, off"
            ),
        )
    })
}

fn resolve_log_format(raw: Option<&str>) -> BrowserResult<LogFormat> {
    match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
        None | Some("compact") => Ok(LogFormat::Compact),
        Some("pretty") => Ok(LogFormat::Pretty),
        Some(_) => Err(BrowserError::new(
            "config.log_format_invalid",
            format!(
                "invalid {ENV_LOG_FORMAT} `{}`; expected pretty or compact",
                raw.unwrap_or_default()
            ),
        )),
    }
}
