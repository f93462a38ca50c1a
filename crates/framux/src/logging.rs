//! Log output for hosts embedding framux.
//!
//! The library only emits `tracing` events; this module installs a
//! subscriber writing them to stderr.

use std::str::FromStr;

use tracing::level_filters::LevelFilter;

/// Environment variable read by [`init_from_env`] for the level.
pub const LEVEL_ENV: &str = "FRAMUX_LOG";

/// Environment variable read by [`init_from_env`] for the format.
pub const FORMAT_ENV: &str = "FRAMUX_LOG_FORMAT";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

/// A log level or format name that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log {kind}: {value:?}")]
pub struct ParseLogError {
    kind: &'static str,
    value: String,
}

impl FromStr for LogFormat {
    type Err = ParseLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(ParseLogError {
                kind: "format",
                value: s.to_string(),
            }),
        }
    }
}

impl FromStr for LogLevel {
    type Err = ParseLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(ParseLogError {
                kind: "level",
                value: s.to_string(),
            }),
        }
    }
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Install a global stderr subscriber. Later calls are ignored.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level.as_filter())
        .with_ansi(false)
        .with_target(false);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}

/// [`init_logging`] with level and format taken from [`LEVEL_ENV`] and
/// [`FORMAT_ENV`]. Unset or unparsable values fall back to the defaults.
pub fn init_from_env() {
    let (format, format_err) = from_env_var::<LogFormat>(FORMAT_ENV);
    let (level, level_err) = from_env_var::<LogLevel>(LEVEL_ENV);
    init_logging(format, level);
    for err in [format_err, level_err].into_iter().flatten() {
        tracing::warn!(%err, "ignoring log setting");
    }
}

fn from_env_var<T>(name: &str) -> (T, Option<ParseLogError>)
where
    T: FromStr<Err = ParseLogError> + Default,
{
    match std::env::var(name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => (parsed, None),
            Err(err) => (T::default(), Some(err)),
        },
        Err(_) => (T::default(), None),
    }
}
