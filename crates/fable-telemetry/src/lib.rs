use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("invalid filter directive: {0}")]
    InvalidFilter(String),

    #[error("subscriber already installed: {0}")]
    AlreadyInitialized(String),

    #[error("filter reload failed: {0}")]
    Reload(String),
}

/// Output encoding for log lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "fable_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Json,
        }
    }
}

/// Parse a level name such as `warn` or `DEBUG`.
pub fn parse_level(raw: &str) -> Result<Level, TelemetryError> {
    Level::from_str(raw.trim()).map_err(|_| TelemetryError::InvalidLevel(raw.to_string()))
}

/// Parse a `module=level` override such as `fable_store=debug`.
pub fn parse_module_level(raw: &str) -> Result<(String, Level), TelemetryError> {
    let (module, level) = raw
        .split_once('=')
        .ok_or_else(|| TelemetryError::InvalidFilter(format!("expected module=level, got {raw}")))?;
    let module = module.trim();
    if module.is_empty() {
        return Err(TelemetryError::InvalidFilter(format!("missing module in {raw}")));
    }
    Ok((module.to_string(), parse_level(level)?))
}

fn filter_directives(level: Level, module_levels: &[(String, Level)]) -> String {
    let mut directives = level.to_string().to_lowercase();
    for (module, level) in module_levels {
        directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    directives
}

/// Keeps the installed subscriber adjustable at runtime.
pub struct TelemetryGuard {
    base_level: Level,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
    handle: reload::Handle<EnvFilter, Registry>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        let directives = {
            let mut levels = self.module_levels.write();
            match levels.iter_mut().find(|(m, _)| m == module) {
                Some(entry) => entry.1 = level,
                None => levels.push((module.to_string(), level)),
            }
            filter_directives(self.base_level, &levels)
        };
        let filter =
            EnvFilter::try_new(&directives).map_err(|e| TelemetryError::InvalidFilter(e.to_string()))?;
        self.handle
            .reload(filter)
            .map_err(|e| TelemetryError::Reload(e.to_string()))
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }
}

/// Install the global subscriber. Call once at startup; logs go to stderr.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let directives = filter_directives(config.log_level, &config.module_levels);
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&directives).map_err(|e| TelemetryError::InvalidFilter(e.to_string()))?,
    };
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let json_layer = (config.format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
    });
    let pretty_layer = (config.format == LogFormat::Pretty)
        .then(|| fmt::layer().with_target(true).with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    Ok(TelemetryGuard {
        base_level: config.log_level,
        module_levels: Arc::new(RwLock::new(config.module_levels)),
        handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let directives = filter_directives(
            Level::WARN,
            &[("fable_store".into(), Level::DEBUG), ("fable_engine".into(), Level::TRACE)],
        );
        assert_eq!(directives, "warn,fable_store=debug,fable_engine=trace");
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn level_parsing() {
        assert_eq!(parse_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_level(" WARN ").unwrap(), Level::WARN);
        assert!(matches!(parse_level("loud"), Err(TelemetryError::InvalidLevel(_))));
    }

    #[test]
    fn default_config_is_info_json() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.module_levels.is_empty());
    }

    #[test]
    fn module_level_parsing() {
        assert_eq!(
            parse_module_level("fable_store=debug").unwrap(),
            ("fable_store".to_string(), Level::DEBUG)
        );
        assert_eq!(
            parse_module_level(" fable_engine = TRACE").unwrap(),
            ("fable_engine".to_string(), Level::TRACE)
        );
        assert!(matches!(parse_module_level("fable_store"), Err(TelemetryError::InvalidFilter(_))));
        assert!(matches!(parse_module_level("=debug"), Err(TelemetryError::InvalidFilter(_))));
        assert!(matches!(parse_module_level("fable_store=loud"), Err(TelemetryError::InvalidLevel(_))));
    }

    // The only test in this crate that installs the global subscriber.
    #[test]
    fn guard_updates_module_levels_at_runtime() {
        let guard = init_telemetry(TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("fable_store".into(), Level::INFO)],
            format: LogFormat::Pretty,
        })
        .unwrap();

        guard.set_module_level("fable_store", Level::DEBUG).unwrap();
        guard.set_module_level("fable_engine", Level::TRACE).unwrap();
        assert_eq!(
            guard.module_levels(),
            vec![
                ("fable_store".to_string(), Level::DEBUG),
                ("fable_engine".to_string(), Level::TRACE),
            ]
        );

        assert!(matches!(
            init_telemetry(TelemetryConfig::default()),
            Err(TelemetryError::AlreadyInitialized(_))
        ));
    }

    #[test]
    fn format_serde_names() {
        assert_eq!(serde_json::to_string(&LogFormat::Pretty).unwrap(), r#""pretty""#);
    }
}
