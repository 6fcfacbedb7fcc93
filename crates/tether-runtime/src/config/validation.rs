//! Configuration validation utilities.

use tracing_subscriber::filter::Directive;

use super::error::{ConfigError, ConfigResult};
use super::schema::{CorrelationConfig, LogOutput, LoggingConfig, TetherConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &TetherConfig) -> ConfigResult<()> {
    validate_correlation_config(&config.correlation)?;
    validate_logging_config(&config.logging)?;
    Ok(())
}

/// Validates correlation and event pump settings.
fn validate_correlation_config(config: &CorrelationConfig) -> ConfigResult<()> {
    if config.default_timeout_ms == Some(0) {
        return Err(ConfigError::validation(
            "Default wait timeout must be greater than 0 (omit it to wait indefinitely)",
        ));
    }

    if config.event_queue_capacity == 0 {
        return Err(ConfigError::validation(
            "Event queue capacity must be greater than 0",
        ));
    }

    if config.dispatch_concurrency == 0 {
        return Err(ConfigError::validation(
            "Dispatch concurrency must be greater than 0",
        ));
    }

    Ok(())
}

/// Validates logging settings.
fn validate_logging_config(config: &LoggingConfig) -> ConfigResult<()> {
    if config.output == LogOutput::File && config.file_path.is_none() {
        return Err(ConfigError::validation(
            "File log output requires logging.file_path",
        ));
    }

    for (module, level) in &config.filters {
        let directive = format!("{module}={level}");
        if module.is_empty() {
            return Err(ConfigError::invalid_filter(directive, "empty module name"));
        }
        if let Err(e) = directive.parse::<Directive>() {
            return Err(ConfigError::invalid_filter(directive, e.to_string()));
        }
    }

    Ok(())
}
