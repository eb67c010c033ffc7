//! Structural validation for configuration documents.

use crate::error::{ConfigError, ConfigResult};
use crate::model::SyncConfig;

/// Parse an octal permission string such as `0755` or `0o644`.
///
/// # Errors
///
/// Returns `InvalidField` when the value is not octal or exceeds `0o7777`.
pub fn parse_octal_mode(field: &'static str, value: &str) -> ConfigResult<u32> {
    let trimmed = value.trim().trim_start_matches("0o");
    let mode = u32::from_str_radix(trimmed, 8).map_err(|_| {
        ConfigError::invalid("files", field, "invalid_octal", Some(value.to_string()))
    })?;
    if mode > 0o7777 {
        return Err(ConfigError::invalid(
            "files",
            field,
            "out_of_range",
            Some(value.to_string()),
        ));
    }
    Ok(mode)
}

/// Validate a loaded configuration document.
///
/// # Errors
///
/// Returns the first `InvalidField` encountered.
pub fn validate(config: &SyncConfig) -> ConfigResult<()> {
    if config.database.url.trim().is_empty() {
        return Err(ConfigError::invalid("database", "url", "missing", None));
    }
    if config.database.max_connections == 0 {
        return Err(ConfigError::invalid(
            "database",
            "max_connections",
            "zero",
            Some("0".to_string()),
        ));
    }
    if config.database.channel.trim().is_empty() {
        return Err(ConfigError::invalid("database", "channel", "missing", None));
    }
    if !config.files.root.is_absolute() {
        return Err(ConfigError::invalid(
            "files",
            "root",
            "not_absolute",
            Some(config.files.root.display().to_string()),
        ));
    }
    config.files.dir_mode_bits()?;
    config.files.file_mode_bits()?;
    if config.files.fetch_timeout_secs == 0 {
        return Err(ConfigError::invalid(
            "files",
            "fetch_timeout_secs",
            "zero",
            Some("0".to_string()),
        ));
    }

    let heartbeat = &config.heartbeat;
    for (field, value) in [
        ("tick_millis", heartbeat.tick_millis),
        ("listen_check_secs", heartbeat.listen_check_secs),
        ("auth_refresh_secs", heartbeat.auth_refresh_secs),
        ("session_max_age_secs", heartbeat.session_max_age_secs),
        ("handler_timeout_secs", heartbeat.handler_timeout_secs),
    ] {
        if value == 0 {
            return Err(ConfigError::invalid(
                "heartbeat",
                field,
                "zero",
                Some("0".to_string()),
            ));
        }
    }
    if heartbeat.max_in_flight == 0 {
        return Err(ConfigError::invalid(
            "heartbeat",
            "max_in_flight",
            "zero",
            Some("0".to_string()),
        ));
    }
    Ok(())
}
