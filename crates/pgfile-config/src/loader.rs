//! Configuration loading from YAML documents and environment overrides.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::defaults::MODULE_SECTION;
use crate::error::{ConfigError, ConfigResult};
use crate::model::{FetchTransportKind, SyncConfig};
use crate::validate::validate;

/// Environment variable naming the YAML configuration file.
pub const CONFIG_PATH_ENV: &str = "PGFILE_CONFIG";

/// Load configuration using the process environment.
///
/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed, or
/// if the resulting document fails validation.
pub fn load_from_env() -> ConfigResult<SyncConfig> {
    let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
    load_config(path.as_deref(), |name| std::env::var(name).ok())
}

/// Load configuration from an optional YAML file, applying overrides from `env`.
///
/// Validation is skipped when the engine's module section is disabled, since a
/// disabled module needs no store or filesystem settings.
///
/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed, or
/// if the resulting document fails validation.
pub fn load_config<F>(path: Option<&Path>, env: F) -> ConfigResult<SyncConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            info!(path = %path.display(), "loading configuration file");
            parse_document(&raw, Some(path))?
        }
        None => {
            debug!("no configuration file supplied; using defaults");
            SyncConfig::default()
        }
    };

    apply_env_overrides(&mut config, env)?;

    if config.module_enabled(MODULE_SECTION) {
        validate(&config)?;
    }
    Ok(config)
}

fn parse_document(raw: &str, path: Option<&Path>) -> ConfigResult<SyncConfig> {
    if raw.trim().is_empty() {
        return Ok(SyncConfig::default());
    }
    serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
        path: path.map(Path::to_path_buf),
        source,
    })
}

fn apply_env_overrides<F>(config: &mut SyncConfig, env: F) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = env("DATABASE_URL") {
        config.database.url = url;
    }
    if let Some(root) = env("PGFILE_ROOT") {
        config.files.root = PathBuf::from(root);
    }
    if let Some(transport) = env("PGFILE_TRANSPORT") {
        config.files.transport = FetchTransportKind::from_label(&transport).ok_or_else(|| {
            ConfigError::invalid("files", "transport", "unknown_transport", Some(transport))
        })?;
    }
    if let Some(client_id) = env("PGFILE_CLIENT_ID") {
        config.auth.client_id = client_id;
    }
    if let Some(secret) = env("PGFILE_CLIENT_SECRET") {
        config.auth.client_secret = secret;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn loads_yaml_document_with_sections() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r"
database:
  url: postgres://files@db/files
  channel: file
files:
  root: /srv/files
  transport: curl
heartbeat:
  listen_check_secs: 10
modules:
  pg-file:
    enable: true
logging:
  level: debug
  format: json
"
        )?;

        let config = load_config(Some(file.path()), env_from(&[]))?;
        assert_eq!(config.database.url, "postgres://files@db/files");
        assert_eq!(config.files.root, PathBuf::from("/srv/files"));
        assert_eq!(config.files.transport, FetchTransportKind::Curl);
        assert_eq!(config.heartbeat.listen_check_secs, 10);
        assert_eq!(config.heartbeat.auth_refresh_secs, 5);
        assert_eq!(config.heartbeat.session_max_age_secs, 300);
        assert_eq!(config.logging.level, "debug");
        Ok(())
    }

    #[test]
    fn env_overrides_take_precedence() -> ConfigResult<()> {
        let config = load_config(
            None,
            env_from(&[
                ("DATABASE_URL", "postgres://override/db"),
                ("PGFILE_ROOT", "/data/files"),
                ("PGFILE_TRANSPORT", "curl"),
                ("PGFILE_CLIENT_ID", "daemon"),
            ]),
        )?;
        assert_eq!(config.database.url, "postgres://override/db");
        assert_eq!(config.files.root, PathBuf::from("/data/files"));
        assert_eq!(config.files.transport, FetchTransportKind::Curl);
        assert_eq!(config.auth.client_id, "daemon");
        Ok(())
    }

    #[test]
    fn unknown_transport_is_rejected() {
        let result = load_config(
            None,
            env_from(&[("DATABASE_URL", "postgres://db"), ("PGFILE_TRANSPORT", "ftp")]),
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidField {
                field: "transport",
                reason: "unknown_transport",
                ..
            })
        ));
    }

    #[test]
    fn disabled_module_skips_validation() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "modules:\n  pg-file:\n    enable: false")?;
        let config = load_config(Some(file.path()), env_from(&[]))?;
        assert!(!config.module_enabled(MODULE_SECTION));
        Ok(())
    }

    #[test]
    fn unknown_fields_fail_to_parse() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "files:\n  rooot: /srv")?;
        assert!(matches!(
            load_config(Some(file.path()), env_from(&[])),
            Err(ConfigError::Parse { .. })
        ));
        Ok(())
    }

    #[test]
    fn missing_file_reports_io_error() {
        let result = load_config(Some(Path::new("/definitely/missing.yaml")), env_from(&[]));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
