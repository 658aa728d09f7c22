use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

pub const CONFIG_ENV_VAR: &str = "WAITLINE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "waitline.toml";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub frontend: ListenerConfig,
    pub backend: ListenerConfig,
    pub wire: WireConfig,
    pub broker: BrokerConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            frontend: ListenerConfig {
                host: crate::transport::DEFAULT_HOST.to_owned(),
                port: crate::transport::DEFAULT_FRONTEND_PORT,
            },
            backend: ListenerConfig {
                host: crate::transport::DEFAULT_HOST.to_owned(),
                port: crate::transport::DEFAULT_BACKEND_PORT,
            },
            wire: WireConfig::default(),
            broker: BrokerConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: crate::transport::DEFAULT_HOST.to_owned(),
            port: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct WireConfig {
    pub max_envelope_size_bytes: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_envelope_size_bytes: crate::wire::codec::DEFAULT_MAX_ENVELOPE_SIZE_BYTES,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Sleep between idle poll cycles; the loop's only suspension point.
    pub poll_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 10 }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 1_000 }
    }
}

impl AppConfig {
    /// Full config resolution: built-in defaults, overlaid by the discovered
    /// TOML file (explicit `--config <path>`, then the `WAITLINE_CONFIG` env
    /// var, then `./waitline.toml` when present), overlaid by
    /// `--section.key value` CLI overrides.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let (config_path, remaining_args) = extract_config_path(args)?;
        let discovered = config_path.or_else(discover_config_file);

        Self::load(discovered.as_deref(), remaining_args)
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        Self::load(Some(path.as_ref()), args.into_iter().collect())
    }

    fn load(path: Option<&Path>, args: Vec<String>) -> Result<Self, ConfigError> {
        let mut root_value =
            Value::try_from(AppConfig::default()).map_err(ConfigError::Serialize)?;

        if let Some(path) = path {
            let toml_content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_string_lossy().to_string(),
                source,
            })?;
            let file_value: Value =
                toml_content
                    .parse()
                    .map_err(|source| ConfigError::TomlParse {
                        path: path.to_string_lossy().to_string(),
                        source,
                    })?;
            merge_value(&mut root_value, file_value);
        }

        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        root_value.try_into().map_err(ConfigError::Deserialize)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Serialize(toml::ser::Error),
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Serialize(source) => {
                write!(f, "failed to build default config tree: {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn extract_config_path(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut config_path = None;
    let mut remaining = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            config_path = Some(PathBuf::from(value));
        } else {
            remaining.push(arg);
        }
    }

    Ok((config_path, remaining))
}

fn discover_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
    default_path.exists().then_some(default_path)
}

/// Overlays `overlay` onto `base`: tables merge recursively, every other
/// value replaces. The base tree always carries the full default layout, so
/// a config file only needs the keys it changes.
fn merge_value(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(base_value) => merge_value(base_value, overlay_value),
                    None => {
                        base_table.insert(key, overlay_value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.is_empty() || parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        let table = current
            .as_table_mut()
            .ok_or_else(|| ConfigError::UnknownPath {
                key: key_path.to_owned(),
            })?;
        current = table
            .get_mut(*section)
            .ok_or_else(|| ConfigError::UnknownPath {
                key: key_path.to_owned(),
            })?;
    }

    let final_key = parts[parts.len() - 1];
    let table = current
        .as_table_mut()
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;
    let current_value = table
        .get_mut(final_key)
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;

    let parsed_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    *current_value = parsed_value;

    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => {
            let parsed = raw_value
                .parse::<i64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "integer",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Integer(parsed))
        }
        Value::Float(_) => {
            let parsed = raw_value
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "float",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Float(parsed))
        }
        Value::Boolean(_) => {
            let parsed = raw_value
                .parse::<bool>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "boolean",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Boolean(parsed))
        }
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{AppConfig, ConfigError};

    fn write_temp_config(content: &str, suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "waitline-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    #[test]
    fn defaults_cover_every_section() {
        let config = AppConfig::default();

        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.human_friendly);
        assert_eq!(config.frontend.host, "0.0.0.0");
        assert_eq!(config.frontend.port, 9870);
        assert_eq!(config.backend.host, "0.0.0.0");
        assert_eq!(config.backend.port, 9871);
        assert_eq!(config.wire.max_envelope_size_bytes, 8 * 1024 * 1024);
        assert_eq!(config.broker.poll_interval_ms, 10);
        assert_eq!(config.heartbeat.interval_ms, 1_000);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let path = write_temp_config(
            r#"
[logging]
level = "debug"

[frontend]
port = 7001

[backend]
port = 7002
"#,
            "partial",
        );

        let config = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.human_friendly);
        assert_eq!(config.frontend.port, 7001);
        assert_eq!(config.backend.port, 7002);
        assert_eq!(config.broker.poll_interval_ms, 10);
    }

    #[test]
    fn argv_overrides_matching_toml_paths() {
        let path = write_temp_config(
            r#"
[logging]
level = "debug"
human_friendly = false

[heartbeat]
interval_ms = 1000
"#,
            "override",
        );

        let config = AppConfig::load_from_toml_with_args(
            &path,
            vec![
                "--logging.level".to_owned(),
                "warn".to_owned(),
                "--logging.human_friendly".to_owned(),
                "true".to_owned(),
                "--heartbeat.interval_ms".to_owned(),
                "250".to_owned(),
                "--broker.poll_interval_ms".to_owned(),
                "5".to_owned(),
            ],
        )
        .expect("config with overrides should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "warn");
        assert!(config.logging.human_friendly);
        assert_eq!(config.heartbeat.interval_ms, 250);
        assert_eq!(config.broker.poll_interval_ms, 5);
    }

    #[test]
    fn rejects_unknown_override_path() {
        let path = write_temp_config("[logging]\nlevel = \"debug\"\n", "unknown-path");

        let err = AppConfig::load_from_toml_with_args(
            &path,
            vec!["--logging.nonexistent".to_owned(), "x".to_owned()],
        )
        .expect_err("unknown override key should fail");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert!(matches!(err, ConfigError::UnknownPath { .. }));
    }

    #[test]
    fn rejects_value_of_wrong_type() {
        let path = write_temp_config("[frontend]\nport = 7001\n", "wrong-type");

        let err = AppConfig::load_from_toml_with_args(
            &path,
            vec!["--frontend.port".to_owned(), "not-a-number".to_owned()],
        )
        .expect_err("non-integer port should fail");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert!(matches!(
            err,
            ConfigError::InvalidValueForType {
                expected: "integer",
                ..
            }
        ));
    }

    #[test]
    fn discovery_honors_explicit_config_flag_and_keeps_overrides() {
        let path = write_temp_config("[backend]\nport = 7100\n", "discovery");

        let config = AppConfig::load_with_discovery(vec![
            "--config".to_owned(),
            path.to_string_lossy().to_string(),
            "--frontend.port".to_owned(),
            "7099".to_owned(),
        ])
        .expect("discovery with explicit path should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.backend.port, 7100);
        assert_eq!(config.frontend.port, 7099);
    }

    #[test]
    fn missing_config_flag_value_is_reported() {
        let err = AppConfig::load_with_discovery(vec!["--config".to_owned()])
            .expect_err("dangling --config should fail");
        assert!(matches!(err, ConfigError::MissingValueForArg { .. }));
    }
}
