//! Configuration loading.
//!
//! Settings come from INI files. Every file in the search list that exists is
//! layered on top of the previous ones, so a local `voltage-repeater.ini` can
//! override individual keys of the system wide `/etc/voltage-repeater.ini`.
//!
//! ```ini
//! [mqtt]
//! host = 192.168.1.10
//! port = 1883
//! username = repeater
//! password = secret
//!
//! [batterysense]
//! mac = AA:BB:CC:DD:EE:FF
//! key = 0123456789abcdef0123456789abcdef
//!
//! [log]
//! level = info
//! format = compact
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use config::{File, FileStoredFormat, Format, Map, Value, ValueKind};
use ini::{Ini, ParseOption};
use thiserror::Error;

use crate::device::{AdvertisementKey, MacAddress};

/// Searched in order, later files override earlier ones
pub const DEFAULT_PATHS: [&str; 2] = ["/etc/voltage-repeater.ini", "voltage-repeater.ini"];
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_CLIENT_ID: &str = "voltage-repeater";
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 20;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration missing: {0}")]
    Missing(String),
    #[error("invalid configuration value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),
}

#[derive(Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("client_id", &self.client_id)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .finish()
    }
}

/// The monitored battery sense
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// `mac` exactly as configured. Home Assistant knows the device by this
    /// string, so it must not be normalized.
    pub id: String,
    pub mac: MacAddress,
    pub key: AdvertisementKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}, expected compact, pretty or json")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// An `EnvFilter` directive, `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub batterysense: DeviceConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load from [`DEFAULT_PATHS`]
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&DEFAULT_PATHS)
    }

    /// Load and merge every existing file of `paths`, in order.
    pub fn load_from<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ConfigError> {
        let existing: Vec<PathBuf> = paths
            .iter()
            .map(|p| p.as_ref().to_path_buf())
            .filter(|p| p.is_file())
            .collect();

        if existing.is_empty() {
            let searched: Vec<String> = paths
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect();
            return Err(ConfigError::Missing(format!(
                "no configuration file found, searched {}",
                searched.join(", ")
            )));
        }

        let mut builder = config::Config::builder();
        for path in &existing {
            builder = builder.add_source(File::new(&path.to_string_lossy(), RawIni));
        }
        let settings = builder.build()?;

        Self::from_settings(&settings)
    }

    fn from_settings(settings: &config::Config) -> Result<Self, ConfigError> {
        let mqtt = MqttConfig {
            host: required(settings, "mqtt.host")?,
            port: optional_number(settings, "mqtt.port")?.unwrap_or(DEFAULT_PORT),
            username: required_allow_empty(settings, "mqtt.username")?,
            password: required_allow_empty(settings, "mqtt.password")?,
            client_id: optional(settings, "mqtt.client_id")?
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            keep_alive_secs: optional_number(settings, "mqtt.keep_alive")?
                .unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
        };

        let id = required(settings, "batterysense.mac")?;
        let batterysense = DeviceConfig {
            mac: parse(&id, "batterysense.mac")?,
            id,
            key: parse(&required(settings, "batterysense.key")?, "batterysense.key")?,
        };

        let log = LogConfig {
            level: optional(settings, "log.level")?
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            format: match optional(settings, "log.format")? {
                Some(format) => parse(&format, "log.format")?,
                None => LogFormat::default(),
            },
        };

        Ok(Config { mqtt, batterysense, log })
    }
}

/// INI without quote or escape processing, so values such as passwords are
/// taken exactly as written.
#[derive(Debug, Clone, Copy)]
struct RawIni;

impl Format for RawIni {
    fn parse(
        &self,
        uri: Option<&String>,
        text: &str,
    ) -> Result<Map<String, Value>, Box<dyn std::error::Error + Send + Sync>> {
        let options = ParseOption {
            enabled_quote: false,
            enabled_escape: false,
        };
        let document = Ini::load_from_str_opt(text, options)?;

        let string = |value: &str| Value::new(uri, ValueKind::String(value.to_owned()));
        let mut root = Map::new();
        for (section, properties) in document.iter() {
            let entries = properties.iter().map(|(k, v)| (k.to_owned(), string(v)));
            match section {
                Some(section) => {
                    let table: Map<String, Value> = entries.collect();
                    root.insert(section.to_owned(), Value::new(uri, ValueKind::Table(table)));
                }
                None => root.extend(entries),
            }
        }
        Ok(root)
    }
}

impl FileStoredFormat for RawIni {
    fn file_extensions(&self) -> &'static [&'static str] {
        &["ini"]
    }
}

fn optional(settings: &config::Config, key: &'static str) -> Result<Option<String>, ConfigError> {
    match settings.get_string(key) {
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(ConfigError::Invalid { key, reason: e.to_string() }),
    }
}

fn required_allow_empty(
    settings: &config::Config,
    key: &'static str,
) -> Result<String, ConfigError> {
    optional(settings, key)?
        .ok_or_else(|| ConfigError::Missing(format!("required key {key} is not set")))
}

fn required(settings: &config::Config, key: &'static str) -> Result<String, ConfigError> {
    let value = required_allow_empty(settings, key)?;
    if value.is_empty() {
        return Err(ConfigError::Missing(format!("required key {key} is empty")));
    }
    Ok(value)
}

fn optional_number<T: FromStr>(
    settings: &config::Config,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: fmt::Display,
{
    match optional(settings, key)? {
        Some(value) if !value.is_empty() => parse(&value, key).map(Some),
        _ => Ok(None),
    }
}

fn parse<T: FromStr>(value: &str, key: &'static str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid { key, reason: e.to_string() })
}
