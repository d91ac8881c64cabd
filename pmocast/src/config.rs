//! # Configuration
//!
//! Settings are resolved in three layers:
//! - the defaults embedded in the crate (`pmocast.yaml`)
//! - `config.yaml` in the configuration directory, when present
//! - `PMOCAST_CONFIG__<SECTION>__<KEY>` environment variables
//!
//! The configuration directory is, in order: the directory passed to
//! [`CastConfig::load`], the `PMOCAST_CONFIG` environment variable,
//! `.pmocast` in the current directory, `.pmocast` in the home directory.
//!
//! ```no_run
//! use pmocast::CastConfig;
//!
//! let config = CastConfig::load(None)?;
//! println!("receiver app: {}", config.receiver_app_id);
//! # Ok::<(), anyhow::Error>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use anyhow::{Context, Result, anyhow};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use crate::discovery::{DEFAULT_CAST_PORT, GOOGLECAST_SERVICE, ScanOptions};
use crate::manager::ManagerOptions;
use crate::transport::DEFAULT_MEDIA_RECEIVER_APP_ID;

const DEFAULT_CONFIG: &str = include_str!("pmocast.yaml");

const ENV_CONFIG_DIR: &str = "PMOCAST_CONFIG";
const ENV_PREFIX: &str = "PMOCAST_CONFIG__";
const CONFIG_DIR_NAME: &str = ".pmocast";
const CONFIG_FILE_NAME: &str = "config.yaml";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub service_name: String,
    pub default_port: u16,
    pub mdns_query_interval_secs: u64,
    pub device_max_age_secs: u64,
    pub scan_tick_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub status_poll_interval_ms: u64,
}

/// Resolved pmocast settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastConfig {
    /// Sender name announced to receivers.
    pub client_package_name: String,
    /// Application launched by the demos and by default callers.
    pub receiver_app_id: String,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
}

/// Same values as the embedded `pmocast.yaml`.
impl Default for CastConfig {
    fn default() -> Self {
        Self {
            client_package_name: "pmocast".to_string(),
            receiver_app_id: DEFAULT_MEDIA_RECEIVER_APP_ID.to_string(),
            discovery: DiscoveryConfig {
                service_name: GOOGLECAST_SERVICE.to_string(),
                default_port: DEFAULT_CAST_PORT,
                mdns_query_interval_secs: 15,
                device_max_age_secs: 1800,
                scan_tick_ms: 500,
            },
            session: SessionConfig {
                status_poll_interval_ms: 1000,
            },
        }
    }
}

impl CastConfig {
    /// Loads the configuration from `directory` or the default search path.
    pub fn load(directory: Option<&Path>) -> Result<Self> {
        let dir = find_config_dir(directory);
        info!(config_dir = %dir.display(), "Using pmocast config directory");
        Self::load_with_env(&dir, env::vars())
    }

    /// Loads `<dir>/config.yaml` over the defaults, then applies overrides
    /// from `vars`.
    pub fn load_with_env<I>(dir: &Path, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut value = default_value();

        let file = dir.join(CONFIG_FILE_NAME);
        if file.is_file() {
            let data = fs::read_to_string(&file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let external: Value = serde_yaml::from_str(&data)
                .with_context(|| format!("cannot parse {}", file.display()))?;
            merge_yaml(&mut value, &lower_keys(external));
            info!(config_file = %file.display(), "Loaded config file");
        } else {
            debug!(config_file = %file.display(), "Config file not found, using embedded defaults");
        }

        apply_env_overrides(&mut value, vars);
        Self::from_value(value)
    }

    /// Parses `yaml` over the embedded defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut value = default_value();
        let external: Value = serde_yaml::from_str(yaml)?;
        merge_yaml(&mut value, &lower_keys(external));
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self> {
        let config: CastConfig = serde_yaml::from_value(value).context("invalid pmocast config")?;
        if config.session.status_poll_interval_ms == 0 {
            return Err(anyhow!("session.status_poll_interval_ms must be positive"));
        }
        if config.discovery.scan_tick_ms == 0 {
            return Err(anyhow!("discovery.scan_tick_ms must be positive"));
        }
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            status_poll_interval: Duration::from_millis(self.session.status_poll_interval_ms),
        }
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            service_name: self.discovery.service_name.clone(),
            default_port: self.discovery.default_port,
            query_interval: Duration::from_secs(self.discovery.mdns_query_interval_secs),
            device_max_age: Duration::from_secs(self.discovery.device_max_age_secs),
            tick: Duration::from_millis(self.discovery.scan_tick_ms),
        }
    }
}

fn default_value() -> Value {
    serde_yaml::from_str(DEFAULT_CONFIG).unwrap_or(Value::Null)
}

fn find_config_dir(directory: Option<&Path>) -> PathBuf {
    if let Some(dir) = directory {
        return dir.to_path_buf();
    }

    if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
        info!(env_var = ENV_CONFIG_DIR, path = %env_path, "Trying to load config from env");
        return PathBuf::from(env_path);
    }

    let local = Path::new(CONFIG_DIR_NAME);
    if local.exists() {
        return local.to_path_buf();
    }

    if let Some(home) = home_dir() {
        let home_config = home.join(CONFIG_DIR_NAME);
        if home_config.exists() {
            return home_config;
        }
    }

    local.to_path_buf()
}

fn apply_env_overrides<I>(config: &mut Value, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        let Some(path) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path: Vec<String> = path.split("__").map(str::to_lowercase).collect();
        debug!(key = %key, "Applying config override");
        set_value(config, &path, convert_env_value(&value));
    }
}

fn convert_env_value(value: &str) -> Value {
    serde_yaml::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn set_value(data: &mut Value, path: &[String], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        *data = value;
        return;
    };
    if !matches!(data, Value::Mapping(_)) {
        *data = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(map) = data {
        let entry = map
            .entry(Value::String(first.clone()))
            .or_insert(Value::Null);
        set_value(entry, rest, value);
    }
}

fn lower_keys(value: Value) -> Value {
    match value {
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| match k {
                    Value::String(s) => (Value::String(s.to_lowercase()), lower_keys(v)),
                    other => (other, lower_keys(v)),
                })
                .collect(),
        ),
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(lower_keys).collect()),
        other => other,
    }
}

fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn embedded_defaults() {
        let config = CastConfig::from_value(default_value()).unwrap();
        assert_eq!(config, CastConfig::default());
        assert_eq!(config.client_package_name, "pmocast");
        assert_eq!(config.receiver_app_id, "CC1AD845");
        assert_eq!(config.discovery.service_name, "_googlecast._tcp.local");
        assert_eq!(config.discovery.default_port, 8009);
        assert_eq!(
            config.manager_options().status_poll_interval,
            Duration::from_secs(1)
        );
        assert_eq!(config.scan_options(), ScanOptions::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "Client_Package_Name: my-player\ndiscovery:\n  default_port: 9000\n",
        )
        .unwrap();

        let config = CastConfig::load_with_env(dir.path(), Vec::new()).unwrap();
        assert_eq!(config.client_package_name, "my-player");
        assert_eq!(config.discovery.default_port, 9000);
        // Untouched keys keep their defaults.
        assert_eq!(config.discovery.device_max_age_secs, 1800);
    }

    #[test]
    fn env_overrides_win_over_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "session:\n  status_poll_interval_ms: 250\n",
        )
        .unwrap();

        let vars = vec![
            (
                "PMOCAST_CONFIG__SESSION__STATUS_POLL_INTERVAL_MS".to_string(),
                "2000".to_string(),
            ),
            (
                "PMOCAST_CONFIG__RECEIVER_APP_ID".to_string(),
                "ABCD1234".to_string(),
            ),
            ("UNRELATED".to_string(), "1".to_string()),
        ];
        let config = CastConfig::load_with_env(dir.path(), vars).unwrap();
        assert_eq!(config.session.status_poll_interval_ms, 2000);
        assert_eq!(config.receiver_app_id, "ABCD1234");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = CastConfig::load_with_env(dir.path(), Vec::new()).unwrap();
        assert_eq!(config, CastConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(CastConfig::from_yaml_str("session:\n  status_poll_interval_ms: 0\n").is_err());
        assert!(CastConfig::from_yaml_str("discovery:\n  default_port: not-a-port\n").is_err());
    }

    #[test]
    fn yaml_round_trip_keeps_values() {
        let config = CastConfig::from_yaml_str("discovery:\n  scan_tick_ms: 100\n").unwrap();
        let reparsed = CastConfig::from_yaml_str(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(reparsed, config);
        assert_eq!(reparsed.scan_options().tick, Duration::from_millis(100));
    }
}
