//! Bridge settings.
//!
//! Values are layered: built-in defaults, then an optional config file (JSON,
//! or TOML when the file name ends in `.toml`), then command-line/environment
//! overrides.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::device::{
    default_bindings, validate_bindings, LockoutTopics, SubDeviceKind, TopicBinding,
};
use crate::transport::{parse_mqtt_endpoint, Credentials, MqttEndpoint, TlsMaterials};
use crate::{BridgeError, DeviceId, QosLevel};

const DEFAULT_BROKER_URL: &str = "tcp://localhost:1883";
const DEFAULT_DEVICE_ID: &str = "homemanager";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct BridgeConfigFile {
    broker_url: Option<String>,
    device_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    qos: Option<u8>,
    log: Option<LogConfigFile>,
    tls: Option<TlsConfigFile>,
    sub_devices: Option<BTreeMap<String, BindingConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LogConfigFile {
    file: Option<PathBuf>,
    level: Option<String>,
    console: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TlsConfigFile {
    ca: Option<PathBuf>,
    client_cert: Option<PathBuf>,
    client_key: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct BindingConfigFile {
    kind: Option<SubDeviceKind>,
    command_topic: Option<String>,
    state_topic: Option<String>,
    /// Lockout under `<state_topic>/disable/set` and `<state_topic>/disable`.
    lockout: Option<bool>,
    lockout_command_topic: Option<String>,
    lockout_state_topic: Option<String>,
}

/// Values taken from the command line or the environment. `None` keeps the
/// file or default value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub broker_url: Option<String>,
    pub device_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: Option<u8>,
    pub log_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub console: Option<bool>,
    pub tls_ca: Option<PathBuf>,
    pub tls_client_cert: Option<PathBuf>,
    pub tls_client_key: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub broker_url: String,
    pub endpoint: MqttEndpoint,
    pub device_id: DeviceId,
    pub credentials: Option<Credentials>,
    pub qos: QosLevel,
    pub bindings: Vec<TopicBinding>,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    pub console: bool,
    pub tls_ca: Option<PathBuf>,
    pub tls_client_cert: Option<PathBuf>,
    pub tls_client_key: Option<PathBuf>,
}

/// Settings before validation; bindings still reference the device id.
#[derive(Debug)]
struct RawConfig {
    broker_url: String,
    device_id: String,
    username: Option<String>,
    password: Option<String>,
    qos: u8,
    log_file: Option<PathBuf>,
    log_level: String,
    console: bool,
    tls_ca: Option<PathBuf>,
    tls_client_cert: Option<PathBuf>,
    tls_client_key: Option<PathBuf>,
    sub_devices: BTreeMap<String, BindingConfigFile>,
}

impl BridgeConfig {
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self, BridgeError> {
        let file_cfg = match config_path {
            Some(path) => read_config_file(path)?,
            None => BridgeConfigFile::default(),
        };
        let mut raw = RawConfig::from_file(file_cfg);
        raw.apply_overrides(overrides);
        raw.validate()
    }

    /// Defaults plus overrides, no file.
    pub fn from_overrides(overrides: ConfigOverrides) -> Result<Self, BridgeError> {
        Self::load(None, overrides)
    }
}

impl RawConfig {
    fn from_file(file: BridgeConfigFile) -> Self {
        let log = file.log.unwrap_or_default();
        let tls = file.tls.unwrap_or_default();
        Self {
            broker_url: file
                .broker_url
                .unwrap_or_else(|| DEFAULT_BROKER_URL.to_string()),
            device_id: file
                .device_id
                .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
            username: file.username,
            password: file.password,
            qos: file.qos.unwrap_or(1),
            log_file: log.file,
            log_level: log
                .level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            console: log.console.unwrap_or(true),
            tls_ca: tls.ca,
            tls_client_cert: tls.client_cert,
            tls_client_key: tls.client_key,
            sub_devices: file.sub_devices.unwrap_or_default(),
        }
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }
        fn set_opt<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        set(&mut self.broker_url, non_blank(overrides.broker_url));
        set(&mut self.device_id, non_blank(overrides.device_id));
        set_opt(&mut self.username, non_blank(overrides.username));
        set_opt(&mut self.password, overrides.password);
        set(&mut self.qos, overrides.qos);
        set_opt(&mut self.log_file, overrides.log_file);
        set(&mut self.log_level, non_blank(overrides.log_level));
        set(&mut self.console, overrides.console);
        set_opt(&mut self.tls_ca, overrides.tls_ca);
        set_opt(&mut self.tls_client_cert, overrides.tls_client_cert);
        set_opt(&mut self.tls_client_key, overrides.tls_client_key);
    }

    fn validate(self) -> Result<BridgeConfig, BridgeError> {
        let device_id = DeviceId::new(self.device_id)?;
        let qos = QosLevel::try_from(self.qos)?;
        let mut endpoint = parse_mqtt_endpoint(&self.broker_url, false)
            .map_err(|e| BridgeError::Config(format!("{:#}", e)))?;
        endpoint.tls = TlsMaterials::load(
            self.tls_ca.as_deref(),
            self.tls_client_cert.as_deref(),
            self.tls_client_key.as_deref(),
        )
        .map_err(|e| BridgeError::Config(format!("{:#}", e)))?;

        let credentials = match (self.username, self.password) {
            (Some(username), password) => Some(Credentials::new(username, password)),
            (None, Some(_)) => {
                return Err(BridgeError::Config(
                    "a password was given without a username".into(),
                ))
            }
            (None, None) => None,
        };

        let bindings = if self.sub_devices.is_empty() {
            default_bindings(&device_id)
        } else {
            self.sub_devices
                .into_iter()
                .map(|(name, binding)| resolve_binding(&device_id, name, binding))
                .collect::<Result<Vec<_>, _>>()?
        };
        validate_bindings(&bindings)?;

        if self.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(BridgeError::Config(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }

        Ok(BridgeConfig {
            broker_url: self.broker_url,
            endpoint,
            device_id,
            credentials,
            qos,
            bindings,
            log_file: self.log_file,
            log_level: self.log_level.to_lowercase(),
            console: self.console,
            tls_ca: self.tls_ca,
            tls_client_cert: self.tls_client_cert,
            tls_client_key: self.tls_client_key,
        })
    }
}

/// Fill in the kind and topics a config file entry may omit.
fn resolve_binding(
    device_id: &DeviceId,
    name: String,
    file: BindingConfigFile,
) -> Result<TopicBinding, BridgeError> {
    let kind = file
        .kind
        .or_else(|| SubDeviceKind::for_name(&name))
        .ok_or_else(|| {
            BridgeError::Config(format!("sub-device '{}' needs an explicit kind", name))
        })?;
    let command_topic = file
        .command_topic
        .unwrap_or_else(|| format!("home/{}/{}/cmd", device_id, name));
    let state_topic = match (file.state_topic, kind.requires_ack()) {
        (Some(topic), _) => Some(topic),
        (None, true) => Some(format!("home/{}/{}/state", device_id, name)),
        (None, false) => None,
    };
    let lockout = match (file.lockout_command_topic, file.lockout_state_topic) {
        (Some(command_topic), Some(state_topic)) => Some(LockoutTopics {
            command_topic,
            state_topic,
        }),
        (None, None) if file.lockout == Some(true) => {
            let base = state_topic.as_deref().ok_or_else(|| {
                BridgeError::Config(format!("sub-device '{}' has no state topic to lock", name))
            })?;
            Some(LockoutTopics::under(base))
        }
        (None, None) => None,
        _ => {
            return Err(BridgeError::Config(format!(
                "sub-device '{}' needs both lockout topics or neither",
                name
            )))
        }
    };
    Ok(TopicBinding {
        name,
        kind,
        command_topic,
        state_topic,
        lockout,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<BridgeConfigFile, BridgeError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let parsed = if is_toml {
        toml::from_str(&raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| BridgeError::Config(format!("invalid config file {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = BridgeConfig::from_overrides(ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.device_id.as_str(), DEFAULT_DEVICE_ID);
        assert_eq!(cfg.endpoint.host, "localhost");
        assert_eq!(cfg.endpoint.port, 1883);
        assert_eq!(cfg.qos, QosLevel::AtLeastOnce);
        assert!(cfg.credentials.is_none());
        assert!(cfg.console);
        assert_eq!(cfg.bindings.len(), 2);
    }

    #[test]
    fn binding_defaults_follow_device_id() {
        let id = DeviceId::new("dev1").unwrap();
        let tuv = resolve_binding(&id, "TUV".into(), BindingConfigFile::default()).unwrap();
        assert_eq!(tuv.kind, SubDeviceKind::Switch);
        assert_eq!(tuv.command_topic, "home/dev1/TUV/cmd");
        assert_eq!(tuv.state_topic.as_deref(), Some("home/dev1/TUV/state"));

        let err = resolve_binding(&id, "GARAGE".into(), BindingConfigFile::default()).unwrap_err();
        assert!(err.to_string().contains("explicit kind"));
    }

    #[test]
    fn log_level_must_be_known() {
        let err = BridgeConfig::from_overrides(ConfigOverrides {
            log_level: Some("chatty".into()),
            ..ConfigOverrides::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("unknown log level"));

        let cfg = BridgeConfig::from_overrides(ConfigOverrides {
            log_level: Some("DEBUG".into()),
            ..ConfigOverrides::default()
        })
        .unwrap();
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn password_requires_username() {
        let err = BridgeConfig::from_overrides(ConfigOverrides {
            password: Some("secret".into()),
            ..ConfigOverrides::default()
        })
        .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
