//! INI-style gateway configuration: a `[global]` section plus one
//! `[transport.<name>]` section per transport, with an optional `bridge`
//! key naming the transport to route readings to.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub log_level: String,
    pub poll_interval: Duration,
    pub protocol_spec_dir: String,
    /// Run every transport on its own task (`true`) vs. a single
    /// cooperative loop (`false`) — see [`crate::supervisor`].
    pub parallel: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            poll_interval: Duration::from_secs(5),
            protocol_spec_dir: "protocols".to_string(),
            parallel: true,
        }
    }
}

/// One `[transport.<name>]` section, kept as a loosely typed key/value map
/// since each transport kind reads a different subset of keys.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub name: String,
    pub kind: String,
    pub settings: BTreeMap<String, String>,
    pub bridge: Option<String>,
}

impl TransportConfig {
    /// Look up the first alias present, matching how the reference config
    /// loader tolerates a few different spellings of the same option
    /// across protocol spec generations (e.g. `baudrate` vs `baud_rate`).
    pub fn get_alias(&self, aliases: &[&str]) -> Option<&str> {
        aliases.iter().find_map(|a| self.settings.get(*a)).map(|s| s.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(|s| s.as_str())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on" | "y" | "t"))
            .unwrap_or(default)
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub global: GlobalConfig,
    pub transports: BTreeMap<String, TransportConfig>,
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<GatewayConfig> {
    let path = path.as_ref();
    let doc = ini::Ini::load_from_file(path)
        .map_err(|e| GatewayError::Config(format!("loading {}: {e}", path.display())))?;

    let mut config = GatewayConfig::default();

    if let Some(global) = doc.section(Some("global")) {
        if let Some(v) = global.get("log_level") {
            config.global.log_level = v.to_string();
        }
        if let Some(v) = global.get("poll_interval").and_then(|v| v.parse::<u64>().ok()) {
            config.global.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = global.get("protocol_spec_dir") {
            config.global.protocol_spec_dir = v.to_string();
        }
        if let Some(v) = global.get("parallel") {
            config.global.parallel = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
    }

    for (section, props) in doc.iter() {
        let Some(section) = section else { continue };
        let Some(name) = section.strip_prefix("transport.") else { continue };
        let mut settings = BTreeMap::new();
        for (k, v) in props.iter() {
            settings.insert(k.to_ascii_lowercase(), v.to_string());
        }
        let kind = settings
            .get("type")
            .cloned()
            .ok_or_else(|| GatewayError::Config(format!("[transport.{name}] is missing a type= key")))?;
        let bridge = settings.get("bridge").cloned();
        config.transports.insert(
            name.to_string(),
            TransportConfig {
                name: name.to_string(),
                kind,
                settings,
                bridge,
            },
        );
    }

    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &GatewayConfig) -> Result<()> {
    if config.transports.is_empty() {
        return Err(GatewayError::Config("no [transport.*] sections configured".into()));
    }
    for transport in config.transports.values() {
        if let Some(bridge) = &transport.bridge {
            if !config.transports.contains_key(bridge) {
                return Err(GatewayError::Config(format!(
                    "[transport.{}] bridges to unknown transport \"{bridge}\"",
                    transport.name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_global_and_transport_sections() {
        let file = write_temp(
            "[global]\nlog_level=debug\npoll_interval=10\n\n[transport.rtu1]\ntype=modbus_rtu\nport=/dev/ttyUSB0\nbridge=mqtt1\n\n[transport.mqtt1]\ntype=mqtt\nhost=localhost\n",
        );
        let config = load_from_path(file.path()).unwrap();
        assert_eq!(config.global.log_level, "debug");
        assert_eq!(config.global.poll_interval, Duration::from_secs(10));
        assert_eq!(config.transports.len(), 2);
        assert_eq!(config.transports["rtu1"].kind, "modbus_rtu");
        assert_eq!(config.transports["rtu1"].bridge.as_deref(), Some("mqtt1"));
    }

    #[test]
    fn rejects_bridge_to_unknown_transport() {
        let file = write_temp("[transport.rtu1]\ntype=modbus_rtu\nbridge=nonexistent\n");
        assert!(load_from_path(file.path()).is_err());
    }

    #[test]
    fn rejects_empty_config() {
        let file = write_temp("[global]\nlog_level=info\n");
        assert!(load_from_path(file.path()).is_err());
    }

    #[test]
    fn get_alias_checks_in_order() {
        let mut settings = BTreeMap::new();
        settings.insert("baud_rate".to_string(), "19200".to_string());
        let t = TransportConfig {
            name: "t".into(),
            kind: "modbus_rtu".into(),
            settings,
            bridge: None,
        };
        assert_eq!(t.get_alias(&["baudrate", "baud_rate"]), Some("19200"));
    }
}
