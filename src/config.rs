//! Process-wide configuration, loaded once from a TOML file with every
//! field individually defaulted so a missing file, or a file missing whole
//! tables, still produces a runnable configuration.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    FieldController,
    Supervisor,
}

fn default_role() -> Role {
    Role::FieldController
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    pub parity: String,
    pub stopbits: u8,
    pub bytesize: u8,
    pub read_timeout_s: f64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            port: String::new(),
            baud: 9600,
            parity: "E".to_string(),
            stopbits: 1,
            bytesize: 8,
            read_timeout_s: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtuConfig {
    pub slave_sensor: u8,
    pub slave_driver: u8,
    pub slave_counter: u8,
}

impl Default for RtuConfig {
    fn default() -> Self {
        RtuConfig { slave_sensor: 1, slave_driver: 2, slave_counter: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub device_ms: u64,
    pub supervisor_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig { device_ms: 300, supervisor_ms: 500 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoConfig {
    pub tick_ms: u64,
    pub move_pulses: i32,
    pub move_speed: u32,
    pub motor_timeout_s: u64,
}

impl Default for AutoConfig {
    fn default() -> Self {
        AutoConfig { tick_ms: 200, move_pulses: 5000, move_speed: 8000, motor_timeout_s: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub modbus_port: u16,
    pub json_port: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig { modbus_port: 502, json_port: 5002 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub pos_abs_max: i64,
    pub speed_max: u32,
    pub target_max: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig { pos_abs_max: 2_000_000_000, speed_max: 200_000, target_max: 65535 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub remote_host: String,
    pub remote_port: u16,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig { remote_host: "127.0.0.1".to_string(), remote_port: 502 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub rtu: RtuConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub auto: AutoConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            role: Role::FieldController,
            serial: SerialConfig::default(),
            rtu: RtuConfig::default(),
            poll: PollConfig::default(),
            auto: AutoConfig::default(),
            tcp: TcpConfig::default(),
            limits: LimitsConfig::default(),
            supervisor: SupervisorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file; an absent file falls back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let cfg: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        const VALID_BAUD: [u32; 5] = [9600, 19200, 38400, 57600, 115200];
        if !VALID_BAUD.contains(&self.serial.baud) {
            return Err(ConfigError::InvalidSetting {
                field: "serial.baud".to_string(),
                reason: format!("{} is not one of {:?}", self.serial.baud, VALID_BAUD),
            });
        }
        if !matches!(self.serial.parity.as_str(), "E" | "O" | "N") {
            return Err(ConfigError::InvalidSetting {
                field: "serial.parity".to_string(),
                reason: format!("'{}' must be one of E, O, N", self.serial.parity),
            });
        }
        if !matches!(self.serial.stopbits, 1 | 2) {
            return Err(ConfigError::InvalidSetting {
                field: "serial.stopbits".to_string(),
                reason: "must be 1 or 2".to_string(),
            });
        }
        if !matches!(self.serial.bytesize, 7 | 8) {
            return Err(ConfigError::InvalidSetting {
                field: "serial.bytesize".to_string(),
                reason: "must be 7 or 8".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/gateway.toml")).unwrap();
        assert_eq!(cfg.tcp.modbus_port, 502);
        assert_eq!(cfg.auto.move_pulses, 5000);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let dir = std::env::temp_dir().join(format!("gw_cfg_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gateway.toml");
        std::fs::write(&path, "[tcp]\nmodbus_port = 1502\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.tcp.modbus_port, 1502);
        assert_eq!(cfg.tcp.json_port, 5002);
        assert_eq!(cfg.rtu.slave_driver, 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rejects_invalid_baud() {
        let dir = std::env::temp_dir().join(format!("gw_cfg_test2_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gateway.toml");
        std::fs::write(&path, "[serial]\nbaud = 1234\n").unwrap();
        assert!(Config::load(&path).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
