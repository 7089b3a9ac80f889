use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use unit_plugin::message::LogLevel;

use crate::secret::SharedSecret;

pub const ENV_PROFILES_ROOT: &str = "AUTORC_PROFILES_ROOT";
pub const ENV_LOG_LEVEL: &str = "AUTORC_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "AUTORC_LOG_DIR";
pub const ENV_BIND: &str = "AUTORC_BIND";
pub const ENV_CONTEXT_SECRET: &str = "AUTORC_CONTEXT_SECRET";

/// Construction-time mistakes. Raised before a node ever ticks.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("node '{node}' declares callback '{callback}' which it does not register")]
    UnknownCallback { node: String, callback: String },
    #[error("node '{node}' binds callback '{callback}' more than once")]
    DuplicateCallback { node: String, callback: String },
    #[error("process rate must be a positive number of ticks per second, got {0}")]
    InvalidRate(f64),
    #[error("max_loop must be at least 1 when set")]
    ZeroMaxLoop,
    #[error("unknown node type '{0}'")]
    UnknownNodeType(String),
    #[error("invalid arguments for node type '{node_type}': {reason}")]
    InvalidArgs { node_type: String, reason: String },
}

/// Vehicle constants. Compiled-in defaults, overridden by the UPPERCASE keys of
/// an optional JSON file and then by `AUTORC_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct Settings {
    pub vehicle_name: String,

    // picar servo/motor setup
    pub front_wheel_channel: u8,
    pub pwm_frequency: u32,
    pub servo_channels: u8,
    pub neutral_angle: i64,
    pub min_speed: i64,
    pub max_speed: i64,
    pub min_turn_angle: i64,
    pub max_turn_angle: i64,
    pub turn_offset: i64,

    pub process_rate: f64,
    pub grace_period_ms: u64,
    pub context_bind: String,
    pub profiles_root: PathBuf,
    pub log_level: LogLevel,
    pub log_dir: Option<PathBuf>,
}

/// Where [`Settings::load`] got its values from. Settings are read before
/// tracing exists, so this is logged afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsOrigin {
    Defaults,
    File(PathBuf),
    Fallback { path: PathBuf, reason: String },
}

impl SettingsOrigin {
    pub fn log(&self) {
        match self {
            Self::Defaults => {}
            Self::File(path) => info!("Loaded settings from {}", path.display()),
            Self::Fallback { path, reason } => warn!(
                "Config file {} has invalid format or does not exist. Using default settings: {reason}",
                path.display()
            ),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vehicle_name: "NoahCar".to_string(),
            front_wheel_channel: 0,
            pwm_frequency: 60,
            servo_channels: 16,
            neutral_angle: 90,
            min_speed: 40,
            max_speed: 100,
            min_turn_angle: 70,
            max_turn_angle: 110,
            turn_offset: 0,
            process_rate: 24.0,
            grace_period_ms: 2000,
            context_bind: "127.0.0.1:0".to_string(),
            profiles_root: PathBuf::from("profiles"),
            log_level: LogLevel::Info,
            log_dir: None,
        }
    }
}

impl Settings {
    /// Defaults, overridden by `config_file` when given. A missing or malformed
    /// file falls back to the defaults; the returned origin says which happened.
    pub fn load(config_file: Option<&Path>) -> (Self, SettingsOrigin) {
        let defaults = Self::default();
        let Some(path) = config_file else {
            return (defaults, SettingsOrigin::Defaults);
        };
        match fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|raw| defaults.overridden_by(&raw))
        {
            Ok(settings) => (settings, SettingsOrigin::File(path.to_path_buf())),
            Err(reason) => (defaults, SettingsOrigin::Fallback { path: path.to_path_buf(), reason }),
        }
    }

    /// Merge the UPPERCASE keys of a JSON object over `self`; anything else is ignored.
    pub fn overridden_by(&self, raw: &str) -> Result<Self, String> {
        let overrides: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        let Value::Object(overrides) = overrides else {
            return Err("settings file must hold a JSON object".to_string());
        };
        let mut merged = serde_json::to_value(self).map_err(|e| e.to_string())?;
        if let Value::Object(base) = &mut merged {
            for (key, value) in overrides {
                if is_upper(&key) {
                    base.insert(key, value);
                }
            }
        }
        serde_json::from_value(merged).map_err(|e| e.to_string())
    }

    /// Apply `AUTORC_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| env::var(key).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup(ENV_PROFILES_ROOT) {
            self.profiles_root = PathBuf::from(root);
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            match level.parse::<LogLevel>() {
                Ok(level) => self.log_level = level,
                Err(_) => warn!("ignoring unknown {ENV_LOG_LEVEL} value '{level}'"),
            }
        }
        if let Some(dir) = lookup(ENV_LOG_DIR) {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(bind) = lookup(ENV_BIND) {
            self.context_bind = bind;
        }
    }
}

/// Configured context secret, if any.
pub fn secret_from_env() -> Option<SharedSecret> {
    env::var(ENV_CONTEXT_SECRET)
        .ok()
        .filter(|s| !s.is_empty())
        .map(SharedSecret::new)
}

/// Load a `.env` file into the process environment. Without a path the usual
/// lookup from the working directory applies and a missing file is fine.
pub fn load_env_file(env_file: Option<&Path>) {
    match env_file {
        Some(path) if path.exists() => {
            dotenvy::from_path(path).ok();
            info!("Loaded .env from {}", path.display());
        }
        Some(path) => warn!("could not load .env from {}", path.display()),
        None => {
            dotenvy::dotenv().ok();
        }
    }
}

fn is_upper(key: &str) -> bool {
    key.chars().any(|c| c.is_ascii_uppercase()) && !key.chars().any(|c| c.is_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_match_the_picar_setup() {
        let s = Settings::default();
        assert_eq!((s.min_turn_angle, s.max_turn_angle), (70, 110));
        assert_eq!((s.min_speed, s.max_speed), (40, 100));
        assert_eq!(s.pwm_frequency, 60);
        assert_eq!(s.process_rate, 24.0);
    }

    #[test]
    fn only_uppercase_keys_override() {
        let s = Settings::default()
            .overridden_by(r#"{"MAX_SPEED": 80, "vehicle_name": "Ignored", "VEHICLE_NAME": "Kitt"}"#)
            .unwrap();
        assert_eq!(s.max_speed, 80);
        assert_eq!(s.vehicle_name, "Kitt");
    }

    #[test]
    fn unknown_uppercase_keys_are_tolerated() {
        let s = Settings::default()
            .overridden_by(r#"{"WEB_CONTROLLER_PORT": 8080}"#)
            .unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn malformed_file_keeps_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{{ not json").unwrap();
        let (s, origin) = Settings::load(Some(f.path()));
        assert_eq!(s, Settings::default());
        assert!(matches!(origin, SettingsOrigin::Fallback { .. }));

        let missing = f.path().with_extension("missing");
        let (s, origin) = Settings::load(Some(&missing));
        assert_eq!(s, Settings::default());
        assert!(matches!(origin, SettingsOrigin::Fallback { path, .. } if path == missing));
        assert_eq!(Settings::load(None).1, SettingsOrigin::Defaults);
    }

    #[test]
    fn file_overrides_are_loaded() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"GRACE_PERIOD_MS": 500, "PROFILES_ROOT": "/opt/car"}}"#).unwrap();
        let (s, origin) = Settings::load(Some(f.path()));
        assert_eq!(origin, SettingsOrigin::File(f.path().to_path_buf()));
        assert_eq!(s.grace_period_ms, 500);
        assert_eq!(s.profiles_root, PathBuf::from("/opt/car"));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            (ENV_PROFILES_ROOT, "/tmp/profiles"),
            (ENV_LOG_LEVEL, "DEBUG"),
            (ENV_BIND, "0.0.0.0:7000"),
        ]
        .into_iter()
        .collect();
        let mut s = Settings::default();
        s.apply_env_from(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(s.profiles_root, PathBuf::from("/tmp/profiles"));
        assert_eq!(s.log_level, LogLevel::Debug);
        assert_eq!(s.context_bind, "0.0.0.0:7000");
    }
}
