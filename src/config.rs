//! Controller configuration, loaded from a TOML file via confy.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Mirror preset name; see `mirror::presets::PRESET_NAMES`.
    pub mirror: String,
    pub galil: GalilSettings,
    pub server: ServerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mirror: "sec35m".to_string(),
            galil: GalilSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

/* Galil connection settings */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GalilSettings {
    pub host: String,
    pub port: u16,
    /// Maximum number of move iterations for mirrors with encoders.
    pub max_iter: usize,
}

impl Default for GalilSettings {
    fn default() -> Self {
        GalilSettings {
            host: "localhost".to_string(),
            port: 2800,
            max_iter: 5,
        }
    }
}

/* User command server settings */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind: "0.0.0.0".to_string(),
            port: 3520,
        }
    }
}
