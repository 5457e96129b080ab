//! Node configuration
//!
//! All settings have defaults matching the stock cart-pole setup, so the node
//! runs without any file present. A TOML file at
//! `<config_dir>/joy-teleop/config.toml` (or the path in `JOY_TELEOP_CONFIG`)
//! overrides individual fields; missing sections and keys fall back to the
//! defaults.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "joy-teleop";
const CONFIG_FILE: &str = "config.toml";
const CONFIG_PATH_ENV: &str = "JOY_TELEOP_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct TeleopConfig {
    pub node: NodeConfig,
    pub teleop: GoalConfig,
    pub joystick: JoystickConfig,
    pub simulation: SimulationConfig,
}

/// Names and queue sizes of the node's endpoints
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub node_name: String,
    pub joy_topic: String,
    /// Joystick messages buffered before new ones are dropped
    pub joy_queue_depth: usize,
    pub action_name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "joy_teleop".to_string(),
            joy_topic: "joy".to_string(),
            joy_queue_depth: 10,
            action_name: "/joint_trajectory_controller/follow_joint_trajectory".to_string(),
        }
    }
}

/// How joystick samples are turned into trajectory goals
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GoalConfig {
    pub joint_name: String,
    /// Index into the joystick axes array used as target position
    pub axis_index: usize,
    /// Bounded wait for the action server before a goal is dropped
    pub server_timeout_ms: u64,
    pub time_from_start_ms: u64,
}

impl Default for GoalConfig {
    fn default() -> Self {
        Self {
            joint_name: "slider_to_cart".to_string(),
            axis_index: 1,
            server_timeout_ms: 2000,
            time_from_start_ms: 1000,
        }
    }
}

impl GoalConfig {
    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }

    pub fn time_from_start(&self) -> Duration {
        Duration::from_millis(self.time_from_start_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct JoystickConfig {
    /// Stick deadzone as a fraction (0.0-1.0)
    pub deadzone: f32,
    pub poll_interval_ms: u64,
}

impl Default for JoystickConfig {
    fn default() -> Self {
        Self {
            deadzone: 0.05,
            poll_interval_ms: 2,
        }
    }
}

/// Simulated trajectory server settings
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Spawn the in-process server; without it every goal times out
    pub enabled: bool,
    pub joint_name: String,
    pub lower_limit: f64,
    pub upper_limit: f64,
    pub initial_position: f64,
    pub feedback_period_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            joint_name: "slider_to_cart".to_string(),
            lower_limit: -1.0,
            upper_limit: 1.0,
            initial_position: 0.0,
            feedback_period_ms: 50,
        }
    }
}

impl TeleopConfig {
    /// Config file location, `JOY_TELEOP_CONFIG` taking precedence
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("No config directory found, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))
    }

    /// Loads the config file, falling back to defaults when it does not exist
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?
        {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded config from {}", path.display());
        debug!("Config: {:?}", config);
        Ok(config)
    }

    /// Writes a default config file if none exists yet
    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?
        {
            debug!("Config file {} already present", path.display());
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = Self::default().to_toml_string()?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write default config: {}", e))?;
        info!("Wrote default config to {}", path.display());
        Ok(())
    }
}
