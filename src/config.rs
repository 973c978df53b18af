// src/config.rs - Bot configuration loaded once per session
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration struct for the bot: gantry, servo, speed profile,
/// serial link, runner pacing and command templates.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BotConfig {
    #[serde(default = "default_bot_name")]
    pub name: String,
    #[serde(default)]
    pub area: AreaSettings,
    #[serde(default)]
    pub axis: AxisSettings,
    #[serde(default)]
    pub speed: SpeedSettings,
    #[serde(default)]
    pub servo: ServoSettings,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub runner: RunnerSettings,
    /// Command templates keyed by action name, with `%`-placeholders
    /// (`%d` duration ms, `%x`/`%y` step deltas, `%z` servo position).
    #[serde(default = "default_commands")]
    pub commands: HashMap<String, String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: default_bot_name(),
            area: AreaSettings::default(),
            axis: AxisSettings::default(),
            speed: SpeedSettings::default(),
            servo: ServoSettings::default(),
            serial: SerialSettings::default(),
            runner: RunnerSettings::default(),
            commands: default_commands(),
        }
    }
}

impl BotConfig {
    /// Look up a command template by name. Missing templates render to an
    /// empty string at the call site rather than erroring across the
    /// process boundary.
    pub fn template(&self, name: &str) -> Option<&str> {
        self.commands.get(name).map(|s| s.as_str())
    }
}

/// Drawable area in motor steps, used for off-canvas detection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AreaSettings {
    #[serde(default = "default_area_width")]
    pub width: f64,
    #[serde(default = "default_area_height")]
    pub height: f64,
}

impl Default for AreaSettings {
    fn default() -> Self {
        Self {
            width: default_area_width(),
            height: default_area_height(),
        }
    }
}

impl AreaSettings {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && y >= 0.0 && x <= self.width && y <= self.height
    }
}

/// Axis direction flips and motor wiring swap, applied to the final
/// integer step deltas of every planned segment.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AxisSettings {
    #[serde(default)]
    pub invert_x: bool,
    #[serde(default)]
    pub invert_y: bool,
    #[serde(default)]
    pub swap_motors: bool,
}

/// Speed and acceleration profile settings, in steps and milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpeedSettings {
    /// Lowest usable speed in steps per second.
    #[serde(default = "default_min_sps")]
    pub min_sps: f64,
    /// Highest usable speed in steps per second.
    #[serde(default = "default_max_sps")]
    pub max_sps: f64,
    /// Percent of the min..max range used while the pen is down.
    #[serde(default = "default_drawing_pct")]
    pub drawing_pct: f64,
    /// Percent of the min..max range used while the pen is up.
    #[serde(default = "default_moving_pct")]
    pub moving_pct: f64,
    /// Time to reach full speed while drawing, ms.
    #[serde(default = "default_accel_drawing")]
    pub accel_time_drawing_ms: f64,
    /// Time to reach full speed while travelling, ms.
    #[serde(default = "default_accel_moving")]
    pub accel_time_moving_ms: f64,
    /// Duration of one planned micro-segment, ms.
    #[serde(default = "default_time_slice")]
    pub time_slice_ms: f64,
    /// Pen-up moves shorter than this borrow the pen-down profile, steps.
    #[serde(default = "default_short_move")]
    pub short_move_threshold_steps: f64,
    /// Moves shorter than this get a single constant-velocity segment.
    #[serde(default = "default_min_segment")]
    pub min_segment_steps: f64,
}

impl Default for SpeedSettings {
    fn default() -> Self {
        Self {
            min_sps: default_min_sps(),
            max_sps: default_max_sps(),
            drawing_pct: default_drawing_pct(),
            moving_pct: default_moving_pct(),
            accel_time_drawing_ms: default_accel_drawing(),
            accel_time_moving_ms: default_accel_moving(),
            time_slice_ms: default_time_slice(),
            short_move_threshold_steps: default_short_move(),
            min_segment_steps: default_min_segment(),
        }
    }
}

impl SpeedSettings {
    /// Active cruise speed in steps per millisecond for the given pen mode.
    pub fn active_steps_per_ms(&self, drawing: bool) -> f64 {
        let pct = if drawing { self.drawing_pct } else { self.moving_pct };
        let sps = self.min_sps + (self.max_sps - self.min_sps) * (pct / 100.0).clamp(0.0, 1.0);
        sps / 1000.0
    }

    pub fn accel_time_ms(&self, drawing: bool) -> f64 {
        if drawing {
            self.accel_time_drawing_ms
        } else {
            self.accel_time_moving_ms
        }
    }
}

/// Height servo range and named position presets (percent of range).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServoSettings {
    #[serde(default = "default_servo_min")]
    pub min: u32,
    #[serde(default = "default_servo_max")]
    pub max: u32,
    /// Full-swing travel time, ms.
    #[serde(default = "default_servo_duration")]
    pub duration_ms: u64,
    /// Named presets as percent of the servo range.
    #[serde(default = "default_servo_presets")]
    pub presets: HashMap<String, f64>,
}

impl Default for ServoSettings {
    fn default() -> Self {
        Self {
            min: default_servo_min(),
            max: default_servo_max(),
            duration_ms: default_servo_duration(),
            presets: default_servo_presets(),
        }
    }
}

impl ServoSettings {
    pub fn range(&self) -> f64 {
        (self.max - self.min) as f64
    }

    pub fn preset_pct(&self, name: &str) -> Option<f64> {
        self.presets.get(name).copied()
    }
}

/// Serial link parameters, owned by the runner process.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialSettings {
    /// Explicit port path; when absent the runner autodetects.
    #[serde(default)]
    pub port: Option<String>,
    /// Substring matched against available port paths during autodetect.
    #[serde(default = "default_port_hint")]
    pub port_hint: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Acknowledgment string the board sends after each command.
    #[serde(default = "default_ack")]
    pub ack: String,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: None,
            port_hint: default_port_hint(),
            baud: default_baud(),
            ack: default_ack(),
            reconnect_interval_ms: default_reconnect_interval(),
            max_reconnect_attempts: default_reconnect_attempts(),
        }
    }
}

/// Runner pacing parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerSettings {
    /// Main loop poll interval, ms.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Scheduling overhead subtracted from each item's pacing wait, ms.
    #[serde(default = "default_latency_offset")]
    pub latency_offset_ms: u64,
    /// Ceiling on items chained back-to-back inside one poll tick.
    #[serde(default = "default_step_budget")]
    pub step_budget: u32,
    /// Fixed interval between controller respawn attempts, ms.
    #[serde(default = "default_respawn_interval")]
    pub respawn_interval_ms: u64,
    /// Respawn attempts before the controller gives up and destroys.
    #[serde(default = "default_respawn_attempts")]
    pub max_respawn_attempts: u32,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            latency_offset_ms: default_latency_offset(),
            step_budget: default_step_budget(),
            respawn_interval_ms: default_respawn_interval(),
            max_respawn_attempts: default_respawn_attempts(),
        }
    }
}

// Default value functions
fn default_bot_name() -> String {
    "plotbot".to_string()
}
fn default_area_width() -> f64 {
    12_630.0
}
fn default_area_height() -> f64 {
    8_260.0
}
fn default_min_sps() -> f64 {
    50.0
}
fn default_max_sps() -> f64 {
    2000.0
}
fn default_drawing_pct() -> f64 {
    75.0
}
fn default_moving_pct() -> f64 {
    75.0
}
fn default_accel_drawing() -> f64 {
    400.0
}
fn default_accel_moving() -> f64 {
    200.0
}
fn default_time_slice() -> f64 {
    25.0
}
fn default_short_move() -> f64 {
    1000.0
}
fn default_min_segment() -> f64 {
    8.0
}
fn default_servo_min() -> u32 {
    7500
}
fn default_servo_max() -> u32 {
    24500
}
fn default_servo_duration() -> u64 {
    340
}
fn default_servo_presets() -> HashMap<String, f64> {
    let mut presets = HashMap::new();
    presets.insert("up".to_string(), 70.0);
    presets.insert("draw".to_string(), 30.0);
    presets.insert("wash".to_string(), 10.0);
    presets.insert("paint".to_string(), 25.0);
    presets
}
fn default_port_hint() -> String {
    "ttyACM".to_string()
}
fn default_baud() -> u32 {
    9600
}
fn default_ack() -> String {
    "OK".to_string()
}
fn default_reconnect_interval() -> u64 {
    1000
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_poll_interval() -> u64 {
    10
}
fn default_latency_offset() -> u64 {
    20
}
fn default_step_budget() -> u32 {
    10
}
fn default_respawn_interval() -> u64 {
    2000
}
fn default_respawn_attempts() -> u32 {
    5
}
fn default_commands() -> HashMap<String, String> {
    let mut commands = HashMap::new();
    commands.insert("move".to_string(), "SM,%d,%x,%y".to_string());
    commands.insert("height".to_string(), "SC,4,%z".to_string());
    commands.insert("park".to_string(), "EM,0,0".to_string());
    commands.insert("penup".to_string(), "SP,1,%d".to_string());
    commands.insert("pendown".to_string(), "SP,0,%d".to_string());
    commands
}

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<BotConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}
