use crate::components::{ButtonRole, Timing};
use crate::model::Axis;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(default)]
pub struct ReverseAxes {
    pub x: bool,
    pub y: bool,
    pub z: bool,
}

impl ReverseAxes {
    /// -1 for a reversed axis, 1 otherwise.
    pub fn direction(&self, axis: Axis) -> f64 {
        let reversed = match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        };
        if reversed {
            -1.0
        } else {
            1.0
        }
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    // Touch plate thickness (mm), becomes the work Z after probing
    pub plate_thickness: f64,
    // Coarse probe feed (mm/min)
    pub feed_rate: f64,
    // Fine probe feed (mm/min)
    pub fine_feed_rate: f64,
    // Free planner blocks meaning the queue is empty (Grbl default buffer is 15)
    pub planner_blocks: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            plate_thickness: 10.0,
            feed_rate: 100.0,
            fine_feed_rate: 20.0,
            planner_blocks: 15,
        }
    }
}

/// Which physical button id plays which role, and how long a press must
/// last to count as a hold.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(default)]
pub struct ButtonConfig {
    pub hold_ms: u64,
    pub x: u8,
    pub y: u8,
    pub z: u8,
    pub probe: u8,
    pub step: u8,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            hold_ms: 1000,
            x: 1,
            y: 2,
            z: 3,
            probe: 4,
            step: 5,
        }
    }
}

impl ButtonConfig {
    pub fn role(&self, id: u8) -> Option<ButtonRole> {
        if id == self.x {
            Some(ButtonRole::Axis(Axis::X))
        } else if id == self.y {
            Some(ButtonRole::Axis(Axis::Y))
        } else if id == self.z {
            Some(ButtonRole::Axis(Axis::Z))
        } else if id == self.probe {
            Some(ButtonRole::Probe)
        } else if id == self.step {
            Some(ButtonRole::Step)
        } else {
            None
        }
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(default)]
pub struct PendantConfig {
    // Step jog distances (mm), cycled by the step button
    pub step_distances: Vec<f64>,
    pub reverse: ReverseAxes,
    pub motion: Timing,
    pub probe: ProbeConfig,
    pub buttons: ButtonConfig,
}

impl Default for PendantConfig {
    fn default() -> Self {
        Self {
            step_distances: vec![0.01, 0.1, 1.0, 10.0],
            reverse: ReverseAxes::default(),
            motion: Timing::default(),
            probe: ProbeConfig::default(),
            buttons: ButtonConfig::default(),
        }
    }
}

impl PendantConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.step_distances.is_empty() {
            return invalid("step_distances must not be empty");
        }
        if self
            .step_distances
            .iter()
            .any(|d| !d.is_finite() || *d <= 0.0)
        {
            return invalid("step_distances must be positive");
        }
        if !self.motion.latency.is_finite() || self.motion.latency <= 0.0 {
            return invalid("motion.latency must be positive");
        }
        if !self.motion.stopping_bonus.is_finite() || self.motion.stopping_bonus < 0.0 {
            return invalid("motion.stopping_bonus must not be negative");
        }
        if self.probe.feed_rate <= 0.0 || self.probe.fine_feed_rate <= 0.0 {
            return invalid("probe feed rates must be positive");
        }
        if !self.probe.plate_thickness.is_finite() {
            return invalid("probe.plate_thickness must be a number");
        }
        if self.buttons.hold_ms == 0 {
            return invalid("buttons.hold_ms must be positive");
        }
        let b = &self.buttons;
        let ids: HashSet<u8> = [b.x, b.y, b.z, b.probe, b.step].into_iter().collect();
        if ids.len() != 5 {
            return invalid("button ids must be distinct");
        }
        Ok(())
    }
}
