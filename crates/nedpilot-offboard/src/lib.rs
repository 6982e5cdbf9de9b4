pub mod controller;
pub mod monitor;

#[cfg(test)]
pub(crate) mod testutil;

pub use controller::{OffboardController, RunError, RunPhase, RunReport};
pub use monitor::HeartbeatMonitor;

use std::time::Duration;

use serde::Deserialize;

/// How the yaw of each streamed setpoint is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum YawPolicy {
    Fixed(f32),
    /// Face the direction of horizontal travel of each step.
    FaceTravel,
}

impl Default for YawPolicy {
    fn default() -> Self {
        YawPolicy::Fixed(0.0)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OffboardConfig {
    /// Pacing between setpoints. The vehicle falls out of offboard mode when
    /// the stream pauses longer than its setpoint timeout, so keep this
    /// comfortably below that bound. Default 2000ms.
    pub setpoint_interval_ms: Option<u64>,

    /// Hold at the final setpoint before leaving offboard. Default 10s.
    pub settle_s: Option<u64>,

    /// "fixed" (default) or "face-travel".
    pub yaw_mode: Option<String>,
    pub yaw_deg: Option<f32>,

    /// None blocks until the vehicle shows up.
    pub connect_timeout_s: Option<u64>,
    pub estimate_timeout_s: Option<u64>,

    /// How long the heartbeat may take to confirm the switch into offboard
    /// mode. Default 5s.
    pub mode_confirm_s: Option<u64>,
}

impl OffboardConfig {
    pub fn setpoint_interval(&self) -> Duration {
        Duration::from_millis(self.setpoint_interval_ms.unwrap_or(2000))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_s.unwrap_or(10))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_s.map(Duration::from_secs)
    }

    pub fn estimate_timeout(&self) -> Option<Duration> {
        self.estimate_timeout_s.map(Duration::from_secs)
    }

    pub fn mode_confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.mode_confirm_s.unwrap_or(5))
    }
}
