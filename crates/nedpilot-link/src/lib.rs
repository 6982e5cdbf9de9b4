pub mod link;
pub mod session;
pub mod state;

pub use link::{LinkError, PositionNedYaw, VehicleLink};
pub use session::MavLinkSession;
pub use state::{
    AckCode, CommandResult, ConnectionState, Severity, StatusEvent, VehicleHealth, VehicleMode,
    VehicleState,
};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// Connection address in `mavlink::connect` form, e.g.
    /// "udpin:0.0.0.0:14551" or "serial:/dev/ttyUSB0:57600".
    pub address: String,

    /// MAVLink ids we use (companion side).
    pub sys_id: u8,
    pub comp_id: u8,

    /// Target system/component (autopilot side). 1/1 is the common default.
    pub target_sys: u8,
    pub target_comp: u8,

    /// Link is considered lost after this long without a heartbeat.
    /// Default 3s.
    pub heartbeat_timeout_s: Option<u64>,

    /// How long a command waits for its COMMAND_ACK. Default 1500ms.
    pub ack_timeout_ms: Option<u64>,
}

impl LinkConfig {
    pub fn heartbeat_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_timeout_s.unwrap_or(3))
    }

    pub fn ack_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ack_timeout_ms.unwrap_or(1500))
    }
}
