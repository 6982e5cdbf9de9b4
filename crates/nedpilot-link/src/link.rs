use std::future::Future;

use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::state::{CommandResult, ConnectionState, StatusEvent, VehicleHealth, VehicleState};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("vehicle link unavailable: {0}")]
    Unavailable(String),
    #[error("no acknowledgment for {command} within {timeout_ms}ms")]
    AckTimeout { command: &'static str, timeout_ms: u64 },
    #[error("vehicle link closed")]
    Closed,
}

/// A position setpoint in the local NED frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionNedYaw {
    pub north_m: f32,
    pub east_m: f32,
    pub down_m: f32,
    pub yaw_deg: f32,
}

impl PositionNedYaw {
    pub const fn new(north_m: f32, east_m: f32, down_m: f32, yaw_deg: f32) -> Self {
        Self { north_m, east_m, down_m, yaw_deg }
    }

    /// The zero-displacement, zero-yaw setpoint used to prime offboard mode.
    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }
}

/// The capability surface of a connected vehicle.
///
/// Handed to the controller and the monitor at construction. State flows one
/// way: the reader side of the link publishes onto the watch/broadcast
/// channels, and commands issued here are only *expected* to cause a future
/// state transition, never reflected locally.
///
/// Reads and command issuance are independently safe for concurrent use, so
/// a monitor task can share the handle with the control task.
pub trait VehicleLink {
    fn connection(&self) -> watch::Receiver<ConnectionState>;
    fn health(&self) -> watch::Receiver<VehicleHealth>;
    fn vehicle_state(&self) -> watch::Receiver<VehicleState>;
    fn status_text(&self) -> broadcast::Receiver<StatusEvent>;

    fn arm(&self) -> impl Future<Output = Result<CommandResult, LinkError>> + Send;
    fn disarm(&self) -> impl Future<Output = Result<CommandResult, LinkError>> + Send;

    /// Fire-and-forget; pacing is the caller's responsibility.
    fn set_position_ned(
        &self,
        sp: PositionNedYaw,
    ) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn start_offboard(&self) -> impl Future<Output = Result<CommandResult, LinkError>> + Send;
    fn stop_offboard(&self) -> impl Future<Output = Result<CommandResult, LinkError>> + Send;
}
