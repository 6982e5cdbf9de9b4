//! Scripted in-memory vehicle link for controller and monitor tests.

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};

use nedpilot_link::{
    AckCode, CommandResult, ConnectionState, LinkError, PositionNedYaw, StatusEvent, VehicleHealth,
    VehicleLink, VehicleMode, VehicleState,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Arm,
    Disarm,
    SetPosition(PositionNedYaw),
    StartOffboard,
    StopOffboard,
}

/// Starts connected, healthy and disarmed; accepts every command unless told
/// otherwise. State flips scripted on the nth setpoint make mid-stream
/// failures deterministic without timing.
pub struct StubLink {
    calls: Arc<Mutex<Vec<Call>>>,
    conn_tx: watch::Sender<ConnectionState>,
    conn_rx: watch::Receiver<ConnectionState>,
    _health_tx: watch::Sender<VehicleHealth>,
    health_rx: watch::Receiver<VehicleHealth>,
    state_tx: watch::Sender<VehicleState>,
    state_rx: watch::Receiver<VehicleState>,
    pub status_tx: broadcast::Sender<StatusEvent>,

    pub reject_arm: bool,
    pub reject_start: bool,
    pub reject_stop: bool,
    /// Flip `connected` to false once this many setpoints (primer included)
    /// have been sent.
    pub drop_link_after: Option<usize>,
    /// Flip `armed` to false once this many setpoints have been sent.
    pub disarm_after: Option<usize>,
    /// Raise the cancel flag once this many setpoints have been sent.
    pub cancel_after: Option<(usize, watch::Sender<bool>)>,
}

impl StubLink {
    pub fn new() -> Self {
        let (conn_tx, conn_rx) = watch::channel(ConnectionState { connected: true });
        let (health_tx, health_rx) =
            watch::channel(VehicleHealth { global_position_ok: true, home_position_ok: true });
        let (state_tx, state_rx) = watch::channel(VehicleState::default());
        let (status_tx, _) = broadcast::channel(8);
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            conn_tx,
            conn_rx,
            _health_tx: health_tx,
            health_rx,
            state_tx,
            state_rx,
            status_tx,
            reject_arm: false,
            reject_start: false,
            reject_stop: false,
            drop_link_after: None,
            disarm_after: None,
            cancel_after: None,
        }
    }

    pub fn call_log(&self) -> Arc<Mutex<Vec<Call>>> {
        self.calls.clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn setpoints_sent(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, Call::SetPosition(_)))
            .count()
    }
}

fn accepted() -> CommandResult {
    CommandResult::from_code(AckCode::Accepted)
}

fn denied() -> CommandResult {
    CommandResult::from_code(AckCode::Denied)
}

impl VehicleLink for StubLink {
    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.conn_rx.clone()
    }

    fn health(&self) -> watch::Receiver<VehicleHealth> {
        self.health_rx.clone()
    }

    fn vehicle_state(&self) -> watch::Receiver<VehicleState> {
        self.state_rx.clone()
    }

    fn status_text(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    async fn arm(&self) -> Result<CommandResult, LinkError> {
        self.record(Call::Arm);
        if self.reject_arm {
            return Ok(denied());
        }
        self.state_tx.send_modify(|s| s.armed = true);
        Ok(accepted())
    }

    async fn disarm(&self) -> Result<CommandResult, LinkError> {
        self.record(Call::Disarm);
        self.state_tx.send_modify(|s| s.armed = false);
        Ok(accepted())
    }

    async fn set_position_ned(&self, sp: PositionNedYaw) -> Result<(), LinkError> {
        self.record(Call::SetPosition(sp));
        let n = self.setpoints_sent();
        if self.drop_link_after == Some(n) {
            self.conn_tx.send_modify(|c| c.connected = false);
        }
        if self.disarm_after == Some(n) {
            self.state_tx.send_modify(|s| s.armed = false);
        }
        if let Some((after, tx)) = &self.cancel_after {
            if n == *after {
                let _ = tx.send(true);
            }
        }
        Ok(())
    }

    async fn start_offboard(&self) -> Result<CommandResult, LinkError> {
        self.record(Call::StartOffboard);
        if self.reject_start {
            return Ok(denied());
        }
        self.state_tx.send_modify(|s| s.mode = VehicleMode::Offboard);
        Ok(accepted())
    }

    async fn stop_offboard(&self) -> Result<CommandResult, LinkError> {
        self.record(Call::StopOffboard);
        if self.reject_stop {
            return Ok(denied());
        }
        self.state_tx.send_modify(|s| s.mode = VehicleMode::Auto);
        Ok(accepted())
    }
}
