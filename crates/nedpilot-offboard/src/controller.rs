use std::future::Future;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use nedpilot_geo::NedVector;
use nedpilot_link::{
    AckCode, ConnectionState, LinkError, PositionNedYaw, VehicleLink, VehicleMode, VehicleState,
};

use crate::{OffboardConfig, YawPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Connecting,
    WaitingEstimate,
    Arming,
    Priming,
    StartingOffboard,
    Streaming,
    Settling,
    Stopping,
    Stopped,
    AbortedDisarm,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("vehicle link unavailable: {0}")]
    LinkUnavailable(&'static str),
    #[error("arm rejected ({code:?})")]
    ArmRejected { code: AckCode },
    #[error("offboard start rejected ({code:?})")]
    OffboardStartRejected { code: AckCode },
    #[error("offboard stop rejected ({code:?})")]
    OffboardStopRejected { code: AckCode },
    #[error("vehicle disarmed unexpectedly after {sent} setpoints")]
    UnexpectedDisarm { sent: usize },
    #[error("vehicle link lost after {sent} setpoints")]
    UnexpectedDisconnect { sent: usize },
    #[error("vehicle left offboard mode after {sent} setpoints")]
    OffboardModeLost { sent: usize },
    #[error("run cancelled")]
    Cancelled,
    #[error(transparent)]
    Link(#[from] LinkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Trajectory setpoints streamed, not counting the primer.
    pub sent: usize,
    pub phase_reached: RunPhase,
}

/// Drives one trajectory through the offboard protocol.
///
/// The controller is the only party issuing state-changing commands on the
/// link. It observes vehicle state through the link's watch channels and
/// never writes it; each command merely requests a future transition.
pub struct OffboardController<L: VehicleLink> {
    link: L,
    cfg: OffboardConfig,
    yaw: YawPolicy,
    cancel: watch::Receiver<bool>,
    phase: RunPhase,
}

enum Waited<T> {
    Value(T),
    TimedOut,
    Cancelled,
}

/// Resolves when the cancel flag is raised; never resolves once the handle
/// is gone (the run can no longer be cancelled).
async fn cancel_raised(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn with_cancel<T>(
    cancel: &mut watch::Receiver<bool>,
    fut: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        _ = cancel_raised(cancel) => None,
        v = fut => Some(v),
    }
}

async fn race<T>(
    cancel: &mut watch::Receiver<bool>,
    limit: Option<std::time::Duration>,
    fut: impl Future<Output = T>,
) -> Waited<T> {
    tokio::select! {
        _ = cancel_raised(cancel) => Waited::Cancelled,
        out = async {
            match limit {
                Some(d) => tokio::time::timeout(d, fut).await.ok(),
                None => Some(fut.await),
            }
        } => match out {
            Some(v) => Waited::Value(v),
            None => Waited::TimedOut,
        },
    }
}

fn stream_guard(
    conn: &watch::Receiver<ConnectionState>,
    state: &watch::Receiver<VehicleState>,
    sent: usize,
) -> Result<(), RunError> {
    if !conn.borrow().connected {
        return Err(RunError::UnexpectedDisconnect { sent });
    }
    let st = *state.borrow();
    if !st.armed {
        return Err(RunError::UnexpectedDisarm { sent });
    }
    if st.mode != VehicleMode::Offboard {
        return Err(RunError::OffboardModeLost { sent });
    }
    Ok(())
}

impl<L: VehicleLink> OffboardController<L> {
    pub fn new(link: L, cfg: OffboardConfig, yaw: YawPolicy, cancel: watch::Receiver<bool>) -> Self {
        Self { link, cfg, yaw, cancel, phase: RunPhase::Idle }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Runs the full connect/arm/prime/offboard/stream/stop sequence.
    ///
    /// Setpoints go out strictly in trajectory order with the configured
    /// pacing between them. No command is reissued automatically; any
    /// rejection or mid-stream state loss aborts with a best-effort disarm.
    pub async fn run(&mut self, trajectory: &[NedVector]) -> Result<RunReport, RunError> {
        if trajectory.is_empty() {
            info!("empty trajectory, nothing to fly");
            return Ok(RunReport { sent: 0, phase_reached: self.phase });
        }

        let mut cancel = self.cancel.clone();
        let mut conn = self.link.connection();
        let mut health = self.link.health();
        let mut state = self.link.vehicle_state();

        self.enter(RunPhase::Connecting);
        match race(&mut cancel, self.cfg.connect_timeout(), conn.wait_for(|c| c.connected)).await {
            Waited::Value(Ok(_)) => info!("vehicle connected"),
            Waited::Value(Err(_)) => return Err(LinkError::Closed.into()),
            Waited::TimedOut => {
                return Err(RunError::LinkUnavailable("no heartbeat within connect timeout"))
            }
            Waited::Cancelled => return self.abort_cancelled(false).await,
        }

        self.enter(RunPhase::WaitingEstimate);
        match race(&mut cancel, self.cfg.estimate_timeout(), health.wait_for(|h| h.ready())).await {
            Waited::Value(Ok(_)) => info!("global position estimate ok"),
            Waited::Value(Err(_)) => return Err(LinkError::Closed.into()),
            Waited::TimedOut => {
                return Err(RunError::LinkUnavailable("position estimate not ready in time"))
            }
            Waited::Cancelled => return self.abort_cancelled(false).await,
        }

        self.enter(RunPhase::Arming);
        let res = match with_cancel(&mut cancel, self.link.arm()).await {
            None => return self.abort_cancelled(false).await,
            Some(Err(e)) => {
                self.try_disarm("link error while arming").await;
                return Err(e.into());
            }
            Some(Ok(r)) => r,
        };
        if !res.accepted {
            self.enter(RunPhase::AbortedDisarm);
            self.try_disarm("arm rejected").await;
            return Err(RunError::ArmRejected { code: res.code });
        }
        info!("vehicle armed");

        // Offboard activation requires a valid setpoint on the wire first.
        self.enter(RunPhase::Priming);
        if let Err(e) = self.link.set_position_ned(PositionNedYaw::zero()).await {
            self.enter(RunPhase::AbortedDisarm);
            self.try_disarm("link error while priming").await;
            return Err(e.into());
        }

        self.enter(RunPhase::StartingOffboard);
        let res = match with_cancel(&mut cancel, self.link.start_offboard()).await {
            None => return self.abort_cancelled(false).await,
            Some(Err(e)) => {
                self.enter(RunPhase::AbortedDisarm);
                self.try_disarm("link error starting offboard").await;
                return Err(e.into());
            }
            Some(Ok(r)) => r,
        };
        if !res.accepted {
            error!(code = ?res.code, "offboard start rejected");
            self.enter(RunPhase::AbortedDisarm);
            self.try_disarm("offboard start rejected").await;
            return Err(RunError::OffboardStartRejected { code: res.code });
        }

        // The heartbeat is what proves the mode switch; wait for it so
        // setpoints only ever flow while the vehicle is in offboard mode.
        let confirm = Some(self.cfg.mode_confirm_timeout());
        match race(&mut cancel, confirm, state.wait_for(|s| s.mode == VehicleMode::Offboard)).await
        {
            Waited::Value(Ok(_)) => info!("offboard active"),
            Waited::Value(Err(_)) => return Err(LinkError::Closed.into()),
            Waited::TimedOut => {
                self.enter(RunPhase::AbortedDisarm);
                self.try_disarm("offboard mode never confirmed").await;
                return Err(RunError::OffboardModeLost { sent: 0 });
            }
            Waited::Cancelled => return self.abort_cancelled(true).await,
        }

        self.enter(RunPhase::Streaming);
        let interval = self.cfg.setpoint_interval();
        let mut sent = 0usize;
        for v in trajectory {
            if let Err(e) = stream_guard(&conn, &state, sent) {
                warn!("{e}");
                self.enter(RunPhase::AbortedDisarm);
                self.try_disarm("stream guard tripped").await;
                return Err(e);
            }
            let sp = self.setpoint(v);
            info!(
                north = sp.north_m,
                east = sp.east_m,
                down = sp.down_m,
                yaw = sp.yaw_deg,
                "setpoint"
            );
            if let Err(e) = self.link.set_position_ned(sp).await {
                self.enter(RunPhase::AbortedDisarm);
                self.try_disarm("link error mid-stream").await;
                return Err(e.into());
            }
            sent += 1;
            if with_cancel(&mut cancel, sleep(interval)).await.is_none() {
                return self.abort_cancelled(true).await;
            }
        }

        self.enter(RunPhase::Settling);
        if with_cancel(&mut cancel, sleep(self.cfg.settle())).await.is_none() {
            return self.abort_cancelled(true).await;
        }

        self.enter(RunPhase::Stopping);
        let res = self.link.stop_offboard().await?;
        if !res.accepted {
            // Teardown rejection is surfaced without further corrective
            // action; the vehicle keeps its current mode.
            warn!(code = ?res.code, "offboard stop rejected");
            return Err(RunError::OffboardStopRejected { code: res.code });
        }

        self.enter(RunPhase::Stopped);
        info!(sent, "trajectory complete");
        Ok(RunReport { sent, phase_reached: self.phase })
    }

    fn enter(&mut self, phase: RunPhase) {
        self.phase = phase;
        info!(phase = ?phase, "offboard controller");
    }

    fn setpoint(&self, v: &NedVector) -> PositionNedYaw {
        let yaw_deg = match self.yaw {
            YawPolicy::Fixed(deg) => deg,
            YawPolicy::FaceTravel => {
                if v.north_m == 0.0 && v.east_m == 0.0 {
                    0.0
                } else {
                    let mut deg = v.east_m.atan2(v.north_m).to_degrees();
                    if deg < 0.0 {
                        deg += 360.0;
                    }
                    deg as f32
                }
            }
        };
        PositionNedYaw::new(v.north_m as f32, v.east_m as f32, v.down_m as f32, yaw_deg)
    }

    /// Best-effort wind-down after cancellation: leave offboard if it was
    /// active, then disarm.
    async fn abort_cancelled(&mut self, offboard_active: bool) -> Result<RunReport, RunError> {
        self.enter(RunPhase::AbortedDisarm);
        if offboard_active {
            match self.link.stop_offboard().await {
                Ok(r) if r.accepted => info!("offboard stopped"),
                Ok(r) => warn!(code = ?r.code, "offboard stop rejected during cancel"),
                Err(e) => warn!("offboard stop failed during cancel: {e}"),
            }
        }
        self.try_disarm("run cancelled").await;
        Err(RunError::Cancelled)
    }

    async fn try_disarm(&self, why: &str) {
        warn!("attempting disarm: {why}");
        match self.link.disarm().await {
            Ok(r) if r.accepted => info!("vehicle disarmed"),
            Ok(r) => warn!(code = ?r.code, "disarm rejected"),
            Err(e) => warn!("disarm failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Call, StubLink};

    fn vectors(n: usize) -> Vec<NedVector> {
        (1..=n)
            .map(|i| NedVector { north_m: i as f64, east_m: 0.0, down_m: 0.0 })
            .collect()
    }

    fn quick_cfg() -> OffboardConfig {
        OffboardConfig {
            setpoint_interval_ms: Some(0),
            settle_s: Some(0),
            mode_confirm_s: Some(1),
            ..Default::default()
        }
    }

    fn controller(link: StubLink) -> (OffboardController<StubLink>, watch::Sender<bool>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (OffboardController::new(link, quick_cfg(), YawPolicy::default(), cancel_rx), cancel_tx)
    }

    #[tokio::test]
    async fn empty_trajectory_is_a_no_op() {
        let link = StubLink::new();
        let calls = link.call_log();
        let (mut ctl, _cancel) = controller(link);
        let report = ctl.run(&[]).await.unwrap();
        assert_eq!(report.sent, 0);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn streams_every_vector_in_order() {
        let link = StubLink::new();
        let calls = link.call_log();
        let (mut ctl, _cancel) = controller(link);
        let report = ctl.run(&vectors(3)).await.unwrap();
        assert_eq!(report.sent, 3);
        assert_eq!(report.phase_reached, RunPhase::Stopped);
        assert_eq!(ctl.phase(), RunPhase::Stopped);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                Call::Arm,
                Call::SetPosition(PositionNedYaw::zero()),
                Call::StartOffboard,
                Call::SetPosition(PositionNedYaw::new(1.0, 0.0, 0.0, 0.0)),
                Call::SetPosition(PositionNedYaw::new(2.0, 0.0, 0.0, 0.0)),
                Call::SetPosition(PositionNedYaw::new(3.0, 0.0, 0.0, 0.0)),
                Call::StopOffboard,
            ]
        );
    }

    #[tokio::test]
    async fn arm_rejection_is_fatal() {
        let mut link = StubLink::new();
        link.reject_arm = true;
        let calls = link.call_log();
        let (mut ctl, _cancel) = controller(link);
        let err = ctl.run(&vectors(2)).await.unwrap_err();
        assert!(matches!(err, RunError::ArmRejected { code: AckCode::Denied }));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Disarm)).count(), 1);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::SetPosition(_))).count(), 0);
    }

    #[tokio::test]
    async fn rejected_offboard_start_disarms_without_streaming() {
        let mut link = StubLink::new();
        link.reject_start = true;
        let calls = link.call_log();
        let (mut ctl, _cancel) = controller(link);
        let err = ctl.run(&vectors(3)).await.unwrap_err();
        assert!(matches!(err, RunError::OffboardStartRejected { .. }));
        assert_eq!(ctl.phase(), RunPhase::AbortedDisarm);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Disarm)).count(), 1);
        // Only the primer went out.
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::SetPosition(_))).count(), 1);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::StopOffboard)).count(), 0);
    }

    #[tokio::test]
    async fn disconnect_mid_stream_halts_and_disarms() {
        let mut link = StubLink::new();
        // Primer plus the first trajectory setpoint, then the link dies.
        link.drop_link_after = Some(2);
        let calls = link.call_log();
        let (mut ctl, _cancel) = controller(link);
        let err = ctl.run(&vectors(3)).await.unwrap_err();
        assert!(matches!(err, RunError::UnexpectedDisconnect { sent: 1 }));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::SetPosition(_))).count(), 2);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Disarm)).count(), 1);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::StopOffboard)).count(), 0);
    }

    #[tokio::test]
    async fn disarm_mid_stream_halts() {
        let mut link = StubLink::new();
        link.disarm_after = Some(2);
        let calls = link.call_log();
        let (mut ctl, _cancel) = controller(link);
        let err = ctl.run(&vectors(3)).await.unwrap_err();
        assert!(matches!(err, RunError::UnexpectedDisarm { sent: 1 }));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::SetPosition(_))).count(), 2);
    }

    #[tokio::test]
    async fn stop_rejection_is_surfaced_without_disarm() {
        let mut link = StubLink::new();
        link.reject_stop = true;
        let calls = link.call_log();
        let (mut ctl, _cancel) = controller(link);
        let err = ctl.run(&vectors(1)).await.unwrap_err();
        assert!(matches!(err, RunError::OffboardStopRejected { .. }));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Disarm)).count(), 0);
    }

    #[tokio::test]
    async fn cancellation_mid_stream_attempts_stop_and_disarm() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut link = StubLink::new();
        link.cancel_after = Some((2, cancel_tx));
        let calls = link.call_log();
        let cfg = OffboardConfig {
            // Pacing long enough that the raised flag wins the select.
            setpoint_interval_ms: Some(5_000),
            settle_s: Some(0),
            mode_confirm_s: Some(1),
            ..Default::default()
        };
        let mut ctl = OffboardController::new(link, cfg, YawPolicy::default(), cancel_rx);
        let err = ctl.run(&vectors(3)).await.unwrap_err();
        assert!(matches!(err, RunError::Cancelled));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::SetPosition(_))).count(), 2);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::StopOffboard)).count(), 1);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Disarm)).count(), 1);
    }

    #[tokio::test]
    async fn face_travel_yaw_follows_the_step() {
        let link = StubLink::new();
        let calls = link.call_log();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        drop(cancel_tx);
        let mut ctl =
            OffboardController::new(link, quick_cfg(), YawPolicy::FaceTravel, cancel_rx);
        let east = NedVector { north_m: 0.0, east_m: 4.0, down_m: 0.0 };
        ctl.run(&[east]).await.unwrap();
        let calls = calls.lock().unwrap();
        let yaws: Vec<f32> = calls
            .iter()
            .filter_map(|c| match c {
                Call::SetPosition(sp) => Some(sp.yaw_deg),
                _ => None,
            })
            .collect();
        // Primer stays at zero yaw; the eastward step faces 90 degrees.
        assert_eq!(yaws, vec![0.0, 90.0]);
    }
}
