use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mavlink::{
    common::{
        MavAutopilot, MavCmd, MavFrame, MavMessage, MavModeFlag, MavResult, MavSeverity, MavState,
        MavType, PositionTargetTypemask, COMMAND_LONG_DATA, HEARTBEAT_DATA,
        SET_POSITION_TARGET_LOCAL_NED_DATA,
    },
    MavConnection, MavHeader,
};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::link::{LinkError, PositionNedYaw, VehicleLink};
use crate::state::{
    AckCode, CommandResult, ConnectionState, Severity, StatusEvent, VehicleHealth, VehicleMode,
    VehicleState,
};
use crate::LinkConfig;

/// type_mask for SET_POSITION_TARGET_LOCAL_NED: ignore everything except the
/// position fields.
const POSITION_ONLY_TYPE_MASK: u16 = 0b0000_1111_1111_1000;

// PX4 custom-mode words used with MAV_CMD_DO_SET_MODE.
const PX4_MAIN_MODE_OFFBOARD: f32 = 6.0;
const PX4_MAIN_MODE_AUTO: f32 = 4.0;
const PX4_SUB_MODE_AUTO_LOITER: f32 = 3.0;

const CUSTOM_MODE_ENABLED: f32 = 1.0;

#[derive(Debug, Clone, Copy)]
struct AckEvent {
    command: u32,
    code: AckCode,
}

/// A connected MAVLink vehicle.
///
/// Cheap to clone; all clones share one connection. A blocking reader task
/// decodes inbound traffic onto the watch/broadcast channels, and every
/// outbound frame funnels through a single blocking writer task, so command
/// issuance needs no further serialization.
#[derive(Clone)]
pub struct MavLinkSession {
    outbound: mpsc::Sender<MavMessage>,
    conn_rx: watch::Receiver<ConnectionState>,
    health_rx: watch::Receiver<VehicleHealth>,
    state_rx: watch::Receiver<VehicleState>,
    status_tx: broadcast::Sender<StatusEvent>,
    ack_tx: broadcast::Sender<AckEvent>,
    target_sys: u8,
    target_comp: u8,
    ack_timeout: Duration,
}

impl MavLinkSession {
    /// Opens the link and spawns the reader, writer, heartbeat and watchdog
    /// tasks. Returns as soon as the transport is up; use the connection
    /// watch to wait for the first heartbeat.
    pub async fn connect(cfg: &LinkConfig) -> Result<Self, LinkError> {
        if let Some(spec) = cfg.address.strip_prefix("serial:") {
            validate_serial(spec, &cfg.address)?;
        }

        let address = cfg.address.clone();
        let conn = task::spawn_blocking(move || mavlink::connect::<MavMessage>(&address))
            .await
            .map_err(|e| LinkError::Unavailable(format!("connect task failed: {e}")))?
            .map_err(|e| LinkError::Unavailable(format!("mavlink connect {}: {e}", cfg.address)))?;
        let conn: Arc<dyn MavConnection<MavMessage> + Sync + Send> = Arc::from(conn);
        info!("vehicle link open on {}", cfg.address);

        let (conn_tx, conn_rx) = watch::channel(ConnectionState::default());
        let (health_tx, health_rx) = watch::channel(VehicleHealth::default());
        let (state_tx, state_rx) = watch::channel(VehicleState::default());
        let (status_tx, _) = broadcast::channel(64);
        let (ack_tx, _) = broadcast::channel(32);
        let (out_tx, mut out_rx) = mpsc::channel::<MavMessage>(64);
        let last_heartbeat: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

        // Reader: mavlink recv can block, so it lives on a blocking task.
        {
            let conn = conn.clone();
            let status_tx = status_tx.clone();
            let ack_tx = ack_tx.clone();
            let last_heartbeat = last_heartbeat.clone();
            let target_sys = cfg.target_sys;
            task::spawn_blocking(move || {
                reader_loop(
                    conn,
                    target_sys,
                    health_tx,
                    state_tx,
                    status_tx,
                    ack_tx,
                    last_heartbeat,
                );
            });
        }

        // Writer: the only task that touches the send half.
        {
            let conn = conn.clone();
            let sys_id = cfg.sys_id;
            let comp_id = cfg.comp_id;
            task::spawn_blocking(move || {
                let mut hdr = MavHeader { system_id: sys_id, component_id: comp_id, sequence: 0 };
                while let Some(msg) = out_rx.blocking_recv() {
                    hdr.sequence = hdr.sequence.wrapping_add(1);
                    if let Err(e) = conn.send(&hdr, &msg) {
                        warn!("mavlink send failed: {e}");
                    }
                }
            });
        }

        // Heartbeat watchdog: flips the connection watch on staleness.
        {
            let last_heartbeat = last_heartbeat.clone();
            let hb_timeout = cfg.heartbeat_timeout();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(200));
                loop {
                    tick.tick().await;
                    if conn_tx.is_closed() {
                        break;
                    }
                    let alive = last_heartbeat
                        .lock()
                        .unwrap()
                        .map(|t| t.elapsed() < hb_timeout)
                        .unwrap_or(false);
                    let flipped = conn_tx.send_if_modified(|s| {
                        if s.connected != alive {
                            s.connected = alive;
                            true
                        } else {
                            false
                        }
                    });
                    if flipped {
                        info!(connected = alive, "vehicle heartbeat watchdog");
                    }
                }
            });
        }

        // Companion heartbeat at 1 Hz so the autopilot sees us as alive.
        // Keeps the writer running for the life of the process.
        {
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tick.tick().await;
                    if out_tx.send(companion_heartbeat()).await.is_err() {
                        break;
                    }
                }
            });
        }

        Ok(Self {
            outbound: out_tx,
            conn_rx,
            health_rx,
            state_rx,
            status_tx,
            ack_tx,
            target_sys: cfg.target_sys,
            target_comp: cfg.target_comp,
            ack_timeout: cfg.ack_timeout(),
        })
    }

    /// Sends a COMMAND_LONG and waits for the matching COMMAND_ACK.
    async fn command(
        &self,
        name: &'static str,
        command: MavCmd,
        params: [f32; 7],
    ) -> Result<CommandResult, LinkError> {
        // Subscribe before sending so the ack cannot slip past.
        let mut acks = self.ack_tx.subscribe();

        let msg = MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            command,
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        });
        debug!(command = name, "issuing");
        self.outbound.send(msg).await.map_err(|_| LinkError::Closed)?;

        let wanted = command as u32;
        let waited = tokio::time::timeout(self.ack_timeout, async move {
            loop {
                match acks.recv().await {
                    Ok(ev) if ev.command == wanted => break Some(ev.code),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break None,
                }
            }
        })
        .await;

        match waited {
            Ok(Some(code)) => {
                let result = CommandResult::from_code(code);
                if result.accepted {
                    info!(command = name, "accepted");
                } else {
                    warn!(command = name, code = ?code, "rejected by vehicle");
                }
                Ok(result)
            }
            Ok(None) => Err(LinkError::Closed),
            Err(_) => Err(LinkError::AckTimeout {
                command: name,
                timeout_ms: self.ack_timeout.as_millis() as u64,
            }),
        }
    }
}

impl VehicleLink for MavLinkSession {
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
        self.command(
            "arm",
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    async fn disarm(&self) -> Result<CommandResult, LinkError> {
        self.command(
            "disarm",
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    async fn set_position_ned(&self, sp: PositionNedYaw) -> Result<(), LinkError> {
        let msg = MavMessage::SET_POSITION_TARGET_LOCAL_NED(SET_POSITION_TARGET_LOCAL_NED_DATA {
            time_boot_ms: 0,
            target_system: self.target_sys,
            target_component: self.target_comp,
            coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
            type_mask: PositionTargetTypemask::from_bits_truncate(POSITION_ONLY_TYPE_MASK),
            x: sp.north_m,
            y: sp.east_m,
            z: sp.down_m,
            vx: 0.0,
            vy: 0.0,
            vz: 0.0,
            afx: 0.0,
            afy: 0.0,
            afz: 0.0,
            yaw: sp.yaw_deg.to_radians(),
            yaw_rate: 0.0,
        });
        self.outbound.send(msg).await.map_err(|_| LinkError::Closed)
    }

    async fn start_offboard(&self) -> Result<CommandResult, LinkError> {
        self.command(
            "offboard start",
            MavCmd::MAV_CMD_DO_SET_MODE,
            [CUSTOM_MODE_ENABLED, PX4_MAIN_MODE_OFFBOARD, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    /// Leaves offboard by requesting the autopilot's hold mode.
    async fn stop_offboard(&self) -> Result<CommandResult, LinkError> {
        self.command(
            "offboard stop",
            MavCmd::MAV_CMD_DO_SET_MODE,
            [CUSTOM_MODE_ENABLED, PX4_MAIN_MODE_AUTO, PX4_SUB_MODE_AUTO_LOITER, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }
}

fn reader_loop(
    conn: Arc<dyn MavConnection<MavMessage> + Sync + Send>,
    target_sys: u8,
    health_tx: watch::Sender<VehicleHealth>,
    state_tx: watch::Sender<VehicleState>,
    status_tx: broadcast::Sender<StatusEvent>,
    ack_tx: broadcast::Sender<AckEvent>,
    last_heartbeat: Arc<Mutex<Option<Instant>>>,
) {
    loop {
        // Every session handle has gone away; nothing left to publish to.
        if state_tx.is_closed() {
            break;
        }
        match conn.recv() {
            Ok((hdr, msg)) => {
                if hdr.system_id != target_sys {
                    continue;
                }
                handle_inbound(msg, &health_tx, &state_tx, &status_tx, &ack_tx, &last_heartbeat);
            }
            Err(e) => {
                debug!("mavlink recv error: {e}");
                std::thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn handle_inbound(
    msg: MavMessage,
    health_tx: &watch::Sender<VehicleHealth>,
    state_tx: &watch::Sender<VehicleState>,
    status_tx: &broadcast::Sender<StatusEvent>,
    ack_tx: &broadcast::Sender<AckEvent>,
    last_heartbeat: &Mutex<Option<Instant>>,
) {
    match msg {
        MavMessage::HEARTBEAT(hb) => {
            *last_heartbeat.lock().unwrap() = Some(Instant::now());
            let next = VehicleState {
                armed: hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED),
                mode: VehicleMode::from_px4_custom_mode(hb.custom_mode),
            };
            state_tx.send_if_modified(|s| {
                if *s != next {
                    *s = next;
                    true
                } else {
                    false
                }
            });
        }
        MavMessage::GLOBAL_POSITION_INT(_) => {
            health_tx.send_if_modified(|h| {
                if !h.global_position_ok {
                    h.global_position_ok = true;
                    true
                } else {
                    false
                }
            });
        }
        MavMessage::HOME_POSITION(_) => {
            health_tx.send_if_modified(|h| {
                if !h.home_position_ok {
                    h.home_position_ok = true;
                    true
                } else {
                    false
                }
            });
        }
        MavMessage::STATUSTEXT(st) => {
            let _ = status_tx.send(StatusEvent {
                ts: OffsetDateTime::now_utc(),
                severity: severity_from(st.severity),
                text: statustext_text(&st.text),
            });
        }
        MavMessage::COMMAND_ACK(ack) => {
            let _ = ack_tx.send(AckEvent {
                command: ack.command as u32,
                code: ack_code_from(ack.result),
            });
        }
        _ => {}
    }
}

fn statustext_text(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn severity_from(severity: MavSeverity) -> Severity {
    match severity {
        MavSeverity::MAV_SEVERITY_EMERGENCY => Severity::Emergency,
        MavSeverity::MAV_SEVERITY_ALERT => Severity::Alert,
        MavSeverity::MAV_SEVERITY_CRITICAL => Severity::Critical,
        MavSeverity::MAV_SEVERITY_ERROR => Severity::Error,
        MavSeverity::MAV_SEVERITY_WARNING => Severity::Warning,
        MavSeverity::MAV_SEVERITY_NOTICE => Severity::Notice,
        MavSeverity::MAV_SEVERITY_INFO => Severity::Info,
        MavSeverity::MAV_SEVERITY_DEBUG => Severity::Debug,
    }
}

fn ack_code_from(result: MavResult) -> AckCode {
    match result {
        MavResult::MAV_RESULT_ACCEPTED => AckCode::Accepted,
        MavResult::MAV_RESULT_TEMPORARILY_REJECTED => AckCode::TemporarilyRejected,
        MavResult::MAV_RESULT_DENIED => AckCode::Denied,
        MavResult::MAV_RESULT_UNSUPPORTED => AckCode::Unsupported,
        MavResult::MAV_RESULT_FAILED => AckCode::Failed,
        MavResult::MAV_RESULT_IN_PROGRESS => AckCode::InProgress,
        MavResult::MAV_RESULT_CANCELLED => AckCode::Cancelled,
        #[allow(unreachable_patterns)]
        _ => AckCode::Failed,
    }
}

fn companion_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

fn validate_serial(spec: &str, address: &str) -> Result<(), LinkError> {
    let (dev, baud) = spec
        .rsplit_once(':')
        .ok_or_else(|| LinkError::Unavailable(format!("malformed serial address {address}")))?;
    let baud: u32 = baud
        .parse()
        .map_err(|_| LinkError::Unavailable(format!("bad baud rate in {address}")))?;
    // quick validate device before handing the address to mavlink
    let _ = tokio_serial::new(dev, baud)
        .open_native_async()
        .map_err(|e| LinkError::Unavailable(format!("open serial device {dev}: {e}")))?;
    Ok(())
}
