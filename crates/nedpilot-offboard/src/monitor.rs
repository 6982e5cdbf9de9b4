use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use nedpilot_link::{Severity, StatusEvent, VehicleLink};

/// Concurrent observer of vehicle status text and liveness.
///
/// Runs beside the controller on the same link handle, reading only. It
/// never issues commands and never blocks the control task. Cancellation via
/// [`HeartbeatMonitor::stop`] is a normal exit path, not a fault.
pub struct HeartbeatMonitor {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl HeartbeatMonitor {
    pub fn spawn<L: VehicleLink>(link: &L) -> Self {
        let mut status = link.status_text();
        let mut conn = link.connection();
        let mut state = link.vehicle_state();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.wait_for(|c| *c) => break,
                    ev = status.recv() => match ev {
                        Ok(ev) => report(ev),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "status stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    r = conn.changed() => match r {
                        Ok(()) => {
                            let c = *conn.borrow_and_update();
                            info!(connected = c.connected, "link");
                        }
                        Err(_) => break,
                    },
                    r = state.changed() => match r {
                        Ok(()) => {
                            let s = *state.borrow_and_update();
                            info!(armed = s.armed, mode = ?s.mode, "vehicle");
                        }
                        Err(_) => break,
                    },
                }
            }
        });
        Self { cancel: cancel_tx, handle }
    }

    /// Cancels the observer and waits for it to wind down.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        let _ = self.handle.await;
    }
}

fn report(ev: StatusEvent) {
    match ev.severity {
        Severity::Emergency | Severity::Alert | Severity::Critical | Severity::Error => {
            error!(severity = ?ev.severity, "vehicle: {}", ev.text);
        }
        Severity::Warning | Severity::Notice => {
            warn!(severity = ?ev.severity, "vehicle: {}", ev.text);
        }
        Severity::Info | Severity::Debug => {
            info!(severity = ?ev.severity, "vehicle: {}", ev.text);
        }
    }
}
