use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;

use super::{DeviceState, SessionEvent};
use crate::error::Result;
use crate::scope::Scope;
use crate::session::SipSession;

/// Keepalive loop of a device in steady state.
pub(crate) struct Heartbeat {
    pub sip: Arc<SipSession>,
    pub scope: Scope,
    pub interval: Duration,
    pub events: Sender<SessionEvent>,
    pub state: Arc<Mutex<DeviceState>>,
}

impl Heartbeat {
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("gb-heartbeat".to_string())
            .spawn(move || self.run())?;
        Ok(handle)
    }

    /// Send MESSAGE, wait for its answer, report it, sleep, repeat.
    ///
    /// A failed exchange aborts the heartbeat scope and the signaling
    /// connection; the device leaves steady state.
    fn run(self) {
        tracing::info!(
            device_id = self.sip.device_id(),
            interval_ms = self.interval.as_millis() as u64,
            "heartbeat started"
        );

        let mut count = 0u64;
        while !self.scope.is_done() {
            match self.sip.message(&self.scope) {
                Ok((request, response)) => {
                    count += 1;
                    tracing::debug!(
                        count,
                        request = %request.message_id(),
                        response = %response.message_id(),
                        "heartbeat"
                    );
                    self.emit(SessionEvent::Heartbeat {
                        count,
                        request,
                        response,
                    });
                }
                Err(e) if self.scope.is_done() => {
                    tracing::debug!(error = %e, "heartbeat stopped while waiting");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, count, "heartbeat failed");
                    *self.state.lock() = DeviceState::Terminating;
                    let reason = format!("heartbeat: {e}");
                    self.scope.abort(reason.clone());
                    self.sip.scope().abort(reason);
                    self.emit(SessionEvent::HeartbeatStopped {
                        error: Some(e.to_string()),
                    });
                    return;
                }
            }

            if self.scope.sleep(self.interval).is_err() {
                break;
            }
        }

        tracing::info!(count, "heartbeat stopped");
        self.emit(SessionEvent::HeartbeatStopped { error: None });
    }

    /// Events are advisory; a full or abandoned queue never stalls the loop.
    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => tracing::warn!("session event queue full, drop event"),
        }
    }
}
