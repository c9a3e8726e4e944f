//! Signaling state machine of one emulated GB28181 device.
//!
//! ```text
//! Idle ──connect──► Connected ──register──► Registered ──invite──► Inviting ──► Steady
//!                                              ▲   │                  │           │
//!                                              │   └─ bye/unregister ─┼───────────┤
//!                                              └──── invite failed ───┘           │
//! any ──close──► Terminating ◄──── heartbeat failed ──────────────────────────────┘
//! ```
//!
//! Every step runs under a sub-scope of the caller's scope bounded by its
//! own timeout, so one overall deadline still bounds a whole scenario. No
//! step retries; a caller that wants another attempt calls again.
//!
//! In steady state a heartbeat thread sends keepalive MESSAGEs and reports
//! each exchange as a [`SessionEvent`]. The owner reacts to events on its
//! own thread, e.g. by sending BYE or stopping the heartbeat.

mod heartbeat;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::error::{GbError, Result, ResultExt};
use crate::protocol::sdp;
use crate::protocol::{Method, SipRequest, SipResponse};
use crate::scope::Scope;
use crate::session::correlator::QUEUE_CAPACITY;
use crate::session::{SipConfig, SipSession};

use heartbeat::Heartbeat;

/// Default keepalive period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Pause between `100 Trying` and `200 OK`, as a real camera would take.
const TRYING_DELAY: Duration = Duration::from_millis(100);

/// RTP clock of GB28181 PS media.
pub const PS_CLOCK_RATE: u64 = 90_000;

/// Dynamic payload type GB28181 platforms expect for PS.
pub const PS_PAYLOAD_TYPE: u8 = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Connected,
    Registered,
    Inviting,
    Steady,
    Terminating,
}

/// Per-step timeouts.
#[derive(Debug, Clone)]
pub struct GbSessionConfig {
    pub reg_timeout: Duration,
    pub invite_timeout: Duration,
}

impl Default for GbSessionConfig {
    fn default() -> Self {
        Self {
            reg_timeout: Duration::from_secs(11),
            invite_timeout: Duration::from_secs(11),
        }
    }
}

/// Media parameters negotiated by the INVITE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GbSessionOutput {
    pub ssrc: u32,
    pub media_port: u16,
    pub clock_rate: u64,
    pub payload_type: u8,
}

impl Default for GbSessionOutput {
    fn default() -> Self {
        Self {
            ssrc: 0,
            media_port: 0,
            clock_rate: PS_CLOCK_RATE,
            payload_type: PS_PAYLOAD_TYPE,
        }
    }
}

/// Progress reported by the heartbeat thread.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A keepalive was answered. `count` starts at 1.
    Heartbeat {
        count: u64,
        request: SipRequest,
        response: SipResponse,
    },
    /// The heartbeat thread exited; `error` is set when it failed.
    HeartbeatStopped { error: Option<String> },
}

type RegisterHook = Box<dyn FnMut(&SipRequest, &SipResponse) -> Result<()> + Send>;
type InviteHook = Box<dyn FnMut(&SipRequest) -> Result<()> + Send>;
type InviteAckHook = Box<dyn FnMut(&SipRequest, &SipRequest) -> Result<()> + Send>;

/// One emulated device: signaling connection, dialog state and heartbeat.
pub struct GbSession {
    config: GbSessionConfig,
    sip_config: SipConfig,
    sip: Option<Arc<SipSession>>,
    out: GbSessionOutput,
    state: Arc<Mutex<DeviceState>>,
    heartbeat_interval: Duration,
    heartbeat_scope: Option<Scope>,
    heartbeat: Option<JoinHandle<()>>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
    on_register_done: Option<RegisterHook>,
    on_invite_request: Option<InviteHook>,
    on_invite_ok_ack: Option<InviteAckHook>,
}

impl GbSession {
    pub fn new(config: GbSessionConfig, sip_config: SipConfig) -> Self {
        // Fix the identity before any copy of the config is taken.
        sip_config.device_id();
        let (events_tx, events_rx) = bounded(QUEUE_CAPACITY);
        GbSession {
            config,
            sip_config,
            sip: None,
            out: GbSessionOutput::default(),
            state: Arc::new(Mutex::new(DeviceState::Idle)),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_scope: None,
            heartbeat: None,
            events_tx,
            events_rx,
            on_register_done: None,
            on_invite_request: None,
            on_invite_ok_ack: None,
        }
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    fn set_state(&self, state: DeviceState) {
        let mut current = self.state.lock();
        tracing::debug!(from = ?*current, to = ?state, "device state");
        *current = state;
    }

    fn expect_state(&self, op: &'static str, allowed: &[DeviceState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(GbError::InvalidState { op, state })
        }
    }

    pub fn sip_config(&self) -> &SipConfig {
        &self.sip_config
    }

    pub fn output(&self) -> &GbSessionOutput {
        &self.out
    }

    /// Applies to heartbeats started after the call.
    pub fn set_heartbeat_interval(&mut self, interval: Duration) {
        self.heartbeat_interval = interval;
    }

    /// Events from the heartbeat thread.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    /// Scope of the running heartbeat; ends when it is stopped or fails.
    pub fn heartbeat_scope(&self) -> Option<&Scope> {
        self.heartbeat_scope.as_ref()
    }

    /// Cancel the heartbeat. The dialog itself stays up.
    pub fn stop_heartbeat(&self) {
        if let Some(scope) = &self.heartbeat_scope {
            scope.cancel();
        }
    }

    /// Called after a successful REGISTER. An error fails the step.
    pub fn on_register_done(
        &mut self,
        hook: impl FnMut(&SipRequest, &SipResponse) -> Result<()> + Send + 'static,
    ) {
        self.on_register_done = Some(Box::new(hook));
    }

    /// Called when an INVITE arrives, before it is answered.
    pub fn on_invite_request(&mut self, hook: impl FnMut(&SipRequest) -> Result<()> + Send + 'static) {
        self.on_invite_request = Some(Box::new(hook));
    }

    /// Called with the INVITE and its ACK once the exchange completed.
    pub fn on_invite_ok_ack(
        &mut self,
        hook: impl FnMut(&SipRequest, &SipRequest) -> Result<()> + Send + 'static,
    ) {
        self.on_invite_ok_ack = Some(Box::new(hook));
    }

    fn sip(&self) -> Result<Arc<SipSession>> {
        self.sip
            .clone()
            .ok_or_else(|| GbError::Transport("session not connected".to_string()))
    }

    /// The signaling session, once connected.
    pub fn sip_session(&self) -> Option<&Arc<SipSession>> {
        self.sip.as_ref()
    }

    pub fn connect(&mut self, scope: &Scope) -> Result<()> {
        self.expect_state("connect", &[DeviceState::Idle])?;
        let sip = SipSession::connect(self.sip_config.clone(), scope).context("connect")?;
        tracing::info!(config = %self.sip_config, "device connected");
        self.sip = Some(Arc::new(sip));
        self.set_state(DeviceState::Connected);
        scope.check()
    }

    /// REGISTER and wait for 200 OK within `reg_timeout`.
    pub fn register(&mut self, scope: &Scope) -> Result<()> {
        self.expect_state(
            "register",
            &[DeviceState::Connected, DeviceState::Registered, DeviceState::Steady],
        )?;
        scope.check()?;
        let sip = self.sip()?;
        let step = scope.with_timeout(self.config.reg_timeout);

        let (req, res) = sip.register(&step).context("register")?;
        tracing::info!(
            request = %req.message_id(),
            response = %res.message_id(),
            "registered"
        );
        if let Some(hook) = self.on_register_done.as_mut() {
            hook(&req, &res).context("callback")?;
        }

        if self.state() == DeviceState::Connected {
            self.set_state(DeviceState::Registered);
        }
        scope.check()
    }

    /// Wait for the platform's INVITE, answer it, read the offer and enter
    /// steady state with a heartbeat.
    pub fn invite(&mut self, scope: &Scope) -> Result<()> {
        self.expect_state("invite", &[DeviceState::Registered])?;
        scope.check()?;
        let sip = self.sip()?;
        let step = scope.with_timeout(self.config.invite_timeout);

        self.set_state(DeviceState::Inviting);
        let accepted = self
            .answer_invite(&sip, &step)
            .and_then(|()| self.start_heartbeat(sip, scope));
        if let Err(e) = accepted {
            self.set_state(DeviceState::Registered);
            return Err(e);
        }
        self.set_state(DeviceState::Steady);
        Ok(())
    }

    fn start_heartbeat(&mut self, sip: Arc<SipSession>, scope: &Scope) -> Result<()> {
        scope.check()?;
        let heartbeat_scope = scope.child();
        let handle = Heartbeat {
            sip,
            scope: heartbeat_scope.clone(),
            interval: self.heartbeat_interval,
            events: self.events_tx.clone(),
            state: self.state.clone(),
        }
        .spawn()?;
        self.heartbeat_scope = Some(heartbeat_scope);
        self.heartbeat = Some(handle);
        Ok(())
    }

    fn answer_invite(&mut self, sip: &SipSession, step: &Scope) -> Result<()> {
        let invite = sip.wait(step, Method::Invite).context("wait")?;
        tracing::info!(
            call_id = invite.call_id().unwrap_or_default(),
            "got INVITE request"
        );
        if let Some(hook) = self.on_invite_request.as_mut() {
            hook(&invite).context("callback")?;
        }

        sip.trying(step, &invite)?;
        step.sleep(TRYING_DELAY)?;
        let ack = sip
            .invite_response(step, &invite)
            .with_context(|| format!("response invite {}", invite.message_id()))?;

        let offer = sdp::parse_offer(&invite.body)?;
        self.out.ssrc = offer.ssrc;
        self.out.media_port = offer.media_port;
        tracing::info!(
            invite = %invite.message_id(),
            ack = %ack.message_id(),
            ssrc = offer.ssrc,
            media_port = offer.media_port,
            "invite accepted"
        );

        if let Some(hook) = self.on_invite_ok_ack.as_mut() {
            hook(&invite, &ack).context("callback")?;
        }
        Ok(())
    }

    pub fn bye(&self, scope: &Scope) -> Result<()> {
        self.expect_state("bye", &[DeviceState::Registered, DeviceState::Steady])?;
        scope.check()?;
        let step = scope.with_timeout(self.config.reg_timeout);
        let (req, res) = self.sip()?.bye(&step).context("bye")?;
        tracing::info!(request = %req.message_id(), response = %res.message_id(), "bye");
        scope.check()
    }

    /// REGISTER with `Expires: 0`.
    pub fn unregister(&self, scope: &Scope) -> Result<()> {
        self.expect_state("unregister", &[DeviceState::Registered, DeviceState::Steady])?;
        scope.check()?;
        let step = scope.with_timeout(self.config.reg_timeout);
        let (req, res) = self.sip()?.unregister(&step).context("UnRegister")?;
        tracing::info!(request = %req.message_id(), response = %res.message_id(), "unregistered");
        scope.check()
    }

    /// Wait for an inbound request of `method`, e.g. a re-INVITE.
    pub fn wait_request(&self, scope: &Scope, method: Method) -> Result<SipRequest> {
        self.sip()?.wait(scope, method)
    }

    /// Stop the heartbeat, close the connection, join the heartbeat thread
    /// and enter `Terminating`. Safe to call more than once.
    pub fn close(&mut self) {
        self.stop_heartbeat();
        if let Some(sip) = &self.sip {
            sip.close();
        }
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.join();
        }
        if self.state() != DeviceState::Terminating {
            self.set_state(DeviceState::Terminating);
        }
    }
}

impl Drop for GbSession {
    fn drop(&mut self) {
        self.close();
    }
}
