//! Session coordinator.
//!
//! `App` owns the session lifecycle and is the listener registered on the
//! transport. Every inbound message goes through `on_message`, which routes
//! it to the device by command topic.
//!
//! A fatal error raised on the receive thread, such as the broker refusing a
//! resubscription, is kept for the main thread and cancels the shutdown
//! token the app was built with.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::{CommandOutcome, HomeManager};
use crate::shutdown::ShutdownToken;
use crate::transport::{Transport, TransportListener};
use crate::{BridgeError, QosLevel};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connecting,
    Connected,
    Running,
    Stopping,
    Stopped,
}

impl SessionState {
    /// States in which inbound commands are applied.
    pub fn accepts_messages(&self) -> bool {
        matches!(self, Self::Connected | Self::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

pub struct App {
    transport: Arc<dyn Transport>,
    device: Arc<HomeManager>,
    state: Mutex<SessionState>,
    shutdown: ShutdownToken,
    failure: Mutex<Option<BridgeError>>,
}

impl App {
    pub fn new(transport: Arc<dyn Transport>, device: Arc<HomeManager>) -> Arc<Self> {
        Self::with_shutdown(transport, device, ShutdownToken::new())
    }

    /// Like `new`, cancelling `shutdown` when the session fails fatally.
    pub fn with_shutdown(
        transport: Arc<dyn Transport>,
        device: Arc<HomeManager>,
        shutdown: ShutdownToken,
    ) -> Arc<Self> {
        let state = if transport.is_connected() {
            SessionState::Connected
        } else {
            SessionState::Created
        };
        Arc::new(Self {
            transport,
            device,
            state: Mutex::new(state),
            shutdown,
            failure: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session_state(&self) -> SessionState {
        *self.lock()
    }

    pub fn device(&self) -> &Arc<HomeManager> {
        &self.device
    }

    /// The fatal error that ended the session, if any. Returned once.
    pub fn take_failure(&self) -> Option<BridgeError> {
        self.failure.lock().ok().and_then(|mut f| f.take())
    }

    fn has_failed(&self) -> bool {
        self.failure.lock().map(|f| f.is_some()).unwrap_or(false)
    }

    fn fail(&self, error: BridgeError) {
        if !error.is_fatal() {
            log::warn!("{}", error);
            return;
        }
        log::error!("Fatal: {}, shutting down", error);
        if let Ok(mut slot) = self.failure.lock() {
            slot.get_or_insert(error);
        }
        self.shutdown.cancel();
    }

    /// Register as the transport's listener and enter `Running`.
    pub fn start(self: &Arc<Self>) -> Result<(), BridgeError> {
        let mut state = self.lock();
        match *state {
            SessionState::Running => {
                log::debug!("App already running");
                return Ok(());
            }
            SessionState::Stopping | SessionState::Stopped => {
                return Err(BridgeError::InvalidState(format!(
                    "cannot start an app that is {}",
                    *state
                )));
            }
            SessionState::Created | SessionState::Connecting | SessionState::Connected => {}
        }
        if !self.transport.is_connected() {
            return Err(BridgeError::TransportUnavailable(
                "transport is not connected".into(),
            ));
        }

        let listener: Arc<dyn TransportListener> = self.clone();
        self.transport.set_listener(Some(listener));
        *state = SessionState::Running;
        log::info!("App started for {}", self.device.device_id());
        Ok(())
    }

    /// Detach from the transport and close the session.
    ///
    /// Safe to call at any time and more than once. Transport failures are
    /// logged, never returned.
    pub fn stop(&self) {
        {
            let mut state = self.lock();
            if matches!(*state, SessionState::Stopping | SessionState::Stopped) {
                log::debug!("App already {}", *state);
                return;
            }
            *state = SessionState::Stopping;
        }

        // Drops the transport's reference to us; an in-flight callback keeps
        // its own clone until loop_stop has joined the receive thread.
        self.transport.set_listener(None);
        self.transport.loop_stop();
        if let Err(e) = self.transport.disconnect() {
            log::warn!("disconnect failed during stop: {}", e);
        }

        *self.lock() = SessionState::Stopped;
        log::info!("App stopped");
    }
}

impl TransportListener for App {
    fn on_connect(&self) {
        {
            let mut state = self.lock();
            match *state {
                SessionState::Connecting | SessionState::Connected | SessionState::Running => {
                    *state = SessionState::Running;
                }
                other => {
                    log::debug!("ignoring reconnect while {}", other);
                    return;
                }
            }
        }
        if self.has_failed() {
            log::debug!("not restoring subscriptions after a fatal error");
            return;
        }
        log::info!("Session re-established, restoring subscriptions");
        if let Err(e) = self.device.subscribe_all() {
            self.fail(e);
        }
    }

    fn on_disconnect(&self, reason: &str) {
        let mut state = self.lock();
        if *state == SessionState::Running {
            *state = SessionState::Connecting;
        }
        log::warn!("Disconnected ({}), session is {}", reason, *state);
    }

    fn on_message(&self, topic: &str, payload: &[u8], qos: QosLevel) {
        let state = self.session_state();
        if !state.accepts_messages() {
            log::info!("Message on {} ignored while {}", topic, state);
            return;
        }

        if let Some(sub_device) = self.device.route_lockout(topic) {
            if let CommandOutcome::Applied { value, .. } =
                self.device.handle_lockout(sub_device, payload)
            {
                log::info!("{} lockout <- {}", sub_device, value);
            }
            return;
        }

        let Some(sub_device) = self.device.route(topic) else {
            self.device.record_unrouted();
            log::warn!(
                "Message not handled: topic={} msg={} {}",
                topic,
                String::from_utf8_lossy(payload),
                qos
            );
            return;
        };

        match self.device.handle_command(sub_device, payload) {
            CommandOutcome::Applied { value, published } => {
                log::info!(
                    "{} <- {} (ack {})",
                    sub_device,
                    value,
                    if published { "sent" } else { "none" }
                );
            }
            CommandOutcome::Malformed | CommandOutcome::Locked => {}
            CommandOutcome::UnknownSubDevice => self.device.record_unrouted(),
        }
    }

    fn on_subscription_failed(&self, error: BridgeError) {
        self.fail(error);
    }
}
