//! HomeManager: the bridged device.
//!
//! Owns the sub-device topic bindings, the last known state of each
//! sub-device and the statistics of what happened to inbound commands.
//!
//! A switch may also carry a lockout: a second command topic that disables
//! it. A disabled switch is turned off and ignores on/off commands until it
//! is enabled again.
//!
//! The binding table is fixed at construction and only read afterwards, so
//! topic lookups take no lock. State and statistics sit behind one mutex:
//! writes come from the transport's receive thread, reads may come from any
//! thread.

mod schema;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::transport::Transport;
use crate::{validate_topic, BridgeError, DeviceId, QosLevel};

pub use schema::{SubDeviceKind, SubDeviceValue};

/// A sub-device and the topics it lives on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicBinding {
    pub name: String,
    pub kind: SubDeviceKind,
    pub command_topic: String,
    pub state_topic: Option<String>,
    pub lockout: Option<LockoutTopics>,
}

/// Topics of a switch lockout. `ON` on the command topic disables the
/// switch, `OFF` enables it; the confirmed setting goes to the state topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockoutTopics {
    pub command_topic: String,
    pub state_topic: String,
}

impl LockoutTopics {
    /// `<base>/disable/set` and `<base>/disable`.
    pub fn under(base: &str) -> Self {
        Self {
            command_topic: format!("{}/disable/set", base),
            state_topic: format!("{}/disable", base),
        }
    }
}

impl TopicBinding {
    pub fn reading(name: impl Into<String>, command_topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SubDeviceKind::Reading,
            command_topic: command_topic.into(),
            state_topic: None,
            lockout: None,
        }
    }

    pub fn switch(
        name: impl Into<String>,
        command_topic: impl Into<String>,
        state_topic: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: SubDeviceKind::Switch,
            command_topic: command_topic.into(),
            state_topic: Some(state_topic.into()),
            lockout: None,
        }
    }

    pub fn with_lockout(mut self, lockout: LockoutTopics) -> Self {
        self.lockout = Some(lockout);
        self
    }

    /// Topics the bridge subscribes for this sub-device.
    pub fn inbound_topics(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.command_topic.as_str())
            .chain(self.lockout.as_ref().map(|l| l.command_topic.as_str()))
    }
}

/// Bindings used when the configuration names none.
pub fn default_bindings(device_id: &DeviceId) -> Vec<TopicBinding> {
    vec![
        TopicBinding::reading("WR_PSS", format!("home/{}/WR_PSS/cmd", device_id)),
        TopicBinding::switch(
            "TUV",
            format!("home/{}/TUV/cmd", device_id),
            format!("home/{}/TUV/state", device_id),
        ),
    ]
}

/// Check the routing invariants of a binding table.
///
/// - names and command topics are unique
/// - no state topic is also a command topic
/// - topics carry no wildcards
/// - acknowledging sub-devices have a state topic
/// - only switches have a lockout
///
/// Lockout command topics count as command topics.
pub fn validate_bindings(bindings: &[TopicBinding]) -> Result<(), BridgeError> {
    if bindings.is_empty() {
        return Err(BridgeError::Config(
            "at least one sub-device must be configured".into(),
        ));
    }

    let mut names = HashSet::new();
    let mut commands = HashSet::new();
    for binding in bindings {
        if binding.name.trim().is_empty() {
            return Err(BridgeError::Config("sub-device name must not be empty".into()));
        }
        if !names.insert(binding.name.as_str()) {
            return Err(BridgeError::Config(format!(
                "duplicate sub-device '{}'",
                binding.name
            )));
        }
        for topic in binding.inbound_topics() {
            validate_topic(topic)?;
            if !commands.insert(topic) {
                return Err(BridgeError::Config(format!(
                    "command topic '{}' is bound more than once",
                    topic
                )));
            }
        }
        if let Some(lockout) = &binding.lockout {
            if binding.kind != SubDeviceKind::Switch {
                return Err(BridgeError::Config(format!(
                    "{} sub-device '{}' cannot have a lockout",
                    binding.kind, binding.name
                )));
            }
            validate_topic(&lockout.state_topic)?;
        }
        match &binding.state_topic {
            Some(state) => validate_topic(state)?,
            None if binding.kind.requires_ack() => {
                return Err(BridgeError::Config(format!(
                    "{} sub-device '{}' needs a state topic",
                    binding.kind, binding.name
                )))
            }
            None => {}
        }
    }

    for binding in bindings {
        let states = binding
            .state_topic
            .iter()
            .chain(binding.lockout.as_ref().map(|l| &l.state_topic));
        for state in states {
            if commands.contains(state.as_str()) {
                return Err(BridgeError::Config(format!(
                    "state topic '{}' of '{}' is also a command topic",
                    state, binding.name
                )));
            }
        }
    }
    Ok(())
}

/// Last known value of a sub-device.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubDeviceState {
    pub value: Option<SubDeviceValue>,
    /// Number of accepted updates since startup.
    pub updates: u64,
    /// Set through the lockout topic; on/off commands are ignored meanwhile.
    pub disabled: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub commands_applied: u64,
    pub malformed_payloads: u64,
    pub unrouted_messages: u64,
    pub states_published: u64,
    pub publish_failures: u64,
    /// Commands ignored because their switch was disabled.
    pub commands_locked: u64,
}

/// Result of dispatching one inbound command.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CommandOutcome {
    Applied {
        value: SubDeviceValue,
        /// Whether an acknowledgement was queued on the state topic.
        published: bool,
    },
    Malformed,
    /// The switch is disabled; the command was ignored.
    Locked,
    UnknownSubDevice,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Inbound {
    Command,
    Lockout,
}

#[derive(Default)]
struct DeviceInner {
    states: HashMap<String, SubDeviceState>,
    stats: DeviceStats,
}

pub struct HomeManager {
    device_id: DeviceId,
    transport: Arc<dyn Transport>,
    qos: QosLevel,
    bindings: BTreeMap<String, TopicBinding>,
    routes: HashMap<String, (String, Inbound)>,
    inner: Mutex<DeviceInner>,
}

impl HomeManager {
    /// Validate the bindings and subscribe to every command topic.
    ///
    /// A rejected subscription fails construction. Subscriptions that went
    /// through before the failure are left in place; the instance must not be
    /// used.
    pub fn new(
        device_id: DeviceId,
        transport: Arc<dyn Transport>,
        qos: QosLevel,
        bindings: Vec<TopicBinding>,
    ) -> Result<Self, BridgeError> {
        validate_bindings(&bindings)?;

        let mut routes = HashMap::new();
        for b in &bindings {
            routes.insert(b.command_topic.clone(), (b.name.clone(), Inbound::Command));
            if let Some(lockout) = &b.lockout {
                routes.insert(
                    lockout.command_topic.clone(),
                    (b.name.clone(), Inbound::Lockout),
                );
            }
        }
        let states = bindings
            .iter()
            .map(|b| (b.name.clone(), SubDeviceState::default()))
            .collect();
        let bindings = bindings.into_iter().map(|b| (b.name.clone(), b)).collect();

        let device = Self {
            device_id,
            transport,
            qos,
            bindings,
            routes,
            inner: Mutex::new(DeviceInner {
                states,
                stats: DeviceStats::default(),
            }),
        };
        device.subscribe_all()?;
        Ok(device)
    }

    fn lock(&self) -> MutexGuard<'_, DeviceInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn qos(&self) -> QosLevel {
        self.qos
    }

    pub fn bindings(&self) -> impl Iterator<Item = &TopicBinding> {
        self.bindings.values()
    }

    /// Subscribe every command and lockout topic at the configured QoS.
    pub fn subscribe_all(&self) -> Result<(), BridgeError> {
        for binding in self.bindings.values() {
            for topic in binding.inbound_topics() {
                self.transport
                    .subscribe(topic, self.qos)
                    .map_err(|e| match e {
                        BridgeError::Subscription { .. } => e,
                        other => BridgeError::Subscription {
                            topic: topic.to_string(),
                            reason: other.to_string(),
                        },
                    })?;
                log::info!(
                    "Subscribed {} ({}) to {} at {}",
                    binding.name,
                    binding.kind,
                    topic,
                    self.qos
                );
            }
        }
        Ok(())
    }

    /// Number of topics `subscribe_all` subscribes.
    pub fn subscription_count(&self) -> usize {
        self.routes.len()
    }

    /// Sub-device owning `topic` as its command topic.
    pub fn route(&self, topic: &str) -> Option<&str> {
        match self.routes.get(topic) {
            Some((name, Inbound::Command)) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Switch owning `topic` as its lockout command topic.
    pub fn route_lockout(&self, topic: &str) -> Option<&str> {
        match self.routes.get(topic) {
            Some((name, Inbound::Lockout)) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Parse and apply a command for `sub_device`.
    ///
    /// Never fails: malformed payloads are logged and counted, and leave the
    /// state untouched.
    pub fn handle_command(&self, sub_device: &str, payload: &[u8]) -> CommandOutcome {
        let Some(binding) = self.bindings.get(sub_device) else {
            log::warn!("command for unknown sub-device {}", sub_device);
            return CommandOutcome::UnknownSubDevice;
        };

        let value = match binding.kind.parse(sub_device, payload) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("{}; message dropped", e);
                self.lock().stats.malformed_payloads += 1;
                return CommandOutcome::Malformed;
            }
        };
        {
            let mut inner = self.lock();
            if inner.states.get(sub_device).is_some_and(|s| s.disabled) {
                inner.stats.commands_locked += 1;
                drop(inner);
                log::warn!("{} is disabled, ignoring {}", sub_device, value);
                return CommandOutcome::Locked;
            }
            inner.stats.commands_applied += 1;
        }
        log::debug!("CMD {}={}", sub_device, value);

        if binding.kind.requires_ack() {
            let published = self.publish_state(sub_device, value).is_ok();
            CommandOutcome::Applied { value, published }
        } else {
            self.record(sub_device, value);
            CommandOutcome::Applied {
                value,
                published: false,
            }
        }
    }

    /// Record `value` as the state of `sub_device` and publish it on the
    /// state topic.
    ///
    /// A refused publish is logged and returned; the recorded state is kept.
    pub fn publish_state(&self, sub_device: &str, value: SubDeviceValue) -> Result<(), BridgeError> {
        let binding = self
            .bindings
            .get(sub_device)
            .ok_or_else(|| BridgeError::UnknownSubDevice(sub_device.to_string()))?;
        if value.kind() != binding.kind {
            return Err(BridgeError::MalformedPayload {
                sub_device: sub_device.to_string(),
                reason: format!("{} value for a {} sub-device", value.kind(), binding.kind),
            });
        }
        let topic = binding.state_topic.as_deref().ok_or_else(|| {
            BridgeError::InvalidState(format!("{} has no state topic", sub_device))
        })?;

        self.record(sub_device, value);
        self.send(sub_device, topic, &value.to_payload())
    }

    /// Enable or disable a switch from its lockout topic.
    ///
    /// Disabling a switch that is on turns it off first and publishes `OFF`
    /// on its state topic. The setting is then confirmed on the lockout
    /// state topic. Malformed payloads are counted like other commands.
    pub fn handle_lockout(&self, sub_device: &str, payload: &[u8]) -> CommandOutcome {
        let Some(lockout) = self
            .bindings
            .get(sub_device)
            .and_then(|b| b.lockout.as_ref())
        else {
            log::warn!("lockout for unknown sub-device {}", sub_device);
            return CommandOutcome::UnknownSubDevice;
        };

        let value = match SubDeviceKind::Switch.parse(sub_device, payload) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("{}; lockout message dropped", e);
                self.lock().stats.malformed_payloads += 1;
                return CommandOutcome::Malformed;
            }
        };
        let disable = value == SubDeviceValue::Switch(true);

        let switched_on = {
            let mut inner = self.lock();
            inner.stats.commands_applied += 1;
            let state = inner.states.entry(sub_device.to_string()).or_default();
            state.disabled = disable;
            state.value == Some(SubDeviceValue::Switch(true))
        };
        if disable {
            log::info!("{} disabled", sub_device);
            if switched_on {
                // Failures are counted by publish_state.
                let _ = self.publish_state(sub_device, SubDeviceValue::Switch(false));
            }
        } else {
            log::info!("{} enabled", sub_device);
        }

        let published = self
            .send(sub_device, &lockout.state_topic, &value.to_payload())
            .is_ok();
        CommandOutcome::Applied { value, published }
    }

    fn send(&self, sub_device: &str, topic: &str, payload: &str) -> Result<(), BridgeError> {
        match self
            .transport
            .publish(topic, payload.as_bytes(), self.qos, false)
        {
            Ok(()) => {
                self.lock().stats.states_published += 1;
                log::debug!("STATE {} -> {} on {}", sub_device, payload, topic);
                Ok(())
            }
            Err(e) => {
                self.lock().stats.publish_failures += 1;
                log::error!("state of {} not published: {}", sub_device, e);
                Err(e)
            }
        }
    }

    /// Count a message that matched no command topic.
    pub fn record_unrouted(&self) {
        self.lock().stats.unrouted_messages += 1;
    }

    fn record(&self, sub_device: &str, value: SubDeviceValue) {
        let mut inner = self.lock();
        let state = inner.states.entry(sub_device.to_string()).or_default();
        state.value = Some(value);
        state.updates += 1;
    }

    pub fn state(&self, sub_device: &str) -> Option<SubDeviceState> {
        self.lock().states.get(sub_device).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, SubDeviceState> {
        self.lock()
            .states
            .iter()
            .map(|(name, state)| (name.clone(), state.clone()))
            .collect()
    }

    pub fn stats(&self) -> DeviceStats {
        self.lock().stats
    }
}
