//! Network transport built on the synchronous `rumqttc` v5 client.
//!
//! `connect` drives the event loop on the calling thread until the broker
//! answers with CONNACK, so a refused or unreachable broker fails fast.
//! Until `loop_start`, `subscribe` keeps driving it until the matching SUBACK
//! arrives, so a refused subscription fails startup and the request queue
//! never fills. Messages that arrive meanwhile are held for the receive
//! thread. `loop_start` then moves the connection to that thread, which
//! delivers callbacks to the registered listener and lets rumqttc reconnect
//! after network errors.
//!
//! Requests are queued with the non-blocking `try_*` client calls: callbacks
//! run on the receive thread, which is also the thread draining the request
//! queue, so a blocking enqueue there could never complete. The queue is
//! sized so a full resubscribe fits; see [`request_capacity_for`].

use rumqttc::v5::mqttbytes::v5::{LastWill, Publish};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, ConnectionError, Event, Incoming, MqttOptions, StateError};
use rumqttc::Outgoing;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{Credentials, MqttEndpoint, Transport, TransportListener};
use crate::{BridgeError, QosLevel};

const KEEP_ALIVE_SECS: u64 = 30;
const REQUEST_CAPACITY: usize = 64;
/// Room for announcements and acks queued next to a full resubscribe.
const REQUEST_HEADROOM: usize = 16;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);

pub const PAYLOAD_ONLINE: &str = "ON";
pub const PAYLOAD_OFFLINE: &str = "OFF";

struct Shared {
    connected: AtomicBool,
    stopping: AtomicBool,
    disconnect_requested: AtomicBool,
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
    availability_topic: Option<String>,
    /// Publishes received while a startup subscribe waited for its SUBACK.
    held: Mutex<Vec<Publish>>,
    /// Topics subscribed from the receive thread, oldest first, awaiting SUBACK.
    in_flight: Mutex<VecDeque<String>>,
}

impl Shared {
    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.read().ok().and_then(|l| l.clone())
    }

    fn next_in_flight(&self) -> Option<String> {
        self.in_flight.lock().ok().and_then(|mut q| q.pop_front())
    }
}

/// Request queue size for a session holding `subscriptions` topics.
///
/// A reconnect resubscribes from the receive thread, which cannot drain the
/// queue until the callback returns, so every topic must fit at once.
pub fn request_capacity_for(subscriptions: usize) -> usize {
    REQUEST_CAPACITY.max(subscriptions + REQUEST_HEADROOM)
}

pub struct MqttTransport {
    client_id: String,
    request_capacity: usize,
    shared: Arc<Shared>,
    client: Mutex<Option<Client>>,
    connection: Mutex<Option<Connection>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// `availability_topic`, when set, carries a retained last will `OFF`
    /// and a retained `ON` after every successful connection.
    pub fn new(client_id: impl Into<String>, availability_topic: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            request_capacity: REQUEST_CAPACITY,
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                disconnect_requested: AtomicBool::new(false),
                listener: RwLock::new(None),
                availability_topic,
                held: Mutex::new(Vec::new()),
                in_flight: Mutex::new(VecDeque::new()),
            }),
            client: Mutex::new(None),
            connection: Mutex::new(None),
            receiver: Mutex::new(None),
        }
    }

    /// Size of the request queue created by the next `connect`.
    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity.max(1);
        self
    }

    pub fn request_capacity(&self) -> usize {
        self.request_capacity
    }

    fn client(&self) -> Result<Client, BridgeError> {
        self.client
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .ok_or_else(|| BridgeError::TransportUnavailable("not connected".into()))
    }

    /// Queue the offline announcement and a DISCONNECT once.
    fn request_disconnect(&self) {
        if self.shared.disconnect_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(client) = self.client() else {
            return;
        };
        if self.shared.connected.load(Ordering::SeqCst) {
            if let Some(topic) = &self.shared.availability_topic {
                if let Err(e) =
                    client.try_publish(topic.clone(), QoS::AtLeastOnce, true, PAYLOAD_OFFLINE)
                {
                    log::debug!("offline announcement not queued: {}", e);
                }
            }
        }
        if let Err(e) = client.try_disconnect() {
            log::debug!("MQTT disconnect not queued: {}", e);
        }
    }
}

impl Transport for MqttTransport {
    fn connect(
        &self,
        endpoint: &MqttEndpoint,
        credentials: Option<&Credentials>,
    ) -> Result<(), BridgeError> {
        if self.is_connected() {
            log::debug!("MQTT already connected to {}", endpoint);
            return Ok(());
        }

        let network = endpoint
            .network_transport()
            .map_err(|e| BridgeError::Config(format!("{:#}", e)))?;
        let mut options =
            MqttOptions::new(self.client_id.clone(), endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
        options.set_clean_start(true);
        if let Some(creds) = credentials {
            options.set_credentials(
                creds.username.clone(),
                creds.password.clone().unwrap_or_default(),
            );
        }
        if let Some(topic) = &self.shared.availability_topic {
            options.set_last_will(LastWill::new(
                topic.clone(),
                PAYLOAD_OFFLINE.as_bytes().to_vec(),
                QoS::AtLeastOnce,
                true,
                None,
            ));
        }
        options.set_transport(network);

        log::info!(
            "Connecting to MQTT broker {}: client_id={} username={} password={}",
            endpoint,
            self.client_id,
            credentials.map(|c| c.username.as_str()).unwrap_or("none"),
            if credentials.and_then(|c| c.password.as_ref()).is_some() {
                "yes"
            } else {
                "no"
            }
        );

        let (client, mut connection) = Client::new(options, self.request_capacity);
        wait_for_connack(&mut connection)?;
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.stopping.store(false, Ordering::SeqCst);
        self.shared.disconnect_requested.store(false, Ordering::SeqCst);
        announce_online(&client, self.shared.availability_topic.as_deref());
        log::info!("MQTT connected to {}", endpoint);

        if let Ok(mut slot) = self.client.lock() {
            *slot = Some(client);
        }
        if let Ok(mut slot) = self.connection.lock() {
            *slot = Some(connection);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), BridgeError> {
        let client = self.client().map_err(|e| BridgeError::Subscription {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        // Still here until loop_start hands it to the receive thread.
        let mut connection = self
            .connection
            .lock()
            .map_err(|_| BridgeError::Subscription {
                topic: topic.to_string(),
                reason: "connection lock poisoned".into(),
            })?;
        let track = connection.is_none();
        if track {
            if let Ok(mut q) = self.shared.in_flight.lock() {
                q.push_back(topic.to_string());
            }
        }
        if let Err(e) = client.try_subscribe(topic.to_string(), to_mqtt_qos(qos)) {
            if track {
                if let Ok(mut q) = self.shared.in_flight.lock() {
                    q.pop_back();
                }
            }
            return Err(BridgeError::Subscription {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        }
        match connection.as_mut() {
            Some(connection) => {
                wait_for_suback(connection, topic, &self.shared)?;
                log::debug!("MQTT subscribed: topic={} {}", topic, qos);
            }
            None => log::debug!("MQTT subscribe queued: topic={} {}", topic, qos),
        }
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), BridgeError> {
        let client = self.client().map_err(|e| BridgeError::Publish {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        client
            .try_publish(topic.to_string(), to_mqtt_qos(qos), retain, payload.to_vec())
            .map_err(|e| BridgeError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn set_listener(&self, listener: Option<Arc<dyn TransportListener>>) {
        if let Ok(mut slot) = self.shared.listener.write() {
            *slot = listener;
        }
    }

    fn loop_start(&self) -> Result<(), BridgeError> {
        let mut receiver = self
            .receiver
            .lock()
            .map_err(|_| BridgeError::TransportUnavailable("receiver lock poisoned".into()))?;
        if receiver.is_some() {
            log::debug!("MQTT receive loop already running");
            return Ok(());
        }
        let connection = self
            .connection
            .lock()
            .ok()
            .and_then(|mut c| c.take())
            .ok_or_else(|| BridgeError::TransportUnavailable("not connected".into()))?;
        let client = self.client()?;
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("mqtt-receive".into())
            .spawn(move || receive_loop(connection, client, shared))
            .map_err(|e| {
                BridgeError::TransportUnavailable(format!("failed to spawn receive thread: {}", e))
            })?;
        *receiver = Some(handle);
        Ok(())
    }

    fn loop_stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        let handle = self.receiver.lock().ok().and_then(|mut r| r.take());
        if let Some(handle) = handle {
            // The receive thread exits once the DISCONNECT has been written.
            self.request_disconnect();
            if handle.join().is_err() {
                log::error!("MQTT receive thread panicked");
            }
            log::debug!("MQTT receive loop stopped");
        }
    }

    fn disconnect(&self) -> Result<(), BridgeError> {
        // A running receive loop must not treat the closed socket as a drop.
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.request_disconnect();
        self.shared.connected.store(false, Ordering::SeqCst);
        let running = self.receiver.lock().map(|r| r.is_some()).unwrap_or(false);
        if !running {
            if let Ok(mut slot) = self.connection.lock() {
                slot.take();
            }
            if let Ok(mut slot) = self.client.lock() {
                slot.take();
            }
        }
        Ok(())
    }
}

fn wait_for_connack(connection: &mut Connection) -> Result<(), BridgeError> {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(BridgeError::TransportUnavailable(e.to_string())),
        }
    }
    Err(BridgeError::TransportUnavailable(
        "connection closed before CONNACK".into(),
    ))
}

/// Drive the event loop until the SUBACK for the one outstanding SUBSCRIBE.
fn wait_for_suback(
    connection: &mut Connection,
    topic: &str,
    shared: &Shared,
) -> Result<(), BridgeError> {
    let failed = |reason: String| BridgeError::Subscription {
        topic: topic.to_string(),
        reason,
    };
    let deadline = Instant::now() + SUBACK_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match connection.recv_timeout(remaining) {
            Ok(Ok(Event::Incoming(Incoming::SubAck(_)))) => return Ok(()),
            Ok(Ok(Event::Incoming(Incoming::Publish(publish)))) => {
                if let Ok(mut held) = shared.held.lock() {
                    held.push(publish);
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                // Either way rumqttc has dropped the session.
                shared.connected.store(false, Ordering::SeqCst);
                return Err(match e {
                    ConnectionError::MqttState(StateError::SubFail { reason }) => {
                        failed(format!("broker refused with {:?}", reason))
                    }
                    other => failed(other.to_string()),
                });
            }
            Err(_) => {
                return Err(failed(format!(
                    "connection closed or no SUBACK within {}s",
                    SUBACK_TIMEOUT.as_secs()
                )))
            }
        }
    }
}

fn announce_online(client: &Client, availability_topic: Option<&str>) {
    if let Some(topic) = availability_topic {
        if let Err(e) = client.try_publish(topic.to_string(), QoS::AtLeastOnce, true, PAYLOAD_ONLINE)
        {
            log::warn!("failed to queue online announcement on {}: {}", topic, e);
        }
    }
}

fn deliver(shared: &Shared, publish: &Publish) {
    let topic = match std::str::from_utf8(&publish.topic) {
        Ok(topic) => topic,
        Err(e) => {
            log::warn!("Skipping publish with invalid topic: {}", e);
            return;
        }
    };
    log::debug!(
        "MQTT received topic={} msg={}",
        topic,
        String::from_utf8_lossy(&publish.payload)
    );
    match shared.listener() {
        Some(listener) => {
            listener.on_message(topic, &publish.payload, from_mqtt_qos(publish.qos))
        }
        None => log::debug!("no listener attached, dropping message on {}", topic),
    }
}

fn receive_loop(mut connection: Connection, client: Client, shared: Arc<Shared>) {
    log::debug!("MQTT receive loop started");
    let held = shared
        .held
        .lock()
        .map(|mut held| std::mem::take(&mut *held))
        .unwrap_or_default();
    for publish in &held {
        deliver(&shared, publish);
    }
    for event in connection.iter() {
        let stopping = shared.stopping.load(Ordering::SeqCst);
        match event {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                if !stopping {
                    deliver(&shared, &publish);
                }
            }
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                if !shared.connected.swap(true, Ordering::SeqCst) {
                    log::info!("MQTT reconnected");
                    // Clean start: nothing queued before the drop is still pending.
                    if let Ok(mut q) = shared.in_flight.lock() {
                        q.clear();
                    }
                    announce_online(&client, shared.availability_topic.as_deref());
                    if let Some(listener) = shared.listener() {
                        listener.on_connect();
                    }
                }
            }
            Ok(Event::Incoming(Incoming::SubAck(_))) => {
                shared.next_in_flight();
            }
            Ok(Event::Incoming(Incoming::Disconnect(disconnect))) => {
                if shared.connected.swap(false, Ordering::SeqCst) {
                    let reason = format!("broker sent DISCONNECT ({:?})", disconnect.reason_code);
                    log::warn!("MQTT {}", reason);
                    if let Some(listener) = shared.listener() {
                        listener.on_disconnect(&reason);
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) if stopping => break,
            Ok(_) => {}
            Err(_) if stopping => break,
            Err(ConnectionError::MqttState(StateError::SubFail { reason })) => {
                // rumqttc drops the session after a refused SUBACK.
                shared.connected.store(false, Ordering::SeqCst);
                let error = BridgeError::Subscription {
                    topic: shared
                        .next_in_flight()
                        .unwrap_or_else(|| "<unknown>".to_string()),
                    reason: format!("broker refused with {:?}", reason),
                };
                log::error!("MQTT {}", error);
                if let Some(listener) = shared.listener() {
                    listener.on_subscription_failed(error);
                }
                std::thread::sleep(RECONNECT_DELAY);
            }
            Err(e) => {
                if shared.connected.swap(false, Ordering::SeqCst) {
                    log::warn!("MQTT connection error: {}. Reconnecting...", e);
                    if let Some(listener) = shared.listener() {
                        listener.on_disconnect(&e.to_string());
                    }
                } else {
                    log::debug!("MQTT reconnect failed: {}", e);
                }
                std::thread::sleep(RECONNECT_DELAY);
            }
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
    log::debug!("MQTT receive loop finished");
}

fn to_mqtt_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_mqtt_qos(qos: QoS) -> QosLevel {
    match qos {
        QoS::AtMostOnce => QosLevel::AtMostOnce,
        QoS::AtLeastOnce => QosLevel::AtLeastOnce,
        QoS::ExactlyOnce => QosLevel::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_mapping_round_trips() {
        for qos in [
            QosLevel::AtMostOnce,
            QosLevel::AtLeastOnce,
            QosLevel::ExactlyOnce,
        ] {
            assert_eq!(from_mqtt_qos(to_mqtt_qos(qos)), qos);
        }
    }

    #[test]
    fn operations_before_connect_fail_cleanly() {
        let transport = MqttTransport::new("dev1", Some("dev1/status".to_string()));
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.subscribe("home/dev1/TUV/cmd", QosLevel::AtLeastOnce),
            Err(BridgeError::Subscription { .. })
        ));
        assert!(matches!(
            transport.publish("home/dev1/TUV/state", b"ON", QosLevel::AtLeastOnce, false),
            Err(BridgeError::Publish { .. })
        ));
        assert!(matches!(
            transport.loop_start(),
            Err(BridgeError::TransportUnavailable(_))
        ));
    }

    #[test]
    fn request_capacity_fits_a_full_resubscribe() {
        assert_eq!(request_capacity_for(2), REQUEST_CAPACITY);
        assert!(request_capacity_for(70) >= 70 + REQUEST_HEADROOM);

        let transport =
            MqttTransport::new("dev1", None).with_request_capacity(request_capacity_for(200));
        assert_eq!(transport.request_capacity(), 200 + REQUEST_HEADROOM);
        assert_eq!(MqttTransport::new("dev1", None).request_capacity(), REQUEST_CAPACITY);
    }

    #[test]
    fn stop_and_disconnect_are_safe_without_a_session() {
        let transport = MqttTransport::new("dev1", None);
        transport.loop_stop();
        assert!(transport.disconnect().is_ok());
        assert!(transport.disconnect().is_ok());
        assert!(!transport.is_connected());
    }
}
