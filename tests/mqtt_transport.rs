//! Network transport against a minimal MQTT v5 broker on a loopback socket.
//!
//! The broker answers CONNECT, SUBSCRIBE and PINGREQ with fixed packets,
//! enough to drive rumqttc through a session.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use homemanager_bridge::transport::{parse_mqtt_endpoint, MqttTransport};
use homemanager_bridge::{
    App, BridgeError, DeviceId, HomeManager, QosLevel, SubDeviceValue, TopicBinding, Transport,
};

const GRANTED_QOS1: u8 = 0x01;
const UNSPECIFIED_ERROR: u8 = 0x80;

struct FakeBroker {
    addr: SocketAddr,
    subscribes: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl FakeBroker {
    /// Accept one client. Every SUBACK carries `reason`; `retained` is sent
    /// ahead of the first SUBACK.
    fn spawn(reason: u8, retained: Option<(&'static str, &'static [u8])>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let subscribes = Arc::new(AtomicUsize::new(0));
        let counter = subscribes.clone();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            stream
                .set_read_timeout(Some(Duration::from_secs(20)))
                .expect("timeout");
            serve(&mut stream, reason, retained, &counter);
        });
        Self {
            addr,
            subscribes,
            handle,
        }
    }

    fn endpoint(&self) -> homemanager_bridge::transport::MqttEndpoint {
        parse_mqtt_endpoint(&self.addr.to_string(), false).expect("endpoint")
    }

    fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    fn join(self) {
        self.handle.join().expect("broker thread");
    }
}

fn serve(
    stream: &mut TcpStream,
    reason: u8,
    retained: Option<(&str, &[u8])>,
    subscribes: &AtomicUsize,
) {
    while let Ok((header, body)) = read_packet(stream) {
        let reply = match header >> 4 {
            1 => vec![0x20, 0x03, 0x00, 0x00, 0x00],
            8 => {
                if subscribes.fetch_add(1, Ordering::SeqCst) == 0 {
                    if let Some((topic, payload)) = retained {
                        let _ = stream.write_all(&publish_packet(topic, payload));
                    }
                }
                vec![0x90, 0x04, body[0], body[1], 0x00, reason]
            }
            12 => vec![0xD0, 0x00],
            14 => break,
            _ => continue,
        };
        if stream.write_all(&reply).is_err() {
            break;
        }
    }
}

fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte)?;
    let header = byte[0];
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        stream.read_exact(&mut byte)?;
        len |= ((byte[0] & 0x7f) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok((header, body))
}

/// QoS 0 retained PUBLISH without properties.
fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
    let remaining = 2 + topic.len() + 1 + payload.len();
    let mut packet = vec![0x31, remaining as u8];
    packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    packet.extend_from_slice(topic.as_bytes());
    packet.push(0x00);
    packet.extend_from_slice(payload);
    packet
}

fn connected(broker: &FakeBroker) -> Arc<MqttTransport> {
    let transport = Arc::new(MqttTransport::new("dev1", None));
    transport.connect(&broker.endpoint(), None).expect("connect");
    transport
}

#[test]
fn refused_suback_fails_device_construction() {
    let broker = FakeBroker::spawn(UNSPECIFIED_ERROR, None);
    let transport = connected(&broker);

    let err = HomeManager::new(
        DeviceId::new("dev1").unwrap(),
        transport.clone(),
        QosLevel::ExactlyOnce,
        vec![TopicBinding::reading("WR_PSS", "home/dev1/WR_PSS/cmd")],
    )
    .err()
    .expect("refused subscription");

    assert!(err.is_fatal());
    match err {
        BridgeError::Subscription { topic, reason } => {
            assert_eq!(topic, "home/dev1/WR_PSS/cmd");
            assert!(reason.contains("Unspecified"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!transport.is_connected());

    transport.disconnect().unwrap();
    broker.join();
}

#[test]
fn many_sub_devices_subscribe_past_the_request_queue() {
    let broker = FakeBroker::spawn(GRANTED_QOS1, None);
    let transport = connected(&broker);
    let bindings: Vec<TopicBinding> = (0..70)
        .map(|i| TopicBinding::reading(format!("S{i}"), format!("home/dev1/S{i}/cmd")))
        .collect();

    let device = HomeManager::new(
        DeviceId::new("dev1").unwrap(),
        transport.clone(),
        QosLevel::AtLeastOnce,
        bindings,
    )
    .expect("all subscriptions granted");

    assert_eq!(broker.subscribes(), 70);
    assert_eq!(device.subscription_count(), 70);

    transport.disconnect().unwrap();
    broker.join();
}

#[test]
fn message_received_during_startup_reaches_the_app() {
    let broker = FakeBroker::spawn(GRANTED_QOS1, Some(("home/dev1/WR_PSS/cmd", b"512")));
    let transport = connected(&broker);
    let device = HomeManager::new(
        DeviceId::new("dev1").unwrap(),
        transport.clone(),
        QosLevel::AtLeastOnce,
        vec![TopicBinding::reading("WR_PSS", "home/dev1/WR_PSS/cmd")],
    )
    .expect("device");
    let app = App::new(transport.clone(), Arc::new(device));
    app.start().expect("start");
    transport.loop_start().expect("loop");

    let deadline = Instant::now() + Duration::from_secs(5);
    while app.device().state("WR_PSS").and_then(|s| s.value).is_none() {
        assert!(Instant::now() < deadline, "retained reading never delivered");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(
        app.device().state("WR_PSS").unwrap().value,
        Some(SubDeviceValue::Reading(512.0))
    );

    app.stop();
    broker.join();
}
