//! homemanager - bridge a HomeManager controller to an MQTT broker.
//!
//! 1. Loads settings (file, then flags/environment)
//! 2. Connects to the broker and announces availability on `<device>/status`
//! 3. Subscribes every sub-device command topic, failing if the broker refuses one
//! 4. Applies commands until SIGINT, SIGTERM or SIGHUP, or a fatal session error

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use homemanager_bridge::transport::mqtt::request_capacity_for;
use homemanager_bridge::transport::MqttTransport;
use homemanager_bridge::{
    logging, App, BridgeConfig, ConfigOverrides, HomeManager, ShutdownToken, SignalHandler,
    Transport,
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Bridge a HomeManager controller to an MQTT broker")]
struct Args {
    /// JSON or TOML config file.
    #[arg(short, long, env = "HOMEMANAGER_CONFIG")]
    config: Option<PathBuf>,

    /// MQTT broker URL (tcp://, mqtt://, mqtts://, ssl:// or host:port).
    #[arg(long, env = "MQTT_BROKER_URL")]
    broker_url: Option<String>,

    /// Device identifier, also used as MQTT client id.
    #[arg(long, env = "HOMEMANAGER_DEVICE_ID")]
    device_id: Option<String>,

    /// MQTT username for authentication.
    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    /// MQTT password for authentication.
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// QoS for subscriptions and state publishes (0, 1 or 2).
    #[arg(long, env = "MQTT_QOS")]
    qos: Option<u8>,

    /// Append log lines to this file.
    #[arg(long, env = "HOMEMANAGER_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace). RUST_LOG takes precedence.
    #[arg(long, env = "HOMEMANAGER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Do not copy log lines to the console.
    #[arg(long, env = "HOMEMANAGER_NO_CONSOLE")]
    no_console: bool,

    /// Path to a PEM-encoded CA certificate to trust for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    tls_ca_path: Option<PathBuf>,

    /// Path to a PEM-encoded client certificate for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_CERT_PATH")]
    tls_client_cert_path: Option<PathBuf>,

    /// Path to a PEM-encoded client private key for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_KEY_PATH")]
    tls_client_key_path: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            broker_url: self.broker_url.clone(),
            device_id: self.device_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            qos: self.qos,
            log_file: self.log_file.clone(),
            log_level: self.log_level.clone(),
            console: self.no_console.then_some(false),
            tls_ca: self.tls_ca_path.clone(),
            tls_client_cert: self.tls_client_cert_path.clone(),
            tls_client_key: self.tls_client_key_path.clone(),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = BridgeConfig::load(args.config.as_deref(), args.overrides())
        .context("invalid configuration")?;
    logging::init(&config.log_level, config.log_file.as_deref(), config.console)?;

    log::info!("*** HomeManager Starting");
    let result = run(&config);
    if let Err(e) = &result {
        log::error!("HomeManager failed: {:#}", e);
    }
    result
}

fn run(config: &BridgeConfig) -> Result<()> {
    let token = ShutdownToken::new();
    SignalHandler::new(token.clone()).install()?;

    let subscriptions = config
        .bindings
        .iter()
        .map(|b| b.inbound_topics().count())
        .sum();
    let transport = Arc::new(
        MqttTransport::new(
            config.device_id.as_str(),
            Some(config.device_id.availability_topic()),
        )
        .with_request_capacity(request_capacity_for(subscriptions)),
    );
    transport
        .connect(&config.endpoint, config.credentials.as_ref())
        .with_context(|| format!("failed to connect to {}", config.endpoint))?;

    let app = match start_bridge(config, &transport, &token) {
        Ok(app) => app,
        Err(e) => {
            if let Err(err) = transport.disconnect() {
                log::warn!("disconnect after failed start: {}", err);
            }
            return Err(e);
        }
    };
    log::info!("HomeManager running as {}", config.device_id);

    token.wait(POLL_INTERVAL, HEARTBEAT_INTERVAL, || {
        let stats = app.device().stats();
        log::info!(
            "alive: session={} applied={} locked={} malformed={} unrouted={} published={} publish_failures={}",
            app.session_state(),
            stats.commands_applied,
            stats.commands_locked,
            stats.malformed_payloads,
            stats.unrouted_messages,
            stats.states_published,
            stats.publish_failures
        );
    });

    log::info!("Stopping device id={}", config.device_id);
    app.stop();
    log::info!("HomeManager stopped.");
    match app.take_failure() {
        Some(e) if e.is_fatal() => Err(e).context("session ended"),
        _ => Ok(()),
    }
}

/// Subscribe the device, register the app, then start receiving.
fn start_bridge(
    config: &BridgeConfig,
    transport: &Arc<MqttTransport>,
    token: &ShutdownToken,
) -> Result<Arc<App>> {
    log::info!("Creating HomeManager device as {}", config.device_id);
    let device = HomeManager::new(
        config.device_id.clone(),
        transport.clone(),
        config.qos,
        config.bindings.clone(),
    )
    .context("failed to subscribe sub-device topics")?;

    let app = App::with_shutdown(transport.clone(), Arc::new(device), token.clone());
    app.start()?;
    if let Err(e) = transport.loop_start() {
        app.stop();
        return Err(e.into());
    }
    Ok(app)
}
