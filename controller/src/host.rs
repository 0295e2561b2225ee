use std::{
    collections::VecDeque,
    io::ErrorKind,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{Client, ConnectReturnCode, Connection, Event, Incoming, MqttOptions, QoS};
use tracing::{debug, info, warn};

use fridge_common::{
    ControlLoop, InboundMessage, MessageBus, MonotonicClock, Publish, RelayOutput,
    RuntimeConfig, TemperatureSensor, Transport,
};

const AMBIENT_C: f32 = 21.0;
const INITIAL_CABINET_C: f32 = 9.0;
// Fraction of the gap to ambient closed per second with the compressor off.
const WARMING_RATE: f32 = 0.002;
const COOLING_C_PER_SEC: f32 = 0.01;

const MQTT_CAPACITY: usize = 32;
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(15);
const CONNACK_WAIT: Duration = Duration::from_secs(1);
const CONNACK_POLLS: u32 = 3;
const RECEIVE_WAIT: Duration = Duration::from_millis(5);
const MAX_EVENTS_PER_RECEIVE: usize = 64;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    let fridge = Arc::new(Mutex::new(FridgeModel::new()));
    let mut control = ControlLoop::new(
        &runtime,
        MonotonicClock::new(),
        SimulatedSensor {
            fridge: fridge.clone(),
        },
        SimulatedRelay { fridge },
        HostNetwork,
        BrokerSession::new(&runtime),
    );

    info!(
        "fridge controller simulation started (broker {}:{}, setpoint topic `{}`)",
        runtime.network.mqtt_host, runtime.network.mqtt_port, runtime.topics.setpoint_topic
    );

    let running = Arc::new(AtomicBool::new(true));
    let worker = {
        let running = running.clone();
        tokio::task::spawn_blocking(move || {
            control.run_while(|| running.load(Ordering::Relaxed));
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    running.store(false, Ordering::Relaxed);
    worker.await.context("control loop task failed")?;
    Ok(())
}

/// First-order cabinet model: drifts toward ambient, pulled down while the
/// compressor runs.
#[derive(Debug)]
struct FridgeModel {
    temperature_c: f32,
    compressor_on: bool,
    updated: Instant,
}

impl FridgeModel {
    fn new() -> Self {
        Self {
            temperature_c: INITIAL_CABINET_C,
            compressor_on: false,
            updated: Instant::now(),
        }
    }

    fn advance(&mut self) {
        let elapsed_s = self.updated.elapsed().as_secs_f32();
        self.updated = Instant::now();

        if self.compressor_on {
            self.temperature_c -= COOLING_C_PER_SEC * elapsed_s;
        } else {
            let gap = AMBIENT_C - self.temperature_c;
            self.temperature_c += gap * (WARMING_RATE * elapsed_s).min(1.0);
        }
    }
}

struct SimulatedSensor {
    fridge: Arc<Mutex<FridgeModel>>,
}

impl TemperatureSensor for SimulatedSensor {
    fn read_celsius(&mut self) -> Option<f32> {
        // Hardware integration point: the ESP32 build reads a DS18B20 here.
        let mut fridge = self.fridge.lock().unwrap_or_else(PoisonError::into_inner);
        fridge.advance();
        Some(fridge.temperature_c)
    }
}

struct SimulatedRelay {
    fridge: Arc<Mutex<FridgeModel>>,
}

impl RelayOutput for SimulatedRelay {
    fn set_output(&mut self, on: bool) {
        let mut fridge = self.fridge.lock().unwrap_or_else(PoisonError::into_inner);
        fridge.advance();
        fridge.compressor_on = on;
        info!(
            "relay {} at {:.2}C",
            if on { "ON" } else { "OFF" },
            fridge.temperature_c
        );
    }
}

/// The host OS owns the network link, so there is nothing to associate.
struct HostNetwork;

impl Transport for HostNetwork {
    fn name(&self) -> &'static str {
        "network"
    }

    fn attempt(&mut self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// MQTT session over `rumqttc`'s blocking client. The event loop is only
/// driven from the control thread, inside `attempt` and `receive`.
struct BrokerSession {
    options: MqttOptions,
    session: Option<(Client, Connection)>,
    connected: bool,
    inbox: VecDeque<InboundMessage>,
}

impl BrokerSession {
    fn new(runtime: &RuntimeConfig) -> Self {
        let network = &runtime.network;
        let mut options = MqttOptions::new(
            network.mqtt_client_id.clone(),
            network.mqtt_host.clone(),
            network.mqtt_port,
        );
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        if !network.mqtt_user.is_empty() {
            options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
        }

        Self {
            options,
            session: None,
            connected: false,
            inbox: VecDeque::new(),
        }
    }

    fn next_event(&mut self, wait: Duration) -> Option<Event> {
        let (_, connection) = self.session.as_mut()?;
        match connection.recv_timeout(wait) {
            Ok(Ok(event)) => Some(event),
            Ok(Err(err)) => {
                warn!("mqtt connection error: {err}");
                self.drop_session();
                None
            }
            Err(_) => None,
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Incoming::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    self.connected = true;
                } else {
                    warn!("mqtt broker refused connection: {:?}", ack.code);
                    self.drop_session();
                }
            }
            Event::Incoming(Incoming::Publish(message)) => {
                self.inbox.push_back(InboundMessage::new(
                    message.topic,
                    message.payload.to_vec(),
                ));
            }
            Event::Incoming(Incoming::Disconnect) => {
                warn!("mqtt broker closed the session");
                self.drop_session();
            }
            _ => {}
        }
    }

    fn drop_session(&mut self) {
        self.session = None;
        self.connected = false;
    }
}

impl Transport for BrokerSession {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn attempt(&mut self) -> bool {
        if self.session.is_none() {
            self.session = Some(Client::new(self.options.clone(), MQTT_CAPACITY));
        }

        for _ in 0..CONNACK_POLLS {
            if let Some(event) = self.next_event(CONNACK_WAIT) {
                self.handle_event(event);
            }
            if self.connected || self.session.is_none() {
                break;
            }
        }
        self.connected
    }

    fn is_connected(&self) -> bool {
        self.connected && self.session.is_some()
    }
}

impl Publish for BrokerSession {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        let Some((client, _)) = self.session.as_mut() else {
            return false;
        };
        match client.try_publish(topic, QoS::AtMostOnce, false, payload.to_vec()) {
            Ok(()) => true,
            Err(err) => {
                debug!("mqtt publish to {topic} not queued: {err}");
                false
            }
        }
    }
}

impl MessageBus for BrokerSession {
    fn subscribe(&mut self, topic: &str) -> bool {
        let Some((client, _)) = self.session.as_mut() else {
            return false;
        };
        client.try_subscribe(topic, QoS::AtMostOnce).is_ok()
    }

    fn receive(&mut self) -> Vec<InboundMessage> {
        for _ in 0..MAX_EVENTS_PER_RECEIVE {
            let Some(event) = self.next_event(RECEIVE_WAIT) else {
                break;
            };
            self.handle_event(event);
        }
        self.inbox.drain(..).collect()
    }
}

struct ConfigStore {
    runtime_path: PathBuf,
}

impl ConfigStore {
    fn new() -> Self {
        let runtime_path = std::env::var("FRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.fridge/runtime.json"));
        Self { runtime_path }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid config in {}", self.runtime_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    let network = &mut runtime.network;
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
}
