use log::{debug, info, warn};

use crate::{
    clock::Clock,
    config::{ControlConfig, CoolingConfig, RuntimeConfig},
    cooling::{CoolingController, Transition},
    ports::{MessageBus, RelayOutput, TemperatureSensor, Transport},
    retry::{ConnectOutcome, RetryingConnector},
    setpoint::SetpointChannel,
    status::StatusReporter,
    timer::TimerGate,
    types::TemperatureReading,
};

/// Everything the control decisions depend on. Owned by [`ControlLoop`] and
/// lent to the components; nothing here is global.
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub temperature: Option<TemperatureReading>,
    pub setpoint: f32,
    pub cooling: CoolingController,
}

impl ControllerState {
    pub fn new(config: CoolingConfig) -> Self {
        Self {
            temperature: None,
            setpoint: config.default_setpoint_c,
            cooling: CoolingController::new(config),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Reconnected { attempts: u32 },
    Down,
}

impl LinkStatus {
    pub fn is_up(self) -> bool {
        !matches!(self, Self::Down)
    }

    fn from_outcome(outcome: ConnectOutcome) -> Self {
        match outcome {
            ConnectOutcome::Connected { attempts } => Self::Reconnected { attempts },
            ConnectOutcome::Exhausted { .. } => Self::Down,
        }
    }
}

/// What happened during one control cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub now_ms: u64,
    pub wifi: LinkStatus,
    pub mqtt: LinkStatus,
    pub sampled: Option<f32>,
    pub transition: Option<Transition>,
    pub status_published: Option<bool>,
    pub setpoint_updates: u32,
}

pub struct ControlLoop<C, S, R, W, M> {
    control: ControlConfig,
    clock: C,
    sensor: S,
    relay: R,
    wifi: W,
    mqtt: M,
    state: ControllerState,
    wifi_connector: RetryingConnector,
    mqtt_connector: RetryingConnector,
    sample_gate: TimerGate,
    reporter: StatusReporter,
    setpoint: SetpointChannel,
}

impl<C, S, R, W, M> ControlLoop<C, S, R, W, M>
where
    C: Clock,
    S: TemperatureSensor,
    R: RelayOutput,
    W: Transport,
    M: MessageBus,
{
    pub fn new(runtime: &RuntimeConfig, clock: C, sensor: S, mut relay: R, wifi: W, mqtt: M) -> Self {
        let state = ControllerState::new(runtime.cooling.clone());
        state.cooling.sync_output(&mut relay);

        Self {
            control: runtime.control.clone(),
            clock,
            sensor,
            relay,
            wifi,
            mqtt,
            state,
            wifi_connector: RetryingConnector::from_config(runtime.network.wifi_retry),
            mqtt_connector: RetryingConnector::from_config(runtime.network.mqtt_retry),
            sample_gate: TimerGate::new(runtime.control.sample_interval_ms),
            reporter: StatusReporter::new(
                runtime.control.status_interval_ms,
                runtime.topics.clone(),
            ),
            setpoint: SetpointChannel::from_config(
                &runtime.topics,
                runtime.control.max_payload_bytes,
            ),
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn wifi_mut(&mut self) -> &mut W {
        &mut self.wifi
    }

    pub fn mqtt(&self) -> &M {
        &self.mqtt
    }

    pub fn mqtt_mut(&mut self) -> &mut M {
        &mut self.mqtt
    }

    /// Repeats [`Self::cycle`] until `keep_running` returns `false`, sleeping
    /// `cycle_interval_ms` between cycles.
    pub fn run_while<F: FnMut() -> bool>(&mut self, mut keep_running: F) {
        info!(
            "control loop started (setpoint {:.2}C, sampling every {} ms)",
            self.state.setpoint, self.control.sample_interval_ms
        );
        while keep_running() {
            self.cycle();
            self.clock.sleep_ms(self.control.cycle_interval_ms);
        }
        info!("control loop stopped");
    }

    pub fn cycle(&mut self) -> CycleReport {
        let (wifi, mqtt) = self.ensure_connectivity();
        let now_ms = self.clock.now_ms();

        let sampled = self.sample(now_ms);

        let transition = match self.state.temperature {
            Some(reading) => self.state.cooling.evaluate(
                reading.celsius,
                self.state.setpoint,
                now_ms,
                &mut self.relay,
            ),
            None => None,
        };

        let mut status_published = None;
        let mut setpoint_updates = 0;
        if mqtt.is_up() {
            status_published = self.reporter.tick(now_ms, &self.state, &mut self.mqtt);
            setpoint_updates = self.service_messages();
        }

        CycleReport {
            now_ms,
            wifi,
            mqtt,
            sampled,
            transition,
            status_published,
            setpoint_updates,
        }
    }

    fn ensure_connectivity(&mut self) -> (LinkStatus, LinkStatus) {
        let wifi = if self.wifi.is_connected() {
            LinkStatus::Up
        } else {
            LinkStatus::from_outcome(self.wifi_connector.connect(&mut self.wifi, &self.clock))
        };
        if !wifi.is_up() {
            return (wifi, LinkStatus::Down);
        }

        if self.mqtt.is_connected() {
            return (wifi, LinkStatus::Up);
        }

        let mqtt = LinkStatus::from_outcome(self.mqtt_connector.connect(&mut self.mqtt, &self.clock));
        if mqtt.is_up() {
            let topic = self.setpoint.topic();
            if self.mqtt.subscribe(topic) {
                info!("subscribed to {topic}");
            } else {
                warn!("subscribe to {topic} failed; setpoint updates unavailable until reconnect");
            }
        }
        (wifi, mqtt)
    }

    fn sample(&mut self, now_ms: u64) -> Option<f32> {
        if !self.sample_gate.due(now_ms) {
            return None;
        }

        match self.sensor.read_celsius() {
            Some(celsius) if self.control.is_valid_temperature(celsius) => {
                debug!("temperature {celsius:.2}C");
                self.state.temperature = Some(TemperatureReading {
                    celsius,
                    sampled_at_ms: now_ms,
                });
                Some(celsius)
            }
            Some(celsius) => {
                warn!("discarding out-of-range temperature {celsius}C; keeping last reading");
                None
            }
            None => {
                warn!("temperature read failed; keeping last reading");
                None
            }
        }
    }

    fn service_messages(&mut self) -> u32 {
        let mut updates = 0;
        for message in self.mqtt.receive() {
            if message.topic != self.setpoint.topic() {
                debug!("ignoring message on {}", message.topic);
                continue;
            }

            match self.setpoint.apply(&mut self.state, &message.payload) {
                Ok(setpoint) => {
                    info!("setpoint set to {setpoint:.2}C");
                    updates += 1;
                }
                Err(err) => warn!(
                    "rejected setpoint update, keeping {:.2}C: {err}",
                    self.state.setpoint
                ),
            }
        }
        updates
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        clock::ManualClock,
        ports::{InboundMessage, Publish},
        types::{CoolingPhase, RelayState},
    };

    struct ScriptedSensor {
        readings: VecDeque<Option<f32>>,
        fallback: Option<f32>,
        polls: u32,
    }

    impl ScriptedSensor {
        fn steady(celsius: f32) -> Self {
            Self {
                readings: VecDeque::new(),
                fallback: Some(celsius),
                polls: 0,
            }
        }

        fn push(&mut self, reading: Option<f32>) {
            self.readings.push_back(reading);
        }
    }

    impl TemperatureSensor for ScriptedSensor {
        fn read_celsius(&mut self) -> Option<f32> {
            self.polls += 1;
            self.readings.pop_front().unwrap_or(self.fallback)
        }
    }

    #[derive(Default)]
    struct RecordingRelay {
        writes: Vec<bool>,
    }

    impl RelayOutput for RecordingRelay {
        fn set_output(&mut self, on: bool) {
            self.writes.push(on);
        }
    }

    /// Connects on the first attempt made while `reachable` is set.
    struct FakeLink {
        reachable: bool,
        connected: bool,
        attempts: u32,
    }

    impl FakeLink {
        fn up() -> Self {
            Self {
                reachable: true,
                connected: true,
                attempts: 0,
            }
        }

        fn unreachable() -> Self {
            Self {
                reachable: false,
                connected: false,
                attempts: 0,
            }
        }
    }

    impl Transport for FakeLink {
        fn name(&self) -> &'static str {
            "fake-link"
        }

        fn attempt(&mut self) -> bool {
            self.attempts += 1;
            self.connected = self.reachable;
            self.connected
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    struct FakeBus {
        link: FakeLink,
        subscriptions: Vec<String>,
        published: Vec<(String, Value)>,
        inbox: VecDeque<InboundMessage>,
    }

    impl FakeBus {
        fn new(link: FakeLink) -> Self {
            Self {
                link,
                subscriptions: Vec::new(),
                published: Vec::new(),
                inbox: VecDeque::new(),
            }
        }

        fn deliver(&mut self, topic: &str, payload: &str) {
            self.inbox
                .push_back(InboundMessage::new(topic, payload.as_bytes()));
        }
    }

    impl Transport for FakeBus {
        fn name(&self) -> &'static str {
            "fake-mqtt"
        }

        fn attempt(&mut self) -> bool {
            self.link.attempt()
        }

        fn is_connected(&self) -> bool {
            self.link.is_connected()
        }
    }

    impl Publish for FakeBus {
        fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
            if !self.link.connected {
                return false;
            }
            let value = serde_json::from_slice(payload).unwrap();
            self.published.push((topic.to_string(), value));
            true
        }
    }

    impl MessageBus for FakeBus {
        fn subscribe(&mut self, topic: &str) -> bool {
            self.subscriptions.push(topic.to_string());
            true
        }

        fn receive(&mut self) -> Vec<InboundMessage> {
            self.inbox.drain(..).collect()
        }
    }

    type TestLoop = ControlLoop<ManualClock, ScriptedSensor, RecordingRelay, FakeLink, FakeBus>;

    fn runtime() -> RuntimeConfig {
        let mut runtime = RuntimeConfig::default();
        runtime.network.wifi_retry.spacing_ms = 500;
        runtime.network.wifi_retry.timeout_ms = 2_000;
        runtime.network.mqtt_retry.spacing_ms = 1_000;
        runtime.network.mqtt_retry.timeout_ms = 3_000;
        runtime
    }

    fn control_loop(sensor: ScriptedSensor, wifi: FakeLink, mqtt: FakeLink) -> TestLoop {
        ControlLoop::new(
            &runtime(),
            ManualClock::default(),
            sensor,
            RecordingRelay::default(),
            wifi,
            FakeBus::new(mqtt),
        )
    }

    #[test]
    fn startup_drives_relay_off_once() {
        let control = control_loop(ScriptedSensor::steady(4.0), FakeLink::up(), FakeLink::up());

        assert_eq!(control.relay().writes, vec![false]);
        assert_eq!(control.state().setpoint, 6.0);
        assert_eq!(control.state().cooling.phase(), CoolingPhase::Idle);
    }

    #[test]
    fn connected_cycle_samples_cools_and_reports() {
        let mut control =
            control_loop(ScriptedSensor::steady(9.0), FakeLink::up(), FakeLink::up());

        let report = control.cycle();

        assert_eq!(report.wifi, LinkStatus::Up);
        assert_eq!(report.mqtt, LinkStatus::Up);
        assert_eq!(report.sampled, Some(9.0));
        assert_eq!(report.transition.map(|t| t.to), Some(CoolingPhase::Running));
        assert_eq!(report.status_published, Some(true));
        assert_eq!(control.relay().writes, vec![false, true]);
        assert_eq!(
            control.mqtt().published,
            vec![(
                "fridgecontroller/status".to_string(),
                json!({ "current_temperature": 9.0, "cooling_active": true })
            )]
        );
    }

    #[test]
    fn cooling_keeps_running_while_network_is_down() {
        let mut control = control_loop(
            ScriptedSensor::steady(9.0),
            FakeLink::unreachable(),
            FakeLink::unreachable(),
        );

        let report = control.cycle();

        assert_eq!(report.wifi, LinkStatus::Down);
        assert_eq!(report.mqtt, LinkStatus::Down);
        assert_eq!(report.transition.map(|t| t.to), Some(CoolingPhase::Running));
        assert_eq!(report.status_published, None);
        assert_eq!(control.state().cooling.relay_state(), RelayState::On);
        // 2000 / 500 attempts, sleeping only between them.
        assert_eq!(control.wifi_mut().attempts, 4);
        assert_eq!(control.clock().slept_ms(), 1_500);
        assert_eq!(control.mqtt().link.attempts, 0);
    }

    #[test]
    fn wifi_retry_sequence_restarts_every_cycle() {
        let mut control = control_loop(
            ScriptedSensor::steady(5.0),
            FakeLink::unreachable(),
            FakeLink::up(),
        );

        control.cycle();
        control.cycle();
        assert_eq!(control.wifi_mut().attempts, 8);

        control.wifi_mut().reachable = true;
        let report = control.cycle();

        assert_eq!(report.wifi, LinkStatus::Reconnected { attempts: 1 });
        assert_eq!(report.mqtt, LinkStatus::Up);
    }

    #[test]
    fn mqtt_reconnect_resubscribes_setpoint_topic() {
        let mut control =
            control_loop(ScriptedSensor::steady(5.0), FakeLink::up(), FakeLink::unreachable());

        let report = control.cycle();
        assert_eq!(report.mqtt, LinkStatus::Down);
        assert!(control.mqtt().subscriptions.is_empty());

        control.mqtt_mut().link.reachable = true;
        let report = control.cycle();
        assert_eq!(report.mqtt, LinkStatus::Reconnected { attempts: 1 });
        assert_eq!(
            control.mqtt().subscriptions,
            vec!["fridgecontroller/config".to_string()]
        );

        // Broker drops the session; the next cycle reconnects and subscribes again.
        control.mqtt_mut().link.connected = false;
        control.cycle();
        assert_eq!(control.mqtt().subscriptions.len(), 2);
    }

    #[test]
    fn setpoint_messages_are_applied_before_next_decision() {
        let mut control =
            control_loop(ScriptedSensor::steady(5.0), FakeLink::up(), FakeLink::up());

        control.mqtt_mut().deliver("fridgecontroller/config", r#"{"target_temp": 3.5}"#);
        control.mqtt_mut().deliver("fridgecontroller/other", r#"{"target_temp": 1.0}"#);
        let report = control.cycle();

        assert_eq!(report.setpoint_updates, 1);
        assert_eq!(report.transition, None);
        assert_eq!(control.state().setpoint, 3.5);

        control.clock().advance(1_000);
        let report = control.cycle();
        assert_eq!(report.transition.map(|t| t.to), Some(CoolingPhase::Running));
    }

    #[test]
    fn bad_setpoint_message_keeps_previous_value() {
        let mut control =
            control_loop(ScriptedSensor::steady(5.0), FakeLink::up(), FakeLink::up());

        control.mqtt_mut().deliver("fridgecontroller/config", r#"{"target_temp": "bad"}"#);
        let report = control.cycle();

        assert_eq!(report.setpoint_updates, 0);
        assert_eq!(control.state().setpoint, 6.0);
    }

    #[test]
    fn failed_or_invalid_reads_keep_last_good_temperature() {
        let mut sensor = ScriptedSensor::steady(9.0);
        sensor.push(Some(8.0));
        sensor.push(None);
        sensor.push(Some(-127.0));
        let mut control = control_loop(sensor, FakeLink::up(), FakeLink::up());

        assert_eq!(control.cycle().sampled, Some(8.0));

        for _ in 0..2 {
            control.clock().advance(1_000);
            let report = control.cycle();
            assert_eq!(report.sampled, None);
            let reading = control.state().temperature.unwrap();
            assert_eq!(reading.celsius, 8.0);
            assert_eq!(reading.sampled_at_ms, 0);
        }

        control.clock().advance(1_000);
        assert_eq!(control.cycle().sampled, Some(9.0));
    }

    #[test]
    fn sensor_is_polled_on_its_own_cadence() {
        let mut control =
            control_loop(ScriptedSensor::steady(5.0), FakeLink::up(), FakeLink::up());

        for _ in 0..10 {
            control.cycle();
            control.clock().advance(100);
        }

        // Cycles at 0..=900 ms; only the first is due for a 1 s sample interval.
        assert_eq!(control.sensor_mut().polls, 1);
    }

    #[test]
    fn no_cooling_decision_before_first_reading() {
        let mut sensor = ScriptedSensor::steady(9.0);
        sensor.push(None);
        let mut control = control_loop(sensor, FakeLink::up(), FakeLink::up());

        let report = control.cycle();

        assert_eq!(report.transition, None);
        assert_eq!(report.status_published, None);
        assert_eq!(control.state().temperature, None);
        assert_eq!(control.relay().writes, vec![false]);
    }

    #[test]
    fn run_while_stops_when_predicate_fails() {
        let mut control =
            control_loop(ScriptedSensor::steady(5.0), FakeLink::up(), FakeLink::up());
        let mut remaining = 3;

        control.run_while(|| {
            remaining -= 1;
            remaining >= 0
        });

        assert_eq!(control.clock().slept_ms(), 3 * 100);
    }
}
