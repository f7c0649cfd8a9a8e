//! Orchestration of the cloud handshake and the device sessions.
//!
//! The connector walks the full chain on every connect: serverless
//! authentication, MQTT credential fetch, device discovery, then an MQTT
//! session against the first broker candidate that passes a verification
//! read round-trip. A single reconnection cycle may run at a time; while one
//! is in flight, polls and commands wait on the reconnection gate instead of
//! racing the handshake.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::api::{ApiClient, Device};
use crate::error::{Error, Result};
use crate::logger::SmartLogger;
use crate::modbus::{
    self, Command, DeviceState, DEFAULT_REGISTER_COUNT, DEFAULT_SLAVE_ADDRESS,
};
use crate::mqtt::MqttSession;
use crate::signal::Signal;

/// Production broker; used whenever the API offers no hint of its own.
const MQTT_HOST_PROD: &str = "mqtt.sydpower.com";

/// Developer-mode broker fallback.
const MQTT_HOST_DEV: &str = "mqtt-dev.sydpower.com";

/// Broker WebSocket port.
const MQTT_PORT: u16 = 8083;

/// Bounds on the cloud handshake steps.
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
const MQTT_INFO_TIMEOUT: Duration = Duration::from_secs(15);
const DEVICE_LIST_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-candidate window: CONNECT handshake, subscriptions, and the
/// verification read must all land inside it.
const CANDIDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait for the first device response during verification and polls.
const DATA_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra window to collect the remaining devices' responses.
const MULTI_DEVICE_GRACE: Duration = Duration::from_secs(2);

/// Pause after a wake write so the firmware processes the ACK.
const WAKE_PAUSE: Duration = Duration::from_secs(1);

/// Pause after a command publish so the device applies it.
const COMMAND_PAUSE: Duration = Duration::from_secs(1);

/// Bound on acquiring the connection-serialising lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Gate waits: a fresh connect gives up earlier than poll/command callers.
const GATE_WAIT_CONNECT: Duration = Duration::from_secs(15);
const GATE_WAIT_OPERATION: Duration = Duration::from_secs(30);

/// Bound on connect() when entered from poll or command paths.
const ENSURE_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Reconnection cycle parameters.
const RECONNECT_MAX_ATTEMPTS: u32 = 10;
const RECONNECT_BASE_DELAY_SECS: f64 = 3.0;
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const RECONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(45);
const MIN_RECONNECTION_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on tearing down a session during cleanup.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// A disconnect this long after the last good exchange resets the
/// min-interval throttle so recovery starts immediately.
const STALE_BEFORE_DISCONNECT: Duration = Duration::from_secs(60);

/// Consecutive empty polls that trigger a background reconnection.
const EMPTY_POLLS_BEFORE_RECONNECT: u32 = 2;

async fn with_timeout<T>(
    limit: Duration,
    operation: &'static str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, limit)),
    }
}

/// Ordered broker candidates: the API-provided hint first, then the
/// compile-time fallback for the current mode, deduplicated.
fn broker_candidates(
    api_host: Option<&str>,
    api_port: Option<u16>,
    developer_mode: bool,
) -> Vec<(String, u16)> {
    let fallback_host = if developer_mode {
        MQTT_HOST_DEV
    } else {
        MQTT_HOST_PROD
    };

    let mut candidates: Vec<(String, u16)> = Vec::with_capacity(2);
    if let Some(host) = api_host {
        candidates.push((host.to_string(), api_port.unwrap_or(MQTT_PORT)));
    }
    let fallback = (fallback_host.to_string(), MQTT_PORT);
    if !candidates.contains(&fallback) {
        candidates.push(fallback);
    }
    candidates
}

/// Backoff before reconnection attempt `attempt` (0-based).
fn reconnect_delay(attempt: u32) -> Duration {
    let secs = RECONNECT_BASE_DELAY_SECS * 1.5f64.powi(attempt as i32);
    RECONNECT_MAX_DELAY.min(Duration::from_secs_f64(secs))
}

/// Connector to the Sydpower cloud and the account's devices.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

struct Inner {
    username: String,
    password: String,
    developer_mode: bool,
    logger: SmartLogger,

    /// Serialises transitions into and out of the connecting state.
    connection_lock: tokio::sync::Mutex<()>,
    /// True for the whole duration of a reconnection cycle.
    reconnection_in_progress: AtomicBool,
    /// Open (set) except while a reconnection cycle runs.
    reconnection_gate: Signal,
    last_reconnection_attempt: Mutex<Option<Instant>>,
    last_successful_communication: Mutex<Option<Instant>>,

    session: Mutex<Option<Arc<MqttSession>>>,
    /// Device records from the last successful discovery.
    devices: Mutex<HashMap<String, Device>>,
    /// Attribute maps merged across polls; feeds the wake write values.
    state_cache: Mutex<HashMap<String, DeviceState>>,

    consecutive_empty_polls: AtomicU32,
    /// Handed to every session so transport drops reach the watcher task.
    disconnect_tx: mpsc::Sender<String>,
    /// Back-reference for background tasks spawned off `&self` paths.
    self_weak: Weak<Inner>,
}

/// Reopens the gate even when a reconnection cycle is cancelled mid-attempt.
struct GateGuard<'a>(&'a Inner);

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.0
            .reconnection_in_progress
            .store(false, Ordering::SeqCst);
        self.0.reconnection_gate.set();
    }
}

impl Connector {
    /// Creates a disconnected connector. Must be called inside a Tokio
    /// runtime: the disconnect watcher task is spawned here.
    pub fn new(username: &str, password: &str, developer_mode: bool) -> Self {
        let (disconnect_tx, disconnect_rx) = mpsc::channel(8);
        let inner = Arc::new_cyclic(|self_weak| Inner {
            username: username.to_string(),
            password: password.to_string(),
            developer_mode,
            logger: SmartLogger::new("sydpower::connector"),
            connection_lock: tokio::sync::Mutex::new(()),
            reconnection_in_progress: AtomicBool::new(false),
            reconnection_gate: Signal::new(true),
            last_reconnection_attempt: Mutex::new(None),
            last_successful_communication: Mutex::new(None),
            session: Mutex::new(None),
            devices: Mutex::new(HashMap::new()),
            state_cache: Mutex::new(HashMap::new()),
            consecutive_empty_polls: AtomicU32::new(0),
            disconnect_tx,
            self_weak: self_weak.clone(),
        });

        tokio::spawn(disconnect_watcher(Arc::downgrade(&inner), disconnect_rx));

        Self { inner }
    }

    /// Full connect: authenticate, discover devices, attach to a broker.
    /// Safe to call when already connected.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Reads fresh state from every device and returns the merged map.
    /// Empty on failure; the caller decides whether that is fatal.
    pub async fn poll(&self) -> HashMap<String, DeviceState> {
        self.inner.poll().await
    }

    /// Encodes (and for writes, validates) a command and publishes it.
    pub async fn run_command(&self, device_id: &str, command: Command) -> Result<()> {
        self.inner.run_command(device_id, command).await
    }

    /// Manual reconnection trigger. Returns the connected state afterwards.
    pub async fn reconnect(&self) -> bool {
        self.inner.handle_reconnection().await
    }

    /// Tears down the MQTT session and the API transport.
    pub async fn disconnect(&self) {
        self.inner.cleanup().await;
        self.inner.logger.info("Disconnected from all services");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Device records from the last successful discovery.
    pub fn devices(&self) -> HashMap<String, Device> {
        self.inner.devices.lock().expect("device lock poisoned").clone()
    }

    /// Instant of the last successful exchange with any device.
    pub fn last_successful_communication(&self) -> Option<Instant> {
        *self
            .inner
            .last_successful_communication
            .lock()
            .expect("timestamp lock poisoned")
    }
}

impl Inner {
    fn is_connected(&self) -> bool {
        self.session
            .lock()
            .expect("session lock poisoned")
            .as_ref()
            .is_some_and(|session| session.is_connected())
    }

    fn current_session(&self) -> Option<Arc<MqttSession>> {
        self.session.lock().expect("session lock poisoned").clone()
    }

    fn mark_communication_success(&self) {
        *self
            .last_successful_communication
            .lock()
            .expect("timestamp lock poisoned") = Some(Instant::now());
    }

    async fn connect(&self) -> Result<()> {
        if self.reconnection_in_progress.load(Ordering::SeqCst) {
            self.logger
                .debug("Connection attempt while reconnection in progress, waiting...");
            with_timeout(GATE_WAIT_CONNECT, "reconnection gate", async {
                self.reconnection_gate.wait().await;
                Ok(())
            })
            .await?;
            if self.is_connected() {
                return Ok(());
            }
        }

        if self.is_connected() {
            return Ok(());
        }

        let guard = tokio::time::timeout(LOCK_TIMEOUT, self.connection_lock.lock())
            .await
            .map_err(|_| Error::timeout("connection lock", LOCK_TIMEOUT))?;

        // Another caller may have finished the handshake while we queued.
        if self.is_connected() {
            return Ok(());
        }

        let result = self.connect_cycle().await;
        drop(guard);
        if let Err(err) = &result {
            self.logger.error(&format!("Error during connection: {err}"));
            self.cleanup().await;
        }
        result
    }

    /// The handshake itself. Caller holds the connection lock.
    async fn connect_cycle(&self) -> Result<()> {
        let mut api = ApiClient::new()?;

        self.logger.info("Authenticating with API");
        with_timeout(
            AUTH_TIMEOUT,
            "authentication",
            api.authenticate(&self.username, &self.password),
        )
        .await?;

        self.logger.info("Getting MQTT token");
        let mqtt_info =
            with_timeout(MQTT_INFO_TIMEOUT, "MQTT credential fetch", api.get_mqtt_info()).await?;

        self.logger.info("Getting device list");
        let devices =
            with_timeout(DEVICE_LIST_TIMEOUT, "device discovery", api.get_devices()).await?;
        if devices.is_empty() {
            return Err(Error::State("no devices returned from API".to_string()));
        }
        let device_ids: Vec<String> = devices.keys().cloned().collect();
        self.logger
            .info(&format!("Found {} devices: {device_ids:?}", devices.len()));
        *self.devices.lock().expect("device lock poisoned") = devices;

        let candidates = broker_candidates(
            mqtt_info.host.as_deref(),
            mqtt_info.port,
            self.developer_mode,
        );

        for (host, port) in &candidates {
            self.logger
                .info(&format!("Connecting to MQTT broker {host}:{port}"));
            let deadline = Instant::now() + CANDIDATE_TIMEOUT;

            let session = match MqttSession::connect(
                host,
                *port,
                &mqtt_info.token,
                &device_ids,
                CANDIDATE_TIMEOUT,
                self.disconnect_tx.clone(),
            )
            .await
            {
                Ok(session) => Arc::new(session),
                Err(err) => {
                    self.logger
                        .warning(&format!("Broker {host}:{port} failed: {err}"));
                    continue;
                }
            };

            let verify_budget = deadline
                .saturating_duration_since(Instant::now())
                .min(DATA_WAIT_TIMEOUT)
                .max(Duration::from_millis(100));
            if self.verify_connection(&session, verify_budget).await {
                *self.session.lock().expect("session lock poisoned") = Some(session);
                self.mark_communication_success();
                self.logger.info("Connection successful and verified");
                return Ok(());
            }

            self.logger.warning(&format!(
                "Connection verification failed against {host}:{port}"
            ));
            session.disconnect().await;
        }

        Err(Error::Network(format!(
            "no broker candidate accepted the connection (tried {})",
            candidates.len()
        )))
    }

    /// A read round-trip proving the broker actually routes to the devices.
    async fn verify_connection(&self, session: &MqttSession, budget: Duration) -> bool {
        session.data_updated().clear();
        let params = self.device_read_params();
        self.fan_out_reads(session, &params).await;
        match tokio::time::timeout(budget, session.data_updated().wait()).await {
            Ok(()) => {
                self.logger.info("Connection verification successful");
                true
            }
            Err(_) => {
                self.logger
                    .warning("Connection verification timed out - no data received");
                false
            }
        }
    }

    /// Per-device read parameters with the documented defaults.
    fn device_read_params(&self) -> Vec<(String, u8, u16)> {
        self.devices
            .lock()
            .expect("device lock poisoned")
            .values()
            .map(|device| {
                (
                    device.id.clone(),
                    device.modbus_address.unwrap_or(DEFAULT_SLAVE_ADDRESS),
                    device.modbus_count.unwrap_or(DEFAULT_REGISTER_COUNT),
                )
            })
            .collect()
    }

    async fn poll(&self) -> HashMap<String, DeviceState> {
        if self.reconnection_in_progress.load(Ordering::SeqCst) {
            self.logger
                .debug("Reconnection in progress, waiting before getting data...");
            if tokio::time::timeout(GATE_WAIT_OPERATION, self.reconnection_gate.wait())
                .await
                .is_err()
            {
                self.logger.warning("Timeout waiting for reconnection");
                return HashMap::new();
            }
        }

        if !self.is_connected() {
            self.logger.debug("Not connected, calling connect()");
            if let Err(err) =
                with_timeout(ENSURE_CONNECT_TIMEOUT, "connect for poll", self.connect()).await
            {
                self.logger.exception("Failed to connect", &err);
                return self.register_poll_outcome(HashMap::new());
            }
        }

        let Some(session) = self.current_session() else {
            return self.register_poll_outcome(HashMap::new());
        };
        let read_params = self.device_read_params();
        if read_params.is_empty() {
            self.logger.warning("No devices available to request data from");
            return HashMap::new();
        }

        self.logger.status(
            "poll",
            &format!("Publishing data request for {} device(s)", read_params.len()),
        );

        // Primary read.
        if self.read_round(&session, &read_params).await {
            return self.register_poll_outcome(self.merge_session_state(&session));
        }

        // Wake-and-read: firmware drops back-to-back reads unless a write
        // lands first, so echo the cached screen rest time at each device.
        self.logger
            .debug("No data from primary read, trying wake-and-read");
        self.wake_devices(&session, &read_params).await;
        tokio::time::sleep(WAKE_PAUSE).await;

        if self.read_round(&session, &read_params).await {
            return self.register_poll_outcome(self.merge_session_state(&session));
        }

        self.logger.warning(&format!(
            "Timeout waiting for device data update. Devices: {:?}",
            read_params.iter().map(|(id, _, _)| id).collect::<Vec<_>>()
        ));
        self.register_poll_outcome(HashMap::new())
    }

    /// Publishes a register read to every device concurrently.
    async fn fan_out_reads(&self, session: &MqttSession, params: &[(String, u8, u16)]) {
        let results = futures::future::join_all(
            params
                .iter()
                .map(|(id, slave, count)| session.request_data_update(id, *slave, *count)),
        )
        .await;
        for ((id, _, _), result) in params.iter().zip(results) {
            if let Err(err) = result {
                self.logger
                    .warning(&format!("Data request to {id} failed: {err}"));
            }
        }
    }

    /// One read pass: clear the event, fan out reads, wait, then hold a
    /// grace window so slower devices can land in the same snapshot.
    async fn read_round(&self, session: &MqttSession, params: &[(String, u8, u16)]) -> bool {
        session.data_updated().clear();
        self.fan_out_reads(session, params).await;
        if tokio::time::timeout(DATA_WAIT_TIMEOUT, session.data_updated().wait())
            .await
            .is_err()
        {
            return false;
        }
        if params.len() > 1 {
            tokio::time::sleep(MULTI_DEVICE_GRACE).await;
        }
        true
    }

    /// Writes each device's cached `screenRestTime` back to itself; devices
    /// with no cached value are skipped.
    async fn wake_devices(&self, session: &MqttSession, params: &[(String, u8, u16)]) {
        for (id, slave, _) in params {
            let cached = {
                let cache = self.state_cache.lock().expect("state cache lock poisoned");
                cache
                    .get(id)
                    .and_then(|state| state.get("screenRestTime"))
                    .and_then(|value| value.as_u16())
            };
            let Some(value) = cached else {
                self.logger
                    .debug(&format!("No cached screenRestTime for {id}, skipping wake"));
                continue;
            };
            match modbus::encode_write(*slave, modbus::register::SCREEN_REST_TIME, value) {
                Ok(frame) => {
                    if let Err(err) = session.publish_command(id, frame).await {
                        self.logger
                            .warning(&format!("Wake write to {id} failed: {err}"));
                    }
                }
                Err(err) => {
                    self.logger
                        .warning(&format!("Cached wake value for {id} refused: {err}"));
                }
            }
        }
    }

    /// Merges the session's accumulated state into the connector cache and
    /// returns a snapshot of it.
    fn merge_session_state(&self, session: &MqttSession) -> HashMap<String, DeviceState> {
        let fresh = session.devices();
        let mut cache = self.state_cache.lock().expect("state cache lock poisoned");
        for (device_id, update) in fresh {
            cache.entry(device_id).or_default().extend(update);
        }
        cache.clone()
    }

    /// Bumps success/failure accounting and kicks a background reconnection
    /// after repeated empty polls.
    fn register_poll_outcome(
        &self,
        data: HashMap<String, DeviceState>,
    ) -> HashMap<String, DeviceState> {
        if data.is_empty() {
            let failures = self.consecutive_empty_polls.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= EMPTY_POLLS_BEFORE_RECONNECT
                && !self.reconnection_in_progress.load(Ordering::SeqCst)
            {
                self.logger
                    .warning("Repeated empty polls, initiating reconnection");
                if let Some(this) = self.self_weak.upgrade() {
                    tokio::spawn(async move {
                        this.handle_reconnection().await;
                    });
                }
            }
        } else {
            self.consecutive_empty_polls.store(0, Ordering::SeqCst);
            self.mark_communication_success();
        }
        data
    }

    async fn run_command(&self, device_id: &str, command: Command) -> Result<()> {
        if self.reconnection_in_progress.load(Ordering::SeqCst) {
            self.logger
                .debug("Reconnection in progress, waiting before running command...");
            with_timeout(GATE_WAIT_OPERATION, "reconnection gate", async {
                self.reconnection_gate.wait().await;
                Ok(())
            })
            .await?;
        }

        if !self.is_connected() {
            with_timeout(ENSURE_CONNECT_TIMEOUT, "connect for command", self.connect()).await?;
        }

        // Validation happens before anything touches the wire and is never
        // retried.
        let frame = command.encode()?;

        let session = self
            .current_session()
            .ok_or_else(|| Error::State("MQTT session is gone".to_string()))?;
        self.logger
            .debug(&format!("Sending command {command:?} to {device_id}"));
        session.publish_command(device_id, frame).await?;
        self.mark_communication_success();
        tokio::time::sleep(COMMAND_PAUSE).await;
        Ok(())
    }

    async fn handle_reconnection(&self) -> bool {
        // Throttle storms of disconnect callbacks.
        let since_last = self
            .last_reconnection_attempt
            .lock()
            .expect("timestamp lock poisoned")
            .map(|at| at.elapsed());
        if let Some(elapsed) = since_last {
            if elapsed < MIN_RECONNECTION_INTERVAL {
                tokio::time::sleep(MIN_RECONNECTION_INTERVAL).await;
            }
        }

        if self.reconnection_in_progress.load(Ordering::SeqCst) {
            self.logger.debug("Reconnection already in progress, waiting...");
            if tokio::time::timeout(GATE_WAIT_OPERATION, self.reconnection_gate.wait())
                .await
                .is_err()
            {
                self.logger.error("Timeout waiting for existing reconnection");
            }
            return self.is_connected();
        }

        let guard = match tokio::time::timeout(LOCK_TIMEOUT, self.connection_lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                self.logger
                    .error("Timeout acquiring connection lock for reconnection");
                return false;
            }
        };

        self.reconnection_in_progress.store(true, Ordering::SeqCst);
        self.reconnection_gate.clear();
        *self
            .last_reconnection_attempt
            .lock()
            .expect("timestamp lock poisoned") = Some(Instant::now());
        let gate_guard = GateGuard(self);
        self.logger.info("Starting reconnection process...");

        if tokio::time::timeout(CLEANUP_TIMEOUT, self.cleanup())
            .await
            .is_err()
        {
            self.logger.error("Cleanup timeout during reconnection");
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        let mut reconnected = false;
        for attempt in 0..RECONNECT_MAX_ATTEMPTS {
            self.logger.info(&format!(
                "Reconnection attempt {}/{RECONNECT_MAX_ATTEMPTS}",
                attempt + 1
            ));
            match tokio::time::timeout(RECONNECT_ATTEMPT_TIMEOUT, self.connect_cycle()).await {
                Ok(Ok(())) => {
                    self.logger.info(&format!(
                        "Successfully reconnected on attempt {}",
                        attempt + 1
                    ));
                    self.mark_communication_success();
                    reconnected = true;
                    break;
                }
                Ok(Err(err)) => {
                    self.logger
                        .error(&format!("Reconnection attempt {} failed: {err}", attempt + 1));
                    self.cleanup().await;
                }
                Err(_) => {
                    self.logger.error(&format!(
                        "Timeout during reconnection attempt {}",
                        attempt + 1
                    ));
                    self.cleanup().await;
                }
            }

            if attempt + 1 < RECONNECT_MAX_ATTEMPTS {
                let delay = reconnect_delay(attempt);
                self.logger.warning(&format!(
                    "Waiting {:.0} seconds before next reconnection attempt",
                    delay.as_secs_f64()
                ));
                tokio::time::sleep(delay).await;
            }
        }

        if !reconnected {
            self.logger.error(&format!(
                "Failed to reconnect after {RECONNECT_MAX_ATTEMPTS} attempts"
            ));
        }

        drop(gate_guard);
        drop(guard);
        reconnected
    }

    /// Drops the MQTT session (bounded) and the API transport.
    async fn cleanup(&self) {
        let session = self.session.lock().expect("session lock poisoned").take();
        if let Some(session) = session {
            if tokio::time::timeout(Duration::from_secs(5), session.disconnect())
                .await
                .is_err()
            {
                self.logger.warning("MQTT client disconnect timeout");
            }
        }
        // The API transport is scoped to the connect cycle; nothing to close
        // here beyond letting the HTTP pool drop.
    }
}

/// Routes transport-drop notifications from sessions into reconnection
/// cycles. Holds only a weak reference so a dropped connector shuts the
/// watcher down instead of leaking it.
async fn disconnect_watcher(weak: Weak<Inner>, mut rx: mpsc::Receiver<String>) {
    while let Some(reason) = rx.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        inner
            .logger
            .warning(&format!("MQTT disconnected: {reason}"));

        let stale = inner
            .last_successful_communication
            .lock()
            .expect("timestamp lock poisoned")
            .map_or(true, |at| at.elapsed() > STALE_BEFORE_DISCONNECT);
        if stale {
            // Long-dead link: drop the throttle so recovery starts now.
            *inner
                .last_reconnection_attempt
                .lock()
                .expect("timestamp lock poisoned") = None;
        }

        let handle = Arc::clone(&inner);
        tokio::spawn(async move {
            handle.handle_reconnection().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod broker_candidates {
        use super::*;

        #[test]
        fn api_host_is_tried_before_fallback() {
            let candidates = broker_candidates(Some("broker.example.com"), Some(8084), false);
            assert_eq!(
                candidates,
                vec![
                    ("broker.example.com".to_string(), 8084),
                    ("mqtt.sydpower.com".to_string(), 8083),
                ]
            );
        }

        #[test]
        fn missing_api_host_leaves_only_the_fallback() {
            let candidates = broker_candidates(None, None, false);
            assert_eq!(candidates, vec![("mqtt.sydpower.com".to_string(), 8083)]);
        }

        #[test]
        fn api_port_defaults_to_8083() {
            let candidates = broker_candidates(Some("broker.example.com"), None, false);
            assert_eq!(candidates[0].1, 8083);
        }

        #[test]
        fn duplicate_of_the_fallback_is_removed() {
            let candidates = broker_candidates(Some("mqtt.sydpower.com"), Some(8083), false);
            assert_eq!(candidates.len(), 1);
        }

        #[test]
        fn developer_mode_switches_the_fallback() {
            let candidates = broker_candidates(None, None, true);
            assert_eq!(candidates, vec![("mqtt-dev.sydpower.com".to_string(), 8083)]);
        }
    }

    mod backoff {
        use super::*;

        #[test]
        fn delays_grow_geometrically_and_cap() {
            assert_eq!(reconnect_delay(0), Duration::from_secs(3));
            assert_eq!(reconnect_delay(1), Duration::from_secs_f64(4.5));
            assert_eq!(reconnect_delay(2), Duration::from_secs_f64(6.75));
            assert_eq!(reconnect_delay(9), RECONNECT_MAX_DELAY);
        }

        #[test]
        fn delay_never_exceeds_the_cap() {
            for attempt in 0..RECONNECT_MAX_ATTEMPTS {
                assert!(reconnect_delay(attempt) <= RECONNECT_MAX_DELAY);
            }
        }
    }

    mod gate {
        use super::*;

        #[tokio::test]
        async fn new_connector_has_an_open_gate() {
            let connector = Connector::new("user", "pass", false);
            assert!(connector.inner.reconnection_gate.is_set());
            assert!(!connector
                .inner
                .reconnection_in_progress
                .load(Ordering::SeqCst));
        }

        #[tokio::test]
        async fn gate_guard_reopens_on_drop() {
            let connector = Connector::new("user", "pass", false);
            let inner = &connector.inner;
            inner.reconnection_in_progress.store(true, Ordering::SeqCst);
            inner.reconnection_gate.clear();
            {
                let _guard = GateGuard(inner);
                // Simulated cancellation point: guard dropped without a
                // completed cycle.
            }
            assert!(inner.reconnection_gate.is_set());
            assert!(!inner.reconnection_in_progress.load(Ordering::SeqCst));
        }

    }
}
