//! MQTT-over-WebSocket session to the Sydpower broker.
//!
//! One session serves every device on the account: it subscribes to each
//! device's response topics, feeds incoming register frames through the Modbus
//! decoder into a shared per-device state map, and publishes command frames.
//! The broker redelivers QoS-1 messages freely, so a short-lived dedup cache
//! sits in front of the decoder.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, Transport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::logger::SmartLogger;
use crate::modbus::{self, DeviceState, COMMANDS, MIN_REGISTER_COUNT};
use crate::signal::Signal;

/// Fixed broker password; the username is the per-session MQTT token.
const MQTT_PASSWORD: &str = "helloyou";

/// WebSocket endpoint path on the broker.
const MQTT_WEBSOCKET_PATH: &str = "/mqtt";

/// MQTT keepalive interval in seconds
const KEEPALIVE_SECS: u64 = 30;

/// Capacity of the internal rumqttc request channel between AsyncClient and EventLoop
const MQTT_EVENT_QUEUE_CAPACITY: usize = 10;

/// Duplicates of a message arriving within this window are dropped.
const DEDUP_TTL: Duration = Duration::from_secs(2);

/// The dedup cache is swept of expired entries at most this often.
const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// `state` topic payloads below this length are keepalives, not data.
const STATE_KEEPALIVE_MAX_LEN: usize = 10;

/// Nothing shorter than this can carry even a header.
const MIN_PAYLOAD_LEN: usize = 8;

/// CONNACK return codes, per MQTT 3.1.1.
fn connack_reason(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::Success => "connection successful",
        ConnectReturnCode::RefusedProtocolVersion => "incorrect protocol version",
        ConnectReturnCode::BadClientId => "invalid client identifier",
        ConnectReturnCode::ServiceUnavailable => "server unavailable",
        ConnectReturnCode::BadUserNamePassword => "bad username or password",
        ConnectReturnCode::NotAuthorized => "not authorized",
    }
}

/// Caller-supplied handler for one device's raw register frames, replacing
/// the default decoder for that device.
pub type MessageHandler = Box<dyn Fn(&str, &[u16]) + Send + Sync>;

/// Session state shared between the event-loop task and the owning connector.
struct Shared {
    /// Set once CONNACK + subscriptions complete; cleared on loss.
    connected: Signal,
    /// Set whenever a device frame was decoded and merged.
    data_updated: Signal,
    devices: Mutex<HashMap<String, DeviceState>>,
    handlers: Mutex<HashMap<String, MessageHandler>>,
    /// Suppresses the disconnect callback during deliberate teardown.
    intentional_disconnect: AtomicBool,
    logger: SmartLogger,
}

impl Shared {
    fn new() -> Self {
        Self {
            connected: Signal::new(false),
            data_updated: Signal::new(false),
            devices: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            intentional_disconnect: AtomicBool::new(false),
            logger: SmartLogger::new("sydpower::mqtt"),
        }
    }

    /// Runs one incoming message through dedup, filtering, and decode, and
    /// merges the result into the per-device state.
    fn ingest(&self, dedup: &mut DedupCache, topic: &str, payload: &[u8]) {
        if !dedup.check_and_insert(topic, payload, Instant::now()) {
            return;
        }

        // Short state messages are keepalives; no data, no log.
        if topic.ends_with("/device/response/state") && payload.len() < STATE_KEEPALIVE_MAX_LEN {
            return;
        }
        if payload.len() < MIN_PAYLOAD_LEN {
            self.logger
                .warning(&format!("MQTT payload too short on topic {topic}"));
            return;
        }

        let Some(registers) = modbus::registers_from_payload(payload) else {
            self.logger
                .warning(&format!("Odd byte count in payload from {topic}"));
            return;
        };
        if registers.len() < MIN_REGISTER_COUNT {
            self.logger.warning(&format!(
                "Too few registers ({}) from {topic}",
                registers.len()
            ));
            return;
        }

        let device_id = topic.split('/').next().unwrap_or_default().to_string();

        {
            let handlers = self.handlers.lock().expect("handler lock poisoned");
            if let Some(handler) = handlers.get(&device_id) {
                handler(topic, &registers);
                return;
            }
        }

        let update = modbus::parse_registers(&registers, topic);
        if update.is_empty() {
            self.logger
                .warning(&format!("No data extracted from message on {topic}"));
            return;
        }

        self.logger.status(
            "device-update",
            &format!("Device {device_id} update: {} fields parsed", update.len()),
        );
        {
            let mut devices = self.devices.lock().expect("device state lock poisoned");
            devices.entry(device_id).or_default().extend(update);
        }
        self.data_updated.set();
    }
}

/// Suppresses broker QoS-1 redeliveries: remembers `(topic, payload)`
/// identities for a short window and sweeps expired entries lazily.
struct DedupCache {
    seen: HashMap<u64, Instant>,
    last_sweep: Instant,
}

impl DedupCache {
    fn new() -> Self {
        Self {
            seen: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    /// Returns true when the message is fresh (and records it).
    fn check_and_insert(&mut self, topic: &str, payload: &[u8], now: Instant) -> bool {
        if now.duration_since(self.last_sweep) > DEDUP_SWEEP_INTERVAL {
            self.seen
                .retain(|_, seen_at| now.duration_since(*seen_at) <= DEDUP_TTL);
            self.last_sweep = now;
        }

        let mut hasher = DefaultHasher::new();
        topic.hash(&mut hasher);
        payload.hash(&mut hasher);
        let id = hasher.finish();

        match self.seen.get(&id) {
            Some(seen_at) if now.duration_since(*seen_at) <= DEDUP_TTL => false,
            _ => {
                self.seen.insert(id, now);
                true
            }
        }
    }
}

/// Generates the broker client id. The broker kicks duplicate ids, so the
/// nonce and millisecond timestamp keep concurrent sessions apart.
fn mqtt_client_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let nonce: String = (0..24)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect();
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("client_{nonce}_{timestamp_ms}")
}

/// MQTT session for all of an account's devices.
pub struct MqttSession {
    client: AsyncClient,
    /// Handle to the background event loop task for graceful shutdown
    event_loop_handle: JoinHandle<()>,
    shared: Arc<Shared>,
}

impl MqttSession {
    /// Connects to the broker over WebSocket, subscribes to every device's
    /// response topics, and publishes the initial settings request.
    ///
    /// `disconnect_tx` receives a reason string whenever the transport drops
    /// outside of a deliberate [`MqttSession::disconnect`].
    pub async fn connect(
        host: &str,
        port: u16,
        mqtt_token: &str,
        device_ids: &[String],
        connect_timeout: Duration,
        disconnect_tx: mpsc::Sender<String>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::new());

        let client_id = mqtt_client_id();
        let broker_url = format!("ws://{host}:{port}{MQTT_WEBSOCKET_PATH}");
        shared
            .logger
            .debug(&format!("Starting MQTT connection to {broker_url}"));

        let mut mqtt_opts = MqttOptions::new(client_id, broker_url, port);
        mqtt_opts.set_transport(Transport::Ws);
        mqtt_opts.set_credentials(mqtt_token, MQTT_PASSWORD);
        mqtt_opts.set_keep_alive(Duration::from_secs(KEEPALIVE_SECS));
        mqtt_opts.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, MQTT_EVENT_QUEUE_CAPACITY);

        // Clones/moves for the spawned event-loop task
        let shared_clone = Arc::clone(&shared);
        let event_client = client.clone();
        let device_ids: Vec<String> = device_ids.to_vec();

        let event_loop_handle = tokio::spawn(async move {
            let mut dedup = DedupCache::new();
            let mut subscribed_topics: Vec<String> = Vec::new();

            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                        if connack.code != ConnectReturnCode::Success {
                            shared_clone.logger.error(&format!(
                                "MQTT connection refused: {}",
                                connack_reason(connack.code)
                            ));
                            continue;
                        }

                        // The broker drops subscriptions for clean sessions;
                        // re-subscribe on every (re)connection, shedding any
                        // previously tracked topics first.
                        for topic in subscribed_topics.drain(..) {
                            let _ = event_client.unsubscribe(topic).await;
                        }
                        for device_id in &device_ids {
                            for topic in [
                                format!("{device_id}/device/response/state"),
                                format!("{device_id}/device/response/client/+"),
                            ] {
                                let _ = event_client.subscribe(&topic, QoS::AtLeastOnce).await;
                                subscribed_topics.push(topic);
                            }
                        }
                        shared_clone.logger.debug(&format!(
                            "Subscribed to {} topics",
                            subscribed_topics.len()
                        ));

                        // Prime every device with a settings read so state is
                        // populated before the first poll.
                        for device_id in &device_ids {
                            let _ = event_client
                                .publish(
                                    format!("{device_id}/client/request/data"),
                                    QoS::AtLeastOnce,
                                    false,
                                    COMMANDS["REGRequestSettings"].clone(),
                                )
                                .await;
                        }

                        shared_clone.connected.set();
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        shared_clone.ingest(&mut dedup, &publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if shared_clone.intentional_disconnect.load(Ordering::SeqCst) {
                            break;
                        }
                        shared_clone.connected.clear();
                        shared_clone
                            .logger
                            .warning(&format!("Unexpected MQTT disconnection: {err}"));
                        let _ = disconnect_tx.try_send(err.to_string());
                        // The connector owns recovery: the MQTT token may be
                        // stale, so a bare transport retry here is pointless.
                        break;
                    }
                }
            }
        });

        match tokio::time::timeout(connect_timeout, shared.connected.wait()).await {
            Ok(()) => {
                shared
                    .logger
                    .debug("MQTT connection established successfully");
                Ok(Self {
                    client,
                    event_loop_handle,
                    shared,
                })
            }
            Err(_) => {
                event_loop_handle.abort();
                Err(Error::timeout("MQTT connection", connect_timeout))
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.is_set()
    }

    pub(crate) fn data_updated(&self) -> &Signal {
        &self.shared.data_updated
    }

    /// Snapshot of every device's accumulated attribute map.
    pub fn devices(&self) -> HashMap<String, DeviceState> {
        self.shared
            .devices
            .lock()
            .expect("device state lock poisoned")
            .clone()
    }

    /// Publishes a raw command frame to a device's request topic.
    /// A warning-level no-op when the session is not connected.
    pub async fn publish_command(&self, device_id: &str, frame: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            self.shared
                .logger
                .warning("Cannot send command: MQTT not connected");
            return Ok(());
        }
        self.client
            .publish(
                format!("{device_id}/client/request/data"),
                QoS::AtLeastOnce,
                false,
                frame,
            )
            .await?;
        Ok(())
    }

    /// Publishes a register read sized to the device's Modbus parameters.
    pub async fn request_data_update(
        &self,
        device_id: &str,
        slave_address: u8,
        register_count: u16,
    ) -> Result<()> {
        self.publish_command(device_id, modbus::encode_read(slave_address, register_count))
            .await
    }

    /// Replaces the default decoder for one device with a custom handler.
    pub fn register_message_handler(&self, device_id: &str, handler: MessageHandler) {
        self.shared
            .handlers
            .lock()
            .expect("handler lock poisoned")
            .insert(device_id.to_string(), handler);
    }

    /// Deliberate teardown: suppresses the disconnect callback and gives the
    /// broker a bounded chance to see the DISCONNECT packet.
    pub async fn disconnect(&self) {
        self.shared
            .intentional_disconnect
            .store(true, Ordering::SeqCst);
        self.shared.connected.clear();
        self.shared.data_updated.clear();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.client.disconnect()).await;
        self.shared.logger.debug("MQTT client disconnected");
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        // Abort the event loop task on drop for clean shutdown
        self.event_loop_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::AttrValue;

    fn sensor_payload(soc: u16) -> Vec<u8> {
        let mut payload = vec![0u8; 6];
        for idx in 0..81u16 {
            let value = if idx == 56 { soc } else { 0 };
            payload.extend_from_slice(&value.to_be_bytes());
        }
        payload
    }

    mod client_id {
        use super::*;

        #[test]
        fn has_nonce_and_timestamp_parts() {
            let id = mqtt_client_id();
            let parts: Vec<&str> = id.split('_').collect();
            assert_eq!(parts.len(), 3);
            assert_eq!(parts[0], "client");
            assert_eq!(parts[1].len(), 24);
            assert!(parts[1].chars().all(|c| c.is_ascii_hexdigit()));
            assert!(parts[2].chars().all(|c| c.is_ascii_digit()));
        }

        #[test]
        fn successive_ids_differ() {
            assert_ne!(mqtt_client_id(), mqtt_client_id());
        }
    }

    mod dedup {
        use super::*;

        #[test]
        fn duplicate_within_ttl_is_suppressed() {
            let mut cache = DedupCache::new();
            let now = Instant::now();
            assert!(cache.check_and_insert("t", b"payload", now));
            assert!(!cache.check_and_insert("t", b"payload", now + Duration::from_millis(500)));
        }

        #[test]
        fn same_payload_after_ttl_is_fresh_again() {
            let mut cache = DedupCache::new();
            let now = Instant::now();
            assert!(cache.check_and_insert("t", b"payload", now));
            assert!(cache.check_and_insert("t", b"payload", now + Duration::from_secs(3)));
        }

        #[test]
        fn different_topic_or_payload_is_fresh() {
            let mut cache = DedupCache::new();
            let now = Instant::now();
            assert!(cache.check_and_insert("t1", b"payload", now));
            assert!(cache.check_and_insert("t2", b"payload", now));
            assert!(cache.check_and_insert("t1", b"other", now));
        }

        #[test]
        fn sweep_bounds_cache_size() {
            let mut cache = DedupCache::new();
            let start = Instant::now();
            for i in 0..100 {
                let topic = format!("topic/{i}");
                assert!(cache.check_and_insert(&topic, b"p", start));
            }
            assert_eq!(cache.seen.len(), 100);
            // Past the sweep interval, expired entries are dropped on the
            // next insertion.
            let later = start + DEDUP_SWEEP_INTERVAL + Duration::from_secs(1);
            cache.check_and_insert("fresh", b"p", later);
            assert_eq!(cache.seen.len(), 1);
        }
    }

    mod ingest {
        use super::*;

        const SENSOR_TOPIC: &str = "AABBCC/device/response/client/04";

        #[test]
        fn valid_frame_merges_state_and_signals() {
            let shared = Shared::new();
            let mut dedup = DedupCache::new();
            shared.ingest(&mut dedup, SENSOR_TOPIC, &sensor_payload(750));

            assert!(shared.data_updated.is_set());
            let devices = shared.devices.lock().unwrap();
            assert_eq!(devices["AABBCC"]["soc"], AttrValue::Float(75.0));
        }

        #[test]
        fn duplicate_frame_is_ignored() {
            let shared = Shared::new();
            let mut dedup = DedupCache::new();
            let payload = sensor_payload(750);
            shared.ingest(&mut dedup, SENSOR_TOPIC, &payload);
            shared.data_updated.clear();
            shared.ingest(&mut dedup, SENSOR_TOPIC, &payload);
            assert!(!shared.data_updated.is_set());
        }

        #[test]
        fn short_state_keepalive_is_dropped_silently() {
            let shared = Shared::new();
            let mut dedup = DedupCache::new();
            shared.ingest(&mut dedup, "AABBCC/device/response/state", &[0u8; 4]);
            assert!(!shared.data_updated.is_set());
            assert!(shared.devices.lock().unwrap().is_empty());
        }

        #[test]
        fn under_length_payload_is_dropped() {
            let shared = Shared::new();
            let mut dedup = DedupCache::new();
            shared.ingest(&mut dedup, SENSOR_TOPIC, &[0u8; 7]);
            assert!(!shared.data_updated.is_set());
        }

        #[test]
        fn short_register_frame_is_dropped() {
            let shared = Shared::new();
            let mut dedup = DedupCache::new();
            // 6-byte header + 20 registers: under the 57-register floor
            let mut payload = vec![0u8; 6];
            payload.extend_from_slice(&[0u8; 40]);
            shared.ingest(&mut dedup, SENSOR_TOPIC, &payload);
            assert!(!shared.data_updated.is_set());
        }

        #[test]
        fn custom_handler_bypasses_default_decoder() {
            use std::sync::atomic::AtomicUsize;

            let shared = Shared::new();
            let mut dedup = DedupCache::new();
            let calls = Arc::new(AtomicUsize::new(0));
            let calls_clone = Arc::clone(&calls);
            shared.handlers.lock().unwrap().insert(
                "AABBCC".to_string(),
                Box::new(move |_topic, registers| {
                    assert_eq!(registers.len(), 81);
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                }),
            );

            shared.ingest(&mut dedup, SENSOR_TOPIC, &sensor_payload(500));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            // Default decode path skipped: no state merged, no event
            assert!(!shared.data_updated.is_set());
            assert!(shared.devices.lock().unwrap().is_empty());
        }

        #[test]
        fn updates_accumulate_per_device() {
            let shared = Shared::new();
            let mut dedup = DedupCache::new();
            shared.ingest(&mut dedup, SENSOR_TOPIC, &sensor_payload(750));
            // Second frame with different content must merge, not replace
            shared.ingest(&mut dedup, SENSOR_TOPIC, &sensor_payload(800));
            let devices = shared.devices.lock().unwrap();
            assert_eq!(devices["AABBCC"]["soc"], AttrValue::Float(80.0));
            assert!(devices["AABBCC"].contains_key("usbOutput"));
        }
    }
}
