//! Polling façade over the connector.
//!
//! Owns the connector, refreshes the device map on a fixed interval, and
//! keeps the last good map around so a single failed poll does not blank out
//! every consumer. A health-check task forces a reconnection when updates
//! stop arriving for too long.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::connector::Connector;
use crate::error::Result;
use crate::logger::SmartLogger;
use crate::modbus::{Command, DeviceState};
use crate::signal::Signal;

/// Default refresh cadence.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// Hard ceiling on one poll, on top of the connector's own bounds.
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive failed refreshes before a background reconnection.
const FAILED_UPDATES_BEFORE_RECONNECT: u32 = 2;

/// Health check cadence and the staleness it acts on.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const STALE_THRESHOLD: Duration = Duration::from_secs(300);

struct CoordinatorState {
    connector: Connector,
    logger: SmartLogger,
    update_interval: Duration,
    shutdown: Signal,
    /// Last non-empty device map, served while a refresh fails.
    data: Mutex<HashMap<String, DeviceState>>,
    last_data_hash: Mutex<Option<u64>>,
    failed_updates: AtomicU32,
    last_successful_update: Mutex<Instant>,
    /// Coordinator-level flag; the connector's gate provides the real
    /// mutual exclusion, this only stops redundant triggers.
    reconnection_in_progress: AtomicBool,
    /// Back-reference for tasks spawned off `&self` paths.
    self_weak: std::sync::Weak<CoordinatorState>,
}

/// Periodic poll driver and cached-state holder for upper layers.
pub struct Coordinator {
    state: Arc<CoordinatorState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Builds a coordinator around a fresh connector. Must be called inside
    /// a Tokio runtime.
    pub fn new(username: &str, password: &str, developer_mode: bool, update_interval: Duration) -> Self {
        Self {
            state: Arc::new_cyclic(|self_weak| CoordinatorState {
                connector: Connector::new(username, password, developer_mode),
                logger: SmartLogger::new("sydpower::coordinator"),
                update_interval,
                shutdown: Signal::new(false),
                data: Mutex::new(HashMap::new()),
                last_data_hash: Mutex::new(None),
                failed_updates: AtomicU32::new(0),
                last_successful_update: Mutex::new(Instant::now()),
                reconnection_in_progress: AtomicBool::new(false),
                self_weak: self_weak.clone(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connects and starts the health-check and polling tasks.
    pub async fn start(&self) -> Result<()> {
        self.state.connector.connect().await?;
        *self
            .state
            .last_successful_update
            .lock()
            .expect("timestamp lock poisoned") = Instant::now();

        let health_state = Arc::clone(&self.state);
        let poll_state = Arc::clone(&self.state);
        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        tasks.push(tokio::spawn(async move {
            health_state.health_check_loop().await;
        }));
        tasks.push(tokio::spawn(async move {
            poll_state.poll_loop().await;
        }));
        Ok(())
    }

    /// Connects without starting background tasks (one-shot use).
    pub async fn connect(&self) -> Result<()> {
        self.state.connector.connect().await
    }

    /// One refresh cycle; returns the freshest map available (possibly the
    /// previous cache when this poll failed).
    pub async fn refresh(&self) -> HashMap<String, DeviceState> {
        self.state.refresh().await
    }

    /// Last good device map without touching the network.
    pub fn data(&self) -> HashMap<String, DeviceState> {
        self.state.data.lock().expect("data lock poisoned").clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.connector.is_connected()
    }

    /// Runs a device command through the connector.
    pub async fn run_command(&self, device_id: &str, command: Command) -> Result<()> {
        self.state.connector.run_command(device_id, command).await
    }

    /// Stops background tasks and disconnects.
    pub async fn shutdown(&self) {
        self.state.logger.debug("Shutting down coordinator");
        self.state.shutdown.set();
        let tasks: Vec<JoinHandle<()>> =
            self.tasks.lock().expect("task lock poisoned").drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.state.connector.disconnect().await;
        self.state.logger.debug("Coordinator shutdown complete");
    }
}

impl CoordinatorState {
    async fn refresh(&self) -> HashMap<String, DeviceState> {
        if self.reconnection_in_progress.load(Ordering::SeqCst) {
            self.logger
                .debug("Reconnection in progress, skipping data update");
            return self.cached();
        }

        let started = Instant::now();
        let data = match tokio::time::timeout(POLL_TIMEOUT, self.connector.poll()).await {
            Ok(data) => data,
            Err(_) => {
                self.logger.error("Timeout waiting for data");
                HashMap::new()
            }
        };
        self.logger.status(
            "refresh",
            &format!(
                "Finished fetching data in {:.3} seconds (success: {})",
                started.elapsed().as_secs_f64(),
                !data.is_empty()
            ),
        );

        if data.is_empty() {
            let failures = self.failed_updates.fetch_add(1, Ordering::SeqCst) + 1;
            self.logger.warning(&format!(
                "Data fetch returned empty data. Failed updates: {failures}"
            ));
            if failures >= FAILED_UPDATES_BEFORE_RECONNECT
                && !self.reconnection_in_progress.load(Ordering::SeqCst)
            {
                self.trigger_reconnection();
            }
            return self.cached();
        }

        self.log_data_change(&data);
        self.failed_updates.store(0, Ordering::SeqCst);
        *self
            .last_successful_update
            .lock()
            .expect("timestamp lock poisoned") = Instant::now();
        *self.data.lock().expect("data lock poisoned") = data.clone();
        data
    }

    fn cached(&self) -> HashMap<String, DeviceState> {
        let cached = self.data.lock().expect("data lock poisoned").clone();
        if !cached.is_empty() {
            self.logger.debug("Using cached data due to fetch failure");
        }
        cached
    }

    /// Debug aid: one line when the map content changes, silence otherwise.
    fn log_data_change(&self, data: &HashMap<String, DeviceState>) {
        let hash = state_hash(data);
        let mut last = self.last_data_hash.lock().expect("hash lock poisoned");
        if *last == Some(hash) {
            self.logger.status("data-change", "Data unchanged from previous update");
        } else {
            *last = Some(hash);
            let mut keys: Vec<&String> = data.keys().collect();
            keys.sort();
            self.logger
                .status("data-change", &format!("Data received for devices: {keys:?}"));
        }
    }

    fn trigger_reconnection(&self) {
        self.logger
            .warning("Multiple consecutive update failures, initiating reconnection");
        self.reconnection_in_progress.store(true, Ordering::SeqCst);

        let connector = self.connector.clone();
        let state = self.self_weak.clone();
        tokio::spawn(async move {
            let success = connector.reconnect().await;
            if let Some(state) = state.upgrade() {
                if success {
                    state.logger.info("Reconnection successful");
                    state.refresh().await;
                } else {
                    state.logger.error("Reconnection failed");
                }
                state
                    .reconnection_in_progress
                    .store(false, Ordering::SeqCst);
            }
        });
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = self.shutdown.wait() => break,
                () = tokio::time::sleep(self.update_interval) => {
                    self.refresh().await;
                }
            }
        }
    }

    async fn health_check_loop(self: Arc<Self>) {
        self.logger.info("Health check loop started");
        loop {
            tokio::select! {
                () = self.shutdown.wait() => break,
                () = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {
                    let stale = self
                        .last_successful_update
                        .lock()
                        .expect("timestamp lock poisoned")
                        .elapsed();
                    if stale > STALE_THRESHOLD
                        && !self.reconnection_in_progress.load(Ordering::SeqCst)
                    {
                        self.logger.warning(&format!(
                            "No successful updates in {:.1} seconds, forcing reconnection",
                            stale.as_secs_f64()
                        ));
                        self.trigger_reconnection();
                    }
                }
            }
        }
        self.logger.debug("Health check loop exited");
    }
}

/// Order-independent hash of the device map, for change detection only.
fn state_hash(data: &HashMap<String, DeviceState>) -> u64 {
    let ordered: BTreeMap<&String, BTreeMap<&String, String>> = data
        .iter()
        .map(|(device, state)| {
            (
                device,
                state
                    .iter()
                    .map(|(key, value)| (key, format!("{value:?}")))
                    .collect(),
            )
        })
        .collect();
    let mut hasher = DefaultHasher::new();
    ordered.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::AttrValue;

    fn sample_map(soc: f64) -> HashMap<String, DeviceState> {
        let mut state = DeviceState::new();
        state.insert("soc".to_string(), AttrValue::Float(soc));
        state.insert("usbOutput".to_string(), AttrValue::Bool(true));
        let mut map = HashMap::new();
        map.insert("AABBCC".to_string(), state);
        map
    }

    mod change_detection {
        use super::*;

        #[test]
        fn equal_maps_hash_equal() {
            assert_eq!(state_hash(&sample_map(75.0)), state_hash(&sample_map(75.0)));
        }

        #[test]
        fn different_maps_hash_differently() {
            assert_ne!(state_hash(&sample_map(75.0)), state_hash(&sample_map(80.0)));
        }

        #[test]
        fn hash_ignores_insertion_order() {
            let mut a = DeviceState::new();
            a.insert("x".to_string(), AttrValue::Int(1));
            a.insert("y".to_string(), AttrValue::Int(2));
            let mut b = DeviceState::new();
            b.insert("y".to_string(), AttrValue::Int(2));
            b.insert("x".to_string(), AttrValue::Int(1));

            let mut map_a = HashMap::new();
            map_a.insert("d".to_string(), a);
            let mut map_b = HashMap::new();
            map_b.insert("d".to_string(), b);
            assert_eq!(state_hash(&map_a), state_hash(&map_b));
        }
    }

    mod caching {
        use super::*;

        #[tokio::test]
        async fn cached_data_survives_between_reads() {
            let coordinator = Coordinator::new("u", "p", false, DEFAULT_UPDATE_INTERVAL);
            *coordinator.state.data.lock().unwrap() = sample_map(42.0);
            let data = coordinator.data();
            assert_eq!(data["AABBCC"]["soc"], AttrValue::Float(42.0));
        }

        #[tokio::test]
        async fn failed_update_counter_starts_at_zero() {
            let coordinator = Coordinator::new("u", "p", false, DEFAULT_UPDATE_INTERVAL);
            assert_eq!(coordinator.state.failed_updates.load(Ordering::SeqCst), 0);
            assert!(!coordinator
                .state
                .reconnection_in_progress
                .load(Ordering::SeqCst));
        }
    }
}
