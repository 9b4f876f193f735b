// Heartbeat scheduler
//
// One independently ticking task per registered agent. A failed refresh is
// logged and retried on the next tick; it never stops the loop or touches
// the registry. Staleness is derived by the bus from heartbeatAt.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::bus::BusApi;
use crate::metrics::record_heartbeat;

/// Consecutive auth failures after which every failure is logged at error.
pub const AUTH_FAILURE_ALERT_THRESHOLD: u32 = 3;

struct HeartbeatLoop {
    interval: Duration,
    handle: JoinHandle<()>,
}

pub struct HeartbeatScheduler {
    bus: Arc<dyn BusApi>,
    interval: Duration,
    loops: Mutex<HashMap<String, HeartbeatLoop>>,
    auth_failures: Arc<DashMap<String, u32>>,
}

impl HeartbeatScheduler {
    pub fn new(bus: Arc<dyn BusApi>, interval: Duration) -> Self {
        Self {
            bus,
            interval,
            loops: Mutex::new(HashMap::new()),
            auth_failures: Arc::new(DashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the loop for `agent_id`. Returns false if one is already running.
    pub async fn start(&self, agent_id: &str) -> bool {
        let mut loops = self.loops.lock().await;
        if let Some(existing) = loops.get(agent_id) {
            if !existing.handle.is_finished() {
                return false;
            }
        }

        let handle = tokio::spawn(run_loop(
            self.bus.clone(),
            agent_id.to_string(),
            self.interval,
            self.auth_failures.clone(),
        ));
        loops.insert(
            agent_id.to_string(),
            HeartbeatLoop {
                interval: self.interval,
                handle,
            },
        );
        debug!(agent_id, interval_ms = self.interval.as_millis() as u64, "heartbeat loop started");
        true
    }

    /// Stop the loop for `agent_id`. Returns false if none was running.
    pub async fn stop(&self, agent_id: &str) -> bool {
        let removed = self.loops.lock().await.remove(agent_id);
        self.auth_failures.remove(agent_id);
        match removed {
            Some(heartbeat) => {
                heartbeat.handle.abort();
                let _ = heartbeat.handle.await;
                debug!(agent_id, "heartbeat loop stopped");
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<(String, HeartbeatLoop)> = self.loops.lock().await.drain().collect();
        for (agent_id, heartbeat) in drained {
            heartbeat.handle.abort();
            let _ = heartbeat.handle.await;
            debug!(agent_id = %agent_id, "heartbeat loop stopped");
        }
        self.auth_failures.clear();
    }

    pub async fn is_running(&self, agent_id: &str) -> bool {
        self.loops
            .lock()
            .await
            .get(agent_id)
            .is_some_and(|l| !l.handle.is_finished())
    }

    pub async fn active_count(&self) -> usize {
        self.loops
            .lock()
            .await
            .values()
            .filter(|l| !l.handle.is_finished())
            .count()
    }

    /// Interval of the running loop for `agent_id`.
    pub async fn loop_interval(&self, agent_id: &str) -> Option<Duration> {
        self.loops.lock().await.get(agent_id).map(|l| l.interval)
    }

    /// Current consecutive auth-failure count for `agent_id`.
    pub fn auth_failures(&self, agent_id: &str) -> u32 {
        self.auth_failures.get(agent_id).map(|c| *c).unwrap_or(0)
    }
}

async fn run_loop(
    bus: Arc<dyn BusApi>,
    agent_id: String,
    period: Duration,
    auth_failures: Arc<DashMap<String, u32>>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Registration itself set heartbeatAt; the first refresh is one period later.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match bus.heartbeat(&agent_id).await {
            Ok(_) => {
                record_heartbeat("ok");
                if auth_failures.remove(&agent_id).is_some() {
                    debug!(agent_id = %agent_id, "heartbeat recovered after auth failures");
                }
            }
            Err(e) if e.is_auth() => {
                record_heartbeat("unauthorized");
                let count = {
                    let mut entry = auth_failures.entry(agent_id.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if count >= AUTH_FAILURE_ALERT_THRESHOLD {
                    error!(
                        agent_id = %agent_id,
                        consecutive_failures = count,
                        error = %e,
                        "heartbeat repeatedly rejected by the bus; check the project credential"
                    );
                } else {
                    warn!(agent_id = %agent_id, consecutive_failures = count, error = %e, "heartbeat rejected");
                }
            }
            Err(e) => {
                record_heartbeat("failed");
                warn!(agent_id = %agent_id, error = %e, "heartbeat failed, retrying next tick");
            }
        }
    }
}
