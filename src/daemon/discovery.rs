// Discovery reconciler
//
// Every tick:
//   1. ask the SessionSource which local sessions are active
//   2. diff against the registry (the agents this daemon registered)
//   3. register new sessions, deregister stale ones, start/stop heartbeats
//   4. clean up remote agents under this machine id that the registry does
//      not know about (adopt if their session is still active)
//   5. restart the event stream if it is not connected
//
// The reconciler is the only writer of the registry.

use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::heartbeat::HeartbeatScheduler;
use super::registry::{AgentRegistry, LocalAgent};
use crate::bus::{Agent, AgentQuery, BusApi, RegisterAgent};
use crate::session::{LocalSession, SessionSource};
use crate::stream::StreamConnection;

/// What one reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub registered: Vec<String>,
    pub adopted: Vec<String>,
    pub deregistered: Vec<String>,
    pub orphans_removed: Vec<String>,
    pub stream_restarted: bool,
    pub errors: usize,
}

impl ReconcileReport {
    pub fn is_quiet(&self) -> bool {
        self.registered.is_empty()
            && self.adopted.is_empty()
            && self.deregistered.is_empty()
            && self.orphans_removed.is_empty()
            && !self.stream_restarted
            && self.errors == 0
    }
}

pub struct DiscoveryReconciler {
    bus: Arc<dyn BusApi>,
    machine_id: String,
    sessions: Arc<dyn SessionSource>,
    registry: AgentRegistry,
    heartbeats: Arc<HeartbeatScheduler>,
    stream: Arc<StreamConnection>,
    interval: Duration,
}

impl DiscoveryReconciler {
    pub fn new(
        bus: Arc<dyn BusApi>,
        machine_id: impl Into<String>,
        sessions: Arc<dyn SessionSource>,
        registry: AgentRegistry,
        heartbeats: Arc<HeartbeatScheduler>,
        stream: Arc<StreamConnection>,
        interval: Duration,
    ) -> Self {
        Self {
            bus,
            machine_id: machine_id.into(),
            sessions,
            registry,
            heartbeats,
            stream,
            interval,
        }
    }

    /// Run reconcile passes every interval until cancelled. The first pass
    /// runs immediately.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.reconcile_once().await;
                        if report.is_quiet() {
                            debug!("discovery tick: no changes");
                        } else {
                            info!(
                                registered = report.registered.len(),
                                adopted = report.adopted.len(),
                                deregistered = report.deregistered.len(),
                                orphans_removed = report.orphans_removed.len(),
                                stream_restarted = report.stream_restarted,
                                errors = report.errors,
                                "discovery tick"
                            );
                        }
                    }
                }
            }
            debug!("discovery loop stopped");
        })
    }

    /// One full reconcile pass. Failures are counted, logged and retried on
    /// the next pass.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        match self.sessions.active_sessions().await {
            Ok(sessions) => self.reconcile_sessions(sessions, &mut report).await,
            Err(e) => {
                warn!(error = %e, "session discovery failed; keeping current registrations");
                report.errors += 1;
            }
        }

        self.ensure_heartbeats().await;
        report.stream_restarted = self.check_stream().await;
        report
    }

    async fn reconcile_sessions(&self, sessions: Vec<LocalSession>, report: &mut ReconcileReport) {
        let active: HashMap<String, LocalSession> = sessions
            .into_iter()
            .map(|s| (s.session_id.clone(), s))
            .collect();

        let remote = match self
            .bus
            .list_agents(&AgentQuery::for_machine(self.machine_id.clone()))
            .await
        {
            Ok(agents) => Some(agents),
            Err(e) => {
                warn!(error = %e, "could not list remote agents for this machine");
                report.errors += 1;
                None
            }
        };

        let known_ids: HashSet<String> = self.registry.agent_ids().await.into_iter().collect();
        let known_sessions: HashSet<String> = self
            .registry
            .agents()
            .await
            .into_iter()
            .map(|a| a.session_id)
            .collect();

        // Stale: registered here, session gone.
        for agent in self.registry.agents().await {
            if !active.contains_key(&agent.session_id) {
                match self.retire(&agent.id).await {
                    Ok(()) => report.deregistered.push(agent.id),
                    Err(e) => {
                        warn!(agent_id = %agent.id, error = %e, "deregistration failed; will retry");
                        report.errors += 1;
                    }
                }
            }
        }

        // Remote agents under this machine id that the registry does not own.
        let mut adoptable: HashMap<String, Agent> = HashMap::new();
        for agent in remote.into_iter().flatten() {
            if known_ids.contains(&agent.id) || agent.machine_id != self.machine_id {
                continue;
            }
            let session_is_live = active.contains_key(&agent.session_id)
                && !known_sessions.contains(&agent.session_id)
                && !adoptable.contains_key(&agent.session_id);
            if session_is_live {
                adoptable.insert(agent.session_id.clone(), agent);
                continue;
            }
            match self.bus.deregister_agent(&agent.id).await {
                Ok(()) => {
                    info!(agent_id = %agent.id, session_id = %agent.session_id, "removed orphaned agent");
                    report.orphans_removed.push(agent.id);
                }
                Err(e) => {
                    warn!(agent_id = %agent.id, error = %e, "failed to remove orphaned agent");
                    report.errors += 1;
                }
            }
        }

        // New sessions: adopt an existing registration or register fresh.
        let mut new_sessions: Vec<&LocalSession> = active
            .values()
            .filter(|s| !known_sessions.contains(&s.session_id))
            .collect();
        new_sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        for session in new_sessions {
            if let Some(agent) = adoptable.remove(&session.session_id) {
                info!(agent_id = %agent.id, session_id = %session.session_id, "adopted existing registration");
                self.track(agent.clone(), session.clone()).await;
                report.adopted.push(agent.id);
                continue;
            }

            let request = RegisterAgent {
                machine_id: self.machine_id.clone(),
                session_id: session.session_id.clone(),
                session_name: session.session_name.clone(),
                project_path: session.project_path.clone(),
                capabilities: session.capabilities.clone(),
            };
            match self.bus.register_agent(&request).await {
                Ok(agent) => {
                    info!(agent_id = %agent.id, session_id = %session.session_id, "registered agent");
                    report.registered.push(agent.id.clone());
                    self.track(agent, session.clone()).await;
                }
                Err(e) => {
                    warn!(session_id = %session.session_id, error = %e, "registration failed; will retry");
                    report.errors += 1;
                }
            }
        }
    }

    async fn track(&self, agent: Agent, session: LocalSession) {
        let agent_id = agent.id.clone();
        self.registry.insert(LocalAgent { agent, session }).await;
        self.heartbeats.start(&agent_id).await;
    }

    /// Stop the heartbeat, then deregister, then forget. A failed
    /// deregistration keeps the entry so the next pass retries it.
    async fn retire(&self, agent_id: &str) -> Result<()> {
        self.heartbeats.stop(agent_id).await;
        match self.bus.deregister_agent(agent_id).await {
            Ok(()) => {}
            // Already gone on the bus side.
            Err(e) if e.status() == Some(404) => {}
            Err(e) => {
                self.heartbeats.start(agent_id).await;
                return Err(e.into());
            }
        }
        self.registry.remove(agent_id).await;
        info!(agent_id, "deregistered agent");
        Ok(())
    }

    async fn ensure_heartbeats(&self) {
        for agent_id in self.registry.agent_ids().await {
            if !self.heartbeats.is_running(&agent_id).await {
                self.heartbeats.start(&agent_id).await;
            }
        }
    }

    /// Daemon-level backstop for a dead stream. A live read loop is left
    /// alone while it connects or backs off, so its attempt counter keeps
    /// growing toward the maximum delay.
    async fn check_stream(&self) -> bool {
        let health = self.stream.health();
        if health.connected || self.stream.is_running().await {
            return false;
        }
        info!(state = ?health.state, "event stream not connected; restarting it");
        self.stream.disconnect().await;
        self.stream.connect().await;
        true
    }

    /// Deregister every agent in the registry. Heartbeats must already be
    /// stopped. Used at shutdown.
    pub async fn deregister_all(&self) -> Vec<String> {
        let mut removed = Vec::new();
        for agent_id in self.registry.agent_ids().await {
            match self.bus.deregister_agent(&agent_id).await {
                Ok(()) => info!(agent_id = %agent_id, "deregistered agent"),
                Err(e) => warn!(agent_id = %agent_id, error = %e, "deregistration at shutdown failed"),
            }
            self.registry.remove(&agent_id).await;
            removed.push(agent_id);
        }
        removed
    }
}
