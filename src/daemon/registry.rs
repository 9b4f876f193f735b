// Agent registry: the agents this daemon registered on the bus.
//
// Single writer (the discovery reconciler). The router and the status
// server only read snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::bus::Agent;
use crate::session::LocalSession;

/// A registered agent and the local session it stands for.
#[derive(Debug, Clone)]
pub struct LocalAgent {
    pub agent: Agent,
    pub session: LocalSession,
}

#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, LocalAgent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, entry: LocalAgent) {
        let mut agents = self.agents.write().await;
        agents.insert(entry.agent.id.clone(), entry);
        crate::metrics::METRICS.registered_agents.set(agents.len() as i64);
    }

    pub async fn remove(&self, agent_id: &str) -> Option<LocalAgent> {
        let mut agents = self.agents.write().await;
        let removed = agents.remove(agent_id);
        crate::metrics::METRICS.registered_agents.set(agents.len() as i64);
        removed
    }

    pub async fn get(&self, agent_id: &str) -> Option<LocalAgent> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn by_session(&self, session_id: &str) -> Option<LocalAgent> {
        self.agents
            .read()
            .await
            .values()
            .find(|entry| entry.agent.session_id == session_id)
            .cloned()
    }

    /// Registered agents, ordered by registration time then id so target
    /// resolution is deterministic.
    pub async fn agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .read()
            .await
            .values()
            .map(|entry| entry.agent.clone())
            .collect();
        agents.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        agents
    }

    pub async fn agent_ids(&self) -> Vec<String> {
        self.agents.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}
