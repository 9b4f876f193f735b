// Shared test fixtures: an in-memory bus with an atomic claim, scripted
// event streams and call recording.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use serde_json::json;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use agentlink::bus::{
    Agent, AgentQuery, BusApi, BusError, BusResult, Channel, ClaimOutcome, EventByteStream,
    Message, MessageQuery, MessageStatus, NewChannel, NewMessage, NewPaste, Paste, RegisterAgent,
};

pub type ChunkSender = mpsc::UnboundedSender<BusResult<Vec<u8>>>;

enum StreamScript {
    Open(mpsc::UnboundedReceiver<BusResult<Vec<u8>>>),
    Fail(BusError),
}

#[derive(Default)]
struct State {
    agents: BTreeMap<String, Agent>,
    messages: Vec<Message>,
    channels: BTreeMap<String, Channel>,
    pastes: BTreeMap<String, Paste>,
    calls: Vec<String>,
    next_id: u64,
    failing_deregistrations: HashSet<String>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// In-memory bus. Claims are decided under one lock, so concurrent
/// claimers see exactly one winner.
#[derive(Default)]
pub struct FakeBus {
    state: Mutex<State>,
    streams: Mutex<VecDeque<StreamScript>>,
    heartbeat_unauthorized: AtomicBool,
    probe_fails: AtomicBool,
    probes: AtomicUsize,
    stream_opens: AtomicUsize,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().unwrap().calls.push(call.into());
    }

    /// Every call made so far, e.g. `"claim m1 agent-1"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn insert_message(&self, message: Message) {
        self.state.lock().unwrap().messages.push(message);
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().unwrap().messages.clone()
    }

    pub fn insert_agent(&self, agent: Agent) {
        self.state
            .lock()
            .unwrap()
            .agents
            .insert(agent.id.clone(), agent);
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.state.lock().unwrap().agents.values().cloned().collect()
    }

    pub fn fail_deregistration(&self, agent_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_deregistrations
            .insert(agent_id.to_string());
    }

    pub fn set_heartbeat_unauthorized(&self, on: bool) {
        self.heartbeat_unauthorized.store(on, Ordering::SeqCst);
    }

    pub fn set_probe_fails(&self, on: bool) {
        self.probe_fails.store(on, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn stream_opens(&self) -> usize {
        self.stream_opens.load(Ordering::SeqCst)
    }

    /// Queue a stream for the next `open_stream`; feed it through the
    /// returned sender. Dropping the sender ends the stream.
    pub fn script_stream(&self) -> ChunkSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push_back(StreamScript::Open(rx));
        tx
    }

    pub fn script_stream_failure(&self, error: BusError) {
        self.streams.lock().unwrap().push_back(StreamScript::Fail(error));
    }
}

#[async_trait]
impl BusApi for FakeBus {
    async fn register_agent(&self, request: &RegisterAgent) -> BusResult<Agent> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id("agent");
        state.calls.push(format!("register {}", request.session_id));
        let now = Utc::now();
        let agent = Agent {
            id: id.clone(),
            machine_id: request.machine_id.clone(),
            session_id: request.session_id.clone(),
            session_name: request.session_name.clone(),
            project_path: request.project_path.clone(),
            capabilities: request.capabilities.clone(),
            heartbeat_at: Some(now),
            registered_at: Some(now),
        };
        state.agents.insert(id, agent.clone());
        Ok(agent)
    }

    async fn heartbeat(&self, agent_id: &str) -> BusResult<Agent> {
        self.record(format!("heartbeat {}", agent_id));
        if self.heartbeat_unauthorized.load(Ordering::SeqCst) {
            return Err(unauthorized("PATCH", &format!("/agents/{}/heartbeat", agent_id)));
        }
        let mut state = self.state.lock().unwrap();
        match state.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.heartbeat_at = Some(Utc::now());
                Ok(agent.clone())
            }
            None => Err(not_found("PATCH", &format!("/agents/{}/heartbeat", agent_id))),
        }
    }

    async fn deregister_agent(&self, agent_id: &str) -> BusResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("deregister {}", agent_id));
        if state.failing_deregistrations.contains(agent_id) {
            return Err(BusError::Http {
                method: "DELETE",
                endpoint: format!("/agents/{}", agent_id),
                status: 500,
                body: "boom".to_string(),
            });
        }
        match state.agents.remove(agent_id) {
            Some(_) => Ok(()),
            None => Err(not_found("DELETE", &format!("/agents/{}", agent_id))),
        }
    }

    async fn list_agents(&self, query: &AgentQuery) -> BusResult<Vec<Agent>> {
        self.record("list_agents");
        let state = self.state.lock().unwrap();
        Ok(state
            .agents
            .values()
            .filter(|a| query.machine_id.as_ref().map_or(true, |m| &a.machine_id == m))
            .filter(|a| query.session_id.as_ref().map_or(true, |s| &a.session_id == s))
            .cloned()
            .collect())
    }

    async fn send_message(&self, message: &NewMessage) -> BusResult<Message> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id("msg");
        state.calls.push(format!("send {}", id));
        // Strictly increasing timestamps keep thread order deterministic.
        let created_at = Utc::now() + ChronoDuration::milliseconds(state.next_id as i64);
        let stored = Message {
            id,
            channel_id: message.channel_id.clone(),
            sender_id: message.sender_id.clone(),
            target_type: message.target_type,
            target_address: message.target_address.clone(),
            message_type: message.message_type,
            content: message.content.clone(),
            metadata: message.metadata.clone(),
            status: MessageStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            thread_id: message.thread_id.clone(),
            created_at: Some(created_at),
            expires_at: message.expires_at,
        };
        state.messages.push(stored.clone());
        Ok(stored)
    }

    async fn claim_message(&self, message_id: &str, agent_id: &str) -> BusResult<ClaimOutcome> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("claim {} {}", message_id, agent_id));
        let Some(message) = state.messages.iter_mut().find(|m| m.id == message_id) else {
            return Err(not_found("PATCH", &format!("/messages/{}/claim", message_id)));
        };
        if message.status != MessageStatus::Pending {
            return Ok(ClaimOutcome::Lost);
        }
        message.status = MessageStatus::Claimed;
        message.claimed_by = Some(agent_id.to_string());
        message.claimed_at = Some(Utc::now());
        Ok(ClaimOutcome::Claimed(message.clone()))
    }

    async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> BusResult<Message> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("status {} {}", message_id, status.as_str()));
        let Some(message) = state.messages.iter_mut().find(|m| m.id == message_id) else {
            return Err(not_found("PATCH", &format!("/messages/{}/status", message_id)));
        };
        message.status = status;
        Ok(message.clone())
    }

    async fn get_message(&self, message_id: &str) -> BusResult<Message> {
        self.record(format!("get_message {}", message_id));
        self.message(message_id)
            .ok_or_else(|| not_found("GET", &format!("/messages/{}", message_id)))
    }

    async fn list_messages(&self, query: &MessageQuery) -> BusResult<Vec<Message>> {
        self.record("list_messages");
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .iter()
            .filter(|m| {
                query
                    .thread_id
                    .as_deref()
                    .map_or(true, |t| m.thread_id.as_deref() == Some(t))
            })
            .filter(|m| {
                query
                    .channel_id
                    .as_deref()
                    .map_or(true, |c| m.channel_id.as_deref() == Some(c))
            })
            .cloned()
            .collect())
    }

    async fn create_channel(&self, channel: &NewChannel) -> BusResult<Channel> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id("chan");
        let created = Channel {
            id: id.clone(),
            name: channel.name.clone(),
            description: channel.description.clone(),
            created_at: Some(Utc::now()),
        };
        state.channels.insert(id, created.clone());
        Ok(created)
    }

    async fn list_channels(&self) -> BusResult<Vec<Channel>> {
        Ok(self.state.lock().unwrap().channels.values().cloned().collect())
    }

    async fn get_channel(&self, channel_id: &str) -> BusResult<Channel> {
        self.state
            .lock()
            .unwrap()
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| not_found("GET", &format!("/channels/{}", channel_id)))
    }

    async fn delete_channel(&self, channel_id: &str) -> BusResult<()> {
        self.state
            .lock()
            .unwrap()
            .channels
            .remove(channel_id)
            .map(|_| ())
            .ok_or_else(|| not_found("DELETE", &format!("/channels/{}", channel_id)))
    }

    async fn create_paste(&self, paste: &NewPaste) -> BusResult<Paste> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id("paste");
        let created = Paste {
            id: id.clone(),
            content: paste.content.clone(),
            created_by: paste.created_by.clone(),
            created_at: Some(Utc::now()),
            expires_at: None,
        };
        state.pastes.insert(id, created.clone());
        Ok(created)
    }

    async fn get_paste(&self, paste_id: &str) -> BusResult<Paste> {
        self.state
            .lock()
            .unwrap()
            .pastes
            .get(paste_id)
            .cloned()
            .ok_or_else(|| not_found("GET", &format!("/pastes/{}", paste_id)))
    }

    async fn open_stream(
        &self,
        machine_id: &str,
        cursor: Option<&str>,
    ) -> BusResult<EventByteStream> {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        self.record(format!("open_stream {} {}", machine_id, cursor.unwrap_or("-")));
        let script = self.streams.lock().unwrap().pop_front();
        match script {
            Some(StreamScript::Open(rx)) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            })
            .boxed()),
            Some(StreamScript::Fail(error)) => Err(error),
            // Nothing scripted: an open stream that never says anything.
            None => Ok(futures::stream::pending().boxed()),
        }
    }

    async fn probe(&self, _machine_id: &str) -> BusResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_fails.load(Ordering::SeqCst) {
            return Err(BusError::Http {
                method: "GET",
                endpoint: "/agents".to_string(),
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

pub fn unavailable(method: &'static str, endpoint: &str) -> BusError {
    BusError::Http {
        method,
        endpoint: endpoint.to_string(),
        status: 503,
        body: "unavailable".to_string(),
    }
}

pub fn unauthorized(method: &'static str, endpoint: &str) -> BusError {
    BusError::Unauthorized {
        method,
        endpoint: endpoint.to_string(),
        status: 401,
    }
}

pub fn not_found(method: &'static str, endpoint: &str) -> BusError {
    BusError::Http {
        method,
        endpoint: endpoint.to_string(),
        status: 404,
        body: "not found".to_string(),
    }
}

/// A pending message as the stream would deliver it.
pub fn pending_message(id: &str, target: &str, mode: &str) -> Message {
    serde_json::from_value(json!({
        "id": id,
        "senderId": "agentA",
        "targetType": if target.starts_with("channel://") { "channel" } else { "agent" },
        "targetAddress": target,
        "messageType": "command",
        "content": "ping",
        "metadata": {"deliveryMode": mode},
        "status": "pending",
        "threadId": "t1",
        "createdAt": "2026-01-01T00:00:00Z"
    }))
    .unwrap()
}

pub fn agent(id: &str, machine_id: &str, session_id: &str) -> Agent {
    Agent {
        id: id.to_string(),
        machine_id: machine_id.to_string(),
        session_id: session_id.to_string(),
        session_name: None,
        project_path: None,
        capabilities: Default::default(),
        heartbeat_at: Some(Utc::now()),
        registered_at: Some(Utc::now()),
    }
}

/// One `insert` record carrying `message` as a snake_case row.
pub fn insert_record(event_id: u64, message: &Message) -> Vec<u8> {
    let row = json!({
        "id": message.id,
        "sender_id": message.sender_id,
        "target_type": message.target_type,
        "target_address": message.target_address,
        "message_type": message.message_type,
        "content": message.content,
        "metadata": message.metadata,
        "status": message.status,
        "thread_id": message.thread_id,
        "channel_id": message.channel_id,
    });
    let envelope = json!({"id": message.id, "data": row, "ts": "2026-01-01T00:00:00Z"});
    format!("event: insert\nid: {}\ndata: {}\n\n", event_id, envelope).into_bytes()
}
