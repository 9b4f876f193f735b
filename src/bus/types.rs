// Bus wire types
//
// REST bodies use camelCase. Stream payloads arrive in the bus-native
// snake_case and are normalized before they reach these types
// (see stream::normalize).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use super::presence::Presence;

/// Registered presence for one local assistant session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub machine_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
}

impl Agent {
    /// Presence derived from the last heartbeat.
    pub fn presence(&self, now: DateTime<Utc>) -> Presence {
        Presence::derive(self.heartbeat_at, now)
    }
}

/// Body of `POST /agents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgent {
    pub machine_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    pub capabilities: BTreeSet<String>,
}

/// Filters for `GET /agents`.
#[derive(Debug, Clone, Default)]
pub struct AgentQuery {
    pub machine_id: Option<String>,
    pub session_id: Option<String>,
    pub status: Option<Presence>,
    pub limit: Option<u32>,
}

impl AgentQuery {
    pub fn for_machine(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: Some(machine_id.into()),
            ..Default::default()
        }
    }

    pub(crate) fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(machine_id) = &self.machine_id {
            pairs.push(("machine_id", machine_id.clone()));
        }
        if let Some(session_id) = &self.session_id {
            pairs.push(("session_id", session_id.clone()));
        }
        if let Some(status) = self.status {
            pairs.push(("status", status.as_str().to_string()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Agent,
    Project,
    Channel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Command,
    Chat,
    Response,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Command => "command",
            MessageType::Chat => "chat",
            MessageType::Response => "response",
        }
    }
}

/// Message lifecycle: `pending → claimed → delivered`, or `pending → expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Claimed,
    Delivered,
    Expired,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Claimed => "claimed",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub sender_id: String,
    pub target_type: TargetType,
    pub target_address: String,
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Expired || self.expires_at.is_some_and(|at| at <= now)
    }

    /// Thread this message belongs to. A message without a thread id
    /// starts a thread keyed by its own id.
    pub fn thread_key(&self) -> &str {
        self.thread_id.as_deref().unwrap_or(&self.id)
    }
}

/// Body of `POST /messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub sender_id: String,
    pub target_type: TargetType,
    pub target_address: String,
    pub message_type: MessageType,
    pub content: String,
    pub metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn new(
        sender_id: impl Into<String>,
        target_type: TargetType,
        target_address: impl Into<String>,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: None,
            sender_id: sender_id.into(),
            target_type,
            target_address: target_address.into(),
            message_type,
            content: content.into(),
            metadata: Map::new(),
            thread_id: None,
            expires_at: None,
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(36_500));
        self.expires_at = Utc::now().checked_add_signed(ttl);
        self
    }
}

/// Filters for `GET /messages`.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub thread_id: Option<String>,
    pub channel_id: Option<String>,
    pub target_agent_id: Option<String>,
}

impl MessageQuery {
    pub fn thread(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            ..Default::default()
        }
    }

    pub fn channel(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: Some(channel_id.into()),
            ..Default::default()
        }
    }

    pub(crate) fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(thread_id) = &self.thread_id {
            pairs.push(("thread_id", thread_id.clone()));
        }
        if let Some(channel_id) = &self.channel_id {
            pairs.push(("channel_id", channel_id.clone()));
        }
        if let Some(agent_id) = &self.target_agent_id {
            pairs.push(("target_agent_id", agent_id.clone()));
        }
        pairs
    }
}

/// Result of the atomic claim operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller now owns the message.
    Claimed(Message),
    /// Another caller got there first.
    Lost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChannel {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Shared snippet stored on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paste {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPaste {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}
