// Derived agent presence
//
// Presence is never stored on the bus; it is computed from heartbeatAt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Heartbeat age up to which an agent counts as active.
pub const ACTIVE_WINDOW_SECS: i64 = 10;
/// Heartbeat age up to which an agent counts as idle.
pub const IDLE_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Active,
    Idle,
    Offline,
}

impl Presence {
    /// `active` within 10s of the last heartbeat, `idle` within 300s,
    /// otherwise (or with no heartbeat at all) `offline`.
    pub fn derive(heartbeat_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let Some(at) = heartbeat_at else {
            return Presence::Offline;
        };
        // Clock skew can put a fresh heartbeat slightly in the future.
        let age = (now - at).num_seconds().max(0);
        if age <= ACTIVE_WINDOW_SECS {
            Presence::Active
        } else if age <= IDLE_WINDOW_SECS {
            Presence::Idle
        } else {
            Presence::Offline
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Active => "active",
            Presence::Idle => "idle",
            Presence::Offline => "offline",
        }
    }
}

impl std::fmt::Display for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
