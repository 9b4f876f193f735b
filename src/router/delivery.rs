// Delivery mode classification
//
// `metadata.deliveryMode` is a loosely typed field on the wire. It is read
// into a closed variant here; absence means push, anything unrecognized is
// rejected rather than guessed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub const DELIVERY_MODE_KEY: &str = "deliveryMode";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Route to one local handler and reply.
    Push,
    /// Write to the local inbox for the target to read later.
    Pull,
    /// Not routed; readers list the channel themselves.
    Broadcast,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Push => "push",
            DeliveryMode::Pull => "pull",
            DeliveryMode::Broadcast => "broadcast",
        }
    }

    /// Read the mode from a message's metadata.
    pub fn classify(metadata: &Map<String, Value>) -> Result<Self, UnknownDeliveryMode> {
        match metadata.get(DELIVERY_MODE_KEY) {
            None | Some(Value::Null) => Ok(DeliveryMode::Push),
            Some(Value::String(raw)) => raw.parse(),
            Some(other) => Err(UnknownDeliveryMode(other.to_string())),
        }
    }
}

impl Default for DeliveryMode {
    fn default() -> Self {
        DeliveryMode::Push
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown delivery mode '{0}'")]
pub struct UnknownDeliveryMode(pub String);

impl FromStr for DeliveryMode {
    type Err = UnknownDeliveryMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(DeliveryMode::Push),
            "pull" => Ok(DeliveryMode::Pull),
            "broadcast" => Ok(DeliveryMode::Broadcast),
            _ => Err(UnknownDeliveryMode(s.to_string())),
        }
    }
}
