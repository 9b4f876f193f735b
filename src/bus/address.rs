// Target addresses
//
// Addresses are URI-shaped: `agent://machine/session`, `project://machine/path`,
// `channel://name`. A single segment after the scheme (`agent://abc`) carries
// no machine and matches on any machine. A string with no scheme is a bare key.

use super::types::TargetType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    pub scheme: Option<TargetType>,
    pub machine: Option<String>,
    pub key: String,
}

impl TargetAddress {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let Some((scheme, rest)) = raw.split_once("://") else {
            return Self {
                scheme: None,
                machine: None,
                key: raw.to_string(),
            };
        };

        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "agent" => Some(TargetType::Agent),
            "project" => Some(TargetType::Project),
            "channel" => Some(TargetType::Channel),
            _ => None,
        };

        // Channels are not machine scoped.
        if scheme == Some(TargetType::Channel) {
            return Self {
                scheme,
                machine: None,
                key: rest.trim_matches('/').to_string(),
            };
        }

        match rest.split_once('/') {
            Some((machine, key)) if !machine.is_empty() && !key.is_empty() => {
                let key = if scheme == Some(TargetType::Project) {
                    // Project keys are paths; keep the leading slash.
                    format!("/{}", key.trim_start_matches('/'))
                } else {
                    key.trim_end_matches('/').to_string()
                };
                Self {
                    scheme,
                    machine: Some(machine.to_string()),
                    key,
                }
            }
            _ => Self {
                scheme,
                machine: None,
                key: rest.trim_matches('/').to_string(),
            },
        }
    }

    /// Whether this address may refer to an agent on `machine_id`.
    pub fn is_for_machine(&self, machine_id: &str) -> bool {
        self.machine.as_deref().map_or(true, |m| m == machine_id)
    }

    /// Address of a specific agent, used when replying to a sender.
    pub fn for_agent_id(agent_id: &str) -> String {
        format!("agent://{}", agent_id)
    }

    pub fn for_session(machine_id: &str, session_id: &str) -> String {
        format!("agent://{}/{}", machine_id, session_id)
    }
}
