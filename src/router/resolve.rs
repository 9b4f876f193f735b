// Target resolution
//
// A push message names its target loosely. The key of the parsed address is
// matched against this daemon's agents in strict precedence order:
//
//   agent id > session id > session name > project-path containment
//
// A higher-precedence match anywhere in the list beats a lower-precedence
// match earlier in the list.

use serde::Serialize;

use crate::bus::{Agent, TargetAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    AgentId,
    SessionId,
    SessionName,
    ProjectPath,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub agent: Agent,
    pub matched: MatchKind,
}

/// Resolve `address` against `agents` on `machine_id`.
pub fn resolve_target(address: &TargetAddress, machine_id: &str, agents: &[Agent]) -> Option<Resolution> {
    if !address.is_for_machine(machine_id) {
        return None;
    }
    let key = address.key.as_str();
    if key.is_empty() {
        return None;
    }

    let local: Vec<&Agent> = agents.iter().filter(|a| a.machine_id == machine_id).collect();

    let by = |kind: MatchKind, pred: &dyn Fn(&Agent) -> bool| {
        local.iter().find(|a| pred(a)).map(|a| Resolution {
            agent: (*a).clone(),
            matched: kind,
        })
    };

    by(MatchKind::AgentId, &|a| a.id == key)
        .or_else(|| by(MatchKind::SessionId, &|a| a.session_id == key))
        .or_else(|| by(MatchKind::SessionName, &|a| a.session_name.as_deref() == Some(key)))
        .or_else(|| {
            by(MatchKind::ProjectPath, &|a| {
                a.project_path.as_deref().is_some_and(|path| path.contains(key))
            })
        })
}
