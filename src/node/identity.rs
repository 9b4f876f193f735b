// Machine identity: the stable id every agent registered by this daemon
// carries as its machineId.
//
// Resolution order:
//   1. `machine_id` from config / AGENTLINK_MACHINE_ID
//   2. persisted id in <data_dir>/machine_id
//   3. first run: "<hostname>-<uuid prefix>", written to <data_dir>/machine_id

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Where the machine id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentitySource {
    Configured,
    Persisted,
    Generated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineIdentity {
    pub id: String,
    pub hostname: String,
    pub source: IdentitySource,
}

impl MachineIdentity {
    /// Resolve the identity, creating and persisting one on first run.
    pub fn resolve(configured: Option<&str>, path: &Path) -> Result<Self> {
        let hostname = local_hostname();

        if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
            return Ok(Self {
                id: id.to_string(),
                hostname,
                source: IdentitySource::Configured,
            });
        }

        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read machine id from {}", path.display()))?;
            let id = raw.trim();
            if !id.is_empty() {
                return Ok(Self {
                    id: id.to_string(),
                    hostname,
                    source: IdentitySource::Persisted,
                });
            }
            tracing::warn!(path = %path.display(), "machine id file is empty, regenerating");
        }

        let id = generate_id(&hostname);
        save(path, &id)?;
        tracing::info!(machine_id = %id, "Generated new machine identity");
        Ok(Self {
            id,
            hostname,
            source: IdentitySource::Generated,
        })
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn generate_id(hostname: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    let host: String = hostname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("{}-{}", host.trim_matches('-'), &suffix[..8])
}

fn save(path: &Path, id: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, format!("{}\n", id))
        .with_context(|| format!("Failed to write machine id to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_configured_id_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("machine_id");
        std::fs::write(&path, "persisted").unwrap();

        let identity = MachineIdentity::resolve(Some("m2"), &path).unwrap();
        assert_eq!(identity.id, "m2");
        assert_eq!(identity.source, IdentitySource::Configured);
    }

    #[test]
    fn test_first_run_generates_and_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("machine_id");

        let first = MachineIdentity::resolve(None, &path).unwrap();
        assert_eq!(first.source, IdentitySource::Generated);
        assert!(path.exists());

        let second = MachineIdentity::resolve(None, &path).unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.source, IdentitySource::Persisted);
    }

    #[test]
    fn test_blank_configured_id_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("machine_id");
        let identity = MachineIdentity::resolve(Some("   "), &path).unwrap();
        assert_ne!(identity.source, IdentitySource::Configured);
    }

    #[test]
    fn test_generated_id_is_sanitized() {
        let id = generate_id("My Laptop.local");
        assert!(id.starts_with("my-laptop-local-"));
        assert_eq!(id.len(), "my-laptop-local-".len() + 8);
    }
}
