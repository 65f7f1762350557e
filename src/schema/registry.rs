use std::path::Path;

use anyhow::{anyhow, Context};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::info;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionTable {
    packet_ids: FxHashMap<String, String>,
}

/// Bidirectional, read-only mapping between message-type ids and schema names for one client
///  version
#[derive(Debug, Default)]
pub struct MessageTypeRegistry {
    id_to_name: FxHashMap<u16, String>,
    name_to_id: FxHashMap<String, u16>,
}

impl MessageTypeRegistry {
    /// Loads `{versions_dir}/{client_version}.json`, a JSON object with a `packetIds` map from
    ///  decimal id to schema name
    pub fn load(versions_dir: &Path, client_version: &str) -> anyhow::Result<MessageTypeRegistry> {
        let path = versions_dir.join(format!("{}.json", client_version));
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("reading version table {:?}", path))?;
        let registry = Self::from_json(&json)
            .with_context(|| format!("parsing version table {:?}", path))?;
        info!("loaded {} message types for client version {}", registry.len(), client_version);
        Ok(registry)
    }

    pub fn from_json(json: &str) -> anyhow::Result<MessageTypeRegistry> {
        let table: VersionTable = serde_json::from_str(json)?;

        let mut entries = Vec::with_capacity(table.packet_ids.len());
        for (id, name) in table.packet_ids {
            let id = id.parse::<u16>()
                .map_err(|_| anyhow!("message type id {:?} is not a 16-bit number", id))?;
            entries.push((id, name));
        }
        Self::from_entries(entries)
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (u16, String)>) -> anyhow::Result<MessageTypeRegistry> {
        let mut id_to_name = FxHashMap::default();
        let mut name_to_id = FxHashMap::default();

        for (id, name) in entries {
            if let Some(prev) = name_to_id.insert(name.clone(), id) {
                return Err(anyhow!("schema name {} is registered for both {} and {}", name, prev, id));
            }
            if let Some(prev) = id_to_name.insert(id, name) {
                return Err(anyhow!("message type id {} is registered for both {} and {}", id, prev, id_to_name[&id]));
            }
        }

        Ok(MessageTypeRegistry {
            id_to_name,
            name_to_id,
        })
    }

    pub fn len(&self) -> usize {
        self.id_to_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_name.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.name_to_id.keys()
            .map(|s| s.as_str())
    }

    pub fn name_of(&self, id: u16) -> Option<&str> {
        self.id_to_name.get(&id)
            .map(|s| s.as_str())
    }

    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.name_to_id.get(name).copied()
    }

    /// Resolves the name of an outbound message. Some responses exist in several shapes that are
    ///  distinguished by a single trailing digit (e.g. `PlayerLoginRsp2`); the table only holds the
    ///  undecorated name, so the digit is stripped if the exact name is not registered.
    pub fn resolve_outbound(&self, name: &str) -> Option<(u16, &str)> {
        if let Some(id) = self.id_of(name) {
            return self.name_of(id).map(|n| (id, n));
        }

        let undecorated = strip_resend_suffix(name)?;
        let id = self.id_of(undecorated)?;
        self.name_of(id).map(|n| (id, n))
    }
}

/// `name` without its trailing ASCII digit, `None` if it does not end in one
pub fn strip_resend_suffix(name: &str) -> Option<&str> {
    let stripped = name.strip_suffix(|c: char| c.is_ascii_digit())?;
    if stripped.is_empty() {
        None
    }
    else {
        Some(stripped)
    }
}
