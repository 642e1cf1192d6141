//! Key/value store shared between the base station and its tooling.
//!
//! Values are stored as JSON so every reader gets its own copy; mutating a
//! value read from the store never affects what others see.

use dashmap::DashMap;
use macp_types::{MacpError, MacpResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Key holding the addresses of agents whose link is open.
pub const CONNECTED_AGENTS: &str = "connected_agents";

/// Key holding the addresses of agents selected by the operator.
pub const SELECTED_AGENTS: &str = "selected_agents";

#[derive(Debug, Default)]
pub struct SharedStore {
    entries: DashMap<String, serde_json::Value>,
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a copy of `value` under `key`, replacing any previous value.
    pub fn write<T: Serialize>(&self, key: &str, value: &T) -> MacpResult<()> {
        let value =
            serde_json::to_value(value).map_err(|e| MacpError::Serialization(e.to_string()))?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    /// Read a copy of the value under `key`.
    ///
    /// Returns `None` if the key is absent or holds a value of another type.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.entries.get(key)?.value().clone();
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Stored value has unexpected type");
                None
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use macp_types::AgentAddress;

    #[test]
    fn test_read_returns_independent_copy() {
        let store = SharedStore::new();
        store.write(SELECTED_AGENTS, &vec![1u8, 2, 3]).unwrap();

        let mut copy: Vec<u8> = store.read(SELECTED_AGENTS).unwrap();
        copy.push(4);
        assert_eq!(store.read::<Vec<u8>>(SELECTED_AGENTS).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_addresses_roundtrip_through_store() {
        let store = SharedStore::new();
        let agents = vec![AgentAddress::agent(2).unwrap(), AgentAddress::agent(9).unwrap()];
        store.write(CONNECTED_AGENTS, &agents).unwrap();
        assert_eq!(store.read::<Vec<AgentAddress>>(CONNECTED_AGENTS).unwrap(), agents);
    }

    #[test]
    fn test_type_mismatch_and_missing() {
        let store = SharedStore::new();
        store.write("mode", &"formation").unwrap();
        assert!(store.read::<Vec<u8>>("mode").is_none());
        assert!(store.read::<String>("absent").is_none());
        assert_eq!(store.keys(), vec!["mode".to_string()]);
        assert!(store.remove("mode"));
        assert!(!store.contains("mode"));
    }
}
