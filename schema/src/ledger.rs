//! On-disk pid ledger format
//!
//! The ledger is a plain JSON object mapping an owner name to the pids it
//! spawned, e.g. `{"api":[4121],"terminal:shell":[4188,4190]}`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Owner name → recorded pids
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(transparent)]
pub struct PidLedger {
    entries: BTreeMap<String, Vec<u32>>,
}

impl PidLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `pid` under `name`; returns false if it was already recorded there
    pub fn add(&mut self, name: &str, pid: u32) -> bool {
        let pids = self.entries.entry(name.to_string()).or_default();
        if pids.contains(&pid) {
            return false;
        }
        pids.push(pid);
        true
    }

    /// Remove `pid` from whichever entry holds it, dropping emptied entries
    ///
    /// Returns the owner name the pid was recorded under.
    pub fn remove(&mut self, pid: u32) -> Option<String> {
        let owner = self
            .entries
            .iter()
            .find(|(_, pids)| pids.contains(&pid))
            .map(|(name, _)| name.clone())?;
        if let Some(pids) = self.entries.get_mut(&owner) {
            pids.retain(|p| *p != pid);
            if pids.is_empty() {
                self.entries.remove(&owner);
            }
        }
        Some(owner)
    }

    /// Pids recorded for `name`
    pub fn pids_for(&self, name: &str) -> &[u32] {
        self.entries.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate all `(name, pid)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.entries
            .iter()
            .flat_map(|(name, pids)| pids.iter().map(move |pid| (name.as_str(), *pid)))
    }

    /// Whether any pid is recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of owners with at least one pid
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_dedupes() {
        let mut ledger = PidLedger::new();
        assert!(ledger.add("svcA", 123));
        assert!(!ledger.add("svcA", 123));
        assert!(ledger.add("svcA", 124));
        assert_eq!(ledger.pids_for("svcA"), &[123, 124]);
    }

    #[test]
    fn test_remove_drops_empty_entries() {
        let mut ledger = PidLedger::new();
        ledger.add("svcA", 123);
        ledger.add("svcB", 200);
        ledger.add("svcB", 201);

        assert_eq!(ledger.remove(123).as_deref(), Some("svcA"));
        assert!(ledger.pids_for("svcA").is_empty());
        assert_eq!(ledger.len(), 1);

        assert_eq!(ledger.remove(999), None);
        assert_eq!(ledger.remove(200).as_deref(), Some("svcB"));
        assert_eq!(ledger.pids_for("svcB"), &[201]);
    }

    #[test]
    fn test_plain_object_format() {
        let mut ledger = PidLedger::new();
        ledger.add("api", 4121);
        ledger.add("terminal:shell", 4188);
        let json = serde_json::to_string(&ledger).unwrap();
        assert_eq!(json, r#"{"api":[4121],"terminal:shell":[4188]}"#);

        let parsed: PidLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ledger);
        assert_eq!(parsed.iter().count(), 2);
    }
}
