use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{NodeflowError, Result};

/// `(node_id, output)`. Kept as a pair so ids containing dots never collide.
type VariableKey = (String, String);

/// Run-scoped variable space keyed by producer node and output name.
///
/// Every key is written at most once. A producer is "settled" once the
/// executor has visited it, whatever the outcome; reading from an unsettled
/// producer is an ordering bug and reported as `VariableNotReady`.
#[derive(Debug, Default)]
pub struct VariableStore {
    values: RwLock<HashMap<VariableKey, serde_json::Value>>,
    settled: RwLock<HashSet<String>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Human-readable `"node.output"` form, used in errors only.
    pub fn display_key(node_id: &str, output: &str) -> String {
        format!("{}.{}", node_id, output)
    }

    /// Write one output. Fails if the key already holds a value.
    pub fn write(&self, node_id: &str, output: &str, value: serde_json::Value) -> Result<()> {
        let key = (node_id.to_string(), output.to_string());
        let mut values = self.values_mut();
        if values.contains_key(&key) {
            return Err(NodeflowError::VariableAlreadyWritten(Self::display_key(node_id, output)));
        }
        values.insert(key, value);
        Ok(())
    }

    /// Write all outputs of a node under one lock.
    pub fn write_outputs<I>(&self, node_id: &str, outputs: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        let mut values = self.values_mut();
        let staged: Vec<(VariableKey, serde_json::Value)> = outputs
            .into_iter()
            .map(|(name, v)| ((node_id.to_string(), name), v))
            .collect();
        if let Some(((node, output), _)) = staged.iter().find(|(k, _)| values.contains_key(k)) {
            return Err(NodeflowError::VariableAlreadyWritten(Self::display_key(node, output)));
        }
        values.extend(staged);
        Ok(())
    }

    /// Mark a producer as visited.
    pub fn settle(&self, node_id: &str) {
        self.settled
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node_id.to_string());
    }

    pub fn is_settled(&self, node_id: &str) -> bool {
        self.settled
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(node_id)
    }

    /// Read a producer's output.
    ///
    /// `Ok(None)` means the producer settled without writing this output
    /// (it failed, or never declared it).
    pub fn read(&self, node_id: &str, output: &str) -> Result<Option<serde_json::Value>> {
        if let Some(v) = self.get(node_id, output) {
            return Ok(Some(v));
        }
        if self.is_settled(node_id) {
            Ok(None)
        } else {
            Err(NodeflowError::VariableNotReady(Self::display_key(node_id, output)))
        }
    }

    /// Value written so far, without the settle check.
    pub fn get(&self, node_id: &str, output: &str) -> Option<serde_json::Value> {
        self.values_ref()
            .get(&(node_id.to_string(), output.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.values_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values_ref().is_empty()
    }

    fn values_ref(&self) -> RwLockReadGuard<'_, HashMap<VariableKey, serde_json::Value>> {
        self.values.read().unwrap_or_else(|e| e.into_inner())
    }

    fn values_mut(&self) -> RwLockWriteGuard<'_, HashMap<VariableKey, serde_json::Value>> {
        self.values.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_and_read() {
        let store = VariableStore::new();
        store.write("fetch", "out", json!(42)).unwrap();
        store.settle("fetch");
        assert_eq!(store.read("fetch", "out").unwrap(), Some(json!(42)));
        assert_eq!(store.get("fetch", "out"), Some(json!(42)));
    }

    #[test]
    fn test_write_once() {
        let store = VariableStore::new();
        store.write("a", "out", json!(1)).unwrap();
        let err = store.write("a", "out", json!(2)).unwrap_err();
        assert!(matches!(err, NodeflowError::VariableAlreadyWritten(k) if k == "a.out"));
        assert_eq!(store.get("a", "out"), Some(json!(1)));
    }

    #[test]
    fn test_write_outputs_is_all_or_nothing() {
        let store = VariableStore::new();
        store.write("a", "x", json!(1)).unwrap();
        let err = store
            .write_outputs("a", vec![("y".to_string(), json!(2)), ("x".to_string(), json!(3))])
            .unwrap_err();
        assert!(matches!(err, NodeflowError::VariableAlreadyWritten(_)));
        assert!(store.get("a", "y").is_none());
    }

    #[test]
    fn test_read_before_producer_settles_is_error() {
        let store = VariableStore::new();
        let err = store.read("fetch", "out").unwrap_err();
        assert!(matches!(err, NodeflowError::VariableNotReady(k) if k == "fetch.out"));
    }

    #[test]
    fn test_read_from_failed_producer_is_none() {
        let store = VariableStore::new();
        store.settle("fetch");
        assert_eq!(store.read("fetch", "out").unwrap(), None);
    }

    #[test]
    fn test_concurrent_disjoint_writes() {
        let store = std::sync::Arc::new(VariableStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let id = format!("n{}", i);
                    store.write(&id, "out", json!(i)).unwrap();
                    store.settle(&id);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 8);
        assert_eq!(store.read("n3", "out").unwrap(), Some(json!(3)));
    }

    #[test]
    fn test_dotted_ids_do_not_collide() {
        let store = VariableStore::new();
        store.write("a.b", "c", json!("first")).unwrap();
        store.write("a", "b.c", json!("second")).unwrap();
        store.settle("a.b");
        store.settle("a");
        assert_eq!(store.read("a.b", "c").unwrap(), Some(json!("first")));
        assert_eq!(store.read("a", "b.c").unwrap(), Some(json!("second")));
        assert_eq!(store.len(), 2);
    }
}
