use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::debug;

use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::traits::HistoryStore;
use nodeflow_core::types::FlowRunResult;

/// Default number of runs retained per flow key.
pub const DEFAULT_HISTORY_CAP: usize = 50;

type RunList = Arc<Mutex<VecDeque<FlowRunResult>>>;

/// Process-local run history.
///
/// Each flow key has its own lock, so appends to one key never wait on
/// another.
pub struct InMemoryHistory {
    cap: usize,
    flows: Mutex<HashMap<String, RunList>>,
}

impl InMemoryHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            flows: Mutex::new(HashMap::new()),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    fn runs(&self, flow_key: &str) -> Option<RunList> {
        self.flows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(flow_key)
            .cloned()
    }

    fn runs_or_insert(&self, flow_key: &str) -> RunList {
        self.flows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(flow_key.to_string())
            .or_default()
            .clone()
    }
}

impl Default for InMemoryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

impl HistoryStore for InMemoryHistory {
    fn append(&self, flow_key: &str, result: &FlowRunResult) -> Result<()> {
        let runs = self.runs_or_insert(flow_key);
        let mut runs = runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.push_front(result.clone());
        if runs.len() > self.cap {
            runs.truncate(self.cap);
            debug!(flow_key, cap = self.cap, "Evicted oldest run");
        }
        Ok(())
    }

    fn list(&self, flow_key: &str) -> Result<Vec<FlowRunResult>> {
        Ok(match self.runs(flow_key) {
            Some(runs) => runs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned()
                .collect(),
            None => Vec::new(),
        })
    }

    fn get(&self, flow_key: &str, run_id: &str) -> Result<FlowRunResult> {
        let not_found = || NodeflowError::RunNotFound {
            flow_key: flow_key.to_string(),
            run_id: run_id.to_string(),
        };
        let runs = self.runs(flow_key).ok_or_else(not_found)?;
        let runs = runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.iter()
            .find(|r| r.run_id == run_id)
            .cloned()
            .ok_or_else(not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_core::types::RunId;

    fn run(id: &str) -> FlowRunResult {
        let mut r = FlowRunResult::new(&RunId::from_string(id), "flow");
        r.finalize(false, None);
        r
    }

    #[test]
    fn test_most_recent_first() {
        let history = InMemoryHistory::default();
        history.append("flow", &run("r1")).unwrap();
        history.append("flow", &run("r2")).unwrap();
        let ids: Vec<String> = history
            .list("flow")
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec!["r2", "r1"]);
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let history = InMemoryHistory::new(50);
        for i in 0..51 {
            history.append("flow", &run(&format!("r{}", i))).unwrap();
        }
        let runs = history.list("flow").unwrap();
        assert_eq!(runs.len(), 50);
        assert_eq!(runs[0].run_id, "r50");
        assert_eq!(runs[49].run_id, "r1");
        assert!(history.get("flow", "r0").is_err());
    }

    #[test]
    fn test_get_and_not_found() {
        let history = InMemoryHistory::default();
        history.append("flow", &run("r1")).unwrap();
        assert_eq!(history.get("flow", "r1").unwrap().run_id, "r1");
        assert!(matches!(
            history.get("flow", "missing").unwrap_err(),
            NodeflowError::RunNotFound { .. }
        ));
        assert!(matches!(
            history.get("other", "r1").unwrap_err(),
            NodeflowError::RunNotFound { .. }
        ));
        assert!(history.list("other").unwrap().is_empty());
    }

    #[test]
    fn test_keys_are_independent() {
        let history = InMemoryHistory::new(2);
        for i in 0..3 {
            history.append("a", &run(&format!("a{}", i))).unwrap();
        }
        history.append("b", &run("b0")).unwrap();
        assert_eq!(history.list("a").unwrap().len(), 2);
        assert_eq!(history.list("b").unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_appends() {
        let history = Arc::new(InMemoryHistory::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let history = history.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        history.append("flow", &run(&format!("t{}-{}", t, i))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(history.list("flow").unwrap().len(), 200);
    }
}
