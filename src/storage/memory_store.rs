use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::engine::types::{WorkflowFilter, WorkflowState};
use crate::storage::{StoreError, WorkflowStore, validate_save};

/// In-memory store. Holds run state only for the lifetime of the instance.
///
/// One coarse mutex guards the map; every operation is whole-state.
pub struct MemoryStore {
    runs: Mutex<HashMap<String, WorkflowState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.runs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.lock().await.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        validate_save(runs.get(&state.workflow_id), state)?;
        runs.insert(state.workflow_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        Ok(self.runs.lock().await.get(workflow_id).cloned())
    }

    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowState>, StoreError> {
        let runs = self.runs.lock().await;
        Ok(filter.apply(runs.values().cloned()))
    }

    async fn delete(&self, workflow_id: &str) -> Result<(), StoreError> {
        self.runs.lock().await.remove(workflow_id);
        Ok(())
    }
}
