use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::engine::types::{WorkflowFilter, WorkflowState};
use crate::storage::{StoreError, WorkflowStore, validate_save};

/// File-based JSON store. Each workflow is stored as a separate JSON file.
pub struct JsonFileStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

/// Percent-encode everything outside `[A-Za-z0-9_.-]` so ids map to flat file names.
fn file_stem(workflow_id: &str) -> String {
    let mut stem = String::with_capacity(workflow_id.len());
    for byte in workflow_id.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => stem.push(byte as char),
            b'.' if !stem.is_empty() => stem.push('.'),
            _ => stem.push_str(&format!("%{:02X}", byte)),
        }
    }
    stem
}

impl JsonFileStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn run_path(&self, workflow_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", file_stem(workflow_id)))
    }

    async fn read_run(&self, workflow_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        let path = self.run_path(workflow_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&data)?))
    }

    async fn write_run(&self, state: &WorkflowState) -> Result<(), StoreError> {
        let path = self.run_path(&state.workflow_id);
        let tmp_path = path.with_extension("json.tmp");

        let data = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for JsonFileStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), StoreError> {
        if state.workflow_id.trim().is_empty() {
            return Err(StoreError::EmptyId);
        }
        let _lock = self.lock.write().await;

        tokio::fs::create_dir_all(&self.base_dir).await?;

        let existing = self.read_run(&state.workflow_id).await?;
        validate_save(existing.as_ref(), state)?;
        self.write_run(state).await
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        let _lock = self.lock.read().await;
        self.read_run(workflow_id).await
    }

    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowState>, StoreError> {
        let _lock = self.lock.read().await;

        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = match tokio::fs::read_to_string(&path).await {
                Ok(data) => serde_json::from_str::<WorkflowState>(&data).ok(),
                Err(_) => None,
            };
            match parsed {
                Some(state) if filter.matches(&state) => runs.push(state),
                Some(_) => {}
                None => warn!(path = %path.display(), "Skipping unreadable workflow file"),
            }
        }

        // Newest first
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if filter.limit > 0 {
            runs.truncate(filter.limit);
        }

        Ok(runs)
    }

    async fn delete(&self, workflow_id: &str) -> Result<(), StoreError> {
        let _lock = self.lock.write().await;
        match tokio::fs::remove_file(self.run_path(workflow_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
