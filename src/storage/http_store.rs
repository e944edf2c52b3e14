use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tokio::sync::RwLock;
use tracing::debug;

use crate::engine::types::{WorkflowFilter, WorkflowState};
use crate::storage::{StoreError, WorkflowStore, validate_save};

/// Connection settings for [`HttpStore`].
#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    pub base_url: String,
    pub collection: String,
    /// Sent as a bearer token when present.
    pub auth_key: Option<String>,
    pub timeout: Duration,
}

impl HttpStoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            collection: "workflows".to_string(),
            auth_key: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_auth_key(mut self, key: impl Into<String>) -> Self {
        self.auth_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Store backed by a remote REST service: `PUT|GET|DELETE <base>/<collection>/<id>`.
///
/// The binding only covers single states, so `list` answers from a local cache
/// of every state this instance saved or loaded. It is only eventually
/// consistent with the remote source of truth: runs written by other
/// processes appear once they are loaded through this instance.
pub struct HttpStore {
    client: reqwest::Client,
    base_url: Url,
    collection: String,
    auth_key: Option<String>,
    cache: RwLock<HashMap<String, WorkflowState>>,
}

impl HttpStore {
    pub fn new(config: HttpStoreConfig) -> Result<Self, StoreError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| StoreError::Config(format!("invalid base url '{}': {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Config(format!(
                "base url '{}' cannot carry a path",
                config.base_url
            )));
        }
        if config.collection.trim().is_empty() {
            return Err(StoreError::Config("collection must not be empty".to_string()));
        }

        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            base_url,
            collection: config.collection,
            auth_key: config.auth_key,
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn state_url(&self, workflow_id: &str) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Config("base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .push(&self.collection)
            .push(workflow_id);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn remote_error(response: reqwest::Response) -> StoreError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        StoreError::Remote { status, body }
    }
}

#[async_trait]
impl WorkflowStore for HttpStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), StoreError> {
        {
            // Best-effort local check; the remote side enforces transitions too.
            let cache = self.cache.read().await;
            validate_save(cache.get(&state.workflow_id), state)?;
        }

        let url = self.state_url(&state.workflow_id)?;
        let response = self
            .authorize(self.client.put(url).json(state))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::remote_error(response).await);
        }

        debug!(workflow_id = %state.workflow_id, events = state.history.len(), "Saved workflow state remotely");
        self.cache
            .write()
            .await
            .insert(state.workflow_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        let url = self.state_url(workflow_id)?;
        let response = self.authorize(self.client.get(url)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            self.cache.write().await.remove(workflow_id);
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::remote_error(response).await);
        }

        let bytes = response.bytes().await?;
        let state: WorkflowState = serde_json::from_slice(&bytes)?;
        self.cache
            .write()
            .await
            .insert(state.workflow_id.clone(), state.clone());
        Ok(Some(state))
    }

    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowState>, StoreError> {
        let cache = self.cache.read().await;
        Ok(filter.apply(cache.values().cloned()))
    }

    async fn delete(&self, workflow_id: &str) -> Result<(), StoreError> {
        let url = self.state_url(workflow_id)?;
        let response = self.authorize(self.client.delete(url)).send().await?;

        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(Self::remote_error(response).await);
        }

        self.cache.write().await.remove(workflow_id);
        Ok(())
    }
}
