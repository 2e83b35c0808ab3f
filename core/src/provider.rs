//! Public entry point: routes data operations to per-resource clients and
//! exposes the authentication surface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::client::ResourceClient;
use crate::config::{join_path, ProviderConfig};
use crate::error::{ApiError, Result};
use crate::http::{HttpMethod, HttpRequest};
use crate::metadata::ClassAccessor;
use crate::operation::{execute, DataProvider, Operation, OperationResult};
use crate::session::SessionManager;
use crate::store::SessionStore;
use crate::transport::Transport;
use crate::types::{Identity, ListParams, ListResult, Permissions, Record, RecordId, UserProfile};

const CLASS_ACCESSOR_PATH: &str = ":classAccessor";
const DESCRIPTION_PATH: &str = ":description";

pub struct Provider {
    config: ProviderConfig,
    session: Arc<SessionManager>,
    resources: RwLock<HashMap<String, Arc<ResourceClient>>>,
    ready: watch::Receiver<bool>,
}

impl Provider {
    /// Creates the provider and starts backend description discovery in the
    /// background. Must be called from within a Tokio runtime.
    pub fn new(
        config: ProviderConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        let config = config.validated()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ApiError::Config(format!("no tokio runtime: {e}")))?;
        let session = Arc::new(SessionManager::new(transport, store, &config));

        let (done, ready) = watch::channel(false);
        let discovery = session.clone();
        let api_url = config.api_url.clone();
        runtime.spawn(async move {
            discover_login_url(&discovery, &api_url).await;
            let _ = done.send(true);
        });

        Ok(Self {
            config,
            session,
            resources: RwLock::new(HashMap::new()),
            ready,
        })
    }

    /// Resolves once backend description discovery has finished, whether it
    /// succeeded or not. Operations do not wait for it.
    pub async fn ready(&self) {
        let mut ready = self.ready.clone();
        let _ = ready.wait_for(|done| *done).await;
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Returns the client for `name`, fetching its class accessor on first use.
    ///
    /// Concurrent first calls for the same resource each fetch metadata; the
    /// last one to finish wins the cache slot.
    pub async fn resource(&self, name: &str) -> Result<Arc<ResourceClient>> {
        if let Some(client) = self.resources.read().await.get(name) {
            return Ok(client.clone());
        }

        let url = join_path(&join_path(&self.config.api_url, name), CLASS_ACCESSOR_PATH);
        let response = self
            .session
            .fetch(HttpRequest::new(HttpMethod::Get, url))
            .await?;
        if !response.is_success() {
            return Err(ApiError::HttpError {
                status: response.status,
                status_text: response.status_text,
                body: response.body,
            });
        }
        let payload: Value = serde_json::from_str(&response.body)
            .map_err(|e| ApiError::MalformedMetadata(e.to_string()))?;
        let accessor = ClassAccessor::from_json(payload)?;
        let client = Arc::new(ResourceClient::new(
            name,
            &self.config,
            accessor,
            self.session.clone(),
        ));
        info!(
            resource = client.resource(),
            properties = client.accessor().properties.len(),
            "class accessor loaded"
        );
        self.resources
            .write()
            .await
            .insert(name.to_string(), client.clone());
        Ok(client)
    }

    pub async fn execute(&self, resource: &str, operation: Operation) -> Result<OperationResult> {
        execute(self, resource, operation).await
    }

    // -- authentication ------------------------------------------------------

    pub async fn login(&self, username: &str, password: &str) -> Result<UserProfile> {
        self.session.login(username, password).await
    }

    pub async fn logout(&self) -> Result<()> {
        self.session.logout().await
    }

    pub fn check_session(&self) -> Result<()> {
        self.session.check_session()
    }

    pub fn check_error(&self, error: &ApiError) -> Result<()> {
        self.session.check_error(error)
    }

    pub fn permissions(&self) -> Result<Permissions> {
        self.session.permissions()
    }

    pub fn identity(&self) -> Result<Identity> {
        self.session.identity()
    }
}

#[async_trait]
impl DataProvider for Provider {
    async fn get_list(&self, resource: &str, params: &ListParams) -> Result<ListResult> {
        self.resource(resource).await?.get_list(params).await
    }

    async fn get_one(&self, resource: &str, id: &RecordId) -> Result<Record> {
        self.resource(resource).await?.get_one(id).await
    }

    async fn get_many(&self, resource: &str, ids: &[RecordId]) -> Result<Vec<Record>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.resource(resource).await?.get_many(ids).await
    }

    async fn get_many_reference(
        &self,
        resource: &str,
        target: &str,
        id: &RecordId,
        params: &ListParams,
    ) -> Result<ListResult> {
        self.resource(resource)
            .await?
            .get_many_reference(target, id, params)
            .await
    }

    async fn create(&self, resource: &str, data: &Record) -> Result<Record> {
        self.resource(resource).await?.create(data).await
    }

    async fn update(&self, resource: &str, id: &RecordId, data: &Record) -> Result<Record> {
        self.resource(resource).await?.update(id, data).await
    }

    async fn update_many(
        &self,
        resource: &str,
        ids: &[RecordId],
        data: &Record,
    ) -> Result<Vec<RecordId>> {
        self.resource(resource).await?.update_many(ids, data).await
    }

    async fn delete(&self, resource: &str, id: &RecordId) -> Result<RecordId> {
        self.resource(resource).await?.delete(id).await
    }

    async fn delete_many(&self, resource: &str, ids: &[RecordId]) -> Result<Vec<RecordId>> {
        self.resource(resource).await?.delete_many(ids).await
    }
}

async fn discover_login_url(session: &SessionManager, api_url: &str) {
    let url = join_path(api_url, DESCRIPTION_PATH);
    let response = match session.fetch(HttpRequest::new(HttpMethod::Get, url)).await {
        Ok(response) if response.is_success() => response,
        Ok(response) => {
            warn!(
                status = response.status,
                "backend description unavailable, keeping default login path"
            );
            return;
        }
        Err(e) => {
            warn!(error = %e, "backend description unavailable, keeping default login path");
            return;
        }
    };

    let login_path = serde_json::from_str::<Value>(&response.body)
        .ok()
        .and_then(|d| d.get("loginPath").and_then(Value::as_str).map(str::to_string));
    match login_path {
        Some(path) => session.set_login_url(join_path(api_url, &path)),
        None => warn!("backend description has no loginPath, keeping default login path"),
    }
}
