//! Everything one sync session needs, built once and replaced wholesale when
//! credentials change.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::models::EntityKind;
use crate::remote::{HttpRemoteAdapter, RateLimitedClient, RemoteAdapter};
use crate::services::DatabaseService;
use crate::{Error, Result};

#[derive(Clone)]
pub struct SyncContext {
    pub db: DatabaseService,
    /// Shared by every adapter call, so the request interval spans all kinds
    pub client: RateLimitedClient,
    pub config: EngineConfig,
    adapters: HashMap<EntityKind, Arc<dyn RemoteAdapter>>,
}

impl SyncContext {
    /// A context without adapters; kinds without one are skipped.
    pub fn new(db: DatabaseService, config: EngineConfig) -> Self {
        Self {
            db,
            client: RateLimitedClient::from_config(&config),
            config,
            adapters: HashMap::new(),
        }
    }

    /// Build HTTP adapters for every kind with a configured collection.
    pub fn from_config(db: DatabaseService, config: EngineConfig) -> Result<Self> {
        let Some(remote) = config.remote.clone() else {
            return Err(Error::InvalidInput(
                "remote sync is not configured; set TASKSYNC_API_BASE_URL and TASKSYNC_API_TOKEN"
                    .to_string(),
            ));
        };

        let mut context = Self::new(db, config);
        for kind in EntityKind::ALL {
            let Some(collection) = context.config.collection(kind) else {
                continue;
            };
            let adapter = HttpRemoteAdapter::new(
                &remote.base_url,
                &remote.token,
                collection,
                context.config.request_timeout,
            )?;
            tracing::debug!(%kind, collection, "Configured remote collection");
            context.adapters.insert(kind, Arc::new(adapter));
        }
        Ok(context)
    }

    #[must_use]
    pub fn with_adapter(mut self, kind: EntityKind, adapter: Arc<dyn RemoteAdapter>) -> Self {
        self.adapters.insert(kind, adapter);
        self
    }

    pub fn adapter(&self, kind: EntityKind) -> Option<&Arc<dyn RemoteAdapter>> {
        self.adapters.get(&kind)
    }

    /// Kinds with an adapter, in visiting order.
    pub fn kinds(&self) -> Vec<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .filter(|kind| self.adapters.contains_key(kind))
            .collect()
    }
}
