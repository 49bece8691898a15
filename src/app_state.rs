//! Application State Management
//!
//! This module provides the application state that owns the storage service
//! backends, following the dependency injection pattern. Backends are built
//! once per resolved connection and shared by every task of the run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::info;

use crate::blob::local_store::LocalBlobStore;
use crate::blob::mock_store::MockBlobStore;
use crate::blob::BlobService;
use crate::config::{AppConfig, StorageBackend};
use crate::connection::ConnectionSettings;
use crate::error::{ServiceError, TaskError};
use crate::queue::mock_store::MockQueueStore;
use crate::queue::sqlite_store::SqliteQueueStore;
use crate::queue::QueueService;
use crate::retry::{RetryPolicy, RetryingBlobService, RetryingQueueService, RetryingTableService};
use crate::table::mock_store::MockTableStore;
use crate::table::sqlite_store::SqliteTableStore;
use crate::table::TableService;

/// The three storage services reached through one connection
#[derive(Clone)]
pub struct StorageServices {
    pub blob: Arc<dyn BlobService>,
    pub queue: Arc<dyn QueueService>,
    pub table: Arc<dyn TableService>,
}

impl StorageServices {
    /// Fresh in-memory services
    pub fn mock() -> Self {
        Self {
            blob: Arc::new(MockBlobStore::new()),
            queue: Arc::new(MockQueueStore::new()),
            table: Arc::new(MockTableStore::new()),
        }
    }

    /// Local emulator rooted at the settings' data path
    pub fn local(settings: &ConnectionSettings) -> Result<Self, ServiceError> {
        let root = &settings.data_path;
        info!("Using local storage backend with data_path: {}", root.display());
        Ok(Self {
            blob: Arc::new(LocalBlobStore::new(root.clone())?),
            queue: Arc::new(SqliteQueueStore::open(&root.join("queues.sqlite"))?),
            table: Arc::new(SqliteTableStore::open(&root.join("tables.sqlite"))?),
        })
    }

    /// Same services with every call going through `policy`
    pub fn with_retry(&self, policy: RetryPolicy) -> Self {
        Self {
            blob: Arc::new(RetryingBlobService::new(self.blob.clone(), policy)),
            queue: Arc::new(RetryingQueueService::new(self.queue.clone(), policy)),
            table: Arc::new(RetryingTableService::new(self.table.clone(), policy)),
        }
    }
}

/// Application state containing the configuration and the service backends
pub struct AppState {
    pub config: AppConfig,
    services: Mutex<HashMap<String, StorageServices>>,
    fixed: Option<StorageServices>,
}

impl AppState {
    /// Create application state from configuration
    pub fn from_config(config: AppConfig) -> Self {
        info!("Initializing application state with default backend {:?}", config.storage.backend);
        Self {
            config,
            services: Mutex::new(HashMap::new()),
            fixed: None,
        }
    }

    /// Every connection resolves to `services`, whatever its settings
    pub fn with_services(config: AppConfig, services: StorageServices) -> Self {
        Self {
            config,
            services: Mutex::new(HashMap::new()),
            fixed: Some(services),
        }
    }

    /// Create application state for testing with mock backends
    pub fn new_for_testing() -> Self {
        let mut config = AppConfig::default();
        config.storage.backend = StorageBackend::Mock;
        Self::with_services(config, StorageServices::mock())
    }

    /// Parse `serviceOptions` against the configured defaults
    pub fn connection(&self, service_options: &[String]) -> Result<ConnectionSettings, TaskError> {
        ConnectionSettings::parse(service_options, &self.config.storage)
    }

    /// Services for `settings`, built on first use
    pub fn services_for(&self, settings: &ConnectionSettings) -> Result<StorageServices, TaskError> {
        if let Some(fixed) = &self.fixed {
            return Ok(fixed.clone());
        }

        let mut cache = self
            .services
            .lock()
            .map_err(|_| ServiceError::Backend("service cache lock poisoned".to_string()))?;
        let key = settings.cache_key();
        if let Some(services) = cache.get(&key) {
            return Ok(services.clone());
        }

        let services = match settings.backend {
            StorageBackend::Mock => {
                info!("Using mock storage backend");
                StorageServices::mock()
            }
            StorageBackend::Local => StorageServices::local(settings)?,
        };
        cache.insert(key, services.clone());
        Ok(services)
    }
}
