//! Mock implementation of BlobService trait for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::blob::{
    blob_not_found, container_not_found, validate_blob_name, validate_container_name, BlobItem, BlobProperties,
    BlobService, ContainerOptions,
};
use crate::error::{InjectedFailures, ServiceError, ServiceResult};

struct MockContainer {
    options: ContainerOptions,
    blobs: BTreeMap<String, (Vec<u8>, BlobItem)>,
}

/// In-memory blob service
#[derive(Default)]
pub struct MockBlobStore {
    containers: Mutex<HashMap<String, MockContainer>>,
    failures: InjectedFailures,
    put_calls: AtomicUsize,
}

impl MockBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next remote call fail with `error`
    pub fn inject_failure(&self, error: ServiceError) {
        self.failures.push(error);
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Get the number of blobs in a container
    pub fn blob_count(&self, container: &str) -> usize {
        self.lock()
            .map(|c| c.get(container).map_or(0, |c| c.blobs.len()))
            .unwrap_or(0)
    }

    pub fn container_options(&self, container: &str) -> Option<ContainerOptions> {
        self.lock().ok()?.get(container).map(|c| c.options.clone())
    }

    fn lock(&self) -> ServiceResult<MutexGuard<'_, HashMap<String, MockContainer>>> {
        self.containers
            .lock()
            .map_err(|_| ServiceError::Backend("blob store lock poisoned".to_string()))
    }
}

impl BlobService for MockBlobStore {
    fn create_container_if_not_exists(&self, container: &str, options: &ContainerOptions) -> ServiceResult<bool> {
        self.failures.check()?;
        validate_container_name(container)?;
        let mut containers = self.lock()?;
        if containers.contains_key(container) {
            return Ok(false);
        }
        containers.insert(
            container.to_string(),
            MockContainer {
                options: options.clone(),
                blobs: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    fn delete_container_if_exists(&self, container: &str) -> ServiceResult<bool> {
        self.failures.check()?;
        Ok(self.lock()?.remove(container).is_some())
    }

    fn container_exists(&self, container: &str) -> ServiceResult<bool> {
        self.failures.check()?;
        Ok(self.lock()?.contains_key(container))
    }

    fn put_block_blob(
        &self,
        container: &str,
        name: &str,
        data: &[u8],
        properties: &BlobProperties,
    ) -> ServiceResult<BlobItem> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.check()?;
        validate_blob_name(name)?;
        let mut containers = self.lock()?;
        let c = containers.get_mut(container).ok_or_else(|| container_not_found(container))?;
        let item = BlobItem::describe(name, data, properties);
        c.blobs.insert(name.to_string(), (data.to_vec(), item.clone()));
        Ok(item)
    }

    fn list_blobs(&self, container: &str, prefix: Option<&str>) -> ServiceResult<Vec<BlobItem>> {
        self.failures.check()?;
        let containers = self.lock()?;
        let c = containers.get(container).ok_or_else(|| container_not_found(container))?;
        let prefix = prefix.unwrap_or("");
        Ok(c.blobs
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(_, (_, item))| item.clone())
            .collect())
    }

    fn get_blob(&self, container: &str, name: &str) -> ServiceResult<Vec<u8>> {
        self.failures.check()?;
        let containers = self.lock()?;
        let c = containers.get(container).ok_or_else(|| container_not_found(container))?;
        c.blobs
            .get(name)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| blob_not_found(container, name))
    }
}
