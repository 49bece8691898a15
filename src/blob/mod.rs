//! Blob Storage Layer Abstraction
//!
//! Containers hold block blobs addressed by `/`-separated names. Backends
//! record content type, length and MD5 at upload time.

pub mod local_store;
pub mod mock_store;

#[cfg(test)]
mod comprehensive_test;

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

/// Properties sent along with an uploaded blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlobProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Options used when the container has to be created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerOptions {
    /// `blob`, `container`, or absent for private containers
    pub public_access_level: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// One entry of a blob listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobItem {
    pub name: String,
    pub content_length: u64,
    pub content_type: String,
    /// Base64 of the MD5 digest
    pub content_md5: String,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub properties: BlobProperties,
}

impl BlobItem {
    pub fn describe(name: &str, data: &[u8], properties: &BlobProperties) -> Self {
        Self {
            name: name.to_string(),
            content_length: data.len() as u64,
            content_type: properties
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            content_md5: content_md5(data),
            last_modified: Utc::now(),
            properties: properties.clone(),
        }
    }
}

pub fn content_md5(data: &[u8]) -> String {
    BASE64.encode(md5::compute(data).0)
}

/// Trait defining the blob service interface
pub trait BlobService: Send + Sync {
    /// Create the container, returning true when it did not exist before
    fn create_container_if_not_exists(&self, container: &str, options: &ContainerOptions) -> ServiceResult<bool>;

    /// Delete the container and every blob in it, returning true when it existed
    fn delete_container_if_exists(&self, container: &str) -> ServiceResult<bool>;

    fn container_exists(&self, container: &str) -> ServiceResult<bool>;

    /// Store `data` under `name`, replacing any previous blob
    fn put_block_blob(
        &self,
        container: &str,
        name: &str,
        data: &[u8],
        properties: &BlobProperties,
    ) -> ServiceResult<BlobItem>;

    /// Blobs whose name starts with `prefix`, sorted by name
    fn list_blobs(&self, container: &str, prefix: Option<&str>) -> ServiceResult<Vec<BlobItem>>;

    fn get_blob(&self, container: &str, name: &str) -> ServiceResult<Vec<u8>>;
}

/// Container names: 3-63 lowercase letters, digits and single hyphens,
/// starting and ending with a letter or digit.
pub fn validate_container_name(container: &str) -> ServiceResult<()> {
    let valid = (3..=63).contains(&container.len())
        && container.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !container.starts_with('-')
        && !container.ends_with('-')
        && !container.contains("--");
    if valid {
        Ok(())
    } else {
        Err(ServiceError::BadRequest(format!("invalid container name: {}", container)))
    }
}

/// Blob names: 1-1024 characters, no empty, `.` or `..` segments.
pub fn validate_blob_name(name: &str) -> ServiceResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 1024
        && name.split('/').all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(ServiceError::BadRequest(format!("invalid blob name: {}", name)))
    }
}

pub(crate) fn container_not_found(container: &str) -> ServiceError {
    ServiceError::NotFound(format!("container {} does not exist", container))
}

pub(crate) fn blob_not_found(container: &str, name: &str) -> ServiceError {
    ServiceError::NotFound(format!("blob {} does not exist in container {}", name, container))
}
