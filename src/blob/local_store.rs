//! Local filesystem implementation of BlobService trait
//!
//! Layout under the root directory:
//! `blobs/<container>/<blob name>` holds the content,
//! `meta/<container>/<blob name>.json` the recorded `BlobItem`,
//! `meta/<container>.json` the container options.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use walkdir::WalkDir;

use crate::blob::{
    blob_not_found, container_not_found, validate_blob_name, validate_container_name, BlobItem, BlobProperties,
    BlobService, ContainerOptions,
};
use crate::error::{ServiceError, ServiceResult};
use crate::fs_util::create_dir_chain;

/// Blob service backed by a directory tree
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> ServiceResult<Self> {
        let root = root.into();
        create_dir_chain(&root.join("blobs"))?;
        create_dir_chain(&root.join("meta"))?;
        info!("Using local blob storage at {}", root.display());
        Ok(Self { root })
    }

    fn container_dir(&self, container: &str) -> PathBuf {
        self.root.join("blobs").join(container)
    }

    fn meta_dir(&self, container: &str) -> PathBuf {
        self.root.join("meta").join(container)
    }

    fn container_file(&self, container: &str) -> PathBuf {
        self.root.join("meta").join(format!("{}.json", container))
    }

    fn require_container(&self, container: &str) -> ServiceResult<PathBuf> {
        let dir = self.container_dir(container);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(container_not_found(container))
        }
    }

    fn sidecar(&self, container: &str, name: &str) -> PathBuf {
        join_name(&self.meta_dir(container), &format!("{}.json", name))
    }

    fn read_item(&self, container: &str, name: &str, path: &Path) -> ServiceResult<BlobItem> {
        match fs::read(self.sidecar(container, name)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            // Files dropped into the tree by hand have no sidecar
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let data = fs::read(path)?;
                Ok(BlobItem::describe(name, &data, &BlobProperties::default()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn join_name(base: &Path, name: &str) -> PathBuf {
    name.split('/').fold(base.to_path_buf(), |path, segment| path.join(segment))
}

fn remove_if_exists(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl BlobService for LocalBlobStore {
    fn create_container_if_not_exists(&self, container: &str, options: &ContainerOptions) -> ServiceResult<bool> {
        validate_container_name(container)?;
        let dir = self.container_dir(container);
        if dir.is_dir() {
            return Ok(false);
        }
        create_dir_chain(&dir)?;
        create_dir_chain(&self.meta_dir(container))?;
        fs::write(self.container_file(container), serde_json::to_vec_pretty(options)?)?;
        Ok(true)
    }

    fn delete_container_if_exists(&self, container: &str) -> ServiceResult<bool> {
        let dir = self.container_dir(container);
        if !dir.is_dir() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        remove_if_exists(fs::remove_dir_all(self.meta_dir(container)))?;
        remove_if_exists(fs::remove_file(self.container_file(container)))?;
        Ok(true)
    }

    fn container_exists(&self, container: &str) -> ServiceResult<bool> {
        Ok(self.container_dir(container).is_dir())
    }

    fn put_block_blob(
        &self,
        container: &str,
        name: &str,
        data: &[u8],
        properties: &BlobProperties,
    ) -> ServiceResult<BlobItem> {
        validate_blob_name(name)?;
        let dir = self.require_container(container)?;
        let path = join_name(&dir, name);
        let sidecar = self.sidecar(container, name);
        for file in [&path, &sidecar] {
            if let Some(parent) = file.parent() {
                create_dir_chain(parent)?;
            }
        }

        fs::write(&path, data)?;
        let item = BlobItem::describe(name, data, properties);
        fs::write(&sidecar, serde_json::to_vec_pretty(&item)?)?;
        debug!("Stored blob {} in container {} ({} bytes)", name, container, data.len());
        Ok(item)
    }

    fn list_blobs(&self, container: &str, prefix: Option<&str>) -> ServiceResult<Vec<BlobItem>> {
        let dir = self.require_container(container)?;
        let prefix = prefix.unwrap_or("");
        let mut items = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&dir)
                .map_err(|e| ServiceError::Backend(e.to_string()))?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if name.starts_with(prefix) {
                items.push(self.read_item(container, &name, entry.path())?);
            }
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    fn get_blob(&self, container: &str, name: &str) -> ServiceResult<Vec<u8>> {
        validate_blob_name(name)?;
        let dir = self.require_container(container)?;
        fs::read(join_name(&dir, name)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => blob_not_found(container, name),
            _ => e.into(),
        })
    }
}
