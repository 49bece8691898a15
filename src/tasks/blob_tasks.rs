//! Blob upload and download

use log::{debug, info};

use crate::blob::{BlobService, ContainerOptions};
use crate::error::TaskError;
use crate::files::normalize;
use crate::fs_util::ensure_dir;
use crate::tasks::options::{required, BlobDownloadParams, BlobUploadParams};
use crate::tasks::{TaskContext, TaskReport};

fn delete_container(service: &dyn BlobService, container: &str) -> Result<(), TaskError> {
    if service.delete_container_if_exists(container)? {
        debug!("Container '{}' deleted", container);
    }
    Ok(())
}

fn ensure_container(
    service: &dyn BlobService,
    container: &str,
    options: &ContainerOptions,
    delete_first: bool,
) -> Result<(), TaskError> {
    if delete_first {
        delete_container(service, container)?;
    }
    if service.create_container_if_not_exists(container, options)? {
        debug!("Container '{}' created", container);
    }
    Ok(())
}

/// Content type for a local file, from its extension.
pub fn guess_content_type(path: &std::path::Path) -> String {
    mime_guess::from_path(path).first_or_octet_stream().to_string()
}

/// Local file name of `blob` once `prefix` is removed.
pub fn local_name(blob: &str, prefix: Option<&str>, remove_prefix: bool) -> String {
    match prefix {
        Some(prefix) if remove_prefix && !prefix.is_empty() => {
            normalize(blob.strip_prefix(prefix).unwrap_or(blob))
        }
        _ => normalize(blob),
    }
}

pub async fn upload(ctx: &TaskContext<'_>) -> Result<TaskReport, TaskError> {
    let params: BlobUploadParams = ctx.params()?;
    let container = required(&params.container, "container")?;
    let files = ctx.target.file_sources().map(ctx.base_dir)?;
    let services = params.service.connect(ctx.state)?;
    let service = services.blob.as_ref();

    ensure_container(service, container, &params.container_options, params.container_delete)?;
    for file in &files {
        let data = tokio::fs::read(&file.src).await.map_err(|e| TaskError::io(&file.src, e))?;
        let mut properties = params.blob_properties.clone();
        properties.content_type = Some(guess_content_type(&file.src));

        let item = service.put_block_blob(container, &file.dest, &data, &properties)?;
        debug!(
            "{} uploaded to container {} as {} ({} bytes, md5 {})",
            file.src.display(),
            container,
            item.name,
            item.content_length,
            item.content_md5
        );
    }

    info!("{} file(s) uploaded to container {}", files.len(), container);
    Ok(TaskReport::processed(files.len()))
}

/// Downloads every blob under the prefix into `dest`, then optionally drops the container.
pub async fn download(ctx: &TaskContext<'_>) -> Result<TaskReport, TaskError> {
    let params: BlobDownloadParams = ctx.params()?;
    let (container, dest) = match (required(&params.container, "container"), ctx.target.dest.as_deref()) {
        (Ok(container), Some(dest)) if !dest.is_empty() => (container, dest),
        _ => return Err(TaskError::MissingParameter("container and a destination")),
    };
    let prefix = ctx
        .target
        .src
        .clone()
        .and_then(|src| src.into_vec().into_iter().next())
        .or_else(|| ctx.target.prefix.clone())
        .or_else(|| params.prefix.clone())
        .filter(|p| !p.is_empty());

    let services = params.service.connect(ctx.state)?;
    let service = services.blob.as_ref();

    let blobs = service.list_blobs(container, prefix.as_deref())?;
    let root = ctx.resolve(dest);
    for blob in &blobs {
        let local = root.join(local_name(&blob.name, prefix.as_deref(), params.remove_prefix));
        if let Some(parent) = local.parent() {
            ensure_dir(parent).await?;
        }
        let data = service.get_blob(container, &blob.name)?;
        tokio::fs::write(&local, data).await.map_err(|e| TaskError::io(&local, e))?;
        debug!("{} downloaded from container {} to {}", blob.name, container, local.display());
    }

    if params.container_delete {
        delete_container(service, container)?;
    }

    info!("{} blob(s) downloaded from container {}", blobs.len(), container);
    Ok(TaskReport::processed(blobs.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_local_name() {
        assert_eq!(local_name("TestPrefix/a/b.txt", Some("TestPrefix"), true), "a/b.txt");
        assert_eq!(local_name("TestPrefix/a/b.txt", Some("TestPrefix"), false), "TestPrefix/a/b.txt");
        assert_eq!(local_name("a/b.txt", None, true), "a/b.txt");
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type(Path::new("site/index.html")), "text/html");
        assert_eq!(guess_content_type(Path::new("data.unknownext")), "application/octet-stream");
    }
}
