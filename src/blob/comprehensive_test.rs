//! Comprehensive test to verify the blob service abstraction

#[cfg(test)]
mod integration_tests {
    use crate::blob::local_store::LocalBlobStore;
    use crate::blob::mock_store::MockBlobStore;
    use crate::blob::{content_md5, BlobProperties, BlobService, ContainerOptions};
    use crate::error::ServiceError;

    #[test]
    fn test_blob_abstraction_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let backends: Vec<(&str, Box<dyn BlobService>)> = vec![
            ("mock", Box::new(MockBlobStore::new())),
            ("local", Box::new(LocalBlobStore::new(dir.path()).unwrap())),
        ];

        for (name, service) in backends {
            let service = service.as_ref();
            service
                .create_container_if_not_exists("assets", &ContainerOptions::default())
                .expect("create container");

            let files: [(&str, &[u8]); 3] = [
                ("img/logo.png", b"\x89PNG"),
                ("img/icons/x.svg", b"<svg/>"),
                ("readme.txt", b"hello"),
            ];
            for (blob, data) in files {
                service
                    .put_block_blob("assets", blob, data, &BlobProperties::default())
                    .expect("upload");
            }

            let images: Vec<_> = service
                .list_blobs("assets", Some("img/"))
                .unwrap()
                .into_iter()
                .map(|b| b.name)
                .collect();
            assert_eq!(images, vec!["img/icons/x.svg", "img/logo.png"], "backend {}", name);

            let readme = service.list_blobs("assets", Some("readme")).unwrap().remove(0);
            assert_eq!(readme.content_md5, content_md5(b"hello"), "backend {}", name);
            assert_eq!(service.get_blob("assets", "readme.txt").unwrap(), b"hello");

            // Re-upload replaces the content
            service
                .put_block_blob("assets", "readme.txt", b"bye", &BlobProperties::default())
                .unwrap();
            assert_eq!(service.get_blob("assets", "readme.txt").unwrap(), b"bye");

            assert!(service.delete_container_if_exists("assets").unwrap());
            assert!(matches!(
                service.list_blobs("assets", None),
                Err(ServiceError::NotFound(_))
            ));
        }
    }
}
