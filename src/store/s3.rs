//! S3 media store.
//!
//! Objects are addressed by the engine's storage paths used directly as S3
//! keys. URL resolution verifies the object exists, then presigns a
//! time-limited GET. Works against AWS or any S3-compatible endpoint
//! (MinIO, LocalStack) via custom endpoint and path-style addressing.

use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::{MediaBlob, MediaRef, MediaStore, MediaStoreError};
use crate::config::MediaConfig;

/// Media store backed by an S3 bucket.
pub struct S3MediaStore {
    client: S3Client,
    bucket: String,
    url_expiry: Duration,
}

impl S3MediaStore {
    /// Build a client for the configured bucket.
    pub async fn connect(config: &MediaConfig) -> Result<Self, MediaStoreError> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 media store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            url_expiry: Duration::from_secs(config.url_expiry_secs),
        })
    }

    /// Get the bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn object_exists(&self, path: &str) -> Result<bool, MediaStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(e)
                        .context("Failed to check media object existence")
                        .map_err(MediaStoreError::backend)
                }
            }
        }
    }

    async fn delete_object(&self, key: &str) -> Result<(), MediaStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("Failed to delete media object")
            .map_err(MediaStoreError::backend)?;
        Ok(())
    }
}

#[async_trait]
impl MediaStore for S3MediaStore {
    #[instrument(skip(self, blob), fields(path = %path, size_bytes = blob.bytes.len()))]
    async fn upload(&self, path: &str, blob: MediaBlob) -> Result<MediaRef, MediaStoreError> {
        let body = ByteStream::from(blob.bytes);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(body)
            .content_type(&blob.content_type)
            .send()
            .await
            .context("Failed to upload media object")
            .map_err(MediaStoreError::backend)?;

        debug!(path = %path, "Media object uploaded");
        Ok(MediaRef::new(path))
    }

    async fn fetch_url(&self, media: &MediaRef) -> Result<String, MediaStoreError> {
        if !self.object_exists(media.path()).await? {
            return Err(MediaStoreError::NotFound {
                path: media.path().to_string(),
            });
        }

        let presigning_config = PresigningConfig::expires_in(self.url_expiry)
            .context("Invalid presigned URL expiry")
            .map_err(MediaStoreError::backend)?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(media.path())
            .presigned(presigning_config)
            .await
            .context("Failed to generate presigned URL")
            .map_err(MediaStoreError::backend)?;

        Ok(presigned.uri().to_string())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn delete(&self, path: &str) -> Result<(), MediaStoreError> {
        // delete_object succeeds on absent keys; the head check supplies the
        // NotFound contract.
        if !self.object_exists(path).await? {
            return Err(MediaStoreError::NotFound {
                path: path.to_string(),
            });
        }

        self.delete_object(path).await?;
        debug!(path = %path, "Media object deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, MediaStoreError> {
        let root = namespace_root(prefix);
        let child_prefix = format!("{root}/");
        let mut removed = 0u64;
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&child_prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .context("Failed to list media objects")
                .map_err(MediaStoreError::backend)?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                self.delete_object(key).await?;
                removed += 1;
            }

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        // the namespace root itself may hold a bare object
        if self.object_exists(&root).await? {
            self.delete_object(&root).await?;
            removed += 1;
        }

        if removed > 0 {
            debug!(prefix = %root, removed = removed, "Media namespace cleared");
        }
        Ok(removed)
    }
}

/// Normalize a deletion prefix to its bare namespace path.
fn namespace_root(prefix: &str) -> String {
    prefix.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_root() {
        assert_eq!(namespace_root("posts/u1/p1"), "posts/u1/p1");
        assert_eq!(namespace_root("posts/u1/p1/"), "posts/u1/p1");
        assert_eq!(namespace_root("posts/u1/p1//"), "posts/u1/p1");
    }
}
