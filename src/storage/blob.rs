//! S3-compatible blob adapter.
//!
//! Talks to MinIO (or any S3 endpoint) with path-style addressing and
//! static credentials. Failures are classified into the three
//! [`BlobError`] kinds; nothing here retries.

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Region, SharedCredentialsProvider};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::{Client, Config};
use std::time::Duration;

use super::{BlobError, BlobStore};

/// Connection settings for the blob backend.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
}

/// Blob store backed by an S3-compatible endpoint.
pub struct S3BlobStore {
    client: Client,
}

impl S3BlobStore {
    /// Build a client for the given endpoint.
    ///
    /// Path-style addressing is forced because MinIO does not resolve
    /// virtual-host bucket names.
    pub fn new(config: BlobConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "static",
        );

        let region = Region::new(config.region.unwrap_or_else(|| "us-east-1".to_string()));

        let s3_config = Config::builder()
            .credentials_provider(SharedCredentialsProvider::new(credentials))
            .region(region)
            .endpoint_url(&config.endpoint)
            .force_path_style(true)
            .behavior_version_latest()
            .build();

        Self {
            client: Client::from_conf(s3_config),
        }
    }

    /// Classify a service error by its S3 error code.
    fn classify(code: Option<&str>, message: String) -> BlobError {
        match code {
            Some("NoSuchKey") | Some("NoSuchBucket") | Some("NotFound") => BlobError::NotFound,
            Some("AccessDenied") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch") => {
                BlobError::AuthFailure(message)
            }
            _ => BlobError::Transport(message),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BlobError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| {
                let svc = err.into_service_error();
                Self::classify(svc.code(), svc.to_string())
            })?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let svc = err.into_service_error();
                if svc.is_no_such_key() {
                    BlobError::NotFound
                } else {
                    Self::classify(svc.code(), svc.to_string())
                }
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| BlobError::Transport(e.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BlobError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let svc = err.into_service_error();
                Self::classify(svc.code(), svc.to_string())
            })?;
        Ok(())
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, BlobError> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| BlobError::Transport(e.to_string()))?;
        let request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| {
                let svc = err.into_service_error();
                Self::classify(svc.code(), svc.to_string())
            })?;
        Ok(request.uri().to_string())
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, BlobError> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| BlobError::Transport(e.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| {
                let svc = err.into_service_error();
                Self::classify(svc.code(), svc.to_string())
            })?;
        Ok(request.uri().to_string())
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), BlobError> {
        let head = self.client.head_bucket().bucket(bucket).send().await;
        match head {
            Ok(_) => Ok(()),
            Err(err) => {
                let svc = err.into_service_error();
                if !svc.is_not_found() {
                    return Err(Self::classify(svc.code(), svc.to_string()));
                }
                tracing::info!(bucket, "creating missing bucket");
                self.client
                    .create_bucket()
                    .bucket(bucket)
                    .send()
                    .await
                    .map(|_| ())
                    .or_else(|err| {
                        let svc = err.into_service_error();
                        // Lost a create race with another instance.
                        if svc.is_bucket_already_owned_by_you() {
                            Ok(())
                        } else {
                            Err(Self::classify(svc.code(), svc.to_string()))
                        }
                    })
            }
        }
    }
}
