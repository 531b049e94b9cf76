// src/storage/s3.rs

//! S3-compatible blob backend
//!
//! Two bucket handles are kept: one on the internal endpoint for reads and
//! writes, one on the external endpoint for presigned URLs handed to
//! clients. Both use path-style addressing so MinIO-style endpoints work.

use super::{BlobStore, validate_key};
use crate::error::{Error, Result};
use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// Connection settings for an S3-compatible service
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Endpoint used by the service itself
    pub internal_endpoint: String,
    /// Endpoint embedded in presigned URLs; defaults to the internal one
    #[serde(default)]
    pub external_endpoint: Option<String>,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_presign_expiry")]
    pub presign_expiry_secs: u32,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presign_expiry() -> u32 {
    60 * 60
}

pub struct S3Storage {
    internal: Box<Bucket>,
    external: Box<Bucket>,
    presign_expiry_secs: u32,
}

impl S3Storage {
    pub fn new(config: &S3Config) -> Result<Self> {
        let credentials = Credentials::new(
            Some(config.access_key.as_str()),
            Some(config.secret_key.as_str()),
            None,
            None,
            None,
        )
        .map_err(|e| Error::ObjectStore(format!("invalid S3 credentials: {e}")))?;

        let bucket = |endpoint: &str| -> Result<Box<Bucket>> {
            let region = Region::Custom {
                region: config.region.clone(),
                endpoint: endpoint.to_string(),
            };
            Ok(Bucket::new(&config.bucket, region, credentials.clone())?.with_path_style())
        };

        let internal = bucket(&config.internal_endpoint)?;
        let external = bucket(
            config
                .external_endpoint
                .as_deref()
                .unwrap_or(&config.internal_endpoint),
        )?;

        Ok(Self {
            internal,
            external,
            presign_expiry_secs: config.presign_expiry_secs,
        })
    }
}

fn check_status(key: &str, code: u16) -> Result<()> {
    match code {
        200..=299 => Ok(()),
        404 => Err(Error::NotFound(format!("blob {key}"))),
        _ => Err(Error::ObjectStore(format!("request for {key} returned HTTP {code}"))),
    }
}

#[async_trait]
impl BlobStore for S3Storage {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        validate_key(key)?;
        let response = self
            .internal
            .put_object_with_content_type(key, bytes, content_type)
            .await?;
        check_status(key, response.status_code())
    }

    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        self.put(key, &bytes, content_type).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let response = match self.internal.get_object(key).await {
            Ok(response) => response,
            Err(S3Error::HttpFailWithBody(404, _)) => {
                return Err(Error::NotFound(format!("blob {key}")));
            }
            Err(e) => return Err(e.into()),
        };
        check_status(key, response.status_code())?;
        Ok(response.bytes().to_vec())
    }

    async fn get_url(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(self
            .external
            .presign_get(key, self.presign_expiry_secs, None)
            .await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let response = self.internal.delete_object(key).await?;
        match check_status(key, response.status_code()) {
            Err(Error::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    /// Read-modify-write; callers serialize appends per build
    async fn append(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut content = match self.get(key).await {
            Ok(existing) => existing,
            Err(Error::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        debug!("Appending {} bytes to {} ({} existing)", bytes.len(), key, content.len());
        content.extend_from_slice(bytes);
        self.put(key, &content, "text/plain").await
    }
}
