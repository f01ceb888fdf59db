use crate::config::StorageConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Failure modes of a document write.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An object already exists under the requested key. Writes never
    /// overwrite, so the caller must treat this as a conflict.
    #[error("an object already exists under this key")]
    AlreadyExists,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Durable binary storage for result documents.
///
/// The store has no transactional semantics of its own; the ingestion
/// pipeline compensates around it.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Write `bytes` under `key`, refusing to overwrite an existing object.
    /// Returns the stored path.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<String, StoreError>;

    /// Best-effort delete. Per-key failures are logged; an error is returned
    /// if any key could not be removed so the caller can record the outcome.
    async fn remove(&self, keys: &[String]) -> Result<()>;

    /// Probe whether an object exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// S3-backed document store for result PDFs
pub struct S3DocumentStore {
    client: S3Client,
    bucket: String,
}

impl S3DocumentStore {
    /// Create a new S3 document store.
    ///
    /// The client carries an explicitly constructed service credential from
    /// the environment's default chain, scoped by the configured bucket; it
    /// is passed into the orchestrator rather than held as global state.
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(Duration::from_secs(config.operation_timeout_secs))
                    .build(),
            )
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 document store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl DocumentStore for S3DocumentStore {
    #[instrument(skip(self, bytes), fields(key = %key, size_bytes = bytes.len()))]
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError> {
        let body = ByteStream::from(bytes);

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            // Conditional write: fail instead of overwriting an existing key.
            .if_none_match("*")
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(key = %key, "Document uploaded");
                Ok(key.to_string())
            }
            Err(err) if is_precondition_failure(&err) => Err(StoreError::AlreadyExists),
            Err(err) => Err(StoreError::Other(
                anyhow::Error::new(err).context("Failed to upload document"),
            )),
        }
    }

    #[instrument(skip(self))]
    async fn remove(&self, keys: &[String]) -> Result<()> {
        let mut failed = 0usize;

        for key in keys {
            if let Err(err) = self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                warn!(error = %err, key = %key, "Failed to delete document");
                failed += 1;
            } else {
                debug!(key = %key, "Document deleted");
            }
        }

        if failed > 0 {
            anyhow::bail!("{failed} of {} documents could not be removed", keys.len());
        }

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
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
                    Err(e).context("Failed to check document existence")
                }
            }
        }
    }
}

/// True when the service rejected the write because the key already exists
/// (HTTP 412 against the `If-None-Match: *` condition).
fn is_precondition_failure<E>(err: &SdkError<E>) -> bool {
    match err {
        SdkError::ServiceError(ctx) => ctx.raw().status().as_u16() == 412,
        _ => false,
    }
}
