use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use thiserror::Error;
use tracing::{debug, info, instrument};

const CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("failed to upload {key}: {message}")]
    Upload { key: String, message: String },

    #[error("failed to fetch {key}: {message}")]
    Get { key: String, message: String },

    #[error("failed to delete {key}: {message}")]
    Delete { key: String, message: String },
}

/// Object storage for photo payloads
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Bucket objects are written to
    fn bucket(&self) -> &str;

    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<(), BlobError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    async fn delete(&self, key: &str) -> Result<(), BlobError>;

    /// Publicly readable URL of an object
    fn public_url(&self, key: &str) -> String;
}

/// S3-compatible blob store
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    public_base_url: String,
}

impl S3BlobStore {
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
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
        let public_base_url = public_base_url(config);

        info!(
            bucket = %config.bucket,
            region = %config.region,
            public_base_url = %public_base_url,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            public_base_url,
        })
    }
}

/// Base URL objects are served from, without a trailing slash
fn public_base_url(config: &S3Config) -> String {
    let base = match (&config.public_base_url, &config.endpoint_url) {
        (Some(base), _) => base.clone(),
        (None, Some(endpoint)) if config.force_path_style => {
            format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket)
        }
        (None, Some(endpoint)) => endpoint.replacen("://", &format!("://{}.", config.bucket), 1),
        (None, None) => format!(
            "https://{}.s3.{}.amazonaws.com",
            config.bucket, config.region
        ),
    };
    base.trim_end_matches('/').to_string()
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<(), BlobError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| BlobError::Upload {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        debug!("Object uploaded");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let get_error = |message: String| BlobError::Get {
            key: key.to_string(),
            message,
        };

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| get_error(e.to_string()))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| get_error(e.to_string()))?;

        Ok(body.into_bytes().to_vec())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BlobError::Delete {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        debug!("Object deleted");
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}
