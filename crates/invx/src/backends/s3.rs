//! 🪣 S3 blob store: `GetObject`, read the whole body, hand back text.
//!
//! Snapshot objects are small JSON documents, so there's no streaming here. We collect
//! the body and decode it. `NoSuchKey` and `AccessDenied` get their own `FetchError`
//! variants because the supervisor logs them differently; everything else is transport.

use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::ProvideErrorMetadata;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::backends::{BlobStore, FetchError};
use crate::common::StorageWriteRecord;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct S3BlobStoreConfig {
    /// 🌎 Region override. Unset means the function's own region from the environment.
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
}

impl S3BlobStore {
    /// 🔧 Credentials and region come from the usual chain: env vars, profile, role.
    pub async fn new(config: &S3BlobStoreConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let the_aws_config = loader.load().await;
        debug!("🪣 S3 client ready (region: {:?})", the_aws_config.region());
        Self {
            client: aws_sdk_s3::Client::new(&the_aws_config),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn fetch_object(&self, record: &StorageWriteRecord) -> Result<String, FetchError> {
        trace!("📥 GetObject {}", record.uri());
        let output = self
            .client
            .get_object()
            .bucket(&record.bucket)
            .key(&record.key)
            .send()
            .await
            .map_err(|err| {
                if let Some(service_error) = err.as_service_error() {
                    if service_error.is_no_such_key() {
                        return FetchError::not_found(record);
                    }
                    if service_error.code() == Some("AccessDenied") {
                        return FetchError::access_denied(record);
                    }
                }
                FetchError::transport(record, err)
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|err| FetchError::transport(record, err))?
            .into_bytes();

        String::from_utf8(bytes.to_vec()).map_err(|err| FetchError::unreadable(record, err.to_string()))
    }
}
