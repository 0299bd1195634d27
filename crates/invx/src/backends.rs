//! 🔌 Backends: where the real I/O happens.
//!
//! 🪣 Blob stores hand us snapshot objects. 📨 Queues take requeued records back.
//! 🔍 Search clusters swallow bulk bodies and answer with verdicts.
//!
//! 🎭 This module is the casting agency. Each concern is a trait, each trait has an enum
//! that dispatches to the concrete implementations, and each enum has a `from_config`
//! resolver. The supervisor only ever talks to the enums, so it neither knows nor cares
//! whether the cluster is a real domain or a `BTreeMap` in a trench coat.
//!
//! 🦆 The duck is here because every file must have one. This is law.

use crate::app_config::{BlobStoreConfig, QueueConfig, SearchConfig};
use crate::common::{BulkRequestBody, BulkResponse, StorageWriteRecord};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod elasticsearch;
pub mod file;
pub mod in_mem;
pub mod s3;
pub mod sqs;

pub use elasticsearch::{ElasticsearchCluster, ElasticsearchConfig};
pub use file::{FileBlobStore, FileBlobStoreConfig};
pub use in_mem::{InMemoryBlobStore, InMemoryCluster, InMemoryQueue};
pub use s3::{S3BlobStore, S3BlobStoreConfig};
pub use sqs::{SqsQueue, SqsQueueConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 🧾 Why an object could not be fetched. Every variant is per-record and recoverable:
/// the supervisor logs it, maybe requeues it, and moves on to the next record.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("🕳️ object s3://{bucket}/{key} does not exist")]
    NotFound { bucket: String, key: String },
    #[error("🔒 access denied to s3://{bucket}/{key}")]
    AccessDenied { bucket: String, key: String },
    #[error("💀 object s3://{bucket}/{key} could not be read: {reason}")]
    Unreadable {
        bucket: String,
        key: String,
        reason: String,
    },
    #[error("📡 transport failure fetching s3://{bucket}/{key}")]
    Transport {
        bucket: String,
        key: String,
        #[source]
        source: BoxError,
    },
}

impl FetchError {
    pub fn not_found(record: &StorageWriteRecord) -> Self {
        Self::NotFound {
            bucket: record.bucket.clone(),
            key: record.key.clone(),
        }
    }

    pub fn access_denied(record: &StorageWriteRecord) -> Self {
        Self::AccessDenied {
            bucket: record.bucket.clone(),
            key: record.key.clone(),
        }
    }

    pub fn unreadable(record: &StorageWriteRecord, reason: impl Into<String>) -> Self {
        Self::Unreadable {
            bucket: record.bucket.clone(),
            key: record.key.clone(),
            reason: reason.into(),
        }
    }

    pub fn transport(record: &StorageWriteRecord, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            bucket: record.bucket.clone(),
            key: record.key.clone(),
            source: source.into(),
        }
    }
}

// ===== Blob store =====

/// 🪣 Reads snapshot objects by `(bucket, key)`.
#[async_trait]
pub trait BlobStore: std::fmt::Debug + Send + Sync {
    /// 📥 The full object body as UTF-8 text.
    async fn fetch_object(&self, record: &StorageWriteRecord) -> Result<String, FetchError>;
}

#[derive(Debug)]
pub enum BlobStoreBackend {
    S3(S3BlobStore),
    File(FileBlobStore),
    InMemory(InMemoryBlobStore),
}

impl BlobStoreBackend {
    pub async fn from_config(config: &BlobStoreConfig) -> Result<Self> {
        Ok(match config {
            BlobStoreConfig::S3(s3_config) => Self::S3(S3BlobStore::new(s3_config).await),
            BlobStoreConfig::File(file_config) => Self::File(FileBlobStore::new(file_config)?),
        })
    }
}

#[async_trait]
impl BlobStore for BlobStoreBackend {
    async fn fetch_object(&self, record: &StorageWriteRecord) -> Result<String, FetchError> {
        match self {
            Self::S3(store) => store.fetch_object(record).await,
            Self::File(store) => store.fetch_object(record).await,
            Self::InMemory(store) => store.fetch_object(record).await,
        }
    }
}

impl From<InMemoryBlobStore> for BlobStoreBackend {
    fn from(store: InMemoryBlobStore) -> Self {
        Self::InMemory(store)
    }
}

// ===== Ingest queue =====

/// 📨 Accepts one message body per call. What's inside is the caller's business.
#[async_trait]
pub trait IngestQueue: std::fmt::Debug + Send + Sync {
    async fn enqueue(&self, message_body: String) -> Result<()>;
}

#[derive(Debug)]
pub enum QueueBackend {
    Sqs(SqsQueue),
    InMemory(InMemoryQueue),
}

impl QueueBackend {
    pub async fn from_config(config: &QueueConfig) -> Result<Self> {
        Ok(match config {
            QueueConfig::Sqs(sqs_config) => Self::Sqs(SqsQueue::new(sqs_config).await),
            QueueConfig::InMemory => Self::InMemory(InMemoryQueue::default()),
        })
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self, Self::InMemory(_))
    }
}

#[async_trait]
impl IngestQueue for QueueBackend {
    async fn enqueue(&self, message_body: String) -> Result<()> {
        match self {
            Self::Sqs(queue) => queue.enqueue(message_body).await,
            Self::InMemory(queue) => queue.enqueue(message_body).await,
        }
    }
}

impl From<InMemoryQueue> for QueueBackend {
    fn from(queue: InMemoryQueue) -> Self {
        Self::InMemory(queue)
    }
}

// ===== Search cluster =====

/// 🔍 The handful of cluster operations the pipeline needs.
///
/// # Contract
/// - `submit_bulk` returns `Err` only when the request as a whole failed (transport, non-2xx,
///   unparseable response). Per-item failures come back inside `Ok(BulkResponse)`.
/// - `create_index` treats "already exists" as success. Two invocations racing to create
///   the same index is normal, not an incident.
#[async_trait]
pub trait SearchCluster: std::fmt::Debug + Send + Sync {
    async fn submit_bulk(&self, body: &BulkRequestBody) -> Result<BulkResponse>;
    async fn index_exists(&self, index: &str) -> Result<bool>;
    async fn create_index(&self, index: &str, definition: &Value) -> Result<()>;
    async fn put_document(&self, index: &str, doc_id: &str, document: &Value) -> Result<()>;
}

#[derive(Debug)]
pub enum ClusterBackend {
    Elasticsearch(ElasticsearchCluster),
    InMemory(InMemoryCluster),
}

impl ClusterBackend {
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        Ok(match config {
            SearchConfig::Elasticsearch(es_config) => {
                Self::Elasticsearch(ElasticsearchCluster::new(es_config.clone())?)
            }
            SearchConfig::InMemory => Self::InMemory(InMemoryCluster::default()),
        })
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self, Self::InMemory(_))
    }
}

#[async_trait]
impl SearchCluster for ClusterBackend {
    async fn submit_bulk(&self, body: &BulkRequestBody) -> Result<BulkResponse> {
        match self {
            Self::Elasticsearch(cluster) => cluster.submit_bulk(body).await,
            Self::InMemory(cluster) => cluster.submit_bulk(body).await,
        }
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        match self {
            Self::Elasticsearch(cluster) => cluster.index_exists(index).await,
            Self::InMemory(cluster) => cluster.index_exists(index).await,
        }
    }

    async fn create_index(&self, index: &str, definition: &Value) -> Result<()> {
        match self {
            Self::Elasticsearch(cluster) => cluster.create_index(index, definition).await,
            Self::InMemory(cluster) => cluster.create_index(index, definition).await,
        }
    }

    async fn put_document(&self, index: &str, doc_id: &str, document: &Value) -> Result<()> {
        match self {
            Self::Elasticsearch(cluster) => cluster.put_document(index, doc_id, document).await,
            Self::InMemory(cluster) => cluster.put_document(index, doc_id, document).await,
        }
    }
}

impl From<InMemoryCluster> for ClusterBackend {
    fn from(cluster: InMemoryCluster) -> Self {
        Self::InMemory(cluster)
    }
}
