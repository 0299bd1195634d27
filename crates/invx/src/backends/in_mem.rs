//! 🧠 In-memory backends: a bucket, a queue, and a cluster that all fit in RAM.
//!
//! 🎬 The places where data goes to be tested, not persisted.
//!
//! Each double is `Clone` over shared state, so a test can keep a handle, hand a clone
//! to the supervisor, and inspect what happened afterwards. The cluster parses the real
//! NDJSON it receives and upserts by `(index, id)`, so idempotency and partial failures
//! can be asserted end to end. The CLI's `--dry-run` uses the queue and cluster too.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::backends::{BlobStore, FetchError, IngestQueue, SearchCluster};
use crate::common::{BulkItemResult, BulkRequestBody, BulkResponse, BulkResponseItem, IndexTarget, StorageWriteRecord};

/// 🔒 Poisoned or not, the data inside is still the data we want to look at.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ===== Blob store =====

#[derive(Debug, Clone, Default)]
pub struct InMemoryBlobStore {
    objects: Arc<Mutex<HashMap<(String, String), String>>>,
    denied: Arc<Mutex<Vec<(String, String)>>>,
    fetched: Arc<Mutex<Vec<String>>>,
}

impl InMemoryBlobStore {
    pub fn put_object(&self, bucket: &str, key: &str, body: impl Into<String>) {
        lock(&self.objects).insert((bucket.to_string(), key.to_string()), body.into());
    }

    /// 🔒 Make a key answer `AccessDenied`.
    pub fn deny(&self, bucket: &str, key: &str) {
        lock(&self.denied).push((bucket.to_string(), key.to_string()));
    }

    /// 📋 Every key fetched so far, in order.
    pub fn fetched_keys(&self) -> Vec<String> {
        lock(&self.fetched).clone()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn fetch_object(&self, record: &StorageWriteRecord) -> Result<String, FetchError> {
        lock(&self.fetched).push(record.key.clone());
        let address = (record.bucket.clone(), record.key.clone());
        if lock(&self.denied).contains(&address) {
            return Err(FetchError::access_denied(record));
        }
        lock(&self.objects)
            .get(&address)
            .cloned()
            .ok_or_else(|| FetchError::not_found(record))
    }
}

// ===== Queue =====

#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    messages: Arc<Mutex<Vec<String>>>,
}

impl InMemoryQueue {
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl IngestQueue for InMemoryQueue {
    async fn enqueue(&self, message_body: String) -> Result<()> {
        lock(&self.messages).push(message_body);
        Ok(())
    }
}

// ===== Cluster =====

#[derive(Debug, Default)]
struct IndexState {
    definition: Option<Value>,
    documents: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct ClusterState {
    indices: BTreeMap<String, IndexState>,
    scripted_item_failures: HashMap<IndexTarget, VecDeque<(u16, String)>>,
    scripted_request_failures: VecDeque<u16>,
    scripted_document_failures: usize,
    bulk_requests: Vec<BulkRequestBody>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    /// 🎭 The next submission of `target` comes back with `status` and `error_type`.
    /// Script it twice to fail twice.
    pub fn fail_item_once(&self, target: IndexTarget, status: u16, error_type: &str) {
        lock(&self.state)
            .scripted_item_failures
            .entry(target)
            .or_default()
            .push_back((status, error_type.to_string()));
    }

    /// 💥 The next `_bulk` request fails as a whole with `status`.
    pub fn fail_next_request(&self, status: u16) {
        lock(&self.state).scripted_request_failures.push_back(status);
    }

    /// 🧱 The next `count` single-document writes fail.
    pub fn fail_next_document_writes(&self, count: usize) {
        lock(&self.state).scripted_document_failures += count;
    }

    pub fn document(&self, index: &str, doc_id: &str) -> Option<Value> {
        lock(&self.state)
            .indices
            .get(index)
            .and_then(|state| state.documents.get(doc_id).cloned())
    }

    /// 📸 Every stored document, keyed by target.
    pub fn documents(&self) -> BTreeMap<IndexTarget, Value> {
        let state = lock(&self.state);
        state
            .indices
            .iter()
            .flat_map(|(index, index_state)| {
                index_state
                    .documents
                    .iter()
                    .map(|(doc_id, body)| (IndexTarget::new(index.clone(), doc_id.clone()), body.clone()))
            })
            .collect()
    }

    pub fn index_definition(&self, index: &str) -> Option<Value> {
        lock(&self.state)
            .indices
            .get(index)
            .and_then(|state| state.definition.clone())
    }

    /// 📋 Every bulk body received, including the ones that were failed on purpose.
    pub fn bulk_requests(&self) -> Vec<BulkRequestBody> {
        lock(&self.state).bulk_requests.clone()
    }
}

#[async_trait]
impl SearchCluster for InMemoryCluster {
    async fn submit_bulk(&self, body: &BulkRequestBody) -> Result<BulkResponse> {
        let mut state = lock(&self.state);
        state.bulk_requests.push(body.clone());
        if let Some(status) = state.scripted_request_failures.pop_front() {
            anyhow::bail!("💀 Bulk request rejected with {} (scripted)", status);
        }

        let mut lines = body.payload.lines();
        let mut items = Vec::new();
        while let Some(command_line) = lines.next() {
            let command: Value = serde_json::from_str(command_line)
                .context("💀 In-memory cluster got a command line that isn't JSON")?;
            let source_line = lines
                .next()
                .context("💀 In-memory cluster got a command line with no document after it")?;
            let document: Value = serde_json::from_str(source_line)
                .context("💀 In-memory cluster got a document line that isn't JSON")?;

            let target = IndexTarget::new(
                command["index"]["_index"].as_str().unwrap_or_default(),
                command["index"]["_id"].as_str().unwrap_or_default(),
            );

            let scripted = state
                .scripted_item_failures
                .get_mut(&target)
                .and_then(VecDeque::pop_front);
            let result = match scripted {
                Some((status, error_type)) => BulkItemResult {
                    index: target.index,
                    doc_id: target.doc_id,
                    status,
                    error: Some(json!({"type": error_type, "reason": "scripted failure"})),
                },
                None => {
                    let index_state = state.indices.entry(target.index.clone()).or_default();
                    let existed = index_state
                        .documents
                        .insert(target.doc_id.clone(), document)
                        .is_some();
                    BulkItemResult {
                        index: target.index,
                        doc_id: target.doc_id,
                        status: if existed { 200 } else { 201 },
                        error: None,
                    }
                }
            };
            items.push(BulkResponseItem {
                index: Some(result),
                ..BulkResponseItem::default()
            });
        }

        let errors = items
            .iter()
            .any(|item| item.index.as_ref().is_some_and(|result| !result.is_success()));
        Ok(BulkResponse {
            took: 1,
            errors,
            items,
        })
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(lock(&self.state).indices.contains_key(index))
    }

    async fn create_index(&self, index: &str, definition: &Value) -> Result<()> {
        let mut state = lock(&self.state);
        let index_state = state.indices.entry(index.to_string()).or_default();
        if index_state.definition.is_none() {
            index_state.definition = Some(definition.clone());
        }
        Ok(())
    }

    async fn put_document(&self, index: &str, doc_id: &str, document: &Value) -> Result<()> {
        let mut state = lock(&self.state);
        if state.scripted_document_failures > 0 {
            state.scripted_document_failures -= 1;
            anyhow::bail!("💀 Document write to '{}/{}' rejected (scripted)", index, doc_id);
        }
        state
            .indices
            .entry(index.to_string())
            .or_default()
            .documents
            .insert(doc_id.to_string(), document.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn the_body(units: &[(&str, &str, Value)]) -> BulkRequestBody {
        let mut body = BulkRequestBody::default();
        for (index, id, doc) in units {
            let unit = format!(
                "{}\n{}\n",
                json!({"index": {"_index": index, "_id": id}}),
                doc
            );
            body.push_unit(&unit, IndexTarget::new(*index, *id));
        }
        body
    }

    #[tokio::test]
    async fn the_one_where_sending_the_same_doc_twice_is_an_upsert() -> Result<()> {
        let the_cluster = InMemoryCluster::default();
        let the_payload = the_body(&[("resources_ec2_instance", "i-1", json!({"v": 1}))]);

        let the_first = the_cluster.submit_bulk(&the_payload).await?;
        let the_second = the_cluster.submit_bulk(&the_payload).await?;

        assert_eq!(the_first.items[0].index.as_ref().map(|r| r.status), Some(201));
        assert_eq!(the_second.items[0].index.as_ref().map(|r| r.status), Some(200));
        assert_eq!(the_cluster.documents().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_scripted_failure_happens_exactly_once() -> Result<()> {
        let the_cluster = InMemoryCluster::default();
        the_cluster.fail_item_once(
            IndexTarget::new("resources_ec2_instance", "i-2"),
            429,
            "es_rejected_execution_exception",
        );
        let the_payload = the_body(&[
            ("resources_ec2_instance", "i-1", json!({"v": 1})),
            ("resources_ec2_instance", "i-2", json!({"v": 2})),
        ]);

        let the_response = the_cluster.submit_bulk(&the_payload).await?;
        assert!(the_response.errors);
        assert!(the_cluster.document("resources_ec2_instance", "i-2").is_none());

        let the_retry = the_cluster.submit_bulk(&the_payload).await?;
        assert!(!the_retry.errors);
        assert_eq!(the_cluster.document("resources_ec2_instance", "i-2"), Some(json!({"v": 2})));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_blob_store_knows_missing_from_forbidden() {
        let the_store = InMemoryBlobStore::default();
        the_store.put_object("inv", "Resources/a/b.json", "{}");
        the_store.deny("inv", "Resources/a/secret.json");

        assert!(the_store.fetch_object(&StorageWriteRecord::new("inv", "Resources/a/b.json")).await.is_ok());
        assert!(matches!(
            the_store.fetch_object(&StorageWriteRecord::new("inv", "Resources/a/c.json")).await,
            Err(FetchError::NotFound { .. })
        ));
        assert!(matches!(
            the_store.fetch_object(&StorageWriteRecord::new("inv", "Resources/a/secret.json")).await,
            Err(FetchError::AccessDenied { .. })
        ));
        assert_eq!(the_store.fetched_keys().len(), 3);
    }
}
