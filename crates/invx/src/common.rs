//! 📦 Common data structures: the nouns of the ingestion pipeline.
//!
//! 🎬 COLD OPEN: INT. BLOB STORE. 3:47 AM.
//!
//! A collector somewhere just wrote `Resources/ec2/instance/i-0123.json`. It did not
//! tell anyone. It never does. A notification crawled out of the bucket, got wrapped
//! in a bus message, got wrapped again in a queue message, and finally landed on our
//! doorstep looking like a Russian doll that had been through customs twice.
//!
//! These structs are what we unwrap it into. They are small. They are boring.
//! They carry the whole pipeline on their backs. Please tip your structs. 🦆
//!
//! 🧠 Knowledge graph:
//! - `StorageWriteRecord`: "an object landed at bucket/key". Produced by `envelopes`.
//! - `IndexTarget`: `(index, doc_id)`, produced by `routing`. Deterministic per key.
//! - `IndexableDocument`: fixed-up JSON body + its target. Consumed by `composers`.
//! - `BulkRequestBody`: NDJSON payload under the byte budget. Produced by `composers`.
//! - `BulkResponse` / `BulkItemResult` / `ItemOutcome`: what the cluster said back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

/// ⚠️ Per-item error types that mean "your document's shape is wrong", not "try again later".
///
/// After the schema fixups have run, one of these means a brand new incompatibility
/// showed up in the collector output. Requeueing it would loop forever, so we don't.
/// `document_parsing_exception` is what newer clusters call the same thing.
pub const MAPPER_REJECTION_TYPES: [&str; 2] =
    ["mapper_parsing_exception", "document_parsing_exception"];

/// 🪣 One object landed in the blob store. Bucket, key, and how many times we've tried.
///
/// Ephemeral: lives for one invocation. The object itself is the durable record.
/// `key` is always the *decoded* storage key (no `%2F`, no `+` for spaces).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageWriteRecord {
    pub bucket: String,
    pub key: String,
    /// 🔄 0 for a fresh notification, n for the n-th requeue.
    #[serde(default)]
    pub attempt: u32,
}

impl StorageWriteRecord {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            attempt: 0,
        }
    }

    /// 🔄 Same object, one more lap around the queue.
    pub fn next_attempt(&self) -> Self {
        Self {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            attempt: self.attempt.saturating_add(1),
        }
    }

    /// 📡 `s3://bucket/key`, for logs that humans read at 3am.
    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

/// 🎯 Where a document lives in the cluster: `(index, doc_id)`.
///
/// Identical keys always produce identical targets. That single property is what
/// makes redelivery, requeue, and "oops we ran it twice" all harmless upserts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexTarget {
    pub index: String,
    pub doc_id: String,
}

impl IndexTarget {
    pub fn new(index: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            doc_id: doc_id.into(),
        }
    }
}

impl std::fmt::Display for IndexTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.doc_id)
    }
}

/// 📄 A parsed, fixed-up resource snapshot and the address it is headed to.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexableDocument {
    pub target: IndexTarget,
    pub body: Value,
}

/// 📦 One NDJSON `_bulk` payload, plus the targets it carries in submission order.
///
/// The payload always ends with `\n` when non-empty. The bulk API is very particular
/// about that trailing newline. Three engineers lost weekends to it. Respect the newline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkRequestBody {
    pub payload: String,
    pub targets: Vec<IndexTarget>,
}

impl BulkRequestBody {
    /// 📏 Serialized size in bytes. The number the cluster actually cares about.
    pub fn len_bytes(&self) -> usize {
        self.payload.len()
    }

    pub fn doc_count(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// ➕ Append one already-rendered command+document unit (both lines, both newlines).
    pub(crate) fn push_unit(&mut self, unit: &str, target: IndexTarget) {
        self.payload.push_str(unit);
        self.targets.push(target);
    }
}

/// 📬 The `_bulk` response: `{took, errors, items: [{index: {...}}]}`.
///
/// `errors: true` is NOT a failed request. It is a successful request with
/// some disappointed items inside. Like a group project.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub took: u64,
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<BulkResponseItem>,
}

/// 📋 One entry of `items`. We only ever send `index` operations, so anything else
/// is a surprise and gets logged as one.
///
/// Operations stay explicit fields. Flattened fields are buffered, and buffered numbers
/// can't be read back as `u16` under `arbitrary_precision`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkResponseItem {
    #[serde(default)]
    pub index: Option<BulkItemResult>,
    #[serde(default)]
    pub create: Option<Value>,
    #[serde(default)]
    pub update: Option<Value>,
    #[serde(default)]
    pub delete: Option<Value>,
}

impl BulkResponseItem {
    /// 🤨 Whatever non-`index` operation the cluster answered, for the log line.
    fn unexpected_operation(&self) -> Option<(&'static str, &Value)> {
        [("create", &self.create), ("update", &self.update), ("delete", &self.delete)]
            .into_iter()
            .find_map(|(name, result)| result.as_ref().map(|result| (name, result)))
    }
}

/// 🧾 The cluster's verdict on one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkItemResult {
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_id", default)]
    pub doc_id: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl BulkItemResult {
    pub fn target(&self) -> IndexTarget {
        IndexTarget::new(self.index.clone(), self.doc_id.clone())
    }

    /// ✅ 200 (updated) and 201 (created) are the only happy endings.
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 201)
    }

    /// 🏷️ `error.type`, when the cluster bothered to tell us.
    pub fn error_type(&self) -> Option<&str> {
        self.error.as_ref()?.get("type")?.as_str()
    }

    /// 💬 `error.reason`, for the log line.
    pub fn error_reason(&self) -> Option<&str> {
        self.error.as_ref()?.get("reason")?.as_str()
    }

    pub fn is_mapper_rejection(&self) -> bool {
        self.error_type()
            .is_some_and(|kind| MAPPER_REJECTION_TYPES.contains(&kind))
    }

    /// 🚦 Sort the verdict into one of three buckets.
    pub fn classify(self) -> ItemOutcome {
        if self.is_success() {
            ItemOutcome::Indexed(self)
        } else if self.is_mapper_rejection() {
            ItemOutcome::Rejected(self)
        } else {
            ItemOutcome::Retry(self)
        }
    }
}

/// 🚦 What happens next for one submitted document.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// ✅ Durable. Nothing to do.
    Indexed(BulkItemResult),
    /// 🔄 Transient or unknown failure: requeue and let a later invocation retry.
    Retry(BulkItemResult),
    /// 💀 Schema rejection that survived the fixups: log loudly, drop.
    Rejected(BulkItemResult),
}

impl BulkResponse {
    /// 🚦 Classify every `index` item. Non-`index` entries are logged and skipped.
    pub fn outcomes(self) -> Vec<ItemOutcome> {
        let mut outcomes = Vec::with_capacity(self.items.len());
        for item in self.items {
            match item.index {
                Some(result) => outcomes.push(result.classify()),
                None => {
                    // 🤨 we only send `index` commands. the cluster answered a question we didn't ask.
                    match item.unexpected_operation() {
                        Some((operation, result)) => error!(
                            "💀 Bulk response item was a '{}' operation, skipping it: {}",
                            operation, result
                        ),
                        None => error!("💀 Bulk response item carried no operation at all, skipping it"),
                    }
                }
            }
        }
        outcomes
    }
}
