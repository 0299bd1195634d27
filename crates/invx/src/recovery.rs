//! 🔄 Failure recovery: failed items go back onto the ingest queue as storage-write records.
//!
//! 🎬 INT. BULK RESPONSE. `errors: true`.
//!
//! Some items made it. Some got a 429. One got a 503 because a shard was relocating and
//! felt like sharing. We don't retry inline: the invocation has a deadline and the cluster
//! is obviously busy. Instead every retriable item is turned back into the notification
//! that would have produced it and dropped onto the queue. A later invocation picks it up,
//! re-fetches the object (which may have changed, and that's fine: latest wins), and tries again.
//!
//! The message shape is exactly what the blob store sends on its own:
//! `{"Records":[{"eventSource":"aws:s3","s3":{"bucket":{"name":..},"object":{"key":..}},"requeueAttempt":n}]}`
//! so the envelope normalizer doesn't need a special case for us. 🦆

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::backends::{IngestQueue, QueueBackend};
use crate::common::{IndexTarget, StorageWriteRecord};
use crate::routing::{KeyRouter, encode_key};

/// 📒 Which record produced which target, for this invocation.
///
/// Rebuilding a key from its target works for path-id keys but not hashed ones, and it
/// loses the original bucket. The ledger has both, so it's always consulted first.
#[derive(Debug, Default, Clone)]
pub struct RequeueLedger {
    entries: HashMap<IndexTarget, StorageWriteRecord>,
}

impl RequeueLedger {
    /// 📝 Later records for the same target win; they point at the same object anyway.
    pub fn record(&mut self, target: IndexTarget, record: StorageWriteRecord) {
        self.entries.insert(target, record);
    }

    pub fn lookup(&self, target: &IndexTarget) -> Option<&StorageWriteRecord> {
        self.entries.get(target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Serialize)]
struct RequeueMessage<'a> {
    #[serde(rename = "Records")]
    records: Vec<RequeueRecord<'a>>,
}

#[derive(Serialize)]
struct RequeueRecord<'a> {
    #[serde(rename = "eventSource")]
    event_source: &'static str,
    s3: RequeueS3<'a>,
    #[serde(rename = "requeueAttempt")]
    requeue_attempt: u32,
}

#[derive(Serialize)]
struct RequeueS3<'a> {
    bucket: RequeueBucket<'a>,
    object: RequeueObject,
}

#[derive(Serialize)]
struct RequeueBucket<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct RequeueObject {
    key: String,
}

impl<'a> RequeueRecord<'a> {
    fn from_record(record: &'a StorageWriteRecord) -> Self {
        Self {
            event_source: "aws:s3",
            s3: RequeueS3 {
                bucket: RequeueBucket {
                    name: &record.bucket,
                },
                object: RequeueObject {
                    key: encode_key(&record.key),
                },
            },
            requeue_attempt: record.attempt,
        }
    }
}

/// 📨 Render records into as few queue messages as the size limit allows, order preserved.
///
/// A single record larger than the limit still gets its own message. Keys are capped at
/// 1 KiB by the blob store, so in practice that never happens.
pub fn render_requeue_messages(
    records: &[StorageWriteRecord],
    max_message_bytes: usize,
) -> Result<Vec<String>> {
    const ENVELOPE_OVERHEAD: usize = r#"{"Records":[]}"#.len();

    let mut messages = Vec::new();
    let mut pending: Vec<RequeueRecord<'_>> = Vec::new();
    let mut pending_bytes = ENVELOPE_OVERHEAD;

    for record in records {
        let rendered = RequeueRecord::from_record(record);
        let record_bytes = serde_json::to_string(&rendered)
            .context("💀 Failed to serialize a requeue record")?
            .len();
        let separator = usize::from(!pending.is_empty());

        if !pending.is_empty() && pending_bytes + separator + record_bytes > max_message_bytes {
            messages.push(render_message(std::mem::take(&mut pending))?);
            pending_bytes = ENVELOPE_OVERHEAD;
        }
        pending_bytes += usize::from(!pending.is_empty()) + record_bytes;
        pending.push(rendered);
    }

    if !pending.is_empty() {
        messages.push(render_message(pending)?);
    }
    Ok(messages)
}

fn render_message(records: Vec<RequeueRecord<'_>>) -> Result<String> {
    serde_json::to_string(&RequeueMessage { records }).context("💀 Failed to serialize a requeue message")
}

/// 🔄 Rebuilds failed records and puts them back on the queue.
#[derive(Debug, Clone)]
pub struct FailureRecovery {
    router: KeyRouter,
    fallback_bucket: Option<String>,
    max_message_bytes: usize,
}

impl FailureRecovery {
    pub fn new(router: KeyRouter, fallback_bucket: Option<String>, max_message_bytes: usize) -> Self {
        Self {
            router,
            fallback_bucket,
            max_message_bytes,
        }
    }

    /// 🔙 The record to requeue for a failed target, attempt counter already bumped.
    ///
    /// Ledger first. Without a ledger entry the key is rebuilt from the target and the
    /// configured inventory bucket; hashed targets and a missing bucket are errors.
    pub fn rebuild(&self, target: &IndexTarget, ledger: &RequeueLedger) -> Result<StorageWriteRecord> {
        if let Some(original) = ledger.lookup(target) {
            return Ok(original.next_attempt());
        }

        let key = self
            .router
            .invert(target)
            .with_context(|| format!("💀 Cannot rebuild a storage key for failed item {}", target))?;
        let Some(bucket) = self.fallback_bucket.as_deref() else {
            anyhow::bail!(
                "💀 Failed item {} is not in the ledger and no inventory bucket is configured to rebuild it",
                target
            );
        };
        debug!("🔙 Rebuilt s3://{}/{} from target {}", bucket, key, target);
        Ok(StorageWriteRecord {
            bucket: bucket.to_string(),
            key,
            attempt: 1,
        })
    }

    /// 📨 Enqueue everything. Returns the number of messages sent.
    ///
    /// An enqueue failure is returned to the caller: those records exist nowhere else,
    /// so the invocation has to fail and let the original delivery be retried.
    pub async fn requeue(&self, queue: &QueueBackend, records: &[StorageWriteRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let messages = render_requeue_messages(records, self.max_message_bytes)?;
        let message_count = messages.len();
        for message in messages {
            queue
                .enqueue(message)
                .await
                .context("💀 Requeue failed. These records have nowhere else to go.")?;
        }
        info!(
            "🔄 Requeued {} records in {} messages",
            records.len(),
            message_count
        );
        Ok(message_count)
    }
}
