//! 🎬 *[camera pans across a dimly lit function sandbox]*
//! 🎬 *[dramatic orchestral music swells]*
//! 🎬 "In a world where notifications arrive in nested envelopes..."
//! 🎬 "One supervisor dared to unwrap them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor: one invocation in, one report out.
//!
//! ```text
//!   payload ─▶ normalize ─▶ for each record: exclude? route, fetch, fix up, parse
//!                                              │
//!           ┌──────────────────────────────────┘
//!           ▼
//!   ensure indices ─▶ compose bodies ─▶ submit each ─▶ classify items ─▶ requeue retries
//! ```
//!
//! Strictly sequential inside one invocation. Concurrency comes from the platform running
//! many invocations at once, each with its own supervisor call and no shared mutable state
//! beyond the index cache (which only ever learns facts, never forgets them).
//!
//! 🧾 Failure classes and what happens to them:
//! - envelope shape: dropped in `envelopes`, counted
//! - routing: record skipped, counted
//! - fetch: skipped, or requeued while under `fetch_retry_limit`
//! - unparseable object: skipped, counted
//! - whole bulk request failed: the invocation fails, redelivery retries everything
//! - item failed: requeued, unless it's a mapping rejection, which is logged and dropped.
//!   Past `item_requeue_alarm` every requeue is an error log; past `item_requeue_limit` the
//!   item is dropped.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::app_config::AppConfig;
use crate::backends::{
    BlobStore, BlobStoreBackend, ClusterBackend, QueueBackend, SearchCluster,
};
use crate::common::{BulkItemResult, IndexableDocument, ItemOutcome, StorageWriteRecord};
use crate::composers::BulkComposer;
use crate::envelopes;
use crate::lifecycle::IndexLifecycle;
use crate::recovery::{FailureRecovery, RequeueLedger};
use crate::routing::KeyRouter;
use crate::transforms::SchemaFixups;

/// 📊 What one invocation did. Returned to the function runtime and printed by `replay`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvocationReport {
    pub records_seen: usize,
    pub envelopes_dropped: usize,
    pub excluded: usize,
    pub unroutable: usize,
    pub fetch_failures: usize,
    pub unparseable: usize,
    pub oversized: usize,
    pub indices_created: usize,
    pub bulk_requests: usize,
    pub indexed: usize,
    pub rejected: usize,
    pub unrecoverable: usize,
    pub requeued: usize,
    pub persistent_failures: usize,
    pub requeue_messages: usize,
}

impl InvocationReport {
    /// 📋 `(label, count)` pairs in pipeline order, for tables and log lines.
    pub fn rows(&self) -> Vec<(&'static str, usize)> {
        vec![
            ("records seen", self.records_seen),
            ("envelopes dropped", self.envelopes_dropped),
            ("excluded", self.excluded),
            ("unroutable", self.unroutable),
            ("fetch failures", self.fetch_failures),
            ("unparseable", self.unparseable),
            ("oversized", self.oversized),
            ("indices created", self.indices_created),
            ("bulk requests", self.bulk_requests),
            ("indexed", self.indexed),
            ("rejected", self.rejected),
            ("unrecoverable", self.unrecoverable),
            ("requeued", self.requeued),
            ("persistent failures", self.persistent_failures),
            ("requeue messages", self.requeue_messages),
        ]
    }
}

/// 📦 Owns the config, the stateless pipeline pieces, and the three backends.
///
/// Built once per process and shared by reference with every invocation.
#[derive(Debug)]
pub struct Supervisor {
    app_config: AppConfig,
    router: KeyRouter,
    fixups: SchemaFixups,
    composer: BulkComposer,
    lifecycle: IndexLifecycle,
    recovery: FailureRecovery,
    blob_store: BlobStoreBackend,
    queue: QueueBackend,
    cluster: ClusterBackend,
}

impl Supervisor {
    pub fn new(
        app_config: AppConfig,
        blob_store: BlobStoreBackend,
        queue: QueueBackend,
        cluster: ClusterBackend,
    ) -> Self {
        let router = KeyRouter::from_config(&app_config.ingest);
        let recovery = FailureRecovery::new(
            router.clone(),
            app_config.ingest.inventory_bucket.clone(),
            app_config.runtime.max_requeue_message_bytes,
        );
        Self {
            router,
            fixups: SchemaFixups::new(app_config.ingest.principal_fixup),
            composer: BulkComposer::new(app_config.runtime.max_request_size_bytes),
            lifecycle: IndexLifecycle::new(app_config.lifecycle.clone()),
            recovery,
            blob_store,
            queue,
            cluster,
            app_config,
        }
    }

    /// 🔧 Resolve every backend from config.
    pub async fn from_config(app_config: AppConfig) -> Result<Self> {
        let blob_store = BlobStoreBackend::from_config(&app_config.blob_store)
            .await
            .context("💀 Failed to set up the blob store")?;
        let queue = QueueBackend::from_config(&app_config.queue)
            .await
            .context("💀 Failed to set up the ingest queue")?;
        let cluster = ClusterBackend::from_config(&app_config.search)
            .context("💀 Failed to set up the search cluster client")?;
        Ok(Self::new(app_config, blob_store, queue, cluster))
    }

    pub fn app_config(&self) -> &AppConfig {
        &self.app_config
    }

    pub fn queue(&self) -> &QueueBackend {
        &self.queue
    }

    pub fn cluster(&self) -> &ClusterBackend {
        &self.cluster
    }

    /// 🎬 Process one invocation payload end to end.
    ///
    /// `Err` means the invocation as a whole must be retried by the platform: a bulk request
    /// failed outright, or requeued records could not be enqueued. Everything else is
    /// handled per record and shows up in the report.
    pub async fn supervise_invocation(&self, payload: &Value) -> Result<InvocationReport> {
        let mut report = InvocationReport::default();

        let normalized = envelopes::normalize(payload);
        report.records_seen = normalized.records.len();
        report.envelopes_dropped = normalized.dropped;
        debug!(
            "🪆 Normalized payload into {} records ({} envelopes dropped)",
            report.records_seen, report.envelopes_dropped
        );

        let mut ledger = RequeueLedger::default();
        let mut documents = Vec::with_capacity(normalized.records.len());
        let mut requeue = Vec::new();

        for record in normalized.records {
            if let Some(document) = self
                .prepare_document(record, &mut ledger, &mut requeue, &mut report)
                .await
            {
                documents.push(document);
            }
        }

        if documents.is_empty() {
            warn!("🤷 No objects to index in this invocation");
        } else {
            self.index_documents(&documents, &ledger, &mut requeue, &mut report)
                .await?;
        }

        report.requeued = requeue.len();
        report.requeue_messages = self.recovery.requeue(&self.queue, &requeue).await?;

        info!(
            "✅ Invocation done: {} seen, {} indexed, {} requeued, {} rejected",
            report.records_seen, report.indexed, report.requeued, report.rejected
        );
        Ok(report)
    }

    /// 📄 Exclusion, routing, fetch, fixups. `None` means this record is done with.
    async fn prepare_document(
        &self,
        record: StorageWriteRecord,
        ledger: &mut RequeueLedger,
        requeue: &mut Vec<StorageWriteRecord>,
        report: &mut InvocationReport,
    ) -> Option<IndexableDocument> {
        if self.app_config.ingest.is_excluded(&record.key) {
            info!("🚫 Skipping excluded key {}", record.key);
            report.excluded += 1;
            return None;
        }

        let target = match self.router.route(&record.key) {
            Ok(target) => target,
            Err(err) => {
                warn!("🧭 {}", err);
                report.unroutable += 1;
                return None;
            }
        };

        let raw = match self.blob_store.fetch_object(&record).await {
            Ok(raw) => raw,
            Err(err) => {
                report.fetch_failures += 1;
                if record.attempt < self.app_config.ingest.fetch_retry_limit {
                    warn!("🔄 {} (attempt {}), requeueing", err, record.attempt);
                    requeue.push(record.next_attempt());
                } else {
                    warn!("🗑️ {} (attempt {}), skipping", err, record.attempt);
                }
                return None;
            }
        };

        let body = match self.fixups.apply(&raw) {
            Ok(body) => body,
            Err(err) => {
                warn!("💀 Skipping {}: {:#}", record.uri(), err);
                report.unparseable += 1;
                return None;
            }
        };

        ledger.record(target.clone(), record);
        Some(IndexableDocument { target, body })
    }

    /// 📡 Lifecycle, compose, submit, classify.
    async fn index_documents(
        &self,
        documents: &[IndexableDocument],
        ledger: &RequeueLedger,
        requeue: &mut Vec<StorageWriteRecord>,
        report: &mut InvocationReport,
    ) -> Result<()> {
        report.indices_created = self
            .lifecycle
            .ensure_indices(
                &self.cluster,
                documents.iter().map(|document| document.target.index.as_str()),
            )
            .await;

        let composed = self.composer.compose(documents)?;
        report.oversized = composed.oversized.len();

        for body in &composed.bodies {
            let response = self.cluster.submit_bulk(body).await.with_context(|| {
                format!(
                    "💀 Bulk request with {} documents failed as a whole; failing the invocation so it gets redelivered",
                    body.doc_count()
                )
            })?;
            report.bulk_requests += 1;

            for outcome in response.outcomes() {
                match outcome {
                    ItemOutcome::Indexed(_) => report.indexed += 1,
                    ItemOutcome::Rejected(item) => {
                        error!(
                            "💀 {} rejected by the mapping after fixups ({}: {}). Dropping it; this is a new schema incompatibility.",
                            item.target(),
                            item.error_type().unwrap_or("unknown"),
                            item.error_reason().unwrap_or("no reason given")
                        );
                        report.rejected += 1;
                    }
                    ItemOutcome::Retry(item) => {
                        let target = item.target();
                        match self.recovery.rebuild(&target, ledger) {
                            Ok(record) => self.requeue_failed_item(&item, record, requeue, report),
                            Err(err) => {
                                error!("💀 {:#}", err);
                                report.unrecoverable += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// 🔄 Requeue one failed item, getting louder the more often we've seen it.
    fn requeue_failed_item(
        &self,
        item: &BulkItemResult,
        record: StorageWriteRecord,
        requeue: &mut Vec<StorageWriteRecord>,
        report: &mut InvocationReport,
    ) {
        let ingest = &self.app_config.ingest;
        let error_type = item.error_type().unwrap_or("unknown");
        let requeues_so_far = record.attempt.saturating_sub(1);

        if ingest
            .item_requeue_limit
            .is_some_and(|limit| requeues_so_far >= limit)
        {
            error!(
                "🛑 {} failed with {} ({}) after {} requeues, giving up on {}: {}",
                item.target(),
                item.status,
                error_type,
                requeues_so_far,
                record.uri(),
                item.error_reason().unwrap_or("no reason given")
            );
            report.unrecoverable += 1;
            return;
        }

        if requeues_so_far >= ingest.item_requeue_alarm {
            error!(
                "🚨 {} failed with {} ({}) again after {} requeues. This is not going away on its own: {}",
                item.target(),
                item.status,
                error_type,
                requeues_so_far,
                item.error_reason().unwrap_or("no reason given")
            );
            report.persistent_failures += 1;
        } else {
            warn!(
                "🔄 {} failed with {} ({}), requeueing {}",
                item.target(),
                item.status,
                error_type,
                record.uri()
            );
        }
        requeue.push(record);
    }
}
