//! 🏗️ Index lifecycle: make sure an index exists with a date-mapped capture time before
//! the first document lands in it, and register a dashboard index pattern while we're there.
//!
//! Best effort, all of it. If the cluster says no, we warn and let the bulk request
//! auto-create the index with dynamic mappings. Documents matter more than dashboards.
//!
//! A process-lifetime cache remembers which indices are known good, so a warm function
//! doesn't `HEAD` the same index on every invocation. An index whose dashboard pattern
//! failed to register stays in a pending set and the registration is retried on the next
//! batch that touches it.

use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::app_config::LifecycleConfig;
use crate::backends::{ClusterBackend, SearchCluster};

#[derive(Debug)]
pub struct IndexLifecycle {
    config: LifecycleConfig,
    known_indices: Mutex<HashSet<String>>,
    pending_patterns: Mutex<HashSet<String>>,
}

impl IndexLifecycle {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config,
            known_indices: Mutex::new(HashSet::new()),
            pending_patterns: Mutex::new(HashSet::new()),
        }
    }

    /// 🗺️ `{"mappings":{"properties":{<time_field>:{"type":"date","format":<time_format>}}}}`
    pub fn index_definition(&self) -> Value {
        let mut properties = serde_json::Map::new();
        properties.insert(
            self.config.time_field.clone(),
            json!({"type": "date", "format": self.config.time_format}),
        );
        json!({"mappings": {"properties": properties}})
    }

    /// 📊 The saved-object document that makes the index show up in dashboards.
    pub fn index_pattern(&self, index: &str) -> Value {
        json!({
            "type": "index-pattern",
            "index-pattern": {
                "title": index,
                "timeFieldName": self.config.time_field,
            }
        })
    }

    fn is_known(&self, index: &str) -> bool {
        self.known_indices
            .lock()
            .map(|known| known.contains(index))
            .unwrap_or(false)
    }

    fn remember(&self, index: &str) {
        if let Ok(mut known) = self.known_indices.lock() {
            known.insert(index.to_string());
        }
    }

    fn mark_pattern_pending(&self, index: &str, pending: bool) {
        if let Ok(mut patterns) = self.pending_patterns.lock() {
            if pending {
                patterns.insert(index.to_string());
            } else {
                patterns.remove(index);
            }
        }
    }

    fn is_pattern_pending(&self, index: &str) -> bool {
        self.pending_patterns
            .lock()
            .map(|patterns| patterns.contains(index))
            .unwrap_or(false)
    }

    /// 🏗️ Ensure every distinct index in `indices` exists. Returns how many were created.
    ///
    /// Never fails: per-index problems are logged and skipped.
    pub async fn ensure_indices<'a, I>(&self, cluster: &ClusterBackend, indices: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        if !self.config.enabled {
            return 0;
        }

        let distinct: BTreeSet<&str> = indices.into_iter().collect();
        let mut created = 0;
        for index in distinct {
            if self.is_known(index) {
                if self.is_pattern_pending(index) {
                    self.register_pattern(cluster, index).await;
                }
                continue;
            }
            match self.ensure_index(cluster, index).await {
                Ok(was_created) => {
                    self.remember(index);
                    created += usize::from(was_created);
                }
                Err(err) => warn!(
                    "⚠️ Could not prepare index '{}', letting the bulk request create it: {:#}",
                    index, err
                ),
            }
        }
        created
    }

    async fn ensure_index(&self, cluster: &ClusterBackend, index: &str) -> Result<bool> {
        if cluster.index_exists(index).await? {
            return Ok(false);
        }

        cluster
            .create_index(index, &self.index_definition())
            .await
            .with_context(|| format!("💀 Creating index '{}'", index))?;
        info!("🏗️ Created index '{}'", index);

        self.register_pattern(cluster, index).await;
        Ok(true)
    }

    /// 📊 Put the index pattern. A failure leaves it pending for the next batch.
    async fn register_pattern(&self, cluster: &ClusterBackend, index: &str) {
        let pattern_id = format!("index-pattern:{}", index);
        match cluster
            .put_document(&self.config.dashboards_index, &pattern_id, &self.index_pattern(index))
            .await
        {
            Ok(()) => self.mark_pattern_pending(index, false),
            Err(err) => {
                warn!(
                    "⚠️ Index '{}' exists but its dashboard pattern could not be registered, will retry: {:#}",
                    index, err
                );
                self.mark_pattern_pending(index, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryCluster;

    #[tokio::test]
    async fn the_one_where_a_new_index_gets_a_date_and_a_dashboard() {
        let the_cluster = InMemoryCluster::default();
        let the_backend = ClusterBackend::from(the_cluster.clone());
        let the_lifecycle = IndexLifecycle::new(LifecycleConfig::default());

        let the_created = the_lifecycle
            .ensure_indices(&the_backend, ["resources_ec2_instance", "resources_ec2_instance"])
            .await;
        assert_eq!(the_created, 1);

        assert_eq!(
            the_cluster.index_definition("resources_ec2_instance"),
            Some(json!({"mappings": {"properties": {"configurationItemCaptureTime": {
                "type": "date", "format": "yyyy-MM-dd HH:mm:ss.SSSSSS"
            }}}}))
        );
        assert_eq!(
            the_cluster.document(".kibana", "index-pattern:resources_ec2_instance"),
            Some(json!({
                "type": "index-pattern",
                "index-pattern": {"title": "resources_ec2_instance", "timeFieldName": "configurationItemCaptureTime"}
            }))
        );
    }

    #[tokio::test]
    async fn the_one_where_existing_and_cached_indices_are_left_alone() -> Result<()> {
        let the_cluster = InMemoryCluster::default();
        let the_backend = ClusterBackend::from(the_cluster.clone());
        the_backend.create_index("resources_s3_bucket", &json!({"custom": true})).await?;
        let the_lifecycle = IndexLifecycle::new(LifecycleConfig::default());

        assert_eq!(the_lifecycle.ensure_indices(&the_backend, ["resources_s3_bucket"]).await, 0);
        assert_eq!(the_cluster.index_definition("resources_s3_bucket"), Some(json!({"custom": true})));
        assert!(the_cluster.document(".kibana", "index-pattern:resources_s3_bucket").is_none());

        assert_eq!(the_lifecycle.ensure_indices(&the_backend, ["resources_iam_role"]).await, 1);
        assert_eq!(the_lifecycle.ensure_indices(&the_backend, ["resources_iam_role"]).await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failed_dashboard_pattern_gets_another_go() {
        let the_cluster = InMemoryCluster::default();
        let the_backend = ClusterBackend::from(the_cluster.clone());
        let the_lifecycle = IndexLifecycle::new(LifecycleConfig::default());
        the_cluster.fail_next_document_writes(1);

        assert_eq!(the_lifecycle.ensure_indices(&the_backend, ["resources_kms_key"]).await, 1);
        assert!(the_cluster.index_definition("resources_kms_key").is_some());
        assert!(the_cluster.document(".kibana", "index-pattern:resources_kms_key").is_none());

        // 🔁 the index is cached, but the pattern is still owed
        assert_eq!(the_lifecycle.ensure_indices(&the_backend, ["resources_kms_key"]).await, 0);
        assert!(the_cluster.document(".kibana", "index-pattern:resources_kms_key").is_some());
        assert!(!the_lifecycle.is_pattern_pending("resources_kms_key"));
    }

    #[tokio::test]
    async fn the_one_where_lifecycle_is_switched_off() {
        let the_cluster = InMemoryCluster::default();
        let the_lifecycle = IndexLifecycle::new(LifecycleConfig {
            enabled: false,
            ..LifecycleConfig::default()
        });
        let the_created = the_lifecycle
            .ensure_indices(&ClusterBackend::from(the_cluster.clone()), ["resources_x"])
            .await;
        assert_eq!(the_created, 0);
        assert!(the_cluster.index_definition("resources_x").is_none());
    }
}
