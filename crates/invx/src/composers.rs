//! 🎬 *[the documents are parsed. the cluster waits. the request size limit looms.]*
//!
//! 🎼 Composers: pack rendered bulk units into NDJSON bodies that fit the byte budget.
//!
//! Greedy, order-preserving, no lookahead. Each unit goes into the current body if it
//! fits, otherwise the current body is sealed and a fresh one starts. A unit that would
//! not fit even in an empty body is dropped and reported, because sending it is a
//! guaranteed `413` and retrying it is a guaranteed loop.
//!
//! ```text
//!   [doc, doc, doc, doc, doc] ──render──▶ [unit, unit, unit, unit, unit]
//!                                         └── body 1 ──┘ └─ body 2 ─┘   (each ≤ budget)
//! ```
//!
//! 🧠 Knowledge graph:
//! - Uses: `transforms::ElasticsearchBulk` for the unit wire format
//! - Used by: `supervisors` after fixups and lifecycle, before submission 🦆

use crate::common::{BulkRequestBody, IndexTarget, IndexableDocument};
use crate::transforms::{EgressTransform, ElasticsearchBulk};
use anyhow::Result;
use tracing::{debug, error};

/// 📦 What one compose call produced.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ComposedBatch {
    pub bodies: Vec<BulkRequestBody>,
    /// 🐘 Targets whose unit alone exceeds the budget. Never submitted.
    pub oversized: Vec<IndexTarget>,
}

impl ComposedBatch {
    pub fn doc_count(&self) -> usize {
        self.bodies.iter().map(BulkRequestBody::doc_count).sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BulkComposer {
    max_request_size_bytes: usize,
}

impl BulkComposer {
    pub fn new(max_request_size_bytes: usize) -> Self {
        Self {
            max_request_size_bytes,
        }
    }

    pub fn max_request_size_bytes(&self) -> usize {
        self.max_request_size_bytes
    }

    /// 🎼 Render and pack, preserving input order across and within bodies.
    ///
    /// No documents in, no bodies out. Nobody sends an empty `_bulk`.
    pub fn compose(&self, documents: &[IndexableDocument]) -> Result<ComposedBatch> {
        let mut batch = ComposedBatch::default();
        let mut current = BulkRequestBody::default();

        for document in documents {
            let unit = ElasticsearchBulk::render(document)?;

            if unit.len() > self.max_request_size_bytes {
                error!(
                    "🐘 Document {} renders to {} bytes, over the {} byte request budget. Dropping it.",
                    document.target,
                    unit.len(),
                    self.max_request_size_bytes
                );
                batch.oversized.push(document.target.clone());
                continue;
            }

            if !current.is_empty() && current.len_bytes() + unit.len() > self.max_request_size_bytes {
                debug!(
                    "📦 Sealing bulk body with {} documents ({} bytes)",
                    current.doc_count(),
                    current.len_bytes()
                );
                batch.bodies.push(std::mem::take(&mut current));
            }
            current.push_unit(&unit, document.target.clone());
        }

        if !current.is_empty() {
            batch.bodies.push(current);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// 🔧 Documents whose rendered units are all exactly the same size.
    fn the_uniform_docs(count: usize) -> Vec<IndexableDocument> {
        (0..count)
            .map(|i| IndexableDocument {
                target: IndexTarget::new("resources_ec2_instance", format!("i-{:04}", i)),
                body: json!({"resourceId": format!("i-{:04}", i), "state": "running"}),
            })
            .collect()
    }

    fn the_unit_size() -> usize {
        ElasticsearchBulk::render(&the_uniform_docs(1)[0])
            .map(|unit| unit.len())
            .unwrap_or_default()
    }

    #[test]
    fn the_one_where_nothing_in_means_nothing_out() -> Result<()> {
        let the_batch = BulkComposer::new(1024).compose(&[])?;
        assert_eq!(the_batch, ComposedBatch::default());
        Ok(())
    }

    #[test]
    fn the_one_where_everything_fits_in_one_body() -> Result<()> {
        let the_docs = the_uniform_docs(5);
        let the_batch = BulkComposer::new(10 * 1024 * 1024).compose(&the_docs)?;
        assert_eq!(the_batch.bodies.len(), 1);
        assert_eq!(the_batch.bodies[0].doc_count(), 5);
        assert!(the_batch.bodies[0].payload.ends_with('\n'));
        assert_eq!(the_batch.bodies[0].payload.lines().count(), 10);
        Ok(())
    }

    #[test]
    fn the_one_where_bodies_split_exactly_at_the_budget() -> Result<()> {
        let the_unit = the_unit_size();
        // 🧮 three units per body, ten docs → ceil(10 / 3) = 4 bodies
        let the_composer = BulkComposer::new(3 * the_unit);
        let the_docs = the_uniform_docs(10);
        let the_batch = the_composer.compose(&the_docs)?;

        let the_total: usize = the_docs.len() * the_unit;
        assert_eq!(the_batch.bodies.len(), the_total.div_ceil(3 * the_unit));
        assert!(the_batch.bodies.iter().all(|body| body.len_bytes() <= 3 * the_unit));
        assert_eq!(the_batch.doc_count(), 10);
        Ok(())
    }

    #[test]
    fn the_one_where_order_survives_the_packing() -> Result<()> {
        let the_docs = the_uniform_docs(7);
        let the_batch = BulkComposer::new(2 * the_unit_size()).compose(&the_docs)?;
        let the_targets: Vec<IndexTarget> = the_batch
            .bodies
            .into_iter()
            .flat_map(|body| body.targets)
            .collect();
        let the_expected: Vec<IndexTarget> = the_docs.into_iter().map(|doc| doc.target).collect();
        assert_eq!(the_targets, the_expected);
        Ok(())
    }

    #[test]
    fn the_one_where_the_elephant_is_dropped_and_the_mice_go_through() -> Result<()> {
        let mut the_docs = the_uniform_docs(2);
        the_docs.insert(
            1,
            IndexableDocument {
                target: IndexTarget::new("resources_lambda_function", "huge"),
                body: json!({"code": "x".repeat(4096)}),
            },
        );
        let the_batch = BulkComposer::new(2 * the_unit_size()).compose(&the_docs)?;
        assert_eq!(the_batch.oversized, vec![IndexTarget::new("resources_lambda_function", "huge")]);
        assert_eq!(the_batch.bodies.len(), 1);
        assert_eq!(the_batch.bodies[0].doc_count(), 2);
        Ok(())
    }
}
