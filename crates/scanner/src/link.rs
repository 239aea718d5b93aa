//! The ordered commit chain. Links are committed strictly by index; link
//! `i + 1` is the successor of link `i`.

use std::ops::Range;
use std::sync::Arc;

use crate::batch::{BatchPlan, BlockDeltas, ScanBatch};
use crate::blockdata::ScanTip;
use crate::error::{ScanError, ScanFailure};

pub struct BatchLink {
    pub index: usize,
    /// Indices of the batch plans this link commits.
    pub batch_range: Range<usize>,
    pub start_height: u32,
    pub end_height: u32,
    /// Highest block this link commits.
    pub top: ScanTip,
    batches: Vec<Arc<ScanBatch>>,
}

impl BatchLink {
    pub fn attach(&mut self, batch: Arc<ScanBatch>) {
        self.batches.push(batch);
    }

    pub fn is_dispatched(&self) -> bool {
        self.batches.len() == self.batch_range.len()
    }

    pub fn batches(&self) -> &[Arc<ScanBatch>] {
        &self.batches
    }

    /// Blocks until every batch of the link has finished both phases.
    pub fn wait_ready(&self) {
        for batch in &self.batches {
            batch.wait_ready();
        }
    }

    pub fn failure(&self) -> Option<ScanFailure> {
        self.batches
            .iter()
            .filter_map(|batch| batch.failure())
            .min_by_key(|failure| failure.height)
    }

    /// Highest height decoded by any batch of the link.
    pub fn highest_processed(&self) -> Option<u32> {
        self.batches
            .iter()
            .filter_map(|batch| batch.highest_processed())
            .max()
    }

    /// Checks that the merged blocks end at the block this link was planned
    /// to commit.
    pub fn confirm_top(&self, merged: Option<ScanTip>) -> Result<ScanTip, ScanError> {
        match merged {
            Some(tip) if tip == self.top => Ok(tip),
            _ => Err(ScanError::Corrupt("merged link does not end at its planned top")),
        }
    }

    pub fn take_deltas(&self) -> BlockDeltas {
        let mut deltas = BlockDeltas::default();
        for batch in &self.batches {
            deltas.extend(batch.take_deltas());
        }
        deltas
    }

    /// Drops the batches, releasing their file mappings and decoded blocks.
    pub fn release(&mut self) {
        self.batches.clear();
    }
}

pub struct BatchChain {
    links: Vec<BatchLink>,
}

impl BatchChain {
    pub fn build(plans: &[BatchPlan], batches_per_link: usize) -> Self {
        let per_link = batches_per_link.max(1);
        let mut links = Vec::with_capacity(plans.len().div_ceil(per_link));
        let mut start = 0;
        while start < plans.len() {
            let end = (start + per_link).min(plans.len());
            let group = &plans[start..end];
            let top = group
                .iter()
                .filter_map(BatchPlan::top_block)
                .max_by_key(|block| block.height)
                .map(|block| ScanTip {
                    height: block.height,
                    hash: block.hash,
                })
                .unwrap_or(ScanTip {
                    height: group[group.len() - 1].end_height,
                    hash: [0u8; 32],
                });
            links.push(BatchLink {
                index: links.len(),
                batch_range: start..end,
                start_height: group[0].start_height,
                end_height: group[group.len() - 1].end_height,
                top,
                batches: Vec::with_capacity(end - start),
            });
            start = end;
        }
        Self { links }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&BatchLink> {
        self.links.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut BatchLink> {
        self.links.get_mut(index)
    }

    pub fn next(&self, index: usize) -> Option<&BatchLink> {
        self.links.get(index + 1)
    }

    /// Index of the link committing batch plan `batch_index`.
    pub fn link_of(&self, batch_index: usize) -> Option<usize> {
        self.links
            .iter()
            .position(|link| link.batch_range.contains(&batch_index))
    }
}
