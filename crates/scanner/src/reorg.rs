//! Undoing committed blocks, for rewinds before a rescan and for branch
//! switches reported by the chain organizer.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use utxoscan_log::{log_debug, log_info};
use utxoscan_primitives::{Hash256, OutPoint};
use utxoscan_storage::{KeyValueStore, WriteBatch};

use crate::accumulator::{accumulate, apply_changes, UtxoChanges};
use crate::batch::{extract_outputs, extract_spends, file_failure, BlockDeltas, ScannedBlock};
use crate::blockdata::{BlockDataIndex, ScanTip};
use crate::chain::{ChainBlock, ReorganizationState};
use crate::config::ScanPhase;
use crate::error::ScanError;
use crate::hints::TxHintIndex;
use crate::history::{EventKind, HistoryIndex};
use crate::progress::ProgressTracker;
use crate::scanner::BlockchainScanner;
use crate::utxo::{TrackedOutput, UtxoIndex};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReorgSummary {
    pub undone: usize,
    pub applied: usize,
    pub top: Option<ScanTip>,
}

/// Reversals staged for one atomic write.
#[derive(Default)]
struct Unwind {
    batch: WriteBatch,
    changes: UtxoChanges,
    blocks: usize,
}

impl<S: KeyValueStore> BlockchainScanner<S> {
    /// Whether reorg undo and apply rewrite script history.
    pub fn update_ssh(&self, enabled: bool) {
        self.update_ssh.store(enabled, Ordering::SeqCst);
    }

    /// Undoes the committed blocks of the old branch (highest first), commits
    /// that, then applies the new branch (lowest first) for as long as it
    /// extends the scanned tip.
    pub fn undo(&self, state: &ReorganizationState) -> Result<ReorgSummary, ScanError> {
        let _guard = self.op_lock.lock().expect("scan lock");
        if state
            .undo
            .windows(2)
            .any(|pair| pair[0].height <= pair[1].height)
        {
            return Err(ScanError::Corrupt("undo list is not ordered highest first"));
        }
        self.ensure_preloaded()?;
        let Some(top) = self.top_scanned() else {
            return Ok(ReorgSummary::default());
        };
        let write_history = self.update_ssh.load(Ordering::SeqCst);
        let base = BlockDataIndex::new(self.store.as_ref()).base()?.unwrap_or(0);

        let mut unwind = Unwind::default();
        for block in &state.undo {
            if block.height > top.height || block.height < base {
                continue;
            }
            if block.height <= state.branch_height {
                return Err(ScanError::Corrupt("undo list reaches below the branch point"));
            }
            self.stage_undo(block.height, Some(&block.hash), write_history, &mut unwind)?;
        }
        let lowest = (state.branch_height + 1).max(base);
        let expected = if top.height >= lowest {
            (top.height - lowest + 1) as usize
        } else {
            0
        };
        if unwind.blocks != expected {
            return Err(ScanError::Corrupt(
                "reorganization does not cover the scanned tip",
            ));
        }
        let undone = unwind.blocks;
        self.finish_unwind(unwind, Some(state.branch_height))?;
        log_info!(
            "reorg: undid {undone} block(s) above height {}",
            state.branch_height
        );

        let mut applied = 0;
        for block in &state.apply {
            let next = self.top_scanned().map(|tip| tip.height + 1);
            if next != Some(block.height) {
                break;
            }
            self.apply_block(block, write_history)?;
            applied += 1;
        }
        let top = self.top_scanned();
        log_info!(
            "reorg: applied {applied} of {} block(s), tip now {}",
            state.apply.len(),
            top.map_or_else(|| "unset".to_string(), |tip| tip.height.to_string())
        );
        Ok(ReorgSummary {
            undone,
            applied,
            top,
        })
    }

    /// Undoes every committed height at or above `height`. History is
    /// removed too, so a rescan of the range starts from a clean slate.
    pub(crate) fn rewind_to(&self, height: u32) -> Result<usize, ScanError> {
        let Some(top) = self.top_scanned() else {
            return Ok(0);
        };
        if height > top.height {
            return Ok(0);
        }
        let base = BlockDataIndex::new(self.store.as_ref()).base()?.unwrap_or(0);
        let from = height.max(base);
        let progress = ProgressTracker::new(&self.config, ScanPhase::Rewinding, from, top.height);
        let mut unwind = Unwind::default();
        for undo_height in (from..=top.height).rev() {
            self.stage_undo(undo_height, None, true, &mut unwind)?;
            progress.update(top.height - undo_height + from);
        }
        let undone = unwind.blocks;
        self.finish_unwind(unwind, height.checked_sub(1))?;
        log_info!("rewound {undone} block(s) to height {height}");
        Ok(undone)
    }

    fn stage_undo(
        &self,
        height: u32,
        expected_hash: Option<&Hash256>,
        remove_history: bool,
        unwind: &mut Unwind,
    ) -> Result<(), ScanError> {
        let store = self.store.as_ref();
        let block_data = BlockDataIndex::new(store);
        let utxos = UtxoIndex::new(store);
        let history = HistoryIndex::new(store);
        let hints = TxHintIndex::new(store);

        let undo = block_data
            .undo(height)?
            .ok_or(ScanError::Corrupt("missing undo record"))?;
        if expected_hash.is_some_and(|hash| *hash != undo.hash) {
            return Err(ScanError::Corrupt("undo record belongs to another block"));
        }
        for event in undo.events.iter().rev() {
            let outpoint = event.output.outpoint.clone();
            match event.kind {
                EventKind::Receive => {
                    utxos.remove(&mut unwind.batch, &event.output);
                    unwind.changes.push((outpoint, None));
                }
                EventKind::Spend => {
                    utxos.insert(&mut unwind.batch, &event.output);
                    unwind.changes.push((outpoint, Some(event.output.clone())));
                }
            }
            if remove_history {
                history.delete(&mut unwind.batch, event);
            }
            hints.delete(&mut unwind.batch, &event.txid);
        }
        block_data.delete_undo(&mut unwind.batch, height);
        block_data.delete_record(&mut unwind.batch, height);
        unwind.blocks += 1;
        Ok(())
    }

    /// Writes the staged reversals with the new tip (the record at
    /// `new_top_height`, or none below the scan base).
    fn finish_unwind(&self, unwind: Unwind, new_top_height: Option<u32>) -> Result<(), ScanError> {
        let Unwind {
            mut batch,
            changes,
            blocks,
        } = unwind;
        if blocks == 0 {
            return Ok(());
        }
        let block_data = BlockDataIndex::new(self.store.as_ref());
        let base = block_data.base()?;
        let new_top = match (new_top_height, base) {
            (Some(height), Some(base)) if height >= base => {
                let record = block_data
                    .record(height)?
                    .ok_or(ScanError::Corrupt("missing block record below rewind"))?;
                Some(ScanTip {
                    height,
                    hash: record.hash,
                })
            }
            _ => None,
        };
        block_data.set_top(&mut batch, new_top);
        if new_top.is_none() {
            block_data.set_base(&mut batch, None);
        }
        self.store.write_batch(&batch)?;
        {
            let mut table = self.utxos.write().expect("utxo table lock");
            apply_changes(&mut table, changes);
        }
        *self.top.write().expect("scan top lock") = new_top;
        log_debug!("undid {blocks} block(s)");
        Ok(())
    }

    fn apply_block(&self, block: &ChainBlock, write_history: bool) -> Result<(), ScanError> {
        let map = self
            .blocks
            .map_file(block.location.file_id)
            .map_err(|err| ScanError::Scanning(file_failure(block.height, err)))?;
        let scanned = ScannedBlock::load(&map, block)?;
        let mut receives = Vec::new();
        extract_outputs(&scanned, self.filter.as_ref(), &mut receives);
        let own: HashMap<OutPoint, TrackedOutput> = receives
            .iter()
            .map(|event| (event.output.outpoint.clone(), event.output.clone()))
            .collect();

        let mut set = {
            let table = self.utxos.read().expect("utxo table lock");
            let mut spends = Vec::new();
            extract_spends(
                &scanned,
                &mut |outpoint: &OutPoint| own.get(outpoint).or_else(|| table.get(outpoint)).cloned(),
                &mut spends,
            );
            let deltas = BlockDeltas {
                blocks: vec![Arc::new(scanned)],
                receives,
                spends,
            };
            accumulate(self.store.as_ref(), &table, deltas, write_history, false)?
        };
        self.commit(&mut set)
    }
}
