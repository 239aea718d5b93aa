//! Merges the deltas of one link, in chain order, into the write batches that
//! commit it.

use std::collections::{BTreeMap, HashMap};

use utxoscan_primitives::{Hash256, OutPoint};
use utxoscan_storage::{KeyValueStore, WriteBatch};

use crate::batch::BlockDeltas;
use crate::blockdata::{BlockDataIndex, BlockUndo, ScanTip};
use crate::error::{FailureCause, ScanFailure};
use crate::filter::TxFilterIndex;
use crate::hints::{TxHintIndex, TxKey};
use crate::history::{sort_events, EventKind, HistoryEvent, HistoryIndex};
use crate::utxo::{TrackedOutput, UtxoIndex, UtxoMap};

/// Staged UTXO changes in the order they must be applied.
pub type UtxoChanges = Vec<(OutPoint, Option<TrackedOutput>)>;

pub struct CommitSet {
    /// Everything the link commits, written atomically.
    pub batch: WriteBatch,
    /// Transaction hints, written after `batch`.
    pub hints: WriteBatch,
    pub changes: UtxoChanges,
    pub top: Option<ScanTip>,
    pub blocks: usize,
    pub events: usize,
}

impl CommitSet {
    /// Applies the staged changes to the in-memory table. Call only once
    /// `batch` is durably written.
    pub fn apply_to(&mut self, table: &mut UtxoMap) {
        apply_changes(table, std::mem::take(&mut self.changes));
    }
}

pub fn apply_changes(table: &mut UtxoMap, changes: UtxoChanges) {
    for (outpoint, state) in changes {
        match state {
            Some(output) => {
                table.insert(outpoint, output);
            }
            None => {
                table.remove(&outpoint);
            }
        }
    }
}

/// Orders the link's events by height and in-block position (spends ahead of
/// receives within a transaction) and stages them against `committed`.
///
/// A spend of an output that is neither committed nor created earlier in the
/// link is a dangling spend and fails the link at the spend's height.
/// `first_commit` records the link's lowest height as the scan base.
pub fn accumulate<S: KeyValueStore>(
    store: &S,
    committed: &UtxoMap,
    deltas: BlockDeltas,
    write_history: bool,
    first_commit: bool,
) -> Result<CommitSet, ScanFailure> {
    let BlockDeltas {
        mut blocks,
        receives,
        spends,
    } = deltas;
    blocks.sort_by_key(|block| block.height);
    let mut events = receives;
    events.extend(spends);
    sort_events(&mut events);

    let utxos = UtxoIndex::new(store);
    let history = HistoryIndex::new(store);
    let block_data = BlockDataIndex::new(store);
    let filters = TxFilterIndex::new(store);
    let hint_index = TxHintIndex::new(store);

    let mut batch = WriteBatch::new();
    let mut staged: HashMap<OutPoint, Option<TrackedOutput>> = HashMap::new();
    let mut changes = Vec::with_capacity(events.len());
    let mut hints: BTreeMap<Hash256, TxKey> = BTreeMap::new();
    let mut per_height: BTreeMap<u32, Vec<HistoryEvent>> = BTreeMap::new();
    let event_count = events.len();

    for event in events {
        let outpoint = event.output.outpoint.clone();
        match event.kind {
            EventKind::Receive => {
                utxos.insert(&mut batch, &event.output);
                staged.insert(outpoint.clone(), Some(event.output.clone()));
                changes.push((outpoint, Some(event.output.clone())));
            }
            EventKind::Spend => {
                let live = match staged.get(&outpoint) {
                    Some(state) => state.is_some(),
                    None => committed.contains_key(&outpoint),
                };
                if !live {
                    return Err(ScanFailure::new(
                        event.height,
                        FailureCause::DanglingSpend(outpoint),
                    ));
                }
                utxos.remove(&mut batch, &event.output);
                staged.insert(outpoint.clone(), None);
                changes.push((outpoint, None));
                hints.insert(
                    event.output.outpoint.hash,
                    TxKey {
                        height: event.output.height,
                        tx_index: event.output.tx_index,
                    },
                );
            }
        }
        if write_history {
            history.insert(&mut batch, &event);
        }
        hints.insert(
            event.txid,
            TxKey {
                height: event.height,
                tx_index: event.tx_index,
            },
        );
        per_height.entry(event.height).or_default().push(event);
    }

    for block in &blocks {
        let events = per_height.remove(&block.height).unwrap_or_default();
        block_data.put_undo(
            &mut batch,
            block.height,
            &BlockUndo {
                hash: block.block.hash,
                events,
            },
        );
        block_data.put_record(&mut batch, block.height, &block.record());
        filters.insert(&mut batch, &block.filter());
    }

    let top = blocks.last().map(|block| ScanTip {
        height: block.height,
        hash: block.block.hash,
    });
    if top.is_some() {
        block_data.set_top(&mut batch, top);
    }
    if first_commit {
        if let Some(first) = blocks.first() {
            block_data.set_base(&mut batch, Some(first.height));
        }
    }

    let mut hint_batch = WriteBatch::new();
    for (txid, key) in &hints {
        hint_index.insert(&mut hint_batch, txid, *key);
    }

    Ok(CommitSet {
        batch,
        hints: hint_batch,
        changes,
        top,
        blocks: blocks.len(),
        events: event_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use utxoscan_storage::memory::MemoryStore;
    use utxoscan_storage::Column;

    fn output(tag: u8, height: u32) -> TrackedOutput {
        TrackedOutput {
            outpoint: OutPoint {
                hash: [tag; 32],
                index: 0,
            },
            script_hash: [0xab; 32],
            value: 10,
            script_pubkey: vec![0x51],
            height,
            tx_index: 1,
        }
    }

    fn event(kind: EventKind, height: u32, txid: u8, output: TrackedOutput) -> HistoryEvent {
        HistoryEvent {
            kind,
            height,
            tx_index: 1,
            io_index: 0,
            txid: [txid; 32],
            output,
        }
    }

    #[test]
    fn spend_after_receive_in_same_link() {
        let store = MemoryStore::new();
        let created = output(1, 5);
        let deltas = BlockDeltas {
            blocks: Vec::new(),
            receives: vec![event(EventKind::Receive, 5, 1, created.clone())],
            spends: vec![event(EventKind::Spend, 6, 2, created.clone())],
        };
        let mut set = accumulate(&store, &UtxoMap::new(), deltas, true, false).expect("merge");
        assert_eq!(set.events, 2);
        store.write_batch(&set.batch).expect("write");
        store.write_batch(&set.hints).expect("hints");
        let mut table = UtxoMap::new();
        set.apply_to(&mut table);
        assert!(table.is_empty());
        assert_eq!(store.len(Column::Utxo), 0);
        assert_eq!(store.len(Column::History), 2);
        assert_eq!(store.len(Column::TxHint), 2);
        assert!(set.top.is_none());
    }

    #[test]
    fn spend_of_unknown_output_is_dangling() {
        let store = MemoryStore::new();
        let missing = output(3, 2);
        let deltas = BlockDeltas {
            blocks: Vec::new(),
            receives: Vec::new(),
            spends: vec![event(EventKind::Spend, 7, 4, missing.clone())],
        };
        let failure = match accumulate(&store, &UtxoMap::new(), deltas, true, false) {
            Ok(_) => panic!("dangling spend accepted"),
            Err(failure) => failure,
        };
        assert_eq!(failure.height, 7);
        assert_eq!(failure.cause, FailureCause::DanglingSpend(missing.outpoint));
    }

    #[test]
    fn spend_of_committed_output_without_history() {
        let store = MemoryStore::new();
        let committed_output = output(9, 1);
        let mut committed = UtxoMap::new();
        committed.insert(committed_output.outpoint.clone(), committed_output.clone());
        let deltas = BlockDeltas {
            blocks: Vec::new(),
            receives: Vec::new(),
            spends: vec![event(EventKind::Spend, 3, 8, committed_output.clone())],
        };
        let mut set = accumulate(&store, &committed, deltas, false, false).expect("merge");
        store.write_batch(&set.batch).expect("write");
        set.apply_to(&mut committed);
        assert!(committed.is_empty());
        assert_eq!(store.len(Column::History), 0);
    }
}
