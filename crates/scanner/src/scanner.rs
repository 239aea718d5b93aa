//! The scan coordinator: partitions the requested range into batches, runs
//! them on a worker pool with bounded look-ahead and commits them strictly in
//! height order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use crossbeam_channel::Sender;
use utxoscan_log::{log_debug, log_error, log_info, log_warn};
use utxoscan_primitives::{hash_to_hex, Hash256};
use utxoscan_storage::KeyValueStore;

use crate::accumulator::{accumulate, CommitSet};
use crate::address_filter::AddressFilter;
use crate::batch::{partition, BatchPlan, ScanBatch, ScanContext, UtxoGate};
use crate::blockdata::{BlockDataIndex, ScanTip};
use crate::blockfiles::BlockSource;
use crate::chain::ChainView;
use crate::config::{ScanPhase, ScannerConfig};
use crate::error::ScanError;
use crate::hints::{TxHintIndex, TxKey};
use crate::history::{HistoryEvent, HistoryIndex};
use crate::link::BatchChain;
use crate::merkle::MerkleCheck;
use crate::progress::ProgressTracker;
use crate::resolver::TxResolution;
use crate::utxo::{TrackedOutput, UtxoIndex, UtxoMap};

#[derive(Clone, Debug, Default)]
pub struct ScanSummary {
    pub start_height: u32,
    pub top: Option<ScanTip>,
    pub rewound: usize,
    pub blocks: usize,
    pub events: usize,
    pub resolution: TxResolution,
}

#[derive(Default)]
struct PipelineStats {
    blocks: usize,
    events: usize,
}

pub struct BlockchainScanner<S> {
    pub(crate) store: Arc<S>,
    pub(crate) chain: Arc<dyn ChainView>,
    pub(crate) blocks: Arc<dyn BlockSource>,
    pub(crate) filter: Arc<dyn AddressFilter>,
    pub(crate) config: ScannerConfig,
    pub(crate) utxos: RwLock<UtxoMap>,
    pub(crate) top: RwLock<Option<ScanTip>>,
    preloaded: AtomicBool,
    pub(crate) update_ssh: AtomicBool,
    pub(crate) op_lock: Mutex<()>,
}

impl<S: KeyValueStore> BlockchainScanner<S> {
    pub fn new(
        store: Arc<S>,
        chain: Arc<dyn ChainView>,
        blocks: Arc<dyn BlockSource>,
        filter: Arc<dyn AddressFilter>,
        config: ScannerConfig,
    ) -> Result<Self, ScanError> {
        config.validate()?;
        let top = BlockDataIndex::new(store.as_ref()).top()?;
        Ok(Self {
            store,
            chain,
            blocks,
            filter,
            config,
            utxos: RwLock::new(UtxoMap::new()),
            top: RwLock::new(top),
            preloaded: AtomicBool::new(false),
            update_ssh: AtomicBool::new(true),
            op_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn top_scanned(&self) -> Option<ScanTip> {
        *self.top.read().expect("scan top lock")
    }

    pub fn top_scanned_block_hash(&self) -> Option<Hash256> {
        self.top_scanned().map(|tip| tip.hash)
    }

    /// Tracked unspent outputs, ordered by outpoint.
    pub fn utxos(&self) -> Vec<TrackedOutput> {
        let mut outputs: Vec<_> = self
            .utxos
            .read()
            .expect("utxo table lock")
            .values()
            .cloned()
            .collect();
        outputs.sort_by(|a, b| a.outpoint.cmp(&b.outpoint));
        outputs
    }

    pub fn utxo_count(&self) -> usize {
        self.utxos.read().expect("utxo table lock").len()
    }

    pub fn history(&self, script_hash: &Hash256) -> Result<Vec<HistoryEvent>, ScanError> {
        Ok(HistoryIndex::new(self.store.as_ref()).for_address(script_hash)?)
    }

    pub fn tx_hint(&self, txid: &Hash256) -> Result<Option<TxKey>, ScanError> {
        Ok(TxHintIndex::new(self.store.as_ref()).get(txid)?)
    }

    /// Loads the tracked-UTXO table from the store for every tracked address.
    pub fn preload_utxos(&self) -> Result<usize, ScanError> {
        let index = UtxoIndex::new(self.store.as_ref());
        let mut table = UtxoMap::new();
        for script_hash in self.filter.tracked() {
            for output in index.for_address(&script_hash)? {
                table.insert(output.outpoint.clone(), output);
            }
        }
        let count = table.len();
        *self.utxos.write().expect("utxo table lock") = table;
        self.preloaded.store(true, Ordering::SeqCst);
        log_debug!("preloaded {count} tracked utxo(s)");
        Ok(count)
    }

    pub(crate) fn ensure_preloaded(&self) -> Result<(), ScanError> {
        if !self.preloaded.load(Ordering::SeqCst) {
            self.preload_utxos()?;
        }
        Ok(())
    }

    /// Verifies committed data from `start_height`, then scans from the first
    /// inconsistent height, or from just above the committed top when
    /// everything checked out.
    pub fn scan(&self, start_height: u32) -> Result<ScanSummary, ScanError> {
        let resume = match self.check_merkle(start_height)? {
            MerkleCheck::Mismatch { height } => {
                log_warn!("committed data inconsistent at height {height}; rescanning from there");
                height
            }
            MerkleCheck::Consistent { top } => {
                let base = BlockDataIndex::new(self.store.as_ref()).base()?.unwrap_or(0);
                if start_height < base {
                    start_height
                } else {
                    start_height.max(top.saturating_add(1))
                }
            }
            MerkleCheck::Empty => start_height,
        };
        self.scan_nocheck(resume)
    }

    /// Scans from `start_height` to the chain top without checking committed
    /// data first. Committed heights at or above `start_height` are rewound
    /// and scanned again.
    pub fn scan_nocheck(&self, start_height: u32) -> Result<ScanSummary, ScanError> {
        let _guard = self.op_lock.lock().expect("scan lock");
        self.ensure_preloaded()?;

        let mut start = start_height;
        if let Some(fork) = self.stale_height()? {
            log_warn!("scanned tip left the main chain; rewinding to height {fork}");
            start = start.min(fork);
        }
        let mut rewound = 0;
        if let Some(top) = self.top_scanned() {
            if start <= top.height {
                rewound = self.rewind_to(start)?;
            } else {
                start = top.height + 1;
            }
        }

        let mut summary = ScanSummary {
            start_height: start,
            rewound,
            ..ScanSummary::default()
        };
        let Some(chain_top) = self.chain.top() else {
            summary.top = self.top_scanned();
            return Ok(summary);
        };
        if start <= chain_top.height {
            let partition = partition(
                self.chain.as_ref(),
                self.blocks.file_count(),
                start,
                chain_top.height,
                self.config.files_per_batch,
            );
            log_info!(
                "scanning heights {start}..={} in {} batch(es) on {} thread(s)",
                chain_top.height,
                partition.plans.len(),
                self.config.threads
            );
            let stats = self.run_pipeline(partition.plans, start, chain_top.height)?;
            summary.blocks = stats.blocks;
            summary.events = stats.events;
            if let Some(gap) = partition.gap {
                log_error!("{gap}");
                return Err(ScanError::Scanning(gap));
            }
        }

        summary.resolution = self.resolve_unlocked()?;
        summary.top = self.top_scanned();
        match summary.top {
            Some(top) => log_info!(
                "scan complete at height {} ({}), {} block(s), {} event(s)",
                top.height,
                hash_to_hex(&top.hash),
                summary.blocks,
                summary.events
            ),
            None => log_info!("scan complete, nothing committed"),
        }
        Ok(summary)
    }

    /// First height whose committed block has left the main chain, if the
    /// scanned tip is no longer on it.
    fn stale_height(&self) -> Result<Option<u32>, ScanError> {
        let Some(top) = self.top_scanned() else {
            return Ok(None);
        };
        let on_main = |height: u32, hash: &Hash256| {
            self.chain
                .block_at(height)
                .is_some_and(|block| block.hash == *hash)
        };
        if on_main(top.height, &top.hash) {
            return Ok(None);
        }
        let block_data = BlockDataIndex::new(self.store.as_ref());
        let base = block_data.base()?.unwrap_or(0);
        let mut height = top.height;
        while height > base {
            height -= 1;
            if let Some(record) = block_data.record(height)? {
                if on_main(height, &record.hash) {
                    return Ok(Some(height + 1));
                }
            }
        }
        Ok(Some(base))
    }

    fn run_pipeline(
        &self,
        plans: Vec<BatchPlan>,
        start_height: u32,
        end_height: u32,
    ) -> Result<PipelineStats, ScanError> {
        if plans.is_empty() {
            return Ok(PipelineStats::default());
        }
        let mut links = BatchChain::build(&plans, self.config.batches_per_link);
        let abort = AtomicBool::new(false);
        let ctx = ScanContext {
            blocks: self.blocks.as_ref(),
            filter: self.filter.as_ref(),
            committed: &self.utxos,
            abort: &abort,
        };
        let progress =
            ProgressTracker::new(&self.config, ScanPhase::Scanning, start_height, end_height);

        thread::scope(|scope| {
            let (sender, receiver) = crossbeam_channel::unbounded::<Arc<ScanBatch>>();
            for id in 0..self.config.threads {
                let receiver = receiver.clone();
                let ctx = &ctx;
                let spawned = thread::Builder::new()
                    .name(format!("scan-{id}"))
                    .spawn_scoped(scope, move || {
                        while let Ok(batch) = receiver.recv() {
                            batch.run(ctx);
                        }
                    });
                if let Err(err) = spawned {
                    abort.store(true, Ordering::SeqCst);
                    return Err(ScanError::Thread(format!("failed to spawn scan worker: {err}")));
                }
            }
            drop(receiver);

            let result = self.drive(&mut links, plans, &sender, &progress);
            if result.is_err() {
                abort.store(true, Ordering::SeqCst);
            }
            drop(sender);
            result
        })
    }

    /// Dispatches batches within the look-ahead window and commits links in order.
    fn drive(
        &self,
        links: &mut BatchChain,
        plans: Vec<BatchPlan>,
        sender: &Sender<Arc<ScanBatch>>,
        progress: &ProgressTracker<'_>,
    ) -> Result<PipelineStats, ScanError> {
        let mut pending = plans.into_iter();
        let mut in_flight: VecDeque<Arc<UtxoGate>> = VecDeque::new();
        let mut dispatched = 0usize;
        let mut committed = 0usize;
        let mut stats = PipelineStats::default();

        for link_index in 0..links.len() {
            while dispatched < committed + self.config.lookahead {
                let Some(plan) = pending.next() else {
                    break;
                };
                let batch = Arc::new(ScanBatch::new(plan, in_flight.iter().cloned().collect()));
                in_flight.push_back(batch.utxo_gate());
                let owner = links
                    .link_of(dispatched)
                    .and_then(|index| links.get_mut(index))
                    .ok_or(ScanError::Corrupt("batch outside every link"))?;
                owner.attach(Arc::clone(&batch));
                for _ in 0..self.config.threads {
                    sender
                        .send(Arc::clone(&batch))
                        .map_err(|_| ScanError::Thread("scan workers exited".to_string()))?;
                }
                dispatched += 1;
            }

            let link = links
                .get_mut(link_index)
                .ok_or(ScanError::Corrupt("missing batch link"))?;
            if !link.is_dispatched() {
                return Err(ScanError::Corrupt("link committed before dispatch"));
            }
            link.wait_ready();
            if let Some(failure) = link.failure() {
                match link.highest_processed() {
                    Some(height) => log_error!(
                        "batch failed: {failure} (link {} decoded up to height {height})",
                        link.index
                    ),
                    None => log_error!(
                        "batch failed: {failure} (link {} decoded nothing)",
                        link.index
                    ),
                }
                return Err(failure.into());
            }

            let deltas = link.take_deltas();
            let first_commit = self.top_scanned().is_none();
            let merged = {
                let table = self.utxos.read().expect("utxo table lock");
                accumulate(self.store.as_ref(), &table, deltas, true, first_commit)
            };
            let mut set = merged.map_err(|failure| {
                log_error!("merge failed: {failure}");
                ScanError::from(failure)
            })?;
            if let Err(err) = link.confirm_top(set.top) {
                log_error!(
                    "link {} heights {}..={}: {err}",
                    link.index,
                    link.start_height,
                    link.end_height
                );
                return Err(err);
            }
            self.commit(&mut set)?;

            let batch_count = link.batch_range.len();
            link.release();
            for _ in 0..batch_count {
                in_flight.pop_front();
            }
            committed += batch_count;
            stats.blocks += set.blocks;
            stats.events += set.events;
            log_debug!(
                "committed link {} heights {}..={} ({} block(s), {} event(s))",
                link.index,
                link.start_height,
                link.end_height,
                set.blocks,
                set.events
            );
            progress.update(link.end_height);
        }
        Ok(stats)
    }

    /// Writes a merged link, then updates the in-memory table and tip, then
    /// writes its transaction hints.
    pub(crate) fn commit(&self, set: &mut CommitSet) -> Result<(), ScanError> {
        self.store.write_batch(&set.batch)?;
        {
            let mut table = self.utxos.write().expect("utxo table lock");
            set.apply_to(&mut table);
        }
        if let Some(top) = set.top {
            *self.top.write().expect("scan top lock") = Some(top);
        }
        self.store.write_batch(&set.hints)?;
        Ok(())
    }
}
