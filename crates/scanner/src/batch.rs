//! Scan batches: a contiguous height range read from a group of block files in
//! two phases. Phase 1 collects outputs paying tracked addresses and opens the
//! batch's UTXO gate; phase 2 waits for the gates of every earlier uncommitted
//! batch and collects the spends of tracked outputs.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};

use utxoscan_log::log_error;
use utxoscan_primitives::hash::script_hash;
use utxoscan_primitives::{OutPoint, ParsedBlock};

use crate::address_filter::AddressFilter;
use crate::blockdata::BlockRecord;
use crate::blockfiles::{BlockFileError, BlockFileMap, BlockSource, FileLocation};
use crate::chain::{ChainBlock, ChainView};
use crate::error::{FailureCause, ScanFailure};
use crate::filter::BlockFilter;
use crate::history::{sort_events, EventKind, HistoryEvent};
use crate::signal::Gate;
use crate::utxo::{TrackedOutput, UtxoMap};

/// Main-chain blocks of one file that fall inside the scan range.
#[derive(Clone, Debug)]
pub struct FilePlan {
    pub file_id: u32,
    pub blocks: Vec<ChainBlock>,
}

#[derive(Clone, Debug)]
pub struct BatchPlan {
    pub index: usize,
    pub start_height: u32,
    /// Inclusive.
    pub end_height: u32,
    pub files: Vec<FilePlan>,
}

impl BatchPlan {
    pub fn block_count(&self) -> usize {
        self.files.iter().map(|file| file.blocks.len()).sum()
    }

    pub fn top_block(&self) -> Option<&ChainBlock> {
        self.files
            .iter()
            .flat_map(|file| file.blocks.iter())
            .max_by_key(|block| block.height)
    }
}

#[derive(Debug)]
pub struct Partition {
    pub plans: Vec<BatchPlan>,
    /// First height of the range that no block file carries. Plans stop below it.
    pub gap: Option<ScanFailure>,
}

/// Groups block files `files_per_batch` at a time and merges groups whose
/// height ranges overlap, so plans cover disjoint, ascending, contiguous
/// ranges starting at `start_height`.
pub fn partition(
    chain: &dyn ChainView,
    file_count: u32,
    start_height: u32,
    top_height: u32,
    files_per_batch: u32,
) -> Partition {
    let mut files = Vec::new();
    for file_id in 0..file_count {
        let blocks: Vec<ChainBlock> = chain
            .main_chain_blocks_in_file(file_id)
            .into_iter()
            .filter(|block| block.height >= start_height && block.height <= top_height)
            .collect();
        if !blocks.is_empty() {
            files.push(FilePlan { file_id, blocks });
        }
    }

    let per_batch = files_per_batch.max(1) as usize;
    let mut groups: Vec<(u32, u32, Vec<FilePlan>)> = Vec::new();
    let mut pending = files.into_iter().peekable();
    while pending.peek().is_some() {
        let chunk: Vec<FilePlan> = pending.by_ref().take(per_batch).collect();
        let mut low = u32::MAX;
        let mut high = 0;
        for block in chunk.iter().flat_map(|file| file.blocks.iter()) {
            low = low.min(block.height);
            high = high.max(block.height);
        }
        groups.push((low, high, chunk));
    }
    groups.sort_by_key(|(low, _, _)| *low);

    let mut merged: Vec<(u32, u32, Vec<FilePlan>)> = Vec::new();
    for (low, high, chunk) in groups {
        if let Some(last) = merged.last_mut() {
            if low <= last.1 {
                last.1 = last.1.max(high);
                last.2.extend(chunk);
                continue;
            }
        }
        merged.push((low, high, chunk));
    }

    let mut plans = Vec::with_capacity(merged.len());
    let mut expected = start_height;
    let mut gap = None;
    for (_, high, group) in merged {
        let mut heights: Vec<u32> = group
            .iter()
            .flat_map(|file| file.blocks.iter().map(|block| block.height))
            .collect();
        heights.sort_unstable();
        let mut next = expected;
        let mut missing = None;
        for height in heights {
            if height > next {
                missing = Some(next);
                break;
            }
            next = height + 1;
        }
        if let Some(missing) = missing {
            let files: Vec<FilePlan> = group
                .into_iter()
                .map(|file| FilePlan {
                    file_id: file.file_id,
                    blocks: file
                        .blocks
                        .into_iter()
                        .filter(|block| block.height < missing)
                        .collect(),
                })
                .filter(|file| !file.blocks.is_empty())
                .collect();
            if !files.is_empty() {
                plans.push(BatchPlan {
                    index: plans.len(),
                    start_height: expected,
                    end_height: missing - 1,
                    files,
                });
            }
            gap = Some(ScanFailure::new(missing, FailureCause::MissingBlockData));
            break;
        }
        plans.push(BatchPlan {
            index: plans.len(),
            start_height: expected,
            end_height: high,
            files: group,
        });
        expected = high + 1;
    }
    if gap.is_none() && expected <= top_height {
        gap = Some(ScanFailure::new(expected, FailureCause::MissingBlockData));
    }
    Partition { plans, gap }
}

/// A block decoded once and shared by both scan phases and the commit.
#[derive(Debug)]
pub struct ScannedBlock {
    pub height: u32,
    pub location: FileLocation,
    pub block: ParsedBlock,
}

impl ScannedBlock {
    pub fn load(map: &BlockFileMap, expected: &ChainBlock) -> Result<Self, ScanFailure> {
        let bytes = map
            .block(expected.location)
            .map_err(|err| file_failure(expected.height, err))?;
        let block = ParsedBlock::parse(bytes).map_err(|err| {
            ScanFailure::new(expected.height, FailureCause::Decode(err.to_string()))
        })?;
        if block.hash != expected.hash {
            return Err(ScanFailure::new(expected.height, FailureCause::HashMismatch));
        }
        Ok(Self {
            height: expected.height,
            location: expected.location,
            block,
        })
    }

    pub fn record(&self) -> BlockRecord {
        BlockRecord {
            hash: self.block.hash,
            header: self.block.header.clone(),
            location: self.location,
            txids: self.block.txids.clone(),
        }
    }

    pub fn filter(&self) -> BlockFilter {
        BlockFilter::from_parsed(self.height, self.location, &self.block)
    }
}

pub(crate) fn file_failure(height: u32, err: BlockFileError) -> ScanFailure {
    match err {
        BlockFileError::MissingFile(_) => ScanFailure::new(height, FailureCause::MissingBlockData),
        other => ScanFailure::new(height, FailureCause::BlockFile(other.to_string())),
    }
}

/// Appends a receive event for every output paying a tracked address.
pub fn extract_outputs(
    scanned: &ScannedBlock,
    filter: &dyn AddressFilter,
    out: &mut Vec<HistoryEvent>,
) {
    let block = &scanned.block;
    for (tx_index, (tx, txid)) in block.transactions.iter().zip(&block.txids).enumerate() {
        for (vout, output) in tx.vout.iter().enumerate() {
            if !filter.is_tracked(&output.script_pubkey) {
                continue;
            }
            let tracked = TrackedOutput {
                outpoint: OutPoint {
                    hash: *txid,
                    index: vout as u32,
                },
                script_hash: script_hash(&output.script_pubkey),
                value: output.value,
                script_pubkey: output.script_pubkey.clone(),
                height: scanned.height,
                tx_index: tx_index as u32,
            };
            out.push(HistoryEvent {
                kind: EventKind::Receive,
                height: scanned.height,
                tx_index: tx_index as u32,
                io_index: vout as u32,
                txid: *txid,
                output: tracked,
            });
        }
    }
}

/// Appends a spend event for every input whose prevout `lookup` knows.
pub fn extract_spends(
    scanned: &ScannedBlock,
    lookup: &mut dyn FnMut(&OutPoint) -> Option<TrackedOutput>,
    out: &mut Vec<HistoryEvent>,
) {
    let block = &scanned.block;
    for (tx_index, (tx, txid)) in block.transactions.iter().zip(&block.txids).enumerate() {
        if tx.is_coinbase() {
            continue;
        }
        for (vin, input) in tx.vin.iter().enumerate() {
            if let Some(output) = lookup(&input.prevout) {
                out.push(HistoryEvent {
                    kind: EventKind::Spend,
                    height: scanned.height,
                    tx_index: tx_index as u32,
                    io_index: vin as u32,
                    txid: *txid,
                    output,
                });
            }
        }
    }
}

/// Receive events of a batch indexed by outpoint.
#[derive(Debug, Default)]
pub struct BatchOutputs {
    receives: Vec<HistoryEvent>,
    by_outpoint: HashMap<OutPoint, usize>,
}

impl BatchOutputs {
    pub fn new(mut receives: Vec<HistoryEvent>) -> Self {
        sort_events(&mut receives);
        let by_outpoint = receives
            .iter()
            .enumerate()
            .map(|(index, event)| (event.output.outpoint.clone(), index))
            .collect();
        Self {
            receives,
            by_outpoint,
        }
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&TrackedOutput> {
        self.by_outpoint
            .get(outpoint)
            .map(|index| &self.receives[*index].output)
    }

    pub fn receives(&self) -> &[HistoryEvent] {
        &self.receives
    }

    pub fn len(&self) -> usize {
        self.receives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receives.is_empty()
    }
}

/// Opens once a batch's outputs are all known. Later batches read the
/// published outputs; `failed` tells them not to bother.
#[derive(Debug, Default)]
pub struct UtxoGate {
    gate: Gate,
    outputs: OnceLock<Arc<BatchOutputs>>,
    failed: AtomicBool,
}

impl UtxoGate {
    fn publish(&self, outputs: BatchOutputs, failed: bool) {
        if failed {
            self.failed.store(true, Ordering::SeqCst);
        }
        let _ = self.outputs.set(Arc::new(outputs));
        self.gate.open();
    }

    /// Blocks until the outputs are published; None when the batch failed.
    pub fn wait(&self) -> Option<Arc<BatchOutputs>> {
        self.gate.wait();
        if self.failed.load(Ordering::SeqCst) {
            return None;
        }
        self.outputs.get().cloned()
    }

    pub fn is_open(&self) -> bool {
        self.gate.is_open()
    }
}

/// Shared read-only state the workers scan against.
pub struct ScanContext<'a> {
    pub blocks: &'a dyn BlockSource,
    pub filter: &'a dyn AddressFilter,
    pub committed: &'a RwLock<UtxoMap>,
    pub abort: &'a AtomicBool,
}

/// Everything a finished batch contributes to a commit.
#[derive(Debug, Default)]
pub struct BlockDeltas {
    pub blocks: Vec<Arc<ScannedBlock>>,
    pub receives: Vec<HistoryEvent>,
    pub spends: Vec<HistoryEvent>,
}

impl BlockDeltas {
    pub fn extend(&mut self, other: BlockDeltas) {
        self.blocks.extend(other.blocks);
        self.receives.extend(other.receives);
        self.spends.extend(other.spends);
    }
}

pub struct ScanBatch {
    plan: BatchPlan,
    predecessors: Vec<Arc<UtxoGate>>,
    utxos: Arc<UtxoGate>,
    ready: Gate,
    output_cursor: AtomicUsize,
    outputs_done: AtomicUsize,
    input_cursor: AtomicUsize,
    inputs_done: AtomicUsize,
    /// One above the highest height decoded so far; zero when none is.
    decoded_above: AtomicU32,
    failed: AtomicBool,
    maps: Mutex<Vec<Arc<BlockFileMap>>>,
    blocks: RwLock<BTreeMap<u32, Arc<ScannedBlock>>>,
    receives: Mutex<Vec<HistoryEvent>>,
    spends: Mutex<Vec<HistoryEvent>>,
    failure: Mutex<Option<ScanFailure>>,
}

impl ScanBatch {
    /// `predecessors` are the UTXO gates of every earlier batch not yet committed.
    pub fn new(plan: BatchPlan, predecessors: Vec<Arc<UtxoGate>>) -> Self {
        let batch = Self {
            predecessors,
            utxos: Arc::new(UtxoGate::default()),
            ready: Gate::new(),
            output_cursor: AtomicUsize::new(0),
            outputs_done: AtomicUsize::new(0),
            input_cursor: AtomicUsize::new(0),
            inputs_done: AtomicUsize::new(0),
            decoded_above: AtomicU32::new(0),
            failed: AtomicBool::new(false),
            maps: Mutex::new(Vec::new()),
            blocks: RwLock::new(BTreeMap::new()),
            receives: Mutex::new(Vec::new()),
            spends: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            plan,
        };
        if batch.plan.files.is_empty() {
            batch.utxos.publish(BatchOutputs::default(), false);
            batch.ready.open();
        }
        batch
    }

    pub fn plan(&self) -> &BatchPlan {
        &self.plan
    }

    pub fn utxo_gate(&self) -> Arc<UtxoGate> {
        Arc::clone(&self.utxos)
    }

    /// Highest height whose block decoded, if any did.
    pub fn highest_processed(&self) -> Option<u32> {
        self.decoded_above.load(Ordering::SeqCst).checked_sub(1)
    }

    pub fn wait_ready(&self) {
        self.ready.wait();
    }

    /// Lowest-height failure captured by any worker.
    pub fn failure(&self) -> Option<ScanFailure> {
        relock(&self.failure).clone()
    }

    /// Entry point for each worker assigned to this batch. Returns once there
    /// is nothing left to claim in either phase.
    pub fn run(&self, ctx: &ScanContext<'_>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.scan_outputs(ctx);
            self.scan_inputs(ctx);
        }));
        if outcome.is_err() {
            log_error!("scan worker panicked in batch {}", self.plan.index);
            self.fail(ScanFailure::new(
                self.plan.start_height,
                FailureCause::WorkerPanicked,
            ));
            self.publish_outputs();
            self.ready.open();
        }
    }

    fn should_skip(&self, ctx: &ScanContext<'_>) -> bool {
        ctx.abort.load(Ordering::SeqCst) || self.failed.load(Ordering::SeqCst)
    }

    fn fail(&self, failure: ScanFailure) {
        self.failed.store(true, Ordering::SeqCst);
        let mut slot = relock(&self.failure);
        let lower = slot
            .as_ref()
            .map_or(true, |existing| failure.height < existing.height);
        if lower {
            *slot = Some(failure);
        }
    }

    fn scan_outputs(&self, ctx: &ScanContext<'_>) {
        let total = self.plan.files.len();
        loop {
            let next = self.output_cursor.fetch_add(1, Ordering::SeqCst);
            if next >= total {
                break;
            }
            if !self.should_skip(ctx) {
                if let Err(failure) = self.scan_file_outputs(&self.plan.files[next], ctx) {
                    self.fail(failure);
                }
            }
            if self.outputs_done.fetch_add(1, Ordering::SeqCst) + 1 == total {
                self.publish_outputs();
            }
        }
    }

    fn scan_file_outputs(&self, file: &FilePlan, ctx: &ScanContext<'_>) -> Result<(), ScanFailure> {
        let first_height = file.blocks.first().map_or(self.plan.start_height, |b| b.height);
        let map = ctx
            .blocks
            .map_file(file.file_id)
            .map_err(|err| file_failure(first_height, err))?;
        let mut receives = Vec::new();
        let mut scanned = Vec::with_capacity(file.blocks.len());
        for expected in &file.blocks {
            if self.should_skip(ctx) {
                return Ok(());
            }
            let block = ScannedBlock::load(&map, expected)?;
            extract_outputs(&block, ctx.filter, &mut receives);
            self.decoded_above
                .fetch_max(expected.height.saturating_add(1), Ordering::SeqCst);
            scanned.push(Arc::new(block));
        }
        relock(&self.maps).push(map);
        {
            let mut blocks = self.blocks.write().unwrap_or_else(|p| p.into_inner());
            for block in scanned {
                blocks.insert(block.height, block);
            }
        }
        relock(&self.receives).extend(receives);
        Ok(())
    }

    fn publish_outputs(&self) {
        let receives = std::mem::take(&mut *relock(&self.receives));
        self.utxos
            .publish(BatchOutputs::new(receives), self.failed.load(Ordering::SeqCst));
    }

    /// Own outputs first, then earlier batches newest first. None when any
    /// of them failed.
    fn await_outputs(&self) -> Option<Vec<Arc<BatchOutputs>>> {
        let mut sources = Vec::with_capacity(self.predecessors.len() + 1);
        sources.push(self.utxos.wait()?);
        for gate in self.predecessors.iter().rev() {
            sources.push(gate.wait()?);
        }
        Some(sources)
    }

    fn scan_inputs(&self, ctx: &ScanContext<'_>) {
        let total = self.plan.files.len();
        loop {
            let next = self.input_cursor.fetch_add(1, Ordering::SeqCst);
            if next >= total {
                break;
            }
            if !self.should_skip(ctx) {
                if let Some(sources) = self.await_outputs() {
                    self.scan_file_inputs(&self.plan.files[next], &sources, ctx);
                }
            }
            if self.inputs_done.fetch_add(1, Ordering::SeqCst) + 1 == total {
                self.ready.open();
            }
        }
    }

    fn scan_file_inputs(
        &self,
        file: &FilePlan,
        sources: &[Arc<BatchOutputs>],
        ctx: &ScanContext<'_>,
    ) {
        let mut spends = Vec::new();
        {
            let blocks = self.blocks.read().unwrap_or_else(|p| p.into_inner());
            let committed = ctx.committed.read().expect("utxo table lock");
            let mut lookup = |outpoint: &OutPoint| {
                sources
                    .iter()
                    .find_map(|outputs| outputs.get(outpoint))
                    .or_else(|| committed.get(outpoint))
                    .cloned()
            };
            for expected in &file.blocks {
                if let Some(block) = blocks.get(&expected.height) {
                    extract_spends(block, &mut lookup, &mut spends);
                }
            }
        }
        relock(&self.spends).extend(spends);
    }

    /// Hands the batch's blocks and events to the commit. Call after `wait_ready`.
    pub fn take_deltas(&self) -> BlockDeltas {
        let blocks = std::mem::take(&mut *self.blocks.write().unwrap_or_else(|p| p.into_inner()))
            .into_values()
            .collect();
        let receives = self
            .utxos
            .outputs
            .get()
            .map(|outputs| outputs.receives().to_vec())
            .unwrap_or_default();
        let spends = std::mem::take(&mut *relock(&self.spends));
        BlockDeltas {
            blocks,
            receives,
            spends,
        }
    }
}

/// Batch state stays usable after a worker panic, so poisoning is ignored.
fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
