//! Fills in transaction hints that the main pass did not record, by matching
//! txid prefixes against the per-block filters and confirming every candidate
//! against the block bytes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rayon::{ThreadPool, ThreadPoolBuilder};
use utxoscan_log::{log_info, log_warn};
use utxoscan_primitives::transaction::txid_at;
use utxoscan_primitives::{hash_to_hex, Hash256};
use utxoscan_storage::{KeyValueStore, WriteBatch};

use crate::blockfiles::{BlockFileMap, BlockSource, FileLocation};
use crate::chain::ChainView;
use crate::config::ScanPhase;
use crate::error::ScanError;
use crate::filter::{hash_prefix, BlockFilter, TxFilterIndex};
use crate::hints::{TxHintIndex, TxKey};
use crate::history::HistoryIndex;
use crate::scanner::BlockchainScanner;

/// A filter entry whose prefix matches a wanted hash.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilterHit {
    pub hash: Hash256,
    pub height: u32,
    pub block_hash: Hash256,
    pub location: FileLocation,
    pub tx_index: u32,
    pub tx_offset: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectReason {
    /// The transaction at the offset hashes to something else.
    TxidMismatch,
    /// The filter's block is no longer on the main chain.
    NotMainChain,
    /// The block or transaction could not be read back.
    Unreadable,
    /// Another candidate for the same hash was confirmed first.
    Duplicate,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectedHit {
    pub hit: FilterHit,
    pub reason: RejectReason,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxResolution {
    pub resolved: BTreeMap<Hash256, TxKey>,
    pub rejected: Vec<RejectedHit>,
    pub unresolved: BTreeSet<Hash256>,
}

/// Hashes still waiting for a confirmed hit; workers remove them concurrently.
struct MissingHashes {
    inner: Mutex<HashSet<Hash256>>,
}

impl MissingHashes {
    fn new(hashes: impl IntoIterator<Item = Hash256>) -> Self {
        Self {
            inner: Mutex::new(hashes.into_iter().collect()),
        }
    }

    fn remove(&self, hash: &Hash256) -> bool {
        self.inner.lock().expect("missing hash lock").remove(hash)
    }

    fn into_sorted(self) -> BTreeSet<Hash256> {
        self.inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .into_iter()
            .collect()
    }
}

/// Phase one: every (filter, entry) whose prefix matches one of `hashes`,
/// grouped by hash in (height, tx index) order. Files are claimed by the
/// pool threads through a shared counter.
pub fn get_filter_hits(
    pool: &ThreadPool,
    filters: &BTreeMap<u32, Vec<BlockFilter>>,
    hashes: &BTreeSet<Hash256>,
) -> BTreeMap<Hash256, Vec<FilterHit>> {
    let mut by_prefix: HashMap<u32, Vec<Hash256>> = HashMap::new();
    for hash in hashes {
        by_prefix.entry(hash_prefix(hash)).or_default().push(*hash);
    }
    let files: Vec<&Vec<BlockFilter>> = filters.values().collect();
    let cursor = AtomicUsize::new(0);

    let partials = pool.broadcast(|_| {
        let mut local: BTreeMap<Hash256, Vec<FilterHit>> = BTreeMap::new();
        loop {
            let next = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(file) = files.get(next) else {
                break;
            };
            for filter in file.iter() {
                for (tx_index, entry) in filter.entries.iter().enumerate() {
                    let Some(targets) = by_prefix.get(&entry.prefix) else {
                        continue;
                    };
                    for hash in targets {
                        local.entry(*hash).or_default().push(FilterHit {
                            hash: *hash,
                            height: filter.height,
                            block_hash: filter.hash,
                            location: filter.location,
                            tx_index: tx_index as u32,
                            tx_offset: entry.tx_offset,
                        });
                    }
                }
            }
        }
        local
    });

    let mut hits: BTreeMap<Hash256, Vec<FilterHit>> = BTreeMap::new();
    for partial in partials {
        for (hash, found) in partial {
            hits.entry(hash).or_default().extend(found);
        }
    }
    for found in hits.values_mut() {
        found.sort_by_key(|hit| (hit.height, hit.tx_index));
    }
    hits
}

fn confirm(
    hit: &FilterHit,
    chain: &dyn ChainView,
    blocks: &dyn BlockSource,
    maps: &mut HashMap<u32, Arc<BlockFileMap>>,
) -> Result<(), RejectReason> {
    let on_main = chain
        .block_at(hit.height)
        .is_some_and(|block| block.hash == hit.block_hash);
    if !on_main {
        return Err(RejectReason::NotMainChain);
    }
    let map = match maps.get(&hit.location.file_id) {
        Some(map) => Arc::clone(map),
        None => {
            let map = blocks
                .map_file(hit.location.file_id)
                .map_err(|_| RejectReason::Unreadable)?;
            maps.insert(hit.location.file_id, Arc::clone(&map));
            map
        }
    };
    let bytes = map
        .block(hit.location)
        .map_err(|_| RejectReason::Unreadable)?;
    let (_, txid) =
        txid_at(bytes, hit.tx_offset as usize).map_err(|_| RejectReason::Unreadable)?;
    if txid != hit.hash {
        return Err(RejectReason::TxidMismatch);
    }
    Ok(())
}

/// Phase two: confirms every candidate of every hash. The first confirmed
/// candidate (lowest height) wins and removes the hash from `missing`.
fn process_filter_hits(
    pool: &ThreadPool,
    chain: &dyn ChainView,
    blocks: &dyn BlockSource,
    hits: BTreeMap<Hash256, Vec<FilterHit>>,
    missing: &MissingHashes,
) -> (BTreeMap<Hash256, TxKey>, Vec<RejectedHit>) {
    let items: Vec<(Hash256, Vec<FilterHit>)> = hits.into_iter().collect();
    let cursor = AtomicUsize::new(0);

    let partials = pool.broadcast(|_| {
        let mut maps = HashMap::new();
        let mut resolved = Vec::new();
        let mut rejected = Vec::new();
        loop {
            let next = cursor.fetch_add(1, Ordering::SeqCst);
            let Some((hash, candidates)) = items.get(next) else {
                break;
            };
            let mut confirmed = false;
            for hit in candidates {
                match confirm(hit, chain, blocks, &mut maps) {
                    Ok(()) if !confirmed => {
                        confirmed = true;
                        missing.remove(hash);
                        resolved.push((
                            *hash,
                            TxKey {
                                height: hit.height,
                                tx_index: hit.tx_index,
                            },
                        ));
                    }
                    Ok(()) => rejected.push(RejectedHit {
                        hit: hit.clone(),
                        reason: RejectReason::Duplicate,
                    }),
                    Err(reason) => rejected.push(RejectedHit {
                        hit: hit.clone(),
                        reason,
                    }),
                }
            }
        }
        (resolved, rejected)
    });

    let mut resolved = BTreeMap::new();
    let mut rejected = Vec::new();
    for (found, dropped) in partials {
        resolved.extend(found);
        rejected.extend(dropped);
    }
    rejected.sort_by_key(|entry| (entry.hit.hash, entry.hit.height, entry.hit.tx_index));
    (resolved, rejected)
}

impl<S: KeyValueStore> BlockchainScanner<S> {
    /// Finds every txid referenced by committed history that has no hint,
    /// resolves it through the block filters and commits the hints found.
    pub fn resolve_tx_hashes(&self) -> Result<TxResolution, ScanError> {
        let _guard = self.op_lock.lock().expect("scan lock");
        self.resolve_unlocked()
    }

    pub(crate) fn resolve_unlocked(&self) -> Result<TxResolution, ScanError> {
        let store = self.store.as_ref();
        let mut referenced = BTreeSet::new();
        HistoryIndex::new(store).for_each(|event| {
            referenced.insert(event.txid);
            referenced.insert(event.output.outpoint.hash);
            Ok(())
        })?;
        let hints = TxHintIndex::new(store);
        let mut missing = BTreeSet::new();
        for txid in referenced {
            if hints.get(&txid)?.is_none() {
                missing.insert(txid);
            }
        }
        if missing.is_empty() {
            return Ok(TxResolution::default());
        }

        let resolution = self.resolve_hashes(&missing)?;
        let mut batch = WriteBatch::new();
        for (txid, key) in &resolution.resolved {
            hints.insert(&mut batch, txid, *key);
        }
        store.write_batch(&batch)?;
        for hash in &resolution.unresolved {
            log_warn!("transaction {} could not be resolved", hash_to_hex(hash));
        }
        log_info!(
            "resolved {} of {} transaction hash(es), {} candidate(s) rejected",
            resolution.resolved.len(),
            missing.len(),
            resolution.rejected.len()
        );
        Ok(resolution)
    }

    /// Resolves `hashes` to their (height, tx index) without writing anything.
    pub fn resolve_hashes(&self, hashes: &BTreeSet<Hash256>) -> Result<TxResolution, ScanError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.threads)
            .thread_name(|index| format!("resolve-{index}"))
            .build()
            .map_err(|err| ScanError::Thread(err.to_string()))?;
        let filters = TxFilterIndex::new(self.store.as_ref()).by_file()?;
        self.config.report(ScanPhase::Resolving, 0.0, 0);
        let hits = get_filter_hits(&pool, &filters, hashes);
        self.config.report(ScanPhase::Resolving, 0.5, 0);
        let missing = MissingHashes::new(hashes.iter().copied());
        let (resolved, rejected) = process_filter_hits(
            &pool,
            self.chain.as_ref(),
            self.blocks.as_ref(),
            hits,
            &missing,
        );
        self.config.report(ScanPhase::Resolving, 1.0, 0);
        Ok(TxResolution {
            resolved,
            rejected,
            unresolved: missing.into_sorted(),
        })
    }
}
