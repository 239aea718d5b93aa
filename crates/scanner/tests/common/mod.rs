#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use utxoscan_primitives::{merkle_root, Block, BlockHeader, Hash256, OutPoint, Transaction, TxIn, TxOut};
use utxoscan_scanner::blockfiles::{BlockFileError, DEFAULT_MAX_FILE_SIZE};
use utxoscan_scanner::{
    BlockFileMap, BlockFileWriter, BlockFiles, BlockSource, BlockchainScanner, FileLocation,
    MemoryChain, ReorganizationState, ScannerConfig, ScriptFilter,
};
use utxoscan_storage::memory::MemoryStore;
use utxoscan_storage::{Column, KeyValueStore};

pub const TRACKED: &[u8] = &[0x76, 0xa9, 0x14, 0x11, 0x22, 0x33, 0x88, 0xac];
pub const OTHER: &[u8] = &[0x76, 0xa9, 0x14, 0x99, 0x88, 0x77, 0x88, 0xac];

pub fn coinbase(tag: u32, script: &[u8], value: i64) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: tag.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: script.to_vec(),
        }],
        lock_time: 0,
    }
}

pub fn spend(prevout: OutPoint, script: &[u8], value: i64) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: vec![0x51],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: script.to_vec(),
        }],
        lock_time: 0,
    }
}

pub fn outpoint(tx: &Transaction, index: u32) -> OutPoint {
    OutPoint {
        hash: tx.txid(),
        index,
    }
}

/// A chain written to block files in a temp dir, one record per append.
pub struct TestChain {
    pub dir: TempDir,
    pub writer: BlockFileWriter,
    pub chain: Arc<MemoryChain>,
    pub blocks: Vec<(Block, FileLocation)>,
    nonce: u32,
}

impl TestChain {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = BlockFileWriter::new(dir.path(), DEFAULT_MAX_FILE_SIZE).expect("writer");
        Self {
            dir,
            writer,
            chain: Arc::new(MemoryChain::new()),
            blocks: Vec::new(),
            nonce: 0,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.blocks
            .last()
            .map(|(block, _)| block.header.hash())
            .unwrap_or([0u8; 32])
    }

    /// Extends the last pushed block.
    pub fn push(&mut self, txs: Vec<Transaction>) -> Hash256 {
        let prev = self.tip_hash();
        self.push_on(prev, txs).0
    }

    /// Same as `push`, but each block goes to a file of its own.
    pub fn push_own_file(&mut self, txs: Vec<Transaction>) -> Hash256 {
        self.writer.roll();
        self.push(txs)
    }

    /// Writes a block on top of `prev` and hands it to the chain.
    pub fn push_on(
        &mut self,
        prev: Hash256,
        txs: Vec<Transaction>,
    ) -> (Hash256, Option<ReorganizationState>) {
        let txids: Vec<Hash256> = txs.iter().map(Transaction::txid).collect();
        self.nonce += 1;
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: prev,
                merkle_root: merkle_root(&txids),
                time: 1_600_000_000 + self.nonce,
                bits: 0x207f_ffff,
                nonce: self.nonce,
            },
            transactions: txs,
        };
        let location = self
            .writer
            .append(&block.consensus_encode())
            .expect("append block");
        let hash = block.header.hash();
        let state = self
            .chain
            .add_block(block.header.clone(), location)
            .expect("add block");
        self.blocks.push((block, location));
        (hash, state)
    }

    pub fn block_files(&self) -> Arc<BlockFiles> {
        Arc::new(BlockFiles::open(self.path()).expect("open block files"))
    }

    pub fn file_path(&self, file_id: u32) -> PathBuf {
        self.path().join(format!("blk{file_id:05}.dat"))
    }

    pub fn scanner(
        &self,
        store: Arc<MemoryStore>,
        config: ScannerConfig,
    ) -> BlockchainScanner<MemoryStore> {
        self.scanner_with(store, self.block_files(), config)
    }

    pub fn scanner_with(
        &self,
        store: Arc<MemoryStore>,
        blocks: Arc<dyn BlockSource>,
        config: ScannerConfig,
    ) -> BlockchainScanner<MemoryStore> {
        let chain = Arc::clone(&self.chain);
        let filter = Arc::new(ScriptFilter::with_scripts([TRACKED]));
        BlockchainScanner::new(store, chain, blocks, filter, config).expect("scanner")
    }
}

/// Genesis paying nobody, then one block per file where every other block
/// spends the tracked output created just before it.
pub fn busy_chain(blocks: u32) -> (TestChain, Vec<Transaction>) {
    let mut chain = TestChain::new();
    chain.push(vec![coinbase(0, OTHER, 50)]);
    let mut created = Vec::new();
    for height in 1..=blocks {
        let mut txs = vec![coinbase(height, TRACKED, 50)];
        if height % 2 == 0 {
            if let Some(prev) = created.last() {
                txs.push(spend(outpoint(prev, 0), OTHER, 49));
            }
        }
        created.push(txs[0].clone());
        chain.push_own_file(txs);
    }
    (chain, created)
}

pub fn quick_config(threads: usize) -> ScannerConfig {
    ScannerConfig {
        threads,
        report_progress: false,
        ..ScannerConfig::default()
    }
}

/// Every entry of every column, for comparing stores.
pub fn dump(store: &MemoryStore, columns: &[Column]) -> Vec<(Column, Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    for column in columns {
        for (key, value) in store.scan_prefix(*column, &[]).expect("scan column") {
            out.push((*column, key, value));
        }
    }
    out
}

/// Sleeps before handing out `slow_file`, so later batches finish first.
pub struct SlowSource {
    pub inner: Arc<BlockFiles>,
    pub slow_file: u32,
    pub delay: Duration,
}

impl BlockSource for SlowSource {
    fn file_count(&self) -> u32 {
        self.inner.file_count()
    }

    fn map_file(&self, file_id: u32) -> Result<Arc<BlockFileMap>, BlockFileError> {
        if file_id == self.slow_file {
            thread::sleep(self.delay);
        }
        self.inner.map_file(file_id)
    }
}
