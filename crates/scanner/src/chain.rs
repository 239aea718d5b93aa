//! Main-chain view consumed by the scanner, plus an in-memory header tree.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use utxoscan_log::{log_debug, log_warn};
use utxoscan_primitives::block::HEADER_LEN;
use utxoscan_primitives::encoding::{Decodable, DecodeError, Decoder};
use utxoscan_primitives::{hash_to_hex, BlockHeader, Hash256};

use crate::blockfiles::{BlockFileError, BlockSource, FileLocation};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainBlock {
    pub height: u32,
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub location: FileLocation,
}

/// Read-only view of the blockchain's best chain.
pub trait ChainView: Send + Sync {
    fn top(&self) -> Option<ChainBlock>;
    fn block_at(&self, height: u32) -> Option<ChainBlock>;
    fn height_of(&self, hash: &Hash256) -> Option<u32>;
    /// Main-chain blocks stored in `file_id`, ascending by height.
    fn main_chain_blocks_in_file(&self, file_id: u32) -> Vec<ChainBlock>;
}

/// A change of best chain: blocks to undo (highest first) and to apply
/// (lowest first), branching after `branch_height`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReorganizationState {
    pub branch_height: u32,
    pub undo: Vec<ChainBlock>,
    pub apply: Vec<ChainBlock>,
}

#[derive(Debug)]
pub enum ChainError {
    UnknownParent(Hash256),
    UnknownBlock(Hash256),
    Duplicate(Hash256),
    Decode(DecodeError),
    BlockFile(BlockFileError),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::UnknownParent(hash) => {
                write!(f, "unknown parent block {}", hash_to_hex(hash))
            }
            ChainError::UnknownBlock(hash) => write!(f, "unknown block {}", hash_to_hex(hash)),
            ChainError::Duplicate(hash) => write!(f, "duplicate block {}", hash_to_hex(hash)),
            ChainError::Decode(err) => write!(f, "header decode failed: {err}"),
            ChainError::BlockFile(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<DecodeError> for ChainError {
    fn from(err: DecodeError) -> Self {
        ChainError::Decode(err)
    }
}

impl From<BlockFileError> for ChainError {
    fn from(err: BlockFileError) -> Self {
        ChainError::BlockFile(err)
    }
}

#[derive(Clone, Debug)]
struct Node {
    header: BlockHeader,
    height: u32,
    location: FileLocation,
}

#[derive(Default)]
struct ChainInner {
    nodes: HashMap<Hash256, Node>,
    main: Vec<Hash256>,
    by_file: BTreeMap<u32, Vec<Hash256>>,
}

impl ChainInner {
    fn chain_block(&self, hash: &Hash256) -> Option<ChainBlock> {
        let node = self.nodes.get(hash)?;
        Some(ChainBlock {
            height: node.height,
            hash: *hash,
            prev_hash: node.header.prev_block,
            merkle_root: node.header.merkle_root,
            location: node.location,
        })
    }

    fn on_main(&self, hash: &Hash256, height: u32) -> bool {
        self.main.get(height as usize) == Some(hash)
    }

    fn switch_to(&mut self, tip: Hash256) -> Result<ReorganizationState, ChainError> {
        let mut branch = Vec::new();
        let mut cursor = tip;
        let branch_height = loop {
            let node = self
                .nodes
                .get(&cursor)
                .ok_or(ChainError::UnknownBlock(cursor))?;
            if self.on_main(&cursor, node.height) {
                break node.height;
            }
            branch.push(cursor);
            if node.height == 0 {
                return Err(ChainError::UnknownParent(node.header.prev_block));
            }
            cursor = node.header.prev_block;
        };
        branch.reverse();

        let keep = branch_height as usize + 1;
        let undo = self.main[keep..]
            .iter()
            .rev()
            .filter_map(|hash| self.chain_block(hash))
            .collect();
        let apply = branch
            .iter()
            .filter_map(|hash| self.chain_block(hash))
            .collect();
        self.main.truncate(keep);
        self.main.extend(branch);
        Ok(ReorganizationState {
            branch_height,
            undo,
            apply,
        })
    }
}

/// Header tree kept in memory; the best chain is the highest one, first seen
/// winning ties.
#[derive(Default)]
pub struct MemoryChain {
    inner: RwLock<ChainInner>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a block header. Returns the reorganization when the block moves the
    /// best chain off its current tip.
    pub fn add_block(
        &self,
        header: BlockHeader,
        location: FileLocation,
    ) -> Result<Option<ReorganizationState>, ChainError> {
        let hash = header.hash();
        let mut inner = self.inner.write().expect("chain lock");
        if inner.nodes.contains_key(&hash) {
            return Err(ChainError::Duplicate(hash));
        }
        let height = if inner.main.is_empty() && header.prev_block == [0u8; 32] {
            0
        } else {
            let parent = inner
                .nodes
                .get(&header.prev_block)
                .ok_or(ChainError::UnknownParent(header.prev_block))?;
            parent.height + 1
        };
        let prev = header.prev_block;
        inner.nodes.insert(
            hash,
            Node {
                header,
                height,
                location,
            },
        );
        inner.by_file.entry(location.file_id).or_default().push(hash);

        if inner.main.is_empty() {
            inner.main.push(hash);
            return Ok(None);
        }
        if height as usize == inner.main.len() {
            if inner.main.last() == Some(&prev) {
                inner.main.push(hash);
                return Ok(None);
            }
            let state = inner.switch_to(hash)?;
            return Ok(Some(state));
        }
        Ok(None)
    }

    /// Forces the best chain to end at `hash`.
    pub fn set_tip(&self, hash: &Hash256) -> Result<ReorganizationState, ChainError> {
        let mut inner = self.inner.write().expect("chain lock");
        inner.switch_to(*hash)
    }

    /// Builds the header tree from every record in `source`, linking blocks
    /// whose parents appear later in file order once the parent arrives.
    pub fn load_from(source: &dyn BlockSource) -> Result<Self, ChainError> {
        let chain = Self::new();
        let mut orphans: HashMap<Hash256, Vec<(BlockHeader, FileLocation)>> = HashMap::new();
        let mut loaded = 0usize;
        for file_id in 0..source.file_count() {
            let map = source.map_file(file_id)?;
            for location in map.records()? {
                let bytes = map.block(location)?;
                let mut decoder = Decoder::new(bytes.get(..HEADER_LEN).unwrap_or(bytes));
                let header = BlockHeader::consensus_decode(&mut decoder)?;
                let mut pending = vec![(header, location)];
                while let Some((header, location)) = pending.pop() {
                    let hash = header.hash();
                    match chain.add_block(header.clone(), location) {
                        Ok(_) => {
                            loaded += 1;
                            if let Some(children) = orphans.remove(&hash) {
                                pending.extend(children);
                            }
                        }
                        Err(ChainError::UnknownParent(parent)) => {
                            orphans.entry(parent).or_default().push((header, location));
                        }
                        Err(ChainError::Duplicate(_)) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        let orphaned: usize = orphans.values().map(Vec::len).sum();
        if orphaned > 0 {
            log_warn!("{orphaned} block(s) in block files have no known parent");
        }
        log_debug!("loaded {loaded} block headers from {} file(s)", source.file_count());
        Ok(chain)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("chain lock").nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChainView for MemoryChain {
    fn top(&self) -> Option<ChainBlock> {
        let inner = self.inner.read().expect("chain lock");
        inner.main.last().and_then(|hash| inner.chain_block(hash))
    }

    fn block_at(&self, height: u32) -> Option<ChainBlock> {
        let inner = self.inner.read().expect("chain lock");
        inner
            .main
            .get(height as usize)
            .and_then(|hash| inner.chain_block(hash))
    }

    fn height_of(&self, hash: &Hash256) -> Option<u32> {
        let inner = self.inner.read().expect("chain lock");
        let node = inner.nodes.get(hash)?;
        inner.on_main(hash, node.height).then_some(node.height)
    }

    fn main_chain_blocks_in_file(&self, file_id: u32) -> Vec<ChainBlock> {
        let inner = self.inner.read().expect("chain lock");
        let Some(hashes) = inner.by_file.get(&file_id) else {
            return Vec::new();
        };
        let mut blocks: Vec<ChainBlock> = hashes
            .iter()
            .filter_map(|hash| inner.chain_block(hash))
            .filter(|block| inner.on_main(&block.hash, block.height))
            .collect();
        blocks.sort_by_key(|block| block.height);
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(prev: Hash256, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0,
            nonce,
        }
    }

    fn loc(file_id: u32, offset: u64) -> FileLocation {
        FileLocation {
            file_id,
            offset,
            len: 80,
        }
    }

    #[test]
    fn extends_and_reorganizes() {
        let chain = MemoryChain::new();
        let genesis = header([0u8; 32], 0);
        let g = genesis.hash();
        assert!(chain.add_block(genesis, loc(0, 0)).expect("add").is_none());
        let a1 = header(g, 1);
        let a1_hash = a1.hash();
        assert!(chain.add_block(a1, loc(0, 84)).expect("add").is_none());
        let b1 = header(g, 2);
        let b1_hash = b1.hash();
        assert!(chain.add_block(b1, loc(1, 0)).expect("add").is_none());
        assert_eq!(chain.top().expect("top").hash, a1_hash);

        let b2 = header(b1_hash, 3);
        let b2_hash = b2.hash();
        let state = chain
            .add_block(b2, loc(1, 84))
            .expect("add")
            .expect("reorg");
        assert_eq!(state.branch_height, 0);
        assert_eq!(state.undo.len(), 1);
        assert_eq!(state.undo[0].hash, a1_hash);
        let applied: Vec<_> = state.apply.iter().map(|block| block.hash).collect();
        assert_eq!(applied, vec![b1_hash, b2_hash]);
        assert_eq!(chain.height_of(&a1_hash), None);
        assert_eq!(chain.height_of(&b2_hash), Some(2));
        assert!(chain.main_chain_blocks_in_file(0).len() == 1);
        assert_eq!(chain.main_chain_blocks_in_file(1).len(), 2);
    }

    #[test]
    fn set_tip_rolls_back() {
        let chain = MemoryChain::new();
        let genesis = header([0u8; 32], 0);
        let g = genesis.hash();
        chain.add_block(genesis, loc(0, 0)).expect("add");
        let a1 = header(g, 1);
        let a1_hash = a1.hash();
        chain.add_block(a1, loc(0, 84)).expect("add");
        let state = chain.set_tip(&g).expect("set tip");
        assert_eq!(state.branch_height, 0);
        assert_eq!(state.undo[0].hash, a1_hash);
        assert!(state.apply.is_empty());
        assert_eq!(chain.top().expect("top").height, 0);
    }

    #[test]
    fn rejects_unknown_parent() {
        let chain = MemoryChain::new();
        chain.add_block(header([0u8; 32], 0), loc(0, 0)).expect("add");
        assert!(matches!(
            chain.add_block(header([9u8; 32], 1), loc(0, 84)),
            Err(ChainError::UnknownParent(_))
        ));
    }
}
