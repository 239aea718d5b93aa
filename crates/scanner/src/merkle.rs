use utxoscan_log::log_warn;
use utxoscan_storage::{Column, KeyValueStore};

use crate::blockdata::{height_key, BlockDataIndex, BlockRecord};
use crate::error::ScanError;
use crate::scanner::BlockchainScanner;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MerkleCheck {
    /// Nothing has been committed.
    Empty,
    /// Every checked height is consistent up to the scanned top.
    Consistent { top: u32 },
    /// First height whose committed txids do not rebuild the header's merkle root.
    Mismatch { height: u32 },
}

impl<S: KeyValueStore> BlockchainScanner<S> {
    /// Walks committed block records upward from `start_height` and reports the
    /// first one that is missing, undecodable, or disagrees with its header.
    pub fn check_merkle(&self, start_height: u32) -> Result<MerkleCheck, ScanError> {
        let Some(top) = self.top_scanned() else {
            return Ok(MerkleCheck::Empty);
        };
        let store = self.store.as_ref();
        let base = BlockDataIndex::new(store).base()?.unwrap_or(0);
        for height in start_height.max(base)..=top.height {
            let consistent = match store.get(Column::BlockData, &height_key(height))? {
                Some(bytes) => BlockRecord::decode(&bytes)
                    .map(|record| record.is_consistent())
                    .unwrap_or(false),
                None => false,
            };
            if !consistent {
                log_warn!("merkle mismatch in committed block at height {height}");
                return Ok(MerkleCheck::Mismatch { height });
            }
        }
        Ok(MerkleCheck::Consistent { top: top.height })
    }
}
