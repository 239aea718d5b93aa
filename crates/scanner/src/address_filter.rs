use std::collections::HashSet;
use std::sync::RwLock;

use utxoscan_primitives::hash::script_hash;
use utxoscan_primitives::Hash256;

/// Decides which output scripts belong to tracked addresses.
pub trait AddressFilter: Send + Sync {
    fn is_tracked(&self, script_pubkey: &[u8]) -> bool;
    /// Script hashes of every tracked address.
    fn tracked(&self) -> Vec<Hash256>;
}

/// Tracks addresses by the sha256 of their output script.
#[derive(Debug, Default)]
pub struct ScriptFilter {
    hashes: RwLock<HashSet<Hash256>>,
}

impl ScriptFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scripts<I, T>(scripts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let filter = Self::new();
        for script in scripts {
            filter.track_script(script.as_ref());
        }
        filter
    }

    pub fn track_script(&self, script_pubkey: &[u8]) -> bool {
        self.track_hash(script_hash(script_pubkey))
    }

    pub fn track_hash(&self, hash: Hash256) -> bool {
        self.hashes.write().expect("filter lock").insert(hash)
    }

    pub fn len(&self) -> usize {
        self.hashes.read().expect("filter lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AddressFilter for ScriptFilter {
    fn is_tracked(&self, script_pubkey: &[u8]) -> bool {
        self.hashes
            .read()
            .expect("filter lock")
            .contains(&script_hash(script_pubkey))
    }

    fn tracked(&self) -> Vec<Hash256> {
        let mut hashes: Vec<_> = self
            .hashes
            .read()
            .expect("filter lock")
            .iter()
            .copied()
            .collect();
        hashes.sort();
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_by_script_hash() {
        let filter = ScriptFilter::with_scripts([vec![0x51u8]]);
        assert!(filter.is_tracked(&[0x51]));
        assert!(!filter.is_tracked(&[0x52]));
        assert!(!filter.track_script(&[0x51]));
        assert_eq!(filter.tracked(), vec![script_hash(&[0x51])]);
    }
}
