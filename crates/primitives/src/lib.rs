//! Block/transaction types, hashing and consensus serialization used by the scanner.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod transaction;

pub type Hash256 = [u8; 32];

pub use block::{Block, BlockDecodeError, BlockHeader, ParsedBlock};
pub use hash::{sha256, sha256d};
pub use merkle::merkle_root;
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};

/// Lowercase hex in display order (byte-reversed), as block explorers print hashes.
pub fn hash_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn bytes_from_hex(raw: &str) -> Option<Vec<u8>> {
    let raw = raw.trim();
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|idx| u8::from_str_radix(raw.get(idx..idx + 2)?, 16).ok())
        .collect()
}
