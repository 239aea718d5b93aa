//! Legacy (non-witness) transaction encoding.

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;
use crate::Hash256;

const MAX_TX_IO: u64 = 100_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        Encodable::consensus_encode(self, &mut encoder);
        encoder.into_inner()
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let vin_len = decoder.read_varint()?;
        if vin_len > MAX_TX_IO {
            return Err(DecodeError::InvalidData("too many transaction inputs"));
        }
        let mut vin = Vec::with_capacity(vin_len as usize);
        for _ in 0..vin_len {
            vin.push(TxIn::consensus_decode(decoder)?);
        }
        let vout_len = decoder.read_varint()?;
        if vout_len > MAX_TX_IO {
            return Err(DecodeError::InvalidData("too many transaction outputs"));
        }
        let mut vout = Vec::with_capacity(vout_len as usize);
        for _ in 0..vout_len {
            vout.push(TxOut::consensus_decode(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

/// Decodes the single transaction starting at `offset` and hashes exactly its bytes.
pub fn txid_at(block_bytes: &[u8], offset: usize) -> Result<(Transaction, Hash256), DecodeError> {
    let tail = block_bytes.get(offset..).ok_or(DecodeError::UnexpectedEof)?;
    let mut decoder = Decoder::new(tail);
    let tx = Transaction::consensus_decode(&mut decoder)?;
    let txid = sha256d(&tail[..decoder.position()]);
    Ok((tx, txid))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: [0x42; 32],
                    index: 3,
                },
                script_sig: vec![0x51, 0x52],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 5_000,
                script_pubkey: vec![0x76, 0xa9],
            }],
            lock_time: 9,
        }
    }

    #[test]
    fn txid_at_matches_whole_encoding() {
        let tx = sample();
        let mut bytes = vec![0xee; 5];
        bytes.extend_from_slice(&tx.consensus_encode());
        bytes.extend_from_slice(&[0xff; 3]);
        let (decoded, txid) = txid_at(&bytes, 5).expect("decode");
        assert_eq!(decoded, tx);
        assert_eq!(txid, tx.txid());
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = sample();
        assert!(!tx.is_coinbase());
        tx.vin[0].prevout = OutPoint::null();
        assert!(tx.is_coinbase());
    }
}
