//! Per-address transaction history ("SSH") events.

use utxoscan_primitives::encoding::{DecodeError, Decoder, Encoder};
use utxoscan_primitives::Hash256;
use utxoscan_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::error::corrupt_record;
use crate::utxo::TrackedOutput;

pub const HISTORY_KEY_LEN: usize = 32 + 4 + 4 + 1 + 4;

/// Spends sort ahead of receives so a transaction's inputs are applied first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum EventKind {
    Spend = 0,
    Receive = 1,
}

impl EventKind {
    fn from_u8(raw: u8) -> Result<Self, DecodeError> {
        match raw {
            0 => Ok(EventKind::Spend),
            1 => Ok(EventKind::Receive),
            _ => Err(DecodeError::InvalidData("unknown history event kind")),
        }
    }
}

/// A tracked output being created (receive) or consumed (spend).
///
/// `txid`, `height` and `tx_index` locate the transaction doing the receiving
/// or spending; `io_index` is its output or input index. For a spend,
/// `output` is the consumed output as it was tracked.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HistoryEvent {
    pub kind: EventKind,
    pub height: u32,
    pub tx_index: u32,
    pub io_index: u32,
    pub txid: Hash256,
    pub output: TrackedOutput,
}

impl HistoryEvent {
    pub fn script_hash(&self) -> &Hash256 {
        &self.output.script_hash
    }

    /// Position of the event in chain order.
    pub fn position(&self) -> (u32, u32, EventKind, u32) {
        (self.height, self.tx_index, self.kind, self.io_index)
    }

    pub fn key(&self) -> [u8; HISTORY_KEY_LEN] {
        let mut key = [0u8; HISTORY_KEY_LEN];
        key[..32].copy_from_slice(self.script_hash());
        key[32..36].copy_from_slice(&self.height.to_be_bytes());
        key[36..40].copy_from_slice(&self.tx_index.to_be_bytes());
        key[40] = self.kind as u8;
        key[41..45].copy_from_slice(&self.io_index.to_be_bytes());
        key
    }

    pub(crate) fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.kind as u8);
        encoder.write_u32_le(self.height);
        encoder.write_u32_le(self.tx_index);
        encoder.write_u32_le(self.io_index);
        encoder.write_hash_le(&self.txid);
        self.output.encode_into(encoder);
    }

    pub(crate) fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            kind: EventKind::from_u8(decoder.read_u8()?)?,
            height: decoder.read_u32_le()?,
            tx_index: decoder.read_u32_le()?,
            io_index: decoder.read_u32_le()?,
            txid: decoder.read_hash_le()?,
            output: TrackedOutput::decode_from(decoder)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let event = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(event)
    }
}

pub fn sort_events(events: &mut [HistoryEvent]) {
    events.sort_by_key(HistoryEvent::position);
}

pub struct HistoryIndex<S> {
    store: S,
}

impl<S> HistoryIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> HistoryIndex<S> {
    pub fn insert(&self, batch: &mut WriteBatch, event: &HistoryEvent) {
        batch.put(Column::History, event.key(), event.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, event: &HistoryEvent) {
        batch.delete(Column::History, event.key());
    }

    /// History of one address in chain order.
    pub fn for_address(&self, script_hash: &Hash256) -> Result<Vec<HistoryEvent>, StoreError> {
        let mut events = Vec::new();
        self.for_each_with_prefix(script_hash, |event| {
            events.push(event);
            Ok(())
        })?;
        Ok(events)
    }

    pub fn for_each(
        &self,
        visit: impl FnMut(HistoryEvent) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.for_each_with_prefix(&[], visit)
    }

    fn for_each_with_prefix(
        &self,
        prefix: &[u8],
        mut visit: impl FnMut(HistoryEvent) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.store
            .for_each_prefix(Column::History, prefix, &mut |_key: &[u8], value: &[u8]| {
                let event =
                    HistoryEvent::decode(value).map_err(|err| corrupt_record("history", err))?;
                visit(event)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use utxoscan_primitives::OutPoint;
    use utxoscan_storage::memory::MemoryStore;

    fn event(kind: EventKind, height: u32, tx_index: u32, io_index: u32) -> HistoryEvent {
        HistoryEvent {
            kind,
            height,
            tx_index,
            io_index,
            txid: [height as u8; 32],
            output: TrackedOutput {
                outpoint: OutPoint {
                    hash: [7; 32],
                    index: io_index,
                },
                script_hash: [0xcc; 32],
                value: 50,
                script_pubkey: vec![0x51],
                height,
                tx_index,
            },
        }
    }

    #[test]
    fn keys_sort_in_chain_order() {
        let mut events = vec![
            event(EventKind::Receive, 300, 0, 0),
            event(EventKind::Receive, 2, 1, 0),
            event(EventKind::Spend, 2, 1, 3),
            event(EventKind::Receive, 2, 0, 5),
        ];
        let mut keys: Vec<_> = events.iter().map(HistoryEvent::key).collect();
        keys.sort();
        sort_events(&mut events);
        let sorted: Vec<_> = events.iter().map(HistoryEvent::key).collect();
        assert_eq!(keys, sorted);
        assert_eq!(events[1].kind, EventKind::Spend);
        assert_eq!(events[3].height, 300);
    }

    #[test]
    fn for_address_returns_stored_events() {
        let store = Arc::new(MemoryStore::new());
        let index = HistoryIndex::new(Arc::clone(&store));
        let mut batch = WriteBatch::new();
        let receive = event(EventKind::Receive, 1, 0, 0);
        let spend = event(EventKind::Spend, 4, 2, 0);
        index.insert(&mut batch, &spend);
        index.insert(&mut batch, &receive);
        store.write_batch(&batch).expect("write");
        let events = index.for_address(&[0xcc; 32]).expect("history");
        assert_eq!(events, vec![receive, spend]);
        assert!(matches!(
            HistoryEvent::decode(&[9u8]),
            Err(DecodeError::InvalidData(_))
        ));
    }
}
