use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// Ordered in-memory store; `write_batch` applies under one write lock, so
/// readers never observe half a batch.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, column: Column) -> usize {
        let guard = self.inner.read().expect("memory store lock");
        guard.keys().filter(|(entry, _)| *entry == column).count()
    }

    fn visit_prefix(
        map: &MemoryStoreMap,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'_>,
    ) -> Result<(), StoreError> {
        let start = (column, prefix.to_vec());
        for ((entry_column, key), value) in map.range(start..) {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        let mut results = Vec::new();
        Self::visit_prefix(&guard, column, prefix, &mut |key: &[u8], value: &[u8]| {
            results.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Self::visit_prefix(&guard, column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert((*column, key.as_slice().to_vec()), value.as_slice().to_vec());
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_is_ordered_and_column_scoped() {
        let store = MemoryStore::new();
        store.put(Column::History, b"ab\x02", b"2").expect("put");
        store.put(Column::History, b"ab\x01", b"1").expect("put");
        store.put(Column::History, b"ac\x00", b"x").expect("put");
        store.put(Column::Meta, b"ab\x00", b"m").expect("put");

        let entries = store.scan_prefix(Column::History, b"ab").expect("scan");
        assert_eq!(
            entries,
            vec![
                (b"ab\x01".to_vec(), b"1".to_vec()),
                (b"ab\x02".to_vec(), b"2".to_vec()),
            ]
        );
        assert_eq!(store.scan_prefix(Column::History, b"").expect("scan").len(), 3);
    }

    #[test]
    fn later_batch_ops_win() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Utxo, b"k", b"v1");
        batch.delete(Column::Utxo, b"k");
        batch.put(Column::Utxo, b"j", b"v2");
        store.write_batch(&batch).expect("commit");
        assert!(store.get(Column::Utxo, b"k").expect("get").is_none());
        assert_eq!(store.get(Column::Utxo, b"j").expect("get"), Some(b"v2".to_vec()));
        assert_eq!(store.len(Column::Utxo), 1);
    }
}
