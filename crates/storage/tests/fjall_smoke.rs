#![cfg(feature = "fjall")]

use utxoscan_storage::fjall::{FjallOptions, FjallStore};
use utxoscan_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_batch_and_prefix_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let options = FjallOptions {
            sync_commits: true,
            ..FjallOptions::default()
        };
        let store = FjallStore::open_with_options(dir.path(), options).expect("open fjall");
        let mut batch = WriteBatch::new();
        batch.put(Column::History, b"addr:2", b"b");
        batch.put(Column::History, b"addr:1", b"a");
        batch.put(Column::Meta, b"top", b"t");
        store.write_batch(&batch).expect("commit");

        let entries = store.scan_prefix(Column::History, b"addr:").expect("scan");
        assert_eq!(
            entries,
            vec![
                (b"addr:1".to_vec(), b"a".to_vec()),
                (b"addr:2".to_vec(), b"b".to_vec()),
            ]
        );

        let mut batch = WriteBatch::new();
        batch.delete(Column::History, b"addr:1");
        store.write_batch(&batch).expect("commit");
        assert!(store.get(Column::History, b"addr:1").expect("get").is_none());
    }

    let reopened = FjallStore::open(dir.path()).expect("reopen fjall");
    assert_eq!(
        reopened.get(Column::Meta, b"top").expect("get"),
        Some(b"t".to_vec())
    );
}
