mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::*;
use utxoscan_primitives::{hash_to_hex, Hash256, Transaction};
use utxoscan_scanner::filter::{hash_prefix, TxFilterIndex};
use utxoscan_scanner::hints::TxHintIndex;
use utxoscan_scanner::resolver::RejectReason;
use utxoscan_scanner::FileLocation;
use utxoscan_storage::memory::MemoryStore;
use utxoscan_storage::{KeyValueStore, WriteBatch};

/// Genesis, a block paying the tracked address, and a block spending it.
/// Returns the spending transaction and its block's location.
fn spent_chain() -> (TestChain, Transaction, FileLocation) {
    let mut chain = TestChain::new();
    chain.push(vec![coinbase(0, OTHER, 50)]);
    let funding = coinbase(1, TRACKED, 50);
    chain.push_own_file(vec![funding.clone()]);
    let spender = spend(outpoint(&funding, 0), OTHER, 40);
    chain.push_own_file(vec![coinbase(2, OTHER, 50), spender.clone()]);
    let location = chain.blocks[2].1;
    (chain, spender, location)
}

fn drop_hint(store: &MemoryStore, txid: &Hash256) {
    let mut batch = WriteBatch::new();
    TxHintIndex::new(store).delete(&mut batch, txid);
    store.write_batch(&batch).expect("delete hint");
}

/// Rewrites the filter stored for the block at `location`.
fn edit_filter(store: &MemoryStore, location: &FileLocation, edit: impl FnOnce(&mut Vec<u32>)) {
    let index = TxFilterIndex::new(store);
    let mut filter = index.get(location).expect("read").expect("filter");
    let mut prefixes: Vec<u32> = filter.entries.iter().map(|entry| entry.prefix).collect();
    edit(&mut prefixes);
    for (entry, prefix) in filter.entries.iter_mut().zip(prefixes) {
        entry.prefix = prefix;
    }
    let mut batch = WriteBatch::new();
    index.insert(&mut batch, &filter);
    store.write_batch(&batch).expect("write filter");
}

#[test]
fn fully_hinted_history_needs_no_resolution() {
    let (chain, _, _) = spent_chain();
    let scanner = chain.scanner(Arc::new(MemoryStore::new()), quick_config(2));
    scanner.scan(0).expect("scan");
    let resolution = scanner.resolve_tx_hashes().expect("resolve");
    assert!(resolution.resolved.is_empty());
    assert!(resolution.unresolved.is_empty());
}

#[test]
fn prefix_collision_is_confirmed_against_block_bytes() {
    let (chain, spender, location) = spent_chain();
    let store = Arc::new(MemoryStore::new());
    let scanner = chain.scanner(Arc::clone(&store), quick_config(2));
    scanner.scan(0).expect("scan");

    let txid = spender.txid();
    drop_hint(&store, &txid);
    // The coinbase now shares the spender's prefix.
    edit_filter(&store, &location, |prefixes| prefixes[0] = hash_prefix(&txid));
    assert!(scanner.tx_hint(&txid).expect("hint").is_none());

    let resolution = scanner.resolve_tx_hashes().expect("resolve");
    let key = resolution.resolved.get(&txid).expect("resolved");
    assert_eq!((key.height, key.tx_index), (2, 1));
    assert!(resolution.unresolved.is_empty());
    let collision = resolution
        .rejected
        .iter()
        .find(|rejected| rejected.hit.tx_index == 0)
        .expect("rejected collision");
    assert_eq!(collision.reason, RejectReason::TxidMismatch);
    assert_eq!(collision.hit.height, 2);

    let hint = scanner.tx_hint(&txid).expect("hint").expect("restored");
    assert_eq!((hint.height, hint.tx_index), (2, 1));
}

#[test]
fn unresolvable_hash_is_reported_and_logged() {
    utxoscan_log::enable_capture(4096);
    let (chain, spender, location) = spent_chain();
    let store = Arc::new(MemoryStore::new());
    let scanner = chain.scanner(Arc::clone(&store), quick_config(2));
    scanner.scan(0).expect("scan");

    let txid = spender.txid();
    drop_hint(&store, &txid);
    edit_filter(&store, &location, |prefixes| prefixes[1] ^= 1);

    let resolution = scanner.resolve_tx_hashes().expect("resolve");
    assert!(resolution.resolved.is_empty());
    assert_eq!(resolution.unresolved, BTreeSet::from([txid]));
    assert!(scanner.tx_hint(&txid).expect("hint").is_none());

    let needle = hash_to_hex(&txid);
    let logged = utxoscan_log::captured(4096).into_iter().any(|record| {
        record.level == utxoscan_log::Level::Warn && record.msg.contains(&needle)
    });
    assert!(logged, "missing unresolved warning");
}

#[test]
fn stale_branch_filters_are_rejected() {
    let (mut chain, _, _) = spent_chain();
    let store = Arc::new(MemoryStore::new());
    let scanner = chain.scanner(Arc::clone(&store), quick_config(2));
    scanner.scan(0).expect("scan");
    let stale = chain.blocks[2].0.transactions[0].txid();

    // Two blocks on height 1 take over height 2 without the scanner undoing it.
    let mut prev = chain.blocks[1].0.header.hash();
    for tag in [202u32, 203] {
        chain.writer.roll();
        prev = chain.push_on(prev, vec![coinbase(tag, OTHER, 5)]).0;
    }

    let resolution = scanner
        .resolve_hashes(&BTreeSet::from([stale]))
        .expect("resolve");
    assert!(resolution.resolved.is_empty());
    assert_eq!(resolution.unresolved, BTreeSet::from([stale]));
    assert!(resolution
        .rejected
        .iter()
        .any(|rejected| rejected.hit.hash == stale && rejected.reason == RejectReason::NotMainChain));
}
