mod common;

use std::sync::Arc;

use common::*;
use utxoscan_primitives::hash::script_hash;
use utxoscan_primitives::Hash256;
use utxoscan_scanner::{ChainView, ReorganizationState, ScanError};
use utxoscan_storage::memory::MemoryStore;
use utxoscan_storage::Column;

const DERIVED: [Column; 6] = [
    Column::Utxo,
    Column::AddressOutpoint,
    Column::History,
    Column::BlockUndo,
    Column::BlockData,
    Column::Meta,
];

/// Main chain 0..=4 from `busy_chain`, then a branch off height 2 that spends
/// the height-2 output and ends one block higher. Returns the branch tip's
/// reorganization and the old tip.
fn fork_chain(chain: &mut TestChain) -> (ReorganizationState, Hash256) {
    let old_tip = chain.tip_hash();
    let (branch_point, _) = &chain.blocks[2];
    let mut prev = branch_point.header.hash();
    let height_two_output = outpoint(&branch_point.transactions[0], 0);

    let branch = vec![
        vec![
            coinbase(103, TRACKED, 20),
            spend(height_two_output, OTHER, 45),
        ],
        vec![coinbase(104, OTHER, 20)],
        vec![coinbase(105, TRACKED, 20)],
    ];
    let mut reorg = None;
    for txs in branch {
        chain.writer.roll();
        let (hash, state) = chain.push_on(prev, txs);
        prev = hash;
        if state.is_some() {
            reorg = state;
        }
    }
    (reorg.expect("branch overtakes main chain"), old_tip)
}

fn fresh_dump(chain: &TestChain) -> Vec<(Column, Vec<u8>, Vec<u8>)> {
    let store = Arc::new(MemoryStore::new());
    chain
        .scanner(Arc::clone(&store), quick_config(2))
        .scan(0)
        .expect("fresh scan");
    dump(&store, &DERIVED)
}

#[test]
fn branch_switch_and_back_is_byte_identical() {
    let (mut chain, _) = busy_chain(4);
    let store = Arc::new(MemoryStore::new());
    let scanner = chain.scanner(Arc::clone(&store), quick_config(2));
    scanner.scan(0).expect("scan");
    let original = dump(&store, &DERIVED);

    let (state, old_tip) = fork_chain(&mut chain);
    assert_eq!(state.branch_height, 2);
    assert_eq!(state.undo.len(), 2);
    assert_eq!(state.apply.len(), 3);

    let summary = scanner.undo(&state).expect("switch to branch");
    assert_eq!(summary.undone, 2);
    assert_eq!(summary.applied, 3);
    assert_eq!(summary.top.map(|tip| tip.height), Some(5));
    assert_eq!(dump(&store, &DERIVED), fresh_dump(&chain));

    let back = chain.chain.set_tip(&old_tip).expect("switch back");
    assert_eq!(back.undo.len(), 3);
    let summary = scanner.undo(&back).expect("switch back");
    assert_eq!(summary.undone, 3);
    assert_eq!(summary.applied, 2);
    assert_eq!(scanner.top_scanned_block_hash(), Some(old_tip));
    assert_eq!(dump(&store, &DERIVED), original);
}

#[test]
fn branch_switch_moves_tracked_outputs() {
    let (mut chain, created) = busy_chain(4);
    let scanner = chain.scanner(Arc::new(MemoryStore::new()), quick_config(2));
    scanner.scan(0).expect("scan");
    let before: Vec<u32> = scanner.utxos().iter().map(|out| out.height).collect();
    assert_eq!(before.len(), 2);

    let (state, _) = fork_chain(&mut chain);
    scanner.undo(&state).expect("undo");

    // Height 2's output is spent on the branch; heights 3 and 5 pay the address.
    let mut heights: Vec<u32> = scanner.utxos().iter().map(|out| out.height).collect();
    heights.sort_unstable();
    assert_eq!(heights, vec![3, 5]);
    assert!(scanner
        .utxos()
        .iter()
        .all(|out| out.outpoint != outpoint(&created[1], 0)));
}

#[test]
fn restart_after_branch_switch_rewinds_stale_tip() {
    let (mut chain, _) = busy_chain(4);
    let store = Arc::new(MemoryStore::new());
    chain
        .scanner(Arc::clone(&store), quick_config(2))
        .scan(0)
        .expect("scan");

    fork_chain(&mut chain);
    assert_eq!(chain.chain.top().map(|block| block.height), Some(5));

    let scanner = chain.scanner(Arc::clone(&store), quick_config(2));
    let summary = scanner.scan_nocheck(100).expect("resume");
    assert_eq!(summary.start_height, 3);
    assert_eq!(summary.rewound, 2);
    assert_eq!(dump(&store, &DERIVED), fresh_dump(&chain));
}

#[test]
fn history_is_kept_when_history_updates_are_off() {
    let (mut chain, _) = busy_chain(4);
    let scanner = chain.scanner(Arc::new(MemoryStore::new()), quick_config(2));
    scanner.scan(0).expect("scan");
    let history = scanner.history(&script_hash(TRACKED)).expect("history");

    let (state, _) = fork_chain(&mut chain);
    scanner.update_ssh(false);
    scanner.undo(&state).expect("undo");

    assert_eq!(
        scanner.history(&script_hash(TRACKED)).expect("history"),
        history
    );
    assert_eq!(scanner.top_scanned().map(|tip| tip.height), Some(5));
    assert_eq!(scanner.utxo_count(), 2);
}

#[test]
fn undo_must_reach_the_scanned_tip() {
    let (chain, _) = busy_chain(4);
    let scanner = chain.scanner(Arc::new(MemoryStore::new()), quick_config(1));
    scanner.scan(0).expect("scan");
    let short = ReorganizationState {
        branch_height: 2,
        undo: chain.chain.block_at(4).into_iter().collect(),
        apply: Vec::new(),
    };
    assert!(matches!(scanner.undo(&short), Err(ScanError::Corrupt(_))));
    assert_eq!(scanner.top_scanned().map(|tip| tip.height), Some(4));
}

#[test]
fn undo_list_must_be_highest_first() {
    let (mut chain, _) = busy_chain(4);
    let store = Arc::new(MemoryStore::new());
    let scanner = chain.scanner(Arc::clone(&store), quick_config(2));
    scanner.scan(0).expect("scan");
    let before = dump(&store, &DERIVED);
    let utxos = scanner.utxos();

    let (mut state, old_tip) = fork_chain(&mut chain);
    state.undo.reverse();
    assert!(matches!(scanner.undo(&state), Err(ScanError::Corrupt(_))));
    assert_eq!(scanner.top_scanned_block_hash(), Some(old_tip));
    assert_eq!(scanner.utxos(), utxos);
    assert_eq!(dump(&store, &DERIVED), before);

    state.undo.reverse();
    let summary = scanner.undo(&state).expect("ordered undo");
    assert_eq!(summary.undone, 2);
    assert_eq!(dump(&store, &DERIVED), fresh_dump(&chain));
}
