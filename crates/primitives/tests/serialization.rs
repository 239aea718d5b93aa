use utxoscan_primitives::block::{Block, BlockHeader, ParsedBlock, HEADER_LEN};
use utxoscan_primitives::merkle_root;
use utxoscan_primitives::outpoint::OutPoint;
use utxoscan_primitives::transaction::{txid_at, Transaction, TxIn, TxOut};

fn tx(tag: u8, outputs: usize) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint {
                hash: [tag; 32],
                index: 0,
            },
            script_sig: vec![tag; tag as usize % 7],
            sequence: u32::MAX,
        }],
        vout: (0..outputs)
            .map(|idx| TxOut {
                value: 1_000 * (idx as i64 + 1),
                script_pubkey: vec![0x51, tag, idx as u8],
            })
            .collect(),
        lock_time: 0,
    }
}

#[test]
fn header_is_eighty_bytes_and_hash_covers_all_fields() {
    let header = BlockHeader {
        version: 2,
        prev_block: [0x01; 32],
        merkle_root: [0x02; 32],
        time: 1_600_000_000,
        bits: 0x207f_ffff,
        nonce: 7,
    };
    assert_eq!(header.consensus_encode().len(), HEADER_LEN);
    let mut other = header.clone();
    other.nonce = 8;
    assert_ne!(header.hash(), other.hash());
}

#[test]
fn parsed_block_records_offsets_and_txids() {
    let transactions = vec![tx(1, 1), tx(2, 3), tx(3, 2)];
    let txids: Vec<_> = transactions.iter().map(Transaction::txid).collect();
    let block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: merkle_root(&txids),
            time: 0,
            bits: 0,
            nonce: 0,
        },
        transactions,
    };
    let bytes = block.consensus_encode();
    let parsed = ParsedBlock::parse(&bytes).expect("parse");

    assert_eq!(parsed.txids, txids);
    assert_eq!(parsed.tx_offsets[0] as usize, HEADER_LEN + 1);
    for (idx, offset) in parsed.tx_offsets.iter().enumerate() {
        let (decoded, txid) = txid_at(&bytes, *offset as usize).expect("tx at offset");
        assert_eq!(decoded, block.transactions[idx]);
        assert_eq!(txid, txids[idx]);
    }
    assert_eq!(merkle_root(&parsed.txids), block.header.merkle_root);
}

#[test]
fn truncated_block_is_rejected() {
    let block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0,
            nonce: 0,
        },
        transactions: vec![tx(9, 2)],
    };
    let bytes = block.consensus_encode();
    assert!(ParsedBlock::parse(&bytes[..bytes.len() - 1]).is_err());
}
