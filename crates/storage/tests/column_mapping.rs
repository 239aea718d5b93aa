use std::collections::HashSet;

use utxoscan_storage::Column;

#[test]
fn column_indexes_follow_declaration_order() {
    for (idx, column) in Column::ALL.iter().copied().enumerate() {
        assert_eq!(column.index(), idx);
    }
}

#[test]
fn column_names_are_unique() {
    let names: HashSet<&str> = Column::ALL.iter().map(|column| column.as_str()).collect();
    assert_eq!(names.len(), Column::ALL.len());
}

#[test]
fn scanner_columns_keep_their_partition_names() {
    assert_eq!(Column::AddressOutpoint.as_str(), "address_outpoint");
    assert_eq!(Column::TxHint.as_str(), "tx_hint");
    assert_eq!(Column::Meta.as_str(), "meta");
}
