use std::fmt;

use utxoscan_primitives::encoding::DecodeError;
use utxoscan_primitives::{hash_to_hex, OutPoint};
use utxoscan_storage::StoreError;

use crate::blockfiles::BlockFileError;

/// Why the scan of a particular block height failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureCause {
    /// The block bytes at the chain's file location did not decode.
    Decode(String),
    /// The decoded header does not hash to the block the chain expects.
    HashMismatch,
    /// The chain names a main-chain height that no block file carries.
    MissingBlockData,
    /// A tracked spend whose funding output is absent from the tracked set.
    DanglingSpend(OutPoint),
    /// Reading the block file failed.
    BlockFile(String),
    WorkerPanicked,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Decode(message) => write!(f, "block decode failed: {message}"),
            FailureCause::HashMismatch => write!(f, "block hash does not match chain"),
            FailureCause::MissingBlockData => write!(f, "block data missing"),
            FailureCause::DanglingSpend(outpoint) => write!(
                f,
                "spend of untracked output {}:{}",
                hash_to_hex(&outpoint.hash),
                outpoint.index
            ),
            FailureCause::BlockFile(message) => write!(f, "block file error: {message}"),
            FailureCause::WorkerPanicked => write!(f, "scan worker panicked"),
        }
    }
}

/// A failure tied to the height at which scanning stopped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScanFailure {
    pub height: u32,
    pub cause: FailureCause,
}

impl ScanFailure {
    pub fn new(height: u32, cause: FailureCause) -> Self {
        Self { height, cause }
    }
}

impl fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan failed at height {}: {}", self.height, self.cause)
    }
}

impl std::error::Error for ScanFailure {}

#[derive(Debug)]
pub enum ScanError {
    Scanning(ScanFailure),
    Store(StoreError),
    BlockFile(BlockFileError),
    /// A persisted record failed to decode or contradicts another record.
    Corrupt(&'static str),
    Config(&'static str),
    Thread(String),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::Scanning(failure) => write!(f, "{failure}"),
            ScanError::Store(err) => write!(f, "store error: {err}"),
            ScanError::BlockFile(err) => write!(f, "block file error: {err}"),
            ScanError::Corrupt(message) => write!(f, "corrupt scan data: {message}"),
            ScanError::Config(message) => write!(f, "invalid scanner config: {message}"),
            ScanError::Thread(message) => write!(f, "thread error: {message}"),
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScanError::Scanning(failure) => Some(failure),
            ScanError::Store(err) => Some(err),
            ScanError::BlockFile(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ScanFailure> for ScanError {
    fn from(failure: ScanFailure) -> Self {
        ScanError::Scanning(failure)
    }
}

impl From<StoreError> for ScanError {
    fn from(err: StoreError) -> Self {
        ScanError::Store(err)
    }
}

impl From<BlockFileError> for ScanError {
    fn from(err: BlockFileError) -> Self {
        ScanError::BlockFile(err)
    }
}

/// Maps a record decode failure onto the store error the index helpers return.
pub(crate) fn corrupt_record(what: &str, err: DecodeError) -> StoreError {
    StoreError::Backend(format!("invalid {what} entry: {err}"))
}
