//! Batched, pipelined block-file scanner maintaining a tracked UTXO set and
//! per-address transaction history in a `KeyValueStore`.

pub mod accumulator;
pub mod address_filter;
pub mod batch;
pub mod blockdata;
pub mod blockfiles;
pub mod chain;
pub mod config;
pub mod error;
pub mod filter;
pub mod hints;
pub mod history;
pub mod link;
pub mod merkle;
mod progress;
pub mod reorg;
pub mod resolver;
pub mod scanner;
pub mod signal;
pub mod utxo;

pub use address_filter::{AddressFilter, ScriptFilter};
pub use blockfiles::{BlockFileMap, BlockFileWriter, BlockFiles, BlockSource, FileLocation};
pub use chain::{ChainBlock, ChainView, MemoryChain, ReorganizationState};
pub use config::{ProgressCallback, ScanPhase, ScannerConfig};
pub use error::{FailureCause, ScanError, ScanFailure};
pub use merkle::MerkleCheck;
pub use resolver::TxResolution;
pub use scanner::{BlockchainScanner, ScanSummary};
