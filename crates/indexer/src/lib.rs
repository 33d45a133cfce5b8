//! Electrum-style indexer client: line-framed JSON-RPC over TCP (optionally
//! TLS), with request/response correlation, reconnection, and typed methods
//! for UTXO discovery, history, transaction retrieval, block headers, and
//! broadcast.

pub mod client;
pub mod error;
pub mod scripthash;
pub mod shutdown;
pub mod transport;
pub mod types;

pub use client::{Indexer, IndexerClient};
#[cfg(any(test, feature = "test-utils"))]
pub use client::MockIndexer;
pub use error::{IndexerError, TransportError};
pub use shutdown::{ShutdownListener, ShutdownSignal};
pub use types::{BlockchainInfo, HistoryItem, ScriptPubKeyInfo, TransactionInfo, TxOutInfo, Utxo};
