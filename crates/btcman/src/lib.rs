//! Bitcoin client for anchoring opaque payloads on-chain with the
//! inscription envelope.
//!
//! A [`Client`] in writer mode selects a funding UTXO, builds and signs a
//! commit/reveal transaction pair whose reveal witness carries the payload,
//! and broadcasts both through an Electrum-style indexer. In reader mode it
//! only needs a public key and can list unspent outputs, fetch history and
//! headers, and decode previously inscribed payloads. A background task
//! periodically consolidates small UTXOs so the funding set stays usable.

pub mod client;
pub mod config;
pub mod consolidation;
pub mod error;
pub mod fetcher;
pub mod inscriber;
pub mod keychain;

pub use client::Client;
pub use config::{Config, Mode};
pub use error::{ClientError, ConfigError, InscriberError, KeychainError};
pub use inscriber::{InscriptionData, InscriptionRequest, InscriptionTxids};

// Re-exported so callers can name the indexer-facing types without a direct
// dependency on the transport crate.
pub use btcman_indexer::{HistoryItem, Indexer, IndexerError, TransactionInfo, Utxo};
