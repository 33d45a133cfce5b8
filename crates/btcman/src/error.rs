use bitcoin::consensus::encode::Error as ConsensusError;
use btcman_indexer::IndexerError;
use thiserror::Error;

/// Construction-time configuration failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required field is missing.
    #[error("invalid config")]
    Invalid,

    /// The network string is not one of mainnet/testnet/regtest.
    #[error("invalid network")]
    InvalidNetwork,

    /// The mode string is not reader/writer.
    #[error("invalid mode")]
    InvalidMode,
}

/// Key-material and signing failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeychainError {
    #[error("private key is required for btcman in writer mode")]
    MissingPrivateKey,

    #[error("public key is required for btcman in reader mode")]
    MissingPublicKey,

    #[error("error decoding wif private key")]
    InvalidWif,

    #[error("error decoding compressed public key")]
    InvalidPublicKey,

    /// Signing was requested in reader mode.
    #[error("btcman in reader mode does not support signing transactions")]
    ReaderModeSigning,

    /// Producing a witness for one input failed. The transaction may be
    /// partially signed; callers must discard it.
    #[error("failed to sign input {index}: {reason}")]
    Signing { index: usize, reason: String },
}

/// Inscription construction and decoding failures.
#[derive(Debug, Error)]
pub enum InscriberError {
    /// The address has no unspent outputs at all.
    #[error("there are no UTXOs")]
    NoUtxos,

    /// No mature UTXO meets the funding threshold.
    #[error("can't find utxo to inscribe")]
    NoSpendableUtxo,

    /// The selected funding does not cover outputs plus fees.
    #[error("insufficient funding: need {needed} sat, have {available} sat")]
    FundingInsufficient { needed: u64, available: u64 },

    /// The payload cannot be fit into an envelope within script-size rules.
    #[error("envelope payload of {size} bytes exceeds the maximum of {max}")]
    EnvelopeTooLarge { size: usize, max: usize },

    /// The reveal transaction exists but carries no inscription witness.
    #[error("reveal transaction has no inscription witness")]
    MissingInscriptionWitness,

    /// The content-type marker was not found in the witness.
    #[error("inscription hex is invalid")]
    MarkerNotFound,

    /// Taproot assembly or schnorr signing failed.
    #[error("failed to sign reveal transaction: {0}")]
    Sign(String),

    /// The indexer rejected a broadcast.
    #[error("failed to broadcast transaction: {0}")]
    Broadcast(IndexerError),

    /// Malformed hex or transaction bytes on the decode path.
    #[error("failed to decode transaction: {0}")]
    Decode(String),
}

impl From<hex::FromHexError> for InscriberError {
    fn from(e: hex::FromHexError) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<ConsensusError> for InscriberError {
    fn from(e: ConsensusError) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Umbrella error surfaced by the [`Client`](crate::Client) facade.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Keychain(#[from] KeychainError),

    #[error(transparent)]
    Indexer(#[from] IndexerError),

    #[error(transparent)]
    Inscriber(#[from] InscriberError),

    /// A hex blob or header from the indexer could not be decoded.
    #[error("failed to decode indexer payload: {0}")]
    Decode(String),

    /// `get_history` was asked to start beyond the chain tip.
    #[error("start height is greater than the blockchain height")]
    StartHeightBeyondTip,
}

impl ClientError {
    pub(crate) fn decode(e: impl std::fmt::Display) -> Self {
        Self::Decode(e.to_string())
    }
}
