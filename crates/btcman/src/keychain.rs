//! Key material and segwit v0 signing.

use bitcoin::{
    ecdsa,
    hashes::Hash as _,
    secp256k1::{PublicKey, SECP256K1},
    sighash::SighashCache,
    EcdsaSighashType, Network, PrivateKey, Transaction, Witness,
};
use btcman_indexer::Indexer;
use tracing::info;

use crate::{
    config::{Config, Mode},
    error::KeychainError,
    fetcher::PrevOutFetcher,
};

/// Holds the client's key material. The private key is present only in
/// writer mode and is read-only after construction.
pub struct Keychain {
    mode: Mode,
    private_key: Option<PrivateKey>,
    public_key: PublicKey,
    network: Network,
}

impl std::fmt::Debug for Keychain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keychain")
            .field("mode", &self.mode)
            .field("public_key", &self.public_key)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl Keychain {
    /// Builds the keychain for the given mode. Writer mode requires a WIF
    /// private key (the public key is derived from it); reader mode requires
    /// a compressed public key.
    pub fn new(config: &Config, mode: Mode, network: Network) -> Result<Self, KeychainError> {
        let (private_key, public_key) = match mode {
            Mode::Writer => {
                if config.private_key.is_empty() {
                    return Err(KeychainError::MissingPrivateKey);
                }
                let private_key = PrivateKey::from_wif(&config.private_key)
                    .map_err(|_| KeychainError::InvalidWif)?;
                let public_key = private_key.inner.public_key(SECP256K1);
                (Some(private_key), public_key)
            }
            Mode::Reader => {
                if config.public_key.is_empty() {
                    return Err(KeychainError::MissingPublicKey);
                }
                let public_key = config
                    .public_key
                    .parse::<PublicKey>()
                    .map_err(|_| KeychainError::InvalidPublicKey)?;
                (None, public_key)
            }
        };

        Ok(Self {
            mode,
            private_key,
            public_key,
            network,
        })
    }

    /// The compressed secp256k1 public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Signs every input of `tx` in place with SIGHASH_ALL, resolving each
    /// previous output through the indexer. On error the transaction may be
    /// partially signed and must be discarded by the caller.
    pub async fn sign_transaction<I: Indexer>(
        &self,
        tx: &mut Transaction,
        indexer: &I,
    ) -> Result<(), KeychainError> {
        if self.mode == Mode::Reader {
            return Err(KeychainError::ReaderModeSigning);
        }
        let private_key = self
            .private_key
            .as_ref()
            .ok_or(KeychainError::MissingPrivateKey)?;

        let fetcher = PrevOutFetcher::new(indexer);
        let mut prev_outs = Vec::with_capacity(tx.input.len());
        for (index, input) in tx.input.iter().enumerate() {
            let prev_out = fetcher.fetch(&input.previous_output).await.ok_or_else(|| {
                KeychainError::Signing {
                    index,
                    reason: format!(
                        "missing previous output {}",
                        input.previous_output
                    ),
                }
            })?;
            prev_outs.push(prev_out);
        }

        let mut cache = SighashCache::new(tx);
        for (index, prev_out) in prev_outs.iter().enumerate() {
            let sighash = cache
                .p2wpkh_signature_hash(
                    index,
                    &prev_out.script_pubkey,
                    prev_out.value,
                    EcdsaSighashType::All,
                )
                .map_err(|e| KeychainError::Signing {
                    index,
                    reason: e.to_string(),
                })?;

            let message = bitcoin::secp256k1::Message::from_digest(sighash.to_byte_array());
            let signature = ecdsa::Signature {
                signature: SECP256K1.sign_ecdsa(&message, &private_key.inner),
                sighash_type: EcdsaSighashType::All,
            };

            let witness = cache.witness_mut(index).ok_or(KeychainError::Signing {
                index,
                reason: "input disappeared while signing".to_string(),
            })?;
            *witness = Witness::p2wpkh(&signature, &self.public_key);
        }

        info!("transaction signed successfully");
        Ok(())
    }
}
