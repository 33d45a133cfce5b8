//! The client facade: composes the keychain, the indexer client, the
//! inscription engine and the consolidation loop into the public API.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bitcoin::{block::Header, consensus, Address, CompressedPublicKey, Network, OutPoint, Txid};
use btcman_indexer::{
    HistoryItem, Indexer, IndexerClient, ShutdownSignal, TransactionInfo, Utxo,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    config::{parse_network, Config, Mode},
    consolidation::{self, ConsolidationContext},
    error::{ClientError, ConfigError, KeychainError},
    inscriber::{
        self, InscriptionData, InscriptionRequest, InscriptionTxids, DEFAULT_COMMIT_FEE_RATE,
        DEFAULT_REVEAL_FEE_RATE, OCTET_STREAM_CONTENT_TYPE,
    },
    keychain::Keychain,
};

/// The btcman client. Reader mode serves queries and decoding; writer mode
/// additionally signs, inscribes, and runs the consolidation loop.
#[derive(Debug)]
pub struct Client<I: Indexer> {
    mode: Mode,
    keychain: Arc<Keychain>,
    indexer: Arc<I>,
    address: Address,
    utxo_threshold_sat: u64,
    coinbase_maturity: i32,
    shutdown: ShutdownSignal,
    consolidation_task: Mutex<Option<JoinHandle<()>>>,
}

/// Construction state shared by [`Client::connect`] and
/// [`Client::with_indexer`]: everything that can fail before a connection
/// exists.
struct ClientParts {
    mode: Mode,
    network: Network,
    keychain: Arc<Keychain>,
    address: Address,
}

impl ClientParts {
    fn prepare(config: &Config) -> Result<Self, ClientError> {
        if config.enable_debug {
            debug!("creating btcman");
        }
        if !config.is_valid() {
            return Err(ConfigError::Invalid.into());
        }
        let network = parse_network(&config.net)?;
        let mode = Mode::parse(&config.mode)?;
        let keychain = Arc::new(Keychain::new(config, mode, network)?);
        let address = Address::p2wpkh(&CompressedPublicKey(*keychain.public_key()), network);

        Ok(Self {
            mode,
            network,
            keychain,
            address,
        })
    }
}

impl Client<IndexerClient> {
    /// Validates the configuration, connects to the indexer, and (in writer
    /// mode) starts the consolidation loop.
    pub async fn connect(config: Config) -> Result<Self, ClientError> {
        let parts = ClientParts::prepare(&config)?;
        let indexer = IndexerClient::connect(
            &config.indexer_host,
            &config.indexer_port,
            config.enable_tls,
            config.enable_debug,
        )
        .await?;
        Ok(Self::assemble(&config, parts, Arc::new(indexer)))
    }
}

impl<I: Indexer + 'static> Client<I> {
    /// Builds a client around an existing indexer handle. Used by tests and
    /// callers bringing their own transport.
    pub fn with_indexer(config: &Config, indexer: Arc<I>) -> Result<Self, ClientError> {
        let parts = ClientParts::prepare(config)?;
        Ok(Self::assemble(config, parts, indexer))
    }

    fn assemble(config: &Config, parts: ClientParts, indexer: Arc<I>) -> Self {
        let shutdown = ShutdownSignal::new();

        let consolidation_task = if parts.mode == Mode::Writer {
            let ctx = ConsolidationContext {
                indexer: indexer.clone(),
                keychain: parts.keychain.clone(),
                address: parts.address.clone(),
                interval: Duration::from_secs(config.consolidation_interval_s()),
                fee_sat: config.consolidation_fee_sat(),
                threshold_sat: config.utxo_threshold_sat(),
                min_inputs: config.min_consolidation_inputs(),
                maturity: config.coinbase_maturity(),
            };
            Some(tokio::spawn(consolidation::consolidation_task(
                ctx,
                shutdown.listener(),
            )))
        } else {
            None
        };

        info!(mode = ?parts.mode, network = %parts.network, address = %parts.address, "btcman client ready");
        Self {
            mode: parts.mode,
            keychain: parts.keychain,
            indexer,
            address: parts.address,
            utxo_threshold_sat: config.utxo_threshold_sat(),
            coinbase_maturity: config.coinbase_maturity(),
            shutdown,
            consolidation_task: Mutex::new(consolidation_task),
        }
    }

    /// The client's P2WPKH address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Inscribes `data` with the commit/reveal protocol and returns the
    /// resulting transaction ids. Writer mode only.
    pub async fn inscribe(&self, data: &[u8]) -> Result<InscriptionTxids, ClientError> {
        if self.mode != Mode::Writer {
            return Err(KeychainError::ReaderModeSigning.into());
        }

        let (request, funding) = self.create_inscription_request(data).await?;
        let txids = inscriber::inscribe(
            &self.keychain,
            self.indexer.as_ref(),
            &request,
            &funding,
            &self.address,
        )
        .await?;
        Ok(txids)
    }

    /// Builds the request for one payload, funded by the first mature UTXO
    /// above the configured threshold.
    async fn create_inscription_request(
        &self,
        data: &[u8],
    ) -> Result<(InscriptionRequest, Vec<(OutPoint, u64)>), ClientError> {
        let utxos = self.list_unspent().await?;
        let utxo = consolidation::select_funding_utxo(&utxos, self.utxo_threshold_sat)?;
        info!("utxo for address was found");

        let txid: Txid = utxo.tx_hash.parse().map_err(ClientError::decode)?;
        let outpoint = OutPoint {
            txid,
            vout: utxo.tx_pos,
        };

        let request = InscriptionRequest {
            commit_outpoints: vec![outpoint],
            commit_fee_rate: DEFAULT_COMMIT_FEE_RATE,
            reveal_fee_rate: DEFAULT_REVEAL_FEE_RATE,
            data: vec![InscriptionData {
                content_type: OCTET_STREAM_CONTENT_TYPE.to_string(),
                body: data.to_vec(),
                destination: self.address.clone(),
            }],
            single_reveal_tx_only: true,
        };
        Ok((request, vec![(outpoint, utxo.value as u64)]))
    }

    /// Reads back an inscribed payload as whitespace-stripped script text.
    pub async fn decode_inscription(&self, reveal_txid: &str) -> Result<String, ClientError> {
        let tx = self.indexer.get_transaction(reveal_txid, false).await?;
        Ok(inscriber::decode_inscription_script(&tx.hex)?)
    }

    /// Current height of the blockchain.
    pub async fn get_blockchain_height(&self) -> Result<i32, ClientError> {
        Ok(self.indexer.get_blockchain_info().await?.height)
    }

    /// Unspent outputs of the client address that have passed the
    /// conservative coinbase maturity.
    pub async fn list_unspent(&self) -> Result<Vec<Utxo>, ClientError> {
        let utxos = self
            .indexer
            .list_unspent(self.keychain.public_key())
            .await?;
        let blockchain_height = self.get_blockchain_height().await?;
        Ok(consolidation::filter_mature(
            utxos,
            blockchain_height,
            self.coinbase_maturity,
        ))
    }

    /// Transaction history of the client address.
    ///
    /// Mempool entries lead the result when `include_mempool` is set;
    /// confirmed entries are ascending by height and, when
    /// `start_height > 1`, trimmed to the first entry at or above it.
    pub async fn get_history(
        &self,
        start_height: i32,
        include_mempool: bool,
    ) -> Result<Vec<HistoryItem>, ClientError> {
        let mut transactions = self
            .indexer
            .get_history(self.keychain.public_key())
            .await?;
        transactions.reverse();

        // Reversed, the head holds mempool entries (height <= 0) followed by
        // confirmed entries in descending height.
        let split = transactions
            .iter()
            .position(|tx| tx.height > 0)
            .unwrap_or(transactions.len());
        let mut confirmed = transactions.split_off(split);
        let mempool = transactions;
        confirmed.reverse();

        if start_height > 1 {
            let blockchain_height = self.get_blockchain_height().await?;
            if start_height > blockchain_height {
                return Err(ClientError::StartHeightBeyondTip);
            }

            let index = confirmed.partition_point(|tx| tx.height < start_height);
            if index == confirmed.len() {
                warn!(start_height, "no transactions found beyond specified start height");
                return Ok(Vec::new());
            }
            confirmed.drain(..index);
        }

        Ok(if include_mempool {
            mempool.into_iter().chain(confirmed).collect()
        } else {
            confirmed
        })
    }

    /// A single transaction, raw or verbose.
    pub async fn get_transaction(
        &self,
        txid: &str,
        verbose: bool,
    ) -> Result<TransactionInfo, ClientError> {
        Ok(self.indexer.get_transaction(txid, verbose).await?)
    }

    /// The decoded 80-byte block header at `height`.
    pub async fn get_block_header(&self, height: u64) -> Result<Header, ClientError> {
        let header_hex = self.indexer.get_block_header(height).await?;
        let bytes = hex::decode(&header_hex).map_err(ClientError::decode)?;
        if bytes.len() != 80 {
            return Err(ClientError::Decode(format!(
                "block header must be 80 bytes, got {}",
                bytes.len()
            )));
        }
        consensus::deserialize(&bytes).map_err(ClientError::decode)
    }

    /// Stops the consolidation loop and disconnects the indexer.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let task = self.consolidation_task.lock().expect("task lock").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.indexer.disconnect().await;
        info!("btcman client shut down");
    }
}
