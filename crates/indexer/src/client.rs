//! Typed Electrum client over the line-framed transport.
//!
//! Each call allocates a monotonically increasing id, registers a
//! single-shot waiter, sends `{"id", "method", "params"}` and awaits the
//! correlated response. A background dispatcher resolves waiters as lines
//! arrive, in whatever order the server answers.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use bitcoin::{consensus, secp256k1::PublicKey, Transaction};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::{
    error::{IndexerError, TransportError},
    scripthash::electrum_scripthash,
    shutdown::{ShutdownListener, ShutdownSignal},
    transport::Transport,
    types::{BlockchainInfo, HistoryItem, Request, Response, TransactionInfo, Utxo},
};

/// Capability interface for the Electrum-style indexer.
///
/// All address-indexed queries take the owner's public key; the scripthash
/// is derived internally.
#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Unspent outputs paying the key's P2WPKH script, unfiltered.
    async fn list_unspent(&self, public_key: &PublicKey) -> Result<Vec<Utxo>, IndexerError>;

    /// Confirmed-and-mempool history of the key's P2WPKH script.
    async fn get_history(&self, public_key: &PublicKey)
        -> Result<Vec<HistoryItem>, IndexerError>;

    /// A single transaction, raw hex or verbose.
    async fn get_transaction(
        &self,
        txid: &str,
        verbose: bool,
    ) -> Result<TransactionInfo, IndexerError>;

    /// The current chain tip (height and serialized header).
    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, IndexerError>;

    /// The 80-byte header at `height`, hex encoded.
    async fn get_block_header(&self, height: u64) -> Result<String, IndexerError>;

    /// Broadcasts a fully signed transaction, returning its txid.
    async fn send_transaction(&self, transaction: &Transaction) -> Result<String, IndexerError>;

    /// Tears the connection down and cancels in-flight requests.
    async fn disconnect(&self);
}

type Waiter = oneshot::Sender<Result<Value, IndexerError>>;
type PendingMap = Arc<Mutex<HashMap<u64, Waiter>>>;

/// Live client owning the transport and the response dispatcher.
#[derive(Debug)]
pub struct IndexerClient {
    transport: Transport,
    pending: PendingMap,
    next_id: AtomicU64,
    shutdown: ShutdownSignal,
}

impl IndexerClient {
    /// Connects to the indexer at `host:port` and starts the background
    /// reader and dispatcher.
    pub async fn connect(
        host: &str,
        port: &str,
        use_tls: bool,
        debug: bool,
    ) -> Result<Self, IndexerError> {
        let shutdown = ShutdownSignal::new();
        let (transport, lines_rx, errors_rx) =
            Transport::connect(host, port, use_tls, debug, shutdown.listener()).await?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(dispatch_task(
            lines_rx,
            errors_rx,
            pending.clone(),
            shutdown.listener(),
        ));

        Ok(Self {
            transport,
            pending,
            next_id: AtomicU64::new(0),
            shutdown,
        })
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Value, IndexerError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);

        let request = Request { id, method, params };
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');

        let mut listener = self.shutdown.listener();
        if let Err(e) = self.transport.send(&line, &listener).await {
            self.remove_waiter(id);
            return Err(e.into());
        }

        tokio::select! {
            biased;
            _ = listener.wait_for_shutdown() => {
                self.remove_waiter(id);
                Err(TransportError::Cancelled.into())
            }
            outcome = rx => match outcome {
                Ok(result) => result,
                // Waiter dropped by the dispatcher without an answer.
                Err(_) => Err(TransportError::ConnectionClosed.into()),
            }
        }
    }

    fn remove_waiter(&self, id: u64) {
        self.pending.lock().expect("pending lock").remove(&id);
    }
}

#[async_trait]
impl Indexer for IndexerClient {
    async fn list_unspent(&self, public_key: &PublicKey) -> Result<Vec<Utxo>, IndexerError> {
        let scripthash = electrum_scripthash(public_key);
        let result = self
            .call("blockchain.scripthash.listunspent", json!([scripthash]))
            .await?;
        decode(result)
    }

    async fn get_history(
        &self,
        public_key: &PublicKey,
    ) -> Result<Vec<HistoryItem>, IndexerError> {
        let scripthash = electrum_scripthash(public_key);
        let result = self
            .call("blockchain.scripthash.get_history", json!([scripthash]))
            .await?;
        decode(result)
    }

    async fn get_transaction(
        &self,
        txid: &str,
        verbose: bool,
    ) -> Result<TransactionInfo, IndexerError> {
        let result = self
            .call("blockchain.transaction.get", json!([txid, verbose]))
            .await?;
        if verbose {
            decode(result)
        } else {
            let hex: String = decode(result)?;
            Ok(TransactionInfo::from_raw_hex(hex))
        }
    }

    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, IndexerError> {
        let result = self.call("blockchain.headers.subscribe", json!([])).await?;
        decode(result)
    }

    async fn get_block_header(&self, height: u64) -> Result<String, IndexerError> {
        let result = self.call("blockchain.block.header", json!([height])).await?;
        decode(result)
    }

    async fn send_transaction(&self, transaction: &Transaction) -> Result<String, IndexerError> {
        let raw = consensus::encode::serialize_hex(transaction);
        let result = self
            .call("blockchain.transaction.broadcast", json!([raw]))
            .await?;
        decode(result)
    }

    async fn disconnect(&self) {
        self.shutdown.trigger();
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, IndexerError> {
    serde_json::from_value(value).map_err(IndexerError::decode)
}

/// Correlates inbound lines to waiters by id and fails in-flight requests
/// when the transport reports a failure.
async fn dispatch_task(
    mut lines_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut errors_rx: mpsc::UnboundedReceiver<TransportError>,
    pending: PendingMap,
    mut shutdown: ShutdownListener,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait_for_shutdown() => break,
            line = lines_rx.recv() => match line {
                Some(line) => dispatch_line(&pending, &line),
                None => break,
            },
            err = errors_rx.recv() => match err {
                Some(e) => {
                    error!(err = %e, "transport failure, failing in-flight requests");
                    fail_all(&pending, || TransportError::ConnectionClosed.into());
                }
                None => break,
            },
        }
    }
    fail_all(&pending, || TransportError::Cancelled.into());
    debug!("indexer dispatcher exited");
}

fn dispatch_line(pending: &PendingMap, line: &[u8]) {
    let response: Response = match serde_json::from_slice(line) {
        Ok(r) => r,
        Err(e) => {
            warn!(err = %e, "discarding undecodable line from indexer");
            return;
        }
    };

    let Some(id) = response.id else {
        // Subscription notification; nothing awaits these.
        debug!("ignoring indexer notification without id");
        return;
    };

    let Some(waiter) = pending.lock().expect("pending lock").remove(&id) else {
        warn!(id, "response for unknown or abandoned request id");
        return;
    };

    let outcome = match response.error {
        Some(err) => Err(rpc_error(err)),
        None => Ok(response.result.unwrap_or(Value::Null)),
    };
    let _ = waiter.send(outcome);
}

fn rpc_error(err: Value) -> IndexerError {
    let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
    let message = err
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| err.to_string());
    IndexerError::Rpc { code, message }
}

fn fail_all(pending: &PendingMap, make_err: impl Fn() -> IndexerError) {
    let waiters: Vec<Waiter> = {
        let mut map = pending.lock().expect("pending lock");
        map.drain().map(|(_, w)| w).collect()
    };
    for waiter in waiters {
        let _ = waiter.send(Err(make_err()));
    }
}
