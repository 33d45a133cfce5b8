//! Wire shapes for the Electrum protocol methods the client speaks.

use serde::{Deserialize, Serialize};

/// One unspent output as reported by `blockchain.scripthash.listunspent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Funding transaction id, hex.
    pub tx_hash: String,
    /// Output index within the funding transaction.
    pub tx_pos: u32,
    /// Value in satoshis.
    pub value: i64,
    /// Confirmation block height; `0` while unconfirmed.
    pub height: i32,
}

/// One entry of `blockchain.scripthash.get_history`.
///
/// `height <= 0` denotes a mempool transaction (`-1` when an unconfirmed
/// parent is involved), `height > 0` a confirmed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub tx_hash: String,
    pub height: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<i64>,
}

/// Result of `blockchain.headers.subscribe`: the current chain tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainInfo {
    /// Tip height.
    pub height: i32,
    /// Serialized 80-byte header, hex.
    pub hex: String,
}

/// A transaction as returned by `blockchain.transaction.get`.
///
/// With `verbose = false` the server returns bare raw hex and only `hex` is
/// populated; with `verbose = true` the decoded fields are present too.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    #[serde(default)]
    pub hex: String,
    #[serde(default)]
    pub txid: String,
    #[serde(default)]
    pub vout: Vec<TxOutInfo>,
    #[serde(default)]
    pub confirmations: Option<u32>,
}

impl TransactionInfo {
    /// Wraps a bare raw-hex response.
    pub fn from_raw_hex(hex: String) -> Self {
        Self {
            hex,
            ..Self::default()
        }
    }
}

/// Decoded output of a verbose transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutInfo {
    /// Value in BTC, as served by the indexer.
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKeyInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptPubKeyInfo {
    /// Serialized scriptPubKey, hex.
    pub hex: String,
    #[serde(default)]
    pub address: Option<String>,
}

/// Outbound JSON-RPC frame. One object per line, `\n` terminated.
#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: serde_json::Value,
}

/// Inbound JSON-RPC frame. Server notifications carry no `id` and are
/// ignored by the dispatcher.
#[derive(Debug, Deserialize)]
pub(crate) struct Response {
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}
