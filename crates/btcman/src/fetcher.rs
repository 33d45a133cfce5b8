//! Resolves previous outputs for signing by querying the indexer.

use bitcoin::{Amount, OutPoint, ScriptBuf, TxOut};
use btcman_indexer::Indexer;
use tracing::error;

/// Looks up the output a transaction input spends, in the verbose form the
/// sighash computation needs.
pub struct PrevOutFetcher<'a, I: Indexer> {
    indexer: &'a I,
}

impl<I: Indexer> std::fmt::Debug for PrevOutFetcher<'_, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrevOutFetcher").finish_non_exhaustive()
    }
}

impl<'a, I: Indexer> PrevOutFetcher<'a, I> {
    pub fn new(indexer: &'a I) -> Self {
        Self { indexer }
    }

    /// Fetches the referenced output's value and scriptPubKey. Failures are
    /// logged and collapse to `None`; a missing previous output aborts
    /// signing upstream.
    pub async fn fetch(&self, outpoint: &OutPoint) -> Option<TxOut> {
        let tx = match self
            .indexer
            .get_transaction(&outpoint.txid.to_string(), true)
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                error!(err = %e, txid = %outpoint.txid, "failed to get previous transaction");
                return None;
            }
        };

        let Some(vout) = tx.vout.get(outpoint.vout as usize) else {
            error!(%outpoint, "previous transaction has no such output");
            return None;
        };

        let script = match hex::decode(&vout.script_pub_key.hex) {
            Ok(script) => script,
            Err(e) => {
                error!(err = %e, %outpoint, "failed to decode scriptPubKey");
                return None;
            }
        };

        // The indexer serves values in BTC; convert to satoshis.
        let value = Amount::from_sat((vout.value * 100_000_000.0).round() as u64);
        Some(TxOut {
            value,
            script_pubkey: ScriptBuf::from_bytes(script),
        })
    }
}
