//! UTXO lifecycle: maturity filtering, funding selection, and the periodic
//! consolidation task that folds small outputs back into one.

use std::{sync::Arc, time::Duration};

use bitcoin::{
    absolute::LockTime, transaction::Version, Address, Amount, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use btcman_indexer::{Indexer, ShutdownListener, Utxo};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{error::ClientError, inscriber::builder::BITCOIN_DUST_LIMIT, keychain::Keychain};

/// Retains UTXOs whose conservative coinbase maturity has passed:
/// `blockchain_height − utxo.height + 1 > maturity`. Every output is
/// treated as potentially coinbase.
pub(crate) fn filter_mature(utxos: Vec<Utxo>, blockchain_height: i32, maturity: i32) -> Vec<Utxo> {
    utxos
        .into_iter()
        .filter(|utxo| blockchain_height - utxo.height + 1 > maturity)
        .collect()
}

/// The first mature UTXO worth at least `threshold_sat`, which will fund an
/// inscription.
pub(crate) fn select_funding_utxo(
    utxos: &[Utxo],
    threshold_sat: u64,
) -> Result<&Utxo, crate::error::InscriberError> {
    if utxos.is_empty() {
        return Err(crate::error::InscriberError::NoUtxos);
    }
    utxos
        .iter()
        .find(|utxo| utxo.value >= threshold_sat as i64)
        .ok_or(crate::error::InscriberError::NoSpendableUtxo)
}

/// Inputs and output value of one consolidation round.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ConsolidationPlan {
    pub inputs: Vec<OutPoint>,
    pub output_value: Amount,
}

/// Picks every UTXO strictly between the dust limit and the funding
/// threshold. Skips the round when fewer than `min_inputs` qualify or the
/// total would not clear the fee.
pub(crate) fn plan_consolidation(
    utxos: &[Utxo],
    threshold_sat: u64,
    fee_sat: u64,
    min_inputs: usize,
) -> Option<ConsolidationPlan> {
    if utxos.is_empty() {
        info!("address has zero utxos, skipping consolidation");
        return None;
    }

    let mut inputs = Vec::new();
    let mut total: i64 = 0;
    for utxo in utxos {
        if utxo.value > BITCOIN_DUST_LIMIT as i64 && utxo.value < threshold_sat as i64 {
            let txid: Txid = match utxo.tx_hash.parse() {
                Ok(txid) => txid,
                Err(e) => {
                    warn!(err = %e, tx_hash = %utxo.tx_hash, "skipping utxo with bad txid");
                    continue;
                }
            };
            debug!(tx_hash = %utxo.tx_hash, value = utxo.value, "adding utxo");
            inputs.push(OutPoint {
                txid,
                vout: utxo.tx_pos,
            });
            total += utxo.value;
        }
    }

    if inputs.len() < min_inputs || total <= fee_sat as i64 {
        info!(
            utxos = inputs.len(),
            min_inputs,
            utxo_threshold = threshold_sat,
            "not enough utxos under the threshold to consolidate"
        );
        return None;
    }

    let fee = (fee_sat as f64 * (inputs.len() as f64 * 0.1)) as i64;
    let Some(output_value) = total.checked_sub(fee).filter(|value| *value > 0) else {
        warn!(total, fee, "consolidation fee exceeds input total, skipping");
        return None;
    };

    Some(ConsolidationPlan {
        inputs,
        output_value: Amount::from_sat(output_value as u64),
    })
}

/// One-output transaction paying every planned input back to the owner.
pub(crate) fn build_consolidation_transaction(
    plan: &ConsolidationPlan,
    owner_script: ScriptBuf,
) -> Transaction {
    Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: plan
            .inputs
            .iter()
            .map(|outpoint| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: vec![TxOut {
            value: plan.output_value,
            script_pubkey: owner_script,
        }],
    }
}

/// Everything the consolidation task needs.
pub(crate) struct ConsolidationContext<I> {
    pub indexer: Arc<I>,
    pub keychain: Arc<Keychain>,
    pub address: Address,
    pub interval: Duration,
    pub fee_sat: u64,
    pub threshold_sat: u64,
    pub min_inputs: usize,
    pub maturity: i32,
}

/// Writer-only background loop. Work happens after each sleep so a slow
/// pass cannot pile up ticks; errors are logged and the next tick retries.
pub(crate) async fn consolidation_task<I: Indexer>(
    ctx: ConsolidationContext<I>,
    mut shutdown: ShutdownListener,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait_for_shutdown() => {
                debug!("consolidation loop stopping");
                return;
            }
            _ = sleep(ctx.interval) => {}
        }

        debug!("trying to consolidate");
        if let Err(e) = run_consolidation_pass(&ctx).await {
            error!(err = %e, "consolidation pass failed");
        }
    }
}

async fn run_consolidation_pass<I: Indexer>(
    ctx: &ConsolidationContext<I>,
) -> Result<(), ClientError> {
    let utxos = ctx.indexer.list_unspent(ctx.keychain.public_key()).await?;
    let tip = ctx.indexer.get_blockchain_info().await?.height;
    let mature = filter_mature(utxos, tip, ctx.maturity);

    let Some(plan) = plan_consolidation(&mature, ctx.threshold_sat, ctx.fee_sat, ctx.min_inputs)
    else {
        return Ok(());
    };
    info!(
        utxos = plan.inputs.len(),
        amount = %plan.output_value,
        "consolidating utxos"
    );

    let mut tx = build_consolidation_transaction(&plan, ctx.address.script_pubkey());
    ctx.keychain
        .sign_transaction(&mut tx, ctx.indexer.as_ref())
        .await?;
    let txid = ctx.indexer.send_transaction(&tx).await?;
    info!(%txid, "utxos consolidated successfully");
    Ok(())
}
