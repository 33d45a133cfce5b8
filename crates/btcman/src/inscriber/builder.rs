//! Commit/reveal transaction construction, fee math, and reveal signing.
//!
//! Each data item gets an ephemeral taproot keypair whose script tree holds
//! the item's envelope. The commit transaction pays one P2TR output per item
//! (plus change); reveals spend those outputs with a
//! `[signature, envelope, control block]` witness.

use bitcoin::{
    absolute::LockTime,
    hashes::Hash as _,
    key::UntweakedKeypair,
    secp256k1::{rand, Message, XOnlyPublicKey, SECP256K1},
    sighash::{Prevouts, SighashCache, TapSighashType},
    taproot::{ControlBlock, LeafVersion, TapLeafHash, TaprootBuilder, TaprootSpendInfo},
    transaction::Version,
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use tracing::trace;

use super::{envelope::build_envelope_script, InscriptionRequest, DEFAULT_REVEAL_OUT_VALUE};
use crate::error::InscriberError;

/// Outputs below this are unspendable under standard relay rules.
pub(crate) const BITCOIN_DUST_LIMIT: u64 = 546;

/// Witness placeholder sizes for virtual-size estimation.
const SCHNORR_SIGNATURE_SIZE: usize = 64;
const ECDSA_SIGNATURE_SIZE: usize = 72;
const COMPRESSED_PUBKEY_SIZE: usize = 33;

/// Per-item state carried from commit construction into reveal signing.
pub(crate) struct RevealArtifact {
    key_pair: UntweakedKeypair,
    envelope_script: ScriptBuf,
    spend_info: TaprootSpendInfo,
    commit_value: u64,
    destination: Address,
}

impl std::fmt::Debug for RevealArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevealArtifact")
            .field("commit_value", &self.commit_value)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

/// The unsigned commit transaction plus everything needed to reveal.
#[derive(Debug)]
pub(crate) struct CommitPlan {
    pub commit_tx: Transaction,
    pub artifacts: Vec<RevealArtifact>,
}

/// Builds the commit transaction spending `funding` and paying one
/// commitment output per data item, with change back to `change_address`
/// when the excess clears the dust limit.
pub(crate) fn build_commit_transaction(
    request: &InscriptionRequest,
    funding: &[(OutPoint, u64)],
    network: Network,
    change_address: &Address,
) -> Result<CommitPlan, InscriberError> {
    let mut artifacts = Vec::with_capacity(request.data.len());
    for item in &request.data {
        let key_pair = UntweakedKeypair::new(SECP256K1, &mut rand::thread_rng());
        let public_key = XOnlyPublicKey::from_keypair(&key_pair).0;

        let envelope_script = build_envelope_script(&item.content_type, &item.body)?;
        let spend_info = TaprootBuilder::new()
            .add_leaf(0, envelope_script.clone())
            .map_err(|e| InscriberError::Sign(e.to_string()))?
            .finalize(SECP256K1, public_key)
            .map_err(|_| InscriberError::Sign("could not finalize taproot spend info".into()))?;
        let control_block = control_block(&spend_info, &envelope_script)?;

        // The commitment must fund the reveal's fee on top of its output.
        let reveal_vsize = estimate_reveal_vsize(
            &[placeholder_input()],
            &[TxOut {
                value: Amount::from_sat(DEFAULT_REVEAL_OUT_VALUE),
                script_pubkey: item.destination.script_pubkey(),
            }],
            &[(&envelope_script, &control_block)],
        );
        let commit_value =
            DEFAULT_REVEAL_OUT_VALUE + (reveal_vsize as u64) * request.reveal_fee_rate;

        artifacts.push(RevealArtifact {
            key_pair,
            envelope_script,
            spend_info,
            commit_value,
            destination: item.destination.clone(),
        });
    }

    let commitment_outputs: Vec<TxOut> = artifacts
        .iter()
        .map(|artifact| {
            let public_key = XOnlyPublicKey::from_keypair(&artifact.key_pair).0;
            let address = Address::p2tr(
                SECP256K1,
                public_key,
                artifact.spend_info.merkle_root(),
                network,
            );
            TxOut {
                value: Amount::from_sat(artifact.commit_value),
                script_pubkey: address.script_pubkey(),
            }
        })
        .collect();

    let inputs: Vec<TxIn> = funding.iter().map(|(outpoint, _)| make_txin(*outpoint)).collect();
    let funding_total: u64 = funding.iter().map(|(_, value)| *value).sum();
    let output_total: u64 = artifacts.iter().map(|a| a.commit_value).sum();

    // Adding change can grow the transaction enough to change the fee, so
    // iterate until the estimated size settles.
    let mut last_size = estimate_commit_vsize(&inputs, &commitment_outputs);
    loop {
        let fee = (last_size as u64) * request.commit_fee_rate;
        let needed = output_total + fee;
        if funding_total < needed {
            return Err(InscriberError::FundingInsufficient {
                needed,
                available: funding_total,
            });
        }

        let excess = funding_total - needed;
        let mut outputs = commitment_outputs.clone();
        let mut done = false;
        if excess >= BITCOIN_DUST_LIMIT {
            outputs.push(TxOut {
                value: Amount::from_sat(excess),
                script_pubkey: change_address.script_pubkey(),
            });
        } else {
            // Sub-dust excess is left to the miner.
            done = true;
        }

        let size = estimate_commit_vsize(&inputs, &outputs);
        trace!(size, last_size, fee, "sizing commit transaction");
        if size == last_size || done {
            let commit_tx = Transaction {
                version: Version(2),
                lock_time: LockTime::ZERO,
                input: inputs,
                output: outputs,
            };
            return Ok(CommitPlan {
                commit_tx,
                artifacts,
            });
        }
        last_size = size;
    }
}

/// Builds and signs one reveal transaction per data item, each spending its
/// commitment output and paying `commit_value − fee` to the destination.
pub(crate) fn build_reveal_transactions(
    plan: &CommitPlan,
    reveal_fee_rate: u64,
) -> Result<Vec<Transaction>, InscriberError> {
    let commit_txid = plan.commit_tx.compute_txid();
    let mut reveal_txs = Vec::with_capacity(plan.artifacts.len());

    for (vout, artifact) in plan.artifacts.iter().enumerate() {
        let commit_output = &plan.commit_tx.output[vout];
        let control_block = control_block(&artifact.spend_info, &artifact.envelope_script)?;

        let input = make_txin(OutPoint {
            txid: commit_txid,
            vout: vout as u32,
        });
        let placeholder_output = TxOut {
            value: Amount::from_sat(DEFAULT_REVEAL_OUT_VALUE),
            script_pubkey: artifact.destination.script_pubkey(),
        };
        let vsize = estimate_reveal_vsize(
            std::slice::from_ref(&input),
            std::slice::from_ref(&placeholder_output),
            &[(&artifact.envelope_script, &control_block)],
        );
        let fee = (vsize as u64) * reveal_fee_rate;

        let available = commit_output.value.to_sat();
        let output_value = available
            .checked_sub(fee)
            .filter(|value| *value >= BITCOIN_DUST_LIMIT)
            .ok_or(InscriberError::FundingInsufficient {
                needed: fee + BITCOIN_DUST_LIMIT,
                available,
            })?;

        let mut reveal_tx = Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: vec![input],
            output: vec![TxOut {
                value: Amount::from_sat(output_value),
                script_pubkey: artifact.destination.script_pubkey(),
            }],
        };

        sign_reveal_inputs(
            &mut reveal_tx,
            std::slice::from_ref(commit_output),
            &[artifact],
        )?;
        reveal_txs.push(reveal_tx);
    }

    Ok(reveal_txs)
}

/// Builds and signs a single reveal transaction spending every commitment
/// output, paying each destination the default reveal value. Whatever the
/// per-item commitments funded beyond this smaller combined transaction is
/// spent as fee.
pub(crate) fn build_single_reveal_transaction(
    plan: &CommitPlan,
    reveal_fee_rate: u64,
) -> Result<Transaction, InscriberError> {
    let commit_txid = plan.commit_tx.compute_txid();
    let prevouts: Vec<TxOut> = plan.commit_tx.output[..plan.artifacts.len()].to_vec();

    let inputs: Vec<TxIn> = (0..plan.artifacts.len())
        .map(|vout| {
            make_txin(OutPoint {
                txid: commit_txid,
                vout: vout as u32,
            })
        })
        .collect();
    let outputs: Vec<TxOut> = plan
        .artifacts
        .iter()
        .map(|artifact| TxOut {
            value: Amount::from_sat(DEFAULT_REVEAL_OUT_VALUE),
            script_pubkey: artifact.destination.script_pubkey(),
        })
        .collect();

    let control_blocks = plan
        .artifacts
        .iter()
        .map(|artifact| control_block(&artifact.spend_info, &artifact.envelope_script))
        .collect::<Result<Vec<_>, _>>()?;
    let witness_shapes: Vec<(&ScriptBuf, &ControlBlock)> = plan
        .artifacts
        .iter()
        .zip(control_blocks.iter())
        .map(|(artifact, control_block)| (&artifact.envelope_script, control_block))
        .collect();

    let vsize = estimate_reveal_vsize(&inputs, &outputs, &witness_shapes);
    let fee = (vsize as u64) * reveal_fee_rate;
    let available: u64 = prevouts.iter().map(|out| out.value.to_sat()).sum();
    let needed = fee + (outputs.len() as u64) * DEFAULT_REVEAL_OUT_VALUE;
    if available < needed {
        return Err(InscriberError::FundingInsufficient { needed, available });
    }

    let mut reveal_tx = Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: inputs,
        output: outputs,
    };

    let artifacts: Vec<&RevealArtifact> = plan.artifacts.iter().collect();
    sign_reveal_inputs(&mut reveal_tx, &prevouts, &artifacts)?;
    Ok(reveal_tx)
}

/// Schnorr-signs every input of a reveal transaction via the tapscript
/// spend path; input `i` is signed with artifact `i`'s ephemeral key.
fn sign_reveal_inputs(
    reveal_tx: &mut Transaction,
    prevouts: &[TxOut],
    artifacts: &[&RevealArtifact],
) -> Result<(), InscriberError> {
    let mut cache = SighashCache::new(reveal_tx);
    for (index, artifact) in artifacts.iter().enumerate() {
        let control_block = control_block(&artifact.spend_info, &artifact.envelope_script)?;
        let sighash = cache
            .taproot_script_spend_signature_hash(
                index,
                &Prevouts::All(prevouts),
                TapLeafHash::from_script(&artifact.envelope_script, LeafVersion::TapScript),
                TapSighashType::Default,
            )
            .map_err(|e| InscriberError::Sign(e.to_string()))?;

        let message = Message::from_digest(sighash.to_byte_array());
        let signature =
            SECP256K1.sign_schnorr_with_rng(&message, &artifact.key_pair, &mut rand::thread_rng());

        let witness = cache
            .witness_mut(index)
            .ok_or_else(|| InscriberError::Sign("missing reveal input".into()))?;
        witness.push(signature.as_ref());
        witness.push(artifact.envelope_script.as_bytes());
        witness.push(control_block.serialize());
    }
    Ok(())
}

fn control_block(
    spend_info: &TaprootSpendInfo,
    envelope_script: &ScriptBuf,
) -> Result<ControlBlock, InscriberError> {
    spend_info
        .control_block(&(envelope_script.clone(), LeafVersion::TapScript))
        .ok_or_else(|| InscriberError::Sign("cannot create control block".into()))
}

fn make_txin(previous_output: OutPoint) -> TxIn {
    TxIn {
        previous_output,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
        witness: Witness::new(),
    }
}

fn placeholder_input() -> TxIn {
    make_txin(OutPoint::null())
}

/// Virtual size of the commit transaction with fully populated P2WPKH
/// witnesses.
fn estimate_commit_vsize(inputs: &[TxIn], outputs: &[TxOut]) -> usize {
    let mut tx = Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: inputs.to_vec(),
        output: outputs.to_vec(),
    };
    for input in &mut tx.input {
        input.witness.push([0u8; ECDSA_SIGNATURE_SIZE]);
        input.witness.push([0u8; COMPRESSED_PUBKEY_SIZE]);
    }
    tx.vsize()
}

/// Virtual size of a reveal transaction with fully populated tapscript
/// witnesses; `witness_shapes[i]` is input `i`'s envelope and control block.
fn estimate_reveal_vsize(
    inputs: &[TxIn],
    outputs: &[TxOut],
    witness_shapes: &[(&ScriptBuf, &ControlBlock)],
) -> usize {
    let mut tx = Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: inputs.to_vec(),
        output: outputs.to_vec(),
    };
    for (input, (script, control_block)) in tx.input.iter_mut().zip(witness_shapes) {
        input.witness.push([0u8; SCHNORR_SIGNATURE_SIZE]);
        input.witness.push(script.as_bytes());
        input.witness.push(control_block.serialize());
    }
    tx.vsize()
}
