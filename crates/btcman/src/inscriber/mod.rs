//! The inscription engine: envelope construction, commit/reveal building,
//! signing, broadcast, and payload extraction.

pub(crate) mod builder;
pub mod envelope;

use bitcoin::{consensus, Address, OutPoint, ScriptBuf, Transaction, Txid};
use btcman_indexer::Indexer;
use tracing::{debug, info};

use crate::{error::InscriberError, keychain::Keychain};

pub const DEFAULT_COMMIT_FEE_RATE: u64 = 3;
pub const DEFAULT_REVEAL_FEE_RATE: u64 = 2;
pub const DEFAULT_REVEAL_OUT_VALUE: u64 = 546;

/// The only content type this client inscribes.
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// Hex encoding of [`OCTET_STREAM_CONTENT_TYPE`]; the decode path locates
/// the payload by this marker inside the reveal witness.
const CONTENT_TYPE_MARKER_HEX: &str = "6170706c69636174696f6e2f6f637465742d73747265616d";

/// One payload to inscribe.
#[derive(Debug, Clone)]
pub struct InscriptionData {
    pub content_type: String,
    pub body: Vec<u8>,
    pub destination: Address,
}

/// A full inscription request: which outpoints fund the commit, the fee
/// rates, and the payloads.
#[derive(Debug, Clone)]
pub struct InscriptionRequest {
    pub commit_outpoints: Vec<OutPoint>,
    /// Commit fee rate, sat/vB.
    pub commit_fee_rate: u64,
    /// Reveal fee rate, sat/vB.
    pub reveal_fee_rate: u64,
    pub data: Vec<InscriptionData>,
    /// Reveal every payload in one combined transaction instead of one
    /// reveal per payload.
    pub single_reveal_tx_only: bool,
}

/// Transaction ids produced by a successful inscription.
#[derive(Debug, Clone)]
pub struct InscriptionTxids {
    pub commit_txid: Txid,
    pub reveal_txids: Vec<Txid>,
}

/// Runs the two-phase protocol: build the commit, sign it with the wallet
/// key, broadcast it, then build, sign and broadcast the reveal(s).
///
/// `funding` carries the value of each outpoint in
/// `request.commit_outpoints`, in the same order.
pub(crate) async fn inscribe<I: Indexer>(
    keychain: &Keychain,
    indexer: &I,
    request: &InscriptionRequest,
    funding: &[(OutPoint, u64)],
    change_address: &Address,
) -> Result<InscriptionTxids, InscriberError> {
    let plan = builder::build_commit_transaction(
        request,
        funding,
        keychain.network(),
        change_address,
    )?;

    let mut commit_tx = plan.commit_tx.clone();
    keychain
        .sign_transaction(&mut commit_tx, indexer)
        .await
        .map_err(|e| InscriberError::Sign(e.to_string()))?;

    indexer
        .send_transaction(&commit_tx)
        .await
        .map_err(InscriberError::Broadcast)?;
    let commit_txid = commit_tx.compute_txid();
    debug!(%commit_txid, "broadcast commit transaction");

    // The commit is on the wire; reveals reference it by txid.
    let reveal_txs = if request.single_reveal_tx_only {
        vec![builder::build_single_reveal_transaction(
            &plan,
            request.reveal_fee_rate,
        )?]
    } else {
        builder::build_reveal_transactions(&plan, request.reveal_fee_rate)?
    };

    let mut reveal_txids = Vec::with_capacity(reveal_txs.len());
    for reveal_tx in &reveal_txs {
        indexer
            .send_transaction(reveal_tx)
            .await
            .map_err(InscriberError::Broadcast)?;
        reveal_txids.push(reveal_tx.compute_txid());
    }
    info!(%commit_txid, reveals = reveal_txids.len(), "inscription broadcast");

    Ok(InscriptionTxids {
        commit_txid,
        reveal_txids,
    })
}

/// Cuts the inscribed script fragment out of a reveal transaction's
/// witness: everything between the content-type marker and the trailing
/// `OP_ENDIF`.
pub fn extract_inscription_script(raw_tx_hex: &str) -> Result<Vec<u8>, InscriberError> {
    let bytes = hex::decode(raw_tx_hex)?;
    let tx: Transaction = consensus::deserialize(&bytes)?;

    let witness = tx
        .input
        .first()
        .map(|input| &input.witness)
        .filter(|witness| witness.len() >= 2)
        .ok_or(InscriberError::MissingInscriptionWitness)?;
    let envelope = witness
        .nth(1)
        .ok_or(InscriberError::MissingInscriptionWitness)?;

    let envelope_hex = hex::encode(envelope);
    let marker_index = envelope_hex
        .find(CONTENT_TYPE_MARKER_HEX)
        .ok_or(InscriberError::MarkerNotFound)?;
    let start = marker_index + CONTENT_TYPE_MARKER_HEX.len();
    let end = envelope_hex.len() - 2;
    if start > end {
        return Err(InscriberError::MarkerNotFound);
    }

    Ok(hex::decode(&envelope_hex[start..end])?)
}

/// Disassembles the inscribed fragment to script text with all whitespace
/// stripped. This is the reader-facing decode output.
pub fn decode_inscription_script(raw_tx_hex: &str) -> Result<String, InscriberError> {
    let fragment = extract_inscription_script(raw_tx_hex)?;
    let script = ScriptBuf::from_bytes(fragment);
    Ok(script.to_asm_string().split_whitespace().collect())
}

/// Returns the exact payload bytes inscribed in a reveal transaction.
pub fn extract_inscription_payload(raw_tx_hex: &str) -> Result<Vec<u8>, InscriberError> {
    let fragment = extract_inscription_script(raw_tx_hex)?;
    envelope::parse_envelope_payload(&ScriptBuf::from_bytes(fragment))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bitcoin::{
        absolute::LockTime, transaction::Version, Amount, CompressedPublicKey, Network, Sequence,
        TxIn, TxOut, Witness,
    };
    use btcman_indexer::{MockIndexer, TransactionInfo};
    use serde_json::json;

    use super::*;
    use crate::config::{Config, Mode};

    const WIF: &str = "cSaejkcWwU25jMweWEewRSsrVQq2FGTij1xjXv4x1XvxVRF1ZCr3";

    fn writer_keychain() -> Keychain {
        let config = Config {
            mode: "writer".to_string(),
            net: "regtest".to_string(),
            private_key: WIF.to_string(),
            indexer_host: "localhost".to_string(),
            indexer_port: "50001".to_string(),
            ..Config::default()
        };
        Keychain::new(&config, Mode::Writer, Network::Regtest).unwrap()
    }

    fn wallet_address(keychain: &Keychain) -> Address {
        Address::p2wpkh(
            &CompressedPublicKey(*keychain.public_key()),
            Network::Regtest,
        )
    }

    /// A confirmed transaction paying `value_sat` to the keychain's P2WPKH
    /// script, to serve as inscription funding.
    fn funding_tx(keychain: &Keychain, value_sat: u64) -> Transaction {
        Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(value_sat),
                script_pubkey: wallet_address(keychain).script_pubkey(),
            }],
        }
    }

    fn reveal_with_witness_element(element: Vec<u8>) -> String {
        let mut witness = Witness::new();
        witness.push([0u8; 64]);
        witness.push(element);
        let tx = Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness,
            }],
            output: vec![],
        };
        consensus::encode::serialize_hex(&tx)
    }

    #[test]
    fn test_extract_payload_after_marker() {
        // Fragment: content-type marker, then "hello", then OP_ENDIF.
        let mut element = hex::decode(CONTENT_TYPE_MARKER_HEX).unwrap();
        element.extend_from_slice(b"hello");
        element.push(0x68);
        let raw_tx_hex = reveal_with_witness_element(element);

        let extracted = extract_inscription_script(&raw_tx_hex).unwrap();
        assert_eq!(extracted, b"hello");
    }

    #[test]
    fn test_extract_fails_without_marker() {
        let raw_tx_hex = reveal_with_witness_element(vec![0xAA; 40]);
        let err = extract_inscription_script(&raw_tx_hex).unwrap_err();
        assert!(matches!(err, InscriberError::MarkerNotFound));
    }

    #[test]
    fn test_extract_fails_without_witness() {
        let tx = Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![],
        };
        let raw_tx_hex = consensus::encode::serialize_hex(&tx);
        let err = extract_inscription_script(&raw_tx_hex).unwrap_err();
        assert!(matches!(err, InscriberError::MissingInscriptionWitness));
    }

    #[test]
    fn test_decode_strips_whitespace() {
        let mut element = hex::decode(CONTENT_TYPE_MARKER_HEX).unwrap();
        // OP_0, then a 5-byte push of "hello", then OP_ENDIF.
        element.push(0x00);
        element.push(0x05);
        element.extend_from_slice(b"hello");
        element.push(0x68);
        let raw_tx_hex = reveal_with_witness_element(element);

        let decoded = decode_inscription_script(&raw_tx_hex).unwrap();
        assert!(!decoded.contains(' '));
        assert!(decoded.contains("68656c6c6f"));
    }

    /// Inscribe against a mocked indexer and decode the broadcast reveal:
    /// the payload must come back byte-identical.
    #[tokio::test]
    async fn test_inscribe_roundtrip() {
        let keychain = writer_keychain();
        let payload = b"da-proof-0042".to_vec();

        let funding_tx = funding_tx(&keychain, 100_000);
        let funding_txid = funding_tx.compute_txid();
        let funding_script_hex = hex::encode(funding_tx.output[0].script_pubkey.as_bytes());

        let mut indexer = MockIndexer::new();
        indexer
            .expect_get_transaction()
            .withf(move |txid, verbose| txid == funding_txid.to_string() && *verbose)
            .returning(move |_, _| {
                Ok(serde_json::from_value::<TransactionInfo>(json!({
                    "hex": "",
                    "vout": [
                        { "value": 0.001, "n": 0, "scriptPubKey": { "hex": funding_script_hex } },
                    ],
                }))
                .unwrap())
            });

        let broadcasts: Arc<Mutex<Vec<Transaction>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = broadcasts.clone();
        indexer
            .expect_send_transaction()
            .times(2)
            .returning(move |tx| {
                recorded.lock().unwrap().push(tx.clone());
                Ok(tx.compute_txid().to_string())
            });

        let request = InscriptionRequest {
            commit_outpoints: vec![OutPoint {
                txid: funding_txid,
                vout: 0,
            }],
            commit_fee_rate: DEFAULT_COMMIT_FEE_RATE,
            reveal_fee_rate: DEFAULT_REVEAL_FEE_RATE,
            data: vec![InscriptionData {
                content_type: OCTET_STREAM_CONTENT_TYPE.to_string(),
                body: payload.clone(),
                destination: wallet_address(&keychain),
            }],
            single_reveal_tx_only: true,
        };
        let funding = vec![(request.commit_outpoints[0], 100_000u64)];

        let txids = inscribe(
            &keychain,
            &indexer,
            &request,
            &funding,
            &wallet_address(&keychain),
        )
        .await
        .unwrap();

        let broadcasts = broadcasts.lock().unwrap();
        assert_eq!(broadcasts.len(), 2, "commit then reveal");

        // Commit first: pays a taproot commitment, signed with our key.
        let commit = &broadcasts[0];
        assert_eq!(commit.compute_txid(), txids.commit_txid);
        assert!(commit.output[0].script_pubkey.is_p2tr());
        assert_eq!(commit.input[0].witness.len(), 2);

        // Reveal second: spends the commitment and carries the payload.
        let reveal = &broadcasts[1];
        assert_eq!(reveal.compute_txid(), txids.reveal_txids[0]);
        assert_eq!(reveal.input[0].previous_output.txid, txids.commit_txid);

        let reveal_hex = consensus::encode::serialize_hex(reveal);
        assert_eq!(extract_inscription_payload(&reveal_hex).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_inscribe_surfaces_broadcast_rejection() {
        let keychain = writer_keychain();
        let funding_tx = funding_tx(&keychain, 100_000);
        let funding_txid = funding_tx.compute_txid();
        let funding_script_hex = hex::encode(funding_tx.output[0].script_pubkey.as_bytes());

        let mut indexer = MockIndexer::new();
        indexer.expect_get_transaction().returning(move |_, _| {
            Ok(serde_json::from_value::<TransactionInfo>(json!({
                "hex": "",
                "vout": [
                    { "value": 0.001, "n": 0, "scriptPubKey": { "hex": funding_script_hex } },
                ],
            }))
            .unwrap())
        });
        indexer.expect_send_transaction().returning(|_| {
            Err(btcman_indexer::IndexerError::Rpc {
                code: -26,
                message: "txn-mempool-conflict".to_string(),
            })
        });

        let request = InscriptionRequest {
            commit_outpoints: vec![OutPoint {
                txid: funding_txid,
                vout: 0,
            }],
            commit_fee_rate: DEFAULT_COMMIT_FEE_RATE,
            reveal_fee_rate: DEFAULT_REVEAL_FEE_RATE,
            data: vec![InscriptionData {
                content_type: OCTET_STREAM_CONTENT_TYPE.to_string(),
                body: b"payload".to_vec(),
                destination: wallet_address(&keychain),
            }],
            single_reveal_tx_only: true,
        };
        let funding = vec![(request.commit_outpoints[0], 100_000u64)];

        let err = inscribe(
            &keychain,
            &indexer,
            &request,
            &funding,
            &wallet_address(&keychain),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, InscriberError::Broadcast(_)));
    }
}
