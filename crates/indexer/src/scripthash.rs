//! Electrum scripthash derivation.
//!
//! Electrum keys address-indexed queries by the reversed single-SHA256 of the
//! output script. This client always queries for the key's P2WPKH script.

use bitcoin::{
    hashes::{sha256, Hash},
    secp256k1::PublicKey,
    CompressedPublicKey, ScriptBuf,
};

/// The P2WPKH scriptPubKey (`OP_0 <20-byte HASH160(pubkey)>`) for a
/// compressed public key.
pub fn p2wpkh_script(public_key: &PublicKey) -> ScriptBuf {
    let compressed = CompressedPublicKey(*public_key);
    ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash())
}

/// Derives the scripthash parameter for `blockchain.scripthash.*` methods:
/// single SHA256 of the P2WPKH scriptPubKey, byte-reversed, hex encoded.
pub fn electrum_scripthash(public_key: &PublicKey) -> String {
    let script = p2wpkh_script(public_key);
    let mut digest = sha256::Hash::hash(script.as_bytes()).to_byte_array();
    digest.reverse();
    hex::encode(digest)
}
