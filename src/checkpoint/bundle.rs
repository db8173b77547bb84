//! Signed data items and the CU wallet.
//!
//! A checkpoint travels as a signed data item: the memory image as payload
//! plus the descriptor tags. The signature covers the payload digest and
//! the canonical tag encoding, so a verifier can reject both payload and
//! descriptor tampering with one check.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::Tag;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum BundleError {
    #[error("wallet file unreadable: {0}")]
    #[diagnostic(
        code(cueval::checkpoint::wallet_io),
        help("Check the WALLET path and permissions.")
    )]
    Io(#[from] std::io::Error),

    #[error("wallet key rejected")]
    #[diagnostic(
        code(cueval::checkpoint::wallet_key),
        help("The wallet must contain an Ed25519 key in PKCS#8 form, raw or base64.")
    )]
    BadKey,
}

/// Deterministic content digest of a memory image, hex encoded.
///
/// Stamped on every checkpoint as its `SHA-256` tag and re-checked on
/// download before a remote checkpoint is trusted.
pub fn hash_memory(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// The CU signing identity.
pub struct Wallet {
    keypair: Ed25519KeyPair,
    address: String,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet").field("address", &self.address).finish()
    }
}

impl Wallet {
    /// Load an Ed25519 key from a PKCS#8 file (raw DER or base64 of it).
    pub fn load(path: &Path) -> Result<Self, BundleError> {
        let raw = std::fs::read(path)?;
        let keypair = Ed25519KeyPair::from_pkcs8(&raw)
            .or_else(|_| {
                let text: Vec<u8> = raw
                    .iter()
                    .copied()
                    .filter(|b| !b.is_ascii_whitespace())
                    .collect();
                let der = BASE64.decode(&text).map_err(|_| BundleError::BadKey)?;
                Ed25519KeyPair::from_pkcs8(&der).map_err(|_| BundleError::BadKey)
            })
            .map_err(|_| BundleError::BadKey)?;
        let address = hex::encode(Sha256::digest(keypair.public_key().as_ref()));
        Ok(Self { keypair, address })
    }

    /// Stable address derived from the public key; reported by healthcheck.
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// A data item ready for the bundler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignedDataItem {
    /// Base64 payload.
    pub data: String,
    /// Hex public key of the signer.
    pub owner: String,
    /// Hex Ed25519 signature over the signing message.
    pub signature: String,
    pub tags: Vec<Tag>,
}

/// Payload digest plus length-prefixed tags; what the signature covers.
fn signing_message(payload: &[u8], tags: &[Tag]) -> Vec<u8> {
    let mut msg = Sha256::digest(payload).to_vec();
    for tag in tags {
        msg.extend_from_slice(&(tag.name.len() as u64).to_be_bytes());
        msg.extend_from_slice(tag.name.as_bytes());
        msg.extend_from_slice(&(tag.value.len() as u64).to_be_bytes());
        msg.extend_from_slice(tag.value.as_bytes());
    }
    msg
}

/// Assemble and sign a checkpoint data item.
pub fn build_and_sign_data_item(
    payload: &Bytes,
    tags: Vec<Tag>,
    wallet: &Wallet,
) -> SignedDataItem {
    let signature = wallet.keypair.sign(&signing_message(payload, &tags));
    SignedDataItem {
        data: BASE64.encode(payload),
        owner: hex::encode(wallet.keypair.public_key().as_ref()),
        signature: hex::encode(signature.as_ref()),
        tags,
    }
}

/// Verify a data item against its embedded owner key.
pub fn verify_data_item(item: &SignedDataItem) -> bool {
    let Ok(payload) = BASE64.decode(&item.data) else {
        return false;
    };
    let (Ok(owner), Ok(signature)) = (hex::decode(&item.owner), hex::decode(&item.signature))
    else {
        return false;
    };
    let key = ring::signature::UnparsedPublicKey::new(&ring::signature::ED25519, owner);
    key.verify(&signing_message(&payload, &item.tags), &signature)
        .is_ok()
}
