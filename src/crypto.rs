use std::fs;
use std::path::Path;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

pub type Blake2b256 = Blake2b<U32>;

/// Network discriminator prepended to addresses.
pub const ADDRESS_NETWORK_BYTE: u8 = 0x11;
const ADDRESS_CHECKSUM_LEN: usize = 4;

/// Blake2b-256 of `data`; the content hash used for every identifier in the
/// chain.
pub fn hash256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn hash_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key: String,
    pub secret_key: String,
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

pub fn load_or_generate_keypair(path: &Path) -> ChainResult<Keypair> {
    if path.exists() {
        load_keypair(path)
    } else {
        let keypair = generate_keypair();
        save_keypair(path, &keypair)?;
        Ok(keypair)
    }
}

pub fn save_keypair(path: &Path, keypair: &Keypair) -> ChainResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(keypair.public.to_bytes()),
        secret_key: hex::encode(keypair.secret.to_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| ChainError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_keypair(path: &Path) -> ChainResult<Keypair> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| ChainError::Config(format!("failed to decode keypair: {err}")))?;
    let secret_bytes = hex::decode(stored.secret_key)
        .map_err(|err| ChainError::Config(format!("invalid secret key encoding: {err}")))?;
    let public_bytes = hex::decode(stored.public_key)
        .map_err(|err| ChainError::Config(format!("invalid public key encoding: {err}")))?;
    let secret = SecretKey::from_bytes(&secret_bytes)
        .map_err(|err| ChainError::Config(format!("invalid secret key bytes: {err}")))?;
    let public = PublicKey::from_bytes(&public_bytes)
        .map_err(|err| ChainError::Config(format!("invalid public key bytes: {err}")))?;
    Ok(Keypair { secret, public })
}

pub fn sign_message(keypair: &Keypair, message: &[u8]) -> Signature {
    keypair.sign(message)
}

pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> ChainResult<()> {
    public_key
        .verify(message, signature)
        .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
}

pub fn public_key_from_bytes(bytes: &[u8]) -> ChainResult<PublicKey> {
    PublicKey::from_bytes(bytes)
        .map_err(|err| ChainError::Crypto(format!("invalid public key bytes: {err}")))
}

pub fn signature_from_bytes(bytes: &[u8]) -> ChainResult<Signature> {
    Signature::from_bytes(bytes)
        .map_err(|err| ChainError::Crypto(format!("invalid signature bytes: {err}")))
}

/// Base58 over (network byte ‖ public key ‖ checksum).
pub fn encode_address(public_key: &[u8; 32]) -> String {
    let mut payload = Vec::with_capacity(1 + 32 + ADDRESS_CHECKSUM_LEN);
    payload.push(ADDRESS_NETWORK_BYTE);
    payload.extend_from_slice(public_key);
    let checksum = hash256(&payload);
    payload.extend_from_slice(&checksum[..ADDRESS_CHECKSUM_LEN]);
    bs58::encode(payload).into_string()
}

/// Inverse of [`encode_address`]; validates the network byte and checksum.
pub fn decode_address(address: &str) -> ChainResult<[u8; 32]> {
    let payload = bs58::decode(address)
        .into_vec()
        .map_err(|err| ChainError::Malformed(format!("invalid address encoding: {err}")))?;
    if payload.len() != 1 + 32 + ADDRESS_CHECKSUM_LEN {
        return Err(ChainError::Malformed("invalid address length".into()));
    }
    if payload[0] != ADDRESS_NETWORK_BYTE {
        return Err(ChainError::Malformed("unknown address network byte".into()));
    }
    let (body, checksum) = payload.split_at(1 + 32);
    let expected = hash256(body);
    if checksum != &expected[..ADDRESS_CHECKSUM_LEN] {
        return Err(ChainError::Malformed("address checksum mismatch".into()));
    }
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&body[1..]);
    Ok(public_key)
}

#[cfg(test)]
pub fn deterministic_keypair(seed: u8) -> Keypair {
    let secret = SecretKey::from_bytes(&[seed; 32]).expect("secret");
    let public = PublicKey::from(&secret);
    Keypair { secret, public }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_roundtrip() {
        let keypair = deterministic_keypair(3);
        let address = encode_address(&keypair.public.to_bytes());
        let decoded = decode_address(&address).unwrap();
        assert_eq!(decoded, keypair.public.to_bytes());
    }

    #[test]
    fn address_rejects_bad_checksum() {
        let keypair = deterministic_keypair(4);
        let mut address = encode_address(&keypair.public.to_bytes());
        address.pop();
        address.push('1');
        assert!(decode_address(&address).is_err());
    }

    #[test]
    fn signatures_verify() {
        let keypair = deterministic_keypair(5);
        let signature = sign_message(&keypair, b"payload");
        verify_signature(&keypair.public, b"payload", &signature).unwrap();
        assert!(verify_signature(&keypair.public, b"other", &signature).is_err());
    }
}
