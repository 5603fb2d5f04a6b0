//! Minimal miner wallet: a keypair on disk, an address, and transaction
//! signing. Candidate assembly pays this wallet's key.

use std::path::Path;

use ed25519_dalek::{Keypair, Signature};

use crate::crypto::{encode_address, load_or_generate_keypair, sign_message};
use crate::errors::ChainResult;
use crate::types::transaction::{Directive, Unlocker};
use crate::types::Transaction;

pub struct Wallet {
    keypair: Keypair,
}

impl Wallet {
    pub fn open(key_path: &Path) -> ChainResult<Self> {
        Ok(Wallet {
            keypair: load_or_generate_keypair(key_path)?,
        })
    }

    pub fn from_keypair(keypair: Keypair) -> Self {
        Wallet { keypair }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public.to_bytes()
    }

    pub fn address(&self) -> String {
        encode_address(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        sign_message(&self.keypair, message)
    }

    /// Builds and signs a transaction spending `unlockers` into `directives`.
    pub fn create_transaction(
        &self,
        fee: u64,
        timestamp: u64,
        unlockers: Vec<Unlocker>,
        directives: Vec<Directive>,
    ) -> Transaction {
        Transaction::new_signed(&self.keypair, fee, timestamp, unlockers, directives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{decode_address, deterministic_keypair};
    use crate::types::Proposition;

    #[test]
    fn address_matches_public_key() {
        let wallet = Wallet::from_keypair(deterministic_keypair(17));
        let decoded = decode_address(&wallet.address()).unwrap();
        assert_eq!(decoded, wallet.public_key());
    }

    #[test]
    fn created_transactions_are_semantically_valid() {
        let wallet = Wallet::from_keypair(deterministic_keypair(18));
        let tx = wallet.create_transaction(
            5,
            1_700_000_000_000,
            Vec::new(),
            vec![Directive::PubKeyInfo {
                proposition: Proposition::PublicKey(wallet.public_key()),
                pub_key: wallet.public_key(),
            }],
        );
        tx.semantic_validity(5).unwrap();
        assert_eq!(tx.author, wallet.public_key());
    }

    #[test]
    fn keys_persist_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miner.toml");
        let first = Wallet::open(&path).unwrap();
        let second = Wallet::open(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }
}
