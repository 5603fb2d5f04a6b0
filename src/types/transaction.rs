//! Transactions: ordered unlockers spending existing boxes and ordered
//! directives creating new ones, authorized by the author's signature over
//! the canonical digest.

use std::collections::HashSet;

use ed25519_dalek::{Keypair, Signature};
use serde::{Deserialize, Serialize};

use crate::crypto::{hash256, public_key_from_bytes, sign_message, verify_signature};
use crate::errors::{ChainError, ChainResult};
use crate::types::boxes::{
    AssetBox, BoxId, ChainBox, CoinbaseBox, Proposition, PubKeyInfoBox, TokenId,
};
use crate::types::{ByteReader, Height, ModifierId, WireSerializable, write_varint};

pub const TRANSACTION_TYPE_ID: u8 = 1;

const TRANSFER_DIRECTIVE_TYPE: u8 = 1;
const COINBASE_DIRECTIVE_TYPE: u8 = 2;
const PUBKEY_INFO_DIRECTIVE_TYPE: u8 = 3;

/// Reference to a box being spent, with an optional dedicated proof. When
/// the proof is absent the transaction signature doubles as the proof.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Unlocker {
    pub box_id: BoxId,
    pub proof: Option<Vec<u8>>,
}

/// Output-creating instruction.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Directive {
    Transfer {
        proposition: Proposition,
        amount: u64,
        token_id: Option<TokenId>,
    },
    Coinbase {
        amount: u64,
        /// Height of the block this coinbase belongs to.
        height: Height,
    },
    PubKeyInfo {
        proposition: Proposition,
        pub_key: [u8; 32],
    },
}

impl Directive {
    pub fn is_coinbase(&self) -> bool {
        matches!(self, Directive::Coinbase { .. })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Directive::Transfer {
                proposition,
                amount,
                token_id,
            } => {
                out.push(TRANSFER_DIRECTIVE_TYPE);
                proposition.write_to(out);
                out.extend_from_slice(&amount.to_le_bytes());
                match token_id {
                    Some(token) => {
                        out.push(1);
                        out.extend_from_slice(&token.0);
                    }
                    None => out.push(0),
                }
            }
            Directive::Coinbase { amount, height } => {
                out.push(COINBASE_DIRECTIVE_TYPE);
                out.extend_from_slice(&amount.to_le_bytes());
                out.extend_from_slice(&height.to_le_bytes());
            }
            Directive::PubKeyInfo {
                proposition,
                pub_key,
            } => {
                out.push(PUBKEY_INFO_DIRECTIVE_TYPE);
                proposition.write_to(out);
                out.extend_from_slice(pub_key);
            }
        }
    }

    fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        match reader.read_u8()? {
            TRANSFER_DIRECTIVE_TYPE => {
                let proposition = Proposition::read_from(reader)?;
                let amount = reader.read_u64_le()?;
                let token_id = match reader.read_u8()? {
                    0 => None,
                    1 => Some(TokenId(reader.read_array::<4>()?)),
                    other => {
                        return Err(ChainError::Malformed(format!(
                            "invalid token flag {other}"
                        )))
                    }
                };
                Ok(Directive::Transfer {
                    proposition,
                    amount,
                    token_id,
                })
            }
            COINBASE_DIRECTIVE_TYPE => Ok(Directive::Coinbase {
                amount: reader.read_u64_le()?,
                height: reader.read_i32_le()?,
            }),
            PUBKEY_INFO_DIRECTIVE_TYPE => {
                let proposition = Proposition::read_from(reader)?;
                let pub_key = reader.read_array::<32>()?;
                Ok(Directive::PubKeyInfo {
                    proposition,
                    pub_key,
                })
            }
            other => Err(ChainError::Malformed(format!(
                "unknown directive type {other}"
            ))),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct Transaction {
    /// Public key of the author; the transaction-level proposition.
    pub author: [u8; 32],
    pub fee: u64,
    pub timestamp: u64,
    pub signature: Signature,
    pub unlockers: Vec<Unlocker>,
    pub directives: Vec<Directive>,
}

impl Transaction {
    pub fn new_signed(
        keypair: &Keypair,
        fee: u64,
        timestamp: u64,
        unlockers: Vec<Unlocker>,
        directives: Vec<Directive>,
    ) -> Self {
        let author = keypair.public.to_bytes();
        let message = Self::message_for(&author, fee, timestamp, &unlockers, &directives);
        let signature = sign_message(keypair, &message);
        Transaction {
            author,
            fee,
            timestamp,
            signature,
            unlockers,
            directives,
        }
    }

    pub fn id(&self) -> ModifierId {
        ModifierId(hash256(&self.to_bytes()))
    }

    /// Canonical digest the signature covers: everything but the signature.
    pub fn message(&self) -> [u8; 32] {
        Self::message_for(
            &self.author,
            self.fee,
            self.timestamp,
            &self.unlockers,
            &self.directives,
        )
    }

    fn message_for(
        author: &[u8; 32],
        fee: u64,
        timestamp: u64,
        unlockers: &[Unlocker],
        directives: &[Directive],
    ) -> [u8; 32] {
        let mut out = Vec::new();
        Self::write_body(&mut out, author, fee, timestamp, None, unlockers, directives);
        hash256(&out)
    }

    fn write_body(
        out: &mut Vec<u8>,
        author: &[u8; 32],
        fee: u64,
        timestamp: u64,
        signature: Option<&Signature>,
        unlockers: &[Unlocker],
        directives: &[Directive],
    ) {
        out.push(TRANSACTION_TYPE_ID);
        out.extend_from_slice(author);
        out.extend_from_slice(&fee.to_le_bytes());
        out.extend_from_slice(&timestamp.to_le_bytes());
        if let Some(signature) = signature {
            out.extend_from_slice(&signature.to_bytes());
        }
        write_varint(out, unlockers.len() as u64);
        for unlocker in unlockers {
            unlocker.box_id.write_to(out);
            match &unlocker.proof {
                Some(proof) => {
                    write_varint(out, proof.len() as u64 + 1);
                    out.extend_from_slice(proof);
                }
                None => write_varint(out, 0),
            }
        }
        write_varint(out, directives.len() as u64);
        for directive in directives {
            directive.write_to(out);
        }
    }

    pub fn size(&self) -> usize {
        self.to_bytes().len()
    }

    /// Exactly one coinbase directive and no inputs.
    pub fn is_coinbase(&self) -> bool {
        self.unlockers.is_empty()
            && self.directives.len() == 1
            && self.directives[0].is_coinbase()
    }

    pub fn has_coinbase_directive(&self) -> bool {
        self.directives.iter().any(Directive::is_coinbase)
    }

    pub fn input_ids(&self) -> impl Iterator<Item = &BoxId> {
        self.unlockers.iter().map(|u| &u.box_id)
    }

    /// Boxes this transaction creates, in directive order. The nonce of each
    /// output mixes the transaction id with the output position.
    pub fn outputs(&self, coinbase_maturity: u32) -> Vec<ChainBox> {
        let id = self.id();
        self.directives
            .iter()
            .enumerate()
            .map(|(index, directive)| {
                let nonce = output_nonce(&id, index as u32);
                match directive {
                    Directive::Transfer {
                        proposition,
                        amount,
                        token_id,
                    } => ChainBox::Asset(AssetBox {
                        proposition: proposition.clone(),
                        nonce,
                        amount: *amount,
                        token_id: *token_id,
                    }),
                    Directive::Coinbase { amount, height } => ChainBox::Coinbase(CoinbaseBox {
                        nonce,
                        amount: *amount,
                        height_lock: height.saturating_add(coinbase_maturity as Height),
                    }),
                    Directive::PubKeyInfo {
                        proposition,
                        pub_key,
                    } => ChainBox::PubKeyInfo(PubKeyInfoBox {
                        proposition: proposition.clone(),
                        nonce,
                        pub_key: *pub_key,
                    }),
                }
            })
            .collect()
    }

    /// Structural checks plus the author signature; no state access.
    pub fn semantic_validity(&self, min_fee: u64) -> ChainResult<()> {
        if self.directives.is_empty() {
            return Err(ChainError::SemanticInvalid("transaction has no outputs".into()));
        }
        if self.directives.iter().filter(|d| d.is_coinbase()).count() > 1 {
            return Err(ChainError::SemanticInvalid(
                "multiple coinbase directives".into(),
            ));
        }
        let mut seen = HashSet::new();
        for unlocker in &self.unlockers {
            if !seen.insert(unlocker.box_id) {
                return Err(ChainError::SemanticInvalid("duplicate input box".into()));
            }
        }
        if !self.has_coinbase_directive() && self.fee < min_fee {
            return Err(ChainError::SemanticInvalid(format!(
                "fee {} below minimum {min_fee}",
                self.fee
            )));
        }
        let public = public_key_from_bytes(&self.author)
            .map_err(|_| ChainError::SemanticInvalid("invalid author key".into()))?;
        verify_signature(&public, &self.message(), &self.signature)
            .map_err(|_| ChainError::SemanticInvalid("author signature invalid".into()))
    }
}

impl WireSerializable for Transaction {
    fn write_to(&self, out: &mut Vec<u8>) {
        Self::write_body(
            out,
            &self.author,
            self.fee,
            self.timestamp,
            Some(&self.signature),
            &self.unlockers,
            &self.directives,
        );
    }

    fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let type_id = reader.read_u8()?;
        if type_id != TRANSACTION_TYPE_ID {
            return Err(ChainError::Malformed(format!(
                "unknown transaction type {type_id}"
            )));
        }
        let author = reader.read_array::<32>()?;
        let fee = reader.read_u64_le()?;
        let timestamp = reader.read_u64_le()?;
        let signature_bytes = reader.read_array::<64>()?;
        let signature = Signature::from_bytes(&signature_bytes)
            .map_err(|err| ChainError::Malformed(format!("invalid signature: {err}")))?;
        let unlocker_count = reader.read_varint()? as usize;
        let mut unlockers = Vec::with_capacity(unlocker_count.min(1024));
        for _ in 0..unlocker_count {
            let box_id = BoxId::read_from(reader)?;
            let proof_len = reader.read_varint()? as usize;
            let proof = if proof_len == 0 {
                None
            } else {
                Some(reader.read_bytes(proof_len - 1)?)
            };
            unlockers.push(Unlocker { box_id, proof });
        }
        let directive_count = reader.read_varint()? as usize;
        let mut directives = Vec::with_capacity(directive_count.min(1024));
        for _ in 0..directive_count {
            directives.push(Directive::read_from(reader)?);
        }
        Ok(Transaction {
            author,
            fee,
            timestamp,
            signature,
            unlockers,
            directives,
        })
    }
}

fn output_nonce(tx_id: &ModifierId, index: u32) -> u64 {
    let digest = hash256(&[tx_id.as_bytes().as_slice(), &index.to_le_bytes()].concat());
    u64::from_le_bytes(digest[..8].try_into().expect("sized slice"))
}
