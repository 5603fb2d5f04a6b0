//! UTXO box variants and the propositions guarding them.
//!
//! A box is the unit of spendable state. Its identifier is the content hash
//! of its canonical bytes prefixed with the variant tag; the nonce baked into
//! the content makes otherwise-identical outputs of one transaction distinct.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{hash256, public_key_from_bytes, signature_from_bytes, verify_signature};
use crate::errors::{ChainError, ChainResult};
use crate::types::{ByteReader, Height, WireSerializable};

pub const ASSET_BOX_TYPE: u8 = 1;
pub const COINBASE_BOX_TYPE: u8 = 2;
pub const PUBKEY_INFO_BOX_TYPE: u8 = 3;

const PUBLIC_KEY_PROPOSITION_TYPE: u8 = 1;
const ADDRESS_PROPOSITION_TYPE: u8 = 2;
const HEIGHT_PROPOSITION_TYPE: u8 = 3;

/// 33-byte box identifier: variant tag plus content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoxId {
    pub tag: u8,
    pub hash: [u8; 32],
}

impl BoxId {
    pub const SIZE: usize = 33;

    pub fn to_bytes(&self) -> [u8; 33] {
        let mut out = [0u8; 33];
        out[0] = self.tag;
        out[1..].copy_from_slice(&self.hash);
        out
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.tag);
        out.extend_from_slice(&self.hash);
    }

    pub fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let tag = reader.read_u8()?;
        let hash = reader.read_array::<32>()?;
        Ok(BoxId { tag, hash })
    }
}

impl fmt::Debug for BoxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoxId({}:{})", self.tag, hex::encode(&self.hash[..8]))
    }
}

/// Asset discriminator; the intrinsic coin uses the all-ones id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct TokenId(pub [u8; 4]);

pub const INTRINSIC_TOKEN_ID: TokenId = TokenId([0xFF; 4]);

/// Spending condition attached to a box.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Proposition {
    /// Requires an Ed25519 signature from the named key.
    PublicKey([u8; 32]),
    /// Same condition addressed through the Base58 address form; the body
    /// carries the decoded public key.
    Address([u8; 32]),
    /// Open to anyone once the chain reaches the named height.
    Height(Height),
}

/// Everything a proposition may inspect while unlocking.
pub struct UnlockContext<'a> {
    pub tx_message: &'a [u8; 32],
    pub height: Height,
    pub last_block_timestamp: u64,
    pub state_root: [u8; 32],
}

impl Proposition {
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Proposition::PublicKey(key) => {
                out.push(PUBLIC_KEY_PROPOSITION_TYPE);
                out.extend_from_slice(key);
            }
            Proposition::Address(key) => {
                out.push(ADDRESS_PROPOSITION_TYPE);
                out.extend_from_slice(key);
            }
            Proposition::Height(height) => {
                out.push(HEIGHT_PROPOSITION_TYPE);
                out.extend_from_slice(&height.to_le_bytes());
            }
        }
    }

    pub fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        match reader.read_u8()? {
            PUBLIC_KEY_PROPOSITION_TYPE => Ok(Proposition::PublicKey(reader.read_array::<32>()?)),
            ADDRESS_PROPOSITION_TYPE => Ok(Proposition::Address(reader.read_array::<32>()?)),
            HEIGHT_PROPOSITION_TYPE => Ok(Proposition::Height(reader.read_i32_le()?)),
            other => Err(ChainError::Malformed(format!(
                "unknown proposition type {other}"
            ))),
        }
    }

    /// Checks `proof` against this condition. Key-based propositions expect
    /// a 64-byte signature over the transaction message.
    pub fn unlock(&self, proof: &[u8], ctx: &UnlockContext<'_>) -> ChainResult<()> {
        match self {
            Proposition::PublicKey(key) | Proposition::Address(key) => {
                let public = public_key_from_bytes(key)?;
                let signature = signature_from_bytes(proof).map_err(|_| {
                    ChainError::SemanticInvalid("unlock proof is not a signature".into())
                })?;
                verify_signature(&public, ctx.tx_message, &signature)
                    .map_err(|_| ChainError::SemanticInvalid("unlock signature invalid".into()))
            }
            Proposition::Height(lock) => {
                if ctx.height >= *lock {
                    Ok(())
                } else {
                    Err(ChainError::SemanticInvalid(format!(
                        "height lock {lock} not reached at {}",
                        ctx.height
                    )))
                }
            }
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AssetBox {
    pub proposition: Proposition,
    pub nonce: u64,
    pub amount: u64,
    pub token_id: Option<TokenId>,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CoinbaseBox {
    pub nonce: u64,
    pub amount: u64,
    /// Spendable once the chain height reaches this value.
    pub height_lock: Height,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PubKeyInfoBox {
    pub proposition: Proposition,
    pub nonce: u64,
    pub pub_key: [u8; 32],
}

/// Tagged union of every box variant the chain can hold.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ChainBox {
    Asset(AssetBox),
    Coinbase(CoinbaseBox),
    PubKeyInfo(PubKeyInfoBox),
}

impl ChainBox {
    pub fn type_id(&self) -> u8 {
        match self {
            ChainBox::Asset(_) => ASSET_BOX_TYPE,
            ChainBox::Coinbase(_) => COINBASE_BOX_TYPE,
            ChainBox::PubKeyInfo(_) => PUBKEY_INFO_BOX_TYPE,
        }
    }

    pub fn id(&self) -> BoxId {
        BoxId {
            tag: self.type_id(),
            hash: hash256(&self.to_bytes()),
        }
    }

    /// Coins or tokens carried by this box; informational boxes carry none.
    pub fn monetary_value(&self) -> Option<(TokenId, u64)> {
        match self {
            ChainBox::Asset(b) => Some((b.token_id.unwrap_or(INTRINSIC_TOKEN_ID), b.amount)),
            ChainBox::Coinbase(b) => Some((INTRINSIC_TOKEN_ID, b.amount)),
            ChainBox::PubKeyInfo(_) => None,
        }
    }

    pub fn proposition(&self) -> Proposition {
        match self {
            ChainBox::Asset(b) => b.proposition.clone(),
            ChainBox::Coinbase(b) => Proposition::Height(b.height_lock),
            ChainBox::PubKeyInfo(b) => b.proposition.clone(),
        }
    }
}

impl WireSerializable for ChainBox {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.type_id());
        match self {
            ChainBox::Asset(b) => {
                b.proposition.write_to(out);
                out.extend_from_slice(&b.nonce.to_le_bytes());
                out.extend_from_slice(&b.amount.to_le_bytes());
                match b.token_id {
                    Some(token) => {
                        out.push(1);
                        out.extend_from_slice(&token.0);
                    }
                    None => out.push(0),
                }
            }
            ChainBox::Coinbase(b) => {
                out.extend_from_slice(&b.nonce.to_le_bytes());
                out.extend_from_slice(&b.amount.to_le_bytes());
                out.extend_from_slice(&b.height_lock.to_le_bytes());
            }
            ChainBox::PubKeyInfo(b) => {
                b.proposition.write_to(out);
                out.extend_from_slice(&b.nonce.to_le_bytes());
                out.extend_from_slice(&b.pub_key);
            }
        }
    }

    fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        match reader.read_u8()? {
            ASSET_BOX_TYPE => {
                let proposition = Proposition::read_from(reader)?;
                let nonce = reader.read_u64_le()?;
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
                Ok(ChainBox::Asset(AssetBox {
                    proposition,
                    nonce,
                    amount,
                    token_id,
                }))
            }
            COINBASE_BOX_TYPE => {
                let nonce = reader.read_u64_le()?;
                let amount = reader.read_u64_le()?;
                let height_lock = reader.read_i32_le()?;
                Ok(ChainBox::Coinbase(CoinbaseBox {
                    nonce,
                    amount,
                    height_lock,
                }))
            }
            PUBKEY_INFO_BOX_TYPE => {
                let proposition = Proposition::read_from(reader)?;
                let nonce = reader.read_u64_le()?;
                let pub_key = reader.read_array::<32>()?;
                Ok(ChainBox::PubKeyInfo(PubKeyInfoBox {
                    proposition,
                    nonce,
                    pub_key,
                }))
            }
            other => Err(ChainError::Malformed(format!("unknown box type {other}"))),
        }
    }
}
