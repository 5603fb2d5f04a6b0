//! Block headers and the proof-of-work arithmetic hanging off them.

use ed25519_dalek::Signature;
use primitive_types::{U256, U512};

use crate::crypto::{hash256, public_key_from_bytes, verify_signature};
use crate::errors::{ChainError, ChainResult};
use crate::types::{AdDigest, ByteReader, Height, ModifierId, WireSerializable};

pub const HEADER_VERSION: u8 = 1;

#[derive(Clone, PartialEq, Debug)]
pub struct BlockHeader {
    pub version: u8,
    pub parent_id: ModifierId,
    pub ad_proofs_root: [u8; 32],
    pub transactions_root: [u8; 32],
    /// Dictionary digest after applying this block's payload.
    pub state_root: AdDigest,
    pub timestamp: u64,
    pub height: Height,
    /// PoW target; the header is valid when its PoW hash is at most this.
    pub difficulty: U256,
    pub nonce: u64,
    pub miner_pub_key: [u8; 32],
    pub signature: Signature,
}

impl BlockHeader {
    pub fn id(&self) -> ModifierId {
        ModifierId(hash256(&self.to_bytes()))
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_id.is_zero() && self.height == 0
    }

    /// Canonical encoding minus nonce and signature; the part the miner
    /// signature covers and the PoW search iterates over.
    fn write_pre_pow(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.extend_from_slice(self.parent_id.as_bytes());
        out.extend_from_slice(&self.ad_proofs_root);
        out.extend_from_slice(&self.transactions_root);
        out.extend_from_slice(&self.state_root.to_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        let mut difficulty = [0u8; 32];
        self.difficulty.to_big_endian(&mut difficulty);
        out.extend_from_slice(&difficulty);
    }

    /// Digest signed by the miner.
    pub fn message(&self) -> [u8; 32] {
        let mut out = Vec::new();
        self.write_pre_pow(&mut out);
        out.extend_from_slice(&self.miner_pub_key);
        hash256(&out)
    }

    pub fn pow_hash(message: &[u8; 32], nonce: u64) -> U256 {
        let digest = hash256(&[message.as_slice(), &nonce.to_le_bytes()].concat());
        U256::from_big_endian(&digest)
    }

    pub fn pow_valid(&self) -> bool {
        Self::pow_hash(&self.message(), self.nonce) <= self.difficulty
    }

    /// Expected hashes to find this header: 2^256 / (target + 1).
    pub fn work(&self) -> U256 {
        work_from_target(self.difficulty)
    }

    pub fn verify_signature(&self) -> ChainResult<()> {
        let public = public_key_from_bytes(&self.miner_pub_key)?;
        verify_signature(&public, &self.message(), &self.signature)
            .map_err(|_| ChainError::SemanticInvalid("miner signature invalid".into()))
    }

    /// Context-free checks: version, field sanity, PoW, signature.
    pub fn syntactic_validity(&self) -> ChainResult<()> {
        if self.version != HEADER_VERSION {
            return Err(ChainError::Malformed(format!(
                "unsupported header version {}",
                self.version
            )));
        }
        if self.height < 0 {
            return Err(ChainError::Malformed("negative height".into()));
        }
        if self.is_genesis() != (self.height == 0 && self.parent_id.is_zero()) {
            return Err(ChainError::Malformed("inconsistent genesis marker".into()));
        }
        if self.difficulty.is_zero() {
            return Err(ChainError::Malformed("zero difficulty target".into()));
        }
        self.verify_signature()?;
        if !self.pow_valid() {
            return Err(ChainError::SemanticInvalid("pow hash above target".into()));
        }
        Ok(())
    }
}

impl WireSerializable for BlockHeader {
    fn write_to(&self, out: &mut Vec<u8>) {
        self.write_pre_pow(out);
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out.extend_from_slice(&self.miner_pub_key);
        out.extend_from_slice(&self.signature.to_bytes());
    }

    fn read_from(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        let version = reader.read_u8()?;
        let parent_id = ModifierId(reader.read_array::<32>()?);
        let ad_proofs_root = reader.read_array::<32>()?;
        let transactions_root = reader.read_array::<32>()?;
        let state_root = AdDigest::from_bytes(&reader.read_bytes(AdDigest::SIZE)?)?;
        let timestamp = reader.read_u64_le()?;
        let height = reader.read_i32_le()?;
        let difficulty = U256::from_big_endian(&reader.read_array::<32>()?);
        let nonce = reader.read_u64_le()?;
        let miner_pub_key = reader.read_array::<32>()?;
        let signature_bytes = reader.read_array::<64>()?;
        let signature = Signature::from_bytes(&signature_bytes)
            .map_err(|err| ChainError::Malformed(format!("invalid header signature: {err}")))?;
        Ok(BlockHeader {
            version,
            parent_id,
            ad_proofs_root,
            transactions_root,
            state_root,
            timestamp,
            height,
            difficulty,
            nonce,
            miner_pub_key,
            signature,
        })
    }
}

/// Expected hash count for a target, saturating at the top of the range.
pub fn work_from_target(target: U256) -> U256 {
    if target.is_zero() {
        return U256::MAX;
    }
    let numerator = U512::one() << 256;
    let denominator = U512::from(target) + U512::one();
    U256::try_from(numerator / denominator).unwrap_or(U256::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{deterministic_keypair, sign_message};

    pub(crate) fn sample_header(difficulty: U256) -> BlockHeader {
        let keypair = deterministic_keypair(21);
        let mut header = BlockHeader {
            version: HEADER_VERSION,
            parent_id: ModifierId::zero(),
            ad_proofs_root: [1u8; 32],
            transactions_root: [2u8; 32],
            state_root: AdDigest::empty(),
            timestamp: 1_700_000_000_000,
            height: 0,
            difficulty,
            nonce: 0,
            miner_pub_key: keypair.public.to_bytes(),
            signature: sign_message(&keypair, b"placeholder"),
        };
        header.signature = sign_message(&keypair, &header.message());
        header
    }

    #[test]
    fn wire_roundtrip() {
        let header = sample_header(U256::MAX >> 4);
        let decoded = BlockHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.id(), header.id());
    }

    #[test]
    fn message_ignores_nonce() {
        let header = sample_header(U256::MAX >> 4);
        let mut other = header.clone();
        other.nonce = 99;
        assert_eq!(header.message(), other.message());
        assert_ne!(header.id(), other.id());
    }

    #[test]
    fn trivial_target_accepts_any_nonce() {
        let header = sample_header(U256::MAX);
        assert!(header.pow_valid());
        header.syntactic_validity().unwrap();
    }

    #[test]
    fn work_grows_as_target_shrinks() {
        let easy = work_from_target(U256::MAX);
        let hard = work_from_target(U256::MAX >> 16);
        assert!(hard > easy);
        assert_eq!(work_from_target(U256::MAX), U256::one());
    }
}
