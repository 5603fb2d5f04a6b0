use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    /// Parse or structural failure at ingress.
    #[error("malformed modifier: {0}")]
    Malformed(String),
    /// Signature, balance or duplicate-input failure; the modifier can never
    /// become valid.
    #[error("semantically invalid: {0}")]
    SemanticInvalid(String),
    /// Valid in shape but inconsistent with the current state (unknown input,
    /// digest or proof mismatch).
    #[error("state invalid: {0}")]
    StateInvalid(String),
    /// Cannot be applied yet (unknown parent, rollback outside the retained
    /// window). The caller may defer and retry once the prerequisite arrives.
    #[error("not applicable: {0}")]
    NotApplicable(String),
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    /// Invariant violation or store corruption. The process must stop; state
    /// is recovered from disk on restart.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ChainError {
    /// True for failures that reflect a bad modifier rather than a bad node.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ChainError::Malformed(_) | ChainError::SemanticInvalid(_) | ChainError::StateInvalid(_)
        )
    }

    /// Process exit code reported by the CLI.
    pub fn exit_code(&self) -> i32 {
        if self.is_validation() {
            2
        } else {
            1
        }
    }
}

pub type ChainResult<T> = Result<T, ChainError>;
