// src/errors.rs

use ethers::types::Bytes;

use crate::types::conversions::ConversionError;

/// Failure of a single read call routed through the call channel.
///
/// `Clone` because one transport failure is delivered to every call of the
/// batch it hit, and revert failures are stored in the result cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("EVM call reverted: {reason}")]
    Reverted { reason: String, data: Bytes },

    #[error("eth_call to {function}() returned unexpected bytes: {data}")]
    Decode { function: String, data: Bytes },

    #[error("failed to encode call: {0}")]
    Encode(String),

    #[error("EVM dispatch call failed")]
    EmptyResult,

    #[error("expected dispatcher result to contain {expected} entries, got {actual}")]
    BatchLengthMismatch { expected: usize, actual: usize },

    #[error("call channel closed before the call was settled")]
    ChannelClosed,
}

impl CallError {
    pub fn is_revert(&self) -> bool {
        matches!(self, CallError::Reverted { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error("ABI error: {0}")]
    Abi(#[from] ethers::abi::Error),

    #[error("unknown contract function: {0}")]
    UnknownFunction(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

pub type SamplerResult<T> = Result<T, SamplerError>;
