use thiserror::Error;

use crate::crypto::Address;

pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(Error, Debug)]
pub enum ChannelError {
    // Input validation
    #[error("deposit {amount} outside allowed range [{min}, {max}]")]
    DepositOutOfRange { amount: u64, min: u64, max: u64 },

    #[error("bet size {0} does not normalize to 1-5 lines at any scale")]
    InvalidBetSize(u64),

    #[error("malformed commitment: {0}")]
    MalformedCommitment(String),

    // Protocol violations
    #[error("invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },

    #[error("balance mismatch: {0}")]
    BalanceMismatch(String),

    #[error("broken hash chain: {0}")]
    BrokenHashChain(String),

    #[error("reel hash does not open to the revealed seed and reel")]
    InvalidReelOpening,

    #[error("invalid reel: {0}")]
    InvalidReel(String),

    #[error("finalize requires a matched player/house spin pair")]
    IncompletePair,

    #[error("a proposal is already pending for this round")]
    ProposalPending,

    #[error("no proposal is pending for this round")]
    NoProposalPending,

    // Authorization
    #[error("signature does not recover the expected signer")]
    BadSignature,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("address {0} is not eligible to play")]
    NotEligible(Address),

    // State violations
    #[error("unknown channel: {0}")]
    UnknownChannel(u64),

    #[error("channel is not ready")]
    ChannelNotReady,

    #[error("channel is already funded")]
    AlreadyFunded,

    #[error("channel is already activated")]
    AlreadyActivated,

    #[error("channel is not activated")]
    NotActivated,

    #[error("channel is already finalized")]
    AlreadyFinalized,

    #[error("channel is not finalized")]
    NotFinalized,

    #[error("finalize nonce {got} does not exceed the settled nonce {settled}")]
    StaleFinalize { settled: u64, got: u64 },

    #[error("dispute window is still open until {0}")]
    DisputeWindowOpen(chrono::DateTime<chrono::Utc>),

    #[error("balance already claimed")]
    AlreadyClaimed,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("channel balances are empty")]
    EmptyBalances,

    // Collaborators and passthrough
    #[error("insufficient pooled funds: need {need}, have {available}")]
    InsufficientFunds { need: u64, available: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cryptographic error: {0}")]
    Crypto(String),
}

impl ChannelError {
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn balance_mismatch(msg: impl Into<String>) -> Self {
        Self::BalanceMismatch(msg.into())
    }

    pub fn broken_chain(msg: impl Into<String>) -> Self {
        Self::BrokenHashChain(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedCommitment(msg.into())
    }
}
