//! reelchannel-core - Commit-reveal slot channel protocol
//!
//! This library implements a bilateral payment-channel slot game: both
//! parties commit to hash chains up front, play signed nonce-ordered rounds
//! off-ledger, and settle on-ledger from the latest matched record pair with
//! a dispute window for competing submissions.

pub mod accounting;
pub mod chain;
pub mod contract;
pub mod crypto;
pub mod error;
pub mod exchange;
pub mod payout;
pub mod reels;
pub mod spin;

pub use accounting::{HouseAccounting, SessionPools};
pub use chain::{HashChain, CHAIN_LENGTH};
pub use contract::{
    Channel, ChannelEvent, ChannelManager, Party, DISPUTE_WINDOW_SECS, MAX_DEPOSIT, MIN_DEPOSIT,
};
pub use crypto::{Address, Keypair, RecoverySig, SealedSecret};
pub use error::{ChannelError, Result};
pub use exchange::{FundingParams, HouseSession, PlayerSession};
pub use payout::{PAYTABLE, TOKEN};
pub use reels::ReelPlan;
pub use spin::Spin;
