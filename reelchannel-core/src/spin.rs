//! The signed spin record exchanged off-ledger.
//!
//! Each round produces exactly two records: the player's proposal
//! (`turn == false`) and the house's response (`turn == true`). Both parties
//! retain both records; the latest matched pair is what settles the channel
//! on-ledger.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, Address, Keypair, RecoverySig};
use crate::error::{ChannelError, Result};
use crate::reels::reel_string;

/// One half of a round: a fully typed, exhaustively validated record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spin {
    /// Commitment to this round's reel (house side of the chain).
    pub reel_hash: String,
    /// Revealed reel stops; empty until the house's turn.
    pub reel: Vec<u8>,
    /// Seed-chain element for this round.
    pub reel_seed_hash: String,
    /// Predecessor of `reel_seed_hash`, proving chain continuity.
    pub prev_reel_seed_hash: String,
    /// Player hash-chain reveal for this round.
    pub user_hash: String,
    /// Predecessor of `user_hash`.
    pub prev_user_hash: String,
    /// Round counter, starting at 1.
    pub nonce: u64,
    /// `false` for the player's proposal, `true` for the house's response.
    pub turn: bool,
    /// Player balance entering (proposal) or leaving (response) the round.
    pub user_balance: u64,
    /// House balance entering (proposal) or leaving (response) the round.
    pub house_balance: u64,
    /// Bet size in micro-tokens.
    pub bet_size: u64,
    /// Recoverable signature over the tightly packed fields.
    pub sig: Option<RecoverySig>,
}

impl Spin {
    /// The degenerate record used to finalize a channel on which no round
    /// was ever played: nonce 0, empty commitments, deposit balances.
    pub fn unplayed(deposit: u64, turn: bool) -> Self {
        Spin {
            reel_hash: String::new(),
            reel: Vec::new(),
            reel_seed_hash: String::new(),
            prev_reel_seed_hash: String::new(),
            user_hash: String::new(),
            prev_user_hash: String::new(),
            nonce: 0,
            turn,
            user_balance: deposit,
            house_balance: deposit,
            bet_size: 0,
            sig: None,
        }
    }

    /// Deterministic concatenation of every field except the signature, in
    /// fixed order. This is the exact byte string that gets signed, so both
    /// parties can compare and verify records without a serialization
    /// framework in the loop.
    pub fn tightly_packed(&self) -> String {
        let reel = if self.reel.is_empty() {
            String::new()
        } else {
            reel_string(&self.reel)
        };
        format!(
            "{}{}{}{}{}{}{}{}{}{}{}",
            self.reel_hash,
            reel,
            self.reel_seed_hash,
            self.prev_reel_seed_hash,
            self.user_hash,
            self.prev_user_hash,
            self.nonce,
            self.turn,
            self.user_balance,
            self.house_balance,
            self.bet_size,
        )
    }

    /// Signs the record in place.
    pub fn sign(&mut self, keypair: &Keypair) {
        self.sig = Some(crypto::sign_message(&self.tightly_packed(), keypair));
    }

    /// Recovers the address that signed this record.
    pub fn recover_signer(&self) -> Result<Address> {
        let sig = self.sig.as_ref().ok_or(ChannelError::BadSignature)?;
        crypto::recover_signer(&self.tightly_packed(), sig)
    }

    /// Rejects the record unless its signature recovers `expected`.
    pub fn require_signed_by(&self, expected: Address) -> Result<()> {
        if self.recover_signer()? == expected {
            Ok(())
        } else {
            Err(ChannelError::BadSignature)
        }
    }
}
