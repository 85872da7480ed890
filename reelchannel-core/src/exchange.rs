//! The bilateral, nonce-ordered off-ledger spin exchange.
//!
//! The player proposes a signed spin; the house validates it, applies the
//! payout and answers with its own signed record. Both sides retain every
//! record of every round, so either party can unilaterally drive the channel
//! to settlement with the latest matched pair even if the counterparty goes
//! silent.
//!
//! Every rejection is synchronous and leaves no partial state behind; a
//! rejected proposal is simply resubmitted corrected.

use tracing::{debug, info};

use crate::chain::{verify_link, HashChain, CHAIN_LENGTH};
use crate::crypto::{self, Address, Keypair, SealedSecret};
use crate::error::{ChannelError, Result};
use crate::payout::{adjusted_bet_size, apply_round, reel_payout};
use crate::reels::{reel_string, ReelPlan};
use crate::spin::Spin;

/// Commitment material the player publishes when funding the channel.
#[derive(Debug, Clone)]
pub struct FundingParams {
    /// The player's secret number, sealed so only the player can reopen it.
    pub sealed_number: SealedSecret,
    /// Last element of the player's hash chain.
    pub final_user_hash: String,
}

/// The player's half of the exchange.
///
/// Owns the secret number and its hash chain, produces signed proposals and
/// validates house responses before accepting them into the transcript.
#[derive(Debug)]
pub struct PlayerSession {
    channel_id: u64,
    keypair: Keypair,
    deposit: u64,
    user_chain: HashChain,
    funding: FundingParams,
    house_address: Option<Address>,
    final_seed_hash: Option<String>,
    final_reel_hash: Option<String>,
    pending: Option<Spin>,
    my_spins: Vec<Spin>,
    house_spins: Vec<Spin>,
}

impl PlayerSession {
    /// Creates a session with a fresh secret number and derives the funding
    /// commitment from it. The secret is sealed under a key only the player
    /// can rebuild (it is derived from a signature over the channel id).
    pub fn new(channel_id: u64, keypair: Keypair, deposit: u64) -> Result<Self> {
        let secret = crypto::random_secret();
        let user_chain = HashChain::generate(&secret);

        let channel_tag = crypto::sha256_hex(&channel_id.to_string());
        let passphrase = crypto::sign_message(&channel_tag, &keypair).compact;
        let sealed_number = crypto::seal_secret(&secret, &passphrase)?;

        let funding = FundingParams {
            sealed_number,
            final_user_hash: user_chain.commitment().to_string(),
        };

        Ok(PlayerSession {
            channel_id,
            keypair,
            deposit,
            user_chain,
            funding,
            house_address: None,
            final_seed_hash: None,
            final_reel_hash: None,
            pending: None,
            my_spins: Vec::new(),
            house_spins: Vec::new(),
        })
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn address(&self) -> Address {
        self.keypair.address()
    }

    pub fn funding_params(&self) -> &FundingParams {
        &self.funding
    }

    /// Records the house commitments published at activation.
    pub fn observe_activation(
        &mut self,
        house_address: Address,
        final_seed_hash: &str,
        final_reel_hash: &str,
    ) -> Result<()> {
        if !crypto::is_hex_digest(final_seed_hash) || !crypto::is_hex_digest(final_reel_hash) {
            return Err(ChannelError::malformed("house commitment is not a digest"));
        }
        self.house_address = Some(house_address);
        self.final_seed_hash = Some(final_seed_hash.to_string());
        self.final_reel_hash = Some(final_reel_hash.to_string());
        Ok(())
    }

    /// Nonce the next proposal will carry.
    pub fn next_nonce(&self) -> u64 {
        self.house_spins.len() as u64 + 1
    }

    /// Builds and signs the next proposal. The proposal echoes the last
    /// house record's commitments and balances (or the published
    /// commitments and the deposit pair for the first round) and reveals
    /// the next element of the player's hash chain.
    pub fn propose_spin(&mut self, bet_size: u64) -> Result<Spin> {
        if self.pending.is_some() {
            return Err(ChannelError::ProposalPending);
        }
        let final_seed_hash = self
            .final_seed_hash
            .clone()
            .ok_or(ChannelError::NotActivated)?;
        let final_reel_hash = self
            .final_reel_hash
            .clone()
            .ok_or(ChannelError::NotActivated)?;
        adjusted_bet_size(bet_size).ok_or(ChannelError::InvalidBetSize(bet_size))?;

        // The chain's last element is the published commitment, so round
        // CHAIN_LENGTH - 1 is the last one with a predecessor left to
        // disclose.
        let nonce = self.next_nonce();
        if nonce as usize >= CHAIN_LENGTH {
            return Err(ChannelError::InvalidNonce {
                expected: CHAIN_LENGTH as u64 - 1,
                got: nonce,
            });
        }

        let last = self.house_spins.last();
        let (reel_hash, reel_seed_hash, prev_reel_seed_hash) = match last {
            None => (final_reel_hash, final_seed_hash, String::new()),
            Some(h) => (
                h.reel_hash.clone(),
                h.reel_seed_hash.clone(),
                h.prev_reel_seed_hash.clone(),
            ),
        };
        let (user_balance, house_balance) = match last {
            None => (self.deposit, self.deposit),
            Some(h) => (h.user_balance, h.house_balance),
        };

        let user_hash = self
            .user_chain
            .reveal_at(nonce)
            .ok_or(ChannelError::broken_chain("user chain exhausted"))?
            .to_string();
        let prev_user_hash = self
            .user_chain
            .prev_at(nonce)
            .ok_or(ChannelError::broken_chain("user chain exhausted"))?
            .to_string();

        let mut spin = Spin {
            reel_hash,
            reel: Vec::new(),
            reel_seed_hash,
            prev_reel_seed_hash,
            user_hash,
            prev_user_hash,
            nonce,
            turn: false,
            user_balance,
            house_balance,
            bet_size,
            sig: None,
        };
        spin.sign(&self.keypair);

        debug!(
            channel = self.channel_id,
            nonce, bet_size, "player proposed spin"
        );
        self.pending = Some(spin.clone());
        Ok(spin)
    }

    /// Validates a house response against the pending proposal and, if it
    /// holds up, accepts the round into the transcript.
    pub fn apply_house_spin(&mut self, house_spin: Spin) -> Result<()> {
        let pending = self
            .pending
            .as_ref()
            .ok_or(ChannelError::NoProposalPending)?;
        let house_address = self.house_address.ok_or(ChannelError::NotActivated)?;

        if !house_spin.turn {
            return Err(ChannelError::unauthorized("response must carry turn=true"));
        }
        if house_spin.nonce != pending.nonce {
            return Err(ChannelError::InvalidNonce {
                expected: pending.nonce,
                got: house_spin.nonce,
            });
        }
        if house_spin.bet_size != pending.bet_size {
            return Err(ChannelError::balance_mismatch("response altered bet size"));
        }
        house_spin.require_signed_by(house_address)?;

        // The response must echo the player's reveal untouched.
        if house_spin.user_hash != pending.user_hash
            || house_spin.prev_user_hash != pending.prev_user_hash
        {
            return Err(ChannelError::broken_chain("response altered user reveal"));
        }

        // Reel chain continuity: round 1 must open the published
        // commitments; later rounds must hash back to the previous reveal.
        if house_spin.nonce == 1 {
            if Some(&house_spin.reel_seed_hash) != self.final_seed_hash.as_ref() {
                return Err(ChannelError::broken_chain("seed reveal != commitment"));
            }
            if Some(&house_spin.reel_hash) != self.final_reel_hash.as_ref() {
                return Err(ChannelError::broken_chain("reel hash != commitment"));
            }
        } else {
            let last = self.house_spins.last().expect("nonce > 1 implies history");
            if !verify_link(&house_spin.reel_seed_hash, &last.reel_seed_hash) {
                return Err(ChannelError::broken_chain("seed chain discontinuity"));
            }
        }
        if !verify_link(&house_spin.prev_reel_seed_hash, &house_spin.reel_seed_hash) {
            return Err(ChannelError::broken_chain("seed predecessor mismatch"));
        }

        // The revealed reel must open this round's reel commitment.
        let opened = crypto::sha256_hex(&format!(
            "{}{}",
            house_spin.reel_seed_hash,
            reel_string(&house_spin.reel)
        ));
        if opened != house_spin.reel_hash {
            return Err(ChannelError::InvalidReelOpening);
        }

        // Re-derive the payout; the house cannot misreport balances.
        let payout = reel_payout(&house_spin.reel, pending.bet_size)?;
        let (user_balance, house_balance) = apply_round(
            pending.user_balance,
            pending.house_balance,
            pending.bet_size,
            payout,
        );
        if house_spin.user_balance != user_balance || house_spin.house_balance != house_balance {
            return Err(ChannelError::balance_mismatch(format!(
                "response settled {}/{}, expected {}/{}",
                house_spin.user_balance, house_spin.house_balance, user_balance, house_balance
            )));
        }

        info!(
            channel = self.channel_id,
            nonce = house_spin.nonce,
            payout,
            user_balance,
            house_balance,
            "round accepted"
        );
        let proposal = self.pending.take().expect("checked above");
        self.my_spins.push(proposal);
        self.house_spins.push(house_spin);
        Ok(())
    }

    /// Drops a pending proposal the house rejected, so a corrected one can
    /// be built for the same nonce.
    pub fn abandon_proposal(&mut self) {
        self.pending = None;
    }

    /// Latest matched (proposal, response) pair for unilateral finalize.
    pub fn latest_pair(&self) -> Option<(&Spin, &Spin)> {
        match (self.my_spins.last(), self.house_spins.last()) {
            (Some(p), Some(h)) => Some((p, h)),
            _ => None,
        }
    }

    /// Balances after the last accepted round, or the deposit pair.
    pub fn balances(&self) -> (u64, u64) {
        match self.house_spins.last() {
            Some(h) => (h.user_balance, h.house_balance),
            None => (self.deposit, self.deposit),
        }
    }

    /// A signed zero-nonce record for finalizing an unplayed channel.
    pub fn unplayed_finalize(&self) -> Spin {
        let mut spin = Spin::unplayed(self.deposit, false);
        spin.sign(&self.keypair);
        spin
    }
}

/// The house operator's half of the exchange for one channel.
#[derive(Debug)]
pub struct HouseSession {
    channel_id: u64,
    keypair: Keypair,
    deposit: u64,
    player_address: Address,
    final_user_hash: String,
    plan: ReelPlan,
    finalized: bool,
    closed: bool,
    player_spins: Vec<Spin>,
    house_spins: Vec<Spin>,
}

impl HouseSession {
    /// Derives the reel schedule for this channel from a fresh house seed.
    pub fn new(
        channel_id: u64,
        keypair: Keypair,
        deposit: u64,
        player_address: Address,
        final_user_hash: &str,
        house_seed: &str,
    ) -> Result<Self> {
        if !crypto::is_hex_digest(final_user_hash) {
            return Err(ChannelError::malformed("player commitment is not a digest"));
        }
        Ok(HouseSession {
            channel_id,
            keypair,
            deposit,
            player_address,
            final_user_hash: final_user_hash.to_string(),
            plan: ReelPlan::generate(house_seed, channel_id),
            finalized: false,
            closed: false,
            player_spins: Vec::new(),
            house_spins: Vec::new(),
        })
    }

    pub fn address(&self) -> Address {
        self.keypair.address()
    }

    /// Commitments published on-ledger at activation.
    pub fn commitments(&self) -> (&str, &str) {
        (self.plan.final_seed_hash(), self.plan.final_reel_hash())
    }

    /// Marks the channel finalized; later proposals are rejected.
    pub fn mark_finalized(&mut self) {
        self.finalized = true;
    }

    /// Marks the channel closed; later proposals are rejected.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    fn balances_empty(&self) -> bool {
        match self.house_spins.last() {
            Some(h) => h.user_balance == 0 || h.house_balance == 0,
            None => false,
        }
    }

    /// Validates a player proposal and, on success, produces the signed
    /// house response. Checks run in a fixed order so a malicious proposal
    /// is rejected for its first defect and nothing is mutated on the way
    /// out.
    pub fn process_spin(&mut self, spin: Spin) -> Result<Spin> {
        if self.finalized {
            return Err(ChannelError::AlreadyFinalized);
        }
        if self.closed {
            return Err(ChannelError::ChannelClosed);
        }
        if self.balances_empty() {
            return Err(ChannelError::EmptyBalances);
        }
        if spin.turn {
            return Err(ChannelError::unauthorized("proposal must carry turn=false"));
        }
        spin.require_signed_by(self.player_address)?;

        let expected_nonce = self.house_spins.len() as u64 + 1;
        if spin.nonce != expected_nonce || spin.nonce as usize >= CHAIN_LENGTH {
            return Err(ChannelError::InvalidNonce {
                expected: expected_nonce,
                got: spin.nonce,
            });
        }

        adjusted_bet_size(spin.bet_size).ok_or(ChannelError::InvalidBetSize(spin.bet_size))?;

        self.verify_balances(&spin)?;
        self.verify_hashes(&spin)?;

        let response = self.build_response(&spin)?;
        info!(
            channel = self.channel_id,
            nonce = spin.nonce,
            bet_size = spin.bet_size,
            user_balance = response.user_balance,
            house_balance = response.house_balance,
            "house answered spin"
        );
        self.player_spins.push(spin);
        self.house_spins.push(response.clone());
        Ok(response)
    }

    fn verify_balances(&self, spin: &Spin) -> Result<()> {
        let (user, house) = match self.house_spins.last() {
            Some(h) => (h.user_balance, h.house_balance),
            None => (self.deposit, self.deposit),
        };
        if spin.user_balance != user || spin.house_balance != house {
            return Err(ChannelError::balance_mismatch(format!(
                "proposal carried {}/{}, expected {}/{}",
                spin.user_balance, spin.house_balance, user, house
            )));
        }
        Ok(())
    }

    fn verify_hashes(&self, spin: &Spin) -> Result<()> {
        // The player's reveal must hash to its predecessor in both cases.
        if !verify_link(&spin.prev_user_hash, &spin.user_hash) {
            return Err(ChannelError::broken_chain("user reveal mismatch"));
        }

        if spin.nonce == 1 {
            // First round: every commitment field must equal the published
            // commitments.
            if spin.user_hash != self.final_user_hash {
                return Err(ChannelError::broken_chain("user reveal != commitment"));
            }
            if spin.reel_hash != self.plan.final_reel_hash() {
                return Err(ChannelError::broken_chain("reel hash != commitment"));
            }
            if spin.reel_seed_hash != self.plan.final_seed_hash() {
                return Err(ChannelError::broken_chain("seed hash != commitment"));
            }
        } else {
            let prev_player = self.player_spins.last().expect("nonce > 1 implies history");
            if spin.user_hash != prev_player.prev_user_hash {
                return Err(ChannelError::broken_chain("user chain discontinuity"));
            }
            // The proposal must echo the reel state the house revealed in
            // the previous round.
            let echo_nonce = spin.nonce - 1;
            if Some(spin.reel_hash.as_str()) != self.plan.reel_hash_at(echo_nonce) {
                return Err(ChannelError::broken_chain("reel hash echo mismatch"));
            }
            if Some(spin.reel_seed_hash.as_str()) != self.plan.seed_hash_at(echo_nonce) {
                return Err(ChannelError::broken_chain("seed hash echo mismatch"));
            }
            if Some(spin.prev_reel_seed_hash.as_str()) != self.plan.prev_seed_hash_at(echo_nonce) {
                return Err(ChannelError::broken_chain("seed predecessor echo mismatch"));
            }
        }
        Ok(())
    }

    fn build_response(&self, spin: &Spin) -> Result<Spin> {
        let nonce = spin.nonce;
        let reel = self
            .plan
            .reel_at(nonce)
            .ok_or(ChannelError::broken_chain("reel schedule exhausted"))?
            .to_vec();
        let payout = reel_payout(&reel, spin.bet_size)?;
        let (user_balance, house_balance) =
            apply_round(spin.user_balance, spin.house_balance, spin.bet_size, payout);

        let mut response = Spin {
            reel_hash: self
                .plan
                .reel_hash_at(nonce)
                .expect("reel_at succeeded")
                .to_string(),
            reel,
            reel_seed_hash: self
                .plan
                .seed_hash_at(nonce)
                .expect("reel_at succeeded")
                .to_string(),
            prev_reel_seed_hash: self
                .plan
                .prev_seed_hash_at(nonce)
                .ok_or(ChannelError::broken_chain("seed schedule exhausted"))?
                .to_string(),
            user_hash: spin.user_hash.clone(),
            prev_user_hash: spin.prev_user_hash.clone(),
            nonce,
            turn: true,
            user_balance,
            house_balance,
            bet_size: spin.bet_size,
            sig: None,
        };
        response.sign(&self.keypair);
        Ok(response)
    }

    /// Latest matched (proposal, response) pair for unilateral finalize.
    pub fn latest_pair(&self) -> Option<(&Spin, &Spin)> {
        match (self.player_spins.last(), self.house_spins.last()) {
            (Some(p), Some(h)) => Some((p, h)),
            _ => None,
        }
    }

    /// Balances after the last answered round, or the deposit pair.
    pub fn balances(&self) -> (u64, u64) {
        match self.house_spins.last() {
            Some(h) => (h.user_balance, h.house_balance),
            None => (self.deposit, self.deposit),
        }
    }

    /// A signed zero-nonce record for finalizing an unplayed channel.
    pub fn unplayed_finalize(&self) -> Spin {
        let mut spin = Spin::unplayed(self.deposit, true);
        spin.sign(&self.keypair);
        spin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payout::TOKEN;

    const DEPOSIT: u64 = 100 * TOKEN;

    fn sessions() -> (PlayerSession, HouseSession) {
        let player_kp = Keypair::generate();
        let house_kp = Keypair::generate();
        let mut player = PlayerSession::new(7, player_kp, DEPOSIT).unwrap();
        let house = HouseSession::new(
            7,
            house_kp,
            DEPOSIT,
            player.address(),
            &player.funding_params().final_user_hash,
            &crypto::random_secret(),
        )
        .unwrap();
        let (seed_hash, reel_hash) = {
            let (s, r) = house.commitments();
            (s.to_string(), r.to_string())
        };
        player
            .observe_activation(house.address(), &seed_hash, &reel_hash)
            .unwrap();
        (player, house)
    }

    fn play_round(player: &mut PlayerSession, house: &mut HouseSession, bet: u64) {
        let proposal = player.propose_spin(bet).unwrap();
        let response = house.process_spin(proposal).unwrap();
        player.apply_house_spin(response).unwrap();
    }

    #[test]
    fn rounds_conserve_balances() {
        let (mut player, mut house) = sessions();
        for _ in 0..10 {
            play_round(&mut player, &mut house, TOKEN);
            let (user, house_balance) = player.balances();
            assert_eq!(user + house_balance, 2 * DEPOSIT);
        }
        assert_eq!(player.balances(), house.balances());
        assert_eq!(player.latest_pair().unwrap().1.nonce, 10);
    }

    #[test]
    fn nonce_replay_is_rejected() {
        let (mut player, mut house) = sessions();
        let proposal = player.propose_spin(TOKEN).unwrap();
        let response = house.process_spin(proposal.clone()).unwrap();
        player.apply_house_spin(response).unwrap();

        // Replaying the same signed proposal must fail on the nonce.
        assert!(matches!(
            house.process_spin(proposal),
            Err(ChannelError::InvalidNonce { .. })
        ));
    }

    #[test]
    fn future_nonce_is_rejected() {
        let (mut player, mut house) = sessions();
        play_round(&mut player, &mut house, TOKEN);

        // A genuinely signed round-2 proposal shown to a house that has not
        // answered round 1 yet: the signature recovers the right player, so
        // the rejection comes from the nonce order check itself.
        let proposal = player.propose_spin(TOKEN).unwrap();
        assert_eq!(proposal.nonce, 2);
        let mut fresh = HouseSession::new(
            7,
            Keypair::generate(),
            DEPOSIT,
            player.address(),
            &player.funding_params().final_user_hash,
            &crypto::random_secret(),
        )
        .unwrap();
        assert!(matches!(
            fresh.process_spin(proposal),
            Err(ChannelError::InvalidNonce {
                expected: 1,
                got: 2
            })
        ));
    }

    #[test]
    fn tampered_fields_are_rejected() {
        let (mut player, mut house) = sessions();
        let proposal = player.propose_spin(TOKEN).unwrap();

        let mutations: Vec<Box<dyn Fn(&mut Spin)>> = vec![
            Box::new(|s| s.user_hash = crypto::sha256_hex("x")),
            Box::new(|s| s.prev_user_hash = crypto::sha256_hex("x")),
            Box::new(|s| s.reel_seed_hash = crypto::sha256_hex("x")),
            Box::new(|s| s.user_balance += 1),
            Box::new(|s| s.house_balance += 1),
            Box::new(|s| s.bet_size = 0),
            Box::new(|s| s.turn = true),
        ];
        for mutate in mutations {
            let mut tampered = proposal.clone();
            mutate(&mut tampered);
            assert!(house.process_spin(tampered).is_err());
        }

        // The untouched proposal still goes through.
        let response = house.process_spin(proposal).unwrap();
        player.apply_house_spin(response).unwrap();
    }

    #[test]
    fn wrong_signer_is_rejected() {
        let (mut player, mut house) = sessions();
        let mut proposal = player.propose_spin(TOKEN).unwrap();
        proposal.sign(&Keypair::generate());
        assert!(matches!(
            house.process_spin(proposal),
            Err(ChannelError::BadSignature)
        ));
    }

    #[test]
    fn invalid_bet_scale_is_rejected_by_both_sides() {
        let (mut player, mut house) = sessions();
        assert!(matches!(
            player.propose_spin(150_000),
            Err(ChannelError::InvalidBetSize(_))
        ));

        // A proposal hand-built around the player session's own check is
        // still rejected by the house.
        let mut proposal = player.propose_spin(TOKEN).unwrap();
        proposal.bet_size = 150_000;
        assert!(house.process_spin(proposal).is_err());
        player.abandon_proposal();
        let fresh = player.propose_spin(TOKEN).unwrap();
        let response = house.process_spin(fresh).unwrap();
        player.apply_house_spin(response).unwrap();
    }

    #[test]
    fn finalized_channel_rejects_spins() {
        let (mut player, mut house) = sessions();
        house.mark_finalized();
        let proposal = player.propose_spin(TOKEN).unwrap();
        assert!(matches!(
            house.process_spin(proposal),
            Err(ChannelError::AlreadyFinalized)
        ));
    }

    #[test]
    fn player_rejects_misreported_response() {
        let (mut player, mut house) = sessions();
        let proposal = player.propose_spin(TOKEN).unwrap();
        let mut response = house.process_spin(proposal).unwrap();

        // The house cannot shave the player's balance, even re-signed.
        response.user_balance = response.user_balance.saturating_sub(1);
        assert!(player.apply_house_spin(response).is_err());
    }

    #[test]
    fn player_rejects_foreign_reel() {
        let (mut player, mut house) = sessions();
        let proposal = player.propose_spin(TOKEN).unwrap();
        let mut response = house.process_spin(proposal).unwrap();
        response.reel = vec![1, 2, 3, 4, 5];
        assert!(matches!(
            player.apply_house_spin(response),
            Err(ChannelError::InvalidReelOpening) | Err(ChannelError::BadSignature)
        ));
    }
}
