//! The on-ledger channel authority: deposits, commitments, settlement and
//! claims. This is the authority of last resort when the off-ledger exchange
//! cannot continue cooperatively.
//!
//! Operations are atomic and serial per manager; channels are fully
//! independent and only touch the pooled session balances at activation and
//! claim time. Every time-gated transition takes `now` as an explicit input
//! so the dispute window can be driven deterministically in tests.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::accounting::HouseAccounting;
use crate::chain::{verify_link, CHAIN_LENGTH};
use crate::crypto::{self, Address, SealedSecret};
use crate::error::{ChannelError, Result};
use crate::payout::{apply_round, reel_payout, TOKEN};
use crate::reels::reel_string;
use crate::spin::Spin;

/// Smallest accepted channel deposit.
pub const MIN_DEPOSIT: u64 = 100 * TOKEN;
/// Largest accepted channel deposit.
pub const MAX_DEPOSIT: u64 = 1000 * TOKEN;
/// Time between a finalize and the earliest claim, measured from the latest
/// accepted finalize event.
pub const DISPUTE_WINDOW_SECS: i64 = 3600;

/// One side of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Party {
    Player,
    House,
}

/// Audit trail entry; one is appended for every accepted state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChannelEvent {
    Created {
        id: u64,
        player: Address,
        deposit: u64,
        session: u64,
    },
    Funded {
        id: u64,
        final_user_hash: String,
    },
    Activated {
        id: u64,
        final_seed_hash: String,
        final_reel_hash: String,
    },
    Finalized {
        id: u64,
        nonce: u64,
        player_balance: u64,
        house_balance: u64,
        submitter: Party,
    },
    Claimed {
        id: u64,
        party: Party,
        amount: u64,
    },
}

/// Persisted per-channel state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: u64,
    pub player: Address,
    pub deposit: u64,
    pub session: u64,
    pub ready: bool,
    pub activated: bool,
    pub finalized: bool,
    pub nonce: u64,
    pub sealed_number: Option<SealedSecret>,
    pub final_user_hash: Option<String>,
    pub final_seed_hash: Option<String>,
    pub final_reel_hash: Option<String>,
    pub player_balance: u64,
    pub house_balance: u64,
    pub finalized_at: Option<DateTime<Utc>>,
    pub player_claimed: bool,
    pub house_claimed: bool,
}

impl Channel {
    /// A channel is closed once both parties have claimed.
    pub fn closed(&self) -> bool {
        self.player_claimed && self.house_claimed
    }

    fn claim_deadline(&self) -> Option<DateTime<Utc>> {
        self.finalized_at
            .map(|at| at + Duration::seconds(DISPUTE_WINDOW_SECS))
    }
}

/// The channel ledger: monotonic ids, per-channel state and the audit log,
/// backed by the house accounting pools.
pub struct ChannelManager<A: HouseAccounting> {
    accounting: A,
    operator: Address,
    channels: BTreeMap<u64, Channel>,
    next_id: u64,
    events: Vec<ChannelEvent>,
}

impl<A: HouseAccounting> ChannelManager<A> {
    pub fn new(accounting: A, operator: Address) -> Self {
        ChannelManager {
            accounting,
            operator,
            channels: BTreeMap::new(),
            next_id: 1,
            events: Vec::new(),
        }
    }

    pub fn operator(&self) -> Address {
        self.operator
    }

    pub fn accounting(&self) -> &A {
        &self.accounting
    }

    pub fn accounting_mut(&mut self) -> &mut A {
        &mut self.accounting
    }

    pub fn channel(&self, id: u64) -> Result<&Channel> {
        self.channels
            .get(&id)
            .ok_or(ChannelError::UnknownChannel(id))
    }

    pub fn events(&self) -> &[ChannelEvent] {
        &self.events
    }

    /// JSON snapshot of a channel's persisted state, for operator tooling.
    pub fn export_channel(&self, id: u64) -> Result<String> {
        Ok(serde_json::to_string_pretty(self.channel(id)?)?)
    }

    /// Opens a channel for `player`, drawing the deposit from their pooled
    /// balance in the current session.
    pub fn create_channel(&mut self, player: Address, deposit: u64) -> Result<u64> {
        if !self.accounting.is_eligible(&player) {
            return Err(ChannelError::NotEligible(player));
        }
        if !(MIN_DEPOSIT..=MAX_DEPOSIT).contains(&deposit) {
            return Err(ChannelError::DepositOutOfRange {
                amount: deposit,
                min: MIN_DEPOSIT,
                max: MAX_DEPOSIT,
            });
        }

        let session = self.accounting.current_session();
        self.accounting.debit_user(&player, session, deposit)?;

        let id = self.next_id;
        self.next_id += 1;
        self.channels.insert(
            id,
            Channel {
                id,
                player,
                deposit,
                session,
                ready: false,
                activated: false,
                finalized: false,
                nonce: 0,
                sealed_number: None,
                final_user_hash: None,
                final_seed_hash: None,
                final_reel_hash: None,
                player_balance: 0,
                house_balance: 0,
                finalized_at: None,
                player_claimed: false,
                house_claimed: false,
            },
        );

        info!(id, %player, deposit, session, "channel created");
        self.events.push(ChannelEvent::Created {
            id,
            player,
            deposit,
            session,
        });
        Ok(id)
    }

    /// The player publishes their sealed secret number and hash-chain
    /// commitment, making the channel ready for activation.
    pub fn deposit_channel(
        &mut self,
        id: u64,
        caller: Address,
        sealed_number: SealedSecret,
        final_user_hash: String,
    ) -> Result<()> {
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or(ChannelError::UnknownChannel(id))?;
        if caller != channel.player {
            return Err(ChannelError::unauthorized(
                "only the channel player can fund it",
            ));
        }
        if channel.ready {
            return Err(ChannelError::AlreadyFunded);
        }
        if !crypto::is_hex_digest(&final_user_hash) {
            return Err(ChannelError::malformed("final user hash is not a digest"));
        }

        channel.sealed_number = Some(sealed_number);
        channel.final_user_hash = Some(final_user_hash.clone());
        channel.ready = true;

        info!(id, "channel funded");
        self.events.push(ChannelEvent::Funded {
            id,
            final_user_hash,
        });
        Ok(())
    }

    /// The house operator matches the deposit from the session pool and
    /// publishes its reel commitments. Only once, only when ready.
    pub fn activate_channel(
        &mut self,
        id: u64,
        caller: Address,
        final_seed_hash: String,
        final_reel_hash: String,
    ) -> Result<()> {
        if caller != self.operator {
            return Err(ChannelError::unauthorized(
                "only the house operator can activate",
            ));
        }
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or(ChannelError::UnknownChannel(id))?;
        if !channel.ready {
            return Err(ChannelError::ChannelNotReady);
        }
        if channel.activated {
            return Err(ChannelError::AlreadyActivated);
        }
        if !crypto::is_hex_digest(&final_seed_hash) || !crypto::is_hex_digest(&final_reel_hash) {
            return Err(ChannelError::malformed("house commitment is not a digest"));
        }

        self.accounting
            .debit_house(channel.session, channel.deposit)?;
        channel.final_seed_hash = Some(final_seed_hash.clone());
        channel.final_reel_hash = Some(final_reel_hash.clone());
        channel.activated = true;
        channel.player_balance = channel.deposit;
        channel.house_balance = channel.deposit;

        info!(id, deposit = channel.deposit, "channel activated");
        self.events.push(ChannelEvent::Activated {
            id,
            final_seed_hash,
            final_reel_hash,
        });
        Ok(())
    }

    fn party_of(&self, channel: &Channel, caller: Address) -> Result<Party> {
        if caller == channel.player {
            Ok(Party::Player)
        } else if caller == self.operator {
            Ok(Party::House)
        } else {
            Err(ChannelError::unauthorized(
                "caller is neither the player nor the house operator",
            ))
        }
    }

    /// Settles the channel from a signed transcript.
    ///
    /// Either party may submit its latest matched (proposal, response) pair;
    /// competing submissions are resolved highest-nonce-wins while the
    /// dispute window of the previous acceptance is still open. A channel on
    /// which no round was ever played is settled from a single zero-nonce
    /// record signed by the submitter, at the symmetric deposit split.
    pub fn finalize(
        &mut self,
        id: u64,
        submitter: Address,
        player_spin: &Spin,
        house_spin: Option<&Spin>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let channel = self.channel(id)?.clone();
        if !channel.activated {
            return Err(ChannelError::NotActivated);
        }
        if channel.player_claimed || channel.house_claimed {
            return Err(ChannelError::ChannelClosed);
        }
        let submitter_party = self.party_of(&channel, submitter)?;

        let (nonce, player_balance, house_balance) = if player_spin.nonce == 0 {
            self.verify_unplayed_finalize(&channel, submitter, submitter_party, player_spin, house_spin)?
        } else {
            let house_spin = house_spin.ok_or(ChannelError::IncompletePair)?;
            self.verify_pair(&channel, player_spin, house_spin)?
        };

        if channel.finalized {
            let deadline = channel.claim_deadline().expect("finalized implies timestamp");
            if now >= deadline {
                // The window has elapsed; the settlement is fixed.
                return Err(ChannelError::AlreadyFinalized);
            }
            if nonce <= channel.nonce {
                return Err(ChannelError::StaleFinalize {
                    settled: channel.nonce,
                    got: nonce,
                });
            }
            warn!(
                id,
                old_nonce = channel.nonce,
                new_nonce = nonce,
                "competing finalize accepted, dispute window restarted"
            );
        }

        let channel = self.channels.get_mut(&id).expect("looked up above");
        channel.finalized = true;
        channel.nonce = nonce;
        channel.player_balance = player_balance;
        channel.house_balance = house_balance;
        channel.finalized_at = Some(now);

        info!(
            id,
            nonce, player_balance, house_balance, "channel finalized"
        );
        self.events.push(ChannelEvent::Finalized {
            id,
            nonce,
            player_balance,
            house_balance,
            submitter: submitter_party,
        });
        Ok(())
    }

    /// The zero-nonce fast path for channels with no played rounds: one
    /// record, signed by the submitter, settling at the deposit pair. Any
    /// other balance split is rejected, which is what makes the single
    /// signature safe.
    fn verify_unplayed_finalize(
        &self,
        channel: &Channel,
        submitter: Address,
        submitter_party: Party,
        spin: &Spin,
        house_spin: Option<&Spin>,
    ) -> Result<(u64, u64, u64)> {
        if house_spin.is_some() {
            return Err(ChannelError::IncompletePair);
        }
        let expected_turn = submitter_party == Party::House;
        if spin.turn != expected_turn {
            return Err(ChannelError::unauthorized(
                "zero-nonce record must carry the submitter's own turn flag",
            ));
        }
        if spin.user_balance != channel.deposit
            || spin.house_balance != channel.deposit
            || spin.bet_size != 0
        {
            return Err(ChannelError::balance_mismatch(
                "unplayed channel settles at the deposit pair",
            ));
        }
        if !spin.reel.is_empty()
            || !spin.reel_hash.is_empty()
            || !spin.reel_seed_hash.is_empty()
            || !spin.user_hash.is_empty()
        {
            return Err(ChannelError::malformed(
                "zero-nonce record must carry empty commitments",
            ));
        }
        spin.require_signed_by(submitter)?;
        Ok((0, channel.deposit, channel.deposit))
    }

    /// Validates a matched pair against the channel's published commitments
    /// and re-derives the settlement balances from the revealed reel.
    fn verify_pair(
        &self,
        channel: &Channel,
        player_spin: &Spin,
        house_spin: &Spin,
    ) -> Result<(u64, u64, u64)> {
        if player_spin.turn || !house_spin.turn {
            return Err(ChannelError::IncompletePair);
        }
        if player_spin.nonce != house_spin.nonce {
            return Err(ChannelError::InvalidNonce {
                expected: player_spin.nonce,
                got: house_spin.nonce,
            });
        }
        // The last chain element is the commitment itself, so it can never
        // be consumed by a round.
        let nonce = player_spin.nonce;
        if nonce as usize >= CHAIN_LENGTH {
            return Err(ChannelError::InvalidNonce {
                expected: CHAIN_LENGTH as u64 - 1,
                got: nonce,
            });
        }
        if player_spin.bet_size != house_spin.bet_size {
            return Err(ChannelError::balance_mismatch("pair bet sizes differ"));
        }

        // Each record must recover its claimed author.
        player_spin.require_signed_by(channel.player)?;
        house_spin.require_signed_by(self.operator)?;

        // Player hash-chain continuity, echoed untouched by the house.
        if !verify_link(&player_spin.prev_user_hash, &player_spin.user_hash) {
            return Err(ChannelError::broken_chain("user reveal mismatch"));
        }
        if house_spin.user_hash != player_spin.user_hash
            || house_spin.prev_user_hash != player_spin.prev_user_hash
        {
            return Err(ChannelError::broken_chain("pair user reveals differ"));
        }

        // Reel-side continuity and opening.
        if !player_spin.reel.is_empty() {
            return Err(ChannelError::malformed("proposal must not reveal a reel"));
        }
        if !verify_link(&house_spin.prev_reel_seed_hash, &house_spin.reel_seed_hash) {
            return Err(ChannelError::broken_chain("seed predecessor mismatch"));
        }
        let opened = crypto::sha256_hex(&format!(
            "{}{}",
            house_spin.reel_seed_hash,
            reel_string(&house_spin.reel)
        ));
        if opened != house_spin.reel_hash {
            return Err(ChannelError::InvalidReelOpening);
        }

        // The first round must open the commitments published at funding
        // and activation.
        if nonce == 1 {
            if Some(&player_spin.user_hash) != channel.final_user_hash.as_ref() {
                return Err(ChannelError::broken_chain("user reveal != commitment"));
            }
            if Some(&house_spin.reel_seed_hash) != channel.final_seed_hash.as_ref() {
                return Err(ChannelError::broken_chain("seed reveal != commitment"));
            }
            if Some(&house_spin.reel_hash) != channel.final_reel_hash.as_ref() {
                return Err(ChannelError::broken_chain("reel hash != commitment"));
            }
        }

        // The entering balances must exhaust the channel and the settled
        // balances must follow from the revealed reel. Summed with
        // checked_add: a forged record carrying huge balances must reject,
        // not wrap or panic.
        let entering = player_spin
            .user_balance
            .checked_add(player_spin.house_balance);
        if entering != Some(2 * channel.deposit) {
            return Err(ChannelError::balance_mismatch(
                "pair balances do not sum to the channel total",
            ));
        }
        let payout = reel_payout(&house_spin.reel, house_spin.bet_size)?;
        let (player_balance, house_balance) = apply_round(
            player_spin.user_balance,
            player_spin.house_balance,
            player_spin.bet_size,
            payout,
        );
        if house_spin.user_balance != player_balance || house_spin.house_balance != house_balance {
            return Err(ChannelError::balance_mismatch(
                "settled balances do not follow from the revealed reel",
            ));
        }

        Ok((nonce, player_balance, house_balance))
    }

    /// Pays a party its settled share back into the pooled balances, once,
    /// after the dispute window has elapsed.
    pub fn claim(&mut self, id: u64, caller: Address, now: DateTime<Utc>) -> Result<u64> {
        let channel = self.channel(id)?.clone();
        if !channel.finalized {
            return Err(ChannelError::NotFinalized);
        }
        let party = self.party_of(&channel, caller)?;
        let deadline = channel.claim_deadline().expect("finalized implies timestamp");
        if now < deadline {
            return Err(ChannelError::DisputeWindowOpen(deadline));
        }

        let amount = match party {
            Party::Player => {
                if channel.player_claimed {
                    return Err(ChannelError::AlreadyClaimed);
                }
                channel.player_balance
            }
            Party::House => {
                if channel.house_claimed {
                    return Err(ChannelError::AlreadyClaimed);
                }
                channel.house_balance
            }
        };

        match party {
            Party::Player => {
                self.accounting
                    .credit_user(&channel.player, channel.session, amount);
            }
            Party::House => {
                self.accounting.credit_house(channel.session, amount);
            }
        }

        let channel = self.channels.get_mut(&id).expect("looked up above");
        match party {
            Party::Player => {
                channel.player_balance = 0;
                channel.player_claimed = true;
            }
            Party::House => {
                channel.house_balance = 0;
                channel.house_claimed = true;
            }
        }

        info!(id, ?party, amount, closed = channel.closed(), "claimed");
        self.events.push(ChannelEvent::Claimed { id, party, amount });
        Ok(amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::SessionPools;
    use crate::crypto::Keypair;
    use crate::exchange::{HouseSession, PlayerSession};

    const DEPOSIT: u64 = MIN_DEPOSIT;

    struct Fixture {
        manager: ChannelManager<SessionPools>,
        player: Keypair,
        house: Keypair,
    }

    fn fixture() -> Fixture {
        let player = Keypair::generate();
        let house = Keypair::generate();
        let mut pools = SessionPools::new(1);
        pools.fund_house(10_000 * TOKEN);
        pools.fund_user(player.address(), 10_000 * TOKEN);
        Fixture {
            manager: ChannelManager::new(pools, house.address()),
            player,
            house,
        }
    }

    /// Drives a channel to activation and returns the two session halves.
    fn activated_channel(fx: &mut Fixture) -> (u64, PlayerSession, HouseSession) {
        let id = fx
            .manager
            .create_channel(fx.player.address(), DEPOSIT)
            .unwrap();
        let mut session = PlayerSession::new(id, fx.player.clone(), DEPOSIT).unwrap();
        let funding = session.funding_params().clone();
        fx.manager
            .deposit_channel(
                id,
                fx.player.address(),
                funding.sealed_number,
                funding.final_user_hash.clone(),
            )
            .unwrap();

        let house_session = HouseSession::new(
            id,
            fx.house.clone(),
            DEPOSIT,
            fx.player.address(),
            &funding.final_user_hash,
            &crypto::random_secret(),
        )
        .unwrap();
        let (seed_hash, reel_hash) = {
            let (s, r) = house_session.commitments();
            (s.to_string(), r.to_string())
        };
        fx.manager
            .activate_channel(id, fx.house.address(), seed_hash.clone(), reel_hash.clone())
            .unwrap();
        session
            .observe_activation(house_session.address(), &seed_hash, &reel_hash)
            .unwrap();
        (id, session, house_session)
    }

    fn play_rounds(
        player: &mut PlayerSession,
        house: &mut HouseSession,
        rounds: usize,
    ) -> (Spin, Spin) {
        for _ in 0..rounds {
            let proposal = player.propose_spin(TOKEN).unwrap();
            let response = house.process_spin(proposal).unwrap();
            player.apply_house_spin(response).unwrap();
        }
        let (p, h) = player.latest_pair().unwrap();
        (p.clone(), h.clone())
    }

    fn past_window(now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(DISPUTE_WINDOW_SECS + 1)
    }

    #[test]
    fn deposit_boundaries() {
        let mut fx = fixture();
        let player = fx.player.address();
        assert!(fx.manager.create_channel(player, MIN_DEPOSIT).is_ok());
        assert!(fx.manager.create_channel(player, MAX_DEPOSIT).is_ok());
        assert!(matches!(
            fx.manager.create_channel(player, MIN_DEPOSIT - 1),
            Err(ChannelError::DepositOutOfRange { .. })
        ));
        assert!(matches!(
            fx.manager.create_channel(player, MAX_DEPOSIT + 1),
            Err(ChannelError::DepositOutOfRange { .. })
        ));
    }

    #[test]
    fn ineligible_player_cannot_create() {
        let mut fx = fixture();
        let player = fx.player.address();
        fx.manager.accounting_mut().blacklist(player);
        assert!(matches!(
            fx.manager.create_channel(player, DEPOSIT),
            Err(ChannelError::NotEligible(_))
        ));
    }

    #[test]
    fn create_requires_pooled_funds() {
        let mut fx = fixture();
        let poor = Keypair::generate().address();
        assert!(matches!(
            fx.manager.create_channel(poor, DEPOSIT),
            Err(ChannelError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn activation_gates() {
        let mut fx = fixture();
        let (id, _player_session, house_session) = activated_channel(&mut fx);

        // Double activation is rejected.
        let (s, r) = house_session.commitments();
        assert!(matches!(
            fx.manager
                .activate_channel(id, fx.house.address(), s.to_string(), r.to_string()),
            Err(ChannelError::AlreadyActivated)
        ));

        // Activation by a non-operator is rejected before anything else.
        let id2 = fx
            .manager
            .create_channel(fx.player.address(), DEPOSIT)
            .unwrap();
        assert!(matches!(
            fx.manager
                .activate_channel(id2, fx.player.address(), s.to_string(), r.to_string()),
            Err(ChannelError::Unauthorized(_))
        ));

        // Activation before funding is rejected.
        assert!(matches!(
            fx.manager
                .activate_channel(id2, fx.house.address(), s.to_string(), r.to_string()),
            Err(ChannelError::ChannelNotReady)
        ));
    }

    #[test]
    fn finalize_requires_activation() {
        let mut fx = fixture();
        let id = fx
            .manager
            .create_channel(fx.player.address(), DEPOSIT)
            .unwrap();
        let spin = Spin::unplayed(DEPOSIT, false);
        assert!(matches!(
            fx.manager
                .finalize(id, fx.player.address(), &spin, None, Utc::now()),
            Err(ChannelError::NotActivated)
        ));
    }

    #[test]
    fn finalize_and_claim_flow() {
        let mut fx = fixture();
        let (id, mut player, mut house) = activated_channel(&mut fx);
        let (p, h) = play_rounds(&mut player, &mut house, 3);

        let now = Utc::now();
        fx.manager
            .finalize(id, fx.player.address(), &p, Some(&h), now)
            .unwrap();

        // Claims inside the window are rejected.
        assert!(matches!(
            fx.manager.claim(id, fx.player.address(), now),
            Err(ChannelError::DisputeWindowOpen(_))
        ));

        let later = past_window(now);
        let player_amount = fx.manager.claim(id, fx.player.address(), later).unwrap();
        let house_amount = fx.manager.claim(id, fx.house.address(), later).unwrap();
        assert_eq!(player_amount + house_amount, 2 * DEPOSIT);
        assert_eq!(player_amount, h.user_balance);

        // Channel-local balances are zeroed and a second claim is rejected.
        let channel = fx.manager.channel(id).unwrap();
        assert!(channel.closed());
        assert_eq!(channel.player_balance, 0);
        assert_eq!(channel.house_balance, 0);
        assert!(matches!(
            fx.manager.claim(id, fx.player.address(), later),
            Err(ChannelError::AlreadyClaimed)
        ));
    }

    #[test]
    fn unplayed_finalize_settles_at_deposits() {
        let mut fx = fixture();
        let (id, player, house) = activated_channel(&mut fx);

        let now = Utc::now();
        let record = player.unplayed_finalize();
        fx.manager
            .finalize(id, fx.player.address(), &record, None, now)
            .unwrap();
        let channel = fx.manager.channel(id).unwrap();
        assert_eq!(channel.nonce, 0);
        assert_eq!(channel.player_balance, DEPOSIT);
        assert_eq!(channel.house_balance, DEPOSIT);

        // The house-submitted variant works the same on a fresh channel.
        let mut fx2 = fixture();
        let (id2, _player2, house2) = activated_channel(&mut fx2);
        let record2 = house2.unplayed_finalize();
        fx2.manager
            .finalize(id2, fx2.house.address(), &record2, None, now)
            .unwrap();

        // But a submitter cannot pass off the counterparty's record as its
        // own, and the split cannot deviate from the deposits.
        let mut fx3 = fixture();
        let (id3, _player3, _house3) = activated_channel(&mut fx3);
        let foreign = house.unplayed_finalize();
        assert!(fx3
            .manager
            .finalize(id3, fx3.player.address(), &foreign, None, now)
            .is_err());
        let mut skewed = Spin::unplayed(DEPOSIT, false);
        skewed.user_balance += 1;
        skewed.house_balance -= 1;
        assert!(matches!(
            fx3.manager
                .finalize(id3, fx3.player.address(), &skewed, None, now),
            Err(ChannelError::BalanceMismatch(_))
        ));
    }

    #[test]
    fn competing_finalize_highest_nonce_wins() {
        let mut fx = fixture();
        let (id, mut player, mut house) = activated_channel(&mut fx);

        let (p1, h1) = play_rounds(&mut player, &mut house, 1);
        let (p2, h2) = play_rounds(&mut player, &mut house, 1);
        assert_eq!(h2.nonce, 2);

        let now = Utc::now();
        fx.manager
            .finalize(id, fx.house.address(), &p1, Some(&h1), now)
            .unwrap();

        // A lower or equal nonce cannot displace the settlement.
        assert!(matches!(
            fx.manager
                .finalize(id, fx.house.address(), &p1, Some(&h1), now),
            Err(ChannelError::StaleFinalize { .. })
        ));

        // A higher nonce wins while the window is open and restarts it.
        let mid = now + Duration::seconds(10);
        fx.manager
            .finalize(id, fx.player.address(), &p2, Some(&h2), mid)
            .unwrap();
        let channel = fx.manager.channel(id).unwrap();
        assert_eq!(channel.nonce, 2);
        assert_eq!(channel.finalized_at, Some(mid));

        // Once the window has elapsed the settlement is fixed.
        let (p3, h3) = play_rounds(&mut player, &mut house, 1);
        assert!(matches!(
            fx.manager
                .finalize(id, fx.player.address(), &p3, Some(&h3), past_window(mid)),
            Err(ChannelError::AlreadyFinalized)
        ));
    }

    #[test]
    fn finalize_rejects_tampered_pairs() {
        let mut fx = fixture();
        let (id, mut player, mut house) = activated_channel(&mut fx);
        let (p, h) = play_rounds(&mut player, &mut house, 2);
        let now = Utc::now();

        // Missing house half.
        assert!(matches!(
            fx.manager.finalize(id, fx.player.address(), &p, None, now),
            Err(ChannelError::IncompletePair)
        ));

        // Inflated settlement balances break the re-derivation (and the
        // signature first).
        let mut rich = h.clone();
        rich.user_balance += TOKEN;
        rich.house_balance -= TOKEN;
        assert!(fx
            .manager
            .finalize(id, fx.player.address(), &p, Some(&rich), now)
            .is_err());

        // A pair from a stranger's keys is rejected.
        let stranger = Keypair::generate();
        let mut forged = h.clone();
        forged.sign(&stranger);
        assert!(matches!(
            fx.manager
                .finalize(id, fx.player.address(), &p, Some(&forged), now),
            Err(ChannelError::BadSignature)
        ));

        // The honest pair still settles.
        fx.manager
            .finalize(id, fx.player.address(), &p, Some(&h), now)
            .unwrap();
    }

    #[test]
    fn commitment_round_is_not_playable() {
        let mut fx = fixture();
        let (id, mut player, mut house) = activated_channel(&mut fx);
        let (mut p, mut h) = play_rounds(&mut player, &mut house, 1);

        // The pair nonce range is checked before the signatures, so a pair
        // claiming the commitment's own round trips the nonce gate.
        p.nonce = CHAIN_LENGTH as u64;
        h.nonce = CHAIN_LENGTH as u64;
        assert!(matches!(
            fx.manager
                .finalize(id, fx.player.address(), &p, Some(&h), Utc::now()),
            Err(ChannelError::InvalidNonce { expected, got })
                if expected == CHAIN_LENGTH as u64 - 1 && got == CHAIN_LENGTH as u64
        ));
    }

    #[test]
    fn forged_max_balances_reject_without_panicking() {
        let mut fx = fixture();
        let (id, mut player, mut house) = activated_channel(&mut fx);
        let (p, h) = play_rounds(&mut player, &mut house, 2);

        // A dishonest player can re-sign their own half with arbitrary
        // balances; the sum check must reject it even where the raw u64
        // addition would wrap.
        let mut forged = p.clone();
        forged.user_balance = u64::MAX;
        forged.house_balance = u64::MAX;
        forged.sign(&fx.player);
        assert!(matches!(
            fx.manager
                .finalize(id, fx.player.address(), &forged, Some(&h), Utc::now()),
            Err(ChannelError::BalanceMismatch(_))
        ));
    }

    #[test]
    fn channel_snapshot_round_trips() {
        let mut fx = fixture();
        let (id, _player, _house) = activated_channel(&mut fx);
        let json = fx.manager.export_channel(id).unwrap();
        let snapshot: Channel = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.deposit, DEPOSIT);
        assert!(snapshot.activated);
    }

    #[test]
    fn claim_requires_finalize() {
        let mut fx = fixture();
        let (id, _player, _house) = activated_channel(&mut fx);
        assert!(matches!(
            fx.manager.claim(id, fx.player.address(), Utc::now()),
            Err(ChannelError::NotFinalized)
        ));
    }

    #[test]
    fn finalize_after_claim_is_rejected() {
        let mut fx = fixture();
        let (id, mut player, mut house) = activated_channel(&mut fx);
        let (p, h) = play_rounds(&mut player, &mut house, 1);
        let now = Utc::now();
        fx.manager
            .finalize(id, fx.player.address(), &p, Some(&h), now)
            .unwrap();
        let later = past_window(now);
        fx.manager.claim(id, fx.player.address(), later).unwrap();

        let (p2, h2) = play_rounds(&mut player, &mut house, 1);
        assert!(matches!(
            fx.manager
                .finalize(id, fx.house.address(), &p2, Some(&h2), later),
            Err(ChannelError::ChannelClosed)
        ));
    }
}
