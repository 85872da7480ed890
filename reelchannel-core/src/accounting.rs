//! The house accounting seam.
//!
//! Pooled session funds live outside the channel protocol; the channel
//! manager reaches them only through this trait, with explicit debit/credit
//! results. Channels never touch the pools between activation and claim.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::crypto::Address;
use crate::error::{ChannelError, Result};

/// External collaborator holding per-session pooled balances for the house
/// and for each user, plus the eligibility gate.
pub trait HouseAccounting {
    /// The session new channels draw from.
    fn current_session(&self) -> u64;

    /// KYC/blacklist gate.
    fn is_eligible(&self, address: &Address) -> bool;

    fn debit_house(&mut self, session: u64, amount: u64) -> Result<()>;

    fn credit_house(&mut self, session: u64, amount: u64);

    fn debit_user(&mut self, address: &Address, session: u64, amount: u64) -> Result<()>;

    fn credit_user(&mut self, address: &Address, session: u64, amount: u64);
}

/// In-memory pools, used by the simulation CLI and the test suite.
#[derive(Debug, Default)]
pub struct SessionPools {
    session: u64,
    house: HashMap<u64, u64>,
    users: HashMap<(Address, u64), u64>,
    blacklist: HashSet<Address>,
}

impl SessionPools {
    pub fn new(session: u64) -> Self {
        SessionPools {
            session,
            ..Default::default()
        }
    }

    /// Seeds the house pool for the current session.
    pub fn fund_house(&mut self, amount: u64) {
        *self.house.entry(self.session).or_default() += amount;
    }

    /// Seeds a user's pooled balance for the current session.
    pub fn fund_user(&mut self, address: Address, amount: u64) {
        *self.users.entry((address, self.session)).or_default() += amount;
    }

    pub fn blacklist(&mut self, address: Address) {
        self.blacklist.insert(address);
    }

    pub fn house_balance(&self, session: u64) -> u64 {
        self.house.get(&session).copied().unwrap_or(0)
    }

    pub fn user_balance(&self, address: &Address, session: u64) -> u64 {
        self.users.get(&(*address, session)).copied().unwrap_or(0)
    }

    /// Rolls the pools over to the next session epoch.
    pub fn advance_session(&mut self) {
        self.session += 1;
    }

    fn take(balance: &mut u64, amount: u64) -> Result<()> {
        if *balance < amount {
            return Err(ChannelError::InsufficientFunds {
                need: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        Ok(())
    }
}

impl HouseAccounting for SessionPools {
    fn current_session(&self) -> u64 {
        self.session
    }

    fn is_eligible(&self, address: &Address) -> bool {
        !self.blacklist.contains(address)
    }

    fn debit_house(&mut self, session: u64, amount: u64) -> Result<()> {
        let balance = self.house.entry(session).or_default();
        Self::take(balance, amount)?;
        debug!(session, amount, remaining = *balance, "house pool debited");
        Ok(())
    }

    fn credit_house(&mut self, session: u64, amount: u64) {
        *self.house.entry(session).or_default() += amount;
    }

    fn debit_user(&mut self, address: &Address, session: u64, amount: u64) -> Result<()> {
        let balance = self.users.entry((*address, session)).or_default();
        Self::take(balance, amount)?;
        debug!(%address, session, amount, "user pool debited");
        Ok(())
    }

    fn credit_user(&mut self, address: &Address, session: u64, amount: u64) {
        *self.users.entry((*address, session)).or_default() += amount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn debits_fail_on_shortfall() {
        let mut pools = SessionPools::new(1);
        pools.fund_house(500);
        assert!(pools.debit_house(1, 400).is_ok());
        assert!(matches!(
            pools.debit_house(1, 200),
            Err(ChannelError::InsufficientFunds {
                need: 200,
                available: 100
            })
        ));
    }

    #[test]
    fn sessions_are_isolated() {
        let addr = Keypair::generate().address();
        let mut pools = SessionPools::new(1);
        pools.fund_user(addr, 100);
        pools.advance_session();
        assert_eq!(pools.user_balance(&addr, 1), 100);
        assert_eq!(pools.user_balance(&addr, 2), 0);
        assert!(pools.debit_user(&addr, 2, 1).is_err());
    }

    #[test]
    fn blacklist_gates_eligibility() {
        let addr = Keypair::generate().address();
        let mut pools = SessionPools::new(1);
        assert!(pools.is_eligible(&addr));
        pools.blacklist(addr);
        assert!(!pools.is_eligible(&addr));
    }
}
