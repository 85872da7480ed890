//! Reversed hash chains for commit-reveal fairness.
//!
//! A chain is built forward from a secret seed by repeated hashing; only the
//! *last* element is published as the commitment. Reveals then walk backward,
//! one element per round, so every revealed value must hash to the previously
//! accepted one. All outcomes are fixed the moment the commitment is
//! published, yet future reveals cannot be predicted from past ones.

use crate::crypto::sha256_hex;

/// Number of elements in every chain. The last element is published as the
/// commitment, so rounds 1 through `CHAIN_LENGTH - 1` are playable; the
/// final round would otherwise have to disclose the seed itself.
pub const CHAIN_LENGTH: usize = 1000;

/// An ordered sequence of hashes built by repeatedly hashing a secret seed.
#[derive(Debug, Clone)]
pub struct HashChain {
    hashes: Vec<String>,
}

impl HashChain {
    /// Builds the full chain from a secret seed:
    /// `h[0] = H(seed)`, `h[i] = H(h[i-1])`.
    pub fn generate(seed: &str) -> Self {
        let mut hashes = Vec::with_capacity(CHAIN_LENGTH);
        let mut current = sha256_hex(seed);
        for _ in 0..CHAIN_LENGTH {
            hashes.push(current.clone());
            current = sha256_hex(&current);
        }
        HashChain { hashes }
    }

    /// The public commitment: the last element of the chain.
    pub fn commitment(&self) -> &str {
        &self.hashes[self.hashes.len() - 1]
    }

    /// The element revealed at round `nonce`, walking back from the end.
    /// Round 1 reveals the committed element itself.
    pub fn reveal_at(&self, nonce: u64) -> Option<&str> {
        let nonce = nonce as usize;
        if nonce == 0 || nonce > self.hashes.len() {
            return None;
        }
        Some(&self.hashes[self.hashes.len() - nonce])
    }

    /// The predecessor of the element revealed at round `nonce`; disclosing
    /// it proves the reveal sits on the committed chain.
    pub fn prev_at(&self, nonce: u64) -> Option<&str> {
        let nonce = nonce as usize;
        if nonce == 0 || nonce + 1 > self.hashes.len() {
            return None;
        }
        Some(&self.hashes[self.hashes.len() - nonce - 1])
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Verifies one reveal step: the revealed value must hash to the previously
/// accepted element (or to the published commitment for the first reveal).
pub fn verify_link(revealed: &str, expected: &str) -> bool {
    sha256_hex(revealed) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_links_back_to_front() {
        let chain = HashChain::generate("secret-seed");
        assert_eq!(chain.len(), CHAIN_LENGTH);

        // First reveal is the commitment itself; each later reveal hashes to
        // the one before it.
        assert_eq!(chain.reveal_at(1).unwrap(), chain.commitment());
        for nonce in 1..=5 {
            let revealed = chain.prev_at(nonce).unwrap();
            let expected = chain.reveal_at(nonce).unwrap();
            assert!(verify_link(revealed, expected));
        }
    }

    #[test]
    fn reveal_indices_walk_backward() {
        let chain = HashChain::generate("s");
        assert_eq!(chain.prev_at(1), chain.reveal_at(2));
        assert_eq!(chain.prev_at(2), chain.reveal_at(3));
    }

    #[test]
    fn out_of_range_nonces_have_no_reveal() {
        let chain = HashChain::generate("s");
        assert!(chain.reveal_at(0).is_none());
        assert!(chain.reveal_at(CHAIN_LENGTH as u64 + 1).is_none());
        // The last playable round still has a predecessor to disclose; one
        // past it would need the seed itself.
        assert!(chain.prev_at(CHAIN_LENGTH as u64 - 1).is_some());
        assert!(chain.prev_at(CHAIN_LENGTH as u64).is_none());
    }

    #[test]
    fn broken_link_is_rejected() {
        let chain = HashChain::generate("s");
        let mut revealed = chain.prev_at(1).unwrap().to_string();
        revealed.replace_range(0..1, if revealed.starts_with('a') { "b" } else { "a" });
        assert!(!verify_link(&revealed, chain.reveal_at(1).unwrap()));
    }
}
