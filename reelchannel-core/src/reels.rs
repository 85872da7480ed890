//! Deterministic reel outcomes committed ahead of play.
//!
//! The house blends its secret seed with the channel id (so a seed can never
//! be reused across channels), derives a full hash chain from the blend, and
//! draws one reel-stop vector per chain element. Each round's reel is bound
//! to the chain by `reel_hash = H(seed_hash || reel)`; publishing the last
//! seed/reel hash pair at activation commits the house to every outcome.

use sha2::{Digest, Sha256};

use crate::chain::HashChain;

pub const NUM_REELS: usize = 5;
pub const NUM_LINES: usize = 5;
pub const STRIP_LENGTH: usize = 21;
pub const NUM_SYMBOLS: u8 = 7;

/// The fixed symbol strips, one per reel. Symbols are 1..=7.
pub const REEL_STRIPS: [[u8; STRIP_LENGTH]; NUM_REELS] = [
    [7, 2, 2, 1, 5, 3, 5, 3, 2, 2, 3, 4, 2, 5, 1, 1, 6, 4, 1, 5, 3],
    [1, 1, 3, 3, 5, 3, 5, 1, 2, 2, 4, 1, 3, 4, 3, 2, 2, 6, 6, 3, 7],
    [4, 2, 7, 3, 2, 6, 1, 4, 3, 1, 5, 1, 1, 4, 4, 1, 5, 2, 2, 1, 1],
    [1, 1, 5, 1, 2, 7, 4, 2, 1, 3, 2, 2, 3, 1, 1, 2, 6, 2, 6, 3, 5],
    [1, 4, 1, 1, 2, 4, 1, 3, 6, 2, 7, 2, 4, 1, 3, 1, 3, 6, 1, 2, 5],
];

/// Renders a reel-stop vector the way it is hashed and tightly packed:
/// comma-joined decimal stops, no spaces.
pub fn reel_string(reel: &[u8]) -> String {
    reel.iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// One reel stop in 0..STRIP_LENGTH, drawn deterministically from a seed
/// hash and the reel position.
fn draw_stop(seed_hash: &str, position: usize) -> u8 {
    let digest = Sha256::digest(format!("{}{}", seed_hash, position).as_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(raw) % STRIP_LENGTH as u64) as u8
}

/// The house's full pre-committed schedule of reels for one channel.
#[derive(Debug, Clone)]
pub struct ReelPlan {
    seed_chain: HashChain,
    reels: Vec<Vec<u8>>,
    reel_hashes: Vec<String>,
}

impl ReelPlan {
    /// Derives the full plan from the house seed and the channel id.
    pub fn generate(house_seed: &str, channel_id: u64) -> Self {
        let blended = format!("{}{}", house_seed, channel_id);
        let seed_chain = HashChain::generate(&blended);

        let mut reels = Vec::with_capacity(seed_chain.len());
        let mut reel_hashes = Vec::with_capacity(seed_chain.len());
        for i in 0..seed_chain.len() {
            // seed_chain indices run forward; reveals consume them backward.
            let seed_hash = seed_chain
                .reveal_at((seed_chain.len() - i) as u64)
                .expect("index within chain");
            let reel: Vec<u8> = (0..NUM_REELS).map(|j| draw_stop(seed_hash, j)).collect();
            reel_hashes.push(crate::crypto::sha256_hex(&format!(
                "{}{}",
                seed_hash,
                reel_string(&reel)
            )));
            reels.push(reel);
        }

        ReelPlan {
            seed_chain,
            reels,
            reel_hashes,
        }
    }

    /// The seed-chain commitment published at activation.
    pub fn final_seed_hash(&self) -> &str {
        self.seed_chain.commitment()
    }

    /// The reel commitment published at activation.
    pub fn final_reel_hash(&self) -> &str {
        &self.reel_hashes[self.reel_hashes.len() - 1]
    }

    /// Seed-chain element consumed at round `nonce`.
    pub fn seed_hash_at(&self, nonce: u64) -> Option<&str> {
        self.seed_chain.reveal_at(nonce)
    }

    /// Predecessor disclosed alongside the round-`nonce` seed hash.
    pub fn prev_seed_hash_at(&self, nonce: u64) -> Option<&str> {
        self.seed_chain.prev_at(nonce)
    }

    /// The reel for round `nonce`.
    pub fn reel_at(&self, nonce: u64) -> Option<&[u8]> {
        let nonce = nonce as usize;
        if nonce == 0 || nonce > self.reels.len() {
            return None;
        }
        Some(&self.reels[self.reels.len() - nonce])
    }

    /// The reel hash for round `nonce`.
    pub fn reel_hash_at(&self, nonce: u64) -> Option<&str> {
        let nonce = nonce as usize;
        if nonce == 0 || nonce > self.reel_hashes.len() {
            return None;
        }
        Some(&self.reel_hashes[self.reel_hashes.len() - nonce])
    }
}
