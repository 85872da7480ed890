use anyhow::{bail, Context};
use chrono::{Duration, Utc};
use rand::Rng;
use tracing::info;

use reelchannel_core::reels::REEL_STRIPS;
use reelchannel_core::{
    crypto, ChannelManager, HashChain, HouseSession, Keypair, PlayerSession, SessionPools,
    DISPUTE_WINDOW_SECS, MAX_DEPOSIT, MIN_DEPOSIT, PAYTABLE, TOKEN,
};

/// Plays a complete channel lifecycle against an in-process house and prints
/// the round-by-round balances and the final settlement.
pub fn simulate(deposit_tokens: u64, rounds: u64, bet_tokens: Option<u64>) -> anyhow::Result<()> {
    let deposit = deposit_tokens
        .checked_mul(TOKEN)
        .context("deposit overflows")?;
    if !(MIN_DEPOSIT..=MAX_DEPOSIT).contains(&deposit) {
        bail!(
            "deposit must be between {} and {} tokens",
            MIN_DEPOSIT / TOKEN,
            MAX_DEPOSIT / TOKEN
        );
    }
    if let Some(bet) = bet_tokens {
        if !(1..=5).contains(&bet) {
            bail!("bet must be between 1 and 5 tokens");
        }
    }

    let player_keys = Keypair::generate();
    let house_keys = Keypair::generate();
    println!("player  {}", player_keys.address());
    println!("house   {}", house_keys.address());

    let mut pools = SessionPools::new(1);
    pools.fund_house(10 * deposit);
    pools.fund_user(player_keys.address(), 10 * deposit);
    let mut manager = ChannelManager::new(pools, house_keys.address());

    let id = manager.create_channel(player_keys.address(), deposit)?;
    let mut player = PlayerSession::new(id, player_keys.clone(), deposit)?;
    let funding = player.funding_params().clone();
    manager.deposit_channel(
        id,
        player_keys.address(),
        funding.sealed_number.clone(),
        funding.final_user_hash.clone(),
    )?;

    let mut house = HouseSession::new(
        id,
        house_keys.clone(),
        deposit,
        player_keys.address(),
        &funding.final_user_hash,
        &crypto::random_secret(),
    )?;
    let (seed_hash, reel_hash) = {
        let (s, r) = house.commitments();
        (s.to_string(), r.to_string())
    };
    manager.activate_channel(id, house_keys.address(), seed_hash.clone(), reel_hash.clone())?;
    player.observe_activation(house.address(), &seed_hash, &reel_hash)?;
    info!(channel = id, deposit_tokens, "channel activated");

    let mut rng = rand::thread_rng();
    for round in 1..=rounds {
        let bet = bet_tokens.unwrap_or_else(|| rng.gen_range(1..=5)) * TOKEN;
        let proposal = player.propose_spin(bet)?;
        let response = house.process_spin(proposal)?;
        let reel = response.reel.clone();
        player.apply_house_spin(response)?;

        let (user, house_side) = player.balances();
        println!(
            "round {:>3}  bet {}  reel {:?}  player {:.2}  house {:.2}",
            round,
            bet / TOKEN,
            reel,
            user as f64 / TOKEN as f64,
            house_side as f64 / TOKEN as f64,
        );
        if user == 0 || house_side == 0 {
            println!("a side is out of funds, stopping early");
            break;
        }
    }

    let (p, h) = match player.latest_pair() {
        Some((p, h)) => (p.clone(), h.clone()),
        None => bail!("no rounds were played"),
    };
    let now = Utc::now();
    manager.finalize(id, player_keys.address(), &p, Some(&h), now)?;
    house.mark_finalized();

    let after_window = now + Duration::seconds(DISPUTE_WINDOW_SECS + 1);
    let player_take = manager.claim(id, player_keys.address(), after_window)?;
    let house_take = manager.claim(id, house_keys.address(), after_window)?;

    println!();
    println!("settled at nonce {}", h.nonce);
    println!(
        "player claimed {:.2} tokens ({:+.2})",
        player_take as f64 / TOKEN as f64,
        (player_take as i64 - deposit as i64) as f64 / TOKEN as f64,
    );
    println!(
        "house claimed  {:.2} tokens ({:+.2})",
        house_take as f64 / TOKEN as f64,
        (house_take as i64 - deposit as i64) as f64 / TOKEN as f64,
    );
    Ok(())
}

/// Prints the reel strips and the symbol paytable.
pub fn show_paytable() -> anyhow::Result<()> {
    println!("reel strips:");
    for (i, strip) in REEL_STRIPS.iter().enumerate() {
        println!("  reel {}: {:?}", i, strip);
    }
    println!();
    println!("paytable (reward per symbol, whole tokens, x(run-2)):");
    for (symbol, reward) in PAYTABLE.iter().enumerate().skip(1) {
        println!("  symbol {}: {}", symbol, reward);
    }
    Ok(())
}

/// Builds the commit-reveal chain for a seed and prints the commitment.
pub fn show_commitment(seed: &str) -> anyhow::Result<()> {
    let chain = HashChain::generate(seed);
    println!("chain length {}", chain.len());
    println!("commitment   {}", chain.commitment());
    Ok(())
}
