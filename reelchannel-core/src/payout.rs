//! Payout evaluation: line extraction, run rewards and bet-size
//! normalization.

use crate::error::{ChannelError, Result};
use crate::reels::{NUM_LINES, NUM_REELS, REEL_STRIPS, STRIP_LENGTH};

/// Base monetary unit: one whole token in micro-tokens.
pub const TOKEN: u64 = 1_000_000;

/// Reward multiplier per symbol, indexed by symbol value (1..=7).
pub const PAYTABLE: [u64; 8] = [0, 10, 20, 40, 50, 75, 150, 300];

/// Normalizes a bet size to the number of active lines (1-5).
///
/// Valid bets are exact whole-token multiples 1-5, tenths 0.1-0.5 or
/// hundredths 0.01-0.05; anything else is invalid. The scales are checked
/// whole-unit first, matching the original validation order.
pub fn adjusted_bet_size(bet_size: u64) -> Option<u64> {
    for scale in [1u64, 10, 100] {
        let scaled = bet_size.checked_mul(scale)?;
        if scaled % TOKEN == 0 {
            let units = scaled / TOKEN;
            if (1..=5).contains(&units) {
                return Some(units);
            }
        }
    }
    None
}

/// Symbol on `reel_index` at a stop position, with wraparound at the strip
/// boundaries.
fn symbol_at(reel_index: usize, position: i32) -> u8 {
    let position = if position == STRIP_LENGTH as i32 {
        0
    } else if position == -1 {
        STRIP_LENGTH as i32 - 1
    } else {
        position
    };
    REEL_STRIPS[reel_index][position as usize]
}

/// Extracts the five paylines from a reel-stop vector: one straight line,
/// two full-offset lines and two zig-zags (offset at positions 0, 2, 4).
pub fn extract_lines(stops: &[u8]) -> [[u8; NUM_REELS]; NUM_LINES] {
    let mut lines = [[0u8; NUM_REELS]; NUM_LINES];
    for i in 0..NUM_REELS {
        let stop = stops[i] as i32;
        lines[0][i] = symbol_at(i, stop);
        lines[1][i] = symbol_at(i, stop - 1);
        lines[2][i] = symbol_at(i, stop + 1);
        lines[3][i] = match i {
            0 | 4 => symbol_at(i, stop - 1),
            2 => symbol_at(i, stop + 1),
            _ => symbol_at(i, stop),
        };
        lines[4][i] = match i {
            0 | 4 => symbol_at(i, stop + 1),
            2 => symbol_at(i, stop - 1),
            _ => symbol_at(i, stop),
        };
    }
    lines
}

/// Reward multiplier for one line: a run of at least three consecutive
/// matching symbols from the first position pays
/// `paytable[symbol] * (run - 2)`.
pub fn line_reward(line: &[u8; NUM_REELS]) -> u64 {
    let mut run = 1;
    for i in 1..NUM_REELS {
        if line[i] == line[i - 1] {
            run += 1;
        } else {
            break;
        }
    }
    if run >= 3 {
        PAYTABLE[line[0] as usize] * (run as u64 - 2)
    } else {
        0
    }
}

/// Total payout in micro-tokens for a reel-stop vector and bet size.
///
/// The bet size selects how many of the five lines are active; rewards are
/// denominated in whole tokens regardless of the bet scale.
pub fn reel_payout(stops: &[u8], bet_size: u64) -> Result<u64> {
    let active_lines = adjusted_bet_size(bet_size).ok_or(ChannelError::InvalidBetSize(bet_size))?;
    if stops.len() != NUM_REELS {
        return Err(ChannelError::InvalidReel(format!(
            "expected {} stops, got {}",
            NUM_REELS,
            stops.len()
        )));
    }
    if let Some(&bad) = stops.iter().find(|&&s| s as usize >= STRIP_LENGTH) {
        return Err(ChannelError::InvalidReel(format!(
            "stop {} outside the strip",
            bad
        )));
    }

    let lines = extract_lines(stops);
    let reward: u64 = lines
        .iter()
        .take(active_lines as usize)
        .map(line_reward)
        .sum();
    Ok(reward * TOKEN)
}

/// Applies one round's transfer to the channel balances.
///
/// The player pays the bet and receives the payout; the house mirrors both.
/// A balance driven below zero is clamped to zero and the deficit moved to
/// the other side, so no party can extract more than the channel holds and
/// the sum of both balances is conserved.
pub fn apply_round(
    user_balance: u64,
    house_balance: u64,
    bet_size: u64,
    payout: u64,
) -> (u64, u64) {
    let mut user = user_balance as i128 + payout as i128 - bet_size as i128;
    let mut house = house_balance as i128 - payout as i128 + bet_size as i128;
    if user <= 0 {
        house += user;
        user = 0;
    } else if house <= 0 {
        user += house;
        house = 0;
    }
    (user as u64, house as u64)
}
