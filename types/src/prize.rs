//! Prize pool arithmetic.
//!
//! The pool is split 50/30/20 across the top three standings. Splits and
//! roster divisions use integer arithmetic; remainders are assigned
//! deterministically so every unit of a share is paid to someone.

use serde::{Deserialize, Serialize};

use crate::constants::{BPS_DENOMINATOR, PRIZE_SPLIT_BPS};
use crate::tournament::{TeamId, UserId};

/// Who finished in a given position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Participant {
    Player { user_id: UserId },
    Team { team_id: TeamId },
}

impl Participant {
    pub fn id(&self) -> &str {
        match self {
            Participant::Player { user_id } => user_id,
            Participant::Team { team_id } => team_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standing {
    pub position: u32,
    pub participant: Participant,
}

/// One position's slice of the pool before roster division.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrizeShare {
    pub position: u32,
    pub participant: Participant,
    pub amount: u64,
}

/// A single ledger credit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrizePayout {
    pub position: u32,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
    pub amount: u64,
    pub reference: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrizeDistribution {
    pub pool: u64,
    pub payouts: Vec<PrizePayout>,
    /// Share of the pool left unpaid because fewer than three positions were ranked.
    #[serde(default)]
    pub undistributed: u64,
    pub distributed_at: u64,
}

/// Splits `pool` across positions 1..=3.
///
/// Positions outside 1..=3 are ignored; a position missing from `standings`
/// leaves its share unpaid. Rounding dust goes to first place when present.
pub fn split_pool(pool: u64, standings: &[Standing]) -> Vec<PrizeShare> {
    let mut ranked: Vec<&Standing> = standings
        .iter()
        .filter(|standing| (1..=PRIZE_SPLIT_BPS.len() as u32).contains(&standing.position))
        .collect();
    ranked.sort_by_key(|standing| standing.position);
    ranked.dedup_by_key(|standing| standing.position);

    let amounts: Vec<u64> = PRIZE_SPLIT_BPS
        .iter()
        .map(|bps| ((pool as u128 * *bps as u128) / BPS_DENOMINATOR as u128) as u64)
        .collect();
    let dust = pool.saturating_sub(amounts.iter().sum());

    ranked
        .into_iter()
        .map(|standing| {
            let index = (standing.position - 1) as usize;
            let mut amount = amounts[index];
            if standing.position == 1 {
                amount = amount.saturating_add(dust);
            }
            PrizeShare {
                position: standing.position,
                participant: standing.participant.clone(),
                amount,
            }
        })
        .collect()
}

/// Divides `amount` equally across `roster`; the remainder is handed out one
/// unit at a time in roster order.
pub fn divide_among(amount: u64, roster: &[UserId]) -> Vec<(UserId, u64)> {
    if roster.is_empty() {
        return Vec::new();
    }
    let count = roster.len() as u64;
    let base = amount / count;
    let remainder = amount % count;
    roster
        .iter()
        .enumerate()
        .map(|(index, user_id)| {
            let bonus = u64::from((index as u64) < remainder);
            (user_id.clone(), base + bonus)
        })
        .collect()
}

/// Reference under which a payout is credited; the ledger applies each
/// reference at most once.
pub fn credit_reference(tournament_id: &str, position: u32, payee: &str) -> String {
    format!("prize:{tournament_id}:{position}:{payee}")
}
