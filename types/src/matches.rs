//! Matches, first-round bracket planning and room credentials.

use serde::{Deserialize, Serialize};

use crate::constants::{ROOM_CREDENTIAL_TTL_MS, ROOM_REVEAL_LEAD_MS, STALE_MATCH_AFTER_MS};
use crate::tournament::{MatchId, TeamId, Tournament, TournamentId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    #[default]
    Scheduled,
    #[serde(alias = "in_progress")]
    Live,
    Completed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchScore {
    pub team1: u32,
    pub team2: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCredentials {
    pub room_id: String,
    pub password: String,
    pub generated_at: u64,
    pub visible_at: u64,
    pub expires_at: u64,
}

impl RoomCredentials {
    pub fn is_visible(&self, now_ms: u64) -> bool {
        now_ms >= self.visible_at && now_ms < self.expires_at
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub id: MatchId,
    pub tournament_id: TournamentId,
    pub round: u32,
    pub team1: TeamId,
    pub team2: TeamId,
    pub status: MatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<MatchScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<TeamId>,
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_credentials: Option<RoomCredentials>,
}

impl Match {
    pub fn is_open(&self) -> bool {
        self.status != MatchStatus::Completed
    }

    /// Open matches abandoned long enough after their start to be closed.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        self.is_open() && self.start_time.saturating_add(STALE_MATCH_AFTER_MS) <= now_ms
    }

    /// True once the reveal window opened and no credentials exist yet.
    pub fn needs_credentials(&self, now_ms: u64) -> bool {
        self.is_open()
            && self.room_credentials.is_none()
            && self.start_time.saturating_sub(ROOM_REVEAL_LEAD_MS) <= now_ms
            && !self.is_stale(now_ms)
    }

    /// `(visible_at, expires_at)` for credentials generated at `now_ms`.
    pub fn reveal_window(&self, now_ms: u64) -> (u64, u64) {
        let visible_at = self.start_time.saturating_sub(ROOM_REVEAL_LEAD_MS).max(now_ms);
        let expires_at = self.start_time.saturating_add(ROOM_CREDENTIAL_TTL_MS);
        (visible_at, expires_at)
    }

    /// Copy safe to hand to clients: credentials are withheld outside their
    /// visibility window.
    pub fn public_view(&self, now_ms: u64) -> Match {
        let mut view = self.clone();
        if !view
            .room_credentials
            .as_ref()
            .is_some_and(|credentials| credentials.is_visible(now_ms))
        {
            view.room_credentials = None;
        }
        view
    }
}

/// Conditional match writes, evaluated atomically by the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchMutation {
    ForceComplete { at: u64 },
    AttachCredentials { credentials: RoomCredentials },
}

impl MatchMutation {
    pub fn name(&self) -> &'static str {
        match self {
            MatchMutation::ForceComplete { .. } => "force_complete",
            MatchMutation::AttachCredentials { .. } => "attach_credentials",
        }
    }

    pub fn matches(&self, current: &Match) -> bool {
        match self {
            MatchMutation::ForceComplete { .. } => current.is_open(),
            MatchMutation::AttachCredentials { .. } => {
                current.is_open() && current.room_credentials.is_none()
            }
        }
    }

    pub fn apply(self, current: &mut Match) {
        match self {
            MatchMutation::ForceComplete { at } => {
                current.status = MatchStatus::Completed;
                current.completed_at = Some(at);
            }
            MatchMutation::AttachCredentials { credentials } => {
                current.room_credentials = Some(credentials);
            }
        }
    }
}

/// Pairs entrants in order: (0, 1), (2, 3), ... An odd entrant out is
/// returned separately and gets no first-round match.
pub fn pair_sequentially(entrants: &[TeamId]) -> (Vec<(TeamId, TeamId)>, Option<TeamId>) {
    let pairs = entrants
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    let bye = entrants.chunks_exact(2).remainder().first().cloned();
    (pairs, bye)
}

/// Builds round-one matches from an already shuffled entrant list. Match `i`
/// starts `i * spacing_ms` after the tournament start.
pub fn plan_first_round(
    tournament: &Tournament,
    shuffled: &[TeamId],
    spacing_ms: u64,
    mut next_id: impl FnMut() -> MatchId,
) -> Vec<Match> {
    let (pairs, _) = pair_sequentially(shuffled);
    pairs
        .into_iter()
        .enumerate()
        .map(|(index, (team1, team2))| Match {
            id: next_id(),
            tournament_id: tournament.id.clone(),
            round: 1,
            team1,
            team2,
            status: MatchStatus::Scheduled,
            score: None,
            winner_id: None,
            start_time: tournament
                .start_date
                .saturating_add(spacing_ms.saturating_mul(index as u64)),
            completed_at: None,
            room_credentials: None,
        })
        .collect()
}
