//! Conditional tournament writes.
//!
//! Every change to a [Tournament] is expressed as a [TournamentMutation]: a
//! guard ([TournamentMutation::matches]) and an update
//! ([TournamentMutation::apply]). Stores evaluate both inside one atomic
//! section, so a mutation either observes the state it expects and applies,
//! or leaves the document untouched. Callers that see "no match" re-read the
//! document to find out why; they never lock, read, check and then write.

use crate::prize::PrizeDistribution;
use crate::tournament::{
    MatchId, PrizeStatus, RequestStatus, TeamId, TeamRequest, Tournament, TournamentKind,
    TournamentStatus, UserId,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TournamentMutation {
    /// Add a player (and optionally their team) while under capacity. A
    /// pending request of a team entering this way is closed as approved,
    /// with the admitting user as reviewer.
    Admit {
        user_id: UserId,
        team_id: Option<TeamId>,
        at: u64,
    },
    /// Remove a player slot. `team_id` is also removed when given; admission
    /// uses this to undo a commit whose follow-up writes failed.
    Release {
        user_id: UserId,
        team_id: Option<TeamId>,
    },
    RequestTeamSlot {
        request: TeamRequest,
    },
    ApproveTeam {
        team_id: TeamId,
        roster: Vec<UserId>,
        reviewer_id: UserId,
        note: Option<String>,
        at: u64,
    },
    RejectTeam {
        team_id: TeamId,
        reviewer_id: UserId,
        note: Option<String>,
        at: u64,
    },
    CloseRegistration,
    AttachBracket {
        match_ids: Vec<MatchId>,
    },
    /// Undo of an attach whose match rows never landed.
    DetachBracket {
        match_ids: Vec<MatchId>,
    },
    Complete,
    BeginPrizeDistribution,
    FinishPrizeDistribution {
        distribution: PrizeDistribution,
    },
    RollbackPrizeDistribution,
}

impl TournamentMutation {
    pub fn name(&self) -> &'static str {
        match self {
            TournamentMutation::Admit { .. } => "admit",
            TournamentMutation::Release { .. } => "release",
            TournamentMutation::RequestTeamSlot { .. } => "request_team_slot",
            TournamentMutation::ApproveTeam { .. } => "approve_team",
            TournamentMutation::RejectTeam { .. } => "reject_team",
            TournamentMutation::CloseRegistration => "close_registration",
            TournamentMutation::AttachBracket { .. } => "attach_bracket",
            TournamentMutation::DetachBracket { .. } => "detach_bracket",
            TournamentMutation::Complete => "complete",
            TournamentMutation::BeginPrizeDistribution => "begin_prize_distribution",
            TournamentMutation::FinishPrizeDistribution { .. } => "finish_prize_distribution",
            TournamentMutation::RollbackPrizeDistribution => "rollback_prize_distribution",
        }
    }

    pub fn matches(&self, current: &Tournament) -> bool {
        match self {
            TournamentMutation::Admit {
                user_id, team_id, ..
            } => {
                current.accepts_registrations()
                    && !current.has_player(user_id)
                    && !current.players_full()
                    && team_id
                        .as_ref()
                        .map_or(true, |team| current.has_team(team) || !current.teams_full())
            }
            TournamentMutation::Release { user_id, .. } => {
                current.status == TournamentStatus::Upcoming && current.has_player(user_id)
            }
            TournamentMutation::RequestTeamSlot { request } => {
                current.accepts_registrations()
                    && current.open_request(&request.team_id).is_none()
                    && !current.has_team(&request.team_id)
            }
            TournamentMutation::ApproveTeam {
                team_id, roster, ..
            } => {
                let added = current.new_players(roster).len() as u32;
                current.accepts_registrations()
                    && current.pending_request(team_id).is_some()
                    && !current.has_team(team_id)
                    && !current.teams_full()
                    && current.player_count().saturating_add(added) <= current.capacity_players
            }
            TournamentMutation::RejectTeam { team_id, .. } => {
                current.pending_request(team_id).is_some() && !current.has_team(team_id)
            }
            TournamentMutation::CloseRegistration => {
                current.status == TournamentStatus::Upcoming
            }
            TournamentMutation::AttachBracket { .. } => {
                current.kind == TournamentKind::Team && current.match_ids.is_empty()
            }
            TournamentMutation::DetachBracket { match_ids } => {
                !match_ids.is_empty() && current.match_ids == *match_ids
            }
            TournamentMutation::Complete => current.status == TournamentStatus::Ongoing,
            TournamentMutation::BeginPrizeDistribution => {
                current.status == TournamentStatus::Completed
                    && current.prize_status == PrizeStatus::Pending
            }
            TournamentMutation::FinishPrizeDistribution { .. }
            | TournamentMutation::RollbackPrizeDistribution => {
                current.prize_status == PrizeStatus::Processing
            }
        }
    }

    /// Applies the update. Only call after [Self::matches] returned true under
    /// the same lock or transaction.
    pub fn apply(self, current: &mut Tournament) {
        match self {
            TournamentMutation::Admit {
                user_id,
                team_id,
                at,
            } => {
                current.registered_player_ids.push(user_id.clone());
                if let Some(team_id) = team_id {
                    if !current.has_team(&team_id) {
                        review(current, &team_id, RequestStatus::Approved, user_id, None, at);
                        current.registered_team_ids.push(team_id);
                    }
                }
            }
            TournamentMutation::Release { user_id, team_id } => {
                current.registered_player_ids.retain(|id| *id != user_id);
                if let Some(team_id) = team_id {
                    current.registered_team_ids.retain(|id| *id != team_id);
                }
            }
            TournamentMutation::RequestTeamSlot { request } => {
                current.pending_requests.push(request);
            }
            TournamentMutation::ApproveTeam {
                team_id,
                roster,
                reviewer_id,
                note,
                at,
            } => {
                let added: Vec<UserId> = current.new_players(&roster).into_iter().cloned().collect();
                current.registered_player_ids.extend(added);
                current.registered_team_ids.push(team_id.clone());
                review(current, &team_id, RequestStatus::Approved, reviewer_id, note, at);
            }
            TournamentMutation::RejectTeam {
                team_id,
                reviewer_id,
                note,
                at,
            } => {
                review(current, &team_id, RequestStatus::Rejected, reviewer_id, note, at);
            }
            TournamentMutation::CloseRegistration => {
                current.status = TournamentStatus::Ongoing;
                current.registration_open = false;
            }
            TournamentMutation::AttachBracket { match_ids } => {
                current.match_ids = match_ids;
            }
            TournamentMutation::DetachBracket { .. } => {
                current.match_ids.clear();
            }
            TournamentMutation::Complete => {
                current.status = TournamentStatus::Completed;
                current.registration_open = false;
            }
            TournamentMutation::BeginPrizeDistribution => {
                current.prize_status = PrizeStatus::Processing;
            }
            TournamentMutation::FinishPrizeDistribution { distribution } => {
                current.prize_status = PrizeStatus::Distributed;
                current.prize_distribution = Some(distribution);
            }
            TournamentMutation::RollbackPrizeDistribution => {
                current.prize_status = PrizeStatus::Pending;
            }
        }
    }
}

fn review(
    current: &mut Tournament,
    team_id: &str,
    status: RequestStatus,
    reviewer_id: UserId,
    note: Option<String>,
    at: u64,
) {
    if let Some(request) = current
        .pending_requests
        .iter_mut()
        .find(|request| request.team_id == team_id && request.status == RequestStatus::Pending)
    {
        request.status = status;
        request.reviewed_at = Some(at);
        request.reviewer_id = Some(reviewer_id);
        request.note = note;
    }
}
