use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::prize::PrizeDistribution;

pub type TournamentId = String;
pub type UserId = String;
pub type TeamId = String;
pub type MatchId = String;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TournamentStatus {
    #[default]
    #[serde(alias = "open")]
    Upcoming,
    Ongoing,
    Completed,
}

impl TournamentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TournamentStatus::Upcoming => "upcoming",
            TournamentStatus::Ongoing => "ongoing",
            TournamentStatus::Completed => "completed",
        }
    }
}

impl FromStr for TournamentStatus {
    type Err = &'static str;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "upcoming" | "open" => Ok(Self::Upcoming),
            "ongoing" => Ok(Self::Ongoing),
            "completed" => Ok(Self::Completed),
            _ => Err("valid values: upcoming, open, ongoing, completed"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TournamentKind {
    #[default]
    Solo,
    Team,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl FromStr for RequestStatus {
    type Err = &'static str;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err("valid values: pending, approved, rejected"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrizeStatus {
    #[default]
    Pending,
    Processing,
    Distributed,
}

/// A team's request to enter a team tournament, awaiting admin review.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamRequest {
    pub team_id: TeamId,
    pub requested_by: UserId,
    pub status: RequestStatus,
    pub requested_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TeamRequest {
    pub fn pending(team_id: TeamId, requested_by: UserId, requested_at: u64) -> Self {
        Self {
            team_id,
            requested_by,
            status: RequestStatus::Pending,
            requested_at,
            reviewed_at: None,
            reviewer_id: None,
            note: None,
        }
    }
}

/// Admin input for creating a tournament.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTournament {
    pub name: String,
    #[serde(default)]
    pub kind: TournamentKind,
    #[serde(default)]
    pub capacity_teams: u32,
    pub capacity_players: u32,
    pub start_date: u64,
    pub end_date: u64,
    #[serde(default)]
    pub prize_pool: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tournament {
    pub id: TournamentId,
    pub name: String,
    pub kind: TournamentKind,
    pub status: TournamentStatus,
    pub registration_open: bool,
    pub capacity_teams: u32,
    pub capacity_players: u32,
    #[serde(default)]
    pub registered_team_ids: Vec<TeamId>,
    #[serde(default)]
    pub registered_player_ids: Vec<UserId>,
    #[serde(default)]
    pub pending_requests: Vec<TeamRequest>,
    pub start_date: u64,
    pub end_date: u64,
    #[serde(default)]
    pub prize_pool: u64,
    #[serde(default)]
    pub prize_status: PrizeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prize_distribution: Option<PrizeDistribution>,
    #[serde(default)]
    pub match_ids: Vec<MatchId>,
    pub created_at: u64,
}

impl Tournament {
    pub fn create(id: TournamentId, input: NewTournament, now_ms: u64) -> Result<Self> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(Error::Validation("tournament name is required".into()));
        }
        if input.capacity_players == 0 {
            return Err(Error::Validation("capacityPlayers must be > 0".into()));
        }
        if input.kind == TournamentKind::Team && input.capacity_teams == 0 {
            return Err(Error::Validation(
                "capacityTeams must be > 0 for team tournaments".into(),
            ));
        }
        if input.end_date <= input.start_date {
            return Err(Error::Validation("endDate must be after startDate".into()));
        }

        Ok(Self {
            id,
            name: name.to_string(),
            kind: input.kind,
            status: TournamentStatus::Upcoming,
            registration_open: true,
            capacity_teams: input.capacity_teams,
            capacity_players: input.capacity_players,
            registered_team_ids: Vec::new(),
            registered_player_ids: Vec::new(),
            pending_requests: Vec::new(),
            start_date: input.start_date,
            end_date: input.end_date,
            prize_pool: input.prize_pool,
            prize_status: PrizeStatus::Pending,
            prize_distribution: None,
            match_ids: Vec::new(),
            created_at: now_ms,
        })
    }

    pub fn accepts_registrations(&self) -> bool {
        self.status == TournamentStatus::Upcoming && self.registration_open
    }

    pub fn has_player(&self, user_id: &str) -> bool {
        self.registered_player_ids.iter().any(|id| id == user_id)
    }

    pub fn has_team(&self, team_id: &str) -> bool {
        self.registered_team_ids.iter().any(|id| id == team_id)
    }

    pub fn player_count(&self) -> u32 {
        self.registered_player_ids.len() as u32
    }

    pub fn team_count(&self) -> u32 {
        self.registered_team_ids.len() as u32
    }

    pub fn players_full(&self) -> bool {
        self.player_count() >= self.capacity_players
    }

    pub fn teams_full(&self) -> bool {
        self.team_count() >= self.capacity_teams
    }

    /// A pending request, or an approved one while the team still holds its
    /// slot. A team that was approved and later released may ask again.
    pub fn open_request(&self, team_id: &str) -> Option<&TeamRequest> {
        let registered = self.has_team(team_id);
        self.pending_requests
            .iter()
            .filter(|request| request.team_id == team_id)
            .find(|request| match request.status {
                RequestStatus::Pending => true,
                RequestStatus::Approved => registered,
                RequestStatus::Rejected => false,
            })
    }

    pub fn pending_request(&self, team_id: &str) -> Option<&TeamRequest> {
        self.pending_requests
            .iter()
            .find(|request| request.team_id == team_id && request.status == RequestStatus::Pending)
    }

    pub fn requests(&self, status: Option<RequestStatus>) -> Vec<TeamRequest> {
        self.pending_requests
            .iter()
            .filter(|request| status.map_or(true, |status| request.status == status))
            .cloned()
            .collect()
    }

    /// Roster members that would be new to the player list.
    pub fn new_players<'a>(&self, roster: &'a [UserId]) -> Vec<&'a UserId> {
        let mut seen: Vec<&UserId> = Vec::with_capacity(roster.len());
        for user_id in roster {
            if !self.has_player(user_id) && !seen.contains(&user_id) {
                seen.push(user_id);
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_input(kind: TournamentKind) -> NewTournament {
        NewTournament {
            name: "Friday Cup".to_string(),
            kind,
            capacity_teams: 4,
            capacity_players: 16,
            start_date: 10_000,
            end_date: 20_000,
            prize_pool: 1_000,
        }
    }

    #[test]
    fn create_validates_input() {
        let tournament =
            Tournament::create("t1".into(), new_input(TournamentKind::Team), 5).unwrap();
        assert!(tournament.accepts_registrations());
        assert_eq!(tournament.created_at, 5);

        let mut input = new_input(TournamentKind::Team);
        input.capacity_teams = 0;
        assert!(matches!(
            Tournament::create("t1".into(), input, 5),
            Err(Error::Validation(_))
        ));

        let mut input = new_input(TournamentKind::Solo);
        input.end_date = input.start_date;
        assert!(Tournament::create("t1".into(), input, 5).is_err());

        let mut input = new_input(TournamentKind::Solo);
        input.name = "   ".into();
        assert!(Tournament::create("t1".into(), input, 5).is_err());
    }

    #[test]
    fn open_alias_parses_as_upcoming() {
        assert_eq!("open".parse::<TournamentStatus>(), Ok(TournamentStatus::Upcoming));
        let status: TournamentStatus = serde_json::from_str("\"open\"").unwrap();
        assert_eq!(status, TournamentStatus::Upcoming);
        assert!("closed".parse::<TournamentStatus>().is_err());
    }

    #[test]
    fn rejected_requests_do_not_block() {
        let mut tournament =
            Tournament::create("t1".into(), new_input(TournamentKind::Team), 0).unwrap();
        let mut request = TeamRequest::pending("team-a".into(), "u1".into(), 1);
        request.status = RequestStatus::Rejected;
        tournament.pending_requests.push(request);
        assert!(tournament.open_request("team-a").is_none());
        assert_eq!(tournament.requests(Some(RequestStatus::Rejected)).len(), 1);
        assert!(tournament.requests(Some(RequestStatus::Pending)).is_empty());
        assert_eq!(tournament.requests(None).len(), 1);
    }

    #[test]
    fn approved_request_blocks_only_while_registered() {
        let mut tournament =
            Tournament::create("t1".into(), new_input(TournamentKind::Team), 0).unwrap();
        let mut request = TeamRequest::pending("team-a".into(), "u1".into(), 1);
        request.status = RequestStatus::Approved;
        tournament.pending_requests.push(request);
        assert!(tournament.open_request("team-a").is_none());
        tournament.registered_team_ids.push("team-a".into());
        assert_eq!(
            tournament.open_request("team-a").map(|r| r.status),
            Some(RequestStatus::Approved)
        );
    }

    #[test]
    fn new_players_skips_known_and_duplicates() {
        let mut tournament =
            Tournament::create("t1".into(), new_input(TournamentKind::Team), 0).unwrap();
        tournament.registered_player_ids.push("u1".into());
        let roster = vec!["u1".to_string(), "u2".to_string(), "u2".to_string()];
        assert_eq!(tournament.new_players(&roster), vec![&"u2".to_string()]);
    }

    #[test]
    fn serializes_camel_case() {
        let tournament =
            Tournament::create("t1".into(), new_input(TournamentKind::Solo), 0).unwrap();
        let value = serde_json::to_value(&tournament).unwrap();
        assert_eq!(value["registrationOpen"], true);
        assert_eq!(value["prizeStatus"], "pending");
        assert!(value.get("prizeDistribution").is_none());
    }
}
