use serde::{Deserialize, Serialize};

use crate::tournament::{TeamId, TournamentId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationRole {
    Owner,
    Member,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Pending,
    Active,
    Left,
    Removed,
    Rejected,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Pending => "pending",
            RegistrationStatus::Active => "active",
            RegistrationStatus::Left => "left",
            RegistrationStatus::Removed => "removed",
            RegistrationStatus::Rejected => "rejected",
        }
    }
}

/// Per-user join record. Rows are never deleted; they only change status so
/// the history of a user's participation stays auditable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentRegistration {
    pub user_id: UserId,
    pub tournament_id: TournamentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
    pub role: RegistrationRole,
    pub status: RegistrationStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl TournamentRegistration {
    pub fn new(
        user_id: UserId,
        tournament_id: TournamentId,
        team_id: Option<TeamId>,
        role: RegistrationRole,
        status: RegistrationStatus,
        now_ms: u64,
    ) -> Self {
        Self {
            user_id,
            tournament_id,
            team_id,
            role,
            status,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Folds a newer write for the same `(user, tournament)` into this row,
    /// keeping the original creation time.
    pub fn merge(&mut self, newer: TournamentRegistration) {
        self.team_id = newer.team_id;
        self.role = newer.role;
        self.status = newer.status;
        self.updated_at = newer.updated_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_creation_time() {
        let mut row = TournamentRegistration::new(
            "u1".into(),
            "t1".into(),
            Some("team".into()),
            RegistrationRole::Member,
            RegistrationStatus::Pending,
            10,
        );
        row.merge(TournamentRegistration::new(
            "u1".into(),
            "t1".into(),
            Some("team".into()),
            RegistrationRole::Owner,
            RegistrationStatus::Active,
            20,
        ));
        assert_eq!(row.created_at, 10);
        assert_eq!(row.updated_at, 20);
        assert_eq!(row.status, RegistrationStatus::Active);
        assert_eq!(row.role, RegistrationRole::Owner);
    }
}
