use serde::{Deserialize, Serialize};

use crate::tournament::{MatchId, TournamentId};

/// Work the scheduler runs once its time comes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobKind {
    #[serde(rename_all = "camelCase")]
    DistributePrizes { tournament_id: TournamentId },
    #[serde(rename_all = "camelCase")]
    RevealRoomCredentials { match_id: MatchId },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub id: String,
    pub execute_at: u64,
    pub kind: JobKind,
    pub created_at: u64,
}

impl ScheduledJob {
    pub fn distribute_prizes(tournament_id: &str, execute_at: u64, now_ms: u64) -> Self {
        Self {
            id: format!("prizes:{tournament_id}"),
            execute_at,
            kind: JobKind::DistributePrizes {
                tournament_id: tournament_id.to_string(),
            },
            created_at: now_ms,
        }
    }

    pub fn reveal_room(match_id: &str, execute_at: u64, now_ms: u64) -> Self {
        Self {
            id: format!("room:{match_id}"),
            execute_at,
            kind: JobKind::RevealRoomCredentials {
                match_id: match_id.to_string(),
            },
            created_at: now_ms,
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.execute_at <= now_ms
    }
}
