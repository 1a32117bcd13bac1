use anyhow::Context;
use gauntlet_types::{NewTournament, Standing, Tournament, TournamentId, UserId};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::collaborators::{InMemoryDirectory, Team, UserProfile};
use crate::store::Stores;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentFixture {
    pub id: TournamentId,
    #[serde(flatten)]
    pub input: NewTournament,
}

/// Seed data for the development binary.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Fixtures {
    pub users: Vec<UserProfile>,
    pub teams: Vec<Team>,
    /// Referral code -> owning user.
    pub referral_codes: HashMap<String, UserId>,
    pub banned: Vec<UserId>,
    pub standings: HashMap<TournamentId, Vec<Standing>>,
    pub tournaments: Vec<TournamentFixture>,
}

impl Fixtures {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read fixtures {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse fixtures {}", path.display()))
    }

    /// Loads users, teams and referral data into `directory` and inserts
    /// tournaments that do not exist yet.
    pub async fn seed(
        self,
        directory: &InMemoryDirectory,
        stores: &Stores,
        now_ms: u64,
    ) -> anyhow::Result<()> {
        let (users, teams) = (self.users.len(), self.teams.len());
        for user in self.users {
            directory.put_user(user);
        }
        for team in self.teams {
            directory.put_team(team);
        }
        for (code, user_id) in &self.referral_codes {
            directory.add_referral_code(code, user_id);
        }
        for user_id in &self.banned {
            directory.ban(user_id);
        }
        for (tournament_id, standings) in self.standings {
            directory.set_standings(&tournament_id, standings);
        }

        let mut inserted = 0usize;
        for fixture in self.tournaments {
            if stores.tournaments.tournament(&fixture.id).await?.is_some() {
                continue;
            }
            let tournament = Tournament::create(fixture.id.clone(), fixture.input, now_ms)
                .with_context(|| format!("invalid fixture tournament {}", fixture.id))?;
            stores.tournaments.insert_tournament(tournament).await?;
            inserted += 1;
        }
        tracing::info!(users, teams, tournaments = inserted, "fixtures seeded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "users": [{"id": "admin", "isAdmin": true}, {"id": "u1", "freeEntries": 2}],
        "teams": [{"id": "red", "name": "Red", "captainId": "u1", "memberIds": ["u2"]}],
        "referralCodes": {"abc123": "u1"},
        "tournaments": [{
            "id": "cup", "name": "Cup", "kind": "team", "capacityTeams": 4,
            "capacityPlayers": 16, "startDate": 1000, "endDate": 2000
        }]
    }"#;

    #[tokio::test]
    async fn seeds_directory_and_store() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let fixtures = Fixtures::load(file.path()).unwrap();

        let directory = InMemoryDirectory::new();
        let stores = Stores::memory();
        fixtures.seed(&directory, &stores, 5).await.unwrap();

        assert!(directory.user("admin").unwrap().is_admin);
        assert_eq!(directory.user("u1").unwrap().free_entries, 2);
        let cup = stores.tournaments.tournament("cup").await.unwrap().unwrap();
        assert_eq!(cup.capacity_teams, 4);
        assert_eq!(cup.created_at, 5);

        // Reseeding keeps existing tournaments.
        let again = Fixtures::load(file.path()).unwrap();
        again.seed(&directory, &stores, 9).await.unwrap();
        let cup = stores.tournaments.tournament("cup").await.unwrap().unwrap();
        assert_eq!(cup.created_at, 5);
    }
}
