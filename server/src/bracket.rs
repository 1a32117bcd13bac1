use gauntlet_types::constants::ROOM_REVEAL_LEAD_MS;
use gauntlet_types::{
    plan_first_round, Error, Match, Result, ScheduledJob, Tournament, TournamentKind,
    TournamentMutation, TournamentStatus,
};
use rand::seq::SliceRandom;
use serde::Serialize;
use uuid::Uuid;

use crate::Arena;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub tournament: Tournament,
    pub matches: Vec<Match>,
}

impl Arena {
    /// Seeds round one of a team tournament that has no bracket yet.
    ///
    /// Returns `None` when there is nothing to do: solo tournament, bracket
    /// already attached (possibly by a concurrent caller) or fewer than two
    /// teams.
    pub(crate) async fn generate_bracket(
        &self,
        tournament_id: &str,
        now_ms: u64,
    ) -> Result<Option<Vec<Match>>> {
        let tournament = self.tournament(tournament_id).await?;
        if tournament.kind != TournamentKind::Team || !tournament.match_ids.is_empty() {
            return Ok(None);
        }

        let mut entrants = tournament.registered_team_ids.clone();
        entrants.shuffle(&mut rand::thread_rng());
        let planned = plan_first_round(
            &tournament,
            &entrants,
            self.config.match_spacing_ms,
            || Uuid::new_v4().to_string(),
        );
        if planned.is_empty() {
            tracing::info!(tournament_id, teams = entrants.len(), "not enough teams for a bracket");
            return Ok(None);
        }

        let match_ids: Vec<_> = planned.iter().map(|game| game.id.clone()).collect();
        let claimed = self
            .stores
            .tournaments
            .update_tournament(
                tournament_id,
                TournamentMutation::AttachBracket {
                    match_ids: match_ids.clone(),
                },
            )
            .await?;
        if claimed.is_none() {
            tracing::debug!(tournament_id, "bracket already claimed");
            return Ok(None);
        }

        if let Err(err) = self.stores.tournaments.insert_matches(planned.clone()).await {
            tracing::error!(tournament_id, ?err, "match rows were not written, releasing bracket claim");
            let released = self
                .stores
                .tournaments
                .update_tournament(tournament_id, TournamentMutation::DetachBracket { match_ids })
                .await;
            if !matches!(released, Ok(Some(_))) {
                tracing::error!(tournament_id, ?released, "failed to release bracket claim");
            }
            return Err(err.into());
        }
        for game in &planned {
            let execute_at = game.start_time.saturating_sub(ROOM_REVEAL_LEAD_MS);
            let job = ScheduledJob::reveal_room(&game.id, execute_at, now_ms);
            if let Err(err) = self.stores.jobs.schedule(job).await {
                // The reveal sweep picks the match up regardless.
                tracing::warn!(tournament_id, match_id = %game.id, ?err, "failed to schedule room reveal");
            }
        }

        self.metrics().inc_bracket_generated();
        tracing::info!(
            tournament_id,
            matches = planned.len(),
            bye = entrants.len() % 2 == 1,
            "bracket generated"
        );
        Ok(Some(planned))
    }

    /// Closes registration now and seeds the bracket.
    pub async fn start_tournament(
        &self,
        tournament_id: &str,
        caller: &str,
        now_ms: u64,
    ) -> Result<StartOutcome> {
        self.require_admin(caller).await?;
        let tournament = self.tournament(tournament_id).await?;
        match tournament.status {
            TournamentStatus::Completed => {
                return Err(Error::InvalidState("tournament already completed".into()))
            }
            TournamentStatus::Upcoming => {
                let closed = self
                    .stores
                    .tournaments
                    .update_tournament(tournament_id, TournamentMutation::CloseRegistration)
                    .await?;
                if closed.is_some() {
                    tracing::info!(tournament_id, caller, "registration closed manually");
                }
            }
            TournamentStatus::Ongoing => {}
        }

        self.generate_bracket(tournament_id, now_ms).await?;
        let tournament = self.tournament(tournament_id).await?;
        let matches = self.matches(tournament_id, now_ms).await?;
        Ok(StartOutcome {
            tournament,
            matches,
        })
    }
}
