//! Lifecycle scheduler.
//!
//! One poll loop per process drives tournaments through
//! `upcoming -> ongoing -> completed`, seeds brackets, closes abandoned
//! matches, reveals room credentials and runs due jobs. Every step is
//! conditioned on the state it expects, so a second sweep over the same
//! state is a no-op and concurrent schedulers never double-apply.

use gauntlet_types::{
    JobKind, Match, MatchMutation, PrizeStatus, Result, RoomCredentials, ScheduledJob,
    TournamentMutation, TournamentStatus,
};
use rand::distributions::{Alphanumeric, DistString};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::{now_ms, Arena};

const ROOM_PASSWORD_LEN: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub registrations_closed: usize,
    pub brackets_generated: usize,
    pub tournaments_completed: usize,
    pub prize_jobs_scheduled: usize,
    pub matches_force_completed: usize,
    pub credentials_revealed: usize,
    pub jobs_executed: usize,
    pub job_failures: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == SweepReport::default()
    }
}

impl Arena {
    /// Runs every lifecycle step once against `now_ms`.
    pub async fn sweep(&self, now_ms: u64) -> SweepReport {
        let start = Instant::now();
        let mut report = SweepReport::default();
        self.close_expired_registrations(now_ms, &mut report).await;
        self.generate_missing_brackets(now_ms, &mut report).await;
        self.complete_finished_tournaments(now_ms, &mut report).await;
        self.close_stale_matches(now_ms, &mut report).await;
        self.reveal_due_credentials(now_ms, &mut report).await;
        self.run_due_jobs(now_ms, &mut report).await;
        self.metrics().record_sweep(start.elapsed());
        if !report.is_idle() {
            info!(?report, "lifecycle sweep");
        }
        report
    }

    async fn close_expired_registrations(&self, now_ms: u64, report: &mut SweepReport) {
        let upcoming = match self
            .stores
            .tournaments
            .tournaments(Some(TournamentStatus::Upcoming))
            .await
        {
            Ok(upcoming) => upcoming,
            Err(err) => {
                warn!(?err, "failed to list upcoming tournaments");
                report.errors += 1;
                return;
            }
        };
        for tournament in upcoming.into_iter().filter(|t| t.start_date <= now_ms) {
            match self
                .stores
                .tournaments
                .update_tournament(&tournament.id, TournamentMutation::CloseRegistration)
                .await
            {
                Ok(Some(_)) => {
                    report.registrations_closed += 1;
                    info!(tournament_id = %tournament.id, "registration closed");
                    self.seed_bracket(&tournament.id, now_ms, report).await;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(tournament_id = %tournament.id, ?err, "failed to close registration");
                    report.errors += 1;
                }
            }
        }
    }

    async fn generate_missing_brackets(&self, now_ms: u64, report: &mut SweepReport) {
        let ongoing = match self
            .stores
            .tournaments
            .tournaments(Some(TournamentStatus::Ongoing))
            .await
        {
            Ok(ongoing) => ongoing,
            Err(err) => {
                warn!(?err, "failed to list ongoing tournaments");
                report.errors += 1;
                return;
            }
        };
        for tournament in ongoing {
            // Single-team brackets stay empty; skip the write attempt.
            if tournament.match_ids.is_empty() && tournament.team_count() >= 2 {
                self.seed_bracket(&tournament.id, now_ms, report).await;
            }
        }
    }

    async fn seed_bracket(&self, tournament_id: &str, now_ms: u64, report: &mut SweepReport) {
        match self.generate_bracket(tournament_id, now_ms).await {
            Ok(Some(_)) => report.brackets_generated += 1,
            Ok(None) => {}
            Err(err) => {
                warn!(tournament_id, ?err, "bracket generation failed");
                report.errors += 1;
            }
        }
    }

    async fn complete_finished_tournaments(&self, now_ms: u64, report: &mut SweepReport) {
        let ongoing = match self
            .stores
            .tournaments
            .tournaments(Some(TournamentStatus::Ongoing))
            .await
        {
            Ok(ongoing) => ongoing,
            Err(err) => {
                warn!(?err, "failed to list ongoing tournaments");
                report.errors += 1;
                return;
            }
        };
        for tournament in ongoing.into_iter().filter(|t| t.end_date <= now_ms) {
            let completed = match self
                .stores
                .tournaments
                .update_tournament(&tournament.id, TournamentMutation::Complete)
                .await
            {
                Ok(Some(completed)) => completed,
                Ok(None) => continue,
                Err(err) => {
                    warn!(tournament_id = %tournament.id, ?err, "failed to complete tournament");
                    report.errors += 1;
                    continue;
                }
            };
            report.tournaments_completed += 1;
            info!(tournament_id = %completed.id, "tournament completed");
            if completed.prize_pool == 0 {
                continue;
            }
            let execute_at = now_ms.saturating_add(self.config.prize_distribution_delay_ms);
            let job = ScheduledJob::distribute_prizes(&completed.id, execute_at, now_ms);
            match self.stores.jobs.schedule(job).await {
                Ok(true) => {
                    report.prize_jobs_scheduled += 1;
                    info!(tournament_id = %completed.id, execute_at, "prize distribution scheduled");
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(tournament_id = %completed.id, ?err, "failed to schedule prize distribution");
                    report.errors += 1;
                }
            }
        }
    }

    async fn close_stale_matches(&self, now_ms: u64, report: &mut SweepReport) {
        let open = match self.stores.tournaments.open_matches().await {
            Ok(open) => open,
            Err(err) => {
                warn!(?err, "failed to list open matches");
                report.errors += 1;
                return;
            }
        };
        let mut closed = 0usize;
        for game in open.into_iter().filter(|game| game.is_stale(now_ms)) {
            match self
                .stores
                .tournaments
                .update_match(&game.id, MatchMutation::ForceComplete { at: now_ms })
                .await
            {
                Ok(Some(_)) => {
                    closed += 1;
                    info!(match_id = %game.id, tournament_id = %game.tournament_id, "stale match closed");
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(match_id = %game.id, ?err, "failed to close stale match");
                    report.errors += 1;
                }
            }
        }
        report.matches_force_completed += closed;
        self.metrics().add_matches_force_completed(closed as u64);
    }

    async fn reveal_due_credentials(&self, now_ms: u64, report: &mut SweepReport) {
        let open = match self.stores.tournaments.open_matches().await {
            Ok(open) => open,
            Err(err) => {
                warn!(?err, "failed to list open matches");
                report.errors += 1;
                return;
            }
        };
        for game in open.into_iter().filter(|game| game.needs_credentials(now_ms)) {
            match self.reveal_credentials(&game.id, now_ms).await {
                Ok(Some(_)) => report.credentials_revealed += 1,
                Ok(None) => {}
                Err(err) => {
                    warn!(match_id = %game.id, ?err, "failed to reveal room credentials");
                    report.errors += 1;
                }
            }
        }
    }

    /// Attaches fresh room credentials to a match whose reveal window opened.
    /// Returns `None` when the match is not due, closed or already has them.
    pub async fn reveal_credentials(&self, match_id: &str, now_ms: u64) -> Result<Option<Match>> {
        let Some(game) = self.stores.tournaments.match_by_id(match_id).await? else {
            return Ok(None);
        };
        if !game.needs_credentials(now_ms) {
            return Ok(None);
        }
        let (visible_at, expires_at) = game.reveal_window(now_ms);
        let credentials = {
            let mut rng = rand::thread_rng();
            RoomCredentials {
                room_id: rng.gen_range(100_000..1_000_000u32).to_string(),
                password: Alphanumeric.sample_string(&mut rng, ROOM_PASSWORD_LEN),
                generated_at: now_ms,
                visible_at,
                expires_at,
            }
        };
        let updated = self
            .stores
            .tournaments
            .update_match(match_id, MatchMutation::AttachCredentials { credentials })
            .await?;
        if updated.is_some() {
            self.metrics().add_room_credentials_revealed(1);
            info!(match_id, tournament_id = %game.tournament_id, visible_at, "room credentials generated");
        }
        Ok(updated)
    }

    async fn run_due_jobs(&self, now_ms: u64, report: &mut SweepReport) {
        let due = match self.stores.jobs.due_jobs(now_ms).await {
            Ok(due) => due,
            Err(err) => {
                warn!(?err, "failed to list due jobs");
                report.errors += 1;
                return;
            }
        };
        for job in due {
            // Whoever removes the job owns the run.
            match self.stores.jobs.take_job(&job.id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(job_id = %job.id, ?err, "failed to take job");
                    report.errors += 1;
                    continue;
                }
            }
            match self.run_job(&job, now_ms).await {
                Ok(()) => {
                    report.jobs_executed += 1;
                    self.metrics().inc_job_executed();
                    debug!(job_id = %job.id, "job executed");
                }
                Err(err) => {
                    report.job_failures += 1;
                    self.metrics().inc_job_failure();
                    error!(job_id = %job.id, ?err, "job failed; not requeued");
                }
            }
        }
    }

    async fn run_job(&self, job: &ScheduledJob, now_ms: u64) -> Result<()> {
        match &job.kind {
            JobKind::DistributePrizes { tournament_id } => {
                let tournament = self.tournament(tournament_id).await?;
                if tournament.prize_status == PrizeStatus::Distributed {
                    debug!(tournament_id, "prizes already distributed manually");
                    return Ok(());
                }
                self.distribute_prizes(tournament_id, now_ms).await?;
            }
            JobKind::RevealRoomCredentials { match_id } => {
                self.reveal_credentials(match_id, now_ms).await?;
            }
        }
        Ok(())
    }
}

/// Sweeps on the configured interval until the process exits.
pub async fn run_lifecycle(arena: Arc<Arena>) {
    info!(interval_ms = arena.config().sweep_interval_ms, "lifecycle scheduler online");
    let mut ticker = interval(arena.config().sweep_interval());
    loop {
        ticker.tick().await;
        arena.sweep(now_ms()).await;
    }
}

/// Purges expired idempotency records and idle guard counters.
pub async fn run_maintenance(arena: Arc<Arena>) {
    let mut ticker = interval(arena.config().maintenance_interval());
    loop {
        ticker.tick().await;
        let report = arena.maintain(now_ms()).await;
        if report.idempotency_purged > 0 || report.counters_evicted > 0 {
            info!(?report, "maintenance");
        }
    }
}
