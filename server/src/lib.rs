use gauntlet_types::{Error, Match, Result, Tournament, UserId};
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

mod api;
pub use api::Api;

mod admission;
pub use admission::RegistrationOutcome;
mod bracket;
pub use bracket::StartOutcome;
pub mod collaborators;
pub mod config;
pub use config::ArenaConfig;
pub mod counters;
pub mod fixtures;
pub mod guard;
pub mod idempotency;
mod metrics;
pub use metrics::{ArenaCountersSnapshot, HttpRejectSnapshot, LatencySnapshot};
mod prizes;
pub use prizes::PrizeStatusView;
mod referral;
pub use referral::ReferralOutcome;
pub mod scheduler;
pub mod store;

use collaborators::{Collaborators, InMemoryDirectory, UserProfile};
use counters::{CounterBackend, InProcessCounters};
use guard::RateGuard;
use idempotency::IdempotencyLedger;
use metrics::{ArenaMetrics, HttpMetrics};
use store::Stores;

/// Milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub idempotency_purged: usize,
    pub counters_evicted: usize,
}

/// The tournament engine: admission, lifecycle and prize payout over a set of
/// stores and external collaborators.
pub struct Arena {
    config: ArenaConfig,
    stores: Stores,
    ledger: IdempotencyLedger,
    guard: RateGuard,
    collaborators: Collaborators,
    metrics: ArenaMetrics,
    http_metrics: HttpMetrics,
}

impl Arena {
    pub fn new(
        config: ArenaConfig,
        stores: Stores,
        collaborators: Collaborators,
        counters: Arc<dyn CounterBackend>,
    ) -> Self {
        let ledger = IdempotencyLedger::new(
            stores.idempotency.clone(),
            config.idempotency_ttl_ms,
            config.idempotency_body_limit_bytes,
        );
        Self {
            config,
            stores,
            ledger,
            guard: RateGuard::new(counters),
            collaborators,
            metrics: ArenaMetrics::default(),
            http_metrics: HttpMetrics::default(),
        }
    }

    /// Memory stores, in-process counters and `directory` for every collaborator.
    pub fn in_memory(config: ArenaConfig, directory: Arc<InMemoryDirectory>) -> Self {
        Self::new(
            config,
            Stores::memory(),
            Collaborators::from_directory(directory),
            Arc::new(InProcessCounters::new()),
        )
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    pub fn counters(&self) -> ArenaCountersSnapshot {
        self.metrics.counters()
    }

    pub fn latencies(&self) -> Vec<(&'static str, LatencySnapshot)> {
        self.metrics.latencies()
    }

    pub(crate) fn metrics(&self) -> &ArenaMetrics {
        &self.metrics
    }

    pub(crate) fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    pub async fn tournament(&self, tournament_id: &str) -> Result<Tournament> {
        self.stores
            .tournaments
            .tournament(tournament_id)
            .await?
            .ok_or(Error::NotFound("tournament"))
    }

    /// Bracket of a tournament with room credentials hidden outside their
    /// visibility window.
    pub async fn matches(&self, tournament_id: &str, now_ms: u64) -> Result<Vec<Match>> {
        self.tournament(tournament_id).await?;
        let matches = self.stores.tournaments.matches_for(tournament_id).await?;
        Ok(matches.iter().map(|game| game.public_view(now_ms)).collect())
    }

    /// Profile of an authenticated caller.
    pub(crate) async fn caller(&self, user_id: &str) -> Result<UserProfile> {
        self.collaborators
            .users
            .profile(user_id)
            .await?
            .ok_or(Error::Unauthorized)
    }

    pub(crate) async fn require_admin(&self, user_id: &str) -> Result<UserProfile> {
        let profile = self.caller(user_id).await?;
        if !profile.is_admin {
            return Err(Error::Forbidden("admin rights required".into()));
        }
        Ok(profile)
    }

    /// Purges expired idempotency records and evicts idle guard counters.
    pub async fn maintain(&self, now_ms: u64) -> MaintenanceReport {
        let idempotency_purged = match self.ledger.purge(now_ms).await {
            Ok(purged) => purged,
            Err(err) => {
                tracing::warn!(?err, "idempotency purge failed");
                0
            }
        };
        let counters_evicted = self.guard.sweep(now_ms).await;
        MaintenanceReport {
            idempotency_purged,
            counters_evicted,
        }
    }

    pub(crate) async fn notify_all(
        &self,
        user_ids: &[UserId],
        notification: collaborators::Notification,
    ) {
        for user_id in user_ids {
            self.collaborators
                .notifier
                .notify(user_id, notification.clone())
                .await;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::collaborators::Team;
    use gauntlet_types::{NewTournament, TournamentKind};

    pub const ADMIN: &str = "admin";

    pub fn arena() -> (Arc<Arena>, Arc<InMemoryDirectory>) {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.put_user(UserProfile {
            id: ADMIN.into(),
            is_admin: true,
            has_subscription: true,
            ..UserProfile::default()
        });
        let arena = Arc::new(Arena::in_memory(ArenaConfig::unthrottled(), directory.clone()));
        (arena, directory)
    }

    pub fn player(directory: &InMemoryDirectory, id: &str, free_entries: u32) {
        directory.put_user(UserProfile {
            id: id.into(),
            free_entries,
            email_verified: true,
            ..UserProfile::default()
        });
    }

    pub fn team(directory: &InMemoryDirectory, id: &str, tournament_id: &str, members: &[&str]) {
        for member in members {
            player(directory, member, 1);
        }
        directory.put_team(Team {
            id: id.into(),
            name: id.to_uppercase(),
            captain_id: members[0].into(),
            member_ids: members[1..].iter().map(|member| member.to_string()).collect(),
            tournament_id: Some(tournament_id.into()),
        });
    }

    pub async fn tournament(
        arena: &Arena,
        kind: TournamentKind,
        capacity_teams: u32,
        capacity_players: u32,
        prize_pool: u64,
    ) -> Tournament {
        arena
            .create_tournament(
                ADMIN,
                NewTournament {
                    name: "Cup".into(),
                    kind,
                    capacity_teams,
                    capacity_players,
                    start_date: 10_000_000,
                    end_date: 20_000_000,
                    prize_pool,
                },
                1_000,
            )
            .await
            .unwrap()
    }
}
