//! Persistence seams.
//!
//! Stores only offer document-level atomicity: every conditional write
//! evaluates its guard and applies its update inside one critical section
//! (the memory store's write lock, a SQLite `BEGIN IMMEDIATE` transaction).
//! Nothing above this layer takes locks.

use async_trait::async_trait;
use gauntlet_types::{
    IdempotencyRecord, IdempotencyStatus, Match, MatchMutation, RecordKey, RegistrationStatus,
    ScheduledJob, Tournament, TournamentMutation, TournamentRegistration, TournamentStatus,
};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate {0}")]
    Duplicate(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store connection poisoned")]
    Poisoned,
    #[error("blocking task failed: {0}")]
    Task(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for gauntlet_types::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(what) => gauntlet_types::Error::Conflict(format!("duplicate {what}")),
            other => gauntlet_types::Error::Transient(other.to_string()),
        }
    }
}

/// Outcome of trying to claim an idempotency key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the `processing` record.
    Claimed,
    /// A live record already exists.
    Existing(IdempotencyRecord),
}

#[async_trait]
pub trait TournamentStore: Send + Sync {
    async fn insert_tournament(&self, tournament: Tournament) -> Result<(), StoreError>;

    async fn tournament(&self, id: &str) -> Result<Option<Tournament>, StoreError>;

    async fn tournaments(
        &self,
        status: Option<TournamentStatus>,
    ) -> Result<Vec<Tournament>, StoreError>;

    /// Applies `mutation` if its guard holds. Returns the updated document, or
    /// `None` when the tournament is missing or the guard did not match.
    async fn update_tournament(
        &self,
        id: &str,
        mutation: TournamentMutation,
    ) -> Result<Option<Tournament>, StoreError>;

    /// Inserts the row or folds it into the existing `(user, tournament)` row.
    async fn upsert_registration(
        &self,
        registration: TournamentRegistration,
    ) -> Result<TournamentRegistration, StoreError>;

    async fn registration(
        &self,
        tournament_id: &str,
        user_id: &str,
    ) -> Result<Option<TournamentRegistration>, StoreError>;

    async fn registrations(
        &self,
        tournament_id: &str,
    ) -> Result<Vec<TournamentRegistration>, StoreError>;

    /// Moves the rows of `(tournament, team)` currently in `from` to `to`.
    /// Returns the rows touched.
    async fn set_team_registration_status(
        &self,
        tournament_id: &str,
        team_id: &str,
        from: RegistrationStatus,
        to: RegistrationStatus,
        now_ms: u64,
    ) -> Result<usize, StoreError>;

    async fn insert_matches(&self, matches: Vec<Match>) -> Result<(), StoreError>;

    async fn match_by_id(&self, id: &str) -> Result<Option<Match>, StoreError>;

    async fn matches_for(&self, tournament_id: &str) -> Result<Vec<Match>, StoreError>;

    /// Matches that are scheduled or live.
    async fn open_matches(&self) -> Result<Vec<Match>, StoreError>;

    async fn update_match(
        &self,
        id: &str,
        mutation: MatchMutation,
    ) -> Result<Option<Match>, StoreError>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Inserts `record` unless a live record with the same key exists. An
    /// expired record is replaced.
    async fn claim(&self, record: IdempotencyRecord, now_ms: u64) -> Result<Claim, StoreError>;

    /// Moves a live `failed` record with a matching hash back to `processing`.
    /// Exactly one of several concurrent callers gets `true`.
    async fn reclaim_failed(
        &self,
        key: &RecordKey,
        request_hash: &str,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<bool, StoreError>;

    async fn finish(
        &self,
        key: &RecordKey,
        status: IdempotencyStatus,
        response_code: u16,
        response_body: Vec<u8>,
        expires_at: u64,
    ) -> Result<(), StoreError>;

    async fn purge_expired(&self, now_ms: u64) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert-if-absent by job id. Returns whether the job was inserted.
    async fn schedule(&self, job: ScheduledJob) -> Result<bool, StoreError>;

    async fn due_jobs(&self, now_ms: u64) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Removes the job. Only the caller that gets `true` may run it.
    async fn take_job(&self, id: &str) -> Result<bool, StoreError>;
}

/// The three stores an [crate::Arena] runs on. Both backends implement all of
/// them over shared state.
#[derive(Clone)]
pub struct Stores {
    pub tournaments: Arc<dyn TournamentStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub jobs: Arc<dyn JobStore>,
}

impl Stores {
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::default());
        Self {
            tournaments: store.clone(),
            idempotency: store.clone(),
            jobs: store,
        }
    }

    pub fn sqlite(path: &Path) -> Result<Self, StoreError> {
        let store = Arc::new(SqliteStore::open(path)?);
        Ok(Self {
            tournaments: store.clone(),
            idempotency: store.clone(),
            jobs: store,
        })
    }
}
