use async_trait::async_trait;
use gauntlet_types::{
    IdempotencyRecord, IdempotencyStatus, Match, MatchId, MatchMutation, RecordKey,
    RegistrationStatus, ScheduledJob, Tournament, TournamentId, TournamentMutation,
    TournamentRegistration, TournamentStatus, UserId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::{Claim, IdempotencyStore, JobStore, StoreError, TournamentStore};

#[derive(Default)]
struct State {
    tournaments: BTreeMap<TournamentId, Tournament>,
    registrations: BTreeMap<(TournamentId, UserId), TournamentRegistration>,
    matches: BTreeMap<MatchId, Match>,
    idempotency: HashMap<RecordKey, IdempotencyRecord>,
    jobs: BTreeMap<String, ScheduledJob>,
}

/// Process-local store. Conditional writes run under the write lock.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    fail_match_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `insert_matches` fail until switched off again.
    pub fn fail_match_inserts(&self, fail: bool) {
        self.fail_match_inserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TournamentStore for MemoryStore {
    async fn insert_tournament(&self, tournament: Tournament) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.tournaments.contains_key(&tournament.id) {
            return Err(StoreError::Duplicate(format!("tournament {}", tournament.id)));
        }
        state.tournaments.insert(tournament.id.clone(), tournament);
        Ok(())
    }

    async fn tournament(&self, id: &str) -> Result<Option<Tournament>, StoreError> {
        Ok(self.state.read().await.tournaments.get(id).cloned())
    }

    async fn tournaments(
        &self,
        status: Option<TournamentStatus>,
    ) -> Result<Vec<Tournament>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .tournaments
            .values()
            .filter(|tournament| status.map_or(true, |status| tournament.status == status))
            .cloned()
            .collect())
    }

    async fn update_tournament(
        &self,
        id: &str,
        mutation: TournamentMutation,
    ) -> Result<Option<Tournament>, StoreError> {
        let mut state = self.state.write().await;
        let Some(tournament) = state.tournaments.get_mut(id) else {
            return Ok(None);
        };
        if !mutation.matches(tournament) {
            return Ok(None);
        }
        mutation.apply(tournament);
        Ok(Some(tournament.clone()))
    }

    async fn upsert_registration(
        &self,
        registration: TournamentRegistration,
    ) -> Result<TournamentRegistration, StoreError> {
        let mut state = self.state.write().await;
        let key = (
            registration.tournament_id.clone(),
            registration.user_id.clone(),
        );
        let row = match state.registrations.get_mut(&key) {
            Some(existing) => {
                existing.merge(registration);
                existing.clone()
            }
            None => {
                state.registrations.insert(key, registration.clone());
                registration
            }
        };
        Ok(row)
    }

    async fn registration(
        &self,
        tournament_id: &str,
        user_id: &str,
    ) -> Result<Option<TournamentRegistration>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .registrations
            .get(&(tournament_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn registrations(
        &self,
        tournament_id: &str,
    ) -> Result<Vec<TournamentRegistration>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .registrations
            .values()
            .filter(|row| row.tournament_id == tournament_id)
            .cloned()
            .collect())
    }

    async fn set_team_registration_status(
        &self,
        tournament_id: &str,
        team_id: &str,
        from: RegistrationStatus,
        to: RegistrationStatus,
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let mut touched = 0;
        for row in state.registrations.values_mut() {
            if row.tournament_id == tournament_id
                && row.team_id.as_deref() == Some(team_id)
                && row.status == from
            {
                row.status = to;
                row.updated_at = now_ms;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn insert_matches(&self, matches: Vec<Match>) -> Result<(), StoreError> {
        if self.fail_match_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("match writes disabled".into()));
        }
        let mut state = self.state.write().await;
        if let Some(existing) = matches.iter().find(|m| state.matches.contains_key(&m.id)) {
            return Err(StoreError::Duplicate(format!("match {}", existing.id)));
        }
        for game in matches {
            state.matches.insert(game.id.clone(), game);
        }
        Ok(())
    }

    async fn match_by_id(&self, id: &str) -> Result<Option<Match>, StoreError> {
        Ok(self.state.read().await.matches.get(id).cloned())
    }

    async fn matches_for(&self, tournament_id: &str) -> Result<Vec<Match>, StoreError> {
        let state = self.state.read().await;
        let mut matches: Vec<Match> = state
            .matches
            .values()
            .filter(|game| game.tournament_id == tournament_id)
            .cloned()
            .collect();
        matches.sort_by(|a, b| (a.round, a.start_time).cmp(&(b.round, b.start_time)));
        Ok(matches)
    }

    async fn open_matches(&self) -> Result<Vec<Match>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .matches
            .values()
            .filter(|game| game.is_open())
            .cloned()
            .collect())
    }

    async fn update_match(
        &self,
        id: &str,
        mutation: MatchMutation,
    ) -> Result<Option<Match>, StoreError> {
        let mut state = self.state.write().await;
        let Some(game) = state.matches.get_mut(id) else {
            return Ok(None);
        };
        if !mutation.matches(game) {
            return Ok(None);
        }
        mutation.apply(game);
        Ok(Some(game.clone()))
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn claim(&self, record: IdempotencyRecord, now_ms: u64) -> Result<Claim, StoreError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.idempotency.get(&record.key) {
            if !existing.is_expired(now_ms) {
                return Ok(Claim::Existing(existing.clone()));
            }
        }
        state.idempotency.insert(record.key.clone(), record);
        Ok(Claim::Claimed)
    }

    async fn reclaim_failed(
        &self,
        key: &RecordKey,
        request_hash: &str,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let Some(record) = state.idempotency.get_mut(key) else {
            return Ok(false);
        };
        if record.status != IdempotencyStatus::Failed
            || record.request_hash != request_hash
            || record.is_expired(now_ms)
        {
            return Ok(false);
        }
        record.status = IdempotencyStatus::Processing;
        record.response_code = None;
        record.response_body = None;
        record.expires_at = now_ms.saturating_add(ttl_ms);
        Ok(true)
    }

    async fn finish(
        &self,
        key: &RecordKey,
        status: IdempotencyStatus,
        response_code: u16,
        response_body: Vec<u8>,
        expires_at: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(record) = state.idempotency.get_mut(key) {
            record.status = status;
            record.response_code = Some(response_code);
            record.response_body = Some(response_body);
            record.expires_at = expires_at;
        }
        Ok(())
    }

    async fn purge_expired(&self, now_ms: u64) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, record| !record.is_expired(now_ms));
        Ok(before - state.idempotency.len())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn schedule(&self, job: ScheduledJob) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Ok(false);
        }
        state.jobs.insert(job.id.clone(), job);
        Ok(true)
    }

    async fn due_jobs(&self, now_ms: u64) -> Result<Vec<ScheduledJob>, StoreError> {
        let state = self.state.read().await;
        let mut due: Vec<ScheduledJob> = state
            .jobs
            .values()
            .filter(|job| job.is_due(now_ms))
            .cloned()
            .collect();
        due.sort_by_key(|job| job.execute_at);
        Ok(due)
    }

    async fn take_job(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.state.write().await.jobs.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_types::{IdempotencyKey, NewTournament, TournamentKind};
    use std::sync::Arc;

    fn solo(capacity: u32) -> Tournament {
        Tournament::create(
            "t1".into(),
            NewTournament {
                name: "Solo Cup".into(),
                kind: TournamentKind::Solo,
                capacity_teams: 0,
                capacity_players: capacity,
                start_date: 1_000,
                end_date: 2_000,
                prize_pool: 0,
            },
            0,
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn conditional_admit_never_overfills() {
        let store = Arc::new(MemoryStore::new());
        store.insert_tournament(solo(5)).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_tournament(
                        "t1",
                        TournamentMutation::Admit {
                            user_id: format!("u{i}"),
                            team_id: None,
                            at: 1,
                        },
                    )
                    .await
                    .unwrap()
                    .is_some()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        let tournament = store.tournament("t1").await.unwrap().unwrap();
        assert_eq!(tournament.registered_player_ids.len(), 5);
    }

    #[tokio::test]
    async fn duplicate_tournament_rejected() {
        let store = MemoryStore::new();
        store.insert_tournament(solo(2)).await.unwrap();
        assert!(matches!(
            store.insert_tournament(solo(2)).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn claim_replaces_only_expired_records() {
        let store = MemoryStore::new();
        let key = RecordKey::new(&IdempotencyKey::parse("key-00000001").unwrap(), "s", "u");
        let record = IdempotencyRecord::processing(key.clone(), "h".into(), 0, 100);
        assert_eq!(store.claim(record.clone(), 0).await.unwrap(), Claim::Claimed);
        assert!(matches!(
            store.claim(record.clone(), 50).await.unwrap(),
            Claim::Existing(_)
        ));
        let fresh = IdempotencyRecord::processing(key, "h2".into(), 100, 100);
        assert_eq!(store.claim(fresh, 100).await.unwrap(), Claim::Claimed);
    }

    #[tokio::test]
    async fn failed_record_is_reclaimed_once() {
        let store = MemoryStore::new();
        let key = RecordKey::new(&IdempotencyKey::parse("key-00000002").unwrap(), "s", "u");
        store
            .claim(IdempotencyRecord::processing(key.clone(), "h".into(), 0, 100), 0)
            .await
            .unwrap();
        assert!(!store.reclaim_failed(&key, "h", 1, 100).await.unwrap());
        store
            .finish(&key, IdempotencyStatus::Failed, 500, b"{}".to_vec(), 100)
            .await
            .unwrap();
        assert!(!store.reclaim_failed(&key, "other", 1, 100).await.unwrap());
        assert!(store.reclaim_failed(&key, "h", 1, 100).await.unwrap());
        assert!(!store.reclaim_failed(&key, "h", 2, 100).await.unwrap());
    }

    #[tokio::test]
    async fn jobs_insert_if_absent_and_take_once() {
        let store = MemoryStore::new();
        assert!(store
            .schedule(ScheduledJob::distribute_prizes("t1", 10, 0))
            .await
            .unwrap());
        assert!(!store
            .schedule(ScheduledJob::distribute_prizes("t1", 99, 0))
            .await
            .unwrap());
        assert!(store.due_jobs(9).await.unwrap().is_empty());
        let due = store.due_jobs(10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(store.take_job(&due[0].id).await.unwrap());
        assert!(!store.take_job(&due[0].id).await.unwrap());
    }

    #[tokio::test]
    async fn registration_upsert_merges() {
        let store = MemoryStore::new();
        let row = TournamentRegistration::new(
            "u1".into(),
            "t1".into(),
            Some("red".into()),
            gauntlet_types::RegistrationRole::Member,
            RegistrationStatus::Pending,
            1,
        );
        store.upsert_registration(row.clone()).await.unwrap();
        let mut newer = row.clone();
        newer.status = RegistrationStatus::Active;
        newer.updated_at = 5;
        let merged = store.upsert_registration(newer).await.unwrap();
        assert_eq!(merged.created_at, 1);
        assert_eq!(merged.status, RegistrationStatus::Active);

        // Active rows are left alone.
        let touched = store
            .set_team_registration_status(
                "t1",
                "red",
                RegistrationStatus::Pending,
                RegistrationStatus::Rejected,
                9,
            )
            .await
            .unwrap();
        assert_eq!(touched, 0);
        let mut pending = row;
        pending.status = RegistrationStatus::Pending;
        pending.updated_at = 6;
        store.upsert_registration(pending).await.unwrap();
        let touched = store
            .set_team_registration_status(
                "t1",
                "red",
                RegistrationStatus::Pending,
                RegistrationStatus::Rejected,
                9,
            )
            .await
            .unwrap();
        assert_eq!(touched, 1);
        let row = store.registration("t1", "u1").await.unwrap().unwrap();
        assert_eq!(row.status, RegistrationStatus::Rejected);
    }
}
