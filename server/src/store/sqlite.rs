use async_trait::async_trait;
use gauntlet_types::{
    IdempotencyRecord, IdempotencyStatus, Match, MatchMutation, RecordKey, RegistrationStatus,
    ScheduledJob, Tournament, TournamentMutation, TournamentRegistration, TournamentStatus,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{Claim, IdempotencyStore, JobStore, StoreError, TournamentStore};

/// SQLite-backed store. Rows hold JSON documents next to the columns used for
/// lookups; conditional writes run in `BEGIN IMMEDIATE` transactions so the
/// guard and the update see the same snapshot.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        init_schema_sqlite(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

fn init_schema_sqlite(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         CREATE TABLE IF NOT EXISTS tournaments (
             id TEXT PRIMARY KEY,
             status TEXT NOT NULL,
             doc TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS registrations (
             tournament_id TEXT NOT NULL,
             user_id TEXT NOT NULL,
             team_id TEXT,
             doc TEXT NOT NULL,
             PRIMARY KEY (tournament_id, user_id)
         );
         CREATE INDEX IF NOT EXISTS registrations_team
             ON registrations (tournament_id, team_id);
         CREATE TABLE IF NOT EXISTS matches (
             id TEXT PRIMARY KEY,
             tournament_id TEXT NOT NULL,
             open INTEGER NOT NULL,
             doc TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS matches_tournament ON matches (tournament_id);
         CREATE TABLE IF NOT EXISTS idempotency_records (
             key TEXT NOT NULL,
             scope TEXT NOT NULL,
             caller TEXT NOT NULL,
             expires_at INTEGER NOT NULL,
             doc TEXT NOT NULL,
             PRIMARY KEY (key, scope, caller)
         );
         CREATE INDEX IF NOT EXISTS idempotency_expiry ON idempotency_records (expires_at);
         CREATE TABLE IF NOT EXISTS scheduled_jobs (
             id TEXT PRIMARY KEY,
             execute_at INTEGER NOT NULL,
             doc TEXT NOT NULL
         );",
    )?;
    Ok(())
}

fn decode<T: DeserializeOwned>(doc: String) -> Result<T, StoreError> {
    Ok(serde_json::from_str(&doc)?)
}

fn load_tournament(conn: &Connection, id: &str) -> Result<Option<Tournament>, StoreError> {
    conn.query_row("SELECT doc FROM tournaments WHERE id = ?", [id], |row| {
        row.get::<_, String>(0)
    })
    .optional()?
    .map(decode)
    .transpose()
}

fn save_tournament(conn: &Connection, tournament: &Tournament) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE tournaments SET status = ?, doc = ? WHERE id = ?",
        params![
            tournament.status.as_str(),
            serde_json::to_string(tournament)?,
            tournament.id
        ],
    )?;
    Ok(())
}

fn load_match(conn: &Connection, id: &str) -> Result<Option<Match>, StoreError> {
    conn.query_row("SELECT doc FROM matches WHERE id = ?", [id], |row| {
        row.get::<_, String>(0)
    })
    .optional()?
    .map(decode)
    .transpose()
}

fn load_record(conn: &Connection, key: &RecordKey) -> Result<Option<IdempotencyRecord>, StoreError> {
    conn.query_row(
        "SELECT doc FROM idempotency_records WHERE key = ? AND scope = ? AND caller = ?",
        params![key.key, key.scope, key.caller],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(decode)
    .transpose()
}

fn save_record(conn: &Connection, record: &IdempotencyRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO idempotency_records (key, scope, caller, expires_at, doc)
         VALUES (?, ?, ?, ?, ?)",
        params![
            record.key.key,
            record.key.scope,
            record.key.caller,
            record.expires_at as i64,
            serde_json::to_string(record)?
        ],
    )?;
    Ok(())
}

fn collect_docs<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<T>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |row| row.get::<_, String>(0))?;
    let mut docs = Vec::new();
    for row in rows {
        docs.push(decode(row?)?);
    }
    Ok(docs)
}

#[async_trait]
impl TournamentStore for SqliteStore {
    async fn insert_tournament(&self, tournament: Tournament) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO tournaments (id, status, doc) VALUES (?, ?, ?)",
                params![
                    tournament.id,
                    tournament.status.as_str(),
                    serde_json::to_string(&tournament)?
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Duplicate(format!("tournament {}", tournament.id)));
            }
            Ok(())
        })
        .await
    }

    async fn tournament(&self, id: &str) -> Result<Option<Tournament>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| load_tournament(conn, &id)).await
    }

    async fn tournaments(
        &self,
        status: Option<TournamentStatus>,
    ) -> Result<Vec<Tournament>, StoreError> {
        self.with_conn(move |conn| match status {
            Some(status) => collect_docs(
                conn,
                "SELECT doc FROM tournaments WHERE status = ? ORDER BY id",
                [status.as_str()],
            ),
            None => collect_docs(conn, "SELECT doc FROM tournaments ORDER BY id", []),
        })
        .await
    }

    async fn update_tournament(
        &self,
        id: &str,
        mutation: TournamentMutation,
    ) -> Result<Option<Tournament>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut tournament) = load_tournament(&tx, &id)? else {
                return Ok(None);
            };
            if !mutation.matches(&tournament) {
                return Ok(None);
            }
            mutation.apply(&mut tournament);
            save_tournament(&tx, &tournament)?;
            tx.commit()?;
            Ok(Some(tournament))
        })
        .await
    }

    async fn upsert_registration(
        &self,
        registration: TournamentRegistration,
    ) -> Result<TournamentRegistration, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing: Option<TournamentRegistration> = tx
                .query_row(
                    "SELECT doc FROM registrations WHERE tournament_id = ? AND user_id = ?",
                    params![registration.tournament_id, registration.user_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .map(decode)
                .transpose()?;
            let row = match existing {
                Some(mut existing) => {
                    existing.merge(registration);
                    existing
                }
                None => registration,
            };
            tx.execute(
                "INSERT OR REPLACE INTO registrations (tournament_id, user_id, team_id, doc)
                 VALUES (?, ?, ?, ?)",
                params![
                    row.tournament_id,
                    row.user_id,
                    row.team_id,
                    serde_json::to_string(&row)?
                ],
            )?;
            tx.commit()?;
            Ok(row)
        })
        .await
    }

    async fn registration(
        &self,
        tournament_id: &str,
        user_id: &str,
    ) -> Result<Option<TournamentRegistration>, StoreError> {
        let tournament_id = tournament_id.to_string();
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT doc FROM registrations WHERE tournament_id = ? AND user_id = ?",
                params![tournament_id, user_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(decode)
            .transpose()
        })
        .await
    }

    async fn registrations(
        &self,
        tournament_id: &str,
    ) -> Result<Vec<TournamentRegistration>, StoreError> {
        let tournament_id = tournament_id.to_string();
        self.with_conn(move |conn| {
            collect_docs(
                conn,
                "SELECT doc FROM registrations WHERE tournament_id = ? ORDER BY user_id",
                [tournament_id],
            )
        })
        .await
    }

    async fn set_team_registration_status(
        &self,
        tournament_id: &str,
        team_id: &str,
        from: RegistrationStatus,
        to: RegistrationStatus,
        now_ms: u64,
    ) -> Result<usize, StoreError> {
        let tournament_id = tournament_id.to_string();
        let team_id = team_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut rows: Vec<TournamentRegistration> = collect_docs(
                &tx,
                "SELECT doc FROM registrations WHERE tournament_id = ? AND team_id = ?",
                params![tournament_id, team_id],
            )?;
            rows.retain(|row| row.status == from);
            for mut row in rows.iter().cloned() {
                row.status = to;
                row.updated_at = now_ms;
                tx.execute(
                    "UPDATE registrations SET doc = ? WHERE tournament_id = ? AND user_id = ?",
                    params![serde_json::to_string(&row)?, row.tournament_id, row.user_id],
                )?;
            }
            tx.commit()?;
            Ok(rows.len())
        })
        .await
    }

    async fn insert_matches(&self, matches: Vec<Match>) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for game in &matches {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO matches (id, tournament_id, open, doc) VALUES (?, ?, ?, ?)",
                    params![
                        game.id,
                        game.tournament_id,
                        game.is_open(),
                        serde_json::to_string(game)?
                    ],
                )?;
                if inserted == 0 {
                    return Err(StoreError::Duplicate(format!("match {}", game.id)));
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn match_by_id(&self, id: &str) -> Result<Option<Match>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| load_match(conn, &id)).await
    }

    async fn matches_for(&self, tournament_id: &str) -> Result<Vec<Match>, StoreError> {
        let tournament_id = tournament_id.to_string();
        self.with_conn(move |conn| {
            let mut matches: Vec<Match> = collect_docs(
                conn,
                "SELECT doc FROM matches WHERE tournament_id = ?",
                [tournament_id],
            )?;
            matches.sort_by(|a, b| (a.round, a.start_time).cmp(&(b.round, b.start_time)));
            Ok(matches)
        })
        .await
    }

    async fn open_matches(&self) -> Result<Vec<Match>, StoreError> {
        self.with_conn(|conn| {
            collect_docs(conn, "SELECT doc FROM matches WHERE open = 1 ORDER BY id", [])
        })
        .await
    }

    async fn update_match(
        &self,
        id: &str,
        mutation: MatchMutation,
    ) -> Result<Option<Match>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut game) = load_match(&tx, &id)? else {
                return Ok(None);
            };
            if !mutation.matches(&game) {
                return Ok(None);
            }
            mutation.apply(&mut game);
            tx.execute(
                "UPDATE matches SET open = ?, doc = ? WHERE id = ?",
                params![game.is_open(), serde_json::to_string(&game)?, game.id],
            )?;
            tx.commit()?;
            Ok(Some(game))
        })
        .await
    }
}

#[async_trait]
impl IdempotencyStore for SqliteStore {
    async fn claim(&self, record: IdempotencyRecord, now_ms: u64) -> Result<Claim, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(existing) = load_record(&tx, &record.key)? {
                if !existing.is_expired(now_ms) {
                    return Ok(Claim::Existing(existing));
                }
            }
            save_record(&tx, &record)?;
            tx.commit()?;
            Ok(Claim::Claimed)
        })
        .await
    }

    async fn reclaim_failed(
        &self,
        key: &RecordKey,
        request_hash: &str,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let key = key.clone();
        let request_hash = request_hash.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut record) = load_record(&tx, &key)? else {
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
            save_record(&tx, &record)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn finish(
        &self,
        key: &RecordKey,
        status: IdempotencyStatus,
        response_code: u16,
        response_body: Vec<u8>,
        expires_at: u64,
    ) -> Result<(), StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(mut record) = load_record(&tx, &key)? {
                record.status = status;
                record.response_code = Some(response_code);
                record.response_body = Some(response_body);
                record.expires_at = expires_at;
                save_record(&tx, &record)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn purge_expired(&self, now_ms: u64) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM idempotency_records WHERE expires_at <= ?",
                [now_ms as i64],
            )?)
        })
        .await
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn schedule(&self, job: ScheduledJob) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO scheduled_jobs (id, execute_at, doc) VALUES (?, ?, ?)",
                params![job.id, job.execute_at as i64, serde_json::to_string(&job)?],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn due_jobs(&self, now_ms: u64) -> Result<Vec<ScheduledJob>, StoreError> {
        self.with_conn(move |conn| {
            collect_docs(
                conn,
                "SELECT doc FROM scheduled_jobs WHERE execute_at <= ? ORDER BY execute_at, id",
                [now_ms.min(i64::MAX as u64) as i64],
            )
        })
        .await
    }

    async fn take_job(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute("DELETE FROM scheduled_jobs WHERE id = ?", [id])? > 0)
        })
        .await
    }
}
