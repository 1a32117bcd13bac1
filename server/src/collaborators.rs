//! Services the engine consumes but does not own: users, teams, the wallet
//! ledger, notifications, results and referral codes.
//!
//! [InMemoryDirectory] implements every seam over one shared map. It backs the
//! tests and the development binary (seeded from a fixtures file).

use async_trait::async_trait;
use gauntlet_types::{Error, Standing, TeamId, TournamentId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error as ThisError;

#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum CollaboratorError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("no entries left")]
    NoEntries,
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

impl From<CollaboratorError> for Error {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::NotFound(what) => Error::NotFound(what),
            CollaboratorError::NoEntries => {
                Error::Forbidden("an active subscription or a free entry is required".into())
            }
            CollaboratorError::Unavailable(reason) => Error::Transient(reason),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProfile {
    pub id: UserId,
    pub is_admin: bool,
    pub has_subscription: bool,
    pub free_entries: u32,
    pub bonus_entries: u32,
    pub email_verified: bool,
    pub tournaments: Vec<TournamentId>,
    pub tournaments_played: u32,
    pub tournaments_won: u32,
    pub referred_by: Option<UserId>,
}

impl UserProfile {
    pub fn has_entry(&self) -> bool {
        self.free_entries > 0 || self.bonus_entries > 0
    }

    pub fn may_enter(&self) -> bool {
        self.has_subscription || self.has_entry()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Bonus,
    Free,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub captain_id: UserId,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
    #[serde(default)]
    pub tournament_id: Option<TournamentId>,
}

impl Team {
    /// Captain first, then members, without duplicates. A vacated captain
    /// seat is stored as an empty id and skipped.
    pub fn roster(&self) -> Vec<UserId> {
        let mut roster: Vec<UserId> = Vec::new();
        for id in std::iter::once(&self.captain_id).chain(&self.member_ids) {
            if !id.is_empty() && !roster.contains(id) {
                roster.push(id.clone());
            }
        }
        roster
    }

    pub fn includes(&self, user_id: &str) -> bool {
        self.captain_id == user_id || self.member_ids.iter().any(|member| member == user_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Referrer {
    pub user_id: UserId,
    pub banned: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Registered { tournament_id: TournamentId },
    TeamRequestSubmitted { tournament_id: TournamentId, team_id: TeamId },
    TeamApproved { tournament_id: TournamentId, team_id: TeamId },
    TeamRejected { tournament_id: TournamentId, team_id: TeamId, note: Option<String> },
    Removed { tournament_id: TournamentId },
    PrizeCredited { tournament_id: TournamentId, position: u32, amount: u64 },
    ReferralApplied { referee_id: UserId },
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>, CollaboratorError>;

    /// Spends one bonus entry, or a free entry when no bonus is left.
    async fn consume_entry(&self, user_id: &str) -> Result<EntryKind, CollaboratorError>;

    async fn add_tournament(&self, user_id: &str, tournament_id: &str)
        -> Result<(), CollaboratorError>;

    async fn remove_tournament(
        &self,
        user_id: &str,
        tournament_id: &str,
    ) -> Result<(), CollaboratorError>;

    /// Increments played (and won) once per `reference`. Returns whether it applied.
    async fn record_placement(
        &self,
        user_id: &str,
        reference: &str,
        won: bool,
    ) -> Result<bool, CollaboratorError>;

    async fn record_referral(&self, referee_id: &str, referrer_id: &str)
        -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait TeamDirectory: Send + Sync {
    async fn team(&self, team_id: &str) -> Result<Option<Team>, CollaboratorError>;
}

#[async_trait]
pub trait WalletLedger: Send + Sync {
    /// Appends a credit. A reference already credited is a no-op returning `false`.
    async fn credit(
        &self,
        user_id: &str,
        amount: u64,
        reference: &str,
    ) -> Result<bool, CollaboratorError>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, user_id: &str, notification: Notification);
}

#[async_trait]
pub trait ResultsSource: Send + Sync {
    async fn standings(&self, tournament_id: &str) -> Result<Vec<Standing>, CollaboratorError>;
}

#[async_trait]
pub trait ReferralDirectory: Send + Sync {
    async fn referrer_for_code(&self, code: &str) -> Result<Option<Referrer>, CollaboratorError>;

    async fn was_referred(&self, user_id: &str) -> Result<bool, CollaboratorError>;
}

/// Writes notifications to the log instead of delivering them.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, user_id: &str, notification: Notification) {
        tracing::info!(user_id, ?notification, "notification");
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credit {
    pub user_id: UserId,
    pub amount: u64,
    pub reference: String,
}

#[derive(Default)]
struct DirectoryState {
    users: HashMap<UserId, UserProfile>,
    teams: HashMap<TeamId, Team>,
    referral_codes: HashMap<String, UserId>,
    banned: HashSet<UserId>,
    standings: HashMap<TournamentId, Vec<Standing>>,
    credits: Vec<Credit>,
    credited_references: HashSet<String>,
    placement_references: HashSet<String>,
    notifications: Vec<(UserId, Notification)>,
    fail_credit_for: HashSet<UserId>,
    fail_add_tournament_for: HashSet<UserId>,
}

#[derive(Default)]
pub struct InMemoryDirectory {
    state: Mutex<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, DirectoryState>, CollaboratorError> {
        self.state
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("directory poisoned".into()))
    }

    pub fn put_user(&self, profile: UserProfile) {
        if let Ok(mut state) = self.lock() {
            state.users.insert(profile.id.clone(), profile);
        }
    }

    pub fn put_team(&self, team: Team) {
        if let Ok(mut state) = self.lock() {
            state.teams.insert(team.id.clone(), team);
        }
    }

    pub fn set_standings(&self, tournament_id: &str, standings: Vec<Standing>) {
        if let Ok(mut state) = self.lock() {
            state.standings.insert(tournament_id.to_string(), standings);
        }
    }

    pub fn add_referral_code(&self, code: &str, user_id: &str) {
        if let Ok(mut state) = self.lock() {
            state
                .referral_codes
                .insert(code.to_ascii_uppercase(), user_id.to_string());
        }
    }

    pub fn ban(&self, user_id: &str) {
        if let Ok(mut state) = self.lock() {
            state.banned.insert(user_id.to_string());
        }
    }

    pub fn user(&self, user_id: &str) -> Option<UserProfile> {
        self.lock().ok()?.users.get(user_id).cloned()
    }

    /// Sum of all credits to `user_id`.
    pub fn balance(&self, user_id: &str) -> u64 {
        self.lock()
            .map(|state| {
                state
                    .credits
                    .iter()
                    .filter(|credit| credit.user_id == user_id)
                    .map(|credit| credit.amount)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn credits(&self) -> Vec<Credit> {
        self.lock().map(|state| state.credits.clone()).unwrap_or_default()
    }

    pub fn notifications(&self) -> Vec<(UserId, Notification)> {
        self.lock()
            .map(|state| state.notifications.clone())
            .unwrap_or_default()
    }

    /// Makes every credit to `user_id` fail until cleared.
    pub fn fail_credits_for(&self, user_id: &str, fail: bool) {
        if let Ok(mut state) = self.lock() {
            if fail {
                state.fail_credit_for.insert(user_id.to_string());
            } else {
                state.fail_credit_for.remove(user_id);
            }
        }
    }

    pub fn fail_add_tournament_for(&self, user_id: &str, fail: bool) {
        if let Ok(mut state) = self.lock() {
            if fail {
                state.fail_add_tournament_for.insert(user_id.to_string());
            } else {
                state.fail_add_tournament_for.remove(user_id);
            }
        }
    }
}

#[async_trait]
impl UserStore for InMemoryDirectory {
    async fn profile(&self, user_id: &str) -> Result<Option<UserProfile>, CollaboratorError> {
        Ok(self.lock()?.users.get(user_id).cloned())
    }

    async fn consume_entry(&self, user_id: &str) -> Result<EntryKind, CollaboratorError> {
        let mut state = self.lock()?;
        let profile = state
            .users
            .get_mut(user_id)
            .ok_or(CollaboratorError::NotFound("user"))?;
        if profile.bonus_entries > 0 {
            profile.bonus_entries -= 1;
            Ok(EntryKind::Bonus)
        } else if profile.free_entries > 0 {
            profile.free_entries -= 1;
            Ok(EntryKind::Free)
        } else {
            Err(CollaboratorError::NoEntries)
        }
    }

    async fn add_tournament(
        &self,
        user_id: &str,
        tournament_id: &str,
    ) -> Result<(), CollaboratorError> {
        let mut state = self.lock()?;
        if state.fail_add_tournament_for.contains(user_id) {
            return Err(CollaboratorError::Unavailable("user store write failed".into()));
        }
        let profile = state
            .users
            .get_mut(user_id)
            .ok_or(CollaboratorError::NotFound("user"))?;
        if !profile.tournaments.iter().any(|id| id == tournament_id) {
            profile.tournaments.push(tournament_id.to_string());
        }
        Ok(())
    }

    async fn remove_tournament(
        &self,
        user_id: &str,
        tournament_id: &str,
    ) -> Result<(), CollaboratorError> {
        let mut state = self.lock()?;
        if let Some(profile) = state.users.get_mut(user_id) {
            profile.tournaments.retain(|id| id != tournament_id);
        }
        Ok(())
    }

    async fn record_placement(
        &self,
        user_id: &str,
        reference: &str,
        won: bool,
    ) -> Result<bool, CollaboratorError> {
        let mut state = self.lock()?;
        if state.placement_references.contains(reference) {
            return Ok(false);
        }
        let profile = state
            .users
            .get_mut(user_id)
            .ok_or(CollaboratorError::NotFound("user"))?;
        profile.tournaments_played += 1;
        if won {
            profile.tournaments_won += 1;
        }
        state.placement_references.insert(reference.to_string());
        Ok(true)
    }

    async fn record_referral(
        &self,
        referee_id: &str,
        referrer_id: &str,
    ) -> Result<(), CollaboratorError> {
        let mut state = self.lock()?;
        let profile = state
            .users
            .get_mut(referee_id)
            .ok_or(CollaboratorError::NotFound("user"))?;
        profile.referred_by = Some(referrer_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl TeamDirectory for InMemoryDirectory {
    async fn team(&self, team_id: &str) -> Result<Option<Team>, CollaboratorError> {
        Ok(self.lock()?.teams.get(team_id).cloned())
    }
}

#[async_trait]
impl WalletLedger for InMemoryDirectory {
    async fn credit(
        &self,
        user_id: &str,
        amount: u64,
        reference: &str,
    ) -> Result<bool, CollaboratorError> {
        let mut state = self.lock()?;
        if state.fail_credit_for.contains(user_id) {
            return Err(CollaboratorError::Unavailable("wallet ledger rejected credit".into()));
        }
        if !state.credited_references.insert(reference.to_string()) {
            return Ok(false);
        }
        state.credits.push(Credit {
            user_id: user_id.to_string(),
            amount,
            reference: reference.to_string(),
        });
        Ok(true)
    }
}

#[async_trait]
impl NotificationSink for InMemoryDirectory {
    async fn notify(&self, user_id: &str, notification: Notification) {
        tracing::debug!(user_id, ?notification, "notification recorded");
        if let Ok(mut state) = self.lock() {
            state.notifications.push((user_id.to_string(), notification));
        }
    }
}

#[async_trait]
impl ResultsSource for InMemoryDirectory {
    async fn standings(&self, tournament_id: &str) -> Result<Vec<Standing>, CollaboratorError> {
        Ok(self
            .lock()?
            .standings
            .get(tournament_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ReferralDirectory for InMemoryDirectory {
    async fn referrer_for_code(&self, code: &str) -> Result<Option<Referrer>, CollaboratorError> {
        let state = self.lock()?;
        Ok(state.referral_codes.get(code).map(|user_id| Referrer {
            user_id: user_id.clone(),
            banned: state.banned.contains(user_id),
        }))
    }

    async fn was_referred(&self, user_id: &str) -> Result<bool, CollaboratorError> {
        Ok(self
            .lock()?
            .users
            .get(user_id)
            .is_some_and(|profile| profile.referred_by.is_some()))
    }
}

/// Handles to every external service the arena talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub users: Arc<dyn UserStore>,
    pub teams: Arc<dyn TeamDirectory>,
    pub wallet: Arc<dyn WalletLedger>,
    pub notifier: Arc<dyn NotificationSink>,
    pub results: Arc<dyn ResultsSource>,
    pub referrals: Arc<dyn ReferralDirectory>,
}

impl Collaborators {
    pub fn from_directory(directory: Arc<InMemoryDirectory>) -> Self {
        Self {
            users: directory.clone(),
            teams: directory.clone(),
            wallet: directory.clone(),
            notifier: directory.clone(),
            results: directory.clone(),
            referrals: directory,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, free: u32, bonus: u32) -> UserProfile {
        UserProfile {
            id: id.into(),
            free_entries: free,
            bonus_entries: bonus,
            ..UserProfile::default()
        }
    }

    #[tokio::test]
    async fn bonus_entries_are_spent_first() {
        let directory = InMemoryDirectory::new();
        directory.put_user(user("u1", 1, 1));
        assert_eq!(directory.consume_entry("u1").await.unwrap(), EntryKind::Bonus);
        assert_eq!(directory.consume_entry("u1").await.unwrap(), EntryKind::Free);
        assert_eq!(
            directory.consume_entry("u1").await.unwrap_err(),
            CollaboratorError::NoEntries
        );
    }

    #[tokio::test]
    async fn credits_apply_once_per_reference() {
        let directory = InMemoryDirectory::new();
        directory.put_user(user("u1", 0, 0));
        assert!(directory.credit("u1", 50, "prize:t1:1:u1").await.unwrap());
        assert!(!directory.credit("u1", 50, "prize:t1:1:u1").await.unwrap());
        assert_eq!(directory.balance("u1"), 50);

        assert!(directory.record_placement("u1", "prize:t1:1:u1", true).await.unwrap());
        assert!(!directory.record_placement("u1", "prize:t1:1:u1", true).await.unwrap());
        let profile = directory.user("u1").unwrap();
        assert_eq!((profile.tournaments_played, profile.tournaments_won), (1, 1));
    }

    #[test]
    fn roster_puts_captain_first() {
        let team = Team {
            id: "red".into(),
            name: "Red".into(),
            captain_id: "cap".into(),
            member_ids: vec!["a".into(), "cap".into(), "b".into()],
            tournament_id: None,
        };
        assert_eq!(team.roster(), vec!["cap", "a", "b"]);
        assert!(team.includes("b"));
        assert!(!team.includes("c"));

        let vacated = Team {
            captain_id: String::new(),
            member_ids: Vec::new(),
            ..team
        };
        assert!(vacated.roster().is_empty());
    }

    #[tokio::test]
    async fn referral_lookup_reports_bans() {
        let directory = InMemoryDirectory::new();
        directory.add_referral_code("abc123", "ref");
        directory.ban("ref");
        let referrer = directory.referrer_for_code("ABC123").await.unwrap().unwrap();
        assert!(referrer.banned);
        assert!(directory.referrer_for_code("NOPE00").await.unwrap().is_none());
    }
}
