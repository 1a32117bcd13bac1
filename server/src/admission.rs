//! Admission controller.
//!
//! Capacity is enforced with one conditional update per decision: the store
//! applies [TournamentMutation::Admit] only while the tournament still has
//! room. When the update does not match, the current document is re-read to
//! explain why. Nothing here reads, checks, then writes.

use gauntlet_types::{
    CapacityUnit, Error, NewTournament, RegistrationRole, RegistrationStatus, RequestStatus,
    Result, TeamRequest, Tournament, TournamentKind, TournamentMutation, TournamentRegistration,
    TournamentStatus,
};
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

use crate::collaborators::{Notification, Team, UserProfile};
use crate::guard::registration_key;
use crate::Arena;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOutcome {
    pub tournament: Tournament,
    pub registration: TournamentRegistration,
    pub used_free_entry: bool,
    pub pending_approval: bool,
}

fn role_in(team: Option<&Team>, user_id: &str) -> RegistrationRole {
    match team {
        Some(team) if team.captain_id != user_id => RegistrationRole::Member,
        _ => RegistrationRole::Owner,
    }
}

impl Arena {
    pub async fn create_tournament(
        &self,
        caller: &str,
        input: NewTournament,
        now_ms: u64,
    ) -> Result<Tournament> {
        self.require_admin(caller).await?;
        let tournament = Tournament::create(Uuid::new_v4().to_string(), input, now_ms)?;
        self.stores
            .tournaments
            .insert_tournament(tournament.clone())
            .await?;
        tracing::info!(tournament_id = %tournament.id, kind = ?tournament.kind, "tournament created");
        Ok(tournament)
    }

    /// Registers `user_id`, directly or as a pending team request.
    pub async fn register(
        &self,
        tournament_id: &str,
        user_id: &str,
        team_id: Option<String>,
        now_ms: u64,
    ) -> Result<RegistrationOutcome> {
        let start = Instant::now();
        let result = self.register_inner(tournament_id, user_id, team_id, now_ms).await;
        self.metrics().record_register(start.elapsed());
        result
    }

    async fn register_inner(
        &self,
        tournament_id: &str,
        user_id: &str,
        team_id: Option<String>,
        now_ms: u64,
    ) -> Result<RegistrationOutcome> {
        if let Err(err) = self
            .guard
            .check(
                &registration_key(user_id, tournament_id),
                self.config.registration_limit(),
                now_ms,
            )
            .await
        {
            self.metrics().inc_guard_rejection();
            return Err(err);
        }

        let tournament = self.tournament(tournament_id).await?;
        if !tournament.accepts_registrations() {
            return Err(Error::InvalidState(
                "registration is closed for this tournament".into(),
            ));
        }
        let profile = self.caller(user_id).await?;
        if tournament.has_player(user_id) {
            return Err(Error::AlreadyRegistered);
        }
        if !profile.may_enter() {
            return Err(Error::Forbidden(
                "an active subscription or a free entry is required".into(),
            ));
        }

        let team = match (tournament.kind, team_id) {
            (TournamentKind::Solo, Some(_)) => {
                return Err(Error::Validation(
                    "teamId is only accepted for team tournaments".into(),
                ))
            }
            (TournamentKind::Solo, None) => None,
            (TournamentKind::Team, None) => {
                return Err(Error::Validation(
                    "teamId is required for team tournaments".into(),
                ))
            }
            (TournamentKind::Team, Some(team_id)) => Some(
                self.collaborators
                    .teams
                    .team(&team_id)
                    .await?
                    .ok_or(Error::NotFound("team"))?,
            ),
        };

        if let Some(team) = &team {
            if !profile.is_admin && !team.includes(user_id) {
                return Err(Error::Forbidden("only team members may register a team".into()));
            }
            if !profile.is_admin && !tournament.has_team(&team.id) {
                return self
                    .request_team_slot(&tournament, &profile, team, now_ms)
                    .await;
            }
        }

        self.admit(tournament, &profile, team.as_ref(), now_ms).await
    }

    async fn request_team_slot(
        &self,
        tournament: &Tournament,
        profile: &UserProfile,
        team: &Team,
        now_ms: u64,
    ) -> Result<RegistrationOutcome> {
        if team.tournament_id.as_deref() != Some(tournament.id.as_str()) {
            return Err(Error::Validation(
                "team is not linked to this tournament".into(),
            ));
        }
        let request = TeamRequest::pending(team.id.clone(), profile.id.clone(), now_ms);
        let updated = self
            .stores
            .tournaments
            .update_tournament(&tournament.id, TournamentMutation::RequestTeamSlot { request })
            .await?;
        let Some(updated) = updated else {
            let current = self.tournament(&tournament.id).await?;
            return Err(if current.has_team(&team.id) {
                Error::Conflict("team is already registered; register again to join it".into())
            } else if current.open_request(&team.id).is_some() {
                Error::RequestPending
            } else if !current.accepts_registrations() {
                Error::InvalidState("registration is closed for this tournament".into())
            } else {
                Error::Conflict("tournament changed concurrently, retry".into())
            });
        };

        let row = TournamentRegistration::new(
            profile.id.clone(),
            tournament.id.clone(),
            Some(team.id.clone()),
            role_in(Some(team), &profile.id),
            RegistrationStatus::Pending,
            now_ms,
        );
        let registration = match self.stores.tournaments.upsert_registration(row.clone()).await {
            Ok(registration) => registration,
            Err(err) => {
                // The request on the tournament is authoritative; the row is a mirror.
                tracing::warn!(
                    tournament_id = %tournament.id,
                    team_id = %team.id,
                    user_id = %profile.id,
                    ?err,
                    "failed to record pending registration"
                );
                row
            }
        };
        self.metrics().inc_team_request_submitted();
        tracing::info!(
            tournament_id = %tournament.id,
            team_id = %team.id,
            user_id = %profile.id,
            "team request submitted"
        );
        self.collaborators
            .notifier
            .notify(
                &profile.id,
                Notification::TeamRequestSubmitted {
                    tournament_id: tournament.id.clone(),
                    team_id: team.id.clone(),
                },
            )
            .await;

        Ok(RegistrationOutcome {
            tournament: updated,
            registration,
            used_free_entry: false,
            pending_approval: true,
        })
    }

    async fn admit(
        &self,
        tournament: Tournament,
        profile: &UserProfile,
        team: Option<&Team>,
        now_ms: u64,
    ) -> Result<RegistrationOutcome> {
        let team_id = team.map(|team| team.id.clone());
        let team_was_present = team_id
            .as_deref()
            .is_some_and(|team_id| tournament.has_team(team_id));
        let updated = self
            .stores
            .tournaments
            .update_tournament(
                &tournament.id,
                TournamentMutation::Admit {
                    user_id: profile.id.clone(),
                    team_id: team_id.clone(),
                    at: now_ms,
                },
            )
            .await?;
        let Some(updated) = updated else {
            return Err(self
                .diagnose_admission(&tournament.id, &profile.id, team_id.as_deref())
                .await);
        };

        let registration = match self
            .record_admission(&updated, profile, team, now_ms)
            .await
        {
            Ok(registration) => registration,
            Err(err) => {
                self.compensate_admission(&updated.id, &profile.id, team_id, team_was_present)
                    .await;
                return Err(err);
            }
        };

        let mut used_free_entry = false;
        if !profile.has_subscription {
            match self.collaborators.users.consume_entry(&profile.id).await {
                Ok(kind) => {
                    used_free_entry = true;
                    tracing::debug!(user_id = %profile.id, ?kind, "entry consumed");
                }
                Err(err) => tracing::warn!(
                    tournament_id = %updated.id,
                    user_id = %profile.id,
                    ?err,
                    "failed to consume entry after registration"
                ),
            }
        }

        self.metrics().inc_registration_admitted();
        tracing::info!(
            tournament_id = %updated.id,
            user_id = %profile.id,
            team_id = ?registration.team_id,
            players = updated.player_count(),
            capacity = updated.capacity_players,
            "registration admitted"
        );
        self.collaborators
            .notifier
            .notify(
                &profile.id,
                Notification::Registered {
                    tournament_id: updated.id.clone(),
                },
            )
            .await;

        Ok(RegistrationOutcome {
            tournament: updated,
            registration,
            used_free_entry,
            pending_approval: false,
        })
    }

    /// Writes the registration row and the user back-reference.
    async fn record_admission(
        &self,
        tournament: &Tournament,
        profile: &UserProfile,
        team: Option<&Team>,
        now_ms: u64,
    ) -> Result<TournamentRegistration> {
        self.collaborators
            .users
            .add_tournament(&profile.id, &tournament.id)
            .await?;
        let row = TournamentRegistration::new(
            profile.id.clone(),
            tournament.id.clone(),
            team.map(|team| team.id.clone()),
            role_in(team, &profile.id),
            RegistrationStatus::Active,
            now_ms,
        );
        match self.stores.tournaments.upsert_registration(row).await {
            Ok(registration) => Ok(registration),
            Err(err) => {
                if let Err(undo) = self
                    .collaborators
                    .users
                    .remove_tournament(&profile.id, &tournament.id)
                    .await
                {
                    tracing::warn!(user_id = %profile.id, ?undo, "failed to undo back-reference");
                }
                Err(err.into())
            }
        }
    }

    async fn compensate_admission(
        &self,
        tournament_id: &str,
        user_id: &str,
        team_id: Option<String>,
        team_was_present: bool,
    ) {
        self.metrics().inc_admission_compensation();
        let release = TournamentMutation::Release {
            user_id: user_id.to_string(),
            team_id: if team_was_present { None } else { team_id },
        };
        match self
            .stores
            .tournaments
            .update_tournament(tournament_id, release)
            .await
        {
            Ok(Some(_)) => tracing::warn!(
                tournament_id,
                user_id,
                "registration side effects failed; slot released"
            ),
            Ok(None) => tracing::error!(
                tournament_id,
                user_id,
                "registration side effects failed and the slot could not be released"
            ),
            Err(err) => tracing::error!(
                tournament_id,
                user_id,
                ?err,
                "registration side effects failed and releasing the slot errored"
            ),
        }
    }

    async fn diagnose_admission(
        &self,
        tournament_id: &str,
        user_id: &str,
        team_id: Option<&str>,
    ) -> Error {
        let current = match self.stores.tournaments.tournament(tournament_id).await {
            Ok(Some(current)) => current,
            Ok(None) => return Error::NotFound("tournament"),
            Err(err) => return err.into(),
        };
        if current.has_player(user_id) {
            return Error::AlreadyRegistered;
        }
        if !current.accepts_registrations() {
            return Error::InvalidState("registration is closed for this tournament".into());
        }
        if current.players_full() {
            self.metrics().inc_capacity_rejection();
            return Error::CapacityExceeded {
                current: current.player_count(),
                max: current.capacity_players,
                unit: CapacityUnit::Players,
            };
        }
        if let Some(team_id) = team_id {
            if !current.has_team(team_id) && current.teams_full() {
                self.metrics().inc_capacity_rejection();
                return Error::CapacityExceeded {
                    current: current.team_count(),
                    max: current.capacity_teams,
                    unit: CapacityUnit::Teams,
                };
            }
        }
        Error::Conflict("tournament changed concurrently, retry".into())
    }

    /// Admits a pending team: capacity is re-checked at approval time.
    pub async fn approve_team(
        &self,
        tournament_id: &str,
        team_id: &str,
        reviewer: &str,
        note: Option<String>,
        now_ms: u64,
    ) -> Result<Tournament> {
        let start = Instant::now();
        self.require_admin(reviewer).await?;
        let team = self
            .collaborators
            .teams
            .team(team_id)
            .await?
            .ok_or(Error::NotFound("team"))?;
        let roster = team.roster();
        let updated = self
            .stores
            .tournaments
            .update_tournament(
                tournament_id,
                TournamentMutation::ApproveTeam {
                    team_id: team_id.to_string(),
                    roster: roster.clone(),
                    reviewer_id: reviewer.to_string(),
                    note,
                    at: now_ms,
                },
            )
            .await?;
        let Some(updated) = updated else {
            return Err(self.diagnose_review(tournament_id, team_id, Some(roster.as_slice())).await);
        };

        for member in &roster {
            let row = TournamentRegistration::new(
                member.clone(),
                updated.id.clone(),
                Some(team.id.clone()),
                role_in(Some(&team), member),
                RegistrationStatus::Active,
                now_ms,
            );
            if let Err(err) = self.stores.tournaments.upsert_registration(row).await {
                tracing::error!(tournament_id, team_id, user_id = %member, ?err, "failed to activate member");
            }
            if let Err(err) = self
                .collaborators
                .users
                .add_tournament(member, &updated.id)
                .await
            {
                tracing::warn!(tournament_id, team_id, user_id = %member, ?err, "failed to link member");
            }
        }

        self.metrics().inc_team_request_approved();
        self.metrics().record_review(start.elapsed());
        tracing::info!(tournament_id, team_id, reviewer, members = roster.len(), "team approved");
        self.notify_all(
            &roster,
            Notification::TeamApproved {
                tournament_id: updated.id.clone(),
                team_id: team.id.clone(),
            },
        )
        .await;
        Ok(updated)
    }

    /// Rejects a pending team request and the team's still-pending registration rows.
    pub async fn reject_team(
        &self,
        tournament_id: &str,
        team_id: &str,
        reviewer: &str,
        note: Option<String>,
        now_ms: u64,
    ) -> Result<Tournament> {
        let start = Instant::now();
        self.require_admin(reviewer).await?;
        let updated = self
            .stores
            .tournaments
            .update_tournament(
                tournament_id,
                TournamentMutation::RejectTeam {
                    team_id: team_id.to_string(),
                    reviewer_id: reviewer.to_string(),
                    note: note.clone(),
                    at: now_ms,
                },
            )
            .await?;
        let Some(updated) = updated else {
            return Err(self.diagnose_review(tournament_id, team_id, None).await);
        };

        let rejected = self
            .stores
            .tournaments
            .set_team_registration_status(
                tournament_id,
                team_id,
                RegistrationStatus::Pending,
                RegistrationStatus::Rejected,
                now_ms,
            )
            .await?;
        self.metrics().inc_team_request_rejected();
        self.metrics().record_review(start.elapsed());
        tracing::info!(tournament_id, team_id, reviewer, rows = rejected, "team rejected");

        let requester = updated
            .pending_requests
            .iter()
            .rev()
            .find(|request| request.team_id == team_id)
            .map(|request| request.requested_by.clone());
        if let Some(requester) = requester {
            self.collaborators
                .notifier
                .notify(
                    &requester,
                    Notification::TeamRejected {
                        tournament_id: updated.id.clone(),
                        team_id: team_id.to_string(),
                        note,
                    },
                )
                .await;
        }
        Ok(updated)
    }

    async fn diagnose_review(
        &self,
        tournament_id: &str,
        team_id: &str,
        roster: Option<&[String]>,
    ) -> Error {
        let current = match self.stores.tournaments.tournament(tournament_id).await {
            Ok(Some(current)) => current,
            Ok(None) => return Error::NotFound("tournament"),
            Err(err) => return err.into(),
        };
        if current.pending_request(team_id).is_none() {
            let reviewed = current
                .pending_requests
                .iter()
                .any(|request| request.team_id == team_id);
            return if reviewed {
                Error::Conflict("team request was already reviewed".into())
            } else {
                Error::NotFound("team request")
            };
        }
        let Some(roster) = roster else {
            return Error::Conflict("tournament changed concurrently, retry".into());
        };
        if current.has_team(team_id) {
            return Error::Conflict("team is already registered".into());
        }
        if !current.accepts_registrations() {
            return Error::InvalidState("registration is closed for this tournament".into());
        }
        if current.teams_full() {
            self.metrics().inc_capacity_rejection();
            return Error::CapacityExceeded {
                current: current.team_count(),
                max: current.capacity_teams,
                unit: CapacityUnit::Teams,
            };
        }
        let added = current.new_players(roster).len() as u32;
        if current.player_count().saturating_add(added) > current.capacity_players {
            self.metrics().inc_capacity_rejection();
            return Error::CapacityExceeded {
                current: current.player_count(),
                max: current.capacity_players,
                unit: CapacityUnit::Players,
            };
        }
        Error::Conflict("tournament changed concurrently, retry".into())
    }

    pub async fn list_requests(
        &self,
        tournament_id: &str,
        caller: &str,
        status: Option<RequestStatus>,
    ) -> Result<Vec<TeamRequest>> {
        self.require_admin(caller).await?;
        Ok(self.tournament(tournament_id).await?.requests(status))
    }

    /// Releases a player slot. `target` is the caller itself (`left`) or, for
    /// admins, another player (`removed`). Entries are not refunded.
    pub async fn withdraw(
        &self,
        tournament_id: &str,
        caller: &str,
        target: Option<&str>,
        now_ms: u64,
    ) -> Result<Tournament> {
        let (user_id, status) = match target {
            Some(target) if target != caller => {
                self.require_admin(caller).await?;
                (target, RegistrationStatus::Removed)
            }
            _ => {
                self.caller(caller).await?;
                (caller, RegistrationStatus::Left)
            }
        };

        let tournament = self.tournament(tournament_id).await?;
        if tournament.status != TournamentStatus::Upcoming {
            return Err(Error::InvalidState(
                "players can only leave upcoming tournaments".into(),
            ));
        }
        if !tournament.has_player(user_id) {
            return Err(Error::NotFound("registration"));
        }

        let rows = self.stores.tournaments.registrations(tournament_id).await?;
        let existing = rows.iter().find(|row| row.user_id == user_id).cloned();
        let team_id = existing.as_ref().and_then(|row| row.team_id.clone());
        // The team keeps its slot while another member is still active.
        let release_team = team_id.clone().filter(|team_id| {
            !rows.iter().any(|row| {
                row.user_id != user_id
                    && row.team_id.as_deref() == Some(team_id.as_str())
                    && row.status == RegistrationStatus::Active
            })
        });

        let updated = self
            .stores
            .tournaments
            .update_tournament(
                tournament_id,
                TournamentMutation::Release {
                    user_id: user_id.to_string(),
                    team_id: release_team,
                },
            )
            .await?;
        let Some(updated) = updated else {
            let current = self.tournament(tournament_id).await?;
            return Err(if current.status != TournamentStatus::Upcoming {
                Error::InvalidState("players can only leave upcoming tournaments".into())
            } else {
                Error::NotFound("registration")
            });
        };

        let mut row = existing.unwrap_or_else(|| {
            TournamentRegistration::new(
                user_id.to_string(),
                tournament_id.to_string(),
                team_id,
                RegistrationRole::Member,
                status,
                now_ms,
            )
        });
        row.status = status;
        row.updated_at = now_ms;
        if let Err(err) = self.stores.tournaments.upsert_registration(row).await {
            tracing::warn!(tournament_id, user_id, ?err, "failed to record withdrawal");
        }
        if let Err(err) = self
            .collaborators
            .users
            .remove_tournament(user_id, tournament_id)
            .await
        {
            tracing::warn!(tournament_id, user_id, ?err, "failed to unlink tournament");
        }

        self.metrics().inc_withdrawal();
        tracing::info!(tournament_id, user_id, status = status.as_str(), "player withdrawn");
        if status == RegistrationStatus::Removed {
            self.collaborators
                .notifier
                .notify(
                    user_id,
                    Notification::Removed {
                        tournament_id: tournament_id.to_string(),
                    },
                )
                .await;
        }
        Ok(updated)
    }
}
