use gauntlet_types::{
    credit_reference, divide_among, split_pool, Error, Participant, PrizeDistribution, PrizePayout,
    PrizeStatus, Result, TeamId, Tournament, TournamentMutation, TournamentStatus, UserId,
};
use serde::Serialize;
use std::time::Instant;

use crate::collaborators::Notification;
use crate::Arena;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrizeStatusView {
    pub tournament_id: String,
    pub prize_status: PrizeStatus,
    pub prize_pool: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prize_distribution: Option<PrizeDistribution>,
}

impl Arena {
    /// Manual distribution by an admin, e.g. after a failed scheduled run.
    pub async fn distribute_prizes_as(
        &self,
        caller: &str,
        tournament_id: &str,
        now_ms: u64,
    ) -> Result<PrizeDistribution> {
        self.require_admin(caller).await?;
        tracing::info!(tournament_id, caller, "manual prize distribution");
        self.distribute_prizes(tournament_id, now_ms).await
    }

    /// Pays the pool out to the top three standings.
    ///
    /// The tournament moves `pending -> processing` before any credit is
    /// written and back to `pending` if one fails. Credits are keyed by
    /// reference, so a later retry skips everything already paid.
    pub async fn distribute_prizes(
        &self,
        tournament_id: &str,
        now_ms: u64,
    ) -> Result<PrizeDistribution> {
        let start = Instant::now();
        let begun = self
            .stores
            .tournaments
            .update_tournament(tournament_id, TournamentMutation::BeginPrizeDistribution)
            .await?;
        let Some(tournament) = begun else {
            return Err(self.diagnose_prizes(tournament_id).await);
        };

        let outcome = match self.pay_out(&tournament, now_ms).await {
            Ok(distribution) => self.finish_prizes(tournament_id, distribution).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(distribution) => {
                self.metrics().inc_prize_distributed();
                self.metrics().record_prize(start.elapsed());
                tracing::info!(
                    tournament_id,
                    pool = distribution.pool,
                    payouts = distribution.payouts.len(),
                    undistributed = distribution.undistributed,
                    "prizes distributed"
                );
                Ok(distribution)
            }
            Err(err) => {
                self.rollback_prizes(tournament_id).await;
                tracing::error!(tournament_id, ?err, "prize distribution failed");
                Err(err)
            }
        }
    }

    async fn pay_out(&self, tournament: &Tournament, now_ms: u64) -> Result<PrizeDistribution> {
        let standings = self.collaborators.results.standings(&tournament.id).await?;
        let shares = split_pool(tournament.prize_pool, &standings);

        let mut payouts = Vec::new();
        for share in &shares {
            let (team_id, roster) = self.payees(&share.participant).await?;
            for (user_id, amount) in divide_among(share.amount, &roster) {
                if amount == 0 {
                    continue;
                }
                let reference = credit_reference(&tournament.id, share.position, &user_id);
                let credited = self
                    .collaborators
                    .wallet
                    .credit(&user_id, amount, &reference)
                    .await?;
                self.collaborators
                    .users
                    .record_placement(&user_id, &reference, share.position == 1)
                    .await?;
                if credited {
                    self.collaborators
                        .notifier
                        .notify(
                            &user_id,
                            Notification::PrizeCredited {
                                tournament_id: tournament.id.clone(),
                                position: share.position,
                                amount,
                            },
                        )
                        .await;
                } else {
                    tracing::debug!(tournament_id = %tournament.id, user_id, reference, "credit already applied");
                }
                payouts.push(PrizePayout {
                    position: share.position,
                    user_id,
                    team_id: team_id.clone(),
                    amount,
                    reference,
                });
            }
        }

        let paid: u64 = payouts.iter().map(|payout| payout.amount).sum();
        Ok(PrizeDistribution {
            pool: tournament.prize_pool,
            payouts,
            undistributed: tournament.prize_pool.saturating_sub(paid),
            distributed_at: now_ms,
        })
    }

    async fn payees(&self, participant: &Participant) -> Result<(Option<TeamId>, Vec<UserId>)> {
        match participant {
            Participant::Player { user_id } => Ok((None, vec![user_id.clone()])),
            Participant::Team { team_id } => {
                let team = self
                    .collaborators
                    .teams
                    .team(team_id)
                    .await?
                    .ok_or(Error::NotFound("team"))?;
                Ok((Some(team.id.clone()), team.roster()))
            }
        }
    }

    async fn finish_prizes(
        &self,
        tournament_id: &str,
        distribution: PrizeDistribution,
    ) -> Result<PrizeDistribution> {
        let finished = self
            .stores
            .tournaments
            .update_tournament(
                tournament_id,
                TournamentMutation::FinishPrizeDistribution {
                    distribution: distribution.clone(),
                },
            )
            .await?;
        match finished {
            Some(_) => Ok(distribution),
            None => Err(Error::Conflict(
                "prize distribution state changed while paying out".into(),
            )),
        }
    }

    async fn rollback_prizes(&self, tournament_id: &str) {
        self.metrics().inc_prize_rollback();
        match self
            .stores
            .tournaments
            .update_tournament(tournament_id, TournamentMutation::RollbackPrizeDistribution)
            .await
        {
            Ok(Some(_)) => tracing::warn!(tournament_id, "prize distribution rolled back"),
            Ok(None) => tracing::warn!(tournament_id, "prize distribution was not processing"),
            Err(err) => {
                tracing::error!(tournament_id, ?err, "prize rollback failed; tournament left processing")
            }
        }
    }

    async fn diagnose_prizes(&self, tournament_id: &str) -> Error {
        let current = match self.tournament(tournament_id).await {
            Ok(current) => current,
            Err(err) => return err,
        };
        if current.status != TournamentStatus::Completed {
            return Error::InvalidState("tournament is not completed".into());
        }
        match current.prize_status {
            PrizeStatus::Distributed => Error::Conflict("prizes already distributed".into()),
            PrizeStatus::Processing => {
                Error::Conflict("prize distribution already in progress".into())
            }
            PrizeStatus::Pending => Error::Conflict("tournament changed concurrently, retry".into()),
        }
    }

    pub async fn prize_status(&self, tournament_id: &str) -> Result<PrizeStatusView> {
        let tournament = self.tournament(tournament_id).await?;
        Ok(PrizeStatusView {
            tournament_id: tournament.id,
            prize_status: tournament.prize_status,
            prize_pool: tournament.prize_pool,
            prize_distribution: tournament.prize_distribution,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Team;
    use crate::test_support::{arena, player, team, tournament, ADMIN};
    use gauntlet_types::{Standing, TournamentKind};

    async fn complete(arena: &Arena, tournament_id: &str) {
        for mutation in [TournamentMutation::CloseRegistration, TournamentMutation::Complete] {
            arena
                .stores()
                .tournaments
                .update_tournament(tournament_id, mutation)
                .await
                .unwrap()
                .unwrap();
        }
    }

    fn placed(position: u32, participant: Participant) -> Standing {
        Standing {
            position,
            participant,
        }
    }

    fn solo(user_id: &str) -> Participant {
        Participant::Player {
            user_id: user_id.into(),
        }
    }

    #[tokio::test]
    async fn rollback_then_retry_never_double_credits() {
        let (arena, directory) = arena();
        let cup = tournament(&arena, TournamentKind::Solo, 0, 8, 1_000).await;
        for id in ["p1", "p2", "p3"] {
            player(&directory, id, 1);
        }
        directory.set_standings(
            &cup.id,
            vec![placed(1, solo("p1")), placed(2, solo("p2")), placed(3, solo("p3"))],
        );

        // Not completed yet.
        assert!(matches!(
            arena.distribute_prizes(&cup.id, 1).await,
            Err(Error::InvalidState(_))
        ));
        complete(&arena, &cup.id).await;

        directory.fail_credits_for("p3", true);
        let err = arena.distribute_prizes(&cup.id, 2).await.unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
        let status = arena.prize_status(&cup.id).await.unwrap();
        assert_eq!(status.prize_status, PrizeStatus::Pending);
        assert!(status.prize_distribution.is_none());
        assert_eq!(directory.balance("p1"), 500);
        assert_eq!(directory.balance("p2"), 300);
        assert_eq!(arena.counters().prize_rollbacks, 1);

        directory.fail_credits_for("p3", false);
        let distribution = arena.distribute_prizes_as(ADMIN, &cup.id, 3).await.unwrap();
        assert_eq!(distribution.payouts.len(), 3);
        assert_eq!(distribution.undistributed, 0);
        assert_eq!(directory.balance("p1"), 500);
        assert_eq!(directory.balance("p2"), 300);
        assert_eq!(directory.balance("p3"), 200);
        assert_eq!(directory.credits().len(), 3);
        let winner = directory.user("p1").unwrap();
        assert_eq!((winner.tournaments_played, winner.tournaments_won), (1, 1));
        let third = directory.user("p3").unwrap();
        assert_eq!((third.tournaments_played, third.tournaments_won), (1, 0));

        let status = arena.prize_status(&cup.id).await.unwrap();
        assert_eq!(status.prize_status, PrizeStatus::Distributed);
        assert_eq!(status.prize_distribution, Some(distribution));
        assert!(matches!(
            arena.distribute_prizes(&cup.id, 4).await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(arena.counters().prizes_distributed, 1);
    }

    #[tokio::test]
    async fn team_shares_split_across_roster() {
        let (arena, directory) = arena();
        let cup = tournament(&arena, TournamentKind::Team, 4, 8, 1_000).await;
        team(&directory, "red", &cup.id, &["cap", "m1", "m2"]);
        team(&directory, "blue", &cup.id, &["b1"]);
        directory.set_standings(
            &cup.id,
            vec![
                placed(1, Participant::Team { team_id: "red".into() }),
                placed(2, Participant::Team { team_id: "blue".into() }),
            ],
        );
        complete(&arena, &cup.id).await;

        let distribution = arena.distribute_prizes(&cup.id, 5).await.unwrap();
        // 500 over three members: the first two in roster order get the remainder.
        assert_eq!(directory.balance("cap"), 167);
        assert_eq!(directory.balance("m1"), 167);
        assert_eq!(directory.balance("m2"), 166);
        assert_eq!(directory.balance("b1"), 300);
        assert_eq!(distribution.undistributed, 200);
        assert!(distribution
            .payouts
            .iter()
            .filter(|payout| payout.position == 1)
            .all(|payout| payout.team_id.as_deref() == Some("red")));
        assert_eq!(
            distribution.payouts[0].reference,
            format!("prize:{}:1:cap", cup.id)
        );
    }

    #[tokio::test]
    async fn unpaid_shares_stay_undistributed() {
        let (arena, directory) = arena();
        let cup = tournament(&arena, TournamentKind::Team, 4, 8, 1_000).await;
        team(&directory, "red", &cup.id, &["cap"]);
        directory.put_team(Team {
            id: "ghost".into(),
            name: "Ghost".into(),
            captain_id: String::new(),
            member_ids: Vec::new(),
            tournament_id: Some(cup.id.clone()),
        });
        directory.set_standings(
            &cup.id,
            vec![
                placed(1, Participant::Team { team_id: "red".into() }),
                placed(2, Participant::Team { team_id: "ghost".into() }),
            ],
        );
        complete(&arena, &cup.id).await;

        let distribution = arena.distribute_prizes(&cup.id, 5).await.unwrap();
        assert_eq!(distribution.payouts.len(), 1);
        assert_eq!(directory.balance("cap"), 500);
        // Second place had nobody to pay and third place was never awarded.
        assert_eq!(distribution.undistributed, 500);
    }

    #[tokio::test]
    async fn manual_distribution_is_admin_only() {
        let (arena, directory) = arena();
        let cup = tournament(&arena, TournamentKind::Solo, 0, 8, 100).await;
        player(&directory, "p1", 1);
        complete(&arena, &cup.id).await;
        assert!(matches!(
            arena.distribute_prizes_as("p1", &cup.id, 1).await,
            Err(Error::Forbidden(_))
        ));
        // No standings: the whole pool stays undistributed.
        let distribution = arena.distribute_prizes_as(ADMIN, &cup.id, 1).await.unwrap();
        assert!(distribution.payouts.is_empty());
        assert_eq!(distribution.undistributed, 100);
    }
}
