use gauntlet_types::{Error, Result, UserId};
use serde::Serialize;

use crate::collaborators::Notification;
use crate::guard::{normalize_referral_code, Limit};
use crate::Arena;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralOutcome {
    pub referrer_id: UserId,
}

impl Arena {
    /// Applies a referral code to the caller's account.
    ///
    /// Every actor that touches the attempt (caller, IP, device, code) is
    /// counted before the code is looked up, so probing for valid codes is
    /// throttled like any other use.
    pub async fn apply_referral(
        &self,
        caller: &str,
        raw_code: &str,
        ip: Option<&str>,
        device: &str,
        now_ms: u64,
    ) -> Result<ReferralOutcome> {
        let profile = self.caller(caller).await?;
        let code = normalize_referral_code(raw_code)?;
        if !profile.email_verified {
            return Err(Error::Forbidden(
                "verify your email before using a referral code".into(),
            ));
        }

        let mut actors: Vec<(String, Limit)> = vec![
            (format!("referral:user:{caller}"), self.config.referral_caller_limit()),
            (format!("referral:device:{device}"), self.config.referral_device_limit()),
            (format!("referral:code:{code}"), self.config.referral_code_limit()),
        ];
        if let Some(ip) = ip {
            actors.push((format!("referral:ip:{ip}"), self.config.referral_ip_limit()));
        }
        for (key, limit) in &actors {
            if let Err(err) = self.guard.check(key, *limit, now_ms).await {
                self.metrics().inc_guard_rejection();
                return Err(err);
            }
        }

        let referrer = self
            .collaborators
            .referrals
            .referrer_for_code(&code)
            .await?
            .ok_or(Error::NotFound("referral code"))?;
        if referrer.user_id == caller {
            return Err(Error::Validation("you cannot use your own referral code".into()));
        }
        if referrer.banned {
            tracing::warn!(caller, referrer_id = %referrer.user_id, "referral from banned account");
            return Err(Error::Forbidden("this referral code is no longer valid".into()));
        }
        if profile.referred_by.is_some()
            || self.collaborators.referrals.was_referred(caller).await?
        {
            return Err(Error::Conflict("a referral code was already applied".into()));
        }

        self.collaborators
            .users
            .record_referral(caller, &referrer.user_id)
            .await?;
        self.collaborators
            .notifier
            .notify(
                &referrer.user_id,
                Notification::ReferralApplied {
                    referee_id: caller.to_string(),
                },
            )
            .await;
        self.metrics().inc_referral_applied();
        tracing::info!(caller, referrer_id = %referrer.user_id, "referral applied");
        Ok(ReferralOutcome {
            referrer_id: referrer.user_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::UserProfile;
    use crate::test_support::{arena, player};

    #[tokio::test]
    async fn applies_once() {
        let (arena, directory) = arena();
        player(&directory, "host", 0);
        player(&directory, "guest", 0);
        directory.add_referral_code("host01", "host");

        let outcome = arena
            .apply_referral("guest", " host01 ", Some("10.0.0.1"), "dev", 1)
            .await
            .unwrap();
        assert_eq!(outcome.referrer_id, "host");
        assert_eq!(directory.user("guest").unwrap().referred_by.as_deref(), Some("host"));
        assert!(directory
            .notifications()
            .iter()
            .any(|(user, note)| user == "host"
                && *note == Notification::ReferralApplied { referee_id: "guest".into() }));

        assert!(matches!(
            arena.apply_referral("guest", "HOST01", None, "dev", 2).await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(arena.counters().referrals_applied, 1);
    }

    #[tokio::test]
    async fn rejects_abuse() {
        let (arena, directory) = arena();
        player(&directory, "host", 0);
        player(&directory, "cheat", 0);
        directory.put_user(UserProfile {
            id: "unverified".into(),
            ..UserProfile::default()
        });
        directory.add_referral_code("HOST01", "host");
        directory.add_referral_code("CHEAT1", "cheat");
        directory.ban("cheat");

        let err = arena.apply_referral("host", "HOST01", None, "d1", 1).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = arena.apply_referral("unverified", "HOST01", None, "d2", 1).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        let err = arena.apply_referral("host", "CHEAT1", None, "d3", 1).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        let err = arena.apply_referral("host", "NOPE99", None, "d4", 1).await.unwrap_err();
        assert_eq!(err, Error::NotFound("referral code"));
        let err = arena.apply_referral("host", "bad", None, "d5", 1).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = arena.apply_referral("ghost", "HOST01", None, "d6", 1).await.unwrap_err();
        assert_eq!(err, Error::Unauthorized);
    }

    #[tokio::test]
    async fn throttles_a_single_device() {
        let (arena, directory) = arena();
        let limit = arena.config().referral_max_per_device;
        player(&directory, "host", 0);
        directory.add_referral_code("HOST01", "host");
        for i in 0..limit {
            let user = format!("u{i}");
            player(&directory, &user, 0);
            arena
                .apply_referral(&user, "HOST01", None, "shared-device", 10)
                .await
                .unwrap();
        }
        player(&directory, "late", 0);
        let err = arena
            .apply_referral("late", "HOST01", None, "shared-device", 20)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
        assert_eq!(arena.counters().guard_rejections, 1);
        // Another device is unaffected.
        arena
            .apply_referral("late", "HOST01", None, "other-device", 20)
            .await
            .unwrap();
    }
}
