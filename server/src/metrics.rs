use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LATENCY_BUCKET_COUNT: usize = 12;
const LATENCY_BUCKETS_MS: [u64; LATENCY_BUCKET_COUNT] =
    [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Default)]
struct LatencyMetrics {
    buckets: [AtomicU64; LATENCY_BUCKET_COUNT],
    overflow: AtomicU64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyMetrics {
    fn record(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);

        match LATENCY_BUCKETS_MS.iter().position(|bucket| ms <= *bucket) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        let avg_ms = if count > 0 {
            total_ms as f64 / count as f64
        } else {
            0.0
        };

        LatencySnapshot {
            buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
            count,
            avg_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ArenaCountersSnapshot {
    pub registrations_admitted: u64,
    pub team_requests_submitted: u64,
    pub team_requests_approved: u64,
    pub team_requests_rejected: u64,
    pub capacity_rejections: u64,
    pub admission_compensations: u64,
    pub withdrawals: u64,
    pub idempotent_replays: u64,
    pub idempotency_conflicts: u64,
    pub guard_rejections: u64,
    pub referrals_applied: u64,
    pub brackets_generated: u64,
    pub matches_force_completed: u64,
    pub room_credentials_revealed: u64,
    pub jobs_executed: u64,
    pub job_failures: u64,
    pub prizes_distributed: u64,
    pub prize_rollbacks: u64,
}

/// Engine counters and latencies, rendered at `/metrics/prometheus`.
#[derive(Default)]
pub struct ArenaMetrics {
    registrations_admitted: AtomicU64,
    team_requests_submitted: AtomicU64,
    team_requests_approved: AtomicU64,
    team_requests_rejected: AtomicU64,
    capacity_rejections: AtomicU64,
    admission_compensations: AtomicU64,
    withdrawals: AtomicU64,
    idempotent_replays: AtomicU64,
    idempotency_conflicts: AtomicU64,
    guard_rejections: AtomicU64,
    referrals_applied: AtomicU64,
    brackets_generated: AtomicU64,
    matches_force_completed: AtomicU64,
    room_credentials_revealed: AtomicU64,
    jobs_executed: AtomicU64,
    job_failures: AtomicU64,
    prizes_distributed: AtomicU64,
    prize_rollbacks: AtomicU64,
    register: LatencyMetrics,
    review: LatencyMetrics,
    sweep: LatencyMetrics,
    prize: LatencyMetrics,
}

macro_rules! counter_methods {
    ($($method:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $method(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl ArenaMetrics {
    counter_methods! {
        inc_registration_admitted => registrations_admitted,
        inc_team_request_submitted => team_requests_submitted,
        inc_team_request_approved => team_requests_approved,
        inc_team_request_rejected => team_requests_rejected,
        inc_capacity_rejection => capacity_rejections,
        inc_admission_compensation => admission_compensations,
        inc_withdrawal => withdrawals,
        inc_idempotent_replay => idempotent_replays,
        inc_idempotency_conflict => idempotency_conflicts,
        inc_guard_rejection => guard_rejections,
        inc_referral_applied => referrals_applied,
        inc_bracket_generated => brackets_generated,
        inc_prize_distributed => prizes_distributed,
        inc_prize_rollback => prize_rollbacks,
        inc_job_executed => jobs_executed,
        inc_job_failure => job_failures,
    }

    pub fn add_matches_force_completed(&self, count: u64) {
        self.matches_force_completed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_room_credentials_revealed(&self, count: u64) {
        self.room_credentials_revealed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_register(&self, duration: Duration) {
        self.register.record(duration);
    }

    pub fn record_review(&self, duration: Duration) {
        self.review.record(duration);
    }

    pub fn record_sweep(&self, duration: Duration) {
        self.sweep.record(duration);
    }

    pub fn record_prize(&self, duration: Duration) {
        self.prize.record(duration);
    }

    pub fn counters(&self) -> ArenaCountersSnapshot {
        let load = |value: &AtomicU64| value.load(Ordering::Relaxed);
        ArenaCountersSnapshot {
            registrations_admitted: load(&self.registrations_admitted),
            team_requests_submitted: load(&self.team_requests_submitted),
            team_requests_approved: load(&self.team_requests_approved),
            team_requests_rejected: load(&self.team_requests_rejected),
            capacity_rejections: load(&self.capacity_rejections),
            admission_compensations: load(&self.admission_compensations),
            withdrawals: load(&self.withdrawals),
            idempotent_replays: load(&self.idempotent_replays),
            idempotency_conflicts: load(&self.idempotency_conflicts),
            guard_rejections: load(&self.guard_rejections),
            referrals_applied: load(&self.referrals_applied),
            brackets_generated: load(&self.brackets_generated),
            matches_force_completed: load(&self.matches_force_completed),
            room_credentials_revealed: load(&self.room_credentials_revealed),
            jobs_executed: load(&self.jobs_executed),
            job_failures: load(&self.job_failures),
            prizes_distributed: load(&self.prizes_distributed),
            prize_rollbacks: load(&self.prize_rollbacks),
        }
    }

    pub fn latencies(&self) -> Vec<(&'static str, LatencySnapshot)> {
        vec![
            ("gauntlet_register_latency_ms", self.register.snapshot()),
            ("gauntlet_review_latency_ms", self.review.snapshot()),
            ("gauntlet_sweep_latency_ms", self.sweep.snapshot()),
            ("gauntlet_prize_latency_ms", self.prize.snapshot()),
        ]
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct HttpRejectSnapshot {
    pub origin: u64,
    pub body_limit: u64,
    pub rate_limit: u64,
}

#[derive(Default)]
pub struct HttpMetrics {
    reject_origin: AtomicU64,
    reject_body_limit: AtomicU64,
    reject_rate_limit: AtomicU64,
}

impl HttpMetrics {
    pub fn inc_reject_origin(&self) {
        self.reject_origin.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_body_limit(&self) {
        self.reject_body_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_rate_limit(&self) {
        self.reject_rate_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HttpRejectSnapshot {
        HttpRejectSnapshot {
            origin: self.reject_origin.load(Ordering::Relaxed),
            body_limit: self.reject_body_limit.load(Ordering::Relaxed),
            rate_limit: self.reject_rate_limit.load(Ordering::Relaxed),
        }
    }
}
