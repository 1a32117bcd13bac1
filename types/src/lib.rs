//! Domain model for the gauntlet tournament engine.
//!
//! Everything here is pure data plus the state transitions over it. Storage,
//! scheduling and HTTP live in `gauntlet-server`.

pub mod constants;
pub mod error;
pub mod idempotency;
pub mod job;
pub mod matches;
pub mod mutation;
pub mod prize;
pub mod registration;
pub mod tournament;

pub use error::{CapacityUnit, Error, ErrorKind, Result};
pub use idempotency::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus, RecordKey};
pub use job::{JobKind, ScheduledJob};
pub use matches::{
    pair_sequentially, plan_first_round, Match, MatchMutation, MatchScore, MatchStatus,
    RoomCredentials,
};
pub use mutation::TournamentMutation;
pub use prize::{
    credit_reference, divide_among, split_pool, Participant, PrizeDistribution, PrizePayout,
    PrizeShare, Standing,
};
pub use registration::{RegistrationRole, RegistrationStatus, TournamentRegistration};
pub use tournament::{
    MatchId, NewTournament, PrizeStatus, RequestStatus, TeamId, TeamRequest, Tournament,
    TournamentId, TournamentKind, TournamentStatus, UserId,
};
