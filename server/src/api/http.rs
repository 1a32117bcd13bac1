use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State as AxumState},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use gauntlet_types::{
    Error, IdempotencyKey, NewTournament, RequestStatus, Tournament, TournamentRegistration,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Write;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use super::{IDEMPOTENCY_KEY_HEADER, REPLAY_HEADER, USER_ID_HEADER};
use crate::guard::device_fingerprint;
use crate::idempotency::{fingerprint, CapturedResponse, LedgerError};
use crate::metrics::LatencySnapshot;
use crate::{now_ms, Arena, RegistrationOutcome};

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    used_free_entry: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_approval: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorEnvelope {
    success: bool,
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationData<'a> {
    tournament: &'a Tournament,
    registration: &'a TournamentRegistration,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    team_id: Option<String>,
}

#[derive(Deserialize, Default)]
struct ReviewBody {
    note: Option<String>,
}

#[derive(Deserialize)]
struct ReferralBody {
    code: String,
}

#[derive(Deserialize)]
pub(super) struct RequestsQuery {
    status: Option<String>,
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_)
        | Error::AlreadyRegistered
        | Error::CapacityExceeded { .. }
        | Error::InvalidState(_) => StatusCode::BAD_REQUEST,
        Error::Unauthorized => StatusCode::UNAUTHORIZED,
        Error::Forbidden(_) => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::RequestPending | Error::Conflict(_) => StatusCode::CONFLICT,
        Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn encode<T: Serialize>(status: StatusCode, payload: &T) -> CapturedResponse {
    match serde_json::to_vec(payload) {
        Ok(body) => CapturedResponse::new(status.as_u16(), body),
        Err(err) => {
            tracing::error!(?err, "failed to encode response");
            CapturedResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                Bytes::from_static(br#"{"success":false,"error":"internal error","code":"transient_error"}"#),
            )
        }
    }
}

fn success<T: Serialize>(status: StatusCode, data: T) -> CapturedResponse {
    encode(
        status,
        &Envelope {
            success: true,
            data,
            used_free_entry: None,
            pending_approval: None,
        },
    )
}

fn failure(err: &Error) -> CapturedResponse {
    let error = match err {
        Error::Transient(reason) => {
            tracing::error!(reason = %reason, "request failed");
            "internal error, please retry".to_string()
        }
        other => other.to_string(),
    };
    let (current, max) = match err {
        Error::CapacityExceeded { current, max, .. } => (Some(*current), Some(*max)),
        _ => (None, None),
    };
    let retry_after_ms = match err {
        Error::RateLimited { retry_after_ms } => Some(*retry_after_ms),
        _ => None,
    };
    encode(
        status_for(err),
        &ErrorEnvelope {
            success: false,
            error,
            code: err.code(),
            retry_after_ms,
            current,
            max,
        },
    )
}

fn outcome_of<T: Serialize>(status: StatusCode, result: Result<T, Error>) -> CapturedResponse {
    match result {
        Ok(data) => success(status, data),
        Err(err) => failure(&err),
    }
}

fn registration_response(result: Result<RegistrationOutcome, Error>) -> CapturedResponse {
    match result {
        Ok(outcome) => {
            let status = if outcome.pending_approval {
                StatusCode::ACCEPTED
            } else {
                StatusCode::CREATED
            };
            encode(
                status,
                &Envelope {
                    success: true,
                    data: RegistrationData {
                        tournament: &outcome.tournament,
                        registration: &outcome.registration,
                    },
                    used_free_entry: Some(outcome.used_free_entry),
                    pending_approval: outcome.pending_approval.then_some(true),
                },
            )
        }
        Err(err) => failure(&err),
    }
}

fn respond(captured: CapturedResponse, replay: bool) -> Response {
    let status = StatusCode::from_u16(captured.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        captured.body,
    )
        .into_response();
    if replay {
        response.headers_mut().insert(
            HeaderName::from_static(REPLAY_HEADER),
            HeaderValue::from_static("true"),
        );
    }
    response
}

fn error_response(err: &Error) -> Response {
    respond(failure(err), false)
}

fn caller_id(headers: &HeaderMap) -> Result<String, Error> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(Error::Unauthorized)
}

/// First hop of `x-forwarded-for`, else the peer address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

/// An authenticated, possibly idempotency-keyed mutation request.
struct Call {
    caller: String,
    key: Option<IdempotencyKey>,
    body: Value,
}

impl Call {
    fn parse(headers: &HeaderMap, body: &[u8], key_required: bool) -> Result<Self, Error> {
        let caller = caller_id(headers)?;
        let key = match headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .map(|value| value.to_str().unwrap_or_default())
        {
            Some(raw) => Some(IdempotencyKey::parse(raw)?),
            None if key_required => {
                return Err(Error::Validation(
                    "X-Idempotency-Key header is required".into(),
                ))
            }
            None => None,
        };
        let body = if body.iter().all(u8::is_ascii_whitespace) {
            json!({})
        } else {
            serde_json::from_slice(body)
                .map_err(|err| Error::Validation(format!("invalid JSON body: {err}")))?
        };
        Ok(Self { caller, key, body })
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(self.body.clone())
            .map_err(|err| Error::Validation(format!("invalid request body: {err}")))
    }

    /// Runs `handler` through the idempotency ledger when a key was sent.
    async fn guarded<F, Fut>(
        &self,
        arena: &Arena,
        scope: &str,
        params: Value,
        query: Value,
        handler: F,
    ) -> Response
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CapturedResponse>,
    {
        let Some(key) = &self.key else {
            return respond(handler().await, false);
        };
        let request_hash = fingerprint(&self.body, &query, &params);
        match arena
            .ledger()
            .execute(key, scope, &self.caller, &request_hash, now_ms(), handler)
            .await
        {
            Ok(outcome) => {
                let replay = outcome.is_replay();
                if replay {
                    arena.metrics().inc_idempotent_replay();
                }
                respond(outcome.into_response(), replay)
            }
            Err(LedgerError::InFlight) => {
                arena.metrics().inc_idempotency_conflict();
                error_response(&Error::Conflict(
                    "a request with this idempotency key is still processing".into(),
                ))
            }
            Err(LedgerError::KeyReuse) => {
                arena.metrics().inc_idempotency_conflict();
                error_response(&Error::Conflict(
                    "idempotency key was already used with a different request".into(),
                ))
            }
            Err(LedgerError::Store(err)) => error_response(&err.into()),
        }
    }
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

pub(super) async fn create_tournament(
    AxumState(arena): AxumState<Arc<Arena>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let call = match Call::parse(&headers, &body, false) {
        Ok(call) => call,
        Err(err) => return error_response(&err),
    };
    let input: NewTournament = match call.decode() {
        Ok(input) => input,
        Err(err) => return error_response(&err),
    };
    let arena_ref = arena.as_ref();
    let caller = call.caller.as_str();
    call.guarded(arena_ref, "create_tournament", json!({}), json!({}), move || async move {
        outcome_of(
            StatusCode::CREATED,
            arena_ref.create_tournament(caller, input, now_ms()).await,
        )
    })
    .await
}

pub(super) async fn get_tournament(
    AxumState(arena): AxumState<Arc<Arena>>,
    Path(tournament_id): Path<String>,
) -> Response {
    respond(
        outcome_of(StatusCode::OK, arena.tournament(&tournament_id).await),
        false,
    )
}

pub(super) async fn get_matches(
    AxumState(arena): AxumState<Arc<Arena>>,
    Path(tournament_id): Path<String>,
) -> Response {
    respond(
        outcome_of(StatusCode::OK, arena.matches(&tournament_id, now_ms()).await),
        false,
    )
}

/// Serves both `/register` and `/join`; they share one idempotency scope.
pub(super) async fn register(
    AxumState(arena): AxumState<Arc<Arena>>,
    Path(tournament_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let call = match Call::parse(&headers, &body, true) {
        Ok(call) => call,
        Err(err) => return error_response(&err),
    };
    let request: RegisterBody = match call.decode() {
        Ok(request) => request,
        Err(err) => return error_response(&err),
    };
    let scope = format!("register:{tournament_id}");
    let params = json!({ "id": tournament_id });
    let arena_ref = arena.as_ref();
    let caller = call.caller.as_str();
    call.guarded(arena_ref, &scope, params, json!({}), move || async move {
        registration_response(
            arena_ref
                .register(&tournament_id, caller, request.team_id, now_ms())
                .await,
        )
    })
    .await
}

pub(super) async fn leave(
    AxumState(arena): AxumState<Arc<Arena>>,
    Path(tournament_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let call = match Call::parse(&headers, &body, true) {
        Ok(call) => call,
        Err(err) => return error_response(&err),
    };
    let scope = format!("leave:{tournament_id}");
    let params = json!({ "id": tournament_id });
    let arena_ref = arena.as_ref();
    let caller = call.caller.as_str();
    call.guarded(arena_ref, &scope, params, json!({}), move || async move {
        outcome_of(
            StatusCode::OK,
            arena_ref.withdraw(&tournament_id, caller, None, now_ms()).await,
        )
    })
    .await
}

pub(super) async fn remove_player(
    AxumState(arena): AxumState<Arc<Arena>>,
    Path((tournament_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let call = match Call::parse(&headers, &body, true) {
        Ok(call) => call,
        Err(err) => return error_response(&err),
    };
    let scope = format!("remove_player:{tournament_id}");
    let params = json!({ "id": tournament_id, "userId": user_id });
    let arena_ref = arena.as_ref();
    let caller = call.caller.as_str();
    call.guarded(arena_ref, &scope, params, json!({}), move || async move {
        outcome_of(
            StatusCode::OK,
            arena_ref
                .withdraw(&tournament_id, caller, Some(&user_id), now_ms())
                .await,
        )
    })
    .await
}

pub(super) async fn list_requests(
    AxumState(arena): AxumState<Arc<Arena>>,
    Path(tournament_id): Path<String>,
    Query(query): Query<RequestsQuery>,
    headers: HeaderMap,
) -> Response {
    let caller = match caller_id(&headers) {
        Ok(caller) => caller,
        Err(err) => return error_response(&err),
    };
    let status = match query.status.as_deref().map(str::parse::<RequestStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(reason)) => return error_response(&Error::Validation(reason.to_string())),
    };
    respond(
        outcome_of(
            StatusCode::OK,
            arena.list_requests(&tournament_id, &caller, status).await,
        ),
        false,
    )
}

pub(super) async fn approve_request(
    AxumState(arena): AxumState<Arc<Arena>>,
    Path((tournament_id, team_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    review(arena, tournament_id, team_id, headers, body, true).await
}

pub(super) async fn reject_request(
    AxumState(arena): AxumState<Arc<Arena>>,
    Path((tournament_id, team_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    review(arena, tournament_id, team_id, headers, body, false).await
}

async fn review(
    arena: Arc<Arena>,
    tournament_id: String,
    team_id: String,
    headers: HeaderMap,
    body: Bytes,
    approve: bool,
) -> Response {
    let call = match Call::parse(&headers, &body, true) {
        Ok(call) => call,
        Err(err) => return error_response(&err),
    };
    let request: ReviewBody = match call.decode() {
        Ok(request) => request,
        Err(err) => return error_response(&err),
    };
    let verb = if approve { "approve" } else { "reject" };
    let scope = format!("{verb}:{tournament_id}:{team_id}");
    let params = json!({ "id": tournament_id, "teamId": team_id });
    let arena_ref = arena.as_ref();
    let caller = call.caller.as_str();
    call.guarded(arena_ref, &scope, params, json!({}), move || async move {
        let now = now_ms();
        let result = if approve {
            arena_ref
                .approve_team(&tournament_id, &team_id, caller, request.note, now)
                .await
        } else {
            arena_ref
                .reject_team(&tournament_id, &team_id, caller, request.note, now)
                .await
        };
        outcome_of(StatusCode::OK, result)
    })
    .await
}

pub(super) async fn start_tournament(
    AxumState(arena): AxumState<Arc<Arena>>,
    Path(tournament_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let call = match Call::parse(&headers, &body, false) {
        Ok(call) => call,
        Err(err) => return error_response(&err),
    };
    let scope = format!("start:{tournament_id}");
    let params = json!({ "id": tournament_id });
    let arena_ref = arena.as_ref();
    let caller = call.caller.as_str();
    call.guarded(arena_ref, &scope, params, json!({}), move || async move {
        outcome_of(
            StatusCode::OK,
            arena_ref.start_tournament(&tournament_id, caller, now_ms()).await,
        )
    })
    .await
}

pub(super) async fn distribute_prizes(
    AxumState(arena): AxumState<Arc<Arena>>,
    Path(tournament_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let call = match Call::parse(&headers, &body, false) {
        Ok(call) => call,
        Err(err) => return error_response(&err),
    };
    let scope = format!("distribute:{tournament_id}");
    let params = json!({ "id": tournament_id });
    let arena_ref = arena.as_ref();
    let caller = call.caller.as_str();
    call.guarded(arena_ref, &scope, params, json!({}), move || async move {
        outcome_of(
            StatusCode::OK,
            arena_ref
                .distribute_prizes_as(caller, &tournament_id, now_ms())
                .await,
        )
    })
    .await
}

pub(super) async fn prize_status(
    AxumState(arena): AxumState<Arc<Arena>>,
    Path(tournament_id): Path<String>,
) -> Response {
    respond(
        outcome_of(StatusCode::OK, arena.prize_status(&tournament_id).await),
        false,
    )
}

pub(super) async fn apply_referral(
    AxumState(arena): AxumState<Arc<Arena>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let call = match Call::parse(&headers, &body, false) {
        Ok(call) => call,
        Err(err) => return error_response(&err),
    };
    let request: ReferralBody = match call.decode() {
        Ok(request) => request,
        Err(err) => return error_response(&err),
    };
    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    let device = device_fingerprint(&headers);
    let arena_ref = arena.as_ref();
    let caller = call.caller.as_str();
    call.guarded(arena_ref, "apply_referral", json!({}), json!({}), move || async move {
        outcome_of(
            StatusCode::OK,
            arena_ref
                .apply_referral(caller, &request.code, ip.as_deref(), &device, now_ms())
                .await,
        )
    })
    .await
}

pub(super) async fn prometheus_metrics(
    headers: HeaderMap,
    AxumState(arena): AxumState<Arc<Arena>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    let body = render_prometheus_metrics(&arena);
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        body,
    )
        .into_response()
}

fn metrics_auth_error(headers: &HeaderMap) -> Option<StatusCode> {
    let token = std::env::var("METRICS_AUTH_TOKEN").unwrap_or_default();
    if token.is_empty() {
        return None;
    }
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    let header_token = headers
        .get("x-metrics-token")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if bearer.as_deref() == Some(token.as_str()) || header_token.as_deref() == Some(token.as_str()) {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}

fn render_prometheus_metrics(arena: &Arena) -> String {
    let mut out = String::new();
    let counters = arena.counters();
    for (name, value) in [
        ("gauntlet_registrations_admitted_total", counters.registrations_admitted),
        ("gauntlet_team_requests_submitted_total", counters.team_requests_submitted),
        ("gauntlet_team_requests_approved_total", counters.team_requests_approved),
        ("gauntlet_team_requests_rejected_total", counters.team_requests_rejected),
        ("gauntlet_capacity_rejections_total", counters.capacity_rejections),
        ("gauntlet_admission_compensations_total", counters.admission_compensations),
        ("gauntlet_withdrawals_total", counters.withdrawals),
        ("gauntlet_idempotent_replays_total", counters.idempotent_replays),
        ("gauntlet_idempotency_conflicts_total", counters.idempotency_conflicts),
        ("gauntlet_guard_rejections_total", counters.guard_rejections),
        ("gauntlet_referrals_applied_total", counters.referrals_applied),
        ("gauntlet_brackets_generated_total", counters.brackets_generated),
        ("gauntlet_matches_force_completed_total", counters.matches_force_completed),
        ("gauntlet_room_credentials_revealed_total", counters.room_credentials_revealed),
        ("gauntlet_jobs_executed_total", counters.jobs_executed),
        ("gauntlet_job_failures_total", counters.job_failures),
        ("gauntlet_prizes_distributed_total", counters.prizes_distributed),
        ("gauntlet_prize_rollbacks_total", counters.prize_rollbacks),
    ] {
        append_counter(&mut out, name, value);
    }

    let rejects = arena.http_metrics().snapshot();
    append_counter(&mut out, "gauntlet_http_reject_origin_total", rejects.origin);
    append_counter(&mut out, "gauntlet_http_reject_body_limit_total", rejects.body_limit);
    append_counter(&mut out, "gauntlet_http_reject_rate_limit_total", rejects.rate_limit);

    for (name, snapshot) in arena.latencies() {
        append_histogram(&mut out, name, &snapshot);
    }
    out
}

fn append_counter(out: &mut String, name: &str, value: u64) {
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn append_histogram(out: &mut String, name: &str, snapshot: &LatencySnapshot) {
    let _ = writeln!(out, "# TYPE {name} histogram");
    let mut cumulative = 0u64;
    for (bucket, count) in snapshot.buckets_ms.iter().zip(snapshot.counts.iter()) {
        cumulative = cumulative.saturating_add(*count);
        let _ = writeln!(out, "{name}_bucket{{le=\"{bucket}\"}} {cumulative}");
    }
    cumulative = cumulative.saturating_add(snapshot.overflow);
    let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(out, "{name}_count {}", snapshot.count);
    let sum = snapshot.avg_ms * snapshot.count as f64;
    let _ = writeln!(out, "{name}_sum {sum}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses() {
        assert_eq!(status_for(&Error::AlreadyRegistered), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&Error::RequestPending), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&Error::RateLimited { retry_after_ms: 5 }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(status_for(&Error::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(&Error::Transient("db".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn error_envelope_carries_counts_and_hides_internals() {
        let full = failure(&Error::CapacityExceeded {
            current: 2,
            max: 2,
            unit: gauntlet_types::CapacityUnit::Players,
        });
        assert_eq!(full.status, 400);
        let body: Value = serde_json::from_slice(&full.body).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "tournament_full");
        assert_eq!(body["current"], 2);
        assert_eq!(body["max"], 2);
        assert!(body.get("retryAfterMs").is_none());

        let internal = failure(&Error::Transient("sqlite error: disk I/O".into()));
        let body: Value = serde_json::from_slice(&internal.body).unwrap();
        assert!(!body["error"].as_str().unwrap().contains("sqlite"));
    }

    #[test]
    fn call_requires_identity_and_key() {
        let mut headers = HeaderMap::new();
        assert_eq!(Call::parse(&headers, b"", false).err(), Some(Error::Unauthorized));

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("u1"));
        assert!(matches!(
            Call::parse(&headers, b"", true).err(),
            Some(Error::Validation(_))
        ));
        let call = Call::parse(&headers, b"  ", false).unwrap();
        assert_eq!(call.body, json!({}));
        assert!(call.key.is_none());

        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("key-000001"));
        let call = Call::parse(&headers, br#"{"teamId":"red"}"#, true).unwrap();
        let body: RegisterBody = call.decode().unwrap();
        assert_eq!(body.team_id.as_deref(), Some("red"));
        assert!(matches!(
            Call::parse(&headers, b"{not json", true).err(),
            Some(Error::Validation(_))
        ));
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let peer: SocketAddr = "10.0.0.9:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(peer)).as_deref(), Some("10.0.0.9"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, Some(peer)).as_deref(), Some("203.0.113.7"));
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }
}
