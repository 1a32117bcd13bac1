use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use gauntlet_server::collaborators::{InMemoryDirectory, Team, UserProfile};
use gauntlet_server::{Api, Arena, ArenaConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const ADMIN: &str = "admin";

fn app() -> (Router, Arc<Arena>) {
    let (app, arena, _) = app_with_directory();
    (app, arena)
}

fn app_with_directory() -> (Router, Arc<Arena>, Arc<InMemoryDirectory>) {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.put_user(UserProfile {
        id: ADMIN.into(),
        is_admin: true,
        has_subscription: true,
        ..UserProfile::default()
    });
    for id in ["p1", "p2", "p3"] {
        directory.put_user(UserProfile {
            id: id.into(),
            free_entries: 1,
            email_verified: true,
            ..UserProfile::default()
        });
    }
    let arena = Arc::new(Arena::in_memory(ArenaConfig::unthrottled(), directory.clone()));
    (Api::new(arena.clone()).router(), arena, directory)
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    user: Option<&str>,
    key: Option<&str>,
    body: Value,
) -> (StatusCode, Option<String>, Value) {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(user) = user {
        request = request.header("x-user-id", user);
    }
    if let Some(key) = key {
        request = request.header("x-idempotency-key", key);
    }
    let response = app
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let replay = response
        .headers()
        .get("x-idempotent-replay")
        .map(|value| value.to_str().unwrap().to_string());
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, replay, body)
}

async fn solo_cup(app: &Router, capacity: u32) -> String {
    let (status, _, body) = call(
        app,
        "POST",
        "/tournaments",
        Some(ADMIN),
        None,
        json!({
            "name": "Friday Cup",
            "kind": "solo",
            "capacityPlayers": capacity,
            "startDate": 4_000_000_000_000u64,
            "endDate": 4_000_100_000_000u64,
            "prizePool": 1_000,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["data"]["id"].as_str().unwrap().to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_is_enforced_over_http() {
    let (app, arena) = app();
    let id = solo_cup(&app, 2).await;
    let register = format!("/tournaments/{id}/register");

    let (first, second, third) = tokio::join!(
        call(&app, "POST", &register, Some("p1"), Some("join-p1-0001"), json!({})),
        call(&app, "POST", &register, Some("p2"), Some("join-p2-0001"), json!({})),
        call(&app, "POST", &register, Some("p3"), Some("join-p3-0001"), json!({})),
    );
    let results = [("p1", first), ("p2", second), ("p3", third)];
    let admitted: Vec<&str> = results
        .iter()
        .filter(|(_, (status, _, _))| *status == StatusCode::CREATED)
        .map(|(user, _)| *user)
        .collect();
    assert_eq!(admitted.len(), 2);
    let (loser, (status, _, body)) = results
        .iter()
        .find(|(_, (status, _, _))| *status != StatusCode::CREATED)
        .unwrap();
    let loser = *loser;
    assert_eq!(*status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "tournament_full");
    assert_eq!(body["current"], 2);
    assert_eq!(body["max"], 2);
    assert!(body["error"].as_str().unwrap().starts_with("Tournament is full"));

    // The same key replays the failure; a new key re-checks capacity.
    let key = format!("join-{loser}-0001");
    let (status, replay, replayed) =
        call(&app, "POST", &register, Some(loser), Some(&key), json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(replay.as_deref(), Some("true"));
    assert_eq!(&replayed, body);
    let key = format!("join-{loser}-0002");
    let (status, replay, body) =
        call(&app, "POST", &register, Some(loser), Some(&key), json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(replay.is_none());
    assert_eq!(body["code"], "tournament_full");

    let (status, _, body) =
        call(&app, "GET", &format!("/tournaments/{id}"), None, None, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let mut registered: Vec<String> =
        serde_json::from_value(body["data"]["registeredPlayerIds"].clone()).unwrap();
    registered.sort();
    assert_eq!(registered, admitted);
    assert_eq!(arena.counters().capacity_rejections, 2);
    assert_eq!(arena.counters().registrations_admitted, 2);
}

#[tokio::test]
async fn idempotency_key_replays_and_rejects_reuse() {
    let (app, arena) = app();
    let id = solo_cup(&app, 8).await;
    let register = format!("/tournaments/{id}/register");
    let join = format!("/tournaments/{id}/join");

    let (status, _, first) =
        call(&app, "POST", &register, Some("p1"), Some("join-p1-0001"), json!({})).await;
    assert_eq!(status, StatusCode::CREATED);

    // Same key on the alias route replays the stored response.
    let (status, replay, again) =
        call(&app, "POST", &join, Some("p1"), Some("join-p1-0001"), json!({})).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(replay.as_deref(), Some("true"));
    assert_eq!(again, first);

    // A fresh key re-runs admission.
    let (status, _, body) =
        call(&app, "POST", &register, Some("p1"), Some("join-p1-0002"), json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    // Same key, different body.
    let (status, _, body) = call(
        &app,
        "POST",
        &register,
        Some("p1"),
        Some("join-p1-0001"),
        json!({ "teamId": "red" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");

    // Keys are scoped per caller.
    let (status, replay, _) =
        call(&app, "POST", &register, Some("p2"), Some("join-p1-0001"), json!({})).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(replay.is_none());

    let counters = arena.counters();
    assert_eq!(counters.idempotent_replays, 1);
    assert_eq!(counters.idempotency_conflicts, 1);
    assert_eq!(counters.registrations_admitted, 2);
}

#[tokio::test]
async fn mutations_require_identity_and_key() {
    let (app, _) = app();
    let id = solo_cup(&app, 8).await;
    let register = format!("/tournaments/{id}/register");

    let (status, _, _) = call(&app, "POST", &register, None, Some("join-anon-01"), json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, body) = call(&app, "POST", &register, Some("p1"), None, json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _, _) = call(
        &app,
        "POST",
        "/tournaments/missing/register",
        Some("p1"),
        Some("join-p1-0001"),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = call(
        &app,
        "POST",
        &format!("/tournaments/{id}/start"),
        Some("p1"),
        None,
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn team_requests_are_reviewed_over_http() {
    let (app, _, directory) = app_with_directory();
    directory.put_user(UserProfile {
        id: "p4".into(),
        free_entries: 1,
        email_verified: true,
        ..UserProfile::default()
    });
    let (status, _, body) = call(
        &app,
        "POST",
        "/tournaments",
        Some(ADMIN),
        None,
        json!({
            "name": "Team Clash",
            "kind": "team",
            "capacityTeams": 4,
            "capacityPlayers": 8,
            "startDate": 4_000_000_000_000u64,
            "endDate": 4_000_100_000_000u64,
            "prizePool": 1_000,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let id = body["data"]["id"].as_str().unwrap().to_string();
    let teams = [
        ("red", "p1", vec!["p2"]),
        ("blue", "p3", Vec::new()),
        ("green", "p4", Vec::new()),
    ];
    for (team, captain, members) in teams {
        directory.put_team(Team {
            id: team.into(),
            name: team.to_uppercase(),
            captain_id: captain.into(),
            member_ids: members.into_iter().map(String::from).collect(),
            tournament_id: Some(id.clone()),
        });
        let key = format!("join-{captain}-0001");
        let (status, _, body) = call(
            &app,
            "POST",
            &format!("/tournaments/{id}/register"),
            Some(captain),
            Some(&key),
            json!({ "teamId": team }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED, "{body}");
        assert_eq!(body["pendingApproval"], true);
    }

    let requests = format!("/tournaments/{id}/requests?status=pending");
    let (status, _, body) = call(&app, "GET", &requests, Some(ADMIN), None, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 3);
    let (status, _, _) = call(&app, "GET", &requests, Some("p1"), None, json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _, _) = call(
        &app,
        "GET",
        &format!("/tournaments/{id}/requests?status=maybe"),
        Some(ADMIN),
        None,
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let approve = |team: &str| format!("/tournaments/{id}/requests/{team}/approve");
    let reject = |team: &str| format!("/tournaments/{id}/requests/{team}/reject");
    let (status, _, _) =
        call(&app, "POST", &approve("red"), Some("p1"), Some("approve-red-0001"), json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let welcome = json!({ "note": "welcome" });
    let (status, replay, approved) = call(
        &app,
        "POST",
        &approve("red"),
        Some(ADMIN),
        Some("approve-red-0001"),
        welcome.clone(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{approved}");
    assert!(replay.is_none());
    assert_eq!(approved["data"]["registeredTeamIds"], json!(["red"]));
    assert_eq!(approved["data"]["registeredPlayerIds"], json!(["p1", "p2"]));
    // A retried approval replays instead of failing as already reviewed.
    let (status, replay, again) = call(
        &app,
        "POST",
        &approve("red"),
        Some(ADMIN),
        Some("approve-red-0001"),
        welcome,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay.as_deref(), Some("true"));
    assert_eq!(again, approved);
    let (status, _, body) =
        call(&app, "POST", &approve("red"), Some(ADMIN), Some("approve-red-0002"), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");
    let (status, _, _) =
        call(&app, "POST", &reject("red"), Some(ADMIN), Some("reject-red-0001"), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, _) =
        call(&app, "POST", &approve("blue"), Some(ADMIN), Some("approve-blue-001"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, rejected) = call(
        &app,
        "POST",
        &reject("green"),
        Some(ADMIN),
        Some("reject-green-01"),
        json!({ "note": "roster incomplete" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{rejected}");
    let green = rejected["data"]["pendingRequests"]
        .as_array()
        .unwrap()
        .iter()
        .find(|request| request["teamId"] == "green")
        .unwrap()
        .clone();
    assert_eq!(green["status"], "rejected");
    assert_eq!(green["note"], "roster incomplete");

    let start = format!("/tournaments/{id}/start");
    let (status, _, _) = call(&app, "POST", &start, Some("p1"), None, json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, replay, started) =
        call(&app, "POST", &start, Some(ADMIN), Some("start-cup-0001"), json!({})).await;
    assert_eq!(status, StatusCode::OK, "{started}");
    assert!(replay.is_none());
    assert_eq!(started["data"]["tournament"]["status"], "ongoing");
    assert_eq!(started["data"]["tournament"]["registrationOpen"], false);
    assert_eq!(started["data"]["matches"].as_array().unwrap().len(), 1);
    let (status, replay, again) =
        call(&app, "POST", &start, Some(ADMIN), Some("start-cup-0001"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay.as_deref(), Some("true"));
    assert_eq!(again, started);

    let (status, _, body) = call(
        &app,
        "GET",
        &format!("/prizes/tournament/{id}/status"),
        None,
        None,
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["tournamentId"], id.as_str());
    assert_eq!(body["data"]["prizeStatus"], "pending");
    assert_eq!(body["data"]["prizePool"], 1_000);
    assert!(body["data"].get("prizeDistribution").is_none());
    let (status, _, _) = call(
        &app,
        "GET",
        "/prizes/tournament/missing/status",
        None,
        None,
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn healthz_responds() {
    let (app, _) = app();
    let (status, _, body) = call(&app, "GET", "/healthz", None, None, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}
