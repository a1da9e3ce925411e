//! Control API integration tests.
//!
//! Room administration, agent registration, token refresh, stats, sessions
//! and rate limiting over real HTTP.

// Test code is allowed to use expect/unwrap for assertions
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use anyhow::Result;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use signaling_test_utils::{TestSignalingServer, WsClient};

async fn create_room(server: &TestSignalingServer, token: &str, body: Value) -> Result<Value> {
    let response = Client::new()
        .post(format!("{}/api/rooms", server.url()))
        .bearer_auth(token)
        .json(&body)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await?;
    Ok(body["data"].clone())
}

#[tokio::test]
async fn test_room_lifecycle() -> Result<()> {
    let server = TestSignalingServer::spawn().await?;
    let token = server.access_token("alice")?;
    let client = Client::new();

    let room = create_room(
        &server,
        &token,
        json!({
            "name": "Design review",
            "type": "voice",
            "topic": "General AI",
            "connectionUrl": "ws://host-agent:8765",
            "settings": {"allowRecording": true}
        }),
    )
    .await?;
    let room_id = room["id"].as_str().unwrap().to_string();
    assert_eq!(room["name"], "Design review");
    assert_eq!(room["type"], "voice");
    assert_eq!(room["owner"], "alice");
    assert_eq!(room["topic"], "General AI");
    assert_eq!(room["settings"]["recordingAllowed"], true);
    assert_eq!(room["settings"]["maxDurationMinutes"], 60);
    assert_eq!(room["settings"]["voice"]["noiseSuppression"], true);

    // Listing is public and carries counts.
    let list: Value = client
        .get(format!("{}/api/rooms", server.url()))
        .send()
        .await?
        .json()
        .await?;
    let rooms = list["data"]["rooms"].as_array().unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0]["id"], room_id.as_str());
    assert_eq!(rooms[0]["participantCount"], 0);
    assert_eq!(rooms[0]["connectionUrl"], "ws://host-agent:8765");

    // Detail requires auth.
    let response = client
        .get(format!("{}/api/rooms/{}", server.url(), room_id))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("www-authenticate"));

    let detail: Value = client
        .get(format!("{}/api/rooms/{}", server.url(), room_id))
        .bearer_auth(&token)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(detail["data"]["participants"].as_array().unwrap().len(), 0);

    // Settings merge: untouched fields keep their values.
    let updated: Value = client
        .patch(format!("{}/api/rooms/{}/settings", server.url(), room_id))
        .bearer_auth(&token)
        .json(&json!({"muteOnEntry": true, "musicMode": true}))
        .send()
        .await?
        .json()
        .await?;
    let settings = &updated["data"]["settings"];
    assert_eq!(settings["muteOnEntry"], true);
    assert_eq!(settings["recordingAllowed"], true);
    assert_eq!(settings["voice"]["musicMode"], true);

    let deleted = client
        .delete(format!("{}/api/rooms/{}", server.url(), room_id))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(deleted.status(), StatusCode::OK);
    let body: Value = deleted.json().await?;
    assert_eq!(body["data"]["deleted"], true);

    let missing = client
        .get(format!("{}/api/rooms/{}", server.url(), room_id))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let body: Value = missing.json().await?;
    assert_eq!(body["error"]["code"], "ROOM_NOT_FOUND");

    Ok(())
}

#[tokio::test]
async fn test_only_owner_may_modify_room() -> Result<()> {
    let server = TestSignalingServer::spawn().await?;
    let owner = server.access_token("alice")?;
    let intruder = server.access_token("mallory")?;
    let client = Client::new();

    let room = create_room(&server, &owner, json!({"name": "private"})).await?;
    let room_id = room["id"].as_str().unwrap();

    let response = client
        .delete(format!("{}/api/rooms/{}", server.url(), room_id))
        .bearer_auth(&intruder)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], "FORBIDDEN");

    let response = client
        .patch(format!("{}/api/rooms/{}/settings", server.url(), room_id))
        .bearer_auth(&intruder)
        .json(&json!({"muteOnEntry": true}))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Room is untouched.
    let response = client
        .get(format!("{}/api/rooms/{}", server.url(), room_id))
        .bearer_auth(&owner)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    Ok(())
}

#[tokio::test]
async fn test_create_room_validation() -> Result<()> {
    let server = TestSignalingServer::spawn().await?;
    let token = server.access_token("alice")?;
    let client = Client::new();

    let unauthenticated = client
        .post(format!("{}/api/rooms", server.url()))
        .json(&json!({"name": "x"}))
        .send()
        .await?;
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

    for body in [json!({"name": "   "}), json!({"type": "voice"}), json!({"name": "x", "type": "hologram"})] {
        let response = client
            .post(format!("{}/api/rooms", server.url()))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
    }

    // A refresh token is not an access token.
    let refresh = server.refresh_token("alice")?;
    let response = client
        .post(format!("{}/api/rooms", server.url()))
        .bearer_auth(&refresh)
        .json(&json!({"name": "x"}))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    Ok(())
}

#[tokio::test]
async fn test_join_token_issue_and_capacity() -> Result<()> {
    let server =
        TestSignalingServer::spawn_with("sig-test", &[("MAX_PARTICIPANTS_PER_ROOM", "1")], None)
            .await?;
    let token = server.access_token("alice")?;
    let client = Client::new();

    let room = create_room(&server, &token, json!({"name": "one-seat"})).await?;
    let room_id = room["id"].as_str().unwrap().to_string();

    let response = client
        .post(format!("{}/api/rooms/{}/join", server.url(), room_id))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body["data"]["roomId"], room_id.as_str());
    assert_eq!(body["data"]["expiresIn"], 300);
    let join_token = body["data"]["token"].as_str().unwrap().to_string();

    let mut ws = WsClient::connect(&server.ws_url(&join_token)).await?;
    ws.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    ws.recv_type("joined").await?;

    let full = client
        .post(format!("{}/api/rooms/{}/join", server.url(), room_id))
        .bearer_auth(&server.access_token("bob")?)
        .send()
        .await?;
    assert_eq!(full.status(), StatusCode::CONFLICT);
    let body: Value = full.json().await?;
    assert_eq!(body["error"]["code"], "ROOM_FULL");

    let missing = client
        .post(format!(
            "{}/api/rooms/00000000-0000-4000-8000-000000000000/join",
            server.url()
        ))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_agent_registration_and_refresh() -> Result<()> {
    let server = TestSignalingServer::spawn().await?;
    let client = Client::new();

    let response = client
        .post(format!("{}/api/agents/register", server.url()))
        .json(&json!({"name": "Scout", "emoji": "🛰", "color": "#00FF00"}))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await?;
    let data = &body["data"];
    let agent_id = data["agentId"].as_str().unwrap().to_string();
    assert!(agent_id.starts_with("agent-"));
    assert_eq!(data["apiKey"], data["accessToken"]);
    assert_eq!(data["name"], "Scout");
    assert_eq!(data["color"], "#00FF00");
    assert_eq!(data["expiresIn"], 900);

    let api_key = data["apiKey"].as_str().unwrap().to_string();
    let refresh = data["refreshToken"].as_str().unwrap().to_string();

    let me: Value = client
        .get(format!("{}/api/agents/me", server.url()))
        .bearer_auth(&api_key)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(me["data"]["id"], agent_id.as_str());
    assert_eq!(me["data"]["agentId"], agent_id.as_str());
    assert_eq!(me["data"]["name"], "Scout");
    assert_eq!(me["data"]["emoji"], "🛰");
    assert_eq!(me["data"]["color"], "#00FF00");
    assert!(me["data"]["expiresAt"].is_string());

    let refreshed = client
        .post(format!("{}/api/auth/refresh", server.url()))
        .json(&json!({"refreshToken": refresh}))
        .send()
        .await?;
    assert_eq!(refreshed.status(), StatusCode::OK);
    let body: Value = refreshed.json().await?;
    let new_access = body["data"]["accessToken"].as_str().unwrap();

    let me = client
        .get(format!("{}/api/agents/me", server.url()))
        .bearer_auth(new_access)
        .send()
        .await?;
    assert_eq!(me.status(), StatusCode::OK);

    // The profile survives refresh.
    let me: Value = me.json().await?;
    assert_eq!(me["data"]["id"], agent_id.as_str());
    assert_eq!(me["data"]["emoji"], "🛰");
    assert_eq!(me["data"]["color"], "#00FF00");

    // An access token cannot be used as a refresh token.
    let wrong_kind = client
        .post(format!("{}/api/auth/refresh", server.url()))
        .json(&json!({"refreshToken": api_key}))
        .send()
        .await?;
    assert_eq!(wrong_kind.status(), StatusCode::UNAUTHORIZED);

    Ok(())
}

#[tokio::test]
async fn test_registration_secret_enforced_when_configured() -> Result<()> {
    let server = TestSignalingServer::spawn_with(
        "sig-test",
        &[("AGENT_REGISTRATION_SECRET", "let-agents-in")],
        None,
    )
    .await?;
    let client = Client::new();
    let url = format!("{}/api/agents/register", server.url());

    let missing = client.post(&url).json(&json!({"name": "Scout"})).send().await?;
    assert_eq!(missing.status(), StatusCode::FORBIDDEN);

    let wrong = client
        .post(&url)
        .header("X-Registration-Secret", "let-agents-out")
        .json(&json!({"name": "Scout"}))
        .send()
        .await?;
    assert_eq!(wrong.status(), StatusCode::FORBIDDEN);

    let right = client
        .post(&url)
        .header("X-Registration-Secret", "let-agents-in")
        .json(&json!({"name": "Scout"}))
        .send()
        .await?;
    assert_eq!(right.status(), StatusCode::CREATED);

    Ok(())
}

#[tokio::test]
async fn test_stats_and_sessions() -> Result<()> {
    let server = TestSignalingServer::spawn().await?;
    let token = server.access_token("alice")?;
    let client = Client::new();

    let room = create_room(&server, &token, json!({"name": "stats"})).await?;
    let room_id = room["id"].as_str().unwrap().to_string();

    let mut ws = WsClient::connect(&server.ws_url(&token)).await?;
    ws.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    ws.recv_type("joined").await?;

    let stats: Value = client
        .get(format!("{}/api/stats", server.url()))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(stats["data"]["rooms"], 1);
    assert_eq!(stats["data"]["participants"], 1);
    assert_eq!(stats["data"]["connections"], 1);
    assert_eq!(stats["data"]["instanceId"], "sig-test");
    assert_eq!(stats["data"]["clusterMode"], "standalone");

    let sessions: Value = client
        .get(format!("{}/api/sessions", server.url()))
        .bearer_auth(&token)
        .send()
        .await?
        .json()
        .await?;
    let sessions = sessions["data"]["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["roomId"], room_id.as_str());
    assert_eq!(sessions[0]["instanceId"], "sig-test");

    Ok(())
}

#[tokio::test]
async fn test_rate_limit_returns_429_with_retry_after() -> Result<()> {
    let server =
        TestSignalingServer::spawn_with("sig-test", &[("RATE_LIMIT_AUTH", "2")], None).await?;
    let client = Client::new();
    let url = format!("{}/api/agents/register", server.url());

    let mut statuses = Vec::new();
    for _ in 0..5 {
        let response = client.post(&url).json(&json!({"name": "Scout"})).send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            assert!(response.headers().contains_key("retry-after"));
            let body: Value = response.json().await?;
            assert_eq!(body["error"]["code"], "RATE_LIMITED");
        }
        statuses.push(status);
    }

    // Two per window; a window rollover mid-loop can allow two more.
    let allowed = statuses.iter().filter(|s| **s == StatusCode::CREATED).count();
    assert!((2..=4).contains(&allowed), "statuses: {statuses:?}");
    assert!(statuses.contains(&StatusCode::TOO_MANY_REQUESTS));

    // Other classes are unaffected.
    let rooms = client.get(format!("{}/api/rooms", server.url())).send().await?;
    assert_eq!(rooms.status(), StatusCode::OK);
    assert!(rooms.headers().contains_key("x-ratelimit-remaining"));

    Ok(())
}

#[tokio::test]
async fn test_rotating_forwarded_for_does_not_reset_budget() -> Result<()> {
    let server =
        TestSignalingServer::spawn_with("sig-test", &[("RATE_LIMIT_AUTH", "2")], None).await?;
    let client = Client::new();
    let url = format!("{}/api/agents/register", server.url());

    let mut allowed = 0;
    for i in 0..6 {
        let response = client
            .post(&url)
            .header("x-forwarded-for", format!("10.0.0.{i}"))
            .json(&json!({"name": "Scout"}))
            .send()
            .await?;
        if response.status() == StatusCode::CREATED {
            allowed += 1;
        }
    }

    // Keyed on the peer address; at most one window rollover.
    assert!(allowed <= 4, "allowed {allowed} of 6");

    Ok(())
}

#[tokio::test]
async fn test_trusted_forwarded_for_keys_per_client() -> Result<()> {
    let server = TestSignalingServer::spawn_with(
        "sig-test",
        &[("RATE_LIMIT_AUTH", "1"), ("TRUST_FORWARDED_FOR", "true")],
        None,
    )
    .await?;
    let client = Client::new();
    let url = format!("{}/api/agents/register", server.url());

    for i in 0..3 {
        let response = client
            .post(&url)
            .header("x-forwarded-for", format!("203.0.113.{i}"))
            .json(&json!({"name": "Scout"}))
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    Ok(())
}

#[tokio::test]
async fn test_operational_endpoints() -> Result<()> {
    let server = TestSignalingServer::spawn().await?;

    let health = reqwest::get(format!("{}/health", server.url())).await?;
    assert_eq!(health.status(), StatusCode::OK);

    let ready = reqwest::get(format!("{}/ready", server.url())).await?;
    assert_eq!(ready.status(), StatusCode::OK);

    let metrics = reqwest::get(format!("{}/metrics", server.url())).await?;
    assert_eq!(metrics.status(), StatusCode::OK);

    Ok(())
}
