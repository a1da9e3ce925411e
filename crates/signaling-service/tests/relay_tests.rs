//! Relay integration tests.
//!
//! Drive real WebSocket connections against an in-process server: join,
//! directed signaling, leave, disconnect cleanup and error codes.

// Test code is allowed to use expect/unwrap for assertions
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use anyhow::Result;
use serde_json::{json, Value};
use signaling_test_utils::{TestSignalingServer, WsClient};
use std::time::Duration;

async fn create_room(server: &TestSignalingServer, token: &str, name: &str) -> Result<String> {
    let response = reqwest::Client::new()
        .post(format!("{}/api/rooms", server.url()))
        .bearer_auth(token)
        .json(&json!({"name": name, "type": "voice"}))
        .send()
        .await?;
    assert_eq!(response.status(), 201);

    let body: Value = response.json().await?;
    Ok(body["data"]["id"].as_str().unwrap().to_string())
}

async fn connect(server: &TestSignalingServer, subject: &str) -> Result<WsClient> {
    let token = server.access_token(subject)?;
    WsClient::connect(&server.ws_url(&token)).await
}

#[tokio::test]
async fn test_two_peers_exchange_offer_answer_and_candidates() -> Result<()> {
    let server = TestSignalingServer::spawn().await?;
    let owner_token = server.access_token("alice")?;
    let room_id = create_room(&server, &owner_token, "standup").await?;

    let mut alice = WsClient::connect(&server.ws_url(&owner_token)).await?;
    alice.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    let joined_a = alice.recv_type("joined").await?;
    assert_eq!(joined_a["roomId"], room_id.as_str());
    assert_eq!(joined_a["participants"].as_array().unwrap().len(), 0);
    let alice_conn = joined_a["connectionId"].as_str().unwrap().to_string();

    let mut bob = connect(&server, "bob").await?;
    bob.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    let joined_b = bob.recv_type("joined").await?;
    let bob_conn = joined_b["connectionId"].as_str().unwrap().to_string();

    // Bob sees Alice (as owner); Alice is told about Bob.
    let present = joined_b["participants"].as_array().unwrap();
    assert_eq!(present.len(), 1);
    assert_eq!(present[0]["connectionId"], alice_conn.as_str());
    assert_eq!(present[0]["role"], "owner");

    let user_joined = alice.recv_type("user_joined").await?;
    assert_eq!(user_joined["participant"]["connectionId"], bob_conn.as_str());
    assert_eq!(user_joined["participant"]["role"], "participant");

    // Offer goes to the target only, tagged with the sender.
    let sdp = json!({"type": "offer", "sdp": "v=0 ..."});
    bob.send_json(&json!({
        "type": "offer", "roomId": room_id, "target": alice_conn, "sdp": sdp
    }))
    .await?;
    let offer = alice.recv_type("offer").await?;
    assert_eq!(offer["from"], bob_conn.as_str());
    assert_eq!(offer["sdp"], sdp);

    alice
        .send_json(&json!({
            "type": "answer", "roomId": room_id, "target": bob_conn,
            "sdp": {"type": "answer", "sdp": "v=0 ..."}
        }))
        .await?;
    let answer = bob.recv_type("answer").await?;
    assert_eq!(answer["from"], alice_conn.as_str());

    let candidate = json!({"candidate": "candidate:1 1 UDP 2122 192.0.2.1 5000 typ host"});
    alice
        .send_json(&json!({
            "type": "candidate", "roomId": room_id, "target": bob_conn, "candidate": candidate
        }))
        .await?;
    assert_eq!(bob.recv_type("candidate").await?["candidate"], candidate);

    alice
        .send_json(&json!({"type": "candidate-end", "roomId": room_id, "target": bob_conn}))
        .await?;
    assert_eq!(bob.recv_type("candidate-end").await?["from"], alice_conn.as_str());

    // Leave: Bob gets an acknowledgement, Alice a user_left.
    bob.send_json(&json!({"type": "leave"})).await?;
    assert_eq!(bob.recv_type("left").await?["roomId"], room_id.as_str());
    let left = alice.recv_type("user_left").await?;
    assert_eq!(left["connectionId"], bob_conn.as_str());
    assert_eq!(left["reason"], "left");

    Ok(())
}

#[tokio::test]
async fn test_disconnect_notifies_remaining_member() -> Result<()> {
    let server = TestSignalingServer::spawn().await?;
    let token = server.access_token("alice")?;
    let room_id = create_room(&server, &token, "drop").await?;

    let mut alice = WsClient::connect(&server.ws_url(&token)).await?;
    alice.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    alice.recv_type("joined").await?;

    let mut bob = connect(&server, "bob").await?;
    bob.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    let bob_conn = bob.recv_type("joined").await?["connectionId"]
        .as_str()
        .unwrap()
        .to_string();
    alice.recv_type("user_joined").await?;

    bob.close().await?;

    let left = alice.recv_type("user_left").await?;
    assert_eq!(left["connectionId"], bob_conn.as_str());
    assert_eq!(left["reason"], "disconnected");

    // Registry no longer lists Bob.
    let snapshot = server
        .registry()
        .get_room(room_id.parse()?)
        .await?
        .unwrap();
    assert_eq!(snapshot.participants.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_join_full_room_is_refused() -> Result<()> {
    let server =
        TestSignalingServer::spawn_with("sig-test", &[("MAX_PARTICIPANTS_PER_ROOM", "1")], None)
            .await?;
    let token = server.access_token("alice")?;
    let room_id = create_room(&server, &token, "tiny").await?;

    let mut alice = WsClient::connect(&server.ws_url(&token)).await?;
    alice.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    alice.recv_type("joined").await?;

    let mut bob = connect(&server, "bob").await?;
    bob.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    let error = bob.recv_type("error").await?;
    assert_eq!(error["code"], "ROOM_FULL");

    // Alice was not told about a join that never happened.
    alice.expect_silence(Duration::from_millis(200)).await?;

    Ok(())
}

#[tokio::test]
async fn test_error_codes_for_bad_requests() -> Result<()> {
    let server = TestSignalingServer::spawn().await?;
    let mut client = connect(&server, "alice").await?;

    client.send_text("{not json").await?;
    assert_eq!(client.recv_type("error").await?["code"], "INVALID_MESSAGE");

    client
        .send_json(&json!({"type": "join", "roomId": "00000000-0000-4000-8000-000000000000"}))
        .await?;
    assert_eq!(client.recv_type("error").await?["code"], "ROOM_NOT_FOUND");

    client
        .send_json(&json!({
            "type": "offer",
            "roomId": "00000000-0000-4000-8000-000000000000",
            "target": "00000000-0000-4000-8000-000000000001",
            "sdp": {}
        }))
        .await?;
    assert_eq!(client.recv_type("error").await?["code"], "NOT_IN_ROOM");

    client.send_json(&json!({"type": "mute", "muted": true})).await?;
    assert_eq!(client.recv_type("error").await?["code"], "NOT_IN_ROOM");

    client.send_json(&json!({"type": "ping"})).await?;
    client.recv_type("pong").await?;

    Ok(())
}

#[tokio::test]
async fn test_missing_target_reports_target_not_found() -> Result<()> {
    let server = TestSignalingServer::spawn().await?;
    let token = server.access_token("alice")?;
    let room_id = create_room(&server, &token, "solo").await?;

    let mut alice = WsClient::connect(&server.ws_url(&token)).await?;
    alice.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    alice.recv_type("joined").await?;

    alice
        .send_json(&json!({
            "type": "offer", "roomId": room_id,
            "target": "00000000-0000-4000-8000-000000000001", "sdp": {}
        }))
        .await?;
    assert_eq!(alice.recv_type("error").await?["code"], "TARGET_NOT_FOUND");

    Ok(())
}

#[tokio::test]
async fn test_handshake_without_valid_token_is_refused() -> Result<()> {
    let server = TestSignalingServer::spawn().await?;

    let missing = WsClient::connect(&format!("ws://{}/ws", server.addr())).await;
    assert!(missing.is_err());

    let forged = WsClient::connect(&server.ws_url("not.a.token")).await;
    assert!(forged.is_err());

    // Plain HTTP sees the 401 body.
    let response = reqwest::get(format!("{}/ws", server.url())).await?;
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], "UNAUTHENTICATED");

    Ok(())
}

#[tokio::test]
async fn test_room_join_token_is_scoped_to_its_room() -> Result<()> {
    let server = TestSignalingServer::spawn().await?;
    let owner = server.access_token("alice")?;
    let room_a = create_room(&server, &owner, "a").await?;
    let room_b = create_room(&server, &owner, "b").await?;

    let guest = server.access_token("guest")?;
    let response = reqwest::Client::new()
        .post(format!("{}/api/rooms/{}/join", server.url(), room_a))
        .bearer_auth(&guest)
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await?;
    let join_token = body["data"]["token"].as_str().unwrap().to_string();

    let mut client = WsClient::connect(&server.ws_url(&join_token)).await?;
    client.send_json(&json!({"type": "join", "roomId": room_b})).await?;
    assert_eq!(client.recv_type("error").await?["code"], "FORBIDDEN");

    client.send_json(&json!({"type": "join", "roomId": room_a})).await?;
    client.recv_type("joined").await?;

    Ok(())
}

#[tokio::test]
async fn test_participant_state_changes_are_broadcast() -> Result<()> {
    let server = TestSignalingServer::spawn().await?;
    let token = server.access_token("alice")?;
    let room_id = create_room(&server, &token, "voice").await?;

    let mut alice = WsClient::connect(&server.ws_url(&token)).await?;
    alice.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    alice.recv_type("joined").await?;

    let mut bob = connect(&server, "bob").await?;
    bob.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    bob.recv_type("joined").await?;
    alice.recv_type("user_joined").await?;

    bob.send_json(&json!({"type": "mute", "muted": true})).await?;
    let own = bob.recv_type("participant_updated").await?;
    assert_eq!(own["participant"]["muted"], true);

    let seen = alice.recv_type("participant_updated").await?;
    assert_eq!(seen["participant"]["muted"], true);
    assert_eq!(seen["participant"]["identity"], "bob");

    Ok(())
}

#[tokio::test]
async fn test_deleting_room_closes_it_for_members() -> Result<()> {
    let server = TestSignalingServer::spawn().await?;
    let token = server.access_token("alice")?;
    let room_id = create_room(&server, &token, "doomed").await?;

    let mut bob = connect(&server, "bob").await?;
    bob.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    bob.recv_type("joined").await?;

    let response = reqwest::Client::new()
        .delete(format!("{}/api/rooms/{}", server.url(), room_id))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let closed = bob.recv_type("room_closed").await?;
    assert_eq!(closed["roomId"], room_id.as_str());
    assert_eq!(closed["reason"], "deleted");

    // Bob is no longer in any room.
    bob.send_json(&json!({"type": "leave"})).await?;
    bob.send_json(&json!({"type": "ping"})).await?;
    bob.recv_type("pong").await?;

    Ok(())
}

#[tokio::test]
async fn test_silent_connection_times_out() -> Result<()> {
    let server = TestSignalingServer::spawn_with(
        "sig-test",
        &[
            ("HEARTBEAT_INTERVAL_SECONDS", "1"),
            ("HEARTBEAT_TIMEOUT_SECONDS", "2"),
        ],
        None,
    )
    .await?;
    let token = server.access_token("alice")?;
    let room_id = create_room(&server, &token, "quiet").await?;

    let mut alice = WsClient::connect(&server.ws_url(&token)).await?;
    alice.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    alice.recv_type("joined").await?;

    // Bob stops reading after joining, so his client never answers pings.
    let mut bob = connect(&server, "bob").await?;
    bob.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    let bob_conn = bob.recv_type("joined").await?["connectionId"]
        .as_str()
        .unwrap()
        .to_string();

    // Alice keeps reading, which answers her pings.
    alice.recv_type("user_joined").await?;
    let left = alice.recv_type("user_left").await?;
    assert_eq!(left["connectionId"], bob_conn.as_str());
    assert_eq!(left["reason"], "disconnected");

    Ok(())
}

async fn listed_room_ids(server: &TestSignalingServer) -> Result<Vec<String>> {
    let list: Value = reqwest::get(format!("{}/api/rooms", server.url()))
        .await?
        .json()
        .await?;
    Ok(list["data"]["rooms"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|room| room["id"].as_str().map(str::to_string))
        .collect())
}

#[tokio::test]
async fn test_abandoned_room_is_reaped_after_idle_timeout() -> Result<()> {
    let server = TestSignalingServer::spawn_with(
        "sig-test",
        &[
            ("ROOM_IDLE_TIMEOUT_SECONDS", "2"),
            ("REAPER_INTERVAL_SECONDS", "1"),
        ],
        None,
    )
    .await?;
    let token = server.access_token("alice")?;
    let room_id = create_room(&server, &token, "r1").await?;

    let mut alice = WsClient::connect(&server.ws_url(&token)).await?;
    alice.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    alice.recv_type("joined").await?;

    let mut bob = connect(&server, "bob").await?;
    bob.send_json(&json!({"type": "join", "roomId": room_id})).await?;
    bob.recv_type("joined").await?;
    alice.recv_type("user_joined").await?;
    bob.close().await?;
    alice.recv_type("user_left").await?;

    // An occupied room outlives the idle timeout.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(listed_room_ids(&server).await?.contains(&room_id));

    alice.send_json(&json!({"type": "leave"})).await?;
    alice.recv_type("left").await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while listed_room_ids(&server).await?.contains(&room_id) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "room still listed after the idle timeout"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let response = reqwest::Client::new()
        .get(format!("{}/api/rooms/{}", server.url(), room_id))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    Ok(())
}
