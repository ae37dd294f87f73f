// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `beamcoded` binary and
//! exercise its HTTP and WebSocket surface (spec.md §6).

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use beamcode_specs::BeamcodeProcess;

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn http_health() -> anyhow::Result<()> {
    let beamcode = BeamcodeProcess::start()?;
    beamcode.wait_healthy(TIMEOUT).await?;

    let resp: serde_json::Value = reqwest::get(format!("{}/health", beamcode.base_url())).await?.json().await?;

    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["sessions"], 0);

    Ok(())
}

#[tokio::test]
async fn http_session_create_fetch_delete_round_trips() -> anyhow::Result<()> {
    let beamcode = BeamcodeProcess::start()?;
    beamcode.wait_healthy(TIMEOUT).await?;

    let cwd = tempfile::tempdir()?;
    let client = reqwest::Client::new();
    let create: serde_json::Value = client
        .post(format!("{}/api/sessions", beamcode.base_url()))
        .json(&serde_json::json!({ "cwd": cwd.path().to_string_lossy() }))
        .send()
        .await?
        .json()
        .await?;
    let id = create["id"].as_str().ok_or_else(|| anyhow::anyhow!("missing session id"))?;

    let get = client.get(format!("{}/api/sessions/{id}", beamcode.base_url())).send().await?;
    assert!(get.status().is_success());

    let delete = client.delete(format!("{}/api/sessions/{id}", beamcode.base_url())).send().await?;
    assert_eq!(delete.status().as_u16(), 204);

    let missing = client.get(format!("{}/api/sessions/{id}", beamcode.base_url())).send().await?;
    assert_eq!(missing.status().as_u16(), 404);

    Ok(())
}

#[tokio::test]
async fn http_session_create_rejects_nonexistent_cwd() -> anyhow::Result<()> {
    let beamcode = BeamcodeProcess::start()?;
    beamcode.wait_healthy(TIMEOUT).await?;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/sessions", beamcode.base_url()))
        .json(&serde_json::json!({ "cwd": "/does/not/exist" }))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 400);

    Ok(())
}

#[tokio::test]
async fn http_api_routes_require_bearer_token_when_configured() -> anyhow::Result<()> {
    let beamcode = BeamcodeProcess::build().auth_token("s3cr3t").spawn()?;
    beamcode.wait_healthy(TIMEOUT).await?;

    let client = reqwest::Client::new();
    let unauthenticated = client.get(format!("{}/api/sessions", beamcode.base_url())).send().await?;
    assert_eq!(unauthenticated.status().as_u16(), 401);

    let authenticated =
        client.get(format!("{}/api/sessions", beamcode.base_url())).bearer_auth("s3cr3t").send().await?;
    assert!(authenticated.status().is_success());

    // Health stays exempt even with a token configured.
    let health = client.get(format!("{}/health", beamcode.base_url())).send().await?;
    assert!(health.status().is_success());

    Ok(())
}

#[tokio::test]
async fn ws_consumer_rejects_unknown_session() -> anyhow::Result<()> {
    let beamcode = BeamcodeProcess::start()?;
    beamcode.wait_healthy(TIMEOUT).await?;

    let url = beamcode.ws_url("does-not-exist");
    let connected = tokio_tungstenite::connect_async(url).await;
    // The upstream HTTP upgrade itself should fail with 404 for an unknown
    // consumer session (spec.md §6) rather than complete the handshake.
    assert!(connected.is_err());

    Ok(())
}

#[tokio::test]
async fn ws_consumer_attaches_to_a_live_session() -> anyhow::Result<()> {
    let beamcode = BeamcodeProcess::start()?;
    beamcode.wait_healthy(TIMEOUT).await?;

    let cwd = tempfile::tempdir()?;
    let client = reqwest::Client::new();
    let create: serde_json::Value = client
        .post(format!("{}/api/sessions", beamcode.base_url()))
        .json(&serde_json::json!({ "cwd": cwd.path().to_string_lossy() }))
        .send()
        .await?
        .json()
        .await?;
    let id = create["id"].as_str().ok_or_else(|| anyhow::anyhow!("missing session id"))?;

    let url = beamcode.ws_url(id);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;
    ws.send(Message::Text(
        serde_json::json!({ "type": "user_message", "role": "user", "content": [] }).to_string().into(),
    ))
    .await?;
    ws.close(None).await?;

    Ok(())
}
