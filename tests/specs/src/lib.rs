// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `beamcoded` binary as a subprocess and exercises it
//! over its HTTP and WebSocket surface (spec.md §6).

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Resolve the path to the compiled `beamcoded` binary.
pub fn beamcoded_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs -> tests -> workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("beamcoded")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `beamcoded` process that is killed on drop.
pub struct BeamcodeProcess {
    child: Child,
    port: u16,
    _data_dir: tempfile::TempDir,
}

/// Builder for configuring a [`BeamcodeProcess`] before spawning it.
pub struct BeamcodeBuilder {
    auth_token: Option<String>,
    no_auto_launch: bool,
}

impl Default for BeamcodeBuilder {
    fn default() -> Self {
        Self { auth_token: None, no_auto_launch: true }
    }
}

impl BeamcodeBuilder {
    /// Require `Authorization: Bearer <token>` on `/api/*` routes.
    pub fn auth_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_owned());
        self
    }

    /// Spawn with the configured options.
    pub fn spawn(self) -> anyhow::Result<BeamcodeProcess> {
        let binary = beamcoded_binary();
        anyhow::ensure!(binary.exists(), "beamcoded binary not found at {}", binary.display());

        let port = free_port()?;
        let data_dir = tempfile::tempdir()?;

        let mut args: Vec<String> = vec![
            "--host".into(),
            "127.0.0.1".into(),
            "--port".into(),
            port.to_string(),
            "--data-dir".into(),
            data_dir.path().to_string_lossy().into_owned(),
            "--log-format".into(),
            "text".into(),
            "--log-level".into(),
            "warn".into(),
        ];
        if self.no_auto_launch {
            args.push("--no-auto-launch".into());
        }
        if let Some(ref token) = self.auth_token {
            args.extend(["--auth-token".into(), token.clone()]);
        }

        let child = Command::new(&binary).args(&args).stdout(Stdio::null()).stderr(Stdio::null()).spawn()?;

        Ok(BeamcodeProcess { child, port, _data_dir: data_dir })
    }
}

impl BeamcodeProcess {
    /// Create a builder for custom startup configuration.
    pub fn build() -> BeamcodeBuilder {
        BeamcodeBuilder::default()
    }

    /// Spawn with default options (no auth, auto-launch disabled).
    pub fn start() -> anyhow::Result<Self> {
        Self::build().spawn()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base URL for HTTP requests.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Consumer WebSocket URL for the given session id.
    pub fn ws_url(&self, session_id: &str) -> String {
        format!("ws://127.0.0.1:{}/ws/consumer/{session_id}", self.port)
    }

    /// Poll `/health` until it answers.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        let url = format!("{}/health", self.base_url());
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("beamcoded did not become healthy within {timeout:?}");
            }
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait for the process to exit within `timeout`.
    pub async fn wait_exit(&mut self, timeout: Duration) -> anyhow::Result<std::process::ExitStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("beamcoded did not exit within {timeout:?}");
            }
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for BeamcodeProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
