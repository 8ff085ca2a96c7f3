//! Integration tests for the `motionlink` CLI binary.
//!
//! Argument parsing, help, completions and config handling run without a
//! server. Device commands run against a small in-process WebSocket server.
#![allow(clippy::unwrap_used)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use futures_util::{SinkExt, StreamExt};
use predicates::prelude::*;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a command for the `motionlink` binary with env isolation.
///
/// Clears all `MOTIONLINK_*` env vars and points config directories at
/// `home` so tests never touch the user's real configuration.
fn motionlink_at(home: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("motionlink");
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env("NO_COLOR", "1")
        .env_remove("MOTIONLINK_PROFILE")
        .env_remove("MOTIONLINK_SERVER")
        .env_remove("MOTIONLINK_OUTPUT")
        .env_remove("MOTIONLINK_TIMEOUT")
        .env_remove("RUST_LOG");
    cmd
}

fn motionlink() -> assert_cmd::Command {
    motionlink_at(Path::new("/tmp/motionlink-cli-test-nonexistent"))
}

/// Concatenate stdout + stderr from a command output for flexible matching.
fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}{stderr}")
}

/// A device server with one executing device, `r1` ("Welder").
///
/// `set_speed` is acknowledged, `pause` is refused by the server.
fn spawn_server() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(serve(stream));
            }
        });
    });

    format!("ws://{addr}/ws")
}

async fn serve(stream: tokio::net::TcpStream) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else { continue };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        let command_id = frame.get("command_id").cloned();
        let reply = match frame["type"].as_str() {
            Some("get_devices") => json!({
                "type": "device_list",
                "devices": [{
                    "id": "r1",
                    "display_name": "Welder",
                    "speed_percent": 100,
                    "execution_state": "executing",
                    "direction": "forward",
                    "can_pause": true,
                    "can_resume": false
                }]
            }),
            Some("set_speed") => json!({
                "type": "command_ack",
                "command_id": command_id,
                "success": true,
                "speed_percent": frame["value"]
            }),
            Some("pause") => json!({
                "type": "command_ack",
                "command_id": command_id,
                "success": false,
                "error": "interlock open"
            }),
            _ => continue,
        };
        if ws.send(Message::text(reply.to_string())).await.is_err() {
            return;
        }
    }
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let output = motionlink().output().unwrap();
    assert_eq!(output.status.code(), Some(2), "Expected exit code 2");
    let text = combined_output(&output);
    assert!(text.contains("Usage"), "Expected 'Usage' in output:\n{text}");
}

#[test]
fn test_help_flag() {
    motionlink().arg("--help").assert().success().stdout(
        predicate::str::contains("devices")
            .and(predicate::str::contains("speed"))
            .and(predicate::str::contains("watch")),
    );
}

#[test]
fn test_version_flag() {
    motionlink()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("motionlink"));
}

#[test]
fn test_invalid_subcommand() {
    motionlink().arg("teleport").assert().failure().code(2);
}

#[test]
fn test_speed_out_of_range_is_usage_error() {
    motionlink()
        .args(["--server", "ws://127.0.0.1:1/ws", "speed", "r1", "150"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_invalid_output_format() {
    motionlink()
        .args(["-o", "xml", "devices", "list"])
        .assert()
        .failure()
        .code(2);
}

// ── Shell completions ───────────────────────────────────────────────

#[test]
fn test_completions_bash() {
    motionlink()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty().not());
}

#[test]
fn test_completions_zsh() {
    motionlink()
        .args(["completions", "zsh"])
        .assert()
        .success()
        .stdout(predicate::str::contains("#compdef"));
}

// ── Config ──────────────────────────────────────────────────────────

#[test]
fn test_devices_without_config_fails() {
    let output = motionlink().args(["devices", "list"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let text = combined_output(&output);
    assert!(text.contains("No server configured"), "{text}");
}

#[test]
fn test_config_show_without_file() {
    motionlink()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[defaults]"));
}

#[test]
fn test_config_init_profiles_and_use() {
    let home = tempfile::tempdir().unwrap();

    motionlink_at(home.path())
        .args(["config", "init", "--server", "ws://cell-4.local:9000/ws"])
        .assert()
        .success();
    motionlink_at(home.path())
        .args(["config", "init", "--server", "wss://lab:9000/ws", "--name", "lab"])
        .assert()
        .success();
    motionlink_at(home.path())
        .args(["config", "use", "default"])
        .assert()
        .success();

    motionlink_at(home.path())
        .args(["-o", "json-compact", "config", "profiles"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            r#"{"name":"default","server":"ws://cell-4.local:9000/ws","default":true}"#,
        ))
        .stdout(predicate::str::contains(r#""name":"lab""#));

    let written = home.path().join(".config/motionlink/config.toml");
    assert!(written.exists(), "config not written to {}", written.display());
}

#[test]
fn test_config_rejects_http_server() {
    let home = tempfile::tempdir().unwrap();
    motionlink_at(home.path())
        .args(["config", "init", "--server", "http://cell-4.local"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_config_use_unknown_profile() {
    let home = tempfile::tempdir().unwrap();
    motionlink_at(home.path())
        .args(["config", "use", "ghost"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("ghost"));
}

// ── Against a server ────────────────────────────────────────────────

#[test]
fn test_unreachable_server_is_connection_error() {
    let output = motionlink()
        .args(["--server", "ws://127.0.0.1:1/ws", "devices", "list"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(7), "{}", combined_output(&output));
}

#[test]
fn test_devices_list_json() {
    let server = spawn_server();
    motionlink()
        .args(["--server", &server, "-o", "json-compact", "devices", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""id":"r1""#))
        .stdout(predicate::str::contains(r#""sync_status":"synchronized""#))
        .stdout(predicate::str::contains(r#""allowed_commands":["set_speed","pause""#));
}

#[test]
fn test_speed_by_display_name_is_confirmed() {
    let server = spawn_server();
    motionlink()
        .args(["--server", &server, "speed", "welder", "40"])
        .assert()
        .success()
        .stdout(predicate::str::contains("set_speed on r1 confirmed (acknowledged"));
}

#[test]
fn test_server_rejection_exit_code() {
    let server = spawn_server();
    motionlink()
        .args(["--server", &server, "pause", "r1"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("interlock open"));
}

#[test]
fn test_resume_while_executing_is_not_allowed() {
    let server = spawn_server();
    motionlink()
        .args(["--server", &server, "resume", "r1"])
        .assert()
        .failure()
        .code(6)
        .stderr(predicate::str::contains("not allowed"));
}

#[test]
fn test_unknown_device_is_not_found() {
    let server = spawn_server();
    motionlink()
        .args(["--server", &server, "devices", "get", "r9"])
        .assert()
        .failure()
        .code(4);
}
