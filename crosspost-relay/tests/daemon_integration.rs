//! Integration tests for the crosspost-relay binary

use assert_cmd::Command;
use libcrosspost::{DeliveryStatus, RecordStore};
use predicates::prelude::*;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestEnv {
    dir: TempDir,
    config_path: PathBuf,
    db_path: PathBuf,
}

/// Config pointing every endpoint at `base`, with a header-format cookie file
fn setup_test_env(base: &str, bearer: &str) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let root = dir.path().display().to_string().replace('\\', "/");
    let config_path = dir.path().join("config.toml");
    let db_path = dir.path().join("crosspost.db");

    fs::write(dir.path().join("cookies.txt"), "SUB=sub-secret; XSRF-TOKEN=xsrf-1").unwrap();

    let config = format!(
        r#"
[database]
path = "{root}/crosspost.db"

[session]
credential_path = "{root}/cookies.txt"
credential_format = "header"
timeout_secs = 5
token_domain = "127.0.0.1"
default_domain = "127.0.0.1"

[destination]
base_url = "{base}/"
config_url = "{base}/api/config"
compose_referer = "{base}/compose"
send_url = "{base}/api/statuses/update"
delete_url = "{base}/profile/delMyblog"
upload_url = "{base}/api/statuses/uploadPic"

[source]
api_base = "{base}"
bearer_token = "{bearer}"
handles = ["Genshin_7"]

[media]
profile_dir = "{root}/profile"
image_dir = "{root}/image"
video_dir = "{root}/video"
"#
    );
    fs::write(&config_path, config).unwrap();

    TestEnv {
        dir,
        config_path,
        db_path,
    }
}

async fn mount_config(server: &MockServer, login: bool) {
    Mock::given(method("GET"))
        .and(path("/api/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": 1,
            "data": {"login": login, "st": "st-token", "uid": "7001"}
        })))
        .mount(server)
        .await;
}

async fn mount_feed(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/2/users/by"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "42", "name": "Genshin Impact", "username": "Genshin_7"}]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/2/users/42/tweets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "1001", "text": "Maintenance tonight", "created_at": "2023-03-01T10:00:00.000Z"}]
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/statuses/update"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": 1, "data": {"id": "w-1"}})))
        .expect(1)
        .mount(server)
        .await;
}

/// Run the binary off the runtime so the mock server keeps serving
async fn run_relay(env: &TestEnv, args: &[&str]) -> assert_cmd::assert::Assert {
    let config = env.config_path.clone();
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    tokio::task::spawn_blocking(move || {
        Command::cargo_bin("crosspost-relay")
            .unwrap()
            .env_remove("RUST_LOG")
            .arg("--config")
            .arg(config)
            .args(args)
            .assert()
    })
    .await
    .unwrap()
}

#[test]
fn test_help_lists_flags() {
    Command::cargo_bin("crosspost-relay")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--once"))
        .stdout(predicate::str::contains("--interval"));
}

#[test]
fn test_requires_valid_config() {
    let dir = TempDir::new().unwrap();
    let invalid = dir.path().join("invalid.toml");
    fs::write(&invalid, "invalid toml content [[[").unwrap();

    Command::cargo_bin("crosspost-relay")
        .unwrap()
        .env("CROSSPOST_CONFIG", &invalid)
        .arg("--once")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Failed to parse config"));
}

#[test]
fn test_missing_bearer_token_is_config_error() {
    let env = setup_test_env("http://127.0.0.1:9", "");

    Command::cargo_bin("crosspost-relay")
        .unwrap()
        .arg("--config")
        .arg(&env.config_path)
        .arg("--once")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("source.bearer_token"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_logged_out_credential_exits_with_auth_code() {
    let server = MockServer::start().await;
    mount_config(&server, false).await;
    let env = setup_test_env(&server.uri(), "bearer");

    run_relay(&env, &["--once"])
        .await
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Authentication failed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_once_relays_and_exits() {
    let server = MockServer::start().await;
    mount_config(&server, true).await;
    mount_feed(&server).await;
    let env = setup_test_env(&server.uri(), "bearer");

    run_relay(&env, &["--once"])
        .await
        .success()
        .stdout(predicate::str::contains("delivered 1"));

    let store = RecordStore::new(env.db_path.to_str().unwrap()).await.unwrap();
    let message = store.get_message("1001").await.unwrap().unwrap();
    assert_eq!(message.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(message.destination_post_id.as_deref(), Some("w-1"));
    assert!(env.dir.path().join("image").is_dir());

    // a second run finds nothing new; the single update expectation holds
    run_relay(&env, &["--once"])
        .await
        .success()
        .stdout(predicate::str::contains("delivered 0"));
}
