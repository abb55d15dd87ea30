use super::*;
use crate::config::SessionSettings;
use crate::credentials::{Credential, DomainRule};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn relay_for(server: &MockServer, login: bool) -> RelayClient {
    Mock::given(method("GET"))
        .and(path("/api/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": 1,
            "data": {"login": login, "st": "st-token", "uid": "1001"}
        })))
        .mount(server)
        .await;

    let rule = DomainRule::single("XSRF-TOKEN", "127.0.0.1");
    let credential = Credential::from_pairs([("SUB", "s"), ("XSRF-TOKEN", "t")], &rule);
    let endpoints = DestinationConfig::with_base(&server.uri());
    let session =
        SessionClient::new(&SessionSettings::default(), &endpoints, rule, credential).unwrap();
    RelayClient::new(session, endpoints)
}

#[tokio::test]
async fn test_post_text_only() {
    let server = MockServer::start().await;
    let relay = relay_for(&server, true).await;
    let compose = format!("{}/compose", server.uri());

    Mock::given(method("POST"))
        .and(path("/api/statuses/update"))
        .and(header("referer", compose.as_str()))
        .and(body_string_contains("content=hello+world"))
        .and(body_string_contains("st=st-token"))
        .and(body_string_contains("_spr=screen%3A400x629"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": 1, "data": {"id": "4870001"}})))
        .expect(1)
        .mount(&server)
        .await;

    let post_id = relay.post("hello world", Vec::new(), Visibility::Everyone).await.unwrap();
    assert_eq!(post_id, "4870001");
    assert_eq!(relay.session().referer(), None);

    let body = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.url.path() == "/api/statuses/update")
        .map(|r| String::from_utf8(r.body).unwrap())
        .unwrap();
    assert!(!body.contains("visible="));
    assert!(!body.contains("picId="));
}

#[tokio::test]
async fn test_post_uploads_in_order_and_tracks_referer() {
    let server = MockServer::start().await;
    let relay = relay_for(&server, true).await;
    let compose = format!("{}/compose", server.uri());

    Mock::given(method("POST"))
        .and(path("/api/statuses/uploadPic"))
        .and(header("referer", compose.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": 1, "pic_id": "p1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/statuses/uploadPic"))
        .and(header("referer", format!("{}/?pids=p1", compose).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": 1, "pic_id": "p2"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/statuses/update"))
        .and(body_string_contains("picId=p1%2Cp2"))
        .and(body_string_contains("visible=6"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": 1, "data": {"id": 77}})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let first = dir.path().join("first.jpg");
    let second = dir.path().join("second.jpg");
    std::fs::write(&first, b"\xff\xd8one").unwrap();
    std::fs::write(&second, b"\xff\xd8two").unwrap();

    let post_id = relay
        .post("with pictures", vec![first.into(), second.into()], Visibility::Friends)
        .await
        .unwrap();
    assert_eq!(post_id, "77");
    assert_eq!(relay.session().referer(), None);

    // compared raw: header matchers split values on commas
    let referers: Vec<(String, String)> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() != "/api/config")
        .map(|r| {
            let referer = r
                .headers
                .get("referer")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            (r.url.path().to_string(), referer)
        })
        .collect();
    assert_eq!(
        referers,
        vec![
            ("/api/statuses/uploadPic".to_string(), compose.clone()),
            ("/api/statuses/uploadPic".to_string(), format!("{}/?pids=p1", compose)),
            ("/api/statuses/update".to_string(), format!("{}/?pids=p1,p2", compose)),
        ]
    );
}

#[tokio::test]
async fn test_upload_stream_uses_synthetic_name() {
    let server = MockServer::start().await;
    let relay = relay_for(&server, true).await;

    Mock::given(method("POST"))
        .and(path("/api/statuses/uploadPic"))
        .and(body_string_contains("filename=\"image_stream\""))
        .and(body_string_contains("name=\"pic\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": 1, "pic_id": "s1"})))
        .expect(1)
        .mount(&server)
        .await;

    let stream = std::io::Cursor::new(b"raw image bytes".to_vec());
    let pic_id = relay.upload(AttachmentSource::stream(stream)).await.unwrap();
    assert_eq!(pic_id, "s1");
}

#[tokio::test]
async fn test_failed_upload_aborts_post_and_restores_referer() {
    let server = MockServer::start().await;
    let relay = relay_for(&server, true).await;

    Mock::given(method("POST"))
        .and(path("/api/statuses/uploadPic"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": 0, "msg": "too big"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/statuses/update"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": 1, "data": {"id": "1"}})))
        .expect(0)
        .mount(&server)
        .await;

    relay.session().set_referer("https://m.weibo.cn/before").unwrap();
    let err = relay
        .post(
            "x",
            vec![AttachmentSource::stream(std::io::Cursor::new(vec![1u8, 2, 3]))],
            Visibility::Everyone,
        )
        .await
        .unwrap_err();
    assert!(err.is_unexpected_response());
    assert_eq!(relay.session().referer().as_deref(), Some("https://m.weibo.cn/before"));
}

#[tokio::test]
async fn test_missing_attachment_file_is_validation_error() {
    let server = MockServer::start().await;
    let relay = relay_for(&server, true).await;

    let err = relay
        .upload(AttachmentSource::Path(PathBuf::from("/nonexistent/crosspost/pic.jpg")))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot read attachment"));
}

#[tokio::test]
async fn test_logged_out_session_blocks_post() {
    let server = MockServer::start().await;
    let relay = relay_for(&server, false).await;

    Mock::given(method("POST"))
        .and(path("/api/statuses/update"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": 1, "data": {"id": "1"}})))
        .expect(0)
        .mount(&server)
        .await;

    let err = relay.post("x", Vec::new(), Visibility::Everyone).await.unwrap_err();
    assert!(err.is_auth_failure());
}

#[tokio::test]
async fn test_delete_sends_mid_with_detail_referer() {
    let server = MockServer::start().await;
    let relay = relay_for(&server, true).await;

    Mock::given(method("POST"))
        .and(path("/profile/delMyblog"))
        .and(header("referer", format!("{}/detail/4870001", server.uri()).as_str()))
        .and(body_string_contains("mid=4870001"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": 1, "msg": "deleted"})))
        .expect(1)
        .mount(&server)
        .await;

    relay.delete("4870001").await.unwrap();
}

#[tokio::test]
async fn test_delete_unknown_post_is_unexpected_response() {
    let server = MockServer::start().await;
    let relay = relay_for(&server, true).await;

    Mock::given(method("POST"))
        .and(path("/profile/delMyblog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": 0, "msg": "not found"})))
        .mount(&server)
        .await;

    let err = relay.delete("404").await.unwrap_err();
    assert!(err.is_unexpected_response());
}

#[test]
fn test_visibility_codes() {
    assert_eq!(Visibility::default(), Visibility::Everyone);
    assert_eq!(Visibility::Everyone.code(), 0);
    assert_eq!(Visibility::OnlyMe.code(), 1);
    assert_eq!(Visibility::Friends.code(), 6);
}
