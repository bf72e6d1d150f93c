use blockforge::core::notifier::{
    NotifyKind, WebhookDialect, WebhookSpec, WebhookStore, build_payload,
};
use blockforge::BlockforgeError;
use serde_json::json;
use tempfile::TempDir;

fn spec(server_id: &str, events: Vec<NotifyKind>) -> WebhookSpec {
    WebhookSpec {
        server_id: server_id.to_string(),
        url: "http://127.0.0.1:9/hook".to_string(),
        dialect: WebhookDialect::Discord,
        events,
        enabled: true,
    }
}

#[tokio::test]
async fn test_store_round_trips() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("webhooks.json");
    let id;
    {
        let store = WebhookStore::open(&path).unwrap();
        let row = store
            .create(spec("sv1", vec![NotifyKind::Crash, NotifyKind::Start]))
            .unwrap();
        id = row.id.clone();
        assert_eq!(store.list().len(), 1);
    }
    let reopened = WebhookStore::open(&path).unwrap();
    assert_eq!(reopened.list().len(), 1);
    assert_eq!(reopened.list()[0].id, id);
}

#[tokio::test]
async fn test_matching_filters_by_server_kind_and_enabled() {
    let dir = TempDir::new().unwrap();
    let store = WebhookStore::open(dir.path().join("webhooks.json")).unwrap();
    let crash_only = store.create(spec("sv1", vec![NotifyKind::Crash])).unwrap();
    store
        .create(spec("sv2", vec![NotifyKind::Crash, NotifyKind::Stop]))
        .unwrap();

    assert_eq!(store.matching("sv1", NotifyKind::Crash).len(), 1);
    assert!(store.matching("sv1", NotifyKind::Stop).is_empty());
    assert!(store.matching("sv3", NotifyKind::Crash).is_empty());

    store.set_enabled(&crash_only.id, false).unwrap();
    assert!(store.matching("sv1", NotifyKind::Crash).is_empty());
}

#[tokio::test]
async fn test_delete_unknown_webhook() {
    let dir = TempDir::new().unwrap();
    let store = WebhookStore::open(dir.path().join("webhooks.json")).unwrap();
    assert!(matches!(
        store.delete("ghost"),
        Err(BlockforgeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_discord_payload_is_color_coded_embed() {
    let payload = build_payload(
        WebhookDialect::Discord,
        NotifyKind::Crash,
        "survival",
        "paper",
        &json!({ "exit_code": 137 }),
    );
    let embed = &payload["embeds"][0];
    assert_eq!(embed["title"].as_str(), Some("🔴 Server Crashed"));
    assert_eq!(embed["color"].as_u64(), Some(0x00ED_4245));
    assert!(embed["description"].as_str().unwrap().contains("survival"));

    let started = build_payload(
        WebhookDialect::Discord,
        NotifyKind::Start,
        "survival",
        "paper",
        &json!({}),
    );
    assert_eq!(
        started["embeds"][0]["title"].as_str(),
        Some("🟢 Server Started")
    );
}

#[tokio::test]
async fn test_generic_payload_envelope() {
    let payload = build_payload(
        WebhookDialect::Generic,
        NotifyKind::PlayerJoin,
        "survival",
        "paper",
        &json!({ "player": "Steve" }),
    );
    assert_eq!(payload["event"].as_str(), Some("player_join"));
    assert_eq!(payload["server"]["name"].as_str(), Some("survival"));
    assert_eq!(payload["server"]["kind"].as_str(), Some("paper"));
    assert_eq!(payload["data"]["player"].as_str(), Some("Steve"));
    assert!(payload["timestamp"].as_str().is_some());
}
