use serde_json::json;
use shared::domain::EntityKind;
use storage::Storage;

#[tokio::test]
async fn cache_survives_reopen_of_file_database() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("cache.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    {
        let storage = Storage::new(&database_url).await.expect("db");
        storage
            .upsert_entity(
                EntityKind::Conversation,
                "channel:9",
                "",
                &json!({"peer": {"type": "channel", "id": 9}, "unread_count": 3}),
            )
            .await
            .expect("conversation");
        storage
            .upsert_entity(
                EntityKind::Message,
                "c9:40",
                "channel:9",
                &json!({"body": "hello"}),
            )
            .await
            .expect("message");
        storage.pool().close().await;
    }

    let reopened = Storage::new(&database_url).await.expect("reopen");
    let conversations = reopened
        .list_entities(EntityKind::Conversation)
        .await
        .expect("conversations");
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].body["unread_count"], 3);

    let history = reopened
        .list_scope(EntityKind::Message, "channel:9")
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].key, "c9:40");
}
