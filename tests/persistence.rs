use std::sync::Arc;

use ollama_chat::agent::MockTokenSource;
use ollama_chat::db::conversation_repository::{CONVERSATIONS_KEY, UNREADABLE_CONVERSATIONS_KEY};
use ollama_chat::db::kv_store::{KeyValueStore, SqliteKvStore};
use ollama_chat::models::SettingsPatch;
use ollama_chat::service::chat_service::ChatService;

async fn open(url: &str, source: MockTokenSource) -> ChatService {
    let kv = SqliteKvStore::connect(url).await.unwrap();
    ChatService::open(Arc::new(kv), Arc::new(source)).await.unwrap()
}

#[tokio::test]
async fn conversations_and_settings_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("chat.db").display());

    let id = {
        let service = open(&url, MockTokenSource::scripted(["Hi", " there"])).await;
        let id = service.create_conversation().await.id;
        service.run_turn(&id, "hello", None).await.unwrap();
        service
            .update_settings(SettingsPatch { temperature: Some(1.2), ..Default::default() })
            .await
            .unwrap();
        id
    };

    let service = open(&url, MockTokenSource::scripted(["unused"])).await;
    let current = service.current_conversation().unwrap();
    assert_eq!(current.id, id);
    assert_eq!(current.title, "hello");
    assert_eq!(current.messages.len(), 2);
    assert_eq!(current.messages[1].content, "Hi there");
    assert_eq!(service.settings().await.temperature, 1.2);
}

#[tokio::test]
async fn unreadable_conversation_list_starts_empty_and_is_kept_aside() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("chat.db").display());

    let kv = SqliteKvStore::connect(&url).await.unwrap();
    kv.set(CONVERSATIONS_KEY, "{not json").await.unwrap();

    let service = ChatService::open(Arc::new(kv.clone()), Arc::new(MockTokenSource::scripted(["x"])))
        .await
        .unwrap();
    assert!(service.get_conversations().await.is_empty());
    assert!(service.current_conversation().is_none());

    service.create_conversation().await;
    assert_eq!(
        kv.get(UNREADABLE_CONVERSATIONS_KEY).await.unwrap().as_deref(),
        Some("{not json")
    );
}
