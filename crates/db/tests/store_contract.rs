use ichigo_core::{ConversationId, ConversationSettings, Turn};
use ichigo_db::{
    connect, migrations, ConversationStore, InMemoryConversationStore, SqlConversationStore,
};
use tempfile::TempDir;

fn settings(model: &str, temperature: f32) -> ConversationSettings {
    ConversationSettings {
        model: model.to_string(),
        temperature,
        prompt: "default".to_string(),
    }
}

/// Exercises the behaviour every store must share.
async fn check_contract(store: &dyn ConversationStore) {
    let alice = ConversationId(1001);
    let group = ConversationId(-100_200);

    assert!(store.load_conversation(alice).await.expect("load").is_none());

    store.update_metadata(alice, &settings("mini", 0.7)).await.expect("metadata");
    store.update_metadata(group, &settings("large", 1.0)).await.expect("metadata");
    for index in 0..5 {
        store.append_turn(alice, &Turn::user(format!("q{index}"))).await.expect("append");
        store.append_turn(alice, &Turn::assistant(format!("a{index}"))).await.expect("append");
    }

    let deleted = store.trim_to_most_recent(alice, 4).await.expect("trim");
    assert_eq!(deleted, 6);
    let loaded = store.load_conversation(alice).await.expect("load").expect("stored");
    assert_eq!(
        loaded.turns,
        vec![
            Turn::user("q3"),
            Turn::assistant("a3"),
            Turn::user("q4"),
            Turn::assistant("a4"),
        ]
    );

    assert!(store.delete_last_turn(alice).await.expect("undo"));
    assert!(store.delete_last_turn(alice).await.expect("undo"));
    let loaded = store.load_conversation(alice).await.expect("load").expect("stored");
    assert_eq!(loaded.turns, vec![Turn::user("q3"), Turn::assistant("a3")]);

    store.clear_history(alice).await.expect("clear");
    assert!(!store.delete_last_turn(alice).await.expect("undo on empty"));
    let loaded = store.load_conversation(alice).await.expect("load").expect("stored");
    assert!(loaded.turns.is_empty());
    assert_eq!(loaded.settings, settings("mini", 0.7));

    let mut ids = store.list_conversation_ids().await.expect("list");
    ids.sort();
    assert_eq!(ids, vec![group, alice]);

    let removed = store.delete_conversations_not_in(&[alice]).await.expect("tidy");
    assert_eq!(removed, 1);
    assert!(store.load_conversation(group).await.expect("load").is_none());

    store.clear_all().await.expect("clear all");
    assert!(store.list_conversation_ids().await.expect("list").is_empty());
}

#[tokio::test]
async fn in_memory_store_honours_the_contract() {
    check_contract(&InMemoryConversationStore::default()).await;
}

#[tokio::test]
async fn sqlite_store_honours_the_contract() {
    let pool = connect("sqlite::memory:").await.expect("pool should connect");
    migrations::run_pending(&pool).await.expect("migrations should apply");

    check_contract(&SqlConversationStore::new(pool.clone())).await;
    pool.close().await;
}

#[tokio::test]
async fn sqlite_store_survives_reconnect() {
    let dir = TempDir::new().expect("temp dir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("ichigo.db").display());
    let id = ConversationId(1002);

    {
        let pool = connect(&url).await.expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrations should apply");
        let store = SqlConversationStore::new(pool.clone());
        store.update_metadata(id, &settings("mini", 0.25)).await.expect("metadata");
        store.append_turn(id, &Turn::user("persist me")).await.expect("append");
        store.append_turn(id, &Turn::assistant("persisted")).await.expect("append");
        pool.close().await;
    }

    let pool = connect(&url).await.expect("pool should reconnect");
    migrations::run_pending(&pool).await.expect("migrations are idempotent");
    let store = SqlConversationStore::new(pool.clone());
    let loaded = store.load_conversation(id).await.expect("load").expect("stored");
    assert_eq!(loaded.settings, settings("mini", 0.25));
    assert_eq!(loaded.turns, vec![Turn::user("persist me"), Turn::assistant("persisted")]);
    pool.close().await;
}
