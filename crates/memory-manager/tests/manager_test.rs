//! End-to-end manager tests over a real SQLite store with the minimal preset
//! (mock provider, rule-based extraction).

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use llm_client::MockLlmClient;
use memory_core::{
    ConfigPresets, Emotion, Episode, EpisodeFilter, Fact, MemoryConfig, MemoryError, MemoryStore,
    MessageRole,
};
use memory_extract::create_extractor;
use memory_manager::{Forgetter, MemoryManager};
use memory_sqlite::CappedSqliteStore;

async fn build_manager(config: MemoryConfig) -> (MemoryManager, Arc<dyn MemoryStore>) {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let store: Arc<dyn MemoryStore> = Arc::new(
        CappedSqliteStore::open(
            db_path.to_str().unwrap(),
            config.max_episodes_per_user,
            config.max_facts_per_user,
        )
        .await
        .unwrap(),
    );
    std::mem::forget(temp_dir);

    let extractor = create_extractor(&config, Arc::new(MockLlmClient::new()));
    let manager = MemoryManager::new(config, store.clone(), extractor, None).unwrap();
    (manager, store)
}

fn episode_at(user_id: &str, importance: f32, days_ago: i64, access_count: u32) -> Episode {
    let then = Utc::now() - Duration::days(days_ago);
    Episode {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        summary: format!("记忆 {importance}"),
        keywords: vec!["恐龙".to_string()],
        emotion: Emotion::Neutral,
        importance,
        access_count,
        created_at: then,
        last_accessed_at: then,
        source_session_id: Uuid::new_v4(),
        embedding: None,
    }
}

#[tokio::test]
async fn below_threshold_session_yields_no_episode() {
    let mut config = ConfigPresets::minimal();
    config.working_memory_size = 10;
    config.episode_compress_threshold = 5;
    let (manager, store) = build_manager(config).await;
    let cancel = CancellationToken::new();

    let session = manager.start_session("u1", &cancel).await.unwrap();
    for i in 0..4 {
        manager
            .add_message(session.id, MessageRole::User, &format!("问题{i}"), &cancel)
            .await
            .unwrap();
        manager
            .add_message(session.id, MessageRole::Assistant, "回答", &cancel)
            .await
            .unwrap();
    }

    let episode = manager.end_session(session.id, &cancel).await.unwrap();
    assert!(episode.is_none());
    assert_eq!(store.count_episodes("u1").await.unwrap(), 0);
}

#[tokio::test]
async fn rule_based_extraction_fills_profile() {
    let (manager, _store) = build_manager(ConfigPresets::minimal()).await;
    let cancel = CancellationToken::new();

    let session = manager.start_session("u1", &cancel).await.unwrap();
    for _ in 0..5 {
        manager
            .add_message(session.id, MessageRole::User, "我叫小明，我5岁了", &cancel)
            .await
            .unwrap();
        manager
            .add_message(session.id, MessageRole::Assistant, "你好", &cancel)
            .await
            .unwrap();
    }

    let episode = manager.end_session(session.id, &cancel).await.unwrap();
    assert!(episode.is_some());

    let profile = manager.get_profile("u1").await.unwrap().unwrap();
    assert_eq!(profile.name.as_deref(), Some("小明"));
    assert_eq!(profile.age, Some(5));
}

#[tokio::test]
async fn facts_from_two_sessions_coalesce() {
    let (manager, store) = build_manager(ConfigPresets::minimal()).await;
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let session = manager.start_session("u1", &cancel).await.unwrap();
        for _ in 0..5 {
            manager
                .add_message(session.id, MessageRole::User, "我叫小明，我喜欢恐龙", &cancel)
                .await
                .unwrap();
        }
        manager.end_session(session.id, &cancel).await.unwrap();
    }

    let facts = store.list_facts("u1", None).await.unwrap();
    let liked: Vec<&Fact> = facts.iter().filter(|f| f.predicate == "喜欢").collect();
    assert_eq!(liked.len(), 1, "same triple must coalesce into one row");
    assert_eq!(liked[0].subject, "小明");
    assert_eq!(liked[0].object, "恐龙");
}

#[tokio::test]
async fn enforce_caps_keeps_strongest_episodes() {
    let mut config = ConfigPresets::minimal();
    config.max_episodes_per_user = 3;
    let (_, store) = build_manager(config.clone()).await;

    for importance in [0.1, 0.9, 0.5, 0.8] {
        store
            .insert_episode(&episode_at("u1", importance, 0, 0))
            .await
            .unwrap();
    }

    let forgetter = Forgetter::new(store.clone(), config);
    let removed = forgetter.enforce_caps("u1", Utc::now()).await.unwrap();
    assert_eq!(removed, 1);

    let survivors = store
        .list_episodes("u1", &EpisodeFilter::default())
        .await
        .unwrap();
    let mut importances: Vec<f32> = survivors.iter().map(|e| e.importance).collect();
    importances.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(importances, vec![0.5, 0.8, 0.9]);

    // Fixed point: a second pass removes nothing.
    assert_eq!(forgetter.enforce_caps("u1", Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn decayed_episode_is_forgotten() {
    let config = ConfigPresets::minimal();
    let (manager, store) = build_manager(config).await;

    // 40 days idle with decay window 30: strength decays to zero.
    store
        .insert_episode(&episode_at("u1", 0.3, 40, 0))
        .await
        .unwrap();

    let removed = manager.run_forget("u1").await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.count_episodes("u1").await.unwrap(), 0);

    // Idempotent: nothing left to remove.
    assert_eq!(manager.run_forget("u1").await.unwrap(), 0);
}

#[tokio::test]
async fn retrieval_returns_episode_and_bumps_access() {
    let mut config = ConfigPresets::minimal();
    config.enable_cache = false;
    let (manager, store) = build_manager(config).await;
    let cancel = CancellationToken::new();

    store
        .insert_episode(&episode_at("u1", 0.8, 0, 2))
        .await
        .unwrap();

    let session = manager.start_session("u1", &cancel).await.unwrap();
    let context = manager
        .get_memory_context(session.id, Some("恐龙"), &cancel)
        .await
        .unwrap();
    assert_eq!(context.episodes.len(), 1);
    assert_eq!(context.episodes[0].access_count, 3);

    let stored = store
        .list_episodes("u1", &EpisodeFilter::default())
        .await
        .unwrap();
    assert_eq!(stored[0].access_count, 3);
    assert!(stored[0].last_accessed_at > stored[0].created_at);
}

#[tokio::test]
async fn context_prompt_contains_profile_and_memories() {
    let (manager, _store) = build_manager(ConfigPresets::minimal()).await;
    let cancel = CancellationToken::new();

    let session = manager.start_session("u1", &cancel).await.unwrap();
    for _ in 0..5 {
        manager
            .add_message(session.id, MessageRole::User, "我叫小明，我喜欢恐龙", &cancel)
            .await
            .unwrap();
    }
    manager.end_session(session.id, &cancel).await.unwrap();

    let session = manager.start_session("u1", &cancel).await.unwrap();
    let context = manager
        .get_memory_context(session.id, Some("恐龙"), &cancel)
        .await
        .unwrap();
    let prompt = context.to_system_prompt();
    assert!(prompt.contains("【用户信息】"));
    assert!(prompt.contains("小明"));
    assert!(prompt.contains("【相关记忆】"));
}

#[tokio::test]
async fn starting_new_session_implicitly_ends_prior() {
    let (manager, store) = build_manager(ConfigPresets::minimal()).await;
    let cancel = CancellationToken::new();

    let first = manager.start_session("u1", &cancel).await.unwrap();
    for _ in 0..5 {
        manager
            .add_message(first.id, MessageRole::User, "我喜欢恐龙", &cancel)
            .await
            .unwrap();
    }

    let second = manager.start_session("u1", &cancel).await.unwrap();
    assert_ne!(first.id, second.id);

    // The prior session was extracted on the implicit end.
    assert_eq!(store.count_episodes("u1").await.unwrap(), 1);

    // And it no longer accepts messages.
    let err = manager
        .add_message(first.id, MessageRole::User, "还在吗", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::UnknownSession(_)));
}

#[tokio::test]
async fn add_message_to_unknown_session_fails() {
    let (manager, _store) = build_manager(ConfigPresets::minimal()).await;
    let cancel = CancellationToken::new();

    let err = manager
        .add_message(Uuid::new_v4(), MessageRole::User, "你好", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::UnknownSession(_)));
}

#[tokio::test]
async fn export_import_roundtrip_is_byte_equal() {
    let (manager, _store) = build_manager(ConfigPresets::minimal()).await;
    let cancel = CancellationToken::new();

    let session = manager.start_session("u1", &cancel).await.unwrap();
    for _ in 0..5 {
        manager
            .add_message(session.id, MessageRole::User, "我叫小明，我喜欢恐龙，我害怕打雷", &cancel)
            .await
            .unwrap();
    }
    manager.end_session(session.id, &cancel).await.unwrap();

    let export = manager.export_user("u1").await.unwrap();
    assert!(export.profile.is_some());
    assert!(!export.episodes.is_empty());
    assert!(!export.facts.is_empty());

    let (fresh_manager, _fresh_store) = build_manager(ConfigPresets::minimal()).await;
    fresh_manager.import_user(&export).await.unwrap();
    let reexport = fresh_manager.export_user("u1").await.unwrap();

    let original = serde_json::to_string(&export).unwrap();
    let roundtripped = serde_json::to_string(&reexport).unwrap();
    assert_eq!(original, roundtripped);
}

#[tokio::test]
async fn stats_report_counts_and_histogram() {
    let (manager, store) = build_manager(ConfigPresets::minimal()).await;

    store.insert_episode(&episode_at("u1", 0.9, 0, 10)).await.unwrap();
    store.insert_episode(&episode_at("u1", 0.2, 40, 0)).await.unwrap();

    let stats = manager.stats("u1").await.unwrap();
    assert_eq!(stats.episode_count, 2);
    assert_eq!(stats.fact_count, 0);
    assert!(!stats.has_profile);
    assert_eq!(stats.strength_histogram.iter().sum::<u32>(), 2);
    // The fully decayed episode sits in the lowest bucket.
    assert!(stats.strength_histogram[0] >= 1);
}

#[tokio::test]
async fn cancelled_call_propagates_unchanged() {
    let (manager, _store) = build_manager(ConfigPresets::minimal()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = manager.start_session("u1", &cancel).await.unwrap_err();
    assert!(matches!(err, MemoryError::Cancelled));
}

#[tokio::test]
async fn vector_mode_ranks_by_similarity() {
    use embedding::HashEmbedding;
    use memory_manager::Retriever;

    let mut config = ConfigPresets::minimal();
    config.enable_vector_search = true;
    config.vector_dim = 128;
    config.similarity_threshold = 0.7;
    let (_, store) = build_manager(config.clone()).await;

    let mut on_topic = episode_at("u1", 0.5, 0, 0);
    on_topic.summary = "我们聊了恐龙".to_string();
    store.insert_episode(&on_topic).await.unwrap();

    let mut off_topic = episode_at("u1", 0.5, 0, 0);
    off_topic.summary = "discussed the weather forecast".to_string();
    store.insert_episode(&off_topic).await.unwrap();

    let retriever = Retriever::new(
        store.clone(),
        config,
        Some(Arc::new(HashEmbedding::new(128))),
    );
    let (episodes, _facts) = retriever
        .retrieve("u1", Some("我们聊了恐龙"), Utc::now())
        .await
        .unwrap();

    assert!(!episodes.is_empty());
    assert_eq!(episodes[0].summary, "我们聊了恐龙");
    // The unrelated summary falls below the similarity threshold.
    assert!(episodes.iter().all(|e| e.summary != "discussed the weather forecast"));
}

#[tokio::test]
async fn maintenance_cleanup_covers_all_users() {
    let (manager, store) = build_manager(ConfigPresets::minimal()).await;

    store.insert_episode(&episode_at("u1", 0.3, 40, 0)).await.unwrap();
    store.insert_episode(&episode_at("u2", 0.3, 40, 0)).await.unwrap();

    let removed = manager.cleanup().await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(store.count_episodes("u1").await.unwrap(), 0);
    assert_eq!(store.count_episodes("u2").await.unwrap(), 0);
}
