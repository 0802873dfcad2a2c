//! Integration tests for sessions and the turn driver.
//!
//! A slow backend records how many completions are in flight per session so
//! the tests can observe that turns on one session serialise while turns on
//! different sessions overlap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vibe_rs::agent::{
    AgentFactory, ChatBackend, CompletionFuture, CompletionSettings, ConversationAgent,
    RetryConfig,
};
use vibe_rs::config::AgentConfig;
use vibe_rs::session::{SessionRegistry, SessionStore};
use vibe_rs::{AgentError, Message, MessageRole, SessionError};

/// Concurrency observed by [`SlowEcho`].
#[derive(Default)]
struct Stats {
    in_flight: Mutex<HashMap<String, usize>>,
    max_same_session: AtomicUsize,
    total_in_flight: AtomicUsize,
    max_total: AtomicUsize,
}

/// Echo backend that sleeps and tracks concurrency keyed by the first user
/// message, which identifies the session in these tests.
#[derive(Default, Clone)]
struct SlowEcho {
    stats: Arc<Stats>,
}

impl ChatBackend for SlowEcho {
    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        _settings: &'a CompletionSettings,
    ) -> CompletionFuture<'a> {
        Box::pin(async move {
            let stats = &self.stats;
            let users: Vec<&Message> = messages
                .iter()
                .filter(|m| m.role() == MessageRole::User)
                .collect();
            let key = users.first().map(|m| m.content().to_string()).unwrap_or_default();
            let last = users.last().map(|m| m.content().to_string()).unwrap_or_default();

            {
                let mut map = stats.in_flight.lock().unwrap();
                let n = map.entry(key.clone()).or_default();
                *n += 1;
                stats.max_same_session.fetch_max(*n, Ordering::SeqCst);
            }
            let total = stats.total_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            stats.max_total.fetch_max(total, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(40)).await;

            stats.total_in_flight.fetch_sub(1, Ordering::SeqCst);
            *stats.in_flight.lock().unwrap().get_mut(&key).unwrap() -= 1;
            Ok(format!("re: {last}"))
        })
    }
}

fn setup(backend: SlowEcho) -> (Arc<ConversationAgent>, Arc<SessionRegistry>) {
    let config = AgentConfig::new("https://example.openai.azure.com", "key");
    let agent = AgentFactory::new().create_agent(&config).unwrap();
    let sessions = Arc::new(SessionRegistry::for_agent(Arc::clone(&agent)));
    let driver = ConversationAgent::new(agent, backend, Arc::clone(&sessions))
        .with_retry(RetryConfig::immediate(1));
    (Arc::new(driver), sessions)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn turns_on_one_session_are_serialised() {
    let backend = SlowEcho::default();
    let stats = Arc::clone(&backend.stats);
    let (driver, sessions) = setup(backend);
    let id = sessions.create(Some("alice")).unwrap();
    driver.chat(&id, "opening").await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..5 {
        let driver = Arc::clone(&driver);
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            driver.chat(&id, &format!("message {i}")).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let handle = sessions.get(&id).await.unwrap();
    let session = handle.lock().await;
    let history: Vec<Message> = session.window.history().cloned().collect();
    assert_eq!(history.len(), 12);

    // Every reply directly follows the message it answers.
    for pair in history.chunks(2) {
        assert_eq!(pair[0].role(), MessageRole::User);
        assert_eq!(pair[1].role(), MessageRole::Assistant);
        assert_eq!(pair[1].content(), format!("re: {}", pair[0].content()));
    }
    assert_eq!(driver.metrics().turns, 6);
    assert_eq!(stats.max_same_session.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_sessions_run_in_parallel() {
    let backend = SlowEcho::default();
    let stats = Arc::clone(&backend.stats);
    let (driver, sessions) = setup(backend);

    let ids: Vec<String> = (0..3).map(|_| sessions.create(None).unwrap()).collect();
    let mut tasks = Vec::new();
    for (n, id) in ids.iter().enumerate() {
        for turn in 0..2 {
            let driver = Arc::clone(&driver);
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                // The first user message names the session for the backend.
                let text = if turn == 0 {
                    format!("session {n}")
                } else {
                    format!("session {n} again")
                };
                driver.chat(&id, &text).await
            }));
        }
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    for id in &ids {
        let handle = sessions.get(id).await.unwrap();
        assert_eq!(handle.lock().await.window.history().count(), 4);
    }
    assert_eq!(driver.metrics().turns, 6);
    assert_eq!(stats.max_same_session.load(Ordering::SeqCst), 1);
    assert!(stats.max_total.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn joined_turns_on_one_session_do_not_overlap() {
    let backend = SlowEcho::default();
    let stats = Arc::clone(&backend.stats);
    let (driver, sessions) = setup(backend);
    let id = sessions.create(None).unwrap();

    let a = driver.chat(&id, "first");
    let b = driver.chat(&id, "second");
    let (ra, rb) = tokio::join!(a, b);
    ra.unwrap();
    rb.unwrap();

    let handle = sessions.get(&id).await.unwrap();
    assert_eq!(handle.lock().await.window.history().count(), 4);
    assert_eq!(stats.max_same_session.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sessions_persist_across_registries() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig::new("https://example.openai.azure.com", "key")
        .with_system_message("Answer briefly.");
    let agent = AgentFactory::new().create_agent(&config).unwrap();

    let id = {
        let sessions = Arc::new(
            SessionRegistry::for_agent(Arc::clone(&agent))
                .with_store(SessionStore::new(dir.path()).unwrap()),
        );
        let driver = ConversationAgent::new(
            Arc::clone(&agent),
            vibe_rs::agent::EchoBackend::new(),
            Arc::clone(&sessions),
        );
        let id = sessions.create(Some("dana")).unwrap();
        driver.chat(&id, "remember this").await.unwrap();
        id
    };

    let sessions = SessionRegistry::for_agent(agent)
        .with_store(SessionStore::new(dir.path()).unwrap());
    assert!(sessions.is_empty());
    let handle = sessions.get(&id).await.unwrap();
    let session = handle.lock().await;
    let messages = session.window.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].content(), "Answer briefly.");
    assert_eq!(messages[1].content(), "remember this");
    assert_eq!(messages[2].content(), "echo: remember this");
}

#[tokio::test]
async fn expired_stored_sessions_are_rejected_and_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path()).unwrap();

    let id = {
        let sessions =
            SessionRegistry::new(chrono::TimeDelta::seconds(-1)).with_store(store.clone());
        sessions.create(None).unwrap()
    };
    assert!(store.exists(&id));

    let sessions = SessionRegistry::default().with_store(store.clone());
    assert!(matches!(
        sessions.get(&id).await,
        Err(SessionError::Expired(_))
    ));
    assert!(!store.exists(&id));
}

#[tokio::test]
async fn cleanup_covers_stored_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path()).unwrap();
    {
        let stale = SessionRegistry::new(chrono::TimeDelta::seconds(-1)).with_store(store.clone());
        stale.create(None).unwrap();
        stale.create(None).unwrap();
    }
    let sessions = SessionRegistry::default().with_store(store.clone());
    let live = sessions.create(None).unwrap();

    assert_eq!(sessions.cleanup_expired().await.unwrap(), 2);
    assert_eq!(store.list_ids().unwrap(), vec![live]);
}

#[tokio::test]
async fn chat_on_missing_session_fails() {
    let (driver, _) = setup(SlowEcho::default());
    let err = driver.chat("ss-missing", "hello").await.unwrap_err();
    assert!(matches!(err, AgentError::Session(SessionError::NotFound(_))));
}
