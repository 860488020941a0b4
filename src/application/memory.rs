use crate::domain::types::ChatMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Persistent, append-only conversation history keyed by a caller-supplied
/// thread id. Threads come into existence on first append; eviction and TTL
/// belong to the backing implementation, not to the agent.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// History for a thread, oldest first. Unknown ids yield an empty
    /// sequence, never an error.
    async fn load(&self, thread_id: &str) -> Vec<ChatMessage>;

    /// Appends in order and returns the updated full history.
    async fn append(&self, thread_id: &str, messages: Vec<ChatMessage>) -> Vec<ChatMessage>;

    /// Guard serializing whole turns on one thread id. Distinct ids proceed
    /// in parallel; holding the guard enforces single-writer-per-thread.
    async fn turn_lock(&self, thread_id: &str) -> OwnedMutexGuard<()>;
}

#[derive(Default)]
pub struct InMemoryThreadStore {
    histories: std::sync::Mutex<HashMap<String, Vec<ChatMessage>>>,
    turn_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InMemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn load(&self, thread_id: &str) -> Vec<ChatMessage> {
        let histories = self.histories.lock().expect("thread store lock");
        histories.get(thread_id).cloned().unwrap_or_default()
    }

    async fn append(&self, thread_id: &str, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let mut histories = self.histories.lock().expect("thread store lock");
        let history = histories.entry(thread_id.to_string()).or_default();
        history.extend(messages);
        debug!(
            thread_id,
            total_messages = history.len(),
            "Persisted turn to thread history"
        );
        history.clone()
    }

    async fn turn_lock(&self, thread_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.turn_locks.lock().expect("thread store lock");
            locks
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::ChatMessage;

    #[tokio::test]
    async fn unknown_thread_loads_empty() {
        let store = InMemoryThreadStore::new();
        assert!(store.load("never-seen").await.is_empty());
    }

    #[tokio::test]
    async fn append_returns_full_updated_history() {
        let store = InMemoryThreadStore::new();
        let first = store
            .append("t1", vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")])
            .await;
        assert_eq!(first.len(), 2);

        let second = store.append("t1", vec![ChatMessage::user("again")]).await;
        assert_eq!(second.len(), 3);
        assert_eq!(second[0].content, "hi");
        assert_eq!(second[2].content, "again");
    }

    #[tokio::test]
    async fn threads_do_not_cross_contaminate() {
        let store = InMemoryThreadStore::new();
        store.append("a", vec![ChatMessage::user("for a")]).await;
        store.append("b", vec![ChatMessage::user("for b")]).await;

        let a = store.load("a").await;
        let b = store.load("b").await;
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].content, "for a");
        assert_eq!(b[0].content, "for b");
    }

    #[tokio::test]
    async fn history_is_append_only_across_turns() {
        let store = InMemoryThreadStore::new();
        let mut expected = 0usize;
        for turn in 0..4 {
            let batch = vec![
                ChatMessage::user(format!("question {turn}")),
                ChatMessage::assistant(format!("answer {turn}")),
            ];
            expected += batch.len();
            let history = store.append("t", batch).await;
            assert_eq!(history.len(), expected);
        }
    }

    #[tokio::test]
    async fn turn_lock_serializes_same_thread() {
        let store = Arc::new(InMemoryThreadStore::new());
        let guard = store.turn_lock("t").await;

        let contender = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let _guard = store.turn_lock("t").await;
            })
        };
        // A different thread id must not be blocked by the held guard.
        let _other = store.turn_lock("u").await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.expect("contender completes");
    }
}
