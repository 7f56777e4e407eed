//! Companion memory boundary
//!
//! Long-term memory (embeddings plus vector search) is an external service. The relay
//! only needs "give me a few relevant snippets for this user", so that is all the
//! trait asks for.

use async_trait::async_trait;
use std::error::Error;

use crate::event::MemoryMode;

pub type MemoryResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Up to `limit` snippets relevant to `message` for `user_id`
    async fn recall(
        &self,
        user_id: &str,
        message: &str,
        limit: usize,
    ) -> MemoryResult<Vec<String>>;
}

/// Store used when no memory backend is wired in
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMemory;

#[async_trait]
impl MemoryStore for NoMemory {
    async fn recall(
        &self,
        _user_id: &str,
        _message: &str,
        _limit: usize,
    ) -> MemoryResult<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Snippets plus the telemetry that describes them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recall {
    pub mode: MemoryMode,
    pub snippets: Vec<String>,
}

/// Recall for an optional user. Anonymous turns skip memory; a failing store is
/// logged and treated as an empty recall.
pub async fn recall_for(
    store: &dyn MemoryStore,
    user_id: Option<&str>,
    message: &str,
    limit: usize,
) -> Recall {
    let Some(user_id) = user_id.filter(|id| !id.trim().is_empty()) else {
        return Recall {
            mode: MemoryMode::Off,
            snippets: Vec::new(),
        };
    };

    let snippets = match store.recall(user_id, message, limit).await {
        Ok(mut snippets) => {
            snippets.truncate(limit);
            snippets
        }
        Err(e) => {
            tracing::warn!(user_id, "Memory recall failed, continuing without memories: {}", e);
            Vec::new()
        }
    };

    Recall {
        mode: MemoryMode::Recall,
        snippets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<&'static str>);

    #[async_trait]
    impl MemoryStore for Fixed {
        async fn recall(
            &self,
            _user_id: &str,
            _message: &str,
            _limit: usize,
        ) -> MemoryResult<Vec<String>> {
            Ok(self.0.iter().map(|s| (*s).to_string()).collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl MemoryStore for Broken {
        async fn recall(
            &self,
            _user_id: &str,
            _message: &str,
            _limit: usize,
        ) -> MemoryResult<Vec<String>> {
            Err("index offline".into())
        }
    }

    #[tokio::test]
    async fn test_anonymous_turn_skips_memory() {
        let recall = recall_for(&Fixed(vec!["likes tea"]), None, "hi", 5).await;
        assert_eq!(recall.mode, MemoryMode::Off);
        assert!(recall.snippets.is_empty());

        let recall = recall_for(&Fixed(vec!["likes tea"]), Some("  "), "hi", 5).await;
        assert_eq!(recall.mode, MemoryMode::Off);
    }

    #[tokio::test]
    async fn test_recall_is_limited() {
        let recall = recall_for(&Fixed(vec!["a", "b", "c"]), Some("u1"), "hi", 2).await;
        assert_eq!(recall.mode, MemoryMode::Recall);
        assert_eq!(recall.snippets, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failing_store_is_not_fatal() {
        let recall = recall_for(&Broken, Some("u1"), "hi", 2).await;
        assert_eq!(recall.mode, MemoryMode::Recall);
        assert!(recall.snippets.is_empty());
        assert!(recall_for(&NoMemory, Some("u1"), "hi", 2).await.snippets.is_empty());
    }
}
