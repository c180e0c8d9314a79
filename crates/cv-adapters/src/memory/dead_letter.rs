//! In-memory dead letter store

use std::collections::HashMap;

use cv_domain::DeadLetter;
use cv_ports::{DeadLetterError, DeadLetterStore};
use tokio::sync::RwLock;

/// In-memory dead letters grouped by origin queue, oldest first.
#[derive(Default)]
pub struct MemoryDeadLetterStore {
    queues: RwLock<HashMap<String, Vec<DeadLetter>>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self, origin_queue: &str) -> usize {
        self.queues
            .read()
            .await
            .get(origin_queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

impl DeadLetterStore for MemoryDeadLetterStore {
    async fn add(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        let mut queues = self.queues.write().await;
        let queue = queues.entry(letter.origin_queue.clone()).or_default();

        if let Some(existing) = queue
            .iter_mut()
            .find(|l| l.message_id == letter.message_id)
        {
            let retry_count = existing.retry_count.max(letter.retry_count);
            let permanent = existing.permanent || letter.permanent;
            *existing = letter;
            existing.retry_count = retry_count;
            existing.permanent = permanent;
        } else {
            queue.push(letter);
        }
        Ok(())
    }

    async fn list(
        &self,
        origin_queue: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let queues = self.queues.read().await;
        Ok(queues
            .get(origin_queue)
            .map(|queue| queue.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn remove(
        &self,
        origin_queue: &str,
        message_id: &str,
    ) -> Result<(), DeadLetterError> {
        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(origin_queue)
            .ok_or_else(|| DeadLetterError::NotFound {
                origin_queue: origin_queue.to_string(),
                message_id: message_id.to_string(),
            })?;

        let before = queue.len();
        queue.retain(|l| l.message_id != message_id);
        if queue.len() == before {
            return Err(DeadLetterError::NotFound {
                origin_queue: origin_queue.to_string(),
                message_id: message_id.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_permanent(
        &self,
        origin_queue: &str,
        message_id: &str,
    ) -> Result<(), DeadLetterError> {
        let mut queues = self.queues.write().await;
        let letter = queues
            .get_mut(origin_queue)
            .and_then(|queue| queue.iter_mut().find(|l| l.message_id == message_id))
            .ok_or_else(|| DeadLetterError::NotFound {
                origin_queue: origin_queue.to_string(),
                message_id: message_id.to_string(),
            })?;
        letter.permanent = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn letter(queue: &str, message_id: &str) -> DeadLetter {
        DeadLetter::new(message_id, queue, b"{}".to_vec(), "boom", Utc::now())
    }

    #[tokio::test]
    async fn pagination_is_oldest_first() {
        let store = MemoryDeadLetterStore::new();
        for i in 0..5 {
            store.add(letter("orders", &format!("m{i}"))).await.unwrap();
        }

        let page = store.list("orders", 1, 2).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|l| l.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert!(store.list("other", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn re_add_keeps_highest_retry_count() {
        let store = MemoryDeadLetterStore::new();
        store
            .add(letter("q", "m1").with_retry_count(3))
            .await
            .unwrap();
        store
            .add(letter("q", "m1").with_retry_count(1))
            .await
            .unwrap();

        let page = store.list("q", 0, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].retry_count, 3);
    }

    #[tokio::test]
    async fn remove_and_mark_permanent() {
        let store = MemoryDeadLetterStore::new();
        store.add(letter("q", "m1")).await.unwrap();

        store.mark_permanent("q", "m1").await.unwrap();
        assert!(store.list("q", 0, 1).await.unwrap()[0].permanent);

        store.remove("q", "m1").await.unwrap();
        assert!(matches!(
            store.remove("q", "m1").await,
            Err(DeadLetterError::NotFound { .. })
        ));
    }
}
