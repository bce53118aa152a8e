//! InMemoryDispatchIndex - ordered dispatch index held in process memory.
//!
//! Mirrors the Redis layout: per name, a set ordered by `(score, identifier)`
//! plus a payload map. A single mutex makes `pop_due` atomic, which is all the
//! Redis script guarantees as well.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::ports::{DispatchEntry, DispatchIndex, IndexedJob};

#[derive(Default)]
struct NamedQueue {
    ordered: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
    payloads: HashMap<String, String>,
}

impl NamedQueue {
    fn insert(&mut self, identifier: &str, score: i64) {
        if let Some(previous) = self.scores.insert(identifier.to_string(), score) {
            self.ordered.remove(&(previous, identifier.to_string()));
        }
        self.ordered.insert((score, identifier.to_string()));
    }
}

#[derive(Default)]
pub struct InMemoryDispatchIndex {
    queues: Mutex<HashMap<String, NamedQueue>>,
}

impl InMemoryDispatchIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DispatchIndex for InMemoryDispatchIndex {
    async fn push(&self, entries: &[DispatchEntry]) -> Result<()> {
        let mut queues = self.queues.lock().await;
        for entry in entries {
            let queue = queues.entry(entry.name.clone()).or_default();
            queue.insert(&entry.identifier, entry.score);
            queue
                .payloads
                .insert(entry.identifier.clone(), entry.payload.clone());
        }
        Ok(())
    }

    async fn pop_due(&self, name: &str, max_score: i64, count: usize) -> Result<Vec<String>> {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.get_mut(name) else {
            return Ok(Vec::new());
        };
        let due: Vec<(i64, String)> = queue
            .ordered
            .iter()
            .take_while(|(score, _)| *score <= max_score)
            .take(count)
            .cloned()
            .collect();
        for entry in &due {
            queue.ordered.remove(entry);
            queue.scores.remove(&entry.1);
        }
        Ok(due.into_iter().map(|(_, identifier)| identifier).collect())
    }

    async fn payloads(&self, name: &str, identifiers: &[String]) -> Result<Vec<Option<String>>> {
        let queues = self.queues.lock().await;
        let queue = queues.get(name);
        Ok(identifiers
            .iter()
            .map(|identifier| queue.and_then(|q| q.payloads.get(identifier).cloned()))
            .collect())
    }

    async fn remove_payload(&self, name: &str, identifier: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get_mut(name) {
            queue.payloads.remove(identifier);
        }
        Ok(())
    }

    async fn len(&self, name: &str) -> Result<u64> {
        let queues = self.queues.lock().await;
        Ok(queues.get(name).map(|q| q.ordered.len() as u64).unwrap_or(0))
    }

    async fn snapshot(&self, name: &str) -> Result<Vec<IndexedJob>> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(name)
            .map(|queue| {
                queue
                    .ordered
                    .iter()
                    .map(|(score, identifier)| IndexedJob {
                        identifier: identifier.clone(),
                        score: *score,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(identifier: &str, score: i64) -> DispatchEntry {
        DispatchEntry {
            name: "email".into(),
            identifier: identifier.into(),
            score,
            payload: format!("{{\"identifier\":\"{identifier}\"}}"),
        }
    }

    #[tokio::test]
    async fn pops_lowest_due_scores_first() {
        let index = InMemoryDispatchIndex::new();
        index
            .push(&[entry("late", 300), entry("early", 100), entry("mid", 200)])
            .await
            .unwrap();

        let popped = index.pop_due("email", 250, 10).await.unwrap();
        assert_eq!(popped, vec!["early".to_string(), "mid".to_string()]);
        assert_eq!(index.len("email").await.unwrap(), 1);

        let payloads = index.payloads("email", &popped).await.unwrap();
        assert!(payloads.iter().all(Option::is_some));
    }

    #[tokio::test]
    async fn repush_replaces_score() {
        let index = InMemoryDispatchIndex::new();
        index.push(&[entry("e1", 500)]).await.unwrap();
        index.push(&[entry("e1", 100)]).await.unwrap();

        let snapshot = index.snapshot("email").await.unwrap();
        assert_eq!(
            snapshot,
            vec![IndexedJob {
                identifier: "e1".into(),
                score: 100
            }]
        );
    }

    #[tokio::test]
    async fn remove_payload_leaves_other_entries() {
        let index = InMemoryDispatchIndex::new();
        index.push(&[entry("a", 1), entry("b", 2)]).await.unwrap();
        index.remove_payload("email", "a").await.unwrap();

        let payloads = index
            .payloads("email", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!(payloads[0].is_none());
        assert!(payloads[1].is_some());
    }

    #[tokio::test]
    async fn unknown_name_is_empty() {
        let index = InMemoryDispatchIndex::new();
        assert!(index.pop_due("nothing", i64::MAX, 5).await.unwrap().is_empty());
        assert_eq!(index.len("nothing").await.unwrap(), 0);
    }
}
