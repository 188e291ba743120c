//! Active-position book
//!
//! The only state shared between the decision loop and the per-position
//! monitoring tasks. Each entry owns its task handle and cancel token; the
//! owning task removes its own key on exit, `cancel`/`drain` remove entries
//! and cancel their tasks under the same lock.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::types::Direction;

/// Position summary for reporting and risk checks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionSummary {
    pub id: String,
    pub direction: Direction,
    pub size: u32,
    pub entry_price: Decimal,
}

struct BookEntry {
    summary: PositionSummary,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Handle of a task that was cancelled and removed from the book
pub struct Detached {
    pub id: String,
    pub handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct PositionBook {
    entries: Mutex<HashMap<String, BookEntry>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a position and spawn its task under one lock
    ///
    /// `spawn` runs only when the id is free, so a duplicate id never starts
    /// a second monitoring task.
    pub async fn insert_with<F>(
        &self,
        summary: PositionSummary,
        cancel: CancellationToken,
        spawn: F,
    ) -> Result<(), EngineError>
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&summary.id) {
            return Err(EngineError::DuplicatePosition(summary.id));
        }
        let handle = spawn();
        info!(
            position_id = %summary.id,
            direction = %summary.direction,
            size = summary.size,
            entry = %summary.entry_price,
            "Position added to book"
        );
        entries.insert(
            summary.id.clone(),
            BookEntry {
                summary,
                cancel,
                handle,
            },
        );
        Ok(())
    }

    /// Remove an entry without cancelling it; called by the owning task
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.entries.lock().await.remove(id).is_some();
        if removed {
            debug!(position_id = %id, "Position removed from book");
        }
        removed
    }

    /// Remove an entry and cancel its task
    pub async fn cancel(&self, id: &str) -> Option<Detached> {
        let entry = self.entries.lock().await.remove(id)?;
        entry.cancel.cancel();
        Some(Detached {
            id: id.to_string(),
            handle: entry.handle,
        })
    }

    /// Remove and cancel every entry
    pub async fn drain(&self) -> Vec<Detached> {
        let mut entries = self.entries.lock().await;
        entries
            .drain()
            .map(|(id, entry)| {
                entry.cancel.cancel();
                Detached { id, handle: entry.handle }
            })
            .collect()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<PositionSummary> {
        let entries = self.entries.lock().await;
        let mut out: Vec<PositionSummary> = entries.values().map(|e| e.summary.clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn summary(id: &str) -> PositionSummary {
        PositionSummary {
            id: id.to_string(),
            direction: Direction::Long,
            size: 1,
            entry_price: dec!(5000),
        }
    }

    fn parked(token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { token.cancelled().await })
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected_without_spawning() {
        let book = PositionBook::new();
        let token = CancellationToken::new();
        let t = token.clone();
        book.insert_with(summary("p1"), token, || parked(t)).await.unwrap();

        let mut spawned = false;
        let err = book
            .insert_with(summary("p1"), CancellationToken::new(), || {
                spawned = true;
                tokio::spawn(async {})
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicatePosition(id) if id == "p1"));
        assert!(!spawned);
        assert_eq!(book.len().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_removes_and_stops_task() {
        let book = PositionBook::new();
        let token = CancellationToken::new();
        let t = token.clone();
        book.insert_with(summary("p1"), token, || parked(t)).await.unwrap();

        let detached = book.cancel("p1").await.unwrap();
        assert!(!book.contains("p1").await);
        tokio::time::timeout(std::time::Duration::from_secs(1), detached.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(book.cancel("p1").await.is_none());
    }

    #[tokio::test]
    async fn test_owner_removal_and_drain() {
        let book = Arc::new(PositionBook::new());
        for id in ["a", "b", "c"] {
            let token = CancellationToken::new();
            let t = token.clone();
            book.insert_with(summary(id), token, || parked(t)).await.unwrap();
        }
        assert!(book.remove("b").await);
        assert!(!book.remove("b").await);

        let ids: Vec<String> = book.snapshot().await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let drained = book.drain().await;
        assert_eq!(drained.len(), 2);
        for d in drained {
            d.handle.await.unwrap();
        }
        assert!(book.is_empty().await);
    }
}
