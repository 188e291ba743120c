//! Entry intent tracking for duplicate suppression
//!
//! Every bracket submission is recorded before it is sent. A decision cycle
//! for a direction is held back while a previous submission for that
//! direction is still in flight, or ended ambiguously and is not yet stale.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::Direction;

/// Entry intent states
#[derive(Debug, Clone, PartialEq)]
pub enum EntryIntentState {
    Submitted,
    Accepted { order_id: String },
    Failed { error: String },
    /// Submission timed out; the order may or may not be live
    Unknown,
}

#[derive(Debug, Clone)]
pub struct EntryIntent {
    pub id: Uuid,
    pub direction: Direction,
    pub size: u32,
    pub state: EntryIntentState,
    pub created_at: Instant,
}

/// Intent registry for tracking entry attempts
pub struct IntentRegistry {
    intents: HashMap<Uuid, EntryIntent>,
    stale_after: Duration,
    max_age: Duration,
}

impl IntentRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            intents: HashMap::new(),
            stale_after,
            max_age: Duration::from_secs(3600), // 1 hour retention
        }
    }

    /// Record a submission about to be sent; the id doubles as client order id
    pub fn begin(&mut self, direction: Direction, size: u32) -> Uuid {
        let intent = EntryIntent {
            id: Uuid::new_v4(),
            direction,
            size,
            state: EntryIntentState::Submitted,
            created_at: Instant::now(),
        };
        let id = intent.id;
        debug!(intent_id = %id, direction = %direction, size, "Entry intent created");
        self.intents.insert(id, intent);
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<&EntryIntent> {
        self.intents.get(id)
    }

    pub fn update_state(&mut self, id: &Uuid, state: EntryIntentState) -> anyhow::Result<()> {
        let intent = self
            .intents
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("Intent not found: {}", id))?;
        debug!(intent_id = %id, from = ?intent.state, to = ?state, "Entry intent state");
        intent.state = state;
        Ok(())
    }

    /// Intent blocking a new cycle for `direction`, if any
    pub fn blocking(&self, direction: Direction) -> Option<&EntryIntent> {
        self.intents.values().find(|intent| {
            intent.direction == direction
                && match intent.state {
                    EntryIntentState::Submitted => true,
                    EntryIntentState::Unknown => intent.created_at.elapsed() < self.stale_after,
                    _ => false,
                }
        })
    }

    pub fn is_blocked(&self, direction: Direction) -> bool {
        self.blocking(direction).is_some()
    }

    /// Drop intents past retention
    pub fn cleanup(&mut self) {
        let stale_after = self.stale_after;
        for intent in self.intents.values() {
            if intent.state == EntryIntentState::Unknown && intent.created_at.elapsed() >= stale_after {
                warn!(intent_id = %intent.id, direction = %intent.direction, "Ambiguous entry never resolved");
            }
        }

        let before = self.intents.len();
        let max_age = self.max_age;
        self.intents.retain(|_, intent| intent.created_at.elapsed() < max_age);
        let removed = before - self.intents.len();
        if removed > 0 {
            debug!(removed, "Cleaned up old entry intents");
        }
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    #[cfg(test)]
    fn age(&mut self, id: &Uuid, by: Duration) {
        if let Some(intent) = self.intents.get_mut(id) {
            if let Some(earlier) = intent.created_at.checked_sub(by) {
                intent.created_at = earlier;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_lifecycle() {
        let mut registry = IntentRegistry::new(Duration::from_secs(60));
        let id = registry.begin(Direction::Long, 2);
        assert_eq!(registry.get(&id).unwrap().state, EntryIntentState::Submitted);
        assert!(registry.is_blocked(Direction::Long));
        assert!(!registry.is_blocked(Direction::Short));

        registry
            .update_state(&id, EntryIntentState::Accepted { order_id: "ord-1".to_string() })
            .unwrap();
        assert!(!registry.is_blocked(Direction::Long));
    }

    #[test]
    fn test_unknown_blocks_until_stale() {
        let mut registry = IntentRegistry::new(Duration::from_secs(60));
        let id = registry.begin(Direction::Short, 1);
        registry.update_state(&id, EntryIntentState::Unknown).unwrap();
        assert!(registry.is_blocked(Direction::Short));

        registry.age(&id, Duration::from_secs(61));
        assert!(!registry.is_blocked(Direction::Short));
    }

    #[test]
    fn test_failed_does_not_block() {
        let mut registry = IntentRegistry::new(Duration::from_secs(60));
        let id = registry.begin(Direction::Long, 1);
        registry
            .update_state(&id, EntryIntentState::Failed { error: "rejected".to_string() })
            .unwrap();
        assert!(!registry.is_blocked(Direction::Long));
        assert!(registry.update_state(&Uuid::new_v4(), EntryIntentState::Unknown).is_err());
    }
}
