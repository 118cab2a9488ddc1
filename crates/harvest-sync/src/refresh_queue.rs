//! Deduplicating priority queue of entities awaiting re-collection.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use harvest_core::{ConfigMap, Watermark};
use serde::{Deserialize, Serialize};

/// Lower rank is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPriority {
    /// Never collected, or very stale.
    Critical = 0,
    Stale = 1,
    Normal = 2,
    Maintenance = 3,
}

impl RefreshPriority {
    pub fn rank(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshTask {
    pub entity_key: String,
    pub priority: RefreshPriority,
    pub reason: Option<String>,
    pub metadata: ConfigMap,
    pub queued_at: DateTime<Utc>,
    /// Enqueue order; breaks priority ties first-in first-out.
    pub sequence: u64,
}

#[derive(Debug)]
struct HeapEntry(RefreshTask);

impl HeapEntry {
    fn sort_key(&self) -> (RefreshPriority, u64) {
        (self.0.priority, self.0.sequence)
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Queued,
    AlreadyQueued,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub by_priority: BTreeMap<RefreshPriority, usize>,
}

/// Age cut-offs used to rank stale entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgeThresholds {
    pub critical_after: Duration,
    pub stale_after: Duration,
    pub normal_after: Duration,
}

impl Default for AgeThresholds {
    fn default() -> Self {
        Self {
            critical_after: Duration::days(30),
            stale_after: Duration::days(7),
            normal_after: Duration::days(1),
        }
    }
}

pub fn priority_for_age(
    last_collected_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    thresholds: &AgeThresholds,
) -> RefreshPriority {
    let Some(last) = last_collected_at else {
        return RefreshPriority::Critical;
    };
    let age = now - last;
    if age >= thresholds.critical_after {
        RefreshPriority::Critical
    } else if age >= thresholds.stale_after {
        RefreshPriority::Stale
    } else if age >= thresholds.normal_after {
        RefreshPriority::Normal
    } else {
        RefreshPriority::Maintenance
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaleEntity {
    pub entity_key: String,
    pub last_collected_at: Option<DateTime<Utc>>,
    pub metadata: ConfigMap,
}

impl From<&Watermark> for StaleEntity {
    fn from(wm: &Watermark) -> Self {
        let mut metadata = ConfigMap::new();
        metadata.insert("domain".into(), wm.domain.clone().into());
        metadata.insert("source".into(), wm.source.clone().into());
        if let Some(region) = &wm.region {
            metadata.insert("region".into(), region.clone().into());
        }
        Self {
            entity_key: wm.key().to_string(),
            last_collected_at: Some(wm.last_collected_at),
            metadata,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    members: HashSet<String>,
    next_sequence: u64,
}

/// Shared between the bulk stale-enqueue path and ad-hoc requests; one lock
/// guards heap and membership together.
#[derive(Debug, Default)]
pub struct RefreshQueue {
    state: Mutex<QueueState>,
}

impl RefreshQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(
        &self,
        entity_key: impl Into<String>,
        priority: RefreshPriority,
        reason: Option<String>,
        metadata: ConfigMap,
        now: DateTime<Utc>,
    ) -> AddOutcome {
        let entity_key = entity_key.into();
        let mut state = self.lock();
        if state.members.contains(&entity_key) {
            return AddOutcome::AlreadyQueued;
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.members.insert(entity_key.clone());
        state.heap.push(Reverse(HeapEntry(RefreshTask {
            entity_key,
            priority,
            reason,
            metadata,
            queued_at: now,
            sequence,
        })));
        AddOutcome::Queued
    }

    pub fn pop(&self) -> Option<RefreshTask> {
        let mut state = self.lock();
        let Reverse(HeapEntry(task)) = state.heap.pop()?;
        state.members.remove(&task.entity_key);
        Some(task)
    }

    pub fn peek(&self) -> Option<RefreshTask> {
        self.lock().heap.peek().map(|Reverse(HeapEntry(task))| task.clone())
    }

    /// Number of tasks removed.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let removed = state.heap.len();
        state.heap.clear();
        state.members.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, entity_key: &str) -> bool {
        self.lock().members.contains(entity_key)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        let mut by_priority = BTreeMap::new();
        for Reverse(HeapEntry(task)) in state.heap.iter() {
            *by_priority.entry(task.priority).or_insert(0) += 1;
        }
        QueueStats {
            total: state.heap.len(),
            by_priority,
        }
    }

    /// Rank each entity by age and enqueue it; returns how many were newly queued.
    pub fn enqueue_stale<I>(&self, entities: I, now: DateTime<Utc>, thresholds: &AgeThresholds) -> usize
    where
        I: IntoIterator<Item = StaleEntity>,
    {
        entities
            .into_iter()
            .map(|entity| {
                let priority = priority_for_age(entity.last_collected_at, now, thresholds);
                let reason = match entity.last_collected_at {
                    Some(last) => format!("last collected {}h ago", (now - last).num_hours()),
                    None => "never collected".to_string(),
                };
                self.add(entity.entity_key, priority, Some(reason), entity.metadata, now)
            })
            .filter(|outcome| *outcome == AddOutcome::Queued)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(queue: &RefreshQueue, key: &str, priority: RefreshPriority) -> AddOutcome {
        queue.add(key, priority, None, ConfigMap::new(), Utc::now())
    }

    #[test]
    fn duplicate_adds_are_rejected_while_queued() {
        let queue = RefreshQueue::new();
        assert_eq!(add(&queue, "fred/GDP", RefreshPriority::Normal), AddOutcome::Queued);
        assert_eq!(add(&queue, "fred/GDP", RefreshPriority::Critical), AddOutcome::AlreadyQueued);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek().unwrap().priority, RefreshPriority::Normal);
    }

    #[test]
    fn pop_returns_most_urgent_and_frees_the_key() {
        let queue = RefreshQueue::new();
        add(&queue, "a", RefreshPriority::Maintenance);
        add(&queue, "b", RefreshPriority::Critical);
        add(&queue, "c", RefreshPriority::Stale);

        let first = queue.pop().unwrap();
        assert_eq!(first.entity_key, "b");
        assert!(!queue.contains("b"));
        assert_eq!(add(&queue, "b", RefreshPriority::Normal), AddOutcome::Queued);

        let order: Vec<String> = std::iter::from_fn(|| queue.pop()).map(|t| t.entity_key).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn equal_priorities_pop_in_enqueue_order() {
        let queue = RefreshQueue::new();
        for key in ["x1", "x2", "x3", "x4"] {
            add(&queue, key, RefreshPriority::Stale);
        }
        let order: Vec<String> = std::iter::from_fn(|| queue.pop()).map(|t| t.entity_key).collect();
        assert_eq!(order, vec!["x1", "x2", "x3", "x4"]);
    }

    #[test]
    fn peek_does_not_remove() {
        let queue = RefreshQueue::new();
        assert!(queue.peek().is_none());
        add(&queue, "k", RefreshPriority::Normal);
        assert_eq!(queue.peek().unwrap().entity_key, "k");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn clear_reports_removed_count() {
        let queue = RefreshQueue::new();
        add(&queue, "a", RefreshPriority::Normal);
        add(&queue, "b", RefreshPriority::Normal);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(add(&queue, "a", RefreshPriority::Normal), AddOutcome::Queued);
    }

    #[test]
    fn age_maps_to_priority() {
        let now = Utc::now();
        let t = AgeThresholds::default();
        assert_eq!(priority_for_age(None, now, &t), RefreshPriority::Critical);
        assert_eq!(priority_for_age(Some(now - Duration::days(45)), now, &t), RefreshPriority::Critical);
        assert_eq!(priority_for_age(Some(now - Duration::days(10)), now, &t), RefreshPriority::Stale);
        assert_eq!(priority_for_age(Some(now - Duration::days(2)), now, &t), RefreshPriority::Normal);
        assert_eq!(priority_for_age(Some(now - Duration::hours(3)), now, &t), RefreshPriority::Maintenance);
    }

    #[test]
    fn enqueue_stale_ranks_and_counts() {
        let now = Utc::now();
        let queue = RefreshQueue::new();
        let entity = |key: &str, last: Option<DateTime<Utc>>| StaleEntity {
            entity_key: key.to_string(),
            last_collected_at: last,
            metadata: ConfigMap::new(),
        };
        let added = queue.enqueue_stale(
            vec![
                entity("fresh", Some(now - Duration::hours(1))),
                entity("never", None),
                entity("week", Some(now - Duration::days(8))),
                entity("never", None),
            ],
            now,
            &AgeThresholds::default(),
        );
        assert_eq!(added, 3);

        let stats = queue.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_priority.get(&RefreshPriority::Critical), Some(&1));
        assert_eq!(stats.by_priority.get(&RefreshPriority::Maintenance), Some(&1));

        let first = queue.pop().unwrap();
        assert_eq!(first.entity_key, "never");
        assert_eq!(first.reason.as_deref(), Some("never collected"));
    }
}
