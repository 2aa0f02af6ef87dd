//! Profile queue ordered by priority.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::domain::profile::{ProfileContext, ProfileKey, TranscodingParams};

/// Heap entry. Higher priority first; equal priorities keep arrival order.
#[derive(Debug)]
struct Entry {
    priority: u64,
    seq: u64,
    key: ProfileKey,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // 同じ優先度なら先に来た方（seq が小さい方）が大きい
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedProfile {
    pub context: ProfileContext,
    pub params: TranscodingParams,
}

/// Unique-by-key priority queue.
///
/// Removal is lazy: the heap may hold stale entries, skipped on pop.
#[derive(Debug, Default)]
pub struct ProfileQueue {
    heap: BinaryHeap<Entry>,
    /// Live entries with their sequence number.
    live: HashMap<ProfileKey, (u64, QueuedProfile)>,
    next_seq: u64,
}

impl ProfileQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the key is already queued.
    pub fn push(&mut self, context: ProfileContext, params: TranscodingParams) -> bool {
        if self.live.contains_key(&context.key) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            priority: context.priority(),
            seq,
            key: context.key.clone(),
        });
        self.live
            .insert(context.key.clone(), (seq, QueuedProfile { context, params }));
        true
    }

    pub fn pop(&mut self) -> Option<QueuedProfile> {
        while let Some(entry) = self.heap.pop() {
            if self.live.get(&entry.key).is_some_and(|(seq, _)| *seq == entry.seq)
                && let Some((_, queued)) = self.live.remove(&entry.key)
            {
                return Some(queued);
            }
        }
        None
    }

    pub fn remove(&mut self, key: &ProfileKey) -> Option<QueuedProfile> {
        self.live.remove(key).map(|(_, queued)| queued)
    }

    pub fn contains(&self, key: &ProfileKey) -> bool {
        self.live.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
