//! Effect Scheduler
//!
//! The scheduler decides *when* effects run. The graph decides *which*.
//!
//! Effects reached by a write are queued here, deduplicated, in the order
//! they were first scheduled. The queue is drained at a flush point:
//!
//! - immediately after a write made outside any batch,
//! - when the outermost `batch` closure returns,
//! - never while a flush is already running (the running flush picks up
//!   anything queued during it).

use indexmap::IndexSet;

use super::node::NodeId;

/// Pending effects plus the batch/flush bookkeeping that gates them.
#[derive(Debug, Default)]
pub struct EffectQueue {
    pending: IndexSet<NodeId>,
    batch_depth: usize,
    flushing: bool,
}

impl EffectQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an effect. Returns `false` if it was already pending.
    pub fn schedule(&mut self, id: NodeId) -> bool {
        self.pending.insert(id)
    }

    pub fn schedule_all(&mut self, ids: impl IntoIterator<Item = NodeId>) {
        self.pending.extend(ids);
    }

    /// Take the earliest scheduled effect.
    pub fn pop_next(&mut self) -> Option<NodeId> {
        self.pending.shift_remove_index(0)
    }

    pub fn remove(&mut self, id: NodeId) {
        self.pending.shift_remove(&id);
    }

    pub fn is_pending(&self, id: NodeId) -> bool {
        self.pending.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn enter_batch(&mut self) {
        self.batch_depth += 1;
    }

    /// Leave a batch. Returns `true` when the outermost batch just closed.
    pub fn exit_batch(&mut self) -> bool {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        self.batch_depth == 0
    }

    pub fn is_batching(&self) -> bool {
        self.batch_depth > 0
    }

    /// Claim the flush. Returns `false` if a flush is already running.
    pub fn begin_flush(&mut self) -> bool {
        if self.flushing {
            return false;
        }
        self.flushing = true;
        true
    }

    pub fn end_flush(&mut self) {
        self.flushing = false;
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// Whether a write right now should flush synchronously.
    pub fn can_flush(&self) -> bool {
        !self.flushing && self.batch_depth == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_deduplicates_in_first_scheduled_order() {
        let mut queue = EffectQueue::new();
        let a = NodeId::new();
        let b = NodeId::new();
        let c = NodeId::new();

        assert!(queue.schedule(b));
        assert!(queue.schedule(a));
        assert!(!queue.schedule(b));
        queue.schedule_all([c, a]);

        assert_eq!(queue.len(), 3);
        queue.remove(c);
        assert!(!queue.is_pending(c));
        queue.schedule(c);
        assert_eq!(queue.pop_next(), Some(b));
        assert_eq!(queue.pop_next(), Some(a));
        assert_eq!(queue.pop_next(), Some(c));
        assert_eq!(queue.pop_next(), None);
    }

    #[test]
    fn nested_batches_close_at_outermost() {
        let mut queue = EffectQueue::new();
        queue.enter_batch();
        queue.enter_batch();
        assert!(!queue.can_flush());

        assert!(!queue.exit_batch());
        assert!(queue.is_batching());
        assert!(queue.exit_batch());
        assert!(queue.can_flush());
    }

    #[test]
    fn flush_cannot_be_claimed_twice() {
        let mut queue = EffectQueue::new();
        assert!(queue.begin_flush());
        assert!(queue.is_flushing());
        assert!(!queue.begin_flush());
        assert!(!queue.can_flush());
        queue.end_flush();
        assert!(queue.can_flush());
    }
}
