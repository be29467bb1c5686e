//! Fixed-capacity thread lists and wait-queue anchors.

use crate::config::MAX_THREADS;

use super::thread::{QueueKey, ThreadId};

/// Ordered list of thread handles, at most one entry per thread.
#[derive(Debug, Clone)]
pub struct ThreadList {
    slots: [Option<ThreadId>; MAX_THREADS],
    len: usize,
}

impl ThreadList {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_THREADS],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> Option<ThreadId> {
        self.slots[0]
    }

    pub fn contains(&self, tid: ThreadId) -> bool {
        self.iter().any(|t| t == tid)
    }

    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.slots[..self.len].iter().flatten().copied()
    }

    /// Insert at `pos`, shifting later entries back. Returns `false` if
    /// the list is full or already holds `tid`.
    pub fn insert(&mut self, pos: usize, tid: ThreadId) -> bool {
        if self.len == MAX_THREADS || self.contains(tid) {
            return false;
        }
        let pos = pos.min(self.len);
        self.slots.copy_within(pos..self.len, pos + 1);
        self.slots[pos] = Some(tid);
        self.len += 1;
        true
    }

    pub fn push_back(&mut self, tid: ThreadId) -> bool {
        self.insert(self.len, tid)
    }

    /// Position of the first entry for which `pred` holds, or the length.
    pub fn position(&self, mut pred: impl FnMut(ThreadId) -> bool) -> usize {
        self.iter().position(|t| pred(t)).unwrap_or(self.len)
    }

    pub fn remove(&mut self, tid: ThreadId) -> bool {
        let Some(pos) = self.iter().position(|t| t == tid) else {
            return false;
        };
        self.slots.copy_within(pos + 1..self.len, pos);
        self.len -= 1;
        self.slots[self.len] = None;
        true
    }
}

impl Default for ThreadList {
    fn default() -> Self {
        Self::new()
    }
}

/// Anchor of an intrusive wait queue, embedded in every blocking object.
///
/// The queue is identified by its address, so it must not move while a
/// thread waits on it. `signaled` latches a notify that found no waiter.
#[derive(Debug, Default)]
pub struct ThreadQueue {
    signaled: bool,
}

impl ThreadQueue {
    pub const fn new() -> Self {
        Self { signaled: false }
    }

    #[inline]
    pub fn key(&self) -> QueueKey {
        QueueKey::Object(self as *const Self as usize)
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled
    }

    pub fn latch(&mut self) {
        self.signaled = true;
    }

    pub fn clear(&mut self) {
        self.signaled = false;
    }

    /// Consume a latched signal.
    pub fn take_signal(&mut self) -> bool {
        core::mem::take(&mut self.signaled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(i: u8) -> ThreadId {
        ThreadId::new(i, 0)
    }

    #[test]
    fn test_insert_and_remove_keep_order() {
        let mut list = ThreadList::new();
        assert!(list.push_back(tid(1)));
        assert!(list.push_back(tid(3)));
        assert!(list.insert(1, tid(2)));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![tid(1), tid(2), tid(3)]);

        assert!(list.remove(tid(2)));
        assert!(!list.remove(tid(2)));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![tid(1), tid(3)]);
        assert_eq!(list.first(), Some(tid(1)));
    }

    #[test]
    fn test_rejects_duplicates_and_overflow() {
        let mut list = ThreadList::new();
        assert!(list.push_back(tid(0)));
        assert!(!list.push_back(tid(0)));
        for i in 1..MAX_THREADS as u8 {
            assert!(list.push_back(tid(i)));
        }
        assert!(!list.push_back(tid(200)));
        assert_eq!(list.len(), MAX_THREADS);
    }

    #[test]
    fn test_queue_latch() {
        let mut q = ThreadQueue::new();
        assert!(!q.take_signal());
        q.latch();
        assert!(q.is_signaled());
        assert!(q.take_signal());
        assert!(!q.is_signaled());
    }

    #[test]
    fn test_distinct_queues_have_distinct_keys() {
        let pair = [ThreadQueue::new(), ThreadQueue::new()];
        assert_ne!(pair[0].key(), pair[1].key());
    }
}
