use std::collections::{HashSet, VecDeque};

use courier_types::MessageId;

/// Default number of message ids remembered per session.
pub const RECENT_ID_CAP: usize = 500;

/// Bounded set of message ids already applied. Once full, every insertion
/// evicts exactly the oldest id.
#[derive(Debug, Clone)]
pub struct RecentIds {
    cap: usize,
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl Default for RecentIds {
    fn default() -> Self {
        Self::with_cap(RECENT_ID_CAP)
    }
}

impl RecentIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cap(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            order: VecDeque::with_capacity(cap),
            seen: HashSet::with_capacity(cap),
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    /// Returns false if `id` was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if self.seen.contains(&id) {
            return false;
        }
        if self.order.len() == self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.clone());
        self.order.push_back(id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mid(n: usize) -> MessageId {
        MessageId::new(format!("m{n}")).unwrap()
    }

    #[test]
    fn rejects_repeats() {
        let mut recent = RecentIds::new();
        assert!(recent.insert(mid(1)));
        assert!(!recent.insert(mid(1)));
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn never_exceeds_cap_and_evicts_oldest_first() {
        let mut recent = RecentIds::new();
        for n in 0..RECENT_ID_CAP {
            recent.insert(mid(n));
        }
        assert_eq!(recent.len(), RECENT_ID_CAP);

        assert!(recent.insert(mid(RECENT_ID_CAP)));
        assert_eq!(recent.len(), RECENT_ID_CAP);
        assert!(!recent.contains(&mid(0)));
        assert!(recent.contains(&mid(1)));
        assert!(recent.contains(&mid(RECENT_ID_CAP)));

        // The evicted id is new again and pushes out the next oldest.
        assert!(recent.insert(mid(0)));
        assert!(!recent.contains(&mid(1)));
        assert!(recent.contains(&mid(2)));
        assert_eq!(recent.len(), RECENT_ID_CAP);
    }

    #[test]
    fn zero_cap_is_clamped() {
        let mut recent = RecentIds::with_cap(0);
        assert_eq!(recent.cap(), 1);
        recent.insert(mid(1));
        recent.insert(mid(2));
        assert_eq!(recent.len(), 1);
        assert!(recent.contains(&mid(2)));
    }
}
