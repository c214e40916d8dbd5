//! Priority-ordered outgoing queue.
//!
//! Three tiers, drained highest first, FIFO within a tier.

use std::collections::VecDeque;

use covault_core::Priority;

use crate::messages::SyncMessage;

const TIERS: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

fn tier(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Medium => 1,
        Priority::Low => 2,
    }
}

/// Outgoing messages waiting for the transport.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    tiers: [VecDeque<SyncMessage>; TIERS.len()],
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: SyncMessage) {
        self.tiers[tier(msg.priority())].push_back(msg);
    }

    /// The oldest message of the highest non-empty tier.
    pub fn pull(&mut self) -> Option<SyncMessage> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    /// Length of each tier, highest first.
    pub fn tier_lengths(&self) -> [(Priority, usize); TIERS.len()] {
        [
            (TIERS[0], self.tiers[0].len()),
            (TIERS[1], self.tiers[1].len()),
            (TIERS[2], self.tiers[2].len()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covault_core::{CoId, KnownState, NewContent};
    use proptest::prelude::*;

    fn content(n: u8, priority: Priority) -> SyncMessage {
        SyncMessage::Content(NewContent::empty(CoId::from_bytes([n; 32]), priority))
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = PriorityQueue::new();
        queue.push(content(1, Priority::Low));
        queue.push(content(2, Priority::Medium));
        queue.push(content(3, Priority::Medium));
        queue.push(SyncMessage::Known(KnownState::empty(CoId::from_bytes([4; 32]))));
        assert_eq!(queue.len(), 4);

        let order: Vec<u8> = std::iter::from_fn(|| queue.pull())
            .map(|m| m.id().as_bytes()[0])
            .collect();
        assert_eq!(order, vec![4, 2, 3, 1]);
        assert!(queue.is_empty());
    }

    fn priority_strategy() -> impl Strategy<Value = Priority> {
        prop_oneof![Just(Priority::High), Just(Priority::Medium), Just(Priority::Low)]
    }

    proptest! {
        #[test]
        fn prop_pull_order_is_stable_sort_by_priority(
            priorities in proptest::collection::vec(priority_strategy(), 0..40)
        ) {
            let mut queue = PriorityQueue::new();
            for (i, p) in priorities.iter().enumerate() {
                queue.push(content(i as u8, *p));
            }

            let mut expected: Vec<(Priority, u8)> = priorities
                .iter()
                .enumerate()
                .map(|(i, p)| (*p, i as u8))
                .collect();
            expected.sort_by_key(|(p, _)| *p);

            let pulled: Vec<u8> = std::iter::from_fn(|| queue.pull())
                .map(|m| m.id().as_bytes()[0])
                .collect();
            prop_assert_eq!(pulled, expected.into_iter().map(|(_, i)| i).collect::<Vec<_>>());
        }
    }
}
