//! Strict-priority lanes.
//!
//! One FIFO per [`Priority`]. A processing tick takes one batch from the
//! highest non-empty lane and nothing else, so a flood of urgent traffic
//! delays lower lanes by whole ticks rather than starving them inside one.

use std::collections::VecDeque;

use courier_core::QueueMessage;
use courier_proto::Priority;

/// The four lanes.
#[derive(Debug, Clone, Default)]
pub struct Lanes {
    lanes: [VecDeque<QueueMessage>; 4],
}

impl Lanes {
    /// Empty lanes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the message's lane.
    pub fn push(&mut self, message: QueueMessage) {
        self.lanes[message.priority.index()].push_back(message);
    }

    /// Put messages back at the head of `priority`'s lane, keeping their order.
    pub fn requeue_front(&mut self, priority: Priority, messages: Vec<QueueMessage>) {
        let lane = &mut self.lanes[priority.index()];
        for message in messages.into_iter().rev() {
            lane.push_front(message);
        }
    }

    /// Take up to `max` messages from the highest non-empty lane.
    pub fn next_batch(&mut self, max: usize) -> Option<(Priority, Vec<QueueMessage>)> {
        for priority in Priority::ALL {
            let lane = &mut self.lanes[priority.index()];
            if lane.is_empty() {
                continue;
            }
            let take = lane.len().min(max);
            return Some((priority, lane.drain(..take).collect()));
        }
        None
    }

    /// Whether a message with `id` is queued.
    pub fn contains(&self, id: &str) -> bool {
        self.lanes.iter().any(|lane| lane.iter().any(|m| m.id == id))
    }

    /// Queued messages in one lane.
    pub fn depth(&self, priority: Priority) -> usize {
        self.lanes[priority.index()].len()
    }

    /// Depth of every lane, highest priority first.
    pub fn depths(&self) -> [usize; 4] {
        [self.lanes[0].len(), self.lanes[1].len(), self.lanes[2].len(), self.lanes[3].len()]
    }

    /// Total queued messages.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    /// Whether every lane is empty.
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::DeliveryOptions;
    use courier_proto::{MessageType, TargetType, payloads::queue::QueueSend};
    use proptest::prelude::*;

    use super::*;

    fn message(id: usize, priority: Priority) -> QueueMessage {
        let send = QueueSend {
            message_type: MessageType::Chat,
            payload: Vec::new(),
            to: vec!["bob".into()],
            target_type: TargetType::User,
            priority: Some(priority),
            options: None,
        };
        QueueMessage::from_send(
            format!("m{id}"),
            "alice".into(),
            send,
            DeliveryOptions::default(),
            0,
            "s1",
        )
    }

    fn priority() -> impl Strategy<Value = Priority> {
        prop::sample::select(Priority::ALL.to_vec())
    }

    #[test]
    fn requeue_front_keeps_order() {
        let mut lanes = Lanes::new();
        lanes.push(message(3, Priority::Normal));
        lanes.requeue_front(
            Priority::Normal,
            vec![message(1, Priority::Normal), message(2, Priority::Normal)],
        );

        let (_, batch) = lanes.next_batch(10).unwrap();
        let ids: Vec<_> = batch.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
    }

    proptest! {
        #[test]
        fn batch_comes_from_highest_nonempty_lane_only(
            priorities in prop::collection::vec(priority(), 1..300),
            batch in 1usize..120,
        ) {
            let mut lanes = Lanes::new();
            for (i, p) in priorities.iter().enumerate() {
                lanes.push(message(i, *p));
            }
            let highest = priorities.iter().map(|p| p.index()).min().unwrap();
            let before = lanes.depths();

            let (lane, taken) = lanes.next_batch(batch).unwrap();
            prop_assert_eq!(lane.index(), highest);
            prop_assert!(taken.iter().all(|m| m.priority.index() == highest));
            prop_assert_eq!(taken.len(), before[highest].min(batch));

            let after = lanes.depths();
            for (i, (a, b)) in after.iter().zip(before.iter()).enumerate() {
                if i != highest {
                    prop_assert_eq!(a, b);
                }
            }
        }

        #[test]
        fn lane_order_is_fifo(count in 1usize..50) {
            let mut lanes = Lanes::new();
            for i in 0..count {
                lanes.push(message(i, Priority::Low));
            }
            let (_, taken) = lanes.next_batch(count).unwrap();
            let ids: Vec<String> = taken.into_iter().map(|m| m.id).collect();
            let expected: Vec<String> = (0..count).map(|i| format!("m{i}")).collect();
            prop_assert_eq!(ids, expected);
            prop_assert!(lanes.is_empty());
        }
    }
}
