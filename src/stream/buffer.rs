//! Bounded buffer of recently received events, newest first.

use std::collections::VecDeque;

use crate::stream::proto::StreamEvent;

/// Default number of events retained.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

#[derive(Clone, Debug)]
pub struct RecentEvents {
    events: VecDeque<StreamEvent>,
    capacity: usize,
}

impl RecentEvents {
    /// Creates an empty buffer. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_CAPACITY)),
            capacity,
        }
    }

    /// Inserts `event` at the front, evicting the oldest entry beyond capacity.
    pub fn push(&mut self, event: StreamEvent) {
        self.events.push_front(event);
        self.events.truncate(self.capacity);
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates newest first.
    pub fn iter(&self) -> impl Iterator<Item = &StreamEvent> {
        self.events.iter()
    }

    /// Copies the buffer contents, newest first.
    pub fn to_vec(&self) -> Vec<StreamEvent> {
        self.events.iter().cloned().collect()
    }
}

impl Default for RecentEvents {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::RecentEvents;
    use crate::stream::proto::StreamEvent;

    fn event(id: u64) -> StreamEvent {
        StreamEvent {
            payload: json!({ "id": id }),
            timestamp: Some(id as i64),
        }
    }

    fn ids(buffer: &RecentEvents) -> Vec<u64> {
        buffer
            .iter()
            .filter_map(|event| event.payload.get("id").and_then(|id| id.as_u64()))
            .collect()
    }

    #[test]
    fn iteration_is_reverse_arrival_order() {
        let mut buffer = RecentEvents::default();
        for id in 1..=3 {
            buffer.push(event(id));
        }
        assert_eq!(ids(&buffer), vec![3, 2, 1]);
    }

    #[test]
    fn overflow_keeps_most_recent_entries() {
        let mut buffer = RecentEvents::new(100);
        for id in 1..=250 {
            buffer.push(event(id));
        }
        assert_eq!(buffer.len(), 100);
        let kept = ids(&buffer);
        assert_eq!(kept.first(), Some(&250));
        assert_eq!(kept.last(), Some(&151));
        assert!(kept.windows(2).all(|pair| pair[0] == pair[1] + 1));
    }

    #[test]
    fn clear_empties_but_keeps_capacity() {
        let mut buffer = RecentEvents::new(5);
        buffer.push(event(1));
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 5);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut buffer = RecentEvents::new(0);
        buffer.push(event(1));
        buffer.push(event(2));
        assert_eq!(ids(&buffer), vec![2]);
    }
}
