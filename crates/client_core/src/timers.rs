use std::{collections::HashMap, hash::Hash, time::Duration};

use tokio::time::Instant;

/// Named one-shot deadlines. Arming an armed timer replaces its deadline.
#[derive(Debug)]
pub struct TimerQueue<K> {
    deadlines: HashMap<K, Instant>,
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self {
            deadlines: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash + Ord> TimerQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, kind: K, delay: Duration) {
        self.arm_at(kind, Instant::now() + delay);
    }

    pub fn arm_at(&mut self, kind: K, deadline: Instant) {
        self.deadlines.insert(kind, deadline);
    }

    /// Arms only when not armed yet, keeping an earlier deadline in place.
    pub fn arm_if_idle(&mut self, kind: K, delay: Duration) -> bool {
        if self.deadlines.contains_key(&kind) {
            return false;
        }
        self.arm(kind, delay);
        true
    }

    pub fn disarm(&mut self, kind: &K) -> bool {
        self.deadlines.remove(kind).is_some()
    }

    pub fn is_armed(&self, kind: &K) -> bool {
        self.deadlines.contains_key(kind)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Disarms and returns every timer whose deadline is at or before `now`,
    /// earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<K> {
        let mut due: Vec<(Instant, K)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(kind, deadline)| (*deadline, *kind))
            .collect();
        due.sort();
        for (_, kind) in &due {
            self.deadlines.remove(kind);
        }
        due.into_iter().map(|(_, kind)| kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rearm_replaces_deadline() {
        let mut timers = TimerQueue::new();
        let start = Instant::now();
        timers.arm_at(1u8, start + Duration::from_secs(1));
        timers.arm_at(1u8, start + Duration::from_secs(5));
        assert!(timers.take_due(start + Duration::from_secs(2)).is_empty());
        assert_eq!(timers.take_due(start + Duration::from_secs(5)), vec![1]);
        assert!(!timers.is_armed(&1));
    }

    #[test]
    fn arm_if_idle_keeps_first_deadline() {
        let mut timers = TimerQueue::new();
        assert!(timers.arm_if_idle(7u8, Duration::from_secs(1)));
        let first = timers.next_deadline();
        assert!(!timers.arm_if_idle(7u8, Duration::from_secs(30)));
        assert_eq!(timers.next_deadline(), first);
    }

    #[test]
    fn due_timers_come_back_earliest_first() {
        let mut timers = TimerQueue::new();
        let start = Instant::now();
        timers.arm_at(3u8, start + Duration::from_millis(30));
        timers.arm_at(1u8, start + Duration::from_millis(10));
        timers.arm_at(2u8, start + Duration::from_millis(20));
        timers.arm_at(9u8, start + Duration::from_secs(60));
        assert_eq!(
            timers.take_due(start + Duration::from_millis(30)),
            vec![1, 2, 3]
        );
        assert_eq!(timers.next_deadline(), Some(start + Duration::from_secs(60)));
    }
}
