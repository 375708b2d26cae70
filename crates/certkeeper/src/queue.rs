//! Renewal ordering
//!
//! A small priority queue of pending renewals. Tasks only become eligible once
//! their `scheduled_at` instant has been reached; among eligible tasks the
//! highest priority is taken first and equal priorities come out in insertion
//! order.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// A pending renewal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalTask {
    pub domain: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Higher runs first
    pub priority: i64,
    /// Not eligible before this instant
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    task: RenewalTask,
}

/// Pending renewals ordered by priority, then insertion
#[derive(Debug, Default)]
pub struct RenewalQueue {
    entries: Vec<Entry>,
    next_seq: u64,
}

impl RenewalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: RenewalTask) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry { seq, task });
    }

    /// Remove and return the best eligible task at `now`
    pub fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<RenewalTask> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.task.scheduled_at <= now)
            // Earlier sequence wins a priority tie.
            .max_by_key(|(_, e)| (e.task.priority, std::cmp::Reverse(e.seq)))
            .map(|(i, _)| i)?;

        Some(self.entries.swap_remove(index).task)
    }

    /// Earliest instant at which some task becomes eligible
    pub fn next_scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().map(|e| e.task.scheduled_at).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use proptest::prelude::*;

    fn task(domain: &str, priority: i64, scheduled_at: DateTime<Utc>) -> RenewalTask {
        RenewalTask {
            domain: domain.to_string(),
            cert_path: PathBuf::from(format!("{domain}.crt")),
            key_path: PathBuf::from(format!("{domain}.key")),
            priority,
            scheduled_at,
        }
    }

    #[test]
    fn test_highest_priority_first() {
        let now = Utc::now();
        let mut queue = RenewalQueue::new();
        queue.push(task("low.com", 1, now));
        queue.push(task("high.com", 10, now));
        queue.push(task("mid.com", 5, now));

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_ready(now))
            .map(|t| t.domain)
            .collect();
        assert_eq!(order, vec!["high.com", "mid.com", "low.com"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_future_tasks_not_eligible() {
        let now = Utc::now();
        let mut queue = RenewalQueue::new();
        queue.push(task("later.com", 100, now + TimeDelta::hours(1)));
        queue.push(task("now.com", 1, now));

        assert_eq!(queue.pop_ready(now).unwrap().domain, "now.com");
        assert!(queue.pop_ready(now).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_scheduled_at(), Some(now + TimeDelta::hours(1)));

        let later = now + TimeDelta::hours(2);
        assert_eq!(queue.pop_ready(later).unwrap().domain, "later.com");
    }

    #[test]
    fn test_empty_queue() {
        let mut queue = RenewalQueue::new();
        assert!(queue.pop_ready(Utc::now()).is_none());
        assert!(queue.next_scheduled_at().is_none());
    }

    proptest! {
        #[test]
        fn prop_ties_are_fifo(count in 1usize..20, priority in -50i64..50) {
            let now = Utc::now();
            let mut queue = RenewalQueue::new();
            for i in 0..count {
                queue.push(task(&format!("d{i:02}.com"), priority, now));
            }

            for i in 0..count {
                let popped = queue.pop_ready(now).unwrap();
                prop_assert_eq!(popped.domain, format!("d{i:02}.com"));
            }
        }

        #[test]
        fn prop_pop_order_is_non_increasing(priorities in prop::collection::vec(-100i64..100, 1..30)) {
            let now = Utc::now();
            let mut queue = RenewalQueue::new();
            for (i, p) in priorities.iter().enumerate() {
                queue.push(task(&format!("d{i}.com"), *p, now));
            }

            let mut last = i64::MAX;
            while let Some(t) = queue.pop_ready(now) {
                prop_assert!(t.priority <= last);
                last = t.priority;
            }
        }
    }
}
