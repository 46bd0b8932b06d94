//! Dequeue ordering policy.
//!
//! Pure selection over candidate records so the ordering rule can be tested
//! without a cache. The queue engine consults this on every dequeue.

use chrono::{DateTime, Utc};

use crate::domain::TaskPriority;

/// One pending task as seen by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Enqueue sequence number; defines insertion order within a band.
    pub seq: i64,
    pub priority: TaskPriority,
    pub scheduled_at: DateTime<Utc>,
}

/// Index of the next candidate to hand out, or `None` when nothing is
/// eligible.
///
/// Ordering: only candidates with `scheduled_at <= now` are eligible; among
/// those, highest priority first, ties broken by earlier `scheduled_at`, then
/// by lower sequence number.
pub fn next_eligible(candidates: &[Candidate], now: DateTime<Utc>) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.scheduled_at <= now)
        .min_by_key(|(_, c)| (std::cmp::Reverse(c.priority), c.scheduled_at, c.seq))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;

    fn candidate(seq: i64, priority: TaskPriority, scheduled_at: DateTime<Utc>) -> Candidate {
        Candidate {
            seq,
            priority,
            scheduled_at,
        }
    }

    #[test]
    fn empty_set_yields_none() {
        assert_eq!(next_eligible(&[], Utc::now()), None);
    }

    #[test]
    fn higher_priority_wins() {
        let now = Utc::now();
        let candidates = vec![
            candidate(1, TaskPriority::Low, now),
            candidate(2, TaskPriority::Medium, now),
            candidate(3, TaskPriority::High, now),
        ];

        assert_eq!(next_eligible(&candidates, now), Some(2));
    }

    #[test]
    fn future_tasks_are_invisible() {
        let now = Utc::now();
        let candidates = vec![
            candidate(1, TaskPriority::High, now + Duration::seconds(10)),
            candidate(2, TaskPriority::Low, now),
        ];

        assert_eq!(next_eligible(&candidates, now), Some(1));
        assert_eq!(
            next_eligible(&candidates, now + Duration::seconds(11)),
            Some(0),
            "the high band re-becomes eligible by wall-clock progression"
        );
    }

    #[test]
    fn all_future_yields_none() {
        let now = Utc::now();
        let candidates = vec![candidate(1, TaskPriority::High, now + Duration::seconds(1))];
        assert_eq!(next_eligible(&candidates, now), None);
    }

    #[rstest]
    #[case::low(TaskPriority::Low)]
    #[case::medium(TaskPriority::Medium)]
    #[case::high(TaskPriority::High)]
    fn sequence_breaks_ties_within_a_band(#[case] priority: TaskPriority) {
        let now = Utc::now();
        let candidates = vec![
            candidate(7, priority, now),
            candidate(3, priority, now),
            candidate(5, priority, now),
        ];

        assert_eq!(next_eligible(&candidates, now), Some(1));
    }

    #[test]
    fn earlier_schedule_breaks_ties_before_sequence() {
        let now = Utc::now();
        let candidates = vec![
            candidate(1, TaskPriority::Medium, now),
            candidate(2, TaskPriority::Medium, now - Duration::seconds(30)),
        ];

        assert_eq!(next_eligible(&candidates, now), Some(1));
    }
}
