//! Echo suppression.
//!
//! The backend notifies every subscriber of every change, including the
//! client that made it, and the notification says nothing about its origin.
//! Before a write is issued the writer registers an expectation here; when a
//! matching notification arrives it consumes the expectation and is treated
//! as an echo. Anything that matches no outstanding expectation is external.
//!
//! Expectations are tracked individually (one per expected notification),
//! each tagged with a generation number, so several writes may be in flight
//! at once without one overwriting another's marker. Expectations whose echo
//! never arrives expire after a TTL and stop suppressing anything.
//!
//! Polling backends report at most one coalesced notification per table and
//! poll. Such a notification answers every expectation on its table at once,
//! so a batch of inserts never leaves expectations behind to swallow later
//! external changes.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::backend::{ChangeEvent, RowId};

/// Time after which an unmatched expectation is dropped.
pub const DEFAULT_ECHO_TTL: Duration = Duration::from_secs(10);

/// Identifies one registered expectation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EchoToken(u64);

impl EchoToken {
    pub fn generation(self) -> u64 {
        self.0
    }
}

/// What a notification must look like to count as an echo
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EchoKey {
    pub table: String,
    /// `None` when the row id is not known before the write (inserts)
    pub row_id: Option<RowId>,
}

impl EchoKey {
    pub fn row(table: &str, id: RowId) -> Self {
        Self {
            table: table.to_string(),
            row_id: Some(id),
        }
    }

    pub fn any_row(table: &str) -> Self {
        Self {
            table: table.to_string(),
            row_id: None,
        }
    }

    fn matches_exactly(&self, event: &ChangeEvent) -> bool {
        self.table == event.table && self.row_id.is_some() && self.row_id == event.row_id
    }

    fn matches_loosely(&self, event: &ChangeEvent) -> bool {
        self.table == event.table && (self.row_id.is_none() || event.row_id.is_none())
    }
}

/// Classification of an incoming notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Caused by this client; the matching expectation was consumed
    Echo(EchoToken),
    /// Caused by someone else
    External,
}

#[derive(Debug)]
struct Expectation {
    token: EchoToken,
    key: EchoKey,
    registered: Instant,
}

#[derive(Debug, Default)]
struct TrackerState {
    next_generation: u64,
    outstanding: VecDeque<Expectation>,
}

/// Outstanding "expected echo" markers for one view.
#[derive(Debug)]
pub struct EchoTracker {
    ttl: Duration,
    state: Mutex<TrackerState>,
}

impl Default for EchoTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ECHO_TTL)
    }
}

impl EchoTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Register one expected notification. Call before issuing the write.
    pub fn expect(&self, key: EchoKey) -> EchoToken {
        let mut state = self.state.lock();
        state.next_generation += 1;
        let token = EchoToken(state.next_generation);
        state.outstanding.push_back(Expectation {
            token,
            key,
            registered: Instant::now(),
        });
        token
    }

    /// Register several expected notifications at once
    pub fn expect_all(&self, keys: impl IntoIterator<Item = EchoKey>) -> Vec<EchoToken> {
        keys.into_iter().map(|key| self.expect(key)).collect()
    }

    /// Withdraw an expectation whose write will not produce a notification
    /// (it failed). Returns `false` if it was already consumed or expired.
    pub fn cancel(&self, token: EchoToken) -> bool {
        let mut state = self.state.lock();
        let before = state.outstanding.len();
        state.outstanding.retain(|e| e.token != token);
        state.outstanding.len() != before
    }

    /// Decide whether `event` is an echo of one of our writes.
    ///
    /// An expectation for the exact row wins over a table-wide one; among
    /// equals the oldest is consumed first.
    pub fn classify(&self, event: &ChangeEvent) -> Disposition {
        let mut state = self.state.lock();
        self.expire(&mut state);

        if event.coalesced {
            return Self::absorb(&mut state, event);
        }

        let position = state
            .outstanding
            .iter()
            .position(|e| e.key.matches_exactly(event))
            .or_else(|| {
                state
                    .outstanding
                    .iter()
                    .position(|e| e.key.matches_loosely(event))
            });

        match position.and_then(|i| state.outstanding.remove(i)) {
            Some(expectation) => Disposition::Echo(expectation.token),
            None => Disposition::External,
        }
    }

    /// Number of expectations still waiting for their echo
    pub fn outstanding(&self) -> usize {
        let mut state = self.state.lock();
        self.expire(&mut state);
        state.outstanding.len()
    }

    /// True when no echo is expected
    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    /// Generation of the most recently registered expectation
    pub fn generation(&self) -> u64 {
        self.state.lock().next_generation
    }

    /// Consume every expectation on the event's table. The event is an echo
    /// if there was at least one.
    fn absorb(state: &mut TrackerState, event: &ChangeEvent) -> Disposition {
        let mut first = None;
        state.outstanding.retain(|e| {
            if e.key.table != event.table {
                return true;
            }
            if first.is_none() {
                first = Some(e.token);
            }
            false
        });
        match first {
            Some(token) => {
                tracing::debug!(
                    "coalesced {} on {} absorbed echoes from generation {}",
                    event.kind,
                    event.table,
                    token.0
                );
                Disposition::Echo(token)
            }
            None => Disposition::External,
        }
    }

    fn expire(&self, state: &mut TrackerState) {
        let now = Instant::now();
        let ttl = self.ttl;
        state.outstanding.retain(|e| {
            let live = now.duration_since(e.registered) <= ttl;
            if !live {
                tracing::debug!(
                    "echo for {} (generation {}) never arrived, dropping",
                    e.key.table,
                    e.token.0
                );
            }
            live
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChangeKind;

    fn event(table: &str, row_id: Option<RowId>) -> ChangeEvent {
        ChangeEvent {
            table: table.to_string(),
            kind: ChangeKind::Update,
            row_id,
            record: None,
            coalesced: false,
        }
    }

    fn polled(table: &str) -> ChangeEvent {
        ChangeEvent {
            coalesced: true,
            ..event(table, None)
        }
    }

    #[tokio::test]
    async fn test_echo_consumes_expectation() {
        let tracker = EchoTracker::default();
        let token = tracker.expect(EchoKey::row("QuotedProjects", 1));
        assert_eq!(tracker.outstanding(), 1);

        assert_eq!(
            tracker.classify(&event("QuotedProjects", Some(1))),
            Disposition::Echo(token)
        );
        assert!(tracker.is_idle());
        assert_eq!(
            tracker.classify(&event("QuotedProjects", Some(1))),
            Disposition::External
        );
    }

    #[tokio::test]
    async fn test_other_row_is_external() {
        let tracker = EchoTracker::default();
        tracker.expect(EchoKey::row("QuotedProjects", 1));
        assert_eq!(
            tracker.classify(&event("QuotedProjects", Some(2))),
            Disposition::External
        );
        assert_eq!(tracker.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_multiple_writes_in_flight() {
        let tracker = EchoTracker::default();
        let first = tracker.expect(EchoKey::row("equipmentCells", 10));
        let second = tracker.expect(EchoKey::row("equipmentCells", 11));
        assert!(second.generation() > first.generation());

        // Echoes arrive out of order; each is still attributed correctly
        assert_eq!(
            tracker.classify(&event("equipmentCells", Some(11))),
            Disposition::Echo(second)
        );
        assert_eq!(
            tracker.classify(&event("equipmentCells", Some(10))),
            Disposition::Echo(first)
        );
        assert!(tracker.is_idle());
    }

    #[tokio::test]
    async fn test_exact_match_preferred_over_table_wide() {
        let tracker = EchoTracker::default();
        let insert = tracker.expect(EchoKey::any_row("equipmentRows"));
        let update = tracker.expect(EchoKey::row("equipmentRows", 4));

        assert_eq!(
            tracker.classify(&event("equipmentRows", Some(4))),
            Disposition::Echo(update)
        );
        assert_eq!(
            tracker.classify(&event("equipmentRows", Some(9))),
            Disposition::Echo(insert)
        );
    }

    #[tokio::test]
    async fn test_cancel_withdraws_expectation() {
        let tracker = EchoTracker::default();
        let token = tracker.expect(EchoKey::row("Categories", 1));
        assert!(tracker.cancel(token));
        assert!(!tracker.cancel(token));
        assert_eq!(
            tracker.classify(&event("Categories", Some(1))),
            Disposition::External
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_expectations_expire() {
        let tracker = EchoTracker::new(Duration::from_secs(2));
        tracker.expect(EchoKey::row("Categories", 1));

        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(tracker.is_idle());
        assert_eq!(
            tracker.classify(&event("Categories", Some(1))),
            Disposition::External
        );
    }

    #[tokio::test]
    async fn test_coalesced_event_answers_the_whole_table() {
        let tracker = EchoTracker::default();
        let first = tracker.expect_all((0..3).map(|_| EchoKey::any_row("CategoryDataValues")));
        tracker.expect(EchoKey::row("CategoryData", 7));

        assert_eq!(
            tracker.classify(&polled("CategoryDataValues")),
            Disposition::Echo(first[0])
        );
        assert_eq!(tracker.outstanding(), 1);

        // The next change to the table is someone else's
        assert_eq!(
            tracker.classify(&event("CategoryDataValues", Some(5))),
            Disposition::External
        );
        assert!(matches!(
            tracker.classify(&polled("CategoryData")),
            Disposition::Echo(_)
        ));
        assert!(tracker.is_idle());
        assert_eq!(
            tracker.classify(&polled("CategoryData")),
            Disposition::External
        );
    }
}
