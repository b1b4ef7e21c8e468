//! Periodic ranking of peers by recent download contribution, selecting the
//! top-N upload partners to reciprocate to (tit-for-tat).

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use crate::RECIPROCATION_SLOTS;

/// The externally-observable, lock-free state of one peer session.
///
/// Owned by the session task (the sole writer of the byte counters and
/// `active`); read by the choking controller and, if later wired up, a UI.
/// Monotonic counters tolerate the loose consistency of unsynchronized
/// reads, per the concurrency model.
#[derive(Debug)]
pub(crate) struct SessionCounters {
    pub bytes_downloaded: AtomicU64,
    pub bytes_uploaded: AtomicU64,
    /// Set by the choking controller; read by the session to decide whether
    /// to honor `Interested`/`Request` from this peer.
    pub reciprocate: AtomicBool,
    /// Cleared by the session right before it returns from `run`.
    pub active: AtomicBool,
}

impl Default for SessionCounters {
    fn default() -> Self {
        Self {
            bytes_downloaded: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            reciprocate: AtomicBool::new(false),
            active: AtomicBool::new(true),
        }
    }
}

/// Re-ranks every known session on each [`ChokingController::tick`], setting
/// `reciprocate` on the top [`RECIPROCATION_SLOTS`] sessions by bytes
/// downloaded since the last tick. No optimistic-unchoke slot: this is an
/// explicit non-goal.
pub(crate) struct ChokingController {
    sessions: Vec<Arc<SessionCounters>>,
    last_downloaded: Vec<u64>,
}

impl ChokingController {
    pub fn new(sessions: Vec<Arc<SessionCounters>>) -> Self {
        let last_downloaded = vec![0; sessions.len()];
        Self {
            sessions,
            last_downloaded,
        }
    }

    /// Re-ranks all sessions and updates their `reciprocate` flags in place.
    /// Returns the number of sessions now being reciprocated to, for
    /// logging.
    pub fn tick(&mut self) -> usize {
        let mut deltas: Vec<(usize, u64)> = self
            .sessions
            .iter()
            .enumerate()
            .map(|(i, counters)| {
                let downloaded =
                    counters.bytes_downloaded.load(Ordering::Relaxed);
                let delta = downloaded.saturating_sub(self.last_downloaded[i]);
                self.last_downloaded[i] = downloaded;
                (i, delta)
            })
            .collect();

        deltas.sort_by(|a, b| b.1.cmp(&a.1));

        let mut reciprocating = 0;
        for (rank, &(i, delta)) in deltas.iter().enumerate() {
            let reciprocate = rank < RECIPROCATION_SLOTS && delta > 0;
            if reciprocate {
                reciprocating += 1;
            }
            self.sessions[i]
                .reciprocate
                .store(reciprocate, Ordering::Relaxed);
        }
        reciprocating
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters_with_download(bytes: u64) -> Arc<SessionCounters> {
        let c = Arc::new(SessionCounters::default());
        c.bytes_downloaded.store(bytes, Ordering::Relaxed);
        c
    }

    #[test]
    fn reciprocates_top_four_by_delta() {
        // downloads: [100, 50, 200, 10, 5, 300, 1] -> top 4 are indices
        // 5 (300), 2 (200), 0 (100), 1 (50)
        let sessions: Vec<_> = vec![100, 50, 200, 10, 5, 300, 1]
            .into_iter()
            .map(counters_with_download)
            .collect();
        let mut controller = ChokingController::new(sessions.clone());
        let n = controller.tick();
        assert_eq!(n, 4);

        let expect_reciprocate = [true, true, true, false, false, true, false];
        for (i, session) in sessions.iter().enumerate() {
            assert_eq!(
                session.reciprocate.load(Ordering::Relaxed),
                expect_reciprocate[i],
                "session {} reciprocate flag mismatch",
                i
            );
        }
    }

    #[test]
    fn does_not_reciprocate_zero_delta_sessions() {
        let sessions: Vec<_> =
            vec![0, 0, 0].into_iter().map(counters_with_download).collect();
        let mut controller = ChokingController::new(sessions.clone());
        let n = controller.tick();
        assert_eq!(n, 0);
        for session in &sessions {
            assert!(!session.reciprocate.load(Ordering::Relaxed));
        }
    }

    #[test]
    fn selected_set_never_exceeds_four() {
        let sessions: Vec<_> = (1..=10)
            .map(|i| counters_with_download(i * 10))
            .collect();
        let mut controller = ChokingController::new(sessions.clone());
        let n = controller.tick();
        assert!(n <= RECIPROCATION_SLOTS);
        let reciprocating = sessions
            .iter()
            .filter(|s| s.reciprocate.load(Ordering::Relaxed))
            .count();
        assert_eq!(reciprocating, n);
    }

    #[test]
    fn ranks_by_delta_not_absolute_total_across_ticks() {
        let sessions: Vec<_> =
            vec![1000, 0].into_iter().map(counters_with_download).collect();
        let mut controller = ChokingController::new(sessions.clone());
        // first tick: session 0 has a huge delta (1000 - 0), session 1 has 0
        controller.tick();
        assert!(sessions[0].reciprocate.load(Ordering::Relaxed));
        assert!(!sessions[1].reciprocate.load(Ordering::Relaxed));

        // session 1 now catches up with a fresh burst of downloads while
        // session 0 goes idle; next tick should flip the ranking
        sessions[1].bytes_downloaded.store(2000, Ordering::Relaxed);
        controller.tick();
        assert!(!sessions[0].reciprocate.load(Ordering::Relaxed));
        assert!(sessions[1].reciprocate.load(Ordering::Relaxed));
    }
}
