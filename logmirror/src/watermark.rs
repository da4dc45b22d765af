//! The slave acknowledgement watermark: the greatest offset any slave has
//! confirmed, plus the notification channel producer waiters hang off.

use tokio::sync::watch;
use utils::offset::{AtomicOffset, Offset};

/// Greatest offset acknowledged by any slave. Advanced by master-side
/// connection tasks, consumed by [`crate::group_commit::GroupCommitService`].
/// There is no decrement path.
pub struct SlaveWatermark {
    acked: AtomicOffset,
    // notification side channel; the atomic above is the source of truth
    advance_tx: watch::Sender<Offset>,
}

impl SlaveWatermark {
    pub fn new() -> Self {
        let (advance_tx, _) = watch::channel(Offset::ZERO);
        SlaveWatermark {
            acked: AtomicOffset::new(Offset::ZERO),
            advance_tx,
        }
    }

    pub fn get(&self) -> Offset {
        self.acked.load()
    }

    /// Monotonically advance the watermark, signaling waiters only when the
    /// stored value actually grew. Concurrent advances may coalesce into one
    /// signal, but the signal for the final value is never dropped.
    pub fn advance_to(&self, candidate: Offset) -> bool {
        let grew = self.acked.advance(candidate);
        if grew {
            self.advance_tx.send_if_modified(|cur| {
                if candidate > *cur {
                    *cur = candidate;
                    true
                } else {
                    false
                }
            });
        }
        grew
    }

    /// Channel yielding watermark values as they advance.
    pub fn subscribe(&self) -> watch::Receiver<Offset> {
        self.advance_tx.subscribe()
    }

    /// Bytes the master end of the log is ahead of the watermark.
    pub fn fall_behind(&self, master_max: Offset) -> u64 {
        master_max.saturating_sub(self.get())
    }
}

impl Default for SlaveWatermark {
    fn default() -> Self {
        SlaveWatermark::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_advance_is_monotonic() {
        let wm = SlaveWatermark::new();
        assert!(wm.advance_to(Offset(100)));
        assert!(!wm.advance_to(Offset(50)));
        assert!(!wm.advance_to(Offset(100)));
        assert_eq!(wm.get(), Offset(100));
        assert_eq!(wm.fall_behind(Offset(130)), 30);
        assert_eq!(wm.fall_behind(Offset(70)), 0);
    }

    #[tokio::test]
    async fn test_waiter_observes_advance() {
        let wm = SlaveWatermark::new();
        let mut rx = wm.subscribe();
        assert!(wm.advance_to(Offset(80)));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Offset(80));
    }

    // racing notifiers may coalesce signals but the final value must win in
    // both the atomic and the watch channel
    #[test]
    fn test_concurrent_advances() {
        let wm = Arc::new(SlaveWatermark::new());
        let rx = wm.subscribe();
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let wm = Arc::clone(&wm);
            handles.push(std::thread::spawn(move || {
                for i in 0..500u64 {
                    wm.advance_to(Offset(t * 500 + i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wm.get(), Offset(1999));
        assert_eq!(*rx.borrow(), Offset(1999));
    }
}
