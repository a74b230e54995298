//! Outstanding playback-mark tracker.
//!
//! Every outbound audio chunk is followed by a `mark` frame; the vendor
//! echoes the mark once that chunk has finished playing. The set of labels
//! sent but not yet echoed is the ground truth for "is the agent audibly
//! speaking right now", which drives barge-in detection and the deferred
//! transfer flow.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

/// Shared set of unacknowledged mark labels. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MarkTracker {
    inner: Arc<MarkTrackerInner>,
}

#[derive(Debug, Default)]
struct MarkTrackerInner {
    labels: Mutex<HashSet<String>>,
    drained: Notify,
}

impl MarkTracker {
    /// New, empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a label whose audio was just sent to the peer.
    pub fn add(&self, label: impl Into<String>) {
        if let Ok(mut labels) = self.inner.labels.lock() {
            labels.insert(label.into());
        }
    }

    /// Acknowledge a label; wakes `wait_for_all` when the set drains.
    pub fn remove(&self, label: &str) {
        let empty = match self.inner.labels.lock() {
            Ok(mut labels) => {
                labels.remove(label);
                labels.is_empty()
            }
            Err(_) => return,
        };
        if empty {
            self.inner.drained.notify_waiters();
        }
    }

    /// Whether any audio is still unacknowledged.
    pub fn is_empty(&self) -> bool {
        self.inner
            .labels
            .lock()
            .map(|labels| labels.is_empty())
            .unwrap_or(true)
    }

    /// Number of unacknowledged labels.
    pub fn len(&self) -> usize {
        self.inner.labels.lock().map(|labels| labels.len()).unwrap_or(0)
    }

    /// Drop all labels; called on session end and interruption.
    pub fn clear(&self) {
        if let Ok(mut labels) = self.inner.labels.lock() {
            labels.clear();
        }
        self.inner.drained.notify_waiters();
    }

    /// Wait until every outstanding mark has been acknowledged.
    ///
    /// Bounded by `timeout`; returns `true` when the set drained, `false`
    /// when the bound was hit with marks still outstanding.
    pub async fn wait_for_all(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Arm the notifier before the emptiness check so a removal
            // between check and wait cannot be missed.
            let drained = self.inner.drained.notified();
            if self.is_empty() {
                return true;
            }
            tokio::select! {
                () = drained => {}
                () = tokio::time::sleep_until(deadline) => return self.is_empty(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_tracks_outstanding_set() {
        let tracker = MarkTracker::new();
        assert!(tracker.is_empty());

        tracker.add("m-0");
        tracker.add("m-1");
        assert_eq!(tracker.len(), 2);

        tracker.remove("m-0");
        assert_eq!(tracker.len(), 1);
        assert!(!tracker.is_empty());

        tracker.remove("m-1");
        assert!(tracker.is_empty());
    }

    #[test]
    fn remove_unknown_label_is_harmless() {
        let tracker = MarkTracker::new();
        tracker.add("m-0");
        tracker.remove("not-there");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn clear_empties_the_set() {
        let tracker = MarkTracker::new();
        tracker.add("a");
        tracker.add("b");
        tracker.clear();
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn wait_for_all_returns_immediately_when_empty() {
        let tracker = MarkTracker::new();
        assert!(tracker.wait_for_all(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn wait_for_all_wakes_on_final_ack() {
        let tracker = MarkTracker::new();
        tracker.add("m-0");
        tracker.add("m-1");

        let waiter = tracker.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_all(Duration::from_secs(5)).await });

        tokio::task::yield_now().await;
        tracker.remove("m-0");
        tracker.remove("m-1");

        assert!(handle.await.expect("join"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_all_times_out_with_marks_outstanding() {
        let tracker = MarkTracker::new();
        tracker.add("stuck");
        assert!(!tracker.wait_for_all(Duration::from_millis(50)).await);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn wait_for_all_wakes_on_clear() {
        let tracker = MarkTracker::new();
        tracker.add("m-0");

        let waiter = tracker.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_all(Duration::from_secs(5)).await });

        tokio::task::yield_now().await;
        tracker.clear();
        assert!(handle.await.expect("join"));
    }
}
