//! Peer stall detection.
//!
//! Every request with an expected reply records a deadline; a ticker scans
//! them and the first missed deadline fires the detector's exit token,
//! which the owning peer connection observes to disconnect. The
//! command-to-reply table is a fixed matrix: `GetBlocks` expects `Inv`,
//! `GetData` expects one of `Block`, `Tx` or `NotFound`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use umbra_messages::Topic;

/// Replies expected after sending `topic`.
fn expected_replies(topic: Topic) -> &'static [Topic] {
    match topic {
        Topic::GetBlocks => &[Topic::Inv],
        Topic::GetData => &[Topic::Block, Topic::Tx, Topic::NotFound],
        _ => &[],
    }
}

/// Pending entries cleared when `topic` arrives. A data reply settles the
/// whole `GetData` family.
fn cleared_by(topic: Topic) -> &'static [Topic] {
    match topic {
        Topic::Block | Topic::Tx | Topic::NotFound => {
            &[Topic::Block, Topic::Tx, Topic::NotFound]
        }
        Topic::Inv => &[Topic::Inv],
        _ => &[],
    }
}

/// Stall detector for one peer connection.
pub struct StallDetector {
    response_time: Duration,
    responses: Arc<Mutex<HashMap<Topic, Instant>>>,
    exit: CancellationToken,
    ticker: tokio::task::JoinHandle<()>,
}

impl StallDetector {
    /// Start a detector. `response_time` is how long the peer has to reply;
    /// `tick_interval` is how often deadlines are scanned.
    pub fn new(response_time: Duration, tick_interval: Duration) -> Self {
        let responses: Arc<Mutex<HashMap<Topic, Instant>>> = Arc::new(Mutex::new(HashMap::new()));
        let exit = CancellationToken::new();

        let scan = responses.clone();
        let trip = exit.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let now = Instant::now();
                let stalled = scan.lock().values().any(|deadline| now > *deadline);
                if stalled {
                    info!("peer deadline passed");
                    scan.lock().clear();
                    trip.cancel();
                    return;
                }
            }
        });

        StallDetector {
            response_time,
            responses,
            exit,
            ticker,
        }
    }

    /// Record that we sent `topic` and now expect its replies.
    pub fn add_message(&self, topic: Topic) {
        let deadline = Instant::now() + self.response_time;
        let mut responses = self.responses.lock();
        for reply in expected_replies(topic) {
            responses.insert(*reply, deadline);
        }
    }

    /// Record that `topic` arrived, settling whatever expected it.
    pub fn remove_message(&self, topic: Topic) {
        let mut responses = self.responses.lock();
        for slot in cleared_by(topic) {
            responses.remove(slot);
        }
    }

    /// Token fired on the first missed deadline. The peer watches this to
    /// disconnect.
    pub fn exit(&self) -> CancellationToken {
        self.exit.clone()
    }

    /// Pending expected replies (for tests and diagnostics).
    pub fn pending(&self) -> usize {
        self.responses.lock().len()
    }
}

impl Drop for StallDetector {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_remove_leaves_map_unchanged() {
        let detector = StallDetector::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(detector.pending(), 0);

        detector.add_message(Topic::GetBlocks);
        assert_eq!(detector.pending(), 1);
        detector.remove_message(Topic::Inv);
        assert_eq!(detector.pending(), 0);

        detector.add_message(Topic::GetData);
        assert_eq!(detector.pending(), 3);
        detector.remove_message(Topic::Block);
        assert_eq!(detector.pending(), 0);
    }

    #[tokio::test]
    async fn unrelated_messages_do_not_arm_the_detector() {
        let detector = StallDetector::new(Duration::from_secs(5), Duration::from_secs(1));
        detector.add_message(Topic::Reduction);
        assert_eq!(detector.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_deadline_fires_exit() {
        let detector = StallDetector::new(Duration::from_millis(100), Duration::from_millis(50));
        detector.add_message(Topic::GetBlocks);

        let exit = detector.exit();
        tokio::time::timeout(Duration::from_secs(1), exit.cancelled())
            .await
            .expect("exit fired after the deadline");
        assert_eq!(detector.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_in_time_keeps_the_connection() {
        let detector = StallDetector::new(Duration::from_millis(200), Duration::from_millis(50));
        detector.add_message(Topic::GetBlocks);
        detector.remove_message(Topic::Inv);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!detector.exit().is_cancelled());
    }
}
