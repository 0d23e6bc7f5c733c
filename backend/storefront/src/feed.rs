//! In-process change feed backing the live views.
//!
//! Writers publish a [`Topic`] after every committed change. Readers hold a
//! [`Subscription`] for one topic and re-read their snapshot whenever it
//! fires. A subscription is released by dropping it or calling
//! [`Subscription::dispose`]; either way its cancellation token fires so
//! anything streaming from it stops.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Ledger(String),
    Orders(String),
    Collages(String),
    SiteStatus,
}

#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<Topic>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, topic: Topic) {
        // No receivers is the normal idle state.
        let _ = self.tx.send(topic);
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        Subscription {
            topic,
            rx: self.tx.subscribe(),
            cancel: CancellationToken::new(),
            primed: false,
        }
    }
}

#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<Topic>,
    cancel: CancellationToken,
    primed: bool,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Wait until the subscriber should take a fresh snapshot.
    ///
    /// The first call returns immediately. Returns `false` once the
    /// subscription is cancelled or the feed is gone.
    pub async fn next_change(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if !self.primed {
            self.primed = true;
            return true;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                received = self.rx.recv() => match received {
                    Ok(topic) if topic == self.topic => return true,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Subscription to {:?} lagged by {skipped}", self.topic);
                        return true;
                    }
                    Err(RecvError::Closed) => return false,
                },
            }
        }
    }

    /// Make the next [`next_change`](Self::next_change) yield a snapshot immediately.
    pub fn restart(&mut self) {
        self.primed = false;
    }

    /// Token that fires when this subscription is released.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn first_call_is_the_initial_snapshot() {
        let feed = ChangeFeed::new(8);
        let mut sub = feed.subscribe(Topic::SiteStatus);
        assert!(sub.next_change().await);
    }

    #[tokio::test]
    async fn ignores_other_topics() {
        let feed = ChangeFeed::new(8);
        let mut sub = feed.subscribe(Topic::Ledger("alice".into()));
        assert!(sub.next_change().await);

        feed.publish(Topic::Ledger("bob".into()));
        feed.publish(Topic::Orders("alice".into()));
        feed.publish(Topic::Ledger("alice".into()));

        let fired = tokio::time::timeout(Duration::from_secs(1), sub.next_change())
            .await
            .expect("change expected");
        assert!(fired);

        let idle = tokio::time::timeout(Duration::from_millis(50), sub.next_change()).await;
        assert!(idle.is_err(), "no further change should be pending");
    }

    #[tokio::test]
    async fn restart_replays_snapshot() {
        let feed = ChangeFeed::new(8);
        let mut sub = feed.subscribe(Topic::SiteStatus);
        assert!(sub.next_change().await);
        sub.restart();
        assert!(sub.next_change().await);
    }

    #[tokio::test]
    async fn dispose_cancels_token() {
        let feed = ChangeFeed::new(8);
        let sub = feed.subscribe(Topic::SiteStatus);
        let token = sub.cancel_token();
        assert!(!token.is_cancelled());
        sub.dispose();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn lagging_counts_as_change() {
        let feed = ChangeFeed::new(1);
        let mut sub = feed.subscribe(Topic::Ledger("alice".into()));
        assert!(sub.next_change().await);
        for _ in 0..4 {
            feed.publish(Topic::Ledger("bob".into()));
        }
        assert!(sub.next_change().await);
    }
}
