// src/delivery/events.rs

//! Session snapshot broadcast
//!
//! Every state change is published as an immutable `DeliverySession`
//! snapshot. Subscribers see only snapshots published after they subscribe.
//! Each subscriber has its own bounded buffer; when it falls behind, the
//! oldest snapshots are dropped and the subscriber is told how many it
//! missed. Publishing never waits on a subscriber.

use super::DeliverySession;
use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

/// Item delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A session changed
    Snapshot(DeliverySession),
    /// The subscriber fell behind and this many snapshots were dropped
    Lagged(u64),
}

/// Publish side of the notification channel
#[derive(Debug, Clone)]
pub struct SessionEvents {
    tx: broadcast::Sender<DeliverySession>,
}

impl SessionEvents {
    /// Create a channel buffering up to `capacity` snapshots per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Broadcast a snapshot to all current subscribers
    ///
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, session: DeliverySession) -> usize {
        // Ignore send errors (no subscribers)
        self.tx.send(session).unwrap_or(0)
    }

    /// Subscribe to snapshots published from now on
    pub fn subscribe(&self) -> SessionSubscription {
        SessionSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receive side held by one subscriber
#[derive(Debug)]
pub struct SessionSubscription {
    rx: broadcast::Receiver<DeliverySession>,
}

impl SessionSubscription {
    /// Wait for the next event
    ///
    /// Returns `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        match self.rx.recv().await {
            Ok(session) => Some(SessionEvent::Snapshot(session)),
            Err(RecvError::Lagged(n)) => {
                warn!("Session subscriber lagged {} snapshots", n);
                Some(SessionEvent::Lagged(n))
            }
            Err(RecvError::Closed) => None,
        }
    }

    /// Wait for the next snapshot, skipping lag notices
    pub async fn next_snapshot(&mut self) -> Option<DeliverySession> {
        loop {
            match self.recv().await? {
                SessionEvent::Snapshot(session) => return Some(session),
                SessionEvent::Lagged(_) => continue,
            }
        }
    }

    /// Take the next event if one is already buffered
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        match self.rx.try_recv() {
            Ok(session) => Some(SessionEvent::Snapshot(session)),
            Err(TryRecvError::Lagged(n)) => Some(SessionEvent::Lagged(n)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Drain everything buffered right now
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Convert into an endless stream of events
    pub fn into_stream(self) -> impl Stream<Item = SessionEvent> + Send + 'static {
        BroadcastStream::new(self.rx).map(|result| match result {
            Ok(session) => SessionEvent::Snapshot(session),
            Err(BroadcastStreamRecvError::Lagged(n)) => SessionEvent::Lagged(n),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{ModuleId, SessionState};

    fn snapshot(name: &str, state: SessionState) -> DeliverySession {
        let mut session = DeliverySession::new(ModuleId::parse(name).unwrap());
        session.state = state;
        session
    }

    #[test]
    fn test_publish_without_subscribers() {
        let events = SessionEvents::new(4);
        assert_eq!(events.publish(snapshot("m1", SessionState::Requested)), 0);
    }

    #[tokio::test]
    async fn test_subscriber_sees_only_future_events() {
        let events = SessionEvents::new(8);
        events.publish(snapshot("m1", SessionState::Requested));

        let mut sub = events.subscribe();
        events.publish(snapshot("m1", SessionState::Pending));

        let next = sub.next_snapshot().await.unwrap();
        assert_eq!(next.state, SessionState::Pending);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let events = SessionEvents::new(8);
        let mut a = events.subscribe();
        let mut b = events.subscribe();
        assert_eq!(events.subscriber_count(), 2);

        assert_eq!(events.publish(snapshot("m1", SessionState::Downloading)), 2);

        assert_eq!(a.next_snapshot().await.unwrap().state, SessionState::Downloading);
        assert_eq!(b.next_snapshot().await.unwrap().state, SessionState::Downloading);
    }

    #[test]
    fn test_slow_subscriber_drops_oldest() {
        let events = SessionEvents::new(2);
        let mut sub = events.subscribe();

        for state in [
            SessionState::Requested,
            SessionState::Pending,
            SessionState::Downloading,
            SessionState::Downloaded,
        ] {
            events.publish(snapshot("m1", state));
        }

        let drained = sub.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0], SessionEvent::Lagged(2));
        assert!(
            matches!(&drained[1], SessionEvent::Snapshot(s) if s.state == SessionState::Downloading)
        );
        assert!(
            matches!(&drained[2], SessionEvent::Snapshot(s) if s.state == SessionState::Downloaded)
        );
    }

    #[tokio::test]
    async fn test_stream_ends_when_publisher_dropped() {
        let events = SessionEvents::new(4);
        let sub = events.subscribe();
        events.publish(snapshot("m1", SessionState::Installed));
        drop(events);

        let collected: Vec<SessionEvent> = sub.into_stream().collect().await;
        assert_eq!(collected.len(), 1);
    }
}
