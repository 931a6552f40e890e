//! Fan-in of discovered hostnames from every flow on every interface.
//!
//! Backed by a `tokio::sync::broadcast` channel: publishing never blocks,
//! and a consumer that falls more than `capacity` events behind loses the
//! oldest ones instead of stalling capture.

use crate::logger::{Event, SharedLogger};
use crate::monitor::types::{DiscoveredHostname, SessionStats, SharedStats};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

/// Publishing side, cloned into every flow task.
#[derive(Clone)]
pub struct Dispatcher {
    tx:     broadcast::Sender<DiscoveredHostname>,
    logger: SharedLogger,
    stats:  SharedStats,
}

/// Consuming side. Yields events in arrival order.
pub struct HostnameStream {
    rx:     broadcast::Receiver<DiscoveredHostname>,
    logger: SharedLogger,
    stats:  SharedStats,
}

impl Dispatcher {
    /// Creates the dispatcher together with its first subscriber, so no
    /// event published after this call is missed.
    ///
    /// The capacity is rounded up to a power of two by the channel.
    pub fn new(capacity: usize, logger: SharedLogger, stats: SharedStats) -> (Self, HostnameStream) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        let stream = HostnameStream {
            rx,
            logger: logger.clone(),
            stats:  stats.clone(),
        };
        (Self { tx, logger, stats }, stream)
    }

    pub fn publish(&self, event: DiscoveredHostname) {
        SessionStats::bump(&self.stats.hostnames_discovered);
        // No subscriber left means nobody is listening; the event is dropped.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> HostnameStream {
        HostnameStream {
            rx:     self.tx.subscribe(),
            logger: self.logger.clone(),
            stats:  self.stats.clone(),
        }
    }
}

impl HostnameStream {
    /// Waits for the next event. Returns `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<DiscoveredHostname> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll for callers that drain on their own schedule.
    pub fn try_recv(&mut self) -> Option<DiscoveredHostname> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn record_lag(&self, skipped: u64) {
        SessionStats::add(&self.stats.events_lost, skipped);
        self.logger.log(&Event::DispatchLagged { skipped });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;
    use chrono::Utc;

    fn event(host: &str) -> DiscoveredHostname {
        DiscoveredHostname {
            interface:     "eth0".into(),
            hostname:      host.into(),
            discovered_at: Utc::now(),
        }
    }

    fn hosts(stream: &mut HostnameStream) -> Vec<String> {
        std::iter::from_fn(|| stream.try_recv()).map(|e| e.hostname).collect()
    }

    #[tokio::test]
    async fn delivers_in_arrival_order() {
        let (dispatcher, mut stream) = Dispatcher::new(16, Logger::stdout(), SessionStats::new());
        dispatcher.publish(event("a.test"));
        dispatcher.publish(event("b.test"));

        assert_eq!(stream.recv().await.unwrap().hostname, "a.test");
        assert_eq!(stream.recv().await.unwrap().hostname, "b.test");
    }

    #[test]
    fn slow_consumer_loses_oldest_events() {
        let stats = SessionStats::new();
        let (dispatcher, mut stream) = Dispatcher::new(2, Logger::stdout(), stats.clone());
        for host in ["1.test", "2.test", "3.test"] {
            dispatcher.publish(event(host));
        }

        assert_eq!(hosts(&mut stream), vec!["2.test", "3.test"]);
        assert_eq!(SessionStats::get(&stats.events_lost), 1);
        assert_eq!(SessionStats::get(&stats.hostnames_discovered), 3);
    }

    #[tokio::test]
    async fn stream_ends_when_publishers_are_gone() {
        let (dispatcher, mut stream) = Dispatcher::new(4, Logger::stdout(), SessionStats::new());
        let worker = dispatcher.clone();
        drop(dispatcher);
        worker.publish(event("last.test"));
        drop(worker);

        assert_eq!(stream.recv().await.unwrap().hostname, "last.test");
        assert!(stream.recv().await.is_none());
    }

    #[test]
    fn late_subscriber_sees_only_later_events() {
        let (dispatcher, _first) = Dispatcher::new(8, Logger::stdout(), SessionStats::new());
        dispatcher.publish(event("early.test"));
        let mut late = dispatcher.subscribe();
        dispatcher.publish(event("late.test"));

        assert_eq!(hosts(&mut late), vec!["late.test"]);
    }
}
