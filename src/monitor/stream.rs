//! Per-flow parser tasks.
//!
//! [`SniStreamFactory`] is the [`StreamFactory`] the capture pumps use. For
//! every new flow it spawns a task that owns an append-only buffer per
//! direction and re-runs the ClientHello parser as bytes arrive, until it
//! finds an SNI, both directions prove not to be a ClientHello, or the
//! reassembler drops the flow.

use crate::logger::{Event, SharedLogger};
use crate::monitor::config::MAX_HELLO_BYTES;
use crate::monitor::dispatch::Dispatcher;
use crate::monitor::flow::{Delivery, FlowStream, StreamFactory};
use crate::monitor::parsers::{try_extract_sni, SniOutcome};
use crate::monitor::spawn_guarded;
use crate::monitor::types::{Direction, DiscoveredHostname, FlowKey};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Ordered bytes for one direction of a flow.
#[derive(Debug)]
pub struct Chunk {
    pub dir:   Direction,
    pub bytes: Vec<u8>,
}

pub struct SniStreamFactory {
    interface:      Arc<str>,
    dispatcher:     Dispatcher,
    logger:         SharedLogger,
    queue_capacity: usize,
}

impl SniStreamFactory {
    pub fn new(
        interface:      Arc<str>,
        dispatcher:     Dispatcher,
        logger:         SharedLogger,
        queue_capacity: usize,
    ) -> Self {
        Self { interface, dispatcher, logger, queue_capacity }
    }
}

/// Reassembler-side handle of a flow's parser task.
pub struct SniStream {
    tx: mpsc::Sender<Chunk>,
}

impl StreamFactory for SniStreamFactory {
    type Stream = SniStream;

    fn new_stream(&mut self, key: &FlowKey) -> SniStream {
        let (tx, rx) = mpsc::channel(self.queue_capacity.max(1));
        let task = format!("flow {} on {}", key, self.interface);
        spawn_guarded(
            task,
            self.logger.clone(),
            parse_flow(
                Arc::clone(&self.interface),
                *key,
                rx,
                self.dispatcher.clone(),
                self.logger.clone(),
            ),
        );
        SniStream { tx }
    }
}

impl FlowStream for SniStream {
    fn deliver(&mut self, dir: Direction, bytes: &[u8]) -> Delivery {
        match self.tx.try_send(Chunk { dir, bytes: bytes.to_vec() }) {
            Ok(()) => Delivery::Accepted,
            Err(TrySendError::Full(_)) => Delivery::Overloaded,
            Err(TrySendError::Closed(_)) => Delivery::Settled,
        }
    }
}

/// Accumulated bytes of one direction and whether it has been ruled out.
#[derive(Debug, Default)]
struct HelloBuffer {
    bytes:    Vec<u8>,
    rejected: bool,
}

impl HelloBuffer {
    fn push(&mut self, chunk: &[u8]) -> SniOutcome {
        if self.rejected {
            return SniOutcome::NotApplicable;
        }
        self.bytes.extend_from_slice(chunk);

        let outcome = match try_extract_sni(&self.bytes) {
            SniOutcome::NeedMoreData if self.bytes.len() >= MAX_HELLO_BYTES => SniOutcome::NotApplicable,
            other => other,
        };
        if outcome == SniOutcome::NotApplicable {
            self.rejected = true;
            self.bytes = Vec::new();
        }
        outcome
    }
}

/// Body of a flow's parser task.
///
/// Publishes at most one event, then returns; dropping `rx` tells the
/// reassembler the flow is settled.
pub async fn parse_flow(
    interface:  Arc<str>,
    flow:       FlowKey,
    mut rx:     mpsc::Receiver<Chunk>,
    dispatcher: Dispatcher,
    logger:     SharedLogger,
) {
    let mut halves: [HelloBuffer; 2] = Default::default();

    let outcome = loop {
        let Some(chunk) = rx.recv().await else {
            break "stream closed";
        };

        if let SniOutcome::Found(hostname) = halves[chunk.dir.index()].push(&chunk.bytes) {
            logger.log(&Event::SniParsed {
                interface: &interface,
                flow:      &flow.to_string(),
                sni:       &hostname,
            });
            dispatcher.publish(DiscoveredHostname {
                interface: interface.to_string(),
                hostname,
                discovered_at: Utc::now(),
            });
            break "sni found";
        }

        if halves.iter().all(|h| h.rejected) {
            break "not a client hello";
        }
    };

    logger.log(&Event::StreamEnded {
        interface: &interface,
        flow:      &flow.to_string(),
        outcome,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;
    use crate::monitor::parsers::fixtures::client_hello;
    use crate::monitor::types::SessionStats;
    use std::time::Duration;

    fn key() -> FlowKey {
        FlowKey::from_endpoints("192.168.1.5:50000".parse().unwrap(), "1.2.3.4:443".parse().unwrap()).0
    }

    #[test]
    fn hello_buffer_gives_up_after_rejection() {
        let mut buf = HelloBuffer::default();
        assert_eq!(buf.push(b"GET"), SniOutcome::NotApplicable);
        assert!(buf.rejected);
        assert!(buf.bytes.is_empty());
        assert_eq!(buf.push(&client_hello("x.test")), SniOutcome::NotApplicable);
    }

    #[tokio::test]
    async fn byte_by_byte_hello_yields_one_event() {
        let (dispatcher, mut events) = Dispatcher::new(8, Logger::stdout(), SessionStats::new());
        let (tx, rx) = mpsc::channel(4096);
        let task = tokio::spawn(parse_flow(Arc::from("eth0"), key(), rx, dispatcher, Logger::stdout()));

        let mut stream = client_hello("api.example.org");
        stream.extend_from_slice(&client_hello("again.example.org"));
        for byte in stream {
            // The task stops listening after the first hit.
            let _ = tx.send(Chunk { dir: Direction::AtoB, bytes: vec![byte] }).await;
        }
        drop(tx);
        task.await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.hostname, "api.example.org");
        assert_eq!(event.interface, "eth0");
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn directions_are_parsed_independently() {
        let (dispatcher, mut events) = Dispatcher::new(8, Logger::stdout(), SessionStats::new());
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(parse_flow(Arc::from("eth0"), key(), rx, dispatcher, Logger::stdout()));

        let hello = client_hello("split.test");
        let (head, tail) = hello.split_at(20);
        tx.send(Chunk { dir: Direction::AtoB, bytes: head.to_vec() }).await.unwrap();
        tx.send(Chunk { dir: Direction::BtoA, bytes: b"\x16\x03\x03\x00\x02\x02\x00".to_vec() }).await.unwrap();
        tx.send(Chunk { dir: Direction::AtoB, bytes: tail.to_vec() }).await.unwrap();

        assert_eq!(events.recv().await.unwrap().hostname, "split.test");
        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn non_tls_flow_ends_without_event() {
        let (dispatcher, mut events) = Dispatcher::new(8, Logger::stdout(), SessionStats::new());
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(parse_flow(Arc::from("eth0"), key(), rx, dispatcher, Logger::stdout()));

        tx.send(Chunk { dir: Direction::AtoB, bytes: b"SSH-2.0".to_vec() }).await.unwrap();
        tx.send(Chunk { dir: Direction::BtoA, bytes: b"SSH-2.0".to_vec() }).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(tx.is_closed());
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn full_queue_reports_overload() {
        let (dispatcher, _events) = Dispatcher::new(8, Logger::stdout(), SessionStats::new());
        let mut factory = SniStreamFactory::new(Arc::from("eth0"), dispatcher, Logger::stdout(), 1);
        let mut stream = factory.new_stream(&key());

        // The parser task has not run yet, so nothing drains the queue.
        assert_eq!(stream.deliver(Direction::AtoB, b"\x16"), Delivery::Accepted);
        assert_eq!(stream.deliver(Direction::AtoB, b"\x03"), Delivery::Overloaded);
    }

    #[tokio::test]
    async fn settled_consumer_reports_through_delivery() {
        let (dispatcher, _events) = Dispatcher::new(8, Logger::stdout(), SessionStats::new());
        let mut factory = SniStreamFactory::new(Arc::from("eth0"), dispatcher, Logger::stdout(), 4);
        let mut stream = factory.new_stream(&key());

        assert_eq!(stream.deliver(Direction::AtoB, b"no"), Delivery::Accepted);
        assert_eq!(stream.deliver(Direction::BtoA, b"no"), Delivery::Accepted);

        // Wait for the task to reject both directions and hang up.
        tokio::time::timeout(Duration::from_secs(5), stream.tx.closed()).await.unwrap();
        assert_eq!(stream.deliver(Direction::AtoB, b"more"), Delivery::Settled);
    }
}
