use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;

/// Direction-agnostic identity of one observed TCP connection.
///
/// The key is normalised so the smaller endpoint occupies `a`, which makes
/// packets from both directions of a connection land on the same entry.
#[derive(Hash, Eq, PartialEq, Debug, Clone, Copy)]
pub struct FlowKey {
    pub a: SocketAddr,
    pub b: SocketAddr,
}

/// Which half of a [`FlowKey`] a segment travels along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    AtoB,
    BtoA,
}

impl FlowKey {
    /// Builds the canonical key for a segment sent from `src` to `dst` and
    /// reports which direction that segment travels relative to the key.
    pub fn from_endpoints(src: SocketAddr, dst: SocketAddr) -> (Self, Direction) {
        if src <= dst {
            (Self { a: src, b: dst }, Direction::AtoB)
        } else {
            (Self { a: dst, b: src }, Direction::BtoA)
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.a, self.b)
    }
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::AtoB => 0,
            Direction::BtoA => 1,
        }
    }
}

/// One raw frame as handed over by a capture reader.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data:        Vec<u8>,
    pub captured_at: SystemTime,
}

/// A decoded TCP segment, ready for reassembly.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src:         SocketAddr,
    pub dst:         SocketAddr,
    pub seq:         u32,
    pub syn:         bool,
    pub fin:         bool,
    pub rst:         bool,
    pub payload:     Vec<u8>,
    pub captured_at: SystemTime,
}

/// A hostname pulled out of a ClientHello, tagged with where it was seen.
///
/// At most one of these is produced per flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredHostname {
    pub interface:     String,
    pub hostname:      String,
    pub discovered_at: DateTime<Utc>,
}

/// Receiving half of the process-wide shutdown signal. `true` means stop.
pub type Shutdown = watch::Receiver<bool>;

/// Running totals for the session summary.
///
/// Every counter only ever increases; they are shared between the pumps,
/// the flow tasks and the dispatcher without locking.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub frames_captured:      AtomicU64,
    pub frames_dropped:       AtomicU64,
    pub tcp_segments:         AtomicU64,
    /// Frames with no IP layer, no TCP header, or a link header that does
    /// not decode.
    pub frames_undecodable:   AtomicU64,
    pub total_flows_tracked:  AtomicU64,
    pub flows_evicted:        AtomicU64,
    pub segments_overflowed:  AtomicU64,
    /// Segments too far ahead of the stream to be placed.
    pub segments_discarded:   AtomicU64,
    pub flows_ignored:        AtomicU64,
    pub hostnames_discovered: AtomicU64,
    pub events_lost:          AtomicU64,
}

pub type SharedStats = Arc<SessionStats>;

impl SessionStats {
    pub fn new() -> SharedStats {
        Arc::new(Self::default())
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
