//! TCP stream reassembly.
//!
//! One [`Reassembler`] per capture session turns decoded segments into
//! ordered per-direction byte streams. Each flow gets a consumer from a
//! [`StreamFactory`] the first time its key is seen; only newly contiguous
//! bytes are handed to it, so the consumer never sees a gap, a duplicate or
//! a reordering.
//!
//! Out-of-order segments are held as pages. Pages are bounded per
//! connection direction and globally through a shared [`PageBudget`]. When
//! either bound is hit the oldest-arrived page of the affected direction is
//! dropped; if that direction holds nothing, the incoming segment is.

use crate::logger::{Event, SharedLogger};
use crate::monitor::config::{Limits, MAX_SEQ_AHEAD};
use crate::monitor::types::{Direction, FlowKey, SessionStats, SharedStats, TcpSegment};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// What a consumer did with a delivered chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// The consumer is finished with this flow; stop feeding it.
    Settled,
    /// The consumer could not take the chunk. The flow is given up.
    Overloaded,
}

/// Per-flow consumer of reassembled bytes.
pub trait FlowStream {
    fn deliver(&mut self, dir: Direction, bytes: &[u8]) -> Delivery;
}

/// Creates a consumer for each newly seen flow.
pub trait StreamFactory {
    type Stream: FlowStream;
    fn new_stream(&mut self, key: &FlowKey) -> Self::Stream;
}

/// Global cap on held out-of-order pages, shared by every reassembler.
#[derive(Debug, Clone)]
pub struct PageBudget {
    used:  Arc<AtomicUsize>,
    limit: usize,
}

impl PageBudget {
    pub fn new(limit: usize) -> Self {
        Self { used: Arc::new(AtomicUsize::new(0)), limit }
    }

    fn try_acquire(&self) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.limit).then_some(n + 1))
            .is_ok()
    }

    fn release(&self, n: usize) {
        if n > 0 {
            self.used.fetch_sub(n, Ordering::AcqRel);
        }
    }

    pub fn in_use(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

/// An out-of-order segment waiting for the gap before it to fill.
#[derive(Debug)]
struct Page {
    seq:   u32,
    bytes: Vec<u8>,
}

/// Sequence tracking for one direction of a flow.
#[derive(Debug, Default)]
pub(super) struct HalfStream {
    next_seq: Option<u32>,
    held:     VecDeque<Page>,
    fin_at:   Option<u32>,
    closed:   bool,
}

/// Reassembly state of one flow. `stream` is `None` once the consumer has
/// settled; the key stays tracked so no second consumer is spawned.
pub(super) struct FlowState<S> {
    pub(super) stream:    Option<S>,
    pub(super) halves:    [HalfStream; 2],
    pub(super) last_seen: SystemTime,
}

impl<S> FlowState<S> {
    pub(super) fn held_pages(&self) -> usize {
        self.halves.iter().map(|h| h.held.len()).sum()
    }

    fn clear_held(&mut self) -> usize {
        self.halves.iter_mut().map(|h| std::mem::take(&mut h.held).len()).sum()
    }

    fn is_finished(&self) -> bool {
        self.halves.iter().all(|h| h.closed)
    }
}

/// Signed distance from `next` to `seq` in sequence space.
fn seq_offset(seq: u32, next: u32) -> i32 {
    seq.wrapping_sub(next) as i32
}

/// Context every flow needs but none owns.
pub(super) struct Shared {
    pub(super) interface:          Arc<str>,
    pub(super) logger:             SharedLogger,
    pub(super) stats:              SharedStats,
    pub(super) budget:             PageBudget,
    pub(super) max_pages_per_conn: usize,
}

/// Groups segments by flow and feeds ordered bytes to per-flow consumers.
pub struct Reassembler<F: StreamFactory> {
    factory:          F,
    pub(super) flows: HashMap<FlowKey, FlowState<F::Stream>>,
    pub(super) shared: Shared,
    max_flows:        usize,
}

impl<F: StreamFactory> Reassembler<F> {
    pub fn new(
        factory:   F,
        budget:    PageBudget,
        limits:    &Limits,
        interface: Arc<str>,
        logger:    SharedLogger,
        stats:     SharedStats,
    ) -> Self {
        Self {
            factory,
            flows: HashMap::new(),
            shared: Shared {
                interface,
                logger,
                stats,
                budget,
                max_pages_per_conn: limits.max_pages_per_conn,
            },
            max_flows: limits.max_flows,
        }
    }

    /// Number of flows currently tracked.
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Out-of-order pages currently held by this reassembler.
    pub fn held_pages(&self) -> usize {
        self.flows.values().map(FlowState::held_pages).sum()
    }

    /// Merges one segment into its flow.
    ///
    /// A flow is created by a SYN or by the first segment carrying payload;
    /// bare ACKs and resets for unknown flows are ignored. RST, or FIN
    /// reached in both directions, finalizes the flow.
    pub fn assemble(&mut self, seg: TcpSegment) {
        let (key, dir) = FlowKey::from_endpoints(seg.src, seg.dst);

        if !self.flows.contains_key(&key) {
            if seg.rst || (!seg.syn && seg.payload.is_empty()) {
                return;
            }
            if self.flows.len() >= self.max_flows && !self.reclaim_settled() {
                SessionStats::bump(&self.shared.stats.flows_ignored);
                return;
            }
        }

        let flow = match self.flows.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                SessionStats::bump(&self.shared.stats.total_flows_tracked);
                self.shared.logger.log(&Event::StreamStarted {
                    interface: &self.shared.interface,
                    flow:      &key.to_string(),
                });
                let stream = self.factory.new_stream(&key);
                e.insert(FlowState {
                    stream:    Some(stream),
                    halves:    Default::default(),
                    last_seen: seg.captured_at,
                })
            }
        };

        flow.last_seen = flow.last_seen.max(seg.captured_at);

        if seg.rst {
            self.finalize(&key);
            return;
        }

        absorb(flow, &key, dir, seg, &self.shared);

        if flow.is_finished() {
            self.finalize(&key);
        }
    }

    /// Frees a table slot held by the least recently active settled flow.
    ///
    /// Settled flows carry no consumer and no pages, so they are the first
    /// to go when the table is full. Returns `false` if every tracked flow
    /// is still being parsed.
    fn reclaim_settled(&mut self) -> bool {
        let oldest = self
            .flows
            .iter()
            .filter(|(_, flow)| flow.stream.is_none())
            .min_by_key(|(_, flow)| flow.last_seen)
            .map(|(key, _)| *key);

        match oldest {
            Some(key) => {
                self.finalize(&key);
                SessionStats::bump(&self.shared.stats.flows_evicted);
                true
            }
            None => false,
        }
    }

    /// Drops a flow, returning its pages to the budget and closing its
    /// consumer.
    pub(super) fn finalize(&mut self, key: &FlowKey) {
        if let Some(mut flow) = self.flows.remove(key) {
            self.shared.budget.release(flow.clear_held());
        }
    }
}

impl<F: StreamFactory> Drop for Reassembler<F> {
    fn drop(&mut self) {
        let held: usize = self.flows.values_mut().map(FlowState::clear_held).sum();
        self.shared.budget.release(held);
    }
}

/// Applies one segment to one direction of a flow.
fn absorb<S: FlowStream>(
    flow:   &mut FlowState<S>,
    key:    &FlowKey,
    dir:    Direction,
    seg:    TcpSegment,
    shared: &Shared,
) {
    let payload_seq = if seg.syn { seg.seq.wrapping_add(1) } else { seg.seq };

    let Some(stream) = flow.stream.as_mut() else {
        // Settled: only watch for the connection to close.
        if seg.fin {
            flow.halves[dir.index()].closed = true;
        }
        return;
    };

    let half = &mut flow.halves[dir.index()];
    if half.closed {
        return;
    }
    if half.next_seq.is_none() && (seg.syn || !seg.payload.is_empty()) {
        half.next_seq = Some(payload_seq);
    }
    if seg.fin {
        half.fin_at = Some(payload_seq.wrapping_add(seg.payload.len() as u32));
    }
    let Some(next) = half.next_seq else { return };

    let mut delivery = Delivery::Accepted;
    if !seg.payload.is_empty() {
        let offset = seq_offset(payload_seq, next);
        if offset > 0 {
            if offset as u32 <= MAX_SEQ_AHEAD {
                let page = Page { seq: payload_seq, bytes: seg.payload };
                if hold(half, page, shared) {
                    SessionStats::bump(&shared.stats.segments_overflowed);
                    shared.logger.log(&Event::ReassemblyOverflow {
                        interface: &shared.interface,
                        flow:      &key.to_string(),
                    });
                }
            } else {
                SessionStats::bump(&shared.stats.segments_discarded);
            }
        } else {
            delivery = push_contiguous(half, stream, dir, payload_seq, &seg.payload);
        }
    }
    if delivery == Delivery::Accepted {
        delivery = drain(half, stream, dir, &shared.budget);
    }

    if let (Some(fin), Some(next)) = (half.fin_at, half.next_seq) {
        if fin == next {
            half.closed = true;
            shared.budget.release(std::mem::take(&mut half.held).len());
        }
    }

    match delivery {
        Delivery::Accepted => {}
        Delivery::Settled | Delivery::Overloaded => {
            if delivery == Delivery::Overloaded {
                SessionStats::bump(&shared.stats.segments_overflowed);
                shared.logger.log(&Event::ReassemblyOverflow {
                    interface: &shared.interface,
                    flow:      &key.to_string(),
                });
            }
            flow.stream = None;
            shared.budget.release(flow.clear_held());
        }
    }
}

/// Delivers the part of `bytes` (starting at `seq`, at or before the
/// expected sequence number) that extends the stream.
fn push_contiguous<S: FlowStream>(
    half:   &mut HalfStream,
    stream: &mut S,
    dir:    Direction,
    seq:    u32,
    bytes:  &[u8],
) -> Delivery {
    let next = half.next_seq.unwrap_or(seq);
    let behind = next.wrapping_sub(seq) as usize;
    if behind >= bytes.len() {
        return Delivery::Accepted;
    }
    let fresh = &bytes[behind..];
    half.next_seq = Some(next.wrapping_add(fresh.len() as u32));
    stream.deliver(dir, fresh)
}

/// Flushes held pages that have become contiguous.
fn drain<S: FlowStream>(
    half:   &mut HalfStream,
    stream: &mut S,
    dir:    Direction,
    budget: &PageBudget,
) -> Delivery {
    while let Some(next) = half.next_seq {
        let Some(idx) = half.held.iter().position(|p| seq_offset(p.seq, next) <= 0) else {
            break;
        };
        let Some(page) = half.held.remove(idx) else { break };
        budget.release(1);

        let delivery = push_contiguous(half, stream, dir, page.seq, &page.bytes);
        if delivery != Delivery::Accepted {
            return delivery;
        }
    }
    Delivery::Accepted
}

/// Holds an out-of-order page. Returns `true` if anything was dropped to
/// stay within the per-connection or global bound.
fn hold(half: &mut HalfStream, page: Page, shared: &Shared) -> bool {
    if shared.max_pages_per_conn == 0 {
        return true;
    }
    if half
        .held
        .iter()
        .any(|p| p.seq == page.seq && p.bytes.len() >= page.bytes.len())
    {
        return false;
    }

    let mut dropped = false;
    if half.held.len() >= shared.max_pages_per_conn {
        if half.held.pop_front().is_some() {
            shared.budget.release(1);
        }
        dropped = true;
    }

    if !shared.budget.try_acquire() {
        dropped = true;
        // Reuse the oldest page's slot, or give up on the newcomer.
        if half.held.pop_front().is_none() {
            return dropped;
        }
    }

    half.held.push_back(page);
    dropped
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::logger::Logger;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::time::{Duration, UNIX_EPOCH};

    /// Bytes delivered to one consumer instance, per direction.
    pub type Delivered = Arc<Mutex<Vec<(FlowKey, [Vec<u8>; 2])>>>;

    #[derive(Clone, Default)]
    pub struct Recorder {
        pub delivered:    Delivered,
        /// Consumers settle after receiving this many bytes in total.
        pub settle_after: Option<usize>,
        /// Report `Overloaded` instead of `Settled` at that point.
        pub overload:     bool,
    }

    pub struct RecordingStream {
        id:           usize,
        seen:         usize,
        settle_after: Option<usize>,
        overload:     bool,
        delivered:    Delivered,
    }

    impl StreamFactory for Recorder {
        type Stream = RecordingStream;

        fn new_stream(&mut self, key: &FlowKey) -> RecordingStream {
            let mut all = self.delivered.lock().unwrap();
            all.push((*key, [Vec::new(), Vec::new()]));
            RecordingStream {
                id:           all.len() - 1,
                seen:         0,
                settle_after: self.settle_after,
                overload:     self.overload,
                delivered:    Arc::clone(&self.delivered),
            }
        }
    }

    impl FlowStream for RecordingStream {
        fn deliver(&mut self, dir: Direction, bytes: &[u8]) -> Delivery {
            self.delivered.lock().unwrap()[self.id].1[dir.index()].extend_from_slice(bytes);
            self.seen += bytes.len();
            match self.settle_after {
                Some(n) if self.seen >= n && self.overload => Delivery::Overloaded,
                Some(n) if self.seen >= n => Delivery::Settled,
                _ => Delivery::Accepted,
            }
        }
    }

    pub fn reassembler(recorder: Recorder, budget: PageBudget, per_conn: usize) -> Reassembler<Recorder> {
        let limits = Limits { max_pages_per_conn: per_conn, ..Limits::default() };
        Reassembler::new(recorder, budget, &limits, Arc::from("eth0"), Logger::stdout(), SessionStats::new())
    }

    pub fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    pub fn data(src: &str, dst: &str, seq: u32, payload: &[u8]) -> TcpSegment {
        TcpSegment {
            src:         src.parse::<SocketAddr>().unwrap(),
            dst:         dst.parse::<SocketAddr>().unwrap(),
            seq,
            syn:         false,
            fin:         false,
            rst:         false,
            payload:     payload.to_vec(),
            captured_at: at(1_000),
        }
    }

    pub fn syn(src: &str, dst: &str, seq: u32) -> TcpSegment {
        TcpSegment { syn: true, ..data(src, dst, seq, b"") }
    }
}
