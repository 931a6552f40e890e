//! Capture sessions: packet sources, link-layer decoding and the per-interface
//! pump.
//!
//! A libpcap handle blocks on every read, so it lives on a dedicated reader
//! thread that owns it until its loop exits. The reader hands frames to an
//! async pump over a bounded channel; the pump decodes them, feeds the
//! [`Reassembler`], and runs the eviction sweep on a ticker.

use crate::logger::{Event, SharedLogger};
use crate::monitor::config::{Limits, CAPTURE_FILTER, SNAPLEN};
use crate::monitor::error::CaptureError;
use crate::monitor::eviction::{eviction_ticker, expiry_cutoff};
use crate::monitor::flow::{Reassembler, StreamFactory};
use crate::monitor::types::{Frame, SessionStats, SharedStats, Shutdown, TcpSegment};
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use pcap::{Activated, Active, Capture, Linktype, Offline, PacketHeader};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::{self, error::TrySendError};

// ── Link layer ───────────────────────────────────────────────────────────────

/// Link-layer framings the decoder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    /// Bare IPv4 or IPv6 packets.
    RawIp,
    /// Linux cooked capture (`any` device).
    LinuxSll,
    /// BSD loopback: 4-byte address family, then IP.
    Null,
}

impl LinkKind {
    pub fn from_linktype(linktype: Linktype) -> Option<Self> {
        match linktype.0 {
            1 => Some(LinkKind::Ethernet),
            12 | 14 | 101 | 228 | 229 => Some(LinkKind::RawIp),
            113 => Some(LinkKind::LinuxSll),
            0 | 108 => Some(LinkKind::Null),
            _ => None,
        }
    }
}

const SLL_HEADER_LEN: usize = 16;
const NULL_HEADER_LEN: usize = 4;
const ETHERTYPE_IPV4: [u8; 2] = [0x08, 0x00];
const ETHERTYPE_IPV6: [u8; 2] = [0x86, 0xdd];

/// Decodes one frame down to its TCP segment.
///
/// Returns `None` for anything without an IP layer or without a TCP header;
/// such frames are dropped silently.
pub fn decode_frame(link: LinkKind, frame: &Frame) -> Option<TcpSegment> {
    let data = frame.data.as_slice();
    let sliced = match link {
        LinkKind::Ethernet => SlicedPacket::from_ethernet(data),
        LinkKind::RawIp => SlicedPacket::from_ip(data),
        LinkKind::LinuxSll => {
            let protocol = data.get(14..SLL_HEADER_LEN)?;
            if protocol != ETHERTYPE_IPV4 && protocol != ETHERTYPE_IPV6 {
                return None;
            }
            SlicedPacket::from_ip(&data[SLL_HEADER_LEN..])
        }
        LinkKind::Null => SlicedPacket::from_ip(data.get(NULL_HEADER_LEN..)?),
    }
    .ok()?;

    // A zero length field (segmentation offload, jumbograms) leaves the
    // packet unbounded; otherwise it marks where the IP packet ends.
    let (src_ip, dst_ip, ip_end): (IpAddr, IpAddr, Option<usize>) = match &sliced.ip {
        Some(InternetSlice::Ipv4(h, _)) => (
            h.source_addr().into(),
            h.destination_addr().into(),
            (h.total_len() > 0).then(|| offset_in(data, h.slice()) + usize::from(h.total_len())),
        ),
        Some(InternetSlice::Ipv6(h, _)) => (
            h.source_addr().into(),
            h.destination_addr().into(),
            (h.payload_length() > 0).then(|| {
                offset_in(data, h.slice()) + h.slice().len() + usize::from(h.payload_length())
            }),
        ),
        None => return None,
    };

    let Some(TransportSlice::Tcp(tcp)) = &sliced.transport else {
        return None;
    };

    // Link-layer padding and trailers follow the IP packet and are not
    // part of the segment.
    let payload = match ip_end {
        Some(end) => {
            let keep = end.saturating_sub(offset_in(data, sliced.payload));
            sliced.payload.get(..keep).unwrap_or(sliced.payload)
        }
        None => sliced.payload,
    };

    Some(TcpSegment {
        src:         SocketAddr::new(src_ip, tcp.source_port()),
        dst:         SocketAddr::new(dst_ip, tcp.destination_port()),
        seq:         tcp.sequence_number(),
        syn:         tcp.syn(),
        fin:         tcp.fin(),
        rst:         tcp.rst(),
        payload:     payload.to_vec(),
        captured_at: frame.captured_at,
    })
}

/// Byte offset of `inner` within `outer`, where `inner` was sliced from it.
fn offset_in(outer: &[u8], inner: &[u8]) -> usize {
    (inner.as_ptr() as usize).saturating_sub(outer.as_ptr() as usize)
}

// ── Packet sources ───────────────────────────────────────────────────────────

/// Anything that yields raw frames of one link type.
pub trait PacketSource: Send {
    fn link_kind(&self) -> LinkKind;

    /// Live sources may drop frames when the pump falls behind; offline
    /// sources are read completely.
    fn is_live(&self) -> bool;

    /// Blocks until the next frame. `None` means the source is exhausted or
    /// closed and will not produce more.
    fn next_frame(&mut self) -> Option<Frame>;
}

/// A libpcap handle, live or offline.
pub struct PcapSource<T: Activated> {
    cap:  Capture<T>,
    link: LinkKind,
    live: bool,
}

impl<T: Activated> PcapSource<T> {
    fn new(cap: Capture<T>, label: &str, live: bool) -> Result<Self, CaptureError> {
        let linktype = cap.get_datalink();
        let link = LinkKind::from_linktype(linktype).ok_or_else(|| CaptureError::UnsupportedLink {
            interface: label.to_string(),
            linktype:  linktype.0,
        })?;
        Ok(Self { cap, link, live })
    }
}

impl<T: Activated> PacketSource for PcapSource<T>
where
    Capture<T>: Send,
{
    fn link_kind(&self) -> LinkKind {
        self.link
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.cap.next_packet() {
                Ok(pkt) => {
                    return Some(Frame {
                        data:        pkt.data.to_vec(),
                        captured_at: timestamp(pkt.header),
                    })
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(_) => return None,
            }
        }
    }
}

fn timestamp(header: &PacketHeader) -> SystemTime {
    let secs = u64::try_from(header.ts.tv_sec).unwrap_or(0);
    let micros = u64::try_from(header.ts.tv_usec).unwrap_or(0);
    UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_micros(micros)
}

/// Opens a promiscuous live capture on `interface` with the port 443 filter.
///
/// Reads block until a packet arrives; there is no read timeout.
pub fn open_live(interface: &str) -> Result<PcapSource<Active>, CaptureError> {
    let open_err = |source| CaptureError::Open { interface: interface.to_string(), source };

    let mut cap = Capture::from_device(interface)
        .map_err(open_err)?
        .promisc(true)
        .snaplen(SNAPLEN)
        .timeout(0)
        .immediate_mode(true)
        .open()
        .map_err(open_err)?;

    cap.filter(CAPTURE_FILTER, true).map_err(|source| CaptureError::Filter {
        interface: interface.to_string(),
        source,
    })?;

    PcapSource::new(cap, interface, true)
}

/// Opens a saved capture for replay, with the same filter as live capture.
pub fn open_file(path: &str) -> Result<PcapSource<Offline>, CaptureError> {
    let mut cap = Capture::from_file(path).map_err(|source| CaptureError::Replay {
        path: path.to_string(),
        source,
    })?;

    cap.filter(CAPTURE_FILTER, true).map_err(|source| CaptureError::Filter {
        interface: path.to_string(),
        source,
    })?;

    PcapSource::new(cap, path, false)
}

// ── Reader thread ────────────────────────────────────────────────────────────

/// Moves `source` onto its own thread and forwards frames into `tx`.
///
/// The thread stops when the source is exhausted or the pump has gone away,
/// and drops the source (closing the capture handle) only then.
pub fn spawn_reader(
    interface:  &str,
    mut source: Box<dyn PacketSource>,
    tx:         mpsc::Sender<Frame>,
    stats:      SharedStats,
) -> Result<JoinHandle<()>, CaptureError> {
    thread::Builder::new()
        .name(format!("capture-{}", interface))
        .spawn(move || {
            let live = source.is_live();
            while let Some(frame) = source.next_frame() {
                SessionStats::bump(&stats.frames_captured);
                if live {
                    match tx.try_send(frame) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => SessionStats::bump(&stats.frames_dropped),
                        Err(TrySendError::Closed(_)) => break,
                    }
                } else if tx.blocking_send(frame).is_err() {
                    break;
                }
            }
            drop(source);
        })
        .map_err(|source| CaptureError::Reader { interface: interface.to_string(), source })
}

// ── Pump ─────────────────────────────────────────────────────────────────────

/// Per-interface packet pump.
///
/// Waits on the next frame, the eviction tick, or shutdown. Live sources age
/// flows against the wall clock; offline sources against the latest capture
/// timestamp seen, so a replay evicts as the original traffic would have.
/// On exit every remaining flow is finalized, closing the flow consumers
/// rooted here.
pub async fn run_pump<F: StreamFactory>(
    interface:       Arc<str>,
    link:            LinkKind,
    live:            bool,
    mut frames:      mpsc::Receiver<Frame>,
    mut reassembler: Reassembler<F>,
    limits:          Limits,
    mut shutdown:    Shutdown,
    logger:          SharedLogger,
    stats:           SharedStats,
) {
    let mut ticker = eviction_ticker(limits.evict_interval);
    let mut capture_clock = UNIX_EPOCH;

    if !*shutdown.borrow() {
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    capture_clock = capture_clock.max(frame.captured_at);
                    match decode_frame(link, &frame) {
                        Some(segment) => {
                            SessionStats::bump(&stats.tcp_segments);
                            reassembler.assemble(segment);
                        }
                        None => SessionStats::bump(&stats.frames_undecodable),
                    }
                }
                _ = ticker.tick() => {
                    let now = if live { SystemTime::now() } else { capture_clock };
                    let count = reassembler.flush_older_than(expiry_cutoff(now, limits.stream_expiry));
                    if count > 0 {
                        logger.log(&Event::FlowsEvicted { interface: &interface, count });
                    }
                }
                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    reassembler.flush_all();
    logger.log(&Event::CaptureEnded { interface: &interface });
}

#[cfg(test)]
pub(crate) mod frames {
    use super::*;
    use etherparse::PacketBuilder;

    pub const CLIENT_IP: [u8; 4] = [192, 168, 1, 5];
    pub const SERVER_IP: [u8; 4] = [93, 184, 216, 34];

    /// Ethernet/IPv4/TCP frame from the client port to server port 443.
    pub fn ethernet_tcp(client_port: u16, seq: u32, syn: bool, payload: &[u8], secs: u64) -> Frame {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4(CLIENT_IP, SERVER_IP, 64)
            .tcp(client_port, 443, seq, 64_240);
        let builder = if syn { builder.syn() } else { builder.ack(1).psh() };
        let mut data = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut data, payload).unwrap();
        Frame { data, captured_at: UNIX_EPOCH + Duration::from_secs(secs) }
    }

    /// Bare IPv4/TCP packet with no link header.
    pub fn raw_ipv4_tcp(seq: u32, payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ipv4(CLIENT_IP, SERVER_IP, 64).tcp(50_000, 443, seq, 64_240).ack(1);
        let mut data = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut data, payload).unwrap();
        data
    }
}
