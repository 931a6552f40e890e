use std::time::Duration;

/// Bytes captured per packet.
///
/// 1600 covers a full Ethernet MTU plus link headers; anything beyond is
/// truncated by libpcap before it reaches the pump.
pub const SNAPLEN: i32 = 1600;

/// Capture filter applied to every session at open time.
pub const CAPTURE_FILTER: &str = "tcp port 443";

/// Idle time after which a flow is finalized by the eviction sweep.
///
/// A ClientHello is the first thing a TLS client sends, so a flow that has
/// been quiet for a minute without producing one is not going to.
pub const STREAM_EXPIRY: Duration = Duration::from_secs(60);

/// How often each pump runs the eviction sweep.
pub const EVICT_INTERVAL: Duration = Duration::from_secs(60);

/// Out-of-order segments held per connection direction.
pub const MAX_PAGES_PER_CONN: usize = 100;

/// Out-of-order segments held across every flow on every interface.
pub const MAX_PAGES_TOTAL: usize = 1000;

/// Pending Discovered Hostname Events before the oldest is dropped.
pub const DISPATCH_CAPACITY: usize = 1024;

/// Ordered chunks queued from the reassembler to one flow's parser task.
pub const FLOW_QUEUE_CAPACITY: usize = 128;

/// Raw frames queued from a capture reader thread to its pump.
pub const FRAME_QUEUE_CAPACITY: usize = 4096;

/// Flows tracked per interface before new connections are ignored.
pub const MAX_FLOWS: usize = 16_384;

/// Segments starting further than this past the expected sequence number
/// cannot be placed in the stream and are discarded.
pub const MAX_SEQ_AHEAD: u32 = 1 << 20;

/// Largest TLS record a ClientHello can occupy (header + 2^16 - 1 body).
pub const MAX_HELLO_BYTES: usize = 5 + u16::MAX as usize;

/// Runtime-tunable subset of the limits above.
///
/// Built from CLI flags by the binary; embedders use [`Limits::default`].
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_pages_per_conn: usize,
    pub max_pages_total:    usize,
    pub stream_expiry:      Duration,
    pub evict_interval:     Duration,
    pub max_flows:          usize,
    pub dispatch_capacity:  usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_pages_per_conn: MAX_PAGES_PER_CONN,
            max_pages_total:    MAX_PAGES_TOTAL,
            stream_expiry:      STREAM_EXPIRY,
            evict_interval:     EVICT_INTERVAL,
            max_flows:          MAX_FLOWS,
            dispatch_capacity:  DISPATCH_CAPACITY,
        }
    }
}
