use thiserror::Error;

/// Interface listing failed. Without interfaces there is nothing to capture.
#[derive(Debug, Error)]
#[error("interface enumeration failed: {0}")]
pub struct EnumerationError(#[from] pub pcap::Error);

/// A single capture source could not be brought up. Siblings are unaffected.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot open interface '{interface}': {source}")]
    Open {
        interface: String,
        #[source]
        source:    pcap::Error,
    },

    #[error("cannot apply filter on '{interface}': {source}")]
    Filter {
        interface: String,
        #[source]
        source:    pcap::Error,
    },

    #[error("cannot read capture file '{path}': {source}")]
    Replay {
        path:   String,
        #[source]
        source: pcap::Error,
    },

    #[error("unsupported link type {linktype} on '{interface}'")]
    UnsupportedLink { interface: String, linktype: i32 },

    #[error("cannot start reader for '{interface}': {source}")]
    Reader {
        interface: String,
        #[source]
        source:    std::io::Error,
    },
}

/// Startup failures that stop monitoring as a whole.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Enumeration(#[from] EnumerationError),

    #[error("no capture source could be opened")]
    NoSources,
}
