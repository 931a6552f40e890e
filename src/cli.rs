use clap::Parser;
use snitap::monitor::config::Limits;
use std::time::Duration;

/// snitap — passive TLS SNI hostname discovery.
///
/// Captures TCP port 443 traffic on every physical interface, reassembles
/// each connection and reports the hostname from its TLS ClientHello.
#[derive(Parser, Debug, Clone)]
#[command(
    name    = "snitap",
    version = "0.1.0",
    about   = "Passive TLS SNI hostname discovery",
    long_about = None,
)]
pub struct Cli {
    // ── Interface ────────────────────────────────────────────────────────────

    /// Capture only on this interface.
    ///
    /// If omitted, snitap captures on every interface that is not loopback,
    /// not virtual (docker, veth, vmnet, ...) and has an address.
    #[arg(short = 'i', long = "interface", value_name = "IFACE")]
    pub interface: Option<String>,

    // ── PCAP Replay ──────────────────────────────────────────────────────────

    /// Read packets from a saved PCAP file instead of a live interface.
    ///
    /// The `tcp port 443` filter still applies and the file is read to the
    /// end. Flow expiry follows packet timestamps rather than the wall clock.
    #[arg(short = 'r', long = "read", value_name = "FILE")]
    pub pcap_file: Option<String>,

    // ── Logging ──────────────────────────────────────────────────────────────

    /// Write log output to this file in addition to stdout.
    ///
    /// The file is created if it does not exist and appended to if it does.
    /// JSON mode (--json) affects the format written to this file as well.
    #[arg(short = 'o', long = "log-file", value_name = "PATH")]
    pub log_file: Option<String>,

    /// Emit log entries as newline-delimited JSON (NDJSON).
    #[arg(short = 'j', long = "json")]
    pub json: bool,

    /// Also log per-flow events (stream start/end, parsed SNI).
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    // ── Limits (overrides config.rs defaults) ────────────────────────────────

    /// How often (in seconds) each interface runs the idle-flow sweep.
    #[arg(long = "evict-interval", value_name = "SECS", default_value_t = 60)]
    pub evict_interval: u64,

    /// Seconds without traffic after which a flow is dropped.
    #[arg(long = "stream-expiry", value_name = "SECS", default_value_t = 60)]
    pub stream_expiry: u64,

    /// Out-of-order segments held per connection direction.
    #[arg(long = "max-pages-per-conn", value_name = "N", default_value_t = 100)]
    pub max_pages_per_conn: usize,

    /// Out-of-order segments held across all connections.
    #[arg(long = "max-pages-total", value_name = "N", default_value_t = 1000)]
    pub max_pages_total: usize,
}

impl Cli {
    pub fn limits(&self) -> Limits {
        Limits {
            max_pages_per_conn: self.max_pages_per_conn,
            max_pages_total:    self.max_pages_total,
            stream_expiry:      Duration::from_secs(self.stream_expiry),
            evict_interval:     Duration::from_secs(self.evict_interval.max(1)),
            ..Limits::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library_limits() {
        let cli = Cli::parse_from(["snitap"]);
        let limits = cli.limits();
        let defaults = Limits::default();
        assert_eq!(limits.max_pages_per_conn, defaults.max_pages_per_conn);
        assert_eq!(limits.max_pages_total, defaults.max_pages_total);
        assert_eq!(limits.stream_expiry, defaults.stream_expiry);
        assert_eq!(limits.evict_interval, defaults.evict_interval);
    }

    #[test]
    fn flags_override_limits() {
        let cli = Cli::parse_from(["snitap", "-r", "trace.pcap", "--stream-expiry", "5", "--max-pages-total", "10"]);
        assert_eq!(cli.pcap_file.as_deref(), Some("trace.pcap"));
        assert_eq!(cli.limits().stream_expiry, Duration::from_secs(5));
        assert_eq!(cli.limits().max_pages_total, 10);
    }
}
