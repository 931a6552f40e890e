//! Structured logging for snitap.
//!
//! Provides a [`Logger`] that writes events to stdout and optionally to a log
//! file. Output can be formatted as human-readable plain text or as
//! newline-delimited JSON (NDJSON) for log shippers.
//!
//! Per-flow events are noisy on a busy link; they are only written when the
//! logger was built with `verbose` set.

use chrono::Local;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex};

// ── Event types ──────────────────────────────────────────────────────────────

/// All distinct event kinds that snitap can emit.
///
/// `#[serde(tag = "event")]` puts an `"event"` key in JSON output so
/// consumers can filter by type without inspecting structure.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event<'a> {
    /// Informational startup / status message.
    Info { message: &'a str },

    /// An interface passed selection and will be captured on.
    InterfaceSelected {
        interface:   &'a str,
        description: &'a str,
        addresses:   usize,
    },

    /// A capture source is live and filtered.
    CaptureOpened { interface: &'a str, filter: &'a str },

    /// A capture source could not be brought up; it is skipped.
    CaptureFailed { interface: &'a str, error: &'a str },

    /// A capture source stopped delivering packets.
    CaptureEnded { interface: &'a str },

    /// First segment of a new flow was seen.
    StreamStarted { interface: &'a str, flow: &'a str },

    /// A flow's parser task finished.
    StreamEnded {
        interface: &'a str,
        flow:      &'a str,
        outcome:   &'a str,
    },

    /// A flow's parser found an SNI host_name.
    SniParsed {
        interface: &'a str,
        flow:      &'a str,
        sni:       &'a str,
    },

    /// A hostname reached the external sink.
    Discovered { interface: &'a str, hostname: &'a str },

    /// The eviction sweep finalized idle flows.
    FlowsEvicted { interface: &'a str, count: usize },

    /// Held out-of-order data was discarded to stay within budget.
    ReassemblyOverflow { interface: &'a str, flow: &'a str },

    /// A slow consumer missed events that were overwritten.
    DispatchLagged { skipped: u64 },

    /// A spawned task panicked; siblings keep running.
    TaskPanicked { task: &'a str, message: &'a str },

    /// Session summary emitted on shutdown.
    SessionSummary {
        duration_secs:        u64,
        frames_captured:      u64,
        frames_dropped:       u64,
        tcp_segments:         u64,
        frames_undecodable:   u64,
        flows_tracked:        u64,
        flows_evicted:        u64,
        flows_ignored:        u64,
        segments_overflowed:  u64,
        segments_discarded:   u64,
        hostnames_discovered: u64,
        events_lost:          u64,
    },
}

impl Event<'_> {
    fn is_verbose(&self) -> bool {
        matches!(
            self,
            Event::StreamStarted { .. } | Event::StreamEnded { .. } | Event::SniParsed { .. }
        )
    }
}

// ── Logger ───────────────────────────────────────────────────────────────────

/// Shared, thread-safe structured logger.
///
/// Constructed once and passed as an `Arc<Logger>` to every pump and flow
/// task. The internal `Mutex` serialises file writes.
pub struct Logger {
    json:    bool,
    verbose: bool,
    file:    Option<Mutex<BufWriter<std::fs::File>>>,
}

pub type SharedLogger = Arc<Logger>;

impl Logger {
    /// Creates a new logger.
    ///
    /// # Errors
    /// Returns an `io::Error` if the log file cannot be opened or created.
    pub fn new(json: bool, verbose: bool, log_path: Option<&str>) -> io::Result<Self> {
        let file = match log_path {
            Some(path) => {
                let f = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(BufWriter::new(f)))
            }
            None => None,
        };

        Ok(Self { json, verbose, file })
    }

    /// Plain-text logger with no file, for embedding and tests.
    pub fn stdout() -> SharedLogger {
        Arc::new(Self { json: false, verbose: false, file: None })
    }

    /// Logs a single [`Event`], writing to stdout and optionally to the log file.
    pub fn log(&self, event: &Event) {
        if event.is_verbose() && !self.verbose {
            return;
        }

        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string();

        let line = if self.json {
            let mut val = serde_json::to_value(event).unwrap_or_default();
            if let Some(obj) = val.as_object_mut() {
                obj.insert("timestamp".to_string(), serde_json::Value::String(timestamp));
            }
            serde_json::to_string(&val).unwrap_or_default()
        } else {
            format!("[{}] {}", timestamp, plain_text(event))
        };

        println!("{}", line);

        if let Some(mutex) = &self.file {
            if let Ok(mut writer) = mutex.lock() {
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
        }
    }
}

/// Formats an [`Event`] as a human-readable line (no timestamp).
fn plain_text(event: &Event) -> String {
    match event {
        Event::Info { message } => format!("[INFO] {}", message),

        Event::InterfaceSelected { interface, description, addresses } => format!(
            "[IFACE] {} ({}) addresses={}",
            interface, description, addresses
        ),

        Event::CaptureOpened { interface, filter } =>
            format!("[CAPTURE] {} opened, filter '{}'", interface, filter),

        Event::CaptureFailed { interface, error } =>
            format!("[CAPTURE] {} skipped: {}", interface, error),

        Event::CaptureEnded { interface } =>
            format!("[CAPTURE] {} stopped delivering packets", interface),

        Event::StreamStarted { interface, flow } =>
            format!("[STREAM] {} new {}", interface, flow),

        Event::StreamEnded { interface, flow, outcome } =>
            format!("[STREAM] {} end {} ({})", interface, flow, outcome),

        Event::SniParsed { interface, flow, sni } =>
            format!("[SNI] {} {} -> {}", interface, flow, sni),

        Event::Discovered { interface, hostname } =>
            format!("[TLS SNI] {} {}", interface, hostname),

        Event::FlowsEvicted { interface, count } =>
            format!("[EVICT] {} finalized {} idle flows", interface, count),

        Event::ReassemblyOverflow { interface, flow } =>
            format!("[OVERFLOW] {} {} dropped held segment", interface, flow),

        Event::DispatchLagged { skipped } =>
            format!("[LAG] consumer missed {} events", skipped),

        Event::TaskPanicked { task, message } =>
            format!("[PANIC] {}: {}", task, message),

        Event::SessionSummary {
            duration_secs, frames_captured, frames_dropped, tcp_segments, frames_undecodable,
            flows_tracked, flows_evicted, flows_ignored, segments_overflowed, segments_discarded,
            hostnames_discovered, events_lost,
        } => format!(
            "[SUMMARY] duration={}s frames={} dropped={} tcp={} undecodable={} flows={} \
             evicted={} ignored={} overflowed={} discarded={} hostnames={} lost={}",
            duration_secs, frames_captured, frames_dropped, tcp_segments, frames_undecodable,
            flows_tracked, flows_evicted, flows_ignored, segments_overflowed, segments_discarded,
            hostnames_discovered, events_lost
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_event_carries_tag() {
        let val = serde_json::to_value(Event::Discovered {
            interface: "eth0",
            hostname:  "example.com",
        })
        .unwrap();
        assert_eq!(val["event"], "discovered");
        assert_eq!(val["hostname"], "example.com");
    }

    #[test]
    fn verbose_events_are_flagged() {
        assert!(Event::StreamStarted { interface: "eth0", flow: "x" }.is_verbose());
        assert!(!Event::CaptureEnded { interface: "eth0" }.is_verbose());
    }
}
