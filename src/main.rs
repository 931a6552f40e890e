mod cli;

use clap::Parser;
use cli::Cli;
use snitap::logger::{Event, Logger, SharedLogger};
use snitap::monitor::types::{SessionStats, SharedStats};
use snitap::monitor::{start_monitor, MonitorConfig};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let session_start = Instant::now();

    let logger: SharedLogger = match Logger::new(cli.json, cli.verbose, cli.log_file.as_deref()) {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            eprintln!("Cannot open log file: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let stats = SessionStats::new();

    let (stop, shutdown) = watch::channel(false);
    register_shutdown_handler(stop, Arc::clone(&logger));

    logger.log(&Event::Info { message: "snitap started" });

    let cfg = MonitorConfig {
        logger:    Arc::clone(&logger),
        stats:     Arc::clone(&stats),
        shutdown,
        interface: cli.interface.clone(),
        pcap_file: cli.pcap_file.clone(),
        limits:    cli.limits(),
    };

    let mut monitor = match start_monitor(cfg) {
        Ok(monitor) => monitor,
        Err(e) => {
            logger.log(&Event::Info { message: &format!("Monitor error: {}", e) });
            return ExitCode::FAILURE;
        }
    };

    // This binary is the external sink: every discovered hostname is logged.
    let drain = monitor.events().map(|mut events| {
        let logger = Arc::clone(&logger);
        tokio::spawn(async move {
            while let Some(found) = events.recv().await {
                logger.log(&Event::Discovered {
                    interface: &found.interface,
                    hostname:  &found.hostname,
                });
            }
        })
    });

    monitor.join().await;
    if let Some(drain) = drain {
        let _ = drain.await;
    }

    print_summary(&logger, &stats, session_start);
    ExitCode::SUCCESS
}

/// Registers a signal handler for graceful shutdown on Ctrl+C.
fn register_shutdown_handler(stop: watch::Sender<bool>, logger: SharedLogger) {
    let result = ctrlc::set_handler(move || {
        let _ = stop.send(true);
    });
    if let Err(e) = result {
        logger.log(&Event::Info { message: &format!("Cannot install Ctrl+C handler: {}", e) });
    }
}

/// Prints session summary statistics.
fn print_summary(logger: &SharedLogger, stats: &SharedStats, session_start: Instant) {
    logger.log(&Event::SessionSummary {
        duration_secs:        session_start.elapsed().as_secs(),
        frames_captured:      SessionStats::get(&stats.frames_captured),
        frames_dropped:       SessionStats::get(&stats.frames_dropped),
        tcp_segments:         SessionStats::get(&stats.tcp_segments),
        frames_undecodable:   SessionStats::get(&stats.frames_undecodable),
        flows_tracked:        SessionStats::get(&stats.total_flows_tracked),
        flows_evicted:        SessionStats::get(&stats.flows_evicted),
        flows_ignored:        SessionStats::get(&stats.flows_ignored),
        segments_overflowed:  SessionStats::get(&stats.segments_overflowed),
        segments_discarded:   SessionStats::get(&stats.segments_discarded),
        hostnames_discovered: SessionStats::get(&stats.hostnames_discovered),
        events_lost:          SessionStats::get(&stats.events_lost),
    });
}
