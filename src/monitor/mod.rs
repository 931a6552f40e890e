//! Monitoring engine entry point.
//!
//! [`start_monitor`] selects interfaces, opens one capture source per
//! interface and launches, for each, a reader thread and a packet pump.
//! Pumps feed their own [`Reassembler`], which spawns one parser task per
//! flow. Every parser publishes into a single [`Dispatcher`]; the returned
//! [`Monitor`] hands out the consuming side.
//!
//! Failures are scoped: an interface that cannot be opened is skipped, and a
//! panicking pump or flow task is logged without affecting its siblings.
//! Only interface enumeration failure, or ending up with no source at all,
//! stops startup.

pub mod capture;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod eviction;
pub mod flow;
pub mod interfaces;
pub mod parsers;
pub mod stream;
pub mod types;

use crate::logger::{Event, SharedLogger};
use crate::monitor::capture::{open_file, open_live, run_pump, spawn_reader, PacketSource};
use crate::monitor::config::{Limits, CAPTURE_FILTER, FLOW_QUEUE_CAPACITY, FRAME_QUEUE_CAPACITY};
use crate::monitor::dispatch::{Dispatcher, HostnameStream};
use crate::monitor::error::MonitorError;
use crate::monitor::flow::{PageBudget, Reassembler};
use crate::monitor::interfaces::{list_monitorable_interfaces, InterfaceDescriptor};
use crate::monitor::stream::SniStreamFactory;
use crate::monitor::types::{SharedStats, Shutdown};

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Configuration bundle passed from `main` (or an embedder) into the engine.
pub struct MonitorConfig {
    /// Shared structured logger.
    pub logger:    SharedLogger,
    /// Shared session statistics for the shutdown summary.
    pub stats:     SharedStats,
    /// Flipped to `true` to stop every pump.
    pub shutdown:  Shutdown,
    /// Capture only on this interface, bypassing selection. In replay mode
    /// it is used as the label for events from the file.
    pub interface: Option<String>,
    /// Replay this pcap file instead of capturing live.
    pub pcap_file: Option<String>,
    pub limits:    Limits,
}

/// A running engine.
pub struct Monitor {
    dispatcher: Dispatcher,
    events:     Option<HostnameStream>,
    pumps:      Vec<JoinHandle<()>>,
}

impl Monitor {
    /// Takes the stream created at launch, which has seen every event.
    /// Returns `None` on later calls; use [`Monitor::subscribe`] for more
    /// consumers.
    pub fn events(&mut self) -> Option<HostnameStream> {
        self.events.take()
    }

    /// A new consumer that receives events published from now on.
    pub fn subscribe(&self) -> HostnameStream {
        self.dispatcher.subscribe()
    }

    /// Number of capture sources that were launched.
    pub fn source_count(&self) -> usize {
        self.pumps.len()
    }

    /// Waits for every pump to finish, after source exhaustion or shutdown.
    ///
    /// Hostname streams close once the remaining flow tasks wind down.
    pub async fn join(self) {
        let Monitor { dispatcher, events, pumps } = self;
        drop(dispatcher);
        drop(events);
        for pump in pumps {
            let _ = pump.await;
        }
    }
}

/// Starts monitoring. Must be called from within a Tokio runtime.
///
/// # Errors
/// [`MonitorError::Enumeration`] when interfaces cannot be listed, and
/// [`MonitorError::NoSources`] when no capture source could be opened.
pub fn start_monitor(cfg: MonitorConfig) -> Result<Monitor, MonitorError> {
    let sources = match &cfg.pcap_file {
        Some(path) => open_replay(&cfg, path),
        None => open_interfaces(&cfg)?,
    };

    if sources.is_empty() {
        return Err(MonitorError::NoSources);
    }
    Ok(launch(&cfg, sources))
}

/// A packet source and the interface label its events carry.
pub type NamedSource = (String, Box<dyn PacketSource>);

fn open_replay(cfg: &MonitorConfig, path: &str) -> Vec<NamedSource> {
    cfg.logger.log(&Event::Info { message: "Replay mode: reading from PCAP file" });

    let label = cfg.interface.clone().unwrap_or_else(|| path.to_string());
    match open_file(path) {
        Ok(source) => vec![(label, Box::new(source) as Box<dyn PacketSource>)],
        Err(e) => {
            cfg.logger.log(&Event::CaptureFailed { interface: &label, error: &e.to_string() });
            Vec::new()
        }
    }
}

fn open_interfaces(cfg: &MonitorConfig) -> Result<Vec<NamedSource>, MonitorError> {
    let selected = match &cfg.interface {
        Some(name) => vec![InterfaceDescriptor::new(name.as_str(), "selected on command line", Vec::new())],
        None => list_monitorable_interfaces()?,
    };

    let mut sources: Vec<NamedSource> = Vec::with_capacity(selected.len());
    for iface in selected {
        cfg.logger.log(&Event::InterfaceSelected {
            interface:   &iface.name,
            description: &iface.description,
            addresses:   iface.addresses.len(),
        });
        match open_live(&iface.name) {
            Ok(source) => sources.push((iface.name, Box::new(source) as Box<dyn PacketSource>)),
            Err(e) => cfg.logger.log(&Event::CaptureFailed {
                interface: &iface.name,
                error:     &e.to_string(),
            }),
        }
    }
    Ok(sources)
}

/// Runs the engine over already-open packet sources.
///
/// This is what [`start_monitor`] does after opening libpcap handles; it is
/// public so embedders and tests can supply their own [`PacketSource`]s.
/// Must be called from within a Tokio runtime.
pub fn launch(cfg: &MonitorConfig, sources: Vec<NamedSource>) -> Monitor {
    let budget = PageBudget::new(cfg.limits.max_pages_total);
    let (dispatcher, events) =
        Dispatcher::new(cfg.limits.dispatch_capacity, cfg.logger.clone(), cfg.stats.clone());

    let mut pumps = Vec::with_capacity(sources.len());
    for (name, source) in sources {
        let interface: Arc<str> = Arc::from(name.as_str());
        let link = source.link_kind();
        let live = source.is_live();

        let (tx, rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        if let Err(e) = spawn_reader(&name, source, tx, cfg.stats.clone()) {
            cfg.logger.log(&Event::CaptureFailed { interface: &name, error: &e.to_string() });
            continue;
        }
        cfg.logger.log(&Event::CaptureOpened { interface: &name, filter: CAPTURE_FILTER });

        let factory = SniStreamFactory::new(
            Arc::clone(&interface),
            dispatcher.clone(),
            cfg.logger.clone(),
            FLOW_QUEUE_CAPACITY,
        );
        let reassembler = Reassembler::new(
            factory,
            budget.clone(),
            &cfg.limits,
            Arc::clone(&interface),
            cfg.logger.clone(),
            cfg.stats.clone(),
        );

        pumps.push(spawn_guarded(
            format!("pump {}", name),
            cfg.logger.clone(),
            run_pump(
                interface,
                link,
                live,
                rx,
                reassembler,
                cfg.limits.clone(),
                cfg.shutdown.clone(),
                cfg.logger.clone(),
                cfg.stats.clone(),
            ),
        ));
    }

    Monitor { dispatcher, events: Some(events), pumps }
}

/// Spawns `fut` on the runtime, catching a panic and logging it as
/// [`Event::TaskPanicked`] instead of letting it surface through the handle.
pub(crate) fn spawn_guarded<F>(task: String, logger: SharedLogger, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            logger.log(&Event::TaskPanicked {
                task:    &task,
                message: &panic_message(panic.as_ref()),
            });
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
