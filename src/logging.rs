//! Process logging and the session trace channel.
//!
//! Sessions never log protocol traffic directly: they push [`TraceEvent`]s
//! onto a shared MPSC channel and a single consumer turns them into
//! `tracing` events. Events from one session keep their order; events from
//! different sessions may interleave.

use std::net::{IpAddr, SocketAddr};

use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub type TraceSender = mpsc::Sender<TraceEvent>;
pub type TraceReceiver = mpsc::Receiver<TraceEvent>;

/// Capacity of the trace channel.
pub const TRACE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Accepted { peer: SocketAddr },
    ResolveFailed { ip: IpAddr, reason: String },
    Line { peer: SocketAddr, line: String },
    MessageAccepted { peer: SocketAddr, from: String, to: String, subject: String },
    MessageRejected { peer: SocketAddr, reason: String },
    IdleTimeout { peer: SocketAddr },
    Closed { peer: SocketAddr },
}

pub fn trace_channel() -> (TraceSender, TraceReceiver) {
    mpsc::channel(TRACE_CAPACITY)
}

/// Installs the global subscriber. `RUST_LOG` overrides the `info` default,
/// and records from the `log` facade are forwarded into `tracing`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("A tracing subscriber was already installed");
    }
    if tracing_log::LogTracer::init().is_err() {
        eprintln!("A log tracer was already installed");
    }
}

/// Drains the trace channel until every sender is gone.
pub async fn run_trace_consumer(mut rx: TraceReceiver) {
    while let Some(event) = rx.recv().await {
        emit(&event);
    }
    info!("Trace channel closed");
}

fn emit(event: &TraceEvent) {
    match event {
        TraceEvent::Accepted { peer } => info!(%peer, "Accepting connection"),
        TraceEvent::ResolveFailed { ip, reason } => {
            warn!(%ip, %reason, "Error looking up host")
        }
        TraceEvent::Line { peer, line } => info!(%peer, "{}", line),
        TraceEvent::MessageAccepted { peer, from, to, subject } => {
            info!(%peer, %from, %to, %subject, "Message accepted")
        }
        TraceEvent::MessageRejected { peer, reason } => {
            warn!(%peer, %reason, "Message rejected")
        }
        TraceEvent::IdleTimeout { peer } => warn!(%peer, "Idle timeout"),
        TraceEvent::Closed { peer } => info!(%peer, "Closing connection"),
    }
}
