pub mod config;
pub mod delivery;
pub mod logging;
pub mod smtp;

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::Settings;
use smtp::{ConnectionContext, DnsReverseResolver, NoReverseLookup, ReverseResolver};

pub async fn run(settings: Settings) -> Result<()> {
    info!(
        "Starting {} v{} as {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        settings.hostname
    );

    let settings = Arc::new(settings);
    let listener = smtp::bind(&settings).await?;

    let resolver: Arc<dyn ReverseResolver> = match DnsReverseResolver::from_system_conf() {
        Ok(resolver) => Arc::new(resolver),
        Err(e) => {
            warn!("Reverse DNS disabled, could not load resolver configuration: {}", e);
            Arc::new(NoReverseLookup)
        }
    };

    // Consumers first, so nothing a session sends is lost
    let (trace, trace_rx) = logging::trace_channel();
    let trace_task = tokio::spawn(logging::run_trace_consumer(trace_rx));
    let (dispatch, dispatch_rx) = smtp::dispatch_channel(settings.dispatch_capacity);
    let delivery_task = tokio::spawn(delivery::run_delivery(dispatch_rx, Arc::clone(&settings)));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, finishing open sessions...");
                shutdown.cancel();
            }
            Err(e) => warn!("Could not listen for shutdown signal: {}", e),
        }
    });

    let ctx = ConnectionContext { settings, resolver, trace, dispatch };
    smtp::serve(listener, ctx, cancel).await;

    // Both consumers end once the last open session drops its senders
    delivery_task.await?;
    trace_task.await?;
    info!("Shutdown complete");

    Ok(())
}
