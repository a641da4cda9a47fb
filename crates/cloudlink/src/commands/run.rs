//! `cloudlink run`: hold the link open until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use cloudlink_config::Settings;
use cloudlink_core::{Event, LifecycleEvent, Verdict};

use super::build_controller;
use crate::cli::RunArgs;
use crate::error::CliError;
use crate::metrics::ProcessMetrics;

pub async fn handle(args: &RunArgs, settings: &Settings) -> Result<(), CliError> {
    let controller = build_controller(settings)?;
    controller.register_observer(Arc::new(report));
    controller.set_metrics_source(Arc::new(ProcessMetrics::new(args.max_players)));

    let window = Duration::from_secs(settings.heartbeat.interval + settings.heartbeat.timeout);
    let watchdog = tokio::spawn(watch_heartbeats(
        controller.event_bus().subscribe(),
        window,
        |silent| warn!(silent_secs = silent.as_secs(), "no heartbeat request from the backend"),
    ));

    controller.connect()?;
    info!(
        server_id = controller.server_id(),
        transport = %controller.transport_kind(),
        "link started, Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    watchdog.abort();
    controller.shutdown().await;
    Ok(())
}

// ── Observer ────────────────────────────────────────────────────────

/// Operator-facing summary of the events worth a line on their own.
fn report(event: &Event) -> Verdict {
    match &event.kind {
        LifecycleEvent::ConnectionEstablished {
            endpoint,
            is_reconnect,
        } => info!(%endpoint, is_reconnect, "linked"),
        LifecycleEvent::ReconnectExhausted {
            attempts,
            max_attempts,
        } => error!(
            attempts,
            max_attempts, "giving up on the backend; restart to try again"
        ),
        LifecycleEvent::AuthenticationFailed { status, message } => {
            error!(status, %message, "backend rejected this server's credentials");
        }
        other => debug!(event = other.name(), transport = %event.transport, "{other:?}"),
    }
    Verdict::Allow
}

// ── Heartbeat watchdog ──────────────────────────────────────────────

/// Call `on_silence` whenever a live link goes `window` without a
/// heartbeat request. Returns when the bus closes.
async fn watch_heartbeats(
    mut events: broadcast::Receiver<Arc<Event>>,
    window: Duration,
    on_silence: impl Fn(Duration) + Send,
) {
    let mut linked = false;
    let mut last_heard = Instant::now();
    let mut deadline = last_heard + window;

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => match event.kind {
                    LifecycleEvent::ConnectionEstablished { .. }
                    | LifecycleEvent::HeartbeatRequestReceived { .. } => {
                        linked = true;
                        last_heard = Instant::now();
                        deadline = last_heard + window;
                    }
                    LifecycleEvent::ConnectionLost { .. }
                    | LifecycleEvent::ShutdownNotified { .. } => linked = false,
                    _ => {}
                },
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "watchdog lagged"),
                Err(RecvError::Closed) => return,
            },
            () = tokio::time::sleep_until(deadline) => {
                if linked {
                    on_silence(last_heard.elapsed());
                }
                deadline = Instant::now() + window;
            }
        }
    }
}
