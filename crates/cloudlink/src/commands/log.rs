//! `cloudlink log`: forward one player activity record.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::info;

use cloudlink_config::Settings;
use cloudlink_core::{Event, LifecycleEvent};

use super::{build_controller, wait_connected};
use crate::cli::LogArgs;
use crate::error::CliError;

pub async fn handle(args: &LogArgs, settings: &Settings) -> Result<(), CliError> {
    if !settings.logging.should_log(&args.action) {
        println!("Skipped: logging of '{}' events is disabled", args.action);
        return Ok(());
    }

    let wait = Duration::from_secs(args.wait);
    let controller = build_controller(settings)?;
    let mut events = controller.event_bus().subscribe();

    controller.connect()?;
    let linked = wait_connected(&controller, wait).await;
    if let Err(e) = linked {
        controller.disconnect();
        return Err(e);
    }

    controller.send_log_event(&args.player, &args.uuid, &args.action, args.forced);
    let delivered = tokio::time::timeout(wait, forwarded(&mut events))
        .await
        .ok()
        .flatten()
        .unwrap_or(false);

    // A one-shot client leaving is not the server going offline, so no
    // shutdown notice here.
    controller.disconnect();

    if delivered {
        info!(player = %args.player, action = %args.action, "log event forwarded");
        println!("Forwarded '{}' for {}", args.action, args.player);
        Ok(())
    } else {
        Err(CliError::LogNotForwarded {
            player: args.player.clone(),
        })
    }
}

/// Outcome of the next `LogForwarded` event; `None` if the bus closes.
async fn forwarded(events: &mut broadcast::Receiver<Arc<Event>>) -> Option<bool> {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let LifecycleEvent::LogForwarded { success, .. } = event.kind {
                    return Some(success);
                }
            }
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return None,
        }
    }
}
