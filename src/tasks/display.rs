use anyhow::Result;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::SurfaceEvent;

/// Headless presentation surface: what a screen would draw is logged.
pub async fn run(mut events: Receiver<SurfaceEvent>, cancel: CancellationToken) -> Result<()> {
    let mut shown: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(SurfaceEvent::Displayed { image_id, title, subtitle, buffer }) => {
                    shown += 1;
                    info!(image_id, %title, %subtitle, buffer, "displayed");
                }
                Some(SurfaceEvent::Alert(message)) => warn!(%message, "alert"),
                None => break,
            },
        }
    }
    info!(shown, "display surface closed");
    Ok(())
}
