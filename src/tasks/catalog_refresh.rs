use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{Catalog, Image};
use crate::events::SessionCommand;

/// Re-fetch the catalog on a period and whenever `triggers` fires. A failed
/// fetch keeps whatever the session already has.
#[instrument(skip_all, fields(period = ?period))]
pub async fn run(
    catalog: Catalog,
    period: Option<Duration>,
    mut triggers: Receiver<()>,
    to_session: Sender<SessionCommand>,
    initial: Option<Vec<Image>>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker: Option<Interval> = period.map(|p| {
        let mut interval = interval_at(Instant::now() + p, p);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });
    let mut last = initial;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = async {
                match ticker.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending().await,
                }
            } => debug!("scheduled catalog refresh"),
            Some(()) = triggers.recv() => info!("catalog refresh requested"),
        }

        match catalog.fetch().await {
            Ok(images) if last.as_ref() == Some(&images) => {
                debug!(count = images.len(), "catalog unchanged");
            }
            Ok(images) => {
                info!(count = images.len(), "catalog refreshed");
                last = Some(images.clone());
                if to_session
                    .send(SessionCommand::CatalogRefreshed(images))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => warn!("catalog refresh failed; keeping previous catalog: {err:#}"),
        }
    }
    Ok(())
}
