use anyhow::{Context, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher, recommended_watcher};
use tokio::sync::mpsc::{self, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::events::SessionCommand;
use crate::settings::{DeviceSettings, SettingsStore};

/// Watch the device settings file and forward external edits to the
/// session. The session's own writes come back here too; it ignores
/// settings it already has.
#[instrument(skip_all, fields(path = %store.path().display()))]
pub async fn run(
    store: SettingsStore,
    current: DeviceSettings,
    to_session: Sender<SessionCommand>,
    cancel: CancellationToken,
) -> Result<()> {
    let path = store.path().to_path_buf();
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("failed to resolve working directory")?,
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create settings directory {}", dir.display()))?;
    let Some(file_name) = path.file_name().map(|n| n.to_os_string()) else {
        anyhow::bail!("settings path {} has no file name", path.display());
    };

    // The file is replaced by rename, so watch the directory.
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Result<Event>>(32);
    let mut watcher = recommended_watcher(move |res| {
        let _ = watch_tx.blocking_send(res);
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(watching = %dir.display(), "settings watcher initialized");

    let mut last = current;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(res) = watch_rx.recv() => match res {
                Ok(event) => {
                    let touched = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()));
                    if !touched || matches!(event.kind, EventKind::Access(_) | EventKind::Remove(_)) {
                        continue;
                    }
                    debug!(kind = ?event.kind, "settings file event");
                    match store.load_or(last) {
                        Ok(loaded) if loaded == last => {}
                        Ok(loaded) => {
                            info!(order = %loaded.order, speed_secs = loaded.speed_secs, "device settings changed on disk");
                            last = loaded;
                            if to_session.send(SessionCommand::SettingsReloaded(loaded)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("ignoring unreadable settings file: {err:#}"),
                    }
                }
                Err(err) => error!("watch error: {err}"),
            },
        }
    }
    Ok(())
}
