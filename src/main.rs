use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use humantime::format_duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use photo_slideshow::catalog::Catalog;
use photo_slideshow::channel::{self, Link};
use photo_slideshow::config::Configuration;
use photo_slideshow::events::{
    ChannelEvent, NavAction, Navigation, PlayImage, PlaySelect, SessionCommand, SettingsUpdate,
    SlideAction, SlideCommand, SurfaceEvent,
};
use photo_slideshow::loader::DecodingLoader;
use photo_slideshow::renderer::Renderer;
use photo_slideshow::sequencer::{OrderingPolicy, Sequencer};
use photo_slideshow::session::Session;
use photo_slideshow::settings::SettingsStore;
use photo_slideshow::tasks;

#[derive(Debug, Parser)]
#[command(name = "slideshow", version, about = "Synchronized photo slideshow")]
struct Cli {
    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a display client
    Display {
        /// Path to YAML config
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
    /// Publish one command to every display on a relay
    Send {
        /// Relay address (host:port)
        #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:7878")]
        relay: String,
        #[command(subcommand)]
        action: SendAction,
    },
}

#[derive(Debug, Subcommand)]
enum SendAction {
    Play,
    Pause,
    /// Move every display forward to the given slot
    Next(NavArgs),
    /// Move every display back to the given slot
    Prev(NavArgs),
    /// Restart every display at the first image
    Reset,
    /// Change ordering and interval
    Settings {
        #[arg(long, value_name = "ORDER")]
        order: OrderingPolicy,
        /// Seconds per image
        #[arg(long, value_name = "SECS")]
        speed: u64,
    },
    /// Pin one image on every display
    PlayImage {
        #[arg(long)]
        url: String,
        #[arg(long)]
        title: String,
    },
    /// Play every catalog image carrying a tag
    PlayTag {
        #[arg(long)]
        tag: String,
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long, value_name = "SECS")]
        speed: Option<u64>,
        #[arg(long, value_name = "ORDER")]
        order: Option<OrderingPolicy>,
    },
}

#[derive(Debug, Args)]
struct NavArgs {
    #[arg(long)]
    index: usize,
    #[arg(long = "image-id")]
    image_id: Option<i64>,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct SourceArgs {
    /// Gallery endpoint returning the image list
    #[arg(long = "catalog-url", value_name = "URL")]
    catalog_url: Option<reqwest::Url>,
    /// Photo library to scan instead
    #[arg(long, value_name = "DIR")]
    directory: Option<PathBuf>,
}

fn init_tracing(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(format!("photo_slideshow={level}").parse()?)
        .add_directive(format!("slideshow={level}").parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { verbose, command } = Cli::parse();
    init_tracing(verbose)?;

    match command {
        Command::Display { config } => run_display(config).await,
        Command::Send { relay, action } => {
            let event = build_event(action).await?;
            channel::send_once(relay.as_str(), event).await
        }
    }
}

async fn build_event(action: SendAction) -> Result<ChannelEvent> {
    let event = match action {
        SendAction::Play => ChannelEvent::SlideAction(SlideCommand {
            action: SlideAction::Play,
        }),
        SendAction::Pause => ChannelEvent::SlideAction(SlideCommand {
            action: SlideAction::Pause,
        }),
        SendAction::Next(nav) => navigation(NavAction::Next, nav),
        SendAction::Prev(nav) => navigation(NavAction::Prev, nav),
        SendAction::Reset => ChannelEvent::Navigation(Navigation {
            action: NavAction::Reset,
            index: 0,
            image_id: None,
        }),
        SendAction::Settings { order, speed } => {
            ChannelEvent::SettingsUpdate(SettingsUpdate { speed, order })
        }
        SendAction::PlayImage { url, title } => ChannelEvent::PlayImage(PlayImage {
            image_url: Some(url),
            title: Some(title),
        }),
        SendAction::PlayTag {
            tag,
            source,
            speed,
            order,
        } => {
            let catalog = match (source.catalog_url, source.directory) {
                (Some(url), _) => Catalog::http(url),
                (None, Some(dir)) => Catalog::directory(dir),
                (None, None) => bail!("play-tag needs --catalog-url or --directory"),
            };
            let images: Vec<_> = catalog
                .fetch()
                .await?
                .into_iter()
                .filter(|img| img.has_tag(&tag))
                .collect();
            if images.is_empty() {
                bail!("no images tagged {tag}");
            }
            tracing::info!(count = images.len(), %tag, "selected images");
            ChannelEvent::PlaySelect(PlaySelect::from_images(&images, speed, order))
        }
    };
    Ok(event)
}

fn navigation(action: NavAction, nav: NavArgs) -> ChannelEvent {
    ChannelEvent::Navigation(Navigation {
        action,
        index: nav.index,
        image_id: nav.image_id,
    })
}

async fn run_display(config: PathBuf) -> Result<()> {
    let cfg = Configuration::from_yaml_file(&config)
        .with_context(|| format!("failed to load configuration from {}", config.display()))?
        .validated()
        .context("invalid configuration values")?;
    tracing::info!("Loaded configuration from {}:\n{:#?}", config.display(), cfg);
    tracing::info!(
        transition = %format_duration(cfg.transition),
        load_timeout = %format_duration(cfg.load_timeout),
        "renderer timing"
    );

    let catalog = cfg.catalog.source()?;
    let store = SettingsStore::new(&cfg.settings_path);
    let settings = store
        .load_or(cfg.default_settings())
        .context("failed to load device settings")?;

    let cancel = CancellationToken::new();

    let link = match &cfg.relay_address {
        Some(addr) => match channel::connect(addr.as_str(), cancel.clone()).await {
            Ok(link) => link,
            Err(err) => {
                tracing::warn!("relay unavailable, running standalone: {err:#}");
                Link::detached()
            }
        },
        None => Link::detached(),
    };
    let (publisher, inbound) = link.into_parts();

    // Channels (small/bounded)
    let (command_tx, command_rx) = mpsc::channel::<SessionCommand>(cfg.command_buffer); // Inputs -> Session
    let (surface_tx, surface_rx) = mpsc::channel::<SurfaceEvent>(64); // Session -> Display
    let (refresh_tx, refresh_rx) = mpsc::channel::<()>(4); // Signals -> CatalogRefresh

    let renderer = Renderer::new(DecodingLoader::default(), cfg.transition, cfg.load_timeout);
    let mut session = Session::new(
        Sequencer::new(settings.order, cfg.shuffle_seed),
        renderer,
        publisher,
        settings,
    )
    .with_store(store.clone())
    .with_surface(surface_tx);

    let initial = match catalog.fetch().await {
        Ok(images) => Some(images),
        Err(err) => {
            tracing::warn!("initial catalog fetch failed; waiting for a refresh: {err:#}");
            None
        }
    };
    if let Some(images) = &initial {
        session.begin(images.clone()).await;
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    #[cfg(unix)]
    spawn_signal_inputs(cancel.clone(), command_tx.clone(), refresh_tx.clone());

    let mut tasks = JoinSet::new();

    // Session
    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            session
                .run(command_rx, inbound, cancel)
                .await
                .context("session task failed")
        }
    });

    // Display surface
    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            tasks::display::run(surface_rx, cancel)
                .await
                .context("display task failed")
        }
    });

    // Catalog refresh
    tasks.spawn({
        let to_session = command_tx.clone();
        let cancel = cancel.clone();
        let period = cfg.catalog_refresh;
        async move {
            tasks::catalog_refresh::run(catalog, period, refresh_rx, to_session, initial, cancel)
                .await
                .context("catalog refresh task failed")
        }
    });

    // Settings watcher
    tasks.spawn({
        let to_session = command_tx.clone();
        let cancel = cancel.clone();
        async move {
            tasks::settings_watch::run(store, settings, to_session, cancel)
                .await
                .context("settings watcher failed")
        }
    });

    drop(command_tx);
    drop(refresh_tx);

    // Drain JoinSet; the first task to stop takes the rest down with it.
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("task error: {e:?}"),
            Err(e) => tracing::error!("join error: {e}"),
        }
        cancel.cancel();
    }

    Ok(())
}

/// SIGUSR1 toggles play/pause, SIGUSR2 advances, SIGHUP re-fetches the catalog.
#[cfg(unix)]
fn spawn_signal_inputs(
    cancel: CancellationToken,
    commands: mpsc::Sender<SessionCommand>,
    refresh: mpsc::Sender<()>,
) {
    tokio::spawn(async move {
        let (mut usr1, mut usr2, mut hup) = match (
            signal(SignalKind::user_defined1()),
            signal(SignalKind::user_defined2()),
            signal(SignalKind::hangup()),
        ) {
            (Ok(usr1), Ok(usr2), Ok(hup)) => (usr1, usr2, hup),
            _ => {
                tracing::warn!("failed to register signal handlers");
                return;
            }
        };
        loop {
            let forwarded = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = usr1.recv() => {
                    tracing::info!("SIGUSR1 received; toggling playback");
                    commands.send(SessionCommand::Toggle).await.is_ok()
                }
                Some(()) = usr2.recv() => {
                    tracing::info!("SIGUSR2 received; advancing");
                    commands.send(SessionCommand::Next).await.is_ok()
                }
                Some(()) = hup.recv() => {
                    tracing::info!("SIGHUP received; refreshing catalog");
                    refresh.send(()).await.is_ok()
                }
            };
            if !forwarded {
                tracing::warn!("session is gone; stopping signal handling");
                break;
            }
        }
    });
}
