use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{Image, ImageId, parse_images};
use crate::channel::Publisher;
use crate::error::{AdvanceError, RenderError};
use crate::events::{
    ChannelEvent, NavAction, Navigation, PlayImage, PlaySelect, SessionCommand, SettingsUpdate,
    SlideAction, SlideCommand, SurfaceEvent,
};
use crate::loader::ImageLoader;
use crate::renderer::Renderer;
use crate::sequencer::{Direction, OrderingPolicy, Sequencer, Subset};
use crate::settings::{DeviceSettings, SettingsStore};

/// Id given to a `playImage` target that is not part of the working list.
pub const UNLISTED_IMAGE_ID: ImageId = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No image has been shown yet.
    Stopped,
    Playing,
    Paused,
}

/// The single auto-advance timer. At most one interval is live; arming
/// always clears the previous one first.
#[derive(Debug)]
pub struct Ticker {
    interval: Option<Interval>,
    period: Duration,
    created: u64,
    cleared: u64,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            interval: None,
            period,
            created: 0,
            cleared: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.interval.is_some()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    /// Timers created so far.
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Live timers cleared so far.
    pub fn cleared(&self) -> u64 {
        self.cleared
    }

    pub fn arm(&mut self) {
        self.clear();
        let mut interval = interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
        self.created += 1;
    }

    /// Returns whether a live timer was dropped.
    pub fn clear(&mut self) -> bool {
        if self.interval.take().is_some() {
            self.cleared += 1;
            true
        } else {
            false
        }
    }

    /// Resolves on the next fire; pending forever while no timer is live.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Input on this device: applied, persisted and broadcast.
    Local,
    /// Another client's broadcast: applied and persisted.
    Remote,
    /// The settings file was edited: applied only.
    Device,
}

fn interval_for(speed_secs: u64) -> Duration {
    Duration::from_secs(speed_secs.max(1))
}

/// One display client's playback state.
///
/// Owns the sequencer, the renderer and the timer. Everything else talks
/// to it through [`SessionCommand`]s and channel events, which [`run`]
/// handles one at a time to completion.
///
/// [`run`]: Session::run
pub struct Session<L> {
    sequencer: Sequencer,
    renderer: Renderer<L>,
    ticker: Ticker,
    state: PlaybackState,
    paused: bool,
    publisher: Publisher,
    settings: DeviceSettings,
    store: Option<SettingsStore>,
    surface: Option<mpsc::Sender<SurfaceEvent>>,
    pinned: Option<Image>,
    groups_alerted: bool,
}

impl<L: ImageLoader> Session<L> {
    pub fn new(
        mut sequencer: Sequencer,
        renderer: Renderer<L>,
        publisher: Publisher,
        settings: DeviceSettings,
    ) -> Self {
        sequencer.set_policy(settings.order);
        Self {
            sequencer,
            renderer,
            ticker: Ticker::new(interval_for(settings.speed_secs)),
            state: PlaybackState::Stopped,
            paused: false,
            publisher,
            settings,
            store: None,
            surface: None,
            pinned: None,
            groups_alerted: false,
        }
    }

    pub fn with_store(mut self, store: SettingsStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Route displayed images and alerts to a presentation surface.
    pub fn with_surface(mut self, surface: mpsc::Sender<SurfaceEvent>) -> Self {
        self.renderer = self.renderer.with_surface(surface.clone());
        self.surface = Some(surface);
        self
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn ticker(&self) -> &Ticker {
        &self.ticker
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn renderer(&self) -> &Renderer<L> {
        &self.renderer
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn pinned(&self) -> Option<&Image> {
        self.pinned.as_ref()
    }

    /// Load the catalog, show the first image and start auto-advance unless
    /// paused. An empty catalog leaves the session stopped.
    pub async fn begin(&mut self, images: Vec<Image>) {
        self.sequencer.set_catalog(images);
        self.check_groups();
        if self.sequencer.begin().is_none() {
            info!("catalog is empty; waiting for images");
            return;
        }
        self.show_current().await;
        self.state = if self.paused {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        };
        self.start();
    }

    /// Arm the timer unless one is live, the session is paused, or nothing
    /// has been shown yet.
    pub fn start(&mut self) -> bool {
        if self.paused || self.ticker.is_live() || self.state == PlaybackState::Stopped {
            return false;
        }
        self.ticker.arm();
        self.state = PlaybackState::Playing;
        debug!(period = ?self.ticker.period(), "auto-advance armed");
        true
    }

    /// Returns whether anything changed.
    pub fn pause(&mut self) -> bool {
        let cleared = self.ticker.clear();
        let changed = !self.paused;
        self.paused = true;
        if self.state != PlaybackState::Stopped {
            self.state = PlaybackState::Paused;
        }
        if changed || cleared {
            info!(cleared, "slideshow paused");
        }
        changed || cleared
    }

    /// Explicit resume: clears the paused flag, then [`start`](Self::start).
    pub fn play(&mut self) -> bool {
        let changed = self.paused;
        self.paused = false;
        self.pinned = None;
        if self.state == PlaybackState::Paused {
            self.state = PlaybackState::Playing;
        }
        let armed = self.start();
        if changed || armed {
            info!(armed, "slideshow playing");
        }
        changed || armed
    }

    pub fn toggle(&mut self) {
        let action = if self.state == PlaybackState::Playing {
            SlideAction::Pause
        } else {
            SlideAction::Play
        };
        self.set_playing(action, Origin::Local);
    }

    pub async fn next(&mut self) {
        self.step(Direction::Next, Origin::Local, true).await;
    }

    pub async fn prev(&mut self) {
        self.step(Direction::Prev, Origin::Local, true).await;
    }

    /// Back to the first image; random order starts a fresh cycle.
    pub async fn reset(&mut self) {
        let Some(step) = self.sequencer.reset() else {
            debug!("reset with an empty working list");
            return;
        };
        self.show_current().await;
        self.publish(ChannelEvent::Navigation(Navigation {
            action: NavAction::Reset,
            index: step.index,
            image_id: Some(step.image.id),
        }));
        self.rearm_if_live();
    }

    pub async fn settings_changed(&mut self, order: OrderingPolicy, speed_secs: u64) {
        self.apply_settings(order, speed_secs, Origin::Local).await;
    }

    pub async fn play_image(&mut self, url: String, title: String) {
        self.apply_play_image(url, title, Origin::Local).await;
    }

    pub async fn play_select(&mut self, request: PlaySelect) {
        self.apply_play_select(request, Origin::Local).await;
    }

    /// A timer fire: advance and broadcast like a local `next`, keeping the
    /// running interval.
    pub async fn on_tick(&mut self) {
        self.step(Direction::Next, Origin::Local, false).await;
    }

    pub async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Next => self.next().await,
            SessionCommand::Prev => self.prev().await,
            SessionCommand::Reset => self.reset().await,
            SessionCommand::Play => self.set_playing(SlideAction::Play, Origin::Local),
            SessionCommand::Pause => self.set_playing(SlideAction::Pause, Origin::Local),
            SessionCommand::Toggle => self.toggle(),
            SessionCommand::Settings { order, speed } => self.settings_changed(order, speed).await,
            SessionCommand::PlayImage { url, title } => self.play_image(url, title).await,
            SessionCommand::PlaySelect(request) => self.play_select(request).await,
            SessionCommand::CatalogRefreshed(images) => self.catalog_refreshed(images).await,
            SessionCommand::SettingsReloaded(settings) => {
                self.settings.tag_color_index = settings.tag_color_index;
                self.settings.pill_color_index = settings.pill_color_index;
                self.apply_settings(settings.order, settings.speed_secs, Origin::Device)
                    .await;
            }
        }
    }

    /// Apply another client's broadcast. Nothing applied here is
    /// broadcast again.
    pub async fn apply_remote(&mut self, event: ChannelEvent) {
        debug!(event = event.name(), "remote event");
        match event {
            ChannelEvent::Navigation(nav) => self.apply_navigation(nav).await,
            ChannelEvent::SlideAction(SlideCommand { action }) => {
                self.set_playing(action, Origin::Remote)
            }
            ChannelEvent::SettingsUpdate(SettingsUpdate { speed, order }) => {
                self.apply_settings(order, speed, Origin::Remote).await
            }
            ChannelEvent::PlayImage(PlayImage { image_url, title }) => match (image_url, title) {
                (Some(url), Some(title)) if !url.trim().is_empty() && !title.trim().is_empty() => {
                    self.apply_play_image(url, title, Origin::Remote).await
                }
                _ => warn!("playImage without url or title; ignoring"),
            },
            ChannelEvent::PlaySelect(request) => {
                self.apply_play_select(request, Origin::Remote).await
            }
        }
    }

    pub async fn catalog_refreshed(&mut self, images: Vec<Image>) {
        if self.state == PlaybackState::Stopped {
            self.begin(images).await;
            return;
        }
        let before = self.sequencer.current().map(|img| img.id);
        self.sequencer.set_catalog(images);
        self.check_groups();
        if self.sequencer.current().map(|img| img.id) != before && self.pinned.is_none() {
            self.show_current().await;
        }
    }

    #[instrument(name = "session", skip_all, fields(client = %self.publisher.origin()))]
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut inbound: mpsc::Receiver<ChannelEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(
            state = ?self.state,
            images = self.sequencer.list().len(),
            "session loop started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cancel received; stopping session");
                    break;
                }
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(event) = inbound.recv() => self.apply_remote(event).await,
                _ = self.ticker.tick() => self.on_tick().await,
            }
        }
        self.ticker.clear();
        Ok(())
    }

    fn set_playing(&mut self, action: SlideAction, origin: Origin) {
        let changed = match action {
            SlideAction::Play => self.play(),
            SlideAction::Pause => self.pause(),
        };
        if changed && origin == Origin::Local {
            self.publish(ChannelEvent::SlideAction(SlideCommand { action }));
        }
    }

    async fn step(&mut self, direction: Direction, origin: Origin, rearm: bool) {
        match self.sequencer.advance(direction) {
            Ok(step) => {
                self.pinned = None;
                self.show_current().await;
                if origin == Origin::Local {
                    let action = match direction {
                        Direction::Next => NavAction::Next,
                        Direction::Prev => NavAction::Prev,
                    };
                    self.publish(ChannelEvent::Navigation(Navigation {
                        action,
                        index: step.index,
                        image_id: Some(step.image.id),
                    }));
                }
                if rearm {
                    self.rearm_if_live();
                }
            }
            Err(AdvanceError::NoGroups) => self.raise_no_groups(),
            Err(AdvanceError::Empty) => debug!(?direction, "nothing to advance to"),
        }
    }

    async fn apply_navigation(&mut self, nav: Navigation) {
        if nav.action == NavAction::Reset {
            self.sequencer.rewind();
        }
        let Some(step) = self.sequencer.follow(nav.index, nav.image_id) else {
            debug!(index = nav.index, "remote navigation with an empty working list");
            return;
        };
        debug!(action = ?nav.action, index = step.index, id = step.image.id, "following remote navigation");
        self.pinned = None;
        self.show_current().await;
        self.rearm_if_live();
    }

    async fn apply_settings(&mut self, order: OrderingPolicy, speed_secs: u64, origin: Origin) {
        if speed_secs == 0 {
            warn!("settings speed of 0 seconds; using 1");
        }
        let speed_secs = speed_secs.max(1);
        if order == self.settings.order && speed_secs == self.settings.speed_secs {
            debug!(%order, speed_secs, "settings unchanged");
            return;
        }

        let before = self.sequencer.current().map(|img| img.id);
        if self.sequencer.set_policy(order) {
            self.check_groups();
            if self.sequencer.current().map(|img| img.id) != before && self.pinned.is_none() {
                self.show_current().await;
            }
        }
        self.settings.order = order;
        self.settings.speed_secs = speed_secs;
        self.ticker.set_period(interval_for(speed_secs));
        self.rearm_if_live();
        info!(%order, speed_secs, ?origin, "settings applied");

        if origin != Origin::Device {
            self.persist().await;
        }
        if origin == Origin::Local {
            self.publish(ChannelEvent::SettingsUpdate(SettingsUpdate {
                speed: speed_secs,
                order,
            }));
        }
    }

    async fn apply_play_image(&mut self, url: String, title: String, origin: Origin) {
        self.ticker.clear();
        self.paused = true;
        self.state = PlaybackState::Paused;

        let image = match self.sequencer.position_of_url(&url) {
            Some(pos) => {
                self.sequencer.seek(pos);
                self.sequencer.current().cloned()
            }
            None => None,
        }
        .unwrap_or_else(|| Image {
            id: UNLISTED_IMAGE_ID,
            url: url.clone(),
            thumbnail_url: String::new(),
            title: title.clone(),
            description: String::new(),
            tags: Vec::new(),
            date_added: Default::default(),
        });

        match self
            .renderer
            .crossfade_to(0, std::slice::from_ref(&image))
            .await
        {
            Ok(_) => info!(%url, "pinned image"),
            Err(err) => debug!(error = %err, "pinned image not shown"),
        }
        self.pinned = Some(image);

        if origin == Origin::Local {
            self.publish(ChannelEvent::PlayImage(PlayImage {
                image_url: Some(url),
                title: Some(title),
            }));
        }
    }

    async fn apply_play_select(&mut self, request: PlaySelect, origin: Origin) {
        let images = parse_images(request.images.clone());
        if images.is_empty() {
            warn!("playSelect carried no usable images; ignoring");
            return;
        }

        let mut settings_changed = false;
        if let Some(order) = request.order {
            self.sequencer.set_policy(order);
            settings_changed |= order != self.settings.order;
            self.settings.order = order;
        }
        if let Some(speed) = request.speed {
            let speed = speed.max(1);
            settings_changed |= speed != self.settings.speed_secs;
            self.settings.speed_secs = speed;
            self.ticker.set_period(interval_for(speed));
        }
        info!(count = images.len(), order = %self.settings.order, "playing selection");
        self.sequencer.set_subset(Subset::Images(images));
        self.check_groups();
        if self.sequencer.reset().is_some() {
            self.pinned = None;
            self.show_current().await;
        }

        if self.state == PlaybackState::Stopped {
            self.state = PlaybackState::Paused;
        }
        self.ticker.clear();
        self.play();

        if settings_changed && origin != Origin::Device {
            self.persist().await;
        }
        if origin == Origin::Local {
            self.publish(ChannelEvent::PlaySelect(request));
        }
    }

    async fn show_current(&mut self) -> bool {
        let index = self.sequencer.index() as isize;
        match self
            .renderer
            .crossfade_to(index, self.sequencer.list())
            .await
        {
            Ok(transition) => {
                if transition.interrupted {
                    debug!(id = transition.image_id, "previous fade interrupted");
                }
                true
            }
            Err(RenderError::Empty) => {
                debug!("nothing to render");
                false
            }
            // The renderer already logged the failure; the next advance recovers.
            Err(_) => false,
        }
    }

    fn rearm_if_live(&mut self) {
        if self.ticker.is_live() {
            self.ticker.arm();
        }
    }

    fn check_groups(&mut self) {
        if self.sequencer.policy() == OrderingPolicy::Groups
            && !self.sequencer.groups_available()
            && !self.sequencer.is_empty()
        {
            self.raise_no_groups();
        } else {
            self.groups_alerted = false;
        }
    }

    fn raise_no_groups(&mut self) {
        if self.groups_alerted {
            return;
        }
        self.groups_alerted = true;
        self.alert("No tag groups available. Tag some images or choose another order.");
    }

    fn alert(&self, message: &str) {
        warn!(alert = message, "surfacing alert");
        if let Some(surface) = &self.surface {
            if surface.try_send(SurfaceEvent::Alert(message.to_string())).is_err() {
                debug!("surface queue full or closed; dropping alert");
            }
        }
    }

    fn publish(&self, event: ChannelEvent) {
        self.publisher.publish(event);
    }

    async fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save(&self.settings).await {
                warn!("failed to persist device settings: {err:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Tag;
    use crate::channel::{Link, LocalHub};
    use crate::renderer::testing::FakeLoader;

    fn img(id: ImageId, title: &str, tags: &[&str]) -> Image {
        Image {
            id,
            url: format!("/img/{id}.jpg"),
            thumbnail_url: String::new(),
            title: title.to_string(),
            description: String::new(),
            tags: tags.iter().map(|t| Tag::new(*t)).collect(),
            date_added: Default::default(),
        }
    }

    fn catalog() -> Vec<Image> {
        vec![img(1, "a", &[]), img(2, "b", &[]), img(3, "c", &[])]
    }

    fn session_with(link: &Link, loader: FakeLoader, order: OrderingPolicy) -> Session<FakeLoader> {
        let renderer = Renderer::new(loader, Duration::from_millis(10), Duration::from_millis(200));
        Session::new(
            Sequencer::new(order, Some(11)),
            renderer,
            link.publisher(),
            DeviceSettings {
                order,
                speed_secs: 5,
                ..Default::default()
            },
        )
    }

    fn session(order: OrderingPolicy) -> Session<FakeLoader> {
        session_with(&Link::detached(), FakeLoader::default(), order)
    }

    fn assert_timer_bound(s: &Session<FakeLoader>) {
        let t = s.ticker();
        assert!(t.created() <= t.cleared() + 1, "created {} cleared {}", t.created(), t.cleared());
        assert_eq!(t.is_live(), t.created() == t.cleared() + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn begin_shows_first_image_and_arms_one_timer() {
        let mut s = session(OrderingPolicy::Alphabetical);
        assert_eq!(s.state(), PlaybackState::Stopped);
        assert!(!s.start(), "nothing shown yet");

        s.begin(catalog()).await;
        assert_eq!(s.state(), PlaybackState::Playing);
        assert_eq!(s.renderer().visible_image().unwrap().id, 1);
        assert_eq!(s.ticker().created(), 1);
        assert!(!s.start(), "timer already live");
        assert_eq!(s.ticker().created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_catalog_stays_stopped() {
        let mut s = session(OrderingPolicy::Alphabetical);
        s.begin(Vec::new()).await;
        assert_eq!(s.state(), PlaybackState::Stopped);
        assert!(!s.ticker().is_live());
        s.next().await;
        assert_eq!(s.sequencer().index(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_pause_clears_once_and_local_pause_is_noop() {
        let mut s = session(OrderingPolicy::Alphabetical);
        s.begin(catalog()).await;
        assert!(s.ticker().is_live());

        s.apply_remote(ChannelEvent::SlideAction(SlideCommand {
            action: SlideAction::Pause,
        }))
        .await;
        assert_eq!(s.state(), PlaybackState::Paused);
        assert_eq!(s.ticker().cleared(), 1);
        assert_eq!(s.ticker().created(), 1);

        assert!(!s.pause());
        assert_eq!(s.ticker().cleared(), 1);
        assert_eq!(s.ticker().created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_invariant_holds_across_mixed_operations() {
        let mut s = session(OrderingPolicy::Alphabetical);
        s.begin(catalog()).await;
        s.settings_changed(OrderingPolicy::Alphabetical, 2).await;
        assert_timer_bound(&s);
        s.pause();
        s.pause();
        assert_timer_bound(&s);
        s.play();
        s.play();
        s.start();
        assert_timer_bound(&s);
        s.next().await;
        s.settings_changed(OrderingPolicy::Random, 3).await;
        s.toggle();
        assert_timer_bound(&s);
        s.toggle();
        s.reset().await;
        assert_timer_bound(&s);
        assert!(s.ticker().is_live());
        assert_eq!(s.ticker().period(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn settings_are_idempotent() {
        let mut s = session(OrderingPolicy::Alphabetical);
        s.begin(catalog()).await;
        let created = s.ticker().created();
        s.settings_changed(OrderingPolicy::Alphabetical, 5).await;
        assert_eq!(s.ticker().created(), created);
        s.settings_changed(OrderingPolicy::Alphabetical, 8).await;
        assert_eq!(s.ticker().created(), created + 1);
        assert_eq!(s.ticker().cleared(), created);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fire_advances() {
        let mut s = session(OrderingPolicy::Alphabetical);
        s.begin(catalog()).await;
        tokio::time::timeout(Duration::from_secs(6), s.ticker.tick())
            .await
            .unwrap();
        s.on_tick().await;
        assert_eq!(s.renderer().visible_image().unwrap().id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn play_image_pins_and_pauses_until_play() {
        let mut s = session(OrderingPolicy::Alphabetical);
        s.begin(catalog()).await;
        s.play_image("/img/3.jpg".into(), "c".into()).await;
        assert_eq!(s.state(), PlaybackState::Paused);
        assert!(!s.ticker().is_live());
        assert_eq!(s.renderer().visible_image().unwrap().id, 3);
        assert_eq!(s.sequencer().index(), 2);

        s.play_image("https://elsewhere/x.jpg".into(), "x".into()).await;
        assert_eq!(s.pinned().unwrap().id, UNLISTED_IMAGE_ID);
        assert!(!s.start(), "explicitly paused");

        s.play();
        assert!(s.pinned().is_none());
        assert!(s.ticker().is_live());
        assert_eq!(s.state(), PlaybackState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_load_keeps_stale_image_but_moves_pointer() {
        let loader = FakeLoader::default();
        loader.broken.lock().unwrap().insert(2);
        let mut s = session_with(&Link::detached(), loader, OrderingPolicy::Alphabetical);
        s.begin(catalog()).await;
        s.next().await;
        assert_eq!(s.sequencer().index(), 1);
        assert_eq!(s.renderer().visible_image().unwrap().id, 1);
        s.next().await;
        assert_eq!(s.renderer().visible_image().unwrap().id, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn groups_without_tags_alert_once() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut s = session(OrderingPolicy::Alphabetical).with_surface(tx);
        s.begin(catalog()).await;
        while rx.try_recv().is_ok() {}

        s.settings_changed(OrderingPolicy::Groups, 5).await;
        s.next().await;
        s.next().await;
        let alerts: Vec<SurfaceEvent> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|ev| matches!(ev, SurfaceEvent::Alert(_)))
            .collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(s.sequencer().index(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn play_select_replaces_list_applies_settings_and_plays() {
        let mut s = session(OrderingPolicy::Alphabetical);
        s.begin(catalog()).await;
        s.pause();

        let picked = vec![img(7, "Travel shot", &["Travel"]), img(8, "Beach", &["Travel"])];
        let mut request = PlaySelect::from_images(&picked, Some(9), Some(OrderingPolicy::Groups));
        request.images.push(serde_json::json!({"id": 99, "title": "no url"}));
        s.play_select(request).await;

        let ids: Vec<ImageId> = s.sequencer().list().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![8, 7]);
        assert_eq!(s.state(), PlaybackState::Playing);
        assert_eq!(s.ticker().period(), Duration::from_secs(9));
        assert_eq!(s.settings().order, OrderingPolicy::Groups);
        assert_eq!(s.renderer().visible_image().unwrap().id, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_navigation_prefers_image_id_and_is_not_rebroadcast() {
        let cancel = CancellationToken::new();
        let hub = LocalHub::default();
        let link = hub.join(cancel.clone());
        let mut observer = hub.join(cancel.clone());
        let mut s = session_with(&link, FakeLoader::default(), OrderingPolicy::Alphabetical);
        s.begin(catalog()).await;

        s.apply_remote(ChannelEvent::Navigation(Navigation {
            action: NavAction::Next,
            index: 0,
            image_id: Some(3),
        }))
        .await;
        assert_eq!(s.sequencer().index(), 2);

        s.apply_remote(ChannelEvent::Navigation(Navigation {
            action: NavAction::Prev,
            index: 1,
            image_id: Some(404),
        }))
        .await;
        assert_eq!(s.sequencer().index(), 1);

        s.next().await;
        let heard = tokio::time::timeout(Duration::from_secs(1), observer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            heard,
            ChannelEvent::Navigation(Navigation {
                action: NavAction::Next,
                index: 2,
                image_id: Some(3),
            })
        );
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn remote_play_image_without_url_is_skipped() {
        let mut s = session(OrderingPolicy::Alphabetical);
        s.begin(catalog()).await;
        s.apply_remote(ChannelEvent::PlayImage(PlayImage {
            image_url: None,
            title: Some("t".into()),
        }))
        .await;
        assert_eq!(s.state(), PlaybackState::Playing);
        assert!(s.pinned().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_play_image_with_blank_title_is_skipped() {
        let mut s = session(OrderingPolicy::Alphabetical);
        s.begin(catalog()).await;
        s.apply_remote(ChannelEvent::PlayImage(PlayImage {
            image_url: Some("/img/3.jpg".into()),
            title: Some("  ".into()),
        }))
        .await;
        assert_eq!(s.state(), PlaybackState::Playing);
        assert!(s.pinned().is_none());
        assert_eq!(s.renderer().visible_image().unwrap().id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_reset_in_random_marks_only_the_shown_image() {
        let mut s = session(OrderingPolicy::Random);
        s.begin((1..=5).map(|id| img(id, "x", &[])).collect()).await;
        s.next().await;

        s.apply_remote(ChannelEvent::Navigation(Navigation {
            action: NavAction::Reset,
            index: 0,
            image_id: Some(4),
        }))
        .await;
        assert_eq!(s.sequencer().current().unwrap().id, 4);
        assert_eq!(s.renderer().visible_image().unwrap().id, 4);
        assert_eq!(s.sequencer().used().iter().copied().collect::<Vec<_>>(), vec![4]);

        let mut rest: Vec<ImageId> = Vec::new();
        for _ in 0..4 {
            s.next().await;
            rest.push(s.sequencer().current().unwrap().id);
        }
        rest.sort();
        assert_eq!(rest, vec![1, 2, 3, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_navigation_in_groups_lands_on_the_reported_copy() {
        let tagged = vec![
            img(1, "One", &["Travel"]),
            img(2, "Two", &["Travel", "Family"]),
            img(3, "Three", &["Family"]),
        ];
        let mut s = session(OrderingPolicy::Groups);
        s.begin(tagged).await;
        let ids: Vec<ImageId> = s.sequencer().list().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![3, 2, 1, 2]);

        s.apply_remote(ChannelEvent::Navigation(Navigation {
            action: NavAction::Next,
            index: 3,
            image_id: Some(2),
        }))
        .await;
        assert_eq!(s.sequencer().index(), 3);

        s.next().await;
        assert_eq!(s.sequencer().index(), 0);
        assert_eq!(s.renderer().visible_image().unwrap().id, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshed_catalog_starts_a_stopped_session() {
        let mut s = session(OrderingPolicy::Alphabetical);
        s.catalog_refreshed(Vec::new()).await;
        assert_eq!(s.state(), PlaybackState::Stopped);
        s.catalog_refreshed(catalog()).await;
        assert_eq!(s.state(), PlaybackState::Playing);

        s.next().await;
        s.catalog_refreshed(vec![img(2, "b", &[]), img(5, "e", &[])]).await;
        assert_eq!(s.sequencer().current().unwrap().id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn applied_settings_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("device.yaml"));
        let mut s = session(OrderingPolicy::Alphabetical).with_store(store.clone());
        s.begin(catalog()).await;
        s.apply_remote(ChannelEvent::SettingsUpdate(SettingsUpdate {
            speed: 4,
            order: OrderingPolicy::Random,
        }))
        .await;
        let saved = store.load_or(DeviceSettings::default()).unwrap();
        assert_eq!(saved.order, OrderingPolicy::Random);
        assert_eq!(saved.speed_secs, 4);
    }
}
