pub mod catalog;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod loader;
pub mod renderer;
pub mod sequencer;
pub mod session;
pub mod settings;
pub mod tasks {
    pub mod catalog_refresh;
    pub mod display;
    pub mod settings_watch;
}
