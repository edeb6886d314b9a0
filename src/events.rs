use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{Image, ImageId};
use crate::sequencer::OrderingPolicy;
use crate::settings::DeviceSettings;

/// Messages carried by the real-time channel. Each one is a full-state
/// replacement for the receiver: last message wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ChannelEvent {
    Navigation(Navigation),
    SlideAction(SlideCommand),
    SettingsUpdate(SettingsUpdate),
    PlayImage(PlayImage),
    PlaySelect(PlaySelect),
}

impl ChannelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Navigation(_) => "navigation",
            ChannelEvent::SlideAction(_) => "slideAction",
            ChannelEvent::SettingsUpdate(_) => "settingsUpdate",
            ChannelEvent::PlayImage(_) => "playImage",
            ChannelEvent::PlaySelect(_) => "playSelect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavAction {
    Next,
    Prev,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Navigation {
    pub action: NavAction,
    pub index: usize,
    /// Id of the image that became current. Lets peers whose working list
    /// is ordered differently land on the same photo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<ImageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlideAction {
    Play,
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideCommand {
    pub action: SlideAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    /// Auto-advance interval in seconds.
    pub speed: u64,
    pub order: OrderingPolicy,
}

/// Fields are optional on the wire; a payload missing either is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayImage {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Images stay untyped until they reach the session so one malformed entry
/// cannot reject the whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaySelect {
    pub images: Vec<Value>,
    #[serde(default)]
    pub speed: Option<u64>,
    #[serde(default)]
    pub order: Option<OrderingPolicy>,
}

impl PlaySelect {
    pub fn from_images(images: &[Image], speed: Option<u64>, order: Option<OrderingPolicy>) -> Self {
        Self {
            images: images
                .iter()
                .filter_map(|img| serde_json::to_value(img).ok())
                .collect(),
            speed,
            order,
        }
    }
}

/// A channel event stamped with the client that published it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: String,
    pub message: ChannelEvent,
}

/// Requests accepted by a running session, from local input or the catalog
/// refresher.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Next,
    Prev,
    Reset,
    Play,
    Pause,
    Toggle,
    Settings { order: OrderingPolicy, speed: u64 },
    PlayImage { url: String, title: String },
    PlaySelect(PlaySelect),
    CatalogRefreshed(Vec<Image>),
    /// The device settings file changed on disk.
    SettingsReloaded(DeviceSettings),
}

/// Emitted by the session for whatever surface presents it.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceEvent {
    Displayed {
        image_id: ImageId,
        title: String,
        subtitle: String,
        buffer: usize,
    },
    Alert(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_uses_camel_case_wire_names() {
        let ev = ChannelEvent::Navigation(Navigation {
            action: NavAction::Next,
            index: 3,
            image_id: Some(42),
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "event": "navigation",
                "data": {"action": "next", "index": 3, "imageId": 42}
            })
        );
    }

    #[test]
    fn navigation_without_image_id_parses() {
        let raw = r#"{"event":"navigation","data":{"action":"reset","index":0}}"#;
        let ev: ChannelEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            ev,
            ChannelEvent::Navigation(Navigation {
                action: NavAction::Reset,
                index: 0,
                image_id: None,
            })
        );
    }

    #[test]
    fn slide_action_and_settings_parse() {
        let ev: ChannelEvent =
            serde_json::from_str(r#"{"event":"slideAction","data":{"action":"pause"}}"#).unwrap();
        assert_eq!(
            ev,
            ChannelEvent::SlideAction(SlideCommand {
                action: SlideAction::Pause
            })
        );
        let ev: ChannelEvent = serde_json::from_str(
            r#"{"event":"settingsUpdate","data":{"speed":7,"order":"groups"}}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            ChannelEvent::SettingsUpdate(SettingsUpdate {
                speed: 7,
                order: OrderingPolicy::Groups
            })
        );
    }

    #[test]
    fn play_image_tolerates_missing_fields() {
        let ev: ChannelEvent =
            serde_json::from_str(r#"{"event":"playImage","data":{"title":"x"}}"#).unwrap();
        match ev {
            ChannelEvent::PlayImage(p) => {
                assert!(p.image_url.is_none());
                assert_eq!(p.title.as_deref(), Some("x"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
