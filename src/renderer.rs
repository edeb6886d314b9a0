use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::catalog::{Image, ImageId};
use crate::error::RenderError;
use crate::events::SurfaceEvent;
use crate::loader::ImageLoader;

/// Text shown over a layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caption {
    pub title: String,
    pub subtitle: String,
}

/// One of the two stacked image + caption layers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layer {
    pub image: Option<Image>,
    pub caption: Caption,
    pub visible: bool,
}

/// Outcome of a successful crossfade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub image_id: ImageId,
    pub index: usize,
    /// Buffer that is now visible.
    pub buffer: usize,
    /// The previous fade was still running and got cut short.
    pub interrupted: bool,
}

/// Two-buffer crossfader.
///
/// The hidden buffer receives the next image; the swap happens only after
/// the loader reports success. Overlapping calls are not queued: a call
/// that arrives while the previous fade is retiring reuses the live buffer
/// pointers and interrupts it.
pub struct Renderer<L> {
    loader: L,
    layers: [Layer; 2],
    front: usize,
    transition: Duration,
    load_timeout: Duration,
    retiring_until: Option<Instant>,
    surface: Option<mpsc::Sender<SurfaceEvent>>,
    swaps: u64,
}

impl<L: ImageLoader> Renderer<L> {
    pub fn new(loader: L, transition: Duration, load_timeout: Duration) -> Self {
        Self {
            loader,
            layers: [Layer::default(), Layer::default()],
            front: 0,
            transition,
            load_timeout,
            retiring_until: None,
            surface: None,
            swaps: 0,
        }
    }

    pub fn with_surface(mut self, surface: mpsc::Sender<SurfaceEvent>) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn layers(&self) -> &[Layer; 2] {
        &self.layers
    }

    /// The layer currently on top.
    pub fn visible(&self) -> &Layer {
        &self.layers[self.front]
    }

    pub fn visible_image(&self) -> Option<&Image> {
        self.visible().image.as_ref()
    }

    pub fn swaps(&self) -> u64 {
        self.swaps
    }

    pub fn is_fading(&self) -> bool {
        self.retiring_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Load `list[index]` (wrapping in both directions) into the hidden
    /// buffer and swap it in once loaded. On failure nothing visible changes.
    pub async fn crossfade_to(
        &mut self,
        index: isize,
        list: &[Image],
    ) -> Result<Transition, RenderError> {
        if list.is_empty() {
            return Err(RenderError::Empty);
        }
        let index = index.rem_euclid(list.len() as isize) as usize;
        let target = &list[index];

        let loaded = match timeout(self.load_timeout, self.loader.load(target)).await {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(source)) => {
                warn!(id = target.id, url = %target.url, error = %source, "image failed to load; keeping current");
                return Err(RenderError::LoadFailed {
                    url: target.url.clone(),
                    source,
                });
            }
            Err(_) => {
                warn!(id = target.id, url = %target.url, "image load timed out; keeping current");
                return Err(RenderError::LoadTimedOut {
                    url: target.url.clone(),
                });
            }
        };

        let interrupted = self.is_fading();
        if interrupted {
            debug!(id = target.id, "crossfade interrupts the previous fade");
        }

        let back = 1 - self.front;
        self.layers[back] = Layer {
            image: Some(target.clone()),
            caption: Caption {
                title: target.title.clone(),
                subtitle: target.description.clone(),
            },
            visible: true,
        };
        self.layers[self.front].visible = false;
        self.front = back;
        self.retiring_until = Some(Instant::now() + self.transition);
        self.swaps += 1;

        debug!(
            id = target.id,
            index,
            buffer = back,
            width = loaded.width,
            height = loaded.height,
            "crossfade swapped"
        );

        if let Some(surface) = &self.surface {
            let event = SurfaceEvent::Displayed {
                image_id: target.id,
                title: target.title.clone(),
                subtitle: target.description.clone(),
                buffer: back,
            };
            if surface.try_send(event).is_err() {
                debug!("surface queue full or closed; dropping displayed event");
            }
        }

        Ok(Transition {
            image_id: target.id,
            index,
            buffer: back,
            interrupted,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;
    use std::future::Future;
    use std::sync::{Arc, Mutex};

    use crate::catalog::{Image, ImageId};
    use crate::error::LoadError;
    use crate::loader::{ImageLoader, LoadedImage};

    /// Loader double: ids in `broken` fail, ids in `hanging` never resolve.
    #[derive(Clone, Default)]
    pub struct FakeLoader {
        pub broken: Arc<Mutex<HashSet<ImageId>>>,
        pub hanging: Arc<Mutex<HashSet<ImageId>>>,
    }

    impl ImageLoader for FakeLoader {
        fn load(
            &self,
            image: &Image,
        ) -> impl Future<Output = Result<LoadedImage, LoadError>> + Send {
            let id = image.id;
            let broken = self.broken.lock().unwrap().contains(&id);
            let hanging = self.hanging.lock().unwrap().contains(&id);
            async move {
                if hanging {
                    std::future::pending::<()>().await;
                }
                if broken {
                    return Err(LoadError::Io(std::io::Error::other("broken")));
                }
                Ok(LoadedImage {
                    id,
                    width: 4,
                    height: 3,
                })
            }
        }
    }
}
