use thiserror::Error;

/// Why the sequencer refused to move.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdvanceError {
    /// The working list has no images to step through.
    #[error("working list is empty")]
    Empty,

    /// Groups ordering was requested but no image carries a tag.
    #[error("no tag groups available")]
    NoGroups,
}

/// Contained failure of a single crossfade; the visible buffer is left as-is.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("nothing to render: list is empty")]
    Empty,

    #[error("failed to load {url}: {source}")]
    LoadFailed {
        url: String,
        #[source]
        source: LoadError,
    },

    #[error("timed out loading {url}")]
    LoadTimedOut { url: String },
}

/// Failure to bring an image into the off-screen buffer.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("decoder task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
