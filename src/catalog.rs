use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

pub type ImageId = i64;

/// Name of the implicit tag every image carries in the store; never shown
/// to the core.
pub const SYNTHETIC_TAG: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    #[serde(default = "Tag::default_color")]
    pub color: String,
}

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: Self::default_color(),
        }
    }

    fn default_color() -> String {
        "#9e9e9e".to_string()
    }

    pub fn is_synthetic(&self) -> bool {
        self.name.trim().eq_ignore_ascii_case(SYNTHETIC_TAG)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub id: ImageId,
    pub url: String,
    #[serde(default)]
    pub thumbnail_url: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub date_added: DateTime<Utc>,
}

impl Image {
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name.eq_ignore_ascii_case(name))
    }
}

/// Parse a batch of loosely-typed image records. Entries that fail to parse
/// or lack a url/title are skipped; the synthetic tag is stripped.
pub fn parse_images(values: Vec<Value>) -> Vec<Image> {
    let total = values.len();
    let mut images = Vec::with_capacity(total);
    for value in values {
        match serde_json::from_value::<Image>(value) {
            Ok(img) if img.url.trim().is_empty() || img.title.trim().is_empty() => {
                warn!(id = img.id, "skipping image without url or title");
            }
            Ok(img) => images.push(normalize(img)),
            Err(err) => warn!(error = %err, "skipping malformed image record"),
        }
    }
    if images.len() != total {
        debug!(kept = images.len(), total, "image batch filtered");
    }
    images
}

fn normalize(mut img: Image) -> Image {
    let mut seen: Vec<String> = Vec::with_capacity(img.tags.len());
    img.tags.retain(|tag| {
        let key = tag.name.trim().to_lowercase();
        if key.is_empty() || tag.is_synthetic() || seen.contains(&key) {
            return false;
        }
        seen.push(key);
        true
    });
    img
}

/// Where the image list comes from.
#[derive(Debug, Clone)]
pub enum Catalog {
    /// `GET` a JSON array of images from the gallery server.
    Http { client: reqwest::Client, url: Url },
    /// Scan a photo library on disk.
    Directory { root: PathBuf },
    /// Fixed list, mostly for tests and demos.
    Static(Vec<Image>),
}

impl Catalog {
    pub fn http(url: Url) -> Self {
        Catalog::Http {
            client: reqwest::Client::new(),
            url,
        }
    }

    pub fn directory(root: impl Into<PathBuf>) -> Self {
        Catalog::Directory { root: root.into() }
    }

    /// Fetch the full catalog. Failures are returned to the caller, which
    /// logs them; no retry happens here.
    pub async fn fetch(&self) -> Result<Vec<Image>> {
        let images = match self {
            Catalog::Http { client, url } => fetch_http(client, url).await?,
            Catalog::Directory { root } => {
                let root = root.clone();
                tokio::task::spawn_blocking(move || scan_directory(&root))
                    .await
                    .context("directory scan task failed")??
            }
            Catalog::Static(images) => images.clone(),
        };
        Ok(images)
    }
}

#[instrument(skip(client), fields(url = %url))]
async fn fetch_http(client: &reqwest::Client, url: &Url) -> Result<Vec<Image>> {
    let values: Vec<Value> = client
        .get(url.clone())
        .send()
        .await
        .context("catalog request failed")?
        .error_for_status()
        .context("catalog server returned an error")?
        .json()
        .await
        .context("catalog response was not a JSON array")?;
    let mut images = parse_images(values);
    for img in &mut images {
        img.url = resolve_url(url, &img.url);
        if !img.thumbnail_url.is_empty() {
            img.thumbnail_url = resolve_url(url, &img.thumbnail_url);
        }
    }
    info!(count = images.len(), "catalog fetched");
    Ok(images)
}

fn resolve_url(base: &Url, raw: &str) -> String {
    match Url::parse(raw) {
        Ok(abs) => abs.to_string(),
        Err(_) => base
            .join(raw)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| raw.to_string()),
    }
}

/// Recursive scan: titles come from file stems, the containing folder (if
/// any) becomes the image's tag, ids follow sorted path order.
pub fn scan_directory(root: &Path) -> Result<Vec<Image>> {
    anyhow::ensure!(
        root.is_dir(),
        "photo library {} is not a directory",
        root.display()
    );
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| is_image(p))
        .collect();
    paths.sort();

    let mut images = Vec::with_capacity(paths.len());
    for (idx, path) in paths.into_iter().enumerate() {
        let title = path
            .file_stem()
            .and_then(OsStr::to_str)
            .unwrap_or_default()
            .to_string();
        let tags = path
            .parent()
            .filter(|parent| *parent != root)
            .and_then(|parent| parent.file_name())
            .and_then(OsStr::to_str)
            .map(|name| vec![Tag::new(name)])
            .unwrap_or_default();
        let date_added = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();
        let url = path.to_string_lossy().into_owned();
        images.push(normalize(Image {
            id: idx as ImageId + 1,
            thumbnail_url: url.clone(),
            url,
            title,
            description: String::new(),
            tags,
            date_added,
        }));
    }
    info!(root = %root.display(), count = images.len(), "photo library scanned");
    Ok(images)
}

#[inline]
fn is_image(p: &Path) -> bool {
    matches!(
        p.extension()
            .and_then(OsStr::to_str)
            .map(|s| s.to_ascii_lowercase()),
        Some(ref e) if ["jpg", "jpeg", "png", "webp", "gif"].contains(&e.as_str())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_entries_are_skipped_not_fatal() {
        let values = vec![
            json!({"id": 1, "url": "/a.jpg", "title": "A"}),
            json!({"id": 2, "title": "no url"}),
            json!({"id": 3, "url": "/c.jpg", "title": ""}),
            json!({"id": "four", "url": "/d.jpg", "title": "D"}),
            json!({"id": 5, "url": "/e.jpg", "title": "E", "thumbnailUrl": "/t/e.jpg"}),
        ];
        let images = parse_images(values);
        let ids: Vec<ImageId> = images.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 5]);
        assert_eq!(images[1].thumbnail_url, "/t/e.jpg");
    }

    #[test]
    fn synthetic_and_duplicate_tags_are_stripped() {
        let images = parse_images(vec![json!({
            "id": 1,
            "url": "/a.jpg",
            "title": "A",
            "tags": [
                {"name": "All", "color": "#000"},
                {"name": "Travel", "color": "#f00"},
                {"name": "travel", "color": "#0f0"},
                {"name": "Family"}
            ]
        })]);
        let names: Vec<&str> = images[0].tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Travel", "Family"]);
        assert_eq!(images[0].tags[1].color, "#9e9e9e");
    }

    #[test]
    fn relative_urls_resolve_against_catalog() {
        let base = Url::parse("http://frame.local:3000/api/images").unwrap();
        assert_eq!(
            resolve_url(&base, "/uploads/a.jpg"),
            "http://frame.local:3000/uploads/a.jpg"
        );
        assert_eq!(
            resolve_url(&base, "https://cdn.example/b.jpg"),
            "https://cdn.example/b.jpg"
        );
    }

    #[test]
    fn directory_scan_tags_by_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("Travel")).unwrap();
        std::fs::write(root.join("beach.jpg"), b"x").unwrap();
        std::fs::write(root.join("Travel").join("alps.png"), b"x").unwrap();
        std::fs::write(root.join("notes.txt"), b"x").unwrap();

        let images = scan_directory(root).unwrap();
        assert_eq!(images.len(), 2);
        let alps = images.iter().find(|i| i.title == "alps").unwrap();
        assert!(alps.has_tag("travel"));
        let beach = images.iter().find(|i| i.title == "beach").unwrap();
        assert!(beach.tags.is_empty());
        let mut ids: Vec<ImageId> = images.iter().map(|i| i.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }
}
