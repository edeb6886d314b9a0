use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::{Image, ImageId};
use crate::error::AdvanceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderingPolicy {
    #[default]
    Alphabetical,
    Random,
    Groups,
}

impl OrderingPolicy {
    const ALL: &'static [Self] = &[Self::Alphabetical, Self::Random, Self::Groups];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alphabetical => "alphabetical",
            Self::Random => "random",
            Self::Groups => "groups",
        }
    }
}

impl fmt::Display for OrderingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown ordering '{s}' (expected alphabetical, random or groups)"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Prev,
}

/// Which part of the catalog the slideshow runs over.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Subset {
    #[default]
    All,
    Ids(Vec<ImageId>),
    Tag(String),
    /// Explicit list delivered by a `playSelect` request, replacing the
    /// catalog-derived selection wholesale.
    Images(Vec<Image>),
}

/// Result of a move: where the pointer landed and what it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub index: usize,
    pub image: Image,
    /// The random cycle was exhausted and the list reshuffled by this move.
    pub reshuffled: bool,
}

#[derive(Debug, Clone, Copy)]
enum RebuildReason {
    Catalog,
    Subset,
    Policy,
}

/// Owns the working list and the pointer into it.
///
/// Rules:
/// - The list is derived from catalog + subset + policy and is replaced
///   together with the index, never one without the other.
/// - When a rebuild keeps the current image, the pointer follows it;
///   otherwise it restarts at 0.
/// - Random mode never repeats an id until every id in the list has been
///   current once in this cycle.
pub struct Sequencer {
    policy: OrderingPolicy,
    catalog: Vec<Image>,
    subset: Subset,
    list: Vec<Image>,
    index: usize,
    used: HashSet<ImageId>,
    groups_available: bool,
    rng: StdRng,
}

impl Sequencer {
    pub fn new(policy: OrderingPolicy, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self::with_rng(policy, rng)
    }

    pub fn with_rng(policy: OrderingPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            catalog: Vec::new(),
            subset: Subset::All,
            list: Vec::new(),
            index: 0,
            used: HashSet::new(),
            groups_available: true,
            rng,
        }
    }

    pub fn policy(&self) -> OrderingPolicy {
        self.policy
    }

    pub fn subset(&self) -> &Subset {
        &self.subset
    }

    pub fn list(&self) -> &[Image] {
        &self.list
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn used(&self) -> &HashSet<ImageId> {
        &self.used
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn groups_available(&self) -> bool {
        self.groups_available
    }

    pub fn current(&self) -> Option<&Image> {
        self.list.get(self.index)
    }

    pub fn set_catalog(&mut self, images: Vec<Image>) {
        self.catalog = images;
        self.rebuild(RebuildReason::Catalog);
    }

    pub fn set_subset(&mut self, subset: Subset) {
        self.subset = subset;
        self.rebuild(RebuildReason::Subset);
    }

    /// Returns `false` when the policy was already active.
    pub fn set_policy(&mut self, policy: OrderingPolicy) -> bool {
        if self.policy == policy {
            return false;
        }
        self.policy = policy;
        self.rebuild(RebuildReason::Policy);
        true
    }

    /// Mark the initial image as shown. In random mode the list was just
    /// shuffled, so slot 0 is already a uniform pick.
    pub fn begin(&mut self) -> Option<Step> {
        let id = self.current()?.id;
        if self.policy == OrderingPolicy::Random {
            self.used.insert(id);
        }
        self.step(false)
    }

    pub fn advance(&mut self, direction: Direction) -> Result<Step, AdvanceError> {
        if self.list.is_empty() {
            warn!(?direction, "advance requested with an empty working list");
            return Err(AdvanceError::Empty);
        }
        if self.policy == OrderingPolicy::Groups && !self.groups_available {
            return Err(AdvanceError::NoGroups);
        }

        let len = self.list.len();
        let mut reshuffled = false;
        match (self.policy, direction) {
            (OrderingPolicy::Random, Direction::Next) => {
                if self.cycle_complete() {
                    self.used.clear();
                    self.list.shuffle(&mut self.rng);
                    reshuffled = true;
                    debug!(len, "random cycle exhausted; reshuffled");
                }
                self.index = self.draw_unused();
                self.used.insert(self.list[self.index].id);
            }
            (OrderingPolicy::Random, Direction::Prev) => {
                // Steps back in list order; membership is recorded, never undone.
                self.index = (self.index % len + len - 1) % len;
                self.used.insert(self.list[self.index].id);
            }
            (_, Direction::Next) => self.index = (self.index + 1) % len,
            (_, Direction::Prev) => self.index = (self.index % len + len - 1) % len,
        }

        self.step(reshuffled).ok_or(AdvanceError::Empty)
    }

    /// Jump to a slot, wrapping out-of-range values.
    pub fn seek(&mut self, index: usize) -> Option<Step> {
        if self.list.is_empty() {
            return None;
        }
        self.index = index % self.list.len();
        if self.policy == OrderingPolicy::Random {
            self.used.insert(self.list[self.index].id);
        }
        self.step(false)
    }

    /// Jump to the first slot holding `id`.
    pub fn seek_image(&mut self, id: ImageId) -> Option<Step> {
        let pos = self.list.iter().position(|img| img.id == id)?;
        self.seek(pos)
    }

    pub fn position_of_url(&self, url: &str) -> Option<usize> {
        self.list.iter().position(|img| img.url == url)
    }

    /// Land on the slot a peer reported. The index wins when it still holds
    /// `id`, which keeps repeated images in groups order on the same copy;
    /// otherwise the first slot holding `id`, then the bare index.
    pub fn follow(&mut self, index: usize, id: Option<ImageId>) -> Option<Step> {
        let len = self.list.len();
        if len == 0 {
            return None;
        }
        match id {
            Some(id) if self.list[index % len].id != id => {
                self.seek_image(id).or_else(|| self.seek(index))
            }
            _ => self.seek(index),
        }
    }

    /// Back to the first slot; random mode starts a fresh cycle.
    pub fn reset(&mut self) -> Option<Step> {
        if !self.rewind() {
            return None;
        }
        self.begin()
    }

    /// Like [`reset`](Self::reset) but records nothing as shown. The caller
    /// seeks to the image that is actually displayed next.
    pub fn rewind(&mut self) -> bool {
        if self.list.is_empty() {
            return false;
        }
        if self.policy == OrderingPolicy::Random {
            self.used.clear();
            self.list.shuffle(&mut self.rng);
        }
        self.index = 0;
        true
    }

    fn step(&self, reshuffled: bool) -> Option<Step> {
        self.current().map(|image| Step {
            index: self.index,
            image: image.clone(),
            reshuffled,
        })
    }

    fn cycle_complete(&self) -> bool {
        self.list.iter().all(|img| self.used.contains(&img.id))
    }

    fn draw_unused(&mut self) -> usize {
        // Terminates: callers reset the cycle before every id is used.
        loop {
            let candidate = self.rng.random_range(0..self.list.len());
            if !self.used.contains(&self.list[candidate].id) {
                return candidate;
            }
        }
    }

    fn resolve_subset(&self) -> Vec<Image> {
        let picked: Vec<Image> = match &self.subset {
            Subset::All => return self.catalog.clone(),
            Subset::Ids(ids) => self
                .catalog
                .iter()
                .filter(|img| ids.contains(&img.id))
                .cloned()
                .collect(),
            Subset::Tag(name) => self
                .catalog
                .iter()
                .filter(|img| img.has_tag(name))
                .cloned()
                .collect(),
            Subset::Images(images) => images.clone(),
        };
        if picked.is_empty() {
            warn!(subset = ?self.subset, "subset is empty; falling back to full catalog");
            return self.catalog.clone();
        }
        picked
    }

    fn rebuild(&mut self, reason: RebuildReason) {
        let keep = self.current().map(|img| img.id);
        let base = self.resolve_subset();

        let (list, groups_available) = match self.policy {
            OrderingPolicy::Alphabetical => (alphabetical(base), true),
            OrderingPolicy::Random => {
                let mut list = dedup_by_id(base);
                list.shuffle(&mut self.rng);
                (list, true)
            }
            OrderingPolicy::Groups => match grouped(&base) {
                Some(list) => (list, true),
                None => (alphabetical(base), false),
            },
        };

        self.list = list;
        self.groups_available = groups_available;
        self.index = keep
            .and_then(|id| self.list.iter().position(|img| img.id == id))
            .unwrap_or(0);
        if self.policy == OrderingPolicy::Random {
            let present: HashSet<ImageId> = self.list.iter().map(|img| img.id).collect();
            self.used.retain(|id| present.contains(id));
            match keep {
                Some(id) if present.contains(&id) => {
                    self.used.insert(id);
                }
                // The current image went away; slot 0 takes its place.
                Some(_) => {
                    if let Some(first) = self.list.first() {
                        self.used.insert(first.id);
                    }
                }
                None => {}
            }
        } else {
            self.used.clear();
        }

        info!(
            reason = ?reason,
            policy = %self.policy,
            len = self.list.len(),
            index = self.index,
            groups_available,
            "working list rebuilt"
        );
    }
}

fn sort_by_title(images: &mut [Image]) {
    images.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
}

fn alphabetical(mut images: Vec<Image>) -> Vec<Image> {
    sort_by_title(&mut images);
    images
}

fn dedup_by_id(images: Vec<Image>) -> Vec<Image> {
    let mut seen = HashSet::new();
    images
        .into_iter()
        .filter(|img| seen.insert(img.id))
        .collect()
}

/// One run per tag (case-insensitive, synthetic tag excluded), runs in tag
/// order, images by title within a run. `None` when nothing is tagged.
pub fn grouped(images: &[Image]) -> Option<Vec<Image>> {
    let mut groups: BTreeMap<String, Vec<Image>> = BTreeMap::new();
    for img in images {
        for tag in &img.tags {
            let key = tag.name.trim().to_lowercase();
            if key.is_empty() || tag.is_synthetic() {
                continue;
            }
            let bucket = groups.entry(key).or_default();
            if !bucket.iter().any(|other| other.id == img.id) {
                bucket.push(img.clone());
            }
        }
    }
    if groups.is_empty() {
        return None;
    }
    Some(
        groups
            .into_values()
            .flat_map(|mut group| {
                sort_by_title(&mut group);
                group
            })
            .collect(),
    )
}
