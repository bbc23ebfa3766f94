use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChapterId(String);

impl ChapterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered, immutable page resource identifiers of one chapter.
///
/// Cloning shares the underlying list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageList(Arc<[String]>);

impl PageList {
    pub fn new(pages: Vec<String>) -> Self {
        Self(pages.into())
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn last_index(&self) -> Option<usize> {
        self.0.len().checked_sub(1)
    }
}

impl Deref for PageList {
    type Target = [String];

    fn deref(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for PageList {
    fn from(pages: Vec<String>) -> Self {
        Self::new(pages)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn signum(self) -> isize {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Forward => "next",
            Direction::Backward => "previous",
        }
    }
}

/// Chapters of one series, ordered newest-first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterList {
    chapters: Vec<Chapter>,
}

impl ChapterList {
    pub fn new(chapters: Vec<Chapter>) -> Self {
        Self { chapters }
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&Chapter> {
        self.chapters.get(position)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chapter> {
        self.chapters.iter()
    }

    pub fn position_of(&self, id: &ChapterId) -> Option<usize> {
        self.chapters.iter().position(|chapter| &chapter.id == id)
    }

    /// Position of the chapter that follows `position` in reading order.
    ///
    /// Reading forward moves towards newer chapters, which sit at lower
    /// positions, so the direction is subtracted.
    pub fn adjacent(&self, position: usize, direction: Direction) -> Option<usize> {
        let target = position as isize - direction.signum();
        if target < 0 || target as usize >= self.chapters.len() {
            None
        } else {
            Some(target as usize)
        }
    }

    /// The oldest chapter, where reading a series from scratch begins.
    pub fn first_in_reading_order(&self) -> Option<usize> {
        self.chapters.len().checked_sub(1)
    }
}

/// Resolves a chapter into its ordered page resources.
///
/// An empty list means the chapter has no pages or could not be resolved;
/// backends log their own failures.
pub trait PageSource: Send + Sync {
    fn name(&self) -> &str;
    fn fetch_pages(&self, chapter: &ChapterId) -> PageList;
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read manifest {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to decode TOML manifest {path:?}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to decode JSON manifest {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("manifest {path:?} lists chapter {id:?} more than once")]
    DuplicateChapter { path: PathBuf, id: String },
}

#[derive(Debug, Deserialize)]
struct Manifest {
    title: String,
    #[serde(default)]
    chapters: Vec<ManifestChapter>,
}

#[derive(Debug, Deserialize)]
struct ManifestChapter {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    pages: Vec<String>,
}

/// Page source backed by a manifest file describing a series.
///
/// The manifest is TOML unless the file ends in `.json`. Chapters are listed
/// newest-first. Page entries that are not URLs are treated as paths relative
/// to the manifest and turned into `file://` identifiers.
pub struct ManifestSource {
    title: String,
    chapters: ChapterList,
    pages: HashMap<ChapterId, PageList>,
}

impl ManifestSource {
    pub fn load(path: &Path) -> Result<Self, SourceError> {
        let raw = fs::read_to_string(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Manifest = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&raw).map_err(|source| SourceError::Json {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            toml::from_str(&raw).map_err(|source| SourceError::Toml {
                path: path.to_path_buf(),
                source,
            })?
        };

        let base = path
            .canonicalize()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        let mut chapters = Vec::with_capacity(manifest.chapters.len());
        let mut pages = HashMap::with_capacity(manifest.chapters.len());
        for entry in manifest.chapters {
            let id = ChapterId::new(entry.id);
            let resolved: Vec<String> = entry
                .pages
                .iter()
                .filter_map(|page| resolve_resource(&base, page))
                .collect();
            if pages.insert(id.clone(), PageList::new(resolved)).is_some() {
                return Err(SourceError::DuplicateChapter {
                    path: path.to_path_buf(),
                    id: id.0,
                });
            }
            chapters.push(Chapter {
                title: entry.title.unwrap_or_else(|| id.to_string()),
                id,
            });
        }

        debug!(title = %manifest.title, chapters = chapters.len(), "loaded manifest");
        Ok(Self {
            title: manifest.title,
            chapters: ChapterList::new(chapters),
            pages,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn chapters(&self) -> &ChapterList {
        &self.chapters
    }
}

fn resolve_resource(base: &Path, entry: &str) -> Option<String> {
    if let Ok(url) = Url::parse(entry) {
        return Some(url.into());
    }
    let path = base.join(entry);
    match Url::from_file_path(&path) {
        Ok(url) => Some(url.into()),
        Err(()) => {
            warn!(entry, "skipping page entry that is neither a URL nor a path");
            None
        }
    }
}

impl PageSource for ManifestSource {
    fn name(&self) -> &str {
        "manifest"
    }

    fn fetch_pages(&self, chapter: &ChapterId) -> PageList {
        match self.pages.get(chapter) {
            Some(pages) => pages.clone(),
            None => {
                warn!(%chapter, "chapter is not part of the manifest");
                PageList::empty()
            }
        }
    }
}

/// Fixed chapter-to-pages table, counting how often each chapter is resolved.
#[derive(Default)]
pub struct StaticPageSource {
    pages: HashMap<ChapterId, PageList>,
    calls: Mutex<HashMap<ChapterId, usize>>,
}

impl StaticPageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chapter<I, S>(mut self, chapter: &str, pages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pages = pages.into_iter().map(Into::into).collect::<Vec<_>>();
        self.pages.insert(ChapterId::new(chapter), PageList::new(pages));
        self
    }

    pub fn calls(&self, chapter: &ChapterId) -> usize {
        self.calls.lock().get(chapter).copied().unwrap_or(0)
    }
}

impl PageSource for StaticPageSource {
    fn name(&self) -> &str {
        "static"
    }

    fn fetch_pages(&self, chapter: &ChapterId) -> PageList {
        *self.calls.lock().entry(chapter.clone()).or_insert(0) += 1;
        self.pages.get(chapter).cloned().unwrap_or_else(PageList::empty)
    }
}
