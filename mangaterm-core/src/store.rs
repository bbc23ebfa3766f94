use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::CacheKey;
use crate::source::ChapterId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterProgress {
    pub page_index: usize,
    pub total_pages: usize,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRead {
    pub chapter: ChapterId,
    pub page_index: usize,
}

/// Where reading progress is persisted. Writes are idempotent.
pub trait ProgressStore: Send + Sync {
    fn record_position(&self, chapter: &ChapterId, page_index: usize, total_pages: usize)
        -> Result<()>;
    fn record_chapter_completed(&self, chapter: &ChapterId) -> Result<()>;
    fn chapter_progress(&self, chapter: &ChapterId) -> Result<Option<ChapterProgress>>;
    fn last_read(&self) -> Result<Option<LastRead>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProgressDocument {
    #[serde(default)]
    last_read: Option<LastRead>,
    #[serde(default)]
    chapters: BTreeMap<ChapterId, ChapterProgress>,
}

impl ProgressDocument {
    fn record_position(&mut self, chapter: &ChapterId, page_index: usize, total_pages: usize) {
        let entry = self.chapters.entry(chapter.clone()).or_default();
        entry.page_index = page_index;
        entry.total_pages = total_pages;
        self.last_read = Some(LastRead {
            chapter: chapter.clone(),
            page_index,
        });
    }

    fn record_completed(&mut self, chapter: &ChapterId) -> bool {
        let entry = self.chapters.entry(chapter.clone()).or_default();
        let changed = !entry.completed;
        entry.completed = true;
        changed
    }
}

/// JSON document per series, rewritten atomically by a background writer.
///
/// Updates touch only the in-memory document and wake the writer, so callers
/// on the interaction thread never wait on the disk. Bursts of updates
/// coalesce into one write of the latest document.
pub struct FileProgressStore {
    shared: Arc<Shared>,
    writer: Option<JoinHandle<()>>,
}

struct Shared {
    path: PathBuf,
    document: Mutex<ProgressDocument>,
    state: Mutex<WriterState>,
    changed: Condvar,
    /// Held while the progress file is being replaced.
    file: Mutex<()>,
}

#[derive(Default)]
struct WriterState {
    requested: u64,
    written: u64,
    shutdown: bool,
}

impl FileProgressStore {
    pub fn open(root: &Path, series: &str) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        let key = CacheKey::for_resource(series);
        let path = root.join(format!("{}.json", &key.as_str()[..16]));
        let document = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to open progress file {:?}", path))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to decode progress file {:?}", path))?
        } else {
            ProgressDocument::default()
        };
        let shared = Arc::new(Shared {
            path,
            document: Mutex::new(document),
            state: Mutex::new(WriterState::default()),
            changed: Condvar::new(),
            file: Mutex::new(()),
        });
        let writer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("progress-writer".into())
                .spawn(move || shared.run_writer())
                .context("failed to spawn progress writer thread")?
        };
        Ok(Self {
            shared,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Blocks until every update made so far has been written out.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        while state.written < state.requested {
            self.shared.changed.wait(&mut state);
        }
    }

    fn request_save(&self) {
        let mut state = self.shared.state.lock();
        state.requested += 1;
        self.shared.changed.notify_all();
    }
}

impl Shared {
    fn run_writer(&self) {
        loop {
            let target = {
                let mut state = self.state.lock();
                while state.written == state.requested && !state.shutdown {
                    self.changed.wait(&mut state);
                }
                if state.written == state.requested {
                    return;
                }
                state.requested
            };
            let snapshot = self.document.lock().clone();
            if let Err(err) = self.save(&snapshot) {
                warn!(path = ?self.path, error = %err, "failed to write reading progress");
            }
            let mut state = self.state.lock();
            state.written = target;
            self.changed.notify_all();
        }
    }

    fn save(&self, document: &ProgressDocument) -> Result<()> {
        let _file = self.file.lock();
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(document)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp progress file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace progress file {:?}", self.path))?;
        debug!(path = ?self.path, "saved reading progress");
        Ok(())
    }
}

impl Drop for FileProgressStore {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.changed.notify_all();
        }
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!(path = ?self.shared.path, "progress writer panicked");
            }
        }
    }
}

impl ProgressStore for FileProgressStore {
    fn record_position(
        &self,
        chapter: &ChapterId,
        page_index: usize,
        total_pages: usize,
    ) -> Result<()> {
        self.shared
            .document
            .lock()
            .record_position(chapter, page_index, total_pages);
        self.request_save();
        Ok(())
    }

    fn record_chapter_completed(&self, chapter: &ChapterId) -> Result<()> {
        let changed = self.shared.document.lock().record_completed(chapter);
        if changed {
            self.request_save();
        }
        Ok(())
    }

    fn chapter_progress(&self, chapter: &ChapterId) -> Result<Option<ChapterProgress>> {
        Ok(self.shared.document.lock().chapters.get(chapter).cloned())
    }

    fn last_read(&self) -> Result<Option<LastRead>> {
        Ok(self.shared.document.lock().last_read.clone())
    }
}

#[derive(Default)]
pub struct MemoryProgressStore {
    inner: Mutex<ProgressDocument>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn record_position(
        &self,
        chapter: &ChapterId,
        page_index: usize,
        total_pages: usize,
    ) -> Result<()> {
        self.inner
            .lock()
            .record_position(chapter, page_index, total_pages);
        Ok(())
    }

    fn record_chapter_completed(&self, chapter: &ChapterId) -> Result<()> {
        self.inner.lock().record_completed(chapter);
        Ok(())
    }

    fn chapter_progress(&self, chapter: &ChapterId) -> Result<Option<ChapterProgress>> {
        Ok(self.inner.lock().chapters.get(chapter).cloned())
    }

    fn last_read(&self) -> Result<Option<LastRead>> {
        Ok(self.inner.lock().last_read.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_store_restores_progress_after_reopen() {
        let dir = tempdir().unwrap();
        let chapter = ChapterId::new("ch-12");
        {
            let store = FileProgressStore::open(dir.path(), "Some Series").unwrap();
            store.record_position(&chapter, 4, 20).unwrap();
            store.record_position(&chapter, 19, 20).unwrap();
            store.record_chapter_completed(&chapter).unwrap();
            store.record_chapter_completed(&chapter).unwrap();
        }

        let store = FileProgressStore::open(dir.path(), "Some Series").unwrap();
        assert_eq!(
            store.chapter_progress(&chapter).unwrap(),
            Some(ChapterProgress {
                page_index: 19,
                total_pages: 20,
                completed: true,
            })
        );
        assert_eq!(
            store.last_read().unwrap(),
            Some(LastRead {
                chapter: chapter.clone(),
                page_index: 19,
            })
        );
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn recording_does_not_wait_for_the_file_write() {
        let dir = tempdir().unwrap();
        let chapter = ChapterId::new("ch-3");
        let store = FileProgressStore::open(dir.path(), "Slow Disk").unwrap();

        let busy = store.shared.file.lock();
        store.record_position(&chapter, 2, 10).unwrap();
        store.record_position(&chapter, 3, 10).unwrap();
        assert!(!store.path().exists());
        assert_eq!(store.chapter_progress(&chapter).unwrap().unwrap().page_index, 3);
        drop(busy);

        store.flush();
        let raw = fs::read_to_string(store.path()).unwrap();
        let saved: ProgressDocument = serde_json::from_str(&raw).unwrap();
        assert_eq!(saved.chapters[&chapter].page_index, 3);
    }

    #[test]
    fn series_get_separate_files() {
        let dir = tempdir().unwrap();
        let first = FileProgressStore::open(dir.path(), "First").unwrap();
        let second = FileProgressStore::open(dir.path(), "Second").unwrap();
        assert_ne!(first.path(), second.path());

        first.record_position(&ChapterId::new("a"), 1, 2).unwrap();
        assert!(second.last_read().unwrap().is_none());
    }

    #[test]
    fn memory_store_marks_completion_idempotently() {
        let store = MemoryProgressStore::new();
        let chapter = ChapterId::new("x");
        store.record_chapter_completed(&chapter).unwrap();
        store.record_chapter_completed(&chapter).unwrap();
        assert!(store.chapter_progress(&chapter).unwrap().unwrap().completed);
    }
}
