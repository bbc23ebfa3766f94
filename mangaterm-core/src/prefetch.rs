use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheKey, ContentCache};
use crate::fetch::{FetchError, Fetcher};
use crate::mailbox::{Mailbox, PrefetchEvent, SessionId};
use crate::progress::PrefetchProgress;
use crate::source::{ChapterId, PageList, PageSource};

#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchConfig {
    /// Upper bound on simultaneous page downloads.
    pub concurrency: usize,
    /// Fetch attempts per page before it is given up on.
    pub max_attempts: u32,
    /// Delay before the second attempt; grows linearly afterwards.
    pub retry_backoff: Duration,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Launches one background prefetch per opened chapter.
pub struct PrefetchCoordinator {
    source: Arc<dyn PageSource>,
    cache: Arc<dyn ContentCache>,
    fetcher: Arc<dyn Fetcher>,
    mailbox: Mailbox,
    config: PrefetchConfig,
    next_session: AtomicU64,
}

impl PrefetchCoordinator {
    pub fn new(
        source: Arc<dyn PageSource>,
        cache: Arc<dyn ContentCache>,
        fetcher: Arc<dyn Fetcher>,
        mailbox: Mailbox,
        config: PrefetchConfig,
    ) -> Self {
        Self {
            source,
            cache,
            fetcher,
            mailbox,
            config,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn cache(&self) -> Arc<dyn ContentCache> {
        Arc::clone(&self.cache)
    }

    /// Starts resolving and downloading `chapter` on a new thread.
    ///
    /// Returns immediately. The page list arrives through the mailbox as
    /// [`PrefetchEvent::PagesReady`] (or [`PrefetchEvent::NoPages`]) before
    /// any download has necessarily finished.
    #[instrument(skip(self), fields(source = self.source.name()))]
    pub fn start(&self, chapter: ChapterId) -> Result<PrefetchHandle> {
        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let progress = Arc::new(PrefetchProgress::new());
        let task = ChapterPrefetch {
            session,
            chapter: chapter.clone(),
            source: Arc::clone(&self.source),
            worker: PageWorker {
                session,
                cache: Arc::clone(&self.cache),
                fetcher: Arc::clone(&self.fetcher),
                mailbox: self.mailbox.clone(),
                progress: Arc::clone(&progress),
                max_attempts: self.config.max_attempts.max(1),
                retry_backoff: self.config.retry_backoff,
            },
            concurrency: self.config.concurrency.max(1),
        };

        let thread = thread::Builder::new()
            .name(format!("prefetch-{}", session.0))
            .spawn(move || task.run())
            .with_context(|| format!("failed to spawn prefetch thread for {}", chapter))?;

        info!(%chapter, session = session.0, "prefetch started");
        Ok(PrefetchHandle {
            session,
            chapter,
            progress,
            thread: Some(thread),
        })
    }
}

/// Owner-side view of a running chapter prefetch.
///
/// Dropping the handle behaves like [`PrefetchHandle::teardown`].
pub struct PrefetchHandle {
    session: SessionId,
    chapter: ChapterId,
    progress: Arc<PrefetchProgress>,
    thread: Option<JoinHandle<()>>,
}

impl PrefetchHandle {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn chapter(&self) -> &ChapterId {
        &self.chapter
    }

    pub fn progress(&self) -> &Arc<PrefetchProgress> {
        &self.progress
    }

    /// Raises the cancellation flag. Never blocks: downloads already in
    /// flight finish on their own and queued ones are skipped.
    pub fn cancel(&self) {
        if self.progress.cancel() {
            info!(chapter = %self.chapter, session = self.session.0, "prefetch cancelled");
        }
    }

    /// Cancels and hands the join of the prefetch thread to a reaper thread.
    ///
    /// The returned handle belongs to the reaper; callers on the interaction
    /// thread should drop it rather than join it.
    pub fn teardown(mut self) -> Option<JoinHandle<()>> {
        self.cancel();
        self.thread.take().and_then(reap)
    }
}

impl Drop for PrefetchHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.cancel();
            let _ = reap(thread);
        }
    }
}

fn reap(thread: JoinHandle<()>) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("prefetch-reaper".into())
        .spawn(move || {
            if thread.join().is_err() {
                warn!("prefetch thread panicked");
            }
        });
    match spawned {
        Ok(reaper) => Some(reaper),
        Err(err) => {
            warn!(?err, "failed to spawn reaper; prefetch thread left detached");
            None
        }
    }
}

struct ChapterPrefetch {
    session: SessionId,
    chapter: ChapterId,
    source: Arc<dyn PageSource>,
    worker: PageWorker,
    concurrency: usize,
}

impl ChapterPrefetch {
    fn run(self) {
        let progress = Arc::clone(&self.worker.progress);
        let pages = self.source.fetch_pages(&self.chapter);
        if progress.is_cancelled() {
            debug!(chapter = %self.chapter, "cancelled while resolving pages");
            return;
        }

        if pages.is_empty() {
            warn!(chapter = %self.chapter, "no pages found");
            self.worker.mailbox.post(PrefetchEvent::NoPages {
                session: self.session,
                chapter: self.chapter,
            });
            return;
        }

        progress.set_total(pages.len());
        self.worker.mailbox.post(PrefetchEvent::PagesReady {
            session: self.session,
            chapter: self.chapter.clone(),
            pages: pages.clone(),
        });

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency)
            .thread_name(|i| format!("page-download-{i}"))
            .build()
        {
            Ok(pool) => pool,
            Err(err) => {
                warn!(?err, chapter = %self.chapter, "failed to build download pool");
                return;
            }
        };

        self.download_all(&pool, &pages);

        let snapshot = progress.snapshot();
        info!(
            chapter = %self.chapter,
            done = snapshot.done,
            total = snapshot.total,
            cancelled = snapshot.cancelled,
            "prefetch finished"
        );
    }

    fn download_all(&self, pool: &rayon::ThreadPool, pages: &PageList) {
        let worker = &self.worker;
        pool.scope(|scope| {
            for (index, resource) in pages.iter().enumerate() {
                if worker.progress.is_cancelled() {
                    break;
                }
                let key = CacheKey::for_resource(resource);
                if worker.cache.has(&key) {
                    worker.progress.record_done();
                    continue;
                }
                scope.spawn(move |_| worker.download(index, resource, key));
            }
        });
    }
}

struct PageWorker {
    session: SessionId,
    cache: Arc<dyn ContentCache>,
    fetcher: Arc<dyn Fetcher>,
    mailbox: Mailbox,
    progress: Arc<PrefetchProgress>,
    max_attempts: u32,
    retry_backoff: Duration,
}

enum Attempt {
    Fetched(Bytes),
    Cancelled,
    Failed(FetchError),
}

impl PageWorker {
    fn download(&self, index: usize, resource: &str, key: CacheKey) {
        // Tasks still queued when cancellation lands are skipped uncounted.
        if self.progress.is_cancelled() {
            return;
        }

        if !self.cache.has(&key) {
            match self.fetch_with_retry(resource) {
                Attempt::Fetched(bytes) => self.store(index, &key, &bytes),
                Attempt::Cancelled => debug!(index, "page download abandoned after cancellation"),
                Attempt::Failed(err) => warn!(index, %err, "page download failed"),
            }
        }

        self.progress.record_done();
    }

    fn fetch_with_retry(&self, resource: &str) -> Attempt {
        let mut attempt = 1;
        loop {
            match self.fetcher.fetch(resource) {
                Ok(bytes) => return Attempt::Fetched(bytes),
                Err(err) if attempt >= self.max_attempts => return Attempt::Failed(err),
                Err(err) => {
                    debug!(attempt, max = self.max_attempts, %err, "retrying page download");
                    thread::sleep(backoff_delay(self.retry_backoff, attempt));
                    attempt += 1;
                    if self.progress.is_cancelled() {
                        return Attempt::Cancelled;
                    }
                }
            }
        }
    }

    fn store(&self, index: usize, key: &CacheKey, bytes: &[u8]) {
        if self.progress.is_cancelled() {
            debug!(index, "discarding page fetched after cancellation");
            return;
        }
        match self.cache.put(key, bytes) {
            Ok(()) => self.mailbox.post(PrefetchEvent::PageCached {
                session: self.session,
                index,
            }),
            Err(err) => warn!(index, %err, "failed to cache page"),
        }
    }
}

/// Linear backoff before retry number `attempt`, saturating instead of overflowing.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.checked_mul(attempt).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use parking_lot::{Condvar, Mutex};

    use crate::cache::MemoryCache;
    use crate::source::StaticPageSource;

    /// Serves `bytes:<url>` and counts calls; can be held shut until released.
    #[derive(Default)]
    struct ScriptedFetcher {
        calls: Mutex<HashMap<String, usize>>,
        total_calls: AtomicUsize,
        failing: Mutex<HashMap<String, usize>>,
        gate: Mutex<bool>,
        opened: Condvar,
        started: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn open() -> Arc<Self> {
            let fetcher = Self::default();
            *fetcher.gate.lock() = true;
            Arc::new(fetcher)
        }

        fn gated() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn fail_times(self: &Arc<Self>, url: &str, times: usize) {
            self.failing.lock().insert(url.to_owned(), times);
        }

        fn release(&self) {
            *self.gate.lock() = true;
            self.opened.notify_all();
        }

        fn calls(&self, url: &str) -> usize {
            self.calls.lock().get(url).copied().unwrap_or(0)
        }

        fn total_calls(&self) -> usize {
            self.total_calls.load(Ordering::SeqCst)
        }
    }

    impl Fetcher for ScriptedFetcher {
        fn fetch(&self, resource: &str) -> Result<Bytes, FetchError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            {
                let mut open = self.gate.lock();
                while !*open {
                    self.opened.wait(&mut open);
                }
            }
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            *self.calls.lock().entry(resource.to_owned()).or_insert(0) += 1;

            let mut failing = self.failing.lock();
            if let Some(remaining) = failing.get_mut(resource) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(FetchError::Status {
                        url: resource.to_owned(),
                        status: 503,
                    });
                }
            }
            Ok(Bytes::from(format!("bytes:{resource}")))
        }
    }

    fn quick_config() -> PrefetchConfig {
        PrefetchConfig {
            retry_backoff: Duration::from_millis(1),
            ..PrefetchConfig::default()
        }
    }

    fn coordinator(
        source: StaticPageSource,
        cache: Arc<MemoryCache>,
        fetcher: Arc<ScriptedFetcher>,
        config: PrefetchConfig,
    ) -> (PrefetchCoordinator, Mailbox) {
        let mailbox = Mailbox::new();
        let coordinator = PrefetchCoordinator::new(
            Arc::new(source),
            cache,
            fetcher,
            mailbox.clone(),
            config,
        );
        (coordinator, mailbox)
    }

    /// Joins the prefetch thread without cancelling it.
    fn wait_for_finish(mut handle: PrefetchHandle) {
        if let Some(thread) = handle.thread.take() {
            thread.join().unwrap();
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn pages(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://cdn.example.com/{i}.jpg")).collect()
    }

    #[test]
    fn downloads_every_page_into_the_cache() {
        let urls = pages(9);
        let cache = Arc::new(MemoryCache::new());
        let fetcher = ScriptedFetcher::open();
        let (coordinator, mailbox) = coordinator(
            StaticPageSource::new().with_chapter("c", urls.clone()),
            Arc::clone(&cache),
            Arc::clone(&fetcher),
            quick_config(),
        );

        let handle = coordinator.start(ChapterId::new("c")).unwrap();
        let progress = Arc::clone(handle.progress());
        wait_until(|| progress.snapshot().is_complete());

        assert_eq!(progress.done(), 9);
        assert_eq!(progress.total(), 9);
        for url in &urls {
            assert!(cache.has(&CacheKey::for_resource(url)));
        }

        let cached: Vec<_> = mailbox
            .drain()
            .into_iter()
            .filter(|event| matches!(event, PrefetchEvent::PageCached { .. }))
            .collect();
        assert_eq!(cached.len(), 9);
        wait_for_finish(handle);
    }

    #[test]
    fn pages_are_reported_before_any_download_finishes() {
        let cache = Arc::new(MemoryCache::new());
        let fetcher = ScriptedFetcher::gated();
        let (coordinator, mailbox) = coordinator(
            StaticPageSource::new().with_chapter("c", ["A", "B", "C"]),
            Arc::clone(&cache),
            Arc::clone(&fetcher),
            quick_config(),
        );

        let handle = coordinator.start(ChapterId::new("c")).unwrap();
        let events = mailbox.wait(Duration::from_secs(10));
        match &events[0] {
            PrefetchEvent::PagesReady { pages, session, .. } => {
                assert_eq!(pages.len(), 3);
                assert_eq!(*session, handle.session());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(handle.chapter(), &ChapterId::new("c"));
        assert_eq!(handle.progress().total(), 3);
        assert_eq!(handle.progress().done(), 0);
        assert!(cache.is_empty());

        fetcher.release();
        let progress = Arc::clone(handle.progress());
        wait_until(|| progress.snapshot().is_complete());
        wait_for_finish(handle);
    }

    #[test]
    fn empty_page_list_reports_no_pages_without_downloading() {
        let fetcher = ScriptedFetcher::open();
        let (coordinator, mailbox) = coordinator(
            StaticPageSource::new(),
            Arc::new(MemoryCache::new()),
            Arc::clone(&fetcher),
            quick_config(),
        );

        let handle = coordinator.start(ChapterId::new("missing")).unwrap();
        let events = mailbox.wait(Duration::from_secs(10));
        assert!(matches!(events[0], PrefetchEvent::NoPages { .. }));
        wait_for_finish(handle);
        assert_eq!(fetcher.total_calls(), 0);
    }

    #[test]
    fn cached_pages_are_counted_without_fetching() {
        let urls = pages(3);
        let cache = Arc::new(MemoryCache::new());
        for url in &urls {
            cache.put(&CacheKey::for_resource(url), b"already").unwrap();
        }
        let fetcher = ScriptedFetcher::open();
        let (coordinator, _mailbox) = coordinator(
            StaticPageSource::new().with_chapter("c", urls),
            cache,
            Arc::clone(&fetcher),
            quick_config(),
        );

        let handle = coordinator.start(ChapterId::new("c")).unwrap();
        let progress = Arc::clone(handle.progress());
        wait_for_finish(handle);
        assert_eq!(progress.done(), 3);
        assert_eq!(fetcher.total_calls(), 0);
    }

    #[test]
    fn transient_failures_are_retried() {
        let urls = pages(2);
        let cache = Arc::new(MemoryCache::new());
        let fetcher = ScriptedFetcher::open();
        fetcher.fail_times(&urls[0], 2);
        let (coordinator, _mailbox) = coordinator(
            StaticPageSource::new().with_chapter("c", urls.clone()),
            Arc::clone(&cache),
            Arc::clone(&fetcher),
            quick_config(),
        );

        let handle = coordinator.start(ChapterId::new("c")).unwrap();
        let progress = Arc::clone(handle.progress());
        wait_for_finish(handle);

        assert_eq!(fetcher.calls(&urls[0]), 3);
        assert!(cache.has(&CacheKey::for_resource(&urls[0])));
        assert_eq!(progress.done(), 2);
    }

    #[test]
    fn permanent_failure_still_counts_as_done() {
        let urls = pages(2);
        let cache = Arc::new(MemoryCache::new());
        let fetcher = ScriptedFetcher::open();
        fetcher.fail_times(&urls[1], usize::MAX);
        let (coordinator, _mailbox) = coordinator(
            StaticPageSource::new().with_chapter("c", urls.clone()),
            Arc::clone(&cache),
            Arc::clone(&fetcher),
            quick_config(),
        );

        let handle = coordinator.start(ChapterId::new("c")).unwrap();
        let progress = Arc::clone(handle.progress());
        wait_for_finish(handle);

        assert_eq!(progress.done(), 2);
        assert_eq!(fetcher.calls(&urls[1]), 3);
        assert!(!cache.has(&CacheKey::for_resource(&urls[1])));
    }

    #[test]
    fn cancellation_stops_new_fetches_and_bounds_done() {
        let urls = pages(40);
        let cache = Arc::new(MemoryCache::new());
        let fetcher = ScriptedFetcher::gated();
        let config = quick_config();
        let concurrency = config.concurrency;
        let (coordinator, _mailbox) = coordinator(
            StaticPageSource::new().with_chapter("c", urls),
            Arc::clone(&cache),
            Arc::clone(&fetcher),
            config,
        );

        let handle = coordinator.start(ChapterId::new("c")).unwrap();
        wait_until(|| fetcher.started.load(Ordering::SeqCst) == concurrency);
        handle.cancel();
        let progress = Arc::clone(handle.progress());
        fetcher.release();
        wait_for_finish(handle);

        let snapshot = progress.snapshot();
        assert!(snapshot.cancelled);
        assert!(snapshot.done <= concurrency);
        assert_eq!(fetcher.total_calls(), concurrency);
        assert!(cache.is_empty());
    }

    #[test]
    fn teardown_returns_without_waiting_for_downloads() {
        let fetcher = ScriptedFetcher::gated();
        let (coordinator, _mailbox) = coordinator(
            StaticPageSource::new().with_chapter("c", pages(8)),
            Arc::new(MemoryCache::new()),
            Arc::clone(&fetcher),
            quick_config(),
        );

        let handle = coordinator.start(ChapterId::new("c")).unwrap();
        wait_until(|| fetcher.started.load(Ordering::SeqCst) > 0);

        let started = Instant::now();
        let reaper = handle.teardown();
        assert!(started.elapsed() < Duration::from_secs(1));

        fetcher.release();
        if let Some(reaper) = reaper {
            reaper.join().unwrap();
        }
    }

    #[test]
    fn backoff_grows_linearly_and_saturates() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(1));
        assert_eq!(backoff_delay(Duration::MAX, 2), Duration::MAX);
        assert_eq!(
            backoff_delay(Duration::from_millis(u64::MAX), 3),
            Duration::MAX
        );
    }

    #[test]
    fn sessions_get_distinct_ids() {
        let (coordinator, _mailbox) = coordinator(
            StaticPageSource::new(),
            Arc::new(MemoryCache::new()),
            ScriptedFetcher::open(),
            quick_config(),
        );
        let first = coordinator.start(ChapterId::new("a")).unwrap();
        let second = coordinator.start(ChapterId::new("b")).unwrap();
        assert_ne!(first.session(), second.session());
        wait_for_finish(first);
        wait_for_finish(second);
    }
}
