use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheKey, ContentCache};
use crate::mailbox::{PrefetchEvent, SessionId};
use crate::source::{Chapter, ChapterId, ChapterList, Direction, PageList};
use crate::store::ProgressStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    #[default]
    Screen,
    Width,
    Height,
}

impl FitMode {
    pub fn cycled(self) -> Self {
        match self {
            FitMode::Screen => FitMode::Width,
            FitMode::Width => FitMode::Height,
            FitMode::Height => FitMode::Screen,
        }
    }

    /// Maximum render size for a viewport; 0 leaves that axis unconstrained.
    pub fn bounds(self, width: u32, height: u32) -> (u32, u32) {
        match self {
            FitMode::Screen => (width, height),
            FitMode::Width => (width, 0),
            FitMode::Height => (0, height),
        }
    }
}

impl fmt::Display for FitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FitMode::Screen => "fit screen",
            FitMode::Width => "fit width",
            FitMode::Height => "fit height",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Upright,
    Quarter,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Upright => 0,
            Rotation::Quarter => 90,
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Rotation::Upright => Rotation::Quarter,
            Rotation::Quarter => Rotation::Upright,
        }
    }
}

/// Page to land on once the page list is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPage {
    Index(usize),
    Last,
}

impl Default for StartPage {
    fn default() -> Self {
        StartPage::Index(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Loading,
    NoPages,
    Waiting(usize),
    Displaying(usize),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterTarget {
    pub position: usize,
    pub chapter: Chapter,
    pub start: StartPage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    /// No chapter beyond this one; confirm leaves the reader, dismiss stays.
    Boundary { direction: Direction, message: String },
    /// Offer to continue into the adjacent chapter.
    ConfirmAdvance { target: ChapterTarget, message: String },
    Error { message: String },
}

impl Prompt {
    pub fn message(&self) -> &str {
        match self {
            Prompt::Boundary { message, .. }
            | Prompt::ConfirmAdvance { message, .. }
            | Prompt::Error { message } => message,
        }
    }

    /// Labels for the (confirm, dismiss) choices.
    pub fn choices(&self) -> (&'static str, &'static str) {
        match self {
            Prompt::Boundary { .. } => ("Back", "Stay"),
            Prompt::ConfirmAdvance { .. } => ("Yes", "No"),
            Prompt::Error { .. } => ("OK", "OK"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderState {
    pub chapter: ChapterId,
    pub page_index: usize,
    pub rotation: Rotation,
    pub fit_mode: FitMode,
    pub toolbar_visible: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    NextPage,
    PrevPage,
    JumpTo { page: usize },
    LastPage,
    ToggleRotation,
    CycleFitMode,
    ToggleToolbar,
    Confirm,
    Dismiss,
    Back,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    RedrawNeeded,
    OpenChapter(ChapterTarget),
    ExitRequested,
}

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub start: StartPage,
    pub fit_mode: FitMode,
    pub poll_interval: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            start: StartPage::default(),
            fit_mode: FitMode::default(),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Navigation state machine for one open chapter.
///
/// Lives on the interaction thread. Page readiness is decided solely by the
/// content cache: a page is displayed once its key is present, either when a
/// `PageCached` event arrives or when the fallback poll in [`tick`] finds it.
///
/// [`tick`]: ReaderSession::tick
pub struct ReaderSession {
    session: SessionId,
    state: ReaderState,
    start: StartPage,
    phase: Phase,
    prompt: Option<Prompt>,
    pages: Option<PageList>,
    chapters: Arc<ChapterList>,
    cache: Arc<dyn ContentCache>,
    store: Arc<dyn ProgressStore>,
    poll_interval: Duration,
    last_poll: Option<Instant>,
    completion_recorded: bool,
    events: Vec<SessionEvent>,
}

impl ReaderSession {
    pub fn new(
        session: SessionId,
        chapter: ChapterId,
        chapters: Arc<ChapterList>,
        cache: Arc<dyn ContentCache>,
        store: Arc<dyn ProgressStore>,
        options: ReaderOptions,
    ) -> Self {
        Self {
            session,
            state: ReaderState {
                chapter,
                page_index: 0,
                rotation: Rotation::Upright,
                fit_mode: options.fit_mode,
                toolbar_visible: true,
            },
            start: options.start,
            phase: Phase::Loading,
            prompt: None,
            pages: None,
            chapters,
            cache,
            store,
            poll_interval: options.poll_interval,
            last_poll: None,
            completion_recorded: false,
            events: Vec::new(),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn state(&self) -> &ReaderState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn prompt(&self) -> Option<&Prompt> {
        self.prompt.as_ref()
    }

    pub fn pages(&self) -> Option<&PageList> {
        self.pages.as_ref()
    }

    pub fn total_pages(&self) -> Option<usize> {
        self.pages.as_ref().map(|pages| pages.len())
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Resource currently shown or waited for.
    pub fn current_resource(&self) -> Option<&str> {
        match self.phase {
            Phase::Waiting(index) | Phase::Displaying(index) => {
                self.pages.as_ref()?.get(index).map(String::as_str)
            }
            _ => None,
        }
    }

    pub fn chapter_title(&self) -> Option<&str> {
        let position = self.chapters.position_of(&self.state.chapter)?;
        self.chapters.get(position).map(|chapter| chapter.title.as_str())
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn on_prefetch_event(&mut self, event: &PrefetchEvent) {
        if event.session() != self.session || self.phase == Phase::Closed {
            return;
        }
        match event {
            PrefetchEvent::PagesReady { pages, .. } => self.pages_ready(pages.clone()),
            PrefetchEvent::NoPages { .. } => {
                if self.phase == Phase::Loading {
                    self.phase = Phase::NoPages;
                    self.redraw();
                }
            }
            PrefetchEvent::PageCached { index, .. } => {
                if self.phase == Phase::Waiting(*index) {
                    self.recheck_waiting();
                }
            }
        }
    }

    /// Fallback readiness poll; returns true if a waiting page became visible.
    pub fn tick(&mut self, now: Instant) -> bool {
        if !matches!(self.phase, Phase::Waiting(_)) {
            return false;
        }
        if let Some(last) = self.last_poll {
            if now.saturating_duration_since(last) < self.poll_interval {
                return false;
            }
        }
        self.last_poll = Some(now);
        self.recheck_waiting()
    }

    pub fn apply(&mut self, command: Command) {
        if self.phase == Phase::Closed {
            return;
        }

        if self.prompt.is_some() {
            match command {
                Command::Confirm => self.confirm_prompt(),
                Command::Dismiss => self.dismiss_prompt(),
                Command::Back => self.events.push(SessionEvent::ExitRequested),
                other => debug!(command = ?other, "ignored while a prompt is shown"),
            }
            return;
        }

        match command {
            Command::NextPage => self.next(),
            Command::PrevPage => self.previous(),
            Command::JumpTo { page } => self.jump_to(page),
            Command::LastPage => {
                if let Some(last) = self.pages.as_ref().and_then(PageList::last_index) {
                    self.jump_to(last);
                }
            }
            Command::ToggleRotation => {
                self.state.rotation = self.state.rotation.toggled();
                self.redraw();
            }
            Command::CycleFitMode => {
                self.state.fit_mode = self.state.fit_mode.cycled();
                self.redraw();
            }
            Command::ToggleToolbar => {
                self.state.toolbar_visible = !self.state.toolbar_visible;
                self.redraw();
            }
            Command::Confirm | Command::Dismiss => {}
            Command::Back => self.events.push(SessionEvent::ExitRequested),
        }
    }

    /// Shows a dismissible error, e.g. when a cached page cannot be decoded.
    pub fn report_error(&mut self, message: impl Into<String>) {
        self.prompt = Some(Prompt::Error {
            message: message.into(),
        });
        self.redraw();
    }

    pub fn close(&mut self) {
        self.phase = Phase::Closed;
        self.prompt = None;
        self.events.clear();
    }

    fn pages_ready(&mut self, pages: PageList) {
        if self.phase != Phase::Loading {
            return;
        }
        let Some(last) = pages.last_index() else {
            self.phase = Phase::NoPages;
            self.redraw();
            return;
        };
        let index = match self.start {
            StartPage::Last => last,
            StartPage::Index(index) if index > last => 0,
            StartPage::Index(index) => index,
        };
        self.pages = Some(pages);
        self.show_page(index);
    }

    fn next(&mut self) {
        let Some(total) = self.total_pages() else {
            return;
        };
        if !self.navigable() {
            return;
        }
        if self.state.page_index + 1 < total {
            self.navigate_to(self.state.page_index + 1);
        } else {
            self.request_chapter(Direction::Forward);
        }
    }

    fn previous(&mut self) {
        if self.pages.is_none() || !self.navigable() {
            return;
        }
        if self.state.page_index > 0 {
            self.navigate_to(self.state.page_index - 1);
        } else {
            self.request_chapter(Direction::Backward);
        }
    }

    fn jump_to(&mut self, page: usize) {
        let Some(last) = self.pages.as_ref().and_then(PageList::last_index) else {
            return;
        };
        if !self.navigable() {
            return;
        }
        let target = page.min(last);
        if target != self.state.page_index {
            self.navigate_to(target);
        }
    }

    fn navigable(&self) -> bool {
        matches!(self.phase, Phase::Waiting(_) | Phase::Displaying(_))
    }

    fn navigate_to(&mut self, index: usize) {
        self.state.rotation = Rotation::Upright;
        self.show_page(index);
    }

    fn show_page(&mut self, index: usize) {
        self.state.page_index = index;
        if self.is_cached(index) {
            self.enter_displaying(index);
        } else {
            debug!(index, "page not cached yet, waiting");
            self.phase = Phase::Waiting(index);
            self.last_poll = Some(Instant::now());
            self.redraw();
        }
    }

    fn recheck_waiting(&mut self) -> bool {
        let Phase::Waiting(index) = self.phase else {
            return false;
        };
        if self.is_cached(index) {
            self.enter_displaying(index);
            true
        } else {
            false
        }
    }

    fn is_cached(&self, index: usize) -> bool {
        self.pages
            .as_ref()
            .and_then(|pages| pages.get(index))
            .is_some_and(|resource| self.cache.has(&CacheKey::for_resource(resource)))
    }

    fn enter_displaying(&mut self, index: usize) {
        let total = self.total_pages().unwrap_or(0);
        self.phase = Phase::Displaying(index);

        if let Err(err) = self
            .store
            .record_position(&self.state.chapter, index, total)
        {
            warn!(?err, chapter = %self.state.chapter, "failed to record reading position");
        }

        if index + 1 == total && !self.completion_recorded {
            self.completion_recorded = true;
            if let Err(err) = self.store.record_chapter_completed(&self.state.chapter) {
                warn!(?err, chapter = %self.state.chapter, "failed to record chapter completion");
            }
        }

        self.redraw();
    }

    fn request_chapter(&mut self, direction: Direction) {
        let target = self
            .chapters
            .position_of(&self.state.chapter)
            .and_then(|position| self.chapters.adjacent(position, direction))
            .and_then(|position| {
                self.chapters.get(position).map(|chapter| ChapterTarget {
                    position,
                    chapter: chapter.clone(),
                    start: match direction {
                        Direction::Forward => StartPage::Index(0),
                        Direction::Backward => StartPage::Last,
                    },
                })
            });

        self.prompt = Some(match target {
            Some(target) => Prompt::ConfirmAdvance {
                message: format!(
                    "Continue to {} chapter?\n{}",
                    direction.label(),
                    target.chapter.title
                ),
                target,
            },
            None => Prompt::Boundary {
                direction,
                message: match direction {
                    Direction::Forward => "You've reached the last chapter.".to_owned(),
                    Direction::Backward => "You're at the first chapter.".to_owned(),
                },
            },
        });
        self.redraw();
    }

    fn confirm_prompt(&mut self) {
        match self.prompt.take() {
            Some(Prompt::ConfirmAdvance { target, .. }) => {
                self.events.push(SessionEvent::OpenChapter(target));
            }
            Some(Prompt::Boundary { .. }) => self.events.push(SessionEvent::ExitRequested),
            Some(Prompt::Error { .. }) | None => {}
        }
        self.redraw();
    }

    fn dismiss_prompt(&mut self) {
        if self.prompt.take().is_some() {
            self.redraw();
        }
    }

    fn redraw(&mut self) {
        if self.events.last() != Some(&SessionEvent::RedrawNeeded) {
            self.events.push(SessionEvent::RedrawNeeded);
        }
    }
}
