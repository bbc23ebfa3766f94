use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::source::{ChapterId, PageList};

/// Identifies one chapter prefetch so late events from a torn-down chapter
/// can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Data posted from background threads to the interaction loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefetchEvent {
    PagesReady {
        session: SessionId,
        chapter: ChapterId,
        pages: PageList,
    },
    NoPages {
        session: SessionId,
        chapter: ChapterId,
    },
    PageCached {
        session: SessionId,
        index: usize,
    },
}

impl PrefetchEvent {
    pub fn session(&self) -> SessionId {
        match self {
            PrefetchEvent::PagesReady { session, .. }
            | PrefetchEvent::NoPages { session, .. }
            | PrefetchEvent::PageCached { session, .. } => *session,
        }
    }
}

#[derive(Default)]
struct Inner {
    queue: Mutex<VecDeque<PrefetchEvent>>,
    posted: Condvar,
}

/// Queue drained by the interaction loop; the only way background work
/// reaches UI-visible state.
#[derive(Clone, Default)]
pub struct Mailbox {
    inner: Arc<Inner>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, event: PrefetchEvent) {
        trace!(?event, "posting to interaction loop");
        self.inner.queue.lock().push_back(event);
        self.inner.posted.notify_all();
    }

    pub fn drain(&self) -> Vec<PrefetchEvent> {
        self.inner.queue.lock().drain(..).collect()
    }

    /// Drains the queue, sleeping up to `timeout` if it is empty.
    pub fn wait(&self, timeout: Duration) -> Vec<PrefetchEvent> {
        let mut queue = self.inner.queue.lock();
        if queue.is_empty() {
            let _ = self.inner.posted.wait_for(&mut queue, timeout);
        }
        queue.drain(..).collect()
    }
}
