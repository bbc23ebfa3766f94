pub mod cache;
pub mod config;
pub mod fetch;
pub mod mailbox;
pub mod prefetch;
pub mod progress;
pub mod reader;
pub mod source;
pub mod store;

pub use cache::{CacheError, CacheKey, CacheUsage, ContentCache, DiskCache, MemoryCache};
pub use config::{ConfigError, PrefetchSettings, ReaderConfig, ReaderSettings};
pub use fetch::{FetchError, Fetcher, HttpFetcher};
pub use mailbox::{Mailbox, PrefetchEvent, SessionId};
pub use prefetch::{PrefetchConfig, PrefetchCoordinator, PrefetchHandle};
pub use progress::{PrefetchProgress, ProgressSnapshot};
pub use reader::{
    ChapterTarget, Command, FitMode, Phase, Prompt, ReaderOptions, ReaderSession, ReaderState,
    Rotation, SessionEvent, StartPage,
};
pub use source::{
    Chapter, ChapterId, ChapterList, Direction, ManifestSource, PageList, PageSource,
    SourceError, StaticPageSource,
};
pub use store::{
    ChapterProgress, FileProgressStore, LastRead, MemoryProgressStore, ProgressStore,
};

/// Decoded RGBA page ready for a terminal backend.
#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}
