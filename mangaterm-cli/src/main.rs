use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event;
use crossterm::style::{Attribute, Print, SetAttribute};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use mangaterm_core::{
    CacheKey, ChapterId, ChapterList, ChapterTarget, ContentCache, DiskCache, FileProgressStore,
    HttpFetcher, Mailbox, ManifestSource, Phase, PrefetchCoordinator, PrefetchHandle,
    ProgressStore, Prompt, ReaderConfig, ReaderOptions, ReaderSession, RenderImage, Rotation,
    SessionEvent, StartPage,
};
use mangaterm_render::{ImageRenderer, PageRenderer};
use mangaterm_tty::{write_status_line, DrawParams, EventMapper, InputMode, KittyRenderer, UiEvent};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "mangaterm",
    version,
    about = "kitty-native chapter reader with background page prefetch"
)]
struct Args {
    /// Series manifest (TOML, or JSON when the extension is .json)
    #[arg(required_unless_present = "clear_cache")]
    manifest: Option<PathBuf>,

    /// Chapter id to open; defaults to the last one read
    #[arg(short = 'c', long = "chapter")]
    chapter: Option<String>,

    /// Page to open the chapter on (0-based)
    #[arg(short = 'p', long = "page")]
    page: Option<usize>,

    /// Config file; defaults to config.toml in the platform config dir
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Directory holding downloaded pages
    #[arg(long = "cache-dir")]
    cache_dir: Option<PathBuf>,

    /// Simultaneous page downloads
    #[arg(long = "concurrency")]
    concurrency: Option<usize>,

    /// Interval of the page readiness fallback poll
    #[arg(long = "poll-interval-ms")]
    poll_interval_ms: Option<u64>,

    /// Delete every cached page and exit
    #[arg(long = "clear-cache")]
    clear_cache: bool,

    /// Print the chapters of the manifest with reading progress and exit
    #[arg(long = "list")]
    list: bool,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "mangaterm", "mangaterm")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().join("config.toml"));
    let mut config = ReaderConfig::load_or_default(&config_path)?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let cache_dir = config
        .cache_dir
        .clone()
        .unwrap_or_else(|| project_dirs.cache_dir().join("pages"));
    let cache = Arc::new(DiskCache::open(&cache_dir)?);

    if args.clear_cache {
        let removed = cache.clear()?;
        println!("removed {} cached pages from {}", removed, cache.root().display());
        return Ok(());
    }

    let manifest_path = args
        .manifest
        .as_deref()
        .ok_or_else(|| anyhow!("no manifest provided"))?;
    let source = Arc::new(
        ManifestSource::load(manifest_path)
            .with_context(|| format!("failed to open {:?}", manifest_path))?,
    );
    let chapters = Arc::new(source.chapters().clone());
    if chapters.is_empty() {
        bail!("manifest {:?} lists no chapters", manifest_path);
    }

    let store: Arc<dyn ProgressStore> = Arc::new(FileProgressStore::open(
        &project_dirs.data_local_dir().join("progress"),
        source.title(),
    )?);

    if args.list {
        print_chapters(source.title(), &chapters, store.as_ref())?;
        let usage = cache.usage()?;
        println!("cache: {} pages, {} bytes", usage.entries, usage.bytes);
        return Ok(());
    }

    let (position, start) = resolve_start(&args, &chapters, store.as_ref())?;
    let first = chapters
        .get(position)
        .cloned()
        .ok_or_else(|| anyhow!("chapter position {} out of range", position))?;

    let fetcher = Arc::new(HttpFetcher::new(config.prefetch.request_timeout)?);
    let mailbox = Mailbox::new();
    let coordinator = PrefetchCoordinator::new(
        source.clone(),
        cache.clone(),
        fetcher,
        mailbox.clone(),
        config.prefetch_config(),
    );
    let page_renderer = ImageRenderer::new(config.reader.grayscale);
    let options = ReaderOptions {
        start,
        fit_mode: config.reader.fit_mode,
        poll_interval: config.reader.poll_interval,
    };
    info!(series = source.title(), chapter = %first.id, cache = ?cache_dir, "opening reader");

    let mut reader = Reader {
        coordinator: &coordinator,
        chapters: Arc::clone(&chapters),
        store: Arc::clone(&store),
        options,
        current: None,
    };
    reader.open(ChapterTarget {
        position,
        chapter: first,
        start,
    })?;

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    let mut renderer = KittyRenderer::new(stdout);
    let mut event_mapper = EventMapper::new();
    let mut dirty = true;
    let mut last_status = String::new();

    let result = loop {
        let Some((_, session)) = reader.current.as_mut() else {
            break Ok(());
        };

        for event in mailbox.drain() {
            session.on_prefetch_event(&event);
        }
        session.tick(Instant::now());

        let mut exit = false;
        let mut switch_to = None;
        for event in session.take_events() {
            match event {
                SessionEvent::RedrawNeeded => dirty = true,
                SessionEvent::OpenChapter(target) => switch_to = Some(target),
                SessionEvent::ExitRequested => exit = true,
            }
        }
        if exit {
            break Ok(());
        }
        if let Some(target) = switch_to {
            if let Err(err) = reader.open(target) {
                break Err(err);
            }
            dirty = true;
            continue;
        }

        let Some((handle, session)) = reader.current.as_mut() else {
            break Ok(());
        };
        if session.prompt().is_some() {
            event_mapper.set_mode(InputMode::Prompt);
        } else {
            event_mapper.set_mode(InputMode::Normal);
        }

        if dirty {
            let pending = event_mapper.pending_input();
            if let Err(err) = redraw(
                &mut renderer,
                session,
                cache.as_ref(),
                &page_renderer,
                handle,
                pending.as_deref(),
            ) {
                break Err(err);
            }
            last_status = status_text(session, handle, pending.as_deref()).unwrap_or_default();
            dirty = false;
        } else if session.prompt().is_none() {
            let pending = event_mapper.pending_input();
            if let Some(status) = status_text(session, handle, pending.as_deref()) {
                if status != last_status {
                    if let Err(err) = draw_status_line(&mut renderer, &status) {
                        break Err(err);
                    }
                    last_status = status;
                }
            }
        }

        let timeout = session.poll_interval().min(Duration::from_millis(100));
        match next_input(event::poll(timeout), event::read) {
            Ok(Some(input)) => match event_mapper.map_event(input) {
                UiEvent::Command(command) => session.apply(command),
                UiEvent::Resize => dirty = true,
                UiEvent::None => {}
            },
            Ok(None) => {}
            Err(err) => break Err(err.context("failed to read terminal input")),
        }
    };

    reader.close();
    {
        renderer.clear_images()?;
        let mut writer = renderer.writer();
        crossterm::execute!(&mut writer, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    }
    result
}

/// Reads the pending terminal event once `poll` reported one.
fn next_input(
    ready: io::Result<bool>,
    read: impl FnOnce() -> io::Result<event::Event>,
) -> Result<Option<event::Event>> {
    if ready? {
        Ok(Some(read()?))
    } else {
        Ok(None)
    }
}

/// The open chapter: its background prefetch and the session reading it.
struct Reader<'a> {
    coordinator: &'a PrefetchCoordinator,
    chapters: Arc<ChapterList>,
    store: Arc<dyn ProgressStore>,
    options: ReaderOptions,
    current: Option<(PrefetchHandle, ReaderSession)>,
}

impl Reader<'_> {
    /// Tears down the current chapter without waiting for its downloads,
    /// then starts prefetching `target`.
    fn open(&mut self, target: ChapterTarget) -> Result<()> {
        self.close();
        let handle = self.coordinator.start(target.chapter.id.clone())?;
        let session = ReaderSession::new(
            handle.session(),
            target.chapter.id,
            Arc::clone(&self.chapters),
            self.coordinator.cache(),
            Arc::clone(&self.store),
            ReaderOptions {
                start: target.start,
                ..self.options.clone()
            },
        );
        self.current = Some((handle, session));
        Ok(())
    }

    fn close(&mut self) {
        if let Some((handle, mut session)) = self.current.take() {
            session.close();
            drop(handle.teardown());
        }
    }
}

fn apply_overrides(config: &mut ReaderConfig, args: &Args) {
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = Some(dir.clone());
    }
    if let Some(concurrency) = args.concurrency {
        config.prefetch.concurrency = concurrency;
    }
    if let Some(ms) = args.poll_interval_ms {
        config.reader.poll_interval = Duration::from_millis(ms);
    }
}

/// Chapter position and page to open: explicit flags first, then the saved
/// position, then the oldest chapter. An explicit chapter without a page
/// resumes from that chapter's saved page.
fn resolve_start(
    args: &Args,
    chapters: &ChapterList,
    store: &dyn ProgressStore,
) -> Result<(usize, StartPage)> {
    if let Some(id) = &args.chapter {
        let id = ChapterId::new(id.as_str());
        let position = chapters
            .position_of(&id)
            .ok_or_else(|| anyhow!("chapter {} is not in the manifest", id))?;
        let saved = args.page.or_else(|| {
            store
                .chapter_progress(&id)
                .unwrap_or_else(|err| {
                    warn!(?err, chapter = %id, "failed to read saved chapter progress");
                    None
                })
                .map(|progress| progress.page_index)
        });
        return Ok((position, StartPage::Index(saved.unwrap_or(0))));
    }

    let resumed = store.last_read().unwrap_or_else(|err| {
        warn!(?err, "failed to read saved progress");
        None
    });
    if let Some(last) = resumed {
        if let Some(position) = chapters.position_of(&last.chapter) {
            let page = args.page.unwrap_or(last.page_index);
            return Ok((position, StartPage::Index(page)));
        }
    }

    let position = chapters
        .first_in_reading_order()
        .ok_or_else(|| anyhow!("manifest lists no chapters"))?;
    Ok((position, StartPage::Index(args.page.unwrap_or(0))))
}

fn print_chapters(title: &str, chapters: &ChapterList, store: &dyn ProgressStore) -> Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", title)?;
    for chapter in chapters.iter() {
        let progress = match store.chapter_progress(&chapter.id)? {
            Some(progress) if progress.completed => "read".to_string(),
            Some(progress) => format!("page {}/{}", progress.page_index + 1, progress.total_pages),
            None => String::new(),
        };
        writeln!(
            stdout,
            "  {:<12} {:<40} {}",
            chapter.id.as_str(),
            chapter.title,
            progress
        )?;
    }
    Ok(())
}

fn redraw(
    renderer: &mut KittyRenderer<io::Stdout>,
    session: &mut ReaderSession,
    cache: &dyn ContentCache,
    page_renderer: &dyn PageRenderer,
    handle: &PrefetchHandle,
    pending_input: Option<&str>,
) -> Result<()> {
    let window = terminal::window_size()?;
    let total_cols = u32::from(window.columns).max(1);
    let total_rows = u32::from(window.rows).max(1);
    let image_rows_available = total_rows.saturating_sub(1).max(1);
    let (cell_width, cell_height) = cell_size(
        u32::from(window.width),
        u32::from(window.height),
        total_cols,
        total_rows,
    );

    renderer.begin_sync_update()?;
    renderer.clear_images()?;
    renderer.clear_all()?;

    let showing_error = matches!(session.prompt(), Some(Prompt::Error { .. }));
    match session.phase() {
        Phase::Displaying(_) if showing_error => {}
        Phase::Displaying(index) => {
            let margin_cols = total_cols.min(2);
            let margin_rows = image_rows_available.min(2);
            let available_cols = total_cols.saturating_sub(margin_cols).max(1);
            let available_rows = image_rows_available.saturating_sub(margin_rows).max(1);

            match render_page(
                session,
                cache,
                page_renderer,
                (available_cols as f32 * cell_width) as u32,
                (available_rows as f32 * cell_height) as u32,
            ) {
                Ok(image) => {
                    let (draw_cols, draw_rows) = compute_scaled_dimensions(
                        &image,
                        available_cols,
                        available_rows,
                        cell_width,
                        cell_height,
                    );
                    let start_col = (total_cols.saturating_sub(draw_cols)) / 2;
                    let start_row = (image_rows_available.saturating_sub(draw_rows)) / 2;
                    {
                        let mut writer = renderer.writer();
                        crossterm::execute!(
                            &mut writer,
                            cursor::MoveTo(start_col as u16, start_row as u16)
                        )?;
                    }
                    renderer.draw(&image, DrawParams::clamped(draw_cols, draw_rows))?;
                }
                Err(err) => {
                    warn!(?err, page = index, "failed to display page");
                    session.report_error(format!("Failed to display page {}.", index + 1));
                }
            }
        }
        Phase::Waiting(_) => {
            let snapshot = handle.progress().snapshot();
            draw_centered(
                renderer,
                total_cols,
                image_rows_available,
                &format!("Downloading {} / {}...", snapshot.done, snapshot.total),
            )?;
        }
        Phase::Loading => {
            draw_centered(renderer, total_cols, image_rows_available, "Loading chapter...")?;
        }
        Phase::NoPages => {
            draw_centered(
                renderer,
                total_cols,
                image_rows_available,
                "No pages found for this chapter.",
            )?;
        }
        Phase::Closed => {}
    }

    if let Some(prompt) = session.prompt() {
        draw_prompt(renderer, prompt, total_cols, image_rows_available)?;
    } else if let Some(status) = status_text(session, handle, pending_input) {
        draw_status_line(renderer, &status)?;
    }

    renderer.end_sync_update()?;
    Ok(())
}

fn render_page(
    session: &ReaderSession,
    cache: &dyn ContentCache,
    page_renderer: &dyn PageRenderer,
    pixel_width: u32,
    pixel_height: u32,
) -> Result<RenderImage> {
    let resource = session
        .current_resource()
        .ok_or_else(|| anyhow!("no page selected"))?;
    let bytes = cache
        .get(&CacheKey::for_resource(resource))?
        .ok_or_else(|| anyhow!("page {} vanished from the cache", resource))?;

    let state = session.state();
    // Bounds apply before rotation, so a quarter turn fits the swapped box.
    let (width, height) = match state.rotation {
        Rotation::Upright => (pixel_width, pixel_height),
        Rotation::Quarter => (pixel_height, pixel_width),
    };
    let (max_width, max_height) = state.fit_mode.bounds(width, height);
    page_renderer.render(&bytes, max_width, max_height, state.rotation)
}

fn status_text(
    session: &ReaderSession,
    handle: &PrefetchHandle,
    pending_input: Option<&str>,
) -> Option<String> {
    let base = if session.state().toolbar_visible {
        let title = session.chapter_title().unwrap_or("");
        match session.phase() {
            Phase::Displaying(index) => Some(format!(
                "{} | Page {} / {} | {}",
                title,
                index + 1,
                session.total_pages().unwrap_or(0),
                session.state().fit_mode
            )),
            Phase::Waiting(_) => {
                let snapshot = handle.progress().snapshot();
                Some(format!(
                    "{} | Downloading {} / {}...",
                    title, snapshot.done, snapshot.total
                ))
            }
            Phase::Loading => Some(format!("{} | Loading...", title)),
            Phase::NoPages => Some(format!("{} | No pages", title)),
            Phase::Closed => None,
        }
    } else {
        None
    };
    combine_status(base, pending_input)
}

fn combine_status(base: Option<String>, pending_input: Option<&str>) -> Option<String> {
    match (base, pending_input.filter(|s| !s.is_empty())) {
        (Some(mut base), Some(pending)) => {
            base.push_str(" | ");
            base.push_str(pending);
            Some(base)
        }
        (Some(base), None) => Some(base),
        (None, Some(pending)) => Some(pending.to_string()),
        (None, None) => None,
    }
}

fn draw_status_line(renderer: &mut KittyRenderer<io::Stdout>, status: &str) -> Result<()> {
    let window = terminal::window_size()?;
    let total_rows = u32::from(window.rows).max(1);
    let total_cols = usize::from(window.columns).max(1);
    let status_row = total_rows.saturating_sub(1);
    let mut writer = renderer.writer();
    crossterm::execute!(
        &mut writer,
        cursor::MoveTo(0, status_row as u16),
        Clear(ClearType::CurrentLine)
    )?;
    write_status_line(&mut writer, &truncate(status, total_cols))?;
    Ok(())
}

fn draw_centered(
    renderer: &mut KittyRenderer<io::Stdout>,
    total_cols: u32,
    rows: u32,
    text: &str,
) -> Result<()> {
    let text = truncate(text, total_cols as usize);
    let col = (total_cols as usize).saturating_sub(text.chars().count()) / 2;
    let mut writer = renderer.writer();
    crossterm::execute!(
        &mut writer,
        cursor::MoveTo(col as u16, (rows / 2) as u16),
        Print(text)
    )?;
    Ok(())
}

fn draw_prompt(
    renderer: &mut KittyRenderer<io::Stdout>,
    prompt: &Prompt,
    total_cols: u32,
    image_rows_available: u32,
) -> Result<()> {
    if total_cols < 12 || image_rows_available < 5 {
        return Ok(());
    }
    let lines = prompt_lines(prompt, total_cols.saturating_sub(4) as usize);
    let box_width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) as u32;
    let box_height = lines.len() as u32;
    let start_col = total_cols.saturating_sub(box_width) / 2;
    let start_row = image_rows_available.saturating_sub(box_height) / 2;

    let mut writer = renderer.writer();
    for (offset, line) in lines.iter().enumerate() {
        print_inverted(
            &mut writer,
            start_col as u16,
            (start_row + offset as u32) as u16,
            line,
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Padded box lines: a blank border row, the message, then the choices.
fn prompt_lines(prompt: &Prompt, max_width: usize) -> Vec<String> {
    let (confirm, dismiss) = prompt.choices();
    let choices = if confirm == dismiss {
        format!("[Enter] {}", confirm)
    } else {
        format!("[y] {}   [n] {}", confirm, dismiss)
    };

    let mut body: Vec<String> = prompt.message().lines().map(str::to_owned).collect();
    body.push(String::new());
    body.push(choices);

    let inner = body
        .iter()
        .map(|line| line.chars().count())
        .max()
        .unwrap_or(0)
        .min(max_width.saturating_sub(4));

    let mut lines = Vec::with_capacity(body.len() + 2);
    lines.push(" ".repeat(inner + 4));
    for line in body {
        lines.push(format!("  {}  ", pad(truncate(&line, inner), inner)));
    }
    lines.push(" ".repeat(inner + 4));
    lines
}

fn print_inverted(writer: &mut impl Write, col: u16, row: u16, content: &str) -> Result<()> {
    crossterm::execute!(
        writer,
        cursor::MoveTo(col, row),
        SetAttribute(Attribute::Reverse),
        Print(content),
        SetAttribute(Attribute::Reset)
    )?;
    Ok(())
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_owned();
    }
    if width <= 3 {
        return text.chars().take(width).collect();
    }
    let mut truncated: String = text.chars().take(width - 3).collect();
    truncated.push_str("...");
    truncated
}

fn pad(mut text: String, width: usize) -> String {
    let len = text.chars().count();
    if len < width {
        text.push_str(&" ".repeat(width - len));
    }
    text
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "mangaterm.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // The terminal is in raw mode and owned by the kitty renderer, so logs
    // go to the file only.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

/// Pixel size of one terminal cell; falls back to 8x16 when the terminal
/// does not report its pixel dimensions.
fn cell_size(pixel_width: u32, pixel_height: u32, cols: u32, rows: u32) -> (f32, f32) {
    if pixel_width > 0 && pixel_height > 0 && cols > 0 && rows > 0 {
        (
            pixel_width as f32 / cols as f32,
            pixel_height as f32 / rows as f32,
        )
    } else {
        (8.0, 16.0)
    }
}

/// Cell box for the image, keeping its aspect ratio within the available area.
fn compute_scaled_dimensions(
    image: &RenderImage,
    available_cols: u32,
    available_rows: u32,
    cell_width: f32,
    cell_height: f32,
) -> (u32, u32) {
    let available_cols = available_cols.max(1);
    let available_rows = available_rows.max(1);
    if image.width == 0 || image.height == 0 || cell_width <= 0.0 || cell_height <= 0.0 {
        return (available_cols, available_rows);
    }

    let mut cols = image.width as f32 / cell_width;
    let mut rows = image.height as f32 / cell_height;
    let shrink = (available_cols as f32 / cols)
        .min(available_rows as f32 / rows)
        .min(1.0);
    if shrink.is_finite() && shrink > 0.0 {
        cols *= shrink;
        rows *= shrink;
    }

    let draw_cols = (cols.round() as u32).clamp(1, available_cols);
    let draw_rows = (rows.round() as u32).clamp(1, available_rows);
    (draw_cols, draw_rows)
}
