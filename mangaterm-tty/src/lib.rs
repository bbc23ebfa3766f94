use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal::{Clear, ClearType},
};
use mangaterm_core::{Command, RenderImage};
use png::{BitDepth, ColorType, Encoder};

pub struct KittyRenderer<W: Write> {
    writer: W,
    image_id: u32,
    placement_id: u32,
}

pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            placement_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Transmits the page as PNG and places it at the cursor, replacing
    /// the previous page (same image id).
    pub fn draw(&mut self, image: &RenderImage, params: DrawParams) -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&image.pixels)?;
        writer.finish()?;

        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(4096).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let more = u8::from(chunks.peek().is_some());
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},z=-1,m={}",
                    self.image_id,
                    self.placement_id,
                    params.columns,
                    params.rows,
                    image.width,
                    image.height,
                    more
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", more)?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Deletes every placed image, e.g. while a page is still downloading.
    pub fn clear_images(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,q=2\u{1b}\\")?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// Disables synchronized updates.
    /// The terminal will render all buffered changes at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Clears the entire screen.
    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Command(Command),
    Resize,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    /// A confirmation prompt is shown; only answer keys are live.
    Prompt,
}

#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                kind: KeyEventKind::Release,
                ..
            }) => UiEvent::None,
            Event::Key(key) => match self.mode {
                InputMode::Normal => self.map_key_normal(key),
                InputMode::Prompt => self.map_key_prompt(key),
            },
            Event::Resize(..) => UiEvent::Resize,
            _ => UiEvent::None,
        }
    }

    fn map_key_normal(&mut self, KeyEvent { code, modifiers, .. }: KeyEvent) -> UiEvent {
        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('j'), KeyModifiers::NONE)
            | (KeyCode::Char('l'), KeyModifiers::NONE)
            | (KeyCode::Char(' '), KeyModifiers::NONE)
            | (KeyCode::Down, _)
            | (KeyCode::Right, _) => self.command(Command::NextPage),
            (KeyCode::Char('k'), KeyModifiers::NONE)
            | (KeyCode::Char('h'), KeyModifiers::NONE)
            | (KeyCode::Up, _)
            | (KeyCode::Left, _) => self.command(Command::PrevPage),
            (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                let page = self.take_count().map_or(0, |count| count.saturating_sub(1));
                UiEvent::Command(Command::JumpTo { page })
            }
            (KeyCode::Char('G'), _) | (KeyCode::End, _) => self.command(Command::LastPage),
            (KeyCode::Char('r'), KeyModifiers::NONE) => self.command(Command::ToggleRotation),
            (KeyCode::Char('f'), KeyModifiers::NONE) => self.command(Command::CycleFitMode),
            (KeyCode::Char('t'), KeyModifiers::NONE) => self.command(Command::ToggleToolbar),
            (KeyCode::Char('q'), _) | (KeyCode::Esc, _) => self.command(Command::Back),
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                self.command(Command::Back)
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn map_key_prompt(&mut self, KeyEvent { code, modifiers, .. }: KeyEvent) -> UiEvent {
        match (code, modifiers) {
            (KeyCode::Char('y'), _) | (KeyCode::Enter, _) => UiEvent::Command(Command::Confirm),
            (KeyCode::Char('n'), _) | (KeyCode::Esc, _) => UiEvent::Command(Command::Dismiss),
            (KeyCode::Char('q'), _) => UiEvent::Command(Command::Back),
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                UiEvent::Command(Command::Back)
            }
            _ => UiEvent::None,
        }
    }

    fn command(&mut self, command: Command) -> UiEvent {
        self.reset_count();
        UiEvent::Command(command)
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> Option<usize> {
        let count = self.pending_count.take().filter(|&count| count > 0);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyEventState;

    #[test]
    fn kitty_draw_emits_protocol() {
        let mut renderer = KittyRenderer::new(Vec::new());
        let image = RenderImage {
            width: 1,
            height: 1,
            pixels: vec![255, 0, 0, 255],
        };

        renderer.draw(&image, DrawParams::clamped(10, 5)).unwrap();
        let output = String::from_utf8(renderer.writer).unwrap();
        assert!(output.starts_with("\u{1b}_Ga=T,f=100,"));
        assert!(output.contains("c=10,r=5,s=1,v=1"));
        assert!(output.ends_with("\u{1b}\\"));
    }

    #[test]
    fn kitty_draw_splits_large_payloads_into_chunks() {
        let mut renderer = KittyRenderer::new(Vec::new());
        let mut state: u32 = 0x2545_f491;
        let pixels = (0..128 * 128 * 4)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect();
        let image = RenderImage {
            width: 128,
            height: 128,
            pixels,
        };

        renderer.draw(&image, DrawParams::clamped(0, 0)).unwrap();
        let output = String::from_utf8(renderer.writer).unwrap();
        assert!(output.contains("c=1,r=1"));
        assert!(output.contains("m=1;"));
        assert!(output.contains("\u{1b}_Gm=0,q=2;"));
    }

    #[test]
    fn clear_images_emits_delete_command() {
        let mut renderer = KittyRenderer::new(Vec::new());
        renderer.clear_images().unwrap();
        assert_eq!(renderer.writer, b"\x1b_Ga=d,q=2\x1b\\".to_vec());
    }

    fn key_event(code: KeyCode) -> Event {
        key_event_with_modifiers(code, KeyModifiers::NONE)
    }

    fn key_event_with_modifiers(code: KeyCode, modifiers: KeyModifiers) -> Event {
        Event::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        })
    }

    #[test]
    fn event_mapper_maps_both_reading_directions() {
        let mut mapper = EventMapper::new();
        for code in [KeyCode::Char('j'), KeyCode::Char('l'), KeyCode::Right] {
            assert_eq!(
                mapper.map_event(key_event(code)),
                UiEvent::Command(Command::NextPage)
            );
        }
        for code in [KeyCode::Char('k'), KeyCode::Char('h'), KeyCode::Left] {
            assert_eq!(
                mapper.map_event(key_event(code)),
                UiEvent::Command(Command::PrevPage)
            );
        }
    }

    #[test]
    fn event_mapper_numeric_prefix_jumps_to_one_based_page() {
        let mut mapper = EventMapper::new();
        assert_eq!(mapper.map_event(key_event(KeyCode::Char('1'))), UiEvent::None);
        assert_eq!(mapper.map_event(key_event(KeyCode::Char('2'))), UiEvent::None);
        assert_eq!(mapper.pending_input().as_deref(), Some("12"));

        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('g'))),
            UiEvent::Command(Command::JumpTo { page: 11 })
        );
        assert!(mapper.pending_input().is_none());

        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('g'))),
            UiEvent::Command(Command::JumpTo { page: 0 })
        );
    }

    #[test]
    fn event_mapper_drops_prefix_on_other_command() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('4')));
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('r'))),
            UiEvent::Command(Command::ToggleRotation)
        );
        assert!(mapper.pending_input().is_none());
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('g'))),
            UiEvent::Command(Command::JumpTo { page: 0 })
        );
    }

    #[test]
    fn event_mapper_maps_view_toggles() {
        let mut mapper = EventMapper::new();
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('f'))),
            UiEvent::Command(Command::CycleFitMode)
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('t'))),
            UiEvent::Command(Command::ToggleToolbar)
        );
        assert_eq!(
            mapper.map_event(key_event_with_modifiers(
                KeyCode::Char('G'),
                KeyModifiers::SHIFT
            )),
            UiEvent::Command(Command::LastPage)
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('q'))),
            UiEvent::Command(Command::Back)
        );
    }

    #[test]
    fn event_mapper_prompt_mode_only_answers() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('3')));
        mapper.set_mode(InputMode::Prompt);
        assert!(mapper.pending_input().is_none());

        assert_eq!(mapper.map_event(key_event(KeyCode::Char('j'))), UiEvent::None);
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Enter)),
            UiEvent::Command(Command::Confirm)
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('y'))),
            UiEvent::Command(Command::Confirm)
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Esc)),
            UiEvent::Command(Command::Dismiss)
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('n'))),
            UiEvent::Command(Command::Dismiss)
        );
    }

    #[test]
    fn event_mapper_ignores_key_release_and_reports_resize() {
        let mut mapper = EventMapper::new();
        let release = Event::Key(KeyEvent {
            code: KeyCode::Char('j'),
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Release,
            state: KeyEventState::NONE,
        });
        assert_eq!(mapper.map_event(release), UiEvent::None);
        assert_eq!(mapper.map_event(Event::Resize(80, 24)), UiEvent::Resize);
    }
}
