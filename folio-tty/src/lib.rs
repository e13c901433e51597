use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers, MouseEventKind},
    terminal::{Clear, ClearType},
};
use folio_core::{Command, RenderImage};
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
            let more = chunks.peek().is_some();
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
                    if more { 1 } else { 0 }
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", if more { 1 } else { 0 })?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEventKind, KeyEventState, MouseEvent};

    #[test]
    fn kitty_draw_emits_protocol() {
        let mut renderer = KittyRenderer::new(Vec::new());
        let image = RenderImage {
            width: 1,
            height: 1,
            pixels: vec![255, 0, 0, 255],
        };

        renderer.draw(&image, DrawParams::clamped(10, 5)).unwrap();
        let output = renderer.writer;
        assert_eq!(output[0], 0x1b);
        assert_eq!(output[1], b'_');
        assert_eq!(output[2], b'G');
    }

    #[test]
    fn clear_all_wipes_the_screen_and_homes_the_cursor() {
        let mut renderer = KittyRenderer::new(Vec::new());
        renderer.clear_all().unwrap();

        let output = String::from_utf8(renderer.writer).unwrap();
        assert!(output.contains("\u{1b}[2J"));
        assert!(output.contains("\u{1b}[1;1H"));
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

    fn mouse_scroll(kind: MouseEventKind) -> Event {
        Event::Mouse(MouseEvent {
            kind,
            column: 0,
            row: 0,
            modifiers: KeyModifiers::NONE,
        })
    }

    #[test]
    fn event_mapper_uses_numeric_prefix_for_paging() {
        let mut mapper = EventMapper::new();
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('1'))),
            UiEvent::None
        ));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('2'))),
            UiEvent::None
        ));

        match mapper.map_event(key_event(KeyCode::PageDown)) {
            UiEvent::Command(Command::NextPage { count }) => assert_eq!(count, 12),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn event_mapper_resets_prefix_after_use() {
        let mut mapper = EventMapper::new();
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('3'))),
            UiEvent::None
        ));

        match mapper.map_event(key_event(KeyCode::Char('b'))) {
            UiEvent::Command(Command::PrevPage { count }) => assert_eq!(count, 3),
            other => panic!("unexpected event: {:?}", other),
        }

        match mapper.map_event(key_event(KeyCode::Char('b'))) {
            UiEvent::Command(Command::PrevPage { count }) => assert_eq!(count, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn event_mapper_scroll_keys_scale_with_prefix() {
        let mut mapper = EventMapper::new();
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('2'))),
            UiEvent::None
        ));

        match mapper.map_event(key_event(KeyCode::Char('j'))) {
            UiEvent::Command(Command::ScrollBy { delta }) => {
                assert!((delta - 2.0 * EventMapper::SCROLL_STEP).abs() < f32::EPSILON)
            }
            other => panic!("unexpected event: {:?}", other),
        }

        match mapper.map_event(key_event(KeyCode::Char('k'))) {
            UiEvent::Command(Command::ScrollBy { delta }) => {
                assert!((delta + EventMapper::SCROLL_STEP).abs() < f32::EPSILON)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn event_mapper_maps_the_mouse_wheel_to_scrolling() {
        let mut mapper = EventMapper::new();

        match mapper.map_event(mouse_scroll(MouseEventKind::ScrollDown)) {
            UiEvent::Command(Command::ScrollBy { delta }) => {
                assert!((delta - EventMapper::SCROLL_STEP).abs() < f32::EPSILON)
            }
            other => panic!("unexpected event: {:?}", other),
        }

        match mapper.map_event(mouse_scroll(MouseEventKind::ScrollUp)) {
            UiEvent::Command(Command::ScrollBy { delta }) => {
                assert!((delta + EventMapper::SCROLL_STEP).abs() < f32::EPSILON)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn event_mapper_maps_n_and_uppercase_n_to_match_navigation() {
        let mut mapper = EventMapper::new();

        match mapper.map_event(key_event(KeyCode::Char('n'))) {
            UiEvent::Command(Command::SearchNext { count }) => assert_eq!(count, 1),
            other => panic!("unexpected event: {:?}", other),
        }

        match mapper.map_event(key_event_with_modifiers(
            KeyCode::Char('N'),
            KeyModifiers::SHIFT,
        )) {
            UiEvent::Command(Command::SearchPrev { count }) => assert_eq!(count, 1),
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('3'))),
            UiEvent::None
        ));

        match mapper.map_event(key_event(KeyCode::Char('n'))) {
            UiEvent::Command(Command::SearchNext { count }) => assert_eq!(count, 3),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn event_mapper_slash_enters_search_mode_and_collects_input() {
        let mut mapper = EventMapper::new();

        match mapper.map_event(key_event(KeyCode::Char('/'))) {
            UiEvent::BeginSearch => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(mapper.pending_input().as_deref(), Some("/"));

        match mapper.map_event(key_event(KeyCode::Char('f'))) {
            UiEvent::SearchQueryChanged { ref query } => assert_eq!(query, "f"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(mapper.pending_input().as_deref(), Some("/f"));

        match mapper.map_event(key_event(KeyCode::Backspace)) {
            UiEvent::SearchQueryChanged { ref query } => assert!(query.is_empty()),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(mapper.pending_input().as_deref(), Some("/"));

        match mapper.map_event(key_event(KeyCode::Char('g'))) {
            UiEvent::SearchQueryChanged { ref query } => assert_eq!(query, "g"),
            other => panic!("unexpected event: {:?}", other),
        }

        match mapper.map_event(key_event(KeyCode::Enter)) {
            UiEvent::SearchSubmit { ref query } => assert_eq!(query, "g"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(mapper.pending_input().is_none());
    }

    #[test]
    fn event_mapper_esc_leaves_search_mode() {
        let mut mapper = EventMapper::new();
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('/'))),
            UiEvent::BeginSearch
        ));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('f'))),
            UiEvent::SearchQueryChanged { .. }
        ));

        match mapper.map_event(key_event(KeyCode::Esc)) {
            UiEvent::SearchCancel => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(mapper.pending_input().is_none());

        match mapper.map_event(key_event(KeyCode::Char('j'))) {
            UiEvent::Command(Command::ScrollBy { .. }) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn event_mapper_colon_collects_a_page_number() {
        let mut mapper = EventMapper::new();

        match mapper.map_event(key_event_with_modifiers(
            KeyCode::Char(':'),
            KeyModifiers::SHIFT,
        )) {
            UiEvent::BeginPageJump => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(mapper.pending_input().as_deref(), Some(":"));

        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('1'))),
            UiEvent::PageJumpChanged { .. }
        ));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('2'))),
            UiEvent::PageJumpChanged { .. }
        ));
        assert_eq!(mapper.pending_input().as_deref(), Some(":12"));

        match mapper.map_event(key_event(KeyCode::Enter)) {
            UiEvent::PageJumpSubmit { ref input } => assert_eq!(input, "12"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(mapper.pending_input().is_none());
    }

    #[test]
    fn event_mapper_esc_leaves_page_jump_mode() {
        let mut mapper = EventMapper::new();
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char(':'))),
            UiEvent::BeginPageJump
        ));
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('4'))),
            UiEvent::PageJumpChanged { .. }
        ));

        match mapper.map_event(key_event(KeyCode::Esc)) {
            UiEvent::PageJumpCancel => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(mapper.pending_input().is_none());
    }

    #[test]
    fn event_mapper_switching_modes_clears_pending_state() {
        let mut mapper = EventMapper::new();
        assert!(matches!(
            mapper.map_event(key_event(KeyCode::Char('7'))),
            UiEvent::None
        ));
        assert_eq!(mapper.pending_input().as_deref(), Some("7"));

        mapper.set_mode(InputMode::Search);
        assert_eq!(mapper.pending_input().as_deref(), Some("/"));
        mapper.set_mode(InputMode::Normal);
        assert!(mapper.pending_input().is_none());

        match mapper.map_event(key_event(KeyCode::Char('j'))) {
            UiEvent::Command(Command::ScrollBy { delta }) => {
                assert!((delta - EventMapper::SCROLL_STEP).abs() < f32::EPSILON)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub enum UiEvent {
    Command(Command),
    BeginSearch,
    SearchQueryChanged { query: String },
    SearchSubmit { query: String },
    SearchCancel,
    BeginPageJump,
    PageJumpChanged { input: String },
    PageJumpSubmit { input: String },
    PageJumpCancel,
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Search,
    PageJump,
}

impl Default for InputMode {
    fn default() -> Self {
        InputMode::Normal
    }
}

#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
    search_buffer: String,
    jump_buffer: String,
}

impl EventMapper {
    const SCROLL_STEP: f32 = 40.0;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.search_buffer.clear();
            self.jump_buffer.clear();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match self.mode {
            InputMode::Normal => self.map_event_normal(event),
            InputMode::Search => self.map_event_search(event),
            InputMode::PageJump => self.map_event_page_jump(event),
        }
    }

    fn map_event_normal(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                    if let Some(digit) = c.to_digit(10) {
                        self.push_digit(digit as usize);
                    }
                    UiEvent::None
                }
                (KeyCode::Char('j'), KeyModifiers::NONE) | (KeyCode::Down, KeyModifiers::NONE) => {
                    let count = self.take_count() as f32;
                    UiEvent::Command(Command::ScrollBy {
                        delta: Self::SCROLL_STEP * count,
                    })
                }
                (KeyCode::Char('k'), KeyModifiers::NONE) | (KeyCode::Up, KeyModifiers::NONE) => {
                    let count = self.take_count() as f32;
                    UiEvent::Command(Command::ScrollBy {
                        delta: -Self::SCROLL_STEP * count,
                    })
                }
                (KeyCode::PageDown, _) | (KeyCode::Char(' '), KeyModifiers::NONE) => {
                    let count = self.take_count();
                    UiEvent::Command(Command::NextPage { count })
                }
                (KeyCode::PageUp, _) | (KeyCode::Char('b'), KeyModifiers::NONE) => {
                    let count = self.take_count();
                    UiEvent::Command(Command::PrevPage { count })
                }
                (KeyCode::Char('/'), KeyModifiers::NONE) => {
                    self.set_mode(InputMode::Search);
                    UiEvent::BeginSearch
                }
                (KeyCode::Char(':'), modifiers)
                    if modifiers.is_empty() || modifiers == KeyModifiers::SHIFT =>
                {
                    self.set_mode(InputMode::PageJump);
                    UiEvent::BeginPageJump
                }
                (KeyCode::Char('n'), KeyModifiers::NONE) => {
                    let count = self.take_count();
                    UiEvent::Command(Command::SearchNext { count })
                }
                (KeyCode::Char('N'), modifiers)
                    if modifiers.is_empty() || modifiers == KeyModifiers::SHIFT =>
                {
                    let count = self.take_count();
                    UiEvent::Command(Command::SearchPrev { count })
                }
                (KeyCode::Char('q'), _) => {
                    self.reset_count();
                    UiEvent::Quit
                }
                _ => {
                    self.reset_count();
                    UiEvent::None
                }
            },
            Event::Mouse(mouse) => match mouse.kind {
                MouseEventKind::ScrollDown => UiEvent::Command(Command::ScrollBy {
                    delta: Self::SCROLL_STEP,
                }),
                MouseEventKind::ScrollUp => UiEvent::Command(Command::ScrollBy {
                    delta: -Self::SCROLL_STEP,
                }),
                _ => UiEvent::None,
            },
            _ => UiEvent::None,
        }
    }

    fn map_event_search(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Esc, _) => {
                    self.set_mode(InputMode::Normal);
                    UiEvent::SearchCancel
                }
                (KeyCode::Enter, _) => {
                    let query = self.search_buffer.clone();
                    self.set_mode(InputMode::Normal);
                    UiEvent::SearchSubmit { query }
                }
                (KeyCode::Backspace, _) => {
                    self.search_buffer.pop();
                    UiEvent::SearchQueryChanged {
                        query: self.search_buffer.clone(),
                    }
                }
                (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                    self.search_buffer.push(c);
                    UiEvent::SearchQueryChanged {
                        query: self.search_buffer.clone(),
                    }
                }
                _ => UiEvent::None,
            },
            _ => UiEvent::None,
        }
    }

    fn map_event_page_jump(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Esc, _) => {
                    self.set_mode(InputMode::Normal);
                    UiEvent::PageJumpCancel
                }
                (KeyCode::Enter, _) => {
                    let input = self.jump_buffer.clone();
                    self.set_mode(InputMode::Normal);
                    UiEvent::PageJumpSubmit { input }
                }
                (KeyCode::Backspace, _) => {
                    self.jump_buffer.pop();
                    UiEvent::PageJumpChanged {
                        input: self.jump_buffer.clone(),
                    }
                }
                // The engine validates the text, so anything typable is kept.
                (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                    self.jump_buffer.push(c);
                    UiEvent::PageJumpChanged {
                        input: self.jump_buffer.clone(),
                    }
                }
                _ => UiEvent::None,
            },
            _ => UiEvent::None,
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        match self.mode {
            InputMode::Search => Some(format!("/{}", self.search_buffer)),
            InputMode::PageJump => Some(format!(":{}", self.jump_buffer)),
            InputMode::Normal => {
                if self.pending_digits.is_empty() {
                    None
                } else {
                    Some(self.pending_digits.clone())
                }
            }
        }
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}
