use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers, MouseButton, MouseEvent, MouseEventKind},
    terminal::{Clear, ClearType},
};
use png::{BitDepth, ColorType, Encoder};
use tilemark_core::{Command, Decision, InputEvent, Key, Point, TileImage, Tool};

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

    pub fn draw(&mut self, image: &TileImage, params: DrawParams) -> Result<()> {
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
                    u8::from(more)
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", u8::from(more))?;
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

    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

/// Size of one terminal cell in pixels, used to place mouse events on the stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellGrid {
    pub cell_width: f64,
    pub cell_height: f64,
}

impl Default for CellGrid {
    fn default() -> Self {
        Self {
            cell_width: 8.0,
            cell_height: 16.0,
        }
    }
}

impl CellGrid {
    pub fn from_window(pixel_width: u16, pixel_height: u16, columns: u16, rows: u16) -> Self {
        if pixel_width == 0 || pixel_height == 0 || columns == 0 || rows == 0 {
            return Self::default();
        }
        Self {
            cell_width: f64::from(pixel_width) / f64::from(columns),
            cell_height: f64::from(pixel_height) / f64::from(rows),
        }
    }

    pub fn to_stage(&self, column: u16, row: u16) -> Point {
        Point::new(
            (f64::from(column) + 0.5) * self.cell_width,
            (f64::from(row) + 0.5) * self.cell_height,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Command(Command),
    Input(InputEvent),
    NextWorkspace,
    PrevWorkspace,
    ExportAnalysis,
    Resize { columns: u16, rows: u16 },
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    Decision,
}

#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
    grid: CellGrid,
}

impl EventMapper {
    pub const PAN_STEP: f64 = 64.0;
    pub const ZOOM_FACTOR: f64 = 1.25;
    const MAX_ZOOM_STEPS: usize = 64;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_grid(&mut self, grid: CellGrid) {
        self.grid = grid;
    }

    pub fn grid(&self) -> CellGrid {
        self.grid
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
        if let Event::Resize(columns, rows) = event {
            return UiEvent::Resize { columns, rows };
        }
        match self.mode {
            InputMode::Normal => self.map_event_normal(event),
            InputMode::Decision => self.map_event_decision(event),
        }
    }

    fn map_event_normal(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                kind: KeyEventKind::Release,
                ..
            }) => UiEvent::None,
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => self.map_key(code, modifiers),
            Event::Mouse(mouse) => {
                self.reset_count();
                self.map_mouse(mouse)
            }
            _ => UiEvent::None,
        }
    }

    fn map_key(&mut self, code: KeyCode, modifiers: KeyModifiers) -> UiEvent {
        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('h'), KeyModifiers::NONE) | (KeyCode::Left, _) => {
                self.pan(Self::PAN_STEP, 0.0)
            }
            (KeyCode::Char('l'), KeyModifiers::NONE) | (KeyCode::Right, _) => {
                self.pan(-Self::PAN_STEP, 0.0)
            }
            (KeyCode::Char('k'), KeyModifiers::NONE) | (KeyCode::Up, _) => {
                self.pan(0.0, Self::PAN_STEP)
            }
            (KeyCode::Char('j'), KeyModifiers::NONE) | (KeyCode::Down, _) => {
                self.pan(0.0, -Self::PAN_STEP)
            }
            (KeyCode::Char('+'), _) => self.zoom(1),
            (KeyCode::Char('-'), _) => self.zoom(-1),
            (KeyCode::Char('='), _) => {
                self.reset_count();
                UiEvent::Command(Command::ResetView)
            }
            (KeyCode::Char('p'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Command(Command::SetTool(Tool::Pan))
            }
            (KeyCode::Char('v'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Command(Command::SetTool(Tool::Select))
            }
            (KeyCode::Char('i'), KeyModifiers::NONE) | (KeyCode::Insert, _) => {
                self.reset_count();
                UiEvent::Input(InputEvent::Key(Key::Insert))
            }
            (KeyCode::Char('x'), KeyModifiers::NONE)
            | (KeyCode::Delete, _)
            | (KeyCode::Backspace, _) => {
                self.reset_count();
                UiEvent::Input(InputEvent::Key(Key::Delete))
            }
            (KeyCode::Esc, _) => {
                self.reset_count();
                UiEvent::Input(InputEvent::Key(Key::Escape))
            }
            (KeyCode::Tab, _) | (KeyCode::Char('n'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::NextWorkspace
            }
            (KeyCode::BackTab, _) | (KeyCode::Char('N'), _) => {
                self.reset_count();
                UiEvent::PrevWorkspace
            }
            (KeyCode::Char('e'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::ExportAnalysis
            }
            (KeyCode::Char('q'), _) => {
                self.reset_count();
                UiEvent::Quit
            }
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                self.reset_count();
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn map_mouse(&mut self, mouse: MouseEvent) -> UiEvent {
        let position = self.grid.to_stage(mouse.column, mouse.row);
        let event = match mouse.kind {
            MouseEventKind::Down(MouseButton::Left) => InputEvent::PointerDown {
                position,
                pan_modifier: mouse.modifiers.contains(KeyModifiers::CONTROL),
            },
            MouseEventKind::Down(MouseButton::Middle) => InputEvent::PointerDown {
                position,
                pan_modifier: true,
            },
            MouseEventKind::Drag(MouseButton::Left | MouseButton::Middle)
            | MouseEventKind::Moved => InputEvent::PointerMove { position },
            MouseEventKind::Up(MouseButton::Left | MouseButton::Middle) => {
                InputEvent::PointerUp { position }
            }
            MouseEventKind::ScrollUp => InputEvent::Wheel {
                position,
                delta: -1.0,
            },
            MouseEventKind::ScrollDown => InputEvent::Wheel {
                position,
                delta: 1.0,
            },
            _ => return UiEvent::None,
        };
        UiEvent::Input(event)
    }

    fn map_event_decision(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code,
                kind: KeyEventKind::Press | KeyEventKind::Repeat,
                ..
            }) => match code {
                KeyCode::Char('s') | KeyCode::Char('y') | KeyCode::Enter => {
                    UiEvent::Command(Command::Decide(Decision::Save))
                }
                KeyCode::Char('d') | KeyCode::Char('n') => {
                    UiEvent::Command(Command::Decide(Decision::Discard))
                }
                KeyCode::Char('c') | KeyCode::Esc => {
                    UiEvent::Command(Command::Decide(Decision::Cancel))
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

    fn zoom(&mut self, direction: i32) -> UiEvent {
        let steps = self.take_count().min(Self::MAX_ZOOM_STEPS) as i32;
        UiEvent::Command(Command::ZoomBy {
            factor: Self::ZOOM_FACTOR.powi(direction * steps),
        })
    }

    fn pan(&mut self, dx: f64, dy: f64) -> UiEvent {
        let multiplier = self.take_count() as f64;
        UiEvent::Command(Command::PanBy {
            dx: dx * multiplier,
            dy: dy * multiplier,
        })
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
