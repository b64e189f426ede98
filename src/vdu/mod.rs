//! VDU driver
//!
//! Every byte Basic prints passes through [`Screen::write`]. Bytes 0-31 and
//! 127 start VDU commands, which collect a fixed number of parameter bytes
//! before they run (see [`QUEUE_LENGTHS`]). Everything else is a character.
//!
//! In MODE 7 characters are stored in the teletext grid. In the other modes
//! they are drawn with the 8x8 font into the graphics canvas, and a copy of
//! each character is kept in a grid so that programs can read the screen
//! back. After each write the changed area is copied to the display.

pub mod font;

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{BasicError, ErrorKind, Result};
use crate::graphics::{self, Canvas, Graphics, Pen, Rect, ACTION_REPLACE};
use crate::teletext::{self, Teletext};
use crate::video::{Request, Video};

/// Parameter bytes taken by VDU 0 to 31
pub const QUEUE_LENGTHS: [usize; 32] = [
    0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
    0, 1, 2, 5, 0, 0, 1, 9, 8, 5, 0, 0, 4, 4, 0, 2,
];

/// Parameter bytes taken by a VDU code
pub fn queue_length(code: u8) -> usize {
    QUEUE_LENGTHS.get(code as usize).copied().unwrap_or(0)
}

/// Highest numbered built-in mode
pub const MAX_MODE: u32 = 53;

/// Number used for a mode defined with VDU 23,22
pub const CUSTOM_MODE: u32 = 126;

/// Screen banks available for drawing and display (`OSBYTE 112/113`)
pub const SCREEN_BANKS: usize = 4;

/// Screen mode description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeInfo {
    pub number: u32,
    /// Size of the canvas in pixels
    pub xres: usize,
    pub yres: usize,
    pub colours: u32,
    /// Display pixels per canvas pixel
    pub xscale: usize,
    pub yscale: usize,
    /// Height of a character cell in pixels
    pub cell_height: usize,
    pub teletext: bool,
}

/// xres, yres, colours, xscale, yscale, cell height
const MODES: [(usize, usize, u32, usize, usize, usize); 54] = [
    (640, 256, 2, 1, 2, 8),
    (320, 256, 4, 2, 2, 8),
    (160, 256, 16, 4, 2, 8),
    (640, 250, 2, 1, 2, 10),
    (320, 256, 2, 2, 2, 8),
    (160, 256, 4, 4, 2, 8),
    (320, 250, 2, 2, 2, 10),
    (640, 500, 16, 1, 1, 20),
    (640, 256, 4, 1, 2, 8),
    (320, 256, 16, 2, 2, 8),
    (160, 256, 256, 4, 2, 8),
    (640, 250, 4, 1, 2, 10),
    (640, 256, 16, 1, 2, 8),
    (320, 256, 256, 2, 2, 8),
    (640, 250, 16, 1, 2, 10),
    (640, 256, 256, 1, 2, 8),
    (1056, 256, 16, 1, 2, 8),
    (1056, 250, 16, 1, 2, 10),
    (640, 512, 2, 1, 1, 8),
    (640, 512, 4, 1, 1, 8),
    (640, 512, 16, 1, 1, 8),
    (640, 512, 256, 1, 1, 8),
    (768, 288, 16, 1, 2, 8),
    (1152, 896, 2, 1, 1, 8),
    (1056, 256, 256, 1, 2, 8),
    (640, 480, 2, 1, 1, 8),
    (640, 480, 4, 1, 1, 8),
    (640, 480, 16, 1, 1, 8),
    (640, 480, 256, 1, 1, 8),
    (800, 600, 2, 1, 1, 8),
    (800, 600, 4, 1, 1, 8),
    (800, 600, 16, 1, 1, 8),
    (800, 600, 256, 1, 1, 8),
    (768, 288, 2, 1, 2, 8),
    (768, 288, 4, 1, 2, 8),
    (768, 288, 16, 1, 2, 8),
    (768, 288, 256, 1, 2, 8),
    (896, 352, 2, 1, 2, 8),
    (896, 352, 4, 1, 2, 8),
    (896, 352, 16, 1, 2, 8),
    (896, 352, 256, 1, 2, 8),
    (640, 352, 2, 1, 2, 8),
    (640, 352, 4, 1, 2, 8),
    (640, 352, 16, 1, 2, 8),
    (640, 200, 2, 1, 2, 8),
    (640, 200, 4, 1, 2, 8),
    (640, 200, 16, 1, 2, 8),
    (360, 480, 256, 2, 1, 8),
    (320, 480, 16, 2, 1, 8),
    (320, 480, 256, 2, 1, 8),
    (320, 240, 2, 2, 2, 8),
    (320, 240, 4, 2, 2, 8),
    (320, 240, 16, 2, 2, 8),
    (320, 240, 256, 2, 2, 8),
];

/// Look up a built-in mode. Bit 7 (shadow screen) is ignored.
pub fn mode_info(number: u32) -> Option<ModeInfo> {
    let number = number & 0x7F;
    let &(xres, yres, colours, xscale, yscale, cell_height) = MODES.get(number as usize)?;
    Some(ModeInfo { number, xres, yres, colours, xscale, yscale, cell_height, teletext: number == 7 })
}

impl ModeInfo {
    pub fn xeig(&self) -> u32 {
        self.xscale.trailing_zeros() + 1
    }

    pub fn yeig(&self) -> u32 {
        self.yscale.trailing_zeros() + 1
    }

    pub fn columns(&self) -> usize {
        if self.teletext {
            teletext::COLUMNS
        } else {
            self.xres / 8
        }
    }

    pub fn rows(&self) -> usize {
        if self.teletext {
            teletext::ROWS
        } else {
            self.yres / self.cell_height
        }
    }

    /// Size of the display surface
    pub fn display_size(&self) -> (usize, usize) {
        if self.teletext {
            (teletext::WIDTH, teletext::HEIGHT)
        } else {
            (self.xres * self.xscale, self.yres * self.yscale)
        }
    }

    pub fn log2_bpp(&self) -> u32 {
        match self.colours {
            2 => 0,
            4 => 1,
            16 => 2,
            _ => 3,
        }
    }

    /// RISC OS mode variable
    pub fn variable(&self, n: u32) -> Option<i32> {
        let bpp = 1usize << self.log2_bpp();
        Some(match n {
            0 => {
                if self.teletext {
                    7
                } else if self.cell_height == 10 {
                    4
                } else {
                    0
                }
            }
            1 => self.columns() as i32 - 1,
            2 => self.rows() as i32 - 1,
            3 => match self.colours {
                256 => 63,
                c => c as i32 - 1,
            },
            4 => self.xeig() as i32,
            5 => self.yeig() as i32,
            6 => (self.xres * bpp / 8) as i32,
            7 => (self.xres * self.yres * bpp / 8) as i32,
            8 => 0,
            9 | 10 => self.log2_bpp() as i32,
            11 => self.xres as i32 - 1,
            12 => self.yres as i32 - 1,
            _ => return None,
        })
    }
}

/// The BBC's sixteen colours
const BBC_COLOURS: [u32; 16] = [
    0x000000, 0xFF0000, 0x00FF00, 0xFFFF00, 0x0000FF, 0xFF00FF, 0x00FFFF, 0xFFFFFF, //
    0x000000, 0xFF0000, 0x00FF00, 0xFFFF00, 0x0000FF, 0xFF00FF, 0x00FFFF, 0xFFFFFF,
];

/// Default palette for a number of colours
pub fn default_palette(colours: u32) -> Vec<u32> {
    let mut palette = vec![0u32; 256];
    match colours {
        2 => {
            palette[1] = 0xFFFFFF;
        }
        4 => {
            palette[1] = 0xFF0000;
            palette[2] = 0xFFFF00;
            palette[3] = 0xFFFFFF;
        }
        16 => palette[..16].copy_from_slice(&BBC_COLOURS),
        _ => {
            for (c, entry) in palette.iter_mut().enumerate() {
                let tint = (c & 3) as u32;
                let component = |bits: usize| ((((c >> bits) & 3) as u32 * 4 + tint) * 0x11) & 0xFF;
                *entry = component(2) << 16 | component(4) << 8 | component(6);
            }
        }
    }
    palette
}

/// VDU 23,16 cursor movement flags
pub const MOVE_PROTECT: u8 = 1;
pub const MOVE_NEG_X: u8 = 2;
pub const MOVE_NEG_Y: u8 = 4;
pub const MOVE_SWAP: u8 = 8;
pub const MOVE_NO_SCROLL: u8 = 16;
pub const MOVE_NO_ADVANCE: u8 = 32;
pub const MOVE_NO_WRAP: u8 = 64;

/// Direction content moves in a scroll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scroll {
    Right,
    Left,
    Down,
    Up,
}

impl Scroll {
    fn delta(self) -> (isize, isize) {
        match self {
            Scroll::Right => (1, 0),
            Scroll::Left => (-1, 0),
            Scroll::Down => (0, 1),
            Scroll::Up => (0, -1),
        }
    }
}

/// Text window in character cells, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextWindow {
    pub left: usize,
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
}

impl TextWindow {
    fn width(&self) -> i32 {
        (self.right - self.left + 1) as i32
    }

    fn height(&self) -> i32 {
        (self.bottom - self.top + 1) as i32
    }
}

/// Screen state and VDU command interpreter
pub struct Screen {
    video: Arc<Video>,
    mode: ModeInfo,
    /// The write bank, taken out of `banks` while it is selected
    canvas: Canvas,
    banks: Vec<Canvas>,
    write_bank: usize,
    display_bank: usize,
    pub graphics: Graphics,
    pub teletext: Teletext,
    palette: Vec<u32>,
    font: Vec<[u8; 8]>,
    /// Character at each cell outside MODE 7
    chars: Vec<u8>,
    window: TextWindow,
    /// Cursor relative to the text window
    cursor: (i32, i32),
    pending_wrap: bool,
    pub text_fg: u32,
    pub text_bg: u32,
    /// Tints: text fg, text bg, graphics fg, graphics bg
    tints: [u8; 4],
    pub move_flags: u8,
    /// VDU 5: text at the graphics cursor
    vdu5: bool,
    enabled: bool,
    printer: bool,
    pub cursor_visible: bool,
    paged: bool,
    paged_lines: i32,
    page_full: bool,
    queue: Vec<u8>,
    count: usize,
    /// Copy of every byte written, kept while capturing
    output: Option<Vec<u8>>,
    echo: Option<Box<dyn Write + Send>>,
    echo_buf: Vec<u8>,
    spool: Option<File>,
    tt_on: Vec<u32>,
    tt_off: Vec<u32>,
}

impl std::fmt::Debug for Screen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Screen")
            .field("mode", &self.mode)
            .field("cursor", &self.cursor)
            .field("window", &self.window)
            .finish()
    }
}

impl Screen {
    pub fn new(video: Arc<Video>, mode: u32) -> Result<Self> {
        let info = mode_info(mode).ok_or_else(|| BasicError::new(ErrorKind::BadMode).with_int(mode as i64))?;
        let mut screen = Self {
            video,
            mode: info,
            canvas: Canvas::new(info.xres, info.yres),
            banks: Vec::new(),
            write_bank: 0,
            display_bank: 0,
            graphics: Graphics::new(info.xres, info.yres, info.xeig(), info.yeig(), info.colours),
            teletext: Teletext::new(),
            palette: default_palette(info.colours),
            font: (0..=255u8).map(font::glyph).collect(),
            chars: Vec::new(),
            window: TextWindow { left: 0, top: 0, right: 0, bottom: 0 },
            cursor: (0, 0),
            pending_wrap: false,
            text_fg: 0,
            text_bg: 0,
            tints: [0; 4],
            move_flags: 0,
            vdu5: false,
            enabled: true,
            printer: false,
            cursor_visible: true,
            paged: false,
            paged_lines: 0,
            page_full: false,
            queue: Vec::with_capacity(10),
            count: 0,
            output: None,
            echo: None,
            echo_buf: Vec::new(),
            spool: None,
            tt_on: Vec::new(),
            tt_off: Vec::new(),
        };
        screen.apply_mode(info)?;
        Ok(screen)
    }

    /// Mirror printable output to a host terminal
    pub fn set_echo(&mut self, sink: Box<dyn Write + Send>) {
        self.echo = Some(sink);
    }

    pub fn video(&self) -> &Arc<Video> {
        &self.video
    }

    pub fn mode(&self) -> &ModeInfo {
        &self.mode
    }

    pub fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    /// Current write and display banks, numbered from 1
    pub fn banks(&self) -> (usize, usize) {
        (self.write_bank + 1, self.display_bank + 1)
    }

    /// Direct drawing to bank `n` (`OSBYTE 112`). Bank 0 means bank 1 and
    /// banks that do not exist are ignored. Returns the previous bank.
    pub fn select_write_bank(&mut self, n: usize) -> usize {
        let previous = self.write_bank + 1;
        let Some(index) = bank_index(n) else {
            return previous;
        };
        if index != self.write_bank && !self.mode.teletext {
            std::mem::swap(&mut self.canvas, &mut self.banks[self.write_bank]);
            std::mem::swap(&mut self.canvas, &mut self.banks[index]);
            self.write_bank = index;
            trace!(bank = n, "write bank");
        }
        previous
    }

    /// Show bank `n` (`OSBYTE 113`), returning the previous bank
    pub fn select_display_bank(&mut self, n: usize) -> usize {
        let previous = self.display_bank + 1;
        let Some(index) = bank_index(n) else {
            return previous;
        };
        if index != self.display_bank && !self.mode.teletext {
            self.display_bank = index;
            trace!(bank = n, "display bank");
            self.show_display_bank();
        }
        previous
    }

    /// Copy the whole of the display bank to the display
    fn show_display_bank(&mut self) {
        let index = self.display_bank;
        let shown = if index == self.write_bank { &self.canvas } else { &self.banks[index] };
        let (palette, mode) = (&self.palette, &self.mode);
        self.video.with_display(|d| {
            let width = d.width;
            graphics::blit(shown, shown.bounds(), palette, mode.xscale, mode.yscale, &mut d.pixels, width);
        });
    }

    /// Start or stop keeping a copy of the output bytes
    pub fn set_capture(&mut self, on: bool) {
        self.output = if on { Some(Vec::new()) } else { None };
    }

    /// Output captured since the last call
    pub fn take_output(&mut self) -> Vec<u8> {
        self.output.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// Bytes collected for the command in progress, including the code
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Drop any partly received command
    pub fn reset_queue(&mut self) {
        self.queue.clear();
    }

    /// Characters printed since the last newline
    pub fn count(&self) -> usize {
        self.count
    }

    /// Text cursor column relative to the window
    pub fn pos(&self) -> i32 {
        self.cursor.0
    }

    /// Text cursor row relative to the window
    pub fn vpos(&self) -> i32 {
        self.cursor.1
    }

    pub fn window(&self) -> TextWindow {
        self.window
    }

    pub fn vdu_enabled(&self) -> bool {
        self.enabled
    }

    /// Paged mode filled a window: the caller waits for a key
    pub fn take_page_full(&mut self) -> bool {
        std::mem::take(&mut self.page_full)
    }

    /// Character at an absolute cell, as the program wrote it
    pub fn char_at(&self, col: usize, row: usize) -> u8 {
        if self.mode.teletext {
            return from_mode7(self.teletext.get(col, row));
        }
        let cols = self.mode.columns();
        if col >= cols || row >= self.mode.rows() {
            return b' ';
        }
        self.chars[row * cols + col]
    }

    /// Character under the text cursor
    pub fn char_at_cursor(&self) -> u8 {
        let (x, y) = self.absolute();
        self.char_at(x as usize, y as usize)
    }

    /// Current shape of a character
    pub fn char_definition(&self, code: u8) -> [u8; 8] {
        self.font[code as usize]
    }

    pub fn define_char(&mut self, code: u8, rows: [u8; 8]) {
        self.font[code as usize] = rows;
    }

    /// Run a drawing operation on the graphics canvas
    pub fn with_graphics<R>(&mut self, f: impl FnOnce(&mut Graphics, &mut Canvas) -> R) -> R {
        f(&mut self.graphics, &mut self.canvas)
    }

    /// Colour number under a point, and its tint in 256-colour modes
    pub fn point(&self, x: i32, y: i32) -> (i32, i32) {
        let c = self.graphics.point(&self.canvas, x, y);
        if c < 0 || self.mode.colours != 256 {
            return (c, 0);
        }
        (c >> 2, (c & 3) << 6)
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        for &b in bytes {
            self.write_byte(b)?;
        }
        self.flush();
        Ok(())
    }

    pub fn write_str(&mut self, s: &str) -> Result<()> {
        self.write(s.as_bytes())
    }

    /// Feed one byte to the VDU driver
    pub fn write_byte(&mut self, b: u8) -> Result<()> {
        if let Some(out) = self.output.as_mut() {
            out.push(b);
        }
        if let Some(spool) = self.spool.as_mut() {
            // Spooling stops rather than failing the program
            if spool.write_all(&[b]).is_err() {
                self.spool = None;
            }
        }
        if !self.queue.is_empty() {
            self.queue.push(b);
            if self.queue.len() > queue_length(self.queue[0]) {
                let command = std::mem::take(&mut self.queue);
                return self.command(&command);
            }
            return Ok(());
        }
        if !self.enabled {
            if b == 6 {
                self.enabled = true;
            }
            return Ok(());
        }
        if b < 32 && queue_length(b) > 0 {
            self.queue.push(b);
            return Ok(());
        }
        self.command(&[b])
    }

    fn echo(&mut self, b: u8) {
        if self.echo.is_some() {
            self.echo_buf.push(b);
        }
    }

    /// Copy changes to the display and the host terminal
    pub fn flush(&mut self) {
        if self.mode.teletext {
            let rows = self.teletext.render(&mut self.tt_on, &mut self.tt_off);
            if !rows.is_empty() {
                let (on, off) = (&self.tt_on, &self.tt_off);
                self.video.with_display(|d| {
                    if d.pixels.len() == on.len() {
                        d.pixels.copy_from_slice(on);
                        d.flash_off = Some(off.clone());
                    }
                });
            }
        } else if let Some(rect) = self.canvas.take_dirty().filter(|_| self.write_bank == self.display_bank) {
            let (canvas, palette, mode) = (&self.canvas, &self.palette, &self.mode);
            self.video.with_display(|d| {
                let width = d.width;
                graphics::blit(canvas, rect, palette, mode.xscale, mode.yscale, &mut d.pixels, width);
            });
        }
        if let Some(echo) = self.echo.as_mut() {
            if !self.echo_buf.is_empty() {
                // Host terminal problems must not stop the program
                let _ = echo.write_all(&self.echo_buf).and_then(|_| echo.flush());
                self.echo_buf.clear();
            }
        }
    }

    fn command(&mut self, q: &[u8]) -> Result<()> {
        let code = q[0];
        if code >= 32 {
            if code == 127 {
                self.delete();
            } else {
                self.put_char(code);
            }
            return Ok(());
        }
        trace!(code, params = ?&q[1..], "vdu");
        match code {
            0 | 27 => {}
            1 => {
                if self.printer {
                    trace!(byte = q[1], "printer");
                }
            }
            2 => self.printer = true,
            3 => self.printer = false,
            4 => self.vdu5 = false,
            5 => self.vdu5 = !self.mode.teletext,
            6 => self.enabled = true,
            7 => self.echo(7),
            8 => {
                self.echo(8);
                self.back();
            }
            9 => self.advance(),
            10 => {
                self.echo(10);
                self.line_feed();
            }
            11 => self.line_up(),
            12 => self.cls(),
            13 => {
                self.echo(13);
                self.carriage_return();
            }
            14 => {
                self.paged = true;
                self.paged_lines = 0;
            }
            15 => self.paged = false,
            16 => {
                if !self.mode.teletext {
                    self.graphics.clear_window(&mut self.canvas);
                }
            }
            17 => self.set_text_colour(q[1]),
            18 => self.set_graphics_colour(q[1], q[2]),
            19 => self.set_palette_entry(q[1], q[2], q[3], q[4], q[5]),
            20 => self.reset_colours(),
            21 => self.enabled = false,
            22 => self.set_mode(q[1] as u32)?,
            23 => self.vdu23(&q[1..])?,
            24 => {
                let (l, b, r, t) = (word(q, 1), word(q, 3), word(q, 5), word(q, 7));
                // An invalid window is ignored
                let _ = self.graphics.set_window(l, b, r, t);
            }
            25 => self.plot(q[1], word(q, 2), word(q, 4))?,
            26 => self.reset_windows(),
            28 => self.set_text_window(q[1] as usize, q[2] as usize, q[3] as usize, q[4] as usize),
            29 => self.graphics.origin = (word(q, 1), word(q, 3)),
            30 => self.home(),
            31 => self.tab(q[1] as i32, q[2] as i32),
            _ => {}
        }
        Ok(())
    }

    /// Run a PLOT command
    pub fn plot(&mut self, code: u8, x: i32, y: i32) -> Result<()> {
        if self.mode.teletext {
            return Ok(());
        }
        self.graphics.plot(&mut self.canvas, code, x, y)
    }

    fn vdu23(&mut self, p: &[u8]) -> Result<()> {
        match p[0] {
            0 => {
                // CRTC register 10: cursor start line and blink mode
                if p[1] == 10 {
                    self.cursor_visible = p[2] & 0x60 != 0x20;
                }
            }
            1 => self.cursor_visible = p[1] != 0,
            6 => {
                let pattern = p[1..9].iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
                self.graphics.dot_pattern = pattern;
            }
            7 => {
                let whole = p[1] != 0;
                let direction = match p[2] & 7 {
                    0 => Scroll::Right,
                    1 => Scroll::Left,
                    2 => Scroll::Down,
                    3 => Scroll::Up,
                    // Directions relative to cursor movement
                    4 => self.scroll_for(false, false),
                    5 => self.scroll_for(false, true),
                    6 => self.scroll_for(true, false),
                    _ => self.scroll_for(true, true),
                };
                let window = if whole { self.full_window() } else { self.window };
                self.scroll(window, direction);
            }
            16 => self.move_flags = (self.move_flags & p[2]) ^ p[1],
            17 => match p[1] {
                0..=3 => {
                    self.tints[p[1] as usize] = p[2] & 0xC0;
                    self.apply_tints();
                }
                5 => std::mem::swap(&mut self.text_fg, &mut self.text_bg),
                _ => {}
            },
            18 => match p[1] {
                1 => {
                    self.teletext.reveal = p[2] & 1 != 0;
                    self.teletext.invalidate();
                }
                2 => {
                    self.teletext.black_enable = p[2] & 1 != 0;
                    self.teletext.invalidate();
                }
                3 => {
                    self.teletext.hold_bug = p[2] & 1 != 0;
                    self.teletext.invalidate();
                }
                4 => self.teletext.set_charsets(p[2], p[3]),
                _ => {}
            },
            22 => {
                let xres = u16::from_le_bytes([p[1], p[2]]) as usize;
                let yres = u16::from_le_bytes([p[3], p[4]]) as usize;
                let colours = match p[7] {
                    2 | 4 | 16 => p[7] as u32,
                    _ => 256,
                };
                self.set_custom_mode(xres, yres, colours)?;
            }
            32..=255 => {
                let mut rows = [0u8; 8];
                rows.copy_from_slice(&p[1..9]);
                self.define_char(p[0], rows);
            }
            _ => {}
        }
        Ok(())
    }

    /// Select a built-in mode
    pub fn set_mode(&mut self, number: u32) -> Result<()> {
        let info = mode_info(number).ok_or_else(|| BasicError::new(ErrorKind::BadMode).with_int(number as i64))?;
        self.apply_mode(info)
    }

    /// Define and select a mode of the given size
    pub fn set_custom_mode(&mut self, xres: usize, yres: usize, colours: u32) -> Result<()> {
        if xres < 8 || yres < 8 || xres > crate::video::MAX_SURFACE.0 || yres > crate::video::MAX_SURFACE.1 {
            return Err(ErrorKind::BadModeSc.into());
        }
        let info = ModeInfo {
            number: CUSTOM_MODE,
            xres,
            yres,
            colours,
            xscale: 1,
            yscale: 1,
            cell_height: 8,
            teletext: false,
        };
        self.apply_mode(info)
    }

    fn apply_mode(&mut self, info: ModeInfo) -> Result<()> {
        let (width, height) = info.display_size();
        self.video.request(Request::Resize { width, height, mode: info.number })?;
        debug!(mode = info.number, width, height, "mode change");
        self.mode = info;
        self.canvas = Canvas::new(info.xres, info.yres);
        self.banks = (0..SCREEN_BANKS).map(|_| Canvas::new(info.xres, info.yres)).collect();
        self.banks[0] = Canvas::new(0, 0);
        self.write_bank = 0;
        self.display_bank = 0;
        let max_fill = self.graphics.max_fill;
        self.graphics = Graphics::new(info.xres, info.yres, info.xeig(), info.yeig(), info.colours);
        self.graphics.max_fill = max_fill;
        self.palette = default_palette(info.colours);
        self.chars = vec![b' '; info.columns() * info.rows()];
        self.tints = [0; 4];
        self.move_flags = 0;
        self.vdu5 = false;
        self.paged_lines = 0;
        self.queue.clear();
        if info.teletext {
            let (primary, alternate, euro) = (self.teletext.primary, self.teletext.alternate, self.teletext.euro);
            self.teletext = Teletext::new();
            self.teletext.primary = primary;
            self.teletext.alternate = alternate;
            self.teletext.euro = euro;
            self.tt_on = vec![0; teletext::WIDTH * teletext::HEIGHT];
            self.tt_off = vec![0; teletext::WIDTH * teletext::HEIGHT];
        } else {
            self.tt_on = Vec::new();
            self.tt_off = Vec::new();
        }
        self.reset_colours();
        self.reset_windows();
        self.cls();
        self.canvas.touch(self.canvas.bounds());
        self.flush();
        Ok(())
    }

    fn full_window(&self) -> TextWindow {
        TextWindow { left: 0, top: 0, right: self.mode.columns() - 1, bottom: self.mode.rows() - 1 }
    }

    /// VDU 26
    pub fn reset_windows(&mut self) {
        self.window = self.full_window();
        self.graphics.reset_window();
        self.graphics.origin = (0, 0);
        self.cursor = (0, 0);
        self.pending_wrap = false;
    }

    /// VDU 28. Windows that do not fit on the screen are ignored.
    pub fn set_text_window(&mut self, left: usize, bottom: usize, right: usize, top: usize) {
        if left > right || top > bottom || right >= self.mode.columns() || bottom >= self.mode.rows() {
            return;
        }
        self.window = TextWindow { left, top, right, bottom };
        if !(0..self.window.width()).contains(&self.cursor.0) || !(0..self.window.height()).contains(&self.cursor.1) {
            self.home();
        }
    }

    /// VDU 20: default palette and colours
    pub fn reset_colours(&mut self) {
        self.palette = default_palette(self.mode.colours);
        self.tints = [0; 4];
        let white = match self.mode.colours {
            256 => 0xFF,
            16 => 7,
            c => c - 1,
        };
        self.text_fg = white;
        self.text_bg = 0;
        self.graphics.fg = Pen { colour: white, action: ACTION_REPLACE };
        self.graphics.bg = Pen { colour: 0, action: ACTION_REPLACE };
        self.palette_changed();
    }

    /// Stored colour number for a logical colour and tint
    fn colour_number(&self, n: u8, tint: u8) -> u32 {
        if self.mode.colours == 256 {
            (((n & 63) as u32) << 2) | (tint >> 6) as u32
        } else {
            n as u32 & (self.mode.colours - 1)
        }
    }

    fn set_text_colour(&mut self, n: u8) {
        if n < 128 {
            self.text_fg = self.colour_number(n, self.tints[0]);
        } else {
            self.text_bg = self.colour_number(n - 128, self.tints[1]);
        }
    }

    fn set_graphics_colour(&mut self, action: u8, n: u8) {
        if n < 128 {
            self.graphics.fg = Pen { colour: self.colour_number(n, self.tints[2]), action: action & 7 };
        } else {
            self.graphics.bg = Pen { colour: self.colour_number(n - 128, self.tints[3]), action: action & 7 };
        }
    }

    fn apply_tints(&mut self) {
        if self.mode.colours != 256 {
            return;
        }
        let with = |c: u32, t: u8| (c & !3) | (t >> 6) as u32;
        self.text_fg = with(self.text_fg, self.tints[0]);
        self.text_bg = with(self.text_bg, self.tints[1]);
        self.graphics.fg.colour = with(self.graphics.fg.colour, self.tints[2]);
        self.graphics.bg.colour = with(self.graphics.bg.colour, self.tints[3]);
    }

    /// Current tint of a text or graphics colour (0 text fg .. 3 graphics bg)
    pub fn tint(&self, which: usize) -> u8 {
        self.tints.get(which).copied().unwrap_or(0)
    }

    /// VDU 19
    pub fn set_palette_entry(&mut self, logical: u8, physical: u8, r: u8, g: u8, b: u8) {
        let index = (logical as u32 & (self.mode.colours - 1).min(255)) as usize;
        let rgb = match physical {
            0..=15 => BBC_COLOURS[physical as usize],
            16 => (r as u32) << 16 | (g as u32) << 8 | b as u32,
            // Border and pointer colours have no surface to change
            _ => return,
        };
        if self.mode.colours == 256 {
            // Logical colours 0-63 cover four tints each
            for t in 0..4 {
                if let Some(entry) = self.palette.get_mut(((index & 63) << 2) | t) {
                    *entry = rgb;
                }
            }
        } else {
            self.palette[index] = rgb;
        }
        self.palette_changed();
    }

    fn palette_changed(&mut self) {
        self.canvas.touch(self.canvas.bounds());
        if self.write_bank != self.display_bank {
            self.show_display_bank();
        }
    }

    /// RGB of a logical colour
    pub fn palette_entry(&self, logical: u32) -> (u8, u8, u8) {
        let index = if self.mode.colours == 256 { (logical & 63) << 2 } else { logical & (self.mode.colours - 1) };
        let rgb = self.palette.get(index as usize).copied().unwrap_or(0);
        ((rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8)
    }

    /// Closest logical colour to an RGB value, with its tint
    pub fn nearest_colour(&self, r: u8, g: u8, b: u8) -> (u8, u8) {
        let limit = if self.mode.colours == 256 { 256 } else { self.mode.colours as usize };
        let distance = |rgb: u32| {
            let dr = ((rgb >> 16) & 0xFF) as i32 - r as i32;
            let dg = ((rgb >> 8) & 0xFF) as i32 - g as i32;
            let db = (rgb & 0xFF) as i32 - b as i32;
            dr * dr + dg * dg + db * db
        };
        let best = (0..limit).min_by_key(|&c| distance(self.palette[c])).unwrap_or(0);
        if self.mode.colours == 256 {
            ((best >> 2) as u8, ((best & 3) << 6) as u8)
        } else {
            (best as u8, 0)
        }
    }

    fn absolute(&self) -> (i32, i32) {
        (self.window.left as i32 + self.cursor.0, self.window.top as i32 + self.cursor.1)
    }

    /// Cursor position along the print direction and the line direction
    fn logical(&self) -> (i32, i32) {
        let (w, h) = (self.window.width(), self.window.height());
        let x = if self.move_flags & MOVE_NEG_X != 0 { w - 1 - self.cursor.0 } else { self.cursor.0 };
        let y = if self.move_flags & MOVE_NEG_Y != 0 { h - 1 - self.cursor.1 } else { self.cursor.1 };
        if self.move_flags & MOVE_SWAP != 0 {
            (y, x)
        } else {
            (x, y)
        }
    }

    fn logical_size(&self) -> (i32, i32) {
        let (w, h) = (self.window.width(), self.window.height());
        if self.move_flags & MOVE_SWAP != 0 {
            (h, w)
        } else {
            (w, h)
        }
    }

    fn set_logical(&mut self, p: i32, s: i32) {
        let (x, y) = if self.move_flags & MOVE_SWAP != 0 { (s, p) } else { (p, s) };
        let (w, h) = (self.window.width(), self.window.height());
        let x = if self.move_flags & MOVE_NEG_X != 0 { w - 1 - x } else { x };
        let y = if self.move_flags & MOVE_NEG_Y != 0 { h - 1 - y } else { y };
        self.cursor = (x.clamp(0, w - 1), y.clamp(0, h - 1));
    }

    /// Scroll direction that moves content against the cursor's line
    /// (`line`) or print direction. `backward` reverses it.
    fn scroll_for(&self, line: bool, backward: bool) -> Scroll {
        let swap = self.move_flags & MOVE_SWAP != 0;
        let vertical = line != swap;
        let negative = if vertical { self.move_flags & MOVE_NEG_Y != 0 } else { self.move_flags & MOVE_NEG_X != 0 };
        match (vertical, negative != backward) {
            (true, false) => Scroll::Up,
            (true, true) => Scroll::Down,
            (false, false) => Scroll::Left,
            (false, true) => Scroll::Right,
        }
    }

    fn take_pending_wrap(&mut self) {
        if std::mem::take(&mut self.pending_wrap) {
            let (_, s) = self.logical();
            self.set_logical(0, s);
            self.line_feed();
        }
    }

    /// VDU 9
    fn advance(&mut self) {
        if self.vdu5 {
            self.graphics.last[0].0 += 8 << self.graphics.xeig;
            return;
        }
        self.pending_wrap = false;
        let (p, s) = self.logical();
        let (pl, _) = self.logical_size();
        if p + 1 < pl {
            self.set_logical(p + 1, s);
        } else if self.move_flags & MOVE_NO_WRAP == 0 {
            self.set_logical(0, s);
            self.line_feed();
        }
    }

    /// VDU 8
    fn back(&mut self) {
        if self.vdu5 {
            self.graphics.last[0].0 -= 8 << self.graphics.xeig;
            return;
        }
        self.pending_wrap = false;
        let (p, s) = self.logical();
        let (pl, _) = self.logical_size();
        if p > 0 {
            self.set_logical(p - 1, s);
        } else if self.move_flags & MOVE_NO_WRAP == 0 {
            self.set_logical(pl - 1, s);
            self.line_up();
        }
    }

    /// VDU 10
    fn line_feed(&mut self) {
        if self.vdu5 {
            self.graphics.last[0].1 -= (self.mode.cell_height as i32) << self.graphics.yeig;
            return;
        }
        self.count = 0;
        let (p, s) = self.logical();
        let (_, sl) = self.logical_size();
        if s + 1 < sl {
            self.set_logical(p, s + 1);
        } else if self.move_flags & MOVE_NO_SCROLL != 0 {
            self.set_logical(p, 0);
        } else {
            let direction = self.scroll_for(true, false);
            self.scroll(self.window, direction);
        }
        if self.paged {
            self.paged_lines += 1;
            if self.paged_lines >= self.window.height() - 1 {
                self.paged_lines = 0;
                self.page_full = true;
            }
        }
    }

    /// VDU 11
    fn line_up(&mut self) {
        if self.vdu5 {
            self.graphics.last[0].1 += (self.mode.cell_height as i32) << self.graphics.yeig;
            return;
        }
        let (p, s) = self.logical();
        let (_, sl) = self.logical_size();
        if s > 0 {
            self.set_logical(p, s - 1);
        } else if self.move_flags & MOVE_NO_SCROLL != 0 {
            self.set_logical(p, sl - 1);
        } else {
            let direction = self.scroll_for(true, true);
            self.scroll(self.window, direction);
        }
    }

    /// VDU 13
    fn carriage_return(&mut self) {
        self.count = 0;
        if self.vdu5 {
            let left = self.graphics.clip.left << self.graphics.xeig;
            self.graphics.last[0].0 = left;
            return;
        }
        self.pending_wrap = false;
        let (_, s) = self.logical();
        self.set_logical(0, s);
    }

    /// VDU 30
    pub fn home(&mut self) {
        self.pending_wrap = false;
        self.set_logical(0, 0);
    }

    /// VDU 31: move the text cursor within the window
    pub fn tab(&mut self, x: i32, y: i32) {
        if self.vdu5 {
            return;
        }
        if x < self.window.width() && y < self.window.height() {
            self.pending_wrap = false;
            self.cursor = (x, y);
        }
    }

    /// VDU 12
    pub fn cls(&mut self) {
        let w = self.window;
        if self.mode.teletext {
            self.teletext.clear(w.left, w.top, w.right, w.bottom);
        } else {
            self.fill_cells(w, self.text_bg);
            let cols = self.mode.columns();
            for row in w.top..=w.bottom {
                self.chars[row * cols + w.left..=row * cols + w.right].fill(b' ');
            }
        }
        self.count = 0;
        self.paged_lines = 0;
        self.home();
    }

    fn cell_rect(&self, w: TextWindow) -> Rect {
        let ch = self.mode.cell_height as i32;
        Rect::new(w.left as i32 * 8, w.top as i32 * ch, (w.right as i32 + 1) * 8 - 1, (w.bottom as i32 + 1) * ch - 1)
    }

    fn fill_cells(&mut self, w: TextWindow, colour: u32) {
        let rect = self.cell_rect(w);
        self.canvas.fill_rect(rect, colour);
    }

    /// Move the contents of `w` one character cell, clearing the
    /// exposed row or column to the text background
    pub fn scroll(&mut self, w: TextWindow, direction: Scroll) {
        let (dx, dy) = direction.delta();
        if self.mode.teletext {
            self.teletext.shift(w.left, w.top, w.right, w.bottom, dx, dy);
            return;
        }
        let cols = self.mode.columns();
        let old = self.chars.clone();
        for row in w.top..=w.bottom {
            for col in w.left..=w.right {
                let sr = row as isize - dy;
                let sc = col as isize - dx;
                let inside = sr >= w.top as isize && sr <= w.bottom as isize && sc >= w.left as isize && sc <= w.right as isize;
                self.chars[row * cols + col] = if inside { old[sr as usize * cols + sc as usize] } else { b' ' };
            }
        }
        let rect = self.cell_rect(w);
        let (cw, ch) = (8, self.mode.cell_height as i32);
        let (src, exposed) = match direction {
            Scroll::Up => (
                Rect::new(rect.left, rect.top + ch, rect.right, rect.bottom),
                Rect::new(rect.left, rect.bottom - ch + 1, rect.right, rect.bottom),
            ),
            Scroll::Down => (
                Rect::new(rect.left, rect.top, rect.right, rect.bottom - ch),
                Rect::new(rect.left, rect.top, rect.right, rect.top + ch - 1),
            ),
            Scroll::Left => (
                Rect::new(rect.left + cw, rect.top, rect.right, rect.bottom),
                Rect::new(rect.right - cw + 1, rect.top, rect.right, rect.bottom),
            ),
            Scroll::Right => (
                Rect::new(rect.left, rect.top, rect.right - cw, rect.bottom),
                Rect::new(rect.left, rect.top, rect.left + cw - 1, rect.bottom),
            ),
        };
        if src.left <= src.right && src.top <= src.bottom {
            self.canvas.copy_rect(src, src.left + dx as i32 * cw, src.top + dy as i32 * ch);
        }
        self.canvas.fill_rect(exposed, self.text_bg);
    }

    fn draw_glyph(&mut self, col: i32, row: i32, code: u8) {
        let ch = self.mode.cell_height as i32;
        let (x0, y0) = (col * 8, row * ch);
        self.canvas.fill_rect(Rect::new(x0, y0, x0 + 7, y0 + ch - 1), self.text_bg);
        let shape = self.font[code as usize];
        for (dy, bits) in shape.iter().enumerate() {
            for dx in 0..8 {
                if bits & (0x80 >> dx) != 0 {
                    self.canvas.put(x0 + dx, y0 + dy as i32, self.text_fg);
                }
            }
        }
    }

    /// Text at the graphics cursor: transparent, using the graphics colour
    fn draw_graphics_char(&mut self, code: u8) {
        let g = &self.graphics;
        let (x, y) = g.last[0];
        let (px, py) = (g.to_px(x), g.to_py(y));
        let shape = self.font[code as usize];
        let pen = g.fg;
        for (dy, bits) in shape.iter().enumerate() {
            for dx in 0..8 {
                if bits & (0x80 >> dx) != 0 {
                    let (cx, cy) = (px + dx, py + dy as i32);
                    if g.clip.contains(cx, cy) {
                        if let Some(dest) = self.canvas.get(cx, cy) {
                            self.canvas.put(cx, cy, graphics::blend(dest, pen.colour, pen.action, g.mask));
                        }
                    }
                }
            }
        }
        self.graphics.last[0].0 += 8 << self.graphics.xeig;
    }

    fn put_char(&mut self, code: u8) {
        self.echo(code);
        self.count += 1;
        if self.vdu5 {
            self.draw_graphics_char(code);
            return;
        }
        self.take_pending_wrap();
        let (x, y) = self.absolute();
        if self.mode.teletext {
            self.teletext.put(x as usize, y as usize, to_mode7(code));
        } else {
            let cols = self.mode.columns();
            if let Some(cell) = self.chars.get_mut(y as usize * cols + x as usize) {
                *cell = code;
            }
            self.draw_glyph(x, y, code);
        }
        if self.move_flags & MOVE_NO_ADVANCE != 0 {
            return;
        }
        let (p, _) = self.logical();
        let (pl, _) = self.logical_size();
        if self.move_flags & MOVE_PROTECT != 0 && p + 1 == pl {
            self.pending_wrap = true;
        } else {
            self.advance();
        }
    }

    /// VDU 127: back up and blank the character
    fn delete(&mut self) {
        self.echo(8);
        self.echo(b' ');
        self.echo(8);
        self.back();
        if self.vdu5 {
            let (x, y) = self.graphics.last[0];
            let (px, py) = (self.graphics.to_px(x), self.graphics.to_py(y));
            let rect = Rect::new(px, py, px + 7, py + self.mode.cell_height as i32 - 1);
            self.canvas.fill_rect(rect, self.graphics.bg.colour);
            return;
        }
        let (x, y) = self.absolute();
        if self.mode.teletext {
            self.teletext.put(x as usize, y as usize, b' ');
        } else {
            let cols = self.mode.columns();
            if let Some(cell) = self.chars.get_mut(y as usize * cols + x as usize) {
                *cell = b' ';
            }
            self.draw_glyph(x, y, b' ');
        }
    }

    /// Value of a VDU variable (128 and up) or mode variable (below 128)
    pub fn vdu_variable(&self, n: u32) -> Option<i32> {
        if n < 128 {
            return self.mode.variable(n);
        }
        let g = &self.graphics;
        let w = self.window;
        let ch = self.mode.cell_height as i32;
        Some(match n {
            128 => g.clip.left,
            129 => g.height - 1 - g.clip.bottom,
            130 => g.clip.right,
            131 => g.height - 1 - g.clip.top,
            132 => w.left as i32,
            133 => w.bottom as i32,
            134 => w.right as i32,
            135 => w.top as i32,
            136 => g.origin.0,
            137 => g.origin.1,
            138 => g.cursor().0,
            139 => g.cursor().1,
            140 => g.last[2].0,
            141 => g.last[2].1,
            142 => g.last[1].0,
            143 => g.last[1].1,
            144 => g.to_px(g.last[0].0),
            145 => g.height - 1 - g.to_py(g.last[0].1),
            146 => g.last[0].0,
            147 => g.last[0].1,
            148 | 149 => 0,
            150 => self.mode.variable(7).unwrap_or(0),
            151 => g.fg.action as i32,
            152 => g.bg.action as i32,
            153 => g.fg.colour as i32,
            154 => g.bg.colour as i32,
            155 => self.text_fg as i32,
            156 => self.text_bg as i32,
            157 => self.tints[2] as i32,
            158 => self.tints[3] as i32,
            159 => self.tints[0] as i32,
            160 => self.tints[1] as i32,
            161 => MAX_MODE as i32,
            162 | 164 | 167 | 169 => 8,
            163 | 165 | 168 | 170 => ch,
            _ => return None,
        })
    }

    /// Start copying output to a file (`*SPOOL`, `*SPOOLON`)
    pub fn spool_to(&mut self, path: &Path, append: bool) -> Result<()> {
        let file = if append {
            OpenOptions::new().append(true).create(true).open(path)
        } else {
            File::create(path)
        }
        .map_err(|_| BasicError::new(ErrorKind::OpenWrite).with_str(path.display().to_string()))?;
        self.spool = Some(file);
        Ok(())
    }

    pub fn spool_off(&mut self) {
        self.spool = None;
    }

    pub fn spooling(&self) -> bool {
        self.spool.is_some()
    }

    /// Write the display as a 24-bit BMP (`*ScreenSave`)
    pub fn save_bmp(&mut self, path: &Path) -> Result<()> {
        self.flush();
        let bytes = self.video.snapshot(|d| encode_bmp(d.width, d.height, &d.pixels));
        std::fs::write(path, bytes).map_err(|_| BasicError::new(ErrorKind::OpenWrite).with_str(path.display().to_string()))
    }

    /// Load a 24-bit BMP onto the screen (`*ScreenLoad`)
    pub fn load_bmp(&mut self, path: &Path) -> Result<()> {
        let mut data = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut data))
            .map_err(|_| BasicError::new(ErrorKind::NotFound).with_str(path.display().to_string()))?;
        let (width, height, pixels) = decode_bmp(&data).ok_or_else(|| BasicError::new(ErrorKind::BadFormat))?;
        if self.mode.teletext {
            return Err(ErrorKind::BadModeSc.into());
        }
        let (xs, ys) = (self.mode.xscale, self.mode.yscale);
        for py in 0..self.mode.yres.min(height / ys) {
            for px in 0..self.mode.xres.min(width / xs) {
                let rgb = pixels[py * ys * width + px * xs];
                let (c, t) = self.nearest_colour((rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8);
                let colour = self.colour_number(c, t);
                self.canvas.put(px as i32, py as i32, colour);
            }
        }
        self.flush();
        Ok(())
    }
}

fn word(q: &[u8], at: usize) -> i32 {
    i16::from_le_bytes([q[at], q[at + 1]]) as i32
}

/// Character code as stored in MODE 7 screen memory
pub fn to_mode7(code: u8) -> u8 {
    match code {
        0x23 => 0x5F,
        0x5F => 0x60,
        0x60 => 0x23,
        c => c,
    }
}

/// Character code as read back from MODE 7 screen memory
pub fn from_mode7(code: u8) -> u8 {
    match code {
        0x5F => 0x23,
        0x60 => 0x5F,
        0x23 => 0x60,
        c => c,
    }
}

/// Encode RGB pixels as a bottom-up 24-bit BMP
pub fn encode_bmp(width: usize, height: usize, pixels: &[u32]) -> Vec<u8> {
    let stride = (width * 3 + 3) & !3;
    let size = 54 + stride * height;
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(b"BM");
    out.extend_from_slice(&(size as u32).to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&54u32.to_le_bytes());
    out.extend_from_slice(&40u32.to_le_bytes());
    out.extend_from_slice(&(width as i32).to_le_bytes());
    out.extend_from_slice(&(height as i32).to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&24u16.to_le_bytes());
    out.extend_from_slice(&[0; 24]);
    for y in (0..height).rev() {
        let row = &pixels[y * width..(y + 1) * width];
        for &p in row {
            out.extend_from_slice(&[p as u8, (p >> 8) as u8, (p >> 16) as u8]);
        }
        out.resize(out.len() + stride - width * 3, 0);
    }
    out
}

/// Decode an uncompressed 24-bit BMP to RGB pixels, top row first
pub fn decode_bmp(data: &[u8]) -> Option<(usize, usize, Vec<u32>)> {
    let u32_at = |at: usize| data.get(at..at + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
    let i32_at = |at: usize| u32_at(at).map(|v| v as i32);
    if data.get(0..2)? != b"BM" || data.get(28..30)? != [24, 0] {
        return None;
    }
    let offset = u32_at(10)? as usize;
    let width = i32_at(18)?;
    let height = i32_at(22)?;
    if width <= 0 || height == 0 {
        return None;
    }
    let (width, bottom_up) = (width as usize, height > 0);
    let height = height.unsigned_abs() as usize;
    let stride = (width * 3 + 3) & !3;
    let mut pixels = vec![0u32; width * height];
    for row in 0..height {
        let y = if bottom_up { height - 1 - row } else { row };
        let start = offset + row * stride;
        let line = data.get(start..start + width * 3)?;
        for (x, bgr) in line.chunks_exact(3).enumerate() {
            pixels[y * width + x] = (bgr[2] as u32) << 16 | (bgr[1] as u32) << 8 | bgr[0] as u32;
        }
    }
    Some((width, height, pixels))
}

fn bank_index(n: usize) -> Option<usize> {
    match n {
        0 => Some(0),
        1..=SCREEN_BANKS => Some(n - 1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn screen(mode: u32) -> Screen {
        Screen::new(Arc::new(Video::headless(640, 512)), mode).unwrap()
    }

    fn row_text(s: &Screen, row: usize, width: usize) -> String {
        (0..width).map(|c| s.char_at(c, row) as char).collect()
    }

    #[test]
    fn test_mode_table() {
        let m0 = mode_info(0).unwrap();
        assert_eq!((m0.xres, m0.yres, m0.colours), (640, 256, 2));
        assert_eq!((m0.xeig(), m0.yeig()), (1, 2));
        assert_eq!((m0.columns(), m0.rows()), (80, 32));
        assert_eq!(m0.display_size(), (640, 512));
        let m6 = mode_info(6).unwrap();
        assert_eq!((m6.columns(), m6.rows()), (40, 25));
        let m7 = mode_info(7).unwrap();
        assert!(m7.teletext);
        assert_eq!(m7.display_size(), (640, 500));
        assert_eq!(mode_info(135), mode_info(7));
        assert!(mode_info(54).is_none());
    }

    #[test]
    fn test_default_palettes() {
        assert_eq!(&default_palette(2)[..2], &[0x000000, 0xFFFFFF]);
        assert_eq!(&default_palette(4)[..4], &[0x000000, 0xFF0000, 0xFFFF00, 0xFFFFFF]);
        let p = default_palette(256);
        assert_eq!(p[0], 0);
        assert_eq!(p[255], 0xFFFFFF);
        // Red bits only, no tint
        assert_eq!(p[0b0000_1100], 0xCC0000);
    }

    #[test]
    fn test_mode_change_resizes_display() {
        let mut s = screen(1);
        s.write(&[22, 0]).unwrap();
        assert_eq!(s.mode().number, 0);
        s.video().snapshot(|d| assert_eq!((d.width, d.height), (640, 512)));
        assert_eq!((s.pos(), s.vpos()), (0, 0));
    }

    #[test]
    fn test_bad_mode() {
        let mut s = screen(1);
        assert_eq!(s.set_mode(99).unwrap_err().kind, ErrorKind::BadMode);
    }

    #[test]
    fn test_print_and_wrap() {
        let mut s = screen(6);
        s.write(&[b'A'; 41]).unwrap();
        assert_eq!((s.pos(), s.vpos()), (1, 1));
        assert_eq!(s.char_at(39, 0), b'A');
        assert_eq!(s.char_at(0, 1), b'A');
    }

    #[test]
    fn test_scroll_at_bottom() {
        let mut s = screen(6);
        s.write(b"TOP\r\n").unwrap();
        for _ in 0..24 {
            s.write(b"\r\n").unwrap();
        }
        assert_eq!(s.vpos(), 24);
        assert_eq!(row_text(&s, 0, 3), "   ");
    }

    #[test]
    fn test_text_window_and_tab() {
        let mut s = screen(6);
        s.write(&[28, 5, 10, 20, 2]).unwrap();
        assert_eq!((s.pos(), s.vpos()), (0, 0));
        s.write(b"X").unwrap();
        assert_eq!(s.char_at(5, 2), b'X');
        s.write(&[31, 3, 4, b'Y']).unwrap();
        assert_eq!(s.char_at(8, 6), b'Y');
        s.write(&[31, 30, 4]).unwrap();
        assert_eq!(s.pos(), 4);
    }

    #[test]
    fn test_scroll_right_twice() {
        let mut s = screen(6);
        for _ in 0..2 {
            s.write(&[23, 7, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
            s.write(b"X\r\n").unwrap();
        }
        assert_eq!(s.char_at(0, 0), b' ');
        assert_eq!(s.char_at(1, 0), b'X');
    }

    #[test]
    fn test_scroll_right_mode7() {
        let mut s = screen(7);
        for _ in 0..2 {
            s.write(&[23, 7, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
            s.write(b"X\r\n").unwrap();
        }
        assert_eq!(s.char_at(0, 0), b' ');
        assert_eq!(s.char_at(1, 0), b'X');
    }

    #[test]
    fn test_movement_flags_reverse_x() {
        let mut s = screen(6);
        s.write(&[23, 16, MOVE_NEG_X, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        s.write(&[30]).unwrap();
        assert_eq!(s.pos(), 39);
        s.write(b"AB").unwrap();
        assert_eq!(s.char_at(39, 0), b'A');
        assert_eq!(s.char_at(38, 0), b'B');
    }

    #[test]
    fn test_scroll_protect_delays_wrap() {
        let mut s = screen(6);
        s.write(&[23, 16, MOVE_PROTECT, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        s.write(&[b'A'; 40]).unwrap();
        assert_eq!((s.pos(), s.vpos()), (39, 0));
        s.write(b"B").unwrap();
        assert_eq!(s.char_at(0, 1), b'B');
    }

    #[test]
    fn test_vdu_disable() {
        let mut s = screen(6);
        s.write(&[21, b'A', 6, b'B']).unwrap();
        assert_eq!(s.char_at(0, 0), b'B');
    }

    #[test]
    fn test_colours_in_256_colour_mode() {
        let mut s = screen(13);
        s.write(&[17, 3]).unwrap();
        assert_eq!(s.text_fg, 3 << 2);
        s.write(&[23, 17, 0, 0xC0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(s.text_fg, (3 << 2) | 3);
        s.write(&[18, 3, 5]).unwrap();
        assert_eq!(s.graphics.fg, Pen { colour: 5 << 2, action: 3 });
    }

    #[test]
    fn test_palette_change() {
        let mut s = screen(1);
        s.write(&[19, 1, 16, 10, 20, 30]).unwrap();
        assert_eq!(s.palette_entry(1), (10, 20, 30));
        s.write(&[19, 2, 4, 0, 0, 0]).unwrap();
        assert_eq!(s.palette_entry(2), (0, 0, 255));
        s.write(&[20]).unwrap();
        assert_eq!(s.palette_entry(1), (255, 0, 0));
        assert_eq!(s.nearest_colour(250, 250, 0), (2, 0));
    }

    #[test]
    fn test_plot_via_vdu25() {
        let mut s = screen(1);
        s.write(&[25, 4, 0, 0, 0, 0, 25, 5, 100, 0, 100, 0]).unwrap();
        assert_eq!(s.point(50, 50).0, 3);
        assert_eq!(s.point(50, 60).0, 0);
        s.video().snapshot(|d| assert!(d.pixels.iter().any(|&p| p == 0xFFFFFF)));
    }

    #[test]
    fn test_drawing_to_hidden_bank() {
        let mut s = screen(1);
        let shown = s.video().snapshot(|d| d.pixels.clone());
        assert_eq!(s.select_write_bank(2), 1);
        s.write(&[25, 4, 0, 0, 0, 0, 25, 5, 100, 0, 100, 0]).unwrap();
        s.flush();
        s.video().snapshot(|d| assert_eq!(d.pixels, shown));
        assert_eq!(s.point(50, 50).0, 3);

        // Bank 1 kept its own contents
        s.select_write_bank(1);
        assert_eq!(s.point(50, 50).0, 0);

        assert_eq!(s.select_display_bank(2), 1);
        assert_eq!(s.banks(), (1, 2));
        s.video().snapshot(|d| assert!(d.pixels.iter().any(|&p| p == 0xFFFFFF)));
        assert_eq!(s.select_display_bank(9), 2);
    }

    #[test]
    fn test_vdu5_text() {
        let mut s = screen(1);
        s.write(&[5, 25, 4, 0, 0, 0, 2, b'I']).unwrap();
        let lit = s.canvas().pixels().iter().filter(|&&c| c != 0).count();
        assert!(lit > 0);
        assert_eq!(s.char_at(0, 0), b' ');
        assert_eq!(s.graphics.cursor(), (32, 512));
    }

    #[test]
    fn test_user_defined_character() {
        let mut s = screen(1);
        s.write(&[23, 200, 0xFF, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(s.char_definition(200)[0], 0xFF);
    }

    #[test]
    fn test_mode7_storage_translation() {
        let mut s = screen(7);
        s.write(b"#").unwrap();
        assert_eq!(s.teletext.get(0, 0), 0x5F);
        assert_eq!(s.char_at(0, 0), b'#');
    }

    #[test]
    fn test_vdu_variables() {
        let s = screen(0);
        assert_eq!(s.vdu_variable(1), Some(79));
        assert_eq!(s.vdu_variable(4), Some(1));
        assert_eq!(s.vdu_variable(134), Some(79));
        assert_eq!(s.vdu_variable(11), Some(639));
    }

    #[test]
    fn test_bmp_round_trip() {
        let pixels = vec![0x112233, 0x445566, 0x778899, 0xAABBCC, 0xDDEEFF, 0x000001];
        let bmp = encode_bmp(3, 2, &pixels);
        assert_eq!(decode_bmp(&bmp), Some((3, 2, pixels)));
    }

    #[test]
    fn test_paged_mode() {
        let mut s = screen(6);
        s.write(&[14]).unwrap();
        for _ in 0..23 {
            s.write(b"\r\n").unwrap();
        }
        assert!(!s.take_page_full());
        s.write(b"\r\n").unwrap();
        assert!(s.take_page_full());
    }

    #[quickcheck]
    fn prop_queue_length(code: u8, n: u8) -> bool {
        let code = code % 32;
        let expected = queue_length(code) + 1;
        let mut s = screen(1);
        // Feed repeated commands whose parameters are all zero
        let mut stream = Vec::new();
        let total = n as usize % 64;
        for i in 0..total {
            stream.push(if i % expected == 0 { code } else { 0 });
        }
        // Mode changes and VDU 21 alter later parsing
        if matches!(code, 21 | 22) {
            return true;
        }
        for b in stream {
            if s.write_byte(b).is_err() {
                return false;
            }
        }
        let queued = s.queued();
        if expected == 1 {
            queued == 0
        } else {
            queued == total % expected
        }
    }
}
