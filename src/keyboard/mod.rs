//! Keyboard service and line editor
//!
//! Keys come from, in order of priority: a `*EXEC` file, the expansion of
//! a function key, keys pushed back by the interpreter, keys read ahead
//! while polling for Escape, and finally the host [`KeySource`].
//!
//! Keys are 9-bit: characters are 0-255, and special keys (function keys,
//! cursor keys) have bit 8 set.

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{BufReader, Bytes, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{BasicError, ErrorKind, Result};
use crate::vdu::Screen;

pub const KEY_F0: u16 = 0x180;
pub const KEY_COPY: u16 = 0x18B;
pub const KEY_LEFT: u16 = 0x18C;
pub const KEY_RIGHT: u16 = 0x18D;
pub const KEY_DOWN: u16 = 0x18E;
pub const KEY_UP: u16 = 0x18F;
pub const KEY_PAGE_DOWN: u16 = 0x19E;
pub const KEY_PAGE_UP: u16 = 0x19F;
pub const KEY_INSERT: u16 = 0x1CD;
pub const KEY_HOME: u16 = 0x1E;

pub const FUNCTION_KEYS: usize = 16;
const HISTORY_LINES: usize = 20;
const HISTORY_BYTES: usize = 1024;
const MOUSE_QUEUE: usize = 7;

/// Where keypresses come from
pub trait KeySource: Send {
    /// Wait for a key. `None` waits forever; `Some(0)` only polls.
    fn read_key(&mut self, timeout_cs: Option<u32>) -> Option<u16>;

    /// Whether a key is held down, by RISC OS internal key number
    fn key_down(&mut self, _key: u8) -> bool {
        false
    }
}

/// Keys supplied in advance, for tests and scripted runs
#[derive(Debug, Default, Clone)]
pub struct ScriptedKeys {
    keys: VecDeque<u16>,
    held: HashSet<u8>,
}

impl ScriptedKeys {
    pub fn new(keys: &[u8]) -> Self {
        Self { keys: keys.iter().map(|&k| k as u16).collect(), held: HashSet::new() }
    }

    pub fn push(&mut self, key: u16) {
        self.keys.push_back(key);
    }

    pub fn hold(&mut self, key: u8) {
        self.held.insert(key);
    }
}

impl KeySource for ScriptedKeys {
    fn read_key(&mut self, _timeout_cs: Option<u32>) -> Option<u16> {
        self.keys.pop_front()
    }

    fn key_down(&mut self, key: u8) -> bool {
        self.held.contains(&key)
    }
}

/// Bytes from standard input when it is not a terminal
pub struct StdinKeys {
    input: Bytes<std::io::Stdin>,
}

impl Default for StdinKeys {
    fn default() -> Self {
        Self { input: std::io::stdin().bytes() }
    }
}

impl KeySource for StdinKeys {
    fn read_key(&mut self, timeout_cs: Option<u32>) -> Option<u16> {
        if timeout_cs == Some(0) {
            return None;
        }
        match self.input.next()? {
            Ok(b'\n') => Some(13),
            Ok(b) => Some(b as u16),
            Err(_) => None,
        }
    }
}

/// The host terminal in raw mode
#[derive(Debug)]
pub struct TerminalKeys {
    escape: Arc<AtomicBool>,
}

impl TerminalKeys {
    /// Ctrl-C read in raw mode sets `escape`, as SIGINT would
    pub fn new(escape: Arc<AtomicBool>) -> Self {
        Self { escape }
    }

    fn interrupt(event: &crossterm::event::KeyEvent) -> bool {
        use crossterm::event::{KeyCode, KeyEventKind, KeyModifiers};
        event.kind != KeyEventKind::Release
            && event.modifiers.contains(KeyModifiers::CONTROL)
            && matches!(event.code, KeyCode::Char('c' | 'C'))
    }

    fn translate(event: crossterm::event::KeyEvent) -> Option<u16> {
        use crossterm::event::{KeyCode, KeyEventKind, KeyModifiers};
        if event.kind == KeyEventKind::Release {
            return None;
        }
        Some(match event.code {
            KeyCode::Char(c) if event.modifiers.contains(KeyModifiers::CONTROL) => {
                (c.to_ascii_uppercase() as u16) & 0x1F
            }
            KeyCode::Char(c) => {
                let mut buf = [0u8; 4];
                let encoded = c.encode_utf8(&mut buf);
                // Non-ASCII characters map to their Latin-1 code where possible
                if encoded.len() == 1 { buf[0] as u16 } else { (c as u32).min(0xFF) as u16 }
            }
            KeyCode::Enter => 13,
            KeyCode::Backspace => 127,
            KeyCode::Tab => 9,
            KeyCode::Esc => 27,
            KeyCode::Delete => 4,
            KeyCode::Home => KEY_HOME,
            KeyCode::End => KEY_COPY,
            KeyCode::Insert => KEY_INSERT,
            KeyCode::Left => KEY_LEFT,
            KeyCode::Right => KEY_RIGHT,
            KeyCode::Down => KEY_DOWN,
            KeyCode::Up => KEY_UP,
            KeyCode::PageUp => KEY_PAGE_UP,
            KeyCode::PageDown => KEY_PAGE_DOWN,
            KeyCode::F(n) if (n as usize) < FUNCTION_KEYS => KEY_F0 + n as u16,
            _ => return None,
        })
    }
}

impl KeySource for TerminalKeys {
    fn read_key(&mut self, timeout_cs: Option<u32>) -> Option<u16> {
        use crossterm::event::{self, Event};
        use crossterm::terminal;
        // Raw mode only while reading, so that Ctrl-C raises SIGINT while running
        terminal::enable_raw_mode().ok()?;
        let deadline = timeout_cs.map(|cs| std::time::Instant::now() + Duration::from_millis(cs as u64 * 10));
        let key = loop {
            let wait = match deadline {
                Some(d) => d.saturating_duration_since(std::time::Instant::now()),
                None => Duration::from_millis(100),
            };
            match event::poll(wait) {
                Ok(true) => {
                    if let Ok(Event::Key(k)) = event::read() {
                        if Self::interrupt(&k) {
                            debug!("interrupt read in raw mode");
                            self.escape.store(true, Ordering::Relaxed);
                            break None;
                        }
                        if let Some(code) = Self::translate(k) {
                            break Some(code);
                        }
                    }
                }
                Ok(false) if deadline.is_some() => {
                    if deadline.is_some_and(|d| std::time::Instant::now() >= d) {
                        break None;
                    }
                }
                Ok(false) => {}
                Err(_) => break None,
            }
        };
        let _ = terminal::disable_raw_mode();
        key
    }
}

/// A pointer event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseEvent {
    pub x: i32,
    pub y: i32,
    pub buttons: i32,
    /// Centisecond clock when the event happened
    pub time: u64,
}

/// Keyboard state owned by the interpreter
pub struct Keyboard {
    source: Box<dyn KeySource>,
    exec: Option<Bytes<BufReader<File>>>,
    expansion: VecDeque<u8>,
    pushback: Vec<u16>,
    typeahead: VecDeque<u16>,
    fkeys: Vec<Vec<u8>>,
    mouse: VecDeque<MouseEvent>,
    mouse_now: MouseEvent,
    /// Centiseconds after which queued mouse events are dropped, 0 for never
    pub mouse_expire: u32,
    pub mouse_enabled: bool,
    history: VecDeque<Vec<u8>>,
    escape: Arc<AtomicBool>,
    pub escape_char: u8,
    /// Whether the escape character raises an error (`*FX 200`, `*FX 229`)
    pub escape_enabled: bool,
    /// Whether acknowledging an escape also flushes the buffers (`*FX 230`)
    pub escape_effects: bool,
    /// Cursor keys edit (0), return codes (1) or act as function keys (2)
    pub cursor_mode: u8,
    pub del_is_bs: bool,
    insert: bool,
}

impl std::fmt::Debug for Keyboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyboard")
            .field("pushback", &self.pushback)
            .field("escape_enabled", &self.escape_enabled)
            .finish()
    }
}

impl Keyboard {
    pub fn new(source: Box<dyn KeySource>, escape: Arc<AtomicBool>) -> Self {
        Self {
            source,
            exec: None,
            expansion: VecDeque::new(),
            pushback: Vec::new(),
            typeahead: VecDeque::new(),
            fkeys: vec![Vec::new(); FUNCTION_KEYS],
            mouse: VecDeque::with_capacity(MOUSE_QUEUE),
            mouse_now: MouseEvent { x: 0, y: 0, buttons: 0, time: 0 },
            mouse_expire: 0,
            mouse_enabled: true,
            history: VecDeque::new(),
            escape,
            escape_char: 27,
            escape_enabled: true,
            escape_effects: true,
            cursor_mode: 0,
            del_is_bs: true,
            insert: true,
        }
    }

    /// Keyboard with scripted keys and its own escape flag
    pub fn scripted(keys: &[u8]) -> Self {
        Self::new(Box::new(ScriptedKeys::new(keys)), Arc::new(AtomicBool::new(false)))
    }

    pub fn set_source(&mut self, source: Box<dyn KeySource>) {
        self.source = source;
    }

    /// Flag set asynchronously by SIGINT
    pub fn escape_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.escape)
    }

    pub fn escape_pending(&self) -> bool {
        self.escape.load(Ordering::Relaxed)
    }

    pub fn set_escape(&self) {
        self.escape.store(true, Ordering::Relaxed);
    }

    /// Acknowledge an escape, returning whether one was pending. The
    /// interpreter flushes the sound and VDU queues as well.
    pub fn clear_escape(&mut self) -> bool {
        let was = self.escape.swap(false, Ordering::Relaxed);
        if was {
            self.discard_on_escape();
        }
        was
    }

    fn discard_on_escape(&mut self) {
        if self.escape_effects {
            self.expansion.clear();
            self.pushback.clear();
            self.typeahead.clear();
            self.stop_exec();
        }
    }

    /// Raise `Escape` if one is pending and escapes are enabled
    pub fn check_escape(&mut self) -> Result<()> {
        if !self.escape_enabled {
            self.escape.store(false, Ordering::Relaxed);
            return Ok(());
        }
        if self.clear_escape() {
            return Err(ErrorKind::Escape.into());
        }
        Ok(())
    }

    /// Look at the host keyboard without waiting, keeping any keys for
    /// later but acting on the escape character at once
    pub fn poll(&mut self) {
        while let Some(key) = self.source.read_key(Some(0)) {
            if key == self.escape_char as u16 && self.escape_enabled {
                self.set_escape();
            } else {
                self.typeahead.push_back(key);
            }
        }
    }

    /// Define a function key (`*KEY`)
    pub fn set_fkey(&mut self, n: usize, text: Vec<u8>) -> Result<()> {
        let slot = self.fkeys.get_mut(n).ok_or_else(|| BasicError::new(ErrorKind::BadKey))?;
        debug!(key = n, len = text.len(), "function key defined");
        *slot = text;
        Ok(())
    }

    pub fn fkey(&self, n: usize) -> Option<&[u8]> {
        self.fkeys.get(n).map(|k| k.as_slice())
    }

    /// Take keyboard input from a file until it runs out (`*EXEC`)
    pub fn exec_file(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|_| BasicError::new(ErrorKind::NotFound).with_str(path.display().to_string()))?;
        self.exec = Some(BufReader::new(file).bytes());
        Ok(())
    }

    pub fn stop_exec(&mut self) {
        self.exec = None;
    }

    /// Keys waiting to be read (`ADVAL(-1)`)
    pub fn buffered(&mut self) -> usize {
        self.poll();
        self.expansion.len() + self.pushback.len() + self.typeahead.len()
    }

    /// Return a key to be read next
    pub fn push_back(&mut self, key: u16) {
        self.pushback.push(key);
    }

    /// Discard buffered input (`*FX 15`, `*FX 21,0`)
    pub fn flush_input(&mut self) {
        self.expansion.clear();
        self.pushback.clear();
        self.typeahead.clear();
        while self.source.read_key(Some(0)).is_some() {}
    }

    /// Next key with function key expansion, or `None` on timeout
    pub fn read_key(&mut self, timeout_cs: Option<u32>) -> Option<u16> {
        if let Some(exec) = self.exec.as_mut() {
            match exec.next() {
                Some(Ok(b'\n')) => return Some(13),
                Some(Ok(b)) => return Some(b as u16),
                _ => self.exec = None,
            }
        }
        if let Some(b) = self.expansion.pop_front() {
            return Some(b as u16);
        }
        let key = match self.pushback.pop().or_else(|| self.typeahead.pop_front()) {
            Some(k) => k,
            None => self.source_key(timeout_cs)?,
        };
        if (KEY_F0..KEY_F0 + FUNCTION_KEYS as u16).contains(&key) {
            let n = (key - KEY_F0) as usize;
            if !self.fkeys[n].is_empty() {
                trace!(key = n, "expanding function key");
                self.expansion.extend(self.fkeys[n].iter().copied());
                return self.expansion.pop_front().map(|b| b as u16);
            }
        }
        Some(key)
    }

    fn source_key(&mut self, timeout_cs: Option<u32>) -> Option<u16> {
        loop {
            let key = self.source.read_key(timeout_cs);
            // With escapes off an interrupt must not end a blocking read
            if key.is_none() && timeout_cs.is_none() && !self.escape_enabled && self.escape.swap(false, Ordering::Relaxed) {
                continue;
            }
            return key;
        }
    }

    /// Key for `GET`/`INKEY`: special keys are folded into a byte and the
    /// escape character raises `Escape`
    pub fn get(&mut self, timeout_cs: Option<u32>) -> Result<Option<u8>> {
        loop {
            let Some(key) = self.read_key(timeout_cs) else {
                self.check_escape()?;
                return Ok(None);
            };
            if key == self.escape_char as u16 && self.escape_enabled {
                self.escape.store(false, Ordering::Relaxed);
                self.discard_on_escape();
                return Err(ErrorKind::Escape.into());
            }
            if key < 0x100 {
                return Ok(Some(key as u8));
            }
            match self.cursor_mode {
                // Cursor keys are used for editing, and otherwise ignored
                0 if (KEY_COPY..=KEY_UP).contains(&key) => continue,
                1 if (KEY_COPY..=KEY_UP).contains(&key) => return Ok(Some((key - KEY_COPY) as u8 + 135)),
                _ => return Ok(Some((key & 0xFF) as u8)),
            }
        }
    }

    /// Whether an internal key number is held down (negative `INKEY`)
    pub fn key_down(&mut self, key: u8) -> bool {
        self.source.key_down(key)
    }

    /// Record a pointer event, dropping the oldest if the queue is full
    pub fn push_mouse(&mut self, event: MouseEvent) {
        if self.mouse.len() == MOUSE_QUEUE {
            self.mouse.pop_front();
        }
        self.mouse_now = event;
        self.mouse.push_back(event);
    }

    /// Next pointer event, or the current pointer state
    pub fn read_mouse(&mut self, now: u64) -> MouseEvent {
        let expire = self.mouse_expire as u64;
        while let Some(event) = self.mouse.pop_front() {
            if expire == 0 || now.saturating_sub(event.time) <= expire {
                return event;
            }
        }
        MouseEvent { time: now, ..self.mouse_now }
    }

    /// Move the pointer (`MOUSE TO`)
    pub fn warp_mouse(&mut self, x: i32, y: i32) {
        self.mouse_now.x = x;
        self.mouse_now.y = y;
    }

    pub fn history(&self) -> impl Iterator<Item = &[u8]> {
        self.history.iter().map(|l| l.as_slice())
    }

    fn remember(&mut self, line: &[u8]) {
        if line.is_empty() || self.history.back().is_some_and(|l| l == line) {
            return;
        }
        self.history.push_back(line.to_vec());
        while self.history.len() > HISTORY_LINES || self.history.iter().map(|l| l.len()).sum::<usize>() > HISTORY_BYTES {
            self.history.pop_front();
        }
    }

    /// Read a line with editing, echoing to the screen. `prefill` is
    /// placed in the buffer first. Returns `None` when input has ended.
    pub fn read_line(&mut self, screen: &mut Screen, prefill: &[u8], max: usize) -> Result<Option<Vec<u8>>> {
        let mut editor = LineEditor::new(prefill, max);
        screen.write(&editor.buffer)?;
        let mut recall = self.history.len();
        loop {
            let Some(key) = self.read_key(None) else {
                self.check_escape()?;
                if editor.buffer.is_empty() {
                    return Ok(None);
                }
                screen.write(b"\r\n")?;
                return Ok(Some(editor.buffer));
            };
            if key == self.escape_char as u16 && self.escape_enabled {
                self.escape.store(false, Ordering::Relaxed);
                self.discard_on_escape();
                screen.write(b"\r\n")?;
                return Err(ErrorKind::Escape.into());
            }
            let edit = match key {
                13 | 10 => {
                    editor.cursor = editor.buffer.len();
                    screen.write(b"\r\n")?;
                    self.remember(&editor.buffer);
                    return Ok(Some(editor.buffer));
                }
                8 => Edit::DeleteLeft,
                127 if self.del_is_bs => Edit::DeleteLeft,
                127 | 4 => Edit::DeleteRight,
                KEY_LEFT | 2 => Edit::Left,
                KEY_RIGHT | 6 => Edit::Right,
                KEY_HOME | 1 => Edit::Home,
                KEY_COPY | 5 => Edit::End,
                11 => Edit::ClearToEnd,
                21 => Edit::Kill,
                KEY_INSERT => {
                    self.insert = !self.insert;
                    screen.write(&[23, 1, if self.insert { 1 } else { 2 }, 0, 0, 0, 0, 0, 0, 0])?;
                    continue;
                }
                KEY_UP | 16 => {
                    if recall == 0 {
                        continue;
                    }
                    recall -= 1;
                    Edit::Replace(self.history[recall].clone())
                }
                KEY_DOWN | 14 => {
                    if recall >= self.history.len() {
                        continue;
                    }
                    recall += 1;
                    Edit::Replace(self.history.get(recall).cloned().unwrap_or_default())
                }
                k if k >= 32 && k < 0x100 => Edit::Char(k as u8, self.insert),
                _ => continue,
            };
            let redraw = editor.apply(edit);
            screen.write(&redraw)?;
        }
    }
}

enum Edit {
    Char(u8, bool),
    DeleteLeft,
    DeleteRight,
    Left,
    Right,
    Home,
    End,
    ClearToEnd,
    Kill,
    Replace(Vec<u8>),
}

/// Buffer and cursor of the line being edited
struct LineEditor {
    buffer: Vec<u8>,
    cursor: usize,
    max: usize,
}

impl LineEditor {
    fn new(prefill: &[u8], max: usize) -> Self {
        let buffer = prefill[..prefill.len().min(max)].to_vec();
        Self { cursor: buffer.len(), buffer, max }
    }

    /// Apply an edit, returning the VDU bytes that bring the screen up
    /// to date
    fn apply(&mut self, edit: Edit) -> Vec<u8> {
        let old = self.buffer.clone();
        let old_cursor = self.cursor;
        match edit {
            Edit::Char(c, insert) => {
                if insert || self.cursor == self.buffer.len() {
                    if self.buffer.len() >= self.max {
                        return vec![7];
                    }
                    self.buffer.insert(self.cursor, c);
                } else {
                    self.buffer[self.cursor] = c;
                }
                self.cursor += 1;
            }
            Edit::DeleteLeft => {
                if self.cursor == 0 {
                    return Vec::new();
                }
                self.cursor -= 1;
                self.buffer.remove(self.cursor);
            }
            Edit::DeleteRight => {
                if self.cursor < self.buffer.len() {
                    self.buffer.remove(self.cursor);
                }
            }
            Edit::Left => self.cursor = self.cursor.saturating_sub(1),
            Edit::Right => self.cursor = (self.cursor + 1).min(self.buffer.len()),
            Edit::Home => self.cursor = 0,
            Edit::End => self.cursor = self.buffer.len(),
            Edit::ClearToEnd => self.buffer.truncate(self.cursor),
            Edit::Kill => {
                self.buffer.clear();
                self.cursor = 0;
            }
            Edit::Replace(line) => {
                self.buffer = line;
                self.buffer.truncate(self.max);
                self.cursor = self.buffer.len();
            }
        }
        let Some(start) = first_difference(&old, &self.buffer) else {
            return cursor_moves(old_cursor, self.cursor);
        };
        // Only the tail from the first changed character is rewritten
        let mut out = cursor_moves(old_cursor, start);
        out.extend_from_slice(&self.buffer[start..]);
        let leftover = old.len().saturating_sub(self.buffer.len());
        out.extend(std::iter::repeat(b' ').take(leftover));
        out.extend(cursor_moves(self.buffer.len() + leftover, self.cursor));
        out
    }
}

/// Index of the first byte that differs, or `None` if the lines match
fn first_difference(old: &[u8], new: &[u8]) -> Option<usize> {
    let common = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    (common < old.len().max(new.len())).then_some(common)
}

/// VDU 8 and VDU 9 to move the text cursor along the line
fn cursor_moves(from: usize, to: usize) -> Vec<u8> {
    if to < from {
        vec![8; from - to]
    } else {
        vec![9; to - from]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::Video;

    fn screen() -> Screen {
        Screen::new(Arc::new(Video::headless(640, 512)), 6).unwrap()
    }

    #[test]
    fn test_function_key_expansion() {
        let mut kb = Keyboard::scripted(&[]);
        kb.set_fkey(1, b"AB".to_vec()).unwrap();
        kb.push_back(KEY_F0 + 1);
        assert_eq!(kb.read_key(None), Some(b'A' as u16));
        assert_eq!(kb.read_key(None), Some(b'B' as u16));
        assert_eq!(kb.read_key(Some(0)), None);
        assert_eq!(kb.set_fkey(16, Vec::new()).unwrap_err().kind, ErrorKind::BadKey);
    }

    #[test]
    fn test_pushback_before_source() {
        let mut kb = Keyboard::scripted(b"X");
        kb.push_back(b'Y' as u16);
        assert_eq!(kb.get(None).unwrap(), Some(b'Y'));
        assert_eq!(kb.get(None).unwrap(), Some(b'X'));
        assert_eq!(kb.get(Some(10)).unwrap(), None);
    }

    #[test]
    fn test_escape_key() {
        let mut kb = Keyboard::scripted(&[27, 27]);
        assert_eq!(kb.get(None).unwrap_err().kind, ErrorKind::Escape);
        kb.escape_enabled = false;
        assert_eq!(kb.get(None).unwrap(), Some(27));
    }

    #[test]
    fn test_escape_flag() {
        let mut kb = Keyboard::scripted(&[]);
        kb.escape_flag().store(true, Ordering::Relaxed);
        assert_eq!(kb.check_escape().unwrap_err().kind, ErrorKind::Escape);
        assert!(kb.check_escape().is_ok());
    }

    #[test]
    fn test_poll_keeps_typeahead() {
        let mut kb = Keyboard::scripted(b"Q");
        kb.poll();
        assert!(!kb.escape_pending());
        assert_eq!(kb.get(None).unwrap(), Some(b'Q'));
        let mut kb = Keyboard::scripted(&[27]);
        kb.poll();
        assert!(kb.escape_pending());
    }

    #[test]
    fn test_read_line_editing() {
        let mut s = screen();
        let mut kb = Keyboard::scripted(b"HELXLO");
        kb.push_back(13);
        // Pushed keys come first, so script the whole line instead
        let mut kb2 = Keyboard::scripted(&[b'A', b'C', 0x8C, b'B', 13]);
        kb2.set_source(Box::new({
            let mut keys = ScriptedKeys::new(b"AC");
            keys.push(KEY_LEFT);
            keys.push(b'B' as u16);
            keys.push(13);
            keys
        }));
        assert_eq!(kb2.read_line(&mut s, b"", 255).unwrap(), Some(b"ABC".to_vec()));
        assert_eq!(kb.read_key(None), Some(13));
    }

    #[test]
    fn test_read_line_delete_and_prefill() {
        let mut s = screen();
        let mut keys = ScriptedKeys::new(b"XY");
        keys.push(127);
        keys.push(13);
        let mut kb = Keyboard::new(Box::new(keys), Arc::new(AtomicBool::new(false)));
        assert_eq!(kb.read_line(&mut s, b"10 ", 255).unwrap(), Some(b"10 X".to_vec()));
        assert_eq!(s.char_at(0, 0), b'1');
        assert_eq!(s.char_at(3, 0), b'X');
        assert_eq!(s.char_at(4, 0), b' ');
    }

    #[test]
    fn test_history_recall() {
        let mut s = screen();
        let mut keys = ScriptedKeys::new(b"PRINT 1\r");
        keys.push(KEY_UP);
        keys.push(13);
        let mut kb = Keyboard::new(Box::new(keys), Arc::new(AtomicBool::new(false)));
        assert_eq!(kb.read_line(&mut s, b"", 255).unwrap(), Some(b"PRINT 1".to_vec()));
        assert_eq!(kb.read_line(&mut s, b"", 255).unwrap(), Some(b"PRINT 1".to_vec()));
        assert_eq!(kb.history().count(), 1);
        assert_eq!(kb.read_line(&mut s, b"", 255).unwrap(), None);
    }

    #[test]
    fn test_editor_echo_rewrites_only_the_tail() {
        let mut e = LineEditor::new(b"AB", 255);
        assert_eq!(e.apply(Edit::Char(b'C', true)), b"C");
        assert_eq!(e.apply(Edit::Left), vec![8]);
        assert_eq!(e.apply(Edit::Char(b'X', true)), b"XC\x08");
        assert_eq!(e.apply(Edit::DeleteLeft), b"\x08C \x08\x08");
        assert_eq!(e.apply(Edit::End), vec![9]);
        assert_eq!(e.apply(Edit::DeleteLeft), b"\x08 \x08");
        assert_eq!(e.buffer, b"AB");
    }

    #[test]
    fn test_read_line_echo_at_end_of_line() {
        let mut s = screen();
        s.set_capture(true);
        let mut kb = Keyboard::scripted(b"3,hi\r");
        assert_eq!(kb.read_line(&mut s, b"", 255).unwrap(), Some(b"3,hi".to_vec()));
        assert_eq!(s.take_output(), b"3,hi\r\n");
    }

    #[test]
    fn test_line_length_limit() {
        let mut s = screen();
        let mut kb = Keyboard::scripted(b"ABCD\r");
        assert_eq!(kb.read_line(&mut s, b"", 2).unwrap(), Some(b"AB".to_vec()));
    }

    #[test]
    fn test_mouse_queue_and_expiry() {
        let mut kb = Keyboard::scripted(&[]);
        for i in 0..10 {
            kb.push_mouse(MouseEvent { x: i, y: 0, buttons: 0, time: i as u64 });
        }
        assert_eq!(kb.read_mouse(10).x, 3);
        kb.mouse_expire = 2;
        assert_eq!(kb.read_mouse(10).x, 8);
        kb.warp_mouse(100, 200);
        let now = kb.read_mouse(50);
        assert_eq!((now.x, now.y), (100, 200));
    }

    #[test]
    fn test_cursor_key_codes() {
        let mut keys = ScriptedKeys::new(&[]);
        keys.push(KEY_LEFT);
        keys.push(b'A' as u16);
        let mut kb = Keyboard::new(Box::new(keys), Arc::new(AtomicBool::new(false)));
        assert_eq!(kb.get(None).unwrap(), Some(b'A'));
        let mut keys = ScriptedKeys::new(&[]);
        keys.push(KEY_LEFT);
        let mut kb = Keyboard::new(Box::new(keys), Arc::new(AtomicBool::new(false)));
        kb.cursor_mode = 1;
        assert_eq!(kb.get(None).unwrap(), Some(136));
    }
}
