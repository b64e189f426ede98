//! Program storage and management for BBC BASIC
//!
//! Program lines live in the workspace between `PAGE` and `TOP` in
//! tokenised form:
//!
//! ```text
//! <offset to next line: 2 bytes LE> <line number: 2 bytes LE> <payload> 0x0D
//! ```
//!
//! terminated by an end marker whose offset is zero. Lines are kept sorted
//! by line number. Line number references inside the payload are resolved
//! through an index keyed by line number that is rebuilt after every edit,
//! so no address inside the text ever goes stale.

use crate::error::{BasicError, ErrorKind, Result};
use crate::memory::Workspace;
use crate::tokenizer::{
    self, remap_line_numbers, TokenizeOptions, LINE_END, MAX_LINENO, TOKEN_DEF, TOKEN_FN,
    TOKEN_PROC,
};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Size of the line header
pub const LINE_HEADER: usize = 4;
/// Largest tokenised line payload
pub const MAX_LINE_PAYLOAD: usize = 0xFFFF - LINE_HEADER - 1;

/// A line found while walking program text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRef {
    /// Offset of the line header
    pub offset: usize,
    pub number: u16,
    /// Total length including header and terminator
    pub length: usize,
}

impl LineRef {
    /// Offset of the first payload byte
    pub fn payload(&self) -> usize {
        self.offset + LINE_HEADER
    }

    /// Offset of the line terminator
    pub fn end(&self) -> usize {
        self.offset + self.length - 1
    }
}

/// Build the bytes of one tokenised line
pub fn encode_line(number: u16, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_LINE_PAYLOAD {
        return Err(ErrorKind::StateLen.into());
    }
    let length = payload.len() + LINE_HEADER + 1;
    let mut bytes = Vec::with_capacity(length);
    bytes.extend_from_slice(&(length as u16).to_le_bytes());
    bytes.extend_from_slice(&number.to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes.push(LINE_END);
    Ok(bytes)
}

/// Walk the lines held in `bytes`, starting at `start`.
/// Fails with `BadProg` if the text is not well formed.
pub fn walk_lines(bytes: &[u8], start: usize) -> Result<Vec<LineRef>> {
    let mut lines = Vec::new();
    let mut offset = start;
    loop {
        if offset + LINE_HEADER > bytes.len() {
            return Err(BasicError::new(ErrorKind::BadProg).with_str("end marker missing"));
        }
        let length = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as usize;
        if length == 0 {
            return Ok(lines);
        }
        let number = u16::from_le_bytes([bytes[offset + 2], bytes[offset + 3]]);
        if length <= LINE_HEADER || offset + length > bytes.len() {
            return Err(BasicError::new(ErrorKind::BadProg).with_str("bad line length"));
        }
        if bytes[offset + length - 1] != LINE_END {
            return Err(BasicError::new(ErrorKind::BadProg).with_str("line terminator missing"));
        }
        if let Some(prev) = lines.last() {
            let prev: &LineRef = prev;
            if prev.number >= number {
                return Err(BasicError::new(ErrorKind::BadProg).with_str("lines out of order"));
            }
        }
        lines.push(LineRef { offset, number, length });
        offset += length;
    }
}

/// Find the `DEF PROC` and `DEF FN` entries in a block of lines. Keys are
/// `PROCname` or `FNname`; values are the offset just past the name.
pub fn scan_definitions(bytes: &[u8], lines: &[LineRef]) -> HashMap<String, usize> {
    let mut defs = HashMap::new();
    for line in lines {
        let mut pos = line.payload();
        while pos < line.end() && bytes[pos] == b' ' {
            pos += 1;
        }
        if bytes[pos] != TOKEN_DEF {
            continue;
        }
        pos += 1;
        while pos < line.end() && bytes[pos] == b' ' {
            pos += 1;
        }
        let prefix = match bytes[pos] {
            TOKEN_PROC => "PROC",
            TOKEN_FN => "FN",
            _ => continue,
        };
        pos += 1;
        let start = pos;
        while pos < line.end()
            && (bytes[pos].is_ascii_alphanumeric() || matches!(bytes[pos], b'_' | b'`'))
        {
            pos += 1;
        }
        if pos < line.end() && bytes[pos] == b'%' && bytes[pos + 1] == b'%' {
            pos += 2;
        } else if pos < line.end() && matches!(bytes[pos], b'%' | b'$' | b'&') {
            pos += 1;
        }
        let name = String::from_utf8_lossy(&bytes[start..pos]);
        defs.entry(format!("{}{}", prefix, name)).or_insert(pos);
    }
    defs
}

/// The program held in the workspace
#[derive(Debug, Clone, Default)]
pub struct ProgramStore {
    /// Line number to header address
    index: BTreeMap<u16, usize>,
    /// Cached procedure and function definitions
    definitions: Option<HashMap<String, usize>>,
    /// Bumped on every edit so the executor can drop derived caches
    generation: u64,
}

impl ProgramStore {
    /// Create a new program store
    pub fn new() -> Self {
        Self::default()
    }

    /// Edit counter; changes whenever the program text changes
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of lines in the program
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Rebuild the line index by walking the text
    pub fn rebuild(&mut self, mem: &Workspace) -> Result<()> {
        let text = mem.slice(0, mem.top() + LINE_HEADER)?;
        let lines = walk_lines(text, mem.page())?;
        self.index = lines.iter().map(|l| (l.number, l.offset)).collect();
        self.definitions = None;
        self.generation += 1;
        Ok(())
    }

    /// Store a program line, replacing any line with the same number.
    /// A payload with nothing but spaces deletes the line.
    pub fn insert_line(&mut self, mem: &mut Workspace, number: u16, payload: &[u8]) -> Result<()> {
        if payload.iter().all(|&b| b == b' ') {
            self.delete_line(mem, number)?;
            return Ok(());
        }
        self.delete_line(mem, number)?;
        let line = encode_line(number, payload)?;
        let at = self
            .index
            .range(number..)
            .next()
            .map(|(_, &offset)| offset)
            .unwrap_or(mem.top());
        let top = mem.top();
        if top + line.len() + LINE_HEADER > mem.stacktop() {
            return Err(ErrorKind::NoRoom.into());
        }
        mem.copy_within(at, top - at, at + line.len())?;
        mem.write_bytes(at, &line)?;
        mem.set_top(top + line.len())?;
        debug!(line = number, bytes = line.len(), "program line stored");
        self.rebuild(mem)
    }

    /// Delete a program line. Returns false if there was no such line.
    pub fn delete_line(&mut self, mem: &mut Workspace, number: u16) -> Result<bool> {
        let offset = match self.index.get(&number) {
            Some(&offset) => offset,
            None => return Ok(false),
        };
        let length = mem.peek_word(offset)? as usize;
        let top = mem.top();
        mem.copy_within(offset + length, top - offset - length, offset)?;
        mem.set_top(top - length)?;
        self.rebuild(mem)?;
        Ok(true)
    }

    /// Delete every line in `first..=last`
    pub fn delete_range(&mut self, mem: &mut Workspace, first: u16, last: u16) -> Result<()> {
        let doomed: Vec<u16> = self.index.range(first..=last).map(|(&n, _)| n).collect();
        for number in doomed {
            self.delete_line(mem, number)?;
        }
        Ok(())
    }

    /// Discard the whole program
    pub fn clear_program(&mut self, mem: &mut Workspace) -> Result<()> {
        let page = mem.page();
        mem.set_top(page)?;
        self.rebuild(mem)
    }

    /// Renumber the program. Every line number reference is rewritten;
    /// references to missing lines are left alone and reported as warnings.
    pub fn renumber(&mut self, mem: &mut Workspace, start: u16, step: u16) -> Result<Vec<BasicError>> {
        if step == 0 {
            return Err(ErrorKind::Silly.into());
        }
        let count = self.index.len() as u64;
        if count > 0 && start as u64 + (count - 1) * step as u64 > MAX_LINENO as u64 {
            return Err(ErrorKind::Renumber.into());
        }
        let mapping: HashMap<u16, u16> = self
            .index
            .keys()
            .enumerate()
            .map(|(i, &old)| (old, start + i as u16 * step))
            .collect();
        let mut warnings = Vec::new();
        let lines: Vec<(u16, usize)> = self.index.iter().map(|(&n, &o)| (n, o)).collect();
        for (old, offset) in lines {
            let length = mem.peek_word(offset)? as usize;
            if let Some(&new) = mapping.get(&old) {
                mem.poke_word(offset + 2, new)?;
            }
            let payload = mem.slice_mut(offset + LINE_HEADER, length - LINE_HEADER - 1)?;
            let missing = remap_line_numbers(payload, &|n| mapping.get(&n).copied());
            for target in missing {
                warnings.push(
                    BasicError::new(ErrorKind::WarnRenumber)
                        .with_int(target as i64)
                        .at_line(old),
                );
            }
        }
        debug!(start, step, lines = count, "program renumbered");
        self.rebuild(mem)?;
        Ok(warnings)
    }

    /// Header address of line `number`
    pub fn find_line(&self, number: u16) -> Option<usize> {
        self.index.get(&number).copied()
    }

    /// Header address of the first line numbered `number` or more
    pub fn find_line_from(&self, number: u16) -> Option<(u16, usize)> {
        self.index.range(number..).next().map(|(&n, &o)| (n, o))
    }

    /// Line numbers and addresses in `first..=last`
    pub fn lines_in(&self, first: u16, last: u16) -> Vec<(u16, usize)> {
        self.index.range(first..=last).map(|(&n, &o)| (n, o)).collect()
    }

    /// First and last line numbers
    pub fn bounds(&self) -> Option<(u16, u16)> {
        let first = *self.index.keys().next()?;
        let last = *self.index.keys().next_back()?;
        Some((first, last))
    }

    /// Line number of the line whose text contains `address`
    pub fn line_at(&self, mem: &Workspace, address: usize) -> Option<u16> {
        if address < mem.page() || address >= mem.top() {
            return None;
        }
        self.index
            .iter()
            .rev()
            .find(|(_, &offset)| offset <= address)
            .map(|(&n, _)| n)
    }

    /// Address of the payload following a `DEF PROCname`/`DEF FNname`
    pub fn find_definition(&mut self, mem: &Workspace, name: &str) -> Result<Option<usize>> {
        if self.definitions.is_none() {
            let text = mem.slice(0, mem.top() + LINE_HEADER)?;
            let lines = walk_lines(text, mem.page())?;
            self.definitions = Some(scan_definitions(text, &lines));
        }
        Ok(self.definitions.as_ref().and_then(|defs| defs.get(name).copied()))
    }

    /// Payload bytes of every line, for SAVE and LIST
    pub fn listing(&self, mem: &Workspace) -> Result<Vec<(u16, Vec<u8>)>> {
        let mut out = Vec::with_capacity(self.index.len());
        for (&number, &offset) in &self.index {
            let length = mem.peek_word(offset)? as usize;
            out.push((number, mem.slice(offset + LINE_HEADER, length - LINE_HEADER - 1)?.to_vec()));
        }
        Ok(out)
    }

    /// Replace the program with `source`, which is either plain text or a
    /// tokenised image. Returns tokenizer warnings.
    pub fn load(&mut self, mem: &mut Workspace, source: &[u8], hex64: bool) -> Result<Vec<BasicError>> {
        self.clear_program(mem)?;
        let lines = match parse_tokenised(source) {
            Some(lines) => {
                debug!(lines = lines.len(), "loading tokenised program");
                for (number, payload) in &lines {
                    self.append_unchecked(mem, *number, payload)?;
                }
                self.rebuild(mem)?;
                return Ok(Vec::new());
            }
            None => parse_text(source, hex64)?,
        };
        let mut warnings = Vec::new();
        for (number, payload, mut line_warnings) in lines {
            warnings.append(&mut line_warnings);
            self.insert_line(mem, number, &payload)?;
        }
        debug!(lines = self.index.len(), "loaded text program");
        Ok(warnings)
    }

    /// Append a line at TOP without sorting (used for tokenised images)
    fn append_unchecked(&mut self, mem: &mut Workspace, number: u16, payload: &[u8]) -> Result<()> {
        let line = encode_line(number, payload)?;
        let top = mem.top();
        if top + line.len() + LINE_HEADER > mem.stacktop() {
            return Err(ErrorKind::NoRoom.into());
        }
        mem.write_bytes(top, &line)?;
        mem.set_top(top + line.len())
    }

    /// Plain text form of the program, one line per source line
    pub fn save_text(&self, mem: &Workspace) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for (number, payload) in self.listing(mem)? {
            out.extend_from_slice(number.to_string().as_bytes());
            out.extend_from_slice(tokenizer::expand(&payload, false).as_bytes());
            out.push(b'\n');
        }
        Ok(out)
    }

    /// Tokenised image of the program, including the end marker
    pub fn save_tokenised(&self, mem: &Workspace) -> Result<Vec<u8>> {
        Ok(mem.slice(mem.page(), mem.top() - mem.page() + LINE_HEADER)?.to_vec())
    }
}

type ParsedLine = (u16, Vec<u8>, Vec<BasicError>);

/// Tokenise a text program. Lines without a number are numbered one more
/// than the line before.
fn parse_text(source: &[u8], hex64: bool) -> Result<Vec<ParsedLine>> {
    let mut out = Vec::new();
    let mut last: Option<u16> = None;
    let options = TokenizeOptions { require_line_number: false, hex64 };
    for (index, raw) in source.split(|&b| b == b'\n').enumerate() {
        let raw = match raw.last() {
            Some(b'\r') => &raw[..raw.len() - 1],
            _ => raw,
        };
        if index == 0 && raw.starts_with(b"#!") {
            continue;
        }
        if raw.iter().all(|&b| b == b' ' || b == b'\t') {
            continue;
        }
        let line = tokenizer::tokenize_with(raw, options)?;
        let number = match line.line_number {
            Some(n) => n,
            None => {
                let next = last.map_or(1, |n| n as u32 + 1);
                if next > MAX_LINENO {
                    return Err(ErrorKind::LineNo.into());
                }
                next as u16
            }
        };
        last = Some(number);
        out.push((number, line.tokens, line.warnings));
    }
    Ok(out)
}

/// Recognise a tokenised image: either this interpreter's own layout or the
/// Acorn `0x0D hi lo len` layout.
fn parse_tokenised(source: &[u8]) -> Option<Vec<(u16, Vec<u8>)>> {
    if source.first() == Some(&LINE_END) {
        return parse_acorn(source);
    }
    let lines = walk_lines(source, 0).ok()?;
    if lines.is_empty() {
        return None;
    }
    let end = lines.last().map(|l| l.offset + l.length)?;
    if source.len() < end + LINE_HEADER || source[end + 2..end + 4] != [0xFF, 0xFF] {
        return None;
    }
    Some(
        lines
            .iter()
            .map(|l| (l.number, source[l.payload()..l.end()].to_vec()))
            .collect(),
    )
}

fn parse_acorn(source: &[u8]) -> Option<Vec<(u16, Vec<u8>)>> {
    let mut lines = Vec::new();
    let mut pos = 0;
    loop {
        if source.get(pos) != Some(&LINE_END) {
            return None;
        }
        let hi = *source.get(pos + 1)?;
        if hi == 0xFF {
            return Some(lines);
        }
        let lo = *source.get(pos + 2)?;
        let len = *source.get(pos + 3)? as usize;
        if len < 4 || pos + len > source.len() {
            return None;
        }
        lines.push(((hi as u16) << 8 | lo as u16, source[pos + 4..pos + len].to_vec()));
        pos += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tokenize;

    fn setup() -> (Workspace, ProgramStore) {
        (Workspace::new(64 * 1024).unwrap(), ProgramStore::new())
    }

    fn store(mem: &mut Workspace, prog: &mut ProgramStore, src: &str) {
        let line = tokenize(src).unwrap();
        prog.insert_line(mem, line.line_number.unwrap(), &line.tokens).unwrap();
    }

    fn text(mem: &Workspace, prog: &ProgramStore) -> String {
        String::from_utf8(prog.save_text(mem).unwrap()).unwrap()
    }

    #[test]
    fn test_insert_keeps_order() {
        let (mut mem, mut prog) = setup();
        store(&mut mem, &mut prog, "20 PRINT 2");
        store(&mut mem, &mut prog, "10 PRINT 1");
        store(&mut mem, &mut prog, "30 PRINT 3");
        assert_eq!(text(&mem, &prog), "10 PRINT 1\n20 PRINT 2\n30 PRINT 3\n");
        let text_bytes = mem.slice(0, mem.top() + LINE_HEADER).unwrap();
        assert_eq!(walk_lines(text_bytes, mem.page()).unwrap().len(), 3);
    }

    #[test]
    fn test_replace_and_delete() {
        let (mut mem, mut prog) = setup();
        store(&mut mem, &mut prog, "10 PRINT 1");
        store(&mut mem, &mut prog, "20 PRINT 2");
        store(&mut mem, &mut prog, "10 PRINT \"ONE\"");
        assert_eq!(text(&mem, &prog), "10 PRINT \"ONE\"\n20 PRINT 2\n");
        store(&mut mem, &mut prog, "10");
        assert_eq!(text(&mem, &prog), "20 PRINT 2\n");
        assert!(!prog.delete_line(&mut mem, 99).unwrap());
    }

    #[test]
    fn test_top_moves_with_program() {
        let (mut mem, mut prog) = setup();
        let page = mem.page();
        store(&mut mem, &mut prog, "10 PRINT");
        assert_eq!(mem.top(), page + LINE_HEADER + 2 + 1);
        prog.clear_program(&mut mem).unwrap();
        assert_eq!(mem.top(), page);
        assert!(prog.is_empty());
    }

    #[test]
    fn test_renumber_rewrites_references() {
        let (mut mem, mut prog) = setup();
        store(&mut mem, &mut prog, "5 GOTO 7");
        store(&mut mem, &mut prog, "7 GOSUB 5:GOTO 99");
        let warnings = prog.renumber(&mut mem, 100, 10).unwrap();
        assert_eq!(text(&mem, &prog), "100 GOTO 110\n110 GOSUB 100:GOTO 99\n");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, ErrorKind::WarnRenumber);
    }

    #[test]
    fn test_renumber_is_idempotent() {
        let (mut mem, mut prog) = setup();
        store(&mut mem, &mut prog, "1 GOTO 3");
        store(&mut mem, &mut prog, "3 GOTO 1");
        prog.renumber(&mut mem, 10, 10).unwrap();
        let once = text(&mem, &prog);
        prog.renumber(&mut mem, 10, 10).unwrap();
        assert_eq!(text(&mem, &prog), once);
    }

    #[test]
    fn test_renumber_overflow() {
        let (mut mem, mut prog) = setup();
        store(&mut mem, &mut prog, "1 PRINT");
        store(&mut mem, &mut prog, "2 PRINT");
        assert_eq!(prog.renumber(&mut mem, 65279, 10).unwrap_err().kind, ErrorKind::Renumber);
    }

    #[test]
    fn test_definitions_cache_refreshes() {
        let (mut mem, mut prog) = setup();
        store(&mut mem, &mut prog, "10 DEF PROCa");
        assert!(prog.find_definition(&mem, "PROCa").unwrap().is_some());
        assert!(prog.find_definition(&mem, "FNb").unwrap().is_none());
        store(&mut mem, &mut prog, "5 DEF FNb=1");
        let at = prog.find_definition(&mem, "FNb").unwrap().unwrap();
        assert_eq!(mem.peek(at).unwrap(), b'=');
    }

    #[test]
    fn test_load_text_and_tokenised() {
        let (mut mem, mut prog) = setup();
        prog.load(&mut mem, b"PRINT 1\r\nPRINT 2\n\n100 END\n", false).unwrap();
        assert_eq!(prog.bounds(), Some((1, 100)));
        let image = prog.save_tokenised(&mem).unwrap();
        let (mut mem2, mut prog2) = setup();
        prog2.load(&mut mem2, &image, false).unwrap();
        assert_eq!(text(&mem2, &prog2), text(&mem, &prog));
    }

    #[test]
    fn test_line_at_address() {
        let (mut mem, mut prog) = setup();
        store(&mut mem, &mut prog, "10 PRINT");
        store(&mut mem, &mut prog, "20 PRINT");
        let second = prog.find_line(20).unwrap();
        assert_eq!(prog.line_at(&mem, second + 5), Some(20));
        assert_eq!(prog.line_at(&mem, second - 1), Some(10));
    }

    #[quickcheck_macros::quickcheck]
    fn prop_store_walks_cleanly(numbers: Vec<u16>) -> bool {
        let (mut mem, mut prog) = setup();
        for n in numbers.iter().take(40) {
            let n = n % 1000;
            let line = tokenize(&format!("{} PRINT {}", n, n)).unwrap();
            if prog.insert_line(&mut mem, n, &line.tokens).is_err() {
                return false;
            }
        }
        let bytes = mem.slice(0, mem.top() + LINE_HEADER).unwrap();
        match walk_lines(bytes, mem.page()) {
            Ok(lines) => lines.len() == prog.len(),
            Err(_) => false,
        }
    }
}
