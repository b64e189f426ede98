//! Statement executor
//!
//! Statements run straight from tokenised text. `pc` is a code address:
//! below [`SCRATCH_BASE`] it points into the workspace, where the program
//! lives; from [`SCRATCH_BASE`] it selects a scratch buffer (the immediate
//! line, `EVAL` text), and from [`LIBRARY_BASE`] a loaded library image.
//! Reading past the end of any of these yields a line end.
//!
//! Control structures keep their state on the Basic stack. PROC calls are
//! flat: the call frame records where to come back to and execution simply
//! continues at the definition. FN calls run a nested loop that ends when
//! the function's `=` statement is reached.

mod commands;
mod control;
mod graphics;
mod io;
mod statements;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{BasicError, ErrorKind, Result, Severity};
use crate::filesystem::FileSystem;
use crate::keyboard::{Keyboard, ScriptedKeys};
use crate::memory::Workspace;
use crate::program::{scan_definitions, walk_lines, ProgramStore, LINE_HEADER};
use crate::sound::Sound;
use crate::stack::{BasicStack, DataPointer, ErrorHandler, Frame};
use crate::tokenizer::*;
use crate::variables::{static_index, Value, Variable, VariableStore};
use crate::vdu::{mode_info, Screen};
use crate::video::Video;

/// First code address of the scratch buffers
pub const SCRATCH_BASE: usize = 0x8000_0000;
/// Address space given to each scratch buffer
pub const SCRATCH_SLOT: usize = 0x10_0000;
/// First code address of the library images
pub const LIBRARY_BASE: usize = 0x9000_0000;
/// Address space given to each library
pub const LIBRARY_SPAN: usize = 0x0100_0000;

/// Statements between checks of the clock for a keyboard and screen poll
const POLL_INTERVAL: u64 = 64;
/// Longest line accepted by the REPL
const MAX_INPUT_LINE: usize = 1024;
/// Calls listed by `TRACE BACK`
const TRACEBACK_LIMIT: usize = 10;

/// A program loaded with `INSTALL` or `LIBRARY`
#[derive(Debug, Clone)]
pub(crate) struct Library {
    pub name: String,
    /// Tokenised lines, with the end marker
    pub image: Vec<u8>,
    /// Line number to header offset
    pub lines: BTreeMap<u16, usize>,
    /// `PROCname`/`FNname` to the offset after the name
    pub defs: HashMap<String, usize>,
    /// `INSTALL`ed libraries survive `CLEAR`
    pub installed: bool,
}

/// `TRACE` settings
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Trace {
    pub lines: bool,
    /// Highest line number traced
    pub limit: u16,
    pub procs: bool,
    pub back: bool,
    pub step: bool,
}

/// The interpreter: workspace, program, variables and the devices a
/// program talks to
pub struct Interpreter {
    pub config: Config,
    pub screen: Screen,
    pub keyboard: Keyboard,
    pub(crate) video: Arc<Video>,
    pub(crate) mem: Workspace,
    pub(crate) program: ProgramStore,
    pub(crate) vars: VariableStore,
    pub(crate) stack: BasicStack,
    pub(crate) files: FileSystem,
    pub(crate) sound: Sound,
    pub(crate) scratch: Vec<Vec<u8>>,
    pub(crate) libraries: Vec<Library>,
    pub(crate) pc: usize,
    /// Line being executed, `None` in immediate mode
    pub(crate) line: Option<u16>,
    /// Nesting of FN calls; each has its own run loop
    pub(crate) fn_level: usize,
    /// Stack depth when the innermost FN was entered
    pub(crate) fn_base: usize,
    pub(crate) handler: Option<ErrorHandler>,
    pub(crate) data: DataPointer,
    pub(crate) last_error: Option<BasicError>,
    pub(crate) trace: Trace,
    pub(crate) rng: StdRng,
    pub(crate) last_rnd: f64,
    /// `LISTO` option bits
    pub(crate) listo: u8,
    /// `WIDTH`, 0 for unlimited
    pub(crate) width: usize,
    /// Tokenised image kept by `NEW` for `OLD`
    pub(crate) old_program: Option<Vec<u8>>,
    pub(crate) program_name: Option<String>,
    /// Arguments after `--`, for `OS_GetEnv`
    pub(crate) args: Vec<String>,
    pub(crate) quit: Option<i32>,
    /// `AUTO` next line number and step
    pub(crate) auto: Option<(u32, u32)>,
    /// Values of `PRIVATE` variables between calls, by owner
    pub(crate) privates: HashMap<String, HashMap<String, Variable>>,
    /// `OSBYTE` 166-255 system variables
    pub(crate) osbyte_vars: [u8; 256],
    pub(crate) statements: u64,
    /// Centisecond clock at the last keyboard poll
    last_poll: u64,
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("pc", &format_args!("{:#x}", self.pc))
            .field("line", &self.line)
            .field("stack", &self.stack.len())
            .field("fn_level", &self.fn_level)
            .finish()
    }
}

impl Interpreter {
    pub fn new(config: Config, video: Arc<Video>, mut keyboard: Keyboard) -> Result<Self> {
        let mem = Workspace::new(config.size)?;
        let screen = match Screen::new(Arc::clone(&video), config.startup_mode) {
            Ok(screen) => screen,
            Err(e) if config.failover_mode >= 0 => {
                debug!(mode = config.startup_mode, failover = config.failover_mode, "startup mode unavailable");
                Screen::new(Arc::clone(&video), config.failover_mode as u32).map_err(|_| e)?
            }
            Err(e) => return Err(e),
        };
        keyboard.del_is_bs = config.del_is_bs;
        keyboard.mouse_expire = config.mouse_event_expire;
        let files = FileSystem::new(config.path.clone());
        let mut osbyte_vars = [0u8; 256];
        // Escape character and the version byte read by OSBYTE 0
        osbyte_vars[220] = 27;
        osbyte_vars[0] = 6;
        info!(size = config.size, mode = config.startup_mode, "interpreter started");
        Ok(Self {
            config,
            screen,
            keyboard,
            video,
            mem,
            program: ProgramStore::new(),
            vars: VariableStore::new(),
            stack: BasicStack::new(),
            files,
            sound: Sound::new(),
            scratch: Vec::new(),
            libraries: Vec::new(),
            pc: SCRATCH_BASE,
            line: None,
            fn_level: 0,
            fn_base: 0,
            handler: None,
            data: DataPointer::default(),
            last_error: None,
            trace: Trace::default(),
            rng: StdRng::from_entropy(),
            last_rnd: 0.0,
            listo: 0,
            width: 0,
            old_program: None,
            program_name: None,
            args: Vec::new(),
            quit: None,
            auto: None,
            privates: HashMap::new(),
            osbyte_vars,
            statements: 0,
            last_poll: 0,
        })
    }

    /// An interpreter with no window and no keyboard, whose VDU output is
    /// captured for [`Interpreter::output`]
    pub fn headless(config: Config) -> Result<Self> {
        let (width, height) = mode_info(config.startup_mode).map_or((640, 512), |m| m.display_size());
        let video = Arc::new(Video::headless(width, height));
        let mut interp = Self::new(config, video, Keyboard::scripted(b""))?;
        interp.screen.set_capture(true);
        Ok(interp)
    }

    /// Replace the keyboard input with `keys`
    pub fn set_keys(&mut self, keys: &[u8]) {
        self.keyboard.set_source(Box::new(ScriptedKeys::new(keys)));
    }

    /// Captured VDU output since the last call
    pub fn output(&mut self) -> String {
        String::from_utf8_lossy(&self.screen.take_output()).into_owned()
    }

    pub fn set_args(&mut self, args: Vec<String>) {
        self.args = args;
    }

    /// Exit status requested by `QUIT` or the end of input
    pub fn quit_code(&self) -> Option<i32> {
        self.quit
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn last_error(&self) -> Option<&BasicError> {
        self.last_error.as_ref()
    }

    // Code access

    /// Byte at a code address
    pub(crate) fn byte_at(&self, addr: usize) -> u8 {
        if addr >= LIBRARY_BASE {
            let (index, offset) = ((addr - LIBRARY_BASE) / LIBRARY_SPAN, (addr - LIBRARY_BASE) % LIBRARY_SPAN);
            self.libraries.get(index).and_then(|l| l.image.get(offset)).copied().unwrap_or(LINE_END)
        } else if addr >= SCRATCH_BASE {
            let (slot, offset) = ((addr - SCRATCH_BASE) / SCRATCH_SLOT, (addr - SCRATCH_BASE) % SCRATCH_SLOT);
            self.scratch.get(slot).and_then(|s| s.get(offset)).copied().unwrap_or(LINE_END)
        } else {
            self.mem.peek(addr).unwrap_or(LINE_END)
        }
    }

    fn code_word(&self, addr: usize) -> u16 {
        u16::from_le_bytes([self.byte_at(addr), self.byte_at(addr + 1)])
    }

    pub(crate) fn current(&self) -> u8 {
        self.byte_at(self.pc)
    }

    pub(crate) fn skip_spaces(&mut self) -> u8 {
        while self.current() == b' ' {
            self.pc += 1;
        }
        self.current()
    }

    /// Step over `b` if it is next
    pub(crate) fn accept(&mut self, b: u8) -> bool {
        if self.skip_spaces() == b {
            self.pc += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn expect(&mut self, b: u8, missing: ErrorKind) -> Result<()> {
        if self.accept(b) {
            Ok(())
        } else {
            Err(missing.into())
        }
    }

    /// Accept a two byte extended token
    pub(crate) fn accept_extended(&mut self, prefix: u8, token: u8) -> bool {
        if self.skip_spaces() == prefix && self.byte_at(self.pc + 1) == token {
            self.pc += 2;
            true
        } else {
            false
        }
    }

    /// Accept a word that is not a keyword, such as `BY` or `BACK`
    pub(crate) fn accept_word(&mut self, word: &[u8]) -> bool {
        self.skip_spaces();
        let matches = word.iter().enumerate().all(|(i, &c)| self.byte_at(self.pc + i) == c);
        let next = self.byte_at(self.pc + word.len());
        if matches && !(next.is_ascii_alphanumeric() || next == b'_') {
            self.pc += word.len();
            true
        } else {
            false
        }
    }

    pub(crate) fn at_statement_end(&mut self) -> bool {
        matches!(self.skip_spaces(), b':' | LINE_END | TOKEN_ELSE)
    }

    pub(crate) fn check_end(&mut self) -> Result<()> {
        if self.at_statement_end() {
            Ok(())
        } else {
            Err(ErrorKind::Syntax.into())
        }
    }

    /// Code address of the token after the one at `pos`, not leaving the line
    pub(crate) fn token_after(&self, pos: usize) -> usize {
        match self.byte_at(pos) {
            LINE_END => pos,
            b'"' => {
                let mut p = pos + 1;
                while !matches!(self.byte_at(p), b'"' | LINE_END) {
                    p += 1;
                }
                if self.byte_at(p) == b'"' {
                    p + 1
                } else {
                    p
                }
            }
            TOKEN_LINENUM => pos + 4,
            TOKEN_XFUNCTION | TOKEN_XCOMMAND | TOKEN_XSTATEMENT => pos + 2,
            TOKEN_REM | TOKEN_DATA => self.line_end(pos),
            _ => pos + 1,
        }
    }

    /// Address of the line end at or after `pos`
    pub(crate) fn line_end(&self, mut pos: usize) -> usize {
        while self.byte_at(pos) != LINE_END {
            pos += 1;
        }
        pos
    }

    /// Address of the `:`, `ELSE` or line end that ends the statement at `pos`
    pub(crate) fn statement_end(&self, mut pos: usize) -> usize {
        while !matches!(self.byte_at(pos), b':' | LINE_END | TOKEN_ELSE) {
            pos = self.token_after(pos);
        }
        pos
    }

    pub(crate) fn skip_statement(&mut self) {
        self.pc = self.statement_end(self.pc);
    }

    /// Put `code` in a new scratch buffer, returning its code address
    pub(crate) fn push_scratch(&mut self, code: Vec<u8>) -> usize {
        self.scratch.push(code);
        SCRATCH_BASE + (self.scratch.len() - 1) * SCRATCH_SLOT
    }

    pub(crate) fn pop_scratch(&mut self) {
        self.scratch.pop();
    }

    /// The error raised when the keyboard has no more input
    pub(crate) fn input_exhausted(&mut self) -> BasicError {
        if self.quit.is_none() {
            self.quit = Some(0);
        }
        ErrorKind::Exit.into()
    }

    pub(crate) fn library_index(&self, pc: usize) -> Option<usize> {
        if pc >= LIBRARY_BASE {
            Some((pc - LIBRARY_BASE) / LIBRARY_SPAN)
        } else {
            None
        }
    }

    pub(crate) fn in_scratch(&self) -> bool {
        (SCRATCH_BASE..LIBRARY_BASE).contains(&self.pc)
    }

    /// Start executing the line whose header is at `header`. False if
    /// `header` is the end marker.
    pub(crate) fn start_at(&mut self, header: usize) -> Result<bool> {
        if self.code_word(header) == 0 {
            return Ok(false);
        }
        let number = self.code_word(header + 2);
        self.pc = header + LINE_HEADER;
        self.line = Some(number);
        if self.trace.lines && number <= self.trace.limit {
            self.screen.write_str(&format!("[{}]", number))?;
        }
        Ok(true)
    }

    /// Move from the line end at `pc` to the next line. False at the end of
    /// the code.
    pub(crate) fn next_line(&mut self) -> Result<bool> {
        if self.in_scratch() {
            return Ok(false);
        }
        self.start_at(self.pc + 1)
    }

    /// Continue at line `number` of the program or the current library
    pub(crate) fn goto_line(&mut self, number: u16) -> Result<()> {
        let header = match self.library_index(self.pc) {
            Some(index) => self
                .libraries
                .get(index)
                .and_then(|lib| lib.lines.get(&number))
                .map(|&offset| library_address(index, offset)),
            None => self.program.find_line(number),
        };
        match header {
            Some(h) if self.start_at(h)? => Ok(()),
            _ => Err(BasicError::new(ErrorKind::LineMiss).with_int(number as i64)),
        }
    }

    /// Line number of the code at `pc`
    pub(crate) fn line_of(&self, pc: usize) -> Option<u16> {
        match self.library_index(pc) {
            Some(index) => {
                let lib = self.libraries.get(index)?;
                let offset = pc - library_address(index, 0);
                lib.lines.iter().rev().find(|(_, &o)| o <= offset).map(|(&n, _)| n)
            }
            None => self.program.line_at(&self.mem, pc),
        }
    }

    /// Find `DEF PROCname` or `DEF FNname`, looking in the program first and
    /// then in the libraries in the order they were loaded
    pub(crate) fn find_definition(&mut self, key: &str) -> Result<Option<(usize, Option<String>)>> {
        if let Some(addr) = self.program.find_definition(&self.mem, key)? {
            return Ok(Some((addr, None)));
        }
        Ok(self.libraries.iter().enumerate().find_map(|(index, lib)| {
            lib.defs.get(key).map(|&offset| (library_address(index, offset), Some(lib.name.clone())))
        }))
    }

    // Running

    /// Execute statements until the code runs out or an FN returns
    fn execute(&mut self) -> Result<Option<Value>> {
        loop {
            self.statements += 1;
            if self.statements % POLL_INTERVAL == 0 {
                let now = self.video.monotonic();
                if now != self.last_poll {
                    self.last_poll = now;
                    self.keyboard.poll();
                    self.screen.flush();
                }
            }
            if self.keyboard.escape_pending() {
                self.keyboard.check_escape()?;
            }
            match self.skip_spaces() {
                b':' => self.pc += 1,
                LINE_END => {
                    if !self.next_line()? {
                        return Ok(None);
                    }
                }
                _ => {
                    if let Some(value) = self.statement()? {
                        return Ok(Some(value));
                    }
                }
            }
        }
    }

    /// [`Interpreter::execute`] with errors passed to the `ON ERROR` handlers
    pub(crate) fn run_loop(&mut self) -> Result<Option<Value>> {
        loop {
            match self.execute() {
                Ok(value) => return Ok(value),
                Err(err) => self.trap(err)?,
            }
        }
    }

    /// Deal with an error raised while running. `Ok` means execution can
    /// carry on from `pc`.
    fn trap(&mut self, err: BasicError) -> Result<()> {
        let err = self.locate(err);
        if matches!(err.kind, ErrorKind::EndRun | ErrorKind::Exit) {
            return Err(err);
        }
        if err.kind == ErrorKind::Escape {
            self.escape_effects();
        }
        match err.effective_severity(self.config.strict, self.config.ignore) {
            None => {
                self.skip_statement();
                Ok(())
            }
            Some(Severity::Info | Severity::Warning) => {
                self.print_warning(&err)?;
                self.skip_statement();
                Ok(())
            }
            Some(Severity::Fatal) => Err(err),
            Some(Severity::NonFatal) => {
                self.video.error_occurred();
                match self.handler.clone() {
                    Some(handler) if handler.fn_level == self.fn_level && handler.depth <= self.stack.len() => {
                        debug!(error = %err, line = ?err.line, local = handler.local, "error handler fired");
                        self.last_error = Some(err);
                        self.unwind_to(handler.depth);
                        self.pc = handler.resume.pc;
                        self.line = handler.resume.line;
                        Ok(())
                    }
                    _ => Err(err),
                }
            }
        }
    }

    /// Acknowledging an escape empties the sound queues and drops any
    /// half-sent VDU command, unless `*FX 230` turned that off
    fn escape_effects(&mut self) {
        if self.keyboard.escape_effects {
            debug!("escape: flushing sound and VDU queues");
            self.sound.flush_all();
            self.screen.reset_queue();
        }
    }

    /// Attach the line, procedure and library an error was raised in
    fn locate(&self, mut err: BasicError) -> BasicError {
        if let Some(line) = self.line {
            err = err.at_line(line);
        }
        if let Some(call) = self.stack.innermost_call() {
            err = err.in_proc(call.name.clone());
        }
        if let Some(lib) = self.library_index(self.pc).and_then(|i| self.libraries.get(i)) {
            err = err.in_library(lib.name.clone());
        }
        err
    }

    /// Pop frames down to `depth`, putting back what they saved
    pub(crate) fn unwind_to(&mut self, depth: usize) {
        for frame in self.stack.truncate(depth, &mut self.mem) {
            self.restore_frame(frame);
        }
    }

    pub(crate) fn restore_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Local { name, saved } => self.restore_variable(&name, saved),
            Frame::Private { owner, name, saved } => {
                if let Some(current) = self.vars.take(&name) {
                    self.privates.entry(owner).or_default().insert(name.clone(), current);
                }
                self.vars.restore(&name, saved);
            }
            Frame::Error(handler) => self.handler = handler,
            Frame::Data(data) => self.data = data,
            _ => {}
        }
    }

    /// Save a variable for `LOCAL` or a parameter
    pub(crate) fn save_variable(&mut self, name: &str) -> Option<Variable> {
        match static_index(name) {
            Some(index) => Some(Variable::Integer(self.vars.static_var(index))),
            None => self.vars.get_variable(name).cloned(),
        }
    }

    pub(crate) fn restore_variable(&mut self, name: &str, saved: Option<Variable>) {
        match static_index(name) {
            Some(index) => {
                if let Some(Variable::Integer(v)) = saved {
                    self.vars.set_static_var(index, v);
                }
            }
            None => self.vars.restore(name, saved),
        }
    }

    fn print_warning(&mut self, err: &BasicError) -> Result<()> {
        if self.screen.count() > 0 {
            self.screen.write(b"\r\n")?;
        }
        self.screen.write_str(&err.report(false))?;
        self.screen.write(b"\r\n")
    }

    /// Print an error that nothing handled, with the traceback if one was
    /// asked for
    fn report_error(&mut self, err: &BasicError) -> Result<()> {
        if self.screen.count() > 0 {
            self.screen.write(b"\r\n")?;
        }
        let text = match err.kind {
            ErrorKind::Stop => err.message(),
            _ => err.report(true),
        };
        self.screen.write_str(&text)?;
        self.screen.write(b"\r\n")?;
        if self.trace.back {
            for entry in self.stack.traceback(TRACEBACK_LIMIT) {
                let mut text = format!("  in {}", entry.name);
                if let Some(line) = entry.called_from {
                    text.push_str(&format!(" called from line {}", line));
                }
                if let Some(lib) = entry.library {
                    text.push_str(&format!(" in library {}", lib));
                }
                text.push_str("\r\n");
                self.screen.write_str(&text)?;
            }
        }
        Ok(())
    }

    /// Put everything back as it is between commands
    fn reset_after_run(&mut self) {
        self.unwind_to(0);
        self.fn_level = 0;
        self.fn_base = 0;
        self.scratch.truncate(1);
        if self.handler.as_ref().is_some_and(|h| h.resume.pc >= SCRATCH_BASE && h.resume.pc < LIBRARY_BASE) {
            self.handler = None;
        }
        self.screen.flush();
    }

    /// Tokenise and act on one line typed at the REPL: a line with a number
    /// is stored in the program, anything else runs at once. Errors are
    /// reported on the screen before being returned.
    pub fn execute_line(&mut self, text: &[u8]) -> Result<()> {
        let options = TokenizeOptions { require_line_number: false, hex64: self.config.hex64 };
        let result = tokenize_with(text, options).and_then(|line| {
            for warning in &line.warnings {
                self.warn(warning)?;
            }
            match line.line_number {
                Some(number) => self.edit_line(number, &line.tokens),
                None => self.immediate(line.tokens),
            }
        });
        // The stack is left as it was when the error happened until the
        // traceback has been printed
        match result {
            Err(err) if err.kind != ErrorKind::EndRun => {
                if err.kind != ErrorKind::Exit {
                    debug!(error = %err, "unhandled error");
                    self.last_error = Some(err.clone());
                    let _ = self.report_error(&err);
                }
                self.reset_after_run();
                Err(err)
            }
            _ => {
                self.reset_after_run();
                self.end_output_line()
            }
        }
    }

    /// Print a warning that was not raised while running
    pub(crate) fn warn(&mut self, warning: &BasicError) -> Result<()> {
        if warning.effective_severity(self.config.strict, self.config.ignore) == Some(Severity::NonFatal) {
            return Err(warning.clone());
        }
        if warning.effective_severity(self.config.strict, self.config.ignore).is_some() {
            self.print_warning(warning)?;
        }
        Ok(())
    }

    fn edit_line(&mut self, number: u16, payload: &[u8]) -> Result<()> {
        if payload.iter().all(|&b| b == b' ') {
            self.program.delete_line(&mut self.mem, number)?;
        } else {
            self.program.insert_line(&mut self.mem, number, payload)?;
        }
        self.program_changed();
        Ok(())
    }

    /// Variables live above the program, so editing it loses them
    pub(crate) fn program_changed(&mut self) {
        self.clear_variables();
    }

    /// `CLEAR`: everything except the static integers and installed libraries
    pub(crate) fn clear_variables(&mut self) {
        self.vars.clear();
        self.stack.clear(&mut self.mem);
        self.mem.clear_heap();
        self.data = DataPointer::default();
        self.privates.clear();
        self.libraries.retain(|lib| lib.installed);
    }

    fn immediate(&mut self, mut code: Vec<u8>) -> Result<()> {
        code.push(LINE_END);
        self.scratch.clear();
        self.pc = self.push_scratch(code);
        self.line = None;
        self.run_loop().map(|_| ())
    }

    /// Finish a part-written line so the next prompt starts in column 0
    fn end_output_line(&mut self) -> Result<()> {
        if self.screen.count() > 0 {
            self.screen.write(b"\r\n")?;
        }
        Ok(())
    }

    /// `RUN`: clear the variables and start at the first line
    pub(crate) fn run_program(&mut self) -> Result<()> {
        self.clear_variables();
        self.handler = None;
        self.trace.lines = false;
        self.screen.flush();
        info!(name = ?self.program_name, "running program");
        if !self.start_at(self.mem.page())? {
            return Err(ErrorKind::EndRun.into());
        }
        Ok(())
    }

    /// Load a program from a file, replacing the one in memory
    pub fn load_program(&mut self, name: &str) -> Result<()> {
        let (path, data) = self.files.read_file(name)?;
        let warnings = self.program.load(&mut self.mem, &data, self.config.hex64)?;
        self.program_changed();
        self.old_program = None;
        self.program_name = Some(path.display().to_string());
        debug!(path = %path.display(), lines = self.program.len(), "program loaded");
        for warning in &warnings {
            self.warn(warning)?;
        }
        Ok(())
    }

    /// Run the program in memory, as `RUN` typed at the REPL
    pub fn run(&mut self) -> Result<()> {
        self.execute_line(b"RUN")
    }

    /// Load a library that stays loaded until the interpreter ends
    pub fn install_library(&mut self, name: &str) -> Result<()> {
        self.load_library(name, true)
    }

    pub(crate) fn load_library(&mut self, name: &str, installed: bool) -> Result<()> {
        if self.libraries.iter().any(|lib| lib.name == name) {
            return Ok(());
        }
        let (path, data) = self
            .files
            .read_file(name)
            .map_err(|_| BasicError::new(ErrorKind::NoLib).with_str(name))?;
        let mut workspace = Workspace::new(data.len() * 2 + 0x1_0000)?;
        let mut store = ProgramStore::new();
        let warnings = store
            .load(&mut workspace, &data, self.config.hex64)
            .map_err(|_| BasicError::new(ErrorKind::LibLoad).with_str(name))?;
        let image = store.save_tokenised(&workspace)?;
        if image.len() >= LIBRARY_SPAN {
            return Err(BasicError::new(ErrorKind::LibLoad).with_str(name));
        }
        let lines = walk_lines(&image, 0)?;
        let defs = scan_definitions(&image, &lines);
        debug!(path = %path.display(), defs = defs.len(), installed, "library loaded");
        let library = Library {
            name: name.to_string(),
            lines: lines.iter().map(|l| (l.number, l.offset)).collect(),
            image,
            defs,
            installed,
        };
        if installed {
            let at = self.libraries.iter().take_while(|lib| lib.installed).count();
            self.libraries.insert(at, library);
        } else {
            self.libraries.push(library);
        }
        for warning in &warnings {
            self.warn(warning)?;
        }
        Ok(())
    }

    /// Read and execute lines until `QUIT` or the end of input, returning
    /// the exit status
    pub fn repl(&mut self) -> i32 {
        loop {
            if let Some(code) = self.quit {
                return code;
            }
            let prefill = match self.auto {
                Some((next, _)) if next > MAX_LINENO => {
                    self.auto = None;
                    Vec::new()
                }
                Some((next, _)) => format!("{} ", next).into_bytes(),
                None => Vec::new(),
            };
            if self.screen.write(b">").is_err() {
                return 1;
            }
            self.screen.flush();
            match self.keyboard.read_line(&mut self.screen, &prefill, MAX_INPUT_LINE) {
                Ok(Some(line)) => {
                    if let Some((next, step)) = self.auto {
                        self.auto = Some((next + step, step));
                    }
                    let _ = self.execute_line(&line);
                }
                Ok(None) => return self.quit.unwrap_or(0),
                Err(err) => {
                    self.auto = None;
                    if err.kind == ErrorKind::Escape {
                        self.escape_effects();
                    }
                    let _ = self.screen.write_str(&format!("{}\r\n", err.message()));
                }
            }
        }
    }
}

/// Code address of `offset` within library `index`
pub(crate) fn library_address(index: usize, offset: usize) -> usize {
    LIBRARY_BASE + index * LIBRARY_SPAN + offset
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interp() -> Interpreter {
        Interpreter::headless(Config::new()).unwrap()
    }

    fn run(interp: &mut Interpreter, lines: &[&str]) -> String {
        for line in lines {
            let _ = interp.execute_line(line.as_bytes());
        }
        interp.output()
    }

    #[test]
    fn test_immediate_print() {
        let mut i = interp();
        assert_eq!(run(&mut i, &["PRINT \"HELLO\""]), "HELLO\r\n");
    }

    #[test]
    fn test_program_run() {
        let mut i = interp();
        let out = run(&mut i, &["10 PRINT \"HELLO\"", "20 FOR I=1 TO 3:PRINT I;:NEXT", "RUN"]);
        assert_eq!(out, "HELLO\r\n         1         2         3\r\n");
    }

    #[test]
    fn test_unfinished_line_is_ended_before_prompt() {
        let mut i = interp();
        assert_eq!(run(&mut i, &["PRINT \"A\";"]), "A\r\n");
        assert_eq!(run(&mut i, &["PRINT \"B\""]), "B\r\n");
        assert_eq!(run(&mut i, &["VDU 7"]), "\x07");
    }

    #[test]
    fn test_edit_deletes_blank_line() {
        let mut i = interp();
        run(&mut i, &["10 PRINT 1", "20 PRINT 2", "20"]);
        assert_eq!(run(&mut i, &["RUN"]), "         1\r\n");
    }

    #[test]
    fn test_unhandled_error_reports_line() {
        let mut i = interp();
        let out = run(&mut i, &["10 X=1/0", "RUN"]);
        assert_eq!(out, "Division by zero at line 10\r\n");
        assert_eq!(i.last_error().map(|e| e.kind), Some(ErrorKind::DivZero));
        assert_eq!(i.stack_depth(), 0);
    }

    #[test]
    fn test_global_handler_resumes() {
        let mut i = interp();
        let out = run(
            &mut i,
            &["10 ON ERROR PRINT \"E\";ERR:END", "20 X=1/0", "30 PRINT \"NOT HERE\"", "RUN"],
        );
        assert_eq!(out, "E18\r\n");
    }

    #[test]
    fn test_immediate_handler_does_not_survive() {
        let mut i = interp();
        run(&mut i, &["ON ERROR PRINT \"X\""]);
        assert!(i.handler.is_none());
    }

    #[test]
    fn test_warning_continues() {
        let mut i = interp();
        let out = run(&mut i, &["HIMEM=0:PRINT \"ON\""]);
        assert!(out.contains("HIMEM value is out of range"));
        assert!(out.ends_with("ON\r\n"));
    }

    #[test]
    fn test_end_of_input_quits() {
        let mut i = interp();
        i.set_keys(b"PRINT 2+2\r");
        assert_eq!(i.repl(), 0);
        assert!(i.output().contains("         4"));
    }

    #[test]
    fn test_goto_missing_line() {
        let mut i = interp();
        let out = run(&mut i, &["10 GOTO 100", "RUN"]);
        assert_eq!(out, "Cannot find line 100 at line 10\r\n");
    }

    #[test]
    fn test_library_address_mapping() {
        let mut i = interp();
        i.libraries.push(Library {
            name: "lib".into(),
            image: vec![6, 0, 10, 0, b'A', LINE_END, 0, 0, 0xFF, 0xFF],
            lines: [(10, 0)].into_iter().collect(),
            defs: HashMap::new(),
            installed: true,
        });
        assert_eq!(i.byte_at(library_address(0, 4)), b'A');
        assert_eq!(i.byte_at(library_address(0, 100)), LINE_END);
        assert_eq!(i.line_of(library_address(0, 4)), Some(10));
        assert_eq!(i.library_index(library_address(0, 4)), Some(0));
    }
}
