//! Program editing commands and `RUN`/`CHAIN`

use std::env;
use std::process::Command;

use tracing::{debug, info};

use super::{Interpreter, MAX_INPUT_LINE};
use crate::error::{BasicError, ErrorKind, Result};
use crate::evaluator::str_value;
use crate::tokenizer::*;
use crate::variables::Value;

/// `LISTO` bits
const LISTO_SPACE: u8 = 1;
const LISTO_INDENT: u8 = 2;
const LISTO_SPLIT: u8 = 4;
const LISTO_NO_NUMBERS: u8 = 8;
const LISTO_LOWER: u8 = 16;
const LISTO_MAX: i32 = 31;

const DEFAULT_EDITOR: &str = "vi";

impl Interpreter {
    /// One of the commands tokenised with the `XCOMMAND` prefix
    pub(crate) fn command(&mut self, token: u8) -> Result<()> {
        match token {
            XCMD_LIST => self.list_command(),
            XCMD_LVAR => {
                self.check_end()?;
                self.lvar_command()
            }
            XCMD_HELP => {
                self.pc = self.line_end(self.pc);
                self.help_command()
            }
            XCMD_INSTALL => {
                loop {
                    let name = String::from_utf8_lossy(&self.eval_string()?).into_owned();
                    self.install_library(&name)?;
                    if !self.accept(b',') {
                        break;
                    }
                }
                self.check_end()
            }
            XCMD_APPEND | XCMD_CRUNCH | XCMD_TWIN | XCMD_TWINO => Err(ErrorKind::Unsupported.into()),
            _ => {
                // The rest change the program, which cannot happen under a
                // running program
                if self.line.is_some() {
                    return Err(ErrorKind::Running.into());
                }
                match token {
                    XCMD_NEW => self.new_command(),
                    XCMD_OLD => self.old_command(),
                    XCMD_RENUMBER => self.renumber_command(),
                    XCMD_DELETE => self.delete_command(),
                    XCMD_AUTO => self.auto_command(),
                    XCMD_LOAD | XCMD_TEXTLOAD => {
                        let name = self.file_name()?;
                        self.load_program(&name)
                    }
                    XCMD_SAVE | XCMD_TEXTSAVE => self.save_command(),
                    XCMD_EDIT => self.edit_command(),
                    _ => Err(ErrorKind::Syntax.into()),
                }
            }
        }
    }

    /// A plain line number in a command, as in `LIST 10,50`
    fn command_line_number(&mut self) -> Result<Option<u16>> {
        if self.skip_spaces() == TOKEN_LINENUM {
            return self.line_operand().map(Some);
        }
        let mut value: u32 = 0;
        let mut digits = 0;
        while self.current().is_ascii_digit() {
            value = value.saturating_mul(10).saturating_add((self.current() - b'0') as u32);
            digits += 1;
            self.pc += 1;
        }
        if digits == 0 {
            return Ok(None);
        }
        if value > MAX_LINENO {
            return Err(ErrorKind::LineNo.into());
        }
        Ok(Some(value as u16))
    }

    /// `first`, `first,`, `,last` or `first,last`. A lone number is a
    /// single line.
    fn line_range(&mut self) -> Result<(u16, u16)> {
        let first = self.command_line_number()?;
        if !self.accept(b',') {
            return Ok(first.map_or((0, MAX_LINENO as u16), |n| (n, n)));
        }
        let last = self.command_line_number()?;
        let range = (first.unwrap_or(0), last.unwrap_or(MAX_LINENO as u16));
        if range.0 > range.1 {
            return Err(ErrorKind::BadLineRange.into());
        }
        Ok(range)
    }

    /// Two numbers for `RENUMBER` and `AUTO`
    fn start_and_step(&mut self) -> Result<(u32, u32)> {
        let start = self.command_line_number()?.map_or(10, u32::from);
        let step = if self.accept(b',') { self.command_line_number()?.map_or(10, u32::from) } else { 10 };
        self.check_end()?;
        Ok((start, step))
    }

    /// `LIST [range] [IF text]`
    fn list_command(&mut self) -> Result<()> {
        if self.accept(b'O') {
            // LISTO arrives as LIST followed by the letter O
            let value = self.eval_i32()?;
            self.check_end()?;
            if !(0..=LISTO_MAX).contains(&value) {
                return Err(ErrorKind::BadListo.into());
            }
            self.listo = value as u8;
            return Ok(());
        }
        let (first, last) = self.line_range()?;
        let pattern = if self.accept(TOKEN_IF) {
            let end = self.line_end(self.pc);
            let rest: Vec<u8> = (self.pc..end).map(|a| self.byte_at(a)).collect();
            self.pc = end;
            Some(expand(&rest, false).trim().to_string())
        } else {
            self.check_end()?;
            None
        };
        let mut indent = 0;
        for (number, payload) in self.program.listing(&self.mem)? {
            let text = list_line(number, &payload, self.listo, &mut indent);
            if number < first || number > last {
                continue;
            }
            if let Some(pattern) = &pattern {
                if !expand(&payload, false).contains(pattern.as_str()) {
                    continue;
                }
            }
            self.keyboard.check_escape()?;
            self.screen.write_str(&text)?;
            self.screen.write(b"\r\n")?;
        }
        Ok(())
    }

    fn lvar_command(&mut self) -> Result<()> {
        let at = self.vars.at_percent();
        let mut lines = Vec::new();
        for (name, variable) in self.vars.sorted() {
            let line = match variable.value() {
                Value::Str(s) => format!("{} = \"{}\"", name, String::from_utf8_lossy(&s)),
                Value::Array(array) => {
                    let dims: Vec<String> = array.borrow().dims.iter().map(|d| (*d as i64 - 1).to_string()).collect();
                    format!("{}{})", name, dims.join(","))
                }
                value => format!("{} = {}", name, str_value(&value, at)),
            };
            lines.push(line);
        }
        for library in &self.libraries {
            lines.push(format!("Library: {}", library.name));
        }
        for line in lines {
            self.screen.write_str(&line)?;
            self.screen.write(b"\r\n")?;
        }
        Ok(())
    }

    fn help_command(&mut self) -> Result<()> {
        let mut text = format!("\r\nBrandy BASIC V/VI interpreter version {}\r\n\r\n", env!("CARGO_PKG_VERSION"));
        let mut column = 0;
        for token in 0x80..=0xFFu8 {
            if let Some(word) = keyword_text(token) {
                text.push_str(&format!("{:<10}", word));
                column += 1;
                if column % 7 == 0 {
                    text.push_str("\r\n");
                }
            }
        }
        text.push_str("\r\n");
        self.screen.write_str(&text)
    }

    fn new_command(&mut self) -> Result<()> {
        self.check_end()?;
        if !self.program.is_empty() {
            self.old_program = Some(self.program.save_tokenised(&self.mem)?);
        }
        self.program.clear_program(&mut self.mem)?;
        self.program_name = None;
        self.program_changed();
        info!("program cleared");
        Ok(())
    }

    fn old_command(&mut self) -> Result<()> {
        self.check_end()?;
        let image = self.old_program.take().ok_or_else(|| BasicError::new(ErrorKind::NoOld))?;
        self.program.load(&mut self.mem, &image, self.config.hex64)?;
        self.program_changed();
        Ok(())
    }

    fn renumber_command(&mut self) -> Result<()> {
        let (start, step) = self.start_and_step()?;
        if start > MAX_LINENO || step == 0 || step > MAX_LINENO {
            return Err(ErrorKind::Silly.into());
        }
        let warnings = self.program.renumber(&mut self.mem, start as u16, step as u16)?;
        self.program_changed();
        for warning in &warnings {
            self.warn(warning)?;
        }
        Ok(())
    }

    fn delete_command(&mut self) -> Result<()> {
        let first = self.command_line_number()?;
        let last = if self.accept(b',') { self.command_line_number()? } else { first };
        self.check_end()?;
        let (first, last) = match (first, last) {
            (Some(first), Some(last)) if first <= last => (first, last),
            _ => return Err(ErrorKind::BadLineRange.into()),
        };
        self.program.delete_range(&mut self.mem, first, last)?;
        self.program_changed();
        Ok(())
    }

    /// `AUTO [start[, step]]`: the REPL offers numbered lines until a line
    /// number would go past the end
    fn auto_command(&mut self) -> Result<()> {
        let (start, step) = self.start_and_step()?;
        if step == 0 || step > 255 {
            return Err(ErrorKind::BadAuto.into());
        }
        self.auto = Some((start, step));
        Ok(())
    }

    /// File name operand, or the name of the program last loaded
    fn file_name(&mut self) -> Result<String> {
        let name = if self.at_statement_end() {
            self.program_name.clone().ok_or_else(|| BasicError::new(ErrorKind::Syntax))?
        } else {
            String::from_utf8_lossy(&self.eval_string()?).into_owned()
        };
        self.check_end()?;
        Ok(name)
    }

    fn save_command(&mut self) -> Result<()> {
        if self.program.is_empty() {
            return Err(ErrorKind::NoProgram.into());
        }
        let name = self.file_name()?;
        let text = self.program.save_text(&self.mem)?;
        self.files.write_file(&name, &text)?;
        debug!(name = %name, bytes = text.len(), "program saved");
        self.program_name = Some(name);
        Ok(())
    }

    /// `EDIT` hands the program to the editor named by `BRANDY_EDITOR`;
    /// `EDIT n` edits one line in place
    fn edit_command(&mut self) -> Result<()> {
        if let Some(number) = self.command_line_number()? {
            self.check_end()?;
            return self.edit_one_line(number);
        }
        self.check_end()?;
        let editor = env::var("BRANDY_EDITOR").unwrap_or_else(|_| DEFAULT_EDITOR.to_string());
        let path = env::temp_dir().join(format!("brandy{}.bas", std::process::id()));
        let failed = |why: String| BasicError::new(ErrorKind::EditFail).with_str(why);
        std::fs::write(&path, self.program.save_text(&self.mem)?).map_err(|e| failed(e.to_string()))?;
        self.screen.flush();
        let status = Command::new(&editor).arg(&path).status().map_err(|e| failed(e.to_string()))?;
        if !status.success() {
            let _ = std::fs::remove_file(&path);
            return Err(failed(format!("{} returned {}", editor, status)));
        }
        let text = std::fs::read(&path).map_err(|e| failed(e.to_string()))?;
        let _ = std::fs::remove_file(&path);
        let warnings = self.program.load(&mut self.mem, &text, self.config.hex64)?;
        self.program_changed();
        for warning in &warnings {
            self.warn(warning)?;
        }
        Ok(())
    }

    fn edit_one_line(&mut self, number: u16) -> Result<()> {
        let offset = self.program.find_line(number).ok_or_else(|| BasicError::new(ErrorKind::LineMiss).with_int(number as i64))?;
        let payload = self
            .program
            .listing(&self.mem)?
            .into_iter()
            .find(|(n, _)| *n == number)
            .map(|(_, p)| p)
            .unwrap_or_default();
        debug!(number, offset, "editing line");
        let prefill = format!("{}{}", number, expand(&payload, false));
        let Some(line) = self.keyboard.read_line(&mut self.screen, prefill.as_bytes(), MAX_INPUT_LINE)? else {
            return Ok(());
        };
        let options = TokenizeOptions { require_line_number: true, hex64: self.config.hex64 };
        let tokenized = tokenize_with(&line, options)?;
        match tokenized.line_number {
            Some(n) => self.edit_line(n, &tokenized.tokens),
            None => Err(ErrorKind::LineNo.into()),
        }
    }

    /// `RUN`, or `RUN "file"` which is `CHAIN`
    pub(crate) fn run_statement(&mut self) -> Result<()> {
        if self.at_statement_end() {
            return self.run_program();
        }
        self.chain_statement()
    }

    /// `CHAIN "file"`: load a program and run it
    pub(crate) fn chain_statement(&mut self) -> Result<()> {
        let name = String::from_utf8_lossy(&self.eval_string()?).into_owned();
        self.check_end()?;
        self.load_program(&name)?;
        self.run_program()
    }
}

fn opens_block(token: &Token) -> bool {
    matches!(
        token,
        Token::Keyword(TOKEN_FOR | TOKEN_REPEAT)
            | Token::ExtendedKeyword(TOKEN_XSTATEMENT, XSTMT_WHILE | XSTMT_CASE)
    )
}

fn closes_block(token: &Token) -> bool {
    matches!(token, Token::Keyword(TOKEN_NEXT | TOKEN_UNTIL | TOKEN_ENDWHILE | TOKEN_ENDCASE | TOKEN_ENDIF))
}

/// Format one line as `LIST` shows it, tracking structure depth in
/// `indent` for `LISTO 2`
fn list_line(number: u16, payload: &[u8], listo: u8, indent: &mut usize) -> String {
    let tokens: Vec<Token> = TokenIter::new(payload).filter(|t| *t != Token::Char(b' ')).collect();
    let leading_closers = tokens.iter().take_while(|t| closes_block(t)).count();
    let opened = tokens.iter().filter(|t| opens_block(t)).count();
    let closed = tokens.iter().filter(|t| closes_block(t)).count();
    // A block IF ends its line with THEN
    let block_if = tokens.first() == Some(&Token::Keyword(TOKEN_IF))
        && tokens.last() == Some(&Token::Keyword(TOKEN_THEN));
    let here = indent.saturating_sub(leading_closers);
    *indent = (*indent + opened + usize::from(block_if)).saturating_sub(closed);

    let mut text = String::new();
    if listo & LISTO_NO_NUMBERS == 0 {
        text.push_str(&format!("{:5}", number));
    }
    if listo & LISTO_SPACE != 0 {
        text.push(' ');
    }
    let body = expand(payload, listo & LISTO_LOWER != 0);
    let body = if listo & LISTO_INDENT != 0 {
        format!(" {}{}", "  ".repeat(here), body.trim_start())
    } else {
        body
    };
    if listo & LISTO_SPLIT == 0 {
        text.push_str(&body);
        return text;
    }
    let margin = " ".repeat(text.len());
    let mut quoted = false;
    for c in body.chars() {
        match c {
            '"' => quoted = !quoted,
            ':' if !quoted => {
                text.push_str("\r\n");
                text.push_str(&margin);
            }
            _ => {}
        }
        text.push(c);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn interp() -> Interpreter {
        Interpreter::headless(Config::new()).unwrap()
    }

    fn run(interp: &mut Interpreter, lines: &[&str]) -> String {
        for line in lines {
            let _ = interp.execute_line(line.as_bytes());
        }
        interp.output()
    }

    fn payload(src: &str) -> Vec<u8> {
        tokenize(src).unwrap().tokens
    }

    #[test]
    fn test_list_line_plain() {
        let mut indent = 0;
        assert_eq!(list_line(10, &payload("10 PRINT \"HI\""), 0, &mut indent), "   10 PRINT \"HI\"");
        assert_eq!(list_line(20, &payload("20 PRINT 1"), 8 | 16, &mut indent), " print 1");
    }

    #[test]
    fn test_list_line_indents_blocks() {
        let mut indent = 0;
        let lines = ["10 FOR I=1 TO 2", "20 PRINT I", "30 NEXT"];
        let out: Vec<String> = lines.iter().map(|l| list_line(0, &payload(l), LISTO_INDENT | LISTO_NO_NUMBERS, &mut indent)).collect();
        assert_eq!(out, vec![" FOR I=1 TO 2", "   PRINT I", " NEXT"]);
        assert_eq!(indent, 0);
    }

    #[test]
    fn test_list_line_split() {
        let mut indent = 0;
        let text = list_line(5, &payload("5 A=1:PRINT \"a:b\""), LISTO_SPLIT, &mut indent);
        assert_eq!(text, "    5 A=1\r\n     :PRINT \"a:b\"");
    }

    #[test]
    fn test_list_range_and_if() {
        let mut i = interp();
        let out = run(&mut i, &["10 REM one", "20 PRINT 2", "30 REM three", "LIST 20,"]);
        assert_eq!(out, "   20 PRINT 2\r\n   30 REM three\r\n");
        let out = run(&mut i, &["LIST IF REM"]);
        assert_eq!(out, "   10 REM one\r\n   30 REM three\r\n");
        let out = run(&mut i, &["LIST 10"]);
        assert_eq!(out, "   10 REM one\r\n");
    }

    #[test]
    fn test_new_and_old() {
        let mut i = interp();
        let out = run(&mut i, &["10 PRINT \"X\"", "NEW", "LIST", "OLD", "RUN"]);
        assert_eq!(out, "X\r\n");
        let out = run(&mut i, &["OLD"]);
        assert!(out.contains("Cannot recover program"));
    }

    #[test]
    fn test_renumber_and_delete() {
        let mut i = interp();
        run(&mut i, &["1 GOTO 3", "2 PRINT \"NO\"", "3 PRINT \"YES\"", "RENUMBER 100,5"]);
        assert_eq!(run(&mut i, &["LIST"]), "  100 GOTO 110\r\n  105 PRINT \"NO\"\r\n  110 PRINT \"YES\"\r\n");
        run(&mut i, &["DELETE 100,105"]);
        assert_eq!(run(&mut i, &["LIST"]), "  110 PRINT \"YES\"\r\n");
        assert!(run(&mut i, &["DELETE 50,10"]).contains("Line number range is invalid"));
    }

    #[test]
    fn test_editing_commands_rejected_in_program() {
        let mut i = interp();
        let out = run(&mut i, &["10 NEW", "RUN"]);
        assert!(out.contains("Command cannot be used in a running program"));
    }

    #[test]
    fn test_save_and_chain() {
        let mut i = interp();
        let path = std::env::temp_dir().join(format!("brandy_chain_{}.bas", std::process::id()));
        let name = path.display().to_string();
        run(&mut i, &["10 PRINT \"CHAINED\"", &format!("SAVE \"{}\"", name), "NEW"]);
        let out = run(&mut i, &[&format!("CHAIN \"{}\"", name)]);
        let _ = std::fs::remove_file(&path);
        assert_eq!(out, "CHAINED\r\n");
    }

    #[test]
    fn test_listo_range() {
        let mut i = interp();
        assert!(run(&mut i, &["LISTO 99"]).contains("LISTO option value is out of range"));
        run(&mut i, &["LISTO 8", "10 PRINT"]);
        assert_eq!(run(&mut i, &["LIST"]), " PRINT\r\n");
    }

    #[test]
    fn test_auto_numbers_lines() {
        let mut i = interp();
        run(&mut i, &["AUTO 100,10"]);
        assert_eq!(i.auto, Some((100, 10)));
    }

    #[test]
    fn test_lvar_lists_variables() {
        let mut i = interp();
        let out = run(&mut i, &["B$=\"x\":A=2:DIM C%(3)", "LVAR"]);
        assert!(out.contains("A = 2"));
        assert!(out.contains("B$ = \"x\""));
        assert!(out.contains("C%(3)"));
    }
}
