//! PRINT, INPUT, READ/DATA/RESTORE and the file channel statements

use std::collections::VecDeque;

use super::{Interpreter, MAX_INPUT_LINE};
use crate::error::{BasicError, ErrorKind, Result};
use crate::evaluator::{field_width, format_hex, format_number, parse_number, LValue};
use crate::program::{walk_lines, LINE_HEADER};
use crate::stack::Frame;
use crate::tokenizer::*;
use crate::variables::Value;

/// Offset just past the `DATA` token of the first `DATA` statement in a
/// line payload, if there is one
pub(crate) fn find_data(payload: &[u8]) -> Option<usize> {
    let mut pos = 0;
    let mut statement_start = true;
    while pos < payload.len() {
        let b = payload[pos];
        if statement_start && b != b' ' {
            if b == TOKEN_DATA {
                return Some(pos + 1);
            }
            statement_start = false;
        }
        match b {
            LINE_END | TOKEN_REM => return None,
            b':' => {
                statement_start = true;
                pos += 1;
            }
            b'"' => {
                pos += 1;
                while pos < payload.len() && payload[pos] != b'"' {
                    pos += 1;
                }
                pos += 1;
            }
            TOKEN_LINENUM => pos += 4,
            TOKEN_XFUNCTION | TOKEN_XCOMMAND | TOKEN_XSTATEMENT => pos += 2,
            TOKEN_THEN | TOKEN_ELSE | TOKEN_XELSE => {
                statement_start = true;
                pos += 1;
            }
            _ => pos += 1,
        }
    }
    None
}

/// Split a typed reply to `INPUT` into its comma separated fields. Quotes
/// around a field are removed, with `""` standing for one quote.
pub(crate) fn split_input(line: &[u8]) -> VecDeque<Vec<u8>> {
    let mut fields = VecDeque::new();
    let mut pos = 0;
    loop {
        while line.get(pos) == Some(&b' ') {
            pos += 1;
        }
        let mut field = Vec::new();
        if line.get(pos) == Some(&b'"') {
            pos += 1;
            while pos < line.len() {
                if line[pos] == b'"' {
                    if line.get(pos + 1) == Some(&b'"') {
                        field.push(b'"');
                        pos += 2;
                        continue;
                    }
                    pos += 1;
                    break;
                }
                field.push(line[pos]);
                pos += 1;
            }
            while pos < line.len() && line[pos] != b',' {
                pos += 1;
            }
        } else {
            while pos < line.len() && line[pos] != b',' {
                field.push(line[pos]);
                pos += 1;
            }
        }
        fields.push_back(field);
        if pos >= line.len() {
            return fields;
        }
        pos += 1;
    }
}

/// Convert text read by `INPUT` or `READ` for the variable it goes into
fn input_value(target: &LValue, text: Vec<u8>) -> Value {
    if target.is_string() {
        return Value::Str(text);
    }
    let start = text.iter().position(|&b| b != b' ').unwrap_or(text.len());
    let (value, used) = parse_number(&text[start..]);
    if used == 0 {
        Value::Int(0)
    } else {
        value
    }
}

impl Interpreter {
    /// Write text from `PRINT`, breaking lines at `WIDTH`
    fn print_text(&mut self, text: &[u8]) -> Result<()> {
        if self.width == 0 {
            return self.screen.write(text);
        }
        for &b in text {
            if self.screen.count() >= self.width {
                self.screen.write(b"\r\n")?;
            }
            self.screen.write_byte(b)?;
        }
        Ok(())
    }

    fn print_spaces(&mut self, n: usize) -> Result<()> {
        self.print_text(&vec![b' '; n])
    }

    pub(crate) fn print_statement(&mut self) -> Result<()> {
        if self.skip_spaces() == b'#' {
            return self.print_file();
        }
        let mut padded = true;
        let mut hex = false;
        let mut newline = true;
        while !self.at_statement_end() {
            newline = true;
            match self.current() {
                b';' => {
                    self.pc += 1;
                    padded = false;
                    newline = false;
                }
                b',' => {
                    self.pc += 1;
                    padded = true;
                    newline = false;
                    let field = field_width(self.vars.at_percent()).max(1);
                    let count = self.screen.count();
                    if count % field != 0 {
                        self.print_spaces(field - count % field)?;
                    }
                }
                b'\'' => {
                    self.pc += 1;
                    self.screen.write(b"\r\n")?;
                }
                b'~' => {
                    self.pc += 1;
                    hex = true;
                }
                TOKEN_TAB => {
                    self.pc += 1;
                    let x = self.eval_i32()?;
                    if self.accept(b',') {
                        let y = self.eval_i32()?;
                        self.expect(b')', ErrorKind::RpMiss)?;
                        self.screen.write(&[31, x as u8, y as u8])?;
                    } else {
                        self.expect(b')', ErrorKind::RpMiss)?;
                        let x = x.max(0) as usize;
                        if self.screen.count() > x {
                            self.screen.write(b"\r\n")?;
                        }
                        let gap = x - self.screen.count().min(x);
                        self.print_spaces(gap)?;
                    }
                }
                TOKEN_SPC => {
                    self.pc += 1;
                    let n = self.factor()?.to_i64()?;
                    self.print_spaces(n.clamp(0, 255) as usize)?;
                }
                _ => {
                    let value = self.expression()?;
                    let at = self.vars.at_percent();
                    let text = match &value {
                        Value::Str(s) => s.clone(),
                        Value::Array(_) => return Err(ErrorKind::VarArray.into()),
                        number => {
                            let text = if hex {
                                format_hex(number, self.config.hex64)
                            } else {
                                format_number(number, at)
                            };
                            let width = if padded { field_width(at) } else { 0 };
                            format!("{:>width$}", text, width = width).into_bytes()
                        }
                    };
                    hex = false;
                    self.print_text(&text)?;
                }
            }
        }
        if newline {
            self.screen.write(b"\r\n")?;
        }
        Ok(())
    }

    fn print_file(&mut self) -> Result<()> {
        let handle = self.channel()?;
        while self.accept(b',') || self.accept(b';') {
            let value = self.expression()?;
            self.files.write_value(handle, &value)?;
        }
        self.check_end()
    }

    /// Read one reply line, or fail when the input has run out
    fn input_line(&mut self) -> Result<Vec<u8>> {
        self.screen.flush();
        match self.keyboard.read_line(&mut self.screen, b"", MAX_INPUT_LINE)? {
            Some(line) => Ok(line),
            None => Err(self.input_exhausted()),
        }
    }

    /// `INPUT [LINE] ["prompt"{,|;}] var, ...` and `LINE INPUT`
    pub(crate) fn input_statement(&mut self, whole_lines: bool) -> Result<()> {
        if self.skip_spaces() == b'#' {
            return self.input_file();
        }
        let whole_lines = whole_lines || self.accept(TOKEN_LINE);
        let mut fields: VecDeque<Vec<u8>> = VecDeque::new();
        let mut prompted = false;
        while !self.at_statement_end() {
            match self.current() {
                b'"' => {
                    let prompt = self.string_literal()?;
                    self.screen.write(&prompt)?;
                    prompted = !matches!(self.skip_spaces(), b',' | b';');
                    if !prompted {
                        self.pc += 1;
                    }
                }
                b',' | b';' => self.pc += 1,
                b'\'' => {
                    self.pc += 1;
                    self.screen.write(b"\r\n")?;
                }
                TOKEN_TAB => {
                    self.pc += 1;
                    let x = self.eval_i32()?;
                    let y = if self.accept(b',') { self.eval_i32()? } else { self.screen.vpos() };
                    self.expect(b')', ErrorKind::RpMiss)?;
                    self.screen.write(&[31, x as u8, y as u8])?;
                }
                TOKEN_SPC => {
                    self.pc += 1;
                    let n = self.factor()?.to_i64()?;
                    self.screen.write(&vec![b' '; n.clamp(0, 255) as usize])?;
                }
                _ => {
                    let target = self.lvalue()?;
                    if fields.is_empty() {
                        if !prompted {
                            self.screen.write(b"?")?;
                        }
                        let line = self.input_line()?;
                        fields = if whole_lines { VecDeque::from([line]) } else { split_input(&line) };
                    }
                    prompted = false;
                    let text = fields.pop_front().unwrap_or_default();
                    let value = input_value(&target, text);
                    self.assign_lvalue(&target, value)?;
                }
            }
        }
        Ok(())
    }

    fn input_file(&mut self) -> Result<()> {
        let handle = self.channel()?;
        while self.accept(b',') {
            let target = self.lvalue()?;
            let value = self.files.read_value(handle)?;
            if value.is_string() != target.is_string() {
                let kind = if target.is_string() { ErrorKind::TypeStr } else { ErrorKind::TypeNum };
                return Err(kind.into());
            }
            self.assign_lvalue(&target, value)?;
        }
        self.check_end()
    }

    /// Header address of the first line at or after `from` holding a `DATA`
    /// statement, with the address of its first item
    fn find_data_from(&self, from: usize) -> Result<Option<usize>> {
        let text = self.mem.slice(0, self.mem.top() + LINE_HEADER)?;
        let lines = walk_lines(text, self.mem.page())?;
        Ok(lines
            .iter()
            .filter(|line| line.offset >= from)
            .find_map(|line| find_data(&text[line.payload()..line.end()]).map(|offset| line.payload() + offset)))
    }

    /// Text of the next `DATA` item, moving the data pointer on
    fn next_data_item(&mut self) -> Result<Vec<u8>> {
        let start = match self.data.item {
            Some(item) => item,
            None => {
                let from = self.data.search_from.unwrap_or_else(|| self.mem.page());
                self.find_data_from(from)?.ok_or_else(|| BasicError::new(ErrorKind::Data))?
            }
        };
        let mut pos = start;
        while self.byte_at(pos) == b' ' {
            pos += 1;
        }
        let mut item = Vec::new();
        if self.byte_at(pos) == b'"' {
            pos += 1;
            loop {
                match self.byte_at(pos) {
                    LINE_END => break,
                    b'"' if self.byte_at(pos + 1) == b'"' => {
                        item.push(b'"');
                        pos += 2;
                    }
                    b'"' => {
                        pos += 1;
                        break;
                    }
                    b => {
                        item.push(b);
                        pos += 1;
                    }
                }
            }
            while !matches!(self.byte_at(pos), b',' | LINE_END) {
                pos += 1;
            }
        } else {
            while !matches!(self.byte_at(pos), b',' | LINE_END) {
                item.push(self.byte_at(pos));
                pos += 1;
            }
        }
        if self.byte_at(pos) == b',' {
            self.data.item = Some(pos + 1);
        } else {
            self.data.item = None;
            self.data.search_from = Some(pos + 1);
        }
        Ok(item)
    }

    pub(crate) fn read_statement(&mut self) -> Result<()> {
        while !self.at_statement_end() {
            let target = self.lvalue()?;
            let text = self.next_data_item()?;
            self.assign_lvalue(&target, input_value(&target, text))?;
            if !self.accept(b',') {
                break;
            }
        }
        self.check_end()
    }

    /// `RESTORE`, `RESTORE line`, `RESTORE +n`, `RESTORE ERROR`, `RESTORE DATA`
    pub(crate) fn restore_statement(&mut self) -> Result<()> {
        if self.accept(TOKEN_ERROR) || self.accept(TOKEN_DATA) {
            let error = self.byte_at(self.pc - 1) == TOKEN_ERROR;
            let index = self
                .stack
                .find(true, |f| if error { matches!(f, Frame::Error(_)) } else { matches!(f, Frame::Data(_)) });
            if let Some(index) = index {
                self.unwind_to(index);
            }
            if error {
                return self.check_end();
            }
            self.pc = self.line_end(self.pc);
            return Ok(());
        }
        let header = if self.at_statement_end() {
            self.mem.page()
        } else if self.accept(b'+') {
            let offset = self.eval_i64()?.max(0) as usize;
            let current = self.line.and_then(|n| self.program.find_line(n)).unwrap_or_else(|| self.mem.page());
            let text = self.mem.slice(0, self.mem.top() + LINE_HEADER)?;
            let lines = walk_lines(text, self.mem.page())?;
            let here = lines.iter().position(|l| l.offset == current).unwrap_or(0);
            lines.get(here + offset).map_or(self.mem.top(), |l| l.offset)
        } else {
            let number = self.line_operand()?;
            self.program
                .find_line(number)
                .ok_or_else(|| BasicError::new(ErrorKind::LineMiss).with_int(number as i64))?
        };
        self.check_end()?;
        self.data.item = None;
        self.data.search_from = Some(header);
        Ok(())
    }

    /// `BPUT#h, value [, value...] [;]`: numbers go as single bytes, strings
    /// are followed by a newline unless the list ends with `;`
    pub(crate) fn bput_statement(&mut self) -> Result<()> {
        let handle = self.channel()?;
        self.expect(b',', ErrorKind::CoMiss)?;
        loop {
            let value = self.expression()?;
            match value {
                Value::Str(mut bytes) => {
                    if !self.accept(b';') {
                        bytes.push(b'\n');
                    }
                    self.files.bput(handle, &bytes)?;
                }
                number => self.files.bput(handle, &[number.to_i64()? as u8])?,
            }
            if !self.accept(b',') {
                break;
            }
        }
        self.check_end()
    }

    pub(crate) fn close_statement(&mut self) -> Result<()> {
        let handle = self.channel()?;
        self.check_end()?;
        if handle == 0 {
            self.files.close_all();
            Ok(())
        } else {
            self.files.close(handle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tokenizer::tokenize;

    fn interp() -> Interpreter {
        Interpreter::headless(Config::new()).unwrap()
    }

    #[test]
    fn test_find_data() {
        let line = tokenize("X=1:DATA 1,2").unwrap().tokens;
        let at = find_data(&line).unwrap();
        assert_eq!(&line[at..], b" 1,2");
        let rem = tokenize("REM DATA 1").unwrap().tokens;
        assert_eq!(find_data(&rem), None);
        let quoted = tokenize("PRINT \":DATA\"").unwrap().tokens;
        assert_eq!(find_data(&quoted), None);
    }

    #[test]
    fn test_split_input() {
        let fields = split_input(b"1, \"a,b\" ,\"say \"\"hi\"\"\",x");
        assert_eq!(fields, VecDeque::from([b"1".to_vec(), b"a,b".to_vec(), b"say \"hi\"".to_vec(), b"x".to_vec()]));
        assert_eq!(split_input(b""), VecDeque::from([Vec::new()]));
    }

    #[test]
    fn test_print_separators() {
        let mut i = interp();
        i.execute_line(b"PRINT 1,2;3'\"A\";").unwrap();
        assert_eq!(i.output(), "         1         23\r\nA\r\n");
        i.execute_line(b"PRINT \"AB\",\"C\"").unwrap();
        assert_eq!(i.output(), "AB        C\r\n");
        i.execute_line(b"PRINT ;~255;\"|\";TAB(6);\"Z\";SPC2;\"Y\"").unwrap();
        assert_eq!(i.output(), "FF|   Z  Y\r\n");
    }

    #[test]
    fn test_print_width() {
        let mut i = interp();
        i.execute_line(b"WIDTH 3:PRINT \"ABCDEFG\"").unwrap();
        assert_eq!(i.output(), "ABC\r\nDEF\r\nG\r\n");
    }

    #[test]
    fn test_read_data_restore() {
        let mut i = interp();
        for line in ["10 READ A,B$,C$", "20 PRINT A;B$;C$", "30 RESTORE 50:READ D:PRINT D", "40 DATA 12, \"x,y\",plain", "50 DATA 99"] {
            i.execute_line(line.as_bytes()).unwrap();
        }
        i.execute_line(b"RUN").unwrap();
        assert_eq!(i.output(), "        12x,yplain\r\n        99\r\n");
        let _ = i.execute_line(b"READ Q");
        assert!(i.output().contains("Out of data"));
    }

    #[test]
    fn test_input_fields() {
        let mut i = interp();
        i.set_keys(b"3,hello\r");
        i.execute_line(b"INPUT \"N\",N,S$:PRINT N;S$").unwrap();
        assert_eq!(i.output(), "N?3,hello\r\n         3hello\r\n");
    }

    #[test]
    fn test_input_line_keeps_commas() {
        let mut i = interp();
        i.set_keys(b"a, b\r");
        i.execute_line(b"INPUT LINE A$:PRINT A$").unwrap();
        assert_eq!(i.output(), "?a, b\r\na, b\r\n");
    }

    #[test]
    fn test_input_end_of_input() {
        let mut i = interp();
        let err = i.execute_line(b"INPUT X").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Exit);
        assert_eq!(i.quit_code(), Some(0));
    }
}
