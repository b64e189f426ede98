//! Statement dispatch, assignment and the statements that manage variables

use tracing::debug;

use super::Interpreter;
use crate::error::{BasicError, ErrorKind, Result};
use crate::evaluator::{address, apply, LValue, Op};
use crate::stack::Frame;
use crate::tokenizer::*;
use crate::variables::{static_index, VarType, Value, Variable, MAXSTRING, MAX_DIMS};

impl Interpreter {
    /// Execute the statement at `pc`. Returns the value of an FN's `=`.
    pub(crate) fn statement(&mut self) -> Result<Option<Value>> {
        let token = self.current();
        let next = self.byte_at(self.pc + 1);
        match token {
            TOKEN_XSTATEMENT | TOKEN_XCOMMAND => {
                self.pc += 2;
                return self.extended_statement(token, next);
            }
            b'=' => {
                self.pc += 1;
                return self.fn_return().map(Some);
            }
            b'*' => {
                let start = self.pc + 1;
                let end = self.line_end(start);
                let command: Vec<u8> = (start..end).map(|a| self.byte_at(a)).collect();
                self.pc = end;
                self.oscli(&command)?;
                return Ok(None);
            }
            TOKEN_ENDPROC => {
                self.pc += 1;
                self.endproc()?;
                return Ok(None);
            }
            _ => {}
        }
        if token < TOKEN_OTHERWISE {
            return self.assignment().map(|_| None);
        }
        self.pc += 1;
        match token {
            TOKEN_PRINT => self.print_statement()?,
            TOKEN_INPUT => self.input_statement(false)?,
            TOKEN_LINE => {
                if self.accept(TOKEN_INPUT) {
                    self.input_statement(true)?;
                } else {
                    self.line_statement()?;
                }
            }
            TOKEN_READ => self.read_statement()?,
            TOKEN_RESTORE => self.restore_statement()?,
            TOKEN_REM | TOKEN_DATA | TOKEN_DEF | TOKEN_ELSE => self.pc = self.line_end(self.pc),
            TOKEN_BPUT => self.bput_statement()?,
            TOKEN_CLOSE => self.close_statement()?,
            TOKEN_IF => self.if_statement()?,
            TOKEN_XELSE => self.skip_block_if(false)?,
            TOKEN_ENDIF | TOKEN_ENDCASE => {}
            TOKEN_FOR => self.for_statement()?,
            TOKEN_NEXT => self.next_statement()?,
            TOKEN_REPEAT => self.repeat_statement()?,
            TOKEN_UNTIL => self.until_statement()?,
            TOKEN_ENDWHILE => self.endwhile_statement()?,
            TOKEN_WHEN | TOKEN_OTHERWISE => self.end_of_when()?,
            TOKEN_GOTO => {
                let line = self.line_operand()?;
                self.goto_line(line)?;
            }
            TOKEN_GOSUB => self.gosub_statement()?,
            TOKEN_RETURN => self.return_statement()?,
            TOKEN_ON => self.on_statement()?,
            TOKEN_PROC => self.proc_statement()?,
            TOKEN_LOCAL => self.local_statement()?,
            TOKEN_DIM => self.dim_statement()?,
            TOKEN_LET => self.assignment()?,
            TOKEN_CLEAR => {
                self.check_end()?;
                self.clear_variables();
            }
            TOKEN_END => {
                if self.accept(b'=') {
                    return Err(ErrorKind::Unsupported.into());
                }
                return Err(ErrorKind::EndRun.into());
            }
            TOKEN_STOP => {
                return Err(BasicError::new(ErrorKind::Stop).with_int(self.line.unwrap_or(0) as i64));
            }
            TOKEN_TRACE => self.trace_statement()?,
            TOKEN_ERROR => self.error_statement()?,
            TOKEN_REPORT => {
                self.check_end()?;
                let text = self.last_error.as_ref().map_or_else(|| "(C) Brandy".to_string(), |e| e.message());
                self.screen.write_str(&text)?;
            }
            TOKEN_OSCLI => {
                let command = self.eval_string()?;
                self.check_end()?;
                self.oscli(&command)?;
            }
            TOKEN_WIDTH => {
                let width = self.eval_i32()?;
                self.check_end()?;
                self.width = width.max(0) as usize;
            }
            TOKEN_CALL => return Err(ErrorKind::BadCall.into()),
            TOKEN_PTR_STMT => {
                let handle = self.channel()?;
                self.expect(b'=', ErrorKind::EqMiss)?;
                let position = self.eval_i64()?;
                self.check_end()?;
                self.files.set_ptr(handle, position.max(0) as u64)?;
            }
            TOKEN_EXT => {
                let handle = self.channel()?;
                self.expect(b'=', ErrorKind::EqMiss)?;
                let len = self.eval_i64()?;
                self.check_end()?;
                self.files.set_ext(handle, len.max(0) as u64)?;
            }
            TOKEN_PAGE_STMT | TOKEN_LOMEM_STMT | TOKEN_HIMEM_STMT | TOKEN_TIME_STMT => {
                self.pseudo_assignment(token)?
            }
            TOKEN_MIDS | TOKEN_LEFTS | TOKEN_RIGHTS => self.substring_assignment(token)?,
            TOKEN_MODE => self.mode_statement()?,
            TOKEN_CLS => {
                self.check_end()?;
                self.screen.write(&[12])?;
            }
            TOKEN_CLG => {
                self.check_end()?;
                self.screen.write(&[16])?;
            }
            TOKEN_COLOUR => self.colour_statement()?,
            TOKEN_GCOL => self.gcol_statement()?,
            TOKEN_MOVE => self.move_statement()?,
            TOKEN_DRAW => self.draw_statement()?,
            TOKEN_PLOT => self.plot_statement()?,
            TOKEN_VDU => self.vdu_statement()?,
            TOKEN_OFF => {
                self.check_end()?;
                self.screen.write(&[23, 1, 0, 0, 0, 0, 0, 0, 0, 0])?;
            }
            TOKEN_SOUND => self.sound_statement()?,
            TOKEN_ENVELOPE => self.envelope_statement()?,
            TOKEN_RUN => self.run_statement()?,
            TOKEN_CHAIN => self.chain_statement()?,
            _ => return Err(ErrorKind::Syntax.into()),
        }
        Ok(None)
    }

    fn extended_statement(&mut self, prefix: u8, token: u8) -> Result<Option<Value>> {
        if prefix == TOKEN_XCOMMAND {
            return self.command(token).map(|_| None);
        }
        match token {
            XSTMT_CASE => self.case_statement()?,
            XSTMT_WHILE => self.while_statement()?,
            XSTMT_EXIT => self.exit_statement()?,
            XSTMT_PRIVATE => self.private_statement()?,
            XSTMT_SWAP => self.swap_statement()?,
            XSTMT_QUIT => {
                let code = if self.at_statement_end() { 0 } else { self.eval_i32()? };
                self.quit = Some(code);
                return Err(ErrorKind::Exit.into());
            }
            XSTMT_SYS => self.sys_statement()?,
            XSTMT_INSTALL | XSTMT_LIBRARY => {
                loop {
                    let name = String::from_utf8_lossy(&self.eval_string()?).into_owned();
                    self.load_library(&name, token == XSTMT_INSTALL)?;
                    if !self.accept(b',') {
                        break;
                    }
                }
                self.check_end()?;
            }
            XSTMT_OVERLAY => return Err(ErrorKind::Unsupported.into()),
            XSTMT_CIRCLE => self.circle_statement()?,
            XSTMT_ELLIPSE => self.ellipse_statement()?,
            XSTMT_RECTANGLE => self.rectangle_statement()?,
            XSTMT_FILL => self.fill_statement()?,
            XSTMT_ORIGIN => self.origin_statement()?,
            XSTMT_POINT => self.point_statement()?,
            XSTMT_TINT => self.tint_statement()?,
            XSTMT_WAIT => self.wait_statement()?,
            XSTMT_MOUSE => self.mouse_statement()?,
            XSTMT_BEATS | XSTMT_TEMPO | XSTMT_VOICES | XSTMT_VOICE | XSTMT_STEREO => self.music_statement(token)?,
            _ => return Err(ErrorKind::Syntax.into()),
        }
        Ok(None)
    }

    /// A line number after `GOTO`, `GOSUB`, `RESTORE` and the like: either
    /// an embedded reference or an expression
    pub(crate) fn line_operand(&mut self) -> Result<u16> {
        if self.skip_spaces() == TOKEN_LINENUM {
            let bytes = [self.byte_at(self.pc + 1), self.byte_at(self.pc + 2), self.byte_at(self.pc + 3)];
            self.pc += 4;
            return Ok(decode_line_number(&bytes));
        }
        let n = self.eval_i64()?;
        u16::try_from(n)
            .ok()
            .filter(|&n| n as u32 <= MAX_LINENO)
            .ok_or_else(|| BasicError::new(ErrorKind::LineNo))
    }

    /// `=`, or one of the compound assignment operators
    fn assign_operator(&mut self) -> Result<Option<Op>> {
        let op = match self.skip_spaces() {
            b'=' => {
                self.pc += 1;
                return Ok(None);
            }
            b'+' => Op::Add,
            b'-' => Op::Sub,
            b'*' => Op::Mul,
            b'/' => Op::Div,
            TOKEN_AND => Op::And,
            TOKEN_OR => Op::Or,
            TOKEN_EOR => Op::Eor,
            TOKEN_DIV => Op::IntDiv,
            TOKEN_MOD => Op::Mod,
            _ => return Err(ErrorKind::EqMiss.into()),
        };
        if self.byte_at(self.pc + 1) != b'=' {
            return Err(ErrorKind::EqMiss.into());
        }
        self.pc += 2;
        Ok(Some(op))
    }

    /// `target = expr` and `target += expr` and so on
    pub(crate) fn assignment(&mut self) -> Result<()> {
        let target = self.lvalue()?;
        let value = match self.assign_operator()? {
            None => self.expression()?,
            Some(op) => {
                let current = self.read_lvalue(&target)?;
                let rhs = self.expression()?;
                apply(op, current, rhs, self.maths())?
            }
        };
        self.assign_lvalue(&target, value)?;
        self.check_end()
    }

    fn pseudo_assignment(&mut self, token: u8) -> Result<()> {
        if token == TOKEN_TIME_STMT && self.current() == b'$' {
            // The host clock cannot be set
            self.pc += 1;
            self.expect(b'=', ErrorKind::EqMiss)?;
            self.eval_string()?;
            return self.check_end();
        }
        self.expect(b'=', ErrorKind::EqMiss)?;
        let value = self.expression()?;
        self.check_end()?;
        match token {
            TOKEN_TIME_STMT => self.video.set_time(value.to_i64()?),
            TOKEN_PAGE_STMT => {
                self.mem.set_page(address(&value)?)?;
                self.program.rebuild(&self.mem)?;
                self.program_changed();
            }
            TOKEN_LOMEM_STMT => {
                self.mem.set_lomem(address(&value)?)?;
                self.vars.clear();
            }
            _ => self.mem.set_himem(address(&value)?)?,
        }
        Ok(())
    }

    /// `MID$(s$, n[, len]) = x$`, `LEFT$(s$[, n]) = x$`, `RIGHT$(s$[, n]) = x$`
    fn substring_assignment(&mut self, token: u8) -> Result<()> {
        let target = self.lvalue()?;
        if !target.is_string() {
            return Err(ErrorKind::TypeStr.into());
        }
        let mut start = None;
        let mut count = None;
        if token == TOKEN_MIDS {
            self.expect(b',', ErrorKind::CoMiss)?;
            start = Some(self.eval_i64()?);
        }
        if self.accept(b',') {
            count = Some(self.eval_i64()?);
        }
        self.expect(b')', ErrorKind::RpMiss)?;
        self.expect(b'=', ErrorKind::EqMiss)?;
        let replacement = self.eval_string()?;
        self.check_end()?;
        let mut text = self.read_lvalue(&target)?.into_string()?;
        let new = splice(&mut text, token, start, count, &replacement);
        if new {
            self.assign_lvalue(&target, Value::Str(text))?;
        }
        Ok(())
    }

    fn dim_statement(&mut self) -> Result<()> {
        loop {
            self.skip_spaces();
            let name = self.read_name().ok_or_else(|| BasicError::new(ErrorKind::Syntax))?;
            if self.current() == b'(' {
                self.pc += 1;
                let key = format!("{}(", name);
                let mut dims = Vec::new();
                loop {
                    let bound = self.eval_i64()?;
                    if bound < -1 {
                        return Err(ErrorKind::NegDim.into());
                    }
                    dims.push((bound + 1) as usize);
                    if !self.accept(b',') {
                        break;
                    }
                }
                self.expect(b')', ErrorKind::RpMiss)?;
                if dims.len() > MAX_DIMS {
                    return Err(ErrorKind::DimCount.into());
                }
                let array = self.vars.dim_array(&key, dims)?;
                let size = array.borrow().storage_size();
                if self.mem.allocate(size).is_err() {
                    self.vars.take(&key);
                    return Err(BasicError::new(ErrorKind::BadDim).with_str(name));
                }
                debug!(array = %key, size, "array created");
            } else {
                let size = self.eval_i64()?;
                if size < -1 {
                    return Err(ErrorKind::NegDim.into());
                }
                let addr = if size == -1 {
                    self.mem.vartop()
                } else {
                    self.mem
                        .allocate(size as usize + 1)
                        .map_err(|_| BasicError::new(ErrorKind::BadByteDim).with_str(name.clone()))?
                };
                self.vars.assign(&name, Value::Int(addr as u32 as i32))?;
            }
            if !self.accept(b',') {
                break;
            }
        }
        self.check_end()
    }

    /// A variable or `name()` array in a `LOCAL` or `PRIVATE` list
    fn local_name(&mut self) -> Result<String> {
        self.skip_spaces();
        let name = self.read_name().ok_or_else(|| BasicError::new(ErrorKind::Syntax))?;
        if self.current() == b'(' {
            self.pc += 1;
            self.expect(b')', ErrorKind::RpMiss)?;
            return Ok(format!("{}(", name));
        }
        Ok(name)
    }

    fn local_statement(&mut self) -> Result<()> {
        if self.accept(TOKEN_ERROR) {
            self.stack.push(Frame::Error(self.handler.clone()), &mut self.mem)?;
            return self.check_end();
        }
        if self.accept(TOKEN_DATA) {
            self.stack.push(Frame::Data(self.data), &mut self.mem)?;
            self.pc = self.line_end(self.pc);
            return Ok(());
        }
        if self.stack.innermost_call().is_none() {
            return Err(ErrorKind::LocalMiss.into());
        }
        loop {
            let name = self.local_name()?;
            let saved = self.save_variable(&name);
            self.stack.push(Frame::Local { name: name.clone(), saved }, &mut self.mem)?;
            if name.ends_with('(') {
                self.vars.take(&name);
            } else {
                self.vars.assign(&name, Variable::zero(VarType::of_name(&name)).value())?;
            }
            if !self.accept(b',') {
                break;
            }
        }
        self.check_end()
    }

    /// `PRIVATE`: variables that keep their values between calls of the
    /// procedure that declares them
    fn private_statement(&mut self) -> Result<()> {
        let owner = match self.stack.innermost_call() {
            Some(call) => call.name.clone(),
            None => return Err(ErrorKind::PrivateMiss.into()),
        };
        loop {
            let name = self.local_name()?;
            if static_index(&name).is_some() {
                return Err(ErrorKind::Syntax.into());
            }
            let saved = self.save_variable(&name);
            self.stack.push(
                Frame::Private { owner: owner.clone(), name: name.clone(), saved },
                &mut self.mem,
            )?;
            let kept = self.privates.get_mut(&owner).and_then(|vars| vars.remove(&name));
            match kept {
                Some(variable) => self.vars.bind(&name, variable),
                None if name.ends_with('(') => {
                    self.vars.take(&name);
                }
                None => self.vars.bind(&name, Variable::zero(VarType::of_name(&name))),
            }
            if !self.accept(b',') {
                break;
            }
        }
        self.check_end()
    }

    fn swap_statement(&mut self) -> Result<()> {
        let a = self.lvalue()?;
        self.expect(b',', ErrorKind::CoMiss)?;
        let b = self.lvalue()?;
        self.check_end()?;
        if let (LValue::Array(x), LValue::Array(y)) = (&a, &b) {
            if VarType::of_name(x) != VarType::of_name(y) {
                return Err(ErrorKind::NoSwap.into());
            }
            self.vars.array(x)?;
            self.vars.array(y)?;
            let first = self.vars.take(x);
            let second = self.vars.take(y);
            self.vars.restore(x, second);
            self.vars.restore(y, first);
            return Ok(());
        }
        if lvalue_type(&a) != lvalue_type(&b) || lvalue_type(&a).is_none() {
            return Err(ErrorKind::NoSwap.into());
        }
        let first = self.read_lvalue(&a)?;
        let second = self.read_lvalue(&b)?;
        self.assign_lvalue(&a, second)?;
        self.assign_lvalue(&b, first)
    }

    fn trace_statement(&mut self) -> Result<()> {
        match self.skip_spaces() {
            TOKEN_OFF => {
                self.pc += 1;
                self.trace.lines = false;
                self.trace.procs = false;
                self.trace.step = false;
            }
            TOKEN_ON => {
                self.pc += 1;
                self.trace.lines = true;
                self.trace.limit = MAX_LINENO as u16;
            }
            TOKEN_PROC | TOKEN_ENDPROC => {
                self.pc += 1;
                self.trace.procs = !self.accept(TOKEN_OFF);
            }
            TOKEN_STEP => {
                self.pc += 1;
                self.trace.step = !self.accept(TOKEN_OFF);
            }
            _ if self.accept_word(b"BACK") => self.trace.back = !self.accept(TOKEN_OFF),
            _ => {
                self.trace.limit = self.line_operand()?;
                self.trace.lines = true;
            }
        }
        self.check_end()
    }

    /// `ERROR [EXT] n, message`
    fn error_statement(&mut self) -> Result<()> {
        let external = self.accept(TOKEN_EXT);
        let number = self.eval_i32()?;
        self.expect(b',', ErrorKind::CoMiss)?;
        let message = self.eval_string()?;
        self.check_end()?;
        let text = String::from_utf8_lossy(&message).into_owned();
        if external {
            let mut err = BasicError::new(ErrorKind::UserExt).with_str(text);
            err.number = Some(number);
            return Err(err);
        }
        Err(BasicError::user(number, text))
    }

    /// `SYS service [, in...] [TO out [, out...] [; flags]]`
    fn sys_statement(&mut self) -> Result<()> {
        let service = self.expression()?;
        let mut inputs = Vec::new();
        while self.accept(b',') {
            if matches!(self.skip_spaces(), b',' | TOKEN_TO) || self.at_statement_end() {
                inputs.push(Value::Int(0));
            } else {
                inputs.push(self.expression()?);
            }
        }
        let mut outputs = Vec::new();
        let mut flags = None;
        if self.accept(TOKEN_TO) {
            loop {
                if matches!(self.skip_spaces(), b',' | b';') || self.at_statement_end() {
                    outputs.push(None);
                } else {
                    outputs.push(Some(self.lvalue()?));
                }
                if !self.accept(b',') {
                    break;
                }
            }
            if self.accept(b';') {
                flags = Some(self.lvalue()?);
            }
        }
        self.check_end()?;
        let (results, flag_bits) = self.sys(&service, inputs)?;
        for (target, value) in outputs.iter().zip(results) {
            if let Some(target) = target {
                let value = match (target.is_string(), value) {
                    (true, Value::Str(s)) => Value::Str(s),
                    (true, other) => Value::Str(other.to_i64()?.to_string().into_bytes()),
                    (false, Value::Str(_)) => Value::Int(0),
                    (false, other) => other,
                };
                self.assign_lvalue(target, value)?;
            }
        }
        if let Some(target) = flags {
            self.assign_lvalue(&target, Value::Int(flag_bits))?;
        }
        Ok(())
    }
}

/// Type held by an assignment target, for `SWAP`
fn lvalue_type(target: &LValue) -> Option<VarType> {
    Some(match target {
        LValue::Variable(name) => VarType::of_name(name),
        LValue::Element(array, _) => array.borrow().var_type(),
        LValue::Array(_) => return None,
        LValue::Byte(_) => VarType::Byte,
        LValue::Word(_) => VarType::Integer,
        LValue::Word64(_) => VarType::Integer64,
        LValue::Float(_) => VarType::Real,
        LValue::Str(_) => VarType::String,
    })
}

/// Overwrite part of `text` in place for the `MID$`/`LEFT$`/`RIGHT$`
/// assignment forms. The string never changes length. Returns false when
/// nothing changes.
fn splice(text: &mut Vec<u8>, token: u8, start: Option<i64>, count: Option<i64>, replacement: &[u8]) -> bool {
    let len = text.len();
    let limit = count.map_or(usize::MAX, |c| c.clamp(0, MAXSTRING as i64) as usize);
    let n = replacement.len().min(limit);
    match token {
        TOKEN_MIDS => {
            let from = (start.unwrap_or(1).max(1) - 1) as usize;
            if from >= len {
                return false;
            }
            let n = n.min(len - from);
            text[from..from + n].copy_from_slice(&replacement[..n]);
        }
        TOKEN_LEFTS => {
            let n = n.min(len);
            text[..n].copy_from_slice(&replacement[..n]);
        }
        _ => {
            let n = n.min(len);
            text[len - n..].copy_from_slice(&replacement[..n]);
        }
    }
    n > 0
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

    #[test]
    fn test_splice() {
        let mut s = b"HELLO".to_vec();
        assert!(splice(&mut s, TOKEN_MIDS, Some(2), None, b"ipp"));
        assert_eq!(s, b"HippO");
        let mut s = b"HELLO".to_vec();
        splice(&mut s, TOKEN_LEFTS, None, Some(1), b"JX");
        assert_eq!(s, b"JELLO");
        let mut s = b"HELLO".to_vec();
        splice(&mut s, TOKEN_RIGHTS, None, None, b"P!");
        assert_eq!(s, b"HELP!");
        let mut s = b"AB".to_vec();
        assert!(!splice(&mut s, TOKEN_MIDS, Some(5), None, b"X"));
    }

    #[test]
    fn test_compound_assignment() {
        let mut i = interp();
        let out = run(&mut i, &["A%=5:A%+=3:A%*=2:A%DIV=3:PRINT A%", "S$=\"AB\":S$+=\"CD\":PRINT S$"]);
        assert_eq!(out, "         5\r\nABCD\r\n");
    }

    #[test]
    fn test_compound_assignment_needs_variable() {
        let mut i = interp();
        let out = run(&mut i, &["Q+=1"]);
        assert_eq!(out, "Unknown variable 'Q'\r\n");
    }

    #[test]
    fn test_dim_and_zero_length_array() {
        let mut i = interp();
        assert_eq!(run(&mut i, &["DIM A(3),B$(1,2):A(3)=7:B$(1,2)=\"Z\":PRINT A(3);B$(1,2)"]), "         7Z\r\n");
        let out = run(&mut i, &["DIM E(-1):PRINT E(0)"]);
        assert!(out.starts_with("Array index value 0 is out of range"));
        assert!(run(&mut i, &["DIM A(2)"]).contains("has already been created"));
    }

    #[test]
    fn test_dim_byte_block() {
        let mut i = interp();
        let out = run(&mut i, &["DIM P% 7:!P%=&12345678:P%?4=9:PRINT ~P%?1;\" \";P%?4"]);
        assert_eq!(out, "        56 9\r\n");
    }

    #[test]
    fn test_substring_assignment() {
        let mut i = interp();
        assert_eq!(run(&mut i, &["A$=\"HELLO\":MID$(A$,2,3)=\"ipppp\":PRINT A$"]), "HippO\r\n");
    }

    #[test]
    fn test_swap() {
        let mut i = interp();
        assert_eq!(run(&mut i, &["A=1:B=2:SWAP A,B:PRINT A;B"]), "         21\r\n");
        assert_eq!(run(&mut i, &["A=1:B$=\"X\":SWAP A,B$"]), "Variables in SWAP must be of the same type\r\n");
        assert_eq!(run(&mut i, &["DIM X(1),Y(2):SWAP X(),Y():PRINT DIM(X(),1)"]), "         2\r\n");
    }

    #[test]
    fn test_user_error_and_report() {
        let mut i = interp();
        assert_eq!(run(&mut i, &["ERROR 100, \"Custom\""]), "Custom\r\n");
        assert_eq!(run(&mut i, &["PRINT ERR:REPORT"]), "       100\r\nCustom\r\n");
    }

    #[test]
    fn test_local_outside_procedure() {
        let mut i = interp();
        assert!(run(&mut i, &["LOCAL X"]).starts_with("LOCAL found outside"));
    }

    #[test]
    fn test_clear_keeps_static_integers() {
        let mut i = interp();
        assert_eq!(run(&mut i, &["A%=3:B=4:CLEAR:PRINT A%"]), "         3\r\n");
        assert!(run(&mut i, &["PRINT B"]).starts_with("Unknown variable 'B'"));
    }

    #[test]
    fn test_quit_sets_exit_code() {
        let mut i = interp();
        run(&mut i, &["QUIT 3"]);
        assert_eq!(i.quit_code(), Some(3));
    }
}
