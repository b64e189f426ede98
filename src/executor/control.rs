//! Control flow: IF, loops, CASE, GOTO/GOSUB, ON and procedure calls

use tracing::trace;

use super::Interpreter;
use crate::error::{BasicError, ErrorKind, Result};
use crate::evaluator::{apply, LValue, Op};
use crate::program::LINE_HEADER;
use crate::stack::{CallFrame, CallKind, ErrorHandler, ForFrame, Frame, Position};
use crate::tokenizer::*;
use crate::variables::{VarType, Value, Variable};

/// A token, with the second byte of an extended token
type Token = (u8, u8);

const FOR: Token = (TOKEN_FOR, 0);
const NEXT: Token = (TOKEN_NEXT, 0);
const REPEAT: Token = (TOKEN_REPEAT, 0);
const UNTIL: Token = (TOKEN_UNTIL, 0);
const WHILE: Token = (TOKEN_XSTATEMENT, XSTMT_WHILE);
const ENDWHILE: Token = (TOKEN_ENDWHILE, 0);
const CASE: Token = (TOKEN_XSTATEMENT, XSTMT_CASE);
const ENDCASE: Token = (TOKEN_ENDCASE, 0);

/// A formal parameter of a `DEF PROC` or `DEF FN`
#[derive(Debug, Clone, PartialEq)]
struct Formal {
    name: String,
    by_reference: bool,
}

/// Whether a loop that has reached `value` is finished
fn loop_finished(value: &Value, limit: &Value, step: &Value) -> Result<bool> {
    let op = if step.to_f64()? > 0.0 { Op::Gt } else { Op::Lt };
    apply(op, value.clone(), limit.clone(), Default::default())?.is_true()
}

impl Interpreter {
    pub(crate) fn here(&self) -> Position {
        Position { pc: self.pc, line: self.line }
    }

    pub(crate) fn jump(&mut self, to: Position) {
        self.pc = to.pc;
        self.line = to.line;
    }

    fn token_at(&self, pos: usize) -> Token {
        match self.byte_at(pos) {
            b @ (TOKEN_XFUNCTION | TOKEN_XCOMMAND | TOKEN_XSTATEMENT) => (b, self.byte_at(pos + 1)),
            b => (b, 0),
        }
    }

    /// Step from anywhere on a line to the first token of the next one,
    /// without tracing. False when there are no more lines.
    pub(crate) fn advance_line(&mut self) -> bool {
        if self.in_scratch() {
            return false;
        }
        let header = self.line_end(self.pc) + 1;
        if self.code_word(header) == 0 {
            return false;
        }
        self.line = Some(self.code_word(header + 2));
        self.pc = header + LINE_HEADER;
        true
    }

    /// Move `pc` past the `close` matching an `open` that has already been
    /// passed, looking through following lines as needed
    fn skip_past(&mut self, open: Token, close: Token, missing: ErrorKind) -> Result<()> {
        let mut depth = 0usize;
        loop {
            let token = self.token_at(self.pc);
            if token.0 == LINE_END {
                if !self.advance_line() {
                    return Err(missing.into());
                }
                continue;
            }
            let mut next = self.token_after(self.pc);
            if token == (TOKEN_XSTATEMENT, XSTMT_EXIT) {
                // The loop keyword after EXIT opens nothing
                while self.byte_at(next) == b' ' {
                    next += 1;
                }
                next = self.token_after(next);
            }
            if token == close {
                if depth == 0 {
                    self.pc = next;
                    return Ok(());
                }
                depth -= 1;
            } else if token == open {
                depth += 1;
            }
            self.pc = next;
        }
    }

    /// Whether only spaces remain on the line from `pos`
    fn rest_is_blank(&self, mut pos: usize) -> bool {
        while self.byte_at(pos) == b' ' {
            pos += 1;
        }
        self.byte_at(pos) == LINE_END
    }

    // IF

    pub(crate) fn if_statement(&mut self) -> Result<()> {
        let condition = self.expression()?.is_true()?;
        let then = self.accept(TOKEN_THEN);
        if then && self.rest_is_blank(self.pc) {
            return if condition { Ok(()) } else { self.skip_block_if(true) };
        }
        if !condition {
            loop {
                match self.byte_at(self.pc) {
                    LINE_END => return Ok(()),
                    TOKEN_ELSE => {
                        self.pc += 1;
                        break;
                    }
                    _ => self.pc = self.token_after(self.pc),
                }
            }
        }
        if self.skip_spaces() == TOKEN_LINENUM {
            let line = self.line_operand()?;
            return self.goto_line(line);
        }
        Ok(())
    }

    /// Skip the rest of a block `IF`. Stops after a line-start `ELSE` at the
    /// same level when `stop_at_else` is set, otherwise after the `ENDIF`.
    pub(crate) fn skip_block_if(&mut self, stop_at_else: bool) -> Result<()> {
        let mut depth = 0usize;
        let mut else_line = false;
        loop {
            match self.byte_at(self.pc) {
                LINE_END => {
                    if !self.advance_line() {
                        return Err(ErrorKind::EndifMiss.into());
                    }
                    else_line = false;
                }
                TOKEN_THEN => {
                    self.pc += 1;
                    // ELSE IF ... THEN can continue the same block
                    if self.rest_is_blank(self.pc) && !(else_line && self.config.cascaded_if_tweak) {
                        depth += 1;
                    }
                }
                TOKEN_XELSE => {
                    self.pc += 1;
                    if depth == 0 && stop_at_else {
                        return Ok(());
                    }
                    else_line = true;
                }
                TOKEN_ENDIF => {
                    self.pc += 1;
                    if depth == 0 {
                        return Ok(());
                    }
                    depth -= 1;
                }
                _ => self.pc = self.token_after(self.pc),
            }
        }
    }

    // FOR and NEXT

    pub(crate) fn for_statement(&mut self) -> Result<()> {
        self.skip_spaces();
        let var = match self.lvalue()? {
            LValue::Variable(name) => name,
            _ => return Err(ErrorKind::ForVar.into()),
        };
        if VarType::of_name(&var) == VarType::String {
            return Err(ErrorKind::ForVar.into());
        }
        self.expect(b'=', ErrorKind::EqMiss)?;
        let start = self.expression()?;
        self.expect(TOKEN_TO, ErrorKind::ToMiss)?;
        let limit = self.expression()?;
        let step = if self.accept(TOKEN_STEP) { self.expression()? } else { Value::Int(1) };
        self.check_end()?;
        if !(start.is_numeric() && limit.is_numeric() && step.is_numeric()) {
            return Err(ErrorKind::TypeNum.into());
        }
        if step.to_f64()? == 0.0 {
            return Err(ErrorKind::ForStep.into());
        }
        self.vars.assign(&var, start)?;
        if let Some(index) = self.stack.find(true, |f| matches!(f, Frame::For(l) if l.var == var)) {
            self.unwind_to(index);
        }
        if loop_finished(&self.vars.get_value(&var)?, &limit, &step)? {
            trace!(var = %var, "FOR loop skipped");
            self.skip_past(FOR, NEXT, ErrorKind::NextMiss)?;
            return self.after_skipped_next();
        }
        let body = self.here();
        self.stack.push(Frame::For(ForFrame { var, limit, step, body }), &mut self.mem)
    }

    /// Continue after the `NEXT` of a loop that was not entered: `NEXT I,J`
    /// still steps the outer loop
    fn after_skipped_next(&mut self) -> Result<()> {
        self.skip_spaces();
        self.read_name();
        if self.accept(b',') {
            return self.next_statement();
        }
        self.skip_statement();
        Ok(())
    }

    pub(crate) fn next_statement(&mut self) -> Result<()> {
        loop {
            let name = if self.at_statement_end() {
                None
            } else {
                Some(self.read_name().ok_or_else(|| BasicError::new(ErrorKind::Syntax))?)
            };
            let index = self
                .stack
                .find(true, |f| match (f, &name) {
                    (Frame::For(l), Some(n)) => &l.var == n,
                    (Frame::For(_), None) => true,
                    _ => false,
                })
                .ok_or_else(|| BasicError::new(ErrorKind::NotFor))?;
            if index + 1 < self.stack.len() {
                let inner_for = (index + 1..self.stack.len()).any(|i| matches!(self.stack.get(i), Some(Frame::For(_))));
                if inner_for {
                    self.warn(&BasicError::new(ErrorKind::WarnMultiNext))?;
                }
                self.unwind_to(index + 1);
            }
            let frame = match self.stack.get(index) {
                Some(Frame::For(frame)) => frame.clone(),
                _ => return Err(ErrorKind::NotFor.into()),
            };
            let value = apply(Op::Add, self.vars.get_value(&frame.var)?, frame.step.clone(), self.maths())?;
            self.vars.assign(&frame.var, value)?;
            if !loop_finished(&self.vars.get_value(&frame.var)?, &frame.limit, &frame.step)? {
                self.jump(frame.body);
                return Ok(());
            }
            self.stack.pop(&mut self.mem);
            if !self.accept(b',') {
                return self.check_end();
            }
        }
    }

    // REPEAT, WHILE

    pub(crate) fn repeat_statement(&mut self) -> Result<()> {
        let body = self.here();
        self.stack.push(Frame::Repeat { body }, &mut self.mem)
    }

    pub(crate) fn until_statement(&mut self) -> Result<()> {
        let done = self.expression()?.is_true()?;
        self.check_end()?;
        let index = self
            .stack
            .find(true, |f| matches!(f, Frame::Repeat { .. }))
            .ok_or_else(|| BasicError::new(ErrorKind::NoRepeat))?;
        self.unwind_to(index + 1);
        if done {
            self.stack.pop(&mut self.mem);
        } else if let Some(Frame::Repeat { body }) = self.stack.top() {
            let body = *body;
            self.jump(body);
        }
        Ok(())
    }

    pub(crate) fn while_statement(&mut self) -> Result<()> {
        let condition = self.here();
        if self.expression()?.is_true()? {
            self.check_end()?;
            return self.stack.push(Frame::While { condition }, &mut self.mem);
        }
        self.skip_past(WHILE, ENDWHILE, ErrorKind::EndwhileMiss)
    }

    pub(crate) fn endwhile_statement(&mut self) -> Result<()> {
        self.check_end()?;
        let after = self.here();
        let index = self
            .stack
            .find(true, |f| matches!(f, Frame::While { .. }))
            .ok_or_else(|| BasicError::new(ErrorKind::NoWhile))?;
        self.unwind_to(index + 1);
        let condition = match self.stack.top() {
            Some(Frame::While { condition }) => *condition,
            _ => return Err(ErrorKind::NoWhile.into()),
        };
        self.jump(condition);
        if self.expression()?.is_true()? {
            return self.check_end();
        }
        self.stack.pop(&mut self.mem);
        self.jump(after);
        Ok(())
    }

    /// `EXIT FOR [var]`, `EXIT REPEAT`, `EXIT WHILE`
    pub(crate) fn exit_statement(&mut self) -> Result<()> {
        let (open, close, missing) = if self.accept(TOKEN_FOR) {
            (FOR, NEXT, ErrorKind::NextMiss)
        } else if self.accept(TOKEN_REPEAT) {
            (REPEAT, UNTIL, ErrorKind::UntilMiss)
        } else if self.accept_extended(TOKEN_XSTATEMENT, XSTMT_WHILE) {
            (WHILE, ENDWHILE, ErrorKind::EndwhileMiss)
        } else {
            return Err(ErrorKind::NotExit.into());
        };
        let var = if open == FOR && !self.at_statement_end() { self.read_name() } else { None };
        self.check_end()?;
        let found = self.stack.find(true, |f| match f {
            Frame::For(l) => open == FOR && var.as_ref().map_or(true, |v| &l.var == v),
            Frame::Repeat { .. } => open == REPEAT,
            Frame::While { .. } => open == WHILE,
            _ => false,
        });
        let index = found.ok_or_else(|| {
            BasicError::new(match open {
                FOR => ErrorKind::NotFor,
                REPEAT => ErrorKind::NotRepeat,
                _ => ErrorKind::NotWhile,
            })
        })?;
        let start = match self.stack.get(index) {
            Some(Frame::For(l)) => l.body,
            Some(Frame::Repeat { body }) => *body,
            Some(Frame::While { condition }) => *condition,
            _ => return Err(ErrorKind::NotExit.into()),
        };
        self.unwind_to(index);
        self.jump(start);
        self.skip_past(open, close, missing)?;
        if close == ENDWHILE {
            return Ok(());
        }
        if close == NEXT {
            self.skip_spaces();
            self.read_name();
        }
        self.skip_statement();
        Ok(())
    }

    // CASE

    pub(crate) fn case_statement(&mut self) -> Result<()> {
        let value = self.expression()?;
        self.expect(TOKEN_OF, ErrorKind::OfMiss)?;
        self.pc = self.line_end(self.pc);
        let mut depth = 0usize;
        loop {
            match self.token_at(self.pc) {
                (LINE_END, _) => {
                    if !self.advance_line() {
                        return Err(ErrorKind::EndcaseMiss.into());
                    }
                }
                CASE => {
                    depth += 1;
                    self.pc += 2;
                }
                ENDCASE => {
                    self.pc += 1;
                    if depth == 0 {
                        return Ok(());
                    }
                    depth -= 1;
                }
                (TOKEN_OTHERWISE, _) if depth == 0 => {
                    self.pc += 1;
                    return Ok(());
                }
                (TOKEN_WHEN, _) if depth == 0 => {
                    self.pc += 1;
                    if self.when_matches(&value)? {
                        return Ok(());
                    }
                }
                _ => self.pc = self.token_after(self.pc),
            }
        }
    }

    /// Compare a `WHEN` list against the `CASE` value, leaving `pc` at the
    /// end of the list on a match
    fn when_matches(&mut self, value: &Value) -> Result<bool> {
        loop {
            let candidate = self.expression()?;
            if apply(Op::Eq, value.clone(), candidate, self.maths())?.is_true()? {
                self.skip_statement();
                return Ok(true);
            }
            if !self.accept(b',') {
                return Ok(false);
            }
        }
    }

    /// Reaching `WHEN` or `OTHERWISE` ends the clause being executed
    pub(crate) fn end_of_when(&mut self) -> Result<()> {
        self.skip_past(CASE, ENDCASE, ErrorKind::EndcaseMiss)
    }

    // GOSUB, RETURN, ON

    pub(crate) fn gosub_statement(&mut self) -> Result<()> {
        let line = self.line_operand()?;
        self.check_end()?;
        let return_to = self.here();
        self.stack.push(Frame::Gosub { return_to }, &mut self.mem)?;
        self.goto_line(line)
    }

    pub(crate) fn return_statement(&mut self) -> Result<()> {
        self.check_end()?;
        let index = self
            .stack
            .find(true, |f| matches!(f, Frame::Gosub { .. }))
            .ok_or_else(|| BasicError::new(ErrorKind::Return))?;
        let return_to = match self.stack.get(index) {
            Some(Frame::Gosub { return_to }) => *return_to,
            _ => return Err(ErrorKind::Return.into()),
        };
        self.unwind_to(index);
        self.jump(return_to);
        Ok(())
    }

    pub(crate) fn on_statement(&mut self) -> Result<()> {
        if self.accept(TOKEN_ERROR) {
            return self.on_error();
        }
        if self.at_statement_end() {
            // Text cursor on
            return self.screen.write(&[23, 1, 1, 0, 0, 0, 0, 0, 0, 0]);
        }
        let selector = self.eval_i64()?;
        let action = self.skip_spaces();
        if !matches!(action, TOKEN_GOTO | TOKEN_GOSUB | TOKEN_PROC) {
            return Err(ErrorKind::OnSyntax.into());
        }
        self.pc += 1;
        let items = self.on_items();
        let end = self.pc;
        let has_else = self.byte_at(end) == TOKEN_ELSE;
        let return_to = Position { pc: if has_else { self.line_end(end) } else { end }, line: self.line };
        let chosen = usize::try_from(selector).ok().filter(|&n| n >= 1).and_then(|n| items.get(n - 1).copied());
        let Some(item) = chosen else {
            if !has_else {
                return Err(BasicError::new(ErrorKind::OnRange).with_int(selector));
            }
            self.pc = end + 1;
            if self.skip_spaces() == TOKEN_LINENUM {
                let line = self.line_operand()?;
                return self.goto_line(line);
            }
            return Ok(());
        };
        self.pc = item;
        match action {
            TOKEN_GOTO => {
                let line = self.line_operand()?;
                self.goto_line(line)
            }
            TOKEN_GOSUB => {
                let line = self.line_operand()?;
                self.stack.push(Frame::Gosub { return_to }, &mut self.mem)?;
                self.goto_line(line)
            }
            _ => {
                if item != items[0] {
                    self.expect(TOKEN_PROC, ErrorKind::OnSyntax)?;
                }
                self.call_routine(CallKind::Proc, Some(return_to))
            }
        }
    }

    /// Start addresses of the items of an `ON` list, leaving `pc` at the end
    /// of the list
    fn on_items(&mut self) -> Vec<usize> {
        let mut items = Vec::new();
        let mut pos = self.pc;
        loop {
            items.push(pos);
            let mut depth = 0i32;
            loop {
                match self.byte_at(pos) {
                    b'(' => depth += 1,
                    b')' => depth -= 1,
                    b',' if depth <= 0 => break,
                    b':' | LINE_END | TOKEN_ELSE => break,
                    _ => {}
                }
                pos = self.token_after(pos);
            }
            if self.byte_at(pos) != b',' {
                break;
            }
            pos += 1;
        }
        self.pc = pos;
        items
    }

    /// `ON ERROR [LOCAL] statements`, `ON ERROR OFF`
    fn on_error(&mut self) -> Result<()> {
        if self.accept(TOKEN_OFF) {
            self.check_end()?;
            self.handler = None;
            return Ok(());
        }
        let local = self.accept(TOKEN_LOCAL);
        if local {
            self.stack.push(Frame::Error(self.handler.clone()), &mut self.mem)?;
        }
        let depth = if local { self.stack.len() } else { self.fn_base };
        self.handler = Some(ErrorHandler { resume: self.here(), local, depth, fn_level: self.fn_level });
        self.pc = self.line_end(self.pc);
        Ok(())
    }

    // Procedures and functions

    /// Name after `PROC` or `FN`, with any type suffix
    fn routine_name(&mut self) -> Result<String> {
        let start = self.pc;
        while self.current().is_ascii_alphanumeric() || matches!(self.current(), b'_' | b'`') {
            self.pc += 1;
        }
        if self.current() == b'%' && self.byte_at(self.pc + 1) == b'%' {
            self.pc += 2;
        } else if matches!(self.current(), b'%' | b'$' | b'&') {
            self.pc += 1;
        }
        if self.pc == start {
            return Err(ErrorKind::BadVarProcName.into());
        }
        Ok((start..self.pc).map(|a| self.byte_at(a) as char).collect())
    }

    /// The formal parameter list at `pc`, if there is one
    fn formals(&mut self) -> Result<Vec<Formal>> {
        let mut formals = Vec::new();
        if !self.accept(b'(') {
            return Ok(formals);
        }
        loop {
            let by_reference = self.accept(TOKEN_RETURN);
            self.skip_spaces();
            let mut name = self.read_name().ok_or_else(|| BasicError::new(ErrorKind::Syntax))?;
            if self.current() == b'(' {
                self.pc += 1;
                self.expect(b')', ErrorKind::RpMiss)?;
                name.push('(');
            }
            formals.push(Formal { name, by_reference });
            if !self.accept(b',') {
                break;
            }
        }
        self.expect(b')', ErrorKind::RpMiss)?;
        Ok(formals)
    }

    /// Evaluate the actual parameters at `pc` against `formals`
    fn actuals(&mut self, formals: &[Formal], kind: CallKind, name: &str) -> Result<Vec<(Value, Option<LValue>)>> {
        let too_many = || {
            let kind = if kind == CallKind::Proc { ErrorKind::TooMany } else { ErrorKind::FnTooMany };
            BasicError::new(kind).with_str(name)
        };
        let not_enough = || {
            let kind = if kind == CallKind::Proc { ErrorKind::NotEnuff } else { ErrorKind::FnNotEnuff };
            BasicError::new(kind).with_str(name)
        };
        let mut values = Vec::new();
        if !self.accept(b'(') {
            return if formals.is_empty() { Ok(values) } else { Err(not_enough()) };
        }
        for (i, formal) in formals.iter().enumerate() {
            if i > 0 {
                match self.skip_spaces() {
                    b',' => self.pc += 1,
                    b')' => return Err(not_enough()),
                    _ => return Err(ErrorKind::CoMiss.into()),
                }
            }
            if formal.by_reference {
                self.skip_spaces();
                let target = self.lvalue().map_err(|_| BasicError::new(ErrorKind::BadRet))?;
                let value = match (&target, self.read_lvalue(&target)) {
                    (_, Ok(value)) => value,
                    (LValue::Variable(v), Err(e)) if e.kind == ErrorKind::VarMiss => {
                        Variable::zero(VarType::of_name(v)).value()
                    }
                    (_, Err(e)) => return Err(e),
                };
                values.push((value, Some(target)));
            } else {
                values.push((self.expression()?, None));
            }
        }
        match self.skip_spaces() {
            b')' => self.pc += 1,
            b',' => return Err(too_many()),
            _ => return Err(ErrorKind::RpMiss.into()),
        }
        if formals.is_empty() {
            return Err(too_many());
        }
        Ok(values)
    }

    /// Call the PROC or FN named at `pc`: evaluate its arguments, push the
    /// call frame and the saved parameters, and move to its body.
    /// `return_to` overrides the place execution resumes afterwards.
    fn call_routine(&mut self, kind: CallKind, return_to: Option<Position>) -> Result<()> {
        let prefix = if kind == CallKind::Proc { "PROC" } else { "FN" };
        let name = self.routine_name()?;
        let key = format!("{}{}", prefix, name);
        let (definition, library) = self.find_definition(&key)?.ok_or_else(|| {
            let missing = if kind == CallKind::Proc { ErrorKind::ProcMiss } else { ErrorKind::FnMiss };
            BasicError::new(missing).with_str(name.clone())
        })?;
        self.stack.check_depth(self.config.max_recursion)?;
        let call_site = self.pc;
        self.pc = definition;
        let formals = self.formals()?;
        let body = self.here();
        self.pc = call_site;
        let actuals = self.actuals(&formals, kind, &name)?;
        let return_to = return_to.unwrap_or_else(|| self.here());
        let returns = formals
            .iter()
            .zip(&actuals)
            .filter_map(|(formal, (_, target))| target.clone().map(|t| (formal.name.clone(), t)))
            .collect();
        let frame = CallFrame { kind, name: key.clone(), return_to, returns, library };
        self.stack.push(Frame::Call(frame), &mut self.mem)?;
        for (formal, (value, _)) in formals.iter().zip(actuals) {
            let saved = self.save_variable(&formal.name);
            self.stack.push(Frame::Local { name: formal.name.clone(), saved }, &mut self.mem)?;
            if let Some(array_name) = formal.name.strip_suffix('(') {
                let array = value.into_array()?;
                if array.borrow().var_type() != VarType::of_name(array_name) {
                    return Err(ErrorKind::TypeArray.into());
                }
                self.vars.bind(&formal.name, Variable::Array(array));
            } else {
                self.vars.assign(&formal.name, value)?;
            }
        }
        if self.trace.procs {
            self.screen.write_str(&format!("[{}]", key))?;
        }
        trace!(routine = %key, depth = self.stack.call_depth(), "call");
        self.pc = body.pc;
        self.line = self.line_of(body.pc);
        Ok(())
    }

    pub(crate) fn proc_statement(&mut self) -> Result<()> {
        self.call_routine(CallKind::Proc, None)
    }

    /// Run the FN named at `pc` to its `=`, returning the value
    pub(crate) fn call_fn(&mut self) -> Result<Value> {
        self.call_routine(CallKind::Fn, None)?;
        let (level, base) = (self.fn_level, self.fn_base);
        self.fn_level += 1;
        self.fn_base = self.stack.len();
        let result = self.run_loop();
        self.fn_level = level;
        self.fn_base = base;
        match result? {
            Some(value) => Ok(value),
            None => Err(ErrorKind::EndRun.into()),
        }
    }

    /// `=expr` at the end of a function
    pub(crate) fn fn_return(&mut self) -> Result<Value> {
        let value = self.expression()?;
        let index = match self.stack.find(false, |f| matches!(f, Frame::Call(_))) {
            Some(i) if self.fn_level > 0 => i,
            _ => return Err(ErrorKind::FnReturn.into()),
        };
        if !matches!(self.stack.get(index), Some(Frame::Call(CallFrame { kind: CallKind::Fn, .. }))) {
            return Err(ErrorKind::FnReturn.into());
        }
        self.leave_call(index)?;
        Ok(value)
    }

    pub(crate) fn endproc(&mut self) -> Result<()> {
        let index = self
            .stack
            .find(false, |f| matches!(f, Frame::Call(_)))
            .ok_or_else(|| BasicError::new(ErrorKind::NoEndproc))?;
        if !matches!(self.stack.get(index), Some(Frame::Call(CallFrame { kind: CallKind::Proc, .. }))) {
            return Err(ErrorKind::NoEndproc.into());
        }
        self.leave_call(index)
    }

    /// Pop the call at `index`, copying `RETURN` parameters back to the
    /// caller's variables, and go back to the caller
    fn leave_call(&mut self, index: usize) -> Result<()> {
        let call = match self.stack.get(index) {
            Some(Frame::Call(call)) => call.clone(),
            _ => return Err(ErrorKind::NoEndproc.into()),
        };
        let results = call
            .returns
            .iter()
            .map(|(formal, target)| Ok((target.clone(), self.vars.get_value(formal)?)))
            .collect::<Result<Vec<_>>>()?;
        self.unwind_to(index);
        for (target, value) in results {
            self.assign_lvalue(&target, value)?;
        }
        if self.trace.procs {
            self.screen.write_str(&format!("[end {}]", call.name))?;
        }
        self.jump(call.return_to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn run_program(lines: &[&str]) -> (Interpreter, String) {
        let mut interp = Interpreter::headless(Config::new()).unwrap();
        for line in lines {
            let _ = interp.execute_line(line.as_bytes());
        }
        let _ = interp.execute_line(b"RUN");
        let out = interp.output();
        (interp, out)
    }

    #[test]
    fn test_loop_finished() {
        assert!(loop_finished(&Value::Int(4), &Value::Int(3), &Value::Int(1)).unwrap());
        assert!(!loop_finished(&Value::Int(3), &Value::Int(3), &Value::Int(1)).unwrap());
        assert!(loop_finished(&Value::Float(-0.5), &Value::Int(0), &Value::Float(-0.5)).unwrap());
    }

    #[test]
    fn test_for_zero_trip() {
        let (_, out) = run_program(&["10 FOR I=1 TO 0:PRINT \"X\";:NEXT", "20 FOR I=1 TO 0 STEP -1:PRINT \"Y\";:NEXT", "30 PRINT"]);
        assert_eq!(out, "YY\r\n");
    }

    #[test]
    fn test_nested_for_single_next() {
        let (_, out) = run_program(&["10 FOR I=1 TO 2:FOR J=1 TO 2", "20 PRINT ;I*10+J;\" \";", "30 NEXT J,I"]);
        assert_eq!(out, "11 12 21 22 \r\n");
    }

    #[test]
    fn test_next_without_for() {
        let (_, out) = run_program(&["10 NEXT"]);
        assert_eq!(out, "Not in a 'FOR' loop at line 10\r\n");
    }

    #[test]
    fn test_block_if_else() {
        let (_, out) = run_program(&[
            "10 A=2",
            "20 IF A=1 THEN",
            "30 PRINT \"ONE\"",
            "40 ELSE",
            "50 IF A=2 THEN PRINT \"TWO\" ELSE PRINT \"OTHER\"",
            "60 ENDIF",
            "70 PRINT \"DONE\"",
        ]);
        assert_eq!(out, "TWO\r\nDONE\r\n");
    }

    #[test]
    fn test_single_line_if_goto() {
        let (_, out) = run_program(&["10 IF 1 THEN 30", "20 PRINT \"NO\"", "30 PRINT \"YES\""]);
        assert_eq!(out, "YES\r\n");
    }

    #[test]
    fn test_repeat_while() {
        let (_, out) = run_program(&[
            "10 I%=0:REPEAT I%+=1:UNTIL I%=5:PRINT I%",
            "20 WHILE I%>0:I%-=2:ENDWHILE:PRINT I%",
            "30 WHILE FALSE:PRINT \"NEVER\":ENDWHILE:PRINT \"OK\"",
        ]);
        assert_eq!(out, "         5\r\n        -1\r\nOK\r\n");
    }

    #[test]
    fn test_exit_loops() {
        let (_, out) = run_program(&[
            "10 FOR I%=1 TO 10:IF I%=3 THEN EXIT FOR",
            "20 NEXT:PRINT I%",
            "30 REPEAT:EXIT REPEAT:UNTIL FALSE:PRINT \"R\"",
        ]);
        assert_eq!(out, "         3\r\nR\r\n");
    }

    #[test]
    fn test_case() {
        let (_, out) = run_program(&[
            "10 FOR I%=1 TO 3",
            "20 CASE I% OF",
            "30 WHEN 1: PRINT \"A\";",
            "40 WHEN 2,3",
            "50 PRINT \"B\";",
            "60 OTHERWISE PRINT \"C\";",
            "70 ENDCASE",
            "80 NEXT",
        ]);
        assert_eq!(out, "ABB\r\n");
    }

    #[test]
    fn test_gosub_return() {
        let (_, out) = run_program(&["10 GOSUB 100:PRINT \"BACK\"", "20 END", "100 PRINT \"SUB\"", "110 RETURN"]);
        assert_eq!(out, "SUB\r\nBACK\r\n");
    }

    #[test]
    fn test_on_goto_else() {
        let (_, out) = run_program(&[
            "10 ON 2 GOTO 100,200",
            "100 PRINT \"ONE\"",
            "200 ON 9 GOTO 100 ELSE PRINT \"ELSE\"",
        ]);
        assert_eq!(out, "ELSE\r\n");
    }

    #[test]
    fn test_proc_with_return_parameter() {
        let (_, out) = run_program(&[
            "10 A=1:B=5:PROCinc(A,B):PRINT ;A;\" \";B",
            "20 END",
            "30 DEF PROCinc(RETURN X,Y)",
            "40 X+=1:Y+=1",
            "50 ENDPROC",
        ]);
        assert_eq!(out, "2 5\r\n");
    }

    #[test]
    fn test_recursive_fn() {
        let (interp, out) = run_program(&["10 PRINT FNfact(5)", "20 END", "30 DEF FNfact(N%) IF N%<2 THEN =1 ELSE =N%*FNfact(N%-1)"]);
        assert_eq!(out, "       120\r\n");
        assert_eq!(interp.stack_depth(), 0);
    }

    #[test]
    fn test_local_restores() {
        let (_, out) = run_program(&["10 X=7:PROCp:PRINT X", "20 END", "30 DEF PROCp:LOCAL X:X=3:PRINT X:ENDPROC"]);
        assert_eq!(out, "         3\r\n         7\r\n");
    }

    #[test]
    fn test_parameter_count() {
        let (_, out) = run_program(&["10 PROCa(1,2)", "20 DEF PROCa(X):ENDPROC"]);
        assert_eq!(out, "Too many parameters found in call to PROCa at line 10\r\n");
    }

    #[test]
    fn test_local_error_handler() {
        let (interp, out) = run_program(&[
            "10 PROCx:PRINT \"AFTER\"",
            "20 END",
            "30 DEF PROCx:LOCAL I",
            "40 ON ERROR LOCAL PRINT \"CAUGHT\":ENDPROC",
            "50 I=1/0",
            "60 ENDPROC",
        ]);
        assert_eq!(out, "CAUGHT\r\nAFTER\r\n");
        assert_eq!(interp.stack_depth(), 0);
    }

    #[test]
    fn test_private_keeps_value() {
        let (_, out) = run_program(&[
            "10 PROCc:PROCc:PROCc",
            "20 END",
            "30 DEF PROCc:PRIVATE C:C+=1:PRINT ;C;:ENDPROC",
        ]);
        assert_eq!(out, "123\r\n");
    }

    #[test]
    fn test_trace_back_lists_callers() {
        let mut interp = Interpreter::headless(Config::new()).unwrap();
        for line in ["10 PROCa", "20 END", "30 DEF PROCa:PROCb:ENDPROC", "40 DEF PROCb:X=1/0:ENDPROC", "TRACE BACK"] {
            let _ = interp.execute_line(line.as_bytes());
        }
        interp.output();
        assert!(interp.execute_line(b"RUN").is_err());
        let out = interp.output();
        let lines: Vec<&str> = out.split("\r\n").collect();
        assert!(lines[0].starts_with("Division by zero"), "{:?}", out);
        assert_eq!(lines[1], "  in PROCb called from line 30");
        assert_eq!(lines[2], "  in PROCa called from line 10");
        assert_eq!(interp.stack_depth(), 0);
    }
}
