//! Built-in functions and pseudo-variables

use std::f64::consts::PI;

use chrono::Local;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use super::{apply, float_result, format, Op};
use crate::error::{BasicError, ErrorKind, Result};
use crate::executor::Interpreter;
use crate::tokenizer::*;
use crate::variables::{float_to_i64, VarType, Value, MAXSTRING};

/// Longest timed wait `INKEY` accepts, in centiseconds
const MAX_INKEY_WAIT: i32 = 32767;

/// Value `INKEY(-256)` returns to identify the host
pub(crate) fn host_id() -> i32 {
    if cfg!(target_os = "windows") {
        b'W' as i32
    } else if cfg!(target_os = "macos") {
        b'M' as i32
    } else {
        b'L' as i32
    }
}

fn numeric_result(value: f64, error: ErrorKind) -> Result<Value> {
    if value.is_finite() {
        Ok(Value::Float(value))
    } else {
        Err(error.into())
    }
}

impl Interpreter {
    /// Evaluate the function or pseudo-variable whose token is at `pc`
    pub(crate) fn function(&mut self) -> Result<Value> {
        let token = self.current();
        self.pc += 1;
        match token {
            TOKEN_ABS => match self.factor()? {
                Value::Int(i) => Ok(i.checked_abs().map_or(Value::Int64((i as i64).abs()), Value::Int)),
                Value::Int64(i) => Ok(i.checked_abs().map_or(Value::Float((i as f64).abs()), Value::Int64)),
                other => Ok(Value::Float(other.to_f64()?.abs())),
            },
            TOKEN_ACS | TOKEN_ASN => {
                let x = self.factor()?.to_f64()?;
                if !(-1.0..=1.0).contains(&x) {
                    return Err(ErrorKind::AcsRange.into());
                }
                Ok(Value::Float(if token == TOKEN_ACS { x.acos() } else { x.asin() }))
            }
            TOKEN_ATN => Ok(Value::Float(self.factor()?.to_f64()?.atan())),
            TOKEN_COS => Ok(Value::Float(self.factor()?.to_f64()?.cos())),
            TOKEN_SIN => Ok(Value::Float(self.factor()?.to_f64()?.sin())),
            TOKEN_TAN => numeric_result(self.factor()?.to_f64()?.tan(), ErrorKind::Range),
            TOKEN_DEG => Ok(Value::Float(self.factor()?.to_f64()?.to_degrees())),
            TOKEN_RAD => Ok(Value::Float(self.factor()?.to_f64()?.to_radians())),
            TOKEN_EXP => numeric_result(self.factor()?.to_f64()?.exp(), ErrorKind::ExpRange),
            TOKEN_LN | TOKEN_LOG => {
                let x = self.factor()?.to_f64()?;
                if x <= 0.0 {
                    return Err(ErrorKind::LogRange.into());
                }
                Ok(Value::Float(if token == TOKEN_LN { x.ln() } else { x.log10() }))
            }
            TOKEN_SQR => {
                let x = self.factor()?.to_f64()?;
                if x < 0.0 {
                    return Err(ErrorKind::NegRoot.into());
                }
                Ok(Value::Float(x.sqrt()))
            }
            TOKEN_SGN => {
                let v = self.factor()?;
                let sign = match v {
                    Value::Int(i) => i.signum(),
                    Value::Int64(i) => i.signum() as i32,
                    other => {
                        let f = other.to_f64()?;
                        if f > 0.0 {
                            1
                        } else if f < 0.0 {
                            -1
                        } else {
                            0
                        }
                    }
                };
                Ok(Value::Int(sign))
            }
            TOKEN_INT => match self.factor()? {
                v @ (Value::Int(_) | Value::Int64(_)) => Ok(v),
                other => {
                    let f = other.to_f64()?.floor();
                    if f >= i32::MIN as f64 && f <= i32::MAX as f64 {
                        Ok(Value::Int(f as i32))
                    } else {
                        Ok(Value::Int64(float_to_i64(f)?))
                    }
                }
            },
            TOKEN_PI => Ok(Value::Float(PI)),
            TOKEN_RND => self.rnd(),
            TOKEN_ASC => {
                let s = self.factor()?.into_string()?;
                Ok(Value::Int(s.first().map_or(-1, |&b| b as i32)))
            }
            TOKEN_CHRS => {
                let code = self.factor()?.to_i32_wrapping()?;
                Ok(Value::Str(vec![code as u8]))
            }
            TOKEN_LEN => Ok(Value::Int(self.factor()?.into_string()?.len() as i32)),
            TOKEN_VAL => {
                let s = self.factor()?.into_string()?;
                Ok(format::parse_number(&s).0)
            }
            TOKEN_STRS => {
                let hex = self.skip_spaces() == b'~';
                if hex {
                    self.pc += 1;
                }
                let v = self.factor()?;
                if v.is_string() {
                    return Err(ErrorKind::TypeNum.into());
                }
                let text = if hex {
                    format::format_hex(&v, self.config.hex64)
                } else {
                    format::str_value(&v, self.vars.at_percent())
                };
                Ok(Value::Str(text.into_bytes()))
            }
            TOKEN_LEFTS | TOKEN_RIGHTS => {
                let s = self.eval_string()?;
                let count = if self.accept(b',') { Some(self.eval_i64()?) } else { None };
                self.expect(b')', ErrorKind::RpMiss)?;
                let len = s.len();
                let take = match count {
                    Some(n) if n < 0 || n as usize >= len => len,
                    Some(n) => n as usize,
                    // One argument: LEFT$ drops the last character, RIGHT$ keeps it
                    None if token == TOKEN_LEFTS => len.saturating_sub(1),
                    None => len.min(1),
                };
                Ok(Value::Str(if token == TOKEN_LEFTS { s[..take].to_vec() } else { s[len - take..].to_vec() }))
            }
            TOKEN_MIDS => {
                let s = self.eval_string()?;
                self.expect(b',', ErrorKind::CoMiss)?;
                let start = self.eval_i64()?.max(1) as usize - 1;
                let count = if self.accept(b',') { Some(self.eval_i64()?) } else { None };
                self.expect(b')', ErrorKind::RpMiss)?;
                if start >= s.len() {
                    return Ok(Value::Str(Vec::new()));
                }
                let rest = &s[start..];
                let take = match count {
                    Some(n) if n >= 0 => (n as usize).min(rest.len()),
                    _ => rest.len(),
                };
                Ok(Value::Str(rest[..take].to_vec()))
            }
            TOKEN_STRINGS => {
                let count = self.eval_i64()?;
                self.expect(b',', ErrorKind::CoMiss)?;
                let s = self.eval_string()?;
                self.expect(b')', ErrorKind::RpMiss)?;
                let count = count.max(0) as usize;
                if count.saturating_mul(s.len()) > MAXSTRING {
                    return Err(ErrorKind::StringLen.into());
                }
                Ok(Value::Str(s.repeat(count)))
            }
            TOKEN_INSTR => {
                let haystack = self.eval_string()?;
                self.expect(b',', ErrorKind::CoMiss)?;
                let needle = self.eval_string()?;
                let start = if self.accept(b',') { self.eval_i64()?.max(1) as usize } else { 1 };
                self.expect(b')', ErrorKind::RpMiss)?;
                Ok(Value::Int(instr(&haystack, &needle, start) as i32))
            }
            TOKEN_EVAL => {
                let text = self.factor()?.into_string()?;
                self.eval_text(&text)
            }
            TOKEN_GET => {
                if self.accept(b'#') {
                    let handle = self.factor()?.to_i32()?;
                    return Ok(Value::Int(self.files.bget(handle)? as i32));
                }
                Ok(Value::Int(self.wait_key()? as i32))
            }
            TOKEN_GETS => {
                if self.accept(b'#') {
                    let handle = self.factor()?.to_i32()?;
                    return Ok(Value::Str(self.files.read_line(handle)?));
                }
                Ok(Value::Str(vec![self.wait_key()?]))
            }
            TOKEN_INKEY => {
                let n = self.factor()?.to_i32()?;
                self.inkey(n)
            }
            TOKEN_INKEYS => {
                let n = self.factor()?.to_i32()?;
                match self.inkey(n)? {
                    Value::Int(k) if n >= 0 && k >= 0 => Ok(Value::Str(vec![k as u8])),
                    _ => Ok(Value::Str(Vec::new())),
                }
            }
            TOKEN_POS => Ok(Value::Int(self.screen.pos())),
            TOKEN_VPOS => Ok(Value::Int(self.screen.vpos())),
            TOKEN_COUNT => Ok(Value::Int(self.screen.count() as i32)),
            TOKEN_ERR => Ok(Value::Int(self.last_error.as_ref().map_or(0, |e| e.number()))),
            TOKEN_ERL => Ok(Value::Int(self.last_error.as_ref().and_then(|e| e.line).map_or(0, |l| l as i32))),
            TOKEN_REPORT if self.current() == b'$' => {
                self.pc += 1;
                let text = self.last_error.as_ref().map(|e| e.message()).unwrap_or_default();
                Ok(Value::Str(text.into_bytes()))
            }
            TOKEN_TIME | TOKEN_TIME_STMT => {
                if self.current() == b'$' {
                    self.pc += 1;
                    let now = Local::now().format("%a,%d %b %Y.%H:%M:%S").to_string();
                    return Ok(Value::Str(now.into_bytes()));
                }
                Ok(Value::Int(self.video.time() as i32))
            }
            TOKEN_PAGE | TOKEN_PAGE_STMT => Ok(self.pseudo_address(self.mem.page())),
            TOKEN_LOMEM | TOKEN_LOMEM_STMT => Ok(self.pseudo_address(self.mem.lomem())),
            TOKEN_HIMEM | TOKEN_HIMEM_STMT => Ok(self.pseudo_address(self.mem.himem())),
            TOKEN_TO if self.current() == b'P' => {
                self.pc += 1;
                Ok(self.pseudo_address(self.mem.top()))
            }
            TOKEN_END => Ok(self.pseudo_address(self.mem.vartop())),
            TOKEN_PTR | TOKEN_PTR_STMT => {
                let handle = self.channel()?;
                Ok(Value::Int(self.files.ptr(handle)? as i32))
            }
            TOKEN_EXT => {
                let handle = self.channel()?;
                Ok(Value::Int(self.files.ext(handle)? as i32))
            }
            TOKEN_EOF => {
                let handle = self.channel()?;
                Ok(Value::Int(if self.files.eof(handle)? { -1 } else { 0 }))
            }
            TOKEN_BGET => {
                let handle = self.channel()?;
                Ok(Value::Int(self.files.bget(handle)? as i32))
            }
            TOKEN_OPENIN | TOKEN_OPENOUT | TOKEN_OPENUP => {
                let name = String::from_utf8_lossy(&self.factor()?.into_string()?).into_owned();
                let handle = match token {
                    TOKEN_OPENIN => self.files.open_in(&name),
                    TOKEN_OPENOUT => self.files.open_out(&name),
                    _ => self.files.open_up(&name),
                };
                // OPENIN of a missing file gives 0 rather than an error
                match handle {
                    Ok(h) => Ok(Value::Int(h)),
                    Err(e) if token != TOKEN_OPENOUT && e.kind == ErrorKind::NotFound => Ok(Value::Int(0)),
                    Err(e) => Err(e),
                }
            }
            TOKEN_ADVAL => {
                let n = self.factor()?.to_i32()?;
                let now = self.video.monotonic();
                Ok(Value::Int(match n {
                    -1 => self.keyboard.buffered() as i32,
                    -8..=-5 => self.sound.free_space((-5 - n) as usize, now),
                    _ => 0,
                }))
            }
            TOKEN_POINTFN => {
                let x = self.eval_i32()?;
                self.expect(b',', ErrorKind::CoMiss)?;
                let y = self.eval_i32()?;
                self.expect(b')', ErrorKind::RpMiss)?;
                Ok(Value::Int(self.screen.point(x, y).0))
            }
            TOKEN_MODE => Ok(Value::Int(self.screen.mode().number as i32)),
            TOKEN_WIDTH => Ok(Value::Int(self.width as i32)),
            TOKEN_USR => {
                self.factor()?;
                Err(ErrorKind::BadCall.into())
            }
            TOKEN_DIM if self.current() == b'(' => {
                self.pc += 1;
                self.dim_function()
            }
            TOKEN_XFUNCTION => {
                let sub = self.current();
                self.pc += 1;
                match sub {
                    XFN_SUM => self.sum(),
                    XFN_BEAT => Ok(Value::Int(self.current_beat())),
                    _ => Err(ErrorKind::BadExpr.into()),
                }
            }
            TOKEN_XSTATEMENT => {
                let sub = self.current();
                self.pc += 1;
                match sub {
                    XSTMT_TINT if self.current() == b'(' => {
                        self.pc += 1;
                        let x = self.eval_i32()?;
                        self.expect(b',', ErrorKind::CoMiss)?;
                        let y = self.eval_i32()?;
                        self.expect(b')', ErrorKind::RpMiss)?;
                        Ok(Value::Int(self.screen.point(x, y).1))
                    }
                    XSTMT_BEATS => Ok(Value::Int(self.sound.beats)),
                    XSTMT_TEMPO => Ok(Value::Int(self.sound.tempo)),
                    _ => Err(ErrorKind::BadExpr.into()),
                }
            }
            _ => {
                self.pc -= 1;
                Err(ErrorKind::BadExpr.into())
            }
        }
    }

    /// `PAGE`, `HIMEM` and friends read as signed unless configured otherwise
    fn pseudo_address(&self, addr: usize) -> Value {
        if self.config.pseudovars_unsigned && addr > i32::MAX as usize {
            Value::Int64(addr as i64)
        } else {
            Value::Int(addr as u32 as i32)
        }
    }

    /// `#channel` after a file function
    pub(crate) fn channel(&mut self) -> Result<i32> {
        self.expect(b'#', ErrorKind::HashMiss)?;
        self.factor()?.to_i32()
    }

    fn rnd(&mut self) -> Result<Value> {
        if self.current() != b'(' {
            return Ok(Value::Int(self.rng.gen()));
        }
        self.pc += 1;
        let n = self.expression()?;
        self.expect(b')', ErrorKind::RpMiss)?;
        let n = n.to_i64()?;
        match n {
            n if n < 0 => {
                self.rng = StdRng::seed_from_u64(n as u64);
                Ok(Value::Int(n as i32))
            }
            0 => Ok(Value::Float(self.last_rnd)),
            1 => {
                self.last_rnd = self.rng.gen::<f64>();
                Ok(Value::Float(self.last_rnd))
            }
            n => Ok(Value::Int(self.rng.gen_range(1..=n.min(i32::MAX as i64)) as i32)),
        }
    }

    /// Evaluate the text of `EVAL` as an expression
    pub(crate) fn eval_text(&mut self, text: &[u8]) -> Result<Value> {
        let options = TokenizeOptions { require_line_number: false, hex64: self.config.hex64 };
        let mut code = tokenize_with(text, options)?.tokens;
        code.push(LINE_END);
        let saved = (self.pc, self.line);
        self.pc = self.push_scratch(code);
        let result = self.expression().and_then(|v| {
            if self.skip_spaces() != LINE_END {
                return Err(ErrorKind::BadExpr.into());
            }
            Ok(v)
        });
        self.pop_scratch();
        (self.pc, self.line) = saved;
        result
    }

    /// `GET`: wait for a key
    fn wait_key(&mut self) -> Result<u8> {
        self.screen.flush();
        match self.keyboard.get(None)? {
            Some(key) => Ok(key),
            None => Err(self.input_exhausted()),
        }
    }

    fn inkey(&mut self, n: i32) -> Result<Value> {
        match n {
            0.. => {
                self.screen.flush();
                let wait = n.min(MAX_INKEY_WAIT) as u32;
                Ok(Value::Int(self.keyboard.get(Some(wait))?.map_or(-1, |k| k as i32)))
            }
            -255..=-1 => {
                let down = self.keyboard.key_down((-n - 1) as u8);
                Ok(Value::Int(if down { -1 } else { 0 }))
            }
            -256 => Ok(Value::Int(host_id())),
            _ => Ok(Value::Int(0)),
        }
    }

    /// `DIM(array())` and `DIM(array(), n)`
    fn dim_function(&mut self) -> Result<Value> {
        self.skip_spaces();
        let name = self.read_name().ok_or_else(|| BasicError::new(ErrorKind::Syntax))?;
        self.expect(b'(', ErrorKind::LpMiss)?;
        self.expect(b')', ErrorKind::RpMiss)?;
        let array = self.vars.array(&format!("{}(", name))?;
        let result = if self.accept(b',') {
            let n = self.eval_i64()?;
            let dims = &array.borrow().dims;
            if n < 1 || n as usize > dims.len() {
                return Err(ErrorKind::DimRange.into());
            }
            dims[n as usize - 1] as i32 - 1
        } else {
            array.borrow().dims.len() as i32
        };
        self.expect(b')', ErrorKind::RpMiss)?;
        Ok(Value::Int(result))
    }

    /// `SUM array()` and `SUMLEN array()`
    fn sum(&mut self) -> Result<Value> {
        let length = self.skip_spaces() == TOKEN_LEN;
        if length {
            self.pc += 1;
        }
        let array = self.factor()?.into_array()?;
        let array = array.borrow();
        if length {
            if array.var_type() != VarType::String {
                return Err(ErrorKind::NotStrArray.into());
            }
            let total: usize = array
                .values()
                .iter()
                .map(|v| if let Value::Str(s) = v { s.len() } else { 0 })
                .sum();
            return Ok(Value::Int(total as i32));
        }
        let mut total = if array.var_type() == VarType::String { Value::Str(Vec::new()) } else { Value::Int(0) };
        for v in array.values() {
            total = apply(Op::Add, total, v, self.maths())?;
        }
        if let Value::Float(f) = total {
            return float_result(f);
        }
        Ok(total)
    }

    fn current_beat(&mut self) -> i32 {
        if self.sound.beats <= 0 {
            return 0;
        }
        let elapsed = self.video.monotonic() as i64 * self.sound.tempo as i64 / 4096;
        (elapsed % self.sound.beats as i64) as i32
    }
}

/// 1-based position of `needle` in `haystack` at or after `start`, or 0
fn instr(haystack: &[u8], needle: &[u8], start: usize) -> usize {
    let from = start - 1;
    if from > haystack.len() {
        return 0;
    }
    if needle.is_empty() {
        return start;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map_or(0, |p| p + start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instr() {
        assert_eq!(instr(b"HELLO", b"L", 1), 3);
        assert_eq!(instr(b"HELLO", b"L", 4), 4);
        assert_eq!(instr(b"HELLO", b"Z", 1), 0);
        assert_eq!(instr(b"HELLO", b"", 2), 2);
        assert_eq!(instr(b"HI", b"I", 5), 0);
    }
}
