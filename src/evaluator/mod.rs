//! Expression evaluator
//!
//! Expressions are evaluated straight from the tokenised program text by
//! recursive descent, one method per precedence level:
//!
//! ```text
//! OR EOR                      loosest
//! AND
//! = <> < > <= >= << >> >>>
//! + -
//! * / DIV MOD .
//! ^
//! unary + - NOT, indirection, functions, literals
//! ```
//!
//! Integer arithmetic is 32-bit and moves up to 64-bit integers, then to
//! floating point, when a result no longer fits. Arrays may appear as whole
//! operands of the arithmetic operators, which then work element by element.

mod format;
mod functions;

pub use format::{field_width, format_hex, format_number, parse_number, str_value, STR_USES_AT};
pub(crate) use functions::host_id;

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use crate::error::{BasicError, ErrorKind, Result};
use crate::executor::Interpreter;
use crate::tokenizer::*;
use crate::variables::{static_index, Array, VarType, Value, MAXSTRING};

/// Integer arithmetic options taken from the configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Maths {
    /// Wrap 32-bit results instead of widening them
    pub legacy: bool,
    /// Widen overflowing integers straight to floating point
    pub int_uses_float: bool,
    /// Shift operators work on 64 bits
    pub bitshift64: bool,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
    Pow,
    /// `.` matrix multiplication
    MatMul,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Shl,
    Shr,
    /// `>>>` logical shift right
    Lsr,
    And,
    Or,
    Eor,
}

/// Something that can be assigned to
#[derive(Debug, Clone, PartialEq)]
pub enum LValue {
    /// Scalar variable by name, including `@%` and `A%`..`Z%`
    Variable(String),
    /// One array element by linear index
    Element(Rc<RefCell<Array>>, usize),
    /// A whole array (`name(` key)
    Array(String),
    /// `?addr`
    Byte(usize),
    /// `!addr`
    Word(usize),
    /// `]addr`
    Word64(usize),
    /// `|addr`
    Float(usize),
    /// `$addr`
    Str(usize),
}

impl LValue {
    /// Whether the target holds a string
    pub fn is_string(&self) -> bool {
        match self {
            LValue::Variable(name) | LValue::Array(name) => VarType::of_name(name) == VarType::String,
            LValue::Element(array, _) => array.borrow().var_type() == VarType::String,
            LValue::Str(_) => true,
            _ => false,
        }
    }
}

/// Convert an integer value into a workspace address. Negative values are
/// taken as unsigned 32-bit quantities.
pub fn address(value: &Value) -> Result<usize> {
    let v = value.to_i64()?;
    if v < 0 {
        if v >= i32::MIN as i64 {
            return Ok(v as i32 as u32 as usize);
        }
        return Err(BasicError::new(ErrorKind::Address).with_int(v));
    }
    usize::try_from(v).map_err(|_| BasicError::new(ErrorKind::Address).with_int(v))
}

fn truth(flag: bool) -> Value {
    Value::Int(if flag { -1 } else { 0 })
}

/// A 32-bit result computed in 64 bits
fn narrow_result(wide: i64, maths: Maths) -> Value {
    match i32::try_from(wide) {
        Ok(v) => Value::Int(v),
        Err(_) if maths.legacy => Value::Int(wide as i32),
        Err(_) if maths.int_uses_float => Value::Float(wide as f64),
        Err(_) => Value::Int64(wide),
    }
}

fn float_result(f: f64) -> Result<Value> {
    if f.is_finite() {
        Ok(Value::Float(f))
    } else {
        Err(ErrorKind::Range.into())
    }
}

fn is_int(v: &Value) -> bool {
    matches!(v, Value::Int(_) | Value::Int64(_))
}

/// Apply a binary operator
pub fn apply(op: Op, lhs: Value, rhs: Value, maths: Maths) -> Result<Value> {
    if matches!(lhs, Value::Array(_)) || matches!(rhs, Value::Array(_)) {
        return array_op(op, lhs, rhs, maths);
    }
    match op {
        Op::Add | Op::Sub | Op::Mul => arithmetic(op, lhs, rhs, maths),
        Op::Div => {
            let divisor = rhs.to_f64()?;
            let dividend = lhs.to_f64()?;
            if divisor == 0.0 {
                return Err(ErrorKind::DivZero.into());
            }
            float_result(dividend / divisor)
        }
        Op::Pow => power(lhs, rhs),
        Op::IntDiv | Op::Mod => integer_division(op, lhs, rhs),
        Op::MatMul => Err(ErrorKind::TypeArray.into()),
        Op::Eq | Op::Ne | Op::Lt | Op::Gt | Op::Le | Op::Ge => compare(op, &lhs, &rhs),
        Op::Shl | Op::Shr | Op::Lsr => shift(op, lhs, rhs, maths),
        Op::And | Op::Or | Op::Eor => logical(op, lhs, rhs),
    }
}

fn arithmetic(op: Op, lhs: Value, rhs: Value, maths: Maths) -> Result<Value> {
    match (lhs, rhs) {
        (Value::Str(mut a), Value::Str(b)) if op == Op::Add => {
            if a.len() + b.len() > MAXSTRING {
                return Err(ErrorKind::StringLen.into());
            }
            a.extend_from_slice(&b);
            Ok(Value::Str(a))
        }
        (Value::Str(_), Value::Str(_)) => Err(ErrorKind::TypeNum.into()),
        (Value::Str(_), _) => Err(ErrorKind::TypeStr.into()),
        (_, Value::Str(_)) => Err(ErrorKind::TypeNum.into()),
        (Value::Int(a), Value::Int(b)) => {
            let (a, b) = (a as i64, b as i64);
            let wide = match op {
                Op::Add => a + b,
                Op::Sub => a - b,
                _ => a * b,
            };
            Ok(narrow_result(wide, maths))
        }
        (a, b) if is_int(&a) && is_int(&b) => {
            let (x, y) = (a.to_i64()?, b.to_i64()?);
            let result = match op {
                Op::Add => x.checked_add(y),
                Op::Sub => x.checked_sub(y),
                _ => x.checked_mul(y),
            };
            match result {
                Some(v) => Ok(Value::Int64(v)),
                None if maths.legacy => Ok(Value::Int64(match op {
                    Op::Add => x.wrapping_add(y),
                    Op::Sub => x.wrapping_sub(y),
                    _ => x.wrapping_mul(y),
                })),
                None => float_arithmetic(op, x as f64, y as f64),
            }
        }
        (a, b) => float_arithmetic(op, a.to_f64()?, b.to_f64()?),
    }
}

fn float_arithmetic(op: Op, a: f64, b: f64) -> Result<Value> {
    float_result(match op {
        Op::Add => a + b,
        Op::Sub => a - b,
        _ => a * b,
    })
}

fn power(lhs: Value, rhs: Value) -> Result<Value> {
    let (base, exponent) = (lhs.to_f64()?, rhs.to_f64()?);
    if base < 0.0 && exponent.fract() != 0.0 {
        return Err(ErrorKind::LogRange.into());
    }
    if base == 0.0 && exponent < 0.0 {
        return Err(ErrorKind::DivZero.into());
    }
    float_result(base.powf(exponent))
}

fn integer_division(op: Op, lhs: Value, rhs: Value) -> Result<Value> {
    let wide = matches!(lhs, Value::Int64(_)) || matches!(rhs, Value::Int64(_));
    let (x, y) = (lhs.to_i64()?, rhs.to_i64()?);
    if y == 0 {
        return Err(ErrorKind::DivZero.into());
    }
    let r = if op == Op::IntDiv { x.wrapping_div(y) } else { x.wrapping_rem(y) };
    match i32::try_from(r) {
        Ok(v) if !wide => Ok(Value::Int(v)),
        _ => Ok(Value::Int64(r)),
    }
}

fn compare(op: Op, lhs: &Value, rhs: &Value) -> Result<Value> {
    let ordering = match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Str(_), _) => return Err(ErrorKind::TypeStr.into()),
        (_, Value::Str(_)) => return Err(ErrorKind::TypeNum.into()),
        (a, b) if is_int(a) && is_int(b) => Some(a.to_i64()?.cmp(&b.to_i64()?)),
        (a, b) => a.to_f64()?.partial_cmp(&b.to_f64()?),
    };
    let result = match (op, ordering) {
        (Op::Ne, None) => true,
        (_, None) => false,
        (Op::Eq, Some(o)) => o == Ordering::Equal,
        (Op::Ne, Some(o)) => o != Ordering::Equal,
        (Op::Lt, Some(o)) => o == Ordering::Less,
        (Op::Gt, Some(o)) => o == Ordering::Greater,
        (Op::Le, Some(o)) => o != Ordering::Greater,
        (_, Some(o)) => o != Ordering::Less,
    };
    Ok(truth(result))
}

fn shift(op: Op, lhs: Value, rhs: Value, maths: Maths) -> Result<Value> {
    let count = rhs.to_i64()?;
    if maths.bitshift64 || matches!(lhs, Value::Int64(_)) {
        let x = lhs.to_i64()?;
        let r = if !(0..64).contains(&count) {
            if op == Op::Shr && x < 0 {
                -1
            } else {
                0
            }
        } else {
            match op {
                Op::Shl => x.wrapping_shl(count as u32),
                Op::Shr => x >> count,
                _ => ((x as u64) >> count) as i64,
            }
        };
        return Ok(Value::Int64(r));
    }
    let x = lhs.to_i32_wrapping()?;
    let r = if !(0..32).contains(&count) {
        if op == Op::Shr && x < 0 {
            -1
        } else {
            0
        }
    } else {
        match op {
            Op::Shl => x.wrapping_shl(count as u32),
            Op::Shr => x >> count,
            _ => ((x as u32) >> count) as i32,
        }
    };
    Ok(Value::Int(r))
}

/// Operand of a bitwise operator as 64 bits, plus whether it fits 32
fn bits(value: &Value) -> Result<(i64, bool)> {
    match value {
        Value::Int(i) => Ok((*i as i64, true)),
        Value::Int64(i) => Ok((*i, false)),
        other => {
            let v = other.to_i64()?;
            Ok((v, v >= i32::MIN as i64 && v <= u32::MAX as i64))
        }
    }
}

fn logical(op: Op, lhs: Value, rhs: Value) -> Result<Value> {
    let (x, x32) = bits(&lhs)?;
    let (y, y32) = bits(&rhs)?;
    if x32 && y32 {
        let (x, y) = (x as i32, y as i32);
        return Ok(Value::Int(match op {
            Op::And => x & y,
            Op::Or => x | y,
            _ => x ^ y,
        }));
    }
    Ok(Value::Int64(match op {
        Op::And => x & y,
        Op::Or => x | y,
        _ => x ^ y,
    }))
}

/// Negate a value (unary minus)
pub fn negate(value: Value) -> Result<Value> {
    match value {
        Value::Int(i) => Ok(i.checked_neg().map_or(Value::Int64(-(i as i64)), Value::Int)),
        Value::Int64(i) => Ok(i.checked_neg().map_or(Value::Float(-(i as f64)), Value::Int64)),
        Value::Float(f) => Ok(Value::Float(-f)),
        Value::Str(_) => Err(ErrorKind::TypeNum.into()),
        Value::Array(array) => {
            let array = array.borrow();
            let mut result = Array::new(array.var_type(), array.dims.clone());
            if array.var_type() == VarType::String {
                return Err(ErrorKind::NotNumArray.into());
            }
            for (i, v) in array.values().into_iter().enumerate() {
                result.set(i, negate(v)?)?;
            }
            Ok(Value::Array(Rc::new(RefCell::new(result))))
        }
    }
}

/// Element by element arithmetic, and `.` matrix multiplication
fn array_op(op: Op, lhs: Value, rhs: Value, maths: Maths) -> Result<Value> {
    if op == Op::MatMul {
        return matrix_multiply(lhs.into_array()?, rhs.into_array()?, maths);
    }
    if !matches!(op, Op::Add | Op::Sub | Op::Mul | Op::Div | Op::IntDiv | Op::Mod | Op::Pow) {
        return Err(ErrorKind::VarArray.into());
    }
    let (template, elements) = match (&lhs, &rhs) {
        (Value::Array(a), Value::Array(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            if a.dims != b.dims {
                return Err(ErrorKind::BadArith.into());
            }
            let pairs: Vec<_> = a.values().into_iter().zip(b.values()).collect();
            (Array::new(a.var_type(), a.dims.clone()), pairs)
        }
        (Value::Array(a), scalar) => {
            let a = a.borrow();
            let pairs = a.values().into_iter().map(|v| (v, scalar.clone())).collect();
            (Array::new(a.var_type(), a.dims.clone()), pairs)
        }
        (scalar, Value::Array(b)) => {
            let b = b.borrow();
            let pairs = b.values().into_iter().map(|v| (scalar.clone(), v)).collect();
            (Array::new(b.var_type(), b.dims.clone()), pairs)
        }
        _ => return Err(ErrorKind::TypeArray.into()),
    };
    let mut result = template;
    for (i, (a, b)) in elements.into_iter().enumerate() {
        result.set(i, apply(op, a, b, maths)?)?;
    }
    Ok(Value::Array(Rc::new(RefCell::new(result))))
}

/// Shape of an array taken as a matrix: vectors are a single row
fn matrix_shape(array: &Array) -> Result<(usize, usize)> {
    match array.dims.as_slice() {
        [n] => Ok((1, *n)),
        [r, c] => Ok((*r, *c)),
        _ => Err(ErrorKind::MatArray.into()),
    }
}

fn matrix_multiply(a: Rc<RefCell<Array>>, b: Rc<RefCell<Array>>, maths: Maths) -> Result<Value> {
    let (a, b) = (a.borrow(), b.borrow());
    if a.var_type() == VarType::String || b.var_type() == VarType::String {
        return Err(ErrorKind::NotNumArray.into());
    }
    let (a_rows, a_cols) = matrix_shape(&a)?;
    let (mut b_rows, mut b_cols) = matrix_shape(&b)?;
    // A vector on the right is a column
    let b_is_vector = b.dims.len() == 1;
    if b_is_vector {
        std::mem::swap(&mut b_rows, &mut b_cols);
    }
    if a_cols != b_rows {
        return Err(ErrorKind::MatArray.into());
    }
    let dims = match (a.dims.len(), b_is_vector) {
        (1, _) => vec![b_cols],
        (_, true) => vec![a_rows],
        _ => vec![a_rows, b_cols],
    };
    let (av, bv) = (a.values(), b.values());
    let mut result = Array::new(a.var_type(), dims);
    for r in 0..a_rows {
        for c in 0..b_cols {
            let mut sum = Value::Int(0);
            for k in 0..a_cols {
                let right = if b_is_vector { &bv[k] } else { &bv[k * b_cols + c] };
                let product = apply(Op::Mul, av[r * a_cols + k].clone(), right.clone(), maths)?;
                sum = apply(Op::Add, sum, product, maths)?;
            }
            result.set(r * b_cols + c, sum)?;
        }
    }
    Ok(Value::Array(Rc::new(RefCell::new(result))))
}

/// Byte that may follow a variable name character
fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'`'
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'`'
}

impl Interpreter {
    pub(crate) fn maths(&self) -> Maths {
        Maths {
            legacy: self.config.legacy_int_maths,
            int_uses_float: self.config.int_uses_float,
            bitshift64: self.config.bitshift64,
        }
    }

    /// Evaluate a full expression
    pub(crate) fn expression(&mut self) -> Result<Value> {
        let mut lhs = self.and_level()?;
        loop {
            let op = match self.skip_spaces() {
                TOKEN_OR => Op::Or,
                TOKEN_EOR => Op::Eor,
                _ => return Ok(lhs),
            };
            self.pc += 1;
            let rhs = self.and_level()?;
            lhs = apply(op, lhs, rhs, self.maths())?;
        }
    }

    fn and_level(&mut self) -> Result<Value> {
        let mut lhs = self.relational()?;
        while self.skip_spaces() == TOKEN_AND {
            self.pc += 1;
            let rhs = self.relational()?;
            lhs = apply(Op::And, lhs, rhs, self.maths())?;
        }
        Ok(lhs)
    }

    fn relational(&mut self) -> Result<Value> {
        let mut lhs = self.additive()?;
        loop {
            let first = self.skip_spaces();
            let second = self.byte_at(self.pc + 1);
            let (op, len) = match (first, second) {
                (b'=', _) => (Op::Eq, 1),
                (b'<', b'>') => (Op::Ne, 2),
                (b'<', b'=') => (Op::Le, 2),
                (b'<', b'<') => (Op::Shl, 2),
                (b'<', _) => (Op::Lt, 1),
                (b'>', b'=') => (Op::Ge, 2),
                (b'>', b'>') if self.byte_at(self.pc + 2) == b'>' => (Op::Lsr, 3),
                (b'>', b'>') => (Op::Shr, 2),
                (b'>', _) => (Op::Gt, 1),
                _ => return Ok(lhs),
            };
            self.pc += len;
            let rhs = self.additive()?;
            lhs = apply(op, lhs, rhs, self.maths())?;
        }
    }

    fn additive(&mut self) -> Result<Value> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.skip_spaces() {
                b'+' => Op::Add,
                b'-' => Op::Sub,
                _ => return Ok(lhs),
            };
            self.pc += 1;
            let rhs = self.multiplicative()?;
            lhs = apply(op, lhs, rhs, self.maths())?;
        }
    }

    fn multiplicative(&mut self) -> Result<Value> {
        let mut lhs = self.power()?;
        loop {
            let op = match self.skip_spaces() {
                b'*' => Op::Mul,
                b'/' => Op::Div,
                b'.' => Op::MatMul,
                TOKEN_DIV => Op::IntDiv,
                TOKEN_MOD => Op::Mod,
                _ => return Ok(lhs),
            };
            self.pc += 1;
            let rhs = self.power()?;
            lhs = apply(op, lhs, rhs, self.maths())?;
        }
    }

    fn power(&mut self) -> Result<Value> {
        let mut lhs = self.factor()?;
        while self.skip_spaces() == b'^' {
            self.pc += 1;
            let rhs = self.factor()?;
            lhs = apply(Op::Pow, lhs, rhs, self.maths())?;
        }
        Ok(lhs)
    }

    /// Evaluate a factor: a literal, variable, bracketed expression, unary
    /// operator or function
    pub(crate) fn factor(&mut self) -> Result<Value> {
        let b = self.skip_spaces();
        match b {
            b'0'..=b'9' | b'.' => self.decimal_literal(),
            b'&' => self.radix_literal(16),
            b'%' => self.radix_literal(2),
            b'"' => Ok(Value::Str(self.string_literal()?)),
            b'(' => {
                self.pc += 1;
                let value = self.expression()?;
                self.expect(b')', ErrorKind::RpMiss)?;
                Ok(value)
            }
            b'-' => {
                self.pc += 1;
                let value = self.factor()?;
                negate(value)
            }
            b'+' => {
                self.pc += 1;
                let value = self.factor()?;
                if value.is_string() {
                    return Err(ErrorKind::TypeNum.into());
                }
                Ok(value)
            }
            b'?' | b'!' | b']' | b'|' | b'$' => {
                self.pc += 1;
                let addr = address(&self.factor()?)?;
                self.read_indirect(b, addr)
            }
            TOKEN_NOT => {
                self.pc += 1;
                let value = self.factor()?;
                match value {
                    Value::Int64(i) => Ok(Value::Int64(!i)),
                    other => Ok(Value::Int(!other.to_i32_wrapping()?)),
                }
            }
            TOKEN_TRUE => {
                self.pc += 1;
                Ok(Value::Int(-1))
            }
            TOKEN_FALSE => {
                self.pc += 1;
                Ok(Value::Int(0))
            }
            TOKEN_FN => {
                self.pc += 1;
                self.call_fn()
            }
            b'@' | b'A'..=b'Z' | b'a'..=b'z' | b'_' | b'`' => self.variable_value(),
            b if b >= TOKEN_OTHERWISE => self.function(),
            _ => Err(ErrorKind::BadExpr.into()),
        }
    }

    fn decimal_literal(&mut self) -> Result<Value> {
        let start = self.pc;
        let mut text = Vec::new();
        let mut is_float = false;
        while self.current().is_ascii_digit() {
            text.push(self.current());
            self.pc += 1;
        }
        if self.current() == b'.' {
            is_float = true;
            text.push(b'.');
            self.pc += 1;
            while self.current().is_ascii_digit() {
                text.push(self.current());
                self.pc += 1;
            }
        }
        if text == b"." {
            self.pc = start;
            return Err(ErrorKind::BadExpr.into());
        }
        if self.current() == b'E' {
            let mark = self.pc;
            let mut exponent = vec![b'e'];
            self.pc += 1;
            if matches!(self.current(), b'+' | b'-') {
                exponent.push(self.current());
                self.pc += 1;
            }
            if self.current().is_ascii_digit() {
                while self.current().is_ascii_digit() {
                    exponent.push(self.current());
                    self.pc += 1;
                }
                text.extend_from_slice(&exponent);
                is_float = true;
            } else {
                self.pc = mark;
            }
        }
        let literal = String::from_utf8_lossy(&text);
        if !is_float {
            if let Ok(i) = literal.parse::<i32>() {
                return Ok(Value::Int(i));
            }
            if let Ok(i) = literal.parse::<i64>() {
                return Ok(Value::Int64(i));
            }
        }
        let f: f64 = literal.parse().map_err(|_| BasicError::new(ErrorKind::BadExpr))?;
        float_result(f)
    }

    /// `&` hexadecimal or `%` binary constant
    fn radix_literal(&mut self, radix: u32) -> Result<Value> {
        self.pc += 1;
        let mut value: u64 = 0;
        let mut digits = 0;
        while let Some(d) = (self.current() as char).to_digit(radix) {
            if radix == 16 && self.current().is_ascii_lowercase() {
                break;
            }
            value = value.wrapping_mul(radix as u64).wrapping_add(d as u64);
            digits += 1;
            self.pc += 1;
        }
        if digits == 0 {
            return Err(ErrorKind::BadExpr.into());
        }
        let wide_digits = if radix == 16 { 8 } else { 32 };
        if self.config.hex64 && digits > wide_digits {
            Ok(Value::Int64(value as i64))
        } else {
            Ok(Value::Int(value as u32 as i32))
        }
    }

    /// String constant at `pc`, with `""` standing for one quote
    pub(crate) fn string_literal(&mut self) -> Result<Vec<u8>> {
        self.pc += 1;
        let mut text = Vec::new();
        loop {
            match self.current() {
                LINE_END => return Err(ErrorKind::QuoteMiss.into()),
                b'"' if self.byte_at(self.pc + 1) == b'"' => {
                    text.push(b'"');
                    self.pc += 2;
                }
                b'"' => {
                    self.pc += 1;
                    return Ok(text);
                }
                b => {
                    text.push(b);
                    self.pc += 1;
                }
            }
        }
    }

    fn read_indirect(&self, operator: u8, addr: usize) -> Result<Value> {
        Ok(match operator {
            b'?' => Value::Int(self.mem.peek(addr)? as i32),
            b'!' => Value::Int(self.mem.peek_int(addr)?),
            b']' => Value::Int64(self.mem.peek_int64(addr)?),
            b'|' => Value::Float(self.mem.peek_float(addr)?),
            _ => Value::Str(self.mem.peek_string(addr, MAXSTRING)?),
        })
    }

    /// Read a variable name at `pc`, including its type suffix
    pub(crate) fn read_name(&mut self) -> Option<String> {
        let start = self.pc;
        let first = self.current();
        if first == b'@' {
            if self.byte_at(self.pc + 1) == b'%' {
                self.pc += 2;
                return Some("@%".to_string());
            }
            return None;
        }
        if !is_name_start(first) {
            return None;
        }
        let mut name = Vec::new();
        while is_name_char(self.current()) {
            name.push(self.current());
            self.pc += 1;
        }
        match self.current() {
            b'%' if self.byte_at(self.pc + 1) == b'%' => {
                name.extend_from_slice(b"%%");
                self.pc += 2;
            }
            b @ (b'%' | b'$' | b'&') => {
                name.push(b);
                self.pc += 1;
            }
            _ => {}
        }
        if name.is_empty() {
            self.pc = start;
            return None;
        }
        Some(String::from_utf8_lossy(&name).into_owned())
    }

    /// Array subscripts after the `(`, through the `)`
    fn subscripts(&mut self) -> Result<Vec<i64>> {
        let mut indices = Vec::new();
        loop {
            indices.push(self.expression()?.to_i64()?);
            match self.skip_spaces() {
                b',' => self.pc += 1,
                b')' => {
                    self.pc += 1;
                    return Ok(indices);
                }
                _ => return Err(ErrorKind::RpMiss.into()),
            }
        }
    }

    /// Value of a variable, array element or whole array at `pc`, with any
    /// dyadic `?` or `!` that follows
    fn variable_value(&mut self) -> Result<Value> {
        let target = self.lvalue()?;
        self.read_lvalue(&target)
    }

    /// Parse an assignment target at `pc`
    pub(crate) fn lvalue(&mut self) -> Result<LValue> {
        let b = self.skip_spaces();
        if matches!(b, b'?' | b'!' | b']' | b'|' | b'$') {
            self.pc += 1;
            let addr = address(&self.factor()?)?;
            return Ok(indirect_lvalue(b, addr));
        }
        let name = self.read_name().ok_or_else(|| BasicError::new(ErrorKind::Syntax))?;
        let target = if self.current() == b'(' {
            self.pc += 1;
            let key = format!("{}(", name);
            if self.skip_spaces() == b')' {
                self.pc += 1;
                return Ok(LValue::Array(key));
            }
            let array = self.vars.array(&key)?;
            let indices = self.subscripts()?;
            let linear = array.borrow().calculate_index(&indices)?;
            LValue::Element(array, linear)
        } else {
            LValue::Variable(name)
        };
        // Dyadic indirection: base?offset, base!offset
        let op = self.current();
        if matches!(op, b'?' | b'!') {
            self.pc += 1;
            let base = self.read_lvalue(&target)?;
            let offset = self.factor()?;
            let addr = address(&apply(Op::Add, base, offset, self.maths())?)?;
            return Ok(indirect_lvalue(op, addr));
        }
        Ok(target)
    }

    /// Current value of an assignment target
    pub(crate) fn read_lvalue(&self, target: &LValue) -> Result<Value> {
        match target {
            LValue::Variable(name) => self.vars.get_value(name),
            LValue::Element(array, index) => array.borrow().get(*index),
            LValue::Array(name) => Ok(Value::Array(self.vars.array(name)?)),
            LValue::Byte(a) => self.read_indirect(b'?', *a),
            LValue::Word(a) => self.read_indirect(b'!', *a),
            LValue::Word64(a) => self.read_indirect(b']', *a),
            LValue::Float(a) => self.read_indirect(b'|', *a),
            LValue::Str(a) => self.read_indirect(b'$', *a),
        }
    }

    /// Store a value into an assignment target
    pub(crate) fn assign_lvalue(&mut self, target: &LValue, value: Value) -> Result<()> {
        match target {
            LValue::Variable(name) => self.vars.assign(name, value),
            LValue::Element(array, index) => array.borrow_mut().set(*index, value),
            LValue::Array(name) => {
                let array = self.vars.array(name)?;
                match value {
                    Value::Array(source) => {
                        if Rc::ptr_eq(&array, &source) {
                            return Ok(());
                        }
                        let source = source.borrow();
                        let mut dest = array.borrow_mut();
                        if source.len() != dest.len() {
                            return Err(ErrorKind::NotWhole.into());
                        }
                        for (i, v) in source.values().into_iter().enumerate() {
                            dest.set(i, v)?;
                        }
                        Ok(())
                    }
                    scalar => array.borrow_mut().fill(&scalar),
                }
            }
            LValue::Byte(a) => self.mem.poke(*a, value.to_i64()? as u8),
            LValue::Word(a) => self.mem.poke_int(*a, value.to_i32_wrapping()?),
            LValue::Word64(a) => self.mem.poke_int64(*a, value.to_i64()?),
            LValue::Float(a) => self.mem.poke_float(*a, value.to_f64()?),
            LValue::Str(a) => {
                let text = value.into_string()?;
                self.mem.poke_string(*a, &text)
            }
        }
    }

    /// Whether a scalar variable exists, for statements that create
    /// variables on first use
    pub(crate) fn variable_exists(&self, name: &str) -> bool {
        static_index(name).is_some() || self.vars.has_variable(name)
    }

    pub(crate) fn eval_i32(&mut self) -> Result<i32> {
        self.expression()?.to_i32()
    }

    pub(crate) fn eval_i64(&mut self) -> Result<i64> {
        self.expression()?.to_i64()
    }

    pub(crate) fn eval_f64(&mut self) -> Result<f64> {
        self.expression()?.to_f64()
    }

    pub(crate) fn eval_string(&mut self) -> Result<Vec<u8>> {
        self.expression()?.into_string()
    }

    /// Numeric expression as an integer, accepting any 32-bit pattern
    pub(crate) fn eval_word(&mut self) -> Result<i32> {
        self.expression()?.to_i32_wrapping()
    }
}

fn indirect_lvalue(operator: u8, addr: usize) -> LValue {
    match operator {
        b'?' => LValue::Byte(addr),
        b'!' => LValue::Word(addr),
        b']' => LValue::Word64(addr),
        b'|' => LValue::Float(addr),
        _ => LValue::Str(addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn maths() -> Maths {
        Maths::default()
    }

    fn array(values: &[i32], dims: Vec<usize>) -> Value {
        let mut a = Array::new(VarType::Integer, dims);
        for (i, v) in values.iter().enumerate() {
            a.set(i, Value::Int(*v)).unwrap();
        }
        Value::Array(Rc::new(RefCell::new(a)))
    }

    fn ints(value: Value) -> Vec<Value> {
        value.into_array().unwrap().borrow().values()
    }

    #[test]
    fn test_integer_overflow_widens() {
        let r = apply(Op::Add, Value::Int(i32::MAX), Value::Int(1), maths()).unwrap();
        assert_eq!(r, Value::Int64(2_147_483_648));
        let legacy = Maths { legacy: true, ..maths() };
        let r = apply(Op::Add, Value::Int(i32::MAX), Value::Int(1), legacy).unwrap();
        assert_eq!(r, Value::Int(i32::MIN));
        let float = Maths { int_uses_float: true, ..maths() };
        let r = apply(Op::Mul, Value::Int(65536), Value::Int(65536), float).unwrap();
        assert_eq!(r, Value::Float(4294967296.0));
    }

    #[test]
    fn test_division() {
        assert_eq!(apply(Op::Div, Value::Int(7), Value::Int(2), maths()).unwrap(), Value::Float(3.5));
        assert_eq!(apply(Op::IntDiv, Value::Int(7), Value::Int(2), maths()).unwrap(), Value::Int(3));
        assert_eq!(apply(Op::Mod, Value::Int(-7), Value::Int(2), maths()).unwrap(), Value::Int(-1));
        let err = apply(Op::Div, Value::Int(1), Value::Int(0), maths()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DivZero);
        let err = apply(Op::Mod, Value::Int(1), Value::Float(0.5), maths()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DivZero);
    }

    #[test]
    fn test_comparisons_and_types() {
        assert_eq!(apply(Op::Lt, Value::Int(1), Value::Float(1.5), maths()).unwrap(), Value::Int(-1));
        let a = Value::Str(b"ABC".to_vec());
        let b = Value::Str(b"ABD".to_vec());
        assert_eq!(apply(Op::Ge, a.clone(), b, maths()).unwrap(), Value::Int(0));
        assert_eq!(apply(Op::Eq, a.clone(), Value::Int(1), maths()).unwrap_err().kind, ErrorKind::TypeStr);
        assert_eq!(apply(Op::Sub, a.clone(), a, maths()).unwrap_err().kind, ErrorKind::TypeNum);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(apply(Op::Shl, Value::Int(1), Value::Int(31), maths()).unwrap(), Value::Int(i32::MIN));
        assert_eq!(apply(Op::Shr, Value::Int(-8), Value::Int(1), maths()).unwrap(), Value::Int(-4));
        assert_eq!(apply(Op::Lsr, Value::Int(-8), Value::Int(28), maths()).unwrap(), Value::Int(15));
        assert_eq!(apply(Op::Shl, Value::Int(1), Value::Int(32), maths()).unwrap(), Value::Int(0));
        let wide = Maths { bitshift64: true, ..maths() };
        assert_eq!(apply(Op::Shl, Value::Int(1), Value::Int(32), wide).unwrap(), Value::Int64(1 << 32));
    }

    #[test]
    fn test_logical_operators() {
        assert_eq!(apply(Op::And, Value::Int(-1), Value::Int(5), maths()).unwrap(), Value::Int(5));
        assert_eq!(apply(Op::Eor, Value::Int(0xF0), Value::Float(15.0), maths()).unwrap(), Value::Int(0xFF));
        assert_eq!(
            apply(Op::Or, Value::Int64(1 << 40), Value::Int(1), maths()).unwrap(),
            Value::Int64((1 << 40) | 1)
        );
    }

    #[test]
    fn test_negate_edges() {
        assert_eq!(negate(Value::Int(i32::MIN)).unwrap(), Value::Int64(2_147_483_648));
        assert_eq!(negate(Value::Str(Vec::new())).unwrap_err().kind, ErrorKind::TypeNum);
    }

    #[test]
    fn test_whole_array_arithmetic() {
        let a = array(&[1, 2, 3], vec![3]);
        let b = array(&[10, 20, 30], vec![3]);
        assert_eq!(ints(apply(Op::Add, a.clone(), b, maths()).unwrap()), vec![Value::Int(11), Value::Int(22), Value::Int(33)]);
        assert_eq!(ints(apply(Op::Mul, a.clone(), Value::Int(2), maths()).unwrap()), vec![Value::Int(2), Value::Int(4), Value::Int(6)]);
        let c = array(&[1, 2], vec![2]);
        assert_eq!(apply(Op::Add, a, c, maths()).unwrap_err().kind, ErrorKind::BadArith);
    }

    #[test]
    fn test_matrix_multiply() {
        let a = array(&[1, 2, 3, 4], vec![2, 2]);
        let b = array(&[5, 6, 7, 8], vec![2, 2]);
        assert_eq!(
            ints(apply(Op::MatMul, a.clone(), b, maths()).unwrap()),
            vec![Value::Int(19), Value::Int(22), Value::Int(43), Value::Int(50)]
        );
        let v = array(&[1, 1], vec![2]);
        assert_eq!(ints(apply(Op::MatMul, a.clone(), v, maths()).unwrap()), vec![Value::Int(3), Value::Int(7)]);
        let bad = array(&[1, 2, 3], vec![3]);
        assert_eq!(apply(Op::MatMul, a, bad, maths()).unwrap_err().kind, ErrorKind::MatArray);
    }

    #[test]
    fn test_address_conversion() {
        assert_eq!(address(&Value::Int(0x100)).unwrap(), 0x100);
        assert_eq!(address(&Value::Int(-1)).unwrap(), 0xFFFF_FFFF);
        assert!(address(&Value::Int64(-(1 << 40))).is_err());
    }

    #[quickcheck]
    fn prop_addition_never_loses_integers(a: i32, b: i32) -> bool {
        let r = apply(Op::Add, Value::Int(a), Value::Int(b), Maths::default()).unwrap();
        r.to_i64().unwrap() == a as i64 + b as i64
    }

    #[quickcheck]
    fn prop_div_mod_identity(a: i32, b: i32) -> bool {
        if b == 0 {
            return true;
        }
        let q = apply(Op::IntDiv, Value::Int(a), Value::Int(b), Maths::default()).unwrap().to_i64().unwrap();
        let r = apply(Op::Mod, Value::Int(a), Value::Int(b), Maths::default()).unwrap().to_i64().unwrap();
        q.wrapping_mul(b as i64) + r == a as i64
    }
}
