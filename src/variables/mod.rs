//! Variable storage system for BBC BASIC
//!
//! Manages all BBC BASIC variables: 32-bit and 64-bit integers, unsigned
//! bytes, reals, strings and arrays of each, plus the static integer
//! variables `@%` and `A%`..`Z%` which survive `CLEAR` and `RUN`.
//!
//! Variables are keyed by their full name including the type suffix, with
//! arrays additionally carrying a trailing `(`, e.g. `count%`, `name$`,
//! `grid(`. Arrays are reference counted so that whole-array parameters
//! alias the caller's array.

use crate::error::{BasicError, ErrorKind, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Longest string a variable may hold
pub const MAXSTRING: usize = 65536;
/// Most dimensions an array may have
pub const MAX_DIMS: usize = 10;

/// Variable types supported by BBC BASIC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    /// `%` suffix
    Integer,
    /// `%%` suffix
    Integer64,
    /// `&` suffix
    Byte,
    /// No suffix
    Real,
    /// `$` suffix
    String,
}

impl VarType {
    /// Type implied by a variable name (array names may end in `(`)
    pub fn of_name(name: &str) -> VarType {
        let name = name.strip_suffix('(').unwrap_or(name);
        if name.ends_with("%%") {
            VarType::Integer64
        } else if name.ends_with('%') {
            VarType::Integer
        } else if name.ends_with('&') {
            VarType::Byte
        } else if name.ends_with('$') {
            VarType::String
        } else {
            VarType::Real
        }
    }

    pub fn is_numeric(self) -> bool {
        self != VarType::String
    }
}

/// The result of evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Int64(i64),
    Float(f64),
    Str(Vec<u8>),
    Array(Rc<RefCell<Array>>),
}

impl Value {
    pub fn is_string(&self) -> bool {
        matches!(self, Value::Str(_))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Int64(_) | Value::Float(_))
    }

    /// Numeric value as a float
    pub fn to_f64(&self) -> Result<f64> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Int64(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            Value::Str(_) => Err(ErrorKind::TypeNum.into()),
            Value::Array(_) => Err(ErrorKind::VarArray.into()),
        }
    }

    /// Numeric value as a 64-bit integer, truncating floats toward zero
    pub fn to_i64(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i as i64),
            Value::Int64(i) => Ok(*i),
            Value::Float(f) => float_to_i64(*f),
            Value::Str(_) => Err(ErrorKind::TypeNum.into()),
            Value::Array(_) => Err(ErrorKind::VarArray.into()),
        }
    }

    /// Numeric value as a 32-bit integer
    pub fn to_i32(&self) -> Result<i32> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Int64(i) => i32::try_from(*i).map_err(|_| ErrorKind::Range.into()),
            Value::Float(f) => float_to_i32(*f),
            Value::Str(_) => Err(ErrorKind::TypeNum.into()),
            Value::Array(_) => Err(ErrorKind::VarArray.into()),
        }
    }

    /// Integer value with 64-bit results wrapped into 32 bits
    pub fn to_i32_wrapping(&self) -> Result<i32> {
        match self {
            Value::Int64(i) => Ok(*i as i32),
            Value::Float(f) if *f >= 0.0 && *f < 4294967296.0 => Ok(*f as u32 as i32),
            other => other.to_i32(),
        }
    }

    pub fn into_string(self) -> Result<Vec<u8>> {
        match self {
            Value::Str(s) => Ok(s),
            Value::Array(_) => Err(ErrorKind::VarArray.into()),
            _ => Err(ErrorKind::TypeStr.into()),
        }
    }

    pub fn into_array(self) -> Result<Rc<RefCell<Array>>> {
        match self {
            Value::Array(a) => Ok(a),
            _ => Err(ErrorKind::TypeArray.into()),
        }
    }

    /// BASIC truth: non-zero numbers are TRUE
    pub fn is_true(&self) -> Result<bool> {
        match self {
            Value::Int(i) => Ok(*i != 0),
            Value::Int64(i) => Ok(*i != 0),
            Value::Float(f) => Ok(*f != 0.0),
            Value::Str(_) => Err(ErrorKind::TypeNum.into()),
            Value::Array(_) => Err(ErrorKind::VarArray.into()),
        }
    }
}

/// Convert a float to a 32-bit integer, truncating toward zero
pub fn float_to_i32(value: f64) -> Result<i32> {
    let t = value.trunc();
    if t.is_nan() || t < i32::MIN as f64 || t > i32::MAX as f64 {
        return Err(ErrorKind::Range.into());
    }
    Ok(t as i32)
}

/// Convert a float to a 64-bit integer, truncating toward zero
pub fn float_to_i64(value: f64) -> Result<i64> {
    let t = value.trunc();
    if t.is_nan() || t < -9.223372036854776e18 || t >= 9.223372036854776e18 {
        return Err(ErrorKind::Range.into());
    }
    Ok(t as i64)
}

/// Element storage of an array
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Integer(Vec<i32>),
    Integer64(Vec<i64>),
    Byte(Vec<u8>),
    Real(Vec<f64>),
    String(Vec<Vec<u8>>),
}

/// An N-dimensional array with contiguous row-major storage
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    /// Number of elements along each dimension
    pub dims: Vec<usize>,
    pub data: ArrayData,
}

impl Array {
    /// Create a zeroed array
    pub fn new(var_type: VarType, dims: Vec<usize>) -> Self {
        let total: usize = dims.iter().product();
        let data = match var_type {
            VarType::Integer => ArrayData::Integer(vec![0; total]),
            VarType::Integer64 => ArrayData::Integer64(vec![0; total]),
            VarType::Byte => ArrayData::Byte(vec![0; total]),
            VarType::Real => ArrayData::Real(vec![0.0; total]),
            VarType::String => ArrayData::String(vec![Vec::new(); total]),
        };
        Self { dims, data }
    }

    pub fn var_type(&self) -> VarType {
        match self.data {
            ArrayData::Integer(_) => VarType::Integer,
            ArrayData::Integer64(_) => VarType::Integer64,
            ArrayData::Byte(_) => VarType::Byte,
            ArrayData::Real(_) => VarType::Real,
            ArrayData::String(_) => VarType::String,
        }
    }

    /// Total number of elements
    pub fn len(&self) -> usize {
        match &self.data {
            ArrayData::Integer(v) => v.len(),
            ArrayData::Integer64(v) => v.len(),
            ArrayData::Byte(v) => v.len(),
            ArrayData::Real(v) => v.len(),
            ArrayData::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate bytes of heap the array occupies
    pub fn storage_size(&self) -> usize {
        let element = match self.var_type() {
            VarType::Integer => 4,
            VarType::Integer64 | VarType::Real => 8,
            VarType::Byte => 1,
            VarType::String => 8,
        };
        self.len() * element + self.dims.len() * 4 + 8
    }

    /// Calculate linear index from multi-dimensional indices
    pub fn calculate_index(&self, indices: &[i64]) -> Result<usize> {
        if indices.len() != self.dims.len() {
            return Err(ErrorKind::IndexCo.into());
        }
        let mut linear = 0usize;
        for (&index, &dim) in indices.iter().zip(&self.dims) {
            if index < 0 || index as usize >= dim {
                return Err(BasicError::new(ErrorKind::BadIndex).with_int(index));
            }
            linear = linear * dim + index as usize;
        }
        Ok(linear)
    }

    /// Read one element
    pub fn get(&self, linear: usize) -> Result<Value> {
        let out_of_range = || BasicError::new(ErrorKind::BadIndex).with_int(linear as i64);
        Ok(match &self.data {
            ArrayData::Integer(v) => Value::Int(*v.get(linear).ok_or_else(out_of_range)?),
            ArrayData::Integer64(v) => Value::Int64(*v.get(linear).ok_or_else(out_of_range)?),
            ArrayData::Byte(v) => Value::Int(*v.get(linear).ok_or_else(out_of_range)? as i32),
            ArrayData::Real(v) => Value::Float(*v.get(linear).ok_or_else(out_of_range)?),
            ArrayData::String(v) => Value::Str(v.get(linear).ok_or_else(out_of_range)?.clone()),
        })
    }

    /// Write one element, converting the value to the element type
    pub fn set(&mut self, linear: usize, value: Value) -> Result<()> {
        if linear >= self.len() {
            return Err(BasicError::new(ErrorKind::BadIndex).with_int(linear as i64));
        }
        match &mut self.data {
            ArrayData::Integer(v) => v[linear] = value.to_i32()?,
            ArrayData::Integer64(v) => v[linear] = value.to_i64()?,
            ArrayData::Byte(v) => v[linear] = value.to_i64()? as u8,
            ArrayData::Real(v) => v[linear] = value.to_f64()?,
            ArrayData::String(v) => {
                let s = value.into_string()?;
                if s.len() > MAXSTRING {
                    return Err(ErrorKind::StringLen.into());
                }
                v[linear] = s;
            }
        }
        Ok(())
    }

    /// Every element as a value, in storage order
    pub fn values(&self) -> Vec<Value> {
        (0..self.len()).filter_map(|i| self.get(i).ok()).collect()
    }

    /// Set every element to `value`
    pub fn fill(&mut self, value: &Value) -> Result<()> {
        for i in 0..self.len() {
            self.set(i, value.clone())?;
        }
        Ok(())
    }
}

/// Represents a BBC BASIC variable value
#[derive(Debug, Clone, PartialEq)]
pub enum Variable {
    /// 32-bit signed integer (`A%`)
    Integer(i32),
    /// 64-bit signed integer (`A%%`)
    Integer64(i64),
    /// Unsigned byte (`A&`)
    Byte(u8),
    /// IEEE 754 double precision real (`A`)
    Real(f64),
    /// Byte string up to `MAXSTRING` long (`A$`)
    String(Vec<u8>),
    /// Any array, shared with PROC/FN array parameters
    Array(Rc<RefCell<Array>>),
}

impl Variable {
    /// A zero/empty variable of the given type
    pub fn zero(var_type: VarType) -> Self {
        match var_type {
            VarType::Integer => Variable::Integer(0),
            VarType::Integer64 => Variable::Integer64(0),
            VarType::Byte => Variable::Byte(0),
            VarType::Real => Variable::Real(0.0),
            VarType::String => Variable::String(Vec::new()),
        }
    }

    /// Build a variable of `var_type` from a value
    pub fn from_value(var_type: VarType, value: Value) -> Result<Self> {
        Ok(match var_type {
            VarType::Integer => Variable::Integer(value.to_i32()?),
            VarType::Integer64 => Variable::Integer64(value.to_i64()?),
            VarType::Byte => Variable::Byte(value.to_i64()? as u8),
            VarType::Real => Variable::Real(value.to_f64()?),
            VarType::String => {
                let s = value.into_string()?;
                if s.len() > MAXSTRING {
                    return Err(ErrorKind::StringLen.into());
                }
                Variable::String(s)
            }
        })
    }

    pub fn value(&self) -> Value {
        match self {
            Variable::Integer(i) => Value::Int(*i),
            Variable::Integer64(i) => Value::Int64(*i),
            Variable::Byte(b) => Value::Int(*b as i32),
            Variable::Real(f) => Value::Float(*f),
            Variable::String(s) => Value::Str(s.clone()),
            Variable::Array(a) => Value::Array(Rc::clone(a)),
        }
    }

    /// Check if this variable is an array
    pub fn is_array(&self) -> bool {
        matches!(self, Variable::Array(_))
    }
}

/// Index into the static variable table for `@%` or `A%`..`Z%`
pub fn static_index(name: &str) -> Option<usize> {
    let bytes = name.as_bytes();
    if bytes.len() != 2 || bytes[1] != b'%' {
        return None;
    }
    match bytes[0] {
        b'@' => Some(0),
        c @ b'A'..=b'Z' => Some((c - b'A') as usize + 1),
        _ => None,
    }
}

/// Default `@%`: general format, 10 significant digits, field width 10
pub const DEFAULT_AT_PERCENT: i32 = 0x0000_090A;

/// Variable storage system
#[derive(Debug, Clone)]
pub struct VariableStore {
    variables: HashMap<String, Variable>,
    statics: [i32; 27],
}

impl VariableStore {
    /// Create a new variable store
    pub fn new() -> Self {
        let mut statics = [0; 27];
        statics[0] = DEFAULT_AT_PERCENT;
        Self { variables: HashMap::new(), statics }
    }

    /// Value of a static integer variable (`@%` is index 0)
    pub fn static_var(&self, index: usize) -> i32 {
        self.statics[index]
    }

    pub fn set_static_var(&mut self, index: usize, value: i32) {
        self.statics[index] = value;
    }

    /// `@%`
    pub fn at_percent(&self) -> i32 {
        self.statics[0]
    }

    /// Get a variable by name (immutable)
    pub fn get_variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    /// Get a mutable reference to a variable
    pub fn get_variable_mut(&mut self, name: &str) -> Option<&mut Variable> {
        self.variables.get_mut(name)
    }

    /// Current value of a scalar variable
    pub fn get_value(&self, name: &str) -> Result<Value> {
        if let Some(index) = static_index(name) {
            return Ok(Value::Int(self.statics[index]));
        }
        self.variables
            .get(name)
            .map(Variable::value)
            .ok_or_else(|| BasicError::new(ErrorKind::VarMiss).with_str(name))
    }

    /// Assign to a scalar variable, creating it if needed
    pub fn assign(&mut self, name: &str, value: Value) -> Result<()> {
        if let Some(index) = static_index(name) {
            self.statics[index] = value.to_i32()?;
            return Ok(());
        }
        let variable = Variable::from_value(VarType::of_name(name), value)?;
        self.variables.insert(name.to_string(), variable);
        Ok(())
    }

    /// Create a variable with its zero value if it does not exist
    pub fn ensure(&mut self, name: &str) {
        if static_index(name).is_none() && !self.variables.contains_key(name) {
            self.variables
                .insert(name.to_string(), Variable::zero(VarType::of_name(name)));
        }
    }

    /// Dimension an array. `name` includes the trailing `(`.
    pub fn dim_array(&mut self, name: &str, dims: Vec<usize>) -> Result<Rc<RefCell<Array>>> {
        if dims.is_empty() || dims.len() > MAX_DIMS {
            return Err(ErrorKind::DimCount.into());
        }
        if let Some(Variable::Array(_)) = self.variables.get(name) {
            return Err(BasicError::new(ErrorKind::DuplDim).with_str(name.trim_end_matches('(')));
        }
        let array = Rc::new(RefCell::new(Array::new(VarType::of_name(name), dims)));
        self.variables
            .insert(name.to_string(), Variable::Array(Rc::clone(&array)));
        Ok(array)
    }

    /// Look up an array. `name` includes the trailing `(`.
    pub fn array(&self, name: &str) -> Result<Rc<RefCell<Array>>> {
        match self.variables.get(name) {
            Some(Variable::Array(a)) => Ok(Rc::clone(a)),
            _ => Err(BasicError::new(ErrorKind::ArrayMiss).with_str(name.trim_end_matches('('))),
        }
    }

    /// Get an array element
    pub fn get_array_element(&self, name: &str, indices: &[i64]) -> Result<Value> {
        let array = self.array(name)?;
        let array = array.borrow();
        let linear = array.calculate_index(indices)?;
        array.get(linear)
    }

    /// Set an array element
    pub fn set_array_element(&mut self, name: &str, indices: &[i64], value: Value) -> Result<()> {
        let array = self.array(name)?;
        let mut array = array.borrow_mut();
        let linear = array.calculate_index(indices)?;
        array.set(linear, value)
    }

    /// Remove a variable, returning what it held (for LOCAL)
    pub fn take(&mut self, name: &str) -> Option<Variable> {
        self.variables.remove(name)
    }

    /// Put back a variable saved by `take`; `None` deletes it
    pub fn restore(&mut self, name: &str, saved: Option<Variable>) {
        match saved {
            Some(v) => {
                self.variables.insert(name.to_string(), v);
            }
            None => {
                self.variables.remove(name);
            }
        }
    }

    /// Bind a name directly to a variable (array parameters)
    pub fn bind(&mut self, name: &str, variable: Variable) {
        self.variables.insert(name.to_string(), variable);
    }

    /// Check if a variable exists
    pub fn has_variable(&self, name: &str) -> bool {
        static_index(name).is_some() || self.variables.contains_key(name)
    }

    /// Clear all variables except the static integers
    pub fn clear(&mut self) {
        self.variables.clear();
    }

    /// Variables sorted by name, for LVAR
    pub fn sorted(&self) -> Vec<(&String, &Variable)> {
        let mut all: Vec<_> = self.variables.iter().collect();
        all.sort_by(|a, b| a.0.cmp(b.0));
        all
    }
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;

    #[test]
    fn test_variable_types() {
        assert_eq!(VarType::of_name("A%"), VarType::Integer);
        assert_eq!(VarType::of_name("big%%"), VarType::Integer64);
        assert_eq!(VarType::of_name("b&"), VarType::Byte);
        assert_eq!(VarType::of_name("x"), VarType::Real);
        assert_eq!(VarType::of_name("s$("), VarType::String);
    }

    #[test]
    fn test_assignment_converts() {
        let mut store = VariableStore::new();
        store.assign("n%", Value::Float(-2.7)).unwrap();
        assert_eq!(store.get_value("n%").unwrap(), Value::Int(-2));
        store.assign("b&", Value::Int(300)).unwrap();
        assert_eq!(store.get_value("b&").unwrap(), Value::Int(44));
        store.assign("r", Value::Int(3)).unwrap();
        assert_eq!(store.get_value("r").unwrap(), Value::Float(3.0));
        assert_eq!(
            store.assign("s$", Value::Int(1)).unwrap_err().kind,
            ErrorKind::TypeStr
        );
        assert_eq!(
            store.assign("n%", Value::Float(1e12)).unwrap_err().kind,
            ErrorKind::Range
        );
    }

    #[test]
    fn test_static_variables_survive_clear() {
        let mut store = VariableStore::new();
        assert_eq!(store.at_percent(), DEFAULT_AT_PERCENT);
        store.assign("A%", Value::Int(7)).unwrap();
        store.assign("x", Value::Int(1)).unwrap();
        store.clear();
        assert_eq!(store.get_value("A%").unwrap(), Value::Int(7));
        assert_eq!(store.get_value("x").unwrap_err().kind, ErrorKind::VarMiss);
    }

    #[test]
    fn test_array_access() {
        let mut store = VariableStore::new();
        store.dim_array("A%(", vec![4, 4]).unwrap();
        store.set_array_element("A%(", &[1, 1], Value::Int(42)).unwrap();
        assert_eq!(store.get_array_element("A%(", &[1, 1]).unwrap(), Value::Int(42));
        store.dim_array("C$(", vec![2]).unwrap();
        store.set_array_element("C$(", &[1], Value::Str(b"hello".to_vec())).unwrap();
        assert_eq!(
            store.get_array_element("C$(", &[1]).unwrap(),
            Value::Str(b"hello".to_vec())
        );
        let err = store.get_array_element("A%(", &[4, 0]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadIndex);
        assert_eq!(err.int_param, Some(4));
        assert_eq!(store.dim_array("A%(", vec![1]).unwrap_err().kind, ErrorKind::DuplDim);
    }

    #[test]
    fn test_empty_array() {
        let mut store = VariableStore::new();
        store.dim_array("e(", vec![0]).unwrap();
        assert_eq!(
            store.get_array_element("e(", &[0]).unwrap_err().kind,
            ErrorKind::BadIndex
        );
    }

    #[test]
    fn test_local_save_restore() {
        let mut store = VariableStore::new();
        store.assign("I", Value::Int(5)).unwrap();
        let saved = store.take("I");
        store.assign("I", Value::Int(1)).unwrap();
        store.restore("I", saved);
        assert_eq!(store.get_value("I").unwrap(), Value::Float(5.0));
        let saved = store.take("J");
        store.assign("J", Value::Int(1)).unwrap();
        store.restore("J", saved);
        assert!(!store.has_variable("J"));
    }

    #[test]
    fn test_string_too_long() {
        let mut store = VariableStore::new();
        let result = store.assign("A$", Value::Str(vec![b'a'; MAXSTRING + 1]));
        assert_eq!(result.unwrap_err().kind, ErrorKind::StringLen);
    }

    #[test]
    fn prop_integer_variable_storage_roundtrip() {
        fn property(value: i32) -> bool {
            let mut store = VariableStore::new();
            store.assign("TEST%", Value::Int(value)).unwrap();
            store.get_value("TEST%").unwrap() == Value::Int(value)
        }
        let mut qc = quickcheck::QuickCheck::new().tests(10);
        qc.quickcheck(property as fn(i32) -> bool);
    }

    #[test]
    fn prop_real_variable_storage_roundtrip() {
        fn property(value: f64) -> TestResult {
            if !value.is_finite() {
                return TestResult::discard();
            }
            let mut store = VariableStore::new();
            store.assign("TEST", Value::Float(value)).unwrap();
            TestResult::from_bool(store.get_value("TEST").unwrap() == Value::Float(value))
        }
        let mut qc = quickcheck::QuickCheck::new().tests(10);
        qc.quickcheck(property as fn(f64) -> TestResult);
    }
}
