//! Tagged runtime value.
//!
//! Faithful reimplementation of the value model: a tagged datum that owns strings,
//! vectors and tables, and transparently dereferences through `reference` values.
//! Containers hold [`ValueRef`] cells (`Rc<RefCell<Value>>`) rather than raw pointers
//! so that a reference can alias a slot living inside a vector, a table, or a scope
//! without unsafe code; cycles are possible (a vector element may reference its own
//! container) but deep copy never follows a `Reference`, which is what breaks them.

use crate::error::{VmError, VmResult};
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

bitflags::bitflags! {
    /// Boolean flags orthogonal to [`ValueData`]'s type tag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ValueFlags: u8 {
        /// The binding has been written to at least once.
        const ASSIGNED = 1 << 0;
        /// The binding rejects further payload mutation.
        const CONSTANT = 1 << 1;
        /// The binding lives in the global (root) scope.
        const GLOBAL   = 1 << 2;
    }
}

/// Shared, mutable handle to a [`Value`]. Scopes and containers store these directly;
/// a `Reference` value is simply a clone of someone else's cell.
pub type ValueRef = Rc<RefCell<Value>>;

/// Opaque handle to a function-definition node owned by the (out-of-scope) compiler AST.
/// The tree-walking collaborator is the only consumer; the VM itself never inspects it.
pub type CodeFunctionHandle = usize;

/// A host-provided callable, reached through a `Value::ExternalFunction` payload or
/// through [`crate::environment::Scope::register_func`].
///
/// The original carries two function-pointer slots (a direct callable and an adapter
/// for dynamically loaded libraries); both collapse into this one trait, with closures
/// standing in for the opaque `user_data` pointer via capture.
pub trait HostFunction: fmt::Debug {
    /// Invoke the function. Errors are reported through `ctx.set_error`, not returned,
    /// matching the host interface's error channel (§6.2).
    fn invoke(&self, ctx: &mut crate::host::InvocationContext);
}

/// Description of a host function, recovered once via a documentation-mode dry run.
#[derive(Debug, Clone, Default)]
pub struct FunctionDoc {
    pub name: String,
    pub notes: String,
    pub signatures: Vec<(String, String)>,
}

fn new_table() -> HashMap<String, ValueRef> {
    HashMap::new()
}

/// Payload carried by a [`Value`], keyed by its type tag.
#[derive(Clone)]
pub enum ValueData {
    Null,
    Reference(ValueRef),
    Number(f64),
    Str(String),
    Vector(Vec<ValueRef>),
    Table(HashMap<String, ValueRef>),
    CodeFunction(CodeFunctionHandle),
    ExternalFunction(Rc<dyn HostFunction>),
    InternalFunction(u32),
}

impl fmt::Debug for ValueData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueData::Null => write!(f, "Null"),
            ValueData::Reference(_) => write!(f, "Reference(..)"),
            ValueData::Number(n) => write!(f, "Number({n})"),
            ValueData::Str(s) => write!(f, "Str({s:?})"),
            ValueData::Vector(v) => write!(f, "Vector(len={})", v.len()),
            ValueData::Table(t) => write!(f, "Table(len={})", t.len()),
            ValueData::CodeFunction(h) => write!(f, "CodeFunction({h})"),
            ValueData::ExternalFunction(_) => write!(f, "ExternalFunction(..)"),
            ValueData::InternalFunction(a) => write!(f, "InternalFunction({a})"),
        }
    }
}

/// One runtime datum: type-tagged payload plus orthogonal flags.
#[derive(Debug, Clone)]
pub struct Value {
    data: ValueData,
    flags: ValueFlags,
}

/// The closed set of dynamic types a [`Value`] may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Reference,
    Number,
    String,
    Vector,
    Table,
    CodeFunction,
    ExternalFunction,
    InternalFunction,
}

impl ValueType {
    /// Name used by the `TYP` opcode and by `to_string` on function-typed values.
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Null => "null",
            ValueType::Reference => "reference",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Vector => "vector",
            ValueType::Table => "table",
            ValueType::CodeFunction => "function",
            ValueType::ExternalFunction => "function",
            ValueType::InternalFunction => "function",
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::null()
    }
}

impl Value {
    /// Constructs a fresh, unassigned null value.
    pub fn null() -> Self {
        Value {
            data: ValueData::Null,
            flags: ValueFlags::empty(),
        }
    }

    /// Wraps a value in a freshly allocated cell.
    pub fn cell(self) -> ValueRef {
        Rc::new(RefCell::new(self))
    }

    pub fn new_number(n: f64) -> Self {
        let mut v = Value::null();
        v.assign_number(n).expect("fresh null value is always mutable");
        v
    }

    pub fn new_string<S: Into<String>>(s: S) -> Self {
        let mut v = Value::null();
        v.assign_string(s.into())
            .expect("fresh null value is always mutable");
        v
    }

    // --- flags -----------------------------------------------------------

    pub fn flags(&self) -> ValueFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: ValueFlags) {
        self.flags.insert(flag);
    }

    pub fn clear_flag(&mut self, flag: ValueFlags) {
        self.flags.remove(flag);
    }

    pub fn has_flag(&self, flag: ValueFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Clears every flag and replaces the payload with `null`. The only operation
    /// permitted to override the constant flag (the owning scope may still rebind).
    pub fn nullify(&mut self) {
        self.data = ValueData::Null;
        self.flags = ValueFlags::empty();
    }

    // --- type --------------------------------------------------------------

    pub fn value_type(&self) -> ValueType {
        match &self.data {
            ValueData::Null => ValueType::Null,
            ValueData::Reference(_) => ValueType::Reference,
            ValueData::Number(_) => ValueType::Number,
            ValueData::Str(_) => ValueType::String,
            ValueData::Vector(_) => ValueType::Vector,
            ValueData::Table(_) => ValueType::Table,
            ValueData::CodeFunction(_) => ValueType::CodeFunction,
            ValueData::ExternalFunction(_) => ValueType::ExternalFunction,
            ValueData::InternalFunction(_) => ValueType::InternalFunction,
        }
    }

    pub fn type_str(&self) -> &'static str {
        self.value_type().as_str()
    }

    fn check_mutable(&self) -> VmResult<()> {
        if self.flags.contains(ValueFlags::CONSTANT) && self.flags.contains(ValueFlags::ASSIGNED) {
            return Err(VmError::ConstantViolation);
        }
        Ok(())
    }

    // --- dereference ---------------------------------------------------------

    /// Resolves a chain of `Reference` cells down to the first non-reference cell,
    /// erroring on a self-referential chain. Callers needing the final `Value` should
    /// clone/borrow the returned cell rather than `self`.
    pub fn deref_cell(this: &ValueRef) -> VmResult<ValueRef> {
        let mut current = this.clone();
        loop {
            let next = match &current.borrow().data {
                ValueData::Reference(target) => target.clone(),
                _ => break,
            };
            if Rc::ptr_eq(&next, &current) {
                return Err(VmError::SelfReference);
            }
            current = next;
        }
        Ok(current)
    }

    // --- conversions (always operate on the dereferenced value) --------------

    pub fn as_boolean(&self) -> bool {
        match &self.data {
            ValueData::Null => false,
            ValueData::Number(n) => *n != 0.0,
            ValueData::Str(s) => {
                let lower = s.to_ascii_lowercase();
                !(lower == "false" || lower == "f")
            }
            _ => true,
        }
    }

    pub fn as_number(&self) -> f64 {
        match &self.data {
            ValueData::Null => 0.0,
            ValueData::Number(n) => *n,
            ValueData::Str(s) => s.trim().parse::<f64>().unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }

    pub fn as_unsigned(&self) -> usize {
        let n = self.as_number();
        if n.is_finite() && n >= 0.0 {
            n as usize
        } else {
            0
        }
    }

    pub fn as_integer(&self) -> i64 {
        let n = self.as_number();
        if n.is_finite() {
            n as i64
        } else {
            0
        }
    }

    pub fn as_string(&self) -> String {
        match &self.data {
            ValueData::Null => "<null>".to_string(),
            ValueData::Number(n) => format_number(*n),
            ValueData::Str(s) => s.clone(),
            ValueData::Vector(items) => items
                .iter()
                .map(|v| v.borrow().as_string())
                .collect::<Vec<_>>()
                .join(","),
            ValueData::Table(table) => {
                let mut parts = Vec::with_capacity(table.len());
                for (k, v) in table.iter() {
                    parts.push(format!("{k}={}", v.borrow().as_string()));
                }
                format!("{{ {} }}", parts.join(" "))
            }
            ValueData::Reference(_) => unreachable!("as_string expects a dereferenced value"),
            ValueData::CodeFunction(_)
            | ValueData::ExternalFunction(_)
            | ValueData::InternalFunction(_) => "<function>".to_string(),
        }
    }

    // --- equality / ordering (operate on dereferenced values) -----------------

    pub fn equals(&self, rhs: &Value) -> bool {
        use ValueData::*;
        match (&self.data, &rhs.data) {
            (Null, Null) => true,
            (Number(a), Number(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (ExternalFunction(a), ExternalFunction(b)) => Rc::ptr_eq(a, b),
            (InternalFunction(a), InternalFunction(b)) => a == b,
            (CodeFunction(a), CodeFunction(b)) => a == b,
            _ => false,
        }
    }

    pub fn less_than(&self, rhs: &Value) -> bool {
        match (&self.data, &rhs.data) {
            (ValueData::Number(a), ValueData::Number(b)) => a < b,
            (ValueData::Str(a), ValueData::Str(b)) => a < b,
            _ => false,
        }
    }

    // --- mutating constructors -------------------------------------------------

    pub fn assign_number(&mut self, n: f64) -> VmResult<()> {
        self.check_mutable()?;
        self.data = ValueData::Number(n);
        self.flags.insert(ValueFlags::ASSIGNED);
        Ok(())
    }

    pub fn assign_string(&mut self, s: String) -> VmResult<()> {
        self.check_mutable()?;
        self.data = ValueData::Str(s);
        self.flags.insert(ValueFlags::ASSIGNED);
        Ok(())
    }

    pub fn empty_vector(&mut self) -> VmResult<()> {
        self.check_mutable()?;
        self.data = ValueData::Vector(Vec::new());
        self.flags.insert(ValueFlags::ASSIGNED);
        Ok(())
    }

    pub fn empty_table(&mut self) -> VmResult<()> {
        self.check_mutable()?;
        self.data = ValueData::Table(new_table());
        self.flags.insert(ValueFlags::ASSIGNED);
        Ok(())
    }

    /// Extends a vector with trailing `null` elements so it has at least `n` entries,
    /// switching the payload to an (empty) vector first if it was not one already.
    pub fn resize(&mut self, n: usize) -> VmResult<()> {
        self.check_mutable()?;
        if !matches!(self.data, ValueData::Vector(_)) {
            self.data = ValueData::Vector(Vec::new());
        }
        if let ValueData::Vector(items) = &mut self.data {
            while items.len() < n {
                items.push(Value::null().cell());
            }
        }
        self.flags.insert(ValueFlags::ASSIGNED);
        Ok(())
    }

    /// Makes `self` a non-owning alias of `target`.
    pub fn assign_reference(&mut self, target: ValueRef) -> VmResult<()> {
        self.check_mutable()?;
        self.data = ValueData::Reference(target);
        self.flags.insert(ValueFlags::ASSIGNED);
        Ok(())
    }

    pub fn assign_code_function(&mut self, handle: CodeFunctionHandle) -> VmResult<()> {
        self.check_mutable()?;
        self.data = ValueData::CodeFunction(handle);
        self.flags.insert(ValueFlags::ASSIGNED);
        Ok(())
    }

    pub fn assign_external_function(&mut self, f: Rc<dyn HostFunction>) -> VmResult<()> {
        self.check_mutable()?;
        self.data = ValueData::ExternalFunction(f);
        self.flags.insert(ValueFlags::ASSIGNED);
        Ok(())
    }

    pub fn assign_internal_function(&mut self, address: u32) -> VmResult<()> {
        self.check_mutable()?;
        self.data = ValueData::InternalFunction(address);
        self.flags.insert(ValueFlags::ASSIGNED);
        Ok(())
    }

    /// Deep-copies `src`'s dereferenced payload into `self`, respecting the constant
    /// flag. Used by `PSH`, `DUP`, `WR` and argument/return-value passing.
    pub fn deep_copy_from(&mut self, src: &Value) -> VmResult<()> {
        self.check_mutable()?;
        self.data = deep_copy_data(&src.data);
        self.flags.insert(ValueFlags::ASSIGNED);
        Ok(())
    }

    pub fn deep_clone(&self) -> Value {
        Value {
            data: deep_copy_data(&self.data),
            flags: self.flags,
        }
    }

    // --- container access --------------------------------------------------

    pub fn as_vector(&self) -> Option<&Vec<ValueRef>> {
        match &self.data {
            ValueData::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_vector_mut(&mut self) -> Option<&mut Vec<ValueRef>> {
        match &mut self.data {
            ValueData::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&HashMap<String, ValueRef>> {
        match &self.data {
            ValueData::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_table_mut(&mut self) -> Option<&mut HashMap<String, ValueRef>> {
        match &mut self.data {
            ValueData::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn code_function(&self) -> Option<CodeFunctionHandle> {
        match &self.data {
            ValueData::CodeFunction(h) => Some(*h),
            _ => None,
        }
    }

    pub fn external_function(&self) -> Option<Rc<dyn HostFunction>> {
        match &self.data {
            ValueData::ExternalFunction(f) => Some(f.clone()),
            _ => None,
        }
    }

    pub fn internal_function_address(&self) -> Option<u32> {
        match &self.data {
            ValueData::InternalFunction(a) => Some(*a),
            _ => None,
        }
    }

    /// Returns the cell for vector element `i`, growing the vector first when `i` is
    /// out of range and `self` is not yet a vector (the `IDX` opcode's mutable mode).
    pub fn index(&self, i: usize) -> VmResult<ValueRef> {
        match &self.data {
            ValueData::Vector(v) => v.get(i).cloned().ok_or(VmError::OutOfBounds {
                what: "vector",
                index: i,
                len: v.len(),
            }),
            other => Err(VmError::TypeError {
                op: "index".into(),
                reason: format!("expected vector, found {}", type_name_of(other)),
            }),
        }
    }

    /// Table lookup; returns `None` if the key is absent (the `KEY` opcode's read-only
    /// mode leaves insertion to the caller, mirroring `lookup` vs `hash_item`).
    pub fn lookup(&self, key: &str) -> Option<ValueRef> {
        match &self.data {
            ValueData::Table(t) => t.get(key).cloned(),
            _ => None,
        }
    }

    /// Inserts a fresh `null` entry if `key` is absent and returns its cell either way.
    pub fn hash_item(&mut self, key: &str) -> VmResult<ValueRef> {
        if !matches!(self.data, ValueData::Table(_)) {
            return Err(VmError::TypeError {
                op: "hash_item".into(),
                reason: format!("expected table, found {}", type_name_of(&self.data)),
            });
        }
        if let ValueData::Table(t) = &mut self.data {
            Ok(t.entry(key.to_string())
                .or_insert_with(|| Value::null().cell())
                .clone())
        } else {
            unreachable!()
        }
    }

    /// Erases a table entry or vector element (the `MAT` opcode).
    pub fn remove(&mut self, selector: &Value) -> VmResult<()> {
        match &mut self.data {
            ValueData::Table(t) => {
                t.remove(&selector.as_string());
                Ok(())
            }
            ValueData::Vector(v) => {
                let idx = selector.as_unsigned();
                if idx < v.len() {
                    v.remove(idx);
                }
                Ok(())
            }
            other => Err(VmError::TypeError {
                op: "mat".into(),
                reason: format!("expected table or vector, found {}", type_name_of(other)),
            }),
        }
    }
}

fn type_name_of(data: &ValueData) -> &'static str {
    match data {
        ValueData::Null => "null",
        ValueData::Reference(_) => "reference",
        ValueData::Number(_) => "number",
        ValueData::Str(_) => "string",
        ValueData::Vector(_) => "vector",
        ValueData::Table(_) => "table",
        ValueData::CodeFunction(_) => "function",
        ValueData::ExternalFunction(_) => "function",
        ValueData::InternalFunction(_) => "function",
    }
}

fn deep_copy_data(src: &ValueData) -> ValueData {
    match src {
        ValueData::Null => ValueData::Null,
        ValueData::Reference(r) => ValueData::Reference(r.clone()),
        ValueData::Number(n) => ValueData::Number(*n),
        ValueData::Str(s) => ValueData::Str(s.clone()),
        ValueData::Vector(items) => {
            ValueData::Vector(items.iter().map(|c| c.borrow().deep_clone().cell()).collect())
        }
        ValueData::Table(table) => {
            let mut fresh = new_table();
            for (k, v) in table.iter() {
                fresh.insert(k.clone(), v.borrow().deep_clone().cell());
            }
            ValueData::Table(fresh)
        }
        ValueData::CodeFunction(h) => ValueData::CodeFunction(*h),
        ValueData::ExternalFunction(f) => ValueData::ExternalFunction(f.clone()),
        ValueData::InternalFunction(a) => ValueData::InternalFunction(*a),
    }
}

/// Numbers print as integers when they round-trip exactly, else as `%g` with 6
/// significant digits (not 6 decimal places — fixed-point truncation gives the
/// wrong digit count for large or very small magnitudes).
fn format_number(n: f64) -> String {
    if n.is_finite() && n == (n as i64) as f64 {
        format!("{}", n as i64)
    } else {
        format_general(n, 6)
    }
}

/// Emulates C's `%g` with the given significant-digit precision: fixed-point
/// notation unless the exponent is below -4 or at/above `precision`, trailing
/// fractional zeros trimmed either way.
fn format_general(n: f64, precision: usize) -> String {
    if n == 0.0 {
        return "0".to_string();
    }
    let exponent = n.abs().log10().floor() as i32;
    if exponent < -4 || exponent >= precision as i32 {
        let mantissa_digits = precision.saturating_sub(1);
        let formatted = format!("{n:.mantissa_digits$e}");
        let (mantissa, exp) = formatted.split_once('e').expect("scientific notation always has an exponent");
        let exp: i32 = exp.parse().expect("exponent is always a valid integer");
        let mantissa = trim_trailing_fraction(mantissa);
        format!("{mantissa}e{}{:02}", if exp < 0 { '-' } else { '+' }, exp.abs())
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim_trailing_fraction(&format!("{n:.decimals$}")).to_string()
    }
}

fn trim_trailing_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_integer_numbers_print_with_six_significant_digits() {
        assert_eq!(Value::new_number(123456.789).as_string(), "123457");
        assert_eq!(Value::new_number(0.0001234567).as_string(), "0.000123457");
        assert_eq!(Value::new_number(123456789.0 + 0.5).as_string(), "1.23457e+08");
        assert_eq!(Value::new_number(0.00001234567).as_string(), "1.23457e-05");
        assert_eq!(Value::new_number(-2.5).as_string(), "-2.5");
    }

    #[test]
    fn truth_table() {
        assert!(!Value::null().as_boolean());
        assert!(!Value::new_number(0.0).as_boolean());
        assert!(Value::new_number(1.0).as_boolean());
        assert!(!Value::new_string("false").as_boolean());
        assert!(!Value::new_string("F").as_boolean());
        assert!(Value::new_string("yes").as_boolean());
    }

    #[test]
    fn deep_copy_is_independent() {
        let mut original = Value::null();
        original.empty_vector().unwrap();
        original
            .as_vector_mut()
            .unwrap()
            .push(Value::new_number(1.0).cell());

        let mut copy = Value::null();
        copy.deep_copy_from(&original).unwrap();
        copy.as_vector_mut().unwrap()[0]
            .borrow_mut()
            .assign_number(99.0)
            .unwrap();

        assert_eq!(original.as_vector().unwrap()[0].borrow().as_number(), 1.0);
        assert_eq!(copy.as_vector().unwrap()[0].borrow().as_number(), 99.0);
    }

    #[test]
    fn constant_rejects_mutation_once_assigned() {
        let mut v = Value::null();
        v.set_flag(ValueFlags::CONSTANT);
        assert!(v.deep_copy_from(&Value::new_number(1.0)).is_ok());
        assert!(matches!(
            v.deep_copy_from(&Value::new_number(2.0)),
            Err(VmError::ConstantViolation)
        ));
    }

    #[test]
    fn self_referential_chain_errors() {
        let cell = Value::null().cell();
        cell.borrow_mut().assign_reference(cell.clone()).unwrap();
        assert!(matches!(Value::deref_cell(&cell), Err(VmError::SelfReference)));
    }

    #[test]
    fn division_by_zero_is_nan_not_error() {
        let zero = 0.0_f64;
        let n = zero / zero;
        assert!(n.is_nan());
        assert_ne!(n, n);
    }
}
