//! Runtime values and the VBScript conversion functions (`CBool`, `CInt`,
//! `CStr`, ...).

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use super::array::VbArray;
use super::date;
use super::error::RuntimeError;
use super::object::ObjectRef;

pub type ArrayRef = Rc<RefCell<VbArray>>;

/// A dynamically typed VBScript value (a Variant).
#[derive(Clone, Default)]
pub enum Value {
    /// Uninitialized. Also the "null sentinel" of the operator rules.
    #[default]
    Empty,
    Null,
    Nothing,
    Boolean(bool),
    Integer(i16),
    Long(i32),
    LongLong(i64),
    Single(f32),
    Double(f64),
    Decimal(Decimal),
    /// OLE automation date.
    Date(f64),
    String(Rc<str>),
    Array(ArrayRef),
    Object(ObjectRef),
}

/// The concrete runtime type of a value. Drives operator target selection
/// and binder guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VbType {
    Empty,
    Null,
    Boolean,
    Integer,
    Long,
    LongLong,
    Single,
    Double,
    Decimal,
    Date,
    String,
    Array,
    Object,
}

impl VbType {
    /// Position on the widening ladder; `None` for non-numeric types.
    pub fn rank(self) -> Option<u8> {
        match self {
            VbType::Boolean => Some(0),
            VbType::Integer => Some(1),
            VbType::Long => Some(2),
            VbType::LongLong => Some(3),
            VbType::Single => Some(4),
            VbType::Double => Some(5),
            VbType::Decimal => Some(6),
            VbType::Date => Some(7),
            _ => None,
        }
    }

    pub fn is_primitive(self) -> bool {
        self.rank().is_some() || self == VbType::String
    }

    pub fn name(self) -> &'static str {
        match self {
            VbType::Empty => "Empty",
            VbType::Null => "Null",
            VbType::Boolean => "Boolean",
            VbType::Integer => "Integer",
            VbType::Long => "Long",
            VbType::LongLong => "LongLong",
            VbType::Single => "Single",
            VbType::Double => "Double",
            VbType::Decimal => "Decimal",
            VbType::Date => "Date",
            VbType::String => "String",
            VbType::Array => "Variant()",
            VbType::Object => "Object",
        }
    }
}

impl fmt::Display for VbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── VarType constants ────────────────────────────────────────────

pub const VT_EMPTY: i32 = 0;
pub const VT_NULL: i32 = 1;
pub const VT_INTEGER: i32 = 2;
pub const VT_LONG: i32 = 3;
pub const VT_SINGLE: i32 = 4;
pub const VT_DOUBLE: i32 = 5;
pub const VT_CURRENCY: i32 = 6;
pub const VT_DATE: i32 = 7;
pub const VT_STRING: i32 = 8;
pub const VT_OBJECT: i32 = 9;
pub const VT_ERROR: i32 = 10;
pub const VT_BOOLEAN: i32 = 11;
pub const VT_VARIANT: i32 = 12;
pub const VT_DECIMAL: i32 = 14;
pub const VT_BYTE: i32 = 17;
pub const VT_LONGLONG: i32 = 20;
pub const VT_ARRAY: i32 = 8192;

impl Value {
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn array(arr: VbArray) -> Self {
        Value::Array(Rc::new(RefCell::new(arr)))
    }

    pub fn vb_type(&self) -> VbType {
        match self {
            Value::Empty => VbType::Empty,
            Value::Null => VbType::Null,
            Value::Nothing | Value::Object(_) => VbType::Object,
            Value::Boolean(_) => VbType::Boolean,
            Value::Integer(_) => VbType::Integer,
            Value::Long(_) => VbType::Long,
            Value::LongLong(_) => VbType::LongLong,
            Value::Single(_) => VbType::Single,
            Value::Double(_) => VbType::Double,
            Value::Decimal(_) => VbType::Decimal,
            Value::Date(_) => VbType::Date,
            Value::String(_) => VbType::String,
            Value::Array(_) => VbType::Array,
        }
    }

    /// Empty, Null and Nothing all count as the null sentinel for operators.
    pub fn is_null_like(&self) -> bool {
        matches!(self, Value::Empty | Value::Null | Value::Nothing)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_) | Value::Nothing)
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// The value a plain (non-`Set`) assignment stores. Arrays have value
    /// semantics in VBScript and are copied.
    pub fn assigned(self) -> Value {
        match self {
            Value::Array(a) => {
                let copy = a.borrow().clone();
                Value::array(copy)
            }
            other => other,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::Nothing => "Nothing".to_string(),
            Value::Object(o) => o.type_name(),
            other => other.vb_type().name().to_string(),
        }
    }

    pub fn var_type(&self) -> i32 {
        match self {
            Value::Empty => VT_EMPTY,
            Value::Null => VT_NULL,
            Value::Nothing | Value::Object(_) => VT_OBJECT,
            Value::Boolean(_) => VT_BOOLEAN,
            Value::Integer(_) => VT_INTEGER,
            Value::Long(_) => VT_LONG,
            Value::LongLong(_) => VT_LONGLONG,
            Value::Single(_) => VT_SINGLE,
            Value::Double(_) => VT_DOUBLE,
            Value::Decimal(_) => VT_DECIMAL,
            Value::Date(_) => VT_DATE,
            Value::String(_) => VT_STRING,
            Value::Array(_) => VT_ARRAY + VT_VARIANT,
        }
    }

    /// Printable form used when a non-primitive operand has to be compared
    /// as text. Never fails.
    pub fn repr_string(&self) -> String {
        match self {
            Value::Object(o) => o.type_name(),
            Value::Array(_) => "Variant()".to_string(),
            Value::Nothing => "Nothing".to_string(),
            Value::Null => "Null".to_string(),
            other => to_str(other).map_or_else(|_| String::new(), |s| s.to_string()),
        }
    }

    /// Object identity; primitives are never identical.
    pub fn same_object(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Nothing, Value::Nothing) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => write!(f, "Empty"),
            Value::Null => write!(f, "Null"),
            Value::Nothing => write!(f, "Nothing"),
            Value::Boolean(b) => write!(f, "Boolean({b})"),
            Value::Integer(n) => write!(f, "Integer({n})"),
            Value::Long(n) => write!(f, "Long({n})"),
            Value::LongLong(n) => write!(f, "LongLong({n})"),
            Value::Single(n) => write!(f, "Single({n})"),
            Value::Double(n) => write!(f, "Double({n})"),
            Value::Decimal(n) => write!(f, "Decimal({n})"),
            Value::Date(d) => write!(f, "Date({})", date::format(*d)),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Array(a) => write!(f, "Array({:?})", a.borrow().dims()),
            Value::Object(o) => write!(f, "Object({})", o.type_name()),
        }
    }
}

/// Structural equality for tests and constant folding; objects compare by
/// identity, arrays by content.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Empty, Value::Empty) | (Value::Null, Value::Null) | (Value::Nothing, Value::Nothing) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::LongLong(a), Value::LongLong(b)) => a == b,
            (Value::Single(a), Value::Single(b)) => a == b,
            (Value::Double(a), Value::Double(b)) | (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i16> for Value {
    fn from(n: i16) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Long(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::LongLong(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

// ── Numeric text ─────────────────────────────────────────────────

/// Parse text the way VBScript's numeric coercion does: surrounding
/// whitespace, sign, decimal point, exponent, `&H`/`&O` prefixes.
pub fn parse_numeric(text: &str) -> Option<f64> {
    let t = text.trim();
    if t.is_empty() {
        return None;
    }
    let lower = t.to_ascii_lowercase();
    if let Some(hex) = lower.strip_prefix("&h") {
        return i64::from_str_radix(hex, 16).ok().map(|v| v as f64);
    }
    if let Some(oct) = lower.strip_prefix("&o") {
        return i64::from_str_radix(oct, 8).ok().map(|v| v as f64);
    }
    let valid = t
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
    if !valid || !t.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    t.parse::<f64>().ok()
}

/// Round half to even, as every VBScript integer conversion does.
pub fn round_half_even(v: f64) -> f64 {
    v.round_ties_even()
}

/// Format a Double the way `CStr` does: up to 15 significant digits,
/// exponent form for very large or very small magnitudes.
pub fn format_double(v: f64) -> String {
    if v.is_nan() {
        return "NaN".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() };
    }
    if v == 0.0 {
        return "0".to_string();
    }
    let abs = v.abs();
    if !(1e-4..1e15).contains(&abs) {
        let s = format!("{:.14E}", v);
        let (mantissa, exp) = s.split_once('E').unwrap_or((s.as_str(), "0"));
        let mantissa = trim_fraction(mantissa);
        let exp: i32 = exp.parse().unwrap_or(0);
        let sign = if exp < 0 { '-' } else { '+' };
        return format!("{mantissa}E{sign}{:02}", exp.abs());
    }
    let rounded: f64 = format!("{:.14e}", v).parse().unwrap_or(v);
    if rounded.fract() == 0.0 {
        format!("{}", rounded as i64)
    } else {
        format!("{rounded}")
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

// ── Conversions ──────────────────────────────────────────────────

/// Resolve a host object's parameterless default member until a
/// non-object value is reached. Script class instances are resolved by the
/// VM before values reach these helpers.
pub fn unwrap_default(value: &Value) -> Result<Value, RuntimeError> {
    let mut current = value.clone();
    for _ in 0..32 {
        match &current {
            Value::Object(ObjectRef::Host(h)) => match super::object::host_default_value(h.as_ref()) {
                Some(next) => current = next?,
                None => return Ok(current),
            },
            _ => return Ok(current),
        }
    }
    Err(RuntimeError::type_mismatch("default member"))
}

fn scalar(value: &Value, func: &str) -> Result<Value, RuntimeError> {
    match value {
        Value::Object(_) => {
            let v = unwrap_default(value)?;
            if matches!(v, Value::Object(_)) {
                Err(RuntimeError::type_mismatch(func))
            } else {
                Ok(v)
            }
        }
        Value::Array(_) | Value::Nothing => Err(RuntimeError::type_mismatch(func)),
        other => Ok(other.clone()),
    }
}

pub fn to_f64(value: &Value) -> Result<f64, RuntimeError> {
    match scalar(value, "CDbl")? {
        Value::Empty => Ok(0.0),
        Value::Null => Err(RuntimeError::invalid_null()),
        Value::Boolean(b) => Ok(if b { -1.0 } else { 0.0 }),
        Value::Integer(n) => Ok(f64::from(n)),
        Value::Long(n) => Ok(f64::from(n)),
        Value::LongLong(n) => Ok(n as f64),
        Value::Single(n) => Ok(f64::from(n)),
        Value::Double(n) | Value::Date(n) => Ok(n),
        Value::Decimal(d) => d.to_f64().ok_or_else(RuntimeError::overflow),
        Value::String(s) => parse_numeric(&s)
            .or_else(|| parse_bool_text(&s).map(|b| if b { -1.0 } else { 0.0 }))
            .ok_or_else(|| RuntimeError::type_mismatch(format!("\"{s}\""))),
        Value::Nothing | Value::Array(_) | Value::Object(_) => Err(RuntimeError::type_mismatch("CDbl")),
    }
}

pub fn to_f32(value: &Value) -> Result<f32, RuntimeError> {
    let v = to_f64(value)?;
    if v.is_finite() && v.abs() > f64::from(f32::MAX) {
        return Err(RuntimeError::overflow());
    }
    Ok(v as f32)
}

pub fn to_i64(value: &Value) -> Result<i64, RuntimeError> {
    match scalar(value, "CLng")? {
        Value::Integer(n) => Ok(i64::from(n)),
        Value::Long(n) => Ok(i64::from(n)),
        Value::LongLong(n) => Ok(n),
        Value::Boolean(b) => Ok(if b { -1 } else { 0 }),
        Value::Decimal(d) => d
            .round_dp_with_strategy(0, rust_decimal::RoundingStrategy::MidpointNearestEven)
            .to_i64()
            .ok_or_else(RuntimeError::overflow),
        other => {
            let f = round_half_even(to_f64(&other)?);
            if f >= -9.223_372_036_854_775_808e18 && f < 9.223_372_036_854_775_808e18 {
                Ok(f as i64)
            } else {
                Err(RuntimeError::overflow())
            }
        }
    }
}

pub fn to_i32(value: &Value) -> Result<i32, RuntimeError> {
    i32::try_from(to_i64(value)?).map_err(|_| RuntimeError::overflow())
}

pub fn to_i16(value: &Value) -> Result<i16, RuntimeError> {
    i16::try_from(to_i64(value)?).map_err(|_| RuntimeError::overflow())
}

pub fn to_u8(value: &Value) -> Result<u8, RuntimeError> {
    u8::try_from(to_i64(value)?).map_err(|_| RuntimeError::overflow())
}

pub fn to_decimal(value: &Value) -> Result<Decimal, RuntimeError> {
    match scalar(value, "CCur")? {
        Value::Decimal(d) => Ok(d),
        Value::Integer(n) => Ok(Decimal::from(n)),
        Value::Long(n) => Ok(Decimal::from(n)),
        Value::LongLong(n) => Ok(Decimal::from(n)),
        Value::Boolean(b) => Ok(if b { Decimal::NEGATIVE_ONE } else { Decimal::ZERO }),
        Value::String(s) => Decimal::from_str(s.trim())
            .or_else(|_| {
                parse_numeric(&s)
                    .and_then(Decimal::from_f64)
                    .ok_or_else(|| RuntimeError::type_mismatch(format!("\"{s}\"")))
            }),
        other => Decimal::from_f64(to_f64(&other)?).ok_or_else(RuntimeError::overflow),
    }
}

fn parse_bool_text(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "#true#" => Some(true),
        "false" | "#false#" => Some(false),
        _ => None,
    }
}

/// `CBool`.
pub fn to_bool(value: &Value) -> Result<bool, RuntimeError> {
    match scalar(value, "CBool")? {
        Value::Empty => Ok(false),
        Value::Null => Err(RuntimeError::invalid_null()),
        Value::Boolean(b) => Ok(b),
        Value::Integer(n) => Ok(n != 0),
        Value::Long(n) => Ok(n != 0),
        Value::LongLong(n) => Ok(n != 0),
        Value::Single(n) => Ok(n != 0.0),
        Value::Double(n) | Value::Date(n) => Ok(n != 0.0),
        Value::Decimal(d) => Ok(!d.is_zero()),
        Value::String(s) => parse_bool_text(&s)
            .or_else(|| parse_numeric(&s).map(|n| n != 0.0))
            .ok_or_else(|| RuntimeError::type_mismatch(format!("\"{s}\""))),
        Value::Nothing | Value::Array(_) | Value::Object(_) => Err(RuntimeError::type_mismatch("CBool")),
    }
}

/// Truthiness of a condition (`If`, `While`): Null and Empty are false.
pub fn is_truthy(value: &Value) -> Result<bool, RuntimeError> {
    match value {
        Value::Null | Value::Empty => Ok(false),
        other => to_bool(other),
    }
}

/// `CStr`.
pub fn to_str(value: &Value) -> Result<Rc<str>, RuntimeError> {
    match scalar(value, "CStr")? {
        Value::String(s) => Ok(s),
        Value::Empty => Ok(Rc::from("")),
        Value::Null => Err(RuntimeError::invalid_null()),
        Value::Boolean(b) => Ok(Rc::from(if b { "True" } else { "False" })),
        Value::Integer(n) => Ok(Rc::from(n.to_string())),
        Value::Long(n) => Ok(Rc::from(n.to_string())),
        Value::LongLong(n) => Ok(Rc::from(n.to_string())),
        Value::Single(n) => Ok(Rc::from(format_double(format!("{n}").parse().unwrap_or(f64::from(n))))),
        Value::Double(n) => Ok(Rc::from(format_double(n))),
        Value::Decimal(d) => Ok(Rc::from(d.normalize().to_string())),
        Value::Date(d) => Ok(Rc::from(date::format(d))),
        Value::Nothing | Value::Array(_) | Value::Object(_) => Err(RuntimeError::type_mismatch("CStr")),
    }
}

/// `CDate`.
pub fn to_date(value: &Value) -> Result<f64, RuntimeError> {
    match scalar(value, "CDate")? {
        Value::Date(d) => Ok(d),
        Value::String(s) => date::parse(&s)
            .or_else(|| parse_numeric(&s))
            .ok_or_else(|| RuntimeError::type_mismatch(format!("\"{s}\""))),
        other => to_f64(&other),
    }
}

/// Convert to the given primitive type. Used by the operator rules once a
/// target type has been chosen.
pub fn convert_to(value: &Value, target: VbType) -> Result<Value, RuntimeError> {
    Ok(match target {
        VbType::Boolean => Value::Boolean(to_bool(value)?),
        VbType::Integer => Value::Integer(to_i16(value)?),
        VbType::Long => Value::Long(to_i32(value)?),
        VbType::LongLong => Value::LongLong(to_i64(value)?),
        VbType::Single => Value::Single(to_f32(value)?),
        VbType::Double => Value::Double(to_f64(value)?),
        VbType::Decimal => Value::Decimal(to_decimal(value)?),
        VbType::Date => Value::Date(to_date(value)?),
        VbType::String => Value::String(to_str(value)?),
        VbType::Empty | VbType::Null | VbType::Array | VbType::Object => {
            return Err(RuntimeError::type_mismatch(target.name()))
        }
    })
}

/// `IsNumeric`.
pub fn is_numeric(value: &Value) -> bool {
    match value {
        Value::Empty
        | Value::Boolean(_)
        | Value::Integer(_)
        | Value::Long(_)
        | Value::LongLong(_)
        | Value::Single(_)
        | Value::Double(_)
        | Value::Decimal(_) => true,
        Value::String(s) => parse_numeric(s).is_some(),
        _ => false,
    }
}

/// Narrow an integral result to the smallest of Integer/Long/Double that
/// holds it.
pub fn integral(n: i64, prefer_integer: bool) -> Value {
    if prefer_integer {
        if let Ok(v) = i16::try_from(n) {
            return Value::Integer(v);
        }
    }
    match i32::try_from(n) {
        Ok(v) => Value::Long(v),
        Err(_) => Value::Double(n as f64),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn numeric_text() {
        assert_eq!(parse_numeric(" 42 "), Some(42.0));
        assert_eq!(parse_numeric("&HFF"), Some(255.0));
        assert_eq!(parse_numeric("1.5e3"), Some(1500.0));
        assert_eq!(parse_numeric("abc"), None);
        assert_eq!(parse_numeric(""), None);
        assert_eq!(parse_numeric("inf"), None);
    }

    #[test]
    fn bankers_rounding() {
        assert_eq!(round_half_even(2.5), 2.0);
        assert_eq!(round_half_even(3.5), 4.0);
        assert_eq!(round_half_even(-2.5), -2.0);
        assert_eq!(round_half_even(2.6), 3.0);
        assert_eq!(to_i32(&Value::Double(0.5)).unwrap(), 0);
        assert_eq!(to_i32(&Value::Double(1.5)).unwrap(), 2);
    }

    #[test]
    fn booleans_are_minus_one() {
        assert_eq!(to_f64(&Value::Boolean(true)).unwrap(), -1.0);
        assert_eq!(&*to_str(&Value::Boolean(false)).unwrap(), "False");
        assert!(to_bool(&Value::from("true")).unwrap());
        assert!(to_bool(&Value::from("0")).is_ok_and(|b| !b));
    }

    #[test]
    fn cstr_of_doubles() {
        assert_eq!(format_double(3.0), "3");
        assert_eq!(format_double(0.1 + 0.2), "0.3");
        assert_eq!(format_double(1e20), "1E+20");
        assert_eq!(format_double(-2.5), "-2.5");
        assert_eq!(format_double(1.5e-7), "1.5E-07");
    }

    #[test]
    fn conversion_failures() {
        assert_eq!(to_i32(&Value::from("x")).unwrap_err().number, 13);
        assert_eq!(to_i16(&Value::Long(40_000)).unwrap_err().number, 6);
        assert_eq!(to_f64(&Value::Null).unwrap_err().number, 94);
        assert_eq!(to_i32(&Value::Empty).unwrap(), 0);
    }

    #[test]
    fn assignment_copies_arrays() {
        let original = Value::array(VbArray::new(&[3]).unwrap());
        let copy = original.clone().assigned();
        if let (Value::Array(a), Value::Array(b)) = (&original, &copy) {
            assert!(!Rc::ptr_eq(a, b));
        } else {
            panic!("expected arrays");
        }
    }

    #[test]
    fn integral_narrowing() {
        assert_eq!(integral(3, true), Value::Integer(3));
        assert_eq!(integral(40_000, true), Value::Long(40_000));
        assert_eq!(integral(3, false), Value::Long(3));
        assert_eq!(integral(i64::from(i32::MAX) + 1, false), Value::Double(2_147_483_648.0));
    }
}
