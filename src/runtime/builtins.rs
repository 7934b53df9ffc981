//! The VBScript function library and its named constants.
//!
//! Builtins are plain functions over already-evaluated arguments. Anything
//! that needs the executing program (`CreateObject`, the `Err` object) is
//! handled by the VM instead.

use std::rc::Rc;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

use super::array::VbArray;
use super::date;
use super::error::RuntimeError;
use super::value::{self, Value};
use crate::script::ast::Literal;

type BuiltinFn = fn(&[Value]) -> Result<Value, RuntimeError>;

pub struct Builtin {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    /// Receives object arguments as they are. Other builtins get an
    /// instance's default value.
    pub accepts_objects: bool,
    pub call: BuiltinFn,
}

impl std::fmt::Debug for Builtin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builtin").field("name", &self.name).finish_non_exhaustive()
    }
}

const fn builtin(name: &'static str, min_args: usize, max_args: usize, call: BuiltinFn) -> Builtin {
    Builtin {
        name,
        min_args,
        max_args,
        accepts_objects: false,
        call,
    }
}

const fn inspect(name: &'static str, call: BuiltinFn) -> Builtin {
    Builtin {
        name,
        min_args: 1,
        max_args: 1,
        accepts_objects: true,
        call,
    }
}

pub static BUILTINS: &[Builtin] = &[
    // Conversion
    builtin("CBool", 1, 1, |a| Ok(Value::Boolean(value::to_bool(&a[0])?))),
    builtin("CByte", 1, 1, |a| Ok(Value::Integer(i16::from(value::to_u8(&a[0])?)))),
    builtin("CInt", 1, 1, |a| Ok(Value::Integer(value::to_i16(&a[0])?))),
    builtin("CLng", 1, 1, |a| Ok(Value::Long(value::to_i32(&a[0])?))),
    builtin("CSng", 1, 1, |a| Ok(Value::Single(value::to_f32(&a[0])?))),
    builtin("CDbl", 1, 1, |a| Ok(Value::Double(value::to_f64(&a[0])?))),
    builtin("CStr", 1, 1, |a| Ok(Value::String(value::to_str(&a[0])?))),
    builtin("CDate", 1, 1, |a| Ok(Value::Date(value::to_date(&a[0])?))),
    builtin("CCur", 1, 1, c_cur),
    // Inspection
    inspect("IsEmpty", |a| Ok(Value::Boolean(matches!(a[0], Value::Empty)))),
    inspect("IsNull", |a| Ok(Value::Boolean(matches!(a[0], Value::Null)))),
    builtin("IsNumeric", 1, 1, |a| Ok(Value::Boolean(value::is_numeric(&a[0])))),
    inspect("IsArray", |a| Ok(Value::Boolean(matches!(a[0], Value::Array(_))))),
    inspect("IsObject", |a| Ok(Value::Boolean(a[0].is_object()))),
    builtin("IsDate", 1, 1, is_date),
    inspect("TypeName", |a| Ok(Value::from(a[0].type_name()))),
    inspect("VarType", |a| Ok(Value::Integer(a[0].var_type() as i16))),
    // Strings
    builtin("Len", 1, 1, len),
    builtin("Left", 2, 2, left),
    builtin("Right", 2, 2, right),
    builtin("Mid", 2, 3, mid),
    builtin("UCase", 1, 1, |a| map_text(&a[0], |s| s.to_uppercase())),
    builtin("LCase", 1, 1, |a| map_text(&a[0], |s| s.to_lowercase())),
    builtin("Trim", 1, 1, |a| map_text(&a[0], |s| s.trim_matches(' ').to_string())),
    builtin("LTrim", 1, 1, |a| map_text(&a[0], |s| s.trim_start_matches(' ').to_string())),
    builtin("RTrim", 1, 1, |a| map_text(&a[0], |s| s.trim_end_matches(' ').to_string())),
    builtin("InStr", 2, 4, in_str),
    builtin("InStrRev", 2, 4, in_str_rev),
    builtin("Replace", 3, 6, replace),
    builtin("Split", 1, 4, split),
    builtin("Join", 1, 2, join),
    builtin("Space", 1, 1, |a| Ok(Value::from(" ".repeat(count(&a[0])?)))),
    builtin("String", 2, 2, string),
    builtin("StrReverse", 1, 1, |a| map_text(&a[0], |s| s.chars().rev().collect())),
    builtin("StrComp", 2, 3, str_comp),
    builtin("Chr", 1, 1, chr),
    builtin("Asc", 1, 1, asc),
    builtin("Hex", 1, 1, |a| radix(&a[0], 16)),
    builtin("Oct", 1, 1, |a| radix(&a[0], 8)),
    // Math
    builtin("Abs", 1, 1, abs),
    builtin("Int", 1, 1, |a| integer_part(&a[0], f64::floor, Decimal::floor)),
    builtin("Fix", 1, 1, |a| integer_part(&a[0], f64::trunc, Decimal::trunc)),
    builtin("Round", 1, 2, round),
    builtin("Sqr", 1, 1, sqr),
    builtin("Sgn", 1, 1, sgn),
    // Arrays
    Builtin {
        name: "Array",
        min_args: 0,
        max_args: usize::MAX,
        accepts_objects: true,
        call: |a| Ok(Value::array(VbArray::from_vec(a.to_vec()))),
    },
    builtin("UBound", 1, 2, |a| bound(a, VbArray::ubound)),
    builtin("LBound", 1, 2, |a| bound(a, VbArray::lbound)),
    // Dates
    builtin("Now", 0, 0, |_| Ok(Value::Date(date::now()))),
    builtin("Date", 0, 0, |_| Ok(Value::Date(date::now().floor()))),
    builtin("Year", 1, 1, |a| date_part(&a[0], |p| p.year)),
    builtin("Month", 1, 1, |a| date_part(&a[0], |p| i64::from(p.month))),
    builtin("Day", 1, 1, |a| date_part(&a[0], |p| i64::from(p.day))),
    builtin("DateSerial", 3, 3, date_serial),
];

/// Index of the builtin called `name`, case-insensitively.
pub fn lookup(name: &str) -> Option<usize> {
    BUILTINS.iter().position(|b| b.name.eq_ignore_ascii_case(name))
}

/// Value of a named VBScript constant (`vbCrLf`, `vbString`, ...).
pub fn constant(name: &str) -> Option<Literal> {
    let int = |n: i16| Some(Literal::Integer(n));
    let text = |s: &str| Some(Literal::String(s.to_string()));
    match name.to_ascii_lowercase().as_str() {
        "vbcrlf" | "vbnewline" => text("\r\n"),
        "vbcr" => text("\r"),
        "vblf" => text("\n"),
        "vbtab" => text("\t"),
        "vbnullstring" => text(""),
        "vbnullchar" => text("\0"),
        "vbtrue" => int(-1),
        "vbfalse" => int(0),
        "vbusedefault" => int(-2),
        "vbbinarycompare" => int(0),
        "vbtextcompare" => int(1),
        "vbempty" => int(0),
        "vbnull" => int(1),
        "vbinteger" => int(2),
        "vblong" => int(3),
        "vbsingle" => int(4),
        "vbdouble" => int(5),
        "vbcurrency" => int(6),
        "vbdate" => int(7),
        "vbstring" => int(8),
        "vbobject" => int(9),
        "vberror" => int(10),
        "vbboolean" => int(11),
        "vbvariant" => int(12),
        "vbdecimal" => int(14),
        "vbbyte" => int(17),
        "vbarray" => int(8192),
        "vbobjecterror" => Some(Literal::Long(-2_147_221_504)),
        _ => None,
    }
}

/// Whether `name` is a builtin function or constant.
pub fn is_known(name: &str) -> bool {
    lookup(name).is_some() || constant(name).is_some() || name.eq_ignore_ascii_case("CreateObject")
}

// ── Helpers ──────────────────────────────────────────────────────

/// The argument as text, or `None` for Null (which most string functions
/// propagate).
fn text(v: &Value) -> Result<Option<Rc<str>>, RuntimeError> {
    match v {
        Value::Null => Ok(None),
        other => value::to_str(other).map(Some),
    }
}

fn map_text(v: &Value, f: impl FnOnce(&str) -> String) -> Result<Value, RuntimeError> {
    Ok(match text(v)? {
        Some(s) => Value::from(f(&s)),
        None => Value::Null,
    })
}

fn count(v: &Value) -> Result<usize, RuntimeError> {
    usize::try_from(value::to_i32(v)?).map_err(|_| RuntimeError::invalid_argument("negative length"))
}

fn long(n: usize) -> Value {
    Value::Long(i32::try_from(n).unwrap_or(i32::MAX))
}

/// `vbTextCompare` folds case.
fn text_compare(v: Option<&Value>) -> Result<bool, RuntimeError> {
    match v {
        None | Some(Value::Empty) => Ok(false),
        Some(v) => match value::to_i32(v)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(RuntimeError::invalid_argument("compare")),
        },
    }
}

fn fold(s: &str, text_mode: bool) -> Vec<char> {
    if text_mode {
        s.chars().map(|c| c.to_lowercase().next().unwrap_or(c)).collect()
    } else {
        s.chars().collect()
    }
}

fn find_chars(hay: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return (from <= hay.len()).then_some(from);
    }
    if needle.len() > hay.len() {
        return None;
    }
    (from..=hay.len() - needle.len()).find(|&i| hay[i..i + needle.len()] == *needle)
}

// ── Conversion ───────────────────────────────────────────────────

fn c_cur(a: &[Value]) -> Result<Value, RuntimeError> {
    let d = value::to_decimal(&a[0])?;
    Ok(Value::Decimal(d.round_dp_with_strategy(4, RoundingStrategy::MidpointNearestEven)))
}

fn is_date(a: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(match &a[0] {
        Value::Date(_) => true,
        Value::String(s) => date::parse(s).is_some(),
        _ => false,
    }))
}

// ── Strings ──────────────────────────────────────────────────────

fn len(a: &[Value]) -> Result<Value, RuntimeError> {
    Ok(match text(&a[0])? {
        Some(s) => long(s.chars().count()),
        None => Value::Null,
    })
}

fn left(a: &[Value]) -> Result<Value, RuntimeError> {
    let n = count(&a[1])?;
    map_text(&a[0], |s| s.chars().take(n).collect())
}

fn right(a: &[Value]) -> Result<Value, RuntimeError> {
    let n = count(&a[1])?;
    map_text(&a[0], |s| {
        let total = s.chars().count();
        s.chars().skip(total.saturating_sub(n)).collect()
    })
}

fn mid(a: &[Value]) -> Result<Value, RuntimeError> {
    let start = count(&a[1])?;
    if start == 0 {
        return Err(RuntimeError::invalid_argument("Mid start"));
    }
    let take = match a.get(2) {
        Some(n) => count(n)?,
        None => usize::MAX,
    };
    map_text(&a[0], |s| s.chars().skip(start - 1).take(take).collect())
}

fn in_str(a: &[Value]) -> Result<Value, RuntimeError> {
    // InStr([start, ]string1, string2[, compare])
    let (start, rest) = if a.len() >= 3 {
        (count(&a[0])?, &a[1..])
    } else {
        (1, a)
    };
    if start == 0 {
        return Err(RuntimeError::invalid_argument("InStr start"));
    }
    let (Some(hay), Some(needle)) = (text(&rest[0])?, text(&rest[1])?) else {
        return Ok(Value::Null);
    };
    let mode = text_compare(rest.get(2))?;
    let hay = fold(&hay, mode);
    if start > hay.len() + 1 {
        return Ok(Value::Long(0));
    }
    let found = find_chars(&hay, &fold(&needle, mode), start - 1);
    Ok(found.map_or(Value::Long(0), |i| long(i + 1)))
}

fn in_str_rev(a: &[Value]) -> Result<Value, RuntimeError> {
    // InStrRev(string1, string2[, start[, compare]])
    let (Some(hay), Some(needle)) = (text(&a[0])?, text(&a[1])?) else {
        return Ok(Value::Null);
    };
    let mode = text_compare(a.get(3))?;
    let hay = fold(&hay, mode);
    let needle = fold(&needle, mode);
    let start = match a.get(2) {
        Some(v) if value::to_i32(v)? != -1 => count(v)?,
        _ => hay.len(),
    };
    if start == 0 {
        return Err(RuntimeError::invalid_argument("InStrRev start"));
    }
    let limit = start.min(hay.len());
    if needle.len() > limit {
        return Ok(Value::Long(0));
    }
    let found = (0..=limit - needle.len()).rev().find(|&i| hay[i..i + needle.len()] == *needle);
    Ok(found.map_or(Value::Long(0), |i| long(i + 1)))
}

fn replace(a: &[Value]) -> Result<Value, RuntimeError> {
    let (Some(source), Some(find), Some(with)) = (text(&a[0])?, text(&a[1])?, text(&a[2])?) else {
        return Ok(Value::Null);
    };
    let start = match a.get(3) {
        Some(v) => count(v)?.max(1),
        None => 1,
    };
    let limit = match a.get(4) {
        Some(v) if value::to_i32(v)? >= 0 => count(v)?,
        _ => usize::MAX,
    };
    let mode = text_compare(a.get(5))?;
    let chars: Vec<char> = source.chars().skip(start - 1).collect();
    let folded = fold(&chars.iter().collect::<String>(), mode);
    let needle = fold(&find, mode);
    if needle.is_empty() || limit == 0 {
        return Ok(Value::from(chars.into_iter().collect::<String>()));
    }
    let mut out = String::new();
    let mut pos = 0;
    let mut done = 0;
    while done < limit {
        let Some(at) = find_chars(&folded, &needle, pos) else { break };
        out.extend(&chars[pos..at]);
        out.push_str(&with);
        pos = at + needle.len();
        done += 1;
    }
    out.extend(&chars[pos..]);
    Ok(Value::from(out))
}

fn split(a: &[Value]) -> Result<Value, RuntimeError> {
    let source = text(&a[0])?.ok_or_else(RuntimeError::invalid_null)?;
    let delimiter = match a.get(1) {
        Some(v) => value::to_str(v)?,
        None => Rc::from(" "),
    };
    let limit = match a.get(2) {
        Some(v) if value::to_i32(v)? >= 0 => count(v)?,
        _ => usize::MAX,
    };
    let mode = text_compare(a.get(3))?;
    if source.is_empty() || limit == 0 {
        return Ok(Value::array(VbArray::from_vec(Vec::new())));
    }
    let chars: Vec<char> = source.chars().collect();
    let folded = fold(&source, mode);
    let needle = fold(&delimiter, mode);
    let mut parts = Vec::new();
    let mut pos = 0;
    if !needle.is_empty() {
        while parts.len() + 1 < limit {
            let Some(at) = find_chars(&folded, &needle, pos) else { break };
            parts.push(Value::from(chars[pos..at].iter().collect::<String>()));
            pos = at + needle.len();
        }
    }
    parts.push(Value::from(chars[pos..].iter().collect::<String>()));
    Ok(Value::array(VbArray::from_vec(parts)))
}

fn join(a: &[Value]) -> Result<Value, RuntimeError> {
    let Value::Array(arr) = &a[0] else {
        return Err(RuntimeError::type_mismatch("Join"));
    };
    let delimiter = match a.get(1) {
        Some(v) => value::to_str(v)?,
        None => Rc::from(" "),
    };
    let parts = arr
        .borrow()
        .iter()
        .map(|v| value::to_str(v).map(|s| s.to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::from(parts.join(&delimiter)))
}

fn string(a: &[Value]) -> Result<Value, RuntimeError> {
    let n = count(&a[0])?;
    let c = match &a[1] {
        Value::Null => return Ok(Value::Null),
        Value::String(s) => s.chars().next().ok_or_else(|| RuntimeError::invalid_argument("String"))?,
        other => char_from_code(value::to_i32(other)?)?,
    };
    Ok(Value::from(std::iter::repeat(c).take(n).collect::<String>()))
}

fn str_comp(a: &[Value]) -> Result<Value, RuntimeError> {
    let (Some(l), Some(r)) = (text(&a[0])?, text(&a[1])?) else {
        return Ok(Value::Null);
    };
    let mode = text_compare(a.get(2))?;
    let ordering = fold(&l, mode).cmp(&fold(&r, mode));
    Ok(Value::Integer(ordering as i16))
}

fn char_from_code(code: i32) -> Result<char, RuntimeError> {
    u32::try_from(code)
        .ok()
        .filter(|c| *c <= 0xFFFF)
        .and_then(char::from_u32)
        .ok_or_else(|| RuntimeError::invalid_argument(format!("Chr({code})")))
}

fn chr(a: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::from(char_from_code(value::to_i32(&a[0])?)?.to_string()))
}

fn asc(a: &[Value]) -> Result<Value, RuntimeError> {
    let s = text(&a[0])?.ok_or_else(RuntimeError::invalid_null)?;
    let c = s.chars().next().ok_or_else(|| RuntimeError::invalid_argument("Asc(\"\")"))?;
    Ok(value::integral(i64::from(u32::from(c)), true))
}

/// `Hex` / `Oct`: negative numbers print as two's complement of their
/// Integer or Long width.
fn radix(v: &Value, base: u32) -> Result<Value, RuntimeError> {
    if matches!(v, Value::Null) {
        return Ok(Value::Null);
    }
    let n = value::to_i64(v)?;
    let bits = if matches!(v, Value::Integer(_)) && n < 0 {
        u64::from(n as i16 as u16)
    } else if let Ok(l) = i32::try_from(n) {
        u64::from(l as u32)
    } else {
        n as u64
    };
    Ok(Value::from(if base == 16 {
        format!("{bits:X}")
    } else {
        format!("{bits:o}")
    }))
}

// ── Math ─────────────────────────────────────────────────────────

fn numeric(v: &Value) -> Result<Value, RuntimeError> {
    let v = value::unwrap_default(v)?;
    Ok(match v {
        Value::Empty => Value::Integer(0),
        Value::Boolean(b) => Value::Integer(if b { -1 } else { 0 }),
        Value::String(_) | Value::Date(_) => Value::Double(value::to_f64(&v)?),
        other => other,
    })
}

fn abs(a: &[Value]) -> Result<Value, RuntimeError> {
    Ok(match numeric(&a[0])? {
        Value::Integer(n) => n.checked_abs().map_or(Value::Long(i32::from(n).abs()), Value::Integer),
        Value::Long(n) => n.checked_abs().map_or(Value::Double(f64::from(n).abs()), Value::Long),
        Value::LongLong(n) => n.checked_abs().map_or_else(|| Value::Double((n as f64).abs()), Value::LongLong),
        Value::Single(n) => Value::Single(n.abs()),
        Value::Double(n) => Value::Double(n.abs()),
        Value::Decimal(d) => Value::Decimal(d.abs()),
        Value::Null => Value::Null,
        _ => return Err(RuntimeError::type_mismatch("Abs")),
    })
}

fn integer_part(v: &Value, f: fn(f64) -> f64, d: fn(&Decimal) -> Decimal) -> Result<Value, RuntimeError> {
    Ok(match numeric(v)? {
        n @ (Value::Integer(_) | Value::Long(_) | Value::LongLong(_) | Value::Null) => n,
        Value::Single(n) => Value::Single(f(f64::from(n)) as f32),
        Value::Double(n) => Value::Double(f(n)),
        Value::Decimal(n) => Value::Decimal(d(&n)),
        _ => return Err(RuntimeError::type_mismatch("Int")),
    })
}

fn round(a: &[Value]) -> Result<Value, RuntimeError> {
    let places = match a.get(1) {
        Some(v) => u32::try_from(value::to_i32(v)?).map_err(|_| RuntimeError::invalid_argument("Round"))?,
        None => 0,
    };
    Ok(match numeric(&a[0])? {
        n @ (Value::Integer(_) | Value::Long(_) | Value::LongLong(_) | Value::Null) => n,
        Value::Decimal(d) => Value::Decimal(d.round_dp_with_strategy(places, RoundingStrategy::MidpointNearestEven)),
        other => {
            let n = value::to_f64(&other)?;
            let rounded = Decimal::from_f64(n)
                .map(|d| d.round_dp_with_strategy(places, RoundingStrategy::MidpointNearestEven))
                .and_then(|d| d.to_f64())
                .unwrap_or(n);
            if matches!(other, Value::Single(_)) {
                Value::Single(rounded as f32)
            } else {
                Value::Double(rounded)
            }
        }
    })
}

fn sqr(a: &[Value]) -> Result<Value, RuntimeError> {
    if matches!(a[0], Value::Null) {
        return Ok(Value::Null);
    }
    let n = value::to_f64(&a[0])?;
    if n < 0.0 {
        return Err(RuntimeError::invalid_argument("Sqr of a negative number"));
    }
    Ok(Value::Double(n.sqrt()))
}

fn sgn(a: &[Value]) -> Result<Value, RuntimeError> {
    if matches!(a[0], Value::Null) {
        return Ok(Value::Null);
    }
    let n = value::to_f64(&a[0])?;
    Ok(Value::Integer(if n > 0.0 {
        1
    } else if n < 0.0 {
        -1
    } else {
        0
    }))
}

// ── Arrays ───────────────────────────────────────────────────────

fn bound(a: &[Value], f: fn(&VbArray, usize) -> Result<i64, RuntimeError>) -> Result<Value, RuntimeError> {
    let Value::Array(arr) = &a[0] else {
        return Err(RuntimeError::type_mismatch("UBound"));
    };
    let dim = match a.get(1) {
        Some(v) => usize::try_from(value::to_i32(v)?).map_err(|_| RuntimeError::subscript_out_of_range())?,
        None => 1,
    };
    let n = f(&arr.borrow(), dim)?;
    Ok(value::integral(n, false))
}

// ── Dates ────────────────────────────────────────────────────────

fn date_part(v: &Value, f: fn(&date::DateParts) -> i64) -> Result<Value, RuntimeError> {
    if matches!(v, Value::Null) {
        return Ok(Value::Null);
    }
    let parts = date::to_parts(value::to_date(v)?);
    Ok(value::integral(f(&parts), true))
}

fn date_serial(a: &[Value]) -> Result<Value, RuntimeError> {
    let year = value::to_i64(&a[0])?;
    // Two-digit years follow the OLE window.
    let year = match year {
        0..=29 => year + 2000,
        30..=99 => year + 1900,
        y => y,
    };
    Ok(Value::Date(date::serial(year, value::to_i64(&a[1])?, value::to_i64(&a[2])?)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Value {
        (BUILTINS[lookup(name).unwrap()].call)(args).unwrap()
    }

    fn s(text: &str) -> Value {
        Value::from(text)
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(lookup("ucase"), lookup("UCASE"));
        assert!(lookup("NoSuchThing").is_none());
        assert!(is_known("CreateObject"));
        assert_eq!(constant("VBCRLF"), Some(Literal::String("\r\n".to_string())));
    }

    #[test]
    fn string_functions() {
        assert_eq!(call("Len", &[s("héllo")]), Value::Long(5));
        assert_eq!(call("Len", &[Value::Null]), Value::Null);
        assert_eq!(call("Left", &[s("hello"), Value::Integer(2)]), s("he"));
        assert_eq!(call("Right", &[s("hello"), Value::Integer(3)]), s("llo"));
        assert_eq!(call("Mid", &[s("hello"), Value::Integer(2), Value::Integer(3)]), s("ell"));
        assert_eq!(call("Mid", &[s("hello"), Value::Integer(4)]), s("lo"));
        assert_eq!(call("Trim", &[s("  a b  ")]), s("a b"));
        assert_eq!(call("StrReverse", &[s("abc")]), s("cba"));
        assert_eq!(call("Space", &[Value::Integer(3)]), s("   "));
        assert_eq!(call("String", &[Value::Integer(3), s("xy")]), s("xxx"));
    }

    #[test]
    fn searching() {
        assert_eq!(call("InStr", &[s("hello"), s("l")]), Value::Long(3));
        assert_eq!(call("InStr", &[Value::Integer(4), s("hello"), s("l")]), Value::Long(4));
        assert_eq!(call("InStr", &[Value::Integer(1), s("HELLO"), s("ll"), Value::Integer(1)]), Value::Long(3));
        assert_eq!(call("InStr", &[s("hello"), s("z")]), Value::Long(0));
        assert_eq!(call("InStrRev", &[s("hello"), s("l")]), Value::Long(4));
        assert_eq!(call("StrComp", &[s("a"), s("B"), Value::Integer(1)]), Value::Integer(-1));
        assert_eq!(call("StrComp", &[s("a"), s("A"), Value::Integer(1)]), Value::Integer(0));
    }

    #[test]
    fn replace_split_join() {
        assert_eq!(call("Replace", &[s("a-b-c"), s("-"), s("+")]), s("a+b+c"));
        assert_eq!(
            call("Replace", &[s("a-b-c"), s("-"), s("+"), Value::Integer(1), Value::Integer(1)]),
            s("a+b-c")
        );
        assert_eq!(call("Replace", &[s("ABab"), s("a"), s("x"), Value::Integer(1), Value::Integer(-1), Value::Integer(1)]), s("xBxb"));
        let parts = call("Split", &[s("a,b,,c"), s(",")]);
        let Value::Array(arr) = &parts else { panic!() };
        assert_eq!(arr.borrow().len(), 4);
        assert_eq!(call("Join", &[parts.clone(), s("|")]), s("a|b||c"));
        let Value::Array(empty) = call("Split", &[s("")]) else { panic!() };
        assert_eq!(empty.borrow().ubound(1).unwrap(), -1);
        let Value::Array(limited) = call("Split", &[s("a b c"), s(" "), Value::Integer(2)]) else { panic!() };
        assert_eq!(limited.borrow().get(&[1]).unwrap(), s("b c"));
    }

    #[test]
    fn character_codes() {
        assert_eq!(call("Chr", &[Value::Integer(65)]), s("A"));
        assert_eq!(call("Asc", &[s("a")]), Value::Integer(97));
        assert_eq!(call("Hex", &[Value::Long(255)]), s("FF"));
        assert_eq!(call("Hex", &[Value::Integer(-1)]), s("FFFF"));
        assert_eq!(call("Oct", &[Value::Integer(8)]), s("10"));
    }

    #[test]
    fn math() {
        assert_eq!(call("Abs", &[Value::Integer(-3)]), Value::Integer(3));
        assert_eq!(call("Int", &[Value::Double(-2.5)]), Value::Double(-3.0));
        assert_eq!(call("Fix", &[Value::Double(-2.5)]), Value::Double(-2.0));
        assert_eq!(call("Round", &[Value::Double(2.5)]), Value::Double(2.0));
        assert_eq!(call("Round", &[Value::Double(1.2345), Value::Integer(2)]), Value::Double(1.23));
        assert_eq!(call("Sgn", &[Value::Double(-0.1)]), Value::Integer(-1));
        assert_eq!(call("Sqr", &[Value::Integer(9)]), Value::Double(3.0));
        assert!((BUILTINS[lookup("Sqr").unwrap()].call)(&[Value::Integer(-1)]).is_err());
    }

    #[test]
    fn conversions_and_inspection() {
        assert_eq!(call("CInt", &[s("2.5")]), Value::Integer(2));
        assert_eq!(call("CLng", &[Value::Double(3.5)]), Value::Long(4));
        assert_eq!(call("CStr", &[Value::Boolean(true)]), s("True"));
        assert_eq!(call("TypeName", &[Value::Long(1)]), s("Long"));
        assert_eq!(call("VarType", &[s("x")]), Value::Integer(8));
        assert_eq!(call("IsNumeric", &[s(" 12.5 ")]), Value::Boolean(true));
        assert_eq!(call("IsEmpty", &[Value::Empty]), Value::Boolean(true));
        assert!((BUILTINS[lookup("CInt").unwrap()].call)(&[Value::Null]).is_err());
    }

    #[test]
    fn arrays_and_dates() {
        let arr = call("Array", &[Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
        assert_eq!(call("UBound", &[arr.clone()]), Value::Long(2));
        assert_eq!(call("LBound", &[arr]), Value::Long(0));
        let d = call("DateSerial", &[Value::Integer(2024), Value::Integer(2), Value::Integer(29)]);
        assert_eq!(call("Year", &[d.clone()]), Value::Integer(2024));
        assert_eq!(call("Month", &[d.clone()]), Value::Integer(2));
        assert_eq!(call("Day", &[d]), Value::Integer(29));
    }
}
