//! VBScript operator semantics: `BinaryOp`, `Concatenate`, unary `Not` and
//! `Negate`.
//!
//! Every function here is pure over its operands. The VM resolves script
//! class default members before calling in; host default members are
//! unwrapped here.

use std::cmp::Ordering;
use std::rc::Rc;

use rust_decimal::Decimal;
use serde::Serialize;

use super::error::RuntimeError;
use super::value::{self, unwrap_default, Value, VbType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    IntDivide,
    Modulo,
    Power,
    Concatenate,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Is,
    And,
    Or,
    Xor,
    Eqv,
    Imp,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::IntDivide => "\\",
            BinaryOp::Modulo => "Mod",
            BinaryOp::Power => "^",
            BinaryOp::Concatenate => "&",
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "<>",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::Is => "Is",
            BinaryOp::And => "And",
            BinaryOp::Or => "Or",
            BinaryOp::Xor => "Xor",
            BinaryOp::Eqv => "Eqv",
            BinaryOp::Imp => "Imp",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UnaryOp {
    Negate,
    Not,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Negate => "-",
            UnaryOp::Not => "Not",
        }
    }
}

/// Pick the type both operands are converted to.
///
/// The left type wins when the types match, when the right operand is a
/// String and the left a non-string primitive, or when the right type ranks
/// strictly below the left on the widening ladder. Otherwise the right type
/// wins. The rule is asymmetric: `"1" + 2` targets Integer through the right
/// operand, `2 + "1"` through the left.
pub fn select_target(left: VbType, right: VbType) -> VbType {
    if left == right {
        return left;
    }
    if right == VbType::String && left.is_primitive() {
        return left;
    }
    match (left.rank(), right.rank()) {
        (Some(l), Some(r)) if r < l => left,
        _ => right,
    }
}

/// Numeric family the arithmetic is carried out in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    I32,
    I64,
    F32,
    F64,
    Dec,
    Str,
}

fn family(target: VbType) -> Family {
    match target {
        VbType::Boolean | VbType::Integer | VbType::Long => Family::I32,
        VbType::LongLong => Family::I64,
        VbType::Single => Family::F32,
        VbType::Decimal => Family::Dec,
        VbType::String => Family::Str,
        _ => Family::F64,
    }
}

fn unsupported(op: BinaryOp, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::invalid_argument(format!(
        "operator '{}' is not supported for {} and {}",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

/// Equality against the null sentinel: true when both sides are null, or
/// when the other side is the empty string.
fn null_equal(left: &Value, right: &Value) -> bool {
    let is_blank = |v: &Value| v.is_null_like() || matches!(v, Value::String(s) if s.is_empty());
    is_blank(left) && is_blank(right)
}

/// Objects and arrays take part in operators through their printed form.
fn primitive_or_repr(v: Value) -> Value {
    match v {
        Value::Object(_) | Value::Array(_) => Value::from(v.repr_string()),
        other => other,
    }
}

pub fn binary_op(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    match op {
        BinaryOp::Concatenate => return concatenate(left, right),
        BinaryOp::Is => return identity(left, right),
        BinaryOp::Equal if left.same_object(right) => return Ok(Value::Boolean(true)),
        _ => {}
    }
    let l = unwrap_default(left)?;
    let r = unwrap_default(right)?;
    if l.is_null_like() || r.is_null_like() {
        return Ok(match op {
            BinaryOp::Equal => Value::Boolean(null_equal(&l, &r)),
            BinaryOp::NotEqual => Value::Boolean(!null_equal(&l, &r)),
            _ => Value::Null,
        });
    }
    let l = primitive_or_repr(l);
    let r = primitive_or_repr(r);
    let target = select_target(l.vb_type(), r.vb_type());
    match op {
        BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply => arithmetic(op, target, &l, &r),
        BinaryOp::Divide => divide(target, &l, &r),
        BinaryOp::IntDivide | BinaryOp::Modulo => integer_division(op, target, &l, &r),
        BinaryOp::Power => {
            let base = value::to_f64(&l)?;
            let exp = value::to_f64(&r)?;
            checked_double(base.powf(exp), base.is_finite() && exp.is_finite())
        }
        BinaryOp::Equal => Ok(Value::Boolean(
            compare(target, &l, &r).is_ok_and(|o| o == Some(Ordering::Equal)),
        )),
        BinaryOp::NotEqual => Ok(Value::Boolean(
            !compare(target, &l, &r).is_ok_and(|o| o == Some(Ordering::Equal)),
        )),
        BinaryOp::LessThan | BinaryOp::LessThanOrEqual | BinaryOp::GreaterThan | BinaryOp::GreaterThanOrEqual => {
            let ord = compare(target, &l, &r)?;
            Ok(Value::Boolean(match (op, ord) {
                (_, None) => false,
                (BinaryOp::LessThan, Some(o)) => o == Ordering::Less,
                (BinaryOp::LessThanOrEqual, Some(o)) => o != Ordering::Greater,
                (BinaryOp::GreaterThan, Some(o)) => o == Ordering::Greater,
                (_, Some(o)) => o != Ordering::Less,
            }))
        }
        BinaryOp::And | BinaryOp::Or | BinaryOp::Xor | BinaryOp::Eqv => logical(op, target, &l, &r),
        BinaryOp::Imp => Err(unsupported(op, left, right)),
        BinaryOp::Concatenate | BinaryOp::Is => Err(unsupported(op, left, right)),
    }
}

fn identity(left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    if !left.is_object() || !right.is_object() {
        return Err(RuntimeError::object_required("Is"));
    }
    Ok(Value::Boolean(left.same_object(right)))
}

/// `&`: both sides as strings. Null and Empty contribute nothing; Null on
/// both sides stays Null.
pub fn concatenate(left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    let l = unwrap_default(left)?;
    let r = unwrap_default(right)?;
    if matches!(l, Value::Null) && matches!(r, Value::Null) {
        return Ok(Value::Null);
    }
    let text = |v: &Value| -> Result<Rc<str>, RuntimeError> {
        match v {
            Value::Null | Value::Empty => Ok(Rc::from("")),
            Value::Nothing | Value::Object(_) | Value::Array(_) => Err(RuntimeError::type_mismatch("&")),
            other => value::to_str(other),
        }
    };
    let (a, b) = (text(&l)?, text(&r)?);
    let mut out = String::with_capacity(a.len() + b.len());
    out.push_str(&a);
    out.push_str(&b);
    Ok(Value::from(out))
}

fn arithmetic(op: BinaryOp, target: VbType, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    match family(target) {
        Family::Str if op == BinaryOp::Add => {
            let mut s = value::to_str(l)?.to_string();
            s.push_str(&value::to_str(r)?);
            Ok(Value::from(s))
        }
        Family::Str | Family::F64 => {
            let (a, b) = (as_f64(target, l)?, as_f64(target, r)?);
            let result = checked_double(apply_f64(op, a, b), a.is_finite() && b.is_finite())?;
            if target == VbType::Date && op != BinaryOp::Multiply {
                if let Value::Double(d) = result {
                    return Ok(Value::Date(d));
                }
            }
            Ok(result)
        }
        Family::I32 => {
            let a = i64::from(value::to_i32(l)?);
            let b = i64::from(value::to_i32(r)?);
            let n = apply_i64(op, a, b).ok_or_else(RuntimeError::overflow)?;
            let narrow = matches!(target, VbType::Integer | VbType::Boolean);
            Ok(value::integral(n, narrow))
        }
        Family::I64 => {
            let (a, b) = (value::to_i64(l)?, value::to_i64(r)?);
            apply_i64(op, a, b).map(Value::LongLong).ok_or_else(RuntimeError::overflow)
        }
        Family::F32 => {
            let (a, b) = (value::to_f32(l)?, value::to_f32(r)?);
            let n = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Subtract => a - b,
                _ => a * b,
            };
            if n.is_finite() {
                Ok(Value::Single(n))
            } else {
                checked_double(apply_f64(op, f64::from(a), f64::from(b)), true)
            }
        }
        Family::Dec => {
            let (a, b) = (value::to_decimal(l)?, value::to_decimal(r)?);
            let n = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Subtract => a.checked_sub(b),
                _ => a.checked_mul(b),
            };
            n.map(Value::Decimal).ok_or_else(RuntimeError::overflow)
        }
    }
}

/// Double-family conversion. A Date target parses date text.
fn as_f64(target: VbType, v: &Value) -> Result<f64, RuntimeError> {
    if target == VbType::Date {
        value::to_date(v)
    } else {
        value::to_f64(v)
    }
}

fn apply_f64(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        _ => a * b,
    }
}

fn apply_i64(op: BinaryOp, a: i64, b: i64) -> Option<i64> {
    match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Subtract => a.checked_sub(b),
        _ => a.checked_mul(b),
    }
}

/// A non-finite result from finite operands is an overflow.
fn checked_double(n: f64, inputs_finite: bool) -> Result<Value, RuntimeError> {
    if n.is_finite() || !inputs_finite {
        Ok(Value::Double(n))
    } else {
        Err(RuntimeError::overflow())
    }
}

fn divide(target: VbType, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    if target == VbType::Decimal {
        let (a, b) = (value::to_decimal(l)?, value::to_decimal(r)?);
        if b.is_zero() {
            return Err(RuntimeError::division_by_zero());
        }
        return a.checked_div(b).map(Value::Decimal).ok_or_else(RuntimeError::overflow);
    }
    let (a, b) = (as_f64(target, l)?, as_f64(target, r)?);
    if b == 0.0 {
        return Err(RuntimeError::division_by_zero());
    }
    checked_double(a / b, a.is_finite())
}

fn integer_division(op: BinaryOp, target: VbType, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    let (a, b) = (value::to_i64(l)?, value::to_i64(r)?);
    if b == 0 {
        return Err(RuntimeError::division_by_zero());
    }
    let n = if op == BinaryOp::IntDivide {
        a.checked_div(b)
    } else {
        a.checked_rem(b)
    }
    .ok_or_else(RuntimeError::overflow)?;
    Ok(match target {
        VbType::LongLong => Value::LongLong(n),
        VbType::Integer | VbType::Boolean => value::integral(n, true),
        _ => value::integral(n, false),
    })
}

/// Ordering under the target type. `None` for unordered doubles (NaN).
fn compare(target: VbType, l: &Value, r: &Value) -> Result<Option<Ordering>, RuntimeError> {
    match family(target) {
        Family::Str => Ok(Some(value::to_str(l)?.cmp(&value::to_str(r)?))),
        Family::I32 | Family::I64 => Ok(Some(value::to_i64(l)?.cmp(&value::to_i64(r)?))),
        Family::Dec => {
            let (a, b): (Decimal, Decimal) = (value::to_decimal(l)?, value::to_decimal(r)?);
            Ok(Some(a.cmp(&b)))
        }
        Family::F32 | Family::F64 => Ok(as_f64(target, l)?.partial_cmp(&as_f64(target, r)?)),
    }
}

fn logical(op: BinaryOp, target: VbType, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    let bits = |a: i64, b: i64| match op {
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        _ => !(a ^ b),
    };
    match target {
        VbType::Integer => Ok(Value::Integer(bits(
            i64::from(value::to_i16(l)?),
            i64::from(value::to_i16(r)?),
        ) as i16)),
        VbType::Long => Ok(Value::Long(bits(
            i64::from(value::to_i32(l)?),
            i64::from(value::to_i32(r)?),
        ) as i32)),
        VbType::LongLong => Ok(Value::LongLong(bits(value::to_i64(l)?, value::to_i64(r)?))),
        _ => {
            let (a, b) = (value::to_bool(l)?, value::to_bool(r)?);
            Ok(Value::Boolean(match op {
                BinaryOp::And => a && b,
                BinaryOp::Or => a || b,
                BinaryOp::Xor => a ^ b,
                _ => a == b,
            }))
        }
    }
}

pub fn unary_op(op: UnaryOp, operand: &Value) -> Result<Value, RuntimeError> {
    match op {
        UnaryOp::Not => not(operand),
        UnaryOp::Negate => negate(operand),
    }
}

/// `Not`: Boolean negates directly, Null stays Null, anything else goes
/// through `CBool` first.
pub fn not(operand: &Value) -> Result<Value, RuntimeError> {
    match operand {
        Value::Boolean(b) => Ok(Value::Boolean(!b)),
        Value::Null => Ok(Value::Null),
        other => Ok(Value::Boolean(!value::to_bool(other)?)),
    }
}

/// Unary minus. Booleans and non-primitive operands are converted to a
/// number first, so `-True` is the Integer 1.
pub fn negate(operand: &Value) -> Result<Value, RuntimeError> {
    match operand {
        Value::Null => Ok(Value::Null),
        Value::Empty => Ok(Value::Integer(0)),
        Value::Integer(n) => Ok(n.checked_neg().map_or(Value::Long(-i32::from(*n)), Value::Integer)),
        Value::Long(n) => Ok(n.checked_neg().map_or(Value::Double(-f64::from(*n)), Value::Long)),
        Value::LongLong(n) => n.checked_neg().map(Value::LongLong).ok_or_else(RuntimeError::overflow),
        Value::Single(n) => Ok(Value::Single(-n)),
        Value::Double(n) => Ok(Value::Double(-n)),
        Value::Decimal(d) => Ok(Value::Decimal(-*d)),
        Value::Date(d) => Ok(Value::Date(-d)),
        Value::Boolean(b) => Ok(Value::Integer(if *b { 1 } else { 0 })),
        Value::String(_) => Ok(Value::Double(-value::to_f64(operand)?)),
        Value::Object(_) => {
            let inner = unwrap_default(operand)?;
            if matches!(inner, Value::Object(_)) {
                return Err(RuntimeError::type_mismatch("-"));
            }
            negate(&inner)
        }
        Value::Nothing | Value::Array(_) => Err(RuntimeError::type_mismatch("-")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn bin(op: BinaryOp, l: impl Into<Value>, r: impl Into<Value>) -> Value {
        binary_op(op, &l.into(), &r.into()).unwrap()
    }

    #[test]
    fn null_laws() {
        assert_eq!(binary_op(BinaryOp::Equal, &Value::Empty, &Value::Empty).unwrap(), Value::Boolean(true));
        assert_eq!(binary_op(BinaryOp::Equal, &Value::Null, &Value::from("")).unwrap(), Value::Boolean(true));
        assert_eq!(binary_op(BinaryOp::Add, &Value::Null, &Value::Long(5)).unwrap(), Value::Null);
        assert_eq!(binary_op(BinaryOp::NotEqual, &Value::Null, &Value::Null).unwrap(), Value::Boolean(false));
        assert_eq!(binary_op(BinaryOp::Equal, &Value::Null, &Value::Long(0)).unwrap(), Value::Boolean(false));
        assert_eq!(binary_op(BinaryOp::LessThan, &Value::Empty, &Value::Long(1)).unwrap(), Value::Null);
    }

    #[test]
    fn target_selection_is_asymmetric() {
        assert_eq!(select_target(VbType::Long, VbType::String), VbType::Long);
        assert_eq!(select_target(VbType::String, VbType::Long), VbType::Long);
        assert_eq!(select_target(VbType::Double, VbType::Integer), VbType::Double);
        assert_eq!(select_target(VbType::Integer, VbType::Double), VbType::Double);
        assert_eq!(select_target(VbType::String, VbType::String), VbType::String);
        assert_eq!(select_target(VbType::Boolean, VbType::String), VbType::Boolean);
    }

    #[test]
    fn numeric_string_addition() {
        assert_eq!(bin(BinaryOp::Add, 1i16, "2"), Value::Integer(3));
        assert_eq!(bin(BinaryOp::Add, "2", 1i16), Value::Integer(3));
        assert_eq!(bin(BinaryOp::Add, "a", "b"), Value::from("ab"));
        assert_eq!(bin(BinaryOp::Subtract, "5", "2"), Value::Double(3.0));
        assert!(binary_op(BinaryOp::Add, &Value::Integer(1), &Value::from("x")).is_err());
    }

    #[test]
    fn integer_overflow_promotes() {
        assert_eq!(bin(BinaryOp::Add, 32_767i16, 1i16), Value::Long(32_768));
        assert_eq!(bin(BinaryOp::Multiply, i32::MAX, 2i32), Value::Double(4_294_967_294.0));
        assert!(binary_op(BinaryOp::Add, &Value::LongLong(i64::MAX), &Value::LongLong(1)).is_err());
    }

    #[test]
    fn division_rules() {
        assert_eq!(bin(BinaryOp::Divide, 7i16, 2i16), Value::Double(3.5));
        assert_eq!(bin(BinaryOp::IntDivide, 7i16, 2i16), Value::Integer(3));
        assert_eq!(bin(BinaryOp::Modulo, 7.6, 2i16), Value::Long(0));
        assert_eq!(binary_op(BinaryOp::Divide, &Value::Long(1), &Value::Long(0)).unwrap_err().number, 11);
        assert_eq!(binary_op(BinaryOp::Modulo, &Value::Long(1), &Value::Long(0)).unwrap_err().number, 11);
    }

    #[test]
    fn modulo_rounds_operands() {
        // 7.6 rounds to 8.
        assert_eq!(bin(BinaryOp::Modulo, 7.6, 3i32), Value::Long(2));
        assert_eq!(bin(BinaryOp::Modulo, 7i16, 3i16), Value::Integer(1));
    }

    #[test]
    fn comparisons() {
        assert_eq!(bin(BinaryOp::LessThan, "abc", "abd"), Value::Boolean(true));
        assert_eq!(bin(BinaryOp::LessThan, "B", "a"), Value::Boolean(true));
        assert_eq!(bin(BinaryOp::GreaterThan, 10i32, "9"), Value::Boolean(true));
        assert_eq!(bin(BinaryOp::Equal, 1i16, 1.0), Value::Boolean(true));
        assert_eq!(bin(BinaryOp::Equal, 1i16, "x"), Value::Boolean(false));
        assert_eq!(bin(BinaryOp::NotEqual, 1i16, "x"), Value::Boolean(true));
    }

    #[test]
    fn dates_compare_against_date_text() {
        let day = Value::Date(crate::runtime::date::serial(2020, 1, 2));
        assert_eq!(bin(BinaryOp::Equal, day.clone(), "1/2/2020"), Value::Boolean(true));
        assert_eq!(bin(BinaryOp::LessThan, day.clone(), "1/3/2020"), Value::Boolean(true));
        assert_eq!(bin(BinaryOp::Add, day.clone(), 1i16), Value::Date(crate::runtime::date::serial(2020, 1, 3)));
        assert_eq!(bin(BinaryOp::Equal, day, "not a date"), Value::Boolean(false));
    }

    #[test]
    fn logical_and_bitwise() {
        assert_eq!(bin(BinaryOp::And, true, false), Value::Boolean(false));
        assert_eq!(bin(BinaryOp::Or, 12i16, 3i16), Value::Integer(15));
        assert_eq!(bin(BinaryOp::Xor, 6i32, 3i32), Value::Long(5));
        assert_eq!(bin(BinaryOp::Eqv, true, true), Value::Boolean(true));
        assert_eq!(bin(BinaryOp::And, 2.0, 1.5), Value::Boolean(true));
        let err = binary_op(BinaryOp::Imp, &Value::Boolean(true), &Value::Boolean(false)).unwrap_err();
        assert_eq!(err.number, 5);
        assert!(err.description.contains("Imp") && err.description.contains("Boolean"));
    }

    #[test]
    fn unary_rules() {
        assert_eq!(negate(&Value::Boolean(true)).unwrap(), Value::Integer(1));
        assert_eq!(negate(&Value::Integer(i16::MIN)).unwrap(), Value::Long(32_768));
        assert_eq!(negate(&Value::from("2.5")).unwrap(), Value::Double(-2.5));
        assert_eq!(not(&Value::Boolean(true)).unwrap(), Value::Boolean(false));
        assert_eq!(not(&Value::Null).unwrap(), Value::Null);
        assert_eq!(not(&Value::Long(0)).unwrap(), Value::Boolean(true));
    }

    #[test]
    fn concatenation() {
        assert_eq!(concatenate(&Value::Long(1), &Value::from("a")).unwrap(), Value::from("1a"));
        assert_eq!(concatenate(&Value::Null, &Value::from("a")).unwrap(), Value::from("a"));
        assert_eq!(concatenate(&Value::Null, &Value::Null).unwrap(), Value::Null);
        assert_eq!(concatenate(&Value::Boolean(true), &Value::Empty).unwrap(), Value::from("True"));
    }

    #[test]
    fn binary_op_is_deterministic() {
        let samples = [
            Value::Boolean(true),
            Value::Long(7),
            Value::LongLong(-3),
            Value::Single(1.5),
            Value::Double(2.25),
            Value::Decimal(Decimal::new(125, 2)),
            Value::from("4"),
        ];
        let ops = [
            BinaryOp::Add,
            BinaryOp::Subtract,
            BinaryOp::Multiply,
            BinaryOp::Divide,
            BinaryOp::Equal,
            BinaryOp::LessThan,
            BinaryOp::And,
        ];
        for op in ops {
            for l in &samples {
                for r in &samples {
                    let first = binary_op(op, l, r);
                    let second = binary_op(op, l, r);
                    assert_eq!(first, second, "{op:?} {l:?} {r:?}");
                }
            }
        }
    }
}
