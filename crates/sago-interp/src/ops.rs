//! Arithmetic, comparison and conversion over boxed values.
//!
//! The fast path is a concrete match on the primitive kinds; named types
//! with a primitive underlying kind are unwrapped for the computation and
//! the result is rewrapped, preserving the name. Integer arithmetic wraps
//! in two's complement. Division and remainder by zero, negative shift
//! counts and uncomparable operands surface as runtime panics.

use std::sync::Arc;

use num_complex::{Complex32, Complex64};

use sago_ssa::types::{BasicKind, Type, TypeData, TypeStore};

use crate::error::Panic;
use crate::value::{self, NamedVal, Value};

fn invalid_binop(op: &str, x: &Value, y: &Value) -> Panic {
    Panic::runtime(format!(
        "invalid binary op: {} {} {}",
        x.kind_name(),
        op,
        y.kind_name()
    ))
}

/// Expand one arm per integer kind; `$a`/`$b` name the unwrapped operands
/// inside `$e`.
macro_rules! int_match {
    ($x:expr, $y:expr, $a:ident, $b:ident, $e:expr) => {
        match ($x, $y) {
            (Value::Int($a), Value::Int($b)) => Some(Value::Int($e)),
            (Value::Int8($a), Value::Int8($b)) => Some(Value::Int8($e)),
            (Value::Int16($a), Value::Int16($b)) => Some(Value::Int16($e)),
            (Value::Int32($a), Value::Int32($b)) => Some(Value::Int32($e)),
            (Value::Int64($a), Value::Int64($b)) => Some(Value::Int64($e)),
            (Value::Uint($a), Value::Uint($b)) => Some(Value::Uint($e)),
            (Value::Uint8($a), Value::Uint8($b)) => Some(Value::Uint8($e)),
            (Value::Uint16($a), Value::Uint16($b)) => Some(Value::Uint16($e)),
            (Value::Uint32($a), Value::Uint32($b)) => Some(Value::Uint32($e)),
            (Value::Uint64($a), Value::Uint64($b)) => Some(Value::Uint64($e)),
            (Value::Uintptr($a), Value::Uintptr($b)) => Some(Value::Uintptr($e)),
            _ => None,
        }
    };
}

macro_rules! float_complex_match {
    ($x:expr, $y:expr, $a:ident, $b:ident, $e:expr) => {
        match ($x, $y) {
            (Value::Float32($a), Value::Float32($b)) => Some(Value::Float32($e)),
            (Value::Float64($a), Value::Float64($b)) => Some(Value::Float64($e)),
            (Value::Complex64($a), Value::Complex64($b)) => Some(Value::Complex64($e)),
            (Value::Complex128($a), Value::Complex128($b)) => Some(Value::Complex128($e)),
            _ => None,
        }
    };
}

/// Ordered comparisons over integers, floats and strings.
macro_rules! cmp_match {
    ($x:expr, $y:expr, $a:ident, $b:ident, $e:expr) => {
        match ($x, $y) {
            (Value::Int($a), Value::Int($b)) => Some($e),
            (Value::Int8($a), Value::Int8($b)) => Some($e),
            (Value::Int16($a), Value::Int16($b)) => Some($e),
            (Value::Int32($a), Value::Int32($b)) => Some($e),
            (Value::Int64($a), Value::Int64($b)) => Some($e),
            (Value::Uint($a), Value::Uint($b)) => Some($e),
            (Value::Uint8($a), Value::Uint8($b)) => Some($e),
            (Value::Uint16($a), Value::Uint16($b)) => Some($e),
            (Value::Uint32($a), Value::Uint32($b)) => Some($e),
            (Value::Uint64($a), Value::Uint64($b)) => Some($e),
            (Value::Uintptr($a), Value::Uintptr($b)) => Some($e),
            (Value::Float32($a), Value::Float32($b)) => Some($e),
            (Value::Float64($a), Value::Float64($b)) => Some($e),
            (Value::Str($a), Value::Str($b)) => Some($e),
            _ => None,
        }
    };
}

pub fn op_add(x: &Value, y: &Value) -> Result<Value, Panic> {
    let (xu, yu) = (x.unnamed(), y.unnamed());
    let r = int_match!(xu, yu, a, b, a.wrapping_add(*b))
        .or_else(|| float_complex_match!(xu, yu, a, b, a + b))
        .or_else(|| match (xu, yu) {
            (Value::Str(a), Value::Str(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                Some(Value::Str(Arc::from(s.as_str())))
            }
            _ => None,
        })
        .ok_or_else(|| invalid_binop("+", x, y))?;
    Ok(r.rewrap_named(x))
}

pub fn op_sub(x: &Value, y: &Value) -> Result<Value, Panic> {
    let (xu, yu) = (x.unnamed(), y.unnamed());
    let r = int_match!(xu, yu, a, b, a.wrapping_sub(*b))
        .or_else(|| float_complex_match!(xu, yu, a, b, a - b))
        .ok_or_else(|| invalid_binop("-", x, y))?;
    Ok(r.rewrap_named(x))
}

pub fn op_mul(x: &Value, y: &Value) -> Result<Value, Panic> {
    let (xu, yu) = (x.unnamed(), y.unnamed());
    let r = int_match!(xu, yu, a, b, a.wrapping_mul(*b))
        .or_else(|| float_complex_match!(xu, yu, a, b, a * b))
        .ok_or_else(|| invalid_binop("*", x, y))?;
    Ok(r.rewrap_named(x))
}

fn int_is_zero(v: &Value) -> bool {
    matches!(
        v,
        Value::Int(0)
            | Value::Int8(0)
            | Value::Int16(0)
            | Value::Int32(0)
            | Value::Int64(0)
            | Value::Uint(0)
            | Value::Uint8(0)
            | Value::Uint16(0)
            | Value::Uint32(0)
            | Value::Uint64(0)
            | Value::Uintptr(0)
    )
}

pub fn op_quo(x: &Value, y: &Value) -> Result<Value, Panic> {
    let (xu, yu) = (x.unnamed(), y.unnamed());
    if int_is_zero(yu) {
        return Err(Panic::runtime("integer divide by zero"));
    }
    let r = int_match!(xu, yu, a, b, a.wrapping_div(*b))
        .or_else(|| float_complex_match!(xu, yu, a, b, a / b))
        .ok_or_else(|| invalid_binop("/", x, y))?;
    Ok(r.rewrap_named(x))
}

pub fn op_rem(x: &Value, y: &Value) -> Result<Value, Panic> {
    let (xu, yu) = (x.unnamed(), y.unnamed());
    if int_is_zero(yu) {
        return Err(Panic::runtime("integer divide by zero"));
    }
    let r = int_match!(xu, yu, a, b, a.wrapping_rem(*b))
        .ok_or_else(|| invalid_binop("%", x, y))?;
    Ok(r.rewrap_named(x))
}

pub fn op_and(x: &Value, y: &Value) -> Result<Value, Panic> {
    let (xu, yu) = (x.unnamed(), y.unnamed());
    let r = int_match!(xu, yu, a, b, *a & *b).ok_or_else(|| invalid_binop("&", x, y))?;
    Ok(r.rewrap_named(x))
}

pub fn op_or(x: &Value, y: &Value) -> Result<Value, Panic> {
    let (xu, yu) = (x.unnamed(), y.unnamed());
    let r = int_match!(xu, yu, a, b, *a | *b).ok_or_else(|| invalid_binop("|", x, y))?;
    Ok(r.rewrap_named(x))
}

pub fn op_xor(x: &Value, y: &Value) -> Result<Value, Panic> {
    let (xu, yu) = (x.unnamed(), y.unnamed());
    let r = int_match!(xu, yu, a, b, *a ^ *b).ok_or_else(|| invalid_binop("^", x, y))?;
    Ok(r.rewrap_named(x))
}

pub fn op_and_not(x: &Value, y: &Value) -> Result<Value, Panic> {
    let (xu, yu) = (x.unnamed(), y.unnamed());
    let r = int_match!(xu, yu, a, b, *a & !*b).ok_or_else(|| invalid_binop("&^", x, y))?;
    Ok(r.rewrap_named(x))
}

/// Shift left per the source-language semantics: a count at or past the
/// operand width yields zero.
macro_rules! shl_arm {
    ($a:expr, $n:expr, $t:ty) => {
        if $n >= <$t>::BITS as u64 {
            0
        } else {
            ($a).wrapping_shl($n as u32)
        }
    };
}

macro_rules! shr_signed_arm {
    ($a:expr, $n:expr, $t:ty) => {
        if $n >= <$t>::BITS as u64 {
            ($a) >> (<$t>::BITS - 1)
        } else {
            ($a) >> ($n as u32)
        }
    };
}

macro_rules! shr_unsigned_arm {
    ($a:expr, $n:expr, $t:ty) => {
        if $n >= <$t>::BITS as u64 {
            0
        } else {
            ($a) >> ($n as u32)
        }
    };
}

pub fn op_shl(x: &Value, y: &Value) -> Result<Value, Panic> {
    let n = y.as_shift_count()?;
    let r = match x.unnamed() {
        Value::Int(a) => Value::Int(shl_arm!(*a, n, i64)),
        Value::Int8(a) => Value::Int8(shl_arm!(*a, n, i8)),
        Value::Int16(a) => Value::Int16(shl_arm!(*a, n, i16)),
        Value::Int32(a) => Value::Int32(shl_arm!(*a, n, i32)),
        Value::Int64(a) => Value::Int64(shl_arm!(*a, n, i64)),
        Value::Uint(a) => Value::Uint(shl_arm!(*a, n, u64)),
        Value::Uint8(a) => Value::Uint8(shl_arm!(*a, n, u8)),
        Value::Uint16(a) => Value::Uint16(shl_arm!(*a, n, u16)),
        Value::Uint32(a) => Value::Uint32(shl_arm!(*a, n, u32)),
        Value::Uint64(a) => Value::Uint64(shl_arm!(*a, n, u64)),
        Value::Uintptr(a) => Value::Uintptr(shl_arm!(*a, n, u64)),
        _ => return Err(invalid_binop("<<", x, y)),
    };
    Ok(r.rewrap_named(x))
}

pub fn op_shr(x: &Value, y: &Value) -> Result<Value, Panic> {
    let n = y.as_shift_count()?;
    let r = match x.unnamed() {
        Value::Int(a) => Value::Int(shr_signed_arm!(*a, n, i64)),
        Value::Int8(a) => Value::Int8(shr_signed_arm!(*a, n, i8)),
        Value::Int16(a) => Value::Int16(shr_signed_arm!(*a, n, i16)),
        Value::Int32(a) => Value::Int32(shr_signed_arm!(*a, n, i32)),
        Value::Int64(a) => Value::Int64(shr_signed_arm!(*a, n, i64)),
        Value::Uint(a) => Value::Uint(shr_unsigned_arm!(*a, n, u64)),
        Value::Uint8(a) => Value::Uint8(shr_unsigned_arm!(*a, n, u8)),
        Value::Uint16(a) => Value::Uint16(shr_unsigned_arm!(*a, n, u16)),
        Value::Uint32(a) => Value::Uint32(shr_unsigned_arm!(*a, n, u32)),
        Value::Uint64(a) => Value::Uint64(shr_unsigned_arm!(*a, n, u64)),
        Value::Uintptr(a) => Value::Uintptr(shr_unsigned_arm!(*a, n, u64)),
        _ => return Err(invalid_binop(">>", x, y)),
    };
    Ok(r.rewrap_named(x))
}

pub fn op_lss(x: &Value, y: &Value) -> Result<Value, Panic> {
    cmp_match!(x.unnamed(), y.unnamed(), a, b, a < b)
        .map(Value::Bool)
        .ok_or_else(|| invalid_binop("<", x, y))
}

pub fn op_leq(x: &Value, y: &Value) -> Result<Value, Panic> {
    cmp_match!(x.unnamed(), y.unnamed(), a, b, a <= b)
        .map(Value::Bool)
        .ok_or_else(|| invalid_binop("<=", x, y))
}

pub fn op_gtr(x: &Value, y: &Value) -> Result<Value, Panic> {
    cmp_match!(x.unnamed(), y.unnamed(), a, b, a > b)
        .map(Value::Bool)
        .ok_or_else(|| invalid_binop(">", x, y))
}

pub fn op_geq(x: &Value, y: &Value) -> Result<Value, Panic> {
    cmp_match!(x.unnamed(), y.unnamed(), a, b, a >= b)
        .map(Value::Bool)
        .ok_or_else(|| invalid_binop(">=", x, y))
}

/// `==`. `x_const_nil`/`y_const_nil` are compile-time facts about the
/// operands; a comparison against the nil literal succeeds for every
/// nil-kinded value.
pub fn op_eql(
    store: &TypeStore,
    x: &Value,
    y: &Value,
    x_const_nil: bool,
    y_const_nil: bool,
) -> Result<bool, Panic> {
    if x_const_nil {
        return Ok(y.is_nil());
    }
    if y_const_nil {
        return Ok(x.is_nil());
    }
    equal_values(store, x, y)
}

fn equal_nil_aware(store: &TypeStore, x: &Value, y: &Value) -> Result<bool, Panic> {
    if x.is_nil() || y.is_nil() {
        return Ok(x.is_nil() && y.is_nil());
    }
    equal_values(store, x, y)
}

pub fn equal_values(store: &TypeStore, x: &Value, y: &Value) -> Result<bool, Panic> {
    // Distinct named scalar types are never equal, even with identical
    // underlying representation.
    match (x, y) {
        (Value::Named(a), Value::Named(b)) => {
            if a.typ != b.typ {
                return Ok(false);
            }
        }
        (Value::Named(_), other) | (other, Value::Named(_)) if !other.is_nil() => {
            return Ok(false);
        }
        _ => {}
    }
    match (x.unnamed(), y.unnamed()) {
        (Value::Nil, _) | (_, Value::Nil) => Ok(x.is_nil() && y.is_nil()),
        (Value::Struct(a), Value::Struct(b)) => equal_struct(store, a, b),
        (Value::Array(a), Value::Array(b)) => {
            if a.elems.len() != b.elems.len() {
                return Ok(false);
            }
            for (ea, eb) in a.elems.iter().zip(b.elems.iter()) {
                if !equal_nil_aware(store, ea, eb)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (Value::Pointer(a), Value::Pointer(b)) => Ok(a.place.addr_key() == b.place.addr_key()),
        (Value::Chan(a), Value::Chan(b)) => Ok(Arc::ptr_eq(&a.core, &b.core)),
        (Value::Slice(_), _) | (_, Value::Slice(_)) => {
            Err(Panic::runtime("comparing uncomparable type slice"))
        }
        (Value::Map(_), _) | (_, Value::Map(_)) => {
            Err(Panic::runtime("comparing uncomparable type map"))
        }
        (Value::Func(_), _) | (_, Value::Func(_)) => {
            Err(Panic::runtime("comparing uncomparable type func"))
        }
        (a, b) => Ok(value::key_eq(a, b)),
    }
}

/// Struct equality: field-wise, ignoring blank fields, nil-aware on the
/// rest.
fn equal_struct(
    store: &TypeStore,
    a: &crate::value::StructVal,
    b: &crate::value::StructVal,
) -> Result<bool, Panic> {
    if a.fields.len() != b.fields.len() {
        return Ok(false);
    }
    let blanks: Vec<bool> = match store.data(store.underlying(a.typ)) {
        TypeData::Struct { fields } => fields.iter().map(|f| f.is_blank()).collect(),
        _ => vec![false; a.fields.len()],
    };
    for (i, (fa, fb)) in a.fields.iter().zip(b.fields.iter()).enumerate() {
        if blanks.get(i).copied().unwrap_or(false) {
            continue;
        }
        if !equal_nil_aware(store, fa, fb)? {
            return Ok(false);
        }
    }
    Ok(true)
}

// ---- unary operators ----

pub fn op_neg(x: &Value) -> Result<Value, Panic> {
    let r = match x.unnamed() {
        Value::Int(a) => Value::Int(a.wrapping_neg()),
        Value::Int8(a) => Value::Int8(a.wrapping_neg()),
        Value::Int16(a) => Value::Int16(a.wrapping_neg()),
        Value::Int32(a) => Value::Int32(a.wrapping_neg()),
        Value::Int64(a) => Value::Int64(a.wrapping_neg()),
        Value::Uint(a) => Value::Uint(a.wrapping_neg()),
        Value::Uint8(a) => Value::Uint8(a.wrapping_neg()),
        Value::Uint16(a) => Value::Uint16(a.wrapping_neg()),
        Value::Uint32(a) => Value::Uint32(a.wrapping_neg()),
        Value::Uint64(a) => Value::Uint64(a.wrapping_neg()),
        Value::Uintptr(a) => Value::Uintptr(a.wrapping_neg()),
        Value::Float32(a) => Value::Float32(-a),
        Value::Float64(a) => Value::Float64(-a),
        Value::Complex64(a) => Value::Complex64(-a),
        Value::Complex128(a) => Value::Complex128(-a),
        other => {
            return Err(Panic::runtime(format!("invalid unary op - {}", other.kind_name())))
        }
    };
    Ok(r.rewrap_named(x))
}

pub fn op_not(x: &Value) -> Result<Value, Panic> {
    match x.unnamed() {
        Value::Bool(b) => Ok(Value::Bool(!b).rewrap_named(x)),
        other => Err(Panic::runtime(format!("invalid unary op ! {}", other.kind_name()))),
    }
}

pub fn op_bitnot(x: &Value) -> Result<Value, Panic> {
    let r = match x.unnamed() {
        Value::Int(a) => Value::Int(!a),
        Value::Int8(a) => Value::Int8(!a),
        Value::Int16(a) => Value::Int16(!a),
        Value::Int32(a) => Value::Int32(!a),
        Value::Int64(a) => Value::Int64(!a),
        Value::Uint(a) => Value::Uint(!a),
        Value::Uint8(a) => Value::Uint8(!a),
        Value::Uint16(a) => Value::Uint16(!a),
        Value::Uint32(a) => Value::Uint32(!a),
        Value::Uint64(a) => Value::Uint64(!a),
        Value::Uintptr(a) => Value::Uintptr(!a),
        other => {
            return Err(Panic::runtime(format!("invalid unary op ^ {}", other.kind_name())))
        }
    };
    Ok(r.rewrap_named(x))
}

// ---- conversions ----

fn scalar_i128(v: &Value) -> Option<i128> {
    match v {
        Value::Int(a) | Value::Int64(a) => Some(*a as i128),
        Value::Int8(a) => Some(*a as i128),
        Value::Int16(a) => Some(*a as i128),
        Value::Int32(a) => Some(*a as i128),
        Value::Uint(a) | Value::Uint64(a) | Value::Uintptr(a) => Some(*a as i128),
        Value::Uint8(a) => Some(*a as i128),
        Value::Uint16(a) => Some(*a as i128),
        Value::Uint32(a) => Some(*a as i128),
        _ => None,
    }
}

fn scalar_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Float32(a) => Some(*a as f64),
        Value::Float64(a) => Some(*a),
        _ => scalar_i128(v).map(|i| i as f64),
    }
}

fn scalar_c128(v: &Value) -> Option<Complex64> {
    match v {
        Value::Complex64(a) => Some(Complex64::new(a.re as f64, a.im as f64)),
        Value::Complex128(a) => Some(*a),
        _ => scalar_f64(v).map(|f| Complex64::new(f, 0.0)),
    }
}

fn int_from_i128(i: i128, kind: BasicKind) -> Value {
    match kind {
        BasicKind::Int | BasicKind::UntypedInt => Value::Int(i as i64),
        BasicKind::Int8 => Value::Int8(i as i8),
        BasicKind::Int16 => Value::Int16(i as i16),
        BasicKind::Int32 | BasicKind::UntypedRune => Value::Int32(i as i32),
        BasicKind::Int64 => Value::Int64(i as i64),
        BasicKind::Uint => Value::Uint(i as u64),
        BasicKind::Uint8 => Value::Uint8(i as u8),
        BasicKind::Uint16 => Value::Uint16(i as u16),
        BasicKind::Uint32 => Value::Uint32(i as u32),
        BasicKind::Uint64 => Value::Uint64(i as u64),
        BasicKind::Uintptr => Value::Uintptr(i as u64),
        _ => Value::Int(i as i64),
    }
}

fn conv_err(store: &TypeStore, v: &Value, to: Type) -> Panic {
    Panic::Conversion(format!(
        "cannot convert {} to type {}",
        v.kind_name(),
        store.type_string(to)
    ))
}

/// Retag a value with a new static type without changing representation:
/// named-scalar wrap/unwrap and composite header rewrites.
pub fn retag(store: &TypeStore, v: &Value, to: Type) -> Value {
    match v {
        Value::Nil => Value::Nil,
        Value::Slice(s) => {
            let mut s = s.clone();
            s.typ = to;
            Value::Slice(s)
        }
        Value::Map(m) => {
            let mut m = m.clone();
            m.typ = to;
            Value::Map(m)
        }
        Value::Chan(c) => {
            let mut c = c.clone();
            c.typ = to;
            Value::Chan(c)
        }
        Value::Pointer(p) => {
            let mut p = p.clone();
            p.typ = to;
            Value::Pointer(p)
        }
        Value::Struct(s) => {
            let mut s = s.clone();
            s.typ = to;
            Value::Struct(s)
        }
        Value::Array(a) => {
            let mut a = a.clone();
            a.typ = to;
            Value::Array(a)
        }
        Value::Func(f) => Value::Func(f.clone()),
        scalar => {
            let raw = scalar.unnamed().clone();
            if store.is_named(to) {
                Value::Named(Box::new(NamedVal { typ: to, val: raw }))
            } else {
                raw
            }
        }
    }
}

/// General conversion between representable types.
pub fn convert(store: &TypeStore, v: &Value, to: Type) -> Result<Value, Panic> {
    let tu = store.underlying(to);
    let r = match store.data(tu) {
        TypeData::Basic(kind) => convert_basic(store, v, to, kind)?,
        TypeData::Slice(elem) => {
            if let Value::Str(s) = v.unnamed() {
                match store.basic_kind(elem) {
                    Some(BasicKind::Uint8) => {
                        let elems: Vec<Value> =
                            s.as_bytes().iter().map(|b| Value::Uint8(*b)).collect();
                        Value::Slice(crate::value::SliceVal::from_vec(to, elems))
                    }
                    Some(BasicKind::Int32) => {
                        let elems: Vec<Value> =
                            s.chars().map(|c| Value::Int32(c as i32)).collect();
                        Value::Slice(crate::value::SliceVal::from_vec(to, elems))
                    }
                    _ => return Err(conv_err(store, v, to)),
                }
            } else {
                retag(store, v, to)
            }
        }
        TypeData::Pointer(_) => match v.unnamed() {
            Value::Pointer(_) | Value::Nil => retag(store, v, to),
            _ => return Err(conv_err(store, v, to)),
        },
        _ => retag(store, v, to),
    };
    Ok(r)
}

fn convert_basic(
    store: &TypeStore,
    v: &Value,
    to: Type,
    kind: BasicKind,
) -> Result<Value, Panic> {
    let vu = v.unnamed();
    let raw = match kind {
        k if k.is_integer() => {
            if let Some(i) = scalar_i128(vu) {
                int_from_i128(i, k)
            } else if let Some(f) = scalar_f64(vu) {
                int_from_i128(f.trunc() as i128, k)
            } else if k == BasicKind::Uintptr {
                match vu {
                    // uintptr(unsafe.Pointer) observes the cell address.
                    Value::Pointer(p) => Value::Uintptr(p.place.addr_key().0 as u64),
                    Value::Nil => Value::Uintptr(0),
                    _ => return Err(conv_err(store, v, to)),
                }
            } else {
                return Err(conv_err(store, v, to));
            }
        }
        BasicKind::Float32 => match scalar_f64(vu) {
            Some(f) => Value::Float32(f as f32),
            None => return Err(conv_err(store, v, to)),
        },
        BasicKind::Float64 | BasicKind::UntypedFloat => match scalar_f64(vu) {
            Some(f) => Value::Float64(f),
            None => return Err(conv_err(store, v, to)),
        },
        BasicKind::Complex64 => match scalar_c128(vu) {
            Some(c) => Value::Complex64(Complex32::new(c.re as f32, c.im as f32)),
            None => return Err(conv_err(store, v, to)),
        },
        BasicKind::Complex128 | BasicKind::UntypedComplex => match scalar_c128(vu) {
            Some(c) => Value::Complex128(c),
            None => return Err(conv_err(store, v, to)),
        },
        BasicKind::Bool | BasicKind::UntypedBool => match vu {
            Value::Bool(b) => Value::Bool(*b),
            _ => return Err(conv_err(store, v, to)),
        },
        BasicKind::String | BasicKind::UntypedString => match vu {
            Value::Str(s) => Value::str(s),
            Value::Slice(s) => {
                let view = s.read_all();
                let elem = store.elem(s.typ).and_then(|e| store.basic_kind(e));
                match elem {
                    Some(BasicKind::Uint8) => {
                        let bytes: Vec<u8> = view
                            .iter()
                            .map(|b| match b.unnamed() {
                                Value::Uint8(x) => *x,
                                _ => 0,
                            })
                            .collect();
                        Value::from(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    Some(BasicKind::Int32) => {
                        let s: String = view
                            .iter()
                            .map(|r| match r.unnamed() {
                                Value::Int32(x) => char::from_u32(*x as u32)
                                    .unwrap_or(char::REPLACEMENT_CHARACTER),
                                _ => char::REPLACEMENT_CHARACTER,
                            })
                            .collect();
                        Value::from(s)
                    }
                    _ => return Err(conv_err(store, v, to)),
                }
            }
            Value::Nil => Value::str(""),
            other => {
                // Rune to string.
                if let Some(i) = scalar_i128(other) {
                    let c = char::from_u32(i as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
                    Value::str(c.to_string())
                } else {
                    return Err(conv_err(store, v, to));
                }
            }
        },
        BasicKind::UnsafePointer => match vu {
            Value::Pointer(p) => {
                let mut p = p.clone();
                p.typ = to;
                Value::Pointer(p)
            }
            Value::Uintptr(a) => Value::Uintptr(*a),
            Value::Nil => Value::Nil,
            _ => return Err(conv_err(store, v, to)),
        },
        _ => return Err(conv_err(store, v, to)),
    };
    if store.is_named(to) {
        Ok(Value::Named(Box::new(NamedVal { typ: to, val: raw })))
    } else {
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sago_ssa::types::builtin;

    #[test]
    fn test_wrapping_arithmetic() {
        let x = Value::Int8(127);
        let y = Value::Int8(1);
        assert_eq!(op_add(&x, &y).unwrap(), Value::Int8(-128));
        assert_eq!(op_mul(&Value::Uint8(16), &Value::Uint8(16)).unwrap(), Value::Uint8(0));
    }

    #[test]
    fn test_divide_by_zero() {
        let err = op_quo(&Value::Int(1), &Value::Int(0)).unwrap_err();
        match err {
            Panic::Runtime(e) => assert_eq!(e.0, "integer divide by zero"),
            _ => panic!("expected runtime panic"),
        }
        // Float division by zero is defined.
        assert_eq!(
            op_quo(&Value::Float64(1.0), &Value::Float64(0.0)).unwrap(),
            Value::Float64(f64::INFINITY)
        );
    }

    #[test]
    fn test_named_preserved() {
        let store = TypeStore::new();
        let myint = store.named("main", "MyInt", builtin::INT);
        let x = Value::Named(Box::new(NamedVal { typ: myint, val: Value::Int(3) }));
        let y = Value::Named(Box::new(NamedVal { typ: myint, val: Value::Int(4) }));
        match op_mul(&x, &y).unwrap() {
            Value::Named(n) => {
                assert_eq!(n.typ, myint);
                assert_eq!(n.val, Value::Int(12));
            }
            _ => panic!("expected named result"),
        }
    }

    #[test]
    fn test_shifts() {
        assert_eq!(op_shl(&Value::Int(1), &Value::Int(3)).unwrap(), Value::Int(8));
        assert_eq!(op_shl(&Value::Uint8(1), &Value::Int(9)).unwrap(), Value::Uint8(0));
        assert_eq!(op_shr(&Value::Int8(-8), &Value::Int(1)).unwrap(), Value::Int8(-4));
        assert_eq!(op_shr(&Value::Int8(-8), &Value::Int(100)).unwrap(), Value::Int8(-1));
        let err = op_shl(&Value::Int(1), &Value::Int(-1)).unwrap_err();
        match err {
            Panic::Runtime(e) => assert_eq!(e.0, "negative shift amount"),
            _ => panic!("expected runtime panic"),
        }
    }

    #[test]
    fn test_nil_equality() {
        let store = TypeStore::new();
        assert!(op_eql(&store, &Value::Nil, &Value::Nil, true, false).unwrap());
        assert!(op_eql(&store, &Value::Int(0), &Value::Nil, false, true).is_ok());
        assert!(!op_eql(&store, &Value::Int(0), &Value::Nil, false, true).unwrap());
    }

    #[test]
    fn test_string_conversions() {
        let store = TypeStore::new();
        let bytes = store.slice(builtin::UINT8);
        let v = convert(&store, &Value::str("hi"), bytes).unwrap();
        match &v {
            Value::Slice(s) => assert_eq!(s.len, 2),
            _ => panic!("expected slice"),
        }
        let back = convert(&store, &v, builtin::STRING).unwrap();
        assert_eq!(back, Value::str("hi"));
    }

    #[test]
    fn test_int_truncation() {
        let store = TypeStore::new();
        let v = convert(&store, &Value::Int(300), builtin::UINT8).unwrap();
        assert_eq!(v, Value::Uint8(44));
        let v = convert(&store, &Value::Float64(3.9), builtin::INT).unwrap();
        assert_eq!(v, Value::Int(3));
    }
}
