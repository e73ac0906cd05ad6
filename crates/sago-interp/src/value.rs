//! Boxed runtime values.
//!
//! Every runtime datum is a [`Value`]: a tagged sum with the primitive
//! kinds inline and composites behind cheap-to-clone handles. Assignment
//! semantics follow the source language: structs and arrays copy, slices
//! and maps share their backing store, pointers are projected places into
//! shared cells.

use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::IndexMap;
use num_complex::{Complex32, Complex64};
use parking_lot::Mutex;

use sago_ssa::types::{builtin, BasicKind, Type, TypeData, TypeStore};
use sago_ssa::ConstValue;

use crate::chan::ChanCore;
use crate::error::Panic;
use crate::registry::ExternFn;

/// A shared mutable cell, the target of heap allocation and globals.
pub type Cell = Arc<Mutex<Value>>;

/// Shared backing storage of slices.
pub type SliceBuf = Arc<Mutex<Vec<Value>>>;

#[derive(Clone)]
pub enum Value {
    /// The nil of pointers, slices, maps, channels, functions and
    /// interfaces, and the zero of all of them.
    Nil,
    Bool(bool),
    Int(i64),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint(u64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Uintptr(u64),
    Float32(f32),
    Float64(f64),
    Complex64(Complex32),
    Complex128(Complex64),
    Str(Arc<str>),
    Struct(Box<StructVal>),
    Array(Box<ArrayVal>),
    Slice(SliceVal),
    Map(MapVal),
    Chan(ChanVal),
    Pointer(PointerVal),
    Func(FuncVal),
    /// Multi-valued returns and comma-ok results.
    Tuple(Arc<[Value]>),
    /// A value of a named type whose underlying type is basic; composites
    /// carry their named type in their own header instead.
    Named(Box<NamedVal>),
    /// A range iterator (over a string or a map snapshot).
    Iter(IterVal),
}

/// Struct value: plain data, copied on assignment.
#[derive(Clone)]
pub struct StructVal {
    pub typ: Type,
    pub fields: Vec<Value>,
}

/// Array value: plain data, copied on assignment.
#[derive(Clone)]
pub struct ArrayVal {
    pub typ: Type,
    pub elems: Vec<Value>,
}

/// Backing storage of a slice: either its own shared buffer, or a view of
/// an array living in a pointer cell (`arr[:]` aliases the array).
#[derive(Clone)]
pub enum SliceBacking {
    Buf(SliceBuf),
    Array(Box<Place>),
}

/// Slice value: a view into shared backing storage.
#[derive(Clone)]
pub struct SliceVal {
    pub typ: Type,
    pub backing: SliceBacking,
    pub off: usize,
    pub len: usize,
    pub cap: usize,
}

impl SliceVal {
    pub fn from_vec(typ: Type, elems: Vec<Value>) -> SliceVal {
        let len = elems.len();
        SliceVal {
            typ,
            backing: SliceBacking::Buf(Arc::new(Mutex::new(elems))),
            off: 0,
            len,
            cap: len,
        }
    }

    /// A view of the array behind `place`, of length `len`.
    pub fn from_array_place(typ: Type, place: Place, len: usize) -> SliceVal {
        SliceVal { typ, backing: SliceBacking::Array(Box::new(place)), off: 0, len, cap: len }
    }

    pub fn get(&self, i: usize) -> Value {
        debug_assert!(i < self.len);
        match &self.backing {
            SliceBacking::Buf(buf) => buf.lock()[self.off + i].clone(),
            SliceBacking::Array(place) => place.with(|v| match v {
                Value::Array(a) => a.elems[self.off + i].clone(),
                _ => Value::Nil,
            }),
        }
    }

    pub fn set(&self, i: usize, val: Value) {
        debug_assert!(i < self.cap);
        match &self.backing {
            SliceBacking::Buf(buf) => buf.lock()[self.off + i] = val,
            SliceBacking::Array(place) => place.with(|v| {
                if let Value::Array(a) = v {
                    a.elems[self.off + i] = val;
                }
            }),
        }
    }

    /// The place of element `i`, for `&s[i]`.
    pub fn elem_place(&self, i: usize) -> Place {
        match &self.backing {
            SliceBacking::Buf(buf) => Place::SliceElem { buf: buf.clone(), index: self.off + i },
            SliceBacking::Array(place) => {
                Place::Index { base: place.clone(), index: self.off + i }
            }
        }
    }

    /// Clone out the visible elements.
    pub fn read_all(&self) -> Vec<Value> {
        match &self.backing {
            SliceBacking::Buf(buf) => {
                let b = buf.lock();
                b[self.off..self.off + self.len].to_vec()
            }
            SliceBacking::Array(place) => place.with(|v| match v {
                Value::Array(a) => a.elems[self.off..self.off + self.len].to_vec(),
                _ => Vec::new(),
            }),
        }
    }

    /// Identity of the backing store, for map keys and formatting.
    pub fn backing_id(&self) -> (usize, Vec<usize>) {
        match &self.backing {
            SliceBacking::Buf(buf) => (Arc::as_ptr(buf) as usize, Vec::new()),
            SliceBacking::Array(place) => place.addr_key(),
        }
    }

    /// The subview `self[lo..hi]` with capacity up to `max`.
    pub fn subslice(&self, lo: usize, hi: usize, max: usize) -> SliceVal {
        SliceVal {
            typ: self.typ,
            backing: self.backing.clone(),
            off: self.off + lo,
            len: hi - lo,
            cap: max - lo,
        }
    }
}

/// Map value: insertion-ordered shared storage keyed by structural
/// equality.
#[derive(Clone)]
pub struct MapVal {
    pub typ: Type,
    pub inner: Arc<Mutex<IndexMap<MapKey, Value>>>,
}

impl MapVal {
    pub fn new(typ: Type, reserve: usize) -> MapVal {
        MapVal { typ, inner: Arc::new(Mutex::new(IndexMap::with_capacity(reserve))) }
    }
}

/// Channel value.
#[derive(Clone)]
pub struct ChanVal {
    pub typ: Type,
    pub core: Arc<ChanCore>,
}

/// A pointer: a projected place inside shared storage.
#[derive(Clone)]
pub struct PointerVal {
    /// The pointer type (`*T`, or unsafe.Pointer after conversion).
    pub typ: Type,
    pub place: Place,
}

#[derive(Clone)]
pub enum Place {
    Cell(Cell),
    /// A struct field within the value at `base`.
    Field { base: Box<Place>, index: usize },
    /// An array element within the value at `base`.
    Index { base: Box<Place>, index: usize },
    /// An element of slice backing storage.
    SliceElem { buf: SliceBuf, index: usize },
}

impl Place {
    /// Run `f` on the pointed-at value.
    pub fn with<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        fn descend<R>(v: &mut Value, path: &[&Place], f: impl FnOnce(&mut Value) -> R) -> R {
            match path.split_last() {
                None => f(v),
                Some((step, rest)) => {
                    let slot = match (step, v) {
                        (Place::Field { index, .. }, Value::Struct(s)) => &mut s.fields[*index],
                        (Place::Index { index, .. }, Value::Array(a)) => &mut a.elems[*index],
                        (step, v) => {
                            // A projection through a pointer that no longer
                            // holds a composite reads as the whole value.
                            let _ = step;
                            return f(v);
                        }
                    };
                    descend(slot, rest, f)
                }
            }
        }

        // Collect the projection path root-first.
        let mut path: Vec<&Place> = Vec::new();
        let mut cur = self;
        loop {
            match cur {
                Place::Cell(cell) => {
                    let mut guard = cell.lock();
                    return descend(&mut guard, &path, f);
                }
                Place::SliceElem { buf, index } => {
                    let mut guard = buf.lock();
                    return descend(&mut guard[*index], &path, f);
                }
                Place::Field { base, .. } | Place::Index { base, .. } => {
                    path.push(cur);
                    cur = base;
                }
            }
        }
    }

    pub fn load(&self) -> Value {
        self.with(|v| v.clone())
    }

    pub fn store(&self, val: Value) {
        self.with(|v| *v = val);
    }

    /// Identity of the pointed-at location, for pointer equality and
    /// map keys.
    pub fn addr_key(&self) -> (usize, Vec<usize>) {
        let mut path = Vec::new();
        let mut cur = self;
        loop {
            match cur {
                Place::Cell(cell) => {
                    path.reverse();
                    return (Arc::as_ptr(cell) as usize, path);
                }
                Place::SliceElem { buf, index } => {
                    path.push(*index);
                    path.reverse();
                    return (Arc::as_ptr(buf) as usize, path);
                }
                Place::Field { base, index } | Place::Index { base, index } => {
                    path.push(*index);
                    cur = base;
                }
            }
        }
    }
}

impl PointerVal {
    pub fn new_cell(typ: Type, v: Value) -> PointerVal {
        PointerVal { typ, place: Place::Cell(Arc::new(Mutex::new(v))) }
    }
}

/// A function value.
#[derive(Clone)]
pub enum FuncVal {
    /// A compiled interpreter function plus its captured environment.
    Interp { func: Arc<crate::compile::Function>, env: Arc<Vec<Value>> },
    /// A native function from the registry or an override.
    Extern { name: Arc<str>, sig: Type, f: ExternFn },
}

impl FuncVal {
    pub fn sig(&self) -> Type {
        match self {
            FuncVal::Interp { func, .. } => func.sig,
            FuncVal::Extern { sig, .. } => *sig,
        }
    }

    fn ptr_id(&self) -> usize {
        match self {
            FuncVal::Interp { func, .. } => Arc::as_ptr(func) as usize,
            FuncVal::Extern { f, .. } => Arc::as_ptr(f) as *const () as usize,
        }
    }
}

#[derive(Clone)]
pub struct NamedVal {
    pub typ: Type,
    pub val: Value,
}

/// Range iteration state.
#[derive(Clone)]
pub struct IterVal {
    pub inner: Arc<Mutex<IterState>>,
}

pub enum IterState {
    /// Rune-wise iteration over a string; position is a byte offset.
    Str { s: Arc<str>, pos: usize },
    /// Iteration over a snapshot of the map's entries.
    Map { entries: VecDeque<(Value, Value)> },
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Arc::from(s.as_ref()))
    }

    /// True for the universal nil.
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Unwrap a named scalar down to its underlying representation.
    pub fn unnamed(&self) -> &Value {
        match self {
            Value::Named(n) => n.val.unnamed(),
            v => v,
        }
    }

    /// Rewrap a computed value with the named type of the operand it came
    /// from, preserving named types through arithmetic.
    pub fn rewrap_named(self, like: &Value) -> Value {
        match like {
            Value::Named(n) => Value::Named(Box::new(NamedVal { typ: n.typ, val: self })),
            _ => self,
        }
    }

    /// The dynamic type, as precise as the representation allows.
    pub fn type_of(&self, store: &TypeStore) -> Type {
        match self {
            Value::Nil => builtin::UNTYPED_NIL,
            Value::Bool(_) => builtin::BOOL,
            Value::Int(_) => builtin::INT,
            Value::Int8(_) => builtin::INT8,
            Value::Int16(_) => builtin::INT16,
            Value::Int32(_) => builtin::INT32,
            Value::Int64(_) => builtin::INT64,
            Value::Uint(_) => builtin::UINT,
            Value::Uint8(_) => builtin::UINT8,
            Value::Uint16(_) => builtin::UINT16,
            Value::Uint32(_) => builtin::UINT32,
            Value::Uint64(_) => builtin::UINT64,
            Value::Uintptr(_) => builtin::UINTPTR,
            Value::Float32(_) => builtin::FLOAT32,
            Value::Float64(_) => builtin::FLOAT64,
            Value::Complex64(_) => builtin::COMPLEX64,
            Value::Complex128(_) => builtin::COMPLEX128,
            Value::Str(_) => builtin::STRING,
            Value::Struct(s) => s.typ,
            Value::Array(a) => a.typ,
            Value::Slice(s) => s.typ,
            Value::Map(m) => m.typ,
            Value::Chan(c) => c.typ,
            Value::Pointer(p) => p.typ,
            Value::Func(f) => f.sig(),
            Value::Tuple(elems) => {
                let ts: Vec<Type> = elems.iter().map(|e| e.type_of(store)).collect();
                store.tuple(ts)
            }
            Value::Named(n) => n.typ,
            Value::Iter(_) => builtin::INVALID,
        }
    }

    /// Integer extraction for indexes, lengths and sizes.
    pub fn as_int(&self) -> Result<i64, Panic> {
        match self.unnamed() {
            Value::Int(v) | Value::Int64(v) => Ok(*v),
            Value::Int8(v) => Ok(*v as i64),
            Value::Int16(v) => Ok(*v as i64),
            Value::Int32(v) => Ok(*v as i64),
            Value::Uint(v) | Value::Uint64(v) | Value::Uintptr(v) => Ok(*v as i64),
            Value::Uint8(v) => Ok(*v as i64),
            Value::Uint16(v) => Ok(*v as i64),
            Value::Uint32(v) => Ok(*v as i64),
            v => Err(Panic::runtime(format!("cannot use {} as integer", v.kind_name()))),
        }
    }

    /// Shift-count extraction: unsigned widening; a negative signed count
    /// panics.
    pub fn as_shift_count(&self) -> Result<u64, Panic> {
        match self.unnamed() {
            Value::Uint(v) | Value::Uint64(v) | Value::Uintptr(v) => Ok(*v),
            Value::Uint8(v) => Ok(*v as u64),
            Value::Uint16(v) => Ok(*v as u64),
            Value::Uint32(v) => Ok(*v as u64),
            other => {
                let n = other.as_int()?;
                if n < 0 {
                    Err(Panic::runtime("negative shift amount"))
                } else {
                    Ok(n as u64)
                }
            }
        }
    }

    pub fn as_bool(&self) -> bool {
        matches!(self.unnamed(), Value::Bool(true))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Int8(_) => "int8",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Uint(_) => "uint",
            Value::Uint8(_) => "uint8",
            Value::Uint16(_) => "uint16",
            Value::Uint32(_) => "uint32",
            Value::Uint64(_) => "uint64",
            Value::Uintptr(_) => "uintptr",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::Complex64(_) => "complex64",
            Value::Complex128(_) => "complex128",
            Value::Str(_) => "string",
            Value::Struct(_) => "struct",
            Value::Array(_) => "array",
            Value::Slice(_) => "slice",
            Value::Map(_) => "map",
            Value::Chan(_) => "chan",
            Value::Pointer(_) => "pointer",
            Value::Func(_) => "func",
            Value::Tuple(_) => "tuple",
            Value::Named(n) => n.val.kind_name(),
            Value::Iter(_) => "iter",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(Arc::from(s.as_str()))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

/// Structural equality where it is cheap and well-defined; composites with
/// shared interiors compare by identity. Used by tests and the map-key
/// wrapper; the comparison *operators* live in `ops` and add nil-const
/// handling on top.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        key_eq(self, other)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind_name(), format_value(self))
    }
}

/// The zero value of a type.
pub fn zero_value(store: &TypeStore, t: Type) -> Value {
    let under = store.underlying(t);
    match store.data(under) {
        TypeData::Basic(kind) => {
            let z = zero_basic(kind);
            if store.is_named(t) {
                Value::Named(Box::new(NamedVal { typ: t, val: z }))
            } else {
                z
            }
        }
        TypeData::Struct { fields } => Value::Struct(Box::new(StructVal {
            typ: t,
            fields: fields.iter().map(|f| zero_value(store, f.typ)).collect(),
        })),
        TypeData::Array { elem, len } => Value::Array(Box::new(ArrayVal {
            typ: t,
            elems: (0..len).map(|_| zero_value(store, elem)).collect(),
        })),
        TypeData::Tuple(elems) => {
            let vals: Vec<Value> = elems.iter().map(|e| zero_value(store, *e)).collect();
            Value::Tuple(vals.into())
        }
        // Pointer, slice, map, chan, interface, signature: nil.
        _ => Value::Nil,
    }
}

fn int_const(i: i64, u: u64, kind: BasicKind) -> Value {
    match kind {
        BasicKind::Int8 => Value::Int8(i as i8),
        BasicKind::Int16 => Value::Int16(i as i16),
        BasicKind::Int32 | BasicKind::UntypedRune => Value::Int32(i as i32),
        BasicKind::Int64 => Value::Int64(i),
        BasicKind::Uint => Value::Uint(u),
        BasicKind::Uint8 => Value::Uint8(u as u8),
        BasicKind::Uint16 => Value::Uint16(u as u16),
        BasicKind::Uint32 => Value::Uint32(u as u32),
        BasicKind::Uint64 => Value::Uint64(u),
        BasicKind::Uintptr => Value::Uintptr(u),
        BasicKind::Float32 => Value::Float32(i as f32),
        BasicKind::Float64 | BasicKind::UntypedFloat => Value::Float64(i as f64),
        BasicKind::Complex64 => Value::Complex64(Complex32::new(i as f32, 0.0)),
        BasicKind::Complex128 | BasicKind::UntypedComplex => {
            Value::Complex128(Complex64::new(i as f64, 0.0))
        }
        BasicKind::String | BasicKind::UntypedString => {
            // A rune constant converted to string.
            let c = char::from_u32(u as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
            Value::str(c.to_string())
        }
        _ => Value::Int(i),
    }
}

fn zero_basic(kind: BasicKind) -> Value {
    match kind {
        BasicKind::Bool | BasicKind::UntypedBool => Value::Bool(false),
        BasicKind::Int | BasicKind::UntypedInt => Value::Int(0),
        BasicKind::Int8 => Value::Int8(0),
        BasicKind::Int16 => Value::Int16(0),
        BasicKind::Int32 | BasicKind::UntypedRune => Value::Int32(0),
        BasicKind::Int64 => Value::Int64(0),
        BasicKind::Uint => Value::Uint(0),
        BasicKind::Uint8 => Value::Uint8(0),
        BasicKind::Uint16 => Value::Uint16(0),
        BasicKind::Uint32 => Value::Uint32(0),
        BasicKind::Uint64 => Value::Uint64(0),
        BasicKind::Uintptr => Value::Uintptr(0),
        BasicKind::Float32 => Value::Float32(0.0),
        BasicKind::Float64 | BasicKind::UntypedFloat => Value::Float64(0.0),
        BasicKind::Complex64 => Value::Complex64(Complex32::new(0.0, 0.0)),
        BasicKind::Complex128 | BasicKind::UntypedComplex => {
            Value::Complex128(Complex64::new(0.0, 0.0))
        }
        BasicKind::String | BasicKind::UntypedString => Value::str(""),
        _ => Value::Nil,
    }
}

/// Project a constant into a runtime value, tagged per the basic kind of
/// its declared type.
pub fn const_to_value(store: &TypeStore, cv: &ConstValue, typ: Type) -> Value {
    if matches!(cv, ConstValue::Nil) {
        return Value::Nil;
    }
    let kind = store.basic_kind(typ).unwrap_or(BasicKind::Invalid);
    let raw = match cv {
        ConstValue::Bool(b) => Value::Bool(*b),
        ConstValue::Str(s) => Value::str(s),
        ConstValue::Int(v) => int_const(*v, *v as u64, kind),
        ConstValue::Uint(v) => int_const(*v as i64, *v, kind),
        ConstValue::Float(v) => match kind {
            BasicKind::Float32 => Value::Float32(*v as f32),
            _ => Value::Float64(*v),
        },
        ConstValue::Complex(v) => match kind {
            BasicKind::Complex64 => Value::Complex64(Complex32::new(v.re as f32, v.im as f32)),
            _ => Value::Complex128(*v),
        },
        ConstValue::Nil => Value::Nil,
    };
    if store.is_named(typ) {
        Value::Named(Box::new(NamedVal { typ, val: raw }))
    } else {
        raw
    }
}

// ---- map keys ----

/// A map key: a value compared and hashed structurally. Keys of flagged
/// blank-field struct types are normalized before wrapping, so plain
/// structural identity is the right equivalence here.
#[derive(Clone)]
pub struct MapKey(pub Value);

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        key_eq(&self.0, &other.0)
    }
}

impl Eq for MapKey {}

impl std::hash::Hash for MapKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        key_hash(&self.0, state);
    }
}

pub(crate) fn key_eq(a: &Value, b: &Value) -> bool {
    match (a.unnamed(), b.unnamed()) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Int8(x), Value::Int8(y)) => x == y,
        (Value::Int16(x), Value::Int16(y)) => x == y,
        (Value::Int32(x), Value::Int32(y)) => x == y,
        (Value::Int64(x), Value::Int64(y)) => x == y,
        (Value::Uint(x), Value::Uint(y)) => x == y,
        (Value::Uint8(x), Value::Uint8(y)) => x == y,
        (Value::Uint16(x), Value::Uint16(y)) => x == y,
        (Value::Uint32(x), Value::Uint32(y)) => x == y,
        (Value::Uint64(x), Value::Uint64(y)) => x == y,
        (Value::Uintptr(x), Value::Uintptr(y)) => x == y,
        (Value::Float32(x), Value::Float32(y)) => x == y,
        (Value::Float64(x), Value::Float64(y)) => x == y,
        (Value::Complex64(x), Value::Complex64(y)) => x == y,
        (Value::Complex128(x), Value::Complex128(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Struct(x), Value::Struct(y)) => {
            x.fields.len() == y.fields.len()
                && x.fields.iter().zip(y.fields.iter()).all(|(a, b)| key_eq(a, b))
        }
        (Value::Array(x), Value::Array(y)) => {
            x.elems.len() == y.elems.len()
                && x.elems.iter().zip(y.elems.iter()).all(|(a, b)| key_eq(a, b))
        }
        (Value::Pointer(x), Value::Pointer(y)) => x.place.addr_key() == y.place.addr_key(),
        (Value::Chan(x), Value::Chan(y)) => Arc::ptr_eq(&x.core, &y.core),
        (Value::Map(x), Value::Map(y)) => Arc::ptr_eq(&x.inner, &y.inner),
        (Value::Slice(x), Value::Slice(y)) => {
            x.backing_id() == y.backing_id() && x.off == y.off && x.len == y.len
        }
        (Value::Func(x), Value::Func(y)) => x.ptr_id() == y.ptr_id(),
        (Value::Tuple(x), Value::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| key_eq(a, b))
        }
        _ => false,
    }
}

pub(crate) fn key_hash<H: std::hash::Hasher>(v: &Value, state: &mut H) {
    use std::hash::Hash;
    match v.unnamed() {
        Value::Nil => 0u8.hash(state),
        Value::Bool(x) => x.hash(state),
        Value::Int(x) | Value::Int64(x) => x.hash(state),
        Value::Int8(x) => (*x as i64).hash(state),
        Value::Int16(x) => (*x as i64).hash(state),
        Value::Int32(x) => (*x as i64).hash(state),
        Value::Uint(x) | Value::Uint64(x) | Value::Uintptr(x) => x.hash(state),
        Value::Uint8(x) => (*x as u64).hash(state),
        Value::Uint16(x) => (*x as u64).hash(state),
        Value::Uint32(x) => (*x as u64).hash(state),
        Value::Float32(x) => x.to_bits().hash(state),
        Value::Float64(x) => x.to_bits().hash(state),
        Value::Complex64(x) => {
            x.re.to_bits().hash(state);
            x.im.to_bits().hash(state);
        }
        Value::Complex128(x) => {
            x.re.to_bits().hash(state);
            x.im.to_bits().hash(state);
        }
        Value::Str(x) => x.hash(state),
        Value::Struct(x) => {
            for f in &x.fields {
                key_hash(f, state);
            }
        }
        Value::Array(x) => {
            for e in &x.elems {
                key_hash(e, state);
            }
        }
        Value::Pointer(x) => x.place.addr_key().hash(state),
        Value::Chan(x) => (Arc::as_ptr(&x.core) as usize).hash(state),
        Value::Map(x) => (Arc::as_ptr(&x.inner) as usize).hash(state),
        Value::Slice(x) => {
            x.backing_id().hash(state);
            x.off.hash(state);
        }
        Value::Func(x) => x.ptr_id().hash(state),
        Value::Tuple(x) => {
            for e in x.iter() {
                key_hash(e, state);
            }
        }
        Value::Named(_) | Value::Iter(_) => 0u8.hash(state),
    }
}

// ---- rendering ----

/// The generic print renderer.
pub fn format_value(v: &Value) -> String {
    match v {
        Value::Nil => "<nil>".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(x) => x.to_string(),
        Value::Int8(x) => x.to_string(),
        Value::Int16(x) => x.to_string(),
        Value::Int32(x) => x.to_string(),
        Value::Int64(x) => x.to_string(),
        Value::Uint(x) => x.to_string(),
        Value::Uint8(x) => x.to_string(),
        Value::Uint16(x) => x.to_string(),
        Value::Uint32(x) => x.to_string(),
        Value::Uint64(x) => x.to_string(),
        Value::Uintptr(x) => x.to_string(),
        Value::Float32(x) => format_float(*x as f64),
        Value::Float64(x) => format_float(*x),
        Value::Complex64(x) => format!("({}{}i)", format_float(x.re as f64), format_signed(x.im as f64)),
        Value::Complex128(x) => format!("({}{}i)", format_float(x.re), format_signed(x.im)),
        Value::Str(s) => s.to_string(),
        Value::Struct(s) => {
            let body: Vec<String> = s.fields.iter().map(format_value).collect();
            format!("{{{}}}", body.join(" "))
        }
        Value::Array(a) => {
            let body: Vec<String> = a.elems.iter().map(format_value).collect();
            format!("[{}]", body.join(" "))
        }
        Value::Slice(s) => {
            let body: Vec<String> = s.read_all().iter().map(format_value).collect();
            format!("[{}]", body.join(" "))
        }
        Value::Map(m) => {
            let inner = m.inner.lock();
            let body: Vec<String> = inner
                .iter()
                .map(|(k, v)| format!("{}:{}", format_value(&k.0), format_value(v)))
                .collect();
            format!("map[{}]", body.join(" "))
        }
        Value::Chan(c) => format!("0x{:x}", Arc::as_ptr(&c.core) as usize),
        Value::Pointer(p) => format!("0x{:x}", p.place.addr_key().0),
        Value::Func(f) => format!("0x{:x}", f.ptr_id()),
        Value::Tuple(elems) => {
            let body: Vec<String> = elems.iter().map(format_value).collect();
            format!("({})", body.join(", "))
        }
        Value::Named(n) => format_value(&n.val),
        Value::Iter(_) => "<iter>".to_string(),
    }
}

/// The interface-argument renderer used by print/println when the static
/// argument type is an interface: the dynamic value decides the rendering.
pub fn format_interface(v: &Value) -> String {
    format_value(v)
}

fn format_float(f: f64) -> String {
    format!("{}", f)
}

fn format_signed(f: f64) -> String {
    if f.is_sign_negative() {
        format!("{}", f)
    } else {
        format!("+{}", f)
    }
}

/// Normalize a map key of a flagged blank-field struct type: every blank
/// field (recursively) is replaced with its zero value, collapsing an
/// equivalence class to one representative.
pub fn normalize_blank_key(store: &TypeStore, key: &mut Value) {
    let typ = match key {
        Value::Struct(s) => s.typ,
        Value::Named(n) => {
            normalize_blank_key(store, &mut n.val);
            return;
        }
        _ => return,
    };
    if let TypeData::Struct { fields } = store.data(store.underlying(typ)) {
        if let Value::Struct(s) = key {
            for (i, f) in fields.iter().enumerate() {
                if f.is_blank() {
                    s.fields[i] = zero_value(store, f.typ);
                } else {
                    normalize_blank_key(store, &mut s.fields[i]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sago_ssa::types::Field;

    #[test]
    fn test_zero_values() {
        let store = TypeStore::new();
        assert_eq!(zero_value(&store, builtin::INT), Value::Int(0));
        assert_eq!(zero_value(&store, builtin::STRING), Value::str(""));
        assert!(zero_value(&store, store.slice(builtin::INT)).is_nil());
        let st = store.struct_of(vec![
            Field::new("a", builtin::INT),
            Field::new("b", builtin::STRING),
        ]);
        match zero_value(&store, st) {
            Value::Struct(s) => {
                assert_eq!(s.fields[0], Value::Int(0));
                assert_eq!(s.fields[1], Value::str(""));
            }
            _ => panic!("expected struct"),
        }
    }

    #[test]
    fn test_place_projection() {
        let store = TypeStore::new();
        let st = store.struct_of(vec![
            Field::new("a", builtin::INT),
            Field::new("b", builtin::INT),
        ]);
        let cell: Cell = Arc::new(Mutex::new(zero_value(&store, st)));
        let field1 = Place::Field { base: Box::new(Place::Cell(cell.clone())), index: 1 };
        field1.store(Value::Int(42));
        assert_eq!(field1.load(), Value::Int(42));
        match &*cell.lock() {
            Value::Struct(s) => assert_eq!(s.fields[1], Value::Int(42)),
            _ => panic!("expected struct"),
        };
    }

    #[test]
    fn test_named_rewrap() {
        let store = TypeStore::new();
        let myint = store.named("main", "MyInt", builtin::INT);
        let v = Value::Named(Box::new(NamedVal { typ: myint, val: Value::Int(7) }));
        let sum = Value::Int(14).rewrap_named(&v);
        match &sum {
            Value::Named(n) => {
                assert_eq!(n.typ, myint);
                assert_eq!(n.val, Value::Int(14));
            }
            _ => panic!("expected named"),
        }
        assert_eq!(*v.unnamed(), Value::Int(7));
    }

    #[test]
    fn test_blank_key_normalization() {
        let store = TypeStore::new();
        let st = store.struct_of(vec![
            Field::new("x", builtin::INT),
            Field::new("_", builtin::INT),
        ]);
        let mk = |x: i64, blank: i64| {
            Value::Struct(Box::new(StructVal {
                typ: st,
                fields: vec![Value::Int(x), Value::Int(blank)],
            }))
        };
        let mut a = mk(1, 10);
        let mut b = mk(1, 20);
        assert_ne!(a, b);
        normalize_blank_key(&store, &mut a);
        normalize_blank_key(&store, &mut b);
        assert_eq!(a, b);
    }
}
