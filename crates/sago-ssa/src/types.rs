//! Interned type store for SSA programs.
//!
//! Types are compact ids into a shared store. Structural types (pointers,
//! slices, maps, ...) are interned, so two structurally identical types get
//! the same id; named types mint a fresh id per declaration, which keeps
//! same-named types from different scopes distinct.
//!
//! The store is shared between the program builder, the package registry
//! and the interpreter, and may grow at runtime (conversions and zero-value
//! construction can demand types that never appear in the source program),
//! so all operations go through an interior lock.

use core::fmt;

use hashbrown::HashMap;
use parking_lot::RwLock;

/// A type handle: an index into a [`TypeStore`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Type(pub(crate) u32);

impl Type {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Type(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type({})", self.0)
    }
}

/// Well-known type ids, fixed by [`TypeStore::new`].
pub mod builtin {
    use super::Type;

    pub const INVALID: Type = Type(0);
    pub const BOOL: Type = Type(1);
    pub const INT: Type = Type(2);
    pub const INT8: Type = Type(3);
    pub const INT16: Type = Type(4);
    pub const INT32: Type = Type(5);
    pub const INT64: Type = Type(6);
    pub const UINT: Type = Type(7);
    pub const UINT8: Type = Type(8);
    pub const UINT16: Type = Type(9);
    pub const UINT32: Type = Type(10);
    pub const UINT64: Type = Type(11);
    pub const UINTPTR: Type = Type(12);
    pub const FLOAT32: Type = Type(13);
    pub const FLOAT64: Type = Type(14);
    pub const COMPLEX64: Type = Type(15);
    pub const COMPLEX128: Type = Type(16);
    pub const STRING: Type = Type(17);
    pub const UNSAFE_POINTER: Type = Type(18);
    pub const UNTYPED_NIL: Type = Type(19);
    pub const UNTYPED_BOOL: Type = Type(20);
    pub const UNTYPED_INT: Type = Type(21);
    pub const UNTYPED_RUNE: Type = Type(22);
    pub const UNTYPED_FLOAT: Type = Type(23);
    pub const UNTYPED_COMPLEX: Type = Type(24);
    pub const UNTYPED_STRING: Type = Type(25);
    /// `interface{}`.
    pub const ANY: Type = Type(26);

    pub(super) const COUNT: usize = 27;
}

/// Kinds of basic (non-composite) types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BasicKind {
    Invalid,
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Uintptr,
    Float32,
    Float64,
    Complex64,
    Complex128,
    String,
    UnsafePointer,
    UntypedNil,
    UntypedBool,
    UntypedInt,
    UntypedRune,
    UntypedFloat,
    UntypedComplex,
    UntypedString,
}

impl BasicKind {
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            BasicKind::Int
                | BasicKind::Int8
                | BasicKind::Int16
                | BasicKind::Int32
                | BasicKind::Int64
                | BasicKind::Uint
                | BasicKind::Uint8
                | BasicKind::Uint16
                | BasicKind::Uint32
                | BasicKind::Uint64
                | BasicKind::Uintptr
                | BasicKind::UntypedInt
                | BasicKind::UntypedRune
        )
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            BasicKind::Uint
                | BasicKind::Uint8
                | BasicKind::Uint16
                | BasicKind::Uint32
                | BasicKind::Uint64
                | BasicKind::Uintptr
        )
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            BasicKind::Float32 | BasicKind::Float64 | BasicKind::UntypedFloat
        )
    }

    pub fn is_complex(self) -> bool {
        matches!(
            self,
            BasicKind::Complex64 | BasicKind::Complex128 | BasicKind::UntypedComplex
        )
    }

    pub fn is_untyped(self) -> bool {
        matches!(
            self,
            BasicKind::UntypedNil
                | BasicKind::UntypedBool
                | BasicKind::UntypedInt
                | BasicKind::UntypedRune
                | BasicKind::UntypedFloat
                | BasicKind::UntypedComplex
                | BasicKind::UntypedString
        )
    }

    fn name(self) -> &'static str {
        match self {
            BasicKind::Invalid => "invalid",
            BasicKind::Bool => "bool",
            BasicKind::Int => "int",
            BasicKind::Int8 => "int8",
            BasicKind::Int16 => "int16",
            BasicKind::Int32 => "int32",
            BasicKind::Int64 => "int64",
            BasicKind::Uint => "uint",
            BasicKind::Uint8 => "uint8",
            BasicKind::Uint16 => "uint16",
            BasicKind::Uint32 => "uint32",
            BasicKind::Uint64 => "uint64",
            BasicKind::Uintptr => "uintptr",
            BasicKind::Float32 => "float32",
            BasicKind::Float64 => "float64",
            BasicKind::Complex64 => "complex64",
            BasicKind::Complex128 => "complex128",
            BasicKind::String => "string",
            BasicKind::UnsafePointer => "unsafe.Pointer",
            BasicKind::UntypedNil => "untyped nil",
            BasicKind::UntypedBool => "untyped bool",
            BasicKind::UntypedInt => "untyped int",
            BasicKind::UntypedRune => "untyped rune",
            BasicKind::UntypedFloat => "untyped float",
            BasicKind::UntypedComplex => "untyped complex",
            BasicKind::UntypedString => "untyped string",
        }
    }
}

/// Channel direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChanDir {
    SendRecv,
    SendOnly,
    RecvOnly,
}

/// One struct field. A field named `_` is blank: it participates in layout
/// but never in comparison or map-key identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub typ: Type,
}

impl Field {
    pub fn new(name: impl Into<String>, typ: Type) -> Self {
        Field { name: name.into(), typ }
    }

    #[inline]
    pub fn is_blank(&self) -> bool {
        self.name == "_"
    }
}

/// One interface or named-type method: name plus signature type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Method {
    pub name: String,
    pub sig: Type,
}

/// Structure of a type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeData {
    Basic(BasicKind),
    Pointer(Type),
    Slice(Type),
    Array { elem: Type, len: usize },
    Map { key: Type, value: Type },
    Chan { dir: ChanDir, elem: Type },
    Struct { fields: Vec<Field> },
    Interface { methods: Vec<Method> },
    Signature { params: Vec<Type>, results: Vec<Type>, variadic: bool },
    Tuple(Vec<Type>),
    Named {
        pkg: String,
        name: String,
        underlying: Type,
        methods: Vec<Method>,
    },
}

struct StoreInner {
    types: Vec<TypeData>,
    // Structural interning; named types never enter this table.
    interned: HashMap<TypeData, Type>,
}

/// The shared type store.
pub struct TypeStore {
    inner: RwLock<StoreInner>,
}

impl TypeStore {
    pub fn new() -> Self {
        let mut types = Vec::with_capacity(builtin::COUNT);
        for kind in [
            BasicKind::Invalid,
            BasicKind::Bool,
            BasicKind::Int,
            BasicKind::Int8,
            BasicKind::Int16,
            BasicKind::Int32,
            BasicKind::Int64,
            BasicKind::Uint,
            BasicKind::Uint8,
            BasicKind::Uint16,
            BasicKind::Uint32,
            BasicKind::Uint64,
            BasicKind::Uintptr,
            BasicKind::Float32,
            BasicKind::Float64,
            BasicKind::Complex64,
            BasicKind::Complex128,
            BasicKind::String,
            BasicKind::UnsafePointer,
            BasicKind::UntypedNil,
            BasicKind::UntypedBool,
            BasicKind::UntypedInt,
            BasicKind::UntypedRune,
            BasicKind::UntypedFloat,
            BasicKind::UntypedComplex,
            BasicKind::UntypedString,
        ] {
            types.push(TypeData::Basic(kind));
        }
        types.push(TypeData::Interface { methods: Vec::new() });
        debug_assert_eq!(types.len(), builtin::COUNT);
        TypeStore {
            inner: RwLock::new(StoreInner { types, interned: HashMap::new() }),
        }
    }

    fn intern(&self, data: TypeData) -> Type {
        let mut inner = self.inner.write();
        if let Some(&t) = inner.interned.get(&data) {
            return t;
        }
        let t = Type(inner.types.len() as u32);
        inner.types.push(data.clone());
        inner.interned.insert(data, t);
        t
    }

    pub fn pointer(&self, elem: Type) -> Type {
        self.intern(TypeData::Pointer(elem))
    }

    pub fn slice(&self, elem: Type) -> Type {
        self.intern(TypeData::Slice(elem))
    }

    pub fn array(&self, elem: Type, len: usize) -> Type {
        self.intern(TypeData::Array { elem, len })
    }

    pub fn map(&self, key: Type, value: Type) -> Type {
        self.intern(TypeData::Map { key, value })
    }

    pub fn chan(&self, dir: ChanDir, elem: Type) -> Type {
        self.intern(TypeData::Chan { dir, elem })
    }

    pub fn struct_of(&self, fields: Vec<Field>) -> Type {
        self.intern(TypeData::Struct { fields })
    }

    pub fn interface(&self, mut methods: Vec<Method>) -> Type {
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        self.intern(TypeData::Interface { methods })
    }

    pub fn signature(&self, params: Vec<Type>, results: Vec<Type>, variadic: bool) -> Type {
        self.intern(TypeData::Signature { params, results, variadic })
    }

    pub fn tuple(&self, elems: Vec<Type>) -> Type {
        self.intern(TypeData::Tuple(elems))
    }

    /// Declare a named type. Every call mints a distinct identity, even for
    /// the same package/name pair.
    pub fn named(&self, pkg: impl Into<String>, name: impl Into<String>, underlying: Type) -> Type {
        let mut inner = self.inner.write();
        let t = Type(inner.types.len() as u32);
        inner.types.push(TypeData::Named {
            pkg: pkg.into(),
            name: name.into(),
            underlying,
            methods: Vec::new(),
        });
        t
    }

    /// Patch a named type's underlying type (for recursive declarations).
    pub fn set_underlying(&self, named: Type, underlying: Type) {
        let mut inner = self.inner.write();
        match &mut inner.types[named.0 as usize] {
            TypeData::Named { underlying: u, .. } => *u = underlying,
            other => panic!("set_underlying on non-named type {:?}", other),
        }
    }

    /// Record a method signature on a named type.
    pub fn add_method(&self, named: Type, name: impl Into<String>, sig: Type) {
        let mut inner = self.inner.write();
        match &mut inner.types[named.0 as usize] {
            TypeData::Named { methods, .. } => {
                methods.push(Method { name: name.into(), sig })
            }
            other => panic!("add_method on non-named type {:?}", other),
        }
    }

    pub fn data(&self, t: Type) -> TypeData {
        self.inner.read().types[t.0 as usize].clone()
    }

    /// Resolve through named types to the underlying structure.
    pub fn underlying(&self, t: Type) -> Type {
        let inner = self.inner.read();
        let mut cur = t;
        loop {
            match &inner.types[cur.0 as usize] {
                TypeData::Named { underlying, .. } => cur = *underlying,
                _ => return cur,
            }
        }
    }

    pub fn is_named(&self, t: Type) -> bool {
        matches!(self.inner.read().types[t.0 as usize], TypeData::Named { .. })
    }

    pub fn basic_kind(&self, t: Type) -> Option<BasicKind> {
        match self.data(self.underlying(t)) {
            TypeData::Basic(k) => Some(k),
            _ => None,
        }
    }

    /// Element type of a pointer, slice, array or channel; `None` otherwise.
    pub fn elem(&self, t: Type) -> Option<Type> {
        match self.data(self.underlying(t)) {
            TypeData::Pointer(e) | TypeData::Slice(e) => Some(e),
            TypeData::Array { elem, .. } => Some(elem),
            TypeData::Chan { elem, .. } => Some(elem),
            _ => None,
        }
    }

    pub fn is_interface(&self, t: Type) -> bool {
        matches!(self.data(self.underlying(t)), TypeData::Interface { .. })
    }

    pub fn is_empty_interface(&self, t: Type) -> bool {
        matches!(self.data(self.underlying(t)), TypeData::Interface { methods } if methods.is_empty())
    }

    /// Method set of a type: the declared methods of the named type (shared
    /// with its pointer type), or the interface's method list.
    pub fn method_set(&self, t: Type) -> Vec<Method> {
        let base = match self.data(t) {
            TypeData::Pointer(e) => e,
            _ => t,
        };
        match self.data(base) {
            TypeData::Named { methods, underlying, .. } => {
                if methods.is_empty() {
                    if let TypeData::Interface { methods } = self.data(self.underlying(underlying))
                    {
                        return methods;
                    }
                }
                methods
            }
            TypeData::Interface { methods } => methods,
            _ => Vec::new(),
        }
    }

    /// Check that `t`'s method set covers interface `iface`. On failure the
    /// name of the first missing method is returned.
    pub fn implements(&self, t: Type, iface: Type) -> Result<(), String> {
        let want = match self.data(self.underlying(iface)) {
            TypeData::Interface { methods } => methods,
            _ => return Ok(()),
        };
        let have = self.method_set(t);
        for m in &want {
            if !have.iter().any(|h| h.name == m.name) {
                return Err(m.name.clone());
            }
        }
        Ok(())
    }

    /// Go-style assignability, reduced to what the interpreter needs:
    /// identity, identical underlying with at most one side named,
    /// interface satisfaction, and untyped nil to any nil-able kind.
    pub fn assignable(&self, from: Type, to: Type) -> bool {
        if from == to {
            return true;
        }
        if self.basic_kind(from) == Some(BasicKind::UntypedNil) {
            return self.is_nilable(to);
        }
        if self.is_interface(to) {
            return self.implements(from, to).is_ok();
        }
        let fu = self.underlying(from);
        let tu = self.underlying(to);
        fu == tu && (!self.is_named(from) || !self.is_named(to))
    }

    /// Whether values of this type can be nil.
    pub fn is_nilable(&self, t: Type) -> bool {
        matches!(
            self.data(self.underlying(t)),
            TypeData::Pointer(_)
                | TypeData::Slice(_)
                | TypeData::Map { .. }
                | TypeData::Chan { .. }
                | TypeData::Interface { .. }
                | TypeData::Signature { .. }
                | TypeData::Basic(BasicKind::UnsafePointer)
                | TypeData::Basic(BasicKind::UntypedNil)
        )
    }

    /// Whether a struct type (possibly named) contains a blank field,
    /// directly or through nested struct fields.
    pub fn has_blank_field(&self, t: Type) -> bool {
        match self.data(self.underlying(t)) {
            TypeData::Struct { fields } => fields
                .iter()
                .any(|f| f.is_blank() || self.has_blank_field(f.typ)),
            _ => false,
        }
    }

    /// Human-readable type name, used in runtime error messages.
    pub fn type_string(&self, t: Type) -> String {
        match self.data(t) {
            TypeData::Basic(k) => k.name().to_string(),
            TypeData::Pointer(e) => format!("*{}", self.type_string(e)),
            TypeData::Slice(e) => format!("[]{}", self.type_string(e)),
            TypeData::Array { elem, len } => format!("[{}]{}", len, self.type_string(elem)),
            TypeData::Map { key, value } => {
                format!("map[{}]{}", self.type_string(key), self.type_string(value))
            }
            TypeData::Chan { dir, elem } => match dir {
                ChanDir::SendRecv => format!("chan {}", self.type_string(elem)),
                ChanDir::SendOnly => format!("chan<- {}", self.type_string(elem)),
                ChanDir::RecvOnly => format!("<-chan {}", self.type_string(elem)),
            },
            TypeData::Struct { fields } => {
                let body: Vec<String> = fields
                    .iter()
                    .map(|f| format!("{} {}", f.name, self.type_string(f.typ)))
                    .collect();
                format!("struct{{{}}}", body.join("; "))
            }
            TypeData::Interface { methods } => {
                if methods.is_empty() {
                    "interface{}".to_string()
                } else {
                    let body: Vec<String> =
                        methods.iter().map(|m| m.name.clone()).collect();
                    format!("interface{{{}}}", body.join("; "))
                }
            }
            TypeData::Signature { params, results, variadic } => {
                let mut ps: Vec<String> =
                    params.iter().map(|p| self.type_string(*p)).collect();
                if variadic {
                    if let Some(last) = ps.last_mut() {
                        let elem = last.trim_start_matches("[]").to_string();
                        *last = format!("...{}", elem);
                    }
                }
                let rs: Vec<String> = results.iter().map(|r| self.type_string(*r)).collect();
                match rs.len() {
                    0 => format!("func({})", ps.join(", ")),
                    1 => format!("func({}) {}", ps.join(", "), rs[0]),
                    _ => format!("func({}) ({})", ps.join(", "), rs.join(", ")),
                }
            }
            TypeData::Tuple(elems) => {
                let body: Vec<String> = elems.iter().map(|e| self.type_string(*e)).collect();
                format!("({})", body.join(", "))
            }
            TypeData::Named { pkg, name, .. } => {
                if pkg.is_empty() {
                    name
                } else {
                    format!("{}.{}", pkg, name)
                }
            }
        }
    }

    /// Number of result slots a signature produces.
    pub fn result_arity(&self, sig: Type) -> usize {
        match self.data(self.underlying(sig)) {
            TypeData::Signature { results, .. } => results.len(),
            _ => 0,
        }
    }
}

impl Default for TypeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_interning() {
        let store = TypeStore::new();
        let a = store.slice(builtin::INT);
        let b = store.slice(builtin::INT);
        assert_eq!(a, b);
        let c = store.map(builtin::STRING, a);
        let d = store.map(builtin::STRING, b);
        assert_eq!(c, d);
        assert_ne!(a, c);
    }

    #[test]
    fn test_named_identity_is_fresh() {
        let store = TypeStore::new();
        let t1 = store.named("main", "T", builtin::INT);
        let t2 = store.named("main", "T", builtin::INT);
        assert_ne!(t1, t2);
        assert_eq!(store.underlying(t1), builtin::INT);
        assert_eq!(store.type_string(t1), "main.T");
    }

    #[test]
    fn test_assignability() {
        let store = TypeStore::new();
        let named = store.named("main", "MyInt", builtin::INT);
        assert!(store.assignable(builtin::INT, named));
        assert!(store.assignable(named, builtin::INT));
        let other = store.named("main", "OtherInt", builtin::INT);
        assert!(!store.assignable(named, other));
        assert!(store.assignable(builtin::UNTYPED_NIL, store.slice(builtin::INT)));
        assert!(!store.assignable(builtin::UNTYPED_NIL, builtin::INT));
    }

    #[test]
    fn test_implements() {
        let store = TypeStore::new();
        let sig = store.signature(vec![], vec![builtin::STRING], false);
        let stringer = store.interface(vec![Method { name: "String".into(), sig }]);
        let t = store.named("main", "T", builtin::INT);
        assert_eq!(store.implements(t, stringer), Err("String".to_string()));
        store.add_method(t, "String", sig);
        assert!(store.implements(t, stringer).is_ok());
        assert!(store.implements(t, builtin::ANY).is_ok());
    }

    #[test]
    fn test_blank_field_detection() {
        let store = TypeStore::new();
        let plain = store.struct_of(vec![Field::new("x", builtin::INT)]);
        let blanky = store.struct_of(vec![
            Field::new("x", builtin::INT),
            Field::new("_", builtin::INT),
        ]);
        assert!(!store.has_blank_field(plain));
        assert!(store.has_blank_field(blanky));
        let named = store.named("main", "K", blanky);
        assert!(store.has_blank_field(named));
    }
}
