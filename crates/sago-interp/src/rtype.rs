//! Runtime type record: the bridge between program types and dispatch.
//!
//! Holds the user-defined method sets keyed by receiver type, the
//! flattened registry method tables, and per-type cached facts (blank-key
//! structs). Interface method dispatch resolves in that order; a miss on
//! all tiers is the "no code for method" fault.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use sago_ssa::types::{Type, TypeData, TypeStore};
use sago_ssa::{FuncId, Program};

use crate::error::Panic;
use crate::registry::{ExternFn, Registry};
use crate::value::{zero_value, Value};

/// Where a dispatched method lives.
#[derive(Clone)]
pub enum MethodTarget {
    Interp(FuncId),
    Extern(ExternFn),
}

#[derive(Default)]
pub struct TypesRecord {
    /// Receiver type -> method name -> interpreted function.
    msets: RwLock<HashMap<Type, Arc<HashMap<String, FuncId>>>>,
    /// Registry method tables, flattened at load.
    extern_methods: RwLock<HashMap<(Type, String), ExternFn>>,
    /// Map type -> whether its key struct contains blank fields.
    blank_keys: RwLock<HashMap<Type, bool>>,
}

impl TypesRecord {
    pub fn new() -> TypesRecord {
        TypesRecord::default()
    }

    /// Install the program's declared method sets.
    pub fn load_program(&self, prog: &Program) {
        let mut msets = self.msets.write();
        for recv in prog.method_receivers() {
            if let Some(set) = prog.method_set(recv) {
                let map: HashMap<String, FuncId> =
                    set.iter().map(|(n, f)| (n.clone(), *f)).collect();
                msets.insert(recv, Arc::new(map));
            }
        }
    }

    /// Install the registry's method tables.
    pub fn load_registry(&self, registry: &Registry) {
        let mut ext = self.extern_methods.write();
        for path in registry.paths() {
            if let Some(pkg) = registry.installed(&path) {
                for nt in pkg.named_types.values() {
                    if let Some(t) = nt.typ {
                        for (name, f) in &nt.methods {
                            ext.insert((t, name.clone()), f.clone());
                        }
                    }
                }
            }
        }
    }

    /// Method lookup order: user method set of the receiver type (shared
    /// with its pointer type), then the extern method tables.
    pub fn find_method(&self, store: &TypeStore, recv: Type, name: &str) -> Option<MethodTarget> {
        let base = match store.data(recv) {
            TypeData::Pointer(e) => e,
            _ => recv,
        };
        let msets = self.msets.read();
        for probe in [recv, base] {
            if let Some(set) = msets.get(&probe) {
                if let Some(fid) = set.get(name) {
                    return Some(MethodTarget::Interp(*fid));
                }
            }
        }
        drop(msets);
        let ext = self.extern_methods.read();
        for probe in [recv, base] {
            if let Some(f) = ext.get(&(probe, name.to_string())) {
                return Some(MethodTarget::Extern(f.clone()));
            }
        }
        None
    }

    /// Whether a map of this type needs blank-field key normalization.
    pub fn map_key_has_blank(&self, store: &TypeStore, map_type: Type) -> bool {
        if let Some(&b) = self.blank_keys.read().get(&map_type) {
            return b;
        }
        let b = match store.data(store.underlying(map_type)) {
            TypeData::Map { key, .. } => store.has_blank_field(key),
            _ => false,
        };
        self.blank_keys.write().insert(map_type, b);
        b
    }
}

/// The dynamic type-assertion check.
///
/// On success returns the asserted-to value. On failure, with `comma_ok`
/// the zero value and `false`; without, a panic whose message
/// distinguishes a nil interface, a missing interface method, a same-name
/// type from another scope, and a plain mismatch.
pub fn assert_value(
    store: &TypeStore,
    static_x: Type,
    asserted: Type,
    v: &Value,
    comma_ok: bool,
) -> Result<Value, Panic> {
    let failure: Option<Panic> = if v.is_nil() {
        Some(Panic::Plain(format!(
            "interface conversion: interface is nil, not {}",
            store.type_string(asserted)
        )))
    } else {
        let rt = v.type_of(store);
        if rt == asserted {
            None
        } else if store.assignable(rt, asserted) {
            None
        } else if store.is_interface(asserted) {
            match store.implements(rt, asserted) {
                Err(missing) => Some(Panic::runtime(format!(
                    "interface conversion: {} is not {}: missing method {}",
                    store.type_string(rt),
                    store.type_string(asserted),
                    missing
                ))),
                Ok(()) => None,
            }
        } else if store.type_string(rt) == store.type_string(asserted) {
            Some(Panic::runtime(format!(
                "interface conversion: {} is {}, not {} (types from different scopes)",
                store.type_string(static_x),
                store.type_string(rt),
                store.type_string(asserted)
            )))
        } else {
            Some(Panic::runtime(format!(
                "interface conversion: {} is {}, not {}",
                store.type_string(static_x),
                store.type_string(rt),
                store.type_string(asserted)
            )))
        }
    };

    match failure {
        None => {
            let out = if store.is_interface(asserted) {
                v.clone()
            } else {
                crate::ops::retag(store, v, asserted)
            };
            if comma_ok {
                Ok(Value::Tuple(vec![out, Value::Bool(true)].into()))
            } else {
                Ok(out)
            }
        }
        Some(p) => {
            if comma_ok {
                Ok(Value::Tuple(vec![zero_value(store, asserted), Value::Bool(false)].into()))
            } else {
                Err(p)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sago_ssa::types::builtin;

    #[test]
    fn test_assert_nil_interface() {
        let store = TypeStore::new();
        let err = assert_value(&store, builtin::ANY, builtin::INT, &Value::Nil, false).unwrap_err();
        match err {
            Panic::Plain(msg) => {
                assert_eq!(msg, "interface conversion: interface is nil, not int")
            }
            _ => panic!("expected plain panic"),
        }
    }

    #[test]
    fn test_assert_mismatch_comma_ok() {
        let store = TypeStore::new();
        let got = assert_value(&store, builtin::ANY, builtin::INT, &Value::str("x"), true).unwrap();
        match got {
            Value::Tuple(t) => {
                assert_eq!(t[0], Value::Int(0));
                assert_eq!(t[1], Value::Bool(false));
            }
            _ => panic!("expected tuple"),
        }
    }

    #[test]
    fn test_assert_mismatch_message() {
        let store = TypeStore::new();
        let err =
            assert_value(&store, builtin::ANY, builtin::INT, &Value::str("x"), false).unwrap_err();
        match err {
            Panic::Runtime(e) => {
                assert!(e.0.contains("interface conversion"), "message: {}", e.0);
                assert!(e.0.contains("string is string, not int") || e.0.contains("not int"));
            }
            _ => panic!("expected runtime panic"),
        }
    }
}
