//! Package registry: precompiled native packages visible to interpreted
//! code.
//!
//! A package descriptor carries everything a registered native package
//! exposes: functions, addressable variables, named types with method
//! tables, interfaces, aliases, and typed/untyped constants. The compiler
//! consults the registry when it meets a declaration-only function; the
//! interpreter consults it when evaluating a global that belongs to a
//! registered package.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use sago_ssa::types::{BasicKind, Type};
use sago_ssa::ConstValue;

use crate::error::Panic;
use crate::interp::Interp;
use crate::value::Value;

/// A native function callable from interpreted code. Arguments arrive as
/// boxed values; a multi-valued result is returned as a tuple.
pub type ExternFn = Arc<dyn Fn(&Arc<Interp>, &[Value]) -> Result<Value, Panic> + Send + Sync>;

/// Build an [`ExternFn`] from a closure.
pub fn extern_fn<F>(f: F) -> ExternFn
where
    F: Fn(&Arc<Interp>, &[Value]) -> Result<Value, Panic> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A typed constant: value plus its declared type.
#[derive(Clone)]
pub struct TypedConst {
    pub typ: Type,
    pub value: ConstValue,
}

/// An untyped constant: value plus the untyped-kind tag that drives
/// conversion decisions at use sites.
#[derive(Clone)]
pub struct UntypedConst {
    pub kind: BasicKind,
    pub value: ConstValue,
}

/// A registered named type and its method table.
#[derive(Clone, Default)]
pub struct NamedType {
    pub typ: Option<Type>,
    pub methods: HashMap<String, ExternFn>,
}

/// One registered package.
#[derive(Default)]
pub struct Package {
    pub name: String,
    pub path: String,
    /// Import path -> local alias.
    pub deps: HashMap<String, String>,
    pub interfaces: HashMap<String, Type>,
    pub named_types: HashMap<String, NamedType>,
    pub alias_types: HashMap<String, Type>,
    /// Addressable package variables; each value is a pointer.
    pub vars: HashMap<String, Value>,
    pub funcs: HashMap<String, ExternFn>,
    pub typed_consts: HashMap<String, TypedConst>,
    pub untyped_consts: HashMap<String, UntypedConst>,
}

impl Package {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Package {
        Package { name: name.into(), path: path.into(), ..Package::default() }
    }

    pub fn func(&mut self, name: &str, f: ExternFn) -> &mut Self {
        self.funcs.insert(name.to_string(), f);
        self
    }

    pub fn var(&mut self, name: &str, ptr: Value) -> &mut Self {
        self.vars.insert(name.to_string(), ptr);
        self
    }
}

/// The per-context registry of installed packages.
#[derive(Default)]
pub struct Registry {
    pkgs: RwLock<HashMap<String, Arc<Package>>>,
    /// Flattened method tables: (receiver type, method name) -> function.
    methods: RwLock<HashMap<(Type, String), ExternFn>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn register(&self, pkg: Package) {
        let mut methods = self.methods.write();
        for nt in pkg.named_types.values() {
            if let Some(t) = nt.typ {
                for (mname, f) in &nt.methods {
                    methods.insert((t, mname.clone()), f.clone());
                }
            }
        }
        drop(methods);
        self.pkgs.write().insert(pkg.path.clone(), Arc::new(pkg));
    }

    pub fn installed(&self, path: &str) -> Option<Arc<Package>> {
        self.pkgs.read().get(path).cloned()
    }

    pub fn lookup_func(&self, path: &str, name: &str) -> Option<ExternFn> {
        self.pkgs.read().get(path)?.funcs.get(name).cloned()
    }

    pub fn lookup_var(&self, path: &str, name: &str) -> Option<Value> {
        self.pkgs.read().get(path)?.vars.get(name).cloned()
    }

    pub fn lookup_method(&self, typ: Type, name: &str) -> Option<ExternFn> {
        self.methods.read().get(&(typ, name.to_string())).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut v: Vec<String> = self.pkgs.read().keys().cloned().collect();
        v.sort();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let reg = Registry::new();
        let mut pkg = Package::new("demo", "example.com/demo");
        pkg.func("Answer", extern_fn(|_, _| Ok(Value::Int(42))));
        reg.register(pkg);

        assert!(reg.installed("example.com/demo").is_some());
        assert!(reg.installed("absent").is_none());
        assert!(reg.lookup_func("example.com/demo", "Answer").is_some());
        assert!(reg.lookup_func("example.com/demo", "Question").is_none());
        assert_eq!(reg.paths(), vec!["example.com/demo".to_string()]);
    }
}
