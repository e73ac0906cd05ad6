//! Program, function and value tables.
//!
//! A [`Program`] is the fully-built SSA input the interpreter consumes:
//! a shared type store, a value table (constants, globals, functions,
//! builtins, params, instruction results), functions made of basic blocks,
//! and the package-level member map used for introspection.

use std::sync::Arc;

use hashbrown::HashMap;
use num_complex::Complex64;

use crate::instr::{Instr, ValueId};
use crate::types::{Type, TypeStore};

/// A function handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FuncId(pub(crate) u32);

impl FuncId {
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// A global-variable handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GlobalId(pub(crate) u32);

impl GlobalId {
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// A constant's payload. The basic kind of the constant's type decides how
/// the payload is projected into a runtime value.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstValue {
    Nil,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Complex(Complex64),
    Str(String),
}

/// What a value id refers to.
#[derive(Clone, Debug)]
pub enum ValueDef {
    Const(ConstValue),
    Global(GlobalId),
    Function(FuncId),
    /// A language builtin referenced as a callee (`len`, `append`, ...).
    Builtin(String),
    Param { func: FuncId, index: usize },
    FreeVar { func: FuncId, index: usize },
    /// The result of an instruction inside `func`.
    Instr { func: FuncId },
}

/// A value-table entry.
#[derive(Clone, Debug)]
pub struct ValueInfo {
    pub def: ValueDef,
    pub typ: Type,
    /// Source-level name when one exists (params, debug refs).
    pub name: String,
}

/// A package-level global variable. Its value-table entry has pointer type;
/// the interpreter allocates the backing cell at startup.
#[derive(Clone, Debug)]
pub struct Global {
    pub name: String,
    pub pkg: String,
    /// The pointee type.
    pub ty: Type,
    pub value: ValueId,
}

/// One basic block.
#[derive(Clone, Debug, Default)]
pub struct Block {
    pub instrs: Vec<Instr>,
    pub preds: Vec<u32>,
    pub succs: Vec<u32>,
}

/// One SSA function. A function with no blocks is declaration-only: its
/// body lives outside the program (registry extern, override, or builtin
/// bridge).
#[derive(Clone, Debug)]
pub struct Function {
    pub id: FuncId,
    pub pkg: String,
    pub name: String,
    pub sig: Type,
    pub params: Vec<ValueId>,
    pub free_vars: Vec<ValueId>,
    pub blocks: Vec<Block>,
    /// Block to resume at after a recovered panic, when the function has
    /// one (functions containing `recover` call sites).
    pub recover_block: Option<u32>,
}

impl Function {
    /// Fully-qualified name, the key for overrides and extern lookup.
    pub fn full_name(&self) -> String {
        if self.pkg.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.pkg, self.name)
        }
    }

    #[inline]
    pub fn is_declaration_only(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// A package-level member, for introspection by qualified name.
#[derive(Clone, Debug)]
pub enum Member {
    Func(FuncId),
    Var(GlobalId),
    Const { typ: Type, value: ConstValue },
    Type(Type),
}

/// A complete SSA program.
pub struct Program {
    pub store: Arc<TypeStore>,
    /// Name of the entry package (normally "main").
    pub pkg_name: String,
    pub(crate) values: Vec<ValueInfo>,
    pub(crate) funcs: Vec<Function>,
    pub(crate) globals: Vec<Global>,
    /// User-declared method sets: receiver type -> (method name -> func).
    pub(crate) methods: HashMap<Type, Vec<(String, FuncId)>>,
    /// Init functions in dependency order (imported packages first).
    pub(crate) inits: Vec<FuncId>,
    /// Entry-package members by name.
    pub(crate) members: HashMap<String, Member>,
}

impl Program {
    #[inline]
    pub fn value(&self, id: ValueId) -> &ValueInfo {
        &self.values[id.0 as usize]
    }

    #[inline]
    pub fn func(&self, id: FuncId) -> &Function {
        &self.funcs[id.0 as usize]
    }

    #[inline]
    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.0 as usize]
    }

    pub fn funcs(&self) -> impl Iterator<Item = &Function> {
        self.funcs.iter()
    }

    pub fn globals(&self) -> impl Iterator<Item = &Global> {
        self.globals.iter()
    }

    pub fn inits(&self) -> &[FuncId] {
        &self.inits
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    /// Look up an entry-package function by bare name.
    pub fn func_by_name(&self, name: &str) -> Option<&Function> {
        match self.members.get(name) {
            Some(Member::Func(id)) => Some(self.func(*id)),
            _ => None,
        }
    }

    /// The declared method set of a receiver type, if any.
    pub fn method_set(&self, recv: Type) -> Option<&[(String, FuncId)]> {
        self.methods.get(&recv).map(|v| v.as_slice())
    }

    /// All receiver types that have declared methods.
    pub fn method_receivers(&self) -> Vec<Type> {
        self.methods.keys().copied().collect()
    }

    /// Resolve a method on `recv` (looking through one pointer level, which
    /// shares the named type's method set).
    pub fn lookup_method(&self, recv: Type, name: &str) -> Option<FuncId> {
        let base = match self.store.data(recv) {
            crate::types::TypeData::Pointer(e) => e,
            _ => recv,
        };
        for probe in [recv, base] {
            if let Some(set) = self.methods.get(&probe) {
                if let Some((_, id)) = set.iter().find(|(n, _)| n == name) {
                    return Some(*id);
                }
            }
        }
        None
    }

    /// True when the value is the literal nil constant. The equality steps
    /// use this to compile nil comparisons.
    pub fn is_const_nil(&self, id: ValueId) -> bool {
        matches!(self.value(id).def, ValueDef::Const(ConstValue::Nil))
    }

    /// Dump all function bodies (the `DUMP_INSTR` mode).
    pub fn dump_instrs(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        for func in &self.funcs {
            if func.is_declaration_only() {
                writeln!(out, "func {} = extern", func.full_name())?;
                continue;
            }
            writeln!(out, "func {}:", func.full_name())?;
            for (bi, block) in func.blocks.iter().enumerate() {
                writeln!(out, "b{}:", bi)?;
                for instr in &block.instrs {
                    writeln!(out, "\t{}", instr)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProgramBuilder;
    use crate::types::builtin;

    #[test]
    fn test_member_lookup() {
        let store = Arc::new(TypeStore::new());
        let mut pb = ProgramBuilder::new(store.clone(), "main");
        let sig = store.signature(vec![], vec![], false);
        let fid = pb.declare_func("main", "main", sig, &[]);
        {
            let mut fb = pb.define_func(fid);
            fb.ret(vec![]);
            fb.finish();
        }
        let prog = pb.finish();
        assert!(prog.func_by_name("main").is_some());
        assert!(prog.func_by_name("absent").is_none());
        assert_eq!(prog.func_by_name("main").unwrap().full_name(), "main.main");
    }
}
