//! Program construction API.
//!
//! The front end that lowers source to SSA lives outside this crate; hosts
//! and tests assemble programs through [`ProgramBuilder`] / [`FuncBuilder`]
//! instead. The builder keeps block edges consistent as terminators are
//! emitted, so phi resolution and predecessor tracking work without a
//! separate wiring pass.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::instr::{BinOp, CallCommon, Instr, SelectState, UnOp, ValueId};
use crate::program::{
    Block, ConstValue, FuncId, Function, Global, GlobalId, Member, Program, ValueDef, ValueInfo,
};
use crate::types::{builtin, Type, TypeData, TypeStore};

pub struct ProgramBuilder {
    store: Arc<TypeStore>,
    pkg_name: String,
    values: Vec<ValueInfo>,
    funcs: Vec<Function>,
    globals: Vec<Global>,
    methods: HashMap<Type, Vec<(String, FuncId)>>,
    inits: Vec<FuncId>,
    members: HashMap<String, Member>,
}

impl ProgramBuilder {
    pub fn new(store: Arc<TypeStore>, pkg_name: impl Into<String>) -> Self {
        ProgramBuilder {
            store,
            pkg_name: pkg_name.into(),
            values: Vec::new(),
            funcs: Vec::new(),
            globals: Vec::new(),
            methods: HashMap::new(),
            inits: Vec::new(),
            members: HashMap::new(),
        }
    }

    #[inline]
    pub fn store(&self) -> &Arc<TypeStore> {
        &self.store
    }

    fn add_value(&mut self, def: ValueDef, typ: Type, name: impl Into<String>) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueInfo { def, typ, name: name.into() });
        id
    }

    pub fn const_of(&mut self, typ: Type, value: ConstValue) -> ValueId {
        self.add_value(ValueDef::Const(value), typ, "")
    }

    pub fn const_int(&mut self, v: i64) -> ValueId {
        self.const_of(builtin::INT, ConstValue::Int(v))
    }

    pub fn const_bool(&mut self, v: bool) -> ValueId {
        self.const_of(builtin::BOOL, ConstValue::Bool(v))
    }

    pub fn const_str(&mut self, v: impl Into<String>) -> ValueId {
        self.const_of(builtin::STRING, ConstValue::Str(v.into()))
    }

    /// The typed or untyped nil constant.
    pub fn const_nil(&mut self, typ: Type) -> ValueId {
        self.const_of(typ, ConstValue::Nil)
    }

    /// Declare a package-level variable of pointee type `ty`. The value
    /// entry has type `*ty`.
    pub fn global(&mut self, pkg: &str, name: &str, ty: Type) -> ValueId {
        let gid = GlobalId(self.globals.len() as u32);
        let ptr_ty = self.store.pointer(ty);
        let value = self.add_value(ValueDef::Global(gid), ptr_ty, name);
        self.globals.push(Global { name: name.to_string(), pkg: pkg.to_string(), ty, value });
        if pkg == self.pkg_name {
            self.members.insert(name.to_string(), Member::Var(gid));
        }
        value
    }

    /// Declare a function. Parameter values are created from the signature;
    /// the body is supplied later through [`ProgramBuilder::define_func`],
    /// or never, for declaration-only externs.
    pub fn declare_func(
        &mut self,
        pkg: &str,
        name: &str,
        sig: Type,
        param_names: &[&str],
    ) -> FuncId {
        let id = FuncId(self.funcs.len() as u32);
        let param_types = match self.store.data(self.store.underlying(sig)) {
            TypeData::Signature { params, .. } => params,
            _ => panic!("declare_func: not a signature type"),
        };
        let mut params = Vec::with_capacity(param_types.len());
        for (i, pt) in param_types.iter().enumerate() {
            let pname = param_names.get(i).copied().unwrap_or("");
            params.push(self.add_value(ValueDef::Param { func: id, index: i }, *pt, pname));
        }
        self.funcs.push(Function {
            id,
            pkg: pkg.to_string(),
            name: name.to_string(),
            sig,
            params,
            free_vars: Vec::new(),
            blocks: Vec::new(),
            recover_block: None,
        });
        if pkg == self.pkg_name {
            self.members.insert(name.to_string(), Member::Func(id));
        }
        id
    }

    /// Declare a method with receiver type `recv`. The receiver must be the
    /// signature's first parameter.
    pub fn declare_method(
        &mut self,
        recv: Type,
        mname: &str,
        sig: Type,
        param_names: &[&str],
    ) -> FuncId {
        let pkg = self.pkg_name.clone();
        let ts = self.store.type_string(recv);
        let short = ts.rsplit('.').next().unwrap_or(&ts);
        let fname = format!("{}.{}", short, mname);
        // Method members are addressed by their receiver-qualified name, so
        // drop them from the flat member map.
        let id = self.declare_func(&pkg, &fname, sig, param_names);
        self.members.remove(&fname);
        self.methods.entry(recv).or_default().push((mname.to_string(), id));
        let base = match self.store.data(recv) {
            TypeData::Pointer(e) => e,
            _ => recv,
        };
        if self.store.is_named(base) {
            self.store.add_method(base, mname, sig);
        }
        id
    }

    /// Add a free variable (closure capture slot) to a declared function.
    pub fn free_var(&mut self, func: FuncId, typ: Type, name: &str) -> ValueId {
        let index = self.funcs[func.0 as usize].free_vars.len();
        let v = self.add_value(ValueDef::FreeVar { func, index }, typ, name);
        self.funcs[func.0 as usize].free_vars.push(v);
        v
    }

    /// A builtin referenced as a callee.
    pub fn builtin(&mut self, name: &str) -> ValueId {
        self.add_value(ValueDef::Builtin(name.to_string()), builtin::INVALID, name)
    }

    pub fn add_init(&mut self, func: FuncId) {
        self.inits.push(func);
    }

    pub fn add_type_member(&mut self, name: &str, typ: Type) {
        self.members.insert(name.to_string(), Member::Type(typ));
    }

    pub fn add_const_member(&mut self, name: &str, typ: Type, value: ConstValue) {
        self.members.insert(name.to_string(), Member::Const { typ, value });
    }

    /// Open a declared function for body construction. Creates the entry
    /// block and positions the builder on it.
    pub fn define_func(&mut self, id: FuncId) -> FuncBuilder<'_> {
        let mut fb = FuncBuilder { pb: self, id, blocks: vec![Block::default()], cur: 0, recover_block: None };
        fb.cur = 0;
        fb
    }

    pub fn finish(self) -> Program {
        Program {
            store: self.store,
            pkg_name: self.pkg_name,
            values: self.values,
            funcs: self.funcs,
            globals: self.globals,
            methods: self.methods,
            inits: self.inits,
            members: self.members,
        }
    }
}

/// Builds one function body. Dropping without [`FuncBuilder::finish`]
/// discards the body.
pub struct FuncBuilder<'a> {
    pb: &'a mut ProgramBuilder,
    id: FuncId,
    blocks: Vec<Block>,
    cur: usize,
    recover_block: Option<u32>,
}

impl<'a> FuncBuilder<'a> {
    #[inline]
    pub fn store(&self) -> Arc<TypeStore> {
        self.pb.store.clone()
    }

    #[inline]
    pub fn func_id(&self) -> FuncId {
        self.id
    }

    pub fn param(&self, index: usize) -> ValueId {
        self.pb.funcs[self.id.0 as usize].params[index]
    }

    pub fn free_var_value(&self, index: usize) -> ValueId {
        self.pb.funcs[self.id.0 as usize].free_vars[index]
    }

    /// Add a constant value usable inside this body.
    pub fn const_of(&mut self, typ: Type, value: ConstValue) -> ValueId {
        self.pb.const_of(typ, value)
    }

    /// A reference to a declared function as a first-class value.
    pub fn func_value(&mut self, id: FuncId) -> ValueId {
        let sig = self.pb.funcs[id.0 as usize].sig;
        self.pb.add_value(ValueDef::Function(id), sig, "")
    }

    /// Resolve an entry-package function by name to a function value.
    pub fn func_ref(&mut self, name: &str) -> Option<ValueId> {
        match self.pb.members.get(name) {
            Some(Member::Func(id)) => {
                let id = *id;
                Some(self.func_value(id))
            }
            _ => None,
        }
    }

    pub fn new_block(&mut self) -> u32 {
        self.blocks.push(Block::default());
        (self.blocks.len() - 1) as u32
    }

    pub fn switch_to(&mut self, block: u32) {
        self.cur = block as usize;
    }

    #[inline]
    pub fn current_block(&self) -> u32 {
        self.cur as u32
    }

    /// Mark `block` as the resume point after a recovered panic.
    pub fn set_recover_block(&mut self, block: u32) {
        self.recover_block = Some(block);
    }

    fn emit(&mut self, instr: Instr) {
        self.blocks[self.cur].instrs.push(instr);
    }

    fn def(&mut self, typ: Type) -> ValueId {
        let func = self.id;
        self.pb.add_value(ValueDef::Instr { func }, typ, "")
    }

    fn typ_of(&self, v: ValueId) -> Type {
        self.pb.values[v.as_u32() as usize].typ
    }

    fn edge(&mut self, from: usize, to: u32) {
        self.blocks[from].succs.push(to);
        self.blocks[to as usize].preds.push(from as u32);
    }

    // ---- value-producing instructions ----

    pub fn alloc(&mut self, ty: Type, heap: bool) -> ValueId {
        let ptr = self.pb.store.pointer(ty);
        let dest = self.def(ptr);
        self.emit(Instr::Alloc { dest, ty, heap });
        dest
    }

    pub fn phi(&mut self, typ: Type, edges: Vec<(u32, ValueId)>) -> ValueId {
        let dest = self.def(typ);
        self.emit(Instr::Phi { dest, edges });
        dest
    }

    /// Add a loop back-edge to an existing phi, once the value carried
    /// along it exists.
    pub fn add_phi_edge(&mut self, phi: ValueId, pred: u32, value: ValueId) {
        for block in &mut self.blocks {
            for instr in &mut block.instrs {
                if let Instr::Phi { dest, edges } = instr {
                    if *dest == phi {
                        edges.push((pred, value));
                        return;
                    }
                }
            }
        }
        panic!("add_phi_edge: {:?} is not a phi in this body", phi);
    }

    pub fn binop(&mut self, op: BinOp, x: ValueId, y: ValueId) -> ValueId {
        let typ = match op {
            BinOp::Lss | BinOp::Leq | BinOp::Eql | BinOp::Neq | BinOp::Gtr | BinOp::Geq => {
                builtin::BOOL
            }
            _ => self.typ_of(x),
        };
        let dest = self.def(typ);
        self.emit(Instr::BinOp { dest, op, x, y });
        dest
    }

    pub fn unop(&mut self, op: UnOp, x: ValueId, comma_ok: bool) -> ValueId {
        let store = self.pb.store.clone();
        let xt = self.typ_of(x);
        let typ = match op {
            UnOp::Recv => {
                let elem = store.elem(xt).unwrap_or(builtin::INVALID);
                if comma_ok {
                    store.tuple(vec![elem, builtin::BOOL])
                } else {
                    elem
                }
            }
            UnOp::Deref => store.elem(xt).unwrap_or(builtin::INVALID),
            _ => xt,
        };
        let dest = self.def(typ);
        self.emit(Instr::UnOp { dest, op, x, comma_ok });
        dest
    }

    fn call_result_type(&self, sig: Type) -> Type {
        let store = &self.pb.store;
        match store.data(store.underlying(sig)) {
            TypeData::Signature { results, .. } => match results.len() {
                0 => store.tuple(vec![]),
                1 => results[0],
                _ => store.tuple(results),
            },
            _ => builtin::INVALID,
        }
    }

    pub fn call(&mut self, callee: ValueId, args: Vec<ValueId>) -> ValueId {
        let sig = self.typ_of(callee);
        let dest = self.def(self.call_result_type(sig));
        self.emit(Instr::Call { dest, call: CallCommon { value: callee, method: None, args, sig } });
        dest
    }

    /// Call a language builtin; the caller supplies the result type.
    pub fn call_builtin(&mut self, name: &str, args: Vec<ValueId>, result: Type) -> ValueId {
        let callee = self.pb.builtin(name);
        let dest = self.def(result);
        self.emit(Instr::Call {
            dest,
            call: CallCommon { value: callee, method: None, args, sig: builtin::INVALID },
        });
        dest
    }

    /// Invoke-mode call: dispatch `name` on the dynamic type of `recv`.
    pub fn call_method(&mut self, recv: ValueId, name: &str, args: Vec<ValueId>, sig: Type) -> ValueId {
        let dest = self.def(self.call_result_type(sig));
        self.emit(Instr::Call {
            dest,
            call: CallCommon { value: recv, method: Some(name.to_string()), args, sig },
        });
        dest
    }

    pub fn make_closure(&mut self, func: FuncId, bindings: Vec<ValueId>) -> ValueId {
        let sig = self.pb.funcs[func.0 as usize].sig;
        let dest = self.def(sig);
        self.emit(Instr::MakeClosure { dest, func, bindings });
        dest
    }

    pub fn make_map(&mut self, typ: Type, reserve: Option<ValueId>) -> ValueId {
        let dest = self.def(typ);
        self.emit(Instr::MakeMap { dest, reserve });
        dest
    }

    pub fn make_chan(&mut self, typ: Type, size: ValueId) -> ValueId {
        let dest = self.def(typ);
        self.emit(Instr::MakeChan { dest, size });
        dest
    }

    pub fn make_slice(&mut self, typ: Type, len: ValueId, cap: ValueId) -> ValueId {
        let dest = self.def(typ);
        self.emit(Instr::MakeSlice { dest, len, cap });
        dest
    }

    pub fn slice_op(
        &mut self,
        x: ValueId,
        low: Option<ValueId>,
        high: Option<ValueId>,
        max: Option<ValueId>,
    ) -> ValueId {
        let store = self.pb.store.clone();
        let xt = self.typ_of(x);
        let typ = match store.data(store.underlying(xt)) {
            TypeData::Pointer(arr) => store.slice(store.elem(arr).unwrap_or(builtin::INVALID)),
            TypeData::Basic(crate::types::BasicKind::String) => xt,
            _ => xt,
        };
        let dest = self.def(typ);
        self.emit(Instr::Slice { dest, x, low, high, max });
        dest
    }

    fn struct_field_type(&self, struct_ptr_or_val: Type, field: usize) -> Type {
        let store = &self.pb.store;
        let st = match store.data(store.underlying(struct_ptr_or_val)) {
            TypeData::Pointer(e) => e,
            _ => struct_ptr_or_val,
        };
        match store.data(store.underlying(st)) {
            TypeData::Struct { fields } => fields[field].typ,
            _ => builtin::INVALID,
        }
    }

    pub fn field_addr(&mut self, x: ValueId, field: usize) -> ValueId {
        let ft = self.struct_field_type(self.typ_of(x), field);
        let ptr = self.pb.store.pointer(ft);
        let dest = self.def(ptr);
        self.emit(Instr::FieldAddr { dest, x, field });
        dest
    }

    pub fn field(&mut self, x: ValueId, field: usize) -> ValueId {
        let ft = self.struct_field_type(self.typ_of(x), field);
        let dest = self.def(ft);
        self.emit(Instr::Field { dest, x, field });
        dest
    }

    pub fn index_addr(&mut self, x: ValueId, index: ValueId) -> ValueId {
        let store = self.pb.store.clone();
        let elem = store.elem(self.typ_of(x)).and_then(|t| {
            // *[N]T -> T
            match store.data(store.underlying(self.typ_of(x))) {
                TypeData::Pointer(arr) => store.elem(arr),
                _ => Some(t),
            }
        });
        let ptr = store.pointer(elem.unwrap_or(builtin::INVALID));
        let dest = self.def(ptr);
        self.emit(Instr::IndexAddr { dest, x, index });
        dest
    }

    pub fn index(&mut self, x: ValueId, index: ValueId) -> ValueId {
        let store = self.pb.store.clone();
        let xt = self.typ_of(x);
        let elem = match store.basic_kind(xt) {
            Some(crate::types::BasicKind::String) => builtin::UINT8,
            _ => store.elem(xt).unwrap_or(builtin::INVALID),
        };
        let dest = self.def(elem);
        self.emit(Instr::Index { dest, x, index });
        dest
    }

    pub fn lookup(&mut self, x: ValueId, index: ValueId, comma_ok: bool) -> ValueId {
        let store = self.pb.store.clone();
        let xt = self.typ_of(x);
        let vt = match store.data(store.underlying(xt)) {
            TypeData::Map { value, .. } => value,
            TypeData::Basic(crate::types::BasicKind::String) => builtin::UINT8,
            _ => builtin::INVALID,
        };
        let typ = if comma_ok { store.tuple(vec![vt, builtin::BOOL]) } else { vt };
        let dest = self.def(typ);
        self.emit(Instr::Lookup { dest, x, index, comma_ok });
        dest
    }

    pub fn select(&mut self, states: Vec<SelectState>, blocking: bool) -> ValueId {
        let store = self.pb.store.clone();
        let mut elems = vec![builtin::INT, builtin::BOOL];
        for st in &states {
            if st.is_recv() {
                elems.push(store.elem(self.typ_of(st.chan)).unwrap_or(builtin::INVALID));
            }
        }
        let dest = self.def(store.tuple(elems));
        self.emit(Instr::Select { dest, states, blocking });
        dest
    }

    pub fn range_over(&mut self, x: ValueId) -> ValueId {
        let dest = self.def(builtin::INVALID);
        self.emit(Instr::Range { dest, x });
        dest
    }

    pub fn next(&mut self, iter: ValueId, key: Type, value: Type, is_string: bool) -> ValueId {
        let store = self.pb.store.clone();
        let dest = self.def(store.tuple(vec![builtin::BOOL, key, value]));
        self.emit(Instr::Next { dest, iter, is_string });
        dest
    }

    pub fn type_assert(&mut self, x: ValueId, asserted: Type, comma_ok: bool) -> ValueId {
        let store = self.pb.store.clone();
        let typ = if comma_ok { store.tuple(vec![asserted, builtin::BOOL]) } else { asserted };
        let dest = self.def(typ);
        self.emit(Instr::TypeAssert { dest, x, asserted, comma_ok });
        dest
    }

    pub fn extract(&mut self, tuple: ValueId, index: usize) -> ValueId {
        let store = self.pb.store.clone();
        let tt = self.typ_of(tuple);
        let et = match store.data(tt) {
            TypeData::Tuple(elems) => elems.get(index).copied().unwrap_or(builtin::INVALID),
            _ => builtin::INVALID,
        };
        let dest = self.def(et);
        self.emit(Instr::Extract { dest, tuple, index });
        dest
    }

    pub fn make_interface(&mut self, typ: Type, x: ValueId) -> ValueId {
        let dest = self.def(typ);
        self.emit(Instr::MakeInterface { dest, x });
        dest
    }

    pub fn change_type(&mut self, typ: Type, x: ValueId) -> ValueId {
        let dest = self.def(typ);
        self.emit(Instr::ChangeType { dest, x });
        dest
    }

    pub fn convert(&mut self, typ: Type, x: ValueId) -> ValueId {
        let dest = self.def(typ);
        self.emit(Instr::Convert { dest, x });
        dest
    }

    pub fn change_interface(&mut self, typ: Type, x: ValueId) -> ValueId {
        let dest = self.def(typ);
        self.emit(Instr::ChangeInterface { dest, x });
        dest
    }

    pub fn slice_to_array_pointer(&mut self, typ: Type, x: ValueId) -> ValueId {
        let dest = self.def(typ);
        self.emit(Instr::SliceToArrayPointer { dest, x });
        dest
    }

    // ---- effect instructions ----

    pub fn jump(&mut self, target: u32) {
        let cur = self.cur;
        self.emit(Instr::Jump { target });
        self.edge(cur, target);
    }

    pub fn br(&mut self, cond: ValueId, then_block: u32, else_block: u32) {
        let cur = self.cur;
        self.emit(Instr::If { cond, then_block, else_block });
        self.edge(cur, then_block);
        self.edge(cur, else_block);
    }

    pub fn ret(&mut self, results: Vec<ValueId>) {
        self.emit(Instr::Return { results });
    }

    pub fn run_defers(&mut self) {
        self.emit(Instr::RunDefers);
    }

    pub fn panic_value(&mut self, x: ValueId) {
        self.emit(Instr::Panic { x });
    }

    pub fn go_call(&mut self, callee: ValueId, args: Vec<ValueId>) {
        let sig = self.typ_of(callee);
        self.emit(Instr::Go { call: CallCommon { value: callee, method: None, args, sig } });
    }

    pub fn defer_call(&mut self, callee: ValueId, args: Vec<ValueId>) {
        let sig = self.typ_of(callee);
        self.emit(Instr::Defer { call: CallCommon { value: callee, method: None, args, sig } });
    }

    pub fn defer_builtin(&mut self, name: &str, args: Vec<ValueId>) {
        let callee = self.pb.builtin(name);
        self.emit(Instr::Defer {
            call: CallCommon { value: callee, method: None, args, sig: builtin::INVALID },
        });
    }

    pub fn send(&mut self, chan: ValueId, x: ValueId) {
        self.emit(Instr::Send { chan, x });
    }

    pub fn store_value(&mut self, addr: ValueId, val: ValueId) {
        self.emit(Instr::Store { addr, val });
    }

    pub fn map_update(&mut self, map: ValueId, key: ValueId, value: ValueId) {
        self.emit(Instr::MapUpdate { map, key, value });
    }

    pub fn debug_ref(&mut self, x: ValueId, name: &str) {
        self.emit(Instr::DebugRef { x, name: name.to_string() });
    }

    /// Install the built body into the program.
    pub fn finish(self) {
        let func = &mut self.pb.funcs[self.id.0 as usize];
        func.blocks = self.blocks;
        func.recover_block = self.recover_block;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_edges() {
        let store = Arc::new(TypeStore::new());
        let mut pb = ProgramBuilder::new(store.clone(), "main");
        let sig = store.signature(vec![], vec![builtin::INT], false);
        let fid = pb.declare_func("main", "f", sig, &[]);
        let ten = pb.const_int(10);
        {
            let mut fb = pb.define_func(fid);
            let body = fb.new_block();
            fb.jump(body);
            fb.switch_to(body);
            fb.ret(vec![ten]);
            fb.finish();
        }
        let prog = pb.finish();
        let f = prog.func_by_name("f").unwrap();
        assert_eq!(f.blocks.len(), 2);
        assert_eq!(f.blocks[0].succs, vec![1]);
        assert_eq!(f.blocks[1].preds, vec![0]);
    }

    #[test]
    fn test_binop_result_types() {
        let store = Arc::new(TypeStore::new());
        let mut pb = ProgramBuilder::new(store.clone(), "main");
        let sig = store.signature(vec![builtin::INT, builtin::INT], vec![builtin::BOOL], false);
        let fid = pb.declare_func("main", "less", sig, &["a", "b"]);
        {
            let mut fb = pb.define_func(fid);
            let (a, b) = (fb.param(0), fb.param(1));
            let sum = fb.binop(BinOp::Add, a, b);
            let cmp = fb.binop(BinOp::Lss, sum, b);
            fb.ret(vec![cmp]);
            fb.finish();
        }
        let prog = pb.finish();
        let f = prog.func_by_name("less").unwrap();
        let instrs = &f.blocks[0].instrs;
        let sum_dest = instrs[0].dest().unwrap();
        let cmp_dest = instrs[1].dest().unwrap();
        assert_eq!(prog.value(sum_dest).typ, builtin::INT);
        assert_eq!(prog.value(cmp_dest).typ, builtin::BOOL);
    }
}
