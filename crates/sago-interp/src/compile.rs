//! Per-instruction compilation.
//!
//! Each SSA instruction of a function becomes one pre-bound step closure
//! over register handles. Registers are 32-bit encoded: the high byte is
//! the address space (frame-local, or one of the static kinds), the low 24
//! bits the slot index. Constants, globals and references to interpreted
//! functions are evaluated once at compile time and admitted to the
//! interpreter's static stack; their registers are stable handles.
//!
//! Functions compile lazily: the shell (arity, pool) is created on first
//! reference, the step sequences on first call.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use sago_ssa::instr::{BinOp, CallCommon, Instr, SelectState, UnOp, ValueId};
use sago_ssa::program::{Function as SsaFunction, Program, ValueDef};
use sago_ssa::types::{Type, TypeData};
use sago_ssa::FuncId;

use crate::builtins;
use crate::chan::{self, ChanCore, SelectCase};
use crate::error::Panic;
use crate::interp::{block_forever, Callee, Deferred, Frame, Interp};
use crate::ops;
use crate::registry::ExternFn;
use crate::rtype;
use crate::value::{
    const_to_value, normalize_blank_key, zero_value, ArrayVal, ChanVal, FuncVal, MapKey, MapVal,
    PointerVal, Place, SliceVal, Value,
};

/// Largest sane length for makeslice/makechan, mirroring the original's
/// 64-bit bound.
pub const MAX_MEM_LEN: i64 = 1 << 59;

/// Address spaces of a [`Register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegKind {
    Local = 0,
    Const = 1,
    Global = 2,
    Function = 3,
}

/// A 32-bit encoded value slot: high byte = kind, low 24 bits = index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Register(u32);

impl Register {
    pub fn local(index: usize) -> Register {
        debug_assert!(index < (1 << 24));
        Register(index as u32)
    }

    pub fn statik(kind: RegKind, index: usize) -> Register {
        debug_assert!(index < (1 << 24));
        Register(((kind as u32) << 24) | index as u32)
    }

    #[inline]
    pub fn kind(self) -> RegKind {
        match self.0 >> 24 {
            0 => RegKind::Local,
            1 => RegKind::Const,
            2 => RegKind::Global,
            _ => RegKind::Function,
        }
    }

    #[inline]
    pub fn is_static(self) -> bool {
        self.0 >> 24 != 0
    }

    #[inline]
    pub fn index(self) -> usize {
        (self.0 & 0x00ff_ffff) as usize
    }
}

/// One step of a compiled function.
pub type Step = Box<dyn Fn(&Arc<Interp>, &mut Frame) -> Result<(), Panic> + Send + Sync>;

/// The compiled body of a function.
pub struct Body {
    pub nstack: usize,
    pub instrs: Vec<Step>,
    /// Steps to run after a recovered panic (the recover block).
    pub recover_instrs: Vec<Step>,
    /// Block index -> pc of its first step.
    pub blocks: Vec<i64>,
    /// Per-pc renderings for tracing.
    pub descs: Vec<String>,
}

/// A compiled interpreter function: shell metadata plus a lazily-built
/// body and the frame-stack pool.
pub struct Function {
    pub fid: FuncId,
    pub name: String,
    pub sig: Type,
    pub narg: usize,
    pub nenv: usize,
    pub has_recover: bool,
    body: OnceCell<Arc<Body>>,
    used: AtomicU32,
    pooled: AtomicBool,
    pool_threshold: u32,
    pool: Mutex<Vec<Vec<Value>>>,
}

impl Function {
    pub fn new(prog: &Program, fid: FuncId, pool_threshold: usize) -> Function {
        let f = prog.func(fid);
        // A function intercepts panics when it has a recover resume block
        // or any defer site; deferred calls must run even while unwinding.
        let has_defer = f
            .blocks
            .iter()
            .any(|b| b.instrs.iter().any(|i| matches!(i, Instr::Defer { .. })));
        Function {
            fid,
            name: f.full_name(),
            sig: f.sig,
            narg: f.params.len(),
            nenv: f.free_vars.len(),
            has_recover: f.recover_block.is_some() || has_defer,
            body: OnceCell::new(),
            used: AtomicU32::new(0),
            pooled: AtomicBool::new(false),
            pool_threshold: pool_threshold as u32,
            pool: Mutex::new(Vec::new()),
        }
    }

    /// The compiled body, building it on first use.
    pub fn body(&self, interp: &Arc<Interp>) -> Result<Arc<Body>, Panic> {
        self.body
            .get_or_try_init(|| compile_body(interp, self).map(Arc::new))
            .cloned()
    }

    /// Hand out a stack for a new frame: fresh until the warm-up count is
    /// reached, pooled afterwards. Pooled stacks keep their old contents;
    /// every live slot is overwritten before it is read.
    pub(crate) fn take_stack(&self, nstack: usize) -> Vec<Value> {
        if self.pooled.load(Ordering::Relaxed) {
            if let Some(stack) = self.pool.lock().pop() {
                return stack;
            }
        } else if self.used.fetch_add(1, Ordering::Relaxed) + 1 > self.pool_threshold {
            self.pooled.store(true, Ordering::Relaxed);
        }
        vec![Value::Nil; nstack]
    }

    pub(crate) fn put_stack(&self, stack: Vec<Value>) {
        if self.pooled.load(Ordering::Relaxed) {
            self.pool.lock().push(stack);
        }
    }
}

struct Compiler<'a> {
    interp: &'a Arc<Interp>,
    prog: &'a Program,
    nstack: usize,
    index: hashbrown::HashMap<ValueId, Register>,
}

impl<'a> Compiler<'a> {
    /// Three-tier register assignment: interpreter-wide static index,
    /// function-local cache, else the next frame-local slot.
    fn reg_index(&mut self, v: ValueId) -> Register {
        if let Some(r) = self.interp.lookup_static(v) {
            return r;
        }
        if let Some(r) = self.index.get(&v) {
            return *r;
        }
        let info = self.prog.value(v);
        let admitted = match &info.def {
            ValueDef::Const(cv) => {
                let val = const_to_value(&self.interp.store, cv, info.typ);
                Some((RegKind::Const, val))
            }
            ValueDef::Global(gid) => {
                let val = self.interp.global_value(*gid);
                Some((RegKind::Global, val))
            }
            ValueDef::Function(fid) => {
                let f = self.prog.func(*fid);
                if !f.is_declaration_only() {
                    let pfn = self.interp.load_function(*fid);
                    let val = Value::Func(FuncVal::Interp { func: pfn, env: Arc::new(Vec::new()) });
                    Some((RegKind::Function, val))
                } else if let Some(ext) = self.interp.find_extern_func(&f.full_name()) {
                    let val = Value::Func(FuncVal::Extern {
                        name: Arc::from(f.full_name().as_str()),
                        sig: f.sig,
                        f: ext,
                    });
                    Some((RegKind::Function, val))
                } else {
                    None
                }
            }
            _ => None,
        };
        match admitted {
            Some((kind, val)) => self.interp.admit_static(v, kind, val),
            None => {
                let r = Register::local(self.nstack);
                self.nstack += 1;
                self.index.insert(v, r);
                r
            }
        }
    }

    /// Like [`Compiler::reg_index`], also yielding the pre-evaluated value
    /// when the register is static.
    fn reg3(&mut self, v: ValueId) -> (Register, bool, Option<Value>) {
        let r = self.reg_index(v);
        if r.is_static() {
            let val = self.interp.static_value(r.index());
            (r, true, Some(val))
        } else {
            (r, false, None)
        }
    }

    fn typ_of(&self, v: ValueId) -> Type {
        self.prog.value(v).typ
    }

    fn call_regs(&mut self, call: &CallCommon) -> (Register, Vec<Register>, Arc<[bool]>) {
        let iv = self.reg_index(call.value);
        let ia: Vec<Register> = call.args.iter().map(|a| self.reg_index(*a)).collect();
        let store = &self.interp.store;
        let flags: Vec<bool> =
            call.args.iter().map(|a| store.is_interface(self.typ_of(*a))).collect();
        (iv, ia, flags.into())
    }

    /// Pre-resolve a `Go`/`Defer` call site.
    fn prepare_call(&mut self, call: &CallCommon) -> PreparedCall {
        let (iv, ia, iface_args) = self.call_regs(call);
        let kind = match &call.method {
            Some(m) => PreparedKind::Invoke(m.clone()),
            None => match &self.prog.value(call.value).def {
                ValueDef::Builtin(name) => PreparedKind::Builtin(name.clone()),
                ValueDef::Function(fid) => {
                    let f = self.prog.func(*fid);
                    if let Some(ext) = self.interp.ctx.find_override(&f.full_name()) {
                        PreparedKind::Extern(Arc::from(f.full_name().as_str()), f.sig, ext)
                    } else if !f.is_declaration_only() {
                        PreparedKind::Static(self.interp.load_function(*fid))
                    } else if let Some(ext) = self.interp.find_extern_func(&f.full_name()) {
                        PreparedKind::Extern(Arc::from(f.full_name().as_str()), f.sig, ext)
                    } else if f.name == "init" {
                        PreparedKind::Skip
                    } else {
                        PreparedKind::Missing(f.full_name())
                    }
                }
                _ => PreparedKind::Dynamic,
            },
        };
        PreparedCall { kind, iv, ia, iface_args }
    }
}

pub(crate) struct PreparedCall {
    kind: PreparedKind,
    iv: Register,
    ia: Vec<Register>,
    iface_args: Arc<[bool]>,
}

enum PreparedKind {
    Builtin(String),
    Static(Arc<Function>),
    Extern(Arc<str>, Type, ExternFn),
    Invoke(String),
    Dynamic,
    Missing(String),
    Skip,
}

impl PreparedCall {
    /// Resolve the callee and argument values at the call site.
    pub(crate) fn resolve(
        &self,
        interp: &Arc<Interp>,
        fr: &mut Frame,
    ) -> Result<(Callee, Vec<Value>), Panic> {
        let mut args: Vec<Value> = Vec::with_capacity(self.ia.len() + 1);
        let callee = match &self.kind {
            PreparedKind::Builtin(name) => Callee::Builtin(name.clone()),
            PreparedKind::Static(pfn) => Callee::Value(Value::Func(FuncVal::Interp {
                func: pfn.clone(),
                env: Arc::new(Vec::new()),
            })),
            PreparedKind::Extern(name, sig, f) => Callee::Value(Value::Func(FuncVal::Extern {
                name: name.clone(),
                sig: *sig,
                f: f.clone(),
            })),
            PreparedKind::Invoke(mname) => {
                let recv = fr.reg(interp, self.iv);
                let target = lookup_invoke_target(interp, &recv, mname)?;
                args.push(recv);
                target
            }
            PreparedKind::Dynamic => Callee::Value(fr.reg(interp, self.iv)),
            PreparedKind::Missing(name) => {
                return Err(Panic::runtime(format!("no code for function: {}", name)))
            }
            PreparedKind::Skip => Callee::Nop,
        };
        for r in &self.ia {
            args.push(fr.reg(interp, *r));
        }
        Ok((callee, args))
    }

    pub(crate) fn iface_args(&self) -> Arc<[bool]> {
        self.iface_args.clone()
    }
}

/// Interface-method dispatch on a receiver's dynamic type.
pub(crate) fn lookup_invoke_target(
    interp: &Arc<Interp>,
    recv: &Value,
    mname: &str,
) -> Result<Callee, Panic> {
    if recv.is_nil() {
        return Err(Panic::runtime("invalid memory address or nil pointer dereference"));
    }
    let rt = recv.type_of(&interp.store);
    match interp.record.find_method(&interp.store, rt, mname) {
        Some(rtype::MethodTarget::Interp(fid)) => {
            let pfn = interp.load_function(fid);
            Ok(Callee::Value(Value::Func(FuncVal::Interp { func: pfn, env: Arc::new(Vec::new()) })))
        }
        Some(rtype::MethodTarget::Extern(f)) => Ok(Callee::Value(Value::Func(FuncVal::Extern {
            name: Arc::from(mname),
            sig: sago_ssa::types::builtin::INVALID,
            f,
        }))),
        None => Err(Panic::runtime(format!(
            "no code for method: {}.{}",
            interp.store.type_string(rt),
            mname
        ))),
    }
}

/// Compile the body of `shell`.
fn compile_body(interp: &Arc<Interp>, shell: &Function) -> Result<Body, Panic> {
    let prog = interp.program.clone();
    let ssa_fn = prog.func(shell.fid);
    let mut c = Compiler {
        interp,
        prog: &*prog,
        nstack: shell.narg + shell.nenv,
        index: hashbrown::HashMap::new(),
    };
    for (i, p) in ssa_fn.params.iter().enumerate() {
        c.index.insert(*p, Register::local(i));
    }
    for (j, fv) in ssa_fn.free_vars.iter().enumerate() {
        c.index.insert(*fv, Register::local(shell.narg + j));
    }

    let mut instrs: Vec<Step> = Vec::new();
    let mut descs: Vec<String> = Vec::new();
    let mut blocks: Vec<i64> = Vec::with_capacity(ssa_fn.blocks.len());
    for block in &ssa_fn.blocks {
        blocks.push(instrs.len() as i64);
        for instr in &block.instrs {
            if let Some(step) = make_step(&mut c, ssa_fn, instr)? {
                descs.push(instr.to_string());
                instrs.push(step);
            }
        }
    }

    let mut recover_instrs: Vec<Step> = Vec::new();
    if let Some(rb) = ssa_fn.recover_block {
        for instr in &ssa_fn.blocks[rb as usize].instrs {
            if let Some(step) = make_step(&mut c, ssa_fn, instr)? {
                recover_instrs.push(step);
            }
        }
    }

    Ok(Body { nstack: c.nstack, instrs, recover_instrs, blocks, descs })
}

/// Translate one SSA instruction into a step closure. Returns `None` for
/// instructions that compile away.
fn make_step(
    c: &mut Compiler<'_>,
    ssa_fn: &SsaFunction,
    instr: &Instr,
) -> Result<Option<Step>, Panic> {
    let step: Step = match instr {
        Instr::Alloc { dest, ty, heap } => {
            let ir = c.reg_index(*dest);
            let ptr_ty = c.typ_of(*dest);
            let ty = *ty;
            if *heap {
                Box::new(move |itp, fr| {
                    let cell = PointerVal::new_cell(ptr_ty, zero_value(&itp.store, ty));
                    fr.set_reg(ir, Value::Pointer(cell));
                    Ok(())
                })
            } else {
                // The stack variant re-zeroes the frame's existing cell,
                // allocating it lazily on the first touch.
                Box::new(move |itp, fr| {
                    if let Value::Pointer(p) = &fr.stack[ir.index()] {
                        p.place.store(zero_value(&itp.store, ty));
                    } else {
                        let cell = PointerVal::new_cell(ptr_ty, zero_value(&itp.store, ty));
                        fr.set_reg(ir, Value::Pointer(cell));
                    }
                    Ok(())
                })
            }
        }

        Instr::Phi { dest, edges } => {
            let ir = c.reg_index(*dest);
            let ie: Vec<(u32, Register)> =
                edges.iter().map(|(pred, v)| (*pred, c.reg_index(*v))).collect();
            Box::new(move |itp, fr| {
                for (pred, r) in &ie {
                    if fr.pred == *pred {
                        let v = fr.reg(itp, *r);
                        fr.set_reg(ir, v);
                        break;
                    }
                }
                Ok(())
            })
        }

        Instr::BinOp { dest, op, x, y } => {
            let ir = c.reg_index(*dest);
            let ix = c.reg_index(*x);
            let iy = c.reg_index(*y);

            macro_rules! binstep {
                ($f:path) => {
                    Box::new(move |itp: &Arc<Interp>, fr: &mut Frame| {
                        let xv = fr.reg(itp, ix);
                        let yv = fr.reg(itp, iy);
                        fr.set_reg(ir, $f(&xv, &yv)?);
                        Ok(())
                    })
                };
            }

            match op {
                BinOp::Add => binstep!(ops::op_add),
                BinOp::Sub => binstep!(ops::op_sub),
                BinOp::Mul => binstep!(ops::op_mul),
                BinOp::Quo => binstep!(ops::op_quo),
                BinOp::Rem => binstep!(ops::op_rem),
                BinOp::And => binstep!(ops::op_and),
                BinOp::Or => binstep!(ops::op_or),
                BinOp::Xor => binstep!(ops::op_xor),
                BinOp::AndNot => binstep!(ops::op_and_not),
                BinOp::Shl => binstep!(ops::op_shl),
                BinOp::Shr => binstep!(ops::op_shr),
                BinOp::Lss => binstep!(ops::op_lss),
                BinOp::Leq => binstep!(ops::op_leq),
                BinOp::Gtr => binstep!(ops::op_gtr),
                BinOp::Geq => binstep!(ops::op_geq),
                BinOp::Eql | BinOp::Neq => {
                    let xn = c.prog.is_const_nil(*x);
                    let yn = c.prog.is_const_nil(*y);
                    let negate = *op == BinOp::Neq;
                    Box::new(move |itp, fr| {
                        let xv = fr.reg(itp, ix);
                        let yv = fr.reg(itp, iy);
                        let eq = ops::op_eql(&itp.store, &xv, &yv, xn, yn)?;
                        fr.set_reg(ir, Value::Bool(eq != negate));
                        Ok(())
                    })
                }
            }
        }

        Instr::UnOp { dest, op, x, comma_ok } => {
            let ir = c.reg_index(*dest);
            let ix = c.reg_index(*x);
            match op {
                UnOp::Recv => {
                    let elem_ty = c
                        .interp
                        .store
                        .elem(c.typ_of(*x))
                        .unwrap_or(sago_ssa::types::builtin::INVALID);
                    let comma_ok = *comma_ok;
                    Box::new(move |itp, fr| {
                        let cv = fr.reg(itp, ix);
                        let (v, ok) = match cv.unnamed() {
                            Value::Chan(ch) => match ch.core.recv() {
                                Some(v) => (v, true),
                                None => (zero_value(&itp.store, elem_ty), false),
                            },
                            Value::Nil => block_forever(),
                            other => {
                                return Err(Panic::runtime(format!(
                                    "receive from non-channel {}",
                                    other.kind_name()
                                )))
                            }
                        };
                        if comma_ok {
                            fr.set_reg(ir, Value::Tuple(vec![v, Value::Bool(ok)].into()));
                        } else {
                            fr.set_reg(ir, v);
                        }
                        Ok(())
                    })
                }
                UnOp::Neg => Box::new(move |itp, fr| {
                    let v = fr.reg(itp, ix);
                    fr.set_reg(ir, ops::op_neg(&v)?);
                    Ok(())
                }),
                UnOp::Not => Box::new(move |itp, fr| {
                    let v = fr.reg(itp, ix);
                    fr.set_reg(ir, ops::op_not(&v)?);
                    Ok(())
                }),
                UnOp::Xor => Box::new(move |itp, fr| {
                    let v = fr.reg(itp, ix);
                    fr.set_reg(ir, ops::op_bitnot(&v)?);
                    Ok(())
                }),
                UnOp::Deref => Box::new(move |itp, fr| {
                    let v = fr.reg(itp, ix);
                    match v.unnamed() {
                        Value::Pointer(p) => {
                            let loaded = p.place.load();
                            fr.set_reg(ir, loaded);
                            Ok(())
                        }
                        Value::Nil => Err(Panic::runtime(
                            "invalid memory address or nil pointer dereference",
                        )),
                        other => Err(Panic::runtime(format!(
                            "dereference of non-pointer {}",
                            other.kind_name()
                        ))),
                    }
                }),
            }
        }

        Instr::ChangeType { dest, x } => {
            let ir = c.reg_index(*dest);
            let to = c.typ_of(*dest);
            let (ix, is_static, vx) = c.reg3(*x);
            if is_static {
                let folded = ops::retag(&c.interp.store, &vx.unwrap_or(Value::Nil), to);
                Box::new(move |_itp, fr| {
                    fr.set_reg(ir, folded.clone());
                    Ok(())
                })
            } else {
                Box::new(move |itp, fr| {
                    let v = fr.reg(itp, ix);
                    fr.set_reg(ir, ops::retag(&itp.store, &v, to));
                    Ok(())
                })
            }
        }

        Instr::Convert { dest, x } => {
            let ir = c.reg_index(*dest);
            let to = c.typ_of(*dest);
            let ix = c.reg_index(*x);
            Box::new(move |itp, fr| {
                let v = fr.reg(itp, ix);
                fr.set_reg(ir, ops::convert(&itp.store, &v, to)?);
                Ok(())
            })
        }

        Instr::ChangeInterface { dest, x } | Instr::MakeInterface { dest, x } => {
            // Every value carries its dynamic type; boxing is a move.
            let ir = c.reg_index(*dest);
            let (ix, is_static, vx) = c.reg3(*x);
            if is_static {
                let folded = vx.unwrap_or(Value::Nil);
                Box::new(move |_itp, fr| {
                    fr.set_reg(ir, folded.clone());
                    Ok(())
                })
            } else {
                Box::new(move |itp, fr| {
                    fr.copy_reg(itp, ir, ix);
                    Ok(())
                })
            }
        }

        Instr::SliceToArrayPointer { dest, x } => {
            let ir = c.reg_index(*dest);
            let to = c.typ_of(*dest);
            let ix = c.reg_index(*x);
            let store = &c.interp.store;
            let arr_ty = store.elem(to).unwrap_or(sago_ssa::types::builtin::INVALID);
            let tlen = match store.data(store.underlying(arr_ty)) {
                TypeData::Array { len, .. } => len,
                _ => 0,
            };
            Box::new(move |itp, fr| {
                let v = fr.reg(itp, ix);
                let sv = match v.unnamed() {
                    Value::Slice(sv) => sv.clone(),
                    Value::Nil if tlen == 0 => {
                        fr.set_reg(ir, Value::Nil);
                        return Ok(());
                    }
                    _ => {
                        return Err(Panic::runtime(format!(
                            "cannot convert slice with length 0 to pointer to array with length {}",
                            tlen
                        )))
                    }
                };
                if tlen > sv.len {
                    return Err(Panic::runtime(format!(
                        "cannot convert slice with length {} to pointer to array with length {}",
                        sv.len, tlen
                    )));
                }
                let elems = sv.read_all()[..tlen].to_vec();
                let arr = Value::Array(Box::new(ArrayVal { typ: arr_ty, elems }));
                fr.set_reg(ir, Value::Pointer(PointerVal::new_cell(to, arr)));
                Ok(())
            })
        }

        Instr::MakeClosure { dest, func, bindings } => {
            let ir = c.reg_index(*dest);
            let ib: Vec<Register> = bindings.iter().map(|b| c.reg_index(*b)).collect();
            let pfn = c.interp.load_function(*func);
            Box::new(move |itp, fr| {
                let env: Vec<Value> = ib.iter().map(|r| fr.reg(itp, *r)).collect();
                fr.set_reg(
                    ir,
                    Value::Func(FuncVal::Interp { func: pfn.clone(), env: Arc::new(env) }),
                );
                Ok(())
            })
        }

        Instr::MakeChan { dest, size } => {
            let ir = c.reg_index(*dest);
            let typ = c.typ_of(*dest);
            let is = c.reg_index(*size);
            Box::new(move |itp, fr| {
                let size = fr.reg(itp, is).as_int()?;
                if size < 0 || size >= MAX_MEM_LEN {
                    return Err(Panic::runtime("makechan: size out of range"));
                }
                fr.set_reg(
                    ir,
                    Value::Chan(ChanVal { typ, core: ChanCore::new(size as usize) }),
                );
                Ok(())
            })
        }

        Instr::MakeMap { dest, reserve } => {
            let ir = c.reg_index(*dest);
            let typ = c.typ_of(*dest);
            match reserve {
                None => Box::new(move |_itp, fr| {
                    fr.set_reg(ir, Value::Map(MapVal::new(typ, 0)));
                    Ok(())
                }),
                Some(rv) => {
                    let irsv = c.reg_index(*rv);
                    Box::new(move |itp, fr| {
                        let n = fr.reg(itp, irsv).as_int()?.max(0) as usize;
                        fr.set_reg(ir, Value::Map(MapVal::new(typ, n)));
                        Ok(())
                    })
                }
            }
        }

        Instr::MakeSlice { dest, len, cap } => {
            let ir = c.reg_index(*dest);
            let typ = c.typ_of(*dest);
            let elem = c
                .interp
                .store
                .elem(typ)
                .unwrap_or(sago_ssa::types::builtin::INVALID);
            let il = c.reg_index(*len);
            let icap = c.reg_index(*cap);
            Box::new(move |itp, fr| {
                let len = fr.reg(itp, il).as_int()?;
                if len < 0 || len >= MAX_MEM_LEN {
                    return Err(Panic::runtime("makeslice: len out of range"));
                }
                let cap = fr.reg(itp, icap).as_int()?;
                if cap < 0 || cap >= MAX_MEM_LEN || len > cap {
                    return Err(Panic::runtime("makeslice: cap out of range"));
                }
                let zero = zero_value(&itp.store, elem);
                let mut sv = SliceVal::from_vec(typ, vec![zero; cap as usize]);
                sv.len = len as usize;
                fr.set_reg(ir, Value::Slice(sv));
                Ok(())
            })
        }

        Instr::Slice { dest, x, low, high, max } => {
            let ir = c.reg_index(*dest);
            let typ = c.typ_of(*dest);
            let ix = c.reg_index(*x);
            let il = low.map(|v| c.reg_index(v));
            let ih = high.map(|v| c.reg_index(v));
            let im = max.map(|v| c.reg_index(v));
            Box::new(move |itp, fr| {
                let xv = fr.reg(itp, ix);
                let lo = match il {
                    Some(r) => Some(fr.reg(itp, r).as_int()?),
                    None => None,
                };
                let hi = match ih {
                    Some(r) => Some(fr.reg(itp, r).as_int()?),
                    None => None,
                };
                let mx = match im {
                    Some(r) => Some(fr.reg(itp, r).as_int()?),
                    None => None,
                };
                let out = slice_value(typ, &xv, lo, hi, mx)?;
                fr.set_reg(ir, out);
                Ok(())
            })
        }

        Instr::FieldAddr { dest, x, field } => {
            let ir = c.reg_index(*dest);
            let ptr_ty = c.typ_of(*dest);
            let ix = c.reg_index(*x);
            let field = *field;
            Box::new(move |itp, fr| {
                let v = fr.reg(itp, ix);
                match v.unnamed() {
                    Value::Pointer(p) => {
                        let place =
                            Place::Field { base: Box::new(p.place.clone()), index: field };
                        fr.set_reg(ir, Value::Pointer(PointerVal { typ: ptr_ty, place }));
                        Ok(())
                    }
                    Value::Nil => Err(Panic::runtime(
                        "invalid memory address or nil pointer dereference",
                    )),
                    other => Err(Panic::runtime(format!(
                        "field address of non-pointer {}",
                        other.kind_name()
                    ))),
                }
            })
        }

        Instr::Field { dest, x, field } => {
            let ir = c.reg_index(*dest);
            let ix = c.reg_index(*x);
            let field = *field;
            Box::new(move |itp, fr| {
                let v = fr.reg(itp, ix);
                match v.unnamed() {
                    Value::Struct(s) => {
                        let fv = s.fields[field].clone();
                        fr.set_reg(ir, fv);
                        Ok(())
                    }
                    _ => Err(Panic::runtime("field of non-struct value")),
                }
            })
        }

        Instr::IndexAddr { dest, x, index } => {
            let ir = c.reg_index(*dest);
            let ptr_ty = c.typ_of(*dest);
            let ix = c.reg_index(*x);
            let ii = c.reg_index(*index);
            Box::new(move |itp, fr| {
                let xv = fr.reg(itp, ix);
                let idx = fr.reg(itp, ii).as_int()?;
                if idx < 0 {
                    return Err(Panic::runtime(format!("index out of range [{}]", idx)));
                }
                let idx = idx as usize;
                let place = match xv.unnamed() {
                    Value::Slice(sv) => {
                        if idx >= sv.len {
                            return Err(Panic::runtime(format!(
                                "index out of range [{}] with length {}",
                                idx, sv.len
                            )));
                        }
                        sv.elem_place(idx)
                    }
                    Value::Pointer(p) => {
                        let len = p.place.with(|v| match v {
                            Value::Array(a) => a.elems.len(),
                            _ => 0,
                        });
                        if idx >= len {
                            return Err(Panic::runtime(format!(
                                "index out of range [{}] with length {}",
                                idx, len
                            )));
                        }
                        Place::Index { base: Box::new(p.place.clone()), index: idx }
                    }
                    Value::Nil => {
                        return Err(Panic::runtime(
                            "invalid memory address or nil pointer dereference",
                        ))
                    }
                    other => {
                        return Err(Panic::runtime(format!(
                            "index address of {}",
                            other.kind_name()
                        )))
                    }
                };
                fr.set_reg(ir, Value::Pointer(PointerVal { typ: ptr_ty, place }));
                Ok(())
            })
        }

        Instr::Index { dest, x, index } => {
            let ir = c.reg_index(*dest);
            let ix = c.reg_index(*x);
            let ii = c.reg_index(*index);
            Box::new(move |itp, fr| {
                let xv = fr.reg(itp, ix);
                let idx = fr.reg(itp, ii).as_int()?;
                let out = match xv.unnamed() {
                    Value::Array(a) => {
                        if idx < 0 || idx as usize >= a.elems.len() {
                            return Err(Panic::runtime(format!(
                                "index out of range [{}] with length {}",
                                idx,
                                a.elems.len()
                            )));
                        }
                        a.elems[idx as usize].clone()
                    }
                    Value::Slice(sv) => {
                        if idx < 0 || idx as usize >= sv.len {
                            return Err(Panic::runtime(format!(
                                "index out of range [{}] with length {}",
                                idx, sv.len
                            )));
                        }
                        sv.get(idx as usize)
                    }
                    Value::Str(s) => {
                        if idx < 0 || idx as usize >= s.len() {
                            return Err(Panic::runtime(format!(
                                "index out of range [{}] with length {}",
                                idx,
                                s.len()
                            )));
                        }
                        Value::Uint8(s.as_bytes()[idx as usize])
                    }
                    other => {
                        return Err(Panic::runtime(format!("index of {}", other.kind_name())))
                    }
                };
                fr.set_reg(ir, out);
                Ok(())
            })
        }

        Instr::Lookup { dest, x, index, comma_ok } => {
            let ir = c.reg_index(*dest);
            let ix = c.reg_index(*x);
            let ii = c.reg_index(*index);
            let comma_ok = *comma_ok;
            let xt = c.typ_of(*x);
            let store = &c.interp.store;
            match store.data(store.underlying(xt)) {
                TypeData::Map { value, .. } => {
                    let blank = c.interp.record.map_key_has_blank(store, xt);
                    let val_ty = value;
                    Box::new(move |itp, fr| {
                        let m = fr.reg(itp, ix);
                        let mut key = fr.reg(itp, ii);
                        if blank {
                            normalize_blank_key(&itp.store, &mut key);
                        }
                        let found = match m.unnamed() {
                            Value::Map(mv) => mv.inner.lock().get(&MapKey(key)).cloned(),
                            Value::Nil => None,
                            _ => return Err(Panic::runtime("lookup in non-map value")),
                        };
                        let ok = found.is_some();
                        let rv = match found {
                            Some(v) => v,
                            None => zero_value(&itp.store, val_ty),
                        };
                        if comma_ok {
                            fr.set_reg(ir, Value::Tuple(vec![rv, Value::Bool(ok)].into()));
                        } else {
                            fr.set_reg(ir, rv);
                        }
                        Ok(())
                    })
                }
                _ => Box::new(move |itp, fr| {
                    let s = fr.reg(itp, ix);
                    let idx = fr.reg(itp, ii).as_int()?;
                    match s.unnamed() {
                        Value::Str(s) => {
                            if idx < 0 || idx as usize >= s.len() {
                                return Err(Panic::runtime(format!(
                                    "index out of range [{}] with length {}",
                                    idx,
                                    s.len()
                                )));
                            }
                            fr.set_reg(ir, Value::Uint8(s.as_bytes()[idx as usize]));
                            Ok(())
                        }
                        other => Err(Panic::runtime(format!(
                            "lookup in {}",
                            other.kind_name()
                        ))),
                    }
                }),
            }
        }

        Instr::Select { dest, states, blocking } => {
            let ir = c.reg_index(*dest);
            let blocking = *blocking;
            let compiled: Vec<(Register, Option<Register>, Option<Type>)> = states
                .iter()
                .map(|st: &SelectState| {
                    let ic = c.reg_index(st.chan);
                    let is = st.send.map(|v| c.reg_index(v));
                    let elem = if st.is_recv() {
                        Some(
                            c.interp
                                .store
                                .elem(c.typ_of(st.chan))
                                .unwrap_or(sago_ssa::types::builtin::INVALID),
                        )
                    } else {
                        None
                    };
                    (ic, is, elem)
                })
                .collect();
            Box::new(move |itp, fr| {
                let mut cases: Vec<SelectCase> = Vec::with_capacity(compiled.len());
                for (ic, is, _) in &compiled {
                    let ch = match fr.reg(itp, *ic).unnamed() {
                        Value::Chan(cv) => Some(cv.core.clone()),
                        _ => None,
                    };
                    match is {
                        Some(r) => {
                            cases.push(SelectCase::Send { chan: ch, val: fr.reg(itp, *r) })
                        }
                        None => cases.push(SelectCase::Recv { chan: ch }),
                    }
                }
                let outcome = chan::run_select(&cases, blocking)?;
                let (chosen, recv_ok, recv_val) = match outcome {
                    Some(o) => (o.chosen as i64, o.recv_ok, o.recv_val),
                    None => (-1, false, None),
                };
                let mut tuple = vec![Value::Int(chosen), Value::Bool(recv_ok)];
                for (i, (_, is, elem)) in compiled.iter().enumerate() {
                    if is.is_none() {
                        let elem = (*elem).unwrap_or(sago_ssa::types::builtin::INVALID);
                        if i as i64 == chosen && recv_ok {
                            tuple.push(recv_val.clone().unwrap_or(Value::Nil));
                        } else {
                            tuple.push(zero_value(&itp.store, elem));
                        }
                    }
                }
                fr.set_reg(ir, Value::Tuple(tuple.into()));
                Ok(())
            })
        }

        Instr::Range { dest, x } => {
            let ir = c.reg_index(*dest);
            let ix = c.reg_index(*x);
            Box::new(move |itp, fr| {
                let v = fr.reg(itp, ix);
                let state = match v.unnamed() {
                    Value::Str(s) => crate::value::IterState::Str { s: s.clone(), pos: 0 },
                    Value::Map(mv) => {
                        let snapshot: std::collections::VecDeque<(Value, Value)> = mv
                            .inner
                            .lock()
                            .iter()
                            .map(|(k, v)| (k.0.clone(), v.clone()))
                            .collect();
                        crate::value::IterState::Map { entries: snapshot }
                    }
                    Value::Nil => {
                        crate::value::IterState::Map { entries: Default::default() }
                    }
                    other => {
                        return Err(Panic::runtime(format!(
                            "range over {}",
                            other.kind_name()
                        )))
                    }
                };
                fr.set_reg(
                    ir,
                    Value::Iter(crate::value::IterVal {
                        inner: Arc::new(Mutex::new(state)),
                    }),
                );
                Ok(())
            })
        }

        Instr::Next { dest, iter, .. } => {
            let ir = c.reg_index(*dest);
            let ii = c.reg_index(*iter);
            Box::new(move |itp, fr| {
                let it = fr.reg(itp, ii);
                let out = match it {
                    Value::Iter(iv) => {
                        let mut st = iv.inner.lock();
                        match &mut *st {
                            crate::value::IterState::Str { s, pos } => {
                                match s[*pos..].chars().next() {
                                    Some(ch) => {
                                        let at = *pos as i64;
                                        *pos += ch.len_utf8();
                                        Value::Tuple(
                                            vec![
                                                Value::Bool(true),
                                                Value::Int(at),
                                                Value::Int32(ch as i32),
                                            ]
                                            .into(),
                                        )
                                    }
                                    None => Value::Tuple(
                                        vec![Value::Bool(false), Value::Nil, Value::Nil].into(),
                                    ),
                                }
                            }
                            crate::value::IterState::Map { entries } => match entries.pop_front() {
                                Some((k, v)) => {
                                    Value::Tuple(vec![Value::Bool(true), k, v].into())
                                }
                                None => Value::Tuple(
                                    vec![Value::Bool(false), Value::Nil, Value::Nil].into(),
                                ),
                            },
                        }
                    }
                    _ => return Err(Panic::runtime("next on non-iterator value")),
                };
                fr.set_reg(ir, out);
                Ok(())
            })
        }

        Instr::TypeAssert { dest, x, asserted, comma_ok } => {
            let ir = c.reg_index(*dest);
            let ix = c.reg_index(*x);
            let static_x = c.typ_of(*x);
            let asserted = *asserted;
            let comma_ok = *comma_ok;
            Box::new(move |itp, fr| {
                let v = fr.reg(itp, ix);
                let out = rtype::assert_value(&itp.store, static_x, asserted, &v, comma_ok)?;
                fr.set_reg(ir, out);
                Ok(())
            })
        }

        Instr::Extract { dest, tuple, index } => {
            let ir = c.reg_index(*dest);
            let it = c.reg_index(*tuple);
            let index = *index;
            Box::new(move |itp, fr| {
                let t = fr.reg(itp, it);
                match t {
                    Value::Tuple(elems) => {
                        fr.set_reg(ir, elems[index].clone());
                        Ok(())
                    }
                    _ => Err(Panic::runtime("extract from non-tuple value")),
                }
            })
        }

        Instr::Jump { target } => {
            let target = *target;
            Box::new(move |_itp, fr| {
                fr.pred = fr.block;
                fr.block = target;
                fr.pc = fr.body.blocks[target as usize];
                Ok(())
            })
        }

        Instr::If { cond, then_block, else_block } => {
            let ic = c.reg_index(*cond);
            let (tb, eb) = (*then_block, *else_block);
            Box::new(move |itp, fr| {
                fr.pred = fr.block;
                fr.block = if fr.reg(itp, ic).as_bool() { tb } else { eb };
                fr.pc = fr.body.blocks[fr.block as usize];
                Ok(())
            })
        }

        Instr::Return { results } => {
            let rs: Vec<Register> = results.iter().map(|r| c.reg_index(*r)).collect();
            if rs.is_empty() {
                Box::new(move |_itp, fr| {
                    fr.pc = -1;
                    Ok(())
                })
            } else {
                Box::new(move |_itp, fr| {
                    fr.results = rs.clone();
                    fr.pc = -1;
                    Ok(())
                })
            }
        }

        Instr::RunDefers => Box::new(move |itp, fr| crate::interp::run_defers(itp, fr)),

        Instr::Panic { x } => {
            let ix = c.reg_index(*x);
            Box::new(move |itp, fr| {
                let v = fr.reg(itp, ix);
                Err(Panic::Target(v))
            })
        }

        Instr::Go { call } => {
            let pc = c.prepare_call(call);
            Box::new(move |itp, fr| {
                let (callee, args) = pc.resolve(itp, fr)?;
                crate::interp::spawn_goroutine(itp, callee, args, pc.iface_args());
                Ok(())
            })
        }

        Instr::Defer { call } => {
            let pc = c.prepare_call(call);
            Box::new(move |itp, fr| {
                let (callee, args) = pc.resolve(itp, fr)?;
                fr.push_defer(Deferred {
                    callee,
                    args,
                    iface_args: pc.iface_args(),
                });
                Ok(())
            })
        }

        Instr::Send { chan, x } => {
            let ic = c.reg_index(*chan);
            let ix = c.reg_index(*x);
            Box::new(move |itp, fr| {
                let cv = fr.reg(itp, ic);
                let v = fr.reg(itp, ix);
                match cv.unnamed() {
                    Value::Chan(ch) => ch.core.send(v),
                    Value::Nil => block_forever(),
                    other => Err(Panic::runtime(format!(
                        "send to non-channel {}",
                        other.kind_name()
                    ))),
                }
            })
        }

        Instr::Store { addr, val } => {
            // A store through the address of a blank struct field compiles
            // to no step.
            if let Some(Instr::FieldAddr { x, field, .. }) = defining_instr(ssa_fn, *addr) {
                if field_is_blank(c, *x, *field) {
                    return Ok(None);
                }
            }
            let ia = c.reg_index(*addr);
            let (iv, is_static, vv) = c.reg3(*val);
            if is_static {
                let folded = vv.unwrap_or(Value::Nil);
                Box::new(move |itp, fr| {
                    let a = fr.reg(itp, ia);
                    store_through(&a, folded.clone())
                })
            } else {
                Box::new(move |itp, fr| {
                    let a = fr.reg(itp, ia);
                    let v = fr.reg(itp, iv);
                    store_through(&a, v)
                })
            }
        }

        Instr::MapUpdate { map, key, value } => {
            let im = c.reg_index(*map);
            let ik = c.reg_index(*key);
            let ivv = c.reg_index(*value);
            let blank = c
                .interp
                .record
                .map_key_has_blank(&c.interp.store, c.typ_of(*map));
            Box::new(move |itp, fr| {
                let m = fr.reg(itp, im);
                let mut key = fr.reg(itp, ik);
                let v = fr.reg(itp, ivv);
                if blank {
                    normalize_blank_key(&itp.store, &mut key);
                }
                match m.unnamed() {
                    Value::Map(mv) => {
                        mv.inner.lock().insert(MapKey(key), v);
                        Ok(())
                    }
                    Value::Nil => Err(Panic::runtime("assignment to entry in nil map")),
                    other => Err(Panic::runtime(format!(
                        "map update on {}",
                        other.kind_name()
                    ))),
                }
            })
        }

        Instr::DebugRef { x, name } => {
            let debug = c.interp.ctx.debug_hook();
            match debug {
                None => return Ok(None),
                Some(hook) => {
                    let ix = c.reg_index(*x);
                    let name = name.clone();
                    let fname = ssa_fn.full_name();
                    Box::new(move |itp, fr| {
                        let v = fr.reg(itp, ix);
                        hook(&crate::context::DebugInfo {
                            func: fname.clone(),
                            name: name.clone(),
                            value: v,
                        });
                        Ok(())
                    })
                }
            }
        }

        Instr::Call { dest, call } => return make_call_step(c, *dest, call).map(Some),
    };
    Ok(Some(step))
}

/// The instruction defining `v` inside this function body, if any.
fn defining_instr(ssa_fn: &SsaFunction, v: ValueId) -> Option<&Instr> {
    ssa_fn
        .blocks
        .iter()
        .flat_map(|b| b.instrs.iter())
        .find(|i| i.dest() == Some(v))
}

/// Whether field `field` of the struct behind pointer-typed value `x` is
/// blank (`_`).
fn field_is_blank(c: &Compiler<'_>, x: ValueId, field: usize) -> bool {
    let store = &c.interp.store;
    let base = match store.elem(c.typ_of(x)) {
        Some(t) => t,
        None => return false,
    };
    match store.data(store.underlying(base)) {
        TypeData::Struct { fields } => fields.get(field).map_or(false, |f| f.is_blank()),
        _ => false,
    }
}

/// Store through a pointer value, with the nil-dereference fault.
fn store_through(addr: &Value, v: Value) -> Result<(), Panic> {
    match addr.unnamed() {
        Value::Pointer(p) => {
            p.place.store(v);
            Ok(())
        }
        Value::Nil => Err(Panic::runtime("invalid memory address or nil pointer dereference")),
        other => Err(Panic::runtime(format!("store through {}", other.kind_name()))),
    }
}

/// `x[lo:hi:max]` over strings, slices and pointers-to-array, with the
/// original's bounds diagnostics.
fn slice_value(
    result_ty: Type,
    x: &Value,
    lo: Option<i64>,
    hi: Option<i64>,
    max: Option<i64>,
) -> Result<Value, Panic> {
    enum Base {
        Str(Arc<str>),
        Slice(SliceVal),
        Array(Place),
        Empty,
    }
    let (base, len, cap) = match x.unnamed() {
        Value::Str(s) => {
            let n = s.len() as i64;
            (Base::Str(s.clone()), n, n)
        }
        Value::Slice(sv) => (Base::Slice(sv.clone()), sv.len as i64, sv.cap as i64),
        Value::Pointer(p) => {
            let n = p.place.with(|v| match v {
                Value::Array(a) => a.elems.len(),
                _ => 0,
            }) as i64;
            (Base::Array(p.place.clone()), n, n)
        }
        Value::Nil => (Base::Empty, 0, 0),
        other => {
            return Err(Panic::runtime(format!("slice of {}", other.kind_name())))
        }
    };
    let is_slice_kind = matches!(base, Base::Slice(_) | Base::Empty);

    let lo = lo.unwrap_or(0);
    let hi = hi.unwrap_or(len);
    let slice3 = max.is_some();
    let max = max.unwrap_or(cap);

    if slice3 {
        if max < 0 {
            return Err(Panic::runtime(format!("slice bounds out of range [::{}]", max)));
        } else if max > cap {
            if is_slice_kind {
                return Err(Panic::runtime(format!(
                    "slice bounds out of range [::{}] with capacity {}",
                    max, cap
                )));
            }
            return Err(Panic::runtime(format!(
                "slice bounds out of range [::{}] with length {}",
                max, cap
            )));
        } else if hi < 0 {
            return Err(Panic::runtime(format!("slice bounds out of range [:{}:]", hi)));
        } else if hi > max {
            return Err(Panic::runtime(format!(
                "slice bounds out of range [:{}:{}]",
                hi, max
            )));
        } else if lo < 0 {
            return Err(Panic::runtime(format!("slice bounds out of range [{}::]", lo)));
        } else if lo > hi {
            return Err(Panic::runtime(format!(
                "slice bounds out of range [{}:{}:]",
                lo, hi
            )));
        }
    } else {
        if hi < 0 {
            return Err(Panic::runtime(format!("slice bounds out of range [:{}]", hi)));
        } else if hi > cap {
            if is_slice_kind {
                return Err(Panic::runtime(format!(
                    "slice bounds out of range [:{}] with capacity {}",
                    hi, cap
                )));
            }
            return Err(Panic::runtime(format!(
                "slice bounds out of range [:{}] with length {}",
                hi, cap
            )));
        } else if lo < 0 {
            return Err(Panic::runtime(format!("slice bounds out of range [{}:]", lo)));
        } else if lo > hi {
            return Err(Panic::runtime(format!(
                "slice bounds out of range [{}:{}]",
                lo, hi
            )));
        }
    }

    let (lo, hi, max) = (lo as usize, hi as usize, max as usize);
    let out = match base {
        Base::Str(s) => {
            // x[len(x):] touches no storage.
            if lo == hi {
                Value::str("")
            } else {
                match s.get(lo..hi) {
                    Some(sub) => Value::str(sub),
                    None => Value::from(String::from_utf8_lossy(&s.as_bytes()[lo..hi]).into_owned()),
                }
            }
        }
        Base::Slice(sv) => Value::Slice({
            let mut out = sv.subslice(lo, hi, max);
            out.typ = result_ty;
            out
        }),
        Base::Array(place) => {
            let full = SliceVal::from_array_place(result_ty, place, len as usize);
            Value::Slice(full.subslice(lo, hi, max))
        }
        Base::Empty => Value::Nil,
    };
    Ok(out)
}

/// Compile a `Call` instruction, choosing the dispatch path statically:
/// builtin, static interpreted function, resolved extern, interface
/// invoke, or dynamic function value.
fn make_call_step(c: &mut Compiler<'_>, dest: ValueId, call: &CallCommon) -> Result<Step, Panic> {
    let ir = c.reg_index(dest);
    let (iv, ia, iface_args) = c.call_regs(call);

    if let Some(mname) = &call.method {
        let mname = mname.clone();
        return Ok(Box::new(move |itp, fr| {
            let recv = fr.reg(itp, iv);
            let target = lookup_invoke_target(itp, &recv, &mname)?;
            let mut args = Vec::with_capacity(ia.len() + 1);
            args.push(recv);
            for r in &ia {
                args.push(fr.reg(itp, *r));
            }
            let out = crate::interp::call_callee(itp, &target, args, &iface_args)?;
            fr.set_reg(ir, out);
            Ok(())
        }));
    }

    match &c.prog.value(call.value).def {
        ValueDef::Builtin(name) => {
            let name = name.clone();
            Ok(Box::new(move |itp, fr| {
                builtins::call_builtin_by_stack(itp, fr, &name, &iface_args, ir, &ia)
            }))
        }
        ValueDef::Function(fid) => {
            let f = c.prog.func(*fid);
            // Overrides intercept by qualified name even when the function
            // has a body.
            if let Some(ext) = c.interp.ctx.find_override(&f.full_name()) {
                return Ok(Box::new(move |itp, fr| {
                    crate::interp::call_extern_by_stack(itp, fr, &ext, ir, &ia)
                }));
            }
            if f.is_declaration_only() {
                if let Some(ext) = c.interp.find_extern_func(&f.full_name()) {
                    Ok(Box::new(move |itp, fr| {
                        crate::interp::call_extern_by_stack(itp, fr, &ext, ir, &ia)
                    }))
                } else if f.name == "init" {
                    // Imported package with no init body; nothing to run.
                    Ok(Box::new(move |_itp, _fr| Ok(())))
                } else {
                    let name = f.full_name();
                    Ok(Box::new(move |_itp, _fr| {
                        Err(Panic::runtime(format!("no code for function: {}", name)))
                    }))
                }
            } else {
                let pfn = c.interp.load_function(*fid);
                Ok(Box::new(move |itp, fr| {
                    crate::interp::call_function_by_stack(itp, fr, &pfn, ir, &ia, None)
                }))
            }
        }
        _ => {
            // Dynamic callee: a closure or any other function value.
            Ok(Box::new(move |itp, fr| {
                let fv = fr.reg(itp, iv);
                match fv.unnamed() {
                    Value::Func(FuncVal::Interp { func, env }) => {
                        let func = func.clone();
                        let env = env.clone();
                        crate::interp::call_function_by_stack(itp, fr, &func, ir, &ia, Some(env))
                    }
                    Value::Func(FuncVal::Extern { f, .. }) => {
                        let f = f.clone();
                        crate::interp::call_extern_by_stack(itp, fr, &f, ir, &ia)
                    }
                    Value::Nil => Err(Panic::runtime(
                        "invalid memory address or nil pointer dereference",
                    )),
                    other => Err(Panic::runtime(format!(
                        "call of non-function {}",
                        other.kind_name()
                    ))),
                }
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_encoding() {
        let r = Register::local(7);
        assert_eq!(r.kind(), RegKind::Local);
        assert!(!r.is_static());
        assert_eq!(r.index(), 7);

        let r = Register::statik(RegKind::Const, 3);
        assert_eq!(r.kind(), RegKind::Const);
        assert!(r.is_static());
        assert_eq!(r.index(), 3);

        let r = Register::statik(RegKind::Function, 0xabcd);
        assert_eq!(r.kind(), RegKind::Function);
        assert_eq!(r.index(), 0xabcd);
    }
}
