//! Interpreter state, frames, the step loop, and the call machinery.
//!
//! A frame owns a stack of boxed value slots; the step loop fetches the
//! step at `pc`, increments `pc`, and invokes it, until a return sets
//! `pc` to -1 or a step returns a panic. Functions with a recover path
//! intercept the panic, run the deferred chain, and resume through the
//! recover-step sequence when the panic was consumed.
//!
//! Deferred calls run in LIFO order. While a frame runs its defers, the
//! in-flight panic lives in a shared cell registered in the per-goroutine
//! defer map; `recover()` drains that cell from exactly one call level
//! below the deferred function.

use std::cell::Cell as StdCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use sago_ssa::program::Member;
use sago_ssa::types::{Type, TypeStore};
use sago_ssa::{ConstValue, FuncId, GlobalId, Program, ValueId};

use crate::builtins;
use crate::compile::{Body, Function, RegKind, Register};
use crate::context::{Context, Mode};
use crate::error::{Error, Panic};
use crate::registry::{extern_fn, ExternFn};
use crate::rtype::TypesRecord;
use crate::value::{format_value, zero_value, FuncVal, PointerVal, Value};

/// The shared cell holding a frame's in-flight panic while its defers run.
pub type PanicCell = Arc<Mutex<Option<Panic>>>;

static NEXT_GOID: AtomicU64 = AtomicU64::new(2);

thread_local! {
    static GOID: StdCell<u64> = StdCell::new(1);
}

/// The id of the goroutine running on this thread. The main goroutine
/// is 1.
pub fn current_goid() -> u64 {
    GOID.with(|g| g.get())
}

fn set_goid(id: u64) {
    GOID.with(|g| g.set(id));
}

/// Park the current goroutine forever (nil-channel operations).
pub fn block_forever() -> ! {
    loop {
        std::thread::park();
    }
}

/// A resolved callee for `go`/`defer`/invoke dispatch.
pub enum Callee {
    Value(Value),
    Builtin(String),
    /// A skipped bodiless init call.
    Nop,
}

/// One deferred call record.
pub struct Deferred {
    pub callee: Callee,
    pub args: Vec<Value>,
    /// Static interface-ness of each argument, for print formatting.
    pub iface_args: Arc<[bool]>,
}

/// One activation.
pub struct Frame {
    pub func: Arc<Function>,
    pub body: Arc<Body>,
    pub block: u32,
    pub pc: i64,
    /// Predecessor block index, for phi resolution.
    pub pred: u32,
    pub stack: Vec<Value>,
    pub results: Vec<Register>,
    /// Deferred calls in push order; run back to front.
    pub defers: Vec<Deferred>,
    pub panicking: Option<Panic>,
    /// Set on frames invoked as deferred calls: the panic cell of the
    /// deferring frame, drained by `recover()`.
    pub recovery: Option<PanicCell>,
}

impl Frame {
    #[inline]
    pub fn reg(&self, interp: &Interp, r: Register) -> Value {
        if r.is_static() {
            interp.static_value(r.index())
        } else {
            self.stack[r.index()].clone()
        }
    }

    #[inline]
    pub fn set_reg(&mut self, r: Register, v: Value) {
        debug_assert!(!r.is_static(), "write to static register");
        self.stack[r.index()] = v;
    }

    #[inline]
    pub fn copy_reg(&mut self, interp: &Interp, dst: Register, src: Register) {
        let v = self.reg(interp, src);
        self.set_reg(dst, v);
    }

    pub fn push_defer(&mut self, d: Deferred) {
        self.defers.push(d);
    }
}

/// State shared between all interpreted goroutines.
pub struct Interp {
    pub ctx: Arc<Context>,
    pub program: Arc<Program>,
    pub store: Arc<TypeStore>,
    pub record: TypesRecord,
    pub mode: Mode,
    /// Backing cells of package globals, keyed by global id.
    globals: RwLock<HashMap<u32, Value>>,
    /// The static value stack: constants, globals and function values,
    /// admitted once and never overwritten.
    stack: RwLock<Vec<Value>>,
    static_index: RwLock<HashMap<ValueId, Register>>,
    funcs: RwLock<HashMap<FuncId, Arc<Function>>>,
    goroutines: AtomicI32,
    defer_count: AtomicI32,
    /// Goroutine id -> panic cell of the frame currently running defers.
    defer_map: RwLock<HashMap<u64, PanicCell>>,
    exited: AtomicBool,
}

impl Interp {
    pub fn new(ctx: Arc<Context>, program: Arc<Program>) -> Result<Arc<Interp>, Error> {
        let store = program.store.clone();
        let record = TypesRecord::new();
        record.load_program(&program);
        record.load_registry(ctx.registry());

        let mode = ctx.mode();
        let interp = Arc::new(Interp {
            ctx: ctx.clone(),
            program: program.clone(),
            store: store.clone(),
            record,
            mode,
            globals: RwLock::new(HashMap::new()),
            stack: RwLock::new(Vec::new()),
            static_index: RwLock::new(HashMap::new()),
            funcs: RwLock::new(HashMap::new()),
            goroutines: AtomicI32::new(1),
            defer_count: AtomicI32::new(0),
            defer_map: RwLock::new(HashMap::new()),
            exited: AtomicBool::new(false),
        });

        if mode.contains(Mode::DUMP_PACKAGES) {
            for path in ctx.registry().paths() {
                eprintln!("# installed {}", path);
            }
        }
        if mode.contains(Mode::DUMP_INSTR) {
            let _ = program.dump_instrs(&mut std::io::stderr());
        }

        // Allocate global storage: registry-provided cells for installed
        // packages, fresh zeroed cells otherwise.
        {
            let mut globals = interp.globals.write();
            for (i, g) in program.globals().enumerate() {
                let val = match ctx.registry().lookup_var(&g.pkg, &g.name) {
                    Some(v) => v,
                    None => Value::Pointer(PointerVal::new_cell(
                        store.pointer(g.ty),
                        zero_value(&store, g.ty),
                    )),
                };
                globals.insert(i as u32, val);
            }
        }

        // Link check: every bodiless function must resolve to an override,
        // a registry function, or a dynamically-dispatched method.
        let mut missing: Vec<String> = Vec::new();
        for f in program.funcs() {
            if !f.is_declaration_only() || f.name == "init" || f.name.contains('.') {
                continue;
            }
            if interp.find_extern_func(&f.full_name()).is_none() {
                missing.push(f.full_name());
            }
        }
        if !missing.is_empty() {
            return Err(Error::Setup(format!(
                "no code for functions: {}",
                missing.join(", ")
            )));
        }

        Ok(interp)
    }

    // ---- static registers ----

    pub(crate) fn lookup_static(&self, v: ValueId) -> Option<Register> {
        self.static_index.read().get(&v).copied()
    }

    pub(crate) fn admit_static(&self, v: ValueId, kind: RegKind, val: Value) -> Register {
        let mut index = self.static_index.write();
        if let Some(r) = index.get(&v) {
            return *r;
        }
        let mut stack = self.stack.write();
        let r = Register::statik(kind, stack.len());
        stack.push(val);
        index.insert(v, r);
        r
    }

    pub(crate) fn static_value(&self, index: usize) -> Value {
        self.stack.read()[index].clone()
    }

    pub(crate) fn global_value(&self, gid: GlobalId) -> Value {
        self.globals.read().get(&gid.as_u32()).cloned().unwrap_or(Value::Nil)
    }

    /// The compiled-function cache; creates the shell on first reference.
    pub fn load_function(&self, fid: FuncId) -> Arc<Function> {
        if let Some(f) = self.funcs.read().get(&fid) {
            return f.clone();
        }
        let mut funcs = self.funcs.write();
        funcs
            .entry(fid)
            .or_insert_with(|| {
                Arc::new(Function::new(&self.program, fid, self.ctx.call_for_pool()))
            })
            .clone()
    }

    /// Resolve a declaration-only function: the exit special case first,
    /// then overrides, then the registry.
    pub fn find_extern_func(&self, full_name: &str) -> Option<ExternFn> {
        if full_name == "os.Exit" {
            return Some(extern_fn(|itp: &Arc<Interp>, args: &[Value]| {
                let code = args.first().map(|v| v.as_int()).transpose()?.unwrap_or(0) as i32;
                if itp.has_exited() {
                    std::process::exit(code);
                }
                Err(Panic::Exit(code))
            }));
        }
        if let Some(f) = self.ctx.find_override(full_name) {
            return Some(f);
        }
        let (pkg, name) = full_name.rsplit_once('.')?;
        self.ctx.registry().lookup_func(pkg, name)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn goroutine_count(&self) -> i32 {
        self.goroutines.load(Ordering::SeqCst)
    }

    pub(crate) fn defer_cell_for_goroutine(&self) -> Option<PanicCell> {
        if self.defer_count.load(Ordering::SeqCst) == 0 {
            return None;
        }
        self.defer_map.read().get(&current_goid()).cloned()
    }

    // ---- run entry points ----

    /// Run package init functions in dependency order.
    pub fn run_init(self: &Arc<Self>) -> Result<(), Error> {
        for fid in self.program.inits() {
            let pfn = self.load_function(*fid);
            if let Err(p) = call_interp_function(self, &pfn, Vec::new(), &[], None) {
                return Err(Error::Init(Box::new(Error::from_panic(p))));
            }
        }
        Ok(())
    }

    /// Run the entrypoint; returns the exit code and the classified error
    /// for a panic. Exit codes: 0 normal, 1 missing entrypoint, 2 panic,
    /// otherwise the explicit exit request.
    pub fn run_main(self: &Arc<Self>, entry: &str) -> (i32, Option<Error>) {
        let func = match self.program.func_by_name(entry) {
            Some(f) if !f.is_declaration_only() => f,
            _ => return (1, Some(Error::NoFunction(entry.to_string()))),
        };
        let pfn = self.load_function(func.id);
        let res = call_interp_function(self, &pfn, Vec::new(), &[], None);
        self.exited.store(true, Ordering::SeqCst);
        match res {
            Ok(_) => (0, None),
            Err(Panic::Exit(code)) => (code, None),
            Err(p) => (2, Some(Error::from_panic(p))),
        }
    }

    /// Call a named entry-package function with host values.
    pub fn run_func(self: &Arc<Self>, name: &str, args: Vec<Value>) -> Result<Value, Error> {
        let func = match self.program.func_by_name(name) {
            Some(f) if !f.is_declaration_only() => f,
            _ => return Err(Error::NoFunction(name.to_string())),
        };
        let pfn = self.load_function(func.id);
        let recovery = self.defer_cell_for_goroutine();
        match call_interp_function(self, &pfn, args, &[], recovery) {
            Ok(v) => Ok(v),
            Err(Panic::Exit(_)) => Ok(Value::Nil),
            Err(p) => Err(Error::from_panic(p)),
        }
    }

    // ---- introspection ----

    /// A callable function value for an entry-package function.
    pub fn get_func(self: &Arc<Self>, name: &str) -> Option<Value> {
        match self.program.member(name) {
            Some(Member::Func(fid)) => {
                let pfn = self.load_function(*fid);
                Some(Value::Func(FuncVal::Interp { func: pfn, env: Arc::new(Vec::new()) }))
            }
            _ => None,
        }
    }

    /// The address (pointer value) of an entry-package variable.
    pub fn get_var_addr(&self, name: &str) -> Option<Value> {
        match self.program.member(name) {
            Some(Member::Var(gid)) => Some(self.global_value(*gid)),
            _ => None,
        }
    }

    pub fn get_const(&self, name: &str) -> Option<(Type, ConstValue)> {
        match self.program.member(name) {
            Some(Member::Const { typ, value }) => Some((*typ, value.clone())),
            _ => None,
        }
    }

    pub fn get_type(&self, name: &str) -> Option<Type> {
        match self.program.member(name) {
            Some(Member::Type(t)) => Some(*t),
            _ => None,
        }
    }
}

// ---- frames and the step loop ----

pub(crate) fn alloc_frame(interp: &Arc<Interp>, pfn: &Arc<Function>) -> Result<Frame, Panic> {
    let body = pfn.body(interp)?;
    let stack = pfn.take_stack(body.nstack);
    Ok(Frame {
        func: pfn.clone(),
        body,
        block: 0,
        pc: 0,
        pred: 0,
        stack,
        results: Vec::new(),
        defers: Vec::new(),
        panicking: None,
        recovery: None,
    })
}

fn release_frame(pfn: &Arc<Function>, fr: Frame) {
    pfn.put_stack(fr.stack);
}

fn run_loop(interp: &Arc<Interp>, fr: &mut Frame) -> Result<(), Panic> {
    let body = fr.body.clone();
    let tracing = interp.mode.contains(Mode::TRACING);
    while fr.pc >= 0 {
        let pc = fr.pc as usize;
        if pc >= body.instrs.len() {
            // A well-formed function ends every block with a terminator.
            return Err(Panic::runtime(format!(
                "function {} ran off the end of its instructions",
                fr.func.name
            )));
        }
        fr.pc += 1;
        if tracing {
            eprintln!("{}\t{}", fr.func.name, body.descs[pc]);
        }
        (body.instrs[pc])(interp, fr)?;
    }
    Ok(())
}

/// Execute a frame to completion. Functions with a recover path intercept
/// panics: the panic moves into the frame, the deferred chain runs, and if
/// a defer recovered it the recover-step sequence produces the return.
pub(crate) fn run_frame(interp: &Arc<Interp>, fr: &mut Frame) -> Result<(), Panic> {
    if !fr.func.has_recover {
        return run_loop(interp, fr);
    }
    match run_loop(interp, fr) {
        Ok(()) => Ok(()),
        Err(p) => {
            fr.panicking = Some(p);
            run_defers(interp, fr)?;
            let body = fr.body.clone();
            for step in &body.recover_instrs {
                step(interp, fr)?;
            }
            Ok(())
        }
    }
}

/// Run the frame's deferred calls in LIFO order. While they run, the
/// frame's panic state lives in a shared cell registered for this
/// goroutine, so `recover()` one level down (and native call-backs) can
/// reach it. Re-raises if the chain ends still panicking.
pub(crate) fn run_defers(interp: &Arc<Interp>, fr: &mut Frame) -> Result<(), Panic> {
    if fr.defers.is_empty() && fr.panicking.is_none() {
        return Ok(());
    }
    interp.defer_count.fetch_add(1, Ordering::SeqCst);
    let goid = current_goid();
    let cell: PanicCell = Arc::new(Mutex::new(fr.panicking.take()));
    let prev = interp.defer_map.write().insert(goid, cell.clone());
    while let Some(d) = fr.defers.pop() {
        run_one_defer(interp, &cell, d);
    }
    {
        let mut map = interp.defer_map.write();
        match prev {
            Some(prev) => {
                map.insert(goid, prev);
            }
            None => {
                map.remove(&goid);
            }
        }
    }
    interp.defer_count.fetch_add(-1, Ordering::SeqCst);
    let result = cell.lock().take();
    match result {
        Some(p) => Err(p), // new panic, or still panicking
        None => Ok(()),
    }
}

/// Run one deferred call. Never unwinds: a panic from the call becomes
/// the new in-flight panic and deferring continues.
fn run_one_defer(interp: &Arc<Interp>, cell: &PanicCell, d: Deferred) {
    let Deferred { callee, args, iface_args } = d;
    let res = match &callee {
        Callee::Value(fv) => call_value(interp, fv, args, Some(cell.clone())),
        Callee::Builtin(name) => {
            builtins::call_builtin_deferred(interp, name, args, &iface_args)
        }
        Callee::Nop => Ok(Value::Nil),
    };
    if let Err(p) = res {
        *cell.lock() = Some(p);
    }
}

/// The `recover()` builtin, invoked with the frame of its caller. Yields
/// the in-flight panic only when that frame is a deferred call of a
/// panicking frame; exit requests are never consumed.
pub(crate) fn do_recover(interp: &Arc<Interp>, fr: &Frame) -> Value {
    if interp.mode.contains(Mode::DISABLE_RECOVER) {
        return Value::Nil;
    }
    if fr.panicking.is_some() {
        return Value::Nil;
    }
    if let Some(cell) = &fr.recovery {
        let mut slot = cell.lock();
        match slot.take() {
            Some(Panic::Exit(code)) => {
                *slot = Some(Panic::Exit(code));
                Value::Nil
            }
            Some(p) => p.recovered_value(),
            None => Value::Nil,
        }
    } else {
        Value::Nil
    }
}

// ---- call paths ----

/// Shape a frame's declared results into one value: nothing, the single
/// result, or a tuple.
fn frame_result(interp: &Arc<Interp>, fr: &Frame) -> Value {
    match fr.results.len() {
        0 => Value::Nil,
        1 => fr.reg(interp, fr.results[0]),
        _ => {
            let vals: Vec<Value> = fr.results.iter().map(|r| fr.reg(interp, *r)).collect();
            Value::Tuple(vals.into())
        }
    }
}

/// Call an interpreted function with argument values; used by dynamic
/// dispatch, go/defer, and host entry points.
pub(crate) fn call_interp_function(
    interp: &Arc<Interp>,
    pfn: &Arc<Function>,
    args: Vec<Value>,
    env: &[Value],
    recovery: Option<PanicCell>,
) -> Result<Value, Panic> {
    let mut fr = alloc_frame(interp, pfn)?;
    fr.recovery = recovery;
    for (i, v) in args.into_iter().enumerate() {
        fr.stack[i] = v;
    }
    for (j, v) in env.iter().enumerate() {
        fr.stack[pfn.narg + j] = v.clone();
    }
    run_frame(interp, &mut fr)?;
    let out = frame_result(interp, &fr);
    release_frame(pfn, fr);
    Ok(out)
}

/// The `Call`-step path: arguments read from the caller's registers, the
/// result written to the destination register.
pub(crate) fn call_function_by_stack(
    interp: &Arc<Interp>,
    caller: &mut Frame,
    pfn: &Arc<Function>,
    ir: Register,
    ia: &[Register],
    env: Option<Arc<Vec<Value>>>,
) -> Result<(), Panic> {
    let mut fr = alloc_frame(interp, pfn)?;
    for (i, r) in ia.iter().enumerate() {
        fr.stack[i] = caller.reg(interp, *r);
    }
    if let Some(env) = &env {
        for (j, v) in env.iter().enumerate() {
            fr.stack[pfn.narg + j] = v.clone();
        }
    }
    run_frame(interp, &mut fr)?;
    if !fr.results.is_empty() {
        let out = frame_result(interp, &fr);
        caller.set_reg(ir, out);
    }
    release_frame(pfn, fr);
    Ok(())
}

pub(crate) fn call_extern_by_stack(
    interp: &Arc<Interp>,
    caller: &mut Frame,
    f: &ExternFn,
    ir: Register,
    ia: &[Register],
) -> Result<(), Panic> {
    let args: Vec<Value> = ia.iter().map(|r| caller.reg(interp, *r)).collect();
    let out = f(interp, &args)?;
    caller.set_reg(ir, out);
    Ok(())
}

/// Call any function value with argument values.
pub(crate) fn call_value(
    interp: &Arc<Interp>,
    fv: &Value,
    args: Vec<Value>,
    recovery: Option<PanicCell>,
) -> Result<Value, Panic> {
    match fv.unnamed() {
        Value::Func(FuncVal::Interp { func, env }) => {
            let env = env.clone();
            call_interp_function(interp, func, args, &env, recovery)
        }
        Value::Func(FuncVal::Extern { f, .. }) => f(interp, &args),
        Value::Nil => Err(Panic::runtime("invalid memory address or nil pointer dereference")),
        other => Err(Panic::runtime(format!("call of non-function {}", other.kind_name()))),
    }
}

/// Dispatch on a resolved callee.
pub(crate) fn call_callee(
    interp: &Arc<Interp>,
    callee: &Callee,
    args: Vec<Value>,
    iface_args: &[bool],
) -> Result<Value, Panic> {
    match callee {
        Callee::Value(fv) => call_value(interp, fv, args, None),
        Callee::Builtin(name) => builtins::call_builtin_by_value(interp, name, args, iface_args),
        Callee::Nop => Ok(Value::Nil),
    }
}

/// Spawn a goroutine running `callee`. Panics terminate the process from
/// the goroutine that raised them, as in the source language; they are
/// not propagated to the parent.
pub(crate) fn spawn_goroutine(
    interp: &Arc<Interp>,
    callee: Callee,
    args: Vec<Value>,
    iface_args: Arc<[bool]>,
) {
    interp.goroutines.fetch_add(1, Ordering::SeqCst);
    let itp = interp.clone();
    std::thread::spawn(move || {
        set_goid(NEXT_GOID.fetch_add(1, Ordering::Relaxed));
        match call_callee(&itp, &callee, args, &iface_args) {
            Ok(_) => {
                itp.goroutines.fetch_add(-1, Ordering::SeqCst);
            }
            Err(Panic::Exit(code)) => {
                itp.exited.store(true, Ordering::SeqCst);
                std::process::exit(code);
            }
            Err(p) => {
                eprintln!("panic: {}", panic_message(&p));
                itp.exited.store(true, Ordering::SeqCst);
                std::process::exit(2);
            }
        }
    });
}

fn panic_message(p: &Panic) -> String {
    match p {
        Panic::Target(v) => format_value(v),
        Panic::Runtime(e) => e.to_string(),
        Panic::Plain(s) | Panic::Conversion(s) => s.clone(),
        Panic::Exit(code) => format!("exit {}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goid_is_thread_local() {
        assert_eq!(current_goid(), 1);
        let t = std::thread::spawn(|| {
            set_goid(99);
            current_goid()
        });
        assert_eq!(t.join().unwrap(), 99);
        assert_eq!(current_goid(), 1);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&Panic::Target(Value::from("boom"))), "boom");
        assert_eq!(
            panic_message(&Panic::runtime("index out of range [1]")),
            "runtime error: index out of range [1]"
        );
    }
}
