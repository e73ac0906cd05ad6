//! Host-facing context: interpreter options, overrides, output capture,
//! and the run entry points.

use std::io::Write;
use std::ops::BitOr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use sago_ssa::program::Member;
use sago_ssa::types::TypeStore;
use sago_ssa::Program;

use crate::error::Error;
use crate::interp::Interp;
use crate::registry::{ExternFn, Package, Registry};
use crate::value::Value;

/// A bitmask of interpreter options.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Mode(u32);

impl Mode {
    pub const NONE: Mode = Mode(0);
    /// Disable recover() in target programs.
    pub const DISABLE_RECOVER: Mode = Mode(1 << 0);
    /// Disable custom-builtin dispatch.
    pub const DISABLE_CUSTOM_BUILTIN: Mode = Mode(1 << 1);
    /// Print installed packages at interpreter construction.
    pub const DUMP_PACKAGES: Mode = Mode(1 << 2);
    /// Print the SSA instruction stream at interpreter construction.
    pub const DUMP_INSTR: Mode = Mode(1 << 3);
    /// Print a trace of instructions as they are interpreted.
    pub const TRACING: Mode = Mode(1 << 4);
    /// Allow builtin print for any type (structs, arrays).
    pub const ENABLE_PRINT_ANY: Mode = Mode(1 << 5);

    #[inline]
    pub fn contains(self, other: Mode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Mode {
    type Output = Mode;

    fn bitor(self, rhs: Mode) -> Mode {
        Mode(self.0 | rhs.0)
    }
}

/// Debug-callback payload for `DebugRef` instructions.
pub struct DebugInfo {
    pub func: String,
    pub name: String,
    pub value: Value,
}

pub type DebugFn = Arc<dyn Fn(&DebugInfo) + Send + Sync>;

/// A captured-output buffer for print/println.
pub type OutputBuffer = Arc<Mutex<Vec<u8>>>;

/// Shared host configuration for interpreter runs. One context can drive
/// many programs; each run builds a fresh [`Interp`].
pub struct Context {
    mode: Mode,
    store: Arc<TypeStore>,
    registry: Registry,
    overrides: RwLock<HashMap<String, ExternFn>>,
    custom_builtins: RwLock<HashMap<String, ExternFn>>,
    output: RwLock<Option<OutputBuffer>>,
    debug: RwLock<Option<DebugFn>>,
    call_for_pool: AtomicUsize,
}

impl Context {
    pub fn new(mode: Mode) -> Arc<Context> {
        let ctx = Arc::new(Context {
            mode,
            store: Arc::new(TypeStore::new()),
            registry: Registry::new(),
            overrides: RwLock::new(HashMap::new()),
            custom_builtins: RwLock::new(HashMap::new()),
            output: RwLock::new(None),
            debug: RwLock::new(None),
            call_for_pool: AtomicUsize::new(64),
        });
        crate::stdlib::register_std(&ctx);
        ctx
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The type store shared by the registry and programs run under this
    /// context. Program builders must use this store.
    pub fn type_store(&self) -> Arc<TypeStore> {
        self.store.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn register_package(&self, pkg: Package) {
        self.registry.register(pkg);
    }

    /// Intercept a fully-qualified function by name; consulted before the
    /// registry when a declaration-only function resolves.
    pub fn set_override_function<F>(&self, key: &str, f: F)
    where
        F: Fn(&Arc<Interp>, &[Value]) -> Result<Value, crate::error::Panic>
            + Send
            + Sync
            + 'static,
    {
        self.overrides.write().insert(key.to_string(), Arc::new(f));
    }

    pub fn clear_override_function(&self, key: &str) {
        self.overrides.write().remove(key);
    }

    pub(crate) fn find_override(&self, key: &str) -> Option<ExternFn> {
        self.overrides.read().get(key).cloned()
    }

    /// Register a host function dispatchable by bare name from interpreted
    /// code, unless custom builtins are disabled by the mode.
    pub fn register_custom_builtin<F>(&self, name: &str, f: F)
    where
        F: Fn(&Arc<Interp>, &[Value]) -> Result<Value, crate::error::Panic>
            + Send
            + Sync
            + 'static,
    {
        self.custom_builtins.write().insert(name.to_string(), Arc::new(f));
    }

    pub(crate) fn find_custom_builtin(&self, name: &str) -> Option<ExternFn> {
        if self.mode.contains(Mode::DISABLE_CUSTOM_BUILTIN) {
            return None;
        }
        self.custom_builtins.read().get(name).cloned()
    }

    /// Capture builtin print/println output into a host buffer.
    pub fn set_print_output(&self, buf: OutputBuffer) {
        *self.output.write() = Some(buf);
    }

    pub fn clear_print_output(&self) {
        *self.output.write() = None;
    }

    pub(crate) fn write_output(&self, data: &[u8]) {
        if let Some(buf) = self.output.read().as_ref() {
            buf.lock().extend_from_slice(data);
            return;
        }
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = lock.write_all(data);
        let _ = lock.flush();
    }

    pub fn set_debug<F>(&self, f: F)
    where
        F: Fn(&DebugInfo) + Send + Sync + 'static,
    {
        *self.debug.write() = Some(Arc::new(f));
    }

    pub(crate) fn debug_hook(&self) -> Option<DebugFn> {
        self.debug.read().clone()
    }

    /// Least call count before a function's frames come from its pool.
    pub fn set_least_call_for_enable_pool(&self, count: usize) {
        self.call_for_pool.store(count, Ordering::Relaxed);
    }

    pub(crate) fn call_for_pool(&self) -> usize {
        self.call_for_pool.load(Ordering::Relaxed)
    }

    pub fn new_interp(self: &Arc<Self>, program: &Arc<Program>) -> Result<Arc<Interp>, Error> {
        Interp::new(self.clone(), program.clone())
    }

    /// Initialize and run a program's entrypoint. Returns the exit code
    /// and the classified error, if any: 0 normal, 1 missing entrypoint,
    /// 2 setup failure or panic, otherwise an explicit exit request.
    pub fn run_program(self: &Arc<Self>, program: &Arc<Program>, entry: &str) -> (i32, Option<Error>) {
        let interp = match self.new_interp(program) {
            Ok(i) => i,
            Err(err) => return (2, Some(err)),
        };
        if let Err(err) = interp.run_init() {
            return (2, Some(err));
        }
        interp.run_main(entry)
    }

    /// Initialize a program and call one of its functions with host
    /// values.
    pub fn run_func(
        self: &Arc<Self>,
        program: &Arc<Program>,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, Error> {
        let interp = self.new_interp(program)?;
        interp.run_init()?;
        interp.run_func(name, args)
    }

    /// Run every entry-package `Test*` function, reporting `ok`/`FAIL`
    /// with elapsed seconds.
    pub fn test_program(self: &Arc<Self>, program: &Arc<Program>, input: &str) -> Result<(), Error> {
        let start = Instant::now();
        let mut failed = false;

        let interp = match self.new_interp(program) {
            Ok(i) => i,
            Err(err) => {
                println!("FAIL\t{} [setup failed: {}]", input, err);
                return Err(Error::Plain(format!("{} failed", input)));
            }
        };
        if let Err(err) = interp.run_init() {
            println!("FAIL\t{} [{}]", input, err);
            return Err(Error::Plain(format!("{} failed", input)));
        }

        let mut names = program_test_funcs(program);
        names.sort();
        for name in names {
            if let Err(err) = interp.run_func(&name, Vec::new()) {
                println!("--- FAIL: {}", name);
                println!("    {}", err);
                failed = true;
            }
        }

        let sec = start.elapsed().as_secs_f64();
        if failed {
            println!("FAIL\t{} {:.3}s", input, sec);
            Err(Error::Plain(format!("{} failed", input)))
        } else {
            println!("ok\t{} {:.3}s", input, sec);
            Ok(())
        }
    }
}

fn program_test_funcs(program: &Program) -> Vec<String> {
    program
        .funcs()
        .filter(|f| {
            f.pkg == program.pkg_name
                && f.name.starts_with("Test")
                && !f.is_declaration_only()
                && matches!(program.member(&f.name), Some(Member::Func(_)))
        })
        .map(|f| f.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bits() {
        let m = Mode::DISABLE_RECOVER | Mode::TRACING;
        assert!(m.contains(Mode::DISABLE_RECOVER));
        assert!(m.contains(Mode::TRACING));
        assert!(!m.contains(Mode::DUMP_INSTR));
        assert!(Mode::NONE.contains(Mode::NONE));
    }

    #[test]
    fn test_output_capture() {
        let ctx = Context::new(Mode::NONE);
        let buf: OutputBuffer = Arc::new(Mutex::new(Vec::new()));
        ctx.set_print_output(buf.clone());
        ctx.write_output(b"hello\n");
        assert_eq!(&*buf.lock(), b"hello\n");
    }
}
