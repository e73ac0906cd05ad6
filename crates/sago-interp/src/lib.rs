//! SSA-walking interpreter core for the sago language.
//!
//! A fully-built [`sago_ssa::Program`] enters the instruction compiler,
//! which turns each SSA instruction into a pre-bound step closure over a
//! compact register file; the frame engine drives the step loops, with
//! pooled frames, LIFO deferred calls, panic/recover, goroutines and
//! channels.
//!
//! Concurrency note: goroutines are host threads. Channel operations are
//! the only cross-goroutine ordering guarantee; concurrent access to
//! shared boxed values is protected per composite, and no atomicity is
//! promised for whole-value (interface) assignment.

pub mod builtins;
pub mod chan;
pub mod compile;
pub mod context;
pub mod error;
pub mod interp;
pub mod ops;
pub mod registry;
pub mod rtype;
pub mod stdlib;
pub mod value;

pub use context::{Context, DebugInfo, Mode, OutputBuffer};
pub use error::{Error, Panic, Result, RuntimeError};
pub use interp::Interp;
pub use registry::{extern_fn, ExternFn, Package, Registry};
pub use value::{format_value, zero_value, Value};
