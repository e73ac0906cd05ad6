//! SSA program model for the sago interpreter.
//!
//! This crate defines the input contract of the interpreter: an interned
//! type store, the SSA instruction set, and the program/function/value
//! tables, plus a builder API for hosts that assemble programs directly.
//! Lowering source text to this form is a separate concern and lives
//! outside the core.

pub mod builder;
pub mod instr;
pub mod program;
pub mod types;

pub use builder::{FuncBuilder, ProgramBuilder};
pub use instr::{BinOp, CallCommon, Instr, SelectState, UnOp, ValueId};
pub use program::{ConstValue, FuncId, Function, Global, GlobalId, Member, Program, ValueDef, ValueInfo};
pub use types::{builtin, BasicKind, ChanDir, Field, Method, Type, TypeData, TypeStore};
