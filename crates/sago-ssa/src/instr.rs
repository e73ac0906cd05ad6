//! SSA instruction set.
//!
//! One variant per instruction the interpreter executes. Value-defining
//! instructions carry their own `dest` value id; instructions executed only
//! for effect do not. The set mirrors the classic SSA form: explicit basic
//! blocks, phi nodes keyed by predecessor block, and a shared `CallCommon`
//! payload for `Call`/`Go`/`Defer`.

use core::fmt;

use crate::types::Type;

/// A value handle: an index into the program's value table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) u32);

impl ValueId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        ValueId(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Quo,
    Rem,
    And,
    Or,
    Xor,
    AndNot,
    Shl,
    Shr,
    Lss,
    Leq,
    Eql,
    Neq,
    Gtr,
    Geq,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Quo => "/",
            BinOp::Rem => "%",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "^",
            BinOp::AndNot => "&^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Lss => "<",
            BinOp::Leq => "<=",
            BinOp::Eql => "==",
            BinOp::Neq => "!=",
            BinOp::Gtr => ">",
            BinOp::Geq => ">=",
        };
        f.write_str(s)
    }
}

/// Unary operators. `Recv` is the channel receive arrow, `Deref` the
/// pointer load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Recv,
    Neg,
    Deref,
    Not,
    Xor,
}

/// The shared payload of `Call`, `Go` and `Defer`.
///
/// When `method` is set, this is an invoke-mode call: `value` holds the
/// interface receiver and dispatch happens on its dynamic type. Otherwise
/// `value` is the callee (a function, builtin, closure, or function value).
#[derive(Clone, Debug)]
pub struct CallCommon {
    pub value: ValueId,
    pub method: Option<String>,
    pub args: Vec<ValueId>,
    /// Signature type of the callee.
    pub sig: Type,
}

/// One case of a `Select` instruction, in declaration order.
#[derive(Clone, Debug)]
pub struct SelectState {
    pub chan: ValueId,
    /// `Some(v)`: send case sending `v`; `None`: receive case.
    pub send: Option<ValueId>,
}

impl SelectState {
    #[inline]
    pub fn is_recv(&self) -> bool {
        self.send.is_none()
    }
}

/// An SSA instruction.
#[derive(Clone, Debug)]
pub enum Instr {
    /// Allocate a zeroed cell of `ty`; yields `*ty`. The heap variant makes
    /// a fresh cell every execution; the stack variant reuses the frame's
    /// cell, re-zeroing it.
    Alloc { dest: ValueId, ty: Type, heap: bool },
    /// Edge values are tagged with the predecessor block that supplies them.
    Phi { dest: ValueId, edges: Vec<(u32, ValueId)> },
    Call { dest: ValueId, call: CallCommon },
    BinOp { dest: ValueId, op: BinOp, x: ValueId, y: ValueId },
    UnOp { dest: ValueId, op: UnOp, x: ValueId, comma_ok: bool },
    ChangeType { dest: ValueId, x: ValueId },
    Convert { dest: ValueId, x: ValueId },
    ChangeInterface { dest: ValueId, x: ValueId },
    SliceToArrayPointer { dest: ValueId, x: ValueId },
    MakeInterface { dest: ValueId, x: ValueId },
    MakeClosure { dest: ValueId, func: crate::program::FuncId, bindings: Vec<ValueId> },
    MakeMap { dest: ValueId, reserve: Option<ValueId> },
    MakeChan { dest: ValueId, size: ValueId },
    MakeSlice { dest: ValueId, len: ValueId, cap: ValueId },
    Slice {
        dest: ValueId,
        x: ValueId,
        low: Option<ValueId>,
        high: Option<ValueId>,
        max: Option<ValueId>,
    },
    FieldAddr { dest: ValueId, x: ValueId, field: usize },
    Field { dest: ValueId, x: ValueId, field: usize },
    IndexAddr { dest: ValueId, x: ValueId, index: ValueId },
    Index { dest: ValueId, x: ValueId, index: ValueId },
    Lookup { dest: ValueId, x: ValueId, index: ValueId, comma_ok: bool },
    Select { dest: ValueId, states: Vec<SelectState>, blocking: bool },
    Range { dest: ValueId, x: ValueId },
    Next { dest: ValueId, iter: ValueId, is_string: bool },
    TypeAssert { dest: ValueId, x: ValueId, asserted: Type, comma_ok: bool },
    Extract { dest: ValueId, tuple: ValueId, index: usize },

    // Executed for effect.
    Jump { target: u32 },
    If { cond: ValueId, then_block: u32, else_block: u32 },
    Return { results: Vec<ValueId> },
    RunDefers,
    Panic { x: ValueId },
    Go { call: CallCommon },
    Defer { call: CallCommon },
    Send { chan: ValueId, x: ValueId },
    Store { addr: ValueId, val: ValueId },
    MapUpdate { map: ValueId, key: ValueId, value: ValueId },
    /// Debug binding of a named source variable to a value.
    DebugRef { x: ValueId, name: String },
}

impl Instr {
    /// The value this instruction defines, if any.
    pub fn dest(&self) -> Option<ValueId> {
        match self {
            Instr::Alloc { dest, .. }
            | Instr::Phi { dest, .. }
            | Instr::Call { dest, .. }
            | Instr::BinOp { dest, .. }
            | Instr::UnOp { dest, .. }
            | Instr::ChangeType { dest, .. }
            | Instr::Convert { dest, .. }
            | Instr::ChangeInterface { dest, .. }
            | Instr::SliceToArrayPointer { dest, .. }
            | Instr::MakeInterface { dest, .. }
            | Instr::MakeClosure { dest, .. }
            | Instr::MakeMap { dest, .. }
            | Instr::MakeChan { dest, .. }
            | Instr::MakeSlice { dest, .. }
            | Instr::Slice { dest, .. }
            | Instr::FieldAddr { dest, .. }
            | Instr::Field { dest, .. }
            | Instr::IndexAddr { dest, .. }
            | Instr::Index { dest, .. }
            | Instr::Lookup { dest, .. }
            | Instr::Select { dest, .. }
            | Instr::Range { dest, .. }
            | Instr::Next { dest, .. }
            | Instr::TypeAssert { dest, .. }
            | Instr::Extract { dest, .. } => Some(*dest),
            _ => None,
        }
    }

    /// Short mnemonic, used by the instruction dump and tracing modes.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instr::Alloc { heap: true, .. } => "alloc(heap)",
            Instr::Alloc { heap: false, .. } => "alloc",
            Instr::Phi { .. } => "phi",
            Instr::Call { .. } => "call",
            Instr::BinOp { .. } => "binop",
            Instr::UnOp { .. } => "unop",
            Instr::ChangeType { .. } => "changetype",
            Instr::Convert { .. } => "convert",
            Instr::ChangeInterface { .. } => "changeinterface",
            Instr::SliceToArrayPointer { .. } => "slicetoarrayptr",
            Instr::MakeInterface { .. } => "makeinterface",
            Instr::MakeClosure { .. } => "makeclosure",
            Instr::MakeMap { .. } => "makemap",
            Instr::MakeChan { .. } => "makechan",
            Instr::MakeSlice { .. } => "makeslice",
            Instr::Slice { .. } => "slice",
            Instr::FieldAddr { .. } => "fieldaddr",
            Instr::Field { .. } => "field",
            Instr::IndexAddr { .. } => "indexaddr",
            Instr::Index { .. } => "index",
            Instr::Lookup { .. } => "lookup",
            Instr::Select { .. } => "select",
            Instr::Range { .. } => "range",
            Instr::Next { .. } => "next",
            Instr::TypeAssert { .. } => "typeassert",
            Instr::Extract { .. } => "extract",
            Instr::Jump { .. } => "jump",
            Instr::If { .. } => "if",
            Instr::Return { .. } => "return",
            Instr::RunDefers => "rundefers",
            Instr::Panic { .. } => "panic",
            Instr::Go { .. } => "go",
            Instr::Defer { .. } => "defer",
            Instr::Send { .. } => "send",
            Instr::Store { .. } => "store",
            Instr::MapUpdate { .. } => "mapupdate",
            Instr::DebugRef { .. } => "debugref",
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::BinOp { dest, op, x, y } => write!(f, "{} = {} {} {}", dest, x, op, y),
            Instr::Call { dest, call } => {
                let args: Vec<String> = call.args.iter().map(|a| a.to_string()).collect();
                match &call.method {
                    Some(m) => write!(f, "{} = invoke {}.{}({})", dest, call.value, m, args.join(", ")),
                    None => write!(f, "{} = call {}({})", dest, call.value, args.join(", ")),
                }
            }
            Instr::Jump { target } => write!(f, "jump b{}", target),
            Instr::If { cond, then_block, else_block } => {
                write!(f, "if {} b{} b{}", cond, then_block, else_block)
            }
            Instr::Return { results } => {
                let rs: Vec<String> = results.iter().map(|r| r.to_string()).collect();
                write!(f, "return {}", rs.join(", "))
            }
            other => match other.dest() {
                Some(d) => write!(f, "{} = {}", d, other.mnemonic()),
                None => f.write_str(other.mnemonic()),
            },
        }
    }
}
