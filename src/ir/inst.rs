//! Instruction encoding: a fixed header plus a variable-length `extra`
//! payload, grounded in the fixed-field-then-list shape of
//! `spirq_core::parse::instr`'s `define_ops!` macro (there generated from
//! SPIR-V binary layout; here hand-declared since instructions are
//! constructed rather than parsed out of a word stream).
use num_derive::{FromPrimitive, ToPrimitive};

use crate::ir::Id;

/// The complete opcode catalogue (spec.md §4.2).
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[non_exhaustive]
pub enum Opcode {
    // Arithmetic.
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Rem,
    Neg,
    // Matrix.
    MatMul,
    MatTranspose,
    // Bitwise.
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Shl,
    Shr,
    ShrLogical,
    // Comparisons.
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Logical.
    LogAnd,
    LogOr,
    LogNot,
    // Composite.
    Construct,
    Extract,
    Insert,
    Shuffle,
    Splat,
    ExtractDyn,
    InsertDyn,
    // Memory.
    Load,
    Store,
    Access,
    ArrayLen,
    // Control.
    Branch,
    BranchCond,
    Switch,
    Phi,
    LoopMerge,
    SelectionMerge,
    Return,
    ReturnVoid,
    Unreachable,
    // Calls.
    Call,
    Builtin,
    // Conversions.
    Convert,
    Bitcast,
    // Textures.
    TexSample,
    TexSampleBias,
    TexSampleLevel,
    TexSampleGrad,
    TexSampleCmp,
    TexSampleCmpLevel,
    TexSampleOffset,
    TexSampleBiasOffset,
    TexSampleLevelOffset,
    TexSampleGradOffset,
    TexSampleCmpOffset,
    TexGather,
    TexGatherCmp,
    TexGatherOffset,
    TexLoad,
    TexStore,
    TexSize,
    TexQueryLod,
    TexQueryLevels,
    TexQuerySamples,
    // Sync.
    Barrier,
    Atomic,
    // Fragment.
    Discard,
}
impl Opcode {
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Branch
                | Opcode::BranchCond
                | Opcode::Switch
                | Opcode::Return
                | Opcode::ReturnVoid
                | Opcode::Unreachable
        )
    }
    pub fn is_void(self) -> bool {
        matches!(
            self,
            Opcode::Store
                | Opcode::Branch
                | Opcode::BranchCond
                | Opcode::Switch
                | Opcode::LoopMerge
                | Opcode::SelectionMerge
                | Opcode::Return
                | Opcode::ReturnVoid
                | Opcode::Unreachable
                | Opcode::TexStore
                | Opcode::Barrier
                | Opcode::Discard
        )
    }
}

/// Closed enumeration of math/bit/derivative/pack/unpack/subgroup
/// intrinsics, carried via `Opcode::Builtin`'s `operands[0]` selector.
/// `FromPrimitive`/`ToPrimitive` round-trip it through that `u32` slot
/// without an unsafe transmute.
#[derive(PartialEq, Eq, Clone, Copy, Debug, FromPrimitive, ToPrimitive)]
#[non_exhaustive]
pub enum BuiltinFn {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sqrt,
    InverseSqrt,
    Pow,
    Exp,
    Exp2,
    Log,
    Log2,
    Abs,
    Sign,
    Floor,
    Ceil,
    Trunc,
    Round,
    Fract,
    Min,
    Max,
    Clamp,
    Mix,
    Step,
    SmoothStep,
    Dot,
    Cross,
    Length,
    Distance,
    Normalize,
    Reflect,
    Refract,
    Determinant,
    Inverse,
    Transpose,
    Dpdx,
    Dpdy,
    Fwidth,
    PackSnorm4x8,
    UnpackSnorm4x8,
    PackUnorm4x8,
    UnpackUnorm4x8,
    PackHalf2x16,
    UnpackHalf2x16,
    CountOneBits,
    ReverseBits,
    FindLsb,
    FindMsb,
    IsNan,
    IsInf,
    All,
    Any,
    Select,
    SubgroupBallot,
    SubgroupBroadcast,
}
impl BuiltinFn {
    pub fn to_selector(self) -> Id {
        num_traits::ToPrimitive::to_u32(&self).expect("BuiltinFn fits in u32")
    }
    pub fn from_selector(selector: Id) -> Option<Self> {
        num_traits::FromPrimitive::from_u32(selector)
    }
}

/// Fixed instruction header plus variable-length payload (spec.md §3
/// "Instruction").
#[derive(Clone, Debug)]
pub struct Instruction {
    pub opcode: Opcode,
    pub result: Option<Id>,
    pub result_type: Option<Id>,
    pub operands: Vec<Id>,
    pub extra: Vec<Id>,
}
impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Instruction {
            opcode,
            result: None,
            result_type: None,
            operands: Vec::new(),
            extra: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Block {
    pub id: Id,
    pub name: Option<String>,
    pub insts: Vec<Instruction>,
}
impl Block {
    pub fn terminator(&self) -> Option<&Instruction> {
        self.insts.last().filter(|i| i.opcode.is_terminator())
    }
}
