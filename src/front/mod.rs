//! Shared front-end infrastructure: the lowering contract every dialect
//! adapter upholds against [`crate::ir::builder::Builder`] (spec.md
//! §4.4), plus [`BuildOptions`], the configuration surface every `parse`
//! entry point takes. Grounded in the fluent-builder shape of the
//! teacher's `ReflectConfig`.
pub mod glsl;
pub mod msl;
pub mod wgsl;

use crate::error::Span;
use crate::ir::Id;

/// Configuration accepted by every front-end's `parse` entry point and
/// every back-end's `emit` entry point (spec.md SPEC_FULL §2 "C10").
#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// Target SPIR-V version as `(major, minor)`, consulted by the SPIR-V
    /// emitter for encoding and capability decisions.
    pub spirv_version: (u8, u8),
    /// Keep `OpName`/`OpMemberName`-equivalent debug names when emitting.
    pub keep_debug_names: bool,
    /// Attach a source span to every instruction as it's built. Off by
    /// default to keep emitted output small.
    pub keep_debug_info: bool,
    /// WGSL emitter indent width, in spaces.
    pub wgsl_indent: usize,
    /// Whether the MSL emitter prefixes output with `using namespace
    /// metal;`.
    pub msl_use_namespace: bool,
}
impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            spirv_version: (1, 3),
            keep_debug_names: true,
            keep_debug_info: false,
            wgsl_indent: 4,
            msl_use_namespace: true,
        }
    }
}
impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn spirv_version(mut self, major: u8, minor: u8) -> Self {
        self.spirv_version = (major, minor);
        self
    }
    pub fn keep_debug_names(mut self, keep: bool) -> Self {
        self.keep_debug_names = keep;
        self
    }
    pub fn keep_debug_info(mut self, keep: bool) -> Self {
        self.keep_debug_info = keep;
        self
    }
}

/// The result of lowering a source expression: its value id, its IR type
/// id, and whether the value id names a pointer that still needs an
/// explicit `load` before use (spec.md §4.4 "Typed expression lowering").
#[derive(Clone, Copy, Debug)]
pub struct TypedValue {
    pub value: Id,
    pub ty: Id,
    pub is_pointer: bool,
}
impl TypedValue {
    pub fn rvalue(value: Id, ty: Id) -> Self {
        TypedValue {
            value,
            ty,
            is_pointer: false,
        }
    }
    pub fn pointer(value: Id, ty: Id) -> Self {
        TypedValue {
            value,
            ty,
            is_pointer: true,
        }
    }
}

/// A lexer position, convertible to [`Span`] once line/col are known.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Pos {
    pub line: u32,
    pub col: u32,
}
impl Pos {
    pub fn span(self) -> Span {
        Span::new(self.line, self.col)
    }
}
