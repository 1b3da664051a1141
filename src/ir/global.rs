//! Global variables and their decorations, grounded in
//! `spirq_core::var::{DescriptorType, Variable}` generalized from a
//! read-only reflection record to a builder-constructed entity.
use crate::ir::Id;

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum Builtin {
    Position,
    VertexIndex,
    InstanceIndex,
    FrontFacing,
    FragDepth,
    SampleIndex,
    SampleMask,
    GlobalInvocationId,
    LocalInvocationId,
    LocalInvocationIndex,
    WorkgroupId,
    NumWorkgroups,
}
impl Builtin {
    /// Bidirectional name table shared by every front-end and back-end
    /// (spec.md §4.4's "Common builtin name table").
    pub const NAMES: &'static [(Builtin, &'static str, &'static str)] = &[
        (Builtin::Position, "position", "position"),
        (Builtin::VertexIndex, "vertex_index", "vertex_id"),
        (Builtin::InstanceIndex, "instance_index", "instance_id"),
        (Builtin::FrontFacing, "front_facing", "front_facing"),
        (Builtin::FragDepth, "frag_depth", "frag_depth"),
        (Builtin::SampleIndex, "sample_index", "sample_id"),
        (Builtin::SampleMask, "sample_mask", "sample_mask"),
        (
            Builtin::GlobalInvocationId,
            "global_invocation_id",
            "thread_position_in_grid",
        ),
        (
            Builtin::LocalInvocationId,
            "local_invocation_id",
            "thread_position_in_threadgroup",
        ),
        (
            Builtin::LocalInvocationIndex,
            "local_invocation_index",
            "thread_index_in_threadgroup",
        ),
        (Builtin::WorkgroupId, "workgroup_id", "threadgroup_position_in_grid"),
        (Builtin::NumWorkgroups, "num_workgroups", "threadgroups_per_grid"),
    ];

    pub fn from_wgsl_name(name: &str) -> Option<Builtin> {
        Self::NAMES.iter().find(|(_, n, _)| *n == name).map(|(b, ..)| *b)
    }
    pub fn from_msl_name(name: &str) -> Option<Builtin> {
        Self::NAMES.iter().find(|(_, _, n)| *n == name).map(|(b, ..)| *b)
    }
    pub fn wgsl_name(self) -> &'static str {
        Self::NAMES.iter().find(|(b, ..)| *b == self).unwrap().1
    }
    pub fn msl_name(self) -> &'static str {
        Self::NAMES.iter().find(|(b, ..)| *b == self).unwrap().2
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Interpolation {
    Perspective,
    Linear,
    Flat,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum Sampling {
    #[default]
    Center,
    Centroid,
    Sample,
}

/// Decorations attached to a global variable (spec.md §3 "Global
/// variable").
#[derive(Clone, Debug, Default)]
pub struct GlobalDecorations {
    pub group: Option<u32>,
    pub binding: Option<u32>,
    pub location: Option<u32>,
    pub builtin: Option<Builtin>,
    pub interpolation: Option<Interpolation>,
    pub sampling: Option<Sampling>,
    pub non_writable: bool,
    pub invariant: bool,
}

#[derive(Clone, Debug)]
pub struct GlobalVariable {
    pub id: Id,
    pub name: Option<String>,
    /// Type id of the pointer type this global's address denotes.
    pub ptr_ty: Id,
    pub decorations: GlobalDecorations,
    pub initializer: Option<Id>,
}
