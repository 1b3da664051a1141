//! Entry points, grounded in `spirq_core::func::ExecutionMode` and the
//! teacher's `ExecutionModel` re-export, generalized to a builder-owned
//! record that names its interface set explicitly rather than recovering
//! it from reflection.
use crate::ir::Id;

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum Stage {
    Vertex,
    Fragment,
    Compute,
}

#[derive(Clone, Debug, Default)]
pub struct EntryPointFlags {
    pub depth_replacing: bool,
    pub origin_upper_left: bool,
    pub early_fragment_tests: bool,
}

#[derive(Clone, Debug)]
pub struct EntryPoint {
    pub stage: Stage,
    pub function: Id,
    pub name: String,
    /// The set of global ids referenced by the entry point's function
    /// (spec.md §3 "Entry point").
    pub interface: Vec<Id>,
    pub workgroup_size: [u32; 3],
    pub flags: EntryPointFlags,
}
impl EntryPoint {
    pub fn new(stage: Stage, function: Id, name: impl Into<String>) -> Self {
        EntryPoint {
            stage,
            function,
            name: name.into(),
            interface: Vec::new(),
            workgroup_size: [1, 1, 1],
            flags: EntryPointFlags::default(),
        }
    }
}
