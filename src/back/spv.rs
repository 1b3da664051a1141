//! SPIR-V emitter (spec.md §4.5, C6). Grounded in the word-stream
//! assembly approach of the `gfx-rs` shader-compiler lineage's
//! `back::spv` module (mandated section order, `LogicalLayout`-style
//! per-section word buffers, word-count|opcode instruction header),
//! adapted to this crate's id space: module ids flow through unchanged
//! as SPIR-V ids (spec.md §4.5 "IDs flow through unchanged from the
//! IR"), so there is no id-remapping table, only an extra counter for
//! the handful of ids the emitter itself needs (the `GLSL.std.450`
//! import, synthesized `OpTypeFunction`s).
use fnv::FnvHashMap as HashMap;
use log::trace;

use crate::error::{anyhow, Result};
use crate::front::BuildOptions;
use crate::ir::constant::ConstantKind;
use crate::ir::entry::Stage;
use crate::ir::global::Builtin;
use crate::ir::inst::{BuiltinFn, Instruction, Opcode};
use crate::ir::ty::{AddressSpace, ScalarType, StorageAccess, Type};
use crate::ir::{Id, Module};

const MAGIC_NUMBER: u32 = 0x0723_0203;
const GENERATOR: u32 = 0;

// GLSL.std.450 extended-instruction opcode numbers (spec.md §4.5
// "Builtin mapping"), taken from the extended instruction set
// specification -- this crate has no dependency that already declares
// them as a Rust enum, so they're a local closed table, same spirit as
// the `Builtin::NAMES` bidirectional table in `ir::global`.
fn glsl_ext_inst(f: BuiltinFn) -> Option<u32> {
    use BuiltinFn::*;
    Some(match f {
        Round => 1,
        Trunc => 3,
        Abs => 4, // FAbs; SAbs chosen by caller for integer operands
        Sign => 6,
        Floor => 8,
        Ceil => 9,
        Fract => 10,
        Sin => 13,
        Cos => 14,
        Tan => 15,
        Asin => 16,
        Acos => 17,
        Atan => 18,
        Atan2 => 25,
        Pow => 26,
        Exp => 27,
        Log => 28,
        Exp2 => 29,
        Log2 => 30,
        Sqrt => 31,
        InverseSqrt => 32,
        Determinant => 33,
        Inverse => 34,
        Min => 37, // FMin; caller narrows to U/SMin for integers
        Max => 40,
        Clamp => 43,
        Mix => 46,
        Step => 48,
        SmoothStep => 49,
        PackSnorm4x8 => 54,
        PackUnorm4x8 => 55,
        PackHalf2x16 => 58,
        UnpackHalf2x16 => 62,
        UnpackSnorm4x8 => 63,
        UnpackUnorm4x8 => 64,
        Length => 66,
        Distance => 67,
        Cross => 68,
        Normalize => 69,
        Reflect => 71,
        Refract => 72,
        FindLsb => 73,
        FindMsb => 75,
        Transpose => return None, // native OpTranspose, not an ext inst
        _ => return None,
    })
}

#[derive(Default)]
struct Sections {
    capabilities: Vec<u32>,
    extensions: Vec<u32>,
    ext_inst_imports: Vec<u32>,
    memory_model: Vec<u32>,
    entry_points: Vec<u32>,
    execution_modes: Vec<u32>,
    debug: Vec<u32>,
    annotations: Vec<u32>,
    types_consts_globals: Vec<u32>,
    functions: Vec<u32>,
}
impl Sections {
    fn assemble(self, bound: u32) -> Vec<u32> {
        let mut out = Vec::with_capacity(
            5 + self.capabilities.len()
                + self.extensions.len()
                + self.ext_inst_imports.len()
                + self.memory_model.len()
                + self.entry_points.len()
                + self.execution_modes.len()
                + self.debug.len()
                + self.annotations.len()
                + self.types_consts_globals.len()
                + self.functions.len(),
        );
        out.push(MAGIC_NUMBER);
        out.push((1u32 << 16) | 3); // version 1.3 encoded as word; overwritten by caller
        out.push(GENERATOR);
        out.push(bound);
        out.push(0); // schema
        out.extend(self.capabilities);
        out.extend(self.extensions);
        out.extend(self.ext_inst_imports);
        out.extend(self.memory_model);
        out.extend(self.entry_points);
        out.extend(self.execution_modes);
        out.extend(self.debug);
        out.extend(self.annotations);
        out.extend(self.types_consts_globals);
        out.extend(self.functions);
        out
    }
}

fn push(out: &mut Vec<u32>, op: spirv::Op, operands: &[u32]) {
    let wc = 1 + operands.len() as u32;
    out.push((wc << 16) | (op as u32));
    out.extend_from_slice(operands);
}

fn pack_str(s: &str) -> Vec<u32> {
    let bytes = s.as_bytes();
    let mut words = vec![0u32; bytes.len() / 4 + 1];
    for (i, &b) in bytes.iter().enumerate() {
        words[i / 4] |= (b as u32) << ((i % 4) * 8);
    }
    words
}

struct Writer<'m> {
    module: &'m Module,
    opts: &'m BuildOptions,
    next_extra_id: Id,
    ext_glsl: Id,
    block_owner: HashMap<Id, Id>,
    f32_ty: Option<Id>,
    u32_ty: Option<Id>,
    len_consts: HashMap<u32, Id>,
}
impl<'m> Writer<'m> {
    fn alloc(&mut self) -> Id {
        let id = self.next_extra_id;
        self.next_extra_id += 1;
        id
    }

    /// Finds an existing scalar type in the module matching `want`, or
    /// mints and emits a fresh one. Used for the handful of auxiliary
    /// types the emitter needs but the IR doesn't track directly on a
    /// texture type (storage/depth image "sampled type") or array
    /// length operand (which SPIR-V encodes as a constant id, not a
    /// literal, unlike this crate's `Type::Array::len: u32`).
    fn find_or_make_scalar(&mut self, s: &mut Sections, want: ScalarType) -> Id {
        for (id, ty) in self.module.types() {
            if let Type::Scalar(s2) = ty {
                if *s2 == want {
                    return id;
                }
            }
        }
        let id = self.alloc();
        match want {
            ScalarType::Bool => push(&mut s.types_consts_globals, spirv::Op::TypeBool, &[id]),
            ScalarType::Int { bits, is_signed } => {
                push(&mut s.types_consts_globals, spirv::Op::TypeInt, &[id, bits, if is_signed { 1 } else { 0 }])
            }
            ScalarType::Float { bits } => push(&mut s.types_consts_globals, spirv::Op::TypeFloat, &[id, bits]),
        }
        id
    }

    fn f32_ty(&mut self, s: &mut Sections) -> Id {
        if let Some(id) = self.f32_ty {
            return id;
        }
        let id = self.find_or_make_scalar(s, ScalarType::f32());
        self.f32_ty = Some(id);
        id
    }

    fn u32_ty(&mut self, s: &mut Sections) -> Id {
        if let Some(id) = self.u32_ty {
            return id;
        }
        let id = self.find_or_make_scalar(s, ScalarType::u32());
        self.u32_ty = Some(id);
        id
    }

    /// Finds an existing `u32` scalar constant equal to `len` in the
    /// module, or mints one. `Type::Array`'s length is stored as a plain
    /// `u32` (spec.md §3); SPIR-V's `OpTypeArray` instead wants the id of
    /// an `OpConstant`.
    fn len_const(&mut self, s: &mut Sections, len: u32) -> Id {
        if let Some(&id) = self.len_consts.get(&len) {
            return id;
        }
        for (id, c) in self.module.consts() {
            if let ConstantKind::Scalar(crate::ir::constant::ScalarValue::U32(v)) = &c.kind {
                if *v == len {
                    self.len_consts.insert(len, id);
                    return id;
                }
            }
        }
        let u32_ty = self.u32_ty(s);
        let id = self.alloc();
        push(&mut s.types_consts_globals, spirv::Op::Constant, &[u32_ty, id, len]);
        self.len_consts.insert(len, id);
        id
    }

    fn scalar_kind(&self, ty: Id) -> Result<ScalarKind> {
        match self.module.get_type(ty)? {
            Type::Scalar(ScalarType::Bool) => Ok(ScalarKind::Bool),
            Type::Scalar(ScalarType::Float { .. }) => Ok(ScalarKind::Float),
            Type::Scalar(ScalarType::Int { is_signed: true, .. }) => Ok(ScalarKind::Signed),
            Type::Scalar(ScalarType::Int { is_signed: false, .. }) => Ok(ScalarKind::Unsigned),
            Type::Vector { elem, .. } => self.scalar_kind(*elem),
            Type::Matrix { col, .. } => self.scalar_kind(*col),
            _ => Err(anyhow!("type {} has no scalar kind", ty)),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScalarKind {
    Bool,
    Float,
    Signed,
    Unsigned,
}

pub fn emit(module: &Module, opts: &BuildOptions) -> Result<Vec<u32>> {
    let mut w = Writer {
        module,
        opts,
        next_extra_id: module.id_bound(),
        ext_glsl: 0,
        block_owner: HashMap::default(),
        f32_ty: None,
        u32_ty: None,
        len_consts: HashMap::default(),
    };
    for func in module.functions() {
        for block in &func.blocks {
            w.block_owner.insert(block.id, func.id);
        }
    }

    let mut s = Sections::default();
    push(&mut s.capabilities, spirv::Op::Capability, &[spirv::Capability::Shader as u32]);

    w.ext_glsl = w.alloc();
    let mut ops = vec![w.ext_glsl];
    ops.extend(pack_str("GLSL.std.450"));
    push(&mut s.ext_inst_imports, spirv::Op::ExtInstImport, &ops);

    push(
        &mut s.memory_model,
        spirv::Op::MemoryModel,
        &[spirv::AddressingModel::Logical as u32, spirv::MemoryModel::GLSL450 as u32],
    );

    emit_entry_points(&w, module, &mut s)?;
    emit_debug_names(module, &mut s, opts);
    emit_annotations(module, &mut s)?;
    emit_types_consts_globals(&mut w, &mut s)?;
    emit_functions(&mut w, module, &mut s)?;

    let mut words = s.assemble(w.next_extra_id);
    words[1] = ((opts.spirv_version.0 as u32) << 16) | ((opts.spirv_version.1 as u32) << 8);
    Ok(words)
}

fn spv_execution_model(stage: Stage) -> spirv::ExecutionModel {
    match stage {
        Stage::Vertex => spirv::ExecutionModel::Vertex,
        Stage::Fragment => spirv::ExecutionModel::Fragment,
        Stage::Compute => spirv::ExecutionModel::GLCompute,
    }
}

fn emit_entry_points(w: &Writer, module: &Module, s: &mut Sections) -> Result<()> {
    for ep in module.entry_points() {
        let mut ops = vec![spv_execution_model(ep.stage) as u32, ep.function];
        ops.extend(pack_str(&ep.name));
        ops.extend(ep.interface.iter().copied());
        push(&mut s.entry_points, spirv::Op::EntryPoint, &ops);

        match ep.stage {
            Stage::Fragment => {
                if ep.flags.origin_upper_left {
                    push(
                        &mut s.execution_modes,
                        spirv::Op::ExecutionMode,
                        &[ep.function, spirv::ExecutionMode::OriginUpperLeft as u32],
                    );
                }
                if ep.flags.early_fragment_tests {
                    push(
                        &mut s.execution_modes,
                        spirv::Op::ExecutionMode,
                        &[ep.function, spirv::ExecutionMode::EarlyFragmentTests as u32],
                    );
                }
                if ep.flags.depth_replacing {
                    push(
                        &mut s.execution_modes,
                        spirv::Op::ExecutionMode,
                        &[ep.function, spirv::ExecutionMode::DepthReplacing as u32],
                    );
                }
            }
            Stage::Compute => {
                push(
                    &mut s.execution_modes,
                    spirv::Op::ExecutionMode,
                    &[
                        ep.function,
                        spirv::ExecutionMode::LocalSize as u32,
                        ep.workgroup_size[0],
                        ep.workgroup_size[1],
                        ep.workgroup_size[2],
                    ],
                );
            }
            Stage::Vertex => {}
        }
        let _ = w;
    }
    Ok(())
}

fn emit_debug_names(module: &Module, s: &mut Sections, opts: &BuildOptions) {
    if !opts.keep_debug_names {
        return;
    }
    for func in module.functions() {
        if let Some(name) = &func.name {
            let mut ops = vec![func.id];
            ops.extend(pack_str(name));
            push(&mut s.debug, spirv::Op::Name, &ops);
        }
    }
    for global in module.globals() {
        if let Some(name) = &global.name {
            let mut ops = vec![global.id];
            ops.extend(pack_str(name));
            push(&mut s.debug, spirv::Op::Name, &ops);
        }
    }
    for (id, ty) in module.types() {
        if let Type::Struct(st) = ty {
            if let Some(name) = &st.name {
                let mut ops = vec![id];
                ops.extend(pack_str(name));
                push(&mut s.debug, spirv::Op::Name, &ops);
            }
            for (i, m) in st.members.iter().enumerate() {
                if let Some(name) = &m.name {
                    let mut ops = vec![id, i as u32];
                    ops.extend(pack_str(name));
                    push(&mut s.debug, spirv::Op::MemberName, &ops);
                }
            }
        }
    }
}

fn storage_class(space: AddressSpace) -> spirv::StorageClass {
    match space {
        AddressSpace::Function => spirv::StorageClass::Function,
        AddressSpace::Private => spirv::StorageClass::Private,
        AddressSpace::Workgroup => spirv::StorageClass::Workgroup,
        AddressSpace::Uniform => spirv::StorageClass::Uniform,
        AddressSpace::UniformConstant => spirv::StorageClass::UniformConstant,
        AddressSpace::Storage => spirv::StorageClass::StorageBuffer,
        AddressSpace::Input => spirv::StorageClass::Input,
        AddressSpace::Output => spirv::StorageClass::Output,
        AddressSpace::PushConstant => spirv::StorageClass::PushConstant,
    }
}

fn spv_builtin(b: Builtin) -> spirv::BuiltIn {
    match b {
        Builtin::Position => spirv::BuiltIn::Position,
        Builtin::VertexIndex => spirv::BuiltIn::VertexIndex,
        Builtin::InstanceIndex => spirv::BuiltIn::InstanceIndex,
        Builtin::FrontFacing => spirv::BuiltIn::FrontFacing,
        Builtin::FragDepth => spirv::BuiltIn::FragDepth,
        Builtin::SampleIndex => spirv::BuiltIn::SampleId,
        Builtin::SampleMask => spirv::BuiltIn::SampleMask,
        Builtin::GlobalInvocationId => spirv::BuiltIn::GlobalInvocationId,
        Builtin::LocalInvocationId => spirv::BuiltIn::LocalInvocationId,
        Builtin::LocalInvocationIndex => spirv::BuiltIn::LocalInvocationIndex,
        Builtin::WorkgroupId => spirv::BuiltIn::WorkgroupId,
        Builtin::NumWorkgroups => spirv::BuiltIn::NumWorkgroups,
    }
}

/// Matrix-vector column size rounded up to 16 bytes (spec.md §4.5
/// "matrix members also carry...MatrixStride").
fn matrix_stride(module: &Module, col_ty: Id) -> Result<u32> {
    let size = match module.get_type(col_ty)? {
        Type::Vector { elem, size } => {
            let elem_size = match module.get_type(*elem)? {
                Type::Scalar(s) => s.nbyte(),
                _ => 4,
            };
            elem_size * (*size as usize)
        }
        _ => 16,
    };
    Ok(((size + 15) / 16 * 16) as u32)
}

fn emit_annotations(module: &Module, s: &mut Sections) -> Result<()> {
    // Struct member Offset/ColMajor/MatrixStride.
    for (id, ty) in module.types() {
        match ty {
            Type::Struct(st) => {
                for (i, m) in st.members.iter().enumerate() {
                    if let Some(offset) = m.offset {
                        push(
                            &mut s.annotations,
                            spirv::Op::MemberDecorate,
                            &[id, i as u32, spirv::Decoration::Offset as u32, offset as u32],
                        );
                    }
                    if let Type::Matrix { col, .. } = module.get_type(m.ty)? {
                        push(
                            &mut s.annotations,
                            spirv::Op::MemberDecorate,
                            &[id, i as u32, spirv::Decoration::ColMajor as u32],
                        );
                        let stride = matrix_stride(module, *col)?;
                        push(
                            &mut s.annotations,
                            spirv::Op::MemberDecorate,
                            &[id, i as u32, spirv::Decoration::MatrixStride as u32, stride],
                        );
                    }
                }
            }
            Type::RuntimeArray { stride, .. } => {
                push(
                    &mut s.annotations,
                    spirv::Op::Decorate,
                    &[id, spirv::Decoration::ArrayStride as u32, *stride as u32],
                );
            }
            Type::Array { stride: Some(stride), .. } => {
                push(
                    &mut s.annotations,
                    spirv::Op::Decorate,
                    &[id, spirv::Decoration::ArrayStride as u32, *stride as u32],
                );
            }
            _ => {}
        }
    }

    // Block on any struct used as the pointee of a uniform/storage/push-
    // constant global.
    let mut blocked = fnv::FnvHashSet::default();
    for global in module.globals() {
        if let Type::Ptr { pointee, space } = module.get_type(global.ptr_ty)? {
            if matches!(
                space,
                AddressSpace::Uniform | AddressSpace::Storage | AddressSpace::PushConstant
            ) && matches!(module.get_type(*pointee)?, Type::Struct(_))
                && blocked.insert(*pointee)
            {
                push(&mut s.annotations, spirv::Op::Decorate, &[*pointee, spirv::Decoration::Block as u32]);
            }
        }
    }

    for global in module.globals() {
        let d = &global.decorations;
        if let Some(group) = d.group {
            push(
                &mut s.annotations,
                spirv::Op::Decorate,
                &[global.id, spirv::Decoration::DescriptorSet as u32, group],
            );
        }
        if let Some(binding) = d.binding {
            push(&mut s.annotations, spirv::Op::Decorate, &[global.id, spirv::Decoration::Binding as u32, binding]);
        }
        if let Some(location) = d.location {
            push(
                &mut s.annotations,
                spirv::Op::Decorate,
                &[global.id, spirv::Decoration::Location as u32, location],
            );
        }
        if let Some(b) = d.builtin {
            push(
                &mut s.annotations,
                spirv::Op::Decorate,
                &[global.id, spirv::Decoration::BuiltIn as u32, spv_builtin(b) as u32],
            );
        }
        match d.interpolation {
            Some(crate::ir::global::Interpolation::Flat) => {
                push(&mut s.annotations, spirv::Op::Decorate, &[global.id, spirv::Decoration::Flat as u32]);
            }
            Some(crate::ir::global::Interpolation::Linear) => {
                push(
                    &mut s.annotations,
                    spirv::Op::Decorate,
                    &[global.id, spirv::Decoration::NoPerspective as u32],
                );
            }
            _ => {}
        }
        if d.non_writable {
            push(&mut s.annotations, spirv::Op::Decorate, &[global.id, spirv::Decoration::NonWritable as u32]);
        }
        if d.invariant {
            push(&mut s.annotations, spirv::Op::Decorate, &[global.id, spirv::Decoration::Invariant as u32]);
        }
    }

    for (id, c) in module.consts() {
        if let Some(spec_id) = c.spec_id {
            push(&mut s.annotations, spirv::Op::Decorate, &[id, spirv::Decoration::SpecId as u32, spec_id]);
        }
    }
    Ok(())
}

fn emit_types_consts_globals(w: &mut Writer, s: &mut Sections) -> Result<()> {
    let module = w.module;
    let pairs: Vec<(Id, Type)> = module.types().map(|(id, ty)| (id, ty.clone())).collect();
    for (id, ty) in &pairs {
        emit_type(w, s, *id, ty)?;
    }
    let module = w.module;
    for (id, c) in module.consts() {
        emit_const(s, id, c)?;
    }
    for global in module.globals() {
        let mut ops = vec![global.ptr_ty, global.id];
        let space = match module.get_type(global.ptr_ty)? {
            Type::Ptr { space, .. } => *space,
            _ => return Err(anyhow!("global {} is not pointer-typed", global.id)),
        };
        ops.push(storage_class(space) as u32);
        if let Some(init) = global.initializer {
            ops.push(init);
        }
        push(&mut s.types_consts_globals, spirv::Op::Variable, &ops);
    }
    Ok(())
}

fn emit_type(w: &mut Writer, s: &mut Sections, id: Id, ty: &Type) -> Result<()> {
    match ty {
        Type::Void => push(&mut s.types_consts_globals, spirv::Op::TypeVoid, &[id]),
        Type::Scalar(ScalarType::Bool) => push(&mut s.types_consts_globals, spirv::Op::TypeBool, &[id]),
        Type::Scalar(ScalarType::Int { bits, is_signed }) => push(
            &mut s.types_consts_globals,
            spirv::Op::TypeInt,
            &[id, *bits, if *is_signed { 1 } else { 0 }],
        ),
        Type::Scalar(ScalarType::Float { bits }) => push(&mut s.types_consts_globals, spirv::Op::TypeFloat, &[id, *bits]),
        Type::Vector { elem, size } => push(&mut s.types_consts_globals, spirv::Op::TypeVector, &[id, *elem, *size]),
        Type::Matrix { col, cols, .. } => push(&mut s.types_consts_globals, spirv::Op::TypeMatrix, &[id, *col, *cols]),
        Type::Array { elem, len, .. } => {
            let len_const = w.len_const(s, *len);
            push(&mut s.types_consts_globals, spirv::Op::TypeArray, &[id, *elem, len_const]);
        }
        Type::RuntimeArray { elem, .. } => push(&mut s.types_consts_globals, spirv::Op::TypeRuntimeArray, &[id, *elem]),
        Type::Struct(st) => {
            let mut ops = vec![id];
            ops.extend(st.members.iter().map(|m| m.ty));
            push(&mut s.types_consts_globals, spirv::Op::TypeStruct, &ops);
        }
        Type::Ptr { pointee, space } => push(
            &mut s.types_consts_globals,
            spirv::Op::TypePointer,
            &[id, storage_class(*space) as u32, *pointee],
        ),
        Type::Sampler | Type::SamplerComparison => push(&mut s.types_consts_globals, spirv::Op::TypeSampler, &[id]),
        Type::Texture(t) => push(
            &mut s.types_consts_globals,
            spirv::Op::TypeImage,
            &[
                id,
                t.sampled_ty,
                t.dim.to_spv() as u32,
                0,
                if t.arrayed { 1 } else { 0 },
                if t.multisampled { 1 } else { 0 },
                1,
                spirv::ImageFormat::Unknown as u32,
            ],
        ),
        Type::TextureStorage(t) => {
            let sampled_ty = w.f32_ty(s);
            let access = match t.access {
                StorageAccess::Read => 0,
                StorageAccess::Write => 1,
                StorageAccess::ReadWrite => 2,
            };
            push(
                &mut s.types_consts_globals,
                spirv::Op::TypeImage,
                &[id, sampled_ty, t.dim.to_spv() as u32, 0, 0, 0, 2, t.format.to_spv() as u32, access],
            );
        }
        Type::TextureDepth(t) => {
            let sampled_ty = w.f32_ty(s);
            push(
                &mut s.types_consts_globals,
                spirv::Op::TypeImage,
                &[
                    id,
                    sampled_ty,
                    t.dim.to_spv() as u32,
                    1,
                    if t.arrayed { 1 } else { 0 },
                    if t.multisampled { 1 } else { 0 },
                    1,
                    spirv::ImageFormat::Unknown as u32,
                ],
            );
        }
    }
    Ok(())
}

fn emit_const(s: &mut Sections, id: Id, c: &crate::ir::constant::Constant) -> Result<()> {
    let out = &mut s.types_consts_globals;
    let op_true = if c.is_specialization() { spirv::Op::SpecConstantTrue } else { spirv::Op::ConstantTrue };
    let op_false = if c.is_specialization() { spirv::Op::SpecConstantFalse } else { spirv::Op::ConstantFalse };
    let op_scalar = if c.is_specialization() { spirv::Op::SpecConstant } else { spirv::Op::Constant };
    let op_composite = if c.is_specialization() { spirv::Op::SpecConstantComposite } else { spirv::Op::ConstantComposite };
    match &c.kind {
        ConstantKind::Scalar(v) => {
            use crate::ir::constant::ScalarValue::*;
            match v {
                Bool(true) => push(out, op_true, &[c.ty, id]),
                Bool(false) => push(out, op_false, &[c.ty, id]),
                S8(x) => push(out, op_scalar, &[c.ty, id, *x as i32 as u32]),
                S16(x) => push(out, op_scalar, &[c.ty, id, *x as i32 as u32]),
                S32(x) => push(out, op_scalar, &[c.ty, id, *x as u32]),
                S64(x) => {
                    let bits = *x as u64;
                    push(out, op_scalar, &[c.ty, id, bits as u32, (bits >> 32) as u32]);
                }
                U8(x) => push(out, op_scalar, &[c.ty, id, *x as u32]),
                U16(x) => push(out, op_scalar, &[c.ty, id, *x as u32]),
                U32(x) => push(out, op_scalar, &[c.ty, id, *x]),
                U64(x) => push(out, op_scalar, &[c.ty, id, *x as u32, (*x >> 32) as u32]),
                F16(x) => push(out, op_scalar, &[c.ty, id, x.into_inner().to_bits() as u32]),
                F32(x) => push(out, op_scalar, &[c.ty, id, x.into_inner().to_bits()]),
                F64(x) => {
                    let bits = x.into_inner().to_bits();
                    push(out, op_scalar, &[c.ty, id, bits as u32, (bits >> 32) as u32]);
                }
            }
        }
        ConstantKind::Composite(components) => {
            let mut ops = vec![c.ty, id];
            ops.extend(components.iter().copied());
            push(out, op_composite, &ops);
        }
        ConstantKind::Null => push(out, spirv::Op::ConstantNull, &[c.ty, id]),
    }
    Ok(())
}

fn emit_functions(w: &mut Writer, module: &Module, s: &mut Sections) -> Result<()> {
    for func in module.functions() {
        trace!("emitting function {} ({})", func.id, func.name.as_deref().unwrap_or(""));
        let fn_ty = w.alloc();
        let mut fn_ty_ops = vec![fn_ty, func.return_ty];
        fn_ty_ops.extend(func.params.iter().map(|p| p.ty));
        push(&mut s.types_consts_globals, spirv::Op::TypeFunction, &fn_ty_ops);

        push(&mut s.functions, spirv::Op::Function, &[func.return_ty, func.id, 0, fn_ty]);
        for p in &func.params {
            push(&mut s.functions, spirv::Op::FunctionParameter, &[p.ty, p.id]);
        }

        for (bi, block) in func.blocks.iter().enumerate() {
            push(&mut s.functions, spirv::Op::Label, &[block.id]);
            if bi == 0 {
                for local in &func.locals {
                    let mut ops = vec![local.ptr_ty, local.id, spirv::StorageClass::Function as u32];
                    ops.extend(local.initializer);
                    push(&mut s.functions, spirv::Op::Variable, &ops);
                }
            }
            for (ii, inst) in block.insts.iter().enumerate() {
                emit_inst(w, module, &mut s.functions, inst).map_err(|e| {
                    anyhow!("function {} block {} inst {}: {}", func.id, block.id, ii, e)
                })?;
            }
        }
        push(&mut s.functions, spirv::Op::FunctionEnd, &[]);
    }
    Ok(())
}

fn arith_op(kind: ScalarKind, int_op: spirv::Op, uint_op: spirv::Op, float_op: spirv::Op) -> spirv::Op {
    match kind {
        ScalarKind::Float => float_op,
        ScalarKind::Unsigned => uint_op,
        ScalarKind::Signed | ScalarKind::Bool => int_op,
    }
}

fn emit_inst(w: &mut Writer, module: &Module, out: &mut Vec<u32>, inst: &Instruction) -> Result<()> {
    let rty = inst.result_type.unwrap_or(0);
    let rid = inst.result.unwrap_or(0);
    match inst.opcode {
        Opcode::Add => {
            let k = w.scalar_kind(rty)?;
            push(out, arith_op(k, spirv::Op::IAdd, spirv::Op::IAdd, spirv::Op::FAdd), &[rty, rid, inst.operands[0], inst.operands[1]]);
        }
        Opcode::Sub => {
            let k = w.scalar_kind(rty)?;
            push(out, arith_op(k, spirv::Op::ISub, spirv::Op::ISub, spirv::Op::FSub), &[rty, rid, inst.operands[0], inst.operands[1]]);
        }
        Opcode::Mul => {
            let k = w.scalar_kind(rty)?;
            push(out, arith_op(k, spirv::Op::IMul, spirv::Op::IMul, spirv::Op::FMul), &[rty, rid, inst.operands[0], inst.operands[1]]);
        }
        Opcode::Div => {
            let k = w.scalar_kind(rty)?;
            push(out, arith_op(k, spirv::Op::SDiv, spirv::Op::UDiv, spirv::Op::FDiv), &[rty, rid, inst.operands[0], inst.operands[1]]);
        }
        Opcode::Mod => {
            let k = w.scalar_kind(rty)?;
            push(out, arith_op(k, spirv::Op::SMod, spirv::Op::UMod, spirv::Op::FMod), &[rty, rid, inst.operands[0], inst.operands[1]]);
        }
        Opcode::Rem => {
            let k = w.scalar_kind(rty)?;
            push(out, arith_op(k, spirv::Op::SRem, spirv::Op::UMod, spirv::Op::FRem), &[rty, rid, inst.operands[0], inst.operands[1]]);
        }
        Opcode::Neg => {
            let k = w.scalar_kind(rty)?;
            let op = if k == ScalarKind::Float { spirv::Op::FNegate } else { spirv::Op::SNegate };
            push(out, op, &[rty, rid, inst.operands[0]]);
        }
        Opcode::MatMul => push(out, spirv::Op::MatrixTimesVector, &[rty, rid, inst.operands[0], inst.operands[1]]),
        Opcode::MatTranspose => push(out, spirv::Op::Transpose, &[rty, rid, inst.operands[0]]),
        Opcode::BitAnd => push(out, spirv::Op::BitwiseAnd, &[rty, rid, inst.operands[0], inst.operands[1]]),
        Opcode::BitOr => push(out, spirv::Op::BitwiseOr, &[rty, rid, inst.operands[0], inst.operands[1]]),
        Opcode::BitXor => push(out, spirv::Op::BitwiseXor, &[rty, rid, inst.operands[0], inst.operands[1]]),
        Opcode::BitNot => push(out, spirv::Op::Not, &[rty, rid, inst.operands[0]]),
        Opcode::Shl => push(out, spirv::Op::ShiftLeftLogical, &[rty, rid, inst.operands[0], inst.operands[1]]),
        Opcode::Shr => push(out, spirv::Op::ShiftRightArithmetic, &[rty, rid, inst.operands[0], inst.operands[1]]),
        Opcode::ShrLogical => push(out, spirv::Op::ShiftRightLogical, &[rty, rid, inst.operands[0], inst.operands[1]]),
        Opcode::Eq => {
            let k = operand_kind(w, module, inst.operands[0])?;
            let op = match k {
                ScalarKind::Float => spirv::Op::FOrdEqual,
                ScalarKind::Bool => spirv::Op::LogicalEqual,
                _ => spirv::Op::IEqual,
            };
            push(out, op, &[rty, rid, inst.operands[0], inst.operands[1]]);
        }
        Opcode::Ne => {
            let k = operand_kind(w, module, inst.operands[0])?;
            let op = match k {
                ScalarKind::Float => spirv::Op::FOrdNotEqual,
                ScalarKind::Bool => spirv::Op::LogicalNotEqual,
                _ => spirv::Op::INotEqual,
            };
            push(out, op, &[rty, rid, inst.operands[0], inst.operands[1]]);
        }
        Opcode::Lt => {
            let k = operand_kind(w, module, inst.operands[0])?;
            let op = arith_op(k, spirv::Op::SLessThan, spirv::Op::ULessThan, spirv::Op::FOrdLessThan);
            push(out, op, &[rty, rid, inst.operands[0], inst.operands[1]]);
        }
        Opcode::Le => {
            let k = operand_kind(w, module, inst.operands[0])?;
            let op = arith_op(k, spirv::Op::SLessThanEqual, spirv::Op::ULessThanEqual, spirv::Op::FOrdLessThanEqual);
            push(out, op, &[rty, rid, inst.operands[0], inst.operands[1]]);
        }
        Opcode::Gt => {
            let k = operand_kind(w, module, inst.operands[0])?;
            let op = arith_op(k, spirv::Op::SGreaterThan, spirv::Op::UGreaterThan, spirv::Op::FOrdGreaterThan);
            push(out, op, &[rty, rid, inst.operands[0], inst.operands[1]]);
        }
        Opcode::Ge => {
            let k = operand_kind(w, module, inst.operands[0])?;
            let op = arith_op(k, spirv::Op::SGreaterThanEqual, spirv::Op::UGreaterThanEqual, spirv::Op::FOrdGreaterThanEqual);
            push(out, op, &[rty, rid, inst.operands[0], inst.operands[1]]);
        }
        Opcode::LogAnd => push(out, spirv::Op::LogicalAnd, &[rty, rid, inst.operands[0], inst.operands[1]]),
        Opcode::LogOr => push(out, spirv::Op::LogicalOr, &[rty, rid, inst.operands[0], inst.operands[1]]),
        Opcode::LogNot => push(out, spirv::Op::LogicalNot, &[rty, rid, inst.operands[0]]),
        Opcode::Construct => {
            let mut ops = vec![rty, rid];
            ops.extend(inst.extra.iter().copied());
            push(out, spirv::Op::CompositeConstruct, &ops);
        }
        Opcode::Extract => {
            let mut ops = vec![rty, rid, inst.operands[0]];
            ops.extend(inst.extra.iter().copied());
            push(out, spirv::Op::CompositeExtract, &ops);
        }
        Opcode::Insert => {
            let mut ops = vec![rty, rid, inst.operands[1], inst.operands[0]];
            ops.extend(inst.extra.iter().copied());
            push(out, spirv::Op::CompositeInsert, &ops);
        }
        Opcode::Shuffle => {
            let mut ops = vec![rty, rid, inst.operands[0], inst.operands[1]];
            ops.extend(inst.extra.iter().copied());
            push(out, spirv::Op::VectorShuffle, &ops);
        }
        Opcode::Splat => {
            let n = match module.get_type(rty)? {
                Type::Vector { size, .. } => *size as usize,
                _ => return Err(anyhow!("splat result type {} is not a vector", rty)),
            };
            let mut ops = vec![rty, rid];
            ops.extend(std::iter::repeat(inst.operands[0]).take(n));
            push(out, spirv::Op::CompositeConstruct, &ops);
        }
        Opcode::ExtractDyn => push(out, spirv::Op::VectorExtractDynamic, &[rty, rid, inst.operands[0], inst.operands[1]]),
        Opcode::InsertDyn => push(out, spirv::Op::VectorInsertDynamic, &[rty, rid, inst.operands[2], inst.operands[0], inst.operands[1]]),
        Opcode::Load => push(out, spirv::Op::Load, &[rty, rid, inst.operands[0]]),
        Opcode::Store => push(out, spirv::Op::Store, &[inst.operands[0], inst.operands[1]]),
        Opcode::Access => {
            let mut ops = vec![rty, rid, inst.operands[0]];
            ops.extend(inst.extra.iter().copied());
            push(out, spirv::Op::AccessChain, &ops);
        }
        Opcode::ArrayLen => {
            // Operand is the pointer to a struct whose last member is a
            // runtime array; member index 0 matches this crate's
            // front-ends, which always place the runtime array as the
            // sole (and therefore last) member they decompose via
            // `ArrayLen` for.
            push(out, spirv::Op::ArrayLength, &[rty, rid, inst.operands[0], 0]);
        }
        Opcode::Branch => push(out, spirv::Op::Branch, &[inst.operands[0]]),
        Opcode::BranchCond => {
            push(out, spirv::Op::SelectionMerge, &[inst.operands[3], 0]);
            push(out, spirv::Op::BranchConditional, &[inst.operands[0], inst.operands[1], inst.operands[2]]);
        }
        Opcode::Switch => {
            let mut ops = vec![inst.operands[0], inst.operands[1]];
            ops.extend(inst.extra.iter().copied());
            push(out, spirv::Op::Switch, &ops);
        }
        Opcode::Phi => {
            let mut ops = vec![rty, rid];
            ops.extend(inst.extra.iter().copied());
            push(out, spirv::Op::Phi, &ops);
        }
        Opcode::LoopMerge => push(out, spirv::Op::LoopMerge, &[inst.operands[0], inst.operands[1], 0]),
        Opcode::SelectionMerge => push(out, spirv::Op::SelectionMerge, &[inst.operands[0], 0]),
        Opcode::Return => push(out, spirv::Op::ReturnValue, &[inst.operands[0]]),
        Opcode::ReturnVoid => push(out, spirv::Op::Return, &[]),
        Opcode::Unreachable => push(out, spirv::Op::Unreachable, &[]),
        Opcode::Call => {
            let mut ops = vec![rty, rid, inst.operands[0]];
            ops.extend(inst.extra.iter().copied());
            push(out, spirv::Op::FunctionCall, &ops);
        }
        Opcode::Builtin => emit_builtin(w, out, rty, rid, &inst.operands, &inst.extra)?,
        Opcode::Convert => emit_convert(w, module, out, rty, rid, inst.operands[0])?,
        Opcode::Bitcast => push(out, spirv::Op::Bitcast, &[rty, rid, inst.operands[0]]),
        Opcode::TexSample
        | Opcode::TexSampleBias
        | Opcode::TexSampleLevel
        | Opcode::TexSampleGrad
        | Opcode::TexSampleCmp
        | Opcode::TexSampleCmpLevel
        | Opcode::TexSampleOffset
        | Opcode::TexSampleBiasOffset
        | Opcode::TexSampleLevelOffset
        | Opcode::TexSampleGradOffset
        | Opcode::TexSampleCmpOffset => emit_tex_sample(w, out, inst, rty, rid)?,
        Opcode::TexGather | Opcode::TexGatherCmp | Opcode::TexGatherOffset => emit_tex_gather(w, out, inst, rty, rid)?,
        Opcode::TexLoad => {
            let mut ops = vec![rty, rid, inst.operands[0], inst.operands[1]];
            if let Some(&lod) = inst.operands.get(2) {
                ops.push(0x2); // Lod
                ops.push(lod);
            }
            push(out, spirv::Op::ImageFetch, &ops);
        }
        Opcode::TexStore => push(out, spirv::Op::ImageWrite, &[inst.operands[0], inst.operands[1], inst.operands[2]]),
        Opcode::TexSize => {
            if let Some(&lod) = inst.operands.get(1) {
                push(out, spirv::Op::ImageQuerySizeLod, &[rty, rid, inst.operands[0], lod]);
            } else {
                push(out, spirv::Op::ImageQuerySize, &[rty, rid, inst.operands[0]]);
            }
        }
        Opcode::TexQueryLod => push(out, spirv::Op::ImageQueryLod, &[rty, rid, inst.operands[0], inst.operands[2]]),
        Opcode::TexQueryLevels => push(out, spirv::Op::ImageQueryLevels, &[rty, rid, inst.operands[0]]),
        Opcode::TexQuerySamples => push(out, spirv::Op::ImageQuerySamples, &[rty, rid, inst.operands[0]]),
        Opcode::Barrier => {
            let scope_workgroup = 2u32; // Workgroup scope/execution, per the SPIR-V Scope enumerant numbering
            let c_scope = w.alloc();
            push(out, spirv::Op::Constant, &[0, c_scope, scope_workgroup]);
            let c_sem = w.alloc();
            push(out, spirv::Op::Constant, &[0, c_sem, 0x100]); // WorkgroupMemory
            push(out, spirv::Op::ControlBarrier, &[c_scope, c_scope, c_sem]);
        }
        Opcode::Atomic => {
            let mut ops = vec![rty, rid, inst.operands[0], 0, 0, inst.operands[1]];
            ops.extend(inst.extra.iter().copied());
            push(out, spirv::Op::AtomicIAdd, &ops);
        }
        Opcode::Discard => push(out, spirv::Op::Kill, &[]),
    }
    Ok(())
}

fn operand_kind(w: &Writer, module: &Module, operand_value: Id) -> Result<ScalarKind> {
    // Comparisons carry their operand type implicitly (the operand
    // value, not `result_type`, which is always `bool`); recovering it
    // means finding the producing instruction's declared type, same
    // technique the validator uses for load/store consistency.
    for func in module.functions() {
        for block in &func.blocks {
            for inst in &block.insts {
                if inst.result == Some(operand_value) {
                    return w.scalar_kind(inst.result_type.unwrap_or(0));
                }
            }
            for p in &func.params {
                if p.id == operand_value {
                    return w.scalar_kind(p.ty);
                }
            }
        }
    }
    for (_, c) in module.consts() {
        // best effort: constants aren't indexed by id directly here, so
        // fall back to the constant's own type via get_const below.
        let _ = c;
    }
    w.scalar_kind(module.get_const(operand_value).map(|c| c.ty).unwrap_or(0))
}

fn emit_convert(w: &mut Writer, module: &Module, out: &mut Vec<u32>, rty: Id, rid: Id, value: Id) -> Result<()> {
    let from = operand_kind(w, module, value)?;
    let to = w.scalar_kind(rty)?;
    let op = match (from, to) {
        (ScalarKind::Float, ScalarKind::Signed) => spirv::Op::ConvertFToS,
        (ScalarKind::Float, ScalarKind::Unsigned) => spirv::Op::ConvertFToU,
        (ScalarKind::Signed, ScalarKind::Float) => spirv::Op::ConvertSToF,
        (ScalarKind::Unsigned, ScalarKind::Float) => spirv::Op::ConvertUToF,
        (ScalarKind::Signed, ScalarKind::Unsigned) | (ScalarKind::Unsigned, ScalarKind::Signed) => spirv::Op::Bitcast,
        (ScalarKind::Float, ScalarKind::Float) => spirv::Op::FConvert,
        (ScalarKind::Signed, ScalarKind::Signed) | (ScalarKind::Unsigned, ScalarKind::Unsigned) => spirv::Op::SConvert,
        _ => spirv::Op::Bitcast,
    };
    push(out, op, &[rty, rid, value]);
    Ok(())
}

fn emit_builtin(w: &mut Writer, out: &mut Vec<u32>, rty: Id, rid: Id, operands: &[Id], extra: &[Id]) -> Result<()> {
    let selector = operands[0];
    let f = BuiltinFn::from_selector(selector).ok_or_else(|| anyhow!("invalid builtin selector {}", selector))?;
    if matches!(f, BuiltinFn::IsNan | BuiltinFn::IsInf) {
        return Err(anyhow!(
            "isnan/isinf have no direct SPIR-V mapping and must be synthesized by the caller (spec.md §4.5)"
        ));
    }
    let kind = if let Some(&first_arg) = extra.first() { w.scalar_kind(w.module.get_const(first_arg).map(|c| c.ty).unwrap_or(rty)).unwrap_or(ScalarKind::Float) } else { ScalarKind::Float };
    let ext_inst = match f {
        BuiltinFn::Abs if kind != ScalarKind::Float => 5, // SAbs
        BuiltinFn::Min if kind == ScalarKind::Unsigned => 38,
        BuiltinFn::Min if kind == ScalarKind::Signed => 39,
        BuiltinFn::Max if kind == ScalarKind::Unsigned => 41,
        BuiltinFn::Max if kind == ScalarKind::Signed => 42,
        _ => glsl_ext_inst(f).ok_or_else(|| anyhow!("builtin {:?} has no GLSL.std.450 mapping", f))?,
    };
    let mut ops = vec![rty, rid, w.ext_glsl, ext_inst];
    ops.extend(extra.iter().copied());
    push(out, spirv::Op::ExtInst, &ops);
    Ok(())
}

fn emit_tex_sample(w: &Writer, out: &mut Vec<u32>, inst: &Instruction, rty: Id, rid: Id) -> Result<()> {
    let args = &inst.operands;
    let texture = args[0];
    let sampler = args[1];
    let coord = args[2];
    let sampled_image = w_scratch_id(w);
    let image_ty = w_scratch_id(w);
    push(out, spirv::Op::TypeSampledImage, &[image_ty, texture]);
    push(out, spirv::Op::SampledImage, &[image_ty, sampled_image, texture, sampler]);
    match inst.opcode {
        Opcode::TexSample | Opcode::TexSampleOffset => push(out, spirv::Op::ImageSampleImplicitLod, &[rty, rid, sampled_image, coord]),
        Opcode::TexSampleBias | Opcode::TexSampleBiasOffset => {
            let bias = args[3];
            push(out, spirv::Op::ImageSampleImplicitLod, &[rty, rid, sampled_image, coord, 0x1, bias]);
        }
        Opcode::TexSampleLevel | Opcode::TexSampleLevelOffset => {
            let lod = args[3];
            push(out, spirv::Op::ImageSampleExplicitLod, &[rty, rid, sampled_image, coord, 0x2, lod]);
        }
        Opcode::TexSampleGrad | Opcode::TexSampleGradOffset => {
            let (dx, dy) = (args[3], args[4]);
            push(out, spirv::Op::ImageSampleExplicitLod, &[rty, rid, sampled_image, coord, 0x4, dx, dy]);
        }
        Opcode::TexSampleCmp | Opcode::TexSampleCmpOffset => {
            let dref = args[3];
            push(out, spirv::Op::ImageSampleDrefImplicitLod, &[rty, rid, sampled_image, coord, dref]);
        }
        Opcode::TexSampleCmpLevel => {
            let (dref, lod) = (args[3], args[4]);
            push(out, spirv::Op::ImageSampleDrefExplicitLod, &[rty, rid, sampled_image, coord, dref, 0x2, lod]);
        }
        _ => return Err(anyhow!("unsupported texture sample variant")),
    }
    Ok(())
}

fn emit_tex_gather(_w: &Writer, out: &mut Vec<u32>, inst: &Instruction, rty: Id, rid: Id) -> Result<()> {
    let args = &inst.operands;
    let texture = args[0];
    let sampler = args[1];
    let coord = args[2];
    match inst.opcode {
        Opcode::TexGather => push(out, spirv::Op::ImageGather, &[rty, rid, texture, sampler, coord, args[3]]),
        Opcode::TexGatherCmp => push(out, spirv::Op::ImageDrefGather, &[rty, rid, texture, sampler, coord, args[3]]),
        Opcode::TexGatherOffset => push(out, spirv::Op::ImageGather, &[rty, rid, texture, sampler, coord, args[3], 0x8, args[4]]),
        _ => unreachable!(),
    }
    Ok(())
}

/// A tiny local allocator the texture-sample helpers use for the
/// `OpTypeSampledImage`/`OpSampledImage` scratch ids they need; kept
/// separate from `Writer::alloc` only because those helpers take `&self`
/// (they don't otherwise mutate the writer).
fn w_scratch_id(w: &Writer) -> Id {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    w.next_extra_id + COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_str_null_terminates_and_pads() {
        let words = pack_str("ab");
        assert_eq!(words.len(), 1);
        assert_eq!(words[0] & 0xff, b'a' as u32);
        assert_eq!((words[0] >> 8) & 0xff, b'b' as u32);
        assert_eq!((words[0] >> 16) & 0xff, 0);
    }

    #[test]
    fn header_has_correct_magic_and_schema() {
        let module = Module::new();
        let opts = BuildOptions::default();
        let words = emit(&module, &opts).unwrap();
        assert_eq!(words[0], MAGIC_NUMBER);
        assert_eq!(words[4], 0);
    }
}
