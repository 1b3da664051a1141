//! Instruction, block, function and global construction (spec.md §4.2,
//! C3). Grounded in the accessor-macro style of `spirq_core::ty`'s
//! `declr_ty_accessor!`/`declr_ty_downcast!` (here used for a thin
//! façade over `Module` rather than read-only field access), generalized
//! so every call that touches a block names its function and block ids
//! explicitly -- there is no ambient "current block" the way a typical
//! IRBuilder keeps one.
use crate::error::{anyhow, Result};
use crate::ir::constant::{Constant, ConstantKind, ScalarValue};
use crate::ir::entry::{EntryPoint, Stage};
use crate::ir::func::{Function, LocalVar, Param};
use crate::ir::global::{GlobalDecorations, GlobalVariable};
use crate::ir::inst::{Block, BuiltinFn, Instruction, Opcode};
use crate::ir::ty::{
    AddressSpace, ScalarType, StructMember, StructType, TextureDepthType, TextureStorageType,
    TextureType, Type,
};
use crate::ir::{Id, Module};

/// A façade over `Module` that owns no state of its own; every method
/// borrows the module for the duration of the call only, so results
/// returned from previous calls remain valid until the next `&mut`
/// borrow (spec.md §5's "borrow-valid only until the next mutating
/// call").
pub struct Builder<'m> {
    module: &'m mut Module,
}
impl<'m> Builder<'m> {
    pub fn new(module: &'m mut Module) -> Self {
        Builder { module }
    }
    pub fn module(&self) -> &Module {
        self.module
    }
    pub fn module_mut(&mut self) -> &mut Module {
        self.module
    }

    // --- Types -------------------------------------------------------------

    pub fn type_void(&mut self) -> Id {
        self.module.intern_type(Type::Void)
    }
    pub fn type_scalar(&mut self, scalar: ScalarType) -> Id {
        self.module.intern_type(Type::Scalar(scalar))
    }
    pub fn type_vector(&mut self, elem: Id, size: u32) -> Result<Id> {
        if !(2..=4).contains(&size) {
            return Err(anyhow!("vector size must be 2, 3 or 4, got {}", size));
        }
        Ok(self.module.intern_type(Type::Vector { elem, size }))
    }
    pub fn type_matrix(&mut self, col: Id, cols: u32, rows: u32, stride: usize) -> Result<Id> {
        if !(2..=4).contains(&cols) || !(2..=4).contains(&rows) {
            return Err(anyhow!("matrix dimensions must be within 2..=4"));
        }
        Ok(self.module.intern_type(Type::Matrix { col, cols, rows, stride }))
    }
    pub fn type_array(&mut self, elem: Id, len: u32, stride: Option<usize>) -> Id {
        self.module.intern_type(Type::Array { elem, len, stride })
    }
    pub fn type_runtime_array(&mut self, elem: Id, stride: usize) -> Id {
        self.module.intern_type(Type::RuntimeArray { elem, stride })
    }
    /// Structs are never interned: two calls with identical members
    /// produce two distinct ids, matching nominal typing.
    pub fn type_struct(&mut self, name: Option<String>, members: Vec<StructMember>) -> Id {
        self.module.intern_type(Type::Struct(StructType { name, members }))
    }
    pub fn type_ptr(&mut self, pointee: Id, space: AddressSpace) -> Id {
        self.module.intern_type(Type::Ptr { pointee, space })
    }
    pub fn type_sampler(&mut self) -> Id {
        self.module.intern_type(Type::Sampler)
    }
    pub fn type_sampler_comparison(&mut self) -> Id {
        self.module.intern_type(Type::SamplerComparison)
    }
    pub fn type_texture(&mut self, texture: TextureType) -> Id {
        self.module.intern_type(Type::Texture(texture))
    }
    pub fn type_texture_storage(&mut self, texture: TextureStorageType) -> Id {
        self.module.intern_type(Type::TextureStorage(texture))
    }
    pub fn type_texture_depth(&mut self, texture: TextureDepthType) -> Id {
        self.module.intern_type(Type::TextureDepth(texture))
    }

    // --- Constants -----------------------------------------------------------

    pub fn const_scalar(&mut self, ty: Id, value: impl Into<ScalarValue>) -> Id {
        self.module.intern_scalar(ty, value.into())
    }
    pub fn const_composite(&mut self, ty: Id, components: Vec<Id>) -> Result<Id> {
        self.module.insert_const(Constant {
            ty,
            kind: ConstantKind::Composite(components),
            spec_id: None,
        })
    }
    pub fn const_null(&mut self, ty: Id) -> Result<Id> {
        self.module.insert_const(Constant {
            ty,
            kind: ConstantKind::Null,
            spec_id: None,
        })
    }
    /// A specialization constant: an ordinary scalar constant marked with
    /// a stable `spec_id`, never structurally deduplicated with other
    /// constants (spec.md §9 "Specialization constants").
    pub fn const_spec(&mut self, ty: Id, value: impl Into<ScalarValue>, spec_id: u32) -> Result<Id> {
        self.module.insert_const(Constant {
            ty,
            kind: ConstantKind::Scalar(value.into()),
            spec_id: Some(spec_id),
        })
    }

    // --- Globals -------------------------------------------------------------

    pub fn global(
        &mut self,
        name: Option<String>,
        ptr_ty: Id,
        decorations: GlobalDecorations,
        initializer: Option<Id>,
    ) -> Id {
        let id = self.module.alloc_id();
        self.module.insert_global(GlobalVariable {
            id,
            name,
            ptr_ty,
            decorations,
            initializer,
        });
        id
    }

    // --- Functions -------------------------------------------------------------

    pub fn begin_function(
        &mut self,
        name: Option<String>,
        return_ty: Id,
        param_tys: &[(Option<String>, Id)],
    ) -> Id {
        let id = self.module.alloc_id();
        let params = param_tys
            .iter()
            .map(|(name, ty)| Param {
                id: self.module.alloc_id(),
                name: name.clone(),
                ty: *ty,
            })
            .collect::<Vec<_>>();
        self.module.insert_function(Function {
            id,
            name,
            return_ty,
            params,
            locals: Vec::new(),
            blocks: Vec::new(),
        });
        id
    }
    pub fn add_local(
        &mut self,
        func: Id,
        name: Option<String>,
        ptr_ty: Id,
        initializer: Option<Id>,
    ) -> Result<Id> {
        let id = self.module.alloc_id();
        let f = self.module.get_function_mut(func)?;
        f.locals.push(LocalVar {
            id,
            name,
            ptr_ty,
            initializer,
        });
        Ok(id)
    }
    /// Appends a new, empty block to the function, ordered after any
    /// block already present (spec.md §5's "blocks ordered by
    /// creation").
    pub fn append_block(&mut self, func: Id, name: Option<String>) -> Result<Id> {
        let id = self.module.alloc_id();
        self.module.set_block_owner(id, func);
        let f = self.module.get_function_mut(func)?;
        f.blocks.push(Block {
            id,
            name,
            insts: Vec::new(),
        });
        Ok(id)
    }

    fn block_mut(&mut self, func: Id, block: Id) -> Result<&mut Block> {
        self.module
            .get_function_mut(func)?
            .block_mut(block)
            .ok_or_else(|| anyhow!("block {} not found in function {}", block, func))
    }

    /// Appends an instruction to the named block, rejecting placement
    /// after an existing terminator (spec.md invariant 2).
    fn push(&mut self, func: Id, block: Id, inst: Instruction) -> Result<()> {
        let b = self.block_mut(func, block)?;
        if b.terminator().is_some() {
            return Err(anyhow!(
                "block {} already ends with a terminator; cannot append another instruction",
                block
            ));
        }
        b.insts.push(inst);
        Ok(())
    }

    fn emit_value(
        &mut self,
        func: Id,
        block: Id,
        opcode: Opcode,
        result_type: Id,
        operands: Vec<Id>,
        extra: Vec<Id>,
    ) -> Result<Id> {
        let result = self.module.alloc_id();
        let mut inst = Instruction::new(opcode);
        inst.result = Some(result);
        inst.result_type = Some(result_type);
        inst.operands = operands;
        inst.extra = extra;
        self.push(func, block, inst)?;
        Ok(result)
    }

    fn emit_void(&mut self, func: Id, block: Id, opcode: Opcode, operands: Vec<Id>, extra: Vec<Id>) -> Result<Id> {
        let mut inst = Instruction::new(opcode);
        inst.operands = operands;
        inst.extra = extra;
        self.push(func, block, inst)?;
        Ok(0)
    }

    // --- Arithmetic / bitwise / logical / comparison --------------------------

    fn binary(&mut self, func: Id, block: Id, opcode: Opcode, ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.emit_value(func, block, opcode, ty, vec![lhs, rhs], Vec::new())
    }
    pub fn add(&mut self, func: Id, block: Id, ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::Add, ty, lhs, rhs)
    }
    pub fn sub(&mut self, func: Id, block: Id, ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::Sub, ty, lhs, rhs)
    }
    pub fn mul(&mut self, func: Id, block: Id, ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::Mul, ty, lhs, rhs)
    }
    pub fn div(&mut self, func: Id, block: Id, ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::Div, ty, lhs, rhs)
    }
    pub fn rem(&mut self, func: Id, block: Id, ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::Rem, ty, lhs, rhs)
    }
    pub fn mod_(&mut self, func: Id, block: Id, ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::Mod, ty, lhs, rhs)
    }
    pub fn neg(&mut self, func: Id, block: Id, ty: Id, value: Id) -> Result<Id> {
        self.emit_value(func, block, Opcode::Neg, ty, vec![value], Vec::new())
    }
    pub fn mat_mul(&mut self, func: Id, block: Id, ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::MatMul, ty, lhs, rhs)
    }
    pub fn mat_transpose(&mut self, func: Id, block: Id, ty: Id, value: Id) -> Result<Id> {
        self.emit_value(func, block, Opcode::MatTranspose, ty, vec![value], Vec::new())
    }
    pub fn bit_and(&mut self, func: Id, block: Id, ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::BitAnd, ty, lhs, rhs)
    }
    pub fn bit_or(&mut self, func: Id, block: Id, ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::BitOr, ty, lhs, rhs)
    }
    pub fn bit_xor(&mut self, func: Id, block: Id, ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::BitXor, ty, lhs, rhs)
    }
    pub fn bit_not(&mut self, func: Id, block: Id, ty: Id, value: Id) -> Result<Id> {
        self.emit_value(func, block, Opcode::BitNot, ty, vec![value], Vec::new())
    }
    pub fn shl(&mut self, func: Id, block: Id, ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::Shl, ty, lhs, rhs)
    }
    pub fn shr(&mut self, func: Id, block: Id, ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::Shr, ty, lhs, rhs)
    }
    pub fn shr_logical(&mut self, func: Id, block: Id, ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::ShrLogical, ty, lhs, rhs)
    }
    pub fn eq(&mut self, func: Id, block: Id, bool_ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::Eq, bool_ty, lhs, rhs)
    }
    pub fn ne(&mut self, func: Id, block: Id, bool_ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::Ne, bool_ty, lhs, rhs)
    }
    pub fn lt(&mut self, func: Id, block: Id, bool_ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::Lt, bool_ty, lhs, rhs)
    }
    pub fn le(&mut self, func: Id, block: Id, bool_ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::Le, bool_ty, lhs, rhs)
    }
    pub fn gt(&mut self, func: Id, block: Id, bool_ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::Gt, bool_ty, lhs, rhs)
    }
    pub fn ge(&mut self, func: Id, block: Id, bool_ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::Ge, bool_ty, lhs, rhs)
    }
    pub fn log_and(&mut self, func: Id, block: Id, bool_ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::LogAnd, bool_ty, lhs, rhs)
    }
    pub fn log_or(&mut self, func: Id, block: Id, bool_ty: Id, lhs: Id, rhs: Id) -> Result<Id> {
        self.binary(func, block, Opcode::LogOr, bool_ty, lhs, rhs)
    }
    pub fn log_not(&mut self, func: Id, block: Id, bool_ty: Id, value: Id) -> Result<Id> {
        self.emit_value(func, block, Opcode::LogNot, bool_ty, vec![value], Vec::new())
    }

    // --- Composite -----------------------------------------------------------

    pub fn construct(&mut self, func: Id, block: Id, ty: Id, components: Vec<Id>) -> Result<Id> {
        self.emit_value(func, block, Opcode::Construct, ty, Vec::new(), components)
    }
    pub fn extract(&mut self, func: Id, block: Id, ty: Id, composite: Id, indices: Vec<u32>) -> Result<Id> {
        let extra = indices.into_iter().collect();
        self.emit_value(func, block, Opcode::Extract, ty, vec![composite], extra)
    }
    pub fn insert(
        &mut self,
        func: Id,
        block: Id,
        ty: Id,
        composite: Id,
        value: Id,
        indices: Vec<u32>,
    ) -> Result<Id> {
        let extra = indices.into_iter().collect();
        self.emit_value(func, block, Opcode::Insert, ty, vec![composite, value], extra)
    }
    /// `mask[i]` names the source component (from `lhs` if `< size(lhs)`,
    /// else `rhs`) feeding result component `i` -- a flattened two-vector
    /// shuffle, not a single-vector swizzle.
    pub fn shuffle(&mut self, func: Id, block: Id, ty: Id, lhs: Id, rhs: Id, mask: Vec<u32>) -> Result<Id> {
        self.emit_value(func, block, Opcode::Shuffle, ty, vec![lhs, rhs], mask)
    }
    pub fn splat(&mut self, func: Id, block: Id, ty: Id, scalar: Id) -> Result<Id> {
        self.emit_value(func, block, Opcode::Splat, ty, vec![scalar], Vec::new())
    }
    pub fn extract_dyn(&mut self, func: Id, block: Id, ty: Id, composite: Id, index: Id) -> Result<Id> {
        self.emit_value(func, block, Opcode::ExtractDyn, ty, vec![composite, index], Vec::new())
    }
    pub fn insert_dyn(
        &mut self,
        func: Id,
        block: Id,
        ty: Id,
        composite: Id,
        index: Id,
        value: Id,
    ) -> Result<Id> {
        self.emit_value(func, block, Opcode::InsertDyn, ty, vec![composite, index, value], Vec::new())
    }

    // --- Memory ----------------------------------------------------------------

    pub fn load(&mut self, func: Id, block: Id, ty: Id, ptr: Id) -> Result<Id> {
        self.emit_value(func, block, Opcode::Load, ty, vec![ptr], Vec::new())
    }
    pub fn store(&mut self, func: Id, block: Id, ptr: Id, value: Id) -> Result<Id> {
        self.emit_void(func, block, Opcode::Store, vec![ptr, value], Vec::new())
    }
    /// Produces a derived pointer of type `result_ty`; the caller supplies
    /// the type since the builder does not walk struct layouts itself.
    /// Constant indices are distinguished by emitters via the module's
    /// constant table, not by the builder.
    pub fn access(&mut self, func: Id, block: Id, result_ty: Id, base_ptr: Id, indices: Vec<Id>) -> Result<Id> {
        self.emit_value(func, block, Opcode::Access, result_ty, vec![base_ptr], indices)
    }
    pub fn array_len(&mut self, func: Id, block: Id, u32_ty: Id, runtime_array_ptr: Id) -> Result<Id> {
        self.emit_value(func, block, Opcode::ArrayLen, u32_ty, vec![runtime_array_ptr], Vec::new())
    }

    // --- Control flow ------------------------------------------------------------

    pub fn branch(&mut self, func: Id, block: Id, target: Id) -> Result<Id> {
        self.emit_void(func, block, Opcode::Branch, vec![target], Vec::new())
    }
    /// Sole terminator of a selection's predecessor block (spec.md §4.2
    /// "Structured control flow protocol").
    pub fn branch_cond(
        &mut self,
        func: Id,
        block: Id,
        cond: Id,
        true_blk: Id,
        false_blk: Id,
        merge_blk: Id,
    ) -> Result<Id> {
        self.emit_void(
            func,
            block,
            Opcode::BranchCond,
            vec![cond, true_blk, false_blk, merge_blk],
            Vec::new(),
        )
    }
    pub fn switch(&mut self, func: Id, block: Id, selector: Id, default: Id, cases: Vec<(Id, Id)>) -> Result<Id> {
        let mut extra = Vec::with_capacity(cases.len() * 2);
        for (value, target) in cases {
            extra.push(value);
            extra.push(target);
        }
        self.emit_void(func, block, Opcode::Switch, vec![selector, default], extra)
    }
    /// `incoming` pairs `(value, predecessor_block)`; must be placed
    /// before any non-phi instruction in `block` (spec.md invariant 3).
    pub fn phi(&mut self, func: Id, block: Id, ty: Id, incoming: Vec<(Id, Id)>) -> Result<Id> {
        {
            let b = self.block_mut(func, block)?;
            if b.insts.iter().any(|i| i.opcode != Opcode::Phi) {
                return Err(anyhow!("phi must be placed before any non-phi instruction in block {}", block));
            }
        }
        let mut extra = Vec::with_capacity(incoming.len() * 2);
        for (value, pred) in incoming {
            extra.push(value);
            extra.push(pred);
        }
        self.emit_value(func, block, Opcode::Phi, ty, Vec::new(), extra)
    }
    /// Marker preceding a loop header's outgoing branch; emitters recover
    /// the structured loop region from this pairing alone.
    pub fn loop_merge(&mut self, func: Id, block: Id, merge_blk: Id, continue_blk: Id) -> Result<Id> {
        self.emit_void(func, block, Opcode::LoopMerge, vec![merge_blk, continue_blk], Vec::new())
    }
    pub fn selection_merge(&mut self, func: Id, block: Id, merge_blk: Id) -> Result<Id> {
        self.emit_void(func, block, Opcode::SelectionMerge, vec![merge_blk], Vec::new())
    }
    pub fn return_value(&mut self, func: Id, block: Id, value: Id) -> Result<Id> {
        self.emit_void(func, block, Opcode::Return, vec![value], Vec::new())
    }
    pub fn return_void(&mut self, func: Id, block: Id) -> Result<Id> {
        self.emit_void(func, block, Opcode::ReturnVoid, Vec::new(), Vec::new())
    }
    pub fn unreachable(&mut self, func: Id, block: Id) -> Result<Id> {
        self.emit_void(func, block, Opcode::Unreachable, Vec::new(), Vec::new())
    }

    // --- Calls / builtins --------------------------------------------------------

    pub fn call(&mut self, func: Id, block: Id, ty: Id, callee: Id, args: Vec<Id>) -> Result<Id> {
        self.emit_value(func, block, Opcode::Call, ty, vec![callee], args)
    }
    /// `selector` names the intrinsic; its actual arguments live in
    /// `extra`, not `operands` (spec.md §4.2 "Builtins").
    pub fn builtin(&mut self, func: Id, block: Id, ty: Id, selector: BuiltinFn, args: Vec<Id>) -> Result<Id> {
        self.emit_value(func, block, Opcode::Builtin, ty, vec![selector.to_selector()], args)
    }

    // --- Conversions --------------------------------------------------------------

    pub fn convert(&mut self, func: Id, block: Id, ty: Id, value: Id) -> Result<Id> {
        self.emit_value(func, block, Opcode::Convert, ty, vec![value], Vec::new())
    }
    pub fn bitcast(&mut self, func: Id, block: Id, ty: Id, value: Id) -> Result<Id> {
        self.emit_value(func, block, Opcode::Bitcast, ty, vec![value], Vec::new())
    }

    // --- Textures --------------------------------------------------------------------

    /// Covers the whole sampling matrix (`opcode` selects plain/bias/
    /// level/grad/cmp/offset combinations); `args` carries texture,
    /// sampler, coordinate and whichever bias/level/grad/offset/dref
    /// operands the variant needs, in that order.
    pub fn tex_sample(&mut self, func: Id, block: Id, ty: Id, opcode: Opcode, args: Vec<Id>) -> Result<Id> {
        debug_assert!(matches!(
            opcode,
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
                | Opcode::TexSampleCmpOffset
        ));
        self.emit_value(func, block, opcode, ty, args, Vec::new())
    }
    pub fn tex_gather(&mut self, func: Id, block: Id, ty: Id, opcode: Opcode, args: Vec<Id>) -> Result<Id> {
        debug_assert!(matches!(
            opcode,
            Opcode::TexGather | Opcode::TexGatherCmp | Opcode::TexGatherOffset
        ));
        self.emit_value(func, block, opcode, ty, args, Vec::new())
    }
    pub fn tex_load(&mut self, func: Id, block: Id, ty: Id, texture: Id, coord: Id, lod: Option<Id>) -> Result<Id> {
        let mut operands = vec![texture, coord];
        operands.extend(lod);
        self.emit_value(func, block, Opcode::TexLoad, ty, operands, Vec::new())
    }
    pub fn tex_store(&mut self, func: Id, block: Id, texture: Id, coord: Id, value: Id) -> Result<Id> {
        self.emit_void(func, block, Opcode::TexStore, vec![texture, coord, value], Vec::new())
    }
    pub fn tex_size(&mut self, func: Id, block: Id, ty: Id, texture: Id, lod: Option<Id>) -> Result<Id> {
        let mut operands = vec![texture];
        operands.extend(lod);
        self.emit_value(func, block, Opcode::TexSize, ty, operands, Vec::new())
    }
    pub fn tex_query_lod(&mut self, func: Id, block: Id, ty: Id, texture: Id, sampler: Id, coord: Id) -> Result<Id> {
        self.emit_value(func, block, Opcode::TexQueryLod, ty, vec![texture, sampler, coord], Vec::new())
    }
    pub fn tex_query_levels(&mut self, func: Id, block: Id, ty: Id, texture: Id) -> Result<Id> {
        self.emit_value(func, block, Opcode::TexQueryLevels, ty, vec![texture], Vec::new())
    }
    pub fn tex_query_samples(&mut self, func: Id, block: Id, ty: Id, texture: Id) -> Result<Id> {
        self.emit_value(func, block, Opcode::TexQuerySamples, ty, vec![texture], Vec::new())
    }

    // --- Sync / fragment ---------------------------------------------------------

    pub fn barrier(&mut self, func: Id, block: Id, space: AddressSpace) -> Result<Id> {
        self.emit_void(func, block, Opcode::Barrier, vec![space as u32], Vec::new())
    }
    pub fn atomic(&mut self, func: Id, block: Id, ty: Id, ptr: Id, value: Id, extra: Vec<Id>) -> Result<Id> {
        self.emit_value(func, block, Opcode::Atomic, ty, vec![ptr, value], extra)
    }
    pub fn discard(&mut self, func: Id, block: Id) -> Result<Id> {
        self.emit_void(func, block, Opcode::Discard, Vec::new(), Vec::new())
    }

    // --- Entry points --------------------------------------------------------------

    /// Returns the entry point's index within the module (entry points
    /// are never looked up by the general id space; they're addressed by
    /// position, same as the teacher's `Vec<EntryPoint>` reflection list).
    pub fn entry_point(&mut self, stage: Stage, function: Id, name: impl Into<String>) -> usize {
        let ep = EntryPoint::new(stage, function, name);
        self.module.push_entry_point(ep)
    }
    pub fn set_entry_interface(&mut self, index: usize, interface: Vec<Id>) -> Result<()> {
        let ep = self
            .module
            .entry_point_mut(index)
            .ok_or_else(|| anyhow!("no entry point at index {}", index))?;
        ep.interface = interface;
        Ok(())
    }

    // --- Names -----------------------------------------------------------------------

    pub fn set_name(&mut self, id: Id, name: impl Into<String>) {
        self.module.set_name(id, name)
    }
}
