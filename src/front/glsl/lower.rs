//! AST → builder lowering for GLSL (spec.md §4.4), mirrored from
//! `front::wgsl::lower`'s shape: a struct-name table, a module-scope
//! global table, and a stack of function-local scopes. GLSL's `in`/`out`
//! resources are module-scope globals rather than entry-function
//! parameters, and interface blocks project their members into scope
//! either under an instance name or, when absent, directly by member
//! name -- so the global table here carries one more case than WGSL's
//! plain `(id, pointee, space)` triple.
use fnv::FnvHashMap as HashMap;
use log::debug;

use crate::error::{anyhow, Result};
use crate::front::glsl::lexer::IntSuffix;
use crate::front::glsl::parser::{
    BinOp, Decl, Expr, FnDecl, GlobalVarDecl, InterfaceBlockDecl, Param, Stmt, StorageQualifier, StructDecl, TypeExpr, UnOp,
};
use crate::front::{BuildOptions, TypedValue};
use crate::ir::builder::Builder;
use crate::ir::entry::{EntryPointFlags, Stage};
use crate::ir::global::{GlobalDecorations, Interpolation};
use crate::ir::inst::{BuiltinFn, Opcode};
use crate::ir::ty::{AddressSpace, ImageDim, ScalarType, StructMember, TextureDepthType, TextureType};
use crate::ir::{Id, Module};

struct TypeEnv {
    structs: HashMap<String, Id>,
}

/// A name resolvable at module scope: an ordinary global, a member
/// projected out of an unnamed interface block, or a GLSL combined
/// sampler (texture + implicit sampler sharing one binding).
#[derive(Clone, Copy)]
enum GlobalRef {
    Direct(Id, Id, AddressSpace),
    BlockMember { block: Id, member_ty: Id, index: u32, space: AddressSpace },
    CombinedSampler { texture: Id, texture_ty: Id, sampler: Id },
}

#[derive(Clone)]
enum Binding {
    Value(TypedValue),
}

struct FnCtx<'b, 'm> {
    b: Builder<'m>,
    types: &'b TypeEnv,
    globals: &'b HashMap<String, GlobalRef>,
    scopes: Vec<HashMap<String, Binding>>,
    func: Id,
    block: Id,
    interface: Vec<Id>,
}

pub fn lower(decls: &[Decl], stage: Stage, opts: &BuildOptions) -> Result<Module> {
    let mut module = Module::new();
    let mut types = TypeEnv {
        structs: HashMap::default(),
    };
    let mut globals: HashMap<String, GlobalRef> = HashMap::default();
    let mut next_in_location = 0u32;
    let mut next_out_location = 0u32;
    let mut next_binding = 0u32;

    for decl in decls {
        if let Decl::Struct(s) = decl {
            debug!("lowering struct {}", s.name);
            let id = lower_struct(&mut module, &types, s)?;
            types.structs.insert(s.name.clone(), id);
        }
    }
    for decl in decls {
        if let Decl::InterfaceBlock(ib) = decl {
            debug!("lowering interface block {}", ib.block_name);
            lower_interface_block(&mut module, &types, ib, &mut globals, &mut next_binding)?;
        }
    }
    for decl in decls {
        if let Decl::GlobalVar(g) = decl {
            debug!("lowering global {}", g.name);
            lower_global(&mut module, &types, g, &mut globals, &mut next_in_location, &mut next_out_location, &mut next_binding)?;
        }
    }
    for decl in decls {
        if let Decl::Fn(f) = decl {
            debug!("lowering function {}", f.name);
            if f.name == "main" {
                lower_entry_function(&mut module, &types, &globals, opts, f, stage)?;
            } else {
                lower_plain_function(&mut module, &types, &globals, f)?;
            }
        }
    }
    Ok(module)
}

// --- Type resolution -------------------------------------------------------------

fn resolve_scalar(name: &str) -> Option<ScalarType> {
    Some(match name {
        "bool" => ScalarType::Bool,
        "int" => ScalarType::i32(),
        "uint" => ScalarType::u32(),
        "float" => ScalarType::f32(),
        "double" => ScalarType::Float { bits: 64 },
        _ => return None,
    })
}

/// GLSL spells vector element types in the name (`vec`/`ivec`/`uvec`/
/// `bvec`) rather than as a generic argument.
fn vector_info(name: &str) -> Option<(ScalarType, u32)> {
    let (rest, elem) = if let Some(rest) = name.strip_prefix("ivec") {
        (rest, ScalarType::i32())
    } else if let Some(rest) = name.strip_prefix("uvec") {
        (rest, ScalarType::u32())
    } else if let Some(rest) = name.strip_prefix("bvec") {
        (rest, ScalarType::Bool)
    } else if let Some(rest) = name.strip_prefix("vec") {
        (rest, ScalarType::f32())
    } else {
        return None;
    };
    let n: u32 = rest.parse().ok()?;
    if (2..=4).contains(&n) {
        Some((elem, n))
    } else {
        None
    }
}

fn mat_dims(name: &str) -> Option<(u32, u32)> {
    Some(match name {
        "mat2" => (2, 2),
        "mat3" => (3, 3),
        "mat4" => (4, 4),
        "mat2x2" => (2, 2),
        "mat2x3" => (2, 3),
        "mat2x4" => (2, 4),
        "mat3x2" => (3, 2),
        "mat3x3" => (3, 3),
        "mat3x4" => (3, 4),
        "mat4x2" => (4, 2),
        "mat4x3" => (4, 3),
        "mat4x4" => (4, 4),
        _ => return None,
    })
}

/// `(dim, arrayed, is_shadow)` for GLSL's combined sampler type names.
fn sampler_kind(te: &TypeExpr) -> Option<(ImageDim, bool, bool)> {
    match te {
        TypeExpr::Named(name) => Some(match name.as_str() {
            "sampler2D" => (ImageDim::D2, false, false),
            "sampler3D" => (ImageDim::D3, false, false),
            "samplerCube" => (ImageDim::Cube, false, false),
            "sampler2DArray" => (ImageDim::D2, true, false),
            "sampler2DShadow" => (ImageDim::D2, false, true),
            _ => return None,
        }),
        _ => None,
    }
}

/// std140-like alignment/size, matching `front::wgsl::lower::layout`'s
/// rule over GLSL's named-vector/named-matrix spelling.
fn layout(te: &TypeExpr) -> Result<(usize, usize)> {
    match te {
        TypeExpr::Named(name) => {
            if resolve_scalar(name).is_some() {
                return Ok((4, 4));
            }
            if let Some((_, n)) = vector_info(name) {
                let size = match n {
                    2 => 8,
                    _ => 16,
                };
                return Ok((size, size));
            }
            if let Some((cols, rows)) = mat_dims(name) {
                let col_align = match rows {
                    2 => 8,
                    _ => 16,
                };
                return Ok((col_align, col_align * cols as usize));
            }
            Err(anyhow!("cannot lay out unknown named type '{}'", name))
        }
        TypeExpr::Array(elem, len) => {
            let (align, size) = layout(elem)?;
            let stride = round_up(size, 16.max(align));
            let n = len.unwrap_or(1) as usize;
            Ok((stride.max(16), stride * n))
        }
    }
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

fn resolve_type(module: &mut Module, types: &TypeEnv, te: &TypeExpr) -> Result<Id> {
    let mut b = Builder::new(module);
    resolve_type_b(&mut b, types, te)
}

fn resolve_type_b(b: &mut Builder, types: &TypeEnv, te: &TypeExpr) -> Result<Id> {
    match te {
        TypeExpr::Named(name) => {
            if let Some(s) = resolve_scalar(name) {
                return Ok(b.type_scalar(s));
            }
            if let Some((elem, n)) = vector_info(name) {
                let elem_ty = b.type_scalar(elem);
                return b.type_vector(elem_ty, n);
            }
            if let Some((cols, rows)) = mat_dims(name) {
                let elem_ty = b.type_scalar(ScalarType::f32());
                let col_ty = b.type_vector(elem_ty, rows)?;
                let stride = if rows == 2 { 8 } else { 16 };
                return b.type_matrix(col_ty, cols, rows, stride);
            }
            if let Some(&id) = types.structs.get(name) {
                return Ok(id);
            }
            Err(anyhow!("unknown type '{}'", name))
        }
        TypeExpr::Array(elem, len) => {
            let elem_ty = resolve_type_b(b, types, elem)?;
            let (_, size) = layout(te)?;
            let stride = len.map(|n| size / n.max(1) as usize);
            match len {
                Some(n) => Ok(b.type_array(elem_ty, *n, stride)),
                None => Ok(b.type_runtime_array(elem_ty, stride.unwrap_or(size))),
            }
        }
    }
}

fn lower_struct(module: &mut Module, types: &TypeEnv, s: &StructDecl) -> Result<Id> {
    let mut members = Vec::new();
    let mut offset = 0usize;
    for field in &s.fields {
        let (align, size) = layout(&field.ty)?;
        offset = round_up(offset, align);
        let ty = resolve_type(module, types, &field.ty)?;
        members.push(StructMember {
            name: Some(field.name.clone()),
            ty,
            offset: Some(offset),
        });
        offset += size;
    }
    let mut b = Builder::new(module);
    Ok(b.type_struct(Some(s.name.clone()), members))
}

// --- Globals -----------------------------------------------------------------------

fn lower_interface_block(
    module: &mut Module,
    types: &TypeEnv,
    ib: &InterfaceBlockDecl,
    globals: &mut HashMap<String, GlobalRef>,
    next_binding: &mut u32,
) -> Result<()> {
    let mut members = Vec::new();
    let mut offset = 0usize;
    for field in &ib.fields {
        let (align, size) = layout(&field.ty)?;
        offset = round_up(offset, align);
        let ty = resolve_type(module, types, &field.ty)?;
        members.push(StructMember {
            name: Some(field.name.clone()),
            ty,
            offset: Some(offset),
        });
        offset += size;
    }
    let space = match ib.storage {
        StorageQualifier::Buffer => AddressSpace::Storage,
        _ => AddressSpace::Uniform,
    };
    let struct_id = {
        let mut b = Builder::new(module);
        b.type_struct(Some(ib.block_name.clone()), members.clone())
    };
    let ptr_ty = {
        let mut b = Builder::new(module);
        b.type_ptr(struct_id, space)
    };
    let binding = ib.layout.binding.unwrap_or_else(|| {
        let b = *next_binding;
        *next_binding += 1;
        b
    });
    let decorations = GlobalDecorations {
        group: ib.layout.set,
        binding: Some(binding),
        non_writable: matches!(ib.storage, StorageQualifier::Uniform),
        ..Default::default()
    };
    let display_name = ib.instance_name.clone().unwrap_or_else(|| ib.block_name.clone());
    let gid = {
        let mut b = Builder::new(module);
        let id = b.global(Some(display_name.clone()), ptr_ty, decorations, None);
        b.set_name(id, display_name);
        id
    };
    if let Some(instance) = &ib.instance_name {
        globals.insert(instance.clone(), GlobalRef::Direct(gid, struct_id, space));
    } else {
        for (i, field) in ib.fields.iter().enumerate() {
            globals.insert(
                field.name.clone(),
                GlobalRef::BlockMember {
                    block: gid,
                    member_ty: members[i].ty,
                    index: i as u32,
                    space,
                },
            );
        }
    }
    Ok(())
}

fn lower_global(
    module: &mut Module,
    types: &TypeEnv,
    g: &GlobalVarDecl,
    globals: &mut HashMap<String, GlobalRef>,
    next_in_location: &mut u32,
    next_out_location: &mut u32,
    next_binding: &mut u32,
) -> Result<()> {
    match g.storage {
        StorageQualifier::In | StorageQualifier::Out => {
            let space = if g.storage == StorageQualifier::In {
                AddressSpace::Input
            } else {
                AddressSpace::Output
            };
            let pointee = resolve_type(module, types, &g.ty)?;
            let ptr_ty = {
                let mut b = Builder::new(module);
                b.type_ptr(pointee, space)
            };
            let counter = if space == AddressSpace::Input { next_in_location } else { next_out_location };
            let location = g.layout.location.unwrap_or_else(|| {
                let v = *counter;
                *counter += 1;
                v
            });
            let decorations = GlobalDecorations {
                location: Some(location),
                non_writable: space == AddressSpace::Input,
                invariant: g.invariant,
                interpolation: if g.flat { Some(Interpolation::Flat) } else { None },
                ..Default::default()
            };
            let gid = {
                let mut b = Builder::new(module);
                let id = b.global(Some(g.name.clone()), ptr_ty, decorations, None);
                b.set_name(id, g.name.clone());
                id
            };
            globals.insert(g.name.clone(), GlobalRef::Direct(gid, pointee, space));
        }
        StorageQualifier::Uniform => {
            if let Some((dim, arrayed, shadow)) = sampler_kind(&g.ty) {
                lower_combined_sampler(module, g, dim, arrayed, shadow, globals, next_binding)?;
                return Ok(());
            }
            lower_resource_global(module, types, g, AddressSpace::Uniform, globals, next_binding)?;
        }
        StorageQualifier::Buffer => {
            lower_resource_global(module, types, g, AddressSpace::Storage, globals, next_binding)?;
        }
        StorageQualifier::Shared => {
            let pointee = resolve_type(module, types, &g.ty)?;
            let ptr_ty = {
                let mut b = Builder::new(module);
                b.type_ptr(pointee, AddressSpace::Workgroup)
            };
            let gid = {
                let mut b = Builder::new(module);
                let id = b.global(Some(g.name.clone()), ptr_ty, GlobalDecorations::default(), None);
                b.set_name(id, g.name.clone());
                id
            };
            globals.insert(g.name.clone(), GlobalRef::Direct(gid, pointee, AddressSpace::Workgroup));
        }
        StorageQualifier::Const | StorageQualifier::None => {
            // No top-level initializer syntax is accepted by this front-end's
            // parser, so a bare global declaration becomes a private slot a
            // function body can still read and write.
            let pointee = resolve_type(module, types, &g.ty)?;
            let ptr_ty = {
                let mut b = Builder::new(module);
                b.type_ptr(pointee, AddressSpace::Private)
            };
            let gid = {
                let mut b = Builder::new(module);
                let id = b.global(Some(g.name.clone()), ptr_ty, GlobalDecorations::default(), None);
                b.set_name(id, g.name.clone());
                id
            };
            globals.insert(g.name.clone(), GlobalRef::Direct(gid, pointee, AddressSpace::Private));
        }
    }
    Ok(())
}

fn lower_resource_global(
    module: &mut Module,
    types: &TypeEnv,
    g: &GlobalVarDecl,
    space: AddressSpace,
    globals: &mut HashMap<String, GlobalRef>,
    next_binding: &mut u32,
) -> Result<()> {
    let pointee = resolve_type(module, types, &g.ty)?;
    let ptr_ty = {
        let mut b = Builder::new(module);
        b.type_ptr(pointee, space)
    };
    let binding = g.layout.binding.unwrap_or_else(|| {
        let b = *next_binding;
        *next_binding += 1;
        b
    });
    let decorations = GlobalDecorations {
        group: g.layout.set,
        binding: Some(binding),
        non_writable: space == AddressSpace::Uniform,
        ..Default::default()
    };
    let gid = {
        let mut b = Builder::new(module);
        let id = b.global(Some(g.name.clone()), ptr_ty, decorations, None);
        b.set_name(id, g.name.clone());
        id
    };
    globals.insert(g.name.clone(), GlobalRef::Direct(gid, pointee, space));
    Ok(())
}

fn lower_combined_sampler(
    module: &mut Module,
    g: &GlobalVarDecl,
    dim: ImageDim,
    arrayed: bool,
    shadow: bool,
    globals: &mut HashMap<String, GlobalRef>,
    next_binding: &mut u32,
) -> Result<()> {
    let binding = g.layout.binding.unwrap_or_else(|| {
        let b = *next_binding;
        *next_binding += 1;
        b
    });
    let decorations = GlobalDecorations {
        group: g.layout.set,
        binding: Some(binding),
        ..Default::default()
    };
    let (texture_ty, sampler_ty) = {
        let mut b = Builder::new(module);
        if shadow {
            let tex = b.type_texture_depth(TextureDepthType {
                dim,
                arrayed,
                multisampled: false,
            });
            let samp = b.type_sampler_comparison();
            (tex, samp)
        } else {
            let sampled_ty = b.type_scalar(ScalarType::f32());
            let tex = b.type_texture(TextureType {
                dim,
                arrayed,
                multisampled: false,
                sampled_ty,
            });
            let samp = b.type_sampler();
            (tex, samp)
        }
    };
    let (tex_ptr, samp_ptr) = {
        let mut b = Builder::new(module);
        (
            b.type_ptr(texture_ty, AddressSpace::UniformConstant),
            b.type_ptr(sampler_ty, AddressSpace::UniformConstant),
        )
    };
    let (texture_gid, sampler_gid) = {
        let mut b = Builder::new(module);
        let t = b.global(Some(format!("{}_tex", g.name)), tex_ptr, decorations.clone(), None);
        let s = b.global(Some(format!("{}_samp", g.name)), samp_ptr, decorations, None);
        (t, s)
    };
    globals.insert(
        g.name.clone(),
        GlobalRef::CombinedSampler {
            texture: texture_gid,
            texture_ty,
            sampler: sampler_gid,
        },
    );
    Ok(())
}

// --- Functions ---------------------------------------------------------------------

fn lower_plain_function(module: &mut Module, types: &TypeEnv, globals: &HashMap<String, GlobalRef>, f: &FnDecl) -> Result<()> {
    let ret_ty = resolve_type(module, types, &f.ret_ty)?;
    let mut param_tys = Vec::new();
    for p in &f.params {
        param_tys.push((Some(p.name.clone()), resolve_type(module, types, &p.ty)?));
    }
    let func = {
        let mut b = Builder::new(module);
        let id = b.begin_function(Some(f.name.clone()), ret_ty, &param_tys);
        b.set_name(id, f.name.clone());
        id
    };
    let entry_block = {
        let mut b = Builder::new(module);
        b.append_block(func, Some("entry".to_string()))?
    };

    let param_ids: Vec<Id> = module.get_function(func)?.params.iter().map(|p| p.id).collect();
    let mut scope = HashMap::default();
    for (p, id) in f.params.iter().zip(param_ids) {
        let ty = resolve_type(module, types, &p.ty)?;
        scope.insert(p.name.clone(), Binding::Value(TypedValue::rvalue(id, ty)));
    }

    let mut ctx = FnCtx {
        b: Builder::new(module),
        types,
        globals,
        scopes: vec![scope],
        func,
        block: entry_block,
        interface: Vec::new(),
    };
    lower_block(&mut ctx, &f.body)?;
    ensure_terminated(&mut ctx)?;
    Ok(())
}

fn lower_entry_function(
    module: &mut Module,
    types: &TypeEnv,
    globals: &HashMap<String, GlobalRef>,
    _opts: &BuildOptions,
    f: &FnDecl,
    stage: Stage,
) -> Result<()> {
    let void_ty = {
        let mut b = Builder::new(module);
        b.type_void()
    };
    let func = {
        let mut b = Builder::new(module);
        let id = b.begin_function(Some(f.name.clone()), void_ty, &[]);
        b.set_name(id, f.name.clone());
        id
    };
    let entry_block = {
        let mut b = Builder::new(module);
        b.append_block(func, Some("entry".to_string()))?
    };

    let mut ctx = FnCtx {
        b: Builder::new(module),
        types,
        globals,
        scopes: vec![HashMap::default()],
        func,
        block: entry_block,
        interface: Vec::new(),
    };
    lower_block(&mut ctx, &f.body)?;
    ensure_terminated(&mut ctx)?;

    let interface = ctx.interface;
    let mut b = Builder::new(module);
    let ep_index = b.entry_point(stage, func, f.name.clone());
    b.set_entry_interface(ep_index, interface)?;
    if stage == Stage::Fragment {
        let ep = b
            .module_mut()
            .entry_point_mut(ep_index)
            .ok_or_else(|| anyhow!("entry point vanished"))?;
        ep.flags = EntryPointFlags {
            depth_replacing: false,
            origin_upper_left: true,
            early_fragment_tests: false,
        };
    }
    Ok(())
}

// --- Statements ----------------------------------------------------------------------

fn ensure_terminated(ctx: &mut FnCtx) -> Result<()> {
    let needs = ctx
        .b
        .module()
        .get_function(ctx.func)?
        .block(ctx.block)
        .map(|b| b.terminator().is_none())
        .unwrap_or(true);
    if needs {
        ctx.b.return_void(ctx.func, ctx.block)?;
    }
    Ok(())
}

fn lower_block(ctx: &mut FnCtx, stmts: &[Stmt]) -> Result<()> {
    ctx.scopes.push(HashMap::default());
    for stmt in stmts {
        lower_stmt(ctx, stmt)?;
    }
    ctx.scopes.pop();
    Ok(())
}

fn lower_stmt(ctx: &mut FnCtx, stmt: &Stmt) -> Result<()> {
    match stmt {
        Stmt::Let(name, ty, expr) => {
            let pointee = resolve_type(ctx.b.module_mut(), ctx.types, ty)?;
            let ptr_ty = ctx.b.type_ptr(pointee, AddressSpace::Function);
            let local = ctx.b.add_local(ctx.func, Some(name.clone()), ptr_ty, None)?;
            let value = lower_rvalue(ctx, expr)?;
            ctx.b.store(ctx.func, ctx.block, local, value.value)?;
            ctx.scopes
                .last_mut()
                .unwrap()
                .insert(name.clone(), Binding::Value(TypedValue::pointer(local, pointee)));
        }
        Stmt::Assign(lhs, rhs) => {
            let value = lower_rvalue(ctx, rhs)?;
            let ptr = lower_lvalue(ctx, lhs)?;
            ctx.b.store(ctx.func, ctx.block, ptr.value, value.value)?;
        }
        Stmt::If(cond, then_body, else_body) => {
            let cond_val = lower_rvalue(ctx, cond)?.value;
            let then_blk = ctx.b.append_block(ctx.func, None)?;
            let else_blk = ctx.b.append_block(ctx.func, None)?;
            let merge_blk = ctx.b.append_block(ctx.func, None)?;
            ctx.b.branch_cond(ctx.func, ctx.block, cond_val, then_blk, else_blk, merge_blk)?;

            ctx.block = then_blk;
            lower_block(ctx, then_body)?;
            if ctx.b.module().get_function(ctx.func)?.block(ctx.block).unwrap().terminator().is_none() {
                ctx.b.branch(ctx.func, ctx.block, merge_blk)?;
            }

            ctx.block = else_blk;
            lower_block(ctx, else_body)?;
            if ctx.b.module().get_function(ctx.func)?.block(ctx.block).unwrap().terminator().is_none() {
                ctx.b.branch(ctx.func, ctx.block, merge_blk)?;
            }

            ctx.block = merge_blk;
        }
        Stmt::While(cond, body) => lower_loop(ctx, None, cond, None, body)?,
        Stmt::For(init, cond, incr, body) => lower_loop(ctx, Some(init), cond, Some(incr), body)?,
        Stmt::Return(value) => {
            if let Some(expr) = value {
                let v = lower_rvalue(ctx, expr)?;
                ctx.b.return_value(ctx.func, ctx.block, v.value)?;
            } else {
                ctx.b.return_void(ctx.func, ctx.block)?;
            }
        }
        Stmt::Discard => {
            ctx.b.discard(ctx.func, ctx.block)?;
        }
        Stmt::Expr(expr) => {
            lower_rvalue(ctx, expr)?;
        }
    }
    Ok(())
}

/// `while`/`for` share one structured-loop shape: `for` just runs its
/// init statement before entering and its increment statement at the end
/// of the continue block, the same desugaring a lowering to structured
/// SPIR-V control flow always needs anyway.
fn lower_loop(ctx: &mut FnCtx, init: Option<&Stmt>, cond: &Expr, incr: Option<&Stmt>, body: &[Stmt]) -> Result<()> {
    ctx.scopes.push(HashMap::default());
    if let Some(init) = init {
        lower_stmt(ctx, init)?;
    }

    let header = ctx.b.append_block(ctx.func, None)?;
    let merge_blk = ctx.b.append_block(ctx.func, None)?;
    let continue_blk = ctx.b.append_block(ctx.func, None)?;
    ctx.b.branch(ctx.func, ctx.block, header)?;

    ctx.block = header;
    ctx.b.loop_merge(ctx.func, header, merge_blk, continue_blk)?;
    let cond_val = lower_rvalue(ctx, cond)?.value;
    let body_blk = ctx.b.append_block(ctx.func, None)?;
    ctx.b.branch_cond(ctx.func, header, cond_val, body_blk, merge_blk, merge_blk)?;

    ctx.block = body_blk;
    lower_block(ctx, body)?;
    if ctx.b.module().get_function(ctx.func)?.block(ctx.block).unwrap().terminator().is_none() {
        ctx.b.branch(ctx.func, ctx.block, continue_blk)?;
    }

    ctx.block = continue_blk;
    if let Some(incr) = incr {
        lower_stmt(ctx, incr)?;
    }
    ctx.b.branch(ctx.func, continue_blk, header)?;
    ctx.block = merge_blk;
    ctx.scopes.pop();
    Ok(())
}

fn lookup(ctx: &FnCtx, name: &str) -> Option<Binding> {
    for scope in ctx.scopes.iter().rev() {
        if let Some(b) = scope.get(name) {
            return Some(b.clone());
        }
    }
    None
}

/// Resolves a module-scope name to its addressable pointer, tracking it
/// as referenced for entry-point interface formation.
fn global_pointer(ctx: &mut FnCtx, name: &str) -> Result<Option<TypedValue>> {
    let gref = match ctx.globals.get(name) {
        Some(g) => *g,
        None => return Ok(None),
    };
    let value = match gref {
        GlobalRef::Direct(gid, pointee, _space) => {
            if !ctx.interface.contains(&gid) {
                ctx.interface.push(gid);
            }
            TypedValue::pointer(gid, pointee)
        }
        GlobalRef::BlockMember { block, member_ty, index, space } => {
            if !ctx.interface.contains(&block) {
                ctx.interface.push(block);
            }
            let ptr_ty = ctx.b.type_ptr(member_ty, space);
            let u32_ty = ctx.b.type_scalar(ScalarType::u32());
            let idx_const = ctx.b.const_scalar(u32_ty, index);
            let result = ctx.b.access(ctx.func, ctx.block, ptr_ty, block, vec![idx_const])?;
            TypedValue::pointer(result, member_ty)
        }
        GlobalRef::CombinedSampler { texture, .. } => {
            if !ctx.interface.contains(&texture) {
                ctx.interface.push(texture);
            }
            return Err(anyhow!("'{}' names a sampler, which is not addressable", name));
        }
    };
    Ok(Some(value))
}

fn lower_lvalue(ctx: &mut FnCtx, expr: &Expr) -> Result<TypedValue> {
    match expr {
        Expr::Ident(name) => {
            if let Some(Binding::Value(v)) = lookup(ctx, name) {
                if v.is_pointer {
                    return Ok(v);
                }
                return Err(anyhow!("'{}' is not assignable", name));
            }
            if let Some(v) = global_pointer(ctx, name)? {
                return Ok(v);
            }
            Err(anyhow!("unknown identifier '{}'", name))
        }
        Expr::Member(base, field) => {
            let base_ptr = lower_lvalue(ctx, base)?;
            access_member(ctx, base_ptr, field)
        }
        Expr::Index(base, index) => {
            let base_ptr = lower_lvalue(ctx, base)?;
            let index_val = lower_rvalue(ctx, index)?;
            access_index(ctx, base_ptr, index_val.value)
        }
        _ => Err(anyhow!("expression is not an lvalue")),
    }
}

fn access_member(ctx: &mut FnCtx, base: TypedValue, field: &str) -> Result<TypedValue> {
    let pointee_ty = match ctx.b.module().get_type(base.ty)? {
        crate::ir::ty::Type::Ptr { pointee, .. } => *pointee,
        _ => return Err(anyhow!("member access on a non-pointer")),
    };
    let space = match ctx.b.module().get_type(base.ty)? {
        crate::ir::ty::Type::Ptr { space, .. } => *space,
        _ => unreachable!(),
    };
    let members = match ctx.b.module().get_type(pointee_ty)? {
        crate::ir::ty::Type::Struct(s) => s.members.clone(),
        crate::ir::ty::Type::Vector { elem, .. } => {
            let idx = swizzle_index(field)?;
            let member_ty = *elem;
            let ptr_ty = ctx.b.type_ptr(member_ty, space);
            let u32_ty = ctx.b.type_scalar(ScalarType::u32());
            let idx_const = ctx.b.const_scalar(u32_ty, idx);
            let result = ctx.b.access(ctx.func, ctx.block, ptr_ty, base.value, vec![idx_const])?;
            return Ok(TypedValue::pointer(result, member_ty));
        }
        _ => return Err(anyhow!("member access on a non-struct, non-vector type")),
    };
    let (index, member) = members
        .iter()
        .enumerate()
        .find(|(_, m)| m.name.as_deref() == Some(field))
        .ok_or_else(|| anyhow!("no member '{}'", field))?;
    let ptr_ty = ctx.b.type_ptr(member.ty, space);
    let u32_ty = ctx.b.type_scalar(ScalarType::u32());
    let idx_const = ctx.b.const_scalar(u32_ty, index as u32);
    let result = ctx.b.access(ctx.func, ctx.block, ptr_ty, base.value, vec![idx_const])?;
    Ok(TypedValue::pointer(result, member.ty))
}

fn swizzle_index(field: &str) -> Result<u32> {
    match field {
        "x" | "r" => Ok(0),
        "y" | "g" => Ok(1),
        "z" | "b" => Ok(2),
        "w" | "a" => Ok(3),
        _ => Err(anyhow!("multi-component swizzle '{}' is not valid as an lvalue", field)),
    }
}

fn access_index(ctx: &mut FnCtx, base: TypedValue, index: Id) -> Result<TypedValue> {
    let (elem_ty, space) = match ctx.b.module().get_type(base.ty)? {
        crate::ir::ty::Type::Ptr { pointee, space } => {
            let elem = match ctx.b.module().get_type(*pointee)? {
                crate::ir::ty::Type::Array { elem, .. } => *elem,
                crate::ir::ty::Type::RuntimeArray { elem, .. } => *elem,
                crate::ir::ty::Type::Vector { elem, .. } => *elem,
                crate::ir::ty::Type::Matrix { col, .. } => *col,
                _ => return Err(anyhow!("indexing a non-indexable pointee type")),
            };
            (elem, *space)
        }
        _ => return Err(anyhow!("index access on a non-pointer")),
    };
    let ptr_ty = ctx.b.type_ptr(elem_ty, space);
    let result = ctx.b.access(ctx.func, ctx.block, ptr_ty, base.value, vec![index])?;
    Ok(TypedValue::pointer(result, elem_ty))
}

fn lower_rvalue(ctx: &mut FnCtx, expr: &Expr) -> Result<TypedValue> {
    match expr {
        Expr::IntLit(v, suffix) => {
            let is_unsigned = matches!(suffix, IntSuffix::U);
            let ty = ctx.b.type_scalar(if is_unsigned { ScalarType::u32() } else { ScalarType::i32() });
            let id = if is_unsigned {
                ctx.b.const_scalar(ty, *v as u32)
            } else {
                ctx.b.const_scalar(ty, *v as i32)
            };
            Ok(TypedValue::rvalue(id, ty))
        }
        Expr::FloatLit(v, _suffix) => {
            let ty = ctx.b.type_scalar(ScalarType::f32());
            let id = ctx.b.const_scalar(ty, *v as f32);
            Ok(TypedValue::rvalue(id, ty))
        }
        Expr::BoolLit(v) => {
            let ty = ctx.b.type_scalar(ScalarType::Bool);
            let id = ctx.b.const_scalar(ty, *v);
            Ok(TypedValue::rvalue(id, ty))
        }
        Expr::Ident(name) => {
            if let Some(Binding::Value(v)) = lookup(ctx, name) {
                if v.is_pointer {
                    let loaded = ctx.b.load(ctx.func, ctx.block, v.ty, v.value)?;
                    return Ok(TypedValue::rvalue(loaded, v.ty));
                }
                return Ok(v);
            }
            if let Some(v) = global_pointer(ctx, name)? {
                let loaded = ctx.b.load(ctx.func, ctx.block, v.ty, v.value)?;
                return Ok(TypedValue::rvalue(loaded, v.ty));
            }
            Err(anyhow!("unknown identifier '{}'", name))
        }
        Expr::Member(base, field) => {
            if field.len() > 1 && field.chars().all(|c| matches!(c, 'x' | 'y' | 'z' | 'w' | 'r' | 'g' | 'b' | 'a')) {
                return lower_swizzle(ctx, base, field);
            }
            let ptr = lower_lvalue(ctx, expr)?;
            let loaded = ctx.b.load(ctx.func, ctx.block, ptr.ty, ptr.value)?;
            Ok(TypedValue::rvalue(loaded, ptr.ty))
        }
        Expr::Index(..) => {
            let ptr = lower_lvalue(ctx, expr)?;
            let loaded = ctx.b.load(ctx.func, ctx.block, ptr.ty, ptr.value)?;
            Ok(TypedValue::rvalue(loaded, ptr.ty))
        }
        Expr::Unary(op, operand) => {
            let v = lower_rvalue(ctx, operand)?;
            let id = match op {
                UnOp::Neg => ctx.b.neg(ctx.func, ctx.block, v.ty, v.value)?,
                UnOp::Not => ctx.b.log_not(ctx.func, ctx.block, v.ty, v.value)?,
                UnOp::BitNot => ctx.b.bit_not(ctx.func, ctx.block, v.ty, v.value)?,
            };
            Ok(TypedValue::rvalue(id, v.ty))
        }
        Expr::Binary(op, lhs, rhs) => lower_binary(ctx, *op, lhs, rhs),
        Expr::Call(callee, args) => lower_call(ctx, callee, args),
    }
}

fn lower_swizzle(ctx: &mut FnCtx, base: &Expr, field: &str) -> Result<TypedValue> {
    let base_val = if matches!(base, Expr::Ident(_)) {
        match lower_lvalue(ctx, base) {
            Ok(ptr) => {
                let loaded = ctx.b.load(ctx.func, ctx.block, ptr.ty, ptr.value)?;
                TypedValue::rvalue(loaded, ptr.ty)
            }
            Err(_) => lower_rvalue(ctx, base)?,
        }
    } else {
        lower_rvalue(ctx, base)?
    };
    let elem_ty = match ctx.b.module().get_type(base_val.ty)? {
        crate::ir::ty::Type::Vector { elem, .. } => *elem,
        _ => return Err(anyhow!("swizzle on a non-vector")),
    };
    let mask = field.chars().map(|c| swizzle_index(&c.to_string())).collect::<Result<Vec<_>>>()?;
    if mask.len() == 1 {
        let idx_const = ctx.b.const_scalar(ctx.b.type_scalar(ScalarType::u32()), mask[0]);
        let result = ctx.b.extract_dyn(ctx.func, ctx.block, elem_ty, base_val.value, idx_const)?;
        return Ok(TypedValue::rvalue(result, elem_ty));
    }
    let result_ty = ctx.b.type_vector(elem_ty, mask.len() as u32)?;
    let result = ctx.b.shuffle(ctx.func, ctx.block, result_ty, base_val.value, base_val.value, mask)?;
    Ok(TypedValue::rvalue(result, result_ty))
}

fn is_float_ty(ctx: &FnCtx, ty: Id) -> bool {
    matches!(ctx.b.module().get_type(ty), Ok(crate::ir::ty::Type::Scalar(s)) if s.is_float())
}

fn balance_scalar_vector(ctx: &mut FnCtx, a: TypedValue, b: TypedValue) -> Result<(TypedValue, TypedValue)> {
    let a_is_vec = matches!(ctx.b.module().get_type(a.ty)?, crate::ir::ty::Type::Vector { .. });
    let b_is_vec = matches!(ctx.b.module().get_type(b.ty)?, crate::ir::ty::Type::Vector { .. });
    if a_is_vec && !b_is_vec {
        let splatted = ctx.b.splat(ctx.func, ctx.block, a.ty, b.value)?;
        return Ok((a, TypedValue::rvalue(splatted, a.ty)));
    }
    if b_is_vec && !a_is_vec {
        let splatted = ctx.b.splat(ctx.func, ctx.block, b.ty, a.value)?;
        return Ok((TypedValue::rvalue(splatted, b.ty), b));
    }
    Ok((a, b))
}

fn lower_binary(ctx: &mut FnCtx, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<TypedValue> {
    let l = lower_rvalue(ctx, lhs)?;
    let r = lower_rvalue(ctx, rhs)?;
    let l_is_mat = matches!(ctx.b.module().get_type(l.ty)?, crate::ir::ty::Type::Matrix { .. });
    let r_is_mat = matches!(ctx.b.module().get_type(r.ty)?, crate::ir::ty::Type::Matrix { .. });
    if op == BinOp::Mul && (l_is_mat || r_is_mat) {
        let result_ty = if l_is_mat {
            match ctx.b.module().get_type(l.ty)? {
                crate::ir::ty::Type::Matrix { col, .. } => *col,
                _ => unreachable!(),
            }
        } else {
            r.ty
        };
        let id = ctx.b.mat_mul(ctx.func, ctx.block, result_ty, l.value, r.value)?;
        return Ok(TypedValue::rvalue(id, result_ty));
    }
    let (l, r) = balance_scalar_vector(ctx, l, r)?;
    let bool_ty = ctx.b.type_scalar(ScalarType::Bool);
    let id = match op {
        BinOp::Add => ctx.b.add(ctx.func, ctx.block, l.ty, l.value, r.value)?,
        BinOp::Sub => ctx.b.sub(ctx.func, ctx.block, l.ty, l.value, r.value)?,
        BinOp::Mul => ctx.b.mul(ctx.func, ctx.block, l.ty, l.value, r.value)?,
        BinOp::Div => ctx.b.div(ctx.func, ctx.block, l.ty, l.value, r.value)?,
        BinOp::Mod => {
            if is_float_ty(ctx, l.ty) {
                ctx.b.rem(ctx.func, ctx.block, l.ty, l.value, r.value)?
            } else {
                ctx.b.mod_(ctx.func, ctx.block, l.ty, l.value, r.value)?
            }
        }
        BinOp::Eq => return Ok(TypedValue::rvalue(ctx.b.eq(ctx.func, ctx.block, bool_ty, l.value, r.value)?, bool_ty)),
        BinOp::Ne => return Ok(TypedValue::rvalue(ctx.b.ne(ctx.func, ctx.block, bool_ty, l.value, r.value)?, bool_ty)),
        BinOp::Lt => return Ok(TypedValue::rvalue(ctx.b.lt(ctx.func, ctx.block, bool_ty, l.value, r.value)?, bool_ty)),
        BinOp::Le => return Ok(TypedValue::rvalue(ctx.b.le(ctx.func, ctx.block, bool_ty, l.value, r.value)?, bool_ty)),
        BinOp::Gt => return Ok(TypedValue::rvalue(ctx.b.gt(ctx.func, ctx.block, bool_ty, l.value, r.value)?, bool_ty)),
        BinOp::Ge => return Ok(TypedValue::rvalue(ctx.b.ge(ctx.func, ctx.block, bool_ty, l.value, r.value)?, bool_ty)),
        BinOp::And => return Ok(TypedValue::rvalue(ctx.b.log_and(ctx.func, ctx.block, bool_ty, l.value, r.value)?, bool_ty)),
        BinOp::Or => return Ok(TypedValue::rvalue(ctx.b.log_or(ctx.func, ctx.block, bool_ty, l.value, r.value)?, bool_ty)),
        BinOp::BitAnd => ctx.b.bit_and(ctx.func, ctx.block, l.ty, l.value, r.value)?,
        BinOp::BitOr => ctx.b.bit_or(ctx.func, ctx.block, l.ty, l.value, r.value)?,
        BinOp::BitXor => ctx.b.bit_xor(ctx.func, ctx.block, l.ty, l.value, r.value)?,
        BinOp::Shl => ctx.b.shl(ctx.func, ctx.block, l.ty, l.value, r.value)?,
        BinOp::Shr => ctx.b.shr(ctx.func, ctx.block, l.ty, l.value, r.value)?,
    };
    Ok(TypedValue::rvalue(id, l.ty))
}

fn lower_call(ctx: &mut FnCtx, callee: &str, args: &[Expr]) -> Result<TypedValue> {
    if callee == "texture" {
        return lower_texture_call(ctx, args);
    }
    let arg_values = args.iter().map(|a| lower_rvalue(ctx, a)).collect::<Result<Vec<_>>>()?;
    let arg_ids: Vec<Id> = arg_values.iter().map(|v| v.value).collect();

    if let Some(f) = builtin_fn_from_name(callee) {
        let result_ty = arg_values.first().map(|v| v.ty).unwrap_or_else(|| ctx.b.type_scalar(ScalarType::f32()));
        let id = ctx.b.builtin(ctx.func, ctx.block, result_ty, f, arg_ids)?;
        return Ok(TypedValue::rvalue(id, result_ty));
    }
    if let Some(ctor_ty) = constructor_type(ctx, callee, args.len())? {
        let id = ctx.b.construct(ctx.func, ctx.block, ctor_ty, arg_ids)?;
        return Ok(TypedValue::rvalue(id, ctor_ty));
    }
    Err(anyhow!("unknown call target '{}'", callee))
}

fn lower_texture_call(ctx: &mut FnCtx, args: &[Expr]) -> Result<TypedValue> {
    let sampler_name = match args.first() {
        Some(Expr::Ident(name)) => name.clone(),
        _ => return Err(anyhow!("texture()'s first argument must be a sampler identifier")),
    };
    let (texture, texture_ty, sampler) = match ctx.globals.get(&sampler_name).copied() {
        Some(GlobalRef::CombinedSampler { texture, texture_ty, sampler }) => (texture, texture_ty, sampler),
        _ => return Err(anyhow!("'{}' is not a sampler", sampler_name)),
    };
    if !ctx.interface.contains(&texture) {
        ctx.interface.push(texture);
    }
    if !ctx.interface.contains(&sampler) {
        ctx.interface.push(sampler);
    }
    let rest = args[1..].iter().map(|a| lower_rvalue(ctx, a)).collect::<Result<Vec<_>>>()?;
    let mut arg_ids = vec![texture, sampler];
    arg_ids.extend(rest.iter().map(|v| v.value));
    let sampled_ty = match ctx.b.module().get_type(texture_ty)? {
        crate::ir::ty::Type::Texture(t) => t.sampled_ty,
        crate::ir::ty::Type::TextureDepth(_) => ctx.b.type_scalar(ScalarType::f32()),
        _ => return Err(anyhow!("sampler names a non-texture type")),
    };
    let result_ty = ctx.b.type_vector(sampled_ty, 4)?;
    let id = ctx.b.tex_sample(ctx.func, ctx.block, result_ty, Opcode::TexSample, arg_ids)?;
    Ok(TypedValue::rvalue(id, result_ty))
}

fn constructor_type(ctx: &mut FnCtx, callee: &str, _arg_count: usize) -> Result<Option<Id>> {
    if let Some((elem, n)) = vector_info(callee) {
        let elem_ty = ctx.b.type_scalar(elem);
        return Ok(Some(ctx.b.type_vector(elem_ty, n)?));
    }
    if let Some(s) = resolve_scalar(callee) {
        return Ok(Some(ctx.b.type_scalar(s)));
    }
    Ok(None)
}

fn builtin_fn_from_name(name: &str) -> Option<BuiltinFn> {
    Some(match name {
        "sin" => BuiltinFn::Sin,
        "cos" => BuiltinFn::Cos,
        "tan" => BuiltinFn::Tan,
        "sqrt" => BuiltinFn::Sqrt,
        "inversesqrt" => BuiltinFn::InverseSqrt,
        "pow" => BuiltinFn::Pow,
        "exp" => BuiltinFn::Exp,
        "exp2" => BuiltinFn::Exp2,
        "log" => BuiltinFn::Log,
        "log2" => BuiltinFn::Log2,
        "abs" => BuiltinFn::Abs,
        "sign" => BuiltinFn::Sign,
        "floor" => BuiltinFn::Floor,
        "ceil" => BuiltinFn::Ceil,
        "trunc" => BuiltinFn::Trunc,
        "round" => BuiltinFn::Round,
        "fract" => BuiltinFn::Fract,
        "min" => BuiltinFn::Min,
        "max" => BuiltinFn::Max,
        "clamp" => BuiltinFn::Clamp,
        "mix" => BuiltinFn::Mix,
        "step" => BuiltinFn::Step,
        "smoothstep" => BuiltinFn::SmoothStep,
        "dot" => BuiltinFn::Dot,
        "cross" => BuiltinFn::Cross,
        "length" => BuiltinFn::Length,
        "distance" => BuiltinFn::Distance,
        "normalize" => BuiltinFn::Normalize,
        "reflect" => BuiltinFn::Reflect,
        "refract" => BuiltinFn::Refract,
        "determinant" => BuiltinFn::Determinant,
        "transpose" => BuiltinFn::Transpose,
        "dFdx" => BuiltinFn::Dpdx,
        "dFdy" => BuiltinFn::Dpdy,
        "fwidth" => BuiltinFn::Fwidth,
        "bitCount" => BuiltinFn::CountOneBits,
        "bitfieldReverse" => BuiltinFn::ReverseBits,
        "all" => BuiltinFn::All,
        "any" => BuiltinFn::Any,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_info_parses_prefix_and_width() {
        assert_eq!(vector_info("vec3").unwrap().1, 3);
        assert_eq!(vector_info("ivec2").unwrap().1, 2);
        assert!(vector_info("vec5").is_none());
        assert!(vector_info("notavec").is_none());
    }

    #[test]
    fn layout_matches_wgsl_rule_for_mat4_then_vec4() {
        let mat = TypeExpr::Named("mat4".to_string());
        let vec = TypeExpr::Named("vec4".to_string());
        let (mat_align, mat_size) = layout(&mat).unwrap();
        assert_eq!(mat_align, 16);
        assert_eq!(mat_size, 64);
        let (vec_align, vec_size) = layout(&vec).unwrap();
        assert_eq!(vec_align, 16);
        assert_eq!(vec_size, 16);
    }
}
