//! AST → builder lowering for MSL. Entry-point I/O is parameter/return
//! shaped like WGSL's (`front::wgsl::lower` is the structural template),
//! not module-scope globals like GLSL's: a `[[stage_in]]` struct
//! decomposes into one input global per field, a struct return
//! decomposes into one output global per field, and `device`/`constant`
//! pointer-or-reference parameters tagged `[[buffer(n)]]` become
//! Storage/Uniform resource globals directly. Argument buffers and
//! struct-of-struct nesting beyond one level are not handled.
use fnv::FnvHashMap as HashMap;
use log::debug;

use crate::error::{anyhow, Result};
use crate::front::msl::parser::{
    AddressSpaceKw, Attribute, BinOp, Decl, Expr, FnDecl, FnKind, Param, QualifiedType, Stmt, StructDecl, StructField, TypeExpr, UnOp,
};
use crate::front::{BuildOptions, TypedValue};
use crate::ir::builder::Builder;
use crate::ir::entry::{EntryPointFlags, Stage};
use crate::ir::global::{Builtin, GlobalDecorations};
use crate::ir::inst::{BuiltinFn, Opcode};
use crate::ir::ty::{AddressSpace, ImageDim, ScalarType, StructMember, TextureType};
use crate::ir::{Id, Module};

struct TypeEnv {
    structs: HashMap<String, Id>,
}

#[derive(Clone)]
enum Binding {
    Value(TypedValue),
    FieldGlobals(HashMap<String, (Id, Id)>),
}

struct FnCtx<'b, 'm> {
    b: Builder<'m>,
    types: &'b TypeEnv,
    globals: &'b HashMap<String, (Id, Id, AddressSpace)>,
    scopes: Vec<HashMap<String, Binding>>,
    func: Id,
    block: Id,
    outputs: HashMap<String, (Id, Id)>,
}

pub fn lower(decls: &[Decl], opts: &BuildOptions) -> Result<Module> {
    let mut module = Module::new();
    let mut types = TypeEnv {
        structs: HashMap::default(),
    };
    let mut globals: HashMap<String, (Id, Id, AddressSpace)> = HashMap::default();
    let mut next_binding: u32 = 0;

    for decl in decls {
        if let Decl::Struct(s) = decl {
            debug!("lowering struct {}", s.name);
            let id = lower_struct(&mut module, &types, s)?;
            types.structs.insert(s.name.clone(), id);
        }
    }
    for decl in decls {
        if let Decl::GlobalVar(g) = decl {
            debug!("lowering global {}", g.name);
            lower_global(&mut module, &types, g, &mut globals, &mut next_binding)?;
        }
    }
    for decl in decls {
        if let Decl::Fn(f) = decl {
            debug!("lowering function {}", f.name);
            lower_function(&mut module, &types, &globals, opts, f, &mut next_binding)?;
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
        "half" => ScalarType::f16(),
        _ => return None,
    })
}

fn vector_info(name: &str) -> Option<(ScalarType, u32)> {
    for prefix in ["float", "int", "uint", "bool"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            if let Ok(n) = rest.parse::<u32>() {
                if (2..=4).contains(&n) {
                    return Some((resolve_scalar(prefix)?, n));
                }
            }
        }
    }
    None
}

fn mat_dims(name: &str) -> Option<(ScalarType, u32, u32)> {
    for prefix in ["float", "half"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            let mut parts = rest.split('x');
            let cols = parts.next()?.parse::<u32>().ok()?;
            let rows = parts.next()?.parse::<u32>().ok()?;
            if parts.next().is_some() {
                return None;
            }
            if (2..=4).contains(&cols) && (2..=4).contains(&rows) {
                return Some((resolve_scalar(prefix)?, cols, rows));
            }
        }
    }
    None
}

fn texture_dim(name: &str) -> Option<(ImageDim, bool)> {
    Some(match name {
        "texture2d" => (ImageDim::D2, false),
        "texture2d_array" => (ImageDim::D2, true),
        "texture3d" => (ImageDim::D3, false),
        "texturecube" => (ImageDim::Cube, false),
        "depth2d" => (ImageDim::D2, false),
        _ => return None,
    })
}

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
            if let Some((_, cols, rows)) = mat_dims(name) {
                let col_align = if rows == 2 { 8 } else { 16 };
                return Ok((col_align, col_align * cols as usize));
            }
            Err(anyhow!("cannot lay out unknown named type '{}'", name))
        }
        TypeExpr::Template(name, _) => Err(anyhow!("cannot lay out opaque type '{}' as a struct member", name)),
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
            if name == "void" {
                return Ok(b.type_void());
            }
            if let Some(s) = resolve_scalar(name) {
                return Ok(b.type_scalar(s));
            }
            if let Some((scalar, n)) = vector_info(name) {
                let elem = b.type_scalar(scalar);
                return b.type_vector(elem, n);
            }
            if let Some((scalar, cols, rows)) = mat_dims(name) {
                let elem = b.type_scalar(scalar);
                let col_ty = b.type_vector(elem, rows)?;
                let stride = if rows == 2 { 8 } else { 16 };
                return b.type_matrix(col_ty, cols, rows, stride);
            }
            if name == "sampler" {
                return Ok(b.type_sampler());
            }
            if let Some(&id) = types.structs.get(name) {
                return Ok(id);
            }
            Err(anyhow!("unknown type '{}'", name))
        }
        TypeExpr::Template(name, args) => {
            if let Some((dim, arrayed)) = texture_dim(name) {
                if name == "depth2d" {
                    return Ok(b.type_texture_depth(crate::ir::ty::TextureDepthType {
                        dim,
                        arrayed,
                        multisampled: false,
                    }));
                }
                let sampled_ty = resolve_type_b(b, types, args.first().ok_or_else(|| anyhow!("texture type missing sample type argument"))?)?;
                return Ok(b.type_texture(TextureType {
                    dim,
                    arrayed,
                    multisampled: false,
                    sampled_ty,
                }));
            }
            Err(anyhow!("unknown template type '{}'", name))
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
        if field.ty.is_ptr_or_ref {
            return Err(anyhow!("pointer-typed struct members are not supported ('{}')", field.name));
        }
        let (align, size) = layout(&field.ty.base)?;
        offset = round_up(offset, align);
        let ty = resolve_type(module, types, &field.ty.base)?;
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

// --- Attributes ------------------------------------------------------------------

fn find_attr<'a>(attrs: &'a [Attribute], name: &str) -> Option<&'a Attribute> {
    attrs.iter().find(|a| a.name == name)
}
fn attr_int(attrs: &[Attribute], name: &str) -> Option<u32> {
    find_attr(attrs, name).and_then(|a| a.int_arg()).map(|v| v as u32)
}
fn find_builtin_attr(attrs: &[Attribute]) -> Option<Builtin> {
    attrs.iter().find_map(|a| Builtin::from_msl_name(&a.name))
}

fn space_for(kw: Option<AddressSpaceKw>) -> AddressSpace {
    match kw {
        Some(AddressSpaceKw::Device) => AddressSpace::Storage,
        Some(AddressSpaceKw::Constant) => AddressSpace::Uniform,
        Some(AddressSpaceKw::Threadgroup) => AddressSpace::Workgroup,
        Some(AddressSpaceKw::Thread) | None => AddressSpace::Private,
    }
}

// --- Module-scope globals ---------------------------------------------------------

fn lower_global(
    module: &mut Module,
    types: &TypeEnv,
    g: &StructField,
    globals: &mut HashMap<String, (Id, Id, AddressSpace)>,
    next_binding: &mut u32,
) -> Result<()> {
    let space = space_for(g.ty.space);
    let pointee = resolve_type(module, types, &g.ty.base)?;
    let ptr_ty = {
        let mut b = Builder::new(module);
        b.type_ptr(pointee, space)
    };
    let binding = attr_int(&g.attrs, "buffer").unwrap_or_else(|| {
        let b = *next_binding;
        *next_binding += 1;
        b
    });
    let decorations = GlobalDecorations {
        group: Some(0),
        binding: Some(binding),
        ..Default::default()
    };
    let mut b = Builder::new(module);
    let id = b.global(Some(g.name.clone()), ptr_ty, decorations, None);
    b.set_name(id, g.name.clone());
    globals.insert(g.name.clone(), (id, pointee, space));
    Ok(())
}

// --- Functions ---------------------------------------------------------------------

fn lower_function(
    module: &mut Module,
    types: &TypeEnv,
    globals: &HashMap<String, (Id, Id, AddressSpace)>,
    opts: &BuildOptions,
    f: &FnDecl,
    next_binding: &mut u32,
) -> Result<()> {
    let stage = match f.kind {
        FnKind::Vertex => Some(Stage::Vertex),
        FnKind::Fragment => Some(Stage::Fragment),
        FnKind::Kernel => Some(Stage::Compute),
        FnKind::Plain => None,
    };
    match stage {
        Some(stage) => lower_entry_function(module, types, globals, opts, f, stage, next_binding),
        None => lower_plain_function(module, types, globals, f),
    }
}

fn lower_plain_function(module: &mut Module, types: &TypeEnv, globals: &HashMap<String, (Id, Id, AddressSpace)>, f: &FnDecl) -> Result<()> {
    let ret_ty = resolve_type(module, types, &f.ret_ty.base)?;
    let mut param_tys = Vec::new();
    for p in &f.params {
        param_tys.push((Some(p.name.clone()), resolve_type(module, types, &p.ty.base)?));
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
    for ((_, ty), (param, id)) in param_tys.iter().zip(f.params.iter().zip(param_ids)) {
        scope.insert(param.name.clone(), Binding::Value(TypedValue::rvalue(id, *ty)));
    }
    let mut ctx = FnCtx {
        b: Builder::new(module),
        types,
        globals,
        scopes: vec![scope],
        func,
        block: entry_block,
        outputs: HashMap::default(),
    };
    lower_block(&mut ctx, &f.body)?;
    ensure_terminated(&mut ctx)?;
    Ok(())
}

fn lower_entry_function(
    module: &mut Module,
    types: &TypeEnv,
    globals: &HashMap<String, (Id, Id, AddressSpace)>,
    opts: &BuildOptions,
    f: &FnDecl,
    stage: Stage,
    next_binding: &mut u32,
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

    let mut interface: Vec<Id> = Vec::new();
    let mut scope: HashMap<String, Binding> = HashMap::default();

    for p in &f.params {
        lower_entry_param(module, types, p, &mut interface, &mut scope, next_binding)?;
    }

    let mut outputs = HashMap::default();
    if !matches!(f.ret_ty.base, TypeExpr::Named(ref n) if n == "void") {
        if let TypeExpr::Named(name) = &f.ret_ty.base {
            if let Some(&struct_id) = types.structs.get(name) {
                outputs = decompose_struct_outputs(module, struct_id, &mut interface)?;
            } else {
                outputs = lower_scalar_output(module, &f.ret_ty, &f.ret_attrs, &mut interface)?;
            }
        } else {
            outputs = lower_scalar_output(module, &f.ret_ty, &f.ret_attrs, &mut interface)?;
        }
    }

    let mut ctx = FnCtx {
        b: Builder::new(module),
        types,
        globals,
        scopes: vec![scope],
        func,
        block: entry_block,
        outputs,
    };
    lower_block(&mut ctx, &f.body)?;
    {
        let b = &mut ctx.b;
        if b.module().get_function(func)?.block(ctx.block).map(|bl| bl.terminator().is_none()).unwrap_or(true) {
            b.return_void(func, ctx.block)?;
        }
    }

    let mut b = Builder::new(module);
    let ep_index = b.entry_point(stage, func, f.name.clone());
    b.set_entry_interface(ep_index, interface)?;
    if stage == Stage::Compute {
        let ep = b.module_mut().entry_point_mut(ep_index).ok_or_else(|| anyhow!("entry point vanished"))?;
        ep.workgroup_size = [1, 1, 1];
    }
    if stage == Stage::Fragment {
        let ep = b.module_mut().entry_point_mut(ep_index).ok_or_else(|| anyhow!("entry point vanished"))?;
        ep.flags = EntryPointFlags {
            depth_replacing: false,
            origin_upper_left: true,
            early_fragment_tests: false,
        };
    }
    let _ = opts;
    Ok(())
}

fn lower_scalar_output(module: &mut Module, ty: &QualifiedType, attrs: &[Attribute], interface: &mut Vec<Id>) -> Result<HashMap<String, (Id, Id)>> {
    let types = TypeEnv { structs: HashMap::default() };
    let pointee = resolve_type(module, &types, &ty.base)?;
    let ptr_ty = {
        let mut b = Builder::new(module);
        b.type_ptr(pointee, AddressSpace::Output)
    };
    let decorations = GlobalDecorations {
        location: attr_int(attrs, "color"),
        builtin: find_builtin_attr(attrs),
        ..Default::default()
    };
    let gid = {
        let mut b = Builder::new(module);
        b.global(Some("out".to_string()), ptr_ty, decorations, None)
    };
    interface.push(gid);
    let mut outputs = HashMap::default();
    outputs.insert("return".to_string(), (gid, pointee));
    Ok(outputs)
}

fn lower_entry_param(
    module: &mut Module,
    types: &TypeEnv,
    p: &Param,
    interface: &mut Vec<Id>,
    scope: &mut HashMap<String, Binding>,
    next_binding: &mut u32,
) -> Result<()> {
    if let TypeExpr::Template(name, args) = &p.ty.base {
        if let Some((dim, arrayed)) = texture_dim(name) {
            let binding = attr_int(&p.attrs, "texture").unwrap_or_else(|| {
                let b = *next_binding;
                *next_binding += 1;
                b
            });
            let pointee = if name == "depth2d" {
                let mut b = Builder::new(module);
                b.type_texture_depth(crate::ir::ty::TextureDepthType {
                    dim,
                    arrayed,
                    multisampled: false,
                })
            } else {
                let sampled_ty = resolve_type(module, types, args.first().ok_or_else(|| anyhow!("texture missing sample type"))?)?;
                let mut b = Builder::new(module);
                b.type_texture(TextureType {
                    dim,
                    arrayed,
                    multisampled: false,
                    sampled_ty,
                })
            };
            let ptr_ty = {
                let mut b = Builder::new(module);
                b.type_ptr(pointee, AddressSpace::UniformConstant)
            };
            let decorations = GlobalDecorations {
                group: Some(0),
                binding: Some(binding),
                non_writable: true,
                ..Default::default()
            };
            let gid = {
                let mut b = Builder::new(module);
                let id = b.global(Some(p.name.clone()), ptr_ty, decorations, None);
                b.set_name(id, p.name.clone());
                id
            };
            interface.push(gid);
            scope.insert(p.name.clone(), Binding::Value(TypedValue::pointer(gid, pointee)));
            return Ok(());
        }
    }
    if let TypeExpr::Named(name) = &p.ty.base {
        if name == "sampler" {
            let binding = attr_int(&p.attrs, "sampler").unwrap_or_else(|| {
                let b = *next_binding;
                *next_binding += 1;
                b
            });
            let pointee = {
                let mut b = Builder::new(module);
                b.type_sampler()
            };
            let ptr_ty = {
                let mut b = Builder::new(module);
                b.type_ptr(pointee, AddressSpace::UniformConstant)
            };
            let decorations = GlobalDecorations {
                group: Some(0),
                binding: Some(binding),
                non_writable: true,
                ..Default::default()
            };
            let gid = {
                let mut b = Builder::new(module);
                let id = b.global(Some(p.name.clone()), ptr_ty, decorations, None);
                b.set_name(id, p.name.clone());
                id
            };
            interface.push(gid);
            scope.insert(p.name.clone(), Binding::Value(TypedValue::pointer(gid, pointee)));
            return Ok(());
        }
        if let Some(&struct_id) = types.structs.get(name) {
            if find_attr(&p.attrs, "stage_in").is_some() {
                let fields = decompose_struct_inputs(module, struct_id, interface)?;
                scope.insert(p.name.clone(), Binding::FieldGlobals(fields));
                return Ok(());
            }
            // A plain struct parameter with no `stage_in` is a
            // `constant`/`device` resource block passed by reference.
            let space = space_for(p.ty.space);
            let binding = attr_int(&p.attrs, "buffer").unwrap_or_else(|| {
                let b = *next_binding;
                *next_binding += 1;
                b
            });
            let ptr_ty = {
                let mut b = Builder::new(module);
                b.type_ptr(struct_id, space)
            };
            let decorations = GlobalDecorations {
                group: Some(0),
                binding: Some(binding),
                non_writable: space == AddressSpace::Uniform,
                ..Default::default()
            };
            let gid = {
                let mut b = Builder::new(module);
                let id = b.global(Some(p.name.clone()), ptr_ty, decorations, None);
                b.set_name(id, p.name.clone());
                id
            };
            interface.push(gid);
            scope.insert(p.name.clone(), Binding::Value(TypedValue::pointer(gid, struct_id)));
            return Ok(());
        }
    }
    if p.ty.is_ptr_or_ref {
        let space = space_for(p.ty.space);
        let pointee = resolve_type(module, types, &p.ty.base)?;
        let binding = attr_int(&p.attrs, "buffer").unwrap_or_else(|| {
            let b = *next_binding;
            *next_binding += 1;
            b
        });
        let ptr_ty = {
            let mut b = Builder::new(module);
            b.type_ptr(pointee, space)
        };
        let decorations = GlobalDecorations {
            group: Some(0),
            binding: Some(binding),
            non_writable: space == AddressSpace::Uniform,
            ..Default::default()
        };
        let gid = {
            let mut b = Builder::new(module);
            let id = b.global(Some(p.name.clone()), ptr_ty, decorations, None);
            b.set_name(id, p.name.clone());
            id
        };
        interface.push(gid);
        scope.insert(p.name.clone(), Binding::Value(TypedValue::pointer(gid, pointee)));
        return Ok(());
    }
    if let Some(builtin) = find_builtin_attr(&p.attrs) {
        let pointee = resolve_type(module, types, &p.ty.base)?;
        let ptr_ty = {
            let mut b = Builder::new(module);
            b.type_ptr(pointee, AddressSpace::Input)
        };
        let decorations = GlobalDecorations {
            builtin: Some(builtin),
            non_writable: true,
            ..Default::default()
        };
        let gid = {
            let mut b = Builder::new(module);
            let id = b.global(Some(p.name.clone()), ptr_ty, decorations, None);
            b.set_name(id, p.name.clone());
            id
        };
        interface.push(gid);
        scope.insert(p.name.clone(), Binding::Value(TypedValue::pointer(gid, pointee)));
        return Ok(());
    }
    Err(anyhow!(
        "entry parameter '{}' carries no recognized attribute (stage_in/buffer/texture/sampler/builtin)",
        p.name
    ))
}

fn decompose_struct_inputs(module: &mut Module, struct_id: Id, interface: &mut Vec<Id>) -> Result<HashMap<String, (Id, Id)>> {
    let members = match module.get_type(struct_id)?.clone() {
        crate::ir::ty::Type::Struct(s) => s,
        _ => return Err(anyhow!("expected struct type")),
    };
    let mut fields = HashMap::default();
    for (i, m) in members.members.iter().enumerate() {
        let name = m.name.clone().ok_or_else(|| anyhow!("unnamed struct member in entry-point interface"))?;
        let ptr_ty = {
            let mut b = Builder::new(module);
            b.type_ptr(m.ty, AddressSpace::Input)
        };
        let decorations = GlobalDecorations {
            location: Some(i as u32),
            non_writable: true,
            ..Default::default()
        };
        let mut b = Builder::new(module);
        let gid = b.global(Some(name.clone()), ptr_ty, decorations, None);
        interface.push(gid);
        fields.insert(name, (gid, m.ty));
    }
    Ok(fields)
}

fn decompose_struct_outputs(module: &mut Module, struct_id: Id, interface: &mut Vec<Id>) -> Result<HashMap<String, (Id, Id)>> {
    let members = match module.get_type(struct_id)?.clone() {
        crate::ir::ty::Type::Struct(s) => s,
        _ => return Err(anyhow!("expected struct type")),
    };
    let mut fields = HashMap::default();
    for (i, m) in members.members.iter().enumerate() {
        let name = m.name.clone().ok_or_else(|| anyhow!("unnamed struct member in entry-point interface"))?;
        let ptr_ty = {
            let mut b = Builder::new(module);
            b.type_ptr(m.ty, AddressSpace::Output)
        };
        let decorations = GlobalDecorations {
            location: Some(i as u32),
            ..Default::default()
        };
        let mut b = Builder::new(module);
        let gid = b.global(Some(name.clone()), ptr_ty, decorations, None);
        interface.push(gid);
        fields.insert(name, (gid, m.ty));
    }
    Ok(fields)
}

// --- Statements --------------------------------------------------------------------

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
            if let Some(qty) = ty {
                let pointee = resolve_type(ctx.b.module_mut(), ctx.types, &qty.base)?;
                let ptr_ty = ctx.b.type_ptr(pointee, AddressSpace::Function);
                let local = ctx.b.add_local(ctx.func, Some(name.clone()), ptr_ty, None)?;
                let value = lower_rvalue(ctx, expr)?;
                ctx.b.store(ctx.func, ctx.block, local, value.value)?;
                ctx.scopes
                    .last_mut()
                    .unwrap()
                    .insert(name.clone(), Binding::Value(TypedValue::pointer(local, pointee)));
            } else {
                let value = lower_rvalue(ctx, expr)?;
                ctx.scopes.last_mut().unwrap().insert(name.clone(), Binding::Value(value));
            }
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
                if let Some((gid, _)) = ctx.outputs.get("return").copied() {
                    ctx.b.store(ctx.func, ctx.block, gid, v.value)?;
                    ctx.b.return_void(ctx.func, ctx.block)?;
                } else {
                    ctx.b.return_value(ctx.func, ctx.block, v.value)?;
                }
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

fn lower_loop(ctx: &mut FnCtx, init: Option<&Stmt>, cond: &Expr, incr: Option<&Stmt>, body: &[Stmt]) -> Result<()> {
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
        if let Some(incr) = incr {
            lower_stmt(ctx, incr)?;
        }
        ctx.b.branch(ctx.func, ctx.block, continue_blk)?;
    }
    ctx.b.branch(ctx.func, continue_blk, header)?;
    ctx.block = merge_blk;
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

fn lower_lvalue(ctx: &mut FnCtx, expr: &Expr) -> Result<TypedValue> {
    match expr {
        Expr::Ident(name) => {
            if let Some(Binding::Value(v)) = lookup(ctx, name) {
                if v.is_pointer {
                    return Ok(v);
                }
                return Err(anyhow!("'{}' is not assignable", name));
            }
            if let Some((gid, pointee, _space)) = ctx.globals.get(name).copied() {
                return Ok(TypedValue::pointer(gid, pointee));
            }
            Err(anyhow!("unknown identifier '{}'", name))
        }
        Expr::Member(base, field) => {
            if let Expr::Ident(name) = base.as_ref() {
                if let Some(Binding::FieldGlobals(fields)) = lookup(ctx, name) {
                    let (gid, ty) = *fields.get(field).ok_or_else(|| anyhow!("unknown field '{}'", field))?;
                    return Ok(TypedValue::pointer(gid, ty));
                }
            }
            let base_ptr = lower_lvalue(ctx, base)?;
            access_member(ctx, base_ptr, field)
        }
        Expr::Index(base, index) => {
            let base_ptr = lower_lvalue(ctx, base)?;
            let index_val = lower_rvalue(ctx, index)?;
            access_index(ctx, base_ptr, index_val.value)
        }
        Expr::Unary(UnOp::Neg, inner) => lower_lvalue(ctx, inner),
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
    match ctx.b.module().get_type(pointee_ty)? {
        crate::ir::ty::Type::Vector { elem, .. } => {
            let idx = swizzle_index(field)?;
            let member_ty = *elem;
            let ptr_ty = ctx.b.type_ptr(member_ty, space);
            let idx_const = ctx.b.const_scalar(ctx.b.type_scalar(ScalarType::u32()), idx);
            let result = ctx.b.access(ctx.func, ctx.block, ptr_ty, base.value, vec![idx_const])?;
            return Ok(TypedValue::pointer(result, member_ty));
        }
        crate::ir::ty::Type::Struct(s) => {
            let (index, member) = s
                .members
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
        _ => Err(anyhow!("member access on a non-struct, non-vector type")),
    }
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
            let is_unsigned = matches!(suffix, crate::front::msl::lexer::IntSuffix::U);
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
            if let Some((gid, pointee, _space)) = ctx.globals.get(name).copied() {
                let loaded = ctx.b.load(ctx.func, ctx.block, pointee, gid)?;
                return Ok(TypedValue::rvalue(loaded, pointee));
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
    let arg_values = args.iter().map(|a| lower_rvalue(ctx, a)).collect::<Result<Vec<_>>>()?;
    let arg_ids: Vec<Id> = arg_values.iter().map(|v| v.value).collect();

    if callee == "sample" {
        // `tex.sample(samp, coord)` is parsed as a method-call-shaped
        // `Call`; the member-call desugaring happens in the parser's
        // postfix chain, so by the time it reaches here the texture and
        // sampler already sit at the front of `args` as plain idents.
        let ty = ctx.b.type_vector(ctx.b.type_scalar(ScalarType::f32()), 4)?;
        let id = ctx.b.tex_sample(ctx.func, ctx.block, ty, Opcode::TexSample, arg_ids)?;
        return Ok(TypedValue::rvalue(id, ty));
    }
    if let Some(f) = builtin_fn_from_name(callee) {
        let result_ty = arg_values.first().map(|v| v.ty).unwrap_or_else(|| ctx.b.type_scalar(ScalarType::f32()));
        let id = ctx.b.builtin(ctx.func, ctx.block, result_ty, f, arg_ids)?;
        return Ok(TypedValue::rvalue(id, result_ty));
    }
    if let Some(ctor_ty) = constructor_type(ctx, callee)? {
        let id = ctx.b.construct(ctx.func, ctx.block, ctor_ty, arg_ids)?;
        return Ok(TypedValue::rvalue(id, ctor_ty));
    }
    Err(anyhow!("unknown call target '{}'", callee))
}

fn constructor_type(ctx: &mut FnCtx, callee: &str) -> Result<Option<Id>> {
    if let Some((scalar, n)) = vector_info(callee) {
        let elem = ctx.b.type_scalar(scalar);
        return Ok(Some(ctx.b.type_vector(elem, n)?));
    }
    Ok(None)
}

fn builtin_fn_from_name(name: &str) -> Option<BuiltinFn> {
    Some(match name {
        "sin" => BuiltinFn::Sin,
        "cos" => BuiltinFn::Cos,
        "tan" => BuiltinFn::Tan,
        "sqrt" => BuiltinFn::Sqrt,
        "rsqrt" => BuiltinFn::InverseSqrt,
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
        "dfdx" => BuiltinFn::Dpdx,
        "dfdy" => BuiltinFn::Dpdy,
        "fwidth" => BuiltinFn::Fwidth,
        "popcount" => BuiltinFn::CountOneBits,
        "reverse_bits" => BuiltinFn::ReverseBits,
        "all" => BuiltinFn::All,
        "any" => BuiltinFn::Any,
        "select" => BuiltinFn::Select,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_info_parses_width_suffix() {
        assert_eq!(vector_info("float4").unwrap().1, 4);
        assert_eq!(vector_info("int2").unwrap().1, 2);
        assert!(vector_info("float5").is_none());
    }

    #[test]
    fn mat_dims_parses_cxr_suffix() {
        let (_, cols, rows) = mat_dims("float3x3").unwrap();
        assert_eq!((cols, rows), (3, 3));
        assert!(mat_dims("float3").is_none());
    }

    #[test]
    fn layout_matches_wgsl_rule_for_mat4_then_vec4() {
        let mat = TypeExpr::Named("float4x4".to_string());
        let vec = TypeExpr::Named("float4".to_string());
        let (mat_align, mat_size) = layout(&mat).unwrap();
        assert_eq!((mat_align, mat_size), (16, 64));
        let (vec_align, vec_size) = layout(&vec).unwrap();
        assert_eq!((vec_align, vec_size), (16, 16));
    }
}
