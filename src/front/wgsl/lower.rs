//! AST → builder lowering (spec.md §4.4 "Typed expression lowering" and
//! "Entry-point formation"). Maintains the symbol tables a front-end
//! needs on top of the builder's explicit-handle API: a struct-name
//! table, a module-scope global table, and a stack of function-local
//! scopes.
use fnv::FnvHashMap as HashMap;
use log::debug;

use crate::error::{anyhow, Diag, DiagCode, Result};
use crate::front::wgsl::parser::{AttrArg, Attribute, BinOp, Decl, Expr, FnDecl, GlobalVarDecl, Param, Stmt, StructDecl, TypeExpr, UnOp};
use crate::front::{BuildOptions, TypedValue};
use crate::ir::builder::Builder;
use crate::ir::entry::{EntryPointFlags, Stage};
use crate::ir::global::{Builtin, GlobalDecorations, Interpolation};
use crate::ir::inst::{BuiltinFn, Opcode};
use crate::ir::ty::{AddressSpace, ScalarType, StructMember};
use crate::ir::{Id, Module};

struct TypeEnv {
    structs: HashMap<String, Id>,
}

/// Local name → its IR binding: either a pointer (a `let`/`var`/param
/// decomposed from a struct) or a plain rvalue (a `let` of an rvalue
/// expression).
#[derive(Clone)]
enum Binding {
    Value(TypedValue),
    /// A struct-valued entry-point parameter decomposed into one input
    /// global per member (spec.md §4.4 point 1); `.field` resolves
    /// directly to the member's global rather than a real struct load.
    FieldGlobals(HashMap<String, (Id, Id)>),
}

struct FnCtx<'b, 'm> {
    b: Builder<'m>,
    types: &'b TypeEnv,
    globals: &'b HashMap<String, (Id, Id, AddressSpace)>,
    scopes: Vec<HashMap<String, Binding>>,
    func: Id,
    block: Id,
    /// Outputs to populate before `return`: name → (global id, pointee type).
    outputs: HashMap<String, (Id, Id)>,
    /// Enclosing loops, innermost last: (merge_block, continue_block), for
    /// `break`/`continue` to target.
    loop_stack: Vec<(Id, Id)>,
}

pub fn lower(decls: &[Decl], opts: &BuildOptions) -> Result<Module> {
    let mut module = Module::new();
    let mut types = TypeEnv {
        structs: HashMap::default(),
    };
    let mut globals: HashMap<String, (Id, Id, AddressSpace)> = HashMap::default();

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
            lower_global(&mut module, &types, opts, g, &mut globals)?;
        }
    }
    for decl in decls {
        if let Decl::Fn(f) = decl {
            debug!("lowering function {}", f.name);
            lower_function(&mut module, &types, &globals, opts, f)?;
        }
    }
    Ok(module)
}

// --- Type resolution -----------------------------------------------------------

fn resolve_scalar(name: &str) -> Option<ScalarType> {
    Some(match name {
        "bool" => ScalarType::Bool,
        "i32" => ScalarType::i32(),
        "u32" => ScalarType::u32(),
        "f32" => ScalarType::f32(),
        "f16" => ScalarType::f16(),
        _ => return None,
    })
}

fn vec_size(name: &str) -> Option<u32> {
    match name {
        "vec2" => Some(2),
        "vec3" => Some(3),
        "vec4" => Some(4),
        _ => None,
    }
}

fn mat_dims(name: &str) -> Option<(u32, u32)> {
    match name {
        "mat2x2" => Some((2, 2)),
        "mat2x3" => Some((2, 3)),
        "mat2x4" => Some((2, 4)),
        "mat3x2" => Some((3, 2)),
        "mat3x3" => Some((3, 3)),
        "mat3x4" => Some((3, 4)),
        "mat4x2" => Some((4, 2)),
        "mat4x3" => Some((4, 3)),
        "mat4x4" => Some((4, 4)),
        _ => None,
    }
}

/// WGSL alignment/size for a type expression, used to lay out struct
/// members (naive std140-like rule: scalar align/size 4, vecN align/size
/// rounds to {8,16,16}, matCxR is `cols` column vectors of size R each
/// aligned/strided like a vector).
fn layout(te: &TypeExpr) -> Result<(usize, usize)> {
    match te {
        TypeExpr::Named(name) => {
            if resolve_scalar(name).is_some() {
                Ok((4, 4))
            } else {
                Err(anyhow!("cannot lay out unknown named type '{}'", name))
            }
        }
        TypeExpr::Generic(name, args) => {
            if let Some(n) = vec_size(name) {
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
            let _ = args;
            Err(anyhow!("cannot lay out generic type '{}'", name))
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
            if let Some(&id) = types.structs.get(name) {
                return Ok(id);
            }
            Err(anyhow!("unknown type '{}'", name))
        }
        TypeExpr::Generic(name, args) => {
            if let Some(n) = vec_size(name) {
                let elem = resolve_type_b(b, types, &args[0])?;
                return b.type_vector(elem, n);
            }
            if let Some((cols, rows)) = mat_dims(name) {
                let col_ty = {
                    let elem = resolve_type_b(b, types, &args[0])?;
                    b.type_vector(elem, rows)?
                };
                let stride = if rows == 2 { 8 } else { 16 };
                return b.type_matrix(col_ty, cols, rows, stride);
            }
            if name == "texture_2d" || name == "texture_3d" || name == "texture_cube" {
                let dim = match name.as_str() {
                    "texture_2d" => crate::ir::ty::ImageDim::D2,
                    "texture_3d" => crate::ir::ty::ImageDim::D3,
                    _ => crate::ir::ty::ImageDim::Cube,
                };
                let sampled_ty = resolve_type_b(b, types, &args[0])?;
                return Ok(b.type_texture(crate::ir::ty::TextureType {
                    dim,
                    arrayed: false,
                    multisampled: false,
                    sampled_ty,
                }));
            }
            if name == "ptr" {
                return Err(anyhow!("explicit ptr<> types are not accepted from source"));
            }
            Err(anyhow!("unknown generic type '{}'", name))
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

// --- Globals -------------------------------------------------------------------

fn find_attr<'a>(attrs: &'a [Attribute], name: &str) -> Option<&'a Attribute> {
    attrs.iter().find(|a| a.name == name)
}
fn attr_int(attrs: &[Attribute], name: &str) -> Option<u32> {
    find_attr(attrs, name).and_then(|a| a.int_arg()).map(|v| v as u32)
}

fn builtin_from_attr(args: &[AttrArg]) -> Option<Builtin> {
    let name = args.first()?.ident.as_deref()?;
    Builtin::from_wgsl_name(name)
}

fn space_from_template(template: &[String], pointee: &crate::ir::ty::Type) -> AddressSpace {
    use crate::ir::ty::Type;
    match template.first().map(|s| s.as_str()) {
        Some("uniform") => AddressSpace::Uniform,
        Some("storage") => AddressSpace::Storage,
        Some("workgroup") => AddressSpace::Workgroup,
        Some("private") => AddressSpace::Private,
        Some("push_constant") => AddressSpace::PushConstant,
        // Handle types (`texture_2d<f32>`, `sampler`, ...) carry no
        // `var<...>` template in WGSL; they always live in the handle
        // address space regardless.
        None if matches!(
            pointee,
            Type::Sampler | Type::SamplerComparison | Type::Texture(_) | Type::TextureStorage(_) | Type::TextureDepth(_)
        ) =>
        {
            AddressSpace::UniformConstant
        }
        _ => AddressSpace::Private,
    }
}

fn lower_global(
    module: &mut Module,
    types: &TypeEnv,
    _opts: &BuildOptions,
    g: &GlobalVarDecl,
    globals: &mut HashMap<String, (Id, Id, AddressSpace)>,
) -> Result<()> {
    let pointee = resolve_type(module, types, &g.ty)?;
    let space = space_from_template(&g.template, module.get_type(pointee)?);
    let ptr_ty = {
        let mut b = Builder::new(module);
        b.type_ptr(pointee, space)
    };
    let decorations = GlobalDecorations {
        group: attr_int(&g.attrs, "group"),
        binding: attr_int(&g.attrs, "binding"),
        location: attr_int(&g.attrs, "location"),
        builtin: find_attr(&g.attrs, "builtin").and_then(|a| builtin_from_attr(&a.args)),
        interpolation: None,
        sampling: None,
        non_writable: g.template.iter().any(|t| t == "read"),
        invariant: find_attr(&g.attrs, "invariant").is_some(),
    };
    let mut b = Builder::new(module);
    let id = b.global(Some(g.name.clone()), ptr_ty, decorations, None);
    b.set_name(id, g.name.clone());
    globals.insert(g.name.clone(), (id, pointee, space));
    Ok(())
}

// --- Functions -------------------------------------------------------------------

fn lower_function(
    module: &mut Module,
    types: &TypeEnv,
    globals: &HashMap<String, (Id, Id, AddressSpace)>,
    opts: &BuildOptions,
    f: &FnDecl,
) -> Result<()> {
    let stage = if find_attr(&f.attrs, "vertex").is_some() {
        Some(Stage::Vertex)
    } else if find_attr(&f.attrs, "fragment").is_some() {
        Some(Stage::Fragment)
    } else if find_attr(&f.attrs, "compute").is_some() {
        Some(Stage::Compute)
    } else {
        None
    };

    if let Some(stage) = stage {
        lower_entry_function(module, types, globals, opts, f, stage)
    } else {
        lower_plain_function(module, types, globals, opts, f)
    }
}

fn lower_plain_function(
    module: &mut Module,
    types: &TypeEnv,
    globals: &HashMap<String, (Id, Id, AddressSpace)>,
    _opts: &BuildOptions,
    f: &FnDecl,
) -> Result<()> {
    let ret_ty = match &f.ret_ty {
        Some(te) => resolve_type(module, types, te)?,
        None => {
            let mut b = Builder::new(module);
            b.type_void()
        }
    };
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
    for ((_, ty), id) in param_tys.iter().zip(param_ids) {
        scope.insert(
            f.params[scope.len()].name.clone(),
            Binding::Value(TypedValue::rvalue(id, *ty)),
        );
    }

    let mut ctx = FnCtx {
        b: Builder::new(module),
        types,
        globals,
        scopes: vec![scope],
        func,
        block: entry_block,
        outputs: HashMap::default(),
        loop_stack: Vec::new(),
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
        if let Some(gid) = find_attr(&p.attrs, "builtin").or_else(|| find_attr(&p.attrs, "location")) {
            let _ = gid;
            let pointee = resolve_type(module, types, &p.ty)?;
            let ptr_ty = {
                let mut b = Builder::new(module);
                b.type_ptr(pointee, AddressSpace::Input)
            };
            let decorations = GlobalDecorations {
                group: None,
                binding: None,
                location: attr_int(&p.attrs, "location"),
                builtin: find_attr(&p.attrs, "builtin").and_then(|a| builtin_from_attr(&a.args)),
                interpolation: find_attr(&p.attrs, "interpolate").map(|_| Interpolation::Perspective),
                sampling: None,
                non_writable: true,
                invariant: false,
            };
            let gid = {
                let mut b = Builder::new(module);
                let id = b.global(Some(p.name.clone()), ptr_ty, decorations, None);
                b.set_name(id, p.name.clone());
                id
            };
            interface.push(gid);
            scope.insert(p.name.clone(), Binding::Value(TypedValue::pointer(gid, pointee)));
        } else if let Some(&struct_id) = types.structs.get(type_name(&p.ty)) {
            // Interface struct decomposed into one input global per member.
            let fields = decompose_struct_inputs(module, struct_id, &mut interface)?;
            scope.insert(p.name.clone(), Binding::FieldGlobals(fields));
        } else {
            return Err(anyhow!("entry parameter '{}' carries no location/builtin attribute and is not a struct", p.name));
        }
    }

    let mut outputs = HashMap::default();
    if let Some(ret_ty) = &f.ret_ty {
        if let Some(&struct_id) = types.structs.get(type_name(ret_ty)) {
            outputs = decompose_struct_outputs(module, struct_id, &mut interface)?;
        } else {
            let pointee = resolve_type(module, types, ret_ty)?;
            let ptr_ty = {
                let mut b = Builder::new(module);
                b.type_ptr(pointee, AddressSpace::Output)
            };
            let decorations = GlobalDecorations {
                group: None,
                binding: None,
                location: attr_int(&f.ret_attrs, "location"),
                builtin: find_attr(&f.ret_attrs, "builtin").and_then(|a| builtin_from_attr(&a.args)),
                interpolation: None,
                sampling: None,
                non_writable: false,
                invariant: false,
            };
            let gid = {
                let mut b = Builder::new(module);
                b.global(Some("out".to_string()), ptr_ty, decorations, None)
            };
            interface.push(gid);
            outputs.insert("return".to_string(), (gid, pointee));
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
        loop_stack: Vec::new(),
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
        let wg = find_attr(&f.attrs, "workgroup_size")
            .map(|a| {
                let mut dims = [1u32, 1, 1];
                for (i, arg) in a.args.iter().enumerate().take(3) {
                    if let Some(v) = arg.int {
                        dims[i] = v as u32;
                    }
                }
                dims
            })
            .unwrap_or([1, 1, 1]);
        let ep = b
            .module_mut()
            .entry_point_mut(ep_index)
            .ok_or_else(|| anyhow!("entry point vanished"))?;
        ep.workgroup_size = wg;
    }
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
    let _ = opts;
    Ok(())
}

fn type_name(te: &TypeExpr) -> &str {
    match te {
        TypeExpr::Named(n) => n,
        TypeExpr::Generic(n, _) => n,
        TypeExpr::Array(..) => "array",
    }
}

fn decompose_struct_inputs(module: &mut Module, struct_id: Id, interface: &mut Vec<Id>) -> Result<HashMap<String, (Id, Id)>> {
    let members = match module.get_type(struct_id)?.clone() {
        crate::ir::ty::Type::Struct(s) => s.members,
        _ => return Err(anyhow!("expected struct type")),
    };
    let mut fields = HashMap::default();
    for m in members {
        let name = m.name.clone().ok_or_else(|| anyhow!("unnamed struct member in entry-point interface"))?;
        let ptr_ty = {
            let mut b = Builder::new(module);
            b.type_ptr(m.ty, AddressSpace::Input)
        };
        let decorations = GlobalDecorations {
            location: Some(fields.len() as u32),
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
        crate::ir::ty::Type::Struct(s) => s.members,
        _ => return Err(anyhow!("expected struct type")),
    };
    let mut fields = HashMap::default();
    for m in members {
        let name = m.name.clone().ok_or_else(|| anyhow!("unnamed struct member in entry-point interface"))?;
        let ptr_ty = {
            let mut b = Builder::new(module);
            b.type_ptr(m.ty, AddressSpace::Output)
        };
        let decorations = GlobalDecorations {
            location: Some(fields.len() as u32),
            ..Default::default()
        };
        let mut b = Builder::new(module);
        let gid = b.global(Some(name.clone()), ptr_ty, decorations, None);
        interface.push(gid);
        fields.insert(name, (gid, m.ty));
    }
    Ok(fields)
}

// --- Statements -----------------------------------------------------------------

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
        Stmt::Let(name, _ty, expr) => {
            let value = lower_rvalue(ctx, expr)?;
            ctx.scopes.last_mut().unwrap().insert(name.clone(), Binding::Value(value));
        }
        Stmt::Var(name, ty, init) => {
            let pointee = match (ty, init) {
                (Some(te), _) => resolve_type(ctx.b.module_mut(), ctx.types, te)?,
                (None, Some(expr)) => lower_rvalue(ctx, expr)?.ty,
                (None, None) => return Err(anyhow!("local var '{}' needs a type or initializer", name)),
            };
            let ptr_ty = ctx.b.type_ptr(pointee, AddressSpace::Function);
            let init_const = None;
            let local = ctx.b.add_local(ctx.func, Some(name.clone()), ptr_ty, init_const)?;
            if let Some(expr) = init {
                let value = lower_rvalue(ctx, expr)?;
                ctx.b.store(ctx.func, ctx.block, local, value.value)?;
            }
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
        Stmt::Loop(body) => {
            let header = ctx.b.append_block(ctx.func, None)?;
            let merge_blk = ctx.b.append_block(ctx.func, None)?;
            let continue_blk = ctx.b.append_block(ctx.func, None)?;
            ctx.b.branch(ctx.func, ctx.block, header)?;

            ctx.block = header;
            ctx.b.loop_merge(ctx.func, header, merge_blk, continue_blk)?;
            let body_blk = ctx.b.append_block(ctx.func, None)?;
            ctx.b.branch(ctx.func, header, body_blk)?;
            ctx.block = body_blk;
            ctx.loop_stack.push((merge_blk, continue_blk));
            lower_block(ctx, body)?;
            ctx.loop_stack.pop();
            if ctx.b.module().get_function(ctx.func)?.block(ctx.block).unwrap().terminator().is_none() {
                ctx.b.branch(ctx.func, ctx.block, continue_blk)?;
            }
            ctx.b.branch(ctx.func, continue_blk, header)?;
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
        Stmt::Break => {
            let (merge_blk, _) = *ctx
                .loop_stack
                .last()
                .ok_or_else(|| anyhow!("break outside of a loop"))?;
            ctx.b.branch(ctx.func, ctx.block, merge_blk)?;
        }
        Stmt::Continue => {
            let (_, continue_blk) = *ctx
                .loop_stack
                .last()
                .ok_or_else(|| anyhow!("continue outside of a loop"))?;
            ctx.b.branch(ctx.func, ctx.block, continue_blk)?;
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
/// of the continue block.
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
    ctx.loop_stack.push((merge_blk, continue_blk));
    lower_block(ctx, body)?;
    ctx.loop_stack.pop();
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
        _ => Err(anyhow!("expression is not an lvalue")),
    }
}

fn access_member(ctx: &mut FnCtx, base: TypedValue, field: &str) -> Result<TypedValue> {
    let pointee_ty = match ctx.b.module().get_type(base.ty)? {
        crate::ir::ty::Type::Ptr { pointee, .. } => *pointee,
        _ => return Err(anyhow!("member access on a non-pointer")),
    };
    let (space, members) = {
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
                let idx_const = ctx.b.const_scalar(ctx.b.type_scalar(ScalarType::u32()), idx);
                let result = ctx.b.access(ctx.func, ctx.block, ptr_ty, base.value, vec![idx_const])?;
                return Ok(TypedValue::pointer(result, member_ty));
            }
            _ => return Err(anyhow!("member access on a non-struct, non-vector type")),
        };
        (space, members)
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
            let is_unsigned = matches!(suffix, crate::front::wgsl::lexer::IntSuffix::U);
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
                    let pointee_ty = match ctx.b.module().get_type(v.ty) {
                        Ok(_) => v.ty,
                        Err(e) => return Err(e),
                    };
                    let loaded = ctx.b.load(ctx.func, ctx.block, pointee_ty, v.value)?;
                    return Ok(TypedValue::rvalue(loaded, pointee_ty));
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
    let base_ptr_or_val = if matches!(base, Expr::Ident(_)) {
        // Prefer lvalue form so the swizzle reads through a single load.
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
    let elem_ty = match ctx.b.module().get_type(base_ptr_or_val.ty)? {
        crate::ir::ty::Type::Vector { elem, .. } => *elem,
        _ => return Err(anyhow!("swizzle on a non-vector")),
    };
    let mask = field
        .chars()
        .map(|c| swizzle_index(&c.to_string()))
        .collect::<Result<Vec<_>>>()?;
    if mask.len() == 1 {
        let idx_const = ctx.b.const_scalar(ctx.b.type_scalar(ScalarType::u32()), mask[0]);
        let result = ctx.b.extract_dyn(ctx.func, ctx.block, elem_ty, base_ptr_or_val.value, idx_const)?;
        return Ok(TypedValue::rvalue(result, elem_ty));
    }
    let result_ty = ctx.b.type_vector(elem_ty, mask.len() as u32)?;
    let result = ctx
        .b
        .shuffle(ctx.func, ctx.block, result_ty, base_ptr_or_val.value, base_ptr_or_val.value, mask)?;
    Ok(TypedValue::rvalue(result, result_ty))
}

fn is_float_ty(ctx: &FnCtx, ty: Id) -> bool {
    matches!(ctx.b.module().get_type(ty), Ok(crate::ir::ty::Type::Scalar(s)) if s.is_float())
}

/// Scalar-to-vector broadcast in a binary operator: splats the scalar to
/// match the other operand's vector width before emission (spec.md §4.4).
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
        // Matrix × vector / vector × matrix selects `mat_mul`, never `mul`.
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
    let bool_ty = ctx.b.type_scalar(crate::ir::ty::ScalarType::Bool);
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

    if callee == "workgroupBarrier" {
        ctx.b.barrier(ctx.func, ctx.block, AddressSpace::Workgroup)?;
        let void_ty = ctx.b.type_void();
        return Ok(TypedValue::rvalue(0, void_ty));
    }
    if callee == "textureSample" {
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
    let mut parts = callee.splitn(2, '_');
    let base = parts.next().unwrap();
    let n = match vec_size(base) {
        Some(n) => n,
        None => return Ok(None),
    };
    let scalar_name = parts.next().unwrap_or("f32");
    let scalar = resolve_scalar(scalar_name).ok_or_else(|| anyhow!("unknown constructor scalar '{}'", scalar_name))?;
    let elem = ctx.b.type_scalar(scalar);
    Ok(Some(ctx.b.type_vector(elem, n)?))
}

fn builtin_fn_from_name(name: &str) -> Option<BuiltinFn> {
    Some(match name {
        "sin" => BuiltinFn::Sin,
        "cos" => BuiltinFn::Cos,
        "tan" => BuiltinFn::Tan,
        "sqrt" => BuiltinFn::Sqrt,
        "inverseSqrt" => BuiltinFn::InverseSqrt,
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
        "dpdx" => BuiltinFn::Dpdx,
        "dpdy" => BuiltinFn::Dpdy,
        "fwidth" => BuiltinFn::Fwidth,
        "countOneBits" => BuiltinFn::CountOneBits,
        "reverseBits" => BuiltinFn::ReverseBits,
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
    fn swizzle_index_maps_xyzw_and_rgba() {
        assert_eq!(swizzle_index("x").unwrap(), 0);
        assert_eq!(swizzle_index("g").unwrap(), 1);
        assert_eq!(swizzle_index("b").unwrap(), 2);
        assert_eq!(swizzle_index("w").unwrap(), 3);
        assert!(swizzle_index("xy").is_err());
    }

    #[test]
    fn layout_matches_std140_for_mat4_then_vec4() {
        let mat = TypeExpr::Generic("mat4x4".to_string(), vec![TypeExpr::Named("f32".to_string())]);
        let vec = TypeExpr::Generic("vec4".to_string(), vec![TypeExpr::Named("f32".to_string())]);
        let (mat_align, mat_size) = layout(&mat).unwrap();
        assert_eq!(mat_align, 16);
        assert_eq!(mat_size, 64);
        let (vec_align, vec_size) = layout(&vec).unwrap();
        assert_eq!(vec_align, 16);
        assert_eq!(vec_size, 16);
    }
}
