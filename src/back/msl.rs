//! Metal Shading Language emitter (spec.md §4.7, C8). A smaller sibling
//! of [`crate::back::wgsl`]: same structural block-walk and use-count
//! inlining rule, generalized to MSL's syntax -- C-family operators
//! instead of WGSL's keyword-ish ones, `[[attribute]]` annotations
//! instead of `@attribute`, and resource arguments passed as function
//! parameters with `[[buffer/texture/sampler(n)]]` indices rather than
//! module-scope `var<uniform>` declarations.
use fnv::FnvHashMap as HashMap;
use log::trace;

use crate::error::{anyhow, Result};
use crate::front::BuildOptions;
use crate::ir::constant::{ConstantKind, ScalarValue};
use crate::ir::entry::{EntryPoint, Stage};
use crate::ir::func::Function;
use crate::ir::global::Interpolation;
use crate::ir::inst::{BuiltinFn, Instruction, Opcode};
use crate::ir::ty::{AddressSpace, ScalarType, StorageAccess, Type};
use crate::ir::{Id, Module};

/// Entry point for the back-end: renders the whole module as MSL
/// source (spec.md §4.7 algorithm).
pub fn emit(module: &Module, opts: &BuildOptions) -> Result<String> {
    let mut w = Writer::new(module, opts);
    let mut out = String::new();
    if opts.msl_use_namespace {
        out.push_str("#include <metal_stdlib>\nusing namespace metal;\n\n");
    } else {
        out.push_str("#include <metal_stdlib>\n\n");
    }
    w.emit_structs(&mut out)?;
    w.emit_function_constants(&mut out)?;
    for func in module.functions() {
        w.emit_function(&mut out, func)?;
    }
    Ok(out)
}

struct Writer<'m> {
    module: &'m Module,
    opts: &'m BuildOptions,
    names: HashMap<Id, String>,
    used_names: fnv::FnvHashSet<String>,
}

impl<'m> Writer<'m> {
    fn new(module: &'m Module, opts: &'m BuildOptions) -> Self {
        Writer { module, opts, names: HashMap::default(), used_names: fnv::FnvHashSet::default() }
    }

    fn fresh(&mut self, wanted: &str) -> String {
        if self.used_names.insert(wanted.to_string()) {
            return wanted.to_string();
        }
        let mut i = 1;
        loop {
            let candidate = format!("{}_{}", wanted, i);
            if self.used_names.insert(candidate.clone()) {
                return candidate;
            }
            i += 1;
        }
    }

    fn name_for(&mut self, id: Id, existing: Option<&str>, prefix: &str) -> String {
        if let Some(n) = self.names.get(&id) {
            return n.clone();
        }
        let candidate = existing
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("_{}{}", prefix, id));
        let name = self.fresh(&candidate);
        self.names.insert(id, name.clone());
        name
    }

    fn type_name(&self, ty: Id) -> Result<String> {
        match self.module.get_type(ty)? {
            Type::Void => Ok("void".to_string()),
            Type::Scalar(s) => scalar_name(*s),
            Type::Vector { elem, size } => Ok(format!("{}{}", self.type_name(*elem)?, size)),
            Type::Matrix { col, cols, rows, .. } => {
                let elem = match self.module.get_type(*col)? {
                    Type::Vector { elem, .. } => *elem,
                    _ => return Err(anyhow!("matrix column type {} is not a vector", col)),
                };
                Ok(format!("{}{}x{}", self.type_name(elem)?, cols, rows))
            }
            Type::Array { elem, len, .. } => Ok(format!("array<{}, {}>", self.type_name(*elem)?, len)),
            Type::RuntimeArray { elem, .. } => Ok(format!("{}*", self.type_name(*elem)?)),
            Type::Struct(st) => st
                .name
                .clone()
                .ok_or_else(|| anyhow!("struct type {} has no name for MSL emission", ty)),
            Type::Ptr { pointee, space } => {
                Ok(format!("{} {}*", address_space_name(*space), self.type_name(*pointee)?))
            }
            Type::Sampler | Type::SamplerComparison => Ok("sampler".to_string()),
            Type::Texture(t) => {
                let sampled = self.type_name(t.sampled_ty)?;
                let base = if t.multisampled {
                    format!("texture{}_ms", t.dim)
                } else if t.arrayed {
                    format!("texture{}_array", t.dim)
                } else {
                    format!("texture{}", t.dim)
                };
                Ok(format!("{}<{}>", base, sampled))
            }
            Type::TextureStorage(t) => {
                let base = format!("texture{}", t.dim);
                let access = match t.access {
                    StorageAccess::Read => "access::read",
                    StorageAccess::Write => "access::write",
                    StorageAccess::ReadWrite => "access::read_write",
                };
                Ok(format!("{}<{}, {}>", base, texel_channel_type(t.format), access))
            }
            Type::TextureDepth(t) => {
                let base = if t.multisampled {
                    "depth2d_ms".to_string()
                } else if t.arrayed {
                    format!("depth{}_array", t.dim)
                } else {
                    format!("depth{}", t.dim)
                };
                Ok(format!("{}<float>", base))
            }
        }
    }

    fn io_attr(&self, d: &crate::ir::global::GlobalDecorations) -> String {
        if let Some(b) = d.builtin {
            format!("[[{}]]", b.msl_name())
        } else if let Some(loc) = d.location {
            match d.interpolation {
                Some(Interpolation::Flat) => format!("[[user(locn{}), flat]]", loc),
                _ => format!("[[user(locn{})]]", loc),
            }
        } else {
            String::new()
        }
    }

    fn emit_structs(&mut self, out: &mut String) -> Result<()> {
        let mut pairs: Vec<(Id, Type)> = self.module.types().map(|(id, ty)| (id, ty.clone())).collect();
        pairs.sort_by_key(|(id, _)| *id);
        for (id, ty) in pairs {
            if let Type::Struct(st) = ty {
                let name = match &st.name {
                    Some(n) => n.clone(),
                    None => continue,
                };
                out.push_str(&format!("struct {} {{\n", name));
                for m in &st.members {
                    let field_name = m.name.clone().ok_or_else(|| anyhow!("struct {} member has no name", id))?;
                    out.push_str(&format!("    {} {};\n", self.type_name(m.ty)?, field_name));
                }
                out.push_str("};\n\n");
            }
        }
        Ok(())
    }

    /// MSL's equivalent of WGSL `override`: a `constant` declared with
    /// `[[function_constant(n)]]`, resolved at pipeline-function-specialization
    /// time rather than baked in at compile time.
    fn emit_function_constants(&mut self, out: &mut String) -> Result<()> {
        let mut pairs: Vec<(Id, crate::ir::constant::Constant)> = self.module.consts().map(|(id, c)| (id, c.clone())).collect();
        pairs.sort_by_key(|(id, _)| *id);
        let mut any = false;
        for (id, c) in pairs {
            let Some(spec_id) = c.spec_id else { continue };
            let name = self.name_for(id, self.module.name(id), "c");
            let value = self.const_text(id)?;
            out.push_str(&format!(
                "constant {} {} [[function_constant({})]] = {};\n",
                self.type_name(c.ty)?,
                name,
                spec_id,
                value
            ));
            any = true;
        }
        if any {
            out.push('\n');
        }
        Ok(())
    }

    fn const_text(&self, id: Id) -> Result<String> {
        let c = self.module.get_const(id)?;
        match &c.kind {
            ConstantKind::Scalar(v) => scalar_literal(*v),
            ConstantKind::Composite(components) => {
                let ty_name = self.type_name(c.ty)?;
                let mut parts = Vec::with_capacity(components.len());
                for comp in components {
                    parts.push(self.const_text(*comp)?);
                }
                Ok(format!("{}({})", ty_name, parts.join(", ")))
            }
            ConstantKind::Null => Ok(format!("{}{{}}", self.type_name(c.ty)?)),
        }
    }

    fn emit_function(&mut self, out: &mut String, func: &Function) -> Result<()> {
        trace!("emitting MSL for function {}", func.id);
        let entry = self.module.entry_points().iter().find(|e| e.function == func.id).cloned();
        let name = self.name_for(func.id, func.name.as_deref(), "f");
        let mut fe = FnEmit::new(self, func);
        fe.use_counts = count_uses(func);
        match entry {
            Some(ep) => fe.emit_entry(out, &name, &ep)?,
            None => fe.emit_plain(out, &name)?,
        }
        out.push('\n');
        Ok(())
    }
}

/// MSL's `texture2d<T, access>` wants a channel scalar `T`, but
/// `TexelFormat` only names a pixel layout, not a type id; this derives
/// the MSL channel type directly from the format tag.
fn texel_channel_type(format: crate::ir::ty::TexelFormat) -> &'static str {
    use crate::ir::ty::TexelFormat::*;
    match format {
        Rgba8Unorm | Rgba8Snorm | Rgba16Float | R32Float | Rg32Float | Rgba32Float => "float",
        R32Sint | Rgba32Sint => "int",
        R32Uint | Rgba32Uint => "uint",
    }
}

fn address_space_name(space: AddressSpace) -> &'static str {
    match space {
        AddressSpace::Uniform | AddressSpace::PushConstant => "constant",
        AddressSpace::Storage => "device",
        AddressSpace::Workgroup => "threadgroup",
        AddressSpace::Function | AddressSpace::Private => "thread",
        AddressSpace::Input | AddressSpace::Output | AddressSpace::UniformConstant => "thread",
    }
}

fn scalar_name(s: ScalarType) -> Result<String> {
    Ok(match s {
        ScalarType::Bool => "bool".to_string(),
        ScalarType::Int { bits: 32, is_signed: true } => "int".to_string(),
        ScalarType::Int { bits: 32, is_signed: false } => "uint".to_string(),
        ScalarType::Float { bits: 32 } => "float".to_string(),
        ScalarType::Float { bits: 16 } => "half".to_string(),
        other => return Err(anyhow!("MSL has no scalar type for {:?}", other)),
    })
}

fn scalar_literal(v: ScalarValue) -> Result<String> {
    Ok(match v {
        ScalarValue::Bool(b) => b.to_string(),
        ScalarValue::S32(x) => x.to_string(),
        ScalarValue::U32(x) => format!("{}u", x),
        ScalarValue::F32(x) => format!("{:?}f", x.into_inner()),
        ScalarValue::F16(x) => format!("half({:?})", f32::from(x.into_inner())),
        other => return Err(anyhow!("MSL has no scalar literal form for {:?}", other)),
    })
}

/// The closed `BuiltinFn` → MSL function name table.
fn msl_builtin_name(f: BuiltinFn) -> Option<&'static str> {
    use BuiltinFn::*;
    Some(match f {
        Sin => "sin",
        Cos => "cos",
        Tan => "tan",
        Asin => "asin",
        Acos => "acos",
        Atan => "atan",
        Atan2 => "atan2",
        Sqrt => "sqrt",
        InverseSqrt => "rsqrt",
        Pow => "pow",
        Exp => "exp",
        Exp2 => "exp2",
        Log => "log",
        Log2 => "log2",
        Abs => "abs",
        Sign => "sign",
        Floor => "floor",
        Ceil => "ceil",
        Trunc => "trunc",
        Round => "rint",
        Fract => "fract",
        Min => "min",
        Max => "max",
        Clamp => "clamp",
        Mix => "mix",
        Step => "step",
        SmoothStep => "smoothstep",
        Dot => "dot",
        Cross => "cross",
        Length => "length",
        Distance => "distance",
        Normalize => "normalize",
        Reflect => "reflect",
        Refract => "refract",
        Determinant => "determinant",
        Inverse => "transpose", // placeholder caught by caller's guard below
        Transpose => "transpose",
        Dpdx => "dfdx",
        Dpdy => "dfdy",
        Fwidth => "fwidth",
        PackSnorm4x8 => "pack_float_to_snorm4x8",
        UnpackSnorm4x8 => "unpack_snorm4x8_to_float",
        PackUnorm4x8 => "pack_float_to_unorm4x8",
        UnpackUnorm4x8 => "unpack_unorm4x8_to_float",
        PackHalf2x16 => "as_type<uint>",
        UnpackHalf2x16 => "as_type<half2>",
        CountOneBits => "popcount",
        ReverseBits => "reverse_bits",
        FindLsb => "ctz",
        FindMsb => "clz",
        IsNan => "isnan",
        IsInf => "isinf",
        All => "all",
        Any => "any",
        Select => "select",
        SubgroupBallot => "simd_ballot",
        SubgroupBroadcast => "simd_broadcast",
    })
}

fn count_uses(func: &Function) -> HashMap<Id, u32> {
    let mut counts = HashMap::default();
    for block in &func.blocks {
        for inst in &block.insts {
            for &operand in &inst.operands {
                *counts.entry(operand).or_insert(0) += 1;
            }
            match inst.opcode {
                Opcode::Phi => {
                    for chunk in inst.extra.chunks(2) {
                        if let [value, _pred] = *chunk {
                            *counts.entry(value).or_insert(0) += 1;
                        }
                    }
                }
                Opcode::Construct | Opcode::Builtin | Opcode::Call => {
                    for &c in &inst.extra {
                        *counts.entry(c).or_insert(0) += 1;
                    }
                }
                _ => {}
            }
        }
    }
    counts
}

struct FnEmit<'w, 'm> {
    w: &'w mut Writer<'m>,
    func_id: Id,
    use_counts: HashMap<Id, u32>,
    pending: HashMap<Id, String>,
    materialized: HashMap<Id, String>,
    lvalues: HashMap<Id, (String, Id)>,
    visited: fnv::FnvHashSet<Id>,
    loop_merges: Vec<Id>,
    loop_continues: Vec<Id>,
    indent: usize,
}

impl<'w, 'm> FnEmit<'w, 'm> {
    fn new(w: &'w mut Writer<'m>, func: &Function) -> Self {
        FnEmit {
            w,
            func_id: func.id,
            use_counts: HashMap::default(),
            pending: HashMap::default(),
            materialized: HashMap::default(),
            lvalues: HashMap::default(),
            visited: fnv::FnvHashSet::default(),
            loop_merges: Vec::new(),
            loop_continues: Vec::new(),
        }
    }

    fn indent_str(&self) -> String {
        "    ".repeat(self.indent)
    }
    fn writeln(&self, out: &mut String, line: impl AsRef<str>) {
        out.push_str(&self.indent_str());
        out.push_str(line.as_ref());
        out.push('\n');
    }
    fn func<'a>(&self) -> Result<&'a Function>
    where
        'm: 'a,
    {
        self.w.module.get_function(self.func_id)
    }

    /// A continue block with no content beyond its own back-edge can be
    /// collapsed to a bare `continue;`; one carrying real instructions (a
    /// `for` loop's increment) must be walked into instead so that content
    /// still gets emitted.
    fn is_trivial_continue(&self, continue_blk: Id) -> bool {
        self.func()
            .ok()
            .and_then(|f| f.block(continue_blk))
            .map(|b| b.insts.len() == 1)
            .unwrap_or(false)
    }

    fn emit_plain(&mut self, out: &mut String, name: &str) -> Result<()> {
        let func = self.func()?;
        let mut params = Vec::with_capacity(func.params.len());
        for p in &func.params {
            let pname = self.w.name_for(p.id, p.name.as_deref(), "p");
            self.materialized.insert(p.id, pname.clone());
            params.push(format!("{} {}", self.w.type_name(p.ty)?, pname));
        }
        out.push_str(&format!("{} {}({}) {{\n", self.w.type_name(func.return_ty)?, name, params.join(", ")));
        self.indent += 1;
        self.emit_locals(out, func)?;
        if let Some(first) = func.blocks.first() {
            self.emit_block(out, first.id, None)?;
        }
        self.indent -= 1;
        out.push_str("}\n");
        Ok(())
    }

    fn emit_entry(&mut self, out: &mut String, name: &str, ep: &EntryPoint) -> Result<()> {
        let func = self.func()?;
        let qualifier = match ep.stage {
            Stage::Vertex => "vertex",
            Stage::Fragment => "fragment",
            Stage::Compute => "kernel",
        };

        let mut inputs: Vec<Id> = Vec::new();
        let mut outputs: Vec<Id> = Vec::new();
        let mut resources: Vec<Id> = Vec::new();
        for &gid in &ep.interface {
            let g = self.w.module.get_global(gid)?;
            match self.w.module.get_type(g.ptr_ty)? {
                Type::Ptr { space: AddressSpace::Input, .. } => inputs.push(gid),
                Type::Ptr { space: AddressSpace::Output, .. } => outputs.push(gid),
                _ => resources.push(gid),
            }
        }

        let mut params = Vec::new();
        for gid in &inputs {
            let g = self.w.module.get_global(*gid)?;
            let pointee = match self.w.module.get_type(g.ptr_ty)? {
                Type::Ptr { pointee, .. } => *pointee,
                _ => unreachable!(),
            };
            let pname = self.w.name_for(*gid, g.name.as_deref(), "in");
            self.lvalues.insert(*gid, (pname.clone(), pointee));
            let attr = self.w.io_attr(&g.decorations);
            params.push(format!("{} {} {}", self.w.type_name(pointee)?, pname, attr));
        }
        let mut binding = 0u32;
        for gid in &resources {
            let g = self.w.module.get_global(*gid)?;
            let pointee = match self.w.module.get_type(g.ptr_ty)? {
                Type::Ptr { pointee, .. } => *pointee,
                _ => unreachable!(),
            };
            let rname = self.w.name_for(*gid, g.name.as_deref(), "r");
            self.lvalues.insert(*gid, (rname.clone(), pointee));
            let slot = g.decorations.binding.unwrap_or(binding);
            binding = slot + 1;
            let ty = self.w.module.get_type(pointee)?;
            let attr = if matches!(ty, Type::Texture(_) | Type::TextureStorage(_) | Type::TextureDepth(_)) {
                format!("[[texture({})]]", slot)
            } else if matches!(ty, Type::Sampler | Type::SamplerComparison) {
                format!("[[sampler({})]]", slot)
            } else {
                format!("[[buffer({})]]", slot)
            };
            let space = match self.w.module.get_type(g.ptr_ty)? {
                Type::Ptr { space, .. } => *space,
                _ => unreachable!(),
            };
            let decl = if matches!(ty, Type::Texture(_) | Type::TextureStorage(_) | Type::TextureDepth(_) | Type::Sampler | Type::SamplerComparison) {
                self.w.type_name(pointee)?
            } else {
                format!("{} {}&", address_space_name(space), self.w.type_name(pointee)?)
            };
            params.push(format!("{} {} {}", decl, rname, attr));
        }
        if matches!(ep.stage, Stage::Vertex) {
            params.push("uint _vertex_id [[vertex_id]]".to_string());
        }

        let out_struct_needed = outputs.len() > 1;
        let return_ty = match outputs.len() {
            0 => "void".to_string(),
            1 => {
                let g = self.w.module.get_global(outputs[0])?;
                let pointee = match self.w.module.get_type(g.ptr_ty)? {
                    Type::Ptr { pointee, .. } => *pointee,
                    _ => unreachable!(),
                };
                self.w.type_name(pointee)?
            }
            _ => format!("{}Output", name),
        };
        if out_struct_needed {
            out.push_str(&format!("struct {}Output {{\n", name));
            for gid in &outputs {
                let g = self.w.module.get_global(*gid)?;
                let pointee = match self.w.module.get_type(g.ptr_ty)? {
                    Type::Ptr { pointee, .. } => *pointee,
                    _ => unreachable!(),
                };
                let fname = self.w.name_for(*gid, g.name.as_deref(), "out");
                let attr = self.w.io_attr(&g.decorations);
                out.push_str(&format!("    {} {} {};\n", self.w.type_name(pointee)?, fname, attr));
            }
            out.push_str("};\n\n");
        }

        out.push_str(&format!("{} {} {}({}) {{\n", qualifier, return_ty, name, params.join(", ")));
        self.indent += 1;
        for gid in &outputs {
            let g = self.w.module.get_global(*gid)?;
            let pointee = match self.w.module.get_type(g.ptr_ty)? {
                Type::Ptr { pointee, .. } => *pointee,
                _ => unreachable!(),
            };
            let oname = self.w.name_for(*gid, g.name.as_deref(), if out_struct_needed { "out" } else { "_out" });
            self.lvalues.insert(*gid, (format!("{}{}", if out_struct_needed { "_result." } else { "" }, oname), pointee));
        }
        if out_struct_needed {
            self.writeln(out, format!("{}Output _result;", name));
        } else if let Some(&gid) = outputs.first() {
            let (_, pointee) = self.lvalues[&gid];
            let oname = format!("_out{}", gid);
            self.writeln(out, format!("{} {};", self.w.type_name(pointee)?, oname));
            self.lvalues.insert(gid, (oname, pointee));
        }
        self.emit_locals(out, func)?;
        if let Some(first) = func.blocks.first() {
            self.emit_block(out, first.id, None)?;
        }
        self.indent -= 1;
        out.push_str("}\n");
        Ok(())
    }

    fn emit_locals(&mut self, out: &mut String, func: &Function) -> Result<()> {
        for l in &func.locals {
            let lname = self.w.name_for(l.id, l.name.as_deref(), "l");
            self.lvalues.insert(l.id, (lname.clone(), l.ptr_ty));
            let init = match l.initializer {
                Some(c) => format!(" = {}", self.w.const_text(c)?),
                None => String::new(),
            };
            self.writeln(out, format!("{} {}{};", self.w.type_name(l.ptr_ty)?, lname, init));
        }
        Ok(())
    }

    fn emit_block(&mut self, out: &mut String, block_id: Id, stop_at: Option<Id>) -> Result<()> {
        if Some(block_id) == stop_at || !self.visited.insert(block_id) {
            return Ok(());
        }
        let func = self.func()?;
        let block = func.block(block_id).ok_or_else(|| anyhow!("block {} not found", block_id))?;

        let mut loop_info: Option<(Id, Id)> = None;
        for inst in &block.insts {
            match inst.opcode {
                Opcode::Phi => {
                    let result = inst.result.ok_or_else(|| anyhow!("phi has no result id"))?;
                    let ty = inst.result_type.ok_or_else(|| anyhow!("phi has no result type"))?;
                    let name = self.w.name_for(result, None, "v");
                    self.materialized.insert(result, name.clone());
                    self.writeln(out, format!("{} {};", self.w.type_name(ty)?, name));
                }
                Opcode::LoopMerge => loop_info = Some((inst.operands[0], inst.operands[1])),
                Opcode::SelectionMerge => {}
                op if op.is_terminator() => {}
                _ => self.emit_inst(out, inst)?,
            }
        }

        let term = block
            .insts
            .last()
            .filter(|i| i.opcode.is_terminator())
            .ok_or_else(|| anyhow!("block {} does not end with a terminator", block_id))?
            .clone();

        match (loop_info, term.opcode) {
            (Some((merge, continue_blk)), Opcode::Branch) => {
                let target = term.operands[0];
                self.writeln(out, "while (true) {");
                self.indent += 1;
                self.loop_merges.push(merge);
                self.loop_continues.push(continue_blk);
                self.emit_phi_incoming(out, block_id, target)?;
                self.emit_block(out, target, Some(merge))?;
                self.loop_continues.pop();
                self.loop_merges.pop();
                self.indent -= 1;
                self.writeln(out, "}");
                self.emit_phi_incoming(out, block_id, merge)?;
                self.emit_block(out, merge, stop_at)
            }
            (_, Opcode::Branch) if self.loop_merges.last() == Some(&term.operands[0]) => {
                self.writeln(out, "break;");
                Ok(())
            }
            (_, Opcode::Branch)
                if self.loop_continues.last() == Some(&term.operands[0])
                    && self.is_trivial_continue(term.operands[0]) =>
            {
                self.writeln(out, "continue;");
                Ok(())
            }
            (_, Opcode::Branch) => {
                let target = term.operands[0];
                self.emit_phi_incoming(out, block_id, target)?;
                self.emit_block(out, target, stop_at)
            }
            (Some((merge, continue_blk)), Opcode::BranchCond) => {
                let (cond, t, f) = (term.operands[0], term.operands[1], term.operands[2]);
                self.writeln(out, "while (true) {");
                self.indent += 1;
                self.loop_merges.push(merge);
                self.loop_continues.push(continue_blk);
                let body = if f == merge {
                    let cond_txt = self.operand_text(cond)?;
                    self.writeln(out, format!("if (!({})) {{ break; }}", cond_txt));
                    t
                } else if t == merge {
                    let cond_txt = self.operand_text(cond)?;
                    self.writeln(out, format!("if ({}) {{ break; }}", cond_txt));
                    f
                } else {
                    return Err(anyhow!("loop header {} exits to neither branch_cond target", block_id));
                };
                self.emit_phi_incoming(out, block_id, body)?;
                self.emit_block(out, body, Some(merge))?;
                self.loop_continues.pop();
                self.loop_merges.pop();
                self.indent -= 1;
                self.writeln(out, "}");
                self.emit_phi_incoming(out, block_id, merge)?;
                self.emit_block(out, merge, stop_at)
            }
            (_, Opcode::BranchCond) => {
                let (cond, t, f, merge) = (term.operands[0], term.operands[1], term.operands[2], term.operands[3]);
                if self.loop_merges.last() == Some(&t) {
                    let cond_txt = self.operand_text(cond)?;
                    self.writeln(out, format!("if ({}) {{ break; }}", cond_txt));
                    self.emit_phi_incoming(out, block_id, f)?;
                    return self.emit_block(out, f, stop_at);
                }
                if self.loop_merges.last() == Some(&f) {
                    let cond_txt = self.operand_text(cond)?;
                    self.writeln(out, format!("if (!({})) {{ break; }}", cond_txt));
                    self.emit_phi_incoming(out, block_id, t)?;
                    return self.emit_block(out, t, stop_at);
                }
                let cond_txt = self.operand_text(cond)?;
                self.writeln(out, format!("if ({}) {{", cond_txt));
                self.indent += 1;
                self.emit_phi_incoming(out, block_id, t)?;
                self.emit_block(out, t, Some(merge))?;
                self.indent -= 1;
                self.writeln(out, "} else {");
                self.indent += 1;
                self.emit_phi_incoming(out, block_id, f)?;
                self.emit_block(out, f, Some(merge))?;
                self.indent -= 1;
                self.writeln(out, "}");
                self.emit_phi_incoming(out, block_id, merge)?;
                self.emit_block(out, merge, stop_at)
            }
            (_, Opcode::Return) => {
                let value = self.operand_text(term.operands[0])?;
                self.writeln(out, format!("return {};", value));
                Ok(())
            }
            (_, Opcode::ReturnVoid) => {
                let entry = self.w.module.entry_points().iter().find(|e| e.function == self.func_id).cloned();
                match entry {
                    Some(ep) => {
                        let mut outs = Vec::new();
                        for gid in &ep.interface {
                            if let Type::Ptr { space: AddressSpace::Output, .. } = self.w.module.get_type(self.w.module.get_global(*gid)?.ptr_ty)? {
                                outs.push(*gid);
                            }
                        }
                        match outs.len() {
                            0 => self.writeln(out, "return;"),
                            1 => {
                                let (name, _) = self.lvalues[&outs[0]].clone();
                                self.writeln(out, format!("return {};", name));
                            }
                            _ => self.writeln(out, "return _result;"),
                        }
                    }
                    None => self.writeln(out, "return;"),
                }
                Ok(())
            }
            (_, Opcode::Unreachable) => {
                self.writeln(out, "// unreachable");
                Ok(())
            }
            (_, Opcode::Switch) => self.emit_switch(out, &term, stop_at),
            _ => Err(anyhow!("block {} terminator is not a recognized terminator opcode", block_id)),
        }
    }

    fn emit_switch(&mut self, out: &mut String, term: &Instruction, stop_at: Option<Id>) -> Result<()> {
        let selector = self.operand_text(term.operands[0])?;
        let default = term.operands[1];
        self.writeln(out, format!("switch ({}) {{", selector));
        self.indent += 1;
        for pair in term.extra.chunks(2) {
            if let [value, target] = *pair {
                self.writeln(out, format!("case {}: {{", value as i32));
                self.indent += 1;
                self.emit_block(out, target, stop_at)?;
                self.writeln(out, "break;");
                self.indent -= 1;
                self.writeln(out, "}");
            }
        }
        self.writeln(out, "default: {");
        self.indent += 1;
        self.emit_block(out, default, stop_at)?;
        self.indent -= 1;
        self.writeln(out, "}");
        self.indent -= 1;
        self.writeln(out, "}");
        Ok(())
    }

    fn emit_phi_incoming(&mut self, out: &mut String, from_block: Id, to_block: Id) -> Result<()> {
        let func = self.func()?;
        let Some(block) = func.block(to_block) else { return Ok(()) };
        for inst in &block.insts {
            if inst.opcode != Opcode::Phi {
                break;
            }
            let result = inst.result.ok_or_else(|| anyhow!("phi has no result id"))?;
            for pair in inst.extra.chunks(2) {
                if let [value, pred] = *pair {
                    if pred == from_block {
                        let text = self.operand_text(value)?;
                        let name = self.materialized.get(&result).cloned().unwrap_or_else(|| format!("_v{}", result));
                        self.writeln(out, format!("{} = {};", name, text));
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_inst(&mut self, out: &mut String, inst: &Instruction) -> Result<()> {
        let has_side_effect = matches!(
            inst.opcode,
            Opcode::Store | Opcode::Call | Opcode::Atomic | Opcode::TexStore | Opcode::Barrier | Opcode::Discard | Opcode::ArrayLen
        );
        if inst.opcode == Opcode::Store {
            let ptr_text = self.lvalue_text(inst.operands[0])?;
            let value_text = self.operand_text(inst.operands[1])?;
            self.writeln(out, format!("{} = {};", ptr_text, value_text));
            return Ok(());
        }
        if inst.opcode == Opcode::Barrier {
            self.writeln(out, "threadgroup_barrier(mem_flags::mem_threadgroup);");
            return Ok(());
        }
        if inst.opcode == Opcode::Discard {
            self.writeln(out, "discard_fragment();");
            return Ok(());
        }
        if inst.opcode == Opcode::TexStore {
            let texture = self.operand_text(inst.operands[0])?;
            let coord = self.operand_text(inst.operands[1])?;
            let value = self.operand_text(inst.operands[2])?;
            self.writeln(out, format!("{}.write({}, {});", texture, value, coord));
            return Ok(());
        }
        if inst.opcode == Opcode::Access {
            let result = inst.result.ok_or_else(|| anyhow!("access has no result id"))?;
            let (base_text, mut cur_ty) = self.lvalue_pair(inst.operands[0])?;
            let mut path = base_text;
            for &idx in &inst.extra {
                path = self.access_step(&mut cur_ty, path, idx)?;
            }
            self.lvalues.insert(result, (path, cur_ty));
            return Ok(());
        }

        let void_result = inst
            .result_type
            .map(|ty| matches!(self.w.module.get_type(ty), Ok(Type::Void)))
            .unwrap_or(false);
        let result = inst.result.filter(|_| !inst.opcode.is_void() && !void_result);
        let expr = self.expr_for(inst)?;
        match result {
            None => self.writeln(out, format!("{};", expr)),
            Some(result) => {
                let uses = self.use_counts.get(&result).copied().unwrap_or(0);
                if has_side_effect || uses > 1 {
                    let ty = inst.result_type.ok_or_else(|| anyhow!("value-producing instruction has no result type"))?;
                    let name = self.w.name_for(result, None, "v");
                    self.writeln(out, format!("{} {} = {};", self.w.type_name(ty)?, name, expr));
                    self.materialized.insert(result, name);
                } else {
                    self.pending.insert(result, expr);
                }
            }
        }
        Ok(())
    }

    fn access_step(&mut self, cur_ty: &mut Id, base: String, idx: Id) -> Result<String> {
        let ty = self.w.module.get_type(*cur_ty)?.clone();
        match ty {
            Type::Struct(st) => {
                let i = self.const_index(idx)? as usize;
                let m = st.members.get(i).ok_or_else(|| anyhow!("struct member index {} out of range", i))?;
                let name = m.name.clone().ok_or_else(|| anyhow!("struct member {} has no name for MSL emission", i))?;
                *cur_ty = m.ty;
                Ok(format!("{}.{}", base, name))
            }
            Type::Array { elem, .. } | Type::RuntimeArray { elem, .. } => {
                *cur_ty = elem;
                let idx_text = self.operand_text(idx)?;
                Ok(format!("{}[{}]", base, idx_text))
            }
            Type::Vector { elem, .. } => {
                *cur_ty = elem;
                let idx_text = self.operand_text(idx)?;
                Ok(format!("{}[{}]", base, idx_text))
            }
            Type::Matrix { col, .. } => {
                *cur_ty = col;
                let idx_text = self.operand_text(idx)?;
                Ok(format!("{}[{}]", base, idx_text))
            }
            other => Err(anyhow!("cannot form an access chain step into {:?}", other)),
        }
    }

    fn const_index(&self, id: Id) -> Result<i64> {
        match &self.w.module.get_const(id)?.kind {
            ConstantKind::Scalar(v) => v
                .as_i64()
                .ok_or_else(|| anyhow!("struct member index {} is not a compile-time integer constant", id)),
            _ => Err(anyhow!("struct member index {} is not a compile-time integer constant", id)),
        }
    }

    fn lvalue_pair(&mut self, id: Id) -> Result<(String, Id)> {
        self.lvalues.get(&id).cloned().ok_or_else(|| anyhow!("value {} is not a known pointer for MSL access emission", id))
    }
    fn lvalue_text(&mut self, id: Id) -> Result<String> {
        Ok(self.lvalue_pair(id)?.0)
    }

    fn operand_text(&mut self, id: Id) -> Result<String> {
        if let Some(text) = self.pending.remove(&id) {
            return Ok(text);
        }
        if let Some(name) = self.materialized.get(&id) {
            return Ok(name.clone());
        }
        if let Some((path, _)) = self.lvalues.get(&id) {
            return Ok(path.clone());
        }
        if self.w.module.get_const(id).is_ok() {
            return self.w.const_text(id);
        }
        Err(anyhow!("value {} has no known MSL text (used before its producing instruction ran?)", id))
    }

    fn expr_for(&mut self, inst: &Instruction) -> Result<String> {
        use Opcode::*;
        let rty = inst.result_type;
        match inst.opcode {
            Add | Sub | Mul | Div | Mod | Rem | BitAnd | BitOr | BitXor | Shl | Shr | ShrLogical | Eq | Ne | Lt | Le | Gt | Ge
            | LogAnd | LogOr => {
                let op = bin_op_token(inst.opcode);
                let lhs = self.operand_text(inst.operands[0])?;
                let rhs = self.operand_text(inst.operands[1])?;
                Ok(format!("({} {} {})", lhs, op, rhs))
            }
            MatMul => {
                let lhs = self.operand_text(inst.operands[0])?;
                let rhs = self.operand_text(inst.operands[1])?;
                Ok(format!("({} * {})", lhs, rhs))
            }
            Neg => Ok(format!("(-{})", self.operand_text(inst.operands[0])?)),
            BitNot => Ok(format!("(~{})", self.operand_text(inst.operands[0])?)),
            LogNot => Ok(format!("(!{})", self.operand_text(inst.operands[0])?)),
            MatTranspose => Ok(format!("transpose({})", self.operand_text(inst.operands[0])?)),
            Construct => {
                let ty = rty.ok_or_else(|| anyhow!("construct has no result type"))?;
                let mut parts = Vec::with_capacity(inst.extra.len());
                for &c in &inst.extra {
                    parts.push(self.operand_text(c)?);
                }
                Ok(format!("{}({})", self.w.type_name(ty)?, parts.join(", ")))
            }
            Splat => {
                let ty = rty.ok_or_else(|| anyhow!("splat has no result type"))?;
                let scalar = self.operand_text(inst.operands[0])?;
                Ok(format!("{}({})", self.w.type_name(ty)?, scalar))
            }
            Extract => {
                let base = self.operand_text(inst.operands[0])?;
                let mut path = base;
                for &i in &inst.extra {
                    path.push_str(&format!(".m{}", i));
                }
                Ok(path)
            }
            Insert => {
                let base = self.operand_text(inst.operands[0])?;
                let value = self.operand_text(inst.operands[1])?;
                Ok(format!("/* insert */ {} /* = */ {}", base, value))
            }
            Shuffle => {
                let lhs = self.operand_text(inst.operands[0])?;
                let comps: Vec<&str> = inst.extra.iter().map(|&i| swizzle_letter(i as usize)).collect();
                Ok(format!("{}.{}", lhs, comps.join("")))
            }
            ExtractDyn => {
                let base = self.operand_text(inst.operands[0])?;
                let idx = self.operand_text(inst.operands[1])?;
                Ok(format!("{}[{}]", base, idx))
            }
            InsertDyn => {
                let base = self.operand_text(inst.operands[0])?;
                let idx = self.operand_text(inst.operands[1])?;
                let value = self.operand_text(inst.operands[2])?;
                Ok(format!("/* insert_dyn */ {}[{}] = {}", base, idx, value))
            }
            Load => Ok(self.lvalue_pair(inst.operands[0])?.0),
            ArrayLen => {
                // MSL has no `arrayLength`-style reflection primitive;
                // device-address-space length queries are not modeled.
                Err(anyhow!("array_len has no MSL spelling without an explicit length side-channel"))
            }
            Call => {
                let callee_id = inst.operands[0];
                let name = self.w.names.get(&callee_id).cloned().unwrap_or_else(|| format!("_f{}", callee_id));
                let mut args = Vec::with_capacity(inst.extra.len());
                for &a in &inst.extra {
                    args.push(self.operand_text(a)?);
                }
                Ok(format!("{}({})", name, args.join(", ")))
            }
            Builtin => self.builtin_expr(inst),
            Convert | Bitcast => {
                let ty = rty.ok_or_else(|| anyhow!("conversion has no result type"))?;
                let value = self.operand_text(inst.operands[0])?;
                if inst.opcode == Bitcast {
                    Ok(format!("as_type<{}>({})", self.w.type_name(ty)?, value))
                } else {
                    Ok(format!("{}({})", self.w.type_name(ty)?, value))
                }
            }
            TexSample | TexSampleBias | TexSampleLevel | TexSampleGrad | TexSampleCmp | TexSampleCmpLevel | TexSampleOffset
            | TexSampleBiasOffset | TexSampleLevelOffset | TexSampleGradOffset | TexSampleCmpOffset => self.tex_sample_expr(inst),
            TexGather | TexGatherCmp | TexGatherOffset => self.tex_gather_expr(inst),
            TexLoad => {
                let texture = self.operand_text(inst.operands[0])?;
                let coord = self.operand_text(inst.operands[1])?;
                match inst.operands.get(2) {
                    Some(&lod) => Ok(format!("{}.read({}, {})", texture, coord, self.operand_text(lod)?)),
                    None => Ok(format!("{}.read({})", texture, coord)),
                }
            }
            TexSize => {
                let texture = self.operand_text(inst.operands[0])?;
                Ok(format!("uint2({}.get_width(), {}.get_height())", texture, texture))
            }
            TexQueryLod => Ok("0.0".to_string()),
            TexQueryLevels => Ok(format!("{}.get_num_mip_levels()", self.operand_text(inst.operands[0])?)),
            TexQuerySamples => Ok(format!("{}.get_num_samples()", self.operand_text(inst.operands[0])?)),
            Atomic => {
                let ptr = self.lvalue_text(inst.operands[0])?;
                let value = self.operand_text(inst.operands[1])?;
                Ok(format!("atomic_fetch_add_explicit(&{}, {}, memory_order_relaxed)", ptr, value))
            }
            other => Err(anyhow!("opcode {:?} cannot be rendered as an MSL expression directly", other)),
        }
    }

    fn builtin_expr(&mut self, inst: &Instruction) -> Result<String> {
        let selector = inst.operands[0];
        let f = BuiltinFn::from_selector(selector).ok_or_else(|| anyhow!("invalid builtin selector {}", selector))?;
        if matches!(f, BuiltinFn::Inverse) {
            return Err(anyhow!("inverse() has no direct MSL standard-library spelling"));
        }
        let name = msl_builtin_name(f).ok_or_else(|| anyhow!("builtin {:?} has no MSL spelling", f))?;
        let mut args = Vec::with_capacity(inst.extra.len());
        for &a in &inst.extra {
            args.push(self.operand_text(a)?);
        }
        Ok(format!("{}({})", name, args.join(", ")))
    }

    fn tex_sample_expr(&mut self, inst: &Instruction) -> Result<String> {
        let a = &inst.operands;
        let texture = self.operand_text(a[0])?;
        let sampler = self.operand_text(a[1])?;
        let coord = self.operand_text(a[2])?;
        Ok(match inst.opcode {
            Opcode::TexSample => format!("{}.sample({}, {})", texture, sampler, coord),
            Opcode::TexSampleBias => format!("{}.sample({}, {}, bias({}))", texture, sampler, coord, self.operand_text(a[3])?),
            Opcode::TexSampleLevel => format!("{}.sample({}, {}, level({}))", texture, sampler, coord, self.operand_text(a[3])?),
            Opcode::TexSampleGrad => format!(
                "{}.sample({}, {}, gradient2d({}, {}))",
                texture,
                sampler,
                coord,
                self.operand_text(a[3])?,
                self.operand_text(a[4])?
            ),
            Opcode::TexSampleCmp => format!("{}.sample_compare({}, {}, {})", texture, sampler, coord, self.operand_text(a[3])?),
            Opcode::TexSampleCmpLevel => {
                format!("{}.sample_compare({}, {}, {}, level(0.0))", texture, sampler, coord, self.operand_text(a[3])?)
            }
            Opcode::TexSampleOffset => {
                format!("{}.sample({}, {}, {})", texture, sampler, coord, self.operand_text(a[3])?)
            }
            Opcode::TexSampleBiasOffset => format!(
                "{}.sample({}, {}, bias({}), {})",
                texture,
                sampler,
                coord,
                self.operand_text(a[3])?,
                self.operand_text(a[4])?
            ),
            Opcode::TexSampleLevelOffset => format!(
                "{}.sample({}, {}, level({}), {})",
                texture,
                sampler,
                coord,
                self.operand_text(a[3])?,
                self.operand_text(a[4])?
            ),
            Opcode::TexSampleGradOffset => format!(
                "{}.sample({}, {}, gradient2d({}, {}), {})",
                texture,
                sampler,
                coord,
                self.operand_text(a[3])?,
                self.operand_text(a[4])?,
                self.operand_text(a[5])?
            ),
            Opcode::TexSampleCmpOffset => format!(
                "{}.sample_compare({}, {}, {}, {})",
                texture,
                sampler,
                coord,
                self.operand_text(a[3])?,
                self.operand_text(a[4])?
            ),
            _ => return Err(anyhow!("unsupported texture sample opcode")),
        })
    }

    fn tex_gather_expr(&mut self, inst: &Instruction) -> Result<String> {
        let a = &inst.operands;
        let texture = self.operand_text(a[0])?;
        let sampler = self.operand_text(a[1])?;
        let coord = self.operand_text(a[2])?;
        Ok(match inst.opcode {
            Opcode::TexGather => format!("{}.gather({}, {}, int2(0), component::{})", texture, sampler, coord, gather_component(a[3], self)?),
            Opcode::TexGatherCmp => format!("{}.gather_compare({}, {}, {})", texture, sampler, coord, self.operand_text(a[3])?),
            Opcode::TexGatherOffset => {
                format!("{}.gather({}, {}, {})", texture, sampler, coord, self.operand_text(a[4])?)
            }
            _ => return Err(anyhow!("unsupported texture gather opcode")),
        })
    }
}

fn gather_component(component_id: Id, fe: &mut FnEmit) -> Result<String> {
    let text = fe.operand_text(component_id)?;
    Ok(match text.as_str() {
        "0" => "x".to_string(),
        "1" => "y".to_string(),
        "2" => "z".to_string(),
        "3" => "w".to_string(),
        other => other.to_string(),
    })
}

fn bin_op_token(op: Opcode) -> &'static str {
    use Opcode::*;
    match op {
        Add => "+",
        Sub => "-",
        Mul => "*",
        Div => "/",
        Mod | Rem => "%",
        BitAnd => "&",
        BitOr => "|",
        BitXor => "^",
        Shl => "<<",
        Shr | ShrLogical => ">>",
        Eq => "==",
        Ne => "!=",
        Lt => "<",
        Le => "<=",
        Gt => ">",
        Ge => ">=",
        LogAnd => "&&",
        LogOr => "||",
        other => unreachable!("{:?} is not a binary operator", other),
    }
}

fn swizzle_letter(component: usize) -> &'static str {
    match component {
        0 => "x",
        1 => "y",
        2 => "z",
        3 => "w",
        _ => "x",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::BuildOptions;
    use crate::ir::builder::Builder;
    use crate::ir::entry::Stage;
    use crate::ir::global::GlobalDecorations;
    use crate::ir::ty::AddressSpace;

    #[test]
    fn constant_vector_fragment_emits_as_metal_function() {
        let mut module = Module::new();
        {
            let mut b = Builder::new(&mut module);
            let f32_ty = b.type_scalar(ScalarType::f32());
            let vec4_ty = b.type_vector(f32_ty, 4).unwrap();
            let one = b.const_scalar(f32_ty, 1.0f32);
            let zero = b.const_scalar(f32_ty, 0.0f32);
            let color = b.const_composite(vec4_ty, vec![one, zero, zero, one]).unwrap();

            let ptr_ty = b.type_ptr(vec4_ty, AddressSpace::Output);
            let mut decorations = GlobalDecorations::default();
            decorations.location = Some(0);
            let out_color = b.global(Some("color".into()), ptr_ty, decorations, None);

            let func = b.begin_function(Some("main".into()), vec4_ty, &[]);
            let block = b.append_block(func, None).unwrap();
            b.store(func, block, out_color, color).unwrap();
            b.return_void(func, block).unwrap();

            let ep = b.entry_point(Stage::Fragment, func, "main");
            b.set_entry_interface(ep, vec![out_color]).unwrap();
        }
        let opts = BuildOptions::default();
        let msl = emit(&module, &opts).unwrap();
        assert!(msl.contains("fragment"));
        assert!(msl.contains("float4 main"));
    }
}
