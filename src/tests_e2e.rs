//! End-to-end scenarios S1-S6 (spec.md §8 "Testable properties"). Each
//! test parses real shader source through a front-end, checks the
//! resulting IR shape, and where the scenario names a SPIR-V detail also
//! emits through `back::spv` and scans the raw word stream for it.
use crate::back::spv;
use crate::front::{glsl, wgsl, BuildOptions};
use crate::ir::entry::Stage;
use crate::ir::inst::Opcode;
use crate::ir::ty::{AddressSpace, Type};
use crate::validate;

fn opts() -> BuildOptions {
    BuildOptions::default()
}

/// Scans a SPIR-V word stream for an instruction with the given opcode,
/// returning its operand words (the instruction minus its header word).
fn find_op(words: &[u32], op: spirv::Op) -> Option<&[u32]> {
    let mut i = 5; // skip the 5-word header (magic, version, generator, bound, schema)
    while i < words.len() {
        let header = words[i];
        let wc = (header >> 16) as usize;
        if wc == 0 {
            break;
        }
        if (header & 0xffff) == op as u32 {
            return Some(&words[i + 1..i + wc]);
        }
        i += wc;
    }
    None
}

fn op_sequence(words: &[u32], ops: &[spirv::Op]) -> bool {
    let mut i = 5;
    let mut next = 0;
    while i < words.len() && next < ops.len() {
        let header = words[i];
        let wc = (header >> 16) as usize;
        if wc == 0 {
            break;
        }
        if (header & 0xffff) == ops[next] as u32 {
            next += 1;
        }
        i += wc;
    }
    next == ops.len()
}

#[test]
fn s1_constant_vector_fragment() {
    let src = "@fragment fn main() -> @location(0) vec4<f32> { return vec4<f32>(1.0, 0.0, 0.0, 1.0); }";
    let module = wgsl::parse(src, &opts()).expect("parses");
    assert!(validate::validate(&module).is_empty());

    assert_eq!(module.entry_points().len(), 1);
    let ep = &module.entry_points()[0];
    assert_eq!(ep.stage, Stage::Fragment);
    assert!(ep.flags.origin_upper_left);

    let outputs: Vec<_> = module
        .globals()
        .filter(|g| g.decorations.location == Some(0))
        .collect();
    assert_eq!(outputs.len(), 1);
    let out_ty = module.get_type(outputs[0].ptr_ty).unwrap();
    let (pointee, space) = out_ty.as_ptr().unwrap();
    assert_eq!(space, AddressSpace::Output);
    assert!(matches!(module.get_type(pointee).unwrap(), Type::Vector { size: 4, .. }));

    let words = spv::emit(&module, &opts()).expect("emits spv");
    assert!(find_op(&words, spirv::Op::ExecutionMode)
        .map(|ops| ops.contains(&(spirv::ExecutionMode::OriginUpperLeft as u32)))
        .unwrap_or(false));
    assert!(find_op(&words, spirv::Op::Decorate).is_some());
}

#[test]
fn s2_uniform_buffer_access() {
    let src = "struct U { m: mat4x4<f32>, v: vec4<f32> }\n\
               @group(0) @binding(0) var<uniform> u: U;\n\
               @vertex fn main(@location(0) p: vec4<f32>) -> @builtin(position) vec4<f32> {\n\
               return u.m * p + u.v;\n}";
    let module = wgsl::parse(src, &opts()).expect("parses");
    assert!(validate::validate(&module).is_empty());

    let u_global = module
        .globals()
        .find(|g| g.decorations.group == Some(0) && g.decorations.binding == Some(0))
        .expect("uniform global");
    let (struct_ty_id, space) = module.get_type(u_global.ptr_ty).unwrap().as_ptr().unwrap();
    assert_eq!(space, AddressSpace::Uniform);
    let s = match module.get_type(struct_ty_id).unwrap() {
        Type::Struct(s) => s,
        other => panic!("expected struct, got {:?}", other),
    };
    assert_eq!(s.members.len(), 2);
    assert_eq!(s.members[0].offset, Some(0));
    assert_eq!(s.members[1].offset, Some(64));

    let input = module
        .globals()
        .find(|g| g.decorations.location == Some(0))
        .expect("location(0) input");
    assert_eq!(module.get_type(input.ptr_ty).unwrap().as_ptr().unwrap().1, AddressSpace::Input);

    let ep = &module.entry_points()[0];
    assert_eq!(ep.stage, Stage::Vertex);

    let func = module.get_function(ep.function).unwrap();
    let insts: Vec<Opcode> = func.blocks.iter().flat_map(|b| b.insts.iter().map(|i| i.opcode)).collect();
    assert!(insts.contains(&Opcode::MatMul));
    assert!(insts.contains(&Opcode::Add));
}

#[test]
fn s3_compute_workgroup_barrier() {
    let src = "@group(0) @binding(0) var<storage, read_write> buf: array<u32>;\n\
               var<workgroup> tmp: array<u32, 64>;\n\
               @compute @workgroup_size(64) fn main(@builtin(local_invocation_id) lid: vec3<u32>) {\n\
               tmp[lid.x] = buf[lid.x]; workgroupBarrier(); buf[lid.x] = tmp[lid.x] + 1u;\n}";
    let module = wgsl::parse(src, &opts()).expect("parses");
    assert!(validate::validate(&module).is_empty());

    let ep = &module.entry_points()[0];
    assert_eq!(ep.stage, Stage::Compute);
    assert_eq!(ep.workgroup_size, [64, 1, 1]);

    let func = module.get_function(ep.function).unwrap();
    let insts: Vec<&Opcode> = func.blocks.iter().flat_map(|b| b.insts.iter().map(|i| &i.opcode)).collect();
    let access_count = insts.iter().filter(|o| ***o == Opcode::Access).count();
    assert!(access_count >= 2, "expected at least two access chains into buf/tmp, got {}", access_count);
    let barrier_pos = insts.iter().position(|o| ***o == Opcode::Barrier);
    assert!(barrier_pos.is_some(), "expected a barrier instruction");

    let load_count = insts.iter().filter(|o| ***o == Opcode::Load).count();
    assert!(load_count >= 2);
}

#[test]
fn s4_control_flow_lowering() {
    let src = "@fragment fn main() -> @location(0) vec4<f32> {\n\
               var x: f32 = -1.0; var y: f32;\n\
               if (x < 0.0) { y = -x; } else { y = x; }\n\
               return vec4<f32>(y, y, y, 1.0);\n}";
    let module = wgsl::parse(src, &opts()).expect("parses");
    assert!(validate::validate(&module).is_empty());

    let ep = &module.entry_points()[0];
    let func = module.get_function(ep.function).unwrap();

    let cond_block = func
        .blocks
        .iter()
        .find(|b| matches!(b.terminator().map(|i| i.opcode), Some(Opcode::BranchCond)))
        .expect("a block ending in branch_cond");
    let cond_inst = cond_block.terminator().unwrap();
    // branch_cond operands: [cond, true_block, false_block, merge_block]
    assert_eq!(cond_inst.operands.len(), 4);
    let (true_blk, false_blk, merge_blk) = (cond_inst.operands[1], cond_inst.operands[2], cond_inst.operands[3]);

    for target in [true_blk, false_blk] {
        let b = func.block(target).expect("branch target block exists");
        assert!(!b.insts.is_empty(), "branch target block must be non-empty");
        assert_eq!(b.terminator().map(|i| i.opcode), Some(Opcode::Branch));
        assert_eq!(b.terminator().unwrap().operands, vec![merge_blk]);
    }

    let merge = func.block(merge_blk).expect("merge block exists");
    assert!(func.block_index(merge.id).unwrap() > func.block_index(cond_block.id).unwrap());
}

#[test]
fn s5_texture_sample() {
    let src = "@group(0) @binding(0) var tex: texture_2d<f32>;\n\
               @group(0) @binding(1) var samp: sampler;\n\
               @fragment fn main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {\n\
               return textureSample(tex, samp, uv);\n}";
    let module = wgsl::parse(src, &opts()).expect("parses");
    assert!(validate::validate(&module).is_empty());

    let ep = &module.entry_points()[0];
    let func = module.get_function(ep.function).unwrap();
    let sample_inst = func
        .blocks
        .iter()
        .flat_map(|b| &b.insts)
        .find(|i| i.opcode == Opcode::TexSample)
        .expect("a tex_sample instruction");
    let result_ty = module.get_type(sample_inst.result_type.unwrap()).unwrap();
    assert!(matches!(result_ty, Type::Vector { size: 4, .. }));

    let words = spv::emit(&module, &opts()).expect("emits spv");
    assert!(op_sequence(&words, &[spirv::Op::SampledImage, spirv::Op::ImageSampleImplicitLod]));
}

#[test]
fn loop_with_conditional_break_and_continue_lowers_and_re_emits() {
    // Not one of spec.md's named scenarios, but exercises the same
    // `loop_merge`/continue-block protocol with an early exit, which none
    // of S1-S6 touch: a conditional `break` nested inside an `if` with no
    // `else` (so the `if`'s own merge block is distinct from the loop's),
    // and a `continue` that skips the rest of an iteration.
    let src = "@fragment fn main() -> @location(0) vec4<f32> {\n\
               var i: i32 = 0;\n\
               var sum: f32 = 0.0;\n\
               loop {\n\
                 i = i + 1;\n\
                 if (i == 2) { continue; }\n\
                 if (i >= 4) { break; }\n\
                 sum = sum + 1.0;\n\
               }\n\
               return vec4<f32>(sum, sum, sum, 1.0);\n}";
    let module = wgsl::parse(src, &opts()).expect("parses");
    let diags = validate::validate(&module);
    assert!(diags.is_empty(), "unexpected validation diagnostics: {:?}", diags);

    let ep = &module.entry_points()[0];
    let func = module.get_function(ep.function).unwrap();
    assert!(func.blocks.iter().any(|b| matches!(b.terminator().map(|i| i.opcode), Some(Opcode::LoopMerge))));

    let wgsl_out = crate::back::wgsl::emit(&module, &opts()).expect("emits wgsl");
    assert!(wgsl_out.contains("break;"));
    assert!(wgsl_out.contains("continue;"));
    // Re-lowering the re-emitted source must still validate clean.
    let module2 = wgsl::parse(&wgsl_out, &opts()).expect("re-parses its own output");
    assert!(validate::validate(&module2).is_empty());

    let msl_out = crate::back::msl::emit(&module, &opts()).expect("emits msl");
    assert!(msl_out.contains("break;"));
    assert!(msl_out.contains("continue;"));
}

#[test]
fn for_loop_header_reconstructs_and_re_emits() {
    // Not one of spec.md's named scenarios: exercises the `loop_merge`
    // immediately followed by `branch_cond` shape every `while`/`for`
    // header produces, distinct from `loop_with_conditional_break_and_
    // continue_lowers_and_re_emits` above (which uses `Stmt::Loop`, whose
    // header ends in a bare `Branch`). The increment must show up exactly
    // once per text back-end: dropped entirely, or duplicated, are both
    // bugs this guards against.
    let src = "@fragment fn main() -> @location(0) vec4<f32> {\n\
               var sum: f32 = 0.0;\n\
               for (var i: i32 = 0; i < 5; i = i + 1) {\n\
                 sum = sum + 1.0;\n\
               }\n\
               return vec4<f32>(sum, sum, sum, 1.0);\n}";
    let module = wgsl::parse(src, &opts()).expect("parses");
    let diags = validate::validate(&module);
    assert!(diags.is_empty(), "unexpected validation diagnostics: {:?}", diags);

    let ep = &module.entry_points()[0];
    let func = module.get_function(ep.function).unwrap();
    assert!(func.blocks.iter().any(|b| matches!(b.terminator().map(|i| i.opcode), Some(Opcode::LoopMerge))));

    let wgsl_out = crate::back::wgsl::emit(&module, &opts()).expect("emits wgsl");
    assert!(wgsl_out.contains("loop {"));
    assert!(wgsl_out.contains("break;"));
    assert_eq!(wgsl_out.matches("i = i + 1").count(), 1);
    let module2 = wgsl::parse(&wgsl_out, &opts()).expect("re-parses its own output");
    assert!(validate::validate(&module2).is_empty());
    let func2 = module2.get_function(module2.entry_points()[0].function).unwrap();
    assert!(func2.blocks.iter().any(|b| matches!(b.terminator().map(|i| i.opcode), Some(Opcode::LoopMerge))));

    let msl_out = crate::back::msl::emit(&module, &opts()).expect("emits msl");
    assert!(msl_out.contains("while (true)"));
    assert!(msl_out.contains("break;"));
    assert_eq!(msl_out.matches("i = i + 1").count(), 1);
}

#[test]
fn s6_glsl_interface_block_round_trip() {
    let src = "layout(set=1, binding=2) uniform Params { vec4 color; float k; } params;\n\
               void main() {}";
    let module = glsl::parse(src, Stage::Fragment, &opts()).expect("parses");
    assert!(validate::validate(&module).is_empty());

    let global = module
        .globals()
        .find(|g| g.name.as_deref() == Some("params"))
        .expect("global named params");
    assert_eq!(global.decorations.group, Some(1));
    assert_eq!(global.decorations.binding, Some(2));

    let (struct_ty_id, space) = module.get_type(global.ptr_ty).unwrap().as_ptr().unwrap();
    assert_eq!(space, AddressSpace::Uniform);
    let s = match module.get_type(struct_ty_id).unwrap() {
        Type::Struct(s) => s,
        other => panic!("expected struct, got {:?}", other),
    };
    assert_eq!(s.name.as_deref(), Some("Params"));
    assert_eq!(s.members.len(), 2);
    assert_eq!(s.members[0].offset, Some(0));
    assert_eq!(s.members[1].offset, Some(16));
}
