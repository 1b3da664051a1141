//! Structural validation (spec.md §4.3, C4). Informative only: unlike the
//! builder, which rejects impossible construction as it happens, this
//! walks a finished module and reports everything wrong with it at once.
//! Grounded in the diagnostic-collection shape of the teacher's
//! `ReflectIntermediate`, which accumulates over one pass rather than
//! failing fast.
use fnv::FnvHashSet as HashSet;

use crate::error::{DiagCode, Span};
use crate::ir::inst::Opcode;
use crate::ir::ty::Type;
use crate::ir::{Id, Module};

/// One structural finding, carrying enough context to locate it without
/// re-walking the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationDiag {
    pub code: DiagCode,
    pub message: String,
    pub func_id: Option<Id>,
    pub block_id: Option<Id>,
    pub inst_index: Option<usize>,
    pub span: Option<Span>,
}
impl ValidationDiag {
    fn new(code: DiagCode, message: impl Into<String>) -> Self {
        ValidationDiag {
            code,
            message: message.into(),
            func_id: None,
            block_id: None,
            inst_index: None,
            span: None,
        }
    }
    fn at(mut self, func: Id, block: Id, inst_index: Option<usize>) -> Self {
        self.func_id = Some(func);
        self.block_id = Some(block);
        self.inst_index = inst_index;
        self
    }
}

/// Runs every structural check spec.md §4.3 names and returns every
/// finding; an empty result means the module is structurally sound
/// (not that it is semantically correct -- the validator never checks
/// that, by design).
pub fn validate(module: &Module) -> Vec<ValidationDiag> {
    let mut diags = Vec::new();
    for func in module.functions() {
        if func.blocks.is_empty() {
            diags.push(
                ValidationDiag::new(
                    DiagCode::Structural,
                    format!("function {} has no blocks", func.id),
                )
                .at(func.id, 0, None),
            );
            continue;
        }
        let block_ids: HashSet<Id> = func.blocks.iter().map(|b| b.id).collect();
        // predecessor map: block -> set of blocks that branch to it.
        let mut preds: fnv::FnvHashMap<Id, HashSet<Id>> = fnv::FnvHashMap::default();
        for block in &func.blocks {
            for target in branch_targets(&block.insts) {
                preds.entry(target).or_default().insert(block.id);
            }
        }

        for block in &func.blocks {
            if block.insts.is_empty() {
                diags.push(
                    ValidationDiag::new(
                        DiagCode::Structural,
                        format!("block {} has no instructions", block.id),
                    )
                    .at(func.id, block.id, None),
                );
                continue;
            }
            let last = block.insts.len() - 1;
            if !block.insts[last].opcode.is_terminator() {
                diags.push(
                    ValidationDiag::new(
                        DiagCode::Structural,
                        format!("block {} does not end with a terminator", block.id),
                    )
                    .at(func.id, block.id, Some(last)),
                );
            }
            for (i, inst) in block.insts.iter().enumerate() {
                if i != last && inst.opcode.is_terminator() {
                    diags.push(
                        ValidationDiag::new(
                            DiagCode::Structural,
                            format!("instruction {} follows a terminator mid-block", i),
                        )
                        .at(func.id, block.id, Some(i)),
                    );
                }
                if inst.opcode == Opcode::Phi {
                    if i > 0 && block.insts[i - 1].opcode != Opcode::Phi {
                        diags.push(
                            ValidationDiag::new(
                                DiagCode::Structural,
                                "phi does not appear contiguously at block start",
                            )
                            .at(func.id, block.id, Some(i)),
                        );
                    }
                    if inst.extra.len() % 2 != 0 {
                        diags.push(
                            ValidationDiag::new(DiagCode::Structural, "phi incoming list has odd length")
                                .at(func.id, block.id, Some(i)),
                        );
                    }
                    let empty = HashSet::default();
                    let actual_preds = preds.get(&block.id).unwrap_or(&empty);
                    for pair in inst.extra.chunks(2) {
                        if let [_, pred] = *pair {
                            if !block_ids.contains(&pred) {
                                diags.push(
                                    ValidationDiag::new(
                                        DiagCode::Structural,
                                        format!("phi incoming names non-existent block {}", pred),
                                    )
                                    .at(func.id, block.id, Some(i)),
                                );
                            } else if !actual_preds.contains(&pred) {
                                diags.push(
                                    ValidationDiag::new(
                                        DiagCode::Structural,
                                        format!("phi incoming block {} does not branch to {}", pred, block.id),
                                    )
                                    .at(func.id, block.id, Some(i)),
                                );
                            }
                        }
                    }
                }
                if inst.opcode == Opcode::Switch && inst.extra.len() % 2 != 0 {
                    diags.push(
                        ValidationDiag::new(DiagCode::Structural, "switch case list has odd length")
                            .at(func.id, block.id, Some(i)),
                    );
                }
                if inst.opcode == Opcode::Load {
                    if let (Some(ptr), Some(result_ty)) = (inst.operands.first(), inst.result_type) {
                        check_load_type(module, func.id, block.id, i, *ptr, result_ty, &mut diags);
                    }
                }
            }
        }
    }

    for (index, ep) in module.entry_points().iter().enumerate() {
        if module.get_function(ep.function).is_err() {
            diags.push(ValidationDiag::new(
                DiagCode::Structural,
                format!("entry point #{} references non-existent function {}", index, ep.function),
            ));
        }
        if ep.stage == crate::ir::entry::Stage::Compute
            && (ep.workgroup_size[0] == 0 || ep.workgroup_size[1] == 0 || ep.workgroup_size[2] == 0)
        {
            diags.push(ValidationDiag::new(
                DiagCode::Structural,
                format!("compute entry point '{}' has a zero workgroup size axis", ep.name),
            ));
        }
    }

    diags
}

fn branch_targets(insts: &[crate::ir::inst::Instruction]) -> Vec<Id> {
    match insts.last() {
        Some(inst) if inst.opcode == Opcode::Branch => vec![inst.operands[0]],
        Some(inst) if inst.opcode == Opcode::BranchCond => {
            vec![inst.operands[1], inst.operands[2], inst.operands[3]]
        }
        Some(inst) if inst.opcode == Opcode::Switch => {
            let mut targets = vec![inst.operands[1]];
            targets.extend(inst.extra.iter().skip(1).step_by(2).copied());
            targets
        }
        _ => Vec::new(),
    }
}

fn check_load_type(
    module: &Module,
    func: Id,
    block: Id,
    inst_index: usize,
    ptr: Id,
    result_ty: Id,
    diags: &mut Vec<ValidationDiag>,
) {
    // `ptr` here is a value id, not a type id; type consistency can only
    // be checked against the *declared* result type of the instruction
    // that produced it, so this best-effort check looks up `ptr`'s
    // producing instruction's result_type within the same block.
    let producing_ty = find_result_type(module, func, ptr);
    if let Some(Type::Ptr { pointee, .. }) = producing_ty.and_then(|t| module.get_type(t).ok()).cloned() {
        if pointee != result_ty {
            diags.push(
                ValidationDiag::new(
                    DiagCode::Structural,
                    format!("load result type {} does not match pointee type {}", result_ty, pointee),
                )
                .at(func, block, Some(inst_index)),
            );
        }
    }
}

fn find_result_type(module: &Module, func: Id, value: Id) -> Option<Id> {
    let f = module.get_function(func).ok()?;
    for block in &f.blocks {
        for inst in &block.insts {
            if inst.result == Some(value) {
                return inst.result_type;
            }
        }
    }
    for param in &f.params {
        if param.id == value {
            return None;
        }
    }
    None
}
