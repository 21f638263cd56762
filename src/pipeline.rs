//! The pass pipeline.
//!
//! Passes form a linear sequence per method; each observes the full output
//! of its predecessor. Methods of a module compile independently and in
//! parallel, and one method's failure does not abort its siblings.

use log::debug;

use crate::error::{CompileError, CompileResult};
use crate::ir::instruction::{DelayKind, InstructionKind};
use crate::ir::method::{Method, Module};
use crate::normalization;
use crate::optimization;

type PassFunction = fn(&mut Method) -> CompileResult<()>;

/// One step of the pipeline.
pub struct Pass {
    pub name: &'static str,
    run: PassFunction,
}

/// The ordered list of passes for the given optimization level.
pub struct Pipeline {
    passes: Vec<Pass>,
}

impl Pipeline {
    pub fn new(optimization_level: u8) -> Self {
        let mut passes: Vec<Pass> = vec![
            Pass {
                name: "EliminatePhiNodes",
                run: normalization::eliminate_phi_nodes,
            },
            Pass {
                name: "LowerMemoryBarriers",
                run: normalization::lower_memory_barriers,
            },
            Pass {
                name: "LowerMemoryAccess",
                run: normalization::lower_memory_access,
            },
        ];
        if optimization_level > 0 {
            passes.push(Pass {
                name: "VectorizeLoops",
                run: |method| optimization::vectorize_loops(method).map(|_| ()),
            });
            passes.push(Pass {
                name: "RemoveConstantLoadInLoops",
                run: |method| optimization::remove_constant_load_in_loops(method).map(|_| ()),
            });
            passes.push(Pass {
                name: "SimplifyConditionalBlocks",
                run: |method| optimization::simplify_conditional_blocks(method).map(|_| ()),
            });
            passes.push(Pass {
                name: "MergeAdjacentBlocks",
                run: |method| optimization::merge_adjacent_blocks(method).map(|_| ()),
            });
            passes.push(Pass {
                name: "ReorderBlocks",
                run: |method| optimization::reorder_blocks(method).map(|_| ()),
            });
            passes.push(Pass {
                name: "CombineSameFlags",
                run: |method| optimization::combine_same_flags(method).map(|_| ()),
            });
            passes.push(Pass {
                name: "RemoveUselessFlags",
                run: |method| optimization::remove_useless_flags(method).map(|_| ()),
            });
        }
        passes.push(Pass {
            name: "AddStartStopSegment",
            run: optimization::add_start_stop_segment,
        });
        passes.push(Pass {
            name: "HandleImmediates",
            run: normalization::handle_immediates,
        });
        passes.push(Pass {
            name: "ExtendBranches",
            run: optimization::extend_branches,
        });
        Pipeline { passes }
    }

    pub fn pass_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.passes.iter().map(|pass| pass.name)
    }

    /// Run all passes on the method, fail-fast, then verify the result.
    pub fn run_on_method(&self, method: &mut Method) -> CompileResult<()> {
        for pass in &self.passes {
            debug!("Running pass {} on method {}", pass.name, method.name);
            (pass.run)(method)?;
        }
        verify_lowered_method(method)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::new(2)
    }
}

/// Structural invariants every fully processed method satisfies.
pub fn verify_lowered_method(method: &Method) -> CompileResult<()> {
    for (block_index, block) in method.blocks().iter().enumerate() {
        let instructions = block.instructions();
        for (index, inst) in instructions.iter().enumerate() {
            match &inst.kind {
                InstructionKind::Memory { .. } => {
                    return Err(CompileError::code_generation(
                        "residual memory instruction after lowering",
                        inst.to_string(),
                    ))
                }
                InstructionKind::MemoryBarrier { .. } => {
                    return Err(CompileError::code_generation(
                        "residual memory barrier after lowering",
                        inst.to_string(),
                    ))
                }
                InstructionKind::LifetimeBoundary { .. } => {
                    return Err(CompileError::code_generation(
                        "residual lifetime boundary after lowering",
                        inst.to_string(),
                    ))
                }
                InstructionKind::Phi { .. } => {
                    return Err(CompileError::code_generation(
                        "residual phi node after lowering",
                        inst.to_string(),
                    ))
                }
                InstructionKind::Branch { .. } => {
                    // every branch carries its three delay slots
                    let delays = instructions
                        .iter()
                        .skip(index + 1)
                        .take(3)
                        .filter(|next| {
                            matches!(
                                next.kind,
                                InstructionKind::Nop {
                                    delay: DelayKind::BranchDelay
                                }
                            )
                        })
                        .count();
                    if delays != 3 {
                        return Err(CompileError::code_generation(
                            format!(
                                "branch in block {} is missing its delay slots",
                                block_index
                            ),
                            inst.to_string(),
                        ));
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Compile every method of the module; failures are collected per method and
/// do not abort the siblings.
pub fn compile_module(module: &mut Module, optimization_level: u8) -> Vec<(String, CompileError)> {
    crate::profile_scope!("CompileModule");
    let mut failures = Vec::new();
    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for method in module.methods.iter_mut() {
            let name = method.name.clone();
            handles.push((
                name,
                scope.spawn(move || {
                    let pipeline = Pipeline::new(optimization_level);
                    pipeline.run_on_method(method)
                }),
            ));
        }
        for (name, handle) in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(error)) => failures.push((name, error)),
                Err(_) => failures.push((
                    name,
                    CompileError::internal("compilation thread panicked"),
                )),
            }
        }
    });
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::{BranchCondition, Instruction};
    use crate::ir::method::method_with_entry_block;
    use crate::ir::value::BOOL_TRUE;

    #[test]
    fn verification_rejects_branch_without_delay_slots() {
        let mut method = method_with_entry_block("verify");
        let target = method.create_block("%target");
        let label = method.blocks()[target].label().clone();
        method.append_to_block(
            0,
            Instruction::branch(label, BranchCondition::Always, BOOL_TRUE),
        );
        assert!(verify_lowered_method(&method).is_err());
    }

    #[test]
    fn pipeline_produces_delay_slots() {
        let mut method = method_with_entry_block("verify");
        let target = method.create_block("%target");
        let label = method.blocks()[target].label().clone();
        method.append_to_block(
            0,
            Instruction::branch(label, BranchCondition::Always, BOOL_TRUE),
        );
        let pipeline = Pipeline::new(0);
        pipeline.run_on_method(&mut method).unwrap();
        assert!(verify_lowered_method(&method).is_ok());
    }
}
