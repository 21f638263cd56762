//! Control-flow graph and natural-loop detection.

use std::collections::HashSet;

use crate::ir::instruction::{ConditionCode, InstId, InstructionKind};
use crate::ir::method::Method;
use crate::ir::walker::InstructionWalker;

use super::graph::{Directionality, Graph};

/// Edge payload: the branch creating the edge, or none for fall-through.
#[derive(Clone, Debug)]
pub struct CfgEdge {
    /// The branch instruction in the predecessor, `None` for implicit
    /// fall-through edges.
    pub branch: Option<InstId>,
    pub fall_through: bool,
}

impl CfgEdge {
    pub fn is_implicit(&self) -> bool {
        self.fall_through
    }
}

/// The control-flow graph of a method; nodes are block layout indices, valid
/// for the structure version the graph was created at.
pub struct ControlFlowGraph {
    graph: Graph<usize, (), CfgEdge>,
    structure_version: u64,
}

impl ControlFlowGraph {
    pub fn create(method: &Method) -> Self {
        let mut graph = Graph::new(Directionality::Directed);
        for index in 0..method.blocks().len() {
            graph.get_or_create_node(index, || ());
        }
        for (index, block) in method.blocks().iter().enumerate() {
            let mut unconditional_branch = false;
            for inst in block.instructions() {
                if let InstructionKind::Branch { target, .. } = &inst.kind {
                    if let Some(target_index) = method.block_index_by_label(target.id) {
                        graph.add_edge(
                            index,
                            target_index,
                            CfgEdge {
                                branch: Some(inst.id),
                                fall_through: false,
                            },
                        );
                    }
                    if inst.condition == ConditionCode::Always {
                        unconditional_branch = true;
                    }
                }
            }
            if !unconditional_branch && index + 1 < method.blocks().len() {
                graph.add_edge(
                    index,
                    index + 1,
                    CfgEdge {
                        branch: None,
                        fall_through: true,
                    },
                );
            }
        }
        ControlFlowGraph {
            graph,
            structure_version: method.structure_version(),
        }
    }

    pub fn is_current(&self, method: &Method) -> bool {
        self.structure_version == method.structure_version()
    }

    pub fn successors(&self, block: usize) -> impl Iterator<Item = (usize, &CfgEdge)> + '_ {
        self.graph.successors(block)
    }

    pub fn predecessors(&self, block: usize) -> impl Iterator<Item = (usize, &CfgEdge)> + '_ {
        self.graph.predecessors(block)
    }

    pub fn single_successor(&self, block: usize) -> Option<usize> {
        self.graph.single_successor(block)
    }

    pub fn single_predecessor(&self, block: usize) -> Option<usize> {
        self.graph.single_predecessor(block)
    }

    pub fn num_successors(&self, block: usize) -> usize {
        self.graph.num_successors(block)
    }

    pub fn num_predecessors(&self, block: usize) -> usize {
        self.graph.num_predecessors(block)
    }

    /// Detect all natural loops via depth-first back-edge identification.
    pub fn find_loops(&self, method: &Method) -> Vec<ControlFlowLoop> {
        let mut loops = Vec::new();
        if method.blocks().is_empty() {
            return loops;
        }
        let mut visited = HashSet::new();
        // (block, path up to and including block)
        let mut stack: Vec<(usize, Vec<usize>)> = vec![(0, vec![0])];
        let mut seen_back_edges = HashSet::new();
        while let Some((block, path)) = stack.pop() {
            for (succ, _) in self.graph.successors(block) {
                if let Some(pos) = path.iter().position(|b| *b == succ) {
                    // back edge: the loop spans from the header to the latch
                    if seen_back_edges.insert((block, succ)) {
                        loops.push(ControlFlowLoop {
                            nodes: path[pos..].to_vec(),
                        });
                    }
                } else if visited.insert((block, succ)) {
                    let mut next_path = path.clone();
                    next_path.push(succ);
                    stack.push((succ, next_path));
                }
            }
        }
        loops
    }
}

/// An ordered set of CFG nodes with a back-edge; the front is the header, the
/// back the latch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlFlowLoop {
    pub nodes: Vec<usize>,
}

impl ControlFlowLoop {
    pub fn header(&self) -> usize {
        self.nodes[0]
    }

    pub fn latch(&self) -> usize {
        *self.nodes.last().unwrap()
    }

    pub fn contains_block(&self, block: usize) -> bool {
        self.nodes.contains(&block)
    }

    /// Whether this loop contains all nodes of `other` (and is larger).
    pub fn includes(&self, other: &ControlFlowLoop) -> bool {
        self.nodes.len() > other.nodes.len()
            && other.nodes.iter().all(|node| self.nodes.contains(node))
    }

    /// Find the position of an instruction within the loop's blocks.
    pub fn find_in_loop(&self, method: &Method, inst: InstId) -> Option<InstructionWalker> {
        for &block in &self.nodes {
            for (index, candidate) in method.block(block).instructions().iter().enumerate() {
                if candidate.id == inst {
                    return Some(InstructionWalker::new(block, index));
                }
            }
        }
        None
    }

    /// The block preceding the loop: a predecessor of the header outside the
    /// loop.
    pub fn find_predecessor(&self, cfg: &ControlFlowGraph) -> Option<usize> {
        let mut found = None;
        for (pred, _) in cfg.predecessors(self.header()) {
            if !self.contains_block(pred) {
                if found.is_some() {
                    return None;
                }
                found = Some(pred);
            }
        }
        found
    }

    /// Total number of instructions over all blocks of the loop.
    pub fn instruction_count(&self, method: &Method) -> usize {
        self.nodes
            .iter()
            .map(|&block| method.block(block).size())
            .sum()
    }
}

/// Tree of which loops contain which, one edge from each loop to the
/// smallest loop properly including it.
pub struct LoopInclusionTree {
    graph: Graph<usize, (), ()>,
}

impl LoopInclusionTree {
    pub fn create(loops: &[ControlFlowLoop]) -> Self {
        let mut graph: Graph<usize, (), ()> = Graph::new(Directionality::Directed);
        for index in 0..loops.len() {
            graph.get_or_create_node(index, || ());
        }
        for (child_idx, child) in loops.iter().enumerate() {
            let mut best: Option<usize> = None;
            for (parent_idx, parent) in loops.iter().enumerate() {
                if parent_idx != child_idx && parent.includes(child) {
                    let better = match best {
                        Some(current) => parent.nodes.len() < loops[current].nodes.len(),
                        None => true,
                    };
                    if better {
                        best = Some(parent_idx);
                    }
                }
            }
            if let Some(parent) = best {
                graph.add_edge(parent, child_idx, ());
            }
        }
        LoopInclusionTree { graph }
    }

    /// The outermost loop containing the given loop (possibly itself).
    pub fn find_root(&self, mut index: usize) -> usize {
        while let Some(parent) = self.graph.single_predecessor(index) {
            index = parent;
        }
        index
    }

    pub fn parent(&self, index: usize) -> Option<usize> {
        self.graph.single_predecessor(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::{BranchCondition, Instruction};
    use crate::ir::method::method_with_entry_block;
    use crate::ir::value::BOOL_TRUE;

    /// entry -> loop_header <-> loop_body, loop_header -> exit
    fn build_loop_method() -> Method {
        let mut method = method_with_entry_block("loop");
        let header = method.create_block("%header");
        let body = method.create_block("%body");
        let exit = method.create_block("%exit");
        let header_label = method.blocks()[header].label().clone();
        let body_label = method.blocks()[body].label().clone();
        // header conditionally branches into the body, falls through to exit
        method.append_to_block(
            header,
            Instruction::branch(body_label, BranchCondition::ZeroSet, BOOL_TRUE),
        );
        // body jumps back to the header
        method.append_to_block(
            body,
            Instruction::branch(header_label, BranchCondition::Always, BOOL_TRUE),
        );
        let _ = exit;
        method
    }

    #[test]
    fn finds_natural_loop() {
        let method = build_loop_method();
        let cfg = ControlFlowGraph::create(&method);
        let loops = cfg.find_loops(&method);
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].header(), 1);
        assert_eq!(loops[0].latch(), 2);
    }

    #[test]
    fn loop_predecessor_is_entry() {
        let method = build_loop_method();
        let cfg = ControlFlowGraph::create(&method);
        let loops = cfg.find_loops(&method);
        assert_eq!(loops[0].find_predecessor(&cfg), Some(0));
    }

    #[test]
    fn fall_through_edges_are_implicit() {
        let method = build_loop_method();
        let cfg = ControlFlowGraph::create(&method);
        // entry falls through into the header
        let edge = cfg
            .successors(0)
            .find(|(succ, _)| *succ == 1)
            .map(|(_, e)| e.clone())
            .unwrap();
        assert!(edge.is_implicit());
        // the back edge from the body is explicit
        let back = cfg
            .successors(2)
            .find(|(succ, _)| *succ == 1)
            .map(|(_, e)| e.clone())
            .unwrap();
        assert!(!back.is_implicit());
    }
}
