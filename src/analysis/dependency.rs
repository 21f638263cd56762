//! Data-dependency graph between basic blocks.
//!
//! One node per block; a directed edge carries, per local, the kinds of
//! dependency the successor block has on the predecessor.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::ir::instruction::Decorations;
use crate::ir::local::LocalId;
use crate::ir::method::Method;

use super::graph::{Directionality, Graph};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct DependencyKind: u8 {
        /// Value written in the predecessor is read in the successor.
        const FLOW = 1 << 0;
        /// The flow stems from a phi-node move.
        const PHI = 1 << 1;
        /// Value read in the predecessor is overwritten in the successor.
        const ANTI = 1 << 2;
        /// Both blocks write the value.
        const OUTPUT = 1 << 3;
    }
}

pub type DependencyEdge = HashMap<LocalId, DependencyKind>;

/// Per-method data-dependency graph, nodes keyed by block layout index.
pub struct DataDependencyGraph {
    graph: Graph<usize, (), DependencyEdge>,
}

impl DataDependencyGraph {
    pub fn create(method: &Method) -> Self {
        let mut graph: Graph<usize, (), DependencyEdge> = Graph::new(Directionality::Directed);
        for index in 0..method.blocks().len() {
            graph.get_or_create_node(index, || ());
        }

        // per block: which locals it reads and writes, and whether a write
        // stems from a phi-node move
        let num_blocks = method.blocks().len();
        let mut reads: Vec<HashMap<LocalId, usize>> = vec![HashMap::new(); num_blocks];
        let mut writes: Vec<HashMap<LocalId, (bool, usize)>> = vec![HashMap::new(); num_blocks];
        for (index, block) in method.blocks().iter().enumerate() {
            for (position, inst) in block.instructions().iter().enumerate() {
                for (local, is_read, is_write) in inst.mentioned_locals() {
                    if method.local(local).data_type.is_label() {
                        continue;
                    }
                    if is_read {
                        reads[index].entry(local).or_insert(position);
                    }
                    if is_write {
                        let is_phi = inst.has_decoration(Decorations::PHI_NODE);
                        writes[index]
                            .entry(local)
                            .and_modify(|(phi, pos)| {
                                *phi |= is_phi;
                                *pos = (*pos).max(position);
                            })
                            .or_insert((is_phi, position));
                    }
                }
            }
        }

        for writer in 0..num_blocks {
            for (&local, &(is_phi, write_position)) in &writes[writer] {
                for reader in 0..num_blocks {
                    if reader == writer {
                        // a phi-write after a read of the same local in one
                        // block is a loop-carried dependency onto itself
                        if is_phi
                            && reads[reader]
                                .get(&local)
                                .is_some_and(|&read_position| read_position < write_position)
                        {
                            Self::merge_edge(
                                &mut graph,
                                writer,
                                reader,
                                local,
                                DependencyKind::FLOW | DependencyKind::PHI,
                            );
                        }
                        continue;
                    }
                    if reads[reader].contains_key(&local) {
                        let mut kind = DependencyKind::FLOW;
                        if is_phi {
                            kind |= DependencyKind::PHI;
                        }
                        Self::merge_edge(&mut graph, writer, reader, local, kind);
                    }
                    if writes[reader].contains_key(&local) {
                        Self::merge_edge(&mut graph, writer, reader, local, DependencyKind::OUTPUT);
                    }
                }
            }
            for (&local, _) in &reads[writer] {
                for other in 0..num_blocks {
                    if other != writer && writes[other].contains_key(&local) {
                        // the read in `writer` must happen before the re-write
                        Self::merge_edge(&mut graph, writer, other, local, DependencyKind::ANTI);
                    }
                }
            }
        }

        DataDependencyGraph { graph }
    }

    fn merge_edge(
        graph: &mut Graph<usize, (), DependencyEdge>,
        from: usize,
        to: usize,
        local: LocalId,
        kind: DependencyKind,
    ) {
        if let Some(edge) = graph.edge_mut(from, to) {
            *edge.entry(local).or_default() |= kind;
            return;
        }
        let mut edge = DependencyEdge::new();
        edge.insert(local, kind);
        graph.add_edge(from, to, edge);
    }

    /// Incoming dependency edges of a block.
    pub fn incoming(&self, block: usize) -> impl Iterator<Item = (usize, &DependencyEdge)> + '_ {
        self.graph.predecessors(block)
    }

    pub fn has_node(&self, block: usize) -> bool {
        self.graph.contains_node(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::{Decorations, Instruction, OpCode};
    use crate::ir::method::method_with_entry_block;
    use crate::ir::types::TYPE_INT32;
    use crate::ir::value::Value;

    #[test]
    fn phi_flow_dependencies_are_tagged() {
        let mut method = method_with_entry_block("dep");
        let header = method.create_block("%header");
        let i = method.add_new_local(TYPE_INT32, "%i");
        // entry writes %i via a phi-move, header reads it
        method.append_to_block(
            0,
            Instruction::mov(i.clone(), Value::int(0)).with_decorations(Decorations::PHI_NODE),
        );
        let out = method.add_new_local(TYPE_INT32, "%out");
        method.append_to_block(
            header,
            Instruction::op(OpCode::Add, out, i.clone(), Value::int(1)),
        );
        let graph = DataDependencyGraph::create(&method);
        let (pred, edge) = graph.incoming(header).next().unwrap();
        assert_eq!(pred, 0);
        let kind = edge[&i.local_id().unwrap()];
        assert!(kind.contains(DependencyKind::FLOW | DependencyKind::PHI));
    }
}
