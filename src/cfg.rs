use std::collections::{BTreeMap, BTreeSet};

use crate::errors::AnalysisError;
use crate::ir::{Instruction, Method};

pub type BlockId = usize;

/// Basic block covering a contiguous range of instructions.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub id: BlockId,
    pub start_offset: u32,
    pub instructions: Vec<Instruction>,
}

/// Edge between basic blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowEdge {
    pub from: BlockId,
    pub to: BlockId,
    pub kind: EdgeKind,
}

/// Edge classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum EdgeKind {
    FallThrough,
    Branch,
    Exception,
    /// Normal or abrupt method exit into the synthetic exit block.
    Return,
}

/// A single program point: one instruction within one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub block: BlockId,
    pub index: usize,
}

/// Basic-block graph of one method, with a synthetic exit block and a stable
/// program-point numbering.
///
/// The numbering orders locations by instruction offset and stays fixed for
/// the life of the cached graph, so analysis results indexed by it remain
/// valid.
#[derive(Clone, Debug)]
pub struct ControlFlowGraph {
    blocks: Vec<BasicBlock>,
    edges: Vec<FlowEdge>,
    entry: BlockId,
    exit: BlockId,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
    /// First location number of each block.
    block_base: Vec<usize>,
    location_count: usize,
}

impl ControlFlowGraph {
    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn exit(&self) -> BlockId {
        self.exit
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn incoming_edges(&self, id: BlockId) -> impl Iterator<Item = &FlowEdge> {
        self.incoming[id].iter().map(|index| &self.edges[*index])
    }

    pub fn outgoing_edges(&self, id: BlockId) -> impl Iterator<Item = &FlowEdge> {
        self.outgoing[id].iter().map(|index| &self.edges[*index])
    }

    pub fn location_count(&self) -> usize {
        self.location_count
    }

    /// Stable number of a program point, dense in `0..location_count()`.
    pub fn location_index(&self, location: Location) -> usize {
        self.block_base[location.block] + location.index
    }

    pub fn instruction_at(&self, location: Location) -> &Instruction {
        &self.blocks[location.block].instructions[location.index]
    }

    /// All program points in offset order.
    pub fn locations(&self) -> impl Iterator<Item = Location> + '_ {
        self.blocks.iter().flat_map(|block| {
            (0..block.instructions.len()).map(move |index| Location {
                block: block.id,
                index,
            })
        })
    }

    /// Block visitation order for forward analyses: reverse postorder of a
    /// depth-first search from the entry block.
    pub fn reverse_post_order(&self) -> Vec<BlockId> {
        let mut order = self.post_order();
        order.reverse();
        order
    }

    /// Block visitation order for backward analyses.
    pub fn post_order(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut order = Vec::with_capacity(self.blocks.len());
        // Iterative DFS; the second stack entry tracks how many successors
        // have been expanded so far.
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited[self.entry] = true;
        while let Some((block, cursor)) = stack.pop() {
            let next = self.outgoing[block]
                .iter()
                .skip(cursor)
                .enumerate()
                .find_map(|(skipped, edge_index)| {
                    let to = self.edges[*edge_index].to;
                    (!visited[to]).then_some((cursor + skipped + 1, to))
                });
            match next {
                Some((cursor, to)) => {
                    stack.push((block, cursor));
                    visited[to] = true;
                    stack.push((to, 0));
                }
                None => order.push(block),
            }
        }
        order
    }

    fn block_at_offset(&self, offset: u32) -> Option<BlockId> {
        self.blocks
            .iter()
            .find(|block| block.start_offset == offset && block.id != self.exit)
            .map(|block| block.id)
    }
}

/// Build a control flow graph from a method body.
pub fn build_cfg(method: &Method) -> Result<ControlFlowGraph, AnalysisError> {
    if method.instructions.is_empty() {
        return Err(AnalysisError::InvalidModel(format!(
            "method {} has no body",
            method.name
        )));
    }

    let mut by_offset = BTreeMap::new();
    for inst in &method.instructions {
        if by_offset.insert(inst.offset, inst.clone()).is_some() {
            return Err(AnalysisError::InvalidModel(format!(
                "duplicate instruction offset {}",
                inst.offset
            )));
        }
    }
    let first_offset = *by_offset.keys().next().unwrap_or(&0);

    // Leaders: method start, branch targets, fall-through points after
    // branches and exits, and exception handler entries.
    let mut leaders = BTreeSet::new();
    leaders.insert(first_offset);
    for handler in &method.exception_handlers {
        leaders.insert(handler.handler_pc);
    }
    let offsets: Vec<u32> = by_offset.keys().copied().collect();
    for (position, inst) in by_offset.values().enumerate() {
        let next = offsets.get(position + 1).copied();
        if let Some(target) = inst.op.branch_target() {
            if !by_offset.contains_key(&target) {
                return Err(AnalysisError::InvalidModel(format!(
                    "branch at offset {} targets unknown offset {}",
                    inst.offset, target
                )));
            }
            leaders.insert(target);
            if let Some(next) = next {
                leaders.insert(next);
            }
        }
        if inst.op.is_exit() {
            if let Some(next) = next {
                leaders.insert(next);
            }
        }
    }

    let leader_list: Vec<u32> = leaders.into_iter().collect();
    let mut blocks = Vec::new();
    for (index, start) in leader_list.iter().enumerate() {
        let end = leader_list.get(index + 1).copied();
        let instructions: Vec<Instruction> = by_offset
            .range(*start..)
            .take_while(|(offset, _)| end.is_none_or(|end| **offset < end))
            .map(|(_, inst)| inst.clone())
            .collect();
        blocks.push(BasicBlock {
            id: index,
            start_offset: *start,
            instructions,
        });
    }
    let exit = blocks.len();
    blocks.push(BasicBlock {
        id: exit,
        start_offset: u32::MAX,
        instructions: Vec::new(),
    });

    let mut graph = ControlFlowGraph {
        entry: 0,
        exit,
        incoming: vec![Vec::new(); blocks.len()],
        outgoing: vec![Vec::new(); blocks.len()],
        block_base: Vec::new(),
        location_count: 0,
        blocks,
        edges: Vec::new(),
    };

    let mut edges = Vec::new();
    for block in &graph.blocks {
        let Some(last) = block.instructions.last() else {
            continue;
        };
        if let Some(target) = last.op.branch_target() {
            let to = graph.block_at_offset(target).ok_or_else(|| {
                AnalysisError::InvalidModel(format!("branch target {target} is not a leader"))
            })?;
            edges.push(FlowEdge {
                from: block.id,
                to,
                kind: EdgeKind::Branch,
            });
            if !last.op.is_unconditional_branch() {
                if let Some(next) = fall_through_of(&graph, block.id) {
                    edges.push(FlowEdge {
                        from: block.id,
                        to: next,
                        kind: EdgeKind::FallThrough,
                    });
                }
            }
        } else if last.op.is_exit() {
            edges.push(FlowEdge {
                from: block.id,
                to: exit,
                kind: EdgeKind::Return,
            });
        } else if let Some(next) = fall_through_of(&graph, block.id) {
            edges.push(FlowEdge {
                from: block.id,
                to: next,
                kind: EdgeKind::FallThrough,
            });
        }
    }

    // Every block covered by a handler range may transfer to the handler.
    for handler in &method.exception_handlers {
        let to = graph.block_at_offset(handler.handler_pc).ok_or_else(|| {
            AnalysisError::InvalidModel(format!(
                "handler target {} is not a leader",
                handler.handler_pc
            ))
        })?;
        for block in &graph.blocks {
            if block.id == exit || block.instructions.is_empty() {
                continue;
            }
            let covered = block
                .instructions
                .iter()
                .any(|inst| inst.offset >= handler.start_pc && inst.offset < handler.end_pc);
            if covered && block.id != to {
                edges.push(FlowEdge {
                    from: block.id,
                    to,
                    kind: EdgeKind::Exception,
                });
            }
        }
    }

    for (index, edge) in edges.iter().enumerate() {
        graph.outgoing[edge.from].push(index);
        graph.incoming[edge.to].push(index);
    }
    graph.edges = edges;

    let mut base = 0;
    for block in &graph.blocks {
        graph.block_base.push(base);
        base += block.instructions.len();
    }
    graph.location_count = base;

    Ok(graph)
}

fn fall_through_of(graph: &ControlFlowGraph, id: BlockId) -> Option<BlockId> {
    let next = id + 1;
    (next < graph.exit).then_some(next)
}
