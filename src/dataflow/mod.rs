use std::sync::Arc;

use tracing::trace;

use crate::cfg::{BasicBlock, BlockId, ControlFlowGraph, FlowEdge, Location};
use crate::errors::AnalysisError;
use crate::ir::Instruction;

pub mod deref;
pub mod nullness;
pub mod qual;
pub mod vna;

/// Safeguard against non-monotonic transfer functions. Exceeding this pass
/// count is a fatal analysis error, not a retry condition.
pub const MAX_ITERATIONS: usize = 97;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// One instance of the fixed-point framework: a lattice of facts, a transfer
/// function, and a join operator for confluence points.
///
/// Facts thread through a block instruction by instruction. "Before" and
/// "after" are relative to the analysis direction: a backward analysis sees a
/// block's instructions in reverse and its "incoming" edges are the CFG's
/// outgoing ones.
pub trait DataflowAnalysis {
    type Fact: Clone + PartialEq + std::fmt::Debug;

    fn name(&self) -> &'static str;
    fn direction(&self) -> Direction;
    /// Fact at the boundary block: entry for forward, exit for backward.
    fn boundary_fact(&self) -> Result<Self::Fact, AnalysisError>;
    /// Fact for blocks no information has reached yet; the identity of join.
    fn unreached_fact(&self) -> Self::Fact;
    fn transfer_instruction(
        &mut self,
        location: Location,
        instruction: &Instruction,
        fact: &mut Self::Fact,
    ) -> Result<(), AnalysisError>;
    /// Merge `incoming` (the fact at the other end of `edge`) into `result`.
    fn meet_into(
        &mut self,
        edge: &FlowEdge,
        incoming: &Self::Fact,
        result: &mut Self::Fact,
    ) -> Result<(), AnalysisError>;

    fn transfer_block(
        &mut self,
        block: &BasicBlock,
        fact: &mut Self::Fact,
    ) -> Result<(), AnalysisError> {
        let indices: Vec<usize> = match self.direction() {
            Direction::Forward => (0..block.instructions.len()).collect(),
            Direction::Backward => (0..block.instructions.len()).rev().collect(),
        };
        for index in indices {
            let location = Location {
                block: block.id,
                index,
            };
            let instruction = block.instructions[index].clone();
            self.transfer_instruction(location, &instruction, fact)?;
        }
        Ok(())
    }
}

/// Converged facts of one analysis over one control-flow graph. Frozen: built
/// by [`execute`], then read-only.
pub struct Dataflow<A: DataflowAnalysis> {
    analysis: A,
    cfg: Arc<ControlFlowGraph>,
    start_facts: Vec<A::Fact>,
    result_facts: Vec<A::Fact>,
    facts_before: Vec<A::Fact>,
    facts_after: Vec<A::Fact>,
}

impl<A: DataflowAnalysis> Dataflow<A> {
    pub fn analysis(&self) -> &A {
        &self.analysis
    }

    pub fn cfg(&self) -> &Arc<ControlFlowGraph> {
        &self.cfg
    }

    /// Fact on the input side of a block, in analysis direction.
    pub fn start_fact(&self, block: BlockId) -> &A::Fact {
        &self.start_facts[block]
    }

    /// Fact on the output side of a block, in analysis direction.
    pub fn result_fact(&self, block: BlockId) -> &A::Fact {
        &self.result_facts[block]
    }

    /// Fact before the instruction executes, in analysis direction: for a
    /// forward analysis this precedes the instruction in program order; for a
    /// backward analysis it excludes the instruction's own effect.
    pub fn fact_before(&self, location_index: usize) -> &A::Fact {
        &self.facts_before[location_index]
    }

    /// Fact including the instruction's effect.
    pub fn fact_after(&self, location_index: usize) -> &A::Fact {
        &self.facts_after[location_index]
    }
}

/// Run `analysis` over `cfg` to a fixed point.
///
/// Blocks are visited in reverse postorder (forward) or postorder (backward);
/// passes repeat until no block's output fact changes. Per-location facts are
/// frozen afterwards by replaying each block once.
pub fn execute<A: DataflowAnalysis>(
    cfg: Arc<ControlFlowGraph>,
    mut analysis: A,
) -> Result<Dataflow<A>, AnalysisError> {
    let direction = analysis.direction();
    let order = match direction {
        Direction::Forward => cfg.reverse_post_order(),
        Direction::Backward => cfg.post_order(),
    };
    let boundary = match direction {
        Direction::Forward => cfg.entry(),
        Direction::Backward => cfg.exit(),
    };

    let block_count = cfg.block_count();
    let mut start_facts: Vec<A::Fact> = (0..block_count)
        .map(|_| analysis.unreached_fact())
        .collect();
    let mut result_facts = start_facts.clone();

    let mut passes = 0;
    loop {
        passes += 1;
        if passes > MAX_ITERATIONS {
            return Err(AnalysisError::IterationLimit(MAX_ITERATIONS));
        }
        let mut changed = false;
        for &block_id in &order {
            let mut fact = if block_id == boundary {
                analysis.boundary_fact()?
            } else {
                analysis.unreached_fact()
            };
            match direction {
                Direction::Forward => {
                    for edge in cfg.incoming_edges(block_id) {
                        let incoming = result_facts[edge.from].clone();
                        analysis.meet_into(edge, &incoming, &mut fact)?;
                    }
                }
                Direction::Backward => {
                    for edge in cfg.outgoing_edges(block_id) {
                        let incoming = result_facts[edge.to].clone();
                        analysis.meet_into(edge, &incoming, &mut fact)?;
                    }
                }
            }
            start_facts[block_id] = fact.clone();
            analysis.transfer_block(cfg.block(block_id), &mut fact)?;
            if fact != result_facts[block_id] {
                result_facts[block_id] = fact;
                changed = true;
            }
        }
        trace!(analysis = analysis.name(), passes, changed, "dataflow pass");
        if !changed {
            break;
        }
    }

    // Freeze per-location facts. Replay is deterministic once the fixed point
    // is reached because transfer memoization has stabilized.
    let mut facts_before = Vec::with_capacity(cfg.location_count());
    let mut facts_after = Vec::with_capacity(cfg.location_count());
    for block in cfg.blocks() {
        let len = block.instructions.len();
        if len == 0 {
            continue;
        }
        let mut before = vec![analysis.unreached_fact(); len];
        let mut after = before.clone();
        let mut fact = start_facts[block.id].clone();
        let indices: Vec<usize> = match direction {
            Direction::Forward => (0..len).collect(),
            Direction::Backward => (0..len).rev().collect(),
        };
        for index in indices {
            let location = Location {
                block: block.id,
                index,
            };
            before[index] = fact.clone();
            let instruction = block.instructions[index].clone();
            analysis.transfer_instruction(location, &instruction, &mut fact)?;
            after[index] = fact.clone();
        }
        facts_before.extend(before);
        facts_after.extend(after);
    }

    Ok(Dataflow {
        analysis,
        cfg,
        start_facts,
        result_facts,
        facts_before,
        facts_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{EdgeKind, build_cfg};
    use crate::ir::{ConstValue, Method, MethodAccess, Op};

    fn diamond_method() -> Method {
        Method {
            name: "sample".to_string(),
            descriptor: "()V".to_string(),
            access: MethodAccess::default(),
            max_locals: 2,
            instructions: vec![
                Instruction {
                    offset: 0,
                    op: Op::LoadLocal(0),
                },
                Instruction {
                    offset: 1,
                    op: Op::IfNull { target: 4 },
                },
                Instruction {
                    offset: 2,
                    op: Op::PushConst(ConstValue::Int(1)),
                },
                Instruction {
                    offset: 3,
                    op: Op::Goto { target: 5 },
                },
                Instruction {
                    offset: 4,
                    op: Op::PushConst(ConstValue::Int(2)),
                },
                Instruction {
                    offset: 5,
                    op: Op::Return,
                },
            ],
            exception_handlers: Vec::new(),
        }
    }

    /// Counts instructions reachable from entry; a simple monotone forward
    /// analysis over the max-count lattice.
    struct CountingAnalysis;

    impl DataflowAnalysis for CountingAnalysis {
        type Fact = usize;

        fn name(&self) -> &'static str {
            "instruction count"
        }

        fn direction(&self) -> Direction {
            Direction::Forward
        }

        fn boundary_fact(&self) -> Result<usize, AnalysisError> {
            Ok(0)
        }

        fn unreached_fact(&self) -> usize {
            0
        }

        fn transfer_instruction(
            &mut self,
            _location: Location,
            _instruction: &Instruction,
            fact: &mut usize,
        ) -> Result<(), AnalysisError> {
            *fact += 1;
            Ok(())
        }

        fn meet_into(
            &mut self,
            _edge: &FlowEdge,
            incoming: &usize,
            result: &mut usize,
        ) -> Result<(), AnalysisError> {
            *result = (*result).max(*incoming);
            Ok(())
        }
    }

    #[test]
    fn forward_facts_reach_exit() {
        let cfg = Arc::new(build_cfg(&diamond_method()).expect("cfg"));
        let flow = execute(cfg.clone(), CountingAnalysis).expect("solve");
        // Longest path: 2 (entry) + 2 (then branch) + 1 (join) instructions.
        assert_eq!(*flow.result_fact(cfg.exit()), 5);
    }

    #[test]
    fn repeated_runs_are_deterministic() {
        let cfg = Arc::new(build_cfg(&diamond_method()).expect("cfg"));
        let first = execute(cfg.clone(), CountingAnalysis).expect("solve");
        let second = execute(cfg.clone(), CountingAnalysis).expect("solve");
        for block in cfg.blocks() {
            assert_eq!(first.start_fact(block.id), second.start_fact(block.id));
            assert_eq!(first.result_fact(block.id), second.result_fact(block.id));
        }
        for index in 0..cfg.location_count() {
            assert_eq!(first.fact_before(index), second.fact_before(index));
            assert_eq!(first.fact_after(index), second.fact_after(index));
        }
    }

    /// Deliberately non-monotonic: flips between two facts forever.
    struct OscillatingAnalysis;

    impl DataflowAnalysis for OscillatingAnalysis {
        type Fact = bool;

        fn name(&self) -> &'static str {
            "oscillating"
        }

        fn direction(&self) -> Direction {
            Direction::Forward
        }

        fn boundary_fact(&self) -> Result<bool, AnalysisError> {
            Ok(false)
        }

        fn unreached_fact(&self) -> bool {
            false
        }

        fn transfer_instruction(
            &mut self,
            _location: Location,
            _instruction: &Instruction,
            fact: &mut bool,
        ) -> Result<(), AnalysisError> {
            *fact = !*fact;
            Ok(())
        }

        fn meet_into(
            &mut self,
            _edge: &FlowEdge,
            incoming: &bool,
            result: &mut bool,
        ) -> Result<(), AnalysisError> {
            *result = *result != *incoming;
            Ok(())
        }
    }

    #[test]
    fn non_convergence_hits_the_iteration_limit() {
        // A loop keeps feeding the oscillating fact back into itself.
        let method = Method {
            name: "looping".to_string(),
            descriptor: "()V".to_string(),
            access: MethodAccess::default(),
            max_locals: 1,
            instructions: vec![
                Instruction {
                    offset: 0,
                    op: Op::Nop,
                },
                Instruction {
                    offset: 1,
                    op: Op::If { target: 0 },
                },
                Instruction {
                    offset: 2,
                    op: Op::Return,
                },
            ],
            exception_handlers: Vec::new(),
        };
        let cfg = Arc::new(build_cfg(&method).expect("cfg"));
        assert!(matches!(
            execute(cfg, OscillatingAnalysis),
            Err(AnalysisError::IterationLimit(MAX_ITERATIONS))
        ));
    }

    #[test]
    fn backward_analysis_visits_successors_first() {
        struct ExitDistance;
        impl DataflowAnalysis for ExitDistance {
            type Fact = usize;
            fn name(&self) -> &'static str {
                "exit distance"
            }
            fn direction(&self) -> Direction {
                Direction::Backward
            }
            fn boundary_fact(&self) -> Result<usize, AnalysisError> {
                Ok(0)
            }
            fn unreached_fact(&self) -> usize {
                0
            }
            fn transfer_instruction(
                &mut self,
                _location: Location,
                _instruction: &Instruction,
                fact: &mut usize,
            ) -> Result<(), AnalysisError> {
                *fact += 1;
                Ok(())
            }
            fn meet_into(
                &mut self,
                edge: &FlowEdge,
                incoming: &usize,
                result: &mut usize,
            ) -> Result<(), AnalysisError> {
                if edge.kind != EdgeKind::Exception {
                    *result = (*result).max(*incoming);
                }
                Ok(())
            }
        }

        let cfg = Arc::new(build_cfg(&diamond_method()).expect("cfg"));
        let flow = execute(cfg.clone(), ExitDistance).expect("solve");
        // From entry, the longest instruction path to exit is 5.
        assert_eq!(*flow.result_fact(cfg.entry()), 5);
    }
}
