use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cache::{AnalysisCache, AnalysisFactory, AnalysisKind, SharedResult};
use crate::cfg::{ControlFlowGraph, EdgeKind, FlowEdge, Location};
use crate::dataflow::vna::{Frame, ValueNumber, ValueNumbering};
use crate::dataflow::{DataflowAnalysis, Dataflow, Direction, execute};
use crate::descriptor::MethodSignature;
use crate::errors::AnalysisError;
use crate::ir::{Instruction, MethodDescriptor, Op};

/// Value the instruction dereferences, read from the operand stack before it
/// executes: an invoke receiver or the object of a field access.
pub fn dereferenced_value(op: &Op, frame: &Frame) -> Result<Option<ValueNumber>, AnalysisError> {
    let Frame::Valid { stack, .. } = frame else {
        return Ok(None);
    };
    let value = match op {
        Op::Invoke(call) if call.kind.has_receiver() => {
            let arity = MethodSignature::parse(&call.descriptor)?.param_count();
            stack
                .len()
                .checked_sub(arity + 1)
                .and_then(|index| stack.get(index))
                .copied()
        }
        Op::GetField(_) => stack.last().copied(),
        Op::PutField(_) => stack
            .len()
            .checked_sub(2)
            .and_then(|index| stack.get(index))
            .copied(),
        _ => None,
    };
    Ok(value)
}

/// Values guaranteed to be dereferenced on every forward path.
#[derive(Clone, Debug, PartialEq)]
pub enum DerefFact {
    Unreached,
    Derefs(BTreeSet<ValueNumber>),
}

/// Backward analysis computing, for each point, the set of value numbers
/// dereferenced on every path from that point to a method exit.
///
/// Paths through exception handlers are disregarded: a dereference guarded
/// only by a catch block still counts as unconditional. A null test kills the
/// tested value, since code after it no longer dereferences blindly. Phi
/// values are expanded to their inputs on insertion and removal, so facts
/// survive confluence points.
pub struct UnconditionalDerefAnalysis {
    cfg: Arc<ControlFlowGraph>,
    numbering: Arc<ValueNumbering>,
}

impl UnconditionalDerefAnalysis {
    pub fn new(cfg: Arc<ControlFlowGraph>, numbering: Arc<ValueNumbering>) -> Self {
        UnconditionalDerefAnalysis { cfg, numbering }
    }
}

impl DataflowAnalysis for UnconditionalDerefAnalysis {
    type Fact = DerefFact;

    fn name(&self) -> &'static str {
        "unconditional dereference"
    }

    fn direction(&self) -> Direction {
        Direction::Backward
    }

    fn boundary_fact(&self) -> Result<DerefFact, AnalysisError> {
        Ok(DerefFact::Derefs(BTreeSet::new()))
    }

    fn unreached_fact(&self) -> DerefFact {
        DerefFact::Unreached
    }

    fn transfer_instruction(
        &mut self,
        location: Location,
        instruction: &Instruction,
        fact: &mut DerefFact,
    ) -> Result<(), AnalysisError> {
        let DerefFact::Derefs(derefs) = fact else {
            return Ok(());
        };
        let frame = self
            .numbering
            .frame_before(self.cfg.location_index(location));
        match &instruction.op {
            Op::IfNull { .. } | Op::IfNonNull { .. } => {
                if let Frame::Valid { stack, .. } = frame {
                    if let Some(tested) = stack.last() {
                        for value in self.numbering.expand(*tested) {
                            derefs.remove(&value);
                        }
                    }
                }
            }
            op => {
                if let Some(target) = dereferenced_value(op, frame)? {
                    for value in self.numbering.expand(target) {
                        derefs.insert(value);
                    }
                }
            }
        }
        Ok(())
    }

    fn meet_into(
        &mut self,
        edge: &FlowEdge,
        incoming: &DerefFact,
        result: &mut DerefFact,
    ) -> Result<(), AnalysisError> {
        if edge.kind == EdgeKind::Exception {
            return Ok(());
        }
        let DerefFact::Derefs(incoming) = incoming else {
            return Ok(());
        };
        match result {
            DerefFact::Unreached => *result = DerefFact::Derefs(incoming.clone()),
            DerefFact::Derefs(merged) => merged.retain(|value| incoming.contains(value)),
        }
        Ok(())
    }
}

/// Converged unconditional-dereference facts for one method.
pub struct UnconditionalDeref {
    flow: Dataflow<UnconditionalDerefAnalysis>,
}

impl UnconditionalDeref {
    pub(crate) fn new(flow: Dataflow<UnconditionalDerefAnalysis>) -> Self {
        UnconditionalDeref { flow }
    }

    /// Values dereferenced on every path from method entry to exit.
    pub fn entry_derefs(&self) -> BTreeSet<ValueNumber> {
        match self.flow.result_fact(self.flow.cfg().entry()) {
            DerefFact::Derefs(derefs) => derefs.clone(),
            DerefFact::Unreached => BTreeSet::new(),
        }
    }
}

/// Produces [`UnconditionalDeref`] results through the analysis cache.
pub struct UnconditionalDerefFactory;

impl AnalysisFactory for UnconditionalDerefFactory {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::UnconditionalDeref
    }

    fn dependencies(&self) -> Vec<AnalysisKind> {
        vec![AnalysisKind::ControlFlow, AnalysisKind::ValueNumbering]
    }

    fn analyze(
        &self,
        cache: &AnalysisCache,
        method: &MethodDescriptor,
    ) -> Result<SharedResult, AnalysisError> {
        let cfg = cache.cfg(method)?;
        let numbering: Arc<ValueNumbering> =
            cache.get_as(method, &AnalysisKind::ValueNumbering)?;
        let analysis = UnconditionalDerefAnalysis::new(cfg.clone(), numbering);
        let flow = execute(cfg, analysis)?;
        Ok(Arc::new(UnconditionalDeref::new(flow)))
    }
}
