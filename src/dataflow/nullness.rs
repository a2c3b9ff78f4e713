use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cache::{AnalysisCache, AnalysisFactory, AnalysisKind, SharedResult};
use crate::cfg::{ControlFlowGraph, EdgeKind, FlowEdge, Location};
use crate::dataflow::vna::{Frame, ValueNumber, ValueNumbering};
use crate::dataflow::{DataflowAnalysis, Dataflow, Direction, execute};
use crate::errors::AnalysisError;
use crate::ir::{ConstValue, Instruction, MethodDescriptor, Op};

/// Values known to be null on every path reaching a point.
#[derive(Clone, Debug, PartialEq)]
pub enum NullFact {
    Unreached,
    Nulls(BTreeSet<ValueNumber>),
}

/// Forward analysis tracking definitely-null value numbers.
///
/// The null constant is the only source. Null comparisons refine the fact on
/// their outgoing edges: the edge on which the tested value is known null
/// gains it, the opposite edge loses it. Facts intersect at confluence
/// points, so a value null on only some paths is not definite.
pub struct DefiniteNullAnalysis {
    cfg: Arc<ControlFlowGraph>,
    numbering: Arc<ValueNumbering>,
}

impl DefiniteNullAnalysis {
    pub fn new(cfg: Arc<ControlFlowGraph>, numbering: Arc<ValueNumbering>) -> Self {
        DefiniteNullAnalysis { cfg, numbering }
    }

    /// Value tested by the branch ending `block`, if it is a null comparison.
    fn tested_value(&self, block: usize) -> Option<(ValueNumber, bool)> {
        let instructions = &self.cfg.block(block).instructions;
        let last = instructions.last()?;
        let null_on_branch = match last.op {
            Op::IfNull { .. } => true,
            Op::IfNonNull { .. } => false,
            _ => return None,
        };
        let location = Location {
            block,
            index: instructions.len() - 1,
        };
        let frame = self
            .numbering
            .frame_before(self.cfg.location_index(location));
        let Frame::Valid { stack, .. } = frame else {
            return None;
        };
        stack.last().map(|value| (*value, null_on_branch))
    }
}

impl DataflowAnalysis for DefiniteNullAnalysis {
    type Fact = NullFact;

    fn name(&self) -> &'static str {
        "definite null"
    }

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn boundary_fact(&self) -> Result<NullFact, AnalysisError> {
        Ok(NullFact::Nulls(BTreeSet::new()))
    }

    fn unreached_fact(&self) -> NullFact {
        NullFact::Unreached
    }

    fn transfer_instruction(
        &mut self,
        location: Location,
        instruction: &Instruction,
        fact: &mut NullFact,
    ) -> Result<(), AnalysisError> {
        let NullFact::Nulls(nulls) = fact else {
            return Ok(());
        };
        if let Op::PushConst(ConstValue::Null) = &instruction.op {
            let index = self.cfg.location_index(location);
            if let Frame::Valid { stack, .. } = self.numbering.frame_after(index) {
                if let Some(value) = stack.last() {
                    nulls.insert(*value);
                }
            }
        }
        Ok(())
    }

    fn meet_into(
        &mut self,
        edge: &FlowEdge,
        incoming: &NullFact,
        result: &mut NullFact,
    ) -> Result<(), AnalysisError> {
        // Where the exception was raised within the block is unknown, so no
        // fact survives into a handler.
        let mut incoming = if edge.kind == EdgeKind::Exception {
            NullFact::Nulls(BTreeSet::new())
        } else {
            incoming.clone()
        };

        let refinement = match edge.kind {
            EdgeKind::Branch | EdgeKind::FallThrough => self.tested_value(edge.from),
            _ => None,
        };
        if let (NullFact::Nulls(nulls), Some((tested, null_on_branch))) =
            (&mut incoming, refinement)
        {
            let null_on_this_edge = match edge.kind {
                EdgeKind::Branch => null_on_branch,
                _ => !null_on_branch,
            };
            if null_on_this_edge {
                nulls.insert(tested);
            } else {
                for value in self.numbering.expand(tested) {
                    nulls.remove(&value);
                }
            }
        }
        *result = merge(std::mem::replace(result, NullFact::Unreached), incoming);
        Ok(())
    }
}

fn merge(result: NullFact, incoming: NullFact) -> NullFact {
    match (result, incoming) {
        (current, NullFact::Unreached) => current,
        (NullFact::Unreached, incoming) => incoming,
        (NullFact::Nulls(mut merged), NullFact::Nulls(incoming)) => {
            merged.retain(|value| incoming.contains(value));
            NullFact::Nulls(merged)
        }
    }
}

/// Converged definite-null facts for one method.
pub struct DefiniteNull {
    flow: Dataflow<DefiniteNullAnalysis>,
}

impl DefiniteNull {
    pub(crate) fn new(flow: Dataflow<DefiniteNullAnalysis>) -> Self {
        DefiniteNull { flow }
    }

    /// Whether `value` is null on every path reaching the instruction at
    /// `location_index`. Phi values without a direct fact are null when all
    /// of their inputs are.
    pub fn is_definitely_null(&self, location_index: usize, value: ValueNumber) -> bool {
        let NullFact::Nulls(nulls) = self.flow.fact_before(location_index) else {
            return false;
        };
        let mut visited = BTreeSet::new();
        self.resolve(nulls, value, &mut visited)
    }

    fn resolve(
        &self,
        nulls: &BTreeSet<ValueNumber>,
        value: ValueNumber,
        visited: &mut BTreeSet<ValueNumber>,
    ) -> bool {
        if nulls.contains(&value) {
            return true;
        }
        if !visited.insert(value) {
            return false;
        }
        match self.flow.analysis().numbering.phi_inputs(value) {
            Some(inputs) if !inputs.is_empty() => inputs
                .iter()
                .all(|input| self.resolve(nulls, *input, visited)),
            _ => false,
        }
    }
}

/// Produces [`DefiniteNull`] results through the analysis cache.
pub struct DefiniteNullFactory;

impl AnalysisFactory for DefiniteNullFactory {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::DefiniteNull
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
        let analysis = DefiniteNullAnalysis::new(cfg.clone(), numbering);
        let flow = execute(cfg, analysis)?;
        Ok(Arc::new(DefiniteNull::new(flow)))
    }
}
