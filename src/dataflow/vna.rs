use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::cache::{AnalysisCache, AnalysisFactory, AnalysisKind, SharedResult};
use crate::cfg::{BlockId, EdgeKind, FlowEdge, Location};
use crate::dataflow::{DataflowAnalysis, Dataflow, Direction, execute};
use crate::descriptor::{MethodSignature, ReturnKind};
use crate::errors::AnalysisError;
use crate::ir::{Instruction, Method, MethodDescriptor, Op};

/// Symbolic name for a runtime value within one method. Two occurrences with
/// the same number are guaranteed to be the same value at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueNumber(pub u32);

impl fmt::Display for ValueNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Symbolic execution frame: value numbers of local slots and operand stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// No path has reached this point; identity of the merge.
    Unreached,
    /// A stack underflow or inconsistent merge was observed on some path.
    /// Absorbing: facts merged with an invalid frame stay invalid.
    Invalid,
    Valid {
        locals: Vec<ValueNumber>,
        stack: Vec<ValueNumber>,
    },
}

/// Forward symbolic execution assigning value numbers.
///
/// Fresh numbers are memoized per instruction offset, so re-executing a block
/// during later passes (or the final replay) reproduces identical numbering.
/// Merge points get a single phi number per frame position; its input set
/// grows monotonically as paths arrive.
pub struct ValueNumberingAnalysis {
    max_locals: u16,
    next: u32,
    entry_values: Vec<ValueNumber>,
    defs: HashMap<u32, ValueNumber>,
    phis: HashMap<(BlockId, usize), ValueNumber>,
    phi_inputs: BTreeMap<ValueNumber, BTreeSet<ValueNumber>>,
}

impl ValueNumberingAnalysis {
    pub fn new(method: &Method) -> Self {
        let mut analysis = ValueNumberingAnalysis {
            max_locals: method.max_locals,
            next: 0,
            entry_values: Vec::new(),
            defs: HashMap::new(),
            phis: HashMap::new(),
            phi_inputs: BTreeMap::new(),
        };
        for _ in 0..method.max_locals {
            let value = analysis.fresh();
            analysis.entry_values.push(value);
        }
        analysis
    }

    fn fresh(&mut self) -> ValueNumber {
        let value = ValueNumber(self.next);
        self.next += 1;
        value
    }

    /// Fresh value defined by the instruction at `offset`, stable across
    /// passes.
    fn def_at(&mut self, offset: u32) -> ValueNumber {
        if let Some(value) = self.defs.get(&offset) {
            return *value;
        }
        let value = self.fresh();
        self.defs.insert(offset, value);
        value
    }

    fn merge_values(
        &mut self,
        block: BlockId,
        position: usize,
        a: ValueNumber,
        b: ValueNumber,
    ) -> ValueNumber {
        if a == b {
            return a;
        }
        let phi = match self.phis.get(&(block, position)) {
            Some(phi) => *phi,
            None => {
                let phi = self.fresh();
                self.phis.insert((block, position), phi);
                phi
            }
        };
        let inputs = self.phi_inputs.entry(phi).or_default();
        for value in [a, b] {
            if value != phi {
                inputs.insert(value);
            }
        }
        phi
    }
}

impl DataflowAnalysis for ValueNumberingAnalysis {
    type Fact = Frame;

    fn name(&self) -> &'static str {
        "value numbering"
    }

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn boundary_fact(&self) -> Result<Frame, AnalysisError> {
        Ok(Frame::Valid {
            locals: self.entry_values.clone(),
            stack: Vec::new(),
        })
    }

    fn unreached_fact(&self) -> Frame {
        Frame::Unreached
    }

    fn transfer_instruction(
        &mut self,
        _location: Location,
        instruction: &Instruction,
        fact: &mut Frame,
    ) -> Result<(), AnalysisError> {
        let (mut locals, mut stack) = match std::mem::replace(fact, Frame::Invalid) {
            Frame::Valid { locals, stack } => (locals, stack),
            other => {
                *fact = other;
                return Ok(());
            }
        };
        debug_assert_eq!(locals.len(), self.max_locals as usize);

        // Leaving early keeps `*fact` at the invalid frame set above.
        match &instruction.op {
            Op::LoadLocal(slot) => {
                let Some(value) = locals.get(*slot as usize).copied() else {
                    return Ok(());
                };
                stack.push(value);
            }
            Op::StoreLocal(slot) => {
                let Some(value) = stack.pop() else {
                    return Ok(());
                };
                let Some(local) = locals.get_mut(*slot as usize) else {
                    return Ok(());
                };
                *local = value;
            }
            Op::PushConst(_) | Op::New(_) => {
                let value = self.def_at(instruction.offset);
                stack.push(value);
            }
            Op::Dup => {
                let Some(top) = stack.last().copied() else {
                    return Ok(());
                };
                stack.push(top);
            }
            Op::Pop => {
                if stack.pop().is_none() {
                    return Ok(());
                }
            }
            Op::GetField(_) => {
                if stack.pop().is_none() {
                    return Ok(());
                }
                let value = self.def_at(instruction.offset);
                stack.push(value);
            }
            Op::GetStatic(_) => {
                let value = self.def_at(instruction.offset);
                stack.push(value);
            }
            Op::PutField(_) => {
                if stack.pop().is_none() || stack.pop().is_none() {
                    return Ok(());
                }
            }
            Op::Invoke(call) => {
                let signature = MethodSignature::parse(&call.descriptor)?;
                for _ in 0..signature.param_count() {
                    if stack.pop().is_none() {
                        return Ok(());
                    }
                }
                if call.kind.has_receiver() && stack.pop().is_none() {
                    return Ok(());
                }
                if signature.return_kind != ReturnKind::Void {
                    let value = self.def_at(instruction.offset);
                    stack.push(value);
                }
            }
            Op::IfNull { .. } | Op::IfNonNull { .. } | Op::If { .. } => {
                if stack.pop().is_none() {
                    return Ok(());
                }
            }
            Op::ReturnValue | Op::Throw => {
                if stack.pop().is_none() {
                    return Ok(());
                }
            }
            Op::Goto { .. } | Op::Return | Op::Nop => {}
        }

        *fact = Frame::Valid { locals, stack };
        Ok(())
    }

    fn meet_into(
        &mut self,
        edge: &FlowEdge,
        incoming: &Frame,
        result: &mut Frame,
    ) -> Result<(), AnalysisError> {
        let mut incoming = incoming.clone();
        // Control reaching a handler abandons the operand stack.
        if edge.kind == EdgeKind::Exception {
            if let Frame::Valid { stack, .. } = &mut incoming {
                stack.clear();
            }
        }
        let merged = match (std::mem::replace(result, Frame::Invalid), incoming) {
            (current, Frame::Unreached) => current,
            (Frame::Unreached, incoming) => incoming,
            (Frame::Invalid, _) | (_, Frame::Invalid) => Frame::Invalid,
            (
                Frame::Valid {
                    locals: mut merged_locals,
                    stack: mut merged_stack,
                },
                Frame::Valid { locals, stack },
            ) => {
                if merged_locals.len() != locals.len() || merged_stack.len() != stack.len() {
                    Frame::Invalid
                } else {
                    let block = edge.to;
                    for (position, (merged, incoming)) in
                        merged_locals.iter_mut().zip(&locals).enumerate()
                    {
                        *merged = self.merge_values(block, position, *merged, *incoming);
                    }
                    let base = merged_locals.len();
                    for (position, (merged, incoming)) in
                        merged_stack.iter_mut().zip(&stack).enumerate()
                    {
                        *merged = self.merge_values(block, base + position, *merged, *incoming);
                    }
                    Frame::Valid {
                        locals: merged_locals,
                        stack: merged_stack,
                    }
                }
            }
        };
        *result = merged;
        Ok(())
    }
}

/// Converged value numbering of one method.
pub struct ValueNumbering {
    flow: Dataflow<ValueNumberingAnalysis>,
}

impl ValueNumbering {
    pub(crate) fn new(flow: Dataflow<ValueNumberingAnalysis>) -> Self {
        ValueNumbering { flow }
    }

    /// Value number a parameter slot holds on entry.
    pub fn entry_value(&self, slot: u16) -> Option<ValueNumber> {
        self.flow.analysis().entry_values.get(slot as usize).copied()
    }

    pub fn frame_before(&self, location_index: usize) -> &Frame {
        self.flow.fact_before(location_index)
    }

    pub fn frame_after(&self, location_index: usize) -> &Frame {
        self.flow.fact_after(location_index)
    }

    /// Direct inputs of a phi value, if `value` is one.
    pub fn phi_inputs(&self, value: ValueNumber) -> Option<&BTreeSet<ValueNumber>> {
        self.flow.analysis().phi_inputs.get(&value)
    }

    /// The value itself plus every value reachable through phi inputs.
    pub fn expand(&self, value: ValueNumber) -> BTreeSet<ValueNumber> {
        let mut expanded = BTreeSet::new();
        let mut queue = vec![value];
        while let Some(value) = queue.pop() {
            if !expanded.insert(value) {
                continue;
            }
            if let Some(inputs) = self.phi_inputs(value) {
                queue.extend(inputs.iter().copied());
            }
        }
        expanded
    }
}

/// Produces [`ValueNumbering`] results through the analysis cache.
pub struct ValueNumberingFactory;

impl AnalysisFactory for ValueNumberingFactory {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::ValueNumbering
    }

    fn dependencies(&self) -> Vec<AnalysisKind> {
        vec![AnalysisKind::ControlFlow]
    }

    fn analyze(
        &self,
        cache: &AnalysisCache,
        method: &MethodDescriptor,
    ) -> Result<SharedResult, AnalysisError> {
        let cfg = cache.cfg(method)?;
        let (_, body) = cache
            .program()
            .find_method(method)
            .ok_or_else(|| AnalysisError::MethodUnresolved(method.clone()))?;
        let flow = execute(cfg, ValueNumberingAnalysis::new(body))?;
        Ok(Arc::new(ValueNumbering::new(flow)))
    }
}
