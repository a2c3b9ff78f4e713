use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::cache::{AnalysisCache, AnalysisFactory, AnalysisKind, SharedResult};
use crate::cfg::{ControlFlowGraph, FlowEdge, Location};
use crate::dataflow::vna::{Frame, ValueNumber, ValueNumbering};
use crate::dataflow::{DataflowAnalysis, Dataflow, Direction, execute};
use crate::descriptor::{MethodSignature, ReturnKind};
use crate::errors::AnalysisError;
use crate::ir::{Instruction, MethodDescriptor, Op};
use crate::qualifiers::{MethodSummaries, QualifierDatabase, QualifierKind, Strength};

fn is_reference_descriptor(descriptor: &str) -> bool {
    matches!(descriptor.as_bytes().first(), Some(b'L' | b'['))
}

/// Known qualifier strengths per value number. Values without an entry have
/// no registered source and read as [`Strength::Unknown`].
#[derive(Clone, Debug, PartialEq)]
pub enum QualFact {
    Unreached,
    Reached(BTreeMap<ValueNumber, Strength>),
}

/// Forward propagation of one qualifier kind over value numbers.
///
/// Sources are registered where qualified values enter the method: parameters
/// at entry, call results, field loads, and constants the kind's validator
/// accepts. Between sources the value number itself carries the fact, so no
/// per-instruction copying is needed.
pub struct QualifierAnalysis {
    kind: QualifierKind,
    cfg: Arc<ControlFlowGraph>,
    numbering: Arc<ValueNumbering>,
    database: Arc<QualifierDatabase>,
    summaries: Arc<MethodSummaries>,
    entry_sources: BTreeMap<ValueNumber, Strength>,
}

impl QualifierAnalysis {
    pub fn new(
        kind: QualifierKind,
        method: &MethodDescriptor,
        is_static: bool,
        cfg: Arc<ControlFlowGraph>,
        numbering: Arc<ValueNumbering>,
        database: Arc<QualifierDatabase>,
        summaries: Arc<MethodSummaries>,
    ) -> Result<Self, AnalysisError> {
        let signature = MethodSignature::parse(&method.descriptor)?;
        let mut entry_sources = BTreeMap::new();
        for (index, param) in signature.params.iter().enumerate() {
            if !param.is_reference {
                continue;
            }
            let slot = signature.param_slot(index, is_static);
            let Some(value) = numbering.entry_value(slot) else {
                continue;
            };
            let strength = database
                .parameter_strength(
                    &method.class_name,
                    &method.name,
                    &method.descriptor,
                    index,
                    &kind.id,
                )
                .unwrap_or(Strength::Unknown);
            entry_sources.insert(value, strength);
        }
        Ok(QualifierAnalysis {
            kind,
            cfg,
            numbering,
            database,
            summaries,
            entry_sources,
        })
    }

    fn pushed_value(&self, location: Location) -> Option<ValueNumber> {
        let index = self.cfg.location_index(location);
        match self.numbering.frame_after(index) {
            Frame::Valid { stack, .. } => stack.last().copied(),
            _ => None,
        }
    }
}

impl DataflowAnalysis for QualifierAnalysis {
    type Fact = QualFact;

    fn name(&self) -> &'static str {
        "qualifier propagation"
    }

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn boundary_fact(&self) -> Result<QualFact, AnalysisError> {
        Ok(QualFact::Reached(self.entry_sources.clone()))
    }

    fn unreached_fact(&self) -> QualFact {
        QualFact::Unreached
    }

    fn transfer_instruction(
        &mut self,
        location: Location,
        instruction: &Instruction,
        fact: &mut QualFact,
    ) -> Result<(), AnalysisError> {
        let QualFact::Reached(sources) = fact else {
            return Ok(());
        };
        match &instruction.op {
            Op::PushConst(constant) => {
                if let Some(strength) = self.kind.validate(constant) {
                    if let Some(value) = self.pushed_value(location) {
                        sources.insert(value, strength);
                    }
                }
            }
            Op::Invoke(call) => {
                let signature = MethodSignature::parse(&call.descriptor)?;
                if signature.return_kind != ReturnKind::Reference {
                    return Ok(());
                }
                let Some(value) = self.pushed_value(location) else {
                    return Ok(());
                };
                let callee = MethodDescriptor {
                    class_name: call.owner.clone(),
                    name: call.name.clone(),
                    descriptor: call.descriptor.clone(),
                };
                let strength = self
                    .database
                    .return_strength(&call.owner, &call.name, &call.descriptor, &self.kind.id)
                    .or_else(|| self.summaries.return_strength(&callee, &self.kind.id))
                    .unwrap_or(Strength::Unknown);
                sources.insert(value, strength);
            }
            Op::GetField(field) | Op::GetStatic(field) => {
                if !is_reference_descriptor(&field.descriptor) {
                    return Ok(());
                }
                let Some(value) = self.pushed_value(location) else {
                    return Ok(());
                };
                let strength = self
                    .database
                    .field_strength(&field.owner, &field.name, &self.kind.id)
                    .unwrap_or(Strength::Unknown);
                sources.insert(value, strength);
            }
            _ => {}
        }
        Ok(())
    }

    fn meet_into(
        &mut self,
        _edge: &FlowEdge,
        incoming: &QualFact,
        result: &mut QualFact,
    ) -> Result<(), AnalysisError> {
        let QualFact::Reached(incoming) = incoming else {
            return Ok(());
        };
        match result {
            QualFact::Unreached => *result = QualFact::Reached(incoming.clone()),
            QualFact::Reached(merged) => {
                for (value, strength) in incoming {
                    merged
                        .entry(*value)
                        .and_modify(|existing| *existing = existing.join(*strength))
                        .or_insert(*strength);
                }
            }
        }
        Ok(())
    }
}

/// Converged qualifier facts for one method and one qualifier kind.
pub struct QualifierDataflow {
    flow: Dataflow<QualifierAnalysis>,
}

impl QualifierDataflow {
    /// Strength of a value before the instruction at `location_index`.
    ///
    /// Phi values without a direct source resolve to the join of their
    /// inputs' strengths.
    pub fn strength_before(&self, location_index: usize, value: ValueNumber) -> Strength {
        let QualFact::Reached(sources) = self.flow.fact_before(location_index) else {
            return Strength::Unknown;
        };
        let mut visited = BTreeSet::new();
        self.resolve(sources, value, &mut visited)
    }

    fn resolve(
        &self,
        sources: &BTreeMap<ValueNumber, Strength>,
        value: ValueNumber,
        visited: &mut BTreeSet<ValueNumber>,
    ) -> Strength {
        if let Some(strength) = sources.get(&value) {
            return *strength;
        }
        if !visited.insert(value) {
            return Strength::Unknown;
        }
        let Some(inputs) = self.flow.analysis().numbering.phi_inputs(value) else {
            return Strength::Unknown;
        };
        let mut joined: Option<Strength> = None;
        for input in inputs {
            let strength = self.resolve(sources, *input, visited);
            joined = Some(match joined {
                Some(joined) => joined.join(strength),
                None => strength,
            });
        }
        joined.unwrap_or(Strength::Unknown)
    }
}

/// Produces [`QualifierDataflow`] results for one qualifier kind.
pub struct QualifierFactory {
    kind: QualifierKind,
    database: Arc<QualifierDatabase>,
    summaries: Arc<MethodSummaries>,
}

impl QualifierFactory {
    pub fn new(
        kind: QualifierKind,
        database: Arc<QualifierDatabase>,
        summaries: Arc<MethodSummaries>,
    ) -> Self {
        QualifierFactory {
            kind,
            database,
            summaries,
        }
    }
}

impl AnalysisFactory for QualifierFactory {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::Qualifier(self.kind.id.clone())
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
        let (_, body) = cache
            .program()
            .find_method(method)
            .ok_or_else(|| AnalysisError::MethodUnresolved(method.clone()))?;
        let analysis = QualifierAnalysis::new(
            self.kind.clone(),
            method,
            body.access.is_static,
            cfg,
            numbering,
            self.database.clone(),
            self.summaries.clone(),
        )?;
        let flow = execute(analysis.cfg.clone(), analysis)?;
        Ok(Arc::new(QualifierDataflow { flow }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_cfg;
    use crate::dataflow::vna::ValueNumberingAnalysis;
    use crate::ir::{CallKind, CallSite, ConstValue, Method, MethodAccess};
    use crate::qualifiers::{QualifierId, QualifierRule, RuleTarget};

    fn method_of(descriptor: &str, max_locals: u16, instructions: Vec<(u32, Op)>) -> Method {
        Method {
            name: "sample".to_string(),
            descriptor: descriptor.to_string(),
            access: MethodAccess::default(),
            max_locals,
            instructions: instructions
                .into_iter()
                .map(|(offset, op)| Instruction { offset, op })
                .collect(),
            exception_handlers: Vec::new(),
        }
    }

    fn dataflow_of(
        method: &Method,
        database: QualifierDatabase,
    ) -> (Arc<ControlFlowGraph>, Arc<ValueNumbering>, QualifierDataflow) {
        dataflow_with(method, database, MethodSummaries::default())
    }

    fn dataflow_with(
        method: &Method,
        database: QualifierDatabase,
        summaries: MethodSummaries,
    ) -> (Arc<ControlFlowGraph>, Arc<ValueNumbering>, QualifierDataflow) {
        let cfg = Arc::new(build_cfg(method).expect("cfg"));
        let vna_flow =
            execute(cfg.clone(), ValueNumberingAnalysis::new(method)).expect("numbering");
        let numbering = Arc::new(ValueNumbering::new(vna_flow));
        let descriptor = MethodDescriptor {
            class_name: "com/example/App".to_string(),
            name: method.name.clone(),
            descriptor: method.descriptor.clone(),
        };
        let analysis = QualifierAnalysis::new(
            QualifierKind::nonnull(),
            &descriptor,
            method.access.is_static,
            cfg.clone(),
            numbering.clone(),
            Arc::new(database),
            Arc::new(summaries),
        )
        .expect("analysis");
        let flow = execute(cfg.clone(), analysis).expect("solve");
        (cfg, numbering, QualifierDataflow { flow })
    }

    fn index_of(cfg: &ControlFlowGraph, offset: u32) -> usize {
        cfg.locations()
            .find(|location| cfg.instruction_at(*location).offset == offset)
            .map(|location| cfg.location_index(location))
            .expect("offset present")
    }

    fn top_before(
        numbering: &ValueNumbering,
        cfg: &ControlFlowGraph,
        offset: u32,
    ) -> ValueNumber {
        match numbering.frame_before(index_of(cfg, offset)) {
            Frame::Valid { stack, .. } => *stack.last().expect("nonempty stack"),
            other => panic!("expected a valid frame, got {other:?}"),
        }
    }

    #[test]
    fn null_constant_reads_as_never() {
        let method = method_of(
            "()V",
            1,
            vec![
                (0, Op::PushConst(ConstValue::Null)),
                (1, Op::Pop),
                (2, Op::Return),
            ],
        );
        let (cfg, numbering, flow) = dataflow_of(&method, QualifierDatabase::default());
        let value = top_before(&numbering, &cfg, 1);
        assert_eq!(
            flow.strength_before(index_of(&cfg, 1), value),
            Strength::Never
        );
    }

    #[test]
    fn known_call_results_take_the_database_strength() {
        let method = method_of(
            "()V",
            1,
            vec![
                (0, Op::PushConst(ConstValue::Str("user.home".to_string()))),
                (
                    1,
                    Op::Invoke(CallSite {
                        owner: "java/lang/System".to_string(),
                        name: "getProperty".to_string(),
                        descriptor: "(Ljava/lang/String;)Ljava/lang/String;".to_string(),
                        kind: CallKind::Static,
                    }),
                ),
                (2, Op::Pop),
                (3, Op::Return),
            ],
        );
        let (cfg, numbering, flow) = dataflow_of(&method, QualifierDatabase::with_defaults());
        let value = top_before(&numbering, &cfg, 2);
        assert_eq!(
            flow.strength_before(index_of(&cfg, 2), value),
            Strength::Never
        );
    }

    #[test]
    fn annotated_parameter_reads_as_declared() {
        let mut database = QualifierDatabase::default();
        database.add_explicit(QualifierRule {
            target: RuleTarget::Parameter {
                class_name: "com/example/App".to_string(),
                method: "sample".to_string(),
                descriptor: "(Ljava/lang/Object;)V".to_string(),
                index: 0,
            },
            qualifier: QualifierId::nonnull(),
            strength: Strength::Always,
        });
        let method = method_of(
            "(Ljava/lang/Object;)V",
            2,
            vec![(0, Op::LoadLocal(1)), (1, Op::Pop), (2, Op::Return)],
        );
        let (cfg, numbering, flow) = dataflow_of(&method, database);
        let value = top_before(&numbering, &cfg, 1);
        assert_eq!(
            flow.strength_before(index_of(&cfg, 1), value),
            Strength::Always
        );
    }

    #[test]
    fn summarized_return_strengths_cover_undeclared_callees() {
        let method = method_of(
            "()V",
            1,
            vec![
                (
                    0,
                    Op::Invoke(CallSite {
                        owner: "com/example/Dep".to_string(),
                        name: "supply".to_string(),
                        descriptor: "()Ljava/lang/Object;".to_string(),
                        kind: CallKind::Static,
                    }),
                ),
                (1, Op::Pop),
                (2, Op::Return),
            ],
        );
        let summaries = MethodSummaries::default();
        summaries.record_return_strength(
            MethodDescriptor {
                class_name: "com/example/Dep".to_string(),
                name: "supply".to_string(),
                descriptor: "()Ljava/lang/Object;".to_string(),
            },
            QualifierId::nonnull(),
            Strength::Never,
        );
        let (cfg, numbering, flow) =
            dataflow_with(&method, QualifierDatabase::default(), summaries);
        let value = top_before(&numbering, &cfg, 1);
        assert_eq!(
            flow.strength_before(index_of(&cfg, 1), value),
            Strength::Never
        );
    }

    #[test]
    fn conflicting_branch_strengths_join_to_unknown() {
        let method = method_of(
            "()V",
            2,
            vec![
                (0, Op::LoadLocal(0)),
                (1, Op::IfNull { target: 5 }),
                (2, Op::PushConst(ConstValue::Str("present".to_string()))),
                (3, Op::StoreLocal(1)),
                (4, Op::Goto { target: 7 }),
                (5, Op::PushConst(ConstValue::Null)),
                (6, Op::StoreLocal(1)),
                (7, Op::LoadLocal(1)),
                (8, Op::Pop),
                (9, Op::Return),
            ],
        );
        let (cfg, numbering, flow) = dataflow_of(&method, QualifierDatabase::default());
        // The loaded value is a phi of an Always string and a Never null.
        let value = top_before(&numbering, &cfg, 8);
        assert_eq!(
            flow.strength_before(index_of(&cfg, 8), value),
            Strength::Unknown
        );
    }
}
