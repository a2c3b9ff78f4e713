use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::cache::AnalysisCache;
use crate::detect::{ClassContext, Detector, FinishContext};
use crate::errors::{AnalysisError, ConfigError};
use crate::ir::Class;
use crate::plugin::{ConstraintScope, DetectorFactory, OrderingConstraint};
use crate::qualifiers::{MethodSummaries, QualifierDatabase};
use crate::report::Reporter;
use crate::session::EngineOptions;

/// Detector schedule: passes in execution order, each pass ordered by its
/// intra-pass constraints.
pub type ExecutionPlan = Vec<Vec<DetectorFactory>>;

/// Build the execution plan for the enabled detectors.
///
/// Passes run in ascending pass number. An inter-pass constraint whose
/// earlier detector does not sit in a strictly earlier pass is unsatisfiable
/// and rejected. Within a pass, constraints are resolved by topological sort;
/// ties keep registration order, so the plan is deterministic.
pub fn build_plan(
    factories: &[&DetectorFactory],
    constraints: &[&OrderingConstraint],
) -> Result<ExecutionPlan, ConfigError> {
    let pass_of: HashMap<&str, usize> = factories
        .iter()
        .map(|factory| (factory.full_name.as_str(), factory.pass))
        .collect();
    for constraint in constraints {
        if constraint.scope != ConstraintScope::InterPass {
            continue;
        }
        let (Some(earlier), Some(later)) = (
            pass_of.get(constraint.earlier.as_str()),
            pass_of.get(constraint.later.as_str()),
        ) else {
            continue;
        };
        if earlier >= later {
            return Err(ConfigError::OrderingCycle(constraint.later.clone()));
        }
    }

    let mut passes: BTreeMap<usize, Vec<DetectorFactory>> = BTreeMap::new();
    for factory in factories {
        passes
            .entry(factory.pass)
            .or_default()
            .push((*factory).clone());
    }
    passes
        .into_values()
        .map(|members| order_within_pass(members, constraints))
        .collect()
}

fn order_within_pass(
    members: Vec<DetectorFactory>,
    constraints: &[&OrderingConstraint],
) -> Result<Vec<DetectorFactory>, ConfigError> {
    let index_of: HashMap<&str, usize> = members
        .iter()
        .enumerate()
        .map(|(index, factory)| (factory.full_name.as_str(), index))
        .collect();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); members.len()];
    let mut indegree = vec![0usize; members.len()];
    for constraint in constraints {
        if constraint.scope != ConstraintScope::IntraPass {
            continue;
        }
        let (Some(&earlier), Some(&later)) = (
            index_of.get(constraint.earlier.as_str()),
            index_of.get(constraint.later.as_str()),
        ) else {
            continue;
        };
        successors[earlier].push(later);
        indegree[later] += 1;
    }

    let mut ready: BTreeSet<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(index, _)| index)
        .collect();
    let mut order = Vec::with_capacity(members.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(next);
        for &successor in &successors[next] {
            indegree[successor] -= 1;
            if indegree[successor] == 0 {
                ready.insert(successor);
            }
        }
    }
    if order.len() != members.len() {
        let stuck = indegree
            .iter()
            .position(|degree| *degree > 0)
            .map(|index| members[index].full_name.clone())
            .unwrap_or_default();
        return Err(ConfigError::OrderingCycle(stuck));
    }

    let mut slots: Vec<Option<DetectorFactory>> = members.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|index| slots[index].take())
        .collect())
}

/// Drives detector passes over the program.
pub struct Orchestrator {
    pub cache: Arc<AnalysisCache>,
    pub database: Arc<QualifierDatabase>,
    pub summaries: Arc<MethodSummaries>,
    pub options: EngineOptions,
}

impl Orchestrator {
    /// Run every pass of `plan` over every class.
    ///
    /// A detector failing on one class skips that class for that detector
    /// only; the failure is logged and the run continues. Cancellation is
    /// checked between classes and aborts the run.
    pub fn run(&self, plan: &ExecutionPlan, reporter: &dyn Reporter) -> Result<(), AnalysisError> {
        let program = self.cache.program();
        for (pass_index, pass) in plan.iter().enumerate() {
            let detectors: Vec<(&str, Arc<dyn Detector>)> = pass
                .iter()
                .map(|factory| (factory.short_name.as_str(), factory.create()))
                .collect();

            let visit = |class: &Class| -> Result<(), AnalysisError> {
                if self.options.is_cancelled() {
                    return Err(AnalysisError::Cancelled);
                }
                let context = ClassContext {
                    cache: &self.cache,
                    class,
                    database: &self.database,
                    summaries: &self.summaries,
                    options: &self.options,
                    reporter,
                };
                for (name, detector) in &detectors {
                    if let Err(error) = detector.visit_class(&context) {
                        if error.is_missing_resolution()
                            && self.options.suppress_missing_class_warnings
                        {
                            debug!(detector = name, class = %class.name, %error, "suppressed");
                            continue;
                        }
                        warn!(detector = name, class = %class.name, %error, "detector failed");
                        reporter.log(&format!(
                            "detector {name} failed on {}: {error}",
                            class.name
                        ));
                    }
                }
                Ok(())
            };

            // Parallel visits need every detector in the pass to be free of
            // cross-class state.
            let parallel =
                self.options.parallel && pass.iter().all(|factory| factory.traits.stateless);
            if parallel {
                program.classes.par_iter().try_for_each(visit)?;
            } else {
                for class in &program.classes {
                    visit(class)?;
                }
            }
            debug!(pass = pass_index, detectors = detectors.len(), "pass complete");

            let context = FinishContext {
                cache: &self.cache,
                program,
                database: &self.database,
                summaries: &self.summaries,
                options: &self.options,
                reporter,
            };
            for (name, detector) in &detectors {
                if let Err(error) = detector.finish(&context) {
                    warn!(detector = name, %error, "detector finish failed");
                    reporter.log(&format!("detector {name} failed to finish: {error}"));
                }
            }
        }
        Ok(())
    }
}
