use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::cache::{AnalysisCache, ControlFlowFactory};
use crate::dataflow::deref::UnconditionalDerefFactory;
use crate::dataflow::nullness::DefiniteNullFactory;
use crate::dataflow::qual::QualifierFactory;
use crate::dataflow::vna::ValueNumberingFactory;
use crate::detect::null_deref::{ALWAYS_NULL, NULL_PARAM_DEREF, NullDerefDetector};
use crate::detect::return_mismatch::{NONNULL_RETURN_VIOLATION, ReturnMismatchDetector};
use crate::detect::return_summary::ReturnSummaryDetector;
use crate::detect::unconditional_deref::{
    EQUALS_SHOULD_HANDLE_NULL, PARAM_MARKED_NULLABLE, PARAM_MUST_BE_NONNULL,
    UnconditionalParamDerefDetector,
};
use crate::errors::{AnalysisError, ConfigError};
use crate::ir::Program;
use crate::orchestrator::{ExecutionPlan, Orchestrator, build_plan};
use crate::plugin::{
    BugCategory, BugPattern, ConstraintScope, DetectorConstructors, DetectorFactory,
    DetectorSpeed, DetectorTraits, OrderingConstraint, Plugin, PluginRegistry, detector_ctor,
};
use crate::qualifiers::{
    MethodSummaries, QualifierDatabase, QualifierId, QualifierSet,
};
use crate::report::Reporter;

pub const CORE_PLUGIN_ID: &str = "core";

const UNCONDITIONAL_DEREF_DETECTOR: &str = "faultline.detect.UnconditionalParamDeref";
const RETURN_SUMMARY_DETECTOR: &str = "faultline.detect.ReturnSummary";
const NULL_DEREF_DETECTOR: &str = "faultline.detect.NullDeref";
const RETURN_MISMATCH_DETECTOR: &str = "faultline.detect.ReturnMismatch";

/// Per-run knobs, shared by reference with every detector context.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Widen detector scope from application classes to every modeled class.
    pub analyze_referenced_classes: bool,
    pub suppress_missing_class_warnings: bool,
    /// Visit classes on a worker pool when a pass allows it.
    pub parallel: bool,
    cancel: Arc<AtomicBool>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            analyze_referenced_classes: false,
            suppress_missing_class_warnings: false,
            parallel: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl EngineOptions {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Ask the run to stop at the next class boundary. Callable from another
    /// thread through a clone of the options.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

/// One configured analysis run: program model, plugins, analysis factories,
/// and the detector execution plan.
pub struct AnalysisSession {
    orchestrator: Orchestrator,
    plan: ExecutionPlan,
}

impl AnalysisSession {
    pub fn new(
        program: Arc<Program>,
        registry: &PluginRegistry,
        options: EngineOptions,
    ) -> Result<Self, ConfigError> {
        let mut database = QualifierDatabase::with_defaults();
        for rule in registry.rules() {
            database.add_explicit(rule.clone());
        }
        let database = Arc::new(database);
        let qualifiers = QualifierSet::with_defaults();
        let nonnull = qualifiers
            .lookup(&QualifierId::nonnull())
            .cloned()
            .ok_or_else(|| ConfigError::UnknownQualifier(QualifierId::nonnull().to_string()))?;
        let summaries = Arc::new(MethodSummaries::default());

        let mut cache = AnalysisCache::new(program);
        cache.register(Arc::new(ControlFlowFactory));
        cache.register(Arc::new(ValueNumberingFactory));
        cache.register(Arc::new(DefiniteNullFactory));
        cache.register(Arc::new(UnconditionalDerefFactory));
        cache.register(Arc::new(QualifierFactory::new(
            nonnull,
            database.clone(),
            summaries.clone(),
        )));
        cache.verify_factories()?;

        let plan = build_plan(&registry.enabled_detectors(), &registry.constraints())?;
        info!(
            passes = plan.len(),
            detectors = plan.iter().map(Vec::len).sum::<usize>(),
            "session configured"
        );
        Ok(AnalysisSession {
            orchestrator: Orchestrator {
                cache: Arc::new(cache),
                database,
                summaries,
                options,
            },
            plan,
        })
    }

    pub fn cache(&self) -> &AnalysisCache {
        &self.orchestrator.cache
    }

    pub fn options(&self) -> &EngineOptions {
        &self.orchestrator.options
    }

    pub fn run(&self, reporter: &dyn Reporter) -> Result<(), AnalysisError> {
        self.orchestrator.run(&self.plan, reporter)
    }
}

/// Constructor table for the detectors compiled into this crate, used to
/// resolve plugin descriptors.
pub fn detector_constructors() -> DetectorConstructors {
    let mut constructors = DetectorConstructors::new();
    constructors.insert(
        UNCONDITIONAL_DEREF_DETECTOR.to_string(),
        detector_ctor(|| Arc::new(UnconditionalParamDerefDetector)),
    );
    constructors.insert(
        RETURN_SUMMARY_DETECTOR.to_string(),
        detector_ctor(|| Arc::new(ReturnSummaryDetector)),
    );
    constructors.insert(
        NULL_DEREF_DETECTOR.to_string(),
        detector_ctor(|| Arc::new(NullDerefDetector)),
    );
    constructors.insert(
        RETURN_MISMATCH_DETECTOR.to_string(),
        detector_ctor(|| Arc::new(ReturnMismatchDetector)),
    );
    constructors
}

/// The built-in plugin: always loaded first, never unloadable.
pub fn core_plugin() -> Plugin {
    let categories = vec![
        BugCategory {
            id: "CORRECTNESS".to_string(),
            description: "Probable bug - an apparent coding mistake".to_string(),
        },
        BugCategory {
            id: "BAD_PRACTICE".to_string(),
            description: "Violation of recommended coding practice".to_string(),
        },
    ];
    let patterns = vec![
        BugPattern {
            code: PARAM_MUST_BE_NONNULL.to_string(),
            category: "CORRECTNESS".to_string(),
            description: "Method parameter is dereferenced on every path".to_string(),
        },
        BugPattern {
            code: PARAM_MARKED_NULLABLE.to_string(),
            category: "CORRECTNESS".to_string(),
            description: "Nullable parameter is dereferenced on every path".to_string(),
        },
        BugPattern {
            code: EQUALS_SHOULD_HANDLE_NULL.to_string(),
            category: "BAD_PRACTICE".to_string(),
            description: "equals(Object) dereferences its argument without a null check"
                .to_string(),
        },
        BugPattern {
            code: ALWAYS_NULL.to_string(),
            category: "CORRECTNESS".to_string(),
            description: "A value known to be null is dereferenced".to_string(),
        },
        BugPattern {
            code: NULL_PARAM_DEREF.to_string(),
            category: "CORRECTNESS".to_string(),
            description: "Null is passed for a parameter the callee always dereferences"
                .to_string(),
        },
        BugPattern {
            code: NONNULL_RETURN_VIOLATION.to_string(),
            category: "CORRECTNESS".to_string(),
            description: "Method declared to return nonnull may return null".to_string(),
        },
    ];
    let detectors = vec![
        DetectorFactory::new(
            "UnconditionalParamDeref",
            UNCONDITIONAL_DEREF_DETECTOR,
            0,
            DetectorSpeed::Slow,
            DetectorTraits {
                reports: vec![
                    PARAM_MUST_BE_NONNULL.to_string(),
                    PARAM_MARKED_NULLABLE.to_string(),
                    EQUALS_SHOULD_HANDLE_NULL.to_string(),
                ],
                stateless: true,
            },
            detector_ctor(|| Arc::new(UnconditionalParamDerefDetector)),
        ),
        DetectorFactory::new(
            "ReturnSummary",
            RETURN_SUMMARY_DETECTOR,
            0,
            DetectorSpeed::Moderate,
            DetectorTraits {
                reports: Vec::new(),
                stateless: true,
            },
            detector_ctor(|| Arc::new(ReturnSummaryDetector)),
        ),
        DetectorFactory::new(
            "NullDeref",
            NULL_DEREF_DETECTOR,
            1,
            DetectorSpeed::Moderate,
            DetectorTraits {
                reports: vec![ALWAYS_NULL.to_string(), NULL_PARAM_DEREF.to_string()],
                stateless: true,
            },
            detector_ctor(|| Arc::new(NullDerefDetector)),
        ),
        DetectorFactory::new(
            "ReturnMismatch",
            RETURN_MISMATCH_DETECTOR,
            1,
            DetectorSpeed::Fast,
            DetectorTraits {
                reports: vec![NONNULL_RETURN_VIOLATION.to_string()],
                stateless: true,
            },
            detector_ctor(|| Arc::new(ReturnMismatchDetector)),
        ),
    ];
    // The summary database filled in pass 0 feeds the nullness checks of
    // pass 1.
    let constraints = vec![
        OrderingConstraint {
            earlier: UNCONDITIONAL_DEREF_DETECTOR.to_string(),
            later: NULL_DEREF_DETECTOR.to_string(),
            scope: ConstraintScope::InterPass,
        },
        OrderingConstraint {
            earlier: RETURN_SUMMARY_DETECTOR.to_string(),
            later: RETURN_MISMATCH_DETECTOR.to_string(),
            scope: ConstraintScope::InterPass,
        },
        OrderingConstraint {
            earlier: NULL_DEREF_DETECTOR.to_string(),
            later: RETURN_MISMATCH_DETECTOR.to_string(),
            scope: ConstraintScope::IntraPass,
        },
    ];
    Plugin {
        id: CORE_PLUGIN_ID.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        detectors,
        categories,
        patterns,
        constraints,
        rules: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        CallKind, CallSite, Class, ConstValue, Instruction, Method, MethodAccess, Op,
    };
    use crate::qualifiers::{QualifierId, QualifierRule, RuleTarget, Strength};
    use crate::report::{CollectingReporter, PRIORITY_HIGH};

    fn instruction(offset: u32, op: Op) -> Instruction {
        Instruction { offset, op }
    }

    fn hash_code_call() -> Op {
        Op::Invoke(CallSite {
            owner: "java/lang/Object".to_string(),
            name: "hashCode".to_string(),
            descriptor: "()I".to_string(),
            kind: CallKind::Virtual,
        })
    }

    fn class_of(methods: Vec<Method>) -> Class {
        Class {
            name: "com/example/App".to_string(),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: Vec::new(),
            is_final: false,
            is_application: true,
            methods,
            artifact_uri: None,
        }
    }

    fn deref_param_method() -> Method {
        Method {
            name: "use".to_string(),
            descriptor: "(Ljava/lang/Object;)V".to_string(),
            access: MethodAccess::default(),
            max_locals: 2,
            instructions: vec![
                instruction(0, Op::LoadLocal(1)),
                instruction(1, hash_code_call()),
                instruction(2, Op::Pop),
                instruction(3, Op::Return),
            ],
            exception_handlers: Vec::new(),
        }
    }

    fn session_of(program: Program, registry: &PluginRegistry) -> AnalysisSession {
        AnalysisSession::new(Arc::new(program), registry, EngineOptions::default())
            .expect("session")
    }

    #[test]
    fn unconditional_parameter_dereference_is_reported_once() {
        let program = Program {
            classes: vec![class_of(vec![deref_param_method()])],
        };
        let registry = PluginRegistry::with_core(core_plugin());
        let session = session_of(program, &registry);
        let reporter = CollectingReporter::new();
        session.run(&reporter).expect("run");
        let defects = reporter.into_defects();
        assert_eq!(defects.len(), 1);
        assert_eq!(defects[0].pattern, PARAM_MUST_BE_NONNULL);
    }

    #[test]
    fn null_argument_to_summarized_callee_is_reported() {
        let caller = Method {
            name: "call".to_string(),
            descriptor: "()V".to_string(),
            access: MethodAccess::default(),
            max_locals: 1,
            instructions: vec![
                instruction(0, Op::LoadLocal(0)),
                instruction(1, Op::PushConst(ConstValue::Null)),
                instruction(
                    2,
                    Op::Invoke(CallSite {
                        owner: "com/example/App".to_string(),
                        name: "use".to_string(),
                        descriptor: "(Ljava/lang/Object;)V".to_string(),
                        kind: CallKind::Virtual,
                    }),
                ),
                instruction(3, Op::Return),
            ],
            exception_handlers: Vec::new(),
        };
        let program = Program {
            classes: vec![class_of(vec![deref_param_method(), caller])],
        };
        let registry = PluginRegistry::with_core(core_plugin());
        let session = session_of(program, &registry);
        let reporter = CollectingReporter::new();
        session.run(&reporter).expect("run");
        let defects = reporter.into_defects();
        let defect = defects
            .iter()
            .find(|defect| defect.pattern == NULL_PARAM_DEREF)
            .expect("null argument pattern");
        assert_eq!(defect.method().map(|m| m.name.as_str()), Some("call"));
        assert_eq!(defect.priority, PRIORITY_HIGH);
    }

    #[test]
    fn observed_return_strengths_are_recorded() {
        let method = Method {
            name: "supply".to_string(),
            descriptor: "()Ljava/lang/Object;".to_string(),
            access: MethodAccess::default(),
            max_locals: 1,
            instructions: vec![
                instruction(0, Op::PushConst(ConstValue::Null)),
                instruction(1, Op::ReturnValue),
            ],
            exception_handlers: Vec::new(),
        };
        let program = Program {
            classes: vec![class_of(vec![method])],
        };
        let registry = PluginRegistry::with_core(core_plugin());
        let session = session_of(program, &registry);
        let reporter = CollectingReporter::new();
        session.run(&reporter).expect("run");
        let descriptor = crate::ir::MethodDescriptor {
            class_name: "com/example/App".to_string(),
            name: "supply".to_string(),
            descriptor: "()Ljava/lang/Object;".to_string(),
        };
        assert_eq!(
            session
                .orchestrator
                .summaries
                .return_strength(&descriptor, &QualifierId::nonnull()),
            Some(Strength::Never)
        );
    }

    #[test]
    fn nullable_parameter_dereference_raises_priority() {
        let program = Program {
            classes: vec![class_of(vec![deref_param_method()])],
        };
        let mut core = core_plugin();
        core.rules.push(QualifierRule {
            target: RuleTarget::Parameter {
                class_name: "com/example/App".to_string(),
                method: "use".to_string(),
                descriptor: "(Ljava/lang/Object;)V".to_string(),
                index: 0,
            },
            qualifier: QualifierId::nonnull(),
            strength: Strength::Maybe,
        });
        let registry = PluginRegistry::with_core(core);
        let session = session_of(program, &registry);
        let reporter = CollectingReporter::new();
        session.run(&reporter).expect("run");
        let defects = reporter.into_defects();
        let defect = defects
            .iter()
            .find(|defect| defect.pattern == PARAM_MARKED_NULLABLE)
            .expect("nullable pattern");
        assert_eq!(defect.priority, PRIORITY_HIGH);
    }

    #[test]
    fn definite_null_dereference_is_reported_high() {
        let method = Method {
            name: "boom".to_string(),
            descriptor: "()V".to_string(),
            access: MethodAccess::default(),
            max_locals: 2,
            instructions: vec![
                instruction(0, Op::PushConst(ConstValue::Null)),
                instruction(1, Op::StoreLocal(1)),
                instruction(2, Op::LoadLocal(1)),
                instruction(3, hash_code_call()),
                instruction(4, Op::Pop),
                instruction(5, Op::Return),
            ],
            exception_handlers: Vec::new(),
        };
        let program = Program {
            classes: vec![class_of(vec![method])],
        };
        let registry = PluginRegistry::with_core(core_plugin());
        let session = session_of(program, &registry);
        let reporter = CollectingReporter::new();
        session.run(&reporter).expect("run");
        let defects = reporter.into_defects();
        let defect = defects
            .iter()
            .find(|defect| defect.pattern == ALWAYS_NULL)
            .expect("always-null pattern");
        assert_eq!(defect.priority, PRIORITY_HIGH);
    }

    #[test]
    fn classpath_classes_are_skipped_by_default() {
        let mut class = class_of(vec![deref_param_method()]);
        class.is_application = false;
        let program = Program {
            classes: vec![class],
        };
        let registry = PluginRegistry::with_core(core_plugin());
        let session = session_of(program, &registry);
        let reporter = CollectingReporter::new();
        session.run(&reporter).expect("run");
        assert!(reporter.into_defects().is_empty());
    }

    #[test]
    fn cancellation_stops_the_run() {
        let program = Program {
            classes: vec![class_of(vec![deref_param_method()])],
        };
        let registry = PluginRegistry::with_core(core_plugin());
        let session = session_of(program, &registry);
        session.options().request_cancel();
        let reporter = CollectingReporter::new();
        assert!(matches!(
            session.run(&reporter),
            Err(AnalysisError::Cancelled)
        ));
    }

    #[test]
    fn nonnull_return_violation_is_reported() {
        let method = Method {
            name: "supply".to_string(),
            descriptor: "()Ljava/lang/Object;".to_string(),
            access: MethodAccess::default(),
            max_locals: 1,
            instructions: vec![
                instruction(0, Op::PushConst(ConstValue::Null)),
                instruction(1, Op::ReturnValue),
            ],
            exception_handlers: Vec::new(),
        };
        let program = Program {
            classes: vec![class_of(vec![method])],
        };
        let mut core = core_plugin();
        core.rules.push(QualifierRule {
            target: RuleTarget::Return {
                class_name: "com/example/App".to_string(),
                method: "supply".to_string(),
                descriptor: "()Ljava/lang/Object;".to_string(),
            },
            qualifier: QualifierId::nonnull(),
            strength: Strength::Always,
        });
        let registry = PluginRegistry::with_core(core);
        let session = session_of(program, &registry);
        let reporter = CollectingReporter::new();
        session.run(&reporter).expect("run");
        let defects = reporter.into_defects();
        assert!(defects
            .iter()
            .any(|defect| defect.pattern == NONNULL_RETURN_VIOLATION));
    }

    fn equals_method(guarded: bool) -> Method {
        let mut instructions = vec![
            instruction(0, Op::LoadLocal(1)),
            instruction(1, hash_code_call()),
            instruction(2, Op::Pop),
            instruction(3, Op::PushConst(ConstValue::Int(1))),
            instruction(4, Op::ReturnValue),
        ];
        let mut exception_handlers = Vec::new();
        if guarded {
            instructions.push(instruction(5, Op::PushConst(ConstValue::Int(0))));
            instructions.push(instruction(6, Op::ReturnValue));
            exception_handlers.push(crate::ir::ExceptionHandler {
                start_pc: 0,
                end_pc: 5,
                handler_pc: 5,
                catch_type: Some("java/lang/NullPointerException".to_string()),
            });
        }
        Method {
            name: "equals".to_string(),
            descriptor: "(Ljava/lang/Object;)Z".to_string(),
            access: MethodAccess::default(),
            max_locals: 2,
            instructions,
            exception_handlers,
        }
    }

    #[test]
    fn unguarded_equals_is_reported_as_bad_practice() {
        let program = Program {
            classes: vec![class_of(vec![equals_method(false)])],
        };
        let registry = PluginRegistry::with_core(core_plugin());
        let session = session_of(program, &registry);
        let reporter = CollectingReporter::new();
        session.run(&reporter).expect("run");
        let defects = reporter.into_defects();
        assert!(defects
            .iter()
            .any(|defect| defect.pattern == EQUALS_SHOULD_HANDLE_NULL));
        assert!(defects
            .iter()
            .all(|defect| defect.pattern != PARAM_MUST_BE_NONNULL));
    }

    #[test]
    fn equals_guarded_by_catching_npe_is_not_reported() {
        let program = Program {
            classes: vec![class_of(vec![equals_method(true)])],
        };
        let registry = PluginRegistry::with_core(core_plugin());
        let session = session_of(program, &registry);
        let reporter = CollectingReporter::new();
        session.run(&reporter).expect("run");
        assert!(reporter.into_defects().is_empty());
    }

    #[test]
    fn summaries_feed_later_passes() {
        // Pass 0 records that callee(Object) always dereferences its
        // parameter; the summary is queryable after the run.
        let program = Program {
            classes: vec![class_of(vec![deref_param_method()])],
        };
        let registry = PluginRegistry::with_core(core_plugin());
        let session = session_of(program, &registry);
        let reporter = CollectingReporter::new();
        session.run(&reporter).expect("run");
        let descriptor = crate::ir::MethodDescriptor {
            class_name: "com/example/App".to_string(),
            name: "use".to_string(),
            descriptor: "(Ljava/lang/Object;)V".to_string(),
        };
        let params = session
            .orchestrator
            .summaries
            .unconditional_params(&descriptor)
            .expect("summary recorded");
        assert!(params.contains(&0));
    }
}
