use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::warn;

use crate::cache::AnalysisKind;
use crate::dataflow::deref::UnconditionalDeref;
use crate::dataflow::vna::ValueNumbering;
use crate::descriptor::MethodSignature;
use crate::detect::{ClassContext, Detector, is_analysis_target};
use crate::errors::AnalysisError;
use crate::ir::{Class, ConstValue, Method, Op};
use crate::qualifiers::{QualifierId, Strength};
use crate::report::{DefectReport, PRIORITY_NORMAL, raise_priority};

pub const PARAM_MUST_BE_NONNULL: &str = "NP_PARAMETER_MUST_BE_NONNULL";
pub const PARAM_MARKED_NULLABLE: &str = "NP_PARAMETER_MUST_BE_NONNULL_BUT_MARKED_AS_NULLABLE";
pub const EQUALS_SHOULD_HANDLE_NULL: &str = "NP_EQUALS_SHOULD_HANDLE_NULL_ARGUMENT";

/// Reports reference parameters that every path dereferences, and records
/// them in the interprocedural summary database for later passes.
pub struct UnconditionalParamDerefDetector;

impl UnconditionalParamDerefDetector {
    fn check_method(
        &self,
        context: &ClassContext<'_>,
        class: &Class,
        method: &Method,
    ) -> Result<(), AnalysisError> {
        let descriptor = method.descriptor_for(class);
        let signature = MethodSignature::parse(&method.descriptor)?;
        if !signature.has_reference_params() {
            return Ok(());
        }

        let numbering: Arc<ValueNumbering> = context
            .cache
            .get_as(&descriptor, &AnalysisKind::ValueNumbering)?;
        let derefs: Arc<UnconditionalDeref> = context
            .cache
            .get_as(&descriptor, &AnalysisKind::UnconditionalDeref)?;
        let entry_derefs = derefs.entry_derefs();

        let nonnull = QualifierId::nonnull();
        let mut unconditional = BTreeSet::new();
        for (index, param) in signature.params.iter().enumerate() {
            if !param.is_reference {
                continue;
            }
            let slot = signature.param_slot(index, method.access.is_static);
            let Some(value) = numbering.entry_value(slot) else {
                continue;
            };
            if !entry_derefs.contains(&value) {
                continue;
            }
            unconditional.insert(index);

            let declared = context.database.parameter_strength(
                &class.name,
                &method.name,
                &method.descriptor,
                index,
                &nonnull,
            );
            if is_equals_object(method) {
                if declared.is_none() && null_guard_returns_false(method) {
                    continue;
                }
                context.reporter.report(
                    DefectReport::new(EQUALS_SHOULD_HANDLE_NULL, PRIORITY_NORMAL)
                        .with_class(&class.name)
                        .with_method(descriptor.clone())
                        .with_parameter(index),
                );
                continue;
            }

            let pattern = match declared {
                Some(Strength::Never) | Some(Strength::Maybe) => PARAM_MARKED_NULLABLE,
                _ => PARAM_MUST_BE_NONNULL,
            };
            let mut priority = PRIORITY_NORMAL;
            if matches!(declared, Some(strength) if strength != Strength::Unknown) {
                priority = raise_priority(priority);
            }
            if method.is_effectively_final() || class.is_final {
                priority = raise_priority(priority);
            }
            context.reporter.report(
                DefectReport::new(pattern, priority)
                    .with_class(&class.name)
                    .with_method(descriptor.clone())
                    .with_parameter(index),
            );
        }

        context
            .summaries
            .record_unconditional_params(descriptor, unconditional);
        Ok(())
    }
}

impl Detector for UnconditionalParamDerefDetector {
    fn visit_class(&self, context: &ClassContext<'_>) -> Result<(), AnalysisError> {
        if !is_analysis_target(context.class, context.options) {
            return Ok(());
        }
        for method in &context.class.methods {
            if !method.has_body() || method.access.is_abstract {
                continue;
            }
            if let Err(error) = self.check_method(context, context.class, method) {
                warn!(
                    class = %context.class.name,
                    method = %method.name,
                    %error,
                    "skipping method"
                );
            }
        }
        Ok(())
    }
}

fn is_equals_object(method: &Method) -> bool {
    method.name == "equals"
        && method.descriptor == "(Ljava/lang/Object;)Z"
        && !method.access.is_static
}

/// Recognizes equals bodies wrapped in a catch of NullPointerException whose
/// handler just returns false. Such methods handle a null argument even
/// though they dereference it blindly.
fn null_guard_returns_false(method: &Method) -> bool {
    let Some(first) = method.instructions.first() else {
        return false;
    };
    method.exception_handlers.iter().any(|handler| {
        if handler.catch_type.as_deref() != Some("java/lang/NullPointerException") {
            return false;
        }
        if handler.start_pc > first.offset {
            return false;
        }
        let body_covered = method
            .instructions
            .iter()
            .filter(|inst| inst.offset < handler.handler_pc)
            .all(|inst| inst.offset < handler.end_pc);
        if !body_covered {
            return false;
        }
        let mut tail = method
            .instructions
            .iter()
            .skip_while(|inst| inst.offset != handler.handler_pc);
        matches!(
            (tail.next().map(|i| &i.op), tail.next().map(|i| &i.op)),
            (
                Some(Op::PushConst(ConstValue::Int(0))),
                Some(Op::ReturnValue)
            )
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CallKind, CallSite, ExceptionHandler, Instruction, MethodAccess};

    fn deref_param_body() -> Vec<Instruction> {
        [
            (0, Op::LoadLocal(1)),
            (
                1,
                Op::Invoke(CallSite {
                    owner: "java/lang/Object".to_string(),
                    name: "hashCode".to_string(),
                    descriptor: "()I".to_string(),
                    kind: CallKind::Virtual,
                }),
            ),
            (2, Op::Pop),
            (3, Op::PushConst(ConstValue::Int(1))),
            (4, Op::ReturnValue),
        ]
        .into_iter()
        .map(|(offset, op)| Instruction { offset, op })
        .collect()
    }

    fn equals_method(handlers: Vec<ExceptionHandler>, extra: Vec<Instruction>) -> Method {
        let mut instructions = deref_param_body();
        instructions.extend(extra);
        Method {
            name: "equals".to_string(),
            descriptor: "(Ljava/lang/Object;)Z".to_string(),
            access: MethodAccess::default(),
            max_locals: 2,
            instructions,
            exception_handlers: handlers,
        }
    }

    #[test]
    fn recognizes_the_catch_npe_return_false_shape() {
        let handler = ExceptionHandler {
            start_pc: 0,
            end_pc: 5,
            handler_pc: 5,
            catch_type: Some("java/lang/NullPointerException".to_string()),
        };
        let guarded = equals_method(
            vec![handler],
            vec![
                Instruction {
                    offset: 5,
                    op: Op::PushConst(ConstValue::Int(0)),
                },
                Instruction {
                    offset: 6,
                    op: Op::ReturnValue,
                },
            ],
        );
        assert!(null_guard_returns_false(&guarded));
    }

    #[test]
    fn other_handlers_are_not_a_null_guard() {
        let wrong_type = ExceptionHandler {
            start_pc: 0,
            end_pc: 5,
            handler_pc: 5,
            catch_type: Some("java/lang/Exception".to_string()),
        };
        let partial = ExceptionHandler {
            start_pc: 2,
            end_pc: 5,
            handler_pc: 5,
            catch_type: Some("java/lang/NullPointerException".to_string()),
        };
        let tail = vec![
            Instruction {
                offset: 5,
                op: Op::PushConst(ConstValue::Int(0)),
            },
            Instruction {
                offset: 6,
                op: Op::ReturnValue,
            },
        ];
        assert!(!null_guard_returns_false(&equals_method(
            vec![wrong_type],
            tail.clone()
        )));
        assert!(!null_guard_returns_false(&equals_method(vec![partial], tail)));
        assert!(!null_guard_returns_false(&equals_method(Vec::new(), Vec::new())));
    }

    #[test]
    fn equals_object_shape_is_exact() {
        let mut method = equals_method(Vec::new(), Vec::new());
        assert!(is_equals_object(&method));
        method.access.is_static = true;
        assert!(!is_equals_object(&method));
        method.access.is_static = false;
        method.descriptor = "(Lcom/example/App;)Z".to_string();
        assert!(!is_equals_object(&method));
    }
}
