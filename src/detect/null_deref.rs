use std::sync::Arc;

use tracing::warn;

use crate::cache::AnalysisKind;
use crate::dataflow::deref::dereferenced_value;
use crate::dataflow::nullness::DefiniteNull;
use crate::dataflow::vna::{Frame, ValueNumbering};
use crate::descriptor::MethodSignature;
use crate::detect::{ClassContext, Detector, is_analysis_target};
use crate::errors::AnalysisError;
use crate::ir::{Class, Method, MethodDescriptor, Op};
use crate::report::{DefectReport, PRIORITY_HIGH};

pub const ALWAYS_NULL: &str = "NP_ALWAYS_NULL";
pub const NULL_PARAM_DEREF: &str = "NP_NULL_PARAM_DEREF";

/// Reports dereferences of values that are null on every path reaching them,
/// including null arguments handed to a callee whose summary proves it
/// unconditionally dereferences that parameter.
pub struct NullDerefDetector;

impl NullDerefDetector {
    fn check_method(
        &self,
        context: &ClassContext<'_>,
        class: &Class,
        method: &Method,
    ) -> Result<(), AnalysisError> {
        let descriptor = method.descriptor_for(class);
        let cfg = context.cache.cfg(&descriptor)?;
        let numbering: Arc<ValueNumbering> = context
            .cache
            .get_as(&descriptor, &AnalysisKind::ValueNumbering)?;
        let nullness: Arc<DefiniteNull> = context
            .cache
            .get_as(&descriptor, &AnalysisKind::DefiniteNull)?;

        for location in cfg.locations() {
            let index = cfg.location_index(location);
            let instruction = cfg.instruction_at(location);
            let frame = numbering.frame_before(index);
            if let Some(target) = dereferenced_value(&instruction.op, frame)? {
                if nullness.is_definitely_null(index, target) {
                    context.reporter.report(
                        DefectReport::new(ALWAYS_NULL, PRIORITY_HIGH)
                            .with_class(&class.name)
                            .with_method(descriptor.clone())
                            .with_offset(instruction.offset),
                    );
                }
            }

            let Op::Invoke(call) = &instruction.op else {
                continue;
            };
            let callee = MethodDescriptor {
                class_name: call.owner.clone(),
                name: call.name.clone(),
                descriptor: call.descriptor.clone(),
            };
            let Some(params) = context.summaries.unconditional_params(&callee) else {
                continue;
            };
            let signature = MethodSignature::parse(&call.descriptor)?;
            let Frame::Valid { stack, .. } = frame else {
                continue;
            };
            let Some(base) = stack.len().checked_sub(signature.param_count()) else {
                continue;
            };
            for param in params {
                let Some(argument) = stack.get(base + param).copied() else {
                    continue;
                };
                if nullness.is_definitely_null(index, argument) {
                    context.reporter.report(
                        DefectReport::new(NULL_PARAM_DEREF, PRIORITY_HIGH)
                            .with_class(&class.name)
                            .with_method(descriptor.clone())
                            .with_parameter(param)
                            .with_offset(instruction.offset),
                    );
                }
            }
        }
        Ok(())
    }
}

impl Detector for NullDerefDetector {
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
