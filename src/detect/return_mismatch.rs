use std::sync::Arc;

use tracing::warn;

use crate::cache::AnalysisKind;
use crate::dataflow::qual::QualifierDataflow;
use crate::dataflow::vna::{Frame, ValueNumbering};
use crate::descriptor::{MethodSignature, ReturnKind};
use crate::detect::{ClassContext, Detector, is_analysis_target};
use crate::errors::AnalysisError;
use crate::ir::{Class, Method, Op};
use crate::qualifiers::{QualifierId, Strength};
use crate::report::{DefectReport, PRIORITY_HIGH};

pub const NONNULL_RETURN_VIOLATION: &str = "NP_NONNULL_RETURN_VIOLATION";

/// Reports return statements handing back a never-nonnull value from a
/// method whose return is declared always nonnull.
pub struct ReturnMismatchDetector;

impl ReturnMismatchDetector {
    fn check_method(
        &self,
        context: &ClassContext<'_>,
        class: &Class,
        method: &Method,
    ) -> Result<(), AnalysisError> {
        let signature = MethodSignature::parse(&method.descriptor)?;
        if signature.return_kind != ReturnKind::Reference {
            return Ok(());
        }
        let nonnull = QualifierId::nonnull();
        let declared = context.database.return_strength(
            &class.name,
            &method.name,
            &method.descriptor,
            &nonnull,
        );
        if declared != Some(Strength::Always) {
            return Ok(());
        }

        let descriptor = method.descriptor_for(class);
        let cfg = context.cache.cfg(&descriptor)?;
        let numbering: Arc<ValueNumbering> = context
            .cache
            .get_as(&descriptor, &AnalysisKind::ValueNumbering)?;
        let flow: Arc<QualifierDataflow> = context
            .cache
            .get_as(&descriptor, &AnalysisKind::Qualifier(nonnull.clone()))?;

        for location in cfg.locations() {
            let instruction = cfg.instruction_at(location);
            if !matches!(instruction.op, Op::ReturnValue) {
                continue;
            }
            let index = cfg.location_index(location);
            let Frame::Valid { stack, .. } = numbering.frame_before(index) else {
                continue;
            };
            let Some(returned) = stack.last() else {
                continue;
            };
            if flow.strength_before(index, *returned) == Strength::Never {
                context.reporter.report(
                    DefectReport::new(NONNULL_RETURN_VIOLATION, PRIORITY_HIGH)
                        .with_class(&class.name)
                        .with_method(descriptor.clone())
                        .with_offset(instruction.offset),
                );
            }
        }
        Ok(())
    }
}

impl Detector for ReturnMismatchDetector {
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
