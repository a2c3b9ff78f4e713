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

/// Records the observed nonnull strength of each method's return values in
/// the summary database. Qualifier analyses of callers run in later passes
/// fall back to these summaries when no declared rule covers the callee.
pub struct ReturnSummaryDetector;

impl ReturnSummaryDetector {
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
        let descriptor = method.descriptor_for(class);
        let cfg = context.cache.cfg(&descriptor)?;
        let numbering: Arc<ValueNumbering> = context
            .cache
            .get_as(&descriptor, &AnalysisKind::ValueNumbering)?;
        let flow: Arc<QualifierDataflow> = context
            .cache
            .get_as(&descriptor, &AnalysisKind::Qualifier(nonnull.clone()))?;

        let mut observed: Option<Strength> = None;
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
            let strength = flow.strength_before(index, *returned);
            observed = Some(match observed {
                Some(joined) => joined.join(strength),
                None => strength,
            });
        }
        // Only a definite verdict is worth a summary; Unknown adds nothing
        // over the fallback default.
        if let Some(strength @ (Strength::Always | Strength::Never)) = observed {
            context
                .summaries
                .record_return_strength(descriptor, nonnull, strength);
        }
        Ok(())
    }
}

impl Detector for ReturnSummaryDetector {
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
