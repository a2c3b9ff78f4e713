use crate::cache::AnalysisCache;
use crate::errors::AnalysisError;
use crate::ir::{Class, Program};
use crate::qualifiers::{MethodSummaries, QualifierDatabase};
use crate::report::Reporter;
use crate::session::EngineOptions;

pub mod null_deref;
pub mod return_mismatch;
pub mod return_summary;
pub mod unconditional_deref;

/// Everything a detector may consult while visiting one class.
pub struct ClassContext<'a> {
    pub cache: &'a AnalysisCache,
    pub class: &'a Class,
    pub database: &'a QualifierDatabase,
    pub summaries: &'a MethodSummaries,
    pub options: &'a EngineOptions,
    pub reporter: &'a dyn Reporter,
}

/// Context for the end-of-pass barrier, after every class has been visited.
pub struct FinishContext<'a> {
    pub cache: &'a AnalysisCache,
    pub program: &'a Program,
    pub database: &'a QualifierDatabase,
    pub summaries: &'a MethodSummaries,
    pub options: &'a EngineOptions,
    pub reporter: &'a dyn Reporter,
}

/// One defect detector.
///
/// Instances are created fresh for each pass and shared across worker
/// threads, so per-run state belongs in interior mutability or in the shared
/// databases, not in `&mut self`.
pub trait Detector: Send + Sync {
    fn visit_class(&self, context: &ClassContext<'_>) -> Result<(), AnalysisError>;

    /// Called once after the pass has visited every class.
    fn finish(&self, _context: &FinishContext<'_>) -> Result<(), AnalysisError> {
        Ok(())
    }
}

/// Whether detectors should look at this class at all. Classpath classes are
/// modeled but skipped unless the run widens its scope to referenced classes.
pub fn is_analysis_target(class: &Class, options: &EngineOptions) -> bool {
    class.is_application || options.analyze_referenced_classes
}
