use thiserror::Error;

use crate::ir::MethodDescriptor;

/// Failures scoped to one analysis unit. Callers recover locally: the
/// affected method or class is skipped and the run continues.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum AnalysisError {
    #[error("method {0} cannot be resolved in the program model")]
    MethodUnresolved(MethodDescriptor),
    #[error("no analysis factory registered for {0}")]
    NoFactory(String),
    #[error("dependency analysis {kind} failed for {method}: {cause}")]
    DependencyFailed {
        kind: String,
        method: MethodDescriptor,
        #[source]
        cause: Box<AnalysisError>,
    },
    #[error("dataflow did not converge within {0} passes")]
    IterationLimit(usize),
    #[error("invalid program model: {0}")]
    InvalidModel(String),
    #[error("analysis cancelled")]
    Cancelled,
}

impl AnalysisError {
    /// True when the root cause is a method missing from the program model.
    pub fn is_missing_resolution(&self) -> bool {
        match self {
            AnalysisError::MethodUnresolved(_) => true,
            AnalysisError::DependencyFailed { cause, .. } => cause.is_missing_resolution(),
            _ => false,
        }
    }
}

/// Failures in engine configuration. These are fatal at load time and
/// surface before any class is visited.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("plugin {0} is already loaded")]
    DuplicatePlugin(String),
    #[error("the core plugin must be loaded first and cannot be removed")]
    CorePluginRequired,
    #[error("detector ordering constraints contain a cycle involving {0}")]
    OrderingCycle(String),
    #[error("analysis factory {kind} depends on unregistered analysis {dependency}")]
    UnknownDependency { kind: String, dependency: String },
    #[error("analysis factory dependencies contain a cycle involving {0}")]
    FactoryCycle(String),
    #[error("plugin descriptor names unknown detector class {0}")]
    UnknownDetector(String),
    #[error("qualifier kind {0} is not registered")]
    UnknownQualifier(String),
    #[error("invalid plugin descriptor: {0}")]
    InvalidDescriptor(String),
}
