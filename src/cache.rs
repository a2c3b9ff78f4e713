use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::cfg::ControlFlowGraph;
use crate::errors::{AnalysisError, ConfigError};
use crate::ir::{MethodDescriptor, Program};
use crate::qualifiers::QualifierId;

/// Identifies one kind of per-method analysis result.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AnalysisKind {
    ControlFlow,
    ValueNumbering,
    DefiniteNull,
    UnconditionalDeref,
    Qualifier(QualifierId),
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisKind::ControlFlow => f.write_str("control flow"),
            AnalysisKind::ValueNumbering => f.write_str("value numbering"),
            AnalysisKind::DefiniteNull => f.write_str("definite null set"),
            AnalysisKind::UnconditionalDeref => f.write_str("unconditional dereference set"),
            AnalysisKind::Qualifier(id) => write!(f, "{id} qualifier flow"),
        }
    }
}

/// Frozen output of one analysis for one method, shared between consumers.
pub type SharedResult = Arc<dyn Any + Send + Sync>;

/// Producer of one analysis kind, declaring the kinds it needs first.
///
/// Factories pull their dependencies back through the cache, so each
/// dependency is itself computed at most once per generation.
pub trait AnalysisFactory: Send + Sync {
    fn kind(&self) -> AnalysisKind;
    fn dependencies(&self) -> Vec<AnalysisKind>;
    fn analyze(
        &self,
        cache: &AnalysisCache,
        method: &MethodDescriptor,
    ) -> Result<SharedResult, AnalysisError>;
}

/// Base factory every dataflow analysis depends on.
pub struct ControlFlowFactory;

impl AnalysisFactory for ControlFlowFactory {
    fn kind(&self) -> AnalysisKind {
        AnalysisKind::ControlFlow
    }

    fn dependencies(&self) -> Vec<AnalysisKind> {
        Vec::new()
    }

    fn analyze(
        &self,
        cache: &AnalysisCache,
        method: &MethodDescriptor,
    ) -> Result<SharedResult, AnalysisError> {
        let (_, body) = cache
            .program()
            .find_method(method)
            .ok_or_else(|| AnalysisError::MethodUnresolved(method.clone()))?;
        Ok(Arc::new(crate::cfg::build_cfg(body)?))
    }
}

type Key = (MethodDescriptor, AnalysisKind);
type Slot = Arc<OnceLock<Result<SharedResult, AnalysisError>>>;

/// Generation-scoped memoization of analysis results.
///
/// Computed results are shared by reference; concurrent first computation of
/// one key is serialized through the slot's `OnceLock` so the factory runs at
/// most once. Resetting the generation drops every stored result.
pub struct AnalysisCache {
    program: Arc<Program>,
    factories: HashMap<AnalysisKind, Arc<dyn AnalysisFactory>>,
    entries: Mutex<HashMap<Key, Slot>>,
    generation: AtomicU64,
}

impl AnalysisCache {
    pub fn new(program: Arc<Program>) -> Self {
        AnalysisCache {
            program,
            factories: HashMap::new(),
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn register(&mut self, factory: Arc<dyn AnalysisFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    /// Validate that every declared factory dependency resolves to a
    /// registered factory and that the dependency graph is acyclic. Called
    /// once after registration; failures are configuration errors.
    pub fn verify_factories(&self) -> Result<(), ConfigError> {
        for factory in self.factories.values() {
            for dependency in factory.dependencies() {
                if !self.factories.contains_key(&dependency) {
                    return Err(ConfigError::UnknownDependency {
                        kind: factory.kind().to_string(),
                        dependency: dependency.to_string(),
                    });
                }
            }
        }
        for kind in self.factories.keys() {
            let mut seen = HashSet::new();
            if self.has_cycle(kind, &mut seen) {
                return Err(ConfigError::FactoryCycle(kind.to_string()));
            }
        }
        Ok(())
    }

    fn has_cycle(&self, kind: &AnalysisKind, path: &mut HashSet<AnalysisKind>) -> bool {
        if !path.insert(kind.clone()) {
            return true;
        }
        let cyclic = self
            .factories
            .get(kind)
            .map(|factory| {
                factory
                    .dependencies()
                    .iter()
                    .any(|dependency| self.has_cycle(dependency, path))
            })
            .unwrap_or(false);
        path.remove(kind);
        cyclic
    }

    /// Fetch or compute the result of `kind` for `method`.
    pub fn get(
        &self,
        method: &MethodDescriptor,
        kind: &AnalysisKind,
    ) -> Result<SharedResult, AnalysisError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| AnalysisError::NoFactory(kind.to_string()))?
            .clone();
        if self.program.find_method(method).is_none() {
            return Err(AnalysisError::MethodUnresolved(method.clone()));
        }

        let slot = {
            let mut entries = self.entries.lock();
            entries
                .entry((method.clone(), kind.clone()))
                .or_insert_with(|| Arc::new(OnceLock::new()))
                .clone()
        };
        slot.get_or_init(|| {
            debug!(method = %method, kind = %kind, "computing analysis");
            for dependency in factory.dependencies() {
                if let Err(cause) = self.get(method, &dependency) {
                    return Err(AnalysisError::DependencyFailed {
                        kind: dependency.to_string(),
                        method: method.clone(),
                        cause: Box::new(cause),
                    });
                }
            }
            factory.analyze(self, method)
        })
        .clone()
    }

    /// Typed convenience wrapper over [`AnalysisCache::get`].
    pub fn get_as<T: Any + Send + Sync>(
        &self,
        method: &MethodDescriptor,
        kind: &AnalysisKind,
    ) -> Result<Arc<T>, AnalysisError> {
        self.get(method, kind)?.downcast::<T>().map_err(|_| {
            AnalysisError::InvalidModel(format!("analysis {kind} produced an unexpected type"))
        })
    }

    pub fn cfg(&self, method: &MethodDescriptor) -> Result<Arc<ControlFlowGraph>, AnalysisError> {
        self.get_as(method, &AnalysisKind::ControlFlow)
    }

    /// Drop all stored results, starting a fresh generation. Used when the
    /// program model changes between runs.
    pub fn reset_generation(&self) {
        self.entries.lock().clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
