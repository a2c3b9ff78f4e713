use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detect::Detector;
use crate::errors::ConfigError;
use crate::qualifiers::QualifierRule;

/// Grouping of bug patterns, e.g. correctness or style.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BugCategory {
    pub id: String,
    pub description: String,
}

/// One reportable defect kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BugPattern {
    pub code: String,
    pub category: String,
    pub description: String,
}

/// Rough cost class of a detector, surfaced in timing output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorSpeed {
    Fast,
    Moderate,
    Slow,
}

/// Declared properties of a detector, carried as data on its factory rather
/// than queried from the instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DetectorTraits {
    /// Bug pattern codes the detector can emit.
    #[serde(default)]
    pub reports: Vec<String>,
    /// True when the detector keeps no state between classes, allowing its
    /// class visits to run in parallel.
    #[serde(default)]
    pub stateless: bool,
}

pub type DetectorCtor = Arc<dyn Fn() -> Arc<dyn Detector> + Send + Sync>;

/// Wrap a plain constructor function as a [`DetectorCtor`].
pub fn detector_ctor(make: fn() -> Arc<dyn Detector>) -> DetectorCtor {
    Arc::new(make)
}

/// Creates detector instances and carries their metadata.
#[derive(Clone)]
pub struct DetectorFactory {
    pub short_name: String,
    pub full_name: String,
    /// Execution pass the detector belongs to; lower passes run first.
    pub pass: usize,
    pub speed: DetectorSpeed,
    pub traits: DetectorTraits,
    pub enabled: bool,
    constructor: DetectorCtor,
}

impl DetectorFactory {
    pub fn new(
        short_name: impl Into<String>,
        full_name: impl Into<String>,
        pass: usize,
        speed: DetectorSpeed,
        traits: DetectorTraits,
        constructor: DetectorCtor,
    ) -> Self {
        DetectorFactory {
            short_name: short_name.into(),
            full_name: full_name.into(),
            pass,
            speed,
            traits,
            enabled: true,
            constructor,
        }
    }

    pub fn create(&self) -> Arc<dyn Detector> {
        (self.constructor)()
    }
}

impl std::fmt::Debug for DetectorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorFactory")
            .field("short_name", &self.short_name)
            .field("pass", &self.pass)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Scope of one detector ordering constraint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintScope {
    /// Orders detectors within one pass.
    IntraPass,
    /// Orders whole passes relative to each other.
    InterPass,
}

/// `earlier` must run before `later`, both named by detector full name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderingConstraint {
    pub earlier: String,
    pub later: String,
    pub scope: ConstraintScope,
}

/// One loadable unit of detectors, patterns, and annotation rules.
pub struct Plugin {
    pub id: String,
    pub version: String,
    pub detectors: Vec<DetectorFactory>,
    pub categories: Vec<BugCategory>,
    pub patterns: Vec<BugPattern>,
    pub constraints: Vec<OrderingConstraint>,
    pub rules: Vec<QualifierRule>,
}

/// Loaded plugins in load order, with the merged pattern and category
/// namespaces.
///
/// The core plugin loads first and stays loaded for the life of the
/// registry. Category and pattern registration is first-wins: a later plugin
/// redefining an id is silently ignored.
pub struct PluginRegistry {
    plugins: Vec<Plugin>,
    core_id: String,
    categories: HashMap<String, BugCategory>,
    patterns: HashMap<String, BugPattern>,
}

impl PluginRegistry {
    pub fn with_core(core: Plugin) -> Self {
        let mut registry = PluginRegistry {
            core_id: core.id.clone(),
            plugins: Vec::new(),
            categories: HashMap::new(),
            patterns: HashMap::new(),
        };
        registry.index(&core);
        registry.plugins.push(core);
        registry
    }

    pub fn load(&mut self, plugin: Plugin) -> Result<(), ConfigError> {
        if self.plugins.iter().any(|loaded| loaded.id == plugin.id) {
            return Err(ConfigError::DuplicatePlugin(plugin.id));
        }
        debug!(
            plugin = %plugin.id,
            version = %plugin.version,
            detectors = plugin.detectors.len(),
            "loading plugin"
        );
        self.index(&plugin);
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn unload(&mut self, id: &str) -> Result<(), ConfigError> {
        if id == self.core_id {
            return Err(ConfigError::CorePluginRequired);
        }
        self.plugins.retain(|plugin| plugin.id != id);
        // Rebuild the first-wins namespaces from the survivors.
        self.categories.clear();
        self.patterns.clear();
        let plugins = std::mem::take(&mut self.plugins);
        for plugin in &plugins {
            self.index(plugin);
        }
        self.plugins = plugins;
        Ok(())
    }

    fn index(&mut self, plugin: &Plugin) {
        for category in &plugin.categories {
            self.categories
                .entry(category.id.clone())
                .or_insert_with(|| category.clone());
        }
        for pattern in &plugin.patterns {
            self.patterns
                .entry(pattern.code.clone())
                .or_insert_with(|| pattern.clone());
        }
    }

    pub fn category(&self, id: &str) -> Option<&BugCategory> {
        self.categories.get(id)
    }

    pub fn pattern(&self, code: &str) -> Option<&BugPattern> {
        self.patterns.get(code)
    }

    /// Enabled detector factories, in plugin load order.
    pub fn enabled_detectors(&self) -> Vec<&DetectorFactory> {
        self.plugins
            .iter()
            .flat_map(|plugin| &plugin.detectors)
            .filter(|factory| factory.enabled)
            .collect()
    }

    pub fn constraints(&self) -> Vec<&OrderingConstraint> {
        self.plugins
            .iter()
            .flat_map(|plugin| &plugin.constraints)
            .collect()
    }

    /// Annotation rules supplied by all loaded plugins, in load order.
    pub fn rules(&self) -> Vec<&QualifierRule> {
        self.plugins.iter().flat_map(|plugin| &plugin.rules).collect()
    }

    pub fn set_detector_enabled(&mut self, full_name: &str, enabled: bool) -> bool {
        for plugin in &mut self.plugins {
            for factory in &mut plugin.detectors {
                if factory.full_name == full_name {
                    factory.enabled = enabled;
                    return true;
                }
            }
        }
        false
    }
}

/// Serialized form of a plugin, as shipped in a descriptor file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub detectors: Vec<DetectorDescriptor>,
    #[serde(default)]
    pub categories: Vec<BugCategory>,
    #[serde(default)]
    pub patterns: Vec<BugPattern>,
    #[serde(default)]
    pub constraints: Vec<OrderingConstraint>,
    #[serde(default)]
    pub rules: Vec<QualifierRule>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectorDescriptor {
    /// Full detector class name, resolved against the constructor table.
    pub class: String,
    pub short_name: String,
    #[serde(default)]
    pub pass: usize,
    pub speed: DetectorSpeed,
    #[serde(default)]
    pub traits: DetectorTraits,
    #[serde(default)]
    pub disabled: bool,
}

/// Table of known detector constructors keyed by full class name. Descriptors
/// may only reference detectors compiled into this table; there is no runtime
/// class loading.
pub type DetectorConstructors = HashMap<String, DetectorCtor>;

pub fn parse_descriptor(text: &str) -> Result<PluginDescriptor, ConfigError> {
    serde_json::from_str(text).map_err(|error| ConfigError::InvalidDescriptor(error.to_string()))
}

pub fn plugin_from_descriptor(
    descriptor: PluginDescriptor,
    constructors: &DetectorConstructors,
) -> Result<Plugin, ConfigError> {
    let mut detectors = Vec::with_capacity(descriptor.detectors.len());
    for entry in descriptor.detectors {
        let constructor = constructors
            .get(&entry.class)
            .ok_or_else(|| ConfigError::UnknownDetector(entry.class.clone()))?
            .clone();
        let mut factory = DetectorFactory::new(
            entry.short_name,
            entry.class,
            entry.pass,
            entry.speed,
            entry.traits,
            constructor,
        );
        factory.enabled = !entry.disabled;
        detectors.push(factory);
    }
    Ok(Plugin {
        id: descriptor.id,
        version: descriptor.version,
        detectors,
        categories: descriptor.categories,
        patterns: descriptor.patterns,
        constraints: descriptor.constraints,
        rules: descriptor.rules,
    })
}
