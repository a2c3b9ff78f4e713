use std::collections::{BTreeSet, HashMap};
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ir::{ConstValue, MethodDescriptor};

/// How strongly a qualifier is known to hold for a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strength {
    Always,
    Maybe,
    Unknown,
    Never,
}

impl Strength {
    /// Lattice join used when facts merge at confluence points. Conflicting
    /// strengths (including Always with Never) merge to Unknown rather than
    /// being treated as a contradiction.
    pub fn join(self, other: Strength) -> Strength {
        if self == other { self } else { Strength::Unknown }
    }
}

/// Identity of a qualifier, e.g. nonnull.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifierId(String);

impl QualifierId {
    pub fn new(id: impl Into<String>) -> Self {
        QualifierId(id.into())
    }

    pub fn nonnull() -> Self {
        QualifierId::new("Nonnull")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QualifierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One qualifier kind from the closed, tagged set.
///
/// Each kind carries an explicit constant-validation function resolved by
/// identifier lookup; there is no runtime introspection. A constant outside
/// the validation domain yields `None`, and the propagation step then
/// registers no source at all for it.
#[derive(Clone)]
pub struct QualifierKind {
    pub id: QualifierId,
    validate: fn(&ConstValue) -> Option<Strength>,
}

impl QualifierKind {
    pub fn new(id: QualifierId, validate: fn(&ConstValue) -> Option<Strength>) -> Self {
        QualifierKind { id, validate }
    }

    pub fn nonnull() -> Self {
        QualifierKind::new(QualifierId::nonnull(), |constant| match constant {
            ConstValue::Null => Some(Strength::Never),
            ConstValue::Str(_) => Some(Strength::Always),
            // Non-reference constants are outside the nonnull domain.
            ConstValue::Int(_) => None,
        })
    }

    pub fn validate(&self, constant: &ConstValue) -> Option<Strength> {
        (self.validate)(constant)
    }
}

impl fmt::Debug for QualifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QualifierKind").field("id", &self.id).finish()
    }
}

/// Registry of the qualifier kinds known to this run.
#[derive(Clone, Debug, Default)]
pub struct QualifierSet {
    kinds: HashMap<QualifierId, QualifierKind>,
}

impl QualifierSet {
    pub fn with_defaults() -> Self {
        let mut set = QualifierSet::default();
        set.register(QualifierKind::nonnull());
        set
    }

    pub fn register(&mut self, kind: QualifierKind) {
        self.kinds.insert(kind.id.clone(), kind);
    }

    pub fn lookup(&self, id: &QualifierId) -> Option<&QualifierKind> {
        self.kinds.get(id)
    }
}

/// Target of one qualifier rule.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleTarget {
    Return {
        class_name: String,
        method: String,
        descriptor: String,
    },
    Parameter {
        class_name: String,
        method: String,
        descriptor: String,
        index: usize,
    },
    Field {
        class_name: String,
        field: String,
    },
}

/// A default or explicit annotation rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualifierRule {
    pub target: RuleTarget,
    pub qualifier: QualifierId,
    pub strength: Strength,
}

/// Lookup table of qualifier rules: explicit (plugin-supplied) rules shadow
/// the built-in defaults. Populated during the load phase and read-only for
/// the remainder of the run.
#[derive(Debug, Default)]
pub struct QualifierDatabase {
    explicit: HashMap<(RuleTarget, QualifierId), Strength>,
    defaults: HashMap<(RuleTarget, QualifierId), Strength>,
}

impl QualifierDatabase {
    pub fn with_defaults() -> Self {
        let mut db = QualifierDatabase::default();
        for rule in default_nullness_rules() {
            db.add_default(rule);
        }
        db
    }

    pub fn add_default(&mut self, rule: QualifierRule) {
        self.defaults
            .insert((rule.target, rule.qualifier), rule.strength);
    }

    pub fn add_explicit(&mut self, rule: QualifierRule) {
        self.explicit
            .insert((rule.target, rule.qualifier), rule.strength);
    }

    fn lookup(&self, target: RuleTarget, qualifier: &QualifierId) -> Option<Strength> {
        let key = (target, qualifier.clone());
        self.explicit
            .get(&key)
            .or_else(|| self.defaults.get(&key))
            .copied()
    }

    pub fn return_strength(
        &self,
        class_name: &str,
        method: &str,
        descriptor: &str,
        qualifier: &QualifierId,
    ) -> Option<Strength> {
        self.lookup(
            RuleTarget::Return {
                class_name: class_name.to_string(),
                method: method.to_string(),
                descriptor: descriptor.to_string(),
            },
            qualifier,
        )
    }

    /// Rule explicitly attached to a parameter position, if any.
    pub fn parameter_strength(
        &self,
        class_name: &str,
        method: &str,
        descriptor: &str,
        index: usize,
        qualifier: &QualifierId,
    ) -> Option<Strength> {
        self.lookup(
            RuleTarget::Parameter {
                class_name: class_name.to_string(),
                method: method.to_string(),
                descriptor: descriptor.to_string(),
                index,
            },
            qualifier,
        )
    }

    pub fn field_strength(
        &self,
        class_name: &str,
        field: &str,
        qualifier: &QualifierId,
    ) -> Option<Strength> {
        self.lookup(
            RuleTarget::Field {
                class_name: class_name.to_string(),
                field: field.to_string(),
            },
            qualifier,
        )
    }
}

/// Built-in nullness rules for well-known JDK members, loaded before any
/// plugin override.
pub fn default_nullness_rules() -> Vec<QualifierRule> {
    let nonnull = QualifierId::nonnull();
    let ret = |class_name: &str, method: &str, descriptor: &str, strength| QualifierRule {
        target: RuleTarget::Return {
            class_name: class_name.to_string(),
            method: method.to_string(),
            descriptor: descriptor.to_string(),
        },
        qualifier: nonnull.clone(),
        strength,
    };
    let param = |class_name: &str, method: &str, descriptor: &str, index, strength| QualifierRule {
        target: RuleTarget::Parameter {
            class_name: class_name.to_string(),
            method: method.to_string(),
            descriptor: descriptor.to_string(),
            index,
        },
        qualifier: nonnull.clone(),
        strength,
    };
    vec![
        ret(
            "java/lang/Object",
            "toString",
            "()Ljava/lang/String;",
            Strength::Always,
        ),
        ret(
            "java/lang/String",
            "valueOf",
            "(Ljava/lang/Object;)Ljava/lang/String;",
            Strength::Always,
        ),
        ret(
            "java/lang/StringBuilder",
            "toString",
            "()Ljava/lang/String;",
            Strength::Always,
        ),
        ret(
            "java/lang/System",
            "getProperty",
            "(Ljava/lang/String;)Ljava/lang/String;",
            Strength::Never,
        ),
        ret(
            "java/util/Map",
            "get",
            "(Ljava/lang/Object;)Ljava/lang/Object;",
            Strength::Never,
        ),
        param(
            "java/util/Objects",
            "requireNonNull",
            "(Ljava/lang/Object;)Ljava/lang/Object;",
            0,
            Strength::Always,
        ),
    ]
}

/// Interprocedural summaries accumulated by detector passes and consulted by
/// later analyses when no direct rule applies.
#[derive(Debug, Default)]
pub struct MethodSummaries {
    return_strengths: RwLock<HashMap<(MethodDescriptor, QualifierId), Strength>>,
    unconditional_params: RwLock<HashMap<MethodDescriptor, BTreeSet<usize>>>,
}

impl MethodSummaries {
    pub fn record_return_strength(
        &self,
        method: MethodDescriptor,
        qualifier: QualifierId,
        strength: Strength,
    ) {
        self.return_strengths
            .write()
            .insert((method, qualifier), strength);
    }

    pub fn return_strength(
        &self,
        method: &MethodDescriptor,
        qualifier: &QualifierId,
    ) -> Option<Strength> {
        self.return_strengths
            .read()
            .get(&(method.clone(), qualifier.clone()))
            .copied()
    }

    pub fn record_unconditional_params(&self, method: MethodDescriptor, params: BTreeSet<usize>) {
        if params.is_empty() {
            return;
        }
        self.unconditional_params.write().insert(method, params);
    }

    pub fn unconditional_params(&self, method: &MethodDescriptor) -> Option<BTreeSet<usize>> {
        self.unconditional_params.read().get(method).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_is_commutative_and_associative() {
        let values = [
            Strength::Always,
            Strength::Maybe,
            Strength::Unknown,
            Strength::Never,
        ];
        for a in values {
            for b in values {
                assert_eq!(a.join(b), b.join(a));
                for c in values {
                    assert_eq!(a.join(b).join(c), a.join(b.join(c)));
                }
            }
        }
        assert_eq!(Strength::Always.join(Strength::Never), Strength::Unknown);
        assert_eq!(Strength::Maybe.join(Strength::Maybe), Strength::Maybe);
    }

    #[test]
    fn explicit_rules_shadow_defaults() {
        let mut db = QualifierDatabase::with_defaults();
        let nonnull = QualifierId::nonnull();
        assert_eq!(
            db.return_strength(
                "java/lang/System",
                "getProperty",
                "(Ljava/lang/String;)Ljava/lang/String;",
                &nonnull
            ),
            Some(Strength::Never)
        );
        db.add_explicit(QualifierRule {
            target: RuleTarget::Return {
                class_name: "java/lang/System".to_string(),
                method: "getProperty".to_string(),
                descriptor: "(Ljava/lang/String;)Ljava/lang/String;".to_string(),
            },
            qualifier: nonnull.clone(),
            strength: Strength::Always,
        });
        assert_eq!(
            db.return_strength(
                "java/lang/System",
                "getProperty",
                "(Ljava/lang/String;)Ljava/lang/String;",
                &nonnull
            ),
            Some(Strength::Always)
        );
    }

    #[test]
    fn default_set_resolves_the_nonnull_kind() {
        let set = QualifierSet::with_defaults();
        let kind = set.lookup(&QualifierId::nonnull()).expect("registered kind");
        assert_eq!(kind.id, QualifierId::nonnull());
        assert!(set.lookup(&QualifierId::new("Tainted")).is_none());
    }

    #[test]
    fn nonnull_kind_rejects_numeric_constants() {
        let kind = QualifierKind::nonnull();
        assert_eq!(kind.validate(&ConstValue::Null), Some(Strength::Never));
        assert_eq!(
            kind.validate(&ConstValue::Str("x".to_string())),
            Some(Strength::Always)
        );
        assert_eq!(kind.validate(&ConstValue::Int(7)), None);
    }

    #[test]
    fn summaries_round_trip() {
        let summaries = MethodSummaries::default();
        let method = MethodDescriptor {
            class_name: "com/example/App".to_string(),
            name: "run".to_string(),
            descriptor: "(Ljava/lang/Object;)V".to_string(),
        };
        summaries.record_unconditional_params(method.clone(), BTreeSet::from([0]));
        assert_eq!(
            summaries.unconditional_params(&method),
            Some(BTreeSet::from([0]))
        );
        summaries.record_return_strength(method.clone(), QualifierId::nonnull(), Strength::Always);
        assert_eq!(
            summaries.return_strength(&method, &QualifierId::nonnull()),
            Some(Strength::Always)
        );
    }
}
