//! Algebraic classification of operation kinds.
//!
//! The table is a total function: a kind with no entry is `Generic`, so
//! missing knowledge never grants coordination-free treatment.

pub mod config;

use std::collections::{BTreeSet, HashMap, HashSet};

use rhizo_types::{AlgebraicClass, MergeRule, Operation, OperationKind, Payload, RhizoError};

pub use config::{ClassificationConfig, FamilyConfig, RuleConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub class: AlgebraicClass,
    /// Present iff `class` is algebraic.
    pub merge: Option<MergeRule>,
}

impl Rule {
    const GENERIC: Rule = Rule { class: AlgebraicClass::Generic, merge: None };
}

/// A range of keys whose writers are fixed at configuration time.
#[derive(Debug, Clone)]
pub struct KeyFamily {
    pub name: String,
    pub prefix: String,
    pub class: AlgebraicClass,
    pub merge: Option<MergeRule>,
    pub kinds: BTreeSet<OperationKind>,
}

/// Execution path chosen for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Fast,
    /// `escalated` is set when an algebraic operation touches a key outside
    /// every declared family and is ordered through consensus instead.
    Consensus { escalated: bool },
}

#[derive(Debug, Clone)]
pub struct Classifier {
    rules: HashMap<OperationKind, Rule>,
    /// Sorted by descending prefix length so the first match is the longest.
    families: Vec<KeyFamily>,
}

impl Classifier {
    /// The built-in table with no key families.
    pub fn builtin() -> Self {
        Classifier { rules: builtin_rules(), families: Vec::new() }
    }

    /// Build and validate a classifier from configuration.
    pub fn from_config(config: &ClassificationConfig) -> Result<Self, RhizoError> {
        let mut rules = builtin_rules();
        let mut configured = HashSet::new();
        for rule in &config.rules {
            if !configured.insert(rule.kind.clone()) {
                return Err(RhizoError::InvalidConfig(format!(
                    "duplicate classification rule for {}",
                    rule.kind
                )));
            }
            rules.insert(rule.kind.clone(), resolve_rule(rule)?);
        }

        let mut families: Vec<KeyFamily> = Vec::with_capacity(config.families.len());
        for family in &config.families {
            if families.iter().any(|f| f.name == family.name) {
                return Err(RhizoError::InvalidConfig(format!(
                    "duplicate key family '{}'",
                    family.name
                )));
            }
            if let Some(other) = families.iter().find(|f| f.prefix == family.prefix) {
                return Err(RhizoError::SchemaConflict {
                    family: family.name.clone(),
                    detail: format!("prefix '{}' is already claimed by '{}'", family.prefix, other.name),
                });
            }
            families.push(build_family(family, &rules)?);
        }
        families.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(Classifier { rules, families })
    }

    /// Map a kind to its algebraic class. Unknown kinds are `Generic`.
    pub fn classify(&self, kind: &OperationKind) -> AlgebraicClass {
        match self.rules.get(kind) {
            Some(rule) => rule.class,
            None => {
                tracing::warn!(kind = %kind, "unknown operation kind, classified as generic");
                AlgebraicClass::Generic
            }
        }
    }

    pub fn merge_rule(&self, kind: &OperationKind) -> Option<MergeRule> {
        self.rules.get(kind).and_then(|r| r.merge)
    }

    pub fn family(&self, key: &str) -> Option<&KeyFamily> {
        self.families.iter().find(|f| key.starts_with(f.prefix.as_str()))
    }

    pub fn families(&self) -> &[KeyFamily] {
        &self.families
    }

    /// Decide the execution path for `op`.
    ///
    /// Fast only when the kind is algebraic and every key sits in a family
    /// written by that same merge rule. Keys outside every family send
    /// algebraic kinds through consensus.
    pub fn route(&self, op: &Operation) -> Result<Route, RhizoError> {
        self.route_classified(op, self.classify(op.kind()))
    }

    /// [`route`](Self::route) for a caller that already holds `class`, the
    /// result of [`classify`](Self::classify) on `op.kind()`.
    pub fn route_classified(&self, op: &Operation, class: AlgebraicClass) -> Result<Route, RhizoError> {
        let kind = op.kind();
        let mut escalated = false;

        for key in op.keys() {
            match self.family(key) {
                Some(family) => {
                    let same_writer = family.class == class
                        && (!class.is_coordination_free() || family.kinds.contains(kind));
                    if !same_writer {
                        return Err(RhizoError::KeyFamilyMismatch {
                            key: key.clone(),
                            family: family.name.clone(),
                            family_class: family.class,
                            kind: kind.clone(),
                            kind_class: class,
                        });
                    }
                }
                None if class.is_coordination_free() => escalated = true,
                None => {}
            }
        }

        if !class.is_coordination_free() {
            Ok(Route::Consensus { escalated: false })
        } else if escalated {
            tracing::debug!(op_id = %op.id(), kind = %kind, "undeclared key, escalating to consensus");
            Ok(Route::Consensus { escalated: true })
        } else {
            Ok(Route::Fast)
        }
    }

    /// Check that `op` targets at least one key and carries the payload its
    /// kind expects.
    pub fn validate_payload(&self, op: &Operation) -> Result<(), RhizoError> {
        if op.keys().is_empty() {
            return Err(RhizoError::InvalidPayload(format!("operation {} targets no keys", op.id())));
        }
        let kind = op.kind();
        let ok = match (kind, op.payload()) {
            (OperationKind::Delete, Payload::Empty) => true,
            (OperationKind::Delete, _) => false,
            (OperationKind::CompareAndSwap, Payload::Swap { .. }) => true,
            (OperationKind::CompareAndSwap, _) => false,
            (_, payload) => match (self.merge_rule(kind), payload) {
                (Some(rule), Payload::Value(v)) => rule.accepts(v),
                (Some(_), _) => false,
                (None, Payload::Value(_)) => true,
                // Generic extension kinds take any payload shape.
                (None, _) => !kind.is_builtin(),
            },
        };
        if ok {
            Ok(())
        } else {
            Err(RhizoError::InvalidPayload(format!(
                "{kind} cannot take payload {:?}",
                op.payload()
            )))
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_rules() -> HashMap<OperationKind, Rule> {
    OperationKind::builtins()
        .into_iter()
        .map(|kind| {
            let rule = match kind.natural_merge() {
                Some(merge) => Rule { class: merge.class(), merge: Some(merge) },
                None => Rule::GENERIC,
            };
            (kind, rule)
        })
        .collect()
}

fn resolve_rule(cfg: &RuleConfig) -> Result<Rule, RhizoError> {
    let kind = &cfg.kind;
    if !cfg.class.is_coordination_free() {
        if cfg.merge.is_some() {
            return Err(RhizoError::InvalidConfig(format!(
                "generic kind {kind} cannot carry a merge rule"
            )));
        }
        return Ok(Rule::GENERIC);
    }

    if kind.is_builtin() && kind.natural_merge().is_none() {
        return Err(RhizoError::InvalidConfig(format!(
            "{kind} has no algebraic law and cannot be classified {}",
            cfg.class
        )));
    }
    let merge = match (cfg.merge, kind.natural_merge()) {
        (Some(given), Some(natural)) if given != natural => {
            return Err(RhizoError::InvalidConfig(format!(
                "{kind} merges with {natural}, not {given}"
            )));
        }
        (Some(given), _) => given,
        (None, Some(natural)) => natural,
        (None, None) => {
            return Err(RhizoError::InvalidConfig(format!(
                "algebraic kind {kind} needs a merge rule"
            )));
        }
    };
    if merge.class() != cfg.class {
        return Err(RhizoError::InvalidConfig(format!(
            "merge rule {merge} is {}, not {}",
            merge.class(),
            cfg.class
        )));
    }
    Ok(Rule { class: cfg.class, merge: Some(merge) })
}

fn build_family(
    cfg: &FamilyConfig,
    rules: &HashMap<OperationKind, Rule>,
) -> Result<KeyFamily, RhizoError> {
    let conflict = |detail: String| RhizoError::SchemaConflict { family: cfg.name.clone(), detail };

    let mut kinds = cfg.kinds.iter();
    let Some(first) = kinds.next() else {
        return Err(RhizoError::InvalidConfig(format!("key family '{}' lists no kinds", cfg.name)));
    };
    let head = rules.get(first).copied().unwrap_or(Rule::GENERIC);

    for kind in kinds {
        let rule = rules.get(kind).copied().unwrap_or(Rule::GENERIC);
        if rule.class != head.class {
            return Err(conflict(format!(
                "{first} is {} but {kind} is {}",
                head.class, rule.class
            )));
        }
        if rule.merge != head.merge {
            return Err(conflict(format!(
                "{first} and {kind} use different merge functions and do not commute"
            )));
        }
    }

    Ok(KeyFamily {
        name: cfg.name.clone(),
        prefix: cfg.prefix.clone(),
        class: head.class,
        merge: head.merge,
        kinds: cfg.kinds.iter().cloned().collect(),
    })
}
