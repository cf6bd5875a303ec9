use rhizo_types::{AlgebraicClass, MergeRule, OperationKind};

/// Classification table as loaded from configuration.
///
/// Rules are layered on top of the built-in table; families declare which
/// kinds may write a key range.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub rules: Vec<RuleConfig>,
    pub families: Vec<FamilyConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RuleConfig {
    pub kind: OperationKind,
    pub class: AlgebraicClass,
    /// Required for algebraic extension kinds; built-in kinds use their own.
    #[serde(default)]
    pub merge: Option<MergeRule>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FamilyConfig {
    pub name: String,
    /// Keys starting with this prefix belong to the family. Longest match wins.
    pub prefix: String,
    pub kinds: Vec<OperationKind>,
}
