use std::fmt;

use crate::{AlgebraicClass, RhizoError, Value};

/// Combination function registered for an algebraic operation kind.
///
/// `Max`, `Min` and `Union` are semilattice joins. `Sum` is wrapping 64-bit
/// addition, which keeps the group law total (Z/2^64) and gives every delta
/// an inverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    Max,
    Min,
    Union,
    Sum,
}

impl MergeRule {
    pub fn class(self) -> AlgebraicClass {
        match self {
            MergeRule::Max | MergeRule::Min | MergeRule::Union => AlgebraicClass::Semilattice,
            MergeRule::Sum => AlgebraicClass::AbelianGroup,
        }
    }

    /// Whether merging the same delta twice equals merging it once.
    /// Replays of idempotent merges need no dedup record.
    pub fn is_idempotent(self) -> bool {
        self.class() == AlgebraicClass::Semilattice
    }

    /// Whether `value` has the shape this rule operates on.
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (MergeRule::Max | MergeRule::Min | MergeRule::Sum, Value::Int(_))
                | (MergeRule::Union, Value::Set(_))
        )
    }

    /// Merge `delta` into the current value. An absent value is the identity.
    pub fn merge(self, current: Option<&Value>, delta: &Value) -> Result<Value, RhizoError> {
        match current {
            None if self.accepts(delta) => Ok(delta.clone()),
            None => Err(self.mismatch(delta, delta)),
            Some(current) => self.combine(current, delta),
        }
    }

    /// Combine two values of the rule's shape.
    pub fn combine(self, a: &Value, b: &Value) -> Result<Value, RhizoError> {
        match (self, a, b) {
            (MergeRule::Max, Value::Int(x), Value::Int(y)) => Ok(Value::Int(*x.max(y))),
            (MergeRule::Min, Value::Int(x), Value::Int(y)) => Ok(Value::Int(*x.min(y))),
            (MergeRule::Sum, Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_add(*y))),
            (MergeRule::Union, Value::Set(x), Value::Set(y)) => {
                Ok(Value::Set(x.union(y).cloned().collect()))
            }
            _ => Err(self.mismatch(a, b)),
        }
    }

    /// Group inverse of a delta. Only `Sum` has one.
    pub fn inverse(self, delta: &Value) -> Option<Value> {
        match (self, delta) {
            (MergeRule::Sum, Value::Int(x)) => Some(Value::Int(x.wrapping_neg())),
            _ => None,
        }
    }

    fn mismatch(self, a: &Value, b: &Value) -> RhizoError {
        RhizoError::InvalidPayload(format!(
            "{self} cannot combine {} with {}",
            a.type_name(),
            b.type_name()
        ))
    }
}

impl fmt::Display for MergeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergeRule::Max => "max",
            MergeRule::Min => "min",
            MergeRule::Union => "union",
            MergeRule::Sum => "sum",
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn int_rule() -> impl Strategy<Value = MergeRule> {
        prop_oneof![Just(MergeRule::Max), Just(MergeRule::Min), Just(MergeRule::Sum)]
    }

    fn small_set() -> impl Strategy<Value = Value> {
        proptest::collection::btree_set("[a-e]", 0..4).prop_map(Value::Set)
    }

    fn int_value() -> impl Strategy<Value = Value> {
        any::<i64>().prop_map(Value::Int)
    }

    proptest! {
        #[test]
        fn int_merges_commute(rule in int_rule(), s in int_value(), a in int_value(), b in int_value()) {
            let ab = rule.merge(Some(&rule.merge(Some(&s), &a).unwrap()), &b).unwrap();
            let ba = rule.merge(Some(&rule.merge(Some(&s), &b).unwrap()), &a).unwrap();
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn int_merges_associate(rule in int_rule(), s in int_value(), a in int_value(), b in int_value()) {
            let left = rule.merge(Some(&rule.merge(Some(&s), &a).unwrap()), &b).unwrap();
            let right = rule.merge(Some(&s), &rule.combine(&a, &b).unwrap()).unwrap();
            prop_assert_eq!(left, right);
        }

        #[test]
        fn union_commutes_and_associates(s in small_set(), a in small_set(), b in small_set()) {
            let r = MergeRule::Union;
            let ab = r.merge(Some(&r.merge(Some(&s), &a).unwrap()), &b).unwrap();
            let ba = r.merge(Some(&r.merge(Some(&s), &b).unwrap()), &a).unwrap();
            let grouped = r.merge(Some(&s), &r.combine(&a, &b).unwrap()).unwrap();
            prop_assert_eq!(&ab, &ba);
            prop_assert_eq!(ab, grouped);
        }

        #[test]
        fn semilattice_merges_are_idempotent(s in int_value(), a in int_value(), set_s in small_set(), set_a in small_set()) {
            for rule in [MergeRule::Max, MergeRule::Min] {
                let once = rule.merge(Some(&s), &a).unwrap();
                let twice = rule.merge(Some(&once), &a).unwrap();
                prop_assert_eq!(once, twice);
            }
            let once = MergeRule::Union.merge(Some(&set_s), &set_a).unwrap();
            let twice = MergeRule::Union.merge(Some(&once), &set_a).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn sum_inverse_cancels(s in int_value(), a in int_value()) {
            let r = MergeRule::Sum;
            let applied = r.merge(Some(&s), &a).unwrap();
            let undone = r.merge(Some(&applied), &r.inverse(&a).unwrap()).unwrap();
            prop_assert_eq!(undone, s);
        }
    }

    #[test]
    fn sum_is_not_idempotent() {
        let once = MergeRule::Sum.merge(Some(&Value::Int(1)), &Value::Int(3)).unwrap();
        let twice = MergeRule::Sum.merge(Some(&once), &Value::Int(3)).unwrap();
        assert_ne!(once, twice);
        assert!(!MergeRule::Sum.is_idempotent());
        assert!(MergeRule::Max.is_idempotent());
        assert!(MergeRule::Min.is_idempotent());
        assert!(MergeRule::Union.is_idempotent());
    }

    #[test]
    fn absent_value_is_identity() {
        let v = MergeRule::Max.merge(None, &Value::Int(5)).unwrap();
        assert_eq!(v, Value::Int(5));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let err = MergeRule::Max.merge(None, &Value::Text("x".into())).unwrap_err();
        assert!(matches!(err, RhizoError::InvalidPayload(_)));

        let err = MergeRule::Union
            .merge(Some(&Value::Int(1)), &Value::set(["a"]))
            .unwrap_err();
        assert!(matches!(err, RhizoError::InvalidPayload(_)));
    }

    #[test]
    fn rule_classes() {
        assert_eq!(MergeRule::Max.class(), AlgebraicClass::Semilattice);
        assert_eq!(MergeRule::Union.class(), AlgebraicClass::Semilattice);
        assert_eq!(MergeRule::Sum.class(), AlgebraicClass::AbelianGroup);
        assert!(MergeRule::Max.inverse(&Value::Int(1)).is_none());
    }
}
