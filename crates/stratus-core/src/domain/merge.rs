//! Per-field merge policies applied when patching task state forward.
//!
//! Fields fall into three policies:
//! - **single-assignment**: keeps its first non-null value (`merge_once`);
//! - **auto-merge-if-not-null**: takes the patch value whenever present
//!   (`merge_if_some`);
//! - **custom properties**: merged key-wise, never replaced wholesale.

use std::collections::BTreeMap;

/// Workflow payloads declare how a patch body folds into current state.
pub trait Mergeable: Sized {
    /// Fold `patch` into `self` according to each field's merge policy.
    fn merge_patch(&mut self, patch: Self);

    /// Fold `patch` into `self` with every present field overriding the
    /// current value, regardless of policy. Used for subscription-hook
    /// amendments, where the hook's reply wins by contract.
    fn apply_override(&mut self, patch: Self);
}

/// Single assignment: first non-null value sticks.
pub fn merge_once<T>(current: &mut Option<T>, patch: Option<T>) {
    if current.is_none() {
        *current = patch;
    }
}

/// Auto-merge: patch value wins whenever present.
pub fn merge_if_some<T>(current: &mut Option<T>, patch: Option<T>) {
    if patch.is_some() {
        *current = patch;
    }
}

/// Key-wise merge: patch entries override on key collision, everything
/// else survives.
pub fn merge_custom_properties(
    current: &mut BTreeMap<String, String>,
    patch: BTreeMap<String, String>,
) {
    for (k, v) in patch {
        current.insert(k, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, Some(1), Some(1))]
    #[case(Some(1), Some(2), Some(1))]
    #[case(Some(1), None, Some(1))]
    #[case(None, None, None)]
    fn merge_once_keeps_first_value(
        #[case] mut current: Option<i64>,
        #[case] patch: Option<i64>,
        #[case] expected: Option<i64>,
    ) {
        merge_once(&mut current, patch);
        assert_eq!(current, expected);
    }

    #[rstest]
    #[case(None, Some(1), Some(1))]
    #[case(Some(1), Some(2), Some(2))]
    #[case(Some(1), None, Some(1))]
    fn merge_if_some_takes_patch_when_present(
        #[case] mut current: Option<i64>,
        #[case] patch: Option<i64>,
        #[case] expected: Option<i64>,
    ) {
        merge_if_some(&mut current, patch);
        assert_eq!(current, expected);
    }

    #[test]
    fn custom_properties_merge_key_wise() {
        let mut current = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        let patch = BTreeMap::from([
            ("b".to_string(), "changed".to_string()),
            ("c".to_string(), "3".to_string()),
        ]);
        merge_custom_properties(&mut current, patch);
        assert_eq!(current.get("a").unwrap(), "1");
        assert_eq!(current.get("b").unwrap(), "changed");
        assert_eq!(current.get("c").unwrap(), "3");
    }
}
