//! Canonical label keys.
//!
//! The canonical key is the aggregation identity of a label set: label names
//! sorted ascending, rendered as `name="value"` joined by commas and wrapped
//! in braces. Empty-valued labels and `__name__` are omitted, so two label
//! sets with the same non-empty entries always map to the same key.

use crate::sample::{Labels, METRIC_NAME_LABEL};

/// Key of a label set with no (non-empty) labels.
pub const EMPTY_KEY: &str = "{}";

/// Build the canonical key of a label set.
///
/// Values are written as they appeared on the wire, escape sequences
/// included, so the key doubles as the rendered label block.
pub fn canonical_key(labels: &Labels) -> String {
    let capacity = labels
        .iter()
        .map(|(k, v)| k.len() + v.len() + 4)
        .sum::<usize>()
        + 2;
    let mut key = String::with_capacity(capacity);

    key.push('{');
    let mut first = true;
    for (name, value) in labels {
        if value.is_empty() || name == METRIC_NAME_LABEL {
            continue;
        }
        if !first {
            key.push(',');
        }
        key.push_str(name);
        key.push_str("=\"");
        key.push_str(value);
        key.push('"');
        first = false;
    }
    key.push('}');

    key
}

/// Whether a canonical key denotes an empty label set.
pub fn is_empty_key(key: &str) -> bool {
    key.len() <= EMPTY_KEY.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_labels() {
        assert_eq!(canonical_key(&Labels::new()), "{}");
        assert!(is_empty_key(&canonical_key(&Labels::new())));
    }

    #[test]
    fn test_sorted_by_name() {
        let key = canonical_key(&labels(&[("method", "GET"), ("code", "200")]));
        assert_eq!(key, r#"{code="200",method="GET"}"#);
        assert!(!is_empty_key(&key));
    }

    #[test]
    fn test_permutation_invariant() {
        let pairs = [("b", "2"), ("a", "1"), ("c", "3"), ("d", "")];
        let expected = canonical_key(&labels(&pairs));

        let mut reversed = pairs;
        reversed.reverse();
        assert_eq!(canonical_key(&labels(&reversed)), expected);

        let rotated = [pairs[2], pairs[3], pairs[0], pairs[1]];
        assert_eq!(canonical_key(&labels(&rotated)), expected);
    }

    #[test]
    fn test_omits_empty_values_and_name() {
        let key = canonical_key(&labels(&[
            ("__name__", "metric"),
            ("empty", ""),
            ("job", "api"),
        ]));
        assert_eq!(key, r#"{job="api"}"#);
    }

    #[test]
    fn test_only_empty_values() {
        let key = canonical_key(&labels(&[("a", ""), ("b", "")]));
        assert_eq!(key, "{}");
        assert!(is_empty_key(&key));
    }

    #[test]
    fn test_escaped_values_kept_verbatim() {
        let key = canonical_key(&labels(&[("path", r#"a\"b"#), ("nl", r"x\ny")]));
        assert_eq!(key, r#"{nl="x\ny",path="a\"b"}"#);
    }
}
