//! Property-based test generators.

use proptest::prelude::*;
use savanna_model::Value;

/// Strategy producing scalar attribute values of every kind.
pub fn scalar_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Long),
        (-1.0e12..1.0e12f64).prop_map(Value::Number),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::Text),
    ]
}

/// Strategy producing plausible attribute names.
pub fn attribute_name() -> impl Strategy<Value = String> {
    "[a-z][a-zA-Z0-9]{0,11}".prop_map(|s| s)
}

/// Strategy producing wildcard patterns mixing literals and `*`.
pub fn wildcard_pattern() -> impl Strategy<Value = String> {
    "[a-zA-Z*]{1,10}".prop_map(|s| s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use savanna_model::{fold_text, wildcard_to_regex};

    proptest! {
        #[test]
        fn folding_is_idempotent(text in "\\PC{0,24}") {
            let once = fold_text(&text);
            prop_assert_eq!(fold_text(&once), once.clone());
        }

        #[test]
        fn sort_cmp_is_antisymmetric(a in scalar_value(), b in scalar_value()) {
            let forward = a.sort_cmp(&b);
            let backward = b.sort_cmp(&a);
            prop_assert_eq!(forward, backward.reverse());
        }

        #[test]
        fn sort_cmp_is_reflexive(a in scalar_value()) {
            // NaN never leaves sort_cmp unordered; the wrapper is total
            prop_assert_eq!(a.sort_cmp(&a), std::cmp::Ordering::Equal);
        }

        #[test]
        fn wildcard_free_patterns_match_themselves(text in "[a-zA-Z]{1,10}") {
            let re = regex::Regex::new(&wildcard_to_regex(&text)).unwrap();
            prop_assert!(re.is_match(&fold_text(&text)));
        }

        #[test]
        fn wildcard_regex_always_compiles(pattern in wildcard_pattern()) {
            prop_assert!(regex::Regex::new(&wildcard_to_regex(&pattern)).is_ok());
        }
    }
}
