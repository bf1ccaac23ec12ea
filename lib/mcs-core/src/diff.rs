//! Set-difference helpers for garbage-collecting stale objects

use std::collections::BTreeSet;

/// Names in `existing` that are absent from `desired`, sorted and deduplicated
pub fn stale_names<I>(existing: I, desired: &BTreeSet<String>) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    existing
        .into_iter()
        .filter(|name| !desired.contains(name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn returns_only_names_missing_from_desired() {
        let existing = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        let stale = stale_names(existing, &set(&["b"]));
        assert_eq!(stale, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn empty_desired_marks_everything_stale() {
        let existing = vec!["a".to_string(), "a".to_string()];
        assert_eq!(stale_names(existing, &BTreeSet::new()), vec!["a".to_string()]);
    }

    #[test]
    fn nothing_is_stale_when_desired_covers_existing() {
        let existing = vec!["a".to_string()];
        assert!(stale_names(existing, &set(&["a", "b"])).is_empty());
    }
}
