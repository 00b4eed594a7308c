//! Variables shared between jobs, steps and agents.

use indexmap::IndexMap;

/// Ordered string map. Later inserts of an existing key overwrite the value
/// but keep its original position.
pub type Vars = IndexMap<String, String>;

pub const FLOW_NAME: &str = "FLOWCI_FLOW_NAME";
pub const JOB_BUILD_NUMBER: &str = "FLOWCI_JOB_BUILD_NUM";
pub const JOB_TRIGGER: &str = "FLOWCI_JOB_TRIGGER";
pub const JOB_STATUS: &str = "FLOWCI_JOB_STATUS";
pub const JOB_AGENT: &str = "FLOWCI_AGENT";
pub const STEP_NAME: &str = "FLOWCI_STEP_NAME";

/// Keys only the scheduler writes.
pub const RESERVED: [&str; 6] = [
    FLOW_NAME,
    JOB_BUILD_NUMBER,
    JOB_TRIGGER,
    JOB_STATUS,
    JOB_AGENT,
    STEP_NAME,
];

/// Copy every entry of `other` into `target`.
pub fn merge(target: &mut Vars, other: &Vars) {
    for (k, v) in other {
        target.insert(k.clone(), v.clone());
    }
}

/// Like [`merge`], but leaves the [`RESERVED`] keys of `target` alone.
pub fn merge_unreserved(target: &mut Vars, other: &Vars) {
    for (k, v) in other {
        if !RESERVED.contains(&k.as_str()) {
            target.insert(k.clone(), v.clone());
        }
    }
}

/// Build a `Vars` from string pairs.
pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Vars
where
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_later_wins_keeps_position() {
        let mut target = from_pairs([("A", "1"), ("B", "2")]);
        merge(&mut target, &from_pairs([("A", "3"), ("C", "4")]));

        let keys: Vec<_> = target.keys().cloned().collect();
        assert_eq!(keys, vec!["A", "B", "C"]);
        assert_eq!(target["A"], "3");
    }

    #[test]
    fn test_merge_unreserved_keeps_scheduler_keys() {
        let mut target = from_pairs([(JOB_STATUS, "FAILURE"), ("A", "1")]);
        merge_unreserved(
            &mut target,
            &from_pairs([(JOB_STATUS, "SUCCESS"), (FLOW_NAME, "other"), ("A", "2")]),
        );

        assert_eq!(target[JOB_STATUS], "FAILURE");
        assert_eq!(target["A"], "2");
        assert!(!target.contains_key(FLOW_NAME));
    }
}
