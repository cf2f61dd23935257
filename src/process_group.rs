//! Process-group bucketing of task types.
//!
//! Running-Work aggregation compares tasks by coarse process group rather
//! than raw task type, so that e.g. event generation and simulation compete
//! for the same share while reconstruction is accounted separately.

/// Process-group table: bucket name and the task types it covers.
const GROUPS: &[(&str, &[&str])] = &[
    ("evgensimul", &["evgen", "simul"]),
    ("reprocessing", &["reprocessing"]),
    ("reco", &["digit", "recon", "pile", "merge"]),
    ("test", &["prod_test", "validation"]),
];

/// Fallback bucket for task types outside the table.
const GROUP_OTHERS: &str = "others";

/// Returns the process group for a task type.
///
/// Unknown task types fall into the `"others"` bucket so that every task
/// belongs to exactly one group.
#[must_use]
pub fn process_group(task_type: &str) -> &'static str {
    for (group, types) in GROUPS {
        if types.contains(&task_type) {
            return group;
        }
    }
    GROUP_OTHERS
}

/// Returns `true` when two task types share a process group.
#[must_use]
pub fn same_group(a: &str, b: &str) -> bool {
    process_group(a) == process_group(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("evgen", "evgensimul")]
    #[test_case("simul", "evgensimul")]
    #[test_case("recon", "reco")]
    #[test_case("pile", "reco")]
    #[test_case("reprocessing", "reprocessing")]
    #[test_case("prod_test", "test")]
    #[test_case("t0_processing", "others")]
    fn test_process_group(task_type: &str, expected: &str) {
        assert_eq!(process_group(task_type), expected);
    }

    #[test]
    fn test_same_group() {
        assert!(same_group("evgen", "simul"));
        assert!(!same_group("evgen", "recon"));
        assert!(same_group("unknown-a", "unknown-b"));
    }
}
