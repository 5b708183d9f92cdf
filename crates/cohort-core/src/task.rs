//! Task set construction

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::{CohortError, CohortResult};

/// Unscheduled unit of work: one replicate brain under one condition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Task {
    pub condition: String,
    pub replicate_id: u32,
}

impl Task {
    pub fn new(condition: impl Into<String>, replicate_id: u32) -> Self {
        Self {
            condition: condition.into(),
            replicate_id,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.condition, self.replicate_id)
    }
}

/// Cross product of conditions and replicate ids `1..=replicates`
///
/// `selected` restricts the conditions and must be a subset of `known`.
pub fn build_task_set(
    replicates: u32,
    known: &[String],
    selected: Option<&[String]>,
) -> CohortResult<BTreeSet<Task>> {
    if replicates == 0 {
        return Err(CohortError::Validation(
            "replicates must be at least 1".to_string(),
        ));
    }
    if known.is_empty() {
        return Err(CohortError::Validation(
            "no known conditions to run".to_string(),
        ));
    }

    let known_set: BTreeSet<&str> = known.iter().map(String::as_str).collect();
    let conditions: BTreeSet<&str> = match selected {
        Some(selected) => {
            let unknown: Vec<&str> = selected
                .iter()
                .map(String::as_str)
                .filter(|c| !known_set.contains(c))
                .collect();
            if !unknown.is_empty() {
                return Err(CohortError::Validation(format!(
                    "Unknown conditions: {:?}. Available conditions are: {:?}",
                    unknown, known
                )));
            }
            selected.iter().map(String::as_str).collect()
        }
        None => known_set,
    };

    Ok(conditions
        .into_iter()
        .flat_map(|condition| (1..=replicates).map(move |id| Task::new(condition, id)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conditions(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_full_cross_product() {
        let known = conditions(&["a", "b", "c"]);
        let tasks = build_task_set(2, &known, None).unwrap();
        assert_eq!(tasks.len(), 6);
        assert!(tasks.contains(&Task::new("b", 2)));
        assert!(!tasks.contains(&Task::new("b", 0)));
        assert!(!tasks.contains(&Task::new("b", 3)));
    }

    #[test]
    fn test_selected_subset() {
        let known = conditions(&["a", "b", "c"]);
        let selected = conditions(&["c", "a", "a"]);
        let tasks = build_task_set(3, &known, Some(&selected)).unwrap();
        assert_eq!(tasks.len(), 6);
        assert!(tasks.iter().all(|t| t.condition != "b"));
    }

    #[test]
    fn test_unknown_condition_is_named() {
        let known = conditions(&["a", "b"]);
        let selected = conditions(&["a", "zebra"]);
        let err = build_task_set(1, &known, Some(&selected)).unwrap_err();
        assert!(matches!(err, CohortError::Validation(_)));
        assert!(err.to_string().contains("zebra"));
    }

    #[test]
    fn test_zero_replicates_rejected() {
        let known = conditions(&["a"]);
        assert!(build_task_set(0, &known, None).is_err());
    }

    #[test]
    fn test_iteration_is_sorted() {
        let known = conditions(&["b", "a"]);
        let tasks: Vec<Task> = build_task_set(2, &known, None).unwrap().into_iter().collect();
        assert_eq!(tasks[0], Task::new("a", 1));
        assert_eq!(tasks[3], Task::new("b", 2));
    }
}
