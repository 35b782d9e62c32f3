use serde::{Deserialize, Serialize};

/// Outcome of one capability criterion for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub criteria: String,
    pub validated: bool,
}

impl ValidationResult {
    pub fn new(criteria: impl Into<String>, validated: bool) -> Self {
        Self {
            criteria: criteria.into(),
            validated,
        }
    }

    /// A task is runnable if at least one result validates.
    pub fn any_validated(results: &[ValidationResult]) -> bool {
        results.iter().any(|r| r.validated)
    }
}
