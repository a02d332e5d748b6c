use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Successful,
    Failed,
    Aborted,
    Disabled,
}

impl TestStatus {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim() {
            "SUCCESSFUL" => Some(TestStatus::Successful),
            "FAILED" => Some(TestStatus::Failed),
            "ABORTED" => Some(TestStatus::Aborted),
            "DISABLED" => Some(TestStatus::Disabled),
            _ => None,
        }
    }
}

/// One test's result for one run, with whatever evidence the instrumented run
/// captured for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedTestResult {
    pub test_class_simple: String,
    pub test_display_name: String,
    /// `<class>#<display name>`
    pub test_id: String,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
}

impl EnrichedTestResult {
    pub fn new(class: &str, display_name: &str, status: TestStatus, cause: Option<String>) -> Self {
        Self {
            test_class_simple: class.to_string(),
            test_display_name: display_name.to_string(),
            test_id: format!("{class}#{display_name}"),
            status,
            cause,
            duration_ms: None,
            stack_trace: None,
            exception_type: None,
            message: None,
            expected: None,
            actual: None,
            unique_id: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == TestStatus::Successful
    }

    pub fn failed(&self) -> bool {
        self.status == TestStatus::Failed
    }

    pub fn has_evidence(&self) -> bool {
        self.duration_ms.is_some() || self.stack_trace.is_some() || self.exception_type.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatusKind {
    MaterializeFailed,
    CompileFailed,
    Executed,
    Exception,
}

/// How one run ended. Written to `run_<n>_status.json` unless it executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_number: u32,
    pub status: RunStatusKind,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub runs_processed: u32,
    pub runs_compiled: u32,
    pub runs_executed: u32,
    pub total_tests_found: u64,
    pub total_tests_passed: u64,
    pub total_tests_failed: u64,
    pub results_by_run: BTreeMap<u32, Vec<EnrichedTestResult>>,
    pub outcomes: Vec<RunOutcome>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn failed_runs(&self) -> Vec<u32> {
        self.outcomes
            .iter()
            .filter(|o| o.status != RunStatusKind::Executed)
            .map(|o| o.run_number)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_evidence_fields_are_omitted() {
        let r = EnrichedTestResult::new("FooTest", "adds", TestStatus::Successful, None);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "testClassSimple": "FooTest",
                "testDisplayName": "adds",
                "testId": "FooTest#adds",
                "status": "SUCCESSFUL",
            })
        );
        assert!(r.passed());
        assert!(!r.has_evidence());
    }

    #[test]
    fn run_status_uses_snake_case_tokens() {
        let o = RunOutcome {
            run_number: 3,
            status: RunStatusKind::MaterializeFailed,
            errors: vec!["No files materialized".to_string()],
            warnings: vec![],
        };
        let json = serde_json::to_string(&o).unwrap();
        assert!(json.contains("\"runNumber\":3"));
        assert!(json.contains("\"status\":\"materialize_failed\""));
    }
}
