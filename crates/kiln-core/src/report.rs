//! Machine-readable deploy reports and CI detection.

use serde::Serialize;

use crate::apply::StageResult;
use crate::error::KilnError;
use crate::pipeline::DeployReport;
use crate::settings::OutputFormat;

/// Variables whose presence means we run inside CI.
pub const CI_VARIABLES: [&str; 7] = [
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "BUILDKITE",
    "CIRCLECI",
    "JENKINS_URL",
    "TF_BUILD",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
    pub class: String,
    pub message: String,
    pub hint: String,
}

impl From<&KilnError> for ErrorEntry {
    fn from(err: &KilnError) -> Self {
        Self {
            class: err.class().to_string(),
            message: err.to_string(),
            hint: err.hint(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceEntry {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl From<&StageResult> for ResourceEntry {
    fn from(result: &StageResult) -> Self {
        Self {
            kind: result.target.kind.to_string(),
            name: result.target.name.clone(),
            namespace: result.target.namespace.clone(),
            action: result.action.to_string(),
            error: result.error.as_ref().map(ToString::to_string),
            duration_ms: result.duration.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineReport {
    pub success: bool,
    pub app: String,
    pub namespace: String,
    pub context: String,
    pub resources: Vec<ResourceEntry>,
    pub pruned: Vec<ResourceEntry>,
    pub revision: Option<u64>,
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEntry>,
    pub duration_ms: u64,
}

impl From<&DeployReport> for MachineReport {
    fn from(report: &DeployReport) -> Self {
        Self {
            success: report.success(),
            app: report.app.clone(),
            namespace: report.namespace.clone(),
            context: report.context.clone(),
            resources: report.apply.results.iter().map(ResourceEntry::from).collect(),
            pruned: report.prune.results.iter().map(ResourceEntry::from).collect(),
            revision: report.revision,
            fingerprint: report.fingerprint.clone(),
            error: report.error.as_ref().map(ErrorEntry::from),
            duration_ms: report.duration.as_millis() as u64,
        }
    }
}

impl MachineReport {
    pub fn to_json(&self) -> String {
        to_json_document(self)
    }
}

/// Pretty JSON for stdout. A value that fails to serialize still yields a
/// parseable failure document.
pub fn to_json_document<T: Serialize + ?Sized>(value: &T) -> String {
    match serde_json::to_string_pretty(value) {
        Ok(json) => json,
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize output");
            let entry = ErrorEntry::from(&KilnError::internal(format!("serialize output: {}", err)));
            serde_json::json!({"success": false, "error": entry}).to_string()
        }
    }
}

/// True when any CI variable is set to something other than empty,
/// `0` or `false`.
pub fn is_ci<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    CI_VARIABLES.iter().any(|name| {
        lookup(name).is_some_and(|value| {
            let value = value.trim().to_ascii_lowercase();
            !value.is_empty() && value != "0" && value != "false"
        })
    })
}

/// Output format after the `--json` flag, settings and CI detection.
pub fn output_format<F>(json_flag: bool, configured: OutputFormat, lookup: F) -> OutputFormat
where
    F: Fn(&str) -> Option<String>,
{
    if json_flag || configured == OutputFormat::Json || is_ci(lookup) {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::{Action, ApplyReport};
    use crate::bundle::{Kind, ObjectRef};
    use std::time::Duration;

    #[test]
    fn unserializable_output_still_prints_a_document() {
        // Non-string map keys are rejected by serde_json.
        let value = std::collections::BTreeMap::from([(vec![1u8], 1u8)]);
        let document: serde_json::Value =
            serde_json::from_str(&to_json_document(&value)).unwrap();
        assert_eq!(document["success"], false);
        assert_eq!(document["error"]["class"], "Internal");
    }

    #[test]
    fn ci_detection_ignores_false_values() {
        assert!(is_ci(|k| (k == "GITHUB_ACTIONS").then(|| "true".to_string())));
        assert!(!is_ci(|k| (k == "CI").then(|| "false".to_string())));
        assert!(!is_ci(|_| None));
    }

    #[test]
    fn json_flag_wins() {
        assert_eq!(output_format(true, OutputFormat::Human, |_| None), OutputFormat::Json);
        assert_eq!(output_format(false, OutputFormat::Human, |_| None), OutputFormat::Human);
    }

    #[test]
    fn failed_report_carries_class_and_hint() {
        let target = ObjectRef::new(Kind::ConfigMap, "dev", "app-config");
        let error = KilnError::NamespaceMissing {
            namespace: "dev".to_string(),
        };
        let report = DeployReport {
            app: "app".to_string(),
            namespace: "dev".to_string(),
            context: "memory".to_string(),
            apply: ApplyReport {
                results: vec![StageResult {
                    target,
                    action: Action::Failed,
                    error: Some(error.clone()),
                    duration: Duration::from_millis(12),
                }],
                aborted_at: Some(1),
                cancelled: false,
                duration: Duration::from_millis(12),
            },
            error: Some(error),
            ..Default::default()
        };

        let json: serde_json::Value =
            serde_json::from_str(&MachineReport::from(&report).to_json()).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["resources"][0]["kind"], "ConfigMap");
        assert_eq!(json["resources"][0]["action"], "failed");
        assert_eq!(json["error"]["class"], "NamespaceMissing");
        assert!(json["error"]["hint"].as_str().unwrap().contains("create namespace dev"));
        assert!(json["revision"].is_null());
    }
}
