//! Error taxonomy shared by every pipeline stage.
//!
//! Each variant maps to one user-visible class, a one-line hint and a
//! process exit code. Payloads are plain strings so reports can keep a copy.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = KilnError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KilnError {
    #[error("invalid model: {field}: {reason}")]
    InvalidModel { field: String, reason: String },

    #[error("file not found: {}", path.display())]
    MissingFile { path: PathBuf },

    #[error("namespace '{namespace}' does not exist")]
    NamespaceMissing { namespace: String },

    #[error("forbidden: cannot write {target}: {message}")]
    Forbidden { target: String, message: String },

    #[error("{target} exists but is not managed by kiln")]
    AdoptionRefused { target: String },

    #[error("{target} was rejected by the server: {reason}")]
    InvalidObject { target: String, reason: String },

    #[error("rollout of {workload} did not complete within {}s", waited.as_secs())]
    RolloutTimeout { workload: String, waited: Duration },

    #[error("pod {pod} failed: {reason}: {message}")]
    PodFailure {
        pod: String,
        reason: String,
        message: String,
    },

    #[error("release record for '{app}' kept changing after {attempts} attempts")]
    RevisionConflict { app: String, attempts: usize },

    #[error("revision {index} of '{app}' does not exist")]
    UnknownRevision { app: String, index: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl KilnError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidModel {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable class name, emitted verbatim in machine output.
    pub fn class(&self) -> &'static str {
        match self {
            Self::InvalidModel { .. } => "InvalidModel",
            Self::MissingFile { .. } => "MissingFile",
            Self::NamespaceMissing { .. } => "NamespaceMissing",
            Self::Forbidden { .. } => "Forbidden",
            Self::AdoptionRefused { .. } => "AdoptionRefused",
            Self::InvalidObject { .. } => "InvalidObject",
            Self::RolloutTimeout { .. } => "RolloutTimeout",
            Self::PodFailure { .. } => "PodFailure",
            Self::RevisionConflict { .. } => "RevisionConflict",
            Self::UnknownRevision { .. } => "UnknownRevision",
            Self::Cancelled => "Cancelled",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Suggested next action for the user.
    pub fn hint(&self) -> String {
        match self {
            Self::InvalidModel { field, .. } => format!("fix '{field}' in the app definition"),
            Self::MissingFile { path } => {
                format!("create {} or remove the reference to it", path.display())
            }
            Self::NamespaceMissing { namespace } => {
                format!("create namespace {namespace} (kubectl create namespace {namespace})")
            }
            Self::Forbidden { .. } => {
                "check the RBAC permissions of the current kube context".to_string()
            }
            Self::AdoptionRefused { target } => {
                format!("delete or rename the existing {target}, or choose another app name")
            }
            Self::InvalidObject { .. } => "correct the rejected field and deploy again".to_string(),
            Self::RolloutTimeout { .. } => {
                "inspect pod events, or raise the timeout with --timeout".to_string()
            }
            Self::PodFailure { pod, reason, .. } => match reason.as_str() {
                "ImagePullBackOff" | "ErrImagePull" | "InvalidImageName" => {
                    format!("verify the image reference and registry credentials used by {pod}")
                }
                "CreateContainerConfigError" => {
                    format!("check the ConfigMaps and Secrets referenced by {pod}")
                }
                _ => format!("inspect logs (kubectl logs {pod})"),
            },
            Self::RevisionConflict { .. } => {
                "another deploy is writing the same release record; retry".to_string()
            }
            Self::UnknownRevision { app, .. } => {
                format!("run 'kiln history' to list the recorded revisions of {app}")
            }
            Self::Cancelled => "re-run the command to continue".to_string(),
            Self::Internal { .. } => "re-run with RUST_LOG=kiln=debug and report the output".to_string(),
        }
    }

    /// Process exit code: 1 validation, 2 apply, 3 rollout, 4 internal/cluster.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidModel { .. } | Self::MissingFile { .. } | Self::UnknownRevision { .. } => 1,
            Self::NamespaceMissing { .. }
            | Self::Forbidden { .. }
            | Self::AdoptionRefused { .. }
            | Self::InvalidObject { .. } => 2,
            Self::RolloutTimeout { .. } | Self::PodFailure { .. } => 3,
            Self::RevisionConflict { .. } | Self::Cancelled | Self::Internal { .. } => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_failure_phase() {
        assert_eq!(KilnError::invalid("name", "bad").exit_code(), 1);
        assert_eq!(
            KilnError::MissingFile {
                path: PathBuf::from("x.env")
            }
            .exit_code(),
            1
        );
        assert_eq!(
            KilnError::NamespaceMissing {
                namespace: "dev".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            KilnError::PodFailure {
                pod: "app-1".into(),
                reason: "CrashLoopBackOff".into(),
                message: String::new()
            }
            .exit_code(),
            3
        );
        assert_eq!(KilnError::internal("boom").exit_code(), 4);
    }

    #[test]
    fn crash_loop_hint_points_at_logs() {
        let err = KilnError::PodFailure {
            pod: "app-7d9f".into(),
            reason: "CrashLoopBackOff".into(),
            message: "back-off restarting".into(),
        };
        assert!(err.hint().contains("kubectl logs app-7d9f"));
        assert_eq!(err.class(), "PodFailure");
    }

    #[test]
    fn namespace_hint_names_namespace() {
        let err = KilnError::NamespaceMissing {
            namespace: "staging".into(),
        };
        assert!(err.hint().contains("create namespace staging"));
    }
}
