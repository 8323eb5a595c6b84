//! Staged server-side apply.
//!
//! Objects are applied kind by kind in [`Kind`] order. Within a kind, up to
//! `concurrency` objects are in flight at once. A failure in a critical
//! stage (storage, configuration, services) stops everything immediately;
//! a failure in a later stage lets the remaining siblings finish and then
//! stops before the next stage. Nothing already applied is rolled back.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::bundle::{Bundle, Kind, Manifest, ObjectRef};
use crate::cancel::CancelToken;
use crate::cluster::{ApplyParams, ClusterError, ClusterHandle};
use crate::error::{KilnError, Result};
use crate::labels::{DEFAULT_FIELD_MANAGER, FINGERPRINT_ANNOTATION, OBJECT_HASH_ANNOTATION, is_managed};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Options for one apply run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    pub dry_run: bool,
    pub prune: bool,
    pub field_manager: String,
    pub concurrency: usize,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            prune: false,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl ApplyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Outcome of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Updated,
    Unchanged,
    Planned,
    Failed,
    Deleted,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Planned => "planned",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub target: ObjectRef,
    pub action: Action,
    pub error: Option<KilnError>,
    pub duration: Duration,
}

impl StageResult {
    fn ok(target: ObjectRef, action: Action, started: Instant) -> Self {
        Self {
            target,
            action,
            error: None,
            duration: started.elapsed(),
        }
    }

    fn failed(target: ObjectRef, error: KilnError, started: Instant) -> Self {
        Self {
            target,
            action: Action::Failed,
            error: Some(error),
            duration: started.elapsed(),
        }
    }
}

/// Per-object results in apply order. Objects never attempted are absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub results: Vec<StageResult>,
    /// Stage whose failure stopped the run.
    pub aborted_at: Option<u8>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl ApplyReport {
    pub fn count(&self, action: Action) -> usize {
        self.results.iter().filter(|r| r.action == action).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &StageResult> {
        self.results.iter().filter(|r| r.action == Action::Failed)
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failures().next().is_none()
    }

    /// The error that ended the run, if any.
    pub fn error(&self) -> Option<KilnError> {
        self.failures()
            .find_map(|r| r.error.clone())
            .or_else(|| self.cancelled.then_some(KilnError::Cancelled))
    }

    pub fn action_of(&self, target: &ObjectRef) -> Option<Action> {
        self.results
            .iter()
            .find(|r| &r.target == target)
            .map(|r| r.action)
    }
}

/// Map a cluster failure on a write to the user-facing taxonomy.
pub fn classify_write_error(manifest: &Manifest, err: ClusterError) -> KilnError {
    let target = manifest.object_ref().to_string();
    match err {
        ClusterError::NotFound(_) => KilnError::NamespaceMissing {
            namespace: manifest.namespace.clone(),
        },
        ClusterError::Forbidden(message) => KilnError::Forbidden { target, message },
        ClusterError::Invalid(reason) => KilnError::InvalidObject { target, reason },
        ClusterError::Conflict(message) => {
            KilnError::internal(format!("field conflict on {} despite force: {}", target, message))
        }
        ClusterError::Unavailable(message) => {
            KilnError::internal(format!("applying {}: {}", target, message))
        }
    }
}

/// Applies bundles to one cluster.
pub struct Applier<'a> {
    cluster: &'a dyn ClusterHandle,
    options: ApplyOptions,
    cancel: CancelToken,
}

impl<'a> Applier<'a> {
    pub fn new(cluster: &'a dyn ClusterHandle, options: ApplyOptions) -> Self {
        Self {
            cluster,
            options,
            cancel: CancelToken::never(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &ApplyOptions {
        &self.options
    }

    /// Dry run: write the bundle as one YAML stream to `sink` and mark every
    /// object planned. No reads or writes reach the cluster.
    pub fn plan(&self, bundle: &Bundle, sink: &mut dyn Write) -> Result<ApplyReport> {
        let started = Instant::now();
        let yaml = bundle.to_yaml()?;
        sink.write_all(yaml.as_bytes())
            .and_then(|_| sink.flush())
            .map_err(|e| KilnError::internal(format!("write rendered objects: {}", e)))?;

        Ok(ApplyReport {
            results: bundle
                .iter()
                .map(|m| StageResult {
                    target: m.object_ref(),
                    action: Action::Planned,
                    error: None,
                    duration: Duration::ZERO,
                })
                .collect(),
            aborted_at: None,
            cancelled: false,
            duration: started.elapsed(),
        })
    }

    pub async fn apply(&self, bundle: &Bundle) -> ApplyReport {
        let started = Instant::now();
        let mut report = ApplyReport::default();

        for kind in Kind::ALL {
            let batch: Vec<&Manifest> = bundle.of_kind(kind).collect();
            if batch.is_empty() {
                continue;
            }
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            tracing::info!(stage = kind.stage(), kind = %kind, objects = batch.len(), "applying");
            let halt = AtomicBool::new(false);
            let critical = kind.is_critical();

            let mut results: Vec<StageResult> = stream::iter(batch)
                .map(|manifest| self.apply_one(manifest, &halt, critical))
                .buffer_unordered(self.options.concurrency.max(1))
                .filter_map(|result| async move { result })
                .collect()
                .await;
            results.sort_by(|a, b| a.target.cmp(&b.target));

            let failed = results.iter().any(|r| r.action == Action::Failed);
            report.results.extend(results);

            if failed {
                tracing::warn!(stage = kind.stage(), kind = %kind, "stage failed, stopping apply");
                report.aborted_at = Some(kind.stage());
                break;
            }
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
        }

        report.duration = started.elapsed();
        tracing::info!(
            created = report.count(Action::Created),
            updated = report.count(Action::Updated),
            unchanged = report.count(Action::Unchanged),
            failed = report.count(Action::Failed),
            "apply finished"
        );
        report
    }

    /// Probe then apply one object. `None` when the object was skipped
    /// because a critical sibling failed or the run was cancelled.
    async fn apply_one(
        &self,
        manifest: &Manifest,
        halt: &AtomicBool,
        critical: bool,
    ) -> Option<StageResult> {
        if halt.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            return None;
        }
        let started = Instant::now();
        let target = manifest.object_ref();

        let result = match self.probe_and_apply(manifest).await {
            Ok(action) => StageResult::ok(target, action, started),
            Err(error) => {
                if critical {
                    halt.store(true, Ordering::SeqCst);
                }
                tracing::warn!(object = %target, error = %error, "apply failed");
                StageResult::failed(target, error, started)
            }
        };
        tracing::debug!(object = %result.target, action = %result.action, "applied");
        Some(result)
    }

    async fn probe_and_apply(&self, manifest: &Manifest) -> Result<Action> {
        let target = manifest.object_ref();
        let existing = self
            .cluster
            .get(&target)
            .await
            .map_err(|e| classify_write_error(manifest, e))?;

        let action = match &existing {
            None => Action::Created,
            Some(live) => {
                if !is_managed(&live.labels()) {
                    return Err(KilnError::AdoptionRefused {
                        target: target.to_string(),
                    });
                }
                // Storage is created once and never reconciled.
                if manifest.kind == Kind::PersistentVolumeClaim {
                    return Ok(Action::Unchanged);
                }
                let same_content = live.annotation(OBJECT_HASH_ANNOTATION).is_some()
                    && live.annotation(OBJECT_HASH_ANNOTATION)
                        == manifest.annotation(OBJECT_HASH_ANNOTATION);
                if same_content {
                    if live.annotation(FINGERPRINT_ANNOTATION)
                        == manifest.annotation(FINGERPRINT_ANNOTATION)
                    {
                        return Ok(Action::Unchanged);
                    }
                    Action::Unchanged
                } else {
                    Action::Updated
                }
            }
        };

        let params = ApplyParams::new(self.options.field_manager.clone());
        self.cluster
            .apply(manifest, &params)
            .await
            .map_err(|e| classify_write_error(manifest, e))?;
        Ok(action)
    }
}
