//! Deletes objects a previous revision created that the current one no
//! longer renders.

use std::cmp::Reverse;
use std::time::Instant;

use crate::apply::{Action, StageResult};
use crate::bundle::{Bundle, Kind, ObjectRef};
use crate::cancel::CancelToken;
use crate::cluster::{ClusterError, ClusterHandle};
use crate::error::KilnError;
use crate::labels::is_managed;

/// Objects to delete, in deletion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunePlan {
    pub candidates: Vec<ObjectRef>,
    /// Storage dropped from the bundle but left in place.
    pub retained: Vec<ObjectRef>,
}

impl PrunePlan {
    /// Everything in `previous` but not in `current`, reverse apply order.
    pub fn between(previous: &Bundle, current: &Bundle) -> Self {
        let current_refs = current.refs();
        let (mut retained, mut candidates): (Vec<ObjectRef>, Vec<ObjectRef>) = previous
            .refs()
            .into_iter()
            .filter(|r| !current_refs.contains(r))
            .partition(|r| r.kind == Kind::PersistentVolumeClaim);

        candidates.sort_by_key(|r| (Reverse(r.kind.stage()), r.clone()));
        retained.sort();
        Self {
            candidates,
            retained,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPrune {
    pub target: ObjectRef,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneReport {
    pub results: Vec<StageResult>,
    pub skipped: Vec<SkippedPrune>,
}

impl PruneReport {
    pub fn deleted(&self) -> impl Iterator<Item = &ObjectRef> {
        self.results
            .iter()
            .filter(|r| r.action == Action::Deleted)
            .map(|r| &r.target)
    }

    pub fn error(&self) -> Option<KilnError> {
        self.results.iter().find_map(|r| r.error.clone())
    }
}

pub struct Pruner<'a> {
    cluster: &'a dyn ClusterHandle,
    cancel: CancelToken,
}

impl<'a> Pruner<'a> {
    pub fn new(cluster: &'a dyn ClusterHandle) -> Self {
        Self {
            cluster,
            cancel: CancelToken::never(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Candidates reported as planned; the cluster is not contacted.
    pub fn plan(&self, plan: &PrunePlan) -> PruneReport {
        PruneReport {
            results: plan
                .candidates
                .iter()
                .map(|target| StageResult {
                    target: target.clone(),
                    action: Action::Planned,
                    error: None,
                    duration: Default::default(),
                })
                .collect(),
            skipped: Vec::new(),
        }
    }

    /// Delete each candidate that still exists and carries the managed-by
    /// label. Failures are collected; the remaining candidates still run.
    pub async fn prune(&self, plan: &PrunePlan) -> PruneReport {
        let mut report = PruneReport::default();
        for target in &plan.retained {
            tracing::info!(object = %target, "leaving storage in place");
        }

        for target in &plan.candidates {
            if self.cancel.is_cancelled() {
                tracing::warn!("prune cancelled");
                break;
            }
            let started = Instant::now();
            match self.prune_one(target).await {
                Ok(None) => {
                    tracing::info!(object = %target, "pruned");
                    report.results.push(StageResult {
                        target: target.clone(),
                        action: Action::Deleted,
                        error: None,
                        duration: started.elapsed(),
                    });
                }
                Ok(Some(reason)) => {
                    tracing::warn!(object = %target, %reason, "not pruned");
                    report.skipped.push(SkippedPrune {
                        target: target.clone(),
                        reason,
                    });
                }
                Err(error) => {
                    tracing::warn!(object = %target, %error, "prune failed");
                    report.results.push(StageResult {
                        target: target.clone(),
                        action: Action::Failed,
                        error: Some(error),
                        duration: started.elapsed(),
                    });
                }
            }
        }
        report
    }

    /// `Ok(None)` when deleted, `Ok(Some(reason))` when skipped.
    async fn prune_one(&self, target: &ObjectRef) -> Result<Option<String>, KilnError> {
        if target.kind == Kind::PersistentVolumeClaim {
            return Ok(Some("storage is never pruned".to_string()));
        }
        let live = match self.cluster.get(target).await {
            Ok(live) => live,
            Err(err) => return Err(delete_error(target, err)),
        };
        let Some(live) = live else {
            return Ok(Some("already absent".to_string()));
        };
        if !is_managed(&live.labels()) {
            return Ok(Some("not managed by kiln".to_string()));
        }
        match self.cluster.delete(target).await {
            Ok(()) => Ok(None),
            Err(ClusterError::NotFound(_)) => Ok(Some("already absent".to_string())),
            Err(err) => Err(delete_error(target, err)),
        }
    }
}

fn delete_error(target: &ObjectRef, err: ClusterError) -> KilnError {
    match err {
        ClusterError::Forbidden(message) => KilnError::Forbidden {
            target: target.to_string(),
            message,
        },
        other => KilnError::internal(format!("deleting {}: {}", target, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Manifest;
    use std::collections::BTreeMap;

    fn bundle(objects: &[(Kind, &str)]) -> Bundle {
        let mut bundle = Bundle::new("app");
        for (kind, name) in objects {
            bundle
                .insert(Manifest::new(*kind, "default", *name, &BTreeMap::new(), &BTreeMap::new()))
                .expect("unique object");
        }
        bundle
    }

    #[test]
    fn plan_orders_ingress_before_config_and_keeps_storage() {
        let previous = bundle(&[
            (Kind::PersistentVolumeClaim, "app-data"),
            (Kind::ConfigMap, "app-config"),
            (Kind::Deployment, "app"),
            (Kind::Ingress, "app-example-com"),
        ]);
        let current = bundle(&[(Kind::Deployment, "app")]);

        let plan = PrunePlan::between(&previous, &current);
        let names: Vec<&str> = plan.candidates.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["app-example-com", "app-config"]);
        assert_eq!(plan.retained.len(), 1);
        assert_eq!(plan.retained[0].kind, Kind::PersistentVolumeClaim);
    }

    #[test]
    fn identical_bundles_prune_nothing() {
        let previous = bundle(&[(Kind::Service, "app"), (Kind::Deployment, "app")]);
        assert!(PrunePlan::between(&previous, &previous.clone()).is_empty());
    }
}
