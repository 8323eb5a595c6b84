//! Waits for applied workloads to become ready.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use rand::Rng;

use crate::bundle::{Bundle, Manifest, ObjectRef, string_map};
use crate::cancel::CancelToken;
use crate::cluster::{ClusterError, ClusterHandle, PodSnapshot};
use crate::error::{KilnError, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_JITTER: Duration = Duration::from_millis(200);

/// Waiting reasons after which a pod never becomes ready on its own.
pub const ACTIONABLE_REASONS: [&str; 5] = [
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Each poll sleeps `poll_interval` plus or minus up to this much.
    pub jitter: Duration,
}

impl Default for RolloutOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RolloutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    fn next_delay(&self) -> Duration {
        let jitter = self.jitter.min(self.poll_interval / 2);
        if jitter.is_zero() {
            return self.poll_interval;
        }
        let span = jitter.as_millis() as i64;
        let offset = rand::thread_rng().gen_range(-span..=span);
        let millis = self.poll_interval.as_millis() as i64 + offset;
        Duration::from_millis(millis.max(1) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyWorkload {
    pub target: ObjectRef,
    pub waited: Duration,
}

/// First actionable waiting container among `pods`.
pub fn actionable_failure(pods: &[PodSnapshot]) -> Option<KilnError> {
    pods.iter().find_map(|pod| {
        pod.waiting
            .iter()
            .find(|w| ACTIONABLE_REASONS.contains(&w.reason.as_str()))
            .map(|w| KilnError::PodFailure {
                pod: pod.name.clone(),
                reason: w.reason.clone(),
                message: w.message.clone(),
            })
    })
}

pub struct RolloutWatcher<'a> {
    cluster: &'a dyn ClusterHandle,
    options: RolloutOptions,
    cancel: CancelToken,
}

impl<'a> RolloutWatcher<'a> {
    pub fn new(cluster: &'a dyn ClusterHandle, options: RolloutOptions) -> Self {
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

    /// Watch every Deployment and StatefulSet of `bundle` concurrently. The
    /// first failure wins and the remaining watches are dropped.
    pub async fn watch(&self, bundle: &Bundle) -> Result<Vec<ReadyWorkload>> {
        let workloads: Vec<&Manifest> = bundle.workloads().collect();
        tracing::info!(workloads = workloads.len(), timeout_secs = self.options.timeout.as_secs(), "waiting for rollout");
        try_join_all(workloads.into_iter().map(|w| self.watch_one(w))).await
    }

    async fn watch_one(&self, workload: &Manifest) -> Result<ReadyWorkload> {
        let target = workload.object_ref();
        let selector = string_map(workload.body.pointer("/spec/selector/matchLabels"));
        let started = Instant::now();

        loop {
            self.cancel.check()?;

            if self.poll(&target, &selector).await? {
                let waited = started.elapsed();
                tracing::info!(workload = %target, waited_ms = waited.as_millis() as u64, "rollout complete");
                return Ok(ReadyWorkload { target, waited });
            }

            let elapsed = started.elapsed();
            if elapsed >= self.options.timeout {
                tracing::warn!(workload = %target, "rollout timed out");
                return Err(KilnError::RolloutTimeout {
                    workload: target.to_string(),
                    waited: elapsed,
                });
            }
            let delay = self.options.next_delay().min(self.options.timeout - elapsed);
            self.cancel.sleep(delay).await?;
        }
    }

    /// `Ok(true)` once the rollout completed; `Err(PodFailure)` as soon as a
    /// selected pod is stuck.
    async fn poll(&self, target: &ObjectRef, selector: &BTreeMap<String, String>) -> Result<bool> {
        let live = self.cluster.get(target).await.map_err(|e| poll_error(target, e))?;
        if let Some(live) = &live {
            let status = live.rollout_status();
            tracing::debug!(
                workload = %target,
                desired = status.desired,
                updated = status.updated,
                ready = status.ready,
                available = status.available,
                "rollout status"
            );
            if status.is_complete() {
                return Ok(true);
            }
        }

        let pods = self
            .cluster
            .list_pods(&target.namespace, selector)
            .await
            .map_err(|e| poll_error(target, e))?;
        match actionable_failure(&pods) {
            Some(failure) => Err(failure),
            None => Ok(false),
        }
    }
}

fn poll_error(target: &ObjectRef, err: ClusterError) -> KilnError {
    KilnError::internal(format!("watching {}: {}", target, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::WaitingContainer;

    fn pod(name: &str, reason: &str) -> PodSnapshot {
        PodSnapshot {
            name: name.to_string(),
            waiting: vec![WaitingContainer {
                container: "web".to_string(),
                reason: reason.to_string(),
                message: "details".to_string(),
            }],
        }
    }

    #[test]
    fn container_creating_is_not_actionable() {
        assert_eq!(actionable_failure(&[pod("web-0", "ContainerCreating")]), None);
    }

    #[test]
    fn image_pull_backoff_is_actionable() {
        let failure = actionable_failure(&[pod("web-0", "ContainerCreating"), pod("web-1", "ImagePullBackOff")]);
        assert_eq!(
            failure,
            Some(KilnError::PodFailure {
                pod: "web-1".to_string(),
                reason: "ImagePullBackOff".to_string(),
                message: "details".to_string(),
            })
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let options = RolloutOptions::default();
        for _ in 0..50 {
            let delay = options.next_delay();
            assert!(delay >= Duration::from_millis(1800));
            assert!(delay <= Duration::from_millis(2200));
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let options = RolloutOptions::new()
            .with_poll_interval(Duration::from_millis(50))
            .with_jitter(Duration::ZERO);
        assert_eq!(options.next_delay(), Duration::from_millis(50));
    }
}
