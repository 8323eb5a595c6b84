//! Deploy and rollback pipelines.
//!
//! Deploy runs render, apply, rollout, record and prune strictly in that
//! order. A revision is only recorded after its rollout completed, so every
//! revision in the history applied cleanly.

use std::io::Write;
use std::time::{Duration, Instant};

use crate::apply::{ApplyOptions, ApplyReport, Applier};
use crate::bundle::Bundle;
use crate::cancel::CancelToken;
use crate::cluster::ClusterHandle;
use crate::error::{KilnError, Result};
use crate::model::{AppModel, validate};
use crate::prune::{PrunePlan, PruneReport, Pruner};
use crate::render::{RenderContext, dependency_secret_names, render};
use crate::revision::{RevisionOptions, RevisionStore};
use crate::rollout::{ReadyWorkload, RolloutOptions, RolloutWatcher};

/// Everything a pipeline run needs besides the model.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub apply: ApplyOptions,
    pub rollout: RolloutOptions,
    pub revisions: RevisionOptions,
    /// Overrides the model's namespace.
    pub namespace: Option<String>,
    pub author: String,
    /// Salt for new dependency passwords; random when unset.
    pub salt: Option<String>,
}

/// Outcome of a deploy or rollback. `error` is set when the run failed;
/// the other fields describe how far it got.
#[derive(Debug, Clone, Default)]
pub struct DeployReport {
    pub app: String,
    pub namespace: String,
    pub context: String,
    pub fingerprint: Option<String>,
    pub apply: ApplyReport,
    pub rollout: Vec<ReadyWorkload>,
    pub revision: Option<u64>,
    /// Index a rollback re-applied.
    pub rolled_back_to: Option<u64>,
    pub prune: PruneReport,
    pub dry_run: bool,
    pub error: Option<KilnError>,
    pub duration: Duration,
}

impl DeployReport {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(0, KilnError::exit_code)
    }
}

pub struct Pipeline<'a> {
    cluster: &'a dyn ClusterHandle,
    options: DeployOptions,
    cancel: CancelToken,
}

impl<'a> Pipeline<'a> {
    pub fn new(cluster: &'a dyn ClusterHandle, options: DeployOptions) -> Self {
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

    pub fn options(&self) -> &DeployOptions {
        &self.options
    }

    /// Deploy `model`. In dry-run mode the rendered stream goes to `sink`
    /// and nothing is written to the cluster.
    pub async fn deploy(&self, model: &AppModel, sink: &mut dyn Write) -> DeployReport {
        let started = Instant::now();
        let mut report = self.report_for(&model.name, self.target_namespace(model));
        tracing::info!(app = %report.app, namespace = %report.namespace, context = %report.context, "deploy");

        if let Err(error) = self.run_deploy(model, sink, &mut report).await {
            tracing::warn!(app = %report.app, class = error.class(), %error, "deploy failed");
            report.error = Some(error);
        }
        report.duration = started.elapsed();
        report
    }

    /// Re-apply revision `to` (default: the one before the latest) and
    /// record it as a new revision once its rollout completes.
    pub async fn rollback(
        &self,
        app: &str,
        namespace: &str,
        to: Option<u64>,
        sink: &mut dyn Write,
    ) -> DeployReport {
        let started = Instant::now();
        let mut report = self.report_for(app, namespace.to_string());

        if let Err(error) = self.run_rollback(to, sink, &mut report).await {
            tracing::warn!(app, class = error.class(), %error, "rollback failed");
            report.error = Some(error);
        }
        report.duration = started.elapsed();
        report
    }

    fn report_for(&self, app: &str, namespace: String) -> DeployReport {
        DeployReport {
            app: app.to_string(),
            namespace,
            context: self.cluster.context(),
            dry_run: self.options.apply.dry_run,
            ..Default::default()
        }
    }

    fn target_namespace(&self, model: &AppModel) -> String {
        self.options
            .namespace
            .clone()
            .unwrap_or_else(|| model.namespace.clone())
    }

    fn store(&self, namespace: &str) -> RevisionStore<'a> {
        RevisionStore::new(self.cluster, namespace, self.options.revisions)
    }

    async fn run_deploy(
        &self,
        model: &AppModel,
        sink: &mut dyn Write,
        report: &mut DeployReport,
    ) -> Result<()> {
        self.cancel.check()?;
        validate(model)?;
        let ctx = self.render_context(model, &report.namespace).await?;
        let bundle = render(model, &ctx)?;
        report.fingerprint = Some(bundle.fingerprint().to_string());

        let previous = self.previous_bundle(&report.app, &report.namespace).await?;
        self.release(&bundle, previous.as_ref(), sink, report).await
    }

    async fn run_rollback(
        &self,
        to: Option<u64>,
        sink: &mut dyn Write,
        report: &mut DeployReport,
    ) -> Result<()> {
        self.cancel.check()?;
        let store = self.store(&report.namespace);
        let target = store.rollback_target(&report.app, to).await?;
        let bundle = target.bundle(&report.app)?;
        report.rolled_back_to = Some(target.index);
        report.fingerprint = Some(bundle.fingerprint().to_string());
        tracing::info!(app = %report.app, index = target.index, "rolling back");

        let previous = self.previous_bundle(&report.app, &report.namespace).await?;
        self.release(&bundle, previous.as_ref(), sink, report).await
    }

    /// Apply, watch, record and prune an already rendered bundle.
    async fn release(
        &self,
        bundle: &Bundle,
        previous: Option<&Bundle>,
        sink: &mut dyn Write,
        report: &mut DeployReport,
    ) -> Result<()> {
        let plan = match previous {
            Some(previous) if self.options.apply.prune => PrunePlan::between(previous, bundle),
            _ => PrunePlan::default(),
        };
        let applier = Applier::new(self.cluster, self.options.apply.clone())
            .with_cancel(self.cancel.clone());
        let pruner = Pruner::new(self.cluster).with_cancel(self.cancel.clone());

        if self.options.apply.dry_run {
            report.apply = applier.plan(bundle, sink)?;
            report.prune = pruner.plan(&plan);
            return Ok(());
        }

        report.apply = applier.apply(bundle).await;
        if let Some(error) = report.apply.error() {
            return Err(error);
        }

        let watcher = RolloutWatcher::new(self.cluster, self.options.rollout)
            .with_cancel(self.cancel.clone());
        report.rollout = watcher.watch(bundle).await?;

        let index = self
            .store(&report.namespace)
            .record(&report.app, bundle, &self.options.author)
            .await?;
        report.revision = Some(index);

        if !plan.is_empty() {
            report.prune = pruner.prune(&plan).await;
            if let Some(error) = report.prune.error() {
                tracing::warn!(app = %report.app, %error, "prune incomplete; revision kept");
            }
        }
        Ok(())
    }

    /// Reuse the credentials of dependency Secrets that already exist.
    /// Latest recorded bundle; only pruning compares against it.
    async fn previous_bundle(&self, app: &str, namespace: &str) -> Result<Option<Bundle>> {
        if !self.options.apply.prune {
            return Ok(None);
        }
        match self.store(namespace).latest(app).await? {
            Some(revision) => Ok(Some(revision.bundle(app)?)),
            None => Ok(None),
        }
    }

    /// Dry runs probe nothing, so dependency credentials are drawn fresh.
    async fn render_context(&self, model: &AppModel, namespace: &str) -> Result<RenderContext> {
        let mut ctx = RenderContext::new().with_namespace(namespace);
        if let Some(salt) = &self.options.salt {
            ctx = ctx.with_salt(salt.clone());
        }
        if self.options.apply.dry_run {
            return Ok(ctx);
        }
        for name in dependency_secret_names(model) {
            let existing = self
                .cluster
                .read_secret(namespace, &name)
                .await
                .map_err(|e| KilnError::internal(format!("read Secret/{}: {}", name, e)))?;
            if let Some(secret) = existing {
                tracing::debug!(secret = %name, "reusing dependency credentials");
                ctx = ctx.with_existing_secret(name, secret.string_data());
            }
        }
        Ok(ctx)
    }
}
