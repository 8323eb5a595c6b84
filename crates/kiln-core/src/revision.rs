//! Release history kept in the cluster.
//!
//! Every app has one Secret `<app>-releases` holding a JSON document with
//! its revisions and the next index to hand out. Writers race on the
//! Secret's resource version and retry a bounded number of times.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bundle::{Bundle, summarize};
use crate::cluster::{ClusterError, ClusterHandle, StoredSecret};
use crate::error::{KilnError, Result};
use crate::labels::{APP_LABEL, MANAGED_BY_LABEL, RECORD_LABEL, TOOL_NAME, is_managed};
use crate::model::release_record_name;

pub const RECORD_TYPE: &str = "kiln.dev/release";
pub const RECORD_KEY: &str = "releases.json";
pub const DEFAULT_RETENTION: usize = 10;

/// Retries after the first attempt before giving up on a contended record.
const MAX_RETRIES: usize = 3;

/// One recorded deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub fingerprint: String,
    pub bundle_yaml: String,
    pub summary: String,
}

impl Revision {
    pub fn bundle(&self, app: &str) -> Result<Bundle> {
        Bundle::from_yaml(app, &self.bundle_yaml)
    }
}

/// The persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRecord {
    pub revisions: Vec<Revision>,
    pub next_index: u64,
}

impl Default for ReleaseRecord {
    fn default() -> Self {
        Self {
            revisions: Vec::new(),
            next_index: 1,
        }
    }
}

impl ReleaseRecord {
    pub fn latest(&self) -> Option<&Revision> {
        self.revisions.last()
    }

    /// Drop all but the newest `keep` revisions; returns how many went.
    fn retain_newest(&mut self, keep: usize) -> usize {
        let excess = self.revisions.len().saturating_sub(keep);
        self.revisions.drain(..excess);
        excess
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionOptions {
    pub retention: usize,
}

impl Default for RevisionOptions {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
        }
    }
}

impl RevisionOptions {
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }
}

pub struct RevisionStore<'a> {
    cluster: &'a dyn ClusterHandle,
    namespace: String,
    options: RevisionOptions,
}

impl<'a> RevisionStore<'a> {
    pub fn new(
        cluster: &'a dyn ClusterHandle,
        namespace: impl Into<String>,
        options: RevisionOptions,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            options,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Record a successful deploy of `bundle`. Recording the fingerprint of
    /// the latest revision again is a no-op returning that revision's index.
    pub async fn record(&self, app: &str, bundle: &Bundle, author: &str) -> Result<u64> {
        let fingerprint = bundle.fingerprint().to_string();
        let bundle_yaml = bundle.to_yaml()?;
        let retention = self.options.retention;

        self.modify(app, |record| {
            if let Some(latest) = record.latest() {
                if latest.fingerprint == fingerprint {
                    tracing::info!(app, index = latest.index, "revision unchanged");
                    return Ok((latest.index, false));
                }
            }
            let previous = record.latest().map(|r| r.bundle(app)).transpose()?;
            let index = record.next_index.max(1);
            record.revisions.push(Revision {
                index,
                timestamp: Utc::now(),
                author: author.to_string(),
                fingerprint: fingerprint.clone(),
                bundle_yaml: bundle_yaml.clone(),
                summary: summarize(previous.as_ref(), bundle),
            });
            record.next_index = index + 1;
            record.retain_newest(retention);
            tracing::info!(app, index, fingerprint = %fingerprint, "recorded revision");
            Ok((index, true))
        })
        .await
    }

    /// Revisions oldest first.
    pub async fn list(&self, app: &str) -> Result<Vec<Revision>> {
        Ok(self.load(app).await?.0.revisions)
    }

    pub async fn latest(&self, app: &str) -> Result<Option<Revision>> {
        Ok(self.load(app).await?.0.revisions.pop())
    }

    pub async fn get(&self, app: &str, index: u64) -> Result<Revision> {
        self.load(app)
            .await?
            .0
            .revisions
            .into_iter()
            .find(|r| r.index == index)
            .ok_or_else(|| KilnError::UnknownRevision {
                app: app.to_string(),
                index,
            })
    }

    /// Revision a rollback lands on: `to`, or the one before the latest.
    pub async fn rollback_target(&self, app: &str, to: Option<u64>) -> Result<Revision> {
        let index = match to {
            Some(index) => index,
            None => {
                let latest = self.latest(app).await?.map(|r| r.index).unwrap_or(0);
                latest.saturating_sub(1)
            }
        };
        self.get(app, index).await
    }

    /// Bundle to re-apply for a rollback. Nothing is written.
    pub async fn rollback(&self, app: &str, to: Option<u64>) -> Result<Bundle> {
        self.rollback_target(app, to).await?.bundle(app)
    }

    /// Keep only the newest `keep` revisions; returns how many were removed.
    pub async fn compact(&self, app: &str, keep: usize) -> Result<usize> {
        self.modify(app, |record| {
            let removed = record.retain_newest(keep);
            Ok((removed, removed > 0))
        })
        .await
    }

    async fn load(&self, app: &str) -> Result<(ReleaseRecord, Option<StoredSecret>)> {
        let name = release_record_name(app);
        let stored = self
            .cluster
            .read_secret(&self.namespace, &name)
            .await
            .map_err(|e| KilnError::internal(format!("read release record {}: {}", name, e)))?;

        let Some(stored) = stored else {
            return Ok((ReleaseRecord::default(), None));
        };
        // Secret types are immutable, so a record of another type can never be rewritten.
        if !is_managed(&stored.labels) || stored.type_ != RECORD_TYPE {
            return Err(KilnError::AdoptionRefused {
                target: format!("Secret/{}", name),
            });
        }
        let record = match stored.data.get(RECORD_KEY) {
            Some(raw) => serde_json::from_slice(raw).map_err(|e| {
                KilnError::internal(format!("release record {} is corrupt: {}", name, e))
            })?,
            None => ReleaseRecord::default(),
        };
        Ok((record, Some(stored)))
    }

    /// Optimistic read-modify-write. `change` returns its result and whether
    /// the record needs writing.
    async fn modify<T, F>(&self, app: &str, mut change: F) -> Result<T>
    where
        F: FnMut(&mut ReleaseRecord) -> Result<(T, bool)>,
    {
        for attempt in 0..=MAX_RETRIES {
            let (mut record, existing) = self.load(app).await?;
            let (result, changed) = change(&mut record)?;
            if !changed {
                return Ok(result);
            }

            let secret = self.record_secret(app, &record, existing)?;
            match self.cluster.write_secret(&secret).await {
                Ok(_) => return Ok(result),
                Err(ClusterError::Conflict(message)) => {
                    tracing::warn!(app, attempt, %message, "release record changed underneath, retrying");
                }
                Err(ClusterError::NotFound(_)) if secret.resource_version.is_none() => {
                    return Err(KilnError::NamespaceMissing {
                        namespace: self.namespace.clone(),
                    });
                }
                Err(ClusterError::NotFound(message)) => {
                    tracing::warn!(app, attempt, %message, "release record vanished, retrying");
                }
                Err(err) => {
                    return Err(KilnError::internal(format!(
                        "write release record {}: {}",
                        secret.name, err
                    )));
                }
            }
        }
        Err(KilnError::RevisionConflict {
            app: app.to_string(),
            attempts: MAX_RETRIES + 1,
        })
    }

    fn record_secret(
        &self,
        app: &str,
        record: &ReleaseRecord,
        existing: Option<StoredSecret>,
    ) -> Result<StoredSecret> {
        let payload = serde_json::to_vec(record)
            .map_err(|e| KilnError::internal(format!("encode release record: {}", e)))?;
        let labels = BTreeMap::from([
            (APP_LABEL.to_string(), app.to_string()),
            (MANAGED_BY_LABEL.to_string(), TOOL_NAME.to_string()),
            (RECORD_LABEL.to_string(), "releases".to_string()),
        ]);
        Ok(StoredSecret {
            namespace: self.namespace.clone(),
            name: release_record_name(app),
            type_: RECORD_TYPE.to_string(),
            labels,
            data: BTreeMap::from([(RECORD_KEY.to_string(), payload)]),
            resource_version: existing.and_then(|s| s.resource_version),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revision(index: u64) -> Revision {
        Revision {
            index,
            timestamp: Utc::now(),
            author: "dev".to_string(),
            fingerprint: format!("fp{}", index),
            bundle_yaml: String::new(),
            summary: String::new(),
        }
    }

    #[test]
    fn retain_newest_drops_oldest() {
        let mut record = ReleaseRecord {
            revisions: (1..=5).map(revision).collect(),
            next_index: 6,
        };
        assert_eq!(record.retain_newest(2), 3);
        let kept: Vec<u64> = record.revisions.iter().map(|r| r.index).collect();
        assert_eq!(kept, vec![4, 5]);
        assert_eq!(record.next_index, 6);
    }

    #[test]
    fn record_document_uses_camel_case() {
        let record = ReleaseRecord {
            revisions: vec![revision(1)],
            next_index: 2,
        };
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["nextIndex"], 2);
        assert!(json["revisions"][0].get("bundleYaml").is_some());
    }
}
