//! Kiln Core Library
//!
//! Renders declarative app models into Kubernetes objects, applies them in
//! dependency order, waits for rollouts and keeps a per-app release history
//! for rollback and pruning.

pub mod apply;
pub mod author;
pub mod bundle;
pub mod cancel;
pub mod cluster;
pub mod context;
pub mod error;
pub mod labels;
pub mod model;
pub mod pipeline;
pub mod preview;
pub mod prune;
pub mod render;
pub mod report;
pub mod revision;
pub mod rollout;
pub mod settings;

/// Re-exports of commonly used types
pub mod prelude {
    // Model
    pub use crate::model::{
        AppModel, Dependency, DependencyKind, IngressRule, JobModel, ServiceModel, Topology,
        VolumeModel, load_model,
    };

    // Rendering
    pub use crate::bundle::{Bundle, Kind, Manifest, ObjectRef};
    pub use crate::render::{RenderContext, render};

    // Cluster
    pub use crate::cluster::{ClusterError, ClusterHandle, KubeCluster, MemoryCluster};

    // Pipeline stages
    pub use crate::apply::{Action, Applier, ApplyOptions, ApplyReport, StageResult};
    pub use crate::cancel::{CancelSource, CancelToken};
    pub use crate::pipeline::{DeployOptions, DeployReport, Pipeline};
    pub use crate::preview::PreviewManager;
    pub use crate::prune::{PrunePlan, Pruner};
    pub use crate::revision::{Revision, RevisionOptions, RevisionStore};
    pub use crate::rollout::{RolloutOptions, RolloutWatcher};

    // Errors, settings, reports
    pub use crate::context::AppContext;
    pub use crate::error::{KilnError, Result};
    pub use crate::report::MachineReport;
    pub use crate::settings::{OutputFormat, Settings};
}
