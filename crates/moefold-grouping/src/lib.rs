//! Expert grouping: similarity, usage, knowledge and group assignment.
//!
//! The [`Grouper`] holds per-layer state (labels, similarity, usage,
//! knowledge, cores) and drives the assignment engines:
//! - global dominant-anchored assignment with usage-apportioned group counts
//!   and capacity eviction,
//! - layerwise top-usage cores without a capacity limit,
//! - clustering (k-means or agglomerative) with silhouette model selection,
//! - a seeded random baseline.
//!
//! Estimators fill the state from a calibration stream: pairwise similarity
//! per configurable basis, per-expert usage, and mask-gradient knowledge
//! scores.

mod clustering;
mod collect;
mod config;
mod error;
mod grouper;
mod knowledge;
mod similarity;
mod snapshot;
mod usage;

pub use collect::{collect_layer_captures, subsample_rows, LayerCaptures};
pub use config::{
    ClusterMethod, GrouperConfig, KnowledgeConfig, Linkage, OverlapMetric, SimilarityBasis,
    SimilarityMeasure, UsageMode,
};
pub use error::{Error, Result};
pub use grouper::{Grouper, LayerState, EVICTION_SENTINEL};
pub use snapshot::{GroupingSnapshot, LayerSnapshot};
