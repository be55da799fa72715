//! Expert merging and pruning for mixture-of-experts layers.
//!
//! Given a grouping assignment, each group of experts is collapsed into a
//! single set of weights bound to every member slot through the layer's
//! representative table. Strategies range from plain weighted averaging to
//! correlation-driven unit matching over captured activations.

mod average;
mod dominant;
mod error;
mod knowledge;
mod pipeline;
mod prune;
mod zip;

pub use average::{
    merge_layer_average, merge_layer_by_usage, merge_layer_fixed, FixedWeights,
};
pub use dominant::{dominant_merge_group, DominantRule};
pub use error::{Error, Result};
pub use knowledge::{
    feature_selection_merge_group, knowledge_merge_group, knowledge_merge_layer,
};
pub use pipeline::{
    feature_selection_merge_all, knowledge_dominant_pipeline, merge_by_groups,
    usage_weighted_merge_all, LayerReport, MergeOptions, MergeReport, MergeStrategy,
};
pub use prune::{enumerate_expert_drops, prune_layer};
pub use zip::{
    zip_merge_group, zip_merge_group_recompute, Ingredient, ZipConfig,
};
