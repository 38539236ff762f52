use serde::{Deserialize, Serialize};

use crate::meta_stack::MetaStackDefinition;

/// Ordering applied to the distinct resolved sequence before deduplication.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    /// Inheritance depth first (own nodes, then closer ancestors), then context specificity.
    #[default]
    OwnFirst,
    /// Context specificity first, then inheritance depth.
    SpecificityFirst,
}

/// Which partition leads when a holder's own nodes are flattened.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PartitionOrder {
    #[default]
    TransientFirst,
    EnduringFirst,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResolutionPolicy {
    #[serde(default)]
    pub precedence: Precedence,
    #[serde(default)]
    pub partition_order: PartitionOrder,
    #[serde(default)]
    pub prefix_stack: MetaStackDefinition,
    #[serde(default)]
    pub suffix_stack: MetaStackDefinition,
}
