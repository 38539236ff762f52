use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use time::OffsetDateTime;

use crate::context::{ContextSet, QueryFlag, QueryOptions};
use crate::data::{DataType, MutateOutcome, NodeMap, TemporaryMergeBehaviour, TemporaryMutateResult};
use crate::node::{MetaType, Node, NodeEquality, NodeKind, Tristate};
use crate::policy::PartitionOrder;

const WEIGHT_META_KEY: &str = "weight";
const DISPLAY_NAME_META_KEY: &str = "display_name";

/// Receives a signal after every state-changing write to a holder's data.
pub trait MutationListener: Send + Sync {
    fn on_mutation(&self, holder: &str, data_type: DataType);
}

/// An entity that owns grants: identity plus enduring and transient partitions.
pub struct Holder {
    id: String,
    enduring: RwLock<NodeMap>,
    transient: RwLock<NodeMap>,
    listener: RwLock<Option<Arc<dyn MutationListener>>>,
}

impl fmt::Debug for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Holder")
            .field("id", &self.id)
            .field("enduring", &self.enduring.read().len())
            .field("transient", &self.transient.read().len())
            .finish_non_exhaustive()
    }
}

impl Holder {
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self::with_enduring(id, NodeMap::new())
    }

    #[must_use]
    pub fn with_enduring(id: &str, enduring: NodeMap) -> Self {
        Self {
            id: id.trim().to_lowercase(),
            enduring: RwLock::new(enduring),
            transient: RwLock::new(NodeMap::new()),
            listener: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name meta in the global context, falling back to the identity.
    #[must_use]
    pub fn friendly_name(&self) -> String {
        self.global_meta(DISPLAY_NAME_META_KEY).unwrap_or_else(|| self.id.clone())
    }

    /// Weight declared by a global `weight` meta node; 0 when absent or unparsable.
    #[must_use]
    pub fn weight(&self) -> i32 {
        self.global_meta(WEIGHT_META_KEY).and_then(|raw| raw.trim().parse().ok()).unwrap_or(0)
    }

    fn global_meta(&self, wanted: &str) -> Option<String> {
        let global = ContextSet::empty();
        [&self.transient, &self.enduring].into_iter().find_map(|partition| {
            partition.read().nodes_in(&global).iter().find_map(|node| match node.meta_entry() {
                Some((key, value)) if key == wanted => Some(value.to_string()),
                _ => None,
            })
        })
    }

    pub fn attach_listener(&self, listener: Arc<dyn MutationListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn detach_listener(&self) {
        *self.listener.write() = None;
    }

    #[must_use]
    pub fn data(&self, data_type: DataType) -> HolderData<'_> {
        HolderData { holder: self, data_type }
    }

    #[must_use]
    pub fn enduring(&self) -> HolderData<'_> {
        self.data(DataType::Enduring)
    }

    #[must_use]
    pub fn transient(&self) -> HolderData<'_> {
        self.data(DataType::Transient)
    }

    fn partition(&self, data_type: DataType) -> &RwLock<NodeMap> {
        match data_type {
            DataType::Enduring => &self.enduring,
            DataType::Transient => &self.transient,
        }
    }

    fn ordered_partitions(&self, order: PartitionOrder) -> [DataType; 2] {
        match order {
            PartitionOrder::TransientFirst => [DataType::Transient, DataType::Enduring],
            PartitionOrder::EnduringFirst => [DataType::Enduring, DataType::Transient],
        }
    }

    fn notify(&self, data_type: DataType) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_mutation(&self.id, data_type);
        }
    }

    /// Own nodes of both partitions, flattened in partition order. May contain duplicates.
    #[must_use]
    pub fn own_nodes(&self, order: PartitionOrder) -> Vec<Node> {
        self.ordered_partitions(order)
            .into_iter()
            .flat_map(|data_type| self.partition(data_type).read().nodes())
            .collect()
    }

    /// Own nodes without duplicates, most specific context first.
    #[must_use]
    pub fn own_distinct_nodes(&self, order: PartitionOrder) -> Vec<Node> {
        let mut nodes = self.own_nodes(order);
        nodes.sort_by_key(|node| std::cmp::Reverse(node.specificity()));
        let mut seen = HashSet::new();
        nodes.retain(|node| seen.insert((node.kind(), node.key(), node.context().clone())));
        nodes
    }

    /// Point-in-time view of the own nodes that apply under `options` at `now`.
    ///
    /// Expired nodes never appear. With [`QueryFlag::PreferTemporary`], expiring
    /// nodes are moved ahead of permanent ones, otherwise order is preserved.
    #[must_use]
    pub fn applicable_nodes(
        &self,
        options: &QueryOptions,
        order: PartitionOrder,
        now: OffsetDateTime,
    ) -> Vec<Node> {
        let include_transient = options.has_flag(QueryFlag::IncludeTransient);
        let mut nodes = Vec::new();
        for data_type in self.ordered_partitions(order) {
            if data_type == DataType::Transient && !include_transient {
                continue;
            }
            let partition = self.partition(data_type).read();
            nodes.extend(
                partition
                    .iter()
                    .filter(|node| !node.has_expired(now))
                    .filter(|node| node.context().is_satisfied_by(options.context()))
                    .cloned(),
            );
        }
        if options.has_flag(QueryFlag::PreferTemporary) {
            nodes.sort_by_key(|node| !node.is_temporary());
        }
        nodes
    }

    /// Identities referenced by inheritance nodes in any context, expired or not.
    #[must_use]
    pub fn parent_ids(&self) -> Vec<String> {
        let mut parents = Vec::new();
        for data_type in [DataType::Transient, DataType::Enduring] {
            for node in self.partition(data_type).read().iter() {
                if let Some(group) = node.inherited_group() {
                    if !parents.iter().any(|known: &String| known == group) {
                        parents.push(group.to_string());
                    }
                }
            }
        }
        parents
    }

    /// Removes expired nodes from both partitions; returns how many were removed.
    pub fn audit_temporary_permissions(&self) -> usize {
        self.audit_temporary_permissions_at(OffsetDateTime::now_utc())
    }

    pub fn audit_temporary_permissions_at(&self, now: OffsetDateTime) -> usize {
        let mut total = 0;
        for data_type in [DataType::Transient, DataType::Enduring] {
            let expired = self.partition(data_type).write().audit(now);
            if !expired.is_empty() {
                total += expired.len();
                tracing::debug!(
                    holder = %self.id,
                    partition = data_type.as_str(),
                    removed = expired.len(),
                    "removed expired nodes"
                );
                self.notify(data_type);
            }
        }
        total
    }
}

/// Mutation surface over one partition of a holder.
///
/// Every state-changing call signals the attached [`MutationListener`] once the
/// partition lock has been released. Calls that change nothing stay silent.
pub struct HolderData<'a> {
    holder: &'a Holder,
    data_type: DataType,
}

impl HolderData<'_> {
    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    fn mutate<R>(&self, apply: impl FnOnce(&mut NodeMap) -> R, changed: impl FnOnce(&R) -> bool) -> R {
        let result = apply(&mut self.holder.partition(self.data_type).write());
        if changed(&result) {
            self.holder.notify(self.data_type);
        }
        result
    }

    pub fn add_node(&self, node: Node) -> MutateOutcome {
        self.mutate(|map| map.add(node), |outcome| *outcome == MutateOutcome::Added)
    }

    pub fn add_node_with(&self, node: Node, merge: TemporaryMergeBehaviour) -> TemporaryMutateResult {
        self.mutate(|map| map.add_with(node, merge), |result| result.outcome == MutateOutcome::Added)
    }

    pub fn remove_node(&self, node: &Node) -> MutateOutcome {
        self.mutate(|map| map.remove(node), |outcome| *outcome == MutateOutcome::Removed)
    }

    pub fn remove_node_with(&self, node: &Node, equality: NodeEquality) -> MutateOutcome {
        self.mutate(|map| map.remove_with(node, equality), |outcome| *outcome == MutateOutcome::Removed)
    }

    pub fn clear_matching(&self, test: impl FnMut(&Node) -> bool) -> usize {
        self.mutate(|map| map.clear_matching(test), |removed| *removed > 0)
    }

    pub fn clear_all(&self) -> usize {
        self.mutate(NodeMap::clear, |removed| *removed > 0)
    }

    pub fn clear_in_context(&self, context: &ContextSet) -> usize {
        self.mutate(|map| map.clear_in_context(context), |removed| *removed > 0)
    }

    pub fn clear_by_kind(&self, meta_type: MetaType) -> usize {
        self.clear_matching(|node| meta_type.matches(node))
    }

    pub fn clear_meta_in_context(&self, meta_type: MetaType, context: &ContextSet) -> usize {
        self.clear_matching(|node| node.context() == context && meta_type.matches(node))
    }

    pub fn clear_parents(&self) -> usize {
        self.clear_matching(|node| node.kind() == NodeKind::Inheritance)
    }

    pub fn clear_parents_in_context(&self, context: &ContextSet) -> usize {
        self.clear_matching(|node| node.context() == context && node.kind() == NodeKind::Inheritance)
    }

    /// Replaces the whole partition, e.g. after loading from storage.
    pub fn replace_all(&self, nodes: impl IntoIterator<Item = Node>) {
        let replacement = NodeMap::from_nodes(nodes);
        self.mutate(|map| *map = replacement, |_| true);
    }

    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.holder.partition(self.data_type).read().nodes()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.holder.partition(self.data_type).read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holder.partition(self.data_type).read().is_empty()
    }

    #[must_use]
    pub fn has_node(&self, node: &Node, equality: NodeEquality) -> Tristate {
        self.holder.partition(self.data_type).read().has_node(node, equality)
    }
}
