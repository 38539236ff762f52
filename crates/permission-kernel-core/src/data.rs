use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::context::ContextSet;
use crate::node::{Node, NodeEquality, Tristate};

/// The two storage partitions of a holder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Persisted across restarts by the storage collaborator.
    Enduring,
    /// Session-scoped; never persisted and lost on unload.
    Transient,
}

impl DataType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enduring => "enduring",
            Self::Transient => "transient",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MutateOutcome {
    Added,
    AlreadyHas,
    Removed,
    NotFound,
}

impl MutateOutcome {
    #[must_use]
    pub fn was_successful(self) -> bool {
        matches!(self, Self::Added | Self::Removed)
    }
}

/// Policy applied when an added node collides with a stored node of the same
/// kind, key, and context but a different value or expiry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TemporaryMergeBehaviour {
    /// Keep both nodes.
    AddNew,
    /// Overwrite the stored node's value and expiry.
    Replace,
    /// Reject the new node, leaving the partition unchanged.
    DenyIfConflicting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryMutateResult {
    pub outcome: MutateOutcome,
    /// The node now stored for the key: the added node, or the one that blocked it.
    pub merged: Node,
}

/// One storage partition: nodes bucketed by their exact context set, each bucket
/// kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMap {
    buckets: BTreeMap<ContextSet, Vec<Node>>,
}

impl NodeMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut map = Self::new();
        for node in nodes {
            map.buckets.entry(node.context().clone()).or_default().push(node);
        }
        map
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Flattened view in bucket order, then insertion order.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.buckets.values().flatten()
    }

    #[must_use]
    pub fn nodes_in(&self, context: &ContextSet) -> &[Node] {
        self.buckets.get(context).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn contexts(&self) -> Vec<ContextSet> {
        self.buckets.keys().cloned().collect()
    }

    pub fn add(&mut self, node: Node) -> MutateOutcome {
        self.add_with(node, TemporaryMergeBehaviour::DenyIfConflicting).outcome
    }

    pub fn add_with(&mut self, node: Node, merge: TemporaryMergeBehaviour) -> TemporaryMutateResult {
        let bucket = self.buckets.entry(node.context().clone()).or_default();

        if let Some(existing) = bucket.iter().find(|existing| NodeEquality::Exact.matches(existing, &node))
        {
            return TemporaryMutateResult { outcome: MutateOutcome::AlreadyHas, merged: existing.clone() };
        }

        let conflict = bucket
            .iter()
            .position(|existing| NodeEquality::IgnoreValueAndExpiry.matches(existing, &node));

        match (conflict, merge) {
            (None, _) | (Some(_), TemporaryMergeBehaviour::AddNew) => {
                bucket.push(node.clone());
                TemporaryMutateResult { outcome: MutateOutcome::Added, merged: node }
            }
            (Some(index), TemporaryMergeBehaviour::Replace) => {
                bucket[index] = node.clone();
                TemporaryMutateResult { outcome: MutateOutcome::Added, merged: node }
            }
            (Some(index), TemporaryMergeBehaviour::DenyIfConflicting) => TemporaryMutateResult {
                outcome: MutateOutcome::AlreadyHas,
                merged: bucket[index].clone(),
            },
        }
    }

    pub fn remove(&mut self, node: &Node) -> MutateOutcome {
        self.remove_with(node, NodeEquality::Exact)
    }

    /// Removes every node equal to `node` under `equality`.
    pub fn remove_with(&mut self, node: &Node, equality: NodeEquality) -> MutateOutcome {
        let Some(bucket) = self.buckets.get_mut(node.context()) else {
            return MutateOutcome::NotFound;
        };
        let before = bucket.len();
        bucket.retain(|existing| !equality.matches(existing, node));
        let removed = before != bucket.len();
        if bucket.is_empty() {
            self.buckets.remove(node.context());
        }
        if removed {
            MutateOutcome::Removed
        } else {
            MutateOutcome::NotFound
        }
    }

    /// Removes nodes passing `test`; returns how many were removed.
    pub fn clear_matching(&mut self, mut test: impl FnMut(&Node) -> bool) -> usize {
        let mut removed = 0;
        for bucket in self.buckets.values_mut() {
            let before = bucket.len();
            bucket.retain(|node| !test(node));
            removed += before - bucket.len();
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        removed
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.len();
        self.buckets.clear();
        removed
    }

    pub fn clear_in_context(&mut self, context: &ContextSet) -> usize {
        self.buckets.remove(context).map_or(0, |bucket| bucket.len())
    }

    /// Removes expired nodes and returns them.
    pub fn audit(&mut self, now: OffsetDateTime) -> Vec<Node> {
        let mut expired = Vec::new();
        for bucket in self.buckets.values_mut() {
            let (gone, kept): (Vec<Node>, Vec<Node>) =
                std::mem::take(bucket).into_iter().partition(|node| node.has_expired(now));
            *bucket = kept;
            expired.extend(gone);
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        expired
    }

    #[must_use]
    pub fn has_node(&self, node: &Node, equality: NodeEquality) -> Tristate {
        self.nodes_in(node.context())
            .iter()
            .find(|existing| equality.matches(existing, node))
            .map_or(Tristate::Undefined, |found| Tristate::from(found.value()))
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::node::NodeBuilder;

    fn build(builder: NodeBuilder) -> Node {
        match builder.build() {
            Ok(node) => node,
            Err(err) => panic!("fixture node failed to build: {err}"),
        }
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    #[test]
    fn add_then_add_again_reports_already_has() {
        let mut map = NodeMap::new();
        let node = build(Node::permission("perm.fly"));

        assert_eq!(map.add(node.clone()), MutateOutcome::Added);
        assert_eq!(map.add(node.clone()), MutateOutcome::AlreadyHas);
        assert_eq!(map.add(build(Node::permission("perm.fly").value(false))), MutateOutcome::AlreadyHas);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn deny_if_conflicting_leaves_store_unchanged() {
        let mut map = NodeMap::new();
        let permanent = build(Node::permission("perm.vip"));
        map.add(permanent.clone());
        let snapshot = map.clone();

        let temporary = build(Node::permission("perm.vip").expiry(fixture_time()));
        let result = map.add_with(temporary, TemporaryMergeBehaviour::DenyIfConflicting);

        assert_eq!(result.outcome, MutateOutcome::AlreadyHas);
        assert_eq!(result.merged, permanent);
        assert_eq!(map, snapshot);
    }

    #[test]
    fn replace_overwrites_and_add_new_keeps_both() {
        let first = build(Node::permission("perm.vip").expiry(fixture_time()));
        let later = build(Node::permission("perm.vip").expiry(fixture_time() + Duration::days(1)));

        let mut replaced = NodeMap::from_nodes([first.clone()]);
        let result = replaced.add_with(later.clone(), TemporaryMergeBehaviour::Replace);
        assert_eq!(result.outcome, MutateOutcome::Added);
        assert_eq!(replaced.nodes(), vec![later.clone()]);

        let mut both = NodeMap::from_nodes([first.clone()]);
        let result = both.add_with(later.clone(), TemporaryMergeBehaviour::AddNew);
        assert_eq!(result.outcome, MutateOutcome::Added);
        assert_eq!(both.nodes(), vec![first, later]);
    }

    #[test]
    fn remove_reports_not_found() {
        let node = build(Node::meta("rank", "gold"));
        let mut map = NodeMap::from_nodes([node.clone()]);

        assert_eq!(map.remove(&build(Node::meta("rank", "silver"))), MutateOutcome::NotFound);
        assert_eq!(map.remove(&node), MutateOutcome::Removed);
        assert_eq!(map.remove(&node), MutateOutcome::NotFound);
        assert!(map.is_empty());
    }

    #[test]
    fn clear_variants() {
        let nether = ContextSet::of("world", "nether");
        let mut map = NodeMap::from_nodes([
            build(Node::permission("a")),
            build(Node::permission("b").context(nether.clone())),
            build(Node::prefix(5, "[P]")),
            build(Node::inheritance("vip").context(nether.clone())),
        ]);

        assert_eq!(map.clear_in_context(&nether), 2);
        assert_eq!(map.clear_matching(|node| node.chat_entry().is_some()), 1);
        assert_eq!(map.clear(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn audit_removes_only_expired() {
        let expired = build(Node::permission("old").expiry(fixture_time()));
        let live = build(Node::permission("new").expiry(fixture_time() + Duration::hours(1)));
        let mut map = NodeMap::from_nodes([expired.clone(), live.clone()]);

        let removed = map.audit(fixture_time());
        assert_eq!(removed, vec![expired]);
        assert_eq!(map.nodes(), vec![live]);
    }

    #[test]
    fn has_node_reports_value_as_tristate() {
        let negated = build(Node::permission("perm.fly").value(false));
        let map = NodeMap::from_nodes([negated]);

        let candidate = build(Node::permission("perm.fly"));
        assert_eq!(map.has_node(&candidate, NodeEquality::IgnoreValue), Tristate::False);
        assert_eq!(map.has_node(&candidate, NodeEquality::Exact), Tristate::Undefined);
    }
}
