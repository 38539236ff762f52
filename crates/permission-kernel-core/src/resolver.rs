use std::collections::HashSet;
use std::sync::Arc;

use time::OffsetDateTime;

use crate::context::{QueryFlag, QueryOptions};
use crate::holder::Holder;
use crate::node::{Node, NodeEquality, NodeKind, Tristate};
use crate::policy::{Precedence, ResolutionPolicy};

/// Resolves holder identities referenced by inheritance nodes.
pub trait HolderLookup: Send + Sync {
    fn holder(&self, id: &str) -> Option<Arc<Holder>>;
}

/// Orders inherited holders; higher weight is visited first.
pub trait GroupRanking: Send + Sync {
    /// `None` when the ranking knows nothing about `id`; such holders rank at 0.
    fn weight(&self, id: &str) -> Option<i32>;
}

/// Advisory sink for resolution anomalies. Never affects the result.
pub trait ResolutionObserver: Send + Sync {
    fn missing_ancestor(&self, holder: &str, ancestor: &str);
    fn cycle_detected(&self, holder: &str, ancestor: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ResolutionObserver for TracingObserver {
    fn missing_ancestor(&self, holder: &str, ancestor: &str) {
        tracing::warn!(holder, ancestor, "inherited holder is not loaded; contributing nothing");
    }

    fn cycle_detected(&self, holder: &str, ancestor: &str) {
        tracing::warn!(holder, ancestor, "inheritance cycle detected; edge skipped");
    }
}

/// A resolved node tagged with the holder it came from and its inheritance depth
/// (0 for the queried holder's own nodes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritedNode {
    node: Node,
    origin: String,
    depth: usize,
}

impl InheritedNode {
    #[must_use]
    pub fn new(node: Node, origin: &str, depth: usize) -> Self {
        Self { node, origin: origin.to_string(), depth }
    }

    #[must_use]
    pub fn node(&self) -> &Node {
        &self.node
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn into_node(self) -> Node {
        self.node
    }
}

/// Walks a holder's inheritance graph under one set of query options.
///
/// Traversal is depth-first with an explicit visited set, so cyclic graphs
/// terminate and every holder contributes its own nodes at most once. Each
/// holder is read through a point-in-time snapshot of its partitions, which
/// keeps the walk safe against concurrent writers.
pub struct InheritanceResolver<'a> {
    lookup: &'a dyn HolderLookup,
    ranking: &'a dyn GroupRanking,
    observer: &'a dyn ResolutionObserver,
    policy: &'a ResolutionPolicy,
}

struct Walk<'q> {
    options: &'q QueryOptions,
    now: OffsetDateTime,
    visited: HashSet<String>,
    path: Vec<String>,
    out: Vec<InheritedNode>,
}

impl<'a> InheritanceResolver<'a> {
    #[must_use]
    pub fn new(
        lookup: &'a dyn HolderLookup,
        ranking: &'a dyn GroupRanking,
        observer: &'a dyn ResolutionObserver,
        policy: &'a ResolutionPolicy,
    ) -> Self {
        Self { lookup, ranking, observer, policy }
    }

    #[must_use]
    pub fn policy(&self) -> &ResolutionPolicy {
        self.policy
    }

    /// Own nodes, then each ancestor's contribution, duplicates preserved.
    #[must_use]
    pub fn resolve_inherited_nodes(&self, holder: &Holder, options: &QueryOptions) -> Vec<InheritedNode> {
        self.resolve_inherited_nodes_at(holder, options, OffsetDateTime::now_utc())
    }

    #[must_use]
    pub fn resolve_inherited_nodes_at(
        &self,
        holder: &Holder,
        options: &QueryOptions,
        now: OffsetDateTime,
    ) -> Vec<InheritedNode> {
        let mut walk =
            Walk { options, now, visited: HashSet::new(), path: Vec::new(), out: Vec::new() };
        self.visit(holder, 0, &mut walk);
        walk.out
    }

    /// Deduplicated and precedence-sorted view of [`Self::resolve_inherited_nodes`].
    #[must_use]
    pub fn resolve_distinct_inherited_nodes(
        &self,
        holder: &Holder,
        options: &QueryOptions,
    ) -> Vec<InheritedNode> {
        distinct(self.resolve_inherited_nodes(holder, options), self.policy.precedence)
    }

    #[must_use]
    pub fn resolve_distinct_inherited_nodes_at(
        &self,
        holder: &Holder,
        options: &QueryOptions,
        now: OffsetDateTime,
    ) -> Vec<InheritedNode> {
        distinct(self.resolve_inherited_nodes_at(holder, options, now), self.policy.precedence)
    }

    /// Value of the highest-precedence resolved node equal to `node` under `equality`.
    #[must_use]
    pub fn inherits_node(
        &self,
        holder: &Holder,
        node: &Node,
        equality: NodeEquality,
        options: &QueryOptions,
    ) -> Tristate {
        self.resolve_distinct_inherited_nodes(holder, options)
            .iter()
            .find(|entry| equality.matches(entry.node(), node))
            .map_or(Tristate::Undefined, |entry| Tristate::from(entry.node().value()))
    }

    fn visit(&self, holder: &Holder, depth: usize, walk: &mut Walk<'_>) {
        if !walk.visited.insert(holder.id().to_string()) {
            return;
        }
        walk.path.push(holder.id().to_string());

        let nodes = holder.applicable_nodes(walk.options, self.policy.partition_order, walk.now);
        let (parents, own): (Vec<Node>, Vec<Node>) =
            nodes.into_iter().partition(|node| node.kind() == NodeKind::Inheritance);
        walk.out.extend(own.into_iter().map(|node| InheritedNode::new(node, holder.id(), depth)));
        walk.out.extend(parents.iter().cloned().map(|node| InheritedNode::new(node, holder.id(), depth)));

        if walk.options.has_flag(QueryFlag::ResolveInheritance) {
            for parent in self.ranked_parents(holder.id(), &parents) {
                if walk.path.contains(&parent.id().to_string()) {
                    self.observer.cycle_detected(holder.id(), parent.id());
                    continue;
                }
                self.visit(&parent, depth + 1, walk);
            }
        }

        walk.path.pop();
    }

    fn ranked_parents(&self, child: &str, inheritance: &[Node]) -> Vec<Arc<Holder>> {
        let mut seen = HashSet::new();
        let mut parents = Vec::new();
        for group in inheritance.iter().filter_map(Node::inherited_group) {
            if !seen.insert(group) {
                continue;
            }
            match self.lookup.holder(group) {
                Some(parent) => {
                    let weight = self.ranking.weight(group).unwrap_or(0);
                    parents.push((weight, parent));
                }
                None => self.observer.missing_ancestor(child, group),
            }
        }
        parents.sort_by_key(|(weight, _)| std::cmp::Reverse(*weight));
        parents.into_iter().map(|(_, parent)| parent).collect()
    }
}

/// Stable-sorts `entries` by `precedence`, then keeps the first node per
/// (kind, key, context). The kept node is therefore always the one with the
/// highest precedence.
#[must_use]
pub fn distinct(mut entries: Vec<InheritedNode>, precedence: Precedence) -> Vec<InheritedNode> {
    match precedence {
        Precedence::OwnFirst => {
            entries.sort_by_key(|entry| (entry.depth, std::cmp::Reverse(entry.node.specificity())));
        }
        Precedence::SpecificityFirst => {
            entries.sort_by_key(|entry| (std::cmp::Reverse(entry.node.specificity()), entry.depth));
        }
    }
    let mut seen = HashSet::new();
    entries.retain(|entry| {
        seen.insert((entry.node.kind(), entry.node.key(), entry.node.context().clone()))
    });
    entries
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::arena::HolderArena;
    use crate::context::ContextSet;
    use crate::node::NodeBuilder;
    use crate::policy::PartitionOrder;

    fn build(builder: NodeBuilder) -> Node {
        match builder.build() {
            Ok(node) => node,
            Err(err) => panic!("fixture node failed to build: {err}"),
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: parking_lot::Mutex<Vec<String>>,
    }

    impl ResolutionObserver for RecordingObserver {
        fn missing_ancestor(&self, holder: &str, ancestor: &str) {
            self.events.lock().push(format!("missing {holder}->{ancestor}"));
        }

        fn cycle_detected(&self, holder: &str, ancestor: &str) {
            self.events.lock().push(format!("cycle {holder}->{ancestor}"));
        }
    }

    fn arena_with(ids: &[&str]) -> HolderArena {
        let arena = HolderArena::new();
        for id in ids {
            arena.insert(Arc::new(Holder::new(id)));
        }
        arena
    }

    fn holder(arena: &HolderArena, id: &str) -> Arc<Holder> {
        match arena.get(id) {
            Some(holder) => holder,
            None => panic!("fixture holder {id} missing"),
        }
    }

    fn keys(entries: &[InheritedNode]) -> Vec<String> {
        entries.iter().map(|entry| format!("{}@{}", entry.node().key(), entry.origin())).collect()
    }

    #[test]
    fn own_node_outranks_more_specific_inherited_node() {
        let arena = arena_with(&["u", "g"]);
        let nether = ContextSet::of("world", "nether");
        holder(&arena, "u").enduring().add_node(build(Node::permission("perm.fly")));
        holder(&arena, "u").enduring().add_node(build(Node::inheritance("g")));
        holder(&arena, "g")
            .enduring()
            .add_node(build(Node::permission("perm.fly").value(false).context(nether.clone())));

        let policy = ResolutionPolicy::default();
        let observer = RecordingObserver::default();
        let resolver = InheritanceResolver::new(&arena, &arena, &observer, &policy);
        let options = QueryOptions::new(nether);

        let distinct = resolver.resolve_distinct_inherited_nodes(&holder(&arena, "u"), &options);
        let first_fly = distinct.iter().find(|entry| entry.node().matches_permission("perm.fly"));
        assert_eq!(first_fly.map(|entry| entry.node().value()), Some(true));

        let specific = ResolutionPolicy { precedence: Precedence::SpecificityFirst, ..ResolutionPolicy::default() };
        let resolver = InheritanceResolver::new(&arena, &arena, &observer, &specific);
        let distinct = resolver.resolve_distinct_inherited_nodes(&holder(&arena, "u"), &options);
        let first_fly = distinct.iter().find(|entry| entry.node().matches_permission("perm.fly"));
        assert_eq!(first_fly.map(|entry| entry.node().value()), Some(false));
    }

    #[test]
    fn cycle_terminates_and_each_holder_contributes_once() {
        let arena = arena_with(&["a", "b"]);
        holder(&arena, "a").enduring().add_node(build(Node::permission("from.a")));
        holder(&arena, "a").enduring().add_node(build(Node::inheritance("b")));
        holder(&arena, "b").enduring().add_node(build(Node::permission("from.b")));
        holder(&arena, "b").enduring().add_node(build(Node::inheritance("a")));

        let policy = ResolutionPolicy::default();
        let observer = RecordingObserver::default();
        let resolver = InheritanceResolver::new(&arena, &arena, &observer, &policy);
        let resolved = resolver.resolve_inherited_nodes(&holder(&arena, "a"), &QueryOptions::global());

        assert_eq!(keys(&resolved), vec!["from.a@a", "group.b@a", "from.b@b", "group.a@b"]);
        assert_eq!(*observer.events.lock(), vec!["cycle b->a".to_string()]);
    }

    #[test]
    fn parents_are_visited_by_weight_then_insertion_order() {
        let arena = arena_with(&["u", "low", "high", "tied"]);
        let u = holder(&arena, "u");
        u.enduring().add_node(build(Node::inheritance("low")));
        u.enduring().add_node(build(Node::inheritance("tied")));
        u.enduring().add_node(build(Node::inheritance("high")));
        holder(&arena, "high").enduring().add_node(build(Node::meta("weight", "100")));
        for id in ["low", "high", "tied"] {
            holder(&arena, id).enduring().add_node(build(Node::permission(&format!("from.{id}"))));
        }

        let policy = ResolutionPolicy::default();
        let resolver = InheritanceResolver::new(&arena, &arena, &TracingObserver, &policy);
        let origins = resolver
            .resolve_inherited_nodes(&u, &QueryOptions::global())
            .into_iter()
            .filter(|entry| entry.depth() == 1 && entry.node().kind() == NodeKind::Permission)
            .map(|entry| entry.origin().to_string())
            .collect::<Vec<_>>();
        assert_eq!(origins, vec!["high", "low", "tied"]);
    }

    #[test]
    fn missing_ancestor_contributes_nothing() {
        let arena = arena_with(&["u"]);
        holder(&arena, "u").enduring().add_node(build(Node::inheritance("ghost")));
        holder(&arena, "u").enduring().add_node(build(Node::permission("perm.own")));

        let policy = ResolutionPolicy::default();
        let observer = RecordingObserver::default();
        let resolver = InheritanceResolver::new(&arena, &arena, &observer, &policy);
        let resolved = resolver.resolve_inherited_nodes(&holder(&arena, "u"), &QueryOptions::global());

        assert_eq!(keys(&resolved), vec!["perm.own@u", "group.ghost@u"]);
        assert_eq!(*observer.events.lock(), vec!["missing u->ghost".to_string()]);
    }

    #[test]
    fn inheritance_flag_and_partition_order_are_honoured() {
        let arena = arena_with(&["u", "g"]);
        let u = holder(&arena, "u");
        u.enduring().add_node(build(Node::inheritance("g")));
        u.transient().add_node(build(Node::permission("session.perm")));
        holder(&arena, "g").enduring().add_node(build(Node::permission("group.perm")));

        let policy = ResolutionPolicy { partition_order: PartitionOrder::EnduringFirst, ..ResolutionPolicy::default() };
        let resolver = InheritanceResolver::new(&arena, &arena, &TracingObserver, &policy);

        let flat = QueryOptions::global().without_flag(QueryFlag::ResolveInheritance);
        assert_eq!(keys(&resolver.resolve_inherited_nodes(&u, &flat)), vec!["session.perm@u", "group.g@u"]);

        let full = QueryOptions::global();
        assert_eq!(
            keys(&resolver.resolve_inherited_nodes(&u, &full)),
            vec!["session.perm@u", "group.g@u", "group.perm@g"]
        );
    }

    #[test]
    fn inherits_node_reports_resolved_value() {
        let arena = arena_with(&["u", "g"]);
        holder(&arena, "u").enduring().add_node(build(Node::inheritance("g")));
        holder(&arena, "g").enduring().add_node(build(Node::permission("perm.build").value(false)));

        let policy = ResolutionPolicy::default();
        let resolver = InheritanceResolver::new(&arena, &arena, &TracingObserver, &policy);
        let u = holder(&arena, "u");
        let options = QueryOptions::global();

        let candidate = build(Node::permission("perm.build"));
        assert_eq!(resolver.inherits_node(&u, &candidate, NodeEquality::IgnoreValue, &options), Tristate::False);
        assert_eq!(resolver.inherits_node(&u, &candidate, NodeEquality::Exact, &options), Tristate::Undefined);
        let group = build(Node::inheritance("g"));
        assert_eq!(resolver.inherits_node(&u, &group, NodeEquality::Exact, &options), Tristate::True);
    }

    fn arbitrary_entry() -> impl Strategy<Value = InheritedNode> {
        (0..4usize, 0..3usize, any::<bool>(), 0..3usize).prop_map(|(key, ctx, value, depth)| {
            let context = if ctx == 0 {
                ContextSet::empty()
            } else {
                ContextSet::builder().add("world", "nether").add_all("server", (1..ctx).map(|_| "lobby")).build()
            };
            let node = build(Node::permission(&format!("perm.{key}")).value(value).context(context));
            InheritedNode::new(node, &format!("h{depth}"), depth)
        })
    }

    proptest! {
        #[test]
        fn property_distinct_keeps_one_highest_precedence_node_per_key(
            entries in proptest::collection::vec(arbitrary_entry(), 0..24)
        ) {
            let result = distinct(entries.clone(), Precedence::OwnFirst);
            let mut identities = HashSet::new();
            for kept in &result {
                let identity = (kept.node().key(), kept.node().context().clone());
                prop_assert!(identities.insert(identity));
                let best_depth = entries
                    .iter()
                    .filter(|other| other.node().key() == kept.node().key()
                        && other.node().context() == kept.node().context())
                    .map(InheritedNode::depth)
                    .min();
                prop_assert_eq!(Some(kept.depth()), best_depth);
            }
        }

        #[test]
        fn property_cyclic_chains_terminate(len in 1usize..8, back_edge in 0usize..8) {
            let ids = (0..len).map(|index| format!("h{index}")).collect::<Vec<_>>();
            let arena = HolderArena::new();
            for (index, id) in ids.iter().enumerate() {
                let holder = Arc::new(Holder::new(id));
                holder.enduring().add_node(build(Node::permission(&format!("own.{id}"))));
                let parent = ids.get(index + 1).unwrap_or(&ids[back_edge % len]);
                holder.enduring().add_node(build(Node::inheritance(parent)));
                arena.insert(holder);
            }
            let policy = ResolutionPolicy::default();
            let resolver = InheritanceResolver::new(&arena, &arena, &TracingObserver, &policy);
            let resolved = resolver.resolve_inherited_nodes(&holder(&arena, "h0"), &QueryOptions::global());
            let own = resolved.iter().filter(|entry| entry.node().key().starts_with("own.")).count();
            prop_assert_eq!(own, len);
        }
    }
}
