use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::QueryOptions;
use crate::node::{NodeKind, Tristate};
use crate::policy::ResolutionPolicy;
use crate::resolver::InheritedNode;

/// Platform-wide default grants consulted when no resolved node answers a check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultGrants {
    grants: HashMap<String, bool>,
}

impl DefaultGrants {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, permission: &str, value: bool) -> Self {
        self.grants.insert(permission.trim().to_lowercase(), value);
        self
    }

    #[must_use]
    pub fn lookup(&self, permission: &str) -> Tristate {
        self.grants.get(permission).map_or(Tristate::Undefined, |value| Tristate::from(*value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

/// Supplies the default grants applied on top of resolved permission data.
pub trait DefaultOverlay: Send + Sync {
    fn defaults(&self, options: &QueryOptions) -> DefaultGrants;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoDefaults;

impl DefaultOverlay for NoDefaults {
    fn defaults(&self, _options: &QueryOptions) -> DefaultGrants {
        DefaultGrants::new()
    }
}

/// Overlay whose grants can be swapped at runtime; cached views only observe a
/// swap after their calculators are invalidated.
#[derive(Debug, Default)]
pub struct StaticDefaults {
    grants: RwLock<DefaultGrants>,
}

impl StaticDefaults {
    #[must_use]
    pub fn new(grants: DefaultGrants) -> Self {
        Self { grants: RwLock::new(grants) }
    }

    pub fn set(&self, grants: DefaultGrants) {
        *self.grants.write() = grants;
    }
}

impl DefaultOverlay for StaticDefaults {
    fn defaults(&self, _options: &QueryOptions) -> DefaultGrants {
        self.grants.read().clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckSource {
    Node(InheritedNode),
    Defaults,
    Unanswered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionCheck {
    pub result: Tristate,
    pub source: CheckSource,
}

/// Flattened permission lookup table built from a distinct resolved sequence.
pub struct PermissionData {
    options: QueryOptions,
    nodes: Vec<InheritedNode>,
    exact: HashMap<String, usize>,
    patterns: Vec<usize>,
    overlay: Arc<dyn DefaultOverlay>,
    defaults: RwLock<Arc<DefaultGrants>>,
}

impl fmt::Debug for PermissionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionData")
            .field("options", &self.options)
            .field("nodes", &self.nodes.len())
            .field("defaults", &self.defaults.read().len())
            .finish_non_exhaustive()
    }
}

impl PermissionData {
    /// `distinct` must already be deduplicated and sorted by precedence.
    #[must_use]
    pub fn new(options: QueryOptions, distinct: &[InheritedNode], overlay: Arc<dyn DefaultOverlay>) -> Self {
        let nodes = distinct
            .iter()
            .filter(|entry| matches!(entry.node().kind(), NodeKind::Permission | NodeKind::Inheritance))
            .cloned()
            .collect::<Vec<_>>();

        let mut exact = HashMap::new();
        let mut patterns = Vec::new();
        for (index, entry) in nodes.iter().enumerate() {
            if entry.node().is_exact_permission() {
                exact.entry(entry.node().key()).or_insert(index);
            } else {
                patterns.push(index);
            }
        }

        let defaults = RwLock::new(Arc::new(overlay.defaults(&options)));
        Self { options, nodes, exact, patterns, overlay, defaults }
    }

    #[must_use]
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    #[must_use]
    pub fn nodes(&self) -> &[InheritedNode] {
        &self.nodes
    }

    #[must_use]
    pub fn check_permission(&self, permission: &str) -> Tristate {
        self.check_permission_verbose(permission).result
    }

    /// Answers `permission` and reports which node (or the default overlay) decided it.
    #[must_use]
    pub fn check_permission_verbose(&self, permission: &str) -> PermissionCheck {
        let permission = permission.trim().to_lowercase();
        let exact = self.exact.get(&permission).copied();
        let pattern = self
            .patterns
            .iter()
            .copied()
            .take_while(|index| exact.map_or(true, |exact| *index < exact))
            .find(|index| self.nodes[*index].node().matches_permission(&permission));

        if let Some(index) = pattern.or(exact) {
            let entry = &self.nodes[index];
            return PermissionCheck {
                result: Tristate::from(entry.node().value()),
                source: CheckSource::Node(entry.clone()),
            };
        }

        match self.defaults.read().lookup(&permission) {
            Tristate::Undefined => PermissionCheck { result: Tristate::Undefined, source: CheckSource::Unanswered },
            result => PermissionCheck { result, source: CheckSource::Defaults },
        }
    }

    /// First-wins map from node key to value, including `group.<name>` entries.
    #[must_use]
    pub fn permission_map(&self) -> BTreeMap<String, bool> {
        let mut map = BTreeMap::new();
        for entry in &self.nodes {
            map.entry(entry.node().key()).or_insert_with(|| entry.node().value());
        }
        map
    }

    /// Re-reads the default overlay without touching the resolved nodes.
    pub fn invalidate_calculator(&self) {
        let refreshed = Arc::new(self.overlay.defaults(&self.options));
        *self.defaults.write() = refreshed;
    }
}

/// Resolved metadata: one value list per meta key plus stacked prefix and suffix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaData {
    meta: BTreeMap<String, Vec<String>>,
    prefix: Option<String>,
    suffix: Option<String>,
    prefixes: Vec<(i32, String)>,
    suffixes: Vec<(i32, String)>,
}

impl MetaData {
    #[must_use]
    pub fn from_resolved(distinct: &[InheritedNode], policy: &ResolutionPolicy) -> Self {
        let mut meta: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut prefixes = Vec::new();
        let mut suffixes = Vec::new();
        for entry in distinct {
            let node = entry.node();
            if let Some((key, value)) = node.meta_entry() {
                meta.entry(key.to_string()).or_default().push(value.to_string());
            }
            match (node.kind(), node.chat_entry()) {
                (NodeKind::Prefix, Some((priority, value))) => prefixes.push((priority, value.to_string())),
                (NodeKind::Suffix, Some((priority, value))) => suffixes.push((priority, value.to_string())),
                _ => {}
            }
        }
        prefixes.sort_by_key(|(priority, _)| std::cmp::Reverse(*priority));
        suffixes.sort_by_key(|(priority, _)| std::cmp::Reverse(*priority));

        Self {
            meta,
            prefix: policy.prefix_stack.evaluate(NodeKind::Prefix, distinct),
            suffix: policy.suffix_stack.evaluate(NodeKind::Suffix, distinct),
            prefixes,
            suffixes,
        }
    }

    /// Authoritative value for `key`: the first one in precedence order.
    #[must_use]
    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta.get(&key.trim().to_lowercase()).and_then(|values| values.first()).map(String::as_str)
    }

    #[must_use]
    pub fn meta_values(&self, key: &str) -> &[String] {
        self.meta.get(&key.trim().to_lowercase()).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn meta_keys(&self) -> Vec<&str> {
        self.meta.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    #[must_use]
    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    #[must_use]
    pub fn prefixes(&self) -> &[(i32, String)] {
        &self.prefixes
    }

    #[must_use]
    pub fn suffixes(&self) -> &[(i32, String)] {
        &self.suffixes
    }
}
