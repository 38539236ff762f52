use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

type ContextEntries = BTreeMap<String, BTreeSet<String>>;

/// Immutable set of situational constraints, keyed by context key.
///
/// Each key maps to a non-empty set of acceptable values. Keys and values are
/// trimmed and lower-cased on insertion; blank keys or values are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "ContextEntries", into = "ContextEntries")]
pub struct ContextSet {
    entries: ContextEntries,
}

impl ContextSet {
    /// The universal set: satisfied by every query.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> ContextSetBuilder {
        ContextSetBuilder::default()
    }

    #[must_use]
    pub fn of(key: &str, value: &str) -> Self {
        Self::builder().add(key, value).build()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct keys this set constrains.
    #[must_use]
    pub fn specificity(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when `query` has at least one matching value for every key
    /// constrained by `self` (AND across keys, OR across values).
    #[must_use]
    pub fn is_satisfied_by(&self, query: &ContextSet) -> bool {
        self.entries.iter().all(|(key, accepted)| {
            query.entries.get(key).is_some_and(|offered| !accepted.is_disjoint(offered))
        })
    }

    #[must_use]
    pub fn values(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.entries.get(&normalize(key))
    }

    #[must_use]
    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.values(key).is_some_and(|values| values.contains(&normalize(value)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.entries.iter().map(|(key, values)| (key.as_str(), values))
    }
}

impl From<ContextEntries> for ContextSet {
    fn from(entries: ContextEntries) -> Self {
        let mut builder = ContextSetBuilder::default();
        for (key, values) in entries {
            for value in values {
                builder = builder.add(&key, &value);
            }
        }
        builder.build()
    }
}

impl From<ContextSet> for ContextEntries {
    fn from(set: ContextSet) -> Self {
        set.entries
    }
}

impl Display for ContextSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.entries.is_empty() {
            return write!(f, "(global)");
        }
        let rendered = self
            .entries
            .iter()
            .map(|(key, values)| {
                let joined = values.iter().map(String::as_str).collect::<Vec<_>>().join("|");
                format!("{key}={joined}")
            })
            .collect::<Vec<_>>();
        write!(f, "{}", rendered.join(", "))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextSetBuilder {
    entries: ContextEntries,
}

impl ContextSetBuilder {
    #[must_use]
    pub fn add(mut self, key: &str, value: &str) -> Self {
        let key = normalize(key);
        let value = normalize(value);
        if !key.is_empty() && !value.is_empty() {
            self.entries.entry(key).or_default().insert(value);
        }
        self
    }

    #[must_use]
    pub fn add_all<'a>(mut self, key: &str, values: impl IntoIterator<Item = &'a str>) -> Self {
        for value in values {
            self = self.add(key, value);
        }
        self
    }

    #[must_use]
    pub fn build(self) -> ContextSet {
        ContextSet { entries: self.entries }
    }
}

fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Resolution flags carried alongside a query context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryFlag {
    /// Include the holder's transient (session-scoped) partition.
    IncludeTransient,
    /// Follow inheritance nodes into other holders.
    ResolveInheritance,
    /// Within one holder, order expiring grants ahead of permanent grants of the same key.
    PreferTemporary,
}

/// A query context plus resolution flags; used verbatim as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryOptions {
    context: ContextSet,
    flags: BTreeSet<QueryFlag>,
}

impl QueryOptions {
    #[must_use]
    pub fn new(context: ContextSet) -> Self {
        Self {
            context,
            flags: [QueryFlag::IncludeTransient, QueryFlag::ResolveInheritance].into_iter().collect(),
        }
    }

    #[must_use]
    pub fn global() -> Self {
        Self::new(ContextSet::empty())
    }

    #[must_use]
    pub fn with_flag(mut self, flag: QueryFlag) -> Self {
        self.flags.insert(flag);
        self
    }

    #[must_use]
    pub fn without_flag(mut self, flag: QueryFlag) -> Self {
        self.flags.remove(&flag);
        self
    }

    #[must_use]
    pub fn has_flag(&self, flag: QueryFlag) -> bool {
        self.flags.contains(&flag)
    }

    #[must_use]
    pub fn context(&self) -> &ContextSet {
        &self.context
    }

    pub fn flags(&self) -> impl Iterator<Item = QueryFlag> + '_ {
        self.flags.iter().copied()
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::global()
    }
}
