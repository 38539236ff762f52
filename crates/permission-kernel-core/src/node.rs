use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::context::ContextSet;
use crate::error::KernelError;

const REGEX_PREFIX: &str = "r=";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Permission,
    Meta,
    Prefix,
    Suffix,
    Inheritance,
}

impl NodeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Permission => "permission",
            Self::Meta => "meta",
            Self::Prefix => "prefix",
            Self::Suffix => "suffix",
            Self::Inheritance => "inheritance",
        }
    }
}

/// Kind discriminant plus payload of a grant.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeType {
    Permission { permission: String, value: bool },
    Meta { key: String, value: String },
    Prefix { priority: i32, value: String },
    Suffix { priority: i32, value: String },
    Inheritance { group: String },
}

impl NodeType {
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Permission { .. } => NodeKind::Permission,
            Self::Meta { .. } => NodeKind::Meta,
            Self::Prefix { .. } => NodeKind::Prefix,
            Self::Suffix { .. } => NodeKind::Suffix,
            Self::Inheritance { .. } => NodeKind::Inheritance,
        }
    }
}

/// Three-valued permission answer. `Undefined` means "fall through to the default".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tristate {
    True,
    False,
    Undefined,
}

impl Tristate {
    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::True => Some(true),
            Self::False => Some(false),
            Self::Undefined => None,
        }
    }

    /// Collapses `Undefined` into `fallback`.
    #[must_use]
    pub fn unwrap_or(self, fallback: bool) -> bool {
        self.as_bool().unwrap_or(fallback)
    }
}

impl From<bool> for Tristate {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

/// How two nodes are compared when looking one up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeEquality {
    Exact,
    IgnoreValue,
    IgnoreExpiry,
    IgnoreValueAndExpiry,
}

impl NodeEquality {
    #[must_use]
    pub fn matches(self, lhs: &Node, rhs: &Node) -> bool {
        if lhs.context != rhs.context {
            return false;
        }
        let same_value = lhs.node_type == rhs.node_type;
        let same_key = lhs.kind() == rhs.kind() && lhs.key() == rhs.key();
        let same_expiry = lhs.expiry == rhs.expiry;
        match self {
            Self::Exact => same_value && same_expiry,
            Self::IgnoreValue => same_key && same_expiry,
            Self::IgnoreExpiry => same_value,
            Self::IgnoreValueAndExpiry => same_key,
        }
    }
}

/// Metadata node categories used by clearing operations and meta filters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetaType {
    Any,
    Chat,
    Meta,
    Prefix,
    Suffix,
}

impl MetaType {
    #[must_use]
    pub fn matches(self, node: &Node) -> bool {
        match (self, node.kind()) {
            (Self::Any, NodeKind::Meta | NodeKind::Prefix | NodeKind::Suffix)
            | (Self::Chat, NodeKind::Prefix | NodeKind::Suffix)
            | (Self::Meta, NodeKind::Meta)
            | (Self::Prefix, NodeKind::Prefix)
            | (Self::Suffix, NodeKind::Suffix) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
enum PermissionMatcher {
    Exact,
    Universal,
    Wildcard(String),
    Regex(Arc<regex_lite::Regex>),
}

impl PermissionMatcher {
    fn compile(permission: &str) -> Result<Self, KernelError> {
        if let Some(pattern) = permission.strip_prefix(REGEX_PREFIX) {
            let anchored = format!("^(?i:{pattern})$");
            let regex = regex_lite::Regex::new(&anchored).map_err(|err| {
                KernelError::invalid(format!("invalid permission regex `{pattern}`: {err}"))
            })?;
            return Ok(Self::Regex(Arc::new(regex)));
        }
        if permission == "*" {
            return Ok(Self::Universal);
        }
        if let Some(stem) = permission.strip_suffix('*') {
            if stem.ends_with('.') {
                return Ok(Self::Wildcard(stem.to_string()));
            }
        }
        Ok(Self::Exact)
    }
}

/// One immutable grant scoped by a context set and an optional expiry.
///
/// Equality and hashing consider the payload, context, and expiry; compiled
/// permission matchers are derived state and never compared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "NodeRecord", into = "NodeRecord")]
pub struct Node {
    node_type: NodeType,
    context: ContextSet,
    expiry: Option<OffsetDateTime>,
    matcher: Option<PermissionMatcher>,
}

impl Node {
    #[must_use]
    pub fn permission(permission: &str) -> NodeBuilder {
        NodeBuilder::new(NodeType::Permission { permission: permission.to_string(), value: true })
    }

    #[must_use]
    pub fn meta(key: &str, value: &str) -> NodeBuilder {
        NodeBuilder::new(NodeType::Meta { key: key.to_string(), value: value.to_string() })
    }

    #[must_use]
    pub fn prefix(priority: i32, value: &str) -> NodeBuilder {
        NodeBuilder::new(NodeType::Prefix { priority, value: value.to_string() })
    }

    #[must_use]
    pub fn suffix(priority: i32, value: &str) -> NodeBuilder {
        NodeBuilder::new(NodeType::Suffix { priority, value: value.to_string() })
    }

    #[must_use]
    pub fn inheritance(group: &str) -> NodeBuilder {
        NodeBuilder::new(NodeType::Inheritance { group: group.to_string() })
    }

    /// Starts a builder pre-populated from this node.
    #[must_use]
    pub fn to_builder(&self) -> NodeBuilder {
        NodeBuilder {
            node_type: self.node_type.clone(),
            context: self.context.clone(),
            expiry: self.expiry,
        }
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.node_type.kind()
    }

    #[must_use]
    pub fn node_type(&self) -> &NodeType {
        &self.node_type
    }

    /// Identity key used for deduplication, ignoring the node's value.
    ///
    /// Prefix and suffix keys embed priority and value, so several chat nodes can
    /// coexist in one context; a meta key names only the meta key.
    #[must_use]
    pub fn key(&self) -> String {
        match &self.node_type {
            NodeType::Permission { permission, .. } => permission.clone(),
            NodeType::Meta { key, .. } => format!("meta.{key}"),
            NodeType::Prefix { priority, value } => format!("prefix.{priority}.{value}"),
            NodeType::Suffix { priority, value } => format!("suffix.{priority}.{value}"),
            NodeType::Inheritance { group } => format!("group.{group}"),
        }
    }

    /// Boolean value of the grant; only permission nodes can be negated.
    #[must_use]
    pub fn value(&self) -> bool {
        match &self.node_type {
            NodeType::Permission { value, .. } => *value,
            _ => true,
        }
    }

    #[must_use]
    pub fn context(&self) -> &ContextSet {
        &self.context
    }

    #[must_use]
    pub fn specificity(&self) -> usize {
        self.context.specificity()
    }

    #[must_use]
    pub fn expiry(&self) -> Option<OffsetDateTime> {
        self.expiry
    }

    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.expiry.is_some()
    }

    #[must_use]
    pub fn has_expired(&self, now: OffsetDateTime) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }

    #[must_use]
    pub fn inherited_group(&self) -> Option<&str> {
        match &self.node_type {
            NodeType::Inheritance { group } => Some(group),
            _ => None,
        }
    }

    #[must_use]
    pub fn meta_entry(&self) -> Option<(&str, &str)> {
        match &self.node_type {
            NodeType::Meta { key, value } => Some((key, value)),
            _ => None,
        }
    }

    /// Priority and value of a prefix or suffix node.
    #[must_use]
    pub fn chat_entry(&self) -> Option<(i32, &str)> {
        match &self.node_type {
            NodeType::Prefix { priority, value } | NodeType::Suffix { priority, value } => {
                Some((*priority, value))
            }
            _ => None,
        }
    }

    /// True when a permission check for `permission` is answered by this node.
    ///
    /// `permission` must already be lower-cased. Inheritance nodes answer for
    /// `group.<name>`; other non-permission kinds never match.
    #[must_use]
    pub fn matches_permission(&self, permission: &str) -> bool {
        match &self.node_type {
            NodeType::Permission { permission: key, .. } => match &self.matcher {
                Some(PermissionMatcher::Universal) => true,
                Some(PermissionMatcher::Wildcard(stem)) => permission.starts_with(stem.as_str()),
                Some(PermissionMatcher::Regex(regex)) => regex.is_match(permission),
                Some(PermissionMatcher::Exact) | None => key == permission,
            },
            NodeType::Inheritance { .. } => self.key() == permission,
            _ => false,
        }
    }

    /// True when this node matches only the exact permission string it names.
    #[must_use]
    pub fn is_exact_permission(&self) -> bool {
        match self.kind() {
            NodeKind::Permission => matches!(self.matcher, Some(PermissionMatcher::Exact) | None),
            NodeKind::Inheritance => true,
            _ => false,
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.node_type == other.node_type
            && self.context == other.context
            && self.expiry == other.expiry
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_type.hash(state);
        self.context.hash(state);
        self.expiry.hash(state);
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.node_type {
            NodeType::Permission { permission, value } => write!(f, "{permission}={value}")?,
            NodeType::Meta { key, value } => write!(f, "meta.{key}={value}")?,
            NodeType::Prefix { priority, value } => write!(f, "prefix.{priority}.{value}")?,
            NodeType::Suffix { priority, value } => write!(f, "suffix.{priority}.{value}")?,
            NodeType::Inheritance { group } => write!(f, "group.{group}")?,
        }
        if !self.context.is_empty() {
            write!(f, " [{}]", self.context)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NodeBuilder {
    node_type: NodeType,
    context: ContextSet,
    expiry: Option<OffsetDateTime>,
}

impl NodeBuilder {
    fn new(node_type: NodeType) -> Self {
        Self { node_type, context: ContextSet::empty(), expiry: None }
    }

    /// Sets the value of a permission node. Ignored by other kinds.
    #[must_use]
    pub fn value(mut self, granted: bool) -> Self {
        if let NodeType::Permission { value, .. } = &mut self.node_type {
            *value = granted;
        }
        self
    }

    #[must_use]
    pub fn context(mut self, context: ContextSet) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn expiry(mut self, expiry: OffsetDateTime) -> Self {
        self.expiry = Some(expiry);
        self
    }

    #[must_use]
    pub fn expires_in(self, duration: Duration) -> Self {
        self.expiry(OffsetDateTime::now_utc() + duration)
    }

    #[must_use]
    pub fn permanent(mut self) -> Self {
        self.expiry = None;
        self
    }

    /// Validate and freeze the node.
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidInput`] when a key, group, or chat value is blank,
    /// or when a `r=` permission carries an invalid regular expression.
    pub fn build(self) -> Result<Node, KernelError> {
        let node_type = match self.node_type {
            NodeType::Permission { permission, value } => {
                let permission = normalize_permission(require_non_blank(&permission, "permission")?);
                NodeType::Permission { permission, value }
            }
            NodeType::Meta { key, value } => NodeType::Meta {
                key: require_non_blank(&key, "meta key")?.to_lowercase(),
                value,
            },
            NodeType::Prefix { priority, value } => {
                NodeType::Prefix { priority, value: require_non_blank(&value, "prefix")?.to_string() }
            }
            NodeType::Suffix { priority, value } => {
                NodeType::Suffix { priority, value: require_non_blank(&value, "suffix")?.to_string() }
            }
            NodeType::Inheritance { group } => NodeType::Inheritance {
                group: require_non_blank(&group, "inherited group")?.to_lowercase(),
            },
        };

        let matcher = match &node_type {
            NodeType::Permission { permission, .. } => Some(PermissionMatcher::compile(permission)?),
            _ => None,
        };

        Ok(Node { node_type, context: self.context, expiry: self.expiry, matcher })
    }
}

/// Lower-cases plain permissions. Regex bodies keep their case (`\D` is not `\d`)
/// and are matched case-insensitively instead.
fn normalize_permission(permission: &str) -> String {
    match permission.get(..REGEX_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(REGEX_PREFIX) => {
            format!("{REGEX_PREFIX}{}", &permission[REGEX_PREFIX.len()..])
        }
        _ => permission.to_lowercase(),
    }
}

fn require_non_blank<'a>(raw: &'a str, field: &str) -> Result<&'a str, KernelError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(KernelError::invalid(format!("{field} MUST be non-empty")));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRecord {
    #[serde(flatten)]
    node_type: NodeType,
    #[serde(default, skip_serializing_if = "ContextSet::is_empty")]
    context: ContextSet,
    #[serde(default, with = "time::serde::rfc3339::option")]
    expiry: Option<OffsetDateTime>,
}

impl TryFrom<NodeRecord> for Node {
    type Error = KernelError;

    fn try_from(record: NodeRecord) -> Result<Self, Self::Error> {
        let builder =
            NodeBuilder { node_type: record.node_type, context: record.context, expiry: record.expiry };
        builder.build()
    }
}

impl From<Node> for NodeRecord {
    fn from(node: Node) -> Self {
        Self { node_type: node.node_type, context: node.context, expiry: node.expiry }
    }
}
