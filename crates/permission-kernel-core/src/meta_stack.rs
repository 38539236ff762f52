use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::node::NodeKind;
use crate::resolver::InheritedNode;

const FROM_HOLDER: &str = "from_holder_";
const NOT_FROM_HOLDER: &str = "not_from_holder_";

/// One rule of a meta stack. Each element selects chat nodes by origin and
/// contributes a single fragment to the stacked value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetaStackElement {
    Highest,
    Lowest,
    HighestOwn,
    LowestOwn,
    HighestInherited,
    LowestInherited,
    HighestFromHolder(String),
    LowestFromHolder(String),
    HighestNotFromHolder(String),
    /// Every matching value, highest priority first.
    All,
}

impl MetaStackElement {
    fn accepts(&self, entry: &InheritedNode) -> bool {
        match self {
            Self::Highest | Self::Lowest | Self::All => true,
            Self::HighestOwn | Self::LowestOwn => entry.depth() == 0,
            Self::HighestInherited | Self::LowestInherited => entry.depth() > 0,
            Self::HighestFromHolder(holder) | Self::LowestFromHolder(holder) => entry.origin() == holder,
            Self::HighestNotFromHolder(holder) => entry.origin() != holder,
        }
    }

    fn prefers_lowest(&self) -> bool {
        matches!(self, Self::Lowest | Self::LowestOwn | Self::LowestInherited | Self::LowestFromHolder(_))
    }

    fn fragment(&self, kind: NodeKind, entries: &[InheritedNode], spacer: &str) -> String {
        let mut candidates = entries
            .iter()
            .filter(|entry| entry.node().kind() == kind && self.accepts(entry))
            .filter_map(|entry| entry.node().chat_entry());

        if *self == Self::All {
            let mut all = candidates.collect::<Vec<_>>();
            all.sort_by_key(|(priority, _)| std::cmp::Reverse(*priority));
            return all.into_iter().map(|(_, value)| value).collect::<Vec<_>>().join(spacer);
        }

        // Strict comparison keeps the earliest entry on ties; the input is already precedence-sorted.
        let Some(mut chosen) = candidates.next() else {
            return String::new();
        };
        let lowest = self.prefers_lowest();
        for candidate in candidates {
            let better = if lowest { candidate.0 < chosen.0 } else { candidate.0 > chosen.0 };
            if better {
                chosen = candidate;
            }
        }
        chosen.1.to_string()
    }
}

impl FromStr for MetaStackElement {
    type Err = KernelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let name = raw.trim().to_lowercase();
        let element = match name.as_str() {
            "highest" => Self::Highest,
            "lowest" => Self::Lowest,
            "highest_own" => Self::HighestOwn,
            "lowest_own" => Self::LowestOwn,
            "highest_inherited" => Self::HighestInherited,
            "lowest_inherited" => Self::LowestInherited,
            "all" => Self::All,
            other => {
                let holder_scoped = other
                    .strip_prefix("highest_")
                    .map(|rest| (true, rest))
                    .or_else(|| other.strip_prefix("lowest_").map(|rest| (false, rest)));
                match holder_scoped {
                    Some((true, rest)) if rest.starts_with(NOT_FROM_HOLDER) => {
                        Self::HighestNotFromHolder(holder_id(rest, NOT_FROM_HOLDER, raw)?)
                    }
                    Some((true, rest)) if rest.starts_with(FROM_HOLDER) => {
                        Self::HighestFromHolder(holder_id(rest, FROM_HOLDER, raw)?)
                    }
                    Some((false, rest)) if rest.starts_with(FROM_HOLDER) => {
                        Self::LowestFromHolder(holder_id(rest, FROM_HOLDER, raw)?)
                    }
                    _ => return Err(KernelError::invalid(format!("unknown meta stack element `{raw}`"))),
                }
            }
        };
        Ok(element)
    }
}

fn holder_id(rest: &str, marker: &str, raw: &str) -> Result<String, KernelError> {
    let id = rest.strip_prefix(marker).unwrap_or_default();
    if id.is_empty() {
        return Err(KernelError::invalid(format!("meta stack element `{raw}` names no holder")));
    }
    Ok(id.to_string())
}

impl Display for MetaStackElement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Highest => write!(f, "highest"),
            Self::Lowest => write!(f, "lowest"),
            Self::HighestOwn => write!(f, "highest_own"),
            Self::LowestOwn => write!(f, "lowest_own"),
            Self::HighestInherited => write!(f, "highest_inherited"),
            Self::LowestInherited => write!(f, "lowest_inherited"),
            Self::HighestFromHolder(holder) => write!(f, "highest_{FROM_HOLDER}{holder}"),
            Self::LowestFromHolder(holder) => write!(f, "lowest_{FROM_HOLDER}{holder}"),
            Self::HighestNotFromHolder(holder) => write!(f, "highest_{NOT_FROM_HOLDER}{holder}"),
            Self::All => write!(f, "all"),
        }
    }
}

impl TryFrom<String> for MetaStackElement {
    type Error = KernelError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<MetaStackElement> for String {
    fn from(element: MetaStackElement) -> Self {
        element.to_string()
    }
}

/// Ordered combination rules that stack several prefix or suffix contributions
/// into one string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetaStackDefinition {
    #[serde(default = "default_elements")]
    elements: Vec<MetaStackElement>,
    #[serde(default)]
    start_spacer: String,
    #[serde(default)]
    middle_spacer: String,
    #[serde(default)]
    end_spacer: String,
}

fn default_elements() -> Vec<MetaStackElement> {
    vec![MetaStackElement::Highest]
}

impl Default for MetaStackDefinition {
    fn default() -> Self {
        Self::new(default_elements())
    }
}

impl MetaStackDefinition {
    #[must_use]
    pub fn new(elements: Vec<MetaStackElement>) -> Self {
        Self {
            elements,
            start_spacer: String::new(),
            middle_spacer: String::new(),
            end_spacer: String::new(),
        }
    }

    #[must_use]
    pub fn with_spacers(mut self, start: &str, middle: &str, end: &str) -> Self {
        start.clone_into(&mut self.start_spacer);
        middle.clone_into(&mut self.middle_spacer);
        end.clone_into(&mut self.end_spacer);
        self
    }

    #[must_use]
    pub fn elements(&self) -> &[MetaStackElement] {
        &self.elements
    }

    /// Stacks the `kind` (prefix or suffix) nodes found in `entries`.
    ///
    /// Returns `None` when every element contributed an empty fragment.
    #[must_use]
    pub fn evaluate(&self, kind: NodeKind, entries: &[InheritedNode]) -> Option<String> {
        let fragments = self
            .elements
            .iter()
            .map(|element| element.fragment(kind, entries, &self.middle_spacer))
            .filter(|fragment| !fragment.is_empty())
            .collect::<Vec<_>>();
        if fragments.is_empty() {
            return None;
        }
        Some(format!("{}{}{}", self.start_spacer, fragments.join(&self.middle_spacer), self.end_spacer))
    }
}
