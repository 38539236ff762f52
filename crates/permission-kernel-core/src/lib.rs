//! Node model, holder store, and inheritance resolution for the permission kernel.

mod arena;
mod context;
mod data;
mod error;
mod holder;
mod meta_stack;
mod node;
mod policy;
mod resolver;
mod view;

pub use arena::HolderArena;
pub use context::{ContextSet, ContextSetBuilder, QueryFlag, QueryOptions};
pub use data::{DataType, MutateOutcome, NodeMap, TemporaryMergeBehaviour, TemporaryMutateResult};
pub use error::KernelError;
pub use holder::{Holder, HolderData, MutationListener};
pub use meta_stack::{MetaStackDefinition, MetaStackElement};
pub use node::{MetaType, Node, NodeBuilder, NodeEquality, NodeKind, NodeType, Tristate};
pub use policy::{PartitionOrder, Precedence, ResolutionPolicy};
pub use resolver::{
    distinct, GroupRanking, HolderLookup, InheritanceResolver, InheritedNode, ResolutionObserver,
    TracingObserver,
};
pub use view::{
    CheckSource, DefaultGrants, DefaultOverlay, MetaData, NoDefaults, PermissionCheck, PermissionData,
    StaticDefaults,
};
