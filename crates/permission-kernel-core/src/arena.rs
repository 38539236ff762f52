use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::holder::Holder;
use crate::resolver::{GroupRanking, HolderLookup};

/// Identity-keyed arena of loaded holders. Inheritance edges are identities,
/// never owning references, so holders can point at each other freely.
#[derive(Debug, Default)]
pub struct HolderArena {
    holders: RwLock<HashMap<String, Arc<Holder>>>,
}

impl HolderArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `holder`, returning any holder previously stored under its identity.
    pub fn insert(&self, holder: Arc<Holder>) -> Option<Arc<Holder>> {
        self.holders.write().insert(holder.id().to_string(), holder)
    }

    /// Returns the holder stored under `id`, creating it with `create` under the
    /// same write lock when absent. The flag is true only for the caller whose
    /// holder was stored.
    pub fn get_or_insert_with(&self, id: &str, create: impl FnOnce() -> Arc<Holder>) -> (Arc<Holder>, bool) {
        let mut holders = self.holders.write();
        if let Some(existing) = holders.get(id) {
            return (Arc::clone(existing), false);
        }
        let holder = create();
        holders.insert(id.to_string(), Arc::clone(&holder));
        (holder, true)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Holder>> {
        self.holders.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Holder>> {
        self.holders.write().remove(id)
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids = self.holders.read().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.holders.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holders.read().is_empty()
    }

    /// Loaded holders whose inheritance graph reaches `id` through inheritance
    /// nodes in any context, nearest first. `id` itself is never included.
    #[must_use]
    pub fn dependants(&self, id: &str) -> Vec<String> {
        let holders = self.holders.read().values().cloned().collect::<Vec<_>>();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for holder in &holders {
            for parent in holder.parent_ids() {
                children.entry(parent).or_default().push(holder.id().to_string());
            }
        }

        let mut seen = HashSet::from([id.to_string()]);
        let mut queue = VecDeque::from([id.to_string()]);
        let mut dependants = Vec::new();
        while let Some(current) = queue.pop_front() {
            let Some(direct) = children.get(&current) else {
                continue;
            };
            let mut direct = direct.clone();
            direct.sort();
            for child in direct {
                if seen.insert(child.clone()) {
                    dependants.push(child.clone());
                    queue.push_back(child);
                }
            }
        }
        dependants
    }
}

impl HolderLookup for HolderArena {
    fn holder(&self, id: &str) -> Option<Arc<Holder>> {
        self.get(id)
    }
}

impl GroupRanking for HolderArena {
    fn weight(&self, id: &str) -> Option<i32> {
        self.get(id).map(|holder| holder.weight())
    }
}
