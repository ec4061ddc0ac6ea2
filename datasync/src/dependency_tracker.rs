//! Tracks which items depend on which other items.
//!
//! A flag depends on its prerequisite flags and on every segment named by one
//! of its segment-match clauses. The forward index drives bulk-write
//! ordering; the reverse index answers "what else changes if this item
//! changes".

use crate::kinds::{Collection, DataKind, ItemDescriptor, KeyedItem};
use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindAndKey {
    pub kind: DataKind,
    pub key: String,
}

impl KindAndKey {
    pub fn new<K: Into<String>>(kind: DataKind, key: K) -> Self {
        KindAndKey {
            kind,
            key: key.into(),
        }
    }
}

/// The items `item` depends on. Empty for tombstones and for every kind
/// other than flags.
pub fn compute_dependencies(kind: DataKind, item: &ItemDescriptor) -> HashSet<KindAndKey> {
    let mut deps = HashSet::new();
    if kind != DataKind::Features {
        return deps;
    }
    if let Some(flag) = item.as_flag() {
        for prereq in &flag.prerequisites {
            deps.insert(KindAndKey::new(DataKind::Features, prereq.key.as_str()));
        }
        for segment_key in flag.referenced_segments() {
            deps.insert(KindAndKey::new(DataKind::Segments, segment_key));
        }
    }
    deps
}

#[derive(Debug, Default)]
pub struct DependencyTracker {
    depends_on: HashMap<KindAndKey, HashSet<KindAndKey>>,
    depended_on_by: HashMap<KindAndKey, HashSet<KindAndKey>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every outgoing edge of `(kind, key)` with the edges of `item`.
    pub fn update(&mut self, kind: DataKind, key: &str, item: &ItemDescriptor) {
        let from = KindAndKey::new(kind, key);
        let new_deps = compute_dependencies(kind, item);

        if let Some(old_deps) = self.depends_on.get(&from) {
            for stale in old_deps.difference(&new_deps) {
                if let Some(dependents) = self.depended_on_by.get_mut(stale) {
                    dependents.remove(&from);
                    if dependents.is_empty() {
                        self.depended_on_by.remove(stale);
                    }
                }
            }
        }
        for dep in &new_deps {
            self.depended_on_by
                .entry(dep.clone())
                .or_default()
                .insert(from.clone());
        }

        if new_deps.is_empty() {
            self.depends_on.remove(&from);
        } else {
            self.depends_on.insert(from, new_deps);
        }
    }

    pub fn reset(&mut self) {
        self.depends_on.clear();
        self.depended_on_by.clear();
    }

    /// `seed` plus everything that directly or transitively depends on it.
    pub fn affected_items(&self, seed: &KindAndKey) -> HashSet<KindAndKey> {
        let mut affected = HashSet::new();
        self.add_affected_items(&mut affected, seed);
        affected
    }

    /// Adds `seed` and its transitive dependents to `affected`. Items already
    /// present are not walked again, which also makes cycles terminate.
    pub fn add_affected_items(&self, affected: &mut HashSet<KindAndKey>, seed: &KindAndKey) {
        if !affected.insert(seed.clone()) {
            return;
        }
        let mut pending = vec![seed.clone()];
        while let Some(current) = pending.pop() {
            let Some(dependents) = self.depended_on_by.get(&current) else {
                continue;
            };
            for dependent in dependents {
                if affected.insert(dependent.clone()) {
                    pending.push(dependent.clone());
                }
            }
        }
    }
}

/// Orders a full data set for writing: collections by kind priority, and
/// within a kind that supports it, every item after the items it depends on.
pub fn sort_collections_for_init(all_data: Vec<Collection>) -> Vec<Collection> {
    let mut sorted: Vec<Collection> = all_data
        .into_iter()
        .map(|coll| {
            if coll.kind.supports_dependency_ordering() {
                let items = order_by_dependencies(coll.kind, coll.items);
                Collection::new(coll.kind, items)
            } else {
                coll
            }
        })
        .collect();
    sorted.sort_by_key(|coll| coll.kind.init_priority());
    sorted
}

struct Frame {
    key: String,
    item: ItemDescriptor,
    pending_deps: Vec<String>,
}

impl Frame {
    fn new(kind: DataKind, key: String, item: ItemDescriptor) -> Self {
        let pending_deps = compute_dependencies(kind, &item)
            .into_iter()
            .filter(|dep| dep.kind == kind)
            .map(|dep| dep.key)
            .collect();
        Frame {
            key,
            item,
            pending_deps,
        }
    }
}

/// Depth-first walk emitting each item after its same-kind dependencies.
/// Start order is arbitrary; dependencies missing from the set are skipped.
fn order_by_dependencies(kind: DataKind, items: Vec<KeyedItem>) -> Vec<KeyedItem> {
    let mut out = Vec::with_capacity(items.len());
    let mut remaining: HashMap<String, ItemDescriptor> =
        items.into_iter().map(|i| (i.key, i.item)).collect();

    while let Some(start) = remaining.keys().next().cloned() {
        let Some(item) = remaining.remove(&start) else {
            break;
        };
        let mut stack = vec![Frame::new(kind, start, item)];
        loop {
            let next_dep = match stack.last_mut() {
                Some(frame) => frame.pending_deps.pop(),
                None => break,
            };
            match next_dep {
                Some(dep_key) => {
                    if let Some(dep_item) = remaining.remove(&dep_key) {
                        stack.push(Frame::new(kind, dep_key, dep_item));
                    }
                }
                None => {
                    if let Some(frame) = stack.pop() {
                        out.push(KeyedItem::new(frame.key, frame.item));
                    }
                }
            }
        }
    }
    out
}
