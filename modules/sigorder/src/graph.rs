//! Keyed groups plus "must run before" edges, and the topological sort over
//! them.
//!
//! Edges are stored on the later key: `add_edge(before, after)` puts `before`
//! into `after`'s dependency set. Keys that appear only as `before` are not
//! entries; the sort skips them until something connects to that key.

use std::fmt::Debug;
use std::hash::Hash;

use indexmap::{IndexMap, IndexSet};

use crate::error::CircularDependencyError;

pub struct DependencyEntry<K, G> {
    pub group: G,
    before: IndexSet<K>,
}

impl<K, G: Default> Default for DependencyEntry<K, G> {
    fn default() -> Self {
        Self {
            group: G::default(),
            before: IndexSet::new(),
        }
    }
}

impl<K, G> DependencyEntry<K, G> {
    /// Keys that must run before this one.
    pub fn dependencies(&self) -> impl Iterator<Item = &K> {
        self.before.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Resolved,
}

/// Groups keyed by `K` with a cached execution order.
///
/// The cached order is always either empty or a full permutation of the
/// entries that respects every edge. Structural changes empty it; `sort()`
/// rebuilds it.
pub struct DependencyGraph<K, G> {
    entries: IndexMap<K, DependencyEntry<K, G>>,
    // Positions in `entries`. Entries are only appended or cleared wholesale,
    // so positions stay valid.
    order: Vec<usize>,
    sorted: bool,
}

impl<K, G> DependencyGraph<K, G>
where
    K: Hash + Eq + Clone + Debug,
{
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity),
            order: Vec::with_capacity(capacity),
            sorted: true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys the graph can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entry(&self, key: &K) -> Option<&DependencyEntry<K, G>> {
        self.entries.get(key)
    }

    pub fn group(&self, key: &K) -> Option<&G> {
        self.entries.get(key).map(|entry| &entry.group)
    }

    pub fn group_mut(&mut self, key: &K) -> Option<&mut G> {
        self.entries.get_mut(key).map(|entry| &mut entry.group)
    }

    /// Every group in key insertion order, sorted or not.
    pub fn groups(&self) -> impl Iterator<Item = (&K, &G)> {
        self.entries.iter().map(|(key, entry)| (key, &entry.group))
    }

    pub fn groups_mut(&mut self) -> impl Iterator<Item = (&K, &mut G)> {
        self.entries
            .iter_mut()
            .map(|(key, entry)| (key, &mut entry.group))
    }

    /// Get `key`'s group, creating an empty one if needed. The flag is true
    /// when the key is new (which invalidates the order).
    pub fn ensure_group(&mut self, key: K) -> (&mut G, bool)
    where
        G: Default,
    {
        let created = !self.entries.contains_key(&key);
        if created {
            self.invalidate();
        }
        let entry = self.entries.entry(key).or_default();
        (&mut entry.group, created)
    }

    /// Insert a prebuilt group for a key that has no entry yet. Hands the
    /// group back if the key already exists.
    pub fn insert_group(&mut self, key: K, group: G) -> Result<(), G> {
        if self.entries.contains_key(&key) {
            return Err(group);
        }
        self.invalidate();
        self.entries.insert(
            key,
            DependencyEntry {
                group,
                before: IndexSet::new(),
            },
        );
        Ok(())
    }

    /// Record that `before` runs earlier than `after`, creating `after`'s
    /// entry if needed. Returns whether the graph changed.
    pub fn add_edge(&mut self, before: K, after: K) -> bool
    where
        G: Default,
    {
        let created = !self.entries.contains_key(&after);
        let inserted = self.entries.entry(after).or_default().before.insert(before);
        let changed = created || inserted;
        if changed {
            self.invalidate();
        }
        changed
    }

    /// Returns whether the edge existed.
    pub fn remove_edge(&mut self, before: &K, after: &K) -> bool {
        let removed = self
            .entries
            .get_mut(after)
            .is_some_and(|entry| entry.before.shift_remove(before));
        if removed {
            self.invalidate();
        }
        removed
    }

    /// Drop every edge into `key`. Returns whether any existed.
    pub fn clear_edges(&mut self, key: &K) -> bool {
        let removed = self.entries.get_mut(key).is_some_and(|entry| {
            let had_edges = !entry.before.is_empty();
            entry.before.clear();
            had_edges
        });
        if removed {
            self.invalidate();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.sorted = true;
    }

    pub fn invalidate(&mut self) {
        self.order.clear();
        self.sorted = false;
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Groups in execution order. Empty unless the last sort succeeded and
    /// nothing changed since.
    pub fn ordered(&self) -> impl Iterator<Item = (&K, &G)> {
        self.order
            .iter()
            .filter_map(|&index| self.entries.get_index(index))
            .map(|(key, entry)| (key, &entry.group))
    }

    pub fn sorted_keys(&self) -> Vec<&K> {
        self.ordered().map(|(key, _)| key).collect()
    }

    /// Rebuild the execution order.
    ///
    /// Depth-first from every entry in insertion order, visiting dependencies
    /// in edge insertion order, with an explicit stack so long chains cannot
    /// overflow the call stack. On a cycle the order is left empty.
    pub fn sort(&mut self) -> Result<(), CircularDependencyError<K>> {
        self.invalidate();

        let count = self.entries.len();
        let mut marks = vec![Mark::Unvisited; count];
        let mut order = Vec::with_capacity(count);
        // (entry position, next dependency to look at)
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for root in 0..count {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            marks[root] = Mark::InProgress;
            stack.push((root, 0));

            while let Some(frame) = stack.last_mut() {
                let (index, next) = *frame;
                match self.entries[index].before.get_index(next) {
                    Some(dependency) => {
                        frame.1 += 1;
                        let Some(dependency) = self.entries.get_index_of(dependency) else {
                            continue;
                        };
                        match marks[dependency] {
                            Mark::Resolved => {}
                            Mark::InProgress => {
                                let error = self.cycle_error(dependency, &stack);
                                tracing::warn!(
                                    chain = ?error.chain(),
                                    "Circular dependency between signal groups"
                                );
                                return Err(error);
                            }
                            Mark::Unvisited => {
                                marks[dependency] = Mark::InProgress;
                                stack.push((dependency, 0));
                            }
                        }
                    }
                    None => {
                        marks[index] = Mark::Resolved;
                        order.push(index);
                        stack.pop();
                    }
                }
            }
        }

        tracing::debug!(groups = order.len(), "Sorted signal groups");
        self.order = order;
        self.sorted = true;
        Ok(())
    }

    // The rediscovered key first, then every frame from the top of the stack
    // down to the root.
    fn cycle_error(&self, rediscovered: usize, stack: &[(usize, usize)]) -> CircularDependencyError<K> {
        let chain = std::iter::once(rediscovered)
            .chain(stack.iter().rev().map(|&(index, _)| index))
            .filter_map(|index| self.entries.get_index(index))
            .map(|(key, _)| key.clone())
            .collect();
        CircularDependencyError::new(chain)
    }
}

impl<K, G> Default for DependencyGraph<K, G>
where
    K: Hash + Eq + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
