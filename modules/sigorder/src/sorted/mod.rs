//! Keyed dispatchers: one slot registry per key, fired in dependency order.
//!
//! Ordering between keys follows the sorted [`DependencyGraph`]; ordering
//! within a key follows that key's registry.

mod deferred;

pub use deferred::{DeferredSortedSignal, SortedConnector};

use std::fmt::{self, Debug};
use std::hash::Hash;

use crate::callable::SlotResult;
use crate::config::{DispatcherConfig, SortPolicy};
use crate::error::{CircularDependencyError, EmitError, SlotFailure};
use crate::graph::DependencyGraph;
use crate::signal::FastSignal;
use crate::token::DisconnectToken;

/// Operations shared by every keyed dispatcher.
pub trait KeyedDispatch<K, A: ?Sized + 'static> {
    fn with_config(config: DispatcherConfig) -> Self
    where
        Self: Sized;

    /// Policy used by [`connect`](Self::connect),
    /// [`add_dependency`](Self::add_dependency) and every mutation that does
    /// not take one explicitly.
    fn default_policy(&self) -> SortPolicy;

    /// Register `slot` under `key`, creating the key's group if needed. A new
    /// key is a structural change and is sorted according to `policy`.
    fn connect_with<F>(&mut self, key: K, slot: F, policy: SortPolicy) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static;

    fn connect<F>(&mut self, key: K, slot: F) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        let policy = self.default_policy();
        self.connect_with(key, slot, policy)
    }

    /// Disconnect the first slot under `key` whose callable equals `target`.
    fn disconnect<T>(&mut self, key: &K, target: &T) -> bool
    where
        T: PartialEq + 'static;

    /// Declare that `before`'s slots run earlier than `after`'s.
    fn add_dependency_with(
        &mut self,
        before: K,
        after: K,
        policy: SortPolicy,
    ) -> Result<(), CircularDependencyError<K>>;

    fn add_dependency(&mut self, before: K, after: K) -> Result<(), CircularDependencyError<K>> {
        let policy = self.default_policy();
        self.add_dependency_with(before, after, policy)
    }

    fn remove_dependency(&mut self, before: &K, after: &K) -> Result<(), CircularDependencyError<K>>;

    fn sort(&mut self) -> Result<(), CircularDependencyError<K>>;

    /// Drop every group, slot and dependency.
    fn clear(&mut self);

    /// Disconnect the slots under `key`, keeping the key and its edges.
    fn clear_group(&mut self, key: &K);

    /// Drop every dependency declared for `key`.
    fn clear_dependencies(&mut self, key: &K) -> Result<(), CircularDependencyError<K>>;

    /// Presize `key`'s group for `additional` more slots. Creates the group
    /// if needed, which counts as a structural change under the default
    /// policy.
    fn reserve(&mut self, key: K, additional: usize);

    fn emit(&self, args: &A) -> Result<(), EmitError<K>>;

    /// Fire without the batch step. Dispatchers that never defer anything
    /// just emit.
    fn emit_no_delayed_add(&self, args: &A) -> Result<(), EmitError<K>> {
        self.emit(args)
    }
}

/// Keyed dispatcher over [`FastSignal`] groups.
///
/// Mutation takes `&mut self`, so callbacks cannot restructure it mid-emit.
pub struct SortedSignal<K, A: ?Sized + 'static> {
    graph: DependencyGraph<K, FastSignal<A>>,
    config: DispatcherConfig,
}

impl<K, A> SortedSignal<K, A>
where
    K: Hash + Eq + Clone + Debug + 'static,
    A: ?Sized + 'static,
{
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        Self {
            graph: DependencyGraph::with_capacity(config.group_capacity),
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn connect<F>(&mut self, key: K, slot: F) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        self.connect_with(key, slot, self.config.sort_policy)
    }

    pub fn connect_with<F>(&mut self, key: K, slot: F, policy: SortPolicy) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        let (group, created) = self.graph.ensure_group(key.clone());
        let token = group.connect(slot);
        if created {
            self.sort_new_key(&key, policy);
        }
        token
    }

    pub fn reserve(&mut self, key: K, additional: usize) {
        let (group, created) = self.graph.ensure_group(key.clone());
        group.reserve(additional);
        if created {
            self.sort_new_key(&key, self.config.sort_policy);
        }
    }

    pub fn disconnect<T>(&mut self, key: &K, target: &T) -> bool
    where
        T: PartialEq + 'static,
    {
        self.graph
            .group_mut(key)
            .is_some_and(|group| group.disconnect(target))
    }

    pub fn add_dependency(&mut self, before: K, after: K) -> Result<(), CircularDependencyError<K>> {
        self.add_dependency_with(before, after, self.config.sort_policy)
    }

    pub fn add_dependency_with(
        &mut self,
        before: K,
        after: K,
        policy: SortPolicy,
    ) -> Result<(), CircularDependencyError<K>> {
        self.graph.add_edge(before, after);
        self.resort(policy)
    }

    pub fn remove_dependency(&mut self, before: &K, after: &K) -> Result<(), CircularDependencyError<K>> {
        self.graph.remove_edge(before, after);
        self.resort(self.config.sort_policy)
    }

    pub fn sort(&mut self) -> Result<(), CircularDependencyError<K>> {
        self.graph.sort()
    }

    pub fn clear(&mut self) {
        self.graph.clear();
    }

    pub fn clear_group(&mut self, key: &K) {
        if let Some(group) = self.graph.group_mut(key) {
            group.clear();
        }
    }

    pub fn clear_dependencies(&mut self, key: &K) -> Result<(), CircularDependencyError<K>> {
        self.graph.clear_edges(key);
        self.resort(self.config.sort_policy)
    }

    /// Fire every group in sorted order. Failures from all groups are
    /// collected and returned after the pass.
    pub fn emit(&self, args: &A) -> Result<(), EmitError<K>> {
        if !self.graph.is_sorted() {
            tracing::trace!(groups = self.graph.len(), "Emit on unsorted dispatcher, nothing fires");
        }

        let mut failures = Vec::new();
        for (key, group) in self.graph.ordered() {
            group.fire(args, |slot, error| {
                tracing::debug!(key = ?key, slot = %slot, error = %error, "Slot failed");
                failures.push(SlotFailure {
                    key: key.clone(),
                    slot,
                    error,
                });
            });
        }
        EmitError::from_failures(failures)
    }

    /// Same as [`emit`](Self::emit): a fast dispatcher has no delayed
    /// additions to skip.
    pub fn emit_no_delayed_add(&self, args: &A) -> Result<(), EmitError<K>> {
        self.emit(args)
    }

    /// Keys in execution order. Empty while unsorted.
    pub fn sorted_keys(&self) -> Vec<&K> {
        self.graph.sorted_keys()
    }

    pub fn is_sorted(&self) -> bool {
        self.graph.is_sorted()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.graph.contains(key)
    }

    pub fn group(&self, key: &K) -> Option<&FastSignal<A>> {
        self.graph.group(key)
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    fn resort(&mut self, policy: SortPolicy) -> Result<(), CircularDependencyError<K>> {
        if policy == SortPolicy::Auto && !self.graph.is_sorted() {
            self.graph.sort()
        } else {
            Ok(())
        }
    }

    fn sort_new_key(&mut self, key: &K, policy: SortPolicy) {
        if policy != SortPolicy::Auto {
            return;
        }
        if let Err(error) = self.graph.sort() {
            tracing::warn!(
                key = ?key,
                error = %error,
                "Auto-sort after adding a key failed, nothing fires until sort() succeeds"
            );
        }
    }
}

impl<K, A> Default for SortedSignal<K, A>
where
    K: Hash + Eq + Clone + Debug + 'static,
    A: ?Sized + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, A> fmt::Debug for SortedSignal<K, A>
where
    K: Hash + Eq + Clone + Debug + 'static,
    A: ?Sized + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedSignal")
            .field("order", &self.graph.sorted_keys())
            .field("groups", &self.graph.len())
            .field("sorted", &self.graph.is_sorted())
            .finish()
    }
}

impl<K, A> KeyedDispatch<K, A> for SortedSignal<K, A>
where
    K: Hash + Eq + Clone + Debug + 'static,
    A: ?Sized + 'static,
{
    fn with_config(config: DispatcherConfig) -> Self {
        SortedSignal::with_config(config)
    }

    fn default_policy(&self) -> SortPolicy {
        self.config.sort_policy
    }

    fn connect_with<F>(&mut self, key: K, slot: F, policy: SortPolicy) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        SortedSignal::connect_with(self, key, slot, policy)
    }

    fn disconnect<T>(&mut self, key: &K, target: &T) -> bool
    where
        T: PartialEq + 'static,
    {
        SortedSignal::disconnect(self, key, target)
    }

    fn add_dependency_with(
        &mut self,
        before: K,
        after: K,
        policy: SortPolicy,
    ) -> Result<(), CircularDependencyError<K>> {
        SortedSignal::add_dependency_with(self, before, after, policy)
    }

    fn remove_dependency(&mut self, before: &K, after: &K) -> Result<(), CircularDependencyError<K>> {
        SortedSignal::remove_dependency(self, before, after)
    }

    fn sort(&mut self) -> Result<(), CircularDependencyError<K>> {
        SortedSignal::sort(self)
    }

    fn clear(&mut self) {
        SortedSignal::clear(self)
    }

    fn clear_group(&mut self, key: &K) {
        SortedSignal::clear_group(self, key)
    }

    fn clear_dependencies(&mut self, key: &K) -> Result<(), CircularDependencyError<K>> {
        SortedSignal::clear_dependencies(self, key)
    }

    fn reserve(&mut self, key: K, additional: usize) {
        SortedSignal::reserve(self, key, additional)
    }

    fn emit(&self, args: &A) -> Result<(), EmitError<K>> {
        SortedSignal::emit(self, args)
    }
}
