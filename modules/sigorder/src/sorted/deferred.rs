use std::cell::{Cell, RefCell};
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::callable::SlotResult;
use crate::config::{DispatcherConfig, SortPolicy};
use crate::error::{CircularDependencyError, EmitError, SlotFailure};
use crate::graph::DependencyGraph;
use crate::signal::{DeferredSignal, EmitGuard};
use crate::sorted::KeyedDispatch;
use crate::token::DisconnectToken;

/// Keyed dispatcher whose slots may restructure it while it emits.
///
/// Every method takes `&self`; callbacks usually hold a [`SortedConnector`].
/// Outside an emit, changes apply immediately. During an emit:
///
/// - slots connected to an existing key wait in that key's group;
/// - new keys, new or removed dependencies and sort requests are buffered.
///
/// Both are applied in one batch at the start of the next `emit` (or
/// `flush`), never mid-pass.
pub struct DeferredSortedSignal<K, A: ?Sized + 'static> {
    shared: Rc<SortedShared<K, A>>,
}

enum EdgeChange<K> {
    Add(K, K),
    Remove(K, K),
    Clear(K),
}

struct Pending<K, A: ?Sized + 'static> {
    groups: IndexMap<K, DeferredSignal<A>>,
    edges: Vec<EdgeChange<K>>,
    sort_requested: bool,
}

impl<K, A: ?Sized + 'static> Default for Pending<K, A> {
    fn default() -> Self {
        Self {
            groups: IndexMap::new(),
            edges: Vec::new(),
            sort_requested: false,
        }
    }
}

struct SortedShared<K, A: ?Sized + 'static> {
    graph: RefCell<DependencyGraph<K, DeferredSignal<A>>>,
    pending: RefCell<Pending<K, A>>,
    emitting: Cell<bool>,
    config: DispatcherConfig,
}

impl<K, A> SortedShared<K, A>
where
    K: Hash + Eq + Clone + Debug + 'static,
    A: ?Sized + 'static,
{
    fn connect_with<F>(&self, key: K, slot: F, policy: SortPolicy) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        self.group_for(key, policy).connect(slot)
    }

    fn reserve(&self, key: K, additional: usize) {
        self.group_for(key, self.config.sort_policy).reserve(additional);
    }

    // Group that a connect or reserve on `key` lands in, created if needed.
    fn group_for(&self, key: K, policy: SortPolicy) -> DeferredSignal<A> {
        if self.emitting.get() {
            return self.buffered_group(key, policy);
        }

        let (group, created) = {
            let mut graph = self.graph.borrow_mut();
            let (group, created) = graph.ensure_group(key.clone());
            (group.share(), created)
        };
        if created && policy == SortPolicy::Auto {
            if let Err(error) = self.graph.borrow_mut().sort() {
                tracing::warn!(
                    key = ?key,
                    error = %error,
                    "Auto-sort after adding a key failed, nothing fires until sort() succeeds"
                );
            }
        }
        group
    }

    // Group that a mid-emit connect to `key` lands in.
    fn buffered_group(&self, key: K, policy: SortPolicy) -> DeferredSignal<A> {
        if let Some(group) = self.graph.borrow().group(&key) {
            return group.share();
        }
        let mut pending = self.pending.borrow_mut();
        pending.sort_requested |= policy == SortPolicy::Auto;
        pending.groups.entry(key).or_default().share()
    }

    fn group(&self, key: &K) -> Option<DeferredSignal<A>> {
        if let Some(group) = self.graph.borrow().group(key) {
            return Some(group.share());
        }
        self.pending.borrow().groups.get(key).map(DeferredSignal::share)
    }

    fn disconnect<T>(&self, key: &K, target: &T) -> bool
    where
        T: PartialEq + 'static,
    {
        self.group(key).is_some_and(|group| group.disconnect(target))
    }

    fn add_dependency_with(
        &self,
        before: K,
        after: K,
        policy: SortPolicy,
    ) -> Result<(), CircularDependencyError<K>> {
        if self.emitting.get() {
            self.buffer_edge(EdgeChange::Add(before, after), policy);
            return Ok(());
        }
        self.graph.borrow_mut().add_edge(before, after);
        self.resort(policy)
    }

    fn remove_dependency(&self, before: &K, after: &K) -> Result<(), CircularDependencyError<K>> {
        let policy = self.config.sort_policy;
        if self.emitting.get() {
            self.buffer_edge(EdgeChange::Remove(before.clone(), after.clone()), policy);
            return Ok(());
        }
        self.graph.borrow_mut().remove_edge(before, after);
        self.resort(policy)
    }

    fn clear_dependencies(&self, key: &K) -> Result<(), CircularDependencyError<K>> {
        let policy = self.config.sort_policy;
        if self.emitting.get() {
            self.buffer_edge(EdgeChange::Clear(key.clone()), policy);
            return Ok(());
        }
        self.graph.borrow_mut().clear_edges(key);
        self.resort(policy)
    }

    fn buffer_edge(&self, change: EdgeChange<K>, policy: SortPolicy) {
        let mut pending = self.pending.borrow_mut();
        pending.sort_requested |= policy == SortPolicy::Auto;
        pending.edges.push(change);
    }

    fn sort(&self) -> Result<(), CircularDependencyError<K>> {
        if self.emitting.get() {
            self.pending.borrow_mut().sort_requested = true;
            return Ok(());
        }
        self.graph.borrow_mut().sort()
    }

    fn resort(&self, policy: SortPolicy) -> Result<(), CircularDependencyError<K>> {
        let mut graph = self.graph.borrow_mut();
        if policy == SortPolicy::Auto && !graph.is_sorted() {
            graph.sort()
        } else {
            Ok(())
        }
    }

    /// Disconnect everything and forget every key. Mid-emit this also stops
    /// the rest of the current pass.
    fn clear(&self) {
        let graph = std::mem::replace(
            &mut *self.graph.borrow_mut(),
            DependencyGraph::with_capacity(self.config.group_capacity),
        );
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        for (_, group) in graph.groups() {
            group.clear();
        }
        for group in pending.groups.values() {
            group.clear();
        }
    }

    fn clear_group(&self, key: &K) {
        if let Some(group) = self.group(key) {
            group.clear();
        }
    }

    /// The batch step: merge buffered groups, let every group apply its own
    /// deferred slot changes, replay buffered edge changes, and sort if a
    /// buffered change asked for it.
    fn apply_pending(&self) -> Result<(), CircularDependencyError<K>> {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());

        let groups: Vec<DeferredSignal<A>> = {
            let mut graph = self.graph.borrow_mut();
            for (key, group) in pending.groups {
                if graph.insert_group(key.clone(), group).is_err() {
                    tracing::warn!(key = ?key, "Buffered group collided with an existing key");
                }
            }
            for change in pending.edges {
                match change {
                    EdgeChange::Add(before, after) => {
                        graph.add_edge(before, after);
                    }
                    EdgeChange::Remove(before, after) => {
                        graph.remove_edge(&before, &after);
                    }
                    EdgeChange::Clear(key) => {
                        graph.clear_edges(&key);
                    }
                }
            }
            graph.groups().map(|(_, group)| group.share()).collect()
        };

        // Outside the graph borrow: compaction drops callables.
        for group in &groups {
            group.apply_pending();
        }

        if pending.sort_requested {
            let mut graph = self.graph.borrow_mut();
            if !graph.is_sorted() {
                graph.sort()?;
            }
        }
        Ok(())
    }

    fn emit(&self, args: &A) -> Result<(), EmitError<K>> {
        let Some(_emitting) = EmitGuard::enter(&self.emitting) else {
            return Err(EmitError::Reentrant);
        };
        self.apply_pending()?;
        self.fire_groups(args)
    }

    fn emit_no_delayed_add(&self, args: &A) -> Result<(), EmitError<K>> {
        let Some(_emitting) = EmitGuard::enter(&self.emitting) else {
            return Err(EmitError::Reentrant);
        };
        self.fire_groups(args)
    }

    fn fire_groups(&self, args: &A) -> Result<(), EmitError<K>> {
        let groups: Vec<(K, DeferredSignal<A>)> = self
            .graph
            .borrow()
            .ordered()
            .map(|(key, group)| (key.clone(), group.share()))
            .collect();
        tracing::trace!(groups = groups.len(), "Deferred emit pass");

        let mut failures = Vec::new();
        for (key, group) in &groups {
            group.run_pass(args, |slot, error| {
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

    fn flush(&self) -> Result<(), EmitError<K>> {
        if self.emitting.get() {
            return Err(EmitError::Reentrant);
        }
        self.apply_pending()?;
        Ok(())
    }
}

impl<K, A> DeferredSortedSignal<K, A>
where
    K: Hash + Eq + Clone + Debug + 'static,
    A: ?Sized + 'static,
{
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        Self {
            shared: Rc::new(SortedShared {
                graph: RefCell::new(DependencyGraph::with_capacity(config.group_capacity)),
                pending: RefCell::new(Pending::default()),
                emitting: Cell::new(false),
                config,
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    pub fn connect<F>(&self, key: K, slot: F) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        self.shared.connect_with(key, slot, self.shared.config.sort_policy)
    }

    pub fn connect_with<F>(&self, key: K, slot: F, policy: SortPolicy) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        self.shared.connect_with(key, slot, policy)
    }

    pub fn disconnect<T>(&self, key: &K, target: &T) -> bool
    where
        T: PartialEq + 'static,
    {
        self.shared.disconnect(key, target)
    }

    pub fn add_dependency(&self, before: K, after: K) -> Result<(), CircularDependencyError<K>> {
        self.shared
            .add_dependency_with(before, after, self.shared.config.sort_policy)
    }

    /// Mid-emit this only buffers the edge and returns `Ok`; a cycle surfaces
    /// from the next `emit`.
    pub fn add_dependency_with(
        &self,
        before: K,
        after: K,
        policy: SortPolicy,
    ) -> Result<(), CircularDependencyError<K>> {
        self.shared.add_dependency_with(before, after, policy)
    }

    pub fn remove_dependency(&self, before: &K, after: &K) -> Result<(), CircularDependencyError<K>> {
        self.shared.remove_dependency(before, after)
    }

    /// Mid-emit this requests a sort at the next batch step.
    pub fn sort(&self) -> Result<(), CircularDependencyError<K>> {
        self.shared.sort()
    }

    pub fn clear(&self) {
        self.shared.clear();
    }

    pub fn clear_group(&self, key: &K) {
        self.shared.clear_group(key);
    }

    pub fn clear_dependencies(&self, key: &K) -> Result<(), CircularDependencyError<K>> {
        self.shared.clear_dependencies(key)
    }

    /// Apply buffered changes, then fire every group in sorted order.
    ///
    /// Returns [`EmitError::CircularDependency`] without firing anything if
    /// the buffered changes made the graph cyclic, and
    /// [`EmitError::Reentrant`] when called from one of its own slots.
    pub fn emit(&self, args: &A) -> Result<(), EmitError<K>> {
        self.shared.emit(args)
    }

    /// Fire the groups and slots that are resident now, skipping the batch
    /// step. Buffered keys, buffered edge changes and slots connected since
    /// the last batch wait for the next `emit` or `flush`.
    pub fn emit_no_delayed_add(&self, args: &A) -> Result<(), EmitError<K>> {
        self.shared.emit_no_delayed_add(args)
    }

    /// Presize `key`'s group. Mid-emit a missing key is buffered like a
    /// connect.
    pub fn reserve(&self, key: K, additional: usize) {
        self.shared.reserve(key, additional);
    }

    /// Run the batch step without emitting.
    pub fn flush(&self) -> Result<(), EmitError<K>> {
        self.shared.flush()
    }

    pub fn connector(&self) -> SortedConnector<K, A> {
        SortedConnector {
            shared: Rc::downgrade(&self.shared),
        }
    }

    pub fn sorted_keys(&self) -> Vec<K> {
        self.shared.graph.borrow().sorted_keys().into_iter().cloned().collect()
    }

    pub fn is_sorted(&self) -> bool {
        self.shared.graph.borrow().is_sorted()
    }

    pub fn is_emitting(&self) -> bool {
        self.shared.emitting.get()
    }

    /// Known keys, counting ones buffered since the last batch.
    pub fn len(&self) -> usize {
        self.shared.graph.borrow().len() + self.shared.pending.borrow().groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, A> Default for DeferredSortedSignal<K, A>
where
    K: Hash + Eq + Clone + Debug + 'static,
    A: ?Sized + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, A> fmt::Debug for DeferredSortedSignal<K, A>
where
    K: Hash + Eq + Clone + Debug + 'static,
    A: ?Sized + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredSortedSignal")
            .field("order", &self.sorted_keys())
            .field("groups", &self.len())
            .field("emitting", &self.is_emitting())
            .finish()
    }
}

impl<K, A> KeyedDispatch<K, A> for DeferredSortedSignal<K, A>
where
    K: Hash + Eq + Clone + Debug + 'static,
    A: ?Sized + 'static,
{
    fn with_config(config: DispatcherConfig) -> Self {
        DeferredSortedSignal::with_config(config)
    }

    fn default_policy(&self) -> SortPolicy {
        self.shared.config.sort_policy
    }

    fn connect_with<F>(&mut self, key: K, slot: F, policy: SortPolicy) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        self.shared.connect_with(key, slot, policy)
    }

    fn disconnect<T>(&mut self, key: &K, target: &T) -> bool
    where
        T: PartialEq + 'static,
    {
        self.shared.disconnect(key, target)
    }

    fn add_dependency_with(
        &mut self,
        before: K,
        after: K,
        policy: SortPolicy,
    ) -> Result<(), CircularDependencyError<K>> {
        self.shared.add_dependency_with(before, after, policy)
    }

    fn remove_dependency(&mut self, before: &K, after: &K) -> Result<(), CircularDependencyError<K>> {
        self.shared.remove_dependency(before, after)
    }

    fn sort(&mut self) -> Result<(), CircularDependencyError<K>> {
        self.shared.sort()
    }

    fn clear(&mut self) {
        self.shared.clear()
    }

    fn clear_group(&mut self, key: &K) {
        self.shared.clear_group(key)
    }

    fn clear_dependencies(&mut self, key: &K) -> Result<(), CircularDependencyError<K>> {
        self.shared.clear_dependencies(key)
    }

    fn reserve(&mut self, key: K, additional: usize) {
        self.shared.reserve(key, additional)
    }

    fn emit(&self, args: &A) -> Result<(), EmitError<K>> {
        self.shared.emit(args)
    }

    fn emit_no_delayed_add(&self, args: &A) -> Result<(), EmitError<K>> {
        self.shared.emit_no_delayed_add(args)
    }
}

/// Weak handle to a [`DeferredSortedSignal`], meant to be captured by its
/// slots. Once the dispatcher is gone, connects return detached tokens and
/// everything else is a no-op.
pub struct SortedConnector<K, A: ?Sized + 'static> {
    shared: Weak<SortedShared<K, A>>,
}

impl<K, A> SortedConnector<K, A>
where
    K: Hash + Eq + Clone + Debug + 'static,
    A: ?Sized + 'static,
{
    pub fn connect<F>(&self, key: K, slot: F) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        match self.shared.upgrade() {
            Some(shared) => {
                let policy = shared.config.sort_policy;
                shared.connect_with(key, slot, policy)
            }
            None => DisconnectToken::detached(),
        }
    }

    pub fn connect_with<F>(&self, key: K, slot: F, policy: SortPolicy) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        match self.shared.upgrade() {
            Some(shared) => shared.connect_with(key, slot, policy),
            None => DisconnectToken::detached(),
        }
    }

    pub fn disconnect<T>(&self, key: &K, target: &T) -> bool
    where
        T: PartialEq + 'static,
    {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.disconnect(key, target))
    }

    pub fn add_dependency(&self, before: K, after: K) -> Result<(), CircularDependencyError<K>> {
        match self.shared.upgrade() {
            Some(shared) => {
                let policy = shared.config.sort_policy;
                shared.add_dependency_with(before, after, policy)
            }
            None => Ok(()),
        }
    }

    pub fn add_dependency_with(
        &self,
        before: K,
        after: K,
        policy: SortPolicy,
    ) -> Result<(), CircularDependencyError<K>> {
        match self.shared.upgrade() {
            Some(shared) => shared.add_dependency_with(before, after, policy),
            None => Ok(()),
        }
    }

    pub fn remove_dependency(&self, before: &K, after: &K) -> Result<(), CircularDependencyError<K>> {
        match self.shared.upgrade() {
            Some(shared) => shared.remove_dependency(before, after),
            None => Ok(()),
        }
    }

    pub fn reserve(&self, key: K, additional: usize) {
        if let Some(shared) = self.shared.upgrade() {
            shared.reserve(key, additional);
        }
    }

    pub fn clear_group(&self, key: &K) {
        if let Some(shared) = self.shared.upgrade() {
            shared.clear_group(key);
        }
    }

    /// Clears the whole dispatcher. From inside a slot, nothing else fires in
    /// the current pass.
    pub fn clear(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.clear();
        }
    }

    pub fn sort(&self) -> Result<(), CircularDependencyError<K>> {
        match self.shared.upgrade() {
            Some(shared) => shared.sort(),
            None => Ok(()),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

impl<K, A: ?Sized + 'static> Clone for SortedConnector<K, A> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<K, A: ?Sized + 'static> fmt::Debug for SortedConnector<K, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedConnector")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}
