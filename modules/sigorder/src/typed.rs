//! Keyed dispatch where the keys are Rust types.
//!
//! `connect::<Physics>(f)` files `f` under the key for `Physics`, and
//! `add_dependency::<Input, Physics>()` runs every `Input` slot before every
//! `Physics` slot. The types are never instantiated.

use std::any::{type_name, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::callable::SlotResult;
use crate::config::{DispatcherConfig, SortPolicy};
use crate::error::{CircularDependencyError, EmitError};
use crate::sorted::{DeferredSortedSignal, KeyedDispatch, SortedConnector, SortedSignal};
use crate::token::DisconnectToken;

/// Identity of a type, usable as a dispatch key. Compares by `TypeId`; the
/// name is only for logs and errors.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Type-keyed front end over any [`KeyedDispatch`] implementation.
pub struct TypeSortedSignal<A: ?Sized + 'static, D = SortedSignal<TypeKey, A>> {
    dispatcher: D,
    _args: PhantomData<fn(&A)>,
}

/// Type-keyed dispatcher whose slots may restructure it mid-emit.
pub type DeferredTypeSortedSignal<A> = TypeSortedSignal<A, DeferredSortedSignal<TypeKey, A>>;

impl<A, D> TypeSortedSignal<A, D>
where
    A: ?Sized + 'static,
    D: KeyedDispatch<TypeKey, A>,
{
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        Self::from_dispatcher(D::with_config(config))
    }

    pub fn from_dispatcher(dispatcher: D) -> Self {
        Self {
            dispatcher,
            _args: PhantomData,
        }
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn into_dispatcher(self) -> D {
        self.dispatcher
    }

    pub fn connect<T: ?Sized + 'static>(
        &mut self,
        slot: impl Fn(&A) -> SlotResult + 'static,
    ) -> DisconnectToken {
        self.dispatcher.connect(TypeKey::of::<T>(), slot)
    }

    pub fn connect_with<T: ?Sized + 'static>(
        &mut self,
        slot: impl Fn(&A) -> SlotResult + 'static,
        policy: SortPolicy,
    ) -> DisconnectToken {
        self.dispatcher.connect_with(TypeKey::of::<T>(), slot, policy)
    }

    pub fn disconnect<T: ?Sized + 'static>(&mut self, target: &(impl PartialEq + 'static)) -> bool {
        self.dispatcher.disconnect(&TypeKey::of::<T>(), target)
    }

    /// `Before`'s slots run earlier than `After`'s.
    pub fn add_dependency<Before, After>(&mut self) -> Result<(), CircularDependencyError<TypeKey>>
    where
        Before: ?Sized + 'static,
        After: ?Sized + 'static,
    {
        self.dispatcher
            .add_dependency(TypeKey::of::<Before>(), TypeKey::of::<After>())
    }

    pub fn add_dependency_with<Before, After>(
        &mut self,
        policy: SortPolicy,
    ) -> Result<(), CircularDependencyError<TypeKey>>
    where
        Before: ?Sized + 'static,
        After: ?Sized + 'static,
    {
        self.dispatcher
            .add_dependency_with(TypeKey::of::<Before>(), TypeKey::of::<After>(), policy)
    }

    pub fn remove_dependency<Before, After>(&mut self) -> Result<(), CircularDependencyError<TypeKey>>
    where
        Before: ?Sized + 'static,
        After: ?Sized + 'static,
    {
        self.dispatcher
            .remove_dependency(&TypeKey::of::<Before>(), &TypeKey::of::<After>())
    }

    pub fn clear_group<T: ?Sized + 'static>(&mut self) {
        self.dispatcher.clear_group(&TypeKey::of::<T>());
    }

    pub fn clear_dependencies<T: ?Sized + 'static>(&mut self) -> Result<(), CircularDependencyError<TypeKey>> {
        self.dispatcher.clear_dependencies(&TypeKey::of::<T>())
    }

    pub fn clear(&mut self) {
        self.dispatcher.clear();
    }

    pub fn sort(&mut self) -> Result<(), CircularDependencyError<TypeKey>> {
        self.dispatcher.sort()
    }

    pub fn reserve<T: ?Sized + 'static>(&mut self, additional: usize) {
        self.dispatcher.reserve(TypeKey::of::<T>(), additional);
    }

    pub fn emit(&self, args: &A) -> Result<(), EmitError<TypeKey>> {
        self.dispatcher.emit(args)
    }

    pub fn emit_no_delayed_add(&self, args: &A) -> Result<(), EmitError<TypeKey>> {
        self.dispatcher.emit_no_delayed_add(args)
    }
}

impl<A, D> Default for TypeSortedSignal<A, D>
where
    A: ?Sized + 'static,
    D: KeyedDispatch<TypeKey, A>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A, D> fmt::Debug for TypeSortedSignal<A, D>
where
    A: ?Sized + 'static,
    D: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypeSortedSignal").field(&self.dispatcher).finish()
    }
}

impl<A: ?Sized + 'static> TypeSortedSignal<A, DeferredSortedSignal<TypeKey, A>> {
    pub fn connector(&self) -> TypeConnector<A> {
        TypeConnector {
            inner: self.dispatcher.connector(),
        }
    }

    /// Run the batch step without emitting.
    pub fn flush(&self) -> Result<(), EmitError<TypeKey>> {
        self.dispatcher.flush()
    }
}

/// Weak, type-keyed handle to a [`DeferredTypeSortedSignal`].
pub struct TypeConnector<A: ?Sized + 'static> {
    inner: SortedConnector<TypeKey, A>,
}

impl<A: ?Sized + 'static> TypeConnector<A> {
    pub fn connect<T: ?Sized + 'static>(&self, slot: impl Fn(&A) -> SlotResult + 'static) -> DisconnectToken {
        self.inner.connect(TypeKey::of::<T>(), slot)
    }

    pub fn connect_with<T: ?Sized + 'static>(
        &self,
        slot: impl Fn(&A) -> SlotResult + 'static,
        policy: SortPolicy,
    ) -> DisconnectToken {
        self.inner.connect_with(TypeKey::of::<T>(), slot, policy)
    }

    pub fn disconnect<T: ?Sized + 'static>(&self, target: &(impl PartialEq + 'static)) -> bool {
        self.inner.disconnect(&TypeKey::of::<T>(), target)
    }

    pub fn add_dependency<Before, After>(&self) -> Result<(), CircularDependencyError<TypeKey>>
    where
        Before: ?Sized + 'static,
        After: ?Sized + 'static,
    {
        self.inner
            .add_dependency(TypeKey::of::<Before>(), TypeKey::of::<After>())
    }

    pub fn remove_dependency<Before, After>(&self) -> Result<(), CircularDependencyError<TypeKey>>
    where
        Before: ?Sized + 'static,
        After: ?Sized + 'static,
    {
        self.inner
            .remove_dependency(&TypeKey::of::<Before>(), &TypeKey::of::<After>())
    }

    pub fn clear_group<T: ?Sized + 'static>(&self) {
        self.inner.clear_group(&TypeKey::of::<T>());
    }

    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }
}

impl<A: ?Sized + 'static> Clone for TypeConnector<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: ?Sized + 'static> fmt::Debug for TypeConnector<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeConnector")
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    struct Marker;

    #[test]
    fn type_keys_compare_by_type() {
        assert_eq!(TypeKey::of::<u32>(), TypeKey::of::<u32>());
        assert_ne!(TypeKey::of::<u32>(), TypeKey::of::<i32>());

        let keys: HashSet<TypeKey> = [TypeKey::of::<Marker>(), TypeKey::of::<Marker>(), TypeKey::of::<str>()]
            .into_iter()
            .collect();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn type_key_prints_type_name() {
        let key = TypeKey::of::<Marker>();
        assert!(key.to_string().ends_with("Marker"));
        assert_eq!(format!("{key:?}"), key.name());
    }

    #[test]
    fn cycle_chain_names_types() {
        let mut signal: TypeSortedSignal<()> = TypeSortedSignal::new();
        let err = signal.add_dependency::<Marker, Marker>().unwrap_err();
        assert_eq!(err.chain(), &[TypeKey::of::<Marker>(), TypeKey::of::<Marker>()]);
        assert!(err.to_string().contains("Marker"));
    }
}
