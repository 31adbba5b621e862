use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::callable::{holds, Callback, SlotResult};
use crate::error::{EmitError, SlotFailure};
use crate::id::{IdPool, SlotId};
use crate::signal::{position_two_way, SlotRegistry};
use crate::token::{DisconnectToken, Unregister};

/// Registry whose slots may connect and disconnect slots (their own included)
/// while it emits.
///
/// - A slot connected during an emit first fires on the next emit.
/// - A slot disconnected during an emit never fires again, including later in
///   the same pass. A slot that disconnects itself finishes its current call.
/// - Compaction and pending additions are applied as one batch at the start
///   of the next `emit` (or `flush`), never mid-pass.
///
/// Every method takes `&self`. Callbacks usually capture a
/// [`SignalConnector`], which does not keep the signal alive.
pub struct DeferredSignal<A: ?Sized + 'static> {
    shared: Rc<DeferredShared<A>>,
}

struct Entry<A: ?Sized> {
    id: SlotId,
    // None once disconnected mid-pass; the entry itself goes at the next batch.
    callback: Option<Rc<dyn Callback<A>>>,
}

pub(crate) struct DeferredShared<A: ?Sized> {
    slots: RefCell<Vec<Entry<A>>>,
    to_add: RefCell<Vec<Entry<A>>>,
    to_remove: RefCell<Vec<SlotId>>,
    pool: RefCell<IdPool>,
    firing: Cell<Option<SlotId>>,
    emitting: Cell<bool>,
}

/// Holds an "emitting" flag for its lifetime, clearing it even on panic.
pub(crate) struct EmitGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> EmitGuard<'a> {
    /// `None` if the flag is already set.
    pub(crate) fn enter(flag: &'a Cell<bool>) -> Option<Self> {
        if flag.replace(true) {
            return None;
        }
        Some(Self { flag })
    }
}

impl Drop for EmitGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

struct FiringGuard<'a> {
    firing: &'a Cell<Option<SlotId>>,
}

impl Drop for FiringGuard<'_> {
    fn drop(&mut self) {
        self.firing.set(None);
    }
}

impl<A: ?Sized + 'static> DeferredShared<A> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: RefCell::new(Vec::with_capacity(capacity)),
            to_add: RefCell::new(Vec::new()),
            to_remove: RefCell::new(Vec::new()),
            pool: RefCell::new(IdPool::default()),
            firing: Cell::new(None),
            emitting: Cell::new(false),
        }
    }

    fn connect<F>(self: &Rc<Self>, slot: F) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        let id = self.pool.borrow_mut().acquire();
        self.to_add.borrow_mut().push(Entry {
            id,
            callback: Some(Rc::new(slot)),
        });
        let owner = Rc::downgrade(self) as Weak<dyn Unregister>;
        DisconnectToken::new(owner, id)
    }

    fn disconnect<T>(&self, target: &T) -> bool
    where
        T: PartialEq + 'static,
    {
        let mut to_remove = self.to_remove.borrow_mut();
        let is_live = |id: SlotId| !to_remove.contains(&id);

        let removed = {
            let mut slots = self.slots.borrow_mut();
            position_two_way(&slots, |entry| {
                is_live(entry.id)
                    && entry
                        .callback
                        .as_ref()
                        .is_some_and(|callback| holds(callback.as_ref(), target))
            })
            .map(|index| {
                let entry = &mut slots[index];
                (entry.id, entry.callback.take())
            })
        };

        match removed {
            Some((id, callback)) => {
                to_remove.push(id);
                drop(to_remove);
                drop(callback);
                true
            }
            None => {
                let pending = self.to_add.borrow();
                let id = pending
                    .iter()
                    .filter(|entry| !to_remove.contains(&entry.id))
                    .find(|entry| {
                        entry
                            .callback
                            .as_ref()
                            .is_some_and(|callback| holds(callback.as_ref(), target))
                    })
                    .map(|entry| entry.id);
                drop(pending);
                if let Some(id) = id {
                    to_remove.push(id);
                }
                id.is_some()
            }
        }
    }

    /// Apply queued removals, then append queued additions.
    pub(crate) fn apply_pending(&self) {
        let mut dropped = Vec::new();
        {
            let mut slots = self.slots.borrow_mut();
            let mut to_add = self.to_add.borrow_mut();
            let mut pool = self.pool.borrow_mut();
            for id in self.to_remove.borrow_mut().drain(..) {
                if let Some(index) = position_two_way(&slots, |entry| entry.id == id) {
                    dropped.push(slots.swap_remove(index));
                    pool.release(id);
                } else if let Some(index) = to_add.iter().position(|entry| entry.id == id) {
                    dropped.push(to_add.remove(index));
                    pool.release(id);
                }
            }
            slots.append(&mut to_add);
        }
        if !dropped.is_empty() {
            tracing::trace!(removed = dropped.len(), "Applied deferred slot removals");
        }
    }

    /// One pass over the slots as they are now. No batch step.
    pub(crate) fn run_pass(&self, args: &A, mut on_failure: impl FnMut(SlotId, anyhow::Error)) {
        let _firing = FiringGuard {
            firing: &self.firing,
        };
        let mut index = 0;
        loop {
            let (id, callback) = {
                let slots = self.slots.borrow();
                match slots.get(index) {
                    Some(entry) => (entry.id, entry.callback.clone()),
                    None => break,
                }
            };
            index += 1;
            let Some(callback) = callback else {
                continue;
            };
            self.firing.set(Some(id));
            let result = callback.invoke(args);
            self.firing.set(None);
            if let Err(error) = result {
                on_failure(id, error);
            }
        }
    }

    fn clear(&self) {
        let mut dropped: Vec<Option<Rc<dyn Callback<A>>>> = Vec::new();
        {
            let mut slots = self.slots.borrow_mut();
            let mut to_remove = self.to_remove.borrow_mut();
            let mut pool = self.pool.borrow_mut();

            for entry in self.to_add.borrow_mut().drain(..) {
                pool.release(entry.id);
                dropped.push(entry.callback);
            }

            if self.firing.get().is_some() {
                // Mid-pass: indices must stay put until the next batch.
                for entry in slots.iter_mut() {
                    if entry.callback.is_some() {
                        dropped.push(entry.callback.take());
                        to_remove.push(entry.id);
                    }
                }
            } else {
                for entry in slots.drain(..) {
                    pool.release(entry.id);
                    dropped.push(entry.callback);
                }
                to_remove.clear();
            }
        }
        drop(dropped);
    }

    fn len(&self) -> usize {
        let to_remove = self.to_remove.borrow();
        let connected = self
            .slots
            .borrow()
            .iter()
            .filter(|entry| entry.callback.is_some() && !to_remove.contains(&entry.id))
            .count();
        let pending = self
            .to_add
            .borrow()
            .iter()
            .filter(|entry| !to_remove.contains(&entry.id))
            .count();
        connected + pending
    }
}

impl<A: ?Sized + 'static> Unregister for DeferredShared<A> {
    fn unregister(&self, id: SlotId) {
        let removed = if self.firing.get() == Some(id) {
            None
        } else {
            let mut slots = self.slots.borrow_mut();
            position_two_way(&slots, |entry| entry.id == id)
                .and_then(|index| slots[index].callback.take())
        };
        self.to_remove.borrow_mut().push(id);
        drop(removed);
    }
}

impl<A: ?Sized + 'static> DeferredSignal<A> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Rc::new(DeferredShared::new(capacity)),
        }
    }

    /// Register `slot`. It first fires on the next `emit`.
    pub fn connect<F>(&self, slot: F) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        self.shared.connect(slot)
    }

    pub fn disconnect<T>(&self, target: &T) -> bool
    where
        T: PartialEq + 'static,
    {
        self.shared.disconnect(target)
    }

    /// Apply pending changes, then invoke every slot once.
    ///
    /// Calling `emit` from one of this signal's own slots returns
    /// [`EmitError::Reentrant`] without invoking anything.
    pub fn emit(&self, args: &A) -> Result<(), EmitError> {
        let Some(_emitting) = EmitGuard::enter(&self.shared.emitting) else {
            return Err(EmitError::Reentrant);
        };
        self.shared.apply_pending();
        self.fire_resident(args)
    }

    /// Invoke the slots that are resident now, skipping the batch step.
    ///
    /// Slots connected since the last batch stay pending and do not fire;
    /// slots disconnected since then stay silent. Both are settled by the
    /// next `emit` or `flush`. Recursive calls return
    /// [`EmitError::Reentrant`] like `emit`.
    pub fn emit_no_delayed_add(&self, args: &A) -> Result<(), EmitError> {
        let Some(_emitting) = EmitGuard::enter(&self.shared.emitting) else {
            return Err(EmitError::Reentrant);
        };
        self.fire_resident(args)
    }

    fn fire_resident(&self, args: &A) -> Result<(), EmitError> {
        let mut failures = Vec::new();
        self.shared.run_pass(args, |slot, error| {
            tracing::debug!(slot = %slot, error = %error, "Slot failed");
            failures.push(SlotFailure {
                key: (),
                slot,
                error,
            });
        });
        EmitError::from_failures(failures)
    }

    /// Apply pending connects and disconnects now instead of at the next emit.
    pub fn flush(&self) -> Result<(), EmitError> {
        if self.shared.emitting.get() {
            return Err(EmitError::Reentrant);
        }
        self.shared.apply_pending();
        Ok(())
    }

    /// Disconnect everything. From inside a slot this only nulls the other
    /// slots; the storage is reclaimed by the next batch.
    pub fn clear(&self) {
        self.shared.clear();
    }

    pub fn reserve(&self, additional: usize) {
        self.shared.slots.borrow_mut().reserve(additional);
    }

    /// Slots that are connected and not pending removal, including ones
    /// connected since the last emit.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connector(&self) -> SignalConnector<A> {
        SignalConnector {
            shared: Rc::downgrade(&self.shared),
        }
    }

    pub(crate) fn share(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }

    pub(crate) fn apply_pending(&self) {
        self.shared.apply_pending();
    }

    pub(crate) fn run_pass(&self, args: &A, on_failure: impl FnMut(SlotId, anyhow::Error)) {
        self.shared.run_pass(args, on_failure);
    }
}

impl<A: ?Sized + 'static> Default for DeferredSignal<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: ?Sized + 'static> fmt::Debug for DeferredSignal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredSignal")
            .field("slots", &self.len())
            .field("emitting", &self.shared.emitting.get())
            .finish()
    }
}

impl<A: ?Sized + 'static> SlotRegistry<A> for DeferredSignal<A> {
    fn connect<F>(&mut self, slot: F) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        DeferredSignal::connect(self, slot)
    }

    fn disconnect<T>(&mut self, target: &T) -> bool
    where
        T: PartialEq + 'static,
    {
        DeferredSignal::disconnect(self, target)
    }

    fn emit(&self, args: &A) -> Result<(), EmitError> {
        DeferredSignal::emit(self, args)
    }

    fn clear(&mut self) {
        DeferredSignal::clear(self)
    }

    fn len(&self) -> usize {
        DeferredSignal::len(self)
    }
}

/// Weak handle for connecting to a [`DeferredSignal`] from inside its slots.
/// Once the signal is dropped, `connect` returns a detached token.
pub struct SignalConnector<A: ?Sized + 'static> {
    shared: Weak<DeferredShared<A>>,
}

impl<A: ?Sized + 'static> SignalConnector<A> {
    pub fn connect<F>(&self, slot: F) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        match self.shared.upgrade() {
            Some(shared) => shared.connect(slot),
            None => DisconnectToken::detached(),
        }
    }

    pub fn disconnect<T>(&self, target: &T) -> bool
    where
        T: PartialEq + 'static,
    {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.disconnect(target))
    }

    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

impl<A: ?Sized + 'static> Clone for SignalConnector<A> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<A: ?Sized + 'static> fmt::Debug for SignalConnector<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalConnector")
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(signal: &DeferredSignal<()>, hits: &Rc<Cell<u32>>) -> DisconnectToken {
        let hits = hits.clone();
        signal.connect(move |_| {
            hits.set(hits.get() + 1);
            Ok(())
        })
    }

    #[test]
    fn pending_removal_is_compacted_on_next_emit() {
        let signal = DeferredSignal::<()>::new();
        let hits = Rc::new(Cell::new(0));
        let mut first = counter(&signal, &hits);
        let _second = counter(&signal, &hits);
        signal.emit(&()).unwrap();
        assert_eq!(hits.get(), 2);

        first.disconnect();
        assert_eq!(signal.len(), 1);
        assert_eq!(signal.shared.slots.borrow().len(), 2);

        signal.emit(&()).unwrap();
        assert_eq!(hits.get(), 3);
        assert_eq!(signal.shared.slots.borrow().len(), 1);
    }

    #[test]
    fn disconnect_before_first_emit_drops_pending_add() {
        let signal = DeferredSignal::<()>::new();
        let hits = Rc::new(Cell::new(0));
        let token = counter(&signal, &hits);
        drop(token);
        assert!(signal.is_empty());

        signal.emit(&()).unwrap();
        assert_eq!(hits.get(), 0);
        assert_eq!(signal.shared.pool.borrow().live(), 0);
    }

    #[test]
    fn emit_guard_rejects_nested_entry() {
        let flag = Cell::new(false);
        let outer = EmitGuard::enter(&flag);
        assert!(outer.is_some());
        assert!(EmitGuard::enter(&flag).is_none());
        drop(outer);
        assert!(!flag.get());
        assert!(EmitGuard::enter(&flag).is_some());
    }

    #[test]
    fn emit_no_delayed_add_leaves_pending_slots_pending() {
        let signal = DeferredSignal::<()>::new();
        let hits = Rc::new(Cell::new(0));
        let _first = counter(&signal, &hits);
        signal.emit(&()).unwrap();
        assert_eq!(hits.get(), 1);

        let _second = counter(&signal, &hits);
        signal.emit_no_delayed_add(&()).unwrap();
        assert_eq!(hits.get(), 2);
        assert_eq!(signal.shared.to_add.borrow().len(), 1);

        signal.emit(&()).unwrap();
        assert_eq!(hits.get(), 4);
        assert!(signal.shared.to_add.borrow().is_empty());
    }

    #[test]
    fn flush_makes_new_slots_resident() {
        let signal = DeferredSignal::<()>::new();
        let hits = Rc::new(Cell::new(0));
        let _token = counter(&signal, &hits);
        assert!(signal.shared.slots.borrow().is_empty());
        signal.flush().unwrap();
        assert_eq!(signal.shared.slots.borrow().len(), 1);
        assert_eq!(hits.get(), 0);
    }
}
