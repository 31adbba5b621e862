use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::callable::{holds, Callback, SlotResult};
use crate::error::{EmitError, SlotFailure};
use crate::id::{IdPool, SlotId};
use crate::signal::{position_two_way, SlotRegistry};
use crate::token::{DisconnectToken, Unregister};

/// Registry for slots that never touch the signal while it emits.
///
/// `emit` takes `&self` and only reads, so a callback may emit the same signal
/// again. Mutation needs `&mut self`, which the borrow checker already keeps
/// out of callbacks. The one remaining path, dropping a token of this signal
/// from inside one of its own callbacks, panics.
pub struct FastSignal<A: ?Sized + 'static> {
    inner: Rc<RefCell<FastSlots<A>>>,
}

struct FastSlots<A: ?Sized> {
    callbacks: Vec<Box<dyn Callback<A>>>,
    ids: Vec<SlotId>,
    pool: IdPool,
}

impl<A: ?Sized> FastSlots<A> {
    fn remove_at(&mut self, index: usize) -> Box<dyn Callback<A>> {
        let id = self.ids.swap_remove(index);
        self.pool.release(id);
        self.callbacks.swap_remove(index)
    }
}

impl<A: ?Sized + 'static> Unregister for RefCell<FastSlots<A>> {
    fn unregister(&self, id: SlotId) {
        // Dropped after the borrow ends: the callable may own tokens of its own.
        let removed = {
            let Ok(mut slots) = self.try_borrow_mut() else {
                panic!(
                    "FastSignal slot {id} disconnected while the signal was emitting; \
                     use DeferredSignal for slots that disconnect during emit"
                );
            };
            position_two_way(&slots.ids, |&slot| slot == id).map(|index| slots.remove_at(index))
        };
        drop(removed);
    }
}

impl<A: ?Sized + 'static> FastSignal<A> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(FastSlots {
                callbacks: Vec::with_capacity(capacity),
                ids: Vec::with_capacity(capacity),
                pool: IdPool::default(),
            })),
        }
    }

    pub fn connect<F>(&mut self, slot: F) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        let id = {
            let mut slots = self.inner.borrow_mut();
            let id = slots.pool.acquire();
            slots.callbacks.push(Box::new(slot));
            slots.ids.push(id);
            id
        };
        DisconnectToken::new(self.owner(), id)
    }

    pub fn disconnect<T>(&mut self, target: &T) -> bool
    where
        T: PartialEq + 'static,
    {
        let removed = {
            let mut slots = self.inner.borrow_mut();
            position_two_way(&slots.callbacks, |callback| holds(callback.as_ref(), target))
                .map(|index| slots.remove_at(index))
        };
        removed.is_some()
    }

    pub fn emit(&self, args: &A) -> Result<(), EmitError> {
        let mut failures = Vec::new();
        self.fire(args, |slot, error| {
            tracing::debug!(slot = %slot, error = %error, "Slot failed");
            failures.push(SlotFailure {
                key: (),
                slot,
                error,
            });
        });
        EmitError::from_failures(failures)
    }

    pub fn clear(&mut self) {
        let removed = {
            let mut slots = self.inner.borrow_mut();
            let FastSlots {
                callbacks,
                ids,
                pool,
            } = &mut *slots;
            for id in ids.drain(..) {
                pool.release(id);
            }
            std::mem::take(callbacks)
        };
        drop(removed);
    }

    pub fn reserve(&mut self, additional: usize) {
        let mut slots = self.inner.borrow_mut();
        slots.callbacks.reserve(additional);
        slots.ids.reserve(additional);
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every slot, reporting failures to `on_failure` as they happen.
    pub(crate) fn fire(&self, args: &A, mut on_failure: impl FnMut(SlotId, anyhow::Error)) {
        let slots = self.inner.borrow();
        for (callback, &id) in slots.callbacks.iter().zip(&slots.ids) {
            if let Err(error) = callback.invoke(args) {
                on_failure(id, error);
            }
        }
    }

    fn owner(&self) -> Weak<dyn Unregister> {
        Rc::downgrade(&self.inner) as Weak<dyn Unregister>
    }
}

impl<A: ?Sized + 'static> Default for FastSignal<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: ?Sized + 'static> fmt::Debug for FastSignal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastSignal").field("slots", &self.len()).finish()
    }
}

impl<A: ?Sized + 'static> SlotRegistry<A> for FastSignal<A> {
    fn connect<F>(&mut self, slot: F) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static,
    {
        FastSignal::connect(self, slot)
    }

    fn disconnect<T>(&mut self, target: &T) -> bool
    where
        T: PartialEq + 'static,
    {
        FastSignal::disconnect(self, target)
    }

    fn emit(&self, args: &A) -> Result<(), EmitError> {
        FastSignal::emit(self, args)
    }

    fn clear(&mut self) {
        FastSignal::clear(self)
    }

    fn len(&self) -> usize {
        FastSignal::len(self)
    }
}
