//! Disconnect handles.
//!
//! A token holds the slot's id and a `Weak` pointer to the registry state that
//! owns the slot. The registry keeps the only strong reference, so once it is
//! dropped every outstanding token quietly turns into a no-op.

use std::fmt;
use std::rc::Weak;

use crate::id::SlotId;

/// Implemented by registry state that tokens can call back into.
pub(crate) trait Unregister {
    fn unregister(&self, id: SlotId);
}

struct Binding {
    owner: Weak<dyn Unregister>,
    id: SlotId,
}

impl Binding {
    fn disconnect(self) {
        match self.owner.upgrade() {
            Some(owner) => owner.unregister(self.id),
            None => tracing::trace!(slot = %self.id, "Disconnect token outlived its signal"),
        }
    }
}

/// Returned by every `connect`. Disconnects its slot when dropped, so binding
/// it to `_` disconnects immediately.
#[must_use = "dropping a DisconnectToken disconnects the slot immediately"]
pub struct DisconnectToken {
    binding: Option<Binding>,
}

impl DisconnectToken {
    pub(crate) fn new(owner: Weak<dyn Unregister>, id: SlotId) -> Self {
        Self {
            binding: Some(Binding { owner, id }),
        }
    }

    /// A token bound to nothing. Connecting through a connector whose signal
    /// is already gone yields one of these.
    pub fn detached() -> Self {
        Self { binding: None }
    }

    /// Disconnect now. Later calls, and the eventual drop, do nothing.
    pub fn disconnect(&mut self) {
        if let Some(binding) = self.binding.take() {
            binding.disconnect();
        }
    }

    /// Stop disconnecting on drop. The returned handle can still disconnect
    /// the slot later; ignoring it keeps the slot connected for the lifetime
    /// of its signal.
    pub fn release(mut self) -> Disconnector {
        Disconnector {
            binding: self.binding.take(),
        }
    }

    /// Id of the slot this token controls, if it has not disconnected yet.
    pub fn slot(&self) -> Option<SlotId> {
        self.binding.as_ref().map(|binding| binding.id)
    }

    /// True while the token is armed and its signal still exists.
    pub fn is_connected(&self) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|binding| binding.owner.strong_count() > 0)
    }
}

impl Default for DisconnectToken {
    fn default() -> Self {
        Self::detached()
    }
}

impl Drop for DisconnectToken {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for DisconnectToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisconnectToken")
            .field("slot", &self.slot())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// A released token. Does nothing on drop.
#[must_use = "a Disconnector does nothing unless `disconnect` is called"]
pub struct Disconnector {
    binding: Option<Binding>,
}

impl Disconnector {
    pub fn disconnect(self) {
        if let Some(binding) = self.binding {
            binding.disconnect();
        }
    }
}

impl fmt::Debug for Disconnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disconnector")
            .field("slot", &self.binding.as_ref().map(|binding| binding.id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        removed: RefCell<Vec<SlotId>>,
    }

    impl Unregister for Recorder {
        fn unregister(&self, id: SlotId) {
            self.removed.borrow_mut().push(id);
        }
    }

    fn token_for(recorder: &Rc<Recorder>, index: u32) -> DisconnectToken {
        let owner: Weak<dyn Unregister> = Rc::downgrade(recorder) as Weak<dyn Unregister>;
        DisconnectToken::new(owner, SlotId::new(index, 0))
    }

    #[test]
    fn drop_unregisters_once() {
        let recorder = Rc::new(Recorder::default());
        let mut token = token_for(&recorder, 3);
        token.disconnect();
        token.disconnect();
        drop(token);
        assert_eq!(*recorder.removed.borrow(), vec![SlotId::new(3, 0)]);
    }

    #[test]
    fn released_token_does_nothing_until_asked() {
        let recorder = Rc::new(Recorder::default());
        let disconnector = token_for(&recorder, 1).release();
        assert!(recorder.removed.borrow().is_empty());

        disconnector.disconnect();
        assert_eq!(*recorder.removed.borrow(), vec![SlotId::new(1, 0)]);
    }

    #[test]
    fn expired_owner_is_silent() {
        let recorder = Rc::new(Recorder::default());
        let token = token_for(&recorder, 0);
        drop(recorder);
        assert!(!token.is_connected());
        drop(token);
    }

    #[test]
    fn detached_token_is_inert() {
        let mut token = DisconnectToken::detached();
        assert!(token.slot().is_none());
        assert!(!token.is_connected());
        token.disconnect();
    }
}
