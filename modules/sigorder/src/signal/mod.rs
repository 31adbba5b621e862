//! Single-group slot registries.
//!
//! Two registries share the [`SlotRegistry`] interface and differ in what a
//! callback may do while `emit` runs:
//!
//! - [`FastSignal`]: nothing. Emit never mutates, so nested emits are fine and
//!   the fast path carries no bookkeeping.
//! - [`DeferredSignal`]: callbacks may connect and disconnect any slot,
//!   including their own. Additions and compaction wait for the next emit.

mod deferred;
mod fast;

pub use deferred::{DeferredSignal, SignalConnector};
pub(crate) use deferred::EmitGuard;
pub use fast::FastSignal;

use crate::callable::SlotResult;
use crate::error::EmitError;
use crate::token::DisconnectToken;

pub trait SlotRegistry<A: ?Sized + 'static> {
    /// Register `slot`. It stays connected until the returned token is
    /// dropped or disconnected, or the registry is cleared or dropped.
    fn connect<F>(&mut self, slot: F) -> DisconnectToken
    where
        F: Fn(&A) -> SlotResult + 'static;

    /// Disconnect the first slot whose stored callable is a `T` equal to
    /// `target`. Returns whether one was found.
    fn disconnect<T>(&mut self, target: &T) -> bool
    where
        T: PartialEq + 'static;

    /// Invoke every connected slot once. All slots run even when some fail;
    /// the failures are returned together afterwards.
    fn emit(&self, args: &A) -> Result<(), EmitError>;

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Search from both ends at once. Registries are used both FIFO and LIFO, so
/// neither end is the better starting point.
pub(crate) fn position_two_way<T>(items: &[T], mut matches: impl FnMut(&T) -> bool) -> Option<usize> {
    let mut low = 0;
    let mut high = items.len();
    if high % 2 == 1 {
        if matches(&items[low]) {
            return Some(low);
        }
        low += 1;
    }
    while low < high {
        if matches(&items[low]) {
            return Some(low);
        }
        if matches(&items[high - 1]) {
            return Some(high - 1);
        }
        low += 1;
        high -= 1;
    }
    None
}
