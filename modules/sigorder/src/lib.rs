//! Dependency-ordered signal dispatch.
//!
//! Callbacks ("slots") are connected under keys, keys declare which other
//! keys must run before them, and one `emit` fires every slot in an order
//! that respects every declared dependency.
//!
//! Two flavours of everything:
//!
//! - Fast: [`FastSignal`], [`SortedSignal`]. Emit never mutates; slots cannot
//!   restructure the dispatcher while it fires.
//! - Deferred: [`DeferredSignal`], [`DeferredSortedSignal`]. Slots may connect
//!   and disconnect anything (themselves included) and add dependencies
//!   mid-emit. Those changes take effect at the next emit.
//!
//! Every `connect` returns a [`DisconnectToken`] that disconnects on drop and
//! turns into a no-op once its dispatcher is gone.
//!
//! Single-threaded: nothing here is `Send` or `Sync`.

pub mod callable;
pub mod config;
pub mod error;
pub mod graph;
pub mod id;
pub mod signal;
pub mod sorted;
pub mod token;
pub mod typed;

pub use callable::{Callback, SlotResult};
pub use config::{DispatcherConfig, SortPolicy};
pub use error::{CircularDependencyError, ConfigError, EmitError, SlotFailure};
pub use graph::DependencyGraph;
pub use id::SlotId;
pub use signal::{DeferredSignal, FastSignal, SignalConnector, SlotRegistry};
pub use sorted::{DeferredSortedSignal, KeyedDispatch, SortedConnector, SortedSignal};
pub use token::{DisconnectToken, Disconnector};
pub use typed::{DeferredTypeSortedSignal, TypeConnector, TypeKey, TypeSortedSignal};
