//! Optimistic-update / realtime-sync reconciliation.
//!
//! Building blocks, bottom-up:
//! - [`debounce`]: per-key debounced writes with outcome reporting
//! - [`echo`]: telling our own change notifications from everyone else's
//! - [`listener`]: table-level subscriptions feeding external changes onward
//! - [`view`]: local state that ties the three together and refetches

pub mod debounce;
pub mod echo;
pub mod listener;
pub mod view;

pub use debounce::{DebouncedWriter, WriteOutcome, WriteReport};
pub use echo::{Disposition, EchoKey, EchoToken, EchoTracker};
pub use listener::{ChangeHandler, ListenerHandle, listen};
pub use view::{Dataset, FieldKey, SyncedView, ViewEvent, ViewOptions};
