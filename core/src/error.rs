//! Error kinds for the connection-tracking core.
//!
//! One `thiserror`-derived enum, following the per-module pattern the rest
//! of the ambient stack uses elsewhere in this codebase (a single typed
//! error with a `#[error("...")]` message per variant). Every creation-path
//! failure unwinds earlier successful steps in reverse order before
//! returning one of these; timer-phase errors (`Busy`, `NotExist`) are never
//! surfaced to a caller outside the expiration engine, which turns them
//! into local retries.

use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnError {
    /// The flow allocator's pool (and per-core cache) is exhausted.
    #[error("flow allocator exhausted")]
    NoMem,

    /// The destination has reached `max_conn`.
    #[error("destination overloaded")]
    Overload,

    /// The destination's forwarding mode is not recognized.
    #[error("unsupported forwarding mode")]
    NotSupp,

    /// A flow that is already hashed was hashed again.
    #[error("flow already hashed")]
    Exist,

    /// Unhash was attempted while refcount != 2; caller should retry later.
    #[error("flow busy, refcount > 2")]
    Busy,

    /// Unhash (or a lookup) was attempted on a flow that isn't hashed.
    #[error("flow not hashed")]
    NotExist,

    /// The owning core (or table) has not been enabled.
    #[error("core disabled")]
    Disabled,
}
