//! Error kinds raised to consumers and combinators.
//!
//! `ProtocolMisuse` (pulling with nothing available, emitting outside a
//! step callback) is deliberately absent: the engine never defends
//! against it, in debug builds or otherwise — surfacing it as a variant,
//! or gating it behind a `debug_assert!`, would promise a check the
//! engine does not perform. Misuse corrupts ring state instead of
//! raising an error, the same tradeoff the teacher makes with its own
//! unchecked buffer accessors in `codas-flow/src/lib.rs`.

use alloc::boxed::Box;

use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    /// A consumer pulled from (or was notified through) a subscription
    /// that had already been cancelled or had terminated.
    #[snafu(display("subscription was cancelled"))]
    Cancelled,

    /// A user-supplied callback panicked or returned an error. Carries
    /// the boxed source error, re-raised only after the enclosing
    /// engine frame has finished its `exit` bookkeeping.
    #[snafu(display("user callback failed: {source}"))]
    UserError {
        source: Box<dyn core::error::Error + Send + 'static>,
    },
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
