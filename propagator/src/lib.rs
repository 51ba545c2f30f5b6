#![cfg_attr(not(test), no_std)]
// Use the README file as the root-level
// docs for this library.
#![doc = include_str!("../README.md")]

extern crate alloc;

use alloc::boxed::Box;
use alloc::rc::Rc;
use core::any::Any;

pub mod arena;
pub mod engine;
pub mod error;
pub mod model;
pub mod rank;
pub mod ring;

pub use engine::{Engine, EngineHandle, ReactStats};
pub use error::Error;
pub use model::{BoundNotify, Kind, ProcessId, PublisherId, SubscriptionId};

/// Registers a single-shot publisher: one that resolves to success or
/// failure exactly once and has no `accept`/`reject` pull surface.
///
/// Thin wrapper over [`Engine::new_publisher`] — see the crate docs for
/// what each callback is invoked with and when.
#[allow(clippy::too_many_arguments)]
pub fn task(
    handle: &EngineHandle,
    initp: impl Fn() -> Box<dyn Any> + 'static,
    inits: impl Fn() -> Rc<dyn Any> + 'static,
    perform: impl FnMut(&EngineHandle, ProcessId) + 'static,
    subscribe: impl FnMut(&EngineHandle, SubscriptionId) + 'static,
    tick: impl FnMut(&EngineHandle, ProcessId) + 'static,
    cancel: impl FnMut(&EngineHandle, ProcessId) + 'static,
    effect: impl FnMut(&EngineHandle, ProcessId, BoundNotify, BoundNotify) -> Box<dyn Any> + 'static,
) -> PublisherId {
    handle.borrow_mut().new_publisher(
        Kind::Task,
        Box::new(initp),
        Box::new(inits),
        Box::new(perform),
        Box::new(subscribe),
        Box::new(tick),
        None,
        None,
        Box::new(cancel),
        Box::new(effect),
    )
}

/// Registers a multi-value publisher: one whose consumers pull values
/// one at a time via `accept`, and may be told `reject` when a pulled
/// value turns out to be unusable.
#[allow(clippy::too_many_arguments)]
pub fn flow(
    handle: &EngineHandle,
    initp: impl Fn() -> Box<dyn Any> + 'static,
    inits: impl Fn() -> Rc<dyn Any> + 'static,
    perform: impl FnMut(&EngineHandle, ProcessId) + 'static,
    subscribe: impl FnMut(&EngineHandle, SubscriptionId) + 'static,
    tick: impl FnMut(&EngineHandle, ProcessId) + 'static,
    accept: impl FnMut(&EngineHandle, SubscriptionId) + 'static,
    reject: impl FnMut(&EngineHandle, SubscriptionId) + 'static,
    cancel: impl FnMut(&EngineHandle, ProcessId) + 'static,
    effect: impl FnMut(&EngineHandle, ProcessId, BoundNotify, BoundNotify) -> Box<dyn Any> + 'static,
) -> PublisherId {
    handle.borrow_mut().new_publisher(
        Kind::Flow,
        Box::new(initp),
        Box::new(inits),
        Box::new(perform),
        Box::new(subscribe),
        Box::new(tick),
        Some(Box::new(accept)),
        Some(Box::new(reject)),
        Box::new(cancel),
        Box::new(effect),
    )
}
