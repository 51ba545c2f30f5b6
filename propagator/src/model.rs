//! Publisher, Process, and Subscription: the three arena-resident node
//! kinds the engine schedules and dispatches between.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::any::Any;

use crate::arena::Id;
use crate::engine::EngineHandle;
use crate::rank::{HeapLinks, Rank};

pub type PublisherId = Id<Publisher>;
pub type ProcessId = Id<Process>;
pub type SubscriptionId = Id<Subscription>;

/// Tags a publisher's callback vtable as a single-shot task or a
/// multi-value flow, replacing subclassing with a plain enum per the
/// design notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Task,
    Flow,
}

/// Which of a process's two rings a subscription currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingSel {
    Waiting,
    Pending,
}

/// Invoked with the process/subscription it concerns. Used for
/// `perform`, `tick`, `cancel` (process-scoped) and `subscribe`,
/// `accept`, `reject`, and the per-subscription `lcb`/`rcb` consumer
/// sinks (subscription-scoped) alike — one callback shape keeps the
/// public constructor surface from needing a generic parameter per
/// slot (see `DESIGN.md`, Open Question 3).
pub type ProcessCb = Box<dyn FnMut(&EngineHandle, ProcessId)>;
pub type SubCb = Box<dyn FnMut(&EngineHandle, SubscriptionId)>;

/// The publisher's own success/failure or step/done sink, bound to a
/// specific process and handed to `effect` as the means by which the
/// combinator's underlying computation reports progress. Carries the
/// delivered value (ignored by flow publishers' step/done, which read
/// state back out via `transfer`/`gets`).
pub type BoundNotify = Box<dyn FnMut(&EngineHandle, Rc<dyn Any>)>;

/// Produces the process's opaque driving value: invoked once, with the
/// two bound notification sinks, when a publisher's process is freshly
/// allocated. The returned value is read back later via `transfer`.
pub type EffectFn =
    Box<dyn FnMut(&EngineHandle, ProcessId, BoundNotify, BoundNotify) -> Box<dyn Any>>;

/// Immutable shape of a reactive node: its rank, its callback vtable,
/// and (at most one at a time) the process currently running it.
pub struct Publisher {
    pub rank: Rank,
    pub kind: Kind,
    pub children: u32,

    pub initp: Box<dyn Fn() -> Box<dyn Any>>,
    pub inits: Box<dyn Fn() -> Rc<dyn Any>>,

    pub perform: ProcessCb,
    pub subscribe: SubCb,
    pub tick: ProcessCb,
    /// `None` for `Kind::Task`; always `Some` for `Kind::Flow`.
    pub accept: Option<SubCb>,
    /// `None` for `Kind::Task`; always `Some` for `Kind::Flow`.
    pub reject: Option<SubCb>,
    /// Tells the combinator's underlying computation to stop. Not a
    /// named slot in the original callback table, but required to make
    /// "invoke the opaque process's cancellation action" concrete —
    /// see `DESIGN.md`.
    pub cancel: ProcessCb,

    pub effect: EffectFn,

    pub held: bool,
    pub current: Option<ProcessId>,

    /// Subscriptions awaiting delivery, most-recently-dispatched first.
    pub prop: Vec<SubscriptionId>,
}

/// A running instance of a publisher.
pub struct Process {
    pub parent: PublisherId,
    pub state: Box<dyn Any>,
    /// The opaque value returned by `effect`; cleared by `resolve` to
    /// mark the process as terminated and unable to be re-entered.
    pub process: Option<Box<dyn Any>>,

    pub waiting: Option<SubscriptionId>,
    pub pending: Option<SubscriptionId>,

    pub heap: HeapLinks,
}

impl Process {
    pub fn new(parent: PublisherId, state: Box<dyn Any>) -> Self {
        Self {
            parent,
            state,
            process: None,
            waiting: None,
            pending: None,
            heap: HeapLinks::default(),
        }
    }
}

/// A consumer's handle onto a running process.
pub struct Subscription {
    /// The process that caused this subscribe — used to restore
    /// `context.process` to the right consumer frame on delivery.
    pub source: Option<ProcessId>,
    /// The process of the subscribed publisher.
    pub target: ProcessId,

    pub lcb: SubCb,
    pub rcb: SubCb,

    pub prev: Option<SubscriptionId>,
    pub next: Option<SubscriptionId>,

    /// Shared because a single notification broadcasts the same value
    /// to every subscription in a ring at once (see `DESIGN.md`).
    pub state: Rc<dyn Any>,
    pub flag: bool,
    pub ring_sel: RingSel,
}
