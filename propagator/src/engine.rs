//! The dispatch engine: enter/exit, propagation, the public primitives,
//! sub/unsub/accept, and the reactor.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::any::Any;
use core::cell::RefCell;

use crate::arena::Arena;
use crate::error::Error;
use crate::model::{
    BoundNotify, EffectFn, Kind, Process, ProcessCb, ProcessId, Publisher, PublisherId, RingSel,
    SubCb, Subscription, SubscriptionId,
};
use crate::rank::{Heap, Rank};
use crate::ring;

/// Shared handle onto an [`Engine`]. Deliberately `Rc`/`RefCell`, not
/// `Arc`/atomics: the engine is single-writer by design, so
/// thread-safety machinery would only promise a guarantee this type
/// does not actually provide.
pub type EngineHandle = Rc<RefCell<Engine>>;

/// Process-wide scheduling state: logical time, the currently active
/// process/subscription, the reaction cursor, and the two reactor
/// heaps.
pub struct Engine {
    publishers: Arena<Publisher>,
    processes: Arena<Process>,
    subscriptions: Arena<Subscription>,

    time: u64,
    top_level_children: u32,

    current_process: Option<ProcessId>,
    current_sub: Option<SubscriptionId>,
    /// Rank at which the current reaction began; `None` outside a
    /// reaction.
    cursor: Option<Rank>,

    reacted: Heap,
    delayed: Heap,
}

/// How many processes ticked, and how many were deferred to the next
/// instant, during a reactor sweep. The engine's one concession to
/// observability (see `SPEC_FULL.md` §9): a typed return value instead
/// of a log line, matching the teacher's general preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactStats {
    pub ticked: u32,
    pub instants_advanced: u32,
}

/// Restores `current_process`/`current_sub` and releases `held` (if this
/// frame was the one that set it) when dropped — including on unwind, so
/// a panicking user callback leaves the engine in a consistent state
/// rather than wedged mid-frame. Mirrors the teacher's
/// `UnpublishedData`/`PublishedData` drop guards in `codas-flow`.
struct ExitGuard<'a> {
    handle: &'a EngineHandle,
    pub_id: PublisherId,
    already_held: bool,
    saved_process: Option<ProcessId>,
    saved_sub: Option<SubscriptionId>,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let mut eng = self.handle.borrow_mut();
        eng.current_process = self.saved_process;
        eng.current_sub = self.saved_sub;
        if !self.already_held {
            if let Some(p) = eng.publishers.get_mut(self.pub_id) {
                p.held = false;
            }
        }
    }
}

impl Engine {
    pub fn new() -> EngineHandle {
        Rc::new(RefCell::new(Self {
            publishers: Arena::new(),
            processes: Arena::new(),
            subscriptions: Arena::new(),
            time: 0,
            top_level_children: 0,
            current_process: None,
            current_sub: None,
            cursor: None,
            reacted: Heap::new(),
            delayed: Heap::new(),
        }))
    }

    /// Derives the rank a new publisher should get, based on whichever
    /// process is currently executing.
    fn next_rank(&mut self) -> Rank {
        match self.current_process {
            Some(p) => {
                let parent_pub = self
                    .processes
                    .get(p)
                    .expect("next_rank: process missing")
                    .parent;
                let parent = self
                    .publishers
                    .get_mut(parent_pub)
                    .expect("next_rank: publisher missing");
                let child_index = parent.children;
                parent.children += 1;
                parent.rank.child(child_index)
            }
            None => {
                let idx = self.top_level_children;
                self.top_level_children += 1;
                Rank::root().child(idx)
            }
        }
    }

    /// Registers a new publisher with a freshly derived rank. Used by
    /// the `task`/`flow` constructors in the crate root.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_publisher(
        &mut self,
        kind: Kind,
        initp: Box<dyn Fn() -> Box<dyn Any>>,
        inits: Box<dyn Fn() -> Rc<dyn Any>>,
        perform: ProcessCb,
        subscribe: SubCb,
        tick: ProcessCb,
        accept: Option<SubCb>,
        reject: Option<SubCb>,
        cancel: ProcessCb,
        effect: EffectFn,
    ) -> PublisherId {
        let rank = self.next_rank();
        self.publishers.insert(Publisher {
            rank,
            kind,
            children: 0,
            initp,
            inits,
            perform,
            subscribe,
            tick,
            accept,
            reject,
            cancel,
            effect,
            held: false,
            current: None,
            prop: Vec::new(),
        })
    }

    // ---- 4.2 enter / exit --------------------------------------------------

    /// Runs `body` inside an enter/exit frame for `pub_id`: serializes
    /// re-entry via the publisher's `held` flag, and, on leaving the
    /// outermost frame for this publisher, drains its `prop` list; on
    /// leaving the outermost engine frame overall, runs the reactor.
    fn with_frame<R>(handle: &EngineHandle, pub_id: PublisherId, body: impl FnOnce(&EngineHandle) -> R) -> R {
        let (already_held, saved_process, saved_sub) = {
            let mut eng = handle.borrow_mut();
            let saved = (eng.current_process, eng.current_sub);
            let p = eng
                .publishers
                .get_mut(pub_id)
                .expect("enter: publisher missing");
            let already_held = p.held;
            p.held = true;
            (already_held, saved.0, saved.1)
        };

        // Restores `current_process`/`current_sub`/`held` even if `body`
        // unwinds, the same "bookkeeping runs on drop" idiom the teacher
        // uses for its publish/receive guards — a panicking callback
        // should not leave the engine permanently stuck mid-frame.
        let guard = ExitGuard {
            handle,
            pub_id,
            already_held,
            saved_process,
            saved_sub,
        };

        let result = body(handle);

        drop(guard);

        if !already_held {
            Self::propagate(handle, pub_id);
        }

        if handle.borrow().current_process.is_none() {
            Self::run_reactor(handle);
        }

        result
    }

    /// Drains `pub_id`'s `prop` list LIFO, invoking each subscription's
    /// `lcb`/`rcb` per its flag (§4.3). Called by `with_frame` once its
    /// own borrow has been released, since a subscription callback may
    /// re-enter the engine.
    fn propagate(handle: &EngineHandle, pub_id: PublisherId) {
        loop {
            let s_id = {
                let mut eng = handle.borrow_mut();
                let Some(p) = eng.publishers.get_mut(pub_id) else {
                    return;
                };
                match p.prop.pop() {
                    Some(s) => s,
                    None => return,
                }
            };

            let (flag, source, mut cb) = {
                let mut eng = handle.borrow_mut();
                let Some(sub) = eng.subscriptions.get_mut(s_id) else {
                    continue;
                };
                let flag = sub.flag;
                let source = sub.source;
                let placeholder: SubCb = Box::new(|_, _| {});
                let cb = if flag {
                    core::mem::replace(&mut sub.lcb, placeholder)
                } else {
                    core::mem::replace(&mut sub.rcb, placeholder)
                };
                eng.current_process = source;
                eng.current_sub = Some(s_id);
                (flag, source, cb)
            };
            let _ = source;

            cb(handle, s_id);

            let mut eng = handle.borrow_mut();
            if let Some(sub) = eng.subscriptions.get_mut(s_id) {
                if flag {
                    sub.lcb = cb;
                } else {
                    sub.rcb = cb;
                }
            }
        }
    }

    // ---- take/call/restore helpers -----------------------------------------

    /// Takes `select(publisher)` out of its slot, sets `current_process`
    /// to `proc_id` for the duration of the call (so `getp`/`setp`/
    /// `transfer`/`schedule`/`resolve` target the right process), calls
    /// it, then restores both the callback and the previous
    /// `current_process`.
    fn call_process_cb(
        handle: &EngineHandle,
        pub_id: PublisherId,
        select: impl Fn(&mut Publisher) -> &mut ProcessCb,
        proc_id: ProcessId,
    ) {
        let (mut cb, saved_process) = {
            let mut eng = handle.borrow_mut();
            let saved_process = eng.current_process;
            eng.current_process = Some(proc_id);
            let publisher = eng
                .publishers
                .get_mut(pub_id)
                .expect("call_process_cb: publisher missing");
            (core::mem::replace(select(publisher), Box::new(|_, _| {})), saved_process)
        };
        cb(handle, proc_id);
        let mut eng = handle.borrow_mut();
        eng.current_process = saved_process;
        if let Some(publisher) = eng.publishers.get_mut(pub_id) {
            *select(publisher) = cb;
        }
    }

    /// As [`Self::call_process_cb`], but for subscription-scoped
    /// callbacks (`subscribe`/`accept`/`reject`), setting `current_sub`
    /// so `gets`/`sets` target the right subscription, and also
    /// `current_process` (derived from the subscription's `target`) so
    /// `getp`/`setp` reach the process the subscription is attached to.
    fn call_sub_cb(
        handle: &EngineHandle,
        pub_id: PublisherId,
        select: impl Fn(&mut Publisher) -> &mut SubCb,
        sub_id: SubscriptionId,
    ) {
        let (mut cb, saved_sub, saved_process) = {
            let mut eng = handle.borrow_mut();
            let saved_sub = eng.current_sub;
            let saved_process = eng.current_process;
            eng.current_sub = Some(sub_id);
            eng.current_process = eng.subscriptions.get(sub_id).map(|s| s.target);
            let publisher = eng
                .publishers
                .get_mut(pub_id)
                .expect("call_sub_cb: publisher missing");
            (core::mem::replace(select(publisher), Box::new(|_, _| {})), saved_sub, saved_process)
        };
        cb(handle, sub_id);
        let mut eng = handle.borrow_mut();
        eng.current_sub = saved_sub;
        eng.current_process = saved_process;
        if let Some(publisher) = eng.publishers.get_mut(pub_id) {
            *select(publisher) = cb;
        }
    }

    fn make_bound(is_lcb: bool, kind: Kind, pub_id: PublisherId, proc_id: ProcessId) -> BoundNotify {
        match (kind, is_lcb) {
            (Kind::Task, true) => Box::new(move |handle: &EngineHandle, value: Rc<dyn Any>| {
                Self::with_frame(handle, pub_id, |handle| {
                    let mut eng = handle.borrow_mut();
                    eng.current_process = Some(proc_id);
                    eng.current_sub = None;
                    eng.success_impl(proc_id, value);
                });
            }),
            (Kind::Task, false) => Box::new(move |handle: &EngineHandle, value: Rc<dyn Any>| {
                Self::with_frame(handle, pub_id, |handle| {
                    let mut eng = handle.borrow_mut();
                    eng.current_process = Some(proc_id);
                    eng.current_sub = None;
                    eng.failure_impl(proc_id, value);
                });
            }),
            (Kind::Flow, true) => Box::new(move |handle: &EngineHandle, _value: Rc<dyn Any>| {
                Self::with_frame(handle, pub_id, |handle| {
                    let mut eng = handle.borrow_mut();
                    eng.current_process = Some(proc_id);
                    eng.current_sub = None;
                    eng.step_impl(proc_id);
                });
            }),
            (Kind::Flow, false) => Box::new(move |handle: &EngineHandle, _value: Rc<dyn Any>| {
                Self::with_frame(handle, pub_id, |handle| {
                    let mut eng = handle.borrow_mut();
                    eng.current_process = Some(proc_id);
                    eng.current_sub = None;
                    eng.done_impl(proc_id);
                });
            }),
        }
    }

    // ---- ring helpers (operate on disjoint arena fields) -------------------

    fn ring_attach(
        processes: &mut Arena<Process>,
        subs: &mut Arena<Subscription>,
        proc_id: ProcessId,
        sel: RingSel,
        s: SubscriptionId,
    ) {
        let proc = processes.get_mut(proc_id).expect("ring_attach: process missing");
        let head = match sel {
            RingSel::Waiting => &mut proc.waiting,
            RingSel::Pending => &mut proc.pending,
        };
        ring::attach(head, subs, s);
        if let Some(sub) = subs.get_mut(s) {
            sub.ring_sel = sel;
        }
    }

    fn ring_detach(
        processes: &mut Arena<Process>,
        subs: &mut Arena<Subscription>,
        proc_id: ProcessId,
        sel: RingSel,
        s: SubscriptionId,
    ) {
        let proc = processes.get_mut(proc_id).expect("ring_detach: process missing");
        let head = match sel {
            RingSel::Waiting => &mut proc.waiting,
            RingSel::Pending => &mut proc.pending,
        };
        ring::detach(head, subs, s);
    }

    fn ring_dispatch(
        processes: &mut Arena<Process>,
        subs: &mut Arena<Subscription>,
        pubs: &mut Arena<Publisher>,
        proc_id: ProcessId,
        sel: RingSel,
        s: SubscriptionId,
    ) {
        let pub_id = processes.get(proc_id).expect("ring_dispatch: process missing").parent;
        let proc = processes.get_mut(proc_id).expect("ring_dispatch: process missing");
        let head = match sel {
            RingSel::Waiting => &mut proc.waiting,
            RingSel::Pending => &mut proc.pending,
        };
        let publisher = pubs.get_mut(pub_id).expect("ring_dispatch: publisher missing");
        ring::dispatch(head, subs, &mut publisher.prop, s);
    }

    // ---- success/failure/step/done (data-only halves) ----------------------

    fn broadcast_terminal(&mut self, proc_id: ProcessId, flag: bool, value: Rc<dyn Any>) {
        let head = self.processes.get(proc_id).expect("broadcast: process missing").waiting;
        let mut ids = Vec::new();
        ring::foreach(head, &self.subscriptions, |s| ids.push(s));
        for s in ids {
            if let Some(sub) = self.subscriptions.get_mut(s) {
                sub.flag = flag;
                sub.state = Rc::clone(&value);
            }
            Self::ring_dispatch(&mut self.processes, &mut self.subscriptions, &mut self.publishers, proc_id, RingSel::Waiting, s);
        }
    }

    fn success_impl(&mut self, proc_id: ProcessId, value: Rc<dyn Any>) {
        self.broadcast_terminal(proc_id, true, value);
    }

    fn failure_impl(&mut self, proc_id: ProcessId, value: Rc<dyn Any>) {
        self.broadcast_terminal(proc_id, false, value);
    }

    fn step_impl(&mut self, proc_id: ProcessId) {
        let head = self.processes.get(proc_id).expect("step: process missing").waiting;
        let mut ids = Vec::new();
        ring::foreach(head, &self.subscriptions, |s| ids.push(s));
        for s in ids {
            if let Some(sub) = self.subscriptions.get_mut(s) {
                sub.flag = true;
            }
            Self::ring_dispatch(&mut self.processes, &mut self.subscriptions, &mut self.publishers, proc_id, RingSel::Waiting, s);
            Self::ring_attach(&mut self.processes, &mut self.subscriptions, proc_id, RingSel::Pending, s);
        }
    }

    fn done_impl(&mut self, proc_id: ProcessId) {
        let waiting_head = self.processes.get(proc_id).expect("done: process missing").waiting;
        let pending_head = self.processes.get(proc_id).expect("done: process missing").pending;
        let mut waiting_ids = Vec::new();
        ring::foreach(waiting_head, &self.subscriptions, |s| waiting_ids.push(s));
        let mut pending_ids = Vec::new();
        ring::foreach(pending_head, &self.subscriptions, |s| pending_ids.push(s));
        for s in waiting_ids {
            Self::ring_dispatch(&mut self.processes, &mut self.subscriptions, &mut self.publishers, proc_id, RingSel::Waiting, s);
        }
        for s in pending_ids {
            Self::ring_dispatch(&mut self.processes, &mut self.subscriptions, &mut self.publishers, proc_id, RingSel::Pending, s);
        }
    }

    /// Cancels the sole remaining consumer's process: clears the
    /// publisher's `current`, invokes the opaque cancellation action,
    /// then removes the process (and whatever sole subscription was
    /// still attached to it) from their arenas. This cleanup — not
    /// just clearing `current` — is what makes a repeated `unsub` or a
    /// stray `accept` on the same subscription a no-op/`Cancelled`
    /// afterward rather than re-invoking `cancel` a second time; see
    /// `DESIGN.md`.
    fn cancel_process(handle: &EngineHandle, pub_id: PublisherId, proc_id: ProcessId) {
        {
            let mut eng = handle.borrow_mut();
            let was_current = eng.publishers.get(pub_id).map(|p| p.current) == Some(Some(proc_id));
            if was_current {
                if let Some(p) = eng.publishers.get_mut(pub_id) {
                    p.current = None;
                }
            }
        }
        Self::call_process_cb(handle, pub_id, |p| &mut p.cancel, proc_id);

        let mut eng = handle.borrow_mut();
        if let Some(proc) = eng.processes.remove(proc_id) {
            let mut ids = Vec::new();
            ring::foreach(proc.waiting, &eng.subscriptions, |s| ids.push(s));
            ring::foreach(proc.pending, &eng.subscriptions, |s| ids.push(s));
            for s in ids {
                eng.subscriptions.remove(s);
            }
        }
    }

    // ---- public primitives (§4.5) ------------------------------------------

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn transfer<T: 'static>(&self) -> Option<&T> {
        let proc_id = self.current_process?;
        self.processes.get(proc_id)?.process.as_ref()?.downcast_ref::<T>()
    }

    pub fn getp<T: 'static>(&self) -> Option<&T> {
        let proc_id = self.current_process?;
        self.processes.get(proc_id)?.state.downcast_ref::<T>()
    }

    pub fn setp<T: 'static>(&mut self, value: T) {
        let proc_id = self.current_process.expect("setp: no current process");
        if let Some(proc) = self.processes.get_mut(proc_id) {
            proc.state = Box::new(value);
        }
    }

    pub fn gets<T: 'static>(&self) -> Option<Rc<T>> {
        let sub_id = self.current_sub?;
        let sub = self.subscriptions.get(sub_id)?;
        Rc::clone(&sub.state).downcast::<T>().ok()
    }

    pub fn sets<T: 'static>(&mut self, value: T) {
        let sub_id = self.current_sub.expect("sets: no current subscription");
        if let Some(sub) = self.subscriptions.get_mut(sub_id) {
            sub.state = Rc::new(value);
        }
    }

    pub fn waiting(&mut self, handle: &EngineHandle, mut f: impl FnMut(&EngineHandle, SubscriptionId)) {
        let proc_id = self.current_process.expect("waiting: no current process");
        let head = self.processes.get(proc_id).expect("waiting: process missing").waiting;
        let mut ids = Vec::new();
        ring::foreach(head, &self.subscriptions, |s| ids.push(s));
        for s in ids {
            let prev = self.current_sub;
            self.current_sub = Some(s);
            f(handle, s);
            self.current_sub = prev;
        }
    }

    pub fn pending(&mut self, handle: &EngineHandle, mut f: impl FnMut(&EngineHandle, SubscriptionId)) {
        let proc_id = self.current_process.expect("pending: no current process");
        let head = self.processes.get(proc_id).expect("pending: process missing").pending;
        let mut ids = Vec::new();
        ring::foreach(head, &self.subscriptions, |s| ids.push(s));
        for s in ids {
            let prev = self.current_sub;
            self.current_sub = Some(s);
            f(handle, s);
            self.current_sub = prev;
        }
    }

    pub fn resolve(&mut self) {
        let proc_id = self.current_process.expect("resolve: no current process");
        let pub_id = self.processes.get(proc_id).expect("resolve: process missing").parent;
        if let Some(publisher) = self.publishers.get_mut(pub_id) {
            if publisher.current == Some(proc_id) {
                publisher.current = None;
            }
        }
    }

    /// Arranges for the current process to tick (§4.5). If the process
    /// has no `process` value yet — `schedule` called from within
    /// `perform`, before `effect` has run — the tick fires immediately
    /// rather than being queued.
    pub fn schedule(handle: &EngineHandle) {
        let (proc_id, pub_id, has_value) = {
            let eng = handle.borrow();
            let proc_id = eng.current_process.expect("schedule: no current process");
            let proc = eng.processes.get(proc_id).expect("schedule: process missing");
            (proc_id, proc.parent, proc.process.is_some())
        };

        if !has_value {
            Self::call_process_cb(handle, pub_id, |p| &mut p.tick, proc_id);
            return;
        }

        let mut eng = handle.borrow_mut();
        let rank = eng.publishers.get(pub_id).expect("schedule: publisher missing").rank.clone();
        let go_reacted = eng.cursor.as_ref().map_or(true, |c| c.lt(&rank));

        let processes = &mut eng.processes;
        let publishers = &eng.publishers;
        if go_reacted {
            eng.reacted.enqueue(
                proc_id,
                &mut |p: ProcessId| &mut processes.get_mut(p).expect("heap: process missing").heap,
                &|p: ProcessId| publishers.get(p).expect("heap: publisher missing").rank.clone(),
            );
        } else {
            eng.delayed.enqueue(
                proc_id,
                &mut |p: ProcessId| &mut processes.get_mut(p).expect("heap: process missing").heap,
                &|p: ProcessId| publishers.get(p).expect("heap: publisher missing").rank.clone(),
            );
        }
    }

    // ---- 4.6 sub / unsub / accept ------------------------------------------

    /// `sub(pub, lcb, rcb)`.
    pub fn sub(handle: &EngineHandle, pub_id: PublisherId, lcb: SubCb, rcb: SubCb) -> SubscriptionId {
        let caller_process = handle.borrow().current_process;

        Self::with_frame(handle, pub_id, move |handle| {
            let existing = handle
                .borrow()
                .publishers
                .get(pub_id)
                .expect("sub: publisher missing")
                .current;

            let proc_id = match existing {
                Some(p) => p,
                None => {
                    let state = { (handle.borrow().publishers.get(pub_id).expect("sub: publisher missing").initp)() };
                    let proc_id = {
                        let mut eng = handle.borrow_mut();
                        let proc_id = eng.processes.insert(Process::new(pub_id, state));
                        eng.publishers
                            .get_mut(pub_id)
                            .expect("sub: publisher missing")
                            .current = Some(proc_id);
                        proc_id
                    };

                    Self::call_process_cb(handle, pub_id, |p| &mut p.perform, proc_id);

                    let kind = handle.borrow().publishers.get(pub_id).expect("sub: publisher missing").kind;
                    let bound_lcb = Self::make_bound(true, kind, pub_id, proc_id);
                    let bound_rcb = Self::make_bound(false, kind, pub_id, proc_id);

                    // `effect` runs with `current_process` set to the new
                    // process, same as `perform` above, so that any
                    // publisher it creates derives its rank as a child of
                    // this one rather than a fresh top-level rank.
                    let process_value = {
                        let (mut effect, saved_process) = {
                            let mut eng = handle.borrow_mut();
                            let saved_process = eng.current_process;
                            eng.current_process = Some(proc_id);
                            let publisher = eng.publishers.get_mut(pub_id).expect("sub: publisher missing");
                            (
                                core::mem::replace(&mut publisher.effect, Box::new(|_, _, _, _| Box::new(()))),
                                saved_process,
                            )
                        };
                        let value = effect(handle, proc_id, bound_lcb, bound_rcb);
                        let mut eng = handle.borrow_mut();
                        eng.current_process = saved_process;
                        if let Some(publisher) = eng.publishers.get_mut(pub_id) {
                            publisher.effect = effect;
                        }
                        value
                    };

                    if let Some(proc) = handle.borrow_mut().processes.get_mut(proc_id) {
                        proc.process = Some(process_value);
                    }

                    proc_id
                }
            };

            let state = { (handle.borrow().publishers.get(pub_id).expect("sub: publisher missing").inits)() };

            let sub_id = {
                let mut eng = handle.borrow_mut();
                eng.subscriptions.insert(Subscription {
                    source: caller_process,
                    target: proc_id,
                    lcb,
                    rcb,
                    prev: None,
                    next: None,
                    state,
                    flag: false,
                    ring_sel: RingSel::Waiting,
                })
            };

            {
                let mut eng = handle.borrow_mut();
                Self::ring_attach(&mut eng.processes, &mut eng.subscriptions, proc_id, RingSel::Waiting, sub_id);
            }

            Self::call_sub_cb(handle, pub_id, |p| &mut p.subscribe, sub_id);

            sub_id
        })
    }

    /// `unsub(sub)`: cancellation request from a consumer. Idempotent —
    /// a no-op on an already-detached or already-terminal subscription.
    pub fn unsub(handle: &EngineHandle, sub_id: SubscriptionId) {
        let pub_id = {
            let eng = handle.borrow();
            let Some(sub) = eng.subscriptions.get(sub_id) else {
                return;
            };
            let proc_id = sub.target;
            match eng.processes.get(proc_id) {
                Some(proc) => proc.parent,
                None => return,
            }
        };

        Self::with_frame(handle, pub_id, |handle| {
            let (already_detached, proc_id, kind) = {
                let eng = handle.borrow();
                match eng.subscriptions.get(sub_id) {
                    Some(sub) => (
                        sub.next.is_none(),
                        sub.target,
                        eng.publishers.get(pub_id).expect("unsub: publisher missing").kind,
                    ),
                    None => return,
                }
            };
            if already_detached {
                return;
            }

            let sole = {
                let eng = handle.borrow();
                eng.subscriptions.get(sub_id).expect("unsub: subscription missing").prev == Some(sub_id)
            };

            match kind {
                Kind::Task => {
                    if sole {
                        Self::cancel_process(handle, pub_id, proc_id);
                    } else {
                        let mut eng = handle.borrow_mut();
                        if let Some(sub) = eng.subscriptions.get_mut(sub_id) {
                            sub.flag = false;
                        }
                        Self::ring_dispatch(&mut eng.processes, &mut eng.subscriptions, &mut eng.publishers, proc_id, RingSel::Waiting, sub_id);
                    }
                }
                Kind::Flow => {
                    let ring_sel = {
                        let eng = handle.borrow();
                        eng.subscriptions.get(sub_id).expect("unsub: subscription missing").ring_sel
                    };
                    let only_ring_occupied = {
                        let eng = handle.borrow();
                        let proc = eng.processes.get(proc_id).expect("unsub: process missing");
                        match ring_sel {
                            RingSel::Waiting => proc.pending.is_none(),
                            RingSel::Pending => proc.waiting.is_none(),
                        }
                    };

                    if sole && only_ring_occupied {
                        Self::cancel_process(handle, pub_id, proc_id);
                    } else {
                        match ring_sel {
                            RingSel::Waiting => {
                                {
                                    let mut eng = handle.borrow_mut();
                                    Self::ring_detach(&mut eng.processes, &mut eng.subscriptions, proc_id, RingSel::Waiting, sub_id);
                                }
                                Self::call_sub_cb(
                                    handle,
                                    pub_id,
                                    |p| p.reject.as_mut().expect("unsub: flow publisher missing reject"),
                                    sub_id,
                                );
                            }
                            RingSel::Pending => {
                                let mut eng = handle.borrow_mut();
                                if let Some(sub) = eng.subscriptions.get_mut(sub_id) {
                                    sub.flag = true;
                                }
                                Self::ring_dispatch(&mut eng.processes, &mut eng.subscriptions, &mut eng.publishers, proc_id, RingSel::Pending, sub_id);
                            }
                        }
                    }
                }
            }
        });
    }

    /// `accept(sub)`: consumer pulling a value (dereferencing a
    /// subscription). Flows only — moves `sub` from `pending` back
    /// onto `waiting`, or, if already terminal, raises [`Error::Cancelled`].
    pub fn accept(handle: &EngineHandle, sub_id: SubscriptionId) -> Result<(), Error> {
        let pub_id = {
            let eng = handle.borrow();
            let sub = eng.subscriptions.get(sub_id).ok_or(Error::Cancelled)?;
            let proc_id = sub.target;
            eng.processes.get(proc_id).expect("accept: process missing").parent
        };

        Self::with_frame(handle, pub_id, |handle| {
            let terminal = {
                let eng = handle.borrow();
                match eng.subscriptions.get(sub_id) {
                    Some(sub) => sub.next.is_none(),
                    None => true,
                }
            };

            {
                let mut eng = handle.borrow_mut();
                if let Some(sub) = eng.subscriptions.get_mut(sub_id) {
                    sub.flag = false;
                }
            }

            if terminal {
                let mut eng = handle.borrow_mut();
                if let Some(publisher) = eng.publishers.get_mut(pub_id) {
                    publisher.prop.push(sub_id);
                }
                return Err(Error::Cancelled);
            }

            let proc_id = {
                let eng = handle.borrow();
                eng.subscriptions.get(sub_id).expect("accept: subscription missing").target
            };

            {
                let mut eng = handle.borrow_mut();
                Self::ring_detach(&mut eng.processes, &mut eng.subscriptions, proc_id, RingSel::Pending, sub_id);
                Self::ring_attach(&mut eng.processes, &mut eng.subscriptions, proc_id, RingSel::Waiting, sub_id);
            }

            Self::call_sub_cb(
                handle,
                pub_id,
                |p| p.accept.as_mut().expect("accept: task publisher has no accept"),
                sub_id,
            );

            Ok(())
        })
    }

    // ---- 4.7 the reactor ----------------------------------------------------

    fn run_reactor(handle: &EngineHandle) -> ReactStats {
        let mut stats = ReactStats::default();
        loop {
            let next = {
                let mut eng = handle.borrow_mut();
                if eng.reacted.is_empty() {
                    if eng.delayed.is_empty() {
                        eng.cursor = None;
                        eng.current_process = None;
                        break;
                    }
                    core::mem::swap(&mut eng.reacted, &mut eng.delayed);
                    eng.time += 1;
                    stats.instants_advanced += 1;
                    continue;
                }

                let processes = &mut eng.processes;
                let publishers = &eng.publishers;
                eng.reacted.dequeue(
                    &mut |p: ProcessId| &mut processes.get_mut(p).expect("reactor: process missing").heap,
                    &|p: ProcessId| publishers.get(p).expect("reactor: publisher missing").rank.clone(),
                )
            };

            let Some(proc_id) = next else { continue };

            let (pub_id, rank) = {
                let eng = handle.borrow();
                let proc = eng.processes.get(proc_id).expect("reactor: process missing");
                let rank = eng.publishers.get(proc.parent).expect("reactor: publisher missing").rank.clone();
                (proc.parent, rank)
            };

            {
                let mut eng = handle.borrow_mut();
                eng.current_process = Some(proc_id);
                eng.cursor = Some(rank);
                if let Some(p) = eng.publishers.get_mut(pub_id) {
                    p.held = true;
                }
            }

            Self::call_process_cb(handle, pub_id, |p| &mut p.tick, proc_id);
            Self::propagate(handle, pub_id);

            {
                let mut eng = handle.borrow_mut();
                if let Some(p) = eng.publishers.get_mut(pub_id) {
                    p.held = false;
                }
            }

            stats.ticked += 1;
        }
        stats
    }

    /// Drives the reactor to quiescence. Exposed directly for tests
    /// and for external re-entry points that schedule work outside any
    /// publisher frame (e.g. a timer firing).
    pub fn react(handle: &EngineHandle) -> ReactStats {
        Self::run_reactor(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn noop_sub_cb() -> SubCb {
        Box::new(|_, _| {})
    }

    /// A task whose process never resolves on its own — useful for
    /// exercising `sub`/`unsub`/scheduling without a combinator driving
    /// termination.
    fn spawn_pending_task(handle: &EngineHandle) -> PublisherId {
        crate::task(
            handle,
            || Box::new(()) as Box<dyn Any>,
            || Rc::new(()) as Rc<dyn Any>,
            |_, _| {},
            |_, _| {},
            |_, _| {},
            |_, _| {},
            |_handle, _proc_id, _lcb, _rcb| Box::new(()) as Box<dyn Any>,
        )
    }

    #[test]
    fn rank_monotonicity_for_nested_publisher() {
        let handle = Engine::new();
        let child_pub: Rc<RefCell<Option<PublisherId>>> = Rc::new(RefCell::new(None));
        let child_pub2 = Rc::clone(&child_pub);

        let outer = crate::task(
            &handle,
            || Box::new(()) as Box<dyn Any>,
            || Rc::new(()) as Rc<dyn Any>,
            |_, _| {},
            |_, _| {},
            |_, _| {},
            |_, _| {},
            move |handle, _proc_id, mut lcb, _rcb| {
                // Spawned from inside `effect`, while `outer`'s own
                // process is current — must sort strictly after it.
                let inner = spawn_pending_task(handle);
                *child_pub2.borrow_mut() = Some(inner);
                lcb(handle, Rc::new(()) as Rc<dyn Any>);
                Box::new(()) as Box<dyn Any>
            },
        );

        Engine::sub(&handle, outer, noop_sub_cb(), noop_sub_cb());

        let inner = child_pub.borrow().expect("inner publisher recorded");
        let eng = handle.borrow();
        let outer_rank = eng.publishers.get(outer).unwrap().rank.clone();
        let inner_rank = eng.publishers.get(inner).unwrap().rank.clone();
        assert!(outer_rank.lt(&inner_rank));
    }

    #[test]
    fn concurrent_subscriptions_share_one_process() {
        let handle = Engine::new();
        let pub_id = spawn_pending_task(&handle);

        let s1 = Engine::sub(&handle, pub_id, noop_sub_cb(), noop_sub_cb());
        let s2 = Engine::sub(&handle, pub_id, noop_sub_cb(), noop_sub_cb());

        let eng = handle.borrow();
        assert_eq!(
            eng.subscriptions.get(s1).unwrap().target,
            eng.subscriptions.get(s2).unwrap().target
        );
        assert!(eng.publishers.get(pub_id).unwrap().current.is_some());
    }

    #[test]
    fn unsub_twice_on_sole_subscriber_cancels_once() {
        let handle = Engine::new();
        let cancel_calls = Rc::new(RefCell::new(0u32));
        let cancel_calls2 = Rc::clone(&cancel_calls);

        let pub_id = crate::task(
            &handle,
            || Box::new(()) as Box<dyn Any>,
            || Rc::new(()) as Rc<dyn Any>,
            |_, _| {},
            |_, _| {},
            |_, _| {},
            move |_handle, _proc_id| {
                *cancel_calls2.borrow_mut() += 1;
            },
            |_handle, _proc_id, _lcb, _rcb| Box::new(()) as Box<dyn Any>,
        );

        let sub_id = Engine::sub(&handle, pub_id, noop_sub_cb(), noop_sub_cb());
        Engine::unsub(&handle, sub_id);
        Engine::unsub(&handle, sub_id);

        assert_eq!(1, *cancel_calls.borrow());
        assert!(handle.borrow().publishers.get(pub_id).unwrap().current.is_none());
    }

    #[test]
    fn accept_after_sole_cancellation_is_cancelled_error() {
        let handle = Engine::new();

        let pub_id = crate::flow(
            &handle,
            || Box::new(()) as Box<dyn Any>,
            || Rc::new(()) as Rc<dyn Any>,
            |_, _| {},
            |_, _| {},
            |_, _| {},
            |_, _| {},
            |_, _| {},
            |_, _| {},
            |_handle, _proc_id, _lcb, _rcb| Box::new(()) as Box<dyn Any>,
        );

        let sub_id = Engine::sub(&handle, pub_id, noop_sub_cb(), noop_sub_cb());
        Engine::unsub(&handle, sub_id);

        assert!(matches!(Engine::accept(&handle, sub_id), Err(Error::Cancelled)));
    }

    #[test]
    fn rank_ordered_ticks_within_one_instant() {
        let handle = Engine::new();
        let ticks: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

        let mut proc_ids = Vec::new();
        for i in 0..3u32 {
            let ticks2 = Rc::clone(&ticks);
            let pub_id = crate::task(
                &handle,
                || Box::new(()) as Box<dyn Any>,
                || Rc::new(()) as Rc<dyn Any>,
                |_, _| {},
                |_, _| {},
                move |_handle, _proc_id| {
                    ticks2.borrow_mut().push(i);
                },
                |_, _| {},
                |_handle, _proc_id, _lcb, _rcb| Box::new(()) as Box<dyn Any>,
            );
            Engine::sub(&handle, pub_id, noop_sub_cb(), noop_sub_cb());
            let proc_id = handle.borrow().publishers.get(pub_id).unwrap().current.unwrap();
            proc_ids.push(proc_id);
        }

        // Schedule in reverse creation order; the reactor must still
        // tick strictly in ascending (== creation) rank order.
        for &proc_id in proc_ids.iter().rev() {
            handle.borrow_mut().current_process = Some(proc_id);
            Engine::schedule(&handle);
        }
        handle.borrow_mut().current_process = None;

        Engine::run_reactor(&handle);

        assert_eq!(vec![0, 1, 2], *ticks.borrow());
    }

    #[test]
    fn instant_boundary_defers_same_rank_reschedule() {
        let handle = Engine::new();
        let ticks: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
        let ticks2 = Rc::clone(&ticks);

        // Reschedules itself on every tick; each re-schedule happens
        // while `cursor` already equals this publisher's own rank, so
        // it must always land in the *next* logical instant.
        let pub_id = crate::task(
            &handle,
            || Box::new(()) as Box<dyn Any>,
            || Rc::new(()) as Rc<dyn Any>,
            |_, _| {},
            |_, _| {},
            move |handle, _proc_id| {
                let time = handle.borrow().time();
                ticks2.borrow_mut().push(time);
                if time < 2 {
                    Engine::schedule(handle);
                }
            },
            |_, _| {},
            |_handle, _proc_id, _lcb, _rcb| Box::new(()) as Box<dyn Any>,
        );

        Engine::sub(&handle, pub_id, noop_sub_cb(), noop_sub_cb());
        let proc_id = handle.borrow().publishers.get(pub_id).unwrap().current.unwrap();

        handle.borrow_mut().current_process = Some(proc_id);
        Engine::schedule(&handle);
        handle.borrow_mut().current_process = None;

        let stats = Engine::run_reactor(&handle);

        assert_eq!(vec![0, 1, 2], *ticks.borrow());
        assert_eq!(3, stats.ticked);
        assert_eq!(2, stats.instants_advanced);
    }

    #[test]
    fn lifo_notify_order_for_broadcast_step() {
        let handle = Engine::new();
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let stored_lcb: Rc<RefCell<Option<BoundNotify>>> = Rc::new(RefCell::new(None));
        let stored_lcb2 = Rc::clone(&stored_lcb);

        let pub_id = crate::flow(
            &handle,
            || Box::new(()) as Box<dyn Any>,
            || Rc::new(()) as Rc<dyn Any>,
            |_, _| {},
            |_, _| {},
            |_, _| {},
            |_, _| {},
            |_, _| {},
            |_, _| {},
            move |_handle, _proc_id, lcb, _rcb| {
                *stored_lcb2.borrow_mut() = Some(lcb);
                Box::new(()) as Box<dyn Any>
            },
        );

        let order_a = Rc::clone(&order);
        let order_b = Rc::clone(&order);
        Engine::sub(
            &handle,
            pub_id,
            Box::new(move |_: &EngineHandle, _| order_a.borrow_mut().push("a")),
            noop_sub_cb(),
        );
        Engine::sub(
            &handle,
            pub_id,
            Box::new(move |_: &EngineHandle, _| order_b.borrow_mut().push("b")),
            noop_sub_cb(),
        );

        let mut lcb = stored_lcb.borrow_mut().take().expect("effect stored its lcb");
        lcb(&handle, Rc::new(()) as Rc<dyn Any>);

        // Both subs were dispatched (pushed to `prop`) in attach order
        // (a, then b); LIFO drain means b's notification fires first.
        assert_eq!(vec!["b", "a"], *order.borrow());
    }

    #[test]
    fn flow_step_then_accept_then_done_lifecycle() {
        let handle = Engine::new();
        let stored: Rc<RefCell<Option<(BoundNotify, BoundNotify)>>> = Rc::new(RefCell::new(None));
        let stored2 = Rc::clone(&stored);
        let accepted = Rc::new(RefCell::new(0u32));
        let accepted2 = Rc::clone(&accepted);
        let consumer_done = Rc::new(RefCell::new(false));
        let consumer_done2 = Rc::clone(&consumer_done);

        let pub_id = crate::flow(
            &handle,
            || Box::new(0i32) as Box<dyn Any>,
            || Rc::new(()) as Rc<dyn Any>,
            |_, _| {},
            |_, _| {},
            |_, _| {},
            move |handle, _sub_id| {
                let mut eng = handle.borrow_mut();
                let current: i32 = *eng.getp::<i32>().unwrap();
                eng.setp(current + 1);
                *accepted2.borrow_mut() += 1;
            },
            |_, _| {},
            |_, _| {},
            move |_handle, _proc_id, lcb, rcb| {
                *stored2.borrow_mut() = Some((lcb, rcb));
                Box::new(()) as Box<dyn Any>
            },
        );

        let consumer_lcb: SubCb = Box::new(|_, _| {});
        let rcb_flag = Rc::clone(&consumer_done);
        let consumer_rcb: SubCb = Box::new(move |_, _| {
            *rcb_flag.borrow_mut() = true;
        });
        let sub_id = Engine::sub(&handle, pub_id, consumer_lcb, consumer_rcb);

        let (mut step, mut done) = stored.borrow_mut().take().expect("effect stored its bound callbacks");

        step(&handle, Rc::new(()) as Rc<dyn Any>);
        assert!(Engine::accept(&handle, sub_id).is_ok());
        assert_eq!(1, *accepted.borrow());

        done(&handle, Rc::new(()) as Rc<dyn Any>);
        assert!(*consumer_done2.borrow());
    }
}
