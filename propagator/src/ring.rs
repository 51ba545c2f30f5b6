//! Intrusive, doubly-linked circular rings over subscriptions.
//!
//! Each process keeps two such rings (`waiting`, `pending`); both share
//! this same topology, so one set of operations serves both. A ring is
//! addressed by a `&mut Option<SubscriptionId>` head slot that lives in
//! the owning [`crate::model::Process`] — the caller always knows which
//! ring (and therefore which head) it means to operate on.

use crate::arena::Arena;
use crate::model::{Subscription, SubscriptionId};

/// Inserts `s` immediately before `*head` (i.e. as the new tail). If
/// the ring is empty, `s` becomes a singleton ring pointing to itself.
pub fn attach(head: &mut Option<SubscriptionId>, subs: &mut Arena<Subscription>, s: SubscriptionId) {
    match *head {
        None => {
            let node = subs.get_mut(s).expect("attach: subscription missing");
            node.prev = Some(s);
            node.next = Some(s);
            *head = Some(s);
        }
        Some(h) => {
            let tail = subs.get(h).expect("attach: head missing").prev.expect("ring malformed: head.prev is nil");
            subs.get_mut(tail).expect("attach: tail missing").next = Some(s);
            subs.get_mut(h).expect("attach: head missing").prev = Some(s);
            let node = subs.get_mut(s).expect("attach: subscription missing");
            node.prev = Some(tail);
            node.next = Some(h);
        }
    }
}

/// Removes `s` from its ring and clears its links. If `s` was `*head`,
/// updates `*head` to the next element, or to `None` if `s` was the
/// sole member.
pub fn detach(head: &mut Option<SubscriptionId>, subs: &mut Arena<Subscription>, s: SubscriptionId) {
    let (prev, next) = {
        let node = subs.get(s).expect("detach: subscription missing");
        (node.prev, node.next)
    };
    let Some(prev) = prev else {
        // Already detached (attach always sets both prev/next together).
        return;
    };
    let next = next.expect("ring malformed: prev set but next nil");

    if prev == s {
        // Singleton ring.
        *head = None;
    } else {
        subs.get_mut(prev).expect("detach: prev missing").next = Some(next);
        subs.get_mut(next).expect("detach: next missing").prev = Some(prev);
        if *head == Some(s) {
            *head = Some(next);
        }
    }

    let node = subs.get_mut(s).expect("detach: subscription missing");
    node.prev = None;
    node.next = None;
}

/// Removes `s` from `*head`'s ring, then appends it to `prop` — the
/// owning publisher's notification queue.
pub fn dispatch(
    head: &mut Option<SubscriptionId>,
    subs: &mut Arena<Subscription>,
    prop: &mut alloc::vec::Vec<SubscriptionId>,
    s: SubscriptionId,
) {
    detach(head, subs, s);
    prop.push(s);
}

/// Invokes `f` once per subscription in `head`'s ring, in insertion
/// order, tolerating `f` detaching the current node (the iterator
/// reads the next link before calling `f`).
pub fn foreach<F>(head: Option<SubscriptionId>, subs: &Arena<Subscription>, mut f: F)
where
    F: FnMut(SubscriptionId),
{
    let Some(head) = head else { return };
    let mut cur = head;
    loop {
        let next = subs.get(cur).expect("foreach: node missing").next;
        f(cur);
        match next {
            Some(n) if n != head => cur = n,
            _ => break,
        }
    }
}
