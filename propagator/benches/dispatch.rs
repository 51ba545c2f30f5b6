use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use propagator::{task, Engine, EngineHandle, SubscriptionId};

fn noop_lcb() -> Box<dyn FnMut(&EngineHandle, SubscriptionId)> {
    Box::new(|_, _| {})
}

fn pending_task(handle: &EngineHandle) -> propagator::PublisherId {
    task(
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

/// `sub` then immediately `unsub` on a task with a single subscriber —
/// the hot path for a consumer that gives up right away (cancellation,
/// scope exit) rather than waiting on a result.
fn subscribe_cancel(c: &mut Criterion) {
    let mut group = c.benchmark_group("Subscribe/Cancel");
    group.throughput(Throughput::Elements(1));

    group.bench_function("sub then unsub, sole subscriber", |b| {
        let handle = Engine::new();
        let pub_id = pending_task(&handle);

        b.iter(|| {
            let sub_id = Engine::sub(&handle, pub_id, noop_lcb(), noop_lcb());
            Engine::unsub(&handle, black_box(sub_id));
        });
    });
}

/// Spawning a chain of nested publishers, each created from inside the
/// parent's `effect` — the path that exercises `Rank::child` growth
/// rather than the flat top-level counter.
fn rank_chain_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("Rank chain");

    for depth in [1usize, 8, 64] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_function(format!("spawn depth {depth}"), |b| {
            b.iter(|| {
                let handle = Engine::new();
                spawn_chain(&handle, black_box(depth));
            });
        });
    }
}

/// Subscribes a task whose `effect` spawns and subscribes to one more
/// link in the chain before resolving, so each link's rank is a child
/// of the one above it.
fn spawn_chain(handle: &EngineHandle, depth: usize) {
    if depth == 0 {
        return;
    }
    let remaining = Rc::new(RefCell::new(depth - 1));
    let pub_id = task(
        handle,
        || Box::new(()) as Box<dyn Any>,
        || Rc::new(()) as Rc<dyn Any>,
        |_, _| {},
        |_, _| {},
        |_, _| {},
        |_, _| {},
        move |handle, _proc_id, mut lcb, _rcb| {
            let left = *remaining.borrow();
            if left > 0 {
                spawn_chain(handle, left);
            }
            lcb(handle, Rc::new(()) as Rc<dyn Any>);
            Box::new(()) as Box<dyn Any>
        },
    );
    Engine::sub(handle, pub_id, noop_lcb(), noop_lcb());
}

/// Many independent tasks, each scheduling its own first tick from
/// inside `subscribe` (where `current_process` is already set up by
/// `sub`, once the process has a value), driven to quiescence by one
/// [`Engine::react`] call — the reactor's rank-ordered pop/dispatch
/// loop under load.
fn reactor_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("Reactor throughput");

    for count in [16u32, 256, 2048] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(format!("{count} tasks, one instant"), |b| {
            b.iter(|| {
                let handle = Engine::new();
                for _ in 0..count {
                    let pub_id = task(
                        &handle,
                        || Box::new(()) as Box<dyn Any>,
                        || Rc::new(()) as Rc<dyn Any>,
                        |_, _| {},
                        |handle, _sub_id| {
                            // `subscribe` runs after `effect`, once the
                            // process has a value — scheduling here
                            // queues onto the reacted heap instead of
                            // firing the tick inline.
                            Engine::schedule(handle);
                        },
                        |_, _| {},
                        |_, _| {},
                        |_handle, _proc_id, _lcb, _rcb| Box::new(()) as Box<dyn Any>,
                    );
                    Engine::sub(&handle, pub_id, noop_lcb(), noop_lcb());
                }
                black_box(Engine::react(&handle));
            });
        });
    }
}

criterion_group!(benches, subscribe_cancel, rank_chain_growth, reactor_throughput);
criterion_main!(benches);
