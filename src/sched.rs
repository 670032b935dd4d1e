//! The virtual processor: fiber arena, scheduler queues, the schedule
//! loop, the idle fiber, and the parking primitives that cooperate with
//! them.
//!
//! Everything in here is single-threaded state. Exactly one fiber is
//! running at any time and only the running fiber mutates the queues, so
//! no internal locking exists; the one discipline that matters is that the
//! runtime borrow is never held across a context switch.

use core::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::arena::{Arena, Id};
use crate::clist::{Clist, NodeIdx, NODE_NONE};
use crate::context::{strand_context_swap, FiberContext};
use crate::error::{Error, Result};
use crate::events::{EpollSystem, EventSystem, PollFd};
use crate::fiber::{FiberEntry, FiberFlags, FiberId, FiberState, DEFAULT_STACK_SIZE};
use crate::fls::{Destructor, KEYS_MAX};
use crate::net;
use crate::stack::{page_size, StackPool};
use crate::sync::{self, CondEntry};
use crate::time::{self, NO_TIMEOUT};
use crate::timeheap::SleepHeap;

/// The scheduler runs user closures only through fiber entry points, so a
/// small private stack suffices for the loop itself.
const SCHED_STACK_SIZE: usize = 64 * 1024;

/// What a link node is attached to. Queue sentinels own themselves.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Owner {
    Sentinel,
    Fiber(FiberId),
    Poll(PollId),
}

/// A parked `poll` call: the requesting fiber and its descriptor set. The
/// record owns a copy of the caller's array; the backend fills in revents
/// and the caller copies them back when it resumes.
pub(crate) struct PollEntry {
    pub node: NodeIdx,
    pub fiber: FiberId,
    pub pds: Vec<PollFd>,
    pub on_ioq: bool,
}

pub(crate) type PollId = Id<PollEntry>;

/// All mutable runtime state except the event backend. The backend gets a
/// `&mut VpCore` during dispatch, which is the one place the two halves
/// genuinely need each other.
pub(crate) struct VpCore {
    pub fibers: Arena<FiberEntry>,
    pub conds: Arena<CondEntry>,
    pub mutexes: Arena<crate::sync::MutexEntry>,
    pub polls: Arena<PollEntry>,

    pub links: Clist<Owner>,
    pub run_q: NodeIdx,
    pub io_q: NodeIdx,
    pub zombie_q: NodeIdx,

    pub sleep: SleepHeap,
    pub sleep_seq: u64,

    pub cur: FiberId,
    pub idle: FiberId,
    pub active_count: usize,

    pub last_clock: u64,
    pub pagesize: usize,

    pub stacks: StackPool,
    pub randomize: bool,

    pub sched_ctx: FiberContext,
    #[allow(dead_code)]
    pub sched_stack: crate::stack::Stack,

    /// Fiber whose record is freed by the scheduler on the next pass; set
    /// by the exit protocol, which is still executing on state the record
    /// owns when it makes its final switch.
    pub to_reap: Option<FiberId>,

    pub fls_destructors: [Option<Destructor>; KEYS_MAX],
    pub fls_key_count: usize,

    pub osfd_limit: usize,
}

pub(crate) struct Vp {
    pub core: VpCore,
    pub evsys: Box<dyn EventSystem>,
}

thread_local! {
    static VP: RefCell<Option<Vp>> = RefCell::new(None);
}

pub(crate) fn with_vp<R>(f: impl FnOnce(&mut Vp) -> R) -> R {
    VP.with(|cell| {
        let mut slot = cell.borrow_mut();
        let vp = slot
            .as_mut()
            .expect("the fiber runtime is not initialized on this thread (call init first)");
        f(vp)
    })
}

pub(crate) fn runtime_active() -> bool {
    VP.with(|cell| cell.borrow().is_some())
}

impl VpCore {
    fn runq_append(&mut self, fid: FiberId) {
        let node = self.fibers.get(fid).expect("fiber").links;
        self.links.append(node, self.run_q);
    }

    pub(crate) fn add_sleep_q(&mut self, fid: FiberId, timeout_us: u64) {
        let due = self.last_clock.saturating_add(timeout_us);
        let seq = self.sleep_seq;
        self.sleep_seq += 1;
        {
            let e = self.fibers.get_mut(fid).expect("fiber");
            e.due = due;
            e.seq = seq;
            e.flags.insert(FiberFlags::ON_SLEEP_HEAP);
        }
        self.sleep.insert(&mut self.fibers, fid);
    }

    pub(crate) fn del_sleep_q(&mut self, fid: FiberId) {
        self.sleep.delete(&mut self.fibers, fid);
        self.fibers
            .get_mut(fid)
            .expect("fiber")
            .flags
            .remove(FiberFlags::ON_SLEEP_HEAP);
    }

    /// Makes a parked fiber runnable, detaching it from the sleep heap if
    /// it carries a deadline.
    pub(crate) fn wake(&mut self, fid: FiberId) {
        if self
            .fibers
            .get(fid)
            .expect("fiber")
            .flags
            .contains(FiberFlags::ON_SLEEP_HEAP)
        {
            self.del_sleep_q(fid);
        }
        self.fibers.get_mut(fid).expect("fiber").state = FiberState::Runnable;
        self.runq_append(fid);
    }

    /// Deadline of the earliest sleeper, if any.
    pub(crate) fn sleep_root_due(&self) -> Option<u64> {
        self.sleep
            .root
            .map(|r| self.fibers.get(r).expect("sleep heap root").due)
    }

    /// Refreshes the clock and wakes every fiber whose deadline passed.
    pub(crate) fn check_clock(&mut self) {
        let now = time::now_us();
        self.last_clock = now;
        time::refresh_seconds_cache(now);

        while let Some(root) = self.sleep.root {
            {
                let e = self.fibers.get(root).expect("sleep heap root");
                debug_assert!(e.flags.contains(FiberFlags::ON_SLEEP_HEAP));
                if e.due > now {
                    break;
                }
            }
            self.del_sleep_q(root);
            {
                let e = self.fibers.get_mut(root).expect("sleep heap root");
                debug_assert!(!e.flags.contains(FiberFlags::IDLE));
                if e.state == FiberState::CondWait {
                    e.flags.insert(FiberFlags::TIMED_OUT);
                }
                e.state = FiberState::Runnable;
            }
            self.runq_append(root);
        }
    }

    fn reap(&mut self, fid: FiberId) {
        if let Some(e) = self.fibers.remove(fid) {
            self.links.release(e.links);
            self.links.release(e.wait_links);
            if let Some(cv) = e.term {
                if let Some(c) = self.conds.remove(cv) {
                    self.links.release(c.wait_q);
                }
            }
        }
    }
}

/// Initializes the runtime on the calling thread and adopts the caller as
/// the primordial fiber. Idempotent.
pub fn init() -> Result<()> {
    if runtime_active() {
        return Ok(());
    }

    let page = page_size();
    // The epoll backend imposes no fd limit of its own, so the rlimit
    // negotiation runs against an unlimited backend.
    let osfd_limit = net::io_init(0)?;
    let evsys: Box<dyn EventSystem> = Box::new(EpollSystem::create(osfd_limit)?);
    log::debug!(
        "{} event backend ready, fd limit {}",
        evsys.name(),
        osfd_limit
    );

    let mut fibers = Arena::new();
    let mut links = Clist::new();
    let run_q = links.alloc(Owner::Sentinel);
    let io_q = links.alloc(Owner::Sentinel);
    let zombie_q = links.alloc(Owner::Sentinel);

    let mut primordial = FiberEntry::new(FiberState::Running);
    primordial.flags.insert(FiberFlags::PRIMORDIAL);
    let prim_id = fibers.insert(primordial);
    let l = links.alloc(Owner::Fiber(prim_id));
    let w = links.alloc(Owner::Fiber(prim_id));
    {
        let e = fibers.get_mut(prim_id).expect("primordial fiber");
        e.links = l;
        e.wait_links = w;
    }

    let mut stacks = StackPool::new();
    let sched_stack = stacks.acquire(round_pages(SCHED_STACK_SIZE, page), page, false)?;
    let mut sched_ctx = FiberContext::new();
    unsafe { sched_ctx.prepare(sched_stack.top(), sched_main) };

    let core = VpCore {
        fibers,
        conds: Arena::new(),
        mutexes: Arena::new(),
        polls: Arena::new(),
        links,
        run_q,
        io_q,
        zombie_q,
        sleep: SleepHeap::new(),
        sleep_seq: 0,
        cur: prim_id,
        idle: prim_id,
        active_count: 1,
        last_clock: time::now_us(),
        pagesize: page,
        stacks,
        randomize: false,
        sched_ctx,
        sched_stack,
        to_reap: None,
        fls_destructors: [None; KEYS_MAX],
        fls_key_count: 0,
        osfd_limit,
    };

    VP.with(|cell| *cell.borrow_mut() = Some(Vp { core, evsys }));

    let idle = match create_fiber(
        Box::new(|| -> Box<dyn Any> { idle_loop() }),
        false,
        DEFAULT_STACK_SIZE,
    ) {
        Ok(id) => id,
        Err(err) => {
            VP.with(|cell| *cell.borrow_mut() = None);
            return Err(err);
        }
    };

    with_vp(|vp| {
        let core = &mut vp.core;
        core.fibers
            .get_mut(idle)
            .expect("idle fiber")
            .flags
            .insert(FiberFlags::IDLE);
        // The idle fiber does not count as active and never sits on the
        // run queue; the scheduler resumes it directly when the queue is
        // empty.
        core.active_count -= 1;
        let node = core.fibers.get(idle).expect("idle fiber").links;
        core.links.remove(node);
        core.idle = idle;
    });

    log::debug!("fiber runtime initialized (page {} bytes)", page);
    Ok(())
}

fn round_pages(bytes: usize, page: usize) -> usize {
    (bytes + page - 1) / page * page
}

/// Saves the current fiber and resumes the scheduler. Returns when the
/// scheduler switches back into this fiber.
pub(crate) fn switch_to_scheduler() {
    let (save, restore) = with_vp(|vp| {
        let me = vp.core.cur;
        let ctx = &mut vp.core.fibers.get_mut(me).expect("current fiber").ctx;
        (
            ctx as *mut FiberContext,
            &vp.core.sched_ctx as *const FiberContext,
        )
    });
    unsafe { strand_context_swap(save, restore) };
}

extern "C" fn sched_main() -> ! {
    enum Next {
        Run(*mut FiberContext, *const FiberContext),
        Shutdown,
    }

    loop {
        let next = with_vp(|vp| {
            let core = &mut vp.core;
            if let Some(dead) = core.to_reap.take() {
                core.reap(dead);
            }
            if core.active_count == 0 {
                return Next::Shutdown;
            }
            let fid = match core.links.head(core.run_q) {
                Some(node) => {
                    core.links.remove(node);
                    match core.links.owner(node) {
                        Owner::Fiber(f) => f,
                        other => unreachable!("run queue holds fibers, found {:?}", other),
                    }
                }
                None => core.idle,
            };
            {
                let e = core.fibers.get_mut(fid).expect("next fiber");
                debug_assert_eq!(e.state, FiberState::Runnable);
                e.state = FiberState::Running;
            }
            core.cur = fid;
            let restore = &core.fibers.get(fid).expect("next fiber").ctx as *const FiberContext;
            Next::Run(&mut core.sched_ctx as *mut FiberContext, restore)
        });

        match next {
            Next::Run(save, restore) => unsafe { strand_context_swap(save, restore) },
            Next::Shutdown => std::process::exit(0),
        }
    }
}

/// Body of the idle fiber: wait for readiness or the next deadline, wake
/// what became due, then hand the processor back.
///
/// Idle never sits on the run queue. The scheduler resumes it only when
/// nothing else is runnable; were idle queued like a regular fiber, a
/// fiber woken by `signal` could end up queued behind it while the next
/// dispatch blocks indefinitely.
fn idle_loop() -> ! {
    loop {
        with_vp(|vp| {
            let Vp { core, evsys } = vp;
            evsys.dispatch(core);
            core.check_clock();
            let me = core.cur;
            debug_assert_eq!(me, core.idle);
            core.fibers.get_mut(me).expect("idle fiber").state = FiberState::Runnable;
        });
        switch_to_scheduler();
    }
}

pub(crate) fn create_fiber(
    entry: Box<dyn FnOnce() -> Box<dyn Any>>,
    joinable: bool,
    stack_size: usize,
) -> Result<FiberId> {
    with_vp(|vp| {
        let core = &mut vp.core;
        let size = round_pages(
            if stack_size == 0 {
                DEFAULT_STACK_SIZE
            } else {
                stack_size
            },
            core.pagesize,
        );
        let stack = core.stacks.acquire(size, core.pagesize, core.randomize)?;

        let mut fe = FiberEntry::new(FiberState::Runnable);
        fe.entry = Some(entry);
        unsafe { fe.ctx.prepare(stack.top(), fiber_main) };
        fe.stack = Some(stack);

        let fid = core.fibers.insert(fe);
        let l = core.links.alloc(Owner::Fiber(fid));
        let w = core.links.alloc(Owner::Fiber(fid));
        {
            let e = core.fibers.get_mut(fid).expect("new fiber");
            e.links = l;
            e.wait_links = w;
        }

        if joinable {
            let wait_q = core.links.alloc(Owner::Sentinel);
            let cv = core.conds.insert(CondEntry { wait_q });
            core.fibers.get_mut(fid).expect("new fiber").term = Some(cv);
        }

        core.active_count += 1;
        core.links.append(l, core.run_q);
        Ok(fid)
    })
}

/// First frame of every fiber: run the entry closure, catch panics at the
/// fiber boundary, then run the exit protocol.
extern "C" fn fiber_main() -> ! {
    let entry = with_vp(|vp| {
        let me = vp.core.cur;
        vp.core
            .fibers
            .get_mut(me)
            .expect("current fiber")
            .entry
            .take()
    })
    .expect("fiber entry already consumed");

    let retval: Box<dyn Any> = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry)) {
        Ok(value) => value,
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "non-string panic payload".to_string()
            };
            log::error!("fiber panicked: {}", msg);
            payload
        }
    };

    exit_protocol(retval)
}

/// The exit path shared by normal return and explicit exit: run the
/// fiber-local destructors, park as a zombie until reaped when joinable,
/// release the stack, and make the final switch.
pub(crate) fn exit_protocol(retval: Box<dyn Any>) -> ! {
    let cleanups = with_vp(|vp| {
        let core = &mut vp.core;
        let dtors = core.fls_destructors;
        let count = core.fls_key_count;
        let me = core.cur;
        let e = core.fibers.get_mut(me).expect("current fiber");
        let mut out: Vec<(Destructor, Rc<dyn Any>)> = Vec::new();
        for key in 0..count {
            if let Some(value) = e.fls[key].take() {
                if let Some(dtor) = dtors[key] {
                    out.push((dtor, value));
                }
            }
        }
        out
    });
    for (dtor, value) in cleanups {
        dtor(value);
    }

    let joinable = with_vp(|vp| {
        let core = &mut vp.core;
        let me = core.cur;
        core.fibers.get_mut(me).expect("current fiber").retval = Some(retval);
        core.active_count -= 1;
        let term = core.fibers.get(me).expect("current fiber").term;
        match term {
            Some(cv) => {
                core.fibers.get_mut(me).expect("current fiber").state = FiberState::Zombie;
                let node = core.fibers.get(me).expect("current fiber").links;
                core.links.append(node, core.zombie_q);
                // Wake a joiner before yielding; it observes the zombie
                // state once it runs.
                sync::signal_core(core, cv, false);
                true
            }
            None => false,
        }
    });

    if joinable {
        switch_to_scheduler();
        // Reaped. The joiner took the return value and requeued us for
        // this final leg; the termination condvar has no more users.
        with_vp(|vp| {
            let core = &mut vp.core;
            let me = core.cur;
            if let Some(cv) = core.fibers.get_mut(me).expect("current fiber").term.take() {
                if let Some(c) = core.conds.remove(cv) {
                    core.links.release(c.wait_q);
                }
            }
        });
    }

    with_vp(|vp| {
        let core = &mut vp.core;
        let me = core.cur;
        let e = core.fibers.get_mut(me).expect("current fiber");
        if !e.flags.contains(FiberFlags::PRIMORDIAL) {
            // Running on this stack is still fine: it stays mapped on the
            // free list and nothing can take it before the switch below.
            if let Some(stack) = e.stack.take() {
                core.stacks.release(stack);
            }
        }
        core.to_reap = Some(me);
    });
    switch_to_scheduler();
    unreachable!("terminated fiber was resumed");
}

pub(crate) fn exit_fiber(retval: Box<dyn Any>) -> ! {
    exit_protocol(retval)
}

pub(crate) fn join_fiber(target: FiberId) -> Result<Box<dyn Any>> {
    let term = with_vp(|vp| {
        let core = &mut vp.core;
        let e = core.fibers.get(target).ok_or(Error::InvalidArg)?;
        let term = e.term.ok_or(Error::InvalidArg)?;
        if target == core.cur {
            return Err(Error::Deadlock);
        }
        let wait_q = core.conds.get(term).ok_or(Error::InvalidArg)?.wait_q;
        if !core.links.is_empty(wait_q) {
            return Err(Error::InvalidArg);
        }
        Ok(term)
    })?;

    loop {
        let zombie = with_vp(|vp| {
            vp.core
                .fibers
                .get(target)
                .map(|e| e.state == FiberState::Zombie)
        })
        .ok_or(Error::InvalidArg)?;
        if zombie {
            break;
        }
        sync::cond_wait_us(term, None)?;
    }

    with_vp(|vp| {
        let core = &mut vp.core;
        let retval = {
            let e = core.fibers.get_mut(target).expect("zombie fiber");
            e.state = FiberState::Runnable;
            e.retval.take()
        };
        // Requeue the zombie so it can run its final cleanup leg.
        let node = core.fibers.get(target).expect("zombie fiber").links;
        core.links.remove(node);
        core.links.append(node, core.run_q);
        Ok(retval.unwrap_or_else(|| Box::new(())))
    })
}

pub(crate) fn interrupt_fiber(target: FiberId) {
    with_vp(|vp| {
        let core = &mut vp.core;
        let (state, on_heap) = match core.fibers.get_mut(target) {
            Some(e) => {
                if e.state == FiberState::Zombie {
                    return;
                }
                e.flags.insert(FiberFlags::INTERRUPTED);
                (e.state, e.flags.contains(FiberFlags::ON_SLEEP_HEAP))
            }
            None => return,
        };
        // A running or runnable target just carries the flag to its next
        // parking call.
        if matches!(state, FiberState::Running | FiberState::Runnable) {
            return;
        }
        if on_heap {
            core.del_sleep_q(target);
        }
        core.fibers.get_mut(target).expect("fiber").state = FiberState::Runnable;
        core.runq_append(target);
    })
}

pub(crate) fn current_fiber() -> FiberId {
    with_vp(|vp| vp.core.cur)
}

pub(crate) fn active_count() -> usize {
    with_vp(|vp| vp.core.active_count)
}

/// Parks the calling fiber with or without a deadline (`usleep` backend).
pub(crate) fn park_sleep(timeout: Option<u64>) -> Result<()> {
    with_vp(|vp| {
        let core = &mut vp.core;
        let me = core.cur;
        {
            let e = core.fibers.get_mut(me).expect("current fiber");
            if e.flags.contains(FiberFlags::INTERRUPTED) {
                e.flags.remove(FiberFlags::INTERRUPTED);
                return Err(Error::Interrupted);
            }
        }
        match timeout {
            Some(us) => {
                core.fibers.get_mut(me).expect("current fiber").state = FiberState::Sleeping;
                core.add_sleep_q(me, us);
            }
            None => {
                core.fibers.get_mut(me).expect("current fiber").state = FiberState::Suspended;
            }
        }
        Ok(())
    })?;

    switch_to_scheduler();

    with_vp(|vp| {
        let e = vp
            .core
            .fibers
            .get_mut(vp.core.cur)
            .expect("current fiber");
        if e.flags.contains(FiberFlags::INTERRUPTED) {
            e.flags.remove(FiberFlags::INTERRUPTED);
            return Err(Error::Interrupted);
        }
        Ok(())
    })
}

/// Parks the calling fiber until one of `pds` is ready, the timeout
/// elapses, or the fiber is interrupted. Returns the number of
/// descriptors with non-empty revents; zero means the timeout elapsed.
///
/// This is the only entrypoint by which a fiber awaits fd readiness; the
/// I/O wrappers are retry loops over it.
pub fn poll(pds: &mut [PollFd], timeout_us: u64) -> Result<usize> {
    let pid = with_vp(|vp| -> Result<PollId> {
        let Vp { core, evsys } = vp;
        let me = core.cur;
        {
            let e = core.fibers.get_mut(me).expect("current fiber");
            if e.flags.contains(FiberFlags::INTERRUPTED) {
                e.flags.remove(FiberFlags::INTERRUPTED);
                return Err(Error::Interrupted);
            }
        }
        evsys.pollset_add(pds)?;

        let staged = pds
            .iter()
            .map(|pd| PollFd::new(pd.fd, pd.events))
            .collect::<Vec<_>>();
        let pid = core.polls.insert(PollEntry {
            node: NODE_NONE,
            fiber: me,
            pds: staged,
            on_ioq: true,
        });
        let node = core.links.alloc(Owner::Poll(pid));
        core.polls.get_mut(pid).expect("poll entry").node = node;
        core.links.append(node, core.io_q);

        if timeout_us != NO_TIMEOUT {
            core.add_sleep_q(me, timeout_us);
        }
        core.fibers.get_mut(me).expect("current fiber").state = FiberState::IoWait;
        Ok(pid)
    })?;

    switch_to_scheduler();

    with_vp(|vp| {
        let Vp { core, evsys } = vp;
        let me = core.cur;
        let entry = core.polls.remove(pid).expect("poll entry");
        if entry.on_ioq {
            // Woken by timeout or interrupt: the backend never saw this
            // request fire, so take it off the queue and drop interest.
            core.links.remove(entry.node);
            evsys.pollset_del(&entry.pds);
        }
        core.links.release(entry.node);

        let mut ready = 0;
        for (dst, src) in pds.iter_mut().zip(entry.pds.iter()) {
            dst.revents = src.revents;
            if !src.revents.is_empty() {
                ready += 1;
            }
        }

        let e = core.fibers.get_mut(me).expect("current fiber");
        if e.flags.contains(FiberFlags::INTERRUPTED) {
            e.flags.remove(FiberFlags::INTERRUPTED);
            return Err(Error::Interrupted);
        }
        Ok(ready)
    })
}
