//! Fiber records and the public fiber-control surface.

use core::any::Any;
use core::marker::PhantomData;
use std::rc::Rc;

use bitflags::bitflags;

use crate::arena::Id;
use crate::clist::{NodeIdx, NODE_NONE};
use crate::context::FiberContext;
use crate::error::{Error, Result};
use crate::fls::KEYS_MAX;
use crate::sched;
use crate::stack::Stack;
use crate::sync::CondId;

/// Default usable stack capacity for a new fiber.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub(crate) struct FiberFlags: u32 {
        /// The initial user thread that called `init`; runs on the OS stack.
        const PRIMORDIAL = 1 << 0;
        /// The dedicated event-dispatch fiber; not counted as active.
        const IDLE = 1 << 1;
        /// Reachable from the sleep-heap root.
        const ON_SLEEP_HEAP = 1 << 2;
        /// `interrupt` was called; the next parking call observes and
        /// clears this.
        const INTERRUPTED = 1 << 3;
        /// A timed condition wait expired; observed and cleared on resume.
        const TIMED_OUT = 1 << 4;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FiberState {
    Running,
    Runnable,
    IoWait,
    LockWait,
    CondWait,
    Sleeping,
    Zombie,
    Suspended,
}

pub(crate) type FiberId = Id<FiberEntry>;

/// Everything the runtime tracks per fiber. Lives in the fiber arena; the
/// stack is owned here and handed back to the pool when the fiber ends.
pub(crate) struct FiberEntry {
    pub state: FiberState,
    pub flags: FiberFlags,

    /// Entry closure, taken exactly once when the fiber first runs.
    pub entry: Option<Box<dyn FnOnce() -> Box<dyn Any>>>,
    /// Type-erased return value, set at exit and taken by the joiner.
    pub retval: Option<Box<dyn Any>>,

    /// None for the primordial fiber, which runs on the OS-provided stack.
    pub stack: Option<Stack>,

    /// Link node for the run/zombie queues.
    pub links: NodeIdx,
    /// Link node for mutex/condvar wait queues.
    pub wait_links: NodeIdx,

    // Sleep-heap bookkeeping: absolute deadline, insertion sequence for
    // FIFO tie-breaking, tree children and 1-based breadth-first index.
    pub due: u64,
    pub seq: u64,
    pub left: Option<FiberId>,
    pub right: Option<FiberId>,
    pub heap_index: u32,

    /// Fiber-local storage slots.
    pub fls: [Option<Rc<dyn Any>>; KEYS_MAX],

    /// Termination condition variable; present iff the fiber is joinable.
    pub term: Option<CondId>,

    pub ctx: FiberContext,
}

impl FiberEntry {
    pub fn new(state: FiberState) -> Self {
        Self {
            state,
            flags: FiberFlags::empty(),
            entry: None,
            retval: None,
            stack: None,
            links: NODE_NONE,
            wait_links: NODE_NONE,
            due: 0,
            seq: 0,
            left: None,
            right: None,
            heap_index: 0,
            fls: core::array::from_fn(|_| None),
            term: None,
            ctx: FiberContext::new(),
        }
    }
}

/// Opaque handle to a fiber, valid for the lifetime of that fiber.
/// Operations through a handle to a finished fiber fail or no-op; they are
/// never undefined.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Fiber(pub(crate) FiberId);

/// Configures and spawns fibers.
pub struct Builder {
    stack_size: usize,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Usable stack capacity; rounded up to a whole number of pages.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = if bytes == 0 { DEFAULT_STACK_SIZE } else { bytes };
        self
    }

    /// Spawns a joinable fiber. The returned handle must be joined for the
    /// fiber's resources to be reclaimed promptly; an unjoined fiber stays
    /// a zombie.
    pub fn spawn<T, F>(self, f: F) -> Result<JoinHandle<T>>
    where
        T: 'static,
        F: FnOnce() -> T + 'static,
    {
        let entry: Box<dyn FnOnce() -> Box<dyn Any>> = Box::new(move || Box::new(f()));
        let id = sched::create_fiber(entry, true, self.stack_size)?;
        Ok(JoinHandle {
            fiber: Fiber(id),
            _marker: PhantomData,
        })
    }

    /// Spawns a detached fiber; its return value is discarded.
    pub fn spawn_detached<F>(self, f: F) -> Result<Fiber>
    where
        F: FnOnce() + 'static,
    {
        let entry: Box<dyn FnOnce() -> Box<dyn Any>> = Box::new(move || {
            f();
            Box::new(())
        });
        let id = sched::create_fiber(entry, false, self.stack_size)?;
        Ok(Fiber(id))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns a joinable fiber with the default stack size.
pub fn spawn<T, F>(f: F) -> Result<JoinHandle<T>>
where
    T: 'static,
    F: FnOnce() -> T + 'static,
{
    Builder::new().spawn(f)
}

/// Spawns a detached fiber with the default stack size.
pub fn spawn_detached<F>(f: F) -> Result<Fiber>
where
    F: FnOnce() + 'static,
{
    Builder::new().spawn_detached(f)
}

/// Handle for retrieving a joinable fiber's return value.
pub struct JoinHandle<T> {
    fiber: Fiber,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> JoinHandle<T> {
    pub fn fiber(&self) -> Fiber {
        self.fiber
    }

    /// Parks the caller until the fiber terminates, then reaps it and
    /// returns its value.
    ///
    /// Fails `Deadlock` on self-join and `InvalidArg` when the target is
    /// already reaped or its value has the wrong type (a fiber that
    /// panicked stores its panic payload as the value).
    pub fn join(self) -> Result<T> {
        let retval = sched::join_fiber(self.fiber.0)?;
        match retval.downcast::<T>() {
            Ok(v) => Ok(*v),
            Err(_) => Err(Error::InvalidArg),
        }
    }
}

/// Handle of the calling fiber.
pub fn current() -> Fiber {
    Fiber(sched::current_fiber())
}

/// Interrupts a fiber. A parked target is made runnable and its parking
/// call fails `Interrupted`; a running or runnable target fails its next
/// parking call instead. Interrupting a zombie or finished fiber is a
/// no-op.
pub fn interrupt(fiber: Fiber) {
    sched::interrupt_fiber(fiber.0);
}

/// Terminates the calling fiber with the given return value.
///
/// The fiber's stack is abandoned, not unwound: values alive on it are
/// leaked, as with the classic longjmp-style thread exit. Returning from
/// the entry closure is the clean way out.
pub fn exit<T: 'static>(value: T) -> ! {
    sched::exit_fiber(Box::new(value))
}

/// Number of fibers that have not yet terminated, including the primordial
/// one and excluding the idle fiber. The process exits when this reaches
/// zero.
pub fn active_count() -> usize {
    sched::active_count()
}
