//! A cooperative user-space threading runtime: many lightweight fibers
//! multiplexed onto one kernel thread, with non-blocking I/O integrated
//! through epoll readiness notifications.
//!
//! The runtime is built for high-fan-out network servers where thousands
//! of logically blocking call sites must be served without a kernel
//! thread each. A fiber that would block parks itself on a waiting
//! structure (the sleep heap, the I/O queue, or a wait queue) and yields;
//! the scheduler resumes the next runnable fiber, and a dedicated idle
//! fiber waits on the event backend whenever nothing is runnable.
//!
//! ```no_run
//! strand::init().unwrap();
//!
//! let worker = strand::spawn(|| {
//!     strand::usleep(10_000).unwrap();
//!     42u32
//! })
//! .unwrap();
//!
//! assert_eq!(worker.join().unwrap(), 42);
//! ```
//!
//! Everything is single-threaded and cooperative: exactly one fiber runs
//! at a time, there is no preemption, and scheduling is strict FIFO. All
//! handles and operations are local to the thread that called [`init`].

mod arena;
mod clist;
mod context;
mod error;
mod events;
mod fiber;
pub mod fls;
mod net;
mod sched;
mod stack;
mod sync;
mod time;
mod timeheap;

pub use error::{Error, Result};

pub use events::PollFd;
pub use nix::poll::PollFlags;

pub use fiber::{
    active_count, current, exit, interrupt, spawn, spawn_detached, Builder, Fiber, JoinHandle,
    DEFAULT_STACK_SIZE,
};

pub use sched::{init, poll};

pub use stack::{free_stack_count, randomize_stacks};

pub use sync::{Cond, Mutex};

pub use time::{
    last_clock_us, now_seconds, now_us, set_time_source, sleep, time_cache, usleep, NO_TIMEOUT,
};

pub use fls::Key;

pub use net::{fd_limit, NetFd};
