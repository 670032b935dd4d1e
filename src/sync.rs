//! Condition variables and the ownership-handoff mutex.
//!
//! Both are thin layers over the scheduler queues. A condition variable is
//! nothing but a wait queue; within a single-threaded scheduler the check
//! of a condition and the subsequent `wait` are atomic as long as the
//! caller parks nowhere in between, so no mutex coupling exists. The mutex
//! hands ownership directly to the longest-waiting fiber on unlock, which
//! rules out barging.

use crate::arena::Id;
use crate::clist::NodeIdx;
use crate::error::{Error, Result};
use crate::fiber::{FiberFlags, FiberId, FiberState};
use crate::sched::{switch_to_scheduler, with_vp, Owner, VpCore};
use crate::time::NO_TIMEOUT;

pub(crate) struct CondEntry {
    pub wait_q: NodeIdx,
}

pub(crate) type CondId = Id<CondEntry>;

pub(crate) struct MutexEntry {
    pub owner: Option<FiberId>,
    pub wait_q: NodeIdx,
}

pub(crate) type MutexId = Id<MutexEntry>;

/// Wakes the first (or, for broadcast, every) fiber on the wait queue
/// whose state is COND_WAIT. Entries stay on the queue until the woken
/// fiber resumes and unlinks itself, so the waker never touches the
/// waiter's sync linkage.
pub(crate) fn signal_core(core: &mut VpCore, cv: CondId, broadcast: bool) {
    let wait_q = match core.conds.get(cv) {
        Some(c) => c.wait_q,
        None => return,
    };
    let mut node = core.links.next(wait_q);
    while node != wait_q {
        let next = core.links.next(node);
        if let Owner::Fiber(fid) = core.links.owner(node) {
            let state = core.fibers.get(fid).expect("condvar waiter").state;
            if state == FiberState::CondWait {
                core.wake(fid);
                if !broadcast {
                    return;
                }
            }
        }
        node = next;
    }
}

/// Parks the current fiber on `cv`, optionally bounded by a deadline.
pub(crate) fn cond_wait_us(cv: CondId, timeout: Option<u64>) -> Result<()> {
    with_vp(|vp| {
        let core = &mut vp.core;
        let wait_q = core.conds.get(cv).ok_or(Error::InvalidArg)?.wait_q;
        let me = core.cur;
        {
            let e = core.fibers.get_mut(me).expect("current fiber");
            if e.flags.contains(FiberFlags::INTERRUPTED) {
                e.flags.remove(FiberFlags::INTERRUPTED);
                return Err(Error::Interrupted);
            }
            e.state = FiberState::CondWait;
        }
        let wnode = core.fibers.get(me).expect("current fiber").wait_links;
        core.links.append(wnode, wait_q);
        if let Some(us) = timeout {
            core.add_sleep_q(me, us);
        }
        Ok(())
    })?;

    switch_to_scheduler();

    with_vp(|vp| {
        let core = &mut vp.core;
        let me = core.cur;
        let wnode = core.fibers.get(me).expect("current fiber").wait_links;
        core.links.remove(wnode);

        let e = core.fibers.get_mut(me).expect("current fiber");
        let flags = e.flags;
        e.flags.remove(FiberFlags::INTERRUPTED | FiberFlags::TIMED_OUT);
        if flags.contains(FiberFlags::INTERRUPTED) {
            Err(Error::Interrupted)
        } else if flags.contains(FiberFlags::TIMED_OUT) {
            Err(Error::TimedOut)
        } else {
            Ok(())
        }
    })
}

/// Condition variable handle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Cond(CondId);

impl Cond {
    pub fn new() -> Result<Cond> {
        with_vp(|vp| {
            let core = &mut vp.core;
            let wait_q = core.links.alloc(Owner::Sentinel);
            Ok(Cond(core.conds.insert(CondEntry { wait_q })))
        })
    }

    /// Fails `Busy` while fibers are still waiting. After a successful
    /// destroy every further use of the handle fails `InvalidArg`.
    pub fn destroy(&self) -> Result<()> {
        with_vp(|vp| {
            let core = &mut vp.core;
            let wait_q = core.conds.get(self.0).ok_or(Error::InvalidArg)?.wait_q;
            if !core.links.is_empty(wait_q) {
                return Err(Error::Busy);
            }
            let entry = core.conds.remove(self.0).expect("condvar");
            core.links.release(entry.wait_q);
            Ok(())
        })
    }

    /// Parks until signaled or interrupted.
    pub fn wait(&self) -> Result<()> {
        cond_wait_us(self.0, None)
    }

    /// Parks until signaled, interrupted, or `usecs` elapse.
    pub fn timed_wait(&self, usecs: u64) -> Result<()> {
        let timeout = if usecs == NO_TIMEOUT { None } else { Some(usecs) };
        cond_wait_us(self.0, timeout)
    }

    /// Wakes the front waiter.
    pub fn signal(&self) -> Result<()> {
        with_vp(|vp| {
            let core = &mut vp.core;
            if core.conds.get(self.0).is_none() {
                return Err(Error::InvalidArg);
            }
            signal_core(core, self.0, false);
            Ok(())
        })
    }

    /// Wakes every waiter, in wait-queue insertion order.
    pub fn broadcast(&self) -> Result<()> {
        with_vp(|vp| {
            let core = &mut vp.core;
            if core.conds.get(self.0).is_none() {
                return Err(Error::InvalidArg);
            }
            signal_core(core, self.0, true);
            Ok(())
        })
    }
}

/// Non-recursive FIFO mutex with ownership handoff.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Mutex(MutexId);

impl Mutex {
    pub fn new() -> Result<Mutex> {
        with_vp(|vp| {
            let core = &mut vp.core;
            let wait_q = core.links.alloc(Owner::Sentinel);
            Ok(Mutex(core.mutexes.insert(MutexEntry {
                owner: None,
                wait_q,
            })))
        })
    }

    /// Fails `Busy` while the mutex is held or contended.
    pub fn destroy(&self) -> Result<()> {
        with_vp(|vp| {
            let core = &mut vp.core;
            let entry = core.mutexes.get(self.0).ok_or(Error::InvalidArg)?;
            if entry.owner.is_some() || !core.links.is_empty(entry.wait_q) {
                return Err(Error::Busy);
            }
            let entry = core.mutexes.remove(self.0).expect("mutex");
            core.links.release(entry.wait_q);
            Ok(())
        })
    }

    pub fn lock(&self) -> Result<()> {
        let acquired = with_vp(|vp| {
            let core = &mut vp.core;
            let me = core.cur;
            {
                let e = core.fibers.get_mut(me).expect("current fiber");
                if e.flags.contains(FiberFlags::INTERRUPTED) {
                    e.flags.remove(FiberFlags::INTERRUPTED);
                    return Err(Error::Interrupted);
                }
            }
            let entry = core.mutexes.get_mut(self.0).ok_or(Error::InvalidArg)?;
            match entry.owner {
                None => {
                    entry.owner = Some(me);
                    return Ok(true);
                }
                Some(owner) if owner == me => return Err(Error::Deadlock),
                Some(_) => {}
            }
            let wait_q = entry.wait_q;
            core.fibers.get_mut(me).expect("current fiber").state = FiberState::LockWait;
            let wnode = core.fibers.get(me).expect("current fiber").wait_links;
            core.links.append(wnode, wait_q);
            Ok(false)
        })?;
        if acquired {
            return Ok(());
        }

        switch_to_scheduler();

        with_vp(|vp| {
            let core = &mut vp.core;
            let me = core.cur;
            let wnode = core.fibers.get(me).expect("current fiber").wait_links;
            core.links.remove(wnode);

            let owner = core.mutexes.get(self.0).and_then(|m| m.owner);
            let e = core.fibers.get_mut(me).expect("current fiber");
            if e.flags.contains(FiberFlags::INTERRUPTED) && owner != Some(me) {
                // The interrupt won the race before ownership reached us.
                e.flags.remove(FiberFlags::INTERRUPTED);
                return Err(Error::Interrupted);
            }
            // Ownership was handed to us by the unlocker.
            Ok(())
        })
    }

    pub fn trylock(&self) -> Result<()> {
        with_vp(|vp| {
            let core = &mut vp.core;
            let me = core.cur;
            let entry = core.mutexes.get_mut(self.0).ok_or(Error::InvalidArg)?;
            if entry.owner.is_some() {
                return Err(Error::Busy);
            }
            entry.owner = Some(me);
            Ok(())
        })
    }

    /// Hands the mutex to the longest-waiting fiber, or leaves it free.
    pub fn unlock(&self) -> Result<()> {
        with_vp(|vp| {
            let core = &mut vp.core;
            let me = core.cur;
            let (owner, wait_q) = {
                let entry = core.mutexes.get(self.0).ok_or(Error::InvalidArg)?;
                (entry.owner, entry.wait_q)
            };
            if owner != Some(me) {
                return Err(Error::NotPermitted);
            }

            let mut node = core.links.next(wait_q);
            while node != wait_q {
                let next = core.links.next(node);
                if let Owner::Fiber(fid) = core.links.owner(node) {
                    if core.fibers.get(fid).expect("mutex waiter").state == FiberState::LockWait {
                        core.mutexes.get_mut(self.0).expect("mutex").owner = Some(fid);
                        core.wake(fid);
                        return Ok(());
                    }
                }
                node = next;
            }

            core.mutexes.get_mut(self.0).expect("mutex").owner = None;
            Ok(())
        })
    }
}
