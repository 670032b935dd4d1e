//! The readiness backend: interest registration and the dispatch pass that
//! turns kernel events into run-queue transitions.
//!
//! Interest is reference counted per (fd, kind). A backend syscall happens
//! only when a descriptor's aggregated mask actually changes, and fired
//! interest is consumed one-shot after every dispatch, so a registration
//! made by one fiber never fires for another that did not ask for it.

use core::time::Duration;
use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::poll::PollFlags;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd::{getpid, Pid};

use crate::error::{Error, Result};
use crate::sched::{Owner, VpCore};

/// A descriptor and the events a fiber is interested in, `struct pollfd`
/// style. `revents` is filled in when the wait completes.
#[derive(Clone, Copy, Debug)]
pub struct PollFd {
    pub fd: RawFd,
    pub events: PollFlags,
    pub revents: PollFlags,
}

impl PollFd {
    pub fn new(fd: RawFd, events: PollFlags) -> Self {
        Self {
            fd,
            events,
            revents: PollFlags::empty(),
        }
    }
}

/// Contract between the scheduler and a readiness backend.
///
/// `dispatch` runs on the idle fiber: it waits for readiness bounded by
/// the next sleep deadline and moves every fiber whose condition became
/// true back to the run queue.
pub(crate) trait EventSystem {
    fn name(&self) -> &'static str;
    fn dispatch(&mut self, core: &mut VpCore);
    fn pollset_add(&mut self, pds: &[PollFd]) -> Result<()>;
    fn pollset_del(&mut self, pds: &[PollFd]);
    fn fd_new(&mut self, osfd: RawFd) -> Result<()>;
    fn fd_close(&mut self, osfd: RawFd) -> Result<()>;
    /// 0 means the backend imposes no limit.
    fn fd_limit(&self) -> usize;
}

/// Not a limit, just a sizing hint for the event and per-fd tables.
const EVTLIST_HINT: usize = 4096;

#[derive(Clone)]
struct FdData {
    rd: u32,
    wr: u32,
    ex: u32,
    revents: EpollFlags,
}

impl Default for FdData {
    fn default() -> Self {
        Self {
            rd: 0,
            wr: 0,
            ex: 0,
            revents: EpollFlags::empty(),
        }
    }
}

pub(crate) struct EpollSystem {
    epoll: Epoll,
    fd_data: Vec<FdData>,
    evtlist: Vec<EpollEvent>,
    /// Descriptors currently registered with the kernel.
    registered: usize,
    /// Owner process; a mismatch means we are running in a fork child and
    /// the kernel state must be rebuilt.
    pid: Pid,
}

impl EpollSystem {
    pub fn create(osfd_limit: usize) -> Result<Self> {
        let hint = if osfd_limit > 0 && osfd_limit < EVTLIST_HINT {
            osfd_limit
        } else {
            EVTLIST_HINT
        };
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(Error::Io)?;
        Ok(Self {
            epoll,
            fd_data: vec![FdData::default(); hint],
            evtlist: vec![EpollEvent::empty(); hint],
            registered: 0,
            pid: getpid(),
        })
    }

    fn ensure_fd(&mut self, fd: usize) {
        if fd >= self.fd_data.len() {
            let mut n = self.fd_data.len().max(1);
            while fd >= n {
                n *= 2;
            }
            self.fd_data.resize(n, FdData::default());
        }
    }

    /// Aggregated interest mask, recomputed from the reference counts.
    fn interest(&self, fd: usize) -> EpollFlags {
        let mut events = EpollFlags::empty();
        if let Some(d) = self.fd_data.get(fd) {
            if d.rd > 0 {
                events |= EpollFlags::EPOLLIN;
            }
            if d.wr > 0 {
                events |= EpollFlags::EPOLLOUT;
            }
            if d.ex > 0 {
                events |= EpollFlags::EPOLLPRI;
            }
        }
        events
    }

    fn ctl_add(&self, fd: RawFd, events: EpollFlags) -> nix::Result<()> {
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.add(bfd, EpollEvent::new(events, fd as u64))
    }

    fn ctl_mod(&self, fd: RawFd, events: EpollFlags) -> nix::Result<()> {
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut ev = EpollEvent::new(events, fd as u64);
        self.epoll.modify(bfd, &mut ev)
    }

    fn ctl_del(&self, fd: RawFd) -> nix::Result<()> {
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(bfd)
    }

    fn add_inner(&mut self, pds: &[PollFd]) -> Result<()> {
        let allowed = PollFlags::POLLIN | PollFlags::POLLOUT | PollFlags::POLLPRI;
        for pd in pds {
            if pd.fd < 0 || pd.events.is_empty() || !allowed.contains(pd.events) {
                return Err(Error::InvalidArg);
            }
            self.ensure_fd(pd.fd as usize);
        }

        for (i, pd) in pds.iter().enumerate() {
            let fd = pd.fd as usize;
            let old = self.interest(fd);
            if pd.events.contains(PollFlags::POLLIN) {
                self.fd_data[fd].rd += 1;
            }
            if pd.events.contains(PollFlags::POLLOUT) {
                self.fd_data[fd].wr += 1;
            }
            if pd.events.contains(PollFlags::POLLPRI) {
                self.fd_data[fd].ex += 1;
            }

            let new = self.interest(fd);
            if new == old {
                continue;
            }
            let was_add = old.is_empty();
            let res = if was_add {
                self.ctl_add(pd.fd, new)
            } else {
                self.ctl_mod(pd.fd, new)
            };
            if let Err(errno) = res {
                if !(was_add && errno == Errno::EEXIST) {
                    // Roll back the prefix that succeeded plus this entry.
                    self.del_inner(&pds[..=i]);
                    return Err(errno.into());
                }
            }
            if was_add {
                self.registered += 1;
                if self.registered > self.evtlist.len() {
                    let n = self.evtlist.len() * 2;
                    self.evtlist.resize(n.max(self.registered), EpollEvent::empty());
                }
            }
        }
        Ok(())
    }

    fn del_inner(&mut self, pds: &[PollFd]) {
        for pd in pds {
            let fd = pd.fd as usize;
            if fd >= self.fd_data.len() {
                continue;
            }
            let old = self.interest(fd);
            if pd.events.contains(PollFlags::POLLIN) {
                self.fd_data[fd].rd = self.fd_data[fd].rd.saturating_sub(1);
            }
            if pd.events.contains(PollFlags::POLLOUT) {
                self.fd_data[fd].wr = self.fd_data[fd].wr.saturating_sub(1);
            }
            if pd.events.contains(PollFlags::POLLPRI) {
                self.fd_data[fd].ex = self.fd_data[fd].ex.saturating_sub(1);
            }

            // Only touch the kernel while no readiness is pending on the
            // fd; dispatch reconciles fired descriptors itself.
            let new = self.interest(fd);
            if new != old && self.fd_data[fd].revents.is_empty() {
                let res = if new.is_empty() {
                    let r = self.ctl_del(pd.fd);
                    if r.is_ok() {
                        self.registered = self.registered.saturating_sub(1);
                    }
                    r
                } else {
                    self.ctl_mod(pd.fd, new)
                };
                if let Err(errno) = res {
                    // The fd is collected on close or on its next one-shot
                    // consumption.
                    log::warn!("dropping epoll interest on fd {} failed: {}", pd.fd, errno);
                }
            }
        }
    }

    /// Maps a descriptor's staged kernel events onto one request's
    /// interest set. Error and hangup conditions are reported to every
    /// requester of the fd regardless of what it asked for.
    fn translate(&self, fd: RawFd, requested: PollFlags) -> PollFlags {
        let stored = match self.fd_data.get(fd as usize) {
            Some(d) => d.revents,
            None => return PollFlags::empty(),
        };
        if stored.is_empty() {
            return PollFlags::empty();
        }
        let mut revents = PollFlags::empty();
        if requested.contains(PollFlags::POLLIN) && stored.contains(EpollFlags::EPOLLIN) {
            revents |= PollFlags::POLLIN;
        }
        if requested.contains(PollFlags::POLLOUT) && stored.contains(EpollFlags::EPOLLOUT) {
            revents |= PollFlags::POLLOUT;
        }
        if requested.contains(PollFlags::POLLPRI) && stored.contains(EpollFlags::EPOLLPRI) {
            revents |= PollFlags::POLLPRI;
        }
        if stored.contains(EpollFlags::EPOLLERR) {
            revents |= PollFlags::POLLERR;
        }
        if stored.contains(EpollFlags::EPOLLHUP) {
            revents |= PollFlags::POLLHUP;
        }
        revents
    }

    fn rebuild(&mut self, core: &mut VpCore) {
        log::debug!("pid changed, rebuilding epoll state after fork");
        match Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC) {
            Ok(epoll) => self.epoll = epoll,
            Err(errno) => {
                log::error!("cannot recreate the epoll instance after fork: {}", errno);
                std::process::abort();
            }
        }
        self.pid = getpid();
        for d in self.fd_data.iter_mut() {
            *d = FdData::default();
        }
        self.registered = 0;

        let io_q = core.io_q;
        let mut node = core.links.next(io_q);
        while node != io_q {
            let next = core.links.next(node);
            if let Owner::Poll(pid) = core.links.owner(node) {
                let res = self.add_inner(&core.polls.get(pid).expect("queued poll request").pds);
                if let Err(err) = res {
                    log::error!("re-registering poll interest after fork failed: {}", err);
                    std::process::abort();
                }
            }
            node = next;
        }
    }

    fn dispatch_inner(&mut self, core: &mut VpCore) {
        let timeout = match core.sleep_root_due() {
            None => EpollTimeout::NONE,
            Some(due) => {
                let ms = if due <= core.last_clock {
                    0
                } else {
                    (due - core.last_clock + 999) / 1000
                };
                EpollTimeout::try_from(Duration::from_millis(ms)).unwrap_or(EpollTimeout::NONE)
            }
        };

        if getpid() != self.pid {
            self.rebuild(core);
        }

        let nfd = match self.epoll.wait(&mut self.evtlist, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => return,
            Err(errno) => {
                log::warn!("epoll_wait failed: {}", errno);
                return;
            }
        };
        if nfd == 0 {
            return;
        }

        // Stage the kernel events per fd; err/hup fold in every bit the
        // fd is currently interested in.
        for i in 0..nfd {
            let (fd, events) = {
                let ev = &self.evtlist[i];
                (ev.data() as usize, ev.events())
            };
            if fd >= self.fd_data.len() {
                continue;
            }
            self.fd_data[fd].revents |= events;
            if self.fd_data[fd]
                .revents
                .intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP)
            {
                let interest = self.interest(fd);
                self.fd_data[fd].revents |= interest;
            }
        }

        // Wake every queued request with a satisfied descriptor.
        let io_q = core.io_q;
        let mut node = core.links.next(io_q);
        while node != io_q {
            let next = core.links.next(node);
            let pid = match core.links.owner(node) {
                Owner::Poll(p) => p,
                other => unreachable!("io queue holds poll requests, found {:?}", other),
            };
            let mut notify = false;
            {
                let entry = core.polls.get_mut(pid).expect("queued poll request");
                for pd in entry.pds.iter_mut() {
                    pd.revents = self.translate(pd.fd, pd.events);
                    if !pd.revents.is_empty() {
                        notify = true;
                    }
                }
            }
            if notify {
                core.links.remove(node);
                let fiber = {
                    let entry = core.polls.get_mut(pid).expect("queued poll request");
                    entry.on_ioq = false;
                    entry.fiber
                };
                // Detaches only descriptors without pending readiness;
                // the fired ones are reconciled below.
                self.del_inner(&core.polls.get(pid).expect("queued poll request").pds);
                core.wake(fiber);
            }
            node = next;
        }

        // Consume the fired interest (one-shot semantics).
        for i in 0..nfd {
            let fd = self.evtlist[i].data() as usize;
            if fd >= self.fd_data.len() {
                continue;
            }
            self.fd_data[fd].revents = EpollFlags::empty();
            let events = self.interest(fd);
            let res = if events.is_empty() {
                let r = self.ctl_del(fd as RawFd);
                if r.is_ok() {
                    self.registered = self.registered.saturating_sub(1);
                }
                r
            } else {
                self.ctl_mod(fd as RawFd, events)
            };
            if let Err(errno) = res {
                log::debug!("consuming fired interest on fd {} failed: {}", fd, errno);
            }
        }
    }
}

impl EventSystem for EpollSystem {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn dispatch(&mut self, core: &mut VpCore) {
        self.dispatch_inner(core);
    }

    fn pollset_add(&mut self, pds: &[PollFd]) -> Result<()> {
        self.add_inner(pds)
    }

    fn pollset_del(&mut self, pds: &[PollFd]) {
        self.del_inner(pds);
    }

    fn fd_new(&mut self, osfd: RawFd) -> Result<()> {
        if osfd < 0 {
            return Err(Error::InvalidArg);
        }
        self.ensure_fd(osfd as usize);
        Ok(())
    }

    fn fd_close(&mut self, osfd: RawFd) -> Result<()> {
        if let Some(d) = self.fd_data.get(osfd as usize) {
            if d.rd > 0 || d.wr > 0 || d.ex > 0 {
                return Err(Error::Busy);
            }
        }
        Ok(())
    }

    fn fd_limit(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn pipe_fds() -> (std::os::fd::OwnedFd, std::os::fd::OwnedFd) {
        nix::unistd::pipe().unwrap()
    }

    #[test]
    fn interest_mask_follows_reference_counts() {
        let mut sys = EpollSystem::create(0).unwrap();
        let (r, _w) = pipe_fds();
        let fd = r.as_raw_fd();

        let pd = PollFd::new(fd, PollFlags::POLLIN);
        sys.pollset_add(&[pd]).unwrap();
        assert_eq!(sys.interest(fd as usize), EpollFlags::EPOLLIN);

        // A second reader only bumps the count; the mask is unchanged.
        sys.pollset_add(&[pd]).unwrap();
        assert_eq!(sys.interest(fd as usize), EpollFlags::EPOLLIN);

        let wr = PollFd::new(fd, PollFlags::POLLOUT);
        sys.pollset_add(&[wr]).unwrap();
        assert_eq!(
            sys.interest(fd as usize),
            EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT
        );

        sys.pollset_del(&[pd]);
        assert_eq!(
            sys.interest(fd as usize),
            EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT
        );
        sys.pollset_del(&[pd]);
        assert_eq!(sys.interest(fd as usize), EpollFlags::EPOLLOUT);
        sys.pollset_del(&[wr]);
        assert_eq!(sys.interest(fd as usize), EpollFlags::empty());
    }

    #[test]
    fn add_then_del_is_identity_on_fd_state() {
        let mut sys = EpollSystem::create(0).unwrap();
        let (r, _w) = pipe_fds();
        let fd = r.as_raw_fd();

        sys.fd_new(fd).unwrap();
        let pd = PollFd::new(fd, PollFlags::POLLIN | PollFlags::POLLPRI);
        sys.pollset_add(&[pd]).unwrap();
        assert_eq!(sys.fd_close(fd), Err(Error::Busy));

        sys.pollset_del(&[pd]);
        assert_eq!(sys.interest(fd as usize), EpollFlags::empty());
        assert_eq!(sys.registered, 0);
        sys.fd_close(fd).unwrap();
    }

    #[test]
    fn rejects_bad_descriptor_sets() {
        let mut sys = EpollSystem::create(0).unwrap();
        let (r, _w) = pipe_fds();
        let fd = r.as_raw_fd();

        let bad_fd = PollFd::new(-1, PollFlags::POLLIN);
        assert_eq!(sys.pollset_add(&[bad_fd]), Err(Error::InvalidArg));

        let no_events = PollFd::new(fd, PollFlags::empty());
        assert_eq!(sys.pollset_add(&[no_events]), Err(Error::InvalidArg));

        let out_of_range = PollFd::new(fd, PollFlags::POLLIN | PollFlags::POLLHUP);
        assert_eq!(sys.pollset_add(&[out_of_range]), Err(Error::InvalidArg));
        assert_eq!(sys.interest(fd as usize), EpollFlags::empty());
    }

    #[test]
    fn failed_batch_rolls_back_the_prefix() {
        let mut sys = EpollSystem::create(0).unwrap();
        let (r, _w) = pipe_fds();
        let fd = r.as_raw_fd();

        // epoll refuses regular files, so the second entry fails the
        // batch and the first entry's registration must be undone.
        let file = std::fs::File::open("Cargo.toml").unwrap();
        let plain = file.as_raw_fd();

        let set = [
            PollFd::new(fd, PollFlags::POLLIN),
            PollFd::new(plain, PollFlags::POLLIN),
        ];
        assert!(matches!(sys.pollset_add(&set), Err(Error::Io(_))));
        assert_eq!(sys.interest(fd as usize), EpollFlags::empty());
        assert_eq!(sys.interest(plain as usize), EpollFlags::empty());
        assert_eq!(sys.registered, 0);
    }
}
