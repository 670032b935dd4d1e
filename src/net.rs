//! Descriptor veneer and the blocking-call recipes.
//!
//! Every wrapper follows the one pattern this runtime exists for: attempt
//! the non-blocking syscall, and when it would block, park on `poll` until
//! the descriptor is ready, then try again. Nothing here suspends except
//! through `poll`.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::libc;
use nix::poll::PollFlags;
use nix::sys::signal::{signal, SigHandler, Signal};

use crate::error::{Error, Result};
use crate::events::PollFd;
use crate::sched::{poll, with_vp};

/// One-time I/O setup: ignore SIGPIPE (writes to dead peers are routine
/// for a network server) and raise the descriptor limit to the hard
/// maximum, capped by the backend's own limit when it has one. Returns
/// the resulting descriptor limit.
pub(crate) fn io_init(backend_limit: usize) -> Result<usize> {
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.map_err(Error::Io)?;

    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    Errno::result(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) })
        .map_err(Error::Io)?;
    if backend_limit > 0 && rlim.rlim_max > backend_limit as libc::rlim_t {
        rlim.rlim_max = backend_limit as libc::rlim_t;
    }
    rlim.rlim_cur = rlim.rlim_max;
    Errno::result(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) }).map_err(Error::Io)?;
    Ok(rlim.rlim_max as usize)
}

/// The descriptor limit negotiated at `init`.
pub fn fd_limit() -> usize {
    with_vp(|vp| vp.core.osfd_limit)
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let bits = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) }).map_err(Error::Io)?;
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, bits | libc::O_NONBLOCK) })
        .map_err(Error::Io)?;
    Ok(())
}

/// A descriptor registered with the runtime. The underlying fd is set
/// non-blocking on open; I/O multiplexing with a blocking descriptor is
/// never correct.
#[derive(Clone, Copy, Debug)]
pub struct NetFd {
    fd: RawFd,
}

impl NetFd {
    fn new(osfd: RawFd) -> Result<NetFd> {
        with_vp(|vp| vp.evsys.fd_new(osfd))?;
        set_nonblocking(osfd)?;
        Ok(NetFd { fd: osfd })
    }

    /// Takes over an open descriptor.
    pub fn open(osfd: RawFd) -> Result<NetFd> {
        Self::new(osfd)
    }

    /// Takes over an open socket.
    pub fn open_socket(osfd: RawFd) -> Result<NetFd> {
        Self::new(osfd)
    }

    pub fn fileno(&self) -> RawFd {
        self.fd
    }

    /// Closes the descriptor. Fails `Busy` while another fiber still has
    /// readiness interest registered on it.
    pub fn close(&self) -> Result<()> {
        with_vp(|vp| vp.evsys.fd_close(self.fd))?;
        Errno::result(unsafe { libc::close(self.fd) }).map_err(Error::Io)?;
        Ok(())
    }

    /// Waits for `how` on this descriptor. Fails `TimedOut` when the
    /// timeout elapses first.
    pub fn poll(&self, how: PollFlags, timeout_us: u64) -> Result<()> {
        let mut pds = [PollFd::new(self.fd, how)];
        let n = poll(&mut pds, timeout_us)?;
        if n == 0 {
            return Err(Error::TimedOut);
        }
        if pds[0].revents.contains(PollFlags::POLLNVAL) {
            return Err(Error::Io(Errno::EBADF));
        }
        Ok(())
    }

    pub fn read(&self, buf: &mut [u8], timeout_us: u64) -> Result<usize> {
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            match Errno::result(n) {
                Ok(n) => return Ok(n as usize),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => self.poll(PollFlags::POLLIN, timeout_us)?,
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    /// Reads until `buf` is full or the peer closes; returns the number
    /// of bytes read.
    pub fn read_fully(&self, buf: &mut [u8], timeout_us: u64) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..], timeout_us)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    pub fn write(&self, buf: &[u8], timeout_us: u64) -> Result<usize> {
        loop {
            let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
            match Errno::result(n) {
                Ok(n) => return Ok(n as usize),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => self.poll(PollFlags::POLLOUT, timeout_us)?,
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    pub fn write_all(&self, buf: &[u8], timeout_us: u64) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            done += self.write(&buf[done..], timeout_us)?;
        }
        Ok(())
    }

    /// Accepts one connection, parking until a client arrives.
    pub fn accept(&self, timeout_us: u64) -> Result<NetFd> {
        loop {
            let n = unsafe { libc::accept(self.fd, core::ptr::null_mut(), core::ptr::null_mut()) };
            match Errno::result(n) {
                Ok(osfd) => {
                    return match NetFd::open_socket(osfd) {
                        Ok(nfd) => Ok(nfd),
                        Err(err) => {
                            unsafe { libc::close(osfd) };
                            Err(err)
                        }
                    };
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => self.poll(PollFlags::POLLIN, timeout_us)?,
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    /// Connects a socket, parking while the connection is in progress.
    pub fn connect(&self, addr: &SocketAddr, timeout_us: u64) -> Result<()> {
        let (storage, len) = sockaddr_from(addr);
        loop {
            let n = unsafe {
                libc::connect(self.fd, &storage as *const _ as *const libc::sockaddr, len)
            };
            match Errno::result(n) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) | Err(Errno::EINPROGRESS) | Err(Errno::EALREADY) => {
                    self.poll(PollFlags::POLLOUT, timeout_us)?;
                    return self.take_socket_error();
                }
                Err(Errno::EISCONN) => return Ok(()),
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    fn take_socket_error(&self) -> Result<()> {
        let mut err: libc::c_int = 0;
        let mut len = core::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        Errno::result(rc).map_err(Error::Io)?;
        if err != 0 {
            return Err(Error::Io(Errno::from_raw(err)));
        }
        Ok(())
    }
}

impl AsRawFd for NetFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { core::mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = a.port().to_be();
                (*sin).sin_addr.s_addr = u32::from(*a.ip()).to_be();
            }
            (
                storage,
                core::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(a) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = a.port().to_be();
                (*sin6).sin6_addr.s6_addr = a.ip().octets();
                (*sin6).sin6_scope_id = a.scope_id();
            }
            (
                storage,
                core::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}
