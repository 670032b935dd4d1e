//! End-to-end scenarios. The runtime is per-thread, and the test harness
//! runs every test on its own thread, so the scenarios are independent.

use std::cell::RefCell;
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::libc;
use strand::{Error, NetFd, PollFd, PollFlags, NO_TIMEOUT};

const MS: u64 = 1_000;

#[test]
fn s1_ping_pong_via_condvars() {
    strand::init().unwrap();
    let cv = strand::Cond::new().unwrap();

    // B waits first so A's opening signal has a waiter to land on.
    let b = strand::spawn(move || {
        for _ in 0..100 {
            cv.wait().unwrap();
            cv.signal().unwrap();
        }
    })
    .unwrap();
    let a = strand::spawn(move || {
        for _ in 0..100 {
            cv.signal().unwrap();
            cv.wait().unwrap();
        }
    })
    .unwrap();

    a.join().unwrap();
    b.join().unwrap();
    assert_eq!(strand::active_count(), 1);
    cv.destroy().unwrap();
}

#[test]
fn s2_timers_wake_in_deadline_order_with_fifo_ties() {
    strand::init().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let mut handles = Vec::new();
    for (tag, delay_ms) in [(30u64, 30u64), (101, 10), (20, 20), (102, 10), (50, 50)] {
        let order = order.clone();
        handles.push(
            strand::spawn(move || {
                strand::usleep(delay_ms * MS).unwrap();
                order.borrow_mut().push(tag);
            })
            .unwrap(),
        );
    }
    for h in handles {
        h.join().unwrap();
    }

    // The two 10 ms sleepers wake in the order they went to sleep.
    assert_eq!(*order.borrow(), vec![101, 102, 20, 30, 50]);
}

#[test]
fn s3_poll_times_out_then_sees_the_connection() {
    strand::init().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let lfd = listener.as_raw_fd();

    // No pending connection: a bounded poll comes back empty.
    let mut pds = [PollFd::new(lfd, PollFlags::POLLIN)];
    assert_eq!(strand::poll(&mut pds, 50 * MS).unwrap(), 0);
    assert!(pds[0].revents.is_empty());

    let client = Rc::new(RefCell::new(None));
    let stash = client.clone();
    strand::spawn_detached(move || {
        *stash.borrow_mut() = Some(TcpStream::connect(addr).unwrap());
    })
    .unwrap();

    // Unbounded poll parks until the client lands.
    let mut pds = [PollFd::new(lfd, PollFlags::POLLIN)];
    assert_eq!(strand::poll(&mut pds, NO_TIMEOUT).unwrap(), 1);
    assert!(pds[0].revents.contains(PollFlags::POLLIN));

    let nfd = NetFd::open_socket(lfd).unwrap();
    let conn = nfd.accept(NO_TIMEOUT).unwrap();
    conn.close().unwrap();
    drop(client);
}

#[test]
fn s4_interrupt_wakes_a_sleeper_early() {
    strand::init().unwrap();

    let x = strand::spawn(|| {
        let start = strand::now_us();
        let res = strand::usleep(1_000_000);
        (res, strand::now_us() - start)
    })
    .unwrap();
    let target = x.fiber();

    strand::usleep(10 * MS).unwrap();
    strand::interrupt(target);

    let (res, elapsed) = x.join().unwrap();
    assert_eq!(res, Err(Error::Interrupted));
    assert!(elapsed < 200 * MS, "sleeper resumed after {} us", elapsed);
}

#[test]
fn s5_mutex_unlock_hands_off_in_fifo_order() {
    strand::init().unwrap();
    let m = strand::Mutex::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    m.lock().unwrap();

    let mut handles = Vec::new();
    for tag in [1u32, 2, 3] {
        let order = order.clone();
        handles.push(
            strand::spawn(move || {
                m.lock().unwrap();
                order.borrow_mut().push(tag);
                m.unlock().unwrap();
            })
            .unwrap(),
        );
    }

    // Let all three park on the mutex, then release it.
    strand::usleep(20 * MS).unwrap();
    m.unlock().unwrap();

    // Ownership went straight to the first waiter; a late arrival
    // cannot barge in.
    assert_eq!(m.trylock(), Err(Error::Busy));

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*order.borrow(), vec![1, 2, 3]);
    m.destroy().unwrap();
}

#[test]
fn s6_join_returns_the_value_and_recycles_the_stack() {
    strand::init().unwrap();

    let c = strand::spawn(|| 42i32).unwrap();
    // Let C run to completion; it parks as a zombie holding its stack.
    strand::usleep(10 * MS).unwrap();
    let free_before = strand::free_stack_count();

    assert_eq!(c.join().unwrap(), 42);

    // The reaped fiber needs one more scheduler round to finish its
    // cleanup leg and return the stack to the free list.
    strand::usleep(5 * MS).unwrap();
    assert_eq!(strand::free_stack_count(), free_before + 1);
    assert_eq!(strand::active_count(), 1);
}

#[test]
fn poll_zero_timeout_on_an_unready_pipe_returns_zero() {
    strand::init().unwrap();

    let (r, w) = nix::unistd::pipe().unwrap();
    let rfd = r.into_raw_fd();
    let nfd = NetFd::open(rfd).unwrap();

    let mut pds = [PollFd::new(rfd, PollFlags::POLLIN)];
    assert_eq!(strand::poll(&mut pds, 0).unwrap(), 0);
    assert!(pds[0].revents.is_empty());

    // Interest was fully dropped again, so close is not busy.
    nfd.close().unwrap();
    drop(w);
}

#[test]
fn interrupting_a_runnable_fiber_fails_exactly_one_park() {
    strand::init().unwrap();

    let y = strand::spawn(|| {
        let first = strand::usleep(1 * MS);
        let second = strand::usleep(1 * MS);
        (first, second)
    })
    .unwrap();

    // Y has not run yet; the interrupt only raises its flag.
    strand::interrupt(y.fiber());

    let (first, second) = y.join().unwrap();
    assert_eq!(first, Err(Error::Interrupted));
    assert_eq!(second, Ok(()));
}

#[test]
fn timed_wait_beaten_by_a_signal_succeeds() {
    strand::init().unwrap();
    let cv = strand::Cond::new().unwrap();

    let waiter = strand::spawn(move || cv.timed_wait(500 * MS)).unwrap();

    strand::usleep(10 * MS).unwrap();
    cv.signal().unwrap();

    assert_eq!(waiter.join().unwrap(), Ok(()));
    // The only waiter removed itself on the way out.
    cv.destroy().unwrap();
}

#[test]
fn timed_wait_expires_with_timed_out() {
    strand::init().unwrap();
    let cv = strand::Cond::new().unwrap();

    let start = strand::now_us();
    assert_eq!(cv.timed_wait(20 * MS), Err(Error::TimedOut));
    // The deadline is anchored to the scheduler's cached clock, which may
    // trail the start timestamp slightly.
    assert!(strand::now_us() - start >= 15 * MS);
    cv.destroy().unwrap();
}

#[test]
fn cond_destroy_is_busy_while_somebody_waits() {
    strand::init().unwrap();
    let cv = strand::Cond::new().unwrap();

    let waiter = strand::spawn(move || cv.wait()).unwrap();
    strand::usleep(10 * MS).unwrap();

    assert_eq!(cv.destroy(), Err(Error::Busy));
    cv.signal().unwrap();
    assert_eq!(waiter.join().unwrap(), Ok(()));
    cv.destroy().unwrap();
}

#[test]
fn mutex_error_paths() {
    strand::init().unwrap();
    let m = strand::Mutex::new().unwrap();

    // Unlocking without holding it is refused.
    assert_eq!(m.unlock(), Err(Error::NotPermitted));

    m.lock().unwrap();
    // Non-recursive: relocking from the owner would deadlock.
    assert_eq!(m.lock(), Err(Error::Deadlock));
    // Held mutexes cannot be destroyed.
    assert_eq!(m.destroy(), Err(Error::Busy));

    m.unlock().unwrap();
    m.destroy().unwrap();
    // The handle is dead after destroy.
    assert_eq!(m.lock(), Err(Error::InvalidArg));
}

#[test]
fn invalid_poll_sets_are_rejected() {
    strand::init().unwrap();

    let mut bad_fd = [PollFd::new(-1, PollFlags::POLLIN)];
    assert_eq!(strand::poll(&mut bad_fd, 0), Err(Error::InvalidArg));

    let (r, w) = nix::unistd::pipe().unwrap();
    let rfd = r.into_raw_fd();
    let mut bad_events = [PollFd::new(rfd, PollFlags::POLLHUP)];
    assert_eq!(strand::poll(&mut bad_events, 0), Err(Error::InvalidArg));

    unsafe { libc::close(rfd) };
    drop(w);
}

static FLS_DROPS: AtomicUsize = AtomicUsize::new(0);

fn count_drop(_value: Rc<dyn std::any::Any>) {
    FLS_DROPS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn fls_destructors_run_on_overwrite_and_exit() {
    strand::init().unwrap();
    assert_eq!(strand::fls::key_limit(), 16);

    let key = strand::fls::key_create(Some(count_drop)).unwrap();

    let worker = strand::spawn(move || {
        strand::fls::set(key, Some(Rc::new(1u32))).unwrap();
        let got = strand::fls::get(key).unwrap();
        assert_eq!(*got.downcast::<u32>().unwrap(), 1);

        // Replacing the value destroys the old one.
        strand::fls::set(key, Some(Rc::new(2u32))).unwrap();
        assert_eq!(FLS_DROPS.load(Ordering::SeqCst), 1);
        // The second value is destroyed by fiber cleanup.
    })
    .unwrap();

    worker.join().unwrap();
    assert_eq!(FLS_DROPS.load(Ordering::SeqCst), 2);

    // Values are per fiber: the primordial fiber never set one.
    assert!(strand::fls::get(key).is_none());
}

#[test]
fn detached_fibers_come_and_go_from_the_active_count() {
    strand::init().unwrap();
    let before = strand::active_count();

    let ran = Rc::new(RefCell::new(false));
    let flag = ran.clone();
    strand::spawn_detached(move || {
        *flag.borrow_mut() = true;
    })
    .unwrap();
    assert_eq!(strand::active_count(), before + 1);

    strand::usleep(5 * MS).unwrap();
    assert!(*ran.borrow());
    assert_eq!(strand::active_count(), before);
}

#[test]
fn wrappers_connect_accept_and_move_bytes() {
    strand::init().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let lfd = NetFd::open_socket(listener.as_raw_fd()).unwrap();

    let client = strand::spawn(move || {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(sock >= 0);
        let nfd = NetFd::open_socket(sock).unwrap();
        nfd.connect(&addr, NO_TIMEOUT).unwrap();
        nfd.write_all(b"ping", NO_TIMEOUT).unwrap();
        let mut reply = [0u8; 4];
        let n = nfd.read_fully(&mut reply, NO_TIMEOUT).unwrap();
        nfd.close().unwrap();
        (n, reply)
    })
    .unwrap();

    let conn = lfd.accept(NO_TIMEOUT).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(conn.read_fully(&mut buf, NO_TIMEOUT).unwrap(), 4);
    assert_eq!(&buf, b"ping");
    conn.write_all(b"pong", NO_TIMEOUT).unwrap();

    let (n, reply) = client.join().unwrap();
    assert_eq!(n, 4);
    assert_eq!(&reply, b"pong");
    conn.close().unwrap();
}

#[test]
fn pipe_reader_parks_until_the_writer_shows_up() {
    strand::init().unwrap();

    let (r, w) = nix::unistd::pipe().unwrap();
    let rfd = NetFd::open(r.into_raw_fd()).unwrap();
    let wfd = NetFd::open(w.into_raw_fd()).unwrap();

    strand::spawn_detached(move || {
        strand::usleep(20 * MS).unwrap();
        wfd.write_all(b"late", NO_TIMEOUT).unwrap();
    })
    .unwrap();

    let start = strand::now_us();
    let mut buf = [0u8; 4];
    assert_eq!(rfd.read(&mut buf, NO_TIMEOUT).unwrap(), 4);
    assert_eq!(&buf, b"late");
    assert!(strand::now_us() - start >= 15 * MS);

    rfd.close().unwrap();
}
