//! Time sources, the coarse seconds cache, and sleeping.

use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::time::TimeValLike;
use nix::time::{clock_gettime, ClockId};

use crate::error::{Error, Result};
use crate::sched;

/// Park forever (until interrupted) when passed as a timeout.
pub const NO_TIMEOUT: u64 = u64::MAX;

thread_local! {
    static TIME_SOURCE: Cell<Option<fn() -> u64>> = const { Cell::new(None) };
    /// Cached wall-clock seconds; zero while the cache is disabled.
    static CURR_SECONDS: Cell<u64> = const { Cell::new(0) };
    static LAST_SECONDS_REFRESH: Cell<u64> = const { Cell::new(0) };
}

/// Current time in microseconds from the configured source (monotonic by
/// default). Deadlines and `last_clock_us` live in this time domain.
pub fn now_us() -> u64 {
    if let Some(source) = TIME_SOURCE.with(|s| s.get()) {
        return source();
    }
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.num_microseconds() as u64,
        Err(_) => 0,
    }
}

/// Replaces the microsecond time source. Only callable before the runtime
/// starts; afterwards deadlines already in flight would change meaning.
pub fn set_time_source(source: fn() -> u64) -> Result<()> {
    if sched::runtime_active() {
        return Err(Error::InvalidArg);
    }
    TIME_SOURCE.with(|s| s.set(Some(source)));
    Ok(())
}

/// The clock value cached at the last scheduler clock check. Cheap, and
/// exactly what sleep deadlines are computed against.
pub fn last_clock_us() -> u64 {
    sched::with_vp(|vp| vp.core.last_clock)
}

fn wall_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Wall-clock seconds; served from the coarse cache when enabled.
pub fn now_seconds() -> u64 {
    let cached = CURR_SECONDS.with(|c| c.get());
    if cached != 0 {
        cached
    } else {
        wall_seconds()
    }
}

/// Enables or disables the coarse seconds cache. Returns the previous
/// setting. While enabled the cache is refreshed during scheduler clock
/// checks, at most once per second.
pub fn time_cache(on: bool) -> bool {
    let was = CURR_SECONDS.with(|c| c.get()) != 0;
    if on {
        CURR_SECONDS.with(|c| c.set(wall_seconds()));
        LAST_SECONDS_REFRESH.with(|c| c.set(now_us()));
    } else {
        CURR_SECONDS.with(|c| c.set(0));
    }
    was
}

pub(crate) fn refresh_seconds_cache(now_us: u64) {
    if CURR_SECONDS.with(|c| c.get()) == 0 {
        return;
    }
    let last = LAST_SECONDS_REFRESH.with(|c| c.get());
    if now_us.saturating_sub(last) > 999_000 {
        CURR_SECONDS.with(|c| c.set(wall_seconds()));
        LAST_SECONDS_REFRESH.with(|c| c.set(now_us));
    }
}

/// Parks the calling fiber for `usecs` microseconds, or forever (state
/// SUSPENDED) with `NO_TIMEOUT`. Fails `Interrupted` if interrupted
/// before or during the sleep.
pub fn usleep(usecs: u64) -> Result<()> {
    let timeout = if usecs == NO_TIMEOUT {
        None
    } else {
        Some(usecs)
    };
    sched::park_sleep(timeout)
}

/// Parks the calling fiber for whole seconds.
pub fn sleep(secs: u64) -> Result<()> {
    usleep(secs.saturating_mul(1_000_000))
}
