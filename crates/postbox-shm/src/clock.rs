use std::time::Duration;

/// Milliseconds on `CLOCK_MONOTONIC`.
///
/// The monotonic clock is shared by every process on the host, so values read
/// in different processes can be compared directly.
pub fn monotonic_millis() -> u64 {
    let ts = clock_now(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1_000 + ts.tv_nsec as u64 / 1_000_000
}

/// Absolute `CLOCK_REALTIME` deadline `wait` from now, as expected by
/// `pthread_mutex_timedlock`.
pub fn realtime_deadline(wait: Duration) -> libc::timespec {
    let now = clock_now(libc::CLOCK_REALTIME);

    let mut sec = now.tv_sec as i64 + wait.as_secs() as i64;
    let mut nsec = now.tv_nsec as i64 + wait.subsec_nanos() as i64;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }

    libc::timespec {
        tv_sec: sec as libc::time_t,
        tv_nsec: nsec as _,
    }
}

fn clock_now(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec. clock_gettime cannot fail for
    // CLOCK_MONOTONIC / CLOCK_REALTIME with a valid pointer.
    unsafe {
        libc::clock_gettime(clock, &mut ts);
    }
    ts
}
