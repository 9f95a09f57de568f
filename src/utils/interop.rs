use std::io;
use std::os::raw::c_int;
use std::time::Duration;

/// Converts a `libibverbs`-style return value (zero or an `errno` value)
/// to a Rust `Result`.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret))
    }
}

/// Converts a `librdmacm`-style return value (zero, or -1 with the error
/// in `errno`) to a Rust `Result`.
#[inline(always)]
pub(crate) fn from_cm_ret(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Wait until the given file descriptor becomes readable.
///
/// Returns `Ok(true)` when readable and `Ok(false)` on timeout. A `None`
/// timeout blocks indefinitely. Interrupted waits are retried.
pub(crate) fn poll_readable(fd: c_int, timeout: Option<Duration>) -> io::Result<bool> {
    let timeout_ms = match timeout {
        Some(t) => t.as_millis().min(i32::MAX as u128) as c_int,
        None => -1,
    };
    loop {
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: FFI; `pollfd` lives across the call.
        let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        match ret {
            1.. => return Ok(true),
            0 => return Ok(false),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn pipe_fds() -> (c_int, c_int) {
        let mut fds = [0 as c_int; 2];
        // SAFETY: FFI; `fds` lives across the call.
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close_fds(fds: (c_int, c_int)) {
        // SAFETY: FFI; the descriptors came from `pipe` above.
        unsafe {
            libc::close(fds.0);
            libc::close(fds.1);
        }
    }

    #[test]
    fn quiet_fd_times_out_within_the_bound() {
        let fds = pipe_fds();
        let start = Instant::now();
        let readable = poll_readable(fds.0, Some(Duration::from_millis(20))).unwrap();
        assert!(!readable);
        assert!(start.elapsed() < Duration::from_secs(2));
        close_fds(fds);
    }

    #[test]
    fn readable_fd_wakes_the_wait() {
        let fds = pipe_fds();
        // SAFETY: FFI; one byte from a live buffer.
        let n = unsafe { libc::write(fds.1, b"x".as_ptr().cast(), 1) };
        assert_eq!(n, 1);
        assert!(poll_readable(fds.0, Some(Duration::from_millis(100))).unwrap());
        close_fds(fds);
    }
}
