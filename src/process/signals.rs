//! Signal handling.
//!
//! Handlers only set atomic flags; the master additionally gets a byte
//! written to a self-pipe whose read end sits in its poll set, so signal
//! arrival is just another readiness event and no `sigsuspend` dance is
//! needed. Workers skip the pipe: a signal interrupts their poll and the
//! worker loop inspects the flags on the way around.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

pub static QUIT: AtomicBool = AtomicBool::new(false); // SIGQUIT: graceful
pub static TERMINATE: AtomicBool = AtomicBool::new(false); // SIGTERM/SIGINT
pub static RECONFIGURE: AtomicBool = AtomicBool::new(false); // SIGHUP
pub static REOPEN: AtomicBool = AtomicBool::new(false); // SIGUSR1
pub static CHANGE_BINARY: AtomicBool = AtomicBool::new(false); // SIGUSR2
pub static NO_ACCEPT: AtomicBool = AtomicBool::new(false); // SIGWINCH
pub static CHILD: AtomicBool = AtomicBool::new(false); // SIGCHLD

static PIPE_WR: AtomicI32 = AtomicI32::new(-1);

pub const MASTER_SIGNALS: &[libc::c_int] = &[
    libc::SIGTERM,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGHUP,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGWINCH,
    libc::SIGCHLD,
];

pub const WORKER_SIGNALS: &[libc::c_int] = &[
    libc::SIGTERM,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGUSR1,
];

extern "C" fn on_signal(signo: libc::c_int) {
    let flag = match signo {
        libc::SIGQUIT => &QUIT,
        libc::SIGTERM | libc::SIGINT => &TERMINATE,
        libc::SIGHUP => &RECONFIGURE,
        libc::SIGUSR1 => &REOPEN,
        libc::SIGUSR2 => &CHANGE_BINARY,
        libc::SIGWINCH => &NO_ACCEPT,
        libc::SIGCHLD => &CHILD,
        _ => return,
    };
    flag.store(true, Ordering::SeqCst);
    let fd = PIPE_WR.load(Ordering::SeqCst);
    if fd >= 0 {
        unsafe {
            libc::write(fd, b"!".as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Install the flag-setting handler for `signals` and ignore SIGPIPE
/// (peers vanish mid-write; the write error is handled in line).
pub fn install(signals: &[libc::c_int]) -> io::Result<()> {
    unsafe {
        for &sig in signals {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = on_signal as usize;
            sa.sa_flags = 0;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        let mut ign: libc::sigaction = std::mem::zeroed();
        ign.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut ign.sa_mask);
        if libc::sigaction(libc::SIGPIPE, &ign, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Create the master's self-pipe; returns the read end for the poll set.
pub fn init_self_pipe() -> io::Result<RawFd> {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    PIPE_WR.store(fds[1], Ordering::SeqCst);
    Ok(fds[0])
}

/// Forked children inherit the pipe fds but must not write to the
/// master's pipe; detach before doing anything else.
pub fn detach_self_pipe() {
    let fd = PIPE_WR.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Swallow everything buffered in the pipe after a wake-up.
pub fn drain_pipe(rd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

/// Consume a pending flag.
pub fn take(flag: &AtomicBool) -> bool {
    flag.swap(false, Ordering::SeqCst)
}

/// Clear leftover pending flags (start of a forked child).
pub fn clear_all() {
    for flag in [
        &QUIT,
        &TERMINATE,
        &RECONFIGURE,
        &REOPEN,
        &CHANGE_BINARY,
        &NO_ACCEPT,
        &CHILD,
    ] {
        flag.store(false, Ordering::SeqCst);
    }
}

/// Map a `-s` command name to the signal the master expects.
pub fn signal_by_name(name: &str) -> Option<libc::c_int> {
    match name {
        "stop" => Some(libc::SIGTERM),
        "quit" => Some(libc::SIGQUIT),
        "reopen" => Some(libc::SIGUSR1),
        "reload" => Some(libc::SIGHUP),
        _ => None,
    }
}

pub fn kill(pid: libc::pid_t, sig: libc::c_int) -> io::Result<()> {
    if unsafe { libc::kill(pid, sig) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_by_name("stop"), Some(libc::SIGTERM));
        assert_eq!(signal_by_name("quit"), Some(libc::SIGQUIT));
        assert_eq!(signal_by_name("reopen"), Some(libc::SIGUSR1));
        assert_eq!(signal_by_name("reload"), Some(libc::SIGHUP));
        assert_eq!(signal_by_name("dance"), None);
    }

    #[test]
    fn test_take_consumes_flag() {
        NO_ACCEPT.store(true, Ordering::SeqCst);
        assert!(take(&NO_ACCEPT));
        assert!(!take(&NO_ACCEPT));
    }

    #[test]
    fn test_self_pipe_carries_signal_bytes() {
        let rd = init_self_pipe().expect("pipe");
        // Raise a real signal at ourselves; the handler writes the byte.
        install(&[libc::SIGUSR1]).expect("install");
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        // The write happens synchronously in the handler on this thread.
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert!(n >= 1);
        assert!(take(&REOPEN));
        drain_pipe(rd);
        detach_self_pipe();
        unsafe {
            libc::close(rd);
        }
    }
}
