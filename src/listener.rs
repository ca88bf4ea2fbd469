//! Listening-socket lifecycle: open, inherit, clone, close.
//!
//! When a new cycle is built, each configured listener first looks for a
//! matching socket in the previous cycle and inherits its descriptor, so
//! a reload never closes a listening socket that stays configured — the
//! accept queue and every pending connection survive. Only genuinely new
//! addresses are bound fresh. Listeners carried across an exec-based
//! binary upgrade arrive as descriptor numbers in an environment
//! variable and are adopted the same way.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, info, warn};

use crate::config::ListenerConfig;
use crate::event::{ConnId, Reactor};

/// Installed by a protocol module; invoked once per accepted connection.
pub type ConnInit = fn(&mut Reactor, ConnId);

pub struct Listener {
    pub addr: Cell<SocketAddr>,
    pub backlog: i32,
    pub pool_size: usize,
    pub reuseport: bool,
    pub keepalive: bool,
    pub rcvbuf: Option<usize>,
    pub sndbuf: Option<usize>,
    /// Owning worker for reuseport clones; `None` means every worker
    /// registers this listener (guarded by the accept mutex).
    pub worker: Option<usize>,
    pub wildcard: bool,

    pub socket: RefCell<Option<std::net::TcpListener>>,
    pub open: Cell<bool>,
    /// Old-cycle marker: the socket moved into the new cycle, do not
    /// close it when the old cycle shuts down.
    pub remain: Cell<bool>,
    pub inherited: Cell<bool>,
    pub ignore: Cell<bool>,
    pub bound: Cell<bool>,

    pub handler: Cell<Option<ConnInit>>,
}

impl Listener {
    pub fn from_config(cfg: &ListenerConfig) -> Self {
        Self {
            addr: Cell::new(cfg.listen),
            backlog: cfg.backlog,
            pool_size: cfg.pool_size,
            reuseport: cfg.reuseport,
            keepalive: cfg.keepalive,
            rcvbuf: cfg.rcvbuf,
            sndbuf: cfg.sndbuf,
            worker: None,
            wildcard: cfg.listen.ip().is_unspecified(),
            socket: RefCell::new(None),
            open: Cell::new(false),
            remain: Cell::new(false),
            inherited: Cell::new(false),
            ignore: Cell::new(false),
            bound: Cell::new(false),
            handler: Cell::new(None),
        }
    }

    /// Adopt an already-listening descriptor (binary upgrade).
    fn from_inherited_fd(fd: RawFd) -> io::Result<Self> {
        let socket = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        socket.set_nonblocking(true)?;
        let addr = socket.local_addr()?;
        Ok(Self {
            addr: Cell::new(addr),
            backlog: 511,
            pool_size: 1024,
            reuseport: false,
            keepalive: false,
            rcvbuf: None,
            sndbuf: None,
            worker: None,
            wildcard: addr.ip().is_unspecified(),
            socket: RefCell::new(Some(socket)),
            open: Cell::new(true),
            remain: Cell::new(false),
            inherited: Cell::new(true),
            ignore: Cell::new(false),
            bound: Cell::new(true),
            handler: Cell::new(None),
        })
    }

    /// socket/bind/listen with per-listener options applied.
    fn open_socket(&self) -> io::Result<std::net::TcpListener> {
        let addr = self.addr.get();
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if self.reuseport {
            socket.set_reuse_port(true)?;
        }
        if self.keepalive {
            socket.set_keepalive(true)?;
        }
        if let Some(n) = self.rcvbuf {
            socket.set_recv_buffer_size(n)?;
        }
        if let Some(n) = self.sndbuf {
            socket.set_send_buffer_size(n)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.backlog)?;
        Ok(socket.into())
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.borrow().as_ref().map(|s| s.as_raw_fd())
    }

    /// Nonblocking dup of the listening socket for a worker's poller.
    pub fn worker_socket(&self) -> io::Result<mio::net::TcpListener> {
        let sock = self.socket.borrow();
        let sock = sock
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener not open"))?;
        Ok(mio::net::TcpListener::from_std(sock.try_clone()?))
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.addr.get())
            .field("worker", &self.worker)
            .field("reuseport", &self.reuseport)
            .field("open", &self.open.get())
            .field("inherited", &self.inherited.get())
            .finish()
    }
}

/// Expand reuseport listeners into one clone per worker. The base keeps
/// worker 0; clones take 1..n. Non-reuseport listeners stay shared.
pub fn clone_reuseport(listeners: &mut Vec<Listener>, workers: usize) {
    let mut clones = Vec::new();
    for l in listeners.iter_mut() {
        if !l.reuseport || workers <= 1 {
            continue;
        }
        l.worker = Some(0);
        for w in 1..workers {
            let cfg = ListenerConfig {
                listen: l.addr.get(),
                backlog: l.backlog,
                reuseport: true,
                pool_size: l.pool_size,
                keepalive: l.keepalive,
                rcvbuf: l.rcvbuf,
                sndbuf: l.sndbuf,
            };
            let mut clone = Listener::from_config(&cfg);
            clone.worker = Some(w);
            clones.push(clone);
        }
    }
    listeners.append(&mut clones);
}

/// Open every listener in `new`, inheriting matching sockets from `old`.
/// On failure every moved socket is handed back and every freshly opened
/// one is closed, leaving `old` exactly as it was.
pub fn open_listeners(new: &[Listener], old: &[Listener]) -> io::Result<()> {
    let mut moved: Vec<(usize, usize)> = Vec::new();
    let mut failed: Option<io::Error> = None;

    for (i, lst) in new.iter().enumerate() {
        if lst.ignore.get() || lst.open.get() {
            continue;
        }

        let old_match = old.iter().position(|o| {
            !o.ignore.get()
                && o.socket.borrow().is_some()
                && o.addr.get() == lst.addr.get()
                && o.worker == lst.worker
        });

        match old_match {
            Some(oi) => {
                let sock = old[oi]
                    .socket
                    .borrow_mut()
                    .take()
                    .expect("matched listener has a socket");
                if old[oi].backlog != lst.backlog {
                    if let Err(e) = SockRef::from(&sock).listen(lst.backlog) {
                        warn!(addr = %lst.addr.get(), error = %e, "re-listen failed");
                        old[oi].socket.replace(Some(sock));
                        failed = Some(e);
                        break;
                    }
                }
                debug!(addr = %lst.addr.get(), fd = sock.as_raw_fd(), "inherited listener");
                lst.socket.replace(Some(sock));
                lst.open.set(true);
                lst.bound.set(true);
                lst.inherited.set(true);
                old[oi].remain.set(true);
                moved.push((i, oi));
            }
            None => match lst.open_socket() {
                Ok(sock) => {
                    if lst.addr.get().port() == 0 {
                        if let Ok(actual) = sock.local_addr() {
                            lst.addr.set(actual);
                        }
                    }
                    info!(addr = %lst.addr.get(), fd = sock.as_raw_fd(), "listening");
                    lst.socket.replace(Some(sock));
                    lst.open.set(true);
                    lst.bound.set(true);
                }
                Err(e) => {
                    warn!(addr = %lst.addr.get(), error = %e, "bind failed");
                    failed = Some(e);
                    break;
                }
            },
        }
    }

    if let Some(e) = failed {
        // Hand inherited sockets back to the old cycle, close fresh ones.
        for (i, oi) in moved {
            let sock = new[i].socket.borrow_mut().take();
            old[oi].socket.replace(sock);
            old[oi].remain.set(false);
            new[i].open.set(false);
            new[i].inherited.set(false);
        }
        for lst in new {
            if lst.open.get() {
                lst.socket.replace(None);
                lst.open.set(false);
            }
        }
        return Err(e);
    }
    Ok(())
}

/// Undo a successful `open_listeners` after a later cycle-init step
/// failed: inherited sockets go back to their old-cycle owners, fresh
/// sockets close.
pub fn rollback_listeners(new: &[Listener], old: &[Listener]) {
    for l in new {
        if l.inherited.get() {
            let owner = old.iter().find(|o| {
                o.remain.get()
                    && o.socket.borrow().is_none()
                    && o.addr.get() == l.addr.get()
                    && o.worker == l.worker
            });
            if let Some(o) = owner {
                o.socket.replace(l.socket.borrow_mut().take());
                o.remain.set(false);
            }
        } else {
            l.socket.replace(None);
        }
        l.open.set(false);
        l.inherited.set(false);
    }
}

/// Close listeners still owned by a retiring cycle; inherited sockets
/// (marked remain) are left alone because the new cycle owns them now.
pub fn close_listeners(listeners: &[Listener]) {
    for l in listeners {
        if l.remain.get() {
            continue;
        }
        if let Some(sock) = l.socket.borrow_mut().take() {
            debug!(addr = %l.addr.get(), fd = sock.as_raw_fd(), "closing listener");
        }
        l.open.set(false);
    }
}

/// Environment variable that carries listening descriptors across an
/// exec-based binary upgrade, as "fd1;fd2;…".
pub const INHERIT_ENV: &str = "PALISADE";

/// Adopt listeners from the upgrade environment variable, if present.
pub fn inherited_from_env() -> io::Result<Vec<Listener>> {
    let Ok(value) = std::env::var(INHERIT_ENV) else {
        return Ok(Vec::new());
    };
    let mut listeners = Vec::new();
    for part in value.split(';').filter(|p| !p.is_empty()) {
        let fd: RawFd = part
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad inherited fd list"))?;
        listeners.push(Listener::from_inherited_fd(fd)?);
    }
    if !listeners.is_empty() {
        info!(count = listeners.len(), "inherited listening sockets from environment");
    }
    Ok(listeners)
}

/// Build the upgrade fd list and make the descriptors survive exec.
pub fn env_fd_list(listeners: &[Listener]) -> String {
    let mut parts = Vec::new();
    for l in listeners {
        if let Some(fd) = l.raw_fd() {
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, 0); // clear FD_CLOEXEC
            }
            parts.push(fd.to_string());
        }
    }
    parts.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(port: u16) -> ListenerConfig {
        ListenerConfig {
            listen: format!("127.0.0.1:{port}").parse().unwrap(),
            backlog: 128,
            reuseport: false,
            pool_size: 1024,
            keepalive: false,
            rcvbuf: None,
            sndbuf: None,
        }
    }

    #[test]
    fn test_fresh_open_resolves_ephemeral_port() {
        let l = Listener::from_config(&cfg(0));
        open_listeners(std::slice::from_ref(&l), &[]).expect("open");
        assert!(l.open.get());
        assert_ne!(l.addr.get().port(), 0);
        assert!(!l.inherited.get());
    }

    #[test]
    fn test_reload_inherits_matching_socket() {
        let old = vec![Listener::from_config(&cfg(0))];
        open_listeners(&old, &[]).expect("open old");
        let fd = old[0].raw_fd().unwrap();
        let addr = old[0].addr.get();

        let new = vec![Listener::from_config(&ListenerConfig {
            listen: addr,
            ..cfg(0)
        })];
        open_listeners(&new, &old).expect("open new");

        assert_eq!(new[0].raw_fd(), Some(fd), "descriptor is inherited, not reopened");
        assert!(new[0].inherited.get());
        assert!(old[0].remain.get());
        assert!(old[0].socket.borrow().is_none());
    }

    #[test]
    fn test_reload_adds_new_listener_alongside_inherited() {
        let old = vec![Listener::from_config(&cfg(0))];
        open_listeners(&old, &[]).expect("open old");
        let addr_a = old[0].addr.get();
        let fd_a = old[0].raw_fd().unwrap();

        let new = vec![
            Listener::from_config(&ListenerConfig {
                listen: addr_a,
                ..cfg(0)
            }),
            Listener::from_config(&cfg(0)),
        ];
        open_listeners(&new, &old).expect("open new");

        assert_eq!(new[0].raw_fd(), Some(fd_a));
        assert!(new[1].raw_fd().is_some());
        assert_ne!(new[1].raw_fd(), Some(fd_a), "second listener is a fresh socket");
    }

    #[test]
    fn test_failed_open_rolls_back_inheritance() {
        let old = vec![Listener::from_config(&cfg(0))];
        open_listeners(&old, &[]).expect("open old");
        let addr = old[0].addr.get();
        let fd = old[0].raw_fd().unwrap();

        // Second listener collides with the first (same resolved port, no
        // reuse), so the batch fails after the inheritance happened.
        let new = vec![
            Listener::from_config(&ListenerConfig {
                listen: addr,
                ..cfg(0)
            }),
            Listener::from_config(&ListenerConfig {
                listen: addr,
                ..cfg(0)
            }),
        ];
        // The first inherits (so the old socket is momentarily gone), the
        // second tries to bind the same port and fails.
        let err = open_listeners(&new, &old);
        assert!(err.is_err());

        // Old cycle is exactly as before.
        assert_eq!(old[0].raw_fd(), Some(fd));
        assert!(!old[0].remain.get());
        assert!(new.iter().all(|l| l.socket.borrow().is_none()));
    }

    #[test]
    fn test_close_spares_remaining_sockets() {
        let old = vec![Listener::from_config(&cfg(0)), Listener::from_config(&cfg(0))];
        open_listeners(&old, &[]).expect("open");
        old[0].remain.set(true);
        let kept = old[0].socket.borrow().as_ref().map(|s| s.as_raw_fd());
        close_listeners(&old);
        assert_eq!(old[0].socket.borrow().as_ref().map(|s| s.as_raw_fd()), kept);
        assert!(old[1].socket.borrow().is_none());
    }

    #[test]
    fn test_clone_reuseport_expands_per_worker() {
        let mut listeners = vec![Listener::from_config(&ListenerConfig {
            reuseport: true,
            ..cfg(19001)
        })];
        clone_reuseport(&mut listeners, 4);
        assert_eq!(listeners.len(), 4);
        assert_eq!(listeners[0].worker, Some(0));
        let workers: Vec<_> = listeners.iter().map(|l| l.worker).collect();
        assert_eq!(workers, vec![Some(0), Some(1), Some(2), Some(3)]);
        assert!(listeners.iter().all(|l| l.reuseport));
    }

    #[test]
    fn test_non_reuseport_stays_shared() {
        let mut listeners = vec![Listener::from_config(&cfg(19002))];
        clone_reuseport(&mut listeners, 4);
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].worker, None);
    }
}
