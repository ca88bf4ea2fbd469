//! The per-worker reactor: readiness dispatch, event posting, timers.
//!
//! One iteration: compute the poll timeout from the timer tree (and the
//! accept-mutex delay when the lock was missed), try the accept mutex,
//! poll, refresh the cached clock, drain the readiness batch into handler
//! invocations (posting instead of invoking while the accept mutex is
//! held), run posted accepts, release the mutex, expire timers, run
//! deferred events. Strictly single-threaded: a handler runs to
//! completion before anything else happens.
//!
//! Each readiness token carries the connection slot and the slot's
//! instance bit. A notification whose bit disagrees with the slot's
//! current bit belongs to a previous occupant of the slot and is dropped
//! silently — the only defense against a closed descriptor's readiness
//! arriving after the slot was reused.

use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, trace, warn};

use crate::conn::{ConnTable, Socket};
use crate::cycle::Cycle;
use crate::event::posted::PostedQueue;
use crate::event::timer::{TimerKey, TimerTarget, TimerTree};
use crate::event::{ConnId, Event, EventHandler, EventKind};
use crate::mem::Pool;
use crate::time::Clock;

/// Reusable idle connections sacrificed per slot-pressure round.
const DRAIN_BATCH: usize = 32;

/// Listener tokens live at the top of the token space; connection tokens
/// are `slot << 1 | instance` and never reach this range.
const LISTENER_TOKEN_BASE: usize = usize::MAX - 4096;

/// A listening socket as registered by this worker (reuseport workers
/// register only their own clone).
struct WorkerListener {
    socket: mio::net::TcpListener,
    cycle_index: usize,
    reuseport: bool,
    event: Event,
}

pub struct Reactor {
    pub cycle: Rc<Cycle>,
    pub worker: usize,
    poll: Poll,
    events: Events,
    pub conns: ConnTable,
    pub timers: TimerTree,
    listeners: Vec<WorkerListener>,
    posted_accept: PostedQueue,
    posted: PostedQueue,
    pub clock: Clock,

    use_accept_mutex: bool,
    accept_mutex_held: bool,
    post_events: bool,
    pub accept_disabled: i64,

    /// Graceful shutdown: stop accepting, drain, then exit.
    pub quit: bool,
    /// Immediate shutdown.
    pub terminate: bool,
    pub exiting: bool,
    shutdown_timer: Option<TimerKey>,
}

impl Reactor {
    pub fn new(cycle: Rc<Cycle>, worker: usize) -> io::Result<Self> {
        let n = cycle.config.worker_connections;
        let use_accept_mutex = cycle.config.accept_mutex
            && cycle.config.worker_processes > 1
            && cycle.config.process_mode == crate::config::ProcessMode::Master;
        let mut clock = Clock::new();
        clock.update();
        Ok(Self {
            cycle,
            worker,
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            conns: ConnTable::new(n),
            timers: TimerTree::new(),
            listeners: Vec::new(),
            posted_accept: PostedQueue::new(),
            posted: PostedQueue::new(),
            clock,
            use_accept_mutex,
            accept_mutex_held: false,
            post_events: false,
            accept_disabled: 0,
            quit: false,
            terminate: false,
            exiting: false,
            shutdown_timer: None,
        })
    }

    /// Dup this worker's share of the cycle's listeners into the poller.
    /// Under the accept mutex, shared listeners stay unregistered until
    /// the mutex is won; reuseport clones are always registered.
    pub fn register_listeners(&mut self) -> io::Result<()> {
        let cycle = Rc::clone(&self.cycle);
        for idx in cycle.worker_listeners(self.worker) {
            let l = &cycle.listeners[idx];
            let socket = l.worker_socket()?;
            let widx = self.listeners.len();
            let mut ev = Event::new();
            ev.accept = true;
            self.listeners.push(WorkerListener {
                socket,
                cycle_index: idx,
                reuseport: l.reuseport,
                event: ev,
            });
            if l.reuseport || !self.use_accept_mutex {
                self.enable_listener(widx)?;
            }
        }
        Ok(())
    }

    fn enable_listener(&mut self, widx: usize) -> io::Result<()> {
        let wl = &mut self.listeners[widx];
        if wl.event.active {
            return Ok(());
        }
        self.poll.registry().register(
            &mut wl.socket,
            Token(LISTENER_TOKEN_BASE + widx),
            Interest::READABLE,
        )?;
        wl.event.active = true;
        Ok(())
    }

    fn disable_listener(&mut self, widx: usize) -> io::Result<()> {
        let wl = &mut self.listeners[widx];
        if !wl.event.active {
            return Ok(());
        }
        self.poll.registry().deregister(&mut wl.socket)?;
        wl.event.active = false;
        Ok(())
    }

    fn enable_accept_events(&mut self) {
        for widx in 0..self.listeners.len() {
            if !self.listeners[widx].reuseport {
                if let Err(e) = self.enable_listener(widx) {
                    warn!(error = %e, "failed to register listener");
                }
            }
        }
    }

    fn disable_accept_events(&mut self) {
        for widx in 0..self.listeners.len() {
            if !self.listeners[widx].reuseport {
                if let Err(e) = self.disable_listener(widx) {
                    warn!(error = %e, "failed to deregister listener");
                }
            }
        }
    }

    /// Stop accepting for good (graceful shutdown).
    pub fn close_listeners(&mut self) {
        for widx in 0..self.listeners.len() {
            let _ = self.disable_listener(widx);
        }
        self.listeners.clear();
    }

    fn token(&self, cid: ConnId) -> Token {
        Token((cid << 1) | self.conns.conn(cid).instance as usize)
    }

    /// Register a connection's socket for read and write readiness
    /// (edge-triggered; handlers drain until `WouldBlock`).
    pub fn register_connection(&mut self, cid: ConnId) -> io::Result<()> {
        let token = self.token(cid);
        let interest = Interest::READABLE.add(Interest::WRITABLE);
        let registry = self.poll.registry();
        let c = self.conns.conn_mut(cid);
        match c.socket.as_mut() {
            Some(Socket::Stream(s)) => registry.register(s, token, interest)?,
            Some(Socket::Plain(fd)) => {
                let fd = *fd;
                registry.register(&mut SourceFd(&fd), token, Interest::READABLE)?
            }
            _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "not registrable")),
        }
        self.conns.event_mut(cid, EventKind::Read).active = true;
        self.conns.event_mut(cid, EventKind::Write).active = true;
        Ok(())
    }

    /// Attach a plumbing descriptor (channel, signal pipe) to a slot and
    /// watch it for readability.
    pub fn add_plain(&mut self, fd: RawFd, handler: EventHandler) -> io::Result<ConnId> {
        let cid = self
            .conns
            .acquire(Socket::Plain(fd))
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "connection table full"))?;
        self.conns.event_mut(cid, EventKind::Read).handler = handler;
        self.register_connection(cid)?;
        Ok(cid)
    }

    pub fn set_handlers(&mut self, cid: ConnId, read: EventHandler, write: EventHandler) {
        self.conns.event_mut(cid, EventKind::Read).handler = read;
        self.conns.event_mut(cid, EventKind::Write).handler = write;
    }

    /// Arm (or re-arm) an event's timer.
    pub fn add_timer(&mut self, cid: ConnId, kind: EventKind, ms: u64) {
        self.del_timer(cid, kind);
        let key = self.timers.add(
            self.clock.now_ms(),
            ms,
            TimerTarget::Event { conn: cid, kind },
        );
        let ev = self.conns.event_mut(cid, kind);
        ev.timer_set = true;
        ev.timedout = false;
        ev.timer_key = Some(key);
    }

    pub fn del_timer(&mut self, cid: ConnId, kind: EventKind) {
        let ev = self.conns.event_mut(cid, kind);
        if let Some(key) = ev.timer_key.take() {
            ev.timer_set = false;
            self.timers.remove(key);
        }
    }

    /// Arm the worker-wide drain deadline used during graceful exit.
    pub fn add_shutdown_timer(&mut self, ms: u64) {
        let key = self
            .timers
            .add(self.clock.now_ms(), ms, TimerTarget::WorkerShutdown);
        self.shutdown_timer = Some(key);
    }

    /// Queue an event for deferred execution later this iteration.
    pub fn post(&mut self, cid: ConnId, kind: EventKind) {
        let ev = self.conns.event_mut(cid, kind);
        if ev.posted {
            return;
        }
        ev.posted = true;
        self.posted.push(cid, kind);
    }

    /// Tear down a connection: cancel timers and posted entries, withdraw
    /// the OS registration, close the socket, run pool cleanups, flip the
    /// instance bit, and return the slot to the free list.
    pub fn close_connection(&mut self, cid: ConnId) {
        if !self.conns.in_use(cid) {
            return;
        }
        self.del_timer(cid, EventKind::Read);
        self.del_timer(cid, EventKind::Write);
        self.conns.event_mut(cid, EventKind::Read).posted = false;
        self.conns.event_mut(cid, EventKind::Write).posted = false;

        let registry = self.poll.registry();
        let c = self.conns.conn_mut(cid);
        match c.socket.as_mut() {
            Some(Socket::Stream(s)) => {
                let _ = registry.deregister(s);
            }
            Some(Socket::Plain(fd)) => {
                let fd = *fd;
                let _ = registry.deregister(&mut SourceFd(&fd));
            }
            Some(Socket::Listener(l)) => {
                let _ = registry.deregister(l);
            }
            None => {}
        }

        self.conns.release(cid);
        self.cycle
            .shared
            .set_active(self.worker, self.conns.stream_count() as u64);
        trace!(conn = cid, "connection closed");
    }

    /// Evict the oldest reusable idle connections to relieve slot
    /// pressure.
    pub fn drain_reusable(&mut self) {
        for _ in 0..DRAIN_BATCH {
            match self.conns.pop_reusable() {
                Some(cid) => {
                    debug!(conn = cid, "reusing idle connection slot");
                    self.conns.conn_mut(cid).close = true;
                    self.close_connection(cid);
                }
                None => break,
            }
        }
    }

    pub fn active_streams(&self) -> usize {
        self.conns.stream_count()
    }

    /// Synthesize close on every client connection (drain deadline hit or
    /// zero-grace shutdown).
    pub fn close_all_streams(&mut self) {
        for cid in self.conns.live_slots() {
            if self
                .conns
                .conn(cid)
                .socket
                .as_ref()
                .is_some_and(Socket::is_stream)
            {
                self.conns.conn_mut(cid).close = true;
                self.close_connection(cid);
            }
        }
    }

    /// One reactor iteration.
    pub fn run_iteration(&mut self) -> io::Result<()> {
        let now = self.clock.now_ms();
        let mut timeout = self.timers.timeout_ms(now);

        if self.use_accept_mutex && !self.exiting {
            if self.accept_disabled > 0 {
                self.accept_disabled -= 1;
            } else {
                self.trylock_accept_mutex();
                if !self.accept_mutex_held {
                    let delay = self.cycle.config.accept_mutex_delay_ms;
                    timeout = Some(timeout.map_or(delay, |t| t.min(delay)));
                }
            }
        }

        if !self.posted.is_empty() || !self.posted_accept.is_empty() {
            timeout = Some(0);
        }

        let mut events = std::mem::replace(&mut self.events, Events::with_capacity(0));
        let poll_result = self
            .poll
            .poll(&mut events, timeout.map(Duration::from_millis));

        self.clock.update();

        match poll_result {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                // Signal wake; the owning process loop inspects its flags.
                events.clear();
            }
            Err(e) => {
                self.events = events;
                if self.accept_mutex_held {
                    self.unlock_accept_mutex();
                }
                return Err(e);
            }
        }

        let batch: Vec<(usize, bool, bool, bool)> = events
            .iter()
            .map(|ev| {
                (
                    ev.token().0,
                    ev.is_readable() || ev.is_error(),
                    ev.is_writable(),
                    ev.is_read_closed(),
                )
            })
            .collect();
        self.events = events;

        for (tok, readable, writable, read_closed) in batch {
            self.handle_token(tok, readable, writable, read_closed);
        }

        self.run_posted_accepts();

        if self.accept_mutex_held {
            self.unlock_accept_mutex();
        }
        self.post_events = false;

        self.expire_timers();
        self.run_posted();
        Ok(())
    }

    /// Route one readiness notification. Split out from the iteration so
    /// stale-token discrimination is testable on its own.
    fn handle_token(&mut self, tok: usize, readable: bool, writable: bool, read_closed: bool) {
        if tok >= LISTENER_TOKEN_BASE {
            let widx = tok - LISTENER_TOKEN_BASE;
            if widx >= self.listeners.len() {
                return;
            }
            self.listeners[widx].event.ready = true;
            if self.post_events {
                if !self.listeners[widx].event.posted {
                    self.listeners[widx].event.posted = true;
                    self.posted_accept.push(widx, EventKind::Read);
                }
            } else {
                self.accept_ready(widx);
            }
            return;
        }

        let cid = tok >> 1;
        let instance = (tok & 1) != 0;
        if !self.conns.in_use(cid) || self.conns.conn(cid).instance != instance {
            trace!(conn = cid, "stale event");
            return;
        }

        if readable || read_closed {
            let ev = self.conns.event_mut(cid, EventKind::Read);
            ev.ready = true;
            if read_closed {
                ev.eof = true;
            }
            self.deliver(cid, EventKind::Read);
        }

        // The read handler may have closed or recycled the slot.
        if !self.conns.in_use(cid) || self.conns.conn(cid).instance != instance {
            return;
        }

        if writable {
            self.conns.event_mut(cid, EventKind::Write).ready = true;
            self.deliver(cid, EventKind::Write);
        }
    }

    fn deliver(&mut self, cid: ConnId, kind: EventKind) {
        let deferred = self.conns.event(cid, kind).deferred;
        if self.post_events || deferred {
            self.post(cid, kind);
        } else {
            self.invoke(cid, kind);
        }
    }

    fn invoke(&mut self, cid: ConnId, kind: EventKind) {
        let handler = self.conns.event(cid, kind).handler;
        handler(self, cid);
    }

    fn run_posted_accepts(&mut self) {
        while let Some((widx, _)) = self.posted_accept.pop() {
            if widx >= self.listeners.len() {
                continue;
            }
            let ev = &mut self.listeners[widx].event;
            if !ev.posted {
                continue;
            }
            ev.posted = false;
            if ev.ready {
                self.accept_ready(widx);
            }
        }
    }

    fn run_posted(&mut self) {
        while let Some((cid, kind)) = self.posted.pop() {
            if !self.conns.in_use(cid) {
                continue;
            }
            let ev = self.conns.event_mut(cid, kind);
            if !ev.posted {
                continue; // cancelled after posting
            }
            ev.posted = false;
            self.invoke(cid, kind);
        }
    }

    fn trylock_accept_mutex(&mut self) {
        let mutex = self.cycle.shared.accept_mutex();
        if mutex.try_lock(std::process::id()) {
            self.accept_mutex_held = true;
            self.post_events = true;
            self.enable_accept_events();
        } else {
            self.disable_accept_events();
        }
    }

    fn unlock_accept_mutex(&mut self) {
        let mutex = self.cycle.shared.accept_mutex();
        mutex.unlock(std::process::id());
        self.accept_mutex_held = false;
    }

    fn expire_timers(&mut self) {
        let now = self.clock.now_ms();
        for (key, target) in self.timers.take_due(now) {
            match target {
                TimerTarget::Event { conn, kind } => {
                    if !self.conns.in_use(conn) {
                        continue;
                    }
                    let ev = self.conns.event_mut(conn, kind);
                    if ev.timer_key != Some(key) {
                        continue; // re-armed or slot recycled
                    }
                    ev.timer_key = None;
                    ev.timer_set = false;
                    ev.timedout = true;
                    self.invoke(conn, kind);
                }
                TimerTarget::WorkerShutdown => {
                    self.shutdown_timer = None;
                    debug!("shutdown grace period over, closing remaining connections");
                    self.close_all_streams();
                }
            }
        }
    }

    /// Drain the accept backlog of one listener until `WouldBlock`.
    fn accept_ready(&mut self, widx: usize) {
        loop {
            if self.exiting {
                return;
            }
            if self.conns.free_count() == 0 {
                self.drain_reusable();
            }

            let accepted = self.listeners[widx].socket.accept();
            match accepted {
                Ok((stream, peer)) => {
                    let li = self.listeners[widx].cycle_index;
                    self.cycle.shared.note_accept(self.worker);
                    let Some(cid) = self.conns.acquire(Socket::Stream(stream)) else {
                        warn!("connection table exhausted, dropping accept");
                        self.update_accept_disabled();
                        continue;
                    };
                    let pool_size = self.cycle.listeners[li].pool_size;
                    {
                        let c = self.conns.conn_mut(cid);
                        c.listener = Some(li);
                        c.remote_addr = Some(peer);
                        c.pool = Some(Pool::new(pool_size));
                    }
                    self.update_accept_disabled();
                    self.cycle
                        .shared
                        .set_active(self.worker, self.conns.stream_count() as u64);

                    if let Err(e) = self.register_connection(cid) {
                        debug!(conn = cid, error = %e, "registration failed");
                        self.close_connection(cid);
                        continue;
                    }
                    trace!(conn = cid, peer = %peer, "accepted");

                    let handler = self.cycle.listeners[li].handler.get();
                    match handler {
                        Some(init) => init(self, cid),
                        None => self.close_connection(cid),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.listeners[widx].event.ready = false;
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    self.listeners[widx].event.ready = false;
                    break;
                }
            }
        }
    }

    fn update_accept_disabled(&mut self) {
        self.accept_disabled =
            self.conns.capacity() as i64 / 8 - self.conns.free_count() as i64;
    }
}
