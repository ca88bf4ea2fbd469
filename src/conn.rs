//! Fixed-size connection table.
//!
//! Connection slots, read-event slots, and write-event slots are three
//! parallel arrays sized `worker_connections` at worker start; the table
//! never grows. A free list is threaded through unused slots. Every slot
//! carries an instance bit that flips on release: the reactor encodes the
//! bit into the OS registration token, so a readiness notification for a
//! previous occupant of the slot is recognized and dropped.
//!
//! Idle connections marked reusable sit on an LRU queue; under slot
//! pressure the oldest reusable connection is sacrificed to serve a new
//! accept.

#![allow(dead_code)] // connection state bits are contract surface for protocol modules

use std::any::Any;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::net::{TcpListener, TcpStream};

use crate::event::{Event, EventKind};
use crate::mem::Pool;

/// What a connection slot is attached to.
#[derive(Debug)]
pub enum Socket {
    Stream(TcpStream),
    Listener(TcpListener),
    /// A borrowed descriptor (channel, signal pipe); not closed on drop.
    Plain(RawFd),
}

impl Socket {
    pub fn raw_fd(&self) -> RawFd {
        match self {
            Socket::Stream(s) => s.as_raw_fd(),
            Socket::Listener(l) => l.as_raw_fd(),
            Socket::Plain(fd) => *fd,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Socket::Stream(_))
    }
}

/// A slot in the connection table. `socket.is_some()` iff the slot is in
/// use.
#[derive(Default)]
pub struct Connection {
    pub socket: Option<Socket>,
    /// Index of the owning listener in the cycle's listener array.
    pub listener: Option<usize>,
    pub pool: Option<Pool>,
    /// Protocol-module state.
    pub data: Option<Box<dyn Any>>,
    pub remote_addr: Option<SocketAddr>,
    pub sent: u64,
    pub received: u64,

    /// Flipped on release; stale readiness is detected against it.
    pub instance: bool,
    pub error: bool,
    pub timedout: bool,
    pub close: bool,
    pub destroyed: bool,
    pub idle: bool,
    pub reusable: bool,
    pub pipeline: bool,

    next_free: Option<usize>,
}

pub struct ConnTable {
    conns: Vec<Connection>,
    read: Vec<Event>,
    write: Vec<Event>,
    free_head: Option<usize>,
    free: usize,
    streams: usize,
    reusable_lru: VecDeque<usize>,
}

impl ConnTable {
    pub fn new(n: usize) -> Self {
        let mut conns = Vec::with_capacity(n);
        let mut read = Vec::with_capacity(n);
        let mut write = Vec::with_capacity(n);
        for i in 0..n {
            let mut c = Connection::default();
            c.next_free = if i + 1 < n { Some(i + 1) } else { None };
            conns.push(c);
            read.push(Event::new());
            write.push(Event::new());
        }
        Self {
            conns,
            read,
            write,
            free_head: if n > 0 { Some(0) } else { None },
            free: n,
            streams: 0,
            reusable_lru: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.conns.len()
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    pub fn used(&self) -> usize {
        self.capacity() - self.free
    }

    /// Live client (stream) connections; listeners and plumbing fds are
    /// not counted.
    pub fn stream_count(&self) -> usize {
        self.streams
    }

    /// Pop a free slot and attach `socket`. Returns `None` when the table
    /// is exhausted.
    pub fn acquire(&mut self, socket: Socket) -> Option<usize> {
        let cid = self.free_head?;
        self.free_head = self.conns[cid].next_free;
        self.free -= 1;
        if socket.is_stream() {
            self.streams += 1;
        }

        let instance = self.conns[cid].instance;
        let c = &mut self.conns[cid];
        *c = Connection {
            socket: Some(socket),
            instance,
            ..Connection::default()
        };
        self.read[cid].reset();
        self.write[cid].reset();
        Some(cid)
    }

    /// Detach everything from the slot and thread it back onto the free
    /// list. The instance bit flips so in-flight readiness for the old
    /// occupant is recognized as stale. Protocol state drops before the
    /// pool so buffers never outlive their arenas.
    pub fn release(&mut self, cid: usize) {
        let c = &mut self.conns[cid];
        debug_assert!(c.socket.is_some(), "releasing a free slot");
        if c.socket.as_ref().is_some_and(Socket::is_stream) {
            self.streams -= 1;
        }
        c.destroyed = true;
        c.reusable = false;
        c.data = None;
        c.pool = None;
        c.socket = None;
        c.listener = None;
        c.remote_addr = None;
        c.instance = !c.instance;
        c.next_free = self.free_head;
        self.free_head = Some(cid);
        self.free += 1;
    }

    pub fn conn(&self, cid: usize) -> &Connection {
        &self.conns[cid]
    }

    pub fn conn_mut(&mut self, cid: usize) -> &mut Connection {
        &mut self.conns[cid]
    }

    pub fn in_use(&self, cid: usize) -> bool {
        self.conns.get(cid).is_some_and(|c| c.socket.is_some())
    }

    pub fn event(&self, cid: usize, kind: EventKind) -> &Event {
        match kind {
            EventKind::Read => &self.read[cid],
            EventKind::Write => &self.write[cid],
        }
    }

    pub fn event_mut(&mut self, cid: usize, kind: EventKind) -> &mut Event {
        match kind {
            EventKind::Read => &mut self.read[cid],
            EventKind::Write => &mut self.write[cid],
        }
    }

    /// Mark or unmark a connection as reusable under slot pressure.
    /// Unmarking is lazy: the LRU entry stays behind and is skipped when
    /// popped.
    pub fn set_reusable(&mut self, cid: usize, reusable: bool) {
        let was = self.conns[cid].reusable;
        self.conns[cid].reusable = reusable;
        if reusable && !was {
            self.reusable_lru.push_back(cid);
        }
    }

    /// Oldest connection still marked reusable, if any.
    pub fn pop_reusable(&mut self) -> Option<usize> {
        while let Some(cid) = self.reusable_lru.pop_front() {
            if self.conns[cid].reusable && self.conns[cid].socket.is_some() {
                self.conns[cid].reusable = false;
                return Some(cid);
            }
        }
        None
    }

    /// Slots currently attached to a socket, in index order.
    pub fn live_slots(&self) -> Vec<usize> {
        (0..self.conns.len())
            .filter(|&i| self.conns[i].socket.is_some())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_exhausts_at_capacity() {
        let mut t = ConnTable::new(4);
        let mut got = Vec::new();
        while let Some(cid) = t.acquire(Socket::Plain(0)) {
            got.push(cid);
        }
        assert_eq!(got.len(), 4);
        assert_eq!(t.free_count(), 0);
        assert!(t.acquire(Socket::Plain(0)).is_none());
    }

    #[test]
    fn test_release_recycles_lifo() {
        let mut t = ConnTable::new(2);
        let a = t.acquire(Socket::Plain(0)).unwrap();
        let b = t.acquire(Socket::Plain(0)).unwrap();
        t.release(a);
        t.release(b);
        assert_eq!(t.free_count(), 2);
        let c = t.acquire(Socket::Plain(0)).unwrap();
        assert_eq!(c, b, "most recently released slot is reused first");
    }

    #[test]
    fn test_instance_bit_toggles_exactly_once_per_release() {
        let mut t = ConnTable::new(1);
        let cid = t.acquire(Socket::Plain(0)).unwrap();
        let first = t.conn(cid).instance;
        t.release(cid);
        assert_eq!(t.conn(cid).instance, !first);

        let cid = t.acquire(Socket::Plain(0)).unwrap();
        assert_eq!(t.conn(cid).instance, !first, "acquire does not toggle");
        t.release(cid);
        assert_eq!(t.conn(cid).instance, first);
    }

    #[test]
    fn test_release_clears_slot_state() {
        let mut t = ConnTable::new(1);
        let cid = t.acquire(Socket::Plain(0)).unwrap();
        t.conn_mut(cid).sent = 99;
        t.conn_mut(cid).data = Some(Box::new(5u32));
        t.event_mut(cid, EventKind::Read).ready = true;
        t.release(cid);

        let cid = t.acquire(Socket::Plain(0)).unwrap();
        assert_eq!(t.conn(cid).sent, 0);
        assert!(t.conn(cid).data.is_none());
        assert!(!t.event(cid, EventKind::Read).ready);
    }

    #[test]
    fn test_reusable_lru_pops_oldest_live_entry() {
        let mut t = ConnTable::new(4);
        let a = t.acquire(Socket::Plain(0)).unwrap();
        let b = t.acquire(Socket::Plain(0)).unwrap();
        let c = t.acquire(Socket::Plain(0)).unwrap();
        t.set_reusable(a, true);
        t.set_reusable(b, true);
        t.set_reusable(c, true);

        // `a` becomes busy again before pressure hits.
        t.set_reusable(a, false);

        assert_eq!(t.pop_reusable(), Some(b));
        assert_eq!(t.pop_reusable(), Some(c));
        assert_eq!(t.pop_reusable(), None);
    }

    #[test]
    fn test_channel_slot_leaves_n_minus_one_for_clients() {
        // The master channel occupies one slot at worker start; every
        // remaining slot serves a client.
        let n = 8;
        let mut t = ConnTable::new(n);
        let _channel = t.acquire(Socket::Plain(0)).unwrap();

        let mut clients = 0;
        while t.acquire(Socket::Plain(1)).is_some() {
            clients += 1;
        }
        assert_eq!(clients, n - 1);
    }

    #[test]
    fn test_stream_count_tracks_client_connections() {
        let mut t = ConnTable::new(4);
        let plumbing = t.acquire(Socket::Plain(0)).unwrap();
        assert_eq!(t.stream_count(), 0);
        t.release(plumbing);
        assert_eq!(t.stream_count(), 0);
    }
}
