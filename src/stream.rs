//! Stream echo module.
//!
//! A minimal protocol consumer of the core: it reads whatever arrives
//! into pool-backed buffers, queues them on an output chain, and writes
//! them back, recycling consumed buffers through the tag-based
//! reclamation path. Serves as the reference for how protocol modules
//! plug into listeners, events, timers, and connection pools.

use std::io::{Read, Write};
use std::rc::Rc;

use tracing::debug;

use crate::conn::Socket;
use crate::cycle::Cycle;
use crate::event::{ConnId, EventKind, HandlerResult, Reactor};
use crate::mem::{chain_link, update_chains, update_sent, Buf, BufTag, Chain};
use crate::module::{Module, ModuleError};

const BUF_SIZE: usize = 4096;
const STREAM_TAG: BufTag = Some("stream");
const IDLE_TIMEOUT_MS: u64 = 60_000;
const SEND_TIMEOUT_MS: u64 = 10_000;

pub struct StreamModule;

impl Module for StreamModule {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn init_module(&self, cycle: &Cycle) -> Result<(), ModuleError> {
        for l in &cycle.listeners {
            l.handler.set(Some(init_connection));
        }
        Ok(())
    }
}

/// Per-connection echo state. `out` is the send cursor; `busy` tracks
/// the same buffers by shared handle until they are fully sent, at which
/// point tag-based reclamation resets them onto `free` for the next read.
struct EchoState {
    free: Chain,
    busy: Chain,
    out: Chain,
    eof: bool,
}

fn init_connection(r: &mut Reactor, cid: ConnId) {
    r.conns.conn_mut(cid).data = Some(Box::new(EchoState {
        free: Chain::new(),
        busy: Chain::new(),
        out: Chain::new(),
        eof: false,
    }));
    r.set_handlers(cid, stream_read, stream_write);
    r.add_timer(cid, EventKind::Read, IDLE_TIMEOUT_MS);
}

fn stream_read(r: &mut Reactor, cid: ConnId) {
    if r.conns.event(cid, EventKind::Read).timedout || r.conns.conn(cid).close {
        debug!(conn = cid, "closing idle connection");
        r.conns.conn_mut(cid).timedout = true;
        r.close_connection(cid);
        return;
    }

    match read_available(r, cid) {
        HandlerResult::Error => {
            r.conns.conn_mut(cid).error = true;
            r.close_connection(cid);
        }
        _ => {
            r.conns.conn_mut(cid).idle = false;
            r.conns.set_reusable(cid, false);
            stream_write(r, cid);
        }
    }
}

fn stream_write(r: &mut Reactor, cid: ConnId) {
    if r.conns.event(cid, EventKind::Write).timedout || r.conns.conn(cid).close {
        r.conns.conn_mut(cid).timedout = true;
        r.close_connection(cid);
        return;
    }

    match write_pending(r, cid) {
        HandlerResult::Error => {
            r.conns.conn_mut(cid).error = true;
            r.close_connection(cid);
        }
        HandlerResult::Again => {
            // Kernel buffer full: wait for the writable edge, bounded.
            r.add_timer(cid, EventKind::Write, SEND_TIMEOUT_MS);
        }
        HandlerResult::Ok | HandlerResult::Declined => {
            let (eof, drained) = state_flags(r, cid);
            if !drained {
                return;
            }
            r.del_timer(cid, EventKind::Write);
            if eof {
                r.close_connection(cid);
            } else {
                // Everything echoed; park as reusable idle.
                r.conns.conn_mut(cid).idle = true;
                r.conns.set_reusable(cid, true);
                r.add_timer(cid, EventKind::Read, IDLE_TIMEOUT_MS);
            }
        }
    }
}

/// Drain the socket into pool-backed buffers until `WouldBlock` or EOF.
fn read_available(r: &mut Reactor, cid: ConnId) -> HandlerResult {
    let mut total: u64 = 0;
    let mut eof = false;
    let mut again = false;
    let mut error = false;

    {
        let c = r.conns.conn_mut(cid);
        let Some(Socket::Stream(sock)) = c.socket.as_mut() else {
            return HandlerResult::Error;
        };
        let pool = c.pool.as_mut().expect("stream connection has a pool");
        let Some(state) = c.data.as_mut().and_then(|d| d.downcast_mut::<EchoState>()) else {
            return HandlerResult::Error;
        };

        loop {
            let link = state.free.pop_front().unwrap_or_else(|| {
                let mut b = Buf::temp(pool, BUF_SIZE);
                b.tag = STREAM_TAG;
                chain_link(b)
            });

            let res = {
                let mut b = link.borrow_mut();
                let room = b.writable();
                sock.read(room)
            };

            match res {
                Ok(0) => {
                    eof = true;
                    state.free.push_front(link);
                    break;
                }
                Ok(n) => {
                    link.borrow_mut().advance_last(n);
                    total += n as u64;
                    state.busy.push_back(Rc::clone(&link));
                    state.out.push_back(link);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    again = true;
                    state.free.push_front(link);
                    break;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    state.free.push_front(link);
                    continue;
                }
                Err(_) => {
                    error = true;
                    break;
                }
            }
        }

        state.eof |= eof;
        c.received += total;
    }

    if error {
        return HandlerResult::Error;
    }
    if again {
        r.conns.event_mut(cid, EventKind::Read).ready = false;
    }
    if eof {
        r.conns.event_mut(cid, EventKind::Read).eof = true;
    }
    if again {
        HandlerResult::Again
    } else {
        HandlerResult::Ok
    }
}

/// Push the queued chains to the socket, reclaiming consumed buffers.
fn write_pending(r: &mut Reactor, cid: ConnId) -> HandlerResult {
    enum Step {
        Done,
        Stuck,
        Wrote(std::io::Result<usize>),
    }

    let mut sent_total: usize = 0;
    let mut would_block = false;
    let mut error = false;

    {
        let c = r.conns.conn_mut(cid);
        let Some(Socket::Stream(sock)) = c.socket.as_mut() else {
            return HandlerResult::Error;
        };
        let Some(state) = c.data.as_mut().and_then(|d| d.downcast_mut::<EchoState>()) else {
            return HandlerResult::Error;
        };

        update_chains(&mut state.free, &mut state.busy, &mut Chain::new(), STREAM_TAG);

        loop {
            let step = match state.out.front() {
                None => Step::Done,
                Some(link) => {
                    let b = link.borrow();
                    if b.size() == 0 {
                        Step::Stuck
                    } else {
                        Step::Wrote(sock.write(b.readable()))
                    }
                }
            };

            match step {
                Step::Done | Step::Stuck => break,
                Step::Wrote(Ok(0)) => {
                    error = true;
                    break;
                }
                Step::Wrote(Ok(n)) => {
                    update_sent(&mut state.out, n as u64);
                    sent_total += n;
                }
                Step::Wrote(Err(ref e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    would_block = true;
                    break;
                }
                Step::Wrote(Err(ref e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Step::Wrote(Err(_)) => {
                    error = true;
                    break;
                }
            }
        }

        update_chains(&mut state.free, &mut state.busy, &mut Chain::new(), STREAM_TAG);
        c.sent += sent_total as u64;
    }

    if error {
        return HandlerResult::Error;
    }
    if would_block {
        r.conns.event_mut(cid, EventKind::Write).ready = false;
        return HandlerResult::Again;
    }
    HandlerResult::Ok
}

fn state_flags(r: &Reactor, cid: ConnId) -> (bool, bool) {
    match r
        .conns
        .conn(cid)
        .data
        .as_ref()
        .and_then(|d| d.downcast_ref::<EchoState>())
    {
        Some(s) => (s.eof, s.out.is_empty()),
        None => (false, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigSource, ProcessMode};
    use crate::cycle::Cycle;
    use crate::event::timer::TimerTarget;
    use crate::log::LogTarget;
    use crate::module::ModuleRegistry;
    use std::net::{Shutdown, TcpStream as StdTcpStream};
    use std::path::PathBuf;
    use std::rc::Rc;
    use std::time::Duration;

    fn echo_cycle(connections: usize) -> Rc<Cycle> {
        let src = ConfigSource {
            path: None,
            directives: vec![
                format!("worker.connections = {connections}"),
                "worker.processes = 1".to_string(),
                "[[listener]]\nlisten = \"127.0.0.1:0\"".to_string(),
            ],
            prefix: PathBuf::from("."),
            log_level: "info".to_string(),
        };
        let mut config = Config::load(&src).expect("config");
        config.process_mode = ProcessMode::Single;

        let mut reg = ModuleRegistry::new();
        reg.register(Rc::new(StreamModule));
        Cycle::build(config, Rc::new(reg), LogTarget::stderr(), &[], None).expect("cycle")
    }

    fn tick(r: &mut Reactor) {
        let now = r.clock.now_ms();
        r.timers.add(
            now,
            10,
            TimerTarget::Event {
                conn: usize::MAX >> 8,
                kind: EventKind::Read,
            },
        );
    }

    #[test]
    fn test_single_request_lifecycle() {
        let cycle = echo_cycle(16);
        let addr = cycle.listeners[0].addr.get();
        let mut r = Reactor::new(Rc::clone(&cycle), 0).expect("reactor");
        r.register_listeners().expect("register");
        let instance_before = r.conns.conn(0).instance;

        let mut client = StdTcpStream::connect(addr).expect("connect");
        client.set_nodelay(true).ok();
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        client.write_all(b"hello").expect("send");
        client.shutdown(Shutdown::Write).expect("half-close");

        let mut got = Vec::new();
        let mut closed = false;
        for _ in 0..200 {
            tick(&mut r);
            r.run_iteration().expect("iteration");
            let mut chunk = [0u8; 32];
            match client.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => got.extend_from_slice(&chunk[..n]),
                Err(_) => {}
            }
        }

        assert_eq!(got, b"hello", "the five bytes come back verbatim");
        assert!(closed, "server closes after echoing a half-closed peer");

        for _ in 0..50 {
            if r.active_streams() == 0 {
                break;
            }
            tick(&mut r);
            r.run_iteration().expect("iteration");
        }
        assert_eq!(r.active_streams(), 0);
        assert_eq!(r.conns.free_count(), r.conns.capacity(), "slot returned to free list");
        assert_eq!(
            r.conns.conn(0).instance,
            !instance_before,
            "instance bit flipped exactly once"
        );
        assert_eq!(cycle.shared.accepted(0), 1);
    }

    #[test]
    fn test_keepalive_connection_parks_as_reusable() {
        let cycle = echo_cycle(16);
        let addr = cycle.listeners[0].addr.get();
        let mut r = Reactor::new(Rc::clone(&cycle), 0).expect("reactor");
        r.register_listeners().expect("register");

        let mut client = StdTcpStream::connect(addr).expect("connect");
        client.set_nodelay(true).ok();
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();

        // Two rounds on the same connection; buffers recycle in between.
        for round in 0..2u8 {
            let payload = [b'a' + round; 600];
            client.write_all(&payload).expect("send");
            let mut got = Vec::new();
            for _ in 0..200 {
                tick(&mut r);
                r.run_iteration().expect("iteration");
                let mut chunk = [0u8; 1024];
                match client.read(&mut chunk) {
                    Ok(n) if n > 0 => got.extend_from_slice(&chunk[..n]),
                    _ => {}
                }
                if got.len() == payload.len() {
                    break;
                }
            }
            assert_eq!(got, payload);
        }

        // Quiet connection ends up parked on the reusable LRU.
        for _ in 0..10 {
            tick(&mut r);
            r.run_iteration().expect("iteration");
            if r.conns.conn(0).reusable {
                break;
            }
        }
        assert!(r.conns.conn(0).idle);
        assert!(r.conns.conn(0).reusable);
        assert_eq!(r.active_streams(), 1);
        assert!(r.conns.conn(0).received >= 1200);
        assert_eq!(r.conns.conn(0).received, r.conns.conn(0).sent);
    }
}
