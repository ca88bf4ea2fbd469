//! Event engine: per-connection read/write events, the timer tree, posted
//! queues, and the reactor that drives them.
//!
//! Events are owned by their connection: read and write events live in
//! parallel arrays indexed by connection slot, so the connection, its
//! events, and any timer referencing them share one lifetime without
//! reference counting. The timer tree and posted queues hold `(slot,
//! kind)` references only.

pub mod posted;
pub mod reactor;
pub mod timer;

pub use reactor::Reactor;

pub type ConnId = usize;

/// Handlers are plain functions over the reactor; only one runs at a time
/// (single-threaded worker), so they may freely mutate reactor state.
pub type EventHandler = fn(&mut Reactor, ConnId);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Read,
    Write,
}

/// Protocol-handler verdict. `Again` means "re-invoke me when my event
/// or timer fires" — the core will not re-invoke otherwise. `Declined`
/// passes control to the next phase of a handler pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)] // Declined is produced by multi-phase handler chains
pub enum HandlerResult {
    Ok,
    Again,
    Error,
    Declined,
}

fn nop_handler(_: &mut Reactor, _: ConnId) {}

/// One direction (read or write) of a connection's readiness state.
#[derive(Debug)]
pub struct Event {
    pub handler: EventHandler,
    /// Registered with the OS poller.
    pub active: bool,
    /// Readiness observed and not yet drained to `WouldBlock`.
    pub ready: bool,
    pub timedout: bool,
    pub timer_set: bool,
    pub timer_key: Option<timer::TimerKey>,
    /// Queued on a posted queue for this iteration.
    pub posted: bool,
    /// Listener accept event.
    pub accept: bool,
    /// Run from the deferred queue instead of inline.
    pub deferred: bool,
    /// One-shot registration; kept for parity with level-triggered
    /// backends, unused by the edge-triggered poller.
    pub oneshot: bool,
    /// Peer closed its direction.
    pub eof: bool,
}

impl Event {
    pub fn new() -> Self {
        Self {
            handler: nop_handler,
            active: false,
            ready: false,
            timedout: false,
            timer_set: false,
            timer_key: None,
            posted: false,
            accept: false,
            deferred: false,
            oneshot: false,
            eof: false,
        }
    }

    /// Rewind to a pristine state when the owning slot is reused.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_reset_clears_flags() {
        let mut ev = Event::new();
        ev.ready = true;
        ev.timedout = true;
        ev.posted = true;
        ev.accept = true;
        ev.reset();
        assert!(!ev.ready && !ev.timedout && !ev.posted && !ev.accept);
        assert!(ev.timer_key.is_none());
    }
}
