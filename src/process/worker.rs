//! Worker process: reactor setup, the event loop, graceful drain.
//!
//! A worker owns one reactor over an immutable cycle. Commands arrive on
//! the master channel (registered in the poll set like any other
//! descriptor) and as signals, which merely interrupt the poll; the loop
//! re-checks its flags between iterations. Graceful shutdown closes the
//! listeners, keeps serving in-flight connections, and arms the
//! worker-wide drain timer; a zero grace period closes everything at
//! once.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, error, info, warn};

use crate::cycle::Cycle;
use crate::event::{ConnId, EventKind, Reactor};
use crate::process::channel::{Channel, Command};
use crate::process::signals;

/// Channel plumbing stored on the channel connection's slot.
pub struct ChannelState {
    pub channel: Channel,
    /// Sibling channels learned via OpenChannel, by process-table slot.
    pub peers: HashMap<u32, Channel>,
}

/// Run a worker until shutdown. `channel` is `None` in single-process
/// mode, where signals are the only control surface.
pub fn run(cycle: Rc<Cycle>, index: usize, channel: Option<Channel>) -> ! {
    signals::detach_self_pipe();
    signals::clear_all();
    if let Err(e) = signals::install(signals::WORKER_SIGNALS) {
        error!(error = %e, "worker signal setup failed");
        std::process::exit(1);
    }

    let mut reactor = match Reactor::new(Rc::clone(&cycle), index) {
        Ok(r) => r,
        Err(e) => {
            error!(worker = index, error = %e, "reactor setup failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = reactor.register_listeners() {
        error!(worker = index, error = %e, "listener registration failed");
        std::process::exit(1);
    }

    if let Some(ch) = channel {
        match reactor.add_plain(ch.raw_fd(), channel_handler) {
            Ok(cid) => {
                reactor.conns.conn_mut(cid).data = Some(Box::new(ChannelState {
                    channel: ch,
                    peers: HashMap::new(),
                }));
            }
            Err(e) => {
                error!(worker = index, error = %e, "channel registration failed");
                std::process::exit(1);
            }
        }
    }

    for module in cycle.registry.iter() {
        if let Err(e) = module.init_process(&mut reactor) {
            error!(worker = index, module = module.name(), error = %e, "init_process failed");
            std::process::exit(1);
        }
    }

    info!(worker = index, pid = std::process::id(), "worker started");

    loop {
        if signals::take(&signals::TERMINATE) {
            reactor.terminate = true;
        }
        if signals::take(&signals::QUIT) {
            reactor.quit = true;
        }
        if signals::take(&signals::REOPEN) {
            debug!(worker = index, "reopening logs");
            if let Err(e) = cycle.log.reopen() {
                warn!(error = %e, "log reopen failed");
            }
        }

        if reactor.terminate {
            break;
        }

        if reactor.quit && !reactor.exiting {
            info!(worker = index, "gracefully shutting down");
            reactor.close_listeners();
            reactor.exiting = true;
            let grace = cycle.config.shutdown_timeout_ms;
            if grace == 0 {
                reactor.close_all_streams();
            } else {
                reactor.add_shutdown_timer(grace);
            }
        }

        if reactor.exiting && reactor.active_streams() == 0 {
            break;
        }

        if let Err(e) = reactor.run_iteration() {
            error!(worker = index, error = %e, "reactor iteration failed");
            break;
        }
    }

    for module in cycle.registry.iter() {
        module.exit_process(&mut reactor);
    }
    info!(worker = index, "worker exiting");
    std::process::exit(0);
}

/// Drain the master channel; commands mutate the reactor's lifecycle
/// flags so the worker loop acts on them between iterations.
fn channel_handler(r: &mut Reactor, cid: ConnId) {
    loop {
        let received = {
            let state = match r
                .conns
                .conn(cid)
                .data
                .as_ref()
                .and_then(|d| d.downcast_ref::<ChannelState>())
            {
                Some(s) => s,
                None => return,
            };
            state.channel.recv()
        };

        match received {
            Ok((msg, fd)) => match msg.command {
                Command::Quit => r.quit = true,
                Command::Terminate => r.terminate = true,
                Command::Reopen => {
                    if let Err(e) = r.cycle.log.reopen() {
                        warn!(error = %e, "log reopen failed");
                    }
                }
                Command::OpenChannel => {
                    if let Some(fd) = fd {
                        debug!(slot = msg.slot, pid = msg.pid, "sibling channel opened");
                        if let Some(state) = r
                            .conns
                            .conn_mut(cid)
                            .data
                            .as_mut()
                            .and_then(|d| d.downcast_mut::<ChannelState>())
                        {
                            state.peers.insert(msg.slot, Channel::from_fd(fd));
                        }
                    }
                }
                Command::CloseChannel => {
                    if let Some(state) = r
                        .conns
                        .conn_mut(cid)
                        .data
                        .as_mut()
                        .and_then(|d| d.downcast_mut::<ChannelState>())
                    {
                        state.peers.remove(&msg.slot);
                    }
                }
            },
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                r.conns.event_mut(cid, EventKind::Read).ready = false;
                return;
            }
            Err(e) => {
                // Master is gone; nothing will ever tell us to stop, so
                // stop now.
                warn!(error = %e, "channel to master lost, shutting down");
                r.quit = true;
                r.close_connection(cid);
                return;
            }
        }
    }
}

/// Helper processes (cache manager style): no reactor, just the channel
/// and a fixed-interval callback.
pub fn run_helper(cycle: Rc<Cycle>, helper: usize, channel: Channel) -> ! {
    signals::detach_self_pipe();
    signals::clear_all();
    if let Err(e) = signals::install(signals::WORKER_SIGNALS) {
        error!(error = %e, "helper signal setup failed");
        std::process::exit(1);
    }
    let decl = cycle.helpers[helper];
    info!(helper = decl.name, pid = std::process::id(), "helper started");

    loop {
        if signals::take(&signals::TERMINATE) || signals::take(&signals::QUIT) {
            break;
        }
        if signals::take(&signals::REOPEN) {
            let _ = cycle.log.reopen();
        }

        let mut pfd = libc::pollfd {
            fd: channel.raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, decl.interval_ms.min(i32::MAX as u64) as i32) };
        if rc > 0 {
            match channel.recv() {
                Ok((msg, _)) => match msg.command {
                    Command::Quit | Command::Terminate => break,
                    Command::Reopen => {
                        let _ = cycle.log.reopen();
                    }
                    _ => {}
                },
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break, // master gone
            }
        } else if rc == 0 {
            (decl.callback)(&cycle);
        }
    }

    info!(helper = decl.name, "helper exiting");
    std::process::exit(0);
}
