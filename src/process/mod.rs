//! Process supervision: the pre-forked worker pool, the master's signal
//! loop, and the command channel between them.

pub mod channel;
pub mod master;
pub mod signals;
pub mod worker;

use crate::process::channel::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Worker { index: usize },
    Helper { helper: usize },
}

/// Master-side record of a forked child.
#[derive(Debug)]
pub struct Process {
    pub pid: libc::pid_t,
    /// Master's end of the socketpair.
    pub channel: Channel,
    pub role: ProcessRole,
    pub respawn: bool,
    pub just_spawn: bool,
    pub detached: bool,
    pub exiting: bool,
    pub exited: bool,
}
