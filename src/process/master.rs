//! Master supervisor: fork and babysit workers, drive reconfiguration,
//! log reopening, binary upgrade, and shutdown escalation.
//!
//! The loop blocks on the signal self-pipe. Children are commanded over
//! their channels (with a direct signal as fallback); SIGCHLD triggers a
//! reap pass that respawns crashed children unless a shutdown is in
//! progress. Termination escalates: workers get SIGTERM, then after a
//! doubling delay SIGKILL.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigSource};
use crate::cycle::Cycle;
use crate::listener::{close_listeners, env_fd_list, INHERIT_ENV};
use crate::module::ModuleRegistry;
use crate::process::channel::{Channel, ChannelMsg, Command};
use crate::process::signals;
use crate::process::worker;
use crate::process::{Process, ProcessRole};

const INITIAL_KILL_DELAY_MS: u64 = 50;
const KILL_ESCALATION_MS: u64 = 1000;

pub struct Master {
    cycle: Rc<Cycle>,
    registry: Rc<ModuleRegistry>,
    source: ConfigSource,
    argv: Vec<String>,
    processes: Slab<Process>,
    sig_rd: RawFd,
    quitting: bool,
    terminating: bool,
    kill_delay: u64,
    new_binary: libc::pid_t,
}

impl Master {
    pub fn new(
        cycle: Rc<Cycle>,
        registry: Rc<ModuleRegistry>,
        source: ConfigSource,
        argv: Vec<String>,
    ) -> Self {
        Self {
            cycle,
            registry,
            source,
            argv,
            processes: Slab::new(),
            sig_rd: -1,
            quitting: false,
            terminating: false,
            kill_delay: INITIAL_KILL_DELAY_MS,
            new_binary: 0,
        }
    }

    pub fn run(mut self) -> i32 {
        if let Err(e) = signals::install(signals::MASTER_SIGNALS) {
            error!(error = %e, "signal setup failed");
            return 1;
        }
        self.sig_rd = match signals::init_self_pipe() {
            Ok(fd) => fd,
            Err(e) => {
                error!(error = %e, "self-pipe setup failed");
                return 1;
            }
        };
        if let Err(e) = write_pid_file(&self.cycle.config.pid_path) {
            error!(error = %e, path = %self.cycle.config.pid_path.display(), "cannot write pid file");
            return 1;
        }
        for module in Rc::clone(&self.registry).iter() {
            if let Err(e) = module.init_master(&self.cycle) {
                error!(module = module.name(), error = %e, "init_master failed");
                return 1;
            }
        }

        self.spawn_all();
        info!(
            pid = std::process::id(),
            workers = self.cycle.config.worker_processes,
            "master started"
        );

        loop {
            let timeout: libc::c_int = if self.terminating && !self.processes.is_empty() {
                self.kill_delay.min(i32::MAX as u64) as libc::c_int
            } else {
                -1
            };
            let mut pfd = libc::pollfd {
                fd: self.sig_rd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout) };
            if rc > 0 {
                signals::drain_pipe(self.sig_rd);
            }
            let timed_out = rc == 0;

            if signals::take(&signals::CHILD) {
                self.reap();
            }

            if self.processes.is_empty() && (self.quitting || self.terminating) {
                break;
            }

            if signals::take(&signals::TERMINATE) {
                if !self.terminating {
                    info!("terminating");
                    self.terminating = true;
                    self.kill_delay = INITIAL_KILL_DELAY_MS;
                    self.stop_respawn();
                    self.signal_children(Command::Terminate, libc::SIGTERM);
                }
            } else if self.terminating && timed_out {
                self.kill_delay *= 2;
                if self.kill_delay > KILL_ESCALATION_MS {
                    warn!("workers still alive, sending SIGKILL");
                    self.kill_children(libc::SIGKILL);
                } else {
                    self.kill_children(libc::SIGTERM);
                }
            }

            if signals::take(&signals::QUIT) && !self.quitting {
                info!("shutting down gracefully");
                self.quitting = true;
                self.stop_respawn();
                self.signal_children(Command::Quit, libc::SIGQUIT);
            }

            if signals::take(&signals::RECONFIGURE) {
                self.reconfigure();
            }

            if signals::take(&signals::REOPEN) {
                info!("reopening logs");
                if let Err(e) = self.cycle.log.reopen() {
                    warn!(error = %e, "log reopen failed");
                }
                self.signal_children(Command::Reopen, libc::SIGUSR1);
            }

            if signals::take(&signals::CHANGE_BINARY) {
                self.change_binary();
            }

            if signals::take(&signals::NO_ACCEPT) {
                info!("stopping accepts, master stays for possible rollback");
                self.stop_respawn();
                self.signal_children(Command::Quit, libc::SIGQUIT);
            }
        }

        for module in Rc::clone(&self.registry).iter() {
            module.exit_master(&self.cycle);
        }
        close_listeners(&self.cycle.listeners);
        let pid_path = if self.new_binary > 0 {
            oldbin_path(&self.cycle.config.pid_path)
        } else {
            self.cycle.config.pid_path.clone()
        };
        let _ = std::fs::remove_file(pid_path);
        info!("master exiting");
        0
    }

    fn spawn_all(&mut self) {
        for index in 0..self.cycle.config.worker_processes {
            if let Err(e) = self.spawn(ProcessRole::Worker { index }, true) {
                error!(worker = index, error = %e, "spawn failed");
            }
        }
        for helper in 0..self.cycle.helpers.len() {
            if let Err(e) = self.spawn(ProcessRole::Helper { helper }, true) {
                error!(helper, error = %e, "helper spawn failed");
            }
        }
    }

    fn spawn(&mut self, role: ProcessRole, respawn: bool) -> io::Result<()> {
        let (parent_ch, child_ch) = Channel::pair()?;
        let slot = self.processes.vacant_key() as u32;

        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(io::Error::last_os_error()),
            0 => {
                // Child: shed the master's descriptors, then never return.
                unsafe {
                    libc::close(self.sig_rd);
                }
                for (_, p) in self.processes.iter() {
                    unsafe {
                        libc::close(p.channel.raw_fd());
                    }
                }
                drop(parent_ch);
                let cycle = Rc::clone(&self.cycle);
                match role {
                    ProcessRole::Worker { index } => worker::run(cycle, index, Some(child_ch)),
                    ProcessRole::Helper { helper } => worker::run_helper(cycle, helper, child_ch),
                }
            }
            pid => {
                debug!(pid, ?role, slot, "spawned child");
                // Tell the existing children how to reach the new one.
                let msg = ChannelMsg {
                    command: Command::OpenChannel,
                    pid,
                    slot,
                };
                for (_, p) in self.processes.iter() {
                    if !p.exited {
                        let _ = p.channel.send(msg, Some(parent_ch.raw_fd()));
                    }
                }
                drop(child_ch);
                let key = self.processes.insert(Process {
                    pid,
                    channel: parent_ch,
                    role,
                    respawn,
                    just_spawn: true,
                    detached: false,
                    exiting: false,
                    exited: false,
                });
                debug_assert_eq!(key as u32, slot);
                Ok(())
            }
        }
    }

    fn reap(&mut self) {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }

            if pid == self.new_binary {
                warn!("new binary exited, restoring pid file");
                let pid_path = &self.cycle.config.pid_path;
                let _ = std::fs::rename(oldbin_path(pid_path), pid_path);
                self.new_binary = 0;
                continue;
            }

            let Some(slot) = self
                .processes
                .iter()
                .find(|(_, p)| p.pid == pid)
                .map(|(k, _)| k)
            else {
                continue;
            };

            if libc::WIFSIGNALED(status) {
                warn!(pid, signal = libc::WTERMSIG(status), "child killed by signal");
            } else {
                info!(pid, code = libc::WEXITSTATUS(status), "child exited");
            }

            // A worker that died holding the accept mutex would deadlock
            // its siblings.
            self.cycle.shared.accept_mutex().force_unlock(pid as u32);

            let p = self.processes.remove(slot);
            let crashed = libc::WIFSIGNALED(status) || libc::WEXITSTATUS(status) != 0;
            if p.respawn && !p.exiting && !self.quitting && !self.terminating {
                if crashed {
                    warn!(pid, "respawning crashed child");
                }
                if let Err(e) = self.spawn(p.role, true) {
                    error!(error = %e, "respawn failed");
                }
            }
        }
    }

    /// Build a new cycle and swap workers over to it; a failure of any
    /// kind keeps the current cycle and workers untouched.
    fn reconfigure(&mut self) {
        info!("reconfiguring");
        let config = match Config::load(&self.source) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "reload rejected, keeping current configuration");
                return;
            }
        };

        let log = self.cycle.log.clone();
        if config.error_log != self.cycle.config.error_log {
            if let Err(e) = log.retarget(config.error_log.clone()) {
                warn!(error = %e, "cannot switch error log");
            }
        }

        match Cycle::build(config, Rc::clone(&self.registry), log, &[], Some(&self.cycle)) {
            Ok(new_cycle) => {
                let old_children: Vec<usize> = self.processes.iter().map(|(k, _)| k).collect();
                self.cycle = new_cycle;
                self.spawn_all();
                let msg = ChannelMsg {
                    command: Command::Quit,
                    pid: std::process::id() as i32,
                    slot: 0,
                };
                for key in old_children {
                    if let Some(p) = self.processes.get_mut(key) {
                        p.respawn = false;
                        p.exiting = true;
                        if p.channel.send(msg, None).is_err() {
                            let _ = signals::kill(p.pid, libc::SIGQUIT);
                        }
                    }
                }
                info!("reconfigured, draining old workers");
            }
            Err(e) => {
                error!(error = %e, "reload rejected, keeping current configuration");
            }
        }
    }

    /// Exec a new binary that inherits the listening sockets; the old
    /// master lingers under the `.oldbin` pid file for rollback.
    fn change_binary(&mut self) {
        if self.new_binary > 0 {
            warn!("binary upgrade already in progress");
            return;
        }
        info!("upgrading binary");
        let pid_path = self.cycle.config.pid_path.clone();
        if let Err(e) = std::fs::rename(&pid_path, oldbin_path(&pid_path)) {
            error!(error = %e, "cannot rename pid file, upgrade aborted");
            return;
        }

        let fds = env_fd_list(&self.cycle.listeners);
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => {
                error!(error = %io::Error::last_os_error(), "fork failed, upgrade aborted");
                let _ = std::fs::rename(oldbin_path(&pid_path), &pid_path);
            }
            0 => {
                std::env::set_var(INHERIT_ENV, &fds);
                let args: Vec<CString> = self
                    .argv
                    .iter()
                    .filter_map(|a| CString::new(a.as_str()).ok())
                    .collect();
                let mut ptrs: Vec<*const libc::c_char> =
                    args.iter().map(|a| a.as_ptr()).collect();
                ptrs.push(std::ptr::null());
                unsafe {
                    libc::execvp(ptrs[0], ptrs.as_ptr());
                }
                // Only reached when exec fails.
                eprintln!("palisade: exec of new binary failed");
                std::process::exit(1);
            }
            pid => {
                info!(pid, "new binary started");
                self.new_binary = pid;
            }
        }
    }

    fn stop_respawn(&mut self) {
        for (_, p) in self.processes.iter_mut() {
            p.respawn = false;
            p.exiting = true;
        }
    }

    fn signal_children(&self, command: Command, fallback: libc::c_int) {
        let msg = ChannelMsg {
            command,
            pid: std::process::id() as i32,
            slot: 0,
        };
        for (_, p) in self.processes.iter() {
            if p.exited {
                continue;
            }
            if p.channel.send(msg, None).is_err() {
                let _ = signals::kill(p.pid, fallback);
            }
        }
    }

    fn kill_children(&self, sig: libc::c_int) {
        for (_, p) in self.processes.iter() {
            if !p.exited {
                let _ = signals::kill(p.pid, sig);
            }
        }
    }
}

pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
}

pub fn read_pid_file(path: &Path) -> io::Result<libc::pid_t> {
    let text = std::fs::read_to_string(path)?;
    text.trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed pid file"))
}

fn oldbin_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".oldbin");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("palisade-pid-{}", std::process::id()));
        write_pid_file(&path).expect("write");
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with('\n'));
        assert_eq!(read_pid_file(&path).unwrap(), std::process::id() as libc::pid_t);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_oldbin_path_appends_suffix() {
        assert_eq!(
            oldbin_path(Path::new("/run/palisade.pid")),
            PathBuf::from("/run/palisade.pid.oldbin")
        );
        assert_eq!(
            oldbin_path(Path::new("relative.pid")),
            PathBuf::from("relative.pid.oldbin")
        );
    }
}
