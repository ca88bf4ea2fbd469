//! palisade: an event-driven server core
//!
//! Pre-forked workers, each a single-threaded readiness reactor over a
//! fixed connection table with pooled per-connection memory. The master
//! supervises the pool and swaps configuration cycles on the fly: reload
//! inherits listening sockets and shared-memory zones, so no accepted
//! connection is ever dropped. Protocol behavior plugs in through the
//! module interface; the bundled stream module echoes bytes back and
//! doubles as the reference consumer of the handler contract.

mod config;
mod conn;
mod cycle;
mod event;
mod listener;
mod log;
mod mem;
mod module;
mod process;
mod shm;
mod stream;
mod time;

use std::rc::Rc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::{CliArgs, Config, ConfigSource, ProcessMode};
use cycle::Cycle;
use log::LogTarget;
use module::ModuleRegistry;
use process::master::{read_pid_file, write_pid_file, Master};
use process::{signals, worker};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = CliArgs::parse();

    if cli.version || cli.version_full {
        println!("palisade version {}", env!("CARGO_PKG_VERSION"));
        if cli.version_full {
            println!("event backend: epoll/kqueue (mio, edge-triggered)");
            println!("process models: master (pre-forked workers), single");
        }
        return 0;
    }

    let source = config::source_from_cli(&cli);

    if let Some(ref signal) = cli.signal {
        return send_signal(&source, signal);
    }

    let config = match Config::load(&source) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("palisade: {e}");
            return 2;
        }
    };

    if cli.test || cli.test_dump {
        return test_configuration(&config, cli.test_dump, cli.quiet);
    }

    let log = match config.error_log.clone() {
        Some(path) => match LogTarget::file(path) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("palisade: cannot open error log: {e}");
                return 1;
            }
        },
        None => LogTarget::stderr(),
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(log.clone())
        .with_target(false)
        .init();

    let registry = build_registry();

    let env_listeners = match listener::inherited_from_env() {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "bad inherited descriptor list");
            return 1;
        }
    };

    let cycle = match Cycle::build(config, Rc::clone(&registry), log, &env_listeners, None) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "startup failed");
            return 2;
        }
    };
    drop(env_listeners); // anything not inherited closes here

    match cycle.config.process_mode {
        ProcessMode::Single => {
            if let Err(e) = write_pid_file(&cycle.config.pid_path) {
                error!(error = %e, "cannot write pid file");
                return 1;
            }
            info!(pid = std::process::id(), "running in single-process mode");
            worker::run(cycle, 0, None)
        }
        ProcessMode::Master => {
            let argv: Vec<String> = std::env::args().collect();
            Master::new(cycle, registry, source, argv).run()
        }
    }
}

/// Every module the binary ships, in dense-index order.
fn build_registry() -> Rc<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();
    registry.register(Rc::new(stream::StreamModule));
    Rc::new(registry)
}

/// `-s stop|quit|reopen|reload`: deliver the signal to the pid on file.
fn send_signal(source: &ConfigSource, name: &str) -> i32 {
    let Some(sig) = signals::signal_by_name(name) else {
        eprintln!("palisade: unknown signal \"{name}\"");
        return 1;
    };
    let config = match Config::load(source) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("palisade: {e}");
            return 2;
        }
    };
    let pid = match read_pid_file(&config.pid_path) {
        Ok(pid) => pid,
        Err(e) => {
            eprintln!(
                "palisade: cannot read pid file '{}': {e}",
                config.pid_path.display()
            );
            return 1;
        }
    };
    if let Err(e) = signals::kill(pid, sig) {
        eprintln!("palisade: cannot signal pid {pid}: {e}");
        return 1;
    }
    0
}

/// `-t` / `-T`: resolve the configuration (and module declarations) but
/// do not touch sockets.
fn test_configuration(config: &Config, dump: bool, quiet: bool) -> i32 {
    if config.listeners.is_empty() {
        eprintln!("palisade: configuration invalid: no listeners configured");
        return 2;
    }
    if config.worker_connections <= config.listeners.len() + 1 {
        eprintln!("palisade: configuration invalid: worker.connections too small for listener count");
        return 2;
    }
    if !quiet {
        eprintln!("palisade: configuration test successful");
    }
    if dump {
        println!("{config:#?}");
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn source_with(directives: Vec<String>) -> ConfigSource {
        ConfigSource {
            path: None,
            directives,
            prefix: PathBuf::from("."),
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_configuration_requires_listeners() {
        let config = Config::load(&source_with(vec![])).unwrap();
        assert_eq!(test_configuration(&config, false, true), 2);

        let config = Config::load(&source_with(vec![
            "[[listener]]\nlisten = \"127.0.0.1:8080\"".to_string(),
        ]))
        .unwrap();
        assert_eq!(test_configuration(&config, false, true), 0);
    }

    #[test]
    fn test_configuration_checks_table_headroom() {
        let config = Config::load(&source_with(vec![
            "worker.connections = 8".to_string(),
            "[[listener]]\nlisten = \"127.0.0.1:1\"".to_string(),
            "[[listener]]\nlisten = \"127.0.0.1:2\"".to_string(),
            "[[listener]]\nlisten = \"127.0.0.1:3\"".to_string(),
            "[[listener]]\nlisten = \"127.0.0.1:4\"".to_string(),
            "[[listener]]\nlisten = \"127.0.0.1:5\"".to_string(),
            "[[listener]]\nlisten = \"127.0.0.1:6\"".to_string(),
            "[[listener]]\nlisten = \"127.0.0.1:7\"".to_string(),
        ]))
        .unwrap();
        assert_eq!(test_configuration(&config, false, true), 2);
    }

    #[test]
    fn test_registry_contains_stream_module() {
        let registry = build_registry();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(0).unwrap().name(), "stream");
    }
}
