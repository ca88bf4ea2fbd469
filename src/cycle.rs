//! Cycle: an immutable snapshot of configuration-derived runtime state.
//!
//! A cycle owns the resolved configuration, the listener array, the
//! shared-memory zones, the per-module config table, and the log target.
//! Building a new cycle against an old one is the reload path: zones and
//! listeners are diffed so matching resources carry over in place, and a
//! failure at any step leaves the old cycle untouched — after startup the
//! process never dies on a bad configuration.
//!
//! Processes hold `Rc<Cycle>`; a retiring cycle's storage is freed when
//! the last holder (a worker loop or a draining connection) lets go.

use std::any::Any;
use std::rc::Rc;

use tracing::error;

use crate::config::Config;
use crate::listener::{
    clone_reuseport, open_listeners, rollback_listeners, Listener,
};
use crate::module::{HelperDecl, ModuleRegistry};
use crate::shm::{build_zones, SharedRegion, ShmZone, ZoneDecl, ZoneError};
use crate::log::LogTarget;

/// Handed to each module's `create_conf` while a cycle is being built.
pub struct CycleBuilder<'a> {
    pub config: &'a Config,
    zones: Vec<ZoneDecl>,
    helpers: Vec<HelperDecl>,
    ctx: Vec<Option<Box<dyn Any>>>,
    current_module: usize,
}

impl CycleBuilder<'_> {
    /// Declare (or re-declare) a named shared zone.
    pub fn declare_zone(&mut self, decl: ZoneDecl) {
        self.zones.push(decl);
    }

    /// Register a helper process to fork alongside the workers.
    pub fn register_helper(&mut self, decl: HelperDecl) {
        self.helpers.push(decl);
    }

    /// Store this module's config object in the cycle's table.
    pub fn set_conf<T: Any>(&mut self, conf: T) {
        self.ctx[self.current_module] = Some(Box::new(conf));
    }
}

#[derive(Debug)]
pub enum CycleError {
    Zone(ZoneError),
    Listener(std::io::Error),
    Shared(std::io::Error),
    Module { module: &'static str, reason: String },
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleError::Zone(e) => write!(f, "{e}"),
            CycleError::Listener(e) => write!(f, "listener setup failed: {e}"),
            CycleError::Shared(e) => write!(f, "shared region setup failed: {e}"),
            CycleError::Module { module, reason } => {
                write!(f, "module \"{module}\" init failed: {reason}")
            }
        }
    }
}

impl std::error::Error for CycleError {}

pub struct Cycle {
    pub config: Config,
    pub registry: Rc<ModuleRegistry>,
    pub listeners: Vec<Listener>,
    pub zones: Vec<ShmZone>,
    pub shared: SharedRegion,
    pub log: LogTarget,
    ctx: Vec<Option<Box<dyn Any>>>,
    pub helpers: Vec<HelperDecl>,
}

impl Cycle {
    /// Build a cycle from resolved configuration, inheriting what matches
    /// from `old` (a live cycle on reload) or from `env_listeners`
    /// (descriptors adopted across a binary upgrade, startup only).
    pub fn build(
        config: Config,
        registry: Rc<ModuleRegistry>,
        log: LogTarget,
        env_listeners: &[Listener],
        old: Option<&Cycle>,
    ) -> Result<Rc<Cycle>, CycleError> {
        let mut builder = CycleBuilder {
            config: &config,
            zones: Vec::new(),
            helpers: Vec::new(),
            ctx: (0..registry.len()).map(|_| None).collect(),
            current_module: 0,
        };
        for (i, module) in registry.iter().enumerate() {
            builder.current_module = i;
            module.create_conf(&mut builder).map_err(|e| CycleError::Module {
                module: module.name(),
                reason: e.0,
            })?;
        }
        let CycleBuilder {
            zones: zone_decls,
            helpers,
            ctx,
            ..
        } = builder;

        let old_zones = old.map(|c| c.zones.as_slice()).unwrap_or(&[]);
        let zones = build_zones(&zone_decls, old_zones).map_err(CycleError::Zone)?;

        let shared = match old {
            Some(c) => c.shared.clone(),
            None => SharedRegion::new().map_err(CycleError::Shared)?,
        };

        let mut listeners: Vec<Listener> =
            config.listeners.iter().map(Listener::from_config).collect();
        clone_reuseport(&mut listeners, config.worker_processes);
        let old_listeners = old.map(|c| c.listeners.as_slice()).unwrap_or(env_listeners);
        open_listeners(&listeners, old_listeners).map_err(CycleError::Listener)?;

        let cycle = Cycle {
            config,
            registry: Rc::clone(&registry),
            listeners,
            zones,
            shared,
            log,
            ctx,
            helpers,
        };

        for module in registry.iter() {
            if let Err(e) = module.init_module(&cycle) {
                error!(module = module.name(), reason = %e.0, "cycle rejected");
                rollback_listeners(&cycle.listeners, old_listeners);
                return Err(CycleError::Module {
                    module: module.name(),
                    reason: e.0,
                });
            }
        }

        Ok(Rc::new(cycle))
    }

    /// A module's config object, by its dense registry index.
    pub fn conf<T: 'static>(&self, module_index: usize) -> Option<&T> {
        self.ctx.get(module_index)?.as_ref()?.downcast_ref()
    }

    pub fn zone(&self, name: &str) -> Option<&ShmZone> {
        self.zones.iter().find(|z| z.name == name)
    }

    /// Listener indexes worker `worker` must register: all shared
    /// listeners plus this worker's reuseport clone.
    pub fn worker_listeners(&self, worker: usize) -> Vec<usize> {
        self.listeners
            .iter()
            .enumerate()
            .filter(|(_, l)| l.open.get() && (l.worker.is_none() || l.worker == Some(worker)))
            .map(|(i, _)| i)
            .collect()
    }

    /// Addresses currently listened on, for diagnostics and tests.
    pub fn listening_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.listeners
            .iter()
            .filter(|l| l.open.get())
            .map(|l| l.addr.get())
            .collect()
    }
}

impl std::fmt::Debug for Cycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cycle")
            .field("listeners", &self.listeners)
            .field("zones", &self.zones.len())
            .field("modules", &self.registry.len())
            .finish()
    }
}
