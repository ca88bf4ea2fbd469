//! Named shared-memory zones with cross-cycle reuse.
//!
//! Modules declare zones while a cycle is being built; the cycle
//! initializes them by diffing against the previous cycle's zones. A zone
//! whose `{name, size, tag}` matches an old one (and is not `noreuse`)
//! inherits the old mapping, keeping its base address and contents; any
//! mismatch destroys the old zone and allocates a fresh one.

use std::rc::Rc;

use tracing::{debug, info};

use crate::shm::{ShmMap, SlabPool};

/// Called once per cycle after the zone's mapping is settled. `reused`
/// tells the owner whether the previous cycle's contents (reachable via
/// `SlabPool::data`) are still present and should be migrated rather than
/// rebuilt.
pub type ZoneInit = fn(&ShmZone, bool) -> Result<(), String>;

/// A zone declaration made during configuration.
#[derive(Clone)]
pub struct ZoneDecl {
    pub name: String,
    pub size: usize,
    pub tag: &'static str,
    pub noreuse: bool,
    pub init: Option<ZoneInit>,
}

#[derive(Debug)]
pub enum ZoneError {
    Conflict {
        name: String,
    },
    TooSmall {
        name: String,
    },
    Map(std::io::Error),
    Init {
        name: String,
        reason: String,
    },
}

impl std::fmt::Display for ZoneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZoneError::Conflict { name } => {
                write!(f, "shared zone \"{name}\" redeclared with a different size or tag")
            }
            ZoneError::TooSmall { name } => write!(f, "shared zone \"{name}\" is too small"),
            ZoneError::Map(e) => write!(f, "shared zone mapping failed: {e}"),
            ZoneError::Init { name, reason } => {
                write!(f, "shared zone \"{name}\" init failed: {reason}")
            }
        }
    }
}

impl std::error::Error for ZoneError {}

/// A live zone owned by a cycle.
pub struct ShmZone {
    pub name: String,
    pub size: usize,
    pub tag: &'static str,
    pub noreuse: bool,
    map: Rc<ShmMap>,
    slab: SlabPool,
}

impl ShmZone {
    pub fn base(&self) -> *mut u8 {
        self.map.base()
    }

    pub fn slab(&self) -> &SlabPool {
        &self.slab
    }

    /// Raw pointer to a slab offset inside this zone.
    pub fn ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.size);
        unsafe { self.map.base().add(offset) }
    }
}

impl std::fmt::Debug for ShmZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmZone")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("tag", &self.tag)
            .field("base", &self.base())
            .finish()
    }
}

/// Build the zone set for a new cycle, reusing matching old zones in
/// place. Duplicate identical declarations collapse into one zone;
/// conflicting declarations are a configuration error.
pub fn build_zones(decls: &[ZoneDecl], old: &[ShmZone]) -> Result<Vec<ShmZone>, ZoneError> {
    let mut zones: Vec<ShmZone> = Vec::with_capacity(decls.len());

    for decl in decls {
        if let Some(existing) = zones.iter().find(|z| z.name == decl.name) {
            if existing.size == decl.size && existing.tag == decl.tag {
                continue; // identical declaration from another module
            }
            return Err(ZoneError::Conflict {
                name: decl.name.clone(),
            });
        }
        if decl.size < 8 * crate::shm::slab::PAGE_SIZE {
            return Err(ZoneError::TooSmall {
                name: decl.name.clone(),
            });
        }

        let old_match = old.iter().find(|z| {
            z.name == decl.name && z.size == decl.size && z.tag == decl.tag && !decl.noreuse
        });

        let (zone, reused) = match old_match {
            Some(prev) => {
                debug!(zone = %decl.name, base = ?prev.base(), "reusing shared zone");
                let slab = SlabPool::attach(prev.map.as_ref()).ok_or_else(|| ZoneError::Init {
                    name: decl.name.clone(),
                    reason: "stale slab header in reused mapping".to_string(),
                })?;
                (
                    ShmZone {
                        name: decl.name.clone(),
                        size: decl.size,
                        tag: decl.tag,
                        noreuse: decl.noreuse,
                        map: Rc::clone(&prev.map),
                        slab,
                    },
                    true,
                )
            }
            None => {
                let map = Rc::new(ShmMap::new(decl.size).map_err(ZoneError::Map)?);
                let slab = SlabPool::init(map.as_ref());
                info!(zone = %decl.name, size = decl.size, "created shared zone");
                (
                    ShmZone {
                        name: decl.name.clone(),
                        size: decl.size,
                        tag: decl.tag,
                        noreuse: decl.noreuse,
                        map,
                        slab,
                    },
                    false,
                )
            }
        };

        if let Some(init) = decl.init {
            init(&zone, reused).map_err(|reason| ZoneError::Init {
                name: decl.name.clone(),
                reason,
            })?;
        }
        zones.push(zone);
    }

    Ok(zones)
}
