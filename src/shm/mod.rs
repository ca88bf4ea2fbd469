//! Shared-memory substrate: anonymous shared mappings, a process-shared
//! mutex, a slab allocator, and named zones that survive reconfiguration.
//!
//! Mappings are created in the master before workers fork, so every
//! process sees each zone at the same base address; pointers and offsets
//! stored inside a zone stay valid in all workers. A zone re-declared
//! with the same `{name, size, tag}` across cycles keeps its mapping and
//! therefore its address and contents.

pub mod map;
pub mod mutex;
pub mod region;
pub mod slab;
pub mod zone;

pub use map::ShmMap;
pub use mutex::ShmMutex;
pub use region::SharedRegion;
pub use slab::SlabPool;
pub use zone::{build_zones, ShmZone, ZoneDecl, ZoneError, ZoneInit};
