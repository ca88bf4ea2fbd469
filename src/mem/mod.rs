//! Memory substrate: per-connection arena pools and buffer chains.
//!
//! A `Pool` owns every allocation a connection or request makes and frees
//! them in one sweep when it is dropped, after running registered cleanups.
//! Buffers (`Buf`) describe byte ranges inside pool-owned arenas or inside
//! files; chains of buffers are the unit of I/O submission.

pub mod buf;
pub mod pool;

pub use buf::{
    chain_link, coalesce_file, update_chains, update_sent, Buf, BufRef, BufTag, Chain, FileRef,
};
pub use pool::Pool;
