//! # Kura Storage
//!
//! Memory-mapped property areas shared across processes.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Area file (128 KiB)                     │
//! │                                                              │
//! │  header: magic · version · bytes_used · serial · backup     │
//! │  ──────────────────────────────────────────────────────────  │
//! │  data:   root trie node @ 0, then bump-allocated nodes,     │
//! │          entries, and long-value blobs                      │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Concurrency                             │
//! │                                                              │
//! │  readers ──> acquire-load offsets ──> serial-word read      │
//! │  writer  ──> bump alloc ──> release-publish ──> futex wake  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Readers are lock-free and allocation-free; a single writer process per
//! area performs all mutation. Change notification is built on futex waits
//! against the per-entry and per-area serial words.

pub mod area;
pub mod entry;
pub mod futex;
mod node;
pub mod serial;

pub use area::{PropArea, ValueBuf};
pub use entry::PropEntry;
pub use futex::wait_for_change;
pub use serial::{serial_dirty, serial_is_long, serial_value_len};
