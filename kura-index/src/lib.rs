//! # Kura Index
//!
//! Namespace partitioning for the property store. A property name is routed
//! to exactly one context (access label), and each context owns one mapped
//! area file.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Routing                                 │
//! │                                                              │
//! │  name ──> BinaryIndex (mmap trie)  ──┐                      │
//! │      or   TextIndex (prefix list)  ──┼──> context ──> area  │
//! │                                      │    (lazy mmap)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The binary index is the compact, build-time-generated form; the text
//! index is the startup-parsed fallback for deployments without one. The
//! router owns the per-context nodes and the `properties_serial` area.

pub mod binary;
pub mod builder;
pub mod router;
pub mod text;

pub use binary::{BinaryIndex, NO_INDEX};
pub use builder::IndexBuilder;
pub use router::{ContextNode, ContextRouter};
pub use text::TextIndex;
