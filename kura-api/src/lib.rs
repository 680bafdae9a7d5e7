//! # Kura API
//!
//! The user-facing surface of the property store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                    kura-api                     │
//! ├─────────────────────────────────────────────────┤
//! │  • store      - PropertyStore facade            │
//! │  • client     - setter-daemon socket client     │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! [`PropertyStore`] wires the router and the storage layer together:
//! lookups route a name to its context's area, reads run the serial-word
//! protocol, writes go through the single-writer mutation paths and bump the
//! process-global serial. [`ServiceClient`] is the client side of the
//! privileged setter daemon's socket protocol; unprivileged processes set
//! properties through it rather than writing areas directly.

pub mod client;
pub mod store;

pub use client::{Protocol, ServiceClient};
pub use store::{PropertyRef, PropertyStore};
