//! # Kura Core
//!
//! Fundamental building blocks shared by every Kura crate:
//! - Error types
//! - On-file format constants and length limits
//! - Configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                    kura-core                    │
//! ├─────────────────────────────────────────────────┤
//! │  • consts     - Format magic & length limits   │
//! │  • error      - Error handling                 │
//! │  • config     - Store configuration            │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod consts;
pub mod error;

pub use config::StoreConfig;
pub use consts::{
    is_control, is_read_only, AREA_MAGIC, AREA_SIZE, AREA_VERSION, CTL_PREFIX, INDEX_FILE_NAME,
    NAME_MAX, RO_PREFIX, SERIAL_AREA_NAME, VALUE_MAX, VERSION_PROPERTY,
};
pub use error::{Error, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
