//! High-level application primitives.
//!
//! This crate provides what an embedding application needs before using the runtime: initializing logging, and
//! loading the runtime configuration to install the process-wide default scheduler.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod bootstrap;
pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::bootstrap::{install_default_scheduler, load_runtime_configuration};
    pub use super::logging::initialize_logging;
}
