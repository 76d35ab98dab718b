//! Configuration for the Cairn daemon.
//!
//! Values are layered: an optional `.env` file, then a TOML file, then
//! environment variables. [`validation::validate`] turns missing credentials
//! and unusable paths into errors before any engine task starts.

#![allow(missing_docs)]

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::sources::{EnvConfig, FileConfig};
pub use models::{BlobStoreConfig, Config, ConfigMetadata, DatabaseConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings, ValidationReport};
