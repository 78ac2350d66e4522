//! Storage infrastructure: configuration and registry persistence.
//!
//! - `config` reads the optional `HubConfig` TOML file and converts its
//!   sections into the typed settings of each component.
//! - `registry_store` keeps the printer registry in `printers.toml`,
//!   replacing the file atomically on every change.

pub mod config;
pub mod registry_store;
