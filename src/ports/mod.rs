//! Port traits separating the engine from storage, files and configuration.

pub mod config_port;
pub mod export_port;
pub mod source_port;
pub mod store_port;
