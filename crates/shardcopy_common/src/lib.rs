//! Common types shared by every shardcopy crate: identifiers, datums,
//! the error taxonomy, and the TOML configuration model.

pub mod config;
pub mod datum;
pub mod error;
pub mod types;
