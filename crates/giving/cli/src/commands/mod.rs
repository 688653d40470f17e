//! CLI command implementations

pub mod keystore;
pub mod simulate;
pub mod withdrawal;
