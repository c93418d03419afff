//! kgguard control plane: configuration, table population, trace replay,
//! and the helpers the `kgguard` binary prints with.

pub mod config;
pub mod control;
pub mod format;
pub mod geo;
pub mod replay;
