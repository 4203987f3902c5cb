//! CLI commands.

pub mod check;
pub mod evict;
pub mod serve;
pub mod sweep;
