//! Shared helpers used throughout the backup manager: the WAL position
//! type, the adaptive radix tree, duration parsing for configuration
//! values, and logging setup.

pub mod art;
pub mod duration;
pub mod logging;
pub mod lsn;
