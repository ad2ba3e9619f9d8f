//! Refreshing the known CT log table.
//!
//! The builtin table ages as logs are retired and new shards open. This
//! module pulls the public log list and writes a TOML table that can be fed
//! back through `known_logs_file`.
//!
//! # Submodules
//!
//! - `gstatic` - Google's v3 log list

pub mod gstatic;
