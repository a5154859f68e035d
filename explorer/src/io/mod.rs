//! I/O helpers for explorer commands.

pub mod config;
pub mod context;
pub mod git;
pub mod init;
pub mod model;
pub mod patch;
pub mod process;
pub mod pytest;
pub mod store;
