//! CLI command implementations

pub mod init;
pub mod save;
pub mod server;
