//! Penny library: re-exports modules for the binary and integration tests.

pub mod blob;
pub mod bot;
pub mod caches;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod pings;
