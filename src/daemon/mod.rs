//! The signing server daemon.

pub mod config;
pub mod http;
pub mod start;
