//! The _SignServer_ library crate.
//!
//! The [`server`] module holds the request processing core: workers, their
//! crypto tokens and the pipeline every request runs through. The
//! [`daemon`] module wraps the core in an HTTP server.

pub mod commons;
pub mod constants;
pub mod daemon;
pub mod server;
pub mod test;
