//! The request processing core.

pub mod accounter;
pub mod archive;
pub mod auth;
pub mod context;
pub mod dispatcher;
pub mod keyusage;
pub mod process;
pub mod registry;
pub mod request;
pub mod signers;
pub mod stats;
pub mod worker;
pub mod worklog;

pub use self::process::{Services, WorkerProcessCore};
pub use self::registry::WorkerRegistry;
