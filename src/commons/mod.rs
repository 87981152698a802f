//! Types shared by the server and the daemon.
pub mod crypto;
pub mod error;
pub mod file;

//------------ Response Aliases ----------------------------------------------

pub type SignServerResult<T> = std::result::Result<T, self::error::Error>;
