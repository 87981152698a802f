//! Defines all server side errors.
//!
//! [`Error`] is the closed set of outcomes a request can fail with. The
//! lower level error types of the token, counter, archive and logging
//! layers are translated into it at a single boundary each.

use std::{error, fmt, io};
use std::borrow::Cow;
use std::fmt::Display;
use hyper::StatusCode;
use crate::commons::crypto::token::TokenError;
use crate::server::worker::WorkerIdentifier;


//------------ IoError -------------------------------------------------------

/// An I/O error with some context on what we were trying to do.
#[derive(Debug)]
pub struct IoError {
    context: Cow<'static, str>,
    cause: io::Error,
}

impl IoError {
    pub fn new(context: impl Into<Cow<'static, str>>, cause: io::Error) -> Self {
        IoError { context: context.into(), cause }
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.cause.kind()
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}, cause: {}", self.context, self.cause)
    }
}

impl error::Error for IoError {}


//------------ Error ---------------------------------------------------------

/// The error taxonomy of the processing pipeline.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// The caller sent something we will not process.
    IllegalRequest(String),

    /// A resource needed to process the request is unavailable.
    ///
    /// This covers tokens that are not activated or not reachable and keys
    /// whose usage limit has been reached. The same request may succeed
    /// later.
    CryptoTokenOffline(String),

    /// The caller must authenticate.
    AuthorizationRequired(String),

    /// The caller authenticated but may not use the worker.
    AccessDenied(String),

    /// The caller could not be charged for the request.
    NotGranted(String),

    /// There is no worker with the given identifier.
    NoSuchWorker(WorkerIdentifier),

    /// The server is temporarily unable to process requests.
    ServiceUnavailable(String),

    /// An internal or configuration fault.
    SignServer(String),
}

impl Error {
    pub fn illegal_request(msg: impl Display) -> Self {
        Error::IllegalRequest(msg.to_string())
    }

    pub fn offline(msg: impl Display) -> Self {
        Error::CryptoTokenOffline(msg.to_string())
    }

    pub fn signserver(msg: impl Display) -> Self {
        Error::SignServer(msg.to_string())
    }

    /// Returns the message without the kind prefix.
    pub fn message(&self) -> Cow<'_, str> {
        match self {
            Error::IllegalRequest(msg)
            | Error::CryptoTokenOffline(msg)
            | Error::AuthorizationRequired(msg)
            | Error::AccessDenied(msg)
            | Error::NotGranted(msg)
            | Error::ServiceUnavailable(msg)
            | Error::SignServer(msg) => Cow::Borrowed(msg.as_str()),
            Error::NoSuchWorker(id) => {
                Cow::Owned(format!("No such worker: {id}"))
            }
        }
    }

    /// Returns the HTTP status code a transport should respond with.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::IllegalRequest(_) => StatusCode::BAD_REQUEST,
            Error::AuthorizationRequired(_) => StatusCode::UNAUTHORIZED,
            Error::AccessDenied(_) | Error::NotGranted(_) => {
                StatusCode::FORBIDDEN
            }
            Error::NoSuchWorker(_) => StatusCode::NOT_FOUND,
            Error::CryptoTokenOffline(_) | Error::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::SignServer(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns whether this is an illegal request.
    pub fn is_illegal_request(&self) -> bool {
        matches!(self, Error::IllegalRequest(_))
    }

    /// Returns whether this is a crypto-token-offline class error.
    pub fn is_offline(&self) -> bool {
        matches!(self, Error::CryptoTokenOffline(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IllegalRequest(msg) => {
                write!(f, "Illegal request: {msg}")
            }
            Error::CryptoTokenOffline(msg) => {
                write!(f, "Crypto token offline: {msg}")
            }
            Error::AuthorizationRequired(msg) => {
                write!(f, "Authorization required: {msg}")
            }
            Error::AccessDenied(msg) => write!(f, "Access denied: {msg}"),
            Error::NotGranted(msg) => write!(f, "Not granted: {msg}"),
            Error::NoSuchWorker(id) => write!(f, "No such worker: {id}"),
            Error::ServiceUnavailable(msg) => {
                write!(f, "Service unavailable: {msg}")
            }
            Error::SignServer(msg) => f.write_str(msg),
        }
    }
}

impl error::Error for Error {}

impl From<TokenError> for Error {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::NoSuchAlias(_)
            | TokenError::Offline(_)
            | TokenError::Authentication(_) => {
                Error::CryptoTokenOffline(err.to_string())
            }
            TokenError::InvalidParameter(_) => {
                Error::IllegalRequest(err.to_string())
            }
            _ => Error::SignServer(err.to_string()),
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            Error::illegal_request("x").status(), StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::AuthorizationRequired("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::AccessDenied("x".into()).status(), StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::NotGranted("x".into()).status(), StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::offline("x").status(), StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::signserver("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn token_errors_map_to_taxonomy() {
        assert!(
            Error::from(TokenError::NoSuchAlias("k".into())).is_offline()
        );
        assert!(
            Error::from(
                TokenError::InvalidParameter("p".into())
            ).is_illegal_request()
        );
        assert!(matches!(
            Error::from(TokenError::OutOfSpace("full".into())),
            Error::SignServer(_)
        ));
    }
}
