//! HTTP requests.

use std::net::SocketAddr;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::Method;
use hyper::body::Body;
use hyper::header::AUTHORIZATION;
use openssl::x509::X509;
use percent_encoding::percent_decode_str;
use crate::constants::HTTP_REQUEST_METADATA_PREFIX;
use crate::server::context::RequestContext;


//------------ HyperRequest --------------------------------------------------

/// A type alias for the request we receive from Hyper.
pub type HyperRequest = hyper::Request<hyper::body::Incoming>;

/// The header carrying the addresses of proxies a request passed through.
const X_FORWARDED_FOR: &str = "X-Forwarded-For";


//------------ ConnectionInfo ------------------------------------------------

/// What we know about the connection a request arrived on.
#[derive(Clone, Debug, Default)]
pub struct ConnectionInfo {
    pub remote_addr: Option<SocketAddr>,
    pub client_certificate: Option<X509>,
}


//------------ Request -------------------------------------------------------

/// An enriched request.
pub struct Request<B = hyper::body::Incoming> {
    /// The underlying raw request.
    request: hyper::Request<B>,

    /// The connection the request arrived on.
    connection: ConnectionInfo,

    /// The decoded query parameters.
    query: Vec<(String, String)>,
}

impl<B> Request<B> {
    pub fn new(request: hyper::Request<B>, connection: ConnectionInfo) -> Self {
        let query = request.uri().query().map(parse_query).unwrap_or_default();
        Request { request, connection, query }
    }

    /// Returns the method of this request.
    pub fn method(&self) -> &Method {
        self.request.method()
    }

    /// Returns the current request path.
    pub fn path(&self) -> RequestPath {
        RequestPath::from_str(self.request.uri().path())
    }

    /// Returns the first value of a query parameter.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Returns the username and password of HTTP Basic authentication.
    pub fn basic_credentials(&self) -> Option<(String, String)> {
        let value = self.request.headers().get(AUTHORIZATION)?.to_str().ok()?;
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None
        }
        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some((username.to_string(), password.to_string()))
    }

    /// Returns the `X-Forwarded-For` header if present.
    pub fn forwarded_for(&self) -> Option<&str> {
        self.request.headers().get(X_FORWARDED_FOR)?.to_str().ok()
    }

    /// Creates the context for processing this request.
    ///
    /// Query parameters starting with `REQUEST_METADATA.` become request
    /// metadata with the prefix removed.
    pub fn context(&self) -> RequestContext {
        let mut context = RequestContext::new();
        if let Some(addr) = self.connection.remote_addr {
            context = context.with_remote_ip(addr.ip());
        }
        if let Some(forwarded) = self.forwarded_for() {
            context = context.with_forwarded_for(forwarded);
        }
        if let Some((username, password)) = self.basic_credentials() {
            context = context.with_credentials(username, password);
        }
        if let Some(cert) = self.connection.client_certificate.clone() {
            context = context.with_client_certificate(cert);
        }
        for (key, value) in &self.query {
            if let Some(key) = key.strip_prefix(HTTP_REQUEST_METADATA_PREFIX) {
                if !key.is_empty() {
                    context = context.with_metadata(key, value.as_str());
                }
            }
        }
        context
    }
}

impl<B> Request<B>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    /// Returns the body of the request.
    ///
    /// Bodies larger than `limit` bytes are refused.
    pub async fn read_body(self, limit: u64) -> Result<Bytes, BodyError> {
        // If we know the body is too big from the Content-Length header, we
        // return right away. Otherwise Limited will stop reading once the
        // limit is passed.
        if self.request.body().size_hint().lower() > limit {
            return Err(BodyError::TooLarge);
        }
        Limited::new(
            self.request.into_body(),
            limit.try_into().unwrap_or(usize::MAX),
        ).collect().await.map(|body| body.to_bytes()).map_err(|err| {
            if err.is::<http_body_util::LengthLimitError>() {
                BodyError::TooLarge
            }
            else {
                BodyError::CannotRead
            }
        })
    }
}

/// Parses a query string into decoded key-value pairs.
fn parse_query(query: &str) -> Vec<(String, String)> {
    query.split('&').filter(|s| !s.is_empty()).map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (decode(key), decode(value))
    }).collect()
}

fn decode(s: &str) -> String {
    let s = s.replace('+', " ");
    percent_decode_str(&s).decode_utf8_lossy().into_owned()
}


//------------ BodyError -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BodyError {
    TooLarge,
    CannotRead,
}


//------------ RequestPath ---------------------------------------------------

/// The percent-decoded path of a request’s URI.
///
/// It primarily allows iterating over the path segments.
#[derive(Debug, Clone)]
pub struct RequestPath {
    path: String,
}

impl RequestPath {
    fn from_str(path: &str) -> Self {
        RequestPath {
            path: percent_decode_str(path).decode_utf8_lossy().into_owned()
        }
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn iter(&self) -> PathIter<'_> {
        PathIter::new(self.as_str())
    }
}


//------------ PathIter ------------------------------------------------------

/// An iterator over the segments of a path.
///
/// A trailing slash is ignored.
#[derive(Debug)]
pub struct PathIter<'a> {
    remaining: Option<&'a str>,
}

impl<'a> PathIter<'a> {
    fn new(path: &'a str) -> Self {
        let path = path.strip_prefix('/').unwrap_or(path);
        let path = path.strip_suffix('/').unwrap_or(path);
        PathIter {
            remaining: (!path.is_empty()).then_some(path)
        }
    }

    pub fn remaining(&self) -> Option<&str> {
        self.remaining
    }
}

impl<'a> Iterator for PathIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.remaining?;
        match remaining.split_once('/') {
            Some((head, tail)) => {
                self.remaining = Some(tail);
                Some(head)
            }
            None => {
                self.remaining = None;
                Some(remaining)
            }
        }
    }
}


//============ Tests =========================================================
