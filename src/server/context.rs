//! The per-request context.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use openssl::x509::X509;


//------------ RequestContext ------------------------------------------------

/// Everything known about a request besides its data.
///
/// A context is created by the transport for a single request, handed
/// through the whole pipeline by mutable reference and dropped when the
/// request is done.
#[derive(Debug)]
pub struct RequestContext {
    transaction_id: String,
    received: DateTime<Utc>,
    remote_ip: Option<IpAddr>,
    forwarded_for: Option<String>,
    credentials: Option<UsernamePassword>,
    client_certificate: Option<X509>,
    metadata: RequestMetadata,
    dispatch_depth: u8,
    dispatched: bool,
    dispatcher_invoked: bool,
    fulfilled: bool,
    outstanding_leases: usize,
    log: LogMap,
}

impl RequestContext {
    pub fn new() -> Self {
        RequestContext {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            received: Utc::now(),
            remote_ip: None,
            forwarded_for: None,
            credentials: None,
            client_certificate: None,
            metadata: RequestMetadata::default(),
            dispatch_depth: 0,
            dispatched: false,
            dispatcher_invoked: false,
            fulfilled: false,
            outstanding_leases: 0,
            log: LogMap::default(),
        }
    }

    pub fn with_remote_ip(mut self, ip: IpAddr) -> Self {
        self.remote_ip = Some(ip);
        self
    }

    pub fn with_forwarded_for(mut self, forwarded: impl Into<String>) -> Self {
        self.forwarded_for = Some(forwarded.into());
        self
    }

    pub fn with_credentials(
        mut self, username: impl Into<String>, password: impl Into<String>
    ) -> Self {
        self.credentials = Some(UsernamePassword {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_client_certificate(mut self, cert: X509) -> Self {
        self.client_certificate = Some(cert);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Creates the context for a request forwarded by a dispatcher.
    ///
    /// The new context shares the caller's identity and metadata but
    /// starts with an empty log. It is marked as dispatched so that the
    /// target worker can accept it without authorizing the client again.
    pub fn dispatched_from(parent: &RequestContext) -> Self {
        RequestContext {
            transaction_id: parent.transaction_id.clone(),
            received: Utc::now(),
            remote_ip: parent.remote_ip,
            forwarded_for: parent.forwarded_for.clone(),
            credentials: parent.credentials.clone(),
            client_certificate: parent.client_certificate.clone(),
            metadata: parent.metadata.clone(),
            dispatch_depth: parent.dispatch_depth.saturating_add(1),
            dispatched: true,
            dispatcher_invoked: false,
            fulfilled: false,
            outstanding_leases: 0,
            log: LogMap::default(),
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn received(&self) -> DateTime<Utc> {
        self.received
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_ip
    }

    pub fn forwarded_for(&self) -> Option<&str> {
        self.forwarded_for.as_deref()
    }

    pub fn credentials(&self) -> Option<&UsernamePassword> {
        self.credentials.as_ref()
    }

    pub fn client_certificate(&self) -> Option<&X509> {
        self.client_certificate.as_ref()
    }

    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    pub fn dispatch_depth(&self) -> u8 {
        self.dispatch_depth
    }

    /// Returns whether a dispatcher created this context.
    ///
    /// Only [`RequestContext::dispatched_from`] sets this, transports have
    /// no way to.
    pub fn is_dispatched(&self) -> bool {
        self.dispatched
    }

    /// Records that a dispatcher is handling this context.
    ///
    /// Returns `false` if a dispatcher has already been invoked with this
    /// very context.
    pub fn mark_dispatcher_invoked(&mut self) -> bool {
        !std::mem::replace(&mut self.dispatcher_invoked, true)
    }

    /// Marks the request as fulfilled so the client will be charged.
    pub fn set_fulfilled(&mut self, fulfilled: bool) {
        self.fulfilled = fulfilled;
    }

    pub fn is_fulfilled(&self) -> bool {
        self.fulfilled
    }

    pub(crate) fn lease_acquired(&mut self) {
        self.outstanding_leases += 1;
    }

    pub(crate) fn lease_released(&mut self) {
        self.outstanding_leases = self.outstanding_leases.saturating_sub(1);
    }

    /// Returns the number of crypto instances acquired but not released.
    pub fn outstanding_leases(&self) -> usize {
        self.outstanding_leases
    }

    pub fn log(&self) -> &LogMap {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut LogMap {
        &mut self.log
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}


//------------ UsernamePassword ----------------------------------------------

#[derive(Clone, Eq, PartialEq)]
pub struct UsernamePassword {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for UsernamePassword {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UsernamePassword")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}


//------------ RequestMetadata -----------------------------------------------

/// Client supplied key-value pairs accompanying a request.
///
/// Keys are case insensitive. An empty value counts as not given.
#[derive(Clone, Debug, Default)]
pub struct RequestMetadata(BTreeMap<String, String>);

impl RequestMetadata {
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_uppercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_uppercase())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}


//------------ LogMap --------------------------------------------------------

/// The entries of the worker log for a request, in insertion order.
///
/// Values can be deferred so expensive renderings are only done if a
/// logger actually writes them.
#[derive(Default)]
pub struct LogMap {
    entries: Vec<(String, Loggable)>,
}

#[derive(Clone)]
pub enum Loggable {
    Value(String),
    Deferred(Arc<dyn Fn() -> String + Send + Sync>),
}

impl Loggable {
    pub fn render(&self) -> String {
        match self {
            Loggable::Value(value) => value.clone(),
            Loggable::Deferred(op) => op(),
        }
    }
}

impl LogMap {
    /// Sets an entry, replacing an earlier value but keeping its position.
    pub fn put(&mut self, key: &str, value: impl fmt::Display) {
        self.put_loggable(key, Loggable::Value(value.to_string()))
    }

    pub fn put_deferred<F>(&mut self, key: &str, op: F)
    where F: Fn() -> String + Send + Sync + 'static {
        self.put_loggable(key, Loggable::Deferred(Arc::new(op)))
    }

    fn put_loggable(&mut self, key: &str, value: Loggable) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Returns the rendered value of an entry.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.render())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Loggable)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders all entries as `KEY: value; KEY: value`.
    pub fn render(&self) -> String {
        let mut res = String::new();
        for (key, value) in &self.entries {
            if !res.is_empty() {
                res.push_str("; ");
            }
            res.push_str(key);
            res.push_str(": ");
            res.push_str(&value.render());
        }
        res
    }
}

impl fmt::Debug for LogMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.entries.iter().map(|(k, _)| k)).finish()
    }
}


//------------ Log Keys ------------------------------------------------------

/// Names of the entries written to the worker log.
pub mod log_keys {
    pub const LOG_TIME: &str = "LOG_TIME";
    pub const LOG_ID: &str = "LOG_ID";
    pub const CLIENT_IP: &str = "CLIENT_IP";
    pub const FORWARDED_FOR: &str = "X-FORWARDED-FOR";
    pub const WORKER_ID: &str = "WORKER_ID";
    pub const WORKER_NAME: &str = "WORKER_NAME";
    pub const AUTHTYPE: &str = "AUTHTYPE";
    pub const CLIENT_AUTHORIZED: &str = "CLIENT_AUTHORIZED";
    pub const CLIENT_CERT_SUBJECTDN: &str = "CLIENT_CERT_SUBJECTDN";
    pub const CLIENT_CERT_ISSUERDN: &str = "CLIENT_CERT_ISSUERDN";
    pub const CLIENT_CERT_SERIALNUMBER: &str = "CLIENT_CERT_SERIALNUMBER";
    pub const SIGNER_CERT_SUBJECTDN: &str = "SIGNER_CERT_SUBJECTDN";
    pub const SIGNER_CERT_ISSUERDN: &str = "SIGNER_CERT_ISSUERDN";
    pub const SIGNER_CERT_SERIALNUMBER: &str = "SIGNER_CERT_SERIALNUMBER";
    pub const KEYALIAS: &str = "KEYALIAS";
    pub const CRYPTOTOKEN: &str = "CRYPTOTOKEN";
    pub const PURCHASED: &str = "PURCHASED";
    pub const EXCEPTION: &str = "EXCEPTION";
    pub const PROCESS_SUCCESS: &str = "PROCESS_SUCCESS";
    pub const REQUESTID: &str = "REQUESTID";
    pub const ARCHIVE_IDS: &str = "ARCHIVE_IDS";
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn log_map_keeps_order_and_replaces() {
        let mut log = LogMap::default();
        log.put("WORKER_ID", 1);
        log.put("EXCEPTION", "boom");
        log.put("WORKER_ID", 2);
        assert_eq!(log.render(), "WORKER_ID: 2; EXCEPTION: boom");
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn deferred_values_render_late() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut log = LogMap::default();
        let counter = calls.clone();
        log.put_deferred("TSA_TIMESTAMPREQUEST_ENCODED", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            "MIIB".to_string()
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(log.get("TSA_TIMESTAMPREQUEST_ENCODED").unwrap(), "MIIB");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatched_contexts() {
        let parent = RequestContext::new()
            .with_credentials("alice", "secret")
            .with_metadata("detachedSignature", "true");
        assert!(!parent.is_dispatched());
        assert_eq!(parent.dispatch_depth(), 0);

        let child = RequestContext::dispatched_from(&parent);
        assert!(child.is_dispatched());
        assert_eq!(child.dispatch_depth(), 1);
        assert_eq!(child.transaction_id(), parent.transaction_id());
        assert_eq!(child.credentials().unwrap().username, "alice");
        assert_eq!(child.metadata().get("DETACHEDSIGNATURE"), Some("true"));
        assert!(child.log().is_empty());
    }

    #[test]
    fn empty_metadata_is_absent() {
        let ctx = RequestContext::new().with_metadata("CONTENTOID", " ");
        assert_eq!(ctx.metadata().get("CONTENTOID"), None);
    }
}
