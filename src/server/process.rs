//! The request processing pipeline.
//!
//! [`WorkerProcessCore::process`] runs a request through the stages
//! resolve, authorize, check, acquire, invoke, check validity and usage,
//! charge, archive, log and release. Any stage may fail. The remaining
//! stages are then skipped except for logging and releasing the crypto
//! instance, which always happen.

use std::sync::Arc;
use chrono::Utc;
use log::{debug, error, warn};
use crate::commons::crypto::cert;
use crate::commons::crypto::token::CryptoInstance;
use crate::commons::error::Error;
use crate::server::archive::Archiver;
use crate::server::context::{log_keys, RequestContext};
use crate::server::keyusage::KeyUsageCounter;
use crate::server::registry::{WorkerRegistry, WorkerState};
use crate::server::request::{SignatureRequest, SignatureResponse};
use crate::server::signers::Processable;
use crate::server::worker::{props, WorkerIdentifier};


//------------ Services ------------------------------------------------------

/// The services shared by all workers.
#[derive(Debug)]
pub struct Services {
    pub key_usage: KeyUsageCounter,
    pub archiver: Archiver,
}

impl Services {
    pub fn new(key_usage: KeyUsageCounter, archiver: Archiver) -> Self {
        Services { key_usage, archiver }
    }

    /// Creates services that keep everything in memory.
    pub fn in_memory() -> Self {
        Services::new(KeyUsageCounter::memory(), Archiver::memory())
    }
}


//------------ WorkerProcessCore ---------------------------------------------

#[derive(Clone, Debug)]
pub struct WorkerProcessCore {
    registry: Arc<WorkerRegistry>,
    services: Arc<Services>,
}

impl WorkerProcessCore {
    pub fn new(registry: Arc<WorkerRegistry>, services: Arc<Services>) -> Self {
        WorkerProcessCore { registry, services }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Processes a request with the given worker.
    pub fn process(
        &self,
        worker: &WorkerIdentifier,
        request: &SignatureRequest,
        context: &mut RequestContext,
    ) -> Result<SignatureResponse, Error> {
        let state = self.registry.get(worker)?;

        let transaction_id = context.transaction_id().to_string();
        let remote_ip = context.remote_ip();
        let forwarded_for = context.forwarded_for().map(ToString::to_string);
        let log = context.log_mut();
        log.put(log_keys::LOG_TIME, Utc::now().timestamp_millis());
        log.put(log_keys::LOG_ID, transaction_id);
        log.put(log_keys::WORKER_ID, state.id());
        log.put(log_keys::WORKER_NAME, state.name());
        log.put(log_keys::AUTHTYPE, state.authorizer().auth_type());
        if let Some(ip) = remote_ip {
            log.put(log_keys::CLIENT_IP, ip);
        }
        if let Some(forwarded_for) = forwarded_for {
            log.put(log_keys::FORWARDED_FOR, forwarded_for);
        }

        let mut lease = None;
        let res = self.process_worker(&state, request, context, &mut lease);
        let res = write_log(&state, request, context, res);

        if let Some(instance) = lease {
            if let Some(token) = state.token() {
                token.release(instance);
            }
            context.lease_released();
        }
        if context.outstanding_leases() > 0 {
            warn!(
                "Worker {} did not release {} crypto instances",
                state.id(), context.outstanding_leases()
            );
        }
        res
    }

    /// Runs all stages up to, but not including, logging.
    ///
    /// An acquired crypto instance is left in `lease` for the caller to
    /// release.
    fn process_worker<'a>(
        &self,
        state: &WorkerState,
        request: &SignatureRequest,
        context: &mut RequestContext,
        lease: &'a mut Option<Arc<CryptoInstance>>,
    ) -> Result<SignatureResponse, Error> {
        let worker_id = state.id();

        // Authorize
        if let Err(err) = state.authorizer().is_authorized(context) {
            context.log_mut().put(log_keys::CLIENT_AUTHORIZED, false);
            return Err(match err {
                Error::IllegalRequest(msg) => Error::IllegalRequest(
                    format!("Authorization failed: {msg}")
                ),
                err => err,
            })
        }
        context.log_mut().put(log_keys::CLIENT_AUTHORIZED, true);
        if let Some(client) = context.client_certificate().cloned() {
            let log = context.log_mut();
            log.put(log_keys::CLIENT_CERT_SUBJECTDN, cert::subject_dn(&client));
            log.put(log_keys::CLIENT_CERT_ISSUERDN, cert::issuer_dn(&client));
            if let Ok(serial) = cert::serial_hex(&client) {
                log.put(log_keys::CLIENT_CERT_SERIALNUMBER, serial);
            }
        }

        // Check disabled and misconfigured
        if state.is_disabled() {
            return Err(Error::offline(format!(
                "Error Signer : {worker_id} is disabled and cannot perform \
                 any signature operations"
            )))
        }
        if !state.config_errors().is_empty() {
            debug!(
                "Worker {} is misconfigured: {}",
                worker_id, state.config_errors().join("; ")
            );
            return Err(Error::signserver("Worker is misconfigured"))
        }

        // Acquire
        let instance = match state.token() {
            Some(token) if state.processable().uses_crypto_token() => {
                let alias = token.default_key().ok_or_else(|| {
                    Error::signserver("Worker is misconfigured")
                })?;
                let cache = state.config().is_true(props::CACHE_PRIVATEKEY)
                    .then(|| state.cache());
                let instance: &'a Arc<CryptoInstance> = lease.insert(
                    token.acquire(alias, cache)?
                );
                context.lease_acquired();
                let log = context.log_mut();
                log.put(log_keys::KEYALIAS, alias);
                log.put(log_keys::CRYPTOTOKEN, token.provider());
                Some(instance.as_ref())
            }
            _ => None,
        };

        let mut fatal = state.processable().live_errors();
        if let Some(instance) = instance {
            fatal.extend(state.processable().certificate_errors(instance.chain()));
        }
        if !fatal.is_empty() {
            return Err(Error::offline(fatal.join("; ")))
        }

        // Invoke
        let event = state.stats().start_event();
        let response = state.processable().process(
            request, context, instance, self
        ).map_err(|err| match err {
            Error::SignServer(msg) => Error::SignServer(format!(
                "Error calling signer with id {worker_id} : {msg}"
            )),
            err => err,
        })?;

        // Check validity and usage
        let checked = match state.processable() {
            Processable::Dispatcher(_) => Ok(None),
            _ => self.check_signer_certificate(state, &response, context),
        };
        state.stats().end_event(event);
        let key_hash = checked?;

        // Charge
        if context.is_fulfilled() {
            let purchased = state.accounter().purchase(context);
            context.log_mut().put(log_keys::PURCHASED, purchased);
            if !purchased {
                return Err(Error::NotGranted("Purchase not granted".into()))
            }
        }

        // Archive
        if state.config().is_true(props::ARCHIVE) {
            let mut ids = Vec::new();
            for archivable in response.archivables() {
                self.services.archiver.archive(
                    worker_id, context.transaction_id(), archivable
                ).map_err(|err| {
                    error!("Archiving for worker {worker_id} failed: {err}");
                    Error::signserver("Archiving failed. See server LOG.")
                })?;
                if !ids.contains(&archivable.archive_id) {
                    ids.push(archivable.archive_id.clone());
                }
            }
            context.log_mut().put(log_keys::ARCHIVE_IDS, ids.join(", "));
        }

        if let Some((hash, limit)) = key_hash {
            let incremented = self.services.key_usage
                .increment_if_within_limit(&hash, limit)
                .unwrap_or_else(|err| {
                    error!("Key usage counter for worker {worker_id} failed: {err}");
                    false
                });
            if !incremented {
                return Err(key_usage_exceeded(worker_id))
            }
        }

        Ok(response)
    }

    /// Checks the validity of the signer certificate and the key usage.
    ///
    /// Returns the key hash and limit if the use needs to be counted.
    fn check_signer_certificate(
        &self,
        state: &WorkerState,
        response: &SignatureResponse,
        context: &mut RequestContext,
    ) -> Result<Option<(String, i64)>, Error> {
        let worker_id = state.id();
        let config = state.config();

        let limit = match config.get_non_empty(props::KEYUSAGELIMIT) {
            None => -1,
            Some(value) => value.trim().parse::<i64>().map_err(|_| {
                Error::signserver(format!(
                    "Incorrect value in worker property {}",
                    props::KEYUSAGELIMIT
                ))
            })?,
        };
        let counter_disabled = config.is_true(props::DISABLEKEYUSAGECOUNTER);
        if counter_disabled && limit > -1 {
            error!(
                "Worker {worker_id}: {} set together with {}, counting anyway",
                props::KEYUSAGELIMIT, props::DISABLEKEYUSAGECOUNTER
            );
        }

        let Some(cert) = response.signer_certificate() else {
            if limit > -1 {
                return Err(key_usage_exceeded(worker_id))
            }
            return Ok(None)
        };

        let log = context.log_mut();
        log.put(log_keys::SIGNER_CERT_SUBJECTDN, cert::subject_dn(cert));
        log.put(log_keys::SIGNER_CERT_ISSUERDN, cert::issuer_dn(cert));
        if let Ok(serial) = cert::serial_hex(cert) {
            log.put(log_keys::SIGNER_CERT_SERIALNUMBER, serial);
        }

        if config.get_bool(props::CHECKCERTVALIDITY, true).unwrap_or(true) {
            let min_days = config.get_non_empty(props::MINREMAININGCERTVALIDITY)
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(0);
            cert::check_validity(cert, min_days).map_err(Error::offline)?;
        }
        if config.is_true(props::CHECKCERTPRIVATEKEYVALIDITY) {
            cert::check_private_key_validity(cert, Utc::now())
                .map_err(Error::offline)?;
        }

        if counter_disabled && limit < 0 {
            return Ok(None)
        }
        let hash = cert::key_hash(cert).map_err(|err| {
            Error::signserver(format!("Cannot hash signer key: {err}"))
        })?;
        if limit > -1 {
            let within = self.services.key_usage.is_within_limit(&hash, limit)
                .unwrap_or_else(|err| {
                    error!("Key usage counter for worker {worker_id} failed: {err}");
                    false
                });
            if !within {
                return Err(key_usage_exceeded(worker_id))
            }
        }
        Ok(Some((hash, limit)))
    }
}

fn key_usage_exceeded(worker_id: u32) -> Error {
    Error::offline(format!(
        "Key usage limit exceeded or not initialized for worker {worker_id}"
    ))
}

/// Writes the worker log for the outcome of a request.
///
/// A failure to log turns a successful request into a failed one.
fn write_log(
    state: &WorkerState,
    request: &SignatureRequest,
    context: &mut RequestContext,
    res: Result<SignatureResponse, Error>,
) -> Result<SignatureResponse, Error> {
    let log = context.log_mut();
    log.put(log_keys::REQUESTID, request.request_id());
    match res {
        Ok(response) => {
            log.put(log_keys::PROCESS_SUCCESS, true);
            match state.logger().log(context.log()) {
                Ok(()) => Ok(response),
                Err(err) => {
                    error!("Worker {}: {err}", state.id());
                    Err(Error::signserver("Logging failed"))
                }
            }
        }
        Err(err) => {
            log.put(log_keys::EXCEPTION, err.message());
            log.put(log_keys::PROCESS_SUCCESS, false);
            if let Err(log_err) = state.logger().log(context.log()) {
                error!("Worker {}: {log_err}", state.id());
            }
            Err(err)
        }
    }
}
