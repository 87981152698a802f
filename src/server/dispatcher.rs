//! Dispatching time-stamp requests by their requested policy.

use bcder::Oid;
use bytes::Bytes;
use log::{debug, error};
use crate::commons::crypto::oid;
use crate::commons::crypto::tsp::{FailureInfo, TimeStampReq, TimeStampResp};
use crate::commons::error::Error;
use crate::server::context::{log_keys, RequestContext};
use crate::server::process::WorkerProcessCore;
use crate::server::request::{SignatureRequest, SignatureResponse};
use crate::server::signers::timestamp::{tsa_log_keys, RESPONSE_CONTENT_TYPE};
use crate::server::worker::{props, WorkerConfig, WorkerIdentifier};

pub const MAPPINGS: &str = "MAPPINGS";
pub const DEFAULTWORKER: &str = "DEFAULTWORKER";
pub const USEDEFAULTIFMISMATCH: &str = "USEDEFAULTIFMISMATCH";

/// How often a request may be forwarded by a dispatcher.
///
/// A forwarded request never reaches a second dispatcher.
pub const MAX_DISPATCH_DEPTH: u8 = 1;

const UNKNOWN_POLICY: &str = "request contains unknown policy.";


//------------ Dispatcher ----------------------------------------------------

/// Forwards time-stamp requests to the worker mapped to their policy.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    mappings: Vec<(Oid<Bytes>, WorkerIdentifier)>,
    default_worker: Option<WorkerIdentifier>,
    use_default_if_mismatch: bool,
    include_status_string: bool,
}

impl Dispatcher {
    pub fn init(config: &WorkerConfig, errors: &mut Vec<String>) -> Self {
        let mappings = match config.get(MAPPINGS) {
            Some(value) => parse_mappings(value),
            None => {
                error!("Property {MAPPINGS} missing");
                Vec::new()
            }
        };
        let mut flag = |key: &str, default: bool| {
            config.get_bool(key, default).unwrap_or_else(|err| {
                errors.push(err);
                default
            })
        };
        let use_default_if_mismatch = flag(USEDEFAULTIFMISMATCH, false);
        let include_status_string = flag(props::INCLUDESTATUSSTRING, true);
        Dispatcher {
            mappings,
            default_worker: config.get_non_empty(DEFAULTWORKER)
                .map(WorkerIdentifier::parse),
            use_default_if_mismatch,
            include_status_string,
        }
    }

    /// Finds the worker to forward to.
    pub fn lookup(&self, policy: Option<&Oid<Bytes>>) -> Option<&WorkerIdentifier> {
        let Some(policy) = policy else {
            return self.default_worker.as_ref()
        };
        self.mappings.iter()
            .find(|(oid, _)| oid == policy)
            .map(|(_, worker)| worker)
            .or_else(|| {
                if self.use_default_if_mismatch {
                    self.default_worker.as_ref()
                }
                else {
                    None
                }
            })
    }

    pub fn process(
        &self,
        request: &SignatureRequest,
        context: &mut RequestContext,
        core: &WorkerProcessCore,
    ) -> Result<SignatureResponse, Error> {
        if !context.mark_dispatcher_invoked() {
            return Err(Error::signserver(
                "Dispatcher called more than one time for the same request"
            ))
        }
        if context.dispatch_depth() >= MAX_DISPATCH_DEPTH {
            return Err(Error::signserver(format!(
                "Request already dispatched {} time(s), at most \
                 {MAX_DISPATCH_DEPTH} allowed",
                context.dispatch_depth()
            )))
        }

        let tsr = TimeStampReq::decode(request.data().clone()).map_err(|err| {
            debug!("Could not parse TimeStampRequest: {err}");
            Error::illegal_request("Could not parse TimeStampRequest")
        })?;

        let mut nested = RequestContext::dispatched_from(context);
        if let Some(policy) = tsr.req_policy.as_ref() {
            nested.log_mut().put(
                tsa_log_keys::TSA_REQUESTEDPOLICYOID, oid::to_dotted(policy)
            );
        }

        match self.lookup(tsr.req_policy.as_ref()) {
            Some(target) => {
                debug!("Dispatching request to worker {target}");
                core.process(target, request, &mut nested)
            }
            None => {
                let status_string = self.include_status_string.then(|| {
                    UNKNOWN_POLICY.to_string()
                });
                let response = TimeStampResp::rejection(
                    FailureInfo::UnacceptedPolicy, status_string
                );
                let log = context.log_mut();
                log.put(log_keys::CLIENT_AUTHORIZED, false);
                log.put(log_keys::EXCEPTION, "requested policy not supported");
                Ok(SignatureResponse::new(
                    request.request_id(),
                    response.to_bytes(),
                    RESPONSE_CONTENT_TYPE,
                    context.transaction_id(),
                ))
            }
        }
    }
}

/// Parses “oid:worker; oid:worker”, skipping bad entries.
fn parse_mappings(value: &str) -> Vec<(Oid<Bytes>, WorkerIdentifier)> {
    value.split(';').map(str::trim).filter(|s| !s.is_empty())
        .filter_map(|entry| {
            let parts: Vec<_> = entry.split(':').map(str::trim).collect();
            let [policy, worker] = parts.as_slice() else {
                debug!("Ignoring mapping without exactly one ':': {entry}");
                return None
            };
            match oid::parse(policy) {
                Ok(policy) if !worker.is_empty() => {
                    Some((policy, WorkerIdentifier::parse(worker)))
                }
                _ => {
                    debug!("Ignoring bad mapping: {entry}");
                    None
                }
            }
        }).collect()
}


//------------ Tests ---------------------------------------------------------
