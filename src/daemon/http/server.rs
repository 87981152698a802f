//! The hyper based HTTP server.
//!
//! Here we deal with routing of requests, handing the actual work off to
//! the [`WorkerProcessCore`].

use std::convert::Infallible;
use hyper::{Method, StatusCode};
use log::{debug, error};
use crate::commons::error::Error;
use crate::server::request::SignatureRequest;
use crate::server::worker::WorkerIdentifier;
use crate::server::WorkerProcessCore;
use super::request::{BodyError, ConnectionInfo, HyperRequest, Request};
use super::response::{HttpResponse, HyperResponse};


//------------ HttpServer ----------------------------------------------------

#[derive(Clone, Debug)]
pub struct HttpServer {
    core: WorkerProcessCore,

    /// The maximum size of a request body.
    post_limit: u64,
}

impl HttpServer {
    pub fn new(core: WorkerProcessCore, post_limit: u64) -> Self {
        HttpServer { core, post_limit }
    }

    pub fn core(&self) -> &WorkerProcessCore {
        &self.core
    }

    /// Processes a request received on a connection.
    pub async fn process_request(
        &self,
        request: HyperRequest,
        connection: ConnectionInfo,
    ) -> Result<HyperResponse, Infallible> {
        Ok(self.route(Request::new(request, connection)).await.into_hyper())
    }

    async fn route(&self, request: Request) -> HttpResponse {
        let path = request.path();
        let mut segments = path.iter();
        match (segments.next(), segments.next()) {
            (Some("healthcheck"), None) => self.health(&request).await,
            (Some("signserver"), Some("process")) => {
                if segments.next().is_some() {
                    return HttpResponse::not_found()
                }
                let worker = match worker_from_query(&request) {
                    Ok(worker) => worker,
                    Err(err) => return HttpResponse::response_from_error(err),
                };
                self.process(request, worker).await
            }
            (Some("signserver"), Some("worker")) => {
                let Some(worker) = segments.next() else {
                    return HttpResponse::not_found()
                };
                let worker = WorkerIdentifier::parse(worker);
                match segments.next() {
                    None => self.process(request, worker).await,
                    Some("status") if segments.next().is_none() => {
                        self.status(&request, worker).await
                    }
                    _ => HttpResponse::not_found(),
                }
            }
            _ => HttpResponse::not_found(),
        }
    }

    /// Runs a request through a worker.
    async fn process(
        &self, request: Request, worker: WorkerIdentifier
    ) -> HttpResponse {
        if request.method() != Method::POST {
            return HttpResponse::method_not_allowed()
        }
        let mut context = request.context();
        let data = match request.read_body(self.post_limit).await {
            Ok(data) => data,
            Err(BodyError::TooLarge) => return HttpResponse::payload_too_large(),
            Err(BodyError::CannotRead) => {
                return HttpResponse::response_from_error(
                    Error::illegal_request("Cannot read request body")
                )
            }
        };
        let request = SignatureRequest::new(rand::random::<u32>().into(), data);

        let core = self.core.clone();
        let res = tokio::task::spawn_blocking(move || {
            core.process(&worker, &request, &mut context)
        }).await;
        match res {
            Ok(Ok(response)) => HttpResponse::processed(&response),
            Ok(Err(err)) => HttpResponse::response_from_error(err),
            Err(err) => {
                error!("Request processing aborted: {err}");
                HttpResponse::response_from_error(
                    Error::signserver("Request processing aborted")
                )
            }
        }
    }

    /// Reports whether all enabled workers can process requests.
    async fn health(&self, request: &Request) -> HttpResponse {
        if request.method() != Method::GET {
            return HttpResponse::method_not_allowed()
        }
        let core = self.core.clone();
        let errors = tokio::task::spawn_blocking(move || {
            let registry = core.registry();
            let mut errors = Vec::new();
            for id in registry.worker_ids() {
                let Ok(state) = registry.get(&id.into()) else {
                    continue
                };
                if state.is_disabled() {
                    continue
                }
                for err in state.fatal_errors() {
                    errors.push(format!("Worker {id}: {err}"));
                }
            }
            errors
        }).await.unwrap_or_else(|err| {
            vec![format!("Health check aborted: {err}")]
        });

        if errors.is_empty() {
            HttpResponse::text("ALLOK")
        }
        else {
            debug!("Health check failed: {}", errors.join("; "));
            HttpResponse::text_with_status(
                StatusCode::INTERNAL_SERVER_ERROR, errors.join("\n")
            )
        }
    }

    /// Reports the status of a worker.
    ///
    /// The token self-test may block, it runs on the blocking pool.
    async fn status(
        &self, request: &Request, worker: WorkerIdentifier
    ) -> HttpResponse {
        if request.method() != Method::GET {
            return HttpResponse::method_not_allowed()
        }
        let core = self.core.clone();
        let res = tokio::task::spawn_blocking(move || {
            core.registry().status(&worker)
        }).await;
        match res {
            Ok(Ok(status)) => HttpResponse::json(&status),
            Ok(Err(err)) => HttpResponse::response_from_error(err),
            Err(err) => {
                error!("Status check aborted: {err}");
                HttpResponse::response_from_error(
                    Error::signserver("Status check aborted")
                )
            }
        }
    }
}

/// Returns the worker named by the `workerName` or `workerId` parameter.
fn worker_from_query(request: &Request) -> Result<WorkerIdentifier, Error> {
    if let Some(name) = request.query("workerName").filter(|s| !s.is_empty()) {
        return Ok(WorkerIdentifier::Name(name.to_string()))
    }
    match request.query("workerId") {
        Some(id) => id.trim().parse::<u32>().map(WorkerIdentifier::Id)
            .map_err(|_| {
                Error::illegal_request(format!("Illegal worker id: {id}"))
            }),
        None => Err(Error::illegal_request(
            "Missing workerName or workerId parameter"
        )),
    }
}

