//! The protocol specific request processors.

use openssl::x509::X509;
use crate::commons::crypto::token::CryptoInstance;
use crate::commons::error::Error;
use crate::server::context::RequestContext;
use crate::server::dispatcher::Dispatcher;
use crate::server::process::WorkerProcessCore;
use crate::server::request::{SignatureRequest, SignatureResponse};
use crate::server::worker::{WorkerConfig, WorkerType};
use self::cms::CmsSigner;
use self::timestamp::TimeStampSigner;
use self::xml::XmlSigner;

pub mod cms;
pub mod overrides;
pub mod timestamp;
pub mod xml;


//------------ Processable ---------------------------------------------------

/// The processing implementation of a worker.
#[derive(Clone, Debug)]
pub enum Processable {
    Timestamp(TimeStampSigner),
    Cms(CmsSigner),
    Xml(XmlSigner),
    Dispatcher(Dispatcher),
}

impl Processable {
    /// Creates the implementation for a worker type.
    ///
    /// Configuration problems are added to `errors` rather than failing.
    pub fn init(
        worker_type: WorkerType,
        config: &WorkerConfig,
        errors: &mut Vec<String>,
    ) -> Self {
        match worker_type {
            WorkerType::Timestamp => {
                Processable::Timestamp(TimeStampSigner::init(config, errors))
            }
            WorkerType::Cms => Processable::Cms(CmsSigner::init(config, errors)),
            WorkerType::Xml => Processable::Xml(XmlSigner::init(config, errors)),
            WorkerType::Dispatcher => {
                Processable::Dispatcher(Dispatcher::init(config, errors))
            }
        }
    }

    /// Returns whether processing needs a key from a crypto token.
    pub fn uses_crypto_token(&self) -> bool {
        !matches!(self, Processable::Dispatcher(_))
    }

    /// Returns problems that currently prevent processing.
    pub fn live_errors(&self) -> Vec<String> {
        match self {
            Processable::Timestamp(signer) => signer.live_errors(),
            _ => Vec::new(),
        }
    }

    /// Returns the problems with the signer certificate chain.
    pub fn certificate_errors(&self, chain: &[X509]) -> Vec<String> {
        match self {
            Processable::Timestamp(signer) => signer.certificate_errors(chain),
            Processable::Cms(signer) => signer.certificate_errors(chain),
            Processable::Xml(signer) => signer.certificate_errors(chain),
            Processable::Dispatcher(_) => Vec::new(),
        }
    }

    pub fn process(
        &self,
        request: &SignatureRequest,
        context: &mut RequestContext,
        instance: Option<&CryptoInstance>,
        core: &WorkerProcessCore,
    ) -> Result<SignatureResponse, Error> {
        match (self, instance) {
            (Processable::Dispatcher(dispatcher), _) => {
                dispatcher.process(request, context, core)
            }
            (_, None) => Err(Error::signserver("No crypto instance available")),
            (Processable::Timestamp(signer), Some(instance)) => {
                signer.process(request, context, instance)
            }
            (Processable::Cms(signer), Some(instance)) => {
                signer.process(request, context, instance)
            }
            (Processable::Xml(signer), Some(instance)) => {
                signer.process(request, context, instance)
            }
        }
    }
}
