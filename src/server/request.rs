//! Requests and responses passed between transports and the core.

use std::fmt;
use bytes::Bytes;
use openssl::x509::X509;
use crate::server::archive::Archivable;


//------------ SignatureRequest ----------------------------------------------

/// A request to sign data.
///
/// The data is reference counted, handing the request around does not copy
/// the payload.
#[derive(Clone, Debug)]
pub struct SignatureRequest {
    request_id: u64,
    data: Bytes,
}

impl SignatureRequest {
    pub fn new(request_id: u64, data: impl Into<Bytes>) -> Self {
        SignatureRequest { request_id, data: data.into() }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}


//------------ SignatureResponse ---------------------------------------------

/// The result of processing a signature request.
pub struct SignatureResponse {
    request_id: u64,
    data: Bytes,
    content_type: String,
    archive_id: String,
    signer_certificate: Option<X509>,
    archivables: Vec<Archivable>,
}

impl SignatureResponse {
    pub fn new(
        request_id: u64,
        data: impl Into<Bytes>,
        content_type: impl Into<String>,
        archive_id: impl Into<String>,
    ) -> Self {
        SignatureResponse {
            request_id,
            data: data.into(),
            content_type: content_type.into(),
            archive_id: archive_id.into(),
            signer_certificate: None,
            archivables: Vec::new(),
        }
    }

    pub fn with_signer_certificate(mut self, cert: Option<X509>) -> Self {
        self.signer_certificate = cert;
        self
    }

    pub fn with_archivables(mut self, archivables: Vec<Archivable>) -> Self {
        self.archivables = archivables;
        self
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn archive_id(&self) -> &str {
        &self.archive_id
    }

    pub fn signer_certificate(&self) -> Option<&X509> {
        self.signer_certificate.as_ref()
    }

    pub fn archivables(&self) -> &[Archivable] {
        &self.archivables
    }
}

impl fmt::Debug for SignatureResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SignatureResponse")
            .field("request_id", &self.request_id)
            .field("content_type", &self.content_type)
            .field("archive_id", &self.archive_id)
            .field("len", &self.data.len())
            .finish()
    }
}
