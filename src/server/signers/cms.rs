//! The CMS signer.
//!
//! Produces a SignedData over the request data, either with the data
//! encapsulated or detached. A client may also send a digest it computed
//! itself, in which case the signature is always detached.

use std::str::FromStr;
use bcder::Oid;
use bytes::Bytes;
use chrono::Utc;
use crate::commons::crypto::algorithm::{DigestAlgorithm, SignatureAlgorithm};
use crate::commons::crypto::cms::SignedDataBuilder;
use crate::commons::crypto::oid;
use crate::commons::crypto::token::CryptoInstance;
use crate::commons::error::Error;
use crate::server::archive::Archivable;
use crate::server::context::RequestContext;
use crate::server::request::{SignatureRequest, SignatureResponse};
use crate::server::worker::{props, WorkerConfig};
use super::overrides::{requested_bool, Overridable, OverrideRefused};

pub const REQUEST_CONTENT_TYPE: &str = "application/octet-stream";
pub const RESPONSE_CONTENT_TYPE: &str = "application/pkcs7-signature";

pub const DETACHEDSIGNATURE: &str = "DETACHEDSIGNATURE";
pub const ALLOW_DETACHEDSIGNATURE_OVERRIDE: &str =
    "ALLOW_DETACHEDSIGNATURE_OVERRIDE";
pub const CLIENTSIDEHASHING: &str = "CLIENTSIDEHASHING";
pub const ALLOW_CLIENTSIDEHASHING_OVERRIDE: &str =
    "ALLOW_CLIENTSIDEHASHING_OVERRIDE";
pub const ACCEPTED_HASH_DIGEST_ALGORITHMS: &str =
    "ACCEPTED_HASH_DIGEST_ALGORITHMS";
pub const CONTENTOID: &str = "CONTENTOID";
pub const ALLOW_CONTENTOID_OVERRIDE: &str = "ALLOW_CONTENTOID_OVERRIDE";

/// Request metadata keys.
pub const USING_CLIENTSUPPLIED_HASH: &str = "USING_CLIENTSUPPLIED_HASH";
pub const CLIENTSIDE_HASHDIGESTALGORITHM: &str =
    "CLIENTSIDE_HASHDIGESTALGORITHM";


//------------ CmsSigner -----------------------------------------------------

#[derive(Clone, Debug)]
pub struct CmsSigner {
    signature_algorithm: Option<SignatureAlgorithm>,
    detached: Overridable<bool>,
    client_side_hashing: Overridable<bool>,
    accepted_hash_algorithms: Vec<DigestAlgorithm>,
    content_oid: Overridable<Oid<Bytes>>,
}

impl CmsSigner {
    pub fn init(config: &WorkerConfig, errors: &mut Vec<String>) -> Self {
        let signature_algorithm = config.get_non_empty(
            props::SIGNATUREALGORITHM
        ).and_then(|value| {
            SignatureAlgorithm::from_str(value).map_err(|err| {
                errors.push(format!("Illegal signature algorithm: {err}"))
            }).ok()
        });

        let detached = Overridable::from_properties(
            config, DETACHEDSIGNATURE, ALLOW_DETACHEDSIGNATURE_OVERRIDE, errors
        );
        let client_side_hashing = Overridable::from_properties(
            config, CLIENTSIDEHASHING, ALLOW_CLIENTSIDEHASHING_OVERRIDE, errors
        );

        let accepted_hash_algorithms: Vec<_> = config.get(
            ACCEPTED_HASH_DIGEST_ALGORITHMS
        ).map(|value| {
            value.split(',').map(str::trim).filter(|s| !s.is_empty())
                .filter_map(|name| {
                    DigestAlgorithm::from_str(name).map_err(|_| {
                        errors.push(format!(
                            "Illegal algorithm in \
                             {ACCEPTED_HASH_DIGEST_ALGORITHMS}: {name}"
                        ))
                    }).ok()
                }).collect()
        }).unwrap_or_default();
        if (client_side_hashing.default || client_side_hashing.allow_override)
            && accepted_hash_algorithms.is_empty()
        {
            errors.push(format!(
                "Must specify {ACCEPTED_HASH_DIGEST_ALGORITHMS} when \
                 {CLIENTSIDEHASHING} or {ALLOW_CLIENTSIDEHASHING_OVERRIDE} \
                 is true"
            ));
        }

        let default_content_oid = match config.get_non_empty(CONTENTOID) {
            None => oid::owned(oid::ID_DATA),
            Some(value) => oid::parse(value).unwrap_or_else(|err| {
                errors.push(format!("Illegal value for {CONTENTOID}: {err}"));
                oid::owned(oid::ID_DATA)
            })
        };
        let allow_content_oid_override = config.get_bool(
            ALLOW_CONTENTOID_OVERRIDE, false
        ).unwrap_or_else(|err| {
            errors.push(err);
            false
        });

        CmsSigner {
            signature_algorithm,
            detached,
            client_side_hashing,
            accepted_hash_algorithms,
            content_oid: Overridable::new(
                default_content_oid, allow_content_oid_override
            ),
        }
    }

    pub fn certificate_errors(&self, chain: &[openssl::x509::X509]) -> Vec<String> {
        if chain.is_empty() {
            vec!["No signer certificate available".into()]
        }
        else {
            Vec::new()
        }
    }

    pub fn process(
        &self,
        request: &SignatureRequest,
        context: &mut RequestContext,
        instance: &CryptoInstance,
    ) -> Result<SignatureResponse, Error> {
        let metadata = context.metadata();

        let client_hash = self.client_side_hashing.resolve(
            requested_bool(metadata, USING_CLIENTSUPPLIED_HASH)
        ).map_err(|OverrideRefused(requested)| {
            Error::illegal_request(if requested {
                "Client-side hashing requested but not allowed"
            }
            else {
                "Server-side hashing requested but not allowed"
            })
        })?;

        let detached = self.detached.resolve(
            requested_bool(metadata, DETACHEDSIGNATURE)
        ).map_err(|OverrideRefused(requested)| {
            Error::illegal_request(if requested {
                "Detached signature requested but not allowed"
            }
            else {
                "Non detached signature requested but not allowed"
            })
        })?;

        let requested_oid = match metadata.get(CONTENTOID) {
            None => None,
            Some(value) => Some(oid::parse(value).map_err(|_| {
                Error::illegal_request(format!(
                    "Illegal content OID specified in request: {value}"
                ))
            })?),
        };
        let content_oid = self.content_oid.resolve(requested_oid).map_err(|_| {
            Error::illegal_request("Overriding content OID is not allowed")
        })?;

        let data = request.data();
        let (alg, message_digest) = if client_hash {
            let alg = self.client_hash_algorithm(context)?;
            if data.len() != alg.digest_len() {
                return Err(Error::illegal_request(format!(
                    "Client-side hash length {} does not match {alg}",
                    data.len()
                )))
            }
            (
                SignatureAlgorithm::new(alg, instance.key_kind()),
                data.to_vec()
            )
        }
        else {
            let alg = self.signature_algorithm.unwrap_or_else(|| {
                SignatureAlgorithm::new(
                    DigestAlgorithm::Sha256, instance.key_kind()
                )
            });
            let digest = alg.digest().digest(data).map_err(|err| {
                Error::signserver(format!("Error constructing CMS: {err}"))
            })?;
            (alg, digest)
        };

        let cert = instance.certificate().ok_or_else(|| {
            Error::signserver("No signer certificate available")
        })?;
        let prepared = SignedDataBuilder::new(content_oid, alg)
            .signing_time(Utc::now())
            .certificates(instance.chain().iter().cloned())
            .prepare(&message_digest, cert)
            .map_err(|err| {
                Error::signserver(format!("Error constructing CMS: {err}"))
            })?;
        let signature = instance.sign(alg, &prepared.to_be_signed())?;
        let content = (!detached && !client_hash).then_some(data.as_ref());
        let signed = prepared.finish(&signature, content);

        context.set_fulfilled(true);
        let archive_id = context.transaction_id().to_string();
        let archivables = vec![
            Archivable::request(REQUEST_CONTENT_TYPE, data.clone(), &archive_id),
            Archivable::response(
                RESPONSE_CONTENT_TYPE, signed.clone(), &archive_id
            ),
        ];
        Ok(SignatureResponse::new(
            request.request_id(), signed, RESPONSE_CONTENT_TYPE, archive_id
        ).with_signer_certificate(Some(cert.to_owned()))
        .with_archivables(archivables))
    }

    /// Returns the digest algorithm a client used for its hash.
    fn client_hash_algorithm(
        &self, context: &RequestContext
    ) -> Result<DigestAlgorithm, Error> {
        let name = context.metadata().get(CLIENTSIDE_HASHDIGESTALGORITHM)
            .ok_or_else(|| {
                Error::illegal_request(
                    "Client-side hashing requested but no hash algorithm \
                     specified"
                )
            })?;
        DigestAlgorithm::from_str(name).ok().filter(|alg| {
            self.accepted_hash_algorithms.contains(alg)
        }).ok_or_else(|| {
            Error::illegal_request(format!(
                "Client specified hash algorithm {name} is not accepted"
            ))
        })
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::crypto::cms::SignedDataInfo;
    use crate::commons::crypto::token::SigningKey;
    use crate::test;

    fn signer(props: &[(&str, &str)]) -> CmsSigner {
        let config: WorkerConfig = props.iter().copied().collect();
        let mut errors = Vec::new();
        let signer = CmsSigner::init(&config, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        signer
    }

    fn instance() -> CryptoInstance {
        let (key, cert) = test::plain_key_and_cert("CN=CMS Signer");
        CryptoInstance::new("cms", SigningKey::Software(key), "test", vec![cert])
    }

    fn sign(
        signer: &CmsSigner, context: &mut RequestContext, data: &[u8]
    ) -> Result<SignedDataInfo, Error> {
        let response = signer.process(
            &SignatureRequest::new(7, Bytes::copy_from_slice(data)),
            context,
            &instance()
        )?;
        assert_eq!(response.content_type(), RESPONSE_CONTENT_TYPE);
        Ok(SignedDataInfo::decode(response.data().clone()).unwrap())
    }

    #[test]
    fn encapsulated_by_default() {
        let signer = signer(&[]);
        let mut context = RequestContext::new();
        let info = sign(&signer, &mut context, b"hello").unwrap();
        assert!(context.is_fulfilled());
        assert_eq!(info.content.as_deref(), Some(b"hello".as_ref()));
        assert_eq!(info.content_type, oid::ID_DATA);

        let cert = info.first_certificate().unwrap();
        assert!(info.verify(&cert, SignatureAlgorithm::SHA256_WITH_RSA).unwrap());
        let digest = DigestAlgorithm::Sha256.digest(b"hello").unwrap();
        assert_eq!(info.message_digest.as_deref(), Some(digest.as_slice()));
    }

    #[test]
    fn detached_override() {
        let fixed = signer(&[("DETACHEDSIGNATURE", "TRUE")]);
        let mut context = RequestContext::new()
            .with_metadata(DETACHEDSIGNATURE, "false");
        assert_eq!(
            sign(&fixed, &mut context, b"data").unwrap_err(),
            Error::illegal_request(
                "Non detached signature requested but not allowed"
            )
        );
        assert!(!context.is_fulfilled());

        let mut context = RequestContext::new()
            .with_metadata(DETACHEDSIGNATURE, "true");
        assert!(sign(&fixed, &mut context, b"data").unwrap().content.is_none());

        let open = signer(&[("ALLOW_DETACHEDSIGNATURE_OVERRIDE", "true")]);
        let mut context = RequestContext::new()
            .with_metadata(DETACHEDSIGNATURE, "TRUE");
        assert!(sign(&open, &mut context, b"data").unwrap().content.is_none());
    }

    #[test]
    fn client_side_hash() {
        let signer = signer(&[
            ("CLIENTSIDEHASHING", "true"),
            ("ACCEPTED_HASH_DIGEST_ALGORITHMS", "SHA-256,SHA-512"),
        ]);
        let digest = DigestAlgorithm::Sha512.digest(b"document").unwrap();
        let mut context = RequestContext::new()
            .with_metadata(USING_CLIENTSUPPLIED_HASH, "true")
            .with_metadata(CLIENTSIDE_HASHDIGESTALGORITHM, "SHA-512");
        let info = sign(&signer, &mut context, &digest).unwrap();
        assert!(info.content.is_none());
        assert_eq!(info.message_digest.as_deref(), Some(digest.as_slice()));
        assert_eq!(info.digest_algorithm, oid::SHA512);

        let mut context = RequestContext::new()
            .with_metadata(USING_CLIENTSUPPLIED_HASH, "true")
            .with_metadata(CLIENTSIDE_HASHDIGESTALGORITHM, "SHA-1");
        let err = sign(&signer, &mut context, &[0u8; 20]).unwrap_err();
        assert!(err.is_illegal_request());

        let mut context = RequestContext::new()
            .with_metadata(CLIENTSIDE_HASHDIGESTALGORITHM, "SHA-256");
        let err = sign(&signer, &mut context, &[0u8; 20]).unwrap_err();
        assert!(err.is_illegal_request(), "wrong length must be refused");
    }

    #[test]
    fn server_side_hash_refused_when_fixed() {
        let signer = signer(&[
            ("CLIENTSIDEHASHING", "true"),
            ("ACCEPTED_HASH_DIGEST_ALGORITHMS", "SHA-256"),
        ]);
        let mut context = RequestContext::new()
            .with_metadata(USING_CLIENTSUPPLIED_HASH, "false");
        assert_eq!(
            sign(&signer, &mut context, b"data").unwrap_err(),
            Error::illegal_request("Server-side hashing requested but not allowed")
        );
    }

    #[test]
    fn content_oid_override() {
        let fixed = signer(&[]);
        let mut context = RequestContext::new()
            .with_metadata(CONTENTOID, "1.2.3.4");
        assert!(sign(&fixed, &mut context, b"x").unwrap_err().is_illegal_request());

        let mut context = RequestContext::new()
            .with_metadata(CONTENTOID, "1.2.840.113549.1.7.1");
        assert!(sign(&fixed, &mut context, b"x").is_ok());

        let open = signer(&[("ALLOW_CONTENTOID_OVERRIDE", "true")]);
        let mut context = RequestContext::new()
            .with_metadata(CONTENTOID, "1.2.3.4");
        let info = sign(&open, &mut context, b"x").unwrap();
        assert_eq!(info.content_type, oid::parse("1.2.3.4").unwrap());
    }

    #[test]
    fn client_side_hashing_needs_algorithms() {
        let config: WorkerConfig = [
            ("ALLOW_CLIENTSIDEHASHING_OVERRIDE", "true"),
            ("CONTENTOID", "not an oid"),
        ].into_iter().collect();
        let mut errors = Vec::new();
        CmsSigner::init(&config, &mut errors);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("Must specify"));
    }
}
