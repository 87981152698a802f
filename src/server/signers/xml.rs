//! The XML-DSig signer.
//!
//! Signatures are written out directly in canonical form. Since every
//! element and attribute is produced here, exclusive canonicalization of
//! `SignedInfo` and `Object` reduces to adding the namespace declaration
//! to the element and writing empty elements as start and end tag pairs.

use std::fmt::Write;
use std::str::FromStr;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use openssl::bn::BigNumContext;
use openssl::ecdsa::EcdsaSig;
use openssl::x509::X509Ref;
use crate::commons::crypto::algorithm::{
    DigestAlgorithm, KeyKind, SignatureAlgorithm
};
use crate::commons::crypto::token::CryptoInstance;
use crate::commons::error::Error;
use crate::server::archive::Archivable;
use crate::server::context::RequestContext;
use crate::server::request::{SignatureRequest, SignatureResponse};
use crate::server::worker::{props, WorkerConfig};
use super::cms::{ALLOW_DETACHEDSIGNATURE_OVERRIDE, DETACHEDSIGNATURE};
use super::overrides::{requested_bool, Overridable, OverrideRefused};

pub const REQUEST_CONTENT_TYPE: &str = "application/octet-stream";
pub const RESPONSE_CONTENT_TYPE: &str = "text/xml";

const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const OBJECT_ID: &str = "object";


//------------ XmlSigner -----------------------------------------------------

#[derive(Clone, Debug)]
pub struct XmlSigner {
    signature_algorithm: Option<SignatureAlgorithm>,
    detached: Overridable<bool>,
}

impl XmlSigner {
    pub fn init(config: &WorkerConfig, errors: &mut Vec<String>) -> Self {
        let signature_algorithm = config.get_non_empty(
            props::SIGNATUREALGORITHM
        ).and_then(|value| {
            SignatureAlgorithm::from_str(value).map_err(|err| {
                errors.push(format!("Illegal signature algorithm: {err}"))
            }).ok()
        });
        XmlSigner {
            signature_algorithm,
            detached: Overridable::from_properties(
                config,
                DETACHEDSIGNATURE,
                ALLOW_DETACHEDSIGNATURE_OVERRIDE,
                errors
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
        let detached = self.detached.resolve(
            requested_bool(context.metadata(), DETACHEDSIGNATURE)
        ).map_err(|OverrideRefused(requested)| {
            Error::illegal_request(if requested {
                "Detached signature requested but not allowed"
            }
            else {
                "Non detached signature requested but not allowed"
            })
        })?;

        let cert = instance.certificate().ok_or_else(|| {
            Error::signserver("No signer certificate available")
        })?;
        let alg = self.signature_algorithm.unwrap_or_else(|| {
            SignatureAlgorithm::new(DigestAlgorithm::Sha256, instance.key_kind())
        });
        let data = request.data();

        let object = (!detached).then(|| BASE64.encode(data));
        let digest_input = match object.as_ref() {
            Some(content) => object_element(content, true).into_bytes(),
            None => data.to_vec(),
        };
        let digest = alg.digest().digest(&digest_input).map_err(xml_error)?;
        let signed_info_c14n = signed_info(alg, detached, &digest, true);

        let signature = instance.sign(alg, signed_info_c14n.as_bytes())?;
        let signature = match alg.key_kind() {
            KeyKind::Rsa => signature,
            KeyKind::Ec => ecdsa_raw(&signature, cert)?,
        };

        let mut xml = format!(r#"<Signature xmlns="{DSIG_NS}">"#);
        xml.push_str(&signed_info(alg, detached, &digest, false));
        write!(
            xml, "<SignatureValue>{}</SignatureValue>", BASE64.encode(signature)
        ).map_err(xml_error)?;
        xml.push_str("<KeyInfo><X509Data>");
        for cert in instance.chain() {
            write!(
                xml,
                "<X509Certificate>{}</X509Certificate>",
                BASE64.encode(cert.to_der().map_err(xml_error)?)
            ).map_err(xml_error)?;
        }
        xml.push_str("</X509Data></KeyInfo>");
        if let Some(content) = object.as_ref() {
            xml.push_str(&object_element(content, false));
        }
        xml.push_str("</Signature>");
        let signed = Bytes::from(xml);

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
}

fn xml_error(err: impl std::fmt::Display) -> Error {
    Error::signserver(format!("Error creating XML signature: {err}"))
}

/// Writes the `SignedInfo` element.
///
/// With `c14n` the namespace declaration is included as required for the
/// canonical form of the element standing on its own.
fn signed_info(
    alg: SignatureAlgorithm, detached: bool, digest: &[u8], c14n: bool
) -> String {
    let ns = if c14n { format!(r#" xmlns="{DSIG_NS}""#) } else { String::new() };
    let uri = if detached {
        String::new()
    }
    else {
        format!(r##" URI="#{OBJECT_ID}""##)
    };
    format!(
        "<SignedInfo{ns}>\
         <CanonicalizationMethod Algorithm=\"{EXC_C14N}\">\
         </CanonicalizationMethod>\
         <SignatureMethod Algorithm=\"{}\"></SignatureMethod>\
         <Reference{uri}>\
         <DigestMethod Algorithm=\"{}\"></DigestMethod>\
         <DigestValue>{}</DigestValue>\
         </Reference>\
         </SignedInfo>",
        alg.xml_uri(),
        alg.digest().xml_uri(),
        BASE64.encode(digest),
    )
}

/// Writes the `Object` element holding the base64 encoded content.
fn object_element(content: &str, c14n: bool) -> String {
    let ns = if c14n { format!(r#" xmlns="{DSIG_NS}""#) } else { String::new() };
    format!(r#"<Object{ns} Id="{OBJECT_ID}">{content}</Object>"#)
}

/// Converts a DER encoded ECDSA signature into the fixed size `r || s`
/// form used by XML-DSig.
fn ecdsa_raw(der: &[u8], cert: &X509Ref) -> Result<Vec<u8>, Error> {
    let sig = EcdsaSig::from_der(der).map_err(xml_error)?;
    let key = cert.public_key().map_err(xml_error)?;
    let ec = key.ec_key().map_err(xml_error)?;
    let mut ctx = BigNumContext::new().map_err(xml_error)?;
    let mut order = openssl::bn::BigNum::new().map_err(xml_error)?;
    ec.group().order(&mut order, &mut ctx).map_err(xml_error)?;
    let len = order.num_bytes();
    let mut res = sig.r().to_vec_padded(len).map_err(xml_error)?;
    res.extend(sig.s().to_vec_padded(len).map_err(xml_error)?);
    Ok(res)
}


//------------ Tests ---------------------------------------------------------
