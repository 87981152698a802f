//! CMS SignedData as used by the time-stamp and CMS signers.
//!
//! Building a signed object happens in two steps: [`SignedDataBuilder::
//! prepare`] produces the DER encoded signed attributes that need to be
//! signed by a crypto instance, and [`PreparedSignedData::finish`] adds the
//! signature and encodes the complete ContentInfo.
use bcder::{Mode, OctetString, Oid, Tag};
use bcder::decode::{self, DecodeError};
use bcder::encode::{self, PrimitiveContent, Values};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use openssl::error::ErrorStack;
use openssl::x509::{X509, X509Ref};

use super::algorithm::{DigestAlgorithm, SignatureAlgorithm};
use super::cert;
use super::der::{self, CodecError, RawDer};
use super::oid;


//------------ SigningCertificate --------------------------------------------

/// Which signing certificate attribute to include.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigningCertificate {
    /// No attribute.
    None,

    /// RFC 2634 ESSCertID, always with a SHA-1 hash.
    V1,

    /// RFC 5035 ESSCertIDv2 with the given hash algorithm.
    V2(DigestAlgorithm),
}

impl SigningCertificate {
    /// Picks the attribute version for a certificate digest algorithm.
    pub fn for_digest(alg: DigestAlgorithm) -> Self {
        if alg == DigestAlgorithm::Sha1 {
            SigningCertificate::V1
        }
        else {
            SigningCertificate::V2(alg)
        }
    }
}


//------------ SignedDataBuilder ---------------------------------------------

#[derive(Clone, Debug)]
pub struct SignedDataBuilder {
    content_type: Oid<Bytes>,
    signature_algorithm: SignatureAlgorithm,
    signing_time: Option<DateTime<Utc>>,
    signing_certificate: SigningCertificate,
    certificates: Vec<X509>,
}

impl SignedDataBuilder {
    pub fn new(
        content_type: Oid<Bytes>,
        signature_algorithm: SignatureAlgorithm,
    ) -> Self {
        SignedDataBuilder {
            content_type,
            signature_algorithm,
            signing_time: None,
            signing_certificate: SigningCertificate::None,
            certificates: Vec::new(),
        }
    }

    pub fn signing_time(mut self, time: DateTime<Utc>) -> Self {
        self.signing_time = Some(time);
        self
    }

    pub fn signing_certificate(mut self, attr: SigningCertificate) -> Self {
        self.signing_certificate = attr;
        self
    }

    /// Adds certificates to include in the `certificates` field.
    pub fn certificates(mut self, certs: impl IntoIterator<Item = X509>) -> Self {
        self.certificates.extend(certs);
        self
    }

    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        self.signature_algorithm.digest()
    }

    /// Prepares the signed attributes over the given message digest.
    pub fn prepare(
        self,
        message_digest: &[u8],
        signer: &X509Ref,
    ) -> Result<PreparedSignedData, CodecError> {
        let codec = |e: ErrorStack| CodecError::encode(e);
        let issuer = Bytes::from(signer.issuer_name().to_der().map_err(codec)?);
        let serial = cert::serial_bytes(signer).map_err(codec)?;

        let mut attrs = vec![
            attribute(oid::CONTENT_TYPE, self.content_type.encode_ref()),
            attribute(
                oid::MESSAGE_DIGEST,
                OctetString::encode_slice(Bytes::copy_from_slice(message_digest))
            ),
        ];
        if let Some(time) = self.signing_time {
            attrs.push(attribute(
                oid::SIGNING_TIME, der::generalized_time(time)
            ));
        }
        match self.signing_certificate {
            SigningCertificate::None => { }
            SigningCertificate::V1 => {
                let hash = signer.digest(
                    DigestAlgorithm::Sha1.message_digest()
                ).map_err(codec)?;
                attrs.push(attribute(
                    oid::SIGNING_CERTIFICATE,
                    encode::sequence( // SigningCertificate
                        encode::sequence( // certs
                            encode::sequence(( // ESSCertID
                                OctetString::encode_slice(
                                    Bytes::copy_from_slice(&hash)
                                ),
                                issuer_serial(&issuer, &serial),
                            ))
                        )
                    )
                ));
            }
            SigningCertificate::V2(alg) => {
                let hash = signer.digest(alg.message_digest()).map_err(codec)?;
                // The hash algorithm defaults to SHA-256 and is then omitted.
                let hash_alg = (alg != DigestAlgorithm::Sha256).then(|| {
                    digest_algorithm_identifier(alg)
                });
                attrs.push(attribute(
                    oid::SIGNING_CERTIFICATE_V2,
                    encode::sequence( // SigningCertificateV2
                        encode::sequence( // certs
                            encode::sequence(( // ESSCertIDv2
                                hash_alg,
                                OctetString::encode_slice(
                                    Bytes::copy_from_slice(&hash)
                                ),
                                issuer_serial(&issuer, &serial),
                            ))
                        )
                    )
                ));
            }
        }

        let mut certificates = Vec::new();
        for cert in &self.certificates {
            certificates.extend(cert.to_der().map_err(codec)?);
        }

        Ok(PreparedSignedData {
            content_type: self.content_type,
            signature_algorithm: self.signature_algorithm,
            signed_attrs: der::set_of_content(attrs),
            issuer,
            serial,
            certificates,
        })
    }
}

fn attribute<V: Values>(attr_type: bcder::ConstOid, value: V) -> Vec<u8> {
    der::to_vec(&encode::sequence((
        attr_type.encode(),
        encode::set(value),
    )))
}

fn issuer_serial<'a>(
    issuer: &'a Bytes,
    serial: &'a [u8],
) -> impl Values + 'a {
    encode::sequence((
        encode::sequence( // GeneralNames
            encode::sequence_as(Tag::CTX_4, RawDer::new(issuer.clone()))
        ),
        der::unsigned(serial),
    ))
}

pub fn digest_algorithm_identifier(alg: DigestAlgorithm) -> impl Values {
    encode::sequence(alg.oid().encode())
}

pub fn signature_algorithm_identifier(alg: SignatureAlgorithm) -> impl Values {
    encode::sequence((
        alg.oid().encode(),
        alg.has_null_params().then(|| RawDer::new(Bytes::from_static(&[5, 0]))),
    ))
}


//------------ PreparedSignedData --------------------------------------------

/// A signed data object waiting for its signature.
#[derive(Clone, Debug)]
pub struct PreparedSignedData {
    content_type: Oid<Bytes>,
    signature_algorithm: SignatureAlgorithm,
    signed_attrs: Vec<u8>,
    issuer: Bytes,
    serial: Vec<u8>,
    certificates: Vec<u8>,
}

impl PreparedSignedData {
    /// The DER encoding of the signed attributes that needs to be signed.
    ///
    /// This uses the universal SET tag rather than the implicit tag used
    /// inside the SignerInfo.
    pub fn to_be_signed(&self) -> Vec<u8> {
        der::tlv(der::SET_TAG, &self.signed_attrs)
    }

    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.signature_algorithm
    }

    /// Encodes the ContentInfo with the signature.
    ///
    /// If `content` is `None`, the signature is detached.
    pub fn finish(self, signature: &[u8], content: Option<&[u8]>) -> Bytes {
        let version: u8 = if self.content_type == oid::ID_DATA { 1 } else { 3 };
        let digest = self.signature_algorithm.digest();

        let signer_info = encode::sequence((
            (
                1u8.encode(),
                encode::sequence(( // IssuerAndSerialNumber
                    RawDer::new(self.issuer.clone()),
                    der::unsigned(&self.serial),
                )),
                digest_algorithm_identifier(digest),
            ),
            (
                encode::sequence_as(
                    Tag::CTX_0, RawDer::new(self.signed_attrs.clone())
                ),
                signature_algorithm_identifier(self.signature_algorithm),
                OctetString::encode_slice(Bytes::copy_from_slice(signature)),
            ),
        ));

        let encap_content_info = encode::sequence((
            self.content_type.encode_ref(),
            content.map(|content| {
                encode::sequence_as(
                    Tag::CTX_0,
                    OctetString::encode_slice(Bytes::copy_from_slice(content))
                )
            }),
        ));

        let certificates = (!self.certificates.is_empty()).then(|| {
            encode::sequence_as(
                Tag::CTX_0, RawDer::new(self.certificates.clone())
            )
        });

        let content_info = encode::sequence((
            oid::SIGNED_DATA.encode(),
            encode::sequence_as(Tag::CTX_0,
                encode::sequence((
                    version.encode(),
                    encode::set(digest_algorithm_identifier(digest)),
                    encap_content_info,
                    certificates,
                    encode::set(signer_info),
                ))
            ),
        ));
        Bytes::from(der::to_vec(&content_info))
    }
}


//------------ SignedDataInfo ------------------------------------------------

/// The parts of a decoded SignedData with a single signer.
///
/// This is used to inspect produced objects and to verify their signature.
#[derive(Clone, Debug)]
pub struct SignedDataInfo {
    pub version: u8,
    pub content_type: Oid<Bytes>,
    pub content: Option<Bytes>,
    pub certificates: Option<Bytes>,
    pub digest_algorithm: Oid<Bytes>,
    pub signed_attrs: Bytes,
    pub message_digest: Option<Bytes>,
    pub signing_time_present: bool,
    pub signature: Bytes,
}

impl SignedDataInfo {
    pub fn decode(der: Bytes) -> Result<Self, CodecError> {
        Ok(Mode::Der.decode(der, Self::take_from)?)
    }

    pub fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| { // ContentInfo
            oid::SIGNED_DATA.skip_if(cons)?;
            cons.take_constructed_if(Tag::CTX_0, |cons| {
                cons.take_sequence(|cons| { // SignedData
                    let version = cons.take_u8()?;
                    let _ = cons.take_set(|cons| cons.capture_all())?;
                    let (content_type, content) = cons.take_sequence(|cons| {
                        Ok((
                            Oid::take_from(cons)?,
                            cons.take_opt_constructed_if(
                                Tag::CTX_0, OctetString::take_from
                            )?.map(|content| content.into_bytes())
                        ))
                    })?;
                    let certificates = cons.take_opt_constructed_if(
                        Tag::CTX_0, |cons| cons.capture_all()
                    )?.map(|captured| captured.into_bytes());
                    cons.take_set(|cons| {
                        cons.take_sequence(|cons| { // SignerInfo
                            cons.skip_u8_if(1)?;
                            cons.skip_one()?; // sid
                            let digest_algorithm = cons.take_sequence(|cons| {
                                let oid = Oid::take_from(cons)?;
                                cons.skip_all()?;
                                Ok(oid)
                            })?;
                            let mut message_digest = None;
                            let mut signing_time_present = false;
                            let signed_attrs = cons.take_constructed_if(
                                Tag::CTX_0, |cons| cons.capture(|cons| {
                                    while let Some(()) = cons.take_opt_sequence(|cons| {
                                        let attr = Oid::take_from(cons)?;
                                        if attr == oid::MESSAGE_DIGEST {
                                            message_digest = Some(
                                                cons.take_set(
                                                    OctetString::take_from
                                                )?.into_bytes()
                                            );
                                            Ok(())
                                        }
                                        else {
                                            if attr == oid::SIGNING_TIME {
                                                signing_time_present = true;
                                            }
                                            cons.skip_all()
                                        }
                                    })? { }
                                    Ok(())
                                })
                            )?.into_bytes();
                            cons.skip_one()?; // signatureAlgorithm
                            let signature = OctetString::take_from(cons)?
                                .into_bytes();
                            cons.skip_all()?; // unsignedAttrs
                            Ok(SignedDataInfo {
                                version,
                                content_type,
                                content,
                                certificates,
                                digest_algorithm,
                                signed_attrs,
                                message_digest,
                                signing_time_present,
                                signature,
                            })
                        })
                    })
                })
            })
        })
    }

    /// The first certificate of the certificates field.
    pub fn first_certificate(&self) -> Option<X509> {
        self.certificates.as_ref().and_then(|der| X509::from_der(der).ok())
    }

    /// Verifies the signature with the given certificate's public key.
    pub fn verify(
        &self,
        signer: &X509Ref,
        alg: SignatureAlgorithm,
    ) -> Result<bool, ErrorStack> {
        let key = signer.public_key()?;
        let mut verifier = openssl::sign::Verifier::new(
            alg.digest().message_digest(), &key
        )?;
        verifier.update(&der::tlv(der::SET_TAG, &self.signed_attrs))?;
        verifier.verify(&self.signature)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::sign::Signer;
    use crate::test;

    fn sign_with_test_key(
        prepared: &PreparedSignedData,
        key: &openssl::pkey::PKey<openssl::pkey::Private>,
    ) -> Vec<u8> {
        let mut signer = Signer::new(
            prepared.signature_algorithm().digest().message_digest(), key
        ).unwrap();
        signer.update(&prepared.to_be_signed()).unwrap();
        signer.sign_to_vec().unwrap()
    }

    #[test]
    fn enveloped_data_round_trips_through_decoder() {
        let (key, cert) = test::plain_key_and_cert("CN=CMS Signer");
        let content = b"some content to sign";
        let digest = DigestAlgorithm::Sha256.digest(content).unwrap();

        let prepared = SignedDataBuilder::new(
            oid::owned(oid::ID_DATA), SignatureAlgorithm::default()
        )
            .signing_time(Utc::now())
            .signing_certificate(SigningCertificate::V2(DigestAlgorithm::Sha256))
            .certificates(vec![cert.clone()])
            .prepare(&digest, &cert)
            .unwrap();
        let signature = sign_with_test_key(&prepared, &key);
        let der = prepared.finish(&signature, Some(content));

        let info = SignedDataInfo::decode(der).unwrap();
        assert_eq!(info.version, 1);
        assert_eq!(info.content_type, oid::ID_DATA);
        assert_eq!(info.content.as_deref(), Some(&content[..]));
        assert_eq!(info.message_digest.as_deref(), Some(digest.as_slice()));
        assert!(info.signing_time_present);
        assert_eq!(
            info.first_certificate().unwrap().to_der().unwrap(),
            cert.to_der().unwrap()
        );
        assert!(info.verify(&cert, SignatureAlgorithm::default()).unwrap());
    }

    #[test]
    fn detached_data_has_no_content() {
        let (key, cert) = test::plain_key_and_cert("CN=CMS Signer");
        let digest = DigestAlgorithm::Sha256.digest(b"detached").unwrap();

        let prepared = SignedDataBuilder::new(
            oid::parse("1.2.3.4").unwrap(), SignatureAlgorithm::default()
        ).prepare(&digest, &cert).unwrap();
        let signature = sign_with_test_key(&prepared, &key);
        let info = SignedDataInfo::decode(
            prepared.finish(&signature, None)
        ).unwrap();

        assert_eq!(info.version, 3);
        assert!(info.content.is_none());
        assert!(info.certificates.is_none());
        assert!(!info.signing_time_present);
        assert!(info.verify(&cert, SignatureAlgorithm::default()).unwrap());
    }
}
