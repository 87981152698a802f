//! The RFC 3161 time-stamp protocol messages.
use std::fmt;
use bcder::{Mode, OctetString, Oid, Tag};
use bcder::decode::{self, DecodeError};
use bcder::encode::{self, PrimitiveContent, Values};
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::cert::Extension;
use super::der::{self, CodecError, RawDer};


//------------ TimeStampReq --------------------------------------------------

/// A decoded time-stamp request.
//
//  TimeStampReq ::= SEQUENCE  {
//     version                  INTEGER  { v1(1) },
//     messageImprint           MessageImprint,
//     reqPolicy                TSAPolicyId              OPTIONAL,
//     nonce                    INTEGER                  OPTIONAL,
//     certReq                  BOOLEAN                  DEFAULT FALSE,
//     extensions               [0] IMPLICIT Extensions  OPTIONAL  }
#[derive(Clone, Debug)]
pub struct TimeStampReq {
    pub message_imprint: MessageImprint,
    pub req_policy: Option<Oid<Bytes>>,

    /// The content octets of the nonce INTEGER.
    pub nonce: Option<Bytes>,
    pub cert_req: bool,
    pub extensions: Vec<Extension>,
}

impl TimeStampReq {
    pub fn new(message_imprint: MessageImprint) -> Self {
        TimeStampReq {
            message_imprint,
            req_policy: None,
            nonce: None,
            cert_req: false,
            extensions: Vec::new(),
        }
    }

    pub fn decode(data: Bytes) -> Result<Self, CodecError> {
        Ok(Mode::Der.decode(data, Self::take_from)?)
    }

    pub fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            cons.skip_u8_if(1)?;
            let message_imprint = MessageImprint::take_from(cons)?;
            let req_policy = Oid::take_opt_from(cons)?;
            let nonce = cons.take_opt_primitive_if(
                Tag::INTEGER, |prim| prim.take_all()
            )?;
            let cert_req = cons.take_opt_bool()?.unwrap_or(false);
            let mut extensions = Vec::new();
            cons.take_opt_constructed_if(Tag::CTX_0, |cons| {
                while let Some(ext) = cons.take_opt_sequence(|cons| {
                    let oid = Oid::take_from(cons)?;
                    let critical = cons.take_opt_bool()?.unwrap_or(false);
                    let value = OctetString::take_from(cons)?.into_bytes();
                    Ok(Extension { oid, critical, value })
                })? {
                    extensions.push(ext);
                }
                Ok(())
            })?;
            Ok(TimeStampReq {
                message_imprint,
                req_policy,
                nonce,
                cert_req,
                extensions,
            })
        })
    }

    pub fn encode_ref(&self) -> impl Values + '_ {
        let extensions = (!self.extensions.is_empty()).then(|| {
            let mut content = Vec::new();
            for ext in &self.extensions {
                content.extend(der::to_vec(&encode::sequence((
                    ext.oid.encode_ref(),
                    ext.critical.then(|| true.encode()),
                    OctetString::encode_slice(ext.value.clone()),
                ))));
            }
            encode::sequence_as(Tag::CTX_0, RawDer::new(content))
        });
        encode::sequence((
            1u8.encode(),
            self.message_imprint.encode_ref(),
            self.req_policy.as_ref().map(|oid| oid.encode_ref()),
            self.nonce.as_ref().map(|nonce| {
                OctetString::encode_slice_as(nonce.clone(), Tag::INTEGER)
            }),
            self.cert_req.then(|| true.encode()),
            extensions,
        ))
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(der::to_vec(&self.encode_ref()))
    }
}


//------------ MessageImprint ------------------------------------------------

//  MessageImprint ::= SEQUENCE  {
//       hashAlgorithm                AlgorithmIdentifier,
//       hashedMessage                OCTET STRING  }
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageImprint {
    pub hash_algorithm: Oid<Bytes>,
    pub hashed_message: Bytes,
}

impl MessageImprint {
    pub fn take_from<S: decode::Source>(
        cons: &mut decode::Constructed<S>
    ) -> Result<Self, DecodeError<S::Error>> {
        cons.take_sequence(|cons| {
            let hash_algorithm = cons.take_sequence(|cons| {
                let oid = Oid::take_from(cons)?;
                cons.skip_all()?; // parameters, usually absent or NULL
                Ok(oid)
            })?;
            let hashed_message = OctetString::take_from(cons)?.into_bytes();
            Ok(MessageImprint { hash_algorithm, hashed_message })
        })
    }

    pub fn encode_ref(&self) -> impl Values + '_ {
        encode::sequence((
            encode::sequence(self.hash_algorithm.encode_ref()),
            OctetString::encode_slice(self.hashed_message.clone()),
        ))
    }
}


//------------ PkiStatus -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PkiStatus {
    Granted = 0,
    GrantedWithMods = 1,
    Rejection = 2,
    Waiting = 3,
    RevocationWarning = 4,
    RevocationNotification = 5,
}

impl PkiStatus {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PkiStatus::Granted),
            1 => Some(PkiStatus::GrantedWithMods),
            2 => Some(PkiStatus::Rejection),
            3 => Some(PkiStatus::Waiting),
            4 => Some(PkiStatus::RevocationWarning),
            5 => Some(PkiStatus::RevocationNotification),
            _ => None,
        }
    }

    pub fn is_granted(self) -> bool {
        matches!(self, PkiStatus::Granted | PkiStatus::GrantedWithMods)
    }
}

impl fmt::Display for PkiStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}


//------------ FailureInfo ---------------------------------------------------

/// The named bits of PKIFailureInfo used by a TSA.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureInfo {
    BadAlg = 0,
    BadRequest = 2,
    BadDataFormat = 5,
    TimeNotAvailable = 14,
    UnacceptedPolicy = 15,
    UnacceptedExtension = 16,
    AddInfoNotAvailable = 17,
    SystemFailure = 25,
}

impl FailureInfo {
    const ALL: [FailureInfo; 8] = [
        FailureInfo::BadAlg,
        FailureInfo::BadRequest,
        FailureInfo::BadDataFormat,
        FailureInfo::TimeNotAvailable,
        FailureInfo::UnacceptedPolicy,
        FailureInfo::UnacceptedExtension,
        FailureInfo::AddInfoNotAvailable,
        FailureInfo::SystemFailure,
    ];

    pub fn bit(self) -> usize {
        self as usize
    }

    /// Finds the first named bit set in a BIT STRING's content octets.
    fn from_bit_string(content: &[u8]) -> Option<Self> {
        let bits = content.get(1..)?;
        Self::ALL.into_iter().find(|info| {
            let bit = info.bit();
            bits.get(bit / 8).is_some_and(|b| b & (0x80 >> (bit % 8)) != 0)
        })
    }
}

impl fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            FailureInfo::BadAlg => "badAlg",
            FailureInfo::BadRequest => "badRequest",
            FailureInfo::BadDataFormat => "badDataFormat",
            FailureInfo::TimeNotAvailable => "timeNotAvailable",
            FailureInfo::UnacceptedPolicy => "unacceptedPolicy",
            FailureInfo::UnacceptedExtension => "unacceptedExtension",
            FailureInfo::AddInfoNotAvailable => "addInfoNotAvailable",
            FailureInfo::SystemFailure => "systemFailure",
        })
    }
}


//------------ TimeStampResp -------------------------------------------------

//  TimeStampResp ::= SEQUENCE  {
//       status                  PKIStatusInfo,
//       timeStampToken          TimeStampToken     OPTIONAL  }
//
//  PKIStatusInfo ::= SEQUENCE {
//      status        PKIStatus,
//      statusString  PKIFreeText     OPTIONAL,
//      failInfo      PKIFailureInfo  OPTIONAL  }
#[derive(Clone, Debug)]
pub struct TimeStampResp {
    pub status: PkiStatus,
    pub status_string: Option<String>,
    pub fail_info: Option<FailureInfo>,

    /// The DER encoded ContentInfo of the token.
    pub token: Option<Bytes>,
}

impl TimeStampResp {
    pub fn granted(token: Bytes, status_string: Option<String>) -> Self {
        TimeStampResp {
            status: PkiStatus::Granted,
            status_string,
            fail_info: None,
            token: Some(token),
        }
    }

    pub fn rejection(
        fail_info: FailureInfo,
        status_string: Option<String>,
    ) -> Self {
        TimeStampResp {
            status: PkiStatus::Rejection,
            status_string,
            fail_info: Some(fail_info),
            token: None,
        }
    }

    pub fn encode_ref(&self) -> impl Values + '_ {
        encode::sequence((
            encode::sequence((
                (self.status as u8).encode(),
                self.status_string.as_ref().map(|s| {
                    encode::sequence(der::utf8_string(s))
                }),
                self.fail_info.map(|info| der::named_bit(info.bit())),
            )),
            self.token.as_ref().map(|token| RawDer::new(token.clone())),
        ))
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(der::to_vec(&self.encode_ref()))
    }

    pub fn decode(data: Bytes) -> Result<Self, CodecError> {
        Ok(Mode::Der.decode(data, |cons| {
            cons.take_sequence(|cons| {
                let (status, status_string, fail_info) = cons.take_sequence(|cons| {
                    let status = cons.take_u8()?;
                    let status = PkiStatus::from_u8(status).ok_or_else(|| {
                        cons.content_err("invalid PKIStatus")
                    })?;
                    let status_string = cons.take_opt_sequence(|cons| {
                        let mut res = String::new();
                        while let Some(s) = cons.take_opt_primitive_if(
                            Tag::UTF8_STRING, |prim| prim.take_all()
                        )? {
                            res.push_str(&String::from_utf8_lossy(&s));
                        }
                        Ok(res)
                    })?;
                    let fail_info = cons.take_opt_primitive_if(
                        Tag::BIT_STRING, |prim| prim.take_all()
                    )?.and_then(|bits| FailureInfo::from_bit_string(&bits));
                    Ok((status, status_string, fail_info))
                })?;
                let token = cons.take_opt_sequence(|cons| cons.capture_all())?;
                let token = token.map(|content| {
                    Bytes::from(der::tlv(0x30, content.as_slice()))
                });
                Ok(TimeStampResp { status, status_string, fail_info, token })
            })
        })?)
    }
}


//------------ Accuracy ------------------------------------------------------

//  Accuracy ::= SEQUENCE {
//        seconds        INTEGER           OPTIONAL,
//        millis     [0] INTEGER  (1..999) OPTIONAL,
//        micros     [1] INTEGER  (1..999) OPTIONAL  }
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Accuracy {
    pub seconds: Option<u32>,
    pub millis: Option<u16>,
    pub micros: Option<u16>,
}

impl Accuracy {
    pub fn is_empty(&self) -> bool {
        self.seconds.is_none() && self.millis.is_none() && self.micros.is_none()
    }

    pub fn encode(self) -> impl Values {
        encode::sequence((
            self.seconds.map(|s| s.encode()),
            self.millis.map(|m| m.encode_as(Tag::CTX_0)),
            self.micros.map(|m| m.encode_as(Tag::CTX_1)),
        ))
    }
}


//------------ TstInfo -------------------------------------------------------

//  TSTInfo ::= SEQUENCE  {
//     version                      INTEGER  { v1(1) },
//     policy                       TSAPolicyId,
//     messageImprint               MessageImprint,
//     serialNumber                 INTEGER,
//     genTime                      GeneralizedTime,
//     accuracy                     Accuracy                 OPTIONAL,
//     ordering                     BOOLEAN             DEFAULT FALSE,
//     nonce                        INTEGER                  OPTIONAL,
//     tsa                          [0] GeneralName          OPTIONAL,
//     extensions                   [1] IMPLICIT Extensions   OPTIONAL  }
#[derive(Clone, Debug)]
pub struct TstInfo {
    pub policy: Oid<Bytes>,
    pub message_imprint: MessageImprint,

    /// The serial number as unsigned big endian bytes.
    pub serial: Vec<u8>,
    pub gen_time: DateTime<Utc>,
    pub accuracy: Option<Accuracy>,
    pub ordering: bool,
    pub nonce: Option<Bytes>,

    /// The DER encoded Name used as the directoryName of the tsa field.
    pub tsa: Option<Bytes>,
}

impl TstInfo {
    pub fn encode_ref(&self) -> impl Values + '_ {
        encode::sequence((
            (
                1u8.encode(),
                self.policy.encode_ref(),
                self.message_imprint.encode_ref(),
                der::unsigned(&self.serial),
                der::generalized_time(self.gen_time),
            ),
            (
                self.accuracy.filter(|acc| !acc.is_empty()).map(Accuracy::encode),
                self.ordering.then(|| true.encode()),
                self.nonce.as_ref().map(|nonce| {
                    OctetString::encode_slice_as(nonce.clone(), Tag::INTEGER)
                }),
                self.tsa.as_ref().map(|name| {
                    encode::sequence_as(Tag::CTX_0,
                        encode::sequence_as(Tag::CTX_4,
                            RawDer::new(name.clone())
                        )
                    )
                }),
            ),
        ))
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(der::to_vec(&self.encode_ref()))
    }
}


//------------ TstInfoSummary ------------------------------------------------

/// The fields of an encoded TSTInfo a client typically looks at.
#[derive(Clone, Debug)]
pub struct TstInfoSummary {
    pub policy: Oid<Bytes>,
    pub message_imprint: MessageImprint,
    pub serial: Bytes,
    pub gen_time: String,
    pub ordering: bool,
    pub nonce: Option<Bytes>,
    pub has_tsa: bool,
}

impl TstInfoSummary {
    pub fn decode(data: Bytes) -> Result<Self, CodecError> {
        Ok(Mode::Der.decode(data, |cons| {
            cons.take_sequence(|cons| {
                cons.skip_u8_if(1)?;
                let policy = Oid::take_from(cons)?;
                let message_imprint = MessageImprint::take_from(cons)?;
                let serial = cons.take_primitive_if(
                    Tag::INTEGER, |prim| prim.take_all()
                )?;
                let gen_time = cons.take_primitive_if(
                    Tag::GENERALIZED_TIME, |prim| prim.take_all()
                )?;
                cons.take_opt_sequence(|cons| cons.skip_all())?;
                let ordering = cons.take_opt_bool()?.unwrap_or(false);
                let nonce = cons.take_opt_primitive_if(
                    Tag::INTEGER, |prim| prim.take_all()
                )?;
                let has_tsa = cons.take_opt_constructed_if(
                    Tag::CTX_0, |cons| cons.skip_all()
                )?.is_some();
                cons.skip_all()?;
                Ok(TstInfoSummary {
                    policy,
                    message_imprint,
                    serial,
                    gen_time: String::from_utf8_lossy(&gen_time).into_owned(),
                    ordering,
                    nonce,
                    has_tsa,
                })
            })
        })?)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::crypto::oid;

    fn sha1_imprint() -> MessageImprint {
        MessageImprint {
            hash_algorithm: oid::owned(oid::SHA1),
            hashed_message: Bytes::from(vec![0u8; 20]),
        }
    }

    #[test]
    fn request_survives_encoding() {
        let mut req = TimeStampReq::new(sha1_imprint());
        req.req_policy = Some(oid::parse("1.2.3.4").unwrap());
        req.nonce = Some(Bytes::from_static(&[0x01, 0x02]));
        req.cert_req = true;
        req.extensions.push(Extension {
            oid: oid::parse("1.2.7.8").unwrap(),
            critical: false,
            value: Bytes::from_static(&[0x05, 0x00]),
        });

        let decoded = TimeStampReq::decode(req.to_bytes()).unwrap();
        assert_eq!(decoded.message_imprint, sha1_imprint());
        assert_eq!(decoded.req_policy, req.req_policy);
        assert_eq!(decoded.nonce, req.nonce);
        assert!(decoded.cert_req);
        assert_eq!(decoded.extensions.len(), 1);
        assert_eq!(decoded.extensions[0].oid, oid::parse("1.2.7.8").unwrap());
    }

    #[test]
    fn garbage_is_not_a_request() {
        assert!(TimeStampReq::decode(Bytes::from_static(b"hello")).is_err());
    }

    #[test]
    fn rejection_carries_failure_info() {
        let resp = TimeStampResp::rejection(
            FailureInfo::UnacceptedPolicy,
            Some("request contains unknown policy.".into())
        );
        let decoded = TimeStampResp::decode(resp.to_bytes()).unwrap();
        assert_eq!(decoded.status, PkiStatus::Rejection);
        assert_eq!(decoded.fail_info, Some(FailureInfo::UnacceptedPolicy));
        assert_eq!(
            decoded.status_string.as_deref(),
            Some("request contains unknown policy.")
        );
        assert!(decoded.token.is_none());
    }

    #[test]
    fn tst_info_fields() {
        let info = TstInfo {
            policy: oid::parse("1.2.3.4").unwrap(),
            message_imprint: sha1_imprint(),
            serial: vec![0xff, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07],
            gen_time: Utc::now(),
            accuracy: Some(Accuracy { seconds: Some(1), ..Default::default() }),
            ordering: true,
            nonce: None,
            tsa: None,
        };
        let summary = TstInfoSummary::decode(info.to_bytes()).unwrap();
        assert_eq!(summary.policy, oid::parse("1.2.3.4").unwrap());
        // Leading zero keeps the serial positive.
        assert_eq!(summary.serial.len(), 9);
        assert_eq!(summary.serial[0], 0);
        assert!(summary.ordering);
        assert!(!summary.has_tsa);
        assert!(summary.gen_time.ends_with('Z'));
    }
}
