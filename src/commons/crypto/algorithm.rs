//! Digest and signature algorithms.

use std::{error, fmt};
use std::str::FromStr;
use bcder::{ConstOid, Oid};
use openssl::hash::{self, MessageDigest};
use serde::{Deserialize, Serialize};
use super::oid;


//------------ DigestAlgorithm -----------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum DigestAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub const ALL: [DigestAlgorithm; 5] = [
        DigestAlgorithm::Sha1,
        DigestAlgorithm::Sha224,
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Sha384,
        DigestAlgorithm::Sha512,
    ];

    pub fn oid(self) -> ConstOid {
        match self {
            DigestAlgorithm::Sha1 => oid::SHA1,
            DigestAlgorithm::Sha224 => oid::SHA224,
            DigestAlgorithm::Sha256 => oid::SHA256,
            DigestAlgorithm::Sha384 => oid::SHA384,
            DigestAlgorithm::Sha512 => oid::SHA512,
        }
    }

    /// Looks up the algorithm for an object identifier.
    pub fn from_oid(oid: &Oid<impl AsRef<[u8]>>) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.oid() == *oid)
    }

    /// The length of a digest in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha224 => 28,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    pub fn message_digest(self) -> MessageDigest {
        match self {
            DigestAlgorithm::Sha1 => MessageDigest::sha1(),
            DigestAlgorithm::Sha224 => MessageDigest::sha224(),
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
            DigestAlgorithm::Sha384 => MessageDigest::sha384(),
            DigestAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }

    pub fn digest(self, data: &[u8]) -> Result<Vec<u8>, openssl::error::ErrorStack> {
        hash::hash(self.message_digest(), data).map(|d| d.to_vec())
    }

    /// The XML-DSig digest method URI.
    pub fn xml_uri(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            DigestAlgorithm::Sha224 => {
                "http://www.w3.org/2001/04/xmldsig-more#sha224"
            }
            DigestAlgorithm::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            DigestAlgorithm::Sha384 => {
                "http://www.w3.org/2001/04/xmldsig-more#sha384"
            }
            DigestAlgorithm::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = UnknownAlgorithm;

    /// Accepts both “SHA256” and “SHA-256”, ignoring case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "");
        match normalized.as_str() {
            "SHA1" => Ok(DigestAlgorithm::Sha1),
            "SHA224" => Ok(DigestAlgorithm::Sha224),
            "SHA256" => Ok(DigestAlgorithm::Sha256),
            "SHA384" => Ok(DigestAlgorithm::Sha384),
            "SHA512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(UnknownAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            DigestAlgorithm::Sha1 => "SHA1",
            DigestAlgorithm::Sha224 => "SHA224",
            DigestAlgorithm::Sha256 => "SHA256",
            DigestAlgorithm::Sha384 => "SHA384",
            DigestAlgorithm::Sha512 => "SHA512",
        })
    }
}


//------------ KeyKind -------------------------------------------------------

/// The kind of asymmetric key an algorithm works with.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum KeyKind {
    Rsa,
    Ec,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            KeyKind::Rsa => "RSA",
            KeyKind::Ec => "ECDSA",
        })
    }
}


//------------ SignatureAlgorithm --------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct SignatureAlgorithm {
    digest: DigestAlgorithm,
    key: KeyKind,
}

impl SignatureAlgorithm {
    pub const SHA256_WITH_RSA: SignatureAlgorithm = SignatureAlgorithm {
        digest: DigestAlgorithm::Sha256,
        key: KeyKind::Rsa,
    };

    pub fn new(digest: DigestAlgorithm, key: KeyKind) -> Self {
        SignatureAlgorithm { digest, key }
    }

    pub fn digest(self) -> DigestAlgorithm {
        self.digest
    }

    pub fn key_kind(self) -> KeyKind {
        self.key
    }

    pub fn oid(self) -> ConstOid {
        match (self.key, self.digest) {
            (KeyKind::Rsa, DigestAlgorithm::Sha1) => oid::SHA1_WITH_RSA,
            (KeyKind::Rsa, DigestAlgorithm::Sha224) => oid::SHA224_WITH_RSA,
            (KeyKind::Rsa, DigestAlgorithm::Sha256) => oid::SHA256_WITH_RSA,
            (KeyKind::Rsa, DigestAlgorithm::Sha384) => oid::SHA384_WITH_RSA,
            (KeyKind::Rsa, DigestAlgorithm::Sha512) => oid::SHA512_WITH_RSA,
            (KeyKind::Ec, DigestAlgorithm::Sha1) => oid::ECDSA_WITH_SHA1,
            (KeyKind::Ec, DigestAlgorithm::Sha224) => oid::ECDSA_WITH_SHA224,
            (KeyKind::Ec, DigestAlgorithm::Sha256) => oid::ECDSA_WITH_SHA256,
            (KeyKind::Ec, DigestAlgorithm::Sha384) => oid::ECDSA_WITH_SHA384,
            (KeyKind::Ec, DigestAlgorithm::Sha512) => oid::ECDSA_WITH_SHA512,
        }
    }

    /// Whether the algorithm identifier carries an explicit NULL parameter.
    pub fn has_null_params(self) -> bool {
        self.key == KeyKind::Rsa
    }

    /// The XML-DSig signature method URI.
    pub fn xml_uri(self) -> &'static str {
        match (self.key, self.digest) {
            (KeyKind::Rsa, DigestAlgorithm::Sha1) => {
                "http://www.w3.org/2000/09/xmldsig#rsa-sha1"
            }
            (KeyKind::Rsa, DigestAlgorithm::Sha224) => {
                "http://www.w3.org/2001/04/xmldsig-more#rsa-sha224"
            }
            (KeyKind::Rsa, DigestAlgorithm::Sha256) => {
                "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"
            }
            (KeyKind::Rsa, DigestAlgorithm::Sha384) => {
                "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384"
            }
            (KeyKind::Rsa, DigestAlgorithm::Sha512) => {
                "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512"
            }
            (KeyKind::Ec, DigestAlgorithm::Sha1) => {
                "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha1"
            }
            (KeyKind::Ec, DigestAlgorithm::Sha224) => {
                "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha224"
            }
            (KeyKind::Ec, DigestAlgorithm::Sha256) => {
                "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256"
            }
            (KeyKind::Ec, DigestAlgorithm::Sha384) => {
                "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha384"
            }
            (KeyKind::Ec, DigestAlgorithm::Sha512) => {
                "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha512"
            }
        }
    }
}

impl Default for SignatureAlgorithm {
    fn default() -> Self {
        Self::SHA256_WITH_RSA
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = UnknownAlgorithm;

    /// Parses names like “SHA256withRSA” or “SHA384withECDSA”.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let (digest, key) = upper
            .split_once("WITH")
            .ok_or_else(|| UnknownAlgorithm(s.to_string()))?;

        let digest = DigestAlgorithm::from_str(digest)
            .map_err(|_| UnknownAlgorithm(s.to_string()))?;
        let key = match key {
            "RSA" => KeyKind::Rsa,
            "ECDSA" => KeyKind::Ec,
            _ => return Err(UnknownAlgorithm(s.to_string())),
        };
        Ok(SignatureAlgorithm { digest, key })
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}with{}", self.digest, self.key)
    }
}


//------------ UnknownAlgorithm ----------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnknownAlgorithm(String);

impl fmt::Display for UnknownAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown algorithm: {}", self.0)
    }
}

impl error::Error for UnknownAlgorithm {}


//------------ Tests ---------------------------------------------------------
