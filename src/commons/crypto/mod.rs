//! Cryptographic building blocks: algorithms, certificates, the ASN.1
//! structures of time stamping and CMS, and the crypto tokens.

pub mod algorithm;
pub mod cert;
pub mod cms;
pub mod der;
pub mod oid;
pub mod token;
pub mod tsp;

pub use self::algorithm::{DigestAlgorithm, KeyKind, SignatureAlgorithm};
pub use self::der::CodecError;
pub use self::token::{
    CryptoInstance, CryptoToken, InstanceCache, TokenError, TokenStatus
};
