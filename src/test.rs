//! Helper functions for testing the signing server.
//!
//! These are public so that the integration tests can use them as well.

use chrono::{Duration, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::ExtendedKeyUsage;
use openssl::x509::{X509, X509Name, X509NameBuilder, X509Ref};
use tempfile::TempDir;


/// Creates a temporary directory that is removed when dropped.
pub fn tmp_dir() -> TempDir {
    tempfile::tempdir().unwrap()
}

/// Sets up logging to stderr for a test.
///
/// Can be called multiple times, only the first call has an effect.
#[cfg(test)]
pub fn init_logging() {
    let _ = stderrlog::new().verbosity(log::Level::Debug).init();
}

/// Returns a self-signed RSA key and certificate fit for time stamping.
///
/// The certificate carries a critical extended key usage with only the
/// timeStamping purpose.
pub fn tsa_key_and_cert(dn: &str) -> (PKey<Private>, X509) {
    TestCert::new(dn).time_stamping().build()
}

/// Returns a self-signed RSA key and certificate without extensions.
pub fn plain_key_and_cert(dn: &str) -> (PKey<Private>, X509) {
    TestCert::new(dn).build()
}


//------------ TestCert ------------------------------------------------------

/// Builds test keys and certificates.
pub struct TestCert<'a> {
    dn: String,
    ec: bool,
    eku: Option<Eku>,
    not_before: i64,
    not_after: i64,
    serial: Option<u32>,
    issuer: Option<(&'a PKeyRef<Private>, &'a X509Ref)>,
}

enum Eku {
    TimeStamping,
    TimeStampingNonCritical,
    TimeStampingAndClientAuth,
    ClientAuth,
}

impl<'a> TestCert<'a> {
    pub fn new(dn: &str) -> Self {
        TestCert {
            dn: dn.to_string(),
            ec: false,
            eku: None,
            not_before: -1,
            not_after: 365,
            serial: None,
            issuer: None,
        }
    }

    /// Uses a P-256 key instead of RSA.
    pub fn ec(mut self) -> Self {
        self.ec = true;
        self
    }

    pub fn time_stamping(mut self) -> Self {
        self.eku = Some(Eku::TimeStamping);
        self
    }

    pub fn time_stamping_not_critical(mut self) -> Self {
        self.eku = Some(Eku::TimeStampingNonCritical);
        self
    }

    pub fn time_stamping_and_client_auth(mut self) -> Self {
        self.eku = Some(Eku::TimeStampingAndClientAuth);
        self
    }

    pub fn client_auth(mut self) -> Self {
        self.eku = Some(Eku::ClientAuth);
        self
    }

    /// Sets the validity relative to now in days.
    pub fn validity(mut self, not_before: i64, not_after: i64) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    pub fn serial(mut self, serial: u32) -> Self {
        self.serial = Some(serial);
        self
    }

    /// Has the certificate issued by the given CA instead of self-signed.
    pub fn issued_by(
        mut self, key: &'a PKeyRef<Private>, cert: &'a X509Ref
    ) -> Self {
        self.issuer = Some((key, cert));
        self
    }

    pub fn build(self) -> (PKey<Private>, X509) {
        let key = if self.ec {
            let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
            PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
        }
        else {
            PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
        };
        let name = name(&self.dn);

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let serial = match self.serial {
            Some(serial) => BigNum::from_u32(serial).unwrap(),
            None => {
                let mut serial = BigNum::new().unwrap();
                serial.rand(63, MsbOption::MAYBE_ZERO, false).unwrap();
                serial
            }
        };
        builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
        builder.set_subject_name(&name).unwrap();
        match self.issuer {
            Some((_, cert)) => {
                builder.set_issuer_name(cert.subject_name()).unwrap()
            }
            None => builder.set_issuer_name(&name).unwrap(),
        }
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(&time(self.not_before)).unwrap();
        builder.set_not_after(&time(self.not_after)).unwrap();

        if let Some(eku) = self.eku {
            let mut ext = ExtendedKeyUsage::new();
            match eku {
                Eku::TimeStamping => {
                    ext.critical().time_stamping();
                }
                Eku::TimeStampingNonCritical => {
                    ext.time_stamping();
                }
                Eku::TimeStampingAndClientAuth => {
                    ext.critical().time_stamping().client_auth();
                }
                Eku::ClientAuth => {
                    ext.client_auth();
                }
            }
            builder.append_extension(ext.build().unwrap()).unwrap();
        }

        let signing_key = match self.issuer {
            Some((ca_key, _)) => ca_key,
            None => &*key,
        };
        builder.sign(signing_key, MessageDigest::sha256()).unwrap();
        (key, builder.build())
    }
}

/// Builds a name from its string form, most specific RDN first.
fn name(dn: &str) -> X509Name {
    let mut builder = X509NameBuilder::new().unwrap();
    for rdn in dn.split(',').rev() {
        let (key, value) = rdn.split_once('=').unwrap();
        builder.append_entry_by_text(key.trim(), value.trim()).unwrap();
    }
    builder.build()
}

fn time(days: i64) -> Asn1Time {
    let when = Utc::now() + Duration::days(days);
    Asn1Time::from_unix(when.timestamp()).unwrap()
}
