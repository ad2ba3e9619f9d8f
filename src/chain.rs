//! The presented certificate chain and issuance linkage between its members.

use log::debug;
use openssl::x509::{X509Ref, X509VerifyResult, X509};
use serde::Serialize;
use std::fmt;

/// `X509_V_ERR_SUBJECT_ISSUER_MISMATCH`
const SUBJECT_ISSUER_MISMATCH: i32 = 29;

/// Certificates in the order the server sent them, leaf first.
///
/// The order is never changed; [`link_chain`] reports where it is wrong.
#[derive(Debug, Clone)]
pub struct CertificateChain {
    certificates: Vec<X509>,
}

impl CertificateChain {
    pub fn new(certificates: Vec<X509>) -> Self {
        CertificateChain { certificates }
    }

    /// The certificate matching the connection's identity.
    pub fn leaf(&self) -> Option<&X509Ref> {
        self.certificates.first().map(|c| c.as_ref())
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &X509Ref> {
        self.certificates.iter().map(|c| c.as_ref())
    }

    pub fn certificates(&self) -> &[X509] {
        &self.certificates
    }
}

/// Outcome of checking that one certificate issued the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "details", rename_all = "snake_case")]
pub enum LinkVerdict {
    /// Names line up and the signature verifies
    Issued,
    /// Issuer name of the subject does not match the next certificate
    NameMismatch(String),
    /// Names match but the next certificate may not issue this one (key
    /// usage without keyCertSign, key identifier mismatch)
    NotIssuer(String),
    /// Names match but the signature does not verify with the next key
    SignatureMismatch,
    /// Verification could not be carried out (bad key, unsupported algorithm)
    Unverifiable(String),
}

impl fmt::Display for LinkVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkVerdict::Issued => f.write_str("issued by next certificate"),
            LinkVerdict::NameMismatch(reason) => write!(f, "issuer name mismatch ({})", reason),
            LinkVerdict::NotIssuer(reason) => write!(f, "not a valid issuer ({})", reason),
            LinkVerdict::SignatureMismatch => f.write_str("signature does not verify"),
            LinkVerdict::Unverifiable(reason) => write!(f, "could not verify ({})", reason),
        }
    }
}

impl LinkVerdict {
    pub fn is_issued(&self) -> bool {
        matches!(self, LinkVerdict::Issued)
    }
}

/// Verdict for one adjacent pair in the presented chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainLink {
    /// Index of the certificate whose issuance is checked
    pub subject_index: usize,
    /// Index of the certificate expected to be its issuer
    pub issuer_index: usize,
    pub verdict: LinkVerdict,
}

/// Checks every adjacent pair, leaf toward root.
///
/// A chain of `n` certificates yields `n - 1` links. Failures are findings,
/// never errors.
pub fn link_chain(chain: &CertificateChain) -> Vec<ChainLink> {
    chain
        .certificates()
        .windows(2)
        .enumerate()
        .map(|(index, pair)| ChainLink {
            subject_index: index,
            issuer_index: index + 1,
            verdict: verify_issued(&pair[0], &pair[1]),
        })
        .collect()
}

/// Was `subject` directly issued by `issuer`?
pub fn verify_issued(subject: &X509Ref, issuer: &X509Ref) -> LinkVerdict {
    match issuer.issued(subject) {
        X509VerifyResult::OK => {}
        names if names.as_raw() == SUBJECT_ISSUER_MISMATCH => {
            return LinkVerdict::NameMismatch(names.error_string().to_string());
        }
        other => return LinkVerdict::NotIssuer(other.error_string().to_string()),
    }

    let key = match issuer.public_key() {
        Ok(key) => key,
        Err(e) => return LinkVerdict::Unverifiable(e.to_string()),
    };
    match subject.verify(&key) {
        Ok(true) => LinkVerdict::Issued,
        Ok(false) => LinkVerdict::SignatureMismatch,
        Err(e) => {
            debug!("signature verification error: {}", e);
            LinkVerdict::Unverifiable(e.to_string())
        }
    }
}
