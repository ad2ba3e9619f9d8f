//! TLS handshake and certificate harvesting.
//!
//! The handshake is allowed to fail: a server that insists on a client
//! certificate still sends its own chain before rejecting us, and that chain
//! is all this tool needs. Only an empty chain is fatal.

use crate::chain::CertificateChain;
use crate::error::InspectionError;
use crate::host::{Address, HostSpec};
use log::{debug, info, warn};
use openssl::ssl::{HandshakeError, Ssl, SslContext, SslMethod, SslRef, SslVerifyMode};
use openssl::x509::X509;
use std::io::{Read, Write};

/// Picks the SNI name to send, if any.
///
/// Suppression wins, then an explicit override (sent verbatim, even if it is
/// an IP literal), then the destination when it is a domain name. IP
/// destinations never get SNI on their own.
pub fn server_name_indication(
    host: &HostSpec,
    servername: Option<&str>,
    no_servername: bool,
) -> Option<String> {
    if no_servername {
        return None;
    }
    if let Some(name) = servername {
        return Some(name.to_string());
    }
    match &host.address {
        Address::Domain(name) => Some(name.clone()),
        Address::Ip(_) => None,
    }
}

/// How the handshake ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Complete,
    Failed(String),
}

/// What a handshake attempt left behind.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub state: HandshakeState,
    /// Peer certificates, leaf first; possibly non-empty even on failure
    pub certificates: Vec<X509>,
}

impl HandshakeOutcome {
    pub fn error(&self) -> Option<&str> {
        match &self.state {
            HandshakeState::Complete => None,
            HandshakeState::Failed(details) => Some(details),
        }
    }

    /// Keeps the chain whatever the handshake state; fails only when there
    /// is no certificate at all.
    pub fn into_chain(self) -> Result<CertificateChain, InspectionError> {
        if self.certificates.is_empty() {
            let details = match self.state {
                HandshakeState::Failed(details) => details,
                HandshakeState::Complete => "no certificate chain presented".to_string(),
            };
            return Err(InspectionError::NoCertificateChain { details });
        }
        if let HandshakeState::Failed(details) = &self.state {
            warn!(
                "handshake failed but {} certificate(s) were received: {}",
                self.certificates.len(),
                details
            );
        }
        Ok(CertificateChain::new(self.certificates))
    }
}

/// Runs a TLS client handshake over `stream` and collects the peer chain.
///
/// No certificate verification is done here. On success the session is shut
/// down straight away; nothing is exchanged at the application layer.
pub fn perform_handshake<S: Read + Write>(
    stream: S,
    sni: Option<&str>,
) -> Result<HandshakeOutcome, InspectionError> {
    let mut context = SslContext::builder(SslMethod::tls_client())?;
    context.set_verify(SslVerifyMode::NONE);
    let context = context.build();

    let mut ssl = Ssl::new(&context)?;
    match sni {
        Some(name) => {
            info!("Sending SNI '{}'", name);
            ssl.set_hostname(name)?;
        }
        None => info!("Not sending SNI"),
    }

    let outcome = match ssl.connect(stream) {
        Ok(mut stream) => {
            let certificates = peer_certificates(stream.ssl());
            if let Err(e) = stream.shutdown() {
                debug!("TLS shutdown failed: {}", e);
            }
            HandshakeOutcome {
                state: HandshakeState::Complete,
                certificates,
            }
        }
        Err(HandshakeError::Failure(mid)) | Err(HandshakeError::WouldBlock(mid)) => {
            let details = mid.error().to_string();
            debug!("handshake failed: {}", details);
            HandshakeOutcome {
                certificates: peer_certificates(mid.ssl()),
                state: HandshakeState::Failed(details),
            }
        }
        // Nothing was sent yet, so there is no chain to salvage
        Err(HandshakeError::SetupFailure(e)) => return Err(InspectionError::Tls(e)),
    };
    Ok(outcome)
}

/// Peer chain as sent, falling back to the lone peer certificate.
fn peer_certificates(ssl: &SslRef) -> Vec<X509> {
    let chain: Vec<X509> = ssl
        .peer_cert_chain()
        .map(|stack| stack.iter().map(|cert| cert.to_owned()).collect())
        .unwrap_or_default();
    if !chain.is_empty() {
        return chain;
    }
    ssl.peer_certificate().into_iter().collect()
}
