//! Error types for certificate inspection.
//!
//! This module defines the errors that can stop an inspection run before a
//! report is produced. Findings about the certificates themselves (expired,
//! self-signed, broken chain order) are not errors; they live in the report.

use std::io;
use thiserror::Error;

/// Error type for inspection failures.
///
/// Every variant maps to a distinct process exit status through
/// [`InspectionError::exit_code`].
#[derive(Debug, Error)]
pub enum InspectionError {
    /// The host string could not be turned into a destination
    #[error("Invalid host '{input}': {reason}")]
    InvalidHost {
        /// The raw input
        input: String,
        /// Why it was rejected
        reason: String,
    },

    /// A port was present but is not a valid 16-bit integer
    #[error("Port must be integer: {port}")]
    InvalidPort {
        /// The offending port text
        port: String,
    },

    /// The proxy URL is malformed, uses an unsupported scheme or has a bad port
    #[error("Invalid proxy '{input}': {reason}")]
    InvalidProxy {
        /// The raw proxy URL
        input: String,
        /// Why it was rejected
        reason: String,
    },

    /// TCP connection failed, either to the proxy or to the target
    #[error("Unable to connect to {address}: {source}")]
    ConnectionFailed {
        /// The address (host:port) that connection failed to
        address: String,
        /// Whether the failing peer was the proxy
        through_proxy: bool,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The proxy answered the CONNECT request with something other than 200
    #[error("Proxy refused the tunnel (status {status}):\n{response}")]
    ProxyRefusal {
        /// Status code sent by the proxy
        status: u16,
        /// The raw response, for diagnostics
        response: String,
    },

    /// The proxy response could not be decoded
    #[error("Malformed proxy response: {reason}")]
    ProxyProtocol {
        /// Description of what went wrong
        reason: String,
    },

    /// The server did not present any certificate
    #[error("Could not retrieve a certificate chain from the specified host: {details}")]
    NoCertificateChain {
        /// The handshake error, or a generic message
        details: String,
    },

    /// OpenSSL error occurred outside of the handshake itself
    #[error("OpenSSL error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl InspectionError {
    /// Process exit status for this error.
    ///
    /// The first five codes are the historical contract of the tool and must
    /// stay stable: 1 no chain, 2 proxy unreachable, 3 proxy refusal,
    /// 4 target unreachable, 5 malformed proxy response.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoCertificateChain { .. } => 1,
            Self::ConnectionFailed {
                through_proxy: true,
                ..
            } => 2,
            Self::ProxyRefusal { .. } => 3,
            Self::ConnectionFailed {
                through_proxy: false,
                ..
            } => 4,
            Self::ProxyProtocol { .. } => 5,
            Self::InvalidHost { .. } | Self::InvalidPort { .. } | Self::InvalidProxy { .. } => 64,
            Self::Tls(_) => 70,
            Self::Io(_) => 74,
        }
    }
}
