//! # certpeek
//!
//! Peeks at the TLS certificate chain a host presents and reports on every
//! certificate in it: names, key, validity window and expiry status, SANs
//! (highlighting the ones covering the destination), embedded SCT logs,
//! certificate type, extended key usages, fingerprints, and whether each
//! certificate actually issued the one before it.
//!
//! This is an inspection tool, not a validator: there is no path building
//! to a trust store and no revocation checking. A failed handshake is fine as
//! long as the server sent its certificates.
//!
//! ```no_run
//! use certpeek::{InspectOptions, Inspection, Registries};
//!
//! let inspection = Inspection::from("example.com", &InspectOptions::default(), &Registries::default())?;
//! for cert in &inspection.report.certificates {
//!     if let Some(not_after) = cert.not_after_local() {
//!         println!("{} expires {}", cert.subject, not_after);
//!     }
//! }
//! # Ok::<(), certpeek::InspectionError>(())
//! ```

pub mod analyzer;
pub mod chain;
pub mod config;
pub mod error;
pub mod handshake;
pub mod host;
pub mod registry;
pub mod report;
pub mod transport;

pub use analyzer::{
    AnalysisContext, CertificateReport, ChainReport, Destination, ExpiryStatus, SanEntry,
};
pub use chain::{CertificateChain, ChainLink, LinkVerdict};
pub use error::InspectionError;
pub use host::{Address, HostSpec};
pub use registry::{KnownLogRegistry, KnownPolicyRegistry, Registries};

use chrono::Utc;
use std::time::Duration;

/// Knobs for a single inspection run.
#[derive(Debug, Clone, Default)]
pub struct InspectOptions {
    /// `http://` proxy to tunnel through
    pub proxy: Option<String>,
    /// SNI name to send instead of the destination
    pub servername: Option<String>,
    /// Send no SNI at all
    pub no_servername: bool,
    /// Only analyze the leaf certificate
    pub first_only: bool,
    /// Bound for TCP connect, reads and writes; OS defaults when unset
    pub timeout: Option<Duration>,
}

/// The result of inspecting one host.
#[derive(Debug)]
pub struct Inspection {
    pub host: HostSpec,
    pub chain: CertificateChain,
    /// Handshake error tolerated because certificates were still received
    pub handshake_error: Option<String>,
    pub report: ChainReport,
}

impl Inspection {
    /// Connects to `target`, harvests its chain and analyzes it.
    pub fn from(
        target: &str,
        options: &InspectOptions,
        registries: &Registries,
    ) -> Result<Inspection, InspectionError> {
        let host = HostSpec::parse(target)?;
        let stream = match &options.proxy {
            Some(proxy) => {
                let proxy = HostSpec::parse_proxy(proxy)?;
                transport::connect_via_proxy(&proxy, &host, options.timeout)?
            }
            None => transport::connect_direct(&host, options.timeout)?,
        };

        let sni = handshake::server_name_indication(
            &host,
            options.servername.as_deref(),
            options.no_servername,
        );
        let outcome = handshake::perform_handshake(stream, sni.as_deref())?;
        let handshake_error = outcome.error().map(str::to_string);
        let chain = outcome.into_chain()?;

        let destination = Destination::for_connection(&host, options.servername.as_deref());
        let context = AnalysisContext {
            destination: &destination,
            registries,
            now: Utc::now(),
        };
        let report = ChainReport::build(&chain, &context, options.first_only);

        Ok(Inspection {
            host,
            chain,
            handshake_error,
            report,
        })
    }
}
