//! Per-certificate analysis.
//!
//! Every certificate of the presented chain is turned into a
//! [`CertificateReport`]: names, key, validity and expiry status, the four
//! extensions the report cares about, fingerprints and the informational
//! flags (known bad, self-signed). Extension decoding problems only drop the
//! affected field.

use crate::chain::{link_chain, CertificateChain, ChainLink};
use crate::host::{Address, HostSpec};
use crate::registry::{is_known_bad, Registries};
use chrono::{DateTime, Local, TimeDelta, Utc};
use log::{debug, warn};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::Id;
use openssl::x509::{X509NameRef, X509Ref};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use strum_macros::Display;
use x509_parser::extensions::{ExtendedKeyUsage, GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509Certificate};
use x509_parser::x509::X509Name;

/// Roughly one month, the warning window for long-lived certificates.
pub const EXPIRY_WARNING_SECONDS: i64 = 2_629_743;

const SAN_OID: &str = "2.5.29.17";
const SCT_OID: &str = "1.3.6.1.4.1.11129.2.4.2";
const POLICIES_OID: &str = "2.5.29.32";
const EKU_OID: &str = "2.5.29.37";

/// The name the connection was made for, used to highlight leaf SANs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Destination {
    Ip(IpAddr),
    Name(String),
}

impl Destination {
    /// The SNI override when given, otherwise the destination host.
    pub fn for_connection(host: &HostSpec, servername: Option<&str>) -> Self {
        match servername {
            Some(name) => Destination::from_name(name),
            None => match &host.address {
                Address::Ip(ip) => Destination::Ip(*ip),
                Address::Domain(name) => Destination::Name(name.clone()),
            },
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.parse::<IpAddr>() {
            Ok(ip) => Destination::Ip(ip),
            Err(_) => Destination::Name(name.to_string()),
        }
    }
}

/// Expiry classification relative to the certificate's own lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryStatus {
    #[strum(serialize = "Expired!")]
    Expired,
    #[strum(serialize = "Expires soon!")]
    ExpiringSoon,
    #[strum(serialize = "Valid")]
    Valid,
}

/// How close to `not_after` a certificate may get before it is flagged.
///
/// Short-lived certificates get a window proportional to their lifetime so
/// they are not permanently "expiring soon".
pub fn expiry_threshold(lifetime: TimeDelta) -> TimeDelta {
    if lifetime < TimeDelta::days(10) {
        lifetime / 2
    } else if lifetime < TimeDelta::days(90) {
        lifetime / 3
    } else {
        TimeDelta::seconds(EXPIRY_WARNING_SECONDS)
    }
}

pub fn classify_expiry(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ExpiryStatus {
    let threshold = expiry_threshold(not_after - not_before);
    let remaining = not_after - now;
    if remaining < TimeDelta::zero() {
        ExpiryStatus::Expired
    } else if remaining < threshold {
        ExpiryStatus::ExpiringSoon
    } else {
        ExpiryStatus::Valid
    }
}

/// A decoded Subject Alternative Name entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanValue {
    Dns(String),
    Ip(IpAddr),
    /// Email and URI names
    Text(String),
    /// Directory names, registered ids and other rarely used forms
    Other(String),
}

impl fmt::Display for SanValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SanValue::Dns(s) | SanValue::Text(s) | SanValue::Other(s) => f.write_str(s),
            SanValue::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

impl SanValue {
    fn from_general_name(name: &GeneralName) -> SanValue {
        match name {
            GeneralName::DNSName(dns) => SanValue::Dns(dns.to_string()),
            GeneralName::IPAddress(bytes) => match ip_from_bytes(bytes) {
                Some(ip) => SanValue::Ip(ip),
                None => SanValue::Other(format!("IP:{}", hex_lower(bytes))),
            },
            GeneralName::RFC822Name(text) | GeneralName::URI(text) => {
                SanValue::Text(text.to_string())
            }
            GeneralName::DirectoryName(name) => SanValue::Other(name.to_string()),
            GeneralName::RegisteredID(oid) => SanValue::Other(oid.to_id_string()),
            GeneralName::OtherName(oid, _) => {
                SanValue::Other(format!("othername:{}", oid.to_id_string()))
            }
            other => SanValue::Other(format!("{:?}", other)),
        }
    }

    /// Does this SAN cover `destination`?
    ///
    /// Exact equality, or for DNS names a single-label wildcard: `*.b.c`
    /// covers `a.b.c` but neither `b.c` nor a bare `c`.
    pub fn matches(&self, destination: &Destination) -> bool {
        match (self, destination) {
            (SanValue::Ip(ip), Destination::Ip(dest)) => ip == dest,
            (SanValue::Dns(name), Destination::Name(dest)) => {
                name == dest || wildcard_matches(name, dest)
            }
            (SanValue::Text(name), Destination::Name(dest)) => name == dest,
            _ => false,
        }
    }
}

fn wildcard_matches(pattern: &str, name: &str) -> bool {
    let Some(suffix) = pattern.strip_prefix("*.") else {
        return false;
    };
    // A single-label destination has nothing after its first label.
    match name.split_once('.') {
        Some((_, rest)) => rest == suffix,
        None => false,
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// The extensions the analyzer knows about, plus a catch-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertExtension {
    SubjectAltNames(Vec<SanValue>),
    /// Raw 32 byte log ids of the embedded SCTs
    SignedTimestamps(Vec<Vec<u8>>),
    Policies(Vec<String>),
    ExtendedKeyUsage(Vec<String>),
    Other(String),
}

/// Decodes the extensions of a DER certificate.
///
/// An extension that fails to parse is reported as `Other`; a certificate
/// that cannot be parsed at all yields no extensions.
pub fn decode_extensions(der: &[u8]) -> Vec<CertExtension> {
    match X509Certificate::from_der(der) {
        Ok((_, cert)) => extensions_of(&cert),
        Err(e) => {
            warn!("could not decode certificate extensions: {}", e);
            Vec::new()
        }
    }
}

fn extensions_of(cert: &X509Certificate<'_>) -> Vec<CertExtension> {
    cert.extensions()
        .iter()
        .map(|ext| {
            let oid = ext.oid.to_id_string();
            match ext.parsed_extension() {
                ParsedExtension::SubjectAlternativeName(san) => CertExtension::SubjectAltNames(
                    san.general_names
                        .iter()
                        .map(SanValue::from_general_name)
                        .collect(),
                ),
                ParsedExtension::SCT(scts) => CertExtension::SignedTimestamps(
                    scts.iter().map(|sct| sct.id.key_id.to_vec()).collect(),
                ),
                ParsedExtension::CertificatePolicies(policies) => CertExtension::Policies(
                    policies
                        .iter()
                        .map(|policy| policy.policy_id.to_id_string())
                        .collect(),
                ),
                ParsedExtension::ExtendedKeyUsage(eku) => {
                    CertExtension::ExtendedKeyUsage(eku_names(eku))
                }
                ParsedExtension::ParseError { error } => {
                    if [SAN_OID, SCT_OID, POLICIES_OID, EKU_OID].contains(&oid.as_str()) {
                        warn!("skipping malformed extension {}: {}", oid, error);
                    }
                    CertExtension::Other(oid)
                }
                _ => CertExtension::Other(oid),
            }
        })
        .collect()
}

fn eku_names(eku: &ExtendedKeyUsage) -> Vec<String> {
    let flags = [
        (eku.any, "anyExtendedKeyUsage"),
        (eku.server_auth, "serverAuth"),
        (eku.client_auth, "clientAuth"),
        (eku.code_signing, "codeSigning"),
        (eku.email_protection, "emailProtection"),
        (eku.time_stamping, "timeStamping"),
        (eku.ocsp_signing, "OCSPSigning"),
    ];
    flags
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, name)| name.to_string())
        .chain(eku.other.iter().map(|oid| oid.to_id_string()))
        .collect()
}

/// A SAN as shown in the report.
#[derive(Debug, Clone, Serialize)]
pub struct SanEntry {
    pub value: String,
    /// Set on leaf entries covering the connection's destination
    pub matched: bool,
}

/// Everything reported about a single certificate.
///
/// Fields OpenSSL could not read for this certificate are `None` (or empty)
/// rather than failing the whole report.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateReport {
    /// Position in the presented chain, 0 is the leaf
    pub index: usize,
    pub subject: String,
    pub issuer: String,
    /// Decimal serial number
    pub serial: Option<String>,
    pub key: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    /// Needs both validity bounds
    pub expiry: Option<ExpiryStatus>,
    pub sans: Vec<SanEntry>,
    pub sct_logs: Vec<String>,
    pub cert_type: Option<String>,
    pub extended_key_usages: Vec<String>,
    pub signature_hash: Option<String>,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
    pub known_bad: bool,
    pub self_signed: bool,
}

impl CertificateReport {
    pub fn not_before_local(&self) -> Option<String> {
        self.not_before.map(format_local)
    }

    pub fn not_after_local(&self) -> Option<String> {
        self.not_after.map(format_local)
    }
}

/// Inputs shared by every certificate of one run.
pub struct AnalysisContext<'a> {
    pub destination: &'a Destination,
    pub registries: &'a Registries,
    pub now: DateTime<Utc>,
}

/// Analyzes one certificate. Only the leaf (`index == 0`) gets SAN matching.
pub fn analyze_certificate(
    cert: &X509Ref,
    index: usize,
    ctx: &AnalysisContext<'_>,
) -> CertificateReport {
    let der = readable(index, "DER encoding", cert.to_der());
    let parsed = der
        .as_deref()
        .and_then(|der| match X509Certificate::from_der(der) {
            Ok((_, parsed)) => Some(parsed),
            Err(e) => {
                warn!("certificate {}: extensions unavailable: {}", index, e);
                None
            }
        });

    let mut sans = Vec::new();
    let mut sct_logs = Vec::new();
    let mut policy_oids = Vec::new();
    let mut extended_key_usages = Vec::new();
    for extension in parsed.as_ref().map(extensions_of).unwrap_or_default() {
        match extension {
            CertExtension::SubjectAltNames(names) => {
                sans = names
                    .into_iter()
                    .map(|name| SanEntry {
                        matched: index == 0 && name.matches(ctx.destination),
                        value: name.to_string(),
                    })
                    .collect();
            }
            CertExtension::SignedTimestamps(log_ids) => {
                sct_logs = log_ids
                    .iter()
                    .map(|id| ctx.registries.logs.log_name_for_key_id(id).to_string())
                    .collect();
            }
            CertExtension::Policies(oids) => policy_oids = oids,
            CertExtension::ExtendedKeyUsage(names) => extended_key_usages = names,
            CertExtension::Other(oid) => debug!("ignoring extension {}", oid),
        }
    }

    let (subject, issuer) = match &parsed {
        Some(parsed) => (
            rdn_sequence_string(parsed.subject()),
            rdn_sequence_string(parsed.issuer()),
        ),
        None => (
            rfc4514_string(cert.subject_name()),
            rfc4514_string(cert.issuer_name()),
        ),
    };

    let not_before = readable(index, "notBefore", asn1_to_utc(cert.not_before()));
    let not_after = readable(index, "notAfter", asn1_to_utc(cert.not_after()));
    let expiry = match (not_before, not_after) {
        (Some(not_before), Some(not_after)) => {
            Some(classify_expiry(not_before, not_after, ctx.now))
        }
        _ => None,
    };

    let serial = readable(
        index,
        "serial number",
        cert.serial_number()
            .to_bn()
            .and_then(|bn| bn.to_dec_str().map(|dec| dec.to_string())),
    );
    let sha1 = readable(
        index,
        "SHA1 fingerprint",
        cert.digest(MessageDigest::sha1()).map(|d| hex_lower(&d)),
    );
    let sha256 = readable(
        index,
        "SHA256 fingerprint",
        cert.digest(MessageDigest::sha256()).map(|d| hex_lower(&d)),
    );

    CertificateReport {
        index,
        subject,
        issuer,
        serial,
        key: describe_key(cert),
        not_before,
        not_after,
        expiry,
        sans,
        sct_logs,
        cert_type: ctx
            .registries
            .policies
            .first_match(policy_oids.iter().map(String::as_str))
            .map(str::to_string),
        extended_key_usages,
        signature_hash: signature_hash_name(cert),
        sha1,
        known_bad: sha256.as_deref().map(is_known_bad).unwrap_or(false),
        sha256,
        self_signed: is_self_issued(cert),
    }
}

/// Keeps a field value, or logs why it is missing.
fn readable<T, E: fmt::Display>(index: usize, field: &str, value: Result<T, E>) -> Option<T> {
    match value {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("certificate {}: cannot read {}: {}", index, field, e);
            None
        }
    }
}

/// The analysis of a whole presented chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainReport {
    pub certificates: Vec<CertificateReport>,
    /// One verdict per adjacent pair; empty when only the leaf was analyzed
    pub links: Vec<ChainLink>,
}

impl ChainReport {
    pub fn build(
        chain: &CertificateChain,
        ctx: &AnalysisContext<'_>,
        first_only: bool,
    ) -> ChainReport {
        let limit = if first_only { 1 } else { chain.len() };
        let certificates = chain
            .iter()
            .take(limit)
            .enumerate()
            .map(|(index, cert)| analyze_certificate(cert, index, ctx))
            .collect();
        let links = if first_only {
            Vec::new()
        } else {
            link_chain(chain)
        };
        ChainReport {
            certificates,
            links,
        }
    }

    /// The verdict on whether the certificate at `index` issued its predecessor.
    pub fn link_to_previous(&self, index: usize) -> Option<&ChainLink> {
        self.links.iter().find(|link| link.issuer_index == index)
    }
}

/// Key algorithm and size (RSA) or curve (EC).
pub fn describe_key(cert: &X509Ref) -> String {
    let key = match cert.public_key() {
        Ok(key) => key,
        Err(e) => {
            debug!("unreadable public key: {}", e);
            return "Unknown".to_string();
        }
    };
    match key.id() {
        Id::RSA => format!("RSA ({})", key.bits()),
        Id::EC => {
            let curve = key
                .ec_key()
                .ok()
                .and_then(|ec| ec.group().curve_name())
                .and_then(|nid| nid.short_name().ok());
            match curve {
                Some(curve) => format!("ECC ({})", curve),
                None => format!("ECC ({})", key.bits()),
            }
        }
        _ => "Unknown".to_string(),
    }
}

/// Digest part of the signature algorithm, e.g. `sha256`.
pub fn signature_hash_name(cert: &X509Ref) -> Option<String> {
    let algorithms = cert.signature_algorithm().object().nid().signature_algorithms()?;
    if algorithms.digest == Nid::UNDEF {
        return None;
    }
    algorithms
        .digest
        .short_name()
        .ok()
        .map(|name| name.to_ascii_lowercase())
}

/// Structural self-signedness: issuer and subject names are equal.
pub fn is_self_issued(cert: &X509Ref) -> bool {
    cert.issuer_name()
        .try_cmp(cert.subject_name())
        .map(|ordering| ordering == Ordering::Equal)
        .unwrap_or(false)
}

/// Distinguished name in RFC 4514 form (most specific RDN first), with the
/// attributes of a multi-valued RDN joined by `+`.
pub fn rdn_sequence_string(name: &X509Name<'_>) -> String {
    let mut rdns: Vec<String> = name
        .iter()
        .map(|rdn| {
            rdn.iter()
                .map(|attr| {
                    let oid = attr.attr_type().to_id_string();
                    let key = match rdn_key(&oid) {
                        Some(key) => key.to_string(),
                        None => oid,
                    };
                    let value = match attr.as_str() {
                        Ok(value) => value.to_string(),
                        Err(_) => String::from_utf8_lossy(attr.as_slice()).into_owned(),
                    };
                    format!("{}={}", key, escape_rdn_value(&value))
                })
                .collect::<Vec<_>>()
                .join("+")
        })
        .collect();
    rdns.reverse();
    rdns.join(",")
}

fn rdn_key(oid: &str) -> Option<&'static str> {
    let key = match oid {
        "2.5.4.3" => "CN",
        "2.5.4.7" => "L",
        "2.5.4.8" => "ST",
        "2.5.4.10" => "O",
        "2.5.4.11" => "OU",
        "2.5.4.6" => "C",
        "2.5.4.9" => "STREET",
        "0.9.2342.19200300.100.1.25" => "DC",
        "0.9.2342.19200300.100.1.1" => "UID",
        _ => return None,
    };
    Some(key)
}

/// Same as [`rdn_sequence_string`] from OpenSSL's flat entry list, used
/// when the certificate cannot be decoded otherwise. Every entry is treated
/// as its own RDN.
pub fn rfc4514_string(name: &X509NameRef) -> String {
    let mut parts: Vec<String> = name
        .entries()
        .map(|entry| {
            let nid = entry.object().nid();
            let key = match rfc4514_key(nid) {
                Some(key) => key.to_string(),
                None => entry.object().to_string(),
            };
            let value = match entry.data().as_utf8() {
                Ok(value) => value.to_string(),
                Err(_) => String::from_utf8_lossy(entry.data().as_slice()).into_owned(),
            };
            format!("{}={}", key, escape_rdn_value(&value))
        })
        .collect();
    parts.reverse();
    parts.join(",")
}

fn rfc4514_key(nid: Nid) -> Option<&'static str> {
    let key = match nid {
        Nid::COMMONNAME => "CN",
        Nid::LOCALITYNAME => "L",
        Nid::STATEORPROVINCENAME => "ST",
        Nid::ORGANIZATIONNAME => "O",
        Nid::ORGANIZATIONALUNITNAME => "OU",
        Nid::COUNTRYNAME => "C",
        Nid::STREETADDRESS => "STREET",
        Nid::DOMAINCOMPONENT => "DC",
        Nid::USERID => "UID",
        _ => return None,
    };
    Some(key)
}

fn escape_rdn_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        let special = matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';')
            || (i == 0 && (c == '#' || c == ' '))
            || (i == last && c == ' ');
        if special {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn asn1_to_utc(time: &Asn1TimeRef) -> Result<DateTime<Utc>, String> {
    let diff = Asn1Time::from_unix(0)
        .and_then(|epoch| epoch.diff(time))
        .map_err(|e| e.to_string())?;
    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::<Utc>::from_timestamp(seconds, 0).ok_or_else(|| format!("{} is out of range", time))
}

fn format_local(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S %:z")
        .to_string()
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
