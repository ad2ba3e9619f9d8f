//! Destination parsing.
//!
//! Turns the host string given on the command line (bare IP literal,
//! `host:port`, `scheme://host:port`) and the proxy URL into a [`HostSpec`].
//! No network I/O happens here.

use crate::error::InspectionError;
use lazy_static::lazy_static;
use log::debug;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use url::{Host, Url};

/// Port used when the input names none.
pub const DEFAULT_PORT: u16 = 443;

/// Port used for a proxy URL that names none.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Placeholder scheme so that `host:port` inputs go through the same URL
/// splitting as `scheme://host:port` ones. It is not a special scheme, so the
/// url crate never elides or substitutes ports for it.
const NEUTRAL_SCHEME: &str = "certpeek";

/// System services database consulted before the builtin table.
const SERVICES_FILE: &str = "/etc/services";

lazy_static! {
    /// TCP services from [`SERVICES_FILE`]; empty when it cannot be read.
    static ref SYSTEM_SERVICES: HashMap<String, u16> = match fs::read_to_string(SERVICES_FILE) {
        Ok(content) => parse_services(&content),
        Err(e) => {
            debug!("{} unavailable, using builtin service ports: {}", SERVICES_FILE, e);
            HashMap::new()
        }
    };
}

/// Fallback service ports, keyed by URL scheme.
static KNOWN_SERVICES: &[(&str, u16)] = &[
    ("https", 443),
    ("http", 80),
    ("wss", 443),
    ("ws", 80),
    ("smtps", 465),
    ("submissions", 465),
    ("submission", 587),
    ("smtp", 25),
    ("imaps", 993),
    ("imap", 143),
    ("pop3s", 995),
    ("pop3", 110),
    ("ldaps", 636),
    ("ldap", 389),
    ("ftps", 990),
    ("ftp", 21),
    ("ircs", 6697),
    ("irc", 6667),
    ("xmpp-client", 5222),
    ("xmpp-server", 5269),
    ("postgresql", 5432),
    ("mysql", 3306),
    ("rdp", 3389),
];

/// Address half of a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Address {
    /// Literal IPv4 or IPv6 address
    Ip(IpAddr),
    /// ASCII (IDNA-encoded when needed) domain name
    Domain(String),
}

impl Address {
    pub fn is_ip(&self) -> bool {
        matches!(self, Address::Ip(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
            Address::Ip(IpAddr::V4(ip)) => write!(f, "{}", ip),
            Address::Domain(name) => f.write_str(name),
        }
    }
}

/// A parsed destination: address plus port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSpec {
    pub address: Address,
    pub port: u16,
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Failure while splitting an authority, before it is attributed to the
/// host or the proxy input.
#[derive(Debug, PartialEq)]
enum AuthorityError {
    Host(String),
    Port(String),
}

impl HostSpec {
    pub fn new(address: Address, port: u16) -> Self {
        HostSpec { address, port }
    }

    /// Parses a user supplied destination.
    ///
    /// A string that is entirely an IP literal wins first, so IPv6 addresses
    /// are never split on their colons. Everything else is split as a URL;
    /// a recognised scheme supplies the default port.
    ///
    /// # Example
    ///
    /// ```
    /// # use certpeek::host::{Address, HostSpec};
    /// let parsed = HostSpec::parse("[2001:db8::1]:8443")?;
    /// assert!(parsed.address.is_ip());
    /// assert_eq!(parsed.port, 8443);
    /// assert_eq!(parsed.to_string(), "[2001:db8::1]:8443");
    /// # Ok::<(), certpeek::InspectionError>(())
    /// ```
    pub fn parse(input: &str) -> Result<HostSpec, InspectionError> {
        let input = input.trim();
        if let Ok(ip) = input.parse::<IpAddr>() {
            return Ok(HostSpec::new(Address::Ip(ip), DEFAULT_PORT));
        }

        let (scheme, authority) = split_scheme(input);
        let default_port = scheme.and_then(known_service_port).unwrap_or(DEFAULT_PORT);

        let (address, port) = parse_authority(authority).map_err(|e| match e {
            AuthorityError::Host(reason) => InspectionError::InvalidHost {
                input: input.to_string(),
                reason,
            },
            AuthorityError::Port(port) => InspectionError::InvalidPort { port },
        })?;

        let parsed = HostSpec::new(address, port.unwrap_or(default_port));
        debug!("parsed destination '{}' as {}", input, parsed);
        Ok(parsed)
    }

    /// Parses an HTTP proxy URL such as `http://proxy.local:3128`.
    ///
    /// Only the `http` scheme is accepted; the port defaults to 8080.
    pub fn parse_proxy(input: &str) -> Result<HostSpec, InspectionError> {
        let input = input.trim();
        let invalid = |reason: String| InspectionError::InvalidProxy {
            input: input.to_string(),
            reason,
        };

        match split_scheme(input) {
            (Some(scheme), authority) if scheme.eq_ignore_ascii_case("http") => {
                let (address, port) = parse_authority(authority).map_err(|e| match e {
                    AuthorityError::Host(reason) => invalid(reason),
                    AuthorityError::Port(port) => {
                        invalid(format!("Proxy port must be integer: {}", port))
                    }
                })?;
                Ok(HostSpec::new(address, port.unwrap_or(DEFAULT_PROXY_PORT)))
            }
            _ => Err(invalid("Only http proxies are supported".to_string())),
        }
    }
}

/// Port registered for a URL scheme, if any.
///
/// The system services database wins; the builtin table covers hosts
/// without one.
pub fn known_service_port(scheme: &str) -> Option<u16> {
    let scheme = scheme.to_ascii_lowercase();
    SYSTEM_SERVICES.get(&scheme).copied().or_else(|| {
        KNOWN_SERVICES
            .iter()
            .find(|(name, _)| *name == scheme)
            .map(|(_, port)| *port)
    })
}

/// Reads TCP entries out of a services(5) file: `name port/proto aliases...`.
///
/// Names and aliases are lowercased. The first entry for a name wins.
pub fn parse_services(content: &str) -> HashMap<String, u16> {
    let mut services = HashMap::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        let (Some(name), Some(port_proto)) = (fields.next(), fields.next()) else {
            continue;
        };
        let port = match port_proto.split_once('/') {
            Some((port, "tcp")) => port.parse::<u16>().ok(),
            _ => None,
        };
        let Some(port) = port else {
            continue;
        };
        for alias in std::iter::once(name).chain(fields) {
            services.entry(alias.to_ascii_lowercase()).or_insert(port);
        }
    }
    services
}

fn split_scheme(input: &str) -> (Option<&str>, &str) {
    match input.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, input),
    }
}

fn parse_authority(authority: &str) -> Result<(Address, Option<u16>), AuthorityError> {
    let url = Url::parse(&format!("{}://{}", NEUTRAL_SCHEME, authority)).map_err(|e| match e {
        url::ParseError::InvalidPort => AuthorityError::Port(port_text(authority).to_string()),
        url::ParseError::EmptyHost => AuthorityError::Host("no hostname found".to_string()),
        other => AuthorityError::Host(other.to_string()),
    })?;

    let address = match url.host() {
        Some(Host::Ipv4(ip)) => Address::Ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => Address::Ip(IpAddr::V6(ip)),
        Some(Host::Domain(raw)) => domain_address(raw)?,
        None => return Err(AuthorityError::Host("no hostname found".to_string())),
    };
    Ok((address, url.port()))
}

/// Hosts of non-special URLs come back percent-encoded and un-normalised.
fn domain_address(raw: &str) -> Result<Address, AuthorityError> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| AuthorityError::Host(e.to_string()))?;
    if decoded.is_empty() {
        return Err(AuthorityError::Host("no hostname found".to_string()));
    }
    if let Ok(ip) = decoded.parse::<IpAddr>() {
        return Ok(Address::Ip(ip));
    }
    if decoded.is_ascii() {
        return Ok(Address::Domain(decoded.into_owned()));
    }

    match Host::parse(&decoded) {
        Ok(Host::Domain(ascii)) => Ok(Address::Domain(ascii)),
        Ok(Host::Ipv4(ip)) => Ok(Address::Ip(IpAddr::V4(ip))),
        Ok(Host::Ipv6(ip)) => Ok(Address::Ip(IpAddr::V6(ip))),
        Err(e) => Err(AuthorityError::Host(format!("IDNA encoding failed: {}", e))),
    }
}

/// Best effort extraction of the port text, for error messages.
fn port_text(authority: &str) -> &str {
    let end = authority.find(['/', '?', '#']).unwrap_or(authority.len());
    let authority = &authority[..end];
    if authority.ends_with(']') {
        return "";
    }
    authority
        .rsplit_once(':')
        .map(|(_, port)| port)
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn domain(name: &str) -> Address {
        Address::Domain(name.to_string())
    }

    #[test]
    fn test_bare_host_defaults_to_443() {
        let parsed = HostSpec::parse("example.com").unwrap();
        assert_eq!(parsed, HostSpec::new(domain("example.com"), 443));
    }

    #[test]
    fn test_host_with_port() {
        let parsed = HostSpec::parse("example.com:8443").unwrap();
        assert_eq!(parsed, HostSpec::new(domain("example.com"), 8443));
    }

    #[test]
    fn test_bare_ipv6_is_not_split() {
        let parsed = HostSpec::parse("2001:db8::1").unwrap();
        let ip: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert_eq!(parsed, HostSpec::new(Address::Ip(IpAddr::V6(ip)), 443));
    }

    #[test]
    fn test_bracketed_ipv6_with_and_without_port() {
        let ip: Ipv6Addr = "::1".parse().unwrap();
        assert_eq!(
            HostSpec::parse("[::1]:8443").unwrap(),
            HostSpec::new(Address::Ip(IpAddr::V6(ip)), 8443)
        );
        assert_eq!(
            HostSpec::parse("[::1]").unwrap(),
            HostSpec::new(Address::Ip(IpAddr::V6(ip)), 443)
        );
    }

    #[test]
    fn test_ipv4_with_port() {
        let parsed = HostSpec::parse("192.0.2.10:636").unwrap();
        assert_eq!(
            parsed,
            HostSpec::new(Address::Ip(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))), 636)
        );
    }

    #[test]
    fn test_scheme_supplies_default_port() {
        assert_eq!(HostSpec::parse("ldaps://dir.example.com").unwrap().port, 636);
        assert_eq!(HostSpec::parse("https://example.com/path").unwrap().port, 443);
        assert_eq!(HostSpec::parse("imaps://mail.example.com:1993").unwrap().port, 1993);
    }

    #[test]
    fn test_unknown_scheme_falls_back_to_443() {
        assert_eq!(HostSpec::parse("gopher+tls://example.com").unwrap().port, 443);
    }

    #[test]
    fn test_explicit_port_matching_scheme_default_is_kept() {
        let parsed = HostSpec::parse("smtps://mail.example.com:443").unwrap();
        assert_eq!(parsed.port, 443);
    }

    #[test]
    fn test_non_integer_port_is_rejected() {
        match HostSpec::parse("example.com:https") {
            Err(InspectionError::InvalidPort { port }) => assert_eq!(port, "https"),
            other => panic!("Expected InvalidPort, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_port_is_rejected() {
        assert!(matches!(
            HostSpec::parse("example.com:70000"),
            Err(InspectionError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_missing_host_is_rejected() {
        assert!(matches!(
            HostSpec::parse("https://:443"),
            Err(InspectionError::InvalidHost { .. })
        ));
        assert!(matches!(
            HostSpec::parse(""),
            Err(InspectionError::InvalidHost { .. })
        ));
    }

    #[test]
    fn test_non_ascii_host_is_idna_encoded() {
        let parsed = HostSpec::parse("bücher.example:8443").unwrap();
        assert_eq!(parsed, HostSpec::new(domain("xn--bcher-kva.example"), 8443));
    }

    #[test]
    fn test_display_brackets_ipv6() {
        let parsed = HostSpec::parse("::1").unwrap();
        assert_eq!(parsed.address.to_string(), "[::1]");
        assert_eq!(parsed.to_string(), "[::1]:443");
    }

    #[test]
    fn test_proxy_defaults_to_8080() {
        let proxy = HostSpec::parse_proxy("http://proxy.local").unwrap();
        assert_eq!(proxy, HostSpec::new(domain("proxy.local"), 8080));
    }

    #[test]
    fn test_proxy_explicit_port_80_is_kept() {
        let proxy = HostSpec::parse_proxy("http://proxy.local:80/").unwrap();
        assert_eq!(proxy.port, 80);
    }

    #[test]
    fn test_proxy_requires_http_scheme() {
        for input in ["https://proxy.local:3128", "socks5://proxy.local", "proxy.local:3128"] {
            assert!(
                matches!(
                    HostSpec::parse_proxy(input),
                    Err(InspectionError::InvalidProxy { .. })
                ),
                "{} should be rejected",
                input
            );
        }
    }

    #[test]
    fn test_proxy_bad_port() {
        match HostSpec::parse_proxy("http://proxy.local:abc") {
            Err(InspectionError::InvalidProxy { reason, .. }) => {
                assert_eq!(reason, "Proxy port must be integer: abc")
            }
            other => panic!("Expected InvalidProxy, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_services_keeps_tcp_entries_and_aliases() {
        let content = "\
# Network services, Internet style
gopher\t\t70/tcp
gopher\t\t70/udp
imaps\t\t993/tcp\t\timap4s  # IMAP over TLS
nntps\t\t563/tcp\t\tsnntp
nntps\t\t9999/tcp
sane-port\t6566/tcp\t\tsane saned
kerberos\t88/udp
broken\t\tabc/tcp
";
        let services = parse_services(content);
        assert_eq!(services.get("gopher"), Some(&70));
        assert_eq!(services.get("imap4s"), Some(&993));
        assert_eq!(services.get("snntp"), Some(&563));
        assert_eq!(services.get("nntps"), Some(&563));
        assert_eq!(services.get("saned"), Some(&6566));
        assert_eq!(services.get("kerberos"), None);
        assert_eq!(services.get("broken"), None);
    }

    #[test]
    fn test_known_service_port_is_case_insensitive() {
        assert_eq!(known_service_port("HTTPS"), Some(443));
        assert_eq!(known_service_port("nosuchservice"), None);
    }
}
