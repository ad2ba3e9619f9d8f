//! Raw TCP transport to the inspected host.
//!
//! Either a direct connection, or a tunnel opened through an HTTP proxy with
//! a `CONNECT` request. Once the tunnel is up the stream is indistinguishable
//! from a direct one.

use crate::error::InspectionError;
use crate::host::{Address, HostSpec};
use log::{debug, info};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Upper bound for the proxy's reply to the CONNECT request.
pub const PROXY_RESPONSE_LIMIT: usize = 1024;

const MAX_PROXY_HEADERS: usize = 32;

/// Opens a TCP connection straight to `host`.
pub fn connect_direct(
    host: &HostSpec,
    timeout: Option<Duration>,
) -> Result<TcpStream, InspectionError> {
    info!("Connecting directly to host '{}'", host.address);
    open_tcp(host, timeout).map_err(|source| InspectionError::ConnectionFailed {
        address: host.to_string(),
        through_proxy: false,
        source,
    })
}

/// Opens a TCP connection to `proxy` and asks it to tunnel to `target`.
pub fn connect_via_proxy(
    proxy: &HostSpec,
    target: &HostSpec,
    timeout: Option<Duration>,
) -> Result<TcpStream, InspectionError> {
    info!("Connecting via proxy '{}'", proxy);
    let mut stream =
        open_tcp(proxy, timeout).map_err(|source| InspectionError::ConnectionFailed {
            address: proxy.to_string(),
            through_proxy: true,
            source,
        })?;
    establish_tunnel(&mut stream, target)?;
    Ok(stream)
}

/// Sends the CONNECT request for `target` over `stream` and checks the reply.
///
/// At most [`PROXY_RESPONSE_LIMIT`] bytes are read; reading stops as soon as
/// the header block is complete so no tunneled bytes are consumed.
pub fn establish_tunnel<S: Read + Write>(
    stream: &mut S,
    target: &HostSpec,
) -> Result<(), InspectionError> {
    let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target);
    stream
        .write_all(request.as_bytes())
        .and_then(|_| stream.flush())
        .map_err(|e| proxy_io_error("sending CONNECT request", e))?;

    let mut buf = [0u8; PROXY_RESPONSE_LIMIT];
    let mut filled = 0;
    loop {
        let read = match stream.read(&mut buf[filled..]) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(proxy_io_error("reading proxy response", e)),
        };
        filled += read;
        let reply = ProxyReply::parse(&buf[..filled])?;
        let exhausted = read == 0 || filled == buf.len();
        if !reply.complete && !exhausted {
            continue;
        }

        let raw = String::from_utf8_lossy(&buf[..filled]).into_owned();
        return match reply.status {
            Some(200) => {
                debug!("proxy accepted tunnel to {}", target);
                Ok(())
            }
            Some(status) => Err(InspectionError::ProxyRefusal {
                status,
                response: raw,
            }),
            None if filled == 0 => Err(InspectionError::ProxyProtocol {
                reason: "proxy closed the connection without a response".to_string(),
            }),
            None => Err(InspectionError::ProxyProtocol {
                reason: format!("no status line in response: {:?}", raw),
            }),
        };
    }
}

/// The proxy is reachable, so a broken exchange is a protocol failure.
fn proxy_io_error(stage: &str, e: io::Error) -> InspectionError {
    debug!("{} failed: {}", stage, e);
    InspectionError::ProxyProtocol {
        reason: format!("{}: {}", stage, e),
    }
}

/// What could be read out of a (possibly partial) CONNECT reply.
#[derive(Debug, PartialEq)]
struct ProxyReply {
    status: Option<u16>,
    complete: bool,
}

impl ProxyReply {
    fn parse(raw: &[u8]) -> Result<ProxyReply, InspectionError> {
        if let Err(e) = std::str::from_utf8(raw) {
            // A multi-byte character cut by the read boundary is not an error yet.
            if e.error_len().is_some() {
                return Err(InspectionError::ProxyProtocol {
                    reason: format!("response is not valid text: {}", e),
                });
            }
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_PROXY_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(raw) {
            Ok(httparse::Status::Complete(_)) => Ok(ProxyReply {
                status: response.code,
                complete: true,
            }),
            Ok(httparse::Status::Partial) => Ok(ProxyReply {
                status: response.code,
                complete: false,
            }),
            // Only the status line matters; a long header block is tolerated.
            Err(httparse::Error::TooManyHeaders) if response.code.is_some() => Ok(ProxyReply {
                status: response.code,
                complete: true,
            }),
            Err(e) => Err(InspectionError::ProxyProtocol {
                reason: format!("{}: {:?}", e, String::from_utf8_lossy(raw)),
            }),
        }
    }
}

fn open_tcp(host: &HostSpec, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let addresses: Vec<SocketAddr> = match &host.address {
        Address::Ip(ip) => vec![SocketAddr::new(*ip, host.port)],
        Address::Domain(name) => (name.as_str(), host.port).to_socket_addrs()?.collect(),
    };

    let timeout = match timeout {
        Some(timeout) => timeout,
        None => return TcpStream::connect(&addresses[..]),
    };

    let mut last_error = None;
    for address in &addresses {
        match TcpStream::connect_timeout(address, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                return Ok(stream);
            }
            Err(e) => {
                debug!("connection to {} failed: {}", address, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// In-memory peer: replies come from `incoming`, requests land in `sent`.
    struct ScriptedProxy {
        incoming: Cursor<Vec<u8>>,
        sent: Vec<u8>,
    }

    impl ScriptedProxy {
        fn replying(reply: &[u8]) -> Self {
            ScriptedProxy {
                incoming: Cursor::new(reply.to_vec()),
                sent: Vec::new(),
            }
        }
    }

    impl Read for ScriptedProxy {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.incoming.read(buf)
        }
    }

    impl Write for ScriptedProxy {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Accepts the request, then resets the connection on the first read.
    struct ResettingProxy;

    impl Read for ResettingProxy {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))
        }
    }

    impl Write for ResettingProxy {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn target() -> HostSpec {
        HostSpec::parse("example.com:443").unwrap()
    }

    #[test]
    fn test_tunnel_accepted_on_200() {
        let mut proxy =
            ScriptedProxy::replying(b"HTTP/1.1 200 Connection established\r\n\r\n");
        establish_tunnel(&mut proxy, &target()).unwrap();
        assert_eq!(
            String::from_utf8(proxy.sent).unwrap(),
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n"
        );
    }

    #[test]
    fn test_tunnel_refused_on_407() {
        let reply = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n";
        let mut proxy = ScriptedProxy::replying(reply);
        match establish_tunnel(&mut proxy, &target()) {
            Err(InspectionError::ProxyRefusal { status, response }) => {
                assert_eq!(status, 407);
                assert!(response.starts_with("HTTP/1.1 407"));
            }
            other => panic!("Expected ProxyRefusal, got {:?}", other),
        }
    }

    #[test]
    fn test_undecodable_reply_is_protocol_error() {
        let mut proxy = ScriptedProxy::replying(b"\xff\xfe\x00garbage\r\n\r\n");
        assert!(matches!(
            establish_tunnel(&mut proxy, &target()),
            Err(InspectionError::ProxyProtocol { .. })
        ));
    }

    #[test]
    fn test_not_http_reply_is_protocol_error() {
        let mut proxy = ScriptedProxy::replying(b"SSH-2.0-OpenSSH_9.6\r\n");
        assert!(matches!(
            establish_tunnel(&mut proxy, &target()),
            Err(InspectionError::ProxyProtocol { .. })
        ));
    }

    #[test]
    fn test_silent_proxy_is_protocol_error() {
        let mut proxy = ScriptedProxy::replying(b"");
        match establish_tunnel(&mut proxy, &target()) {
            Err(InspectionError::ProxyProtocol { reason }) => {
                assert!(reason.contains("without a response"))
            }
            other => panic!("Expected ProxyProtocol, got {:?}", other),
        }
    }

    #[test]
    fn test_reset_while_reading_reply_is_protocol_error() {
        match establish_tunnel(&mut ResettingProxy, &target()) {
            Err(e @ InspectionError::ProxyProtocol { .. }) => {
                assert_eq!(e.exit_code(), 5);
                assert!(e.to_string().contains("reading proxy response"));
            }
            other => panic!("Expected ProxyProtocol, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_headers_still_use_status_line() {
        // Reply cut before the blank line, then the proxy goes quiet.
        let mut proxy = ScriptedProxy::replying(b"HTTP/1.1 200 OK\r\nVia: squid\r\n");
        establish_tunnel(&mut proxy, &target()).unwrap();
    }

    #[test]
    fn test_http_1_0_reply_is_accepted() {
        let mut proxy = ScriptedProxy::replying(b"HTTP/1.0 200 OK\r\n\r\n");
        establish_tunnel(&mut proxy, &target()).unwrap();
    }

    #[test]
    fn test_ipv6_target_is_bracketed_in_request() {
        let mut proxy = ScriptedProxy::replying(b"HTTP/1.1 200 OK\r\n\r\n");
        let target = HostSpec::parse("[2001:db8::5]:8443").unwrap();
        establish_tunnel(&mut proxy, &target).unwrap();
        let sent = String::from_utf8(proxy.sent).unwrap();
        assert!(sent.starts_with("CONNECT [2001:db8::5]:8443 HTTP/1.1\r\n"));
    }

    #[test]
    fn test_partial_utf8_tail_is_not_an_error() {
        let reply = ProxyReply::parse(b"HTTP/1.1 200 Caf\xc3").unwrap();
        assert!(!reply.complete);
    }

    #[test]
    fn test_connect_refused_is_reported_as_target_failure() {
        // Port 1 on loopback is essentially never listening.
        let host = HostSpec::parse("127.0.0.1:1").unwrap();
        match connect_direct(&host, Some(Duration::from_secs(5))) {
            Err(e @ InspectionError::ConnectionFailed { .. }) => assert_eq!(e.exit_code(), 4),
            other => panic!("Expected ConnectionFailed, got {:?}", other.map(|_| ())),
        }
    }
}
