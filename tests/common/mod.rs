//! Shared fixtures: a throwaway CA, leaf certificates and local servers.
#![allow(dead_code)]

use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time};
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{SslAcceptor, SslMethod, SslVerifyMode};
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509Builder, X509Extension, X509Name, X509NameBuilder, X509};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

/// Policy OID for domain validated certificates, wrapped in a
/// CertificatePolicies SEQUENCE.
const DV_POLICIES_DER: [u8; 12] = [
    0x30, 0x0A, 0x30, 0x08, 0x06, 0x06, 0x67, 0x81, 0x0C, 0x01, 0x02, 0x01,
];

pub struct Issued {
    pub cert: X509,
    pub key: PKey<Private>,
}

pub fn rsa_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

pub fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

pub fn name(common_name: &str) -> X509Name {
    let mut builder = X509NameBuilder::new().unwrap();
    builder.append_entry_by_text("C", "NO").unwrap();
    builder.append_entry_by_text("O", "Certpeek Test").unwrap();
    builder.append_entry_by_text("CN", common_name).unwrap();
    builder.build()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn builder(serial: u32, subject: &X509Name, days_valid: i64) -> X509Builder {
    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(serial).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(subject).unwrap();
    let now = unix_now();
    builder
        .set_not_before(&Asn1Time::from_unix(now - 86_400).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(now + days_valid * 86_400).unwrap())
        .unwrap();
    builder
}

/// Self-signed RSA root.
pub fn root_ca(common_name: &str) -> Issued {
    let key = rsa_key();
    let subject = name(common_name);
    let mut builder = builder(1, &subject, 3650);
    builder.set_issuer_name(&subject).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder
        .append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()
                .unwrap(),
        )
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    Issued {
        cert: builder.build(),
        key,
    }
}

/// EC leaf signed by `issuer`, with DNS and IP SANs, server and client
/// auth, and the domain validated policy.
pub fn leaf(common_name: &str, sans: &[&str], issuer: &Issued, days_valid: i64) -> Issued {
    leaf_with_extensions(common_name, sans, issuer, days_valid, Vec::new())
}

/// Like [`leaf`], with `extra` appended after the standard extensions. No
/// SAN extension is added when `sans` is empty.
pub fn leaf_with_extensions(
    common_name: &str,
    sans: &[&str],
    issuer: &Issued,
    days_valid: i64,
    extra: Vec<X509Extension>,
) -> Issued {
    let key = ec_key();
    let mut builder = builder(2, &name(common_name), days_valid);
    builder.set_issuer_name(issuer.cert.subject_name()).unwrap();
    builder.set_pubkey(&key).unwrap();

    if !sans.is_empty() {
        let mut alt_names = SubjectAlternativeName::new();
        for san in sans {
            if san.parse::<std::net::IpAddr>().is_ok() {
                alt_names.ip(san);
            } else {
                alt_names.dns(san);
            }
        }
        let alt_names = alt_names
            .build(&builder.x509v3_context(Some(&issuer.cert), None))
            .unwrap();
        builder.append_extension(alt_names).unwrap();
    }
    builder
        .append_extension(
            ExtendedKeyUsage::new()
                .server_auth()
                .client_auth()
                .build()
                .unwrap(),
        )
        .unwrap();
    builder
        .append_extension(raw_extension("2.5.29.32", &DV_POLICIES_DER))
        .unwrap();
    for extension in extra {
        builder.append_extension(extension).unwrap();
    }

    builder.sign(&issuer.key, MessageDigest::sha256()).unwrap();
    Issued {
        cert: builder.build(),
        key,
    }
}

/// A non-critical extension whose extnValue holds `der` verbatim.
pub fn raw_extension(oid: &str, der: &[u8]) -> X509Extension {
    let oid = Asn1Object::from_str(oid).unwrap();
    let value = Asn1OctetString::new_from_bytes(der).unwrap();
    X509Extension::new_from_der(&oid, false, &value).unwrap()
}

/// Embedded SCT list extension with one SCT per log id.
pub fn sct_extension(log_ids: &[[u8; 32]]) -> X509Extension {
    let mut list = Vec::new();
    for log_id in log_ids {
        let mut sct = vec![0u8];
        sct.extend_from_slice(log_id);
        sct.extend_from_slice(&1_700_000_000_000u64.to_be_bytes());
        sct.extend_from_slice(&[0, 0]);
        // sha256, ecdsa, four signature bytes
        sct.extend_from_slice(&[4, 3, 0, 4, 0, 0, 0, 0]);
        list.extend_from_slice(&(sct.len() as u16).to_be_bytes());
        list.extend_from_slice(&sct);
    }
    let mut body = (list.len() as u16).to_be_bytes().to_vec();
    body.extend_from_slice(&list);

    let mut der = vec![0x04, body.len() as u8];
    der.extend_from_slice(&body);
    raw_extension("1.3.6.1.4.1.11129.2.4.2", &der)
}

/// Intermediate that can sign certificates by name and key but whose key
/// usage leaves out keyCertSign.
pub fn non_ca_signer(common_name: &str, issuer: &Issued) -> Issued {
    let key = rsa_key();
    let mut builder = builder(3, &name(common_name), 365);
    builder.set_issuer_name(issuer.cert.subject_name()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .build()
                .unwrap(),
        )
        .unwrap();
    builder.sign(&issuer.key, MessageDigest::sha256()).unwrap();
    Issued {
        cert: builder.build(),
        key,
    }
}

/// Re-encodes `cert` with month 13 in its notAfter UTCTime. OpenSSL still
/// loads the DER; only the time conversion fails.
pub fn with_corrupt_not_after(cert: &X509) -> X509 {
    let mut der = cert.to_der().unwrap();
    let not_after = der
        .windows(2)
        .enumerate()
        .filter(|(_, tag)| *tag == [0x17, 0x0D])
        .map(|(at, _)| at)
        .nth(1)
        .expect("notAfter UTCTime");
    // YYMMDDHHMMSSZ, month at offset 2
    der[not_after + 4] = b'1';
    der[not_after + 5] = b'3';
    X509::from_der(&der).unwrap()
}

/// Root plus a leaf for `localhost` and `127.0.0.1`.
pub fn localhost_chain() -> (Issued, Issued) {
    let root = root_ca("Certpeek Test Root");
    let leaf = leaf(
        "localhost",
        &["localhost", "*.test.localhost", "127.0.0.1"],
        &root,
        365,
    );
    (root, leaf)
}

/// A one-connection TLS server presenting `leaf` then `root`.
pub struct TlsServer {
    pub addr: SocketAddr,
    /// SNI name seen by the server, if any was sent
    pub sni: Arc<Mutex<Option<String>>>,
    handle: JoinHandle<()>,
}

impl TlsServer {
    pub fn start(leaf: &Issued, root: &Issued, require_client_cert: bool) -> TlsServer {
        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
        acceptor.set_private_key(&leaf.key).unwrap();
        acceptor.set_certificate(&leaf.cert).unwrap();
        acceptor.add_extra_chain_cert(root.cert.clone()).unwrap();
        if require_client_cert {
            acceptor.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        }
        let sni = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&sni);
        acceptor.set_servername_callback(move |ssl, _| {
            *seen.lock().unwrap() = ssl
                .servername(openssl::ssl::NameType::HOST_NAME)
                .map(str::to_string);
            Ok(())
        });
        let acceptor = acceptor.build();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                if let Ok(mut tls) = acceptor.accept(stream) {
                    let mut buf = [0u8; 1];
                    let _ = tls.read(&mut buf);
                }
            }
        });
        TlsServer { addr, sni, handle }
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn seen_sni(self) -> Option<String> {
        let _ = self.handle.join();
        let sni = self.sni.lock().unwrap().clone();
        sni
    }
}

/// A one-connection HTTP proxy that answers CONNECT with `reply` and, when
/// the reply is a 200, relays bytes to `upstream`.
pub fn start_proxy(reply: &'static str, upstream: Option<SocketAddr>) -> (SocketAddr, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut client, _) = listener.accept().unwrap();
        let request = read_request_head(&mut client);
        client.write_all(reply.as_bytes()).unwrap();
        if let Some(upstream) = upstream {
            let server = TcpStream::connect(upstream).unwrap();
            relay(client, server);
        }
        request
    });
    (addr, handle)
}

fn read_request_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

fn relay(client: TcpStream, server: TcpStream) {
    let mut client_read = client.try_clone().unwrap();
    let mut server_write = server.try_clone().unwrap();
    let upstream = thread::spawn(move || {
        let _ = std::io::copy(&mut client_read, &mut server_write);
        let _ = server_write.shutdown(std::net::Shutdown::Write);
    });
    let mut server_read = server;
    let mut client_write = client;
    let _ = std::io::copy(&mut server_read, &mut client_write);
    let _ = client_write.shutdown(std::net::Shutdown::Write);
    let _ = upstream.join();
}
