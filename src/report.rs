//! Rendering of a [`ChainReport`] for humans (text) and machines (JSON).

use crate::analyzer::{CertificateReport, ChainReport};
use crate::chain::{CertificateChain, ChainLink};
use crate::host::HostSpec;
use openssl::error::ErrorStack;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

const SEPARATOR: &str = "#############################################################";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
}

/// Extra material appended after each certificate in text output.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    pub print_pem: bool,
    pub print_text: bool,
}

/// Renders the bracketed field layout, one block per certificate.
pub fn render_text(
    report: &ChainReport,
    chain: &CertificateChain,
    options: RenderOptions,
) -> Result<String, ErrorStack> {
    let mut output = String::new();
    for (cert, x509) in report.certificates.iter().zip(chain.iter()) {
        output.push_str(&render_certificate(cert, report.link_to_previous(cert.index)));
        if options.print_pem {
            output.push_str(&String::from_utf8_lossy(&x509.to_pem()?));
            output.push('\n');
        }
        if options.print_text {
            output.push_str(&String::from_utf8_lossy(&x509.to_text()?));
            output.push('\n');
        }
    }
    Ok(output)
}

fn render_certificate(cert: &CertificateReport, link: Option<&ChainLink>) -> String {
    let mut output = String::new();
    output.push_str(SEPARATOR);
    output.push('\n');

    push_field(&mut output, "Subject", [cert.subject.clone()]);
    push_field(&mut output, "Issuer", [cert.issuer.clone()]);
    push_field(&mut output, "Serial", cert.serial.clone());
    push_field(&mut output, "Key type", [cert.key.clone()]);
    push_field(&mut output, "Not before", cert.not_before_local());
    push_field(
        &mut output,
        "Not after",
        cert.not_after_local().map(|time| match cert.expiry {
            Some(status) => format!("{} ({})", time, status),
            None => time,
        }),
    );
    push_field(
        &mut output,
        "SANs",
        cert.sans.iter().map(|san| {
            if san.matched {
                format!("* {}", san.value)
            } else {
                san.value.clone()
            }
        }),
    );
    push_field(&mut output, "SCTs", cert.sct_logs.iter().cloned());
    push_field(&mut output, "Type", cert.cert_type.iter().cloned());
    push_field(
        &mut output,
        "Extended Key Usages",
        cert.extended_key_usages.iter().cloned(),
    );
    push_field(&mut output, "Signature alg", cert.signature_hash.iter().cloned());
    push_field(&mut output, "SHA1", cert.sha1.clone());
    push_field(&mut output, "SHA256", cert.sha256.clone());

    if cert.known_bad {
        output.push_str("This is a bad Buypass cert!\n");
    }
    if let Some(link) = link.filter(|link| !link.verdict.is_issued()) {
        output.push_str(&format!(
            "This cert is not the issuer of the previous cert: {}\n",
            link.verdict
        ));
    }
    if cert.self_signed {
        output.push_str("Self signed cert!\n");
    }
    output.push('\n');
    output
}

/// Writes `[header]` and indented values; skips fields with nothing to show.
fn push_field<I>(output: &mut String, header: &str, values: I)
where
    I: IntoIterator<Item = String>,
{
    let values: Vec<String> = values.into_iter().filter(|v| !v.is_empty()).collect();
    if values.is_empty() {
        return;
    }
    output.push_str(&format!("[{}]\n", header));
    for value in values {
        output.push_str(&format!("  {}\n", value));
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    host: String,
    handshake_error: Option<&'a str>,
    #[serde(flatten)]
    report: &'a ChainReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pem: Option<Vec<String>>,
}

/// Serializes the whole report as pretty JSON.
pub fn render_json(
    host: &HostSpec,
    handshake_error: Option<&str>,
    report: &ChainReport,
    chain: &CertificateChain,
    options: RenderOptions,
) -> Result<String, ReportError> {
    let pem = if options.print_pem {
        let pems = chain
            .iter()
            .take(report.certificates.len())
            .map(|cert| cert.to_pem().map(|pem| String::from_utf8_lossy(&pem).into_owned()))
            .collect::<Result<Vec<_>, _>>()?;
        Some(pems)
    } else {
        None
    };
    let json = JsonReport {
        host: host.to_string(),
        handshake_error,
        report,
        pem,
    };
    Ok(serde_json::to_string_pretty(&json)?)
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("OpenSSL error: {0}")]
    Tls(#[from] ErrorStack),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
