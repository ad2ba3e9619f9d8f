//! Reference data used while analyzing certificates.
//!
//! - [`KnownLogRegistry`]: Certificate Transparency log names, keyed by the
//!   base64 SHA-256 of the log's public key (the SCT log id).
//! - [`KnownPolicyRegistry`]: certificate type labels, keyed by policy OID.
//! - [`is_known_bad`]: fingerprints of mis-issued certificates.
//!
//! The builtin tables are process-wide and never mutated. A registry is the
//! builtin table overlaid with entries supplied by configuration, built once
//! at startup and only read afterwards.

use lazy_static::lazy_static;
use log::debug;
use openssl::base64;
use openssl::error::ErrorStack;
use openssl::sha::sha256;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Name reported for an SCT whose log id is not in the registry.
pub const UNKNOWN_LOG: &str = "Unknown log";

/// Placeholder logs published in the log list to unbreak misbehaving CT
/// libraries; they never sign anything.
const PLACEHOLDER_LOG_IDS: [&str; 2] = [
    "LtakTeuPDIZGZ3acTt0EH4QjZ1X6OqymNNCTXfzVmnA=",
    "0vxlL6X5tzi4N1X6XrFfC0UlP06Po7m2T9TeVmLRhwg=",
];

/// SHA-256 fingerprints of the certificates mis-issued by Buypass.
static BAD_BUYPASS_CERTS: &[&str] = &[
    "8acd454c36e2f873c90ae6c00df75928daa414a43be745e866e8172344178824",
    "ebdbb3944b2c0c58a1ae4ac058231cda849aa7bec97a9e27ad5d515b47a59cd2",
    "f543633a628e37effc6da952593657bcc5b24b1d590c35b61469027754460dd7",
    "7ac99c1e48e7e935ada22488adac80bfe6e6503cfc54077b9547ff20f3e5ccd5",
    "ff7462796eb657215b6eefa9d821f4beb808e52041cc84dc81b28ca8265bb74f",
    "f66fb7a934e56ecacc65ccb73e6c2be75ec58b8dfe35564b3d6741032af8aaf6",
    "c651aaf5290c2f028246afd39a13008f8c6b83fa658d1107a7eeab7a7a8114ae",
    "0a59b558ae7fce4cba149acfe0609e9d14e301a38421ceabe61347960376a400",
    "a047c5d423d9c0a6c020b624c3bdd4b5689113605e956c3ef0eba4ae5e82363d",
    "d2d1da9c14f62d97465f337d26788c079ee5450a42d3dadb00ad0eb20f18ec49",
];

lazy_static! {
    static ref KNOWN_LOGS: HashMap<&'static str, &'static str> = [
        ("pXesnO11SN2PAltnokEInfhuD0duwgPC7L7bGF8oJjg=", "CNNIC CT log"),
        ("zbUXm3/BwEb+6jETaj+PAC5hgvr4iW/syLL1tatgSQA=", "Certly.IO log"),
        ("dH7agzGtMxCRIZzOJU9CcMK//V5CIAjGNzV55hB7zFY=", "Cloudflare 'Nimbus2019' Log"),
        ("Xqdz+d9WwOe1Nkh90EngMnqRmgyEoRIShBh1loFxRVg=", "Cloudflare 'Nimbus2020' Log"),
        ("RJRlLrDuzq/EQAfYqP4owNrmgr7YyzG1P9MzlrW2gag=", "Cloudflare 'Nimbus2021' Log"),
        ("QcjKsd8iRkoQxqE6CUKHXk4xixsD6+tLx2jwkGKWBvY=", "Cloudflare 'Nimbus2022' Log"),
        ("ejKMVNi3LbYg6jjgUh7phBZwMhOFTTvSK8E6V6NS61I=", "Cloudflare 'Nimbus2023' Log"),
        ("VhQGmi/XwuzT9eG9RLI+x0Z2ubyZEVzA75SYVdaJ0N0=", "DigiCert Log Server"),
        ("h3W/51l8+IxDmV+9827/Vo1HVjb/SrVgwbTq/16ggw8=", "DigiCert Log Server 2"),
        ("/kRhCLHQGreKYsz+q2qysrq/86va2ApNizDfLQAIgww=", "DigiCert Nessie2019 Log"),
        ("xlKg7EjOs/yrFwmSxDqHQTMJ6ABlomJSQBujNioXxWU=", "DigiCert Nessie2020 Log"),
        ("7sCV7o1yZA+S48O5G8cSo2lqCXtLahoUOOZHssvtxfk=", "DigiCert Nessie2021 Log"),
        ("UaOw9f0BeZxWbbg3eI8MpHrMGyfL956IQpoN/tSLBeU=", "DigiCert Nessie2022 Log"),
        ("s3N3B+GEUPhjhtYFqdwRCUp5LbFnDAuH3PADDnk2pZo=", "DigiCert Nessie2023 Log"),
        ("4mlLribo6UAJ6IYbtjuD1D7n/nSI+6SPKJMBnd3x2/4=", "DigiCert Yeti2019 Log"),
        ("8JWkWfIA0YJAEC0vk4iOrUv+HUfjmeHQNKawqKqOsnM=", "DigiCert Yeti2020 Log"),
        ("XNxDkv7mq0VEsV6a1FbmEDf71fpH3KFzlLJe5vbHDso=", "DigiCert Yeti2021 Log"),
        ("IkVFB1lVJFaWP6Ev8fdthuAjJmOtwEt/XcaDXG7iDwI=", "DigiCert Yeti2022 Log"),
        ("Nc8ZG7+xbFe/D61MbULLu7YnICZR6j/hKu+oA8M71kw=", "DigiCert Yeti2023 Log"),
        ("Y/Lbzeg7zCzPC3KEJ1drM6SNYXePvXWmOLHHaFRL2I0=", "Google 'Argon2019' log"),
        ("sh4FzIuizYogTodm+Su5iiUgZ2va+nDnsklTLe+LkF4=", "Google 'Argon2020' log"),
        ("9lyUL9F3MCIUVBgIMJRWjuNNExkzv98MLyALzE7xZOM=", "Google 'Argon2021' log"),
        ("KXm+8J45OSHwVnOfY6V35b5XfZxgCvj5TV0mXCVdx4Q=", "Google 'Argon2022' log"),
        ("6D7Q2j71BjUy51covIlryQPTy9ERa+zraeF3fW0GvW4=", "Google 'Argon2023' log"),
        ("aPaY+B9kgr46jO65KB1M/HFRXWeT1ETRCmesu09P+8Q=", "Google 'Aviator' log"),
        ("KTxRllTIOWW6qlD8WAfUt2+/WHopctykwwz05UVH9Hg=", "Google 'Icarus' log"),
        ("pLkJkLQYWBSHuxOizGdwCjw1mAT5G9+443fNDsgN3BA=", "Google 'Pilot' log"),
        ("7ku9t3XOYLrhQmkfq+GeZqMPfl+wctiDAMR7iXqo/cs=", "Google 'Rocketeer' log"),
        ("u9nfvB+KcbWTlCOXqpJ7RzhXlQqrUugakJZkNo4e0YU=", "Google 'Skydiver' log"),
        ("CEEUmABxUywWGQRgvPxH/cJlOvopLHKzf/hjrinMyfA=", "Google 'Xenon2019' log"),
        ("B7dcG+V9aP/xsMYdIxXHuuZXfFeUt2ruvGE6GmnTohw=", "Google 'Xenon2020' log"),
        ("fT7y+I//iFVoJMLAyp5SiXkrxQ54CX8uapdomX4i8Nc=", "Google 'Xenon2021' log"),
        ("RqVV63X6kSAwtaKJafTzfREsQXS+/Um4havy/HD+bUc=", "Google 'Xenon2022' log"),
        ("rfe++nz/EMiLnT2cHj4YarRnKV3PsQwkyoWGNOvcgoo=", "Google 'Xenon2023' log"),
        ("dGG0oJz7PUHXUVlXWy52SaRFqNJ3CbDMVkpkgrfrQaM=", "Izenpe log"),
        ("lCC8Ho7VjWyIcx+CiyIsDdHaTV5sT5Q9YdtOL1hNosI=", "Let's Encrypt 'Oak2021' log"),
        ("36Veq2iCTx9sre64X04+WurNohKkal6OOxLAIERcKnM=", "Let's Encrypt 'Oak2022' log"),
        ("tz77JN+cTbp18jnFulj0bF38Qs96nzXEnh0JgSXttJk=", "Let's Encrypt 'Oak2023' log"),
        ("b1N2rDHwMRnYmQCkURX/dxUcEdkCwQApBo2yCJo32RM=", "Sectigo 'Mammoth' CT log"),
        ("VYHUwhaQNgFK6gubVzxT8MDkOHhwJQgXL6OqHQcT0ww=", "Sectigo 'Sabre' CT log"),
        ("NLtq1sPfnAPuqKSZ/3iRSGydXlysktAfe/0bzhnbSO8=", "StartCom log"),
        ("FZcEiNe5l6Bb61JRKt7o0ui0oxZSZBIan6v71fha2T8=", "Symantec 'Sirius' log"),
        ("vHjh38X2PGhGSTNNoQ+hXwl5aSAJwIG08/aRfz7ZuKU=", "Symantec 'Vega' log"),
        ("3esdK3oNT6Ygi4GtgWhwfi6OnQHVXIiNPRHEzbbsvsw=", "Symantec log"),
        ("qNxS9j1rJCXlMeN89ORKcU8UKiCAOw0E0uLuBmR5SiM=", "Trust Asia CT2021"),
        ("Z422Wz50Q7bzo3DV4TqxtDvgoNNR98p0IlDHxvpRqIo=", "Trust Asia Log2021"),
        ("w2X5s2VPMoPHnamOk9dBj1ure+MlLJjh0vBLuetCfSM=", "Trust Asia Log2022"),
        ("6H6nZgvCbPYALvVyXT/g4zG5OTu5L79Y6zuQSdr1Q1o=", "Trust Asia Log2023"),
        ("AwGd8/2FppqOvR+sxtqbpz5Gl3T+d/V5/FoIuDKMHWs=", "Venafi Gen2 CT log"),
        ("rDua7X+pZ0dXFZ5tfVdWcvnZgQCUHpve/+yhMTt1eC0=", "Venafi log"),
        ("QbLcLonmPOSvG6e7Kb9oxt7m+fHMBH4w3/rjs7olkmM=", "WoSign log"),
    ]
    .into_iter()
    .collect();

    static ref KNOWN_CERT_TYPES: HashMap<&'static str, &'static str> = [
        ("2.23.140.1.1", "Extended validation TLS certificate"),
        ("2.23.140.1.2.1", "Domain validated TLS certificate"),
        ("2.23.140.1.2.2", "Organization validated TLS certificate"),
    ]
    .into_iter()
    .collect();

    static ref BAD_CERTS: HashSet<&'static str> = BAD_BUYPASS_CERTS.iter().copied().collect();
}

/// Is this lowercase hex SHA-256 fingerprint on the deny list?
pub fn is_known_bad(sha256_hex: &str) -> bool {
    BAD_CERTS.contains(sha256_hex.to_ascii_lowercase().as_str())
}

/// CT log names keyed by base64 log id.
#[derive(Debug, Clone)]
pub struct KnownLogRegistry {
    logs: HashMap<String, String>,
}

impl Default for KnownLogRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl KnownLogRegistry {
    /// The logs compiled into the binary.
    pub fn builtin() -> Self {
        KnownLogRegistry {
            logs: KNOWN_LOGS
                .iter()
                .map(|(id, name)| (id.to_string(), name.to_string()))
                .collect(),
        }
    }

    /// Adds (or renames) logs. Later entries win.
    pub fn with_logs<I>(mut self, logs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.logs.extend(logs);
        self
    }

    /// Name of the log with this id, or [`UNKNOWN_LOG`].
    pub fn log_name(&self, log_id: &str) -> &str {
        self.logs.get(log_id).map(String::as_str).unwrap_or(UNKNOWN_LOG)
    }

    /// Name of the log whose id is the raw 32 byte `key_id` of an SCT.
    pub fn log_name_for_key_id(&self, key_id: &[u8]) -> &str {
        self.log_name(&base64::encode_block(key_id))
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    /// Entries sorted by log name, the layout used when writing a table out.
    pub fn sorted_by_name(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .logs
            .iter()
            .map(|(id, name)| (id.as_str(), name.as_str()))
            .collect();
        entries.sort_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)));
        entries
    }

    /// Parses the public CT log list (v3 schema) into `(log id, description)`
    /// pairs.
    ///
    /// The log id is recomputed from the published key rather than trusted.
    pub fn from_log_list_json(json: &str) -> Result<BTreeMap<String, String>, LogListError> {
        let list: LogList = serde_json::from_str(json)?;
        let mut logs = BTreeMap::new();
        for operator in list.operators {
            for log in operator.logs.into_iter().chain(operator.tiled_logs) {
                let key = base64::decode_block(&log.key)?;
                let log_id = base64::encode_block(&sha256(&key));
                if PLACEHOLDER_LOG_IDS.contains(&log_id.as_str()) {
                    debug!("skipping placeholder log '{}'", log.description);
                    continue;
                }
                logs.insert(log_id, log.description);
            }
        }
        Ok(logs)
    }
}

/// Errors while reading a CT log list document.
#[derive(Debug, thiserror::Error)]
pub enum LogListError {
    #[error("Log list is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Log key is not valid base64: {0}")]
    Key(#[from] ErrorStack),
}

#[derive(Deserialize)]
struct LogList {
    operators: Vec<LogOperator>,
}

#[derive(Deserialize)]
struct LogOperator {
    #[serde(default)]
    logs: Vec<LogEntry>,
    #[serde(default)]
    tiled_logs: Vec<LogEntry>,
}

#[derive(Deserialize)]
struct LogEntry {
    description: String,
    key: String,
}

/// Certificate type labels keyed by dotted policy OID.
#[derive(Debug, Clone)]
pub struct KnownPolicyRegistry {
    types: HashMap<String, String>,
}

impl Default for KnownPolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl KnownPolicyRegistry {
    pub fn builtin() -> Self {
        KnownPolicyRegistry {
            types: KNOWN_CERT_TYPES
                .iter()
                .map(|(oid, label)| (oid.to_string(), label.to_string()))
                .collect(),
        }
    }

    pub fn with_types<I>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.types.extend(types);
        self
    }

    pub fn cert_type(&self, policy_oid: &str) -> Option<&str> {
        self.types.get(policy_oid).map(String::as_str)
    }

    /// Label of the first policy found in the registry.
    pub fn first_match<'a, I>(&self, policy_oids: I) -> Option<&str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        policy_oids
            .into_iter()
            .find_map(|oid| self.cert_type(oid))
    }
}

/// Both registries, as consumed by the analyzer.
#[derive(Debug, Clone, Default)]
pub struct Registries {
    pub logs: KnownLogRegistry,
    pub policies: KnownPolicyRegistry,
}
