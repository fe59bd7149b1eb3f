//! Certificate bundles
//!
//! A bundle is a private key and its certificate chain stored as one PEM
//! blob: the key block first, then each certificate, leaf first.

use chrono::{DateTime, TimeZone, Utc};
use pem::{EncodeConfig, LineEnding, Pem};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{parse_x509_certificate, X509Certificate};
use x509_parser::public_key::PublicKey;

use crate::error::{ProxyError, Result};

const KEY_TAG: &str = "PRIVATE KEY";
const CERT_TAG: &str = "CERTIFICATE";

/// Private key (PKCS#8 DER) plus certificate chain (DER, leaf first)
#[derive(Clone, PartialEq, Eq)]
pub struct Bundle {
    pub key_der: Vec<u8>,
    pub chain: Vec<Vec<u8>>,
}

impl std::fmt::Debug for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundle")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Metadata of a validated leaf certificate
#[derive(Debug, Clone)]
pub struct Leaf {
    pub names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Leaf {
    /// Whether the certificate expires within `window` of `now`
    pub fn expires_within(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.not_after - now < window
    }
}

impl Bundle {
    /// Build a bundle from a key and a PEM chain as returned by an ACME server
    pub fn from_chain_pem(key: &KeyPair, chain_pem: &str) -> Option<Self> {
        let blocks = pem::parse_many(chain_pem).ok()?;
        if blocks.is_empty() || blocks.iter().any(|b| b.tag() != CERT_TAG) {
            return None;
        }
        Some(Self {
            key_der: key.serialize_der(),
            chain: blocks.into_iter().map(Pem::into_contents).collect(),
        })
    }

    /// Key pair of this bundle
    pub fn key_pair(&self) -> Option<KeyPair> {
        KeyPair::try_from(self.key_der.as_slice()).ok()
    }
}

/// Serialize a bundle: key block, then each chain block
pub fn encode(bundle: &Bundle) -> Vec<u8> {
    let mut out = encode_block(KEY_TAG, &bundle.key_der);
    for cert in &bundle.chain {
        out.push_str(&encode_block(CERT_TAG, cert));
    }
    out.into_bytes()
}

fn encode_block(tag: &str, der: &[u8]) -> String {
    let config = EncodeConfig::new().set_line_ending(LineEnding::LF);
    pem::encode_config(&Pem::new(tag, der.to_vec()), config)
}

/// Parse a stored blob. Anything unusable means "no certificate yet".
pub fn decode(bytes: &[u8]) -> Option<Bundle> {
    if bytes.is_empty() {
        return None;
    }
    let blocks = pem::parse_many(bytes).ok()?;
    // Truncated trailing blocks are skipped by the parser
    let begins = bytes.windows(11).filter(|w| *w == b"-----BEGIN ").count();
    if begins != blocks.len() {
        return None;
    }
    let mut blocks = blocks.into_iter();

    let key = blocks.next()?;
    if key.tag() != KEY_TAG {
        return None;
    }
    let key_der = key.into_contents();
    KeyPair::try_from(key_der.as_slice()).ok()?;

    let mut chain = Vec::new();
    for block in blocks {
        if block.tag() != CERT_TAG {
            return None;
        }
        chain.push(block.into_contents());
    }

    Some(Bundle { key_der, chain })
}

/// Check that the bundle can serve `hostname` at `now`
pub fn validate(hostname: &str, bundle: &Bundle, now: DateTime<Utc>) -> Result<Leaf> {
    let leaf_der = bundle
        .chain
        .first()
        .ok_or_else(|| ProxyError::invalid_certificate(hostname, "no certificates in chain"))?;
    let (_, cert) = parse_x509_certificate(leaf_der)
        .map_err(|e| ProxyError::invalid_certificate(hostname, format!("unparseable leaf: {}", e)))?;

    let validity = cert.validity();
    let not_before = timestamp(validity.not_before.timestamp())
        .ok_or_else(|| ProxyError::invalid_certificate(hostname, "bad NotBefore"))?;
    let not_after = timestamp(validity.not_after.timestamp())
        .ok_or_else(|| ProxyError::invalid_certificate(hostname, "bad NotAfter"))?;
    if now < not_before {
        return Err(ProxyError::invalid_certificate(hostname, "certificate is not valid yet"));
    }
    if now > not_after {
        return Err(ProxyError::invalid_certificate(hostname, "certificate has expired"));
    }

    let names = subject_names(&cert);
    if !names.iter().any(|name| matches_hostname(name, hostname)) {
        return Err(ProxyError::invalid_certificate(
            hostname,
            format!("certificate is valid for {:?}", names),
        ));
    }

    let key = bundle
        .key_pair()
        .ok_or_else(|| ProxyError::invalid_certificate(hostname, "unparseable private key"))?;
    match cert.public_key().parsed() {
        Ok(PublicKey::EC(point)) if point.data() == key.public_key_raw() => {}
        Ok(PublicKey::EC(_)) => {
            return Err(ProxyError::invalid_certificate(
                hostname,
                "public key does not match private key",
            ))
        }
        Ok(_) => {
            return Err(ProxyError::invalid_certificate(hostname, "leaf key is not an EC key"))
        }
        Err(e) => {
            return Err(ProxyError::invalid_certificate(
                hostname,
                format!("unparseable public key: {}", e),
            ))
        }
    }

    Ok(Leaf {
        names,
        not_before,
        not_after,
    })
}

/// Generate a self-signed bundle for local use
pub fn self_signed(hostname: &str) -> Result<Bundle> {
    let key = KeyPair::generate().map_err(|e| ProxyError::Tls(e.to_string()))?;
    let mut params = CertificateParams::new(vec![hostname.to_string()])
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, hostname);
    params.distinguished_name = name;

    let cert = params
        .self_signed(&key)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;

    Ok(Bundle {
        key_der: key.serialize_der(),
        chain: vec![cert.der().to_vec()],
    })
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// SAN DNS names, or the common name when the certificate has no SAN
fn subject_names(cert: &X509Certificate<'_>) -> Vec<String> {
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        return san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect();
    }
    cert.subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .map(str::to_string)
        .collect()
}

/// Hostname verification with single-label wildcards
fn matches_hostname(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();

    match pattern.strip_prefix("*.") {
        Some(suffix) => match hostname.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == suffix,
            None => false,
        },
        None => pattern == hostname,
    }
}
