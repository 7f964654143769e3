//! Leaf certificate issuance (spec.md §3 "Leaf certificate", §4.1 step 3).

use std::net::IpAddr;
use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyUsagePurpose, SanType};
use rsa::pkcs8::EncodePrivateKey;
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};

use crate::ca::store::RootCa;
use crate::error::ProxyError;

const VALIDITY_YEARS: i64 = 10;
const RSA_KEY_BITS: usize = 2048;

/// Generates a fresh RSA-2048 key pair for a leaf certificate. `rcgen` can
/// only *generate* EC/Ed25519 keys (its crypto backends don't implement RSA
/// key generation) but can sign a certificate over an externally-generated
/// RSA key, so the key itself comes from the `rsa` crate and is handed to
/// `rcgen` as PKCS#8 DER.
fn generate_rsa_key_pair() -> Result<rcgen::KeyPair, ProxyError> {
    let mut rng = rand::rngs::OsRng;
    let private_key = rsa::RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| ProxyError::CertIssuanceFailed(format!("RSA key generation: {e}")))?;
    let pkcs8 = private_key
        .to_pkcs8_der()
        .map_err(|e| ProxyError::CertIssuanceFailed(format!("RSA PKCS8 encoding: {e}")))?;
    let key_der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());
    rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&key_der, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| ProxyError::CertIssuanceFailed(format!("wrapping RSA key for rcgen: {e}")))
}

/// A leaf certificate plus its private key and the `[leaf, root]` chain
/// required by the TLS handshake (spec.md §3 "The certificate chain is
/// `[leaf, root]`").
pub struct CachedLeaf {
    pub chain: Vec<CertificateDer<'static>>,
    pub key_der: Arc<PrivatePkcs8KeyDer<'static>>,
}

/// Strips a port and, for IPv6 literals, surrounding brackets from a raw
/// `Host` value (spec.md §4.1 step 1, §4.4.4 "ports in the Host header").
/// Does not reject empty input — see `normalize_host_checked`.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        // `[::1]` or `[::1]:8080`
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
        return rest.to_string();
    }
    // IPv4 / DNS name, optionally with a trailing `:port`. Careful not to
    // mistake a bare IPv6 literal (no brackets) for a host:port pair — if
    // there's more than one colon, there's no port to strip.
    if host.matches(':').count() == 1 {
        if let Some((h, _port)) = host.rsplit_once(':') {
            return h.to_string();
        }
    }
    host.to_string()
}

/// Per spec.md §9's Open Question resolution: empty hostnames are rejected
/// rather than silently producing an empty-CN certificate.
pub fn normalize_host_checked(host: &str) -> Result<String, ProxyError> {
    let normalized = normalize_host(host);
    if normalized.is_empty() {
        return Err(ProxyError::InvalidHost("hostname is empty after normalization".to_string()));
    }
    Ok(normalized)
}

/// Encodes a non-ASCII hostname as Punycode (spec.md §3 "Punycode-encoded if
/// non-ASCII"). ASCII hosts pass through unchanged.
fn to_ascii_san(host: &str) -> Result<String, ProxyError> {
    if host.is_ascii() {
        return Ok(host.to_string());
    }
    idna::domain_to_ascii(host).map_err(|e| ProxyError::CertIssuanceFailed(format!("punycode encoding of {host}: {e}")))
}

fn build_leaf_params(normalized_host: &str) -> Result<CertificateParams, ProxyError> {
    let mut params = CertificateParams::default();

    let mut serial = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut serial);
    params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial));

    let not_before = time::OffsetDateTime::now_utc();
    params.not_before = not_before;
    params.not_after = not_before + time::Duration::days(365 * VALIDITY_YEARS);

    params.key_usages = vec![KeyUsagePurpose::KeyEncipherment, KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, normalized_host);
    params.distinguished_name = dn;

    if let Ok(ip) = normalized_host.parse::<IpAddr>() {
        params.subject_alt_names = vec![SanType::IpAddress(ip)];
    } else {
        let ascii_host = to_ascii_san(normalized_host)?;
        let dns_name = ascii_host
            .try_into()
            .map_err(|e| ProxyError::CertIssuanceFailed(format!("invalid DNS SAN: {e:?}")))?;
        params.subject_alt_names = vec![SanType::DnsName(dns_name)];
    }

    Ok(params)
}

/// Issues a single leaf certificate for `normalized_host`, signed by `root`.
/// Never touches the cache — callers (the single-flight coordinator in
/// `cache.rs`) own publishing the result.
pub fn issue(root: &RootCa, normalized_host: &str) -> Result<CachedLeaf, ProxyError> {
    let params = build_leaf_params(normalized_host)?;

    let key_pair = generate_rsa_key_pair()?;

    let cert = params
        .signed_by(&key_pair, &root.issuer, &root.key_pair)
        .map_err(|e| ProxyError::CertIssuanceFailed(e.to_string()))?;

    let leaf_der = cert.der().clone();
    let chain = vec![leaf_der, root.cert_der.clone()];
    let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

    Ok(CachedLeaf {
        chain,
        key_der: Arc::new(key_der),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::store::generate_in_memory;

    #[test]
    fn normalize_strips_port_and_brackets() {
        assert_eq!(normalize_host("example.org"), "example.org");
        assert_eq!(normalize_host("example.org:443"), "example.org");
        assert_eq!(normalize_host("example.org:8080"), "example.org");
        assert_eq!(normalize_host("[::1]"), "::1");
        assert_eq!(normalize_host("[::1]:8080"), "::1");
        assert_eq!(normalize_host("127.0.0.1:80"), "127.0.0.1");
    }

    #[test]
    fn empty_host_is_rejected() {
        assert!(normalize_host_checked("").is_err());
        assert!(normalize_host_checked(":443").is_err());
    }

    #[test]
    fn issues_dns_san_for_hostname() {
        let root = generate_in_memory().unwrap();
        let leaf = issue(&root, "example.test").unwrap();
        assert_eq!(leaf.chain.len(), 2);
    }

    #[test]
    fn issues_ip_san_for_ip_literal() {
        let root = generate_in_memory().unwrap();
        let leaf = issue(&root, "127.0.0.1").unwrap();
        assert_eq!(leaf.chain.len(), 2);
    }

    #[test]
    fn non_ascii_host_is_punycoded() {
        let ascii = to_ascii_san("café.example").unwrap();
        assert!(ascii.is_ascii());
        assert!(ascii.contains("xn--"));
    }
}
