//! Root CA persistence: PEM files on disk (spec.md §6 "File layout (CA store)").

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose};
use tracing::info;

use crate::error::ProxyError;

const CERT_FILE: &str = "sniffy-ca.crt";
const KEY_FILE: &str = "sniffy-ca.key";
const VALIDITY_YEARS: i64 = 99;

/// A root CA's key material, the self-signed `Certificate` usable as an
/// issuer for leaves, and the exact DER bytes handed out by `GetRoot()`.
///
/// `cert_der` and `issuer` may carry different signature bytes when the CA
/// was reloaded from disk (see `load`'s doc comment) — `cert_der` is the
/// verbatim on-disk root (spec.md P4's byte-for-byte requirement), `issuer`
/// is only ever used internally to sign leaves.
pub struct RootCa {
    pub key_pair: KeyPair,
    pub issuer: rcgen::Certificate,
    pub cert_der: rustls_pki_types::CertificateDer<'static>,
}

/// Resolves the CA store directory per spec.md §6 "Store path resolution".
pub fn resolve_store_path(raw: &str) -> std::io::Result<PathBuf> {
    let path = if raw.is_empty() {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        PathBuf::from(home).join(".sniffy")
    } else {
        let candidate = PathBuf::from(raw);
        if candidate.is_absolute() {
            candidate
        } else {
            std::env::current_dir()?.join(candidate)
        }
    };

    if path.exists() && !path.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("CA store path {} exists and is not a directory", path.display()),
        ));
    }
    if !path.exists() {
        fs::create_dir_all(&path)?;
    }
    Ok(path)
}

fn build_root_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let mut serial = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut serial);
    params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial));

    let not_before = time::OffsetDateTime::now_utc();
    params.not_before = not_before;
    params.not_after = not_before + time::Duration::days(365 * VALIDITY_YEARS);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "sniffy Root CA");
    dn.push(DnType::OrganizationName, "sniffy");
    params.distinguished_name = dn;
    params
}

/// Generates a fresh root CA in memory, without touching disk.
pub fn generate_in_memory() -> Result<RootCa, ProxyError> {
    let params = build_root_params();
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| ProxyError::CertIssuanceFailed(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ProxyError::CertIssuanceFailed(e.to_string()))?;
    let cert_der = cert.der().clone();
    Ok(RootCa {
        key_pair,
        issuer: cert,
        cert_der,
    })
}

/// Loads a persistent CA from `store_dir`, generating and writing one if
/// neither file is present. Corrupt or mismatched files are fatal — per
/// spec.md §3's invariant, this function never silently regenerates over
/// an existing-but-broken store.
pub fn load_or_create(store_dir: &Path) -> Result<RootCa, ProxyError> {
    let cert_path = store_dir.join(CERT_FILE);
    let key_path = store_dir.join(KEY_FILE);

    if cert_path.exists() || key_path.exists() {
        if !cert_path.exists() || !key_path.exists() {
            return Err(ProxyError::ConfigInvalid(format!(
                "CA store at {} has only one of {CERT_FILE}/{KEY_FILE}",
                store_dir.display()
            )));
        }
        return load(&cert_path, &key_path);
    }

    info!("no existing CA found at {}, generating one", store_dir.display());
    let root = generate_in_memory()?;
    persist(&root, &cert_path, &key_path)?;
    Ok(root)
}

/// Loads the CA from PEM. The exact on-disk DER is parsed straight out of
/// the PEM block (so `GetRoot()` is byte-identical across restarts); a
/// second `Certificate` is reconstructed via `self_signed` purely so
/// `signed_by` has an issuer to sign leaves against (its signature bytes
/// may differ from the on-disk cert's — it is never exposed via `GetRoot`).
fn load(cert_path: &Path, key_path: &Path) -> Result<RootCa, ProxyError> {
    let cert_pem = fs::read_to_string(cert_path)
        .map_err(|e| ProxyError::ConfigInvalid(format!("reading {}: {e}", cert_path.display())))?;
    let key_pem = fs::read_to_string(key_path)
        .map_err(|e| ProxyError::ConfigInvalid(format!("reading {}: {e}", key_path.display())))?;

    let mut cert_reader = cert_pem.as_bytes();
    let mut ders = rustls_pemfile::certs(&mut cert_reader);
    let cert_der = ders
        .next()
        .ok_or_else(|| ProxyError::ConfigInvalid(format!("{} has no CERTIFICATE block", cert_path.display())))?
        .map_err(|e| ProxyError::ConfigInvalid(format!("parsing {}: {e}", cert_path.display())))?
        .into_owned();

    let key_pair = KeyPair::from_pem(&key_pem)
        .map_err(|e| ProxyError::ConfigInvalid(format!("parsing {}: {e}", key_path.display())))?;

    let params = CertificateParams::from_ca_cert_pem(&cert_pem)
        .map_err(|e| ProxyError::ConfigInvalid(format!("parsing {}: {e}", cert_path.display())))?;
    let issuer = params.self_signed(&key_pair).map_err(|e| {
        ProxyError::ConfigInvalid(format!("cert/key mismatch in {}: {e}", cert_path.display()))
    })?;

    Ok(RootCa {
        key_pair,
        issuer,
        cert_der,
    })
}

fn persist(root: &RootCa, cert_path: &Path, key_path: &Path) -> Result<(), ProxyError> {
    let cert_pem = root.issuer.pem();
    let key_pem = root.key_pair.serialize_pem();

    write_atomic_0600(cert_path, cert_pem.as_bytes())?;
    write_atomic_0600(key_path, key_pem.as_bytes())?;
    Ok(())
}

fn write_atomic_0600(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)?;
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        let unique: u64 = rand::random();
        dir.push(format!("sniffy-ca-test-{unique}"));
        dir
    }

    #[test]
    fn resolve_store_path_empty_uses_home() {
        let path = resolve_store_path("").unwrap();
        assert!(path.ends_with(".sniffy"));
    }

    #[test]
    fn persistence_round_trip_preserves_der() {
        let dir = tempdir();
        let root1 = load_or_create(&dir).unwrap();
        let root2 = load_or_create(&dir).unwrap();
        assert_eq!(root1.cert_der.as_ref(), root2.cert_der.as_ref());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn corrupt_cert_file_fails_fast() {
        let dir = tempdir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CERT_FILE), b"not a pem file at all").unwrap();
        std::fs::write(dir.join(KEY_FILE), b"also garbage").unwrap();
        let result = load_or_create(&dir);
        assert!(result.is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn one_file_missing_is_config_invalid() {
        let dir = tempdir();
        std::fs::create_dir_all(&dir).unwrap();
        let root = generate_in_memory().unwrap();
        std::fs::write(dir.join(CERT_FILE), root.issuer.pem()).unwrap();
        let result = load_or_create(&dir);
        assert!(matches!(result, Err(ProxyError::ConfigInvalid(_))));
        std::fs::remove_dir_all(&dir).ok();
    }
}
