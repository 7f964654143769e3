//! Certificate Authority: root CA lifecycle, leaf issuance and caching
//! (spec.md §4.1).

pub mod cache;
pub mod leaf;
pub mod store;

use std::sync::Arc;

use rustls_pki_types::CertificateDer;
use tracing::error;

use crate::ca::cache::LeafCache;
use crate::ca::store::RootCa;
use crate::error::ProxyError;

/// The certificate authority: holds the in-memory root and the leaf cache.
/// Constructed once per process and shared read-only thereafter (spec.md §5
/// "Root CA key: read-only after initialization").
pub struct CertificateAuthority {
    root: RootCa,
    cache: LeafCache,
}

impl CertificateAuthority {
    /// Persistent construction: loads or creates `sniffy-ca.crt`/`sniffy-ca.key`
    /// under `store_dir` (spec.md §4.1 "persistent").
    pub fn persistent(store_dir: &str) -> Result<Self, ProxyError> {
        let dir = store::resolve_store_path(store_dir).map_err(|e| {
            ProxyError::ConfigInvalid(format!("resolving CA store path {store_dir:?}: {e}"))
        })?;
        let root = store::load_or_create(&dir)?;
        Ok(Self {
            root,
            cache: LeafCache::default_capacity(),
        })
    }

    /// In-memory construction: a fresh CA that is never written to disk
    /// (spec.md §4.1 "in-memory only").
    pub fn in_memory() -> Result<Self, ProxyError> {
        let root = store::generate_in_memory()?;
        Ok(Self {
            root,
            cache: LeafCache::default_capacity(),
        })
    }

    /// Returns the in-memory root certificate's DER bytes.
    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root.cert_der
    }

    /// Issues (or returns the cached) leaf certificate for `host`, which may
    /// carry a port or IPv6 brackets (spec.md §4.1 `Issue(host)`).
    pub async fn issue(&self, host: &str) -> Result<Arc<cache::CachedLeaf>, ProxyError> {
        let normalized = leaf::normalize_host_checked(host)?;
        let key = normalized.clone();
        let root = &self.root;
        self.cache
            .get_or_issue(&key, move || leaf::issue(root, &normalized))
            .await
            .map_err(|e| {
                error!("certificate issuance failed for {host}: {e}");
                e
            })
    }
}

/// Builds the `rustls::ServerConfig` used to terminate a forged TLS
/// connection for a single host (spec.md §4.4.2 step 5 "offering `[leaf]`
/// as the certificate chain").
pub fn server_config_for_leaf(leaf: &cache::CachedLeaf) -> Result<rustls::ServerConfig, ProxyError> {
    use rustls::pki_types::PrivateKeyDer;

    let key = PrivateKeyDer::Pkcs8(leaf.key_der.as_ref().clone_key());
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(leaf.chain.clone(), key)
        .map_err(|e| ProxyError::TlsHandshakeFailed(format!("building server config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issue_is_idempotent_for_same_host_variants() {
        let ca = CertificateAuthority::in_memory().unwrap();
        let a = ca.issue("example.org").await.unwrap();
        let b = ca.issue("example.org:443").await.unwrap();
        let c = ca.issue("example.org:8080").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn issue_rejects_empty_host() {
        let ca = CertificateAuthority::in_memory().unwrap();
        let result = ca.issue("").await;
        assert!(matches!(result, Err(ProxyError::InvalidHost(_))));
    }

    #[tokio::test]
    async fn distinct_hosts_get_distinct_leaves() {
        let ca = CertificateAuthority::in_memory().unwrap();
        let a = ca.issue("a.test").await.unwrap();
        let b = ca.issue("b.test").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
