//! Error taxonomy for the proxy core (spec.md §7).
//!
//! Per-connection errors are logged and terminate only the connection they
//! occurred on; startup errors (CA load, port bind) abort the process. See
//! each variant's doc comment for which bucket it falls in.

use thiserror::Error;

/// The unified error type returned by every fallible operation in the core.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A read/write/listener/file I/O failure. Closes the affected connection only.
    #[error("io fault: {0}")]
    IoFault(#[from] std::io::Error),

    /// Unparseable HTTP. Connection is closed with no reply.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// A forged server-side TLS handshake failed. The root CA remains usable.
    #[error("tls handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// Key generation or signing failed inside `Issue`. Cache is not updated.
    #[error("certificate issuance failed: {0}")]
    CertIssuanceFailed(String),

    /// The shared upstream client returned an error; caller replies 502.
    #[error("upstream request failed: {0}")]
    UpstreamFailed(String),

    /// A hook error or recovered panic. Logged; the pipeline continues.
    #[error("plugin fault in '{plugin}': {message}")]
    PluginFault { plugin: String, message: String },

    /// Missing or corrupt CA files, or plugin JSON failing schema. Fatal at
    /// the owning component's startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A hostname could not be normalized into anything usable as a subject.
    #[error("invalid host: {0}")]
    InvalidHost(String),

    /// The requested resource timed out.
    #[error("timed out: {0}")]
    Timeout(String),
}

/// Not itself an error (spec.md §7: "treated as the plugin's decision, not
/// an error") but threaded through `InterceptResult` to short-circuit a
/// pipeline. Kept here for discoverability alongside `ProxyError`.
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_fault_converts_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: ProxyError = io_err.into();
        assert!(matches!(err, ProxyError::IoFault(_)));
    }

    #[test]
    fn display_messages_are_stable() {
        let err = ProxyError::InvalidHost("".to_string());
        assert_eq!(err.to_string(), "invalid host: ");
    }
}
