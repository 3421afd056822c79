//! Telemetry: Prometheus metrics and credential fingerprints for logs.

pub mod metrics;

pub use metrics::GatewayMetrics;

use sha2::{Digest, Sha256};

/// Short, stable, non-reversible identifier for a credential.
///
/// Logs carry this instead of the credential itself so that repeated
/// failures from one client can still be correlated.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest
        .iter()
        .take(6)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_short_and_stable() {
        let a = fingerprint("tok-1");
        assert_eq!(a.len(), 12);
        assert_eq!(a, fingerprint("tok-1"));
        assert_ne!(a, fingerprint("tok-2"));
        assert!(!a.contains("tok"));
    }

    #[test]
    fn test_fingerprint_known_value() {
        // sha256("abc") = ba7816bf8f01cfea...
        assert_eq!(fingerprint("abc"), "ba7816bf8f01");
    }
}
