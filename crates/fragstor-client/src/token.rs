//! Auth token seam.
//!
//! The token issuer itself is an external collaborator; the client only needs
//! a way to map a namespace to its served label and to fetch a fresh bearer
//! token per call. A failing provider fails the call locally, before any
//! frame is written.

use crate::error::Result;

/// Supplies per-call bearer tokens and the namespace-to-label mapping.
pub trait TokenProvider: Send + Sync {
    /// The label the shard is expected to serve for this namespace.
    fn label_for(&self, namespace: &str) -> Result<String>;

    /// A fresh bearer token authorizing operations on the namespace.
    fn token_for(&self, namespace: &str) -> Result<String>;
}

/// A provider handing out one fixed token; the label equals the namespace.
///
/// Useful for tests and for deployments with long-lived tokens.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Create a provider that always returns `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn label_for(&self, namespace: &str) -> Result<String> {
        Ok(namespace.to_string())
    }

    fn token_for(&self, _namespace: &str) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_provider() {
        let provider = StaticTokenProvider::new("secret");
        assert_eq!(provider.label_for("ns").unwrap(), "ns");
        assert_eq!(provider.token_for("ns").unwrap(), "secret");
    }
}
