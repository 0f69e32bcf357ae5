//! Server policy state delivered by the control plane on every heartbeat.
//!
//! `Policy` is an immutable snapshot; the live policy is held behind an
//! `ArcSwap` pointer swap (the same atomic-cell idiom the spec's design notes
//! call out, and the one already used internally by the teacher framework's
//! router and state modules via `arc-swap`/`dashmap`). Readers take a
//! snapshot once per request and use it throughout, so a request never
//! observes a torn mix of old and new policy fields.

use arc_swap::ArcSwap;

/// A single heartbeat's worth of server-controlled operating state.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Current upstream base URL cache misses are fetched from.
    pub origin_url: String,
    /// 32-byte symmetric key used to open sealed access tokens.
    pub token_key: [u8; 32],
    /// When true, token verification is skipped regardless of local config.
    pub disable_tokens: bool,
    /// PEM-encoded certificate chain, installed into the certificate holder.
    pub tls_cert: String,
    /// PEM-encoded private key, installed into the certificate holder.
    pub tls_key: String,
    /// Hostname parsed from the node's announced URL; used for SNI/Host gating.
    pub canonical_hostname: String,
    /// Whether the control plane has marked this node compromised.
    pub compromised: bool,
    /// Whether the control plane has paused this node.
    pub paused: bool,
    /// Latest client build number the control plane is aware of.
    pub latest_build: i64,
}

/// An atomically-swappable cell holding the current `Policy`.
///
/// `None` before the first successful heartbeat; the control client treats an
/// unreachable control plane at startup as fatal, so by the time request
/// handling begins the cell always holds `Some`.
pub type PolicyCell = ArcSwap<Option<Policy>>;

/// Builds a fresh, empty policy cell.
pub fn new_cell() -> PolicyCell {
    ArcSwap::new(std::sync::Arc::new(None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn swap_is_visible_immediately() {
        let cell = new_cell();
        assert!(cell.load().is_none());

        let policy = Policy {
            origin_url: "https://origin.example".into(),
            token_key: [7u8; 32],
            disable_tokens: false,
            tls_cert: String::new(),
            tls_key: String::new(),
            canonical_hostname: "node.example".into(),
            compromised: false,
            paused: false,
            latest_build: 42,
        };
        cell.store(Arc::new(Some(policy)));

        let loaded = cell.load();
        let loaded = loaded.as_ref().as_ref().unwrap();
        assert_eq!(loaded.origin_url, "https://origin.example");
        assert_eq!(loaded.latest_build, 42);
    }
}
