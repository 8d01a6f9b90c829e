//! Authenticated forwarding to self-hosted clusters.
//!
//! Clusters authenticate the router either by HMAC request signatures or by a
//! client certificate (mTLS). [`Forwarder`] holds the per-cluster credentials
//! and streams responses back untouched; [`hmac`] holds the signing scheme and
//! the matching verification middleware for receiving services.

mod forwarder;
pub mod hmac;

pub use forwarder::{Forwarder, FORWARD_TIMEOUT};
pub use hmac::{require_hmac, secrets_match, verify_signature};
