//! Node identities within the mesh.
//!
//! A relay is addressed by its cluster id, which is derived from the address
//! its socket is bound to. Pure clients get a generated identity that is
//! unique per process and per socket created in that process.

use std::sync::atomic::{AtomicU64, Ordering};

static CLIENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Derive a relay's cluster id from the host it advertises and its bound port.
pub fn cluster_id_for(advertise_host: &str, port: u16) -> String {
    format!("{advertise_host}:{port}")
}

/// Generate an identity for a client socket of `cluster_id`.
pub fn generate_client_identity(cluster_id: &str) -> String {
    let n = CLIENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{cluster_id}/{}-{n}", std::process::id())
}

/// Whether an identity would be read as a broadcast routing marker, which
/// rules it out as a node identity.
pub fn is_wildcard(identity: &str) -> bool {
    identity.starts_with('*')
}
