//! Deterministic host port assignment
//!
//! `port = base + (sha256(api_id) mod range)`, with the digest read as one
//! big-endian integer. Collisions fall back to a stride through the same
//! range rather than a reservation table.

use sha2::{Digest, Sha256};
use tokio::net::TcpListener;

/// Stride between fallback candidates; prime, so it walks the whole range
const FALLBACK_STRIDE: u32 = 7919;

/// Offset of the derived port within `range`
pub fn port_offset(api_id: &str, range: u16) -> u16 {
    let range = u32::from(range.max(1));
    let digest = Sha256::digest(api_id.as_bytes());

    digest
        .iter()
        .fold(0u32, |acc, byte| (acc * 256 + u32::from(*byte)) % range) as u16
}

/// The deterministic port for an API
pub fn derive_port(api_id: &str, base: u16, range: u16) -> u16 {
    candidate_port(api_id, base, range, 0)
}

/// The `attempt`-th candidate port; attempt 0 is the derived port
pub fn candidate_port(api_id: &str, base: u16, range: u16, attempt: u32) -> u16 {
    let range32 = u32::from(range.max(1));
    let offset = u32::from(port_offset(api_id, range));
    let shifted = (offset + attempt.wrapping_mul(FALLBACK_STRIDE) % range32) % range32;

    base.saturating_add(shifted as u16)
}

/// Whether nothing is currently listening on `port`
pub async fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).await.is_ok()
}
